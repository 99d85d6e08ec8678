#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::eventsub::{self, EventSubFrame};
use crate::api::{ApiClient, ApiError, RemoteRegistrationSnapshot, TransportOptions, TransportProvider};
use crate::coordinator::LifecycleCoordinator;
use crate::subscription::Subscription;

pub const DEFAULT_EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type EventSubWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<EventSubWs>> + Send + Sync>;

/// [`TransportProvider`] for registrations delivered over the EventSub
/// WebSocket. Holds the id of the currently welcomed session.
#[derive(Debug, Default)]
pub struct WebSocketTransport {
	session_id: RwLock<Option<String>>,
}

impl WebSocketTransport {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn session_id(&self) -> Option<String> {
		self.session_id.read().clone()
	}

	pub(crate) fn set_session_id(&self, session_id: Option<String>) {
		*self.session_id.write() = session_id;
	}
}

#[async_trait]
impl TransportProvider for WebSocketTransport {
	async fn transport_options(&self, _subscription: &Subscription) -> Result<TransportOptions, ApiError> {
		match self.session_id() {
			Some(session_id) => Ok(TransportOptions::WebSocket { session_id }),
			None => Err(ApiError::Transport("no eventsub websocket session".to_string())),
		}
	}

	/// Only registrations bound to the live session can be adopted.
	fn accepts_existing(&self, snapshot: &RemoteRegistrationSnapshot) -> bool {
		let current = self.session_id.read();
		snapshot.transport.method == "websocket"
			&& current.is_some()
			&& snapshot.transport.session_id.as_deref() == current.as_deref()
	}
}

#[derive(Clone)]
pub struct EventSubSessionConfig {
	pub ws_url: String,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// Used when the welcome omits `keepalive_timeout_seconds`.
	pub default_keepalive: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl Default for EventSubSessionConfig {
	fn default() -> Self {
		Self {
			ws_url: DEFAULT_EVENTSUB_WS_URL.to_string(),
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			default_keepalive: Duration::from_secs(10),
			ws_connector: None,
		}
	}
}

impl std::fmt::Debug for EventSubSessionConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventSubSessionConfig")
			.field("ws_url", &self.ws_url)
			.field("reconnect_min_delay", &self.reconnect_min_delay)
			.field("reconnect_max_delay", &self.reconnect_max_delay)
			.field("default_keepalive", &self.default_keepalive)
			.field("ws_connector", &self.ws_connector.is_some())
			.finish()
	}
}

/// Keeps one EventSub WebSocket session alive and feeds it into a coordinator.
///
/// Every `session_welcome` on a fresh connection resets active subscriptions,
/// lists the remote registrations and reconciles before any further frame is
/// read. `session_reconnect` migrates to the new socket without reconciling,
/// since registrations carry over.
pub struct EventSubSession {
	cfg: EventSubSessionConfig,
	coordinator: LifecycleCoordinator,
	api: Arc<dyn ApiClient>,
	transport: Arc<WebSocketTransport>,
	connected: watch::Sender<bool>,
}

impl EventSubSession {
	pub fn new(
		cfg: EventSubSessionConfig,
		coordinator: LifecycleCoordinator,
		api: Arc<dyn ApiClient>,
		transport: Arc<WebSocketTransport>,
	) -> Self {
		let (connected, _) = watch::channel(false);
		Self {
			cfg,
			coordinator,
			api,
			transport,
			connected,
		}
	}

	/// `true` while a welcomed session is open.
	pub fn connected(&self) -> watch::Receiver<bool> {
		self.connected.subscribe()
	}

	fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
		let pow = attempt.min(16);
		let ms = min.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(max).max(min)
	}

	async fn connect_eventsub_ws(url: Url) -> anyhow::Result<EventSubWs> {
		let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.context("connect_async to eventsub ws")?;
		Ok(ws)
	}

	async fn connect_ws(&self, url: Url) -> anyhow::Result<EventSubWs> {
		match &self.cfg.ws_connector {
			Some(connector) => connector(url).await,
			None => Self::connect_eventsub_ws(url).await,
		}
	}

	async fn read_until_welcome(ws: &mut EventSubWs) -> anyhow::Result<(String, Option<Duration>)> {
		loop {
			let Some(msg) = ws.next().await else {
				anyhow::bail!("ws closed before welcome");
			};
			let msg = msg.context("ws read")?;

			match msg {
				Message::Text(t) => {
					if let EventSubFrame::Welcome {
						session_id,
						keepalive_timeout,
					} = eventsub::parse_frame(&t)?
					{
						return Ok((session_id, keepalive_timeout));
					}
				}
				Message::Ping(p) => {
					let _ = ws.send(Message::Pong(p)).await;
				}
				Message::Close(c) => {
					anyhow::bail!("ws closed before welcome: close={c:?}");
				}
				_ => {}
			}
		}
	}

	/// Re-arm subscriptions for a freshly welcomed session.
	pub(crate) async fn on_welcome(&self, session_id: &str) -> usize {
		self.transport.set_session_id(Some(session_id.to_string()));
		self.coordinator.on_transport_disconnected();

		let snapshots = match self.api.list_registrations().await {
			Ok(s) => s,
			Err(e) => {
				warn!(error = %e, "listing registrations failed; creating fresh ones");
				Vec::new()
			}
		};
		self.coordinator.reconcile(&snapshots).await
	}

	/// Route one frame. Returns the URL to migrate to on `session_reconnect`.
	pub(crate) fn on_frame(&self, frame: EventSubFrame) -> Option<String> {
		match frame {
			EventSubFrame::Notification {
				message_id,
				remote_id,
				kind,
				event,
				..
			} => {
				let outcome = self.coordinator.on_notification(&remote_id, message_id, event);
				debug!(kind = %kind, outcome = ?outcome, "eventsub notification");
				None
			}
			EventSubFrame::Revocation { remote_id, status } => {
				self.coordinator.on_revocation(&remote_id, status);
				None
			}
			EventSubFrame::Reconnect { reconnect_url, .. } => Some(reconnect_url),
			EventSubFrame::Keepalive => {
				debug!("eventsub keepalive");
				None
			}
			EventSubFrame::Welcome { session_id, .. } => {
				debug!(session_id = %session_id, "unexpected session_welcome on open session");
				None
			}
			EventSubFrame::Unknown { message_type } => {
				debug!(message_type = %message_type, "ignoring eventsub message");
				None
			}
		}
	}

	/// Connect to `reconnect_url` and wait for its welcome while still serving
	/// the old socket, which keeps delivering until then.
	async fn migrate(&self, old: &mut EventSubWs, reconnect_url: &str) -> anyhow::Result<(EventSubWs, String, Option<Duration>)> {
		let url = Url::parse(reconnect_url).with_context(|| format!("invalid reconnect_url: {reconnect_url}"))?;
		let mut ws2 = self.connect_ws(url).await.context("connect to reconnect_url")?;
		let mut old_open = true;

		loop {
			tokio::select! {
				msg = ws2.next() => {
					let msg = msg.context("reconnect socket closed before welcome")?.context("reconnect ws read")?;
					match msg {
						Message::Text(t) => match eventsub::parse_frame(&t)? {
							EventSubFrame::Welcome { session_id, keepalive_timeout } => {
								return Ok((ws2, session_id, keepalive_timeout));
							}
							frame => {
								self.on_frame(frame);
							}
						},
						Message::Ping(p) => {
							let _ = ws2.send(Message::Pong(p)).await;
						}
						Message::Close(c) => {
							anyhow::bail!("reconnect socket closed before welcome: close={c:?}");
						}
						_ => {}
					}
				}

				msg = old.next(), if old_open => {
					match msg {
						Some(Ok(Message::Text(t))) => match eventsub::parse_frame(&t) {
							Ok(frame) => {
								self.on_frame(frame);
							}
							Err(e) => warn!(error = %e, "failed to parse eventsub frame"),
						},
						Some(Ok(Message::Ping(p))) => {
							let _ = old.send(Message::Pong(p)).await;
						}
						Some(Ok(_)) => {}
						Some(Err(_)) | None => old_open = false,
					}
				}
			}
		}
	}

	/// Run until `shutdown` resolves, reconnecting with exponential backoff.
	pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
	where
		F: Future<Output = ()> + Send,
	{
		tokio::pin!(shutdown);
		let ws_url = Url::parse(&self.cfg.ws_url).with_context(|| format!("invalid eventsub ws url: {}", self.cfg.ws_url))?;
		let mut reconnect_attempt: u32 = 0;

		'outer: loop {
			if reconnect_attempt > 0 {
				let delay = Self::backoff_delay(reconnect_attempt, self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay);
				info!(delay_ms = delay.as_millis() as u64, attempt = reconnect_attempt, "reconnecting eventsub");
				tokio::select! {
					_ = &mut shutdown => break 'outer,
					_ = sleep(delay) => {}
				}
			}

			let connected = tokio::select! {
				_ = &mut shutdown => break 'outer,
				r = async {
					let mut ws = self.connect_ws(ws_url.clone()).await?;
					let welcome = Self::read_until_welcome(&mut ws).await?;
					anyhow::Ok((ws, welcome))
				} => r,
			};
			let (mut ws, (mut session_id, keepalive)) = match connected {
				Ok(v) => v,
				Err(e) => {
					warn!(error = %e, "eventsub connect failed");
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					continue;
				}
			};

			reconnect_attempt = 0;
			let mut keepalive_timeout = keepalive.unwrap_or(self.cfg.default_keepalive);
			info!(session_id = %session_id, keepalive_secs = keepalive_timeout.as_secs(), "eventsub connected");

			let started = self.on_welcome(&session_id).await;
			debug!(count = started, "subscriptions reconciled");
			self.connected.send_replace(true);

			let mut last_activity = Instant::now();

			loop {
				tokio::select! {
					_ = &mut shutdown => {
						let _ = ws.close(None).await;
						break 'outer;
					}

					msg = ws.next() => {
						let Some(msg) = msg else {
							warn!("eventsub ws ended");
							break;
						};
						let msg = match msg {
							Ok(m) => m,
							Err(e) => {
								warn!(error = %e, "eventsub ws read error");
								break;
							}
						};

						match msg {
							Message::Text(t) => {
								last_activity = Instant::now();
								let frame = match eventsub::parse_frame(&t) {
									Ok(f) => f,
									Err(e) => {
										warn!(error = %e, "failed to parse eventsub frame");
										continue;
									}
								};

								let Some(reconnect_url) = self.on_frame(frame) else {
									continue;
								};
								info!("received session_reconnect; migrating");
								match self.migrate(&mut ws, &reconnect_url).await {
									Ok((new_ws, new_session_id, new_keepalive)) => {
										let _ = ws.close(None).await;
										ws = new_ws;
										session_id = new_session_id;
										self.transport.set_session_id(Some(session_id.clone()));
										if let Some(k) = new_keepalive {
											keepalive_timeout = k;
										}
										last_activity = Instant::now();
										info!(session_id = %session_id, "eventsub migrated");
									}
									Err(e) => {
										warn!(error = %e, "eventsub migration failed");
										break;
									}
								}
							}

							Message::Ping(p) => {
								last_activity = Instant::now();
								let _ = ws.send(Message::Pong(p)).await;
							}

							Message::Pong(_) => {
								last_activity = Instant::now();
							}

							Message::Close(frame) => {
								info!(frame = ?frame, "eventsub ws closed");
								break;
							}

							_ => {}
						}
					}

					_ = sleep(keepalive_timeout) => {
						if last_activity.elapsed() > keepalive_timeout {
							warn!("keepalive watchdog triggered; reconnecting");
							break;
						}
					}
				}
			}

			self.connected.send_replace(false);
			self.transport.set_session_id(None);
			reconnect_attempt = reconnect_attempt.saturating_add(1);
		}

		self.connected.send_replace(false);
		info!("eventsub session stopped");
		Ok(())
	}
}
