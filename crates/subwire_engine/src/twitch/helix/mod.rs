#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use subwire_domain::{RemoteRegistrationId, SubscriptionKind, UserId};
use tracing::debug;
use url::Url;

use crate::SecretString;
use crate::api::{
	ApiClient, ApiError, RegistrationRequest, RegistrationStatus, RemoteRegistration, RemoteRegistrationSnapshot,
	TransportOptions, TransportSnapshot,
};

pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

/// One retry on 429 (honouring the rate-limit headers) or 5xx.
async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> Result<reqwest::Response, ApiError> {
	let retry_builder = req.try_clone();
	let resp = req
		.send()
		.await
		.map_err(|e| ApiError::Transport(format!("helix {label} send: {e}")))?;
	let status = resp.status();

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		debug!(label, delay_ms = delay.as_millis() as u64, "helix rate limited, retrying");
		tokio::time::sleep(delay).await;
		return retry
			.send()
			.await
			.map_err(|e| ApiError::Transport(format!("helix {label} retry send: {e}")));
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		return retry
			.send()
			.await
			.map_err(|e| ApiError::Transport(format!("helix {label} retry send: {e}")));
	}

	Ok(resp)
}

/// Map a non-success Helix status onto the engine's error taxonomy.
pub(crate) fn api_error_for_status(status: StatusCode, label: &str, body: &str) -> ApiError {
	let msg = format!("helix {label}: status={status} body={body}");
	match status {
		StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Authorization(msg),
		StatusCode::CONFLICT => ApiError::Conflict(msg),
		StatusCode::NOT_FOUND => ApiError::NotFound(msg),
		_ => ApiError::Transport(msg),
	}
}

async fn read_body(resp: reqwest::Response, label: &str) -> Result<(StatusCode, String), ApiError> {
	let status = resp.status();
	let body = resp
		.text()
		.await
		.map_err(|e| ApiError::Transport(format!("helix {label} read body: {e}")))?;
	Ok((status, body))
}

/// Helix-backed [`ApiClient`].
///
/// Registrations whose request carries an auth context use that user's token
/// when one was registered with [`HelixClient::set_user_token`]; everything
/// else uses the default token.
#[derive(Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: SecretString,
	user_tokens: RwLock<HashMap<UserId, SecretString>>,
}

impl HelixClient {
	pub fn new(base_url: Url, client_id: String, bearer_token: SecretString) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("subwire/0.x (eventsub)")
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			client_id,
			bearer_token,
			user_tokens: RwLock::new(HashMap::new()),
		})
	}

	pub fn set_user_token(&self, user_id: UserId, token: SecretString) {
		self.user_tokens.write().insert(user_id, token);
	}

	fn token_for(&self, auth_context: Option<&UserId>) -> SecretString {
		auth_context
			.and_then(|user| self.user_tokens.read().get(user).cloned())
			.unwrap_or_else(|| self.bearer_token.clone())
	}

	fn authed(&self, req: reqwest::RequestBuilder, token: &SecretString) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", token.expose()))
	}

	fn url(&self, path_and_query: &str) -> Result<Url, ApiError> {
		self.base_url
			.join(path_and_query)
			.map_err(|e| ApiError::Transport(format!("join helix url: {e}")))
	}

	async fn list_page(&self, after: Option<&str>) -> Result<HelixListSubscriptionsResponse, ApiError> {
		let mut path = EVENTSUB_SUBSCRIPTIONS_PATH.to_string();
		if let Some(after) = after {
			path.push_str("?after=");
			path.push_str(&urlencoding::encode(after));
		}
		let url = self.url(&path)?;

		let label = "GET /helix/eventsub/subscriptions";
		let resp = send_with_retry(self.authed(self.http.get(url), &self.bearer_token), label).await?;
		let (status, body) = read_body(resp, label).await?;
		if !status.is_success() {
			return Err(api_error_for_status(status, label, &body));
		}

		serde_json::from_str(&body).map_err(|e| ApiError::InvalidResponse(format!("helix list subscriptions parse json: {e}")))
	}
}

#[async_trait]
impl ApiClient for HelixClient {
	async fn create_registration(&self, request: &RegistrationRequest) -> Result<RemoteRegistration, ApiError> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;
		let token = self.token_for(request.auth_context.as_ref());
		let body = HelixCreateSubscriptionRequest::from_request(request);

		let label = "POST /helix/eventsub/subscriptions";
		let resp = send_with_retry(self.authed(self.http.post(url), &token).json(&body), label).await?;
		let (status, body) = read_body(resp, label).await?;
		if !status.is_success() {
			return Err(api_error_for_status(status, label, &body));
		}

		let parsed: HelixCreateSubscriptionResponse = serde_json::from_str(&body)
			.map_err(|e| ApiError::InvalidResponse(format!("helix create subscription parse json: {e}")))?;
		let data = parsed
			.data
			.into_iter()
			.next()
			.ok_or_else(|| ApiError::InvalidResponse("helix create subscription returned empty data".to_string()))?;

		let id = RemoteRegistrationId::new(data.id)
			.map_err(|e| ApiError::InvalidResponse(format!("helix subscription id: {e}")))?;
		Ok(RemoteRegistration {
			id,
			status: RegistrationStatus::from(data.status.as_str()),
		})
	}

	async fn delete_registration(&self, remote_id: &RemoteRegistrationId) -> Result<(), ApiError> {
		let url = self.url(&format!(
			"{base}?id={}",
			urlencoding::encode(remote_id.as_str()),
			base = EVENTSUB_SUBSCRIPTIONS_PATH
		))?;

		let label = "DELETE /helix/eventsub/subscriptions";
		let resp = send_with_retry(self.authed(self.http.delete(url), &self.bearer_token), label).await?;
		let status = resp.status();
		if status == StatusCode::NO_CONTENT || status.is_success() {
			return Ok(());
		}

		let (status, body) = read_body(resp, label).await?;
		Err(api_error_for_status(status, label, &body))
	}

	async fn list_registrations(&self) -> Result<Vec<RemoteRegistrationSnapshot>, ApiError> {
		let mut out = Vec::new();
		let mut after: Option<String> = None;

		loop {
			let page = self.list_page(after.as_deref()).await?;
			out.extend(page.data.into_iter().filter_map(HelixSubscriptionData::into_snapshot));

			let next = page.pagination.and_then(|p| p.cursor).filter(|c| !c.is_empty());
			if next.is_none() {
				break;
			}
			after = next;
		}

		Ok(out)
	}
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a> {
	#[serde(rename = "type")]
	r#type: &'a str,
	version: &'a str,
	condition: &'a BTreeMap<String, String>,
	transport: HelixTransport<'a>,
}

impl<'a> HelixCreateSubscriptionRequest<'a> {
	fn from_request(request: &'a RegistrationRequest) -> Self {
		Self {
			r#type: request.kind.as_str(),
			version: &request.version,
			condition: &request.condition,
			transport: HelixTransport::from(&request.transport),
		}
	}
}

#[derive(Debug, Serialize)]
#[serde(tag = "method", rename_all = "lowercase")]
enum HelixTransport<'a> {
	Websocket { session_id: &'a str },
	Webhook { callback: &'a str, secret: &'a str },
}

impl<'a> From<&'a TransportOptions> for HelixTransport<'a> {
	fn from(options: &'a TransportOptions) -> Self {
		match options {
			TransportOptions::WebSocket { session_id } => Self::Websocket { session_id },
			TransportOptions::Webhook { callback, secret } => Self::Webhook {
				callback,
				secret: secret.expose(),
			},
		}
	}
}

#[derive(Debug, Deserialize)]
struct HelixCreateSubscriptionResponse {
	data: Vec<HelixSubscriptionData>,
}

#[derive(Debug, Deserialize)]
struct HelixListSubscriptionsResponse {
	data: Vec<HelixSubscriptionData>,
	#[serde(default)]
	pagination: Option<HelixPagination>,
}

#[derive(Debug, Deserialize)]
struct HelixPagination {
	#[serde(default)]
	cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixSubscriptionData {
	id: String,
	status: String,
	#[serde(rename = "type")]
	r#type: String,
	version: String,
	#[serde(default)]
	condition: serde_json::Map<String, serde_json::Value>,
	#[serde(default)]
	transport: Option<HelixTransportData>,
}

#[derive(Debug, Deserialize)]
struct HelixTransportData {
	method: String,
	#[serde(default)]
	session_id: Option<String>,
	#[serde(default)]
	callback: Option<String>,
}

impl HelixSubscriptionData {
	/// Entries with malformed ids or kinds are skipped.
	fn into_snapshot(self) -> Option<RemoteRegistrationSnapshot> {
		let remote_id = RemoteRegistrationId::new(self.id).ok()?;
		let kind = SubscriptionKind::new(self.r#type).ok()?;

		// Helix sends empty strings for unused condition fields.
		let condition = self
			.condition
			.into_iter()
			.filter_map(|(k, v)| match v {
				serde_json::Value::String(s) if !s.is_empty() => Some((k, s)),
				_ => None,
			})
			.collect();

		let transport = self
			.transport
			.map(|t| TransportSnapshot {
				method: t.method,
				session_id: t.session_id,
				callback: t.callback,
			})
			.unwrap_or_default();

		Some(RemoteRegistrationSnapshot {
			remote_id,
			kind,
			version: self.version,
			condition,
			status: RegistrationStatus::from(self.status.as_str()),
			transport,
		})
	}
}
