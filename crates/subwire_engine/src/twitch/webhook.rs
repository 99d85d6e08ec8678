#![forbid(unsafe_code)]

//! EventSub webhook transport. Serving HTTP is left to the embedding
//! application: it hands each request's headers and body to
//! [`WebhookHandler::handle`] and writes back the [`WebhookResponse`].

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subwire_domain::{MessageId, RemoteRegistrationId};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::eventsub::{EventSubNotificationPayload, parse_message_timestamp_system_time};
use crate::SecretString;
use crate::api::{ApiError, RegistrationStatus, RemoteRegistrationSnapshot, TransportOptions, TransportProvider};
use crate::coordinator::{LifecycleCoordinator, NotificationOutcome};
use crate::subscription::Subscription;

pub const HEADER_MESSAGE_ID: &str = "Twitch-Eventsub-Message-Id";
pub const HEADER_MESSAGE_TIMESTAMP: &str = "Twitch-Eventsub-Message-Timestamp";
pub const HEADER_MESSAGE_SIGNATURE: &str = "Twitch-Eventsub-Message-Signature";
pub const HEADER_MESSAGE_TYPE: &str = "Twitch-Eventsub-Message-Type";

/// Deliveries older than this are rejected as replays.
pub const MAX_MESSAGE_AGE: Duration = Duration::from_secs(10 * 60);

const SIGNATURE_PREFIX: &str = "sha256=";

/// [`TransportProvider`] for webhook registrations. Each subscription gets its
/// own callback under `callback_base`.
#[derive(Debug, Clone)]
pub struct WebhookTransport {
	callback_base: Url,
	secret: SecretString,
}

impl WebhookTransport {
	pub fn new(callback_base: Url, secret: SecretString) -> Self {
		Self { callback_base, secret }
	}

	pub fn callback_for(&self, subscription: &Subscription) -> String {
		format!(
			"{}/{}",
			self.callback_base.as_str().trim_end_matches('/'),
			urlencoding::encode(subscription.identity().as_str())
		)
	}
}

#[async_trait]
impl TransportProvider for WebhookTransport {
	async fn transport_options(&self, subscription: &Subscription) -> Result<TransportOptions, ApiError> {
		Ok(TransportOptions::Webhook {
			callback: self.callback_for(subscription),
			secret: self.secret.clone(),
		})
	}

	fn accepts_existing(&self, snapshot: &RemoteRegistrationSnapshot) -> bool {
		let base = self.callback_base.as_str().trim_end_matches('/');
		snapshot.transport.method == "webhook"
			&& snapshot
				.transport
				.callback
				.as_deref()
				.and_then(|cb| cb.strip_prefix(base))
				.is_some_and(|rest| rest.starts_with('/'))
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
	#[error("missing header {0}")]
	MissingHeader(&'static str),

	#[error("invalid signature")]
	InvalidSignature,

	#[error("invalid timestamp: {0}")]
	InvalidTimestamp(String),

	#[error("message too old: {0:?}")]
	Stale(Duration),

	#[error("invalid payload: {0}")]
	InvalidPayload(String),
}

impl WebhookError {
	/// HTTP status to answer with.
	pub fn status_code(&self) -> u16 {
		match self {
			Self::MissingHeader(_) | Self::InvalidTimestamp(_) | Self::InvalidPayload(_) => 400,
			Self::InvalidSignature | Self::Stale(_) => 403,
		}
	}
}

/// One received webhook request.
#[derive(Debug, Clone, Default)]
pub struct WebhookDelivery {
	pub message_id: Option<String>,
	pub timestamp: Option<String>,
	pub signature: Option<String>,
	pub message_type: Option<String>,
	pub body: Vec<u8>,
}

impl WebhookDelivery {
	/// Pick the EventSub headers out of `headers`, matching names case-insensitively.
	pub fn from_headers<'a, I>(headers: I, body: impl Into<Vec<u8>>) -> Self
	where
		I: IntoIterator<Item = (&'a str, &'a str)>,
	{
		let mut delivery = Self {
			body: body.into(),
			..Self::default()
		};
		for (name, value) in headers {
			let slot = if name.eq_ignore_ascii_case(HEADER_MESSAGE_ID) {
				&mut delivery.message_id
			} else if name.eq_ignore_ascii_case(HEADER_MESSAGE_TIMESTAMP) {
				&mut delivery.timestamp
			} else if name.eq_ignore_ascii_case(HEADER_MESSAGE_SIGNATURE) {
				&mut delivery.signature
			} else if name.eq_ignore_ascii_case(HEADER_MESSAGE_TYPE) {
				&mut delivery.message_type
			} else {
				continue;
			};
			*slot = Some(value.trim().to_string());
		}
		delivery
	}
}

/// What to answer the upstream with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookResponse {
	/// 200 with the challenge as a `text/plain` body.
	Challenge(String),
	/// 204.
	Accepted,
	/// 204; an unknown message type.
	Ignored,
}

impl WebhookResponse {
	pub fn status_code(&self) -> u16 {
		match self {
			Self::Challenge(_) => 200,
			Self::Accepted | Self::Ignored => 204,
		}
	}
}

#[derive(Debug, Clone)]
pub struct WebhookHandler {
	coordinator: LifecycleCoordinator,
	secret: SecretString,
	max_age: Duration,
}

impl WebhookHandler {
	pub fn new(coordinator: LifecycleCoordinator, secret: SecretString) -> Self {
		Self {
			coordinator,
			secret,
			max_age: MAX_MESSAGE_AGE,
		}
	}

	pub fn handle(&self, delivery: &WebhookDelivery) -> Result<WebhookResponse, WebhookError> {
		self.handle_at(delivery, SystemTime::now())
	}

	pub(crate) fn handle_at(&self, delivery: &WebhookDelivery, now: SystemTime) -> Result<WebhookResponse, WebhookError> {
		metrics::counter!("subwire_webhook_requests_total").increment(1);
		let result = self.verify(delivery, now).and_then(|message_id| self.dispatch(delivery, message_id));
		if let Err(e) = &result {
			warn!(error = %e, "rejected webhook delivery");
			metrics::counter!("subwire_webhook_rejected_total").increment(1);
		}
		result
	}

	fn verify(&self, delivery: &WebhookDelivery, now: SystemTime) -> Result<MessageId, WebhookError> {
		let message_id = delivery
			.message_id
			.as_deref()
			.ok_or(WebhookError::MissingHeader(HEADER_MESSAGE_ID))?;
		let timestamp = delivery
			.timestamp
			.as_deref()
			.ok_or(WebhookError::MissingHeader(HEADER_MESSAGE_TIMESTAMP))?;
		let signature = delivery
			.signature
			.as_deref()
			.ok_or(WebhookError::MissingHeader(HEADER_MESSAGE_SIGNATURE))?;

		let expected = signature
			.strip_prefix(SIGNATURE_PREFIX)
			.and_then(|hex_sig| hex::decode(hex_sig).ok())
			.ok_or(WebhookError::InvalidSignature)?;
		let mut mac =
			Hmac::<Sha256>::new_from_slice(self.secret.expose().as_bytes()).map_err(|_| WebhookError::InvalidSignature)?;
		mac.update(message_id.as_bytes());
		mac.update(timestamp.as_bytes());
		mac.update(&delivery.body);
		mac.verify_slice(&expected).map_err(|_| WebhookError::InvalidSignature)?;

		let sent_at =
			parse_message_timestamp_system_time(timestamp).map_err(|e| WebhookError::InvalidTimestamp(e.to_string()))?;
		if let Ok(age) = now.duration_since(sent_at)
			&& age > self.max_age
		{
			return Err(WebhookError::Stale(age));
		}

		MessageId::new(message_id).map_err(|e| WebhookError::InvalidPayload(e.to_string()))
	}

	fn dispatch(&self, delivery: &WebhookDelivery, message_id: MessageId) -> Result<WebhookResponse, WebhookError> {
		let message_type = delivery
			.message_type
			.as_deref()
			.ok_or(WebhookError::MissingHeader(HEADER_MESSAGE_TYPE))?;
		if !matches!(message_type, "webhook_callback_verification" | "notification" | "revocation") {
			debug!(message_type, "ignoring webhook message");
			return Ok(WebhookResponse::Ignored);
		}

		let payload: EventSubNotificationPayload =
			serde_json::from_slice(&delivery.body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
		let remote_id = RemoteRegistrationId::new(payload.subscription.id)
			.map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

		match message_type {
			"webhook_callback_verification" => {
				let challenge = payload
					.challenge
					.ok_or_else(|| WebhookError::InvalidPayload("verification without challenge".to_string()))?;
				self.coordinator.mark_verified(&remote_id);
				Ok(WebhookResponse::Challenge(challenge))
			}
			"notification" => {
				let event = payload.event.unwrap_or(serde_json::Value::Null);
				let outcome = self.coordinator.on_notification(&remote_id, message_id, event);
				debug!(kind = %payload.subscription.r#type, outcome = ?outcome, "webhook notification");
				if outcome == NotificationOutcome::Unrouted {
					metrics::counter!("subwire_webhook_unrouted_total").increment(1);
				}
				Ok(WebhookResponse::Accepted)
			}
			_ => {
				let status = RegistrationStatus::from(payload.subscription.status.as_str());
				self.coordinator.on_revocation(&remote_id, status);
				Ok(WebhookResponse::Accepted)
			}
		}
	}
}
