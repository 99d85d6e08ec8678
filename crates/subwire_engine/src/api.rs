#![forbid(unsafe_code)]

//! Contracts of the two collaborators the engine drives: the upstream
//! registration API and the transport that delivers notifications.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use subwire_domain::{RemoteRegistrationId, SubscriptionDescriptor, SubscriptionKind, UserId};
use thiserror::Error;

use crate::SecretString;
use crate::subscription::Subscription;

/// Failures reported by an [`ApiClient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
	/// The token lacks the scope or permission the registration needs.
	#[error("not authorized: {0}")]
	Authorization(String),

	/// An equivalent registration already exists in a broken state.
	#[error("conflicting registration: {0}")]
	Conflict(String),

	#[error("registration not found: {0}")]
	NotFound(String),

	/// Network or HTTP failure.
	#[error("transport error: {0}")]
	Transport(String),

	#[error("invalid response: {0}")]
	InvalidResponse(String),
}

/// Status of a remote registration as reported by the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegistrationStatus {
	Enabled,
	WebhookCallbackVerificationPending,
	WebhookCallbackVerificationFailed,
	NotificationFailuresExceeded,
	AuthorizationRevoked,
	ModeratorRemoved,
	UserRemoved,
	VersionRemoved,
	BetaMaintenance,
	WebsocketDisconnected,
	WebsocketFailedPingPong,
	WebsocketReceivedInboundTraffic,
	WebsocketConnectionUnused,
	WebsocketInternalError,
	WebsocketNetworkTimeout,
	WebsocketNetworkError,
	Other(String),
}

impl RegistrationStatus {
	pub fn as_str(&self) -> &str {
		match self {
			Self::Enabled => "enabled",
			Self::WebhookCallbackVerificationPending => "webhook_callback_verification_pending",
			Self::WebhookCallbackVerificationFailed => "webhook_callback_verification_failed",
			Self::NotificationFailuresExceeded => "notification_failures_exceeded",
			Self::AuthorizationRevoked => "authorization_revoked",
			Self::ModeratorRemoved => "moderator_removed",
			Self::UserRemoved => "user_removed",
			Self::VersionRemoved => "version_removed",
			Self::BetaMaintenance => "beta_maintenance",
			Self::WebsocketDisconnected => "websocket_disconnected",
			Self::WebsocketFailedPingPong => "websocket_failed_ping_pong",
			Self::WebsocketReceivedInboundTraffic => "websocket_received_inbound_traffic",
			Self::WebsocketConnectionUnused => "websocket_connection_unused",
			Self::WebsocketInternalError => "websocket_internal_error",
			Self::WebsocketNetworkTimeout => "websocket_network_timeout",
			Self::WebsocketNetworkError => "websocket_network_error",
			Self::Other(s) => s.as_str(),
		}
	}

	pub fn is_enabled(&self) -> bool {
		matches!(self, Self::Enabled)
	}

	pub fn is_verification_pending(&self) -> bool {
		matches!(self, Self::WebhookCallbackVerificationPending)
	}
}

impl From<&str> for RegistrationStatus {
	fn from(s: &str) -> Self {
		match s.trim() {
			"enabled" => Self::Enabled,
			"webhook_callback_verification_pending" => Self::WebhookCallbackVerificationPending,
			"webhook_callback_verification_failed" => Self::WebhookCallbackVerificationFailed,
			"notification_failures_exceeded" => Self::NotificationFailuresExceeded,
			"authorization_revoked" => Self::AuthorizationRevoked,
			"moderator_removed" => Self::ModeratorRemoved,
			"user_removed" => Self::UserRemoved,
			"version_removed" => Self::VersionRemoved,
			"beta_maintenance" => Self::BetaMaintenance,
			"websocket_disconnected" => Self::WebsocketDisconnected,
			"websocket_failed_ping_pong" => Self::WebsocketFailedPingPong,
			"websocket_received_inbound_traffic" => Self::WebsocketReceivedInboundTraffic,
			"websocket_connection_unused" => Self::WebsocketConnectionUnused,
			"websocket_internal_error" => Self::WebsocketInternalError,
			"websocket_network_timeout" => Self::WebsocketNetworkTimeout,
			"websocket_network_error" => Self::WebsocketNetworkError,
			other => Self::Other(other.to_string()),
		}
	}
}

impl fmt::Display for RegistrationStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Where the upstream should push notifications for a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOptions {
	WebSocket { session_id: String },
	Webhook { callback: String, secret: SecretString },
}

/// Transport fields echoed back by the upstream for an existing registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportSnapshot {
	pub method: String,
	pub session_id: Option<String>,
	pub callback: Option<String>,
}

/// Everything needed to create one remote registration.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
	pub kind: SubscriptionKind,
	pub version: String,
	pub condition: BTreeMap<String, String>,
	pub transport: TransportOptions,
	pub auth_context: Option<UserId>,
}

impl RegistrationRequest {
	pub fn new(descriptor: &SubscriptionDescriptor, transport: TransportOptions, auth_context: Option<UserId>) -> Self {
		Self {
			kind: descriptor.kind().clone(),
			version: descriptor.version().to_string(),
			condition: descriptor
				.parameters()
				.iter()
				.map(|(k, v)| (k.clone(), v.clone()))
				.collect(),
			transport,
			auth_context,
		}
	}
}

/// Upstream acknowledgement of a create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRegistration {
	pub id: RemoteRegistrationId,
	pub status: RegistrationStatus,
}

/// A registration the upstream already knows about, used by reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRegistrationSnapshot {
	pub remote_id: RemoteRegistrationId,
	pub kind: SubscriptionKind,
	pub version: String,
	pub condition: BTreeMap<String, String>,
	pub status: RegistrationStatus,
	pub transport: TransportSnapshot,
}

impl RemoteRegistrationSnapshot {
	/// Snapshot of a registration created for `descriptor`, e.g. restored from
	/// ids the application persisted itself.
	pub fn for_descriptor(
		descriptor: &SubscriptionDescriptor,
		remote_id: RemoteRegistrationId,
		status: RegistrationStatus,
	) -> Self {
		Self {
			remote_id,
			kind: descriptor.kind().clone(),
			version: descriptor.version().to_string(),
			condition: descriptor
				.parameters()
				.iter()
				.map(|(k, v)| (k.clone(), v.clone()))
				.collect(),
			status,
			transport: TransportSnapshot::default(),
		}
	}

	/// Same kind and exactly the descriptor's parameters: a condition with
	/// extra filters describes a narrower registration and does not match.
	pub fn matches(&self, descriptor: &SubscriptionDescriptor) -> bool {
		self.kind == *descriptor.kind()
			&& self.condition.len() == descriptor.parameters().len()
			&& descriptor
				.parameters()
				.iter()
				.all(|(k, v)| self.condition.get(k).is_some_and(|c| c == v))
	}
}

/// Upstream registration API.
#[async_trait]
pub trait ApiClient: Send + Sync + 'static {
	async fn create_registration(&self, request: &RegistrationRequest) -> Result<RemoteRegistration, ApiError>;

	async fn delete_registration(&self, remote_id: &RemoteRegistrationId) -> Result<(), ApiError>;

	async fn list_registrations(&self) -> Result<Vec<RemoteRegistrationSnapshot>, ApiError>;
}

/// Supplies transport parameters for new registrations.
#[async_trait]
pub trait TransportProvider: Send + Sync + 'static {
	async fn transport_options(&self, subscription: &Subscription) -> Result<TransportOptions, ApiError>;

	/// Whether an enabled registration can be adopted as-is on this transport.
	fn accepts_existing(&self, _snapshot: &RemoteRegistrationSnapshot) -> bool {
		true
	}
}

#[cfg(test)]
mod tests {
	use subwire_domain::SubscriptionKind;

	use super::*;

	fn descriptor() -> SubscriptionDescriptor {
		SubscriptionDescriptor::new(SubscriptionKind::new("channel.moderate").unwrap(), "2")
			.with_parameter("broadcaster_user_id", "100")
			.with_parameter("moderator_user_id", "200")
	}

	#[test]
	fn status_parses_known_and_unknown_values() {
		assert_eq!(RegistrationStatus::from("enabled"), RegistrationStatus::Enabled);
		assert!(RegistrationStatus::from("webhook_callback_verification_pending").is_verification_pending());
		assert_eq!(
			RegistrationStatus::from("something_new"),
			RegistrationStatus::Other("something_new".to_string())
		);
		assert_eq!(RegistrationStatus::AuthorizationRevoked.to_string(), "authorization_revoked");
	}

	#[test]
	fn snapshot_matches_on_kind_and_parameters() {
		let d = descriptor();
		let rid = RemoteRegistrationId::new("r1").unwrap();
		let snap = RemoteRegistrationSnapshot::for_descriptor(&d, rid, RegistrationStatus::Enabled);
		assert!(snap.matches(&d));

		let other = SubscriptionDescriptor::new(SubscriptionKind::new("channel.moderate").unwrap(), "2")
			.with_parameter("broadcaster_user_id", "100")
			.with_parameter("moderator_user_id", "201");
		assert!(!snap.matches(&other));

		let other_kind = SubscriptionDescriptor::new(SubscriptionKind::new("channel.ban").unwrap(), "1")
			.with_parameter("broadcaster_user_id", "100");
		assert!(!snap.matches(&other_kind));
	}

	#[test]
	fn snapshot_with_extra_condition_keys_does_not_match() {
		let d = SubscriptionDescriptor::new(SubscriptionKind::new("channel.raid").unwrap(), "1")
			.with_parameter("to_broadcaster_user_id", "100");
		let mut snap = RemoteRegistrationSnapshot::for_descriptor(
			&d,
			RemoteRegistrationId::new("r1").unwrap(),
			RegistrationStatus::Enabled,
		);
		snap.condition.insert("from_broadcaster_user_id".to_string(), "7".to_string());
		assert!(!snap.matches(&d));

		let wider = SubscriptionDescriptor::new(SubscriptionKind::new("channel.raid").unwrap(), "1");
		assert!(!snap.matches(&wider));
	}

	#[test]
	fn request_carries_descriptor_fields() {
		let req = RegistrationRequest::new(
			&descriptor(),
			TransportOptions::WebSocket {
				session_id: "s1".to_string(),
			},
			None,
		);
		assert_eq!(req.kind.as_str(), "channel.moderate");
		assert_eq!(req.version, "2");
		assert_eq!(req.condition.get("moderator_user_id").map(String::as_str), Some("200"));
	}
}
