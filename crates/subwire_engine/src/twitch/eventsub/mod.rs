#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime};

use anyhow::Context;
use serde::Deserialize;
use subwire_domain::{MessageId, RemoteRegistrationId};

use crate::api::RegistrationStatus;

/// EventSub metadata (present on all WebSocket messages).
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadata {
	pub(crate) message_id: String,
	pub(crate) message_type: String,
	pub(crate) message_timestamp: String,

	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventSubMessage {
	metadata: EventSubMetadata,
	#[serde(default)]
	payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct EventSubSessionPayload {
	session: EventSubSession,
}

#[derive(Debug, Deserialize)]
struct EventSubSession {
	id: String,

	#[serde(default)]
	keepalive_timeout_seconds: Option<u64>,

	#[serde(default)]
	reconnect_url: Option<String>,
}

/// `payload` of a notification or revocation, shared by both transports.
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubNotificationPayload {
	pub(crate) subscription: EventSubSubscription,
	#[serde(default)]
	pub(crate) event: Option<serde_json::Value>,
	/// Only on webhook callback verification.
	#[serde(default)]
	pub(crate) challenge: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSubscription {
	pub(crate) id: String,
	pub(crate) status: String,
	#[serde(rename = "type")]
	pub(crate) r#type: String,
}

/// A decoded EventSub WebSocket message.
#[derive(Debug, Clone, PartialEq)]
pub enum EventSubFrame {
	Welcome {
		session_id: String,
		keepalive_timeout: Option<Duration>,
	},
	Keepalive,
	Reconnect {
		session_id: String,
		reconnect_url: String,
	},
	Notification {
		message_id: MessageId,
		remote_id: RemoteRegistrationId,
		kind: String,
		sent_at: SystemTime,
		event: serde_json::Value,
	},
	Revocation {
		remote_id: RemoteRegistrationId,
		status: RegistrationStatus,
	},
	/// A message type this client does not handle.
	Unknown {
		message_type: String,
	},
}

/// Parse one raw WebSocket text frame.
pub fn parse_frame(raw_json: &str) -> anyhow::Result<EventSubFrame> {
	let msg: EventSubMessage = serde_json::from_str(raw_json).context("parse EventSub message")?;

	match msg.metadata.message_type.as_str() {
		"session_welcome" => {
			let payload: EventSubSessionPayload =
				serde_json::from_value(msg.payload).context("parse session_welcome")?;
			Ok(EventSubFrame::Welcome {
				session_id: payload.session.id,
				keepalive_timeout: payload.session.keepalive_timeout_seconds.map(Duration::from_secs),
			})
		}
		"session_keepalive" => Ok(EventSubFrame::Keepalive),
		"session_reconnect" => {
			let payload: EventSubSessionPayload =
				serde_json::from_value(msg.payload).context("parse session_reconnect")?;
			let reconnect_url = payload
				.session
				.reconnect_url
				.context("session_reconnect without reconnect_url")?;
			Ok(EventSubFrame::Reconnect {
				session_id: payload.session.id,
				reconnect_url,
			})
		}
		"notification" => {
			let payload: EventSubNotificationPayload =
				serde_json::from_value(msg.payload).context("parse notification payload")?;
			let sent_at = parse_message_timestamp_system_time(&msg.metadata.message_timestamp)?;
			Ok(EventSubFrame::Notification {
				message_id: MessageId::new(msg.metadata.message_id).context("notification message_id")?,
				remote_id: RemoteRegistrationId::new(payload.subscription.id).context("notification subscription id")?,
				kind: msg.metadata.subscription_type.unwrap_or(payload.subscription.r#type),
				sent_at,
				event: payload.event.unwrap_or(serde_json::Value::Null),
			})
		}
		"revocation" => {
			let payload: EventSubNotificationPayload =
				serde_json::from_value(msg.payload).context("parse revocation payload")?;
			Ok(EventSubFrame::Revocation {
				remote_id: RemoteRegistrationId::new(payload.subscription.id).context("revocation subscription id")?,
				status: RegistrationStatus::from(payload.subscription.status.as_str()),
			})
		}
		other => Ok(EventSubFrame::Unknown {
			message_type: other.to_string(),
		}),
	}
}

/// Convert a `metadata.message_timestamp` RFC3339 timestamp into `SystemTime`.
///
/// EventSub timestamps are RFC3339 with fractional seconds and Zulu (UTC).
pub(crate) fn parse_message_timestamp_system_time(ts: &str) -> anyhow::Result<SystemTime> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts).context("parse EventSub RFC3339 timestamp")?;
	Ok(SystemTime::from(dt.with_timezone(&chrono::Utc)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_welcome() {
		let raw = r#"{
			"metadata": {
				"message_id": "96a3f3b5",
				"message_type": "session_welcome",
				"message_timestamp": "2023-07-19T14:56:51.634234626Z"
			},
			"payload": {
				"session": {
					"id": "AQoQILE98gtqShGmLD7AM6yJThAB",
					"status": "connected",
					"connected_at": "2023-07-19T14:56:51.616329898Z",
					"keepalive_timeout_seconds": 10,
					"reconnect_url": null
				}
			}
		}"#;
		assert_eq!(
			parse_frame(raw).unwrap(),
			EventSubFrame::Welcome {
				session_id: "AQoQILE98gtqShGmLD7AM6yJThAB".to_string(),
				keepalive_timeout: Some(Duration::from_secs(10)),
			}
		);
	}

	#[test]
	fn parses_reconnect() {
		let raw = r#"{
			"metadata": {
				"message_id": "84c1e79a",
				"message_type": "session_reconnect",
				"message_timestamp": "2022-11-18T09:10:11.634234626Z"
			},
			"payload": {
				"session": {
					"id": "AQoQexAWVYKSTIu4ec_2VAxyuhAB",
					"status": "reconnecting",
					"keepalive_timeout_seconds": null,
					"reconnect_url": "wss://eventsub.wss.twitch.tv?...",
					"connected_at": "2022-11-16T10:11:12.634234626Z"
				}
			}
		}"#;
		assert!(matches!(
			parse_frame(raw).unwrap(),
			EventSubFrame::Reconnect { reconnect_url, .. } if reconnect_url.starts_with("wss://")
		));
	}

	#[test]
	fn parses_notification() {
		let raw = r#"{
			"metadata": {
				"message_id": "befa7b53",
				"message_type": "notification",
				"message_timestamp": "2022-11-16T10:11:12.464757833Z",
				"subscription_type": "channel.follow",
				"subscription_version": "2"
			},
			"payload": {
				"subscription": {
					"id": "f1c2a387",
					"status": "enabled",
					"type": "channel.follow",
					"version": "2",
					"cost": 1,
					"condition": { "broadcaster_user_id": "12826" },
					"transport": { "method": "websocket", "session_id": "AQoQ" },
					"created_at": "2022-11-16T10:11:12.464757833Z"
				},
				"event": { "user_id": "1337", "user_login": "awesome_user" }
			}
		}"#;
		let EventSubFrame::Notification {
			message_id,
			remote_id,
			kind,
			event,
			..
		} = parse_frame(raw).unwrap()
		else {
			panic!("expected notification");
		};
		assert_eq!(message_id.as_str(), "befa7b53");
		assert_eq!(remote_id.as_str(), "f1c2a387");
		assert_eq!(kind, "channel.follow");
		assert_eq!(event["user_login"], "awesome_user");
	}

	#[test]
	fn parses_revocation() {
		let raw = r#"{
			"metadata": {
				"message_id": "84c1e79a",
				"message_type": "revocation",
				"message_timestamp": "2022-11-16T10:11:12.464757833Z",
				"subscription_type": "channel.follow",
				"subscription_version": "2"
			},
			"payload": {
				"subscription": {
					"id": "f1c2a387",
					"status": "authorization_revoked",
					"type": "channel.follow",
					"version": "2",
					"cost": 1,
					"condition": { "broadcaster_user_id": "12826" },
					"transport": { "method": "websocket", "session_id": "AQoQ" },
					"created_at": "2022-11-16T10:11:12.464757833Z"
				}
			}
		}"#;
		assert_eq!(
			parse_frame(raw).unwrap(),
			EventSubFrame::Revocation {
				remote_id: RemoteRegistrationId::new("f1c2a387").unwrap(),
				status: RegistrationStatus::AuthorizationRevoked,
			}
		);
	}

	#[test]
	fn keepalive_and_unknown_types() {
		let keepalive = r#"{"metadata":{"message_id":"a","message_type":"session_keepalive","message_timestamp":"2023-07-19T10:11:12.634234626Z"},"payload":{}}"#;
		assert_eq!(parse_frame(keepalive).unwrap(), EventSubFrame::Keepalive);

		let other = r#"{"metadata":{"message_id":"a","message_type":"something_new","message_timestamp":"2023-07-19T10:11:12.634234626Z"},"payload":{}}"#;
		assert_eq!(
			parse_frame(other).unwrap(),
			EventSubFrame::Unknown {
				message_type: "something_new".to_string()
			}
		);

		assert!(parse_frame("not json").is_err());
	}

	#[test]
	fn timestamp_parses_with_nanoseconds() {
		let t = parse_message_timestamp_system_time("2022-11-16T10:11:12.464757833Z").unwrap();
		let secs = t.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_secs();
		assert_eq!(secs, 1_668_593_472);
		assert!(parse_message_timestamp_system_time("yesterday").is_err());
	}
}
