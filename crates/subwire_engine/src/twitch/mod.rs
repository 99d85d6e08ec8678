#![forbid(unsafe_code)]

//! Twitch EventSub implementations of the engine's collaborators.

pub mod eventsub;
pub mod helix;
pub mod webhook;
pub mod websocket;

pub use eventsub::{EventSubFrame, parse_frame};
pub use helix::{DEFAULT_HELIX_BASE_URL, HelixClient};
pub use webhook::{WebhookDelivery, WebhookError, WebhookHandler, WebhookResponse, WebhookTransport};
pub use websocket::{DEFAULT_EVENTSUB_WS_URL, EventSubSession, EventSubSessionConfig, WebSocketTransport, WsConnector};
