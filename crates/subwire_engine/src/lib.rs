#![forbid(unsafe_code)]

pub mod api;
pub mod coordinator;
pub mod dedup;
pub mod events;
pub mod registry;
pub mod subscription;
pub mod twitch;

use std::fmt;

pub use api::{
	ApiClient, ApiError, RegistrationRequest, RegistrationStatus, RemoteRegistration, RemoteRegistrationSnapshot,
	TransportOptions, TransportProvider, TransportSnapshot,
};
pub use coordinator::{CoordinatorConfig, LifecycleCoordinator, NotificationOutcome, SubscriptionHandle};
pub use dedup::{DEFAULT_DEDUP_TTL, NotificationDedupCache};
pub use events::{HandlerFailure, LifecycleEvent};
pub use registry::{RegistryError, SubscriptionRegistry};
pub use subscription::{Notification, NotificationHandler, Subscription, SubscriptionState, handler};

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

#[cfg(test)]
mod tests {
	use super::SecretString;

	#[test]
	fn secret_string_redacts() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.expose(), "hunter2");
	}
}
