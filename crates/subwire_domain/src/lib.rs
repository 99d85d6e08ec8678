#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
		#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
		#[cfg_attr(feature = "serde", serde(transparent))]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty id.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}
			pub fn as_str(&self) -> &str {
				&self.0
			}
			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Upstream-assigned id of a remote registration.
	RemoteRegistrationId
);

string_id!(
	/// Transport message id, the dedup key for redelivered notifications.
	MessageId
);

string_id!(
	/// Upstream user id; used as the authorization context of a registration.
	UserId
);

/// Event kind name, e.g. `channel.follow`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct SubscriptionKind(String);

impl SubscriptionKind {
	/// Create a kind. Rejects empty names, whitespace and `\`.
	pub fn new(kind: impl Into<String>) -> Result<Self, ParseIdError> {
		let kind = kind.into();
		if kind.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if kind.chars().any(|c| c.is_whitespace() || c == '\\') {
			return Err(ParseIdError::InvalidFormat(format!(
				"kind must not contain whitespace or '\\': {kind}"
			)));
		}
		Ok(Self(kind))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SubscriptionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for SubscriptionKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new(s.trim().to_string())
	}
}

impl TryFrom<String> for SubscriptionKind {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl From<SubscriptionKind> for String {
	fn from(kind: SubscriptionKind) -> Self {
		kind.0
	}
}

/// Deterministic local key of a subscription, rendered as
/// `<kind>.<value>.<value>...`.
///
/// Parameter values are escaped (`\` → `\\`, `.` → `\.`) so a value can never
/// forge a separator. Kinds may contain dots themselves, so equality is on the
/// kind and the values rather than the rendered text: kind `x` with value `y`
/// and kind `x.y` with no values both render as `x.y` but are different keys.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "IdentityParts", into = "IdentityParts"))]
pub struct SubscriptionIdentity {
	kind: SubscriptionKind,
	values: Vec<String>,
	rendered: String,
}

#[cfg(feature = "serde")]
#[derive(Clone, Serialize, Deserialize)]
struct IdentityParts {
	kind: SubscriptionKind,
	values: Vec<String>,
}

#[cfg(feature = "serde")]
impl From<IdentityParts> for SubscriptionIdentity {
	fn from(parts: IdentityParts) -> Self {
		compute_identity(&parts.kind, parts.values.iter().map(String::as_str))
	}
}

#[cfg(feature = "serde")]
impl From<SubscriptionIdentity> for IdentityParts {
	fn from(identity: SubscriptionIdentity) -> Self {
		Self {
			kind: identity.kind,
			values: identity.values,
		}
	}
}

impl SubscriptionIdentity {
	pub fn as_str(&self) -> &str {
		&self.rendered
	}

	pub fn kind(&self) -> &SubscriptionKind {
		&self.kind
	}

	/// Unescaped parameter values in canonical order.
	pub fn values(&self) -> &[String] {
		&self.values
	}
}

impl fmt::Debug for SubscriptionIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("SubscriptionIdentity").field(&self.rendered).finish()
	}
}

impl fmt::Display for SubscriptionIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.rendered)
	}
}

/// Compute the identity of `kind` with parameter values in the kind's canonical order.
pub fn compute_identity<'a, I>(kind: &SubscriptionKind, ordered_values: I) -> SubscriptionIdentity
where
	I: IntoIterator<Item = &'a str>,
{
	let mut rendered = String::from(kind.as_str());
	let mut values = Vec::new();
	for value in ordered_values {
		rendered.push('.');
		for c in value.chars() {
			if c == '\\' || c == '.' {
				rendered.push('\\');
			}
			rendered.push(c);
		}
		values.push(value.to_string());
	}
	SubscriptionIdentity {
		kind: kind.clone(),
		values,
		rendered,
	}
}

/// What the application wants to receive: a kind, its version and its
/// parameters in canonical order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubscriptionDescriptor {
	kind: SubscriptionKind,
	version: String,
	parameters: Vec<(String, String)>,
}

impl SubscriptionDescriptor {
	pub fn new(kind: SubscriptionKind, version: impl Into<String>) -> Self {
		Self {
			kind,
			version: version.into(),
			parameters: Vec::new(),
		}
	}

	/// Append a parameter. Call order is the canonical order.
	pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.parameters.push((key.into(), value.into()));
		self
	}

	pub fn kind(&self) -> &SubscriptionKind {
		&self.kind
	}

	pub fn version(&self) -> &str {
		&self.version
	}

	pub fn parameters(&self) -> &[(String, String)] {
		&self.parameters
	}

	pub fn parameter(&self, key: &str) -> Option<&str> {
		self.parameters
			.iter()
			.find(|(k, _)| k == key)
			.map(|(_, v)| v.as_str())
	}

	pub fn identity(&self) -> SubscriptionIdentity {
		compute_identity(&self.kind, self.parameters.iter().map(|(_, v)| v.as_str()))
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	fn kind(s: &str) -> SubscriptionKind {
		SubscriptionKind::new(s).expect("valid kind")
	}

	#[test]
	fn identity_joins_kind_and_values_in_order() {
		let d = SubscriptionDescriptor::new(kind("channel.follow"), "2")
			.with_parameter("broadcaster_user_id", "1234")
			.with_parameter("moderator_user_id", "5678");
		assert_eq!(d.identity().as_str(), "channel.follow.1234.5678");

		let d = SubscriptionDescriptor::new(kind("x.y"), "1").with_parameter("a", "1");
		assert_eq!(d.identity().as_str(), "x.y.1");
	}

	#[test]
	fn identity_is_order_sensitive() {
		let k = kind("channel.follow");
		assert_ne!(compute_identity(&k, ["1", "2"]), compute_identity(&k, ["2", "1"]));
	}

	#[test]
	fn identity_escapes_separators_in_values() {
		let k = kind("x");
		assert_ne!(compute_identity(&k, ["a.b"]), compute_identity(&k, ["a", "b"]));
		assert_eq!(compute_identity(&k, ["a.b"]).as_str(), "x.a\\.b");
		assert_ne!(compute_identity(&k, ["a\\", "b"]), compute_identity(&k, ["a\\.b"]));
	}

	#[test]
	fn identity_keeps_kind_boundary() {
		let short = compute_identity(&kind("x"), ["y"]);
		let long = compute_identity(&kind("x.y"), std::iter::empty());
		assert_eq!(short.as_str(), long.as_str());
		assert_ne!(short, long);
		assert_eq!(short.kind().as_str(), "x");
		assert_eq!(short.values(), ["y".to_string()]);

		let a = compute_identity(&kind("channel"), ["follow", "1"]);
		let b = compute_identity(&kind("channel.follow"), ["1"]);
		assert_ne!(a, b);
	}

	#[test]
	fn identity_ignores_version() {
		let a = SubscriptionDescriptor::new(kind("channel.update"), "1").with_parameter("b", "9");
		let b = SubscriptionDescriptor::new(kind("channel.update"), "2").with_parameter("b", "9");
		assert_eq!(a.identity(), b.identity());
	}

	#[test]
	fn descriptor_parameter_lookup() {
		let d = SubscriptionDescriptor::new(kind("channel.raid"), "1").with_parameter("to_broadcaster_user_id", "42");
		assert_eq!(d.parameter("to_broadcaster_user_id"), Some("42"));
		assert_eq!(d.parameter("from_broadcaster_user_id"), None);
	}

	#[test]
	fn rejects_bad_kinds_and_empty_ids() {
		assert!(SubscriptionKind::new("").is_err());
		assert!(SubscriptionKind::new("channel follow").is_err());
		assert!(SubscriptionKind::new("a\\b").is_err());
		assert!(RemoteRegistrationId::new("  ").is_err());
		assert!("".parse::<MessageId>().is_err());
		assert_eq!("42".parse::<UserId>().unwrap().as_str(), "42");
	}

	fn value() -> impl Strategy<Value = String> {
		"[a-z0-9.\\\\]{0,6}"
	}

	fn any_kind() -> impl Strategy<Value = SubscriptionKind> {
		"[a-z]{1,3}(\\.[a-z]{1,3}){0,2}".prop_map(|s| kind(&s))
	}

	proptest! {
		#[test]
		fn identity_is_deterministic(values in proptest::collection::vec(value(), 0..4)) {
			let k = kind("channel.chat.message");
			let a = compute_identity(&k, values.iter().map(String::as_str));
			let b = compute_identity(&k, values.iter().map(String::as_str));
			prop_assert_eq!(a, b);
		}

		#[test]
		fn distinct_values_never_collide(
			a in proptest::collection::vec(value(), 2),
			b in proptest::collection::vec(value(), 2),
		) {
			prop_assume!(a != b);
			let k = kind("channel.moderate");
			prop_assert_ne!(
				compute_identity(&k, a.iter().map(String::as_str)),
				compute_identity(&k, b.iter().map(String::as_str))
			);
		}

		#[test]
		fn distinct_kinds_and_values_never_collide(
			ka in any_kind(),
			a in proptest::collection::vec(value(), 0..3),
			kb in any_kind(),
			b in proptest::collection::vec(value(), 0..3),
		) {
			prop_assume!(ka != kb || a != b);
			prop_assert_ne!(
				compute_identity(&ka, a.iter().map(String::as_str)),
				compute_identity(&kb, b.iter().map(String::as_str))
			);
		}
	}
}
