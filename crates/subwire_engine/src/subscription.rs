#![forbid(unsafe_code)]

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use subwire_domain::{
	MessageId, RemoteRegistrationId, SubscriptionDescriptor, SubscriptionIdentity, SubscriptionKind, UserId,
};

/// A notification routed to a subscription.
#[derive(Debug, Clone)]
pub struct Notification {
	pub identity: SubscriptionIdentity,
	pub kind: SubscriptionKind,
	pub remote_id: RemoteRegistrationId,
	pub message_id: MessageId,

	/// Event body as delivered by the transport.
	pub payload: serde_json::Value,
}

impl Notification {
	/// Decode the payload into a typed event.
	pub fn decode<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
		serde_json::from_value(self.payload.clone()).with_context(|| format!("decode {} payload", self.kind))
	}
}

/// Application callback. Errors are reported on the handler-failure channel.
pub type NotificationHandler = Arc<dyn Fn(&Notification) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`NotificationHandler`].
pub fn handler<F>(f: F) -> NotificationHandler
where
	F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
{
	Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
	/// Constructed or reset; no live remote registration.
	Pending,
	Active,
	/// Remote registration gone, entity kept for a later start.
	Suspended,
	/// Removed from the registry. Terminal.
	Stopped,
}

pub(crate) type ListenerId = u64;

struct Listener {
	id: ListenerId,
	handler: NotificationHandler,
}

/// Proof of a claimed start, checked again when the start finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StartTicket(u64);

struct Inner {
	state: SubscriptionState,
	remote_id: Option<RemoteRegistrationId>,
	verified: bool,
	starting: bool,
	start_epoch: u64,
	listeners: Vec<Listener>,
	next_listener_id: ListenerId,
}

/// Local record of intent to receive one kind of event with fixed parameters.
///
/// State is only changed by the coordinator; everything mutating is crate-private.
pub struct Subscription {
	identity: SubscriptionIdentity,
	descriptor: SubscriptionDescriptor,
	auth_context: Option<UserId>,
	inner: Mutex<Inner>,
}

impl fmt::Debug for Subscription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let inner = self.inner.lock();
		f.debug_struct("Subscription")
			.field("identity", &self.identity)
			.field("state", &inner.state)
			.field("remote_id", &inner.remote_id)
			.field("verified", &inner.verified)
			.field("listeners", &inner.listeners.len())
			.finish()
	}
}

impl Subscription {
	pub(crate) fn new(descriptor: SubscriptionDescriptor, auth_context: Option<UserId>) -> Self {
		Self {
			identity: descriptor.identity(),
			descriptor,
			auth_context,
			inner: Mutex::new(Inner {
				state: SubscriptionState::Pending,
				remote_id: None,
				verified: false,
				starting: false,
				start_epoch: 0,
				listeners: Vec::new(),
				next_listener_id: 0,
			}),
		}
	}

	pub fn identity(&self) -> &SubscriptionIdentity {
		&self.identity
	}

	pub fn descriptor(&self) -> &SubscriptionDescriptor {
		&self.descriptor
	}

	pub fn auth_context(&self) -> Option<&UserId> {
		self.auth_context.as_ref()
	}

	pub fn state(&self) -> SubscriptionState {
		self.inner.lock().state
	}

	pub fn remote_id(&self) -> Option<RemoteRegistrationId> {
		self.inner.lock().remote_id.clone()
	}

	pub fn is_verified(&self) -> bool {
		self.inner.lock().verified
	}

	pub fn listener_count(&self) -> usize {
		self.inner.lock().listeners.len()
	}

	pub(crate) fn add_listener(&self, handler: NotificationHandler) -> ListenerId {
		let mut inner = self.inner.lock();
		let id = inner.next_listener_id;
		inner.next_listener_id += 1;
		inner.listeners.push(Listener { id, handler });
		id
	}

	/// Returns the number of listeners left, or `None` if `id` was not attached.
	pub(crate) fn remove_listener(&self, id: ListenerId) -> Option<usize> {
		let mut inner = self.inner.lock();
		let pos = inner.listeners.iter().position(|l| l.id == id)?;
		inner.listeners.remove(pos);
		Some(inner.listeners.len())
	}

	/// Claim the right to run a start. Only one start runs at a time and only
	/// from `Pending`. The ticket goes stale if the start is invalidated.
	pub(crate) fn begin_start(&self) -> Option<StartTicket> {
		let mut inner = self.inner.lock();
		if inner.state != SubscriptionState::Pending || inner.starting {
			return None;
		}
		inner.starting = true;
		Some(StartTicket(inner.start_epoch))
	}

	pub(crate) fn is_start_current(&self, ticket: StartTicket) -> bool {
		let inner = self.inner.lock();
		inner.starting && inner.start_epoch == ticket.0
	}

	/// Start ended without a registration; stays `Pending`. Returns `false`
	/// for a stale ticket, leaving any newer start alone.
	pub(crate) fn abort_start(&self, ticket: StartTicket) -> bool {
		let mut inner = self.inner.lock();
		if !inner.starting || inner.start_epoch != ticket.0 {
			return false;
		}
		inner.starting = false;
		true
	}

	/// Drop the start in flight so its result is discarded and a new start
	/// can begin. Returns `false` if nothing was starting.
	pub(crate) fn invalidate_start(&self) -> bool {
		let mut inner = self.inner.lock();
		if !inner.starting {
			return false;
		}
		inner.starting = false;
		inner.start_epoch += 1;
		true
	}

	pub(crate) fn activate(&self, ticket: StartTicket, remote_id: RemoteRegistrationId, verified: bool) -> bool {
		let mut inner = self.inner.lock();
		if !inner.starting || inner.start_epoch != ticket.0 {
			return false;
		}
		inner.starting = false;
		if inner.state != SubscriptionState::Pending {
			return false;
		}
		inner.state = SubscriptionState::Active;
		inner.remote_id = Some(remote_id);
		inner.verified = verified;
		true
	}

	pub(crate) fn mark_verified(&self) {
		let mut inner = self.inner.lock();
		if inner.state == SubscriptionState::Active {
			inner.verified = true;
		}
	}

	/// `Active` → `Suspended`, handing back the registration to delete.
	/// `None` in every other state, which makes suspend idempotent.
	pub(crate) fn begin_suspend(&self) -> Option<RemoteRegistrationId> {
		let mut inner = self.inner.lock();
		if inner.state != SubscriptionState::Active {
			return None;
		}
		inner.state = SubscriptionState::Suspended;
		inner.verified = false;
		inner.remote_id.take()
	}

	/// The transport that owned the registration is gone: `Active` → `Pending`.
	pub(crate) fn reset_to_pending(&self) -> Option<RemoteRegistrationId> {
		let mut inner = self.inner.lock();
		if inner.state != SubscriptionState::Active {
			return None;
		}
		inner.state = SubscriptionState::Pending;
		inner.verified = false;
		inner.remote_id.take()
	}

	pub(crate) fn resume_from_suspended(&self) -> bool {
		let mut inner = self.inner.lock();
		if inner.state != SubscriptionState::Suspended {
			return false;
		}
		inner.state = SubscriptionState::Pending;
		true
	}

	pub(crate) fn mark_stopped(&self) {
		let mut inner = self.inner.lock();
		inner.state = SubscriptionState::Stopped;
		inner.remote_id = None;
		inner.verified = false;
		inner.starting = false;
		inner.start_epoch += 1;
	}

	/// Invoke every listener in attach order. Errors and panics are caught and
	/// returned so one bad handler never blocks the others.
	pub(crate) fn deliver(&self, notification: &Notification) -> Vec<String> {
		let handlers: Vec<NotificationHandler> = self
			.inner
			.lock()
			.listeners
			.iter()
			.map(|l| Arc::clone(&l.handler))
			.collect();

		let mut failures = Vec::new();
		for handler in handlers {
			match catch_unwind(AssertUnwindSafe(|| handler(notification))) {
				Ok(Ok(())) => {}
				Ok(Err(e)) => failures.push(format!("{e:#}")),
				Err(panic) => failures.push(format!("handler panicked: {}", panic_message(panic.as_ref()))),
			}
		}
		failures
	}
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
	if let Some(s) = panic.downcast_ref::<&str>() {
		s
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.as_str()
	} else {
		"<non-string panic payload>"
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use subwire_domain::SubscriptionKind;

	use super::*;

	fn sub() -> Subscription {
		Subscription::new(
			SubscriptionDescriptor::new(SubscriptionKind::new("x.y").unwrap(), "1").with_parameter("a", "1"),
			None,
		)
	}

	fn rid(s: &str) -> RemoteRegistrationId {
		RemoteRegistrationId::new(s).unwrap()
	}

	fn notification(s: &Subscription) -> Notification {
		Notification {
			identity: s.identity().clone(),
			kind: s.descriptor().kind().clone(),
			remote_id: rid("r1"),
			message_id: MessageId::new("m1").unwrap(),
			payload: serde_json::json!({ "user_id": "7" }),
		}
	}

	#[test]
	fn walks_the_state_machine() {
		let s = sub();
		assert_eq!(s.state(), SubscriptionState::Pending);
		assert_eq!(s.identity().as_str(), "x.y.1");

		let ticket = s.begin_start().unwrap();
		assert!(s.begin_start().is_none(), "second start must wait for the first");
		assert!(s.activate(ticket, rid("r1"), true));
		assert_eq!(s.state(), SubscriptionState::Active);
		assert!(s.is_verified());

		assert_eq!(s.begin_suspend(), Some(rid("r1")));
		assert_eq!(s.begin_suspend(), None);
		assert_eq!(s.state(), SubscriptionState::Suspended);
		assert_eq!(s.remote_id(), None);
		assert!(!s.is_verified());

		assert!(s.resume_from_suspended());
		assert_eq!(s.state(), SubscriptionState::Pending);

		s.mark_stopped();
		assert_eq!(s.state(), SubscriptionState::Stopped);
		assert!(s.begin_start().is_none());
	}

	#[test]
	fn aborted_start_can_be_retried() {
		let s = sub();
		let ticket = s.begin_start().unwrap();
		assert!(s.abort_start(ticket));
		assert_eq!(s.state(), SubscriptionState::Pending);
		assert!(s.begin_start().is_some());
	}

	#[test]
	fn invalidated_start_cannot_activate() {
		let s = sub();
		let stale = s.begin_start().unwrap();
		assert!(s.invalidate_start());
		assert!(!s.invalidate_start());
		assert!(!s.is_start_current(stale));

		let fresh = s.begin_start().unwrap();
		assert!(!s.activate(stale, rid("r1"), true));
		assert!(!s.abort_start(stale));
		assert!(s.is_start_current(fresh));
		assert_eq!(s.state(), SubscriptionState::Pending);

		assert!(s.activate(fresh, rid("r2"), false));
		assert_eq!(s.remote_id(), Some(rid("r2")));
	}

	#[test]
	fn reset_to_pending_only_from_active() {
		let s = sub();
		assert_eq!(s.reset_to_pending(), None);
		let ticket = s.begin_start().unwrap();
		assert!(s.activate(ticket, rid("r9"), false));
		assert_eq!(s.reset_to_pending(), Some(rid("r9")));
		assert_eq!(s.state(), SubscriptionState::Pending);
	}

	#[test]
	fn deliver_survives_failing_and_panicking_handlers() {
		let s = sub();
		let calls = Arc::new(AtomicUsize::new(0));

		s.add_listener(handler(|_| anyhow::bail!("boom")));
		s.add_listener(handler(|_| panic!("kaboom")));
		let c = Arc::clone(&calls);
		s.add_listener(handler(move |n| {
			assert_eq!(n.payload["user_id"], "7");
			c.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}));

		let failures = s.deliver(&notification(&s));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(failures.len(), 2);
		assert!(failures[0].contains("boom"));
		assert!(failures[1].contains("kaboom"));
	}

	#[test]
	fn remove_listener_reports_remaining() {
		let s = sub();
		let a = s.add_listener(handler(|_| Ok(())));
		let b = s.add_listener(handler(|_| Ok(())));
		assert_eq!(s.remove_listener(a), Some(1));
		assert_eq!(s.remove_listener(a), None);
		assert_eq!(s.remove_listener(b), Some(0));
	}

	#[test]
	fn decode_typed_payload() {
		#[derive(serde::Deserialize)]
		struct Follow {
			user_id: String,
		}

		let s = sub();
		let follow: Follow = notification(&s).decode().unwrap();
		assert_eq!(follow.user_id, "7");
	}
}
