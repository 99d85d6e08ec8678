#![forbid(unsafe_code)]

use subwire_domain::{MessageId, RemoteRegistrationId, SubscriptionIdentity};
use tokio::sync::broadcast;

use crate::api::{ApiError, RegistrationStatus};

/// Outcome of a remote lifecycle step. Observers receive them in emission
/// order, which is FIFO per subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
	CreateSuccess {
		identity: SubscriptionIdentity,
		remote_id: RemoteRegistrationId,
		/// Adopted an existing registration instead of creating one.
		resumed: bool,
	},
	CreateFailure {
		identity: SubscriptionIdentity,
		error: ApiError,
	},
	DeleteSuccess {
		identity: SubscriptionIdentity,
		remote_id: RemoteRegistrationId,
	},
	DeleteFailure {
		identity: SubscriptionIdentity,
		remote_id: RemoteRegistrationId,
		error: ApiError,
	},
	Revoke {
		identity: SubscriptionIdentity,
		remote_id: RemoteRegistrationId,
		status: RegistrationStatus,
	},
}

impl LifecycleEvent {
	pub fn identity(&self) -> &SubscriptionIdentity {
		match self {
			Self::CreateSuccess { identity, .. }
			| Self::CreateFailure { identity, .. }
			| Self::DeleteSuccess { identity, .. }
			| Self::DeleteFailure { identity, .. }
			| Self::Revoke { identity, .. } => identity,
		}
	}
}

/// A handler returned an error or panicked while processing a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
	pub identity: SubscriptionIdentity,
	pub message_id: MessageId,
	pub error: String,
}

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
	lifecycle: broadcast::Sender<LifecycleEvent>,
	handler_failures: broadcast::Sender<HandlerFailure>,
}

impl EventBus {
	pub(crate) fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		let (lifecycle, _) = broadcast::channel(capacity);
		let (handler_failures, _) = broadcast::channel(capacity);
		Self {
			lifecycle,
			handler_failures,
		}
	}

	pub(crate) fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
		self.lifecycle.subscribe()
	}

	pub(crate) fn subscribe_handler_failures(&self) -> broadcast::Receiver<HandlerFailure> {
		self.handler_failures.subscribe()
	}

	// No receivers is fine; events are best-effort notifications.
	pub(crate) fn emit(&self, event: LifecycleEvent) {
		let _ = self.lifecycle.send(event);
	}

	pub(crate) fn emit_handler_failure(&self, failure: HandlerFailure) {
		let _ = self.handler_failures.send(failure);
	}
}
