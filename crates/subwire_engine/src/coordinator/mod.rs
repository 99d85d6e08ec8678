#![forbid(unsafe_code)]

//! Lifecycle coordinator: the only owner of the registry and dedup cache.
//!
//! Lock order is registry, then a subscription's own state. No guard is held
//! across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::Mutex;
use subwire_domain::{MessageId, RemoteRegistrationId, SubscriptionDescriptor, SubscriptionIdentity, UserId};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::api::{
	ApiClient, ApiError, RegistrationRequest, RegistrationStatus, RemoteRegistrationSnapshot, TransportProvider,
};
use crate::dedup::{DEFAULT_DEDUP_TTL, NotificationDedupCache};
use crate::events::{EventBus, HandlerFailure, LifecycleEvent};
use crate::registry::{RegistryError, SubscriptionRegistry};
use crate::subscription::{
	ListenerId, Notification, NotificationHandler, StartTicket, Subscription, SubscriptionState,
};


const MAX_PENDING_VERIFICATIONS: usize = 1024;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
	pub dedup_ttl: Duration,
	/// Capacity of each broadcast channel; slow receivers lag past it.
	pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
	fn default() -> Self {
		Self {
			dedup_ttl: DEFAULT_DEDUP_TTL,
			event_capacity: 256,
		}
	}
}

/// What [`LifecycleCoordinator::on_notification`] did with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
	Delivered,
	Duplicate,
	/// No subscription owns the remote id (e.g. it was just stopped).
	Unrouted,
}

struct Inner {
	api: Arc<dyn ApiClient>,
	transport: Arc<dyn TransportProvider>,
	registry: Mutex<SubscriptionRegistry>,
	dedup: Mutex<NotificationDedupCache>,
	events: EventBus,
	// Verifications that arrived before the create call returned, kept for
	// `verification_ttl` and capped at `MAX_PENDING_VERIFICATIONS`.
	pending_verifications: Mutex<HashMap<RemoteRegistrationId, Instant>>,
	verification_ttl: Duration,
}

/// Drives subscriptions through their lifecycle and routes inbound traffic.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LifecycleCoordinator {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for LifecycleCoordinator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LifecycleCoordinator")
			.field("subscriptions", &self.inner.registry.lock().len())
			.finish_non_exhaustive()
	}
}

impl LifecycleCoordinator {
	pub fn new(api: Arc<dyn ApiClient>, transport: Arc<dyn TransportProvider>, config: CoordinatorConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				api,
				transport,
				registry: Mutex::new(SubscriptionRegistry::new()),
				dedup: Mutex::new(NotificationDedupCache::new(config.dedup_ttl)),
				events: EventBus::new(config.event_capacity),
				pending_verifications: Mutex::new(HashMap::new()),
				verification_ttl: config.dedup_ttl,
			}),
		}
	}

	/// Attach `handler` to the subscription for `descriptor`, creating and
	/// starting it in the background if it is new. Must run inside a Tokio runtime.
	///
	/// Completion is observed through [`Self::subscribe_events`].
	pub fn subscribe(
		&self,
		descriptor: SubscriptionDescriptor,
		handler: NotificationHandler,
		auth_context: Option<UserId>,
	) -> SubscriptionHandle {
		let identity = descriptor.identity();
		let (subscription, created, listener) = {
			let mut registry = self.inner.registry.lock();
			let (sub, created) = registry.get_or_create(&identity, || Subscription::new(descriptor, auth_context));
			let listener = sub.add_listener(handler);
			(sub, created, listener)
		};

		if created {
			debug!(identity = %identity, "subscription created");
			let inner = Arc::clone(&self.inner);
			let sub = Arc::clone(&subscription);
			tokio::spawn(async move {
				inner.start_subscription(sub, None).await;
			});
		} else {
			debug!(identity = %identity, listeners = subscription.listener_count(), "attached to existing subscription");
		}

		SubscriptionHandle {
			subscription,
			listener,
			coordinator: Arc::downgrade(&self.inner),
		}
	}

	/// Start every `Pending` subscription, resuming or cycling a matching
	/// snapshot when there is one. Returns once every start has finished.
	pub async fn reconcile(&self, snapshots: &[RemoteRegistrationSnapshot]) -> usize {
		self.inner.reconcile(snapshots).await
	}

	/// Retry or resume a `Pending` or `Suspended` subscription.
	pub async fn start(
		&self,
		identity: &SubscriptionIdentity,
		candidate: Option<RemoteRegistrationSnapshot>,
	) -> Result<(), RegistryError> {
		let sub = self
			.inner
			.registry
			.lock()
			.get(identity)
			.ok_or_else(|| RegistryError::UnknownIdentity(identity.clone()))?;
		sub.resume_from_suspended();
		self.inner.start_subscription(sub, candidate).await;
		Ok(())
	}

	/// Delete the remote registration but keep the subscription for a later start.
	pub async fn suspend(&self, identity: &SubscriptionIdentity) -> Result<(), RegistryError> {
		let sub = self
			.inner
			.registry
			.lock()
			.get(identity)
			.ok_or_else(|| RegistryError::UnknownIdentity(identity.clone()))?;
		self.inner.suspend_subscription(&sub).await;
		Ok(())
	}

	/// Stop the subscription regardless of how many handles share it.
	/// Returns `false` if nothing was registered under `identity`.
	pub async fn stop(&self, identity: &SubscriptionIdentity) -> bool {
		let Some(sub) = self.inner.registry.lock().remove(identity) else {
			return false;
		};
		self.inner.finish_stop(&sub).await;
		true
	}

	pub async fn unsubscribe_all(&self) -> usize {
		self.unsubscribe_where(|_| true).await
	}

	/// Stop every subscription matching `predicate`, working from a snapshot
	/// taken up front.
	pub async fn unsubscribe_where<P>(&self, predicate: P) -> usize
	where
		P: Fn(&Subscription) -> bool,
	{
		let snapshot = self.inner.registry.lock().snapshot();
		let matching: Vec<Arc<Subscription>> = snapshot.into_iter().filter(|s| predicate(s)).collect();

		let targets: Vec<Arc<Subscription>> = {
			let mut registry = self.inner.registry.lock();
			matching
				.into_iter()
				.filter(|sub| {
					let current = registry.is_current(sub);
					if current {
						registry.remove(sub.identity());
					}
					current
				})
				.collect()
		};

		let count = targets.len();
		join_all(targets.iter().map(|sub| self.inner.finish_stop(sub))).await;
		info!(count, "unsubscribed");
		count
	}

	/// Entry point for every inbound notification. Duplicates within the dedup
	/// TTL are dropped before any handler runs.
	pub fn on_notification(
		&self,
		remote_id: &RemoteRegistrationId,
		message_id: MessageId,
		payload: serde_json::Value,
	) -> NotificationOutcome {
		let Some(sub) = self.inner.registry.lock().resolve_by_remote_id(remote_id) else {
			debug!(remote_id = %remote_id, message_id = %message_id, "dropping notification for unknown registration");
			metrics::counter!("subwire_notifications_unrouted_total").increment(1);
			return NotificationOutcome::Unrouted;
		};

		if !self.inner.dedup.lock().check_and_mark(&message_id) {
			debug!(identity = %sub.identity(), message_id = %message_id, "dropping duplicate notification");
			metrics::counter!("subwire_notifications_duplicate_total").increment(1);
			return NotificationOutcome::Duplicate;
		}

		let notification = Notification {
			identity: sub.identity().clone(),
			kind: sub.descriptor().kind().clone(),
			remote_id: remote_id.clone(),
			message_id,
			payload,
		};
		for error in sub.deliver(&notification) {
			warn!(identity = %notification.identity, message_id = %notification.message_id, error = %error, "notification handler failed");
			self.inner.events.emit_handler_failure(HandlerFailure {
				identity: notification.identity.clone(),
				message_id: notification.message_id.clone(),
				error,
			});
		}
		metrics::counter!("subwire_notifications_delivered_total").increment(1);
		NotificationOutcome::Delivered
	}

	/// The upstream removed a registration. The subscription is suspended
	/// locally without a remote delete. Returns `false` for unknown ids.
	pub fn on_revocation(&self, remote_id: &RemoteRegistrationId, status: RegistrationStatus) -> bool {
		let identity = {
			let mut registry = self.inner.registry.lock();
			let Some(sub) = registry.resolve_by_remote_id(remote_id) else {
				debug!(remote_id = %remote_id, status = %status, "revocation for unknown registration");
				return false;
			};
			sub.begin_suspend();
			registry.unbind_remote(sub.identity());
			sub.identity().clone()
		};
		self.inner.pending_verifications.lock().remove(remote_id);

		warn!(identity = %identity, remote_id = %remote_id, status = %status, "subscription revoked");
		metrics::counter!("subwire_revocations_total").increment(1);
		self.inner.events.emit(LifecycleEvent::Revoke {
			identity,
			remote_id: remote_id.clone(),
			status,
		});
		true
	}

	/// The upstream confirmed a registration (webhook callback verification).
	/// Returns `false` when the create call has not come back yet; the
	/// verification is applied once it does.
	pub fn mark_verified(&self, remote_id: &RemoteRegistrationId) -> bool {
		let resolved = self.inner.registry.lock().resolve_by_remote_id(remote_id);
		match resolved {
			Some(sub) => {
				sub.mark_verified();
				debug!(identity = %sub.identity(), remote_id = %remote_id, "subscription verified");
				true
			}
			None => {
				self.inner.remember_verification(remote_id, Instant::now());
				false
			}
		}
	}

	/// The transport session that owned every active registration is gone.
	/// Active subscriptions fall back to `Pending` for the next reconcile.
	/// Starts still in flight are invalidated: whatever they register was
	/// bound to the old session and is deleted when it comes back.
	///
	/// Returns the number of `Active` subscriptions reset.
	pub fn on_transport_disconnected(&self) -> usize {
		let mut reset = 0;
		let mut interrupted = 0;
		{
			let mut registry = self.inner.registry.lock();
			for sub in registry.snapshot() {
				if sub.reset_to_pending().is_some() {
					registry.unbind_remote(sub.identity());
					reset += 1;
				} else if sub.invalidate_start() {
					interrupted += 1;
				}
			}
		}
		self.inner.pending_verifications.lock().clear();
		if reset > 0 || interrupted > 0 {
			info!(count = reset, interrupted, "transport disconnected, subscriptions back to pending");
		}
		reset
	}

	pub fn subscription(&self, identity: &SubscriptionIdentity) -> Option<Arc<Subscription>> {
		self.inner.registry.lock().get(identity)
	}

	pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
		self.inner.registry.lock().snapshot()
	}

	pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
		self.inner.events.subscribe_lifecycle()
	}

	pub fn subscribe_handler_failures(&self) -> broadcast::Receiver<HandlerFailure> {
		self.inner.events.subscribe_handler_failures()
	}

	/// Forget expired dedup entries and verifications no create ever claimed.
	/// Marking already sweeps, so this only matters for memory on an idle
	/// coordinator. Returns the number of dedup entries evicted.
	pub fn sweep_dedup(&self) -> usize {
		self.sweep_at(Instant::now())
	}

	pub(crate) fn sweep_at(&self, now: Instant) -> usize {
		let expired = self.inner.prune_verifications(now);
		if expired > 0 {
			debug!(expired, "unclaimed verifications forgotten");
		}
		self.inner.dedup.lock().sweep_at(now)
	}
}

impl Inner {
	fn remember_verification(&self, remote_id: &RemoteRegistrationId, now: Instant) {
		self.prune_verifications(now);
		let mut pending = self.pending_verifications.lock();
		if pending.len() >= MAX_PENDING_VERIFICATIONS
			&& let Some(oldest) = pending.iter().min_by_key(|(_, at)| **at).map(|(id, _)| id.clone())
		{
			pending.remove(&oldest);
		}
		pending.insert(remote_id.clone(), now);
	}

	fn take_pending_verification(&self, remote_id: &RemoteRegistrationId) -> bool {
		let now = Instant::now();
		self.pending_verifications
			.lock()
			.remove(remote_id)
			.is_some_and(|at| now.saturating_duration_since(at) < self.verification_ttl)
	}

	fn prune_verifications(&self, now: Instant) -> usize {
		let mut pending = self.pending_verifications.lock();
		let before = pending.len();
		pending.retain(|_, at| now.saturating_duration_since(*at) < self.verification_ttl);
		before - pending.len()
	}

	async fn reconcile(&self, snapshots: &[RemoteRegistrationSnapshot]) -> usize {
		let (mut pending, mut claimed) = {
			let registry = self.registry.lock();
			let all = registry.snapshot();
			let claimed: HashSet<RemoteRegistrationId> = all.iter().filter_map(|s| s.remote_id()).collect();
			let pending: Vec<_> = all
				.into_iter()
				.filter(|s| s.state() == SubscriptionState::Pending)
				.collect();
			(pending, claimed)
		};
		pending.sort_by(|a, b| a.identity().cmp(b.identity()));

		let mut starts = Vec::with_capacity(pending.len());
		for sub in pending {
			let candidate = self.pick_candidate(&sub, snapshots, &claimed);
			if let Some(candidate) = &candidate {
				claimed.insert(candidate.remote_id.clone());
			}
			starts.push(self.start_subscription(sub, candidate));
		}

		let count = starts.len();
		join_all(starts).await;
		debug!(count, snapshots = snapshots.len(), "reconcile finished");
		count
	}

	/// Prefer a registration that can be adopted as-is; otherwise any match,
	/// which will be cycled.
	fn pick_candidate(
		&self,
		sub: &Subscription,
		snapshots: &[RemoteRegistrationSnapshot],
		claimed: &HashSet<RemoteRegistrationId>,
	) -> Option<RemoteRegistrationSnapshot> {
		let matching: Vec<&RemoteRegistrationSnapshot> = snapshots
			.iter()
			.filter(|s| !claimed.contains(&s.remote_id) && s.matches(sub.descriptor()))
			.collect();
		matching
			.iter()
			.find(|s| self.can_adopt(sub, s))
			.or(matching.first())
			.map(|s| (*s).clone())
	}

	fn can_adopt(&self, sub: &Subscription, snapshot: &RemoteRegistrationSnapshot) -> bool {
		snapshot.status.is_enabled()
			&& snapshot.version == sub.descriptor().version()
			&& self.transport.accepts_existing(snapshot)
	}

	async fn start_subscription(&self, sub: Arc<Subscription>, candidate: Option<RemoteRegistrationSnapshot>) {
		let Some(ticket) = sub.begin_start() else {
			debug!(identity = %sub.identity(), state = ?sub.state(), "start skipped");
			return;
		};

		if let Some(candidate) = candidate {
			if self.can_adopt(&sub, &candidate) {
				self.finish_start(&sub, ticket, candidate.remote_id, true, true).await;
				return;
			}

			info!(
				identity = %sub.identity(),
				remote_id = %candidate.remote_id,
				status = %candidate.status,
				"cycling registration"
			);
			match self.api.delete_registration(&candidate.remote_id).await {
				Ok(()) | Err(ApiError::NotFound(_)) => {}
				Err(e) => {
					warn!(identity = %sub.identity(), remote_id = %candidate.remote_id, error = %e, "delete before recreate failed");
				}
			}
		}

		let transport = match self.transport.transport_options(&sub).await {
			Ok(t) => t,
			Err(e) => {
				self.fail_start(&sub, ticket, e);
				return;
			}
		};

		let request = RegistrationRequest::new(sub.descriptor(), transport, sub.auth_context().cloned());
		match self.api.create_registration(&request).await {
			Ok(registration) => {
				let verified = registration.status.is_enabled() || self.take_pending_verification(&registration.id);
				self.finish_start(&sub, ticket, registration.id, verified, false).await;
			}
			Err(e) => self.fail_start(&sub, ticket, e),
		}
	}

	async fn finish_start(
		&self,
		sub: &Arc<Subscription>,
		ticket: StartTicket,
		remote_id: RemoteRegistrationId,
		verified: bool,
		resumed: bool,
	) {
		let bound = {
			let mut registry = self.registry.lock();
			if !registry.is_current(sub) || !sub.is_start_current(ticket) {
				None
			} else {
				match registry.bind_remote(sub.identity(), remote_id.clone()) {
					Err(e) => Some(Err(e)),
					Ok(()) if sub.activate(ticket, remote_id.clone(), verified) => Some(Ok(())),
					Ok(()) => {
						registry.unbind_remote(sub.identity());
						None
					}
				}
			}
		};

		match bound {
			Some(Ok(())) => {
				info!(identity = %sub.identity(), remote_id = %remote_id, resumed, verified, "subscription active");
				self.events.emit(LifecycleEvent::CreateSuccess {
					identity: sub.identity().clone(),
					remote_id,
					resumed,
				});
			}
			Some(Err(e)) => {
				error!(identity = %sub.identity(), error = %e, "registration conflicts with another subscription");
				self.fail_start(sub, ticket, ApiError::InvalidResponse(e.to_string()));
			}
			None => {
				sub.abort_start(ticket);
				debug!(identity = %sub.identity(), remote_id = %remote_id, "start superseded or stopped, deleting orphan");
				if let Err(e) = self.api.delete_registration(&remote_id).await
					&& !matches!(e, ApiError::NotFound(_))
				{
					warn!(remote_id = %remote_id, error = %e, "orphan registration delete failed");
				}
			}
		}
	}

	fn fail_start(&self, sub: &Arc<Subscription>, ticket: StartTicket, error: ApiError) {
		if !sub.abort_start(ticket) {
			debug!(identity = %sub.identity(), error = %error, "create failed for superseded start");
			return;
		}
		if !self.registry.lock().is_current(sub) {
			debug!(identity = %sub.identity(), error = %error, "create failed for stopped subscription");
			return;
		}
		warn!(identity = %sub.identity(), error = %error, "subscription create failed");
		metrics::counter!("subwire_create_failures_total").increment(1);
		self.events.emit(LifecycleEvent::CreateFailure {
			identity: sub.identity().clone(),
			error,
		});
	}

	async fn suspend_subscription(&self, sub: &Arc<Subscription>) {
		let remote_id = {
			let mut registry = self.registry.lock();
			let Some(remote_id) = sub.begin_suspend() else {
				return;
			};
			if registry.is_current(sub) {
				registry.unbind_remote(sub.identity());
			}
			remote_id
		};
		self.delete_remote(sub.identity(), remote_id).await;
	}

	/// Called once the subscription is out of the registry.
	async fn finish_stop(&self, sub: &Arc<Subscription>) {
		let remote_id = sub.begin_suspend();
		sub.mark_stopped();
		info!(identity = %sub.identity(), "subscription stopped");
		if let Some(remote_id) = remote_id {
			self.delete_remote(sub.identity(), remote_id).await;
		}
	}

	async fn delete_remote(&self, identity: &SubscriptionIdentity, remote_id: RemoteRegistrationId) {
		self.pending_verifications.lock().remove(&remote_id);
		match self.api.delete_registration(&remote_id).await {
			Ok(()) | Err(ApiError::NotFound(_)) => {
				debug!(identity = %identity, remote_id = %remote_id, "registration deleted");
				self.events.emit(LifecycleEvent::DeleteSuccess {
					identity: identity.clone(),
					remote_id,
				});
			}
			Err(e) => {
				warn!(identity = %identity, remote_id = %remote_id, error = %e, "registration delete failed");
				metrics::counter!("subwire_delete_failures_total").increment(1);
				self.events.emit(LifecycleEvent::DeleteFailure {
					identity: identity.clone(),
					remote_id,
					error: e,
				});
			}
		}
	}

	/// Drop one listener; the last one out stops the subscription.
	async fn detach_listener(&self, sub: &Arc<Subscription>, listener: ListenerId) {
		let last = {
			let mut registry = self.registry.lock();
			match sub.remove_listener(listener) {
				Some(0) => {
					if registry.is_current(sub) {
						registry.remove(sub.identity());
					}
					true
				}
				_ => false,
			}
		};
		if last {
			self.finish_stop(sub).await;
		}
	}
}

/// Caller's view of a subscription returned by [`LifecycleCoordinator::subscribe`].
///
/// Holds the coordinator weakly; once it is dropped, `stop` and `start` do nothing.
#[derive(Debug)]
pub struct SubscriptionHandle {
	subscription: Arc<Subscription>,
	listener: ListenerId,
	coordinator: Weak<Inner>,
}

impl SubscriptionHandle {
	pub fn identity(&self) -> &SubscriptionIdentity {
		self.subscription.identity()
	}

	pub fn is_verified(&self) -> bool {
		self.subscription.is_verified()
	}

	pub fn state(&self) -> SubscriptionState {
		self.subscription.state()
	}

	pub fn remote_id(&self) -> Option<RemoteRegistrationId> {
		self.subscription.remote_id()
	}

	pub fn subscription(&self) -> &Arc<Subscription> {
		&self.subscription
	}

	/// Detach this handle's handler. Idempotent. The subscription itself stops
	/// when no handler is left.
	pub async fn stop(&self) {
		if let Some(inner) = self.coordinator.upgrade() {
			inner.detach_listener(&self.subscription, self.listener).await;
		}
	}

	/// Retry a failed create or resume after suspension or revocation.
	pub async fn start(&self, candidate: Option<RemoteRegistrationSnapshot>) {
		let Some(inner) = self.coordinator.upgrade() else {
			return;
		};
		if !inner.registry.lock().is_current(&self.subscription) {
			return;
		}
		self.subscription.resume_from_suspended();
		inner.start_subscription(Arc::clone(&self.subscription), candidate).await;
	}
}
