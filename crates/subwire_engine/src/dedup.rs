#![forbid(unsafe_code)]

//! Time-bounded set of delivered message ids.
//!
//! Upstream transports redeliver a notification on reconnect or when an ack
//! times out, but only inside a bounded replay window. Remembering every id
//! for that window is enough to hand each logical event to handlers once.
//! After the TTL an id is forgotten and a late redelivery goes through again.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use subwire_domain::MessageId;

/// Matches the upstream replay window.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub struct NotificationDedupCache {
	ttl: Duration,
	expires_at: HashMap<MessageId, Instant>,
	// May hold stale deadlines for ids re-marked later; sweep skips those.
	deadlines: BinaryHeap<Reverse<(Instant, MessageId)>>,
}

impl Default for NotificationDedupCache {
	fn default() -> Self {
		Self::new(DEFAULT_DEDUP_TTL)
	}
}

impl NotificationDedupCache {
	pub fn new(ttl: Duration) -> Self {
		Self {
			ttl,
			expires_at: HashMap::new(),
			deadlines: BinaryHeap::new(),
		}
	}

	pub fn ttl(&self) -> Duration {
		self.ttl
	}

	pub fn has_seen(&self, message_id: &MessageId) -> bool {
		self.has_seen_at(message_id, Instant::now())
	}

	pub fn has_seen_at(&self, message_id: &MessageId, now: Instant) -> bool {
		self.expires_at.get(message_id).is_some_and(|deadline| *deadline > now)
	}

	pub fn mark_seen(&mut self, message_id: MessageId, ttl: Duration) {
		self.mark_seen_at(message_id, ttl, Instant::now());
	}

	pub fn mark_seen_at(&mut self, message_id: MessageId, ttl: Duration, now: Instant) {
		self.sweep_at(now);

		// An unrepresentable deadline means "effectively forever".
		let deadline = now
			.checked_add(ttl)
			.unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365));

		self.expires_at.insert(message_id.clone(), deadline);
		self.deadlines.push(Reverse((deadline, message_id)));
	}

	/// Atomic check-and-set with the default TTL. Returns `true` when the id
	/// had not been seen (the caller should deliver).
	pub fn check_and_mark(&mut self, message_id: &MessageId) -> bool {
		self.check_and_mark_at(message_id, Instant::now())
	}

	pub fn check_and_mark_at(&mut self, message_id: &MessageId, now: Instant) -> bool {
		self.sweep_at(now);
		if self.expires_at.contains_key(message_id) {
			return false;
		}
		self.mark_seen_at(message_id.clone(), self.ttl, now);
		true
	}

	pub fn sweep(&mut self) -> usize {
		self.sweep_at(Instant::now())
	}

	/// Forget every id whose deadline is at or before `now`. Returns how many
	/// ids were forgotten.
	pub fn sweep_at(&mut self, now: Instant) -> usize {
		let mut removed = 0;
		loop {
			let Some(Reverse((deadline, _))) = self.deadlines.peek() else {
				break;
			};
			if *deadline > now {
				break;
			}

			let Some(Reverse((deadline, message_id))) = self.deadlines.pop() else {
				break;
			};
			if self.expires_at.get(&message_id) == Some(&deadline) {
				self.expires_at.remove(&message_id);
				removed += 1;
			}
		}
		removed
	}

	pub fn len(&self) -> usize {
		self.expires_at.len()
	}

	pub fn is_empty(&self) -> bool {
		self.expires_at.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn mid(s: &str) -> MessageId {
		MessageId::new(s).expect("valid message id")
	}

	#[test]
	fn check_and_mark_accepts_once_within_ttl() {
		let mut cache = NotificationDedupCache::new(Duration::from_secs(600));
		let t0 = Instant::now();

		assert!(cache.check_and_mark_at(&mid("m1"), t0));
		assert!(!cache.check_and_mark_at(&mid("m1"), t0 + Duration::from_secs(1)));
		assert!(!cache.check_and_mark_at(&mid("m1"), t0 + Duration::from_secs(599)));
		assert!(cache.check_and_mark_at(&mid("m2"), t0 + Duration::from_secs(2)));
	}

	#[test]
	fn ids_are_forgotten_after_ttl() {
		let mut cache = NotificationDedupCache::new(Duration::from_secs(60));
		let t0 = Instant::now();

		assert!(cache.check_and_mark_at(&mid("m1"), t0));
		assert!(cache.has_seen_at(&mid("m1"), t0 + Duration::from_secs(59)));
		assert!(!cache.has_seen_at(&mid("m1"), t0 + Duration::from_secs(60)));

		assert!(cache.check_and_mark_at(&mid("m1"), t0 + Duration::from_secs(61)));
		assert_eq!(cache.len(), 1);
	}

	#[test]
	fn sweep_removes_only_expired_entries() {
		let mut cache = NotificationDedupCache::new(Duration::from_secs(10));
		let t0 = Instant::now();

		cache.mark_seen_at(mid("a"), Duration::from_secs(5), t0);
		cache.mark_seen_at(mid("b"), Duration::from_secs(20), t0);
		assert_eq!(cache.len(), 2);

		assert_eq!(cache.sweep_at(t0 + Duration::from_secs(6)), 1);
		assert!(!cache.has_seen_at(&mid("a"), t0 + Duration::from_secs(6)));
		assert!(cache.has_seen_at(&mid("b"), t0 + Duration::from_secs(6)));
	}

	#[test]
	fn re_marking_extends_the_deadline() {
		let mut cache = NotificationDedupCache::new(Duration::from_secs(10));
		let t0 = Instant::now();

		cache.mark_seen_at(mid("a"), Duration::from_secs(5), t0);
		cache.mark_seen_at(mid("a"), Duration::from_secs(30), t0 + Duration::from_secs(1));

		assert_eq!(cache.sweep_at(t0 + Duration::from_secs(10)), 0);
		assert!(cache.has_seen_at(&mid("a"), t0 + Duration::from_secs(10)));
		assert_eq!(cache.len(), 1);
	}
}
