#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use subwire_domain::{RemoteRegistrationId, SubscriptionIdentity};
use thiserror::Error;

use crate::subscription::Subscription;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
	#[error("unknown subscription identity: {0}")]
	UnknownIdentity(SubscriptionIdentity),

	#[error("remote registration {remote_id} is already bound to {existing}")]
	RemoteAlreadyBound {
		remote_id: RemoteRegistrationId,
		existing: SubscriptionIdentity,
	},
}

/// Live subscriptions keyed by identity, with a reverse index from remote
/// registration id for routing inbound traffic.
///
/// Invariants kept by every method:
/// - each bound remote id maps to exactly one identity and back;
/// - an identity holds at most one remote id;
/// - reverse entries only exist for identities in the forward map.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
	by_identity: HashMap<SubscriptionIdentity, Arc<Subscription>>,
	by_remote: HashMap<RemoteRegistrationId, SubscriptionIdentity>,
	remote_by_identity: HashMap<SubscriptionIdentity, RemoteRegistrationId>,
}

impl SubscriptionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the entry for `identity`, building it with `factory` when absent.
	/// The flag is `true` when the entry was just created.
	pub fn get_or_create<F>(&mut self, identity: &SubscriptionIdentity, factory: F) -> (Arc<Subscription>, bool)
	where
		F: FnOnce() -> Subscription,
	{
		if let Some(existing) = self.by_identity.get(identity) {
			return (Arc::clone(existing), false);
		}
		let sub = Arc::new(factory());
		self.by_identity.insert(identity.clone(), Arc::clone(&sub));
		(sub, true)
	}

	pub fn get(&self, identity: &SubscriptionIdentity) -> Option<Arc<Subscription>> {
		self.by_identity.get(identity).cloned()
	}

	/// Bind `remote_id` to `identity`, replacing any previous binding of that identity.
	pub fn bind_remote(
		&mut self,
		identity: &SubscriptionIdentity,
		remote_id: RemoteRegistrationId,
	) -> Result<(), RegistryError> {
		if !self.by_identity.contains_key(identity) {
			return Err(RegistryError::UnknownIdentity(identity.clone()));
		}
		if let Some(existing) = self.by_remote.get(&remote_id)
			&& existing != identity
		{
			return Err(RegistryError::RemoteAlreadyBound {
				remote_id,
				existing: existing.clone(),
			});
		}

		if let Some(previous) = self.remote_by_identity.insert(identity.clone(), remote_id.clone())
			&& previous != remote_id
		{
			self.by_remote.remove(&previous);
		}
		self.by_remote.insert(remote_id, identity.clone());
		Ok(())
	}

	/// Drop the reverse entry of `identity`, returning the remote id it held.
	pub fn unbind_remote(&mut self, identity: &SubscriptionIdentity) -> Option<RemoteRegistrationId> {
		let remote_id = self.remote_by_identity.remove(identity)?;
		self.by_remote.remove(&remote_id);
		Some(remote_id)
	}

	pub fn resolve_by_remote_id(&self, remote_id: &RemoteRegistrationId) -> Option<Arc<Subscription>> {
		let identity = self.by_remote.get(remote_id)?;
		self.by_identity.get(identity).cloned()
	}

	pub fn bound_remote_id(&self, identity: &SubscriptionIdentity) -> Option<&RemoteRegistrationId> {
		self.remote_by_identity.get(identity)
	}

	/// Remove forward and reverse entries of `identity`.
	pub fn remove(&mut self, identity: &SubscriptionIdentity) -> Option<Arc<Subscription>> {
		self.unbind_remote(identity);
		self.by_identity.remove(identity)
	}

	/// Whether `sub` is still the registered entry for its identity.
	pub fn is_current(&self, sub: &Arc<Subscription>) -> bool {
		self.by_identity
			.get(sub.identity())
			.is_some_and(|current| Arc::ptr_eq(current, sub))
	}

	/// Stable copy of every entry, safe to iterate while the registry changes.
	pub fn snapshot(&self) -> Vec<Arc<Subscription>> {
		self.by_identity.values().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.by_identity.len()
	}

	pub fn is_empty(&self) -> bool {
		self.by_identity.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;
	use subwire_domain::{SubscriptionDescriptor, SubscriptionKind};

	use super::*;

	fn descriptor(value: &str) -> SubscriptionDescriptor {
		SubscriptionDescriptor::new(SubscriptionKind::new("x.y").unwrap(), "1").with_parameter("a", value)
	}

	fn insert(reg: &mut SubscriptionRegistry, value: &str) -> SubscriptionIdentity {
		let d = descriptor(value);
		let identity = d.identity();
		reg.get_or_create(&identity, || Subscription::new(d, None));
		identity
	}

	fn rid(s: &str) -> RemoteRegistrationId {
		RemoteRegistrationId::new(s).unwrap()
	}

	#[test]
	fn get_or_create_returns_shared_entry() {
		let mut reg = SubscriptionRegistry::new();
		let d = descriptor("1");
		let id = d.identity();

		let (a, created_a) = reg.get_or_create(&id, || Subscription::new(d.clone(), None));
		let (b, created_b) = reg.get_or_create(&id, || panic!("factory must not run twice"));
		assert!(created_a);
		assert!(!created_b);
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(reg.len(), 1);
	}

	#[test]
	fn bind_and_resolve() {
		let mut reg = SubscriptionRegistry::new();
		let id = insert(&mut reg, "1");

		reg.bind_remote(&id, rid("r1")).unwrap();
		let resolved = reg.resolve_by_remote_id(&rid("r1")).unwrap();
		assert_eq!(resolved.identity(), &id);
		assert_eq!(reg.bound_remote_id(&id), Some(&rid("r1")));

		// rebinding the same pair is fine
		reg.bind_remote(&id, rid("r1")).unwrap();
	}

	#[test]
	fn bind_rejects_remote_owned_by_other_identity() {
		let mut reg = SubscriptionRegistry::new();
		let a = insert(&mut reg, "1");
		let b = insert(&mut reg, "2");

		reg.bind_remote(&a, rid("r1")).unwrap();
		let err = reg.bind_remote(&b, rid("r1")).unwrap_err();
		assert_eq!(
			err,
			RegistryError::RemoteAlreadyBound {
				remote_id: rid("r1"),
				existing: a.clone(),
			}
		);
		assert_eq!(reg.resolve_by_remote_id(&rid("r1")).unwrap().identity(), &a);
		assert_eq!(reg.bound_remote_id(&b), None);
	}

	#[test]
	fn bind_rejects_unknown_identity() {
		let mut reg = SubscriptionRegistry::new();
		let id = descriptor("9").identity();
		assert_eq!(
			reg.bind_remote(&id, rid("r1")),
			Err(RegistryError::UnknownIdentity(id))
		);
	}

	#[test]
	fn rebinding_replaces_previous_reverse_entry() {
		let mut reg = SubscriptionRegistry::new();
		let id = insert(&mut reg, "1");
		reg.bind_remote(&id, rid("r1")).unwrap();
		reg.bind_remote(&id, rid("r2")).unwrap();

		assert!(reg.resolve_by_remote_id(&rid("r1")).is_none());
		assert!(reg.resolve_by_remote_id(&rid("r2")).is_some());
	}

	#[test]
	fn remove_clears_both_directions() {
		let mut reg = SubscriptionRegistry::new();
		let id = insert(&mut reg, "1");
		reg.bind_remote(&id, rid("r1")).unwrap();

		let removed = reg.remove(&id).unwrap();
		assert!(!reg.is_current(&removed));
		assert!(reg.resolve_by_remote_id(&rid("r1")).is_none());
		assert!(reg.is_empty());
		assert!(reg.remove(&id).is_none());
	}

	#[derive(Debug, Clone)]
	enum Op {
		Insert(u8),
		Bind(u8, u8),
		Unbind(u8),
		Remove(u8),
	}

	fn op() -> impl Strategy<Value = Op> {
		prop_oneof![
			(0u8..5).prop_map(Op::Insert),
			(0u8..5, 0u8..5).prop_map(|(i, r)| Op::Bind(i, r)),
			(0u8..5).prop_map(Op::Unbind),
			(0u8..5).prop_map(Op::Remove),
		]
	}

	proptest! {
		#[test]
		fn maps_stay_consistent(ops in proptest::collection::vec(op(), 0..64)) {
			let mut reg = SubscriptionRegistry::new();
			let identity = |i: u8| descriptor(&i.to_string()).identity();

			for op in ops {
				match op {
					Op::Insert(i) => {
						insert(&mut reg, &i.to_string());
					}
					Op::Bind(i, r) => {
						let _ = reg.bind_remote(&identity(i), rid(&format!("r{r}")));
					}
					Op::Unbind(i) => {
						reg.unbind_remote(&identity(i));
					}
					Op::Remove(i) => {
						reg.remove(&identity(i));
					}
				}

				prop_assert_eq!(reg.by_remote.len(), reg.remote_by_identity.len());
				for (remote_id, id) in &reg.by_remote {
					prop_assert_eq!(reg.remote_by_identity.get(id), Some(remote_id));
					prop_assert!(reg.by_identity.contains_key(id));
					let resolved = reg.resolve_by_remote_id(remote_id);
					prop_assert!(resolved.is_some_and(|s| s.identity() == id));
				}
			}
		}
	}
}
