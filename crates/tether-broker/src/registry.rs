use crate::session::SessionId;
use dashmap::DashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tether::protocol::IdentityToken;

/// Ownership fields of one resource. Guarded by the resource's own lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ownership {
    pub owner: Option<SessionId>,
    pub generation: u64,
}

/// A controllable resource as seen by the broker.
///
/// The application state behind the resource lives elsewhere; the broker only
/// touches the ownership metadata kept here.
#[derive(Debug)]
pub struct Resource {
    name: String,
    identity: IdentityToken,
    ownership: StdMutex<Ownership>,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identity: IdentityToken::generate(),
            ownership: StdMutex::new(Ownership::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &IdentityToken {
        &self.identity
    }

    /// Point-in-time copy of the ownership fields.
    pub fn ownership(&self) -> Ownership {
        *self.lock()
    }

    /// Exclusive access to the ownership fields. Every fencing transition on
    /// this resource goes through here, which linearizes them.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Ownership> {
        // Ownership is two plain fields written in one step; a panic elsewhere
        // cannot leave it half-updated, so a poisoned lock is still usable.
        self.ownership.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lookup interface the broker needs from whoever owns the resources.
pub trait ResourceRegistry: Send + Sync + 'static {
    fn lookup(&self, name: &str) -> Option<Arc<Resource>>;
}

/// Ownership view of one resource, for the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub name: String,
    pub identity: IdentityToken,
    pub owner: Option<SessionId>,
    pub generation: u64,
}

/// Concurrent in-process registry.
///
/// Uses `DashMap` so lookups for different names never contend; each record
/// then carries its own ownership lock.
#[derive(Default)]
pub struct InMemoryRegistry {
    resources: DashMap<String, Arc<Resource>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding fresh records for `names`.
    pub fn with_resources<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        for name in names {
            registry.insert(name);
        }
        registry
    }

    /// Create (or recreate) a resource. A recreated resource gets a new
    /// identity token, so tokens for the old record stop validating.
    pub fn insert(&self, name: impl Into<String>) -> Arc<Resource> {
        let resource = Arc::new(Resource::new(name));
        self.resources
            .insert(resource.name().to_string(), resource.clone());
        resource
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Resource>> {
        self.resources.remove(name).map(|(_, r)| r)
    }

    /// Recreate every resource: new identity tokens, generation 0, unowned.
    pub fn reset(&self) {
        let names: Vec<String> = self.resources.iter().map(|r| r.key().clone()).collect();
        for name in names {
            self.insert(name);
        }
        tracing::info!(count = self.resources.len(), "registry reset");
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Ownership of every resource, sorted by name.
    pub fn snapshot(&self) -> Vec<ResourceSnapshot> {
        let mut out: Vec<ResourceSnapshot> = self
            .resources
            .iter()
            .map(|entry| {
                let resource = entry.value();
                let ownership = resource.ownership();
                ResourceSnapshot {
                    name: resource.name().to_string(),
                    identity: resource.identity().clone(),
                    owner: ownership.owner,
                    generation: ownership.generation,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

impl ResourceRegistry for InMemoryRegistry {
    fn lookup(&self, name: &str) -> Option<Arc<Resource>> {
        // Clone out so the caller doesn't hold the map shard.
        self.resources.get(name).map(|r| r.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_and_unknown() {
        let registry = InMemoryRegistry::with_resources(["arm1", "arm2"]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("arm1").unwrap().name(), "arm1");
        assert!(registry.lookup("wrist").is_none());
    }

    #[test]
    fn new_resources_start_unowned_at_generation_zero() {
        let registry = InMemoryRegistry::with_resources(["arm1"]);
        let ownership = registry.lookup("arm1").unwrap().ownership();
        assert_eq!(ownership, Ownership::default());
        assert!(ownership.owner.is_none());
        assert_eq!(ownership.generation, 0);
    }

    #[test]
    fn reinsert_replaces_identity() {
        let registry = InMemoryRegistry::new();
        let first = registry.insert("arm1").identity().clone();
        let second = registry.insert("arm1").identity().clone();
        assert_ne!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reset_recreates_every_record() {
        let registry = InMemoryRegistry::with_resources(["arm1", "arm2"]);
        let before = registry.snapshot();
        {
            let arm1 = registry.lookup("arm1").unwrap();
            let mut ownership = arm1.lock();
            ownership.owner = Some(SessionId::from_raw(7));
            ownership.generation = 4;
        }

        registry.reset();
        let after = registry.snapshot();
        assert_eq!(after.len(), 2);
        for (old, new) in before.iter().zip(&after) {
            assert_eq!(old.name, new.name);
            assert_ne!(old.identity, new.identity);
            assert!(new.owner.is_none());
            assert_eq!(new.generation, 0);
        }
    }

    #[test]
    fn remove_drops_record() {
        let registry = InMemoryRegistry::with_resources(["arm1"]);
        assert!(registry.remove("arm1").is_some());
        assert!(registry.remove("arm1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_sorted() {
        let registry = InMemoryRegistry::with_resources(["wrist", "arm1", "elbow"]);
        let names: Vec<_> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["arm1", "elbow", "wrist"]);
    }
}
