//! In-memory service registry.
//!
//! Owned by the broker event loop, so it needs no interior locking.

pub mod service;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tracing::warn;

pub use service::{Service, ServiceInfo};

use crate::ids::ServiceId;

/// Keyed store of registered services.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<ServiceId, Service>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new service. A colliding id replaces the previous entry.
    pub fn create(&mut self, id: ServiceId, name: impl Into<String>) -> &mut Service {
        let service = Service::new(id.clone(), name);
        match self.services.entry(id) {
            Entry::Occupied(mut entry) => {
                warn!(service_id = %entry.key(), "service id collision, replacing entry");
                let _ = entry.insert(service);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(service),
        }
    }

    /// Look up a service by id.
    pub fn get(&self, id: &ServiceId) -> Option<&Service> {
        self.services.get(id)
    }

    /// Mutable lookup, used for subscription changes.
    pub fn get_mut(&mut self, id: &ServiceId) -> Option<&mut Service> {
        self.services.get_mut(id)
    }

    /// Remove a service; absent ids are a no-op.
    pub fn remove(&mut self, id: &ServiceId) -> Option<Service> {
        self.services.remove(id)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ServiceId) -> bool {
        self.services.contains_key(id)
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True when no service is registered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Detached view of every service keyed by id.
    pub fn snapshot(&self) -> BTreeMap<String, ServiceInfo> {
        self.services
            .values()
            .map(|svc| (svc.id().to_string(), svc.info()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ServiceId {
        ServiceId::from_raw(s)
    }

    #[test]
    fn create_and_get() {
        let mut reg = ServiceRegistry::new();
        let _ = reg.create(id("billing.1.2"), "billing");
        let svc = reg.get(&id("billing.1.2")).unwrap();
        assert_eq!(svc.name(), "billing");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn get_absent_is_none() {
        let reg = ServiceRegistry::new();
        assert!(reg.get(&id("nope")).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn colliding_id_overwrites() {
        let mut reg = ServiceRegistry::new();
        reg.create(id("x.1.1"), "first").subscribe("evt").unwrap();
        let _ = reg.create(id("x.1.1"), "second");
        assert_eq!(reg.len(), 1);
        let svc = reg.get(&id("x.1.1")).unwrap();
        assert_eq!(svc.name(), "second");
        assert!(svc.subscribed_events().is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg = ServiceRegistry::new();
        let _ = reg.create(id("a.1.1"), "a");
        assert!(reg.remove(&id("a.1.1")).is_some());
        assert!(reg.remove(&id("a.1.1")).is_none());
        assert!(!reg.contains(&id("a.1.1")));
    }

    #[test]
    fn snapshot_is_keyed_by_id() {
        let mut reg = ServiceRegistry::new();
        let _ = reg.create(id("a.1.1"), "a");
        reg.create(id("b.2.2"), "b").subscribe("b.get").unwrap();

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["a.1.1"].name, "a");
        assert_eq!(snap["b.2.2"].subscribed_events, vec!["b.get".to_string()]);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["b.2.2"]["id"], "b.2.2");
    }

    #[test]
    fn get_mut_allows_subscription_changes() {
        let mut reg = ServiceRegistry::new();
        let _ = reg.create(id("a.1.1"), "a");
        reg.get_mut(&id("a.1.1")).unwrap().subscribe("x").unwrap();
        assert!(reg.get(&id("a.1.1")).unwrap().is_subscribed("x"));
    }
}
