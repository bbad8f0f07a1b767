//! Remote Service Registry
//!
//! Catalog of the endpoints advertised by other nodes, indexed by qualifier.
//! It is fed exclusively by discovery events and never holds an entry for this node's
//! own address (local services are always served by the [`LocalRegistry`](super::local::LocalRegistry)).

use dashmap::DashMap;
use std::collections::BTreeMap;
use tokio::sync::watch;

use super::types::{Endpoint, Member, Service};
use crate::discovery::types::{DiscoveryEvent, DiscoveryEventType};
use crate::membership::types::Address;

pub struct RemoteRegistry {
    own_address: Option<Address>,
    /// `qualifier -> candidates`, in first-registration order.
    endpoints: DashMap<String, Vec<Endpoint>>,
    /// Bumped on every mutation so callers can wait for the catalog to change.
    version: watch::Sender<u64>,
}

impl RemoteRegistry {
    pub fn new(own_address: Option<Address>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            own_address,
            endpoints: DashMap::new(),
            version,
        }
    }

    /// Derives the endpoints a node publishes for its services. Does not touch the registry.
    pub fn create_endpoints(services: &[Service], address: &Address) -> Vec<Endpoint> {
        services
            .iter()
            .flat_map(|service| service.definition().endpoints(address))
            .collect()
    }

    /// Applies one discovery event.
    ///
    /// Unknown senders are treated as first-seen, redundant removals and idle
    /// announcements are no-ops.
    pub fn update(&self, event: &DiscoveryEvent) {
        if self.own_address.as_ref() == Some(&event.from) {
            tracing::debug!("Ignoring discovery event about this node ({})", event.from);
            return;
        }

        match event.kind {
            DiscoveryEventType::Registered => self.register(&event.from, &event.items),
            DiscoveryEventType::Unregistered => self.unregister(&event.from),
            DiscoveryEventType::Idle => {
                tracing::debug!("{} currently advertises nothing", event.from);
            }
        }
    }

    fn register(&self, from: &Address, items: &[Endpoint]) {
        for item in items {
            let mut endpoint = item.clone();
            if &endpoint.address != from {
                tracing::debug!(
                    "Endpoint '{}' announced by {} claims owner {}; using the announcer",
                    endpoint.qualifier,
                    from,
                    endpoint.address
                );
                endpoint.address = from.clone();
            }

            let mut candidates = self.endpoints.entry(endpoint.qualifier.clone()).or_default();
            match candidates
                .iter_mut()
                .find(|candidate| candidate.address == endpoint.address)
            {
                Some(existing) => *existing = endpoint,
                None => candidates.push(endpoint),
            }
        }

        tracing::info!("Registered {} remote endpoint(s) from {}", items.len(), from);
        self.bump();
    }

    fn unregister(&self, from: &Address) {
        let mut removed = 0;
        self.endpoints.retain(|_, candidates| {
            let before = candidates.len();
            candidates.retain(|candidate| &candidate.address != from);
            removed += before - candidates.len();
            !candidates.is_empty()
        });

        if removed == 0 {
            tracing::debug!("{} had no remote endpoints to unregister", from);
            return;
        }

        tracing::info!("Unregistered {} remote endpoint(s) from {}", removed, from);
        self.bump();
    }

    fn bump(&self) {
        self.version.send_modify(|version| *version += 1);
    }

    pub fn candidates_for(&self, qualifier: &str) -> Vec<Endpoint> {
        self.endpoints
            .get(qualifier)
            .map(|candidates| candidates.clone())
            .unwrap_or_default()
    }

    /// Reconstructs the members currently known, with their advertised endpoints.
    pub fn members(&self) -> Vec<Member> {
        let mut members: BTreeMap<Address, Vec<Endpoint>> = BTreeMap::new();
        for entry in self.endpoints.iter() {
            for endpoint in entry.value() {
                members
                    .entry(endpoint.address.clone())
                    .or_default()
                    .push(endpoint.clone());
            }
        }

        members
            .into_iter()
            .map(|(address, mut endpoints)| {
                endpoints.sort_by(|a, b| a.qualifier.cmp(&b.qualifier));
                Member { address, endpoints }
            })
            .collect()
    }

    pub fn qualifier_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Receiver that observes every registry mutation from now on.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}
