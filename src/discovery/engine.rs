use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

use super::broadcast::EventBroadcaster;
use super::types::{Discovery, DiscoveryEvent, DiscoveryEvents, DiscoveryFactory, DiscoveryOptions};
use crate::error::{MeshError, MeshResult, ValidationError};
use crate::membership::source::MembershipSource;
use crate::membership::types::{Address, ClusterEvent, ClusterEventType, ClusterOptions};
use crate::registry::types::Endpoint;

/// Resolution of `destroy()` when discovery never had a membership source.
pub const NO_CLUSTER_MESSAGE: &str =
    "discovery has no membership source: a cluster implementation must be provided";

pub fn destroyed_message(address: &Address) -> String {
    format!("{} discovery has been destroyed", address)
}

/// The known-present flag of every member, used to collapse duplicate announcements.
///
/// Keyed by address only: a present member that swaps one endpoint for another does
/// not produce a fresh `Registered` event.
#[derive(Debug, Default)]
pub struct MembersState {
    present: HashMap<Address, bool>,
}

impl MembersState {
    pub fn is_present(&self, member: &Address) -> bool {
        self.present.get(member).copied().unwrap_or(false)
    }

    /// Reconciles one entry of a full membership snapshot.
    pub fn on_snapshot(&mut self, member: Address, items: Vec<Endpoint>) -> Option<DiscoveryEvent> {
        if items.is_empty() {
            return Some(DiscoveryEvent::idle(member));
        }

        if self.is_present(&member) {
            return None;
        }

        self.present.insert(member.clone(), true);
        Some(DiscoveryEvent::registered(member, items))
    }

    /// Reconciles one live membership change.
    pub fn on_cluster_event(&mut self, event: ClusterEvent) -> Option<DiscoveryEvent> {
        if event.items.is_empty() {
            return None;
        }

        let present = self.is_present(&event.from);
        match event.kind {
            ClusterEventType::Removed if present => {
                self.present.insert(event.from.clone(), false);
                Some(DiscoveryEvent::unregistered(event.from, event.items))
            }
            ClusterEventType::Added | ClusterEventType::Updated if !present => {
                self.present.insert(event.from.clone(), true);
                Some(DiscoveryEvent::registered(event.from, event.items))
            }
            _ => None,
        }
    }
}

fn validate_options(options: &DiscoveryOptions) -> Result<(), ValidationError> {
    options.address.validate()?;

    for seed in &options.seed_address {
        seed.validate()?;
        if seed == &options.address {
            return Err(ValidationError::AddressCollision {
                address: options.address.clone(),
                seed: seed.clone(),
            });
        }
    }

    Ok(())
}

/// Built-in discovery engine bound to one membership source.
pub struct DiscoveryHandle {
    address: Address,
    cluster: Option<Arc<dyn MembershipSource>>,
    broadcaster: Arc<EventBroadcaster>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    destroyed: AtomicBool,
}

/// Starts the discovery engine.
///
/// Without a cluster factory the engine comes up degraded: it logs a warning, its
/// event stream is already complete and `destroy()` resolves with [`NO_CLUSTER_MESSAGE`].
pub async fn create_discovery(options: DiscoveryOptions) -> MeshResult<DiscoveryHandle> {
    let broadcaster = Arc::new(EventBroadcaster::default());

    let Some(join_cluster) = options.cluster.clone() else {
        tracing::warn!("{}: {}", options.address, NO_CLUSTER_MESSAGE);
        broadcaster.complete();
        return Ok(DiscoveryHandle {
            address: options.address,
            cluster: None,
            broadcaster,
            reconciler: Mutex::new(None),
            started: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
        });
    };

    validate_options(&options)?;

    let cluster = join_cluster(ClusterOptions {
        address: options.address.clone(),
        seed_address: options.seed_address.clone(),
        items_to_publish: options.items_to_publish.clone(),
    })
    .await
    .map_err(|e| MeshError::Discovery(format!("failed to join cluster: {}", e)))?;

    tracing::info!(
        "Discovery started on {} publishing {} endpoint(s)",
        options.address,
        options.items_to_publish.len()
    );

    Ok(DiscoveryHandle {
        address: options.address,
        cluster: Some(cluster),
        broadcaster,
        reconciler: Mutex::new(None),
        started: AtomicBool::new(false),
        destroyed: AtomicBool::new(false),
    })
}

/// The factory used by the orchestrator when no custom discovery is supplied.
pub fn default_discovery() -> DiscoveryFactory {
    Arc::new(|options: DiscoveryOptions| {
        async move {
            let handle = create_discovery(options).await?;
            Ok::<_, MeshError>(Arc::new(handle) as Arc<dyn Discovery>)
        }
        .boxed()
    })
}

impl DiscoveryHandle {
    pub fn address(&self) -> &Address {
        &self.address
    }

    fn start_reconciler(&self, cluster: Arc<dyn MembershipSource>) {
        let broadcaster = self.broadcaster.clone();
        let address = self.address.clone();

        let handle = tokio::spawn(async move {
            reconcile(cluster, broadcaster, address).await;
        });

        *self
            .reconciler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

/// Runs the snapshot pass and then the live pass against one shared members state.
async fn reconcile(
    cluster: Arc<dyn MembershipSource>,
    broadcaster: Arc<EventBroadcaster>,
    address: Address,
) {
    let mut members_state = MembersState::default();

    // Listen before asking for the snapshot so nothing falls between the two passes.
    let mut live = cluster.listen();

    match cluster.current_members().await {
        Ok(snapshot) => {
            tracing::debug!("{}: snapshot with {} member(s)", address, snapshot.len());
            for (member, items) in snapshot {
                if member == address {
                    continue;
                }
                if let Some(event) = members_state.on_snapshot(member, items) {
                    broadcaster.publish(event);
                }
            }
        }
        Err(e) => {
            tracing::error!("{}: membership snapshot failed: {}", address, e);
            broadcaster.fail(MeshError::Discovery(e.to_string()));
            return;
        }
    }

    while let Some(next) = live.next().await {
        match next {
            Ok(event) => {
                if event.from == address {
                    continue;
                }
                tracing::debug!("{}: {:?} from {}", address, event.kind, event.from);
                if let Some(event) = members_state.on_cluster_event(event) {
                    broadcaster.publish(event);
                }
            }
            Err(e) => {
                tracing::error!("{}: membership source failed: {}", address, e);
                broadcaster.fail(MeshError::Discovery(e.to_string()));
                return;
            }
        }
    }

    tracing::info!("{}: membership source closed", address);
    broadcaster.complete();
}

#[async_trait]
impl Discovery for DiscoveryHandle {
    fn events(&self) -> DiscoveryEvents {
        // Subscribe first so the first subscriber observes the whole reconciliation.
        let events = self.broadcaster.subscribe();
        if self.broadcaster.is_terminated() {
            tracing::debug!("{}: late subscriber gets the replay only", self.address);
        }

        if let Some(cluster) = &self.cluster
            && !self.destroyed.load(Ordering::SeqCst)
            && !self.started.swap(true, Ordering::SeqCst)
        {
            self.start_reconciler(cluster.clone());
        }

        events
    }

    async fn destroy(&self) -> MeshResult<String> {
        let Some(cluster) = &self.cluster else {
            return Ok(NO_CLUSTER_MESSAGE.to_string());
        };

        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(destroyed_message(&self.address));
        }

        let reconciler = self
            .reconciler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reconciler) = reconciler {
            reconciler.abort();
        }
        tracing::debug!(
            "{}: completing {} subscriber(s)",
            self.address,
            self.broadcaster.subscriber_count()
        );
        self.broadcaster.complete();

        cluster
            .destroy()
            .await
            .map_err(|e| MeshError::Discovery(format!("failed to leave cluster: {}", e)))?;

        tracing::info!("{}", destroyed_message(&self.address));
        Ok(destroyed_message(&self.address))
    }
}
