use futures::Stream;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::error::MeshResult;
use crate::membership::source::ClusterFactory;
use crate::membership::types::Address;
use crate::registry::types::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryEventType {
    Registered,
    Unregistered,
    /// The member is present but currently advertises nothing.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    pub kind: DiscoveryEventType,
    pub items: Vec<Endpoint>,
    pub from: Address,
}

impl DiscoveryEvent {
    pub fn registered(from: Address, items: Vec<Endpoint>) -> Self {
        Self {
            kind: DiscoveryEventType::Registered,
            items,
            from,
        }
    }

    pub fn unregistered(from: Address, items: Vec<Endpoint>) -> Self {
        Self {
            kind: DiscoveryEventType::Unregistered,
            items,
            from,
        }
    }

    pub fn idle(from: Address) -> Self {
        Self {
            kind: DiscoveryEventType::Idle,
            items: Vec::new(),
            from,
        }
    }
}

#[derive(Clone)]
pub struct DiscoveryOptions {
    pub address: Address,
    pub items_to_publish: Vec<Endpoint>,
    pub seed_address: Vec<Address>,
    /// Membership source to reconcile. `None` starts discovery in degraded mode.
    pub cluster: Option<ClusterFactory>,
}

/// Builds a discovery instance for a node; the orchestrator's pluggable seam.
pub type DiscoveryFactory = Arc<
    dyn Fn(DiscoveryOptions) -> BoxFuture<'static, MeshResult<Arc<dyn Discovery>>> + Send + Sync,
>;

#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    /// Subscribes to reconciled discovery events. An `Err` item is terminal.
    fn events(&self) -> DiscoveryEvents;

    /// Completes every subscription and leaves the cluster. Idempotent.
    async fn destroy(&self) -> MeshResult<String>;
}

/// One subscriber's independent queue of discovery events.
pub struct DiscoveryEvents {
    receiver: mpsc::UnboundedReceiver<MeshResult<DiscoveryEvent>>,
}

impl DiscoveryEvents {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<MeshResult<DiscoveryEvent>>) -> Self {
        Self { receiver }
    }
}

impl Stream for DiscoveryEvents {
    type Item = MeshResult<DiscoveryEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
