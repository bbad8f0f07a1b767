//! In-process membership hub.
//!
//! Every node created against the same [`ClusterHub`] sees every other node immediately.
//! Seeds are irrelevant here: the hub itself is the shared medium, the way a set of
//! co-located workers share one message bus.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::source::{ClusterEvents, ClusterFactory, MembershipSource};
use super::types::{Address, ClusterEvent, ClusterEventType, ClusterOptions, MembersData};
use crate::registry::types::Endpoint;

struct Listener {
    owner: Address,
    sender: mpsc::UnboundedSender<ClusterEvent>,
}

#[derive(Default)]
pub struct ClusterHub {
    members: DashMap<Address, Vec<Endpoint>>,
    listeners: DashMap<Uuid, Listener>,
}

impl ClusterHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Factory handing out one hub member per node.
    pub fn factory(self: &Arc<Self>) -> ClusterFactory {
        let hub = self.clone();
        Arc::new(move |options: ClusterOptions| {
            let hub = hub.clone();
            async move {
                let member = hub.join(options.address, options.items_to_publish);
                anyhow::Ok(member as Arc<dyn MembershipSource>)
            }
            .boxed()
        })
    }

    /// Adds a member and announces it to every other member's listeners.
    pub fn join(self: &Arc<Self>, address: Address, items: Vec<Endpoint>) -> Arc<HubMember> {
        tracing::info!("{} joined the cluster hub with {} endpoint(s)", address, items.len());

        let kind = if self.members.insert(address.clone(), items.clone()).is_some() {
            ClusterEventType::Updated
        } else {
            ClusterEventType::Added
        };

        self.broadcast(ClusterEvent {
            kind,
            items,
            from: address.clone(),
        });

        Arc::new(HubMember {
            hub: self.clone(),
            address,
        })
    }

    /// Removes a member, closes its listeners and announces the departure.
    pub fn leave(&self, address: &Address) {
        let Some((_, items)) = self.members.remove(address) else {
            tracing::debug!("{} is not a member of the cluster hub", address);
            return;
        };

        self.listeners.retain(|_, listener| &listener.owner != address);

        tracing::info!("{} left the cluster hub", address);

        self.broadcast(ClusterEvent {
            kind: ClusterEventType::Removed,
            items,
            from: address.clone(),
        });
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    fn broadcast(&self, event: ClusterEvent) {
        self.listeners.retain(|_, listener| {
            if listener.owner == event.from {
                return true;
            }
            listener.sender.send(event.clone()).is_ok()
        });
    }
}

/// One node's view of a [`ClusterHub`].
pub struct HubMember {
    hub: Arc<ClusterHub>,
    address: Address,
}

#[async_trait]
impl MembershipSource for HubMember {
    fn listen(&self) -> ClusterEvents {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.hub.listeners.insert(
            Uuid::new_v4(),
            Listener {
                owner: self.address.clone(),
                sender,
            },
        );

        futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|event| (Ok(event), receiver))
        })
        .boxed()
    }

    async fn current_members(&self) -> Result<MembersData> {
        Ok(self
            .hub
            .members
            .iter()
            .filter(|entry| entry.key() != &self.address)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn destroy(&self) -> Result<()> {
        self.hub.leave(&self.address);
        Ok(())
    }
}
