//! Membership Source Contract
//!
//! The discovery engine does not care how members find each other. Anything that can
//! report membership changes and answer a snapshot query can back it: the in-process
//! [`ClusterHub`](super::local::ClusterHub), the UDP [`MembershipService`](super::service::MembershipService),
//! or a test double.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::sync::Arc;

use super::types::{ClusterEvent, ClusterOptions, MembersData};

/// Live membership changes. An `Err` item is terminal.
pub type ClusterEvents = BoxStream<'static, Result<ClusterEvent>>;

/// Builds (and joins) a membership source for one node.
pub type ClusterFactory = Arc<
    dyn Fn(ClusterOptions) -> BoxFuture<'static, Result<Arc<dyn MembershipSource>>> + Send + Sync,
>;

#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Subscribes to membership changes from the moment of the call onwards.
    fn listen(&self) -> ClusterEvents;

    /// Returns every other member currently known, with the endpoints it advertises.
    async fn current_members(&self) -> Result<MembersData>;

    /// Leaves the cluster and releases sockets and background tasks.
    async fn destroy(&self) -> Result<()>;
}
