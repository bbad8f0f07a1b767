use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Instant;

use crate::error::ValidationError;
use crate::registry::types::Endpoint;

/// Network identity of a node: `host:port`.
///
/// Used as the key of every per-member map in the mesh, so it is hashable and ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Checks that the address can identify a node: non-empty host without separators
    /// or whitespace, and a non-zero port.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidAddress {
            value: self.to_string(),
            reason: reason.to_string(),
        };

        if self.host.is_empty() {
            return Err(invalid("host is empty"));
        }
        if self
            .host
            .chars()
            .any(|c| c.is_whitespace() || c == ':' || c == '/')
        {
            return Err(invalid("host contains illegal characters"));
        }
        if self.port == 0 {
            return Err(invalid("port must be greater than 0"));
        }

        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::InvalidAddress {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = value
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected <host>:<port>"))?;
        let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;

        let address = Address::new(host, port);
        address.validate()?;
        Ok(address)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::new(addr.ip().to_string(), addr.port())
    }
}

/// Point-in-time view of the cluster: every known member and the endpoints it advertises.
pub type MembersData = BTreeMap<Address, Vec<Endpoint>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEventType {
    Added,
    Updated,
    Removed,
}

/// Raw membership change as reported by a membership source.
///
/// Sources may deliver duplicates; the discovery engine is responsible for
/// collapsing them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub kind: ClusterEventType,
    pub items: Vec<Endpoint>,
    pub from: Address,
}

/// What a membership source needs to join the cluster.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub address: Address,
    pub seed_address: Vec<Address>,
    pub items_to_publish: Vec<Endpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

/// A member as seen by the gossip protocol.
///
/// `address` is the mesh identity the node advertises its endpoints under,
/// `gossip_addr` is the resolved UDP socket used for protocol traffic.
/// The `incarnation` field is a logical clock used to order updates and resolve conflicts
/// (e.g., refuting a false "Suspect" claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: Address,
    pub gossip_addr: SocketAddr,
    pub items: Vec<Endpoint>,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// The wire protocol for inter-node gossip.
///
/// - `Ping/Ack`: Used for liveness checks and state synchronization.
/// - `Join`: Sent by new nodes to seed nodes to enter the cluster.
/// - `Suspect/Alive`: Disseminates changes in node health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: NodeId,
        incarnation: u64,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join {
        node: Node,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },
}
