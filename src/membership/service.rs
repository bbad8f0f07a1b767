use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use super::source::{ClusterEvents, ClusterFactory, MembershipSource};
use super::types::{
    Address, ClusterEvent, ClusterEventType, ClusterOptions, GossipMessage, MembersData, Node,
    NodeId, NodeState,
};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// SWIM-like UDP gossip membership.
///
/// Each node binds a UDP socket on its own mesh address and carries the endpoints it
/// publishes in its [`Node`] record, so the member list doubles as the service catalog feed.
pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    listeners: DashMap<Uuid, mpsc::UnboundedSender<ClusterEvent>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Factory joining the gossip cluster on each node's own address.
pub fn gossip_cluster() -> ClusterFactory {
    Arc::new(|options: ClusterOptions| {
        async move {
            let service = MembershipService::new(options).await?;
            service.clone().start().await;
            anyhow::Ok(service as Arc<dyn MembershipSource>)
        }
        .boxed()
    })
}

async fn resolve(address: &Address) -> Result<SocketAddr> {
    tokio::net::lookup_host(address.to_string())
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("Address {} does not resolve", address))
}

impl MembershipService {
    pub async fn new(options: ClusterOptions) -> Result<Arc<Self>> {
        let bind_addr = resolve(&options.address).await?;
        let socket = UdpSocket::bind(bind_addr).await?;
        let gossip_addr = socket.local_addr()?;
        let incarnation_counter = Arc::new(RwLock::new(1));
        let current_inc = *incarnation_counter.read().await;
        let local_node = Node {
            id: NodeId::new(),
            address: options.address.clone(),
            gossip_addr,
            items: options.items_to_publish,
            state: NodeState::Alive,
            incarnation: current_inc,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());
        if !options.seed_address.is_empty() {
            info!(
                "Joining cluster via {} seed node(s)",
                options.seed_address.len()
            );

            let msg = GossipMessage::Join {
                node: local_node.clone(),
            };
            let encoded = bincode::serialize(&msg)?;

            for seed_node in options.seed_address.iter() {
                let seed_addr = resolve(seed_node).await?;
                socket.send_to(&encoded, seed_addr).await?;
                info!("Sent join request to {}", seed_node);
            }
        }

        Ok(Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: incarnation_counter,
            listeners: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service on {}...", self.local_node.address);

        let gossip_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            })
        };

        let receive_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        };

        let failure_detection_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            })
        };

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([gossip_handle, receive_handle, failure_detection_handle]);

        tracing::info!("All background tasks started");
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn emit(&self, kind: ClusterEventType, node: &Node) {
        if node.id == self.local_node.id {
            return;
        }

        let event = ClusterEvent {
            kind,
            items: node.items.clone(),
            from: node.address.clone(),
        };

        self.listeners
            .retain(|_, listener| listener.send(event.clone()).is_ok());
    }

    /// Announces a departure unless another live record still holds the same address.
    fn emit_departure(&self, node: &Node) {
        let still_served = self.members.iter().any(|entry| {
            let member = entry.value();
            member.id != node.id && member.address == node.address && member.state != NodeState::Dead
        });

        if still_served {
            tracing::debug!(
                "{:?} left but {} is served by another member, not announcing",
                node.id,
                node.address
            );
            return;
        }
        self.emit(ClusterEventType::Removed, node);
    }

    /// A node restarted on the same address comes back under a fresh id. The old record
    /// is dropped without an event so its eventual death cannot unregister the new one.
    fn evict_replaced(&self, node: &Node) {
        self.members.retain(|id, member| {
            let replaced =
                *id != node.id && *id != self.local_node.id && member.address == node.address;
            if replaced {
                tracing::info!("{:?} at {} replaced by {:?}", id, member.address, node.id);
            }
            !replaced
        });
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let alive_members: Vec<Node> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_node.id
                        && entry.value().state == NodeState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if alive_members.is_empty() {
                continue;
            }

            let target = {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..alive_members.len());
                &alive_members[idx]
            };

            let incarnation = *self.incarnation.read().await;
            let msg = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation,
            };

            if let Ok(encoded) = bincode::serialize(&msg) {
                if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                    tracing::warn!("Failed to send ping to {:?}: {}", target.id, e);
                } else {
                    tracing::debug!("Sent ping to {:?}", target.id);
                }
            } else {
                tracing::error!("Failed to serialize GossipMessage::Ping");
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub(crate) async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                self.handle_ping(from, incarnation, src).await?;
            }

            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members).await?;
            }

            GossipMessage::Join { node } => {
                self.handle_join(node).await?;
            }

            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.handle_suspect(node_id, incarnation).await?;
            }

            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation).await?;
            }
        }

        Ok(())
    }

    async fn handle_ping(
        &self,
        from: NodeId,
        from_incarnation: u64,
        src: SocketAddr,
    ) -> Result<()> {
        tracing::debug!("Received ping from {:?}", from);

        // A ping carries no endpoints, so an unknown sender is learned later
        // through its join or through someone else's ack.
        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());

            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        } else {
            tracing::debug!("Ping from unknown member {:?} at {}", from, src);
        }

        let all_members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let my_incarnation = *self.incarnation.read().await;
        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: my_incarnation,
            members: all_members,
        };

        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        tracing::debug!("Sent ack to {:?} with {} members", from, self.members.len());

        Ok(())
    }

    async fn handle_ack(
        &self,
        from: NodeId,
        from_incarnation: u64,
        members: Vec<Node>,
    ) -> Result<()> {
        tracing::debug!(
            "Received ack from {:?} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        }

        for member in members {
            self.merge_member(member);
        }

        Ok(())
    }

    pub(crate) fn merge_member(&self, new_member: Node) {
        if new_member.id == self.local_node.id {
            return;
        }

        let mut event = None;

        match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if new_member.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {:?}: inc {} -> {}",
                        new_member.id,
                        existing.incarnation,
                        new_member.incarnation,
                    );

                    if existing.state == NodeState::Dead && new_member.state != NodeState::Dead {
                        event = Some(ClusterEventType::Added);
                    } else if existing.state != NodeState::Dead
                        && new_member.state == NodeState::Dead
                    {
                        event = Some(ClusterEventType::Removed);
                    }

                    existing.state = new_member.state;
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{:?} refuted suspicion", new_member.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }

                if let Some(kind) = event {
                    let node = existing.clone();
                    drop(existing);
                    match kind {
                        ClusterEventType::Removed => self.emit_departure(&node),
                        kind => self.emit(kind, &node),
                    }
                }
            }
            None => {
                if new_member.state == NodeState::Dead {
                    return;
                }

                tracing::info!(
                    "Discovered new member: {:?} at {}",
                    new_member.id,
                    new_member.address
                );

                self.evict_replaced(&new_member);

                let mut member_with_timestamp = new_member;
                member_with_timestamp.last_seen = Some(Instant::now());

                self.members.insert(
                    member_with_timestamp.id.clone(),
                    member_with_timestamp.clone(),
                );
                self.emit(ClusterEventType::Added, &member_with_timestamp);
            }
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) -> Result<()> {
        if node_id == self.local_node.id {
            let my_incarnation = {
                let mut inc = self.incarnation.write().await;
                if incarnation < *inc {
                    return Ok(());
                }
                *inc = incarnation + 1;
                *inc
            };

            tracing::info!(
                "Refuting suspicion about {} (inc={})",
                self.local_node.address,
                my_incarnation
            );

            if let Some(mut me) = self.members.get_mut(&node_id) {
                me.incarnation = my_incarnation;
                me.state = NodeState::Alive;
                me.last_seen = Some(Instant::now());
            }

            let msg = GossipMessage::Alive {
                node_id,
                incarnation: my_incarnation,
            };
            self.broadcast_message(msg).await;

            return Ok(());
        }

        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation >= existing.incarnation && existing.state == NodeState::Alive {
                    tracing::info!("Node {:?} at {} suspected", existing.id, existing.address);
                    existing.state = NodeState::Suspect;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Suspected node {:?} doesn't exist", node_id);
            }
        }

        Ok(())
    }

    async fn handle_alive(&self, node_id: NodeId, incarnation: u64) -> Result<()> {
        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation > existing.incarnation {
                    tracing::info!(
                        "Node {:?} at {} is now Alive (inc={})",
                        existing.id,
                        existing.address,
                        incarnation
                    );
                    let revived = existing.state == NodeState::Dead;
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());

                    if revived {
                        let node = existing.clone();
                        drop(existing);
                        self.emit(ClusterEventType::Added, &node);
                    }
                } else if incarnation == existing.incarnation
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!(
                        "Node {:?} at {} successfully refuted suspicion",
                        existing.id,
                        existing.address,
                    );
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Alive message for unknown node {:?}", node_id);
            }
        }

        Ok(())
    }

    async fn handle_join(&self, mut node: Node) -> Result<()> {
        tracing::info!("Node {:?} joining cluster at {}", node.id, node.address);

        node.last_seen = Some(Instant::now());
        node.state = NodeState::Alive;
        self.evict_replaced(&node);

        let previous = self.members.insert(node.id.clone(), node.clone());
        let kind = match previous {
            Some(previous) if previous.state != NodeState::Dead => ClusterEventType::Updated,
            _ => ClusterEventType::Added,
        };
        self.emit(kind, &node);

        tracing::info!("Cluster size now: {}", self.members.len());

        Ok(())
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            self.detect_failures(Instant::now()).await;
        }
    }

    pub(crate) async fn detect_failures(&self, now: Instant) {
        let mut messages_to_broadcast = Vec::new();
        let mut departed = Vec::new();

        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();

            if member.id == self.local_node.id {
                continue;
            }

            if let Some(last_seen) = member.last_seen {
                let elapsed = now.saturating_duration_since(last_seen);

                match member.state {
                    NodeState::Alive => {
                        if elapsed > SUSPECT_TIMEOUT {
                            tracing::warn!(
                                "Node {:?} suspected (no contact for {:?})",
                                member.id,
                                elapsed
                            );

                            member.state = NodeState::Suspect;

                            messages_to_broadcast.push(GossipMessage::Suspect {
                                node_id: member.id.clone(),
                                incarnation: member.incarnation,
                            });
                        }
                    }

                    NodeState::Suspect => {
                        if elapsed > DEAD_TIMEOUT {
                            tracing::info!(
                                "Node {:?} declared DEAD (no contact for {:?})",
                                member.id,
                                elapsed
                            );

                            member.state = NodeState::Dead;
                            departed.push(member.clone());
                        }
                    }

                    NodeState::Dead => {
                        tracing::trace!("Node {:?} DEAD (no contact for {:?})", member.id, elapsed);
                    }
                }
            } else {
                member.last_seen = Some(now);
            }
        }

        for node in departed {
            self.emit_departure(&node);
        }

        for msg in messages_to_broadcast {
            self.broadcast_message(msg).await;
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let Ok(encoded) = bincode::serialize(&msg) else {
            tracing::error!("Failed to serialize gossip broadcast");
            return;
        };

        let targets: Vec<(NodeId, SocketAddr)> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local_node.id && entry.value().state == NodeState::Alive
            })
            .map(|entry| (entry.value().id.clone(), entry.value().gossip_addr))
            .collect();

        for (id, addr) in targets {
            if let Err(e) = self.socket.send_to(&encoded, addr).await {
                tracing::warn!("Failed to broadcast to {:?}: {}", id, e);
            }
        }
    }
}

#[async_trait]
impl MembershipSource for MembershipService {
    fn listen(&self) -> ClusterEvents {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners.insert(Uuid::new_v4(), sender);

        futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|event| (Ok(event), receiver))
        })
        .boxed()
    }

    async fn current_members(&self) -> Result<MembersData> {
        Ok(self
            .members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local_node.id && entry.value().state != NodeState::Dead
            })
            .map(|entry| (entry.value().address.clone(), entry.value().items.clone()))
            .collect())
    }

    async fn destroy(&self) -> Result<()> {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for task in tasks {
            task.abort();
        }
        self.listeners.clear();

        tracing::info!("Membership service on {} stopped", self.local_node.address);
        Ok(())
    }
}
