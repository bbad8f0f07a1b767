//! Membership Module Tests
//!
//! Validates the fundamental components of the cluster membership layer.
//!
//! ## Test Scopes
//! - **Data Structures**: Address parsing and validation, wire protocol serialization.
//! - **Cluster Hub**: Join/leave announcements and snapshot contents.
//! - **Gossip Service**: Member merging, failure detection and incarnation-based conflict resolution.

#[cfg(test)]
mod tests {
    use crate::membership::local::ClusterHub;
    use crate::membership::service::MembershipService;
    use crate::membership::source::MembershipSource;
    use crate::membership::types::{
        Address, ClusterEventType, ClusterOptions, GossipMessage, Node, NodeId, NodeState,
    };
    use crate::registry::types::{AsyncModel, Endpoint};
    use futures::{FutureExt, StreamExt};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn endpoint(qualifier: &str, address: &Address) -> Endpoint {
        let (service_name, method_name) = qualifier.split_once('/').unwrap();
        Endpoint {
            qualifier: qualifier.to_string(),
            service_name: service_name.to_string(),
            method_name: method_name.to_string(),
            async_model: AsyncModel::RequestResponse,
            address: address.clone(),
        }
    }

    fn remote_node(name: &str, port: u16, incarnation: u64, state: NodeState) -> Node {
        let address = Address::new(name, port);
        Node {
            id: NodeId(name.to_string()),
            items: vec![endpoint("greet/hello", &address)],
            address,
            gossip_addr: format!("127.0.0.1:{}", port).parse().unwrap(),
            state,
            incarnation,
            last_seen: None,
        }
    }

    async fn gossip_service() -> Arc<MembershipService> {
        MembershipService::new(ClusterOptions {
            address: Address::new("127.0.0.1", 0),
            seed_address: vec![],
            items_to_publish: vec![],
        })
        .await
        .expect("Failed to create service")
    }

    // ============================================================
    // ADDRESS TESTS
    // ============================================================

    #[test]
    fn test_address_parse_and_display() {
        let address: Address = "a:1".parse().expect("valid address");

        assert_eq!(address, Address::new("a", 1));
        assert_eq!(address.to_string(), "a:1");
    }

    #[test]
    fn test_address_rejects_malformed_values() {
        for value in ["", "a", ":1", "a:0", "a:port", "a b:1", "a:99999"] {
            assert!(
                value.parse::<Address>().is_err(),
                "'{}' should be rejected",
                value
            );
        }
    }

    #[test]
    fn test_address_ordering_is_usable_as_key() {
        use std::collections::BTreeSet;

        let set: BTreeSet<Address> = ["b:1", "a:2", "a:1", "a:1"]
            .iter()
            .map(|value| value.parse().unwrap())
            .collect();

        let ordered: Vec<String> = set.iter().map(|a| a.to_string()).collect();
        assert_eq!(ordered, vec!["a:1", "a:2", "b:1"]);
    }

    // ============================================================
    // NODE / GOSSIP MESSAGE TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        assert_ne!(NodeId::new(), NodeId::new(), "Each NodeId should be unique");
    }

    #[test]
    fn test_node_bincode_serialization() {
        let mut node = remote_node("node-a", 5000, 100, NodeState::Suspect);
        node.last_seen = Some(Instant::now());

        // bincode is the gossip wire format
        let encoded = bincode::serialize(&node).expect("Bincode serialization failed");
        let restored: Node =
            bincode::deserialize(&encoded).expect("Bincode deserialization failed");

        assert_eq!(restored.id, node.id);
        assert_eq!(restored.address, node.address);
        assert_eq!(restored.items, node.items);
        assert_eq!(restored.state, NodeState::Suspect);
        assert_eq!(restored.incarnation, 100);
        // last_seen is skipped in serde
        assert!(restored.last_seen.is_none());
    }

    #[test]
    fn test_gossip_ack_serialization() {
        let msg = GossipMessage::Ack {
            from: NodeId("responder".to_string()),
            incarnation: 10,
            members: vec![
                remote_node("node-1", 5001, 1, NodeState::Alive),
                remote_node("node-2", 5002, 2, NodeState::Dead),
            ],
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Ack");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Ack");

        if let GossipMessage::Ack {
            from,
            incarnation,
            members,
        } = decoded
        {
            assert_eq!(from.0, "responder");
            assert_eq!(incarnation, 10);
            assert_eq!(members.len(), 2);
            assert_eq!(members[1].state, NodeState::Dead);
        } else {
            panic!("Wrong message type");
        }
    }

    // ============================================================
    // CLUSTER HUB TESTS
    // ============================================================

    #[tokio::test]
    async fn test_hub_announces_join_to_others_only() {
        // ARRANGE
        let hub = ClusterHub::new();
        let a = Address::new("a", 1);
        let b = Address::new("b", 1);
        let member_a = hub.join(a.clone(), vec![endpoint("greet/hello", &a)]);
        let mut events_a = member_a.listen();

        // ACT
        let member_b = hub.join(b.clone(), vec![endpoint("greet/bye", &b)]);
        let mut events_b = member_b.listen();

        // ASSERT
        let event = events_a.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ClusterEventType::Added);
        assert_eq!(event.from, b);
        assert_eq!(event.items[0].qualifier, "greet/bye");

        let pending = tokio::time::timeout(Duration::from_millis(50), events_b.next()).await;
        assert!(pending.is_err(), "A member must not hear about itself");
    }

    #[tokio::test]
    async fn test_hub_snapshot_excludes_self() {
        let hub = ClusterHub::new();
        let a = Address::new("a", 1);
        let b = Address::new("b", 1);
        let member_a = hub.join(a.clone(), vec![endpoint("greet/hello", &a)]);
        hub.join(b.clone(), vec![]);

        let snapshot = member_a.current_members().await.unwrap();

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&b));
        assert!(snapshot[&b].is_empty());
    }

    #[tokio::test]
    async fn test_hub_leave_announces_removal_and_closes_own_listeners() {
        // ARRANGE
        let hub = ClusterHub::new();
        let a = Address::new("a", 1);
        let b = Address::new("b", 1);
        let member_a = hub.join(a.clone(), vec![endpoint("greet/hello", &a)]);
        let member_b = hub.join(b.clone(), vec![endpoint("greet/bye", &b)]);
        let mut events_a = member_a.listen();
        let mut events_b = member_b.listen();

        // ACT
        member_b.destroy().await.unwrap();

        // ASSERT
        let event = events_a.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ClusterEventType::Removed);
        assert_eq!(event.from, b);
        assert!(events_b.next().await.is_none());
        assert_eq!(hub.member_count(), 1);
    }

    #[tokio::test]
    async fn test_hub_rejoin_is_an_update() {
        let hub = ClusterHub::new();
        let a = Address::new("a", 1);
        let b = Address::new("b", 1);
        let member_a = hub.join(a.clone(), vec![]);
        hub.join(b.clone(), vec![endpoint("greet/hello", &b)]);
        let mut events = member_a.listen();

        hub.join(b.clone(), vec![endpoint("greet/bye", &b)]);

        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ClusterEventType::Updated);
        assert_eq!(event.items[0].qualifier, "greet/bye");
    }

    // ============================================================
    // GOSSIP SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_membership_service_creation() {
        let service = gossip_service().await;

        // Should have itself as a member
        assert_eq!(service.members.len(), 1);

        let alive = service.get_alive_members();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].id, service.local_node.id);

        // ...but never reports itself to discovery
        assert!(service.current_members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_new_member_emits_added() {
        // ARRANGE
        let service = gossip_service().await;
        let mut events = service.listen();

        // ACT
        service.merge_member(remote_node("node-b", 7001, 1, NodeState::Alive));

        // ASSERT
        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ClusterEventType::Added);
        assert_eq!(event.from, Address::new("node-b", 7001));

        let snapshot = service.current_members().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[&Address::new("node-b", 7001)][0].qualifier, "greet/hello");
    }

    #[tokio::test]
    async fn test_merge_ignores_unknown_dead_member() {
        let service = gossip_service().await;

        service.merge_member(remote_node("node-b", 7001, 3, NodeState::Dead));

        assert_eq!(service.members.len(), 1);
    }

    // ============================================================
    // INCARNATION TESTS (critical for CRDT-like conflict resolution)
    // ============================================================

    #[tokio::test]
    async fn test_higher_incarnation_wins() {
        // ARRANGE
        let service = gossip_service().await;
        service.merge_member(remote_node("node-b", 7001, 1, NodeState::Alive));
        let mut events = service.listen();

        // ACT: a stale report is ignored, a newer one is applied
        service.merge_member(remote_node("node-b", 7001, 0, NodeState::Dead));
        let after_stale = service.members.get(&NodeId("node-b".into())).unwrap().state.clone();

        service.merge_member(remote_node("node-b", 7001, 2, NodeState::Dead));

        // ASSERT
        assert_eq!(after_stale, NodeState::Alive);

        let member = service.members.get(&NodeId("node-b".into())).unwrap().clone();
        assert_eq!(member.state, NodeState::Dead);
        assert_eq!(member.incarnation, 2);

        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ClusterEventType::Removed);
        assert!(service.current_members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refutes_suspicion_about_itself() {
        // ARRANGE
        let service = gossip_service().await;
        let me = service.local_node.id.clone();
        let src = service.local_node.gossip_addr;

        // ACT
        service
            .handle_message(
                GossipMessage::Suspect {
                    node_id: me.clone(),
                    incarnation: 1,
                },
                src,
            )
            .await
            .unwrap();

        // ASSERT
        let record = service.members.get(&me).unwrap().clone();
        assert_eq!(record.state, NodeState::Alive);
        assert_eq!(record.incarnation, 2, "Refutation must bump the incarnation");
    }

    #[tokio::test]
    async fn test_suspect_then_alive_with_same_incarnation() {
        let service = gossip_service().await;
        let src = service.local_node.gossip_addr;
        let id = NodeId("node-b".into());
        service.merge_member(remote_node("node-b", 7001, 4, NodeState::Alive));

        service
            .handle_message(
                GossipMessage::Suspect {
                    node_id: id.clone(),
                    incarnation: 4,
                },
                src,
            )
            .await
            .unwrap();
        assert_eq!(service.members.get(&id).unwrap().state, NodeState::Suspect);

        service
            .handle_message(
                GossipMessage::Alive {
                    node_id: id.clone(),
                    incarnation: 4,
                },
                src,
            )
            .await
            .unwrap();
        assert_eq!(service.members.get(&id).unwrap().state, NodeState::Alive);
    }

    #[tokio::test]
    async fn test_failure_detection_suspects_then_removes() {
        // ARRANGE
        let service = gossip_service().await;
        let id = NodeId("node-b".into());
        service.merge_member(remote_node("node-b", 7001, 1, NodeState::Alive));
        let mut events = service.listen();
        let start = Instant::now();

        // ACT + ASSERT
        service.detect_failures(start + Duration::from_secs(6)).await;
        assert_eq!(service.members.get(&id).unwrap().state, NodeState::Suspect);

        service.detect_failures(start + Duration::from_secs(30)).await;
        assert_eq!(service.members.get(&id).unwrap().state, NodeState::Dead);

        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ClusterEventType::Removed);
        assert_eq!(event.from, Address::new("node-b", 7001));
    }

    #[tokio::test]
    async fn test_restart_on_same_address_replaces_old_record() {
        // ARRANGE
        let service = gossip_service().await;
        let old_id = NodeId("node-b".into());
        service.merge_member(remote_node("node-b", 7001, 1, NodeState::Alive));
        let start = Instant::now();
        service.detect_failures(start + Duration::from_secs(6)).await;
        assert_eq!(service.members.get(&old_id).unwrap().state, NodeState::Suspect);
        let mut events = service.listen();

        // ACT
        let mut restarted = remote_node("node-b", 7001, 1, NodeState::Alive);
        restarted.id = NodeId("node-b-restarted".into());
        service.merge_member(restarted.clone());
        service.detect_failures(start + Duration::from_secs(17)).await;

        // ASSERT
        assert!(!service.members.contains_key(&old_id));
        assert_ne!(service.members.get(&restarted.id).unwrap().state, NodeState::Dead);

        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ClusterEventType::Added);
        assert_eq!(event.from, Address::new("node-b", 7001));
        assert!(events.next().now_or_never().is_none(), "No removal may follow");
    }

    #[tokio::test]
    async fn test_dead_record_sharing_a_live_address_is_not_announced() {
        // ARRANGE
        let service = gossip_service().await;
        let start = Instant::now();

        let mut stale = remote_node("node-b", 7001, 1, NodeState::Suspect);
        stale.last_seen = Some(start);
        let mut live = remote_node("node-b", 7001, 1, NodeState::Alive);
        live.id = NodeId("node-b-restarted".into());
        live.last_seen = Some(start + Duration::from_secs(15));

        service.members.insert(stale.id.clone(), stale.clone());
        service.members.insert(live.id.clone(), live.clone());
        let mut events = service.listen();

        // ACT
        service.detect_failures(start + Duration::from_secs(17)).await;

        // ASSERT
        assert_eq!(service.members.get(&stale.id).unwrap().state, NodeState::Dead);
        assert_eq!(service.members.get(&live.id).unwrap().state, NodeState::Alive);
        assert!(events.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_join_through_seed_over_udp() {
        // ARRANGE
        let seed = gossip_service().await;
        seed.clone().start().await;
        let seed_address = Address::from(seed.local_node.gossip_addr);

        // ACT
        let joiner = MembershipService::new(ClusterOptions {
            address: Address::new("127.0.0.1", 0),
            seed_address: vec![seed_address],
            items_to_publish: vec![],
        })
        .await
        .unwrap();

        // ASSERT
        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if seed.members.contains_key(&joiner.local_node.id) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(joined.is_ok(), "Seed should learn about the joiner");

        seed.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_ends_listeners() {
        let service = gossip_service().await;
        service.clone().start().await;
        let mut events = service.listen();

        service.destroy().await.unwrap();

        assert!(events.next().await.is_none());
    }
}
