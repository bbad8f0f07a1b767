//! Discovery Module Tests
//!
//! ## Test Scopes
//! - **Reconciliation**: Snapshot and live passes, duplicate suppression, idle members.
//! - **Multicast**: Late subscribers and terminal signals.
//! - **Lifecycle**: Degraded mode, validation, failure propagation and idempotent destroy.

#[cfg(test)]
mod tests {
    use crate::discovery::broadcast::EventBroadcaster;
    use crate::discovery::engine::{
        MembersState, NO_CLUSTER_MESSAGE, create_discovery, destroyed_message,
    };
    use crate::discovery::types::{
        Discovery, DiscoveryEvent, DiscoveryEventType, DiscoveryEvents, DiscoveryOptions,
    };
    use crate::error::{MeshError, ValidationError};
    use crate::membership::local::ClusterHub;
    use crate::membership::source::{ClusterEvents, ClusterFactory, MembershipSource};
    use crate::membership::types::{
        Address, ClusterEvent, ClusterEventType, ClusterOptions, MembersData,
    };
    use crate::registry::types::{AsyncModel, Endpoint, ServiceDefinition};
    use async_trait::async_trait;
    use futures::{FutureExt, StreamExt, stream};
    use std::sync::Arc;
    use std::time::Duration;

    fn address(value: &str) -> Address {
        value.parse().unwrap()
    }

    fn endpoints(owner: &Address) -> Vec<Endpoint> {
        ServiceDefinition::new("greet")
            .method("hello", AsyncModel::RequestResponse)
            .endpoints(owner)
    }

    fn options(own: &str, cluster: Option<ClusterFactory>) -> DiscoveryOptions {
        let own = address(own);
        DiscoveryOptions {
            items_to_publish: endpoints(&own),
            address: own,
            seed_address: vec![],
            cluster,
        }
    }

    async fn next_event(events: &mut DiscoveryEvents) -> DiscoveryEvent {
        tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .expect("Timed out waiting for a discovery event")
            .expect("Stream ended unexpectedly")
            .expect("Discovery failed")
    }

    struct FailingSource {
        snapshot_fails: bool,
    }

    #[async_trait]
    impl MembershipSource for FailingSource {
        fn listen(&self) -> ClusterEvents {
            if self.snapshot_fails {
                stream::pending().boxed()
            } else {
                stream::iter(vec![Err(anyhow::anyhow!("link lost"))]).boxed()
            }
        }

        async fn current_members(&self) -> anyhow::Result<MembersData> {
            if self.snapshot_fails {
                Err(anyhow::anyhow!("snapshot unavailable"))
            } else {
                Ok(MembersData::new())
            }
        }

        async fn destroy(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn failing_cluster(snapshot_fails: bool) -> ClusterFactory {
        let source: Arc<dyn MembershipSource> = Arc::new(FailingSource { snapshot_fails });
        Arc::new(move |_options: ClusterOptions| {
            let source = source.clone();
            async move { anyhow::Ok(source) }.boxed()
        })
    }

    // ============================================================
    // MEMBERS STATE TESTS
    // ============================================================

    #[test]
    fn test_snapshot_registers_once_and_reports_idle() {
        let mut state = MembersState::default();
        let b = address("b:1");
        let c = address("c:1");

        let first = state.on_snapshot(b.clone(), endpoints(&b)).unwrap();
        assert_eq!(first.kind, DiscoveryEventType::Registered);
        assert!(state.on_snapshot(b.clone(), endpoints(&b)).is_none());

        let idle = state.on_snapshot(c.clone(), vec![]).unwrap();
        assert_eq!(idle.kind, DiscoveryEventType::Idle);
        assert!(idle.items.is_empty());
        assert!(!state.is_present(&c));
    }

    #[test]
    fn test_live_events_never_double_fire() {
        // ARRANGE
        let mut state = MembersState::default();
        let b = address("b:1");
        let event = |kind| ClusterEvent {
            kind,
            items: endpoints(&b),
            from: b.clone(),
        };

        // ACT + ASSERT
        assert!(state.on_cluster_event(event(ClusterEventType::Removed)).is_none());

        let registered = state.on_cluster_event(event(ClusterEventType::Added)).unwrap();
        assert_eq!(registered.kind, DiscoveryEventType::Registered);
        assert!(state.on_cluster_event(event(ClusterEventType::Updated)).is_none());
        assert!(state.on_cluster_event(event(ClusterEventType::Added)).is_none());

        let unregistered = state.on_cluster_event(event(ClusterEventType::Removed)).unwrap();
        assert_eq!(unregistered.kind, DiscoveryEventType::Unregistered);
        assert!(state.on_cluster_event(event(ClusterEventType::Removed)).is_none());
    }

    #[test]
    fn test_live_events_without_items_are_ignored() {
        let mut state = MembersState::default();
        let b = address("b:1");

        let event = ClusterEvent {
            kind: ClusterEventType::Added,
            items: vec![],
            from: b.clone(),
        };

        assert!(state.on_cluster_event(event).is_none());
        assert!(!state.is_present(&b));
    }

    // ============================================================
    // BROADCASTER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_late_subscriber_gets_present_members_and_terminal() {
        // ARRANGE
        let broadcaster = EventBroadcaster::default();
        let b = address("b:1");
        let c = address("c:1");
        let mut early = broadcaster.subscribe();

        // ACT
        broadcaster.publish(DiscoveryEvent::registered(b.clone(), endpoints(&b)));
        broadcaster.publish(DiscoveryEvent::registered(c.clone(), endpoints(&c)));
        broadcaster.publish(DiscoveryEvent::unregistered(b.clone(), endpoints(&b)));
        broadcaster.complete();
        let mut late = broadcaster.subscribe();

        // ASSERT
        assert_eq!(next_event(&mut early).await.kind, DiscoveryEventType::Registered);
        assert_eq!(next_event(&mut early).await.kind, DiscoveryEventType::Registered);
        assert_eq!(next_event(&mut early).await.kind, DiscoveryEventType::Unregistered);
        assert!(early.next().await.is_none());

        let replayed = next_event(&mut late).await;
        assert_eq!(replayed.kind, DiscoveryEventType::Registered);
        assert_eq!(replayed.from, c);
        assert!(late.next().await.is_none(), "b:1 left and must not be replayed");
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_subscriber_once() {
        let broadcaster = EventBroadcaster::default();
        let mut first = broadcaster.subscribe();

        broadcaster.fail(MeshError::Discovery("gone".to_string()));
        broadcaster.publish(DiscoveryEvent::idle(address("b:1")));
        let mut second = broadcaster.subscribe();

        for events in [&mut first, &mut second] {
            assert_eq!(
                events.next().await.unwrap().unwrap_err(),
                MeshError::Discovery("gone".to_string())
            );
            assert!(events.next().await.is_none());
        }
        assert!(broadcaster.is_terminated());
    }

    // ============================================================
    // ENGINE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_degraded_without_cluster() {
        // ARRANGE
        let discovery = create_discovery(options("a:1", None)).await.unwrap();

        // ACT
        let mut events = discovery.events();

        // ASSERT
        assert!(events.next().await.is_none(), "Events should complete immediately");
        assert_eq!(discovery.destroy().await.unwrap(), NO_CLUSTER_MESSAGE);
        assert_eq!(discovery.destroy().await.unwrap(), NO_CLUSTER_MESSAGE);
    }

    #[tokio::test]
    async fn test_seed_equal_to_own_address_is_rejected() {
        let hub = ClusterHub::new();
        let mut opts = options("a:1", Some(hub.factory()));
        opts.seed_address = vec![address("b:1"), address("a:1")];

        let result = create_discovery(opts).await;

        assert!(matches!(
            result,
            Err(MeshError::Validation(ValidationError::AddressCollision { .. }))
        ));
        assert_eq!(hub.member_count(), 0, "Nothing may join before validation");
    }

    #[tokio::test]
    async fn test_snapshot_then_live_events() {
        // ARRANGE
        let hub = ClusterHub::new();
        let b = address("b:1");
        let c = address("c:1");
        hub.join(b.clone(), endpoints(&b));
        hub.join(c.clone(), vec![]);
        let discovery = create_discovery(options("a:1", Some(hub.factory())))
            .await
            .unwrap();

        // ACT
        let mut events = discovery.events();

        // ASSERT: snapshot pass
        let first = next_event(&mut events).await;
        assert_eq!(first.kind, DiscoveryEventType::Registered);
        assert_eq!(first.from, b);
        let second = next_event(&mut events).await;
        assert_eq!(second.kind, DiscoveryEventType::Idle);
        assert_eq!(second.from, c);

        // ASSERT: live pass
        let d = address("d:1");
        let member_d = hub.join(d.clone(), endpoints(&d));
        let joined = next_event(&mut events).await;
        assert_eq!(joined.kind, DiscoveryEventType::Registered);
        assert_eq!(joined.from, d);

        member_d.destroy().await.unwrap();
        let left = next_event(&mut events).await;
        assert_eq!(left.kind, DiscoveryEventType::Unregistered);
        assert_eq!(left.from, d);
    }

    #[tokio::test]
    async fn test_second_subscriber_is_replayed() {
        let hub = ClusterHub::new();
        let b = address("b:1");
        hub.join(b.clone(), endpoints(&b));
        let discovery = create_discovery(options("a:1", Some(hub.factory())))
            .await
            .unwrap();

        let mut first = discovery.events();
        assert_eq!(next_event(&mut first).await.from, b);

        let mut second = discovery.events();
        let replayed = next_event(&mut second).await;
        assert_eq!(replayed.kind, DiscoveryEventType::Registered);
        assert_eq!(replayed.from, b);
    }

    #[tokio::test]
    async fn test_destroy_completes_subscribers_and_leaves() {
        // ARRANGE
        let hub = ClusterHub::new();
        let discovery = create_discovery(options("a:1", Some(hub.factory())))
            .await
            .unwrap();
        let mut events = discovery.events();
        assert_eq!(hub.member_count(), 1);

        // ACT
        let message = discovery.destroy().await.unwrap();

        // ASSERT
        assert_eq!(message, destroyed_message(&address("a:1")));
        assert_eq!(message, "a:1 discovery has been destroyed");
        assert!(events.next().await.is_none());
        assert_eq!(hub.member_count(), 0);
        assert_eq!(discovery.destroy().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_snapshot_failure_terminates_stream() {
        let discovery = create_discovery(options("a:1", Some(failing_cluster(true))))
            .await
            .unwrap();
        let mut events = discovery.events();

        let err = events.next().await.unwrap().unwrap_err();

        assert!(matches!(err, MeshError::Discovery(ref message) if message.contains("snapshot unavailable")));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_live_failure_terminates_stream() {
        let discovery = create_discovery(options("a:1", Some(failing_cluster(false))))
            .await
            .unwrap();
        let mut events = discovery.events();

        let err = events.next().await.unwrap().unwrap_err();

        assert!(matches!(err, MeshError::Discovery(ref message) if message.contains("link lost")));
        assert!(events.next().await.is_none());
    }
}
