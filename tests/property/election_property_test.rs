// tests/property/election_property_test.rs

//! Property-based tests for elections and role translation.
//! Random join/leave/failure sequences must never produce two active instances.

use crate::test_helpers::{Participant, RecordingListener, init_tracing};
use proptest::prelude::*;
use solft::core::broker::Broker;
use solft::core::ft::{ClusterName, MembershipState, Role, RoleTranslator};
use solft::core::transport::{FlowEvent, FlowEventHandler};
use std::sync::Arc;

const CLUSTER: &str = "PropCluster";
const INSTANCES: usize = 4;

#[derive(Debug, Clone, Copy)]
enum Op {
    Start(usize),
    Stop(usize),
    Disconnect(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..INSTANCES).prop_map(Op::Start),
        (0..INSTANCES).prop_map(Op::Stop),
        (0..INSTANCES).prop_map(Op::Disconnect),
    ]
}

fn event_strategy() -> impl Strategy<Value = FlowEvent> {
    prop_oneof![
        Just(FlowEvent::Active),
        Just(FlowEvent::Inactive),
        Just(FlowEvent::Down),
    ]
}

/// Lets every dispatch task drain what the last operation queued.
async fn quiesce() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 500,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_at_most_one_active_under_churn(ops in prop::collection::vec(op_strategy(), 1..40)) {
        tokio_test::block_on(async {
            init_tracing();
            let broker = Arc::new(Broker::default());
            let mut instances: Vec<Participant> = (0..INSTANCES)
                .map(|i| Participant::connect(&broker, &format!("instance-{i}")))
                .collect();

            for op in ops {
                match op {
                    Op::Start(i) => {
                        if !instances[i].session.is_connected() {
                            instances[i].manager.stop().await;
                            instances[i] = Participant::connect(&broker, &format!("instance-{i}"));
                        }
                        // Starting twice is an error the manager reports; either way
                        // the invariant below must hold.
                        let _ = instances[i].start(CLUSTER).await;
                    }
                    Op::Stop(i) => instances[i].manager.stop().await,
                    Op::Disconnect(i) => instances[i].session.disconnect(),
                }
                quiesce().await;

                let active = instances.iter().filter(|p| p.is_active()).count();
                assert!(active <= 1, "{active} instances active after {op:?}");

                // Live members always have exactly one leader among them.
                let bound = instances
                    .iter()
                    .filter(|p| matches!(p.state(), MembershipState::Bound { .. }))
                    .count();
                if bound > 0 {
                    assert_eq!(active, 1, "no leader among {bound} bound instances after {op:?}");
                }
                assert_eq!(
                    broker.active_flow(CLUSTER).is_some(),
                    bound > 0,
                    "broker and members disagree after {op:?}"
                );
            }
        });
    }

    #[test]
    fn test_translator_forwards_every_event_in_order(
        events in prop::collection::vec(event_strategy(), 0..64)
    ) {
        let listener = RecordingListener::new();
        let translator = RoleTranslator::new(
            ClusterName::new(CLUSTER).unwrap(),
            listener.clone(),
        );
        translator.announce(Role::Backup);
        for event in &events {
            translator.handle_event(*event);
        }

        let expected: Vec<Role> = std::iter::once(Role::Backup)
            .chain(events.iter().map(|event| match event {
                FlowEvent::Active => Role::Active,
                FlowEvent::Inactive | FlowEvent::Down => Role::Backup,
            }))
            .collect();
        prop_assert_eq!(listener.roles(), expected);

        let lost = events.contains(&FlowEvent::Down);
        prop_assert_eq!(
            matches!(translator.state(), MembershipState::Lost { .. }),
            lost
        );
    }
}
