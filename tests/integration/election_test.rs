// tests/integration/election_test.rs

//! Leader election end to end on an in-process broker.

use super::test_helpers::{
    Participant, assert_bind_error, init_tracing, settle, wait_until,
};
use solft::core::FtError;
use solft::core::TransportError;
use solft::core::broker::Broker;
use solft::core::ft::{FtConnection, FtManager, MembershipState, Role};
use solft::core::transport::local::LocalSession;
use solft::core::transport::{
    Capabilities, Endpoint, EndpointProperties, ProvisionFlags, TransportSession,
};
use std::sync::Arc;

const CLUSTER: &str = "MyAppCluster";

fn broker() -> Arc<Broker> {
    init_tracing();
    Arc::new(Broker::default())
}

#[tokio::test]
async fn test_fred_then_barney() {
    let broker = broker();
    let fred = Participant::connect(&broker, "fred");
    let barney = Participant::connect(&broker, "barney");

    fred.start(CLUSTER).await.unwrap();
    assert!(wait_until(|| fred.is_active()).await);
    assert_eq!(fred.listener.roles(), vec![Role::Backup, Role::Active]);

    barney.start(CLUSTER).await.unwrap();
    settle().await;
    assert_eq!(barney.listener.roles(), vec![Role::Backup]);
    assert!(fred.is_active());

    fred.manager.stop().await;
    assert!(wait_until(|| barney.is_active()).await);
    assert_eq!(barney.listener.roles(), vec![Role::Backup, Role::Active]);
    assert_eq!(
        fred.listener.roles(),
        vec![Role::Backup, Role::Active, Role::Backup]
    );
    assert_eq!(fred.state(), MembershipState::Unbound);
}

#[tokio::test]
async fn test_start_announces_backup_exactly_once_before_returning() {
    let broker = broker();
    let fred = Participant::connect(&broker, "fred");
    let barney = Participant::connect(&broker, "barney");

    fred.start(CLUSTER).await.unwrap();
    assert_eq!(fred.listener.roles().first(), Some(&Role::Backup));
    barney.start(CLUSTER).await.unwrap();
    assert_eq!(barney.listener.roles(), vec![Role::Backup]);

    settle().await;
    assert_eq!(fred.listener.count(Role::Backup), 1);
    assert_eq!(barney.listener.count(Role::Backup), 1);
}

#[tokio::test]
async fn test_stop_twice_is_a_no_op() {
    let broker = broker();
    let fred = Participant::connect(&broker, "fred");
    fred.start(CLUSTER).await.unwrap();
    assert!(wait_until(|| fred.is_active()).await);

    fred.manager.stop().await;
    let after_first = fred.listener.roles();
    fred.manager.stop().await;
    settle().await;
    assert_eq!(fred.listener.roles(), after_first);
    assert_eq!(broker.consumer_count(CLUSTER), 0);
}

#[tokio::test]
async fn test_stop_before_start_is_a_no_op() {
    let broker = broker();
    let fred = Participant::connect(&broker, "fred");
    fred.manager.stop().await;
    assert!(fred.listener.roles().is_empty());
    assert_eq!(fred.state(), MembershipState::Unbound);
}

#[tokio::test]
async fn test_at_most_one_active_and_exactly_one_takes_over() {
    let broker = broker();
    let participants: Vec<Participant> = (0..5)
        .map(|i| Participant::connect(&broker, &format!("instance-{i}")))
        .collect();
    for p in &participants {
        p.start(CLUSTER).await.unwrap();
    }
    assert!(wait_until(|| participants.iter().any(Participant::is_active)).await);
    settle().await;
    let active: Vec<&Participant> = participants.iter().filter(|p| p.is_active()).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name, "instance-0");

    participants[0].manager.stop().await;
    assert!(wait_until(|| participants[1..].iter().any(Participant::is_active)).await);
    settle().await;
    assert_eq!(
        participants.iter().filter(|p| p.is_active()).count(),
        1,
        "exactly one instance should have taken over"
    );
    assert!(participants[1].is_active());
}

#[tokio::test]
async fn test_disconnect_of_active_surfaces_backup_and_lost() {
    let broker = broker();
    let fred = Participant::connect(&broker, "fred");
    let barney = Participant::connect(&broker, "barney");
    fred.start(CLUSTER).await.unwrap();
    barney.start(CLUSTER).await.unwrap();
    assert!(wait_until(|| fred.is_active()).await);

    fred.session.disconnect();
    assert!(wait_until(|| barney.is_active()).await);
    assert!(wait_until(|| fred.listener.last() == Some(Role::Backup)).await);
    assert_eq!(
        fred.state(),
        MembershipState::Lost {
            cluster: CLUSTER.parse().unwrap()
        }
    );

    // A lost membership is still released by stop().
    fred.manager.stop().await;
    assert_eq!(fred.state(), MembershipState::Unbound);
    assert_eq!(
        fred.listener.roles(),
        vec![Role::Backup, Role::Active, Role::Backup]
    );
}

#[tokio::test]
async fn test_session_without_endpoint_management_never_binds() {
    init_tracing();
    let broker = Arc::new(Broker::new(
        Capabilities::ACTIVE_FLOW_INDICATION | Capabilities::SUB_FLOW_GUARANTEED,
        true,
    ));
    let session = Arc::new(LocalSession::connect(&broker, "fred"));
    match FtConnection::from_session(session) {
        Err(FtError::InsufficientCapabilities { missing }) => {
            assert_eq!(missing, Capabilities::ENDPOINT_MANAGEMENT);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("an incapable session must be rejected"),
    }
    assert_eq!(broker.queue_properties(CLUSTER), None);
    assert_eq!(broker.consumer_count(CLUSTER), 0);
}

#[tokio::test]
async fn test_second_start_is_rejected_without_notifying() {
    let broker = broker();
    let fred = Participant::connect(&broker, "fred");
    fred.start(CLUSTER).await.unwrap();
    assert!(wait_until(|| fred.is_active()).await);

    let err = fred.start("OtherCluster").await.unwrap_err();
    assert!(matches!(err, FtError::AlreadyStarted(name) if name == CLUSTER));
    settle().await;
    assert_eq!(fred.listener.roles(), vec![Role::Backup, Role::Active]);
    assert!(fred.state().is_active());
}

#[tokio::test]
async fn test_invalid_cluster_name_is_rejected_before_any_callback() {
    let broker = broker();
    let fred = Participant::connect(&broker, "fred");
    let err = fred.start("my cluster").await.unwrap_err();
    assert!(matches!(err, FtError::InvalidClusterName { .. }));
    assert!(fred.listener.roles().is_empty());
}

#[tokio::test]
async fn test_failed_bind_leaves_manager_unbound_and_retriable() {
    let broker = broker();
    // Someone else owns the name as a non-exclusive queue.
    let squatter = LocalSession::connect(&broker, "squatter");
    squatter
        .provision(
            &Endpoint::queue(CLUSTER),
            &EndpointProperties::default(),
            ProvisionFlags::empty(),
        )
        .await
        .unwrap();

    let fred = Participant::connect(&broker, "fred");
    assert_bind_error(fred.start(CLUSTER).await, |e| {
        matches!(e, TransportError::IncompatibleEndpoint(_))
    });
    assert_eq!(fred.state(), MembershipState::Unbound);
    assert_eq!(fred.listener.roles(), vec![Role::Backup]);

    fred.start("MyAppCluster2").await.unwrap();
    assert!(wait_until(|| fred.is_active()).await);
}

#[tokio::test]
async fn test_existing_compatible_queue_is_reused() {
    let broker = broker();
    let fred = Participant::connect(&broker, "fred");
    fred.start(CLUSTER).await.unwrap();
    fred.manager.stop().await;

    // The queue outlives the membership; joining again reuses it.
    assert!(broker.queue_properties(CLUSTER).is_some());
    let barney = Participant::connect(&broker, "barney");
    barney.start(CLUSTER).await.unwrap();
    assert!(wait_until(|| barney.is_active()).await);
}

#[tokio::test]
async fn test_manager_accepts_closure_listener() {
    use solft::core::ft::FnListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let broker = broker();
    let session = Arc::new(LocalSession::connect(&broker, "fred"));
    let manager = FtManager::new(FtConnection::from_session(session).unwrap());
    let activations = Arc::new(AtomicUsize::new(0));
    let counted = activations.clone();
    let listener = FnListener::new(
        move || {
            counted.fetch_add(1, Ordering::SeqCst);
        },
        || {},
    );

    manager.start(CLUSTER, Arc::new(listener)).await.unwrap();
    assert!(wait_until(|| activations.load(Ordering::SeqCst) == 1).await);
    manager.stop().await;
}
