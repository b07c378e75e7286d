// tests/integration/remote_transport_test.rs

//! The same election scenarios, with every participant talking to the broker
//! over TCP.

use super::test_helpers::{
    RecordingListener, RemoteBroker, assert_bind_error, init_tracing, settle, wait_until,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use solft::config::{SessionProperties, keys};
use solft::core::broker::Broker;
use solft::core::ft::{FtConnection, FtManager, MembershipState, Role};
use solft::core::protocol::{FlowEventPush, Request, RespFrame, RespFrameCodec};
use solft::core::transport::remote::RemoteSession;
use solft::core::transport::{Capabilities, FlowEvent, TransportSession};
use solft::core::{FtError, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;

const CLUSTER: &str = "MyAppCluster";

struct RemoteParticipant {
    session: Arc<RemoteSession>,
    manager: FtManager,
    listener: Arc<RecordingListener>,
}

impl RemoteParticipant {
    async fn connect(broker: &RemoteBroker, name: &str) -> Self {
        let session = Arc::new(
            RemoteSession::connect(&broker.properties(name))
                .await
                .unwrap(),
        );
        let connection = FtConnection::from_session(session.clone()).unwrap();
        Self {
            session,
            manager: FtManager::new(connection),
            listener: RecordingListener::new(),
        }
    }

    async fn start(&self) -> Result<(), FtError> {
        self.manager.start(CLUSTER, self.listener.clone()).await
    }

    fn is_active(&self) -> bool {
        self.listener.last() == Some(Role::Active)
    }
}

#[tokio::test]
async fn test_remote_session_handshake() {
    let mut broker = RemoteBroker::start(Broker::default()).await;
    let session = RemoteSession::connect(&broker.properties("fred")).await.unwrap();
    assert_eq!(session.client_name(), "fred");
    assert_eq!(session.capabilities(), Capabilities::all());
    assert!(session.is_connected());
    session.ping().await.unwrap();
    broker.shutdown().await;
}

#[tokio::test]
async fn test_remote_session_generates_a_client_name() {
    let mut broker = RemoteBroker::start(Broker::default()).await;
    let props = SessionProperties::new().with(keys::HOST, broker.addr.to_string());
    let session = RemoteSession::connect(&props).await.unwrap();
    assert!(session.client_name().starts_with("solft-"));
    assert_eq!(session.client_name().len(), "solft-".len() + 16);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_remote_fred_then_barney() {
    let mut broker = RemoteBroker::start(Broker::default()).await;
    let fred = RemoteParticipant::connect(&broker, "fred").await;
    let barney = RemoteParticipant::connect(&broker, "barney").await;

    fred.start().await.unwrap();
    assert!(wait_until(|| fred.is_active()).await);
    barney.start().await.unwrap();
    settle().await;
    assert_eq!(barney.listener.roles(), vec![Role::Backup]);

    fred.manager.stop().await;
    assert!(wait_until(|| barney.is_active()).await);
    assert_eq!(
        fred.listener.roles(),
        vec![Role::Backup, Role::Active, Role::Backup]
    );
    assert_eq!(broker.broker.consumer_count(CLUSTER), 1);

    barney.manager.stop().await;
    assert!(wait_until(|| broker.broker.consumer_count(CLUSTER) == 0).await);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_closing_the_active_connection_reelects() {
    let mut broker = RemoteBroker::start(Broker::default()).await;
    let fred = RemoteParticipant::connect(&broker, "fred").await;
    let barney = RemoteParticipant::connect(&broker, "barney").await;
    fred.start().await.unwrap();
    barney.start().await.unwrap();
    assert!(wait_until(|| fred.is_active()).await);

    fred.session.close().await;
    assert!(wait_until(|| barney.is_active()).await);
    assert!(wait_until(|| fred.listener.last() == Some(Role::Backup)).await);
    assert!(wait_until(|| matches!(fred.manager.state(), MembershipState::Lost { .. })).await);
    assert!(!fred.session.is_connected());

    fred.manager.stop().await;
    assert_eq!(fred.manager.state(), MembershipState::Unbound);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_broker_shutdown_surfaces_as_lost() {
    let mut broker = RemoteBroker::start(Broker::default()).await;
    let fred = RemoteParticipant::connect(&broker, "fred").await;
    fred.start().await.unwrap();
    assert!(wait_until(|| fred.is_active()).await);

    broker.shutdown().await;
    assert!(wait_until(|| matches!(fred.manager.state(), MembershipState::Lost { .. })).await);
    assert_eq!(fred.listener.last(), Some(Role::Backup));

    // Requests on a dead session fail fast.
    let err = fred.session.ping().await.unwrap_err();
    assert!(matches!(err, TransportError::Disconnected));
    fred.manager.stop().await;
}

#[tokio::test]
async fn test_remote_provisioning_refused() {
    let mut broker = RemoteBroker::start(Broker::new(Capabilities::all(), false)).await;
    let fred = RemoteParticipant::connect(&broker, "fred").await;
    assert_bind_error(fred.start().await, |e| {
        matches!(e, TransportError::PermissionDenied(_))
    });
    assert_eq!(fred.manager.state(), MembershipState::Unbound);
    assert_eq!(fred.listener.roles(), vec![Role::Backup]);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_remote_capabilities_are_validated_on_connect() {
    let mut broker = RemoteBroker::start(Broker::new(
        Capabilities::ACTIVE_FLOW_INDICATION | Capabilities::ENDPOINT_MANAGEMENT,
        true,
    ))
    .await;
    let result = FtConnection::connect(&broker.properties("fred")).await;
    match result {
        Err(FtError::InsufficientCapabilities { missing }) => {
            assert_eq!(missing, Capabilities::SUB_FLOW_GUARANTEED);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("an incapable broker must be rejected"),
    }
    broker.shutdown().await;
}

#[tokio::test]
async fn test_connect_tries_hosts_in_order() {
    let mut broker = RemoteBroker::start(Broker::default()).await;
    // Nothing listens on the first address.
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = unused.local_addr().unwrap();
    drop(unused);

    let props = SessionProperties::new()
        .with(keys::HOST, format!("{dead},{}", broker.addr))
        .with(keys::CLIENT_NAME, "fred");
    let connection = FtConnection::connect(&props).await.unwrap();
    assert!(
        connection
            .session()
            .is_capable(Capabilities::FAULT_TOLERANCE)
    );
    broker.shutdown().await;
}

#[tokio::test]
async fn test_connect_without_reachable_host_fails() {
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = unused.local_addr().unwrap();
    drop(unused);

    let props = SessionProperties::new().with(keys::HOST, dead.to_string());
    let err = FtConnection::connect(&props).await.err().unwrap();
    assert!(matches!(
        err,
        FtError::Transport(TransportError::Connection(_))
    ));
}

#[tokio::test]
async fn test_connect_requires_a_host() {
    let err = FtConnection::connect(&SessionProperties::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FtError::Config(_)));
}

/// A single-connection broker with scripted replies. Flow ids count up from
/// `first_flow_id`, every bound flow is pushed `active` right after its reply,
/// and the first `BIND` reply can be held back until `release_bind`.
struct ScriptedBroker {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
    release: Option<oneshot::Sender<()>>,
}

impl ScriptedBroker {
    async fn start(first_flow_id: i64, hold_first_bind: bool) -> Self {
        init_tracing();
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let seen = commands.clone();
        tokio::spawn(async move {
            let (stream, _) = socket.accept().await.unwrap();
            let mut framed = Framed::new(stream, RespFrameCodec);
            let mut held = hold_first_bind.then_some(release_rx);
            let mut next_flow_id = first_flow_id;
            while let Some(Ok(RespFrame::Array(args))) = framed.next().await {
                let request = Request::parse(&args).unwrap();
                seen.lock().push(request.name().to_string());
                match request {
                    Request::Hello { .. } => {
                        let bits = Capabilities::all().bits() as i64;
                        framed.send(RespFrame::Integer(bits)).await.unwrap();
                    }
                    Request::Bind { .. } => {
                        if let Some(release) = held.take() {
                            let _ = release.await;
                        }
                        let flow_id = next_flow_id;
                        next_flow_id += 1;
                        framed.send(RespFrame::Integer(flow_id)).await.unwrap();
                        if let Ok(flow_id) = u64::try_from(flow_id) {
                            let push = FlowEventPush {
                                flow_id,
                                event: FlowEvent::Active,
                            };
                            framed.send(push.into_frame()).await.unwrap();
                        }
                    }
                    _ => framed.send(RespFrame::ok()).await.unwrap(),
                }
            }
        });
        Self {
            addr,
            commands,
            release: Some(release_tx),
        }
    }

    fn properties(&self) -> SessionProperties {
        SessionProperties::new()
            .with(keys::HOST, self.addr.to_string())
            .with(keys::CLIENT_NAME, "fred")
    }

    fn release_bind(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(());
        }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

async fn scripted_manager(broker: &ScriptedBroker) -> FtManager {
    let session = RemoteSession::connect(&broker.properties()).await.unwrap();
    FtManager::new(FtConnection::from_session(Arc::new(session)).unwrap())
}

#[tokio::test]
async fn test_timed_out_start_releases_the_flow_it_bound() {
    let mut broker = ScriptedBroker::start(1, true).await;
    let manager = scripted_manager(&broker).await;
    let listener = RecordingListener::new();

    let attempt = tokio::time::timeout(
        Duration::from_millis(200),
        manager.start(CLUSTER, listener.clone()),
    )
    .await;
    assert!(attempt.is_err(), "start should still be waiting on BIND");
    assert_eq!(manager.state(), MembershipState::Unbound);
    manager.stop().await;

    // The broker binds the abandoned flow anyway; the session gives it back.
    broker.release_bind();
    assert!(wait_until(|| broker.commands().iter().any(|c| c == "UNBIND")).await);
    settle().await;
    assert_eq!(listener.roles(), vec![Role::Backup]);

    manager.start(CLUSTER, listener.clone()).await.unwrap();
    assert!(wait_until(|| listener.last() == Some(Role::Active)).await);
    assert_eq!(
        broker.commands(),
        vec!["HELLO", "PROVISION", "BIND", "UNBIND", "PROVISION", "BIND"]
    );
}

#[tokio::test]
async fn test_negative_flow_id_is_a_protocol_error() {
    let broker = ScriptedBroker::start(-1, false).await;
    let manager = scripted_manager(&broker).await;
    let listener = RecordingListener::new();

    assert_bind_error(manager.start(CLUSTER, listener.clone()).await, |e| {
        matches!(e, TransportError::Protocol(_))
    });
    assert_eq!(manager.state(), MembershipState::Unbound);
    assert_eq!(listener.roles(), vec![Role::Backup]);
}
