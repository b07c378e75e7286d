// src/core/transport/remote.rs

//! A transport session talking to a broker over TCP.
//!
//! One background task reads frames off the socket. Replies are matched to
//! requests in FIFO order; pushed flow events are routed to the flow they name.
//! When the connection ends, pending requests fail with
//! `TransportError::Disconnected` and every open flow receives `FlowEvent::Down`.
//!
//! A bound flow is owned by a [`FlowBinding`]. Dropping one that was never
//! closed sends `UNBIND`, so a caller that gives up on `BIND` (or on anything
//! after it) leaves nothing bound at the broker.

use super::dispatch::FlowDispatcher;
use super::{
    Capabilities, ConsumerFlowProperties, Endpoint, EndpointProperties, Flow, FlowEvent,
    FlowEventHandler, ProvisionFlags, TransportSession,
};
use crate::config::{SessionProperties, keys};
use crate::core::TransportError;
use crate::core::protocol::{FlowEventPush, Request, RespFrame, RespFrameCodec};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

type FrameSink = SplitSink<Framed<TcpStream, RespFrameCodec>, RespFrame>;
type FrameStream = SplitStream<Framed<TcpStream, RespFrameCodec>>;

/// A reply, plus the binding it created for a successful `BIND`.
struct Reply {
    frame: RespFrame,
    binding: Option<FlowBinding>,
}

/// A request waiting for its reply.
struct PendingReply {
    reply: oneshot::Sender<Reply>,
    /// For `BIND`: where the new flow's events go. Registered by the reader
    /// before it looks at the next frame, so no push can miss its flow.
    bind: Option<mpsc::UnboundedSender<FlowEvent>>,
}

/// State shared between the session, its flows and the reader task.
struct Connection {
    writer: AsyncMutex<FrameSink>,
    pending: Mutex<VecDeque<PendingReply>>,
    flows: DashMap<u64, mpsc::UnboundedSender<FlowEvent>>,
    connected: AtomicBool,
}

impl Connection {
    async fn request(&self, request: Request) -> Result<RespFrame, TransportError> {
        self.exchange(request, None).await.map(|reply| reply.frame)
    }

    /// Sends `BIND` and takes ownership of the flow the broker creates.
    async fn bind(
        &self,
        request: Request,
        events: mpsc::UnboundedSender<FlowEvent>,
    ) -> Result<FlowBinding, TransportError> {
        let reply = self.exchange(request, Some(events)).await?;
        reply.binding.ok_or_else(|| {
            TransportError::Protocol(format!("unexpected BIND reply: {:?}", reply.frame))
        })
    }

    async fn exchange(
        &self,
        request: Request,
        bind: Option<mpsc::UnboundedSender<FlowEvent>>,
    ) -> Result<Reply, TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }

        let name = request.name();
        let (tx, rx) = oneshot::channel();
        {
            // Queue and send under one lock so reply order matches send order.
            let mut writer = self.writer.lock().await;
            self.pending
                .lock()
                .push_back(PendingReply { reply: tx, bind });
            if let Err(e) = writer.send(request.into_frame()).await {
                warn!("Failed to send {} to broker: {}", name, e);
                self.connected.store(false, Ordering::Release);
                return Err(e);
            }
        }

        match rx.await {
            Ok(Reply {
                frame: RespFrame::Error(line),
                ..
            }) => Err(TransportError::from_wire(&line)),
            Ok(reply) => Ok(reply),
            Err(_) => Err(TransportError::Disconnected),
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: FrameStream) {
        while let Some(next) = stream.next().await {
            let frame = match next {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Error decoding frame from broker: {}", e);
                    break;
                }
            };

            if let Some(push) = FlowEventPush::from_frame(&frame) {
                match self.flows.get(&push.flow_id) {
                    Some(events) => {
                        let _ = events.send(push.event);
                    }
                    None => debug!(
                        "Dropping '{}' for unknown flow {}.",
                        push.event, push.flow_id
                    ),
                }
                continue;
            }

            let Some(pending) = self.pending.lock().pop_front() else {
                warn!("Unsolicited reply from broker: {:?}", frame);
                continue;
            };
            let binding = match (pending.bind, &frame) {
                (Some(events), RespFrame::Integer(flow_id)) => match u64::try_from(*flow_id) {
                    Ok(flow_id) if flow_id > 0 => {
                        self.flows.insert(flow_id, events);
                        Some(FlowBinding::new(flow_id, self.clone()))
                    }
                    _ => {
                        warn!("Broker replied to BIND with invalid flow id {}.", flow_id);
                        None
                    }
                },
                _ => None,
            };
            if pending.reply.send(Reply { frame, binding }).is_err() {
                // The requester gave up. An unclaimed binding unbinds on drop.
                debug!("Discarding reply to an abandoned request.");
            }
        }

        self.connected.store(false, Ordering::Release);
        self.pending.lock().clear();
        let lost: Vec<u64> = self.flows.iter().map(|entry| *entry.key()).collect();
        for flow_id in lost {
            if let Some((_, events)) = self.flows.remove(&flow_id) {
                let _ = events.send(FlowEvent::Down);
            }
        }
        info!("Broker connection closed.");
    }
}

/// A broker session over TCP.
pub struct RemoteSession {
    conn: Arc<Connection>,
    capabilities: Capabilities,
    client_name: String,
    reader: JoinHandle<()>,
}

impl RemoteSession {
    /// Connects to the first reachable host in `properties` and opens a session.
    pub async fn connect(properties: &SessionProperties) -> Result<Self, TransportError> {
        let hosts = properties.hosts();
        if hosts.is_empty() {
            return Err(TransportError::Connection(format!(
                "no '{}' configured",
                keys::HOST
            )));
        }
        let timeout = properties
            .connect_timeout()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let mut socket = None;
        let mut last_error = String::new();
        for host in &hosts {
            match tokio::time::timeout(timeout, TcpStream::connect(host.as_str())).await {
                Ok(Ok(stream)) => {
                    info!("Connected to broker at {}", host);
                    socket = Some(stream);
                    break;
                }
                Ok(Err(e)) => {
                    warn!("Failed to connect to broker at {}: {}", host, e);
                    last_error = format!("{host}: {e}");
                }
                Err(_) => {
                    warn!("Timed out connecting to broker at {} after {:?}", host, timeout);
                    last_error = format!("{host}: timed out after {timeout:?}");
                }
            }
        }
        let Some(socket) = socket else {
            return Err(TransportError::Connection(format!(
                "no broker reachable (last error: {last_error})"
            )));
        };
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }

        let (sink, stream) = Framed::new(socket, RespFrameCodec).split();
        let conn = Arc::new(Connection {
            writer: AsyncMutex::new(sink),
            pending: Mutex::new(VecDeque::new()),
            flows: DashMap::new(),
            connected: AtomicBool::new(true),
        });
        let reader = tokio::spawn(conn.clone().read_loop(stream));

        let client_name = match properties.get(keys::CLIENT_NAME) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => generate_client_name()?,
        };
        let hello = Request::Hello {
            client_name: client_name.clone(),
            username: properties.get(keys::USERNAME).unwrap_or("default").to_string(),
            vpn_name: properties.get(keys::VPN_NAME).unwrap_or("default").to_string(),
        };
        let capabilities = match conn.request(hello).await {
            Ok(RespFrame::Integer(bits)) => Capabilities::from_bits_truncate(bits as u32),
            Ok(other) => {
                reader.abort();
                return Err(TransportError::Protocol(format!(
                    "unexpected HELLO reply: {other:?}"
                )));
            }
            Err(e) => {
                reader.abort();
                return Err(e);
            }
        };
        info!(
            "Session established as '{}' with capabilities {:?}.",
            client_name, capabilities
        );

        Ok(Self {
            conn,
            capabilities,
            client_name,
            reader,
        })
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn is_connected(&self) -> bool {
        self.conn.connected.load(Ordering::Acquire)
    }

    pub async fn ping(&self) -> Result<(), TransportError> {
        match self.conn.request(Request::Ping).await? {
            RespFrame::SimpleString(s) if s == "PONG" => Ok(()),
            other => Err(TransportError::Protocol(format!(
                "unexpected PING reply: {other:?}"
            ))),
        }
    }

    /// Closes the connection. The broker drops the session and re-elects.
    pub async fn close(&self) {
        let mut writer = self.conn.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!("Error closing broker connection: {}", e);
        }
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn generate_client_name() -> Result<String, TransportError> {
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes).map_err(|e| {
        TransportError::Connection(format!("failed to generate a client name: {e}"))
    })?;
    Ok(format!("solft-{}", hex::encode(bytes)))
}

#[async_trait]
impl TransportSession for RemoteSession {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn provision(
        &self,
        endpoint: &Endpoint,
        properties: &EndpointProperties,
        flags: ProvisionFlags,
    ) -> Result<(), TransportError> {
        let request = Request::Provision {
            queue: endpoint.name().to_string(),
            access_type: properties.access_type,
            permission: properties.permission,
            ignore_exists: flags.contains(ProvisionFlags::IGNORE_ALREADY_EXISTS),
        };
        self.conn.request(request).await.map(|_| ())
    }

    async fn create_flow(
        &self,
        properties: ConsumerFlowProperties,
        handler: Arc<dyn FlowEventHandler>,
    ) -> Result<Box<dyn Flow>, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let request = Request::Bind {
            queue: properties.endpoint.name().to_string(),
            active_flow_indication: properties.active_flow_indication,
        };
        let binding = self.conn.bind(request, events_tx).await?;
        Ok(Box::new(RemoteFlow {
            dispatcher: FlowDispatcher::new(handler, events_rx),
            binding,
        }))
    }
}

/// Ownership of one flow bound at the broker.
struct FlowBinding {
    id: u64,
    conn: Arc<Connection>,
    closed: AtomicBool,
}

impl FlowBinding {
    fn new(id: u64, conn: Arc<Connection>) -> Self {
        Self {
            id,
            conn,
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops routing events and releases the flow. Idempotent.
    async fn unbind(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.conn.flows.remove(&self.id);
        match self.conn.request(Request::Unbind { flow_id: self.id }).await {
            // Nothing left to release on a dead connection.
            Ok(_) | Err(TransportError::Disconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for FlowBinding {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.conn.flows.remove(&self.id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(
                "Flow {} dropped outside a runtime; it stays bound until the session ends.",
                self.id
            );
            return;
        };
        debug!("Flow {} dropped without close; unbinding.", self.id);
        let (id, conn) = (self.id, self.conn.clone());
        runtime.spawn(async move {
            if let Err(e) = conn.request(Request::Unbind { flow_id: id }).await {
                debug!("Failed to unbind dropped flow {}: {}", id, e);
            }
        });
    }
}

/// A flow bound through a [`RemoteSession`].
pub struct RemoteFlow {
    dispatcher: FlowDispatcher,
    binding: FlowBinding,
}

#[async_trait]
impl Flow for RemoteFlow {
    fn id(&self) -> u64 {
        self.binding.id
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.binding.is_closed() {
            return Err(TransportError::Unsupported(format!(
                "flow {} is closed",
                self.binding.id
            )));
        }
        self.dispatcher.start(self.binding.id);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.binding.is_closed() {
            return Ok(());
        }
        self.dispatcher.stop();
        self.binding.unbind().await
    }
}
