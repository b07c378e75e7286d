// src/core/broker/listener.rs

//! Serves a [`Broker`] over TCP. Each connection is one broker session, opened
//! by `HELLO` and dropped (with re-election) when the connection ends.

use super::Broker;
use crate::core::TransportError;
use crate::core::protocol::{FlowEventPush, Request, RespFrame, RespFrameCodec};
use crate::core::transport::{
    ConsumerFlowProperties, Endpoint, EndpointProperties, FlowEvent, ProvisionFlags,
};
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Accepts connections until `shutdown` resolves, then gives open connections
/// up to `drain_timeout` to wind down before aborting them.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    shutdown: impl Future<Output = ()>,
    drain_timeout: Duration,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("Shutdown requested, closing {} broker connection(s).", connections.len());
                break;
            }

            Some(res) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = res {
                    warn!("A broker connection task panicked: {}", e);
                }
            }

            res = listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        debug!("Accepted broker connection from {}", addr);
                        let broker = broker.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(socket, addr, broker, shutdown_rx).await {
                                warn!("Error handling broker connection from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept broker connection: {}", e),
                }
            }
        }
    }

    // Receivers may already be gone; that is fine.
    let _ = shutdown_tx.send(true);
    let drained = tokio::time::timeout(drain_timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "{} broker connection(s) did not close within {:?}; aborting.",
            connections.len(),
            drain_timeout
        );
        connections.shutdown().await;
    }
    Ok(())
}

/// Per-connection state: the broker session opened by `HELLO`, if any, and the
/// outbound queue shared by replies and pushed flow events.
struct Connection {
    broker: Arc<Broker>,
    session_id: Option<u64>,
    outbound: mpsc::UnboundedSender<RespFrame>,
}

async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    broker: Arc<Broker>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let (mut sink, mut stream) = Framed::new(socket, RespFrameCodec).split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<RespFrame>();

    // Replies and pushes share one ordered queue, so a flow's events can never
    // overtake the reply to the BIND that created it.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                debug!("Broker connection write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut conn = Connection {
        broker,
        session_id: None,
        outbound,
    };

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            next = stream.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("Error decoding frame from {}: {}", addr, e);
                    break;
                }
                None => break,
            },
        };

        let reply = match frame {
            RespFrame::Array(args) => match Request::parse(&args) {
                Ok(request) => conn.process_request(request),
                Err(e) => Some(RespFrame::Error(e.to_wire())),
            },
            _ => Some(RespFrame::Error(
                "ERR requests must be RESP arrays".to_string(),
            )),
        };
        if let Some(reply) = reply {
            if conn.outbound.send(reply).is_err() {
                break;
            }
        }
    }

    if let Some(session_id) = conn.session_id.take() {
        conn.broker.drop_session(session_id, false);
    }
    debug!("Broker connection from {} closed.", addr);

    // Flush whatever is queued, then let the writer close the socket.
    drop(conn);
    let _ = writer.await;
    Ok(())
}

impl Connection {
    /// Handles one request. `None` means the reply was already queued.
    fn process_request(&mut self, request: Request) -> Option<RespFrame> {
        let session_id = match (&request, self.session_id) {
            (Request::Ping, _) => return Some(RespFrame::SimpleString("PONG".to_string())),
            (Request::Hello { .. }, Some(_)) => {
                return Some(RespFrame::Error(
                    "ERR session already established".to_string(),
                ));
            }
            (Request::Hello { .. }, None) => 0,
            (_, Some(id)) => id,
            (_, None) => return Some(RespFrame::Error("ERR HELLO required".to_string())),
        };

        let reply = match request {
            Request::Hello {
                client_name,
                username,
                vpn_name,
            } => {
                let id = self.broker.open_session(&client_name);
                debug!(
                    "Session {} authenticated as '{}' on VPN '{}'.",
                    id, username, vpn_name
                );
                self.session_id = Some(id);
                RespFrame::Integer(i64::from(self.broker.capabilities().bits()))
            }
            Request::Provision {
                queue,
                access_type,
                permission,
                ignore_exists,
            } => {
                let mut flags = ProvisionFlags::empty();
                flags.set(ProvisionFlags::IGNORE_ALREADY_EXISTS, ignore_exists);
                let properties = EndpointProperties {
                    access_type,
                    permission,
                };
                match self
                    .broker
                    .provision(session_id, &Endpoint::queue(queue), &properties, flags)
                {
                    Ok(()) => RespFrame::ok(),
                    Err(e) => RespFrame::Error(e.to_wire()),
                }
            }
            Request::Bind {
                queue,
                active_flow_indication,
            } => return self.bind(session_id, queue, active_flow_indication),
            Request::Unbind { flow_id } => {
                self.broker.unbind(session_id, flow_id);
                RespFrame::ok()
            }
            Request::Ping => RespFrame::SimpleString("PONG".to_string()),
        };
        Some(reply)
    }

    /// Binds a flow and wires its events onto the outbound queue. On success the
    /// reply is queued here, ahead of any event for the new flow.
    fn bind(
        &mut self,
        session_id: u64,
        queue: String,
        active_flow_indication: bool,
    ) -> Option<RespFrame> {
        let properties = ConsumerFlowProperties::new(Endpoint::queue(queue))
            .with_active_flow_indication(active_flow_indication);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<FlowEvent>();

        let flow_id = match self.broker.bind(session_id, &properties, events_tx) {
            Ok(id) => id,
            Err(e) => return Some(RespFrame::Error(e.to_wire())),
        };

        let _ = self.outbound.send(RespFrame::Integer(flow_id as i64));
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let push = FlowEventPush { flow_id, event }.into_frame();
                if outbound.send(push).is_err() {
                    break;
                }
            }
        });
        None
    }
}
