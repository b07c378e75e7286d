// src/core/broker/mod.rs

//! A reference message broker implementing the exclusive-queue semantics that
//! application fault tolerance is built on.
//!
//! The broker:
//! - Provisions durable queues, exclusive or not, on behalf of sessions.
//! - Keeps the consumers of each queue in bind order and elects the first one
//!   as the active consumer of an exclusive queue.
//! - Notifies consumers that asked for active-flow indication when they become active.
//! - Re-elects when the active consumer unbinds or its session is dropped.
//!
//! It can be embedded (see [`LocalSession`](crate::core::transport::local::LocalSession))
//! or served over TCP with [`run`] / [`listener::serve`].

use crate::core::TransportError;
use crate::core::transport::{
    Capabilities, ConsumerFlowProperties, Endpoint, EndpointProperties, FlowEvent, ProvisionFlags,
};
use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

pub mod config;
pub mod listener;
mod queue;

use self::config::BrokerConfig;
use self::queue::{Consumer, QueueState};

/// Which queue a flow is bound to, and on behalf of which session.
#[derive(Debug, Clone)]
struct FlowRecord {
    queue: String,
    session_id: u64,
}

/// The shared broker state. All methods are safe to call concurrently.
#[derive(Debug)]
pub struct Broker {
    capabilities: Capabilities,
    allow_provisioning: bool,
    /// Client names of connected sessions, keyed by session id.
    sessions: DashMap<u64, String>,
    queues: DashMap<String, Arc<Mutex<QueueState>>>,
    flows: DashMap<u64, FlowRecord>,
    next_session_id: AtomicU64,
    next_flow_id: AtomicU64,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(Capabilities::all(), true)
    }
}

impl Broker {
    pub fn new(capabilities: Capabilities, allow_provisioning: bool) -> Self {
        Self {
            capabilities,
            allow_provisioning,
            sessions: DashMap::new(),
            queues: DashMap::new(),
            flows: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            next_flow_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        Ok(Self::new(
            config.capability_set()?,
            config.allow_provisioning,
        ))
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Registers a new client session and returns its id.
    pub fn open_session(&self, client_name: &str) -> u64 {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(id, client_name.to_string());
        info!("Session {} opened for client '{}'.", id, client_name);
        id
    }

    pub fn is_session_open(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Drops a session and every flow it owns, re-electing where needed.
    /// With `notify_down` the session's own flows receive `FlowEvent::Down`
    /// first, which is how a client observes the loss of its connection.
    pub fn drop_session(&self, session_id: u64, notify_down: bool) {
        let Some((_, client_name)) = self.sessions.remove(&session_id) else {
            return;
        };

        let owned: Vec<u64> = self
            .flows
            .iter()
            .filter(|entry| entry.value().session_id == session_id)
            .map(|entry| *entry.key())
            .collect();

        for flow_id in &owned {
            self.release_flow(*flow_id, notify_down);
        }

        info!(
            "Session {} for client '{}' dropped, releasing {} flow(s).",
            session_id,
            client_name,
            owned.len()
        );
    }

    /// Creates a queue, or accepts an existing compatible one when
    /// `IGNORE_ALREADY_EXISTS` is set.
    pub fn provision(
        &self,
        session_id: u64,
        endpoint: &Endpoint,
        properties: &EndpointProperties,
        flags: ProvisionFlags,
    ) -> Result<(), TransportError> {
        self.ensure_session(session_id)?;
        if !self
            .capabilities
            .contains(Capabilities::ENDPOINT_MANAGEMENT)
        {
            return Err(TransportError::Unsupported(
                "endpoint management is not enabled on this broker".to_string(),
            ));
        }
        if !self.allow_provisioning {
            return Err(TransportError::PermissionDenied(format!(
                "session {session_id} may not provision '{}'",
                endpoint.name()
            )));
        }

        let mut created = false;
        let queue = self
            .queues
            .entry(endpoint.name().to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(QueueState::new(*properties)))
            })
            .clone();

        if created {
            info!(
                "Provisioned {} queue '{}' (permission: {}).",
                properties.access_type,
                endpoint.name(),
                properties.permission
            );
            return Ok(());
        }

        let existing = queue.lock().properties;
        if existing != *properties {
            warn!(
                "Refusing to re-provision '{}': exists as {} / {}.",
                endpoint.name(),
                existing.access_type,
                existing.permission
            );
            return Err(TransportError::IncompatibleEndpoint(
                endpoint.name().to_string(),
            ));
        }
        if flags.contains(ProvisionFlags::IGNORE_ALREADY_EXISTS) {
            debug!("Queue '{}' already exists; ignoring.", endpoint.name());
            Ok(())
        } else {
            Err(TransportError::AlreadyExists(endpoint.name().to_string()))
        }
    }

    /// Binds a consumer flow to a queue. Flow events for the new flow are sent
    /// on `events`; if it is elected straight away, `Active` is already queued
    /// there when this returns.
    pub fn bind(
        &self,
        session_id: u64,
        properties: &ConsumerFlowProperties,
        events: UnboundedSender<FlowEvent>,
    ) -> Result<u64, TransportError> {
        self.ensure_session(session_id)?;
        let name = properties.endpoint.name();
        let queue = self
            .queues
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::UnknownEndpoint(name.to_string()))?;

        let mut queue = queue.lock();
        if properties.active_flow_indication {
            if !self
                .capabilities
                .contains(Capabilities::ACTIVE_FLOW_INDICATION)
            {
                return Err(TransportError::Unsupported(
                    "active flow indication is not enabled on this broker".to_string(),
                ));
            }
            if !queue.is_exclusive() {
                return Err(TransportError::Unsupported(format!(
                    "active flow indication requires an exclusive queue, '{name}' is not"
                )));
            }
        }

        let flow_id = self.next_flow_id.fetch_add(1, Ordering::Relaxed);
        self.flows.insert(
            flow_id,
            FlowRecord {
                queue: name.to_string(),
                session_id,
            },
        );
        queue.add_consumer(Consumer {
            flow_id,
            session_id,
            events,
            active_flow_indication: properties.active_flow_indication,
        });
        info!(
            "Flow {} bound to '{}' for session {} ({} consumer(s), active: {:?}).",
            flow_id,
            name,
            session_id,
            queue.consumer_count(),
            queue.active_flow()
        );
        Ok(flow_id)
    }

    /// Unbinds a flow owned by `session_id`. Unknown flows are ignored.
    pub fn unbind(&self, session_id: u64, flow_id: u64) -> bool {
        let owned = self
            .flows
            .get(&flow_id)
            .is_some_and(|record| record.session_id == session_id);
        owned && self.release_flow(flow_id, false)
    }

    /// The flow currently active on a queue, if any.
    pub fn active_flow(&self, queue: &str) -> Option<u64> {
        self.queues
            .get(queue)
            .and_then(|entry| entry.value().lock().active_flow())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map_or(0, |entry| entry.value().lock().consumer_count())
    }

    pub fn queue_properties(&self, queue: &str) -> Option<EndpointProperties> {
        self.queues
            .get(queue)
            .map(|entry| entry.value().lock().properties)
    }

    fn ensure_session(&self, session_id: u64) -> Result<(), TransportError> {
        if self.is_session_open(session_id) {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    fn release_flow(&self, flow_id: u64, notify_down: bool) -> bool {
        let Some((_, record)) = self.flows.remove(&flow_id) else {
            return false;
        };
        let Some(queue) = self
            .queues
            .get(&record.queue)
            .map(|entry| entry.value().clone())
        else {
            return false;
        };

        let mut queue = queue.lock();
        let removed = queue.remove_consumer(flow_id, notify_down).is_some();
        info!(
            "Flow {} unbound from '{}' (active now: {:?}).",
            flow_id,
            record.queue,
            queue.active_flow()
        );
        removed
    }
}

/// The entry point for running the broker as a standalone TCP server.
pub async fn run(config_path: &str) -> Result<()> {
    let config = BrokerConfig::from_file(config_path).await?;
    let broker = Arc::new(Broker::from_config(&config)?);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind broker listener on {addr}"))?;
    info!(
        "Broker listening on {} with capabilities {:?}.",
        addr,
        broker.capabilities()
    );

    let shutdown = async {
        if let Err(e) = crate::core::signal::shutdown_signal().await {
            error!("Failed to listen for shutdown signals: {}", e);
        }
    };
    listener::serve(listener, broker, shutdown, config.shutdown_timeout).await?;

    info!("Broker shutdown complete.");
    Ok(())
}
