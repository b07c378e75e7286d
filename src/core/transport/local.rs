// src/core/transport/local.rs

//! An in-process transport session bound directly to a shared [`Broker`].

use super::dispatch::FlowDispatcher;
use super::{
    Capabilities, ConsumerFlowProperties, Endpoint, EndpointProperties, Flow, FlowEventHandler,
    ProvisionFlags, TransportSession,
};
use crate::core::TransportError;
use crate::core::broker::Broker;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::info;

/// A session on an in-process broker.
#[derive(Debug)]
pub struct LocalSession {
    broker: Arc<Broker>,
    session_id: u64,
    client_name: String,
}

impl LocalSession {
    /// Opens a session on `broker`.
    pub fn connect(broker: &Arc<Broker>, client_name: impl Into<String>) -> Self {
        let client_name = client_name.into();
        let session_id = broker.open_session(&client_name);
        Self {
            broker: broker.clone(),
            session_id,
            client_name,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_session_open(self.session_id)
    }

    /// Simulates losing the connection: every flow of this session receives
    /// `FlowEvent::Down` and the broker re-elects without it. Later calls fail
    /// with `TransportError::Disconnected`.
    pub fn disconnect(&self) {
        info!(
            "Local session {} ('{}') disconnecting.",
            self.session_id, self.client_name
        );
        self.broker.drop_session(self.session_id, true);
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        self.broker.drop_session(self.session_id, false);
    }
}

#[async_trait]
impl TransportSession for LocalSession {
    fn capabilities(&self) -> Capabilities {
        self.broker.capabilities()
    }

    async fn provision(
        &self,
        endpoint: &Endpoint,
        properties: &EndpointProperties,
        flags: ProvisionFlags,
    ) -> Result<(), TransportError> {
        self.broker
            .provision(self.session_id, endpoint, properties, flags)
    }

    async fn create_flow(
        &self,
        properties: ConsumerFlowProperties,
        handler: Arc<dyn FlowEventHandler>,
    ) -> Result<Box<dyn Flow>, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = self.broker.bind(self.session_id, &properties, events_tx)?;
        Ok(Box::new(LocalFlow {
            id,
            session_id: self.session_id,
            broker: self.broker.clone(),
            dispatcher: FlowDispatcher::new(handler, events_rx),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A flow bound through a [`LocalSession`]. Dropping it unbinds it.
pub struct LocalFlow {
    id: u64,
    session_id: u64,
    broker: Arc<Broker>,
    dispatcher: FlowDispatcher,
    closed: AtomicBool,
}

impl LocalFlow {
    fn release(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.stop();
        self.broker.unbind(self.session_id, self.id);
    }
}

#[async_trait]
impl Flow for LocalFlow {
    fn id(&self) -> u64 {
        self.id
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Unsupported(format!(
                "flow {} is closed",
                self.id
            )));
        }
        self.dispatcher.start(self.id);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }
}

impl Drop for LocalFlow {
    fn drop(&mut self) {
        self.release();
    }
}
