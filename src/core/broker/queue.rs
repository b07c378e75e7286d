// src/core/broker/queue.rs

//! Consumer bookkeeping and active-consumer election for a single queue.

use crate::core::transport::{AccessType, EndpointProperties, FlowEvent};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// A flow bound to a queue.
#[derive(Debug)]
pub(crate) struct Consumer {
    pub flow_id: u64,
    pub session_id: u64,
    pub events: UnboundedSender<FlowEvent>,
    pub active_flow_indication: bool,
}

impl Consumer {
    /// Sends an event if the consumer asked for flow indications.
    /// Returns `false` once the consumer's receiving side is gone.
    fn notify(&self, event: FlowEvent) -> bool {
        if !self.active_flow_indication {
            return !self.events.is_closed();
        }
        self.events.send(event).is_ok()
    }
}

/// The state of one provisioned queue.
///
/// For an exclusive queue the active consumer is the longest-bound one still
/// present. Consumers are kept in bind order, so re-election is "first in line".
#[derive(Debug)]
pub(crate) struct QueueState {
    pub properties: EndpointProperties,
    consumers: Vec<Consumer>,
    active: Option<u64>,
}

impl QueueState {
    pub fn new(properties: EndpointProperties) -> Self {
        Self {
            properties,
            consumers: Vec::new(),
            active: None,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        self.properties.access_type == AccessType::Exclusive
    }

    pub fn active_flow(&self) -> Option<u64> {
        self.active
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Adds a consumer. On an exclusive queue with no active consumer it is
    /// elected immediately. A consumer bound while another is active hears nothing.
    pub fn add_consumer(&mut self, consumer: Consumer) {
        self.consumers.push(consumer);
        if self.is_exclusive() && self.active.is_none() {
            self.elect();
        }
    }

    /// Removes a consumer, optionally telling it the flow went down, and
    /// re-elects if it was the active one. Returns the removed consumer's session.
    pub fn remove_consumer(&mut self, flow_id: u64, notify_down: bool) -> Option<u64> {
        let index = self.consumers.iter().position(|c| c.flow_id == flow_id)?;
        let consumer = self.consumers.remove(index);
        if notify_down {
            // The client may already be gone; nothing to do if so.
            let _ = consumer.events.send(FlowEvent::Down);
        }
        if self.active == Some(flow_id) {
            self.active = None;
            self.elect();
        }
        Some(consumer.session_id)
    }

    /// Promotes the first reachable consumer. Consumers whose receivers were
    /// dropped without an unbind are pruned on the way.
    fn elect(&mut self) {
        while let Some(candidate) = self.consumers.first() {
            if candidate.notify(FlowEvent::Active) {
                debug!("Flow {} elected active.", candidate.flow_id);
                self.active = Some(candidate.flow_id);
                return;
            }
            debug!(
                "Pruning unreachable flow {} during election.",
                candidate.flow_id
            );
            self.consumers.remove(0);
        }
    }
}
