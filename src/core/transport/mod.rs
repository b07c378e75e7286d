// src/core/transport/mod.rs

//! The transport seam: what the fault-tolerance core needs from a broker session.
//!
//! A `TransportSession` is an established, authenticated broker connection. It
//! reports its capabilities, provisions endpoints and opens consumer flows. Flow
//! events are delivered to a `FlowEventHandler` from the session's own dispatch
//! task, never from the caller of `create_flow`.
//!
//! Two implementations ship with the crate:
//! - [`local::LocalSession`] talks to an in-process [`Broker`](crate::core::broker::Broker).
//! - [`remote::RemoteSession`] talks to a broker over TCP.

use crate::core::TransportError;
use async_trait::async_trait;
use bitflags::bitflags;
use std::sync::Arc;
use strum_macros::{AsRefStr, Display, EnumString};

pub mod dispatch;
pub mod local;
pub mod remote;

bitflags! {
    /// Features a broker session may advertise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// The broker tells a consumer of an exclusive queue when it becomes (in)active.
        const ACTIVE_FLOW_INDICATION = 1 << 0;
        /// Guaranteed-delivery consumer flows are supported.
        const SUB_FLOW_GUARANTEED    = 1 << 1;
        /// Clients may provision endpoints themselves.
        const ENDPOINT_MANAGEMENT    = 1 << 2;
    }
}

impl Capabilities {
    /// Everything application fault tolerance relies on. Partial support is no support.
    pub const FAULT_TOLERANCE: Self = Self::ACTIVE_FLOW_INDICATION
        .union(Self::SUB_FLOW_GUARANTEED)
        .union(Self::ENDPOINT_MANAGEMENT);
}

bitflags! {
    /// Modifiers for `TransportSession::provision`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProvisionFlags: u8 {
        /// Treat an existing, compatible endpoint as success.
        const IGNORE_ALREADY_EXISTS = 1 << 0;
    }
}

/// How many consumers of a queue may receive messages at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum AccessType {
    /// One active consumer; the rest wait in bind order.
    Exclusive,
    NonExclusive,
}

/// What other clients are allowed to do with an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Permission {
    None,
    ReadOnly,
    Consume,
    ModifyTopic,
    Delete,
}

/// A durable queue endpoint on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    name: String,
}

impl Endpoint {
    pub fn queue(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Properties applied when an endpoint is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointProperties {
    pub access_type: AccessType,
    pub permission: Permission,
}

impl Default for EndpointProperties {
    fn default() -> Self {
        Self {
            access_type: AccessType::NonExclusive,
            permission: Permission::Consume,
        }
    }
}

/// Properties of a consumer flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerFlowProperties {
    pub endpoint: Endpoint,
    /// Ask the broker for `FlowEvent::Active`/`Inactive` notifications.
    pub active_flow_indication: bool,
}

impl ConsumerFlowProperties {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            active_flow_indication: false,
        }
    }

    pub fn with_active_flow_indication(mut self, enabled: bool) -> Self {
        self.active_flow_indication = enabled;
        self
    }
}

/// Flow-level events raised by the broker or by the session itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum FlowEvent {
    /// This flow became the active consumer of its exclusive queue.
    Active,
    /// This flow is no longer the active consumer.
    Inactive,
    /// The flow was torn down underneath the client (connection loss, broker unbind).
    Down,
}

/// Receives flow events, on the session's dispatch task, in the order the broker emitted them.
pub trait FlowEventHandler: Send + Sync {
    fn handle_event(&self, event: FlowEvent);
}

/// An open consumer flow. Both `start` and `close` are idempotent.
#[async_trait]
pub trait Flow: Send + Sync {
    fn id(&self) -> u64;

    /// Begins delivering events to the handler. Events raised before `start`
    /// are held and delivered first, in order.
    async fn start(&self) -> Result<(), TransportError>;

    /// Unbinds the flow from its endpoint and stops event delivery.
    async fn close(&self) -> Result<(), TransportError>;
}

/// An established broker session.
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn is_capable(&self, capability: Capabilities) -> bool {
        self.capabilities().contains(capability)
    }

    async fn provision(
        &self,
        endpoint: &Endpoint,
        properties: &EndpointProperties,
        flags: ProvisionFlags,
    ) -> Result<(), TransportError>;

    async fn create_flow(
        &self,
        properties: ConsumerFlowProperties,
        handler: Arc<dyn FlowEventHandler>,
    ) -> Result<Box<dyn Flow>, TransportError>;
}
