// src/core/ft/translator.rs

//! Turns flow events into listener callbacks.
//!
//! The translator is the only path to the listener. Its gate is a re-entrant
//! lock held for the whole of each callback: closing it waits for a callback in
//! flight, and a listener may touch the translator from inside a callback.

use super::cluster::{ClusterName, MembershipState, Role};
use super::listener::FtEventListener;
use crate::core::transport::{FlowEvent, FlowEventHandler};
use parking_lot::ReentrantMutex;
use std::any::Any;
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Open { role: Option<Role>, lost: bool },
    Closed,
}

pub struct RoleTranslator {
    cluster: ClusterName,
    listener: Arc<dyn FtEventListener>,
    gate: ReentrantMutex<Cell<Gate>>,
}

impl RoleTranslator {
    pub fn new(cluster: ClusterName, listener: Arc<dyn FtEventListener>) -> Self {
        Self {
            cluster,
            listener,
            gate: ReentrantMutex::new(Cell::new(Gate::Open {
                role: None,
                lost: false,
            })),
        }
    }

    pub fn cluster(&self) -> &ClusterName {
        &self.cluster
    }

    /// Forwards a role decided outside the broker, such as the initial Backup.
    pub fn announce(&self, role: Role) {
        self.deliver(role, false);
    }

    /// Demotes the listener if it was last told Active, then closes the gate.
    pub fn release(&self) {
        let gate = self.gate.lock();
        if let Gate::Open {
            role: Some(Role::Active),
            ..
        } = gate.get()
        {
            self.deliver(Role::Backup, false);
        }
        gate.set(Gate::Closed);
    }

    /// Closes the gate without a final callback. Once this returns the
    /// listener is never called again.
    pub fn close(&self) {
        self.gate.lock().set(Gate::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.gate.lock().get() == Gate::Closed
    }

    pub fn state(&self) -> MembershipState {
        match self.gate.lock().get() {
            Gate::Closed | Gate::Open { role: None, .. } => MembershipState::Unbound,
            Gate::Open { lost: true, .. } => MembershipState::Lost {
                cluster: self.cluster.clone(),
            },
            Gate::Open {
                role: Some(role), ..
            } => MembershipState::Bound {
                cluster: self.cluster.clone(),
                role,
            },
        }
    }

    fn deliver(&self, role: Role, lost: bool) {
        let gate = self.gate.lock();
        let Gate::Open { lost: was_lost, .. } = gate.get() else {
            debug!(
                "Cluster '{}': gate closed, dropping '{}' notification.",
                self.cluster, role
            );
            return;
        };
        gate.set(Gate::Open {
            role: Some(role),
            lost: was_lost || lost,
        });

        info!("Cluster '{}': becoming {}.", self.cluster, role);
        let listener = &self.listener;
        let outcome = catch_unwind(AssertUnwindSafe(|| match role {
            Role::Active => listener.on_active(),
            Role::Backup => listener.on_backup(),
        }));
        if let Err(panic) = outcome {
            error!(
                "Cluster '{}': listener panicked in on_{}: {}",
                self.cluster,
                role,
                panic_message(panic.as_ref())
            );
        }
    }
}

impl FlowEventHandler for RoleTranslator {
    fn handle_event(&self, event: FlowEvent) {
        debug!("Cluster '{}': flow event '{}'.", self.cluster, event);
        match event {
            FlowEvent::Active => self.deliver(Role::Active, false),
            FlowEvent::Inactive => self.deliver(Role::Backup, false),
            FlowEvent::Down => self.deliver(Role::Backup, true),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
