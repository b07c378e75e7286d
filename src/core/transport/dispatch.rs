// src/core/transport/dispatch.rs

//! Per-flow event dispatch shared by the transports.
//!
//! Each flow owns an unbounded channel fed by whatever receives broker events.
//! Nothing is read from it until the flow is started; from then on a dedicated
//! task drains it and calls the handler, one event at a time, in channel order.

use super::{FlowEvent, FlowEventHandler};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::debug;

pub(crate) struct FlowDispatcher {
    handler: Arc<dyn FlowEventHandler>,
    events: Mutex<Option<UnboundedReceiver<FlowEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FlowDispatcher {
    pub(crate) fn new(
        handler: Arc<dyn FlowEventHandler>,
        events: UnboundedReceiver<FlowEvent>,
    ) -> Self {
        Self {
            handler,
            events: Mutex::new(Some(events)),
            task: Mutex::new(None),
        }
    }

    /// Spawns the dispatch task. A second call is a no-op.
    pub(crate) fn start(&self, flow_id: u64) {
        let Some(mut events) = self.events.lock().take() else {
            return;
        };
        let handler = self.handler.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!("Flow {} dispatching event '{}'", flow_id, event);
                handler.handle_event(event);
            }
            debug!("Flow {} event stream ended.", flow_id);
        });
        *self.task.lock() = Some(task);
    }

    /// Stops delivery. Events still queued are discarded.
    pub(crate) fn stop(&self) {
        self.events.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for FlowDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
