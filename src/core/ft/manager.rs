// src/core/ft/manager.rs

//! The application-facing fault-tolerance facade.

use super::cluster::{ClusterName, MembershipState, Role};
use super::connection::FtConnection;
use super::listener::FtEventListener;
use super::translator::RoleTranslator;
use crate::core::FtError;
use crate::core::transport::Flow;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// One membership: the translator is installed before the bind, the flow once
/// the bind has succeeded.
struct Membership {
    translator: Arc<RoleTranslator>,
    flow: Option<Box<dyn Flow>>,
}

/// A membership installed by `start` whose bind has not finished yet.
/// Dropped without `complete`, it closes the translator and clears the slot.
struct PendingJoin<'a> {
    membership: &'a Mutex<Option<Membership>>,
    translator: Arc<RoleTranslator>,
    armed: bool,
}

impl PendingJoin<'_> {
    fn complete(mut self, flow: Box<dyn Flow>) {
        if let Some(membership) = self.membership.lock().as_mut() {
            membership.flow = Some(flow);
        }
        self.armed = false;
    }
}

impl Drop for PendingJoin<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.translator.close();
        let mut membership = self.membership.lock();
        if membership
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(&current.translator, &self.translator))
        {
            membership.take();
        }
    }
}

/// Joins one cluster at a time on a capability-checked connection.
pub struct FtManager {
    connection: FtConnection,
    /// Serializes `start` and `stop`.
    lifecycle: AsyncMutex<()>,
    membership: Mutex<Option<Membership>>,
}

impl FtManager {
    pub fn new(connection: FtConnection) -> Self {
        Self {
            connection,
            lifecycle: AsyncMutex::new(()),
            membership: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &FtConnection {
        &self.connection
    }

    /// Joins `cluster`. The listener hears `on_backup` before the bind is
    /// issued; activation, if it comes, is reported later by the broker.
    ///
    /// Returns once the flow is started. On failure the manager stays unbound
    /// and `start` may be retried.
    pub async fn start(
        &self,
        cluster: &str,
        listener: Arc<dyn FtEventListener>,
    ) -> Result<(), FtError> {
        let cluster = ClusterName::new(cluster)?;
        let _lifecycle = self.lifecycle.lock().await;

        let join = {
            let mut membership = self.membership.lock();
            if let Some(current) = membership.as_ref() {
                return Err(FtError::AlreadyStarted(
                    current.translator.cluster().to_string(),
                ));
            }
            let translator = Arc::new(RoleTranslator::new(cluster.clone(), listener));
            *membership = Some(Membership {
                translator: translator.clone(),
                flow: None,
            });
            PendingJoin {
                membership: &self.membership,
                translator,
                armed: true,
            }
        };

        info!("Joining cluster '{}'.", cluster);
        join.translator.announce(Role::Backup);

        // If this future is dropped mid-bind, `join` undoes the membership.
        match self
            .connection
            .bind_exclusive(&cluster, join.translator.clone())
            .await
        {
            Ok(flow) => {
                join.complete(flow);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to join cluster '{}': {}", cluster, e);
                Err(e)
            }
        }
    }

    /// Leaves the current cluster, releasing the exclusive queue so another
    /// instance can be elected. An Active listener is demoted to Backup first.
    /// Does nothing when not started.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(membership) = self.membership.lock().take() else {
            return;
        };

        let cluster = membership.translator.cluster().clone();
        membership.translator.release();
        if let Some(flow) = membership.flow {
            if let Err(e) = flow.close().await {
                warn!("Error closing flow for cluster '{}': {}", cluster, e);
            }
        }
        info!("Left cluster '{}'.", cluster);
    }

    pub fn state(&self) -> MembershipState {
        // The gate is held during callbacks; never wait on it under this lock.
        let translator = self
            .membership
            .lock()
            .as_ref()
            .map(|membership| membership.translator.clone());
        match translator {
            Some(translator) => translator.state(),
            None => MembershipState::Unbound,
        }
    }
}
