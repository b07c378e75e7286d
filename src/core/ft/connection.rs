// src/core/ft/connection.rs

use super::cluster::ClusterName;
use crate::config::SessionProperties;
use crate::core::{FtError, TransportError};
use crate::core::transport::remote::RemoteSession;
use crate::core::transport::{
    AccessType, Capabilities, ConsumerFlowProperties, Endpoint, EndpointProperties, Flow,
    FlowEventHandler, Permission, ProvisionFlags, TransportSession,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Checks that a session supports everything fault tolerance relies on.
pub fn validate_capabilities(capabilities: Capabilities) -> Result<(), FtError> {
    let missing = Capabilities::FAULT_TOLERANCE.difference(capabilities);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(FtError::InsufficientCapabilities { missing })
    }
}

/// A broker session known to support fault tolerance.
#[derive(Clone)]
pub struct FtConnection {
    session: Arc<dyn TransportSession>,
}

impl FtConnection {
    /// Adopts an already established session.
    pub fn from_session(session: Arc<dyn TransportSession>) -> Result<Self, FtError> {
        let capabilities = session.capabilities();
        if let Err(e) = validate_capabilities(capabilities) {
            warn!("Rejecting session: {}", e);
            return Err(e);
        }
        debug!("Session capabilities {:?} accepted.", capabilities);
        Ok(Self { session })
    }

    /// Connects to a broker over TCP and adopts the resulting session.
    pub async fn connect(properties: &SessionProperties) -> Result<Self, FtError> {
        properties.validate()?;
        let session = RemoteSession::connect(properties).await?;
        Self::from_session(Arc::new(session))
    }

    pub fn session(&self) -> &Arc<dyn TransportSession> {
        &self.session
    }

    /// Provisions the cluster's exclusive queue if needed, then opens and
    /// starts a flow on it that reports activation to `handler`.
    ///
    /// A queue provisioned before a failed bind is left in place.
    pub async fn bind_exclusive(
        &self,
        cluster: &ClusterName,
        handler: Arc<dyn FlowEventHandler>,
    ) -> Result<Box<dyn Flow>, FtError> {
        let bind_error = |source: TransportError| FtError::Bind {
            cluster: cluster.to_string(),
            source,
        };

        let endpoint = Endpoint::queue(cluster.as_str());
        let properties = EndpointProperties {
            access_type: AccessType::Exclusive,
            permission: Permission::Delete,
        };
        self.session
            .provision(
                &endpoint,
                &properties,
                ProvisionFlags::IGNORE_ALREADY_EXISTS,
            )
            .await
            .map_err(bind_error)?;

        let flow_properties =
            ConsumerFlowProperties::new(endpoint).with_active_flow_indication(true);
        let flow = self
            .session
            .create_flow(flow_properties, handler)
            .await
            .map_err(bind_error)?;

        if let Err(e) = flow.start().await {
            let _ = flow.close().await;
            return Err(bind_error(e));
        }
        info!("Bound flow {} to cluster '{}'.", flow.id(), cluster);
        Ok(flow)
    }
}
