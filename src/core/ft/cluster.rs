// src/core/ft/cluster.rs

use crate::core::FtError;
use std::fmt;
use std::str::FromStr;
use strum_macros::{AsRefStr, Display};

const MAX_CLUSTER_NAME_LEN: usize = 200;

/// Names the exclusive resource a group of instances elects over.
/// Instances using the same name are in the same election group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterName(String);

impl ClusterName {
    pub fn new(name: impl Into<String>) -> Result<Self, FtError> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("must not be empty")
        } else if name.len() > MAX_CLUSTER_NAME_LEN {
            Some("must be at most 200 bytes")
        } else if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            Some("must not contain whitespace or control characters")
        } else if name.contains(['*', '>', '!']) {
            Some("must not contain '*', '>' or '!'")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(FtError::InvalidClusterName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClusterName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ClusterName {
    type Err = FtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// The role an instance holds within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Active,
    Backup,
}

/// What a manager can say about its membership. Derived from the last role
/// forwarded to the listener, never predicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipState {
    /// Not started, or stopped.
    Unbound,
    Bound { cluster: ClusterName, role: Role },
    /// The session went away underneath the membership. The instance is a
    /// backup until `stop()` releases it and it is started again.
    Lost { cluster: ClusterName },
}

impl MembershipState {
    pub fn role(&self) -> Option<Role> {
        match self {
            MembershipState::Bound { role, .. } => Some(*role),
            MembershipState::Lost { .. } => Some(Role::Backup),
            MembershipState::Unbound => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.role() == Some(Role::Active)
    }
}
