// src/lib.rs

pub mod config;
pub mod core;

// Re-export
pub use crate::core::ft::{
    ClusterName, FnListener, FtConnection, FtEventListener, FtManager, MembershipState, Role,
};
pub use crate::core::{FtError, TransportError};
