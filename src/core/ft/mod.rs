// src/core/ft/mod.rs

//! Application fault tolerance: leader election over a broker's exclusive queues.
//!
//! Every instance of a cluster binds a flow to the same exclusive queue. The
//! broker makes exactly one of those flows active and tells each flow when
//! that changes; this module turns those notifications into
//! `on_active`/`on_backup` calls on the application's listener.

pub mod cluster;
pub mod connection;
pub mod listener;
pub mod manager;
pub mod translator;

pub use cluster::{ClusterName, MembershipState, Role};
pub use connection::{FtConnection, validate_capabilities};
pub use listener::{FnListener, FtEventListener};
pub use manager::FtManager;
pub use translator::RoleTranslator;
