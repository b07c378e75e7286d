// src/core/mod.rs

//! The central module containing the fault-tolerance core, its transports and
//! the reference broker they talk to.

pub mod broker;
pub mod errors;
pub mod ft;
pub mod protocol;
pub mod signal;
pub mod transport;

pub use errors::{FtError, TransportError};
