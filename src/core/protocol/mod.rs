// src/core/protocol/mod.rs

//! Broker wire protocol: RESP framing plus the request/push vocabulary.

pub mod resp_frame;
pub mod wire;

pub use resp_frame::{RespFrame, RespFrameCodec};
pub use wire::{FlowEventPush, Request};
