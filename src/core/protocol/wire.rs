// src/core/protocol/wire.rs

//! The typed request and push vocabulary carried in RESP frames between a
//! remote session and the broker listener.

use super::RespFrame;
use crate::core::TransportError;
use crate::core::transport::{AccessType, FlowEvent, Permission};
use std::str::FromStr;

/// The first element of every pushed flow event.
const FLOW_EVENT_PUSH: &str = "flowevent";

/// A client request. Encoded as a RESP array of bulk strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Hello {
        client_name: String,
        username: String,
        vpn_name: String,
    },
    Provision {
        queue: String,
        access_type: AccessType,
        permission: Permission,
        ignore_exists: bool,
    },
    Bind {
        queue: String,
        active_flow_indication: bool,
    },
    Unbind {
        flow_id: u64,
    },
    Ping,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "HELLO",
            Request::Provision { .. } => "PROVISION",
            Request::Bind { .. } => "BIND",
            Request::Unbind { .. } => "UNBIND",
            Request::Ping => "PING",
        }
    }

    pub fn into_frame(self) -> RespFrame {
        let mut args = vec![RespFrame::bulk(self.name())];
        match self {
            Request::Hello {
                client_name,
                username,
                vpn_name,
            } => {
                args.push(RespFrame::bulk(client_name));
                args.push(RespFrame::bulk(username));
                args.push(RespFrame::bulk(vpn_name));
            }
            Request::Provision {
                queue,
                access_type,
                permission,
                ignore_exists,
            } => {
                args.push(RespFrame::bulk(queue));
                args.push(RespFrame::bulk(access_type));
                args.push(RespFrame::bulk(permission));
                args.push(RespFrame::bulk(flag(ignore_exists)));
            }
            Request::Bind {
                queue,
                active_flow_indication,
            } => {
                args.push(RespFrame::bulk(queue));
                args.push(RespFrame::bulk(flag(active_flow_indication)));
            }
            Request::Unbind { flow_id } => {
                args.push(RespFrame::bulk(flow_id.to_string()));
            }
            Request::Ping => {}
        }
        RespFrame::Array(args)
    }

    /// Parses the arguments of a request array.
    pub fn parse(args: &[RespFrame]) -> Result<Self, TransportError> {
        let mut words = Vec::with_capacity(args.len());
        for arg in args {
            let Some(word) = arg.as_str() else {
                return Err(protocol("request arguments must be strings"));
            };
            words.push(word);
        }

        let Some((command, rest)) = words.split_first() else {
            return Err(protocol("empty request"));
        };

        let request = match (command.to_ascii_uppercase().as_str(), rest) {
            ("HELLO", [client_name, username, vpn_name]) => Request::Hello {
                client_name: client_name.to_string(),
                username: username.to_string(),
                vpn_name: vpn_name.to_string(),
            },
            ("PROVISION", [queue, access_type, permission, ignore_exists]) => Request::Provision {
                queue: queue.to_string(),
                access_type: parse_enum(access_type)?,
                permission: parse_enum(permission)?,
                ignore_exists: parse_flag(ignore_exists)?,
            },
            ("BIND", [queue, active_flow_indication]) => Request::Bind {
                queue: queue.to_string(),
                active_flow_indication: parse_flag(active_flow_indication)?,
            },
            ("UNBIND", [flow_id]) => Request::Unbind {
                flow_id: flow_id
                    .parse()
                    .map_err(|_| protocol("flow id is not an integer"))?,
            },
            ("PING", []) => Request::Ping,
            (other, _) => {
                return Err(TransportError::Protocol(format!(
                    "unknown command or wrong number of arguments for '{other}'"
                )));
            }
        };
        Ok(request)
    }
}

/// A flow event pushed by the broker outside the request/reply sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEventPush {
    pub flow_id: u64,
    pub event: FlowEvent,
}

impl FlowEventPush {
    pub fn into_frame(self) -> RespFrame {
        RespFrame::Array(vec![
            RespFrame::bulk(FLOW_EVENT_PUSH),
            RespFrame::Integer(self.flow_id as i64),
            RespFrame::bulk(self.event),
        ])
    }

    /// Recognizes a push frame. Anything else is a reply.
    pub fn from_frame(frame: &RespFrame) -> Option<Self> {
        let RespFrame::Array(items) = frame else {
            return None;
        };
        match items.as_slice() {
            [tag, RespFrame::Integer(flow_id), event] if tag.as_str() == Some(FLOW_EVENT_PUSH) => {
                Some(Self {
                    flow_id: u64::try_from(*flow_id).ok()?,
                    event: FlowEvent::from_str(event.as_str()?).ok()?,
                })
            }
            _ => None,
        }
    }
}

fn protocol(msg: &str) -> TransportError {
    TransportError::Protocol(msg.to_string())
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

fn parse_flag(word: &str) -> Result<bool, TransportError> {
    match word {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(TransportError::Protocol(format!(
            "expected 0 or 1, got '{other}'"
        ))),
    }
}

fn parse_enum<T: FromStr>(word: &str) -> Result<T, TransportError> {
    T::from_str(word).map_err(|_| TransportError::Protocol(format!("unknown value '{word}'")))
}
