//! Cross-process method calls over named local sockets.
//!
//! The client side ([`client::ServiceProxy`]) turns each invocation into a
//! [`protocol::CallDescriptor`], opens a fresh connection to the socket
//! named after the service, sends one line and reads one line back. The
//! server side ([`server::serve`]) resolves the descriptor against an
//! explicit [`registry::Service`] table keyed by method name and parameter
//! type list.
//!
//! Failures on the server side never produce a structured error: the
//! connection is closed and the client observes a transport failure.

pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod services;
pub mod value;

pub use client::{CallTransport, ServiceProxy, UnixCallTransport};
pub use protocol::{CallArg, CallDescriptor, CallResult};
pub use registry::Service;
pub use value::{FromValue, IntoValue, TypeTag, Value};

use thiserror::Error;

/// Errors raised on either side of an RPC exchange.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Connection failed, or closed before a result arrived.
    #[error("transport failure calling {service}: {message}")]
    Transport { service: String, message: String },

    /// The call did not complete within the configured timeout.
    #[error("call to {service}.{method} timed out")]
    Timeout { service: String, method: String },

    #[error("unknown type tag: {0}")]
    UnknownType(String),

    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: TypeTag, found: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("no method {method}({signature})")]
    NoSuchMethod { method: String, signature: String },

    #[error("invocation of {method} failed: {message}")]
    Invocation { method: String, message: String },
}

impl RpcError {
    pub fn invocation(method: &str, message: impl std::fmt::Display) -> Self {
        Self::Invocation {
            method: method.to_string(),
            message: message.to_string(),
        }
    }
}
