//! Client side of the RPC proxy.
//!
//! A `ServiceProxy` owns a `CallTransport`. The Unix transport opens one
//! connection per call: write one descriptor line, read one result line,
//! close. There is no connection reuse and no pipelining.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tracing::debug;

use super::protocol::{CallDescriptor, CallResult};
use super::value::Value;
use super::RpcError;
use crate::transport::{local, recv_line, send_line};

/// One request/response exchange with a named service.
#[async_trait]
pub trait CallTransport: Send + Sync {
    /// Send a call and wait for its result.
    async fn exchange(&self, call: &CallDescriptor) -> Result<CallResult, RpcError>;

    /// Service name this transport addresses.
    fn service(&self) -> &str;
}

/// Transport over a Unix-domain socket at `<socket_dir>/<service>.sock`.
#[derive(Debug, Clone)]
pub struct UnixCallTransport {
    service: String,
    path: PathBuf,
}

impl UnixCallTransport {
    pub fn new(socket_dir: &std::path::Path, service: impl Into<String>) -> Self {
        let service = service.into();
        let path = local::socket_path(socket_dir, &service);
        Self { service, path }
    }

    fn transport_error(&self, message: impl std::fmt::Display) -> RpcError {
        RpcError::Transport {
            service: self.service.clone(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl CallTransport for UnixCallTransport {
    async fn exchange(&self, call: &CallDescriptor) -> Result<CallResult, RpcError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| self.transport_error(format!("connect {}: {e}", self.path.display())))?;
        let (read_half, mut write_half) = stream.into_split();

        let line = serde_json::to_string(call).map_err(|e| RpcError::Decode(e.to_string()))?;
        send_line(&mut write_half, &line)
            .await
            .map_err(|e| self.transport_error(e))?;

        let mut reader = BufReader::new(read_half);
        let reply = recv_line(&mut reader)
            .await
            .map_err(|e| self.transport_error(e))?
            .ok_or_else(|| self.transport_error("connection closed without a result"))?;

        // Both halves drop here, closing the connection.
        serde_json::from_str(&reply).map_err(|e| self.transport_error(format!("malformed result: {e}")))
    }

    fn service(&self) -> &str {
        &self.service
    }
}

/// Proxy for a remote service.
pub struct ServiceProxy {
    transport: Box<dyn CallTransport>,
    timeout: Duration,
}

impl ServiceProxy {
    pub fn new(transport: impl CallTransport + 'static, timeout: Duration) -> Self {
        Self {
            transport: Box::new(transport),
            timeout,
        }
    }

    /// Proxy for `service` in `socket_dir`.
    pub fn unix(socket_dir: &std::path::Path, service: impl Into<String>, timeout: Duration) -> Self {
        Self::new(UnixCallTransport::new(socket_dir, service), timeout)
    }

    pub fn service(&self) -> &str {
        self.transport.service()
    }

    /// Invoke `method` with `args`, each tagged by its runtime type.
    pub async fn call(&self, method: &str, args: &[Value]) -> Result<Value, RpcError> {
        let descriptor = CallDescriptor::new(method, args);
        debug!(service = %self.service(), method, args = args.len(), "Remote call");

        let result = tokio::time::timeout(self.timeout, self.transport.exchange(&descriptor))
            .await
            .map_err(|_| RpcError::Timeout {
                service: self.service().to_string(),
                method: method.to_string(),
            })??;

        result.into_value()
    }

    /// Blocking form of [`call`](Self::call) for script threads.
    ///
    /// Must be called from a thread that is not driving the runtime, e.g.
    /// inside `spawn_blocking`.
    pub fn call_blocking(
        &self,
        runtime: &tokio::runtime::Handle,
        method: &str,
        args: &[Value],
    ) -> Result<Value, RpcError> {
        runtime.block_on(self.call(method, args))
    }
}
