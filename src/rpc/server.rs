//! Server side of the RPC proxy.
//!
//! Each accepted connection carries exactly one call. Handlers run on the
//! blocking pool so a slow target does not stall the accept loop; concurrent
//! callers are served concurrently unless the target serializes itself.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{CallDescriptor, CallResult};
use super::registry::Service;
use crate::transport::local::{self, BindOutcome};
use crate::transport::{recv_line, send_line};

/// A bound service socket. Dropping the handle stops the accept loop and
/// removes the socket file.
pub struct ServiceHandle {
    task: JoinHandle<()>,
    path: std::path::PathBuf,
}

impl ServiceHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.task.abort();
        local::unlink(&self.path);
    }
}

/// Bind `<socket_dir>/<service name>.sock` and serve `service` on it.
pub async fn bind_service(socket_dir: &Path, service: Service) -> Result<ServiceHandle> {
    let path = local::socket_path(socket_dir, service.name());
    let listener = match local::bind_exclusive(&path)
        .await
        .with_context(|| format!("Failed to bind service socket {}", path.display()))?
    {
        BindOutcome::Bound(listener) => listener,
        BindOutcome::InUse => anyhow::bail!("Service {} is already served", service.name()),
    };

    info!(service = %service.name(), path = %path.display(), "Serving RPC service");
    let task = tokio::spawn(serve(listener, Arc::new(service)));
    Ok(ServiceHandle { task, path })
}

/// Accept loop: one task per connection, one call per connection.
pub async fn serve(listener: UnixListener, service: Arc<Service>) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(service = %service.name(), error = %e, "RPC accept failed");
                return;
            }
        };

        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = handle_call(stream, service.clone()).await {
                // The peer sees a closed connection, nothing else.
                debug!(service = %service.name(), error = %e, "Dropped RPC connection");
            }
        });
    }
}

async fn handle_call(stream: UnixStream, service: Arc<Service>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let line = recv_line(&mut reader)
        .await?
        .context("Connection closed before a call arrived")?;
    let call: CallDescriptor = serde_json::from_str(&line).context("Malformed call descriptor")?;

    debug!(service = %service.name(), method = %call.method, "Dispatching call");
    let value = tokio::task::spawn_blocking(move || service.invoke(&call))
        .await
        .context("RPC handler panicked")??;

    let reply = serde_json::to_string(&CallResult::from_value(&value))?;
    send_line(&mut write_half, &reply).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcError, ServiceProxy, TypeTag, Value};
    use std::time::Duration;

    fn echo_service(name: &str) -> Service {
        Service::builder(name)
            .method1("echo", |s: String| Ok(s))
            .method1("half", |n: i64| {
                #[allow(clippy::cast_precision_loss)]
                let half = n as f64 / 2.0;
                Ok(half)
            })
            .method("describe", &[TypeTag::Int], |args| {
                // Heterogeneous result: the concrete type decides the tag.
                Ok(match args[0] {
                    Value::Int(0) => Value::Unit,
                    Value::Int(n) if n < 0 => Value::from("negative"),
                    Value::Int(n) => Value::List(vec![Value::Int(n), Value::Bool(n % 2 == 0)]),
                    _ => unreachable!("resolved by signature"),
                })
            })
            .method0("fail", || -> Result<(), RpcError> { Err(RpcError::invocation("fail", "boom")) })
            .build()
    }

    #[tokio::test]
    async fn round_trip_keeps_result_types() {
        let dir = tempfile::tempdir().unwrap();
        let _handle = bind_service(dir.path(), echo_service("pkg.echo")).await.unwrap();
        let proxy = ServiceProxy::unix(dir.path(), "pkg.echo", Duration::from_secs(5));

        assert_eq!(proxy.call("echo", &[Value::from("hi")]).await.unwrap(), Value::from("hi"));
        assert_eq!(proxy.call("half", &[Value::Int(4)]).await.unwrap(), Value::Float(2.0));
        assert_eq!(proxy.call("describe", &[Value::Int(0)]).await.unwrap(), Value::Unit);
        assert_eq!(
            proxy.call("describe", &[Value::Int(-1)]).await.unwrap(),
            Value::from("negative")
        );
        assert_eq!(
            proxy.call("describe", &[Value::Int(4)]).await.unwrap(),
            Value::List(vec![Value::Int(4), Value::Bool(true)])
        );
    }

    #[tokio::test]
    async fn unresolvable_calls_close_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let _handle = bind_service(dir.path(), echo_service("pkg.strict")).await.unwrap();
        let proxy = ServiceProxy::unix(dir.path(), "pkg.strict", Duration::from_secs(5));

        for (method, args) in [
            ("missing", vec![]),
            ("echo", vec![Value::Int(1)]),
            ("echo", vec![Value::from("a"), Value::from("b")]),
            ("fail", vec![]),
        ] {
            let err = proxy.call(method, &args).await.unwrap_err();
            assert!(
                matches!(err, RpcError::Transport { .. }),
                "{method}: expected transport failure, got {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn garbage_line_closes_without_reply() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        let handle = bind_service(dir.path(), echo_service("pkg.garbage")).await.unwrap();

        let mut stream = UnixStream::connect(handle.path()).await.unwrap();
        send_line(&mut stream, "{{{").await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn dropping_the_handle_removes_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let handle = bind_service(dir.path(), echo_service("pkg.gone")).await.unwrap();
        let path = handle.path().to_path_buf();
        assert!(path.exists());
        drop(handle);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn second_binding_of_same_name_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _first = bind_service(dir.path(), echo_service("pkg.once")).await.unwrap();
        assert!(bind_service(dir.path(), echo_service("pkg.once")).await.is_err());
    }
}
