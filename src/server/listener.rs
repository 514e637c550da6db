//! Accept loops for the control socket and the script-submission port.
//!
//! Each loop owns the tasks of the sessions it accepted; aborting the loop
//! drops every one of its connections.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::dispatch::Dispatcher;
use super::session::run_session;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A bound listening socket.
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Accept one connection; the string describes the peer for logs.
    async fn accept_one(&self) -> io::Result<(Self::Stream, String)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept_one(&self) -> io::Result<(TcpStream, String)> {
        let (stream, peer) = self.accept().await?;
        Ok((stream, peer.to_string()))
    }
}

#[async_trait]
impl Acceptor for UnixListener {
    type Stream = UnixStream;

    async fn accept_one(&self) -> io::Result<(UnixStream, String)> {
        let (stream, _) = self.accept().await?;
        Ok((stream, "local".to_string()))
    }
}

/// Accept connections forever, one session task per connection.
pub async fn accept_loop<A: Acceptor>(name: &'static str, listener: A, dispatcher: Arc<Dispatcher>) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept_one() => match accepted {
                Ok((stream, peer)) => {
                    debug!(listener = name, %peer, "Accepted connection");
                    sessions.spawn(run_session(stream, Arc::clone(&dispatcher)));
                }
                Err(e) => {
                    warn!(listener = name, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        warn!(listener = name, error = %e, "Session panicked");
                    }
                }
            }
        }
    }
}
