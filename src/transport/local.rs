//! Local-namespace sockets.
//!
//! A logical name such as `scriptd.shell` or `com.example.app` maps to a
//! Unix-domain socket file `<socket_dir>/<name>.sock`. Binding checks the
//! name first: a live peer means another instance owns it, a dead socket
//! file is stale and gets removed.

use std::io;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

/// Socket path for a logical local name.
pub fn socket_path(socket_dir: &Path, name: &str) -> PathBuf {
    socket_dir.join(format!("{name}.sock"))
}

/// Outcome of probing a local name.
#[derive(Debug)]
pub enum BindOutcome {
    /// The name was free (or stale) and is now bound.
    Bound(UnixListener),
    /// Another process is accepting on this name.
    InUse,
}

/// Whether a live listener currently accepts on `path`.
pub async fn is_live(path: &Path) -> bool {
    UnixStream::connect(path).await.is_ok()
}

/// Bind `path`, unless a live peer already owns it.
pub async fn bind_exclusive(path: &Path) -> io::Result<BindOutcome> {
    if is_live(path).await {
        return Ok(BindOutcome::InUse);
    }

    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed stale socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    UnixListener::bind(path).map(BindOutcome::Bound)
}

/// Remove a socket file, ignoring a missing one.
pub fn unlink(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "Failed to remove socket file"),
    }
}
