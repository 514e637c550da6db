//! Command server: listeners, sessions and the process supervisor.
//!
//! The [`Supervisor`] runs one *generation* at a time: a control listener on
//! a local socket, a TCP listener for script submission, and a stop signal
//! shared by every script started in that generation. `STOP_SCRIPT` tears
//! the generation down and starts a new one; `EXIT` tears it down and
//! returns.

pub mod capture;
pub mod dispatch;
pub mod listener;
pub mod session;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::capability::Capabilities;
use crate::config::{Config, RestartMode};
use crate::script::{Environment, StopSignal};
use crate::transport::local::{self, BindOutcome};
use dispatch::Dispatcher;
use listener::accept_loop;

/// Requests from sessions (or the embedding process) to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Restart,
    Exit,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Another instance owns the control socket. Nothing was bound.
    #[error("another instance is already listening on {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Where a generation is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundAddrs {
    pub generation: u64,
    pub tcp: SocketAddr,
    pub control: PathBuf,
}

struct Generation {
    listeners: JoinSet<()>,
    stop: StopSignal,
    control_path: PathBuf,
}

pub struct Supervisor {
    config: Config,
    capabilities: Capabilities,
    addrs: watch::Sender<Option<BoundAddrs>>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Supervisor {
    pub fn new(config: Config, capabilities: Capabilities) -> Self {
        let (addrs, _) = watch::channel(None);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            config,
            capabilities,
            addrs,
            control_tx,
            control_rx,
        }
    }

    /// Follow the addresses of the current generation (`None` between
    /// generations).
    pub fn subscribe(&self) -> watch::Receiver<Option<BoundAddrs>> {
        self.addrs.subscribe()
    }

    /// Sender for restart / exit requests from outside a session.
    pub fn controller(&self) -> mpsc::UnboundedSender<Control> {
        self.control_tx.clone()
    }

    /// Run generations until exit is requested.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let mut generation = 0;
        loop {
            generation += 1;
            let current = self.start(generation).await?;

            let control = tokio::select! {
                control = self.control_rx.recv() => control.unwrap_or(Control::Exit),
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    Control::Exit
                }
            };

            self.teardown(current).await;

            match (control, self.config.server.restart_mode) {
                (Control::Exit, _) => {
                    info!("Server stopped");
                    return Ok(());
                }
                (Control::Restart, RestartMode::InProcess) => {
                    info!(generation, "Restarting");
                }
                (Control::Restart, RestartMode::Exec) => return Err(reexec().into()),
            }
        }
    }

    async fn start(&self, generation: u64) -> Result<Generation, SupervisorError> {
        let control_path = self.config.control_socket();
        let control_listener = match local::bind_exclusive(&control_path)
            .await
            .with_context(|| format!("Failed to bind control socket {}", control_path.display()))?
        {
            BindOutcome::Bound(listener) => listener,
            BindOutcome::InUse => return Err(SupervisorError::AlreadyRunning(control_path)),
        };

        let device = &self.capabilities.device;
        if let Err(e) = device.connect() {
            local::unlink(&control_path);
            return Err(e.context("Failed to connect device").into());
        }

        let listen_addr = self.config.listen_addr();
        let tcp = match TcpListener::bind(&listen_addr).await {
            Ok(tcp) => tcp,
            Err(e) => {
                device.disconnect();
                local::unlink(&control_path);
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to bind {listen_addr}"))
                    .into());
            }
        };
        let tcp_addr = tcp.local_addr().context("Failed to read listener address")?;

        let stop = StopSignal::new();
        let env = Environment {
            capabilities: self.capabilities.clone(),
            compiler: self.config.compiler.clone(),
            socket_dir: self.config.server.socket_dir.clone(),
            rpc_timeout: self.config.rpc.call_timeout(),
            runtime: Handle::current(),
            stop: stop.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(env, self.control_tx.clone()));

        let mut listeners = JoinSet::new();
        listeners.spawn(accept_loop("control", control_listener, Arc::clone(&dispatcher)));
        listeners.spawn(accept_loop("tcp", tcp, dispatcher));

        info!(
            generation,
            tcp = %tcp_addr,
            control = %control_path.display(),
            "Listening"
        );
        self.addrs.send_replace(Some(BoundAddrs {
            generation,
            tcp: tcp_addr,
            control: control_path.clone(),
        }));

        Ok(Generation {
            listeners,
            stop,
            control_path,
        })
    }

    async fn teardown(&self, mut generation: Generation) {
        self.addrs.send_replace(None);
        generation.stop.stop();
        generation.listeners.shutdown().await;
        local::unlink(&generation.control_path);
        self.capabilities.device.disconnect();
    }
}

/// Replace the process image with a fresh copy of this executable. Only
/// returns on failure.
fn reexec() -> anyhow::Error {
    use std::os::unix::process::CommandExt;

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return anyhow::Error::new(e).context("Failed to locate current executable"),
    };
    info!(exe = %exe.display(), "Re-executing");
    let err = std::process::Command::new(&exe)
        .args(std::env::args_os().skip(1))
        .exec();
    warn!(error = %err, "Re-exec failed");
    anyhow::Error::new(err).context(format!("Failed to re-execute {}", exe.display()))
}
