//! Routes decoded events to their handlers.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::capture::capture_bundle;
use super::session::ConnectionWriter;
use super::Control;
use crate::script::{run_request, Environment, LogSink};
use crate::transport::{CaptureOptions, Event, EventType, RunRequest, RunResult};

/// What the session does after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Per-generation command dispatcher shared by all sessions.
pub struct Dispatcher {
    env: Environment,
    control: mpsc::UnboundedSender<Control>,
}

impl Dispatcher {
    pub const fn new(env: Environment, control: mpsc::UnboundedSender<Control>) -> Self {
        Self { env, control }
    }

    pub async fn dispatch(&self, event: Event, writer: &ConnectionWriter) -> Flow {
        debug!(kind = ?event.kind, "Dispatching event");
        match event.kind {
            EventType::Run => self.run(&event, writer).await,
            EventType::Capture => self.capture(&event, writer).await,
            EventType::StopScript => {
                info!("Stop requested, restarting");
                self.signal(Control::Restart);
                Flow::Continue
            }
            EventType::Exit => {
                info!("Exit requested");
                self.signal(Control::Exit);
                Flow::Continue
            }
            EventType::RunResult | EventType::Log => {
                debug!(kind = ?event.kind, "Ignoring server-side event from peer");
                Flow::Continue
            }
        }
    }

    fn signal(&self, control: Control) {
        if self.control.send(control).is_err() {
            warn!(?control, "Supervisor is gone, control request dropped");
        }
    }

    async fn run(&self, event: &Event, writer: &ConnectionWriter) -> Flow {
        let result = match event.payload::<RunRequest>() {
            Ok(request) => {
                let env = self.env.clone();
                let sink: Arc<dyn LogSink> = Arc::new(writer.clone());
                tokio::task::spawn_blocking(move || run_request(&env, &request, sink))
                    .await
                    .unwrap_or_else(|e| RunResult::Error(format!("script aborted: {e}")))
            }
            Err(e) => RunResult::Error(format!("invalid run request: {e}")),
        };

        match Event::run_result(&result) {
            Ok(reply) => {
                if let Err(e) = writer.send_event(&reply).await {
                    warn!(error = %e, "Failed to queue run result");
                }
                Flow::Continue
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode run result");
                Flow::Close
            }
        }
    }

    async fn capture(&self, event: &Event, writer: &ConnectionWriter) -> Flow {
        let options = match event.payload_or_default::<CaptureOptions>() {
            Ok(options) => options,
            Err(e) => {
                debug!(error = %e, "Malformed capture options");
                return Flow::Close;
            }
        };

        let caps = self.env.capabilities.clone();
        match tokio::task::spawn_blocking(move || capture_bundle(&caps, &options)).await {
            Ok(Ok(bundle)) => {
                debug!(bytes = bundle.len(), "Sending capture bundle");
                writer.send_frame(bundle).await;
            }
            Ok(Err(e)) => warn!(error = %e, "Failed to build capture bundle"),
            Err(e) => warn!(error = %e, "Capture task failed"),
        }
        Flow::Close
    }
}
