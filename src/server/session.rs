//! One accepted connection.
//!
//! The read side decodes one event per line and hands it to the
//! [`Dispatcher`]. Every write, whether a reply or a `LOG` line from a
//! running script, goes through a [`ConnectionWriter`] into a single write
//! loop, so output order equals enqueue order.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use super::dispatch::{Dispatcher, Flow};
use crate::rpc::Value;
use crate::script::LogSink;
use crate::transport::{recv_line, send_frame, send_line, Event};

/// Lines and frames a connection may have queued before writers wait.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Output queued for a connection.
#[derive(Debug)]
pub enum Outbound {
    Line(String),
    Frame(Vec<u8>),
    /// Stop writing and shut the connection down.
    Close,
}

/// Cloneable handle that enqueues writes for one connection.
///
/// The queue is bounded: a slow peer holds up whoever is writing, including
/// a script emitting `LOG` lines.
#[derive(Debug, Clone)]
pub struct ConnectionWriter {
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionWriter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an event. Fails only if it cannot be encoded; a closed
    /// connection drops it silently.
    pub async fn send_event(&self, event: &Event) -> Result<()> {
        let line = event.encode()?;
        self.push(Outbound::Line(line)).await;
        Ok(())
    }

    pub async fn send_frame(&self, payload: Vec<u8>) {
        self.push(Outbound::Frame(payload)).await;
    }

    pub async fn close(&self) {
        self.push(Outbound::Close).await;
    }

    async fn push(&self, out: Outbound) {
        if self.tx.send(out).await.is_err() {
            debug!("Connection already closed, dropping output");
        }
    }
}

/// Scripts log from blocking workers, so the sink waits synchronously.
impl LogSink for ConnectionWriter {
    fn emit(&self, value: Value) {
        let line = match Event::log(&value.to_json()).and_then(|event| event.encode()) {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "Failed to encode log line");
                return;
            }
        };
        if self.tx.blocking_send(Outbound::Line(line)).is_err() {
            debug!("Connection already closed, dropping log line");
        }
    }
}

/// Serve one connection until EOF, a malformed line or a close request.
pub async fn run_session<S>(stream: S, dispatcher: Arc<Dispatcher>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (writer, rx) = ConnectionWriter::channel(OUTBOUND_CAPACITY);

    let (_, written) = tokio::join!(
        read_loop(read_half, writer, dispatcher),
        write_loop(write_half, rx)
    );
    if let Err(e) = written {
        debug!(error = %e, "Connection write failed");
    }
    debug!("Session ended");
}

async fn read_loop<R>(read_half: R, writer: ConnectionWriter, dispatcher: Arc<Dispatcher>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(read_half);
    loop {
        let line = match recv_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Peer closed the connection");
                break;
            }
            Err(e) => {
                debug!(error = %e, "Read failed");
                break;
            }
        };

        let event = match Event::decode(&line) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Malformed event, closing connection");
                writer.close().await;
                break;
            }
        };

        if dispatcher.dispatch(event, &writer).await == Flow::Close {
            writer.close().await;
            break;
        }
    }
}

async fn write_loop<W>(mut write_half: W, mut rx: mpsc::Receiver<Outbound>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Line(line) => send_line(&mut write_half, &line).await?,
            Outbound::Frame(payload) => send_frame(&mut write_half, &payload).await?,
            Outbound::Close => break,
        }
    }
    write_half.shutdown().await?;
    Ok(())
}
