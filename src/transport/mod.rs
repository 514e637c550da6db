//! Wire codec shared by the command server, the shell client and the RPC
//! proxy.
//!
//! Two framings are used:
//! - UTF-8 lines, one JSON record per line, newline-terminated.
//! - A single length-prefixed binary payload for bulk responses:
//!   [4-byte big-endian length][payload bytes]

pub mod local;
pub mod protocol;

pub use protocol::{CaptureInfo, CaptureOptions, Event, EventType, RunRequest, RunResult};

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

/// Maximum line / frame size (64 MB). Safety valve against malformed peers.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Write one line and flush it.
///
/// The line must not contain a newline; JSON produced by `serde_json`
/// never does.
pub async fn send_line<W: AsyncWriteExt + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    anyhow::ensure!(!line.contains('\n'), "Line contains an embedded newline");
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read one line, without its terminator.
///
/// Returns `None` on a clean EOF. A final line without a trailing newline is
/// still returned. Enforces `MAX_MESSAGE_SIZE`.
pub async fn recv_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = String::new();
    let n = reader
        .take(u64::from(MAX_MESSAGE_SIZE) + 1)
        .read_line(&mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }

    anyhow::ensure!(
        n <= MAX_MESSAGE_SIZE as usize,
        "Line exceeds max size: {n} > {MAX_MESSAGE_SIZE}"
    );

    if buf.ends_with('\n') {
        buf.pop();
        if buf.ends_with('\r') {
            buf.pop();
        }
    }
    Ok(Some(buf))
}

/// Write a length-prefixed binary frame.
pub async fn send_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| anyhow::anyhow!("Frame too large: {} bytes", payload.len()))?;
    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Frame exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed binary frame.
pub async fn recv_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Frame exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
