//! Interactive client: every input line is submitted as a script.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::transport::{recv_line, send_line, Event, EventType, RunRequest, RunResult};

const PROMPT: &str = "> ";

/// Line that ends the shell. The server keeps running.
const QUIT: &str = "exit";

#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub addr: String,
    pub working_dir: String,
    pub owner: Option<String>,
}

/// Connect to the server and run the read-submit-print loop over
/// `input` / `output` until `exit` or end of input.
pub async fn run_shell<I, O>(options: &ShellOptions, mut input: I, mut output: O) -> Result<()>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let stream = TcpStream::connect(&options.addr)
        .await
        .with_context(|| format!("Failed to connect to {}", options.addr))?;
    debug!(addr = %options.addr, "Connected");
    let (read_half, mut write_half) = stream.into_split();
    let mut replies = BufReader::new(read_half);

    loop {
        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;

        let Some(line) = recv_line(&mut input).await? else {
            break;
        };
        let source = line.trim();
        if source == QUIT {
            break;
        }
        if source.is_empty() {
            continue;
        }

        let request = RunRequest {
            working_dir: options.working_dir.clone(),
            source_text: Some(source.to_string()),
            owner_id: options.owner.clone(),
        };
        send_line(&mut write_half, &Event::run(&request)?.encode()?).await?;

        loop {
            let reply = recv_line(&mut replies)
                .await?
                .context("Server closed the connection")?;
            let event = Event::decode(&reply)?;
            match event.kind {
                EventType::Log => {
                    let value: serde_json::Value = event.payload()?;
                    print_line(&mut output, &render(&value)).await?;
                }
                EventType::RunResult => {
                    let text = match event.payload::<RunResult>()? {
                        RunResult::Value(value) => render(&value),
                        RunResult::Error(message) => format!("error: {message}"),
                    };
                    print_line(&mut output, &text).await?;
                    break;
                }
                other => debug!(kind = ?other, "Unexpected event from server"),
            }
        }
    }

    Ok(())
}

/// Strings print bare, everything else as JSON.
fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn print_line<O: AsyncWrite + Unpin>(output: &mut O, text: &str) -> Result<()> {
    output.write_all(text.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Answers every RUN with one LOG echoing the source and a result.
    async fn fake_server() -> (String, tokio::task::JoinHandle<Vec<RunRequest>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut seen = Vec::new();
            while let Some(line) = recv_line(&mut reader).await.unwrap() {
                let request: RunRequest = Event::decode(&line).unwrap().payload().unwrap();
                let source = request.source_text.clone().unwrap_or_default();
                let log = Event::log(&serde_json::json!(source)).unwrap();
                send_line(&mut write_half, &log.encode().unwrap()).await.unwrap();
                let result = if source == "boom" {
                    RunResult::Error("bad".into())
                } else {
                    RunResult::Value(serde_json::json!([1, "two"]))
                };
                let reply = Event::run_result(&result).unwrap();
                send_line(&mut write_half, &reply.encode().unwrap()).await.unwrap();
                seen.push(request);
            }
            seen
        });
        (addr, task)
    }

    #[tokio::test]
    async fn prints_logs_then_results_and_stops_at_exit() {
        let (addr, server) = fake_server().await;
        let options = ShellOptions {
            addr,
            working_dir: "/work".into(),
            owner: None,
        };
        let input: &[u8] = b"1 + 1\n\nboom\nexit\nnever sent\n";
        let mut output = Vec::new();

        run_shell(&options, input, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        assert_eq!(text, "> 1 + 1\n[1,\"two\"]\n> > boom\nerror: bad\n> ");

        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].working_dir, "/work");
    }
}
