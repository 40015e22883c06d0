use clap::Parser;
use nexuswatch::{Collaborators, Command, CommandResponse, EngineConfig, MonitorEngine};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "nexuswatch.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // stdout carries the command protocol, so human-readable logs go to stderr.
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
}

type Stdout = Arc<Mutex<tokio::io::Stdout>>;

/// Writes `value` as one NDJSON line and flushes. Returns whether the line
/// went out; failures are logged.
async fn write_line<W, T>(out: &Mutex<W>, value: &T) -> bool
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = match serde_json::to_vec(value) {
        Ok(line) => line,
        Err(e) => {
            error!(error = %e, "Failed to serialize output line.");
            return false;
        }
    };
    line.push(b'\n');
    let mut out = out.lock().await;
    if let Err(e) = out.write_all(&line).await {
        error!(error = %e, "Failed to write to stdout.");
        return false;
    }
    if let Err(e) = out.flush().await {
        error!(error = %e, "Failed to flush stdout.");
        return false;
    }
    true
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let config = EngineConfig::load(args.config.as_deref())?;
    init_logging(&config.log_dir);
    info!(version = VERSION, sandbox = config.sandbox, "Starting nexuswatch.");

    let collaborators = Collaborators::from_config(&config).await;
    let engine = MonitorEngine::new(config, collaborators)?;
    let report = engine.initialize().await;
    info!(started = report.started.len(), conflicts = report.conflicts, "Engine initialized.");

    let stdout: Stdout = Arc::new(Mutex::new(tokio::io::stdout()));

    let mut events = engine.subscribe();
    let event_stdout = stdout.clone();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    write_line(event_stdout.as_ref(), &serde_json::json!({ "event": event })).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event printer fell behind; events dropped.");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down.");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Command input closed, shutting down.");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read command input.");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<Command>(&line) {
                    Ok(command) => engine.execute(command).await,
                    Err(e) => CommandResponse::failure(format!(
                        "Could not parse command: {e}. Send one JSON object per line, e.g. {{\"command\":\"list\"}}"
                    )),
                };
                write_line(stdout.as_ref(), &response).await;
            }
        }
    }

    engine.shutdown().await;
    event_task.abort();
    info!("nexuswatch stopped.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Accepts writes but fails every flush.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed")))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_line_emits_ndjson() {
        let out = Mutex::new(Vec::new());
        assert!(write_line(&out, &CommandResponse::ok("done")).await);
        let written = out.into_inner();
        assert!(written.ends_with(b"\n"));
        let value: serde_json::Value = serde_json::from_slice(&written).unwrap();
        assert_eq!(value["success"], true);
    }

    #[tokio::test]
    async fn test_write_line_reports_flush_failure() {
        let out = Mutex::new(BrokenPipe);
        assert!(!write_line(&out, &CommandResponse::ok("done")).await);
    }
}
