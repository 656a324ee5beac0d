//! pkgwatch: run package scripts under nodemon and merge their output.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! sets up logging, starts one watcher per script, and connects the combined
//! streams to the terminal.

mod command;
mod config;
mod logging;
mod multiplex;
mod router;
mod session;
mod supervisor;

use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::logging::LogLevel;
use crate::session::{CombinedStreams, RunOptions};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "pkgwatch",
    version,
    about = "Run package scripts under nodemon and merge their output"
)]
struct Cli {
    /// Only watch this script (default: every script with a watch entry).
    task: Option<String>,
    /// Project directory containing package.json.
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Extra config file with a "watch" section (JSON, or TOML by extension).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log verbosity (overrides PKGWATCH_LOG).
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level)?;

    let project_dir = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to resolve current dir")?,
    };
    let options = RunOptions {
        project_dir,
        task: cli.task,
        config_path: cli.config,
    };
    let CombinedStreams {
        input,
        stdout,
        stderr,
        supervisor,
        failures,
    } = session::run(options, |code| std::process::exit(code)).await?;

    if supervisor.is_empty() && !failures.is_empty() {
        let reasons: Vec<String> = failures
            .iter()
            .map(|f| format!("{}: {:#}", f.script, f.error))
            .collect();
        bail!("no script could be started ({})", reasons.join("; "));
    }

    let (input_tx, input_rx) = mpsc::channel(16);
    spawn_stdin_listener(input_tx);
    tokio::spawn(forward_input(input_rx, input));
    let stdout_task = tokio::spawn(copy_stream(stdout, tokio::io::stdout()));
    let stderr_task = tokio::spawn(copy_stream(stderr, tokio::io::stderr()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping scripts");
        }
        reports = supervisor.wait_all() => {
            // Let the pumps drain whatever the children printed last.
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let failed: Vec<&str> = reports
                .iter()
                .filter(|r| r.code != Some(0))
                .map(|r| r.script.as_str())
                .collect();
            info!(exited = reports.len(), ?failed, "all scripts exited");
        }
    }
    Ok(())
}

// Reads stdin on a plain thread; a blocking read would otherwise hold up runtime shutdown.
fn spawn_stdin_listener(tx: mpsc::Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buffer = [0u8; 1024];
        loop {
            match stdin.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

async fn forward_input(mut rx: mpsc::Receiver<Vec<u8>>, mut input: DuplexStream) {
    while let Some(chunk) = rx.recv().await {
        if let Err(err) = input.write_all(&chunk).await {
            debug!(error = %err, "operator input closed");
            break;
        }
    }
}

async fn copy_stream<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Err(err) = tokio::io::copy(&mut reader, &mut writer).await {
        debug!(error = %err, "failed to copy combined output");
    }
    let _ = writer.flush().await;
}
