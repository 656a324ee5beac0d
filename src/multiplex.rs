//! Merging of child output into the combined streams.
//!
//! Each piped child gets one pipeline per stream: the child's output is split into
//! lines, each line passes through a `LineStage` (prefixing, hint filtering and
//! clear-on-restart), and the result is written to a shared sink. All children write
//! into the same two sinks, one for stdout and one for stderr.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::Mutex;
use tracing::debug;

/// Hint printed once by the watch tool; dropped from prefixed output.
pub const RESTART_HINT: &str = "to restart at any time";

/// Status line printed by the watch tool when it restarts a script.
pub const RESTART_NOTICE: &str = "restarting due to changes...";

/// Terminal sequence that clears the screen and scrollback.
pub const CLEAR_SCREEN: &str = if cfg!(windows) {
    "\x1B[2J\x1B[0f"
} else {
    "\x1B[2J\x1B[3J\x1B[H"
};

/// Default buffer size of each combined stream.
pub const STREAM_CAPACITY: usize = 64 * 1024;

/// Indicates the source stream of a child's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A writer shared by every child feeding one combined stream.
///
/// Each call to `write_line` holds the lock for the whole line, so lines from
/// different children never interleave mid-line.
#[derive(Debug, Clone)]
pub struct SharedSink {
    inner: Arc<Mutex<DuplexStream>>,
}

impl SharedSink {
    fn new(stream: DuplexStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    /// Writes one complete line (or control sequence).
    pub async fn write_line(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut stream = self.inner.lock().await;
        stream.write_all(bytes).await?;
        stream.flush().await
    }
}

/// The write side of the two combined streams.
#[derive(Debug, Clone)]
pub struct CombinedOutput {
    pub stdout: SharedSink,
    pub stderr: SharedSink,
}

/// Creates the combined streams.
///
/// Returns the shared write side along with the read halves for stdout and stderr.
/// A read half reaches end-of-stream once every clone of its sink is dropped.
pub fn combined_output(capacity: usize) -> (CombinedOutput, DuplexStream, DuplexStream) {
    let (stdout_tx, stdout_rx) = tokio::io::duplex(capacity);
    let (stderr_tx, stderr_rx) = tokio::io::duplex(capacity);
    let output = CombinedOutput {
        stdout: SharedSink::new(stdout_tx),
        stderr: SharedSink::new(stderr_tx),
    };
    (output, stdout_rx, stderr_rx)
}

/// Per-line transform applied between a child and a combined stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineStage {
    /// Prefix inserted before every line; `None` forwards lines verbatim.
    pub prefix: Option<String>,
    /// Emit `CLEAR_SCREEN` before a restart notice.
    pub clear_on_restart: bool,
}

impl LineStage {
    /// Builds the stage for one stream of a script.
    ///
    /// Quiet scripts are not prefixed or filtered. Clearing only applies to stdout.
    pub fn for_stream(script: &str, kind: StreamKind, quiet: bool, clear_buffer: bool) -> Self {
        Self {
            prefix: (!quiet).then(|| format!("[{}] ", script)),
            clear_on_restart: clear_buffer && kind == StreamKind::Stdout,
        }
    }

    /// Transforms one line into the chunks to write, in order.
    pub fn transform(&self, line: &[u8]) -> Vec<Vec<u8>> {
        let text = String::from_utf8_lossy(line);
        let mut out = Vec::new();
        if self.clear_on_restart && text.contains(RESTART_NOTICE) {
            out.push(CLEAR_SCREEN.as_bytes().to_vec());
        }
        match &self.prefix {
            Some(prefix) => {
                if !text.contains(RESTART_HINT) {
                    let mut prefixed = Vec::with_capacity(prefix.len() + line.len());
                    prefixed.extend_from_slice(prefix.as_bytes());
                    prefixed.extend_from_slice(line);
                    out.push(prefixed);
                }
            }
            None => out.push(line.to_vec()),
        }
        out
    }
}

/// Pumps `reader` line by line through `stage` into `sink` until end-of-stream.
///
/// A trailing line without a newline is flushed as-is.
pub async fn pump<R>(reader: R, stage: LineStage, sink: SharedSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                for chunk in stage.transform(&line) {
                    if let Err(err) = sink.write_line(&chunk).await {
                        debug!(error = %err, "combined stream closed");
                        return;
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, "failed to read child output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn prefixes_lines() {
        let stage = LineStage::for_stream("api", StreamKind::Stdout, false, false);
        assert_eq!(
            stage.transform(b"Server started\n"),
            vec![b"[api] Server started\n".to_vec()]
        );
    }

    #[test]
    fn drops_restart_hint() {
        let stage = LineStage::for_stream("api", StreamKind::Stdout, false, false);
        let out = stage.transform(b"[nodemon] to restart at any time, enter `rs`\n");
        assert!(out.is_empty());
    }

    #[test]
    fn quiet_forwards_verbatim() {
        let stage = LineStage::for_stream("api", StreamKind::Stderr, true, false);
        let line = b"[nodemon] to restart at any time, enter `rs`\n";
        assert_eq!(stage.transform(line), vec![line.to_vec()]);
    }

    #[test]
    fn clears_before_restart_notice_on_stdout_only() {
        let stdout = LineStage::for_stream("web", StreamKind::Stdout, false, true);
        let out = stdout.transform(b"[nodemon] restarting due to changes...\n");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], CLEAR_SCREEN.as_bytes());
        assert_eq!(out[1], b"[web] [nodemon] restarting due to changes...\n".to_vec());

        let stderr = LineStage::for_stream("web", StreamKind::Stderr, false, true);
        let out = stderr.transform(b"[nodemon] restarting due to changes...\n");
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn pump_reassembles_split_chunks() {
        let (mut child, child_out) = tokio::io::duplex(64);
        let (output, mut stdout_rx, _stderr_rx) = combined_output(1024);
        let stage = LineStage::for_stream("api", StreamKind::Stdout, false, false);
        let task = tokio::spawn(pump(child_out, stage, output.stdout.clone()));
        drop(output);

        child.write_all(b"Server st").await.unwrap();
        child.write_all(b"arted\nlistening").await.unwrap();
        child.write_all(b" on 3000").await.unwrap();
        drop(child);
        task.await.unwrap();

        let mut merged = String::new();
        stdout_rx.read_to_string(&mut merged).await.unwrap();
        assert_eq!(merged, "[api] Server started\n[api] listening on 3000");
    }

    #[tokio::test]
    async fn pumps_share_one_stream() {
        let (output, mut stdout_rx, _stderr_rx) = combined_output(1024);
        let api = LineStage::for_stream("api", StreamKind::Stdout, false, false);
        let web = LineStage::for_stream("web", StreamKind::Stdout, false, false);
        let first = tokio::spawn(pump(&b"one\ntwo\n"[..], api, output.stdout.clone()));
        let second = tokio::spawn(pump(&b"three\n"[..], web, output.stdout.clone()));
        drop(output);
        first.await.unwrap();
        second.await.unwrap();

        let mut merged = String::new();
        stdout_rx.read_to_string(&mut merged).await.unwrap();
        let lines: Vec<&str> = merged.lines().collect();
        assert_eq!(lines.len(), 3);
        let api_lines: Vec<&str> = lines
            .iter()
            .copied()
            .filter(|l| l.starts_with("[api]"))
            .collect();
        assert_eq!(api_lines, vec!["[api] one", "[api] two"]);
        assert!(lines.contains(&"[web] three"));
    }
}
