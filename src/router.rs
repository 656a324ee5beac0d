//! Routing of operator commands to supervised scripts.
//!
//! The operator types `rs <script>` to force a restart of one script. Everything
//! else is reported and ignored.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use crate::supervisor::{DispatchError, Supervisor};

// `\w` is kept ASCII-only and the match is not anchored at the end.
static RESTART_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^rs\s+([A-Za-z0-9_]+)").expect("restart pattern is valid")
});

/// Result of handling one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Dispatched(String),
    Unrecognized(String),
    NotFound(String),
    Failed(String),
}

/// Extracts the script name from an `rs <script>` command.
pub fn parse_restart(line: &str) -> Option<&str> {
    let line = line.trim_end_matches(['\r', '\n']);
    RESTART_PATTERN
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Handles one operator line, logging anything that is not dispatched.
pub async fn handle_line(supervisor: &Supervisor, line: &str) -> RouteOutcome {
    let Some(script) = parse_restart(line) else {
        let input = line.trim_end_matches(['\r', '\n']).to_string();
        warn!("Unrecognized input: {}", input);
        return RouteOutcome::Unrecognized(input);
    };
    match supervisor.dispatch_restart(script).await {
        Ok(()) => {
            debug!(script = %script, "restart requested");
            RouteOutcome::Dispatched(script.to_string())
        }
        Err(DispatchError::NotFound(name)) => {
            warn!("Couldn't find process: {}", name);
            RouteOutcome::NotFound(name)
        }
        Err(err) => {
            warn!(script = %script, "{}", err);
            RouteOutcome::Failed(script.to_string())
        }
    }
}

/// Reads operator input until end-of-stream, dispatching every restart command.
pub async fn route<R>(input: R, supervisor: Arc<Supervisor>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(input);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                handle_line(&supervisor, &line).await;
            }
            Err(err) => {
                debug!(error = %err, "operator input closed");
                break;
            }
        }
    }
}
