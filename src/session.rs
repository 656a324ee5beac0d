//! Entry point of one watch session.
//!
//! `run` resolves configuration, starts one supervised child per selected script, and
//! hands the caller the combined streams. The caller attaches its own I/O to them and
//! decides when the session ends.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Error, Result};
use tokio::io::DuplexStream;
use tracing::{error, info, warn};

use crate::config::{self, ResolvedConfig, WatchConfig, WatchSpec};
use crate::multiplex::{combined_output, CombinedOutput, STREAM_CAPACITY};
use crate::router::route;
use crate::supervisor::Supervisor;

/// Exit code used by `die` when none is given.
pub const DEFAULT_EXIT_CODE: i32 = 1;

/// Inputs for one watch session.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Directory holding `package.json`; children run here.
    pub project_dir: PathBuf,
    /// Single script to watch; empty means all of them.
    pub task: Option<String>,
    /// Optional file with extra `watch` entries.
    pub config_path: Option<PathBuf>,
}

/// A script whose child could not be spawned.
#[derive(Debug)]
pub struct StartFailure {
    pub script: String,
    pub error: Error,
}

/// Caller-facing streams of a session.
#[derive(Debug)]
pub struct CombinedStreams {
    /// Operator input, consumed by the router.
    pub input: DuplexStream,
    /// Merged stdout of every piped child.
    pub stdout: DuplexStream,
    /// Merged stderr of every piped child.
    pub stderr: DuplexStream,
    pub supervisor: Arc<Supervisor>,
    pub failures: Vec<StartFailure>,
}

// Core-side halves of the three streams.
struct CoreStreams {
    output: CombinedOutput,
    router_input: DuplexStream,
}

/// Loads configuration from disk and starts the session.
pub async fn run<F>(options: RunOptions, exit: F) -> Result<CombinedStreams>
where
    F: FnOnce(i32),
{
    let resolved = config::load(&options.project_dir, options.config_path.as_deref())?;
    Ok(start(options.project_dir, resolved, options.task.as_deref(), exit).await)
}

/// Starts the session from an already resolved configuration.
pub async fn start<F>(
    project_dir: PathBuf,
    resolved: ResolvedConfig,
    task: Option<&str>,
    exit: F,
) -> CombinedStreams
where
    F: FnOnce(i32),
{
    let supervisor = Supervisor::new(project_dir, resolved.scripts);
    start_with(supervisor, resolved.watch, task, exit).await
}

/// Starts the selected `watch` entries on a prepared supervisor.
///
/// Scripts that fail to spawn are logged and listed in `failures`; the others keep
/// running.
pub async fn start_with<F>(
    mut supervisor: Supervisor,
    watch: WatchConfig,
    task: Option<&str>,
    exit: F,
) -> CombinedStreams
where
    F: FnOnce(i32),
{
    let (output, stdout, stderr) = combined_output(STREAM_CAPACITY);
    let (input, router_input) = tokio::io::duplex(STREAM_CAPACITY);
    let core = CoreStreams {
        output,
        router_input,
    };
    let streams = |supervisor: Supervisor, failures: Vec<StartFailure>| CombinedStreams {
        input,
        stdout,
        stderr,
        supervisor: Arc::new(supervisor),
        failures,
    };

    let task = task.map(str::trim).unwrap_or("");
    if task.is_empty() {
        info!("No task specified. Will go through all possible tasks");
    }
    if watch.is_empty() {
        die("No \"watch\" config specified", None, core, exit);
        return streams(supervisor, Vec::new());
    }

    let selected: Vec<(String, WatchSpec)> = if task.is_empty() {
        watch.into_iter().collect()
    } else {
        watch
            .get(task)
            .map(|spec| vec![(task.to_string(), spec.clone())])
            .unwrap_or_default()
    };
    if selected.is_empty() {
        if !supervisor.is_declared(task) {
            warn!(script = %task, "No such script \"{}\"", task);
        }
        let message = format!("No \"watch\" config specified for \"{}\"", task);
        die(&message, None, core, exit);
        return streams(supervisor, Vec::new());
    }

    let mut failures = Vec::new();
    for (script, spec) in selected {
        if let Err(err) = supervisor.start(&script, &spec.normalize(), &core.output) {
            error!(script = %script, error = %format!("{:#}", err), "failed to start script");
            failures.push(StartFailure { script, error: err });
        }
    }
    // Pumps hold their own sink clones; the output streams end once every child is done.
    let CoreStreams {
        output,
        router_input,
    } = core;
    drop(output);

    let streams = streams(supervisor, failures);
    tokio::spawn(route(router_input, Arc::clone(&streams.supervisor)));
    streams
}

/// Ends the session early.
///
/// Writes `message` to the process stderr and drops the core side of every stream, so
/// the caller's `input`, `stdout` and `stderr` all close, then calls `exit`.
fn die<F>(message: &str, code: Option<i32>, core: CoreStreams, exit: F)
where
    F: FnOnce(i32),
{
    eprintln!("{}", message);
    drop(core);
    exit(code.unwrap_or(DEFAULT_EXIT_CODE));
}
