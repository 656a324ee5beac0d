//! Process supervision for watched scripts.
//!
//! The `Supervisor` spawns one watch-and-run child per script, wires its piped output
//! into the combined streams, and forwards restart requests to the child's stdin.
//! The registry is filled while starting and only read afterwards.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::command::{build_invocation, Launcher, NodemonLauncher, StdioMode};
use crate::config::WatchOptions;
use crate::multiplex::{pump, CombinedOutput, LineStage, StreamKind};

/// Command understood by the watch tool as "restart now".
pub const RESTART_COMMAND: &[u8] = b"rs\n";

type InputChannel = Box<dyn AsyncWrite + Send + Unpin>;

/// Why a restart could not be delivered.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("process not found: {0}")]
    NotFound(String),
    #[error("process {0} inherits the terminal and takes no input")]
    Inherited(String),
    #[error("failed to write to {script}: {source}")]
    Io {
        script: String,
        #[source]
        source: std::io::Error,
    },
}

/// A live child registered under a script name.
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin: Option<Mutex<InputChannel>>,
    child: Option<Mutex<Child>>,
}

impl ProcessHandle {
    fn from_child(mut child: Child) -> Self {
        let stdin = child
            .stdin
            .take()
            .map(|stdin| Mutex::new(Box::new(stdin) as InputChannel));
        Self {
            pid: child.id(),
            stdin,
            child: Some(Mutex::new(child)),
        }
    }

    /// Wraps an arbitrary input channel without a backing process.
    #[cfg(test)]
    pub fn detached<W>(stdin: Option<W>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            pid: None,
            stdin: stdin.map(|w| Mutex::new(Box::new(w) as InputChannel)),
            child: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("accepts_input", &self.stdin.is_some())
            .finish()
    }
}

/// Final status of one supervised script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub script: String,
    /// Exit code; `None` when killed by a signal or not waitable.
    pub code: Option<i32>,
}

/// Owns every watched child for the lifetime of one invocation.
#[derive(Debug)]
pub struct Supervisor {
    project_dir: PathBuf,
    declared: BTreeSet<String>,
    launcher: Box<dyn Launcher>,
    processes: HashMap<String, ProcessHandle>,
}

impl Supervisor {
    /// Creates an empty supervisor.
    ///
    /// `declared` holds the runnable script names, used only for advisories.
    pub fn new(project_dir: PathBuf, declared: BTreeSet<String>) -> Self {
        Self {
            project_dir,
            declared,
            launcher: Box::new(NodemonLauncher),
            processes: HashMap::new(),
        }
    }

    /// Replaces the launcher used by `start`.
    pub fn with_launcher<L>(mut self, launcher: L) -> Self
    where
        L: Launcher + 'static,
    {
        self.launcher = Box::new(launcher);
        self
    }

    /// Spawns the watch-and-run child for `script` and registers it.
    ///
    /// Piped children get their stdout and stderr attached to `output`.
    pub fn start(
        &mut self,
        script: &str,
        options: &WatchOptions,
        output: &CombinedOutput,
    ) -> Result<()> {
        if !self.is_declared(script) {
            warn!(script = %script, "No such script \"{}\"", script);
        }
        for warning in options.warnings() {
            warn!(script = %script, "{}", warning);
        }

        let invocation = build_invocation(script, options, &self.project_dir);
        info!(script = %script, "starting: {}", invocation.display());
        let mut child = self
            .launcher
            .launch(script, &invocation)
            .with_context(|| format!("failed to spawn {} for {}", invocation.program, script))?;

        if invocation.stdio == StdioMode::Piped {
            if let Some(stdout) = child.stdout.take() {
                let stage = LineStage::for_stream(
                    script,
                    StreamKind::Stdout,
                    options.quiet,
                    options.clear_buffer,
                );
                tokio::spawn(pump(stdout, stage, output.stdout.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                let stage = LineStage::for_stream(
                    script,
                    StreamKind::Stderr,
                    options.quiet,
                    options.clear_buffer,
                );
                tokio::spawn(pump(stderr, stage, output.stderr.clone()));
            }
        }

        let handle = ProcessHandle::from_child(child);
        info!(script = %script, pid = ?handle.pid(), "process started");
        self.register(script, handle);
        Ok(())
    }

    /// Whether the manifest declares `script`.
    pub fn is_declared(&self, script: &str) -> bool {
        self.declared.contains(script)
    }

    /// Adds a handle to the registry, replacing any previous one.
    pub fn register(&mut self, script: &str, handle: ProcessHandle) {
        self.processes.insert(script.to_string(), handle);
    }

    /// Sends the restart command to the child running `script`.
    pub async fn dispatch_restart(&self, script: &str) -> Result<(), DispatchError> {
        let handle = self
            .processes
            .get(script)
            .ok_or_else(|| DispatchError::NotFound(script.to_string()))?;
        let stdin = handle
            .stdin
            .as_ref()
            .ok_or_else(|| DispatchError::Inherited(script.to_string()))?;
        let mut stdin = stdin.lock().await;
        let io_err = |source| DispatchError::Io {
            script: script.to_string(),
            source,
        };
        stdin.write_all(RESTART_COMMAND).await.map_err(io_err)?;
        stdin.flush().await.map_err(io_err)?;
        Ok(())
    }

    /// Names of all registered scripts, sorted.
    pub fn script_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Waits for every registered child to exit.
    ///
    /// Exited children stay registered; this only reports their status.
    pub async fn wait_all(&self) -> Vec<ExitReport> {
        let mut reports = Vec::with_capacity(self.processes.len());
        for script in self.script_names() {
            let Some(child) = self.processes.get(&script).and_then(|p| p.child.as_ref()) else {
                continue;
            };
            let code = match child.lock().await.wait().await {
                Ok(status) => {
                    info!(script = %script, code = ?status.code(), "process exited");
                    status.code()
                }
                Err(err) => {
                    warn!(script = %script, error = %err, "failed to wait for process");
                    None
                }
            };
            reports.push(ExitReport { script, code });
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    use crate::command::fake::{ScriptLauncher, ECHO_WATCHER};
    use crate::config::PatternList;
    use crate::multiplex::combined_output;

    fn supervisor() -> Supervisor {
        Supervisor::new(PathBuf::from("."), BTreeSet::new())
    }

    #[tokio::test]
    async fn dispatch_writes_restart_command() {
        let (child_stdin, mut child_side) = tokio::io::duplex(64);
        let mut supervisor = supervisor();
        supervisor.register("build", ProcessHandle::detached(Some(child_stdin)));

        supervisor.dispatch_restart("build").await.unwrap();
        drop(supervisor);

        let mut received = Vec::new();
        child_side.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"rs\n");
    }

    #[tokio::test]
    async fn dispatch_to_unknown_script_fails() {
        let supervisor = supervisor();
        let err = supervisor.dispatch_restart("unknown").await.unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(name) if name == "unknown"));
    }

    #[tokio::test]
    async fn dispatch_skips_inherited_processes() {
        let mut supervisor = supervisor();
        supervisor.register("serve", ProcessHandle::detached(None::<tokio::io::DuplexStream>));
        let err = supervisor.dispatch_restart("serve").await.unwrap_err();
        assert!(matches!(err, DispatchError::Inherited(_)));
    }

    #[tokio::test]
    async fn wait_all_skips_detached_handles() {
        let mut supervisor = supervisor();
        supervisor.register("build", ProcessHandle::detached(None::<tokio::io::DuplexStream>));
        assert_eq!(supervisor.script_names(), vec!["build"]);
        assert!(supervisor.wait_all().await.is_empty());
        assert!(!supervisor.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_wires_output_and_input() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = dir.path().join("watcher.sh");
        std::fs::write(&watcher, ECHO_WATCHER).unwrap();
        let mut supervisor =
            Supervisor::new(dir.path().to_path_buf(), BTreeSet::from(["api".to_string()]))
                .with_launcher(ScriptLauncher::default().with("api", &watcher));
        let (output, mut stdout_rx, mut stderr_rx) = combined_output(1024);

        let options = WatchOptions::with_patterns(PatternList::One("src".into()));
        supervisor.start("api", &options, &output).unwrap();
        drop(output);
        assert_eq!(supervisor.script_names(), vec!["api"]);
        supervisor.dispatch_restart("api").await.unwrap();

        let mut stdout = String::new();
        stdout_rx.read_to_string(&mut stdout).await.unwrap();
        let mut stderr = String::new();
        stderr_rx.read_to_string(&mut stderr).await.unwrap();
        assert_eq!(
            stdout,
            "[api] args: --watch src --exec npm run -s api\n[api] got:rs\n"
        );
        assert_eq!(stderr, "[api] err-line\n");

        let reports = supervisor.wait_all().await;
        assert_eq!(
            reports,
            vec![ExitReport {
                script: "api".into(),
                code: Some(0)
            }]
        );
    }

    #[tokio::test]
    async fn start_reports_spawn_failure_without_registering() {
        let mut supervisor = supervisor().with_launcher(ScriptLauncher::default());
        let (output, _stdout_rx, _stderr_rx) = combined_output(64);
        let options = WatchOptions::with_patterns(PatternList::One("src".into()));

        let err = supervisor.start("api", &options, &output).unwrap_err();
        let expected = format!("failed to spawn {} for api", crate::command::WATCHER_PROGRAM);
        assert!(format!("{:#}", err).contains(&expected));
        assert!(supervisor.is_empty());
    }
}
