//! Construction of the watch-and-run invocation for a script.
//!
//! Every watched script runs under `nodemon`, which re-executes
//! `npm run -s <script>` whenever a watched file changes.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::WatchOptions;

/// Executable of the external watch-and-run tool.
pub const WATCHER_PROGRAM: &str = if cfg!(windows) { "nodemon.cmd" } else { "nodemon" };

/// Executable of the project's script runner.
pub const SCRIPT_RUNNER: &str = if cfg!(windows) { "npm.cmd" } else { "npm" };

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// All three streams are piped to the supervisor.
    Piped,
    /// All three streams are the parent's terminal. The child reads operator
    /// input itself, so the supervisor holds no handle to forward restarts.
    Inherit,
}

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub stdio: StdioMode,
}

impl CommandInvocation {
    /// Converts the invocation into a spawnable command.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).current_dir(&self.cwd);
        match self.stdio {
            StdioMode::Piped => {
                command
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
            StdioMode::Inherit => {
                command
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
        }
        command.kill_on_drop(true);
        command
    }

    /// Renders the command line for logs.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

/// Starts the process for an invocation.
///
/// The supervisor only talks to a `Launcher`, so tests can substitute their own
/// watcher program for `nodemon`.
pub trait Launcher: Send + Sync + std::fmt::Debug {
    fn launch(&self, script: &str, invocation: &CommandInvocation) -> std::io::Result<Child>;
}

/// Spawns invocations exactly as built.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodemonLauncher;

impl Launcher for NodemonLauncher {
    fn launch(&self, _script: &str, invocation: &CommandInvocation) -> std::io::Result<Child> {
        invocation.to_command().spawn()
    }
}

/// Builds the `nodemon` invocation that watches and runs `script`.
pub fn build_invocation(
    script: &str,
    options: &WatchOptions,
    project_dir: &Path,
) -> CommandInvocation {
    let mut args = Vec::new();

    if let Some(extensions) = &options.extensions {
        args.push("--ext".to_string());
        args.push(extensions.to_vec().join(","));
    }
    push_pairs(&mut args, "--watch", &options.patterns.to_vec());
    if let Some(ignore) = &options.ignore {
        push_pairs(&mut args, "--ignore", &ignore.to_vec());
    }
    if options.legacy_watch {
        args.push("--legacy-watch".to_string());
    }
    if let Some(delay) = options.delay.filter(|ms| *ms > 0) {
        args.push("--delay".to_string());
        args.push(format!("{}ms", delay));
    }
    if options.verbose {
        args.push("-V".to_string());
    }
    if options.silent {
        args.push("-q".to_string());
    }
    if options.run_on_change_only {
        args.push("--on-change-only".to_string());
    }
    args.push("--exec".to_string());
    args.push(exec_line(script));

    CommandInvocation {
        program: WATCHER_PROGRAM.to_string(),
        args,
        cwd: project_dir.to_path_buf(),
        stdio: if options.inherit {
            StdioMode::Inherit
        } else {
            StdioMode::Piped
        },
    }
}

fn push_pairs(args: &mut Vec<String>, flag: &str, values: &[String]) {
    for value in values {
        args.push(flag.to_string());
        args.push(value.clone());
    }
}

fn exec_line(script: &str) -> String {
    [SCRIPT_RUNNER, "run", "-s", script].join(" ")
}

/// Test launcher that runs shell scripts in place of the watch tool.
#[cfg(test)]
pub mod fake {
    use std::collections::HashMap;

    use super::*;

    /// Program name guaranteed not to resolve, for spawn failures.
    pub const MISSING_PROGRAM: &str = "/nonexistent/pkgwatch-watcher";

    /// Runs `sh <script file> <watcher args>` for mapped scripts and a missing
    /// program for every other script.
    #[derive(Debug, Default)]
    pub struct ScriptLauncher {
        scripts: HashMap<String, PathBuf>,
    }

    impl ScriptLauncher {
        pub fn with(mut self, script: &str, path: &Path) -> Self {
            self.scripts.insert(script.to_string(), path.to_path_buf());
            self
        }
    }

    impl Launcher for ScriptLauncher {
        fn launch(&self, script: &str, invocation: &CommandInvocation) -> std::io::Result<Child> {
            let mut replaced = invocation.clone();
            match self.scripts.get(script) {
                Some(path) => {
                    replaced.program = "sh".to_string();
                    replaced.args.insert(0, path.display().to_string());
                }
                None => replaced.program = MISSING_PROGRAM.to_string(),
            }
            replaced.to_command().spawn()
        }
    }

    /// A watcher that prints the nodemon hint, its arguments and one stderr line,
    /// then echoes the first line it receives on stdin.
    pub const ECHO_WATCHER: &str = r#"
echo "[nodemon] to restart at any time, enter \`rs\`"
echo "args: $*"
echo "err-line" >&2
read line
echo "got:$line"
"#;
}
