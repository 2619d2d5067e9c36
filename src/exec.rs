//! External command execution.
//!
//! Builder API for running compilers and toolchain helpers with
//! captured output and a hard deadline. Deadline expiry kills the
//! subprocess and reports exit code −1 rather than an error: a slow
//! compile is a result, not an infrastructure failure.
//!
//! # Examples
//!
//! ```ignore
//! use crate::exec::Cmd;
//!
//! let out = Cmd::new("gcc")
//!     .args(["-c", "unit.c", "-o", "unit.o"])
//!     .cwd(work_dir)
//!     .deadline(Duration::from_secs(300))
//!     .run()
//!     .await?;
//! ```

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::Command;

// ============================================================================
// Outcome
// ============================================================================

/// Captured outcome of one subprocess run.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Process exit code; −1 when the deadline expired or the process
    /// died to a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Command builder for external process execution.
#[derive(Default)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
    clear_env: bool,
    deadline: Option<Duration>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            ..Default::default()
        }
    }

    /// Add a single argument.
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        let arg = arg.as_ref();
        if !arg.is_empty() {
            self.args.push(arg.to_owned());
        }
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            let arg = arg.as_ref();
            if !arg.is_empty() {
                self.args.push(arg.to_owned());
            }
        }
        self
    }

    /// Set working directory.
    pub fn cwd<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_owned());
        self
    }

    /// Set one environment variable.
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        self.envs.push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    /// Set environment variables for the subprocess.
    pub fn envs<K, V, I>(mut self, vars: I) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (k, v) in vars {
            self.envs.push((k.as_ref().to_owned(), v.as_ref().to_owned()));
        }
        self
    }

    /// Start from an empty environment (then apply `env`/`envs`).
    pub fn clear_env(mut self) -> Self {
        self.clear_env = true;
        self
    }

    /// Set a hard deadline.
    pub fn deadline(mut self, limit: Duration) -> Self {
        self.deadline = Some(limit);
        self
    }

    /// Execute and capture.
    pub async fn run(self) -> Result<ExecOutcome> {
        let name = self.program.to_string_lossy().to_string();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.clear_env {
            cmd.env_clear();
        }
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let child = cmd.spawn().with_context(|| format!("failed to spawn `{name}`"))?;

        let output = match self.deadline {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result.with_context(|| format!("failed to wait for `{name}`"))?,
                // The dropped future reaps the child (kill_on_drop).
                Err(_) => {
                    return Ok(ExecOutcome {
                        exit_code: -1,
                        stdout: String::new(),
                        stderr: format!("`{name}` timed out after {}s", limit.as_secs()),
                        elapsed: start.elapsed(),
                        timed_out: true,
                    });
                }
            },
            None => child
                .wait_with_output()
                .await
                .with_context(|| format!("failed to wait for `{name}`"))?,
        };

        Ok(ExecOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: start.elapsed(),
            timed_out: false,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
