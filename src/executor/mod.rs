//! Compile execution backends.
//!
//! A worker hosts three backends behind one trait: native (run the
//! compiler directly), container (sandboxed cross-compile), and MSVC
//! (vcvars environment + `cl.exe`). The manager picks one per task;
//! distributability was already decided by the client and is not
//! re-checked here.

mod container;
mod msvc;
mod native;
mod workspace;

pub use container::ContainerExecutor;
pub use msvc::MsvcExecutor;
pub use native::NativeExecutor;
pub use workspace::Workspace;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::WorkerConfig;
use crate::core::Arch;
use crate::invocation::CompilerFamily;

// =============================================================================
// Task / result
// =============================================================================

/// Source payload of one compile task.
#[derive(Debug, Clone)]
pub enum SourcePayload {
    /// Locally preprocessed `.i` bytes; compiles anywhere with a
    /// matching OS, no header resolution needed.
    Preprocessed(Vec<u8>),
    /// Unexpanded source plus project-local headers keyed by relative
    /// path; the worker preprocesses against its own SDK.
    Raw {
        source: Vec<u8>,
        filename: String,
        includes: HashMap<String, Vec<u8>>,
    },
}

/// A compile task ready for a backend.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_id: String,
    pub compiler: String,
    /// Flags only; inputs and `-o` are supplied by the workspace
    pub args: Vec<String>,
    pub target_arch: Arch,
    pub timeout: Duration,
    pub source: SourcePayload,
}

/// Outcome of one backend run. A non-zero exit code is a result, not
/// an error; `Err` is reserved for infrastructure failures.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub object: Vec<u8>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// =============================================================================
// Trait
// =============================================================================

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this backend can run on this host at all.
    fn available(&self) -> bool;

    /// Whether this backend can produce objects for `target`.
    fn supports(&self, target: Arch) -> bool;

    /// Run the compile. Deadline expiry reports exit code −1.
    async fn compile(&self, task: &TaskSpec) -> Result<ExecResult>;
}

// =============================================================================
// Manager
// =============================================================================

/// Owns the backends and picks one per task.
pub struct ExecutorManager {
    native: NativeExecutor,
    container: Option<ContainerExecutor>,
    msvc: MsvcExecutor,
}

impl ExecutorManager {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            native: NativeExecutor::new(),
            container: ContainerExecutor::detect(&config.container_image_prefix),
            msvc: MsvcExecutor::new(),
        }
    }

    /// Native when the target matches (or is unspecified), container
    /// for cross targets, native again as the last resort.
    pub fn select(&self, target: Arch) -> &dyn Executor {
        if self.native.supports(target) {
            return &self.native;
        }
        if let Some(container) = &self.container {
            if container.available() {
                return container;
            }
        }
        &self.native
    }

    /// `cl`/`cl.exe` short-circuits to the MSVC backend.
    pub fn select_for_compiler(&self, compiler: &str, target: Arch) -> &dyn Executor {
        if CompilerFamily::from_binary(compiler) == CompilerFamily::Msvc {
            return &self.msvc;
        }
        self.select(target)
    }

    pub fn has_container(&self) -> bool {
        self.container.as_ref().is_some_and(|c| c.available())
    }
}
