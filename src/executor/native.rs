//! Native backend: run the compiler directly on the host.

use anyhow::Result;
use async_trait::async_trait;

use super::workspace::{validate_payload, Workspace};
use super::{ExecResult, Executor, TaskSpec};
use crate::core::Arch;
use crate::debug;
use crate::exec::Cmd;

pub struct NativeExecutor {
    native_arch: Arch,
}

impl NativeExecutor {
    pub fn new() -> Self {
        Self { native_arch: Arch::native() }
    }
}

impl Default for NativeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for NativeExecutor {
    fn name(&self) -> &'static str {
        "native"
    }

    fn available(&self) -> bool {
        true
    }

    fn supports(&self, target: Arch) -> bool {
        target == Arch::Unspecified || target == self.native_arch
    }

    async fn compile(&self, task: &TaskSpec) -> Result<ExecResult> {
        validate_payload(task)?;
        let ws = Workspace::create(task, false)?;
        let args = ws.compile_args(&task.args);
        debug!("exec"; "native: {} {}", task.compiler, args.join(" "));

        let out = Cmd::new(&task.compiler)
            .args(&args)
            .cwd(ws.root())
            .deadline(task.timeout)
            .run()
            .await?;

        let object = if out.exit_code == 0 {
            match ws.read_object() {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Zero exit but no object: report as a failure so
                    // the client never caches an empty artifact.
                    return Ok(ExecResult {
                        object: Vec::new(),
                        exit_code: 1,
                        stdout: out.stdout,
                        stderr: format!("{}\n{e:#}", out.stderr),
                        duration: out.elapsed,
                    });
                }
            }
        } else {
            Vec::new()
        };

        Ok(ExecResult {
            object,
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
            duration: out.elapsed,
        })
    }
}
