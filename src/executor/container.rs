//! Sandboxed container backend for cross-architecture compiles.
//!
//! Every invocation runs with the full sandbox set: no network,
//! read-only root, all capabilities dropped, no-new-privileges, PID,
//! memory and CPU caps, and a single bind mount (the task work
//! directory). These are part of the security contract, not tuning
//! knobs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use super::workspace::{validate_payload, Workspace};
use super::{ExecResult, Executor, TaskSpec};
use crate::core::Arch;
use crate::exec::Cmd;
use crate::{debug, log};

/// Deadline for the one-time image pull.
const PULL_TIMEOUT: Duration = Duration::from_secs(600);
const PIDS_LIMIT: &str = "256";
const MEMORY_LIMIT: &str = "2g";
const CPU_LIMIT: &str = "2";

pub struct ContainerExecutor {
    runtime: PathBuf,
    image_prefix: String,
    /// Images already pulled in this process
    pulled: DashMap<String, ()>,
}

impl ContainerExecutor {
    /// Present only when a container runtime is installed.
    pub fn detect(image_prefix: &str) -> Option<Self> {
        let runtime = which::which("docker")
            .or_else(|_| which::which("podman"))
            .ok()?;
        debug!("exec"; "container runtime: {}", runtime.display());
        Some(Self {
            runtime,
            image_prefix: image_prefix.to_string(),
            pulled: DashMap::new(),
        })
    }

    /// Per-architecture image name.
    fn image_for(&self, target: Arch) -> String {
        let tag = match target {
            Arch::Unspecified => Arch::native().as_str(),
            other => other.as_str(),
        };
        format!("{}-{}:latest", self.image_prefix, tag)
    }

    /// Pull the image on first use; a failed pull is logged and the
    /// run proceeds against whatever is cached locally.
    async fn ensure_image(&self, image: &str) {
        if self.pulled.contains_key(image) {
            return;
        }
        log!("exec"; "pulling image {image}");
        match Cmd::new(&self.runtime)
            .args(["pull", image])
            .deadline(PULL_TIMEOUT)
            .run()
            .await
        {
            Ok(out) if out.success() => {
                self.pulled.insert(image.to_string(), ());
            }
            Ok(out) => log!("exec"; "image pull failed: {}", out.stderr.trim()),
            Err(e) => log!("exec"; "image pull failed: {e:#}"),
        }
    }
}

/// The fixed sandbox argument set for one run.
fn sandbox_args(work_dir: &Path, image: &str, compiler: &str, args: &[String]) -> Vec<String> {
    let mut cmd: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--network=none".into(),
        "--read-only".into(),
        "--cap-drop=ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--pids-limit".into(),
        PIDS_LIMIT.into(),
        "--memory".into(),
        MEMORY_LIMIT.into(),
        "--cpus".into(),
        CPU_LIMIT.into(),
        "-v".into(),
        format!("{}:/work", work_dir.display()),
        "-w".into(),
        "/work".into(),
        image.into(),
        compiler.into(),
    ];
    cmd.extend(args.iter().cloned());
    cmd
}

#[async_trait]
impl Executor for ContainerExecutor {
    fn name(&self) -> &'static str {
        "container"
    }

    fn available(&self) -> bool {
        true
    }

    /// Cross-compilation is the point: any declared target is fair
    /// game as long as an image exists for it.
    fn supports(&self, _target: Arch) -> bool {
        true
    }

    async fn compile(&self, task: &TaskSpec) -> Result<ExecResult> {
        validate_payload(task)?;
        let ws = Workspace::create(task, false)?;
        let image = self.image_for(task.target_arch);
        self.ensure_image(&image).await;

        let args = sandbox_args(ws.root(), &image, &task.compiler, &ws.compile_args(&task.args));
        debug!("exec"; "container: {} {}", self.runtime.display(), args.join(" "));

        let out = Cmd::new(&self.runtime)
            .args(&args)
            .deadline(task.timeout)
            .run()
            .await?;

        let object = if out.exit_code == 0 { ws.read_object().unwrap_or_default() } else { Vec::new() };
        let exit_code = if out.exit_code == 0 && object.is_empty() { 1 } else { out.exit_code };

        Ok(ExecResult {
            object,
            exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
            duration: out.elapsed,
        })
    }
}
