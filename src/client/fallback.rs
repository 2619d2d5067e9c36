//! Local compilation paths.
//!
//! Two flavors: a faithful passthrough of the original command line
//! (non-distributable invocations), and the preprocess-then-compile
//! fallback used when the remote path is unreachable.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::debug;
use crate::exec::{Cmd, ExecOutcome};
use crate::invocation::Invocation;

/// Hard ceiling on a local fallback compile.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Run the original command untouched, stdio inherited, and report its
/// exit code. Used whenever the invocation is not distributable.
pub async fn exec_passthrough(argv: &[String]) -> Result<i32> {
    let (program, args) = argv
        .split_first()
        .context("empty command line")?;
    let status = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .with_context(|| format!("failed to run `{program}`"))?;
    Ok(status.code().unwrap_or(-1))
}

/// Default `-c` output path: the source's stem with `.o`, in cwd.
pub fn default_output_path(source: &str) -> PathBuf {
    let stem = Path::new(source)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "out".to_string());
    PathBuf::from(format!("{stem}.o"))
}

/// Preprocess locally, then compile the expanded unit.
///
/// `-I`/`-D` are consumed by the preprocess step and stripped from the
/// compile step; shape flags (`-O`, `-std=`, warnings) are kept for
/// both. The caller relays the returned outcome's stdio and exit code.
pub async fn compile_locally(invocation: &Invocation) -> Result<ExecOutcome> {
    let source = invocation
        .source_file()
        .context("no source input for local fallback")?;
    let output = invocation
        .output
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| default_output_path(source));

    // C++ units need a .ii so the driver keeps treating them as C++.
    let suffix = if source.ends_with(".c") { ".i" } else { ".ii" };
    let preprocessed = tempfile::Builder::new()
        .prefix("hg-local-")
        .suffix(suffix)
        .tempfile()
        .context("failed to create preprocess output")?;

    // Stage 1: -E with the full flag set.
    let mut pre_args = invocation.remote_args();
    pre_args.push("-E".into());
    pre_args.push(source.to_string());
    pre_args.push("-o".into());
    pre_args.push(preprocessed.path().to_string_lossy().to_string());

    debug!("local"; "preprocess: {} {}", invocation.compiler, pre_args.join(" "));
    let pre = Cmd::new(&invocation.compiler)
        .args(&pre_args)
        .deadline(FALLBACK_TIMEOUT)
        .run()
        .await?;
    if !pre.success() {
        return Ok(pre);
    }

    // Stage 2: compile the expanded unit; includes and defines are
    // already baked in.
    let mut cc_args = invocation.flags.clone();
    cc_args.push("-c".into());
    cc_args.push(preprocessed.path().to_string_lossy().to_string());
    cc_args.push("-o".into());
    cc_args.push(output.to_string_lossy().to_string());

    debug!("local"; "compile: {} {}", invocation.compiler, cc_args.join(" "));
    Cmd::new(&invocation.compiler)
        .args(&cc_args)
        .deadline(FALLBACK_TIMEOUT)
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_passthrough_propagates_exit_code() {
        let argv: Vec<String> = ["sh", "-c", "exit 7"].iter().map(|s| s.to_string()).collect();
        assert_eq!(exec_passthrough(&argv).await.unwrap(), 7);

        let argv: Vec<String> = ["true"].iter().map(|s| s.to_string()).collect();
        assert_eq!(exec_passthrough(&argv).await.unwrap(), 0);
    }

    #[test]
    fn test_default_output_path() {
        assert_eq!(default_output_path("src/main.c"), PathBuf::from("main.o"));
        assert_eq!(default_output_path("widget.cpp"), PathBuf::from("widget.o"));
    }

    #[tokio::test]
    async fn test_local_fallback_compiles() {
        if which::which("gcc").is_err() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("unit.c");
        let output = dir.path().join("unit.o");
        std::fs::write(&source, "#include \"val.h\"\nint unit(void) { return VAL; }\n").unwrap();
        std::fs::write(dir.path().join("val.h"), "#define VAL 42\n").unwrap();

        let argv: Vec<String> = [
            "gcc",
            "-c",
            source.to_str().unwrap(),
            "-I",
            dir.path().to_str().unwrap(),
            "-O1",
            "-o",
            output.to_str().unwrap(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let invocation = Invocation::parse(&argv);

        let outcome = compile_locally(&invocation).await.unwrap();
        assert_eq!(outcome.exit_code, 0, "stderr: {}", outcome.stderr);
        assert!(output.exists());
        assert!(std::fs::metadata(&output).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_local_fallback_reports_compile_error() {
        if which::which("gcc").is_err() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("bad.c");
        std::fs::write(&source, "int broken(").unwrap();

        let argv: Vec<String> = ["gcc", "-c", source.to_str().unwrap()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let invocation = Invocation::parse(&argv);

        let outcome = compile_locally(&invocation).await.unwrap();
        assert_ne!(outcome.exit_code, 0);
        assert!(!outcome.stderr.is_empty());
    }
}
