//! Per-task work directories.
//!
//! Each compile gets a fresh temporary directory holding the
//! materialized source (and headers in raw mode). Argument vectors are
//! rewritten against workspace-relative paths so the same layout works
//! for native runs (cwd) and container runs (bind mount at `/work`).
//! The directory is removed unconditionally on drop.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use tempfile::TempDir;

use super::{SourcePayload, TaskSpec};
use crate::debug;
use crate::invocation::{is_object_file, is_source_file};

/// Directory the bundled headers land in (raw-source mode).
const INCLUDES_DIR: &str = "includes";

/// A materialized task directory.
pub struct Workspace {
    dir: TempDir,
    /// Source file name, relative to the workspace root
    source_rel: String,
    /// Object file name, relative to the workspace root
    output_rel: &'static str,
    /// Extra include flag for the bundled headers, if any
    include_arg: Option<String>,
}

impl Workspace {
    /// Create the directory and write the task's inputs into it.
    ///
    /// `msvc` switches the object name and output flag convention.
    pub fn create(task: &TaskSpec, msvc: bool) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("hg-task-")
            .tempdir()
            .context("failed to create task work directory")?;
        let root = dir.path();

        let output_rel = if msvc { "output.obj" } else { "output.o" };
        let (source_rel, include_arg) = match &task.source {
            SourcePayload::Preprocessed(bytes) => {
                let name = "source.i".to_string();
                fs::write(root.join(&name), bytes).context("failed to write source")?;
                (name, None)
            }
            SourcePayload::Raw { source, filename, includes } => {
                // Only the file name survives; the client's directory
                // layout has no meaning here.
                let name = Path::new(filename)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("source.c")
                    .to_string();
                fs::write(root.join(&name), source).context("failed to write source")?;

                let include_root = root.join(INCLUDES_DIR);
                fs::create_dir_all(&include_root)?;
                for (rel, bytes) in includes {
                    let Some(safe) = sanitize_rel_path(rel) else {
                        debug!("exec"; "skipping unsafe include path `{rel}`");
                        continue;
                    };
                    let dest = include_root.join(&safe);
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&dest, bytes)
                        .with_context(|| format!("failed to write header `{rel}`"))?;
                }
                let flag = if msvc {
                    format!("/I{INCLUDES_DIR}")
                } else {
                    format!("-I{INCLUDES_DIR}")
                };
                (name, Some(flag))
            }
        };

        Ok(Self { dir, source_rel, output_rel, include_arg })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_rel(&self) -> &str {
        &self.source_rel
    }

    /// Absolute path the object file is expected at.
    pub fn output_path(&self) -> PathBuf {
        self.dir.path().join(self.output_rel)
    }

    /// Final argument vector for a GCC-style driver: sanitized flags,
    /// `-c`, the source, and `-o <object>` - all workspace-relative.
    pub fn compile_args(&self, flags: &[String]) -> Vec<String> {
        let mut args = sanitize_flags(flags);
        if let Some(include) = &self.include_arg {
            args.push(include.clone());
        }
        args.push("-c".into());
        args.push(self.source_rel.clone());
        args.push("-o".into());
        args.push(self.output_rel.into());
        args
    }

    /// Final argument vector for `cl.exe`: `/c`, `/Fo<object>`.
    pub fn msvc_compile_args(&self, translated_flags: &[String]) -> Vec<String> {
        let mut args: Vec<String> = translated_flags.to_vec();
        if let Some(include) = &self.include_arg {
            args.push(include.clone());
        }
        args.push("/c".into());
        args.push(format!("/Fo{}", self.output_rel));
        args.push(self.source_rel.clone());
        args
    }

    /// Read the produced object bytes.
    pub fn read_object(&self) -> Result<Vec<u8>> {
        let path = self.output_path();
        fs::read(&path).with_context(|| format!("no object produced at {}", path.display()))
    }
}

/// Drop stray `-c`, `-o` pairs, and input-file arguments the client may
/// have left in; the workspace supplies its own.
fn sanitize_flags(flags: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(flags.len());
    let mut iter = flags.iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "-c" => {}
            "-o" => {
                let _ = iter.next();
            }
            f if f.starts_with("-o") => {}
            f if !f.starts_with('-') && (is_source_file(f) || is_object_file(f)) => {}
            _ => out.push(flag.clone()),
        }
    }
    out
}

/// Keep a bundled header path only when every component is a plain
/// name: no roots, no `..`, no drive prefixes.
fn sanitize_rel_path(rel: &str) -> Option<PathBuf> {
    let path = Path::new(rel);
    let mut safe = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => safe.push(part),
            _ => return None,
        }
    }
    if safe.as_os_str().is_empty() {
        return None;
    }
    Some(safe)
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("root", &self.dir.path())
            .field("source", &self.source_rel)
            .finish()
    }
}

/// Ensure a task's payload is usable before creating a workspace.
pub fn validate_payload(task: &TaskSpec) -> Result<()> {
    match &task.source {
        SourcePayload::Preprocessed(bytes) if bytes.is_empty() => {
            bail!("empty preprocessed source")
        }
        SourcePayload::Raw { source, .. } if source.is_empty() => {
            bail!("empty raw source")
        }
        _ => Ok(()),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Arch;
    use std::collections::HashMap;
    use std::time::Duration;

    fn task(source: SourcePayload, args: &[&str]) -> TaskSpec {
        TaskSpec {
            task_id: "t1".into(),
            compiler: "gcc".into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            target_arch: Arch::Unspecified,
            timeout: Duration::from_secs(60),
            source,
        }
    }

    #[test]
    fn test_preprocessed_layout() {
        let t = task(SourcePayload::Preprocessed(b"int x;".to_vec()), &["-O2"]);
        let ws = Workspace::create(&t, false).unwrap();

        assert!(ws.root().join("source.i").exists());
        let args = ws.compile_args(&t.args);
        assert_eq!(args, vec!["-O2", "-c", "source.i", "-o", "output.o"]);
    }

    #[test]
    fn test_raw_layout_with_includes() {
        let mut includes = HashMap::new();
        includes.insert("util/math.h".to_string(), b"#define PI 3".to_vec());
        includes.insert("config.h".to_string(), b"// cfg".to_vec());

        let t = task(
            SourcePayload::Raw {
                source: b"#include \"config.h\"\n".to_vec(),
                filename: "src/deep/main.c".into(),
                includes,
            },
            &["-O2"],
        );
        let ws = Workspace::create(&t, false).unwrap();

        // source lands under its bare file name
        assert!(ws.root().join("main.c").exists());
        assert!(ws.root().join("includes/util/math.h").exists());
        assert!(ws.root().join("includes/config.h").exists());

        let args = ws.compile_args(&t.args);
        assert_eq!(args, vec!["-O2", "-Iincludes", "-c", "main.c", "-o", "output.o"]);
    }

    #[test]
    fn test_hostile_include_paths_skipped() {
        let mut includes = HashMap::new();
        includes.insert("../../etc/passwd".to_string(), b"nope".to_vec());
        includes.insert("/abs/path.h".to_string(), b"nope".to_vec());
        includes.insert("ok.h".to_string(), b"fine".to_vec());

        let t = task(
            SourcePayload::Raw {
                source: b"x".to_vec(),
                filename: "a.c".into(),
                includes,
            },
            &[],
        );
        let ws = Workspace::create(&t, false).unwrap();
        assert!(ws.root().join("includes/ok.h").exists());
        // only the sanitized header landed
        let entries: Vec<_> = std::fs::read_dir(ws.root().join("includes"))
            .unwrap()
            .filter_map(Result::ok)
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_sanitize_strips_client_outputs_and_inputs() {
        let flags: Vec<String> = ["-O2", "-c", "old.c", "-o", "old.o", "-Wall", "-oother.o"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(sanitize_flags(&flags), vec!["-O2", "-Wall"]);
    }

    #[test]
    fn test_workdir_removed_on_drop() {
        let t = task(SourcePayload::Preprocessed(b"x".to_vec()), &[]);
        let ws = Workspace::create(&t, false).unwrap();
        let root = ws.root().to_path_buf();
        assert!(root.exists());
        drop(ws);
        assert!(!root.exists());
    }

    #[test]
    fn test_msvc_args() {
        let t = task(SourcePayload::Preprocessed(b"x".to_vec()), &[]);
        let ws = Workspace::create(&t, true).unwrap();
        let args = ws.msvc_compile_args(&["/O2".to_string()]);
        assert_eq!(args, vec!["/O2", "/c", "/Fooutput.obj", "source.i"]);
    }

    #[test]
    fn test_validate_payload() {
        let empty = task(SourcePayload::Preprocessed(vec![]), &[]);
        assert!(validate_payload(&empty).is_err());
        let ok = task(SourcePayload::Preprocessed(b"x".to_vec()), &[]);
        assert!(validate_payload(&ok).is_ok());
    }
}
