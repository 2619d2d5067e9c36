//! MSVC backend: vcvars environment capture plus `cl.exe`.
//!
//! Windows hosts only. The Visual Studio install path is validated
//! against an allow-list of well-known base directories before any
//! batch file is executed; a GCC-style flag vector is translated to
//! `cl.exe` equivalents.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::OnceCell;

use super::workspace::{validate_payload, Workspace};
use super::{ExecResult, Executor, TaskSpec};
use crate::core::Arch;
use crate::debug;
use crate::exec::Cmd;

/// Environment variables a VS install announces itself through.
const VS_ENV_VARS: &[&str] = &["VSINSTALLDIR", "VS2022INSTALLDIR", "VS2019INSTALLDIR"];

/// Only installs under these bases may run their vcvars batch file.
const ALLOWED_VS_ROOTS: &[&str] = &[
    r"c:\program files\microsoft visual studio",
    r"c:\program files (x86)\microsoft visual studio",
];

/// Year → default install base. 2022 is 64-bit Program Files, 2019
/// lived under the x86 tree.
const VS_LOCATIONS: &[(&str, &str)] = &[(r"C:\Program Files", "2022"), (r"C:\Program Files (x86)", "2019")];
const VS_EDITIONS: &[&str] = &["Enterprise", "Professional", "Community", "BuildTools"];

pub struct MsvcExecutor {
    /// vcvars environment, captured once per process
    env: OnceCell<Vec<(String, String)>>,
}

impl MsvcExecutor {
    pub fn new() -> Self {
        Self { env: OnceCell::new() }
    }

    async fn vcvars_env(&self) -> Result<&Vec<(String, String)>> {
        self.env
            .get_or_try_init(|| async {
                let install = locate_vs_install()
                    .context("no Visual Studio installation found")?;
                let vcvars = install.join(r"VC\Auxiliary\Build\vcvars64.bat");
                let out = Cmd::new("cmd")
                    .arg("/c")
                    .arg(format!("\"{}\" && set", vcvars.display()))
                    .run()
                    .await?;
                if !out.success() {
                    bail!("vcvars64.bat failed: {}", out.stderr.trim());
                }
                Ok(parse_env_block(&out.stdout))
            })
            .await
    }
}

impl Default for MsvcExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for MsvcExecutor {
    fn name(&self) -> &'static str {
        "msvc"
    }

    fn available(&self) -> bool {
        cfg!(windows) && locate_vs_install().is_some()
    }

    fn supports(&self, target: Arch) -> bool {
        // vcvars64 environment targets x64
        matches!(target, Arch::Unspecified | Arch::X86_64)
    }

    async fn compile(&self, task: &TaskSpec) -> Result<ExecResult> {
        if !cfg!(windows) {
            bail!("MSVC executor requires a Windows host");
        }
        validate_payload(task)?;

        let env = self.vcvars_env().await?;
        let ws = Workspace::create(task, true)?;
        let args = ws.msvc_compile_args(&translate_flags(&task.args));
        debug!("exec"; "msvc: cl.exe {}", args.join(" "));

        let out = Cmd::new("cl.exe")
            .args(&args)
            .cwd(ws.root())
            .clear_env()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .deadline(task.timeout)
            .run()
            .await?;

        let object = if out.exit_code == 0 { ws.read_object().unwrap_or_default() } else { Vec::new() };
        let exit_code = if out.exit_code == 0 && object.is_empty() { 1 } else { out.exit_code };

        Ok(ExecResult {
            object,
            exit_code,
            // cl.exe reports diagnostics on stdout
            stdout: out.stdout.clone(),
            stderr: if out.stderr.is_empty() { out.stdout } else { out.stderr },
            duration: out.elapsed,
        })
    }
}

// =============================================================================
// VS discovery
// =============================================================================

/// Find a Visual Studio install via vendor env vars, then well-known
/// directories. Every candidate is checked against the allow-list.
fn locate_vs_install() -> Option<PathBuf> {
    for var in VS_ENV_VARS {
        if let Ok(value) = std::env::var(var) {
            let path = PathBuf::from(value.trim_end_matches('\\'));
            if is_allowed_vs_root(&path) && path.exists() {
                return Some(path);
            }
        }
    }
    for (base, year) in VS_LOCATIONS {
        for edition in VS_EDITIONS {
            let path = PathBuf::from(format!(r"{base}\Microsoft Visual Studio\{year}\{edition}"));
            if path.exists() {
                return Some(path);
            }
        }
    }
    None
}

/// Lexical prefix check, case-insensitive - never trust an env var to
/// point outside the well-known install bases.
fn is_allowed_vs_root(path: &std::path::Path) -> bool {
    let lower = path.to_string_lossy().to_ascii_lowercase();
    ALLOWED_VS_ROOTS.iter().any(|base| lower.starts_with(base))
}

/// Parse `cmd /c ... && set` output into key/value pairs.
fn parse_env_block(block: &str) -> Vec<(String, String)> {
    block
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            if key.is_empty() || key.contains(char::is_whitespace) {
                return None;
            }
            Some((key.to_string(), value.trim_end_matches('\r').to_string()))
        })
        .collect()
}

// =============================================================================
// Flag translation
// =============================================================================

/// Map GCC-style flags to `cl.exe` equivalents. Flags with no MSVC
/// counterpart are dropped; `-c`/`-o` are handled by the workspace.
pub fn translate_flags(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" => {}
            "-o" => {
                let _ = iter.next();
            }
            "-O0" => out.push("/Od".into()),
            "-O1" | "-Os" => out.push("/O1".into()),
            "-O2" => out.push("/O2".into()),
            "-O3" | "-Ofast" => out.push("/Ox".into()),
            "-g" => out.push("/Zi".into()),
            "-Wall" | "-Wextra" => out.push("/W4".into()),
            "-w" => out.push("/w".into()),
            flag => {
                if let Some(dir) = flag.strip_prefix("-I") {
                    out.push(format!("/I{dir}"));
                } else if let Some(def) = flag.strip_prefix("-D") {
                    out.push(format!("/D{def}"));
                } else if let Some(std) = flag.strip_prefix("-std=") {
                    out.push(format!("/std:{std}"));
                }
                // anything else has no cl.exe equivalent
            }
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_translate_core_flags() {
        let out = translate_flags(&strings(&["-O2", "-Iinc", "-DNDEBUG", "-c"]));
        assert_eq!(out, vec!["/O2", "/Iinc", "/DNDEBUG"]);
    }

    #[test]
    fn test_translate_drops_output_pair() {
        let out = translate_flags(&strings(&["-o", "x.o", "-O1"]));
        assert_eq!(out, vec!["/O1"]);
    }

    #[test]
    fn test_translate_std_and_unknowns() {
        let out = translate_flags(&strings(&["-std=c++17", "-fPIC", "-pthread"]));
        assert_eq!(out, vec!["/std:c++17"]);
    }

    #[test]
    fn test_allowed_roots() {
        assert!(is_allowed_vs_root(std::path::Path::new(
            r"C:\Program Files\Microsoft Visual Studio\2022\Community"
        )));
        assert!(!is_allowed_vs_root(std::path::Path::new(r"D:\Evil\VS")));
        assert!(!is_allowed_vs_root(std::path::Path::new(r"C:\Users\mal\vs")));
    }

    #[test]
    fn test_parse_env_block() {
        let block = "PATH=C:\\bin;C:\\tools\r\nINCLUDE=C:\\inc\r\nnot a var line\r\n";
        let env = parse_env_block(block);
        assert_eq!(env.len(), 2);
        assert_eq!(env[0], ("PATH".to_string(), "C:\\bin;C:\\tools".to_string()));
        assert_eq!(env[1], ("INCLUDE".to_string(), "C:\\inc".to_string()));
    }
}
