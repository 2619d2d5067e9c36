//! Worker self-description.
//!
//! Best-effort probing of what this host can compile: C/C++ drivers on
//! PATH, container runtime presence, cores and memory. Anything that
//! cannot be determined degrades to a conservative value instead of
//! failing registration.

use std::fs;

use crate::config::WorkerConfig;
use crate::core::Arch;
use crate::registry::{CppCapability, WorkerCapabilities};

/// Compiler binaries worth announcing.
const CPP_COMPILERS: &[&str] = &["gcc", "g++", "clang", "clang++", "cl"];

pub fn detect_capabilities(config: &WorkerConfig, container_runtime: bool) -> WorkerCapabilities {
    let compilers: Vec<String> = CPP_COMPILERS
        .iter()
        .filter(|c| which::which(c).is_ok())
        .map(|c| c.to_string())
        .collect();

    WorkerCapabilities {
        hostname: hostname(),
        native_arch: Arch::native(),
        os: std::env::consts::OS.to_string(),
        cpu_cores: std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1),
        memory_bytes: total_memory_bytes(),
        container_runtime,
        cpp: (!compilers.is_empty()).then(|| CppCapability {
            compilers,
            cross_compile: container_runtime,
        }),
        go: None,
        rust: None,
        nodejs: None,
        flutter: None,
        max_parallel_tasks: config.effective_max_parallel() as u32,
    }
}

fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    // systemd hosts rarely export HOSTNAME to daemons
    if let Ok(name) = fs::read_to_string("/etc/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    "unknown-host".to_string()
}

/// MemTotal from /proc/meminfo; 0 where unavailable.
fn total_memory_bytes() -> u64 {
    let Ok(meminfo) = fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    parse_mem_total(&meminfo).unwrap_or(0)
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}
