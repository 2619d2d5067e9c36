//! Project-local header collection for raw-source dispatch.
//!
//! Walks each project-local `-I` directory and bundles every header,
//! keyed by path relative to the include root. System include trees
//! are never bundled: the worker resolves those against its own SDK.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use jwalk::WalkDir;

use crate::debug;
use crate::invocation::is_header_file;

/// Include roots that belong to the toolchain, not the project.
const SYSTEM_PREFIXES: &[&str] = &["/usr", "/opt", "/Library"];

/// Whether an include dir is a system/SDK path we must not bundle.
pub fn is_system_include(dir: &str) -> bool {
    SYSTEM_PREFIXES.iter().any(|p| dir.starts_with(p))
        || dir.to_ascii_lowercase().contains("sdk")
}

/// Bundle headers from every project-local include dir.
pub fn collect_includes(include_dirs: &[String]) -> HashMap<String, Vec<u8>> {
    let mut bundle = HashMap::new();
    for dir in include_dirs {
        if is_system_include(dir) {
            debug!("remote"; "skipping system include dir {dir}");
            continue;
        }
        let root = Path::new(dir);
        if !root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !is_header_file(&path) {
                continue;
            }
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let Ok(bytes) = fs::read(&path) else {
                continue;
            };
            // forward slashes on the wire, whatever the host uses
            let key = rel.to_string_lossy().replace('\\', "/");
            bundle.entry(key).or_insert(bytes);
        }
    }
    bundle
}
