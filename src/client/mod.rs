//! Client compile pipeline.
//!
//! Takes a raw compiler command line and produces the object file by
//! the fastest legal path: local cache, then remote dispatch with
//! bounded retry, then local fallback. A compile error delivered by a
//! worker is the definitive result; only transport-level trouble moves
//! the pipeline down a rung.

mod fallback;
mod includes;
mod retry;

pub use fallback::{compile_locally, exec_passthrough};
pub use includes::collect_includes;
pub use retry::{is_retryable_code, AttemptError};

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tonic::transport::Endpoint;
use uuid::Uuid;

use crate::cache::{CompileKey, ObjectCache};
use crate::config::GridConfig;
use crate::core::Arch;
use crate::exec::Cmd;
use crate::invocation::Invocation;
use crate::proto;
use crate::proto::grid_client::GridClient;
use crate::{debug, log};

/// Budget for the best-effort cache-hit report.
const REPORT_TIMEOUT: Duration = Duration::from_secs(2);

/// How the pipeline should behave beyond the config file.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Coordinator endpoint; `None` disables the remote path.
    pub coordinator: Option<String>,
    /// Whether transport failure may fall back to a local compile.
    pub fallback_enabled: bool,
    /// Cache directory override.
    pub cache_dir: Option<PathBuf>,
}

/// Run the pipeline for one command line; returns the process exit
/// code to mirror.
pub async fn run(argv: &[String], config: &GridConfig, options: &PipelineOptions) -> Result<i32> {
    let invocation = Invocation::parse(argv);
    if !invocation.is_distributable() {
        debug!("local"; "not distributable, running original command");
        return exec_passthrough(argv).await;
    }

    let Some(source_path) = invocation.source_file() else {
        return exec_passthrough(argv).await;
    };
    let source = fs::read(source_path).with_context(|| format!("cannot read `{source_path}`"))?;
    let output_path = invocation
        .output
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| fallback::default_output_path(source_path));

    // Cache probe
    let version = compiler_version(&invocation.compiler).await;
    let key = CompileKey::compute(
        compiler_name(&invocation.compiler),
        &version,
        invocation.target_arch,
        &invocation.flags,
        &invocation.defines,
        &source,
    );
    let cache = open_cache(config, options);

    if let Some(bytes) = cache.as_ref().and_then(|c| c.get(&key)) {
        debug!("cache"; "hit {key} for {source_path}");
        fs::write(&output_path, bytes)
            .with_context(|| format!("cannot write `{}`", output_path.display()))?;
        if let Some(endpoint) = &options.coordinator {
            report_cache_hit(endpoint, 1).await;
        }
        return Ok(0);
    }

    // Remote dispatch
    if let Some(endpoint) = &options.coordinator {
        let request = build_request(&invocation, source.clone(), config);
        match dispatch_remote(endpoint, request, config).await {
            Ok(response) => {
                return finish_remote(response, &output_path, cache.as_ref(), &key);
            }
            Err(last_error) => {
                log!("remote"; "remote compile unavailable: {last_error}");
                if !options.fallback_enabled {
                    anyhow::bail!("remote compile failed and local fallback is disabled");
                }
            }
        }
    } else if !options.fallback_enabled {
        anyhow::bail!("no coordinator configured and local fallback is disabled");
    }

    // Local fallback
    debug!("local"; "falling back to local compile");
    let outcome = compile_locally(&invocation).await?;
    print!("{}", outcome.stdout);
    eprint!("{}", outcome.stderr);
    std::io::stdout().flush().ok();

    if outcome.success() {
        if let (Some(cache), Ok(bytes)) = (cache.as_ref(), fs::read(&output_path)) {
            fill_cache(cache, &key, &bytes);
        }
    }
    Ok(outcome.exit_code)
}

// =============================================================================
// Remote path
// =============================================================================

/// One Compile RPC per attempt; retries spend only on transient
/// trouble. A response carrying a worker id is final, delivered work.
async fn dispatch_remote(
    endpoint: &str,
    request: proto::CompileRequest,
    config: &GridConfig,
) -> Result<proto::CompileResponse, String> {
    let retry = &config.retry;
    let mut last_error = String::from("no attempts made");

    for attempt in 1..=retry.max {
        if attempt > 1 {
            let pause = retry.backoff(attempt - 1);
            debug!("remote"; "retry {attempt}/{} after {}ms", retry.max, pause.as_millis());
            tokio::time::sleep(pause).await;
        }

        match attempt_once(endpoint, request.clone(), config).await {
            Ok(response) if is_dispatch_failure(&response) => {
                // Scheduling failures are synthetic and worker-less;
                // the fleet may look different on the next attempt.
                last_error = format!("dispatch failed: {}", response.stderr.trim());
                debug!("remote"; "{last_error}");
            }
            Ok(response) => return Ok(response),
            Err(error) if error.is_retryable() => {
                last_error = error.to_string();
                debug!("remote"; "attempt {attempt} failed: {last_error}");
            }
            Err(error) => return Err(format!("permanent error: {error}")),
        }
    }
    Err(last_error)
}

async fn attempt_once(
    endpoint: &str,
    request: proto::CompileRequest,
    config: &GridConfig,
) -> Result<proto::CompileResponse, AttemptError> {
    let timeout = config.coordinator.request_timeout();
    let endpoint = Endpoint::from_shared(normalize_endpoint(endpoint))
        .map_err(|e| AttemptError::Transport(e.to_string()))?
        .timeout(timeout);
    let channel = endpoint
        .connect()
        .await
        .map_err(|e| AttemptError::Transport(e.to_string()))?;
    GridClient::new(channel)
        .compile(request)
        .await
        .map(tonic::Response::into_inner)
        .map_err(AttemptError::Rpc)
}

/// Relay a delivered response: its exit code is the compile's verdict.
fn finish_remote(
    response: proto::CompileResponse,
    output_path: &std::path::Path,
    cache: Option<&ObjectCache>,
    key: &CompileKey,
) -> Result<i32> {
    print!("{}", response.stdout);
    eprint!("{}", response.stderr);
    std::io::stdout().flush().ok();

    let completed = response.status() == proto::TaskStatus::Completed;
    if completed && response.exit_code == 0 && !response.object_file.is_empty() {
        debug!("remote"; "worker {} compiled in {}ms (queued {}ms)",
            response.worker_id, response.compilation_time_ms, response.queue_time_ms);
        fs::write(output_path, &response.object_file)
            .with_context(|| format!("cannot write `{}`", output_path.display()))?;
        if let Some(cache) = cache {
            fill_cache(cache, key, &response.object_file);
        }
        return Ok(0);
    }

    // Failed (or completed empty-handed, which we refuse to trust)
    Ok(if response.exit_code != 0 { response.exit_code } else { 1 })
}

/// A synthetic Failed response minted before any worker ran: no worker
/// id, nothing compiled. Retry-eligible, unlike a real compile failure.
fn is_dispatch_failure(response: &proto::CompileResponse) -> bool {
    response.status() == proto::TaskStatus::Failed && response.worker_id.is_empty()
}

fn build_request(
    invocation: &Invocation,
    source: Vec<u8>,
    config: &GridConfig,
) -> proto::CompileRequest {
    let source_filename = invocation
        .source_file()
        .map(|s| s.to_string())
        .unwrap_or_default();
    let include_files: HashMap<String, Vec<u8>> = collect_includes(&invocation.include_dirs);

    proto::CompileRequest {
        task_id: Uuid::new_v4().to_string(),
        compiler: compiler_name(&invocation.compiler).to_string(),
        // -I/-D travel unchanged: raw-source mode needs them
        compiler_args: invocation.remote_args(),
        target_arch: proto::Arch::from(invocation.target_arch) as i32,
        timeout_seconds: config.coordinator.request_timeout_secs as u32,
        client_os: std::env::consts::OS.to_string(),
        client_arch: proto::Arch::from(Arch::native()) as i32,
        preprocessed_source: Vec::new(),
        raw_source: source,
        source_filename,
        include_files,
    }
}

/// Best-effort, synchronous: the process may exit right after.
async fn report_cache_hit(endpoint: &str, hits: u64) {
    let Ok(endpoint) = Endpoint::from_shared(normalize_endpoint(endpoint)) else {
        return;
    };
    let connect = endpoint.timeout(REPORT_TIMEOUT).connect().await;
    if let Ok(channel) = connect {
        let _ = GridClient::new(channel)
            .report_cache_hit(proto::ReportCacheHitRequest { hits })
            .await;
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

/// Key and wire requests use the bare binary name so `/usr/bin/gcc`
/// and `gcc` land on the same worker toolchain and cache slot.
fn compiler_name(compiler: &str) -> &str {
    std::path::Path::new(compiler)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(compiler)
}

async fn compiler_version(compiler: &str) -> String {
    match Cmd::new(compiler)
        .arg("-dumpversion")
        .deadline(Duration::from_secs(5))
        .run()
        .await
    {
        Ok(out) if out.success() => out.stdout.trim().to_string(),
        _ => String::new(),
    }
}

fn open_cache(config: &GridConfig, options: &PipelineOptions) -> Option<ObjectCache> {
    let root = options.cache_dir.clone().unwrap_or_else(|| config.cache.root());
    match ObjectCache::open(root, config.cache.max_size_bytes, config.cache.ttl()) {
        Ok(cache) => Some(cache),
        Err(e) => {
            log!("cache"; "cache unavailable: {e}");
            None
        }
    }
}

/// Cache writes never affect the caller's exit code.
fn fill_cache(cache: &ObjectCache, key: &CompileKey, bytes: &[u8]) {
    if let Err(e) = cache.put(key, bytes) {
        log!("cache"; "fill failed: {e}");
    }
}

// =============================================================================
// Tests
// =============================================================================
