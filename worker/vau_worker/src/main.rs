mod wasm_module;

use crate::wasm_module::WasmModule;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vau_worker_runtime::{HostCapabilities, RetryPolicy, WorkerOptions};

/// Serves the Vau typesetting engine over a framed stdin/stdout channel.
#[derive(Debug, Parser)]
#[command(name = "vau_worker", version, about)]
struct Cli {
    /// Compiled engine module to load.
    #[arg(long, env = "VAU_WORKER_MODULE", default_value = "Vau-wasm.wasm")]
    module: PathBuf,

    /// Call-name patterns to log on call and return (`*` and `?` wildcards).
    #[arg(long = "trace", env = "VAU_WORKER_TRACE", value_delimiter = ',')]
    trace: Vec<String>,

    /// Delay before the first replay of a not-ready call, in milliseconds.
    #[arg(long, env = "VAU_WORKER_RETRY_DELAY_MS", default_value_t = 1)]
    retry_delay_ms: u64,

    /// Upper bound for the doubling replay delay, in milliseconds.
    #[arg(long, env = "VAU_WORKER_RETRY_MAX_DELAY_MS", default_value_t = 250)]
    retry_max_delay_ms: u64,

    /// Replays allowed per call before it fails; 0 retries forever.
    #[arg(long, env = "VAU_WORKER_MAX_RETRY_ATTEMPTS", default_value_t = 256)]
    max_retry_attempts: u32,

    /// The host provides a shared-memory primitive.
    #[arg(long, env = "VAU_WORKER_SHARED_MEMORY")]
    shared_memory: bool,

    /// The worker runs in an isolated execution context.
    #[arg(long, env = "VAU_WORKER_ISOLATED")]
    isolated: bool,

    #[arg(long, env = "VAU_WORKER_OUTBOUND_QUEUE_CAP", default_value_t = 256)]
    outbound_queue_cap: usize,
}

impl Cli {
    fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            capabilities: HostCapabilities {
                shared_memory: self.shared_memory,
                isolated: self.isolated,
            },
            retry: RetryPolicy {
                delay: Duration::from_millis(self.retry_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_delay_ms)),
                max_attempts: (self.max_retry_attempts > 0).then_some(self.max_retry_attempts),
            },
            trace_patterns: self.trace.clone(),
            outbound_queue_cap: self.outbound_queue_cap,
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("vau_worker fatal error: {err:#}");
        process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    tracing::info!(module = %cli.module.display(), "starting worker");
    let options = cli.worker_options();
    let module_path = cli.module;

    vau_worker_runtime::run(options, move || WasmModule::load(&module_path))
        .context("worker stopped")
}

// stdout carries protocol frames, so logs go to stderr.
fn init_logging() {
    let filter =
        EnvFilter::try_from_env("VAU_WORKER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bound_retries() {
        let cli = Cli::try_parse_from(["vau_worker"]).expect("parse defaults");
        let options = cli.worker_options();

        assert_eq!(cli.module, PathBuf::from("Vau-wasm.wasm"));
        assert_eq!(options.retry, RetryPolicy::default());
        assert!(!options.capabilities.isolated);
        assert!(options.trace_patterns.is_empty());
    }

    #[test]
    fn zero_attempts_means_unbounded() {
        let cli = Cli::try_parse_from(["vau_worker", "--max-retry-attempts", "0"]).expect("parse");
        assert_eq!(cli.worker_options().retry.max_attempts, None);
    }

    #[test]
    fn trace_patterns_split_on_commas() {
        let cli = Cli::try_parse_from([
            "vau_worker",
            "--trace",
            "get*,openDocument",
            "--isolated",
            "--shared-memory",
        ])
        .expect("parse");
        let options = cli.worker_options();

        assert_eq!(options.trace_patterns, ["get*", "openDocument"]);
        assert_eq!(
            options.capabilities,
            HostCapabilities {
                shared_memory: true,
                isolated: true,
            }
        );
    }
}
