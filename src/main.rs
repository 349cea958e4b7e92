//! Tally Runtime CLI entry point.
//!
//! Loads the engine library, runs WebAssembly programs through one of the
//! dispatch modes and maintains the engine's compilation cache.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tally_runtime_common::{ConfigFile, ExecutionRequest, LogConfig, VmMode};
use tally_runtime_core::{CacheInvalidator, DispatchMode, Dispatcher};
use tally_runtime_ffi::Engine;

#[derive(Parser)]
#[command(name = "tally-runtime")]
#[command(about = "Run metered WebAssembly programs through the tally engine", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "TALLY_RUNTIME_CONFIG")]
    config: Option<PathBuf>,

    /// Engine shared library, overriding the configuration
    #[arg(long, env = "TALLY_VM_LIBRARY")]
    library: Option<PathBuf>,

    /// Engine home directory, overriding the configuration
    #[arg(long)]
    cache_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a WebAssembly program and print the results as JSON
    Run {
        /// Path to the WebAssembly binary
        wasm: PathBuf,

        /// Program argument, repeatable
        #[arg(short, long = "arg")]
        args: Vec<String>,

        /// Environment variable as KEY=VALUE, repeatable
        #[arg(short, long = "env", value_parser = parse_env)]
        envs: Vec<(String, String)>,

        /// Gas limit passed to the program
        #[arg(long)]
        gas_limit: Option<u64>,

        /// Execution mode of the hosted program
        #[arg(long, value_enum)]
        vm_mode: Option<VmModeArg>,

        /// Dispatch mode: single, parallel, batch or batch-parallel
        #[arg(short, long, default_value = "single")]
        mode: DispatchMode,

        /// Number of copies of the request to submit
        #[arg(long, default_value_t = 1)]
        repeat: usize,
    },

    /// Print the engine's cache location and current version
    CacheInfo,

    /// Remove cache directories left behind by other engine versions
    InvalidateCache,
}

#[derive(Clone, Copy, ValueEnum)]
enum VmModeArg {
    Tally,
    Dr,
}

impl From<VmModeArg> for VmMode {
    fn from(mode: VmModeArg) -> Self {
        match mode {
            VmModeArg::Tally => VmMode::Tally,
            VmModeArg::Dr => VmMode::Dr,
        }
    }
}

fn parse_env(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{value}'"))
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let registry = tracing_subscriber::registry().with(filter);

    // Results go to stdout; diagnostics stay on stderr.
    if log.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => ConfigFile::default(),
    };
    init_tracing(&config.log);

    if let Some(library) = cli.library {
        config.runtime.engine.library_path = Some(library);
    }
    if let Some(cache_root) = cli.cache_root {
        config.runtime.execution.cache_root = cache_root;
    }

    let engine =
        Engine::from_config(&config.runtime.engine).context("Failed to load engine library")?;
    let engine = Arc::new(engine);
    let settings = config.runtime.execution;

    info!(
        engine = engine.source(),
        cache_root = %settings.cache_root().display(),
        "Starting Tally Runtime"
    );

    match cli.command {
        Commands::Run {
            wasm,
            args,
            envs,
            gas_limit,
            vm_mode,
            mode,
            repeat,
        } => {
            let payload = std::fs::read(&wasm)
                .with_context(|| format!("Failed to read WebAssembly file {}", wasm.display()))?;

            let mut request = ExecutionRequest::new(payload).with_args(args);
            for (key, value) in envs {
                request = request.with_env(key, value);
            }
            if let Some(gas_limit) = gas_limit {
                request = request.with_gas_limit(gas_limit);
            }
            if let Some(vm_mode) = vm_mode {
                request = request.with_vm_mode(vm_mode.into());
            }

            let dispatcher = Dispatcher::new(engine, &config.runtime.dispatch);
            let results = dispatcher
                .dispatch(mode, &settings, vec![request; repeat])
                .await;

            let failures = results.iter().filter(|r| !r.is_success()).count();
            info!(%mode, count = results.len(), failures, "Execution finished");

            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::CacheInfo => {
            let info = CacheInvalidator::new(engine)
                .info(settings.cache_root())
                .context("Failed to query cache info")?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::InvalidateCache => {
            let report = CacheInvalidator::new(engine)
                .invalidate(settings.cache_root())
                .context("Cache invalidation failed")?;

            for path in &report.removed {
                println!("removed {}", path.display());
            }
            for path in &report.skipped {
                println!("skipped {}", path.display());
            }
            if let Some(path) = &report.kept {
                println!("kept {}", path.display());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        assert_eq!(
            parse_env("DR_TALLY_GAS_LIMIT=150000"),
            Ok(("DR_TALLY_GAS_LIMIT".to_string(), "150000".to_string()))
        );
        assert_eq!(parse_env("EMPTY="), Ok(("EMPTY".to_string(), String::new())));
        assert!(parse_env("MISSING").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "tally-runtime",
            "run",
            "program.wasm",
            "--arg",
            "reveals",
            "--env",
            "CONSENSUS=true",
            "--mode",
            "batch-parallel",
            "--repeat",
            "4",
        ])
        .unwrap();

        let Commands::Run { args, envs, mode, repeat, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args, vec!["reveals"]);
        assert_eq!(envs, vec![("CONSENSUS".to_string(), "true".to_string())]);
        assert_eq!(mode, DispatchMode::EngineBatchParallel);
        assert_eq!(repeat, 4);
    }

    #[test]
    fn test_cli_rejects_unknown_mode() {
        let result = Cli::try_parse_from(["tally-runtime", "run", "p.wasm", "--mode", "sideways"]);
        assert!(result.is_err());
    }
}
