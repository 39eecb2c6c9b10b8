//! Warden - policy enforcement filter for Envoy external processing
//!
//! Command line front end: compile policy bundles, inspect them, and replay
//! recorded ext_proc exchanges through the filter.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use warden_core::engine::compiler::{self, PolicyBundle};
use warden_core::engine::wasm_runtime::WasmRuntime;
use warden_core::engine::{FilterConfig, PolicyEvaluator};
use warden_core::protocol::ProcessingRequest;
use warden_core::{Phase, PolicyFilter};

/// Modules that can be traced at `trace` level
#[derive(Debug, Clone, ValueEnum)]
enum TraceModule {
    Processor,
    Eval,
    Wasm,
    Protocol,
    All,
}

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Memory size with validation
#[derive(Debug, Clone)]
struct MemorySize {
    bytes: usize,
}

impl FromStr for MemorySize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const MIN_MEMORY: usize = 1024 * 1024; // 1MB
        const MAX_MEMORY: usize = 100 * 1024 * 1024; // 100MB

        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();
        let (digits, unit) = if let Some(n) = upper.strip_suffix("MB") {
            (n, 1024 * 1024)
        } else if let Some(n) = upper.strip_suffix("KB") {
            (n, 1024)
        } else {
            (upper.as_str(), 1)
        };

        let bytes = digits
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_mul(unit))
            .ok_or_else(|| format!("Invalid memory size: {s}"))?;

        if bytes < MIN_MEMORY {
            return Err(format!(
                "Memory size too small: {s}. Minimum is 1MB (1048576 bytes)"
            ));
        }
        if bytes > MAX_MEMORY {
            return Err(format!(
                "Memory size too large: {s}. Maximum is 100MB (104857600 bytes)"
            ));
        }

        Ok(MemorySize { bytes })
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "warden",
    about = "Policy enforcement filter for Envoy external processing",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Enable tracing for modules (comma-separated: processor,eval,wasm,protocol,all)
    #[clap(long, value_delimiter = ',', global = true)]
    trace: Vec<TraceModule>,

    /// Set log level
    #[clap(long, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Maximum WASM memory allocation (e.g., "10MB", "50MB"); overrides the config file
    #[clap(long, global = true)]
    wasm_max_memory: Option<MemorySize>,

    /// Override OPA binary path
    #[clap(long, global = true)]
    opa_path: Option<PathBuf>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Compile a directory of Rego into a WASM policy
    Build {
        /// Directory containing the policy's Rego files
        #[clap(long, default_value = "./policy")]
        policy_dir: PathBuf,

        /// Package holding the phase rules
        #[clap(long, default_value = "cleanroom.policy")]
        package: String,

        /// Where to write the compiled module
        #[clap(long, short, default_value = "policy.wasm")]
        output: PathBuf,
    },

    /// Show which phase rules the configured policy provides
    Inspect {
        /// Filter configuration file
        #[clap(long, short, default_value = "warden.yaml")]
        config: PathBuf,

        /// Output results as JSON
        #[clap(long)]
        json: bool,
    },

    /// Replay one recorded exchange (newline-delimited ProcessingRequest JSON)
    Replay {
        /// Filter configuration file
        #[clap(long, short, default_value = "warden.yaml")]
        config: PathBuf,

        /// Recorded messages; stdin when omitted
        #[clap(long, short)]
        input: Option<PathBuf>,
    },
}

/// Initialize tracing with CLI flags
///
/// Logs always go to stderr; `replay` writes protocol messages to stdout.
fn initialize_tracing(log_level: &LogLevel, trace_modules: &[TraceModule]) {
    let mut filter = EnvFilter::new(log_level.to_filter_directive());

    for module in trace_modules {
        let directive = match module {
            TraceModule::Processor => "warden_core::engine::processor=trace",
            TraceModule::Eval => "warden_core::engine::evaluator=trace",
            TraceModule::Wasm => "warden_core::engine::wasm_runtime=trace",
            TraceModule::Protocol => "warden_core::protocol=trace",
            TraceModule::All => "warden_core=trace",
        };

        if let Ok(parsed) = directive.parse() {
            filter = filter.add_directive(parsed);
        }
    }

    if !trace_modules.is_empty() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .init();

        tracing::info!(trace_modules = ?trace_modules, "Warden tracing enabled");
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing(&cli.log_level, &cli.trace);

    let overrides = Overrides {
        wasm_max_memory: cli.wasm_max_memory.map(|m| m.bytes),
        opa_path: cli.opa_path,
    };

    match cli.command {
        Command::Build {
            policy_dir,
            package,
            output,
        } => build_command(&policy_dir, &package, &output, &overrides).await,
        Command::Inspect { config, json } => inspect_command(&config, json, &overrides).await,
        Command::Replay { config, input } => {
            replay_command(&config, input.as_deref(), &overrides).await
        }
    }
}

/// Global flags that take precedence over the configuration file.
struct Overrides {
    wasm_max_memory: Option<usize>,
    opa_path: Option<PathBuf>,
}

impl Overrides {
    fn apply(&self, config: &mut FilterConfig) {
        if let Some(bytes) = self.wasm_max_memory {
            config.wasm_max_memory = Some(bytes);
        }
        if let Some(path) = &self.opa_path {
            config.opa_path = Some(path.clone());
        }
    }
}

async fn load_config(path: &Path, overrides: &Overrides) -> Result<FilterConfig> {
    let mut config = FilterConfig::load(path).await?;
    overrides.apply(&mut config);
    debug!("Using configuration: {:?}", config);
    Ok(config)
}

async fn build_command(
    policy_dir: &Path,
    package: &str,
    output: &Path,
    overrides: &Overrides,
) -> Result<()> {
    if !policy_dir.is_dir() {
        bail!("Policy directory does not exist: {}", policy_dir.display());
    }

    let opa = compiler::find_opa_binary(overrides.opa_path.as_deref());
    let bundle_bytes = compiler::compile_rego(policy_dir, package, &opa).await?;
    let bundle = PolicyBundle::from_tarball(&bundle_bytes)?;

    // Check the module before handing it to anyone
    let runtime = WasmRuntime::new_with_config(
        &bundle.wasm,
        bundle.data.as_ref(),
        overrides.wasm_max_memory,
    )?;
    PolicyEvaluator::from_runtime(Arc::new(runtime), package)
        .with_context(|| format!("Package '{package}' does not provide every phase rule"))?;

    tokio::fs::write(output, &bundle.wasm)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!("Wrote {} bytes to {}", bundle.wasm.len(), output.display());
    eprintln!("Compiled {} -> {}", policy_dir.display(), output.display());
    Ok(())
}

// Table row structure for entrypoint display
#[derive(Tabled)]
struct EntrypointTableRow {
    #[tabled(rename = "Id")]
    id: i32,
    #[tabled(rename = "Entrypoint")]
    entrypoint: String,
    #[tabled(rename = "Phase")]
    phase: String,
}

async fn inspect_command(config_path: &Path, json: bool, overrides: &Overrides) -> Result<()> {
    let config = load_config(config_path, overrides).await?;
    let package = &config.policy.package;

    let bundle = PolicyBundle::load(&config.policy.bundle, package, config.opa_path.as_deref())
        .await
        .context("Failed to load policy bundle")?;
    let runtime =
        WasmRuntime::new_with_config(&bundle.wasm, bundle.data.as_ref(), config.wasm_max_memory)?;

    let mut entrypoints: Vec<(&String, &i32)> = runtime.entrypoints().iter().collect();
    entrypoints.sort_by_key(|(_, id)| **id);

    let phase_of = |name: &str| {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.entrypoint(package) == name)
    };
    let missing: Vec<String> = Phase::ALL
        .into_iter()
        .filter(|phase| runtime.entrypoint_id(&phase.entrypoint(package)).is_none())
        .map(|phase| phase.entrypoint(package))
        .collect();

    if json {
        let output = serde_json::json!({
            "bundle": config.policy.bundle.display().to_string(),
            "package": package,
            "has_data": bundle.data.is_some(),
            "entrypoints": entrypoints
                .iter()
                .map(|(name, id)| serde_json::json!({
                    "id": id,
                    "name": name,
                    "phase": phase_of(name.as_str()).map(|p| p.to_string()),
                }))
                .collect::<Vec<_>>(),
            "missing": missing,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        let rows: Vec<EntrypointTableRow> = entrypoints
            .iter()
            .map(|(name, id)| EntrypointTableRow {
                id: **id,
                entrypoint: name.to_string(),
                phase: phase_of(name.as_str())
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            })
            .collect();

        let mut table = Table::new(rows);
        table
            .with(Style::rounded())
            .with(Modify::new(Rows::first()).with(Alignment::center()));

        println!("{table}");
        println!();
        println!(
            "Package: {}  ({} entrypoints, data: {})",
            package,
            entrypoints.len(),
            if bundle.data.is_some() { "yes" } else { "no" }
        );
        for name in &missing {
            println!("Missing phase rule: {name}");
        }
    }

    if !missing.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

async fn replay_command(
    config_path: &Path,
    input: Option<&Path>,
    overrides: &Overrides,
) -> Result<()> {
    let config = load_config(config_path, overrides).await?;
    let filter = PolicyFilter::from_config(&config).await?;

    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(io::BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(io::BufReader::new(io::stdin())),
    };

    let mut exchange = filter.new_exchange();
    let mut replayed = 0usize;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for (index, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }

        let request: ProcessingRequest = serde_json::from_str(&line)
            .with_context(|| format!("Line {} is not a ProcessingRequest", index + 1))?;
        let response = exchange.process(&request);

        if response.immediate().is_some() {
            warn!(
                "Exchange terminated at line {} ({})",
                index + 1,
                request.request.kind()
            );
        }
        writeln!(out, "{}", serde_json::to_string(&response)?)?;
        replayed += 1;
    }
    out.flush()?;

    let span = filter.complete_exchange(exchange);
    info!(
        "Replayed {} messages in {}ms",
        replayed,
        span.total_duration_ms
    );
    Ok(())
}
