//! CLI Entry Point for autolab
//!
//! Provides command-line interface for:
//! - Running a method file against the configured (or simulated) lab
//! - Validating a method file without touching any device
//! - Listing the built-in drivers
//!
//! # Usage
//!
//! ```bash
//! autolab run config/methods/heat_and_dispense.toml --config config/lab.toml
//! autolab run method.toml --bind pump=pump_2 --json
//! autolab validate config/methods/heat_and_dispense.toml
//! autolab drivers
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use autolab::config::{LabConfig, DEFAULT_CONFIG_PATH};
use autolab::drivers::register_simulated_drivers;
use autolab::engine::{RoleBindings, RunReport, RunStatus};
use autolab::lab::Lab;
use autolab::logging;
use autolab::method::MethodDefinition;
use autolab::registry::DriverRegistry;

#[derive(Parser)]
#[command(name = "autolab")]
#[command(about = "Laboratory device control and method execution", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a method file once
    Run {
        /// Path to the method TOML file
        method: PathBuf,

        /// Lab configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Explicit role binding, `role=device_id` (repeatable)
        #[arg(long = "bind", value_parser = parse_binding)]
        bindings: Vec<(String, String)>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a method file without running it
    Validate {
        /// Path to the method TOML file
        method: PathBuf,
    },

    /// List built-in drivers
    Drivers,
}

fn parse_binding(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((role, device)) if !role.is_empty() && !device.is_empty() => {
            Ok((role.to_string(), device.to_string()))
        }
        _ => Err(format!("expected role=device_id, got '{arg}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            method,
            config,
            bindings,
            json,
        } => run_method(&method, &config, bindings.into_iter().collect(), json).await,
        Commands::Validate { method } => validate_method(&method),
        Commands::Drivers => list_drivers(),
    }
}

fn load_method(path: &Path) -> Result<MethodDefinition> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading method file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing method file {}", path.display()))
}

fn validate_method(path: &Path) -> Result<()> {
    let method = load_method(path)?;
    let errors = method.validate();
    if errors.is_empty() {
        println!("✅ {} is valid ({} steps)", method.name(), method.steps().len());
        return Ok(());
    }
    eprintln!("❌ {} has {} problem(s):", method.name(), errors.len());
    for error in &errors {
        eprintln!("   - {error}");
    }
    bail!("method validation failed")
}

fn list_drivers() -> Result<()> {
    let registry = DriverRegistry::new();
    register_simulated_drivers(&registry)?;
    for info in registry.list() {
        let capabilities: Vec<&str> = info.capabilities.iter().map(|c| c.name()).collect();
        println!("{:<24} {:<32} {}", info.key, info.name, capabilities.join(", "));
    }
    Ok(())
}

async fn run_method(
    method_path: &Path,
    config_path: &Path,
    bindings: RoleBindings,
    json: bool,
) -> Result<()> {
    let method = load_method(method_path)?;
    let config = LabConfig::load_from(config_path)?;
    logging::init(&config.logging)?;

    let run_log_dir = config.recorder.run_log_dir.clone();
    let lab = Lab::start(config).await?;

    let recorder = match start_recorder(&lab, run_log_dir.as_deref(), method.name()) {
        Ok(recorder) => recorder,
        Err(e) => {
            lab.shutdown().await;
            return Err(e);
        }
    };

    let run = match lab.engine().submit(method, &bindings) {
        Ok(run) => run,
        Err(e) => {
            lab.shutdown().await;
            return Err(e.into());
        }
    };

    let report = tokio::select! {
        report = run.wait() => report,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; aborting run");
            run.abort();
            run.wait().await
        }
    };

    finish_recorder(recorder).await?;

    lab.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.status != RunStatus::Completed {
        bail!("run {} ended {}", report.run_id, report.status);
    }
    Ok(())
}

#[cfg(feature = "storage_csv")]
type Recorder = Option<autolab::recorder::CsvRecorder>;

#[cfg(not(feature = "storage_csv"))]
type Recorder = ();

#[cfg(feature = "storage_csv")]
fn start_recorder(lab: &Lab, dir: Option<&Path>, method: &str) -> Result<Recorder> {
    let Some(dir) = dir else { return Ok(None) };
    let recorder =
        autolab::recorder::CsvRecorder::for_run(lab.bus(), dir, method, chrono::Utc::now())?;
    Ok(Some(recorder))
}

#[cfg(not(feature = "storage_csv"))]
fn start_recorder(_lab: &Lab, dir: Option<&Path>, _method: &str) -> Result<Recorder> {
    if let Some(dir) = dir {
        warn!(
            dir = %dir.display(),
            "run_log_dir is set but this build has no CSV recorder (feature storage_csv)"
        );
    }
    Ok(())
}

#[cfg(feature = "storage_csv")]
async fn finish_recorder(recorder: Recorder) -> Result<()> {
    if let Some(recorder) = recorder {
        let path = recorder.path().to_path_buf();
        let rows = recorder.finish().await?;
        println!("📝 Run log: {} ({rows} rows)", path.display());
    }
    Ok(())
}

#[cfg(not(feature = "storage_csv"))]
async fn finish_recorder(_recorder: Recorder) -> Result<()> {
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("Run {} ({}): {}", report.run_id, report.method, report.status);
    for (id, step) in &report.steps {
        let elapsed = match (step.started, step.ended) {
            (Some(start), Some(end)) => format!("{:.1}s", (end.offset - start.offset).as_secs_f64()),
            _ => "-".to_string(),
        };
        print!("   {id:<24} {:<10} {elapsed:>8}", step.status.to_string());
        match &step.error {
            Some(e) => println!("  {e}"),
            None => println!(),
        }
    }
    if let Some(cause) = &report.root_cause {
        println!("Root cause: {cause}");
    }
}
