//! Vessel - A Docker-compatible container engine whose containers are virtual machines
//!
//! This is the main CLI entry point for Vessel.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vessel::infra::{MemoryInfrastructure, PowerState, Session};
use vessel::portmap::MemoryPortMapper;
use vessel::{ContainerBackend, CreateRequest, EngineConfig};

/// Vessel - Docker-compatible VM container engine
#[derive(Parser)]
#[command(name = "vessel")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "A Docker-compatible container engine whose containers are virtual machines", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the engine configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Run a scenario against the in-memory platform
    Simulate {
        /// Scenario file (YAML)
        scenario: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate a configuration file
    Check {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// A scripted sequence of backend operations
#[derive(Debug, Deserialize)]
struct Scenario {
    #[serde(default)]
    config: Option<EngineConfig>,
    steps: Vec<ScenarioStep>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ScenarioStep {
    Create {
        request: CreateRequest,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
        #[serde(default)]
        wait_secs: Option<u64>,
    },
    Remove {
        name: String,
        #[serde(default)]
        force: bool,
    },
    /// Power a container's VM off behind the engine's back
    PowerOff {
        name: String,
    },
    Inspect {
        name: String,
    },
    List {
        #[serde(default)]
        all: bool,
    },
    /// Restart the engine and recover containers from the platform
    Sync,
}

impl ScenarioStep {
    fn action(&self) -> &'static str {
        match self {
            ScenarioStep::Create { .. } => "create",
            ScenarioStep::Start { .. } => "start",
            ScenarioStep::Stop { .. } => "stop",
            ScenarioStep::Remove { .. } => "remove",
            ScenarioStep::PowerOff { .. } => "power_off",
            ScenarioStep::Inspect { .. } => "inspect",
            ScenarioStep::List { .. } => "list",
            ScenarioStep::Sync => "sync",
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(EngineConfig::default_path);
    EngineConfig::load_or_default(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn new_backend(
    config: &EngineConfig,
    infra: &Arc<MemoryInfrastructure>,
) -> anyhow::Result<ContainerBackend> {
    let backend = ContainerBackend::new(
        config.clone(),
        infra.clone(),
        Arc::new(MemoryPortMapper::new()),
        Session::new("datacenter", "pool", "vm"),
    )?;
    Ok(backend)
}

async fn run_step(
    backend: &mut ContainerBackend,
    config: &EngineConfig,
    infra: &Arc<MemoryInfrastructure>,
    step: ScenarioStep,
) -> anyhow::Result<serde_json::Value> {
    match step {
        ScenarioStep::Create { request } => {
            let id = backend.create_container(request).await?;
            Ok(json!({ "id": id }))
        }
        ScenarioStep::Start { name } => {
            let id = backend.find(&name)?;
            backend.start_container(&id).await?;
            Ok(json!({ "id": id }))
        }
        ScenarioStep::Stop { name, wait_secs } => {
            let id = backend.find(&name)?;
            backend
                .stop_container(&id, wait_secs.map(Duration::from_secs))
                .await?;
            Ok(json!({ "id": id }))
        }
        ScenarioStep::Remove { name, force } => {
            let id = backend.find(&name)?;
            backend.remove_container(&id, force).await?;
            Ok(json!({ "id": id }))
        }
        ScenarioStep::PowerOff { name } => {
            let id = backend.find(&name)?;
            let container = backend
                .layer()
                .cache()
                .get(&id)?
                .ok_or_else(|| anyhow!("{} is not cached", name))?;
            let info = container.info();
            let vm = info
                .base()
                .vm()
                .ok_or_else(|| anyhow!("{} has no VM", name))?;
            infra.set_power_state(vm, PowerState::PoweredOff);
            Ok(json!({ "id": id, "vm": vm.to_string() }))
        }
        ScenarioStep::Inspect { name } => {
            let id = backend.find(&name)?;
            Ok(serde_json::to_value(backend.inspect(&id).await?)?)
        }
        ScenarioStep::List { all } => Ok(serde_json::to_value(backend.list(all)?)?),
        ScenarioStep::Sync => {
            backend.shutdown();
            *backend = new_backend(config, infra)?;
            let recovered = backend.recover().await?;
            Ok(json!({ "recovered": recovered }))
        }
    }
}

async fn simulate(path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario {}", path.display()))?;
    let scenario: Scenario = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse scenario {}", path.display()))?;

    let config = scenario.config.unwrap_or_default();
    let infra = Arc::new(MemoryInfrastructure::new());
    let mut backend = new_backend(&config, &infra)?;

    let mut failures = 0;
    for (index, step) in scenario.steps.into_iter().enumerate() {
        let action = step.action();
        let line = match run_step(&mut backend, &config, &infra, step).await {
            Ok(result) => json!({ "step": index, "action": action, "ok": true, "result": result }),
            Err(e) => {
                failures += 1;
                json!({ "step": index, "action": action, "ok": false, "error": e.to_string() })
            }
        };
        println!("{}", serde_json::to_string(&line)?);
    }

    tracing::info!("Scenario finished with {} failed step(s)", failures);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config { command } => match command {
            ConfigCommands::Show { config } => {
                let config = load_config(config.as_deref())?;
                print!("{}", serde_yaml::to_string(&config)?);
            }
            ConfigCommands::Check { config } => {
                let config = load_config(config.as_deref())?;
                config.validate()?;
                println!("Configuration is valid");
            }
        },
        Commands::Simulate { scenario } => simulate(&scenario).await?,
    }

    Ok(())
}
