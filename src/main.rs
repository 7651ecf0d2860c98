use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tessera_core::config::EngineConfig;
use tessera_core::event::EventBus;
use tessera_core::model::{CrossFeatureLink, FunctionModel, ModelStatus};
use tessera_core::traits::AuditSink;
use tessera_core::types::{RunMode, UserId};
use tessera_engine::{FunctionModelService, HandlerSet, Stores};
use tessera_links::LinkService;
use tessera_memory::{
    InMemoryAgentRegistry, InMemoryLinkRepository, InMemoryModelRepository, MemoryAuditLog, SqliteAuditLog,
};
use tessera_validator::ValidationLevel;

#[derive(Parser)]
#[command(name = "tessera", version, about = "Validate, analyze and run function-model workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tessera.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a model JSON file
    Validate {
        model: PathBuf,
        /// structural, business-rules, execution-readiness, context, cross-feature, full
        #[arg(long, default_value = "full")]
        level: String,
        /// Other model files the model nests
        #[arg(long = "with")]
        related: Vec<PathBuf>,
    },
    /// Publish and run a model JSON file
    Run {
        model: PathBuf,
        /// Run input as key=value; values are parsed as JSON when possible
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        /// sequential, parallel or adaptive_parallel (config default when unset)
        #[arg(long)]
        mode: Option<String>,
        /// Other model files the model nests
        #[arg(long = "with")]
        related: Vec<PathBuf>,
        /// Acting user (defaults to the model owner)
        #[arg(long, env = "TESSERA_USER")]
        user: Option<String>,
    },
    /// Detect cycles in a links JSON file
    Cycles { links: PathBuf },
    /// Show effective configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tessera=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "tessera", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        info!(path = %cli.config.display(), "Loading config");
        EngineConfig::load(&cli.config)?
    } else {
        EngineConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { model, level, related } => {
            let level = parse_level(&level)?;
            let model = read_model(&model)?;
            let user = model.permissions.owner.clone();
            let service = build(&config)?;
            for other in related_models(&related)? {
                let owner = other.permissions.owner.clone();
                service.import_model(other, &owner).await?;
            }
            let id = model.id.clone();
            service.import_model(model, &user).await?;

            let report = service.validate(&id, level, &user).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.overall_valid {
                std::process::exit(1);
            }
        }
        Commands::Run {
            model,
            inputs,
            mode,
            related,
            user,
        } => {
            let mode = mode
                .map(|m| m.parse::<RunMode>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let input = parse_inputs(&inputs)?;
            let model = read_model(&model)?;
            let user = user.map(UserId::from).unwrap_or_else(|| model.permissions.owner.clone());
            let service = build(&config)?;
            for other in related_models(&related)? {
                let owner = other.permissions.owner.clone();
                load_published(&service, other, &owner).await?;
            }
            let id = model.id.clone();
            load_published(&service, model, &user).await?;

            let record = service.execute(&id, mode, input, &user).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            if !record.state.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Cycles { links } => {
            let text = std::fs::read_to_string(&links)
                .with_context(|| format!("reading {}", links.display()))?;
            let links: Vec<CrossFeatureLink> = serde_json::from_str(&text)?;
            let repo = Arc::new(InMemoryLinkRepository::with_links(links));
            let service = LinkService::new(repo, Arc::new(EventBus::new(config.event_bus_capacity)), &config.links);

            let report = service.detect_cycles().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Engine over empty in-memory stores.
fn build(config: &EngineConfig) -> anyhow::Result<FunctionModelService> {
    let audit: Arc<dyn AuditSink> = match config.audit.resolved_path() {
        Some(path) => Arc::new(SqliteAuditLog::open(&path)?),
        None => Arc::new(MemoryAuditLog::new()),
    };
    let stores = Stores {
        models: Arc::new(InMemoryModelRepository::new()),
        links: Arc::new(InMemoryLinkRepository::new()),
        agents: Arc::new(InMemoryAgentRegistry::new()),
        audit,
    };
    let event_bus = Arc::new(EventBus::new(config.event_bus_capacity));
    Ok(FunctionModelService::new(config, stores, HandlerSet::new(), event_bus))
}

/// Import a model, publishing it first when it is still a draft.
async fn load_published(service: &FunctionModelService, model: FunctionModel, user: &UserId) -> anyhow::Result<()> {
    let id = model.id.clone();
    let draft = model.status == ModelStatus::Draft;
    service.import_model(model, user).await?;
    if draft {
        service
            .publish(&id, user)
            .await
            .with_context(|| format!("publishing {}", id))?;
    }
    Ok(())
}

fn read_model(path: &Path) -> anyhow::Result<FunctionModel> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn related_models(paths: &[PathBuf]) -> anyhow::Result<Vec<FunctionModel>> {
    paths.iter().map(|p| read_model(p)).collect()
}

fn parse_level(level: &str) -> anyhow::Result<ValidationLevel> {
    serde_json::from_value(Value::String(level.to_string()))
        .map_err(|_| anyhow::anyhow!("unknown validation level '{}'", level))
}

fn parse_inputs(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut input = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("input '{}' is not key=value", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        if input.insert(key.to_string(), value).is_some() {
            warn!(key, "Input given more than once, keeping the last value");
        }
    }
    Ok(input)
}
