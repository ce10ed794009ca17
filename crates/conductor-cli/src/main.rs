mod config;
mod shell;

use clap::{Parser, Subcommand, ValueEnum};
use conductor_core::{EventSink, FanoutSink, JsonlEventLog};
use conductor_orchestrator::{
    CheckpointManager, MemoryCheckpoints, Orchestrator, PathRuleAnalyzer,
};
use config::ConductorConfig;
use shell::{CommandLoader, ShellCheckpoints};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: dependency-ordered agent orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the configured agents
    Run {
        /// Changed files; only affected agents and their dependencies run
        #[arg(long, num_args = 1..)]
        changed: Vec<String>,
    },
    /// Print the execution order of every agent
    Order,
    /// Validate the dependency graph and print the health report
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

/// Everything built from the config file.
struct Workload {
    orchestrator: Arc<Orchestrator>,
    journal: Option<Arc<JsonlEventLog>>,
}

async fn build(config: ConductorConfig, config_dir: &Path) -> anyhow::Result<Workload> {
    let journal = config
        .event_log
        .as_ref()
        .map(|log| Arc::new(JsonlEventLog::new(config_dir.join(&log.path))));
    let events: Arc<dyn EventSink> = match &journal {
        Some(journal) => Arc::new(FanoutSink::new().with(journal.clone())),
        None => Arc::new(FanoutSink::new()),
    };

    let checkpoints: Arc<dyn CheckpointManager> = match &config.checkpoint {
        Some(hooks) => Arc::new(ShellCheckpoints::new(hooks.clone(), config_dir.to_path_buf())),
        None => Arc::new(MemoryCheckpoints::new()),
    };

    let mut analyzer = PathRuleAnalyzer::new();
    for agent in config.agents.iter().filter(|a| !a.watch.is_empty()) {
        analyzer = analyzer.watch(agent.name.clone(), &agent.watch)?;
    }

    let default_guard = config.orchestrator.default_guard;
    let mut orchestrator = Orchestrator::new(config.orchestrator, checkpoints, events)?;
    if analyzer.rule_count() > 0 {
        orchestrator = orchestrator.with_impact_analyzer(Arc::new(analyzer));
    }

    for agent in &config.agents {
        let dependencies: Vec<&str> = agent.dependencies.iter().map(String::as_str).collect();
        orchestrator
            .register_agent_with_guard(
                &agent.name,
                Arc::new(CommandLoader::from_config(agent, config_dir)),
                &dependencies,
                agent.guard_or(default_guard),
            )
            .await?;
    }
    info!(agents = config.agents.len(), "workload loaded");

    Ok(Workload {
        orchestrator: Arc::new(orchestrator),
        journal,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = ConductorConfig::load(&cli.config).await?;

    // Resolve config base directory (for relative agent and log paths)
    let config_dir = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let workload = build(config, &config_dir).await?;
    let orchestrator = workload.orchestrator;

    let code = match cli.command {
        Commands::Run { changed } => {
            let stopper = orchestrator.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping after running agents finish");
                    stopper.stop().await;
                }
            });

            let result = orchestrator.execute(&changed).await;
            if let Some(journal) = &workload.journal {
                journal.sync().await;
            }
            let result = result?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Order => {
            for (i, name) in orchestrator.execution_order().await?.iter().enumerate() {
                println!("{:>3}. {name}", i + 1);
            }
            ExitCode::SUCCESS
        }
        Commands::Check => {
            let health = orchestrator.health().await;
            println!("{}", serde_json::to_string_pretty(&health.to_json())?);
            if health.healthy() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    };

    Ok(code)
}
