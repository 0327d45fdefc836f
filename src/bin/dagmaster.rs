use anyhow::{Context as AnyhowContext, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dagmaster::config::MasterConfig;
use dagmaster::model::loader::{load_workflow_definition_from_yaml, load_workflow_definitions_from_dir};
use dagmaster::model::{Command, FailureStrategy, Priority, WorkflowExecutionStatus};
use dagmaster::rpc::local::LoopbackWorkerClient;
use dagmaster::rpc::redis_transport::{RedisTaskEventSource, RedisWorkerClient};
use dagmaster::runtime::context::MasterContext;
use dagmaster::runtime::engine::Engine;
use dagmaster::runtime::redis_storage::RedisCommandQueue;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one workflow definition to completion with in-process workers
    Run {
        /// Path to the workflow definition YAML file
        #[arg(long, short)]
        definition: PathBuf,

        /// Master config YAML file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Command param JSON, e.g. '{"StartNodeList":"2"}'
        #[arg(long)]
        param: Option<String>,

        /// Stop scheduling new tasks after the first task failure
        #[arg(long)]
        fail_fast: bool,

        /// Number of dispatch loopers, overrides the config file
        #[arg(long)]
        loopers: Option<usize>,
    },

    /// Serve as a master: consume commands from Redis and dispatch to Redis workers
    Serve {
        /// Master config YAML file, must contain a `redis` section
        #[arg(long, short)]
        config: PathBuf,

        /// Directory with workflow definition YAML files to register
        #[arg(long)]
        definitions: PathBuf,

        /// Workflow definition codes to start once the master is up
        #[arg(long)]
        trigger: Vec<i64>,

        /// Number of dispatch loopers, overrides the config file
        #[arg(long)]
        loopers: Option<usize>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<MasterConfig> {
    match path {
        Some(path) => MasterConfig::load(path),
        None => Ok(MasterConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dagmaster::init_tracing("dagmaster=info");
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { definition, config, param, fail_fast, loopers } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(loopers) = loopers {
                config.dispatch_looper_count = loopers;
            }
            let definition = load_workflow_definition_from_yaml(&definition)?;
            let code = definition.code;
            info!(code, name = %definition.name, "Running workflow in standalone mode");

            let (workers, events) = LoopbackWorkerClient::new();
            let ctx = Arc::new(MasterContext::new(config, workers));
            let engine = Arc::new(Engine::new(ctx));
            engine.register_workflow_definition(definition).await?;
            engine.start(Arc::new(events));

            let mut command = Command::start(code).with_priority(Priority::Medium);
            if fail_fast {
                command = command.with_failure_strategy(FailureStrategy::End);
            }
            if let Some(param) = param {
                command = command.with_param(param);
            }
            let workflow_instance_id = engine.handle_command(command).await?;
            let state = engine.wait_for_completion(workflow_instance_id).await?;
            engine.shutdown().await;

            info!(workflow_instance_id, state = ?state, "Workflow finished");
            if state != WorkflowExecutionStatus::Success {
                bail!("workflow instance {} ended in {:?}", workflow_instance_id, state);
            }
        }

        Commands::Serve { config, definitions, trigger, loopers } => {
            let mut config = MasterConfig::load(&config)?;
            if let Some(loopers) = loopers {
                config.dispatch_looper_count = loopers;
            }
            let redis_config = config
                .redis
                .clone()
                .ok_or_else(|| anyhow!("serve mode needs a `redis` section in the config"))?;
            let client = redis::Client::open(redis_config.url.as_str())
                .with_context(|| format!("Invalid Redis URL {}", redis_config.url))?;

            let workers = Arc::new(RedisWorkerClient::new(client.clone(), redis_config.key_prefix.clone()));
            let events = Arc::new(RedisTaskEventSource::new(client.clone(), &redis_config.key_prefix));
            let commands = Arc::new(RedisCommandQueue::new(client, &redis_config.key_prefix));
            let ctx = Arc::new(MasterContext::new(config, workers).with_command_queue(commands));
            let engine = Arc::new(Engine::new(ctx));

            for definition in load_workflow_definitions_from_dir(&definitions)? {
                engine.register_workflow_definition(definition).await?;
            }
            engine.start(events);

            for code in trigger {
                if let Err(e) = engine.submit(Command::start(code)).await {
                    error!(code, error = %e, "Failed to submit start command");
                }
            }

            info!("Master ready, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            engine.shutdown().await;
        }
    }

    Ok(())
}
