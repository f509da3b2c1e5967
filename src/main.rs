use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flowd_core::config::AppConfig;
use flowd_core::event::EventBus;
use flowd_core::traits::RunLauncher;
use flowd_core::types::{ChatMessage, FlowId, FlowStatus, NodeId, PageRequest, RunId, Segment, SortOrder};

use flowd_agent::service::latest;
use flowd_agent::{
    FlowGenerator, FlowService, GenerateFlowRequest, LlmStepExecutor, Orchestrator, RunLogger,
    TriggerScheduler,
};
use flowd_llm::{Ensemble, ProviderRegistry};
use flowd_store::SqliteStore;

#[derive(Parser)]
#[command(name = "flowd", version, about = "Trigger-driven task flows backed by model ensembles")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowd.toml")]
    config: PathBuf,

    /// Account the command acts on
    #[arg(short, long, env = "FLOWD_ACCOUNT", default_value = "local")]
    account: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Arm every active flow and drive runs until Ctrl-C
    Daemon,
    /// Create a flow from a task description
    Create {
        /// What the flow should do, in plain language
        #[arg(trailing_var_arg = true, required = true)]
        task: Vec<String>,
        /// Agent codes available to the flow
        #[arg(long, value_delimiter = ',')]
        agents: Vec<String>,
        /// Event ids the agents can emit
        #[arg(long, value_delimiter = ',')]
        events: Vec<String>,
        /// Offset of your clock from UTC, in seconds
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        tz_offset: i64,
    },
    /// Set a flow active or inactive
    Status {
        flow_id: String,
        /// active | inactive
        status: String,
    },
    /// Archive an inactive flow
    Archive { flow_id: String },
    /// List flows, newest first
    Flows {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show a flow and its active run
    Show { flow_id: String },
    /// List runs of a flow
    Runs {
        flow_id: String,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        page_size: usize,
        /// Oldest first
        #[arg(long)]
        asc: bool,
    },
    /// Show a run with its nodes and threads
    Chart { flow_id: String, run_id: String },
    /// Show a flow's message log
    Log {
        flow_id: String,
        /// user | agent
        #[arg(long, default_value = "user")]
        segment: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Answer a pending question
    Answer {
        run_id: String,
        wait_id: String,
        /// Answer a node-level question instead of a run-level one
        #[arg(long)]
        node: Option<String>,
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },
    /// Deliver an external event to subscribed flows
    Event {
        event_id: String,
        /// JSON payload handed to the created runs
        #[arg(long)]
        payload: Option<String>,
    },
    /// List recorded model calls
    Calls {
        #[arg(long)]
        flow_id: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
}

/// Leaves created runs queued; the daemon picks them up on its next tick.
struct DeferredLauncher;

impl RunLauncher for DeferredLauncher {
    fn launch(&self, run_id: RunId) {
        info!(run_id = %run_id, "Run queued for the daemon");
    }
}

struct Runtime {
    service: FlowService,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowd=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let account = cli.account.as_str();

    let daemon = matches!(cli.command, Commands::Daemon);
    let runtime = build(&config, daemon)?;
    let service = &runtime.service;

    match cli.command {
        Commands::Daemon => run_daemon(&config, &runtime).await?,
        Commands::Create {
            task,
            agents,
            events,
            tz_offset,
        } => {
            let flow = service
                .create_flow(&GenerateFlowRequest {
                    account_id: account.to_string(),
                    user_id: account.to_string(),
                    init_message: task.join(" "),
                    agent_codes: agents,
                    available_events: events,
                    timezone_offset_secs: tz_offset,
                })
                .await?;
            print_json(&flow)?;
        }
        Commands::Status { flow_id, status } => {
            let status: FlowStatus = status.parse()?;
            let flow = service.change_flow_status(account, &FlowId::from_string(&flow_id), status)?;
            print_json(&flow)?;
        }
        Commands::Archive { flow_id } => {
            let flow = service.archive_flow(account, &FlowId::from_string(&flow_id))?;
            print_json(&flow)?;
        }
        Commands::Flows { limit } => {
            for flow in service.list_flows(account, latest(), limit)? {
                println!(
                    "{}  {:<8}  {}  ({})",
                    flow.id,
                    flow.status,
                    flow.readable_name,
                    flow.triggers
                        .iter()
                        .map(|t| t.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
        }
        Commands::Show { flow_id } => {
            let flow_id = FlowId::from_string(&flow_id);
            let flow = service.flow_details(account, &flow_id)?;
            let active = service.active_run_status(account, &flow_id)?;
            print_json(&serde_json::json!({ "flow": flow, "activeRun": active }))?;
        }
        Commands::Runs {
            flow_id,
            page,
            page_size,
            asc,
        } => {
            let sort = if asc { SortOrder::Asc } else { SortOrder::Desc };
            let runs = service.list_runs(
                account,
                &FlowId::from_string(&flow_id),
                PageRequest::new(page, page_size).sorted(sort),
            )?;
            print_json(&runs)?;
        }
        Commands::Chart { flow_id, run_id } => {
            let chart = service.flow_chart(
                account,
                &FlowId::from_string(&flow_id),
                &RunId::from_string(&run_id),
            )?;
            print_json(&chart)?;
        }
        Commands::Log {
            flow_id,
            segment,
            limit,
        } => {
            let segment: Segment = segment.parse()?;
            let entries = service.message_log(account, &FlowId::from_string(&flow_id), segment, latest(), limit)?;
            print_json(&entries)?;
        }
        Commands::Answer {
            run_id,
            wait_id,
            node,
            message,
        } => {
            let run_id = RunId::from_string(&run_id);
            let messages = vec![ChatMessage::user(message.join(" "))];
            let wait = match node {
                Some(node_id) => service.submit_node_input(
                    account,
                    &run_id,
                    &NodeId::from_string(&node_id),
                    &wait_id,
                    messages,
                )?,
                None => service.submit_run_input(account, &run_id, &wait_id, messages)?,
            };
            println!("Answered {}; run {} resumes on the daemon's next tick", wait.id, run_id);
        }
        Commands::Event { event_id, payload } => {
            let payload = payload
                .map(|p| serde_json::from_str::<serde_json::Value>(&p))
                .transpose()?;
            service.scheduler().reconcile()?;
            let fired = service.deliver_event(&event_id, payload);
            println!("Event {} fired {} trigger(s)", event_id, fired);
        }
        Commands::Calls { flow_id, page } => {
            let flow_id = flow_id.map(|f| FlowId::from_string(&f));
            let calls = service.list_llm_calls(account, flow_id.as_ref(), PageRequest::new(page, 20))?;
            print_json(&calls)?;
        }
    }

    runtime.cancel.cancel();
    Ok(())
}

fn load_config(path: &PathBuf) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".flowd").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!("No config file found, using defaults with no model providers");
    Ok(AppConfig::default())
}

/// Wire the store, ensemble, orchestrator, scheduler and service together.
///
/// Only the daemon drives runs. Other commands leave new runs queued.
fn build(config: &AppConfig, drive_runs: bool) -> anyhow::Result<Runtime> {
    let store = Arc::new(SqliteStore::open(&config.store_path())?);
    let event_bus = Arc::new(EventBus::default());
    let cancel = CancellationToken::new();

    let registry = ProviderRegistry::from_config(&config.providers)?;
    if registry.models().is_empty() {
        warn!("No models configured; flow generation and model-backed steps will fail");
    }
    let ensemble = Arc::new(
        Ensemble::from_config(registry, store.clone(), &config.ensemble).with_events(event_bus.clone()),
    );

    let executor = Arc::new(LlmStepExecutor::new(ensemble.clone(), &config.ensemble));
    let orchestrator = Orchestrator::new(
        store.clone(),
        executor,
        event_bus.clone(),
        config.orchestrator.max_steps,
        cancel.clone(),
    );
    let launcher: Arc<dyn RunLauncher> = if drive_runs {
        Arc::new(orchestrator.clone())
    } else {
        Arc::new(DeferredLauncher)
    };
    let scheduler = TriggerScheduler::new(store.clone(), launcher.clone(), event_bus.clone(), cancel.clone());
    let generator = FlowGenerator::new(ensemble, store.clone(), config.ensemble.clone());

    let service = FlowService::new(
        store.clone(),
        store,
        event_bus.clone(),
        scheduler,
        orchestrator,
        generator,
    )
    .with_launcher(launcher);
    Ok(Runtime {
        service,
        event_bus,
        cancel,
    })
}

async fn run_daemon(config: &AppConfig, runtime: &Runtime) -> anyhow::Result<()> {
    info!("Starting flowd daemon");
    let cancel = runtime.cancel.clone();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down daemon...");
        cancel_clone.cancel();
    });

    if let Some(log_dir) = config.log_dir() {
        let level = config.log.as_ref().map(|l| l.level).unwrap_or(2);
        let logger = RunLogger::new(log_dir, level);
        tokio::spawn(logger.run(runtime.event_bus.clone(), cancel.clone()));
    }

    runtime.service.start()?;

    let mut interval =
        tokio::time::interval(Duration::from_secs(config.scheduler.reconcile_interval_secs.max(1)));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = runtime.service.scheduler().reconcile() {
                    error!(error = %e, "Scheduler reconcile failed");
                }
                // Picks up runs queued or answered by other processes.
                if let Err(e) = runtime.service.orchestrator().recover() {
                    error!(error = %e, "Run recovery failed");
                }
            }
        }
    }

    runtime.service.scheduler().shutdown();
    info!("flowd daemon stopped");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
