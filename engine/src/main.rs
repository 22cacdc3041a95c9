use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pilot_budget::{day_window, BudgetEnforcer, UsageLedger};
use pilot_core::{
    config::resolve_state_dir, FileProcessedStore, PilotConfig, Poller, TaskHandler,
};
use pilot_observability::{init_logging, redact_credential, ProcessKind, WorkerGuard};
use pilot_trackers::{AsanaTracker, AzureDevOpsTracker, LinearTracker, TrackerApi};

mod executor;

use executor::ExecutorClient;

const LOG_RETENTION_DAYS: u64 = 14;
/// Keep roughly two monthly budget windows of usage history.
const LEDGER_RETENTION_DAYS: i64 = 62;

#[derive(Parser, Debug)]
#[command(name = "pilot-engine")]
#[command(about = "Autonomous task agent over external issue trackers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll all configured trackers until interrupted.
    Serve {
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
    /// Run a single poll tick per tracker, wait for dispatched work, exit.
    Once {
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
    /// Run orphan recovery only.
    Recover {
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { state_dir } => {
            let state = build_state(resolve_state_dir(state_dir)).await?;
            serve(state).await
        }
        Command::Once { state_dir } => {
            let state = build_state(resolve_state_dir(state_dir)).await?;
            run_once(state).await
        }
        Command::Recover { state_dir } => {
            let state = build_state(resolve_state_dir(state_dir)).await?;
            recover(state).await
        }
    }
}

struct PollerHandle {
    name: String,
    poller: Arc<Poller>,
    polling_enabled: bool,
}

struct AppState {
    pollers: Vec<PollerHandle>,
    enforcer: Arc<BudgetEnforcer>,
    ledger: Arc<UsageLedger>,
    /// Kept alive for the process lifetime so buffered log lines flush on
    /// exit.
    _log_guard: WorkerGuard,
}

async fn build_state(state_dir: PathBuf) -> anyhow::Result<AppState> {
    let (log_guard, logs_dir) =
        init_logging(ProcessKind::Engine, &state_dir, LOG_RETENTION_DAYS)?;

    let config = PilotConfig::load(&state_dir)?;
    log_startup_paths(&state_dir, &logs_dir);

    let ledger = Arc::new(UsageLedger::new());
    let enforcer = Arc::new(BudgetEnforcer::new(config.budget.clone(), ledger.clone()));
    enforcer.on_alert(|alert| {
        warn!(
            "budget alert: {:?}/{:?} — ${:.2} of ${:.2}",
            alert.scope, alert.kind, alert.spent_usd, alert.limit_usd
        );
    });

    let store = Arc::new(FileProcessedStore::new(&state_dir));

    let handler: Option<Arc<dyn TaskHandler>> = match std::env::var("PILOT_EXECUTOR_CMD") {
        Ok(command) if !command.trim().is_empty() => {
            let model = std::env::var("PILOT_EXECUTOR_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4".to_string());
            Some(Arc::new(ExecutorClient::new(
                command,
                state_dir.join("recordings"),
                model,
                ledger.clone(),
            )))
        }
        _ => {
            warn!("PILOT_EXECUTOR_CMD is not set — tasks will be discovered but not executed");
            None
        }
    };

    let mut pollers = Vec::new();

    if let Some(entry) = config.trackers.asana.as_ref().filter(|e| e.common.enabled) {
        debug!(
            "asana configured (token {})",
            redact_credential(&entry.api.access_token)
        );
        let tracker: Arc<dyn TrackerApi> = Arc::new(AsanaTracker::new(entry.api.clone()));
        pollers.push(PollerHandle {
            name: "asana".to_string(),
            poller: Arc::new(Poller::new(
                tracker,
                handler.clone(),
                store.clone(),
                enforcer.clone(),
                entry.common.poller_config(),
            )),
            polling_enabled: entry.common.polling.enabled,
        });
    }

    if let Some(entry) = config
        .trackers
        .azure_devops
        .as_ref()
        .filter(|e| e.common.enabled)
    {
        debug!(
            "azure devops configured (pat {})",
            redact_credential(&entry.api.pat)
        );
        let tracker: Arc<dyn TrackerApi> = Arc::new(AzureDevOpsTracker::new(entry.api.clone()));
        pollers.push(PollerHandle {
            name: "azure_devops".to_string(),
            poller: Arc::new(Poller::new(
                tracker,
                handler.clone(),
                store.clone(),
                enforcer.clone(),
                entry.common.poller_config(),
            )),
            polling_enabled: entry.common.polling.enabled,
        });
    }

    if let Some(entry) = config.trackers.linear.as_ref().filter(|e| e.common.enabled) {
        debug!(
            "linear configured (key {})",
            redact_credential(&entry.api.api_key)
        );
        let tracker: Arc<dyn TrackerApi> = Arc::new(LinearTracker::new(entry.api.clone()));
        pollers.push(PollerHandle {
            name: "linear".to_string(),
            poller: Arc::new(Poller::new(
                tracker,
                handler.clone(),
                store.clone(),
                enforcer.clone(),
                entry.common.poller_config(),
            )),
            polling_enabled: entry.common.polling.enabled,
        });
    }

    Ok(AppState {
        pollers,
        enforcer,
        ledger,
        _log_guard: log_guard,
    })
}

fn log_startup_paths(state_dir: &PathBuf, logs_dir: &PathBuf) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting pilot-engine");
    info!(
        "startup paths: exe={} cwd={} state_dir={} logs_dir={}",
        exe.display(),
        cwd.display(),
        state_dir.display(),
        logs_dir.display()
    );
}

async fn serve(state: AppState) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    spawn_daily_roll(state.enforcer.clone(), state.ledger.clone(), cancel.clone());

    let mut set = JoinSet::new();
    for handle in &state.pollers {
        if !handle.polling_enabled {
            info!("{}: polling disabled, skipping", handle.name);
            continue;
        }
        let poller = handle.poller.clone();
        let name = handle.name.clone();
        let token = cancel.clone();
        set.spawn(async move {
            if let Err(e) = poller.start(token).await {
                error!("{name} poller stopped with error: {e:#}");
            }
        });
    }

    if set.is_empty() {
        anyhow::bail!("no pollers to run — every configured tracker has polling disabled");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested; draining in-flight work");
    cancel.cancel();

    while set.join_next().await.is_some() {}
    info!("all pollers drained");
    Ok(())
}

async fn run_once(state: AppState) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    for handle in &state.pollers {
        info!("{}: single poll tick", handle.name);
        handle.poller.prepare().await?;
        handle.poller.poll_once(&cancel).await;
        handle.poller.wait_for_active().await;
        info!(
            "{}: {} tasks processed in this instance's history",
            handle.name,
            handle.poller.processed_count().await
        );
    }
    Ok(())
}

async fn recover(state: AppState) -> anyhow::Result<()> {
    for handle in &state.pollers {
        info!("{}: orphan recovery", handle.name);
        handle.poller.recover_orphans().await;
    }
    Ok(())
}

/// Calls `reset_daily` at each local midnight and keeps the in-memory usage
/// ledger bounded.
fn spawn_daily_roll(
    enforcer: Arc<BudgetEnforcer>,
    ledger: Arc<UsageLedger>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let (_, day_end) = day_window(chrono::Local::now());
            let until_midnight = (day_end - chrono::Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(60));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(until_midnight) => {}
            }
            info!("daily budget roll");
            enforcer.reset_daily();
            ledger.prune_before(
                chrono::Utc::now() - chrono::Duration::days(LEDGER_RETENTION_DAYS),
            );
        }
    });
}
