use clap::Parser;
use hidden_grid_agent::adapters::{EvmLedger, EvmLogSource, PostgresStore, RelayerClient};
use hidden_grid_agent::chain::Ledger;
use hidden_grid_agent::cli::{self, Cli, Commands};
use hidden_grid_agent::config::{AppConfig, DatabaseConfig, LoggingConfig};
use hidden_grid_agent::coordination::{install_signal_handlers, GracefulShutdown, ShutdownSignal};
use hidden_grid_agent::coordinator::Scheduler;
use hidden_grid_agent::error::{AgentError, Result};
use hidden_grid_agent::persistence::{GameStore, MemoryStore, TxMarkerManager};
use hidden_grid_agent::services::{DiscoveryService, EventWatcher};
use hidden_grid_agent::strategy::{MachineConfig, PhaseMachine, RandomSelector, Services};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.clone().unwrap_or(Commands::Run);

    let mut config = AppConfig::load_from(&cli.config)?;
    match command {
        Commands::Run => init_logging(&config.logging),
        _ => init_logging_simple(),
    }
    config
        .validate()
        .map_err(|errors| AgentError::Validation(errors.join("; ")))?;

    let key = cli::resolve_private_key(&mut config, cli.prompt_key)?;
    let ledger = Arc::new(EvmLedger::connect(
        &config.ledger,
        key.as_deref().map(String::as_str),
    )?);
    drop(key);

    let store = open_store(&config.database).await?;
    let services = build_services(&config, ledger, store)?;
    let poll = config.scheduler.confirm_poll();

    let result = match command {
        Commands::Run => return run_agent(config, services).await,
        Commands::StartGame { move_timeout } => cli::start_game(&services, move_timeout, poll)
            .await
            .map(|_| ()),
        Commands::JoinGame { game_id } => cli::join_game(&services, game_id).await,
        Commands::CancelGame { game_id } => cli::cancel_game(&services, game_id).await,
        Commands::Status { all } => cli::status(&services, all, cli.json).await,
        Commands::OpenGames => cli::open_games(&services, cli.json).await,
    };
    services.store.close().await;
    result
}

async fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn GameStore>> {
    if config.is_memory() {
        warn!("Using the in-memory store; game state will not survive a restart");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = PostgresStore::new(&config.url, config.max_connections).await?;
    store.migrate().await?;
    Ok(Arc::new(store))
}

fn build_services(
    config: &AppConfig,
    ledger: Arc<EvmLedger>,
    store: Arc<dyn GameStore>,
) -> Result<Services> {
    let relayer = Arc::new(RelayerClient::new(&config.relayer)?);
    let ledger: Arc<dyn Ledger> = ledger;
    let markers = Arc::new(TxMarkerManager::new(
        store.clone(),
        ledger.clone(),
        config.markers.clone(),
    ));
    Ok(Services {
        ledger,
        oracle: relayer.clone(),
        encryptor: relayer,
        store,
        markers,
    })
}

async fn run_agent(config: AppConfig, services: Services) -> Result<()> {
    let me = services.ledger.local_address();
    if me.is_zero() {
        return Err(AgentError::Wallet(
            "No private key configured (ledger.private_key, AGENT_PRIVATE_KEY or --prompt-key)"
                .into(),
        ));
    }

    let shutdown = Arc::new(GracefulShutdown::with_defaults());
    install_signal_handlers(shutdown.clone());

    let machine = Arc::new(PhaseMachine::new(
        services.clone(),
        Arc::new(RandomSelector),
        MachineConfig {
            default_move_timeout_secs: config.ledger.default_move_timeout_secs,
            opponent_wait_timeout: config
                .scheduler
                .opponent_wait_timeout_secs
                .map(Duration::from_secs),
            max_transient_retries: config.scheduler.max_transient_retries,
        },
    ));
    let scheduler = Scheduler::new(machine, config.scheduler.clone());
    let scheduler_handle = scheduler.handle();
    let (event_tx, event_rx) = mpsc::channel(1024);

    let scheduler_task = {
        let shutdown_rx = shutdown.subscribe();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match scheduler.run(event_rx, shutdown_rx).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Scheduler stopped: {}", e);
                    shutdown.request_shutdown(ShutdownSignal::Urgent);
                    false
                }
            }
        })
    };

    let mut background = JoinSet::new();
    if config.watcher.enabled {
        let source = Arc::new(EvmLogSource::connect(&config.ledger)?);
        let watcher = Arc::new(EventWatcher::new(
            source,
            config.watcher.clone(),
            config.ledger.ws_url.is_some(),
            event_tx,
        ));
        let shutdown_rx = shutdown.subscribe();
        background.spawn(async move {
            if let Err(e) = watcher.run(shutdown_rx).await {
                error!("Event watcher stopped: {}", e);
            }
        });
    } else {
        drop(event_tx);
        info!("Event watcher disabled; relying on scheduler polling");
    }

    if config.discovery.enabled {
        let discovery = DiscoveryService::new(
            services.ledger.clone(),
            services.store.clone(),
            scheduler_handle,
            config.discovery.clone(),
        );
        let shutdown_rx = shutdown.subscribe();
        background.spawn(async move { discovery.run_forever(shutdown_rx).await });
    }

    info!(
        "Agent running as {:#x} on chain {} contract {:#x}",
        me,
        services.ledger.chain_id(),
        services.ledger.contract()
    );

    let signal = shutdown.wait_for_request().await;
    info!("Stopping agent ({})", signal);

    let store = services.store.clone();
    shutdown
        .execute(
            Box::pin(async move { matches!(scheduler_task.await, Ok(true)) }),
            Box::pin(async move { while background.join_next().await.is_some() {} }),
            Box::pin(async move { store.close().await }),
        )
        .await
        .map_err(|e| AgentError::Internal(e.to_string()))
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hidden_grid_agent=debug,sqlx=warn",
            config.level
        ))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
