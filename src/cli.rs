//! Command line interface
//!
//! `run` starts the agent. The other commands are one-shot operations against
//! the same ledger and store; ledger writes go through the transaction
//! markers, so a later `run` never repeats them.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::info;
use zeroize::{Zeroize, Zeroizing};

use crate::config::AppConfig;
use crate::domain::{params_hash, GameKey, GameRecord, LedgerCall, TxRef, TxStatus};
use crate::error::{AgentError, Result};
use crate::persistence::MarkerDecision;
use crate::strategy::Services;

#[derive(Parser, Debug)]
#[command(name = "hidden-grid-agent")]
#[command(version)]
#[command(about = "Autonomous player for encrypted-board grid duels", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration directory (default.toml, $AGENT_ENV.toml)
    #[arg(short, long, default_value = "config", env = "AGENT_CONFIG_DIR")]
    pub config: String,

    /// Read the private key from the terminal instead of config/environment
    #[arg(long)]
    pub prompt_key: bool,

    /// Print command output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the agent until interrupted
    Run,
    /// Create a new game and track it
    StartGame {
        /// Move timeout in seconds (contract default when omitted)
        #[arg(long)]
        move_timeout: Option<u64>,
    },
    /// Join an open game
    JoinGame { game_id: u64 },
    /// Cancel an own game nobody has joined yet
    CancelGame { game_id: u64 },
    /// Show tracked games
    Status {
        /// Include finished games
        #[arg(long)]
        all: bool,
    },
    /// List open games on the contract
    OpenGames,
}

/// Private key from `ledger.private_key`, `AGENT_PRIVATE_KEY` or a prompt.
pub fn resolve_private_key(
    config: &mut AppConfig,
    prompt: bool,
) -> Result<Option<Zeroizing<String>>> {
    if prompt {
        let key = rpassword::prompt_password("Private key (hex): ")?;
        return Ok(Some(Zeroizing::new(key.trim().to_string())));
    }
    if let Some(mut key) = config.ledger.private_key.take() {
        let secure = Zeroizing::new(key.clone());
        key.zeroize();
        return Ok(Some(secure));
    }
    Ok(std::env::var("AGENT_PRIVATE_KEY").ok().map(Zeroizing::new))
}

#[derive(Debug, Serialize, Tabled)]
struct GameRow {
    game: u64,
    phase: String,
    round: u32,
    seat: &'static str,
    winner: String,
    status: String,
    retries: u32,
    #[tabled(display = "display_opt")]
    last_error: Option<String>,
}

impl From<&GameRecord> for GameRow {
    fn from(r: &GameRecord) -> Self {
        Self {
            game: r.key.game_id,
            phase: r.phase.to_string(),
            round: r.round,
            seat: if r.is_player1 { "P1" } else { "P2" },
            winner: r.winner.to_string(),
            status: r.status.to_string(),
            retries: r.retry_count,
            last_error: r.last_error.clone(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct OpenGameRow {
    game: u64,
    creator: String,
    board_size: u8,
    move_timeout_secs: u64,
}

fn display_opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn print_rows<T: Tabled + Serialize>(rows: &[T], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(rows)?);
    } else if rows.is_empty() {
        println!("(no results)");
    } else {
        println!("{}", Table::new(rows));
    }
    Ok(())
}

/// Poll a transaction until it is mined.
async fn wait_for_receipt(services: &Services, tx: TxRef, poll: Duration) -> Result<u64> {
    for _ in 0..120 {
        match services.ledger.transaction_status(&tx).await? {
            TxStatus::Success { block } => return Ok(block),
            TxStatus::Reverted { block } => {
                return Err(AgentError::Rpc(format!("{} reverted in block {}", tx, block)))
            }
            TxStatus::Pending | TxStatus::NotFound => tokio::time::sleep(poll).await,
        }
    }
    Err(AgentError::Timeout(format!("{} not mined", tx)))
}

pub async fn start_game(
    services: &Services,
    move_timeout: Option<u64>,
    poll: Duration,
) -> Result<GameKey> {
    let ledger = &services.ledger;
    let prepared = ledger
        .prepare(LedgerCall::StartGame {
            move_timeout_secs: move_timeout.unwrap_or(0),
        })
        .await?;
    let tx = ledger.broadcast(prepared).await?;
    info!("start-game sent: {}", tx);

    let block = wait_for_receipt(services, tx, poll).await?;
    let game_id = ledger.started_game_id(&tx).await?.ok_or_else(|| {
        AgentError::InvalidState(format!("No GameStarted event in {} (block {})", tx, block))
    })?;

    let key = GameKey::new(ledger.chain_id(), ledger.contract(), game_id);
    services
        .store
        .upsert_game(&GameRecord::new(key, true, chrono::Utc::now()))
        .await?;
    println!("Started game {} in block {}", game_id, block);
    Ok(key)
}

/// Submit a game-level action through its marker, like the state machine does.
async fn guarded(services: &Services, key: &GameKey, call: LedgerCall) -> Result<()> {
    let action = call.action();
    let params = params_hash([key.game_id.to_be_bytes()]);
    let block = services.ledger.current_block().await?;
    match services.markers.begin(key, action, &params, block).await? {
        MarkerDecision::Proceed => {
            let tx = services.markers.submit(key, &params, call).await?;
            println!("{} sent for game {}: {}", action, key.game_id, tx);
        }
        MarkerDecision::Wait => println!("{} for game {} is still pending", action, key.game_id),
        MarkerDecision::Confirmed(m) => {
            println!("{} for game {} already confirmed: {}", action, key.game_id, m.tx_ref)
        }
    }
    Ok(())
}

pub async fn join_game(services: &Services, game_id: u64) -> Result<()> {
    let ledger = &services.ledger;
    let key = GameKey::new(ledger.chain_id(), ledger.contract(), game_id);
    let facts = crate::chain::observe_game(ledger.as_ref(), game_id).await?;
    if facts.player2.is_some() || facts.is_settled() {
        return Err(AgentError::Validation(format!("Game {} is not open", game_id)));
    }
    if services.store.get_game(&key).await?.is_none() {
        services
            .store
            .upsert_game(&GameRecord::new(key, false, chrono::Utc::now()))
            .await?;
    }
    guarded(services, &key, LedgerCall::JoinGame { game_id }).await
}

pub async fn cancel_game(services: &Services, game_id: u64) -> Result<()> {
    let ledger = &services.ledger;
    let key = GameKey::new(ledger.chain_id(), ledger.contract(), game_id);
    let facts = crate::chain::observe_game(ledger.as_ref(), game_id).await?;
    if facts.player1 != ledger.local_address() || facts.player2.is_some() {
        return Err(AgentError::Validation(format!(
            "Game {} is not an unjoined game of {:#x}",
            game_id,
            ledger.local_address()
        )));
    }
    guarded(services, &key, LedgerCall::CancelGame { game_id }).await
}

pub async fn status(services: &Services, all: bool, json: bool) -> Result<()> {
    let ledger = &services.ledger;
    let mut games = services
        .store
        .list_games(ledger.chain_id(), ledger.contract(), !all)
        .await?;
    games.sort_by_key(|r| r.key.game_id);
    let rows: Vec<GameRow> = games.iter().map(GameRow::from).collect();
    print_rows(&rows, json)
}

pub async fn open_games(services: &Services, json: bool) -> Result<()> {
    let ledger = &services.ledger;
    let block = ledger.current_block().await?;
    let mut rows = Vec::new();
    for game_id in ledger.get_open_games().await? {
        let g = ledger.get_game(game_id, block).await?;
        rows.push(OpenGameRow {
            game: game_id,
            creator: format!("{:#x}", g.player1),
            board_size: g.board_size,
            move_timeout_secs: g.move_timeout_secs,
        });
    }
    print_rows(&rows, json)
}
