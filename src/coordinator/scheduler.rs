//! Game scheduler
//!
//! Owns the due instant of every active game and the worker pool that steps
//! them. The main `run()` loop uses `tokio::select!` to:
//!   - Adopt new games from discovery and the CLI
//!   - Mark games due on ledger events from the watcher
//!   - Collect finished steps and reschedule their games
//!   - Periodically dispatch due games, oldest first
//!
//! A game is never stepped twice concurrently; an event arriving while its
//! step runs makes it due again as soon as that step finishes.

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::coordination::ShutdownSignal;
use crate::domain::{GameEvent, GameKey, GamePhase, GameRecord};
use crate::error::Result;
use crate::persistence::GameStore;
use crate::strategy::{PhaseMachine, StepOutcome};

/// Delay until a game should be stepped again, `None` once it is done.
pub fn next_delay(config: &SchedulerConfig, outcome: &StepOutcome) -> Option<Duration> {
    let record = &outcome.record;
    if record.phase.is_terminal() || !record.is_active() {
        return None;
    }
    if record.retry_count > 0 || matches!(record.phase, GamePhase::Error { .. }) {
        return Some(config.error_backoff(record.retry_count.max(1)));
    }
    if outcome.awaiting {
        return Some(config.confirm_poll());
    }
    if record.phase.is_waiting() {
        return Some(config.poll_interval());
    }
    Some(Duration::ZERO)
}

/// How long the record has been in its current waiting phase.
fn waited(record: &GameRecord) -> Option<Duration> {
    record
        .waiting_since
        .map(|since| (Utc::now() - since).to_std().unwrap_or_default())
}

/// Keep `waiting_since` in step with the phase: repeating a waiting phase
/// keeps the stamp, entering another one restarts it, leaving clears it.
fn track_waiting(previous: GamePhase, record: &mut GameRecord, now: DateTime<Utc>) {
    if !record.phase.is_waiting() {
        record.waiting_since = None;
    } else if previous.as_str() != record.phase.as_str() || record.waiting_since.is_none() {
        record.waiting_since = Some(now);
    }
}

/// Clonable handle used to hand games to the scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    track_tx: mpsc::Sender<GameRecord>,
}

impl SchedulerHandle {
    pub(crate) fn new(track_tx: mpsc::Sender<GameRecord>) -> Self {
        Self { track_tx }
    }

    /// Start scheduling a game; an already tracked game is left untouched.
    pub async fn track(&self, record: GameRecord) -> bool {
        self.track_tx.send(record).await.is_ok()
    }
}

struct Slot {
    /// `None` while a step for the game is in flight
    record: Option<GameRecord>,
    due: Instant,
    /// An event arrived during the in-flight step
    dirty: bool,
}

pub struct Scheduler {
    machine: Arc<PhaseMachine>,
    store: Arc<dyn GameStore>,
    config: SchedulerConfig,
    chain_id: u64,
    contract: Address,
    games: HashMap<GameKey, Slot>,
    track_rx: mpsc::Receiver<GameRecord>,
    track_tx: mpsc::Sender<GameRecord>,
}

impl Scheduler {
    pub fn new(machine: Arc<PhaseMachine>, config: SchedulerConfig) -> Self {
        let services = machine.services();
        let store = services.store.clone();
        let chain_id = services.ledger.chain_id();
        let contract = services.ledger.contract();
        let (track_tx, track_rx) = mpsc::channel(256);
        Self {
            machine,
            store,
            config,
            chain_id,
            contract,
            games: HashMap::new(),
            track_rx,
            track_tx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(self.track_tx.clone())
    }

    pub fn tracked(&self) -> usize {
        self.games.len()
    }

    /// Load every active game of this contract from the store.
    pub async fn seed(&mut self) -> Result<usize> {
        let records = self
            .store
            .list_games(self.chain_id, self.contract, true)
            .await?;
        let count = records.len();
        for record in records {
            self.adopt(record);
        }
        info!("Resuming {} active games from the store", count);
        Ok(count)
    }

    fn adopt(&mut self, record: GameRecord) {
        if record.phase.is_terminal() || !record.is_active() {
            return;
        }
        let key = record.key;
        if self.games.contains_key(&key) {
            return;
        }
        debug!(game = %key, "Tracking game in {}", record.phase);
        self.games.insert(
            key,
            Slot {
                record: Some(record),
                due: Instant::now(),
                dirty: false,
            },
        );
    }

    fn on_event(&mut self, event: GameEvent) {
        let key = GameKey::new(self.chain_id, self.contract, event.game_id);
        let Some(slot) = self.games.get_mut(&key) else {
            return;
        };
        debug!(game = %key, "{} at block {}", event.kind, event.block);
        if slot.record.is_some() {
            slot.due = Instant::now();
        } else {
            slot.dirty = true;
        }
    }

    fn on_step_done(&mut self, key: GameKey, outcome: StepOutcome) {
        let Some(delay) = next_delay(&self.config, &outcome) else {
            info!(game = %key, "Game finished in {}", outcome.record.phase);
            self.games.remove(&key);
            return;
        };
        if let Some(slot) = self.games.get_mut(&key) {
            slot.due = if slot.dirty {
                Instant::now()
            } else {
                Instant::now() + delay
            };
            slot.dirty = false;
            slot.record = Some(outcome.record);
        }
    }

    /// Due, idle games ordered oldest-due first.
    fn due_keys(&self, now: Instant) -> Vec<GameKey> {
        let mut due: Vec<(Instant, GameKey)> = self
            .games
            .iter()
            .filter(|(_, slot)| slot.record.is_some() && slot.due <= now)
            .map(|(key, slot)| (slot.due, *key))
            .collect();
        due.sort();
        due.into_iter().map(|(_, key)| key).collect()
    }

    fn dispatch(&mut self, tasks: &mut JoinSet<(GameKey, StepOutcome)>, pool: &Arc<Semaphore>) {
        for key in self.due_keys(Instant::now()) {
            let Ok(permit) = pool.clone().try_acquire_owned() else {
                break;
            };
            let Some(record) = self.games.get_mut(&key).and_then(|s| s.record.take()) else {
                continue;
            };
            tasks.spawn(run_step(
                self.machine.clone(),
                self.store.clone(),
                self.config.clone(),
                record,
                permit,
            ));
        }
    }

    /// Run until shutdown is requested, then let in-flight steps finish.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<GameEvent>,
        mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
    ) -> Result<()> {
        self.seed().await?;

        let pool = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut tasks: JoinSet<(GameKey, StepOutcome)> = JoinSet::new();
        let mut tick = tokio::time::interval(self.config.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            workers = self.config.max_workers,
            games = self.games.len(),
            "scheduler starting main loop"
        );

        loop {
            tokio::select! {
                signal = shutdown_rx.recv() => {
                    info!("scheduler: shutdown signal received ({:?})", signal.ok());
                    break;
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok((key, outcome)) => self.on_step_done(key, outcome),
                        Err(e) => error!("Step task failed to join: {}", e),
                    }
                }

                Some(record) = self.track_rx.recv() => self.adopt(record),

                Some(event) = events.recv() => self.on_event(event),

                _ = tick.tick() => self.dispatch(&mut tasks, &pool),
            }
        }

        if !tasks.is_empty() {
            info!("Waiting for {} in-flight steps", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            if let Ok((key, outcome)) = joined {
                self.on_step_done(key, outcome);
            }
        }
        info!("scheduler: main loop exited");
        Ok(())
    }
}

/// One bounded step of one game, persisted before the permit is released.
async fn run_step(
    machine: Arc<PhaseMachine>,
    store: Arc<dyn GameStore>,
    config: SchedulerConfig,
    record: GameRecord,
    _permit: OwnedSemaphorePermit,
) -> (GameKey, StepOutcome) {
    let key = record.key;
    let previous = record.phase;
    let waited = waited(&record);
    let fallback = record.clone();

    // Own task so a panic or overrun is contained to this game
    let step = tokio::spawn(async move { machine.step(record, waited).await });
    let abort = step.abort_handle();
    let mut outcome = match tokio::time::timeout(config.step_timeout(), step).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            error!(game = %key, "Step panicked: {}", e);
            let record = recover(store.as_ref(), fallback).await;
            failed(&config, record, format!("step aborted: {}", e))
        }
        Err(_) => {
            abort.abort();
            warn!(game = %key, "Step exceeded {:?}", config.step_timeout());
            let record = recover(store.as_ref(), fallback).await;
            failed(
                &config,
                record,
                format!("step timed out after {:?}", config.step_timeout()),
            )
        }
    };
    track_waiting(previous, &mut outcome.record, Utc::now());

    if let Some(delay) = next_delay(&config, &outcome) {
        outcome.record.next_check_at = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
    } else {
        outcome.record.next_check_at = None;
    }
    if let Err(e) = store.upsert_game(&outcome.record).await {
        warn!(game = %key, "Failed to persist record: {}", e);
    }
    (key, outcome)
}

/// Last durable state of a game whose step never returned. The step may have
/// persisted a chosen move before it stalled.
async fn recover(store: &dyn GameStore, fallback: GameRecord) -> GameRecord {
    match store.get_game(&fallback.key).await {
        Ok(Some(stored)) if stored.updated_at >= fallback.updated_at => stored,
        Ok(_) => fallback,
        Err(e) => {
            warn!(game = %fallback.key, "Failed to reload record: {}", e);
            fallback
        }
    }
}

fn failed(config: &SchedulerConfig, mut record: GameRecord, message: String) -> StepOutcome {
    record.retry_count += 1;
    if record.retry_count >= config.max_transient_retries {
        warn!(
            game = %record.key,
            "Step failed {} times, entering error phase: {}", record.retry_count, message
        );
        record.phase = GamePhase::Error {
            should_continue: true,
        };
    }
    record.last_error = Some(message);
    record.updated_at = Utc::now();
    StepOutcome {
        record,
        awaiting: false,
    }
}
