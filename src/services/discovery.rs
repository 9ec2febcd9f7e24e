//! Background discovery service: finds games the local player takes part
//! in (and, with auto-join, open games to adopt) and hands them to the
//! scheduler.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, info, warn};

use crate::chain::Ledger;
use crate::config::DiscoveryConfig;
use crate::coordination::ShutdownSignal;
use crate::coordinator::SchedulerHandle;
use crate::domain::{GameKey, GameRecord};
use crate::error::Result;
use crate::persistence::GameStore;

pub struct DiscoveryService {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn GameStore>,
    scheduler: SchedulerHandle,
    cfg: DiscoveryConfig,
}

impl DiscoveryService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn GameStore>,
        scheduler: SchedulerHandle,
        cfg: DiscoveryConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            scheduler,
            cfg,
        }
    }

    /// Run the discovery loop until shutdown (call from a spawned task).
    pub async fn run_forever(&self, mut shutdown_rx: broadcast::Receiver<ShutdownSignal>) {
        info!(
            "DiscoveryService: starting (interval={}s, auto_join={}, max_active={})",
            self.cfg.interval_secs, self.cfg.auto_join, self.cfg.max_active_games
        );

        let mut ticker = time::interval(Duration::from_secs(self.cfg.interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!("DiscoveryService: scan cycle failed: {e}");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("DiscoveryService: stopped");
    }

    /// Execute a single discovery cycle; returns how many games were adopted.
    pub async fn run_once(&self) -> Result<usize> {
        let me = self.ledger.local_address();
        let chain_id = self.ledger.chain_id();
        let contract = self.ledger.contract();
        let known: HashSet<GameKey> = self
            .store
            .list_games(chain_id, contract, false)
            .await?
            .into_iter()
            .map(|r| r.key)
            .collect();
        let mut active = self
            .store
            .list_games(chain_id, contract, true)
            .await?
            .len();
        let mut adopted = 0;

        for game_id in self.ledger.get_games_by_player(me).await? {
            let key = GameKey::new(chain_id, contract, game_id);
            if known.contains(&key) {
                continue;
            }
            match self.adopt_own(key).await {
                Ok(true) => {
                    adopted += 1;
                    active += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("DiscoveryService: game {game_id} skipped: {e}"),
            }
        }

        if self.cfg.auto_join {
            for game_id in self.ledger.get_open_games().await? {
                if active >= self.cfg.max_active_games {
                    debug!("DiscoveryService: {active} active games, not joining more");
                    break;
                }
                let key = GameKey::new(chain_id, contract, game_id);
                if known.contains(&key) {
                    continue;
                }
                match self.adopt_open(key).await {
                    Ok(true) => {
                        adopted += 1;
                        active += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("DiscoveryService: open game {game_id} skipped: {e}"),
                }
            }
        }

        if adopted > 0 {
            info!("DiscoveryService: adopted {adopted} games ({active} active)");
        }
        Ok(adopted)
    }

    /// A game the local player already sits in.
    async fn adopt_own(&self, key: GameKey) -> Result<bool> {
        let block = self.ledger.current_block().await?;
        let facts = self.ledger.get_game(key.game_id, block).await?;
        if facts.is_settled() {
            return Ok(false);
        }
        let is_player1 = facts.player1 == self.ledger.local_address();
        self.register(GameRecord::new(key, is_player1, Utc::now()))
            .await
    }

    /// An open game created by someone else; the state machine joins it.
    async fn adopt_open(&self, key: GameKey) -> Result<bool> {
        let block = self.ledger.current_block().await?;
        let facts = self.ledger.get_game(key.game_id, block).await?;
        if facts.is_settled()
            || facts.player2.is_some()
            || facts.player1 == self.ledger.local_address()
        {
            return Ok(false);
        }
        info!("DiscoveryService: adopting open game {}", key.game_id);
        self.register(GameRecord::new(key, false, Utc::now())).await
    }

    async fn register(&self, record: GameRecord) -> Result<bool> {
        self.store.upsert_game(&record).await?;
        Ok(self.scheduler.track(record).await)
    }
}
