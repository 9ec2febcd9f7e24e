//! In-process fakes shared by unit tests.

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::chain::{InputEncryptor, Ledger, LogSource, PreparedTx};
use crate::domain::{
    Cell, EncryptedMove, GameEvent, GameFacts, LedgerCall, MoveFacts, TxRef, TxStatus, Winner,
};
use crate::error::{AgentError, Result};

pub const LOCAL: Address = Address::repeat_byte(0x11);
pub const OPPONENT: Address = Address::repeat_byte(0x22);
pub const CONTRACT: Address = Address::repeat_byte(0xcc);
pub const CHAIN_ID: u64 = 31337;

pub fn handle(n: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    B256::from(bytes)
}

/// Fresh game created by `creator`, nobody joined yet.
pub fn open_game(game_id: u64, creator: Address) -> GameFacts {
    GameFacts {
        game_id,
        block: 0,
        player1: creator,
        player2: None,
        round: 0,
        winner: Winner::None,
        cancelled: false,
        board_revealed: false,
        board_size: 5,
        last_action_at: 0,
        move_timeout_secs: 0,
        round_handles: None,
        board: Vec::new(),
        moves: [MoveFacts::default(); 2],
    }
}

#[derive(Default)]
struct LedgerState {
    block: u64,
    games: HashMap<u64, GameFacts>,
    statuses: HashMap<TxRef, TxStatus>,
    prepared: u64,
    broadcasts: Vec<LedgerCall>,
    reject_broadcast: bool,
    stall_broadcast: Option<Duration>,
    can_submit: bool,
    open_games: Vec<u64>,
}

/// Scriptable ledger. Broadcast transactions stay `Pending` until the test
/// settles them.
pub struct FakeLedger {
    local: Address,
    state: Mutex<LedgerState>,
}

impl Default for FakeLedger {
    fn default() -> Self {
        Self::new(LOCAL)
    }
}

impl FakeLedger {
    pub fn new(local: Address) -> Self {
        Self {
            local,
            state: Mutex::new(LedgerState {
                block: 100,
                can_submit: true,
                ..Default::default()
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut LedgerState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn put_game(&self, facts: GameFacts) {
        self.with(|s| s.games.insert(facts.game_id, facts));
    }

    pub fn update_game(&self, game_id: u64, f: impl FnOnce(&mut GameFacts)) {
        self.with(|s| {
            if let Some(g) = s.games.get_mut(&game_id) {
                f(g);
            }
        });
    }

    pub fn block(&self) -> u64 {
        self.with(|s| s.block)
    }

    pub fn advance_block(&self) -> u64 {
        self.with(|s| {
            s.block += 1;
            s.block
        })
    }

    pub fn set_status(&self, tx: TxRef, status: TxStatus) {
        self.with(|s| s.statuses.insert(tx, status));
    }

    /// Mine every pending transaction successfully in the next block.
    pub fn confirm_pending(&self) -> u64 {
        self.with(|s| {
            s.block += 1;
            let block = s.block;
            for st in s.statuses.values_mut() {
                if *st == TxStatus::Pending {
                    *st = TxStatus::Success { block };
                }
            }
            block
        })
    }

    pub fn broadcasts(&self) -> Vec<LedgerCall> {
        self.with(|s| s.broadcasts.clone())
    }

    pub fn last_tx(&self) -> TxRef {
        self.with(|s| TxRef(handle(s.prepared)))
    }

    pub fn reject_broadcasts(&self, reject: bool) {
        self.with(|s| s.reject_broadcast = reject);
    }

    /// Accept broadcasts but hold the caller for `delay` before returning.
    pub fn stall_broadcasts(&self, delay: Option<Duration>) {
        self.with(|s| s.stall_broadcast = delay);
    }

    pub fn set_can_submit(&self, allowed: bool) {
        self.with(|s| s.can_submit = allowed);
    }

    pub fn set_open_games(&self, ids: Vec<u64>) {
        self.with(|s| s.open_games = ids);
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    fn chain_id(&self) -> u64 {
        CHAIN_ID
    }

    fn contract(&self) -> Address {
        CONTRACT
    }

    fn local_address(&self) -> Address {
        self.local
    }

    async fn current_block(&self) -> Result<u64> {
        Ok(self.block())
    }

    async fn get_game(&self, game_id: u64, block: u64) -> Result<GameFacts> {
        self.with(|s| {
            s.games
                .get(&game_id)
                .cloned()
                .map(|mut g| {
                    g.block = block;
                    g.moves = [MoveFacts::default(); 2];
                    g
                })
                .ok_or_else(|| AgentError::Rpc(format!("game {} not found", game_id)))
        })
    }

    async fn get_moves(&self, game_id: u64, _block: u64) -> Result<[MoveFacts; 2]> {
        self.with(|s| {
            s.games
                .get(&game_id)
                .map(|g| g.moves)
                .ok_or_else(|| AgentError::Rpc(format!("game {} not found", game_id)))
        })
    }

    async fn get_open_games(&self) -> Result<Vec<u64>> {
        Ok(self.with(|s| s.open_games.clone()))
    }

    async fn get_games_by_player(&self, player: Address) -> Result<Vec<u64>> {
        Ok(self.with(|s| {
            let mut ids: Vec<u64> = s
                .games
                .values()
                .filter(|g| g.player1 == player || g.player2 == Some(player))
                .map(|g| g.game_id)
                .collect();
            ids.sort_unstable();
            ids
        }))
    }

    async fn can_submit_move(&self, _game_id: u64, _player: Address, _block: u64) -> Result<bool> {
        Ok(self.with(|s| s.can_submit))
    }

    async fn transaction_status(&self, tx: &TxRef) -> Result<TxStatus> {
        Ok(self.with(|s| s.statuses.get(tx).copied().unwrap_or(TxStatus::NotFound)))
    }

    async fn prepare(&self, call: LedgerCall) -> Result<PreparedTx> {
        let n = self.with(|s| {
            s.prepared += 1;
            s.prepared
        });
        Ok(PreparedTx::new(TxRef(handle(n)), call))
    }

    async fn broadcast(&self, tx: PreparedTx) -> Result<TxRef> {
        let reference = tx.reference;
        let stall = self.with(|s| {
            if s.reject_broadcast {
                return Err(AgentError::Rpc("nonce too low".into()));
            }
            s.statuses.insert(reference, TxStatus::Pending);
            s.broadcasts.push(tx.call);
            Ok(s.stall_broadcast)
        })?;
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        Ok(reference)
    }

    async fn started_game_id(&self, _tx: &TxRef) -> Result<Option<u64>> {
        Ok(self.with(|s| s.games.keys().max().copied()))
    }
}

/// Encryptor that echoes coordinates into the handles.
pub struct FakeEncryptor;

#[async_trait]
impl InputEncryptor for FakeEncryptor {
    async fn encrypt_move(
        &self,
        _contract: Address,
        _player: Address,
        cell: Cell,
    ) -> Result<EncryptedMove> {
        Ok(EncryptedMove {
            x: handle(u64::from(cell.x)),
            y: handle(u64::from(cell.y)),
            proof: Bytes::from_static(b"input-proof"),
        })
    }
}

/// Log source replaying a fixed event list; subscriptions can be scripted.
#[derive(Default)]
pub struct FakeLogSource {
    pub head: Mutex<u64>,
    pub events: Mutex<Vec<GameEvent>>,
    pub live: Mutex<Vec<Vec<GameEvent>>>,
}

#[async_trait]
impl LogSource for FakeLogSource {
    async fn head(&self) -> Result<u64> {
        Ok(*self.head.lock().unwrap())
    }

    async fn events_between(&self, from: u64, to: u64) -> Result<Vec<GameEvent>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.block >= from && e.block <= to)
            .copied()
            .collect())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, GameEvent>> {
        use futures::StreamExt;
        let mut live = self.live.lock().unwrap();
        if live.is_empty() {
            return Err(AgentError::Rpc("subscription unavailable".into()));
        }
        let batch = live.remove(0);
        Ok(futures::stream::iter(batch).boxed())
    }
}
