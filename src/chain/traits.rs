use alloy::consensus::TxEnvelope;
use alloy::primitives::Address;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::OwnedMutexGuard;

use crate::domain::{
    Cell, Decryption, EncryptedMove, GameEvent, GameFacts, Handle, LedgerCall, MoveFacts, TxRef,
    TxStatus,
};
use crate::error::Result;

/// A signed ledger call whose reference is known before broadcast.
///
/// Holding a `PreparedTx` may hold the ledger's submission lock; it is
/// released once the transaction is broadcast or dropped.
pub struct PreparedTx {
    pub reference: TxRef,
    pub call: LedgerCall,
    pub(crate) envelope: Option<TxEnvelope>,
    pub(crate) permit: Option<OwnedMutexGuard<()>>,
}

impl PreparedTx {
    /// Unsigned form, for ledgers that do their own signing.
    pub fn new(reference: TxRef, call: LedgerCall) -> Self {
        Self {
            reference,
            call,
            envelope: None,
            permit: None,
        }
    }

    pub(crate) fn signed(
        reference: TxRef,
        call: LedgerCall,
        envelope: TxEnvelope,
        permit: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            reference,
            call,
            envelope: Some(envelope),
            permit: Some(permit),
        }
    }
}

impl std::fmt::Debug for PreparedTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedTx")
            .field("reference", &self.reference)
            .field("action", &self.call.action())
            .finish()
    }
}

/// Remote game contract as seen by the local player.
#[async_trait]
pub trait Ledger: Send + Sync {
    fn chain_id(&self) -> u64;

    fn contract(&self) -> Address;

    /// Address of the local player
    fn local_address(&self) -> Address;

    async fn current_block(&self) -> Result<u64>;

    /// Game header at `block`; `moves` is left default, see [`observe_game`].
    async fn get_game(&self, game_id: u64, block: u64) -> Result<GameFacts>;

    async fn get_moves(&self, game_id: u64, block: u64) -> Result<[MoveFacts; 2]>;

    async fn get_open_games(&self) -> Result<Vec<u64>>;

    async fn get_games_by_player(&self, player: Address) -> Result<Vec<u64>>;

    async fn can_submit_move(&self, game_id: u64, player: Address, block: u64) -> Result<bool>;

    async fn transaction_status(&self, tx: &TxRef) -> Result<TxStatus>;

    /// Sign a call locally so its reference is known before it is sent.
    async fn prepare(&self, call: LedgerCall) -> Result<PreparedTx>;

    async fn broadcast(&self, tx: PreparedTx) -> Result<TxRef>;

    /// Game id created by a confirmed start-game transaction.
    async fn started_game_id(&self, tx: &TxRef) -> Result<Option<u64>>;
}

/// Read a full game snapshot with every read pinned to one block.
pub async fn observe_game(ledger: &dyn Ledger, game_id: u64) -> Result<GameFacts> {
    let block = ledger.current_block().await?;
    let mut facts = ledger.get_game(game_id, block).await?;
    facts.moves = ledger.get_moves(game_id, block).await?;
    facts.block = block;
    Ok(facts)
}

/// Resolves handles to clear values plus one proof for the batch.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecryptionOracle: Send + Sync {
    async fn decrypt(&self, contract: Address, handles: &[Handle]) -> Result<Decryption>;
}

/// Produces encrypted move coordinates bound to the submitting player.
#[async_trait]
pub trait InputEncryptor: Send + Sync {
    async fn encrypt_move(
        &self,
        contract: Address,
        player: Address,
        cell: Cell,
    ) -> Result<EncryptedMove>;
}

/// Source of contract events for the watcher.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn head(&self) -> Result<u64>;

    /// Events in the inclusive block range, in chain order.
    async fn events_between(&self, from: u64, to: u64) -> Result<Vec<GameEvent>>;

    /// Live event stream; ends when the underlying subscription drops.
    async fn subscribe(&self) -> Result<BoxStream<'static, GameEvent>>;
}
