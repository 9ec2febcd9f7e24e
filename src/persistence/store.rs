//! Durable keyed storage for game records, attempted moves and tx markers.

use alloy::primitives::Address;
use async_trait::async_trait;

use crate::domain::{AttemptedMove, GameKey, GameRecord, TxAction, TxMarker};
use crate::error::Result;

/// Store behind the scheduler, state machine and marker manager.
///
/// All writes are upserts keyed by the logical primary key of each table:
/// `games (chain, contract, game)`, `attempted_moves (chain, contract, game,
/// x, y, round)` and `tx_markers (chain, contract, game, action)`.
#[async_trait]
pub trait GameStore: Send + Sync {
    async fn upsert_game(&self, record: &GameRecord) -> Result<()>;

    async fn get_game(&self, key: &GameKey) -> Result<Option<GameRecord>>;

    /// Games on one contract, optionally only those still active.
    async fn list_games(
        &self,
        chain_id: u64,
        contract: Address,
        active_only: bool,
    ) -> Result<Vec<GameRecord>>;

    /// Insert or update the row for `(game, x, y, round)`. A `None` tx
    /// reference keeps the stored one.
    async fn upsert_attempted_move(&self, mv: &AttemptedMove) -> Result<()>;

    async fn attempted_moves(&self, key: &GameKey) -> Result<Vec<AttemptedMove>>;

    async fn get_marker(&self, key: &GameKey, action: TxAction) -> Result<Option<TxMarker>>;

    async fn upsert_marker(&self, marker: &TxMarker) -> Result<()>;

    /// Remove every marker of a game; returns how many were removed.
    async fn delete_markers(&self, key: &GameKey) -> Result<u64>;

    /// Flush and release connections.
    async fn close(&self);
}
