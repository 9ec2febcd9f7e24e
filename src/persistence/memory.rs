//! Process-local store used for dry runs (`database.url = "memory://"`) and tests.

use alloy::primitives::Address;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::store::GameStore;
use crate::domain::{AttemptedMove, Cell, GameKey, GameRecord, TxAction, TxMarker};
use crate::error::Result;

type MoveKey = (GameKey, Cell, u32);
type MarkerKey = (GameKey, &'static str);

#[derive(Default)]
pub struct MemoryStore {
    games: RwLock<BTreeMap<GameKey, GameRecord>>,
    moves: RwLock<BTreeMap<MoveKey, AttemptedMove>>,
    markers: RwLock<BTreeMap<MarkerKey, TxMarker>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GameStore for MemoryStore {
    async fn upsert_game(&self, record: &GameRecord) -> Result<()> {
        self.games.write().await.insert(record.key, record.clone());
        Ok(())
    }

    async fn get_game(&self, key: &GameKey) -> Result<Option<GameRecord>> {
        Ok(self.games.read().await.get(key).cloned())
    }

    async fn list_games(
        &self,
        chain_id: u64,
        contract: Address,
        active_only: bool,
    ) -> Result<Vec<GameRecord>> {
        Ok(self
            .games
            .read()
            .await
            .values()
            .filter(|r| r.key.chain_id == chain_id && r.key.contract == contract)
            .filter(|r| !active_only || r.is_active())
            .cloned()
            .collect())
    }

    async fn upsert_attempted_move(&self, mv: &AttemptedMove) -> Result<()> {
        let mut moves = self.moves.write().await;
        let entry = moves
            .entry((mv.key, mv.cell, mv.round))
            .or_insert_with(|| mv.clone());
        let tx_ref = mv.tx_ref.or(entry.tx_ref);
        *entry = AttemptedMove {
            tx_ref,
            ..mv.clone()
        };
        Ok(())
    }

    async fn attempted_moves(&self, key: &GameKey) -> Result<Vec<AttemptedMove>> {
        Ok(self
            .moves
            .read()
            .await
            .values()
            .filter(|m| m.key == *key)
            .cloned()
            .collect())
    }

    async fn get_marker(&self, key: &GameKey, action: TxAction) -> Result<Option<TxMarker>> {
        Ok(self
            .markers
            .read()
            .await
            .get(&(*key, action.as_str()))
            .cloned())
    }

    async fn upsert_marker(&self, marker: &TxMarker) -> Result<()> {
        self.markers
            .write()
            .await
            .insert((marker.key, marker.action.as_str()), marker.clone());
        Ok(())
    }

    async fn delete_markers(&self, key: &GameKey) -> Result<u64> {
        let mut markers = self.markers.write().await;
        let before = markers.len();
        markers.retain(|(k, _), _| k != key);
        Ok((before - markers.len()) as u64)
    }

    async fn close(&self) {
        debug!("Memory store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MoveStatus, TxRef};
    use alloy::primitives::B256;

    fn key() -> GameKey {
        GameKey::new(1, Address::repeat_byte(0xaa), 9)
    }

    #[tokio::test]
    async fn test_attempted_move_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let tx = TxRef(B256::repeat_byte(1));
        let cell = Cell::new(3, 3);

        let mut mv = AttemptedMove::pending(key(), cell, 0, Some(tx));
        store.upsert_attempted_move(&mv).await.unwrap();
        store.upsert_attempted_move(&mv).await.unwrap();

        mv.status = MoveStatus::Collision;
        mv.tx_ref = None;
        store.upsert_attempted_move(&mv).await.unwrap();

        let moves = store.attempted_moves(&key()).await.unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].status, MoveStatus::Collision);
        // A missing reference on update keeps the stored one
        assert_eq!(moves[0].tx_ref, Some(tx));
    }

    #[tokio::test]
    async fn test_list_games_filters_inactive() {
        let store = MemoryStore::new();
        let now = chrono::Utc::now();
        let active = GameRecord::new(key(), true, now);
        let mut done = GameRecord::new(GameKey::new(1, Address::repeat_byte(0xaa), 10), true, now);
        done.set_status(crate::domain::GameStatus::Completed);
        store.upsert_game(&active).await.unwrap();
        store.upsert_game(&done).await.unwrap();

        let all = store.list_games(1, Address::repeat_byte(0xaa), false).await.unwrap();
        let live = store.list_games(1, Address::repeat_byte(0xaa), true).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].key.game_id, 9);
    }
}
