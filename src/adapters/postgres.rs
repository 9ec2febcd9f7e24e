use crate::domain::{
    AttemptedMove, Cell, GameKey, GamePhase, GameRecord, GameStatus, MarkerStatus, MoveStatus,
    TxAction, TxMarker, TxRef, Winner,
};
use crate::error::{AgentError, Result};
use crate::persistence::GameStore;
use alloy::primitives::Address;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }
}

fn corrupt(what: &str, e: impl std::fmt::Display) -> AgentError {
    AgentError::Internal(format!("Corrupt {} row: {}", what, e))
}

fn parse_key(row: &PgRow) -> Result<GameKey> {
    let chain_id: i64 = row.try_get("chain_id")?;
    let contract: String = row.try_get("contract_address")?;
    let game_id: i64 = row.try_get("game_id")?;
    let contract: Address = contract.parse().map_err(|e| corrupt("contract", e))?;
    Ok(GameKey::new(chain_id as u64, contract, game_id as u64))
}

fn parse_cell(x: Option<i16>, y: Option<i16>) -> Option<Cell> {
    match (x, y) {
        (Some(x), Some(y)) => Some(Cell::new(x as u8, y as u8)),
        _ => None,
    }
}

fn row_to_game(row: &PgRow) -> Result<GameRecord> {
    let phase: String = row.try_get("phase")?;
    let phase = GamePhase::from_parts(
        &phase,
        parse_cell(row.try_get("phase_x")?, row.try_get("phase_y")?),
        row.try_get("should_continue")?,
    )
    .map_err(|e| corrupt("game", e))?;
    let winner: String = row.try_get("winner")?;
    let status: String = row.try_get("status")?;
    let round: i32 = row.try_get("round")?;
    let retry_count: i32 = row.try_get("retry_count")?;

    Ok(GameRecord {
        key: parse_key(row)?,
        phase,
        round: round as u32,
        winner: Winner::try_from(winner.as_str()).map_err(|e| corrupt("game", e))?,
        status: GameStatus::try_from(status.as_str()).map_err(|e| corrupt("game", e))?,
        waiting_since: row.try_get("waiting_since")?,
        last_check_at: row.try_get("last_check_at")?,
        next_check_at: row.try_get("next_check_at")?,
        collision: row.try_get("collision")?,
        pending_move: parse_cell(row.try_get("pending_x")?, row.try_get("pending_y")?),
        last_error: row.try_get("last_error")?,
        retry_count: retry_count as u32,
        is_player1: row.try_get("is_player1")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_tx_ref(value: &str) -> Result<TxRef> {
    value.parse().map_err(|e| corrupt("tx reference", e))
}

#[async_trait]
impl GameStore for PostgresStore {
    #[instrument(skip(self, record), fields(game = %record.key, phase = %record.phase))]
    async fn upsert_game(&self, record: &GameRecord) -> Result<()> {
        let phase_cell = record.phase.cell();
        sqlx::query(
            r#"
            INSERT INTO games (
                chain_id, contract_address, game_id, phase, phase_x, phase_y,
                should_continue, round, winner, status, waiting_since, last_check_at,
                next_check_at, collision, pending_x, pending_y, last_error, retry_count,
                is_player1, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, NOW())
            ON CONFLICT (chain_id, contract_address, game_id) DO UPDATE SET
                phase = EXCLUDED.phase,
                phase_x = EXCLUDED.phase_x,
                phase_y = EXCLUDED.phase_y,
                should_continue = EXCLUDED.should_continue,
                round = GREATEST(games.round, EXCLUDED.round),
                winner = EXCLUDED.winner,
                status = EXCLUDED.status,
                waiting_since = EXCLUDED.waiting_since,
                last_check_at = EXCLUDED.last_check_at,
                next_check_at = EXCLUDED.next_check_at,
                collision = EXCLUDED.collision,
                pending_x = EXCLUDED.pending_x,
                pending_y = EXCLUDED.pending_y,
                last_error = EXCLUDED.last_error,
                retry_count = EXCLUDED.retry_count,
                is_player1 = EXCLUDED.is_player1,
                updated_at = NOW()
            "#,
        )
        .bind(record.key.chain_id as i64)
        .bind(record.key.contract_hex())
        .bind(record.key.game_id as i64)
        .bind(record.phase.as_str())
        .bind(phase_cell.map(|c| c.x as i16))
        .bind(phase_cell.map(|c| c.y as i16))
        .bind(record.phase.should_continue())
        .bind(record.round as i32)
        .bind(record.winner.as_str())
        .bind(record.status.as_str())
        .bind(record.waiting_since)
        .bind(record.last_check_at)
        .bind(record.next_check_at)
        .bind(record.collision)
        .bind(record.pending_move.map(|c| c.x as i16))
        .bind(record.pending_move.map(|c| c.y as i16))
        .bind(&record.last_error)
        .bind(record.retry_count as i32)
        .bind(record.is_player1)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        debug!("Saved game record");
        Ok(())
    }

    async fn get_game(&self, key: &GameKey) -> Result<Option<GameRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM games
            WHERE chain_id = $1 AND contract_address = $2 AND game_id = $3
            "#,
        )
        .bind(key.chain_id as i64)
        .bind(key.contract_hex())
        .bind(key.game_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_game).transpose()
    }

    async fn list_games(
        &self,
        chain_id: u64,
        contract: Address,
        active_only: bool,
    ) -> Result<Vec<GameRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM games
            WHERE chain_id = $1 AND contract_address = $2
              AND ($3 = FALSE OR status = 'ACTIVE')
            ORDER BY game_id
            "#,
        )
        .bind(chain_id as i64)
        .bind(format!("{:#x}", contract))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_game).collect()
    }

    #[instrument(skip(self, mv), fields(game = %mv.key, cell = %mv.cell, round = mv.round))]
    async fn upsert_attempted_move(&self, mv: &AttemptedMove) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO attempted_moves (
                chain_id, contract_address, game_id, x, y, round, status, tx_ref, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (chain_id, contract_address, game_id, x, y, round) DO UPDATE SET
                status = EXCLUDED.status,
                tx_ref = COALESCE(EXCLUDED.tx_ref, attempted_moves.tx_ref),
                updated_at = NOW()
            "#,
        )
        .bind(mv.key.chain_id as i64)
        .bind(mv.key.contract_hex())
        .bind(mv.key.game_id as i64)
        .bind(mv.cell.x as i16)
        .bind(mv.cell.y as i16)
        .bind(mv.round as i32)
        .bind(mv.status.as_str())
        .bind(mv.tx_ref.map(|t| t.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn attempted_moves(&self, key: &GameKey) -> Result<Vec<AttemptedMove>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM attempted_moves
            WHERE chain_id = $1 AND contract_address = $2 AND game_id = $3
            ORDER BY round, x, y
            "#,
        )
        .bind(key.chain_id as i64)
        .bind(key.contract_hex())
        .bind(key.game_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let tx_ref: Option<String> = row.try_get("tx_ref")?;
                let round: i32 = row.try_get("round")?;
                Ok(AttemptedMove {
                    key: *key,
                    cell: Cell::new(row.try_get::<i16, _>("x")? as u8, row.try_get::<i16, _>("y")? as u8),
                    round: round as u32,
                    status: MoveStatus::try_from(status.as_str())
                        .map_err(|e| corrupt("attempted move", e))?,
                    tx_ref: tx_ref.as_deref().map(parse_tx_ref).transpose()?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn get_marker(&self, key: &GameKey, action: TxAction) -> Result<Option<TxMarker>> {
        let row = sqlx::query(
            r#"
            SELECT tx_ref, status, block_number, params_hash, created_at, updated_at
            FROM tx_markers
            WHERE chain_id = $1 AND contract_address = $2 AND game_id = $3 AND action = $4
            "#,
        )
        .bind(key.chain_id as i64)
        .bind(key.contract_hex())
        .bind(key.game_id as i64)
        .bind(action.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let tx_ref: String = row.try_get("tx_ref")?;
        let status: String = row.try_get("status")?;
        let block: Option<i64> = row.try_get("block_number")?;
        Ok(Some(TxMarker {
            key: *key,
            action,
            tx_ref: parse_tx_ref(&tx_ref)?,
            status: MarkerStatus::try_from(status.as_str()).map_err(|e| corrupt("marker", e))?,
            block: block.map(|b| b as u64),
            params_hash: row.try_get("params_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    #[instrument(skip(self, marker), fields(game = %marker.key, action = %marker.action, status = %marker.status))]
    async fn upsert_marker(&self, marker: &TxMarker) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tx_markers (
                chain_id, contract_address, game_id, action, tx_ref, status,
                block_number, params_hash, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (chain_id, contract_address, game_id, action) DO UPDATE SET
                tx_ref = EXCLUDED.tx_ref,
                status = EXCLUDED.status,
                block_number = EXCLUDED.block_number,
                params_hash = EXCLUDED.params_hash,
                created_at = EXCLUDED.created_at,
                updated_at = NOW()
            "#,
        )
        .bind(marker.key.chain_id as i64)
        .bind(marker.key.contract_hex())
        .bind(marker.key.game_id as i64)
        .bind(marker.action.as_str())
        .bind(marker.tx_ref.to_string())
        .bind(marker.status.as_str())
        .bind(marker.block.map(|b| b as i64))
        .bind(&marker.params_hash)
        .bind(marker.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_markers(&self, key: &GameKey) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM tx_markers
            WHERE chain_id = $1 AND contract_address = $2 AND game_id = $3
            "#,
        )
        .bind(key.chain_id as i64)
        .bind(key.contract_hex())
        .bind(key.game_id as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }
}
