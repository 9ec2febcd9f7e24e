//! Per-game phase state machine
//!
//! One `step` reads the game at a single block, decides what the game needs
//! next in a fixed priority order and performs at most one guarded ledger
//! action:
//!
//! ```text
//! Idle ──► WaitingForOpponent ──► SelectingMove ──► SubmittingMove ──► FinalizingMove
//!                                      ▲  ▲                                  │
//!                     collision / draw │  │ invalid                          ▼
//!                                      │  └──────────────────── WaitingForOpponentMove
//!                                      │                                     │
//!                               FinalizingGameState ◄────────────────────────┘
//!                                      │ winner
//!                                      ▼
//!                               RevealingBoard ──► GameComplete
//! ```
//!
//! Every mutating call goes through the [`TxMarkerManager`], so a step that
//! is repeated after a crash or on stale facts waits for the earlier
//! submission instead of sending a second one.

use alloy::primitives::U256;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::move_selector::MoveSelector;
use crate::chain::{observe_game, DecryptionOracle, InputEncryptor, Ledger};
use crate::domain::{
    params_hash, AttemptedMove, Cell, Decryption, GameFacts, GamePhase, GameRecord, GameStatus,
    Handle, LedgerCall, MoveStatus, RoundHandles, Seat, TxAction, Winner,
};
use crate::error::{AgentError, OracleError, OracleErrorKind, Result};
use crate::persistence::{GameStore, MarkerDecision, TxMarkerManager};

/// What the ledger facts ask for, in decision priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Winner or cancellation already recorded
    Settled,
    /// Seat 2 still empty
    AwaitOpponent,
    /// Both moves made, round result still encrypted
    FinalizeGameState(RoundHandles),
    /// Local move submitted, its validity still encrypted
    FinalizeMove(Handle),
    /// Opponent missed the move deadline
    ClaimTimeout,
    AwaitOpponentMove,
    /// Local player has no move this round; eligibility still to be checked
    SelectIfEligible,
}

/// Pure priority evaluation over one snapshot.
pub fn decide(facts: &GameFacts, seat: Seat, now_secs: u64, fallback_timeout_secs: u64) -> Decision {
    if facts.is_settled() {
        return Decision::Settled;
    }
    if facts.player2.is_none() {
        return Decision::AwaitOpponent;
    }

    let mine = facts.moves_of(seat);
    let theirs = facts.moves_of(seat.opponent());

    if mine.is_made && theirs.is_made {
        if let Some(handles) = facts.round_handles {
            return Decision::FinalizeGameState(handles);
        }
    }
    if mine.is_submitted && !mine.is_made {
        if let Some(validity) = mine.validity {
            return Decision::FinalizeMove(validity);
        }
    }
    if mine.is_made && !theirs.is_made {
        if now_secs > facts.move_deadline(fallback_timeout_secs) {
            return Decision::ClaimTimeout;
        }
        return Decision::AwaitOpponentMove;
    }
    if !mine.is_submitted && !mine.is_made {
        return Decision::SelectIfEligible;
    }
    Decision::AwaitOpponentMove
}

/// Collaborators shared by every step, built once at startup.
#[derive(Clone)]
pub struct Services {
    pub ledger: Arc<dyn Ledger>,
    pub oracle: Arc<dyn DecryptionOracle>,
    pub encryptor: Arc<dyn InputEncryptor>,
    pub store: Arc<dyn GameStore>,
    pub markers: Arc<TxMarkerManager>,
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Deadline window used when the game stores none
    pub default_move_timeout_secs: u64,
    /// Cancel an unjoined game created by us after this long
    pub opponent_wait_timeout: Option<Duration>,
    /// Consecutive transient failures before the phase becomes `Error`
    pub max_transient_retries: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            default_move_timeout_secs: 600,
            opponent_wait_timeout: None,
            max_transient_retries: 3,
        }
    }
}

/// Result of one step
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub record: GameRecord,
    /// A submission is in flight; revisit on the confirmation interval
    pub awaiting: bool,
}

enum Flow {
    Done { awaiting: bool },
    /// A marker confirmed after the observed block; facts are stale
    Reread,
}

impl Flow {
    fn idle() -> Self {
        Flow::Done { awaiting: false }
    }

    fn awaiting() -> Self {
        Flow::Done { awaiting: true }
    }
}

fn malformed(message: impl Into<String>) -> AgentError {
    OracleError::new(OracleErrorKind::Malformed, message).into()
}

fn clear_u8(decryption: &Decryption, handle: &Handle) -> Result<u8> {
    let value: U256 = decryption
        .value(handle)
        .ok_or_else(|| malformed(format!("no clear value for {:#x}", handle)))?;
    u8::try_from(value).map_err(|_| malformed(format!("value {} out of range", value)))
}

fn clear_flag(decryption: &Decryption, handle: &Handle) -> Result<bool> {
    decryption
        .flag(handle)
        .ok_or_else(|| malformed(format!("no clear value for {:#x}", handle)))
}

pub struct PhaseMachine {
    services: Services,
    selector: Arc<dyn MoveSelector>,
    config: MachineConfig,
}

impl PhaseMachine {
    pub fn new(services: Services, selector: Arc<dyn MoveSelector>, config: MachineConfig) -> Self {
        Self {
            services,
            selector,
            config,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Advance one game by one step. Never fails: errors are folded into the
    /// returned record.
    #[instrument(skip(self, record, waited), fields(game = %record.key, phase = %record.phase))]
    pub async fn step(&self, record: GameRecord, waited: Option<Duration>) -> StepOutcome {
        let before = record.clone();
        let mut working = record;
        let now = Utc::now();
        working.last_check_at = Some(now);
        working.last_error = None;

        match self.advance(&mut working, waited).await {
            Ok(awaiting) => {
                working.retry_count = 0;
                working.updated_at = Utc::now();
                if working.phase != before.phase {
                    info!("{} -> {}", before.phase, working.phase);
                }
                StepOutcome {
                    record: working,
                    awaiting,
                }
            }
            Err(e) => StepOutcome {
                record: self.fail(before, &working, e),
                awaiting: false,
            },
        }
    }

    /// Keep the previous record, except for the error bookkeeping and a
    /// chosen-but-unresolved move.
    fn fail(&self, before: GameRecord, working: &GameRecord, err: AgentError) -> GameRecord {
        let now = Utc::now();
        let mut record = before;
        record.pending_move = working.pending_move;
        record.last_check_at = working.last_check_at;
        record.last_error = Some(err.to_string());
        record.updated_at = now;

        match &err {
            AgentError::NotParticipant { .. } => {
                warn!("{}: giving up on game", err);
                record.phase = GamePhase::Error {
                    should_continue: false,
                };
                record.set_status(GameStatus::Abandoned);
            }
            e => {
                record.retry_count += 1;
                if !e.is_retryable() || record.retry_count >= self.config.max_transient_retries {
                    warn!(
                        "Step failed (attempt {}), entering error phase: {}",
                        record.retry_count, err
                    );
                    record.phase = GamePhase::Error {
                        should_continue: true,
                    };
                } else {
                    debug!("Transient failure (attempt {}): {}", record.retry_count, err);
                }
            }
        }
        record
    }

    async fn advance(&self, record: &mut GameRecord, waited: Option<Duration>) -> Result<bool> {
        let ledger = self.services.ledger.as_ref();
        let mut rereads = 0;
        loop {
            let facts = observe_game(ledger, record.key.game_id).await?;
            match self.apply(record, &facts, waited).await? {
                Flow::Done { awaiting } => return Ok(awaiting),
                Flow::Reread if rereads == 0 => {
                    debug!("Action confirmed after block {}, re-reading", facts.block);
                    rereads += 1;
                }
                Flow::Reread => return Ok(true),
            }
        }
    }

    async fn apply(
        &self,
        record: &mut GameRecord,
        facts: &GameFacts,
        waited: Option<Duration>,
    ) -> Result<Flow> {
        let me = self.services.ledger.local_address();
        let Some(seat) = facts.seat_of(me) else {
            return self.join(record, facts).await;
        };
        record.is_player1 = seat == Seat::Player1;
        record.advance_round_to(facts.round);

        let now_secs = Utc::now().timestamp().max(0) as u64;
        match decide(facts, seat, now_secs, self.config.default_move_timeout_secs) {
            Decision::Settled => self.settle(record, facts).await,
            Decision::AwaitOpponent => self.await_opponent(record, facts, seat, waited).await,
            Decision::FinalizeGameState(handles) => {
                self.finalize_game_state(record, facts, handles).await
            }
            Decision::FinalizeMove(validity) => self.finalize_move(record, facts, validity).await,
            Decision::ClaimTimeout => Ok(self.claim_timeout(record, facts).await),
            Decision::AwaitOpponentMove => {
                self.enter(record, GamePhase::WaitingForOpponentMove);
                Ok(Flow::idle())
            }
            Decision::SelectIfEligible => self.select_move(record, facts).await,
        }
    }

    fn enter(&self, record: &mut GameRecord, phase: GamePhase) {
        record.phase = phase;
    }

    async fn begin(
        &self,
        record: &GameRecord,
        action: TxAction,
        params: &str,
        facts: &GameFacts,
    ) -> Result<MarkerDecision> {
        self.services
            .markers
            .begin(&record.key, action, params, facts.block)
            .await
    }

    /// Consult the marker before entering `target`. Returns `None` when the
    /// record is already in `target` and the action may run now.
    async fn guarded_entry(
        &self,
        record: &mut GameRecord,
        target: GamePhase,
        action: TxAction,
        params: &str,
        facts: &GameFacts,
    ) -> Result<Option<Flow>> {
        match self.begin(record, action, params, facts).await? {
            MarkerDecision::Wait => Ok(Some(Flow::awaiting())),
            MarkerDecision::Confirmed(_) => Ok(Some(Flow::Reread)),
            MarkerDecision::Proceed if record.phase == target => Ok(None),
            MarkerDecision::Proceed => {
                self.enter(record, target);
                Ok(Some(Flow::idle()))
            }
        }
    }

    /// Join an open game the local player is not seated in yet.
    async fn join(&self, record: &mut GameRecord, facts: &GameFacts) -> Result<Flow> {
        let joinable = facts.player2.is_none()
            && !facts.is_settled()
            && matches!(
                record.phase,
                GamePhase::Idle
                    | GamePhase::Error {
                        should_continue: true
                    }
            );
        if !joinable {
            return Err(AgentError::NotParticipant {
                game_id: facts.game_id,
                address: format!("{:#x}", self.services.ledger.local_address()),
            });
        }

        self.enter(record, GamePhase::Idle);
        let params = params_hash([facts.game_id.to_be_bytes()]);
        match self.begin(record, TxAction::JoinGame, &params, facts).await? {
            MarkerDecision::Wait => Ok(Flow::awaiting()),
            MarkerDecision::Confirmed(_) => Ok(Flow::Reread),
            MarkerDecision::Proceed => {
                let call = LedgerCall::JoinGame {
                    game_id: facts.game_id,
                };
                self.services.markers.submit(&record.key, &params, call).await?;
                Ok(Flow::awaiting())
            }
        }
    }

    async fn settle(&self, record: &mut GameRecord, facts: &GameFacts) -> Result<Flow> {
        record.winner = facts.outcome();
        if facts.cancelled || facts.board_revealed || facts.board.is_empty() {
            self.enter(record, GamePhase::GameComplete);
            let status = if facts.cancelled {
                GameStatus::Abandoned
            } else {
                GameStatus::Completed
            };
            record.set_status(status);
            record.pending_move = None;
            self.services.markers.release_all(&record.key).await?;
            info!("Game finished: {}", record.winner);
            return Ok(Flow::idle());
        }

        let params = params_hash(facts.board.iter().map(|h| h.0));
        if let Some(flow) = self
            .guarded_entry(
                record,
                GamePhase::RevealingBoard,
                TxAction::RevealBoard,
                &params,
                facts,
            )
            .await?
        {
            return Ok(flow);
        }

        let decryption = self
            .services
            .oracle
            .decrypt(self.services.ledger.contract(), &facts.board)
            .await?;
        let board = facts
            .board
            .iter()
            .map(|h| clear_u8(&decryption, h))
            .collect::<Result<Vec<u8>>>()?;
        let call = LedgerCall::RevealBoard {
            game_id: facts.game_id,
            board,
            proof: decryption.proof,
        };
        self.services.markers.submit(&record.key, &params, call).await?;
        Ok(Flow::awaiting())
    }

    async fn await_opponent(
        &self,
        record: &mut GameRecord,
        facts: &GameFacts,
        seat: Seat,
        waited: Option<Duration>,
    ) -> Result<Flow> {
        let already_waiting = record.phase == GamePhase::WaitingForOpponent;
        self.enter(record, GamePhase::WaitingForOpponent);

        let expired = match (self.config.opponent_wait_timeout, waited) {
            (Some(limit), Some(waited)) => waited >= limit,
            _ => false,
        };
        if !already_waiting || seat != Seat::Player1 || !expired {
            return Ok(Flow::idle());
        }

        let params = params_hash([facts.game_id.to_be_bytes()]);
        match self.begin(record, TxAction::CancelGame, &params, facts).await? {
            MarkerDecision::Wait => Ok(Flow::awaiting()),
            MarkerDecision::Confirmed(_) => Ok(Flow::Reread),
            MarkerDecision::Proceed => {
                info!("No opponent after {:?}, cancelling", waited.unwrap_or_default());
                let call = LedgerCall::CancelGame {
                    game_id: facts.game_id,
                };
                self.services.markers.submit(&record.key, &params, call).await?;
                Ok(Flow::awaiting())
            }
        }
    }

    async fn finalize_game_state(
        &self,
        record: &mut GameRecord,
        facts: &GameFacts,
        handles: RoundHandles,
    ) -> Result<Flow> {
        let params = params_hash([
            facts.round.to_be_bytes().to_vec(),
            handles.winner.to_vec(),
            handles.collision.to_vec(),
        ]);
        if let Some(flow) = self
            .guarded_entry(
                record,
                GamePhase::FinalizingGameState,
                TxAction::FinalizeGameState,
                &params,
                facts,
            )
            .await?
        {
            return Ok(flow);
        }

        let decryption = self
            .services
            .oracle
            .decrypt(
                self.services.ledger.contract(),
                &[handles.winner, handles.collision],
            )
            .await?;
        let winner = Winner::from_code(clear_u8(&decryption, &handles.winner)?);
        let collision = clear_flag(&decryption, &handles.collision)?;

        let call = LedgerCall::FinalizeGameState {
            game_id: facts.game_id,
            winner,
            collision,
            proof: decryption.proof,
        };
        self.services.markers.submit(&record.key, &params, call).await?;

        if collision {
            info!("Round {} collided", facts.round);
            self.mark_round(record, facts.round, MoveStatus::Collision)
                .await?;
            record.collision = true;
            record.pending_move = None;
            self.enter(record, GamePhase::SelectingMove);
        } else if winner.is_decided() {
            info!("Round {} decided: {}", facts.round, winner);
            record.winner = winner;
            record.collision = false;
            record.advance_round_to(facts.round + 1);
            self.enter(record, GamePhase::RevealingBoard);
        } else {
            record.collision = false;
            record.advance_round_to(facts.round + 1);
            self.enter(record, GamePhase::SelectingMove);
        }
        Ok(Flow::awaiting())
    }

    /// Move every still-live attempt of `round` to `status`.
    async fn mark_round(&self, record: &GameRecord, round: u32, status: MoveStatus) -> Result<()> {
        let store = &self.services.store;
        for mut mv in store.attempted_moves(&record.key).await? {
            if mv.round == round && mv.status != MoveStatus::Invalid && mv.status != status {
                mv.status = status;
                mv.updated_at = Utc::now();
                store.upsert_attempted_move(&mv).await?;
            }
        }
        Ok(())
    }

    async fn finalize_move(
        &self,
        record: &mut GameRecord,
        facts: &GameFacts,
        validity: Handle,
    ) -> Result<Flow> {
        let params = params_hash([facts.round.to_be_bytes().to_vec(), validity.to_vec()]);
        let cell = match record.phase.cell().or(record.pending_move) {
            Some(cell) => Some(cell),
            None => self.pending_attempt(record, facts.round).await?,
        };

        if record.phase.cell().is_none() {
            if let Some(cell) = cell {
                if let Some(flow) = self
                    .guarded_entry(
                        record,
                        GamePhase::FinalizingMove { cell },
                        TxAction::FinalizeMove,
                        &params,
                        facts,
                    )
                    .await?
                {
                    return Ok(flow);
                }
            }
        }

        // Outcome already applied or cell unknown: only the marker decides
        match self
            .begin(record, TxAction::FinalizeMove, &params, facts)
            .await?
        {
            MarkerDecision::Wait => return Ok(Flow::awaiting()),
            MarkerDecision::Confirmed(_) => return Ok(Flow::Reread),
            MarkerDecision::Proceed => {}
        }

        let me = self.services.ledger.local_address();
        let decryption = self
            .services
            .oracle
            .decrypt(self.services.ledger.contract(), &[validity])
            .await?;
        let is_invalid = clear_flag(&decryption, &validity)?;

        let call = LedgerCall::FinalizeMove {
            game_id: facts.game_id,
            player: me,
            is_invalid,
            proof: decryption.proof,
        };
        self.services.markers.submit(&record.key, &params, call).await?;

        let status = if is_invalid {
            MoveStatus::Invalid
        } else {
            MoveStatus::Confirmed
        };
        if let Some(cell) = cell {
            self.services
                .store
                .upsert_attempted_move(&AttemptedMove {
                    status,
                    ..AttemptedMove::pending(record.key, cell, facts.round, None)
                })
                .await?;
        }
        record.pending_move = None;

        if is_invalid {
            let at = cell.map(|c| c.to_string()).unwrap_or_else(|| "?".into());
            warn!("Move {} in round {} was invalid", at, facts.round);
            record.last_error = Some(format!(
                "Move {} in round {} was invalid; choosing another cell",
                at, facts.round
            ));
            self.enter(record, GamePhase::SelectingMove);
        } else {
            self.enter(record, GamePhase::WaitingForOpponentMove);
        }
        Ok(Flow::awaiting())
    }

    /// Any failure here falls back to waiting for the opponent.
    async fn claim_timeout(&self, record: &mut GameRecord, facts: &GameFacts) -> Flow {
        let flow = match self.try_claim_timeout(record, facts).await {
            Ok(flow) => flow,
            Err(e) => {
                warn!("Timeout claim failed, waiting instead: {}", e);
                Flow::idle()
            }
        };
        self.enter(record, GamePhase::WaitingForOpponentMove);
        flow
    }

    async fn try_claim_timeout(&self, record: &GameRecord, facts: &GameFacts) -> Result<Flow> {
        let params = params_hash([facts.game_id.to_be_bytes(), u64::from(facts.round).to_be_bytes()]);
        match self
            .begin(record, TxAction::ClaimTimeout, &params, facts)
            .await?
        {
            MarkerDecision::Wait => Ok(Flow::awaiting()),
            MarkerDecision::Confirmed(_) => Ok(Flow::Reread),
            MarkerDecision::Proceed => {
                info!(
                    "Opponent missed the deadline ({}), claiming timeout",
                    facts.move_deadline(self.config.default_move_timeout_secs)
                );
                let call = LedgerCall::ClaimTimeout {
                    game_id: facts.game_id,
                };
                self.services.markers.submit(&record.key, &params, call).await?;
                Ok(Flow::awaiting())
            }
        }
    }

    async fn select_move(&self, record: &mut GameRecord, facts: &GameFacts) -> Result<Flow> {
        let ledger = &self.services.ledger;
        let me = ledger.local_address();
        if !ledger
            .can_submit_move(facts.game_id, me, facts.block)
            .await?
        {
            self.enter(record, GamePhase::WaitingForOpponentMove);
            return Ok(Flow::idle());
        }

        let selecting = matches!(
            record.phase,
            GamePhase::SelectingMove | GamePhase::SubmittingMove { .. }
        );
        if record.pending_move.is_none() && !selecting {
            self.enter(record, GamePhase::SelectingMove);
            return Ok(Flow::idle());
        }

        let cell = match record.pending_move {
            Some(cell) => cell,
            None => match self.pending_attempt(record, facts.round).await? {
                Some(cell) => {
                    debug!("Resuming unresolved move {} for round {}", cell, facts.round);
                    cell
                }
                None => self.choose_cell(record, facts).await?,
            },
        };
        let params = params_hash([
            facts.round.to_be_bytes().to_vec(),
            vec![cell.x, cell.y],
        ]);

        match self
            .begin(record, TxAction::SubmitMove, &params, facts)
            .await?
        {
            MarkerDecision::Wait => {
                // The in-flight submission may carry another cell
                if !self.marker_matches(record, TxAction::SubmitMove, &params).await? {
                    warn!(
                        "Another move for round {} is still pending; not attaching {}",
                        facts.round, cell
                    );
                    return Ok(Flow::awaiting());
                }
                record.pending_move = Some(cell);
                self.enter(record, GamePhase::FinalizingMove { cell });
                return Ok(Flow::awaiting());
            }
            MarkerDecision::Confirmed(_) => return Ok(Flow::Reread),
            MarkerDecision::Proceed => {}
        }

        // The chosen cell is durable before anything leaves the process
        record.pending_move = Some(cell);
        record.updated_at = Utc::now();
        self.enter(record, GamePhase::SubmittingMove { cell });
        self.services.store.upsert_game(record).await?;
        self.services
            .store
            .upsert_attempted_move(&AttemptedMove::pending(record.key, cell, facts.round, None))
            .await?;

        let encrypted = self
            .services
            .encryptor
            .encrypt_move(ledger.contract(), me, cell)
            .await?;
        let call = LedgerCall::SubmitMove {
            game_id: facts.game_id,
            cell,
            encrypted,
        };
        let tx = self.services.markers.submit(&record.key, &params, call).await?;
        self.services
            .store
            .upsert_attempted_move(&AttemptedMove::pending(
                record.key,
                cell,
                facts.round,
                Some(tx),
            ))
            .await?;

        info!("Submitted move {} for round {}", cell, facts.round);
        self.enter(record, GamePhase::FinalizingMove { cell });
        Ok(Flow::awaiting())
    }

    /// Cell of an attempt in `round` whose outcome is still unknown.
    async fn pending_attempt(&self, record: &GameRecord, round: u32) -> Result<Option<Cell>> {
        Ok(self
            .services
            .store
            .attempted_moves(&record.key)
            .await?
            .into_iter()
            .find(|m| m.round == round && m.status == MoveStatus::Pending)
            .map(|m| m.cell))
    }

    async fn marker_matches(&self, record: &GameRecord, action: TxAction, params: &str) -> Result<bool> {
        let marker = self.services.markers.marker(&record.key, action).await?;
        Ok(marker.and_then(|m| m.params_hash).as_deref() == Some(params))
    }

    async fn choose_cell(&self, record: &GameRecord, facts: &GameFacts) -> Result<Cell> {
        let blocked: HashSet<Cell> = self
            .services
            .store
            .attempted_moves(&record.key)
            .await?
            .into_iter()
            .filter(|m| m.blocks_cell())
            .map(|m| m.cell)
            .collect();
        self.selector
            .choose(facts.board_size, &blocked)
            .ok_or_else(|| {
                AgentError::InvalidState(format!(
                    "No free cell left on a {}x{} board",
                    facts.board_size, facts.board_size
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockDecryptionOracle;
    use crate::config::MarkerConfig;
    use crate::domain::{GameKey, MoveFacts, TxRef, TxStatus};
    use crate::persistence::MemoryStore;
    use crate::testing::{handle, open_game, FakeEncryptor, FakeLedger, CHAIN_ID, CONTRACT, LOCAL, OPPONENT};
    use alloy::primitives::{Address, Bytes};
    use std::collections::HashMap;

    /// Always picks the first listed cell that is still free
    struct FixedSelector(Vec<Cell>);

    impl MoveSelector for FixedSelector {
        fn choose(&self, _board_size: u8, blocked: &HashSet<Cell>) -> Option<Cell> {
            self.0.iter().copied().find(|c| !blocked.contains(c))
        }
    }

    /// Oracle answering from a fixed table
    fn oracle_with(values: Vec<(Handle, u64)>) -> MockDecryptionOracle {
        let table: HashMap<Handle, U256> =
            values.into_iter().map(|(h, v)| (h, U256::from(v))).collect();
        let mut oracle = MockDecryptionOracle::new();
        oracle.expect_decrypt().returning(move |_, handles: &[Handle]| {
            Ok(Decryption {
                values: handles
                    .iter()
                    .filter_map(|h| table.get(h).map(|v| (*h, *v)))
                    .collect(),
                proof: Bytes::from_static(b"proof"),
            })
        });
        oracle
    }

    struct Harness {
        machine: PhaseMachine,
        ledger: Arc<FakeLedger>,
        store: Arc<MemoryStore>,
    }

    fn harness(oracle: MockDecryptionOracle, config: MachineConfig) -> Harness {
        let ledger = Arc::new(FakeLedger::default());
        let store = Arc::new(MemoryStore::new());
        let markers = Arc::new(TxMarkerManager::new(
            store.clone(),
            ledger.clone(),
            MarkerConfig::default(),
        ));
        let services = Services {
            ledger: ledger.clone(),
            oracle: Arc::new(oracle),
            encryptor: Arc::new(FakeEncryptor),
            store: store.clone(),
            markers,
        };
        let selector = Arc::new(FixedSelector(vec![
            Cell::new(3, 3),
            Cell::new(1, 1),
            Cell::new(0, 4),
        ]));
        Harness {
            machine: PhaseMachine::new(services, selector, config),
            ledger,
            store,
        }
    }

    fn key() -> GameKey {
        GameKey::new(CHAIN_ID, CONTRACT, 1)
    }

    fn record(phase: GamePhase) -> GameRecord {
        let mut r = GameRecord::new(key(), true, Utc::now());
        r.phase = phase;
        r
    }

    fn running_game() -> GameFacts {
        let mut g = open_game(1, LOCAL);
        g.player2 = Some(OPPONENT);
        g.last_action_at = Utc::now().timestamp() as u64;
        g
    }

    fn made() -> MoveFacts {
        MoveFacts {
            is_submitted: true,
            is_made: true,
            validity: None,
        }
    }

    #[test]
    fn test_decide_priorities() {
        let now = Utc::now().timestamp() as u64;
        let mut g = running_game();
        assert_eq!(decide(&g, Seat::Player1, now, 600), Decision::SelectIfEligible);

        g.moves = [made(), MoveFacts::default()];
        assert_eq!(decide(&g, Seat::Player1, now, 600), Decision::AwaitOpponentMove);

        // Deadline passed: claim beats waiting
        g.last_action_at = now - 601;
        assert_eq!(decide(&g, Seat::Player1, now, 600), Decision::ClaimTimeout);

        let handles = RoundHandles {
            winner: handle(1),
            collision: handle(2),
        };
        g.moves = [made(), made()];
        g.round_handles = Some(handles);
        assert_eq!(
            decide(&g, Seat::Player1, now, 600),
            Decision::FinalizeGameState(handles)
        );

        g.winner = Winner::Player2;
        assert_eq!(decide(&g, Seat::Player1, now, 600), Decision::Settled);

        let lonely = open_game(2, LOCAL);
        assert_eq!(decide(&lonely, Seat::Player1, now, 600), Decision::AwaitOpponent);
    }

    #[test]
    fn test_decide_both_made_never_selects() {
        let now = Utc::now().timestamp() as u64;
        let mut g = running_game();
        g.moves = [made(), made()];
        g.round_handles = Some(RoundHandles {
            winner: handle(1),
            collision: handle(2),
        });
        g.last_action_at = 0;
        for seat in [Seat::Player1, Seat::Player2] {
            assert!(matches!(
                decide(&g, seat, now, 600),
                Decision::FinalizeGameState(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_start_join_select_sequence() {
        let h = harness(MockDecryptionOracle::new(), MachineConfig::default());
        h.ledger.put_game(open_game(1, LOCAL));
        let mut phases = vec![];

        let mut rec = GameRecord::new(key(), true, Utc::now());
        phases.push(rec.phase);
        rec = h.machine.step(rec, None).await.record;
        phases.push(rec.phase);

        h.ledger.update_game(1, |g| g.player2 = Some(OPPONENT));
        rec = h.machine.step(rec, None).await.record;
        phases.push(rec.phase);

        assert_eq!(
            phases,
            vec![
                GamePhase::Idle,
                GamePhase::WaitingForOpponent,
                GamePhase::SelectingMove
            ]
        );
        assert!(h.ledger.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_selecting_submits_and_waits_without_resubmitting() {
        let h = harness(MockDecryptionOracle::new(), MachineConfig::default());
        h.ledger.put_game(running_game());

        let out = h.machine.step(record(GamePhase::SelectingMove), None).await;
        let cell = Cell::new(3, 3);
        assert_eq!(out.record.phase, GamePhase::FinalizingMove { cell });
        assert_eq!(out.record.pending_move, Some(cell));
        assert!(out.awaiting);

        // Submission not mined yet: the facts still invite a move
        let again = h.machine.step(out.record, None).await;
        assert_eq!(again.record.phase, GamePhase::FinalizingMove { cell });
        assert_eq!(h.ledger.broadcasts().len(), 1);

        let attempts = h.store.attempted_moves(&key()).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, MoveStatus::Pending);
    }

    #[tokio::test]
    async fn test_ineligible_seat_waits_instead_of_selecting() {
        let h = harness(MockDecryptionOracle::new(), MachineConfig::default());
        h.ledger.put_game(running_game());
        h.ledger.set_can_submit(false);

        let out = h.machine.step(record(GamePhase::SelectingMove), None).await;
        assert_eq!(out.record.phase, GamePhase::WaitingForOpponentMove);
        assert_eq!(out.record.pending_move, None);
        assert!(h.ledger.broadcasts().is_empty());
    }

    /// Put a `SubmitMove` for `cell` in flight without touching the record
    async fn submit_behind_record(h: &Harness, cell: Cell) {
        let params = params_hash([0u32.to_be_bytes().to_vec(), vec![cell.x, cell.y]]);
        let encrypted = FakeEncryptor
            .encrypt_move(CONTRACT, LOCAL, cell)
            .await
            .unwrap();
        h.machine
            .services()
            .markers
            .submit(
                &key(),
                &params,
                LedgerCall::SubmitMove {
                    game_id: 1,
                    cell,
                    encrypted,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_submission_for_other_cell_is_not_attached() {
        let h = harness(MockDecryptionOracle::new(), MachineConfig::default());
        h.ledger.put_game(running_game());
        submit_behind_record(&h, Cell::new(1, 1)).await;

        // The selector would pick (3,3); the in-flight tx carries (1,1)
        let out = h.machine.step(record(GamePhase::SelectingMove), None).await;
        assert_eq!(out.record.phase, GamePhase::SelectingMove);
        assert_eq!(out.record.pending_move, None);
        assert!(out.awaiting);
        assert_eq!(h.ledger.broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_attempt_is_resumed_instead_of_reselecting() {
        let h = harness(MockDecryptionOracle::new(), MachineConfig::default());
        h.ledger.put_game(running_game());
        let sent = Cell::new(1, 1);
        submit_behind_record(&h, sent).await;
        h.store
            .upsert_attempted_move(&AttemptedMove::pending(key(), sent, 0, None))
            .await
            .unwrap();

        let out = h.machine.step(record(GamePhase::SelectingMove), None).await;
        assert_eq!(out.record.phase, GamePhase::FinalizingMove { cell: sent });
        assert_eq!(out.record.pending_move, Some(sent));
        assert_eq!(h.ledger.broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_move_returns_to_selecting() {
        let validity = handle(50);
        let h = harness(oracle_with(vec![(validity, 1)]), MachineConfig::default());
        let cell = Cell::new(1, 1);
        let mut g = running_game();
        g.moves[0] = MoveFacts {
            is_submitted: true,
            is_made: false,
            validity: Some(validity),
        };
        h.ledger.put_game(g);
        h.store
            .upsert_attempted_move(&AttemptedMove::pending(key(), cell, 0, None))
            .await
            .unwrap();

        let mut rec = record(GamePhase::FinalizingMove { cell });
        rec.pending_move = Some(cell);
        let out = h.machine.step(rec, None).await;

        assert_eq!(out.record.phase, GamePhase::SelectingMove);
        assert_eq!(out.record.pending_move, None);
        assert!(out.record.last_error.is_some());
        assert!(matches!(
            h.ledger.broadcasts()[0],
            LedgerCall::FinalizeMove {
                is_invalid: true,
                ..
            }
        ));
        let attempts = h.store.attempted_moves(&key()).await.unwrap();
        assert_eq!(attempts[0].status, MoveStatus::Invalid);
    }

    #[tokio::test]
    async fn test_reverted_finalize_move_is_resubmitted() {
        let validity = handle(60);
        let h = harness(oracle_with(vec![(validity, 0)]), MachineConfig::default());
        let cell = Cell::new(3, 3);
        let mut g = running_game();
        g.moves[0] = MoveFacts {
            is_submitted: true,
            is_made: false,
            validity: Some(validity),
        };
        h.ledger.put_game(g);

        let mut rec = record(GamePhase::FinalizingMove { cell });
        rec.pending_move = Some(cell);
        let first = h.machine.step(rec, None).await;
        assert_eq!(first.record.phase, GamePhase::WaitingForOpponentMove);
        let tx = h.ledger.last_tx();

        // Still pending: nothing new is sent
        let waiting = h.machine.step(first.record, None).await;
        assert_eq!(h.ledger.broadcasts().len(), 1);

        let block = h.ledger.advance_block();
        h.ledger.set_status(tx, TxStatus::Reverted { block });
        h.machine.step(waiting.record, None).await;

        let finals: Vec<_> = h
            .ledger
            .broadcasts()
            .into_iter()
            .filter(|c| matches!(c, LedgerCall::FinalizeMove { .. }))
            .collect();
        assert_eq!(finals.len(), 2);
    }

    #[tokio::test]
    async fn test_collision_keeps_round_and_reselects() {
        let winner_h = handle(70);
        let collision_h = handle(71);
        let h = harness(
            oracle_with(vec![(winner_h, 0), (collision_h, 1)]),
            MachineConfig::default(),
        );
        let cell = Cell::new(3, 3);
        let mut g = running_game();
        g.round = 2;
        g.moves = [made(), made()];
        g.round_handles = Some(RoundHandles {
            winner: winner_h,
            collision: collision_h,
        });
        h.ledger.put_game(g);
        h.store
            .upsert_attempted_move(&AttemptedMove {
                status: MoveStatus::Confirmed,
                ..AttemptedMove::pending(key(), cell, 2, Some(TxRef(handle(9))))
            })
            .await
            .unwrap();

        let mut rec = record(GamePhase::WaitingForOpponentMove);
        rec.round = 2;
        let entered = h.machine.step(rec, None).await;
        assert_eq!(entered.record.phase, GamePhase::FinalizingGameState);
        assert!(h.ledger.broadcasts().is_empty());

        let out = h.machine.step(entered.record, None).await;
        assert_eq!(out.record.phase, GamePhase::SelectingMove);
        assert_eq!(out.record.round, 2);
        assert!(out.record.collision);

        let attempts = h.store.attempted_moves(&key()).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].cell, cell);
        assert_eq!(attempts[0].status, MoveStatus::Collision);
        assert!(matches!(
            h.ledger.broadcasts()[0],
            LedgerCall::FinalizeGameState {
                collision: true,
                winner: Winner::None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_decided_round_advances_to_reveal() {
        let winner_h = handle(80);
        let collision_h = handle(81);
        let h = harness(
            oracle_with(vec![(winner_h, 1), (collision_h, 0)]),
            MachineConfig::default(),
        );
        let mut g = running_game();
        g.moves = [made(), made()];
        g.round_handles = Some(RoundHandles {
            winner: winner_h,
            collision: collision_h,
        });
        h.ledger.put_game(g);

        let out = h
            .machine
            .step(record(GamePhase::FinalizingGameState), None)
            .await;
        assert_eq!(out.record.phase, GamePhase::RevealingBoard);
        assert_eq!(out.record.winner, Winner::Player1);
        assert_eq!(out.record.round, 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_claims_timeout_first() {
        let h = harness(MockDecryptionOracle::new(), MachineConfig::default());
        let mut g = running_game();
        g.moves = [made(), MoveFacts::default()];
        g.last_action_at = 1_000;
        g.move_timeout_secs = 60;
        h.ledger.put_game(g);

        let out = h
            .machine
            .step(record(GamePhase::WaitingForOpponentMove), None)
            .await;
        assert_eq!(out.record.phase, GamePhase::WaitingForOpponentMove);
        assert!(out.awaiting);
        assert_eq!(
            h.ledger.broadcasts(),
            vec![LedgerCall::ClaimTimeout { game_id: 1 }]
        );
    }

    #[tokio::test]
    async fn test_confirmed_timeout_claim_moves_to_reveal() {
        let h = harness(MockDecryptionOracle::new(), MachineConfig::default());
        let mut g = running_game();
        g.moves = [made(), MoveFacts::default()];
        g.last_action_at = 1_000;
        g.move_timeout_secs = 60;
        h.ledger.put_game(g);

        let claimed = h
            .machine
            .step(record(GamePhase::WaitingForOpponentMove), None)
            .await;
        assert!(claimed.awaiting);

        // The claim is mined and awards the game to the local seat
        h.ledger.confirm_pending();
        h.ledger.update_game(1, |g| {
            g.winner = Winner::Player1;
            g.board = vec![handle(90), handle(91)];
        });

        let out = h.machine.step(claimed.record, None).await;
        assert_eq!(out.record.phase, GamePhase::RevealingBoard);
        assert_eq!(out.record.winner, Winner::Player1);
        assert_eq!(out.record.status, GameStatus::Active);
        assert_eq!(out.record.retry_count, 0);
        assert_eq!(
            h.ledger.broadcasts(),
            vec![LedgerCall::ClaimTimeout { game_id: 1 }]
        );
    }

    #[tokio::test]
    async fn test_failed_timeout_claim_falls_back_to_waiting() {
        let h = harness(MockDecryptionOracle::new(), MachineConfig::default());
        let mut g = running_game();
        g.moves = [made(), MoveFacts::default()];
        g.last_action_at = 1_000;
        h.ledger.put_game(g);
        h.ledger.reject_broadcasts(true);

        let out = h
            .machine
            .step(record(GamePhase::WaitingForOpponentMove), None)
            .await;
        assert_eq!(out.record.phase, GamePhase::WaitingForOpponentMove);
        assert_eq!(out.record.retry_count, 0);
        assert!(out.record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_reveal_then_complete() {
        let board = vec![handle(90), handle(91)];
        let h = harness(
            oracle_with(vec![(board[0], 1), (board[1], 2)]),
            MachineConfig::default(),
        );
        let mut g = running_game();
        g.winner = Winner::Player1;
        g.board = board;
        h.ledger.put_game(g);

        let rec = record(GamePhase::WaitingForOpponentMove);
        let entered = h.machine.step(rec, None).await;
        assert_eq!(entered.record.phase, GamePhase::RevealingBoard);

        let revealing = h.machine.step(entered.record, None).await;
        assert!(revealing.awaiting);
        assert!(matches!(
            &h.ledger.broadcasts()[0],
            LedgerCall::RevealBoard { board, .. } if board == &vec![1, 2]
        ));

        h.ledger.update_game(1, |g| g.board_revealed = true);
        h.ledger.confirm_pending();
        let done = h.machine.step(revealing.record, None).await;
        assert_eq!(done.record.phase, GamePhase::GameComplete);
        assert_eq!(done.record.status, GameStatus::Completed);
        assert!(h
            .store
            .get_marker(&key(), TxAction::RevealBoard)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancelled_game_completes_as_abandoned() {
        let h = harness(MockDecryptionOracle::new(), MachineConfig::default());
        let mut g = open_game(1, LOCAL);
        g.cancelled = true;
        h.ledger.put_game(g);

        let out = h
            .machine
            .step(record(GamePhase::WaitingForOpponent), None)
            .await;
        assert_eq!(out.record.phase, GamePhase::GameComplete);
        assert_eq!(out.record.winner, Winner::Cancelled);
        assert_eq!(out.record.status, GameStatus::Abandoned);
    }

    #[tokio::test]
    async fn test_unjoined_game_cancelled_after_wait_limit() {
        let h = harness(
            MockDecryptionOracle::new(),
            MachineConfig {
                opponent_wait_timeout: Some(Duration::from_secs(30)),
                ..MachineConfig::default()
            },
        );
        h.ledger.put_game(open_game(1, LOCAL));

        let rec = record(GamePhase::WaitingForOpponent);
        let early = h.machine.step(rec, Some(Duration::from_secs(5))).await;
        assert!(h.ledger.broadcasts().is_empty());

        h.machine
            .step(early.record, Some(Duration::from_secs(31)))
            .await;
        assert_eq!(
            h.ledger.broadcasts(),
            vec![LedgerCall::CancelGame { game_id: 1 }]
        );
    }

    #[tokio::test]
    async fn test_idle_record_joins_open_game() {
        let h = harness(MockDecryptionOracle::new(), MachineConfig::default());
        h.ledger.put_game(open_game(1, OPPONENT));

        let out = h.machine.step(GameRecord::new(key(), false, Utc::now()), None).await;
        assert_eq!(out.record.phase, GamePhase::Idle);
        assert!(out.awaiting);
        assert_eq!(h.ledger.broadcasts(), vec![LedgerCall::JoinGame { game_id: 1 }]);
    }

    #[tokio::test]
    async fn test_stranger_is_fatal() {
        let h = harness(MockDecryptionOracle::new(), MachineConfig::default());
        let mut g = open_game(1, Address::repeat_byte(0x77));
        g.player2 = Some(OPPONENT);
        h.ledger.put_game(g);

        let out = h
            .machine
            .step(record(GamePhase::WaitingForOpponentMove), None)
            .await;
        assert_eq!(
            out.record.phase,
            GamePhase::Error {
                should_continue: false
            }
        );
        assert_eq!(out.record.status, GameStatus::Abandoned);
        assert!(out.record.last_error.is_some());
    }

    #[tokio::test]
    async fn test_transient_failures_escalate_to_error() {
        let h = harness(
            MockDecryptionOracle::new(),
            MachineConfig {
                max_transient_retries: 2,
                ..MachineConfig::default()
            },
        );
        // No game on the ledger: every read fails
        let rec = record(GamePhase::WaitingForOpponentMove);

        let first = h.machine.step(rec, None).await.record;
        assert_eq!(first.retry_count, 1);
        assert_eq!(first.phase, GamePhase::WaitingForOpponentMove);
        assert!(first.last_error.is_some());

        let second = h.machine.step(first, None).await.record;
        assert_eq!(second.retry_count, 2);
        assert_eq!(
            second.phase,
            GamePhase::Error {
                should_continue: true
            }
        );

        // Recovery clears the counter
        h.ledger.put_game(running_game());
        let recovered = h.machine.step(second, None).await.record;
        assert_eq!(recovered.retry_count, 0);
        assert_eq!(recovered.phase, GamePhase::SelectingMove);
    }

    #[tokio::test]
    async fn test_oracle_failure_keeps_pending_move() {
        let validity = handle(99);
        let mut oracle = MockDecryptionOracle::new();
        oracle.expect_decrypt().times(1).returning(|_, _| {
            Err(OracleError::new(OracleErrorKind::NotReady, "ciphertext not ready").into())
        });
        let h = harness(oracle, MachineConfig::default());
        let cell = Cell::new(1, 1);
        let mut g = running_game();
        g.moves[0] = MoveFacts {
            is_submitted: true,
            is_made: false,
            validity: Some(validity),
        };
        h.ledger.put_game(g);

        let mut rec = record(GamePhase::FinalizingMove { cell });
        rec.pending_move = Some(cell);
        let out = h.machine.step(rec, None).await.record;

        assert_eq!(out.phase, GamePhase::FinalizingMove { cell });
        assert_eq!(out.pending_move, Some(cell));
        assert_eq!(out.retry_count, 1);
        assert!(h.ledger.broadcasts().is_empty());
    }
}
