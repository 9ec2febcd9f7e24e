use serde::{Deserialize, Serialize};
use std::fmt;

use super::game::Cell;

/// Per-game phase of the agent's state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GamePhase {
    /// Game known locally but not yet seen with the agent seated
    Idle,
    /// Local player created the game; seat 2 is empty
    WaitingForOpponent,
    /// Local player may submit a move this round
    SelectingMove,
    /// Cell chosen, encrypted submission in progress
    SubmittingMove { cell: Cell },
    /// Submitted move's validity handle is being decrypted and finalized
    FinalizingMove { cell: Cell },
    /// Local move made; the opponent has not moved yet
    WaitingForOpponentMove,
    /// Both moves made; round winner/collision is being decrypted and finalized
    FinalizingGameState,
    /// Winner known; full board is being decrypted and revealed
    RevealingBoard,
    GameComplete,
    /// Step failure. `should_continue = false` is fully terminal.
    Error { should_continue: bool },
}

impl GamePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            GamePhase::Idle => "IDLE",
            GamePhase::WaitingForOpponent => "WAITING_FOR_OPPONENT",
            GamePhase::SelectingMove => "SELECTING_MOVE",
            GamePhase::SubmittingMove { .. } => "SUBMITTING_MOVE",
            GamePhase::FinalizingMove { .. } => "FINALIZING_MOVE",
            GamePhase::WaitingForOpponentMove => "WAITING_FOR_OPPONENT_MOVE",
            GamePhase::FinalizingGameState => "FINALIZING_GAME_STATE",
            GamePhase::RevealingBoard => "REVEALING_BOARD",
            GamePhase::GameComplete => "GAME_COMPLETE",
            GamePhase::Error { .. } => "ERROR",
        }
    }

    /// Phases polled on the fixed interval rather than revisited immediately.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            GamePhase::Idle | GamePhase::WaitingForOpponent | GamePhase::WaitingForOpponentMove
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GamePhase::GameComplete
                | GamePhase::Error {
                    should_continue: false
                }
        )
    }

    /// Cell carried by the move-submission phases.
    pub fn cell(&self) -> Option<Cell> {
        match self {
            GamePhase::SubmittingMove { cell } | GamePhase::FinalizingMove { cell } => Some(*cell),
            _ => None,
        }
    }

    /// Rebuild a phase from its persisted columns.
    pub fn from_parts(
        name: &str,
        cell: Option<Cell>,
        should_continue: bool,
    ) -> Result<Self, String> {
        let need_cell = || cell.ok_or_else(|| format!("Phase {} persisted without a cell", name));
        match name.to_uppercase().as_str() {
            "IDLE" => Ok(GamePhase::Idle),
            "WAITING_FOR_OPPONENT" => Ok(GamePhase::WaitingForOpponent),
            "SELECTING_MOVE" => Ok(GamePhase::SelectingMove),
            "SUBMITTING_MOVE" => Ok(GamePhase::SubmittingMove { cell: need_cell()? }),
            "FINALIZING_MOVE" => Ok(GamePhase::FinalizingMove { cell: need_cell()? }),
            "WAITING_FOR_OPPONENT_MOVE" => Ok(GamePhase::WaitingForOpponentMove),
            "FINALIZING_GAME_STATE" => Ok(GamePhase::FinalizingGameState),
            "REVEALING_BOARD" => Ok(GamePhase::RevealingBoard),
            "GAME_COMPLETE" => Ok(GamePhase::GameComplete),
            "ERROR" => Ok(GamePhase::Error { should_continue }),
            _ => Err(format!("Unknown phase: {}", name)),
        }
    }

    /// `should_continue` column value; only meaningful for `Error`.
    pub fn should_continue(&self) -> bool {
        !matches!(
            self,
            GamePhase::Error {
                should_continue: false
            }
        )
    }
}

impl fmt::Display for GamePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell() {
            Some(cell) => write!(f, "{}{}", self.as_str(), cell),
            None => write!(f, "{}", self.as_str()),
        }
    }
}
