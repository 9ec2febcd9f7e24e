use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::phase::GamePhase;

/// Identifies one game instance across every persisted table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GameKey {
    pub chain_id: u64,
    pub contract: Address,
    pub game_id: u64,
}

impl GameKey {
    pub fn new(chain_id: u64, contract: Address, game_id: u64) -> Self {
        Self {
            chain_id,
            contract,
            game_id,
        }
    }

    /// Lowercase hex form used as the contract column value
    pub fn contract_hex(&self) -> String {
        format!("{:#x}", self.contract)
    }
}

impl fmt::Display for GameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}:{}", self.chain_id, self.contract, self.game_id)
    }
}

/// A board coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    pub x: u8,
    pub y: u8,
}

impl Cell {
    pub fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// Outcome of a game as reported by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Winner {
    #[default]
    None,
    Player1,
    Player2,
    Draw,
    Cancelled,
}

impl Winner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Winner::None => "NONE",
            Winner::Player1 => "PLAYER1",
            Winner::Player2 => "PLAYER2",
            Winner::Draw => "DRAW",
            Winner::Cancelled => "CANCELLED",
        }
    }

    /// Decode the contract's `uint8` winner encoding (0 none, 1/2 seat, 3 draw).
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Winner::Player1,
            2 => Winner::Player2,
            3 => Winner::Draw,
            _ => Winner::None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Winner::None | Winner::Cancelled => 0,
            Winner::Player1 => 1,
            Winner::Player2 => 2,
            Winner::Draw => 3,
        }
    }

    pub fn is_decided(&self) -> bool {
        !matches!(self, Winner::None)
    }
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Winner {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "NONE" => Ok(Winner::None),
            "PLAYER1" => Ok(Winner::Player1),
            "PLAYER2" => Ok(Winner::Player2),
            "DRAW" => Ok(Winner::Draw),
            "CANCELLED" => Ok(Winner::Cancelled),
            _ => Err(format!("Unknown winner: {}", s)),
        }
    }
}

/// Lifecycle status of a game record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameStatus {
    Active,
    Completed,
    Abandoned,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Active => "ACTIVE",
            GameStatus::Completed => "COMPLETED",
            GameStatus::Abandoned => "ABANDONED",
        }
    }

    /// Status only ever leaves `Active`; finished games stay finished.
    pub fn can_transition_to(&self, target: GameStatus) -> bool {
        *self == GameStatus::Active || *self == target
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for GameStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Ok(GameStatus::Active),
            "COMPLETED" => Ok(GameStatus::Completed),
            "ABANDONED" => Ok(GameStatus::Abandoned),
            _ => Err(format!("Unknown game status: {}", s)),
        }
    }
}

/// Everything the agent remembers about one game between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub key: GameKey,
    pub phase: GamePhase,
    pub round: u32,
    pub winner: Winner,
    pub status: GameStatus,
    pub waiting_since: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub next_check_at: Option<DateTime<Utc>>,
    pub collision: bool,
    /// Cell submitted (or about to be) whose validity is not yet known.
    /// Survives an `Error` phase so recovery can finalize it.
    pub pending_move: Option<Cell>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub is_player1: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GameRecord {
    pub fn new(key: GameKey, is_player1: bool, now: DateTime<Utc>) -> Self {
        Self {
            key,
            phase: GamePhase::Idle,
            round: 0,
            winner: Winner::None,
            status: GameStatus::Active,
            waiting_since: None,
            last_check_at: None,
            next_check_at: Some(now),
            collision: false,
            pending_move: None,
            last_error: None,
            retry_count: 0,
            is_player1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == GameStatus::Active
    }

    /// Move the lifecycle status forward; a finished game never reactivates.
    pub fn set_status(&mut self, status: GameStatus) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        true
    }

    /// Rounds are monotonically non-decreasing.
    pub fn advance_round_to(&mut self, round: u32) {
        self.round = self.round.max(round);
    }
}
