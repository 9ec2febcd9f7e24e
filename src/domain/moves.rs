use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::game::{Cell, GameKey};
use super::ledger::TxRef;

/// Resolution of a cell the agent tried to claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoveStatus {
    Pending,
    Confirmed,
    Invalid,
    Collision,
}

impl MoveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveStatus::Pending => "PENDING",
            MoveStatus::Confirmed => "CONFIRMED",
            MoveStatus::Invalid => "INVALID",
            MoveStatus::Collision => "COLLISION",
        }
    }
}

impl fmt::Display for MoveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for MoveStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(MoveStatus::Pending),
            "CONFIRMED" => Ok(MoveStatus::Confirmed),
            "INVALID" => Ok(MoveStatus::Invalid),
            "COLLISION" => Ok(MoveStatus::Collision),
            _ => Err(format!("Unknown move status: {}", s)),
        }
    }
}

/// One row per (game, x, y, round)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptedMove {
    pub key: GameKey,
    pub cell: Cell,
    pub round: u32,
    pub status: MoveStatus,
    pub tx_ref: Option<TxRef>,
    pub updated_at: DateTime<Utc>,
}

impl AttemptedMove {
    pub fn pending(key: GameKey, cell: Cell, round: u32, tx_ref: Option<TxRef>) -> Self {
        Self {
            key,
            cell,
            round,
            status: MoveStatus::Pending,
            tx_ref,
            updated_at: Utc::now(),
        }
    }

    /// A cell that can never be claimed again in this game.
    pub fn blocks_cell(&self) -> bool {
        matches!(self.status, MoveStatus::Confirmed | MoveStatus::Invalid)
    }
}
