use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::game::GameKey;
use super::ledger::TxRef;

/// Logical step a ledger transaction performs for a game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxAction {
    StartGame,
    JoinGame,
    CancelGame,
    SubmitMove,
    FinalizeMove,
    FinalizeGameState,
    RevealBoard,
    ClaimTimeout,
}

impl TxAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxAction::StartGame => "start-game",
            TxAction::JoinGame => "join-game",
            TxAction::CancelGame => "cancel-game",
            TxAction::SubmitMove => "submit-move",
            TxAction::FinalizeMove => "finalize-move",
            TxAction::FinalizeGameState => "finalize-game-state",
            TxAction::RevealBoard => "reveal-board",
            TxAction::ClaimTimeout => "claim-timeout",
        }
    }
}

impl fmt::Display for TxAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TxAction {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "start-game" => Ok(TxAction::StartGame),
            "join-game" => Ok(TxAction::JoinGame),
            "cancel-game" => Ok(TxAction::CancelGame),
            "submit-move" => Ok(TxAction::SubmitMove),
            "finalize-move" => Ok(TxAction::FinalizeMove),
            "finalize-game-state" => Ok(TxAction::FinalizeGameState),
            "reveal-board" => Ok(TxAction::RevealBoard),
            "claim-timeout" => Ok(TxAction::ClaimTimeout),
            _ => Err(format!("Unknown action: {}", s)),
        }
    }
}

/// Lifecycle of a tracked transaction. `Failed` and `Dropped` allow a resubmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerStatus {
    Pending,
    Confirmed,
    Failed,
    Dropped,
}

impl MarkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerStatus::Pending => "PENDING",
            MarkerStatus::Confirmed => "CONFIRMED",
            MarkerStatus::Failed => "FAILED",
            MarkerStatus::Dropped => "DROPPED",
        }
    }
}

impl fmt::Display for MarkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for MarkerStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(MarkerStatus::Pending),
            "CONFIRMED" => Ok(MarkerStatus::Confirmed),
            "FAILED" => Ok(MarkerStatus::Failed),
            "DROPPED" => Ok(MarkerStatus::Dropped),
            _ => Err(format!("Unknown marker status: {}", s)),
        }
    }
}

/// At most one per (game, action); a new attempt overwrites it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMarker {
    pub key: GameKey,
    pub action: TxAction,
    pub tx_ref: TxRef,
    pub status: MarkerStatus,
    pub block: Option<u64>,
    pub params_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Hex SHA-256 over the logical inputs of an action.
///
/// Inputs are fed in order with a separator so `("ab", "c")` and `("a", "bc")`
/// hash differently.
pub fn params_hash<I, P>(parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}
