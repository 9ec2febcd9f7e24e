//! Ledger-side facts and calls, independent of any RPC client.

use alloy::primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::game::{Cell, Winner};
use super::marker::TxAction;

/// Opaque reference to an encrypted value held by the contract
pub type Handle = B256;

/// Transaction reference (hash), known before the transaction is broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxRef(pub B256);

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl FromStr for TxRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s.trim())
            .map(TxRef)
            .map_err(|e| format!("Invalid transaction reference {}: {}", s, e))
    }
}

/// Ledger view of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Known to the node but not yet in a block
    Pending,
    Success { block: u64 },
    Reverted { block: u64 },
    /// Unknown to the node; most likely dropped from the mempool
    NotFound,
}

/// Seat of a player in a game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Seat {
    Player1,
    Player2,
}

impl Seat {
    pub fn index(&self) -> usize {
        match self {
            Seat::Player1 => 0,
            Seat::Player2 => 1,
        }
    }

    pub fn opponent(&self) -> Seat {
        match self {
            Seat::Player1 => Seat::Player2,
            Seat::Player2 => Seat::Player1,
        }
    }
}

/// Per-player move flags for the current round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MoveFacts {
    pub is_submitted: bool,
    pub is_made: bool,
    /// Encrypted "move is invalid" flag, present once a submission was evaluated
    pub validity: Option<Handle>,
}

/// Encrypted round result, present once both moves were processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundHandles {
    pub winner: Handle,
    pub collision: Handle,
}

/// Snapshot of one game read from the ledger at a single block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameFacts {
    pub game_id: u64,
    /// Block the snapshot was read at
    pub block: u64,
    pub player1: Address,
    pub player2: Option<Address>,
    pub round: u32,
    pub winner: Winner,
    pub cancelled: bool,
    pub board_revealed: bool,
    pub board_size: u8,
    /// Unix seconds of the last state-changing action
    pub last_action_at: u64,
    pub move_timeout_secs: u64,
    pub round_handles: Option<RoundHandles>,
    pub board: Vec<Handle>,
    pub moves: [MoveFacts; 2],
}

impl GameFacts {
    pub fn seat_of(&self, address: Address) -> Option<Seat> {
        if self.player1 == address {
            Some(Seat::Player1)
        } else if self.player2 == Some(address) {
            Some(Seat::Player2)
        } else {
            None
        }
    }

    pub fn moves_of(&self, seat: Seat) -> &MoveFacts {
        &self.moves[seat.index()]
    }

    /// Winner or cancellation already settled on the ledger.
    pub fn is_settled(&self) -> bool {
        self.cancelled || self.winner.is_decided()
    }

    pub fn outcome(&self) -> Winner {
        if self.cancelled {
            Winner::Cancelled
        } else {
            self.winner
        }
    }

    /// Unix second after which the waiting player may claim a timeout.
    pub fn move_deadline(&self, fallback_timeout_secs: u64) -> u64 {
        let window = if self.move_timeout_secs > 0 {
            self.move_timeout_secs
        } else {
            fallback_timeout_secs
        };
        self.last_action_at.saturating_add(window)
    }
}

/// Encrypted coordinates plus the input proof binding them to the sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMove {
    pub x: Handle,
    pub y: Handle,
    pub proof: Bytes,
}

/// Every ledger-mutating call the agent can make
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    StartGame {
        move_timeout_secs: u64,
    },
    JoinGame {
        game_id: u64,
    },
    CancelGame {
        game_id: u64,
    },
    SubmitMove {
        game_id: u64,
        cell: Cell,
        encrypted: EncryptedMove,
    },
    FinalizeMove {
        game_id: u64,
        player: Address,
        is_invalid: bool,
        proof: Bytes,
    },
    FinalizeGameState {
        game_id: u64,
        winner: Winner,
        collision: bool,
        proof: Bytes,
    },
    RevealBoard {
        game_id: u64,
        board: Vec<u8>,
        proof: Bytes,
    },
    ClaimTimeout {
        game_id: u64,
    },
}

impl LedgerCall {
    pub fn action(&self) -> TxAction {
        match self {
            LedgerCall::StartGame { .. } => TxAction::StartGame,
            LedgerCall::JoinGame { .. } => TxAction::JoinGame,
            LedgerCall::CancelGame { .. } => TxAction::CancelGame,
            LedgerCall::SubmitMove { .. } => TxAction::SubmitMove,
            LedgerCall::FinalizeMove { .. } => TxAction::FinalizeMove,
            LedgerCall::FinalizeGameState { .. } => TxAction::FinalizeGameState,
            LedgerCall::RevealBoard { .. } => TxAction::RevealBoard,
            LedgerCall::ClaimTimeout { .. } => TxAction::ClaimTimeout,
        }
    }
}

/// Clear values for a batch of handles plus one proof covering the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decryption {
    pub values: std::collections::HashMap<Handle, alloy::primitives::U256>,
    pub proof: Bytes,
}

impl Decryption {
    pub fn value(&self, handle: &Handle) -> Option<alloy::primitives::U256> {
        self.values.get(handle).copied()
    }

    pub fn flag(&self, handle: &Handle) -> Option<bool> {
        self.value(handle).map(|v| !v.is_zero())
    }
}

/// Ledger event names consumed by the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameEventKind {
    GameStarted,
    PlayerJoined,
    MoveSubmitted,
    MoveInvalid,
    MoveMade,
    MovesProcessed,
    Collision,
    GameUpdated,
    BoardRevealed,
    GameCancelled,
    GameTimeout,
}

impl GameEventKind {
    pub const ALL: [GameEventKind; 11] = [
        GameEventKind::GameStarted,
        GameEventKind::PlayerJoined,
        GameEventKind::MoveSubmitted,
        GameEventKind::MoveInvalid,
        GameEventKind::MoveMade,
        GameEventKind::MovesProcessed,
        GameEventKind::Collision,
        GameEventKind::GameUpdated,
        GameEventKind::BoardRevealed,
        GameEventKind::GameCancelled,
        GameEventKind::GameTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GameEventKind::GameStarted => "GameStarted",
            GameEventKind::PlayerJoined => "PlayerJoined",
            GameEventKind::MoveSubmitted => "MoveSubmitted",
            GameEventKind::MoveInvalid => "MoveInvalid",
            GameEventKind::MoveMade => "MoveMade",
            GameEventKind::MovesProcessed => "MovesProcessed",
            GameEventKind::Collision => "Collision",
            GameEventKind::GameUpdated => "GameUpdated",
            GameEventKind::BoardRevealed => "BoardRevealed",
            GameEventKind::GameCancelled => "GameCancelled",
            GameEventKind::GameTimeout => "GameTimeout",
        }
    }
}

impl fmt::Display for GameEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decoded ledger event with its position in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameEvent {
    pub game_id: u64,
    pub kind: GameEventKind,
    pub block: u64,
    pub log_index: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> GameFacts {
        GameFacts {
            game_id: 1,
            block: 10,
            player1: Address::repeat_byte(1),
            player2: Some(Address::repeat_byte(2)),
            round: 0,
            winner: Winner::None,
            cancelled: false,
            board_revealed: false,
            board_size: 5,
            last_action_at: 1_000,
            move_timeout_secs: 0,
            round_handles: None,
            board: Vec::new(),
            moves: [MoveFacts::default(); 2],
        }
    }

    #[test]
    fn test_seat_lookup() {
        let f = facts();
        assert_eq!(f.seat_of(Address::repeat_byte(1)), Some(Seat::Player1));
        assert_eq!(f.seat_of(Address::repeat_byte(2)), Some(Seat::Player2));
        assert_eq!(f.seat_of(Address::repeat_byte(3)), None);
    }

    #[test]
    fn test_deadline_falls_back_to_configured_window() {
        let mut f = facts();
        assert_eq!(f.move_deadline(300), 1_300);
        f.move_timeout_secs = 60;
        assert_eq!(f.move_deadline(300), 1_060);
    }

    #[test]
    fn test_tx_ref_parse() {
        let hash = B256::repeat_byte(0xab);
        let parsed: TxRef = format!("{:#x}", hash).parse().unwrap();
        assert_eq!(parsed, TxRef(hash));
        assert!("not-a-hash".parse::<TxRef>().is_err());
    }
}
