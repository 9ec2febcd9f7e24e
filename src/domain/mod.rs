pub mod game;
pub mod ledger;
pub mod marker;
pub mod moves;
pub mod phase;

pub use game::{Cell, GameKey, GameRecord, GameStatus, Winner};
pub use ledger::{
    Decryption, EncryptedMove, GameEvent, GameEventKind, GameFacts, Handle, LedgerCall,
    MoveFacts, RoundHandles, Seat, TxRef, TxStatus,
};
pub use marker::{params_hash, MarkerStatus, TxAction, TxMarker};
pub use moves::{AttemptedMove, MoveStatus};
pub use phase::GamePhase;
