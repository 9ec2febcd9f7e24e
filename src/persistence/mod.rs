//! Persistence Layer for crash recovery
//!
//! - `GameStore` trait over the three agent tables
//! - `MemoryStore` for dry runs and tests
//! - `TxMarkerManager` for idempotent ledger submissions
//!
//! The PostgreSQL implementation lives in `adapters::postgres`.

pub mod memory;
pub mod store;
pub mod tx_markers;

pub use memory::MemoryStore;
pub use store::GameStore;
pub use tx_markers::{MarkerDecision, TxMarkerManager};
