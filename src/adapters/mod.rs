pub mod evm_ledger;
pub mod evm_logs;
pub mod postgres;
pub mod relayer;

pub use evm_ledger::EvmLedger;
pub use evm_logs::EvmLogSource;
pub use postgres::PostgresStore;
pub use relayer::RelayerClient;
