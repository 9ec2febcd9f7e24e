pub mod traits;

pub use traits::{
    observe_game, DecryptionOracle, InputEncryptor, Ledger, LogSource, PreparedTx,
};

#[cfg(test)]
pub use traits::MockDecryptionOracle;
