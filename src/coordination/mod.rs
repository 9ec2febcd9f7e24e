//! Coordination for long-running operation: ordered shutdown of the
//! scheduler, the background loops and the store.

pub mod shutdown;

pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownConfig, ShutdownError, ShutdownPhase,
    ShutdownSignal,
};
