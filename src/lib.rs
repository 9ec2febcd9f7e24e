pub mod adapters;
pub mod chain;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod services;
pub mod strategy;

#[cfg(test)]
pub(crate) mod testing;

pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownSignal};
pub use coordinator::Scheduler;
pub use error::{AgentError, Result};
pub use strategy::{PhaseMachine, Services};
