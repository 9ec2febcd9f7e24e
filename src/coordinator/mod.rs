//! Game scheduling
//!
//! The scheduler decides when each active game is stepped and runs the
//! steps on a bounded worker pool.

pub mod scheduler;

pub use scheduler::{next_delay, Scheduler, SchedulerHandle};
