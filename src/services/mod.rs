pub mod discovery;
pub mod event_watcher;

pub use discovery::DiscoveryService;
pub use event_watcher::{Cursor, EventWatcher};
