pub mod accessor;
pub mod config;
pub mod logging;
pub mod server;
pub mod watcher;

pub use accessor::{AccessError, StyleFileAccessor};
pub use config::BridgeConfig;
pub use server::{Bridge, BridgeError};
pub use watcher::{ChangeEvent, ChangeWatcher, Subscription, WatchError, WatchOptions};
