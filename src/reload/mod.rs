//! Hot reloading of rate limit rules.
//!
//! [`ConfigStore`] owns the published rule snapshot; [`ConfigWatcher`] turns
//! file system notifications for the rules file into reloads.

mod config_store;
mod watcher;

pub use config_store::ConfigStore;
pub use watcher::ConfigWatcher;
