pub mod api;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod plugins;
pub mod version;

// re-export selected public API
pub use config::{Config, DeviceType};
pub use error::PluginError;
pub use plugins::{Health, Inventory, Plugin, PluginFactory, RunState};
