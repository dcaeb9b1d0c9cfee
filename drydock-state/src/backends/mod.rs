//! Backend implementations for state storage

mod plugin;

pub use plugin::{PluginBackend, PluginStateClient};
