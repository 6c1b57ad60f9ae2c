//! Configuration Module
//!
//! Settings for the streaming engine and the binary, loaded from environment
//! variables or a dotenv file.

mod settings;

pub use settings::{
    AuthSettings, ConfigError, ConnectionSettings, EngineConfig, KeepaliveSettings,
    OrderBookSettings, ReconnectSettings, RouterSettings, RunSettings,
};
