pub mod settings;
pub mod user;

pub use settings::{BridgeSettings, PrepareStep, WorkerCommand};
pub use user::{ConfigError, ConfigResult, config_path, load_settings, parse_settings};
