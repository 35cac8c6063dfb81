mod loader;
mod raw;
pub mod error;
pub mod settings;

pub use error::ConfigError;
pub use loader::{load_specs, parse_specs};
pub use settings::{BackendSettings, LockSettings, Settings, WorkspaceSettings, SETTINGS_FILE};
