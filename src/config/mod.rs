//! Redirect configuration: TOML file, `PORTREDIR_*` environment variables
//! and command-line overrides, validated once after merging.

pub mod manager;
pub mod types;

pub use manager::ConfigManager;
pub use types::*;
