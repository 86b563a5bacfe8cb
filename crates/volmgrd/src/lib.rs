//! volmgrd - volume host agent
//!
//! Serves the image lifecycle and volume publish/unpublish over HTTP on top
//! of [`volmgr_common::VolumeOrchestrator`].
//!
//! - [`api`]: axum router and error mapping
//! - [`config_file`]: TOML configuration

pub mod api;
pub mod config_file;

pub use api::{create_router, ApiError};
pub use config_file::{ConfigError, VolmgrConfig, DEFAULT_CONFIG_PATH};
