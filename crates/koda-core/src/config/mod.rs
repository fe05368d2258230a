//! Configuration for the render pipeline
//!
//! - Generic YAML config loading/saving
//! - Temp-root and source-root path utilities (including home-root normalization)
//! - [`RenderConfig`], the settings every pipeline stage reads
//!
//! # Usage
//!
//! ```ignore
//! use koda_core::config::{default_config_path, load_config, RenderConfig};
//!
//! let mut config: RenderConfig = load_config(&default_config_path());
//! config.validate();
//! ```

mod io;
mod paths;
mod render;

pub use io::{load_config, save_config};
pub use paths::{
    default_config_path, default_temp_root, normalize_logical_path, platform_users_root,
    resolve_source_path, CACHE_DIR_NAME,
};
pub use render::{RenderConfig, SnippetConfig, SpectrogramConfig};
