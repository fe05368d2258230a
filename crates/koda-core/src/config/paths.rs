//! Path utilities for the render cache
//!
//! Logical source paths arrive from the web layer in a platform-neutral form
//! (`home/<user>/...`). Both the artifact cache layout and the lookup of the
//! real recording go through [`normalize_logical_path`] so the same logical
//! path lands in the same place on every platform.

use std::path::{Component, Path, PathBuf};

/// Directory under the OS temp root holding every rendered artifact
pub const CACHE_DIR_NAME: &str = "battykoda_temp";

/// Get the default artifact cache root
///
/// Returns: `<os temp dir>/battykoda_temp`
pub fn default_temp_root() -> PathBuf {
    std::env::temp_dir().join(CACHE_DIR_NAME)
}

/// Get the default config file path
///
/// Returns: `<config dir>/koda/render.yaml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("koda")
        .join("render.yaml")
}

/// Name of the directory holding user homes on this platform
pub fn platform_users_root() -> &'static str {
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        "Users"
    } else {
        "home"
    }
}

/// Normalize a logical source path into a relative path
///
/// - A leading `home` or `Users` segment becomes [`platform_users_root`]
/// - Root, `.` and `..` components are dropped, so the result can be joined
///   onto a root directory without escaping it
pub fn normalize_logical_path(logical: &str) -> PathBuf {
    let mut normalized = PathBuf::new();
    let segments = logical
        .split(['/', '\\'])
        .filter(|s| !s.is_empty())
        .flat_map(|s| Path::new(s).components())
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        });

    for (i, part) in segments.enumerate() {
        if i == 0 && (part == "home" || part == "Users") {
            normalized.push(platform_users_root());
        } else {
            normalized.push(part);
        }
    }

    normalized
}

/// Map a logical source path onto the filesystem below `source_root`
pub fn resolve_source_path(source_root: &Path, logical: &str) -> PathBuf {
    source_root.join(normalize_logical_path(logical))
}
