//! Cache key derivation
//!
//! Every artifact lives at a path derived only from the request:
//!
//! ```text
//! <temp_root>/<normalized source dir>/<urlencoded params>_<source basename>.<ext>
//! ```
//!
//! Parameters are encoded in sorted order, so the same values always give
//! the same key regardless of how the caller ordered them. The reserved
//! characters `?&=` are replaced with `_` so the key is a single, safe path
//! component.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::normalize_logical_path;
use crate::request::RenderRequest;

/// Deterministic identifier of one artifact, doubling as its location
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Leaf filename (`<params>_<basename>.<ext>`)
    pub leaf: String,
    /// Absolute artifact path
    pub path: PathBuf,
}

impl CacheKey {
    /// Directory that holds the artifact
    pub fn folder(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }

    /// Sibling path where a failed render publishes its error image
    ///
    /// Kept apart from [`CacheKey::path`] so an error never counts as a
    /// cache hit on a later request.
    pub fn error_path(&self) -> PathBuf {
        let stem = Path::new(&self.leaf)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.leaf.clone());
        self.folder().join(format!("error_{}.png", stem))
    }

    /// Present and non-empty, i.e. a published artifact
    pub fn is_published(&self) -> bool {
        std::fs::metadata(&self.path)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Maps (logical source path, parameters) onto artifact paths
#[derive(Debug, Clone)]
pub struct CacheKeyResolver {
    temp_root: PathBuf,
}

impl CacheKeyResolver {
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
        }
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Resolve the artifact path (or only its folder) for a source and parameters
    ///
    /// Creates the folder if missing. Failing to create it is logged and
    /// otherwise ignored; the publish step reports the real error later.
    pub fn resolve<K, V>(
        &self,
        source_path: &str,
        params: impl IntoIterator<Item = (K, V)>,
        want_folder_only: bool,
    ) -> PathBuf
    where
        K: Into<String>,
        V: Into<String>,
    {
        let folder = self.folder_for(source_path);
        if let Err(e) = std::fs::create_dir_all(&folder) {
            log::warn!("[CACHE] Failed to create {:?}: {}", folder, e);
        }

        if want_folder_only {
            return folder;
        }

        folder.join(leaf_name(source_path, params))
    }

    /// Key for a full render request
    pub fn key_for(&self, request: &RenderRequest) -> CacheKey {
        let mut leaf = leaf_name(&request.source_path, request.key_params());
        leaf.push('.');
        leaf.push_str(request.kind.extension());

        let folder = self.resolve(&request.source_path, std::iter::empty::<(String, String)>(), true);
        CacheKey {
            path: folder.join(&leaf),
            leaf,
        }
    }

    fn folder_for(&self, source_path: &str) -> PathBuf {
        let normalized = normalize_logical_path(source_path);
        match normalized.parent() {
            Some(dir) => self.temp_root.join(dir),
            None => self.temp_root.clone(),
        }
    }
}

/// `<sorted urlencoded params with ?&= replaced>_<basename>`
fn leaf_name<K, V>(source_path: &str, params: impl IntoIterator<Item = (K, V)>) -> String
where
    K: Into<String>,
    V: Into<String>,
{
    let sorted: BTreeMap<String, String> = params
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();

    let encoded = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let escaped: String = encoded
        .chars()
        .map(|c| if matches!(c, '?' | '&' | '=') { '_' } else { c })
        .collect();

    let basename = normalize_logical_path(source_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    format!("{}_{}", escaped, basename)
}
