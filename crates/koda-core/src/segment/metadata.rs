//! Per-file call metadata
//!
//! The annotation workflow owns the call boundaries of every recording; the
//! render pipeline only reads them. Stores return onset/offset times in
//! seconds, one pair per annotated call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{RenderError, RenderResult};

/// Suffix appended to a recording's filename to find its call metadata
pub const METADATA_SUFFIX: &str = ".calls.json";

/// Onset/offset arrays for one recording
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallMetadata {
    pub onsets: Vec<f64>,
    pub offsets: Vec<f64>,
}

impl CallMetadata {
    /// Number of usable calls (shorter of the two arrays)
    pub fn len(&self) -> usize {
        self.onsets.len().min(self.offsets.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(onset, offset)` in seconds
    pub fn call(&self, index: usize) -> RenderResult<(f64, f64)> {
        if index >= self.len() {
            return Err(RenderError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        Ok((self.onsets[index], self.offsets[index]))
    }
}

/// Read access to call metadata
pub trait CallMetadataStore: Send + Sync {
    /// Metadata for the recording at `source` (an absolute filesystem path)
    fn load(&self, source: &Path) -> RenderResult<CallMetadata>;
}

/// Reads `<recording>.calls.json` next to each recording
///
/// ```json
/// { "onsets": [0.12, 0.48], "offsets": [0.13, 0.50] }
/// ```
#[derive(Debug, Clone, Default)]
pub struct JsonCallMetadataStore;

/// On-disk shape; both arrays optional so a missing one is reported precisely
#[derive(Deserialize)]
struct RawCallMetadata {
    onsets: Option<Vec<f64>>,
    offsets: Option<Vec<f64>>,
}

impl JsonCallMetadataStore {
    pub fn metadata_path(source: &Path) -> PathBuf {
        let mut name = source.as_os_str().to_owned();
        name.push(METADATA_SUFFIX);
        PathBuf::from(name)
    }
}

impl CallMetadataStore for JsonCallMetadataStore {
    fn load(&self, source: &Path) -> RenderResult<CallMetadata> {
        let path = Self::metadata_path(source);
        let corrupt = |reason: String| RenderError::CorruptSegmentMetadata {
            path: path.clone(),
            reason,
        };

        let contents = std::fs::read_to_string(&path).map_err(|e| corrupt(e.to_string()))?;
        let raw: RawCallMetadata =
            serde_json::from_str(&contents).map_err(|e| corrupt(e.to_string()))?;

        let onsets = raw.onsets.ok_or_else(|| corrupt("missing onsets".to_string()))?;
        let offsets = raw.offsets.ok_or_else(|| corrupt("missing offsets".to_string()))?;

        if onsets.len() != offsets.len() {
            log::warn!(
                "[METADATA] {:?} has {} onsets but {} offsets",
                path,
                onsets.len(),
                offsets.len()
            );
        }

        Ok(CallMetadata { onsets, offsets })
    }
}

/// Metadata held in memory, for embedding applications and tests
#[derive(Debug, Default)]
pub struct InMemoryCallMetadataStore {
    entries: RwLock<HashMap<PathBuf, CallMetadata>>,
}

impl InMemoryCallMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source: impl Into<PathBuf>, metadata: CallMetadata) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(source.into(), metadata);
        }
    }
}

impl CallMetadataStore for InMemoryCallMetadataStore {
    fn load(&self, source: &Path) -> RenderResult<CallMetadata> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(source).cloned())
            .ok_or_else(|| RenderError::CorruptSegmentMetadata {
                path: source.to_path_buf(),
                reason: "no metadata registered".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_store_reads_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("rec.wav");
        std::fs::write(
            JsonCallMetadataStore::metadata_path(&source),
            r#"{"onsets": [0.1, 0.5], "offsets": [0.2, 0.6], "labels": ["a", "b"]}"#,
        )
        .unwrap();

        let metadata = JsonCallMetadataStore.load(&source).unwrap();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata.call(1).unwrap(), (0.5, 0.6));
        assert_eq!(
            JsonCallMetadataStore::metadata_path(&source),
            dir.path().join("rec.wav.calls.json")
        );
    }

    #[test]
    fn test_missing_array_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("rec.wav");
        std::fs::write(JsonCallMetadataStore::metadata_path(&source), r#"{"onsets": [0.1]}"#).unwrap();

        let err = JsonCallMetadataStore.load(&source).unwrap_err();
        match err {
            RenderError::CorruptSegmentMetadata { reason, .. } => assert!(reason.contains("offsets")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_sidecar_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonCallMetadataStore.load(&dir.path().join("rec.wav")).unwrap_err();
        assert!(matches!(err, RenderError::CorruptSegmentMetadata { .. }));
    }

    #[test]
    fn test_index_past_shorter_array() {
        let metadata = CallMetadata {
            onsets: vec![0.1, 0.2, 0.3],
            offsets: vec![0.15, 0.25],
        };
        assert_eq!(metadata.len(), 2);
        assert!(matches!(
            metadata.call(2),
            Err(RenderError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryCallMetadataStore::new();
        store.insert(
            "/rec.wav",
            CallMetadata {
                onsets: vec![1.0],
                offsets: vec![1.5],
            },
        );
        assert_eq!(store.load(Path::new("/rec.wav")).unwrap().len(), 1);
        assert!(store.load(Path::new("/other.wav")).is_err());
    }
}
