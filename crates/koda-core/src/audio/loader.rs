//! Decoded-audio cache
//!
//! The annotation workflow re-requests artifacts for the same recording
//! over and over, so decoding once and keeping the normalized buffer around
//! for a few minutes removes almost all of the per-request cost.
//!
//! # Freshness
//!
//! A cached [`AudioHandle`] is served while:
//! - it is younger than the TTL (300 s by default), and
//! - when `validate_mtime` is on, the file's length and modification time
//!   still match what was seen at load time.
//!
//! With `validate_mtime` off, an edit inside the TTL window is invisible
//! until the entry expires.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use ndarray::{Array2, ArrayView1, Axis};
use sha2::{Digest, Sha256};

use super::decode::{decode_bytes, DecodedAudio};
use crate::config::RenderConfig;
use crate::error::{RenderError, RenderResult};

/// Channel count mono recordings are replicated to
pub const MONO_UPMIX_CHANNELS: usize = 3;

/// A decoded, normalized recording
#[derive(Debug)]
pub struct AudioHandle {
    /// Samples × channels, divided by the global standard deviation
    pub buffer: Array2<f32>,
    pub sample_rate: u32,
    /// SHA-256 (hex) over the raw file bytes
    pub content_hash: String,
    pub loaded_at: Instant,
}

impl AudioHandle {
    /// Number of sample frames
    pub fn len(&self) -> usize {
        self.buffer.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.nrows() == 0
    }

    pub fn channels(&self) -> usize {
        self.buffer.ncols()
    }

    pub fn duration_secs(&self) -> f64 {
        self.len() as f64 / self.sample_rate.max(1) as f64
    }

    /// One channel as a view, `None` if out of range
    pub fn channel(&self, channel: usize) -> Option<ArrayView1<'_, f32>> {
        (channel < self.channels()).then(|| self.buffer.index_axis(Axis(1), channel))
    }
}

/// What the file looked like when it was read
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileFingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileFingerprint {
    fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

struct CachedAudio {
    handle: Arc<AudioHandle>,
    fingerprint: FileFingerprint,
}

struct CachedHash {
    hash: String,
    fingerprint: FileFingerprint,
    computed_at: Instant,
}

/// Loads source recordings and memoizes the decoded result
///
/// One instance is shared (`Arc`) by every extractor; it is safe to call
/// from any number of worker threads. Two threads missing the cache for the
/// same path at the same time both decode, and the later insert wins.
pub struct SourceAudioLoader {
    ttl: Duration,
    validate_mtime: bool,
    entries: RwLock<HashMap<PathBuf, CachedAudio>>,
    hashes: RwLock<HashMap<PathBuf, CachedHash>>,
    decodes: AtomicUsize,
}

impl SourceAudioLoader {
    pub fn new(ttl: Duration, validate_mtime: bool) -> Self {
        Self {
            ttl,
            validate_mtime,
            entries: RwLock::new(HashMap::new()),
            hashes: RwLock::new(HashMap::new()),
            decodes: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(config.audio_cache_ttl(), config.validate_source_mtime)
    }

    /// Load a recording, from cache when fresh
    pub fn load(&self, path: &Path) -> RenderResult<Arc<AudioHandle>> {
        let (key, fingerprint) = Self::inspect(path)?;

        if let Ok(entries) = self.entries.read() {
            if let Some(entry) = entries.get(&key) {
                if self.is_fresh(entry.handle.loaded_at, &entry.fingerprint, &fingerprint) {
                    log::debug!("[LOADER] Cache hit for {:?}", key);
                    return Ok(entry.handle.clone());
                }
            }
        }

        log::info!("[LOADER] Decoding {:?}", key);
        let start = Instant::now();

        let bytes = std::fs::read(&key)?;
        let content_hash = hash_bytes(&bytes);
        let decoded = decode_bytes(bytes, &key)?;
        let sample_rate = decoded.sample_rate;
        let buffer = normalize(to_matrix(decoded, &key)?, &key);

        let handle = Arc::new(AudioHandle {
            buffer,
            sample_rate,
            content_hash: content_hash.clone(),
            loaded_at: Instant::now(),
        });
        self.decodes.fetch_add(1, Ordering::Relaxed);

        log::info!(
            "[LOADER] Decoded {:?}: {} frames x {} channels @ {} Hz in {:?}",
            key,
            handle.len(),
            handle.channels(),
            handle.sample_rate,
            start.elapsed()
        );

        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                key.clone(),
                CachedAudio {
                    handle: handle.clone(),
                    fingerprint: fingerprint.clone(),
                },
            );
        }
        if let Ok(mut hashes) = self.hashes.write() {
            hashes.insert(
                key,
                CachedHash {
                    hash: content_hash,
                    fingerprint,
                    computed_at: handle.loaded_at,
                },
            );
        }

        Ok(handle)
    }

    /// Content hash of a recording without decoding it
    ///
    /// Served from the decode cache or the hash cache while fresh; otherwise
    /// the file is read and hashed.
    pub fn content_hash(&self, path: &Path) -> RenderResult<String> {
        let (key, fingerprint) = Self::inspect(path)?;

        if let Ok(entries) = self.entries.read() {
            if let Some(entry) = entries.get(&key) {
                if self.is_fresh(entry.handle.loaded_at, &entry.fingerprint, &fingerprint) {
                    return Ok(entry.handle.content_hash.clone());
                }
            }
        }
        if let Ok(hashes) = self.hashes.read() {
            if let Some(cached) = hashes.get(&key) {
                if self.is_fresh(cached.computed_at, &cached.fingerprint, &fingerprint) {
                    return Ok(cached.hash.clone());
                }
            }
        }

        let hash = hash_bytes(&std::fs::read(&key)?);
        if let Ok(mut hashes) = self.hashes.write() {
            hashes.insert(
                key,
                CachedHash {
                    hash: hash.clone(),
                    fingerprint,
                    computed_at: Instant::now(),
                },
            );
        }
        Ok(hash)
    }

    /// Drop any cached state for one recording
    pub fn invalidate(&self, path: &Path) {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if let Ok(mut entries) = self.entries.write() {
            if entries.remove(&key).is_some() {
                log::info!("[LOADER] Invalidated {:?}", key);
            }
        }
        if let Ok(mut hashes) = self.hashes.write() {
            hashes.remove(&key);
        }
    }

    /// Drop every cached recording
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            let count = entries.len();
            entries.clear();
            log::info!("[LOADER] Cleared {} cached recordings", count);
        }
        if let Ok(mut hashes) = self.hashes.write() {
            hashes.clear();
        }
    }

    /// Number of recordings currently held in memory
    pub fn cached_len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// How many times a file was actually decoded
    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::Relaxed)
    }

    fn is_fresh(&self, loaded_at: Instant, cached: &FileFingerprint, current: &FileFingerprint) -> bool {
        if loaded_at.elapsed() >= self.ttl {
            return false;
        }
        !self.validate_mtime || cached == current
    }

    /// Existence/emptiness checks plus the absolute cache key
    fn inspect(path: &Path) -> RenderResult<(PathBuf, FileFingerprint)> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(RenderError::MissingSourceFile(path.to_path_buf())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RenderError::MissingSourceFile(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.len() == 0 {
            return Err(RenderError::EmptySourceFile(path.to_path_buf()));
        }
        let key = path.canonicalize()?;
        Ok((key, FileFingerprint::of(&metadata)))
    }
}

/// SHA-256 hex digest
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash a file on disk without touching any cache
pub fn hash_file(path: &Path) -> RenderResult<String> {
    Ok(hash_bytes(&std::fs::read(path)?))
}

/// Interleaved samples → (frames × channels), mono replicated to 3 channels
fn to_matrix(decoded: DecodedAudio, path: &Path) -> RenderResult<Array2<f32>> {
    let frames = decoded.frames();

    if decoded.channels == 1 {
        let mono = decoded.samples;
        return Ok(Array2::from_shape_fn((frames, MONO_UPMIX_CHANNELS), |(i, _)| mono[i]));
    }

    Array2::from_shape_vec((frames, decoded.channels), decoded.samples).map_err(|e| {
        RenderError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })
}

/// Divide by the global standard deviation; silent buffers are left alone
fn normalize(mut buffer: Array2<f32>, path: &Path) -> Array2<f32> {
    if buffer.is_empty() {
        return buffer;
    }
    let std = buffer.std(0.0);
    if std > 0.0 && std.is_finite() {
        buffer.mapv_inplace(|s| s / std);
    } else {
        log::warn!("[LOADER] {:?} is silent, skipping normalization", path);
    }
    buffer
}
