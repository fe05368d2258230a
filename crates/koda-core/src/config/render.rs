//! Render pipeline configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::paths::default_temp_root;

const MAX_AUDIO_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
const MAX_RETRY_BACKOFF_MS: u64 = 60_000;
const MAX_DEFAULT_WAIT_MS: u64 = 10 * 60 * 1000;
const MAX_TASK_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Configuration for the render cache and task scheduler
///
/// Every field has a default, so a partial YAML file only needs to name the
/// settings it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Artifact cache root (`<os temp>/battykoda_temp` by default)
    pub temp_root: PathBuf,

    /// Filesystem root that logical source paths are resolved against
    pub source_root: PathBuf,

    /// How long a decoded recording stays in memory
    pub audio_cache_ttl_secs: u64,

    /// Also drop a cached recording when the file's mtime or length changed
    pub validate_source_mtime: bool,

    /// Padding on each side of a call for the normal view
    pub normal_window_ms: f64,

    /// Padding on each side of a call for the overview
    pub overview_window_ms: f64,

    /// Calls longer than this are flagged anomalous
    pub anomaly_threshold_secs: f64,

    /// Render worker pool size
    pub worker_threads: usize,

    /// Total pipeline attempts for transient failures (first try included)
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles for every later one
    pub retry_backoff_ms: u64,

    /// How long a synchronous caller waits before getting a pollable handle
    pub default_wait_ms: u64,

    /// How many following calls to prefetch after a render or cache hit
    pub prefetch_ahead: usize,

    /// Finished tasks stay pollable this long unless forgotten earlier
    pub task_retention_secs: u64,

    pub spectrogram: SpectrogramConfig,

    pub snippet: SnippetConfig,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            temp_root: default_temp_root(),
            source_root: PathBuf::from("/"),
            audio_cache_ttl_secs: 300,
            validate_source_mtime: true,
            normal_window_ms: 10.0,
            overview_window_ms: 150.0,
            anomaly_threshold_secs: 1.0,
            worker_threads: 4,
            max_attempts: 3,
            retry_backoff_ms: 250,
            default_wait_ms: 10_000,
            prefetch_ahead: 2,
            task_retention_secs: 600,
            spectrogram: SpectrogramConfig::default(),
            snippet: SnippetConfig::default(),
        }
    }
}

impl RenderConfig {
    /// Clamp values to workable ranges
    pub fn validate(&mut self) {
        self.worker_threads = self.worker_threads.clamp(1, 64);
        self.max_attempts = self.max_attempts.clamp(1, 10);
        self.normal_window_ms = self.normal_window_ms.max(0.0);
        self.overview_window_ms = self.overview_window_ms.max(self.normal_window_ms);
        self.prefetch_ahead = self.prefetch_ahead.min(32);
        self.audio_cache_ttl_secs = self.audio_cache_ttl_secs.min(MAX_AUDIO_CACHE_TTL_SECS);
        self.retry_backoff_ms = self.retry_backoff_ms.min(MAX_RETRY_BACKOFF_MS);
        self.default_wait_ms = self.default_wait_ms.min(MAX_DEFAULT_WAIT_MS);
        self.task_retention_secs = self.task_retention_secs.clamp(1, MAX_TASK_RETENTION_SECS);
        if !self.anomaly_threshold_secs.is_finite() || self.anomaly_threshold_secs <= 0.0 {
            self.anomaly_threshold_secs = 1.0;
        }
        self.spectrogram.validate();
        self.snippet.validate();
    }

    /// Padding window for the requested view
    pub fn window_ms(&self, overview: bool) -> f64 {
        if overview {
            self.overview_window_ms
        } else {
            self.normal_window_ms
        }
    }

    pub fn audio_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.audio_cache_ttl_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn default_wait(&self) -> Duration {
        Duration::from_millis(self.default_wait_ms)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }
}

/// Spectrogram analysis and image settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrogramConfig {
    /// FFT size in samples (Hann window of the same length)
    pub n_fft: usize,
    /// Hop between frames in samples
    pub hop: usize,
    /// Plot area width in pixels (axes are added around it)
    pub width: u32,
    /// Plot area height in pixels
    pub height: u32,
}

impl Default for SpectrogramConfig {
    fn default() -> Self {
        Self {
            n_fft: 512,
            hop: 128, // 75% overlap
            width: 640,
            height: 320,
        }
    }
}

impl SpectrogramConfig {
    pub fn validate(&mut self) {
        self.n_fft = self.n_fft.clamp(32, 8192).next_power_of_two();
        self.hop = self.hop.clamp(1, self.n_fft);
        self.width = self.width.clamp(64, 4096);
        self.height = self.height.clamp(32, 4096);
    }
}

/// Audio snippet settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnippetConfig {
    /// Playback slow-down factor; ultrasonic calls are often time-expanded
    /// so they fall into the audible range
    pub time_expansion: u32,
}

impl Default for SnippetConfig {
    fn default() -> Self {
        Self { time_expansion: 1 }
    }
}

impl SnippetConfig {
    pub fn validate(&mut self) {
        self.time_expansion = self.time_expansion.clamp(1, 64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = RenderConfig::default();
        assert_eq!(config.audio_cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.max_attempts, 3);
        assert!(config.overview_window_ms > config.normal_window_ms);
    }

    #[test]
    fn test_validate_clamps_out_of_range_values() {
        let mut config = RenderConfig {
            worker_threads: 0,
            max_attempts: 0,
            overview_window_ms: 1.0,
            normal_window_ms: 20.0,
            ..RenderConfig::default()
        };
        config.spectrogram.n_fft = 300;
        config.spectrogram.hop = 10_000;
        config.validate();

        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.overview_window_ms, 20.0);
        assert_eq!(config.spectrogram.n_fft, 512);
        assert_eq!(config.spectrogram.hop, 512);
    }

    #[test]
    fn test_validate_bounds_timing_values() {
        let mut config = RenderConfig {
            audio_cache_ttl_secs: u64::MAX,
            retry_backoff_ms: u64::MAX,
            default_wait_ms: u64::MAX,
            task_retention_secs: 0,
            anomaly_threshold_secs: f64::NAN,
            ..RenderConfig::default()
        };
        config.validate();

        assert_eq!(config.retry_backoff(), Duration::from_secs(60));
        assert_eq!(config.default_wait(), Duration::from_secs(600));
        assert_eq!(config.audio_cache_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.task_retention(), Duration::from_secs(1));
        assert_eq!(config.anomaly_threshold_secs, 1.0);

        // Backoff for the last permitted attempt stays representable
        let last = config.retry_backoff().saturating_mul(2u32.saturating_pow(config.max_attempts - 1));
        assert!(last >= config.retry_backoff());
    }

    #[test]
    fn test_window_preset_selection() {
        let config = RenderConfig::default();
        assert_eq!(config.window_ms(false), config.normal_window_ms);
        assert_eq!(config.window_ms(true), config.overview_window_ms);
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let config: RenderConfig = serde_yaml::from_str("prefetch_ahead: 7\n").unwrap();
        assert_eq!(config.prefetch_ahead, 7);
        assert_eq!(config.spectrogram.n_fft, 512);
    }
}
