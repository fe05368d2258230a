//! Windowed call extraction
//!
//! Turns "call N of this recording" into a sample range of the decoded
//! buffer: onset/offset seconds → samples, padded on both sides by the view's
//! window and clamped to the buffer.

use std::path::Path;
use std::sync::Arc;

use crate::audio::{AudioHandle, SourceAudioLoader};
use crate::error::{RenderError, RenderResult};

use super::metadata::CallMetadataStore;

/// Sample range of one call plus padding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First sample of the padded range
    pub onset_sample: usize,
    /// One past the last sample of the padded range (never before `onset_sample`)
    pub offset_sample: usize,
    /// Annotated call start, unpadded
    pub call_onset_sample: usize,
    /// Annotated call end, unpadded
    pub call_offset_sample: usize,
    /// Offset at or before onset, or longer than the anomaly threshold
    pub is_anomalous: bool,
}

impl Segment {
    /// Number of samples in the padded range
    pub fn len(&self) -> usize {
        self.offset_sample - self.onset_sample
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A segment together with the recording it was cut from
#[derive(Debug, Clone)]
pub struct ExtractedSegment {
    pub segment: Segment,
    pub sample_rate: u32,
    pub content_hash: String,
    pub audio: Arc<AudioHandle>,
}

/// Cuts call segments out of source recordings
pub struct SegmentExtractor {
    loader: Arc<SourceAudioLoader>,
    store: Arc<dyn CallMetadataStore>,
    anomaly_threshold_secs: f64,
}

impl SegmentExtractor {
    pub fn new(
        loader: Arc<SourceAudioLoader>,
        store: Arc<dyn CallMetadataStore>,
        anomaly_threshold_secs: f64,
    ) -> Self {
        Self {
            loader,
            store,
            anomaly_threshold_secs,
        }
    }

    pub fn loader(&self) -> &Arc<SourceAudioLoader> {
        &self.loader
    }

    /// Extract call `call_index` of `path` with `window_ms` of padding per side
    pub fn extract(&self, path: &Path, call_index: usize, window_ms: f64) -> RenderResult<ExtractedSegment> {
        let metadata = self.store.load(path)?;
        let (onset_secs, offset_secs) = metadata.call(call_index)?;

        let audio = self.loader.load(path)?;
        let segment = compute_segment(
            onset_secs,
            offset_secs,
            audio.sample_rate,
            audio.len(),
            window_ms,
            self.anomaly_threshold_secs,
        )?;

        if segment.is_anomalous {
            log::warn!(
                "[EXTRACT] Call {} of {:?} is anomalous ({:.3}s → {:.3}s)",
                call_index,
                path,
                onset_secs,
                offset_secs
            );
        }

        Ok(ExtractedSegment {
            segment,
            sample_rate: audio.sample_rate,
            content_hash: audio.content_hash.clone(),
            audio,
        })
    }
}

/// Pure segment arithmetic, shared by the extractor and its tests
pub fn compute_segment(
    onset_secs: f64,
    offset_secs: f64,
    sample_rate: u32,
    buffer_len: usize,
    window_ms: f64,
    anomaly_threshold_secs: f64,
) -> RenderResult<Segment> {
    let rate = sample_rate as f64;
    let onset = (onset_secs * rate).round();
    let offset = (offset_secs * rate).round();

    let out_of_bounds = |v: f64| !v.is_finite() || v < 0.0 || v > buffer_len as f64;
    if out_of_bounds(onset) || out_of_bounds(offset) {
        return Err(RenderError::BoundaryInvalid {
            onset: saturating_i64(onset),
            offset: saturating_i64(offset),
            len: buffer_len,
        });
    }

    let call_onset_sample = onset as usize;
    let call_offset_sample = offset as usize;
    let pad = ((window_ms.max(0.0) / 1000.0) * rate).round() as usize;

    let onset_sample = call_onset_sample.saturating_sub(pad);
    let offset_sample = call_offset_sample
        .saturating_add(pad)
        .min(buffer_len)
        .max(onset_sample);

    let duration_secs = (offset - onset) / rate;
    let is_anomalous = call_offset_sample <= call_onset_sample || duration_secs > anomaly_threshold_secs;

    Ok(Segment {
        onset_sample,
        offset_sample,
        call_onset_sample,
        call_offset_sample,
        is_anomalous,
    })
}

fn saturating_i64(v: f64) -> i64 {
    if v.is_nan() {
        -1
    } else {
        v as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{tone, write_wav};
    use crate::segment::{CallMetadata, InMemoryCallMetadataStore, JsonCallMetadataStore};
    use std::time::Duration;

    const RATE: u32 = 10_000;

    #[test]
    fn test_padding_applied_and_clamped() {
        // 10 ms at 10 kHz = 100 samples of padding
        let seg = compute_segment(0.5, 0.6, RATE, 20_000, 10.0, 1.0).unwrap();
        assert_eq!(seg.call_onset_sample, 5000);
        assert_eq!(seg.call_offset_sample, 6000);
        assert_eq!(seg.onset_sample, 4900);
        assert_eq!(seg.offset_sample, 6100);
        assert!(!seg.is_anomalous);

        let edge = compute_segment(0.005, 1.999, RATE, 20_000, 10.0, 1.0).unwrap();
        assert_eq!(edge.onset_sample, 0);
        assert_eq!(edge.offset_sample, 20_000);
    }

    #[test]
    fn test_boundary_beyond_buffer_rejected() {
        let err = compute_segment(1.0, 2.5, RATE, 20_000, 10.0, 1.0).unwrap_err();
        assert!(matches!(err, RenderError::BoundaryInvalid { offset: 25_000, len: 20_000, .. }));

        let err = compute_segment(-0.1, 0.2, RATE, 20_000, 10.0, 1.0).unwrap_err();
        assert!(matches!(err, RenderError::BoundaryInvalid { .. }));

        let err = compute_segment(f64::NAN, 0.2, RATE, 20_000, 10.0, 1.0).unwrap_err();
        assert!(matches!(err, RenderError::BoundaryInvalid { .. }));
    }

    #[test]
    fn test_long_call_flagged_but_extracted() {
        let seg = compute_segment(0.1, 2.1, RATE, 30_000, 10.0, 1.0).unwrap();
        assert!(seg.is_anomalous);
        assert_eq!(seg.len(), 20_000 + 200);
    }

    #[test]
    fn test_reversed_call_is_anomalous_and_well_formed() {
        let seg = compute_segment(0.6, 0.5, RATE, 20_000, 0.0, 1.0).unwrap();
        assert!(seg.is_anomalous);
        assert!(seg.offset_sample >= seg.onset_sample);
        assert!(seg.offset_sample <= 20_000);

        let zero = compute_segment(0.5, 0.5, RATE, 20_000, 0.0, 1.0).unwrap();
        assert!(zero.is_anomalous);
        assert!(zero.is_empty());
    }

    #[test]
    fn test_indices_never_leave_buffer() {
        let len = 12_345;
        for (on, off) in [(0.0, 0.0), (0.0, 1.2345), (1.2, 0.1), (0.6, 0.61), (1.2345, 1.2345)] {
            for window in [0.0, 5.0, 500.0, 10_000.0] {
                let seg = compute_segment(on, off, RATE, len, window, 1.0).unwrap();
                assert!(seg.onset_sample <= seg.offset_sample);
                assert!(seg.offset_sample <= len, "{on} {off} {window}");
            }
        }
    }

    fn extractor_with(store: Arc<dyn CallMetadataStore>) -> SegmentExtractor {
        let loader = Arc::new(SourceAudioLoader::new(Duration::from_secs(300), true));
        SegmentExtractor::new(loader, store, 1.0)
    }

    #[test]
    fn test_extract_from_recording() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("rec.wav");
        write_wav(&source, 1, RATE, &tone(20_000, 50));
        std::fs::write(
            JsonCallMetadataStore::metadata_path(&source),
            r#"{"onsets": [0.2, 1.0], "offsets": [0.3, 1.2]}"#,
        )
        .unwrap();

        let extractor = extractor_with(Arc::new(JsonCallMetadataStore));
        let extracted = extractor.extract(&source, 1, 10.0).unwrap();

        assert_eq!(extracted.sample_rate, RATE);
        assert_eq!(extracted.segment.onset_sample, 9_900);
        assert_eq!(extracted.segment.offset_sample, 12_100);
        assert_eq!(extracted.content_hash, crate::audio::hash_file(&source).unwrap());

        let err = extractor.extract(&source, 2, 10.0).unwrap_err();
        assert!(matches!(err, RenderError::IndexOutOfRange { index: 2, len: 2 }));
    }

    #[test]
    fn test_metadata_checked_before_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("rec.wav");
        write_wav(&source, 1, RATE, &tone(1_000, 50));

        let store = Arc::new(InMemoryCallMetadataStore::new());
        store.insert(
            source.clone(),
            CallMetadata {
                onsets: vec![],
                offsets: vec![],
            },
        );
        let extractor = extractor_with(store);

        assert!(matches!(
            extractor.extract(&source, 0, 10.0),
            Err(RenderError::IndexOutOfRange { .. })
        ));
        assert_eq!(extractor.loader().decode_count(), 0);
    }
}
