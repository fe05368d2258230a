//! One render attempt: extract → validate → render → publish

use std::path::PathBuf;
use std::sync::Arc;

use crate::audio::SourceAudioLoader;
use crate::cache_key::CacheKey;
use crate::config::{resolve_source_path, RenderConfig};
use crate::error::{RenderError, RenderResult};
use crate::render::{publish_atomic, RenderEngine, RenderInput};
use crate::request::RenderRequest;
use crate::segment::SegmentExtractor;

/// Progress milestones reported by [`RenderPipeline::run`]
pub mod milestones {
    pub const QUEUED: u8 = 0;
    pub const STARTED: u8 = 10;
    pub const EXTRACTED: u8 = 30;
    pub const RENDERED: u8 = 90;
    pub const PUBLISHED: u8 = 100;
}

/// The work a scheduler worker performs for one task
pub struct RenderPipeline {
    extractor: SegmentExtractor,
    engine: Arc<dyn RenderEngine>,
    source_root: PathBuf,
    normal_window_ms: f64,
    overview_window_ms: f64,
}

impl RenderPipeline {
    pub fn new(extractor: SegmentExtractor, engine: Arc<dyn RenderEngine>, config: &RenderConfig) -> Self {
        Self {
            extractor,
            engine,
            source_root: config.source_root.clone(),
            normal_window_ms: config.window_ms(false),
            overview_window_ms: config.window_ms(true),
        }
    }

    pub fn loader(&self) -> &Arc<SourceAudioLoader> {
        self.extractor.loader()
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Filesystem path of the request's recording
    pub fn source_path(&self, request: &RenderRequest) -> PathBuf {
        resolve_source_path(&self.source_root, &request.source_path)
    }

    /// Check the caller's hash against the recording without decoding it
    pub fn verify_hash(&self, request: &RenderRequest) -> RenderResult<()> {
        let actual = self.loader().content_hash(&self.source_path(request))?;
        if actual != request.expected_hash {
            return Err(RenderError::HashMismatch {
                expected: request.expected_hash.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Render `request` and publish it at `key`, reporting milestones
    pub fn run(
        &self,
        request: &RenderRequest,
        key: &CacheKey,
        progress: &mut dyn FnMut(u8),
    ) -> RenderResult<()> {
        progress(milestones::STARTED);

        let source = self.source_path(request);
        let window_ms = if request.overview {
            self.overview_window_ms
        } else {
            self.normal_window_ms
        };
        let extracted = self.extractor.extract(&source, request.call_index, window_ms)?;
        progress(milestones::EXTRACTED);

        let input = RenderInput {
            kind: request.kind,
            audio: &extracted.audio,
            segment: extracted.segment,
            channel: request.channel,
            contrast: request.contrast,
            loudness: request.loudness,
            expected_hash: &request.expected_hash,
        };
        input.validate()?;

        let bytes = self.engine.render(&input)?;
        progress(milestones::RENDERED);

        publish_atomic(&key.path, &bytes)?;
        progress(milestones::PUBLISHED);

        log::debug!(
            "[RENDER] {} call {} of {:?} → {:?} ({} bytes)",
            request.kind,
            request.call_index,
            source,
            key.path,
            bytes.len()
        );
        Ok(())
    }

    /// Publish an error artifact for a failed request at `key.error_path()`
    pub fn publish_error(&self, request: &RenderRequest, key: &CacheKey, message: &str) -> Option<PathBuf> {
        let bytes = self.engine.render_error(request.kind, message)?;
        let path = key.error_path();
        match publish_atomic(&path, &bytes) {
            Ok(()) => Some(path),
            Err(e) => {
                log::warn!("[RENDER] Failed to publish error artifact {:?}: {}", path, e);
                None
            }
        }
    }
}

