//! Artifact rendering
//!
//! [`RenderEngine`] is the seam between the scheduler and the actual
//! pixel/sample work. The production engine, [`ArtifactRenderer`], draws PNG
//! spectrograms and encodes WAV snippets; tests substitute engines that
//! fail, count invocations or block on demand.
//!
//! Rendered bytes reach the cache only through [`publish_atomic`].

mod canvas;
mod publish;
mod snippet;
mod spectrogram;

pub use canvas::colormap;
pub use publish::publish_atomic;
pub use snippet::render_snippet;
pub use spectrogram::{
    axis_labels, contrast_curve, image_size, power_spectrogram, render_error_image,
    render_spectrogram, segment_labels, AxisLabels, SENTINEL_LABEL,
};

use crate::audio::AudioHandle;
use crate::config::{SnippetConfig, SpectrogramConfig};
use crate::error::{RenderError, RenderResult};
use crate::request::ArtifactKind;
use crate::segment::Segment;

/// Everything an engine needs to produce one artifact
#[derive(Debug, Clone, Copy)]
pub struct RenderInput<'a> {
    pub kind: ArtifactKind,
    pub audio: &'a AudioHandle,
    pub segment: Segment,
    pub channel: usize,
    pub contrast: f32,
    pub loudness: f32,
    /// Content hash the caller expects the source to have
    pub expected_hash: &'a str,
}

impl RenderInput<'_> {
    /// Reject inputs that can never render correctly
    pub fn validate(&self) -> RenderResult<()> {
        if self.channel >= self.audio.channels() {
            return Err(RenderError::ChannelOutOfRange {
                channel: self.channel,
                channels: self.audio.channels(),
            });
        }
        if self.expected_hash != self.audio.content_hash {
            return Err(RenderError::HashMismatch {
                expected: self.expected_hash.to_string(),
                actual: self.audio.content_hash.clone(),
            });
        }
        Ok(())
    }
}

/// Turns a validated segment into artifact bytes
///
/// Implementations must be pure with respect to the filesystem: the
/// scheduler owns publication.
pub trait RenderEngine: Send + Sync {
    /// Render the artifact for `input`
    fn render(&self, input: &RenderInput<'_>) -> RenderResult<Vec<u8>>;

    /// Render an error artifact carrying `message`
    ///
    /// `None` means the engine has no error representation for `kind` and
    /// nothing is published.
    fn render_error(&self, kind: ArtifactKind, message: &str) -> Option<Vec<u8>>;

    /// Engine name for logging
    fn name(&self) -> &'static str;
}

/// Production engine: PNG spectrograms and WAV snippets
#[derive(Debug, Clone, Default)]
pub struct ArtifactRenderer {
    spectrogram: SpectrogramConfig,
    snippet: SnippetConfig,
}

impl ArtifactRenderer {
    pub fn new(spectrogram: SpectrogramConfig, snippet: SnippetConfig) -> Self {
        Self { spectrogram, snippet }
    }
}

impl RenderEngine for ArtifactRenderer {
    fn render(&self, input: &RenderInput<'_>) -> RenderResult<Vec<u8>> {
        input.validate()?;
        match input.kind {
            ArtifactKind::Spectrogram => render_spectrogram(input, &self.spectrogram),
            ArtifactKind::AudioSnippet => render_snippet(input, &self.snippet),
        }
    }

    fn render_error(&self, _kind: ArtifactKind, message: &str) -> Option<Vec<u8>> {
        // Snippet errors are shown by the player as an image too
        match render_error_image(message, &self.spectrogram) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::error!("[RENDER] Failed to draw error artifact: {}", e);
                None
            }
        }
    }

    fn name(&self) -> &'static str {
        "artifact"
    }
}
