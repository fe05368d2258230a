//! Audio snippet rendering: the call's samples as a 16-bit WAV

use std::io::Cursor;

use ndarray::s;

use super::RenderInput;
use crate::config::SnippetConfig;
use crate::error::{RenderError, RenderResult};

/// Peak-normalize the segment, scale by loudness and encode as WAV
///
/// The output rate is the source rate divided by the time-expansion factor.
pub fn render_snippet(input: &RenderInput<'_>, config: &SnippetConfig) -> RenderResult<Vec<u8>> {
    let segment = input.segment;
    let channel = input.audio.channel(input.channel).ok_or(RenderError::ChannelOutOfRange {
        channel: input.channel,
        channels: input.audio.channels(),
    })?;
    let samples = channel.slice(s![segment.onset_sample..segment.offset_sample]);

    let peak = samples.iter().fold(0.0f32, |acc, &s| acc.max(s.abs()));
    let gain = if peak > 0.0 {
        input.loudness.clamp(0.0, 1.0) / peak
    } else {
        0.0
    };

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: (input.audio.sample_rate / config.time_expansion.max(1)).max(1),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let wav_err = |e: hound::Error| RenderError::RenderFailure(format!("WAV encode failed: {}", e));

    let mut bytes = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec).map_err(wav_err)?;
        for &sample in samples.iter() {
            let scaled = (sample * gain).clamp(-1.0, 1.0) * i16::MAX as f32;
            writer.write_sample(scaled.round() as i16).map_err(wav_err)?;
        }
        writer.finalize().map_err(wav_err)?;
    }

    Ok(bytes)
}
