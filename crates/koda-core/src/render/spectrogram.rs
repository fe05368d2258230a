//! Spectrogram rendering
//!
//! STFT of one channel → power → `arctan(10^contrast * power)` → colormap,
//! painted into a plot area with time and frequency axes.

use std::f32::consts::PI;

use ndarray::s;
use rayon::prelude::*;
use realfft::RealFftPlanner;

use super::canvas::{colormap, text_width, Canvas, GLYPH_HEIGHT};
use super::RenderInput;
use crate::config::SpectrogramConfig;
use crate::error::{RenderError, RenderResult};

/// Printed in place of axis values for anomalous calls
pub const SENTINEL_LABEL: &str = "???";

const MARGIN_LEFT: u32 = 44;
const MARGIN_RIGHT: u32 = 10;
const MARGIN_TOP: u32 = 8;
const MARGIN_BOTTOM: u32 = 28;
const LABEL_SCALE: u32 = 2;

const BACKGROUND: [u8; 3] = [16, 16, 20];
const AXIS_COLOR: [u8; 3] = [210, 210, 210];
const MARKER_COLOR: [u8; 3] = [120, 220, 120];
const ANOMALY_COLOR: [u8; 3] = [230, 40, 40];

/// Full image size for a plot area of `config.width × config.height`
pub fn image_size(config: &SpectrogramConfig) -> (u32, u32) {
    (
        config.width + MARGIN_LEFT + MARGIN_RIGHT,
        config.height + MARGIN_TOP + MARGIN_BOTTOM,
    )
}

/// Tick and unit labels for both axes
#[derive(Debug, Clone, PartialEq)]
pub struct AxisLabels {
    /// Start, middle and end of the segment
    pub time_ticks: [String; 3],
    pub time_unit: String,
    /// 0, half Nyquist, Nyquist
    pub frequency_ticks: [String; 3],
    pub frequency_unit: String,
}

/// Axis labels for a segment of `duration_ms` at a given Nyquist frequency
///
/// Anomalous segments get [`SENTINEL_LABEL`] everywhere: their time extent
/// is not trustworthy, and the marked-up image must not pass for a normal one.
pub fn axis_labels(duration_ms: f64, nyquist_khz: f64, anomalous: bool) -> AxisLabels {
    if anomalous {
        let sentinel = || SENTINEL_LABEL.to_string();
        return AxisLabels {
            time_ticks: [sentinel(), sentinel(), sentinel()],
            time_unit: sentinel(),
            frequency_ticks: [sentinel(), sentinel(), sentinel()],
            frequency_unit: sentinel(),
        };
    }

    AxisLabels {
        time_ticks: [
            format_tick(0.0),
            format_tick(duration_ms / 2.0),
            format_tick(duration_ms),
        ],
        time_unit: "MS".to_string(),
        frequency_ticks: [
            format_tick(0.0),
            format_tick(nyquist_khz / 2.0),
            format_tick(nyquist_khz),
        ],
        frequency_unit: "KHZ".to_string(),
    }
}

/// Axis labels for the padded segment an input covers
pub fn segment_labels(input: &RenderInput<'_>) -> AxisLabels {
    let sample_rate = input.audio.sample_rate as f64;
    let duration_ms = input.segment.len() as f64 / sample_rate * 1000.0;
    axis_labels(duration_ms, sample_rate / 2000.0, input.segment.is_anomalous)
}

fn format_tick(value: f64) -> String {
    if (value - value.round()).abs() < 0.05 {
        format!("{:.0}", value)
    } else {
        format!("{:.1}", value)
    }
}

/// Power spectrogram, `frames × (n_fft / 2 + 1)`
///
/// Frames are transformed in parallel; each rayon job keeps its own
/// scratch buffers.
pub fn power_spectrogram(signal: &[f32], n_fft: usize, hop: usize) -> RenderResult<Vec<Vec<f32>>> {
    if n_fft == 0 || hop == 0 {
        return Err(RenderError::RenderFailure(format!(
            "invalid STFT geometry: n_fft={}, hop={}",
            n_fft, hop
        )));
    }

    let num_samples = signal.len();

    // Pad signal for complete frames
    let padded_len = ((num_samples + n_fft - 1) / hop) * hop + n_fft;
    let mut padded = vec![0.0f32; padded_len];
    padded[..num_samples].copy_from_slice(signal);

    let num_frames = (padded_len - n_fft) / hop + 1;

    let mut planner = RealFftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n_fft);

    let window: Vec<f32> = (0..n_fft)
        .map(|i| {
            let phase = 2.0 * PI * i as f32 / n_fft as f32;
            0.5 * (1.0 - phase.cos())
        })
        .collect();

    let norm = 1.0 / n_fft as f32;

    (0..num_frames)
        .into_par_iter()
        .map_init(
            || (fft.make_input_vec(), fft.make_output_vec(), fft.make_scratch_vec()),
            |(frame_buf, spectrum, scratch), frame_idx| -> RenderResult<Vec<f32>> {
                let start = frame_idx * hop;
                for i in 0..n_fft {
                    frame_buf[i] = padded[start + i] * window[i];
                }

                fft.process_with_scratch(frame_buf, spectrum, scratch)
                    .map_err(|e| RenderError::RenderFailure(format!("FFT failed: {:?}", e)))?;

                Ok(spectrum.iter().map(|c| c.norm_sqr() * norm).collect())
            },
        )
        .collect()
}

/// Map power to [0, 1) with the contrast curve
pub fn contrast_curve(power: f32, contrast: f32) -> f32 {
    let scale = 10f32.powf(contrast);
    (scale * power).atan() / (PI / 2.0)
}

/// Render the input's segment as a PNG spectrogram
pub fn render_spectrogram(input: &RenderInput<'_>, config: &SpectrogramConfig) -> RenderResult<Vec<u8>> {
    let segment = input.segment;
    let channel = input.audio.channel(input.channel).ok_or(RenderError::ChannelOutOfRange {
        channel: input.channel,
        channels: input.audio.channels(),
    })?;
    let samples = channel
        .slice(s![segment.onset_sample..segment.offset_sample])
        .to_vec();

    let power = power_spectrogram(&samples, config.n_fft, config.hop)?;
    let num_frames = power.len();
    let num_bins = power.first().map(Vec::len).unwrap_or(0);
    if num_frames == 0 || num_bins == 0 {
        return Err(RenderError::RenderFailure("empty spectrogram".to_string()));
    }

    let (width, height) = image_size(config);
    let mut canvas = Canvas::new(width, height, BACKGROUND);
    let (plot_w, plot_h) = (config.width, config.height);

    for px in 0..plot_w {
        let frame = &power[(px as usize * num_frames) / plot_w as usize];
        for py in 0..plot_h {
            let bin = ((plot_h - 1 - py) as usize * num_bins) / plot_h as usize;
            let value = contrast_curve(frame[bin], input.contrast);
            canvas.put(MARGIN_LEFT + px, MARGIN_TOP + py, colormap(value));
        }
    }

    // Annotated call bounds inside the padded window
    if !segment.is_empty() {
        for call_sample in [segment.call_onset_sample, segment.call_offset_sample] {
            if call_sample < segment.onset_sample || call_sample > segment.offset_sample {
                continue;
            }
            let rel = (call_sample - segment.onset_sample) as u64 * plot_w as u64 / segment.len() as u64;
            let x = MARGIN_LEFT + (rel as u32).min(plot_w - 1);
            for y in (MARGIN_TOP..MARGIN_TOP + plot_h).step_by(6) {
                canvas.vline(x, y, (y + 2).min(MARGIN_TOP + plot_h - 1), MARKER_COLOR);
            }
        }
    }

    draw_axes(&mut canvas, plot_w, plot_h, &segment_labels(input));

    if segment.is_anomalous {
        canvas.outline(MARGIN_LEFT, MARGIN_TOP, plot_w, plot_h, 3, ANOMALY_COLOR);
    }

    canvas.to_png()
}

fn draw_axes(canvas: &mut Canvas, plot_w: u32, plot_h: u32, labels: &AxisLabels) {
    let left = MARGIN_LEFT - 1;
    let bottom = MARGIN_TOP + plot_h;
    let right = MARGIN_LEFT + plot_w - 1;
    let glyph_h = GLYPH_HEIGHT * LABEL_SCALE;

    canvas.vline(left, MARGIN_TOP, bottom, AXIS_COLOR);
    canvas.hline(left, right, bottom, AXIS_COLOR);

    // Time axis: ticks at start, middle, end
    let tick_xs = [MARGIN_LEFT, MARGIN_LEFT + plot_w / 2, right];
    for (i, (&x, label)) in tick_xs.iter().zip(&labels.time_ticks).enumerate() {
        canvas.vline(x, bottom, bottom + 3, AXIS_COLOR);
        let w = text_width(label, LABEL_SCALE);
        let tx = match i {
            0 => x,
            1 => x.saturating_sub(w / 2),
            _ => x.saturating_sub(w),
        };
        canvas.text(tx, bottom + 5, label, LABEL_SCALE, AXIS_COLOR);
    }
    let unit_w = text_width(&labels.time_unit, LABEL_SCALE);
    canvas.text(
        MARGIN_LEFT + plot_w / 4 - unit_w / 2,
        bottom + 5,
        &labels.time_unit,
        LABEL_SCALE,
        AXIS_COLOR,
    );

    // Frequency axis: 0 at the bottom, Nyquist at the top
    let tick_ys = [bottom - 1, MARGIN_TOP + plot_h / 2, MARGIN_TOP];
    for (i, (&y, label)) in tick_ys.iter().zip(&labels.frequency_ticks).enumerate() {
        canvas.hline(left.saturating_sub(3), left, y, AXIS_COLOR);
        let w = text_width(label, LABEL_SCALE);
        let ty = match i {
            0 => y.saturating_sub(glyph_h),
            1 => y.saturating_sub(glyph_h / 2),
            _ => y,
        };
        canvas.text(left.saturating_sub(5 + w), ty, label, LABEL_SCALE, AXIS_COLOR);
    }
    let unit_w = text_width(&labels.frequency_unit, LABEL_SCALE);
    canvas.text(
        left.saturating_sub(5 + unit_w),
        MARGIN_TOP + plot_h / 4,
        &labels.frequency_unit,
        LABEL_SCALE,
        AXIS_COLOR,
    );
}

/// Full-size error image: dark red background with the message as text
pub fn render_error_image(message: &str, config: &SpectrogramConfig) -> RenderResult<Vec<u8>> {
    const ERROR_BACKGROUND: [u8; 3] = [96, 12, 12];
    const TEXT_COLOR: [u8; 3] = [255, 235, 235];

    let (width, height) = image_size(config);
    let mut canvas = Canvas::new(width, height, ERROR_BACKGROUND);

    let scale = LABEL_SCALE;
    let line_h = (GLYPH_HEIGHT + 2) * scale;
    let max_chars = ((width - 16) / super::canvas::text_advance(scale)) as usize;

    canvas.text(8, 8, "RENDER ERROR", scale + 1, TEXT_COLOR);
    let mut y = 8 + (GLYPH_HEIGHT + 3) * (scale + 1);
    for line in super::canvas::wrap(message, max_chars) {
        if y + line_h > height {
            break;
        }
        canvas.text(8, y, &line, scale, TEXT_COLOR);
        y += line_h;
    }

    canvas.to_png()
}
