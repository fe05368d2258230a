//! Render requests and wire-level parameter parsing
//!
//! The web layer hands over query parameters as strings:
//!
//! ```text
//! sourcePath=home/alice/bats/rec.wav&channel=0&call=3&overview=0&contrast=4&hash=ab12..&numcalls=40
//! ```
//!
//! Audio snippets additionally carry `loudness`. Every parameter is required.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RenderError, RenderResult};

/// Which artifact a request produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// PNG spectrogram image
    Spectrogram,
    /// WAV audio snippet of the call
    AudioSnippet,
}

impl ArtifactKind {
    /// File extension of the published artifact
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Spectrogram => "png",
            Self::AudioSnippet => "wav",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spectrogram => write!(f, "spectrogram"),
            Self::AudioSnippet => write!(f, "audio"),
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spectrogram" | "spec" | "png" => Ok(Self::Spectrogram),
            "audio" | "snippet" | "wav" => Ok(Self::AudioSnippet),
            _ => Err(RenderError::InvalidParameter {
                name: "kind",
                value: s.to_string(),
            }),
        }
    }
}

/// A request for one artifact of one call in one recording
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub kind: ArtifactKind,
    /// Logical source path as sent by the web layer
    pub source_path: String,
    pub channel: usize,
    pub call_index: usize,
    /// Wide-window render with more time context
    pub overview: bool,
    /// Contrast exponent for `arctan(10^contrast * power)`
    pub contrast: f32,
    /// Playback gain for audio snippets (ignored for spectrograms)
    pub loudness: f32,
    /// Content hash the caller believes the source has
    pub expected_hash: String,
    /// Number of calls annotated in the source
    pub total_calls: usize,
}

impl RenderRequest {
    /// Build a request from wire-level query parameters
    pub fn from_query(kind: ArtifactKind, params: &HashMap<String, String>) -> RenderResult<Self> {
        let source_path = required(params, "sourcePath")?.to_string();
        let channel = parse_number(params, "channel")?;
        let call_index = parse_number(params, "call")?;
        let overview = parse_flag(required(params, "overview")?)
            .ok_or_else(|| invalid(params, "overview"))?;
        let contrast: f32 = parse_number(params, "contrast")?;
        let expected_hash = required(params, "hash")?.to_string();
        let total_calls = parse_number(params, "numcalls")?;

        let loudness: f32 = match kind {
            ArtifactKind::AudioSnippet => parse_number(params, "loudness")?,
            ArtifactKind::Spectrogram => 1.0,
        };

        if !contrast.is_finite() {
            return Err(invalid(params, "contrast"));
        }
        if !loudness.is_finite() {
            return Err(invalid(params, "loudness"));
        }

        Ok(Self {
            kind,
            source_path,
            channel,
            call_index,
            overview,
            contrast,
            loudness,
            expected_hash,
            total_calls,
        })
    }

    /// Parameters that identify the artifact, in the order they are encoded
    ///
    /// The content hash is part of the key, so an edited recording never
    /// resolves to an artifact rendered from its previous contents.
    pub fn key_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("call", self.call_index.to_string()),
            ("channel", self.channel.to_string()),
            ("contrast", self.contrast.to_string()),
            ("hash", self.expected_hash.clone()),
            ("numcalls", self.total_calls.to_string()),
            ("overview", if self.overview { "1" } else { "0" }.to_string()),
        ];
        if self.kind == ArtifactKind::AudioSnippet {
            params.push(("loudness", self.loudness.to_string()));
        }
        params
    }

    /// True once every annotated call has been handed out
    pub fn is_end_of_sequence(&self) -> bool {
        self.call_index >= self.total_calls
    }

    /// Same parameters, different call
    pub fn for_call(&self, call_index: usize) -> Self {
        Self {
            call_index,
            ..self.clone()
        }
    }
}

/// Parse `a=b&c=d` into a map, percent-decoding keys and values
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// `"0"`/`"1"` or any casing of `true`/`false`
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn required<'a>(params: &'a HashMap<String, String>, name: &'static str) -> RenderResult<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or(RenderError::MissingParameter(name))
}

fn parse_number<T: FromStr>(params: &HashMap<String, String>, name: &'static str) -> RenderResult<T> {
    required(params, name)?
        .trim()
        .parse()
        .map_err(|_| invalid(params, name))
}

fn invalid(params: &HashMap<String, String>, name: &'static str) -> RenderError {
    RenderError::InvalidParameter {
        name,
        value: params.get(name).cloned().unwrap_or_default(),
    }
}
