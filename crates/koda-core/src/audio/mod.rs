//! Source recording loading
//!
//! - [`decode_bytes`] turns raw file bytes into interleaved samples (Symphonia)
//! - [`SourceAudioLoader`] hashes, decodes, upmixes and normalizes recordings
//!   and keeps the result in a freshness-bounded cache

mod decode;
mod loader;

pub use decode::{decode_bytes, DecodedAudio};
pub use loader::{hash_bytes, hash_file, AudioHandle, SourceAudioLoader, MONO_UPMIX_CHANNELS};

#[cfg(test)]
pub(crate) use loader::tests::{tone, write_wav};
