//! Koda Core - Render cache and background generation pipeline for call annotation
//!
//! Spectrograms and audio snippets of annotated calls are rendered on demand,
//! cached on disk under deterministic keys and produced by a retrying worker
//! pool that prefetches the calls an annotator is likely to open next.

pub mod audio;
pub mod cache_key;
pub mod config;
pub mod error;
pub mod render;
pub mod request;
pub mod segment;
pub mod services;

pub use cache_key::{CacheKey, CacheKeyResolver};
pub use error::{RenderError, RenderResult};
pub use request::{ArtifactKind, RenderRequest};
pub use services::{AwaitOutcome, RenderService, TaskHandle, TaskState, TaskStatus};
