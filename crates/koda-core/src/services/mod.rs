//! Background render services
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  submit / await / poll  ┌───────────────┐   rayon pool
//! │ RenderService│ ──────────────────────► │ TaskScheduler │ ──► render-worker-N
//! └──────────────┘                         └───────────────┘       │
//!        │                                   ▲        │            │ extract → render
//!        │ Subscribe                Prefetch │        │ Publish    │ → publish
//!        ▼                                   │        ▼            ▼
//! ┌──────────────────┐              ┌──────────────────────┐   <temp_root>/…
//! │     Event Bus    │ ◄─────────── │ PrefetchCoordinator  │
//! │   (crossbeam)    │              │   (own thread)       │
//! └──────────────────┘              └──────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use koda_core::config::RenderConfig;
//! use koda_core::segment::JsonCallMetadataStore;
//! use koda_core::services::{AwaitOutcome, RenderService};
//! use koda_core::request::{parse_query_string, ArtifactKind};
//!
//! let service = RenderService::spawn(RenderConfig::default(), Arc::new(JsonCallMetadataStore)).unwrap();
//! let params = parse_query_string("sourcePath=home/alice/rec.wav&channel=0&call=0&overview=0&contrast=4&hash=ab12&numcalls=10");
//! match service.request_query(ArtifactKind::Spectrogram, &params, None).unwrap() {
//!     AwaitOutcome::Ready(path) => println!("{}", path.display()),
//!     AwaitOutcome::Pending(handle) => println!("poll task {}", handle.id),
//!     AwaitOutcome::Failed(failure) => eprintln!("{}", failure.message),
//! }
//! ```

pub mod messages;
mod pipeline;
mod prefetch;
mod scheduler;
mod service;

pub use messages::{
    // Commands
    PrefetchCommand,
    // Events
    RenderEvent,
    // Task state
    TaskId, TaskState, TaskStatus,
    // Infrastructure
    EventBus, ServiceHandle,
};
pub use pipeline::{milestones, RenderPipeline};
pub use prefetch::{prefetch_indices, PrefetchCoordinator};
pub use scheduler::{AwaitOutcome, SubmitOrigin, TaskFailure, TaskHandle, TaskScheduler, WeakScheduler};
pub use service::RenderService;
