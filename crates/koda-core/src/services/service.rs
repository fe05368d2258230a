//! RenderService: the assembled render pipeline behind one handle

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;

use super::messages::{EventBus, RenderEvent, TaskId, TaskState};
use super::pipeline::RenderPipeline;
use super::prefetch::PrefetchCoordinator;
use super::scheduler::{AwaitOutcome, TaskHandle, TaskScheduler};
use crate::audio::SourceAudioLoader;
use crate::config::RenderConfig;
use crate::error::RenderResult;
use crate::render::{ArtifactRenderer, RenderEngine};
use crate::request::{ArtifactKind, RenderRequest};
use crate::segment::{CallMetadataStore, SegmentExtractor};

/// Loader, extractor, engine, scheduler and prefetcher wired together
pub struct RenderService {
    config: RenderConfig,
    scheduler: TaskScheduler,
    prefetch: PrefetchCoordinator,
    events: EventBus,
}

impl RenderService {
    /// Start the service with the production [`ArtifactRenderer`]
    pub fn spawn(config: RenderConfig, store: Arc<dyn CallMetadataStore>) -> RenderResult<Self> {
        let engine = Arc::new(ArtifactRenderer::new(
            config.spectrogram.clone(),
            config.snippet.clone(),
        ));
        Self::with_engine(config, store, engine)
    }

    /// Start the service with a custom engine
    pub fn with_engine(
        mut config: RenderConfig,
        store: Arc<dyn CallMetadataStore>,
        engine: Arc<dyn RenderEngine>,
    ) -> RenderResult<Self> {
        config.validate();

        let loader = Arc::new(SourceAudioLoader::from_config(&config));
        let extractor = SegmentExtractor::new(loader, store, config.anomaly_threshold_secs);
        let pipeline = RenderPipeline::new(extractor, engine, &config);

        let events = EventBus::default();
        let scheduler = TaskScheduler::new(&config, pipeline, events.clone())?;
        events.publish(RenderEvent::ServiceStarted {
            service_name: "TaskScheduler".to_string(),
        });
        let prefetch = PrefetchCoordinator::spawn(&scheduler, events.clone())?;

        log::info!("[RENDER] Service started (cache root {:?})", config.temp_root);

        Ok(Self {
            config,
            scheduler,
            prefetch,
            events,
        })
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn loader(&self) -> &Arc<SourceAudioLoader> {
        self.scheduler.loader()
    }

    /// Receiver for service events
    pub fn subscribe(&self) -> Receiver<RenderEvent> {
        self.events.subscribe()
    }

    /// Submit without waiting
    pub fn submit(&self, request: RenderRequest) -> RenderResult<TaskHandle> {
        self.scheduler.submit(request)
    }

    /// Submit and wait up to `wait` (the configured default if `None`)
    ///
    /// Returns `Pending` with a pollable handle when the wait runs out.
    pub fn request(&self, request: RenderRequest, wait: Option<Duration>) -> RenderResult<AwaitOutcome> {
        let handle = self.scheduler.submit(request)?;
        if handle.cache_hit {
            return Ok(AwaitOutcome::Ready(handle.artifact_path));
        }
        let wait = wait.unwrap_or_else(|| self.config.default_wait());
        Ok(self.scheduler.await_result(&handle, wait))
    }

    /// [`RenderService::request`] from wire-level query parameters
    pub fn request_query(
        &self,
        kind: ArtifactKind,
        params: &HashMap<String, String>,
        wait: Option<Duration>,
    ) -> RenderResult<AwaitOutcome> {
        let request = RenderRequest::from_query(kind, params)?;
        self.request(request, wait)
    }

    pub fn await_result(&self, handle: &TaskHandle, timeout: Duration) -> AwaitOutcome {
        self.scheduler.await_result(handle, timeout)
    }

    pub fn poll(&self, id: TaskId) -> Option<TaskState> {
        self.scheduler.poll(id)
    }

    pub fn forget(&self, id: TaskId) -> bool {
        self.scheduler.forget(id)
    }

    /// Render the calls after `request` in the background
    pub fn prefetch(&self, request: RenderRequest, ahead: usize) {
        self.prefetch.prefetch(request, ahead);
    }
}

impl Drop for RenderService {
    fn drop(&mut self) {
        self.prefetch.shutdown();
        self.events.publish(RenderEvent::ServiceStopped {
            service_name: "TaskScheduler".to_string(),
        });
        log::info!("[RENDER] Service stopped");
    }
}
