//! Render task scheduler
//!
//! Owns a rayon thread pool and turns render requests into tracked tasks:
//!
//! ```text
//! submit ──► published? ──yes──► verify hash ──► Success (cache hit)
//!                │
//!                no ──► in flight? ──yes──► attach to running task
//!                            │
//!                            no ──► Queued ──► worker: extract → render → publish
//!                                                 │  retry transient errors
//!                                                 ▼
//!                                          Success | Error (+ error artifact)
//! ```
//!
//! The in-flight table is keyed by artifact path and guarantees one render
//! per key within this process. Other processes sharing the cache directory
//! may render the same key concurrently; atomic publication makes that
//! harmless.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use super::messages::{EventBus, PrefetchCommand, RenderEvent, TaskId, TaskState, TaskStatus};
use super::pipeline::{milestones, RenderPipeline};
use crate::audio::SourceAudioLoader;
use crate::cache_key::{CacheKey, CacheKeyResolver};
use crate::config::RenderConfig;
use crate::error::{RenderError, RenderResult};
use crate::request::RenderRequest;

/// Who asked for a task; prefetch-originated work never prefetches further
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOrigin {
    Caller,
    Prefetch,
}

/// Returned by [`TaskScheduler::submit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: TaskId,
    /// Where the artifact is (or will be) published
    pub artifact_path: PathBuf,
    /// The artifact already existed
    pub cache_hit: bool,
}

/// Why a task ended in error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Short error name (see `RenderError::kind`)
    pub kind: &'static str,
    pub message: String,
    /// Published error artifact, if one could be drawn
    pub error_file_path: Option<PathBuf>,
}

/// Result of waiting on a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwaitOutcome {
    /// Artifact is published at this path
    Ready(PathBuf),
    /// Still running when the wait timed out; poll later
    Pending(TaskHandle),
    Failed(TaskFailure),
}

struct TaskSlot {
    state: Mutex<TaskState>,
    done: Condvar,
    /// A caller attached to a task that was started by prefetch
    caller_attached: AtomicBool,
}

impl TaskSlot {
    fn new(state: TaskState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            done: Condvar::new(),
            caller_attached: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut TaskState)) {
        let mut state = self.lock();
        f(&mut state);
        if state.status.is_terminal() {
            self.done.notify_all();
        }
    }
}

enum Admission {
    Attach(TaskId),
    CacheHit,
    Spawn(TaskId, Arc<TaskSlot>),
}

struct Inner {
    pool: rayon::ThreadPool,
    pipeline: RenderPipeline,
    resolver: CacheKeyResolver,
    tasks: RwLock<HashMap<TaskId, Arc<TaskSlot>>>,
    /// Artifact path → task currently producing it
    in_flight: Mutex<HashMap<PathBuf, TaskId>>,
    next_id: AtomicU64,
    max_attempts: u32,
    retry_backoff: Duration,
    retention: Duration,
    prefetch_ahead: usize,
    events: EventBus,
    prefetch_tx: RwLock<Option<Sender<PrefetchCommand>>>,
}

impl Inner {
    fn tasks(&self) -> RwLockReadGuard<'_, HashMap<TaskId, Arc<TaskSlot>>> {
        self.tasks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tasks_mut(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, Arc<TaskSlot>>> {
        self.tasks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<PathBuf, TaskId>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, id: TaskId) -> Option<Arc<TaskSlot>> {
        self.tasks().get(&id).cloned()
    }

    fn allocate(&self, state: TaskState) -> (TaskId, Arc<TaskSlot>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = TaskSlot::new(state);
        self.tasks_mut().insert(id, slot.clone());
        (id, slot)
    }
}

/// Schedules render tasks on a worker pool; cheap to clone
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

/// Non-owning scheduler reference, held by background services
#[derive(Clone)]
pub struct WeakScheduler {
    inner: Weak<Inner>,
}

impl WeakScheduler {
    pub fn upgrade(&self) -> Option<TaskScheduler> {
        self.inner.upgrade().map(|inner| TaskScheduler { inner })
    }
}

impl TaskScheduler {
    /// Create a scheduler with `config.worker_threads` workers
    pub fn new(
        config: &RenderConfig,
        pipeline: RenderPipeline,
        events: EventBus,
    ) -> RenderResult<Self> {
        let mut config = config.clone();
        config.validate();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("render-worker-{}", i))
            .panic_handler(|panic| {
                log::error!("[SCHED] Render worker panicked: {}", panic_message(panic.as_ref()));
            })
            .build()
            .map_err(|e| RenderError::RenderFailure(format!("Failed to create render thread pool: {}", e)))?;

        log::info!(
            "[SCHED] {} render workers, engine '{}', cache at {:?}",
            config.worker_threads,
            pipeline.engine_name(),
            config.temp_root
        );

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                pipeline,
                resolver: CacheKeyResolver::new(&config.temp_root),
                tasks: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                max_attempts: config.max_attempts,
                retry_backoff: config.retry_backoff(),
                retention: config.task_retention(),
                prefetch_ahead: config.prefetch_ahead,
                events,
                prefetch_tx: RwLock::new(None),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn resolver(&self) -> &CacheKeyResolver {
        &self.inner.resolver
    }

    pub fn loader(&self) -> &Arc<SourceAudioLoader> {
        self.inner.pipeline.loader()
    }

    /// Route prefetch requests for finished caller tasks to `tx`
    pub(crate) fn attach_prefetcher(&self, tx: Sender<PrefetchCommand>) {
        let mut slot = self
            .inner
            .prefetch_tx
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(tx);
    }

    /// Submit a caller request
    pub fn submit(&self, request: RenderRequest) -> RenderResult<TaskHandle> {
        self.submit_with_origin(request, SubmitOrigin::Caller)
    }

    /// Submit a request, returning immediately
    ///
    /// Errors are returned directly only for requests that never become a
    /// task: end of sequence, or a stale hash for an already-published
    /// artifact. Everything else is reported through the task.
    pub fn submit_with_origin(&self, request: RenderRequest, origin: SubmitOrigin) -> RenderResult<TaskHandle> {
        if request.is_end_of_sequence() {
            return Err(RenderError::EndOfSequence {
                total_calls: request.total_calls,
            });
        }

        self.prune_finished();
        let key = self.inner.resolver.key_for(&request);

        // Publish happens before the in-flight entry is removed, so checking
        // both under this lock admits at most one render per key.
        let admission = {
            let mut in_flight = self.inner.in_flight();
            match in_flight.get(&key.path).copied() {
                Some(id) if self.inner.slot(id).is_some() => Admission::Attach(id),
                _ if key.is_published() => Admission::CacheHit,
                _ => {
                    let (id, slot) = self.inner.allocate(TaskState::queued());
                    in_flight.insert(key.path.clone(), id);
                    Admission::Spawn(id, slot)
                }
            }
        };

        match admission {
            Admission::Attach(id) => {
                log::debug!("[SCHED] Attaching to in-flight task {} for {:?}", id, key.path);
                if origin == SubmitOrigin::Caller {
                    if let Some(slot) = self.inner.slot(id) {
                        slot.caller_attached.store(true, Ordering::Release);
                    }
                }
                Ok(TaskHandle {
                    id,
                    artifact_path: key.path,
                    cache_hit: false,
                })
            }
            Admission::CacheHit => self.complete_from_cache(request, key, origin),
            Admission::Spawn(id, slot) => {
                self.inner.events.publish(RenderEvent::TaskQueued {
                    task_id: id,
                    artifact_path: key.path.clone(),
                    prefetch: origin == SubmitOrigin::Prefetch,
                });
                log::debug!("[SCHED] Queued task {} → {:?}", id, key.path);

                let handle = TaskHandle {
                    id,
                    artifact_path: key.path.clone(),
                    cache_hit: false,
                };
                let scheduler = self.clone();
                self.inner
                    .pool
                    .spawn(move || scheduler.run_task(id, slot, request, key, origin));
                Ok(handle)
            }
        }
    }

    fn complete_from_cache(
        &self,
        request: RenderRequest,
        key: CacheKey,
        origin: SubmitOrigin,
    ) -> RenderResult<TaskHandle> {
        // The artifact was rendered for this hash; the recording may have changed since
        self.inner.pipeline.verify_hash(&request)?;

        let (id, _) = self.inner.allocate(TaskState::cached(key.path.clone()));
        log::debug!("[CACHE] Hit {:?}", key.path);
        self.inner.events.publish(RenderEvent::TaskCompleted {
            task_id: id,
            artifact_path: key.path.clone(),
            cache_hit: true,
        });
        if origin == SubmitOrigin::Caller {
            self.request_prefetch(&request);
        }

        Ok(TaskHandle {
            id,
            artifact_path: key.path,
            cache_hit: true,
        })
    }

    fn run_task(&self, id: TaskId, slot: Arc<TaskSlot>, request: RenderRequest, key: CacheKey, origin: SubmitOrigin) {
        let started = Instant::now();
        slot.update(|s| s.status = TaskStatus::Processing);

        let mut attempt = 0u32;
        let result = loop {
            attempt += 1;
            slot.update(|s| s.attempts = attempt);

            let mut report = |progress: u8| self.report_progress(id, &slot, progress);
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.inner.pipeline.run(&request, &key, &mut report)
            }))
            .unwrap_or_else(|panic| {
                Err(RenderError::RenderFailure(format!(
                    "render panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

            match outcome {
                Ok(()) => break Ok(()),
                Err(e) if e.is_retryable() && attempt < self.inner.max_attempts => {
                    let delay = self.inner.retry_backoff.saturating_mul(2u32.saturating_pow(attempt - 1));
                    log::warn!(
                        "[SCHED] Task {} attempt {}/{} failed: {} (retrying in {:?})",
                        id,
                        attempt,
                        self.inner.max_attempts,
                        e,
                        delay
                    );
                    self.inner.events.publish(RenderEvent::TaskRetrying {
                        task_id: id,
                        attempt,
                        error: e.to_string(),
                    });
                    std::thread::sleep(delay);
                }
                Err(e) if e.is_retryable() => {
                    break Err(RenderError::TaskRetriesExhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    })
                }
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(()) => {
                self.inner.in_flight().remove(&key.path);
                slot.update(|s| {
                    s.status = TaskStatus::Success;
                    s.progress = milestones::PUBLISHED;
                    s.file_path = Some(key.path.clone());
                    s.finished_at = Some(Instant::now());
                });
                log::info!(
                    "[SCHED] Task {} rendered {:?} in {:?} ({} attempt(s))",
                    id,
                    key.path,
                    started.elapsed(),
                    attempt
                );
                self.inner.events.publish(RenderEvent::TaskCompleted {
                    task_id: id,
                    artifact_path: key.path.clone(),
                    cache_hit: false,
                });
                if origin == SubmitOrigin::Caller || slot.caller_attached.load(Ordering::Acquire) {
                    self.request_prefetch(&request);
                }
            }
            Err(e) => {
                let message = e.to_string();
                let error_file_path = catch_unwind(AssertUnwindSafe(|| {
                    self.inner.pipeline.publish_error(&request, &key, &message)
                }))
                .unwrap_or_else(|panic| {
                    log::error!(
                        "[SCHED] Task {} error artifact panicked: {}",
                        id,
                        panic_message(panic.as_ref())
                    );
                    None
                });
                self.inner.in_flight().remove(&key.path);
                slot.update(|s| {
                    s.status = TaskStatus::Error;
                    s.message = Some(message.clone());
                    s.error_kind = Some(e.kind());
                    s.error_file_path = error_file_path;
                    s.finished_at = Some(Instant::now());
                });
                log::error!("[SCHED] Task {} failed ({}): {}", id, e.kind(), message);
                self.inner.events.publish(RenderEvent::TaskFailed {
                    task_id: id,
                    kind: e.kind(),
                    message,
                });
            }
        }
    }

    fn report_progress(&self, id: TaskId, slot: &TaskSlot, progress: u8) {
        let advanced = {
            let mut state = slot.lock();
            if progress > state.progress {
                state.progress = progress;
                true
            } else {
                false
            }
        };
        if advanced {
            self.inner.events.publish(RenderEvent::TaskProgress { task_id: id, progress });
        }
    }

    fn request_prefetch(&self, request: &RenderRequest) {
        if self.inner.prefetch_ahead == 0 {
            return;
        }
        let tx = self
            .inner
            .prefetch_tx
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = tx.as_ref() {
            let cmd = PrefetchCommand::Prefetch {
                request: request.clone(),
                ahead: self.inner.prefetch_ahead,
            };
            if tx.send(cmd).is_err() {
                log::debug!("[PREFETCH] Coordinator stopped; not prefetching");
            }
        }
    }

    /// Wait up to `timeout` for a task to finish
    ///
    /// Timing out abandons the wait, not the task.
    pub fn await_result(&self, handle: &TaskHandle, timeout: Duration) -> AwaitOutcome {
        let Some(slot) = self.inner.slot(handle.id) else {
            if is_published(&handle.artifact_path) {
                return AwaitOutcome::Ready(handle.artifact_path.clone());
            }
            return AwaitOutcome::Failed(TaskFailure {
                kind: "UnknownTask",
                message: format!("Task {} is not known", handle.id),
                error_file_path: None,
            });
        };

        let guard = slot.lock();
        let (state, _) = slot
            .done
            .wait_timeout_while(guard, timeout, |s| !s.status.is_terminal())
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match state.status {
            TaskStatus::Success => AwaitOutcome::Ready(
                state
                    .file_path
                    .clone()
                    .unwrap_or_else(|| handle.artifact_path.clone()),
            ),
            TaskStatus::Error => AwaitOutcome::Failed(TaskFailure {
                kind: state.error_kind.unwrap_or("Unknown"),
                message: state.message.clone().unwrap_or_default(),
                error_file_path: state.error_file_path.clone(),
            }),
            TaskStatus::Queued | TaskStatus::Processing => AwaitOutcome::Pending(handle.clone()),
        }
    }

    /// Current state of a task, `None` once forgotten or expired
    pub fn poll(&self, id: TaskId) -> Option<TaskState> {
        self.inner.slot(id).map(|slot| slot.lock().clone())
    }

    /// Drop a finished task's state; running tasks are kept
    pub fn forget(&self, id: TaskId) -> bool {
        let mut tasks = self.inner.tasks_mut();
        let finished = tasks
            .get(&id)
            .map(|slot| slot.lock().status.is_terminal())
            .unwrap_or(false);
        if finished {
            tasks.remove(&id);
        }
        finished
    }

    /// Tasks currently tracked (running or finished)
    pub fn task_count(&self) -> usize {
        self.inner.tasks().len()
    }

    fn prune_finished(&self) {
        let retention = self.inner.retention;
        let mut tasks = self.inner.tasks_mut();
        let before = tasks.len();
        tasks.retain(|_, slot| {
            let state = slot.lock();
            !matches!(state.finished_at, Some(at) if at.elapsed() > retention)
        });
        let pruned = before - tasks.len();
        if pruned > 0 {
            log::debug!("[SCHED] Expired {} finished task(s)", pruned);
        }
    }
}

fn is_published(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::{hash_file, tone, write_wav};
    use crate::render::{RenderEngine, RenderInput};
    use crate::request::ArtifactKind;
    use crate::segment::{JsonCallMetadataStore, SegmentExtractor};
    use crossbeam::channel::Receiver;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use tempfile::TempDir;

    const RATE: u32 = 10_000;
    const WAIT: Duration = Duration::from_secs(10);

    /// Engine that counts calls and can be slowed down, made flaky or made to panic
    pub(crate) struct CountingEngine {
        calls: AtomicUsize,
        delay: Duration,
        failures_left: AtomicU32,
        panics: bool,
        error_panics: bool,
    }

    impl CountingEngine {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                failures_left: AtomicU32::new(0),
                panics: false,
                error_panics: false,
            }
        }

        pub(crate) fn slow(delay: Duration) -> Self {
            Self { delay, ..Self::new() }
        }

        fn flaky(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                ..Self::new()
            }
        }

        fn panicking() -> Self {
            Self {
                panics: true,
                ..Self::new()
            }
        }

        /// Always fails, and drawing the error artifact panics
        fn broken_error_artifact() -> Self {
            Self {
                error_panics: true,
                ..Self::flaky(u32::MAX)
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RenderEngine for CountingEngine {
        fn render(&self, _input: &RenderInput<'_>) -> RenderResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.panics {
                panic!("engine exploded");
            }
            let transient = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if transient {
                return Err(RenderError::RenderFailure("transient".to_string()));
            }
            Ok(b"artifact".to_vec())
        }

        fn render_error(&self, _kind: ArtifactKind, message: &str) -> Option<Vec<u8>> {
            if self.error_panics {
                panic!("error artifact exploded");
            }
            Some(message.as_bytes().to_vec())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    /// A recording with four annotated calls in a private cache
    pub(crate) struct Fixture {
        pub(crate) dir: TempDir,
        pub(crate) source: PathBuf,
        pub(crate) config: RenderConfig,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let source = dir.path().join("rec.wav");
            write_wav(&source, 1, RATE, &tone(20_000, 50));
            std::fs::write(
                JsonCallMetadataStore::metadata_path(&source),
                r#"{"onsets": [0.2, 0.6, 1.0, 1.4], "offsets": [0.3, 0.7, 1.1, 1.5]}"#,
            )
            .unwrap();

            let config = RenderConfig {
                temp_root: dir.path().join("cache"),
                worker_threads: 4,
                retry_backoff_ms: 1,
                prefetch_ahead: 0,
                ..RenderConfig::default()
            };

            Self { dir, source, config }
        }

        pub(crate) fn request(&self, call_index: usize) -> RenderRequest {
            RenderRequest {
                kind: ArtifactKind::Spectrogram,
                source_path: self.source.to_string_lossy().into_owned(),
                channel: 0,
                call_index,
                overview: false,
                contrast: 4.0,
                loudness: 1.0,
                expected_hash: hash_file(&self.source).unwrap(),
                total_calls: 4,
            }
        }

        pub(crate) fn pipeline(&self, engine: Arc<dyn RenderEngine>) -> RenderPipeline {
            let loader = Arc::new(SourceAudioLoader::from_config(&self.config));
            let extractor = SegmentExtractor::new(
                loader,
                Arc::new(JsonCallMetadataStore),
                self.config.anomaly_threshold_secs,
            );
            RenderPipeline::new(extractor, engine, &self.config)
        }

        fn scheduler(&self, engine: Arc<dyn RenderEngine>) -> (TaskScheduler, Receiver<RenderEvent>) {
            let bus = EventBus::new(4096);
            let scheduler = TaskScheduler::new(&self.config, self.pipeline(engine), bus.clone()).unwrap();
            (scheduler, bus.subscribe())
        }
    }

    fn expect_ready(outcome: AwaitOutcome) -> PathBuf {
        match outcome {
            AwaitOutcome::Ready(path) => path,
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    fn expect_failed(outcome: AwaitOutcome) -> TaskFailure {
        match outcome {
            AwaitOutcome::Failed(failure) => failure,
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_render_then_cache_hit() {
        let fx = Fixture::new();
        let engine = Arc::new(CountingEngine::new());
        let (scheduler, _events) = fx.scheduler(engine.clone());

        let handle = scheduler.submit(fx.request(1)).unwrap();
        assert!(!handle.cache_hit);
        let path = expect_ready(scheduler.await_result(&handle, WAIT));
        assert_eq!(std::fs::read(&path).unwrap(), b"artifact");
        assert!(path.starts_with(&fx.config.temp_root));

        let state = scheduler.poll(handle.id).unwrap();
        assert_eq!(state.status, TaskStatus::Success);
        assert_eq!(state.progress, 100);
        assert_eq!(state.attempts, 1);

        let again = scheduler.submit(fx.request(1)).unwrap();
        assert!(again.cache_hit);
        assert_eq!(again.artifact_path, path);
        assert_eq!(expect_ready(scheduler.await_result(&again, Duration::ZERO)), path);
        assert!(scheduler.poll(again.id).unwrap().cache_hit);

        assert_eq!(engine.calls(), 1);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let fx = Fixture::new();
        let engine = Arc::new(CountingEngine::flaky(2));
        let (scheduler, _events) = fx.scheduler(engine.clone());

        let handle = scheduler.submit(fx.request(0)).unwrap();
        expect_ready(scheduler.await_result(&handle, WAIT));

        assert_eq!(scheduler.poll(handle.id).unwrap().attempts, 3);
        assert_eq!(engine.calls(), 3);
    }

    #[test]
    fn test_retries_exhausted_publishes_error_artifact() {
        let fx = Fixture::new();
        let engine = Arc::new(CountingEngine::flaky(u32::MAX));
        let (scheduler, _events) = fx.scheduler(engine.clone());

        let handle = scheduler.submit(fx.request(0)).unwrap();
        let failure = expect_failed(scheduler.await_result(&handle, WAIT));

        assert_eq!(failure.kind, "TaskRetriesExhausted");
        assert!(failure.message.contains("transient"), "{}", failure.message);
        assert_eq!(engine.calls(), 3);

        let error_path = failure.error_file_path.unwrap();
        assert!(error_path.file_name().unwrap().to_string_lossy().starts_with("error_"));
        assert!(std::fs::read(&error_path).unwrap().starts_with(b"Render failed after 3 attempts"));

        // The error artifact never satisfies the real key
        assert!(!handle.artifact_path.exists());
        let retry = scheduler.submit(fx.request(0)).unwrap();
        assert!(!retry.cache_hit);
    }

    #[test]
    fn test_validation_errors_are_not_retried() {
        let fx = Fixture::new();
        let engine = Arc::new(CountingEngine::new());
        let (scheduler, _events) = fx.scheduler(engine.clone());

        let mut bad_channel = fx.request(0);
        bad_channel.channel = 5;
        let handle = scheduler.submit(bad_channel).unwrap();
        let failure = expect_failed(scheduler.await_result(&handle, WAIT));
        assert_eq!(failure.kind, "ChannelOutOfRange");
        assert_eq!(scheduler.poll(handle.id).unwrap().attempts, 1);

        let mut stale = fx.request(1);
        stale.expected_hash = "0000".to_string();
        let handle = scheduler.submit(stale).unwrap();
        assert_eq!(expect_failed(scheduler.await_result(&handle, WAIT)).kind, "HashMismatch");
        // Nothing is served for a stale hash
        assert!(!handle.artifact_path.exists());

        let mut past_metadata = fx.request(2);
        past_metadata.total_calls = 10;
        past_metadata.call_index = 7;
        let handle = scheduler.submit(past_metadata).unwrap();
        assert_eq!(expect_failed(scheduler.await_result(&handle, WAIT)).kind, "IndexOutOfRange");

        assert_eq!(engine.calls(), 0);
    }

    #[test]
    fn test_panicking_engine_is_contained() {
        let fx = Fixture::new();
        let engine = Arc::new(CountingEngine::panicking());
        let (scheduler, _events) = fx.scheduler(engine.clone());

        let handle = scheduler.submit(fx.request(0)).unwrap();
        let failure = expect_failed(scheduler.await_result(&handle, WAIT));
        assert_eq!(failure.kind, "TaskRetriesExhausted");
        assert!(failure.message.contains("engine exploded"), "{}", failure.message);
        assert_eq!(engine.calls(), 3);

        // Workers survive the panic
        let next = scheduler.submit(fx.request(1)).unwrap();
        expect_failed(scheduler.await_result(&next, WAIT));
    }

    #[test]
    fn test_panicking_error_artifact_still_fails_task() {
        let fx = Fixture::new();
        let engine = Arc::new(CountingEngine::broken_error_artifact());
        let (scheduler, _events) = fx.scheduler(engine.clone());

        let handle = scheduler.submit(fx.request(0)).unwrap();
        let failure = expect_failed(scheduler.await_result(&handle, WAIT));
        assert_eq!(failure.kind, "TaskRetriesExhausted");
        assert!(failure.error_file_path.is_none());
        assert_eq!(scheduler.poll(handle.id).unwrap().status, TaskStatus::Error);

        // The key is released and the process is still serving
        let again = scheduler.submit(fx.request(0)).unwrap();
        assert_ne!(again.id, handle.id);
        expect_failed(scheduler.await_result(&again, WAIT));
        assert_eq!(engine.calls(), 6);
    }

    #[test]
    fn test_concurrent_submissions_render_once() {
        let fx = Fixture::new();
        let engine = Arc::new(CountingEngine::slow(Duration::from_millis(300)));
        let (scheduler, _events) = fx.scheduler(engine.clone());

        let paths: Vec<PathBuf> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let scheduler = scheduler.clone();
                    let request = fx.request(2);
                    scope.spawn(move || {
                        let handle = scheduler.submit(request).unwrap();
                        expect_ready(scheduler.await_result(&handle, WAIT))
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(engine.calls(), 1);
    }

    #[test]
    fn test_cached_artifact_with_stale_hash_is_rejected() {
        let fx = Fixture::new();
        let engine = Arc::new(CountingEngine::new());
        let (scheduler, _events) = fx.scheduler(engine.clone());

        let old = fx.request(1);
        let handle = scheduler.submit(old.clone()).unwrap();
        let old_path = expect_ready(scheduler.await_result(&handle, WAIT));

        // The recording is edited after its artifact was published
        write_wav(&fx.source, 1, RATE, &tone(21_000, 40));

        let err = scheduler.submit(old).unwrap_err();
        assert!(matches!(err, RenderError::HashMismatch { .. }));
        assert_eq!(scheduler.task_count(), 1);

        // A request carrying the new hash renders a new artifact
        let fresh = scheduler.submit(fx.request(1)).unwrap();
        assert!(!fresh.cache_hit);
        assert_ne!(expect_ready(scheduler.await_result(&fresh, WAIT)), old_path);
        assert_eq!(engine.calls(), 2);
    }

    #[test]
    fn test_end_of_sequence() {
        let fx = Fixture::new();
        let (scheduler, _events) = fx.scheduler(Arc::new(CountingEngine::new()));

        let err = scheduler.submit(fx.request(4)).unwrap_err();
        assert!(matches!(err, RenderError::EndOfSequence { total_calls: 4 }));
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_timeout_returns_pollable_handle() {
        let fx = Fixture::new();
        let engine = Arc::new(CountingEngine::slow(Duration::from_millis(300)));
        let (scheduler, _events) = fx.scheduler(engine);

        let handle = scheduler.submit(fx.request(3)).unwrap();
        match scheduler.await_result(&handle, Duration::from_millis(10)) {
            AwaitOutcome::Pending(pending) => assert_eq!(pending, handle),
            other => panic!("expected Pending, got {other:?}"),
        }
        assert!(!scheduler.poll(handle.id).unwrap().status.is_terminal());

        // The abandoned wait did not cancel the job
        expect_ready(scheduler.await_result(&handle, WAIT));
    }

    #[test]
    fn test_forget_only_finished_tasks() {
        let fx = Fixture::new();
        let (scheduler, _events) = fx.scheduler(Arc::new(CountingEngine::slow(Duration::from_millis(200))));

        let handle = scheduler.submit(fx.request(0)).unwrap();
        assert!(!scheduler.forget(handle.id));

        expect_ready(scheduler.await_result(&handle, WAIT));
        assert!(scheduler.forget(handle.id));
        assert!(scheduler.poll(handle.id).is_none());

        // Forgotten tasks still resolve through their published artifact
        assert!(matches!(
            scheduler.await_result(&handle, Duration::ZERO),
            AwaitOutcome::Ready(_)
        ));
    }

    #[test]
    fn test_progress_events_follow_milestones() {
        let fx = Fixture::new();
        let (scheduler, events) = fx.scheduler(Arc::new(CountingEngine::new()));

        let handle = scheduler.submit(fx.request(0)).unwrap();
        let mut progress = Vec::new();
        loop {
            match events.recv_timeout(WAIT).unwrap() {
                RenderEvent::TaskProgress { task_id, progress: p } if task_id == handle.id => progress.push(p),
                RenderEvent::TaskCompleted { task_id, cache_hit, .. } if task_id == handle.id => {
                    assert!(!cache_hit);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(progress, vec![10, 30, 90, 100]);
    }
}
