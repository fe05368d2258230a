//! Prefetching of neighbouring calls
//!
//! Annotators step through calls in order, so after call N is shown the
//! next few are rendered in the background. The coordinator runs on its own
//! thread and only ever submits; it never waits for a render.

use std::ops::Range;
use std::thread;

use super::messages::{EventBus, PrefetchCommand, RenderEvent, ServiceHandle};
use super::scheduler::{SubmitOrigin, TaskScheduler, WeakScheduler};
use crate::error::{RenderError, RenderResult};
use crate::request::RenderRequest;

/// Calls to prefetch after `call_index`: the next `ahead`, stopping at the last call
pub fn prefetch_indices(call_index: usize, total_calls: usize, ahead: usize) -> Range<usize> {
    let start = call_index.saturating_add(1).min(total_calls);
    let end = start.saturating_add(ahead).min(total_calls);
    start..end
}

/// Background service that submits prefetch requests to a scheduler
pub struct PrefetchCoordinator {
    handle: ServiceHandle<PrefetchCommand>,
}

impl PrefetchCoordinator {
    /// Spawn the coordinator and register it with `scheduler`
    ///
    /// The coordinator thread holds only a weak reference and never keeps
    /// the scheduler alive; it exits on shutdown or once the scheduler is gone.
    pub fn spawn(scheduler: &TaskScheduler, events: EventBus) -> RenderResult<Self> {
        let (command_tx, command_rx) = crossbeam::channel::unbounded();
        let weak = scheduler.downgrade();
        let thread_events = events.clone();

        let thread_handle = thread::Builder::new()
            .name("render-prefetch".into())
            .spawn(move || run(weak, command_rx, thread_events))
            .map_err(|e| {
                RenderError::RenderFailure(format!("Failed to spawn prefetch thread: {}", e))
            })?;

        scheduler.attach_prefetcher(command_tx.clone());
        events.publish(RenderEvent::ServiceStarted {
            service_name: "PrefetchCoordinator".to_string(),
        });

        Ok(Self {
            handle: ServiceHandle {
                command_tx,
                thread_handle: Some(thread_handle),
            },
        })
    }

    /// Queue prefetching of the `ahead` calls after `request`; never blocks
    pub fn prefetch(&self, request: RenderRequest, ahead: usize) {
        if self.handle.send(PrefetchCommand::Prefetch { request, ahead }).is_err() {
            log::debug!("[PREFETCH] Coordinator stopped; request dropped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Stop the coordinator thread and wait for it
    pub fn shutdown(&mut self) {
        let _ = self.handle.send(PrefetchCommand::Shutdown);
        if let Some(thread) = self.handle.thread_handle.take() {
            if thread.join().is_err() {
                log::error!("[PREFETCH] Coordinator thread panicked");
            }
        }
    }
}

impl Drop for PrefetchCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    scheduler: WeakScheduler,
    commands: crossbeam::channel::Receiver<PrefetchCommand>,
    events: EventBus,
) {
    log::info!("[PREFETCH] Coordinator started");

    for command in commands.iter() {
        match command {
            PrefetchCommand::Prefetch { request, ahead } => {
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                submit_ahead(&scheduler, &request, ahead, &events);
            }
            PrefetchCommand::Shutdown => break,
        }
    }

    log::info!("[PREFETCH] Coordinator stopped");
    events.publish(RenderEvent::ServiceStopped {
        service_name: "PrefetchCoordinator".to_string(),
    });
}

fn submit_ahead(scheduler: &TaskScheduler, request: &RenderRequest, ahead: usize, events: &EventBus) {
    let indices = prefetch_indices(request.call_index, request.total_calls, ahead);
    if indices.is_empty() {
        return;
    }

    let mut submitted = Vec::with_capacity(indices.len());
    for call_index in indices {
        match scheduler.submit_with_origin(request.for_call(call_index), SubmitOrigin::Prefetch) {
            Ok(_) => submitted.push(call_index),
            Err(e) => log::debug!(
                "[PREFETCH] Skipping call {} of {}: {}",
                call_index,
                request.source_path,
                e
            ),
        }
    }

    if !submitted.is_empty() {
        log::debug!("[PREFETCH] {} calls {:?}", request.source_path, submitted);
        events.publish(RenderEvent::PrefetchScheduled {
            source_path: request.source_path.clone(),
            call_indices: submitted,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::scheduler::tests::{CountingEngine, Fixture};
    use crate::services::AwaitOutcome;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_prefetch_indices() {
        assert_eq!(prefetch_indices(0, 10, 2), 1..3);
        assert_eq!(prefetch_indices(8, 10, 2), 9..10);
        assert_eq!(prefetch_indices(9, 10, 2), 10..10);
        assert_eq!(prefetch_indices(3, 10, 0), 4..4);
        assert_eq!(prefetch_indices(12, 10, 2), 10..10);
        assert_eq!(prefetch_indices(usize::MAX - 1, usize::MAX, 5).len(), 0);
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_render_triggers_prefetch_without_cascade() {
        let mut fx = Fixture::new();
        fx.config.prefetch_ahead = 2;
        let engine = Arc::new(CountingEngine::new());
        let bus = EventBus::new(4096);
        let scheduler = TaskScheduler::new(&fx.config, fx.pipeline(engine.clone()), bus.clone()).unwrap();
        let _coordinator = PrefetchCoordinator::spawn(&scheduler, bus.clone()).unwrap();

        let handle = scheduler.submit(fx.request(0)).unwrap();
        assert!(matches!(
            scheduler.await_result(&handle, Duration::from_secs(10)),
            AwaitOutcome::Ready(_)
        ));

        let key = |call| scheduler.resolver().key_for(&fx.request(call));
        assert!(wait_for(|| key(1).is_published() && key(2).is_published()));

        // Prefetched calls do not prefetch further
        std::thread::sleep(Duration::from_millis(200));
        assert!(!key(3).is_published());
        assert_eq!(engine.calls(), 3);
    }

    #[test]
    fn test_cache_hit_also_prefetches() {
        let mut fx = Fixture::new();
        fx.config.prefetch_ahead = 1;
        let engine = Arc::new(CountingEngine::new());
        let bus = EventBus::new(4096);
        let scheduler = TaskScheduler::new(&fx.config, fx.pipeline(engine.clone()), bus.clone()).unwrap();

        // Render call 2 before the coordinator exists
        let first = scheduler.submit(fx.request(2)).unwrap();
        scheduler.await_result(&first, Duration::from_secs(10));

        let _coordinator = PrefetchCoordinator::spawn(&scheduler, bus.clone()).unwrap();
        let hit = scheduler.submit(fx.request(2)).unwrap();
        assert!(hit.cache_hit);

        let key3 = scheduler.resolver().key_for(&fx.request(3));
        assert!(wait_for(|| key3.is_published()));
    }

    #[test]
    fn test_last_call_prefetches_nothing() {
        let mut fx = Fixture::new();
        fx.config.prefetch_ahead = 3;
        let engine = Arc::new(CountingEngine::new());
        let bus = EventBus::new(4096);
        let events = bus.subscribe();
        let scheduler = TaskScheduler::new(&fx.config, fx.pipeline(engine.clone()), bus.clone()).unwrap();
        let coordinator = PrefetchCoordinator::spawn(&scheduler, bus.clone()).unwrap();

        coordinator.prefetch(fx.request(3), 3);
        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(engine.calls(), 0);
        assert!(!events
            .try_iter()
            .any(|e| matches!(e, RenderEvent::PrefetchScheduled { .. })));
    }

    #[test]
    fn test_shutdown_joins_thread() {
        let fx = Fixture::new();
        let bus = EventBus::new(4096);
        let scheduler =
            TaskScheduler::new(&fx.config, fx.pipeline(Arc::new(CountingEngine::new())), bus.clone()).unwrap();
        let mut coordinator = PrefetchCoordinator::spawn(&scheduler, bus.clone()).unwrap();
        assert!(coordinator.is_running());

        coordinator.shutdown();
        assert!(!coordinator.is_running());
    }
}
