//! Message types for the render services
//!
//! Task state is shared between the scheduler, its workers and pollers;
//! every event is delivered to each subscriber of the [`EventBus`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender, TrySendError};
use serde::Serialize;

use crate::request::RenderRequest;

/// Identifier of a scheduled task, unique per scheduler
pub type TaskId = u64;

// ============================================================================
// Task State
// ============================================================================

/// Lifecycle of a render task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a worker
    #[serde(rename = "pending")]
    Queued,
    Processing,
    Success,
    Error,
}

impl TaskStatus {
    /// No further transitions happen from this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// Snapshot of a task as seen by a poller
///
/// Serializes to the poll response shape:
///
/// ```json
/// {"status": "processing", "progress": 30}
/// {"status": "success", "progress": 100, "file_path": "/tmp/battykoda_temp/.../x.png"}
/// {"status": "error", "progress": 30, "message": "Channel 4 out of range (3 channels)"}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct TaskState {
    pub status: TaskStatus,
    /// 0-100, never decreases
    pub progress: u8,
    /// Published artifact (success only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    /// Error message (error only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error artifact published for a failed task, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_file_path: Option<PathBuf>,
    /// Short error name (see `RenderError::kind`)
    #[serde(skip)]
    pub error_kind: Option<&'static str>,
    /// Pipeline attempts made so far
    #[serde(skip)]
    pub attempts: u32,
    /// Satisfied from the artifact cache without rendering
    #[serde(skip)]
    pub cache_hit: bool,
    #[serde(skip)]
    pub finished_at: Option<Instant>,
}

impl TaskState {
    pub fn queued() -> Self {
        Self {
            status: TaskStatus::Queued,
            progress: 0,
            file_path: None,
            message: None,
            error_file_path: None,
            error_kind: None,
            attempts: 0,
            cache_hit: false,
            finished_at: None,
        }
    }

    /// Already-published artifact
    pub fn cached(path: PathBuf) -> Self {
        Self {
            status: TaskStatus::Success,
            progress: 100,
            file_path: Some(path),
            cache_hit: true,
            finished_at: Some(Instant::now()),
            ..Self::queued()
        }
    }
}

// ============================================================================
// Prefetch Commands
// ============================================================================

/// Commands sent to the PrefetchCoordinator
pub enum PrefetchCommand {
    /// Schedule up to `ahead` calls following `request.call_index`
    Prefetch { request: RenderRequest, ahead: usize },

    /// Shutdown the service
    Shutdown,
}

// ============================================================================
// Render Events (Broadcast)
// ============================================================================

/// Events broadcast to all subscribers
#[derive(Debug, Clone)]
pub enum RenderEvent {
    // --- Task Events ---
    /// A render task was created
    TaskQueued {
        task_id: TaskId,
        artifact_path: PathBuf,
        prefetch: bool,
    },

    /// A task reached a progress milestone
    TaskProgress { task_id: TaskId, progress: u8 },

    /// A transient failure will be retried
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        error: String,
    },

    /// An artifact is available (freshly rendered or cached)
    TaskCompleted {
        task_id: TaskId,
        artifact_path: PathBuf,
        cache_hit: bool,
    },

    /// A task ended in error
    TaskFailed {
        task_id: TaskId,
        kind: &'static str,
        message: String,
    },

    // --- Prefetch Events ---
    /// Neighbouring calls were submitted ahead of demand
    PrefetchScheduled {
        source_path: String,
        call_indices: Vec<usize>,
    },

    // --- Service Events ---
    /// A service started
    ServiceStarted { service_name: String },

    /// A service stopped
    ServiceStopped { service_name: String },
}

// ============================================================================
// Service Handle
// ============================================================================

/// Handle for communicating with a background service
pub struct ServiceHandle<Cmd> {
    /// Channel for sending commands to the service
    pub command_tx: crossbeam::channel::Sender<Cmd>,
    /// Thread handle for the service
    pub thread_handle: Option<std::thread::JoinHandle<()>>,
}

impl<Cmd> ServiceHandle<Cmd> {
    /// Send a command to the service
    pub fn send(&self, cmd: Cmd) -> Result<(), crossbeam::channel::SendError<Cmd>> {
        self.command_tx.send(cmd)
    }

    /// Check if the service is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

/// Event bus fanning every event out to each subscriber
///
/// Each subscriber gets its own bounded channel. Publishing never blocks:
/// a subscriber whose buffer is full misses the event, and subscribers whose
/// receiver was dropped are removed on the next publish. Cloning the bus
/// shares the subscriber list.
#[derive(Clone)]
pub struct EventBus {
    capacity: usize,
    subscribers: Arc<Mutex<Vec<Sender<RenderEvent>>>>,
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> Receiver<RenderEvent> {
        let (tx, rx) = crossbeam::channel::bounded(self.capacity);
        self.subscribers().push(tx);
        rx
    }

    /// Number of live subscribers as of the last publish
    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Publish an event; returns how many subscribers received it
    pub fn publish(&self, event: RenderEvent) -> usize {
        let mut delivered = 0;
        self.subscribers().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                log::trace!("[EVENTS] Subscriber lagging, dropped {:?}", event);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        delivered
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Sender<RenderEvent>>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
