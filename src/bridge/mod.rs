//! Process bridge: runs the authoring executable once per submission.
//!
//! Submissions from every session pass through one [`ProcessBridge`]:
//!
//! ```text
//! submit() ──admission──▶ queue ──▶ worker 1..N ──spawn──▶ authoring process
//!    │ (reject when full)                 │                        │
//!    ▼                                    │◀──── stdout chunks ────┘
//! SubmissionId                            ▼
//!                         LineReassembler ─▶ BridgeEvent::Line ─▶ submitting session
//!                                         └▶ BridgeEvent::Completed
//! ```
//!
//! # Bounds
//!
//! - At most `max_workers` processes run at once.
//! - At most `max_workers + queue_capacity` submissions are admitted
//!   (running or waiting). Beyond that, [`ProcessBridge::submit`] returns
//!   [`SubmitError::QueueFull`] immediately.
//! - Each process is killed after `timeout`.
//!
//! # Routing
//!
//! Every submission carries its own event sender and cancellation token.
//! Lines and the completion signal go only to that sender, tagged with the
//! submission id. Cancelling the token (session closed) completes a queued
//! submission at once, freeing its admission slot, or kills a running process.

pub mod invocation;
pub mod outcome;
pub mod reassembler;
mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::constants;

pub use outcome::Outcome;
pub use reassembler::{LineReassembler, ReassemblerState};

/// Identifier assigned to a submission at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub u64);

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How the serialized change set reaches the authoring process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadDelivery {
    /// Written to the process's stdin, then stdin is closed.
    #[default]
    Stdin,
    /// Passed as the third positional argument.
    ///
    /// Subject to the platform's argument length limit.
    Argument,
}

impl std::str::FromStr for PayloadDelivery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdin" => Ok(Self::Stdin),
            "argument" | "arg" => Ok(Self::Argument),
            other => Err(format!("unknown payload delivery: {other}")),
        }
    }
}

/// Settings for the bridge and the processes it spawns.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Authoring executable.
    pub executable: PathBuf,
    /// First positional argument: the model cache directory.
    pub cache_dir: PathBuf,
    /// Second positional argument: the model to author into.
    pub model_id: String,
    /// Native library directory exported to the process, if any.
    pub library_path: Option<PathBuf>,
    /// Variable `library_path` is exported as.
    pub library_path_var: String,
    /// Payload delivery mode.
    pub payload_delivery: PayloadDelivery,
    /// Processes allowed to run at once.
    pub max_workers: usize,
    /// Admitted submissions allowed to wait for a worker.
    pub queue_capacity: usize,
    /// Wall-clock limit per process.
    pub timeout: Duration,
}

impl BridgeConfig {
    /// Defaults for `executable`, everything else from [`constants`].
    pub fn new(executable: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            cache_dir: cache_dir.into(),
            model_id: constants::DEFAULT_MODEL_ID.to_string(),
            library_path: None,
            library_path_var: constants::DEFAULT_LIBRARY_PATH_VAR.to_string(),
            payload_delivery: PayloadDelivery::default(),
            max_workers: constants::DEFAULT_MAX_WORKERS,
            queue_capacity: constants::DEFAULT_QUEUE_CAPACITY,
            timeout: constants::DEFAULT_SUBMISSION_TIMEOUT,
        }
    }

    /// Total submissions admitted at once (running plus waiting).
    pub fn capacity(&self) -> usize {
        self.max_workers.max(1) + self.queue_capacity
    }
}

/// Event delivered to the session that made a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// One complete stdout line.
    Line {
        /// Submission that produced the line.
        submission: SubmissionId,
        /// Line text without terminator.
        line: String,
    },
    /// Submission finished. Sent exactly once, after its last line.
    Completed {
        /// Finished submission.
        submission: SubmissionId,
        /// How it finished.
        outcome: Outcome,
    },
}

/// A change set to author, plus where its results go.
#[derive(Debug)]
pub struct Submission {
    /// Session that submitted it, for logging.
    pub session_id: String,
    /// Serialized change set.
    pub payload: String,
    /// Receives this submission's lines and completion.
    pub events: mpsc::UnboundedSender<BridgeEvent>,
    /// Cancelled when the session goes away.
    pub cancel: CancellationToken,
}

/// Why a submission was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// Every worker is busy and the queue is full.
    QueueFull {
        /// Admission limit that was hit.
        capacity: usize,
    },
    /// The bridge is shutting down.
    ShuttingDown,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull { capacity } => {
                write!(f, "Authoring queue is full ({capacity} submissions in flight)")
            }
            Self::ShuttingDown => write!(f, "Authoring bridge is shutting down"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// An admitted submission waiting for or held by a worker.
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) id: SubmissionId,
    pub(crate) session_id: String,
    pub(crate) payload: String,
    pub(crate) events: mpsc::UnboundedSender<BridgeEvent>,
    pub(crate) cancel: CancellationToken,
    /// Admission slot, released when the job is dropped.
    _permit: OwnedSemaphorePermit,
}

impl Job {
    pub(crate) fn emit_line(&self, line: String) {
        if self
            .events
            .send(BridgeEvent::Line {
                submission: self.id,
                line,
            })
            .is_err()
        {
            log::debug!("[Bridge] Session {} gone, dropping line for {}", self.session_id, self.id);
        }
    }

    pub(crate) fn complete(self, outcome: Outcome) {
        log::info!(
            "[Bridge] Submission {} for session {} {}",
            self.id,
            self.session_id,
            outcome
        );
        let _ = self.events.send(BridgeEvent::Completed {
            submission: self.id,
            outcome,
        });
    }
}

/// Queue entry for an admitted job.
///
/// Until a worker claims it, the job is also held by a watcher task that
/// completes it as [`Outcome::Cancelled`] the moment its session goes away,
/// releasing its admission permit before any worker pops the entry.
#[derive(Debug)]
pub(crate) struct QueuedJob {
    id: SubmissionId,
    slot: Arc<std::sync::Mutex<Option<Job>>>,
    claimed: CancellationToken,
}

impl QueuedJob {
    /// Wrap `job` and start its cancellation watcher.
    fn new(job: Job) -> Self {
        let id = job.id;
        let cancel = job.cancel.clone();
        let slot = Arc::new(std::sync::Mutex::new(Some(job)));
        let claimed = CancellationToken::new();

        let watched = Arc::clone(&slot);
        let released = claimed.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = released.cancelled() => {}
                () = cancel.cancelled() => {
                    if let Some(job) = take_job(&watched) {
                        log::info!("[Bridge] {} cancelled while queued", job.id);
                        job.complete(Outcome::Cancelled);
                    }
                }
            }
        });

        Self { id, slot, claimed }
    }

    /// Take the job for running, `None` if it was already cancelled.
    pub(crate) fn claim(&self) -> Option<Job> {
        self.claimed.cancel();
        take_job(&self.slot)
    }

    pub(crate) fn id(&self) -> SubmissionId {
        self.id
    }
}

impl Drop for QueuedJob {
    fn drop(&mut self) {
        self.claimed.cancel();
    }
}

fn take_job(slot: &std::sync::Mutex<Option<Job>>) -> Option<Job> {
    slot.lock().expect("queued job lock poisoned").take()
}

/// Bounded pool of authoring workers shared by all sessions.
#[derive(Debug)]
pub struct ProcessBridge {
    config: Arc<BridgeConfig>,
    admission: Arc<Semaphore>,
    queue_tx: mpsc::UnboundedSender<QueuedJob>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ProcessBridge {
    /// Start the worker pool. Must be called inside a tokio runtime.
    pub fn start(config: BridgeConfig) -> Self {
        let config = Arc::new(config);
        let workers = config.max_workers.max(1);
        let admission = Arc::new(Semaphore::new(config.capacity()));
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<QueuedJob>();
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let shutdown = CancellationToken::new();

        for index in 0..workers {
            tokio::spawn(worker::run(
                index,
                Arc::clone(&config),
                Arc::clone(&queue_rx),
                shutdown.clone(),
            ));
        }

        log::info!(
            "[Bridge] Started {} workers (queue {}) for {}",
            workers,
            config.queue_capacity,
            config.executable.display()
        );

        Self {
            config,
            admission,
            queue_tx,
            next_id: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Admit a submission and queue it for the next free worker.
    ///
    /// Never waits: when the bridge is at capacity the submission is
    /// rejected with [`SubmitError::QueueFull`].
    pub fn submit(&self, submission: Submission) -> Result<SubmissionId, SubmitError> {
        if self.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }

        let permit = Arc::clone(&self.admission)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => SubmitError::QueueFull {
                    capacity: self.config.capacity(),
                },
                TryAcquireError::Closed => SubmitError::ShuttingDown,
            })?;

        let id = SubmissionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let job = Job {
            id,
            session_id: submission.session_id,
            payload: submission.payload,
            events: submission.events,
            cancel: submission.cancel,
            _permit: permit,
        };

        log::info!(
            "[Bridge] Admitted submission {} from session {} ({} bytes)",
            id,
            job.session_id,
            job.payload.len()
        );

        self.queue_tx
            .send(QueuedJob::new(job))
            .map_err(|_closed| SubmitError::ShuttingDown)?;
        Ok(id)
    }

    /// Admission slots currently free.
    pub fn available(&self) -> usize {
        self.admission.available_permits()
    }

    /// Bridge settings.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Stop admitting, cancel queued submissions and kill running processes.
    pub fn shutdown(&self) {
        log::info!("[Bridge] Shutting down");
        self.admission.close();
        self.shutdown.cancel();
    }
}

impl Drop for ProcessBridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
