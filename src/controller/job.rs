use std::{fmt, future::Future};

use futures::future::BoxFuture;

use crate::BoxError;

pub(crate) type Work = BoxFuture<'static, Result<(), BoxError>>;

pub(crate) type StateCallback<O> =
    Box<dyn Fn(&O, StateChange) -> Result<(), BoxError> + Send + Sync + 'static>;

pub(crate) type QueuedCallback<O> =
    Box<dyn FnOnce(O, usize) -> BoxFuture<'static, Result<(), BoxError>> + Send + 'static>;

/// The result of [request_start](crate::AdmissionController::request_start).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Admission {
    /// There was spare capacity, so the work was launched.
    Started,
    /// The controller was at capacity, so the job joined the back of the waiting line.
    Queued,
    /// The owner already has a running job. Nothing was launched.
    AlreadyRunning,
    /// The owner is already waiting in line. Nothing was enqueued.
    AlreadyQueued,
}

/// Whether a job is occupying a slot or waiting for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Occupying a slot.
    Running,
    /// In the waiting line.
    Waiting,
}

/// Passed to the state change callback whenever the controller moves an owner between running and
/// waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// The new state.
    pub state: JobState,
    /// Position in the waiting line, starting from 1. Only set when waiting.
    pub position: Option<usize>,
}

/// A request to run some work on behalf of an owner.
///
/// The owner is typically a user identifier. At most one job per owner is running or waiting at
/// any time.
pub struct JobRequest<O> {
    pub(crate) owner: O,
    pub(crate) work: Work,
    pub(crate) on_state_change: Option<StateCallback<O>>,
    pub(crate) on_queued: Option<QueuedCallback<O>>,
}

impl Admission {
    /// A snake case name, e.g. `already_running`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Started => "started",
            Admission::Queued => "queued",
            Admission::AlreadyRunning => "already_running",
            Admission::AlreadyQueued => "already_queued",
        }
    }
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StateChange {
    pub(crate) fn running() -> Self {
        Self {
            state: JobState::Running,
            position: None,
        }
    }

    pub(crate) fn waiting(position: usize) -> Self {
        Self {
            state: JobState::Waiting,
            position: Some(position),
        }
    }
}

impl<O> JobRequest<O> {
    /// Create a request to run `work` for `owner`.
    ///
    /// The work is launched on the Tokio runtime once admitted, and is never awaited by the
    /// controller. It must call [finish](crate::AdmissionController::finish) when done, or be
    /// created with [releasing_job](crate::AdmissionController::releasing_job) which does so
    /// automatically.
    pub fn new<F>(owner: O, work: F) -> Self
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            owner,
            work: Box::pin(work),
            on_state_change: None,
            on_queued: None,
        }
    }

    /// Called whenever the owner starts running or starts waiting.
    ///
    /// Invoked while the controller's state is locked, so it must not call back into the
    /// controller, apart from [limit](crate::AdmissionController::limit). Errors and panics are
    /// logged and otherwise ignored.
    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&O, StateChange) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.on_state_change = Some(Box::new(callback));
        self
    }

    /// Called once if the job has to wait, with the owner and its position in line.
    ///
    /// Awaited before [request_start](crate::AdmissionController::request_start) returns. Errors
    /// and panics are logged and otherwise ignored.
    pub fn on_queued<F, Fut>(mut self, callback: F) -> Self
    where
        F: FnOnce(O, usize) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_queued = Some(Box::new(move |owner, position| {
            Box::pin(callback(owner, position))
        }));
        self
    }

    /// The owner of this job.
    pub fn owner(&self) -> &O {
        &self.owner
    }
}

impl<O: fmt::Debug> fmt::Debug for JobRequest<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRequest")
            .field("owner", &self.owner)
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_queued", &self.on_queued.is_some())
            .finish_non_exhaustive()
    }
}
