use std::{
    any::Any,
    collections::{HashSet, VecDeque},
    fmt::{self, Debug},
    hash::Hash,
    mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures::FutureExt;
use tracing::{debug, error, info, warn};

pub use job::{Admission, JobRequest, JobState, StateChange};

use job::{StateCallback, Work};

use crate::{ConfigError, ControllerConfig, Limit};

mod job;
mod release;

/// Identifies who a job belongs to, e.g. a chat user ID.
///
/// Implemented for any type with the required bounds.
pub trait Owner: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Owner for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Limits the number of concurrently running jobs, queueing the rest in FIFO order.
///
/// Each job belongs to an [Owner]. An owner can have at most one job running or waiting at a time.
///
/// Jobs are launched onto the Tokio runtime as soon as they are admitted, and must call
/// [finish](Self::finish) when done to free their slot. When a slot frees up, or the limit is
/// raised, waiting jobs are admitted in the order they were requested.
///
/// Cheaply cloneable. Clones share the same state.
pub struct AdmissionController<O> {
    inner: Arc<Inner<O>>,
}

struct Inner<O> {
    /// Mirrors `state.limit` so it can be read without locking.
    limit: AtomicUsize,
    job_timeout: Option<Duration>,
    state: Mutex<State<O>>,
}

struct State<O> {
    limit: Limit,
    running: HashSet<O>,
    waiting: VecDeque<Waiting<O>>,
    /// Owners in `waiting`.
    queued: HashSet<O>,
}

struct Waiting<O> {
    owner: O,
    work: Work,
    on_state_change: Option<StateCallback<O>>,
}

/// A snapshot of the state of an [AdmissionController].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerState<O> {
    limit: usize,
    running: Vec<O>,
    waiting: Vec<O>,
}

impl<O: Owner> AdmissionController<O> {
    /// Create a controller with the given concurrency limit.
    pub fn new(limit: Limit) -> Self {
        Self::with_config(ControllerConfig::new(limit))
    }

    /// Create a controller from a [ControllerConfig].
    pub fn with_config(config: ControllerConfig) -> Self {
        let limit = config.limit();
        Self {
            inner: Arc::new(Inner {
                limit: AtomicUsize::new(limit.get()),
                job_timeout: config.job_timeout(),
                state: Mutex::new(State {
                    limit,
                    running: HashSet::new(),
                    waiting: VecDeque::new(),
                    queued: HashSet::new(),
                }),
            }),
        }
    }

    /// Ask to run a job.
    ///
    /// - If the owner already has a running job, returns [Admission::AlreadyRunning].
    /// - If there is spare capacity, launches the work and returns [Admission::Started].
    /// - If the owner is already waiting, returns [Admission::AlreadyQueued].
    /// - Otherwise, adds the job to the back of the waiting line, awaits the `on_queued` callback
    ///   and returns [Admission::Queued].
    ///
    /// Never waits for the work itself. Failures in the work or the callbacks are logged, not
    /// returned.
    ///
    /// # Panics
    ///
    /// If called outside of a Tokio runtime.
    pub async fn request_start(&self, request: JobRequest<O>) -> Admission {
        let JobRequest {
            owner,
            work,
            on_state_change,
            on_queued,
        } = request;

        // Rejected work and callbacks are dropped only after the state lock is released.
        let position = {
            let mut state = self.inner.lock_state();

            if state.running.contains(&owner) {
                drop(state);
                debug!(?owner, "job already running");
                return Admission::AlreadyRunning;
            }

            if state.has_capacity() {
                state.running.insert(owner.clone());
                debug!(
                    ?owner,
                    running = state.running.len(),
                    limit = state.limit.get(),
                    "starting job"
                );
                launch(owner, work, on_state_change);
                return Admission::Started;
            }

            if state.queued.contains(&owner) {
                drop(state);
                debug!(?owner, "job already queued");
                return Admission::AlreadyQueued;
            }

            let position = state.waiting.len() + 1;
            notify_state_change(
                on_state_change.as_ref(),
                &owner,
                StateChange::waiting(position),
            );
            state.queued.insert(owner.clone());
            state.waiting.push_back(Waiting {
                owner: owner.clone(),
                work,
                on_state_change,
            });
            debug!(?owner, position, "job queued");

            position
        };

        if let Some(on_queued) = on_queued {
            let notify = AssertUnwindSafe(async { on_queued(owner.clone(), position).await });
            match notify.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(?owner, %error, "queued callback failed"),
                Err(panic) => {
                    warn!(?owner, panic = %panic_message(&*panic), "queued callback panicked")
                }
            }
        }

        Admission::Queued
    }

    /// Free the owner's slot, then admit waiting jobs while there is capacity.
    ///
    /// Does nothing for an owner with no running job, other than admitting waiting jobs. An owner
    /// which is still waiting is removed from the line, and a warning is logged.
    ///
    /// # Panics
    ///
    /// If a waiting job is admitted outside of a Tokio runtime.
    pub fn finish(&self, owner: &O) {
        self.inner.finish(owner);
    }

    /// Change the concurrency limit, returning the new limit.
    ///
    /// Accepts anything convertible to a [Limit], e.g. integers, floats or strings. Values which
    /// aren't positive integers are rejected, leaving the limit unchanged.
    ///
    /// Raising the limit immediately admits waiting jobs. Lowering it doesn't stop running jobs:
    /// no more are admitted until enough have finished.
    ///
    /// # Panics
    ///
    /// If a waiting job is admitted outside of a Tokio runtime.
    pub fn set_limit<L>(&self, limit: L) -> Result<usize, ConfigError>
    where
        L: TryInto<Limit>,
        ConfigError: From<L::Error>,
    {
        let limit: Limit = match limit.try_into() {
            Ok(limit) => limit,
            Err(e) => {
                let error = ConfigError::from(e);
                warn!(%error, "rejected concurrency limit");
                return Err(error);
            }
        };

        let mut state = self.inner.lock_state();
        let old_limit = mem::replace(&mut state.limit, limit);
        self.inner.limit.store(limit.get(), Ordering::Release);
        info!(
            old_limit = old_limit.get(),
            new_limit = limit.get(),
            "concurrency limit changed"
        );

        state.drain();

        Ok(limit.get())
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> ControllerState<O> {
        let state = self.inner.lock_state();
        ControllerState {
            limit: state.limit.get(),
            running: state.running.iter().cloned().collect(),
            waiting: state.waiting.iter().map(|w| w.owner.clone()).collect(),
        }
    }

    /// Whether the owner has a running job.
    pub fn is_running(&self, owner: &O) -> bool {
        self.inner.lock_state().running.contains(owner)
    }

    /// The owner's position in the waiting line, starting from 1.
    pub fn position(&self, owner: &O) -> Option<usize> {
        self.inner
            .lock_state()
            .waiting
            .iter()
            .position(|w| &w.owner == owner)
            .map(|index| index + 1)
    }

    /// The number of running jobs.
    pub fn running_count(&self) -> usize {
        self.inner.lock_state().running.len()
    }

    /// The number of waiting jobs.
    pub fn waiting_count(&self) -> usize {
        self.inner.lock_state().waiting.len()
    }
}

impl<O> AdmissionController<O> {
    /// The current concurrency limit.
    pub fn limit(&self) -> usize {
        self.inner.limit.load(Ordering::Acquire)
    }
}

impl<O: Owner> Default for AdmissionController<O> {
    /// A controller with the default limit of 3.
    fn default() -> Self {
        Self::new(Limit::default())
    }
}

impl<O> Clone for AdmissionController<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O> Debug for AdmissionController<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("limit", &self.limit())
            .field("job_timeout", &self.inner.job_timeout)
            .finish_non_exhaustive()
    }
}

impl<O: Owner> Inner<O> {
    fn lock_state(&self) -> MutexGuard<'_, State<O>> {
        // Callbacks run under the lock are panic-guarded, so the state is always consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, owner: &O) {
        let removed = {
            let mut state = self.lock_state();

            if state.running.remove(owner) {
                debug!(?owner, "job finished");
            }

            let mut removed = None;
            if state.queued.remove(owner) {
                let index = state.waiting.iter().position(|w| &w.owner == owner);
                removed = index.and_then(|index| state.waiting.remove(index));
                warn!(?owner, "finished a job which was still waiting, removed it from the queue");
            }

            state.drain();

            removed
        };

        // Never dropped under the lock: the work may release its own slot when dropped.
        drop(removed);
    }
}

impl<O: Owner> State<O> {
    fn has_capacity(&self) -> bool {
        self.running.len() < self.limit.get()
    }

    /// Admit waiting jobs in FIFO order until there is no spare capacity.
    fn drain(&mut self) {
        while self.has_capacity() {
            let Some(next) = self.waiting.pop_front() else {
                break;
            };

            self.queued.remove(&next.owner);
            self.running.insert(next.owner.clone());
            debug!(
                owner = ?next.owner,
                running = self.running.len(),
                limit = self.limit.get(),
                "admitting queued job"
            );

            launch(next.owner, next.work, next.on_state_change);
        }
    }
}

impl<O> ControllerState<O> {
    /// The concurrency limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Owners with running jobs, in no particular order.
    pub fn running(&self) -> &[O] {
        &self.running
    }

    /// Owners waiting for a slot, first in line first.
    pub fn waiting(&self) -> &[O] {
        &self.waiting
    }
}

/// Spawn the work without waiting for it, logging how it ends.
///
/// The callback moves into the task along with the work, so neither is dropped by the caller.
fn launch<O: Owner>(owner: O, work: Work, on_state_change: Option<StateCallback<O>>) {
    notify_state_change(on_state_change.as_ref(), &owner, StateChange::running());

    tokio::spawn(async move {
        let _on_state_change = on_state_change;
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(())) => debug!(?owner, "job completed"),
            Ok(Err(error)) => error!(?owner, %error, "job failed"),
            Err(panic) => error!(?owner, panic = %panic_message(&*panic), "job panicked"),
        }
    });
}

fn notify_state_change<O: Owner>(
    callback: Option<&StateCallback<O>>,
    owner: &O,
    change: StateChange,
) {
    let Some(callback) = callback else {
        return;
    };

    match panic::catch_unwind(AssertUnwindSafe(|| callback(owner, change))) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            warn!(?owner, state = ?change.state, %error, "state change callback failed")
        }
        Err(panic) => warn!(
            ?owner,
            state = ?change.state,
            panic = %panic_message(&*panic),
            "state change callback panicked"
        ),
    }
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
mod tests {
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use super::*;
    use crate::BoxError;

    type Started = mpsc::UnboundedReceiver<&'static str>;

    fn controller(limit: usize) -> AdmissionController<&'static str> {
        AdmissionController::new(Limit::new(limit).unwrap())
    }

    fn job(
        owner: &'static str,
        started: &mpsc::UnboundedSender<&'static str>,
    ) -> JobRequest<&'static str> {
        let started = started.clone();
        JobRequest::new(owner, async move {
            started.send(owner).ok();
            Ok(())
        })
    }

    async fn drain_started(rx: &mut Started) -> Vec<&'static str> {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let mut owners = vec![];
        while let Ok(owner) = rx.try_recv() {
            owners.push(owner);
        }
        owners
    }

    #[tokio::test]
    async fn state_change_callbacks_follow_transitions() {
        let controller = controller(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let changes = Arc::new(Mutex::new(vec![]));

        for owner in ["a", "b"] {
            let changes = changes.clone();
            let request = job(owner, &tx).on_state_change(move |owner, change| {
                changes.lock().unwrap().push((*owner, change));
                Ok(())
            });
            controller.request_start(request).await;
        }
        controller.finish(&"a");

        assert_eq!(drain_started(&mut rx).await, vec!["a", "b"]);
        assert_eq!(
            *changes.lock().unwrap(),
            vec![
                ("a", StateChange::running()),
                ("b", StateChange::waiting(1)),
                ("b", StateChange::running()),
            ]
        );
    }

    #[tokio::test]
    async fn failing_callbacks_dont_block_admission() {
        let controller = controller(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let failing = |_: &&'static str, _: StateChange| -> Result<(), BoxError> {
            Err("session store unavailable".into())
        };

        let admission = controller
            .request_start(job("a", &tx).on_state_change(failing))
            .await;
        assert_eq!(admission, Admission::Started);

        let admission = controller
            .request_start(
                job("b", &tx)
                    .on_state_change(|_, _| panic!("callback panicked"))
                    .on_queued(|_, _| async { Err("chat transport down".into()) }),
            )
            .await;
        assert_eq!(admission, Admission::Queued);

        controller.finish(&"a");

        assert_eq!(drain_started(&mut rx).await, vec!["a", "b"]);
        assert!(controller.is_running(&"b"));
    }

    #[tokio::test]
    async fn panicking_queued_callback_is_contained() {
        let controller = controller(1);
        let (tx, _rx) = mpsc::unbounded_channel();

        controller.request_start(job("a", &tx)).await;
        let admission = controller
            .request_start(job("b", &tx).on_queued(|_, _| async { panic!("boom") }))
            .await;

        assert_eq!(admission, Admission::Queued);
        assert_eq!(controller.position(&"b"), Some(1));
    }

    #[tokio::test]
    async fn failing_work_is_not_propagated() {
        let controller = controller(1);

        let admission = controller
            .request_start(JobRequest::new("a", async { Err("scraper crashed".into()) }))
            .await;
        assert_eq!(admission, Admission::Started);

        tokio::task::yield_now().await;

        // The slot is only freed by finish.
        assert!(controller.is_running(&"a"));
    }

    #[tokio::test]
    async fn finishing_a_waiting_owner_keeps_the_rest_in_order() {
        let controller = controller(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for owner in ["a", "b", "c", "d"] {
            controller.request_start(job(owner, &tx)).await;
        }
        assert_eq!(controller.state().waiting(), ["b", "c", "d"]);

        controller.finish(&"c");
        assert_eq!(controller.state().waiting(), ["b", "d"]);
        assert_eq!(controller.position(&"d"), Some(2));
        assert!(controller.is_running(&"a"));

        controller.finish(&"a");
        controller.finish(&"b");

        assert_eq!(drain_started(&mut rx).await, vec!["a", "b", "d"]);
    }

    #[tokio::test]
    async fn lowering_the_limit_doesnt_preempt() {
        let controller = controller(3);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for owner in ["a", "b", "c"] {
            controller.request_start(job(owner, &tx)).await;
        }
        assert_eq!(controller.set_limit(1), Ok(1));
        assert_eq!(controller.running_count(), 3);

        assert_eq!(
            controller.request_start(job("d", &tx)).await,
            Admission::Queued
        );

        controller.finish(&"a");
        controller.finish(&"b");
        assert_eq!(controller.waiting_count(), 1, "still 1 running, at limit");

        controller.finish(&"c");
        assert!(controller.is_running(&"d"));

        assert_eq!(drain_started(&mut rx).await, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn limit_is_readable_from_callbacks() {
        let controller = controller(1);
        let seen = Arc::new(AtomicUsize::new(0));

        let observer = controller.clone();
        let seen_limit = seen.clone();
        let request = JobRequest::new("a", async { Ok(()) }).on_state_change(move |_, _| {
            seen_limit.store(observer.limit(), Ordering::SeqCst);
            Ok(())
        });
        controller.request_start(request).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finish_without_admitting_needs_no_runtime() {
        let controller = controller(1);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(controller.request_start(JobRequest::new("a", async { Ok(()) })));

        controller.finish(&"a");
        controller.finish(&"nobody");

        assert_eq!(controller.running_count(), 0);
    }

    #[test]
    #[should_panic]
    fn admitting_outside_a_runtime_panics() {
        let controller = controller(1);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async {
            controller
                .request_start(JobRequest::new("a", async { Ok(()) }))
                .await;
            controller
                .request_start(JobRequest::new("b", async { Ok(()) }))
                .await;
        });

        controller.finish(&"a");
    }

    #[test]
    fn panic_messages() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*payload), "static");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");

        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}
