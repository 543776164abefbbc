use std::{
    future::Future,
    sync::{Arc, Weak},
};

use crate::{error::TimedOut, AdmissionController, BoxError, JobRequest};

use super::{Inner, Owner};

/// Frees an owner's slot when dropped, by calling
/// [finish](crate::AdmissionController::finish).
///
/// Only ever created inside admitted work, so a rejected or dequeued job never holds one.
///
/// Doesn't keep the controller alive.
#[must_use = "the slot is released as soon as the guard is dropped"]
pub(crate) struct ReleaseGuard<O: Owner> {
    controller: Weak<Inner<O>>,
    owner: O,
}

impl<O: Owner> ReleaseGuard<O> {
    fn new(controller: Weak<Inner<O>>, owner: O) -> Self {
        Self { controller, owner }
    }
}

impl<O: Owner> Drop for ReleaseGuard<O> {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.upgrade() {
            controller.finish(&self.owner);
        }
    }
}

impl<O: Owner> std::fmt::Debug for ReleaseGuard<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseGuard")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl<O: Owner> AdmissionController<O> {
    /// Create a [JobRequest] which releases its slot once `work` completes, fails or panics.
    ///
    /// The slot is only released by work which was admitted and started. Dropping a request which
    /// was rejected as a duplicate, or removed from the waiting line, leaves the owner's running
    /// job alone.
    ///
    /// If a job timeout is configured, the work is cancelled after that long and logged as a
    /// [TimedOut] failure.
    pub fn releasing_job<F>(&self, owner: O, work: F) -> JobRequest<O>
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let controller = Arc::downgrade(&self.inner);
        let guard_owner = owner.clone();
        let job_timeout = self.inner.job_timeout;

        JobRequest::new(owner, async move {
            let _guard = ReleaseGuard::new(controller, guard_owner);

            match job_timeout {
                Some(after) => match tokio::time::timeout(after, work).await {
                    Ok(result) => result,
                    Err(_) => Err(TimedOut(after).into()),
                },
                None => work.await,
            }
        })
    }
}
