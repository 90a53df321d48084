//! Process-local guard against executing the same job twice at once.
//!
//! Best effort only: another process consuming the same subscription can still run the job
//! concurrently.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Set of job ids currently executing in this process.
#[derive(Debug, Clone, Default)]
pub struct InFlightLocks {
    jobs: Arc<Mutex<HashSet<String>>>,
}

impl InFlightLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `job_id`. Returns `None` when another execution already holds it.
    ///
    /// The claim is released when the returned guard is dropped, including during unwinding.
    pub fn try_acquire(&self, job_id: &str) -> Option<InFlightGuard> {
        if self.lock().insert(job_id.to_string()) {
            Some(InFlightGuard {
                jobs: self.jobs.clone(),
                job_id: job_id.to_string(),
            })
        } else {
            None
        }
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().contains(job_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Membership of one job id in [`InFlightLocks`].
#[derive(Debug)]
pub struct InFlightGuard {
    jobs: Arc<Mutex<HashSet<String>>>,
    job_id: String,
}

impl InFlightGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}
