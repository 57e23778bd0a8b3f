//! Application-facing control of a [`Supervisor`].
//!
//! Besides start/stop, the controller lets callers opt a span of known long
//! work out of detection. Suspensions nest: only the outermost one stops
//! and restarts the supervisor.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::Result;
use crate::supervisor::{Supervisor, WatchdogStatus};

#[derive(Debug, Clone)]
pub struct LifecycleController {
    supervisor: Arc<Supervisor>,
    suspend_depth: Arc<Mutex<u32>>,
}

impl LifecycleController {
    #[must_use]
    pub fn new(supervisor: Supervisor) -> Self {
        Self::from_shared(Arc::new(supervisor))
    }

    #[must_use]
    pub fn from_shared(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            suspend_depth: Arc::new(Mutex::new(0)),
        }
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn start(&self) -> Result<()> {
        self.supervisor.start()
    }

    pub fn stop(&self) {
        self.supervisor.stop();
    }

    #[must_use]
    pub fn status(&self) -> WatchdogStatus {
        self.supervisor.status()
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        *self.suspend_depth.lock() > 0
    }

    /// Stop detection until the returned guard is dropped.
    ///
    /// Dropping the outermost guard starts the supervisor again, including
    /// during unwinding.
    pub fn suspend(&self) -> SuspendGuard {
        let mut depth = self.suspend_depth.lock();
        if *depth == 0 {
            debug!("Suspending blocked-unit detection");
            self.supervisor.stop();
        }
        *depth += 1;
        SuspendGuard {
            supervisor: Arc::clone(&self.supervisor),
            suspend_depth: Arc::clone(&self.suspend_depth),
        }
    }

    /// Run `f` with detection suspended.
    pub fn run_with_detection_suspended<T, F>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let _guard = self.suspend();
        f()
    }

    /// Await `fut` with detection suspended.
    ///
    /// Detection resumes when the future completes, panics, or is dropped
    /// before completion.
    pub async fn run_with_detection_suspended_async<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        let _guard = self.suspend();
        fut.await
    }
}

/// Keeps detection suspended while alive.
#[must_use = "detection resumes as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SuspendGuard {
    supervisor: Arc<Supervisor>,
    suspend_depth: Arc<Mutex<u32>>,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        let mut depth = self.suspend_depth.lock();
        *depth = depth.saturating_sub(1);
        if *depth == 0 {
            debug!("Resuming blocked-unit detection");
            if let Err(e) = self.supervisor.start() {
                error!(
                    error = %e,
                    remediation = %e.remediation().summary,
                    "Failed to restart supervisor after suspension"
                );
            }
        }
    }
}
