//! Background refresh loops.
//!
//! [`live`] keeps the cache fresh for a signed-in session; [`public`] polls a
//! share link without a session. A client runs at most one of them at a
//! time, enforced by the [`PollerSlot`].

pub mod live;
pub mod public;

pub use live::{LiveSync, Visibility};
pub use public::{PublicShare, PublicState, RevokedShares};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};

/// Exclusive right to run a poll loop for one client
#[derive(Default)]
pub struct PollerSlot {
    busy: AtomicBool,
}

impl PollerSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquire(self: &Arc<Self>) -> Result<PollerLease> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ClientError::PollerBusy);
        }
        Ok(PollerLease { slot: self.clone() })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held by a running poll task; releases the slot when the task ends
pub struct PollerLease {
    slot: Arc<PollerSlot>,
}

impl Drop for PollerLease {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

/// Handle to a running poll task. Dropping it cancels the stop token, and the
/// loop exits at its next await point.
pub struct PollHandle {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    fn new(stop: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            stop,
            task: Some(task),
        }
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the task to end, either through [`PollHandle::stop`] or on
    /// its own (session ended, share link invalid).
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Poll task failed");
            }
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
