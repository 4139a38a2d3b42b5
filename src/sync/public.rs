//! Public share reconciler
//!
//! Polls `/public/stats/{token}` without a session and forwards day-scoped
//! feedback from the viewer. The shared view lives in its own cache, apart
//! from the signed-in user's snapshot. Any failure is terminal: the shared
//! view is cleared, the state moves to [`PublicState::Invalid`] and polling
//! stops.

use chrono::NaiveDate;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{PollHandle, PollerLease};
use crate::api::NutritionApi;
use crate::cache::{Refresh, SnapshotCache, SnapshotSource};
use crate::error::{ClientError, Result};
use crate::model::StatsSnapshot;

/// Share tokens this client has disabled or replaced.
///
/// Consulted before every public request so a revoked link stops working
/// locally without waiting for the server.
#[derive(Debug, Default)]
pub struct RevokedShares {
    tokens: DashSet<String>,
}

impl RevokedShares {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn revoke(&self, token: &str) {
        self.tokens.insert(token.to_string());
    }

    /// Trust a token again after the server confirmed it is live.
    pub fn reinstate(&self, token: &str) {
        self.tokens.remove(token);
    }

    pub fn is_revoked(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicState {
    Idle,
    /// Showing the owner's data
    Live { owner: Option<String> },
    /// The link is invalid, disabled or unreachable. Terminal.
    Invalid { reason: String },
}

pub struct PublicShare {
    api: Arc<dyn NutritionApi>,
    cache: SnapshotCache,
    revoked: Arc<RevokedShares>,
    interval: Duration,
    state: watch::Sender<PublicState>,
}

impl PublicShare {
    pub fn new(api: Arc<dyn NutritionApi>, revoked: Arc<RevokedShares>, interval: Duration) -> Self {
        let (state, _) = watch::channel(PublicState::Idle);
        Self {
            cache: SnapshotCache::new(api.clone()),
            api,
            revoked,
            interval,
            state,
        }
    }

    pub fn state(&self) -> PublicState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PublicState> {
        self.state.subscribe()
    }

    /// The shared snapshot currently shown
    pub fn snapshot(&self) -> Option<Arc<StatsSnapshot>> {
        self.cache.snapshot()
    }

    /// Receiver that changes whenever the shared snapshot is replaced
    pub fn subscribe_snapshot(&self) -> watch::Receiver<u64> {
        self.cache.subscribe()
    }

    /// Fetch the shared snapshot once.
    pub async fn fetch_public(&self, token: &str) -> Result<Arc<StatsSnapshot>> {
        self.fetch(token, false, true).await
    }

    /// Post the viewer's note for `date`, then refresh so the note shows up.
    /// The refresh is always issued, even with a poll in flight, since that
    /// poll may predate the note. An empty note clears the day's feedback.
    /// Not retried on failure.
    pub async fn submit_feedback(&self, token: &str, date: NaiveDate, note: &str) -> Result<()> {
        if self.revoked.is_revoked(token) {
            return Err(self.invalidate(ClientError::ShareLinkInvalid));
        }

        if let Err(e) = self.api.daily_feedback(token, date, note).await {
            if matches!(e, ClientError::ShareLinkInvalid) {
                return Err(self.invalidate(e));
            }
            warn!(%date, error = %e, "Failed to submit feedback");
            return Err(e);
        }
        info!(%date, cleared = note.is_empty(), "Feedback submitted");

        if let Err(e) = self.fetch(token, true, false).await {
            debug!(error = %e, "Refresh after feedback failed");
        }
        Ok(())
    }

    /// Start polling `token`. The first fetch runs immediately; the loop ends
    /// at the first failure or when the handle is stopped.
    pub fn spawn(self: &Arc<Self>, token: String, lease: PollerLease) -> PollHandle {
        let stop = CancellationToken::new();
        let share = self.clone();
        let task = tokio::spawn({
            let stop = stop.clone();
            async move { share.run(token, stop, lease).await }
        });
        PollHandle::new(stop, task)
    }

    async fn run(&self, token: String, stop: CancellationToken, _lease: PollerLease) {
        if self.fetch(&token, false, true).await.is_err() {
            return;
        }
        info!(interval_secs = self.interval.as_secs(), "Public share polling started");

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("Public share polling stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if self.fetch(&token, true, true).await.is_err() {
                        info!("Share link no longer valid, polling stopped");
                        break;
                    }
                }
            }
        }
    }

    /// `coalesce` lets a fetch ride on one already in flight.
    async fn fetch(&self, token: &str, silent: bool, coalesce: bool) -> Result<Arc<StatsSnapshot>> {
        if self.revoked.is_revoked(token) {
            return Err(self.invalidate(ClientError::ShareLinkInvalid));
        }

        let source = SnapshotSource::Share(token.to_string());
        let result = if coalesce {
            self.cache.refresh_coalesced(&source, silent).await
        } else {
            self.cache.refresh(&source, silent).await
        };
        let outcome = result.map_err(|e| self.invalidate(e))?;

        // revoked while the request was in flight
        if self.revoked.is_revoked(token) {
            return Err(self.invalidate(ClientError::ShareLinkInvalid));
        }

        let snapshot = match outcome {
            Refresh::Applied(snapshot) => snapshot,
            Refresh::Stale | Refresh::Coalesced => self
                .cache
                .snapshot()
                .ok_or(ClientError::ShareLinkInvalid)?,
        };
        self.state.send_replace(PublicState::Live {
            owner: snapshot.user_name.clone(),
        });
        Ok(snapshot)
    }

    fn invalidate(&self, err: ClientError) -> ClientError {
        warn!(error = %err, "Share link unusable; clearing shared view");
        self.cache.clear();
        self.state.send_replace(PublicState::Invalid {
            reason: err.to_string(),
        });
        err
    }
}
