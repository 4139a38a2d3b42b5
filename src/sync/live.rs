//! Live sync scheduler
//!
//! Refreshes the snapshot cache for a signed-in session on a fixed interval,
//! whenever the host reports the app visible again, and once at start.
//! Each trigger runs as its own task through the cache's in-flight guard, so
//! overlapping triggers collapse into the refresh that is already running.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{PollHandle, PollerLease};
use crate::cache::{Refresh, SnapshotCache, SnapshotSource};
use crate::session::{Session, SessionStore};

/// Visibility of the hosting view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

pub struct LiveSync {
    cache: Arc<SnapshotCache>,
    sessions: Arc<SessionStore>,
    interval: Duration,
}

impl LiveSync {
    pub fn new(cache: Arc<SnapshotCache>, sessions: Arc<SessionStore>, interval: Duration) -> Self {
        Self {
            cache,
            sessions,
            interval,
        }
    }

    /// Start the scheduler for `session`.
    ///
    /// The task ends when the session's lifetime is cancelled or the returned
    /// handle is stopped or dropped. The lease is released with it.
    pub fn spawn(
        self,
        session: Session,
        visibility: watch::Receiver<Visibility>,
        lease: PollerLease,
    ) -> PollHandle {
        let stop = CancellationToken::new();
        let task = tokio::spawn(self.run(session, visibility, stop.clone(), lease));
        PollHandle::new(stop, task)
    }

    async fn run(
        self,
        session: Session,
        mut visibility: watch::Receiver<Visibility>,
        stop: CancellationToken,
        _lease: PollerLease,
    ) {
        info!(
            session = session.id(),
            interval_secs = self.interval.as_secs(),
            "Live sync started"
        );

        let lifetime = session.lifetime().clone();
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watching = true;

        self.trigger(&session, &stop, false);

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!(session = session.id(), "Live sync stopped");
                    break;
                }
                _ = lifetime.cancelled() => {
                    info!(session = session.id(), "Session ended, live sync stopped");
                    break;
                }
                _ = ticker.tick() => {
                    debug!(session = session.id(), "Poll interval elapsed");
                    self.trigger(&session, &stop, true);
                }
                changed = visibility.changed(), if watching => {
                    match changed {
                        Ok(()) => {
                            if *visibility.borrow_and_update() == Visibility::Visible {
                                debug!(session = session.id(), "View became visible");
                                self.trigger(&session, &stop, true);
                            }
                        }
                        Err(_) => {
                            debug!("Visibility source closed");
                            watching = false;
                        }
                    }
                }
            }
        }
    }

    fn trigger(&self, session: &Session, stop: &CancellationToken, silent: bool) {
        let cache = self.cache.clone();
        let sessions = self.sessions.clone();
        let session = session.clone();
        let stop = stop.clone();

        tokio::spawn(async move {
            if stop.is_cancelled() || !session.is_active() {
                return;
            }
            let source = SnapshotSource::Session(session.clone());
            match cache.refresh_coalesced(&source, silent).await {
                Ok(Refresh::Applied(snapshot)) => {
                    debug!(
                        session = session.id(),
                        consumed = snapshot.consumed,
                        days = snapshot.grouped_history.len(),
                        "Snapshot updated"
                    );
                }
                Ok(Refresh::Stale) => debug!(session = session.id(), "Refresh superseded"),
                Ok(Refresh::Coalesced) => {}
                Err(e) => {
                    sessions.fail(&session, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::session::MemoryCredentialStore;
    use crate::sync::PollerSlot;
    use crate::testing::{FakeApi, PASSWORD};

    const INTERVAL: Duration = Duration::from_secs(30);

    struct Harness {
        api: Arc<FakeApi>,
        cache: Arc<SnapshotCache>,
        sessions: Arc<SessionStore>,
        slot: Arc<PollerSlot>,
    }

    impl Harness {
        async fn new() -> (Self, Session) {
            let api = Arc::new(FakeApi::new());
            let cache = Arc::new(SnapshotCache::new(api.clone()));
            let sessions = Arc::new(SessionStore::new(
                api.clone(),
                Arc::new(MemoryCredentialStore::new()),
                cache.clone(),
            ));
            let session = sessions.login("jin@example.com", PASSWORD).await.unwrap();
            let harness = Self {
                api,
                cache,
                sessions,
                slot: PollerSlot::new(),
            };
            (harness, session)
        }

        fn start(&self, session: &Session, visibility: watch::Receiver<Visibility>) -> PollHandle {
            LiveSync::new(self.cache.clone(), self.sessions.clone(), INTERVAL).spawn(
                session.clone(),
                visibility,
                self.slot.acquire().unwrap(),
            )
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_refresh_then_interval() {
        let (h, session) = Harness::new().await;
        let (_tx, rx) = watch::channel(Visibility::Visible);
        let _handle = h.start(&session, rx);

        settle().await;
        assert_eq!(h.api.calls("stats"), 1);
        assert!(h.cache.snapshot().is_some());

        tokio::time::sleep(INTERVAL).await;
        assert_eq!(h.api.calls("stats"), 2);

        tokio::time::sleep(INTERVAL).await;
        assert_eq!(h.api.calls("stats"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_triggers_refresh() {
        let (h, session) = Harness::new().await;
        let (tx, rx) = watch::channel(Visibility::Visible);
        let _handle = h.start(&session, rx);
        settle().await;

        tx.send(Visibility::Hidden).unwrap();
        settle().await;
        assert_eq!(h.api.calls("stats"), 1);

        tx.send(Visibility::Visible).unwrap();
        settle().await;
        assert_eq!(h.api.calls("stats"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_triggers_coalesce() {
        let (h, session) = Harness::new().await;
        let release = h.api.gate("stats");
        let (tx, rx) = watch::channel(Visibility::Hidden);
        let _handle = h.start(&session, rx);
        settle().await;

        tx.send(Visibility::Visible).unwrap();
        settle().await;
        assert_eq!(h.api.calls("stats"), 1);

        release.send(()).unwrap();
        settle().await;
        assert!(h.cache.snapshot().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_ends_session_and_polling() {
        let (h, session) = Harness::new().await;
        let (_tx, rx) = watch::channel(Visibility::Visible);
        let handle = h.start(&session, rx);
        settle().await;

        h.api
            .fail_next("stats", ClientError::Auth("Could not validate credentials".into()));
        tokio::time::sleep(INTERVAL).await;

        assert!(h.sessions.current().is_none());
        assert!(h.cache.snapshot().is_none());
        assert!(handle.is_finished());
        assert!(!h.slot.is_busy());

        let calls = h.api.calls("stats");
        tokio::time::sleep(INTERVAL * 4).await;
        assert_eq!(h.api.calls("stats"), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_stops_polling() {
        let (h, session) = Harness::new().await;
        let (_tx, rx) = watch::channel(Visibility::Visible);
        let handle = h.start(&session, rx);
        settle().await;

        h.sessions.logout();
        handle.join().await;

        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(h.api.calls("stats"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_polling() {
        let (h, session) = Harness::new().await;
        let (_tx, rx) = watch::channel(Visibility::Visible);
        let handle = h.start(&session, rx);
        settle().await;

        drop(handle);
        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(h.api.calls("stats"), 1);
        assert!(!h.slot.is_busy());
        assert!(session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_keeps_polling() {
        let (h, session) = Harness::new().await;
        let (_tx, rx) = watch::channel(Visibility::Visible);
        let handle = h.start(&session, rx);
        settle().await;

        h.api.fail_next("stats", ClientError::Network("connection reset".into()));
        tokio::time::sleep(INTERVAL).await;
        assert!(h.cache.status().last_error.is_some());
        assert!(h.cache.snapshot().is_some());

        tokio::time::sleep(INTERVAL).await;
        assert!(h.cache.status().last_error.is_none());
        assert!(!handle.is_finished());
    }
}
