//! Stats snapshot cache
//!
//! Holds the single in-memory [`StatsSnapshot`] the dashboard renders.
//! Every write takes the next sequence number: a fetched snapshot, an
//! optimistic patch, a rollback, or a clear. A fetched snapshot is applied
//! only if no write issued after its request has already landed, so a slow
//! poll can never overwrite newer state.

use arc_swap::ArcSwapOption;
use dashmap::DashSet;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::api::NutritionApi;
use crate::error::Result;
use crate::model::StatsSnapshot;
use crate::session::Session;

/// Identity used to coalesce overlapping refreshes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    Session(u64),
    Share(String),
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKey::Session(id) => write!(f, "session#{}", id),
            SourceKey::Share(_) => f.write_str("share"),
        }
    }
}

/// Where a snapshot is fetched from
#[derive(Debug, Clone)]
pub enum SnapshotSource {
    /// `GET /stats` with the session's credential
    Session(Session),
    /// `GET /public/stats/{token}`
    Share(String),
}

impl SnapshotSource {
    pub fn key(&self) -> SourceKey {
        match self {
            SnapshotSource::Session(session) => SourceKey::Session(session.id()),
            SnapshotSource::Share(token) => SourceKey::Share(token.clone()),
        }
    }

    fn is_ended(&self) -> bool {
        matches!(self, SnapshotSource::Session(session) if !session.is_active())
    }
}

/// Outcome of a refresh that did not fail
#[derive(Debug, Clone)]
pub enum Refresh {
    /// The fetched snapshot replaced the cached one
    Applied(Arc<StatsSnapshot>),
    /// A newer write landed first, or the session ended; the response was dropped
    Stale,
    /// A refresh for the same source was already in flight
    Coalesced,
}

impl Refresh {
    pub fn applied(&self) -> Option<&Arc<StatsSnapshot>> {
        match self {
            Refresh::Applied(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

/// Indicators for the view
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatus {
    /// A non-silent refresh is running
    pub refreshing: bool,
    /// A silent refresh is running
    pub background: bool,
    /// Message of the last failed refresh, cleared by the next success
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Sequencer {
    issued: u64,
    applied: u64,
    loading: usize,
    background: usize,
    last_error: Option<String>,
}

impl Sequencer {
    fn claim(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }
}

pub struct SnapshotCache {
    api: Arc<dyn NutritionApi>,
    current: ArcSwapOption<StatsSnapshot>,
    seq: Mutex<Sequencer>,
    in_flight: DashSet<SourceKey>,
    version: watch::Sender<u64>,
}

impl SnapshotCache {
    pub fn new(api: Arc<dyn NutritionApi>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            api,
            current: ArcSwapOption::empty(),
            seq: Mutex::new(Sequencer::default()),
            in_flight: DashSet::new(),
            version,
        }
    }

    pub fn snapshot(&self) -> Option<Arc<StatsSnapshot>> {
        self.current.load_full()
    }

    pub fn status(&self) -> CacheStatus {
        let seq = self.seq.lock();
        CacheStatus {
            refreshing: seq.loading > 0,
            background: seq.background > 0,
            last_error: seq.last_error.clone(),
        }
    }

    /// Receiver that changes every time the cached snapshot is replaced
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Fetch a fresh snapshot and replace the cached one.
    ///
    /// On failure the cached snapshot is kept and `last_error` is set.
    /// `silent` refreshes raise only the background indicator.
    pub async fn refresh(&self, source: &SnapshotSource, silent: bool) -> Result<Refresh> {
        let ticket = self.begin(silent);
        debug!(seq = ticket.seq, source = %source.key(), silent, "Refreshing snapshot");

        let result = match source {
            SnapshotSource::Session(session) => self.api.stats(session.credential()).await,
            SnapshotSource::Share(token) => self.api.public_stats(token).await,
        };

        self.finish(&ticket, source, result)
    }

    /// Like [`SnapshotCache::refresh`], but a refresh for a source that
    /// already has one in flight returns [`Refresh::Coalesced`] immediately.
    pub async fn refresh_coalesced(&self, source: &SnapshotSource, silent: bool) -> Result<Refresh> {
        let key = source.key();
        if !self.in_flight.insert(key.clone()) {
            debug!(source = %key, "Refresh already in flight");
            return Ok(Refresh::Coalesced);
        }
        let _guard = InFlight {
            set: &self.in_flight,
            key,
        };
        self.refresh(source, silent).await
    }

    /// Apply an optimistic local patch. Returns the snapshot it replaced,
    /// which is what a rollback restores.
    pub(crate) fn patch(&self, apply: impl FnOnce(&mut StatsSnapshot)) -> Option<Arc<StatsSnapshot>> {
        let before = {
            let mut seq = self.seq.lock();
            let before = self.current.load_full();
            if let Some(current) = &before {
                let mut next = StatsSnapshot::clone(current);
                apply(&mut next);
                self.write(&mut seq, Some(Arc::new(next)));
            }
            before
        };
        if before.is_some() {
            self.notify();
        }
        before
    }

    /// Put back a snapshot captured by [`SnapshotCache::patch`].
    pub(crate) fn restore(&self, before: Option<Arc<StatsSnapshot>>) {
        {
            let mut seq = self.seq.lock();
            self.write(&mut seq, before);
        }
        self.notify();
    }

    /// Drop the cached snapshot. In-flight refreshes issued before the clear
    /// are discarded when they complete.
    pub fn clear(&self) {
        {
            let mut seq = self.seq.lock();
            seq.last_error = None;
            self.write(&mut seq, None);
        }
        self.notify();
    }

    fn write(&self, seq: &mut Sequencer, value: Option<Arc<StatsSnapshot>>) {
        seq.applied = seq.claim();
        self.current.store(value);
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn begin(&self, silent: bool) -> Ticket<'_> {
        let mut seq = self.seq.lock();
        if silent {
            seq.background += 1;
        } else {
            seq.loading += 1;
        }
        Ticket {
            cache: self,
            seq: seq.claim(),
            silent,
        }
    }

    fn finish(
        &self,
        ticket: &Ticket<'_>,
        source: &SnapshotSource,
        result: Result<StatsSnapshot>,
    ) -> Result<Refresh> {
        let mut seq = self.seq.lock();

        if source.is_ended() {
            debug!(seq = ticket.seq, source = %source.key(), "Discarding response for ended session");
            return Ok(Refresh::Stale);
        }

        match result {
            Ok(snapshot) => {
                if ticket.seq <= seq.applied {
                    debug!(
                        seq = ticket.seq,
                        applied = seq.applied,
                        "Discarding stale snapshot"
                    );
                    return Ok(Refresh::Stale);
                }
                let snapshot = Arc::new(snapshot);
                self.current.store(Some(snapshot.clone()));
                seq.applied = ticket.seq;
                seq.last_error = None;
                drop(seq);

                self.notify();
                Ok(Refresh::Applied(snapshot))
            }
            Err(e) => {
                warn!(seq = ticket.seq, error = %e, "Snapshot refresh failed; keeping last snapshot");
                seq.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }
}

/// Indicator bookkeeping for one refresh; released even if the refresh
/// future is dropped mid-request.
struct Ticket<'a> {
    cache: &'a SnapshotCache,
    seq: u64,
    silent: bool,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        let mut seq = self.cache.seq.lock();
        if self.silent {
            seq.background = seq.background.saturating_sub(1);
        } else {
            seq.loading = seq.loading.saturating_sub(1);
        }
    }
}

struct InFlight<'a> {
    set: &'a DashSet<SourceKey>,
    key: SourceKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::model::snapshot::fixtures;
    use crate::testing::FakeApi;
    use tokio_test::{assert_pending, assert_ready, task};

    fn setup() -> (Arc<FakeApi>, SnapshotCache, SnapshotSource) {
        let api = Arc::new(FakeApi::new());
        let cache = SnapshotCache::new(api.clone());
        (api, cache, SnapshotSource::Session(Session::new(1, "cred-1")))
    }

    fn with_target(target: i64) -> StatsSnapshot {
        let mut snapshot = fixtures::snapshot();
        snapshot.target = target;
        snapshot
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let (_api, cache, source) = setup();
        let mut version = cache.subscribe();

        let outcome = cache.refresh(&source, false).await.unwrap();
        assert!(outcome.applied().is_some());
        assert_eq!(cache.snapshot().unwrap().target, 2000);
        assert!(version.has_changed().unwrap());
        assert_eq!(*version.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_snapshot() {
        let (api, cache, source) = setup();
        cache.refresh(&source, false).await.unwrap();
        let before = cache.snapshot().unwrap();

        api.fail_next("stats", ClientError::Network("timed out".into()));
        assert!(cache.refresh(&source, true).await.is_err());

        assert_eq!(cache.snapshot().unwrap(), before);
        let status = cache.status();
        assert!(status.last_error.unwrap().contains("timed out"));
        assert!(!status.refreshing && !status.background);

        cache.refresh(&source, true).await.unwrap();
        assert!(cache.status().last_error.is_none());
    }

    #[tokio::test]
    async fn test_malformed_payload_never_applied() {
        let (api, cache, source) = setup();
        cache.refresh(&source, false).await.unwrap();

        api.fail_next("stats", ClientError::Malformed("duplicate history entry".into()));
        assert!(matches!(
            cache.refresh(&source, false).await,
            Err(ClientError::Malformed(_))
        ));
        assert_eq!(cache.snapshot().unwrap().target, 2000);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_keep_newest() {
        let (api, cache, source) = setup();
        let release_first = api.gate_stats(with_target(1111));
        let release_second = api.gate_stats(with_target(2222));

        let mut first = task::spawn(cache.refresh(&source, true));
        let mut second = task::spawn(cache.refresh(&source, true));
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        release_second.send(()).unwrap();
        let outcome = assert_ready!(second.poll()).unwrap();
        assert!(matches!(outcome, Refresh::Applied(_)));

        release_first.send(()).unwrap();
        let outcome = assert_ready!(first.poll()).unwrap();
        assert!(matches!(outcome, Refresh::Stale));

        assert_eq!(cache.snapshot().unwrap().target, 2222);
    }

    #[tokio::test]
    async fn test_patch_supersedes_older_inflight_refresh() {
        let (api, cache, source) = setup();
        cache.refresh(&source, false).await.unwrap();

        let release = api.gate_stats(with_target(1111));
        let mut poll = task::spawn(cache.refresh(&source, true));
        assert_pending!(poll.poll());

        let before = cache.patch(|s| {
            s.remove_meal(1);
        });
        assert_eq!(before.unwrap().target, 2000);

        release.send(()).unwrap();
        assert!(matches!(assert_ready!(poll.poll()), Ok(Refresh::Stale)));
        assert!(cache.snapshot().unwrap().find_meal(1).is_none());
    }

    #[tokio::test]
    async fn test_restore_is_exact() {
        let (_api, cache, source) = setup();
        cache.refresh(&source, false).await.unwrap();
        let before = cache.snapshot();

        let captured = cache.patch(|s| {
            s.remove_meal(3);
        });
        assert_ne!(cache.snapshot(), before);

        cache.restore(captured);
        assert_eq!(cache.snapshot(), before);
    }

    #[tokio::test]
    async fn test_patch_on_empty_cache_is_noop() {
        let (_api, cache, _source) = setup();
        assert!(cache.patch(|s| s.target = 1).is_none());
        assert!(cache.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_response_for_ended_session_discarded() {
        let (api, cache, _source) = setup();
        let session = Session::new(2, "cred-2");
        let source = SnapshotSource::Session(session.clone());

        let release = api.gate_stats(with_target(1111));
        let mut poll = task::spawn(cache.refresh(&source, true));
        assert_pending!(poll.poll());

        session.lifetime().cancel();
        release.send(()).unwrap();
        assert!(matches!(assert_ready!(poll.poll()), Ok(Refresh::Stale)));
        assert!(cache.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_overlapping_trigger_coalesces() {
        let (api, cache, source) = setup();
        let release = api.gate_stats(with_target(1111));

        let mut first = task::spawn(cache.refresh_coalesced(&source, true));
        assert_pending!(first.poll());

        let second = cache.refresh_coalesced(&source, true).await.unwrap();
        assert!(matches!(second, Refresh::Coalesced));
        assert_eq!(api.calls("stats"), 1);

        release.send(()).unwrap();
        assert!(assert_ready!(first.poll()).unwrap().applied().is_some());

        // guard released once the first refresh completed
        let third = cache.refresh_coalesced(&source, true).await.unwrap();
        assert!(third.applied().is_some());
        assert_eq!(api.calls("stats"), 2);
    }

    #[tokio::test]
    async fn test_indicators_follow_silent_flag() {
        let (api, cache, source) = setup();
        let release = api.gate_stats(with_target(1111));

        let mut poll = task::spawn(cache.refresh(&source, true));
        assert_pending!(poll.poll());
        let status = cache.status();
        assert!(status.background);
        assert!(!status.refreshing);

        release.send(()).unwrap();
        let _ = assert_ready!(poll.poll());
        assert_eq!(cache.status(), CacheStatus::default());
    }

    #[tokio::test]
    async fn test_dropped_refresh_releases_indicator() {
        let (api, cache, source) = setup();
        let _release = api.gate_stats(with_target(1111));

        let mut poll = task::spawn(cache.refresh(&source, false));
        assert_pending!(poll.poll());
        assert!(cache.status().refreshing);

        drop(poll);
        assert!(!cache.status().refreshing);
    }

    #[tokio::test]
    async fn test_clear_discards_inflight_refresh() {
        let (api, cache, source) = setup();
        let release = api.gate_stats(with_target(1111));

        let mut poll = task::spawn(cache.refresh(&source, true));
        assert_pending!(poll.poll());
        cache.clear();

        release.send(()).unwrap();
        assert!(matches!(assert_ready!(poll.poll()), Ok(Refresh::Stale)));
        assert!(cache.snapshot().is_none());
    }
}
