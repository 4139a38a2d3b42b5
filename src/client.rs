//! Dashboard client
//!
//! One owned container for the session, the snapshot cache, the share link
//! state and the poller slot. Everything the CLI does goes through here.

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{HttpApi, NutritionApi};
use crate::cache::{CacheStatus, Refresh, SnapshotCache, SnapshotSource};
use crate::config::{Config, SyncConfig};
use crate::error::{ClientError, Result};
use crate::model::{
    AdminStats, MealType, RegisterRequest, SettingsUpdate, ShareConfig, StatsSnapshot,
    UserProfile,
};
use crate::mutation::{MutationCoordinator, ShareState};
use crate::session::{CredentialStore, FileCredentialStore, Session, SessionStore};
use crate::suggest;
use crate::sync::{
    LiveSync, PollHandle, PollerSlot, PublicShare, PublicState, RevokedShares, Visibility,
};
use crate::upload::{UploadBatch, UploadRejected};

pub struct Dashboard {
    api: Arc<dyn NutritionApi>,
    sessions: Arc<SessionStore>,
    cache: Arc<SnapshotCache>,
    share: Arc<ShareState>,
    mutations: MutationCoordinator,
    public: Arc<PublicShare>,
    poller: Arc<PollerSlot>,
    visibility: watch::Sender<Visibility>,
    poll_interval: Duration,
    timezone: FixedOffset,
}

impl Dashboard {
    /// Build a client talking HTTP to `config.api.base_url`, persisting the
    /// credential in `config.session.store_path`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let api = HttpApi::from_config(&config.api).context("Failed to create API client")?;
        let store = FileCredentialStore::new(&config.session.store_path);
        let timezone = config.meals.timezone()?;
        Ok(Self::new(
            Arc::new(api),
            Arc::new(store),
            &config.sync,
            timezone,
        ))
    }

    pub fn new(
        api: Arc<dyn NutritionApi>,
        store: Arc<dyn CredentialStore>,
        sync: &SyncConfig,
        timezone: FixedOffset,
    ) -> Self {
        let cache = Arc::new(SnapshotCache::new(api.clone()));
        let sessions = Arc::new(SessionStore::new(api.clone(), store, cache.clone()));
        let revoked = RevokedShares::new();
        let share = Arc::new(ShareState::new(revoked.clone()));
        let mutations =
            MutationCoordinator::new(api.clone(), sessions.clone(), cache.clone(), share.clone());
        let public = Arc::new(PublicShare::new(
            api.clone(),
            revoked,
            sync.public_poll_interval(),
        ));
        let (visibility, _) = watch::channel(Visibility::Visible);

        Self {
            api,
            sessions,
            cache,
            share,
            mutations,
            public,
            poller: PollerSlot::new(),
            visibility,
            poll_interval: sync.poll_interval(),
            timezone,
        }
    }

    // Session

    /// Restore the persisted session, if any, and load its share link state.
    pub async fn init(&self) -> Option<Session> {
        let session = self.sessions.restore().await?;
        self.load_share_quietly().await;
        Some(session)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        let session = self.sessions.login(email, password).await?;
        self.load_share_quietly().await;
        Ok(session)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<()> {
        self.sessions.register(request).await
    }

    pub async fn verify_email(&self, token: &str) -> Result<()> {
        self.sessions.verify_email(token).await
    }

    /// End the session: stops polling, clears the credential and the cache.
    pub fn logout(&self) {
        self.sessions.logout();
        self.share.reset();
    }

    pub fn session(&self) -> Option<Session> {
        self.sessions.current()
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.sessions.profile()
    }

    pub async fn reload_profile(&self) -> Result<UserProfile> {
        let session = self.sessions.require()?;
        self.sessions.reload_profile(&session).await
    }

    async fn load_share_quietly(&self) {
        if let Err(e) = self.mutations.load_share_status().await {
            warn!(error = %e, "Share status not loaded");
        }
    }

    // Snapshot

    pub fn snapshot(&self) -> Option<Arc<StatsSnapshot>> {
        self.cache.snapshot()
    }

    pub fn status(&self) -> CacheStatus {
        self.cache.status()
    }

    /// Receiver that changes whenever the snapshot is replaced
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.cache.subscribe()
    }

    pub async fn refresh(&self, silent: bool) -> Result<Refresh> {
        let session = self.sessions.require()?;
        let result = self
            .cache
            .refresh(&SnapshotSource::Session(session.clone()), silent)
            .await;
        self.sessions.check(&session, result)
    }

    // Background sync

    /// Start the live sync scheduler for the current session.
    pub fn start_live_sync(&self) -> Result<PollHandle> {
        let session = self.sessions.require()?;
        let lease = self.poller.acquire()?;
        Ok(LiveSync::new(self.cache.clone(), self.sessions.clone(), self.poll_interval).spawn(
            session,
            self.visibility.subscribe(),
            lease,
        ))
    }

    /// Report the hosting view's visibility; becoming visible triggers a
    /// refresh while live sync is running.
    pub fn set_visibility(&self, visibility: Visibility) {
        self.visibility.send_replace(visibility);
    }

    // Public share

    pub async fn fetch_public(&self, token: &str) -> Result<Arc<StatsSnapshot>> {
        self.public.fetch_public(token).await
    }

    /// Start polling a public share link.
    pub fn watch_public(&self, token: &str) -> Result<PollHandle> {
        let lease = self.poller.acquire()?;
        Ok(self.public.spawn(token.to_string(), lease))
    }

    pub fn public_state(&self) -> PublicState {
        self.public.state()
    }

    pub fn subscribe_public(&self) -> watch::Receiver<PublicState> {
        self.public.subscribe()
    }

    /// Snapshot of the shared dashboard, kept apart from [`Dashboard::snapshot`]
    pub fn public_snapshot(&self) -> Option<Arc<StatsSnapshot>> {
        self.public.snapshot()
    }

    /// Receiver that changes whenever the shared snapshot is replaced
    pub fn subscribe_public_snapshot(&self) -> watch::Receiver<u64> {
        self.public.subscribe_snapshot()
    }

    pub async fn submit_feedback(
        &self,
        token: &str,
        date: chrono::NaiveDate,
        note: &str,
    ) -> Result<()> {
        self.public.submit_feedback(token, date, note).await
    }

    // Mutations

    pub async fn delete_meal(&self, meal_id: i64) -> Result<()> {
        self.mutations.delete_meal(meal_id).await
    }

    pub async fn update_settings(&self, update: &SettingsUpdate) -> Result<()> {
        self.mutations.update_settings(update).await
    }

    pub fn share_config(&self) -> ShareConfig {
        self.share.config()
    }

    pub async fn load_share_status(&self) -> Result<ShareConfig> {
        self.mutations.load_share_status().await
    }

    pub async fn toggle_share(&self, enabled: bool) -> Result<ShareConfig> {
        self.mutations.toggle_share(enabled).await
    }

    pub async fn reset_share(&self) -> Result<ShareConfig> {
        self.mutations.reset_share().await
    }

    // Meal logging

    pub fn suggest_meal_type(&self) -> MealType {
        self.suggest_at(Utc::now())
    }

    pub fn suggest_at(&self, now: DateTime<Utc>) -> MealType {
        let history = self
            .snapshot()
            .map(|s| s.grouped_history.clone())
            .unwrap_or_default();
        suggest::suggest(&history, now, self.timezone)
    }

    /// New upload batch preset to the suggested meal type
    pub fn open_upload(&self) -> UploadBatch {
        UploadBatch::open(self.suggest_meal_type())
    }

    pub async fn submit_meal(&self, batch: UploadBatch) -> std::result::Result<(), UploadRejected> {
        batch
            .submit(self.api.as_ref(), &self.sessions, &self.cache)
            .await
    }

    // Admin

    /// Site-wide statistics. A non-admin gets [`ClientError::Forbidden`] and
    /// stays signed in.
    pub async fn admin_stats(&self) -> Result<AdminStats> {
        let session = self.sessions.require()?;
        match self.api.admin_stats(session.credential()).await {
            Ok(stats) => Ok(stats),
            Err(e @ ClientError::Forbidden(_)) => {
                info!("Admin statistics refused for this account");
                Err(e)
            }
            Err(e) => Err(self.sessions.fail(&session, e)),
        }
    }

    pub fn timezone(&self) -> FixedOffset {
        self.timezone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryCredentialStore;
    use crate::testing::{FakeApi, PASSWORD, SHARE_TOKEN};
    use chrono::TimeZone;

    fn dashboard() -> (Arc<FakeApi>, Dashboard) {
        let api = Arc::new(FakeApi::new());
        let dashboard = Dashboard::new(
            api.clone(),
            Arc::new(MemoryCredentialStore::new()),
            &SyncConfig::default(),
            FixedOffset::east_opt(8 * 3600).unwrap(),
        );
        (api, dashboard)
    }

    #[tokio::test]
    async fn test_login_loads_share_status() {
        let (_api, dashboard) = dashboard();
        dashboard.login("jin@example.com", PASSWORD).await.unwrap();
        let share = dashboard.share_config();
        assert!(share.enabled);
        assert_eq!(share.token.as_deref(), Some(SHARE_TOKEN));
    }

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let (_api, dashboard) = dashboard();
        dashboard.login("jin@example.com", PASSWORD).await.unwrap();
        dashboard.refresh(false).await.unwrap();
        assert!(dashboard.snapshot().is_some());

        dashboard.logout();
        assert!(dashboard.session().is_none());
        assert!(dashboard.snapshot().is_none());
        assert_eq!(dashboard.share_config(), ShareConfig::default());
        assert!(matches!(
            dashboard.refresh(false).await,
            Err(ClientError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_refresh_auth_failure_ends_session() {
        let (api, dashboard) = dashboard();
        dashboard.login("jin@example.com", PASSWORD).await.unwrap();
        api.fail_next("stats", ClientError::Auth("Could not validate credentials".into()));

        assert!(dashboard.refresh(true).await.is_err());
        assert!(dashboard.session().is_none());
    }

    #[tokio::test]
    async fn test_live_sync_and_public_polling_are_exclusive() {
        let (_api, dashboard) = dashboard();
        dashboard.login("jin@example.com", PASSWORD).await.unwrap();

        let live = dashboard.start_live_sync().unwrap();
        assert!(matches!(
            dashboard.watch_public(SHARE_TOKEN),
            Err(ClientError::PollerBusy)
        ));
        assert!(matches!(
            dashboard.start_live_sync(),
            Err(ClientError::PollerBusy)
        ));

        live.stop();
        live.join().await;
        let public = dashboard.watch_public(SHARE_TOKEN).unwrap();
        public.stop();
        public.join().await;
    }

    #[tokio::test]
    async fn test_live_sync_requires_session() {
        let (_api, dashboard) = dashboard();
        assert!(matches!(
            dashboard.start_live_sync(),
            Err(ClientError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_toggle_off_invalidates_old_link() {
        let (api, dashboard) = dashboard();
        dashboard.login("jin@example.com", PASSWORD).await.unwrap();
        dashboard.toggle_share(false).await.unwrap();

        let err = dashboard.fetch_public(SHARE_TOKEN).await.unwrap_err();
        assert!(matches!(err, ClientError::ShareLinkInvalid));
        assert_eq!(api.calls("public_stats"), 0);
        assert!(matches!(
            dashboard.public_state(),
            PublicState::Invalid { .. }
        ));
    }

    #[tokio::test]
    async fn test_dead_public_link_keeps_owner_snapshot() {
        let (_api, dashboard) = dashboard();
        dashboard.login("jin@example.com", PASSWORD).await.unwrap();
        dashboard.refresh(false).await.unwrap();
        let own = dashboard.snapshot().unwrap();
        dashboard.toggle_share(false).await.unwrap();

        let err = dashboard.fetch_public(SHARE_TOKEN).await.unwrap_err();
        assert!(matches!(err, ClientError::ShareLinkInvalid));
        assert!(dashboard.session().unwrap().is_active());
        assert_eq!(dashboard.snapshot(), Some(own));
        assert!(dashboard.public_snapshot().is_none());
    }

    #[tokio::test]
    async fn test_public_view_does_not_replace_owner_snapshot() {
        let (_api, dashboard) = dashboard();
        dashboard.login("jin@example.com", PASSWORD).await.unwrap();
        dashboard.refresh(false).await.unwrap();
        let own = dashboard.snapshot().unwrap();

        let shared = dashboard.fetch_public(SHARE_TOKEN).await.unwrap();
        assert_eq!(shared.user_name.as_deref(), Some("Jin"));
        assert_eq!(dashboard.public_snapshot(), Some(shared));
        assert_eq!(dashboard.snapshot(), Some(own.clone()));
        assert!(own.user_name.is_none());

        // optimistic patches still apply to the owner's data
        dashboard.delete_meal(2).await.unwrap();
        assert!(dashboard.snapshot().unwrap().find_meal(2).is_none());
        assert!(dashboard.public_snapshot().unwrap().find_meal(2).is_some());
    }

    #[tokio::test]
    async fn test_admin_forbidden_keeps_session() {
        let (api, dashboard) = dashboard();
        dashboard.login("jin@example.com", PASSWORD).await.unwrap();
        api.fail_next("admin_stats", ClientError::Forbidden("Not authorized".into()));

        assert!(matches!(
            dashboard.admin_stats().await,
            Err(ClientError::Forbidden(_))
        ));
        assert!(dashboard.session().is_some());

        let stats = dashboard.admin_stats().await.unwrap();
        assert_eq!(stats.total_meals, 3);
    }

    #[tokio::test]
    async fn test_admin_unauthorized_ends_session() {
        let (api, dashboard) = dashboard();
        dashboard.login("jin@example.com", PASSWORD).await.unwrap();
        api.fail_next("admin_stats", ClientError::Auth("expired".into()));

        assert!(dashboard.admin_stats().await.is_err());
        assert!(dashboard.session().is_none());
    }

    #[tokio::test]
    async fn test_suggestion_uses_cached_history() {
        let (_api, dashboard) = dashboard();
        dashboard.login("jin@example.com", PASSWORD).await.unwrap();
        dashboard.refresh(false).await.unwrap();

        let sgt = dashboard.timezone();
        // lunch already logged on the fixture's "Today"
        let noon = sgt
            .with_ymd_and_hms(2024, 5, 2, 12, 45, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(dashboard.suggest_at(noon), MealType::Snacks);

        let evening = sgt
            .with_ymd_and_hms(2024, 5, 2, 19, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(dashboard.suggest_at(evening), MealType::Dinner);
    }

    #[tokio::test]
    async fn test_submit_meal_through_dashboard() {
        let (api, dashboard) = dashboard();
        dashboard.login("jin@example.com", PASSWORD).await.unwrap();

        let mut batch = dashboard.open_upload();
        batch.description = "nasi lemak".to_string();
        dashboard.submit_meal(batch).await.unwrap();
        assert_eq!(api.uploads().len(), 1);
        assert!(dashboard.snapshot().is_some());
    }
}
