//! Optimistic mutation coordinator
//!
//! Mutations run as transactions against the snapshot cache: capture the
//! snapshot, patch it locally, send the request, then commit or restore the
//! captured snapshot exactly. Share settings are not optimistic except for
//! disabling a link, which takes effect locally before the request returns.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::NutritionApi;
use crate::cache::{SnapshotCache, SnapshotSource};
use crate::error::{ClientError, Result};
use crate::model::{SettingsUpdate, ShareConfig, StatsSnapshot};
use crate::session::{Session, SessionStore};
use crate::sync::RevokedShares;

/// Local patch that is undone unless committed.
///
/// Dropping an uncommitted transaction (for example when the request future
/// is cancelled) rolls it back.
pub struct Transaction<'a> {
    cache: &'a SnapshotCache,
    before: Option<Arc<StatsSnapshot>>,
    done: bool,
}

impl<'a> Transaction<'a> {
    pub fn begin(cache: &'a SnapshotCache, apply: impl FnOnce(&mut StatsSnapshot)) -> Self {
        let before = cache.patch(apply);
        Self {
            cache,
            before,
            done: false,
        }
    }

    /// The snapshot captured before the patch
    pub fn before(&self) -> Option<&Arc<StatsSnapshot>> {
        self.before.as_ref()
    }

    pub fn commit(mut self) {
        self.done = true;
    }

    pub fn rollback(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        if !self.done {
            self.done = true;
            self.cache.restore(self.before.take());
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            warn!("Mutation abandoned before completion; restoring snapshot");
            self.undo();
        }
    }
}

/// The signed-in user's share link, plus the client-wide revoked set
pub struct ShareState {
    config: RwLock<ShareConfig>,
    revoked: Arc<RevokedShares>,
}

impl ShareState {
    pub fn new(revoked: Arc<RevokedShares>) -> Self {
        Self {
            config: RwLock::new(ShareConfig::default()),
            revoked,
        }
    }

    pub fn config(&self) -> ShareConfig {
        self.config.read().clone()
    }

    pub fn revoked(&self) -> &Arc<RevokedShares> {
        &self.revoked
    }

    fn set(&self, config: ShareConfig) {
        if config.enabled {
            if let Some(token) = &config.token {
                self.revoked.reinstate(token);
            }
        }
        *self.config.write() = config;
    }

    /// Disable locally and revoke the current token. Returns the token.
    fn disable(&self) -> Option<String> {
        let mut config = self.config.write();
        config.enabled = false;
        if let Some(token) = &config.token {
            self.revoked.revoke(token);
        }
        config.token.clone()
    }

    fn replace_token(&self, token: String) {
        let mut config = self.config.write();
        if let Some(old) = config.token.replace(token) {
            self.revoked.revoke(&old);
        }
    }

    pub fn reset(&self) {
        *self.config.write() = ShareConfig::default();
    }
}

pub struct MutationCoordinator {
    api: Arc<dyn NutritionApi>,
    sessions: Arc<SessionStore>,
    cache: Arc<SnapshotCache>,
    share: Arc<ShareState>,
}

impl MutationCoordinator {
    pub fn new(
        api: Arc<dyn NutritionApi>,
        sessions: Arc<SessionStore>,
        cache: Arc<SnapshotCache>,
        share: Arc<ShareState>,
    ) -> Self {
        Self {
            api,
            sessions,
            cache,
            share,
        }
    }

    /// Remove a meal optimistically, then let the server recompute totals.
    pub async fn delete_meal(&self, meal_id: i64) -> Result<()> {
        let session = self.sessions.require()?;

        let tx = Transaction::begin(&self.cache, |snapshot| {
            if !snapshot.remove_meal(meal_id) {
                debug!(meal_id, "Meal not in cached snapshot");
            }
        });

        match self.api.delete_meal(session.credential(), meal_id).await {
            Ok(()) => {
                tx.commit();
                info!(meal_id, "Meal deleted");
                self.reconcile(&session, true).await;
                Ok(())
            }
            Err(e) => {
                tx.rollback();
                warn!(meal_id, error = %e, "Delete failed; snapshot restored");
                Err(self.sessions.fail(&session, ClientError::mutation("delete meal", e)))
            }
        }
    }

    /// Save the daily target and/or password. No local patch: the new
    /// target arrives with the refresh that follows.
    pub async fn update_settings(&self, update: &SettingsUpdate) -> Result<()> {
        if update.is_empty() {
            return Err(ClientError::Validation(
                "Nothing to update: set a daily target or a new password".to_string(),
            ));
        }
        if let Some(target) = update.daily_target {
            if target <= 0 {
                return Err(ClientError::Validation(
                    "Daily target must be a positive number of calories".to_string(),
                ));
            }
        }

        let session = self.sessions.require()?;
        if let Err(e) = self.api.update_settings(session.credential(), update).await {
            warn!(error = %e, "Settings save failed");
            return Err(self.sessions.fail(&session, ClientError::mutation("save settings", e)));
        }
        info!(
            daily_target = ?update.daily_target,
            password_changed = update.password.as_deref().map_or(false, |p| !p.is_empty()),
            "Settings saved"
        );

        self.reconcile(&session, false).await;
        if let Err(e) = self.sessions.reload_profile(&session).await {
            warn!(error = %e, "Failed to reload profile after settings change");
        }
        Ok(())
    }

    /// Load the share link state. Failures keep the current state.
    pub async fn load_share_status(&self) -> Result<ShareConfig> {
        let session = self.sessions.require()?;
        match self.api.share_status(session.credential()).await {
            Ok(config) => self.share.set(config),
            Err(e) => {
                let e = self.sessions.fail(&session, e);
                if e.is_auth() {
                    return Err(e);
                }
                warn!(error = %e, "Failed to load share status");
            }
        }
        Ok(self.share.config())
    }

    /// Enable or disable the public link.
    ///
    /// Disabling revokes the current token locally before the request is
    /// sent. If the request fails the link stays disabled here and the
    /// server state is re-read so the displayed config matches it.
    pub async fn toggle_share(&self, enabled: bool) -> Result<ShareConfig> {
        let session = self.sessions.require()?;

        if !enabled {
            let revoked = self.share.disable();
            debug!(revoked = revoked.is_some(), "Share link disabled locally");
        }

        match self.api.toggle_share(session.credential(), enabled).await {
            Ok(config) => {
                info!(enabled = config.enabled, "Share link updated");
                if enabled {
                    self.share.set(config);
                } else {
                    // a token revoked here stays revoked until a confirmed enable
                    *self.share.config.write() = config;
                }
                Ok(self.share.config())
            }
            Err(e) => {
                let e = self.sessions.fail(&session, ClientError::mutation("toggle share", e));
                if !enabled && !e.is_auth() {
                    self.resync_share_after_failed_disable(&session).await;
                }
                Err(e)
            }
        }
    }

    /// Replace the share token. The old token is revoked.
    pub async fn reset_share(&self) -> Result<ShareConfig> {
        let session = self.sessions.require()?;
        match self.api.reset_share(session.credential()).await {
            Ok(reset) => {
                self.share.replace_token(reset.token);
                info!("Share link reset");
                Ok(self.share.config())
            }
            Err(e) => Err(self
                .sessions
                .fail(&session, ClientError::mutation("reset share link", e))),
        }
    }

    async fn resync_share_after_failed_disable(&self, session: &Session) {
        match self.api.share_status(session.credential()).await {
            Ok(server) => {
                if server.enabled {
                    warn!("Server still reports the share link enabled; the old link stays blocked on this client");
                }
                *self.share.config.write() = ShareConfig {
                    enabled: false,
                    token: server.token,
                };
            }
            Err(e) => {
                self.sessions.fail(session, e);
                debug!("Share status unavailable; keeping link disabled locally");
            }
        }
    }

    async fn reconcile(&self, session: &Session, silent: bool) {
        let source = SnapshotSource::Session(session.clone());
        if let Err(e) = self.cache.refresh(&source, silent).await {
            self.sessions.fail(session, e);
        }
    }
}
