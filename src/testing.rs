//! Scripted in-memory backend for unit tests.
//!
//! Behaves like a single-user server: deletes and settings changes are
//! reflected in later `/stats` responses, and the public endpoint serves the
//! same data while sharing is enabled. Failures can be queued per method, and
//! responses can be held on a gate to force out-of-order completion.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

use crate::api::{MealUpload, NutritionApi};
use crate::error::{ClientError, Result};
use crate::model::snapshot::fixtures;
use crate::model::{
    AdminStats, LoginResponse, RegisterRequest, SettingsUpdate, ShareConfig,
    ShareReset, StatsSnapshot, UserProfile,
};

pub(crate) const PASSWORD: &str = "secret";
pub(crate) const SHARE_TOKEN: &str = "share-abc";

struct GatedStats {
    snapshot: StatsSnapshot,
    gate: oneshot::Receiver<()>,
}

pub(crate) struct FakeApi {
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, VecDeque<ClientError>>>,
    gates: Mutex<HashMap<&'static str, VecDeque<oneshot::Receiver<()>>>>,
    gated_stats: Mutex<VecDeque<GatedStats>>,
    stats: Mutex<StatsSnapshot>,
    profile: Mutex<UserProfile>,
    share: Mutex<ShareConfig>,
    uploads: Mutex<Vec<MealUpload>>,
    settings: Mutex<Vec<SettingsUpdate>>,
    next_token: AtomicU64,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            gated_stats: Mutex::new(VecDeque::new()),
            stats: Mutex::new(fixtures::snapshot()),
            profile: Mutex::new(UserProfile {
                email: "jin@example.com".into(),
                name: Some("Jin".into()),
                daily_target: 2000,
                telegram_id: None,
            }),
            share: Mutex::new(ShareConfig {
                enabled: true,
                token: Some(SHARE_TOKEN.into()),
            }),
            uploads: Mutex::new(Vec::new()),
            settings: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Number of times `method` was called
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }

    /// Make the next call to `method` fail with `err`
    pub fn fail_next(&self, method: &'static str, err: ClientError) {
        self.failures.lock().entry(method).or_default().push_back(err);
    }

    /// Hold the next call to `method` until the returned sender fires
    pub fn gate(&self, method: &'static str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().entry(method).or_default().push_back(rx);
        tx
    }

    /// Answer the next `/stats` call with `snapshot`, once released
    pub fn gate_stats(&self, snapshot: StatsSnapshot) -> oneshot::Sender<()> {
        let (tx, gate) = oneshot::channel();
        self.gated_stats.lock().push_back(GatedStats { snapshot, gate });
        tx
    }

    pub fn set_stats(&self, snapshot: StatsSnapshot) {
        *self.stats.lock() = snapshot;
    }

    pub fn server_stats(&self) -> StatsSnapshot {
        self.stats.lock().clone()
    }

    pub fn share(&self) -> ShareConfig {
        self.share.lock().clone()
    }

    pub fn uploads(&self) -> Vec<MealUpload> {
        self.uploads.lock().clone()
    }

    pub fn settings(&self) -> Vec<SettingsUpdate> {
        self.settings.lock().clone()
    }

    async fn enter(&self, method: &'static str) -> Result<()> {
        *self.calls.lock().entry(method).or_default() += 1;

        let gate = self.gates.lock().get_mut(method).and_then(VecDeque::pop_front);
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let failure = self.failures.lock().get_mut(method).and_then(VecDeque::pop_front);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn new_token(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn check_share(&self, token: &str) -> Result<()> {
        let share = self.share.lock();
        if share.enabled && share.token.as_deref() == Some(token) {
            Ok(())
        } else {
            Err(ClientError::ShareLinkInvalid)
        }
    }
}

#[async_trait]
impl NutritionApi for FakeApi {
    async fn login(&self, _email: &str, password: &str) -> Result<LoginResponse> {
        self.enter("login").await?;
        if password != PASSWORD {
            return Err(ClientError::Auth("Incorrect email or password".into()));
        }
        Ok(LoginResponse {
            access_token: self.new_token("cred"),
            token_type: Some("bearer".into()),
        })
    }

    async fn register(&self, _request: &RegisterRequest) -> Result<()> {
        self.enter("register").await
    }

    async fn verify_email(&self, _token: &str) -> Result<()> {
        self.enter("verify_email").await
    }

    async fn me(&self, _credential: &str) -> Result<UserProfile> {
        self.enter("me").await?;
        Ok(self.profile.lock().clone())
    }

    async fn stats(&self, _credential: &str) -> Result<StatsSnapshot> {
        self.enter("stats").await?;
        let gated = self.gated_stats.lock().pop_front();
        match gated {
            Some(GatedStats { snapshot, gate }) => {
                let _ = gate.await;
                Ok(snapshot)
            }
            None => Ok(self.server_stats()),
        }
    }

    async fn upload_meal(&self, _credential: &str, upload: &MealUpload) -> Result<()> {
        self.enter("upload_meal").await?;
        self.uploads.lock().push(upload.clone());
        Ok(())
    }

    async fn delete_meal(&self, _credential: &str, meal_id: i64) -> Result<()> {
        self.enter("delete_meal").await?;
        let mut stats = self.stats.lock();
        if !stats.remove_meal(meal_id) {
            return Err(ClientError::Server {
                status: 404,
                detail: "Meal not found".into(),
            });
        }
        for day in &mut stats.grouped_history {
            day.totals = day.macro_sum();
        }
        Ok(())
    }

    async fn update_settings(&self, _credential: &str, update: &SettingsUpdate) -> Result<()> {
        self.enter("update_settings").await?;
        if let Some(target) = update.daily_target {
            self.stats.lock().target = target;
            self.profile.lock().daily_target = target;
        }
        self.settings.lock().push(update.clone());
        Ok(())
    }

    async fn share_status(&self, _credential: &str) -> Result<ShareConfig> {
        self.enter("share_status").await?;
        Ok(self.share())
    }

    async fn toggle_share(&self, _credential: &str, enabled: bool) -> Result<ShareConfig> {
        self.enter("toggle_share").await?;
        let needs_token = enabled && self.share.lock().token.is_none();
        let token = needs_token.then(|| self.new_token("share"));

        let mut share = self.share.lock();
        share.enabled = enabled;
        if token.is_some() {
            share.token = token;
        }
        Ok(share.clone())
    }

    async fn reset_share(&self, _credential: &str) -> Result<ShareReset> {
        self.enter("reset_share").await?;
        let token = self.new_token("share");
        self.share.lock().token = Some(token.clone());
        Ok(ShareReset { token })
    }

    async fn public_stats(&self, token: &str) -> Result<StatsSnapshot> {
        self.enter("public_stats").await?;
        self.check_share(token)?;
        let mut snapshot = self.server_stats();
        snapshot.trend.clear();
        snapshot.user_name = self.profile.lock().name.clone();
        Ok(snapshot)
    }

    async fn daily_feedback(&self, token: &str, date: NaiveDate, note: &str) -> Result<()> {
        self.enter("daily_feedback").await?;
        self.check_share(token)?;
        let mut stats = self.stats.lock();
        if let Some(day) = stats.grouped_history.iter_mut().find(|d| d.date == date) {
            day.trainer_feedback = (!note.is_empty()).then(|| note.to_string());
        }
        Ok(())
    }

    async fn admin_stats(&self, _credential: &str) -> Result<AdminStats> {
        self.enter("admin_stats").await?;
        let stats = self.stats.lock();
        let total_meals = stats
            .grouped_history
            .iter()
            .map(|d| d.meals.len() as i64)
            .sum();
        Ok(AdminStats {
            total_users: 1,
            total_meals,
            meals_today: stats
                .grouped_history
                .first()
                .map_or(0, |d| d.meals.len() as i64),
            users: vec![],
            recent_logs: vec![],
        })
    }
}
