//! Backend API seam.
//!
//! Everything the sync layer needs from the server goes through
//! [`NutritionApi`]. [`HttpApi`] is the reqwest implementation; tests swap in
//! a scripted fake.

mod http;

pub use http::HttpApi;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;

use crate::error::Result;
use crate::model::{
    AdminStats, LoginResponse, MealType, RegisterRequest, SettingsUpdate, ShareConfig,
    ShareReset, StatsSnapshot, UserProfile,
};

/// One photo attached to a meal upload
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

/// Multipart body for `/upload-meal`
#[derive(Debug, Clone)]
pub struct MealUpload {
    pub files: Vec<UploadFile>,
    pub description: String,
    pub meal_type: MealType,
}

#[async_trait]
pub trait NutritionApi: Send + Sync {
    /// POST /auth/login (form: username, password)
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse>;

    /// POST /auth/register
    async fn register(&self, request: &RegisterRequest) -> Result<()>;

    /// GET /auth/verify-email?token=
    async fn verify_email(&self, token: &str) -> Result<()>;

    /// GET /users/me
    async fn me(&self, credential: &str) -> Result<UserProfile>;

    /// GET /stats
    async fn stats(&self, credential: &str) -> Result<StatsSnapshot>;

    /// POST /upload-meal (multipart)
    async fn upload_meal(&self, credential: &str, upload: &MealUpload) -> Result<()>;

    /// DELETE /meal/{id}
    async fn delete_meal(&self, credential: &str, meal_id: i64) -> Result<()>;

    /// POST /settings?daily_target=&password=
    async fn update_settings(&self, credential: &str, update: &SettingsUpdate) -> Result<()>;

    /// GET /share/status
    async fn share_status(&self, credential: &str) -> Result<ShareConfig>;

    /// POST /share/toggle?enabled=
    async fn toggle_share(&self, credential: &str, enabled: bool) -> Result<ShareConfig>;

    /// POST /share/reset
    async fn reset_share(&self, credential: &str) -> Result<ShareReset>;

    /// GET /public/stats/{token}
    async fn public_stats(&self, token: &str) -> Result<StatsSnapshot>;

    /// POST /public/daily-feedback/{token}/{date} (form: note)
    async fn daily_feedback(&self, token: &str, date: NaiveDate, note: &str) -> Result<()>;

    /// GET /admin/stats
    async fn admin_stats(&self, credential: &str) -> Result<AdminStats>;
}
