//! reqwest implementation of [`NutritionApi`].

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::{MealUpload, NutritionApi};
use crate::config::ApiConfig;
use crate::error::{ClientError, Result};
use crate::model::{
    AdminStats, LoginResponse, RegisterRequest, SettingsUpdate, ShareConfig, ShareReset,
    StatsSnapshot, UserProfile,
};

/// HTTP client for the nutrition backend
#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    base: Url,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let base = Url::parse(&base_url)
            .map_err(|e| ClientError::Validation(format!("Invalid API URL '{}': {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::Validation(format!(
                "Invalid API URL '{}': not a base URL",
                base_url
            )));
        }

        let client = Client::builder()
            .user_agent(format!("nutrisync/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base,
            base_url,
        })
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        Self::new(config.base_url.clone(), config.timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Endpoint URL under the base. Each segment is percent-encoded, so a
    /// token can never change the path.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Validation(format!("Invalid API URL '{}'", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    // Request builders, one per endpoint

    fn login_request(&self, email: &str, password: &str) -> Result<RequestBuilder> {
        Ok(self
            .client
            .post(self.url(&["auth", "login"])?)
            .form(&[("username", email), ("password", password)]))
    }

    fn register_request(&self, request: &RegisterRequest) -> Result<RequestBuilder> {
        Ok(self.client.post(self.url(&["auth", "register"])?).json(request))
    }

    fn verify_email_request(&self, token: &str) -> Result<RequestBuilder> {
        Ok(self
            .client
            .get(self.url(&["auth", "verify-email"])?)
            .query(&[("token", token)]))
    }

    fn me_request(&self, credential: &str) -> Result<RequestBuilder> {
        Ok(self.client.get(self.url(&["users", "me"])?).bearer_auth(credential))
    }

    fn stats_request(&self, credential: &str) -> Result<RequestBuilder> {
        Ok(self.client.get(self.url(&["stats"])?).bearer_auth(credential))
    }

    fn upload_request(&self, credential: &str, upload: &MealUpload) -> Result<RequestBuilder> {
        let mut form = Form::new();
        for file in &upload.files {
            let part = Part::stream(file.data.clone())
                .file_name(file.file_name.clone())
                .mime_str(&file.content_type)
                .map_err(|e| ClientError::Validation(format!("Invalid content type: {}", e)))?;
            form = form.part("files", part);
        }
        let form = form
            .text("description", upload.description.clone())
            .text("meal_type", upload.meal_type.as_str());

        Ok(self
            .client
            .post(self.url(&["upload-meal"])?)
            .bearer_auth(credential)
            .multipart(form))
    }

    fn delete_meal_request(&self, credential: &str, meal_id: i64) -> Result<RequestBuilder> {
        Ok(self
            .client
            .delete(self.url(&["meal", &meal_id.to_string()])?)
            .bearer_auth(credential))
    }

    fn settings_request(&self, credential: &str, update: &SettingsUpdate) -> Result<RequestBuilder> {
        Ok(self
            .client
            .post(self.url(&["settings"])?)
            .bearer_auth(credential)
            .query(&update.query_pairs()))
    }

    fn share_status_request(&self, credential: &str) -> Result<RequestBuilder> {
        Ok(self
            .client
            .get(self.url(&["share", "status"])?)
            .bearer_auth(credential))
    }

    fn toggle_share_request(&self, credential: &str, enabled: bool) -> Result<RequestBuilder> {
        Ok(self
            .client
            .post(self.url(&["share", "toggle"])?)
            .bearer_auth(credential)
            .query(&[("enabled", enabled)]))
    }

    fn reset_share_request(&self, credential: &str) -> Result<RequestBuilder> {
        Ok(self
            .client
            .post(self.url(&["share", "reset"])?)
            .bearer_auth(credential))
    }

    fn public_stats_request(&self, token: &str) -> Result<RequestBuilder> {
        Ok(self.client.get(self.url(&["public", "stats", token])?))
    }

    fn feedback_request(&self, token: &str, date: NaiveDate, note: &str) -> Result<RequestBuilder> {
        let date = date.format("%Y-%m-%d").to_string();
        Ok(self
            .client
            .post(self.url(&["public", "daily-feedback", token, &date])?)
            .multipart(Form::new().text("note", note.to_string())))
    }

    fn admin_stats_request(&self, credential: &str) -> Result<RequestBuilder> {
        Ok(self
            .client
            .get(self.url(&["admin", "stats"])?)
            .bearer_auth(credential))
    }

    /// Send a request and turn non-success statuses into [`ClientError`].
    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(%status, body = %body, "Backend returned error");
            return Err(ClientError::from_status(status, &body));
        }

        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.send(builder).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn send_snapshot(&self, builder: RequestBuilder) -> Result<StatsSnapshot> {
        let response = self.send(builder).await?;
        let body = response.bytes().await?;
        StatsSnapshot::from_json(&body)
    }
}

/// Public endpoints answer 404 for unknown or disabled tokens
fn share_link_error(err: ClientError) -> ClientError {
    match err {
        ClientError::Server { status, .. } if status == StatusCode::NOT_FOUND.as_u16() => {
            ClientError::ShareLinkInvalid
        }
        ClientError::Auth(_) | ClientError::Forbidden(_) => ClientError::ShareLinkInvalid,
        other => other,
    }
}

#[async_trait]
impl NutritionApi for HttpApi {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse> {
        self.send_json(self.login_request(email, password)?).await
    }

    async fn register(&self, request: &RegisterRequest) -> Result<()> {
        self.send(self.register_request(request)?).await?;
        Ok(())
    }

    async fn verify_email(&self, token: &str) -> Result<()> {
        self.send(self.verify_email_request(token)?).await?;
        Ok(())
    }

    async fn me(&self, credential: &str) -> Result<UserProfile> {
        self.send_json(self.me_request(credential)?).await
    }

    async fn stats(&self, credential: &str) -> Result<StatsSnapshot> {
        self.send_snapshot(self.stats_request(credential)?).await
    }

    async fn upload_meal(&self, credential: &str, upload: &MealUpload) -> Result<()> {
        self.send(self.upload_request(credential, upload)?).await?;
        Ok(())
    }

    async fn delete_meal(&self, credential: &str, meal_id: i64) -> Result<()> {
        self.send(self.delete_meal_request(credential, meal_id)?).await?;
        Ok(())
    }

    async fn update_settings(&self, credential: &str, update: &SettingsUpdate) -> Result<()> {
        self.send(self.settings_request(credential, update)?).await?;
        Ok(())
    }

    async fn share_status(&self, credential: &str) -> Result<ShareConfig> {
        self.send_json(self.share_status_request(credential)?).await
    }

    async fn toggle_share(&self, credential: &str, enabled: bool) -> Result<ShareConfig> {
        self.send_json(self.toggle_share_request(credential, enabled)?)
            .await
    }

    async fn reset_share(&self, credential: &str) -> Result<ShareReset> {
        self.send_json(self.reset_share_request(credential)?).await
    }

    async fn public_stats(&self, token: &str) -> Result<StatsSnapshot> {
        let builder = self.public_stats_request(token)?;
        self.send_snapshot(builder).await.map_err(share_link_error)
    }

    async fn daily_feedback(&self, token: &str, date: NaiveDate, note: &str) -> Result<()> {
        let builder = self.feedback_request(token, date, note)?;
        self.send(builder).await.map_err(share_link_error)?;
        Ok(())
    }

    async fn admin_stats(&self, credential: &str) -> Result<AdminStats> {
        self.send_json(self.admin_stats_request(credential)?).await
    }
}
