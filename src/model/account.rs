//! Account, sharing and admin payloads.

use serde::{Deserialize, Serialize};

/// Authenticated user's profile from `/users/me`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub daily_target: i64,
    #[serde(default)]
    pub telegram_id: Option<String>,
}

impl UserProfile {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("User")
    }
}

/// Response from `/auth/login`
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Request body for `/auth/register`
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    pub telegram_id: Option<String>,
}

/// Public share link state.
///
/// The token is a bearer credential for the public view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: Option<String>,
}

/// Response from `/share/reset`, which only carries the new token
#[derive(Debug, Clone, Deserialize)]
pub struct ShareReset {
    pub token: String,
}

/// Parameters for `/settings`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub daily_target: Option<i64>,
    pub password: Option<String>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.daily_target.is_none() && self.password.as_deref().map_or(true, str::is_empty)
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(target) = self.daily_target {
            pairs.push(("daily_target", target.to_string()));
        }
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            pairs.push(("password", password.to_string()));
        }
        pairs
    }
}

/// Aggregate from `/admin/stats`
#[derive(Debug, Clone, Deserialize)]
pub struct AdminStats {
    pub total_users: i64,
    pub total_meals: i64,
    pub meals_today: i64,
    #[serde(default)]
    pub users: Vec<AdminUser>,
    #[serde(default)]
    pub recent_logs: Vec<AdminMealLog>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminUser {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub email: String,
    pub meal_count: i64,
    /// ISO timestamp, or `"Never"`
    pub last_active: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminMealLog {
    pub id: i64,
    #[serde(default)]
    pub user: Option<String>,
    pub food: String,
    pub calories: f64,
    pub time: String,
    #[serde(default)]
    pub has_image: bool,
}
