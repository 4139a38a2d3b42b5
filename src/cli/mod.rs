//! CLI subcommands for the nutrition dashboard
//!
//! Provides commands for:
//! - `login` / `register` / `verify-email` / `logout` / `whoami`: Account session
//! - `stats`: Print today's totals and recent history
//! - `watch`: Keep the dashboard in sync and print each change
//! - `log`: Upload meal photos for analysis
//! - `delete`: Remove a logged meal
//! - `settings`: Change the daily target or password
//! - `share`: Manage the public share link
//! - `public` / `feedback`: View a shared dashboard and leave notes
//! - `suggest`: Show the default meal type for right now
//! - `admin`: Site-wide statistics (admin accounts only)

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::client::Dashboard;
use crate::config::Config;
use crate::model::{
    AdminStats, DaySummary, MealType, RegisterRequest, SettingsUpdate, ShareConfig, StatsSnapshot,
};
use crate::session::Session;
use crate::sync::PublicState;

/// Nutrisync - sync client for the nutrition dashboard
#[derive(Parser, Debug)]
#[command(name = "nutrisync")]
#[command(author, version, about = "Sync client for a personal nutrition dashboard", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "nutrisync.toml", global = true)]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Backend API URL (overrides the config file)
    #[arg(long, env = "NUTRISYNC_API_URL", global = true)]
    pub api_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(url) = &self.api_url {
            config.api.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sign in and remember the session
    Login {
        /// Account email
        email: String,

        /// Account password
        #[arg(long, env = "NUTRISYNC_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Create a new account
    Register {
        /// Account email
        email: String,

        /// Display name
        #[arg(long)]
        name: String,

        /// Account password (at least 8 characters)
        #[arg(long, env = "NUTRISYNC_PASSWORD", hide_env_values = true)]
        password: String,

        /// Telegram chat ID for bot notifications
        #[arg(long)]
        telegram_id: Option<String>,
    },

    /// Confirm an email address with the token from the verification mail
    VerifyEmail {
        /// Verification token
        token: String,
    },

    /// Sign out and forget the stored session
    Logout,

    /// Show the signed-in account
    Whoami,

    /// Show today's progress and recent history
    Stats {
        /// Number of days of history to print
        #[arg(short, long, default_value = "3")]
        days: usize,
    },

    /// Keep the dashboard in sync and print each new snapshot
    Watch,

    /// Log a meal from one or more photos
    Log {
        /// Photo to upload (repeatable)
        #[arg(short, long = "photo", required = true)]
        photos: Vec<PathBuf>,

        /// Optional description to help the analysis
        #[arg(short, long, default_value = "")]
        description: String,

        /// Meal type (defaults to the suggestion for the current time)
        #[arg(short, long)]
        meal_type: Option<MealType>,
    },

    /// Delete a logged meal
    Delete {
        /// Meal ID
        id: i64,
    },

    /// Update account settings
    Settings {
        /// Daily calorie target
        #[arg(long)]
        target: Option<i64>,

        /// New password
        #[arg(long)]
        password: Option<String>,
    },

    /// Manage the public share link
    #[command(subcommand)]
    Share(ShareCommands),

    /// View a shared dashboard
    Public {
        /// Share token
        token: String,

        /// Fetch once instead of polling
        #[arg(long)]
        once: bool,
    },

    /// Leave a note on a day of a shared dashboard
    Feedback {
        /// Share token
        token: String,

        /// Day the note is for (YYYY-MM-DD)
        date: NaiveDate,

        /// Note text (empty clears the day's note)
        note: String,
    },

    /// Show the suggested meal type for right now
    Suggest,

    /// Show site-wide statistics (admin only)
    Admin,
}

#[derive(Subcommand, Debug)]
pub enum ShareCommands {
    /// Show whether sharing is enabled
    Status,
    /// Enable the public share link
    On,
    /// Disable the public share link
    Off,
    /// Replace the share token, invalidating the old link
    Reset,
}

// =============================================================================
// CLI Command Handlers
// =============================================================================

/// Run a CLI command
pub async fn run_command(cli: &Cli, dashboard: &Dashboard) -> Result<()> {
    match &cli.command {
        Commands::Login { email, password } => cmd_login(dashboard, email, password).await,
        Commands::Register {
            email,
            name,
            password,
            telegram_id,
        } => {
            let request = RegisterRequest {
                email: email.clone(),
                password: password.clone(),
                name: name.clone(),
                telegram_id: telegram_id.clone(),
            };
            cmd_register(dashboard, &request).await
        }
        Commands::VerifyEmail { token } => cmd_verify_email(dashboard, token).await,
        Commands::Logout => cmd_logout(dashboard).await,
        Commands::Whoami => cmd_whoami(dashboard).await,
        Commands::Stats { days } => cmd_stats(dashboard, *days).await,
        Commands::Watch => cmd_watch(dashboard).await,
        Commands::Log {
            photos,
            description,
            meal_type,
        } => cmd_log(dashboard, photos, description, *meal_type).await,
        Commands::Delete { id } => cmd_delete(dashboard, *id).await,
        Commands::Settings { target, password } => {
            let update = SettingsUpdate {
                daily_target: *target,
                password: password.clone(),
            };
            cmd_settings(dashboard, &update).await
        }
        Commands::Share(command) => cmd_share(dashboard, command).await,
        Commands::Public { token, once } => cmd_public(dashboard, token, *once).await,
        Commands::Feedback { token, date, note } => {
            cmd_feedback(dashboard, token, *date, note).await
        }
        Commands::Suggest => cmd_suggest(dashboard).await,
        Commands::Admin => cmd_admin(dashboard).await,
    }
}

/// Restore the stored session or explain how to get one
async fn signed_in(dashboard: &Dashboard) -> Result<Session> {
    dashboard
        .init()
        .await
        .context("Not signed in. Run `nutrisync login <email>` first.")
}

async fn cmd_login(dashboard: &Dashboard, email: &str, password: &str) -> Result<()> {
    dashboard
        .login(email, password)
        .await
        .context("Login failed")?;

    let name = dashboard
        .profile()
        .map(|p| p.display_name().to_string())
        .unwrap_or_else(|| email.to_string());
    println!("Signed in as {}", name);
    Ok(())
}

async fn cmd_register(dashboard: &Dashboard, request: &RegisterRequest) -> Result<()> {
    dashboard
        .register(request)
        .await
        .context("Registration failed")?;
    println!(
        "Account created. Check {} for a verification link, then run `nutrisync verify-email <token>`.",
        request.email
    );
    Ok(())
}

async fn cmd_verify_email(dashboard: &Dashboard, token: &str) -> Result<()> {
    dashboard
        .verify_email(token)
        .await
        .context("Email verification failed")?;
    println!("Email verified. You can now sign in.");
    Ok(())
}

async fn cmd_logout(dashboard: &Dashboard) -> Result<()> {
    dashboard.logout();
    println!("Signed out.");
    Ok(())
}

async fn cmd_whoami(dashboard: &Dashboard) -> Result<()> {
    signed_in(dashboard).await?;
    let profile = match dashboard.profile() {
        Some(profile) => profile,
        None => dashboard
            .reload_profile()
            .await
            .context("Failed to load profile")?,
    };

    println!();
    println!("Name:          {}", profile.display_name());
    println!("Email:         {}", profile.email);
    println!("Daily target:  {} kcal", profile.daily_target);
    println!(
        "Telegram:      {}",
        profile.telegram_id.as_deref().unwrap_or("-")
    );
    println!("Share link:    {}", describe_share(&dashboard.share_config()));
    println!();
    Ok(())
}

async fn cmd_stats(dashboard: &Dashboard, days: usize) -> Result<()> {
    signed_in(dashboard).await?;
    dashboard
        .refresh(false)
        .await
        .context("Failed to load stats")?;

    let snapshot = dashboard
        .snapshot()
        .context("No stats available")?;
    print_snapshot(&snapshot, days);
    Ok(())
}

async fn cmd_watch(dashboard: &Dashboard) -> Result<()> {
    signed_in(dashboard).await?;

    let mut changes = dashboard.subscribe();
    let handle = dashboard.start_live_sync()?;
    println!("Watching for changes. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                match dashboard.snapshot() {
                    Some(snapshot) => print_snapshot(&snapshot, 1),
                    None if dashboard.session().is_none() => {
                        println!("Session ended. Run `nutrisync login` to sign in again.");
                        break;
                    }
                    None => {}
                }
            }
        }
    }

    handle.stop();
    handle.join().await;
    Ok(())
}

async fn cmd_log(
    dashboard: &Dashboard,
    photos: &[PathBuf],
    description: &str,
    meal_type: Option<MealType>,
) -> Result<()> {
    signed_in(dashboard).await?;
    // today's log feeds the meal type suggestion
    if meal_type.is_none() {
        if let Err(e) = dashboard.refresh(true).await {
            tracing::warn!(error = %e, "Stats not loaded; suggesting from the clock only");
        }
    }

    let mut batch = dashboard.open_upload();
    if let Some(meal_type) = meal_type {
        batch.meal_type = meal_type;
    }
    batch.description = description.to_string();
    for path in photos {
        batch
            .add_path(path)
            .with_context(|| format!("Failed to add photo {}", path.display()))?;
    }

    println!(
        "Uploading {} photo(s) as {}...",
        batch.len(),
        batch.meal_type
    );
    if let Err(rejected) = dashboard.submit_meal(batch).await {
        return Err(rejected.error).context("Meal upload failed");
    }

    println!("Meal logged.");
    if let Some(snapshot) = dashboard.snapshot() {
        print_snapshot(&snapshot, 1);
    }
    Ok(())
}

async fn cmd_delete(dashboard: &Dashboard, meal_id: i64) -> Result<()> {
    signed_in(dashboard).await?;
    dashboard
        .refresh(true)
        .await
        .context("Failed to load stats")?;

    let food = dashboard
        .snapshot()
        .and_then(|s| s.find_meal(meal_id).map(|m| m.food.clone()));
    dashboard
        .delete_meal(meal_id)
        .await
        .with_context(|| format!("Failed to delete meal {}", meal_id))?;

    match food {
        Some(food) => println!("Deleted meal {} ({})", meal_id, food),
        None => println!("Deleted meal {}", meal_id),
    }
    Ok(())
}

async fn cmd_settings(dashboard: &Dashboard, update: &SettingsUpdate) -> Result<()> {
    if update.is_empty() {
        anyhow::bail!("Nothing to update. Pass --target and/or --password.");
    }
    signed_in(dashboard).await?;
    dashboard
        .update_settings(update)
        .await
        .context("Failed to save settings")?;

    println!("Settings saved.");
    if let Some(profile) = dashboard.profile() {
        println!("Daily target:  {} kcal", profile.daily_target);
    }
    Ok(())
}

async fn cmd_share(dashboard: &Dashboard, command: &ShareCommands) -> Result<()> {
    signed_in(dashboard).await?;
    let config = match command {
        ShareCommands::Status => dashboard
            .load_share_status()
            .await
            .context("Failed to load share status")?,
        ShareCommands::On => dashboard
            .toggle_share(true)
            .await
            .context("Failed to enable sharing")?,
        ShareCommands::Off => dashboard
            .toggle_share(false)
            .await
            .context("Failed to disable sharing")?,
        ShareCommands::Reset => dashboard
            .reset_share()
            .await
            .context("Failed to reset share link")?,
    };

    println!("Share link:    {}", describe_share(&config));
    Ok(())
}

async fn cmd_public(dashboard: &Dashboard, token: &str, once: bool) -> Result<()> {
    if once {
        let snapshot = dashboard
            .fetch_public(token)
            .await
            .context("Share link is invalid or disabled")?;
        print_shared(&snapshot);
        return Ok(());
    }

    let mut changes = dashboard.subscribe_public_snapshot();
    let mut state = dashboard.subscribe_public();
    let handle = dashboard.watch_public(token)?;
    println!("Following shared dashboard. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(snapshot) = dashboard.public_snapshot() {
                    print_shared(&snapshot);
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                if let PublicState::Invalid { reason } = current {
                    println!("Share link is no longer available: {}", reason);
                    break;
                }
            }
        }
    }

    handle.stop();
    handle.join().await;
    Ok(())
}

async fn cmd_feedback(dashboard: &Dashboard, token: &str, date: NaiveDate, note: &str) -> Result<()> {
    dashboard
        .submit_feedback(token, date, note)
        .await
        .context("Failed to submit feedback")?;

    if note.is_empty() {
        println!("Feedback for {} cleared.", date);
    } else {
        println!("Feedback for {} saved.", date);
    }
    Ok(())
}

async fn cmd_suggest(dashboard: &Dashboard) -> Result<()> {
    if dashboard.init().await.is_some() {
        if let Err(e) = dashboard.refresh(true).await {
            tracing::warn!(error = %e, "Stats not loaded; suggesting from the clock only");
        }
    }

    let now = Utc::now().with_timezone(&dashboard.timezone());
    println!(
        "{} (at {} UTC{})",
        dashboard.suggest_at(now.with_timezone(&Utc)),
        now.format("%H:%M"),
        now.format("%:z")
    );
    Ok(())
}

async fn cmd_admin(dashboard: &Dashboard) -> Result<()> {
    signed_in(dashboard).await?;
    let stats = dashboard
        .admin_stats()
        .await
        .context("Failed to load admin statistics")?;
    print_admin(&stats);
    Ok(())
}

// =============================================================================
// Output
// =============================================================================

fn describe_share(config: &ShareConfig) -> String {
    match (config.enabled, config.token.as_deref()) {
        (true, Some(token)) => format!("enabled (token {})", token),
        (true, None) => "enabled".to_string(),
        (false, _) => "disabled".to_string(),
    }
}

fn print_snapshot(snapshot: &StatsSnapshot, days: usize) {
    println!();
    println!(
        "Today:     {:.0} / {} kcal ({:.0}%)",
        snapshot.consumed,
        snapshot.target,
        snapshot.progress_percent()
    );
    println!(
        "Macros:    protein {:.0}g  carbs {:.0}g  fat {:.0}g",
        snapshot.protein, snapshot.carbs, snapshot.fat
    );
    if let Some(summary) = &snapshot.daily_summary {
        println!("Summary:   {}", summary);
    }

    for day in snapshot.grouped_history.iter().take(days) {
        print_day(day);
    }
    println!();
}

fn print_shared(snapshot: &StatsSnapshot) {
    if let Some(owner) = &snapshot.user_name {
        println!();
        println!("=== {}'s dashboard ===", owner);
    }
    print_snapshot(snapshot, 7);
}

fn print_day(day: &DaySummary) {
    println!();
    println!(
        "{} ({})  {:.0} kcal",
        day.display_date, day.date, day.totals.calories
    );
    if day.meals.is_empty() {
        println!("  No meals logged.");
    }
    for meal in &day.meals {
        let meal_type = meal.meal_type.map(|t| t.as_str()).unwrap_or("-");
        println!(
            "  {:>6}  {}  {:<9}  {:<30}  {:>6.0} kcal",
            meal.id,
            meal.time.format("%H:%M"),
            meal_type,
            truncate(&meal.food, 30),
            meal.calories
        );
    }
    if let Some(feedback) = &day.trainer_feedback {
        println!("  Feedback: {}", feedback);
    }
}

fn print_admin(stats: &AdminStats) {
    println!();
    println!("=== Site Statistics ===");
    println!();
    println!("Users:        {}", stats.total_users);
    println!("Meals:        {}", stats.total_meals);
    println!("Meals today:  {}", stats.meals_today);

    if !stats.users.is_empty() {
        println!();
        println!(
            "{:<6}  {:<20}  {:<30}  {:>6}  {:<20}",
            "ID", "NAME", "EMAIL", "MEALS", "LAST ACTIVE"
        );
        println!("{}", "-".repeat(90));
        for user in &stats.users {
            println!(
                "{:<6}  {:<20}  {:<30}  {:>6}  {:<20}",
                user.id,
                truncate(user.name.as_deref().unwrap_or("-"), 20),
                truncate(&user.email, 30),
                user.meal_count,
                user.last_active
            );
        }
    }

    if !stats.recent_logs.is_empty() {
        println!();
        println!("Recent logs:");
        for log in &stats.recent_logs {
            println!(
                "  {:>6}  {:<16}  {:<30}  {:>6.0} kcal  {}",
                log.id,
                truncate(log.user.as_deref().unwrap_or("-"), 16),
                truncate(&log.food, 30),
                log.calories,
                log.time
            );
        }
    }
    println!();
}

/// Truncate a string to a maximum length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
