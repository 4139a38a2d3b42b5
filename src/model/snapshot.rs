//! Nutrition snapshot models returned by `/stats` and `/public/stats/{token}`.
//!
//! A snapshot is always decoded and validated as a whole via
//! [`StatsSnapshot::from_json`]; a payload that fails either step is rejected
//! and never reaches the cache.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{ClientError, Result};

/// Label the server gives the current day in `display_date`
pub const TODAY_LABEL: &str = "Today";

/// Tolerance used when comparing server totals with per-meal sums
const TOTALS_EPSILON: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MealType {
    Breakfast,
    Lunch,
    Snacks,
    Dinner,
}

impl MealType {
    pub const ALL: [MealType; 4] = [
        MealType::Breakfast,
        MealType::Lunch,
        MealType::Snacks,
        MealType::Dinner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MealType::Breakfast => "Breakfast",
            MealType::Lunch => "Lunch",
            MealType::Snacks => "Snacks",
            MealType::Dinner => "Dinner",
        }
    }
}

impl fmt::Display for MealType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MealType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        MealType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "Unknown meal type '{}'. Expected one of: Breakfast, Lunch, Snacks, Dinner",
                    s
                )
            })
    }
}

/// Legacy rows carry `null` or free text here; anything unrecognised is absent.
fn lenient_meal_type<'de, D>(deserializer: D) -> std::result::Result<Option<MealType>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

/// Portions come back from the AI as numbers, occasionally as numeric strings.
fn lenient_portion<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Portion {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<Portion>::deserialize(deserializer)? {
        Some(Portion::Number(n)) => n,
        Some(Portion::Text(s)) => s.trim().trim_end_matches('x').parse().unwrap_or(1.0),
        None => 1.0,
    })
}

fn default_portion() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroTotals {
    #[serde(default)]
    pub calories: f64,
    #[serde(default)]
    pub protein: f64,
    #[serde(default)]
    pub carbs: f64,
    #[serde(default)]
    pub fat: f64,
}

impl MacroTotals {
    fn add(mut self, meal: &Meal) -> Self {
        self.calories += meal.calories;
        self.protein += meal.protein;
        self.carbs += meal.carbs;
        self.fat += meal.fat;
        self
    }

    fn approx_eq(&self, other: &MacroTotals) -> bool {
        (self.calories - other.calories).abs() <= TOTALS_EPSILON
            && (self.protein - other.protein).abs() <= TOTALS_EPSILON
            && (self.carbs - other.carbs).abs() <= TOTALS_EPSILON
            && (self.fat - other.fat).abs() <= TOTALS_EPSILON
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealItem {
    pub name: String,
    #[serde(default = "default_portion", deserialize_with = "lenient_portion")]
    pub portion: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meal {
    pub id: i64,
    pub food: String,
    #[serde(default, deserialize_with = "lenient_meal_type")]
    pub meal_type: Option<MealType>,
    #[serde(default)]
    pub calories: f64,
    #[serde(default)]
    pub protein: f64,
    #[serde(default)]
    pub carbs: f64,
    #[serde(default)]
    pub fat: f64,
    /// Logged time, naive, in the server's target timezone
    pub time: NaiveDateTime,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub items: Vec<MealItem>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trainer_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaySummary {
    /// Calendar date, `YYYY-MM-DD`
    pub date: NaiveDate,
    pub display_date: String,
    #[serde(default)]
    pub totals: MacroTotals,
    #[serde(default)]
    pub meals: Vec<Meal>,
    #[serde(default)]
    pub ai_summary: Option<String>,
    #[serde(default)]
    pub trainer_feedback: Option<String>,
}

impl DaySummary {
    pub fn is_today(&self, today: NaiveDate) -> bool {
        self.display_date == TODAY_LABEL || self.date == today
    }

    /// Fold of the day's meals. Only used to check the server's totals; the
    /// server's value is what gets displayed.
    pub fn macro_sum(&self) -> MacroTotals {
        self.meals.iter().fold(MacroTotals::default(), MacroTotals::add)
    }

    pub fn totals_consistent(&self) -> bool {
        self.totals.approx_eq(&self.macro_sum())
    }

    fn meals_time_ordered(&self) -> bool {
        let descending = self.meals.windows(2).all(|w| w[0].time >= w[1].time);
        let ascending = self.meals.windows(2).all(|w| w[0].time <= w[1].time);
        descending || ascending
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    /// Short day label, e.g. `"Mon"`
    #[serde(alias = "day")]
    pub date: String,
    #[serde(default)]
    pub amount: f64,
}

/// Full server-derived nutrition state at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub target: i64,
    #[serde(default)]
    pub consumed: f64,
    #[serde(default)]
    pub protein: f64,
    #[serde(default)]
    pub carbs: f64,
    #[serde(default)]
    pub fat: f64,
    #[serde(default)]
    pub daily_summary: Option<String>,
    #[serde(default)]
    pub grouped_history: Vec<DaySummary>,
    #[serde(default)]
    pub trend: Vec<TrendPoint>,
    /// Owner's display name, only sent on the public endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

impl StatsSnapshot {
    /// Decode and validate a raw response body.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let snapshot: StatsSnapshot = serde_json::from_slice(body)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Check the structural invariants of a server snapshot.
    ///
    /// Totals mismatches are reported but not rejected: the server owns them.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.grouped_history.len());
        for (idx, day) in self.grouped_history.iter().enumerate() {
            if !seen.insert(day.date) {
                return Err(ClientError::Malformed(format!(
                    "duplicate history entry for {}",
                    day.date
                )));
            }
            if idx > 0 && day.display_date == TODAY_LABEL {
                return Err(ClientError::Malformed(format!(
                    "'{}' entry for {} is not first in history",
                    TODAY_LABEL, day.date
                )));
            }
            if !day.meals_time_ordered() {
                return Err(ClientError::Malformed(format!(
                    "meals for {} are not ordered by time",
                    day.date
                )));
            }
            if !day.totals_consistent() {
                tracing::warn!(
                    date = %day.date,
                    server_calories = day.totals.calories,
                    summed_calories = day.macro_sum().calories,
                    "Day totals differ from the sum of its meals; keeping server totals"
                );
            }
        }
        Ok(())
    }

    pub fn today(&self, today: NaiveDate) -> Option<&DaySummary> {
        self.grouped_history.iter().find(|d| d.is_today(today))
    }

    pub fn find_meal(&self, meal_id: i64) -> Option<&Meal> {
        self.grouped_history
            .iter()
            .flat_map(|d| d.meals.iter())
            .find(|m| m.id == meal_id)
    }

    /// Remove a meal by id, dropping its day if it becomes empty.
    ///
    /// Returns whether a meal was removed. Totals are left as the server sent
    /// them; the reconciling refresh brings the recomputed values.
    pub fn remove_meal(&mut self, meal_id: i64) -> bool {
        let mut removed = false;
        for day in &mut self.grouped_history {
            let before = day.meals.len();
            day.meals.retain(|m| m.id != meal_id);
            removed |= day.meals.len() != before;
        }
        if removed {
            self.grouped_history.retain(|d| !d.meals.is_empty());
        }
        removed
    }

    /// Progress towards the daily target, clamped to 0..=100.
    pub fn progress_percent(&self) -> f64 {
        if self.target <= 0 {
            return 0.0;
        }
        (self.consumed / self.target as f64 * 100.0).clamp(0.0, 100.0)
    }
}
