//! Default meal type for a new log entry.
//!
//! Time bands are evaluated in the target timezone, not the viewer's.
//! Breakfast, lunch and dinner are each offered at most once per day; once
//! the current band's meal is logged the suggestion falls back to snacks.

use chrono::{DateTime, FixedOffset, Timelike, Utc};

use crate::model::{DaySummary, MealType};

/// Meal type whose band contains `hour` (0-23, target timezone)
pub fn band_for_hour(hour: u32) -> MealType {
    match hour {
        5..=10 => MealType::Breakfast,
        11..=14 => MealType::Lunch,
        15..=17 => MealType::Snacks,
        18..=22 => MealType::Dinner,
        _ => MealType::Snacks,
    }
}

/// Suggestion given the meal types already logged today.
pub fn suggest_for_logged<'a>(logged: impl IntoIterator<Item = &'a MealType>, hour: u32) -> MealType {
    let primary = band_for_hour(hour);
    if primary == MealType::Snacks {
        return primary;
    }
    if logged.into_iter().any(|t| *t == primary) {
        MealType::Snacks
    } else {
        primary
    }
}

/// Suggestion for `now` against the history in a snapshot.
pub fn suggest(history: &[DaySummary], now: DateTime<Utc>, tz: FixedOffset) -> MealType {
    let local = now.with_timezone(&tz);
    let today = local.date_naive();

    let logged: Vec<MealType> = history
        .iter()
        .find(|day| day.is_today(today))
        .map(|day| day.meals.iter().filter_map(|m| m.meal_type).collect())
        .unwrap_or_default();

    suggest_for_logged(&logged, local.hour())
}
