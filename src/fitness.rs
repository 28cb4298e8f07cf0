//! Application rows the workflows read and write.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inference::schema::ParsedExercise;

/// A known user. Fan-out workflows enumerate this table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// A structured workout, stored as one `workouts` row plus one `workout_sets`
/// row per set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workout {
    pub id: Uuid,
    pub owner_id: String,
    /// The task that produced this workout, if any.
    pub task_id: Option<Uuid>,
    pub performed_on: NaiveDate,
    pub exercises: Vec<ParsedExercise>,
    pub created_at: DateTime<Utc>,
}

impl Workout {
    pub fn set_count(&self) -> usize {
        self.exercises.iter().map(|e| e.sets.len()).sum()
    }

    /// Sum of reps × weight across all sets.
    pub fn volume(&self) -> Decimal {
        self.exercises
            .iter()
            .flat_map(|e| e.sets.iter())
            .map(|s| Decimal::from(s.reps) * s.weight)
            .sum()
    }
}

/// Body metrics for one owner on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyMetric {
    pub owner_id: String,
    pub metric_date: NaiveDate,
    pub body_weight_kg: Option<Decimal>,
    pub body_fat_pct: Option<Decimal>,
    pub notes: Option<String>,
    pub source_task_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    pub owner_id: String,
    pub description: String,
    pub target_date: Option<NaiveDate>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(owner_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            description: description.into(),
            target_date: None,
            active: true,
            created_at: Utc::now(),
        }
    }
}

/// A synthesized recommendation for one owner over one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: Uuid,
    pub owner_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub summary: String,
    pub recommendation: String,
    pub focus_areas: Vec<String>,
    /// Workflow run that produced the insight.
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// An in-app nudge for an inactive user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: Uuid,
    pub owner_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// A user whose last workout predates the inactivity cutoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InactiveUser {
    pub user_id: String,
    /// `None` when the user never logged a workout.
    pub last_workout_on: Option<NaiveDate>,
}

/// Recent activity handed to insight inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub owner_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub workout_count: usize,
    pub total_sets: usize,
    pub total_volume: Decimal,
    /// Distinct exercise names, most frequent first.
    pub exercises: Vec<String>,
    pub goal: Option<Goal>,
    pub latest_metric: Option<BodyMetric>,
}

impl ActivitySummary {
    pub fn build(
        owner_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
        workouts: &[Workout],
        goal: Option<Goal>,
        latest_metric: Option<BodyMetric>,
    ) -> Self {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for exercise in workouts.iter().flat_map(|w| w.exercises.iter()) {
            match counts.iter_mut().find(|(name, _)| *name == exercise.name) {
                Some((_, n)) => *n += exercise.sets.len(),
                None => counts.push((exercise.name.clone(), exercise.sets.len())),
            }
        }
        // Stable sort keeps first-seen order among ties.
        counts.sort_by(|a, b| b.1.cmp(&a.1));

        Self {
            owner_id: owner_id.to_string(),
            period_start,
            period_end,
            workout_count: workouts.len(),
            total_sets: workouts.iter().map(Workout::set_count).sum(),
            total_volume: workouts.iter().map(Workout::volume).sum(),
            exercises: counts.into_iter().map(|(name, _)| name).collect(),
            goal,
            latest_metric,
        }
    }
}
