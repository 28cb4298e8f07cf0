//! Declared output schemas and their typed forms.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which structured shape an inference call must produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSchema {
    /// Free-text workout → exercises and sets.
    Workout,
    /// Progress photo → body metrics.
    PhotoMetrics,
    /// Activity summary → recommendation.
    Insight,
}

impl OutputSchema {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Workout => "workout",
            Self::PhotoMetrics => "photo_metrics",
            Self::Insight => "insight",
        }
    }

    /// Task instructions sent alongside the schema.
    pub fn instructions(&self) -> &'static str {
        match self {
            Self::Workout => {
                "Convert the user's workout log into exercises and sets. \
                 Use canonical exercise names (e.g. 'Bench Press', 'Back Squat'). \
                 Weights are in the user's unit; use 0 for bodyweight movements. \
                 Each set gets its own entry."
            }
            Self::PhotoMetrics => {
                "Estimate body metrics from the progress photo. \
                 Leave a field null when it cannot be estimated with reasonable confidence."
            }
            Self::Insight => {
                "Given the user's recent training activity, active goal and latest body metrics, \
                 write a short weekly summary and one concrete recommendation."
            }
        }
    }

    /// JSON schema the output must validate against.
    pub fn json_schema(&self) -> serde_json::Value {
        match self {
            Self::Workout => serde_json::json!({
                "type": "object",
                "required": ["exercises"],
                "properties": {
                    "exercises": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["name", "sets"],
                            "properties": {
                                "name": {"type": "string"},
                                "sets": {
                                    "type": "array",
                                    "items": {
                                        "type": "object",
                                        "required": ["reps", "weight"],
                                        "properties": {
                                            "reps": {"type": "integer", "minimum": 0},
                                            "weight": {"type": "number", "minimum": 0}
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }),
            Self::PhotoMetrics => serde_json::json!({
                "type": "object",
                "properties": {
                    "body_weight_kg": {"type": ["number", "null"]},
                    "body_fat_pct": {"type": ["number", "null"]},
                    "notes": {"type": ["string", "null"]}
                }
            }),
            Self::Insight => serde_json::json!({
                "type": "object",
                "required": ["summary", "recommendation"],
                "properties": {
                    "summary": {"type": "string"},
                    "recommendation": {"type": "string"},
                    "focus_areas": {"type": "array", "items": {"type": "string"}}
                }
            }),
        }
    }
}

/// Structured workout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedWorkout {
    pub exercises: Vec<ParsedExercise>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedExercise {
    pub name: String,
    pub sets: Vec<ParsedSet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedSet {
    pub reps: u32,
    #[serde(default, serialize_with = "rust_decimal::serde::float::serialize")]
    pub weight: Decimal,
}

impl ParsedSet {
    pub fn new(reps: u32, weight: Decimal) -> Self {
        Self { reps, weight }
    }
}

/// Metrics derived from a progress photo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoMetrics {
    #[serde(default)]
    pub body_weight_kg: Option<Decimal>,
    #[serde(default)]
    pub body_fat_pct: Option<Decimal>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A synthesized weekly recommendation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightRecommendation {
    pub summary: String,
    pub recommendation: String,
    #[serde(default)]
    pub focus_areas: Vec<String>,
}
