//! Offline rule-based inference.
//!
//! Understands the common shorthand people type into a workout log:
//!
//! ```text
//! Bench 100 5 5 5      name, weight, then reps for each set
//! Squat 140x5x3        weight x reps x sets
//! Pull-ups 3x8         sets x reps (bodyweight)
//! ```
//!
//! Lines (or `;`-separated entries) that match none of these are skipped. Used
//! when no API key is configured and throughout the tests.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use rust_decimal::Decimal;

use super::{
    Inference, InferenceInput, InsightRecommendation, OutputSchema, ParsedExercise, ParsedSet,
    ParsedWorkout,
};
use crate::error::InferenceError;

const PROVIDER: &str = "heuristic";

static WEIGHT_REPS_SETS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?P<name>[a-z][a-z .\-]*?)\s+(?P<weight>\d+(?:\.\d+)?)\s*[x×*]\s*(?P<reps>\d+)\s*[x×*]\s*(?P<sets>\d+)$",
    )
    .unwrap()
});

static SETS_REPS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<name>[a-z][a-z .\-]*?)\s+(?P<sets>\d+)\s*[x×*]\s*(?P<reps>\d+)$")
        .unwrap()
});

static WEIGHT_THEN_REPS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<name>[a-z][a-z .\-]*?)\s+(?P<weight>\d+(?:\.\d+)?)(?P<reps>(?:\s+\d+)+)$")
        .unwrap()
});

/// Upper bound on sets per line; anything larger is a typo.
const MAX_SETS: u32 = 50;

/// Rule-based provider; never transient.
#[derive(Debug, Default, Clone)]
pub struct HeuristicInference;

impl HeuristicInference {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Inference for HeuristicInference {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn infer(
        &self,
        schema: OutputSchema,
        input: InferenceInput,
    ) -> Result<serde_json::Value, InferenceError> {
        match (schema, input) {
            (OutputSchema::Workout, InferenceInput::Text(text)) => {
                let workout = parse_workout_text(&text)?;
                serde_json::to_value(workout)
                    .map_err(|e| InferenceError::permanent(PROVIDER, e.to_string()))
            }
            (OutputSchema::Insight, InferenceInput::Context(context)) => {
                serde_json::to_value(summarize_activity(&context))
                    .map_err(|e| InferenceError::permanent(PROVIDER, e.to_string()))
            }
            (OutputSchema::PhotoMetrics, _) => Err(InferenceError::permanent(
                PROVIDER,
                "photo analysis is unsupported without a vision provider",
            )),
            (schema, _) => Err(InferenceError::permanent(
                PROVIDER,
                format!("unsupported input for {} schema", schema.name()),
            )),
        }
    }
}

/// Parse a free-text workout log.
pub fn parse_workout_text(text: &str) -> Result<ParsedWorkout, InferenceError> {
    let mut exercises: Vec<ParsedExercise> = Vec::new();

    for entry in text.split(['\n', ';']).map(str::trim).filter(|l| !l.is_empty()) {
        let Some(parsed) = parse_entry(entry) else {
            tracing::debug!(entry, "Skipping unrecognized workout entry");
            continue;
        };

        // Repeated lines for the same movement accumulate sets.
        match exercises.iter_mut().find(|e| e.name == parsed.name) {
            Some(existing) => existing.sets.extend(parsed.sets),
            None => exercises.push(parsed),
        }
    }

    if exercises.is_empty() {
        return Err(InferenceError::permanent(
            PROVIDER,
            format!("no exercises recognized in '{}'", text.trim()),
        ));
    }

    Ok(ParsedWorkout { exercises })
}

fn parse_entry(entry: &str) -> Option<ParsedExercise> {
    if let Some(caps) = WEIGHT_REPS_SETS.captures(entry) {
        let weight: Decimal = caps["weight"].parse().ok()?;
        let reps: u32 = caps["reps"].parse().ok()?;
        let sets: u32 = caps["sets"].parse().ok()?;
        return build(&caps["name"], (0..sets.min(MAX_SETS)).map(|_| ParsedSet::new(reps, weight)));
    }

    if let Some(caps) = SETS_REPS.captures(entry) {
        let sets: u32 = caps["sets"].parse().ok()?;
        let reps: u32 = caps["reps"].parse().ok()?;
        return build(
            &caps["name"],
            (0..sets.min(MAX_SETS)).map(|_| ParsedSet::new(reps, Decimal::ZERO)),
        );
    }

    if let Some(caps) = WEIGHT_THEN_REPS.captures(entry) {
        let weight: Decimal = caps["weight"].parse().ok()?;
        let reps: Vec<u32> = caps["reps"]
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        return build(
            &caps["name"],
            reps.into_iter()
                .take(MAX_SETS as usize)
                .map(|r| ParsedSet::new(r, weight)),
        );
    }

    None
}

fn build(raw_name: &str, sets: impl Iterator<Item = ParsedSet>) -> Option<ParsedExercise> {
    let sets: Vec<ParsedSet> = sets.collect();
    if sets.is_empty() {
        return None;
    }
    Some(ParsedExercise {
        name: canonical_name(raw_name),
        sets,
    })
}

/// Map shorthand to a canonical exercise name.
pub fn canonical_name(raw: &str) -> String {
    let key: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();

    let canonical = match key.as_str() {
        "bench" | "benchpress" | "bp" => "Bench Press",
        "squat" | "squats" | "backsquat" => "Back Squat",
        "frontsquat" => "Front Squat",
        "deadlift" | "deadlifts" | "dl" => "Deadlift",
        "ohp" | "overheadpress" | "press" => "Overhead Press",
        "row" | "rows" | "barbellrow" => "Barbell Row",
        "pullup" | "pullups" | "chinup" | "chinups" => "Pull-Up",
        "pushup" | "pushups" => "Push-Up",
        "dip" | "dips" => "Dip",
        _ => return title_case(raw),
    };
    canonical.to_string()
}

fn title_case(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Rule-based weekly summary over an activity context.
fn summarize_activity(context: &serde_json::Value) -> InsightRecommendation {
    let workouts = context["workout_count"].as_u64().unwrap_or(0);
    let sets = context["total_sets"].as_u64().unwrap_or(0);
    let goal = context["goal"]["description"].as_str();
    let exercises: Vec<String> = context["exercises"]
        .as_array()
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let summary = match workouts {
        0 => "No workouts logged this period.".to_string(),
        1 => format!("1 workout logged with {sets} sets."),
        n => format!("{n} workouts logged with {sets} sets."),
    };

    let recommendation = match (workouts, goal) {
        (0, _) => "Schedule two short sessions this week to rebuild the habit.".to_string(),
        (1..=2, Some(goal)) => {
            format!("Add one more session per week to keep progressing toward: {goal}.")
        }
        (1..=2, None) => "Add one more session per week and set a goal to track.".to_string(),
        (_, Some(goal)) => format!("Consistency is good; keep the plan and review progress on: {goal}."),
        (_, None) => "Consistency is good; set a concrete goal for the next block.".to_string(),
    };

    InsightRecommendation {
        summary,
        recommendation,
        focus_areas: exercises.into_iter().take(3).collect(),
    }
}
