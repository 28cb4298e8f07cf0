//! `inactivity-reminder`: nudge users who haven't logged a workout lately.

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{ScheduledRun, WorkflowDeps};
use crate::bus::Event;
use crate::engine::{StepContext, Workflow};
use crate::error::StepError;
use crate::fitness::{InactiveUser, Reminder};

pub struct InactivityReminder {
    deps: WorkflowDeps,
    inactivity_days: u32,
    page_size: usize,
}

impl InactivityReminder {
    pub fn new(deps: WorkflowDeps, inactivity_days: u32, page_size: usize) -> Self {
        Self {
            deps,
            inactivity_days: inactivity_days.max(1),
            page_size: page_size.max(1),
        }
    }
}

/// One reminder per user per run.
pub fn reminder_id_for(run_id: Uuid, user_id: &str) -> Uuid {
    Uuid::new_v5(&run_id, user_id.as_bytes())
}

fn reminder_message(user: &InactiveUser, today: NaiveDate) -> String {
    match user.last_workout_on {
        Some(last) => {
            let days = (today - last).num_days();
            format!("It's been {days} days since your last workout. A short session today keeps the streak alive.")
        }
        None => "You haven't logged a workout yet. Log your first session to start tracking progress.".to_string(),
    }
}

#[async_trait]
impl Workflow for InactivityReminder {
    async fn run(&self, event: &Event, step: &StepContext) -> Result<serde_json::Value, StepError> {
        let schedule: ScheduledRun = event.decode()?;
        let reference: DateTime<Utc> = schedule.scheduled_for.unwrap_or(event.published_at);
        let today = reference.date_naive();
        let days = schedule.inactivity_days.unwrap_or(self.inactivity_days).max(1);
        let cutoff = today
            .checked_sub_days(Days::new(u64::from(days)))
            .ok_or_else(|| StepError::Fatal(format!("inactivity window of {days} days underflows")))?;

        let store = &self.deps.store;
        let page_size = self.page_size;
        let run_id = step.run_id();

        let mut after: Option<String> = None;
        let mut page = 0usize;
        let mut found = 0usize;
        let mut created = 0usize;

        loop {
            let cursor = after.take();
            let inactive: Vec<InactiveUser> = step
                .run(&format!("scan-inactive-{page}"), || async move {
                    let users = store
                        .list_inactive_users(cutoff, cursor.as_deref(), page_size)
                        .await?;
                    Ok::<_, StepError>(users)
                })
                .await?;
            if inactive.is_empty() {
                break;
            }

            let reminders: Vec<Reminder> = inactive
                .iter()
                .map(|user| Reminder {
                    id: reminder_id_for(run_id, &user.user_id),
                    owner_id: user.user_id.clone(),
                    message: reminder_message(user, today),
                    created_at: reference,
                })
                .collect();
            created += step
                .run(&format!("insert-reminders-{page}"), || async move {
                    let inserted = store.insert_reminders(&reminders).await?;
                    Ok::<_, StepError>(inserted)
                })
                .await?;

            found += inactive.len();
            page += 1;
            if inactive.len() < page_size {
                break;
            }
            after = inactive.last().map(|u| u.user_id.clone());
        }

        info!(cutoff = %cutoff, inactive = found, reminders = created, "Inactivity scan finished");
        Ok(json!({ "cutoff": cutoff, "inactive": found, "reminders": created }))
    }
}
