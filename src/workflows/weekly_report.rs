//! `weekly-report`: fan out one `insight/generate` event per user.
//!
//! Users are enumerated in pages; each page is one memoized listing step and
//! one memoized emit step, so a retried run neither re-lists nor re-emits the
//! pages it already finished.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::{INSIGHT_GENERATE, InsightRequest, ScheduledRun, WorkflowDeps};
use crate::bus::Event;
use crate::engine::{OutgoingEvent, StepContext, Workflow};
use crate::error::StepError;

pub struct WeeklyReport {
    deps: WorkflowDeps,
    page_size: usize,
    lookback_days: u32,
}

impl WeeklyReport {
    pub fn new(deps: WorkflowDeps, page_size: usize, lookback_days: u32) -> Self {
        Self {
            deps,
            page_size: page_size.max(1),
            lookback_days,
        }
    }
}

#[async_trait]
impl Workflow for WeeklyReport {
    async fn run(&self, event: &Event, step: &StepContext) -> Result<serde_json::Value, StepError> {
        let schedule: ScheduledRun = event.decode()?;
        let period_end = schedule
            .scheduled_for
            .unwrap_or(event.published_at)
            .date_naive();
        let store = &self.deps.store;
        let page_size = self.page_size;

        let mut after: Option<String> = None;
        let mut page = 0usize;
        let mut emitted = 0usize;

        loop {
            let cursor = after.take();
            let users: Vec<String> = step
                .run(&format!("list-users-{page}"), || async move {
                    let ids = store.list_user_ids(cursor.as_deref(), page_size).await?;
                    Ok::<_, StepError>(ids)
                })
                .await?;
            if users.is_empty() {
                break;
            }

            let events = users
                .iter()
                .map(|owner_id| {
                    serde_json::to_value(InsightRequest {
                        owner_id: owner_id.clone(),
                        task_id: None,
                        lookback_days: Some(self.lookback_days),
                        period_end: Some(period_end),
                    })
                    .map(|payload| OutgoingEvent::new(INSIGHT_GENERATE, payload))
                })
                .collect::<Result<Vec<_>, _>>()?;
            step.send_events(&format!("emit-insights-{page}"), events)
                .await?;

            emitted += users.len();
            page += 1;
            if users.len() < page_size {
                break;
            }
            after = users.last().cloned();
        }

        info!(users = emitted, pages = page, period_end = %period_end, "Weekly report fan-out emitted");
        Ok(json!({ "users": emitted, "pages": page, "period_end": period_end }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::config::WorkflowSettings;
    use crate::engine::run_id_for;
    use crate::inference::HeuristicInference;
    use crate::workflows::WEEKLY_REPORT;
    use crate::workflows::testing::{eventually, harness_with};

    #[tokio::test]
    async fn every_user_gets_exactly_one_insight() {
        let settings = WorkflowSettings {
            fanout_page_size: 2,
            ..WorkflowSettings::default()
        };
        let h = harness_with(std::sync::Arc::new(HeuristicInference::new()), settings).await;
        for user in ["a", "b", "c", "d", "e"] {
            h.store.upsert_user(user).await.unwrap();
        }

        let slot = Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap();
        let event_id = h
            .engine
            .fire_manual(WEEKLY_REPORT, json!({ "scheduled_for": slot }))
            .await
            .unwrap();

        let store = h.store.clone();
        eventually(|| {
            let store = store.clone();
            async move {
                let mut done = 0;
                for user in ["a", "b", "c", "d", "e"] {
                    done += store.list_insights(user).await.unwrap().len();
                }
                done == 5
            }
        })
        .await;

        for user in ["a", "b", "c", "d", "e"] {
            let insights = h.store.list_insights(user).await.unwrap();
            assert_eq!(insights.len(), 1, "user {user}");
            assert_eq!(insights[0].owner_id, user);
            assert_eq!(insights[0].period_end, slot.date_naive());
        }
        assert_eq!(h.store.count_events_by_name(INSIGHT_GENERATE).await.unwrap(), 5);

        let run_id = run_id_for(event_id, WEEKLY_REPORT);
        eventually(|| {
            let store = store.clone();
            async move {
                matches!(store.get_run(run_id).await.unwrap(), Some(run) if run.state.is_terminal())
            }
        })
        .await;
        let run = h.store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.output.unwrap()["pages"], 3);
    }

    #[tokio::test]
    async fn no_users_emits_nothing() {
        let h = crate::workflows::testing::harness().await;
        let event_id = h.engine.fire_manual(WEEKLY_REPORT, json!({})).await.unwrap();
        let store = h.store.clone();
        let run_id = run_id_for(event_id, WEEKLY_REPORT);
        eventually(|| {
            let store = store.clone();
            async move {
                matches!(store.get_run(run_id).await.unwrap(), Some(run) if run.state.is_terminal())
            }
        })
        .await;
        assert_eq!(h.store.count_events_by_name(INSIGHT_GENERATE).await.unwrap(), 0);
    }
}
