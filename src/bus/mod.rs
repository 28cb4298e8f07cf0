//! Event bus: durable outbox in front of the workflow engine.
//!
//! Producers publish named events; each event is written to the `events`
//! table before it is handed to the dispatcher, so nothing published is lost
//! across a restart. Delivery is at-least-once: the engine acknowledges an
//! event only after a run has claimed it, and failed deliveries are retried
//! with backoff until they are dead-lettered.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, StepError};
use crate::store::Database;

/// Namespace for ids derived from names rather than from other ids.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93d5_4b7a_8e21_5c0d_b7f3_a914);

/// A named event with a self-contained JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub payload: serde_json::Value,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    pub published_at: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::with_id(Uuid::new_v4(), name, payload)
    }

    pub fn with_id(id: Uuid, name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id,
            name: name.into(),
            payload,
            attempts: 0,
            published_at: Utc::now(),
        }
    }

    /// The Task Record this event drives, if any.
    pub fn task_id(&self) -> Option<Uuid> {
        self.payload
            .get("task_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Decode the payload. A malformed payload will never succeed on retry,
    /// so the error is fatal.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            StepError::Fatal(format!("malformed payload for {}: {e}", self.name))
        })
    }
}

/// Outbox status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting for a run to claim it.
    Queued,
    /// Claimed by a run.
    Dispatched,
    /// Delivery attempts exhausted.
    Dead,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Queued => "queued",
            EventStatus::Dispatched => "dispatched",
            EventStatus::Dead => "dead",
        }
    }
}

impl FromStr for EventStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(EventStatus::Queued),
            "dispatched" => Ok(EventStatus::Dispatched),
            "dead" => Ok(EventStatus::Dead),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// Deterministic id for the `index`-th event emitted by `step` in `run_id`.
///
/// A step re-executed after a partial crash re-derives the same ids, and the
/// outbox ignores the ones it already holds.
pub fn child_event_id(run_id: Uuid, step: &str, index: usize) -> Uuid {
    Uuid::new_v5(&run_id, format!("{step}/{index}").as_bytes())
}

/// Deterministic id for a workflow's cron firing at `slot`.
pub fn cron_event_id(workflow: &str, slot: DateTime<Utc>) -> Uuid {
    Uuid::new_v5(
        &ID_NAMESPACE,
        format!("cron/{workflow}/{}", slot.timestamp()).as_bytes(),
    )
}

/// How failed deliveries are retried.
#[derive(Debug, Clone, Copy)]
pub struct RedeliveryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RedeliveryPolicy {
    fn delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << exp)
    }
}

/// Receiving half handed to the engine's dispatcher.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Publishing half. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn Database>,
    tx: mpsc::UnboundedSender<Event>,
    redelivery: RedeliveryPolicy,
}

impl EventBus {
    pub fn new(store: Arc<dyn Database>, redelivery: RedeliveryPolicy) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                tx,
                redelivery,
            },
            rx,
        )
    }

    /// Publish an event under a fresh id.
    pub async fn publish(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, DatabaseError> {
        let event = Event::new(name, payload);
        let id = event.id;
        self.enqueue(event).await?;
        Ok(id)
    }

    /// Publish under a caller-chosen id. Returns `false` if the outbox already
    /// holds that id, in which case nothing is enqueued.
    pub async fn publish_with_id(
        &self,
        id: Uuid,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        self.enqueue(Event::with_id(id, name, payload)).await
    }

    async fn enqueue(&self, event: Event) -> Result<bool, DatabaseError> {
        if !self.store.insert_event(&event).await? {
            debug!(event_id = %event.id, name = %event.name, "Event already in outbox, skipping");
            return Ok(false);
        }
        debug!(event_id = %event.id, name = %event.name, "Event published");
        self.hand_off(event);
        Ok(true)
    }

    fn hand_off(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            // Stays queued in the outbox; recover() picks it up on next start.
            warn!(event_id = %e.0.id, "Dispatcher is gone, event left in outbox");
        }
    }

    /// Report a failed delivery. Schedules a redelivery with backoff, or
    /// dead-letters the event once attempts are exhausted.
    pub async fn nack(&self, mut event: Event, reason: &str) -> Result<(), DatabaseError> {
        let attempts = self.store.record_delivery_failure(event.id, reason).await?;
        event.attempts = attempts;

        if attempts >= self.redelivery.max_attempts {
            self.store.mark_event_dead(event.id, reason).await?;
            error!(
                event_id = %event.id,
                name = %event.name,
                attempts,
                reason,
                "Event dead-lettered"
            );
            return Ok(());
        }

        let delay = self.redelivery.delay(attempts);
        warn!(
            event_id = %event.id,
            name = %event.name,
            attempts,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Event delivery failed, will redeliver"
        );
        let bus = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bus.hand_off(event);
        });
        Ok(())
    }

    /// Re-enqueue every event still queued in the outbox, and every event
    /// whose run was interrupted. Call once at startup, before any run starts.
    pub async fn recover(&self) -> Result<usize, DatabaseError> {
        let queued = self.store.list_recoverable_events().await?;
        let count = queued.len();
        for event in queued {
            self.hand_off(event);
        }
        if count > 0 {
            info!(count, "Recovered queued events from outbox");
        }
        Ok(count)
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn test_bus() -> (EventBus, EventReceiver) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        EventBus::new(
            store,
            RedeliveryPolicy {
                max_attempts: 2,
                backoff: Duration::from_millis(10),
            },
        )
    }

    #[test]
    fn child_ids_are_deterministic() {
        let run = Uuid::new_v4();
        assert_eq!(child_event_id(run, "emit", 0), child_event_id(run, "emit", 0));
        assert_ne!(child_event_id(run, "emit", 0), child_event_id(run, "emit", 1));
        assert_ne!(
            child_event_id(run, "emit", 0),
            child_event_id(Uuid::new_v4(), "emit", 0)
        );
    }

    #[test]
    fn cron_ids_depend_on_slot() {
        let slot = Utc::now();
        assert_eq!(cron_event_id("w", slot), cron_event_id("w", slot));
        assert_ne!(
            cron_event_id("w", slot),
            cron_event_id("w", slot + chrono::Duration::minutes(1))
        );
    }

    #[test]
    fn event_task_id() {
        let id = Uuid::new_v4();
        let ev = Event::new("x", serde_json::json!({"task_id": id.to_string()}));
        assert_eq!(ev.task_id(), Some(id));
        assert_eq!(Event::new("x", serde_json::json!({})).task_id(), None);
    }

    #[test]
    fn malformed_payload_is_fatal() {
        #[derive(Deserialize)]
        struct Needs {
            #[allow(dead_code)]
            owner_id: String,
        }
        let ev = Event::new("x", serde_json::json!({"nope": 1}));
        assert!(matches!(ev.decode::<Needs>(), Err(StepError::Fatal(_))));
    }

    #[tokio::test]
    async fn publish_delivers_and_persists() {
        let (bus, mut rx) = test_bus().await;
        let id = bus.publish("a", serde_json::json!({"k": 1})).await.unwrap();

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.id, id);
        assert_eq!(
            bus.store().get_event_status(id).await.unwrap(),
            Some(EventStatus::Queued)
        );
    }

    #[tokio::test]
    async fn publish_with_id_dedupes() {
        let (bus, mut rx) = test_bus().await;
        let id = Uuid::new_v4();
        assert!(bus.publish_with_id(id, "a", serde_json::json!({})).await.unwrap());
        assert!(!bus.publish_with_id(id, "a", serde_json::json!({})).await.unwrap());

        assert_eq!(rx.recv().await.unwrap().id, id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn nack_redelivers_then_dead_letters() {
        let (bus, mut rx) = test_bus().await;
        let id = bus.publish("a", serde_json::json!({})).await.unwrap();
        let first = rx.recv().await.unwrap();

        bus.nack(first, "no slot").await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.id, id);
        assert_eq!(second.attempts, 1);

        bus.nack(second, "no slot").await.unwrap();
        assert_eq!(
            bus.store().get_event_status(id).await.unwrap(),
            Some(EventStatus::Dead)
        );
    }

    #[tokio::test]
    async fn recover_requeues_outbox() {
        let (bus, mut rx) = test_bus().await;
        let id = bus.publish("a", serde_json::json!({})).await.unwrap();
        let _ = rx.recv().await.unwrap();

        assert_eq!(bus.recover().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap().id, id);
    }
}
