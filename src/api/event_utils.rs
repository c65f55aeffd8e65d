use crate::{
    api::{deployments, epoch_milli},
    storage,
};
use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumDiscriminants, EnumString};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

#[derive(
    Debug, PartialEq, Eq, EnumDiscriminants, Display, Serialize, Deserialize, Clone, JsonSchema,
)]
#[strum_discriminants(derive(EnumString, Display, Hash))]
#[strum_discriminants(strum(serialize_all = "snake_case"))]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// The Any kind is a special event kind that denotes the caller wants to listen for any event.
    /// It should not be used as a normal event type(for example do not publish anything with it).
    /// It is internal only and not passed back on event streaming.
    Any,

    // Deployment events
    CreatedDeployment {
        deployment_id: u64,
    },
    StartedDeployment {
        deployment_id: u64,
        kind: deployments::Kind,
    },
    CompletedDeploymentStep {
        deployment_id: u64,
        step: String,
        progress: u64,
    },
    CompletedDeployment {
        deployment_id: u64,
    },
    FailedDeployment {
        deployment_id: u64,
        description: String,
    },
    DeletedDeployment {
        deployment_id: u64,
    },

    // Note events
    CreatedNote {
        note_id: u64,
    },
    UpdatedNote {
        note_id: u64,
    },
    DeletedNote {
        note_id: u64,
    },

    // Point of interest events
    CreatedPointOfInterest {
        poi_id: u64,
    },
    UpdatedPointOfInterest {
        poi_id: u64,
    },
    DeletedPointOfInterest {
        poi_id: u64,
    },

    // Server metrics events
    RecordedServerMetrics {
        metrics_id: u64,
    },
}

/// A single event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Event {
    /// Unique identifier for event.
    pub id: String,

    /// The type of event it is.
    pub kind: Kind,

    /// Time event was performed in epoch milliseconds.
    pub emitted: u64,
}

impl TryFrom<storage::events::Event> for Event {
    type Error = anyhow::Error;

    fn try_from(value: storage::events::Event) -> Result<Self> {
        let emitted = value.emitted.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'emitted' from storage value '{}'",
                value.emitted
            )
        })?;

        let kind: Kind = serde_json::from_str(&value.kind).with_context(|| {
            format!(
                "Could not parse field 'kind' from storage value '{}'",
                value.kind
            )
        })?;

        Ok(Event {
            id: value.id,
            kind,
            emitted,
        })
    }
}

impl TryFrom<Event> for storage::events::Event {
    type Error = anyhow::Error;

    fn try_from(value: Event) -> Result<Self> {
        let kind = serde_json::to_string(&value.kind).with_context(|| {
            format!(
                "Could not parse field 'kind' to storage value '{:#?}'",
                value.kind
            )
        })?;

        Ok(Self {
            id: value.id,
            kind,
            emitted: value.emitted.to_string(),
        })
    }
}

impl Event {
    pub fn new(kind: Kind) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            emitted: epoch_milli(),
        }
    }
}

/// A handle to the live event stream. Receivers that fall more than the channel capacity behind
/// miss events; the channel is best-effort by design.
#[derive(Debug)]
pub struct EventListener(broadcast::Receiver<Event>);

impl EventListener {
    pub async fn next(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.0.recv().await
    }
}

/// The event bus is a central handler for all things related to events within the application.
/// It allows a subscriber to listen to events and a sender to emit events.
/// This provides an internal interface for components to wait on state changes, and it's also
/// what the event streaming endpoint hangs off of.
#[derive(Debug, Clone)]
pub struct EventBus {
    storage: storage::Db,
    broadcast_channel: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(storage: storage::Db, retention: u64, prune_interval: u64) -> Self {
        let (tx, _) = broadcast::channel(100);

        let event_bus = Self {
            storage: storage.clone(),
            broadcast_channel: tx,
        };

        tokio::spawn(async move {
            loop {
                match prune_events(&storage, retention).await {
                    Ok(_) => (),
                    Err(e) => {
                        error!(error = %e, "encountered an error during attempt to prune old events")
                    }
                };

                tokio::time::sleep(tokio::time::Duration::from_secs(prune_interval)).await;
            }
        });

        event_bus
    }

    /// Returns a listener for events as they are published. The underlying receiver drops
    /// automatically when the listener goes out of scope.
    pub fn subscribe_live(&self) -> EventListener {
        EventListener(self.broadcast_channel.subscribe())
    }

    /// Emit a new event, waiting until it has been persisted and handed to the broadcast
    /// channel. Callers that need their events delivered in a deterministic order (the
    /// provisioner does) use this form.
    pub async fn try_publish(&self, kind: Kind) -> Result<Event> {
        let new_event = Event::new(kind.clone());

        let mut conn = self.storage.write_conn().await.with_context(|| {
            format!(
                "could not publish event for kind '{}'; Database error;",
                new_event.kind,
            )
        })?;

        let new_event_storage: storage::events::Event =
            new_event.clone().try_into().with_context(|| {
                format!(
                    "could not publish event for kind '{}'; could not serialize event into storage",
                    &kind.to_string()
                )
            })?;

        storage::events::insert(&mut conn, &new_event_storage)
            .await
            .with_context(|| {
                format!(
                    "could not publish event for kind '{}'; Database insert error",
                    &kind.to_string()
                )
            })?;

        trace!(id = new_event.id, kind = %kind, emitted = new_event.emitted, "new event");

        // A send error just means there are no current receivers, which is fine.
        let _ = self.broadcast_channel.send(new_event.clone());

        Ok(new_event)
    }

    /// Emit a new event without waiting for it to land. Used by request handlers where the
    /// response should not block on event bookkeeping.
    pub fn publish(self, kind: Kind) {
        tokio::spawn(async move {
            if let Err(err) = self.try_publish(kind.clone()).await {
                error!(error = %err, kind = %kind, "Could not publish event");
            }
        });
    }
}

async fn prune_events(storage: &storage::Db, retention: u64) -> Result<(), storage::StorageError> {
    let mut offset = 0;
    let mut total_pruned = 0;

    let mut conn = match storage.write_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            error!("could not prune events; connection error");
            return Err(e);
        }
    };

    loop {
        let events = storage::events::list(&mut conn, offset, 50, false).await?;

        for event in &events {
            if is_past_cut_date(event, retention) {
                debug!(
                    emitted = event.emitted,
                    retention = retention,
                    current_time = epoch_milli(),
                    "removed event past retention period"
                );

                total_pruned += 1;

                storage::events::delete(&mut conn, &event.id).await?;
            }
        }

        if events.len() != 50 {
            if total_pruned > 0 {
                info!(
                    retention = retention,
                    total_pruned = total_pruned,
                    "pruned old events"
                );
            }

            return Ok(());
        }

        offset += events.len() as i64;
    }
}

fn is_past_cut_date(event: &storage::events::Event, limit: u64) -> bool {
    let now = epoch_milli();
    let limit = Duration::from_secs(limit).as_millis() as u64;
    let expiry_time = now.saturating_sub(limit);

    let emitted = match event.emitted.parse::<u64>() {
        Ok(emitted) => emitted,
        Err(_) => return false,
    };

    emitted < expiry_time
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn publish_persists_and_broadcasts() {
        let harness = TestHarness::new().await;
        let event_bus = EventBus::new(harness.db.clone(), 604800, 3600);

        let mut listener = event_bus.subscribe_live();

        let published = event_bus
            .try_publish(Kind::CreatedNote { note_id: 1 })
            .await
            .expect("Failed to publish event");

        let received = listener.next().await.expect("Failed to receive event");
        assert_eq!(received, published);

        let mut conn = harness.read_conn().await.unwrap();
        let stored = storage::events::get(&mut conn, &published.id)
            .await
            .expect("Event was not persisted");

        let stored: Event = stored.try_into().unwrap();
        assert_eq!(stored.kind, Kind::CreatedNote { note_id: 1 });
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let harness = TestHarness::new().await;
        let event_bus = EventBus::new(harness.db.clone(), 604800, 3600);

        let mut listener = event_bus.subscribe_live();

        for note_id in 0..5 {
            event_bus
                .try_publish(Kind::CreatedNote { note_id })
                .await
                .expect("Failed to publish event");
        }

        for note_id in 0..5 {
            let received = listener.next().await.expect("Failed to receive event");
            assert_eq!(received.kind, Kind::CreatedNote { note_id });
        }
    }

    #[test]
    fn kind_round_trips_through_json() {
        let kind = Kind::CompletedDeploymentStep {
            deployment_id: 7,
            step: "configure_networking".to_string(),
            progress: 57,
        };

        let encoded = serde_json::to_string(&kind).unwrap();
        let decoded: Kind = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, kind);
    }
}
