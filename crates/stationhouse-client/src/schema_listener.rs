//! Schema-update listeners.
//!
//! One background listener per station with an attached schema, shared by
//! every producer on that station. Producers `attach` when they are created
//! and `detach` when they are destroyed; the subscription is opened on the
//! first attach and closed when the count drops back to zero.
//!
//! ```text
//!  producer A ──attach──┐
//!  producer B ──attach──┼──► registry["orders"] { refs: 2 }
//!                       │         │
//!                       │         ▼  $memphis_schema_updates_orders
//!                       │    listener task ──► SchemaCache["orders"]
//!  producer A ──detach──┘
//! ```

use crate::error::{ClientError, Result};
use crate::protocol::{schema_update_types, schema_updates_subject, SchemaUpdate};
use crate::schema::{SchemaCache, SchemaDefinition};
use stationhouse_broker::{Broker, Subscription};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LISTENER_POLL: Duration = Duration::from_secs(1);

struct Listener {
    refs: usize,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Reference-counted schema listeners keyed by internal station name.
#[derive(Default)]
pub struct SchemaListenerRegistry {
    listeners: Mutex<HashMap<String, Listener>>,
}

impl SchemaListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a producer to the station's listener, starting it if needed.
    ///
    /// Returns the reference count after attaching. The registry lock is
    /// held across the subscribe call so two producers racing on the same
    /// station cannot open two subscriptions.
    pub async fn attach(
        &self,
        broker: &Arc<dyn Broker>,
        schemas: &Arc<SchemaCache>,
        station: &str,
        parent: &CancellationToken,
    ) -> Result<usize> {
        let mut listeners = self.listeners.lock().await;

        if let Some(listener) = listeners.get_mut(station) {
            listener.refs += 1;
            debug!(station = %station, refs = listener.refs, "Reusing schema listener");
            return Ok(listener.refs);
        }

        let subscription = broker
            .subscribe(&schema_updates_subject(station))
            .await
            .map_err(|source| ClientError::SchemaUpdateSubscriptionFailed {
                station: station.to_string(),
                source,
            })?;

        let cancel = parent.child_token();
        let handle = tokio::spawn(run_listener(
            station.to_string(),
            subscription,
            Arc::clone(schemas),
            cancel.clone(),
        ));

        info!(station = %station, "Schema listener started");
        listeners.insert(
            station.to_string(),
            Listener {
                refs: 1,
                cancel,
                handle,
            },
        );
        Ok(1)
    }

    /// Detach one producer. Returns the remaining reference count; the
    /// listener is stopped when it reaches zero.
    pub async fn detach(&self, station: &str) -> usize {
        let mut listeners = self.listeners.lock().await;

        let remaining = match listeners.get_mut(station) {
            Some(listener) => {
                listener.refs = listener.refs.saturating_sub(1);
                listener.refs
            }
            None => return 0,
        };

        if remaining == 0 {
            if let Some(listener) = listeners.remove(station) {
                listener.cancel.cancel();
                info!(station = %station, "Schema listener stopped");
            }
        }
        remaining
    }

    pub async fn ref_count(&self, station: &str) -> usize {
        self.listeners
            .lock()
            .await
            .get(station)
            .map(|listener| listener.refs)
            .unwrap_or(0)
    }

    pub async fn is_running(&self, station: &str) -> bool {
        self.listeners
            .lock()
            .await
            .get(station)
            .map(|listener| !listener.handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop every listener regardless of reference counts.
    pub async fn shutdown(&self) {
        let mut listeners = self.listeners.lock().await;
        for (station, listener) in listeners.drain() {
            listener.cancel.cancel();
            debug!(station = %station, "Schema listener cancelled");
        }
    }
}

async fn run_listener(
    station: String,
    mut subscription: Subscription,
    schemas: Arc<SchemaCache>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = subscription.next_timeout(LISTENER_POLL) => match next {
                Ok(Some(delivery)) => apply_update(&station, &schemas, &delivery.payload),
                Ok(None) => {}
                Err(e) => {
                    warn!(station = %station, error = %e, "Schema update subscription ended");
                    break;
                }
            }
        }
    }
    subscription.drain();
}

fn apply_update(station: &str, schemas: &SchemaCache, payload: &[u8]) {
    let update: SchemaUpdate = match serde_json::from_slice(payload) {
        Ok(update) => update,
        Err(e) => {
            warn!(station = %station, error = %e, "Malformed schema update");
            return;
        }
    };

    match update.update_type {
        schema_update_types::INIT => match SchemaDefinition::from_init(&update.init) {
            Ok(Some(schema)) => {
                debug!(
                    station = %station,
                    schema = %schema.name,
                    version = schema.version,
                    "Schema replaced"
                );
                schemas.insert(station, schema);
            }
            Ok(None) => debug!(station = %station, "Schema update without a schema name"),
            Err(e) => warn!(station = %station, error = %e, "Ignoring schema update"),
        },
        schema_update_types::DROP => {
            schemas.remove(station);
            debug!(station = %station, "Schema removed");
        }
        other => debug!(station = %station, update_type = other, "Unknown schema update type"),
    }
}
