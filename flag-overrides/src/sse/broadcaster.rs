use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::api::errors::{DeliveryError, FlagError};
use crate::flags::flag_models::Flag;
use crate::flags::override_models::Override;
use crate::metrics_consts::{
    BROADCASTS_COUNTER, BROADCAST_DELIVERIES_COUNTER, BROADCAST_DELIVERY_FAILURES_COUNTER,
    BROADCAST_DURATION_SECONDS, CONNECTIONS_EVICTED_COUNTER,
};
use crate::metrics_utils::{histogram, inc};
use crate::sse::registry::{ConnectionHandle, ConnectionRegistry, SharedConnection};
use crate::sse::types::{FlagChangeEvent, FlagEventType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelivery {
    pub connection_id: String,
    pub error: DeliveryError,
}

impl FailedDelivery {
    pub fn into_error(self) -> FlagError {
        FlagError::DeliveryFailure {
            connection_id: self.connection_id,
            source: self.error,
        }
    }
}

/// Outcome of one fan-out. Failures are per connection and never abort the others.
/// Connections that timed out or were closed are also dropped from the registry.
#[derive(Debug, Clone)]
pub struct BroadcastReport {
    pub event: FlagChangeEvent,
    pub attempted: usize,
    pub delivered: usize,
    pub failures: Vec<FailedDelivery>,
}

impl BroadcastReport {
    pub fn is(&self, event_type: FlagEventType) -> bool {
        self.event.event_type == event_type
    }
}

/// Handle on a queued broadcast. Dropping it does not cancel delivery.
#[derive(Debug)]
pub struct BroadcastTicket {
    rx: oneshot::Receiver<BroadcastReport>,
}

impl BroadcastTicket {
    /// Waits for the fan-out to finish. `None` if the dispatcher has shut down.
    pub async fn completed(self) -> Option<BroadcastReport> {
        self.rx.await.ok()
    }
}

enum Job {
    Broadcast {
        event: FlagChangeEvent,
        done: oneshot::Sender<BroadcastReport>,
    },
    Unicast {
        connection_id: String,
        event: FlagChangeEvent,
        done: oneshot::Sender<Result<(), FlagError>>,
    },
}

/// Fans change events out to every registered connection.
///
/// Jobs are handled one at a time, in submission order, by a single dispatcher task.
/// Every connection therefore sees events in the order they were submitted. Within one
/// broadcast the per-connection sends run concurrently, each bounded by `send_timeout`.
#[derive(Clone)]
pub struct ChangeBroadcaster {
    registry: Arc<ConnectionRegistry>,
    queue: mpsc::UnboundedSender<Job>,
}

impl ChangeBroadcaster {
    /// Spawns the dispatcher, so this must be called from within a tokio runtime.
    pub fn new(registry: Arc<ConnectionRegistry>, send_timeout: Duration) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(registry.clone(), send_timeout, rx));
        Self { registry, queue }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broadcast_flag_created(&self, flag: &Flag, actor_user_id: Uuid) -> BroadcastTicket {
        self.broadcast(FlagChangeEvent::flag_created(flag, actor_user_id))
    }

    pub fn broadcast_flag_updated(&self, flag: &Flag, actor_user_id: Uuid) -> BroadcastTicket {
        self.broadcast(FlagChangeEvent::flag_updated(flag, actor_user_id))
    }

    pub fn broadcast_flag_deleted(&self, flag_id: Uuid, actor_user_id: Uuid) -> BroadcastTicket {
        self.broadcast(FlagChangeEvent::flag_deleted(flag_id, actor_user_id))
    }

    pub fn broadcast_override_set(
        &self,
        flag_override: &Override,
        actor_user_id: Uuid,
    ) -> BroadcastTicket {
        self.broadcast(FlagChangeEvent::override_set(flag_override, actor_user_id))
    }

    pub fn broadcast_override_removed(
        &self,
        flag_id: Uuid,
        user_id: Uuid,
        actor_user_id: Uuid,
    ) -> BroadcastTicket {
        self.broadcast(FlagChangeEvent::override_removed(
            flag_id,
            user_id,
            actor_user_id,
        ))
    }

    /// Queues `event` for every connection registered when its turn comes. Returns
    /// immediately; the caller never waits on delivery unless it awaits the ticket.
    pub fn broadcast(&self, event: FlagChangeEvent) -> BroadcastTicket {
        let (done, rx) = oneshot::channel();
        let event_type = event.event_type;
        if self.queue.send(Job::Broadcast { event, done }).is_err() {
            tracing::warn!(event_type = %event_type, "Broadcast dispatcher is gone, dropping event");
        }
        BroadcastTicket { rx }
    }

    /// Delivers `event` to a single connection, ordered with respect to broadcasts.
    pub async fn send_to(
        &self,
        connection_id: &str,
        event: FlagChangeEvent,
    ) -> Result<(), FlagError> {
        let (done, rx) = oneshot::channel();
        self.queue
            .send(Job::Unicast {
                connection_id: connection_id.to_string(),
                event,
                done,
            })
            .map_err(|_| FlagError::Internal("broadcast dispatcher is gone".to_string()))?;

        rx.await
            .map_err(|_| FlagError::Internal("broadcast dispatcher is gone".to_string()))?
    }
}

async fn dispatch(
    registry: Arc<ConnectionRegistry>,
    send_timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Broadcast { event, done } => {
                let report = fan_out(&registry, send_timeout, event).await;
                // The submitter may have dropped its ticket
                if done.send(report).is_err() {
                    tracing::trace!("Broadcast report unclaimed");
                }
            }
            Job::Unicast {
                connection_id,
                event,
                done,
            } => {
                let result = unicast(&registry, send_timeout, &connection_id, &event).await;
                if done.send(result).is_err() {
                    tracing::trace!(connection_id = %connection_id, "Unicast result unclaimed");
                }
            }
        }
    }
    tracing::debug!("Broadcast dispatcher stopped");
}

async fn fan_out(
    registry: &ConnectionRegistry,
    send_timeout: Duration,
    event: FlagChangeEvent,
) -> BroadcastReport {
    let start = Instant::now();
    let connections = registry.snapshot();
    let attempted = connections.len();

    let sends = connections.iter().map(|(connection_id, connection)| {
        let event = &event;
        async move {
            let result = send_bounded(connection.as_ref(), event, send_timeout).await;
            (connection_id, connection, result)
        }
    });

    let mut failures = Vec::new();
    for (connection_id, connection, result) in join_all(sends).await {
        if let Err(error) = result {
            tracing::warn!(
                connection_id = %connection_id,
                event_type = %event.event_type,
                error = %error,
                "Failed to deliver event"
            );
            inc(
                BROADCAST_DELIVERY_FAILURES_COUNTER,
                &[("reason".to_string(), failure_reason(&error).to_string())],
                1,
            );
            evict_if_unreachable(registry, connection_id, connection, &error);
            failures.push(FailedDelivery {
                connection_id: connection_id.clone(),
                error,
            });
        }
    }
    let delivered = attempted - failures.len();

    let labels = [("type".to_string(), event.event_type.to_string())];
    inc(BROADCASTS_COUNTER, &labels, 1);
    inc(BROADCAST_DELIVERIES_COUNTER, &labels, delivered as u64);
    histogram(
        BROADCAST_DURATION_SECONDS,
        &labels,
        start.elapsed().as_secs_f64(),
    );
    tracing::debug!(
        event_type = %event.event_type,
        attempted,
        delivered,
        "Broadcast complete"
    );

    BroadcastReport {
        event,
        attempted,
        delivered,
        failures,
    }
}

async fn unicast(
    registry: &ConnectionRegistry,
    send_timeout: Duration,
    connection_id: &str,
    event: &FlagChangeEvent,
) -> Result<(), FlagError> {
    let connection = registry
        .get(connection_id)
        .ok_or_else(|| FlagError::connection_not_found(connection_id))?;

    send_bounded(connection.as_ref(), event, send_timeout)
        .await
        .map_err(|error| {
            tracing::warn!(
                connection_id = %connection_id,
                event_type = %event.event_type,
                error = %error,
                "Failed to deliver event"
            );
            evict_if_unreachable(registry, connection_id, &connection, &error);
            FlagError::DeliveryFailure {
                connection_id: connection_id.to_string(),
                source: error,
            }
        })
}

/// Drops a connection that is gone or stopped reading, so later jobs don't wait on it.
/// Dropping its sender ends the subscriber's stream, and the client can reconnect.
fn evict_if_unreachable(
    registry: &ConnectionRegistry,
    connection_id: &str,
    connection: &SharedConnection,
    error: &DeliveryError,
) {
    if matches!(error, DeliveryError::Closed | DeliveryError::TimedOut(_))
        && registry.evict(connection_id, connection)
    {
        tracing::info!(connection_id = %connection_id, error = %error, "Evicted connection");
        inc(
            CONNECTIONS_EVICTED_COUNTER,
            &[("reason".to_string(), failure_reason(error).to_string())],
            1,
        );
    }
}

async fn send_bounded(
    connection: &(dyn ConnectionHandle + Send + Sync),
    event: &FlagChangeEvent,
    send_timeout: Duration,
) -> Result<(), DeliveryError> {
    match tokio::time::timeout(send_timeout, connection.send(event)).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::TimedOut(send_timeout)),
    }
}

fn failure_reason(error: &DeliveryError) -> &'static str {
    match error {
        DeliveryError::Closed => "closed",
        DeliveryError::TimedOut(_) => "timeout",
        DeliveryError::Serialization(_) => "serialization",
    }
}
