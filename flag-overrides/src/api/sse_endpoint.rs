use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::router;
use crate::sse::registry::{ChannelConnection, ConnectionHandle, ConnectionRegistry};
use crate::sse::types::FlagChangeEvent;

/// Unregisters the connection when the response stream is dropped, which is how axum
/// tells us the client went away.
struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    connection_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.registry.remove(&self.connection_id) {
            info!(connection_id = %self.connection_id, "SSE connection closed");
        }
    }
}

/// Server-Sent Events stream of flag changes.
///
/// Each subscriber is registered as one connection for the lifetime of the response.
/// The first event is `connected`, carrying the connection id. After that every flag
/// and override mutation arrives as an event named after its type, with the JSON
/// payload as data. Idle streams get a heartbeat comment.
///
/// ```text
/// event: connected
/// data: {"connectionId":"0190..."}
///
/// event: flag_deleted
/// data: {"id":"0190...","actorUserId":"0190..."}
/// ```
pub async fn flag_changes_stream(
    State(state): State<router::State>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let connection_id = Uuid::now_v7().to_string();
    let registry = state.service.broadcaster().registry().clone();
    let heartbeat = state.config.sse_heartbeat();

    // The greeting goes in before registration, so no broadcast can overtake it.
    // The channel always has room for at least one event.
    let (connection, mut rx) = ChannelConnection::new(state.config.connection_buffer_size());
    if let Err(e) = connection
        .send(&FlagChangeEvent::connected(&connection_id))
        .await
    {
        warn!(connection_id = %connection_id, error = %e, "Failed to greet SSE connection");
    }
    registry.add(connection_id.clone(), Arc::new(connection));
    info!(connection_id = %connection_id, "New SSE connection");

    let guard = ConnectionGuard {
        registry,
        connection_id,
    };

    let stream = async_stream::stream! {
        let _guard = guard;

        loop {
            match tokio::time::timeout(heartbeat, rx.recv()).await {
                Ok(Some(event)) => match event.data_json() {
                    Ok(data) => {
                        yield Ok(Event::default()
                            .event(event.event_type.as_str())
                            .data(data));
                    }
                    Err(e) => {
                        warn!(event_type = %event.event_type, error = %e, "Dropping unserializable event");
                    }
                },
                Ok(None) => {
                    // Replaced or removed from the registry
                    break;
                }
                Err(_) => {
                    yield Ok(Event::default().comment("heartbeat"));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
