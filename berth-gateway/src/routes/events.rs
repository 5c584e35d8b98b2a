//! Event streaming handlers.

use std::sync::Arc;

use axum::{extract::State, response::Response};
use berth_events::Topic;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::routes::CoreState;
use crate::stream::{ndjson_line, ndjson_response, CloseGuard};

/// `GET /v1/events` — NDJSON stream of every bus event, VM-level and
/// container-level, from the moment of subscription.
pub async fn stream(State(core): CoreState) -> Response {
    let subscriber = format!("events-{}", Uuid::new_v4().simple());
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    for topic in [Topic::VmEvents, Topic::ContainerEvents] {
        let tx = tx.clone();
        core.bus.subscribe(topic, subscriber.clone(), move |event| {
            // A closed receiver means the client went away; the guard
            // will unsubscribe shortly.
            let _ = tx.send(event.record());
        });
    }

    let guard = {
        let core = Arc::clone(&core);
        CloseGuard::new(move || {
            for topic in [Topic::VmEvents, Topic::ContainerEvents] {
                core.bus.unsubscribe(topic, &subscriber);
            }
        })
    };

    let lines = UnboundedReceiverStream::new(rx).map(|record| ndjson_line(&record));
    ndjson_response(lines, guard)
}

#[cfg(test)]
mod tests {
    use crate::routes::create_router;
    use crate::routes::testing::{request, test_core};
    use axum::http::StatusCode;
    use std::sync::Arc;

    #[tokio::test]
    async fn container_lifecycle_publishes_events() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));

        let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&seen);
        core.bus.subscribe(
            berth_events::Topic::ContainerEvents,
            "test-observer",
            move |event| {
                if let berth_events::BusEvent::Container(e) = event {
                    if let Ok(mut v) = sink.lock() {
                        v.push(e.event);
                    }
                }
            },
        );

        let (_, created) = request(
            app.clone(),
            "POST",
            "/v1/containers",
            Some(serde_json::json!({"name": "web", "path": "/bin/server"})),
        )
        .await;
        let handle = created["handle"].as_str().unwrap_or_default().to_owned();
        let (status, _) = request(
            app,
            "POST",
            &format!("/v1/handles/{handle}/commit"),
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let events = match seen.lock() {
            Ok(v) => v.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        assert!(
            events.contains(&"create".to_owned()),
            "expected a create event, got {events:?}"
        );
        core.shutdown();
    }
}
