//! Axum route handlers for the port layer API.

pub mod container;
pub mod events;
pub mod interaction;
pub mod scope;
pub mod task;

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use berth_core::{CoreError, HandleKey};
use berth_exec::{Container, Handle};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{core::Core, error::ApiError};

pub(crate) type CoreState = State<Arc<Core>>;

/// Build the application router over the assembled core.
pub fn create_router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/v1/containers", post(container::create).get(container::list))
        .route(
            "/v1/containers/{id}",
            get(container::info).delete(container::remove),
        )
        .route("/v1/containers/{id}/state", get(container::state))
        .route("/v1/containers/{id}/handle", post(container::new_handle))
        .route("/v1/containers/{id}/signal", post(container::signal))
        .route("/v1/containers/{id}/wait", get(container::wait))
        .route("/v1/containers/{id}/logs", get(container::logs))
        .route("/v1/containers/{id}/stats", get(container::stats))
        .route("/v1/containers/{id}/stdout", get(interaction::stdout))
        .route("/v1/containers/{id}/stderr", get(interaction::stderr))
        .route(
            "/v1/containers/{id}/tasks/{task_id}/wait",
            get(task::wait),
        )
        .route("/v1/handles/{key}/commit", post(container::commit))
        .route("/v1/handles/{key}/state", post(container::set_state))
        .route("/v1/handles/{key}/rename", post(container::rename))
        .route("/v1/handles/{key}/tasks", post(task::join))
        .route("/v1/handles/{key}/tasks/{task_id}", delete(task::remove))
        .route("/v1/handles/{key}/tasks/{task_id}/bind", post(task::bind))
        .route(
            "/v1/handles/{key}/tasks/{task_id}/unbind",
            post(task::unbind),
        )
        .route("/v1/handles/{key}/network", post(scope::add_container))
        .route("/v1/handles/{key}/network/bind", post(scope::bind))
        .route("/v1/handles/{key}/network/unbind", post(scope::unbind))
        .route(
            "/v1/handles/{key}/network/{scope}",
            delete(scope::remove_container),
        )
        .route(
            "/v1/handles/{key}/interaction/join",
            post(interaction::join),
        )
        .route(
            "/v1/handles/{key}/interaction/bind",
            post(interaction::bind),
        )
        .route(
            "/v1/handles/{key}/interaction/unbind",
            post(interaction::unbind),
        )
        .route("/v1/scopes", post(scope::create).get(scope::list))
        .route("/v1/scopes/{name}", delete(scope::remove))
        .route("/v1/events", get(events::stream))
        .route("/health", get(health))
        .with_state(core)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// `GET /health` — liveness probe.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// Resolves a container by id, unique id prefix, or name.
pub(crate) fn resolve_container(core: &Core, id: &str) -> Result<Arc<Container>, ApiError> {
    core.cache.resolve(id).ok_or_else(|| {
        ApiError::Core(CoreError::NotFound {
            kind: "container",
            id: id.to_owned(),
        })
    })
}

/// Looks up a live handle by its opaque key.
pub(crate) fn find_handle(
    core: &Core,
    key: &str,
) -> Result<Arc<std::sync::Mutex<Handle>>, ApiError> {
    core.committer
        .handle(&HandleKey::from(key.to_owned()))
        .ok_or_else(|| {
            ApiError::Core(CoreError::NotFound {
                kind: "handle",
                id: key.to_owned(),
            })
        })
}

pub(crate) fn lock_handle(handle: &std::sync::Mutex<Handle>) -> std::sync::MutexGuard<'_, Handle> {
    match handle.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{request, test_core};
    use super::*;

    #[tokio::test]
    async fn health_response_format_returns_ok_with_status_field() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (status, body) = request(app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        core.shutdown();
    }

    #[tokio::test]
    async fn unknown_container_maps_to_not_found_body() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (status, body) = request(app, "GET", "/v1/containers/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NotFound");
        core.shutdown();
    }
}
