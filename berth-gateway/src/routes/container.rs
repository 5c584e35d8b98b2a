//! Container lifecycle handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use berth_core::{HandleKey, PortBinding, State as ContainerState};
use berth_events::StatsConverter;
use berth_exec::{ContainerCreateConfig, REFRESH_TIMEOUT};
use berth_net::AddContainerOptions;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::error::ApiError;
use crate::routes::{find_handle, lock_handle, resolve_container, CoreState};
use crate::stream::{bytes_response, ndjson_line, ndjson_response, CloseGuard};

/// Nominal per-vCPU clock used as the stats denominator until the driver
/// reports host capacity.
const NOMINAL_CPU_MHZ: i64 = 2_000;

#[derive(Debug, Deserialize)]
pub struct NetworkAttachment {
    pub scope: String,
    #[serde(default)]
    pub ip: Option<std::net::Ipv4Addr>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub attach: bool,
    #[serde(default)]
    pub stop_signal: String,
    #[serde(default)]
    pub num_cpus: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub annotations: IndexMap<String, String>,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub id: String,
    pub handle: HandleKey,
}

#[derive(Debug, Deserialize)]
pub struct CommitBody {
    #[serde(default)]
    pub wait_time_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct StateBody {
    pub state: ContainerState,
}

#[derive(Debug, Deserialize)]
pub struct RenameBody {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SignalBody {
    pub signal: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    pub state: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct TailQuery {
    #[serde(default)]
    pub tail: Option<usize>,
    #[serde(default)]
    pub follow: bool,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub stream: bool,
}

fn parse_state(s: &str) -> Result<ContainerState, ApiError> {
    serde_json::from_value(serde_json::Value::String(s.to_owned()))
        .map_err(|_| ApiError::InvalidRequest(format!("unknown state '{s}'")))
}

fn parse_ports(specs: &[String]) -> Result<Vec<PortBinding>, ApiError> {
    specs
        .iter()
        .map(|s| s.parse().map_err(ApiError::Core))
        .collect()
}

/// `POST /v1/containers` — stage a new container and return its creation
/// handle. Nothing touches the infrastructure until commit.
pub async fn create(
    State(core): CoreState,
    Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Uuid::new_v4().simple().to_string();
    let key = core.committer.create_handle(ContainerCreateConfig {
        id: id.clone(),
        name: body.name,
        num_cpus: body.num_cpus,
        memory_mb: body.memory_mb,
        path: body.path,
        args: body.args,
        env: body.env,
        dir: body.dir,
        tty: body.tty,
        attach: body.attach,
        stop_signal: body.stop_signal,
        annotations: body.annotations,
    })?;

    if !body.networks.is_empty() {
        let handle = find_handle(&core, key.as_str())?;
        let mut guard = lock_handle(&handle);
        for attachment in &body.networks {
            let mut options = AddContainerOptions::new(&attachment.scope);
            options.ip = attachment.ip;
            options.ports = parse_ports(&attachment.ports)?;
            options.aliases = attachment.aliases.clone();
            core.network.add_container(&mut guard, &options)?;
        }
    }

    tracing::info!(container = %id, "container staged");
    Ok((StatusCode::CREATED, Json(CreateResponse { id, handle: key })))
}

/// `GET /v1/containers` — list container summaries, optionally filtered
/// by state.
pub async fn list(
    State(core): CoreState,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = match &query.state {
        Some(s) => Some([parse_state(s)?]),
        None => None,
    };
    let containers = core.cache.containers(filter.as_ref().map(<[_; 1]>::as_slice));
    let mut infos = Vec::with_capacity(containers.len());
    for container in containers {
        infos.push(container.info().await);
    }
    Ok(Json(infos))
}

/// `GET /v1/containers/:id` — full summary for one container.
pub async fn info(
    State(core): CoreState,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let container = resolve_container(&core, &id)?;
    Ok(Json(container.info().await))
}

/// `GET /v1/containers/:id/state` — just the lifecycle state.
pub async fn state(
    State(core): CoreState,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let container = resolve_container(&core, &id)?;
    Ok(Json(
        serde_json::json!({"state": container.state().to_string()}),
    ))
}

/// `POST /v1/containers/:id/handle` — open a mutation handle snapshotting
/// the container's current configuration.
pub async fn new_handle(
    State(core): CoreState,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let container = resolve_container(&core, &id)?;
    let key = core.committer.handle_for(&container).await;
    Ok(Json(serde_json::json!({"handle": key})))
}

/// `POST /v1/handles/:key/commit` — apply the handle's staged mutation.
pub async fn commit(
    State(core): CoreState,
    Path(key): Path<String>,
    Json(body): Json<CommitBody>,
) -> Result<impl IntoResponse, ApiError> {
    let key = HandleKey::from(key);
    let wait = body.wait_time_secs.map(Duration::from_secs);
    core.committer.commit(&key, wait).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/handles/:key/state` — record the desired power state on the
/// handle; the transition happens at commit.
pub async fn set_state(
    State(core): CoreState,
    Path(key): Path<String>,
    Json(body): Json<StateBody>,
) -> Result<impl IntoResponse, ApiError> {
    if !matches!(
        body.state,
        ContainerState::Running | ContainerState::Stopped | ContainerState::Created
    ) {
        return Err(ApiError::InvalidRequest(format!(
            "cannot target state {}",
            body.state
        )));
    }
    let handle = find_handle(&core, key.as_str())?;
    lock_handle(&handle).set_target_state(body.state);
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/handles/:key/rename` — stage a rename.
pub async fn rename(
    State(core): CoreState,
    Path(key): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.name.is_empty() {
        return Err(ApiError::InvalidRequest("name is empty".into()));
    }
    let handle = find_handle(&core, key.as_str())?;
    lock_handle(&handle).rename(body.name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /v1/containers/:id` — destroy the VM and evict the container.
pub async fn remove(
    State(core): CoreState,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let container = resolve_container(&core, &id)?;
    core.committer.remove_container(&container).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/containers/:id/signal` — deliver a signal via the guest
/// tether.
pub async fn signal(
    State(core): CoreState,
    Path(id): Path<String>,
    Json(body): Json<SignalBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.signal.is_empty() {
        return Err(ApiError::InvalidRequest("signal is empty".into()));
    }
    let container = resolve_container(&core, &id)?;
    core.committer.signal(&container, &body.signal).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /v1/containers/:id/wait` — block until the container reaches the
/// requested state.
pub async fn wait(
    State(core): CoreState,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let desired = parse_state(&query.state)?;
    let timeout = query
        .timeout_secs
        .map_or(REFRESH_TIMEOUT, Duration::from_secs);
    let container = resolve_container(&core, &id)?;
    container.wait_for_state(desired, timeout).await?;
    Ok(Json(serde_json::json!({"state": desired.to_string()})))
}

/// `GET /v1/containers/:id/logs` — stream the container's output log.
pub async fn logs(
    State(core): CoreState,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Response, ApiError> {
    let container = resolve_container(&core, &id)?;
    let stream = core
        .committer
        .logs(&container, query.tail, query.follow)
        .await?;
    let closer = stream.closer.clone();
    Ok(bytes_response(
        stream.rx,
        CloseGuard::new(move || closer.close()),
    ))
}

/// `GET /v1/containers/:id/stats` — docker-shaped resource statistics.
/// One entry by default; an NDJSON stream with `?stream=true`.
pub async fn stats(
    State(core): CoreState,
    Path(id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Result<Response, ApiError> {
    let container = resolve_container(&core, &id)?;
    let info = container.info().await;
    let vm = info.vm.clone().ok_or(ApiError::Core(
        berth_core::CoreError::InvalidState {
            op: "stats",
            state: container.state(),
        },
    ))?;
    let host_mhz = i64::from(info.cpus.max(1)) * NOMINAL_CPU_MHZ;
    let mut converter = StatsConverter::new(host_mhz, info.memory_mb);

    if query.stream {
        let (subscription, rx) = core.metrics.subscribe(&vm);
        let metrics = Arc::clone(&core.metrics);
        let guard = CloseGuard::new(move || metrics.unsubscribe(&subscription));
        let lines = ReceiverStream::new(rx).filter_map(move |sample| {
            match converter.update(sample) {
                Ok(Some(entry)) => Some(ndjson_line(&entry)),
                Ok(None) => None,
                Err(e) => Some(crate::stream::error_line(
                    &berth_core::CoreError::InvalidArgument(e.to_string()),
                )),
            }
        });
        return Ok(ndjson_response(lines, guard));
    }

    // One-shot: two dedicated samples drive a single delta entry.
    for _ in 0..2 {
        let sample = core
            .metrics
            .sample(&vm)
            .await
            .map_err(berth_core::CoreError::from)?;
        if let Some(sample) = sample {
            if let Ok(Some(entry)) = converter.update(sample) {
                return Ok(Json(entry).into_response());
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Err(ApiError::Core(berth_core::CoreError::Timeout {
        what: "stats sample",
        timeout: Duration::from_secs(2),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing::{request, test_core};
    use crate::routes::create_router;

    fn create_body(name: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "path": "/bin/server",
            "args": ["--port", "8080"],
            "num_cpus": 1,
            "memory_mb": 512,
        })
    }

    #[tokio::test]
    async fn create_returns_id_and_handle() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (status, body) = request(app, "POST", "/v1/containers", Some(create_body("web"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["id"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(body["handle"].as_str().is_some_and(|h| h.len() == 32));
        core.shutdown();
    }

    #[tokio::test]
    async fn create_commit_then_info_round_trip() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (_, created) = request(
            app.clone(),
            "POST",
            "/v1/containers",
            Some(create_body("web")),
        )
        .await;
        let handle = created["handle"].as_str().map(ToOwned::to_owned);
        let handle = match handle {
            Some(h) => h,
            None => panic!("create response missing handle: {created}"),
        };

        let (status, _) = request(
            app.clone(),
            "POST",
            &format!("/v1/handles/{handle}/commit"),
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let id = created["id"].as_str().map(ToOwned::to_owned).unwrap_or_default();
        let (status, info) = request(app, "GET", &format!("/v1/containers/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["state"], "Created");
        assert!(info["name"].as_str().is_some_and(|n| n == "web"));
        core.shutdown();
    }

    #[tokio::test]
    async fn commit_of_unknown_handle_is_not_found() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (status, body) = request(
            app,
            "POST",
            "/v1/handles/0000000000000000/commit",
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NotFound");
        core.shutdown();
    }

    #[tokio::test]
    async fn start_via_state_and_commit_reaches_running() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (_, created) = request(
            app.clone(),
            "POST",
            "/v1/containers",
            Some(create_body("web")),
        )
        .await;
        let handle = created["handle"].as_str().unwrap_or_default().to_owned();
        let id = created["id"].as_str().unwrap_or_default().to_owned();

        let (status, _) = request(
            app.clone(),
            "POST",
            &format!("/v1/handles/{handle}/state"),
            Some(serde_json::json!({"state": "Running"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = request(
            app.clone(),
            "POST",
            &format!("/v1/handles/{handle}/commit"),
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) =
            request(app, "GET", &format!("/v1/containers/{id}/state"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "Running");
        core.shutdown();
    }

    #[tokio::test]
    async fn invalid_target_state_is_rejected() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (_, created) = request(
            app.clone(),
            "POST",
            "/v1/containers",
            Some(create_body("web")),
        )
        .await;
        let handle = created["handle"].as_str().unwrap_or_default().to_owned();
        let (status, body) = request(
            app,
            "POST",
            &format!("/v1/handles/{handle}/state"),
            Some(serde_json::json!({"state": "Fixing"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "InvalidArgument");
        core.shutdown();
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (_, created) = request(
            app.clone(),
            "POST",
            "/v1/containers",
            Some(create_body("web")),
        )
        .await;
        let handle = created["handle"].as_str().unwrap_or_default().to_owned();
        request(
            app.clone(),
            "POST",
            &format!("/v1/handles/{handle}/commit"),
            Some(serde_json::json!({})),
        )
        .await;

        let (status, body) = request(app.clone(), "GET", "/v1/containers?state=Created", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map_or(0, Vec::len), 1);

        let (_, empty) = request(app, "GET", "/v1/containers?state=Running", None).await;
        assert_eq!(empty.as_array().map_or(1, Vec::len), 0);
        core.shutdown();
    }

    #[tokio::test]
    async fn remove_running_container_conflicts() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (_, created) = request(
            app.clone(),
            "POST",
            "/v1/containers",
            Some(create_body("web")),
        )
        .await;
        let handle = created["handle"].as_str().unwrap_or_default().to_owned();
        let id = created["id"].as_str().unwrap_or_default().to_owned();
        request(
            app.clone(),
            "POST",
            &format!("/v1/handles/{handle}/state"),
            Some(serde_json::json!({"state": "Running"})),
        )
        .await;
        request(
            app.clone(),
            "POST",
            &format!("/v1/handles/{handle}/commit"),
            Some(serde_json::json!({})),
        )
        .await;

        let (status, body) =
            request(app, "DELETE", &format!("/v1/containers/{id}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "InvalidState");
        core.shutdown();
    }

    #[tokio::test]
    async fn created_container_can_be_removed() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (_, created) = request(
            app.clone(),
            "POST",
            "/v1/containers",
            Some(create_body("web")),
        )
        .await;
        let handle = created["handle"].as_str().unwrap_or_default().to_owned();
        let id = created["id"].as_str().unwrap_or_default().to_owned();
        request(
            app.clone(),
            "POST",
            &format!("/v1/handles/{handle}/commit"),
            Some(serde_json::json!({})),
        )
        .await;

        let (status, _) =
            request(app.clone(), "DELETE", &format!("/v1/containers/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = request(app, "GET", &format!("/v1/containers/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        core.shutdown();
    }

    #[tokio::test]
    async fn signal_requires_a_running_container() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (_, created) = request(
            app.clone(),
            "POST",
            "/v1/containers",
            Some(create_body("web")),
        )
        .await;
        let handle = created["handle"].as_str().unwrap_or_default().to_owned();
        let id = created["id"].as_str().unwrap_or_default().to_owned();
        request(
            app.clone(),
            "POST",
            &format!("/v1/handles/{handle}/commit"),
            Some(serde_json::json!({})),
        )
        .await;

        let (status, body) = request(
            app,
            "POST",
            &format!("/v1/containers/{id}/signal"),
            Some(serde_json::json!({"signal": "HUP"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "InvalidState");
        core.shutdown();
    }
}
