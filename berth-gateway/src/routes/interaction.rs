//! Interaction handlers: attach bookkeeping on handles plus the stdout
//! and stderr streams backed by the guest's serial-port log files.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use berth_core::CoreError;
use serde::Deserialize;

use crate::error::ApiError;
use crate::routes::{find_handle, lock_handle, resolve_container, CoreState};
use crate::stream::{bytes_response, CloseGuard};

/// File the output serial port writes to.
const STDOUT_FILE: &str = "output.log";
/// File the tether serial port writes to; carries diagnostics and stderr.
const STDERR_FILE: &str = "tether.debug";

#[derive(Debug, Deserialize)]
pub struct SessionBody {
    /// Session to operate on; the primary session when omitted.
    #[serde(default)]
    pub session: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TailQuery {
    #[serde(default)]
    pub tail: Option<usize>,
    #[serde(default)]
    pub follow: bool,
}

fn with_session(
    core: &crate::core::Core,
    key: &str,
    session: Option<&str>,
    f: impl FnOnce(&mut berth_core::SessionConfig),
) -> Result<(), ApiError> {
    let handle = find_handle(core, key)?;
    let mut guard = lock_handle(&handle);
    let id = session
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| guard.exec_config.common.id.clone());
    let session = guard.exec_config.session_mut(&id).ok_or_else(|| {
        ApiError::Core(CoreError::NotFound {
            kind: "session",
            id,
        })
    })?;
    f(session);
    Ok(())
}

/// `POST /v1/handles/:key/interaction/join` — mark the session for
/// interactive attachment at commit.
pub async fn join(
    State(core): CoreState,
    Path(key): Path<String>,
    Json(body): Json<SessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    with_session(&core, &key, body.session.as_deref(), |s| s.attach = true)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/handles/:key/interaction/bind` — make the guest block the
/// session launch until a client is attached.
pub async fn bind(
    State(core): CoreState,
    Path(key): Path<String>,
    Json(body): Json<SessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    with_session(&core, &key, body.session.as_deref(), |s| {
        s.attach = true;
        s.run_block = true;
    })?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/handles/:key/interaction/unbind` — release the session.
pub async fn unbind(
    State(core): CoreState,
    Path(key): Path<String>,
    Json(body): Json<SessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    with_session(&core, &key, body.session.as_deref(), |s| {
        s.attach = false;
        s.run_block = false;
    })?;
    Ok(StatusCode::NO_CONTENT)
}

async fn serve_file(
    core: &crate::core::Core,
    id: &str,
    file: &str,
    query: &TailQuery,
) -> Result<Response, ApiError> {
    let container = resolve_container(core, id)?;
    let vm = {
        let inner = container.lock().await;
        inner.vm.clone().ok_or(ApiError::Core(CoreError::InvalidState {
            op: "attach",
            state: inner.state,
        }))?
    };
    let stream = core
        .driver
        .open_log(&vm, file, query.tail, query.follow)
        .await
        .map_err(CoreError::from)?;
    if query.follow {
        // Registered so a container stop tears the stream down.
        let mut inner = container.lock().await;
        inner.log_followers.push(stream.closer.clone());
    }
    let closer = stream.closer.clone();
    Ok(bytes_response(
        stream.rx,
        CloseGuard::new(move || closer.close()),
    ))
}

/// `GET /v1/containers/:id/stdout` — stream the session's output.
pub async fn stdout(
    State(core): CoreState,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Response, ApiError> {
    serve_file(&core, &id, STDOUT_FILE, &query).await
}

/// `GET /v1/containers/:id/stderr` — stream the tether's diagnostic log.
pub async fn stderr(
    State(core): CoreState,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Response, ApiError> {
    serve_file(&core, &id, STDERR_FILE, &query).await
}
