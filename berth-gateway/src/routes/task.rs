//! Task (exec session) handlers. Tasks are staged on a handle and take
//! effect at commit; the guest launches them and reports back through
//! the started marker.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use berth_core::{Common, CoreError, SessionCmd, SessionConfig};
use berth_extraconfig::session_started_key;
use serde::Deserialize;
use std::time::Duration;

use crate::error::ApiError;
use crate::routes::{find_handle, lock_handle, resolve_container, CoreState};

const TASK_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct JoinBody {
    pub id: String,
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
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// `POST /v1/handles/:key/tasks` — stage a new task on the handle.
pub async fn join(
    State(core): CoreState,
    Path(key): Path<String>,
    Json(body): Json<JoinBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.id.is_empty() {
        return Err(ApiError::InvalidRequest("task id is empty".into()));
    }
    if body.path.is_empty() {
        return Err(ApiError::InvalidRequest("task path is empty".into()));
    }
    let handle = find_handle(&core, &key)?;
    let task = SessionConfig {
        common: Common {
            id: body.id.clone(),
            name: body.id.clone(),
            notes: String::new(),
        },
        cmd: SessionCmd {
            path: body.path,
            args: body.args,
            env: body.env,
            dir: body.dir,
        },
        tty: body.tty,
        attach: body.attach,
        ..SessionConfig::default()
    };
    lock_handle(&handle).add_task(body.id, task)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /v1/handles/:key/tasks/:task_id` — drop a staged task.
pub async fn remove(
    State(core): CoreState,
    Path((key, task_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = find_handle(&core, &key)?;
    lock_handle(&handle).remove_task(&task_id)?;
    Ok(StatusCode::NO_CONTENT)
}

fn set_attach(
    core: &crate::core::Core,
    key: &str,
    task_id: &str,
    attach: bool,
) -> Result<(), ApiError> {
    let handle = find_handle(core, key)?;
    let mut guard = lock_handle(&handle);
    let session = guard
        .exec_config
        .session_mut(task_id)
        .ok_or_else(|| {
            ApiError::Core(CoreError::NotFound {
                kind: "task",
                id: task_id.to_owned(),
            })
        })?;
    session.attach = attach;
    Ok(())
}

/// `POST /v1/handles/:key/tasks/:task_id/bind` — mark the task for
/// stream attachment at commit.
pub async fn bind(
    State(core): CoreState,
    Path((key, task_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    set_attach(&core, &key, &task_id, true)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/handles/:key/tasks/:task_id/unbind` — detach the task.
pub async fn unbind(
    State(core): CoreState,
    Path((key, task_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    set_attach(&core, &key, &task_id, false)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /v1/containers/:id/tasks/:task_id/wait` — block until the guest
/// reports the task launched, returning the launch outcome.
pub async fn wait(
    State(core): CoreState,
    Path((id, task_id)): Path<(String, String)>,
    Query(query): Query<WaitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let container = resolve_container(&core, &id)?;
    let vm = {
        let inner = container.lock().await;
        if !inner.exec_config.sessions.contains_key(&task_id)
            && !inner.exec_config.execs.contains_key(&task_id)
        {
            return Err(ApiError::Core(CoreError::NotFound {
                kind: "task",
                id: task_id,
            }));
        }
        inner.vm.clone().ok_or(ApiError::Core(CoreError::InvalidState {
            op: "wait",
            state: inner.state,
        }))?
    };

    let timeout = query.timeout_secs.map_or(TASK_WAIT, Duration::from_secs);
    let key = session_started_key(&task_id);
    let value = tokio::time::timeout(timeout, core.driver.wait_for_extra_config_key(&vm, &key))
        .await
        .map_err(|_| {
            ApiError::Core(CoreError::Timeout {
                what: "task start",
                timeout,
            })
        })?
        .map_err(CoreError::from)?;

    if value == "true" {
        Ok(Json(serde_json::json!({"id": task_id, "started": true})))
    } else {
        Err(ApiError::Core(CoreError::InfrastructureFault(format!(
            "task {task_id} failed to launch: {value}"
        ))))
    }
}
