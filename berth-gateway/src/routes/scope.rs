//! Network scope and endpoint handlers.

use std::net::Ipv4Addr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use berth_core::Ipv4Net;
use berth_net::{AddContainerOptions, NewScopeConfig, ScopeType};
use serde::Deserialize;

use crate::error::ApiError;
use crate::routes::{find_handle, lock_handle, CoreState};

#[derive(Debug, Deserialize)]
pub struct ScopeBody {
    pub name: String,
    #[serde(rename = "type")]
    pub scope_type: String,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    /// Pool ranges as `first-last` or CIDR strings.
    #[serde(default)]
    pub pools: Vec<String>,
    #[serde(default)]
    pub network: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddContainerBody {
    pub scope: String,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// `POST /v1/scopes` — create a network scope.
pub async fn create(
    State(core): CoreState,
    Json(body): Json<ScopeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let scope_type = match body.scope_type.as_str() {
        "bridge" => ScopeType::Bridge,
        "external" => ScopeType::External,
        other => {
            return Err(ApiError::InvalidRequest(format!(
                "unknown scope type '{other}'"
            )))
        }
    };
    let subnet = match &body.subnet {
        Some(s) => Some(
            s.parse::<Ipv4Net>()
                .map_err(|e| ApiError::InvalidRequest(e.to_string()))?,
        ),
        None => None,
    };
    let pools = body
        .pools
        .iter()
        .map(|p| berth_core::ipv4::parse_pool(p).map_err(ApiError::Core))
        .collect::<Result<Vec<_>, _>>()?;

    let info = core.network.new_scope(NewScopeConfig {
        scope_type,
        name: body.name,
        subnet,
        gateway: body.gateway,
        dns: body.dns,
        pools,
        network_ref: body.network,
    })?;
    Ok((StatusCode::CREATED, Json(info)))
}

/// `GET /v1/scopes` — list scopes, optionally a single named one.
pub async fn list(
    State(core): CoreState,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let names = query.name.map(|n| vec![n]);
    Ok(Json(core.network.scopes(names.as_deref())))
}

/// `DELETE /v1/scopes/:name` — delete an empty, non-builtin scope.
pub async fn remove(
    State(core): CoreState,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    core.network.delete_scope(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/handles/:key/network` — stage an endpoint on the handle.
pub async fn add_container(
    State(core): CoreState,
    Path(key): Path<String>,
    Json(body): Json<AddContainerBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ports = body
        .ports
        .iter()
        .map(|s| s.parse().map_err(ApiError::Core))
        .collect::<Result<Vec<_>, _>>()?;
    let handle = find_handle(&core, &key)?;
    let mut guard = lock_handle(&handle);
    let mut options = AddContainerOptions::new(body.scope);
    options.ip = body.ip;
    options.ports = ports;
    options.aliases = body.aliases;
    core.network.add_container(&mut guard, &options)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /v1/handles/:key/network/:scope` — drop a staged endpoint.
pub async fn remove_container(
    State(core): CoreState,
    Path((key, scope)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = find_handle(&core, &key)?;
    let mut guard = lock_handle(&handle);
    core.network.remove_container(&mut guard, &scope)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/handles/:key/network/bind` — reserve addresses and install
/// names for every endpoint on the handle. Called before the commit that
/// powers the container on.
pub async fn bind(
    State(core): CoreState,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = find_handle(&core, &key)?;
    let mut guard = lock_handle(&handle);
    let endpoints = core.network.bind_container(&mut guard)?;
    Ok(Json(endpoints))
}

/// `POST /v1/handles/:key/network/unbind` — release addresses and names.
pub async fn unbind(
    State(core): CoreState,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = find_handle(&core, &key)?;
    let mut guard = lock_handle(&handle);
    let endpoints = core.network.unbind_container(&mut guard)?;
    Ok(Json(endpoints))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::create_router;
    use crate::routes::testing::{request, test_core};
    use std::sync::Arc;

    #[tokio::test]
    async fn create_scope_returns_carved_subnet() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (status, body) = request(
            app,
            "POST",
            "/v1/scopes",
            Some(serde_json::json!({"name": "apps", "type": "bridge"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], "apps");
        assert_eq!(body["subnet"], "172.17.0.0/16");
        assert_eq!(body["gateway"], "172.17.0.1");
        core.shutdown();
    }

    #[tokio::test]
    async fn duplicate_scope_name_conflicts() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let body = serde_json::json!({"name": "apps", "type": "bridge"});
        request(app.clone(), "POST", "/v1/scopes", Some(body.clone())).await;
        let (status, resp) = request(app, "POST", "/v1/scopes", Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(resp["code"], "Duplicate");
        core.shutdown();
    }

    #[tokio::test]
    async fn list_includes_the_builtin_bridge() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (status, body) = request(app, "GET", "/v1/scopes", None).await;
        assert_eq!(status, StatusCode::OK);
        let scopes = body.as_array().cloned().unwrap_or_default();
        assert!(
            scopes.iter().any(|s| s["name"] == "bridge" && s["builtin"] == true),
            "builtin bridge missing from {scopes:?}"
        );
        core.shutdown();
    }

    #[tokio::test]
    async fn builtin_scope_delete_is_rejected() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (status, body) = request(app, "DELETE", "/v1/scopes/bridge", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "InvalidArgument");
        core.shutdown();
    }

    #[tokio::test]
    async fn attach_bind_assigns_an_address() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (_, created) = request(
            app.clone(),
            "POST",
            "/v1/containers",
            Some(serde_json::json!({"name": "web", "path": "/bin/server"})),
        )
        .await;
        let handle = created["handle"].as_str().unwrap_or_default().to_owned();

        let (status, _) = request(
            app.clone(),
            "POST",
            &format!("/v1/handles/{handle}/network"),
            Some(serde_json::json!({"scope": "bridge", "ports": ["8080/tcp"]})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, endpoints) = request(
            app,
            "POST",
            &format!("/v1/handles/{handle}/network/bind"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let endpoints = endpoints.as_array().cloned().unwrap_or_default();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0]["scope"], "bridge");
        assert_eq!(endpoints[0]["ip"], "172.16.0.2", "gateway holds .1");
        assert_eq!(endpoints[0]["is_default"], true);
        core.shutdown();
    }

    #[tokio::test]
    async fn create_via_body_networks_attaches_endpoint() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (status, created) = request(
            app,
            "POST",
            "/v1/containers",
            Some(serde_json::json!({
                "name": "web",
                "path": "/bin/server",
                "networks": [{"scope": "bridge", "aliases": ["www"]}],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let handle = created["handle"].as_str().unwrap_or_default().to_owned();
        let stored = core
            .committer
            .handle(&berth_core::HandleKey::from(handle))
            .expect("handle live");
        let guard = crate::routes::lock_handle(&stored);
        assert!(guard.exec_config.networks.contains_key("bridge"));
        core.shutdown();
    }

    #[tokio::test]
    async fn bad_pool_spec_is_rejected() {
        let core = test_core().await;
        let app = create_router(Arc::clone(&core));
        let (status, body) = request(
            app,
            "POST",
            "/v1/scopes",
            Some(serde_json::json!({
                "name": "ext",
                "type": "external",
                "subnet": "10.10.0.0/24",
                "gateway": "10.10.0.1",
                "pools": ["not-a-pool"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "InvalidArgument");
        core.shutdown();
    }
}
