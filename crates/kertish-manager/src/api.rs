//! Header-driven HTTP surface.
//!
//! `/client/manager` carries the admin actions and `/client/node` the calls
//! made by data nodes. `X-Action` picks the operation; parameters travel in
//! `X-Options` (comma separated, `key=value` where pairs are needed),
//! `X-Reservation-Id` and `X-Size`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, Result};
use crate::manager::{Manager, RepairStatus};
use crate::replication::NodeEvent;
use crate::security::{bearer_token, security_headers, token_matches, AuthThrottle};
use crate::types::{ChunkHash, ClusterId, ClusterState, MapType, RepairType};

pub const X_ACTION: &str = "x-action";
pub const X_OPTIONS: &str = "x-options";
pub const X_RESERVATION_ID: &str = "x-reservation-id";
pub const X_SIZE: &str = "x-size";

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

fn status_for(err: &ManagerError) -> StatusCode {
    match err {
        ManagerError::ClusterNotFound(_)
        | ManagerError::NodeNotFound(_)
        | ManagerError::ChunkNotFound(_)
        | ManagerError::ReservationNotFound(_) => StatusCode::NOT_FOUND,
        ManagerError::Exists(_) | ManagerError::Registered { .. } | ManagerError::LastNode(_) => {
            StatusCode::CONFLICT
        }
        ManagerError::Frozen(_) | ManagerError::Processing => StatusCode::LOCKED,
        ManagerError::NoDiskSpace { .. } => StatusCode::INSUFFICIENT_STORAGE,
        ManagerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        e if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn accepted(operation: u64) -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "operation": operation }))).into_response()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn options(headers: &HeaderMap) -> Vec<String> {
    header_value(headers, X_OPTIONS)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn pairs(headers: &HeaderMap) -> Result<Vec<(String, String)>> {
    options(headers)
        .into_iter()
        .map(|item| match item.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() && !v.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => Err(ManagerError::InvalidRequest(format!(
                "expected key=value option, got {item:?}"
            ))),
        })
        .collect()
}

fn single(headers: &HeaderMap, what: &str) -> Result<String> {
    let mut opts = options(headers);
    if opts.len() != 1 {
        return Err(ManagerError::InvalidRequest(format!("expected one {what}")));
    }
    Ok(opts.remove(0))
}

fn required(headers: &HeaderMap, name: &str) -> Result<String> {
    header_value(headers, name)
        .ok_or_else(|| ManagerError::InvalidRequest(format!("missing {name} header")))
}

fn parse_num<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| ManagerError::InvalidRequest(format!("invalid {what} {raw:?}")))
}

/// Splits `[map type,] hash...` options. The map type defaults to read.
fn lookup_options(headers: &HeaderMap) -> Result<(MapType, Vec<ChunkHash>)> {
    let mut opts = options(headers);
    let map_type = match opts.first().map(|o| o.parse::<MapType>()) {
        Some(Ok(t)) => {
            opts.remove(0);
            t
        }
        _ => MapType::Read,
    };
    let hashes = opts
        .iter()
        .map(|h| h.parse::<ChunkHash>())
        .collect::<Result<Vec<_>>>()?;
    Ok((map_type, hashes))
}

fn repair_headers(status: &RepairStatus) -> Vec<(HeaderName, HeaderValue)> {
    let mut out = vec![(
        HeaderName::from_static("x-repair-processing"),
        HeaderValue::from_static(if status.running { "true" } else { "false" }),
    )];
    if let Some(kind) = status.detail.repair_type {
        let kind = format!("{kind:?}").to_lowercase();
        if let Ok(v) = HeaderValue::from_str(&kind) {
            out.push((HeaderName::from_static("x-repair-type"), v));
        }
    }
    if let Some(ts) = status.detail.timestamp {
        if let Ok(v) = HeaderValue::from_str(&ts.to_rfc3339()) {
            out.push((HeaderName::from_static("x-repair-timestamp"), v));
        }
    }
    if let Some(err) = &status.detail.error {
        if let Ok(v) = HeaderValue::from_str(err) {
            out.push((HeaderName::from_static("x-repair-error"), v));
        }
    }
    out
}

pub struct ManagerApi {
    manager: Arc<Manager>,
    throttle: AuthThrottle,
}

impl ManagerApi {
    pub fn new(manager: Arc<Manager>) -> Self {
        if manager.config().admin_token.is_none() {
            warn!("admin API has no admin_token configured, requests are not authenticated");
        }
        Self {
            manager,
            throttle: AuthThrottle::new(),
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        let admin = Router::new()
            .route("/client/manager", post(manager_handler).get(manager_handler))
            .layer(middleware::from_fn_with_state(self.clone(), auth_middleware));

        let open = Router::new()
            .route("/client/node", post(node_handler).get(node_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/metrics", get(metrics_handler));

        admin
            .merge(open)
            .layer(middleware::from_fn(security_headers))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    pub async fn serve(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = self.manager.config().bind_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "manager API listening");
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }

    async fn manager_action(&self, action: &str, headers: &HeaderMap) -> Result<Response> {
        let m = &self.manager;
        match action {
            "register-cluster" => {
                let addresses = options(headers);
                Ok(Json(m.register_cluster(&addresses).await?).into_response())
            }
            "register-node" => {
                let mut nodes = Vec::new();
                for (cluster_id, address) in pairs(headers)? {
                    nodes.push(m.register_node(&cluster_id, &address).await?);
                }
                Ok(Json(nodes).into_response())
            }
            "unregister-cluster" => {
                m.unregister_cluster(&single(headers, "cluster id")?).await?;
                Ok(StatusCode::OK.into_response())
            }
            "unregister-node" => {
                m.unregister_node(&single(headers, "node id")?).await?;
                Ok(StatusCode::OK.into_response())
            }
            "freeze" => {
                m.freeze(&options(headers)).await?;
                Ok(StatusCode::OK.into_response())
            }
            "unfreeze" => {
                m.unfreeze(&options(headers)).await?;
                Ok(StatusCode::OK.into_response())
            }
            "state" => {
                for (cluster_id, state) in pairs(headers)? {
                    let state: ClusterState = state.parse()?;
                    m.change_state(&cluster_id, state).await?;
                }
                Ok(StatusCode::OK.into_response())
            }
            "find" => {
                let (map_type, hashes) = lookup_options(headers)?;
                let [hash] = hashes.as_slice() else {
                    return Err(ManagerError::InvalidRequest("expected one chunk hash".into()));
                };
                Ok(Json(m.find(hash, map_type)?).into_response())
            }
            "map" => {
                let (map_type, hashes) = lookup_options(headers)?;
                Ok(Json(m.placement_map(&hashes, map_type)?).into_response())
            }
            "reserve" => {
                let size = parse_num::<u64>(&required(headers, X_SIZE)?, "size")?;
                Ok(Json(m.reserve(size).await?).into_response())
            }
            "commit" => {
                let id = required(headers, X_RESERVATION_ID)?;
                let mut written: HashMap<ClusterId, u64> = HashMap::new();
                for (cluster_id, bytes) in pairs(headers)? {
                    *written.entry(cluster_id).or_default() += parse_num::<u64>(&bytes, "size")?;
                }
                m.commit(&id, &written).await?;
                Ok(StatusCode::OK.into_response())
            }
            "discard" => {
                m.discard(&required(headers, X_RESERVATION_ID)?).await?;
                Ok(StatusCode::OK.into_response())
            }
            "sync" => {
                let opts = options(headers);
                let force = opts.iter().any(|o| o == "force");
                let cluster_id = opts.iter().find(|o| *o != "force");
                Ok(accepted(m.sync(cluster_id.map(String::as_str), force)?))
            }
            "repair" => {
                let repair_type = match options(headers).first() {
                    Some(kind) => kind.parse()?,
                    None => RepairType::Full,
                };
                Ok(accepted(m.repair(repair_type).await?))
            }
            "move" => match options(headers).as_slice() {
                [source, target] => Ok(accepted(m.move_cluster(source, target)?)),
                _ => Err(ManagerError::InvalidRequest(
                    "expected source and target cluster".into(),
                )),
            },
            "balance" => Ok(accepted(m.balance(&options(headers))?)),
            "clusters" => {
                let clusters = match options(headers).first() {
                    Some(id) => vec![m.cluster(id)?],
                    None => m.clusters()?,
                };
                let status = m.repair_status().await?;
                let mut response = Json(clusters).into_response();
                response.headers_mut().extend(repair_headers(&status));
                Ok(response)
            }
            "snapshot-create" => {
                let cluster_id = single(headers, "cluster id")?;
                let taken = m.snapshot_create(&cluster_id).await?;
                Ok(Json(json!({ "cluster_id": cluster_id, "snapshot": taken })).into_response())
            }
            "snapshot-delete" | "snapshot-restore" => {
                let pair: [String; 2] = options(headers).try_into().map_err(|_| {
                    ManagerError::InvalidRequest("expected cluster id and snapshot index".into())
                })?;
                let [cluster_id, index] = pair;
                let index = parse_num::<u64>(&index, "snapshot index")?;
                if action == "snapshot-delete" {
                    m.snapshot_delete(&cluster_id, index).await?;
                } else {
                    m.snapshot_restore(&cluster_id, index).await?;
                }
                Ok(StatusCode::OK.into_response())
            }
            "operations" => Ok(Json(m.operations()).into_response()),
            other => Err(ManagerError::InvalidRequest(format!("unknown action {other:?}"))),
        }
    }

    async fn node_action(&self, action: &str, headers: &HeaderMap, body: &[u8]) -> Result<Response> {
        match action {
            "handshake" => {
                let address = single(headers, "node address")?;
                Ok(Json(self.manager.handshake(&address)?).into_response())
            }
            "notify" => {
                let events: Vec<NodeEvent> = serde_json::from_slice(body)
                    .map_err(|e| ManagerError::InvalidRequest(format!("bad notification: {e}")))?;
                debug!(events = events.len(), "node notification");
                self.manager.notify(events).await?;
                Ok(StatusCode::ACCEPTED.into_response())
            }
            other => Err(ManagerError::InvalidRequest(format!("unknown action {other:?}"))),
        }
    }
}

fn respond(action: &str, outcome: Result<Response>) -> Response {
    match outcome {
        Ok(response) => response,
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                warn!(action, error = %e, "request failed");
            } else {
                debug!(action, error = %e, "request rejected");
            }
            e.into_response()
        }
    }
}

async fn manager_handler(State(api): State<Arc<ManagerApi>>, headers: HeaderMap) -> Response {
    let action = header_value(&headers, X_ACTION).unwrap_or_default();
    let outcome = api.manager_action(&action, &headers).await;
    respond(&action, outcome)
}

async fn node_handler(
    State(api): State<Arc<ManagerApi>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let action = header_value(&headers, X_ACTION).unwrap_or_default();
    let outcome = api.node_action(&action, &headers, &body).await;
    respond(&action, outcome)
}

async fn health_handler(State(api): State<Arc<ManagerApi>>) -> Response {
    match api.manager.health() {
        Ok(clusters) => {
            Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION"), "clusters": clusters }))
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn ready_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(api): State<Arc<ManagerApi>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        api.manager.metrics().render_prometheus(),
    )
        .into_response()
}

async fn auth_middleware(
    State(api): State<Arc<ManagerApi>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = api.manager.config().admin_token.as_deref() else {
        return next.run(request).await;
    };
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| peer.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if api.throttle.is_locked_out(&client) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    if presented.is_some_and(|token| token_matches(token, expected)) {
        return next.run(request).await;
    }

    if api.throttle.strike(&client) {
        warn!(client = %client, "admin client locked out after repeated auth failures");
    }
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, r#"Bearer realm="kertish-manager""#)],
        "Unauthorized",
    )
        .into_response()
}
