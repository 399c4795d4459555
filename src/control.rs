use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::StoreError;
use crate::exchange::ProxyResponse;
use crate::hooks::{HostBlocklist, NoHook};
use crate::hub::{Hub, Inbound};
use crate::jar::SessionSnapshot;
use crate::telemetry::HubStatsSnapshot;
use crate::tunnel::ConnectionState;

/// The hub as the daemon serves it: host blocklist in front, no post-hooks.
pub type ServedHub = Hub<HostBlocklist, NoHook>;

/// Response headers that describe the tunnel hop, not the page.
const RESPONSE_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
];

#[derive(Clone, Debug)]
pub struct ControlPlane {
    bound_addr: SocketAddr,
    token: String,
}

/// Result of starting the control plane, including the actual bound address.
#[derive(Debug, Clone)]
pub struct ControlPlaneStartResult {
    pub control_plane: ControlPlane,
    pub bound_addr: SocketAddr,
}

pub struct ControlState {
    token: String,
    hub: Arc<ServedHub>,
    static_dir: Option<PathBuf>,
}

impl std::fmt::Debug for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlState")
            .field("token", &"[redacted]")
            .field("static_dir", &self.static_dir)
            .finish()
    }
}

impl ControlState {
    pub fn new(token: String, hub: Arc<ServedHub>, static_dir: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            token,
            hub,
            static_dir,
        })
    }
}

/// `/v1/status` is public; the rest of `/v1/*` needs the bearer token.
/// Everything else goes to the hub, then to static assets.
pub fn router(state: Arc<ControlState>) -> Router {
    let authenticated_routes = Router::new()
        .route("/v1/slot", post(switch_slot))
        .route("/v1/snapshot", get(export_snapshot).post(import_snapshot))
        .route("/v1/cookies", get(list_cookies))
        .with_state(state.clone())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/v1/status", get(status))
        .fallback(proxy_or_static)
        .with_state(state)
        .merge(authenticated_routes)
}

impl ControlPlane {
    /// Bind `addr` (falling back to an OS-assigned port on the same IP if it
    /// is taken) and serve until `shutdown` fires.
    pub async fn start_async(
        addr: &str,
        token: Option<String>,
        hub: Arc<ServedHub>,
        static_dir: Option<PathBuf>,
        shutdown: Option<Arc<Notify>>,
    ) -> anyhow::Result<ControlPlaneStartResult> {
        let token = token.unwrap_or_else(|| Uuid::new_v4().as_simple().to_string());

        crate::logging::info_kv(
            "control plane starting",
            &[("requested_addr", addr), ("token", token.as_str())],
        );

        let requested_addr: SocketAddr = match addr.parse() {
            Ok(a) => a,
            Err(e) => {
                crate::logging::error(format!(
                    "control plane failed to parse address '{addr}': {e}"
                ));
                return Err(anyhow::anyhow!(
                    "Invalid address '{}': {} (use numeric IP, not hostname like 'localhost')",
                    addr,
                    e
                ));
            }
        };

        let (listener, bound_addr) = match tokio::net::TcpListener::bind(requested_addr).await {
            Ok(listener) => {
                let bound = listener.local_addr()?;
                (listener, bound)
            }
            Err(e) => {
                crate::logging::info_kv(
                    "requested port unavailable, trying fallback",
                    &[
                        ("requested_addr", &requested_addr.to_string()),
                        ("error", &e.to_string()),
                    ],
                );
                let fallback_addr = SocketAddr::new(requested_addr.ip(), 0);
                match tokio::net::TcpListener::bind(fallback_addr).await {
                    Ok(listener) => {
                        let bound = listener.local_addr()?;
                        (listener, bound)
                    }
                    Err(fallback_err) => {
                        return Err(anyhow::anyhow!(
                            "Failed to bind: requested {} failed ({}), fallback to port 0 also failed ({})",
                            requested_addr,
                            e,
                            fallback_err
                        ));
                    }
                }
            }
        };

        let app = router(ControlState::new(token.clone(), hub, static_dir));

        let stop = shutdown.map(Notify::notified_owned);
        tokio::spawn(async move {
            let result = match stop {
                Some(stop) => {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(stop)
                        .await
                }
                None => axum::serve(listener, app).await,
            };
            if let Err(e) = result {
                crate::logging::error(format!("control plane server error: {e}"));
            }
            crate::logging::info("control plane server stopped");
        });

        crate::logging::info_kv(
            "control plane started",
            &[("bound_addr", &bound_addr.to_string())],
        );

        Ok(ControlPlaneStartResult {
            control_plane: ControlPlane { bound_addr, token },
            bound_addr,
        })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

async fn auth_middleware(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    req: axum::http::Request<Body>,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let expected = format!("Bearer {}", state.token);
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if value.to_str().map(|v| v == expected).unwrap_or(false) {
            return next.run(req).await;
        }
    }
    (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(rename = "ts")]
    pub timestamp: String,
    pub version: String,
    pub tunnel: ConnectionState,
    pub slot: String,
    pub handshakes: u64,
    pub executors: usize,
    pub siblings: usize,
    pub hub: HubStatsSnapshot,
}

async fn status(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let hub = &state.hub;
    Json(StatusResponse {
        status: "ok".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tunnel: hub.tunnel().state(),
        slot: hub.store().current_slot(),
        handshakes: hub.tunnel().handshake_count(),
        executors: hub.scheduler().size(),
        siblings: hub.liveness().known(),
        hub: hub.stats().snapshot(),
    })
}

fn store_error(err: StoreError) -> Response {
    let code = match err {
        StoreError::InvalidSlot(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

#[derive(Deserialize)]
struct SlotBody {
    #[serde(rename = "slotId")]
    slot_id: String,
}

async fn switch_slot(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<SlotBody>,
) -> Response {
    let slot_id = body.slot_id.clone();
    match state.hub.store().blocking(move |s| s.switch_slot(&slot_id)).await {
        Ok(()) => Json(serde_json::json!({ "slotId": body.slot_id })).into_response(),
        Err(e) => store_error(e),
    }
}

async fn export_snapshot(State(state): State<Arc<ControlState>>) -> Response {
    match state.hub.store().blocking(|s| s.export_snapshot()).await {
        Ok(snap) => Json(snap).into_response(),
        Err(e) => store_error(e),
    }
}

async fn import_snapshot(
    State(state): State<Arc<ControlState>>,
    Json(snapshot): Json<SessionSnapshot>,
) -> Response {
    let slot_id = snapshot.slot_id.clone();
    match state.hub.store().blocking(move |s| s.import_snapshot(&snapshot)).await {
        Ok(n) => Json(serde_json::json!({ "imported": n, "slotId": slot_id })).into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Deserialize)]
struct CookieQuery {
    domain: String,
}

async fn list_cookies(
    State(state): State<Arc<ControlState>>,
    Query(q): Query<CookieQuery>,
) -> Response {
    match state.hub.store().blocking(move |s| s.get_cookies(&q.domain)).await {
        Ok(cookies) => Json(cookies).into_response(),
        Err(e) => store_error(e),
    }
}

async fn proxy_or_static(
    State(state): State<Arc<ControlState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let inbound = Inbound {
        method,
        path_and_query,
        headers,
        body: body.to_vec(),
    };
    if let Some(resp) = state.hub.handle(inbound).await {
        return into_response(resp);
    }
    match &state.static_dir {
        Some(dir) => serve_static(dir, uri.path()).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn into_response(resp: ProxyResponse) -> Response {
    let mut out = Response::new(Body::from(resp.body));
    *out.status_mut() = resp.status;
    let headers = out.headers_mut();
    for (name, value) in resp.headers.iter() {
        if RESPONSE_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    out
}

async fn serve_static(dir: &Path, path: &str) -> Response {
    let rel = path.trim_start_matches('/');
    if rel.split('/').any(|c| c == "..") {
        return StatusCode::NOT_FOUND.into_response();
    }
    let mut full = dir.join(rel);
    if rel.is_empty() || full.is_dir() {
        full = full.join("index.html");
    }
    match tokio::fs::read(&full).await {
        Ok(bytes) => {
            let mut resp = Response::new(Body::from(bytes));
            resp.headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type_for(&full)));
            resp
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
