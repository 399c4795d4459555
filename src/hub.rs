//! Dispatch hub: the per-request pipeline and its background duties.
//!
//! pre-hooks → jar cookies → tunnel → cookie capture → redirect rewrite →
//! header sanitation → body transform → post-hooks. Any failure on that path
//! falls back to a direct fetch, then to a 502.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_ENCODING, CONTENT_LENGTH, COOKIE, SET_COOKIE,
};
use reqwest::{Method, StatusCode};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use url::Url;

use crate::bus::{self, Bus, LivenessMonitor};
use crate::config::Config;
use crate::direct::DirectClient;
use crate::error::{HookError, StoreError, TransportError};
use crate::exchange::{ProxyRequest, ProxyResponse};
use crate::hooks::{Hook, HookChain, NoHook};
use crate::jar::{HealOutcome, SessionStore, SetCookie};
use crate::omnibox::{self, SearchEngine};
use crate::redirects::RedirectRewriter;
use crate::scheduler::Scheduler;
use crate::telemetry::HubStats;
use crate::transform::Transformer;
use crate::tunnel::Tunnel;

/// Edge-cache headers that would leak the relay's CDN into the page.
const STRIPPED_HEADERS: &[&str] = &[
    "x-vercel-cache",
    "x-vercel-id",
    "cf-cache-status",
    "x-cache",
    "x-cache-hits",
    "x-served-by",
];

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub prefix: String,
    pub search_engine: SearchEngine,
    pub heartbeat: Duration,
    pub workers: usize,
    pub shared_memory: bool,
    pub redirect_capacity: usize,
    pub redirect_ttl: Duration,
}

impl HubConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            prefix: cfg.proxy_prefix.clone(),
            search_engine: cfg.search_engine,
            heartbeat: Duration::from_secs(cfg.heartbeat_secs),
            workers: cfg.workers.unwrap_or_else(crate::scheduler::default_pool_size),
            shared_memory: cfg.shared_memory,
            redirect_capacity: cfg.redirect_capacity,
            redirect_ttl: Duration::from_secs(cfg.redirect_ttl_secs),
        }
    }
}

/// Collaborators the hub is built from.
pub struct HubDeps {
    pub tunnel: Tunnel,
    pub store: Arc<SessionStore>,
    pub bus: Bus,
    pub direct: DirectClient,
    pub transformer: Arc<dyn Transformer>,
}

/// A request as the host intercepted it.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub method: Method,
    pub path_and_query: String,
    pub headers: reqwest::header::HeaderMap,
    pub body: Vec<u8>,
}

impl Inbound {
    pub fn get(path_and_query: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path_and_query: path_and_query.into(),
            headers: reqwest::header::HeaderMap::new(),
            body: Vec::new(),
        }
    }

    fn path(&self) -> &str {
        self.path_and_query
            .split_once('?')
            .map_or(self.path_and_query.as_str(), |(p, _)| p)
    }
}

pub struct Hub<P = NoHook, Q = NoHook> {
    config: HubConfig,
    tunnel: Tunnel,
    redirects: RedirectRewriter,
    scheduler: Scheduler,
    store: Arc<SessionStore>,
    bus: Bus,
    direct: DirectClient,
    pre: HookChain<ProxyRequest, P>,
    post: HookChain<ProxyResponse, Q>,
    stats: Arc<HubStats>,
    liveness: LivenessMonitor,
}

impl Hub<NoHook, NoHook> {
    /// Build a hook-less hub and start its executor pool.
    pub fn install(config: HubConfig, deps: HubDeps) -> Self {
        Self::with_hooks(config, deps, HookChain::new(), HookChain::new())
    }
}

/// Background duties started by [`Hub::activate`].
pub struct HubHandle {
    shutdown: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
    pub heal: Option<HealOutcome>,
}

impl HubHandle {
    pub async fn shutdown(self) {
        self.shutdown.notify_waiters();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl<P, Q> Hub<P, Q>
where
    P: Hook<ProxyRequest>,
    Q: Hook<ProxyResponse>,
{
    pub fn with_hooks(
        config: HubConfig,
        deps: HubDeps,
        pre: HookChain<ProxyRequest, P>,
        post: HookChain<ProxyResponse, Q>,
    ) -> Self {
        let scheduler = Scheduler::start(config.workers, deps.transformer, config.shared_memory);
        let redirects = RedirectRewriter::new(
            config.prefix.clone(),
            config.redirect_capacity,
            config.redirect_ttl,
        );
        Self {
            config,
            tunnel: deps.tunnel,
            redirects,
            scheduler,
            store: deps.store,
            bus: deps.bus,
            direct: deps.direct,
            pre,
            post,
            stats: Arc::new(HubStats::default()),
            liveness: LivenessMonitor::default(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<HubStats> {
        &self.stats
    }

    pub fn redirects(&self) -> &RedirectRewriter {
        &self.redirects
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    /// Run recovery once, then follow sibling slot switches, broadcast a
    /// heartbeat and track siblings' heartbeats until the returned handle is
    /// shut down.
    pub fn activate(&self) -> HubHandle {
        let heal = match self.store.heal() {
            Ok(outcome) => {
                crate::logging::info_kv(
                    "session recovery",
                    &[("outcome", &format!("{outcome:?}"))],
                );
                Some(outcome)
            }
            Err(err) => {
                crate::logging::error(format!("session recovery failed: {err}"));
                None
            }
        };
        let shutdown = Arc::new(Notify::new());
        let follow = self.store.follow(shutdown.clone());
        let heartbeat =
            bus::spawn_heartbeat(self.bus.clone(), self.config.heartbeat, shutdown.clone());
        let watch = self.liveness.watch(&self.bus, shutdown.clone());
        HubHandle {
            shutdown,
            tasks: vec![follow, heartbeat, watch],
            heal,
        }
    }

    pub fn is_own_asset(&self, path: &str) -> bool {
        !path.starts_with(&self.config.prefix)
    }

    /// Target URL encoded after the prefix. `None` when the path is not
    /// under the prefix.
    pub fn decode_target(&self, path_and_query: &str) -> Option<Result<Url, url::ParseError>> {
        let rest = path_and_query.strip_prefix(&self.config.prefix)?;
        let raw = repair_scheme(rest);
        if let Ok(url) = Url::parse(&raw) {
            if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() {
                return Some(Ok(url));
            }
        }
        let input = urlencoding::decode(&raw)
            .map(|c| c.into_owned())
            .unwrap_or(raw);
        Some(omnibox::resolve(&input, self.config.search_engine))
    }

    /// `None` means the request is not ours and the host should serve it.
    pub async fn handle(&self, inbound: Inbound) -> Option<ProxyResponse> {
        if self.is_own_asset(inbound.path()) {
            return None;
        }
        let target = match self.decode_target(&inbound.path_and_query)? {
            Ok(url) => url,
            Err(err) => {
                return Some(ProxyResponse::with_body(
                    StatusCode::BAD_REQUEST,
                    "text/plain; charset=utf-8",
                    format!("cannot decode target: {err}"),
                ))
            }
        };
        let mut req = ProxyRequest {
            method: inbound.method,
            url: target,
            headers: inbound.headers,
            body: inbound.body,
        };
        req.strip_hop_by_hop();
        // The page's own cookies belong to the hub origin, not the target.
        req.headers.remove(COOKIE);
        Some(self.dispatch(req).await)
    }

    /// Run the pipeline for an already-decoded request. Never fails: errors
    /// degrade to a direct fetch, then to a 502.
    pub async fn dispatch(&self, req: ProxyRequest) -> ProxyResponse {
        match self.pipeline(&req).await {
            Ok(resp) => resp,
            Err(err) => {
                crate::logging::warn_kv(
                    "pipeline failed, falling back to direct fetch",
                    &[("url", req.url.as_str()), ("error", &err.to_string())],
                );
                self.stats.set_last_error(&err);
                self.fallback(&req).await
            }
        }
    }

    async fn pipeline(&self, req: &ProxyRequest) -> Result<ProxyResponse, PipelineError> {
        if let Some(resp) = self.pre.run(req)? {
            return Ok(resp);
        }

        let now = Utc::now();
        let host = req.host().unwrap_or_default().to_string();
        let mut outbound = req.clone();
        let (lookup_host, lookup_path) = (host.clone(), req.url.path().to_string());
        let cookies = self
            .store
            .blocking(move |s| s.cookie_header(&lookup_host, &lookup_path, now))
            .await?;
        if let Some(cookies) = cookies {
            if let Ok(v) = HeaderValue::from_str(&cookies) {
                outbound.headers.insert(COOKIE, v);
            }
        }
        let sent = outbound.body.len();

        let mut resp = self.tunnel.send_request(outbound).await?;

        self.capture_cookies(&mut resp, &host, now).await?;
        let mut resp = self.redirects.wrap(resp, &req.url);
        sanitize(&mut resp);

        if needs_transform(&resp) {
            match self.scheduler.submit(resp.body.clone()).await {
                Ok(body) => {
                    resp.body = body;
                    resp.headers.remove(CONTENT_LENGTH);
                    self.stats.on_transform(true);
                }
                Err(err) => {
                    self.stats.on_transform(false);
                    crate::logging::warn_kv(
                        "transform failed, serving original body",
                        &[("url", req.url.as_str()), ("error", &err.to_string())],
                    );
                }
            }
        }

        if let Some(replaced) = self.post.run(&resp)? {
            return Ok(replaced);
        }
        self.stats.on_proxied(sent, resp.body.len());
        Ok(resp)
    }

    async fn capture_cookies(
        &self,
        resp: &mut ProxyResponse,
        host: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let parsed: Vec<SetCookie> = resp
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|raw| SetCookie::parse(raw, host, now))
            .collect();
        resp.headers.remove(SET_COOKIE);
        if parsed.is_empty() {
            return Ok(());
        }
        self.store
            .blocking(move |s| {
                for c in &parsed {
                    s.set_cookie(&c.domain, &c.name, &c.value, &c.path, c.expires_at)?;
                }
                Ok(())
            })
            .await
    }

    async fn fallback(&self, req: &ProxyRequest) -> ProxyResponse {
        self.stats.on_fallback();
        match self.direct.fetch(req).await {
            Ok(resp) => resp,
            Err(err) => {
                crate::logging::error(format!("direct fetch of {} failed: {err}", req.url));
                self.stats.set_last_error(&err);
                ProxyResponse::with_body(
                    StatusCode::BAD_GATEWAY,
                    "text/plain; charset=utf-8",
                    "upstream unreachable",
                )
            }
        }
    }
}

fn repair_scheme(rest: &str) -> String {
    // Some clients collapse `//` in paths.
    for scheme in ["https:/", "http:/"] {
        if let Some(tail) = rest.strip_prefix(scheme) {
            if !tail.starts_with('/') {
                return format!("{scheme}/{tail}");
            }
        }
    }
    rest.to_string()
}

fn sanitize(resp: &mut ProxyResponse) {
    resp.headers
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    for name in STRIPPED_HEADERS {
        resp.headers.remove(*name);
    }
}

fn needs_transform(resp: &ProxyResponse) -> bool {
    let ct = resp.content_type().to_ascii_lowercase();
    if !(ct.contains("text/html") || ct.contains("javascript")) {
        return false;
    }
    match resp.header_str(CONTENT_ENCODING.as_str()) {
        None => true,
        Some(enc) => enc.trim().eq_ignore_ascii_case("identity"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_repair_only_touches_collapsed_slashes() {
        assert_eq!(repair_scheme("https:/example.com/a"), "https://example.com/a");
        assert_eq!(repair_scheme("https://example.com/a"), "https://example.com/a");
        assert_eq!(repair_scheme("example.com"), "example.com");
    }

    #[test]
    fn sanitize_sets_cors_and_strips_cache_headers() {
        let mut resp = ProxyResponse::with_body(StatusCode::OK, "text/html", "x");
        resp.headers.insert("x-vercel-cache", HeaderValue::from_static("HIT"));
        resp.headers.insert("cf-cache-status", HeaderValue::from_static("HIT"));
        resp.headers.insert("x-keep", HeaderValue::from_static("1"));
        sanitize(&mut resp);
        assert_eq!(resp.headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert!(resp.headers.get("x-vercel-cache").is_none());
        assert!(resp.headers.get("cf-cache-status").is_none());
        assert_eq!(resp.headers.get("x-keep").unwrap(), "1");
    }

    #[test]
    fn transform_gate() {
        let html = ProxyResponse::with_body(StatusCode::OK, "text/html; charset=utf-8", "x");
        assert!(needs_transform(&html));
        let js = ProxyResponse::with_body(StatusCode::OK, "application/javascript", "x");
        assert!(needs_transform(&js));
        let png = ProxyResponse::with_body(StatusCode::OK, "image/png", "x");
        assert!(!needs_transform(&png));
        let mut gz = ProxyResponse::with_body(StatusCode::OK, "text/html", "x");
        gz.headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(!needs_transform(&gz));
    }
}
