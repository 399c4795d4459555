#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use ignition_hub::bus::Bus;
use ignition_hub::control::ServedHub;
use ignition_hub::direct::DirectClient;
use ignition_hub::error::{HookError, TransportError};
use ignition_hub::exchange::{ProxyRequest, ProxyResponse};
use ignition_hub::hooks::{Hook, HookChain, HostBlocklist};
use ignition_hub::hub::{Hub, HubConfig, HubDeps};
use ignition_hub::jar::{DomainMatch, SessionStore};
use ignition_hub::mirror::MirrorSet;
use ignition_hub::omnibox::SearchEngine;
use ignition_hub::seal::{Plaintext, Sealer};
use ignition_hub::transform::Transformer;
use ignition_hub::transport::{ConnectOptions, SecureTransport, TunnelLink};
use ignition_hub::tunnel::Tunnel;
use ignition_hub::vault::Vault;
use url::Url;

pub const PREFIX: &str = "/ign-proxy/";

pub type RequestHook = fn(&ProxyRequest) -> Result<Option<ProxyResponse>, HookError>;
pub type ResponseHook = fn(&ProxyResponse) -> Result<Option<ProxyResponse>, HookError>;

pub fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ignition-it-{name}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

type Responder = dyn Fn(&ProxyRequest) -> ProxyResponse + Send + Sync;

/// Relay stand-in. Answers every request with `responder`, or refuses to
/// connect when there is none.
pub struct ScriptedTransport {
    responder: Option<Arc<Responder>>,
    pub connects: AtomicUsize,
    pub seen: Arc<Mutex<Vec<ProxyRequest>>>,
}

impl ScriptedTransport {
    pub fn answering<F>(f: F) -> Arc<Self>
    where
        F: Fn(&ProxyRequest) -> ProxyResponse + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Some(Arc::new(f)),
            connects: AtomicUsize::new(0),
            seen: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(Self {
            responder: None,
            connects: AtomicUsize::new(0),
            seen: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn seen(&self) -> Vec<ProxyRequest> {
        self.seen.lock().unwrap().clone()
    }
}

struct ScriptedLink {
    responder: Arc<Responder>,
    seen: Arc<Mutex<Vec<ProxyRequest>>>,
}

impl TunnelLink for ScriptedLink {
    fn send(&self, _bytes: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>> {
        async { Ok(()) }.boxed()
    }

    fn fetch(&self, req: ProxyRequest) -> BoxFuture<'_, Result<ProxyResponse, TransportError>> {
        self.seen.lock().unwrap().push(req.clone());
        let resp = (self.responder)(&req);
        async move { Ok(resp) }.boxed()
    }
}

impl SecureTransport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn connect<'a>(
        &'a self,
        _endpoint: &'a Url,
        _options: &'a ConnectOptions,
    ) -> BoxFuture<'a, Result<Arc<dyn TunnelLink>, TransportError>> {
        async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match &self.responder {
                Some(r) => Ok(Arc::new(ScriptedLink {
                    responder: r.clone(),
                    seen: self.seen.clone(),
                }) as Arc<dyn TunnelLink>),
                None => Err(TransportError::Io("connection refused".into())),
            }
        }
        .boxed()
    }
}

/// Panics on every body.
pub struct Exploding;

impl Transformer for Exploding {
    fn transform(&self, _input: &[u8]) -> Vec<u8> {
        panic!("rewriter bug")
    }
}

/// Uppercases bodies and counts invocations.
#[derive(Default)]
pub struct CountingUpper {
    pub calls: Arc<AtomicUsize>,
}

impl Transformer for CountingUpper {
    fn transform(&self, input: &[u8]) -> Vec<u8> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        input.to_ascii_uppercase()
    }
}

pub fn open_store(dir: &PathBuf, bus: Bus) -> Arc<SessionStore> {
    let sealer: Arc<dyn Sealer> = Arc::new(Plaintext);
    let vault = Vault::new(dir.join("vault"), sealer.clone());
    Arc::new(
        SessionStore::open(&dir.join("hub.db"), vault, sealer, DomainMatch::Strict, bus).unwrap(),
    )
}

pub fn hub_config() -> HubConfig {
    HubConfig {
        prefix: PREFIX.to_string(),
        search_engine: SearchEngine::Google,
        heartbeat: Duration::from_secs(5),
        workers: 2,
        shared_memory: false,
        redirect_capacity: 64,
        redirect_ttl: Duration::from_secs(60),
    }
}

pub fn build_hub(
    dir: &PathBuf,
    transport: Arc<ScriptedTransport>,
    transformer: Arc<dyn Transformer>,
    blocked: &[String],
) -> ServedHub {
    let mut pre = HookChain::new();
    if !blocked.is_empty() {
        pre.push(HostBlocklist::new(blocked).unwrap());
    }
    build_hub_with_hooks(dir, transport, transformer, pre, HookChain::new())
}

pub fn build_hub_with_hooks<P, Q>(
    dir: &PathBuf,
    transport: Arc<ScriptedTransport>,
    transformer: Arc<dyn Transformer>,
    pre: HookChain<ProxyRequest, P>,
    post: HookChain<ProxyResponse, Q>,
) -> Hub<P, Q>
where
    P: Hook<ProxyRequest>,
    Q: Hook<ProxyResponse>,
{
    let bus = Bus::new();
    let store = open_store(dir, bus.clone());
    let mirrors = MirrorSet::new(vec![Url::parse("wss://relay.test/wisp/").unwrap()]);
    let candidates = vec![transport as Arc<dyn SecureTransport>];
    let options = ConnectOptions {
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        ..ConnectOptions::default()
    };
    let tunnel = Tunnel::new(mirrors, candidates, options);
    let direct = DirectClient::new("ignition-test", Duration::from_secs(2)).unwrap();

    Hub::with_hooks(
        hub_config(),
        HubDeps {
            tunnel,
            store,
            bus,
            direct,
            transformer,
        },
        pre,
        post,
    )
}

/// Plain HTTP origin on an ephemeral port, for the direct-fetch fallback.
pub async fn spawn_origin(app: axum::Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
