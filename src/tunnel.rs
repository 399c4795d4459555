//! Tunnel orchestrator: owns the single logical connection to a relay.
//!
//! Connecting is lazy. The first caller starts an attempt and publishes it
//! as a shared future; everyone else arriving before it settles awaits the
//! same attempt. A transport failure on the live link drops it, and the
//! next request reconnects. Nothing is retried or replayed here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{ConnectError, TransportError};
use crate::exchange::{ProxyRequest, ProxyResponse};
use crate::mirror::MirrorSet;
use crate::shaping;
use crate::transport::{ConnectOptions, SecureTransport, TunnelLink};
use crate::wire::HANDSHAKE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Resolving,
    Connecting,
    Handshaking,
    Connected,
    Failed,
}

type Attempt = Shared<BoxFuture<'static, Result<Arc<dyn TunnelLink>, ConnectError>>>;

#[derive(Default)]
struct LinkSlot {
    live: Option<(u64, Arc<dyn TunnelLink>)>,
    pending: Option<(u64, Attempt)>,
}

struct Inner {
    mirrors: MirrorSet,
    candidates: Vec<Arc<dyn SecureTransport>>,
    options: ConnectOptions,
    state: watch::Sender<ConnectionState>,
    slot: Mutex<LinkSlot>,
    generation: AtomicU64,
    handshakes: AtomicU64,
}

#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

impl Tunnel {
    pub fn new(
        mirrors: MirrorSet,
        candidates: Vec<Arc<dyn SecureTransport>>,
        options: ConnectOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                mirrors,
                candidates,
                options,
                state,
                slot: Mutex::new(LinkSlot::default()),
                generation: AtomicU64::new(0),
                handshakes: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Handshakes sent since construction.
    pub fn handshake_count(&self) -> u64 {
        self.inner.handshakes.load(Ordering::SeqCst)
    }

    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.link().await.map(|_| ())
    }

    async fn link(&self) -> Result<(u64, Arc<dyn TunnelLink>), ConnectError> {
        let (gen, attempt) = {
            let mut slot = self.inner.slot();
            if let Some((gen, link)) = &slot.live {
                return Ok((*gen, link.clone()));
            }
            let existing = slot.pending.as_ref().map(|(g, a)| (*g, a.clone()));
            match existing {
                Some(pending) => pending,
                None => {
                    let gen = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let attempt = Inner::attempt(self.inner.clone(), gen).boxed().shared();
                    slot.pending = Some((gen, attempt.clone()));
                    (gen, attempt)
                }
            }
        };
        attempt.await.map(|link| (gen, link))
    }

    pub async fn send_request(&self, req: ProxyRequest) -> Result<ProxyResponse, TransportError> {
        let (gen, link) = self.link().await?;
        match link.fetch(req).await {
            Ok(resp) => Ok(resp),
            Err(err) => {
                self.inner.reset(gen, &err);
                Err(err)
            }
        }
    }

    /// Send `payload` as a padded frame after a small random delay. Needs a
    /// live link; does not connect.
    pub async fn send_shaped(&self, payload: &[u8]) -> Result<(), TransportError> {
        let (gen, link) = self
            .inner
            .slot()
            .live
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let (frame, delay) = {
            let mut rng = rand::thread_rng();
            (shaping::frame(payload, &mut rng), shaping::jitter(&mut rng))
        };
        tokio::time::sleep(delay).await;
        if let Err(err) = link.send(frame).await {
            self.inner.reset(gen, &err);
            return Err(err);
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        let mut slot = self.inner.slot();
        if slot.live.take().is_some() {
            self.inner.set_state(ConnectionState::Disconnected);
        }
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, LinkSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn attempt(self: Arc<Self>, gen: u64) -> Result<Arc<dyn TunnelLink>, ConnectError> {
        let result = self.establish().await;
        let mut slot = self.slot();
        if slot.pending.as_ref().map(|(g, _)| *g) == Some(gen) {
            slot.pending = None;
        }
        match &result {
            Ok(link) => {
                slot.live = Some((gen, link.clone()));
                self.set_state(ConnectionState::Connected);
            }
            Err(err) => {
                self.set_state(ConnectionState::Failed);
                crate::logging::error(format!("tunnel connect failed: {err}"));
            }
        }
        result
    }

    async fn establish(&self) -> Result<Arc<dyn TunnelLink>, ConnectError> {
        self.set_state(ConnectionState::Resolving);
        let endpoint = self.mirrors.resolve()?.clone();
        if self.candidates.is_empty() {
            return Err(ConnectError::NoCandidates);
        }

        let mut failures = Vec::new();
        for candidate in &self.candidates {
            self.set_state(ConnectionState::Connecting);
            let link = match tokio::time::timeout(
                self.options.connect_timeout,
                candidate.connect(&endpoint, &self.options),
            )
            .await
            {
                Ok(Ok(link)) => link,
                Ok(Err(err)) => {
                    failures.push(format!("{}: {err}", candidate.name()));
                    continue;
                }
                Err(_) => {
                    failures.push(format!("{}: connect timed out", candidate.name()));
                    continue;
                }
            };

            self.set_state(ConnectionState::Handshaking);
            self.handshakes.fetch_add(1, Ordering::SeqCst);
            match tokio::time::timeout(self.options.connect_timeout, link.send(HANDSHAKE.to_vec()))
                .await
            {
                Ok(Ok(())) => {
                    crate::logging::info_kv(
                        "tunnel connected",
                        &[("candidate", candidate.name()), ("endpoint", endpoint.as_str())],
                    );
                    return Ok(link);
                }
                Ok(Err(err)) => failures.push(format!("{}: handshake: {err}", candidate.name())),
                Err(_) => failures.push(format!("{}: handshake timed out", candidate.name())),
            }
        }
        for f in &failures {
            crate::logging::warn_kv("tunnel candidate failed", &[("detail", f)]);
        }
        Err(ConnectError::Exhausted(failures))
    }

    fn reset(&self, gen: u64, err: &TransportError) {
        let mut slot = self.slot();
        if slot.live.as_ref().map(|(g, _)| *g) == Some(gen) {
            slot.live = None;
            self.set_state(ConnectionState::Disconnected);
            crate::logging::warn(format!("tunnel link dropped: {err}"));
        }
    }
}
