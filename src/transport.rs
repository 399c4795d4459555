//! Seams between the tunnel orchestrator and concrete secure transports.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use url::Url;

use crate::config::Config;
use crate::error::TransportError;
use crate::exchange::{ProxyRequest, ProxyResponse};

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub quic_port: u16,
}

impl ConnectOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            user_agent: cfg.user_agent.clone(),
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
            quic_port: cfg.quic_port,
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            user_agent: crate::config::DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            quic_port: 443,
        }
    }
}

/// An established connection to a relay.
pub trait TunnelLink: Send + Sync {
    /// Push raw bytes to the relay (handshake, shaped frames).
    fn send(&self, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Forward one request and wait for its response.
    fn fetch(&self, req: ProxyRequest) -> BoxFuture<'_, Result<ProxyResponse, TransportError>>;
}

/// A way of reaching a relay endpoint. The orchestrator tries these in order.
pub trait SecureTransport: Send + Sync {
    fn name(&self) -> &'static str;

    fn connect<'a>(
        &'a self,
        endpoint: &'a Url,
        options: &'a ConnectOptions,
    ) -> BoxFuture<'a, Result<Arc<dyn TunnelLink>, TransportError>>;
}

/// Candidates in priority order: QUIC first when enabled and a CA is
/// configured, then WebSocket.
pub fn candidates_for(cfg: &Config) -> Vec<Arc<dyn SecureTransport>> {
    let mut out: Vec<Arc<dyn SecureTransport>> = Vec::new();
    if cfg.experimental_quic {
        match &cfg.quic_ca_cert {
            Some(ca) => out.push(Arc::new(crate::quic_transport::QuicTransport::new(
                ca.clone(),
            ))),
            None => {
                crate::logging::warn("experimental_quic set without quic_ca_cert; QUIC skipped")
            }
        }
    }
    out.push(Arc::new(crate::ws_transport::WebSocketTransport));
    out
}
