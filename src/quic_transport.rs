//! QUIC link to a relay (quinn + rustls, TLS 1.3 only).
//!
//! Each request uses its own bidirectional stream: the request envelope is
//! written and the send side finished, then the whole response envelope is
//! read. Raw sends use unidirectional streams.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rustls::pki_types::CertificateDer;
use url::Url;

use crate::error::TransportError;
use crate::exchange::{ProxyRequest, ProxyResponse};
use crate::transport::{ConnectOptions, SecureTransport, TunnelLink};
use crate::wire::{self, Decoded, WireRequest, TUNNEL_MAX_MESSAGE_BYTES};

pub const ALPN: &[u8] = b"ign-tunnel";

fn io_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Io(e.to_string())
}

pub struct QuicTransport {
    ca_cert: PathBuf,
}

impl QuicTransport {
    pub fn new(ca_cert: PathBuf) -> Self {
        Self { ca_cert }
    }

    fn client_config(&self) -> Result<quinn::ClientConfig, TransportError> {
        let der = std::fs::read(&self.ca_cert)
            .map_err(|e| io_err(format!("read {}: {e}", self.ca_cert.display())))?;
        let mut roots = rustls::RootCertStore::empty();
        roots.add(CertificateDer::from(der)).map_err(io_err)?;

        let mut crypto = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(io_err)?
        .with_root_certificates(roots)
        .with_no_client_auth();
        crypto.alpn_protocols = vec![ALPN.to_vec()];

        let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto).map_err(io_err)?;
        Ok(quinn::ClientConfig::new(Arc::new(quic)))
    }
}

impl SecureTransport for QuicTransport {
    fn name(&self) -> &'static str {
        "quic"
    }

    fn connect<'a>(
        &'a self,
        endpoint: &'a Url,
        options: &'a ConnectOptions,
    ) -> BoxFuture<'a, Result<Arc<dyn TunnelLink>, TransportError>> {
        async move {
            let host = endpoint
                .host_str()
                .ok_or_else(|| io_err(format!("mirror has no host: {endpoint}")))?;
            let addr = tokio::net::lookup_host((host, options.quic_port))
                .await
                .map_err(io_err)?
                .next()
                .ok_or_else(|| io_err(format!("{host} did not resolve")))?;

            let config = self.client_config()?;
            let local: SocketAddr = if addr.is_ipv6() {
                SocketAddr::from(([0u16; 8], 0))
            } else {
                SocketAddr::from(([0u8; 4], 0))
            };
            let quic_endpoint = quinn::Endpoint::client(local).map_err(io_err)?;
            let connecting = quic_endpoint
                .connect_with(config, addr, host)
                .map_err(io_err)?;
            let conn = tokio::time::timeout(options.connect_timeout, connecting)
                .await
                .map_err(|_| TransportError::Timeout(options.connect_timeout))?
                .map_err(io_err)?;
            crate::logging::debug_kv("quic connected", &[("remote", &addr.to_string())]);

            Ok(Arc::new(QuicLink {
                _endpoint: quic_endpoint,
                conn,
                request_timeout: options.request_timeout,
            }) as Arc<dyn TunnelLink>)
        }
        .boxed()
    }
}

pub struct QuicLink {
    // Kept alive for as long as the connection is in use.
    _endpoint: quinn::Endpoint,
    conn: quinn::Connection,
    request_timeout: Duration,
}

impl QuicLink {
    async fn round_trip(&self, req: ProxyRequest) -> Result<ProxyResponse, TransportError> {
        let frame = wire::encode_request(&WireRequest::from_request("quic", &req))?;
        let (mut send, mut recv) = self.conn.open_bi().await.map_err(io_err)?;
        send.write_all(&frame).await.map_err(io_err)?;
        send.finish().map_err(io_err)?;
        let raw = recv
            .read_to_end(TUNNEL_MAX_MESSAGE_BYTES)
            .await
            .map_err(io_err)?;
        match wire::decode(&raw)? {
            Decoded::Response(resp) => resp.into_response(),
            Decoded::Request(_) => Err(TransportError::Frame(
                "relay answered with a request frame".into(),
            )),
        }
    }
}

impl TunnelLink for QuicLink {
    fn send(&self, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            let mut send = self.conn.open_uni().await.map_err(io_err)?;
            send.write_all(&bytes).await.map_err(io_err)?;
            send.finish().map_err(io_err)?;
            Ok(())
        }
        .boxed()
    }

    fn fetch(&self, req: ProxyRequest) -> BoxFuture<'_, Result<ProxyResponse, TransportError>> {
        async move {
            tokio::time::timeout(self.request_timeout, self.round_trip(req))
                .await
                .map_err(|_| TransportError::Timeout(self.request_timeout))?
        }
        .boxed()
    }
}

impl Drop for QuicLink {
    fn drop(&mut self) {
        self.conn.close(0u32.into(), b"bye");
    }
}
