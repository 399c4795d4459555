//! WebSocket-over-TLS link to a relay.
//!
//! One writer task drains an mpsc queue into the socket; one reader task
//! routes response envelopes back to the waiting request by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use reqwest::header::{HeaderValue, USER_AGENT};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::error::TransportError;
use crate::exchange::{ProxyRequest, ProxyResponse};
use crate::transport::{ConnectOptions, SecureTransport, TunnelLink};
use crate::wire::{self, Decoded, WireRequest};

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<Result<ProxyResponse, TransportError>>>>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl SecureTransport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn connect<'a>(
        &'a self,
        endpoint: &'a Url,
        options: &'a ConnectOptions,
    ) -> BoxFuture<'a, Result<Arc<dyn TunnelLink>, TransportError>> {
        async move {
            let link = WebSocketLink::open(endpoint, options).await?;
            Ok(Arc::new(link) as Arc<dyn TunnelLink>)
        }
        .boxed()
    }
}

pub struct WebSocketLink {
    tx: mpsc::Sender<Message>,
    waiters: Waiters,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WebSocketLink {
    pub async fn open(endpoint: &Url, options: &ConnectOptions) -> Result<Self, TransportError> {
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if let Ok(ua) = HeaderValue::from_str(&options.user_agent) {
            request.headers_mut().insert(USER_AGENT, ua);
        }
        let (ws_stream, _) = tokio::time::timeout(options.connect_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout(options.connect_timeout))?
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<Message>(256);
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(err) = write.send(msg).await {
                    crate::logging::warn(format!("ws send error: {err}"));
                    break;
                }
            }
            let _ = write.close().await;
        });

        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader_waiters = waiters.clone();
        let reader_closed = closed.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Binary(bin)) => route_response(&reader_waiters, &bin),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        crate::logging::warn(format!("ws read error: {err}"));
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Dropping the senders fails every in-flight request.
            if let Ok(mut w) = reader_waiters.lock() {
                w.clear();
            }
        });

        Ok(Self {
            tx,
            waiters,
            closed,
            next_id: AtomicU64::new(1),
            request_timeout: options.request_timeout,
            reader,
            writer,
        })
    }

    async fn round_trip(&self, req: ProxyRequest) -> Result<ProxyResponse, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let id = format!("ws-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let frame = wire::encode_request(&WireRequest::from_request(&id, &req))?;

        let (done_tx, done_rx) = oneshot::channel();
        if let Ok(mut w) = self.waiters.lock() {
            w.insert(id.clone(), done_tx);
        }
        if self.tx.send(Message::Binary(frame)).await.is_err() {
            self.forget(&id);
            return Err(TransportError::Closed);
        }
        match tokio::time::timeout(self.request_timeout, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.forget(&id);
                Err(TransportError::Timeout(self.request_timeout))
            }
        }
    }

    fn forget(&self, id: &str) {
        if let Ok(mut w) = self.waiters.lock() {
            w.remove(id);
        }
    }
}

impl TunnelLink for WebSocketLink {
    fn send(&self, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.tx
                .send(Message::Binary(bytes))
                .await
                .map_err(|_| TransportError::Closed)
        }
        .boxed()
    }

    fn fetch(&self, req: ProxyRequest) -> BoxFuture<'_, Result<ProxyResponse, TransportError>> {
        self.round_trip(req).boxed()
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn route_response(waiters: &Waiters, raw: &[u8]) {
    let resp = match wire::decode(raw) {
        Ok(Decoded::Response(resp)) => resp,
        Ok(Decoded::Request(_)) => {
            crate::logging::debug("ignoring request frame from relay");
            return;
        }
        Err(err) => {
            crate::logging::debug(format!("ignoring unreadable relay frame: {err}"));
            return;
        }
    };
    let waiter = waiters.lock().ok().and_then(|mut w| w.remove(&resp.id));
    if let Some(waiter) = waiter {
        let _ = waiter.send(resp.into_response());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{encode_response, WireResponse, HANDSHAKE};
    use reqwest::StatusCode;
    use tokio::net::TcpListener;

    /// Minimal relay: checks the handshake, then answers every request with
    /// its own URL as the body.
    async fn spawn_echo_relay() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            assert_eq!(first.into_data(), HANDSHAKE.to_vec());
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Binary(bin) = msg else { continue };
                let Ok(Decoded::Request(req)) = wire::decode(&bin) else {
                    continue;
                };
                let resp = WireResponse {
                    id: req.id,
                    status: 200,
                    status_text: None,
                    headers: vec![("content-type".into(), "text/plain".into())],
                    body: req.url.into_bytes(),
                };
                let frame = encode_response(&resp).unwrap();
                if ws.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
        });
        Url::parse(&format!("ws://{addr}/wisp/")).unwrap()
    }

    #[tokio::test]
    async fn fetch_round_trips_through_relay() {
        let endpoint = spawn_echo_relay().await;
        let link = WebSocketTransport
            .connect(&endpoint, &ConnectOptions::default())
            .await
            .unwrap();
        link.send(HANDSHAKE.to_vec()).await.unwrap();

        let url = Url::parse("https://service.test/a").unwrap();
        let resp = link.fetch(ProxyRequest::get(url)).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, b"https://service.test/a");
    }

    #[tokio::test]
    async fn unreachable_relay_is_an_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let endpoint = Url::parse(&format!("ws://{addr}/")).unwrap();
        let err = WebSocketTransport
            .connect(&endpoint, &ConnectOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
