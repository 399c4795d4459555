//! Keeps 3xx responses inside the proxy's address space.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderValue, LOCATION};
use url::Url;

use crate::exchange::ProxyResponse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub original: String,
    pub proxied: String,
}

struct Entry {
    original: String,
    inserted: Instant,
}

/// Bounded, TTL-limited map from proxied location to the original target.
pub struct CorrelationTable {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<TableInner>,
}

#[derive(Default)]
struct TableInner {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
}

impl CorrelationTable {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(TableInner::default()),
        }
    }

    pub fn insert(&self, c: Correlation) {
        self.insert_at(c, Instant::now());
    }

    fn insert_at(&self, c: Correlation, now: Instant) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.evict_expired(now, self.ttl);
        if inner.entries.contains_key(&c.proxied) {
            inner.order.retain(|k| k != &c.proxied);
        }
        inner.order.push_back(c.proxied.clone());
        inner.entries.insert(
            c.proxied,
            Entry {
                original: c.original,
                inserted: now,
            },
        );
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    pub fn original_for(&self, proxied: &str) -> Option<String> {
        self.original_for_at(proxied, Instant::now())
    }

    fn original_for_at(&self, proxied: &str, now: Instant) -> Option<String> {
        let mut inner = self.inner.lock().ok()?;
        inner.evict_expired(now, self.ttl);
        inner.entries.get(proxied).map(|e| e.original.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TableInner {
    fn evict_expired(&mut self, now: Instant, ttl: Duration) {
        while let Some(front) = self.order.front() {
            let expired = self
                .entries
                .get(front)
                .map_or(true, |e| now.saturating_duration_since(e.inserted) >= ttl);
            if !expired {
                break;
            }
            if let Some(k) = self.order.pop_front() {
                self.entries.remove(&k);
            }
        }
    }
}

pub struct RedirectRewriter {
    prefix: String,
    table: CorrelationTable,
}

impl RedirectRewriter {
    pub fn new(prefix: impl Into<String>, capacity: usize, ttl: Duration) -> Self {
        Self {
            prefix: prefix.into(),
            table: CorrelationTable::new(capacity, ttl),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn table(&self) -> &CorrelationTable {
        &self.table
    }

    /// Proxied form of an absolute URL.
    pub fn encode(&self, target: &Url) -> String {
        format!("{}{}", self.prefix, target)
    }

    /// Rewrite the `Location` of a 3xx response. Anything else, including a
    /// 3xx with no usable `Location`, comes back untouched.
    pub fn wrap(&self, mut response: ProxyResponse, original_url: &Url) -> ProxyResponse {
        if !response.is_redirect() {
            return response;
        }
        let Some(location) = response.header_str(LOCATION.as_str()).map(str::to_string) else {
            return response;
        };
        if location.starts_with(&self.prefix) {
            return response;
        }
        let Ok(target) = original_url.join(&location) else {
            return response;
        };
        let proxied = self.encode(&target);
        let Ok(value) = HeaderValue::from_str(&proxied) else {
            return response;
        };
        response.headers.insert(LOCATION, value);
        self.table.insert(Correlation {
            original: target.to_string(),
            proxied,
        });
        response
    }

    pub fn original_for(&self, proxied: &str) -> Option<String> {
        self.table.original_for(proxied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    fn rewriter() -> RedirectRewriter {
        RedirectRewriter::new("/ign-proxy/", 4, Duration::from_secs(60))
    }

    fn origin() -> Url {
        Url::parse("https://service.test/start/page").unwrap()
    }

    #[test]
    fn ok_and_locationless_redirects_pass_through() {
        let rw = rewriter();
        let mut ok = ProxyResponse::with_body(StatusCode::OK, "text/plain", "hi");
        ok.headers
            .insert(LOCATION, HeaderValue::from_static("https://example.com/x"));
        let out = rw.wrap(ok, &origin());
        assert_eq!(out.headers.get(LOCATION).unwrap(), "https://example.com/x");

        let bare = ProxyResponse::new(StatusCode::FOUND);
        let out = rw.wrap(bare, &origin());
        assert!(out.headers.get(LOCATION).is_none());
        assert!(rw.table().is_empty());
    }

    #[test]
    fn found_is_rewritten_and_other_headers_kept() {
        let rw = rewriter();
        let mut resp = ProxyResponse::with_body(StatusCode::FOUND, "text/html", "moved");
        resp.headers
            .insert(LOCATION, HeaderValue::from_static("https://example.com/x"));
        resp.headers
            .insert("x-trace", HeaderValue::from_static("abc  def"));

        let out = rw.wrap(resp, &origin());
        assert_eq!(out.status, StatusCode::FOUND);
        assert_eq!(out.body, b"moved");
        assert_eq!(
            out.headers.get(LOCATION).unwrap(),
            "/ign-proxy/https://example.com/x"
        );
        assert_eq!(out.headers.get("x-trace").unwrap().as_bytes(), b"abc  def");
        assert_eq!(out.headers.get("content-type").unwrap(), "text/html");
        assert_eq!(
            rw.original_for("/ign-proxy/https://example.com/x").as_deref(),
            Some("https://example.com/x")
        );
    }

    #[test]
    fn relative_location_resolves_against_original() {
        let rw = rewriter();
        let mut resp = ProxyResponse::new(StatusCode::MOVED_PERMANENTLY);
        resp.headers
            .insert(LOCATION, HeaderValue::from_static("../login?next=1"));
        let out = rw.wrap(resp, &origin());
        assert_eq!(
            out.headers.get(LOCATION).unwrap(),
            "/ign-proxy/https://service.test/login?next=1"
        );
    }

    #[test]
    fn already_proxied_location_is_left_alone() {
        let rw = rewriter();
        let mut resp = ProxyResponse::new(StatusCode::FOUND);
        resp.headers.insert(
            LOCATION,
            HeaderValue::from_static("/ign-proxy/https://example.com/"),
        );
        let out = rw.wrap(resp, &origin());
        assert_eq!(
            out.headers.get(LOCATION).unwrap(),
            "/ign-proxy/https://example.com/"
        );
        assert!(rw.table().is_empty());
    }

    #[test]
    fn table_is_bounded_and_expires() {
        let table = CorrelationTable::new(2, Duration::from_secs(10));
        let t0 = Instant::now();
        for i in 0..3 {
            table.insert_at(
                Correlation {
                    original: format!("o{i}"),
                    proxied: format!("p{i}"),
                },
                t0,
            );
        }
        assert_eq!(table.len(), 2);
        assert!(table.original_for_at("p0", t0).is_none());
        assert_eq!(table.original_for_at("p2", t0).as_deref(), Some("o2"));
        assert!(table
            .original_for_at("p2", t0 + Duration::from_secs(11))
            .is_none());
        assert!(table.is_empty());
    }
}
