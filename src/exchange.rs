use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use url::Url;

/// Headers that never travel through the tunnel: they describe the hop
/// between the page and the hub, not the request to the origin.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// A request as it is sent to the origin (through the tunnel or directly).
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ProxyRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Drop hop-by-hop headers copied from the inbound request.
    pub fn strip_hop_by_hop(&mut self) {
        for name in HOP_BY_HOP {
            self.headers.remove(*name);
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }
}

/// A response on its way back to the page.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    /// Reason phrase as received; `None` means the canonical one.
    pub status_text: Option<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            status_text: None,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(status: StatusCode, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        let mut resp = Self::new(status);
        if let Ok(v) = HeaderValue::from_str(content_type) {
            resp.headers.insert(reqwest::header::CONTENT_TYPE, v);
        }
        resp.body = body.into();
        resp
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> &str {
        self.header_str("content-type").unwrap_or("")
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status.as_u16())
    }
}

/// Encode headers as ordered string pairs; non-UTF-8 values are dropped.
pub fn headers_to_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}

/// Inverse of [`headers_to_pairs`]; invalid names or values are skipped.
pub fn pairs_to_headers(pairs: &[(String, String)]) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(pairs.len());
    for (k, v) in pairs {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(k.as_bytes()),
            HeaderValue::from_str(v),
        ) else {
            continue;
        };
        out.append(name, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_pairs_keep_repeated_values() {
        let pairs = vec![
            ("set-cookie".to_string(), "a=1".to_string()),
            ("set-cookie".to_string(), "b=2".to_string()),
            ("bad name".to_string(), "x".to_string()),
        ];
        let headers = pairs_to_headers(&pairs);
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers_to_pairs(&headers).len(), 2);
    }

    #[test]
    fn strip_hop_by_hop_keeps_end_to_end_headers() {
        let mut req = ProxyRequest::get(Url::parse("https://service.test/").unwrap());
        req.headers.insert("host", HeaderValue::from_static("127.0.0.1:7940"));
        req.headers.insert("connection", HeaderValue::from_static("keep-alive"));
        req.headers.insert("accept", HeaderValue::from_static("text/html"));
        req.strip_hop_by_hop();
        assert!(req.headers.get("host").is_none());
        assert!(req.headers.get("connection").is_none());
        assert_eq!(req.headers.get("accept").unwrap(), "text/html");
    }
}
