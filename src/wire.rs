use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::TransportError;
use crate::exchange::{headers_to_pairs, pairs_to_headers, ProxyRequest, ProxyResponse};

pub const TUNNEL_MAX_MESSAGE_BYTES: usize = 32 * 1024 * 1024;

/// Canonical tunnel authorization identifier: "IGNT" + version 1.0.
pub const HANDSHAKE: [u8; 6] = [0x49, 0x47, 0x4e, 0x54, 0x01, 0x00];

const MAGIC0: u8 = b'I';
const MAGIC1: u8 = b'G';
const VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Kind {
    Request,
    Response,
}

impl Kind {
    fn as_byte(self) -> u8 {
        match self {
            Kind::Request => 1,
            Kind::Response => 2,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Kind::Request),
            2 => Some(Kind::Response),
            _ => None,
        }
    }
}

// Named msgpack fields so relays in other languages can decode by key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Method")]
    pub method: String,
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "Headers", default)]
    pub headers: Vec<(String, String)>,
    #[serde(rename = "Body", default, with = "serde_bytes_vec")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Status")]
    pub status: u16,
    #[serde(rename = "StatusText", default)]
    pub status_text: Option<String>,
    #[serde(rename = "Headers", default)]
    pub headers: Vec<(String, String)>,
    #[serde(rename = "Body", default, with = "serde_bytes_vec")]
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum Decoded {
    Request(WireRequest),
    Response(WireResponse),
}

impl WireRequest {
    pub fn from_request(id: &str, req: &ProxyRequest) -> Self {
        Self {
            id: id.to_string(),
            method: req.method.as_str().to_string(),
            url: req.url.to_string(),
            headers: headers_to_pairs(&req.headers),
            body: req.body.clone(),
        }
    }

    pub fn into_request(self) -> Result<ProxyRequest, TransportError> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|e| TransportError::Frame(format!("bad method: {e}")))?;
        let url =
            Url::parse(&self.url).map_err(|e| TransportError::Frame(format!("bad url: {e}")))?;
        Ok(ProxyRequest {
            method,
            url,
            headers: pairs_to_headers(&self.headers),
            body: self.body,
        })
    }
}

impl WireResponse {
    pub fn from_response(id: &str, resp: &ProxyResponse) -> Self {
        Self {
            id: id.to_string(),
            status: resp.status.as_u16(),
            status_text: resp.status_text.clone(),
            headers: headers_to_pairs(&resp.headers),
            body: resp.body.clone(),
        }
    }

    pub fn into_response(self) -> Result<ProxyResponse, TransportError> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| TransportError::Frame(format!("bad status: {e}")))?;
        Ok(ProxyResponse {
            status,
            status_text: self.status_text,
            headers: pairs_to_headers(&self.headers),
            body: self.body,
        })
    }
}

pub fn encode_request(msg: &WireRequest) -> Result<Vec<u8>, TransportError> {
    encode(Kind::Request, msg)
}

pub fn encode_response(msg: &WireResponse) -> Result<Vec<u8>, TransportError> {
    encode(Kind::Response, msg)
}

fn encode<T: Serialize>(kind: Kind, msg: &T) -> Result<Vec<u8>, TransportError> {
    let payload =
        rmp_serde::to_vec_named(msg).map_err(|e| TransportError::Frame(e.to_string()))?;
    if payload.len() > TUNNEL_MAX_MESSAGE_BYTES {
        return Err(TransportError::Frame(format!(
            "message too large: {} bytes",
            payload.len()
        )));
    }
    let mut out = Vec::with_capacity(4 + payload.len());
    out.push(MAGIC0);
    out.push(MAGIC1);
    out.push(VERSION);
    out.push(kind.as_byte());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode(raw: &[u8]) -> Result<Decoded, TransportError> {
    if raw.len() < 4 || raw[0] != MAGIC0 || raw[1] != MAGIC1 {
        return Err(TransportError::Frame("missing tunnel envelope magic".into()));
    }
    if raw[2] != VERSION {
        return Err(TransportError::Frame(format!(
            "unsupported tunnel envelope version: {}",
            raw[2]
        )));
    }
    let payload = &raw[4..];
    let frame_err = |e: rmp_serde::decode::Error| TransportError::Frame(e.to_string());
    match Kind::from_byte(raw[3]) {
        Some(Kind::Request) => Ok(Decoded::Request(
            rmp_serde::from_slice(payload).map_err(frame_err)?,
        )),
        Some(Kind::Response) => Ok(Decoded::Response(
            rmp_serde::from_slice(payload).map_err(frame_err)?,
        )),
        None => Err(TransportError::Frame(format!(
            "unknown tunnel message kind: {}",
            raw[3]
        ))),
    }
}

// msgpack bin encoding for bodies instead of an array of integers.
mod serde_bytes_vec {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("bytes")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
                Ok(v)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Vec<u8>, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        d.deserialize_byte_buf(BytesVisitor)
    }
}
