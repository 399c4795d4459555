use url::Url;

use crate::error::ConnectError;

const DAY_MS: i64 = 86_400_000;

/// Equivalent relay endpoints. One is chosen per UTC day so load spreads
/// across mirrors without any coordination between clients.
#[derive(Debug, Clone)]
pub struct MirrorSet {
    mirrors: Vec<Url>,
}

impl MirrorSet {
    pub fn new(mirrors: Vec<Url>) -> Self {
        Self { mirrors }
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    pub fn daily_index(now_ms: i64, len: usize) -> usize {
        let seed = now_ms.div_euclid(DAY_MS);
        seed.rem_euclid(len as i64) as usize
    }

    pub fn resolve_at(&self, now_ms: i64) -> Result<&Url, ConnectError> {
        if self.mirrors.is_empty() {
            return Err(ConnectError::NoMirrors);
        }
        Ok(&self.mirrors[Self::daily_index(now_ms, self.mirrors.len())])
    }

    pub fn resolve(&self) -> Result<&Url, ConnectError> {
        self.resolve_at(chrono::Utc::now().timestamp_millis())
    }
}
