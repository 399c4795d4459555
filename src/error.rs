//! Error kinds surfaced by the hub's core components.

/// Every connection candidate failed (or the mirror set was empty).
///
/// `Clone` because one failed attempt is handed to every caller that was
/// waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("no relay mirrors configured")]
    NoMirrors,
    #[error("no transport candidates configured")]
    NoCandidates,
    #[error("all transport candidates failed: {}", .0.join("; "))]
    Exhausted(Vec<String>),
}

/// Send/receive failure on an established (or establishing) tunnel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("tunnel not connected")]
    NotConnected,
    #[error("tunnel link closed")]
    Closed,
    #[error("tunnel request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("tunnel frame error: {0}")]
    Frame(String),
    #[error("tunnel io: {0}")]
    Io(String),
}

/// A rewrite task could not produce a reply.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("executor {0} is gone")]
    ExecutorGone(usize),
    #[error("task {0} crashed before replying")]
    Crashed(u64),
    #[error("executor pool is empty")]
    EmptyPool,
}

/// Durable store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("backup for slot {0} is corrupt")]
    Corrupt(String),
    #[error("sealed payload could not be opened: {0}")]
    Unseal(String),
    #[error("invalid slot id: {0:?}")]
    InvalidSlot(String),
    #[error("store task did not finish: {0}")]
    Blocking(String),
}

/// A registered hook failed.
#[derive(Debug, thiserror::Error)]
#[error("hook {hook} failed: {message}")]
pub struct HookError {
    pub hook: String,
    pub message: String,
}

impl HookError {
    pub fn new(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            hook: hook.into(),
            message: message.into(),
        }
    }
}
