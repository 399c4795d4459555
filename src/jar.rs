//! Slotted cookie jar.
//!
//! Records live in SQLite, partitioned by slot. The current slot is a pointer
//! kept in the `meta` table; switching slots never copies data. Snapshots of
//! a slot go to the `sessions` table and to the file vault, and `heal` uses
//! either one to refill a slot that was wiped.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::bus::{Bus, BusMessage};
use crate::error::StoreError;
use crate::seal::Sealer;
use crate::vault::Vault;

pub const DEFAULT_SLOT: &str = "default";

const META_CURRENT_SLOT: &str = "current_slot";

/// Longest lifetime a `Set-Cookie` may ask for, as browsers cap it.
const MAX_COOKIE_AGE: Duration = Duration::from_secs(400 * 24 * 60 * 60);

/// How often `follow` re-reads the persisted slot pointer.
const POINTER_POLL: Duration = Duration::from_millis(500);

static SLOT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").unwrap());

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cookies (
    id TEXT PRIMARY KEY,
    domain TEXT NOT NULL,
    name TEXT NOT NULL,
    value BLOB NOT NULL,
    path TEXT NOT NULL,
    expires INTEGER,
    slot_id TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS cookies_slot ON cookies(slot_id);
CREATE TABLE IF NOT EXISTS sessions (
    slot_id TEXT PRIMARY KEY,
    snapshot BLOB NOT NULL,
    taken_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

pub fn validate_slot_id(slot_id: &str) -> Result<(), StoreError> {
    if SLOT_ID.is_match(slot_id) {
        Ok(())
    } else {
        Err(StoreError::InvalidSlot(slot_id.to_string()))
    }
}

/// How a stored cookie domain is matched against a request host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainMatch {
    /// Stored domain equals the host or is a dot-bounded suffix of it.
    #[default]
    Strict,
    /// Either side is a raw suffix of the other. Lets `example.com` see
    /// cookies set for `a.example.com`; kept for old profiles that rely on it.
    Bidirectional,
}

impl DomainMatch {
    pub fn matches(self, stored: &str, query: &str) -> bool {
        let stored = normalize_domain(stored);
        let query = normalize_domain(query);
        if stored.is_empty() || query.is_empty() {
            return false;
        }
        match self {
            DomainMatch::Strict => {
                query == stored
                    || (query.len() > stored.len()
                        && query.ends_with(&stored)
                        && query.as_bytes()[query.len() - stored.len() - 1] == b'.')
            }
            DomainMatch::Bidirectional => query.ends_with(&stored) || stored.ends_with(&query),
        }
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('.').to_ascii_lowercase()
}

pub fn composite_key(slot_id: &str, domain: &str, name: &str) -> String {
    format!("{slot_id}:{}:{name}", normalize_domain(domain))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub composite_key: String,
    pub domain: String,
    pub name: String,
    pub value: String,
    pub path: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub slot_id: String,
}

impl CookieRecord {
    pub fn new(
        slot_id: &str,
        domain: &str,
        name: &str,
        value: &str,
        path: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let domain = normalize_domain(domain);
        Self {
            composite_key: composite_key(slot_id, &domain, name),
            domain,
            name: name.to_string(),
            value: value.to_string(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            expires_at,
            slot_id: slot_id.to_string(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    pub fn path_matches(&self, request_path: &str) -> bool {
        let p = self.path.as_str();
        if p == "/" || request_path == p {
            return true;
        }
        request_path.starts_with(p)
            && (p.ends_with('/') || request_path[p.len()..].starts_with('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub slot_id: String,
    pub cookies: Vec<CookieRecord>,
    #[serde(default)]
    pub auxiliary_state: BTreeMap<String, serde_json::Value>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealOutcome {
    RestoredFromVault { records: usize },
    RestoredFromSessions { records: usize },
    Refreshed { records: usize },
    /// Slot empty and nothing to restore from.
    Empty,
}

/// A cookie parsed out of a `Set-Cookie` response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub domain: String,
    pub name: String,
    pub value: String,
    pub path: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SetCookie {
    /// Parse one header value. `host` is the request host, used when the
    /// cookie has no `Domain` attribute.
    pub fn parse(header: &str, host: &str, now: DateTime<Utc>) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let mut cookie = SetCookie {
            domain: normalize_domain(host),
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            path: "/".to_string(),
            expires_at: None,
        };
        let mut max_age = None;
        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => cookie.domain = normalize_domain(val),
                "path" if val.starts_with('/') => cookie.path = val.to_string(),
                "max-age" => max_age = val.parse::<i64>().ok(),
                "expires" => {
                    if let Ok(t) = DateTime::parse_from_rfc2822(val) {
                        cookie.expires_at = Some(t.with_timezone(&Utc));
                    }
                }
                _ => {}
            }
        }
        if let Some(secs) = max_age {
            cookie.expires_at = Some(expiry_after(now, secs));
        }
        Some(cookie)
    }
}

/// `now + max_age`, clamped to `[now, now + MAX_COOKIE_AGE]`.
fn expiry_after(now: DateTime<Utc>, max_age: i64) -> DateTime<Utc> {
    let cap = MAX_COOKIE_AGE.as_secs() as i64;
    chrono::TimeDelta::try_seconds(max_age.clamp(0, cap))
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

pub struct SessionStore {
    conn: Mutex<Connection>,
    current: RwLock<String>,
    vault: Vault,
    sealer: Arc<dyn Sealer>,
    domain_match: DomainMatch,
    bus: Bus,
}

impl SessionStore {
    pub fn open(
        db_path: &Path,
        vault: Vault,
        sealer: Arc<dyn Sealer>,
        domain_match: DomainMatch,
        bus: Bus,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        let current: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![META_CURRENT_SLOT],
                |row| row.get(0),
            )
            .optional()?;
        let current = current
            .filter(|s| validate_slot_id(s).is_ok())
            .unwrap_or_else(|| DEFAULT_SLOT.to_string());
        Ok(Self {
            conn: Mutex::new(conn),
            current: RwLock::new(current),
            vault,
            sealer,
            domain_match,
            bus,
        })
    }

    /// Run `f` on the blocking pool. SQLite calls made while serving a
    /// request go through here so they do not stall a runtime worker.
    pub async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&SessionStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Blocking(e.to_string()))?
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves SQLite itself consistent.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_slot(&self) -> String {
        match self.current.read() {
            Ok(g) => g.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    fn set_pointer(&self, slot_id: &str) -> Result<(), StoreError> {
        // Held across both writes so `sync_pointer` never sees them apart.
        let conn = self.conn();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![META_CURRENT_SLOT, slot_id],
        )?;
        self.adopt_pointer(slot_id);
        Ok(())
    }

    /// Re-read the persisted pointer and adopt it if another process moved
    /// it. Returns whether the current slot changed.
    pub fn sync_pointer(&self) -> Result<bool, StoreError> {
        let conn = self.conn();
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![META_CURRENT_SLOT],
                |row| row.get(0),
            )
            .optional()?;
        let Some(stored) = stored.filter(|s| validate_slot_id(s).is_ok()) else {
            return Ok(false);
        };
        if stored == self.current_slot() {
            return Ok(false);
        }
        self.adopt_pointer(&stored);
        crate::logging::info_kv("slot adopted from store", &[("slot", &stored)]);
        Ok(true)
    }

    fn adopt_pointer(&self, slot_id: &str) {
        match self.current.write() {
            Ok(mut g) => *g = slot_id.to_string(),
            Err(e) => *e.into_inner() = slot_id.to_string(),
        }
    }

    pub fn domain_match(&self) -> DomainMatch {
        self.domain_match
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn set_cookie(
        &self,
        domain: &str,
        name: &str,
        value: &str,
        path: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<CookieRecord, StoreError> {
        let record = CookieRecord::new(&self.current_slot(), domain, name, value, path, expires_at);
        let conn = self.conn();
        self.upsert(&conn, &record)?;
        Ok(record)
    }

    fn upsert(&self, conn: &Connection, record: &CookieRecord) -> Result<(), StoreError> {
        let sealed = self.sealer.seal(record.value.as_bytes())?;
        conn.execute(
            "INSERT INTO cookies (id, domain, name, value, path, expires, slot_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                domain = excluded.domain,
                name = excluded.name,
                value = excluded.value,
                path = excluded.path,
                expires = excluded.expires,
                slot_id = excluded.slot_id",
            params![
                record.composite_key,
                record.domain,
                record.name,
                sealed,
                record.path,
                record.expires_at.map(|t| t.timestamp_millis()),
                record.slot_id,
            ],
        )?;
        Ok(())
    }

    fn slot_records(&self, slot_id: &str) -> Result<Vec<CookieRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, domain, name, value, path, expires, slot_id
             FROM cookies WHERE slot_id = ?1 ORDER BY domain, name",
        )?;
        let rows = stmt.query_map(params![slot_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (composite_key, domain, name, sealed, path, expires, slot_id) = row?;
            let plain = self.sealer.open(&sealed)?;
            let value = String::from_utf8(plain)
                .map_err(|_| StoreError::Unseal(format!("cookie {composite_key} is not utf-8")))?;
            out.push(CookieRecord {
                composite_key,
                domain,
                name,
                value,
                path,
                expires_at: expires.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                slot_id,
            });
        }
        Ok(out)
    }

    /// Records of the current slot visible to `domain`. Expiry is not applied.
    pub fn get_cookies(&self, domain: &str) -> Result<Vec<CookieRecord>, StoreError> {
        let mode = self.domain_match;
        Ok(self
            .slot_records(&self.current_slot())?
            .into_iter()
            .filter(|r| mode.matches(&r.domain, domain))
            .collect())
    }

    /// `Cookie` header value for a request, skipping expired records.
    pub fn cookie_header(
        &self,
        host: &str,
        path: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        let pairs: Vec<String> = self
            .get_cookies(host)?
            .into_iter()
            .filter(|r| !r.is_expired(now) && r.path_matches(path))
            .map(|r| format!("{}={}", r.name, r.value))
            .collect();
        if pairs.is_empty() {
            Ok(None)
        } else {
            Ok(Some(pairs.join("; ")))
        }
    }

    pub fn count(&self, slot_id: &str) -> Result<usize, StoreError> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM cookies WHERE slot_id = ?1",
            params![slot_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Move the slot pointer and tell siblings.
    pub fn switch_slot(&self, slot_id: &str) -> Result<(), StoreError> {
        validate_slot_id(slot_id)?;
        self.set_pointer(slot_id)?;
        self.bus.publish(BusMessage::SlotSwitch {
            slot_id: slot_id.to_string(),
        });
        crate::logging::info_kv("slot switched", &[("slot", slot_id)]);
        Ok(())
    }

    /// Apply a sibling's switch. The sibling already persisted the pointer.
    pub fn adopt_slot(&self, slot_id: &str) -> Result<(), StoreError> {
        validate_slot_id(slot_id)?;
        self.adopt_pointer(slot_id);
        crate::logging::info_kv("slot adopted from sibling", &[("slot", slot_id)]);
        Ok(())
    }

    fn aux_key(slot_id: &str) -> String {
        format!("aux:{slot_id}")
    }

    pub fn aux(&self) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![Self::aux_key(&self.current_slot())],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(BTreeMap::new()),
        }
    }

    fn write_aux(
        &self,
        slot_id: &str,
        aux: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(aux)?;
        self.conn().execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![Self::aux_key(slot_id), raw],
        )?;
        Ok(())
    }

    pub fn set_aux(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let mut aux = self.aux()?;
        aux.insert(key.to_string(), value);
        self.write_aux(&self.current_slot(), &aux)
    }

    /// Dump the current slot, persist it to the sessions table and refresh
    /// the vault copy.
    pub fn export_snapshot(&self) -> Result<SessionSnapshot, StoreError> {
        let slot_id = self.current_slot();
        let snapshot = SessionSnapshot {
            cookies: self.slot_records(&slot_id)?,
            auxiliary_state: self.aux()?,
            taken_at: Utc::now(),
            slot_id,
        };
        let sealed = self.sealer.seal(&serde_json::to_vec(&snapshot)?)?;
        self.conn().execute(
            "INSERT INTO sessions (slot_id, snapshot, taken_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(slot_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                taken_at = excluded.taken_at",
            params![
                snapshot.slot_id,
                sealed,
                snapshot.taken_at.timestamp_millis()
            ],
        )?;
        if let Err(e) = self.vault.write(&snapshot) {
            crate::logging::warn_kv(
                "vault refresh failed",
                &[("slot", &snapshot.slot_id), ("error", &e.to_string())],
            );
        }
        Ok(snapshot)
    }

    /// Additive merge: moves the pointer to the snapshot's slot and upserts
    /// every record. Nothing is deleted. Returns the number of records
    /// written.
    pub fn import_snapshot(&self, snapshot: &SessionSnapshot) -> Result<usize, StoreError> {
        let n = self.merge(snapshot)?;
        self.bus.publish(BusMessage::SlotSwitch {
            slot_id: snapshot.slot_id.clone(),
        });
        Ok(n)
    }

    fn merge(&self, snapshot: &SessionSnapshot) -> Result<usize, StoreError> {
        let slot_id = snapshot.slot_id.as_str();
        validate_slot_id(slot_id)?;
        self.set_pointer(slot_id)?;
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            for c in &snapshot.cookies {
                let record =
                    CookieRecord::new(slot_id, &c.domain, &c.name, &c.value, &c.path, c.expires_at);
                self.upsert(&tx, &record)?;
            }
            tx.commit()?;
        }
        self.write_aux(slot_id, &snapshot.auxiliary_state)?;
        Ok(snapshot.cookies.len())
    }

    fn session_row(&self, slot_id: &str) -> Result<Option<SessionSnapshot>, StoreError> {
        let sealed: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT snapshot FROM sessions WHERE slot_id = ?1",
                params![slot_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(sealed) = sealed else {
            return Ok(None);
        };
        let plain = self.sealer.open(&sealed)?;
        Ok(Some(serde_json::from_slice(&plain)?))
    }

    /// Refill an empty current slot from a backup, or refresh the backups
    /// from a populated one.
    pub fn heal(&self) -> Result<HealOutcome, StoreError> {
        let slot_id = self.current_slot();
        let present = self.count(&slot_id)?;
        if present > 0 {
            let snap = self.export_snapshot()?;
            return Ok(HealOutcome::Refreshed {
                records: snap.cookies.len(),
            });
        }

        match self.vault.read(&slot_id) {
            Ok(Some(snap)) if !snap.cookies.is_empty() => {
                let records = self.merge(&snap)?;
                crate::logging::info_kv(
                    "slot restored from vault",
                    &[("slot", &slot_id), ("records", &records.to_string())],
                );
                return Ok(HealOutcome::RestoredFromVault { records });
            }
            Ok(_) => {}
            Err(e) => {
                crate::logging::warn_kv(
                    "vault backup unusable",
                    &[("slot", &slot_id), ("error", &e.to_string())],
                );
            }
        }

        match self.session_row(&slot_id) {
            Ok(Some(snap)) if !snap.cookies.is_empty() => {
                let records = self.merge(&snap)?;
                crate::logging::info_kv(
                    "slot restored from sessions table",
                    &[("slot", &slot_id), ("records", &records.to_string())],
                );
                Ok(HealOutcome::RestoredFromSessions { records })
            }
            Ok(_) => Ok(HealOutcome::Empty),
            Err(e) => {
                crate::logging::warn_kv(
                    "session snapshot unusable",
                    &[("slot", &slot_id), ("error", &e.to_string())],
                );
                Ok(HealOutcome::Empty)
            }
        }
    }

    /// Apply slot switches announced by siblings until `shutdown` fires.
    ///
    /// Siblings in this process arrive over the bus. Other processes sharing
    /// the database only move the `meta` row, so that is polled as well.
    pub fn follow(self: &Arc<Self>, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        // Created before spawning so a shutdown sent right away is not missed.
        let stop = shutdown.notified_owned();
        tokio::spawn(async move {
            tokio::pin!(stop);
            let mut poll = tokio::time::interval(POINTER_POLL);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some((_, BusMessage::SlotSwitch { slot_id })) => {
                            if let Err(e) = store.adopt_slot(&slot_id) {
                                crate::logging::warn_kv(
                                    "ignored slot switch",
                                    &[("slot", &slot_id), ("error", &e.to_string())],
                                );
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = poll.tick() => {
                        if let Err(e) = store.blocking(|s| s.sync_pointer()).await {
                            crate::logging::warn(format!("slot pointer poll failed: {e}"));
                        }
                    }
                    _ = &mut stop => break,
                }
            }
        })
    }
}
