//! Secondary backup of session snapshots.
//!
//! One file per slot under a fixed directory, named by the sha1 of the slot
//! id, so it survives the primary database being wiped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use md5::compute as md5_compute;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::StoreError;
use crate::jar::SessionSnapshot;
use crate::seal::Sealer;

#[derive(Serialize, Deserialize)]
struct VaultFile {
    checksum: String,
    payload: String,
}

pub struct Vault {
    dir: PathBuf,
    sealer: Arc<dyn Sealer>,
}

impl Vault {
    pub fn new(dir: impl Into<PathBuf>, sealer: Arc<dyn Sealer>) -> Self {
        Self {
            dir: dir.into(),
            sealer,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, slot_id: &str) -> PathBuf {
        let mut hasher = Sha1::new();
        hasher.update(slot_id.as_bytes());
        self.dir.join(format!("{:x}.json", hasher.finalize()))
    }

    pub fn write(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let plain = serde_json::to_vec(snapshot)?;
        let sealed = self.sealer.seal(&plain)?;
        let file = VaultFile {
            checksum: format!("{:x}", md5_compute(&sealed)),
            payload: base64::engine::general_purpose::STANDARD.encode(&sealed),
        };
        let path = self.path_for(&snapshot.slot_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&file)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// `Ok(None)` when no backup exists for the slot.
    pub fn read(&self, slot_id: &str) -> Result<Option<SessionSnapshot>, StoreError> {
        let path = self.path_for(slot_id);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: VaultFile =
            serde_json::from_slice(&raw).map_err(|_| StoreError::Corrupt(slot_id.to_string()))?;
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(file.payload.as_bytes())
            .map_err(|_| StoreError::Corrupt(slot_id.to_string()))?;
        if format!("{:x}", md5_compute(&sealed)) != file.checksum {
            return Err(StoreError::Corrupt(slot_id.to_string()));
        }
        let plain = self.sealer.open(&sealed)?;
        let snapshot: SessionSnapshot =
            serde_json::from_slice(&plain).map_err(|_| StoreError::Corrupt(slot_id.to_string()))?;
        if snapshot.slot_id != slot_id {
            return Err(StoreError::Corrupt(slot_id.to_string()));
        }
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jar::CookieRecord;
    use crate::seal::Plaintext;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn vault() -> Vault {
        let dir = std::env::temp_dir().join(format!("ignition-vault-{}", uuid::Uuid::new_v4()));
        Vault::new(dir, Arc::new(Plaintext))
    }

    fn snapshot(slot: &str) -> SessionSnapshot {
        SessionSnapshot {
            slot_id: slot.to_string(),
            cookies: vec![CookieRecord::new(slot, "example.com", "sid", "abc", "/", None)],
            auxiliary_state: BTreeMap::new(),
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn path_is_sha1_of_slot() {
        let v = vault();
        let p = v.path_for("default");
        assert_eq!(
            p.file_name().unwrap().to_str().unwrap(),
            "7505d64a54e061b7acd54ccd58b49dc43500b635.json"
        );
    }

    #[test]
    fn write_then_read_and_missing_slot() {
        let v = vault();
        v.write(&snapshot("work")).unwrap();
        let back = v.read("work").unwrap().unwrap();
        assert_eq!(back.cookies.len(), 1);
        assert_eq!(back.cookies[0].value, "abc");
        assert!(v.read("other").unwrap().is_none());
    }

    #[test]
    fn tampered_payload_is_corrupt() {
        let v = vault();
        v.write(&snapshot("work")).unwrap();
        let path = v.path_for("work");
        let mut file: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        file["checksum"] = serde_json::Value::String("0".repeat(32));
        std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();
        assert!(matches!(v.read("work"), Err(StoreError::Corrupt(_))));
    }
}
