use crate::error::StoreError;

/// Encryption capability for everything the session store persists.
///
/// Chosen at construction; the store never checks for one later.
pub trait Sealer: Send + Sync {
    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, StoreError>;
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, StoreError>;
}

/// Stores values as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl Sealer for Plaintext {
    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, StoreError> {
        Ok(plain.to_vec())
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
        Ok(sealed.to_vec())
    }
}
