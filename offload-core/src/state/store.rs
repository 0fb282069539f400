use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Durable key/value store holding job progress, the run lock and flags.
///
/// Values are opaque bytes; typed records go through [`get_record`] and
/// [`put_record`] (CBOR).
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Replace the value under `key` only when it currently equals `expected`
    /// (`None` = absent). `new = None` deletes. Returns whether the swap happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool>;
}

pub fn get_record<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_cbor::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub fn put_record<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_cbor::to_vec(value)?;
    store.set(key, &bytes)
}
