use std::collections::HashMap;
use std::sync::Mutex;

use super::StateStore;
use crate::error::Result;

/// Process-local store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemStateStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.map
            .lock()
            .map_err(|_| std::io::Error::other("state map poisoned").into())
    }
}

impl StateStore for MemStateStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map()?.remove(key);
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        let mut map = self.map()?;
        if map.get(key).map(|v| v.as_slice()) != expected {
            return Ok(false);
        }
        match new {
            Some(v) => {
                map.insert(key.to_string(), v.to_vec());
            }
            None => {
                map.remove(key);
            }
        }
        Ok(true)
    }
}
