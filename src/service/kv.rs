//! A simple key/value store service, used by the server binary and the test
//! suite. Keys are strings and values arbitrary bytes.

use super::{Kind, Operations, Service};
use crate::encoding::bincode;
use crate::errinput;
use crate::error::Result;

use std::collections::BTreeMap;

/// The service type name, for registry registration.
pub const SERVICE_TYPE: &str = "kv";

/// The key/value operation table.
const OPERATIONS: Operations =
    &[("delete", Kind::Command), ("get", Kind::Query), ("put", Kind::Command)];

/// Encodes a put payload.
pub fn put(key: &str, value: &[u8]) -> Vec<u8> {
    bincode::serialize(&(key, value))
}

/// Encodes a get payload.
pub fn get(key: &str) -> Vec<u8> {
    bincode::serialize(&key)
}

/// Encodes a delete payload.
pub fn delete(key: &str) -> Vec<u8> {
    bincode::serialize(&key)
}

/// Decodes a get result.
pub fn decode_get(result: &[u8]) -> Result<Option<Vec<u8>>> {
    bincode::deserialize(result)
}

/// Decodes a delete result (whether the key existed).
pub fn decode_delete(result: &[u8]) -> Result<bool> {
    bincode::deserialize(result)
}

/// An in-memory key/value store service.
pub struct Store {
    data: BTreeMap<String, Vec<u8>>,
}

impl Store {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl Service for Store {
    fn operations(&self) -> Operations {
        OPERATIONS
    }

    fn command(&mut self, operation: &str, payload: &[u8]) -> Result<Vec<u8>> {
        match operation {
            "put" => {
                let (key, value): (String, Vec<u8>) = bincode::deserialize(payload)?;
                self.data.insert(key, value);
                Ok(Vec::new())
            }
            "delete" => {
                let key: String = bincode::deserialize(payload)?;
                let existed = self.data.remove(&key).is_some();
                Ok(bincode::serialize(&existed))
            }
            operation => Err(errinput!("unknown command {operation}")),
        }
    }

    fn query(&self, operation: &str, payload: &[u8]) -> Result<Vec<u8>> {
        match operation {
            "get" => {
                let key: String = bincode::deserialize(payload)?;
                Ok(bincode::serialize(&self.data.get(&key)))
            }
            operation => Err(errinput!("unknown query {operation}")),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.data))
    }

    fn install(&mut self, data: &[u8]) -> Result<()> {
        self.data = bincode::deserialize(data)?;
        Ok(())
    }
}
