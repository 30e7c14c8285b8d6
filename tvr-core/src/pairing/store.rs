use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// A paired remote, keyed by its auth token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRecord {
    pub token: String,
    pub friendly_name: Option<String>,
    pub last_connected_address: String,
    pub last_connected_time: SystemTime,
    pub device_type: Option<String>,
}

/// Persistence for pairing records. Records are never deleted here.
pub trait PairingStore: Send + Sync {
    fn lookup(&self, token: &str) -> Result<Option<PairingRecord>, RemoteError>;

    /// Insert or overwrite the record for `record.token`.
    fn store(&self, record: PairingRecord) -> Result<(), RemoteError>;
}

/// In-process store. Contents can be exported as JSON for persistence.
#[derive(Debug, Default)]
pub struct MemoryPairingStore {
    records: RwLock<HashMap<String, PairingRecord>>,
}

impl MemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load records previously produced by [`Self::to_json`].
    pub fn from_json(json: &str) -> Result<Self, RemoteError> {
        let records: Vec<PairingRecord> =
            serde_json::from_str(json).map_err(|e| RemoteError::Store(e.to_string()))?;
        Ok(Self {
            records: RwLock::new(
                records
                    .into_iter()
                    .map(|r| (r.token.clone(), r))
                    .collect(),
            ),
        })
    }

    pub fn to_json(&self) -> Result<String, RemoteError> {
        let records: Vec<PairingRecord> = self.records.read().values().cloned().collect();
        serde_json::to_string_pretty(&records).map_err(|e| RemoteError::Store(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PairingStore for MemoryPairingStore {
    fn lookup(&self, token: &str) -> Result<Option<PairingRecord>, RemoteError> {
        Ok(self.records.read().get(token).cloned())
    }

    fn store(&self, record: PairingRecord) -> Result<(), RemoteError> {
        self.records.write().insert(record.token.clone(), record);
        Ok(())
    }
}
