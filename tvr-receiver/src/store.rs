//! Pairing records persisted as a JSON file.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{info, warn};
use tvr_core::{MemoryPairingStore, PairingRecord, PairingStore, RemoteError};

/// In-memory store that rewrites its backing file after every change.
pub struct FilePairingStore {
    records: MemoryPairingStore,
    path: PathBuf,
    /// Held from mutation through the rename so snapshots land in order.
    write: Mutex<()>,
}

impl FilePairingStore {
    /// Open `path`, starting empty if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RemoteError> {
        let path = path.as_ref().to_path_buf();
        let records = match std::fs::read_to_string(&path) {
            Ok(json) => MemoryPairingStore::from_json(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no pairing records at {}; starting empty", path.display());
                MemoryPairingStore::new()
            }
            Err(e) => return Err(RemoteError::Store(e.to_string())),
        };
        Ok(Self {
            records,
            path,
            write: Mutex::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the current snapshot beside the file, then rename it over.
    /// Callers hold `write`.
    fn flush(&self) -> Result<(), RemoteError> {
        let json = self.records.to_json()?;
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        std::fs::write(&staging, json)
            .and_then(|()| std::fs::rename(&staging, &self.path))
            .map_err(|e| {
                warn!("failed to write {}: {e}", self.path.display());
                RemoteError::Store(e.to_string())
            })
    }
}

impl PairingStore for FilePairingStore {
    fn lookup(&self, token: &str) -> Result<Option<PairingRecord>, RemoteError> {
        self.records.lookup(token)
    }

    fn store(&self, record: PairingRecord) -> Result<(), RemoteError> {
        let _write = self.write.lock();
        self.records.store(record)?;
        self.flush()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn record(token: &str) -> PairingRecord {
        PairingRecord {
            token: token.into(),
            friendly_name: Some("Phone".into()),
            last_connected_address: "10.0.0.2".into(),
            last_connected_time: SystemTime::UNIX_EPOCH,
            device_type: None,
        }
    }

    #[test]
    fn records_survive_reopen() {
        let path = std::env::temp_dir().join(format!(
            "tvr-store-{}-{}.json",
            std::process::id(),
            line!()
        ));
        let _ = std::fs::remove_file(&path);

        let store = FilePairingStore::open(&path).unwrap();
        assert!(store.is_empty());
        store.store(record("abc")).unwrap();

        let reopened = FilePairingStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.lookup("abc").unwrap(), Some(record("abc")));
        assert_eq!(reopened.lookup("nope").unwrap(), None);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn concurrent_stores_leave_a_readable_file() {
        let path = std::env::temp_dir().join(format!(
            "tvr-store-{}-{}.json",
            std::process::id(),
            line!()
        ));
        let _ = std::fs::remove_file(&path);
        let store = std::sync::Arc::new(FilePairingStore::open(&path).unwrap());

        let writers: Vec<_> = (0..8)
            .map(|t| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..10 {
                        store.store(record(&format!("tok-{t}-{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let reopened = FilePairingStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 80);
        assert!(reopened.lookup("tok-7-9").unwrap().is_some());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let path = std::env::temp_dir().join(format!(
            "tvr-store-{}-{}.json",
            std::process::id(),
            line!()
        ));
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FilePairingStore::open(&path),
            Err(RemoteError::Store(_))
        ));
        std::fs::remove_file(&path).unwrap();
    }
}
