use std::path::Path;

use sled::transaction::{TransactionError, TransactionResult, abort};

use crate::orchestrator::waitlist::QueueEntry;

use super::{SledMode, StorageBackend, StorageError};

pub struct SledStorage {
    db: sled::Db,
}

const ENTRY_PREFIX: &[u8] = b"v1:w:";
const INDEX_PREFIX: &[u8] = b"v1:wi:";

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        if let Some(mode) = mode {
            config = config.mode(mode.into());
        }

        let db = config.open()?;
        Ok(Self { db })
    }

    fn read_entry(&self, requester_id: &str) -> Result<Option<QueueEntry>, StorageError> {
        self.db
            .get(entry_key(requester_id))?
            .map(|raw| serde_json::from_slice(raw.as_ref()).map_err(StorageError::DeserializeEntry))
            .transpose()
    }
}

fn entry_key(requester_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(ENTRY_PREFIX.len() + requester_id.len());
    key.extend_from_slice(ENTRY_PREFIX);
    key.extend_from_slice(requester_id.as_bytes());
    key
}

// Zero padding keeps byte order equal to numeric order for sled scans.
fn index_key(entry: &QueueEntry) -> Vec<u8> {
    let millis = entry.enqueued_at.timestamp_millis().max(0) as u64;
    let mut key = INDEX_PREFIX.to_vec();
    key.extend_from_slice(format!("{millis:020}:{:020}", entry.sequence).as_bytes());
    key
}

fn identity_from_index(key: &[u8], value: &[u8]) -> Result<String, StorageError> {
    String::from_utf8(value.to_vec()).map_err(|_| StorageError::CorruptIndex {
        key: String::from_utf8_lossy(key).into_owned(),
    })
}

fn flatten_transaction_error(error: TransactionError<StorageError>) -> StorageError {
    match error {
        TransactionError::Abort(source) => source,
        TransactionError::Storage(source) => StorageError::Sled(source),
    }
}

impl StorageBackend for SledStorage {
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }

    fn next_sequence(&self) -> Result<u64, StorageError> {
        self.db.generate_id().map_err(StorageError::Sled)
    }

    fn insert_waitlist_entry(&self, entry: &QueueEntry) -> Result<bool, StorageError> {
        let primary = entry_key(&entry.requester_id);
        let index = index_key(entry);
        let value = serde_json::to_vec(entry).map_err(StorageError::SerializeEntry)?;

        let outcome: TransactionResult<bool, StorageError> = self.db.transaction(|tx| {
            if tx.get(primary.as_slice())?.is_some() {
                return Ok(false);
            }
            tx.insert(primary.as_slice(), value.as_slice())?;
            tx.insert(index.as_slice(), entry.requester_id.as_bytes())?;
            Ok(true)
        });

        let inserted = outcome.map_err(flatten_transaction_error)?;
        if inserted {
            self.flush()?;
        }
        Ok(inserted)
    }

    fn get_waitlist_entry(&self, requester_id: &str) -> Result<Option<QueueEntry>, StorageError> {
        self.read_entry(requester_id)
    }

    fn list_waitlist_entries(&self, limit: Option<usize>) -> Result<Vec<QueueEntry>, StorageError> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut entries = Vec::new();

        for item in self.db.scan_prefix(INDEX_PREFIX) {
            if entries.len() >= limit {
                break;
            }
            let (key, value) = item?;
            let requester_id = identity_from_index(&key, &value)?;
            // A concurrent remove and re-enqueue leaves a stale index record behind
            // for a moment; only the entry that owns this index slot counts.
            if let Some(entry) = self.read_entry(&requester_id)? {
                if index_key(&entry).as_slice() == &*key {
                    entries.push(entry);
                }
            }
        }

        Ok(entries)
    }

    fn list_waitlist_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for item in self.db.scan_prefix(INDEX_PREFIX) {
            let (key, value) = item?;
            ids.push(identity_from_index(&key, &value)?);
        }
        Ok(ids)
    }

    fn count_waitlist_entries(&self) -> Result<usize, StorageError> {
        let mut count = 0;
        for item in self.db.scan_prefix(INDEX_PREFIX) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn remove_waitlist_entry(&self, requester_id: &str) -> Result<Option<QueueEntry>, StorageError> {
        let primary = entry_key(requester_id);

        let outcome: TransactionResult<Option<QueueEntry>, StorageError> =
            self.db.transaction(|tx| {
                let Some(raw) = tx.remove(primary.as_slice())? else {
                    return Ok(None);
                };
                let entry: QueueEntry = match serde_json::from_slice(raw.as_ref()) {
                    Ok(entry) => entry,
                    Err(source) => return abort(StorageError::DeserializeEntry(source)),
                };
                tx.remove(index_key(&entry))?;
                Ok(Some(entry))
            });

        let removed = outcome.map_err(flatten_transaction_error)?;
        if removed.is_some() {
            self.flush()?;
        }
        Ok(removed)
    }

    fn remove_waitlist_entry_if_current(&self, entry: &QueueEntry) -> Result<bool, StorageError> {
        let primary = entry_key(&entry.requester_id);
        let index = index_key(entry);

        let outcome: TransactionResult<bool, StorageError> = self.db.transaction(|tx| {
            let Some(raw) = tx.get(primary.as_slice())? else {
                return Ok(false);
            };
            let stored: QueueEntry = match serde_json::from_slice(raw.as_ref()) {
                Ok(stored) => stored,
                Err(source) => return abort(StorageError::DeserializeEntry(source)),
            };
            if stored.sequence != entry.sequence {
                return Ok(false);
            }
            tx.remove(primary.as_slice())?;
            tx.remove(index.as_slice())?;
            Ok(true)
        });

        let removed = outcome.map_err(flatten_transaction_error)?;
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }
}
