use crate::orchestrator::waitlist::QueueEntry;

use super::StorageError;

/// Ordered key-value operations the persisted waitlist needs from an engine.
pub trait StorageBackend: Send + Sync {
    fn flush(&self) -> Result<(), StorageError>;
    fn next_sequence(&self) -> Result<u64, StorageError>;
    /// Stores the entry unless its requester already has one. Returns whether
    /// it was stored.
    fn insert_waitlist_entry(&self, entry: &QueueEntry) -> Result<bool, StorageError>;
    fn get_waitlist_entry(&self, requester_id: &str) -> Result<Option<QueueEntry>, StorageError>;
    /// Entries ordered by enqueue time, then sequence.
    fn list_waitlist_entries(&self, limit: Option<usize>) -> Result<Vec<QueueEntry>, StorageError>;
    fn list_waitlist_ids(&self) -> Result<Vec<String>, StorageError>;
    fn count_waitlist_entries(&self) -> Result<usize, StorageError>;
    fn remove_waitlist_entry(&self, requester_id: &str) -> Result<Option<QueueEntry>, StorageError>;
    /// Deletes the entry only if the stored record is still the same enqueue
    /// (same sequence). Returns whether this call deleted it.
    fn remove_waitlist_entry_if_current(&self, entry: &QueueEntry) -> Result<bool, StorageError>;
}
