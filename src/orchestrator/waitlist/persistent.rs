use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::storage::StorageFacade;

use super::{EnqueueRequest, Enqueued, QueueEntry, QueueStore, WaitlistError};

/// Result of popping the head of the booth waitlist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NextGroup {
    pub entry: QueueEntry,
    /// Companions first, then the lead requester.
    pub current_group: Vec<String>,
    /// Lead identity of the entry now at the head; it stays queued.
    pub next_group_preview: Option<String>,
}

/// Event-long waitlist kept in sled, ordered by enqueue time then by a
/// storage-generated sequence.
pub struct PersistentWaitlist {
    storage: Arc<StorageFacade>,
}

impl PersistentWaitlist {
    pub fn bootstrap(storage: Arc<StorageFacade>, logger: &Logger) -> Result<Self, WaitlistError> {
        let waitlist = Self { storage };
        let pending = waitlist.storage.count_waitlist_entries()?;

        logger.log(
            LogLevel::Info,
            Some("waitlist::bootstrap"),
            "Booth waitlist loaded from persistence",
            Some(json!({
                "pending": pending,
                "data_path": waitlist.storage.data_path().display().to_string()
            })),
        );

        Ok(waitlist)
    }

    /// Pops the head entry as a whole group and peeks at the one behind it.
    pub fn dequeue_next_group(&self) -> Result<Option<NextGroup>, WaitlistError> {
        loop {
            let mut window = self.storage.list_waitlist_entries(Some(2))?.into_iter();
            let Some(head) = window.next() else {
                return Ok(None);
            };
            if !self.storage.remove_waitlist_entry_if_current(&head)? {
                // another dispatcher took it first
                continue;
            }

            return Ok(Some(NextGroup {
                current_group: head.party(),
                next_group_preview: window.next().map(|entry| entry.requester_id),
                entry: head,
            }));
        }
    }

    fn rank_of(&self, requester_id: &str) -> Result<Option<usize>, WaitlistError> {
        Ok(self
            .storage
            .list_waitlist_ids()?
            .iter()
            .position(|id| id == requester_id)
            .map(|index| index + 1))
    }

    /// 1-based rank `entry` holds in index order, whether or not it is still
    /// stored.
    fn rank_in_order(&self, entry: &QueueEntry) -> Result<usize, WaitlistError> {
        let key = order_key(entry);
        let ahead = self
            .storage
            .list_waitlist_entries(None)?
            .iter()
            .filter(|other| other.requester_id != entry.requester_id && order_key(other) < key)
            .count();
        Ok(ahead + 1)
    }
}

fn order_key(entry: &QueueEntry) -> (i64, u64) {
    (entry.enqueued_at.timestamp_millis(), entry.sequence)
}

impl QueueStore for PersistentWaitlist {
    fn enqueue(&self, request: EnqueueRequest) -> Result<Enqueued, WaitlistError> {
        request.validate()?;
        loop {
            if self.storage.get_waitlist_entry(&request.requester_id)?.is_some() {
                match self.rank_of(&request.requester_id)? {
                    Some(position) => {
                        return Err(WaitlistError::AlreadyQueued {
                            requester_id: request.requester_id,
                            position,
                        });
                    }
                    // served between the two reads
                    None => continue,
                }
            }

            let sequence = self.storage.next_sequence()?;
            let entry = request.clone().into_entry(Utc::now(), sequence);
            if !self.storage.insert_waitlist_entry(&entry)? {
                continue;
            }

            let position = self.rank_in_order(&entry)?;
            return Ok(Enqueued { entry, position });
        }
    }

    fn dequeue_oldest(&self) -> Result<Option<QueueEntry>, WaitlistError> {
        loop {
            let Some(oldest) = self.storage.list_waitlist_entries(Some(1))?.into_iter().next()
            else {
                return Ok(None);
            };
            if self.storage.remove_waitlist_entry_if_current(&oldest)? {
                return Ok(Some(oldest));
            }
        }
    }

    fn restore(&self, entry: QueueEntry) -> Result<(), WaitlistError> {
        loop {
            if self.storage.insert_waitlist_entry(&entry)? {
                return Ok(());
            }
            if let Some(position) = self.rank_of(&entry.requester_id)? {
                return Err(WaitlistError::AlreadyQueued {
                    requester_id: entry.requester_id,
                    position,
                });
            }
        }
    }

    fn remove(&self, requester_id: &str) -> Result<Option<QueueEntry>, WaitlistError> {
        Ok(self.storage.remove_waitlist_entry(requester_id)?)
    }

    fn position_of(&self, requester_id: &str) -> Result<Option<usize>, WaitlistError> {
        self.rank_of(requester_id)
    }

    fn size(&self) -> Result<usize, WaitlistError> {
        Ok(self.storage.count_waitlist_entries()?)
    }

    fn snapshot(&self) -> Result<Vec<QueueEntry>, WaitlistError> {
        Ok(self.storage.list_waitlist_entries(None)?)
    }
}
