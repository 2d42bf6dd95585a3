pub mod persistent;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// One pending request for assistance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub requester_id: String,
    pub display_name: String,
    pub enqueued_at: DateTime<Utc>,
    /// Monotonic arrival number; breaks ties between equal timestamps.
    pub sequence: u64,
    #[serde(default)]
    pub group_members: Vec<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

impl QueueEntry {
    /// Everyone served by this entry: companions first, then the requester.
    pub fn party(&self) -> Vec<String> {
        let mut party = self.group_members.clone();
        party.push(self.requester_id.clone());
        party
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub requester_id: String,
    pub display_name: String,
    pub group_members: Vec<String>,
    pub topic: Option<String>,
}

impl EnqueueRequest {
    pub fn new(requester_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            requester_id: requester_id.into(),
            display_name: display_name.into(),
            group_members: Vec::new(),
            topic: None,
        }
    }

    pub fn with_group_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_members = members.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    fn validate(&self) -> Result<(), WaitlistError> {
        if self.requester_id.trim().is_empty() {
            return Err(WaitlistError::InvalidIdentity);
        }
        Ok(())
    }

    pub(crate) fn into_entry(self, enqueued_at: DateTime<Utc>, sequence: u64) -> QueueEntry {
        let mut members: Vec<String> = Vec::with_capacity(self.group_members.len());
        for member in self.group_members {
            let member = member.trim().to_owned();
            if member.is_empty() || member == self.requester_id || members.contains(&member) {
                continue;
            }
            members.push(member);
        }

        let display_name = if self.display_name.trim().is_empty() {
            self.requester_id.clone()
        } else {
            self.display_name
        };

        QueueEntry {
            requester_id: self.requester_id,
            display_name,
            enqueued_at,
            sequence,
            group_members: members,
            topic: self.topic.filter(|topic| !topic.trim().is_empty()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Enqueued {
    pub entry: QueueEntry,
    /// 1-based rank right after insertion.
    pub position: usize,
}

#[derive(Debug)]
pub enum WaitlistError {
    AlreadyQueued { requester_id: String, position: usize },
    InvalidIdentity,
    StorageUnavailable(StorageError),
}

impl fmt::Display for WaitlistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyQueued {
                requester_id,
                position,
            } => write!(
                f,
                "requester '{requester_id}' is already waiting at position {position}"
            ),
            Self::InvalidIdentity => write!(f, "requester identity must not be blank"),
            Self::StorageUnavailable(source) => write!(f, "waitlist storage unavailable: {source}"),
        }
    }
}

impl std::error::Error for WaitlistError {}

impl From<StorageError> for WaitlistError {
    fn from(value: StorageError) -> Self {
        Self::StorageUnavailable(value)
    }
}

/// Ordered pending requests keyed by requester identity. Implementations own
/// their entries exclusively and serialize mutations internally.
pub trait QueueStore: Send + Sync {
    fn enqueue(&self, request: EnqueueRequest) -> Result<Enqueued, WaitlistError>;
    fn dequeue_oldest(&self) -> Result<Option<QueueEntry>, WaitlistError>;
    /// Puts a previously dequeued entry back at its original position.
    fn restore(&self, entry: QueueEntry) -> Result<(), WaitlistError>;
    fn remove(&self, requester_id: &str) -> Result<Option<QueueEntry>, WaitlistError>;
    fn position_of(&self, requester_id: &str) -> Result<Option<usize>, WaitlistError>;
    fn size(&self) -> Result<usize, WaitlistError>;
    fn snapshot(&self) -> Result<Vec<QueueEntry>, WaitlistError>;
}

#[derive(Default)]
struct WaitlistState {
    next_sequence: u64,
    order: BTreeMap<u64, QueueEntry>,
    index: HashMap<String, u64>,
}

impl WaitlistState {
    fn rank_of_sequence(&self, sequence: u64) -> usize {
        self.order.range(..sequence).count() + 1
    }
}

/// Session waitlist kept in memory, ordered by arrival.
#[derive(Default)]
pub struct Waitlist {
    state: Mutex<WaitlistState>,
}

impl Waitlist {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for Waitlist {
    fn enqueue(&self, request: EnqueueRequest) -> Result<Enqueued, WaitlistError> {
        request.validate()?;
        let mut state = self.state.lock().expect("waitlist lock poisoned");

        if let Some(sequence) = state.index.get(&request.requester_id).copied() {
            return Err(WaitlistError::AlreadyQueued {
                requester_id: request.requester_id,
                position: state.rank_of_sequence(sequence),
            });
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let entry = request.into_entry(Utc::now(), sequence);
        let position = state.order.len() + 1;

        state.index.insert(entry.requester_id.clone(), sequence);
        state.order.insert(sequence, entry.clone());

        Ok(Enqueued { entry, position })
    }

    fn dequeue_oldest(&self) -> Result<Option<QueueEntry>, WaitlistError> {
        let mut state = self.state.lock().expect("waitlist lock poisoned");
        let Some((_, entry)) = state.order.pop_first() else {
            return Ok(None);
        };
        state.index.remove(&entry.requester_id);
        Ok(Some(entry))
    }

    fn restore(&self, entry: QueueEntry) -> Result<(), WaitlistError> {
        let mut state = self.state.lock().expect("waitlist lock poisoned");
        if let Some(sequence) = state.index.get(&entry.requester_id).copied() {
            return Err(WaitlistError::AlreadyQueued {
                requester_id: entry.requester_id,
                position: state.rank_of_sequence(sequence),
            });
        }

        state.next_sequence = state.next_sequence.max(entry.sequence + 1);
        state.index.insert(entry.requester_id.clone(), entry.sequence);
        state.order.insert(entry.sequence, entry);
        Ok(())
    }

    fn remove(&self, requester_id: &str) -> Result<Option<QueueEntry>, WaitlistError> {
        let mut state = self.state.lock().expect("waitlist lock poisoned");
        let Some(sequence) = state.index.remove(requester_id) else {
            return Ok(None);
        };
        Ok(state.order.remove(&sequence))
    }

    fn position_of(&self, requester_id: &str) -> Result<Option<usize>, WaitlistError> {
        let state = self.state.lock().expect("waitlist lock poisoned");
        Ok(state
            .index
            .get(requester_id)
            .map(|sequence| state.rank_of_sequence(*sequence)))
    }

    fn size(&self) -> Result<usize, WaitlistError> {
        Ok(self.state.lock().expect("waitlist lock poisoned").order.len())
    }

    fn snapshot(&self) -> Result<Vec<QueueEntry>, WaitlistError> {
        Ok(self
            .state
            .lock()
            .expect("waitlist lock poisoned")
            .order
            .values()
            .cloned()
            .collect())
    }
}
