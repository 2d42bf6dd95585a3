mod notifier;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::server::PersistentConnection;

pub use notifier::ConnectionNotifier;

#[derive(Debug, PartialEq, Eq)]
pub enum PoolError {
    ConnectionNotFound { connection_id: u64 },
    IdentityAlreadyBound {
        connection_id: u64,
        bound: String,
        requested: String,
    },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionNotFound { connection_id } => {
                write!(f, "connection {connection_id} not found")
            }
            Self::IdentityAlreadyBound {
                connection_id,
                bound,
                requested,
            } => write!(
                f,
                "connection {connection_id} already speaks for '{bound}', cannot rebind to '{requested}'"
            ),
        }
    }
}

impl std::error::Error for PoolError {}

struct ConnectionRecord {
    connection_id: u64,
    connection: Arc<PersistentConnection>,
    connected_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    identity: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ConnectionSnapshot {
    pub connection_id: u64,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub identity: Option<String>,
}

#[derive(Default)]
struct PoolState {
    records: HashMap<u64, ConnectionRecord>,
    by_identity: HashMap<String, u64>,
}

/// Open client connections and the identity each one speaks for. An
/// identity is reachable through at most one connection; a newer binding
/// takes over from an older one.
#[derive(Default)]
pub struct ConnectionPool {
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<PersistentConnection>) -> u64 {
        let connection_id = connection.id();
        let now = Utc::now();
        let record = ConnectionRecord {
            connection_id,
            connection,
            connected_at: now,
            last_seen_at: now,
            identity: None,
        };

        self.state
            .lock()
            .expect("connection pool lock poisoned")
            .records
            .insert(connection_id, record);

        connection_id
    }

    pub fn bind_identity(&self, connection_id: u64, identity: &str) -> Result<(), PoolError> {
        let mut state = self.state.lock().expect("connection pool lock poisoned");
        let record = state
            .records
            .get_mut(&connection_id)
            .ok_or(PoolError::ConnectionNotFound { connection_id })?;

        match record.identity.as_deref() {
            Some(bound) if bound == identity => return Ok(()),
            Some(bound) => {
                return Err(PoolError::IdentityAlreadyBound {
                    connection_id,
                    bound: bound.to_owned(),
                    requested: identity.to_owned(),
                });
            }
            None => record.identity = Some(identity.to_owned()),
        }

        if let Some(previous) = state.by_identity.insert(identity.to_owned(), connection_id) {
            if let Some(stale) = state.records.get_mut(&previous) {
                stale.identity = None;
            }
        }
        Ok(())
    }

    pub fn bound_identity(&self, connection_id: u64) -> Option<String> {
        self.state
            .lock()
            .expect("connection pool lock poisoned")
            .records
            .get(&connection_id)
            .and_then(|record| record.identity.clone())
    }

    pub fn connection_for(&self, identity: &str) -> Option<Arc<PersistentConnection>> {
        let state = self.state.lock().expect("connection pool lock poisoned");
        let connection_id = state.by_identity.get(identity)?;
        state
            .records
            .get(connection_id)
            .map(|record| Arc::clone(&record.connection))
    }

    pub fn touch_now(&self, connection_id: u64) -> Result<(), PoolError> {
        let mut state = self.state.lock().expect("connection pool lock poisoned");
        let record = state
            .records
            .get_mut(&connection_id)
            .ok_or(PoolError::ConnectionNotFound { connection_id })?;
        record.last_seen_at = Utc::now();
        Ok(())
    }

    pub fn snapshot(&self, connection_id: u64) -> Option<ConnectionSnapshot> {
        self.state
            .lock()
            .expect("connection pool lock poisoned")
            .records
            .get(&connection_id)
            .map(|record| ConnectionSnapshot {
                connection_id: record.connection_id,
                connected_at: record.connected_at,
                last_seen_at: record.last_seen_at,
                identity: record.identity.clone(),
            })
    }

    pub fn active_connections(&self) -> Vec<(u64, Arc<PersistentConnection>)> {
        self.state
            .lock()
            .expect("connection pool lock poisoned")
            .records
            .values()
            .map(|record| (record.connection_id, Arc::clone(&record.connection)))
            .collect()
    }

    /// Closes the connection and returns the identity it was bound to.
    pub fn terminate(&self, connection_id: u64) -> Result<Option<String>, PoolError> {
        let mut state = self.state.lock().expect("connection pool lock poisoned");
        let record = state
            .records
            .remove(&connection_id)
            .ok_or(PoolError::ConnectionNotFound { connection_id })?;

        if let Some(identity) = record.identity.as_deref() {
            if state.by_identity.get(identity) == Some(&connection_id) {
                state.by_identity.remove(identity);
            }
        }
        drop(state);

        let _ = record.connection.shutdown();
        Ok(record.identity)
    }

    pub fn terminate_all(&self) {
        let mut state = self.state.lock().expect("connection pool lock poisoned");
        for record in state.records.values() {
            let _ = record.connection.shutdown();
        }
        state.records.clear();
        state.by_identity.clear();
    }

    pub fn count(&self) -> usize {
        self.state
            .lock()
            .expect("connection pool lock poisoned")
            .records
            .len()
    }
}
