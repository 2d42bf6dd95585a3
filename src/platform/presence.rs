use std::collections::HashMap;
use std::sync::RwLock;

use super::{ConnectError, Connector, Directory, Location};

/// Last reported location per identity. Backs both directory lookups and
/// connection moves when the process runs standalone.
#[derive(Default)]
pub struct PresenceRegistry {
    locations: RwLock<HashMap<String, Location>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records where `identity` is now; `None` marks it as unreachable.
    pub fn record(&self, identity: &str, location: Option<Location>) {
        let mut locations = self.locations.write().expect("presence lock poisoned");
        match location {
            Some(location) => {
                locations.insert(identity.to_owned(), location);
            }
            None => {
                locations.remove(identity);
            }
        }
    }

    pub fn forget(&self, identity: &str) {
        self.record(identity, None);
    }

    pub fn count(&self) -> usize {
        self.locations.read().expect("presence lock poisoned").len()
    }
}

impl Directory for PresenceRegistry {
    fn locate(&self, identity: &str) -> Option<Location> {
        self.locations
            .read()
            .expect("presence lock poisoned")
            .get(identity)
            .cloned()
    }
}

impl Connector for PresenceRegistry {
    fn connect(&self, requester_id: &str, target: &Location) -> Result<(), ConnectError> {
        let mut locations = self.locations.write().expect("presence lock poisoned");
        let Some(current) = locations.get_mut(requester_id) else {
            return Err(ConnectError::RequesterUnreachable {
                requester_id: requester_id.to_owned(),
            });
        };
        *current = target.clone();
        Ok(())
    }
}
