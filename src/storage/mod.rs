mod backend;
mod engine;
mod error;
mod facade;
mod path;
mod sled_backend;

pub use backend::StorageBackend;
pub use engine::{SledMode, StorageEngine};
pub use error::StorageError;
pub use facade::StorageFacade;
use path::expand_home_path;
pub use sled_backend::SledStorage;

#[cfg(test)]
pub(crate) mod testing {
    use crate::config::{AppConfig, StorageConfig};
    use crate::logging::testing::quiet_logger;

    use super::{StorageError, StorageFacade};

    pub(crate) fn unique_temp_path(label: &str) -> String {
        let path = std::env::temp_dir().join(format!(
            "assistq-storage-test-{label}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        path.to_string_lossy().to_string()
    }

    pub(crate) fn open_storage(path: &str) -> Result<StorageFacade, StorageError> {
        let app_config = AppConfig {
            storage: StorageConfig {
                path: path.to_owned(),
                ..StorageConfig::default()
            },
            ..AppConfig::default()
        };
        StorageFacade::initialize(&app_config, &quiet_logger())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::config::{AppConfig, SledConfig, StorageConfig};
    use crate::logging::testing::quiet_logger;
    use crate::orchestrator::waitlist::QueueEntry;
    use crate::storage::{StorageEngine, StorageError, StorageFacade};

    use super::expand_home_path;
    use super::testing::{open_storage, unique_temp_path};

    fn entry(id: &str, sequence: u64, age_ms: i64) -> QueueEntry {
        QueueEntry {
            requester_id: id.to_owned(),
            display_name: id.to_uppercase(),
            enqueued_at: Utc::now() - Duration::milliseconds(age_ms),
            sequence,
            group_members: Vec::new(),
            topic: None,
        }
    }

    #[test]
    fn expands_tilde_prefix_to_home() {
        let home = std::env::var("HOME").expect("HOME should be available in tests");
        let expanded = expand_home_path("~/.assistq/data").expect("expansion should work");
        assert_eq!(expanded, std::path::Path::new(&home).join(".assistq/data"));
    }

    #[test]
    fn expands_home_env_prefix() {
        let home = std::env::var("HOME").expect("HOME should be available in tests");
        let expanded = expand_home_path("$HOME/.assistq/data").expect("expansion should work");
        assert_eq!(expanded, std::path::Path::new(&home).join(".assistq/data"));
    }

    #[test]
    fn keeps_absolute_paths_unchanged() {
        let expanded = expand_home_path("/var/lib/assistq/data").expect("expansion should work");
        assert_eq!(expanded, std::path::PathBuf::from("/var/lib/assistq/data"));
    }

    #[test]
    fn rejects_unknown_engine_and_sled_mode() {
        let path = unique_temp_path("bad-config");
        let logger = quiet_logger();

        let unknown_engine = AppConfig {
            storage: StorageConfig {
                engine: "rocksdb".to_owned(),
                path: path.clone(),
                ..StorageConfig::default()
            },
            ..AppConfig::default()
        };
        let err = StorageFacade::initialize(&unknown_engine, &logger)
            .err()
            .expect("unknown engine should fail");
        assert!(matches!(err, StorageError::UnsupportedEngine { .. }));

        let bad_mode = AppConfig {
            storage: StorageConfig {
                path: path.clone(),
                sled: SledConfig {
                    cache_capacity: None,
                    mode: Some("turbo".to_owned()),
                },
                ..StorageConfig::default()
            },
            ..AppConfig::default()
        };
        let err = StorageFacade::initialize(&bad_mode, &logger)
            .err()
            .expect("unknown sled mode should fail");
        assert!(matches!(err, StorageError::InvalidSledMode { .. }));

        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn insert_is_refused_while_identity_is_present() {
        let path = unique_temp_path("insert-if-absent");
        let storage = open_storage(&path).expect("storage init should work");
        assert_eq!(storage.engine(), StorageEngine::Sled);
        assert!(storage.data_path().to_string_lossy().contains("assistq-storage-test"));

        assert!(storage.insert_waitlist_entry(&entry("ada", 1, 0)).expect("insert"));
        assert!(!storage.insert_waitlist_entry(&entry("ada", 2, 0)).expect("insert"));

        let stored = storage
            .get_waitlist_entry("ada")
            .expect("lookup should work")
            .expect("entry should exist");
        assert_eq!(stored.sequence, 1);
        assert_eq!(storage.count_waitlist_entries().expect("count"), 1);

        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn index_orders_by_enqueue_time_then_sequence() {
        let path = unique_temp_path("fifo-index");
        let storage = open_storage(&path).expect("storage init should work");

        let shared = entry("tie-late", 9, 1_000);
        let mut tie_early = shared.clone();
        tie_early.requester_id = "tie-early".to_owned();
        tie_early.sequence = 4;

        storage.insert_waitlist_entry(&entry("newest", 1, 10)).expect("insert");
        storage.insert_waitlist_entry(&shared).expect("insert");
        storage.insert_waitlist_entry(&entry("oldest", 2, 5_000)).expect("insert");
        storage.insert_waitlist_entry(&tie_early).expect("insert");

        assert_eq!(
            storage.list_waitlist_ids().expect("ids"),
            vec!["oldest", "tie-early", "tie-late", "newest"]
        );
        let window = storage.list_waitlist_entries(Some(2)).expect("window");
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].requester_id, "oldest");
        assert_eq!(window[1].requester_id, "tie-early");

        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn remove_drops_primary_and_index_records() {
        let path = unique_temp_path("remove");
        let storage = open_storage(&path).expect("storage init should work");

        storage.insert_waitlist_entry(&entry("ada", 1, 20)).expect("insert");
        storage.insert_waitlist_entry(&entry("bo", 2, 10)).expect("insert");

        let removed = storage.remove_waitlist_entry("ada").expect("remove");
        assert_eq!(removed.map(|entry| entry.requester_id).as_deref(), Some("ada"));
        assert!(storage.remove_waitlist_entry("ada").expect("remove").is_none());
        assert!(storage.get_waitlist_entry("ada").expect("lookup").is_none());
        assert_eq!(storage.list_waitlist_ids().expect("ids"), vec!["bo"]);

        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn conditional_remove_refuses_a_newer_incarnation() {
        let path = unique_temp_path("conditional-remove");
        let storage = open_storage(&path).expect("storage init should work");

        let stale = entry("ada", 1, 50);
        storage.insert_waitlist_entry(&stale).expect("insert");
        storage.remove_waitlist_entry("ada").expect("remove");
        let fresh = entry("ada", 2, 0);
        storage.insert_waitlist_entry(&fresh).expect("insert");

        assert!(!storage.remove_waitlist_entry_if_current(&stale).expect("cas"));
        assert_eq!(storage.count_waitlist_entries().expect("count"), 1);
        assert!(storage.remove_waitlist_entry_if_current(&fresh).expect("cas"));
        assert!(!storage.remove_waitlist_entry_if_current(&fresh).expect("cas"));
        assert_eq!(storage.count_waitlist_entries().expect("count"), 0);

        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn sequences_increase_monotonically() {
        let path = unique_temp_path("sequence");
        let storage = open_storage(&path).expect("storage init should work");

        let first = storage.next_sequence().expect("sequence");
        let second = storage.next_sequence().expect("sequence");
        assert!(second > first);

        let _ = std::fs::remove_dir_all(path);
    }
}
