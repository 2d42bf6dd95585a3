use std::fs;
use std::path::PathBuf;

use serde_json::json;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};
use crate::orchestrator::waitlist::QueueEntry;

use super::{SledMode, SledStorage, StorageBackend, StorageEngine, StorageError, expand_home_path};

pub struct StorageFacade {
    engine: StorageEngine,
    data_path: PathBuf,
    backend: Box<dyn StorageBackend>,
}

impl StorageFacade {
    pub fn initialize(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let Ok(engine) = app_config.storage.engine.parse::<StorageEngine>() else {
            return Err(StorageError::UnsupportedEngine {
                engine: app_config.storage.engine.clone(),
            });
        };
        let data_path = expand_home_path(&app_config.storage.path)?;

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Initializing storage facade",
            Some(json!({
                "engine": engine.as_str(),
                "configured_path": app_config.storage.path,
                "resolved_path": data_path.display().to_string(),
                "sled": {
                    "cache_capacity": app_config.storage.sled.cache_capacity,
                    "mode": app_config.storage.sled.mode
                }
            })),
        );

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let backend: Box<dyn StorageBackend> = match engine {
            StorageEngine::Sled => {
                let mode = app_config
                    .storage
                    .sled
                    .mode
                    .as_deref()
                    .map(|raw| {
                        raw.parse::<SledMode>()
                            .map_err(|_| StorageError::InvalidSledMode {
                                mode: raw.to_owned(),
                            })
                    })
                    .transpose()?;

                Box::new(SledStorage::open(
                    &data_path,
                    app_config.storage.sled.cache_capacity,
                    mode,
                )?)
            }
        };

        logger.debug(
            Some("storage::init"),
            &format!("Storage facade ready at {}", data_path.display()),
        );

        Ok(Self {
            engine,
            data_path,
            backend,
        })
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> &PathBuf {
        &self.data_path
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }

    pub fn next_sequence(&self) -> Result<u64, StorageError> {
        self.backend.next_sequence()
    }

    pub fn insert_waitlist_entry(&self, entry: &QueueEntry) -> Result<bool, StorageError> {
        self.backend.insert_waitlist_entry(entry)
    }

    pub fn get_waitlist_entry(&self, requester_id: &str) -> Result<Option<QueueEntry>, StorageError> {
        self.backend.get_waitlist_entry(requester_id)
    }

    pub fn list_waitlist_entries(&self, limit: Option<usize>) -> Result<Vec<QueueEntry>, StorageError> {
        self.backend.list_waitlist_entries(limit)
    }

    pub fn list_waitlist_ids(&self) -> Result<Vec<String>, StorageError> {
        self.backend.list_waitlist_ids()
    }

    pub fn count_waitlist_entries(&self) -> Result<usize, StorageError> {
        self.backend.count_waitlist_entries()
    }

    pub fn remove_waitlist_entry(&self, requester_id: &str) -> Result<Option<QueueEntry>, StorageError> {
        self.backend.remove_waitlist_entry(requester_id)
    }

    pub fn remove_waitlist_entry_if_current(&self, entry: &QueueEntry) -> Result<bool, StorageError> {
        self.backend.remove_waitlist_entry_if_current(entry)
    }
}
