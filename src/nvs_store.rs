// Import ESP-IDF's NVS (Non-Volatile Storage) functionality
// NVS is a key-value storage system that persists data in flash memory
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::sys::EspError;

use std::collections::HashMap;

use log::{info, warn};

use crate::credential_store::{KvStore, StoreError, CREDENTIAL_KEYS};

// Longest value read back; credential fields are far shorter
const VALUE_BUFFER_LEN: usize = 128;

// NVS-backed key-value store with staged writes per namespace
pub struct NvsKv {
    partition: EspDefaultNvsPartition,
    handles: HashMap<String, EspNvs<NvsDefault>>,
    staged: HashMap<String, Vec<(String, String)>>,
}

impl NvsKv {
    /// Create the store on the provided partition (avoids singleton conflicts)
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            handles: HashMap::new(),
            staged: HashMap::new(),
        }
    }

    fn handle(&mut self, namespace: &str) -> Result<&mut EspNvs<NvsDefault>, StoreError> {
        if !self.handles.contains_key(namespace) {
            let nvs = EspNvs::new(self.partition.clone(), namespace, true)
                .map_err(|e| open_error(namespace, e))?;
            info!("💾 Opened NVS namespace '{}'", namespace);
            self.handles.insert(namespace.to_string(), nvs);
        }

        self.handles
            .get_mut(namespace)
            .ok_or_else(|| StoreError::Open {
                namespace: namespace.to_string(),
                reason: "handle missing".to_string(),
            })
    }
}

impl KvStore for NvsKv {
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        let nvs = self.handle(namespace)?;
        let mut buffer = [0u8; VALUE_BUFFER_LEN];
        nvs.get_str(key, &mut buffer)
            .map(|value| value.map(str::to_string))
            .map_err(|e| StoreError::Corrupt {
                namespace: namespace.to_string(),
                reason: format!("{}: {:?}", key, e),
            })
    }

    fn set(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.staged
            .entry(namespace.to_string())
            .or_default()
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    // NVS commits every set on its own; previous values are written back
    // if any key of the set fails
    fn commit(&mut self, namespace: &str) -> Result<(), StoreError> {
        let Some(staged) = self.staged.remove(namespace) else {
            return Ok(());
        };

        let nvs = self.handle(namespace)?;
        let mut written: Vec<(String, Option<String>)> = Vec::new();

        for (key, value) in &staged {
            let mut buffer = [0u8; VALUE_BUFFER_LEN];
            let previous = nvs
                .get_str(key, &mut buffer)
                .ok()
                .flatten()
                .map(str::to_string);

            if let Err(e) = nvs.set_str(key, value) {
                warn!("⚠️ NVS write of {}/{} failed, rolling back", namespace, key);
                for (key, previous) in written.iter().rev() {
                    let restored = match previous {
                        Some(previous) => nvs.set_str(key, previous).map(|_| ()),
                        None => nvs.remove(key).map(|_| ()),
                    };
                    if let Err(e) = restored {
                        warn!("⚠️ Rollback of {}/{} failed: {:?}", namespace, key, e);
                    }
                }
                return Err(StoreError::Commit {
                    namespace: namespace.to_string(),
                    reason: format!("{:?}", e),
                });
            }
            written.push((key.clone(), previous));
        }

        Ok(())
    }

    fn discard(&mut self, namespace: &str) {
        self.staged.remove(namespace);
    }

    fn erase(&mut self, namespace: &str) -> Result<(), StoreError> {
        self.staged.remove(namespace);
        let nvs = self.handle(namespace)?;
        for key in CREDENTIAL_KEYS {
            nvs.remove(key).map_err(|e| StoreError::Write {
                namespace: namespace.to_string(),
                reason: format!("{}: {:?}", key, e),
            })?;
        }
        info!("🧹 Erased NVS namespace '{}'", namespace);
        Ok(())
    }
}

fn open_error(namespace: &str, e: EspError) -> StoreError {
    StoreError::Open {
        namespace: namespace.to_string(),
        reason: format!("{:?}", e),
    }
}
