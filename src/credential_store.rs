// Credential persistence over a namespaced key-value store
// On the device the store is NVS (see nvs_store.rs); data survives reboots and power cycles

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

// Import logging macros for debug output
use log::{error, info, warn};

use crate::credentials::{
    Credential, CredentialError, CredentialKind, MqttCredential, WifiCredential,
};

// Storage keys - each credential kind lives in its own namespace ("wifi" / "mqtt")
const SSID_KEY: &str = "ssid";
const URI_KEY: &str = "uri";
const USERNAME_KEY: &str = "username";
const PASSWORD_KEY: &str = "password";

/// Every key a credential namespace may hold
pub const CREDENTIAL_KEYS: [&str; 4] = [SSID_KEY, URI_KEY, USERNAME_KEY, PASSWORD_KEY];

/// Namespaced string key-value store with explicit commit.
///
/// Writes made with [`KvStore::set`] are staged until [`KvStore::commit`] succeeds;
/// [`KvStore::discard`] drops staged writes for a namespace.
pub trait KvStore {
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError>;
    fn commit(&mut self, namespace: &str) -> Result<(), StoreError>;
    fn discard(&mut self, namespace: &str);
    /// Remove every key of a namespace
    fn erase(&mut self, namespace: &str) -> Result<(), StoreError>;
}

/// In-memory store with staged writes. Used on hosts and in tests.
#[derive(Debug, Default)]
pub struct MemoryKv {
    committed: HashMap<String, HashMap<String, String>>,
    staged: HashMap<String, HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .committed
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn set(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.staged
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn commit(&mut self, namespace: &str) -> Result<(), StoreError> {
        if let Some(staged) = self.staged.remove(namespace) {
            self.committed
                .entry(namespace.to_string())
                .or_default()
                .extend(staged);
        }
        Ok(())
    }

    fn discard(&mut self, namespace: &str) {
        self.staged.remove(namespace);
    }

    fn erase(&mut self, namespace: &str) -> Result<(), StoreError> {
        self.staged.remove(namespace);
        self.committed.remove(namespace);
        Ok(())
    }
}

/// Credential store shared between the mesh callback context and the orchestrator
pub type SharedCredentialStore<K> = Arc<Mutex<CredentialStore<K>>>;

// Credential storage manager - maps credential sets onto key-value namespaces
pub struct CredentialStore<K: KvStore> {
    kv: K,
}

impl<K: KvStore> CredentialStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    pub fn into_shared(self) -> SharedCredentialStore<K> {
        Arc::new(Mutex::new(self))
    }

    /// Persist a full credential set.
    ///
    /// Either every key is committed or the staged writes are discarded and the
    /// previously stored set stays in place.
    pub fn save(&mut self, credential: &Credential) -> Result<(), StoreError> {
        let kind = credential.kind();
        let namespace = kind.namespace();

        match credential {
            Credential::Wifi(wifi) => {
                info!("💾 Storing WiFi credentials for SSID: {}", wifi.ssid());
            }
            Credential::Mqtt(mqtt) => {
                info!(
                    "💾 Storing MQTT credentials for {} (user {})",
                    mqtt.uri(),
                    mqtt.username()
                );
            }
        }

        let result = fields_of(credential)
            .iter()
            .try_for_each(|(key, value)| self.kv.set(namespace, key, value))
            .and_then(|_| self.kv.commit(namespace));

        if let Err(e) = result {
            error!("❌ Could not commit {} config: {}", kind, e);
            self.kv.discard(namespace);
            return Err(e);
        }

        info!("✅ {} credentials stored", kind);
        Ok(())
    }

    /// Load the stored credential set of one kind
    pub fn load(&mut self, kind: CredentialKind) -> Result<Credential, StoreError> {
        match kind {
            CredentialKind::Wifi => self.load_wifi().map(Credential::from),
            CredentialKind::Mqtt => self.load_mqtt().map(Credential::from),
        }
    }

    pub fn load_wifi(&mut self) -> Result<WifiCredential, StoreError> {
        let kind = CredentialKind::Wifi;
        let ssid = self.required(kind, SSID_KEY)?;
        let password = self.required(kind, PASSWORD_KEY)?;

        let credential = WifiCredential::new(ssid, password).map_err(|e| corrupt(kind, e))?;
        info!("📂 Loaded stored WiFi credentials for SSID: {}", credential.ssid());
        Ok(credential)
    }

    pub fn load_mqtt(&mut self) -> Result<MqttCredential, StoreError> {
        let kind = CredentialKind::Mqtt;
        let uri = self.required(kind, URI_KEY)?;
        let username = self.required(kind, USERNAME_KEY)?;
        let password = self.required(kind, PASSWORD_KEY)?;

        let credential =
            MqttCredential::new(uri, username, password).map_err(|e| corrupt(kind, e))?;
        info!("📂 Loaded stored MQTT credentials for {}", credential.uri());
        Ok(credential)
    }

    pub fn has_stored(&mut self, kind: CredentialKind) -> bool {
        match self.load(kind) {
            Ok(_) => true,
            Err(StoreError::Missing { .. }) => false,
            Err(e) => {
                warn!("⚠️ Stored {} credentials unreadable: {}", kind, e);
                false
            }
        }
    }

    pub fn clear(&mut self, kind: CredentialKind) -> Result<(), StoreError> {
        info!("🧹 Clearing stored {} credentials", kind);
        self.kv.erase(kind.namespace())
    }

    fn required(&mut self, kind: CredentialKind, key: &'static str) -> Result<String, StoreError> {
        self.kv
            .get(kind.namespace(), key)?
            .ok_or(StoreError::Missing {
                namespace: kind.namespace(),
                key,
            })
    }
}

fn corrupt(kind: CredentialKind, e: CredentialError) -> StoreError {
    StoreError::Corrupt {
        namespace: kind.namespace().to_string(),
        reason: e.to_string(),
    }
}

fn fields_of(credential: &Credential) -> Vec<(&'static str, &str)> {
    match credential {
        Credential::Wifi(wifi) => vec![(SSID_KEY, wifi.ssid()), (PASSWORD_KEY, wifi.password())],
        Credential::Mqtt(mqtt) => vec![
            (URI_KEY, mqtt.uri()),
            (USERNAME_KEY, mqtt.username()),
            (PASSWORD_KEY, mqtt.password()),
        ],
    }
}

/// Errors from the persistent key-value collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Namespace could not be opened
    Open { namespace: String, reason: String },
    /// A staged write was rejected
    Write { namespace: String, reason: String },
    /// Staged writes could not be committed
    Commit { namespace: String, reason: String },
    /// A required key is absent
    Missing {
        namespace: &'static str,
        key: &'static str,
    },
    /// Stored value violates credential bounds
    Corrupt { namespace: String, reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Open { namespace, reason } => {
                write!(f, "failed to open namespace {}: {}", namespace, reason)
            }
            StoreError::Write { namespace, reason } => {
                write!(f, "failed to write to namespace {}: {}", namespace, reason)
            }
            StoreError::Commit { namespace, reason } => {
                write!(f, "failed to commit namespace {}: {}", namespace, reason)
            }
            StoreError::Missing { namespace, key } => {
                write!(f, "no value for {}/{}", namespace, key)
            }
            StoreError::Corrupt { namespace, reason } => {
                write!(f, "corrupt data in namespace {}: {}", namespace, reason)
            }
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    // Store whose commits can be made to fail
    #[derive(Default)]
    struct FlakyKv {
        inner: MemoryKv,
        fail_commit: bool,
    }

    impl KvStore for FlakyKv {
        fn get(&mut self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(namespace, key)
        }

        fn set(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.set(namespace, key, value)
        }

        fn commit(&mut self, namespace: &str) -> Result<(), StoreError> {
            if self.fail_commit {
                return Err(StoreError::Commit {
                    namespace: namespace.to_string(),
                    reason: "flash worn out".to_string(),
                });
            }
            self.inner.commit(namespace)
        }

        fn discard(&mut self, namespace: &str) {
            self.inner.discard(namespace)
        }

        fn erase(&mut self, namespace: &str) -> Result<(), StoreError> {
            self.inner.erase(namespace)
        }
    }

    fn wifi(ssid: &str, password: &str) -> Credential {
        WifiCredential::new(ssid, password).unwrap().into()
    }

    #[test]
    fn test_wifi_round_trip() {
        let mut store = CredentialStore::new(MemoryKv::new());
        store.save(&wifi("home", "verysecret")).unwrap();

        let loaded = store.load_wifi().unwrap();
        assert_eq!(loaded.ssid(), "home");
        assert_eq!(loaded.password(), "verysecret");
    }

    #[test]
    fn test_mqtt_round_trip() {
        let mut store = CredentialStore::new(MemoryKv::new());
        let mqtt = MqttCredential::new("mqtt://b", "alice", "pw").unwrap();
        store.save(&mqtt.clone().into()).unwrap();
        assert_eq!(store.load_mqtt().unwrap(), mqtt);
    }

    #[test]
    fn test_load_missing() {
        let mut store = CredentialStore::new(MemoryKv::new());
        assert_eq!(
            store.load(CredentialKind::Mqtt),
            Err(StoreError::Missing {
                namespace: "mqtt",
                key: "uri"
            })
        );
        assert!(!store.has_stored(CredentialKind::Wifi));
    }

    #[test]
    fn test_failed_commit_keeps_previous_set() {
        let mut store = CredentialStore::new(FlakyKv::default());
        store.save(&wifi("home", "first-pass")).unwrap();

        store.kv.fail_commit = true;
        let result = store.save(&wifi("office", "second-pass"));
        assert!(matches!(result, Err(StoreError::Commit { .. })));

        store.kv.fail_commit = false;
        let loaded = store.load_wifi().unwrap();
        assert_eq!(loaded.ssid(), "home");
        assert_eq!(loaded.password(), "first-pass");
    }

    #[test]
    fn test_failed_commit_does_not_leak_into_next_save() {
        let mut store = CredentialStore::new(FlakyKv::default());
        store.kv.fail_commit = true;
        assert!(store.save(&wifi("office", "pw")).is_err());
        assert!(!store.has_stored(CredentialKind::Wifi));
    }

    #[test]
    fn test_namespaces_are_independent() {
        let mut store = CredentialStore::new(MemoryKv::new());
        store.save(&wifi("home", "wifi-pass")).unwrap();
        store
            .save(&MqttCredential::new("mqtt://b", "alice", "mqtt-pass").unwrap().into())
            .unwrap();

        assert_eq!(store.load_wifi().unwrap().password(), "wifi-pass");
        assert_eq!(store.load_mqtt().unwrap().password(), "mqtt-pass");
    }

    #[test]
    fn test_clear() {
        let mut store = CredentialStore::new(MemoryKv::new());
        store.save(&wifi("home", "pw")).unwrap();
        assert!(store.has_stored(CredentialKind::Wifi));

        store.clear(CredentialKind::Wifi).unwrap();
        assert!(!store.has_stored(CredentialKind::Wifi));
    }

    #[test]
    fn test_corrupt_value_rejected() {
        let mut kv = MemoryKv::new();
        kv.set("wifi", "ssid", &"x".repeat(40)).unwrap();
        kv.set("wifi", "password", "pw").unwrap();
        kv.commit("wifi").unwrap();

        let mut store = CredentialStore::new(kv);
        assert!(matches!(
            store.load(CredentialKind::Wifi),
            Err(StoreError::Corrupt { ref namespace, .. }) if namespace == "wifi"
        ));
    }
}
