//! BLE mesh to MQTT gateway firmware library.
//!
//! Credential provisioning, connectivity orchestration and the store-and-forward
//! relay are platform independent and tested on the host. Driver bindings for
//! ESP-IDF are compiled only for the device target.

pub mod config;
pub mod connectivity;
pub mod credential_store;
pub mod credentials;
pub mod gateway;
pub mod links;
pub mod mesh_protocol;
pub mod relay_queue;
pub mod system_state;
pub mod telemetry;

#[cfg(target_os = "espidf")]
pub mod mesh_node;
#[cfg(target_os = "espidf")]
pub mod mqtt_client;
#[cfg(target_os = "espidf")]
pub mod nvs_store;
#[cfg(target_os = "espidf")]
pub mod wifi_client;

// Re-export commonly used items
pub use config::GatewayConfig;
pub use connectivity::{transition, ConnectivityOrchestrator, Effect, KnownCredentials, LinkEvent};
pub use credential_store::{CredentialStore, KvStore, MemoryKv, SharedCredentialStore, StoreError};
pub use credentials::{Credential, CredentialError, CredentialKind, MqttCredential, WifiCredential};
pub use gateway::{Gateway, GatewayRuntime, MeshEvent, MeshFrontend};
pub use links::{LinkError, MeshLink, MessageContext, MqttLink, WifiLink};
pub use mesh_protocol::{ConfigMessage, CredentialProtocolHandler, StatusCode};
pub use relay_queue::{
    Delivery, DrainOutcome, FileLog, LineLog, MemoryLog, RelayBus, RelayError, RelayQueue,
    RelayService,
};
pub use system_state::{ConnectivityCell, ConnectivityState, EventBus, GatewayEvent};
pub use telemetry::TelemetryRelay;
