// Seams to the radio, WiFi and MQTT drivers
// Device implementations live in mesh_node.rs, wifi_client.rs and mqtt_client.rs;
// tests plug in recording fakes

use std::fmt;

use crate::credentials::{MqttCredential, WifiCredential};

/// Addressing of an inbound mesh message, used to route the status reply back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageContext {
    pub src: u16,
    pub dst: u16,
    pub net_idx: u16,
    pub app_idx: u16,
    /// Receiving model, as an opaque handle owned by the mesh stack
    pub model: usize,
}

/// Outbound side of the mesh vendor models
pub trait MeshLink: Send + Sync {
    fn send_vendor_status(
        &self,
        ctx: &MessageContext,
        opcode: u32,
        payload: &[u8],
    ) -> Result<(), LinkError>;
}

/// WiFi station driver. Link changes arrive as `GatewayEvent::Wifi*`.
pub trait WifiLink: Send + Sync {
    fn connect(&self, credential: &WifiCredential) -> Result<(), LinkError>;
    fn is_connected(&self) -> bool;
}

/// MQTT client driver. Session changes arrive as `GatewayEvent::Mqtt*`.
pub trait MqttLink: Send + Sync {
    fn start(&self, credential: &MqttCredential) -> Result<(), LinkError>;
    fn stop(&self);
    fn publish(&self, topic: &str, payload: &str) -> Result<(), LinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    NotStarted,
    Failed(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::NotStarted => write!(f, "link not started"),
            LinkError::Failed(msg) => write!(f, "link failure: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {}
