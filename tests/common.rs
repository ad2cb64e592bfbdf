//! Recording fakes for the radio, WiFi and MQTT drivers plus gateway fixtures.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mesh_gateway::{
    EventBus, Gateway, GatewayConfig, KvStore, LineLog, LinkError, MemoryKv, MeshLink,
    MessageContext, MqttCredential, MqttLink, StoreError, WifiCredential, WifiLink,
};

/// Status replies as `(ctx, opcode, payload)`
#[derive(Default)]
pub struct RecordingMesh {
    pub sent: Mutex<Vec<(MessageContext, u32, Vec<u8>)>>,
}

impl RecordingMesh {
    pub fn statuses(&self) -> Vec<(u32, u16)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, opcode, payload)| (*opcode, u16::from_le_bytes([payload[0], payload[1]])))
            .collect()
    }
}

impl MeshLink for RecordingMesh {
    fn send_vendor_status(
        &self,
        ctx: &MessageContext,
        opcode: u32,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        self.sent
            .lock()
            .unwrap()
            .push((*ctx, opcode, payload.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingWifi {
    pub connects: Mutex<Vec<(String, String)>>,
    pub link_down: AtomicBool,
}

impl WifiLink for RecordingWifi {
    fn connect(&self, credential: &WifiCredential) -> Result<(), LinkError> {
        self.connects
            .lock()
            .unwrap()
            .push((credential.ssid().to_string(), credential.password().to_string()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.link_down.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct RecordingMqtt {
    pub starts: Mutex<Vec<(String, String, String)>>,
    pub stops: Mutex<usize>,
    pub published: Mutex<Vec<(String, String)>>,
}

impl RecordingMqtt {
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

impl MqttLink for RecordingMqtt {
    fn start(&self, credential: &MqttCredential) -> Result<(), LinkError> {
        self.starts.lock().unwrap().push((
            credential.uri().to_string(),
            credential.username().to_string(),
            credential.password().to_string(),
        ));
        Ok(())
    }

    fn stop(&self) {
        *self.stops.lock().unwrap() += 1;
    }

    fn publish(&self, topic: &str, payload: &str) -> Result<(), LinkError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }
}

/// Key-value store the test keeps a handle on after the gateway takes ownership
#[derive(Clone, Default)]
pub struct SharedKv(pub Arc<Mutex<MemoryKv>>);

impl KvStore for SharedKv {
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.0.lock().unwrap().get(namespace, key)
    }

    fn set(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.0.lock().unwrap().set(namespace, key, value)
    }

    fn commit(&mut self, namespace: &str) -> Result<(), StoreError> {
        self.0.lock().unwrap().commit(namespace)
    }

    fn discard(&mut self, namespace: &str) {
        self.0.lock().unwrap().discard(namespace)
    }

    fn erase(&mut self, namespace: &str) -> Result<(), StoreError> {
        self.0.lock().unwrap().erase(namespace)
    }
}

pub struct Harness<G: LineLog> {
    pub gateway: Gateway<SharedKv, RecordingMesh, RecordingWifi, RecordingMqtt, G>,
    pub kv: SharedKv,
    pub mesh: Arc<RecordingMesh>,
    pub wifi: Arc<RecordingWifi>,
    pub mqtt: Arc<RecordingMqtt>,
    pub events: EventBus,
}

pub fn harness_with<G: LineLog>(kv: SharedKv, relay_log: G) -> Harness<G> {
    let mesh = Arc::new(RecordingMesh::default());
    let wifi = Arc::new(RecordingWifi::default());
    let mqtt = Arc::new(RecordingMqtt::default());
    let events = EventBus::new();

    let gateway = Gateway::build(
        &GatewayConfig::default(),
        kv.clone(),
        relay_log,
        mesh.clone(),
        wifi.clone(),
        mqtt.clone(),
        events.clone(),
    );

    Harness {
        gateway,
        kv,
        mesh,
        wifi,
        mqtt,
        events,
    }
}

pub fn harness<G: LineLog>(relay_log: G) -> Harness<G> {
    harness_with(SharedKv::default(), relay_log)
}

pub fn ctx() -> MessageContext {
    MessageContext {
        src: 0x0005,
        dst: 0x0001,
        net_idx: 0,
        app_idx: 0,
        model: 1,
    }
}
