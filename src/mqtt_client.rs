// MQTT uplink over the ESP-IDF MQTT client
// Session state changes are forwarded to the gateway event bus from a polling thread

// Import ESP-IDF MQTT client functionality
use esp_idf_svc::mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration};

use embedded_svc::mqtt::client::{EventPayload, QoS};

use log::{debug, error, info, warn};

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::credentials::MqttCredential;
use crate::links::{LinkError, MqttLink};
use crate::system_state::{EventBus, GatewayEvent};

const POLL_THREAD_STACK_SIZE: usize = 6144;
const RECONNECT_TIMEOUT_SECONDS: u64 = 10;

/// Broker session settings that do not come from provisioning
#[derive(Debug, Clone)]
pub struct MqttSessionConfig {
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
}

pub struct EspMqttLink {
    session: MqttSessionConfig,
    client: Mutex<Option<EspMqttClient<'static>>>,
    events: EventBus,
}

impl EspMqttLink {
    pub fn new(session: MqttSessionConfig, events: EventBus) -> Self {
        Self {
            session,
            client: Mutex::new(None),
            events,
        }
    }

    fn spawn_poller(&self, mut connection: EspMqttConnection) -> Result<(), LinkError> {
        let events = self.events.clone();
        thread::Builder::new()
            .name("mqtt-poll".to_string())
            .stack_size(POLL_THREAD_STACK_SIZE)
            .spawn(move || {
                // Ends once the owning client is dropped
                while let Ok(event) = connection.next() {
                    match event.payload() {
                        EventPayload::Connected(_) => {
                            info!("✅ MQTT connected");
                            events.publish(GatewayEvent::MqttConnected);
                        }
                        EventPayload::Disconnected => {
                            warn!("⚠️ MQTT disconnected");
                            events.publish(GatewayEvent::MqttDisconnected);
                        }
                        EventPayload::Error(e) => warn!("⚠️ MQTT error: {:?}", e),
                        other => debug!("MQTT event: {:?}", other),
                    }
                }
                info!("🔌 MQTT connection closed");
            })
            .map(|_| ())
            .map_err(|e| LinkError::Failed(format!("poll thread: {}", e)))
    }
}

impl MqttLink for EspMqttLink {
    fn start(&self, credential: &MqttCredential) -> Result<(), LinkError> {
        let mut slot = self
            .client
            .lock()
            .map_err(|_| LinkError::Failed("MQTT client lock poisoned".to_string()))?;

        // Replace any running session
        slot.take();

        let config = MqttClientConfiguration {
            client_id: self.session.client_id.as_deref(),
            username: Some(credential.username()),
            password: Some(credential.password()),
            keep_alive_interval: Some(Duration::from_secs(self.session.keep_alive_secs)),
            reconnect_timeout: Some(Duration::from_secs(RECONNECT_TIMEOUT_SECONDS)),
            ..Default::default()
        };

        info!(
            "🔌 Connecting to MQTT broker {} as {}",
            credential.uri(),
            credential.username()
        );
        let (client, connection) = EspMqttClient::new(credential.uri(), &config)
            .map_err(|e| LinkError::Failed(format!("{:?}", e)))?;

        self.spawn_poller(connection)?;
        *slot = Some(client);
        Ok(())
    }

    fn stop(&self) {
        match self.client.lock() {
            Ok(mut slot) => {
                if slot.take().is_some() {
                    info!("🔌 MQTT client stopped");
                }
            }
            Err(_) => error!("❌ MQTT client lock poisoned"),
        }
    }

    fn publish(&self, topic: &str, payload: &str) -> Result<(), LinkError> {
        let mut slot = self
            .client
            .lock()
            .map_err(|_| LinkError::Failed("MQTT client lock poisoned".to_string()))?;
        let client = slot.as_mut().ok_or(LinkError::NotStarted)?;

        client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes())
            .map(|id| debug!("📤 Published {} (msg id {})", topic, id))
            .map_err(|e| LinkError::Failed(format!("{:?}", e)))
    }
}
