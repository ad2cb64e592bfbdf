// Credential provisioning over mesh vendor messages
// Two request/status opcode pairs carry WiFi and MQTT credentials as plain ASCII;
// every inbound request gets exactly one 2-byte status reply

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::credential_store::{KvStore, SharedCredentialStore};
use crate::credentials::{Credential, MqttCredential, WifiCredential, MAX_FIELD_LEN};
use crate::links::{MeshLink, MessageContext};
use crate::system_state::{EventBus, GatewayEvent};

// Espressif company identifier used for the vendor models
pub const CID_ESP: u16 = 0x02E5;

// Vendor server model ids
pub const WIFI_CONFIG_MODEL_ID: u16 = 0x0001;
pub const MQTT_CONFIG_MODEL_ID: u16 = 0x0003;

/// 3-byte vendor opcode: `0xC00000 | (op << 16) | company_id`
pub const fn vendor_opcode(op: u8, company_id: u16) -> u32 {
    0x00C0_0000 | ((op as u32) << 16) | company_id as u32
}

pub const WIFI_CONFIG_OP_SEND: u32 = vendor_opcode(0x00, CID_ESP);
pub const WIFI_CONFIG_OP_STATUS: u32 = vendor_opcode(0x01, CID_ESP);
pub const MQTT_CONFIG_OP_SEND: u32 = vendor_opcode(0x02, CID_ESP);
pub const MQTT_CONFIG_OP_STATUS: u32 = vendor_opcode(0x03, CID_ESP);

const WIFI_SEPARATOR: u8 = b'.';
const MQTT_SEPARATOR: u8 = b'|';
const MQTT_FIELD_COUNT: usize = 3;

/// Result code carried in a status reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    EmptyMessage,
    AllocationFailure,
    MissingSeparator,
    InvalidFieldCount,
    FieldTooLong,
    StoreFailure,
}

impl StatusCode {
    /// Wire value. MissingSeparator and InvalidFieldCount share code 3.
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Success => 0,
            StatusCode::EmptyMessage => 1,
            StatusCode::AllocationFailure => 2,
            StatusCode::MissingSeparator => 3,
            StatusCode::InvalidFieldCount => 3,
            StatusCode::FieldTooLong => 4,
            StatusCode::StoreFailure => 5,
        }
    }

    pub fn to_le_bytes(&self) -> [u8; 2] {
        self.code().to_le_bytes()
    }

    pub fn is_success(&self) -> bool {
        *self == StatusCode::Success
    }
}

/// Outcome of parsing one config message
pub type ParseOutcome = Result<Credential, StatusCode>;

/// Inbound config request, borrowed from the mesh stack for one parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMessage<'a> {
    WifiConfig(&'a [u8]),
    MqttConfig(&'a [u8]),
}

impl<'a> ConfigMessage<'a> {
    /// None for opcodes that are not config requests
    pub fn from_opcode(opcode: u32, payload: &'a [u8]) -> Option<Self> {
        match opcode {
            WIFI_CONFIG_OP_SEND => Some(ConfigMessage::WifiConfig(payload)),
            MQTT_CONFIG_OP_SEND => Some(ConfigMessage::MqttConfig(payload)),
            _ => None,
        }
    }

    pub fn status_opcode(&self) -> u32 {
        match self {
            ConfigMessage::WifiConfig(_) => WIFI_CONFIG_OP_STATUS,
            ConfigMessage::MqttConfig(_) => MQTT_CONFIG_OP_STATUS,
        }
    }

    pub fn parse(&self) -> ParseOutcome {
        match self {
            ConfigMessage::WifiConfig(payload) => parse_wifi_config(payload).map(Credential::from),
            ConfigMessage::MqttConfig(payload) => parse_mqtt_config(payload).map(Credential::from),
        }
    }
}

// Copy the payload into an owned buffer; the text ends at the first NUL
fn copy_message(payload: &[u8]) -> Result<Vec<u8>, StatusCode> {
    if payload.is_empty() {
        return Err(StatusCode::EmptyMessage);
    }

    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(payload.len() + 1)
        .map_err(|_| StatusCode::AllocationFailure)?;

    let text_len = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    buffer.extend_from_slice(&payload[..text_len]);
    Ok(buffer)
}

/// Parse `<ssid>.<password>`, splitting at the first `.`
pub fn parse_wifi_config(payload: &[u8]) -> Result<WifiCredential, StatusCode> {
    let text = copy_message(payload)?;

    let split = text
        .iter()
        .position(|b| *b == WIFI_SEPARATOR)
        .ok_or(StatusCode::MissingSeparator)?;
    let (ssid, password) = (&text[..split], &text[split + 1..]);

    if ssid.len() > MAX_FIELD_LEN || password.len() > MAX_FIELD_LEN {
        return Err(StatusCode::FieldTooLong);
    }

    WifiCredential::new(
        String::from_utf8_lossy(ssid),
        String::from_utf8_lossy(password),
    )
    .map_err(|_| StatusCode::FieldTooLong)
}

/// Parse `<uri>|<username>|<password>`.
///
/// Empty tokens are skipped and tokens past the third are ignored.
pub fn parse_mqtt_config(payload: &[u8]) -> Result<MqttCredential, StatusCode> {
    let text = copy_message(payload)?;

    let fields: Vec<&[u8]> = text
        .split(|b| *b == MQTT_SEPARATOR)
        .filter(|field| !field.is_empty())
        .take(MQTT_FIELD_COUNT)
        .collect();

    let [uri, username, password] = fields.as_slice() else {
        return Err(StatusCode::InvalidFieldCount);
    };

    MqttCredential::new(
        String::from_utf8_lossy(uri),
        String::from_utf8_lossy(username),
        String::from_utf8_lossy(password),
    )
    .map_err(|_| StatusCode::FieldTooLong)
}

// Handles config requests arriving on the vendor models
pub struct CredentialProtocolHandler<K: KvStore, L: MeshLink> {
    mesh: Arc<L>,
    store: SharedCredentialStore<K>,
    events: EventBus,
}

impl<K: KvStore, L: MeshLink> CredentialProtocolHandler<K, L> {
    pub fn new(mesh: Arc<L>, store: SharedCredentialStore<K>, events: EventBus) -> Self {
        Self {
            mesh,
            store,
            events,
        }
    }

    /// Dispatch a raw vendor message. Returns None for opcodes this handler does not own.
    pub fn handle_raw(
        &self,
        ctx: &MessageContext,
        opcode: u32,
        payload: &[u8],
    ) -> Option<StatusCode> {
        match ConfigMessage::from_opcode(opcode, payload) {
            Some(message) => Some(self.handle(ctx, message)),
            None => {
                debug!("Ignoring vendor opcode 0x{:06x} from 0x{:04x}", opcode, ctx.src);
                None
            }
        }
    }

    /// Validate, persist and acknowledge one config request.
    ///
    /// Exactly one status reply goes back to `ctx`. The orchestrator is notified only
    /// after the credential set has been committed.
    pub fn handle(&self, ctx: &MessageContext, message: ConfigMessage<'_>) -> StatusCode {
        let (status, accepted) = match message.parse() {
            Ok(credential) => {
                log_received(ctx, &credential);
                match self.persist(&credential) {
                    Ok(()) => (StatusCode::Success, Some(credential)),
                    Err(status) => (status, None),
                }
            }
            Err(status) => {
                warn!(
                    "⚠️ Rejected config from 0x{:04x}: {:?} (status {})",
                    ctx.src,
                    status,
                    status.code()
                );
                (status, None)
            }
        };

        if let Err(e) =
            self.mesh
                .send_vendor_status(ctx, message.status_opcode(), &status.to_le_bytes())
        {
            error!("❌ Failed to send config status to 0x{:04x}: {}", ctx.src, e);
        }

        if let Some(credential) = accepted {
            self.events
                .publish(GatewayEvent::CredentialsReceived(credential));
        }

        status
    }

    fn persist(&self, credential: &Credential) -> Result<(), StatusCode> {
        let mut store = self.store.lock().map_err(|_| {
            error!("❌ Credential store lock poisoned");
            StatusCode::StoreFailure
        })?;

        store.save(credential).map_err(|e| {
            error!("❌ Failed to persist {} credentials: {}", credential.kind(), e);
            StatusCode::StoreFailure
        })
    }
}

fn log_received(ctx: &MessageContext, credential: &Credential) {
    match credential {
        Credential::Wifi(wifi) => info!(
            "📶 WiFi config from 0x{:04x}: SSID '{}', password {} chars",
            ctx.src,
            wifi.ssid(),
            wifi.password().len()
        ),
        Credential::Mqtt(mqtt) => info!(
            "📡 MQTT config from 0x{:04x}: broker '{}', user '{}'",
            ctx.src,
            mqtt.uri(),
            mqtt.username()
        ),
    }
}
