// Credential types delivered over the mesh provisioning channel
// Every field is a bounded string; values are validated once and never mutated afterwards

use std::fmt;

/// Maximum length in bytes of every credential field (SSID, passwords, URI, username)
pub const MAX_FIELD_LEN: usize = 32;

/// Which credential set a value belongs to. Also selects the key-value namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    Wifi,
    Mqtt,
}

impl CredentialKind {
    /// Persistent key-value namespace for this kind
    pub fn namespace(&self) -> &'static str {
        match self {
            CredentialKind::Wifi => "wifi",
            CredentialKind::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

// WiFi station credentials
#[derive(Clone, PartialEq, Eq)]
pub struct WifiCredential {
    ssid: String,
    password: String,
}

impl WifiCredential {
    pub fn new(
        ssid: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let ssid = ssid.into();
        let password = password.into();
        check_len("ssid", &ssid)?;
        check_len("password", &password)?;
        Ok(Self { ssid, password })
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

// Passwords stay out of debug output and logs
impl fmt::Debug for WifiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredential")
            .field("ssid", &self.ssid)
            .field("password", &format_args!("[{} chars]", self.password.len()))
            .finish()
    }
}

// MQTT broker credentials
#[derive(Clone, PartialEq, Eq)]
pub struct MqttCredential {
    uri: String,
    username: String,
    password: String,
}

impl MqttCredential {
    pub fn new(
        uri: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let uri = uri.into();
        let username = username.into();
        let password = password.into();
        check_len("uri", &uri)?;
        check_len("username", &username)?;
        check_len("password", &password)?;
        Ok(Self {
            uri,
            username,
            password,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for MqttCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttCredential")
            .field("uri", &self.uri)
            .field("username", &self.username)
            .field("password", &format_args!("[{} chars]", self.password.len()))
            .finish()
    }
}

/// A validated credential of either kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Wifi(WifiCredential),
    Mqtt(MqttCredential),
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::Wifi(_) => CredentialKind::Wifi,
            Credential::Mqtt(_) => CredentialKind::Mqtt,
        }
    }
}

impl From<WifiCredential> for Credential {
    fn from(credential: WifiCredential) -> Self {
        Credential::Wifi(credential)
    }
}

impl From<MqttCredential> for Credential {
    fn from(credential: MqttCredential) -> Self {
        Credential::Mqtt(credential)
    }
}

fn check_len(field: &'static str, value: &str) -> Result<(), CredentialError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(CredentialError::FieldTooLong {
            field,
            len: value.len(),
            max: MAX_FIELD_LEN,
        });
    }
    Ok(())
}

/// Errors raised while building a credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// A field exceeds its bound
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::FieldTooLong { field, len, max } => {
                write!(f, "{} too long: {} bytes (max {})", field, len, max)
            }
        }
    }
}

impl std::error::Error for CredentialError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wifi_credential_at_bound() {
        let ssid = "s".repeat(MAX_FIELD_LEN);
        let password = "p".repeat(MAX_FIELD_LEN);
        let credential = WifiCredential::new(ssid.clone(), password.clone()).unwrap();
        assert_eq!(credential.ssid(), ssid);
        assert_eq!(credential.password(), password);
    }

    #[test]
    fn test_wifi_credential_too_long() {
        let result = WifiCredential::new("s".repeat(MAX_FIELD_LEN + 1), "pw");
        assert_eq!(
            result,
            Err(CredentialError::FieldTooLong {
                field: "ssid",
                len: 33,
                max: 32
            })
        );
    }

    #[test]
    fn test_mqtt_credential_password_too_long() {
        let result = MqttCredential::new("mqtt://b", "alice", "x".repeat(40));
        assert!(matches!(
            result,
            Err(CredentialError::FieldTooLong {
                field: "password",
                ..
            })
        ));
    }

    #[test]
    fn test_debug_hides_passwords() {
        let wifi = WifiCredential::new("home", "verysecret").unwrap();
        let mqtt = MqttCredential::new("mqtt://b", "alice", "pw-secret").unwrap();
        assert!(!format!("{:?}", wifi).contains("verysecret"));
        assert!(!format!("{:?}", mqtt).contains("pw-secret"));
        assert!(format!("{:?}", mqtt).contains("alice"));
    }

    #[test]
    fn test_kind_and_namespace() {
        let credential: Credential = WifiCredential::new("a", "b").unwrap().into();
        assert_eq!(credential.kind(), CredentialKind::Wifi);
        assert_eq!(CredentialKind::Wifi.namespace(), "wifi");
        assert_eq!(CredentialKind::Mqtt.to_string(), "mqtt");
    }
}
