// Import ESP-IDF event loop for handling system events
// The event loop delivers WiFi association changes and IP assignment
use esp_idf_svc::eventloop::{EspSubscription, EspSystemEventLoop, System};

// Import peripheral trait for hardware access
use esp_idf_hal::modem::WifiModemPeripheral;
use esp_idf_hal::peripheral::Peripheral;

use esp_idf_svc::netif::IpEvent;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sys::{esp, EspError};
use esp_idf_svc::wifi::{EspWifi, WifiEvent};

use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};

use log::{info, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::credentials::WifiCredential;
use crate::links::{LinkError, WifiLink};
use crate::system_state::{EventBus, GatewayEvent};

// WiFi station driver feeding link changes into the gateway event bus
pub struct EspWifiLink {
    wifi: Mutex<EspWifi<'static>>,
    connected: Arc<AtomicBool>,
    wanted: Arc<AtomicBool>,
    // Kept alive for the lifetime of the link
    _subscriptions: Mutex<Vec<EspSubscription<'static, System>>>,
}

impl EspWifiLink {
    pub fn new(
        modem: impl Peripheral<P = impl WifiModemPeripheral> + 'static,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        events: EventBus,
    ) -> Result<Self, EspError> {
        info!("📶 Initializing WiFi station");

        let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
        let connected = Arc::new(AtomicBool::new(false));
        let wanted = Arc::new(AtomicBool::new(false));

        // Station lost its AP: report it and let the driver retry with the same config
        let wifi_events = {
            let connected = connected.clone();
            let wanted = wanted.clone();
            let events = events.clone();
            sys_loop.subscribe::<WifiEvent, _>(move |event| {
                if let WifiEvent::StaDisconnected(_) = event {
                    connected.store(false, Ordering::Release);
                    events.publish(GatewayEvent::WifiDisconnected);
                    if wanted.load(Ordering::Acquire) {
                        // SAFETY: the WiFi driver is started while `wanted` is set
                        if let Err(e) = esp!(unsafe { esp_idf_svc::sys::esp_wifi_connect() }) {
                            warn!("⚠️ WiFi reconnect request failed: {:?}", e);
                        }
                    }
                }
            })?
        };

        let ip_events = {
            let connected = connected.clone();
            sys_loop.subscribe::<IpEvent, _>(move |event| {
                if let IpEvent::DhcpIpAssigned(assignment) = event {
                    info!("✅ WiFi connected, IP: {}", assignment.ip());
                    connected.store(true, Ordering::Release);
                    events.publish(GatewayEvent::WifiConnected);
                }
            })?
        };

        Ok(Self {
            wifi: Mutex::new(wifi),
            connected,
            wanted,
            _subscriptions: Mutex::new(vec![wifi_events, ip_events]),
        })
    }
}

impl WifiLink for EspWifiLink {
    fn connect(&self, credential: &WifiCredential) -> Result<(), LinkError> {
        let mut wifi = self
            .wifi
            .lock()
            .map_err(|_| LinkError::Failed("WiFi driver lock poisoned".to_string()))?;

        let config = Configuration::Client(ClientConfiguration {
            ssid: credential
                .ssid()
                .try_into()
                .map_err(|_| LinkError::Failed("invalid SSID".to_string()))?,
            password: credential
                .password()
                .try_into()
                .map_err(|_| LinkError::Failed("invalid password".to_string()))?,
            auth_method: auth_method_for(credential.password()),
            ..Default::default()
        });

        // Drop any association made with older credentials
        self.wanted.store(false, Ordering::Release);
        if wifi.is_started().map_err(esp_failure)? {
            if let Err(e) = wifi.disconnect() {
                warn!("⚠️ WiFi disconnect before reconfigure failed: {:?}", e);
            }
        }

        wifi.set_configuration(&config).map_err(esp_failure)?;
        if !wifi.is_started().map_err(esp_failure)? {
            wifi.start().map_err(esp_failure)?;
        }

        self.wanted.store(true, Ordering::Release);
        wifi.connect().map_err(esp_failure)?;
        info!("📶 WiFi connection to '{}' started", credential.ssid());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

fn auth_method_for(password: &str) -> AuthMethod {
    if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    }
}

fn esp_failure(e: EspError) -> LinkError {
    LinkError::Failed(format!("{:?}", e))
}
