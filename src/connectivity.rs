// Connectivity orchestration: WiFi bring-up, then the MQTT session, then relay draining
// The transition function is pure; ConnectivityOrchestrator applies its effects to the links

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::credential_store::{KvStore, SharedCredentialStore, StoreError};
use crate::credentials::{Credential, CredentialKind, MqttCredential, WifiCredential};
use crate::links::{MqttLink, WifiLink};
use crate::relay_queue::RelayBus;
use crate::system_state::{ConnectivityCell, ConnectivityState, EventBus, GatewayEvent};

/// Which credential sets the orchestrator currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KnownCredentials {
    pub wifi: bool,
    pub mqtt: bool,
}

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ProvisioningComplete,
    /// `changed` is false when the same set was delivered again
    WifiCredentials { changed: bool },
    MqttCredentials { changed: bool },
    WifiConnected,
    WifiDisconnected,
    MqttConnected,
    MqttDisconnected,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    RestoreCredentials,
    StartWifi,
    StartMqtt,
    StopMqtt,
    DrainRelay,
}

/// Compute the next state and the effects to apply, in order.
///
/// `known` reflects credentials after the event has been recorded.
pub fn transition(
    state: ConnectivityState,
    known: KnownCredentials,
    event: LinkEvent,
) -> (ConnectivityState, Vec<Effect>) {
    use crate::system_state::ConnectivityState::*;

    let mqtt_active = matches!(state, MqttBringingUp | MqttUp);

    match event {
        LinkEvent::ProvisioningComplete => match state {
            Idle => (Idle, vec![Effect::RestoreCredentials]),
            _ => (state, vec![]),
        },

        LinkEvent::WifiCredentials { changed } => match state {
            Idle => (WifiBringingUp, vec![Effect::StartWifi]),
            _ if !changed => (state, vec![]),
            WifiBringingUp | WifiUp => (WifiBringingUp, vec![Effect::StartWifi]),
            MqttBringingUp | MqttUp => (WifiBringingUp, vec![Effect::StopMqtt, Effect::StartWifi]),
        },

        LinkEvent::MqttCredentials { changed } => match state {
            WifiUp => (MqttBringingUp, vec![Effect::StartMqtt]),
            MqttBringingUp | MqttUp if changed => {
                (MqttBringingUp, vec![Effect::StopMqtt, Effect::StartMqtt])
            }
            // Held until WiFi is up
            _ => (state, vec![]),
        },

        LinkEvent::WifiConnected => match state {
            Idle | WifiBringingUp if known.mqtt => (MqttBringingUp, vec![Effect::StartMqtt]),
            Idle | WifiBringingUp => (WifiUp, vec![]),
            _ => (state, vec![]),
        },

        LinkEvent::WifiDisconnected => {
            let mut effects = vec![];
            if mqtt_active {
                effects.push(Effect::StopMqtt);
            }
            let next = if known.wifi { WifiBringingUp } else { Idle };
            (next, effects)
        }

        LinkEvent::MqttConnected => match state {
            WifiUp | MqttBringingUp => (MqttUp, vec![Effect::DrainRelay]),
            _ => (state, vec![]),
        },

        LinkEvent::MqttDisconnected => match state {
            MqttBringingUp | MqttUp => (WifiUp, vec![]),
            _ => (state, vec![]),
        },
    }
}

// Owns the state machine and the credentials in use
pub struct ConnectivityOrchestrator<K: KvStore, W: WifiLink, M: MqttLink> {
    connectivity: ConnectivityCell,
    wifi_credential: Option<WifiCredential>,
    mqtt_credential: Option<MqttCredential>,
    store: SharedCredentialStore<K>,
    wifi: Arc<W>,
    mqtt: Arc<M>,
    relay: RelayBus,
}

impl<K: KvStore, W: WifiLink, M: MqttLink> ConnectivityOrchestrator<K, W, M> {
    pub fn new(
        connectivity: ConnectivityCell,
        store: SharedCredentialStore<K>,
        wifi: Arc<W>,
        mqtt: Arc<M>,
        relay: RelayBus,
    ) -> Self {
        connectivity.set(ConnectivityState::Idle);
        Self {
            connectivity,
            wifi_credential: None,
            mqtt_credential: None,
            store,
            wifi,
            mqtt,
            relay,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.connectivity.get()
    }

    pub fn known(&self) -> KnownCredentials {
        KnownCredentials {
            wifi: self.wifi_credential.is_some(),
            mqtt: self.mqtt_credential.is_some(),
        }
    }

    /// Adopt a freshly validated credential set and advance the state machine.
    pub fn notify_credentials(&mut self, credential: Credential) {
        let event = match credential {
            Credential::Wifi(wifi) => {
                let changed = self.wifi_credential.as_ref() != Some(&wifi);
                self.wifi_credential = Some(wifi);
                LinkEvent::WifiCredentials { changed }
            }
            Credential::Mqtt(mqtt) => {
                let changed = self.mqtt_credential.as_ref() != Some(&mqtt);
                self.mqtt_credential = Some(mqtt);
                LinkEvent::MqttCredentials { changed }
            }
        };
        self.apply(event);
    }

    pub fn handle_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::ProvisioningComplete { net_idx, addr } => {
                info!(
                    "🕸️ Provisioning complete: net_idx 0x{:03x}, addr 0x{:04x}",
                    net_idx, addr
                );
                self.apply(LinkEvent::ProvisioningComplete);
            }
            GatewayEvent::CredentialsReceived(credential) => self.notify_credentials(credential),
            GatewayEvent::WifiConnected => self.apply(LinkEvent::WifiConnected),
            GatewayEvent::WifiDisconnected => self.apply(LinkEvent::WifiDisconnected),
            GatewayEvent::MqttConnected => self.apply(LinkEvent::MqttConnected),
            GatewayEvent::MqttDisconnected => self.apply(LinkEvent::MqttDisconnected),
        }
    }

    /// Handle queued events without waiting. Returns how many were handled.
    pub fn process_pending(&mut self, events: &EventBus) -> usize {
        let mut handled = 0;
        while let Some(event) = events.try_receive() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Never returns
    pub async fn run(&mut self, events: &EventBus) {
        info!("🚀 Connectivity orchestrator started");
        loop {
            let event = events.receive().await;
            self.handle_event(event);
        }
    }

    fn apply(&mut self, event: LinkEvent) {
        let current = self.connectivity.get();
        let (next, effects) = transition(current, self.known(), event);

        if next != current {
            info!("🔀 Connectivity {:?} -> {:?} ({:?})", current, next, event);
        } else {
            debug!("Connectivity stays {:?} on {:?}", current, event);
        }
        self.connectivity.set(next);

        for effect in effects {
            self.run_effect(effect);
        }
    }

    fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::RestoreCredentials => self.restore_credentials(),
            Effect::StartWifi => {
                let Some(credential) = self.wifi_credential.as_ref() else {
                    return;
                };
                info!("📶 Connecting to WiFi network '{}'", credential.ssid());
                if let Err(e) = self.wifi.connect(credential) {
                    error!("❌ WiFi bring-up failed: {}", e);
                    self.connectivity.set(ConnectivityState::Idle);
                }
            }
            Effect::StartMqtt => {
                let Some(credential) = self.mqtt_credential.as_ref() else {
                    return;
                };
                // A stale WifiConnected can arrive after the station dropped again
                if !self.wifi.is_connected() {
                    warn!("⚠️ WiFi link is down, holding MQTT start");
                    self.connectivity.set(ConnectivityState::WifiBringingUp);
                    return;
                }
                info!("🔌 Starting MQTT session with {}", credential.uri());
                if let Err(e) = self.mqtt.start(credential) {
                    error!("❌ MQTT bring-up failed: {}", e);
                    self.connectivity.set(ConnectivityState::WifiUp);
                }
            }
            Effect::StopMqtt => {
                info!("🔌 Stopping MQTT session");
                self.mqtt.stop();
            }
            Effect::DrainRelay => {
                info!("📦 Uplink ready, requesting relay drain");
                self.relay.request_drain();
            }
        }
    }

    // Feed stored credentials back through the state machine
    fn restore_credentials(&mut self) {
        let (wifi, mqtt) = match self.store.lock() {
            Ok(mut store) => (store.load_wifi(), store.load_mqtt()),
            Err(_) => {
                error!("❌ Credential store lock poisoned, skipping restore");
                return;
            }
        };

        match wifi {
            Ok(wifi) => self.notify_credentials(wifi.into()),
            Err(e) => log_restore_miss(CredentialKind::Wifi, &e),
        }
        match mqtt {
            Ok(mqtt) => self.notify_credentials(mqtt.into()),
            Err(e) => log_restore_miss(CredentialKind::Mqtt, &e),
        }
    }
}

fn log_restore_miss(kind: CredentialKind, e: &StoreError) {
    match e {
        StoreError::Missing { .. } => info!("📭 No stored {} credentials", kind),
        _ => warn!("⚠️ Could not restore {} credentials: {}", kind, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_store::{CredentialStore, MemoryKv};
    use crate::links::LinkError;
    use crate::relay_queue::RelayCommand;
    use crate::system_state::ConnectivityState::*;
    use std::sync::Mutex;

    const NONE: KnownCredentials = KnownCredentials {
        wifi: false,
        mqtt: false,
    };
    const WIFI: KnownCredentials = KnownCredentials {
        wifi: true,
        mqtt: false,
    };
    const BOTH: KnownCredentials = KnownCredentials {
        wifi: true,
        mqtt: true,
    };

    // ==== Transition Tests ====

    #[test]
    fn test_provisioning_complete_restores_only_when_idle() {
        assert_eq!(
            transition(Idle, NONE, LinkEvent::ProvisioningComplete),
            (Idle, vec![Effect::RestoreCredentials])
        );
        assert_eq!(
            transition(MqttUp, BOTH, LinkEvent::ProvisioningComplete),
            (MqttUp, vec![])
        );
    }

    #[test]
    fn test_wifi_credentials() {
        let new = LinkEvent::WifiCredentials { changed: true };
        let same = LinkEvent::WifiCredentials { changed: false };

        assert_eq!(transition(Idle, WIFI, new), (WifiBringingUp, vec![Effect::StartWifi]));
        assert_eq!(transition(WifiBringingUp, WIFI, same), (WifiBringingUp, vec![]));
        assert_eq!(transition(MqttUp, BOTH, same), (MqttUp, vec![]));
        assert_eq!(
            transition(MqttUp, BOTH, new),
            (WifiBringingUp, vec![Effect::StopMqtt, Effect::StartWifi])
        );
    }

    #[test]
    fn test_mqtt_credentials_wait_for_wifi() {
        let new = LinkEvent::MqttCredentials { changed: true };
        assert_eq!(transition(Idle, BOTH, new), (Idle, vec![]));
        assert_eq!(transition(WifiBringingUp, BOTH, new), (WifiBringingUp, vec![]));
        assert_eq!(transition(WifiUp, BOTH, new), (MqttBringingUp, vec![Effect::StartMqtt]));
        assert_eq!(
            transition(MqttUp, BOTH, new),
            (MqttBringingUp, vec![Effect::StopMqtt, Effect::StartMqtt])
        );
    }

    #[test]
    fn test_wifi_connected() {
        assert_eq!(transition(WifiBringingUp, WIFI, LinkEvent::WifiConnected), (WifiUp, vec![]));
        assert_eq!(
            transition(WifiBringingUp, BOTH, LinkEvent::WifiConnected),
            (MqttBringingUp, vec![Effect::StartMqtt])
        );
        assert_eq!(transition(MqttUp, BOTH, LinkEvent::WifiConnected), (MqttUp, vec![]));
    }

    #[test]
    fn test_wifi_disconnected_from_any_state() {
        assert_eq!(
            transition(MqttUp, BOTH, LinkEvent::WifiDisconnected),
            (WifiBringingUp, vec![Effect::StopMqtt])
        );
        assert_eq!(
            transition(WifiUp, WIFI, LinkEvent::WifiDisconnected),
            (WifiBringingUp, vec![])
        );
        assert_eq!(transition(Idle, NONE, LinkEvent::WifiDisconnected), (Idle, vec![]));
    }

    #[test]
    fn test_mqtt_connected_triggers_drain() {
        assert_eq!(
            transition(MqttBringingUp, BOTH, LinkEvent::MqttConnected),
            (MqttUp, vec![Effect::DrainRelay])
        );
        assert_eq!(transition(Idle, BOTH, LinkEvent::MqttConnected), (Idle, vec![]));
    }

    #[test]
    fn test_mqtt_disconnected() {
        assert_eq!(transition(MqttUp, BOTH, LinkEvent::MqttDisconnected), (WifiUp, vec![]));
        assert_eq!(
            transition(WifiBringingUp, BOTH, LinkEvent::MqttDisconnected),
            (WifiBringingUp, vec![])
        );
    }

    // ==== Orchestrator Tests ====

    #[derive(Default)]
    struct FakeWifi {
        connects: Mutex<Vec<String>>,
        fail: bool,
        link_down: bool,
    }

    impl WifiLink for FakeWifi {
        fn connect(&self, credential: &WifiCredential) -> Result<(), LinkError> {
            if self.fail {
                return Err(LinkError::Failed("radio off".to_string()));
            }
            self.connects.lock().unwrap().push(credential.ssid().to_string());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.link_down
        }
    }

    #[derive(Default)]
    struct FakeMqtt {
        calls: Mutex<Vec<String>>,
    }

    impl MqttLink for FakeMqtt {
        fn start(&self, credential: &MqttCredential) -> Result<(), LinkError> {
            self.calls.lock().unwrap().push(format!("start {}", credential.uri()));
            Ok(())
        }

        fn stop(&self) {
            self.calls.lock().unwrap().push("stop".to_string());
        }

        fn publish(&self, _: &str, _: &str) -> Result<(), LinkError> {
            Ok(())
        }
    }

    struct Fixture {
        orchestrator: ConnectivityOrchestrator<MemoryKv, FakeWifi, FakeMqtt>,
        wifi: Arc<FakeWifi>,
        mqtt: Arc<FakeMqtt>,
        relay: RelayBus,
    }

    fn fixture_with(store: CredentialStore<MemoryKv>, wifi: FakeWifi) -> Fixture {
        let wifi = Arc::new(wifi);
        let mqtt = Arc::new(FakeMqtt::default());
        let relay = RelayBus::new();
        let orchestrator = ConnectivityOrchestrator::new(
            ConnectivityCell::new(),
            store.into_shared(),
            wifi.clone(),
            mqtt.clone(),
            relay.clone(),
        );
        Fixture {
            orchestrator,
            wifi,
            mqtt,
            relay,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CredentialStore::new(MemoryKv::new()), FakeWifi::default())
    }

    fn wifi(ssid: &str) -> Credential {
        WifiCredential::new(ssid, "pw").unwrap().into()
    }

    fn mqtt() -> Credential {
        MqttCredential::new("mqtt://b", "alice", "pw").unwrap().into()
    }

    #[test]
    fn test_full_bring_up_sequence() {
        let mut f = fixture();

        f.orchestrator.notify_credentials(wifi("home"));
        assert_eq!(f.orchestrator.state(), WifiBringingUp);
        assert_eq!(*f.wifi.connects.lock().unwrap(), vec!["home".to_string()]);

        f.orchestrator.notify_credentials(mqtt());
        assert_eq!(f.orchestrator.state(), WifiBringingUp);
        assert!(f.mqtt.calls.lock().unwrap().is_empty());

        f.orchestrator.handle_event(GatewayEvent::WifiConnected);
        assert_eq!(f.orchestrator.state(), MqttBringingUp);
        assert_eq!(*f.mqtt.calls.lock().unwrap(), vec!["start mqtt://b".to_string()]);

        f.orchestrator.handle_event(GatewayEvent::MqttConnected);
        assert_eq!(f.orchestrator.state(), MqttUp);
        assert_eq!(f.relay.try_receive(), Some(RelayCommand::Drain));
    }

    #[test]
    fn test_wifi_loss_tears_down_mqtt() {
        let mut f = fixture();
        f.orchestrator.notify_credentials(wifi("home"));
        f.orchestrator.notify_credentials(mqtt());
        f.orchestrator.handle_event(GatewayEvent::WifiConnected);
        f.orchestrator.handle_event(GatewayEvent::MqttConnected);

        f.orchestrator.handle_event(GatewayEvent::WifiDisconnected);
        assert_eq!(f.orchestrator.state(), WifiBringingUp);
        assert_eq!(f.mqtt.calls.lock().unwrap().last().unwrap(), "stop");

        // Reconnect brings the broker session back
        f.orchestrator.handle_event(GatewayEvent::WifiConnected);
        assert_eq!(f.orchestrator.state(), MqttBringingUp);
    }

    #[test]
    fn test_stale_wifi_connected_holds_mqtt_start() {
        let mut f = fixture_with(
            CredentialStore::new(MemoryKv::new()),
            FakeWifi {
                link_down: true,
                ..Default::default()
            },
        );
        f.orchestrator.notify_credentials(wifi("home"));
        f.orchestrator.notify_credentials(mqtt());

        f.orchestrator.handle_event(GatewayEvent::WifiConnected);
        assert_eq!(f.orchestrator.state(), WifiBringingUp);
        assert!(f.mqtt.calls.lock().unwrap().is_empty());

        f.orchestrator.handle_event(GatewayEvent::WifiDisconnected);
        assert_eq!(f.orchestrator.state(), WifiBringingUp);
    }

    #[test]
    fn test_repeated_credentials_do_not_restart_wifi() {
        let mut f = fixture();
        f.orchestrator.notify_credentials(wifi("home"));
        f.orchestrator.notify_credentials(wifi("home"));
        assert_eq!(f.wifi.connects.lock().unwrap().len(), 1);

        f.orchestrator.notify_credentials(wifi("office"));
        assert_eq!(
            *f.wifi.connects.lock().unwrap(),
            vec!["home".to_string(), "office".to_string()]
        );
    }

    #[test]
    fn test_wifi_start_failure_falls_back_to_idle() {
        let mut f = fixture_with(
            CredentialStore::new(MemoryKv::new()),
            FakeWifi {
                fail: true,
                ..Default::default()
            },
        );
        f.orchestrator.notify_credentials(wifi("home"));
        assert_eq!(f.orchestrator.state(), Idle);
    }

    #[test]
    fn test_provisioning_complete_restores_stored_credentials() {
        let mut store = CredentialStore::new(MemoryKv::new());
        store.save(&wifi("home")).unwrap();
        store.save(&mqtt()).unwrap();
        let mut f = fixture_with(store, FakeWifi::default());

        f.orchestrator.handle_event(GatewayEvent::ProvisioningComplete {
            net_idx: 0,
            addr: 0x0005,
        });
        assert_eq!(f.orchestrator.state(), WifiBringingUp);
        assert_eq!(f.orchestrator.known(), BOTH);
        assert_eq!(*f.wifi.connects.lock().unwrap(), vec!["home".to_string()]);
    }

    #[test]
    fn test_provisioning_complete_without_stored_credentials() {
        let mut f = fixture();
        f.orchestrator.handle_event(GatewayEvent::ProvisioningComplete {
            net_idx: 0,
            addr: 0x0005,
        });
        assert_eq!(f.orchestrator.state(), Idle);
        assert!(f.wifi.connects.lock().unwrap().is_empty());
    }

    #[test]
    fn test_process_pending_drains_bus() {
        let mut f = fixture();
        let events = EventBus::new();
        events.publish(GatewayEvent::CredentialsReceived(wifi("home")));
        events.publish(GatewayEvent::WifiConnected);

        assert_eq!(f.orchestrator.process_pending(&events), 2);
        assert_eq!(f.orchestrator.state(), WifiUp);
    }
}
