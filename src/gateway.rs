// Wiring of the gateway: mesh callbacks on one side, the connectivity and relay tasks on the other

use std::sync::Arc;

use embassy_futures::join::join;
use log::{debug, info};

use crate::config::GatewayConfig;
use crate::connectivity::ConnectivityOrchestrator;
use crate::credential_store::{CredentialStore, KvStore};
use crate::links::{MeshLink, MessageContext, MqttLink, WifiLink};
use crate::mesh_protocol::CredentialProtocolHandler;
use crate::relay_queue::{BacklogGauge, LineLog, RelayBus, RelayQueue, RelayService};
use crate::system_state::{ConnectivityCell, EventBus, GatewayEvent};
use crate::telemetry::TelemetryRelay;

/// Events raised by the mesh stack callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    VendorMessage {
        ctx: MessageContext,
        opcode: u32,
        payload: Vec<u8>,
    },
    ProvisioningComplete {
        net_idx: u16,
        addr: u16,
    },
    OnOffStatus {
        addr: u16,
        on: bool,
    },
}

// Runs in mesh callback context; never blocks on WiFi or MQTT
pub struct MeshFrontend<K: KvStore, L: MeshLink> {
    handler: CredentialProtocolHandler<K, L>,
    telemetry: TelemetryRelay,
    events: EventBus,
}

impl<K: KvStore, L: MeshLink> MeshFrontend<K, L> {
    pub fn on_mesh_event(&self, event: MeshEvent) {
        match event {
            MeshEvent::VendorMessage {
                ctx,
                opcode,
                payload,
            } => {
                self.handler.handle_raw(&ctx, opcode, &payload);
            }
            MeshEvent::ProvisioningComplete { net_idx, addr } => {
                self.events
                    .publish(GatewayEvent::ProvisioningComplete { net_idx, addr });
            }
            MeshEvent::OnOffStatus { addr, on } => {
                self.telemetry.on_status_event(addr, on);
            }
        }
    }
}

// Owns the orchestrator and the relay service; run both on one executor task
pub struct GatewayRuntime<K: KvStore, W: WifiLink, M: MqttLink, G: LineLog> {
    orchestrator: ConnectivityOrchestrator<K, W, M>,
    relay: RelayService<G, M>,
    events: EventBus,
}

impl<K: KvStore, W: WifiLink, M: MqttLink, G: LineLog> GatewayRuntime<K, W, M, G> {
    pub fn orchestrator(&self) -> &ConnectivityOrchestrator<K, W, M> {
        &self.orchestrator
    }

    pub fn relay_queue_mut(&mut self) -> &mut RelayQueue<G, M> {
        self.relay.queue_mut()
    }

    pub fn backlog_gauge(&self) -> BacklogGauge {
        self.relay.gauge()
    }

    /// Run until both queues are empty. Returns how many items were handled.
    pub async fn process_pending(&mut self) -> usize {
        let mut total = 0;
        loop {
            let handled =
                self.orchestrator.process_pending(&self.events) + self.relay.process_pending().await;
            if handled == 0 {
                debug!("Gateway idle after {} items", total);
                return total;
            }
            total += handled;
        }
    }

    /// Never returns
    pub async fn run(&mut self) {
        info!("🚀 Gateway runtime started");
        join(self.orchestrator.run(&self.events), self.relay.run()).await;
    }
}

/// Both halves of an assembled gateway
pub struct Gateway<K: KvStore, L: MeshLink, W: WifiLink, M: MqttLink, G: LineLog> {
    pub frontend: MeshFrontend<K, L>,
    pub runtime: GatewayRuntime<K, W, M, G>,
    pub connectivity: ConnectivityCell,
}

impl<K: KvStore, L: MeshLink, W: WifiLink, M: MqttLink, G: LineLog> Gateway<K, L, W, M, G> {
    /// Assemble the gateway around its collaborators.
    ///
    /// `events` must be the bus the WiFi and MQTT links publish into.
    pub fn build(
        config: &GatewayConfig,
        kv: K,
        relay_log: G,
        mesh: Arc<L>,
        wifi: Arc<W>,
        mqtt: Arc<M>,
        events: EventBus,
    ) -> Self {
        let connectivity = ConnectivityCell::new();
        let store = CredentialStore::new(kv).into_shared();
        let relay_bus = RelayBus::new();

        let frontend = MeshFrontend {
            handler: CredentialProtocolHandler::new(mesh, store.clone(), events.clone()),
            telemetry: TelemetryRelay::new(relay_bus.clone(), config.topic_prefix.clone()),
            events: events.clone(),
        };

        let orchestrator = ConnectivityOrchestrator::new(
            connectivity.clone(),
            store,
            wifi,
            mqtt.clone(),
            relay_bus.clone(),
        );
        let queue = RelayQueue::new(relay_log, mqtt, connectivity.clone());
        let relay = RelayService::new(queue, relay_bus);

        info!("🧩 Gateway '{}' assembled", config.device_name);

        Self {
            frontend,
            runtime: GatewayRuntime {
                orchestrator,
                relay,
                events,
            },
            connectivity,
        }
    }
}
