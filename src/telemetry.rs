// Maps Generic OnOff status reports from mesh nodes onto relay entries

use log::debug;

use crate::relay_queue::RelayBus;

pub struct TelemetryRelay {
    relay: RelayBus,
    topic_prefix: String,
}

impl TelemetryRelay {
    pub fn new(relay: RelayBus, topic_prefix: impl Into<String>) -> Self {
        Self {
            relay,
            topic_prefix: topic_prefix.into(),
        }
    }

    /// `<prefix>/<addr as 4 lowercase hex digits>`
    pub fn topic_for(&self, source_address: u16) -> String {
        format!("{}/{:04x}", self.topic_prefix, source_address)
    }

    pub fn on_status_event(&self, source_address: u16, state: bool) {
        let topic = self.topic_for(source_address);
        let payload = if state { "1" } else { "0" };
        debug!("💡 Node 0x{:04x} reports {}", source_address, payload);
        self.relay.publish(topic, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay_queue::RelayCommand;

    #[test]
    fn test_status_event_becomes_publish() {
        let bus = RelayBus::new();
        let telemetry = TelemetryRelay::new(bus.clone(), "mesh");

        telemetry.on_status_event(0x0012, true);
        telemetry.on_status_event(0xBEEF, false);

        assert_eq!(
            bus.try_receive(),
            Some(RelayCommand::Publish {
                topic: "mesh/0012".to_string(),
                payload: "1".to_string()
            })
        );
        assert_eq!(
            bus.try_receive(),
            Some(RelayCommand::Publish {
                topic: "mesh/beef".to_string(),
                payload: "0".to_string()
            })
        );
    }
}
