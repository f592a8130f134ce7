//! Command Dispatcher - Client Intents to Bus Publishes
//!
//! Encodes a logical command through the codec and hands it to the bus
//! adapter's outbound queue. Returns as soon as the queue accepts the
//! publish; device acknowledgment arrives later as ordinary status traffic.

use crate::bus::BusHandle;
use crate::codec::{CodecRegistry, Command, DoorCommand, LightCommand};
use crate::error::{Error, Result};
use crate::state_store::StateStore;
use std::sync::Arc;

/// Command dispatcher instance
pub struct CommandDispatcher {
    registry: Arc<CodecRegistry>,
    bus: BusHandle,
    store: Arc<StateStore>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<CodecRegistry>, bus: BusHandle, store: Arc<StateStore>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            bus,
            store,
        })
    }

    /// Actuate the garage door
    pub fn door(&self, command: DoorCommand) -> Result<()> {
        self.send(Command::Door(command))
    }

    /// Set or toggle the flood light
    pub fn light(&self, command: LightCommand) -> Result<()> {
        self.send(Command::Light(command))
    }

    pub fn light_toggle(&self) -> Result<()> {
        self.light(LightCommand::Toggle)
    }

    /// Ask a device to reboot; the id must be registered
    pub async fn reboot(&self, device_id: &str) -> Result<()> {
        self.ensure_known(device_id).await?;
        self.send(Command::Reboot {
            device_id: device_id.to_string(),
        })
    }

    /// Liveness poke; the device answers with `alive` on its status topic
    pub async fn ping(&self, device_id: &str) -> Result<()> {
        self.ensure_known(device_id).await?;
        self.send(Command::Ping {
            device_id: device_id.to_string(),
        })
    }

    async fn ensure_known(&self, device_id: &str) -> Result<()> {
        if self.store.has_device(device_id).await {
            Ok(())
        } else {
            Err(Error::UnknownDevice(device_id.to_string()))
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        let (topic, payload) = self.registry.encode_command(&command);
        tracing::info!(topic = %topic, "Dispatching command");
        self.bus.publish(topic, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusAdapter, BusOptions};
    use crate::clock::ManualClock;
    use crate::codec::Event;
    use chrono::TimeZone;
    use chrono::Utc;
    use std::time::Duration;

    async fn dispatcher() -> Arc<CommandDispatcher> {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(StateStore::new(clock, Duration::from_secs(90), 64));
        store
            .apply(&Event::Version {
                device_id: "house-monitor".to_string(),
                version: "abc".to_string(),
            })
            .await;
        let registry = Arc::new(CodecRegistry::new());
        let (_adapter, bus) = BusAdapter::new(
            registry.clone(),
            store.clone(),
            BusOptions {
                host: "localhost".to_string(),
                port: 1883,
                username: None,
                password: None,
                client_id: "test".to_string(),
                keepalive: Duration::from_secs(30),
                outbound_cap: 16,
            },
        );
        CommandDispatcher::new(registry, bus, store)
    }

    #[tokio::test]
    async fn door_command_is_accepted() {
        let dispatcher = dispatcher().await;
        assert!(dispatcher.door(DoorCommand::Toggle).is_ok());
    }

    #[tokio::test]
    async fn reboot_requires_known_device() {
        let dispatcher = dispatcher().await;
        assert!(dispatcher.reboot("house-monitor").await.is_ok());
        let err = dispatcher.reboot("toaster").await.unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(_)));
    }

    #[tokio::test]
    async fn ping_requires_known_device() {
        let dispatcher = dispatcher().await;
        assert!(dispatcher.ping("house-monitor").await.is_ok());
        let err = dispatcher.ping("toaster").await.unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(_)));
    }
}
