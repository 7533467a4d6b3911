//! Provider for devices known up front or added by the embedding program.
//!
//! Devices from the configuration are announced when the provider is
//! initialized. A [`DeviceController`] connects and disconnects devices at
//! any time afterwards, which is how callers wire in their own discovery
//! or simulate devices coming and going.
//!
//! # Example
//!
//! ```no_run
//! use fleet::device::stub::StubDevice;
//! use fleet::provider::local::LocalProvider;
//!
//! let provider = LocalProvider::new();
//! let controller = provider.controller();
//!
//! // later, from any task
//! controller.connect(Box::new(StubDevice::new("stub-1")));
//! controller.disconnect("stub-1");
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ConnectionTable, DeviceEvent, DeviceProvider, ProviderError, ProviderResult};
use crate::config::ProviderConfig;
use crate::device::Device;
use crate::device::process::ProcessDevice;
use crate::device::stub::StubDevice;

/// Connects and disconnects devices of a [`LocalProvider`].
#[derive(Clone)]
pub struct DeviceController {
    connections: Arc<ConnectionTable>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceController {
    /// Announces a device. Returns `false` if its serial is already
    /// connected.
    pub fn connect(&self, device: Box<dyn Device>) -> bool {
        let info = device.info().clone();
        if !self.connections.insert_if_absent(&info) {
            warn!(serial = %info.serial, "Ignoring duplicate device connection");
            return false;
        }
        debug!(serial = %info.serial, "Device connected");
        self.events.send(DeviceEvent::Connected(device)).is_ok()
    }

    /// Announces that a device went away. Returns `false` if it was not
    /// connected.
    pub fn disconnect(&self, serial: &str) -> bool {
        if self.connections.remove(serial).is_none() {
            return false;
        }
        debug!(%serial, "Device disconnected");
        self.events
            .send(DeviceEvent::Disconnected(serial.to_string()))
            .is_ok()
    }

    pub fn connected(&self) -> usize {
        self.connections.len()
    }
}

/// Provider backed by an in-process device list.
pub struct LocalProvider {
    initial: Mutex<Vec<Box<dyn Device>>>,
    controller: DeviceController,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<DeviceEvent>>>,
}

impl LocalProvider {
    pub fn new() -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            initial: Mutex::new(Vec::new()),
            controller: DeviceController {
                connections: Arc::new(ConnectionTable::default()),
                events,
            },
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Builds the provider and its devices from configuration.
    pub fn from_config(config: &ProviderConfig) -> Self {
        let provider = Self::new();
        match config {
            ProviderConfig::Local(local) => local
                .devices
                .iter()
                .cloned()
                .fold(provider, |p, d| p.with_device(ProcessDevice::new(d))),
            ProviderConfig::Stub(stub) => stub
                .devices
                .iter()
                .cloned()
                .fold(provider, |p, info| p.with_device(StubDevice::from_info(info))),
        }
    }

    /// Adds a device that is connected when the provider initializes.
    pub fn with_device(self, device: impl Device + 'static) -> Self {
        if let Ok(mut initial) = self.initial.lock() {
            initial.push(Box::new(device));
        }
        self
    }

    pub fn controller(&self) -> DeviceController {
        self.controller.clone()
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn initialize(&self) -> ProviderResult<()> {
        let devices = match self.initial.lock() {
            Ok(mut initial) => std::mem::take(&mut *initial),
            Err(_) => Vec::new(),
        };
        info!(count = devices.len(), "Connecting configured devices");
        for device in devices {
            self.controller.connect(device);
        }
        Ok(())
    }

    fn subscribe(&self) -> ProviderResult<mpsc::UnboundedReceiver<DeviceEvent>> {
        self.receiver
            .lock()
            .ok()
            .and_then(|mut receiver| receiver.take())
            .ok_or(ProviderError::AlreadySubscribed)
    }

    async fn terminate(&self) -> ProviderResult<()> {
        debug!(
            connected = self.controller.connected(),
            "Terminating local provider"
        );
        self.controller.connections.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;

    #[tokio::test]
    async fn test_initialize_announces_configured_devices() {
        let config = load_config_str(
            r#"
            [provider]
            type = "stub"

            [[provider.devices]]
            serial = "a"
            os_version = "28"

            [[provider.devices]]
            serial = "b"
        "#,
        )
        .unwrap();
        let provider = LocalProvider::from_config(&config.provider);
        let mut events = provider.subscribe().unwrap();

        provider.initialize().await.unwrap();

        let mut serials = Vec::new();
        while let Ok(DeviceEvent::Connected(device)) = events.try_recv() {
            serials.push(device.info().serial.clone());
        }
        assert_eq!(serials, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_single_subscriber() {
        let provider = LocalProvider::new();
        assert!(provider.subscribe().is_ok());
        assert!(matches!(
            provider.subscribe(),
            Err(ProviderError::AlreadySubscribed)
        ));
    }

    #[tokio::test]
    async fn test_controller_deduplicates() {
        let provider = LocalProvider::new();
        let mut events = provider.subscribe().unwrap();
        let controller = provider.controller();

        assert!(controller.connect(Box::new(StubDevice::new("s1"))));
        assert!(!controller.connect(Box::new(StubDevice::new("s1"))));
        assert!(controller.disconnect("s1"));
        assert!(!controller.disconnect("s1"));

        assert!(matches!(events.try_recv(), Ok(DeviceEvent::Connected(_))));
        assert!(matches!(
            events.try_recv(),
            Ok(DeviceEvent::Disconnected(serial)) if serial == "s1"
        ));
        assert!(events.try_recv().is_err());
    }
}
