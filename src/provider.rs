//! Device providers: where devices come from.
//!
//! A [`DeviceProvider`] announces devices as they appear and disappear. The
//! scheduler subscribes once and maps every connected device to a pool.
//!
//! ```text
//!   DeviceProvider                       Scheduler
//!        │ initialize()                      │
//!        │ subscribe() ──── receiver ───────►│
//!        │                                   │
//!        │── Connected(Box<dyn Device>) ────►│ pool = pooling.associate(info)
//!        │── Disconnected(serial) ──────────►│ coordinator.remove_device
//!        │                                   │
//!        │ terminate()  ◄────────────────────│ run complete
//! ```
//!
//! # Built-in Providers
//!
//! | Provider | Module | Description |
//! |----------|--------|-------------|
//! | Local | [`local`] | Devices from configuration, plus any added at runtime |

pub mod local;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::device::{Device, DeviceInfo};

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur during provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The event stream was already handed out.
    #[error("Device events already have a subscriber")]
    AlreadySubscribed,

    /// Provider-specific error not covered by other variants.
    #[error("Provider error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A change in the set of available devices.
pub enum DeviceEvent {
    Connected(Box<dyn Device>),
    Disconnected(String),
}

impl std::fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEvent::Connected(device) => {
                f.debug_tuple("Connected").field(&device.info().serial).finish()
            }
            DeviceEvent::Disconnected(serial) => {
                f.debug_tuple("Disconnected").field(serial).finish()
            }
        }
    }
}

/// Source of device connect and disconnect events.
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Starts discovering devices.
    async fn initialize(&self) -> ProviderResult<()>;

    /// Returns the event stream. There is a single subscriber.
    fn subscribe(&self) -> ProviderResult<mpsc::UnboundedReceiver<DeviceEvent>>;

    /// Stops discovering devices.
    async fn terminate(&self) -> ProviderResult<()>;
}

/// Currently connected devices, keyed by serial.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    devices: Mutex<HashMap<String, DeviceInfo>>,
}

impl ConnectionTable {
    /// Records a device unless one with the same serial is connected.
    pub fn insert_if_absent(&self, info: &DeviceInfo) -> bool {
        let Ok(mut devices) = self.devices.lock() else {
            return false;
        };
        if devices.contains_key(&info.serial) {
            return false;
        }
        devices.insert(info.serial.clone(), info.clone());
        true
    }

    pub fn remove(&self, serial: &str) -> Option<DeviceInfo> {
        self.devices.lock().ok()?.remove(serial)
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.devices
            .lock()
            .map(|devices| devices.contains_key(serial))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.devices.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.clear();
        }
    }
}
