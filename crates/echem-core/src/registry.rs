//! Explicit registry of shared device handles.
//!
//! Channels of the same instrument must share one [`Device`] so their driver
//! calls are serialized and their sessions counted together. The registry
//! is an ordinary value passed to whoever builds executors.

use crate::driver::{Device, DriverInterface};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Device handles keyed by address.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Device>>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `address`, creating it with `driver` on first use.
    ///
    /// The driver is ignored when a handle for `address` already exists.
    pub fn device(&self, address: &str, driver: Arc<dyn DriverInterface>) -> Arc<Device> {
        if let Some(device) = self.devices.read().get(address) {
            return Arc::clone(device);
        }
        let mut devices = self.devices.write();
        Arc::clone(
            devices
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(Device::new(address, driver))),
        )
    }

    /// Existing handle for `address`.
    pub fn get(&self, address: &str) -> Option<Arc<Device>> {
        self.devices.read().get(address).cloned()
    }

    /// Removes the handle for `address`.
    ///
    /// Executors holding the handle keep using it.
    pub fn remove(&self, address: &str) -> Option<Arc<Device>> {
        self.devices.write().remove(address)
    }

    /// Registered addresses, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.devices.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Whether no device is registered.
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Connection, DriverResult, HardwareConfig};
    use crate::error::{DriverError, DriverErrorKind};
    use crate::parameter::ParamRecord;
    use crate::telemetry::PollFrame;
    use std::time::Duration;

    struct Offline;

    impl DriverInterface for Offline {
        fn connect(&self, _address: &str, _timeout: Duration) -> DriverResult<Connection> {
            Err(DriverError::new(DriverErrorKind::NotConnected, "offline"))
        }
        fn disconnect(&self, _conn: &Connection) -> DriverResult<()> {
            Ok(())
        }
        fn load(&self, _: &Connection, _: u8, _: &str, _: &[ParamRecord], _: bool, _: bool) -> DriverResult<()> {
            Ok(())
        }
        fn update(&self, _: &Connection, _: u8, _: usize, _: &str, _: &[ParamRecord]) -> DriverResult<()> {
            Ok(())
        }
        fn start(&self, _: &Connection, _: u8) -> DriverResult<()> {
            Ok(())
        }
        fn stop(&self, _: &Connection, _: u8) -> DriverResult<()> {
            Ok(())
        }
        fn poll(&self, _: &Connection, _: u8) -> DriverResult<PollFrame> {
            Err(DriverError::new(DriverErrorKind::NotConnected, "offline"))
        }
        fn hardware_config(&self, _: &Connection, _: u8) -> DriverResult<HardwareConfig> {
            Ok(HardwareConfig::default())
        }
        fn set_hardware_config(&self, _: &Connection, _: u8, _: HardwareConfig) -> DriverResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_same_address_shares_handle() {
        let registry = DeviceRegistry::new();
        let a = registry.device("192.168.1.2", Arc::new(Offline));
        let b = registry.device("192.168.1.2", Arc::new(Offline));
        let c = registry.device("192.168.1.3", Arc::new(Offline));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.addresses(), vec!["192.168.1.2", "192.168.1.3"]);
    }

    #[test]
    fn test_remove_keeps_existing_handles_alive() {
        let registry = DeviceRegistry::new();
        let device = registry.device("usb0", Arc::new(Offline));
        assert!(registry.remove("usb0").is_some());
        assert!(registry.is_empty());
        assert_eq!(device.address(), "usb0");
        assert!(device.connect(Duration::from_millis(1)).is_err());
    }
}
