//! Process-wide device catalogue
//!
//! [`DeviceRegistry`] wraps one [`DeviceDriver`], caches the device descriptions
//! and tracks which device each thread has selected. It is meant to be built once
//! and shared as an `Arc` between launchers. Selecting a device binds it to the
//! calling thread only; the registry never locks a device against use from
//! other threads.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::backend::{ComputeCapability, Device, DeviceDriver, DeviceInfo};
use crate::backends::host::{HostDeviceSpec, HostDriver};
use crate::error::{BackendError, Result};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Registry id -> device selected on this thread
    static CURRENT_DEVICES: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

pub struct DeviceRegistry {
    id: u64,
    driver: Box<dyn DeviceDriver>,
    catalog: RwLock<Option<Vec<DeviceInfo>>>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("id", &self.id)
            .field("driver", &self.driver.name())
            .field("catalog", &*self.catalog.read())
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new(driver: Box<dyn DeviceDriver>) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            driver,
            catalog: RwLock::new(None),
        }
    }

    /// Registry over emulated host devices.
    pub fn host(specs: Vec<HostDeviceSpec>) -> Self {
        Self::new(Box::new(HostDriver::new(specs)))
    }

    /// Registry over the best available runtime: CUDA when compiled in and at
    /// least one GPU is visible, the host driver otherwise.
    pub fn new_auto() -> Self {
        #[cfg(feature = "cuda")]
        {
            let cuda = crate::backends::cuda::CudaDriver::new();
            match cuda.device_count() {
                Ok(count) if count > 0 => {
                    tracing::info!(devices = count, "registry_using_cuda");
                    return Self::new(Box::new(cuda));
                }
                Ok(_) => tracing::warn!("no CUDA devices visible, using host driver"),
                Err(err) => tracing::warn!(error = %err, "CUDA unavailable, using host driver"),
            }
        }
        Self::new(Box::new(HostDriver::default()))
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    /// Descriptions of every device, enumerated on first use.
    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        if let Some(catalog) = self.catalog.read().as_ref() {
            return Ok(catalog.clone());
        }
        self.refresh()
    }

    /// Re-enumerate devices through the driver.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub fn refresh(&self) -> Result<Vec<DeviceInfo>> {
        let count = self.driver.device_count()?;
        let catalog = (0..count)
            .map(|index| self.driver.describe(index))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(devices = catalog.len(), "device_catalog_refreshed");
        *self.catalog.write() = Some(catalog.clone());
        Ok(catalog)
    }

    /// Number of devices
    pub fn num_devices(&self) -> Result<usize> {
        self.devices().map(|devices| devices.len())
    }

    pub fn info(&self, index: usize) -> Result<DeviceInfo> {
        let devices = self.devices()?;
        let available = devices.len();
        devices
            .into_iter()
            .nth(index)
            .ok_or(BackendError::DeviceNotFound { index, available })
    }

    pub fn name(&self, index: usize) -> Result<String> {
        self.info(index).map(|info| info.name)
    }

    /// Total memory of a device in bytes
    pub fn total_memory(&self, index: usize) -> Result<usize> {
        self.info(index).map(|info| info.total_memory)
    }

    /// Allocatable memory of a device in bytes
    pub fn free_memory(&self, index: usize) -> Result<usize> {
        self.info(index)?;
        self.driver.free_memory(index)
    }

    /// Allocatable memory of the calling thread's device
    pub fn current_free_memory(&self) -> Result<usize> {
        self.free_memory(self.current_device())
    }

    pub fn compute_capability(&self, index: usize) -> Result<f32> {
        self.info(index).map(|info| info.compute_capability.as_f32())
    }

    pub fn driver_version(&self) -> Result<Option<f32>> {
        self.driver.driver_version()
    }

    pub fn tesla_tcc(&self, index: usize) -> Result<bool> {
        self.info(index).map(|info| info.tesla_tcc)
    }

    pub fn can_access_peer(&self, a: usize, b: usize) -> Result<bool> {
        self.info(a)?;
        self.info(b)?;
        self.driver.can_access_peer(a, b)
    }

    /// Confirm that `index` exists and is usable: compute capability 2.0 or
    /// newer and a driver no older than the runtime's minimum.
    pub fn check_device(&self, index: usize) -> Result<DeviceInfo> {
        let info = self.info(index)?;
        if info.compute_capability < ComputeCapability::MINIMUM {
            return Err(BackendError::UnsupportedDevice {
                index,
                capability: info.compute_capability.as_f32(),
            });
        }
        if let (Some(found), Some(required)) = (self.driver.driver_version()?, self.driver.minimum_driver_version()) {
            if found < required {
                return Err(BackendError::DriverTooOld { found, required });
            }
        }
        Ok(info)
    }

    /// Bind `index` to the calling thread.
    pub fn set_device(&self, index: usize) -> Result<()> {
        self.check_device(index)?;
        CURRENT_DEVICES.with(|current| {
            current.borrow_mut().insert(self.id, index);
        });
        tracing::debug!(device = index, "device_selected");
        Ok(())
    }

    /// Device bound to the calling thread; the primary device when none was set.
    pub fn current_device(&self) -> usize {
        CURRENT_DEVICES.with(|current| current.borrow().get(&self.id).copied().unwrap_or(0))
    }

    /// Open a checked device for buffer management.
    pub fn open(&self, index: usize) -> Result<Box<dyn Device>> {
        self.check_device(index)?;
        self.driver.open(index)
    }

    /// Hard reset of the calling thread's device.
    pub fn reset_device(&self) -> Result<()> {
        let index = self.current_device();
        self.info(index)?;
        tracing::warn!(device = index, "device_reset");
        self.driver.reset(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::host(vec![
            HostDeviceSpec::new("primary", 1 << 20),
            HostDeviceSpec::new("secondary", 1 << 20).with_tesla_tcc(true),
            HostDeviceSpec::new("legacy", 1 << 20).with_compute_capability(1, 3),
        ])
    }

    #[test]
    fn test_enumeration_is_cached() {
        let registry = registry();
        assert_eq!(registry.num_devices().unwrap(), 3);
        assert_eq!(registry.name(1).unwrap(), "secondary");
        assert!(registry.tesla_tcc(1).unwrap());
        assert_eq!(registry.compute_capability(0).unwrap(), 7.5);
        assert_eq!(registry.driver_name(), "host");
    }

    #[test]
    fn test_check_device_rejects_unknown_and_legacy() {
        let registry = registry();
        assert!(registry.check_device(0).is_ok());
        assert!(matches!(
            registry.check_device(7),
            Err(BackendError::DeviceNotFound { index: 7, available: 3 })
        ));
        assert!(matches!(
            registry.check_device(2),
            Err(BackendError::UnsupportedDevice { index: 2, .. })
        ));
    }

    #[test]
    fn test_old_driver_is_rejected() {
        let driver = HostDriver::new(vec![HostDeviceSpec::default()]).with_driver_version(340.0);
        let registry = DeviceRegistry::new(Box::new(driver));
        assert!(matches!(
            registry.check_device(0),
            Err(BackendError::DriverTooOld { .. })
        ));
        assert_eq!(registry.driver_version().unwrap(), Some(340.0));
    }

    #[test]
    fn test_set_device_is_per_thread() {
        let registry = Arc::new(registry());
        assert_eq!(registry.current_device(), 0);
        registry.set_device(1).unwrap();
        assert_eq!(registry.current_device(), 1);

        let shared = registry.clone();
        let other = thread::spawn(move || shared.current_device()).join().unwrap();
        assert_eq!(other, 0);

        assert!(registry.set_device(9).is_err());
        assert_eq!(registry.current_device(), 1);
    }

    #[test]
    fn test_registries_do_not_share_selection() {
        let first = registry();
        let second = registry();
        first.set_device(1).unwrap();
        assert_eq!(second.current_device(), 0);
    }

    #[test]
    fn test_current_free_memory_tracks_allocations() {
        let registry = registry();
        registry.set_device(1).unwrap();
        let mut device = registry.open(1).unwrap();
        device.allocate_buffer(256).unwrap();
        assert_eq!(registry.current_free_memory().unwrap(), (1 << 20) - 1024);
        assert_eq!(registry.total_memory(1).unwrap(), 1 << 20);
        registry.reset_device().unwrap();
    }

    #[test]
    fn test_peer_access_checks_indices() {
        let registry = registry();
        assert!(registry.can_access_peer(0, 1).unwrap());
        assert!(registry.can_access_peer(0, 3).is_err());
    }
}
