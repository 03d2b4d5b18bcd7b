//! Host driver: devices emulated in system memory
//!
//! Used when no GPU runtime is compiled in, and by tests that need several
//! devices with controlled capacities.
//!
//! ```rust
//! use decon_backends::{DeviceDriver, HostDeviceSpec, HostDriver};
//!
//! let driver = HostDriver::new(vec![
//!     HostDeviceSpec::new("host-0", 64 << 20),
//!     HostDeviceSpec::new("host-1", 32 << 20),
//! ]);
//! assert_eq!(driver.device_count().unwrap(), 2);
//!
//! let mut device = driver.open(1).unwrap();
//! let buffer = device.allocate_buffer(1024).unwrap();
//! device.upload(buffer, &vec![1.0; 1024]).unwrap();
//! assert_eq!(driver.free_memory(1).unwrap(), (32 << 20) - 4096);
//! ```

mod memory;

pub use memory::{HostMemory, MemoryPool};

use std::any::Any;
use std::sync::Arc;

use crate::backend::{BufferHandle, ComputeCapability, Device, DeviceDriver, DeviceInfo};
use crate::error::{BackendError, Result};

/// Driver version reported by emulated devices
pub const HOST_DRIVER_VERSION: f32 = 560.0;
/// Oldest driver the launcher accepts, matching the CUDA requirement
pub const MINIMUM_DRIVER_VERSION: f32 = 345.0;

/// Description of one emulated device
#[derive(Debug, Clone, PartialEq)]
pub struct HostDeviceSpec {
    pub name: String,
    /// Capacity in bytes
    pub total_memory: usize,
    pub compute_capability: ComputeCapability,
    pub tesla_tcc: bool,
}

impl HostDeviceSpec {
    pub fn new(name: impl Into<String>, total_memory: usize) -> Self {
        Self {
            name: name.into(),
            total_memory,
            compute_capability: ComputeCapability::new(7, 5),
            tesla_tcc: false,
        }
    }

    pub fn with_compute_capability(mut self, major: u32, minor: u32) -> Self {
        self.compute_capability = ComputeCapability::new(major, minor);
        self
    }

    pub fn with_tesla_tcc(mut self, tesla_tcc: bool) -> Self {
        self.tesla_tcc = tesla_tcc;
        self
    }
}

impl Default for HostDeviceSpec {
    fn default() -> Self {
        Self::new("Host Emulated Device", 4 << 30)
    }
}

/// Driver exposing [`HostDeviceSpec`]s as devices
#[derive(Debug)]
pub struct HostDriver {
    devices: Vec<(HostDeviceSpec, Arc<MemoryPool>)>,
    driver_version: f32,
}

impl HostDriver {
    pub fn new(specs: Vec<HostDeviceSpec>) -> Self {
        let devices = specs
            .into_iter()
            .map(|spec| {
                let pool = Arc::new(MemoryPool::new(spec.total_memory));
                (spec, pool)
            })
            .collect();
        Self {
            devices,
            driver_version: HOST_DRIVER_VERSION,
        }
    }

    /// Report a different driver version (for exercising version checks).
    pub fn with_driver_version(mut self, version: f32) -> Self {
        self.driver_version = version;
        self
    }

    fn device(&self, index: usize) -> Result<&(HostDeviceSpec, Arc<MemoryPool>)> {
        self.devices.get(index).ok_or(BackendError::DeviceNotFound {
            index,
            available: self.devices.len(),
        })
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new(vec![HostDeviceSpec::default()])
    }
}

impl DeviceDriver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.devices.len())
    }

    fn describe(&self, index: usize) -> Result<DeviceInfo> {
        let (spec, _) = self.device(index)?;
        Ok(DeviceInfo {
            index,
            name: spec.name.clone(),
            total_memory: spec.total_memory,
            compute_capability: spec.compute_capability,
            tesla_tcc: spec.tesla_tcc,
        })
    }

    fn free_memory(&self, index: usize) -> Result<usize> {
        let (_, pool) = self.device(index)?;
        Ok(pool.available())
    }

    fn driver_version(&self) -> Result<Option<f32>> {
        Ok(Some(self.driver_version))
    }

    fn minimum_driver_version(&self) -> Option<f32> {
        Some(MINIMUM_DRIVER_VERSION)
    }

    fn can_access_peer(&self, a: usize, b: usize) -> Result<bool> {
        self.device(a)?;
        self.device(b)?;
        Ok(a != b)
    }

    fn open(&self, index: usize) -> Result<Box<dyn Device>> {
        let (_, pool) = self.device(index)?;
        tracing::debug!(device = index, "host_device_open");
        Ok(Box::new(HostDevice::new(index, pool.clone())))
    }

    /// Frees the device's whole capacity; buffers held by open handles become invalid.
    fn reset(&self, index: usize) -> Result<()> {
        let (_, pool) = self.device(index)?;
        tracing::info!(device = index, in_use = pool.used(), "host_device_reset");
        pool.reset();
        Ok(())
    }
}

/// An opened emulated device
#[derive(Debug)]
pub struct HostDevice {
    index: usize,
    memory: HostMemory,
}

impl HostDevice {
    pub fn new(index: usize, pool: Arc<MemoryPool>) -> Self {
        Self {
            index,
            memory: HostMemory::new(pool),
        }
    }

    pub fn buffer(&self, handle: BufferHandle) -> Result<&[f32]> {
        self.memory.buffer(handle)
    }

    pub fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut [f32]> {
        self.memory.buffer_mut(handle)
    }

    /// See [`HostMemory::with_buffers`].
    pub fn with_buffers<R>(
        &mut self,
        target: BufferHandle,
        sources: &[BufferHandle],
        f: impl FnOnce(&mut [f32], &[&[f32]]) -> R,
    ) -> Result<R> {
        self.memory.with_buffers(target, sources, f)
    }
}

impl Device for HostDevice {
    fn index(&self) -> usize {
        self.index
    }

    fn allocate_buffer(&mut self, len: usize) -> Result<BufferHandle> {
        self.memory.allocate_buffer(len)
    }

    fn free_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        self.memory.free_buffer(handle)
    }

    fn upload(&mut self, handle: BufferHandle, data: &[f32]) -> Result<()> {
        self.memory.copy_to_buffer(handle, data)
    }

    fn download(&self, handle: BufferHandle, data: &mut [f32]) -> Result<()> {
        self.memory.copy_from_buffer(handle, data)
    }

    fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle) -> Result<()> {
        self.memory.copy_buffer(src, dst)
    }

    fn buffer_len(&self, handle: BufferHandle) -> Result<usize> {
        self.memory.buffer_len(handle)
    }

    fn allocated_bytes(&self) -> usize {
        self.memory.allocated_bytes()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
