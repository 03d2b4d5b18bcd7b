//! CUDA driver for NVIDIA GPUs
//!
//! Compiled only with the `cuda` feature. Devices are enumerated and described
//! through `cudarc`; buffers are `CudaSlice<f32>` allocations owned by the
//! opened [`CudaDeviceHandle`].
//!
//! The CUDA driver API reports the CUDA version it implements, not the NVIDIA
//! display driver release, so [`crate::DeviceDriver::driver_version`] returns `None`
//! and the registry's minimum-driver check does not apply here. A driver too old
//! for the runtime fails context creation with `CUDA_ERROR_INSUFFICIENT_DRIVER`,
//! which surfaces as [`crate::BackendError::Driver`] from every query on that device.
//!
//! ```rust,ignore
//! use decon_backends::{CudaDriver, DeviceRegistry};
//!
//! let registry = DeviceRegistry::new(Box::new(CudaDriver::new()));
//! println!("{} GPU(s)", registry.num_devices()?);
//! ```

mod memory;

#[cfg(feature = "cuda")]
pub use memory::CudaMemory;

#[cfg(feature = "cuda")]
use std::any::Any;
#[cfg(feature = "cuda")]
use std::collections::HashMap;
#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::sys::CUdevice_attribute;
#[cfg(feature = "cuda")]
use cudarc::driver::CudaDevice;
#[cfg(feature = "cuda")]
use parking_lot::RwLock;

#[cfg(feature = "cuda")]
use crate::backend::{BufferHandle, ComputeCapability, Device, DeviceDriver, DeviceInfo};
#[cfg(feature = "cuda")]
use crate::error::{BackendError, Result};

/// Driver over the CUDA runtime
#[cfg(feature = "cuda")]
#[derive(Default)]
pub struct CudaDriver {
    contexts: RwLock<HashMap<usize, Arc<CudaDevice>>>,
}

#[cfg(feature = "cuda")]
impl CudaDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn context(&self, index: usize) -> Result<Arc<CudaDevice>> {
        if let Some(device) = self.contexts.read().get(&index) {
            return Ok(device.clone());
        }
        let available = self.device_count()?;
        if index >= available {
            return Err(BackendError::DeviceNotFound { index, available });
        }
        let device = CudaDevice::new(index)?;
        self.contexts.write().insert(index, device.clone());
        Ok(device)
    }

    fn memory_info(&self, index: usize) -> Result<(usize, usize)> {
        let device = self.context(index)?;
        device.bind_to_thread()?;
        Ok(cudarc::driver::result::mem_get_info()?)
    }
}

#[cfg(feature = "cuda")]
impl DeviceDriver for CudaDriver {
    fn name(&self) -> &str {
        "cuda"
    }

    fn device_count(&self) -> Result<usize> {
        let count = CudaDevice::count()?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn describe(&self, index: usize) -> Result<DeviceInfo> {
        let device = self.context(index)?;
        let major = device.attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        let minor = device.attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;
        let tcc = device.attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_TCC_DRIVER)?;
        let (_, total_memory) = self.memory_info(index)?;

        Ok(DeviceInfo {
            index,
            name: device.name()?,
            total_memory,
            compute_capability: ComputeCapability::new(major.max(0) as u32, minor.max(0) as u32),
            tesla_tcc: tcc != 0,
        })
    }

    fn free_memory(&self, index: usize) -> Result<usize> {
        self.memory_info(index).map(|(free, _)| free)
    }

    fn driver_version(&self) -> Result<Option<f32>> {
        Ok(None)
    }

    fn can_access_peer(&self, a: usize, b: usize) -> Result<bool> {
        let first = self.context(a)?;
        let second = self.context(b)?;
        if a == b {
            return Ok(false);
        }
        let unified = |device: &Arc<CudaDevice>| {
            device
                .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_UNIFIED_ADDRESSING)
                .map(|value| value != 0)
        };
        Ok(unified(&first)? && unified(&second)?)
    }

    fn open(&self, index: usize) -> Result<Box<dyn Device>> {
        let device = self.context(index)?;
        tracing::debug!(device = index, "cuda_device_open");
        Ok(Box::new(CudaDeviceHandle {
            index,
            memory: CudaMemory::new(device),
        }))
    }

    fn reset(&self, index: usize) -> Result<()> {
        let device = self.context(index)?;
        device.synchronize()?;
        // dropping the cached context releases the primary context once no handle holds it
        self.contexts.write().remove(&index);
        tracing::info!(device = index, "cuda_device_reset");
        Ok(())
    }
}

/// An opened CUDA device
#[cfg(feature = "cuda")]
pub struct CudaDeviceHandle {
    index: usize,
    memory: CudaMemory,
}

#[cfg(feature = "cuda")]
impl CudaDeviceHandle {
    pub fn memory(&self) -> &CudaMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut CudaMemory {
        &mut self.memory
    }
}

#[cfg(feature = "cuda")]
impl Device for CudaDeviceHandle {
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

    fn synchronize(&self) -> Result<()> {
        self.memory.device().synchronize()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
