//! Device and driver traits
//!
//! A [`DeviceDriver`] enumerates the devices of one runtime and opens them. An
//! opened [`Device`] owns the buffers allocated through it; dropping the device
//! releases every buffer it still holds.
//!
//! ```text
//! DeviceRegistry ──► DeviceDriver ──open(i)──► Box<dyn Device>
//!                    ├── HostDriver            ├── HostDevice
//!                    └── CudaDriver (cuda)     └── CudaDeviceHandle (cuda)
//! ```
//!
//! Buffers hold `f32` voxels. Transfers are whole-buffer: the host slice must have
//! exactly the buffer's element count.

use std::any::Any;

use super::types::{BufferHandle, DeviceInfo};
use crate::error::Result;

/// An opened compute device
pub trait Device: Send {
    /// Index of this device in its driver's enumeration
    fn index(&self) -> usize;

    /// Allocate a zero-initialised buffer of `len` voxels
    fn allocate_buffer(&mut self, len: usize) -> Result<BufferHandle>;

    /// Free a buffer
    fn free_buffer(&mut self, handle: BufferHandle) -> Result<()>;

    /// Copy host data into a buffer
    fn upload(&mut self, handle: BufferHandle, data: &[f32]) -> Result<()>;

    /// Copy a buffer back to the host
    fn download(&self, handle: BufferHandle, data: &mut [f32]) -> Result<()>;

    /// Device-to-device copy between two buffers of equal length
    fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle) -> Result<()>;

    /// Element count of a buffer
    fn buffer_len(&self, handle: BufferHandle) -> Result<usize>;

    /// Bytes currently allocated through this handle
    fn allocated_bytes(&self) -> usize;

    /// Block until queued work has completed
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    /// Downcast support for kernels that need the concrete device
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support for kernels that need the concrete device
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Enumeration and control of the devices of one runtime
pub trait DeviceDriver: Send + Sync {
    /// Short runtime name (`"host"`, `"cuda"`)
    fn name(&self) -> &str;

    /// Number of devices visible to this driver
    fn device_count(&self) -> Result<usize>;

    /// Static description of device `index`
    fn describe(&self, index: usize) -> Result<DeviceInfo>;

    /// Currently allocatable bytes on device `index`
    fn free_memory(&self, index: usize) -> Result<usize>;

    /// Installed driver version, if the runtime reports one
    fn driver_version(&self) -> Result<Option<f32>>;

    /// Oldest driver version this runtime supports
    fn minimum_driver_version(&self) -> Option<f32> {
        None
    }

    /// Whether device `a` can address memory on device `b`
    fn can_access_peer(&self, a: usize, b: usize) -> Result<bool>;

    /// Open device `index` for buffer management
    fn open(&self, index: usize) -> Result<Box<dyn Device>>;

    /// Hard reset of device `index`
    fn reset(&self, index: usize) -> Result<()>;
}
