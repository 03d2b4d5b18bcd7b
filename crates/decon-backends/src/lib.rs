//! Device layer for the deconvolution launcher
//!
//! This crate provides:
//! - **Device traits**: [`Device`] (buffers and transfers on one opened device)
//!   and [`DeviceDriver`] (enumeration and control of a runtime's devices)
//! - **Host driver**: devices emulated in system memory with per-device capacity
//! - **CUDA driver**: NVIDIA GPUs through `cudarc` (feature `cuda`)
//! - **Device registry**: cached catalogue and per-thread device selection
//!
//! # Usage
//!
//! ```rust
//! use decon_backends::{DeviceRegistry, HostDeviceSpec};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = DeviceRegistry::host(vec![HostDeviceSpec::new("gpu0", 256 << 20)]);
//! registry.set_device(0)?;
//!
//! let mut device = registry.open(registry.current_device())?;
//! let buffer = device.allocate_buffer(4)?;
//! device.upload(buffer, &[1.0, 2.0, 3.0, 4.0])?;
//!
//! let mut out = [0.0f32; 4];
//! device.download(buffer, &mut out)?;
//! assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
//! device.free_buffer(buffer)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod error;
pub mod registry;

pub use backend::{BufferHandle, ComputeCapability, Device, DeviceDriver, DeviceInfo};
#[cfg(feature = "cuda")]
pub use backends::{CudaDeviceHandle, CudaDriver};
pub use backends::{HostDevice, HostDeviceSpec, HostDriver};
pub use error::{BackendError, Result};
pub use registry::DeviceRegistry;
