//! Driver implementations
//!
//! - `host` - devices emulated in system memory (always available)
//! - `cuda` - NVIDIA GPUs through `cudarc` (feature `cuda`)

pub mod cuda;
pub mod host;

#[cfg(feature = "cuda")]
pub use cuda::{CudaDeviceHandle, CudaDriver};
pub use host::{HostDevice, HostDeviceSpec, HostDriver};
