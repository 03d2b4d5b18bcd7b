//! Device abstraction shared by every driver

pub mod traits;
pub mod types;

pub use traits::{Device, DeviceDriver};
pub use types::{BufferHandle, ComputeCapability, DeviceInfo};
