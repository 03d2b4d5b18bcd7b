//! Handles and device descriptions

use std::fmt;

/// Handle to a buffer allocated on a [`Device`](super::Device)
///
/// Buffers are opaque handles owned by the device that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

impl BufferHandle {
    /// Create a new buffer handle
    pub const fn new(id: u64) -> Self {
        BufferHandle(id)
    }

    /// Get the internal ID
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// Compute capability as reported by the driver (`major.minor`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    /// Oldest capability the launcher accepts.
    pub const MINIMUM: ComputeCapability = ComputeCapability::new(2, 0);

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Capability as a decimal, e.g. `7.5`.
    pub fn as_f32(self) -> f32 {
        format!("{}.{}", self.major, self.minor).parse().unwrap_or(self.major as f32)
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Static description of one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    /// Total device memory in bytes
    pub total_memory: usize,
    pub compute_capability: ComputeCapability,
    /// Device runs the Tesla Compute Cluster driver model
    pub tesla_tcc: bool,
}
