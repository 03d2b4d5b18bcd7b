//! Error types for device operations

/// Result type for device operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors raised by drivers, devices and compute kernels running on them
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Invalid buffer handle
    #[error("invalid buffer handle: {0}")]
    InvalidBufferHandle(u64),

    /// Host slice length does not match the device buffer
    #[error("buffer size mismatch: buffer holds {expected} elements, host slice has {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    /// Device index not present on this system
    #[error("device {index} is not available ({available} device(s) present)")]
    DeviceNotFound { index: usize, available: usize },

    /// Device is present but below the supported compute capability
    #[error("device {index} has compute capability {capability}, 2.0 or greater is required")]
    UnsupportedDevice { index: usize, capability: f32 },

    /// Installed driver is older than the minimum
    #[error("driver version {found} is older than the required {required}")]
    DriverTooOld { found: f32, required: f32 },

    /// Driver call failed
    #[error("driver error: {0}")]
    Driver(String),

    /// Not enough free device memory for the request
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// Device allocation failed for a reason other than capacity
    #[error("device allocation failed: {0}")]
    DeviceAllocation(String),

    /// Host allocation failed
    #[error("host allocation failed: {0}")]
    HostAllocation(String),

    /// Page-locked host allocation failed
    #[error("pinned host allocation failed: {0}")]
    PinnedAllocation(String),

    /// FFT plan or execution failure inside a kernel
    #[error("FFT failure: {0}")]
    Fft(String),

    /// Image-primitive library failure inside a kernel
    #[error("NPP failure: {0}")]
    Npp(String),

    /// Parallel-primitive library failure inside a kernel
    #[error("thrust failure: {0}")]
    Thrust(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

#[cfg(feature = "cuda")]
impl From<cudarc::driver::DriverError> for BackendError {
    fn from(err: cudarc::driver::DriverError) -> Self {
        BackendError::Driver(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_resource() {
        let err = BackendError::OutOfMemory {
            requested: 4096,
            available: 1024,
        };
        assert_eq!(
            err.to_string(),
            "out of device memory: requested 4096 bytes, 1024 available"
        );

        let err = BackendError::DeviceNotFound { index: 3, available: 1 };
        assert!(err.to_string().contains("device 3"));
    }
}
