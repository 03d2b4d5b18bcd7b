//! CUDA device buffers

#[cfg(feature = "cuda")]
use crate::backend::BufferHandle;
#[cfg(feature = "cuda")]
use crate::error::{BackendError, Result};

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaDevice, CudaSlice};

#[cfg(feature = "cuda")]
use std::collections::HashMap;

#[cfg(feature = "cuda")]
use std::sync::Arc;

/// Buffers allocated on one CUDA device
#[cfg(feature = "cuda")]
pub struct CudaMemory {
    device: Arc<CudaDevice>,
    buffers: HashMap<u64, CudaSlice<f32>>,
    next_buffer_id: u64,
    allocated_bytes: usize,
}

#[cfg(feature = "cuda")]
impl CudaMemory {
    pub fn new(device: Arc<CudaDevice>) -> Self {
        Self {
            device,
            buffers: HashMap::new(),
            next_buffer_id: 1,
            allocated_bytes: 0,
        }
    }

    /// Allocate a zeroed buffer of `len` voxels
    pub fn allocate_buffer(&mut self, len: usize) -> Result<BufferHandle> {
        let bytes = len * std::mem::size_of::<f32>();
        self.device.bind_to_thread()?;
        let (free, _total) = cudarc::driver::result::mem_get_info()?;
        if bytes > free {
            return Err(BackendError::OutOfMemory {
                requested: bytes,
                available: free,
            });
        }

        let slice = self
            .device
            .alloc_zeros::<f32>(len)
            .map_err(|e| BackendError::DeviceAllocation(e.to_string()))?;

        let handle = BufferHandle::new(self.next_buffer_id);
        self.next_buffer_id += 1;
        self.buffers.insert(handle.id(), slice);
        self.allocated_bytes += bytes;

        Ok(handle)
    }

    pub fn free_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let slice = self
            .buffers
            .remove(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        self.allocated_bytes -= slice.len() * std::mem::size_of::<f32>();
        // device memory is released when the slice drops
        Ok(())
    }

    pub fn copy_to_buffer(&mut self, handle: BufferHandle, data: &[f32]) -> Result<()> {
        let slice = self
            .buffers
            .get_mut(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        if slice.len() != data.len() {
            return Err(BackendError::BufferSizeMismatch {
                expected: slice.len(),
                actual: data.len(),
            });
        }
        self.device.htod_sync_copy_into(data, slice)?;
        Ok(())
    }

    pub fn copy_from_buffer(&self, handle: BufferHandle, data: &mut [f32]) -> Result<()> {
        let slice = self.get_buffer(handle)?;
        if slice.len() != data.len() {
            return Err(BackendError::BufferSizeMismatch {
                expected: slice.len(),
                actual: data.len(),
            });
        }
        self.device.dtoh_sync_copy_into(slice, data)?;
        Ok(())
    }

    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle) -> Result<()> {
        if src == dst {
            self.get_buffer(src)?;
            return Ok(());
        }
        let source = self
            .buffers
            .remove(&src.id())
            .ok_or(BackendError::InvalidBufferHandle(src.id()))?;
        let result = match self.buffers.get_mut(&dst.id()) {
            Some(target) if target.len() == source.len() => {
                self.device.dtod_copy(&source, target).map_err(BackendError::from)
            }
            Some(target) => Err(BackendError::BufferSizeMismatch {
                expected: target.len(),
                actual: source.len(),
            }),
            None => Err(BackendError::InvalidBufferHandle(dst.id())),
        };
        self.buffers.insert(src.id(), source);
        result
    }

    pub fn buffer_len(&self, handle: BufferHandle) -> Result<usize> {
        self.get_buffer(handle).map(|slice| slice.len())
    }

    /// Device slice for kernels launched against this buffer
    pub fn get_buffer(&self, handle: BufferHandle) -> Result<&CudaSlice<f32>> {
        self.buffers
            .get(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    pub fn get_buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut CudaSlice<f32>> {
        self.buffers
            .get_mut(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }
}
