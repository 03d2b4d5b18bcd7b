//! Host-side emulation of device memory
//!
//! Each emulated device has one [`MemoryPool`] shared by every handle opened on
//! it, so free memory reported by the driver reflects allocations made by all
//! launchers bound to that device.
//!
//! [`MemoryPool::reset`] starts a new generation: the whole capacity becomes
//! free and buffers allocated before it are invalid in every handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::BufferHandle;
use crate::error::{BackendError, Result};

const VOXEL_BYTES: usize = std::mem::size_of::<f32>();

/// Capacity accounting for one emulated device
#[derive(Debug)]
pub struct MemoryPool {
    capacity: usize,
    used: AtomicUsize,
    generation: AtomicU64,
}

impl MemoryPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Free the whole capacity, invalidating every outstanding buffer.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.used.store(0, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }

    /// Claim `bytes`, failing without side effects when the pool is too small.
    pub fn reserve(&self, bytes: usize) -> Result<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.capacity)
            })
            .map(|_| ())
            .map_err(|used| BackendError::OutOfMemory {
                requested: bytes,
                available: self.capacity.saturating_sub(used),
            })
    }

    pub fn release(&self, bytes: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| Some(used.saturating_sub(bytes)));
    }
}

/// Buffers owned by one opened host device
#[derive(Debug)]
pub struct HostMemory {
    pool: Arc<MemoryPool>,
    /// Pool generation the buffers were allocated in
    generation: u64,
    buffers: HashMap<u64, Vec<f32>>,
    next_buffer_id: u64,
    allocated_bytes: usize,
}

impl HostMemory {
    pub fn new(pool: Arc<MemoryPool>) -> Self {
        Self {
            generation: pool.generation(),
            pool,
            buffers: HashMap::new(),
            next_buffer_id: 1,
            allocated_bytes: 0,
        }
    }

    fn is_stale(&self) -> bool {
        self.generation != self.pool.generation()
    }

    /// Drop buffers invalidated by a pool reset; their bytes were already released.
    fn sync_generation(&mut self) {
        if self.is_stale() {
            tracing::debug!(buffers = self.buffers.len(), "host_buffers_invalidated");
            self.buffers.clear();
            self.allocated_bytes = 0;
            self.generation = self.pool.generation();
        }
    }

    fn live_buffer(&self, handle: BufferHandle) -> Result<&Vec<f32>> {
        if self.is_stale() {
            return Err(BackendError::InvalidBufferHandle(handle.id()));
        }
        self.buffers
            .get(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    /// Allocate a zeroed buffer of `len` voxels
    pub fn allocate_buffer(&mut self, len: usize) -> Result<BufferHandle> {
        self.sync_generation();
        let bytes = len.checked_mul(VOXEL_BYTES).ok_or(BackendError::OutOfMemory {
            requested: usize::MAX,
            available: self.pool.available(),
        })?;
        self.pool.reserve(bytes)?;

        let mut data = Vec::new();
        if let Err(err) = data.try_reserve_exact(len) {
            self.pool.release(bytes);
            return Err(BackendError::HostAllocation(err.to_string()));
        }
        data.resize(len, 0.0);

        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(id, data);
        self.allocated_bytes += bytes;

        Ok(BufferHandle::new(id))
    }

    /// Free a buffer
    pub fn free_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        self.sync_generation();
        let data = self
            .buffers
            .remove(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        let bytes = data.len() * VOXEL_BYTES;
        self.allocated_bytes -= bytes;
        self.pool.release(bytes);
        Ok(())
    }

    pub fn buffer(&self, handle: BufferHandle) -> Result<&[f32]> {
        self.live_buffer(handle).map(Vec::as_slice)
    }

    pub fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut [f32]> {
        self.sync_generation();
        self.buffers
            .get_mut(&handle.id())
            .map(Vec::as_mut_slice)
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    /// Copy data to buffer
    pub fn copy_to_buffer(&mut self, handle: BufferHandle, data: &[f32]) -> Result<()> {
        let buffer = self.buffer_mut(handle)?;
        if buffer.len() != data.len() {
            return Err(BackendError::BufferSizeMismatch {
                expected: buffer.len(),
                actual: data.len(),
            });
        }
        buffer.copy_from_slice(data);
        Ok(())
    }

    /// Copy data from buffer
    pub fn copy_from_buffer(&self, handle: BufferHandle, data: &mut [f32]) -> Result<()> {
        let buffer = self.buffer(handle)?;
        if buffer.len() != data.len() {
            return Err(BackendError::BufferSizeMismatch {
                expected: buffer.len(),
                actual: data.len(),
            });
        }
        data.copy_from_slice(buffer);
        Ok(())
    }

    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle) -> Result<()> {
        self.sync_generation();
        if src == dst {
            self.buffer(src)?;
            return Ok(());
        }
        let source = self
            .buffers
            .remove(&src.id())
            .ok_or(BackendError::InvalidBufferHandle(src.id()))?;
        let result = self.copy_to_buffer(dst, &source);
        self.buffers.insert(src.id(), source);
        result
    }

    /// Element count of a buffer
    pub fn buffer_len(&self, handle: BufferHandle) -> Result<usize> {
        self.buffer(handle).map(<[f32]>::len)
    }

    pub fn allocated_bytes(&self) -> usize {
        if self.is_stale() {
            0
        } else {
            self.allocated_bytes
        }
    }

    /// Run `f` with `target` borrowed mutably and every `sources` buffer borrowed
    /// immutably.
    pub fn with_buffers<R>(
        &mut self,
        target: BufferHandle,
        sources: &[BufferHandle],
        f: impl FnOnce(&mut [f32], &[&[f32]]) -> R,
    ) -> Result<R> {
        self.sync_generation();
        if sources.contains(&target) {
            return Err(BackendError::Other(format!(
                "{target} cannot be both the target and a source"
            )));
        }
        let mut data = self
            .buffers
            .remove(&target.id())
            .ok_or(BackendError::InvalidBufferHandle(target.id()))?;

        let views: Result<Vec<&[f32]>> = sources.iter().map(|handle| self.buffer(*handle)).collect();
        let result = views.map(|views| f(data.as_mut_slice(), views.as_slice()));

        self.buffers.insert(target.id(), data);
        result
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        if !self.is_stale() {
            self.pool.release(self.allocated_bytes);
        }
    }
}
