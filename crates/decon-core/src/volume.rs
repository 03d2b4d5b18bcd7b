//! Host volumes and slice staging
//!
//! A [`Volume`] is a dense `f32` array shared through an
//! `Arc<parking_lot::RwLock<Vec<f32>>>`. A launcher either allocates it or
//! wraps a caller's [`SharedVolume`], in which case results land in the caller's
//! buffer. Every allocation gets a process-unique id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rayon::prelude::*;

use crate::error::{Error, ErrorKind, Result};
use crate::geometry::Shape3;
use crate::tiling::Tile;

/// Caller-owned voxel storage
pub type SharedVolume = Arc<RwLock<Vec<f32>>>;

static NEXT_VOLUME_ID: AtomicU64 = AtomicU64::new(1);

/// Voxel types accepted by the slice setters and getters
pub trait Sample: bytemuck::Pod + Send + Sync + 'static {
    const NAME: &'static str;

    /// Largest representable value, `None` for floating point
    const MAX: Option<f32>;

    fn to_f32(self) -> f32;

    /// Convert a float, rounding to nearest and saturating for integer types
    fn from_f32(value: f32) -> Self;
}

impl Sample for f32 {
    const NAME: &'static str = "f32";
    const MAX: Option<f32> = None;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Sample for u16 {
    const NAME: &'static str = "u16";
    const MAX: Option<f32> = Some(u16::MAX as f32);

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        // `as` saturates and maps NaN to 0
        value.round() as u16
    }
}

impl Sample for u8 {
    const NAME: &'static str = "u8";
    const MAX: Option<f32> = Some(u8::MAX as f32);

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value.round() as u8
    }
}

/// Dense voxel volume
#[derive(Debug, Clone)]
pub struct Volume {
    id: u64,
    shape: Shape3,
    data: SharedVolume,
}

impl Volume {
    /// Allocate a zeroed volume
    pub fn zeros(shape: Shape3) -> Result<Self> {
        let voxels = shape.checked_voxels().ok_or_else(|| {
            Error::new(
                ErrorKind::BadAllocCpu,
                format!("a {shape} host volume exceeds the address space"),
            )
        })?;
        let mut data = Vec::new();
        data.try_reserve_exact(voxels).map_err(|err| {
            Error::new(
                ErrorKind::BadAllocCpu,
                format!("cannot allocate a {shape} host volume: {err}"),
            )
        })?;
        data.resize(voxels, 0.0);
        Ok(Self::wrap(shape, Arc::new(RwLock::new(data))))
    }

    /// Wrap caller storage; its length must match `shape`.
    pub fn from_shared(shape: Shape3, data: SharedVolume) -> Result<Self> {
        let len = data.read().len();
        if shape.checked_voxels() != Some(len) {
            return Err(Error::new(
                ErrorKind::BadDimensionX,
                format!("a {shape} volume does not fit a buffer of {len} voxels"),
            ));
        }
        Ok(Self::wrap(shape, data))
    }

    fn wrap(shape: Shape3, data: SharedVolume) -> Self {
        Self {
            id: NEXT_VOLUME_ID.fetch_add(1, Ordering::Relaxed),
            shape,
            data,
        }
    }

    /// Process-unique identity of this allocation
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn shape(&self) -> Shape3 {
        self.shape
    }

    pub fn shared(&self) -> SharedVolume {
        self.data.clone()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.data.write()
    }

    fn check_slice(&self, z: usize, len: usize) -> Result<()> {
        if z >= self.shape.nz {
            return Err(Error::new(
                ErrorKind::BadDimensionZ,
                format!("slice {z} is outside 0..{}", self.shape.nz),
            ));
        }
        if len != self.shape.plane_len() {
            return Err(Error::new(
                ErrorKind::BadDimensionX,
                format!(
                    "slice buffer holds {len} voxels, a {}x{} plane needs {}",
                    self.shape.nx,
                    self.shape.ny,
                    self.shape.plane_len()
                ),
            ));
        }
        Ok(())
    }

    fn plane_range(&self, z: usize) -> std::ops::Range<usize> {
        let plane = self.shape.plane_len();
        z * plane..(z + 1) * plane
    }

    /// Copy plane `z` in from `src`
    pub fn set_slice<T: Sample>(&self, z: usize, src: &[T]) -> Result<()> {
        self.check_slice(z, src.len())?;
        let range = self.plane_range(z);
        let mut data = self.data.write();
        for (dst, value) in data[range].iter_mut().zip(src) {
            *dst = value.to_f32();
        }
        Ok(())
    }

    /// Copy plane `z` in from raw native-endian bytes of `T`
    pub fn set_slice_bytes<T: Sample>(&self, z: usize, bytes: &[u8]) -> Result<()> {
        let size = std::mem::size_of::<T>();
        if bytes.len() % size != 0 {
            return Err(Error::new(
                ErrorKind::BadDimensionX,
                format!("{} bytes is not a whole number of {} samples", bytes.len(), T::NAME),
            ));
        }
        let samples: Vec<T> = bytemuck::pod_collect_to_vec(bytes);
        self.set_slice(z, &samples)
    }

    /// Borrow plane `z`
    pub fn slice(&self, z: usize) -> Result<MappedRwLockReadGuard<'_, [f32]>> {
        self.check_slice(z, self.shape.plane_len())?;
        let range = self.plane_range(z);
        Ok(RwLockReadGuard::map(self.data.read(), |data| &data[range]))
    }

    pub fn fill(&self, value: f32) {
        self.data.write().fill(value);
    }

    /// Copy of the staged extent of `tile`, edges replicated where the halo was clamped
    pub fn stage_tile(&self, tile: &Tile) -> Vec<f32> {
        let guard = self.data.read();
        let data: &[f32] = &guard;
        let shape = self.shape;
        let staged = tile.staged;
        let mut out = vec![0.0; staged.voxels()];

        out.par_chunks_mut(staged.plane_len().max(1))
            .enumerate()
            .for_each(|(sz, plane)| {
                let z = tile.source_coordinate(2, sz, shape.nz);
                for (sy, row) in plane.chunks_mut(staged.nx.max(1)).enumerate() {
                    let y = tile.source_coordinate(1, sy, shape.ny);
                    for (sx, voxel) in row.iter_mut().enumerate() {
                        let x = tile.source_coordinate(0, sx, shape.nx);
                        *voxel = data[shape.offset(x, y, z)];
                    }
                }
            });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Region;

    #[test]
    fn ids_are_unique() {
        let a = Volume::zeros(Shape3::new(2, 2, 1)).unwrap();
        let b = Volume::zeros(Shape3::new(2, 2, 1)).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn oversized_volumes_are_allocation_errors() {
        let err = Volume::zeros(Shape3::new(usize::MAX / 2, 4, 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadAllocCpu);

        let storage: SharedVolume = Arc::new(RwLock::new(vec![0.0; 4]));
        let err = Volume::from_shared(Shape3::new(usize::MAX, 2, 1), storage).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadDimensionX);
    }

    #[test]
    fn slices_convert_samples() {
        let volume = Volume::zeros(Shape3::new(3, 1, 2)).unwrap();
        volume.set_slice::<u8>(1, &[1, 2, 255]).unwrap();
        volume.set_slice::<u16>(0, &[1000, 0, 65535]).unwrap();
        assert_eq!(&*volume.slice(1).unwrap(), &[1.0, 2.0, 255.0]);
        assert_eq!(&*volume.slice(0).unwrap(), &[1000.0, 0.0, 65535.0]);
    }

    #[test]
    fn slice_errors() {
        let volume = Volume::zeros(Shape3::new(3, 1, 2)).unwrap();
        let err = volume.set_slice::<f32>(2, &[0.0; 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadDimensionZ);
        let err = volume.set_slice::<f32>(0, &[0.0; 4]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadDimensionX);
        assert_eq!(volume.slice(5).unwrap_err().kind(), ErrorKind::BadDimensionZ);
    }

    #[test]
    fn raw_bytes_are_reinterpreted() {
        let volume = Volume::zeros(Shape3::new(2, 1, 1)).unwrap();
        let samples: [u16; 2] = [7, 300];
        volume.set_slice_bytes::<u16>(0, bytemuck::cast_slice(&samples)).unwrap();
        assert_eq!(&*volume.slice(0).unwrap(), &[7.0, 300.0]);
        assert!(volume.set_slice_bytes::<u16>(0, &[1, 2, 3]).is_err());
    }

    #[test]
    fn caller_storage_is_shared() {
        let storage: SharedVolume = Arc::new(RwLock::new(vec![0.0; 4]));
        let volume = Volume::from_shared(Shape3::new(2, 2, 1), storage.clone()).unwrap();
        volume.fill(3.0);
        assert_eq!(*storage.read(), vec![3.0; 4]);

        let wrong = Arc::new(RwLock::new(vec![0.0; 3]));
        assert!(Volume::from_shared(Shape3::new(2, 2, 1), wrong).is_err());
    }

    #[test]
    fn staging_replicates_edges() {
        let shape = Shape3::new(3, 1, 1);
        let volume = Volume::zeros(shape).unwrap();
        volume.set_slice::<f32>(0, &[1.0, 2.0, 3.0]).unwrap();

        let tile = Tile {
            index: 0,
            grid: [0, 0, 0],
            core: Region::full(shape),
            halo: Region::full(shape),
            staged: Shape3::new(5, 1, 1),
            padding: [1, 0, 0],
        };
        assert_eq!(volume.stage_tile(&tile), vec![1.0, 1.0, 2.0, 3.0, 3.0]);
    }
}
