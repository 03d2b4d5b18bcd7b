//! Result assembly
//!
//! Tile results are collected in an [`Accumulator`] while a run is in progress
//! and committed to the image volume when the run reaches cleanup. Retrieval
//! converts the float volume to the caller's sample type under a [`Scaling`]
//! policy; values never wrap.

use rayon::prelude::*;

use crate::error::{Error, ErrorKind, Result};
use crate::geometry::Shape3;
use crate::params::Scaling;
use crate::tiling::Tile;
use crate::volume::{Sample, Volume};

/// Host copy of the image that tile cores are written into
#[derive(Debug, Clone)]
pub struct Accumulator {
    shape: Shape3,
    data: Vec<f32>,
}

impl Accumulator {
    /// Start from the current contents of `volume`, so voxels of tiles that are
    /// never reached keep their observed values.
    pub fn from_volume(volume: &Volume) -> Result<Self> {
        let source = volume.read();
        let mut data = Vec::new();
        data.try_reserve_exact(source.len()).map_err(|err| {
            Error::new(
                ErrorKind::BadAllocCpu,
                format!("cannot allocate the {} result accumulator: {err}", volume.shape()),
            )
        })?;
        data.extend_from_slice(&source);
        Ok(Self {
            shape: volume.shape(),
            data,
        })
    }

    pub fn shape(&self) -> Shape3 {
        self.shape
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Copy the core of a finished tile out of its staged result
    pub fn insert_core(&mut self, tile: &Tile, staged: &[f32]) -> Result<()> {
        if staged.len() != tile.staged.voxels() {
            return Err(Error::new(
                ErrorKind::Unspecified,
                format!(
                    "subvolume {} returned {} voxels, expected {}",
                    tile.index,
                    staged.len(),
                    tile.staged.voxels()
                ),
            ));
        }
        let [px, py, pz] = tile.padding;
        let [ox, oy, oz] = tile.core.origin;
        let [ex, ey, ez] = tile.core.extent;
        for z in 0..ez {
            for y in 0..ey {
                let src = tile.staged.offset(px, py + y, pz + z);
                let dst = self.shape.offset(ox, oy + y, oz + z);
                self.data[dst..dst + ex].copy_from_slice(&staged[src..src + ex]);
            }
        }
        Ok(())
    }

    /// Write the accumulated result into `volume`
    pub fn commit(&self, volume: &Volume) {
        volume.write().copy_from_slice(&self.data);
    }
}

/// Factor applied before integer conversion: `range_max / max` when the volume
/// exceeds the range of `scaling`, 1 otherwise.
pub fn scale_factor(data: &[f32], scaling: Scaling) -> f32 {
    let Some(range_max) = scaling.range_max() else {
        return 1.0;
    };
    let max = data
        .par_iter()
        .copied()
        .reduce(|| f32::NEG_INFINITY, f32::max);
    if max.is_finite() && max > range_max {
        range_max / max
    } else {
        1.0
    }
}

/// Convert one value for output
#[inline]
pub fn convert<T: Sample>(value: f32, factor: f32, scaling: Scaling) -> T {
    let mut value = if factor != 1.0 { value * factor } else { value };
    if let Some(range_max) = scaling.range_max() {
        value = value.round().clamp(0.0, range_max);
    }
    T::from_f32(value)
}

/// Copy plane `z` of `volume` into `dst`
pub fn retrieve_slice<T: Sample>(volume: &Volume, z: usize, dst: &mut [T], factor: f32, scaling: Scaling) -> Result<()> {
    let plane = volume.slice(z)?;
    if dst.len() != plane.len() {
        return Err(Error::new(
            ErrorKind::BadDimensionX,
            format!("destination holds {} samples, a plane has {}", dst.len(), plane.len()),
        ));
    }
    dst.par_iter_mut()
        .zip(plane.par_iter())
        .for_each(|(out, &value)| *out = convert(value, factor, scaling));
    Ok(())
}

/// Place `src` centred in `dst_shape`: zero-padded on axes where it is smaller,
/// centre-cropped where it is larger.
pub fn fit_centered(src: &[f32], src_shape: Shape3, dst_shape: Shape3) -> Vec<f32> {
    let mut dst = vec![0.0; dst_shape.voxels()];
    let src_dims = src_shape.dims();
    let dst_dims = dst_shape.dims();
    let mut src_start = [0; 3];
    let mut dst_start = [0; 3];
    let mut len = [0; 3];
    for axis in 0..3 {
        // voxel n / 2 is the centre on both sides
        if dst_dims[axis] >= src_dims[axis] {
            dst_start[axis] = dst_dims[axis] / 2 - src_dims[axis] / 2;
            len[axis] = src_dims[axis];
        } else {
            src_start[axis] = src_dims[axis] / 2 - dst_dims[axis] / 2;
            len[axis] = dst_dims[axis];
        }
    }

    for z in 0..len[2] {
        for y in 0..len[1] {
            let from = src_shape.offset(src_start[0], src_start[1] + y, src_start[2] + z);
            let to = dst_shape.offset(dst_start[0], dst_start[1] + y, dst_start[2] + z);
            dst[to..to + len[0]].copy_from_slice(&src[from..from + len[0]]);
        }
    }
    dst
}
