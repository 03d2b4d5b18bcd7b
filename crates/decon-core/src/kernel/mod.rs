//! Compute kernel and stopping-criterion collaborators
//!
//! The launcher owns the run; a [`ComputeKernel`] owns the numerics. For every
//! tile the launcher allocates the [`TileBuffers`], uploads the observed data and
//! the PSF, initialises the estimate with the observed data and then calls
//! [`ComputeKernel::prepare`], [`ComputeKernel::apply_iteration`] once per
//! iteration, and [`ComputeKernel::finish`]. Whatever the estimate buffer holds
//! afterwards is the tile's result.
//!
//! Kernel failures are [`BackendError`]s and reach the caller of `run` unchanged.

mod reference;
mod stopping;

pub use reference::{gaussian_psf, IdentityKernel, RichardsonLucyKernel};
pub use stopping::{NeverStop, RelativeChange, StoppingCriterion};

use decon_backends::{BackendError, BufferHandle, Device};

use crate::geometry::Shape3;
use crate::params::Optics;
use crate::tiling::Tile;
use crate::validate::ValidatedParameters;

/// Result type for kernel calls
pub type KernelResult<T> = std::result::Result<T, BackendError>;

/// Device buffers of one tile, each `tile.staged` voxels long
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBuffers {
    pub observed: BufferHandle,
    pub estimate: BufferHandle,
    pub psf: BufferHandle,
    /// Refined PSF in blind mode
    pub psf_estimate: Option<BufferHandle>,
}

impl TileBuffers {
    pub fn handles(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        [Some(self.observed), Some(self.estimate), Some(self.psf), self.psf_estimate]
            .into_iter()
            .flatten()
    }
}

/// Everything a kernel sees while processing one tile
pub struct TileContext<'a> {
    pub device: &'a mut dyn Device,
    pub tile: &'a Tile,
    pub buffers: TileBuffers,
    pub params: &'a ValidatedParameters,
}

impl TileContext<'_> {
    pub fn shape(&self) -> Shape3 {
        self.tile.staged
    }

    pub fn subvolume(&self) -> usize {
        self.tile.index
    }
}

/// Numerical engine driven by the launcher
pub trait ComputeKernel: Send {
    fn name(&self) -> &str;

    /// Called once per tile after its buffers are staged
    fn prepare(&mut self, ctx: &mut TileContext<'_>) -> KernelResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Advance the tile's estimate by one iteration
    fn apply_iteration(&mut self, ctx: &mut TileContext<'_>, iteration: usize) -> KernelResult<()>;

    /// Theoretical PSF of `shape` voxels, centred at `shape / 2`
    fn generate_psf(&mut self, optics: &Optics, shape: Shape3) -> KernelResult<Vec<f32>>;

    /// Called once per tile after the last iteration, including aborted tiles
    fn finish(&mut self, ctx: &mut TileContext<'_>) -> KernelResult<()> {
        let _ = ctx;
        Ok(())
    }
}
