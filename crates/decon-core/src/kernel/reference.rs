//! Host reference kernels
//!
//! [`IdentityKernel`] leaves the estimate untouched and is the fixed point used
//! to test orchestration. [`RichardsonLucyKernel`] runs Richardson–Lucy
//! iterations with direct convolution on [`HostDevice`] buffers; it is meant for
//! small volumes and for exercising the launcher end to end.

use decon_backends::{BackendError, HostDevice};
use rayon::prelude::*;

use super::{ComputeKernel, KernelResult, TileContext};
use crate::geometry::Shape3;
use crate::params::{Optics, PsfType};

/// Single unit voxel at the centre of `shape`
fn delta_psf(shape: Shape3) -> Vec<f32> {
    let mut psf = vec![0.0; shape.voxels()];
    if !psf.is_empty() {
        psf[shape.offset(shape.nx / 2, shape.ny / 2, shape.nz / 2)] = 1.0;
    }
    psf
}

/// Kernel that keeps every tile at its observed values
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityKernel;

impl ComputeKernel for IdentityKernel {
    fn name(&self) -> &str {
        "identity"
    }

    fn apply_iteration(&mut self, _ctx: &mut TileContext<'_>, _iteration: usize) -> KernelResult<()> {
        Ok(())
    }

    fn generate_psf(&mut self, _optics: &Optics, shape: Shape3) -> KernelResult<Vec<f32>> {
        Ok(delta_psf(shape))
    }
}

/// Gaussian approximation of a theoretical PSF, normalised to unit sum and
/// centred at `shape / 2`.
pub fn gaussian_psf(optics: &Optics, shape: Shape3) -> Vec<f32> {
    let mut sigma_r = 0.21 * optics.lambda / optics.na;
    let mut sigma_z = 0.66 * optics.lambda * optics.ri / (optics.na * optics.na);
    if matches!(optics.psf_type, PsfType::Confocal | PsfType::TwoPhoton) {
        sigma_r /= std::f32::consts::SQRT_2;
        sigma_z /= std::f32::consts::SQRT_2;
    }
    if let Some(light_sheet) = optics.light_sheet {
        let sheet = 0.42 * optics.lambda / light_sheet.na;
        sigma_z = 1.0 / (1.0 / (sigma_z * sigma_z) + 1.0 / (sheet * sheet)).sqrt();
    }

    let sr = (sigma_r / optics.dr).max(f32::EPSILON);
    let sz = if optics.dz > 0.0 {
        (sigma_z / optics.dz).max(f32::EPSILON)
    } else {
        f32::INFINITY
    };
    let center = [shape.nx / 2, shape.ny / 2, shape.nz / 2];

    let mut psf = vec![0.0f32; shape.voxels()];
    psf.par_chunks_mut(shape.plane_len().max(1))
        .enumerate()
        .for_each(|(z, plane)| {
            let dz = z as f32 - center[2] as f32;
            let axial = if shape.nz > 1 { (dz * dz) / (2.0 * sz * sz) } else { 0.0 };
            for (i, value) in plane.iter_mut().enumerate() {
                let dx = (i % shape.nx) as f32 - center[0] as f32;
                let dy = (i / shape.nx) as f32 - center[1] as f32;
                *value = (-(dx * dx + dy * dy) / (2.0 * sr * sr) - axial).exp();
            }
        });

    let sum: f32 = psf.par_iter().sum();
    if sum > 0.0 && sum.is_finite() {
        psf.par_iter_mut().for_each(|value| *value /= sum);
        psf
    } else {
        delta_psf(shape)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Tap {
    offset: [isize; 3],
    weight: f32,
}

/// Richardson–Lucy on host devices. The PSF stays fixed, also in blind mode.
#[derive(Debug, Clone)]
pub struct RichardsonLucyKernel {
    /// Taps below this fraction of the PSF maximum are dropped
    cutoff: f32,
    taps: Vec<Tap>,
}

impl Default for RichardsonLucyKernel {
    fn default() -> Self {
        Self::new(1e-4)
    }
}

impl RichardsonLucyKernel {
    pub fn new(cutoff: f32) -> Self {
        Self {
            cutoff,
            taps: Vec::new(),
        }
    }

    fn host<'a>(ctx: &'a mut TileContext<'_>) -> KernelResult<&'a mut HostDevice> {
        ctx.device
            .as_any_mut()
            .downcast_mut::<HostDevice>()
            .ok_or_else(|| BackendError::Other("the Richardson-Lucy reference kernel needs a host device".to_string()))
    }
}

/// `out[p] = Σ w · input[p ∓ d]`, edges clamped; `mirrored` correlates instead of convolving.
fn convolve(input: &[f32], shape: Shape3, taps: &[Tap], mirrored: bool, out: &mut [f32]) {
    let sign: isize = if mirrored { 1 } else { -1 };
    let clamp = |value: isize, extent: usize| value.clamp(0, extent as isize - 1) as usize;

    out.par_chunks_mut(shape.plane_len().max(1))
        .enumerate()
        .for_each(|(z, plane)| {
            for (i, value) in plane.iter_mut().enumerate() {
                let x = (i % shape.nx) as isize;
                let y = (i / shape.nx) as isize;
                *value = taps
                    .iter()
                    .map(|tap| {
                        let sx = clamp(x + sign * tap.offset[0], shape.nx);
                        let sy = clamp(y + sign * tap.offset[1], shape.ny);
                        let sz = clamp(z as isize + sign * tap.offset[2], shape.nz);
                        tap.weight * input[shape.offset(sx, sy, sz)]
                    })
                    .sum();
            }
        });
}

impl ComputeKernel for RichardsonLucyKernel {
    fn name(&self) -> &str {
        "richardson-lucy"
    }

    fn prepare(&mut self, ctx: &mut TileContext<'_>) -> KernelResult<()> {
        let shape = ctx.shape();
        let psf_handle = ctx.buffers.psf_estimate.unwrap_or(ctx.buffers.psf);
        let host = Self::host(ctx)?;
        let psf = host.buffer(psf_handle)?;

        let max = psf.iter().copied().fold(0.0f32, f32::max);
        if max <= 0.0 {
            return Err(BackendError::Other("PSF has no positive voxel".to_string()));
        }
        let center = [shape.nx / 2, shape.ny / 2, shape.nz / 2];
        let mut taps = Vec::new();
        for z in 0..shape.nz {
            for y in 0..shape.ny {
                for x in 0..shape.nx {
                    let weight = psf[shape.offset(x, y, z)];
                    if weight > max * self.cutoff {
                        taps.push(Tap {
                            offset: [
                                x as isize - center[0] as isize,
                                y as isize - center[1] as isize,
                                z as isize - center[2] as isize,
                            ],
                            weight,
                        });
                    }
                }
            }
        }
        let sum: f32 = taps.iter().map(|tap| tap.weight).sum();
        taps.iter_mut().for_each(|tap| tap.weight /= sum);

        tracing::trace!(subvolume = ctx.tile.index, taps = taps.len(), "psf_taps_prepared");
        self.taps = taps;
        Ok(())
    }

    fn apply_iteration(&mut self, ctx: &mut TileContext<'_>, _iteration: usize) -> KernelResult<()> {
        let shape = ctx.shape();
        let background = ctx.params.params().background;
        let buffers = ctx.buffers;
        let taps = &self.taps;
        let host = Self::host(ctx)?;

        host.with_buffers(buffers.estimate, &[buffers.observed], |estimate, inputs| {
            let observed = inputs[0];
            let mut blurred = vec![0.0; estimate.len()];
            convolve(estimate, shape, taps, false, &mut blurred);

            blurred.par_iter_mut().zip(observed.par_iter()).for_each(|(b, &o)| {
                let denominator = *b + background;
                *b = if denominator > f32::EPSILON { o / denominator } else { 0.0 };
            });

            let mut correction = vec![0.0; estimate.len()];
            convolve(&blurred, shape, taps, true, &mut correction);

            estimate
                .par_iter_mut()
                .zip(correction.par_iter())
                .for_each(|(e, &c)| *e *= c);
        })
    }

    fn generate_psf(&mut self, optics: &Optics, shape: Shape3) -> KernelResult<Vec<f32>> {
        Ok(gaussian_psf(optics, shape))
    }
}
