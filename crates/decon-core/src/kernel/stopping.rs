//! Early termination of a tile's iterations

use decon_backends::Device;

use super::{KernelResult, TileContext};

/// Decides after each iteration whether a tile has converged
pub trait StoppingCriterion: Send {
    /// Called before the first iteration of every tile
    fn reset(&mut self) {}

    /// `true` stops the current tile after `iteration`
    fn should_stop(&mut self, ctx: &TileContext<'_>, iteration: usize) -> KernelResult<bool>;
}

/// Always run the requested number of iterations
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStop;

impl StoppingCriterion for NeverStop {
    fn should_stop(&mut self, _ctx: &TileContext<'_>, _iteration: usize) -> KernelResult<bool> {
        Ok(false)
    }
}

/// Stop once `‖xₖ − xₖ₋₁‖ / ‖xₖ₋₁‖` drops below `tolerance`
///
/// Downloads the estimate after every iteration.
#[derive(Debug, Clone)]
pub struct RelativeChange {
    tolerance: f32,
    previous: Option<Vec<f32>>,
}

impl RelativeChange {
    pub fn new(tolerance: f32) -> Self {
        Self {
            tolerance,
            previous: None,
        }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }
}

impl StoppingCriterion for RelativeChange {
    fn reset(&mut self) {
        self.previous = None;
    }

    fn should_stop(&mut self, ctx: &TileContext<'_>, iteration: usize) -> KernelResult<bool> {
        let device: &dyn Device = &*ctx.device;
        let mut current = vec![0.0; device.buffer_len(ctx.buffers.estimate)?];
        device.download(ctx.buffers.estimate, &mut current)?;

        let Some(previous) = self.previous.replace(current) else {
            return Ok(false);
        };
        let current = self.previous.as_deref().unwrap_or_default();

        let (diff, norm) = previous
            .iter()
            .zip(current)
            .fold((0.0f64, 0.0f64), |(diff, norm), (&old, &new)| {
                let delta = f64::from(new - old);
                (diff + delta * delta, norm + f64::from(old) * f64::from(old))
            });
        let change = if norm > 0.0 { (diff / norm).sqrt() } else { diff.sqrt() };
        let converged = change < f64::from(self.tolerance);
        if converged {
            tracing::debug!(subvolume = ctx.subvolume(), iteration, change, "tile_converged");
        }
        Ok(converged)
    }
}
