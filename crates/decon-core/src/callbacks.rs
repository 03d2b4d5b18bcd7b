//! Progress callbacks
//!
//! Both callbacks run synchronously on the thread driving the run, in tile and
//! iteration order. Closures capture whatever context they need; an
//! [`crate::AbortHandle`] captured by the iteration callback is the usual way to
//! stop a run from inside it.

use std::fmt;

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RunState {
    /// Validating, planning and binding devices
    Init = 0,
    /// Tiles are being staged and iterated
    Running = 1,
    /// Tile results are being committed
    Cleanup = 2,
    /// Terminal for this run
    Finished = 3,
}

impl RunState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => RunState::Running,
            2 => RunState::Cleanup,
            3 => RunState::Finished,
            _ => RunState::Init,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "init",
            RunState::Running => "running",
            RunState::Cleanup => "cleanup",
            RunState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Position reported before each iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IterationProgress {
    /// 0-based iteration within the tile
    pub iteration: usize,
    /// 0-based tile index in raster order
    pub subvolume: usize,
}

pub trait IterationCallback: Send {
    fn on_iteration(&mut self, progress: IterationProgress);
}

impl<F> IterationCallback for F
where
    F: FnMut(IterationProgress) + Send,
{
    fn on_iteration(&mut self, progress: IterationProgress) {
        self(progress)
    }
}

pub trait StateCallback: Send {
    fn on_state(&mut self, state: RunState);
}

impl<F> StateCallback for F
where
    F: FnMut(RunState) + Send,
{
    fn on_state(&mut self, state: RunState) {
        self(state)
    }
}

/// Holds the registered callbacks; absent callbacks are no-ops.
#[derive(Default)]
pub struct CallbackDispatcher {
    iteration: Option<Box<dyn IterationCallback>>,
    state: Option<Box<dyn StateCallback>>,
}

impl fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("iteration", &self.iteration.is_some())
            .field("state", &self.state.is_some())
            .finish()
    }
}

impl CallbackDispatcher {
    pub fn set_iteration(&mut self, callback: impl IterationCallback + 'static) {
        self.iteration = Some(Box::new(callback));
    }

    pub fn set_state(&mut self, callback: impl StateCallback + 'static) {
        self.state = Some(Box::new(callback));
    }

    pub fn clear(&mut self) {
        self.iteration = None;
        self.state = None;
    }

    pub fn iteration(&mut self, progress: IterationProgress) {
        tracing::trace!(iteration = progress.iteration, subvolume = progress.subvolume, "iteration");
        if let Some(callback) = self.iteration.as_mut() {
            callback.on_iteration(progress);
        }
    }

    pub fn state(&mut self, state: RunState) {
        tracing::debug!(%state, "run_state");
        if let Some(callback) = self.state.as_mut() {
            callback.on_state(state);
        }
    }
}
