//! # decon-core - tiled deconvolution run orchestration
//!
//! Validates run parameters, plans device-sized tiles with halo padding, drives
//! a [`ComputeKernel`](kernel::ComputeKernel) over every tile on one or more
//! devices and assembles the restored image.
//!
//! ## Architecture
//!
//! ```text
//! RunParameters ──► validate ──► tiling::plan ──► DeconvolutionLauncher::run
//!                     │                              │  per tile: stage, iterate, copy core back
//!                LicenseCache                DeviceRegistry + ComputeKernel + callbacks
//!                                                    │
//!                                                    ▼
//!                                     assemble (accumulator, scaling, PSF fitting)
//! ```
//!
//! The device registry and license cache are constructed once and shared as
//! `Arc`s between launchers. A launcher is used by one thread at a time; several
//! launchers may run concurrently on distinct devices.
//!
//! ## Modules
//!
//! - [`params`] / [`validate`]: the parameter bundle and its ordered checks
//! - [`tiling`]: subvolume grid, halos and the device memory budget
//! - [`launcher`]: the run state machine
//! - [`assemble`]: accumulation of tile cores and output conversion
//! - [`kernel`]: numerical collaborators and host reference kernels
//! - [`callbacks`], [`licensing`], [`volume`], [`config`]

pub mod assemble;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod geometry;
pub mod kernel;
pub mod launcher;
pub mod licensing;
pub mod params;
pub mod tiling;
pub mod validate;
pub mod volume;

pub use callbacks::{CallbackDispatcher, IterationCallback, IterationProgress, RunState, StateCallback};
pub use config::LauncherConfig;
pub use error::{Error, ErrorCategory, ErrorKind, Result};
pub use geometry::{Region, Shape3};
pub use launcher::{AbortHandle, DeconvolutionLauncher, RunOutcome};
pub use licensing::{Expiration, Feature, LicenseBackend, LicenseCache, LicenseString, StaticLicenses};
pub use params::{
    LightSheetDirection, LightSheetParameters, PostFilter, PreFilter, PsfModel, PsfType, RegularizationType,
    RunParameters, Scaling,
};
pub use tiling::{Tile, TilePlan};
pub use validate::{validate, ValidatedParameters};
pub use volume::{Sample, SharedVolume, Volume};
