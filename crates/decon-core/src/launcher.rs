//! Run controller
//!
//! A [`DeconvolutionLauncher`] owns one deconvolution session: the validated
//! parameters, the host image and PSF volumes, the bound devices and the
//! progress callbacks. [`DeconvolutionLauncher::run`] drives the state machine
//!
//! ```text
//! Init ──► Running ──► Cleanup ──► Finished
//!  │  validate, plan,   │ tiles in raster order,   │ commit tile cores,
//!  │  open devices      │ iterations per tile      │ keep the first PSF
//! ```
//!
//! Every run that passes `Init` ends in `Finished`, also when a tile fails. Abort
//! is cooperative: [`AbortHandle::abort`] sets a flag that the controller reads
//! immediately before and after each iteration callback, and once more when a
//! tile's iterations end. An accepted abort therefore always ends the run as
//! [`RunOutcome::Aborted`].
//!
//! ```rust
//! use std::sync::Arc;
//! use decon_backends::{DeviceRegistry, HostDeviceSpec};
//! use decon_core::kernel::IdentityKernel;
//! use decon_core::{DeconvolutionLauncher, LicenseCache, RunOutcome, RunParameters};
//!
//! let registry = Arc::new(DeviceRegistry::host(vec![HostDeviceSpec::default()]));
//! let licenses = Arc::new(LicenseCache::unrestricted());
//! let mut launcher = DeconvolutionLauncher::new(registry, licenses, IdentityKernel);
//!
//! launcher.set_parameters(RunParameters { iterations: 3, ..RunParameters::with_dims(8, 8, 1) })?;
//! launcher.set_image_slice::<u16>(0, &[40; 64])?;
//! assert_eq!(launcher.run()?, RunOutcome::Completed);
//!
//! let mut out = [0u16; 64];
//! launcher.retrieve_image_slice(0, &mut out)?;
//! assert_eq!(out, [40; 64]);
//! # Ok::<(), decon_core::Error>(())
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use decon_backends::{Device, DeviceRegistry};
use decon_tracing::performance::{record_iterations, record_transfer, TransferDirection};
use decon_tracing::{perf_span, timed_block};
use parking_lot::{MappedRwLockReadGuard, RwLockReadGuard};

use crate::assemble::{self, Accumulator};
use crate::callbacks::{CallbackDispatcher, IterationCallback, IterationProgress, RunState, StateCallback};
use crate::config::LauncherConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::geometry::Shape3;
use crate::kernel::{ComputeKernel, NeverStop, StoppingCriterion, TileBuffers, TileContext};
use crate::licensing::LicenseCache;
use crate::params::{BufferLayout, RunParameters, Scaling};
use crate::tiling::{self, Tile};
use crate::validate::{validate, ValidatedParameters};
use crate::volume::{Sample, SharedVolume, Volume};

const VOXEL_BYTES: usize = std::mem::size_of::<f32>();

/// How a run that reached `Finished` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunOutcome {
    /// Every tile ran its iterations (or stopped early on its criterion)
    Completed,
    /// Abort was observed before iteration `iteration` of tile `subvolume`;
    /// `iteration` equals the tile's completed count when the abort arrived
    /// during its last iteration
    Aborted { subvolume: usize, iteration: usize },
}

/// State shared between a launcher and its abort handles
#[derive(Debug, Default)]
struct RunSignals {
    abort: AtomicBool,
    state: AtomicU8,
}

impl RunSignals {
    fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn request_abort(&self) -> bool {
        if self.state() != RunState::Running {
            return false;
        }
        self.abort.store(true, Ordering::Release);
        true
    }

    fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    fn clear_abort(&self) {
        self.abort.store(false, Ordering::Release);
    }
}

/// Cloneable, thread-safe way to abort a launcher's run
#[derive(Debug, Clone)]
pub struct AbortHandle {
    signals: Arc<RunSignals>,
}

impl AbortHandle {
    /// Request an abort. Returns `false` (and does nothing) unless the launcher
    /// is in the `Running` state.
    pub fn abort(&self) -> bool {
        let accepted = self.signals.request_abort();
        tracing::debug!(accepted, "abort_requested");
        accepted
    }

    pub fn is_abort_requested(&self) -> bool {
        self.signals.abort_requested()
    }

    pub fn state(&self) -> RunState {
        self.signals.state()
    }
}

/// Partial results that survive a failed or aborted run
#[derive(Default)]
struct RunScratch {
    accumulator: Option<Accumulator>,
    /// Final PSF of tile 0 and its staged shape
    first_psf: Option<(Shape3, Vec<f32>)>,
}

/// What one tile produced
struct TileResult {
    estimate: Vec<f32>,
    psf: Vec<f32>,
    aborted_at: Option<usize>,
}

/// Borrows of the launcher that processing a tile needs
struct TileRunner<'a> {
    params: &'a ValidatedParameters,
    kernel: &'a mut dyn ComputeKernel,
    stopping: &'a mut dyn StoppingCriterion,
    callbacks: &'a mut CallbackDispatcher,
    signals: &'a RunSignals,
    psf_cache: &'a mut HashMap<Shape3, Vec<f32>>,
}

impl TileRunner<'_> {
    #[tracing::instrument(skip_all, fields(subvolume = tile.index, device = device.index(), staged = %tile.staged))]
    fn run_tile(
        &mut self,
        device: &mut dyn Device,
        tile: &Tile,
        image: &Volume,
        psf: Option<&Volume>,
        completed: &mut usize,
    ) -> Result<TileResult> {
        let _perf = perf_span!("tile", subvolume = tile.index, voxels = tile.staged_voxels());
        let (observed, _) = timed_block!("stage_tile", { image.stage_tile(tile) });
        let psf_data = self.stage_psf(tile, psf)?;

        let buffers = allocate_buffers(device, tile.staged_voxels(), self.params.params().blind)?;
        let result = self.iterate(device, tile, buffers, &observed, psf_data, completed);
        let released = release_buffers(device, &buffers);
        let result = result?;
        released?;
        Ok(result)
    }

    fn stage_psf(&mut self, tile: &Tile, supplied: Option<&Volume>) -> Result<Vec<f32>> {
        if let Some(psf) = supplied {
            return Ok(assemble::fit_centered(&psf.read(), psf.shape(), tile.staged));
        }
        if let Some(cached) = self.psf_cache.get(&tile.staged) {
            return Ok(cached.clone());
        }
        let optics = self.params.params().optics();
        let generated = self.kernel.generate_psf(&optics, tile.staged)?;
        if generated.len() != tile.staged.voxels() {
            return Err(Error::new(
                ErrorKind::NoPsf,
                format!(
                    "kernel generated {} PSF voxels for a {} tile",
                    generated.len(),
                    tile.staged
                ),
            ));
        }
        tracing::debug!(shape = %tile.staged, "psf_generated");
        self.psf_cache.insert(tile.staged, generated.clone());
        Ok(generated)
    }

    fn iterate(
        &mut self,
        device: &mut dyn Device,
        tile: &Tile,
        buffers: TileBuffers,
        observed: &[f32],
        psf: Vec<f32>,
        completed: &mut usize,
    ) -> Result<TileResult> {
        let bytes = observed.len() * VOXEL_BYTES;
        let (uploaded, upload_us) = timed_block!("upload_tile", { upload_tile(device, &buffers, observed, &psf) });
        uploaded?;
        record_transfer(2 * bytes, TransferDirection::HostToDevice, upload_us);

        let mut ctx = TileContext {
            device,
            tile,
            buffers,
            params: self.params,
        };
        self.kernel.prepare(&mut ctx)?;
        self.stopping.reset();

        let iterations = self.params.iterations();
        let mut aborted_at = None;
        let (iterated, iterate_us) = timed_block!("iterate_tile", {
            let mut outcome = Ok(());
            for k in 0..iterations {
                if self.signals.abort_requested() {
                    aborted_at = Some(k);
                    break;
                }
                self.callbacks.iteration(IterationProgress {
                    iteration: k,
                    subvolume: tile.index,
                });
                if self.signals.abort_requested() {
                    aborted_at = Some(k);
                    break;
                }
                if let Err(err) = self.kernel.apply_iteration(&mut ctx, k) {
                    outcome = Err(err);
                    break;
                }
                *completed = k + 1;
                match self.stopping.should_stop(&ctx, k) {
                    Ok(false) => {}
                    Ok(true) => {
                        tracing::debug!(subvolume = tile.index, iterations = k + 1, "tile_stopped_early");
                        break;
                    }
                    Err(err) => {
                        outcome = Err(err);
                        break;
                    }
                }
            }
            outcome
        });
        iterated?;
        if aborted_at.is_none() && self.signals.abort_requested() {
            // abort landed during the tile's last kernel call
            aborted_at = Some(*completed);
        }
        record_iterations(tile.index, *completed, tile.staged_voxels(), iterate_us);

        self.kernel.finish(&mut ctx)?;
        ctx.device.synchronize()?;

        let mut estimate = vec![0.0; observed.len()];
        let (downloaded, download_us) = timed_block!("download_tile", {
            ctx.device.download(buffers.estimate, &mut estimate)
        });
        downloaded?;
        record_transfer(bytes, TransferDirection::DeviceToHost, download_us);

        let psf = match buffers.psf_estimate {
            Some(handle) => {
                let mut refined = vec![0.0; psf.len()];
                ctx.device.download(handle, &mut refined)?;
                refined
            }
            None => psf,
        };

        if let Some(iteration) = aborted_at {
            tracing::info!(subvolume = tile.index, iteration, "abort_observed");
        }
        Ok(TileResult {
            estimate,
            psf,
            aborted_at,
        })
    }
}

/// Observed data into `observed` and `estimate`, the PSF into `psf` and, in
/// blind mode, `psf_estimate`
fn upload_tile(
    device: &mut dyn Device,
    buffers: &TileBuffers,
    observed: &[f32],
    psf: &[f32],
) -> decon_backends::Result<()> {
    device.upload(buffers.observed, observed)?;
    device.copy_buffer(buffers.observed, buffers.estimate)?;
    device.upload(buffers.psf, psf)?;
    if let Some(estimate) = buffers.psf_estimate {
        device.copy_buffer(buffers.psf, estimate)?;
    }
    Ok(())
}

fn allocate_buffers(device: &mut dyn Device, voxels: usize, blind: bool) -> Result<TileBuffers> {
    let count = tiling::working_buffers(blind);
    let mut handles = Vec::with_capacity(count);
    for _ in 0..count {
        match device.allocate_buffer(voxels) {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                // the allocation failure is the error reported
                for handle in handles {
                    let _ = device.free_buffer(handle);
                }
                return Err(err.into());
            }
        }
    }
    Ok(TileBuffers {
        observed: handles[0],
        estimate: handles[1],
        psf: handles[2],
        psf_estimate: handles.get(3).copied(),
    })
}

fn release_buffers(device: &mut dyn Device, buffers: &TileBuffers) -> Result<()> {
    let mut first_error = None;
    for handle in buffers.handles() {
        if let Err(err) = device.free_buffer(handle) {
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// Orchestrates tiled deconvolution runs on one or more devices
pub struct DeconvolutionLauncher {
    registry: Arc<DeviceRegistry>,
    licenses: Arc<LicenseCache>,
    kernel: Box<dyn ComputeKernel>,
    stopping: Box<dyn StoppingCriterion>,
    config: LauncherConfig,
    callbacks: CallbackDispatcher,
    signals: Arc<RunSignals>,

    params: Option<ValidatedParameters>,
    layout: Option<BufferLayout>,
    image: Option<Volume>,
    psf: Option<Volume>,
    kept_psf: Option<Volume>,
    keep_psf: bool,
    /// Cached output scale factor, valid for the given scaling
    scale: Option<(Scaling, f32)>,
    psf_cache: HashMap<Shape3, Vec<f32>>,

    devices: Vec<usize>,
    open_devices: Vec<Box<dyn Device>>,

    last_iterations: Vec<usize>,
    aborted: bool,
}

impl fmt::Debug for DeconvolutionLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeconvolutionLauncher")
            .field("kernel", &self.kernel.name())
            .field("state", &self.signals.state())
            .field("devices", &self.devices)
            .field("image", &self.image.as_ref().map(Volume::shape))
            .field("psf", &self.psf.as_ref().map(Volume::shape))
            .field("keep_psf", &self.keep_psf)
            .field("aborted", &self.aborted)
            .finish_non_exhaustive()
    }
}

impl DeconvolutionLauncher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        licenses: Arc<LicenseCache>,
        kernel: impl ComputeKernel + 'static,
    ) -> Self {
        let config = LauncherConfig::default();
        Self {
            registry,
            licenses,
            kernel: Box::new(kernel),
            stopping: Box::new(NeverStop),
            config,
            callbacks: CallbackDispatcher::default(),
            signals: Arc::new(RunSignals::default()),
            params: None,
            layout: None,
            image: None,
            psf: None,
            kept_psf: None,
            keep_psf: config.keep_psf,
            scale: None,
            psf_cache: HashMap::new(),
            devices: Vec::new(),
            open_devices: Vec::new(),
            last_iterations: Vec::new(),
            aborted: false,
        }
    }

    pub fn with_config(mut self, config: LauncherConfig) -> Self {
        self.config = config;
        self.keep_psf = config.keep_psf;
        self
    }

    /// Replace the default [`NeverStop`] criterion
    pub fn with_stopping_criterion(mut self, stopping: impl StoppingCriterion + 'static) -> Self {
        self.stopping = Box::new(stopping);
        self
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.signals.state()
    }

    pub fn parameters(&self) -> Option<&ValidatedParameters> {
        self.params.as_ref()
    }

    /// Back to the freshly constructed state. Callbacks, kernel, stopping
    /// criterion and configuration are kept.
    pub fn reset(&mut self) {
        self.clean_host();
        self.clean_device();
        self.params = None;
        self.devices.clear();
        self.last_iterations.clear();
        self.keep_psf = self.config.keep_psf;
        self.aborted = false;
        self.signals.clear_abort();
        self.signals.set_state(RunState::Init);
        tracing::debug!("launcher_reset");
    }

    /// Drop every host volume; the next `set_parameters` reallocates.
    pub fn clean_host(&mut self) {
        self.image = None;
        self.psf = None;
        self.kept_psf = None;
        self.scale = None;
        self.layout = None;
        self.psf_cache.clear();
    }

    /// Close the opened device handles and free everything allocated on them.
    pub fn clean_device(&mut self) {
        self.open_devices.clear();
    }

    pub fn clean_image(&mut self) {
        self.image = None;
        self.scale = None;
    }

    pub fn clean_psf(&mut self) {
        self.psf = None;
        self.kept_psf = None;
        self.psf_cache.clear();
    }

    fn device_count(&self) -> usize {
        self.devices.len().max(1)
    }

    /// Validate `params` and prepare the host volumes.
    ///
    /// Volumes are reallocated (with new buffer ids) only when the image or PSF
    /// dimensions, the padding or the PSF source changed.
    #[tracing::instrument(skip(self, params), fields(nx = params.nx, ny = params.ny, nz = params.nz))]
    pub fn set_parameters(&mut self, params: RunParameters) -> Result<()> {
        let validated = validate(&params, &self.licenses, self.device_count())?;
        let layout = params.buffer_layout();
        let rebuild = self.layout != Some(layout);

        if rebuild || self.image.is_none() {
            self.image = Some(Volume::zeros(validated.image_shape())?);
            self.scale = None;
        }
        match validated.supplied_psf_shape() {
            Some(shape) => {
                if rebuild || self.psf.is_none() {
                    self.psf = Some(Volume::zeros(shape)?);
                }
            }
            None => self.psf = None,
        }
        if rebuild {
            self.kept_psf = None;
            self.psf_cache.clear();
            self.last_iterations.clear();
        }
        if self.params.as_ref().map(|p| p.params().optics()) != Some(params.optics()) {
            self.psf_cache.clear();
        }

        tracing::debug!(rebuild, tiles = validated.tile_count(), "parameters_set");
        self.params = Some(validated);
        self.layout = Some(layout);
        Ok(())
    }

    /// Validate `params` and use caller storage for the image and, when the PSF
    /// is supplied, for the PSF. Results are written into `image` in place.
    pub fn set_parameters_with_volumes(
        &mut self,
        params: RunParameters,
        image: SharedVolume,
        psf: Option<SharedVolume>,
    ) -> Result<()> {
        let validated = validate(&params, &self.licenses, self.device_count())?;
        let image = Volume::from_shared(validated.image_shape(), image)?;
        let psf = match (validated.supplied_psf_shape(), psf) {
            (Some(shape), Some(psf)) => Some(Volume::from_shared(shape, psf)?),
            (Some(_), None) => {
                return Err(Error::new(
                    ErrorKind::NoPsf,
                    "parameters expect a supplied PSF but none was given",
                ))
            }
            (None, Some(_)) => {
                tracing::debug!("ignoring_supplied_psf");
                None
            }
            (None, None) => None,
        };

        self.image = Some(image);
        self.psf = psf;
        self.kept_psf = None;
        self.scale = None;
        self.psf_cache.clear();
        self.last_iterations.clear();
        self.layout = Some(params.buffer_layout());
        self.params = Some(validated);
        Ok(())
    }

    fn image_volume(&self) -> Result<&Volume> {
        if self.params.is_none() {
            return Err(Error::new(ErrorKind::UnsetParams, "set_parameters has not been called"));
        }
        self.image
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NoImage, "no image volume is allocated"))
    }

    fn psf_volume(&self) -> Result<&Volume> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::UnsetParams, "set_parameters has not been called"))?;
        if params.supplied_psf_shape().is_none() {
            return Err(Error::new(ErrorKind::NoPsf, "parameters generate the PSF"));
        }
        self.psf
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NoPsf, "no PSF volume is allocated"))
    }

    /// Stage image plane `z`
    pub fn set_image_slice<T: Sample>(&mut self, z: usize, src: &[T]) -> Result<()> {
        self.image_volume()?.set_slice(z, src)?;
        self.scale = None;
        Ok(())
    }

    /// Stage image plane `z` from native-endian bytes of `T`
    pub fn set_image_slice_bytes<T: Sample>(&mut self, z: usize, bytes: &[u8]) -> Result<()> {
        self.image_volume()?.set_slice_bytes::<T>(z, bytes)?;
        self.scale = None;
        Ok(())
    }

    /// Stage plane `z` of a supplied PSF
    pub fn set_psf_slice<T: Sample>(&mut self, z: usize, src: &[T]) -> Result<()> {
        self.psf_volume()?.set_slice(z, src)
    }

    /// The whole float image
    pub fn image(&self) -> Result<RwLockReadGuard<'_, Vec<f32>>> {
        Ok(self.image_volume()?.read())
    }

    /// Float image plane `z`
    pub fn image_slice(&self, z: usize) -> Result<MappedRwLockReadGuard<'_, [f32]>> {
        self.image_volume()?.slice(z)
    }

    /// Buffer id of the image volume; changes only when the volume is reallocated
    pub fn image_buffer_id(&self) -> Option<u64> {
        self.image.as_ref().map(Volume::id)
    }

    fn output_scale(&self, image: &Volume) -> (Scaling, f32) {
        let scaling = self
            .params
            .as_ref()
            .map(|p| p.params().scaling)
            .unwrap_or_default();
        match self.scale {
            Some((cached, factor)) if cached == scaling => (scaling, factor),
            _ => (scaling, assemble::scale_factor(&image.read(), scaling)),
        }
    }

    /// Copy the whole image into `dst` under the configured scaling
    pub fn retrieve_image<T: Sample>(&self, dst: &mut [T]) -> Result<()> {
        let image = self.image_volume()?;
        let (scaling, factor) = self.output_scale(image);
        let data = image.read();
        if dst.len() != data.len() {
            return Err(Error::new(
                ErrorKind::BadDimensionX,
                format!("destination holds {} samples, the image has {}", dst.len(), data.len()),
            ));
        }
        for (out, &value) in dst.iter_mut().zip(data.iter()) {
            *out = assemble::convert(value, factor, scaling);
        }
        Ok(())
    }

    /// Copy image plane `z` into `dst` under the configured scaling
    pub fn retrieve_image_slice<T: Sample>(&self, z: usize, dst: &mut [T]) -> Result<()> {
        let image = self.image_volume()?;
        let (scaling, factor) = self.output_scale(image);
        assemble::retrieve_slice(image, z, dst, factor, scaling)
    }

    /// Bind a single device for subsequent runs
    pub fn set_device(&mut self, index: usize) -> Result<()> {
        self.set_devices(&[index])
    }

    /// Bind devices for subsequent runs; tile `t` runs on `indices[t % len]`.
    ///
    /// More than one device needs the multi-GPU entitlement, which is checked
    /// at the next `set_parameters` or `run`.
    pub fn set_devices(&mut self, indices: &[usize]) -> Result<()> {
        if indices.is_empty() {
            return Err(Error::new(ErrorKind::BadDevice, "at least one device is required"));
        }
        for (position, &index) in indices.iter().enumerate() {
            if indices[..position].contains(&index) {
                return Err(Error::new(ErrorKind::BadDevice, format!("device {index} is listed twice")));
            }
            self.registry.check_device(index)?;
        }
        self.registry.set_device(indices[0])?;
        if self.devices != indices {
            self.clean_device();
            self.devices = indices.to_vec();
        }
        tracing::debug!(devices = ?self.devices, "devices_bound");
        Ok(())
    }

    /// Devices the next run uses
    pub fn devices(&self) -> Vec<usize> {
        if self.devices.is_empty() {
            vec![self.registry.current_device()]
        } else {
            self.devices.clone()
        }
    }

    pub fn set_callbacks(&mut self, callbacks: CallbackDispatcher) {
        self.callbacks = callbacks;
    }

    pub fn set_iteration_callback(&mut self, callback: impl IterationCallback + 'static) {
        self.callbacks.set_iteration(callback);
    }

    pub fn set_state_callback(&mut self, callback: impl StateCallback + 'static) {
        self.callbacks.set_state(callback);
    }

    pub fn clear_callbacks(&mut self) {
        self.callbacks.clear();
    }

    /// Request an abort of the current run; see [`AbortHandle::abort`].
    pub fn abort(&self) -> bool {
        self.abort_handle().abort()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            signals: self.signals.clone(),
        }
    }

    /// Completed iterations per tile of the last run; 0 for tiles never reached
    pub fn last_run_iterations(&self) -> &[usize] {
        &self.last_iterations
    }

    pub fn set_keep_psf(&mut self, keep: bool) {
        self.keep_psf = keep;
        if !keep {
            self.kept_psf = None;
        }
    }

    pub fn keep_psf(&self) -> bool {
        self.keep_psf
    }

    /// Plane `z` of the first tile's PSF from the last run, fitted to the image
    /// extent. Requires `keep_psf`.
    pub fn retrieve_psf_slice(&self, z: usize, dst: &mut [f32]) -> Result<()> {
        let psf = self.kept_psf.as_ref().ok_or_else(|| {
            Error::new(
                ErrorKind::NoPsf,
                "no PSF was kept; enable keep_psf before running",
            )
        })?;
        assemble::retrieve_slice(psf, z, dst, 1.0, Scaling::None)
    }

    /// Generate the PSF `params` describe into `dst`, sized like the image
    /// of `params`.
    pub fn make_psf(&mut self, params: &RunParameters, dst: &mut [f32]) -> Result<Shape3> {
        if !params.generate_psf {
            return Err(Error::new(ErrorKind::NoPsf, "make_psf needs generate_psf to be set"));
        }
        let validated = validate(params, &self.licenses, 1)?;
        let shape = validated.image_shape();
        if shape.checked_voxels() != Some(dst.len()) {
            return Err(Error::new(
                ErrorKind::BadDimensionX,
                format!("destination holds {} voxels, which does not fit a {shape} PSF", dst.len()),
            ));
        }
        let psf = self.kernel.generate_psf(&params.optics(), shape)?;
        if psf.len() != dst.len() {
            return Err(Error::new(
                ErrorKind::NoPsf,
                format!("kernel generated {} PSF voxels for {shape}", psf.len()),
            ));
        }
        dst.copy_from_slice(&psf);
        Ok(shape)
    }

    /// Run on caller storage instead of the staged volumes
    pub fn run_with(&mut self, image: SharedVolume, psf: Option<SharedVolume>) -> Result<RunOutcome> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::UnsetParams, "set_parameters has not been called"))?
            .params()
            .clone();
        self.set_parameters_with_volumes(params, image, psf)?;
        self.run()
    }

    /// Deconvolve the staged image.
    ///
    /// Returns [`RunOutcome::Aborted`] when an abort was observed; the launcher
    /// then refuses to run again until [`reset`](Self::reset). Errors from the
    /// kernel are returned after the run reached `Finished`; results of the
    /// tiles finished until then are committed to the image.
    #[tracing::instrument(skip(self), fields(kernel = self.kernel.name()))]
    pub fn run(&mut self) -> Result<RunOutcome> {
        if self.aborted {
            return Err(Error::new(
                ErrorKind::Aborted,
                "the previous run was aborted; reset and set parameters again",
            ));
        }
        let params = self
            .params
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::UnsetParams, "set_parameters has not been called"))?;

        self.signals.clear_abort();
        self.signals.set_state(RunState::Init);
        self.callbacks.state(RunState::Init);

        let mut scratch = RunScratch::default();
        let result = self.execute(&params, &mut scratch);
        self.cleanup(&params, scratch);

        match result {
            Ok(outcome) => {
                if let RunOutcome::Aborted { subvolume, iteration } = outcome {
                    self.aborted = true;
                    tracing::info!(subvolume, iteration, "run_aborted");
                } else {
                    tracing::info!(tiles = self.last_iterations.len(), "run_completed");
                }
                Ok(outcome)
            }
            Err(err) => {
                tracing::warn!(kind = err.kind().name(), code = err.code(), error = %err, "run_failed");
                Err(err)
            }
        }
    }

    fn open_bound_devices(&mut self) -> Result<()> {
        let wanted = self.devices();
        let opened: Vec<usize> = self.open_devices.iter().map(|device| device.index()).collect();
        if opened == wanted {
            return Ok(());
        }
        self.open_devices.clear();
        for index in wanted {
            self.open_devices.push(self.registry.open(index)?);
        }
        Ok(())
    }

    fn device_budget(&self) -> Result<usize> {
        let mut free = usize::MAX;
        for device in &self.open_devices {
            free = free.min(self.registry.free_memory(device.index())?);
        }
        Ok(self.config.budget(free))
    }

    fn execute(&mut self, params: &ValidatedParameters, scratch: &mut RunScratch) -> Result<RunOutcome> {
        // devices may have been rebound since set_parameters
        let validated = validate(params.params(), &self.licenses, self.device_count())?;
        let image = self.image_volume()?.clone();
        let supplied_psf = match validated.supplied_psf_shape() {
            Some(_) => Some(self.psf_volume()?.clone()),
            None => None,
        };

        self.open_bound_devices()?;
        let budget = self.device_budget()?;
        let plan = tiling::plan(&validated, budget)?;
        self.last_iterations = vec![0; plan.len()];
        let accumulator = scratch.accumulator.insert(Accumulator::from_volume(&image)?);
        tracing::info!(
            tiles = plan.len(),
            devices = self.open_devices.len(),
            iterations = validated.iterations(),
            "run_started"
        );

        let keep_psf = self.keep_psf;
        let Self {
            registry,
            kernel,
            stopping,
            callbacks,
            signals,
            psf_cache,
            open_devices,
            last_iterations,
            ..
        } = self;
        let mut runner = TileRunner {
            params: &validated,
            kernel: kernel.as_mut(),
            stopping: stopping.as_mut(),
            callbacks,
            signals,
            psf_cache,
        };

        for tile in plan.iter() {
            if tile.index == 0 {
                runner.signals.set_state(RunState::Running);
                runner.callbacks.state(RunState::Running);
            }
            let slot = tile.index % open_devices.len();
            let device = open_devices[slot].as_mut();
            registry.set_device(device.index())?;

            let result = runner.run_tile(
                device,
                tile,
                &image,
                supplied_psf.as_ref(),
                &mut last_iterations[tile.index],
            )?;
            accumulator.insert_core(tile, &result.estimate)?;
            if tile.index == 0 && keep_psf {
                scratch.first_psf = Some((tile.staged, result.psf));
            }
            if let Some(iteration) = result.aborted_at {
                return Ok(RunOutcome::Aborted {
                    subvolume: tile.index,
                    iteration,
                });
            }
        }
        Ok(RunOutcome::Completed)
    }

    fn cleanup(&mut self, params: &ValidatedParameters, scratch: RunScratch) {
        self.signals.set_state(RunState::Cleanup);
        self.callbacks.state(RunState::Cleanup);

        if let (Some(accumulator), Some(image)) = (scratch.accumulator, self.image.as_ref()) {
            let _perf = perf_span!("commit_image", voxels = accumulator.shape().voxels());
            accumulator.commit(image);
            let scaling = params.params().scaling;
            self.scale = Some((scaling, assemble::scale_factor(&image.read(), scaling)));
        }

        if let Some((staged, psf)) = scratch.first_psf {
            let shape = params.image_shape();
            let fitted = assemble::fit_centered(&psf, staged, shape);
            self.kept_psf = match Volume::zeros(shape) {
                Ok(volume) => {
                    volume.write().copy_from_slice(&fitted);
                    Some(volume)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "psf_not_kept");
                    None
                }
            };
        }

        self.signals.set_state(RunState::Finished);
        self.callbacks.state(RunState::Finished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::IdentityKernel;
    use decon_backends::HostDeviceSpec;

    fn launcher() -> DeconvolutionLauncher {
        let registry = Arc::new(DeviceRegistry::host(vec![HostDeviceSpec::default()]));
        DeconvolutionLauncher::new(registry, Arc::new(LicenseCache::unrestricted()), IdentityKernel)
    }

    #[test]
    fn launcher_can_move_between_threads() {
        fn assert_send<T: Send>() {}
        assert_send::<DeconvolutionLauncher>();
        assert_send::<AbortHandle>();
    }

    #[test]
    fn abort_is_ignored_outside_running() {
        let launcher = launcher();
        assert_eq!(launcher.state(), RunState::Init);
        assert!(!launcher.abort());
        assert!(!launcher.abort_handle().is_abort_requested());
    }

    #[test]
    fn run_needs_parameters() {
        let mut launcher = launcher();
        assert_eq!(launcher.run().unwrap_err().kind(), ErrorKind::UnsetParams);
        assert_eq!(
            launcher.set_image_slice::<f32>(0, &[0.0]).unwrap_err().kind(),
            ErrorKind::UnsetParams
        );
    }

    #[test]
    fn psf_slices_need_a_supplied_psf() {
        let mut launcher = launcher();
        launcher.set_parameters(RunParameters::with_dims(4, 4, 1)).unwrap();
        let err = launcher.set_psf_slice::<f32>(0, &[0.0; 16]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPsf);
    }

    #[test]
    fn run_ends_in_finished() {
        let mut launcher = launcher();
        launcher
            .set_parameters(RunParameters {
                iterations: 2,
                ..RunParameters::with_dims(4, 4, 1)
            })
            .unwrap();
        assert_eq!(launcher.run().unwrap(), RunOutcome::Completed);
        assert_eq!(launcher.state(), RunState::Finished);
        assert_eq!(launcher.last_run_iterations(), &[2]);
        assert!(!launcher.abort());
    }

    #[test]
    fn absurd_extents_are_allocation_errors() {
        let mut launcher = launcher();
        let err = launcher
            .set_parameters(RunParameters::with_dims(i32::MAX, i32::MAX, i32::MAX))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadAllocCpu);

        launcher
            .set_parameters(RunParameters {
                x_padding: i32::MAX,
                y_padding: i32::MAX,
                z_padding: i32::MAX,
                ..RunParameters::with_dims(4, 4, 4)
            })
            .unwrap();
        assert_eq!(launcher.run().unwrap_err().kind(), ErrorKind::BadAllocOom);
        assert_eq!(launcher.state(), RunState::Finished);
    }

    #[test]
    fn duplicate_devices_are_rejected() {
        let mut launcher = launcher();
        assert_eq!(launcher.set_devices(&[]).unwrap_err().kind(), ErrorKind::BadDevice);
        assert_eq!(launcher.set_devices(&[0, 0]).unwrap_err().kind(), ErrorKind::BadDevice);
        assert_eq!(launcher.set_device(3).unwrap_err().kind(), ErrorKind::BadDevice);
        launcher.set_device(0).unwrap();
        assert_eq!(launcher.devices(), vec![0]);
    }

    #[test]
    fn make_psf_fills_the_destination() {
        let mut launcher = launcher();
        let params = RunParameters::with_dims(5, 5, 1);
        let mut psf = vec![0.0; 25];
        assert_eq!(launcher.make_psf(&params, &mut psf).unwrap(), Shape3::new(5, 5, 1));
        assert_eq!(psf[12], 1.0);

        let mut short = vec![0.0; 3];
        assert_eq!(
            launcher.make_psf(&params, &mut short).unwrap_err().kind(),
            ErrorKind::BadDimensionX
        );
        let supplied = RunParameters {
            generate_psf: false,
            psf_nx: 5,
            psf_ny: 5,
            psf_nz: 1,
            ..params
        };
        assert_eq!(launcher.make_psf(&supplied, &mut psf).unwrap_err().kind(), ErrorKind::NoPsf);
    }
}
