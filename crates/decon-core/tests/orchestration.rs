//! End-to-end runs of the launcher on emulated host devices

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use decon_backends::{BackendError, DeviceRegistry, HostDevice, HostDeviceSpec};
use decon_core::kernel::{
    ComputeKernel, IdentityKernel, KernelResult, RelativeChange, RichardsonLucyKernel, TileContext,
};
use decon_core::params::Optics;
use decon_core::{
    tiling, validate, AbortHandle, DeconvolutionLauncher, ErrorKind, Feature, IterationProgress, LicenseCache, RunOutcome,
    RunParameters, RunState, Scaling, Shape3, SharedVolume, StaticLicenses,
};
use parking_lot::RwLock;

const CAPACITY: usize = 64 << 20;

fn registry(devices: usize) -> Arc<DeviceRegistry> {
    decon_tracing::init_test_tracing();
    let specs = (0..devices)
        .map(|i| HostDeviceSpec::new(format!("gpu{i}"), CAPACITY))
        .collect();
    Arc::new(DeviceRegistry::host(specs))
}

fn launcher_with(kernel: impl ComputeKernel + 'static) -> DeconvolutionLauncher {
    DeconvolutionLauncher::new(registry(1), Arc::new(LicenseCache::unrestricted()), kernel)
}

fn fill_image(launcher: &mut DeconvolutionLauncher, shape: Shape3, value: impl Fn(usize) -> f32) {
    for z in 0..shape.nz {
        let plane: Vec<f32> = (0..shape.plane_len())
            .map(|i| value(z * shape.plane_len() + i))
            .collect();
        launcher.set_image_slice(z, &plane).unwrap();
    }
}

/// Adds 1 to every estimate voxel per iteration and records where it ran
#[derive(Default)]
struct CountingKernel {
    visits: Arc<Mutex<Vec<(usize, usize)>>>,
    fail_at: Option<(usize, usize)>,
    /// Aborts through `abort_handle` inside this `(subvolume, iteration)`
    abort_at: Option<(usize, usize)>,
    abort_handle: Arc<Mutex<Option<AbortHandle>>>,
}

impl ComputeKernel for CountingKernel {
    fn name(&self) -> &str {
        "counting"
    }

    fn prepare(&mut self, ctx: &mut TileContext<'_>) -> KernelResult<()> {
        let device = ctx.device.index();
        self.visits.lock().unwrap().push((ctx.subvolume(), device));
        Ok(())
    }

    fn apply_iteration(&mut self, ctx: &mut TileContext<'_>, iteration: usize) -> KernelResult<()> {
        if self.fail_at == Some((ctx.subvolume(), iteration)) {
            return Err(BackendError::Fft("plan execution failed".to_string()));
        }
        let estimate = ctx.buffers.estimate;
        let host = ctx
            .device
            .as_any_mut()
            .downcast_mut::<HostDevice>()
            .ok_or_else(|| BackendError::Other("host device expected".to_string()))?;
        host.buffer_mut(estimate)?.iter_mut().for_each(|v| *v += 1.0);
        if self.abort_at == Some((ctx.subvolume(), iteration)) {
            if let Some(handle) = self.abort_handle.lock().unwrap().as_ref() {
                assert!(handle.abort());
            }
        }
        Ok(())
    }

    fn generate_psf(&mut self, optics: &Optics, shape: Shape3) -> KernelResult<Vec<f32>> {
        IdentityKernel.generate_psf(optics, shape)
    }
}

#[test]
fn uniform_image_is_a_fixed_point_of_the_identity_kernel() {
    let shape = Shape3::new(256, 256, 1);
    let mut launcher = launcher_with(IdentityKernel);
    launcher
        .set_parameters(RunParameters {
            iterations: 10,
            x_tiles: 1,
            y_tiles: 1,
            z_tiles: 1,
            scaling: Scaling::None,
            ..RunParameters::with_dims(256, 256, 1)
        })
        .unwrap();
    fill_image(&mut launcher, shape, |_| 100.0);

    assert_eq!(launcher.run().unwrap(), RunOutcome::Completed);
    assert_eq!(launcher.last_run_iterations(), &[10]);
    assert!(launcher.image().unwrap().iter().all(|&v| v == 100.0));
}

#[test]
fn richardson_lucy_with_a_delta_psf_keeps_a_uniform_image() {
    let shape = Shape3::new(256, 256, 1);
    let mut launcher = launcher_with(RichardsonLucyKernel::default());
    launcher
        .set_parameters(RunParameters {
            iterations: 10,
            generate_psf: false,
            psf_nx: 3,
            psf_ny: 3,
            psf_nz: 1,
            ..RunParameters::with_dims(256, 256, 1)
        })
        .unwrap();
    fill_image(&mut launcher, shape, |_| 100.0);
    launcher
        .set_psf_slice::<f32>(0, &[0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0])
        .unwrap();

    assert_eq!(launcher.run().unwrap(), RunOutcome::Completed);
    let mut out = vec![0.0f32; shape.plane_len()];
    launcher.retrieve_image_slice(0, &mut out).unwrap();
    assert!(out.iter().all(|&v| v == 100.0));
}

#[test]
fn richardson_lucy_with_a_generated_psf_stays_near_a_uniform_image() {
    let shape = Shape3::new(24, 24, 4);
    let mut launcher = launcher_with(RichardsonLucyKernel::default());
    launcher
        .set_parameters(RunParameters {
            iterations: 3,
            x_tiles: 2,
            x_padding: 2,
            z_padding: 1,
            ..RunParameters::with_dims(24, 24, 4)
        })
        .unwrap();
    fill_image(&mut launcher, shape, |_| 50.0);

    launcher.run().unwrap();
    assert!(launcher.image().unwrap().iter().all(|&v| (v - 50.0).abs() < 0.05));
}

#[test]
fn zero_iterations_round_trip_bit_for_bit() {
    let shape = Shape3::new(37, 23, 5);
    let mut launcher = launcher_with(CountingKernel::default());
    launcher
        .set_parameters(RunParameters {
            iterations: 0,
            x_tiles: 3,
            y_tiles: 2,
            z_tiles: 2,
            x_padding: 4,
            y_padding: 3,
            z_padding: 1,
            ..RunParameters::with_dims(37, 23, 5)
        })
        .unwrap();
    let value = |i: usize| (i as f32).sin() * 1e3 + 0.125;
    fill_image(&mut launcher, shape, value);

    assert_eq!(launcher.run().unwrap(), RunOutcome::Completed);
    assert_eq!(launcher.last_run_iterations(), &[0; 12]);
    for z in 0..shape.nz {
        let mut out = vec![0.0f32; shape.plane_len()];
        launcher.retrieve_image_slice(z, &mut out).unwrap();
        for (i, v) in out.iter().enumerate() {
            assert_eq!(v.to_bits(), value(z * shape.plane_len() + i).to_bits());
        }
    }
}

#[test]
fn tile_cores_partition_the_volume() {
    let params = validate(
        &RunParameters {
            x_tiles: 3,
            y_tiles: 2,
            z_tiles: 4,
            x_padding: 5,
            y_padding: 1,
            z_padding: 2,
            ..RunParameters::with_dims(31, 17, 9)
        },
        &LicenseCache::unrestricted(),
        1,
    )
    .unwrap();
    let plan = tiling::plan(&params, usize::MAX).unwrap();
    assert_eq!(plan.len(), 24);

    let shape = plan.image;
    let mut covered = vec![0u8; shape.voxels()];
    for tile in plan.iter() {
        let [ox, oy, oz] = tile.core.origin;
        let [ex, ey, ez] = tile.core.extent;
        for z in oz..oz + ez {
            for y in oy..oy + ey {
                for x in ox..ox + ex {
                    covered[shape.offset(x, y, z)] += 1;
                }
            }
        }
    }
    assert!(covered.iter().all(|&count| count == 1));
}

#[test]
fn tiled_run_writes_every_core_once() {
    let shape = Shape3::new(20, 12, 3);
    let mut launcher = launcher_with(CountingKernel::default());
    launcher
        .set_parameters(RunParameters {
            iterations: 4,
            x_tiles: 3,
            y_tiles: 2,
            z_tiles: 3,
            x_padding: 2,
            y_padding: 2,
            z_padding: 1,
            ..RunParameters::with_dims(20, 12, 3)
        })
        .unwrap();
    fill_image(&mut launcher, shape, |i| i as f32);

    launcher.run().unwrap();
    let image = launcher.image().unwrap();
    assert!(image.iter().enumerate().all(|(i, &v)| v == i as f32 + 4.0));
}

#[test]
fn identical_parameters_keep_the_image_buffer() {
    let mut launcher = launcher_with(IdentityKernel);
    let params = RunParameters {
        x_padding: 4,
        ..RunParameters::with_dims(16, 16, 4)
    };
    launcher.set_parameters(params.clone()).unwrap();
    let id = launcher.image_buffer_id().unwrap();

    launcher.set_parameters(params.clone()).unwrap();
    assert_eq!(launcher.image_buffer_id(), Some(id));

    launcher
        .set_parameters(RunParameters {
            iterations: 7,
            scaling: Scaling::U16,
            ..params.clone()
        })
        .unwrap();
    assert_eq!(launcher.image_buffer_id(), Some(id));

    launcher
        .set_parameters(RunParameters {
            nx: 32,
            ..params.clone()
        })
        .unwrap();
    let resized = launcher.image_buffer_id().unwrap();
    assert_ne!(resized, id);

    launcher
        .set_parameters(RunParameters {
            nx: 32,
            y_padding: 2,
            ..params
        })
        .unwrap();
    assert_ne!(launcher.image_buffer_id(), Some(resized));
}

#[test]
fn abort_during_an_iteration_stops_at_that_iteration() {
    let mut launcher = launcher_with(CountingKernel::default());
    launcher
        .set_parameters(RunParameters {
            iterations: 5,
            x_tiles: 4,
            ..RunParameters::with_dims(16, 4, 1)
        })
        .unwrap();

    let handle = launcher.abort_handle();
    launcher.set_iteration_callback(move |progress: IterationProgress| {
        if progress.subvolume == 2 && progress.iteration == 3 {
            assert!(handle.abort());
        }
    });

    let outcome = launcher.run().unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Aborted {
            subvolume: 2,
            iteration: 3
        }
    );
    assert_eq!(launcher.last_run_iterations(), &[5, 5, 3, 0]);
    assert_eq!(launcher.state(), RunState::Finished);

    // partial results are committed
    let image = launcher.image().unwrap().clone();
    assert_eq!(&image[0..4], &[5.0; 4]);
    assert_eq!(&image[8..12], &[3.0; 4]);
    assert_eq!(&image[12..16], &[0.0; 4]);

    assert_eq!(launcher.run().unwrap_err().kind(), ErrorKind::Aborted);

    launcher.reset();
    launcher.clear_callbacks();
    assert_eq!(launcher.run().unwrap_err().kind(), ErrorKind::UnsetParams);
    launcher
        .set_parameters(RunParameters {
            iterations: 5,
            x_tiles: 4,
            ..RunParameters::with_dims(16, 4, 1)
        })
        .unwrap();
    assert_eq!(launcher.run().unwrap(), RunOutcome::Completed);
    assert_eq!(launcher.last_run_iterations(), &[5; 4]);
}

#[test]
fn abort_from_another_thread_is_seen_at_the_next_boundary() {
    let mut launcher = launcher_with(CountingKernel::default());
    launcher
        .set_parameters(RunParameters {
            iterations: 3,
            x_tiles: 2,
            ..RunParameters::with_dims(8, 2, 1)
        })
        .unwrap();

    let handle = launcher.abort_handle();
    launcher.set_iteration_callback(move |progress: IterationProgress| {
        if progress.subvolume == 1 && progress.iteration == 0 {
            let remote = handle.clone();
            std::thread::spawn(move || remote.abort()).join().unwrap();
        }
    });

    let outcome = launcher.run().unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Aborted {
            subvolume: 1,
            iteration: 0
        }
    );
    assert_eq!(launcher.last_run_iterations(), &[3, 0]);
}

fn launcher_aborting_at(subvolume: usize, iteration: usize) -> DeconvolutionLauncher {
    let kernel = CountingKernel {
        abort_at: Some((subvolume, iteration)),
        ..CountingKernel::default()
    };
    let slot = kernel.abort_handle.clone();
    let mut launcher = launcher_with(kernel);
    *slot.lock().unwrap() = Some(launcher.abort_handle());
    launcher
        .set_parameters(RunParameters {
            iterations: 3,
            x_tiles: 2,
            ..RunParameters::with_dims(8, 1, 1)
        })
        .unwrap();
    launcher
}

#[test]
fn abort_during_the_last_kernel_call_still_aborts_the_run() {
    let mut launcher = launcher_aborting_at(1, 2);
    assert_eq!(
        launcher.run().unwrap(),
        RunOutcome::Aborted {
            subvolume: 1,
            iteration: 3
        }
    );
    assert_eq!(launcher.last_run_iterations(), &[3, 3]);
    assert_eq!(*launcher.image().unwrap(), vec![3.0; 8]);
    assert_eq!(launcher.run().unwrap_err().kind(), ErrorKind::Aborted);

    // the next tile is never staged
    let mut launcher = launcher_aborting_at(0, 2);
    assert_eq!(
        launcher.run().unwrap(),
        RunOutcome::Aborted {
            subvolume: 0,
            iteration: 3
        }
    );
    assert_eq!(launcher.last_run_iterations(), &[3, 0]);
}

#[test]
fn callbacks_arrive_in_raster_and_iteration_order() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut launcher = launcher_with(IdentityKernel);
    launcher
        .set_parameters(RunParameters {
            iterations: 2,
            y_tiles: 2,
            ..RunParameters::with_dims(4, 4, 1)
        })
        .unwrap();

    let states = events.clone();
    launcher.set_state_callback(move |state: RunState| states.lock().unwrap().push(state.to_string()));
    let iterations = events.clone();
    launcher.set_iteration_callback(move |p: IterationProgress| {
        iterations.lock().unwrap().push(format!("{}:{}", p.subvolume, p.iteration));
    });

    launcher.run().unwrap();
    assert_eq!(
        *events.lock().unwrap(),
        vec!["init", "running", "0:0", "0:1", "1:0", "1:1", "cleanup", "finished"]
    );
}

#[test]
fn unlicensed_blind_fails_before_allocation() {
    let registry = registry(1);
    let licenses = Arc::new(LicenseCache::new(StaticLicenses::new().grant(Feature::Deconvolution)));
    let mut launcher = DeconvolutionLauncher::new(registry.clone(), licenses, IdentityKernel);

    let err = launcher
        .set_parameters(RunParameters {
            blind: true,
            ..RunParameters::with_dims(64, 64, 8)
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnlicensedBlind);
    assert_eq!(launcher.image_buffer_id(), None);
    assert_eq!(registry.free_memory(0).unwrap(), CAPACITY);
}

#[test]
fn multiple_devices_need_the_multi_gpu_license() {
    let registry = registry(2);
    let licenses = Arc::new(LicenseCache::new(StaticLicenses::new().grant(Feature::Deconvolution)));
    let mut launcher = DeconvolutionLauncher::new(registry, licenses, IdentityKernel);
    let params = RunParameters {
        x_tiles: 2,
        ..RunParameters::with_dims(8, 8, 1)
    };

    launcher.set_parameters(params.clone()).unwrap();
    launcher.set_devices(&[0, 1]).unwrap();
    // devices bound after set_parameters are checked again by run
    assert_eq!(launcher.run().unwrap_err().kind(), ErrorKind::UnlicensedMultiGpu);
    assert_eq!(launcher.state(), RunState::Finished);
    assert_eq!(launcher.set_parameters(params).unwrap_err().kind(), ErrorKind::UnlicensedMultiGpu);
}

#[test]
fn tiles_are_distributed_round_robin() {
    let kernel = CountingKernel::default();
    let visits = kernel.visits.clone();
    let mut launcher = DeconvolutionLauncher::new(registry(2), Arc::new(LicenseCache::unrestricted()), kernel);
    launcher.set_devices(&[0, 1]).unwrap();
    launcher
        .set_parameters(RunParameters {
            iterations: 1,
            x_tiles: 5,
            ..RunParameters::with_dims(10, 2, 1)
        })
        .unwrap();

    launcher.run().unwrap();
    assert_eq!(*visits.lock().unwrap(), vec![(0, 0), (1, 1), (2, 0), (3, 1), (4, 0)]);
    assert!(launcher.image().unwrap().iter().all(|&v| v == 1.0));
}

#[test]
fn kernel_errors_surface_after_cleanup() {
    let registry = registry(1);
    let kernel = CountingKernel {
        fail_at: Some((1, 2)),
        ..CountingKernel::default()
    };
    let mut launcher = DeconvolutionLauncher::new(registry.clone(), Arc::new(LicenseCache::unrestricted()), kernel);
    launcher
        .set_parameters(RunParameters {
            iterations: 3,
            x_tiles: 3,
            ..RunParameters::with_dims(12, 1, 1)
        })
        .unwrap();
    let states = Arc::new(Mutex::new(Vec::new()));
    let seen = states.clone();
    launcher.set_state_callback(move |state: RunState| seen.lock().unwrap().push(state));

    let err = launcher.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadFft);
    assert!(matches!(err.backend_error(), Some(BackendError::Fft(_))));
    assert_eq!(
        *states.lock().unwrap(),
        vec![RunState::Init, RunState::Running, RunState::Cleanup, RunState::Finished]
    );
    assert_eq!(launcher.last_run_iterations(), &[3, 2, 0]);
    assert_eq!(
        *launcher.image().unwrap(),
        vec![3.0, 3.0, 3.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
    );
    // device buffers were released despite the failure
    assert_eq!(registry.free_memory(0).unwrap(), CAPACITY);
}

#[test]
fn oversized_tiles_report_oom_and_finer_tiling_recovers() {
    decon_tracing::init_test_tracing();
    let registry = Arc::new(DeviceRegistry::host(vec![HostDeviceSpec::new("small", 512 << 10)]));
    let mut launcher = DeconvolutionLauncher::new(registry, Arc::new(LicenseCache::unrestricted()), IdentityKernel);
    launcher.set_parameters(RunParameters::with_dims(256, 256, 1)).unwrap();

    let err = launcher.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadAllocOom);
    assert!(err.message().contains("subvolume 0"));

    launcher
        .set_parameters(RunParameters {
            iterations: 1,
            y_tiles: 2,
            ..RunParameters::with_dims(256, 256, 1)
        })
        .unwrap();
    assert_eq!(launcher.run().unwrap(), RunOutcome::Completed);
}

#[test]
fn output_is_scaled_into_integer_ranges() {
    let mut launcher = launcher_with(IdentityKernel);
    let params = RunParameters {
        iterations: 1,
        scaling: Scaling::U8,
        ..RunParameters::with_dims(3, 1, 1)
    };
    launcher.set_parameters(params.clone()).unwrap();
    launcher.set_image_slice::<f32>(0, &[0.0, 255.0, 510.0]).unwrap();
    launcher.run().unwrap();

    let mut bytes = [0u8; 3];
    launcher.retrieve_image_slice(0, &mut bytes).unwrap();
    assert_eq!(bytes, [0, 128, 255]);

    launcher
        .set_parameters(RunParameters {
            scaling: Scaling::U16,
            ..params
        })
        .unwrap();
    let mut words = [0u16; 3];
    launcher.retrieve_image(&mut words).unwrap();
    assert_eq!(words, [0, 255, 510]);
}

#[test]
fn retrieved_psf_is_zero_padded_to_the_image() {
    let mut launcher = launcher_with(IdentityKernel);
    launcher.set_keep_psf(true);
    launcher
        .set_parameters(RunParameters {
            iterations: 1,
            x_tiles: 2,
            generate_psf: false,
            psf_nx: 64,
            psf_ny: 64,
            psf_nz: 1,
            ..RunParameters::with_dims(32, 32, 1)
        })
        .unwrap();
    launcher.set_psf_slice::<f32>(0, &vec![1.0; 64 * 64]).unwrap();
    launcher.run().unwrap();

    let mut psf = vec![-1.0f32; 32 * 32];
    launcher.retrieve_psf_slice(0, &mut psf).unwrap();
    for y in 0..32 {
        for x in 0..32 {
            let expected = if (8..24).contains(&x) { 1.0 } else { 0.0 };
            assert_eq!(psf[y * 32 + x], expected, "x = {x}, y = {y}");
        }
    }
    assert_eq!(launcher.retrieve_psf_slice(1, &mut psf).unwrap_err().kind(), ErrorKind::BadDimensionZ);
}

#[test]
fn psf_is_only_kept_on_request() {
    let mut launcher = launcher_with(IdentityKernel);
    launcher.set_parameters(RunParameters::with_dims(8, 8, 1)).unwrap();
    launcher.run().unwrap();
    let mut psf = vec![0.0f32; 64];
    assert_eq!(launcher.retrieve_psf_slice(0, &mut psf).unwrap_err().kind(), ErrorKind::NoPsf);

    launcher.set_keep_psf(true);
    launcher.run().unwrap();
    launcher.retrieve_psf_slice(0, &mut psf).unwrap();
    assert_eq!(psf[4 * 8 + 4], 1.0);
}

#[test]
fn runs_on_caller_storage() {
    let shape = Shape3::new(6, 4, 2);
    let image: SharedVolume = Arc::new(RwLock::new(vec![10.0; shape.voxels()]));
    let mut launcher = launcher_with(CountingKernel::default());
    launcher
        .set_parameters(RunParameters {
            iterations: 2,
            z_tiles: 2,
            ..RunParameters::with_dims(6, 4, 2)
        })
        .unwrap();

    assert_eq!(launcher.run_with(image.clone(), None).unwrap(), RunOutcome::Completed);
    assert!(image.read().iter().all(|&v| v == 12.0));

    let wrong: SharedVolume = Arc::new(RwLock::new(vec![0.0; 3]));
    assert_eq!(launcher.run_with(wrong, None).unwrap_err().kind(), ErrorKind::BadDimensionX);
}

#[test]
fn relative_change_stops_converged_tiles_early() {
    let registry = registry(1);
    let mut launcher = DeconvolutionLauncher::new(registry, Arc::new(LicenseCache::unrestricted()), IdentityKernel)
        .with_stopping_criterion(RelativeChange::new(1e-6));
    launcher
        .set_parameters(RunParameters {
            iterations: 10,
            x_tiles: 2,
            ..RunParameters::with_dims(8, 8, 1)
        })
        .unwrap();
    fill_image(&mut launcher, Shape3::new(8, 8, 1), |i| i as f32);

    launcher.run().unwrap();
    assert_eq!(launcher.last_run_iterations(), &[2, 2]);
}

#[test]
fn distinct_launchers_run_concurrently_on_distinct_devices() {
    let registry = registry(2);
    let licenses = Arc::new(LicenseCache::unrestricted());

    let workers: Vec<_> = (0..2)
        .map(|device| {
            let registry = registry.clone();
            let licenses = licenses.clone();
            std::thread::spawn(move || {
                let mut launcher = DeconvolutionLauncher::new(registry, licenses, CountingKernel::default());
                launcher.set_device(device).unwrap();
                launcher
                    .set_parameters(RunParameters {
                        iterations: device as i32 + 1,
                        y_tiles: 2,
                        ..RunParameters::with_dims(16, 16, 2)
                    })
                    .unwrap();
                launcher.run().unwrap();
                let values: HashSet<u32> = launcher.image().unwrap().iter().map(|v| v.to_bits()).collect();
                values
            })
        })
        .collect();

    let results: Vec<HashSet<u32>> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(results[0], HashSet::from([1.0f32.to_bits()]));
    assert_eq!(results[1], HashSet::from([2.0f32.to_bits()]));
}
