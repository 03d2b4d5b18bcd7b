//! Parameter validation
//!
//! [`validate`] checks a [`RunParameters`] bundle in a fixed order and stops at the
//! first failure. It reads the license cache but allocates nothing, so an
//! unentitled or malformed request never reaches device memory.

use crate::error::{Error, ErrorKind, Result};
use crate::geometry::Shape3;
use crate::licensing::{Feature, LicenseCache};
use crate::params::{PsfModel, PsfType, RegularizationType, RunParameters};

/// Parameters that passed [`validate`], with typed shapes
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedParameters {
    params: RunParameters,
    image: Shape3,
    psf: Option<Shape3>,
    padding: [usize; 3],
    tiles: [usize; 3],
    iterations: usize,
}

impl ValidatedParameters {
    pub fn params(&self) -> &RunParameters {
        &self.params
    }

    /// Image extent; `nz` is at least 1
    pub fn image_shape(&self) -> Shape3 {
        self.image
    }

    /// Extent of a caller-supplied PSF, `None` when the PSF is generated
    pub fn supplied_psf_shape(&self) -> Option<Shape3> {
        self.psf
    }

    /// Per-axis padding; z padding is zero for 2-D images
    pub fn padding(&self) -> [usize; 3] {
        self.padding
    }

    /// Effective tile counts per axis (at least 1)
    pub fn tiles(&self) -> [usize; 3] {
        self.tiles
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.iter().product()
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn is_3d(&self) -> bool {
        self.image.nz > 1
    }
}

fn fail<T>(kind: ErrorKind, message: String) -> Result<T> {
    Err(Error::new(kind, message))
}

fn positive(value: f32) -> bool {
    value.is_finite() && value > 0.0
}

/// Check `params` for a run on `device_count` devices.
#[tracing::instrument(skip(params, licenses), fields(nx = params.nx, ny = params.ny, nz = params.nz))]
pub fn validate(params: &RunParameters, licenses: &LicenseCache, device_count: usize) -> Result<ValidatedParameters> {
    let result = check(params, licenses, device_count);
    if let Err(err) = &result {
        tracing::warn!(kind = err.kind().name(), code = err.code(), error = %err, "parameters_rejected");
    }
    result
}

fn check(params: &RunParameters, licenses: &LicenseCache, device_count: usize) -> Result<ValidatedParameters> {
    // dimensions
    if params.nx <= 0 {
        return fail(ErrorKind::BadDimensionX, format!("nx must be positive, got {}", params.nx));
    }
    if params.ny <= 0 {
        return fail(ErrorKind::BadDimensionY, format!("ny must be positive, got {}", params.ny));
    }
    if params.nz < 0 {
        return fail(ErrorKind::BadDimensionZ, format!("nz must not be negative, got {}", params.nz));
    }
    if params.iterations < 0 {
        return fail(
            ErrorKind::UnsetParams,
            format!("iterations must not be negative, got {}", params.iterations),
        );
    }
    let image = Shape3::new(params.nx as usize, params.ny as usize, params.nz.max(1) as usize);
    let is_3d = image.nz > 1;

    // spacing
    if !positive(params.dr) {
        return fail(ErrorKind::BadDr, format!("dr must be positive, got {}", params.dr));
    }
    if is_3d && !positive(params.dz) {
        return fail(ErrorKind::BadDz, format!("dz must be positive for 3-D images, got {}", params.dz));
    }

    // optical constants
    if !positive(params.na) || params.na > params.ri {
        return fail(
            ErrorKind::BadNa,
            format!("NA must lie in (0, RI = {}], got {}", params.ri, params.na),
        );
    }
    if !params.ri.is_finite() || params.ri < 1.0 {
        return fail(ErrorKind::BadRi, format!("RI must be at least 1, got {}", params.ri));
    }
    let ns_set = params.ns.is_finite() && params.ns >= 1.0;
    if params.generate_psf && params.psf_model == PsfModel::Vectorial {
        if !ns_set {
            return fail(
                ErrorKind::BadNs,
                format!("the vectorial model needs a sample refractive index >= 1, got {}", params.ns),
            );
        }
    } else if !(ns_set || params.ns == 0.0) {
        return fail(ErrorKind::BadNs, format!("ns must be 0 or at least 1, got {}", params.ns));
    }

    // wavelength and pinhole
    if params.generate_psf {
        if !positive(params.lambda) {
            return fail(ErrorKind::BadLambda, format!("lambda must be positive, got {}", params.lambda));
        }
        // the pinhole is ignored by the other models
        if params.psf_type == PsfType::Confocal && !positive(params.pinhole) {
            return fail(
                ErrorKind::BadPinhole,
                format!("the confocal model needs a positive pinhole, got {}", params.pinhole),
            );
        }
    }

    // tiling
    let requested_tiles = [params.x_tiles, params.y_tiles, params.z_tiles];
    let tiling_kinds = [ErrorKind::BadTilingX, ErrorKind::BadTilingY, ErrorKind::BadTilingZ];
    let mut tiles = [1usize; 3];
    for axis in 0..3 {
        let requested = requested_tiles[axis];
        let extent = image.dims()[axis];
        if requested < 0 {
            return fail(
                tiling_kinds[axis],
                format!("tile count must not be negative, got {requested}"),
            );
        }
        let count = requested.max(1) as usize;
        if count > extent {
            return fail(
                tiling_kinds[axis],
                format!("{count} tiles do not fit an axis of {extent} voxels"),
            );
        }
        tiles[axis] = count;
    }
    if !is_3d && params.z_tiles > 1 {
        return fail(
            ErrorKind::BadTilingZ,
            format!("2-D images cannot be tiled along z, got {}", params.z_tiles),
        );
    }

    // padding
    let requested_padding = [params.x_padding, params.y_padding, params.z_padding];
    let padding_kinds = [ErrorKind::BadPaddingX, ErrorKind::BadPaddingY, ErrorKind::BadPaddingZ];
    let mut padding = [0usize; 3];
    for axis in 0..3 {
        let requested = requested_padding[axis];
        if requested < 0 {
            return fail(
                padding_kinds[axis],
                format!("padding must not be negative, got {requested}"),
            );
        }
        padding[axis] = requested as usize;
    }
    if !is_3d {
        padding[2] = 0;
    }

    // cross-field checks on typed enums
    if let Some(light_sheet) = params.light_sheet {
        if params.psf_type != PsfType::Widefield {
            return fail(
                ErrorKind::BadPsfType,
                format!("light-sheet illumination needs widefield detection, got {:?}", params.psf_type),
            );
        }
        if !positive(light_sheet.na) || light_sheet.na > params.na {
            return fail(
                ErrorKind::BadPsfType,
                format!(
                    "light-sheet NA must lie in (0, NA = {}], got {}",
                    params.na, light_sheet.na
                ),
            );
        }
    }
    if params.psf_model == PsfModel::Vectorial && params.psf_type == PsfType::TwoPhoton {
        return fail(
            ErrorKind::BadPsfModel,
            "the vectorial model does not support two-photon excitation".to_string(),
        );
    }
    let psf = if params.generate_psf {
        None
    } else {
        if params.psf_nx <= 0 || params.psf_ny <= 0 || params.psf_nz < 0 {
            return fail(
                ErrorKind::NoPsf,
                format!(
                    "a supplied PSF needs its dimensions, got {}x{}x{}",
                    params.psf_nx, params.psf_ny, params.psf_nz
                ),
            );
        }
        let psf_is_3d = params.psf_nz > 1;
        if !positive(params.psf_dr) {
            return fail(
                ErrorKind::BadDr,
                format!("a supplied PSF needs a positive lateral spacing, got {}", params.psf_dr),
            );
        }
        if psf_is_3d && !positive(params.psf_dz) {
            return fail(
                ErrorKind::BadDz,
                format!("a 3-D supplied PSF needs a positive axial spacing, got {}", params.psf_dz),
            );
        }
        if params.psf_dr != params.dr || (psf_is_3d && is_3d && params.psf_dz != params.dz) {
            tracing::warn!(
                psf_dr = params.psf_dr,
                psf_dz = params.psf_dz,
                dr = params.dr,
                dz = params.dz,
                "psf_spacing_differs_from_image"
            );
        }
        Some(Shape3::new(
            params.psf_nx as usize,
            params.psf_ny as usize,
            params.psf_nz.max(1) as usize,
        ))
    };
    if params.blind {
        if let Some(psf) = psf {
            let too_large = (0..3).any(|axis| psf.dims()[axis] > image.dims()[axis]);
            if too_large {
                return fail(
                    ErrorKind::BadBlind,
                    format!("blind mode needs a PSF no larger than the image; PSF {psf}, image {image}"),
                );
            }
        }
    }

    // regularization
    if !params.regularization.is_finite() {
        return fail(
            ErrorKind::BadRegularizationFactor,
            format!("regularization must be finite, got {}", params.regularization),
        );
    }
    if params.regularization_type != RegularizationType::None
        && !(params.regularization > 0.0 || params.regularization == -1.0)
    {
        return fail(
            ErrorKind::BadRegularizationFactor,
            format!(
                "regularization must be positive or -1 (adaptive), got {}",
                params.regularization
            ),
        );
    }

    if !params.background.is_finite() || params.background < 0.0 {
        return fail(
            ErrorKind::BadBackground,
            format!("background must not be negative, got {}", params.background),
        );
    }

    // licensing
    if !licenses.is_entitled(Feature::Deconvolution) {
        return fail(
            ErrorKind::UnlicensedDeconvolution,
            "no valid license for deconvolution".to_string(),
        );
    }
    if params.blind && !licenses.is_entitled(Feature::Blind) {
        return fail(ErrorKind::UnlicensedBlind, "no valid license for blind deconvolution".to_string());
    }
    if device_count > 1 && !licenses.is_entitled(Feature::MultiGpu) {
        return fail(
            ErrorKind::UnlicensedMultiGpu,
            format!("no valid license for running on {device_count} devices"),
        );
    }

    Ok(ValidatedParameters {
        params: params.clone(),
        image,
        psf,
        padding,
        tiles,
        iterations: params.iterations as usize,
    })
}
