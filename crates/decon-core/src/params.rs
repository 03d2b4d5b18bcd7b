//! Run parameters
//!
//! [`RunParameters`] is the externally supplied bundle. Counts are signed so that
//! malformed input survives deserialization and is rejected by
//! [`crate::validate`] with a precise [`ErrorKind`].
//!
//! ```rust
//! use decon_core::params::{RunParameters, Scaling};
//!
//! let params = RunParameters::from_json_str(
//!     r#"{ "nx": 512, "ny": 512, "nz": 64, "iterations": 25, "scaling": "u16" }"#,
//! )
//! .unwrap();
//! assert_eq!(params.scaling, Scaling::U16);
//! assert_eq!(params.dr, RunParameters::default().dr);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Declares an enum with stable integer codes and a checked `TryFrom<i32>` that
/// fails with the given [`ErrorKind`].
macro_rules! coded_enum {
    (
        $(#[$meta:meta])*
        $name:ident => $kind:expr,
        { $($(#[$vmeta:meta])* $variant:ident = $code:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant = $code),+
        }

        impl $name {
            pub const fn code(self) -> i32 {
                self as i32
            }
        }

        impl TryFrom<i32> for $name {
            type Error = Error;

            fn try_from(code: i32) -> Result<Self> {
                match code {
                    $($code => Ok($name::$variant),)+
                    other => Err(Error::new(
                        $kind,
                        format!("{} code {} is out of range", stringify!($name), other),
                    )),
                }
            }
        }

        impl From<$name> for i32 {
            fn from(value: $name) -> i32 {
                value.code()
            }
        }
    };
}

coded_enum! {
    /// Theoretical PSF model family
    PsfType => ErrorKind::BadPsfType,
    {
        #[default]
        Widefield = 0,
        /// Requires [`RunParameters::pinhole`]
        Confocal = 1,
        TwoPhoton = 2,
    }
}

coded_enum! {
    /// Scalar or vectorial diffraction model
    PsfModel => ErrorKind::BadPsfModel,
    {
        #[default]
        BornWolf = 0,
        /// Requires the sample refractive index [`RunParameters::ns`]
        Vectorial = 1,
    }
}

coded_enum! {
    /// Intensity scaling applied when output is retrieved
    Scaling => ErrorKind::BadScaling,
    {
        /// Full single-precision range
        #[default]
        None = 0,
        /// Fit into 16 bits if necessary, round to nearest
        U16 = 1,
        /// Fit into 8 bits if necessary, round to nearest
        U8 = 2,
    }
}

coded_enum! {
    /// Filtering applied before deconvolution
    PreFilter => ErrorKind::BadPreFilter,
    {
        #[default]
        None = 0,
        GaussianImage = 1,
        GaussianImageAndPsf = 2,
        MedianImage = 3,
    }
}

coded_enum! {
    /// Filtering applied after deconvolution
    PostFilter => ErrorKind::BadPostFilter,
    {
        #[default]
        None = 0,
        Gaussian = 1,
        Median = 2,
        Sharpen = 3,
    }
}

coded_enum! {
    /// Noise regularization method
    RegularizationType => ErrorKind::BadRegularizationType,
    {
        #[default]
        None = 0,
        Tv = 1,
        Entropy = 2,
    }
}

coded_enum! {
    /// Light-sheet illumination direction
    LightSheetDirection => ErrorKind::BadPsfType,
    {
        #[default]
        LeftRight = 0,
        TopBottom = 1,
    }
}

impl Scaling {
    /// Largest representable output value, `None` for float output
    pub const fn range_max(self) -> Option<f32> {
        match self {
            Scaling::None => None,
            Scaling::U16 => Some(u16::MAX as f32),
            Scaling::U8 => Some(u8::MAX as f32),
        }
    }
}

/// Light-sheet illumination, only meaningful for widefield detection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightSheetParameters {
    /// Illumination numerical aperture
    pub na: f32,
    #[serde(default)]
    pub direction: LightSheetDirection,
}

/// Optical constants consumed by PSF generation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Optics {
    pub lambda: f32,
    pub dr: f32,
    pub dz: f32,
    pub na: f32,
    pub ri: f32,
    pub ns: f32,
    pub pinhole: f32,
    pub psf_type: PsfType,
    pub psf_model: PsfModel,
    pub light_sheet: Option<LightSheetParameters>,
}

/// Parameters of one deconvolution run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParameters {
    /// Image width in voxels
    pub nx: i32,
    /// Image height in voxels
    pub ny: i32,
    /// Number of z-planes; 0 or 1 for 2-D
    pub nz: i32,
    /// 0 stages and transfers data without iterating
    pub iterations: i32,
    pub x_padding: i32,
    pub y_padding: i32,
    pub z_padding: i32,
    /// Subvolumes along x; 0 or 1 for no tiling
    pub x_tiles: i32,
    pub y_tiles: i32,
    pub z_tiles: i32,
    /// Emission wavelength, nm
    pub lambda: f32,
    /// Lateral spacing, nm/pixel
    pub dr: f32,
    /// Axial spacing, nm/plane
    pub dz: f32,
    pub na: f32,
    /// Immersion medium refractive index
    pub ri: f32,
    /// Sample refractive index
    pub ns: f32,
    pub zdepth: f32,
    pub imaging_up: bool,
    /// Back-projected pinhole, nm
    pub pinhole: f32,
    pub psf_type: PsfType,
    pub psf_model: PsfModel,
    pub generate_psf: bool,
    pub blind: bool,
    pub scaling: Scaling,
    pub pre_filter: PreFilter,
    pub post_filter: PostFilter,
    pub regularization_type: RegularizationType,
    /// Positive strength, or -1 for adaptive
    pub regularization: f32,
    pub background: f32,
    pub psf_nx: i32,
    pub psf_ny: i32,
    pub psf_nz: i32,
    /// Lateral spacing of a supplied PSF, nm/pixel
    pub psf_dr: f32,
    /// Axial spacing of a supplied PSF, nm/plane
    pub psf_dz: f32,
    pub light_sheet: Option<LightSheetParameters>,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            nx: 0,
            ny: 0,
            nz: 0,
            iterations: 100,
            x_padding: 0,
            y_padding: 0,
            z_padding: 0,
            x_tiles: 0,
            y_tiles: 0,
            z_tiles: 0,
            lambda: 520.0,
            dr: 100.0,
            dz: 250.0,
            na: 1.4,
            ri: 1.515,
            ns: 1.33,
            zdepth: 0.0,
            imaging_up: false,
            pinhole: 0.0,
            psf_type: PsfType::Widefield,
            psf_model: PsfModel::BornWolf,
            generate_psf: true,
            blind: false,
            scaling: Scaling::None,
            pre_filter: PreFilter::None,
            post_filter: PostFilter::None,
            regularization_type: RegularizationType::None,
            regularization: 0.0,
            background: 0.0,
            psf_nx: 0,
            psf_ny: 0,
            psf_nz: 0,
            psf_dr: 100.0,
            psf_dz: 250.0,
            light_sheet: None,
        }
    }
}

/// Values whose change forces the launcher to reallocate its volumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferLayout {
    dims: [i32; 3],
    padding: [i32; 3],
    psf_dims: [i32; 3],
    generate_psf: bool,
}

impl RunParameters {
    /// Image bundle with the given dimensions and defaults elsewhere.
    pub fn with_dims(nx: i32, ny: i32, nz: i32) -> Self {
        Self {
            nx,
            ny,
            nz,
            ..Self::default()
        }
    }

    /// Parse a JSON document; absent fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| Error::new(ErrorKind::UnsetParams, format!("invalid parameter document: {err}")))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| Error::new(ErrorKind::Unspecified, format!("cannot serialize parameters: {err}")))
    }

    /// More than one z-plane
    pub fn is_3d(&self) -> bool {
        self.nz > 1
    }

    pub fn optics(&self) -> Optics {
        Optics {
            lambda: self.lambda,
            dr: self.dr,
            dz: self.dz,
            na: self.na,
            ri: self.ri,
            ns: self.ns,
            pinhole: self.pinhole,
            psf_type: self.psf_type,
            psf_model: self.psf_model,
            light_sheet: self.light_sheet,
        }
    }

    pub(crate) fn buffer_layout(&self) -> BufferLayout {
        BufferLayout {
            dims: [self.nx, self.ny, self.nz],
            padding: [self.x_padding, self.y_padding, self.z_padding],
            psf_dims: [self.psf_nx, self.psf_ny, self.psf_nz],
            generate_psf: self.generate_psf,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_codes_are_checked() {
        assert_eq!(PsfType::try_from(1).unwrap(), PsfType::Confocal);
        assert_eq!(i32::from(Scaling::U8), 2);
        assert_eq!(PostFilter::Sharpen.code(), 3);

        let err = Scaling::try_from(3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadScaling);
        assert_eq!(PreFilter::try_from(-1).unwrap_err().kind(), ErrorKind::BadPreFilter);
        assert_eq!(PsfModel::try_from(2).unwrap_err().kind(), ErrorKind::BadPsfModel);
        assert_eq!(
            RegularizationType::try_from(9).unwrap_err().kind(),
            ErrorKind::BadRegularizationType
        );
    }

    #[test]
    fn json_uses_snake_case_and_defaults() {
        let params = RunParameters::from_json_str(
            r#"{
                "nx": 64, "ny": 32, "x_tiles": 2,
                "pre_filter": "gaussian_image_and_psf",
                "light_sheet": { "na": 0.3, "direction": "top_bottom" }
            }"#,
        )
        .unwrap();
        assert_eq!(params.nx, 64);
        assert_eq!(params.x_tiles, 2);
        assert_eq!(params.pre_filter, PreFilter::GaussianImageAndPsf);
        assert_eq!(
            params.light_sheet.map(|ls| ls.direction),
            Some(LightSheetDirection::TopBottom)
        );
        assert_eq!(params.iterations, RunParameters::default().iterations);
    }

    #[test]
    fn json_round_trip() {
        let params = RunParameters {
            blind: true,
            scaling: Scaling::U16,
            ..RunParameters::with_dims(8, 8, 4)
        };
        let parsed = RunParameters::from_json_str(&params.to_json_string().unwrap()).unwrap();
        assert_eq!(parsed, params);
    }

    #[test]
    fn malformed_json_is_a_parameter_error() {
        let err = RunParameters::from_json_str(r#"{ "scaling": "u12" }"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsetParams);
    }

    #[test]
    fn layout_ignores_non_buffer_fields() {
        let a = RunParameters::with_dims(16, 16, 1);
        let b = RunParameters {
            iterations: 3,
            na: 1.2,
            scaling: Scaling::U8,
            ..a.clone()
        };
        assert_eq!(a.buffer_layout(), b.buffer_layout());

        let c = RunParameters { x_padding: 4, ..a.clone() };
        assert_ne!(a.buffer_layout(), c.buffer_layout());
    }
}
