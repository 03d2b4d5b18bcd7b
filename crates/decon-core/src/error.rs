//! Error types for launcher operations
//!
//! Every failure carries an [`ErrorKind`] with a stable numeric code and a
//! human-readable message. Kinds group into [`ErrorCategory`] so callers can
//! decide between correcting input, shrinking the problem, or giving up.

use std::fmt;

use decon_backends::BackendError;

/// Result type for launcher operations
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unspecified,

    UnsetParams,
    NoImage,
    NoPsf,

    BadDevice,
    BadDriver,

    BadDimensionX,
    BadDimensionY,
    BadDimensionZ,
    BadDr,
    BadDz,

    BadNa,
    BadRi,
    BadNs,

    BadLambda,
    BadPinhole,

    BadTilingX,
    BadTilingY,
    BadTilingZ,

    BadPaddingX,
    BadPaddingY,
    BadPaddingZ,

    BadPsfType,
    BadPsfModel,
    BadScaling,
    BadPreFilter,
    BadPostFilter,
    BadBlind,

    BadRegularizationType,
    BadRegularizationFactor,

    BadBackground,

    BadFft,

    BadNpp,

    BadAllocGpu,
    BadAllocCpu,
    BadAllocPinned,
    BadAllocOom,

    UnlicensedDeconvolution,
    UnlicensedBlind,
    UnlicensedMultiGpu,

    BadThrust,

    Aborted,
}

/// Coarse grouping of [`ErrorKind`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid parameter values; correct and resubmit
    Configuration,
    /// Calls made out of order (no parameters, image or PSF yet)
    Usage,
    /// Host, pinned or device allocation failed
    Resource,
    /// Unknown device or unsupported driver
    Device,
    /// Feature not entitled
    Licensing,
    /// Compute kernel failure
    Execution,
    /// Run stopped by request
    Aborted,
}

const ALL_KINDS: [ErrorKind; 42] = [
    ErrorKind::Unspecified,
    ErrorKind::UnsetParams,
    ErrorKind::NoImage,
    ErrorKind::NoPsf,
    ErrorKind::BadDevice,
    ErrorKind::BadDriver,
    ErrorKind::BadDimensionX,
    ErrorKind::BadDimensionY,
    ErrorKind::BadDimensionZ,
    ErrorKind::BadDr,
    ErrorKind::BadDz,
    ErrorKind::BadNa,
    ErrorKind::BadRi,
    ErrorKind::BadNs,
    ErrorKind::BadLambda,
    ErrorKind::BadPinhole,
    ErrorKind::BadTilingX,
    ErrorKind::BadTilingY,
    ErrorKind::BadTilingZ,
    ErrorKind::BadPaddingX,
    ErrorKind::BadPaddingY,
    ErrorKind::BadPaddingZ,
    ErrorKind::BadPsfType,
    ErrorKind::BadPsfModel,
    ErrorKind::BadScaling,
    ErrorKind::BadPreFilter,
    ErrorKind::BadPostFilter,
    ErrorKind::BadBlind,
    ErrorKind::BadRegularizationType,
    ErrorKind::BadRegularizationFactor,
    ErrorKind::BadBackground,
    ErrorKind::BadFft,
    ErrorKind::BadNpp,
    ErrorKind::BadAllocGpu,
    ErrorKind::BadAllocCpu,
    ErrorKind::BadAllocPinned,
    ErrorKind::BadAllocOom,
    ErrorKind::UnlicensedDeconvolution,
    ErrorKind::UnlicensedBlind,
    ErrorKind::UnlicensedMultiGpu,
    ErrorKind::BadThrust,
    ErrorKind::Aborted,
];

impl ErrorKind {
    /// Stable numeric code
    pub const fn code(self) -> i32 {
        match self {
            ErrorKind::Unspecified => 1,
            ErrorKind::UnsetParams => 2,
            ErrorKind::NoImage => 3,
            ErrorKind::NoPsf => 4,
            ErrorKind::BadDevice => 10,
            ErrorKind::BadDriver => 11,
            ErrorKind::BadDimensionX => 20,
            ErrorKind::BadDimensionY => 21,
            ErrorKind::BadDimensionZ => 22,
            ErrorKind::BadDr => 23,
            ErrorKind::BadDz => 24,
            ErrorKind::BadNa => 30,
            ErrorKind::BadRi => 31,
            ErrorKind::BadNs => 32,
            ErrorKind::BadLambda => 40,
            ErrorKind::BadPinhole => 41,
            ErrorKind::BadTilingX => 50,
            ErrorKind::BadTilingY => 51,
            ErrorKind::BadTilingZ => 52,
            ErrorKind::BadPaddingX => 60,
            ErrorKind::BadPaddingY => 61,
            ErrorKind::BadPaddingZ => 62,
            ErrorKind::BadPsfType => 70,
            ErrorKind::BadPsfModel => 71,
            ErrorKind::BadScaling => 72,
            ErrorKind::BadPreFilter => 73,
            ErrorKind::BadPostFilter => 74,
            ErrorKind::BadBlind => 75,
            ErrorKind::BadRegularizationType => 80,
            ErrorKind::BadRegularizationFactor => 81,
            ErrorKind::BadBackground => 90,
            ErrorKind::BadFft => 200,
            ErrorKind::BadNpp => 300,
            ErrorKind::BadAllocGpu => 400,
            ErrorKind::BadAllocCpu => 401,
            ErrorKind::BadAllocPinned => 402,
            ErrorKind::BadAllocOom => 403,
            ErrorKind::UnlicensedDeconvolution => 500,
            ErrorKind::UnlicensedBlind => 501,
            ErrorKind::UnlicensedMultiGpu => 502,
            ErrorKind::BadThrust => 600,
            ErrorKind::Aborted => 700,
        }
    }

    /// Kind for a numeric code; `None` for `0` (no error) and unknown codes.
    pub fn from_code(code: i32) -> Option<Self> {
        ALL_KINDS.iter().copied().find(|kind| kind.code() == code)
    }

    pub const fn category(self) -> ErrorCategory {
        match self.code() {
            1 => ErrorCategory::Execution,
            2..=4 => ErrorCategory::Usage,
            10 | 11 => ErrorCategory::Device,
            20..=99 => ErrorCategory::Configuration,
            400..=499 => ErrorCategory::Resource,
            500..=599 => ErrorCategory::Licensing,
            700 => ErrorCategory::Aborted,
            _ => ErrorCategory::Execution,
        }
    }

    /// Identifier used in messages and logs, e.g. `badDimensionX`
    pub const fn name(self) -> &'static str {
        match self {
            ErrorKind::Unspecified => "unspecified",
            ErrorKind::UnsetParams => "unsetParams",
            ErrorKind::NoImage => "noImage",
            ErrorKind::NoPsf => "noPSF",
            ErrorKind::BadDevice => "badDevice",
            ErrorKind::BadDriver => "badDriver",
            ErrorKind::BadDimensionX => "badDimensionX",
            ErrorKind::BadDimensionY => "badDimensionY",
            ErrorKind::BadDimensionZ => "badDimensionZ",
            ErrorKind::BadDr => "badDR",
            ErrorKind::BadDz => "badDZ",
            ErrorKind::BadNa => "badNA",
            ErrorKind::BadRi => "badRI",
            ErrorKind::BadNs => "badNS",
            ErrorKind::BadLambda => "badLambda",
            ErrorKind::BadPinhole => "badPinhole",
            ErrorKind::BadTilingX => "badTilingX",
            ErrorKind::BadTilingY => "badTilingY",
            ErrorKind::BadTilingZ => "badTilingZ",
            ErrorKind::BadPaddingX => "badPaddingX",
            ErrorKind::BadPaddingY => "badPaddingY",
            ErrorKind::BadPaddingZ => "badPaddingZ",
            ErrorKind::BadPsfType => "badPsfType",
            ErrorKind::BadPsfModel => "badPsfModel",
            ErrorKind::BadScaling => "badScaling",
            ErrorKind::BadPreFilter => "badPreFilter",
            ErrorKind::BadPostFilter => "badPostFilter",
            ErrorKind::BadBlind => "badBlind",
            ErrorKind::BadRegularizationType => "badRegularizationType",
            ErrorKind::BadRegularizationFactor => "badRegularizationFactor",
            ErrorKind::BadBackground => "badBackground",
            ErrorKind::BadFft => "badFFT",
            ErrorKind::BadNpp => "badNPP",
            ErrorKind::BadAllocGpu => "badAllocGPU",
            ErrorKind::BadAllocCpu => "badAllocCPU",
            ErrorKind::BadAllocPinned => "badAllocPinned",
            ErrorKind::BadAllocOom => "badAllocOOM",
            ErrorKind::UnlicensedDeconvolution => "unlicensedDeconvolution",
            ErrorKind::UnlicensedBlind => "unlicensedBlind",
            ErrorKind::UnlicensedMultiGpu => "unlicensedMultiGPU",
            ErrorKind::BadThrust => "badThrust",
            ErrorKind::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// A launcher failure: kind, message and, for device failures, the
/// underlying [`BackendError`].
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<BackendError>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> i32 {
        self.kind.code()
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Device error this failure was raised from, if any
    pub fn backend_error(&self) -> Option<&BackendError> {
        self.source.as_ref()
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        let kind = match &err {
            BackendError::DeviceNotFound { .. } => ErrorKind::BadDevice,
            BackendError::UnsupportedDevice { .. }
            | BackendError::DriverTooOld { .. }
            | BackendError::Driver(_) => ErrorKind::BadDriver,
            BackendError::OutOfMemory { .. } => ErrorKind::BadAllocOom,
            BackendError::DeviceAllocation(_) => ErrorKind::BadAllocGpu,
            BackendError::HostAllocation(_) => ErrorKind::BadAllocCpu,
            BackendError::PinnedAllocation(_) => ErrorKind::BadAllocPinned,
            BackendError::Fft(_) => ErrorKind::BadFft,
            BackendError::Npp(_) => ErrorKind::BadNpp,
            BackendError::Thrust(_) => ErrorKind::BadThrust,
            BackendError::InvalidBufferHandle(_)
            | BackendError::BufferSizeMismatch { .. }
            | BackendError::Other(_) => ErrorKind::Unspecified,
        };
        Self {
            kind,
            message: err.to_string(),
            source: Some(err),
        }
    }
}
