//! Feature entitlements
//!
//! A [`LicenseBackend`] answers whether a product key is entitled. The
//! [`LicenseCache`] checks out all [`Feature`]s once and is shared (as an `Arc`)
//! by every launcher; the validator only ever reads it.

use std::collections::HashMap;
use std::fmt;

use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;

use crate::error::{Error, ErrorKind, Result};

/// Licensed product features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Deconvolution,
    Blind,
    MultiGpu,
}

impl Feature {
    pub const ALL: [Feature; 3] = [Feature::Deconvolution, Feature::Blind, Feature::MultiGpu];

    /// Product key understood by license backends
    pub const fn key(self) -> &'static str {
        match self {
            Feature::Deconvolution => "deconvolution",
            Feature::Blind => "blind",
            Feature::MultiGpu => "multiGPU",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|feature| feature.key() == key)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Expiration of a license entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    Permanent,
    /// Valid through the given day
    Until(NaiveDate),
    /// No license for this key
    Absent,
}

impl Expiration {
    pub fn is_valid_on(self, today: NaiveDate) -> bool {
        match self {
            Expiration::Permanent => true,
            Expiration::Until(date) => date >= today,
            Expiration::Absent => false,
        }
    }
}

/// Source of entitlement information
pub trait LicenseBackend: Send + Sync {
    fn expiration(&self, key: &str) -> Expiration;

    fn has_valid_license(&self, key: &str) -> bool {
        self.expiration(key).is_valid_on(today())
    }

    fn has_permanent_license(&self, key: &str) -> bool {
        self.expiration(key) == Expiration::Permanent
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Fixed set of entitlements, built in code
#[derive(Debug, Clone, Default)]
pub struct StaticLicenses {
    entries: HashMap<String, Expiration>,
}

impl StaticLicenses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every feature, permanently
    pub fn all() -> Self {
        Feature::ALL
            .into_iter()
            .fold(Self::new(), |licenses, feature| licenses.grant(feature))
    }

    pub fn grant(self, feature: Feature) -> Self {
        self.grant_key(feature.key(), Expiration::Permanent)
    }

    pub fn grant_until(self, feature: Feature, date: NaiveDate) -> Self {
        self.grant_key(feature.key(), Expiration::Until(date))
    }

    pub fn grant_key(mut self, key: impl Into<String>, expiration: Expiration) -> Self {
        self.entries.insert(key.into(), expiration);
        self
    }
}

impl LicenseBackend for StaticLicenses {
    fn expiration(&self, key: &str) -> Expiration {
        self.entries.get(key).copied().unwrap_or(Expiration::Absent)
    }
}

/// Entitlements parsed from a license string of the form
/// `deconvolution=permanent;blind=2031-12-31`.
#[derive(Debug, Clone, Default)]
pub struct LicenseString {
    licenses: StaticLicenses,
}

impl LicenseString {
    pub fn parse(text: &str) -> Result<Self> {
        let mut licenses = StaticLicenses::new();
        for entry in text.split(';').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (key, value) = entry.split_once('=').ok_or_else(|| {
                Error::new(ErrorKind::Unspecified, format!("license entry `{entry}` has no `=`"))
            })?;
            let expiration = match value.trim() {
                value if value.eq_ignore_ascii_case("permanent") => Expiration::Permanent,
                value => NaiveDate::parse_from_str(value, "%Y-%m-%d")
                    .map(Expiration::Until)
                    .map_err(|err| {
                        Error::new(
                            ErrorKind::Unspecified,
                            format!("license entry `{entry}` has an invalid date: {err}"),
                        )
                    })?,
            };
            licenses = licenses.grant_key(key.trim(), expiration);
        }
        Ok(Self { licenses })
    }
}

impl std::str::FromStr for LicenseString {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        Self::parse(text)
    }
}

impl LicenseBackend for LicenseString {
    fn expiration(&self, key: &str) -> Expiration {
        self.licenses.expiration(key)
    }
}

/// Process-wide snapshot of entitlements
pub struct LicenseCache {
    backend: Box<dyn LicenseBackend>,
    checked_out: RwLock<Option<HashMap<Feature, Expiration>>>,
}

impl fmt::Debug for LicenseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LicenseCache")
            .field("checked_out", &*self.checked_out.read())
            .finish_non_exhaustive()
    }
}

impl LicenseCache {
    pub fn new(backend: impl LicenseBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            checked_out: RwLock::new(None),
        }
    }

    /// Cache entitled to every feature
    pub fn unrestricted() -> Self {
        Self::new(StaticLicenses::all())
    }

    /// Query the backend for every feature and keep the answers.
    pub fn checkout(&self) {
        let snapshot: HashMap<Feature, Expiration> = Feature::ALL
            .into_iter()
            .map(|feature| (feature, self.backend.expiration(feature.key())))
            .collect();
        tracing::debug!(?snapshot, "licenses_checked_out");
        *self.checked_out.write() = Some(snapshot);
    }

    /// Drop the snapshot; the next query checks out again.
    pub fn release(&self) {
        *self.checked_out.write() = None;
    }

    pub fn expiration(&self, feature: Feature) -> Expiration {
        if let Some(snapshot) = self.checked_out.read().as_ref() {
            return snapshot.get(&feature).copied().unwrap_or(Expiration::Absent);
        }
        self.checkout();
        self.checked_out
            .read()
            .as_ref()
            .and_then(|snapshot| snapshot.get(&feature).copied())
            .unwrap_or(Expiration::Absent)
    }

    pub fn is_entitled(&self, feature: Feature) -> bool {
        self.expiration(feature).is_valid_on(today())
    }

    pub fn has_permanent(&self, feature: Feature) -> bool {
        self.expiration(feature) == Expiration::Permanent
    }
}
