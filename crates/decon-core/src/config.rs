//! Launcher configuration

use std::env;

/// Fraction of a device's free memory a tile may use
pub const ENV_MEMORY_HEADROOM: &str = "DECON_MEMORY_HEADROOM";
/// Keep the first tile's PSF by default
pub const ENV_KEEP_PSF: &str = "DECON_KEEP_PSF";

const DEFAULT_MEMORY_HEADROOM: f64 = 0.9;

/// Launcher-level knobs that are not part of a run's parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LauncherConfig {
    /// Applied to the smallest free memory of the bound devices to get the
    /// per-tile budget; in `(0, 1]`
    pub memory_headroom: f64,
    pub keep_psf: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            memory_headroom: DEFAULT_MEMORY_HEADROOM,
            keep_psf: false,
        }
    }
}

impl LauncherConfig {
    /// Defaults overridden by `DECON_MEMORY_HEADROOM` and `DECON_KEEP_PSF`.
    ///
    /// Malformed or out-of-range values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = env::var(ENV_MEMORY_HEADROOM) {
            match value.trim().parse::<f64>() {
                Ok(headroom) if headroom > 0.0 && headroom <= 1.0 => config.memory_headroom = headroom,
                _ => tracing::warn!(value = %value, "ignoring_memory_headroom"),
            }
        }

        if let Ok(value) = env::var(ENV_KEEP_PSF) {
            let value = value.trim();
            config.keep_psf = value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes");
        }

        config
    }

    pub fn with_memory_headroom(mut self, headroom: f64) -> Self {
        self.memory_headroom = headroom.clamp(f64::MIN_POSITIVE, 1.0);
        self
    }

    pub fn with_keep_psf(mut self, keep_psf: bool) -> Self {
        self.keep_psf = keep_psf;
        self
    }

    /// Per-tile budget for a device with `free_bytes` available
    pub fn budget(&self, free_bytes: usize) -> usize {
        (free_bytes as f64 * self.memory_headroom) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        env::remove_var(ENV_MEMORY_HEADROOM);
        env::remove_var(ENV_KEEP_PSF);
    }

    #[test]
    fn defaults_without_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        assert_eq!(LauncherConfig::from_env(), LauncherConfig::default());
    }

    #[test]
    fn reads_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var(ENV_MEMORY_HEADROOM, "0.5");
        env::set_var(ENV_KEEP_PSF, "true");
        let config = LauncherConfig::from_env();
        clear_env();

        assert_eq!(config.memory_headroom, 0.5);
        assert!(config.keep_psf);
        assert_eq!(config.budget(1000), 500);
    }

    #[test]
    fn out_of_range_headroom_is_ignored() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var(ENV_MEMORY_HEADROOM, "1.5");
        let config = LauncherConfig::from_env();
        clear_env();

        assert_eq!(config.memory_headroom, DEFAULT_MEMORY_HEADROOM);
    }

    #[test]
    fn builder_clamps_headroom() {
        let config = LauncherConfig::default().with_memory_headroom(4.0).with_keep_psf(true);
        assert_eq!(config.memory_headroom, 1.0);
        assert_eq!(config.budget(1 << 40), 1 << 40);
    }
}
