//! Configuration for a blobcache instance

/// Cache configuration.
///
/// The defaults match the reference deployment: auto-vacuum at 50%
/// fragmentation, no fsync (the OS page cache is trusted across process
/// crashes, not across power loss).
#[derive(Debug, Clone)]
pub struct Config {
    /// Fragmentation ratio above which `close` compacts the blob file.
    /// Must lie in [0.0, 1.0]; 1.0 disables the auto-vacuum gate, which
    /// keeps `close` cheap for callers that must shut down quickly.
    pub auto_vacuum_threshold: f64,

    /// When true, every mutating operation also forces data to persistent
    /// storage (fdatasync and friends) before returning. Off by default:
    /// the format only promises flush-to-OS durability.
    pub durable_writes: bool,
}

impl Config {
    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if !self.auto_vacuum_threshold.is_finite()
            || self.auto_vacuum_threshold < 0.0
            || self.auto_vacuum_threshold > 1.0
        {
            return Err("auto_vacuum_threshold must be in [0.0, 1.0]".into());
        }
        Ok(())
    }

    /// Config with the auto-vacuum gate disabled.
    pub fn no_auto_vacuum() -> Self {
        Self { auto_vacuum_threshold: 1.0, ..Self::default() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_vacuum_threshold: 0.5,
            durable_writes: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::no_auto_vacuum().validate().is_ok());
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let mut config = Config::default();
        config.auto_vacuum_threshold = 1.5;
        assert!(config.validate().is_err());

        config.auto_vacuum_threshold = -0.1;
        assert!(config.validate().is_err());

        config.auto_vacuum_threshold = f64::NAN;
        assert!(config.validate().is_err());
    }
}
