use std::time::Duration;

use crate::{UploadError, UploadResult};

/// Configuration for chunked uploads
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Largest accepted chunk body (bytes)
    pub max_chunk_bytes: u64,

    /// Upper bound on `total_chunks` to protect memory/state
    pub max_total_chunks: u32,

    /// Absolute max declared size for a single upload (safety guard)
    pub max_upload_bytes: u64,

    /// Key prefix for staged chunks
    pub staging_prefix: String,

    /// Key prefix for assembled artifacts
    pub completed_prefix: String,

    /// Pending/uploading sessions idle longer than this are cancelled by the reaper
    pub stale_after: Duration,

    /// How often the reaper runs
    pub reaper_interval: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 1024 * 1024, // 1MB
            max_total_chunks: 10_000,
            max_upload_bytes: 5 * 1024 * 1024 * 1024, // 5GB
            staging_prefix: "uploads/chunks".to_string(),
            completed_prefix: "uploads/completed".to_string(),
            stale_after: Duration::from_secs(24 * 60 * 60),
            reaper_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from defaults overridden by `<PREFIX>__*` environment variables.
    ///
    /// `DOGUP__MAX_CHUNK_BYTES=2097152` sets `max_chunk_bytes` when called with `"DOGUP"`.
    pub fn from_env(prefix: &str) -> UploadResult<Self> {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Same as [`UploadConfig::from_env`] but over an explicit set of variables
    pub fn from_vars<I>(prefix: &str, vars: I) -> UploadResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();
        let prefix = format!("{}__", prefix);

        for (key, value) in vars {
            let Some(name) = key.strip_prefix(&prefix) else {
                continue;
            };
            match name {
                "MAX_CHUNK_BYTES" => config.max_chunk_bytes = parse(&key, &value)?,
                "MAX_TOTAL_CHUNKS" => config.max_total_chunks = parse(&key, &value)?,
                "MAX_UPLOAD_BYTES" => config.max_upload_bytes = parse(&key, &value)?,
                "STAGING_PREFIX" => config.staging_prefix = value,
                "COMPLETED_PREFIX" => config.completed_prefix = value,
                "STALE_AFTER_SECS" => {
                    config.stale_after = Duration::from_secs(parse(&key, &value)?)
                }
                "REAPER_INTERVAL_SECS" => {
                    config.reaper_interval = Duration::from_secs(parse(&key, &value)?)
                }
                _ => {}
            }
        }

        Ok(config)
    }

    /// Set max chunk size
    pub fn with_max_chunk_bytes(mut self, bytes: u64) -> Self {
        self.max_chunk_bytes = bytes;
        self
    }

    /// Set max number of chunks per upload
    pub fn with_max_total_chunks(mut self, max: u32) -> Self {
        self.max_total_chunks = max;
        self
    }

    /// Set max declared upload size
    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub fn with_staging_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.staging_prefix = prefix.into();
        self
    }

    pub fn with_completed_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.completed_prefix = prefix.into();
        self
    }

    /// Set the inactivity window after which abandoned sessions are reaped
    pub fn with_stale_after(mut self, window: Duration) -> Self {
        self.stale_after = window;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> UploadResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| UploadError::validation(format!("{} has invalid value '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_overrides_defaults() {
        let config = UploadConfig::from_vars(
            "DOGUP",
            vars(&[
                ("DOGUP__MAX_CHUNK_BYTES", "2048"),
                ("DOGUP__STAGING_PREFIX", "tmp/chunks"),
                ("DOGUP__STALE_AFTER_SECS", "60"),
                ("OTHER__MAX_CHUNK_BYTES", "1"),
            ]),
        )
        .unwrap();

        assert_eq!(config.max_chunk_bytes, 2048);
        assert_eq!(config.staging_prefix, "tmp/chunks");
        assert_eq!(config.stale_after, Duration::from_secs(60));
        assert_eq!(config.completed_prefix, "uploads/completed");
        assert_eq!(config.max_total_chunks, 10_000);
    }

    #[test]
    fn unparseable_value_is_rejected() {
        let err = UploadConfig::from_vars("DOGUP", vars(&[("DOGUP__MAX_TOTAL_CHUNKS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation { .. }));
    }
}
