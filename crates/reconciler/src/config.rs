//! Configuration for the reconciler.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pipeline::ANALYZER_IMAGE_NAME;

/// Configuration for the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Deadline shared by every store call made during one reconcile.
    #[serde(with = "duration_secs", default = "default_call_timeout")]
    pub call_timeout: Duration,

    /// Job spec settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Default references for logical image names, used when the override
    /// variable is not set.
    #[serde(default)]
    pub images: BTreeMap<String, String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            call_timeout: default_call_timeout(),
            pipeline: PipelineConfig::default(),
            images: BTreeMap::new(),
        }
    }
}

/// Settings for the generated scan job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Image providing the SBOM scanner.
    #[serde(default = "default_scanner_image")]
    pub scanner_image: String,

    /// Memory request and limit of the scan step.
    #[serde(default = "default_scan_memory")]
    pub scan_memory: String,

    /// Memory request and limit of the analyze step.
    #[serde(default = "default_analyze_memory")]
    pub analyze_memory: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scanner_image: default_scanner_image(),
            scan_memory: default_scan_memory(),
            analyze_memory: default_analyze_memory(),
        }
    }
}

impl ReconcilerConfig {
    /// Set the per-reconcile deadline.
    #[must_use]
    pub const fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Register a default reference for a logical image name.
    #[must_use]
    pub fn image(mut self, logical_name: impl Into<String>, reference: impl Into<String>) -> Self {
        self.images.insert(logical_name.into(), reference.into());
        self
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = lookup("JVMSCAN_CALL_TIMEOUT_SECS") {
            let secs = secs.trim().parse::<u64>().map_err(|e| {
                Error::invalid_config(format!("JVMSCAN_CALL_TIMEOUT_SECS '{secs}': {e}"))
            })?;
            config.call_timeout = Duration::from_secs(secs);
        }

        if let Some(image) = lookup("JVMSCAN_SCANNER_IMAGE") {
            config.pipeline.scanner_image = image;
        }

        if let Some(memory) = lookup("JVMSCAN_SCAN_MEMORY") {
            config.pipeline.scan_memory = memory;
        }

        if let Some(memory) = lookup("JVMSCAN_ANALYZE_MEMORY") {
            config.pipeline.analyze_memory = memory;
        }

        if let Some(image) = lookup("JVMSCAN_ANALYZER_IMAGE") {
            config.images.insert(ANALYZER_IMAGE_NAME.to_string(), image);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("failed to read {}: {e}", path.display()))
        })?;

        // JSON by extension, TOML otherwise
        let config: Self = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)
                .map_err(|e| Error::invalid_config(format!("failed to parse config: {e}")))?
        } else {
            toml::from_str(&content)
                .map_err(|e| Error::invalid_config(format!("failed to parse config: {e}")))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the reconciler cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout.is_zero() {
            return Err(Error::invalid_config("call_timeout must be greater than zero"));
        }
        if self.call_timeout > MAX_CALL_TIMEOUT {
            return Err(Error::invalid_config(format!(
                "call_timeout must be at most {}s",
                MAX_CALL_TIMEOUT.as_secs()
            )));
        }
        let required = [
            ("pipeline.scanner_image", &self.pipeline.scanner_image),
            ("pipeline.scan_memory", &self.pipeline.scan_memory),
            ("pipeline.analyze_memory", &self.pipeline.analyze_memory),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(Error::invalid_config(format!("{field} must not be empty")));
        }
        Ok(())
    }
}

/// Upper bound on the per-reconcile deadline.
pub const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

const fn default_call_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_scanner_image() -> String {
    "quay.io/redhat-appstudio/syft:v0.95.0".to_string()
}

fn default_scan_memory() -> String {
    "1024Mi".to_string()
}

fn default_analyze_memory() -> String {
    "512Mi".to_string()
}

/// Serialization helper for Duration as seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
