//! Resolution of logical image names to concrete references.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Resolves a logical tool image name to an image reference.
#[async_trait]
pub trait ImageNameResolver: Send + Sync {
    /// Resolve `logical_name`, honouring the `env_override` variable first.
    async fn resolve(&self, logical_name: &str, env_override: &str) -> Result<String>;
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolver backed by environment variables and configured defaults.
#[derive(Clone)]
pub struct EnvImageResolver {
    defaults: BTreeMap<String, String>,
    lookup: EnvLookup,
}

impl EnvImageResolver {
    /// Create a resolver that reads the process environment.
    pub fn new(defaults: BTreeMap<String, String>) -> Self {
        Self::with_lookup(defaults, |name| std::env::var(name).ok())
    }

    /// Create a resolver with a custom variable lookup.
    pub fn with_lookup<F>(defaults: BTreeMap<String, String>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            defaults,
            lookup: Arc::new(lookup),
        }
    }
}

impl std::fmt::Debug for EnvImageResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvImageResolver")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ImageNameResolver for EnvImageResolver {
    async fn resolve(&self, logical_name: &str, env_override: &str) -> Result<String> {
        if let Some(image) = (self.lookup)(env_override).filter(|v| !v.trim().is_empty()) {
            tracing::debug!(name = logical_name, env = env_override, "Image overridden");
            return Ok(image);
        }

        self.defaults
            .get(logical_name)
            .cloned()
            .ok_or_else(|| Error::image_not_resolved(logical_name, env_override))
    }
}
