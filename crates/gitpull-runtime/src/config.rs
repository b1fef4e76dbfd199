//! Runtime configuration.
//!
//! # Load Order
//!
//! 1. Default values
//! 2. TOML file (optional)
//! 3. Environment variables (`GITPULL_DATABASE_URL`, `GITPULL_DATABASE_SCHEMA`)
//!
//! Each layer overrides the previous.
//!
//! ```toml
//! [resolver]
//! max_attempts = 10
//! scope_bootstrap_to_lineage = true
//!
//! [coordinator]
//! processing_timeout_secs = 600
//!
//! [sweeper]
//! stale_after_secs = 1800
//! batch_size = 100
//!
//! [database]
//! url = "postgres://localhost/gitpull"
//! schema = "public"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PullEventError;
use crate::events::{CoordinatorConfig, ResolverConfig, SweepConfig};

/// Schema names are interpolated into SQL, so only `[A-Za-z0-9_]+` passes.
pub(crate) fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub const ENV_DATABASE_URL: &str = "GITPULL_DATABASE_URL";
pub const ENV_DATABASE_SCHEMA: &str = "GITPULL_DATABASE_SCHEMA";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub schema: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            schema: "public".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullEventsConfig {
    pub resolver: ResolverConfig,
    pub coordinator: CoordinatorConfig,
    pub sweeper: SweepConfig,
    pub database: DatabaseConfig,
}

impl PullEventsConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, PullEventError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| PullEventError::Config(format!("parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` and applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PullEventError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PullEventError::Config(format!("read {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for deployments without a file.
    pub fn from_env() -> Result<Self, PullEventError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies overrides from `lookup`; taking a lookup keeps tests off the
    /// process environment.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), PullEventError> {
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database.url = Some(url);
        }
        if let Some(schema) = lookup(ENV_DATABASE_SCHEMA) {
            self.database.schema = schema;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), PullEventError> {
        if self.resolver.max_attempts == 0 {
            return Err(PullEventError::Config(
                "resolver.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.sweeper.batch_size == 0 {
            return Err(PullEventError::Config(
                "sweeper.batch_size must be at least 1".to_string(),
            ));
        }
        if self.coordinator.processing_timeout_secs == Some(0) {
            return Err(PullEventError::Config(
                "coordinator.processing_timeout_secs must be positive".to_string(),
            ));
        }
        if !is_valid_schema_ident(&self.database.schema) {
            return Err(PullEventError::Config(format!(
                "database.schema is not a plain identifier: {:?}",
                self.database.schema
            )));
        }
        Ok(())
    }
}
