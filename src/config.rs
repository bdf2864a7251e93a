//! Index configuration
//!
//! Defaults follow the metadata engine's historical tuning: a 4096-bucket
//! first level, promotion of a bucket once its chain reaches 16 nodes, and
//! 16-bucket second-level tables that double at a 1.5 load factor.
//!
//! Configuration can be built in code, parsed from TOML, or loaded from a file
//! with `DIRINDEX__*` environment overrides:
//!
//! ```toml
//! region_size = 268435456
//! first_level_capacity = 4096
//! flush_mode = "fence"
//! ```

use crate::error::{Error, Result};
use crate::storage::{FlushMode, SLAB_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment prefix for overrides, e.g. `DIRINDEX__REGION_SIZE`
pub const ENV_PREFIX: &str = "DIRINDEX";

/// Smallest region accepted by `validate`
pub const MIN_REGION_SIZE: u64 = 64 * 1024;

/// Tunables of one directory index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Size of the backing region in bytes (used when creating it)
    pub region_size: u64,
    /// Buckets in the first-level table. Fixed for the life of the region.
    pub first_level_capacity: u64,
    /// Chain length (in nodes) at which a first-level bucket is promoted
    pub promotion_threshold: u32,
    /// Buckets in a freshly promoted second-level table
    pub second_level_initial_capacity: u64,
    /// Second-level tables double once live nodes reach capacity × this factor
    pub resize_load_factor: f64,
    /// Threads in the background promotion/resize pool
    pub background_threads: usize,
    /// How flushes reach the persistence domain
    pub flush_mode: FlushMode,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            region_size: 256 * 1024 * 1024,
            first_level_capacity: 4096,
            promotion_threshold: 16,
            second_level_initial_capacity: 16,
            resize_load_factor: 1.5,
            background_threads: 2,
            flush_mode: FlushMode::Msync,
        }
    }
}

impl IndexConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply `DIRINDEX__*` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = config::Config::builder()
            .add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Toml,
            ))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                Error::Config(format!("Failed to load {}: {}", path.display(), e))
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the index cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.region_size < MIN_REGION_SIZE {
            return Err(Error::Config(format!(
                "region_size {} is below the minimum of {}",
                self.region_size, MIN_REGION_SIZE
            )));
        }
        if self.region_size % SLAB_SIZE as u64 != 0 {
            return Err(Error::Config(format!(
                "region_size {} is not a multiple of the {}-byte slab",
                self.region_size, SLAB_SIZE
            )));
        }
        if self.first_level_capacity == 0 || self.second_level_initial_capacity == 0 {
            return Err(Error::Config("table capacities must be at least 1".to_string()));
        }
        // The first-level bucket array must leave room for nodes.
        if self.first_level_capacity.saturating_mul(16) >= self.region_size / 2 {
            return Err(Error::Config(format!(
                "first_level_capacity {} does not fit a {}-byte region",
                self.first_level_capacity, self.region_size
            )));
        }
        if self.promotion_threshold == 0 {
            return Err(Error::Config("promotion_threshold must be at least 1".to_string()));
        }
        if !self.resize_load_factor.is_finite() || self.resize_load_factor <= 0.0 {
            return Err(Error::Config(format!(
                "resize_load_factor {} must be a positive number",
                self.resize_load_factor
            )));
        }
        if self.background_threads == 0 {
            return Err(Error::Config("background_threads must be at least 1".to_string()));
        }
        Ok(())
    }
}
