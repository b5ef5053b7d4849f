//! Configuration types for placement and migration.

use crate::error::{Error, Result};
use crate::types::{DataTier, DiskId, NodeId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for one storage node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Local disks: id -> (tier, mount directory).
    pub disks: BTreeMap<DiskId, DiskConfig>,

    /// Migration configuration.
    pub migration: MigrationConfig,

    /// Placement record configuration.
    pub placement: PlacementConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            disks: BTreeMap::new(),
            migration: MigrationConfig::default(),
            placement: PlacementConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a new configuration for the given node.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Add a local disk.
    pub fn with_disk(mut self, id: DiskId, tier: DataTier, path: impl Into<PathBuf>) -> Self {
        self.disks.insert(
            id,
            DiskConfig {
                tier,
                path: path.into(),
            },
        );
        self
    }

    /// Set migration configuration.
    pub fn with_migration_config(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    /// Set placement configuration.
    pub fn with_placement_config(mut self, placement: PlacementConfig) -> Self {
        self.placement = placement;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.disks.is_empty() {
            return Err(Error::Config("at least one disk is required".into()));
        }
        self.migration.validate()?;
        self.placement.validate()
    }
}

/// One local disk.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Storage tier.
    pub tier: DataTier,
    /// Mount directory holding the placement record.
    pub path: PathBuf,
}

/// Migration tuning.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Shards migrated concurrently.
    pub parallelism: usize,

    /// Objects per delta set sent by a client.
    pub max_delta_set_size: usize,

    /// Interval of the timer that retries shards whose source was not ready.
    pub retry_interval: Duration,

    /// Node-wide migration timeout; the migration aborts when it fires.
    pub migration_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            parallelism: 16,
            max_delta_set_size: 16,
            retry_interval: Duration::from_secs(2),
            migration_timeout: Duration::from_secs(300),
        }
    }
}

impl MigrationConfig {
    /// Set the number of shards migrated concurrently.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the delta set batch size.
    pub fn with_max_delta_set_size(mut self, size: usize) -> Self {
        self.max_delta_set_size = size;
        self
    }

    /// Set the retry timer interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the node-wide migration timeout.
    pub fn with_migration_timeout(mut self, timeout: Duration) -> Self {
        self.migration_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::Config("parallelism must be at least 1".into()));
        }
        if self.max_delta_set_size == 0 {
            return Err(Error::Config("max_delta_set_size must be at least 1".into()));
        }
        if self.retry_interval.is_zero() {
            return Err(Error::Config("retry_interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Placement record settings.
#[derive(Debug, Clone)]
pub struct PlacementConfig {
    /// File name of the record inside each disk directory.
    pub record_file_name: String,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            record_file_name: "SmSuperblock".to_string(),
        }
    }
}

impl PlacementConfig {
    /// Set the record file name.
    pub fn with_record_file_name(mut self, name: impl Into<String>) -> Self {
        self.record_file_name = name.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.record_file_name.is_empty() || self.record_file_name.contains('/') {
            return Err(Error::Config(format!(
                "invalid record file name {:?}",
                self.record_file_name
            )));
        }
        Ok(())
    }
}
