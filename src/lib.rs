//! # deltadeploy - Incremental Application Deployment
//!
//! `deltadeploy` pushes a rebuilt application package to a device doing as
//! little work as possible:
//!
//! - **Archive indexing** straight from the central directory, no decompression
//! - **Content-addressed unit cache** so unchanged code is never re-split
//! - **Unit-level diffing** between the deployed and the new build
//! - **Live swap** of modified code into the running process when possible,
//!   full reinstall otherwise
//! - **Task graph** execution with fail-fast propagation and per-task metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use deltadeploy::{AdbChannel, DeployRequest, OrchestratorBuilder, Result};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let device = Arc::new(AdbChannel::local(5037, None));
//! let orchestrator = OrchestratorBuilder::new(device).build()?;
//!
//! let request = DeployRequest::new("com.example.app", vec!["app/build/base.apk".into()]);
//! let outcome = orchestrator.deploy(&request);
//! println!("{:?}", outcome.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Configuration
//!
//! ```rust,no_run
//! use deltadeploy::{AdbChannel, DeployConfig, OrchestratorBuilder, Result};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let config = DeployConfig::from_file("deltadeploy.toml")?;
//! let orchestrator = OrchestratorBuilder::new(Arc::new(AdbChannel::local(5037, None)))
//!     .config(config)
//!     .cache_dir("/tmp/deltadeploy-cache")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    archive::{ArchiveEntry, ArchiveIndex, EntryId, PackageArchive, SignatureBlock},
    cache::{CacheRecord, CacheStats, CacheStore, ContentCache, DiskStore, MemoryStore},
    config::DeployConfig,
    device::{AdbChannel, DeviceChannel, InstallResult, InstallStatus},
    error::{ArchiveError, CacheError, DeployError, DeviceError, RedefineError, Result},
    orchestrator::{
        DeployRequest, DeployState, DeployStatus, DeploymentOutcome, FailureReason,
        SwapOrchestrator,
    },
    plan::{AssumeCompatible, DeploymentPlan, Strategy, SwapCompatibility},
    redefine::{LiveRedefiner, RedefineResult, VmConnector, VmSession},
    tasks::{Task, TaskFailure, TaskMetric, TaskRunner, TaskState},
    units::{BundleSplitter, CachedSplitter, CodeUnit, UnitFilter, UnitSet, UnitSplitter},
};

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builder for a [`SwapOrchestrator`] wired from a [`DeployConfig`]
///
/// Picks the cache backend (on disk when a cache directory is configured
/// and usable, in memory otherwise), the container splitter, and an
/// optional live redefiner.
///
/// # Examples
///
/// ```rust,no_run
/// use deltadeploy::{AdbChannel, OrchestratorBuilder};
/// use std::sync::Arc;
///
/// # fn main() -> deltadeploy::Result<()> {
/// let orchestrator = OrchestratorBuilder::new(Arc::new(AdbChannel::local(5037, None)))
///     .workers(4)
///     .live_swap(false)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct OrchestratorBuilder {
    device: Arc<dyn DeviceChannel>,
    config: DeployConfig,
    cache: Option<ContentCache>,
    splitter: Option<Arc<dyn UnitSplitter>>,
    connector: Option<(Arc<dyn VmConnector>, Vec<u8>)>,
    compatibility: Option<Arc<dyn SwapCompatibility>>,
}

impl OrchestratorBuilder {
    pub fn new(device: Arc<dyn DeviceChannel>) -> Self {
        OrchestratorBuilder {
            device,
            config: DeployConfig::default(),
            cache: None,
            splitter: None,
            connector: None,
            compatibility: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: DeployConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn cache_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.cache_dir = Some(dir.into());
        self
    }

    pub fn live_swap(mut self, enabled: bool) -> Self {
        self.config.live_swap = enabled;
        self
    }

    /// Share an existing cache instead of opening one from the configuration
    pub fn cache(mut self, cache: ContentCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a custom container splitter
    pub fn splitter(mut self, splitter: Arc<dyn UnitSplitter>) -> Self {
        self.splitter = Some(splitter);
        self
    }

    /// Enable live swap through `connector`, guarded by the checksum of `agent`
    pub fn redefiner(mut self, connector: Arc<dyn VmConnector>, agent: &[u8]) -> Self {
        self.connector = Some((connector, agent.to_vec()));
        self
    }

    pub fn compatibility(mut self, compatibility: Arc<dyn SwapCompatibility>) -> Self {
        self.compatibility = Some(compatibility);
        self
    }

    pub fn build(self) -> Result<SwapOrchestrator> {
        self.config.validate()?;

        let cache = match (self.cache, &self.config.cache_dir) {
            (Some(cache), _) => cache,
            (None, Some(dir)) => match DiskStore::open(dir, self.config.cache_memory_entries) {
                Ok(store) => {
                    info!("Using unit cache at {:?}", dir);
                    ContentCache::new(Arc::new(store))
                }
                Err(e) => {
                    warn!("Unit cache at {:?} unavailable, using memory: {}", dir, e);
                    ContentCache::in_memory()
                }
            },
            (None, None) => {
                debug!("Using in-memory unit cache");
                ContentCache::in_memory()
            }
        };

        let splitter: Arc<dyn UnitSplitter> = match self.splitter {
            Some(splitter) => splitter,
            None => Arc::new(BundleSplitter::new(self.config.code_entry_suffix.clone())),
        };
        let splitter = Arc::new(CachedSplitter::new(cache, splitter));

        let mut orchestrator = match self.connector {
            Some((connector, agent)) => {
                let redefiner =
                    LiveRedefiner::new(connector, &agent, self.config.attach_timeout());
                SwapOrchestrator::new(self.config, self.device, splitter)
                    .with_redefiner(Arc::new(redefiner))
            }
            None => SwapOrchestrator::new(self.config, self.device, splitter),
        };
        if let Some(compatibility) = self.compatibility {
            orchestrator = orchestrator.with_compatibility(compatibility);
        }

        Ok(orchestrator)
    }
}
