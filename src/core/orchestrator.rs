//! Deployment orchestration
//!
//! One [`SwapOrchestrator::deploy`] call walks
//!
//! ```text
//! Indexed -> Diffed -> PlanSelected -> Executing -> Done | Failed
//! ```
//!
//! Indexing, splitting and every device operation run as tasks on a
//! per-attempt [`TaskRunner`], whose join marks the end of the attempt.
//! The last successfully applied snapshot of each package is remembered,
//! so a deployment without explicit previous archives diffs against it.

use crate::core::archive::{ArchiveIndex, PackageArchive};
use crate::core::config::DeployConfig;
use crate::core::device::{shell_quote, DeviceChannel, InstallStatus};
use crate::core::error::{ArchiveError, DeployError, DeviceError};
use crate::core::plan::{
    diff_resources, select_strategy, AssumeCompatible, DeploymentPlan, ResourceKey, Strategy,
    SwapCompatibility,
};
use crate::core::redefine::LiveRedefiner;
use crate::core::tasks::{Task, TaskFailure, TaskMetric, TaskRunner};
use crate::core::units::{CachedSplitter, CodeUnit, UnitSet};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

/// Stage of one deployment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    Indexed,
    Diffed,
    PlanSelected,
    Executing,
    Done,
    Failed,
}

/// Why an attempt failed
#[derive(Debug, Clone, Serialize)]
pub struct FailureReason {
    /// Task (or stage) that failed
    pub operation: String,
    pub message: String,
    /// Package-manager classification, when there is one
    pub install_status: Option<InstallStatus>,
    #[serde(skip)]
    pub cause: Arc<DeployError>,
}

impl From<TaskFailure> for FailureReason {
    fn from(failure: TaskFailure) -> Self {
        let install_status = match failure.cause.as_ref() {
            DeployError::Install { status, .. } => Some(*status),
            DeployError::Device(DeviceError::Timeout(_)) => Some(InstallStatus::DeviceNotResponding),
            DeployError::Device(DeviceError::NotFound(_)) => Some(InstallStatus::DeviceNotFound),
            _ => None,
        };
        FailureReason {
            operation: failure.task,
            message: failure.cause.to_string(),
            install_status,
            cause: failure.cause,
        }
    }
}

/// Terminal result of an attempt
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeployStatus {
    Installed,
    Swapped { units: Vec<String> },
    /// Nothing changed; the device was not touched
    Skipped,
    Failed(FailureReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentOutcome {
    pub package_id: String,
    #[serde(flatten)]
    pub status: DeployStatus,
    pub strategy: Option<Strategy>,
    pub plan: Option<DeploymentPlan>,
    /// States entered, in order
    pub states: Vec<DeployState>,
    pub metrics: Vec<TaskMetric>,
    pub elapsed: Duration,
}

impl DeploymentOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, DeployStatus::Failed(_))
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.status {
            DeployStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// What to deploy
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub package_id: String,
    /// Base archive first, then additional archives
    pub archives: Vec<PathBuf>,
    /// Archives currently on the device; the remembered snapshot when unset
    pub previous: Option<Vec<PathBuf>>,
    /// Debugger endpoint for live swap; the package id when unset
    pub endpoint: Option<String>,
}

impl DeployRequest {
    pub fn new(package_id: impl Into<String>, archives: Vec<PathBuf>) -> Self {
        DeployRequest {
            package_id: package_id.into(),
            archives,
            previous: None,
            endpoint: None,
        }
    }

    pub fn with_previous(mut self, previous: Vec<PathBuf>) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Split result of one code container
struct Container {
    archive: usize,
    entry: String,
    units: Vec<CodeUnit>,
}

/// Comparable view of one set of archives
struct Snapshot {
    digests: Vec<String>,
    units: UnitSet,
    /// Unit name to (archive position, container entry)
    locations: HashMap<String, (usize, String)>,
    resources: BTreeMap<ResourceKey, u32>,
}

impl Snapshot {
    fn assemble(
        digests: Vec<String>,
        resources: BTreeMap<ResourceKey, u32>,
        containers: &[Arc<Container>],
    ) -> Self {
        let mut units = UnitSet::new();
        let mut locations = HashMap::new();
        for container in containers {
            for unit in &container.units {
                if units.contains_key(&unit.name) {
                    warn!(
                        "Unit {} appears in more than one container; keeping the first",
                        unit.name
                    );
                    continue;
                }
                locations.insert(
                    unit.name.clone(),
                    (container.archive, container.entry.clone()),
                );
                units.insert(unit.name.clone(), unit.clone());
            }
        }
        Snapshot {
            digests,
            units,
            locations,
            resources,
        }
    }
}

/// Per-attempt bookkeeping
struct Attempt<'a> {
    package_id: &'a str,
    states: Vec<DeployState>,
    plan: Option<DeploymentPlan>,
    strategy: Option<Strategy>,
}

impl Attempt<'_> {
    fn enter(&mut self, state: DeployState) {
        debug!("{}: {:?}", self.package_id, state);
        self.states.push(state);
    }
}

pub struct SwapOrchestrator {
    config: DeployConfig,
    device: Arc<dyn DeviceChannel>,
    splitter: Arc<CachedSplitter>,
    redefiner: Option<Arc<LiveRedefiner>>,
    compatibility: Arc<dyn SwapCompatibility>,
    deployed: Mutex<HashMap<String, Arc<Snapshot>>>,
}

impl SwapOrchestrator {
    /// Orchestrator without live swap until a redefiner is attached
    pub fn new(
        config: DeployConfig,
        device: Arc<dyn DeviceChannel>,
        splitter: Arc<CachedSplitter>,
    ) -> Self {
        SwapOrchestrator {
            config,
            device,
            splitter,
            redefiner: None,
            compatibility: Arc::new(AssumeCompatible),
            deployed: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_redefiner(mut self, redefiner: Arc<LiveRedefiner>) -> Self {
        self.redefiner = Some(redefiner);
        self
    }

    pub fn with_compatibility(mut self, compatibility: Arc<dyn SwapCompatibility>) -> Self {
        self.compatibility = compatibility;
        self
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn splitter(&self) -> &CachedSplitter {
        &self.splitter
    }

    /// Forget the remembered snapshot of `package_id`
    pub fn forget(&self, package_id: &str) {
        self.deployed.lock().remove(package_id);
    }

    /// Run one deployment attempt to completion
    pub fn deploy(&self, request: &DeployRequest) -> DeploymentOutcome {
        let _span = info_span!("deploy", package = %request.package_id).entered();
        let started = Instant::now();
        let mut attempt = Attempt {
            package_id: &request.package_id,
            states: Vec::new(),
            plan: None,
            strategy: None,
        };

        let (result, metrics) = match TaskRunner::new(self.config.workers) {
            Ok(runner) => {
                let result = self.run(&runner, request, &mut attempt);
                runner.join();
                (result, runner.metrics())
            }
            Err(e) => (Err(stage_failure("deploy", e)), Vec::new()),
        };

        let status = match result {
            Ok(status) => {
                attempt.enter(DeployState::Done);
                status
            }
            Err(failure) => {
                warn!("Deployment of {} failed: {}", request.package_id, failure);
                attempt.enter(DeployState::Failed);
                DeployStatus::Failed(FailureReason::from(failure))
            }
        };

        let elapsed = started.elapsed();
        info!(
            "Deployment of {} finished in {:?}: {}",
            request.package_id,
            elapsed,
            status_label(&status)
        );

        DeploymentOutcome {
            package_id: request.package_id.clone(),
            status,
            strategy: attempt.strategy,
            plan: attempt.plan,
            states: attempt.states,
            metrics,
            elapsed,
        }
    }

    fn run(
        &self,
        runner: &TaskRunner,
        request: &DeployRequest,
        attempt: &mut Attempt<'_>,
    ) -> Result<DeployStatus, TaskFailure> {
        if request.archives.is_empty() {
            return Err(stage_failure(
                "deploy",
                DeployError::Config("no archives to deploy".to_string()),
            ));
        }

        let new_archives = index_all(runner, "new", &request.archives);
        let old_archives = request
            .previous
            .as_ref()
            .map(|paths| index_all(runner, "old", paths));

        let new_archives = new_archives.get()?;
        let old_archives = old_archives.map(|task| task.get()).transpose()?;
        attempt.enter(DeployState::Indexed);

        let new_digests = digests(&new_archives);
        let old_digests = match &old_archives {
            Some(archives) => Some(digests(archives)),
            None => self
                .deployed
                .lock()
                .get(&request.package_id)
                .map(|snapshot| snapshot.digests.clone()),
        };
        if old_digests.as_ref() == Some(&new_digests) {
            info!("{} is unchanged", request.package_id);
            return Ok(DeployStatus::Skipped);
        }

        let new_snapshot = self.snapshot(runner, "new", &new_archives);
        let old_snapshot = old_archives
            .as_ref()
            .map(|archives| self.snapshot(runner, "old", archives));

        let new_snapshot = new_snapshot.get()?;
        let old_snapshot = match old_snapshot {
            Some(task) => Some(task.get()?),
            None => self.deployed.lock().get(&request.package_id).cloned(),
        };
        attempt.enter(DeployState::Diffed);

        let strategy = match &old_snapshot {
            None => {
                info!("No previous snapshot of {}", request.package_id);
                Strategy::Reinstall
            }
            Some(old) => {
                let plan = DeploymentPlan::diff(&old.units, &new_snapshot.units);
                let resources = diff_resources(&old.resources, &new_snapshot.resources);
                debug!(
                    "Plan: {} unchanged, {} modified, {} added, {} removed, {} resources",
                    plan.unchanged.len(),
                    plan.modified.len(),
                    plan.added.len(),
                    plan.removed.len(),
                    resources.len()
                );

                if plan.is_empty() && resources.is_empty() {
                    attempt.plan = Some(plan);
                    self.remember(&request.package_id, new_snapshot);
                    return Ok(DeployStatus::Skipped);
                }

                let strategy = select_strategy(
                    &plan,
                    &old.units,
                    &new_snapshot.units,
                    &resources,
                    self.compatibility.as_ref(),
                    self.config.live_swap && self.redefiner.is_some(),
                );
                attempt.plan = Some(plan);
                strategy
            }
        };
        attempt.strategy = Some(strategy);
        attempt.enter(DeployState::PlanSelected);
        info!("Deploying {} by {:?}", request.package_id, strategy);

        attempt.enter(DeployState::Executing);
        let status = match (strategy, &attempt.plan, &self.redefiner) {
            (Strategy::LiveSwap, Some(plan), Some(redefiner)) => self.live_swap(
                runner,
                request,
                &new_archives,
                &new_snapshot,
                plan,
                redefiner.clone(),
            )?,
            _ => self.reinstall(runner, request, &new_archives)?,
        };

        self.remember(&request.package_id, new_snapshot);
        Ok(status)
    }

    /// Split every code container and collect the rest as resources
    fn snapshot(
        &self,
        runner: &TaskRunner,
        side: &str,
        archives: &[Arc<PackageArchive>],
    ) -> Task<Snapshot> {
        let mut containers = Vec::new();
        let mut resources = BTreeMap::new();

        for (position, archive) in archives.iter().enumerate() {
            for entry in archive.entries() {
                if !self.splitter.accepts(entry) {
                    resources.insert((position, entry.name.clone()), entry.crc32);
                    continue;
                }

                let splitter = self.splitter.clone();
                let archive = archive.clone();
                let entry = entry.clone();
                containers.push(runner.submit(
                    &format!("split {} {}", side, entry.name),
                    move || {
                        let units = splitter.split(&archive, &entry, None)?;
                        Ok(Container {
                            archive: position,
                            entry: entry.name,
                            units,
                        })
                    },
                ));
            }
        }

        let digests = digests(archives);
        runner.submit_all(&format!("snapshot {}", side), &containers, move |containers| {
            Ok(Snapshot::assemble(digests, resources, containers))
        })
    }

    fn reinstall(
        &self,
        runner: &TaskRunner,
        request: &DeployRequest,
        archives: &[Arc<PackageArchive>],
    ) -> Result<DeployStatus, TaskFailure> {
        let staging = self.staging_dir(&request.package_id);
        let mut remotes = Vec::with_capacity(archives.len());
        let mut pushes: Vec<Task<()>> = Vec::new();
        let mut previous: Task<()> = self.prepare_staging(runner, &staging);

        for archive in archives {
            let remote = format!("{}/{}", staging, archive.file_name());
            remotes.push(remote.clone());

            // Pushes share the device link: each waits for the one before
            let input = runner.block_on(&runner.value(archive.clone()), &previous);
            let device = self.device.clone();
            let push = runner.submit1(
                &format!("push {}", remote),
                &input,
                move |archive: &Arc<PackageArchive>| {
                    device.push(archive.bytes(), &remote)?;
                    Ok(())
                },
            );
            previous = push.clone();
            pushes.push(push);
        }

        let mut options = self.config.install_options.clone();
        if !options.iter().any(|o| o == "-r") {
            options.push("-r".to_string());
        }
        let device = self.device.clone();
        let install = runner.submit_all("install", &pushes, move |_| {
            let result = device.install(&remotes, &options)?;
            if result.status != InstallStatus::Ok {
                return Err(DeployError::Install {
                    status: result.status,
                    message: result.message,
                });
            }
            Ok(result)
        });

        install.get()?;
        Ok(DeployStatus::Installed)
    }

    fn live_swap(
        &self,
        runner: &TaskRunner,
        request: &DeployRequest,
        archives: &[Arc<PackageArchive>],
        snapshot: &Snapshot,
        plan: &DeploymentPlan,
        redefiner: Arc<LiveRedefiner>,
    ) -> Result<DeployStatus, TaskFailure> {
        let staging = self.staging_dir(&request.package_id);
        let containers: BTreeSet<(usize, String)> = plan
            .modified
            .iter()
            .filter_map(|name| snapshot.locations.get(name).cloned())
            .collect();

        let mut pushes: Vec<Task<()>> = Vec::new();
        let mut previous: Task<()> = self.prepare_staging(runner, &staging);

        for (position, entry_name) in containers {
            let archive = archives[position].clone();
            let remote = format!(
                "{}/{}-{}",
                staging,
                position,
                entry_name.replace('/', "_")
            );
            let input = runner.block_on(&runner.value(archive), &previous);
            let device = self.device.clone();
            let push = runner.submit1(
                &format!("push {}", remote),
                &input,
                move |archive: &Arc<PackageArchive>| {
                    let entry = archive
                        .entry(&entry_name)
                        .ok_or_else(|| ArchiveError::EntryNotFound(entry_name.clone()))?;
                    let bytes = archive.read_entry(entry)?;
                    device.push(&bytes, &remote)?;
                    Ok(())
                },
            );
            previous = push.clone();
            pushes.push(push);
        }

        let units: Vec<CodeUnit> = plan
            .modified
            .iter()
            .filter_map(|name| snapshot.units.get(name).cloned())
            .collect();
        let endpoint = request
            .endpoint
            .clone()
            .unwrap_or_else(|| request.package_id.clone());
        let redefine = runner.submit_all("redefine", &pushes, move |_| {
            Ok(redefiner.redefine(&endpoint, &units)?)
        });

        let result = redefine.get()?;
        Ok(DeployStatus::Swapped {
            units: result.units.clone(),
        })
    }

    fn prepare_staging(&self, runner: &TaskRunner, staging: &str) -> Task<()> {
        let device = self.device.clone();
        let command = format!("mkdir -p {}", shell_quote(staging));
        runner.submit("prepare staging", move || {
            device.shell(&command, None)?;
            Ok(())
        })
    }

    fn staging_dir(&self, package_id: &str) -> String {
        format!(
            "{}/{}",
            self.config.staging_dir.trim_end_matches('/'),
            package_id
        )
    }

    fn remember(&self, package_id: &str, snapshot: Arc<Snapshot>) {
        self.deployed.lock().insert(package_id.to_string(), snapshot);
    }
}

fn index_all(runner: &TaskRunner, side: &str, paths: &[PathBuf]) -> Task<Vec<Arc<PackageArchive>>> {
    let tasks: Vec<Task<PackageArchive>> = paths
        .iter()
        .map(|path| {
            let path = path.clone();
            runner.submit(&format!("index {} {}", side, path.display()), move || {
                Ok(ArchiveIndex::index(&path)?)
            })
        })
        .collect();
    runner.submit_all(&format!("index {}", side), &tasks, |archives| {
        Ok(archives.to_vec())
    })
}

fn digests(archives: &[Arc<PackageArchive>]) -> Vec<String> {
    archives.iter().map(|a| a.digest().to_string()).collect()
}

fn stage_failure(stage: &str, cause: DeployError) -> TaskFailure {
    TaskFailure {
        task: stage.to_string(),
        cause: Arc::new(cause),
    }
}

fn status_label(status: &DeployStatus) -> &'static str {
    match status {
        DeployStatus::Installed => "installed",
        DeployStatus::Swapped { .. } => "swapped",
        DeployStatus::Skipped => "skipped",
        DeployStatus::Failed(_) => "failed",
    }
}
