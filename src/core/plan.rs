//! Deployment planning
//!
//! A [`DeploymentPlan`] is the unit-level diff between two snapshots.
//! [`select_strategy`] turns it into a [`Strategy`], falling back to a full
//! reinstall whenever something cannot be applied to a running process.

use crate::core::units::{CodeUnit, UnitSet};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Unit-level diff between an old and a new snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentPlan {
    pub unchanged: BTreeSet<String>,
    /// Present in both snapshots with different checksums
    pub modified: BTreeSet<String>,
    /// Only in the new snapshot
    pub added: BTreeSet<String>,
    /// Only in the old snapshot
    pub removed: BTreeSet<String>,
}

impl DeploymentPlan {
    pub fn diff(old: &UnitSet, new: &UnitSet) -> Self {
        let mut plan = DeploymentPlan::default();

        for (name, unit) in new {
            match old.get(name) {
                Some(previous) if previous.checksum == unit.checksum => {
                    plan.unchanged.insert(name.clone());
                }
                Some(_) => {
                    plan.modified.insert(name.clone());
                }
                None => {
                    plan.added.insert(name.clone());
                }
            }
        }
        for name in old.keys() {
            if !new.contains_key(name) {
                plan.removed.insert(name.clone());
            }
        }

        plan
    }

    /// Nothing modified, added or removed
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    /// Only modifications, which a running process may accept
    pub fn is_swap_eligible(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// How a plan is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Push the archives and install them through the package manager
    Reinstall,
    /// Push the modified containers and redefine units in the running process
    LiveSwap,
}

/// Decides whether a modified unit can replace its previous version in a
/// running process
pub trait SwapCompatibility: Send + Sync {
    fn is_swap_compatible(&self, old: &CodeUnit, new: &CodeUnit) -> bool;
}

/// Treats every modification as compatible, leaving rejection to the target
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeCompatible;

impl SwapCompatibility for AssumeCompatible {
    fn is_swap_compatible(&self, _old: &CodeUnit, _new: &CodeUnit) -> bool {
        true
    }
}

/// Identity of a non-code entry: archive position and entry name
pub type ResourceKey = (usize, String);

/// Names of non-code entries that changed, appeared or disappeared, keyed
/// by CRC-32
pub fn diff_resources(
    old: &BTreeMap<ResourceKey, u32>,
    new: &BTreeMap<ResourceKey, u32>,
) -> BTreeSet<ResourceKey> {
    let mut changed: BTreeSet<ResourceKey> = new
        .iter()
        .filter(|(key, crc)| old.get(*key) != Some(*crc))
        .map(|(key, _)| key.clone())
        .collect();
    changed.extend(old.keys().filter(|key| !new.contains_key(*key)).cloned());
    changed
}

/// Choose a strategy for a non-empty plan
pub fn select_strategy(
    plan: &DeploymentPlan,
    old: &UnitSet,
    new: &UnitSet,
    resources: &BTreeSet<ResourceKey>,
    compatibility: &dyn SwapCompatibility,
    live_swap: bool,
) -> Strategy {
    if !live_swap {
        debug!("Live swap disabled");
        return Strategy::Reinstall;
    }
    if !plan.is_swap_eligible() {
        debug!(
            "{} units added, {} removed",
            plan.added.len(),
            plan.removed.len()
        );
        return Strategy::Reinstall;
    }
    if !resources.is_empty() {
        debug!("{} non-code entries changed", resources.len());
        return Strategy::Reinstall;
    }
    if plan.modified.is_empty() {
        return Strategy::Reinstall;
    }

    let incompatible = plan.modified.iter().find(|name| {
        match (old.get(name.as_str()), new.get(name.as_str())) {
            (Some(before), Some(after)) => !compatibility.is_swap_compatible(before, after),
            _ => true,
        }
    });
    if let Some(name) = incompatible {
        debug!("Unit {} is not swap-compatible", name);
        return Strategy::Reinstall;
    }

    Strategy::LiveSwap
}
