//! Assignment Constraints
//!
//! Domains group consumers that may share colors. CPU constraints bind
//! executors to the cores whose system page colors they may reserve.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::consumer::ConsumerId;
use crate::hardware::CpuCore;

// =============================================================================
// Domains
// =============================================================================

/// Consumers allowed to share colors, isolated from every other domain.
///
/// Every consumer of a system must be in exactly one isolation domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheIsolationDomain {
    members: BTreeSet<ConsumerId>,
}

impl CacheIsolationDomain {
    pub fn new(members: impl IntoIterator<Item = ConsumerId>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    pub fn members(&self) -> &BTreeSet<ConsumerId> {
        &self.members
    }

    pub fn contains(&self, consumer: ConsumerId) -> bool {
        self.members.contains(&consumer)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl FromIterator<ConsumerId> for CacheIsolationDomain {
    fn from_iter<I: IntoIterator<Item = ConsumerId>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Consumers coalesced onto one color; membership is not checked for
/// exclusivity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterferenceDomain {
    members: BTreeSet<ConsumerId>,
}

impl InterferenceDomain {
    pub fn new(members: impl IntoIterator<Item = ConsumerId>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    pub fn members(&self) -> &BTreeSet<ConsumerId> {
        &self.members
    }
}

impl FromIterator<ConsumerId> for InterferenceDomain {
    fn from_iter<I: IntoIterator<Item = ConsumerId>>(iter: I) -> Self {
        Self::new(iter)
    }
}

// =============================================================================
// CPU Constraints
// =============================================================================

/// Executor -> cores it may run on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorCpuConstraints {
    affinity: BTreeMap<ConsumerId, BTreeSet<CpuCore>>,
}

impl ExecutorCpuConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `executor` on `cpus`, extending any earlier constraint
    pub fn allow(&mut self, executor: ConsumerId, cpus: impl IntoIterator<Item = CpuCore>) -> &mut Self {
        self.affinity.entry(executor).or_default().extend(cpus);
        self
    }

    pub fn cpus_of(&self, executor: ConsumerId) -> Option<&BTreeSet<CpuCore>> {
        self.affinity.get(&executor)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConsumerId, &BTreeSet<CpuCore>)> {
        self.affinity.iter().map(|(e, cpus)| (*e, cpus))
    }

    pub fn is_empty(&self) -> bool {
        self.affinity.is_empty()
    }
}

/// Core -> executors with exclusive access to it.
///
/// Accepted and checked for consistency with [`ExecutorCpuConstraints`]; it
/// does not yet restrict which colors are chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuAccessConstraints {
    access: BTreeMap<CpuCore, BTreeSet<ConsumerId>>,
}

impl CpuAccessConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, cpu: CpuCore, executors: impl IntoIterator<Item = ConsumerId>) -> &mut Self {
        self.access.entry(cpu).or_default().extend(executors);
        self
    }

    pub fn executors_of(&self, cpu: CpuCore) -> Option<&BTreeSet<ConsumerId>> {
        self.access.get(&cpu)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CpuCore, &BTreeSet<ConsumerId>)> {
        self.access.iter().map(|(cpu, e)| (*cpu, e))
    }
}

// =============================================================================
// Security Labels
// =============================================================================

/// Hierarchical classification level, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Unclassified,
    Confidential,
    Secret,
    TopSecret,
}

/// Classification plus compartment set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityLabel {
    pub classification: Classification,
    #[serde(default)]
    pub compartments: BTreeSet<String>,
}

impl SecurityLabel {
    pub fn new(classification: Classification, compartments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            classification,
            compartments: compartments.into_iter().map(Into::into).collect(),
        }
    }

    /// Lattice order: at least as classified and covering every compartment
    pub fn dominates(&self, other: &SecurityLabel) -> bool {
        self.classification >= other.classification && self.compartments.is_superset(&other.compartments)
    }
}

/// Consumer -> security label
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityLabels {
    labels: BTreeMap<ConsumerId, SecurityLabel>,
}

impl SecurityLabels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(&mut self, consumer: ConsumerId, label: SecurityLabel) -> &mut Self {
        self.labels.insert(consumer, label);
        self
    }

    pub fn get(&self, consumer: ConsumerId) -> Option<&SecurityLabel> {
        self.labels.get(&consumer)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
