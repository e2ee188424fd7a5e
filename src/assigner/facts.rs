//! Solver Fact Model
//!
//! A flat description of everything a color solver needs: regions and their
//! executors, channels, cores, executor affinities, per-level color spaces,
//! page colors and isolation domains. [`ColorSolver`] implementations consume
//! [`ColoringFacts`] and return reservations per consumer; the native greedy
//! solver and external declarative backends are interchangeable behind it.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::constraints::{CacheIsolationDomain, ExecutorCpuConstraints};
use crate::color::SystemPageColorId;
use crate::consumer::{ColoredRegion, ConsumerId, ConsumerKind, ConsumerRole};
use crate::error::Result;
use crate::hardware::CpuCore;
use crate::system::System;

// =============================================================================
// Facts
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionFact {
    pub id: ConsumerId,
    pub name: String,
    pub kind: ConsumerKind,
    /// Executors accessing the region
    pub executors: Vec<ConsumerId>,
    /// Fewest distinct page colors that can hold the region
    pub min_page_colors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelFact {
    pub channel: ConsumerId,
    pub writer: ConsumerId,
    pub readers: Vec<ConsumerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutorCpuFact {
    pub executor: ConsumerId,
    pub cpus: BTreeSet<CpuCore>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelFact {
    /// 1-based level
    pub level: usize,
    /// Size of the level's cache color id space
    pub colors: usize,
    /// Caches of the level serve single cores
    pub cpu_bound: bool,
    pub flushed: bool,
    /// Core -> index of the cache instance serving it
    pub instances: BTreeMap<CpuCore, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageColorFact {
    pub index: usize,
    /// Cache color id per level, L1 first
    pub cache_colors: Vec<usize>,
}

/// Input of a [`ColorSolver`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColoringFacts {
    pub regions: Vec<RegionFact>,
    pub channels: Vec<ChannelFact>,
    pub cpus: Vec<CpuCore>,
    pub executor_cpus: Vec<ExecutorCpuFact>,
    pub levels: Vec<LevelFact>,
    pub page_colors: Vec<PageColorFact>,
    /// Isolation domains in processing order
    pub domains: Vec<Vec<ConsumerId>>,
}

impl ColoringFacts {
    /// Flatten `system` and the isolation constraints into facts
    pub fn from_system(
        system: &System,
        domains: &[CacheIsolationDomain],
        affinity: &ExecutorCpuConstraints,
    ) -> Self {
        let hardware = system.hardware();
        let consumers = system.consumers();

        let regions = consumers
            .iter()
            .map(|consumer| RegionFact {
                id: consumer.id(),
                name: consumer.name().to_string(),
                kind: consumer.kind(),
                executors: consumer.executors(),
                min_page_colors: system.min_page_colors(consumer),
            })
            .collect();

        let channels = consumers
            .iter()
            .filter_map(|consumer| match consumer.role() {
                ConsumerRole::Channel { writer, readers } => Some(ChannelFact {
                    channel: consumer.id(),
                    writer: *writer,
                    readers: readers.clone(),
                }),
                _ => None,
            })
            .collect();

        let executor_cpus = affinity
            .iter()
            .map(|(executor, cpus)| ExecutorCpuFact {
                executor,
                cpus: cpus.clone(),
            })
            .collect();

        let levels = hardware
            .levels()
            .iter()
            .zip(system.cache_colors())
            .enumerate()
            .map(|(i, (level, table))| LevelFact {
                level: i + 1,
                colors: table.len(),
                cpu_bound: level.is_cpu_bound(),
                flushed: level.representative().is_flushed(),
                instances: level
                    .cpu_mapping()
                    .iter()
                    .map(|(cache, cpu)| (*cpu, *cache))
                    .collect(),
            })
            .collect();

        let page_colors = system
            .page_colors()
            .iter()
            .map(|pc| PageColorFact {
                index: pc.index(),
                cache_colors: pc.cache_color_ids().to_vec(),
            })
            .collect();

        Self {
            regions,
            channels,
            cpus: hardware.cpu_cores().to_vec(),
            executor_cpus,
            levels,
            page_colors,
            domains: domains
                .iter()
                .map(|d| d.members().iter().copied().collect())
                .collect(),
        }
    }

    pub fn region(&self, id: ConsumerId) -> Option<&RegionFact> {
        self.regions.iter().find(|r| r.id == id)
    }

    /// Cores an executor may run on
    pub fn cpus_of(&self, executor: ConsumerId) -> Option<&BTreeSet<CpuCore>> {
        self.executor_cpus
            .iter()
            .find(|f| f.executor == executor)
            .map(|f| &f.cpus)
    }

    /// Union of the affinities of every executor accessing `region`
    pub fn required_cpus(&self, region: ConsumerId) -> BTreeSet<CpuCore> {
        self.region(region)
            .map(|r| {
                r.executors
                    .iter()
                    .filter_map(|e| self.cpus_of(*e))
                    .flatten()
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Distinct cache colors per level used by `colors`, counted once per
    /// cache instance
    pub fn used_cache_colors_per_level(&self, colors: &BTreeSet<SystemPageColorId>) -> Vec<usize> {
        self.levels
            .iter()
            .map(|level| {
                colors
                    .iter()
                    .filter_map(|color| {
                        let instance = level.instances.get(&color.cpu)?;
                        let cache_color = self
                            .page_colors
                            .get(color.page_color)?
                            .cache_colors
                            .get(level.level - 1)?;
                        Some((*instance, *cache_color))
                    })
                    .collect::<BTreeSet<_>>()
                    .len()
            })
            .collect()
    }
}

// =============================================================================
// Solver Port
// =============================================================================

/// Result of a [`ColorSolver`] run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SolverOutcome {
    /// Consumer -> reserved system page colors
    pub reservations: BTreeMap<ConsumerId, BTreeSet<SystemPageColorId>>,
    /// Distinct cache colors used per level, L1 first
    pub used_colors_per_level: Vec<usize>,
}

/// Cache-isolation color solver
pub trait ColorSolver {
    fn name(&self) -> &str;

    /// Compute reservations for every region in `facts`. Preconditions have
    /// been checked by the caller.
    fn solve(&self, facts: &ColoringFacts) -> Result<SolverOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::Consumers;
    use crate::testing::small_hardware;

    #[test]
    fn test_facts_from_system() {
        let hardware = small_hardware();
        let cores = hardware.cpu_cores().to_vec();
        let mut consumers = Consumers::new(4096);
        let linux = consumers.add_subject("Linux", 16 * 4096).unwrap();
        let crypto = consumers.add_subject("Crypto", 4096).unwrap();
        let chan = consumers.add_channel("Linux->Crypto", 4096, linux, &[crypto]).unwrap();
        let system = System::new(hardware, consumers).unwrap();

        let mut affinity = ExecutorCpuConstraints::new();
        affinity.allow(linux, [cores[0]]).allow(crypto, [cores[1]]);
        let domains = vec![
            CacheIsolationDomain::new([linux, chan]),
            CacheIsolationDomain::new([crypto]),
        ];

        let facts = ColoringFacts::from_system(&system, &domains, &affinity);
        assert_eq!(facts.regions.len(), 3);
        assert_eq!(facts.channels.len(), 1);
        assert_eq!(facts.channels[0].writer, linux);
        assert_eq!(facts.cpus, cores);
        assert_eq!(facts.levels.len(), 3);
        assert!(facts.levels[0].cpu_bound);
        assert!(!facts.levels[2].cpu_bound);
        assert_eq!(facts.page_colors.len(), 32);
        assert_eq!(facts.domains, vec![vec![linux, chan], vec![crypto]]);

        // 16 pages of 256, 32 page colors: two colors
        assert_eq!(facts.region(linux).unwrap().min_page_colors, 2);
        assert_eq!(
            facts.required_cpus(chan).into_iter().collect::<Vec<_>>(),
            vec![cores[0], cores[1]]
        );

        let json = serde_json::to_value(&facts).unwrap();
        assert_eq!(json["regions"][2]["kind"], "channel");
    }
}
