//! Property-Based Tests for Color Assignment
//!
//! Random subject/channel systems on a four-core topology, partitioned into
//! random isolation domains with random CPU affinities.
//!
//! # Test Properties
//!
//! 1. **Coverage**: every consumer ends with at least one color
//! 2. **Isolation**: consumers of different domains never share a color
//! 3. **Core Locality**: shared colors sit on cores both consumers require
//! 4. **Naive Uniqueness**: naive assignment gives distinct single colors

#![cfg(test)]

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;

use super::{
    Assignment, CacheIsolationDomain, ColorAssigner, ColoringFacts, ExecutorCpuConstraints,
};
use crate::consumer::{ConsumerId, Consumers};
use crate::error::Result;
use crate::hardware::presets;
use crate::system::System;

const PAGE: u64 = 4096;

#[derive(Debug, Clone)]
struct Scenario {
    subjects: usize,
    /// (writer, reader) subject indices
    channels: Vec<(usize, usize)>,
    /// Non-empty 4-bit core mask per subject
    affinity: Vec<u8>,
    /// Domain index per consumer (subjects first, then channels)
    domain_of: Vec<usize>,
}

// =============================================================================
// Property Strategies
// =============================================================================

fn scenario_strategy() -> impl Strategy<Value = Scenario> {
    (1usize..6)
        .prop_flat_map(|n| {
            (
                Just(n),
                prop::collection::vec((0..n, 0..n), 0..4),
                prop::collection::vec(1u8..16, n),
            )
        })
        .prop_flat_map(|(n, channels, affinity)| {
            let total = n + channels.len();
            (
                Just(n),
                Just(channels),
                Just(affinity),
                prop::collection::vec(0usize..3, total),
            )
        })
        .prop_map(|(subjects, channels, affinity, domain_of)| Scenario {
            subjects,
            channels,
            affinity,
            domain_of,
        })
}

struct Built {
    system: System,
    ids: Vec<ConsumerId>,
    domains: Vec<CacheIsolationDomain>,
    affinity: ExecutorCpuConstraints,
}

fn build(scenario: &Scenario) -> Result<Built> {
    let hardware = presets::paired_l2_quad_core(1 << 20)?;
    let cores = hardware.cpu_cores().to_vec();

    let mut consumers = Consumers::new(PAGE);
    let mut ids = Vec::new();
    for i in 0..scenario.subjects {
        ids.push(consumers.add_subject(format!("subject-{}", i), PAGE)?);
    }
    for (i, (writer, reader)) in scenario.channels.iter().enumerate() {
        let channel = consumers.add_channel(format!("channel-{}", i), PAGE, ids[*writer], &[ids[*reader]])?;
        ids.push(channel);
    }

    let mut affinity = ExecutorCpuConstraints::new();
    for (i, mask) in scenario.affinity.iter().enumerate() {
        let cpus = cores
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) != 0)
            .map(|(_, cpu)| *cpu);
        affinity.allow(ids[i], cpus);
    }

    let mut grouped: BTreeMap<usize, Vec<ConsumerId>> = BTreeMap::new();
    for (id, domain) in ids.iter().zip(&scenario.domain_of) {
        grouped.entry(*domain).or_default().push(*id);
    }
    let domains = grouped.into_values().map(CacheIsolationDomain::new).collect();

    Ok(Built {
        system: System::new(hardware, consumers)?,
        ids,
        domains,
        affinity,
    })
}

fn domain_index(domains: &[CacheIsolationDomain], id: ConsumerId) -> Option<usize> {
    domains.iter().position(|d| d.contains(id))
}

fn isolation_assignment(built: &Built) -> Result<Assignment> {
    ColorAssigner::by_cache_isolation_domains(&built.system, &built.domains, &built.affinity, None)
}

// =============================================================================
// Isolation Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: every consumer reserves at least one color.
    #[test]
    fn prop_every_consumer_colored(scenario in scenario_strategy()) {
        let built = build(&scenario)?;
        let assignment = isolation_assignment(&built)?;

        for id in &built.ids {
            prop_assert!(!assignment.colors_of(*id).is_empty());
        }
    }

    /// Property: colors are never shared across domains.
    #[test]
    fn prop_domains_isolated(scenario in scenario_strategy()) {
        let built = build(&scenario)?;
        let assignment = isolation_assignment(&built)?;

        for (_, consumers) in assignment.iter() {
            let owners: BTreeSet<Option<usize>> = consumers
                .iter()
                .map(|c| domain_index(&built.domains, *c))
                .collect();
            prop_assert!(owners.len() <= 1);
        }
    }

    /// Property: a shared color's core is required by every consumer holding it.
    #[test]
    fn prop_shared_colors_on_required_cores(scenario in scenario_strategy()) {
        let built = build(&scenario)?;
        let assignment = isolation_assignment(&built)?;
        let facts = ColoringFacts::from_system(&built.system, &built.domains, &built.affinity);

        for (color, consumers) in assignment.iter() {
            for consumer in consumers {
                prop_assert!(facts.required_cpus(*consumer).contains(&color.cpu));
            }
        }
    }

    /// Property: the same input always yields the same assignment.
    #[test]
    fn prop_isolation_deterministic(scenario in scenario_strategy()) {
        let built = build(&scenario)?;
        let first = isolation_assignment(&built)?;
        let second = isolation_assignment(&built)?;
        prop_assert_eq!(first, second);
    }
}

// =============================================================================
// Naive Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: naive assignment hands out one distinct color per consumer.
    #[test]
    fn prop_naive_distinct(scenario in scenario_strategy()) {
        let built = build(&scenario)?;
        let assignment = ColorAssigner::naive(&built.system)?;

        let mut seen = BTreeSet::new();
        for id in &built.ids {
            let colors = assignment.colors_of(*id);
            prop_assert_eq!(colors.len(), 1);
            prop_assert!(seen.insert(colors[0]));
        }
    }
}
