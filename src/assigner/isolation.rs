//! Cache-Isolation-Domain Assignment
//!
//! Every consumer belongs to exactly one isolation domain. Domains are
//! processed once, in the given order. For each member the required cores are
//! the union of the affinities of the executors accessing it, and its
//! candidate is the lowest page color index that is unreserved on every one
//! of those cores. The domain then reserves the union of its members'
//! candidates, each member taking the candidates on the cores it requires.
//!
//! All preconditions are checked before any color is reserved.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, instrument, warn};

use super::assignment::Assignment;
use super::constraints::{CacheIsolationDomain, CpuAccessConstraints, ExecutorCpuConstraints};
use super::facts::{ColorSolver, ColoringFacts, SolverOutcome};
use crate::color::SystemPageColorId;
use crate::consumer::{ColoredRegion, ConsumerId};
use crate::error::{Error, Result};
use crate::hardware::CpuCore;
use crate::system::System;

// =============================================================================
// Preconditions
// =============================================================================

/// Validate domains and CPU constraints against `system`.
///
/// Checks, in order: unknown domain members, exactly one domain per
/// consumer, an affinity for every executor, known affinity cores and
/// affinity keys, consistent access constraints.
pub fn check_preconditions(
    system: &System,
    domains: &[CacheIsolationDomain],
    affinity: &ExecutorCpuConstraints,
    access: Option<&CpuAccessConstraints>,
) -> Result<()> {
    let consumers = system.consumers();
    let hardware = system.hardware();

    for domain in domains {
        if let Some(unknown) = domain.members().iter().find(|m| !consumers.contains(**m)) {
            return Err(Error::UnknownConsumer(format!("#{}", unknown.index())));
        }
    }

    for consumer in consumers.iter() {
        let count = domains.iter().filter(|d| d.contains(consumer.id())).count();
        if count != 1 {
            return Err(Error::DomainMembership {
                consumer: consumer.name().to_string(),
                count,
            });
        }
    }

    let executors: BTreeSet<ConsumerId> = consumers.iter().flat_map(|c| c.executors()).collect();
    for executor in &executors {
        match affinity.cpus_of(*executor) {
            Some(cpus) if !cpus.is_empty() => {}
            _ => {
                return Err(Error::MissingAffinity {
                    executor: consumers.name_of(*executor),
                })
            }
        }
    }

    for (executor, cpus) in affinity.iter() {
        match consumers.get(executor) {
            None => return Err(Error::UnknownConsumer(format!("#{}", executor.index()))),
            Some(consumer) if !consumer.is_executor() => {
                return Err(Error::InconsistentConstraints(format!(
                    "{} has a CPU affinity but does not execute",
                    consumer
                )))
            }
            Some(_) => {}
        }
        if let Some(cpu) = cpus.iter().find(|cpu| !hardware.contains_cpu(**cpu)) {
            return Err(Error::UnknownCpuCore(cpu.id()));
        }
    }

    if let Some(access) = access {
        for (cpu, allowed) in access.iter() {
            if !hardware.contains_cpu(cpu) {
                return Err(Error::UnknownCpuCore(cpu.id()));
            }
            for executor in allowed {
                let runs_there = affinity
                    .cpus_of(*executor)
                    .map(|cpus| cpus.contains(&cpu))
                    .unwrap_or(false);
                if !runs_there {
                    return Err(Error::InconsistentConstraints(format!(
                        "{} has exclusive access to {} but no affinity for it",
                        consumers.name_of(*executor),
                        cpu
                    )));
                }
            }
        }
    }

    Ok(())
}

// =============================================================================
// Greedy Solver
// =============================================================================

/// Native single-pass greedy isolation solver
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyIsolationSolver;

impl GreedyIsolationSolver {
    pub fn new() -> Self {
        Self
    }
}

impl ColorSolver for GreedyIsolationSolver {
    fn name(&self) -> &str {
        "greedy"
    }

    fn solve(&self, facts: &ColoringFacts) -> Result<SolverOutcome> {
        let number_of_page_colors = facts.page_colors.len();
        let mut usage: BTreeMap<SystemPageColorId, usize> = BTreeMap::new();
        let mut reservations: BTreeMap<ConsumerId, BTreeSet<SystemPageColorId>> = BTreeMap::new();

        for (i, domain) in facts.domains.iter().enumerate() {
            let mut candidates: BTreeSet<SystemPageColorId> = BTreeSet::new();
            let mut required: Vec<(ConsumerId, BTreeSet<CpuCore>)> = Vec::with_capacity(domain.len());

            for member in domain {
                let cpus = facts.required_cpus(*member);
                let free = |page_color: usize| {
                    cpus.iter().all(|cpu| {
                        usage
                            .get(&SystemPageColorId::new(*cpu, page_color))
                            .copied()
                            .unwrap_or(0)
                            == 0
                    })
                };

                let page_color = (0..number_of_page_colors).find(|p| free(*p)).ok_or_else(|| {
                    let name = facts
                        .region(*member)
                        .map(|r| r.name.clone())
                        .unwrap_or_else(|| format!("#{}", member.index()));
                    Error::ColorExhaustion(format!(
                        "no page color is free on all of {} CPU cores required by {}",
                        cpus.len(),
                        name
                    ))
                })?;

                candidates.extend(cpus.iter().map(|cpu| SystemPageColorId::new(*cpu, page_color)));
                required.push((*member, cpus));
            }

            for color in &candidates {
                for (member, cpus) in &required {
                    if cpus.contains(&color.cpu) {
                        *usage.entry(*color).or_default() += 1;
                        reservations.entry(*member).or_default().insert(*color);
                    }
                }
            }

            debug!(domain = i, candidates = candidates.len(), "Isolation domain colored");
        }

        for (member, colors) in &reservations {
            let Some(region) = facts.region(*member) else { continue };
            let distinct: BTreeSet<usize> = colors.iter().map(|c| c.page_color).collect();
            if (distinct.len() as u64) < region.min_page_colors {
                warn!(
                    consumer = %region.name,
                    reserved = distinct.len(),
                    required = region.min_page_colors,
                    "Fewer page colors reserved than needed to hold the region"
                );
            }
        }

        let used: BTreeSet<SystemPageColorId> = reservations.values().flatten().copied().collect();
        Ok(SolverOutcome {
            used_colors_per_level: facts.used_cache_colors_per_level(&used),
            reservations,
        })
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// Check preconditions, run `solver`, and map its outcome onto the system's
/// colors
#[instrument(skip_all, fields(domains = domains.len(), solver = solver.name()))]
pub fn assign_with(
    system: &System,
    domains: &[CacheIsolationDomain],
    affinity: &ExecutorCpuConstraints,
    access: Option<&CpuAccessConstraints>,
    solver: &dyn ColorSolver,
) -> Result<Assignment> {
    check_preconditions(system, domains, affinity, access)?;

    let facts = ColoringFacts::from_system(system, domains, affinity);
    let outcome = solver.solve(&facts)?;

    let mut assignment = Assignment::empty(system);
    for (consumer, colors) in &outcome.reservations {
        if !system.consumers().contains(*consumer) {
            return Err(Error::UnknownConsumer(format!("#{}", consumer.index())));
        }
        for color in colors {
            assignment.reserve(*color, *consumer)?;
        }
    }

    debug!(
        used = assignment.number_of_used_colors(),
        per_level = ?outcome.used_colors_per_level,
        "Cache isolation assignment computed"
    );
    Ok(assignment)
}

pub fn assign(
    system: &System,
    domains: &[CacheIsolationDomain],
    affinity: &ExecutorCpuConstraints,
    access: Option<&CpuAccessConstraints>,
) -> Result<Assignment> {
    assign_with(system, domains, affinity, access, &GreedyIsolationSolver)
}
