//! Color Assignment
//!
//! Strategies that decide which system page colors each memory consumer may
//! use. Every strategy returns an [`Assignment`] without touching the system;
//! [`ColorAssigner::apply`] appends the result to the consumers afterwards, so
//! a failed strategy never leaves partial state behind.
//!
//! # Strategies
//!
//! | Strategy | CPU aware | Preconditions |
//! |---|---|---|
//! | [`AssignmentStrategy::Naive`] | no | enough system page colors |
//! | [`AssignmentStrategy::InterferenceDomains`] | no | no consumer colored yet |
//! | [`AssignmentStrategy::CacheIsolationDomains`] | yes | one domain per consumer, affinity per executor |
//! | [`AssignmentStrategy::SecurityLabels`] | - | not specified, always fails |

pub mod assignment;
pub mod constraints;
pub mod facts;
pub mod interference;
pub mod isolation;
pub mod naive;

#[cfg(test)]
mod proptest;

use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::system::System;

pub use assignment::Assignment;
pub use constraints::{
    CacheIsolationDomain, Classification, CpuAccessConstraints, ExecutorCpuConstraints,
    InterferenceDomain, SecurityLabel, SecurityLabels,
};
pub use facts::{ColorSolver, ColoringFacts, SolverOutcome};
pub use isolation::GreedyIsolationSolver;

/// Assignment strategy with its constraints
#[derive(Debug, Clone)]
pub enum AssignmentStrategy {
    Naive,
    InterferenceDomains(Vec<InterferenceDomain>),
    CacheIsolationDomains {
        domains: Vec<CacheIsolationDomain>,
        affinity: ExecutorCpuConstraints,
        access: Option<CpuAccessConstraints>,
    },
    SecurityLabels(SecurityLabels),
}

impl AssignmentStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            AssignmentStrategy::Naive => "naive",
            AssignmentStrategy::InterferenceDomains(_) => "interference_domains",
            AssignmentStrategy::CacheIsolationDomains { .. } => "cache_isolation_domains",
            AssignmentStrategy::SecurityLabels(_) => "security_labels",
        }
    }
}

/// Solver for the cache-isolation strategy by name
pub fn solver_by_name(name: &str) -> Result<Box<dyn ColorSolver>> {
    match name {
        "greedy" => Ok(Box::new(GreedyIsolationSolver::new())),
        other => Err(Error::Config(format!("unknown color solver '{}'", other))),
    }
}

/// Entry point for computing, applying and resetting color assignments
pub struct ColorAssigner;

impl ColorAssigner {
    /// One system page color per consumer
    pub fn naive(system: &System) -> Result<Assignment> {
        naive::assign(system)
    }

    /// Coalesce each interference domain onto one fresh color
    pub fn by_interference_domains(
        system: &System,
        domains: &[InterferenceDomain],
    ) -> Result<Assignment> {
        interference::assign(system, domains)
    }

    /// Isolate domains with the native greedy solver
    pub fn by_cache_isolation_domains(
        system: &System,
        domains: &[CacheIsolationDomain],
        affinity: &ExecutorCpuConstraints,
        access: Option<&CpuAccessConstraints>,
    ) -> Result<Assignment> {
        isolation::assign(system, domains, affinity, access)
    }

    /// Isolate domains with any [`ColorSolver`]
    pub fn by_cache_isolation_domains_with(
        system: &System,
        domains: &[CacheIsolationDomain],
        affinity: &ExecutorCpuConstraints,
        access: Option<&CpuAccessConstraints>,
        solver: &dyn ColorSolver,
    ) -> Result<Assignment> {
        isolation::assign_with(system, domains, affinity, access, solver)
    }

    /// Lattice-based sharing by security label. The sharing rule is not
    /// defined yet, so this always fails rather than return an empty result.
    pub fn by_security_labels(_system: &System, _labels: &SecurityLabels) -> Result<Assignment> {
        Err(Error::UnspecifiedStrategy("security_labels".to_string()))
    }

    /// Run `strategy` with the native solver
    #[instrument(skip_all, fields(strategy = strategy.name()))]
    pub fn assign(system: &System, strategy: &AssignmentStrategy) -> Result<Assignment> {
        Self::assign_with(system, strategy, &GreedyIsolationSolver)
    }

    /// Run `strategy`, using `solver` for cache isolation
    pub fn assign_with(
        system: &System,
        strategy: &AssignmentStrategy,
        solver: &dyn ColorSolver,
    ) -> Result<Assignment> {
        let assignment = match strategy {
            AssignmentStrategy::Naive => Self::naive(system),
            AssignmentStrategy::InterferenceDomains(domains) => {
                Self::by_interference_domains(system, domains)
            }
            AssignmentStrategy::CacheIsolationDomains {
                domains,
                affinity,
                access,
            } => Self::by_cache_isolation_domains_with(
                system,
                domains,
                affinity,
                access.as_ref(),
                solver,
            ),
            AssignmentStrategy::SecurityLabels(labels) => Self::by_security_labels(system, labels),
        }?;

        info!(
            strategy = strategy.name(),
            used = assignment.number_of_used_colors(),
            total = system.system_page_colors().len(),
            "Assignment computed"
        );
        Ok(assignment)
    }

    /// Append `assignment` to the system's consumers
    pub fn apply(system: &mut System, assignment: &Assignment) -> Result<()> {
        assignment.apply_to(system)
    }

    /// Clear every consumer's colors so another strategy can run
    pub fn reset_colors(system: &mut System) {
        system.consumers_mut().reset_colors();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ColoredRegion, Consumers};
    use crate::testing::small_hardware;
    use assert_matches::assert_matches;

    fn system() -> System {
        let mut consumers = Consumers::new(4096);
        consumers.add_subject("A", 4096).unwrap();
        consumers.add_subject("B", 4096).unwrap();
        System::new(small_hardware(), consumers).unwrap()
    }

    #[test]
    fn test_security_labels_unspecified() {
        let system = system();
        let strategy = AssignmentStrategy::SecurityLabels(SecurityLabels::new());
        assert_matches!(
            ColorAssigner::assign(&system, &strategy),
            Err(Error::UnspecifiedStrategy(name)) if name == "security_labels"
        );
    }

    #[test]
    fn test_apply_reset_reassign() {
        let mut system = system();
        let naive = ColorAssigner::assign(&system, &AssignmentStrategy::Naive).unwrap();
        ColorAssigner::apply(&mut system, &naive).unwrap();
        assert!(system.consumers().iter().all(|c| c.colors().len() == 1));

        // interference assignment refuses colored consumers until reset
        let strategy = AssignmentStrategy::InterferenceDomains(Vec::new());
        assert_matches!(
            ColorAssigner::assign(&system, &strategy),
            Err(Error::AlreadyColored { .. })
        );

        ColorAssigner::reset_colors(&mut system);
        let again = ColorAssigner::assign(&system, &strategy).unwrap();
        ColorAssigner::apply(&mut system, &again).unwrap();
        assert!(system.consumers().iter().all(|c| c.colors().len() == 1));
    }

    #[test]
    fn test_failed_strategy_leaves_consumers_untouched() {
        let system = system();
        let strategy = AssignmentStrategy::CacheIsolationDomains {
            domains: Vec::new(),
            affinity: ExecutorCpuConstraints::new(),
            access: None,
        };
        assert!(ColorAssigner::assign(&system, &strategy).is_err());
        assert!(system.consumers().iter().all(|c| c.colors().is_empty()));
    }

    #[test]
    fn test_solver_by_name() {
        assert_eq!(solver_by_name("greedy").unwrap().name(), "greedy");
        assert_matches!(solver_by_name("clingo").err(), Some(Error::Config(_)));
    }
}
