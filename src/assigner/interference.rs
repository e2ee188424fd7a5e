//! Interference-Domain Assignment
//!
//! Coalesces the members of each interference domain onto one system page
//! color: the lowest-indexed color nobody uses yet. Consumers outside every
//! domain then get a fresh color each. There is no CPU awareness.
//!
//! Domains that overlap are handled by overwriting: a consumer in several
//! domains keeps the color of the last one, which can leave earlier domain
//! partners on a different color and strand colors that are no longer used.
//! No attempt is made at minimum graph coloring.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, instrument};

use super::assignment::Assignment;
use super::constraints::InterferenceDomain;
use crate::color::SystemPageColorId;
use crate::consumer::{ColoredRegion, ConsumerId};
use crate::error::{Error, Result};
use crate::system::System;

#[instrument(skip_all, fields(domains = domains.len()))]
pub fn assign(system: &System, domains: &[InterferenceDomain]) -> Result<Assignment> {
    let consumers = system.consumers();

    for domain in domains {
        if let Some(unknown) = domain.members().iter().find(|m| !consumers.contains(**m)) {
            return Err(Error::UnknownConsumer(format!("#{}", unknown.index())));
        }
    }
    if let Some(colored) = consumers.iter().find(|c| !c.colors().is_empty()) {
        return Err(Error::AlreadyColored {
            consumer: colored.name().to_string(),
        });
    }

    let colors: Vec<SystemPageColorId> = system.system_page_colors().iter().map(|c| c.id()).collect();
    let mut usage: BTreeMap<SystemPageColorId, usize> = colors.iter().map(|c| (*c, 0)).collect();
    let mut current: BTreeMap<ConsumerId, SystemPageColorId> = BTreeMap::new();
    let mut pending: BTreeSet<ConsumerId> = consumers.ids().collect();

    let lowest_unused = |usage: &BTreeMap<SystemPageColorId, usize>, wanted_by: &str| {
        colors
            .iter()
            .find(|c| usage.get(*c).copied().unwrap_or(0) == 0)
            .copied()
            .ok_or_else(|| {
                Error::ColorExhaustion(format!("no unused system page color left for {}", wanted_by))
            })
    };

    for (i, domain) in domains.iter().enumerate() {
        let color = lowest_unused(&usage, &format!("interference domain #{}", i))?;
        for member in domain.members() {
            if let Some(previous) = current.insert(*member, color) {
                if let Some(count) = usage.get_mut(&previous) {
                    *count = count.saturating_sub(1);
                }
            }
            *usage.entry(color).or_default() += 1;
            pending.remove(member);
        }
        debug!(domain = i, color = %color, "Interference domain colored");
    }

    for consumer in pending {
        let color = lowest_unused(&usage, &consumers.name_of(consumer))?;
        current.insert(consumer, color);
        *usage.entry(color).or_default() += 1;
    }

    let mut assignment = Assignment::empty(system);
    for (consumer, color) in current {
        assignment.reserve(color, consumer)?;
    }
    Ok(assignment)
}
