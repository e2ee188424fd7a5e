//! Assignment Results

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::color::SystemPageColorId;
use crate::consumer::{ColoredRegion, ConsumerId};
use crate::error::{Error, Result};
use crate::system::System;

/// System page color -> consumers reserving it.
///
/// Every system page color of the system is present, reserved or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    reservations: BTreeMap<SystemPageColorId, BTreeSet<ConsumerId>>,
}

impl Assignment {
    /// Assignment of `system` with no reservations
    pub fn empty(system: &System) -> Self {
        Self {
            reservations: system
                .system_page_colors()
                .iter()
                .map(|spc| (spc.id(), BTreeSet::new()))
                .collect(),
        }
    }

    pub(crate) fn reserve(&mut self, color: SystemPageColorId, consumer: ConsumerId) -> Result<()> {
        self.reservations
            .get_mut(&color)
            .ok_or_else(|| Error::Internal(format!("system page color {} does not exist", color)))?
            .insert(consumer);
        Ok(())
    }

    pub fn consumers_of(&self, color: SystemPageColorId) -> Option<&BTreeSet<ConsumerId>> {
        self.reservations.get(&color)
    }

    /// Colors reserved by `consumer`, in system page color order
    pub fn colors_of(&self, consumer: ConsumerId) -> Vec<SystemPageColorId> {
        self.reservations
            .iter()
            .filter(|(_, consumers)| consumers.contains(&consumer))
            .map(|(color, _)| *color)
            .collect()
    }

    /// Inverse view: consumer -> reserved colors
    pub fn by_consumer(&self) -> BTreeMap<ConsumerId, Vec<SystemPageColorId>> {
        let mut view: BTreeMap<ConsumerId, Vec<SystemPageColorId>> = BTreeMap::new();
        for (color, consumers) in &self.reservations {
            for consumer in consumers {
                view.entry(*consumer).or_default().push(*color);
            }
        }
        view
    }

    pub fn iter(&self) -> impl Iterator<Item = (SystemPageColorId, &BTreeSet<ConsumerId>)> {
        self.reservations.iter().map(|(color, consumers)| (*color, consumers))
    }

    /// Colors reserved by at least one consumer
    pub fn used(&self) -> impl Iterator<Item = SystemPageColorId> + '_ {
        self.reservations
            .iter()
            .filter(|(_, consumers)| !consumers.is_empty())
            .map(|(color, _)| *color)
    }

    /// Colors nobody reserved
    pub fn unassigned(&self) -> Vec<SystemPageColorId> {
        self.reservations
            .iter()
            .filter(|(_, consumers)| consumers.is_empty())
            .map(|(color, _)| *color)
            .collect()
    }

    pub fn number_of_used_colors(&self) -> usize {
        self.used().count()
    }

    /// Whether `a` and `b` reserve a common color
    pub fn shares_color(&self, a: ConsumerId, b: ConsumerId) -> bool {
        self.reservations
            .values()
            .any(|consumers| consumers.contains(&a) && consumers.contains(&b))
    }

    /// Distinct cache colors in use per level, L1 first.
    ///
    /// A cache color counts once per cache instance it is used on, so a
    /// private cache's color used on two cores counts twice.
    pub fn used_cache_colors_per_level(&self, system: &System) -> Vec<usize> {
        let hardware = system.hardware();
        (1..=hardware.number_of_levels())
            .map(|level| {
                self.used()
                    .filter_map(|color| {
                        let instance = hardware.cache_instance(level, color.cpu)?;
                        let cache_color = system.page_color(color.page_color)?.cache_color(level)?;
                        Some((instance, cache_color))
                    })
                    .collect::<BTreeSet<_>>()
                    .len()
            })
            .collect()
    }

    /// Append every reserved color to its consumers.
    ///
    /// All colors and consumers are validated first; on error nothing has
    /// been applied.
    pub fn apply_to(&self, system: &mut System) -> Result<()> {
        for (color, consumers) in &self.reservations {
            if !system.contains_color(*color) {
                return Err(Error::Internal(format!(
                    "assignment references unknown system page color {}",
                    color
                )));
            }
            if let Some(missing) = consumers.iter().find(|c| !system.consumers().contains(**c)) {
                return Err(Error::UnknownConsumer(format!("#{}", missing.index())));
            }
        }

        let consumers = system.consumers_mut();
        for (color, reserving) in &self.reservations {
            for id in reserving {
                if let Some(consumer) = consumers.get_mut(*id) {
                    consumer.add_color(*color);
                }
            }
        }

        debug!(used = self.number_of_used_colors(), "Assignment applied");
        Ok(())
    }
}
