//! Naive Assignment
//!
//! One system page color per consumer, handed out in consumer registration
//! order over the system page colors sorted core-fastest.

use tracing::{debug, instrument};

use super::assignment::Assignment;
use crate::error::{Error, Result};
use crate::system::System;

#[instrument(skip_all, fields(consumers = system.consumers().len()))]
pub fn assign(system: &System) -> Result<Assignment> {
    let consumers = system.consumers();
    let colors = system.system_page_colors();

    if consumers.len() > colors.len() {
        return Err(Error::ColorExhaustion(format!(
            "{} memory consumers but only {} system page colors",
            consumers.len(),
            colors.len()
        )));
    }

    let mut assignment = Assignment::empty(system);
    for (consumer, color) in consumers.ids().zip(colors) {
        assignment.reserve(color.id(), consumer)?;
    }

    debug!(used = assignment.number_of_used_colors(), "Naive assignment computed");
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::SystemPageColorId;
    use crate::consumer::Consumers;
    use crate::hardware::presets;
    use crate::testing::small_hardware;
    use assert_matches::assert_matches;

    #[test]
    fn test_four_subjects_on_four_cores() {
        let hardware = presets::paired_l2_quad_core(16 * 1024 * 1024).unwrap();
        let cores = hardware.cpu_cores().to_vec();
        let mut consumers = Consumers::new(4096);
        let subjects: Vec<_> = (1..=4)
            .map(|i| consumers.add_subject(format!("Subj{}", i), 4096).unwrap())
            .collect();
        let system = System::new(hardware, consumers).unwrap();

        let assignment = assign(&system).unwrap();
        for (subject, cpu) in subjects.iter().zip(&cores) {
            assert_eq!(assignment.colors_of(*subject), vec![SystemPageColorId::new(*cpu, 0)]);
        }
        assert_eq!(assignment.number_of_used_colors(), 4);
    }

    #[test]
    fn test_exhaustion() {
        // 2 cores x 32 page colors
        let mut consumers = Consumers::new(4096);
        for i in 0..65 {
            consumers.add_subject(format!("S{}", i), 4096).unwrap();
        }
        let system = System::new(small_hardware(), consumers).unwrap();
        assert_matches!(assign(&system), Err(Error::ColorExhaustion(_)));
    }

    #[test]
    fn test_exactly_enough_colors() {
        let mut consumers = Consumers::new(4096);
        for i in 0..64 {
            consumers.add_subject(format!("S{}", i), 4096).unwrap();
        }
        let system = System::new(small_hardware(), consumers).unwrap();
        let assignment = assign(&system).unwrap();
        assert!(assignment.unassigned().is_empty());
    }
}
