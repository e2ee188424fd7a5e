//! Consumer Address Spaces

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Range of `len` bytes starting at `start`
    pub fn with_len(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(len),
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

/// Check that `ranges` form a valid address space of exactly `memory_size`
/// bytes: at least one range, no empty ranges, no overlaps.
pub fn validate(consumer: &str, memory_size: u64, ranges: &[AddressRange]) -> Result<()> {
    let fail = |reason: String| Error::AddressSpace {
        consumer: consumer.to_string(),
        reason,
    };

    if ranges.is_empty() {
        return Err(fail("address space has no ranges".to_string()));
    }

    if let Some(empty) = ranges.iter().find(|r| r.is_empty()) {
        return Err(fail(format!("range {} is empty", empty)));
    }

    let mut sorted = ranges.to_vec();
    sorted.sort();
    for pair in sorted.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(fail(format!("ranges {} and {} overlap", pair[0], pair[1])));
        }
    }

    let total = sorted
        .iter()
        .try_fold(0u64, |sum, r| sum.checked_add(r.len()))
        .ok_or_else(|| fail("total range size overflows".to_string()))?;
    if total != memory_size {
        return Err(fail(format!(
            "ranges cover {} bytes, memory size is {} bytes",
            total, memory_size
        )));
    }

    Ok(())
}
