//! Color Types
//!
//! The three layers of the color abstraction:
//!
//! - [`CacheColor`] - one level's class of pages touching an identical set of
//!   cache-set ids
//! - [`PageColor`] - the per-level cache colors of one page class, L1 first
//! - [`SystemPageColor`] - a page color bound to a CPU core, the unit of
//!   assignment
//!
//! Page colors refer to cache colors by id; ids are dense and follow discovery
//! order, so rebuilding from the same hardware yields the same ids.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::hardware::CpuCore;

// =============================================================================
// Cache Colors
// =============================================================================

/// Equivalence class of pages at one cache level
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheColor {
    /// 1-based cache level
    level: usize,
    /// Dense id within the level
    id: usize,
    /// Sorted set ids touched by every page of this class
    #[serde(skip)]
    sets: Vec<u64>,
}

impl CacheColor {
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn sets(&self) -> &[u64] {
        &self.sets
    }
}

impl std::fmt::Display for CacheColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}#{}", self.level, self.id)
    }
}

/// Discovered cache colors of one level, keyed by affected set ids
#[derive(Debug, Clone, Default)]
pub struct CacheColorTable {
    level: usize,
    by_sets: HashMap<Vec<u64>, usize>,
    colors: Vec<CacheColor>,
}

impl CacheColorTable {
    pub fn new(level: usize) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Register a class of affected sets, returning its id. Known classes keep
    /// their original id.
    pub fn insert_if_absent(&mut self, sets: Vec<u64>) -> usize {
        if let Some(&id) = self.by_sets.get(&sets) {
            return id;
        }
        let id = self.colors.len();
        self.colors.push(CacheColor {
            level: self.level,
            id,
            sets: sets.clone(),
        });
        self.by_sets.insert(sets, id);
        id
    }

    pub fn lookup(&self, sets: &[u64]) -> Option<&CacheColor> {
        self.id_of(sets).map(|id| &self.colors[id])
    }

    pub fn id_of(&self, sets: &[u64]) -> Option<usize> {
        self.by_sets.get(sets).copied()
    }

    pub fn get(&self, id: usize) -> Option<&CacheColor> {
        self.colors.get(id)
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn colors(&self) -> &[CacheColor] {
        &self.colors
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}

// =============================================================================
// Page Colors
// =============================================================================

/// Cross-level footprint of one page class
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PageColor {
    index: usize,
    /// Cache color id per level, L1 first
    cache_colors: Vec<usize>,
}

impl PageColor {
    pub fn new(index: usize, cache_colors: Vec<usize>) -> Self {
        Self {
            index,
            cache_colors,
        }
    }

    /// Position in the system's page color list
    pub fn index(&self) -> usize {
        self.index
    }

    /// Cache color id at the 1-based `level`
    pub fn cache_color(&self, level: usize) -> Option<usize> {
        level
            .checked_sub(1)
            .and_then(|i| self.cache_colors.get(i))
            .copied()
    }

    pub fn cache_color_ids(&self) -> &[usize] {
        &self.cache_colors
    }
}

impl std::fmt::Display for PageColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PC{}(", self.index)?;
        for (i, id) in self.cache_colors.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "L{}#{}", i + 1, id)?;
        }
        write!(f, ")")
    }
}

// =============================================================================
// System Page Colors
// =============================================================================

/// Compact identity of a system page color.
///
/// Ordering is by page color first, so iterating a sorted collection offers
/// page color 0 to every core before page color 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SystemPageColorId {
    pub page_color: usize,
    pub cpu: CpuCore,
}

impl SystemPageColorId {
    pub fn new(cpu: CpuCore, page_color: usize) -> Self {
        Self { page_color, cpu }
    }
}

impl std::fmt::Display for SystemPageColorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.cpu, self.page_color)
    }
}

/// A page color usable on one CPU core
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SystemPageColor {
    cpu: CpuCore,
    page_color: Arc<PageColor>,
}

impl SystemPageColor {
    pub fn new(cpu: CpuCore, page_color: Arc<PageColor>) -> Self {
        Self { cpu, page_color }
    }

    pub fn cpu(&self) -> CpuCore {
        self.cpu
    }

    pub fn page_color(&self) -> &PageColor {
        &self.page_color
    }

    pub fn id(&self) -> SystemPageColorId {
        SystemPageColorId::new(self.cpu, self.page_color.index())
    }
}

impl PartialOrd for SystemPageColor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SystemPageColor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id().cmp(&other.id())
    }
}

impl std::fmt::Display for SystemPageColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.id().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::CpuCoreAllocator;

    #[test]
    fn test_table_reuses_known_classes() {
        let mut table = CacheColorTable::new(2);
        assert_eq!(table.insert_if_absent(vec![0, 1, 2]), 0);
        assert_eq!(table.insert_if_absent(vec![3, 4, 5]), 1);
        assert_eq!(table.insert_if_absent(vec![0, 1, 2]), 0);
        assert_eq!(table.len(), 2);
        assert_eq!(table.id_of(&[3, 4, 5]), Some(1));
        assert_eq!(table.lookup(&[3, 4, 5]).unwrap().to_string(), "L2#1");
        assert!(table.lookup(&[9]).is_none());
    }

    #[test]
    fn test_page_color_levels_are_one_based() {
        let pc = PageColor::new(3, vec![0, 5, 17]);
        assert_eq!(pc.cache_color(1), Some(0));
        assert_eq!(pc.cache_color(3), Some(17));
        assert_eq!(pc.cache_color(0), None);
        assert_eq!(pc.cache_color(4), None);
        assert_eq!(pc.to_string(), "PC3(L1#0, L2#5, L3#17)");
    }

    #[test]
    fn test_system_page_color_order_cycles_cpu_fastest() {
        let cores = CpuCoreAllocator::new().allocate_many(2);
        let pc0 = Arc::new(PageColor::new(0, vec![0]));
        let pc1 = Arc::new(PageColor::new(1, vec![1]));

        let mut colors = vec![
            SystemPageColor::new(cores[1], pc1.clone()),
            SystemPageColor::new(cores[0], pc1),
            SystemPageColor::new(cores[1], pc0.clone()),
            SystemPageColor::new(cores[0], pc0),
        ];
        colors.sort();

        let ids: Vec<String> = colors.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            ids,
            vec!["(CPU_0, 0)", "(CPU_1, 0)", "(CPU_0, 1)", "(CPU_1, 1)"]
        );
    }
}
