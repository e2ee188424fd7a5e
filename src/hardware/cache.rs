//! Cache Geometry
//!
//! One cache instance of one level. All derived quantities must be exact
//! integers; a geometry that would yield partial sets or colors is rejected
//! at construction.

use serde::Serialize;

use super::index::IndexFunction;
use crate::error::{Error, Result};

/// Description of a CPU cache
#[derive(Debug, Clone, Serialize)]
pub struct Cache {
    /// Display name (e.g. `L1_0`), not part of the geometry
    #[serde(skip)]
    name: String,
    /// Total capacity in bytes
    total_capacity: u64,
    /// Number of cache lines per set
    associativity: u64,
    /// Bytes per cache line
    cacheline_capacity: u64,
    /// Page size in bytes
    page_size: u64,
    /// One instance serves several cores
    shared: bool,
    /// Cleared on context switch
    flushed: bool,
    /// Address to set mapping
    index_function: IndexFunction,
    number_of_sets: u64,
    affected_sets_per_page: u64,
    number_of_colors: u64,
}

impl Cache {
    /// Create a cache with the linear index function.
    ///
    /// Fails with [`Error::Geometry`] if the number of sets, the number of
    /// sets touched by one page, or the number of colors is not a positive
    /// integer.
    pub fn new(
        total_capacity: u64,
        associativity: u64,
        cacheline_capacity: u64,
        page_size: u64,
    ) -> Result<Self> {
        if total_capacity == 0 || associativity == 0 || cacheline_capacity == 0 || page_size == 0 {
            return Err(Error::Geometry(format!(
                "all cache parameters must be positive (capacity={}, associativity={}, cacheline={}, page={})",
                total_capacity, associativity, cacheline_capacity, page_size
            )));
        }

        let way_bytes = associativity.checked_mul(cacheline_capacity).ok_or_else(|| {
            Error::Geometry(format!(
                "set size {} x {} overflows 64 bits",
                associativity, cacheline_capacity
            ))
        })?;
        if total_capacity % way_bytes != 0 {
            return Err(Error::Geometry(format!(
                "number of sets {} / ({} x {}) is not an integer",
                total_capacity, associativity, cacheline_capacity
            )));
        }
        let number_of_sets = total_capacity / way_bytes;

        if page_size % cacheline_capacity != 0 || page_size < cacheline_capacity {
            return Err(Error::Geometry(format!(
                "affected sets per page {} / {} is not a positive integer",
                page_size, cacheline_capacity
            )));
        }
        let affected_sets_per_page = page_size / cacheline_capacity;

        if number_of_sets % affected_sets_per_page != 0 || number_of_sets < affected_sets_per_page {
            return Err(Error::Geometry(format!(
                "number of colors {} / {} is not a positive integer",
                number_of_sets, affected_sets_per_page
            )));
        }
        let number_of_colors = number_of_sets / affected_sets_per_page;

        Ok(Self {
            name: String::new(),
            total_capacity,
            associativity,
            cacheline_capacity,
            page_size,
            shared: false,
            flushed: false,
            index_function: IndexFunction::Linear,
            number_of_sets,
            affected_sets_per_page,
            number_of_colors,
        })
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Mark the cache as shared between cores
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Mark the cache as flushed on context switch
    pub fn flushed(mut self, flushed: bool) -> Self {
        self.flushed = flushed;
        self
    }

    /// Replace the index function
    pub fn with_index_function(mut self, index_function: IndexFunction) -> Self {
        self.index_function = index_function;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_capacity(&self) -> u64 {
        self.total_capacity
    }

    pub fn associativity(&self) -> u64 {
        self.associativity
    }

    pub fn cacheline_capacity(&self) -> u64 {
        self.cacheline_capacity
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn index_function(&self) -> &IndexFunction {
        &self.index_function
    }

    pub fn number_of_sets(&self) -> u64 {
        self.number_of_sets
    }

    pub fn affected_sets_per_page(&self) -> u64 {
        self.affected_sets_per_page
    }

    pub fn number_of_colors(&self) -> u64 {
        self.number_of_colors
    }

    /// Set id holding the byte at `address`
    pub fn set_index(&self, address: u64) -> u64 {
        self.index_function
            .set_index(address, self.cacheline_capacity, self.number_of_sets)
    }

    /// Sorted, de-duplicated set ids touched by the page starting at
    /// `page_address`, probing one address per cache line.
    pub fn affected_sets(&self, page_address: u64) -> Vec<u64> {
        let mut sets: Vec<u64> = (0..self.affected_sets_per_page)
            .map(|line| self.set_index(page_address + line * self.cacheline_capacity))
            .collect();
        sets.sort_unstable();
        sets.dedup();
        sets
    }

    /// Whether two caches are structurally identical (name and sharing
    /// flags aside)
    pub fn same_geometry(&self, other: &Cache) -> bool {
        self.total_capacity == other.total_capacity
            && self.associativity == other.associativity
            && self.cacheline_capacity == other.cacheline_capacity
            && self.page_size == other.page_size
            && self.index_function == other.index_function
    }
}

impl std::fmt::Display for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} KiB, {}-way, {} B lines, {} colors, {})",
            if self.name.is_empty() { "cache" } else { self.name.as_str() },
            self.total_capacity / 1024,
            self.associativity,
            self.cacheline_capacity,
            self.number_of_colors,
            self.index_function.name()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_l1_geometry() {
        let l1 = Cache::new(32 * 1024, 8, 64, 4096).unwrap();
        assert_eq!(l1.number_of_sets(), 64);
        assert_eq!(l1.affected_sets_per_page(), 64);
        assert_eq!(l1.number_of_colors(), 1);
    }

    #[test]
    fn test_l2_geometry() {
        let l2 = Cache::new(256 * 1024, 8, 64, 4096).unwrap();
        assert_eq!(l2.number_of_sets(), 512);
        assert_eq!(l2.number_of_colors(), 8);
    }

    #[test]
    fn test_l3_geometry() {
        let l3 = Cache::new(6 * 1024 * 1024, 12, 64, 4096).unwrap();
        assert_eq!(l3.number_of_sets(), 8192);
        assert_eq!(l3.number_of_colors(), 128);
    }

    #[test]
    fn test_non_integral_sets_rejected() {
        assert_matches!(Cache::new(1000, 8, 64, 4096), Err(Error::Geometry(_)));
    }

    #[test]
    fn test_non_integral_affected_sets_rejected() {
        assert_matches!(Cache::new(32 * 1024, 8, 48, 4096), Err(Error::Geometry(_)));
    }

    #[test]
    fn test_cache_smaller_than_page_stride_rejected() {
        // 8 sets but a page touches 64 of them
        assert_matches!(Cache::new(8 * 64, 1, 64, 4096), Err(Error::Geometry(_)));
    }

    #[test]
    fn test_overflowing_set_size_rejected() {
        assert_matches!(Cache::new(4096, 1 << 40, 1 << 30, 4096), Err(Error::Geometry(_)));
    }

    #[test]
    fn test_zero_parameters_rejected() {
        assert_matches!(Cache::new(0, 8, 64, 4096), Err(Error::Geometry(_)));
        assert_matches!(Cache::new(32 * 1024, 0, 64, 4096), Err(Error::Geometry(_)));
    }

    #[test]
    fn test_affected_sets_linear() {
        let l2 = Cache::new(256 * 1024, 8, 64, 4096).unwrap();
        let sets = l2.affected_sets(4096);
        assert_eq!(sets.len(), 64);
        assert_eq!(sets.first(), Some(&64));
        assert_eq!(sets.last(), Some(&127));
        // 8 colors: page 8 wraps around to page 0's sets
        assert_eq!(l2.affected_sets(8 * 4096), l2.affected_sets(0));
    }

    #[test]
    fn test_builder_flags() {
        let cache = Cache::new(32 * 1024, 8, 64, 4096)
            .unwrap()
            .with_name("L1_0")
            .shared(true)
            .flushed(true);
        assert_eq!(cache.name(), "L1_0");
        assert!(cache.is_shared());
        assert!(cache.is_flushed());
        assert!(cache.same_geometry(&Cache::new(32 * 1024, 8, 64, 4096).unwrap()));
    }
}
