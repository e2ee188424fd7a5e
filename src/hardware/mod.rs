//! Hardware Topology Module
//!
//! Description of the CPU cores, the cache hierarchy and the physical memory
//! of the machine being colored.
//!
//! # Features
//!
//! - Per-level cache lists with cache-to-core mappings
//! - Exact cache geometry and index functions (linear, sliced hash)
//! - Explicit CPU core id allocation owned by the builder
//! - Content fingerprint used to key persisted address maps
//!
//! # Example
//!
//! ```
//! use page_coloring::hardware::{Cache, HardwareBuilder};
//!
//! # fn example() -> page_coloring::Result<()> {
//! let mut builder = HardwareBuilder::new();
//! let cores = builder.add_cpu_cores(2);
//!
//! let l1: Vec<Cache> = (0..2)
//!     .map(|i| Ok(Cache::new(32 * 1024, 8, 64, 4096)?.with_name(format!("L1_{}", i))))
//!     .collect::<page_coloring::Result<_>>()?;
//! builder.add_cache_level(l1, [(0, cores[0]), (1, cores[1])]);
//! builder.main_memory_size(64 * 1024 * 1024);
//!
//! let hardware = builder.build()?;
//! assert_eq!(hardware.cpu_cores().len(), 2);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

pub mod cache;
pub mod index;
pub mod presets;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

pub use cache::Cache;
pub use index::{IndexFunction, SliceHash, NUMBER_OF_SLICES};

/// Default page size in bytes
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Default main memory size (4 GiB)
pub const DEFAULT_MAIN_MEMORY_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Default address bus width in bits
pub const DEFAULT_ADDRESS_BUS_WIDTH: u32 = 64;

const FINGERPRINT_DOMAIN: &[u8] = b"page-coloring/hardware/v1";

// =============================================================================
// CPU Cores
// =============================================================================

/// CPU core identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CpuCore(u32);

impl CpuCore {
    pub fn id(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for CpuCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CPU_{}", self.0)
    }
}

/// Hands out unique CPU core ids, one allocator per topology
#[derive(Debug, Default)]
pub struct CpuCoreAllocator {
    next: u32,
}

impl CpuCoreAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start numbering at `first`
    pub fn starting_at(first: u32) -> Self {
        Self { next: first }
    }

    /// Allocate the next core id
    pub fn allocate(&mut self) -> CpuCore {
        let core = CpuCore(self.next);
        self.next += 1;
        core
    }

    /// Allocate `count` consecutive core ids
    pub fn allocate_many(&mut self, count: usize) -> Vec<CpuCore> {
        (0..count).map(|_| self.allocate()).collect()
    }
}

// =============================================================================
// Cache Levels
// =============================================================================

/// All cache instances of one level and the cores each one serves
#[derive(Debug, Clone, Serialize)]
pub struct CacheLevel {
    caches: Vec<Cache>,
    /// (cache index, core) pairs
    cpu_mapping: Vec<(usize, CpuCore)>,
}

impl CacheLevel {
    pub fn new(caches: Vec<Cache>, cpu_mapping: impl IntoIterator<Item = (usize, CpuCore)>) -> Self {
        let mut cpu_mapping: Vec<(usize, CpuCore)> = cpu_mapping.into_iter().collect();
        cpu_mapping.sort();
        cpu_mapping.dedup();
        Self {
            caches,
            cpu_mapping,
        }
    }

    pub fn caches(&self) -> &[Cache] {
        &self.caches
    }

    pub fn cpu_mapping(&self) -> &[(usize, CpuCore)] {
        &self.cpu_mapping
    }

    /// First cache of the level; all caches of a level share its geometry
    pub fn representative(&self) -> &Cache {
        &self.caches[0]
    }

    /// Index of the cache instance serving `cpu`
    pub fn cache_for(&self, cpu: CpuCore) -> Option<usize> {
        self.cpu_mapping
            .iter()
            .find(|(_, core)| *core == cpu)
            .map(|(cache, _)| *cache)
    }

    /// Cores served by the cache instance at `cache_index`
    pub fn cores_of(&self, cache_index: usize) -> Vec<CpuCore> {
        self.cpu_mapping
            .iter()
            .filter(|(cache, _)| *cache == cache_index)
            .map(|(_, core)| *core)
            .collect()
    }

    /// Whether the caches of this level are bound to single cores
    pub fn is_cpu_bound(&self) -> bool {
        !self.representative().is_shared()
    }
}

// =============================================================================
// Hardware
// =============================================================================

/// Immutable description of a machine's cores, caches and memory
#[derive(Debug, Clone, Serialize)]
pub struct Hardware {
    cpu_cores: Vec<CpuCore>,
    levels: Vec<CacheLevel>,
    main_memory_size: u64,
    address_bus_width: u32,
    page_size: u64,
    #[serde(skip)]
    fingerprint: String,
}

impl Hardware {
    /// Validate and assemble a hardware description
    pub fn new(
        cpu_cores: Vec<CpuCore>,
        levels: Vec<CacheLevel>,
        main_memory_size: u64,
        address_bus_width: u32,
        page_size: u64,
    ) -> Result<Self> {
        let mut hardware = Self {
            cpu_cores,
            levels,
            main_memory_size,
            address_bus_width,
            page_size,
            fingerprint: String::new(),
        };
        hardware.validate()?;
        hardware.fingerprint = hardware.compute_fingerprint()?;

        debug!(
            cores = hardware.cpu_cores.len(),
            levels = hardware.levels.len(),
            pages = hardware.number_of_pages(),
            "Hardware description validated"
        );

        Ok(hardware)
    }

    fn validate(&self) -> Result<()> {
        if self.cpu_cores.is_empty() {
            return Err(Error::HardwareConfig("at least one CPU core is required".to_string()));
        }
        // system page colors order cores by id, so list order must agree
        if self.cpu_cores.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(Error::HardwareConfig(
                "CPU cores must be unique and listed in ascending id order".to_string(),
            ));
        }
        let unique: BTreeSet<CpuCore> = self.cpu_cores.iter().copied().collect();

        if self.page_size == 0 {
            return Err(Error::HardwareConfig("page size must be positive".to_string()));
        }
        if self.main_memory_size == 0 || self.main_memory_size % self.page_size != 0 {
            return Err(Error::HardwareConfig(format!(
                "main memory size {} must be a positive multiple of the page size {}",
                self.main_memory_size, self.page_size
            )));
        }
        if self.address_bus_width == 0 || self.address_bus_width > 64 {
            return Err(Error::HardwareConfig(format!(
                "address bus width must be within 1..=64, got {}",
                self.address_bus_width
            )));
        }
        if self.address_bus_width < 64 && (1u64 << self.address_bus_width) <= self.main_memory_size {
            return Err(Error::HardwareConfig(format!(
                "a {}-bit address bus cannot address {} bytes of main memory",
                self.address_bus_width, self.main_memory_size
            )));
        }

        if self.levels.is_empty() {
            return Err(Error::HardwareConfig("at least one cache level is required".to_string()));
        }

        for (i, level) in self.levels.iter().enumerate() {
            let number = i + 1;
            let Some(first) = level.caches.first() else {
                return Err(Error::HardwareConfig(format!("cache level L{} has no caches", number)));
            };

            for cache in &level.caches {
                if !cache.same_geometry(first) {
                    return Err(Error::HardwareConfig(format!(
                        "caches of level L{} are not structurally identical",
                        number
                    )));
                }
                if cache.page_size() != self.page_size {
                    return Err(Error::HardwareConfig(format!(
                        "cache of level L{} uses page size {}, hardware uses {}",
                        number,
                        cache.page_size(),
                        self.page_size
                    )));
                }
            }

            let mut served: BTreeMap<CpuCore, usize> = BTreeMap::new();
            for &(cache_index, cpu) in &level.cpu_mapping {
                if cache_index >= level.caches.len() {
                    return Err(Error::HardwareConfig(format!(
                        "level L{} maps unknown cache #{}",
                        number, cache_index
                    )));
                }
                if !unique.contains(&cpu) {
                    return Err(Error::HardwareConfig(format!(
                        "level L{} maps cache #{} to unknown core {}",
                        number, cache_index, cpu
                    )));
                }
                if let Some(previous) = served.insert(cpu, cache_index) {
                    return Err(Error::HardwareConfig(format!(
                        "{} is served by caches #{} and #{} of level L{}",
                        cpu, previous, cache_index, number
                    )));
                }
            }

            for cache_index in 0..level.caches.len() {
                if level.cores_of(cache_index).is_empty() {
                    return Err(Error::HardwareConfig(format!(
                        "cache #{} of level L{} is not assigned to any CPU core",
                        cache_index, number
                    )));
                }
            }
        }

        Ok(())
    }

    fn compute_fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(b"\n");
        hasher.update(&canonical);
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn cpu_cores(&self) -> &[CpuCore] {
        &self.cpu_cores
    }

    pub fn levels(&self) -> &[CacheLevel] {
        &self.levels
    }

    /// Cache level by 1-based number (L1 = 1)
    pub fn level(&self, number: usize) -> Option<&CacheLevel> {
        number.checked_sub(1).and_then(|i| self.levels.get(i))
    }

    pub fn number_of_levels(&self) -> usize {
        self.levels.len()
    }

    /// Representative cache of every level, L1 first
    pub fn cache_information(&self) -> Vec<&Cache> {
        self.levels.iter().map(CacheLevel::representative).collect()
    }

    /// Representative cache of the last level
    pub fn last_level_cache(&self) -> &Cache {
        self.levels[self.levels.len() - 1].representative()
    }

    /// Index of the cache instance of level `number` serving `cpu`
    pub fn cache_instance(&self, number: usize, cpu: CpuCore) -> Option<usize> {
        self.level(number).and_then(|level| level.cache_for(cpu))
    }

    pub fn contains_cpu(&self, cpu: CpuCore) -> bool {
        self.cpu_cores.contains(&cpu)
    }

    pub fn main_memory_size(&self) -> u64 {
        self.main_memory_size
    }

    pub fn address_bus_width(&self) -> u32 {
        self.address_bus_width
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of physical pages in main memory
    pub fn number_of_pages(&self) -> u64 {
        self.main_memory_size / self.page_size
    }

    /// Start address of every physical page, ascending
    pub fn page_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.number_of_pages()).map(move |page| page * self.page_size)
    }

    /// Hex SHA-256 of the topology; identical hardware yields identical
    /// fingerprints regardless of cache names
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Incremental construction of a [`Hardware`] description
#[derive(Debug)]
pub struct HardwareBuilder {
    allocator: CpuCoreAllocator,
    cpu_cores: Vec<CpuCore>,
    levels: Vec<CacheLevel>,
    main_memory_size: u64,
    address_bus_width: u32,
    page_size: u64,
}

impl Default for HardwareBuilder {
    fn default() -> Self {
        Self::with_allocator(CpuCoreAllocator::new())
    }
}

impl HardwareBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit core id allocator
    pub fn with_allocator(allocator: CpuCoreAllocator) -> Self {
        Self {
            allocator,
            cpu_cores: Vec::new(),
            levels: Vec::new(),
            main_memory_size: DEFAULT_MAIN_MEMORY_SIZE,
            address_bus_width: DEFAULT_ADDRESS_BUS_WIDTH,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Allocate and register one core
    pub fn add_cpu_core(&mut self) -> CpuCore {
        let core = self.allocator.allocate();
        self.cpu_cores.push(core);
        core
    }

    /// Allocate and register `count` cores
    pub fn add_cpu_cores(&mut self, count: usize) -> Vec<CpuCore> {
        let cores = self.allocator.allocate_many(count);
        self.cpu_cores.extend_from_slice(&cores);
        cores
    }

    /// Append the next cache level (L1 first)
    pub fn add_cache_level(
        &mut self,
        caches: Vec<Cache>,
        cpu_mapping: impl IntoIterator<Item = (usize, CpuCore)>,
    ) -> &mut Self {
        self.levels.push(CacheLevel::new(caches, cpu_mapping));
        self
    }

    pub fn main_memory_size(&mut self, bytes: u64) -> &mut Self {
        self.main_memory_size = bytes;
        self
    }

    pub fn address_bus_width(&mut self, bits: u32) -> &mut Self {
        self.address_bus_width = bits;
        self
    }

    pub fn page_size(&mut self, bytes: u64) -> &mut Self {
        self.page_size = bytes;
        self
    }

    pub fn build(self) -> Result<Hardware> {
        Hardware::new(
            self.cpu_cores,
            self.levels,
            self.main_memory_size,
            self.address_bus_width,
            self.page_size,
        )
    }
}
