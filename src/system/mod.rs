//! Color Universe
//!
//! [`System`] derives every color of a [`Hardware`] description and owns the
//! memory consumers that receive them:
//!
//! 1. cache colors per level ([`build_cache_colors`])
//! 2. page colors across levels ([`build_page_colors`])
//! 3. system page colors per CPU core ([`build_system_page_colors`])
//! 4. the page-address to page-color map ([`build_full_address_map`]), built
//!    lazily or loaded from an [`AddressMapStore`]
//!
//! Derivation is a pure function of the hardware: the same hardware always
//! yields the same colors with the same ids.

pub mod address_map;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::color::{CacheColorTable, PageColor, SystemPageColor, SystemPageColorId};
use crate::consumer::{Consumers, MemoryConsumer};
use crate::error::{Error, Result};
use crate::hardware::Hardware;

pub use address_map::{build_full_address_map, AddressMap, AddressMapOptions, AddressMapProgress};
pub use store::{AddressMapStore, ADDRESS_MAP_FORMAT_VERSION};

// =============================================================================
// Derivation
// =============================================================================

/// Discover the cache colors of every level.
///
/// Probes the first `number_of_colors` pages of each level's representative
/// cache. Finding fewer distinct classes than the cache's color count is a
/// [`Error::Geometry`] error.
#[instrument(skip_all, fields(levels = hardware.number_of_levels()))]
pub fn build_cache_colors(hardware: &Hardware) -> Result<Vec<CacheColorTable>> {
    let page_size = hardware.page_size();

    hardware
        .cache_information()
        .into_iter()
        .enumerate()
        .map(|(i, cache)| {
            let level = i + 1;
            let expected = cache.number_of_colors();
            let mut table = CacheColorTable::new(level);

            for page in 0..expected {
                table.insert_if_absent(cache.affected_sets(page * page_size));
            }

            if table.len() as u64 != expected {
                return Err(Error::Geometry(format!(
                    "L{} should have {} cache colors, found {} distinct classes",
                    level,
                    expected,
                    table.len()
                )));
            }

            debug!(level, colors = table.len(), "Discovered cache colors");
            Ok(table)
        })
        .collect()
}

/// Per-level cache color ids of the page starting at `address`
pub(crate) fn page_color_tuple(
    hardware: &Hardware,
    cache_colors: &[CacheColorTable],
    address: u64,
) -> Result<Vec<usize>> {
    hardware
        .cache_information()
        .into_iter()
        .zip(cache_colors)
        .map(|(cache, table)| {
            let sets = cache.affected_sets(address);
            table.id_of(&sets).ok_or_else(|| {
                Error::Geometry(format!(
                    "page {:#x} touches an undiscovered L{} set class",
                    address,
                    table.level()
                ))
            })
        })
        .collect()
}

/// Compose page colors from the first `number_of_colors` pages of the last
/// level cache, in probing order.
#[instrument(skip_all)]
pub fn build_page_colors(
    hardware: &Hardware,
    cache_colors: &[CacheColorTable],
) -> Result<Vec<Arc<PageColor>>> {
    let page_size = hardware.page_size();
    let probes = hardware.last_level_cache().number_of_colors();

    let mut seen: HashMap<Vec<usize>, usize> = HashMap::new();
    let mut page_colors = Vec::new();

    for page in 0..probes {
        let tuple = page_color_tuple(hardware, cache_colors, page * page_size)?;
        if seen.contains_key(&tuple) {
            continue;
        }
        let index = page_colors.len();
        seen.insert(tuple.clone(), index);
        page_colors.push(Arc::new(PageColor::new(index, tuple)));
    }

    debug!(page_colors = page_colors.len(), "Composed page colors");
    Ok(page_colors)
}

/// Every page color on every core, sorted so the core cycles fastest
pub fn build_system_page_colors(
    hardware: &Hardware,
    page_colors: &[Arc<PageColor>],
) -> Vec<SystemPageColor> {
    let mut colors: Vec<SystemPageColor> = page_colors
        .iter()
        .flat_map(|pc| {
            hardware
                .cpu_cores()
                .iter()
                .map(move |cpu| SystemPageColor::new(*cpu, pc.clone()))
        })
        .collect();
    colors.sort();
    colors
}

// =============================================================================
// System
// =============================================================================

/// Hardware, its derived colors and the memory consumers to color
#[derive(Debug, Clone)]
pub struct System {
    hardware: Hardware,
    cache_colors: Vec<CacheColorTable>,
    page_colors: Vec<Arc<PageColor>>,
    page_color_lookup: HashMap<Vec<usize>, usize>,
    system_page_colors: Vec<SystemPageColor>,
    system_page_color_index: HashMap<SystemPageColorId, usize>,
    address_map: OnceCell<AddressMap>,
    consumers: Consumers,
}

impl System {
    /// Derive the color universe of `hardware`.
    ///
    /// The address map is not built here; see [`System::address_map`].
    #[instrument(skip_all, fields(fingerprint = %hardware.fingerprint()))]
    pub fn new(hardware: Hardware, consumers: Consumers) -> Result<Self> {
        if consumers.page_size() != hardware.page_size() {
            return Err(Error::Config(format!(
                "consumers use page size {}, hardware uses {}",
                consumers.page_size(),
                hardware.page_size()
            )));
        }

        let cache_colors = build_cache_colors(&hardware)?;
        let page_colors = build_page_colors(&hardware, &cache_colors)?;
        let system_page_colors = build_system_page_colors(&hardware, &page_colors);

        let page_color_lookup = page_colors
            .iter()
            .map(|pc| (pc.cache_color_ids().to_vec(), pc.index()))
            .collect();
        let system_page_color_index = system_page_colors
            .iter()
            .enumerate()
            .map(|(i, spc)| (spc.id(), i))
            .collect();

        info!(
            cache_colors = ?cache_colors.iter().map(CacheColorTable::len).collect::<Vec<_>>(),
            page_colors = page_colors.len(),
            system_page_colors = system_page_colors.len(),
            consumers = consumers.len(),
            "System color universe derived"
        );

        Ok(Self {
            hardware,
            cache_colors,
            page_colors,
            page_color_lookup,
            system_page_colors,
            system_page_color_index,
            address_map: OnceCell::new(),
            consumers,
        })
    }

    /// Derive the color universe and attach an address map from `store`,
    /// building and persisting it when missing or unusable.
    pub fn with_address_map_store(
        hardware: Hardware,
        consumers: Consumers,
        store: &AddressMapStore,
        options: &AddressMapOptions,
    ) -> Result<Self> {
        let system = Self::new(hardware, consumers)?;

        match store.load(&system.hardware, &system.page_colors) {
            Ok(Some(map)) => {
                let _ = system.address_map.set(map);
                return Ok(system);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Discarding persisted address map"),
        }

        let map = system.build_address_map_with(options)?;
        store.store(map, &system.page_colors)?;
        Ok(system)
    }

    pub fn hardware(&self) -> &Hardware {
        &self.hardware
    }

    /// Cache color tables, L1 first
    pub fn cache_colors(&self) -> &[CacheColorTable] {
        &self.cache_colors
    }

    pub fn page_colors(&self) -> &[Arc<PageColor>] {
        &self.page_colors
    }

    pub fn page_color(&self, index: usize) -> Option<&PageColor> {
        self.page_colors.get(index).map(|pc| pc.as_ref())
    }

    /// All system page colors, core cycling fastest
    pub fn system_page_colors(&self) -> &[SystemPageColor] {
        &self.system_page_colors
    }

    pub fn system_page_color(&self, id: SystemPageColorId) -> Option<&SystemPageColor> {
        self.system_page_color_index
            .get(&id)
            .map(|&i| &self.system_page_colors[i])
    }

    pub fn contains_color(&self, id: SystemPageColorId) -> bool {
        self.system_page_color_index.contains_key(&id)
    }

    /// Page color of the page containing `address`
    pub fn page_color_of(&self, address: u64) -> Result<&PageColor> {
        let page_address = address - address % self.hardware.page_size();
        let tuple = page_color_tuple(&self.hardware, &self.cache_colors, page_address)?;
        self.page_color_lookup
            .get(&tuple)
            .map(|&i| self.page_colors[i].as_ref())
            .ok_or_else(|| {
                Error::Geometry(format!(
                    "page {:#x} maps to undiscovered page color {:?}",
                    page_address, tuple
                ))
            })
    }

    /// Address map, built on first use with default options
    pub fn address_map(&self) -> Result<&AddressMap> {
        self.build_address_map_with(&AddressMapOptions::default())
    }

    /// Address map, built on first use with `options`
    pub fn build_address_map_with(&self, options: &AddressMapOptions) -> Result<&AddressMap> {
        self.address_map.get_or_try_init(|| {
            build_full_address_map(&self.hardware, &self.cache_colors, &self.page_colors, options)
        })
    }

    /// Address map if it has been built or loaded
    pub fn cached_address_map(&self) -> Option<&AddressMap> {
        self.address_map.get()
    }

    pub fn consumers(&self) -> &Consumers {
        &self.consumers
    }

    pub fn consumers_mut(&mut self) -> &mut Consumers {
        &mut self.consumers
    }

    /// Fewest distinct page colors that can hold all of `consumer`'s pages
    pub fn min_page_colors(&self, consumer: &MemoryConsumer) -> u64 {
        let pages = consumer.memory_size() / self.hardware.page_size();
        let total_pages = self.hardware.number_of_pages();
        let page_colors = self.page_colors.len() as u64;
        if total_pages == 0 {
            return 0;
        }
        let scaled = u128::from(pages) * u128::from(page_colors);
        scaled.div_ceil(u128::from(total_pages)) as u64
    }
}
