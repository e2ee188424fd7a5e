//! Reference Topologies
//!
//! Ready-made hardware descriptions of common quad-core desktop parts, used by
//! the CLI defaults and the test suites.

use tracing::debug;

use super::{Cache, CpuCore, Hardware, HardwareBuilder, IndexFunction};
use crate::error::Result;

const PAGE_SIZE: u64 = 4096;
const CACHELINE: u64 = 64;
const ADDRESS_BUS_WIDTH: u32 = 64;

const L1_CAPACITY: u64 = 32 * 1024;
const L1_WAYS: u64 = 8;
const L2_CAPACITY: u64 = 256 * 1024;
const L2_WAYS: u64 = 8;
const L3_CAPACITY: u64 = 6 * 1024 * 1024;
const L3_WAYS: u64 = 12;

fn private_l1(cores: &[CpuCore]) -> Result<Vec<Cache>> {
    cores
        .iter()
        .enumerate()
        .map(|(i, _)| {
            Ok(Cache::new(L1_CAPACITY, L1_WAYS, CACHELINE, PAGE_SIZE)?
                .with_name(format!("L1_{}", i))
                .flushed(true))
        })
        .collect()
}

/// Four cores with private flushed 32 KiB L1, private 256 KiB L2 and a shared
/// 6 MiB 12-way four-slice L3 with hashed indexing.
pub fn reference_quad_core(main_memory_size: u64) -> Result<Hardware> {
    let mut builder = HardwareBuilder::new();
    let cores = builder.add_cpu_cores(4);

    builder.add_cache_level(private_l1(&cores)?, cores.iter().enumerate().map(|(i, c)| (i, *c)));

    let l2 = cores
        .iter()
        .enumerate()
        .map(|(i, _)| {
            Ok(Cache::new(L2_CAPACITY, L2_WAYS, CACHELINE, PAGE_SIZE)?.with_name(format!("L2_{}", i)))
        })
        .collect::<Result<Vec<_>>>()?;
    builder.add_cache_level(l2, cores.iter().enumerate().map(|(i, c)| (i, *c)));

    let l3_index =
        IndexFunction::sliced_last_level(L3_CAPACITY, CACHELINE, L3_WAYS, ADDRESS_BUS_WIDTH)?;
    let l3 = Cache::new(L3_CAPACITY, L3_WAYS, CACHELINE, PAGE_SIZE)?
        .with_name("L3_0")
        .shared(true)
        .with_index_function(l3_index);
    builder.add_cache_level(vec![l3], cores.iter().map(|c| (0, *c)));

    builder
        .main_memory_size(main_memory_size)
        .address_bus_width(ADDRESS_BUS_WIDTH)
        .page_size(PAGE_SIZE);

    debug!(main_memory_size, "Building reference quad-core topology");
    builder.build()
}

/// Four cores with private flushed L1, two 256 KiB L2 caches each shared by a
/// pair of cores, and a shared linear 6 MiB L3.
pub fn paired_l2_quad_core(main_memory_size: u64) -> Result<Hardware> {
    let mut builder = HardwareBuilder::new();
    let cores = builder.add_cpu_cores(4);

    builder.add_cache_level(private_l1(&cores)?, cores.iter().enumerate().map(|(i, c)| (i, *c)));

    let l2 = (0..2)
        .map(|i| {
            Ok(Cache::new(L2_CAPACITY, L2_WAYS, CACHELINE, PAGE_SIZE)?
                .with_name(format!("L2_{}", i))
                .shared(true))
        })
        .collect::<Result<Vec<_>>>()?;
    builder.add_cache_level(l2, cores.iter().enumerate().map(|(i, c)| (i / 2, *c)));

    let l3 = Cache::new(L3_CAPACITY, L3_WAYS, CACHELINE, PAGE_SIZE)?
        .with_name("L3_0")
        .shared(true);
    builder.add_cache_level(vec![l3], cores.iter().map(|c| (0, *c)));

    builder
        .main_memory_size(main_memory_size)
        .address_bus_width(ADDRESS_BUS_WIDTH)
        .page_size(PAGE_SIZE);

    debug!(main_memory_size, "Building paired-L2 quad-core topology");
    builder.build()
}
