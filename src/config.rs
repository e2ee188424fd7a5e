//! Declarative System Description
//!
//! A YAML file describing the hardware, the memory consumers and the
//! assignment strategy. Consumers are referenced by name and CPU cores by
//! their index in the hardware's core list.
//!
//! ```yaml
//! hardware:
//!   preset: reference_quad_core
//!   main_memory_size: 67108864
//! consumers:
//!   - { name: Linux, kind: subject, memory_size: 65536 }
//!   - { name: Crypto, kind: subject, memory_size: 4096 }
//! channels:
//!   - { name: Linux->Crypto, memory_size: 4096, writer: Linux, readers: [Crypto] }
//! strategy:
//!   kind: cache_isolation_domains
//!   domains: [[Linux, Linux->Crypto], [Crypto]]
//!   affinity: { Linux: [0, 1], Crypto: [2] }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::assigner::{
    AssignmentStrategy, CacheIsolationDomain, CpuAccessConstraints, ExecutorCpuConstraints,
    InterferenceDomain, SecurityLabel, SecurityLabels,
};
use crate::consumer::{AddressRange, ConsumerId, Consumers};
use crate::error::{Error, Result};
use crate::hardware::{
    presets, Cache, CpuCore, Hardware, HardwareBuilder, IndexFunction, DEFAULT_ADDRESS_BUS_WIDTH,
    DEFAULT_MAIN_MEMORY_SIZE, DEFAULT_PAGE_SIZE,
};
use crate::system::{AddressMapOptions, AddressMapStore, System};

// =============================================================================
// Hardware
// =============================================================================

/// Built-in topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    ReferenceQuadCore,
    PairedL2QuadCore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexFunctionKind {
    #[default]
    Linear,
    /// Four-slice hashed last-level cache
    SlicedHash,
}

/// One cache level: geometry, number of instances and core mapping
#[derive(Debug, Clone, Deserialize)]
pub struct LevelConfig {
    pub total_capacity: u64,
    pub associativity: u64,
    #[serde(default = "default_cacheline")]
    pub cacheline_capacity: u64,

    /// Number of cache instances on this level
    #[serde(default = "default_instances")]
    pub instances: usize,

    /// Cache instance serving each core, by core index. Defaults to one
    /// instance per core, or a single instance serving every core.
    #[serde(default)]
    pub cpu_mapping: Option<Vec<usize>>,

    #[serde(default)]
    pub shared: Option<bool>,

    /// Cleared on context switch
    #[serde(default)]
    pub flushed: bool,

    #[serde(default)]
    pub index_function: IndexFunctionKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HardwareConfig {
    /// Use a built-in topology; `cores` and `levels` are then ignored
    #[serde(default)]
    pub preset: Option<Preset>,

    #[serde(default)]
    pub cores: usize,

    #[serde(default)]
    pub levels: Vec<LevelConfig>,

    #[serde(default = "default_main_memory_size")]
    pub main_memory_size: u64,

    #[serde(default = "default_address_bus_width")]
    pub address_bus_width: u32,

    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

// =============================================================================
// Consumers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Kernel,
    Subject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    pub name: String,
    pub kind: ExecutorKind,
    pub memory_size: u64,
    #[serde(default)]
    pub address_space: Option<Vec<AddressRange>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub memory_size: u64,
    pub writer: String,
    pub readers: Vec<String>,
    #[serde(default)]
    pub address_space: Option<Vec<AddressRange>>,
}

// =============================================================================
// Strategy
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    Naive,
    InterferenceDomains {
        domains: Vec<Vec<String>>,
    },
    CacheIsolationDomains {
        domains: Vec<Vec<String>>,
        /// Executor name -> core indices
        affinity: BTreeMap<String, Vec<usize>>,
        /// Core index -> executor names
        #[serde(default)]
        access: Option<BTreeMap<usize, Vec<String>>>,
        #[serde(default = "default_solver")]
        solver: String,
    },
    SecurityLabels {
        labels: BTreeMap<String, SecurityLabel>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddressMapConfig {
    /// Directory of persisted address maps
    pub dir: PathBuf,
    /// Worker threads, defaults to available parallelism
    #[serde(default)]
    pub threads: Option<usize>,
}

/// Complete system description
#[derive(Debug, Clone, Deserialize)]
pub struct ColoringConfig {
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub address_map: Option<AddressMapConfig>,
}

fn default_cacheline() -> u64 {
    64
}

fn default_instances() -> usize {
    1
}

fn default_main_memory_size() -> u64 {
    DEFAULT_MAIN_MEMORY_SIZE
}

fn default_address_bus_width() -> u32 {
    DEFAULT_ADDRESS_BUS_WIDTH
}

fn default_page_size() -> u64 {
    DEFAULT_PAGE_SIZE
}

fn default_solver() -> String {
    "greedy".to_string()
}

// =============================================================================
// Building
// =============================================================================

impl ColoringConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    #[instrument(skip_all)]
    pub fn build_hardware(&self) -> Result<Hardware> {
        let hw = &self.hardware;
        if let Some(preset) = hw.preset {
            debug!(?preset, "Using hardware preset");
            return match preset {
                Preset::ReferenceQuadCore => presets::reference_quad_core(hw.main_memory_size),
                Preset::PairedL2QuadCore => presets::paired_l2_quad_core(hw.main_memory_size),
            };
        }

        if hw.cores == 0 {
            return Err(Error::Config("hardware needs `cores` or a `preset`".to_string()));
        }

        let mut builder = HardwareBuilder::new();
        let cores = builder.add_cpu_cores(hw.cores);

        for (i, level) in hw.levels.iter().enumerate() {
            let number = i + 1;
            let index_function = match level.index_function {
                IndexFunctionKind::Linear => IndexFunction::linear(),
                IndexFunctionKind::SlicedHash => IndexFunction::sliced_last_level(
                    level.total_capacity,
                    level.cacheline_capacity,
                    level.associativity,
                    hw.address_bus_width,
                )?,
            };
            let shared = level.shared.unwrap_or(level.instances < hw.cores);

            let caches = (0..level.instances)
                .map(|instance| {
                    Ok(Cache::new(
                        level.total_capacity,
                        level.associativity,
                        level.cacheline_capacity,
                        hw.page_size,
                    )?
                    .with_name(format!("L{}_{}", number, instance))
                    .shared(shared)
                    .flushed(level.flushed)
                    .with_index_function(index_function))
                })
                .collect::<Result<Vec<_>>>()?;

            let mapping = match &level.cpu_mapping {
                Some(mapping) if mapping.len() == cores.len() => mapping.clone(),
                Some(mapping) => {
                    return Err(Error::Config(format!(
                        "L{} cpu_mapping lists {} cores, hardware has {}",
                        number,
                        mapping.len(),
                        cores.len()
                    )))
                }
                None if level.instances == cores.len() => (0..cores.len()).collect(),
                None if level.instances == 1 => vec![0; cores.len()],
                None => {
                    return Err(Error::Config(format!(
                        "L{} has {} instances for {} cores; cpu_mapping is required",
                        number,
                        level.instances,
                        cores.len()
                    )))
                }
            };

            builder.add_cache_level(
                caches,
                mapping.into_iter().zip(cores.iter().copied()),
            );
        }

        builder
            .main_memory_size(hw.main_memory_size)
            .address_bus_width(hw.address_bus_width)
            .page_size(hw.page_size);
        builder.build()
    }

    /// Register consumers and channels in file order
    pub fn build_consumers(&self, page_size: u64) -> Result<Consumers> {
        let mut consumers = Consumers::new(page_size);

        for c in &self.consumers {
            let id = match c.kind {
                ExecutorKind::Kernel => consumers.add_kernel(c.name.clone(), c.memory_size)?,
                ExecutorKind::Subject => consumers.add_subject(c.name.clone(), c.memory_size)?,
            };
            set_address_space(&mut consumers, id, c.address_space.as_deref())?;
        }

        for ch in &self.channels {
            let writer = consumers.require(&ch.writer)?;
            let readers = ch
                .readers
                .iter()
                .map(|r| consumers.require(r))
                .collect::<Result<Vec<_>>>()?;
            let id = consumers.add_channel(ch.name.clone(), ch.memory_size, writer, &readers)?;
            set_address_space(&mut consumers, id, ch.address_space.as_deref())?;
        }

        Ok(consumers)
    }

    /// Resolve names and core indices of the strategy section
    pub fn build_strategy(&self, hardware: &Hardware, consumers: &Consumers) -> Result<AssignmentStrategy> {
        let names = |group: &[String]| -> Result<Vec<ConsumerId>> {
            group.iter().map(|n| consumers.require(n)).collect()
        };
        let core = |index: usize| -> Result<CpuCore> {
            hardware.cpu_cores().get(index).copied().ok_or_else(|| {
                Error::Config(format!(
                    "core index {} out of range, hardware has {} cores",
                    index,
                    hardware.cpu_cores().len()
                ))
            })
        };

        Ok(match &self.strategy {
            StrategyConfig::Naive => AssignmentStrategy::Naive,
            StrategyConfig::InterferenceDomains { domains } => AssignmentStrategy::InterferenceDomains(
                domains
                    .iter()
                    .map(|d| names(d.as_slice()).map(InterferenceDomain::new))
                    .collect::<Result<_>>()?,
            ),
            StrategyConfig::CacheIsolationDomains {
                domains,
                affinity,
                access,
                ..
            } => {
                let domains = domains
                    .iter()
                    .map(|d| names(d.as_slice()).map(CacheIsolationDomain::new))
                    .collect::<Result<_>>()?;

                let mut cpu_affinity = ExecutorCpuConstraints::new();
                for (executor, cores) in affinity {
                    let cpus = cores.iter().map(|i| core(*i)).collect::<Result<Vec<_>>>()?;
                    cpu_affinity.allow(consumers.require(executor)?, cpus);
                }

                let access = match access {
                    Some(access) => {
                        let mut constraints = CpuAccessConstraints::new();
                        for (index, executors) in access {
                            constraints.grant(core(*index)?, names(executors.as_slice())?);
                        }
                        Some(constraints)
                    }
                    None => None,
                };

                AssignmentStrategy::CacheIsolationDomains {
                    domains,
                    affinity: cpu_affinity,
                    access,
                }
            }
            StrategyConfig::SecurityLabels { labels } => {
                let mut resolved = SecurityLabels::new();
                for (name, label) in labels {
                    resolved.label(consumers.require(name)?, label.clone());
                }
                AssignmentStrategy::SecurityLabels(resolved)
            }
        })
    }

    /// Solver named by the strategy section
    pub fn solver_name(&self) -> &str {
        match &self.strategy {
            StrategyConfig::CacheIsolationDomains { solver, .. } => solver,
            _ => "greedy",
        }
    }

    /// Address map options, with `threads` overriding the file
    pub fn address_map_options(&self, threads: Option<usize>) -> AddressMapOptions {
        let mut options = AddressMapOptions::default();
        if let Some(threads) = threads.or(self.address_map.as_ref().and_then(|a| a.threads)) {
            options.threads = threads.max(1);
        }
        options
    }

    /// Build the system, attaching a persisted address map when a store is
    /// configured
    pub fn build_system(&self, threads: Option<usize>) -> Result<System> {
        let hardware = self.build_hardware()?;
        let consumers = self.build_consumers(hardware.page_size())?;
        match &self.address_map {
            Some(map) => System::with_address_map_store(
                hardware,
                consumers,
                &AddressMapStore::new(&map.dir),
                &self.address_map_options(threads),
            ),
            None => System::new(hardware, consumers),
        }
    }
}

fn set_address_space(
    consumers: &mut Consumers,
    id: ConsumerId,
    ranges: Option<&[AddressRange]>,
) -> Result<()> {
    if let (Some(ranges), Some(consumer)) = (ranges, consumers.get_mut(id)) {
        consumer.set_address_space(ranges.to_vec())?;
    }
    Ok(())
}
