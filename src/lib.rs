//! Page Coloring - Cache Partitioning for Separation Kernels
//!
//! Decides which physical memory pages each kernel, subject and channel of a
//! separation-kernel system may use, so that consumers in different isolation
//! domains never contend for the same cache sets.
//!
//! # Pipeline
//!
//! ```text
//! Hardware ──▶ Cache colors ──▶ Page colors ──▶ System page colors
//!                                   │                  │
//!                             Address map        ColorAssigner ──▶ Assignment
//! ```
//!
//! # Modules
//!
//! - [`hardware`] - CPU cores, cache levels, index functions
//! - [`color`] - cache colors, page colors, system page colors
//! - [`consumer`] - kernels, subjects and channels
//! - [`system`] - color universe derivation and the address map
//! - [`assigner`] - assignment strategies and solvers
//! - [`config`] - YAML system descriptions
//! - [`error`] - Error types

pub mod assigner;
pub mod color;
pub mod config;
pub mod consumer;
pub mod error;
pub mod hardware;
pub mod system;

// Re-export commonly used types
pub use assigner::{Assignment, AssignmentStrategy, ColorAssigner, ColorSolver};
pub use color::{CacheColor, PageColor, SystemPageColor, SystemPageColorId};
pub use config::ColoringConfig;
pub use consumer::{ConsumerId, ConsumerKind, Consumers, MemoryConsumer};
pub use error::{Error, Result};
pub use hardware::{Cache, CpuCore, Hardware, HardwareBuilder};
pub use system::{AddressMap, AddressMapOptions, AddressMapStore, System};

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for unit tests

    use crate::consumer::Consumers;
    use crate::hardware::{Cache, Hardware, HardwareBuilder};

    /// Two cores, 1 MiB of memory: flushed private L1 (1 color), private L2
    /// (8 colors), shared L3 (32 colors)
    pub fn small_hardware() -> Hardware {
        let mut builder = HardwareBuilder::new();
        let cores = builder.add_cpu_cores(2);

        let private = |capacity: u64, level: usize, flushed: bool| -> Vec<Cache> {
            (0..2)
                .map(|i| {
                    Cache::new(capacity, 8, 64, 4096)
                        .unwrap()
                        .with_name(format!("L{}_{}", level, i))
                        .flushed(flushed)
                })
                .collect()
        };

        builder.add_cache_level(private(32 * 1024, 1, true), [(0, cores[0]), (1, cores[1])]);
        builder.add_cache_level(private(256 * 1024, 2, false), [(0, cores[0]), (1, cores[1])]);
        builder.add_cache_level(
            vec![Cache::new(2 * 1024 * 1024, 16, 64, 4096)
                .unwrap()
                .with_name("L3")
                .shared(true)],
            [(0, cores[0]), (0, cores[1])],
        );
        builder.main_memory_size(1024 * 1024);
        builder.build().unwrap()
    }

    /// Kernel, Linux (8 pages) and Crypto with a channel in each direction
    pub fn small_consumers() -> Consumers {
        let mut consumers = Consumers::new(4096);
        consumers.add_kernel("Kernel", 4096).unwrap();
        let linux = consumers.add_subject("Linux", 8 * 4096).unwrap();
        let crypto = consumers.add_subject("Crypto", 4096).unwrap();
        consumers
            .add_channel("Linux->Crypto", 4096, linux, &[crypto])
            .unwrap();
        consumers
            .add_channel("Crypto->Linux", 4096, crypto, &[linux])
            .unwrap();
        consumers
    }
}
