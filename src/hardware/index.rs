//! Cache Index Functions
//!
//! An index function maps a physical byte address to the id of the cache set
//! that holds it. Two functions are provided:
//!
//! - [`IndexFunction::Linear`] - sequential mapping, the default for private
//!   caches: `floor(address / cacheline_capacity) mod number_of_sets`.
//! - [`IndexFunction::SlicedHash`] - complex addressing of a multi-slice
//!   last-level cache. A XOR hash over selected address bits picks one of
//!   [`NUMBER_OF_SLICES`] slices; the set inside the slice is linear.
//!
//! Color equivalence classes depend on these functions bit for bit, so the
//! hash bit selection below must not change without invalidating every
//! persisted address map.

use serde::Serialize;

use crate::error::{Error, Result};

/// Number of slices of a sliced last-level cache
pub const NUMBER_OF_SLICES: u64 = 4;

/// Address bits XORed into the low slice-selection bit
pub const SLICE_HASH_BITS_0: [u32; 19] = [
    6, 10, 12, 14, 16, 17, 18, 20, 22, 24, 25, 26, 27, 28, 30, 32, 33, 35, 36,
];

/// Address bits XORed into the high slice-selection bit
pub const SLICE_HASH_BITS_1: [u32; 19] = [
    7, 11, 13, 15, 17, 19, 20, 21, 22, 23, 24, 26, 28, 29, 31, 33, 34, 35, 37,
];

// =============================================================================
// Index Function
// =============================================================================

/// Address to cache-set mapping of one cache level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexFunction {
    /// `floor(address / cacheline_capacity) mod number_of_sets`
    Linear,
    /// Slice-hashed complex addressing
    SlicedHash(SliceHash),
}

impl Default for IndexFunction {
    fn default() -> Self {
        IndexFunction::Linear
    }
}

impl IndexFunction {
    /// Default sequential index function
    pub fn linear() -> Self {
        IndexFunction::Linear
    }

    /// Complex index function of a four-slice last-level cache
    pub fn sliced_last_level(
        total_capacity: u64,
        cacheline_capacity: u64,
        associativity: u64,
        address_bus_width: u32,
    ) -> Result<Self> {
        SliceHash::new(
            total_capacity,
            cacheline_capacity,
            associativity,
            address_bus_width,
        )
        .map(IndexFunction::SlicedHash)
    }

    /// Evaluate the function for `address` on a cache with the given geometry.
    ///
    /// The sliced variant carries its own geometry and ignores the arguments.
    pub fn set_index(&self, address: u64, cacheline_capacity: u64, number_of_sets: u64) -> u64 {
        match self {
            IndexFunction::Linear => (address / cacheline_capacity) % number_of_sets,
            IndexFunction::SlicedHash(hash) => hash.set_index(address),
        }
    }

    /// Short human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            IndexFunction::Linear => "linear",
            IndexFunction::SlicedHash(_) => "sliced-hash",
        }
    }
}

// =============================================================================
// Slice Hash
// =============================================================================

/// Multi-slice last-level cache index function.
///
/// The slice id is `h0 + 2 * h1` where `h0` and `h1` are the parities of the
/// address bits in [`SLICE_HASH_BITS_0`] and [`SLICE_HASH_BITS_1`] (bits at or
/// above the address bus width are ignored). The returned set id is
/// `slice * number_of_sets + (floor(address / cacheline_capacity) mod sets_per_slice)`
/// which keeps ids of different slices disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SliceHash {
    number_of_sets: u64,
    sets_per_slice: u64,
    cacheline_capacity: u64,
    address_bus_width: u32,
    mask_0: u64,
    mask_1: u64,
}

impl SliceHash {
    /// Create the hash for a cache of the given geometry
    pub fn new(
        total_capacity: u64,
        cacheline_capacity: u64,
        associativity: u64,
        address_bus_width: u32,
    ) -> Result<Self> {
        if total_capacity == 0 || cacheline_capacity == 0 || associativity == 0 {
            return Err(Error::Geometry(
                "sliced cache capacity, cacheline capacity and associativity must be positive"
                    .to_string(),
            ));
        }
        if address_bus_width == 0 || address_bus_width > 64 {
            return Err(Error::HardwareConfig(format!(
                "address bus width must be within 1..=64, got {}",
                address_bus_width
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
                "{} bytes are not divisible into sets of {} x {} bytes",
                total_capacity, associativity, cacheline_capacity
            )));
        }
        let number_of_sets = total_capacity / way_bytes;

        if number_of_sets % NUMBER_OF_SLICES != 0 {
            return Err(Error::Geometry(format!(
                "{} sets cannot be split into {} slices",
                number_of_sets, NUMBER_OF_SLICES
            )));
        }

        Ok(Self {
            number_of_sets,
            sets_per_slice: number_of_sets / NUMBER_OF_SLICES,
            cacheline_capacity,
            address_bus_width,
            mask_0: bit_mask(&SLICE_HASH_BITS_0, address_bus_width),
            mask_1: bit_mask(&SLICE_HASH_BITS_1, address_bus_width),
        })
    }

    /// Slice selected by `address`, in `0..NUMBER_OF_SLICES`
    pub fn slice_of(&self, address: u64) -> u64 {
        let h0 = u64::from((address & self.mask_0).count_ones() & 1);
        let h1 = u64::from((address & self.mask_1).count_ones() & 1);
        h0 + 2 * h1
    }

    /// Globally unique set id of `address`
    pub fn set_index(&self, address: u64) -> u64 {
        let intra_slice_set = (address / self.cacheline_capacity) % self.sets_per_slice;
        self.slice_of(address) * self.number_of_sets + intra_slice_set
    }

    /// Union of all address bits that take part in slice selection
    pub fn hash_bits(&self) -> u64 {
        self.mask_0 | self.mask_1
    }

    /// Sets per slice
    pub fn sets_per_slice(&self) -> u64 {
        self.sets_per_slice
    }

    /// Total number of sets of the cache
    pub fn number_of_sets(&self) -> u64 {
        self.number_of_sets
    }
}

fn bit_mask(bits: &[u32], address_bus_width: u32) -> u64 {
    bits.iter()
        .filter(|&&bit| bit < address_bus_width)
        .fold(0u64, |mask, &bit| mask | (1u64 << bit))
}
