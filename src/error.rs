//! Error types for the page-coloring engine

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while deriving colors or assigning them
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Hardware / Geometry Errors
    // =========================================================================
    /// Non-integral cache geometry or a color-class count mismatch
    #[error("Invalid cache geometry: {0}")]
    Geometry(String),

    /// Inconsistent hardware topology
    #[error("Invalid hardware configuration: {0}")]
    HardwareConfig(String),

    /// CPU core referenced by a constraint is not part of the hardware
    #[error("Unknown CPU core: CPU_{0}")]
    UnknownCpuCore(u32),

    // =========================================================================
    // Memory Consumer Errors
    // =========================================================================
    /// Memory consumer rejected at construction
    #[error("Invalid memory consumer {name}: {reason}")]
    InvalidConsumer { name: String, reason: String },

    /// Memory consumer not registered in the system
    #[error("Unknown memory consumer: {0}")]
    UnknownConsumer(String),

    /// Address space does not match the consumer's memory size or overlaps
    #[error("Invalid address space for {consumer}: {reason}")]
    AddressSpace { consumer: String, reason: String },

    // =========================================================================
    // Assignment Precondition Errors
    // =========================================================================
    /// Consumer is not a member of exactly one cache isolation domain
    #[error("Memory consumer {consumer} is a member of {count} cache isolation domains, expected exactly one")]
    DomainMembership { consumer: String, count: usize },

    /// Executor has no CPU affinity constraint
    #[error("Executor {executor} has no CPU affinity constraint")]
    MissingAffinity { executor: String },

    /// CPU affinity and CPU access constraints contradict each other
    #[error("Inconsistent constraints: {0}")]
    InconsistentConstraints(String),

    /// Consumer already holds colors where the strategy requires none
    #[error("Memory consumer {consumer} already holds colors; reset before assigning")]
    AlreadyColored { consumer: String },

    // =========================================================================
    // Assignment Errors
    // =========================================================================
    /// No further distinct color available for a request
    #[error("Color exhaustion: {0}")]
    ColorExhaustion(String),

    /// Strategy exists in the model but has no specified behavior
    #[error("Assignment strategy '{0}' is not specified")]
    UnspecifiedStrategy(String),

    // =========================================================================
    // Address Map Errors
    // =========================================================================
    /// Persisted address map cannot be used for this hardware
    #[error("Address map at {} is unusable: {}", .path.display(), .reason)]
    AddressMapCorrupt { path: PathBuf, reason: String },

    /// Address map construction was cancelled
    #[error("Address map construction cancelled after {pages_done} pages")]
    Cancelled { pages_done: u64 },

    // =========================================================================
    // Configuration / I/O Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is a precondition failure raised before any
    /// assignment work was done
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::DomainMembership { .. }
                | Error::MissingAffinity { .. }
                | Error::InconsistentConstraints(_)
                | Error::AlreadyColored { .. }
                | Error::UnknownConsumer(_)
                | Error::UnknownCpuCore(_)
        )
    }
}
