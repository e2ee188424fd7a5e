//! Page Coloring CLI
//!
//! Reads a YAML system description, derives the color universe, runs the
//! configured assignment strategy and prints the result as JSON.
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────────┐    ┌──────────┐
//! │  Config  │───▶│  System  │───▶│ColorAssigner │───▶│  Report  │
//! │  (YAML)  │    │ (colors) │    │  (strategy)  │    │  (JSON)  │
//! └──────────┘    └──────────┘    └──────────────┘    └──────────┘
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use page_coloring::assigner::{solver_by_name, AssignmentStrategy, ColoringFacts};
use page_coloring::system::AddressMapProgress;
use page_coloring::{Assignment, ColorAssigner, ColoringConfig, SystemPageColorId, System};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Page Coloring - cache partitioning for separation kernels
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// System description (YAML)
    #[arg(env = "PAGE_COLORING_CONFIG")]
    config: PathBuf,

    /// Build the page-address to page-color map before assigning
    #[arg(long)]
    build_address_map: bool,

    /// Write the cache-isolation fact model as JSON for an external solver
    #[arg(long)]
    export_facts: Option<PathBuf>,

    /// Worker threads for the address map
    #[arg(long, env = "PAGE_COLORING_THREADS")]
    threads: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Serialize)]
struct ConsumerReport {
    name: String,
    kind: page_coloring::ConsumerKind,
    memory_size: u64,
    min_page_colors: u64,
    colors: Vec<SystemPageColorId>,
}

#[derive(Debug, Serialize)]
struct Report {
    hardware_fingerprint: String,
    strategy: String,
    system_page_colors: usize,
    used_colors: usize,
    unassigned_colors: usize,
    /// L1 first
    used_cache_colors_per_level: Vec<usize>,
    consumers: Vec<ConsumerReport>,
}

impl Report {
    fn new(system: &System, strategy: &str, assignment: &Assignment) -> Self {
        let consumers = system
            .consumers()
            .iter()
            .map(|c| ConsumerReport {
                name: c.name().to_string(),
                kind: c.kind(),
                memory_size: c.memory_size(),
                min_page_colors: system.min_page_colors(c),
                colors: assignment.colors_of(c.id()),
            })
            .collect();

        Self {
            hardware_fingerprint: system.hardware().fingerprint().to_string(),
            strategy: strategy.to_string(),
            system_page_colors: system.system_page_colors().len(),
            used_colors: assignment.number_of_used_colors(),
            unassigned_colors: assignment.unassigned().len(),
            used_cache_colors_per_level: assignment.used_cache_colors_per_level(system),
            consumers,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting page coloring");
    info!("  Config: {}", args.config.display());

    let config = ColoringConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let mut system = config
        .build_system(args.threads)
        .context("failed to build system")?;

    info!(
        page_colors = system.page_colors().len(),
        system_page_colors = system.system_page_colors().len(),
        consumers = system.consumers().len(),
        "Color universe ready"
    );

    if args.build_address_map && system.cached_address_map().is_none() {
        let options = config
            .address_map_options(args.threads)
            .with_progress(|p: AddressMapProgress| {
                tracing::debug!(done = p.pages_done, total = p.pages_total, "Address map progress");
            });
        let map = system
            .build_address_map_with(&options)
            .context("failed to build address map")?;
        info!(pages = map.total_pages(), "Address map built");
    }

    let strategy = config
        .build_strategy(system.hardware(), system.consumers())
        .context("invalid strategy")?;
    let solver = solver_by_name(config.solver_name())?;

    if let Some(path) = &args.export_facts {
        let AssignmentStrategy::CacheIsolationDomains { domains, affinity, .. } = &strategy else {
            anyhow::bail!("--export-facts requires the cache_isolation_domains strategy");
        };
        let facts = ColoringFacts::from_system(&system, domains, affinity);
        std::fs::write(path, serde_json::to_vec_pretty(&facts)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "Fact model exported");
    }

    let assignment = ColorAssigner::assign_with(&system, &strategy, solver.as_ref())
        .with_context(|| format!("{} assignment failed", strategy.name()))?;
    ColorAssigner::apply(&mut system, &assignment)?;

    let report = Report::new(&system, strategy.name(), &assignment);
    println!("{}", serde_json::to_string_pretty(&report)?);

    info!(
        used = report.used_colors,
        unassigned = report.unassigned_colors,
        "Assignment applied"
    );
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr; stdout carries the report
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
