//! Exhaustive Address Map
//!
//! Maps every physical page of main memory to its page color. The pass is
//! linear in the number of pages, so it is sharded across threads, can be
//! cancelled, and reports progress. Shards cover contiguous page ranges and
//! are merged in order, keeping every address list ascending.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::page_color_tuple;
use crate::color::{CacheColorTable, PageColor};
use crate::error::{Error, Result};
use crate::hardware::Hardware;

/// Pages processed between cancellation checks and progress reports
pub const CHECK_INTERVAL: u64 = 4096;

// =============================================================================
// Address Map
// =============================================================================

/// Page addresses grouped by page color index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressMap {
    hardware_fingerprint: String,
    page_size: u64,
    addresses: Vec<Vec<u64>>,
}

impl AddressMap {
    pub(crate) fn new(hardware_fingerprint: String, page_size: u64, addresses: Vec<Vec<u64>>) -> Self {
        Self {
            hardware_fingerprint,
            page_size,
            addresses,
        }
    }

    /// Ascending page addresses of the page color at `index`
    pub fn addresses_of(&self, index: usize) -> &[u64] {
        self.addresses.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn number_of_page_colors(&self) -> usize {
        self.addresses.len()
    }

    /// Number of pages across all colors
    pub fn total_pages(&self) -> u64 {
        self.addresses.iter().map(|a| a.len() as u64).sum()
    }

    pub fn hardware_fingerprint(&self) -> &str {
        &self.hardware_fingerprint
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// `(page color index, addresses)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[u64])> {
        self.addresses.iter().enumerate().map(|(i, a)| (i, a.as_slice()))
    }
}

// =============================================================================
// Options
// =============================================================================

/// Progress of an address map build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMapProgress {
    pub pages_done: u64,
    pub pages_total: u64,
}

pub type ProgressCallback = Arc<dyn Fn(AddressMapProgress) + Send + Sync>;

/// Address map build configuration
#[derive(Clone)]
pub struct AddressMapOptions {
    /// Worker threads (at least one)
    pub threads: usize,
    /// Cancels the build between check intervals
    pub cancellation: Option<CancellationToken>,
    /// Called from worker threads as pages complete
    pub progress: Option<ProgressCallback>,
}

impl Default for AddressMapOptions {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            cancellation: None,
            progress: None,
        }
    }
}

impl std::fmt::Debug for AddressMapOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressMapOptions")
            .field("threads", &self.threads)
            .field("cancellable", &self.cancellation.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl AddressMapOptions {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(AddressMapProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }
}

// =============================================================================
// Build
// =============================================================================

/// Compute the page color of every page in main memory.
///
/// Fails with [`Error::Cancelled`] if the token fires, and with
/// [`Error::Geometry`] if a page falls outside the discovered color classes.
#[instrument(skip_all, fields(pages = hardware.number_of_pages(), threads = options.threads))]
pub fn build_full_address_map(
    hardware: &Hardware,
    cache_colors: &[CacheColorTable],
    page_colors: &[Arc<PageColor>],
    options: &AddressMapOptions,
) -> Result<AddressMap> {
    let started = Instant::now();
    let pages_total = hardware.number_of_pages();
    let page_size = hardware.page_size();

    let lookup: HashMap<&[usize], usize> = page_colors
        .iter()
        .map(|pc| (pc.cache_color_ids(), pc.index()))
        .collect();

    let shards = (options.threads.max(1) as u64).min(pages_total.max(1));
    let per_shard = pages_total.div_ceil(shards);
    let pages_done = AtomicU64::new(0);

    debug!(shards, per_shard, "Starting address map build");

    let results = crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = (0..shards)
            .map(|shard| {
                let first = shard * per_shard;
                let last = (first + per_shard).min(pages_total);
                let lookup = &lookup;
                let pages_done = &pages_done;
                scope.spawn(move |_| -> Result<Vec<Vec<u64>>> {
                    let mut local = vec![Vec::new(); page_colors.len()];
                    let mut pending = 0u64;

                    for page in first..last {
                        if pending == CHECK_INTERVAL {
                            let done = pages_done.fetch_add(pending, Ordering::Relaxed) + pending;
                            pending = 0;
                            if options.is_cancelled() {
                                return Err(Error::Cancelled { pages_done: done });
                            }
                            if let Some(progress) = &options.progress {
                                progress(AddressMapProgress {
                                    pages_done: done,
                                    pages_total,
                                });
                            }
                        }

                        let address = page * page_size;
                        let tuple = page_color_tuple(hardware, cache_colors, address)?;
                        let index = lookup.get(tuple.as_slice()).copied().ok_or_else(|| {
                            Error::Geometry(format!(
                                "page {:#x} maps to undiscovered page color {:?}",
                                address, tuple
                            ))
                        })?;
                        local[index].push(address);
                        pending += 1;
                    }

                    let done = pages_done.fetch_add(pending, Ordering::Relaxed) + pending;
                    if let Some(progress) = &options.progress {
                        progress(AddressMapProgress {
                            pages_done: done,
                            pages_total,
                        });
                    }
                    Ok(local)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| Error::Internal("address map worker panicked".to_string()))
                    .and_then(|result| result)
            })
            .collect::<Vec<Result<Vec<Vec<u64>>>>>()
    })
    .map_err(|_| Error::Internal("address map scope panicked".to_string()))?;

    let mut addresses: Vec<Vec<u64>> = vec![Vec::new(); page_colors.len()];
    for shard in results {
        for (index, mut shard_addresses) in shard?.into_iter().enumerate() {
            addresses[index].append(&mut shard_addresses);
        }
    }

    if options.is_cancelled() {
        return Err(Error::Cancelled {
            pages_done: pages_done.load(Ordering::Relaxed),
        });
    }

    info!(
        pages = pages_total,
        page_colors = page_colors.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Address map built"
    );

    Ok(AddressMap::new(hardware.fingerprint().to_string(), page_size, addresses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{build_cache_colors, build_page_colors};
    use crate::testing::small_hardware;
    use std::sync::Mutex;

    fn universe() -> (Hardware, Vec<CacheColorTable>, Vec<Arc<PageColor>>) {
        let hardware = small_hardware();
        let cache_colors = build_cache_colors(&hardware).unwrap();
        let page_colors = build_page_colors(&hardware, &cache_colors).unwrap();
        (hardware, cache_colors, page_colors)
    }

    #[test]
    fn test_covers_every_page_once() {
        let (hardware, cache_colors, page_colors) = universe();
        let map = build_full_address_map(
            &hardware,
            &cache_colors,
            &page_colors,
            &AddressMapOptions::default().with_threads(3),
        )
        .unwrap();

        assert_eq!(map.total_pages(), hardware.number_of_pages());
        assert_eq!(map.number_of_page_colors(), page_colors.len());

        // 256 pages over 32 linear colors: page p lands in color p mod 32
        assert_eq!(map.addresses_of(0).len(), 8);
        assert_eq!(map.addresses_of(1)[..2], [4096, 33 * 4096]);
        for (_, addresses) in map.iter() {
            assert!(addresses.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_thread_count_does_not_change_result() {
        let (hardware, cache_colors, page_colors) = universe();
        let single = build_full_address_map(
            &hardware,
            &cache_colors,
            &page_colors,
            &AddressMapOptions::default().with_threads(1),
        )
        .unwrap();
        let many = build_full_address_map(
            &hardware,
            &cache_colors,
            &page_colors,
            &AddressMapOptions::default().with_threads(7),
        )
        .unwrap();
        assert_eq!(single, many);
    }

    #[test]
    fn test_cancelled_build() {
        let (hardware, cache_colors, page_colors) = universe();
        let token = CancellationToken::new();
        token.cancel();

        let result = build_full_address_map(
            &hardware,
            &cache_colors,
            &page_colors,
            &AddressMapOptions::default().with_cancellation(token),
        );
        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }

    #[test]
    fn test_progress_reaches_total() {
        let (hardware, cache_colors, page_colors) = universe();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        build_full_address_map(
            &hardware,
            &cache_colors,
            &page_colors,
            &AddressMapOptions::default()
                .with_threads(2)
                .with_progress(move |p| sink.lock().unwrap().push(p)),
        )
        .unwrap();

        let seen = seen.lock().unwrap();
        let max = seen.iter().map(|p| p.pages_done).max().unwrap();
        assert_eq!(max, hardware.number_of_pages());
        assert!(seen.iter().all(|p| p.pages_total == hardware.number_of_pages()));
    }
}
