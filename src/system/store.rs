//! Address Map Store
//!
//! Persists address maps as versioned JSON files named after the hardware
//! fingerprint. A file is only accepted if its version, fingerprint, page size
//! and page color tuples match the hardware asking for it, every page appears
//! exactly once, and the SHA-256 checksum of the page color payload matches.
//! Writes go to a temporary file in the same directory that is then renamed
//! over the target.

use std::fs;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};

use super::address_map::AddressMap;
use crate::color::PageColor;
use crate::error::{Error, Result};
use crate::hardware::Hardware;

/// Version of the on-disk envelope
pub const ADDRESS_MAP_FORMAT_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct StoredPageColor {
    cache_colors: Vec<usize>,
    addresses: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredAddressMap {
    format_version: u32,
    hardware_fingerprint: String,
    created_at: DateTime<Utc>,
    page_size: u64,
    /// Hex SHA-256 of the serialized `page_colors`
    checksum: String,
    page_colors: Vec<StoredPageColor>,
}

fn payload_checksum(page_colors: &[StoredPageColor]) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(page_colors)?);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Directory of persisted address maps
#[derive(Debug, Clone)]
pub struct AddressMapStore {
    dir: PathBuf,
}

impl AddressMapStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the map of the hardware with `fingerprint`
    pub fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("address-map-{}.json", fingerprint))
    }

    /// Load the map for `hardware`.
    ///
    /// Returns `Ok(None)` if no file exists and
    /// [`Error::AddressMapCorrupt`] if one exists but does not describe this
    /// hardware.
    #[instrument(skip_all, fields(fingerprint = %hardware.fingerprint()))]
    pub fn load(&self, hardware: &Hardware, page_colors: &[Arc<PageColor>]) -> Result<Option<AddressMap>> {
        let path = self.path_for(hardware.fingerprint());
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No persisted address map");
                return Ok(None);
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let corrupt = |reason: String| Error::AddressMapCorrupt {
            path: path.clone(),
            reason,
        };

        let stored: StoredAddressMap =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| corrupt(e.to_string()))?;

        if stored.format_version != ADDRESS_MAP_FORMAT_VERSION {
            return Err(corrupt(format!(
                "format version {}, expected {}",
                stored.format_version, ADDRESS_MAP_FORMAT_VERSION
            )));
        }
        if stored.hardware_fingerprint != hardware.fingerprint() {
            return Err(corrupt("hardware fingerprint mismatch".to_string()));
        }
        if stored.page_size != hardware.page_size() {
            return Err(corrupt(format!(
                "page size {}, expected {}",
                stored.page_size,
                hardware.page_size()
            )));
        }
        if stored.page_colors.len() != page_colors.len() {
            return Err(corrupt(format!(
                "{} page colors, expected {}",
                stored.page_colors.len(),
                page_colors.len()
            )));
        }

        let page_size = hardware.page_size();
        let number_of_pages = hardware.number_of_pages();
        let mut seen = vec![false; usize::try_from(number_of_pages).map_err(|e| corrupt(e.to_string()))?];
        let mut total = 0u64;
        for (stored_pc, pc) in stored.page_colors.iter().zip(page_colors) {
            if stored_pc.cache_colors != pc.cache_color_ids() {
                return Err(corrupt(format!(
                    "page color {} has cache colors {:?}, expected {:?}",
                    pc.index(),
                    stored_pc.cache_colors,
                    pc.cache_color_ids()
                )));
            }
            for &address in &stored_pc.addresses {
                if address % page_size != 0 || address / page_size >= number_of_pages {
                    return Err(corrupt(format!(
                        "page color {} lists address {:#x} outside the page grid",
                        pc.index(),
                        address
                    )));
                }
                let slot = &mut seen[(address / page_size) as usize];
                if *slot {
                    return Err(corrupt(format!("page {:#x} is listed more than once", address)));
                }
                *slot = true;
            }
            total += stored_pc.addresses.len() as u64;
        }
        if total != number_of_pages {
            return Err(corrupt(format!(
                "{} page addresses, expected {}",
                total,
                hardware.number_of_pages()
            )));
        }

        if payload_checksum(&stored.page_colors)? != stored.checksum {
            return Err(corrupt("page color checksum mismatch".to_string()));
        }

        info!(path = %path.display(), pages = total, created_at = %stored.created_at, "Loaded address map");

        Ok(Some(AddressMap::new(
            stored.hardware_fingerprint,
            stored.page_size,
            stored.page_colors.into_iter().map(|pc| pc.addresses).collect(),
        )))
    }

    /// Persist `map`, replacing any previous file for the same hardware
    #[instrument(skip_all, fields(fingerprint = %map.hardware_fingerprint()))]
    pub fn store(&self, map: &AddressMap, page_colors: &[Arc<PageColor>]) -> Result<PathBuf> {
        if map.number_of_page_colors() != page_colors.len() {
            return Err(Error::Internal(format!(
                "address map has {} page colors, system has {}",
                map.number_of_page_colors(),
                page_colors.len()
            )));
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(map.hardware_fingerprint());

        let stored_colors: Vec<StoredPageColor> = page_colors
            .iter()
            .map(|pc| StoredPageColor {
                cache_colors: pc.cache_color_ids().to_vec(),
                addresses: map.addresses_of(pc.index()).to_vec(),
            })
            .collect();
        let stored = StoredAddressMap {
            format_version: ADDRESS_MAP_FORMAT_VERSION,
            hardware_fingerprint: map.hardware_fingerprint().to_string(),
            created_at: Utc::now(),
            page_size: map.page_size(),
            checksum: payload_checksum(&stored_colors)?,
            page_colors: stored_colors,
        };

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, &stored)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;

        info!(path = %path.display(), pages = map.total_pages(), "Stored address map");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::address_map::AddressMapOptions;
    use crate::system::{build_cache_colors, build_full_address_map, build_page_colors};
    use crate::testing::small_hardware;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn map_for(hardware: &Hardware) -> (AddressMap, Vec<Arc<PageColor>>) {
        let cache_colors = build_cache_colors(hardware).unwrap();
        let page_colors = build_page_colors(hardware, &cache_colors).unwrap();
        let map = build_full_address_map(
            hardware,
            &cache_colors,
            &page_colors,
            &AddressMapOptions::default().with_threads(2),
        )
        .unwrap();
        (map, page_colors)
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let hardware = small_hardware();
        let (_, page_colors) = map_for(&hardware);
        let store = AddressMapStore::new(dir.path());
        assert!(store.load(&hardware, &page_colors).unwrap().is_none());
    }

    #[test]
    fn test_store_then_load() {
        let dir = TempDir::new().unwrap();
        let hardware = small_hardware();
        let (map, page_colors) = map_for(&hardware);
        let store = AddressMapStore::new(dir.path().join("maps"));

        let path = store.store(&map, &page_colors).unwrap();
        assert!(path.ends_with(format!("address-map-{}.json", hardware.fingerprint())));

        let loaded = store.load(&hardware, &page_colors).unwrap().unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let hardware = small_hardware();
        let (_, page_colors) = map_for(&hardware);
        let store = AddressMapStore::new(dir.path());

        fs::write(store.path_for(hardware.fingerprint()), b"not json").unwrap();
        assert_matches!(
            store.load(&hardware, &page_colors),
            Err(Error::AddressMapCorrupt { .. })
        );
    }

    #[test]
    fn test_version_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let hardware = small_hardware();
        let (map, page_colors) = map_for(&hardware);
        let store = AddressMapStore::new(dir.path());
        let path = store.store(&map, &page_colors).unwrap();

        let mut value: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        value["format_version"] = serde_json::json!(99);
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        assert_matches!(
            store.load(&hardware, &page_colors),
            Err(Error::AddressMapCorrupt { reason, .. }) if reason.contains("format version 99")
        );
    }

    #[test]
    fn test_truncated_addresses_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let hardware = small_hardware();
        let (map, page_colors) = map_for(&hardware);
        let store = AddressMapStore::new(dir.path());
        let path = store.store(&map, &page_colors).unwrap();

        let mut value: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        value["page_colors"][0]["addresses"] = serde_json::json!([]);
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        assert_matches!(
            store.load(&hardware, &page_colors),
            Err(Error::AddressMapCorrupt { .. })
        );
    }

    fn tamper(path: &Path, edit: impl FnOnce(&mut serde_json::Value)) {
        let mut value: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        edit(&mut value);
        fs::write(path, serde_json::to_vec(&value).unwrap()).unwrap();
    }

    #[test]
    fn test_swapped_address_lists_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let hardware = small_hardware();
        let (map, page_colors) = map_for(&hardware);
        let store = AddressMapStore::new(dir.path());
        let path = store.store(&map, &page_colors).unwrap();

        // every page still listed once, but under the wrong color
        tamper(&path, |value| {
            let first = value["page_colors"][0]["addresses"].take();
            let second = value["page_colors"][1]["addresses"].take();
            value["page_colors"][0]["addresses"] = second;
            value["page_colors"][1]["addresses"] = first;
        });

        assert_matches!(
            store.load(&hardware, &page_colors),
            Err(Error::AddressMapCorrupt { reason, .. }) if reason.contains("checksum")
        );
    }

    #[test]
    fn test_duplicate_address_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let hardware = small_hardware();
        let (map, page_colors) = map_for(&hardware);
        let store = AddressMapStore::new(dir.path());
        let path = store.store(&map, &page_colors).unwrap();

        tamper(&path, |value| {
            let addresses = value["page_colors"][2]["addresses"].as_array_mut().unwrap();
            let first = addresses[0].clone();
            addresses[1] = first;
        });

        assert_matches!(
            store.load(&hardware, &page_colors),
            Err(Error::AddressMapCorrupt { reason, .. }) if reason.contains("more than once")
        );
    }

    #[test]
    fn test_misaligned_address_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let hardware = small_hardware();
        let (map, page_colors) = map_for(&hardware);
        let store = AddressMapStore::new(dir.path());
        let path = store.store(&map, &page_colors).unwrap();

        tamper(&path, |value| {
            value["page_colors"][0]["addresses"][0] = serde_json::json!(17);
        });

        assert_matches!(
            store.load(&hardware, &page_colors),
            Err(Error::AddressMapCorrupt { reason, .. }) if reason.contains("page grid")
        );
    }
}
