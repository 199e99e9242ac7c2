// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Board-support information tables.
//!
//! Bootstrapping a board needs a handful of facts the protocols cannot
//! discover: where its SDRAM lives, where the RAM kernel is linked to run,
//! and which USB identity its ROM enumerates with. Those are kept in a TOML
//! table with one section per board:
//!
//! ```toml
//! [mx25]
//! description = "i.MX25 PDK"
//! sdram_start = 0x80000000
//! sdram_end = 0x8fffffff
//! ram_kernel_origin = 0x80004000
//! usb_vid = 0x15a2
//! usb_pid = 0x003a
//! ram_kernel_file = "ram_kernel_mx25.bin"   # optional
//! memory_init_file = "mx25.init"            # optional
//! ```
//!
//! Tables are loaded from a search path; later files extend and override
//! earlier ones, so a board definition in the working directory wins over
//! the per-user table. Section order is preserved for listing.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::debug;
use serde::Deserialize;
use thiserror::Error;

/// One board's worth of bootstrap facts.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardSupportInfo {
    pub description: String,
    /// Base of main memory.
    pub sdram_start: u32,
    /// Last address of main memory.
    pub sdram_end: u32,
    /// Load and entry address the RAM kernel is linked for. The stock
    /// kernels sit at `sdram_start + 0x4000`, but a custom build can put it
    /// anywhere.
    pub ram_kernel_origin: u32,
    pub usb_vid: u16,
    /// Product ID to match; any product of the vendor when absent.
    #[serde(default)]
    pub usb_pid: Option<u16>,
    #[serde(default)]
    pub ram_kernel_file: Option<PathBuf>,
    #[serde(default)]
    pub memory_init_file: Option<PathBuf>,
}

/// The full table, in file order.
pub type BspTable = IndexMap<String, BoardSupportInfo>;

#[derive(Debug, Error)]
pub enum BspError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no BSP table found (searched {searched:?})")]
    NoTable { searched: Vec<PathBuf> },

    #[error("BSP {0:?} is not defined in the support table")]
    UnknownBsp(String),
}

/// Parse one table file's contents.
pub fn parse_table(text: &str) -> Result<BspTable, toml::de::Error> {
    toml::from_str(text)
}

/// Load and merge the table files on `paths`. Missing files are skipped;
/// at least one must exist.
pub fn load_table<P: AsRef<Path>>(paths: &[P]) -> Result<BspTable, BspError> {
    let mut table = BspTable::new();
    let mut found = false;

    for path in paths {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no BSP table at {}", path.display());
                continue;
            }
            Err(source) => {
                return Err(BspError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let parsed = parse_table(&text).map_err(|source| BspError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("loaded {} BSP entries from {}", parsed.len(), path.display());
        table.extend(parsed);
        found = true;
    }

    if !found {
        return Err(BspError::NoTable {
            searched: paths.iter().map(|p| p.as_ref().to_path_buf()).collect(),
        });
    }
    Ok(table)
}

/// Look up a named BSP.
pub fn lookup<'t>(table: &'t BspTable, name: &str) -> Result<&'t BoardSupportInfo, BspError> {
    table
        .get(name)
        .ok_or_else(|| BspError::UnknownBsp(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[mx25]
description = "i.MX25 PDK"
sdram_start = 0x80000000
sdram_end = 0x8fffffff
ram_kernel_origin = 0x80004000
usb_vid = 0x15a2
usb_pid = 0x003a

[mx53]
description = "i.MX53 QSB"
sdram_start = 0x70000000
sdram_end = 0xefffffff
ram_kernel_origin = 0x70004000
usb_vid = 0x15a2
memory_init_file = "mx53.init"
"#;

    #[test]
    fn parses_sections_with_hex_integers() {
        let table = parse_table(SAMPLE).unwrap();
        let mx25 = &table["mx25"];
        assert_eq!(mx25.sdram_start, 0x8000_0000);
        assert_eq!(mx25.usb_vid, 0x15a2);
        assert_eq!(mx25.usb_pid, Some(0x003a));
        assert_eq!(mx25.ram_kernel_file, None);

        let mx53 = &table["mx53"];
        assert_eq!(mx53.usb_pid, None);
        assert_eq!(
            mx53.memory_init_file.as_deref(),
            Some(Path::new("mx53.init"))
        );
    }

    #[test]
    fn section_order_is_preserved() {
        let table = parse_table(SAMPLE).unwrap();
        let names: Vec<&str> = table.keys().map(String::as_str).collect();
        assert_eq!(names, ["mx25", "mx53"]);
    }

    #[test]
    fn lookup_reports_unknown_names() {
        let table = parse_table(SAMPLE).unwrap();
        assert!(lookup(&table, "mx25").is_ok());
        assert!(matches!(
            lookup(&table, "mx6"),
            Err(BspError::UnknownBsp(name)) if name == "mx6"
        ));
    }

    #[test]
    fn later_files_override_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user.conf");
        let local = dir.path().join("local.conf");

        std::fs::File::create(&user)
            .unwrap()
            .write_all(SAMPLE.as_bytes())
            .unwrap();
        std::fs::File::create(&local)
            .unwrap()
            .write_all(
                br#"
[mx25]
description = "patched"
sdram_start = 0x80000000
sdram_end = 0x8fffffff
ram_kernel_origin = 0x80008000
usb_vid = 0x15a2
"#,
            )
            .unwrap();

        let table = load_table(&[&user, &local]).unwrap();
        assert_eq!(table["mx25"].description, "patched");
        assert_eq!(table["mx25"].ram_kernel_origin, 0x8000_8000);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn missing_files_are_skipped_but_not_all_of_them() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("bspinfo.conf");
        std::fs::File::create(&real)
            .unwrap()
            .write_all(SAMPLE.as_bytes())
            .unwrap();

        let ghost = dir.path().join("nope.conf");
        assert!(load_table(&[&ghost, &real]).is_ok());
        assert!(matches!(
            load_table(&[&ghost]),
            Err(BspError::NoTable { .. })
        ));
    }
}
