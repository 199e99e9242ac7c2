// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory-initialization scripts.
//!
//! Before anything useful can be downloaded, the host has to bring up the
//! board's DRAM controller by poking a board-specific list of registers
//! through the boot ROM. That list lives in a plain text file, one write per
//! line:
//!
//! ```text
//! # CCM: enable all clocks
//! 0x53f80008 0x20034000 32
//! 0x53f80064 0xffffffff 32
//! ```
//!
//! Each data line is `address value width`, whitespace-separated, integers
//! in any base by prefix (`0x`, `0o`, `0b`, else decimal), width in bits.
//! Blank lines and `#` comments are ignored. Order is preserved: the writes
//! are replayed exactly as listed.

use std::path::{Path, PathBuf};

use mx_sbp::AccessWidth;
use thiserror::Error;

/// One register write from a script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitEntry {
    pub address: u32,
    pub width: AccessWidth,
    pub value: u32,
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("line {line}: expected `address value width`, found {found:?}")]
    Malformed { line: usize, found: String },

    #[error("line {line}: bad integer {token:?}")]
    BadInteger { line: usize, token: String },

    #[error("line {line}: width must be 8, 16 or 32 (got {width})")]
    BadWidth { line: usize, width: u32 },

    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parse an integer token with an optional base prefix.
pub fn parse_int(token: &str) -> Option<u32> {
    let (digits, radix) = if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        (hex, 16)
    } else if let Some(oct) = token.strip_prefix("0o").or_else(|| token.strip_prefix("0O")) {
        (oct, 8)
    } else if let Some(bin) = token.strip_prefix("0b").or_else(|| token.strip_prefix("0B")) {
        (bin, 2)
    } else {
        (token, 10)
    };
    u32::from_str_radix(digits, radix).ok()
}

/// Parse a script from text.
pub fn parse(text: &str) -> Result<Vec<InitEntry>, ScriptError> {
    let mut entries = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        let &[address, value, width] = tokens.as_slice() else {
            return Err(ScriptError::Malformed {
                line,
                found: trimmed.to_string(),
            });
        };

        let number = |token: &str| {
            parse_int(token).ok_or_else(|| ScriptError::BadInteger {
                line,
                token: token.to_string(),
            })
        };

        let address = number(address)?;
        let value = number(value)?;
        let width = match number(width)? {
            8 => AccessWidth::Byte,
            16 => AccessWidth::Half,
            32 => AccessWidth::Word,
            width => return Err(ScriptError::BadWidth { line, width }),
        };

        entries.push(InitEntry {
            address,
            width,
            value,
        });
    }
    Ok(entries)
}

/// Parse the script file at `path`.
pub fn load(path: &Path) -> Result<Vec<InitEntry>, ScriptError> {
    let text = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}
