// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Console output helpers: hex dumps and transfer progress bars.
//!
//! Progress goes to stderr so that `flash dump` output on stdout stays
//! clean enough to pipe somewhere.

use std::io::{self, Write};

use mx_progress::ProgressSink;

const BAR_LEN: usize = 35;

/// Write `data` as a classic address/hex/ASCII dump, 16 bytes per row.
pub fn hexdump(out: &mut impl Write, data: &[u8], start_address: u32) -> io::Result<()> {
    for (row, bytes) in data.chunks(16).enumerate() {
        let address = u64::from(start_address) + (row as u64) * 16;
        write!(out, "{address:08x} : ")?;

        for byte in bytes {
            write!(out, "{byte:02x} ")?;
        }
        for _ in bytes.len()..16 {
            write!(out, "   ")?;
        }

        write!(out, "| ")?;
        for &byte in bytes {
            let printable = if (0x20..=0x7e).contains(&byte) {
                byte as char
            } else {
                '.'
            };
            write!(out, "{printable}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn draw_bar(label: &str, current: u64, total: u64) {
    let on = if total == 0 {
        BAR_LEN
    } else {
        ((current * BAR_LEN as u64 / total) as usize).min(BAR_LEN)
    };
    eprint!(
        "\r  {label} [{}{}] {} / {} kB",
        "=".repeat(on),
        " ".repeat(BAR_LEN - on),
        current / 1024,
        total / 1024,
    );
    let _ = io::stderr().flush();
}

/// Progress bar for an image download.
pub struct TransferBar {
    label: &'static str,
}

impl TransferBar {
    pub fn new(label: &'static str) -> Self {
        TransferBar { label }
    }

    /// Leave the final bar on its own line.
    pub fn finish(&self) {
        eprintln!();
    }
}

impl ProgressSink for TransferBar {
    fn on_bytes_sent(&mut self, sent: u64, total: u64) {
        draw_bar(self.label, sent, total);
    }
}

/// Progress for flash programming: the program pass and the read-back
/// verify pass each count up to the same total.
pub struct FlashBar {
    total: u64,
    programmed: u64,
    verified: u64,
}

impl FlashBar {
    pub fn new(total: u64) -> Self {
        FlashBar {
            total,
            programmed: 0,
            verified: 0,
        }
    }

    pub fn finish(&self) {
        eprintln!();
    }
}

impl ProgressSink for FlashBar {
    fn on_page_programmed(&mut self, _block: u16, len: u32) {
        self.programmed += u64::from(len);
        draw_bar("program", self.programmed, self.total);
    }

    fn on_page_verified(&mut self, _block: u16, len: u32) {
        self.verified += u64::from(len);
        draw_bar("verify ", self.verified, self.total);
    }
}
