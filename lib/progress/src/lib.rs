// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Progress observation for streaming bootstrap and flash operations.
//!
//! The protocol engines report progress through a single observer trait
//! rather than per-operation callback arguments. Every method has a no-op
//! default, so an observer only implements the events it cares about, and
//! [`NullProgress`] can be passed where nobody is watching.
//!
//! Callbacks are invoked synchronously between response reads and carry the
//! values from the frame that triggered them, not running totals. Observers
//! must not issue commands of their own; the engine owns the channel for the
//! duration of the operation.

/// Observer for long-running device operations.
pub trait ProgressSink {
    /// A chunk of an image download went out on the wire. `sent` is the
    /// total transferred so far, `total` the full image size.
    fn on_bytes_sent(&mut self, sent: u64, total: u64) {
        let _ = (sent, total);
    }

    /// The device erased one flash block.
    fn on_block_erased(&mut self, block: u16, block_size: u32) {
        let _ = (block, block_size);
    }

    /// The device programmed one run of flash pages.
    fn on_page_programmed(&mut self, block: u16, len: u32) {
        let _ = (block, len);
    }

    /// The device read back and verified one run of flash pages.
    fn on_page_verified(&mut self, block: u16, len: u32) {
        let _ = (block, len);
    }
}

/// An observer that ignores everything.
pub struct NullProgress;

impl ProgressSink for NullProgress {}
