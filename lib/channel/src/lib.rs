// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte channels to a device in serial boot mode.
//!
//! Both bootstrap protocols are strict request/response over a duplex byte
//! stream, so the only transport capability they need is "write these bytes"
//! and "read exactly this many bytes or fail". [`Channel`] captures that,
//! plus the one piece of transport identity the callers care about: whether
//! the medium is USB, because a device-initiated reset tears down the USB
//! endpoint and the host must sit out a re-enumeration window before
//! reconnecting.
//!
//! Two concrete channels are provided: [`uart::UartChannel`] over a serial
//! port and [`usb::UsbChannel`] over a pair of bulk endpoints. The [`mock`]
//! module has a scripted in-memory channel for protocol tests.

use std::time::Duration;

use log::warn;
use thiserror::Error;

pub mod mock;
mod uart;
mod usb;

pub use uart::UartChannel;
pub use usb::UsbChannel;

/// Transport medium behind a [`Channel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Serial,
    Usb,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("read timed out after {got} of {wanted} bytes")]
    ReadTimeout { wanted: usize, got: usize },

    #[error(
        "no USB device with vendor ID {vid:#06x} found; \
         is it connected and in serial boot mode?"
    )]
    NotConnected { vid: u16, pid: Option<u16> },

    #[error("{count} matching USB devices; connect exactly one")]
    AmbiguousDevice { count: usize },

    #[error("USB device has no bulk {0} endpoint")]
    MissingEndpoint(&'static str),

    #[error("channel is not open")]
    NotOpen,
}

/// A duplex byte transport to the device.
///
/// After `open` succeeds, `read_exact` fills the whole buffer or fails, and
/// `write` sends the whole slice or fails; there are no short transfers.
/// `close` is idempotent and may be followed by another `open` on the same
/// value, which is how the USB channel survives a device-side reset.
pub trait Channel {
    fn open(&mut self) -> Result<(), ChannelError>;
    fn close(&mut self);
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ChannelError>;
    fn write(&mut self, data: &[u8]) -> Result<(), ChannelError>;
    fn kind(&self) -> ChannelKind;
}

/// How long a USB device gets to drop off the bus and come back after a
/// device-initiated reset. Longer than you would expect because USB
/// passthrough to virtual machines is slow to re-enumerate.
pub const REOPEN_SETTLE: Duration = Duration::from_secs(3);

/// Number of times [`reopen`] retries the open.
pub const REOPEN_ATTEMPTS: u32 = 3;

/// Close and re-open a channel after the device has reset its end.
///
/// Serial lines survive a device reset, so this is a no-op for them. For USB
/// the device falls off the bus and re-enumerates; we close, wait out
/// [`REOPEN_SETTLE`], and retry the open up to [`REOPEN_ATTEMPTS`] times.
/// Hotplug events would be nicer, but libusb does not expose them portably.
pub fn reopen(channel: &mut dyn Channel) -> Result<(), ChannelError> {
    if channel.kind() != ChannelKind::Usb {
        return Ok(());
    }

    channel.close();

    let mut last = ChannelError::NotOpen;
    for attempt in 1..=REOPEN_ATTEMPTS {
        std::thread::sleep(REOPEN_SETTLE);
        match channel.open() {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!("re-open attempt {attempt}/{REOPEN_ATTEMPTS} failed: {err}");
                last = err;
            }
        }
    }
    Err(last)
}
