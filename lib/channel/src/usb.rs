// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB bulk-endpoint channel.

use std::time::Duration;

use log::debug;
use rusb::{Device, DeviceHandle, Direction, GlobalContext, TransferType};

use crate::{Channel, ChannelError, ChannelKind};

const WRITE_TIMEOUT: Duration = Duration::from_millis(2000);
const READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// A channel over one bulk IN and one bulk OUT endpoint.
///
/// The device is selected by vendor ID and, optionally, product ID. Exactly
/// one device on the bus may match: the ROMs all report the same serial
/// number, so two matching devices cannot be told apart and the open is
/// refused.
///
/// Writes are chunked to the OUT endpoint's max packet size. Reads pull one
/// IN max packet at a time into an internal buffer and hand out exactly the
/// requested prefix; whatever the device sent beyond that is kept for the
/// next read.
pub struct UsbChannel {
    vid: u16,
    pid: Option<u16>,
    state: Option<OpenState>,
    read_buffer: Vec<u8>,
}

struct OpenState {
    handle: DeviceHandle<GlobalContext>,
    ep_in: u8,
    ep_out: u8,
    in_max_packet: usize,
    out_max_packet: usize,
}

impl UsbChannel {
    pub fn new(vid: u16, pid: Option<u16>) -> Self {
        UsbChannel {
            vid,
            pid,
            state: None,
            read_buffer: Vec::new(),
        }
    }

    fn matches(&self, device: &Device<GlobalContext>) -> bool {
        match device.device_descriptor() {
            Ok(desc) => {
                desc.vendor_id() == self.vid
                    && self.pid.map_or(true, |pid| pid == desc.product_id())
            }
            // A device we cannot even read the descriptor of is not ours.
            Err(_) => false,
        }
    }
}

impl Channel for UsbChannel {
    fn open(&mut self) -> Result<(), ChannelError> {
        let mut matched: Vec<Device<GlobalContext>> = Vec::new();
        for device in rusb::devices()?.iter() {
            if self.matches(&device) {
                matched.push(device);
            }
        }

        let device = match matched.len() {
            1 => matched.remove(0),
            0 => {
                return Err(ChannelError::NotConnected {
                    vid: self.vid,
                    pid: self.pid,
                })
            }
            count => return Err(ChannelError::AmbiguousDevice { count }),
        };

        // These ROMs expose a single configuration with a single interface;
        // take the bulk endpoints of interface 0, alternate setting 0.
        let config = device.config_descriptor(0)?;
        let mut ep_in = None;
        let mut ep_out = None;
        for interface in config.interfaces() {
            if interface.number() != 0 {
                continue;
            }
            for setting in interface.descriptors() {
                if setting.setting_number() != 0 {
                    continue;
                }
                for endpoint in setting.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    let info =
                        (endpoint.address(), usize::from(endpoint.max_packet_size()));
                    match endpoint.direction() {
                        Direction::In => ep_in = Some(info),
                        Direction::Out => ep_out = Some(info),
                    }
                }
            }
        }
        let (ep_in, in_max_packet) =
            ep_in.ok_or(ChannelError::MissingEndpoint("IN"))?;
        let (ep_out, out_max_packet) =
            ep_out.ok_or(ChannelError::MissingEndpoint("OUT"))?;

        let mut handle = device.open()?;
        // The OS may have configured the device already; a failure here is
        // fine as long as the interface claim below succeeds.
        if let Err(err) = handle.set_active_configuration(config.number()) {
            debug!("set_active_configuration: {err}");
        }
        handle.claim_interface(0)?;

        debug!(
            "opened {:04x}:{:?}, IN {ep_in:#04x} ({in_max_packet}B), \
             OUT {ep_out:#04x} ({out_max_packet}B)",
            self.vid, self.pid
        );

        self.read_buffer.clear();
        self.state = Some(OpenState {
            handle,
            ep_in,
            ep_out,
            in_max_packet,
            out_max_packet,
        });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(state) = self.state.take() {
            // Dropping the handle releases the device; the claim just goes
            // away with it, but be polite about it first.
            let _ = state.handle.release_interface(0);
        }
        self.read_buffer.clear();
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        let state = self.state.as_ref().ok_or(ChannelError::NotOpen)?;

        while self.read_buffer.len() < buf.len() {
            let mut packet = vec![0u8; state.in_max_packet];
            match state.handle.read_bulk(state.ep_in, &mut packet, READ_TIMEOUT) {
                Ok(n) => self.read_buffer.extend_from_slice(&packet[..n]),
                Err(rusb::Error::Timeout) => {
                    return Err(ChannelError::ReadTimeout {
                        wanted: buf.len(),
                        got: self.read_buffer.len(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }

        buf.copy_from_slice(&self.read_buffer[..buf.len()]);
        self.read_buffer.drain(..buf.len());
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let state = self.state.as_ref().ok_or(ChannelError::NotOpen)?;

        for chunk in data.chunks(state.out_max_packet) {
            let written =
                state.handle.write_bulk(state.ep_out, chunk, WRITE_TIMEOUT)?;
            if written != chunk.len() {
                return Err(ChannelError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("short bulk write: {written} of {}", chunk.len()),
                )));
            }
        }
        Ok(())
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Usb
    }
}
