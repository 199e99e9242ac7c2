// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serial Boot Protocol engine.
//!
//! The mask ROM of these parts speaks a simple request/response protocol
//! over whatever transport it enumerated on: every command is a fixed
//! 16-byte record, big-endian, zero-padded, and every command is answered by
//! one or two little-endian 32-bit status words, sometimes followed by data.
//! The protocol exists to poke registers (so the host can bring up DRAM) and
//! to download one image, after which the ROM hands over the CPU and stops
//! talking.
//!
//! [`SerialBoot`] is a stateless engine over a borrowed [`Channel`]; it does
//! not retry anything. Retry policy, if any, belongs to the caller.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::{debug, trace};
use mx_channel::{Channel, ChannelError};
use mx_progress::ProgressSink;
use std::io::Read;
use thiserror::Error;

pub const CMD_READ_MEMORY: u16 = 0x0101;
pub const CMD_WRITE_MEMORY: u16 = 0x0202;
pub const CMD_WRITE_FILE: u16 = 0x0404;
pub const CMD_GET_STATUS: u16 = 0x0505;
pub const CMD_REENUMERATE_USB: u16 = 0x0909;

/// Acknowledge word from production-fused parts.
pub const ACK_PRODUCTION_PART: u32 = 0x1234_3412;
/// Acknowledge word from engineering-fused parts.
pub const ACK_ENGINEERING_PART: u32 = 0x5678_7856;
/// Acknowledge word for a completed memory write.
pub const ACK_WRITE_SUCCESS: u32 = 0x128A_8A12;

/// Status after the ROM accepts an application image and moves on.
pub const BOOT_PROTOCOL_COMPLETE: u32 = 0x8888_8888;

// High-assurance boot status codes.
pub const HAB_PASSED: u32 = 0xF0F0_F0F0;
pub const HAB_FAILURE: u32 = 0x3939_3939;
pub const HAB_DATA_OUT_OF_BOUNDS: u32 = 0x8D8D_8D8D;
pub const HAB_FAIL_ASSERT: u32 = 0x5555_5555;
pub const HAB_INVALID_WRITE_REG: u32 = 0x6666_6666;

/// Response to a re-enumerate request, on ROMs that send one.
const REENUMERATE_MAGIC: [u8; 4] = [0x89, 0x23, 0x23, 0x89];

/// Image downloads go out in chunks of this size.
pub const WRITE_FILE_CHUNK: usize = 1024;

const FRAME_LEN: usize = 16;

/// Describe a ROM status word.
pub fn status_string(code: u32) -> String {
    match code {
        HAB_PASSED => "successful operation complete".to_string(),
        HAB_FAILURE => "failure not matching any other description".to_string(),
        HAB_DATA_OUT_OF_BOUNDS => "data specified is out of bounds".to_string(),
        HAB_FAIL_ASSERT => "error during assert verification".to_string(),
        HAB_INVALID_WRITE_REG => "write operation to register failed".to_string(),
        BOOT_PROTOCOL_COMPLETE => "boot protocol complete".to_string(),
        _ => format!("unknown code {code:#010x}"),
    }
}

/// Memory access width. The discriminant is the on-wire width code, which
/// encodes the bit count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessWidth {
    Byte = 0x08,
    Half = 0x10,
    Word = 0x20,
}

impl AccessWidth {
    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn bytes(self) -> usize {
        self as usize / 8
    }
}

/// File type for [`SerialBoot::write_file`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    /// Terminates the serial protocol and runs the image.
    Application = 0xAA,
    /// Command sequence file, secure boot only.
    Csf = 0xCC,
    /// Device configuration data.
    Dcd = 0xEE,
}

/// Byte order the device returns memory contents in.
///
/// Commands go out most-significant-byte first, but read data comes back in
/// processor order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEndian {
    Little,
    Big,
}

#[derive(Debug, Error)]
pub enum SbpError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("reading input stream: {0}")]
    Input(#[from] std::io::Error),

    #[error("command {opcode:#06x}: unexpected status word {status:#010x}")]
    UnexpectedStatus { opcode: u16, status: u32 },

    /// The ROM signals a failed register write by sending nothing after the
    /// initial acknowledge.
    #[error("memory write to {address:#010x} failed: no completion status")]
    WriteFailed { address: u32 },

    #[error("file stream ended early after {consumed} of {total} bytes")]
    ShortInput { consumed: u64, total: u64 },
}

/// Host side of the serial boot protocol.
pub struct SerialBoot<'a> {
    channel: &'a mut dyn Channel,
    device_endian: DeviceEndian,
}

impl<'a> SerialBoot<'a> {
    pub fn new(channel: &'a mut dyn Channel) -> Self {
        Self::with_endian(channel, DeviceEndian::Little)
    }

    pub fn with_endian(channel: &'a mut dyn Channel, device_endian: DeviceEndian) -> Self {
        SerialBoot {
            channel,
            device_endian,
        }
    }

    /// Send a command, zero-padded to the fixed frame length.
    fn write_command(&mut self, frame: &[u8]) -> Result<(), SbpError> {
        let mut cmd = [0u8; FRAME_LEN];
        cmd[..frame.len()].copy_from_slice(frame);
        trace!("SBP > {cmd:02x?}");
        self.channel.write(&cmd)?;
        Ok(())
    }

    fn read_status_word(&mut self) -> Result<u32, SbpError> {
        let mut raw = [0u8; 4];
        self.channel.read_exact(&mut raw)?;
        let status = u32::from_le_bytes(raw);
        trace!("SBP < status {status:#010x}");
        Ok(status)
    }

    /// Read the initial acknowledge word; anything but the two part-security
    /// ACKs fails the command.
    fn read_ack(&mut self, opcode: u16) -> Result<(), SbpError> {
        let status = self.read_status_word()?;
        match status {
            ACK_PRODUCTION_PART | ACK_ENGINEERING_PART => Ok(()),
            status => Err(SbpError::UnexpectedStatus { opcode, status }),
        }
    }

    /// Query and return the ROM status word, verbatim.
    pub fn get_status(&mut self) -> Result<u32, SbpError> {
        let mut frame = [0u8; 2];
        BigEndian::write_u16(&mut frame, CMD_GET_STATUS);
        self.write_command(&frame)?;
        self.read_status_word()
    }

    /// Read `count` successive memory locations of the given width starting
    /// at `address`. Elements are returned widened to `u32`.
    pub fn read_memory(
        &mut self,
        address: u32,
        width: AccessWidth,
        count: u32,
    ) -> Result<Vec<u32>, SbpError> {
        let mut frame = [0u8; 11];
        BigEndian::write_u16(&mut frame[0..2], CMD_READ_MEMORY);
        BigEndian::write_u32(&mut frame[2..6], address);
        frame[6] = width as u8;
        BigEndian::write_u32(&mut frame[7..11], count);
        self.write_command(&frame)?;

        self.read_ack(CMD_READ_MEMORY)?;

        let mut values = Vec::with_capacity(count as usize);
        let mut elem = [0u8; 4];
        for _ in 0..count {
            self.channel.read_exact(&mut elem[..width.bytes()])?;
            let value = match self.device_endian {
                DeviceEndian::Little => {
                    LittleEndian::read_uint(&elem, width.bytes())
                }
                DeviceEndian::Big => BigEndian::read_uint(&elem, width.bytes()),
            };
            values.push(value as u32);
        }
        Ok(values)
    }

    /// Read a single memory location.
    pub fn read_memory_single(
        &mut self,
        address: u32,
        width: AccessWidth,
    ) -> Result<u32, SbpError> {
        let values = self.read_memory(address, width, 1)?;
        Ok(values[0])
    }

    /// Write one value of the given width to `address`.
    ///
    /// The ROM acknowledges twice: first the usual part ACK, then a separate
    /// write-success word. A write the ROM rejects produces no second word
    /// at all, which surfaces here as [`SbpError::WriteFailed`].
    pub fn write_memory(
        &mut self,
        address: u32,
        width: AccessWidth,
        value: u32,
    ) -> Result<(), SbpError> {
        let mut frame = [0u8; FRAME_LEN];
        BigEndian::write_u16(&mut frame[0..2], CMD_WRITE_MEMORY);
        BigEndian::write_u32(&mut frame[2..6], address);
        frame[6] = width as u8;
        // The value rides in the tail of the frame, sized to the width.
        match width {
            AccessWidth::Byte => frame[15] = value as u8,
            AccessWidth::Half => BigEndian::write_u16(&mut frame[14..16], value as u16),
            AccessWidth::Word => BigEndian::write_u32(&mut frame[11..15], value),
        }
        self.write_command(&frame)?;

        self.read_ack(CMD_WRITE_MEMORY)?;

        let status = match self.read_status_word() {
            Ok(status) => status,
            Err(SbpError::Channel(ChannelError::ReadTimeout { .. })) => {
                return Err(SbpError::WriteFailed { address });
            }
            Err(err) => return Err(err),
        };
        if status != ACK_WRITE_SUCCESS {
            return Err(SbpError::UnexpectedStatus {
                opcode: CMD_WRITE_MEMORY,
                status,
            });
        }
        Ok(())
    }

    /// Download `length` bytes from `stream` to `address`.
    ///
    /// After [`FileType::Application`] downloads, call
    /// [`SerialBoot::complete_boot`] next; the ROM is already on its way out.
    pub fn write_file(
        &mut self,
        filetype: FileType,
        address: u32,
        length: u32,
        stream: &mut dyn Read,
        progress: &mut dyn ProgressSink,
    ) -> Result<(), SbpError> {
        let mut frame = [0u8; 12];
        BigEndian::write_u16(&mut frame[0..2], CMD_WRITE_FILE);
        BigEndian::write_u32(&mut frame[2..6], address);
        BigEndian::write_u32(&mut frame[7..11], length);
        frame[11] = filetype as u8;
        self.write_command(&frame)?;

        self.read_ack(CMD_WRITE_FILE)?;

        let total = u64::from(length);
        let mut sent: u64 = 0;
        let mut chunk = [0u8; WRITE_FILE_CHUNK];
        while sent < total {
            let want = WRITE_FILE_CHUNK.min((total - sent) as usize);
            let n = stream.read(&mut chunk[..want])?;
            if n == 0 {
                return Err(SbpError::ShortInput {
                    consumed: sent,
                    total,
                });
            }
            self.channel.write(&chunk[..n])?;
            sent += n as u64;
            progress.on_bytes_sent(sent, total);
        }
        debug!("file download complete, {sent} bytes");
        Ok(())
    }

    /// Force re-enumeration of the USB PHY with the given serial number.
    ///
    /// Early ROMs answer with a fixed four-byte magic; later ones answer
    /// with something else entirely, so any four bytes are taken as
    /// acceptance and a mismatch is merely logged.
    pub fn reenumerate_usb(&mut self, serial: [u8; 4]) -> Result<(), SbpError> {
        let mut frame = [0u8; 13];
        BigEndian::write_u16(&mut frame[0..2], CMD_REENUMERATE_USB);
        frame[9..13].copy_from_slice(&serial);
        self.write_command(&frame)?;

        let mut response = [0u8; 4];
        self.channel.read_exact(&mut response)?;
        if response != REENUMERATE_MAGIC {
            debug!("re-enumerate response {response:02x?} (no magic)");
        }
        Ok(())
    }

    /// Finish the boot protocol after an application download.
    ///
    /// Must be called immediately after `write_file` with
    /// [`FileType::Application`]; the status exchange is what moves the ROM
    /// along to executing the image.
    pub fn complete_boot(&mut self) -> Result<(), SbpError> {
        let status = self.get_status()?;
        if status != BOOT_PROTOCOL_COMPLETE {
            return Err(SbpError::UnexpectedStatus {
                opcode: CMD_GET_STATUS,
                status,
            });
        }
        Ok(())
    }
}
