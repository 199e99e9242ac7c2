// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RAM-kernel protocol engine.
//!
//! The boot ROM can only poke registers and download one image, so all real
//! flash work is done by a small agent, the RAM kernel, that the host
//! downloads into freshly initialized DRAM and hands control to. The kernel
//! then speaks a richer protocol on the same transport: 16-byte big-endian
//! command frames answered by 8-byte headers `(ack, checksum, length)`,
//! where bulk operations stream a sequence of partial-completion responses
//! before the final success.
//!
//! The ACK field is signed on purpose: the kernel reports flash faults as
//! small negative numbers, and the general-failure code 0xFFFF is just -1.
//!
//! [`RamKernel`] tracks two pieces of session state. `kernel_init` records
//! that the agent has been launched (and the channel re-opened across the
//! USB re-enumeration its startup causes); `flash_init` records a successful
//! [`RamKernel::flash_initial`], which the kernel requires before any other
//! flash command.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};
use mx_channel::{Channel, ChannelError};
use mx_progress::ProgressSink;
use mx_sbp::{FileType, SbpError, SerialBoot};
use std::io::Read;
use thiserror::Error;

const HEADER_MAGIC: u16 = 0x0606;
const FRAME_LEN: usize = 16;
const RESPONSE_LEN: usize = 8;

// Flash commands.
pub const CMD_FLASH_INITIAL: u16 = 0x0001;
pub const CMD_FLASH_ERASE: u16 = 0x0002;
pub const CMD_FLASH_DUMP: u16 = 0x0003;
pub const CMD_FLASH_PROGRAM: u16 = 0x0004;
pub const CMD_FLASH_PROGRAM_UB: u16 = 0x0005;
pub const CMD_FLASH_GET_CAPACITY: u16 = 0x0006;

// eFuse commands. The kernel implements these; this tool does not drive
// them.
pub const CMD_FUSE_READ: u16 = 0x0101;
pub const CMD_FUSE_SENSE: u16 = 0x0102;
pub const CMD_FUSE_OVERRIDE: u16 = 0x0103;
pub const CMD_FUSE_PROGRAM: u16 = 0x0104;

// Common commands.
pub const CMD_RESET: u16 = 0x0201;
pub const CMD_DOWNLOAD: u16 = 0x0202;
pub const CMD_EXECUTE: u16 = 0x0203;
pub const CMD_GETVER: u16 = 0x0204;

// Extended commands. Only the bad-block-table flag is driven here.
pub const CMD_COM2USB: u16 = 0x0301;
pub const CMD_SWAP_BI: u16 = 0x0302;
pub const CMD_FL_BBT: u16 = 0x0303;
pub const CMD_FL_INTLV: u16 = 0x0304;
pub const CMD_FL_LBA: u16 = 0x0305;

pub const ACK_SUCCESS: i16 = 0;
/// Partial completion of a flash dump or program.
pub const ACK_FLASH_PARTLY: i16 = 1;
/// One erased block.
pub const ACK_FLASH_ERASE: i16 = 2;
/// One verified run of pages.
pub const ACK_FLASH_VERIFY: i16 = 3;
/// General failure; 0xFFFF on the wire.
pub const ACK_FAILED: i16 = -1;

// Flash fault codes.
pub const FLASH_FAILED: i16 = -4;
pub const FLASH_ECC_FAILED: i16 = -5;
pub const FLASH_ERROR_READ: i16 = -100;
pub const FLASH_ERROR_ECC: i16 = -101;
pub const FLASH_ERROR_PROG: i16 = -102;
pub const FLASH_ERROR_ERASE: i16 = -103;
pub const FLASH_ERROR_VERIFY: i16 = -104;
pub const FLASH_ERROR_INIT: i16 = -105;
pub const FLASH_ERROR_OVER_ADDR: i16 = -106;
pub const FLASH_ERROR_PART_ERASE: i16 = -107;
pub const FLASH_ERROR_EOF: i16 = -108;

/// The stock kernel buffers program payloads in a 2 MiB internal buffer;
/// larger requests fail on the device, so they are rejected on the host.
pub const FLASH_PROGRAM_MAX_WRITE_SIZE: usize = 2 * 1024 * 1024;

/// param2 flag asking the kernel to read back and verify what it wrote.
const FLASH_PROGRAM_VERIFY: u32 = 0x0001_0000;

/// Describe a RAM-kernel ACK code.
pub fn ack_description(ack: i16) -> &'static str {
    match ack {
        ACK_SUCCESS => "no error",
        ACK_FLASH_PARTLY => "in-progress flash operation",
        ACK_FLASH_ERASE => "in-progress flash erase",
        ACK_FLASH_VERIFY => "in-progress flash verify",
        ACK_FAILED => "general failure",
        FLASH_FAILED => "flash operation failure",
        FLASH_ECC_FAILED => "flash ECC failure",
        FLASH_ERROR_READ => "error reading flash",
        FLASH_ERROR_ECC => "uncorrectable ECC error",
        FLASH_ERROR_PROG => "error programming flash",
        FLASH_ERROR_ERASE => "error erasing flash",
        FLASH_ERROR_VERIFY => "error verifying flash",
        FLASH_ERROR_INIT => "error initializing flash part",
        FLASH_ERROR_OVER_ADDR => "flash address overflow",
        FLASH_ERROR_PART_ERASE => "flash partial erase error: potential bad block(s)",
        FLASH_ERROR_EOF => "attempt to access flash part past device capacity",
        _ => "unknown error code",
    }
}

/// Simple 16-bit checksum: the byte sum, modulo 2^16.
pub fn calculate_checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |sum, &b| sum.wrapping_add(u16::from(b)))
}

/// On-flash layout of a program payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FileFormat {
    Normal = 0,
    Nb0 = 1,
    Ops = 2,
}

#[derive(Debug, Error)]
pub enum RklError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("kernel boot error: {0}")]
    Boot(#[from] SbpError),

    #[error("RAM kernel is not initialized")]
    KernelNotInitialized,

    #[error("flash subsystem is not initialized")]
    FlashNotInitialized,

    /// The kernel answered with a well-formed failure code.
    #[error(
        "command {command:#06x} failed: ack code {ack} ({})",
        ack_description(*.ack)
    )]
    Device { command: u16, ack: i16, length: u32 },

    /// The kernel answered with an ACK that makes no sense for the command
    /// in flight.
    #[error("command {command:#06x}: unexpected response ack {ack}")]
    UnexpectedAck { command: u16, ack: i16 },

    #[error(
        "checksum error: device sent {expected:#06x}, computed {computed:#06x}"
    )]
    Checksum { expected: u16, computed: u16 },

    #[error("program payload is empty")]
    EmptyPayload,

    #[error(
        "program payload of {len} bytes exceeds the kernel's {}-byte buffer",
        FLASH_PROGRAM_MAX_WRITE_SIZE
    )]
    PayloadTooLarge { len: usize },
}

struct ResponseHeader {
    ack: i16,
    checksum: u16,
    length: u32,
}

impl ResponseHeader {
    /// Classify an unwanted response: negative codes (and -1, the wire's
    /// 0xFFFF) are device-reported failures, anything else is a protocol
    /// mismatch.
    fn into_error(self, command: u16) -> RklError {
        if self.ack < 0 {
            RklError::Device {
                command,
                ack: self.ack,
                length: self.length,
            }
        } else {
            RklError::UnexpectedAck {
                command,
                ack: self.ack,
            }
        }
    }
}

/// Host side of the RAM-kernel protocol.
pub struct RamKernel<'a> {
    channel: &'a mut dyn Channel,
    kernel_init: bool,
    flash_init: bool,
}

impl<'a> RamKernel<'a> {
    pub fn new(channel: &'a mut dyn Channel) -> Self {
        RamKernel {
            channel,
            kernel_init: false,
            flash_init: false,
        }
    }

    /// Declare that a kernel is already running on the other end, e.g. when
    /// attaching to a device a previous session booted.
    pub fn assume_kernel_running(&mut self) {
        self.kernel_init = true;
    }

    fn require_kernel(&self) -> Result<(), RklError> {
        if self.kernel_init {
            Ok(())
        } else {
            Err(RklError::KernelNotInitialized)
        }
    }

    fn require_flash(&self) -> Result<(), RklError> {
        self.require_kernel()?;
        if self.flash_init {
            Ok(())
        } else {
            Err(RklError::FlashNotInitialized)
        }
    }

    fn send_command(
        &mut self,
        command: u16,
        address: u32,
        param1: u32,
        param2: u32,
    ) -> Result<(), RklError> {
        let mut frame = [0u8; FRAME_LEN];
        BigEndian::write_u16(&mut frame[0..2], HEADER_MAGIC);
        BigEndian::write_u16(&mut frame[2..4], command);
        BigEndian::write_u32(&mut frame[4..8], address);
        BigEndian::write_u32(&mut frame[8..12], param1);
        BigEndian::write_u32(&mut frame[12..16], param2);
        trace!("RKL > {frame:02x?}");
        self.channel.write(&frame)?;
        Ok(())
    }

    fn read_response(&mut self) -> Result<ResponseHeader, RklError> {
        let mut raw = [0u8; RESPONSE_LEN];
        self.channel.read_exact(&mut raw)?;
        let header = ResponseHeader {
            ack: BigEndian::read_i16(&raw[0..2]),
            checksum: BigEndian::read_u16(&raw[2..4]),
            length: BigEndian::read_u32(&raw[4..8]),
        };
        trace!(
            "RKL < ack {} checksum {:#06x} length {}",
            header.ack,
            header.checksum,
            header.length
        );
        Ok(header)
    }

    fn read_payload(&mut self, length: u32) -> Result<Vec<u8>, RklError> {
        let mut payload = vec![0u8; length as usize];
        self.channel.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Send one command and require a single SUCCESS response.
    fn simple_command(
        &mut self,
        command: u16,
        address: u32,
        param1: u32,
        param2: u32,
    ) -> Result<ResponseHeader, RklError> {
        self.send_command(command, address, param1, param2)?;
        let header = self.read_response()?;
        if header.ack != ACK_SUCCESS {
            return Err(header.into_error(command));
        }
        Ok(header)
    }

    /// Download the kernel image itself and hand the CPU to it.
    ///
    /// This drives the boot ROM's download protocol, so it is the one
    /// operation valid before the kernel runs. Launching the kernel resets
    /// the device's USB interface, so the channel is re-opened before this
    /// returns.
    pub fn run_image(
        &mut self,
        image: &mut dyn Read,
        size: u32,
        origin: u32,
        progress: &mut dyn ProgressSink,
    ) -> Result<(), RklError> {
        {
            let mut boot = SerialBoot::new(&mut *self.channel);
            boot.write_file(FileType::Application, origin, size, image, progress)?;
            boot.complete_boot()?;
        }
        mx_channel::reopen(&mut *self.channel)?;
        self.kernel_init = true;
        debug!("RAM kernel launched at {origin:#010x}");
        Ok(())
    }

    /// Initialize the kernel's flash subsystem. Required before any flash
    /// operation.
    pub fn flash_initial(&mut self) -> Result<(), RklError> {
        self.simple_command(CMD_FLASH_INITIAL, 0, 0, 0)?;
        self.flash_init = true;
        Ok(())
    }

    /// Query the kernel for the part number and flash model string.
    pub fn getver(&mut self) -> Result<(u16, Vec<u8>), RklError> {
        self.require_kernel()?;
        self.send_command(CMD_GETVER, 0, 0, 0)?;
        let header = self.read_response()?;
        if header.ack != ACK_SUCCESS {
            return Err(header.into_error(CMD_GETVER));
        }
        // Part number rides in the checksum field; the flash model string is
        // the payload.
        let model = self.read_payload(header.length)?;
        Ok((header.checksum, model))
    }

    /// Flash capacity in bytes. Carried in the length field; no payload.
    pub fn flash_get_capacity(&mut self) -> Result<u32, RklError> {
        self.require_flash()?;
        let header = self.simple_command(CMD_FLASH_GET_CAPACITY, 0, 0, 0)?;
        Ok(header.length)
    }

    /// Dump `size` bytes of flash starting at `address`.
    ///
    /// The kernel streams the data in partial responses, each carrying its
    /// own checksum, which is verified here before the chunk is accepted.
    /// Some kernel builds close the stream with an explicit SUCCESS, others
    /// just stop after the final partial chunk; both are accepted, and no
    /// read is issued once the requested size has been satisfied.
    pub fn flash_dump(&mut self, address: u32, size: u32) -> Result<Vec<u8>, RklError> {
        self.require_flash()?;
        self.send_command(CMD_FLASH_DUMP, address, size, 0)?;

        let mut data = Vec::with_capacity(size as usize);
        loop {
            let header = self.read_response()?;
            if header.ack != ACK_FLASH_PARTLY && header.ack != ACK_SUCCESS {
                return Err(header.into_error(CMD_FLASH_DUMP));
            }

            let payload = self.read_payload(header.length)?;
            let computed = calculate_checksum(&payload);
            if computed != header.checksum {
                return Err(RklError::Checksum {
                    expected: header.checksum,
                    computed,
                });
            }
            data.extend_from_slice(&payload);

            if header.ack == ACK_SUCCESS || data.len() >= size as usize {
                return Ok(data);
            }
        }
    }

    /// Erase `size` bytes of flash starting at `address`.
    ///
    /// Flash erases whole blocks, so the device may erase past `size` to the
    /// next block boundary. Each erased block is reported through
    /// `progress` with the block index and block size from the response.
    pub fn flash_erase(
        &mut self,
        address: u32,
        size: u32,
        progress: &mut dyn ProgressSink,
    ) -> Result<(), RklError> {
        self.require_flash()?;
        self.send_command(CMD_FLASH_ERASE, address, size, 0)?;

        loop {
            let header = self.read_response()?;
            match header.ack {
                ACK_FLASH_ERASE => {
                    progress.on_block_erased(header.checksum, header.length)
                }
                ACK_SUCCESS => return Ok(()),
                _ => return Err(header.into_error(CMD_FLASH_ERASE)),
            }
        }
    }

    /// Program `data` into flash at `address`.
    ///
    /// The kernel acknowledges the request before any data moves; the whole
    /// payload is then written (the channel handles transport chunking) and
    /// the kernel streams per-page completions. With `read_back_verify` the
    /// program completions are followed by verify completions; the kernel
    /// never interleaves the two phases. A single SUCCESS closes the whole
    /// operation.
    pub fn flash_program(
        &mut self,
        address: u32,
        data: &[u8],
        file_format: FileFormat,
        read_back_verify: bool,
        progress: &mut dyn ProgressSink,
    ) -> Result<(), RklError> {
        self.require_flash()?;
        if data.is_empty() {
            return Err(RklError::EmptyPayload);
        }
        if data.len() > FLASH_PROGRAM_MAX_WRITE_SIZE {
            return Err(RklError::PayloadTooLarge { len: data.len() });
        }

        let mut flags = file_format as u32;
        if read_back_verify {
            flags |= FLASH_PROGRAM_VERIFY;
        }

        self.send_command(CMD_FLASH_PROGRAM, address, data.len() as u32, flags)?;
        let header = self.read_response()?;
        if header.ack != ACK_SUCCESS {
            return Err(header.into_error(CMD_FLASH_PROGRAM));
        }

        self.channel.write(data)?;

        let mut verifying = false;
        loop {
            let header = self.read_response()?;
            match header.ack {
                ACK_SUCCESS => return Ok(()),
                ACK_FLASH_PARTLY if !verifying => {
                    progress.on_page_programmed(header.checksum, header.length)
                }
                ACK_FLASH_VERIFY if read_back_verify => {
                    verifying = true;
                    progress.on_page_verified(header.checksum, header.length)
                }
                _ => return Err(header.into_error(CMD_FLASH_PROGRAM)),
            }
        }
    }

    /// Reset the device CPU. Fire-and-forget: the kernel is gone before it
    /// could answer.
    pub fn reset(&mut self) -> Result<(), RklError> {
        self.send_command(CMD_RESET, 0, 0, 0)?;
        self.kernel_init = false;
        self.flash_init = false;
        Ok(())
    }

    /// Enable or disable bad-block-table handling in the kernel.
    pub fn flash_set_bbt(&mut self, enable: bool) -> Result<(), RklError> {
        self.require_kernel()?;
        self.simple_command(CMD_FL_BBT, 0, u32::from(enable), 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_channel::mock::MockChannel;
    use mx_progress::NullProgress;

    /// Build a kernel over `chan` with both session flags satisfied. The
    /// mock must already have the `flash_initial` SUCCESS response queued
    /// ahead of whatever the test wants the device to say next.
    fn flash_ready(chan: &mut MockChannel) -> RamKernel<'_> {
        let mut kernel = RamKernel::new(chan);
        kernel.assume_kernel_running();
        kernel.flash_initial().unwrap();
        kernel
    }

    fn queue_flash_initial_ok(chan: &mut MockChannel) {
        chan.queue_rkl_response(ACK_SUCCESS, 0, 0, &[]);
    }

    #[test]
    fn checksum_is_byte_sum_mod_64k() {
        assert_eq!(calculate_checksum(&[]), 0);
        assert_eq!(calculate_checksum(&[1, 2, 3]), 6);
        // 300 * 255 = 76500, which wraps past 16 bits
        let buf = vec![0xFF; 300];
        assert_eq!(calculate_checksum(&buf), (76500 % 65536) as u16);
    }

    #[test]
    fn command_frames_are_sixteen_bytes() {
        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        let mut kernel = flash_ready(&mut chan);
        kernel.reset().unwrap();
        drop(kernel);

        for frame in chan.sent() {
            assert_eq!(frame.len(), 16);
        }
        assert_eq!(
            chan.sent()[0],
            vec![6, 6, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn capacity_is_carried_in_the_length_field() {
        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        // ack 0, checksum 0xBEEF, length 0x0001FFFF
        chan.queue_bytes(&[0x00, 0x00, 0xBE, 0xEF, 0x00, 0x01, 0xFF, 0xFF]);

        let mut kernel = flash_ready(&mut chan);
        assert_eq!(kernel.flash_get_capacity().unwrap(), 0x1FFFF);
        drop(kernel);

        assert_eq!(
            chan.sent()[1],
            vec![6, 6, 0, 6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn getver_returns_part_number_and_model() {
        let mut chan = MockChannel::new();
        chan.queue_rkl_response(ACK_SUCCESS, 25, 4, b"NAND");

        let mut kernel = RamKernel::new(&mut chan);
        kernel.assume_kernel_running();
        let (part, model) = kernel.getver().unwrap();
        assert_eq!(part, 25);
        assert_eq!(model, b"NAND");
    }

    #[test]
    fn dump_concatenates_partial_chunks() {
        let first = vec![0x11u8; 1024];
        let second = vec![0x22u8; 1024];

        // SUCCESS-terminated stream
        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        chan.queue_rkl_response(ACK_FLASH_PARTLY, calculate_checksum(&first), 1024, &first);
        chan.queue_rkl_response(ACK_SUCCESS, calculate_checksum(&second), 1024, &second);
        let mut kernel = flash_ready(&mut chan);
        let data = kernel.flash_dump(0, 2048).unwrap();
        assert_eq!(data.len(), 2048);
        assert_eq!(&data[..1024], &first[..]);
        assert_eq!(&data[1024..], &second[..]);

        // stream that just stops at the final FLASH_PARTLY chunk
        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        chan.queue_rkl_response(ACK_FLASH_PARTLY, calculate_checksum(&first), 1024, &first);
        chan.queue_rkl_response(ACK_FLASH_PARTLY, calculate_checksum(&second), 1024, &second);
        let mut kernel = flash_ready(&mut chan);
        let data = kernel.flash_dump(0, 2048).unwrap();
        assert_eq!(data.len(), 2048);
        drop(kernel);
        assert_eq!(chan.unread(), 0);
    }

    #[test]
    fn dump_detects_corrupt_chunks() {
        let mut chunk = vec![0x11u8; 1024];
        let good_checksum = calculate_checksum(&chunk);
        chunk[17] ^= 0xFF; // corrupt one byte after checksum computation

        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        chan.queue_rkl_response(ACK_FLASH_PARTLY, good_checksum, 1024, &chunk);

        let mut kernel = flash_ready(&mut chan);
        match kernel.flash_dump(0, 2048).unwrap_err() {
            RklError::Checksum { expected, computed } => {
                assert_eq!(expected, good_checksum);
                assert_eq!(computed, calculate_checksum(&chunk));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn erase_reports_every_block_in_order() {
        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        for block in 0..5 {
            chan.queue_rkl_response(ACK_FLASH_ERASE, block, 0x20000, &[]);
        }
        chan.queue_rkl_response(ACK_SUCCESS, 0, 0, &[]);

        struct Blocks(Vec<(u16, u32)>);
        impl ProgressSink for Blocks {
            fn on_block_erased(&mut self, block: u16, size: u32) {
                self.0.push((block, size));
            }
        }

        let mut blocks = Blocks(Vec::new());
        let mut kernel = flash_ready(&mut chan);
        kernel.flash_erase(0, 1, &mut blocks).unwrap();
        assert_eq!(
            blocks.0,
            vec![(0, 0x20000), (1, 0x20000), (2, 0x20000), (3, 0x20000), (4, 0x20000)]
        );
    }

    #[test]
    fn erase_fails_on_device_error() {
        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        chan.queue_rkl_response(ACK_FLASH_ERASE, 0, 0x20000, &[]);
        chan.queue_rkl_response(FLASH_ERROR_ERASE, 0, 0, &[]);

        let mut kernel = flash_ready(&mut chan);
        match kernel.flash_erase(0, 1, &mut NullProgress).unwrap_err() {
            RklError::Device { command, ack, .. } => {
                assert_eq!(command, CMD_FLASH_ERASE);
                assert_eq!(ack, FLASH_ERROR_ERASE);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn program_streams_then_verifies() {
        let data = vec![0xA5u8; 4096];

        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        chan.queue_rkl_response(ACK_SUCCESS, 0, 0, &[]); // go-ahead
        chan.queue_rkl_response(ACK_FLASH_PARTLY, 0, 2048, &[]);
        chan.queue_rkl_response(ACK_FLASH_PARTLY, 1, 2048, &[]);
        chan.queue_rkl_response(ACK_FLASH_VERIFY, 0, 2048, &[]);
        chan.queue_rkl_response(ACK_FLASH_VERIFY, 1, 2048, &[]);
        chan.queue_rkl_response(ACK_SUCCESS, 0, 0, &[]);

        struct Phases {
            programmed: Vec<(u16, u32)>,
            verified: Vec<(u16, u32)>,
        }
        impl ProgressSink for Phases {
            fn on_page_programmed(&mut self, block: u16, len: u32) {
                self.programmed.push((block, len));
            }
            fn on_page_verified(&mut self, block: u16, len: u32) {
                self.verified.push((block, len));
            }
        }

        let mut phases = Phases {
            programmed: Vec::new(),
            verified: Vec::new(),
        };
        let mut kernel = flash_ready(&mut chan);
        kernel
            .flash_program(0x40000, &data, FileFormat::Normal, true, &mut phases)
            .unwrap();
        drop(kernel);

        assert_eq!(phases.programmed, vec![(0, 2048), (1, 2048)]);
        assert_eq!(phases.verified, vec![(0, 2048), (1, 2048)]);

        // sent: flash_initial, program command, payload
        let frame = &chan.sent()[1];
        assert_eq!(&frame[0..4], &[0x06, 0x06, 0x00, 0x04]);
        assert_eq!(&frame[4..8], &0x40000u32.to_be_bytes());
        assert_eq!(&frame[8..12], &4096u32.to_be_bytes());
        assert_eq!(&frame[12..16], &0x0001_0000u32.to_be_bytes());
        assert_eq!(chan.sent()[2].len(), 4096);
    }

    #[test]
    fn program_rejects_interleaved_phases() {
        let data = vec![0u8; 16];

        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        chan.queue_rkl_response(ACK_SUCCESS, 0, 0, &[]);
        chan.queue_rkl_response(ACK_FLASH_VERIFY, 0, 16, &[]);
        chan.queue_rkl_response(ACK_FLASH_PARTLY, 0, 16, &[]);

        let mut kernel = flash_ready(&mut chan);
        match kernel
            .flash_program(0, &data, FileFormat::Normal, true, &mut NullProgress)
            .unwrap_err()
        {
            RklError::UnexpectedAck { command, ack } => {
                assert_eq!(command, CMD_FLASH_PROGRAM);
                assert_eq!(ack, ACK_FLASH_PARTLY);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn program_rejects_verify_frames_when_not_requested() {
        let data = vec![0u8; 16];

        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        chan.queue_rkl_response(ACK_SUCCESS, 0, 0, &[]);
        chan.queue_rkl_response(ACK_FLASH_VERIFY, 0, 16, &[]);

        let mut kernel = flash_ready(&mut chan);
        assert!(matches!(
            kernel
                .flash_program(0, &data, FileFormat::Normal, false, &mut NullProgress)
                .unwrap_err(),
            RklError::UnexpectedAck { .. }
        ));
    }

    #[test]
    fn oversized_program_fails_before_any_write() {
        let data = vec![0u8; FLASH_PROGRAM_MAX_WRITE_SIZE + 1];

        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        let mut kernel = flash_ready(&mut chan);
        assert!(matches!(
            kernel.flash_program(0, &data, FileFormat::Normal, false, &mut NullProgress),
            Err(RklError::PayloadTooLarge { .. })
        ));
        drop(kernel);

        // only the flash_initial command ever went out
        assert_eq!(chan.sent().len(), 1);
    }

    #[test]
    fn empty_program_is_rejected() {
        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        let mut kernel = flash_ready(&mut chan);
        assert!(matches!(
            kernel.flash_program(0, &[], FileFormat::Normal, false, &mut NullProgress),
            Err(RklError::EmptyPayload)
        ));
    }

    #[test]
    fn flash_commands_are_gated_on_session_state() {
        let mut chan = MockChannel::new();
        let mut kernel = RamKernel::new(&mut chan);
        assert!(matches!(
            kernel.flash_dump(0, 16),
            Err(RklError::KernelNotInitialized)
        ));
        assert!(matches!(kernel.getver(), Err(RklError::KernelNotInitialized)));
        assert!(matches!(
            kernel.flash_set_bbt(true),
            Err(RklError::KernelNotInitialized)
        ));

        kernel.assume_kernel_running();
        assert!(matches!(
            kernel.flash_dump(0, 16),
            Err(RklError::FlashNotInitialized)
        ));
        assert!(matches!(
            kernel.flash_get_capacity(),
            Err(RklError::FlashNotInitialized)
        ));
        assert!(matches!(
            kernel.flash_erase(0, 16, &mut NullProgress),
            Err(RklError::FlashNotInitialized)
        ));
        assert!(matches!(
            kernel.flash_program(0, &[0], FileFormat::Normal, false, &mut NullProgress),
            Err(RklError::FlashNotInitialized)
        ));
    }

    #[test]
    fn flash_initial_is_allowed_before_anything_else() {
        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        let mut kernel = RamKernel::new(&mut chan);
        kernel.flash_initial().unwrap();
    }

    #[test]
    fn flash_initial_failure_reports_the_device_code() {
        let mut chan = MockChannel::new();
        chan.queue_rkl_response(FLASH_ERROR_INIT, 0, 0, &[]);
        let mut kernel = RamKernel::new(&mut chan);
        match kernel.flash_initial().unwrap_err() {
            RklError::Device { command, ack, .. } => {
                assert_eq!(command, CMD_FLASH_INITIAL);
                assert_eq!(ack, FLASH_ERROR_INIT);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn reset_clears_session_state() {
        let mut chan = MockChannel::new();
        queue_flash_initial_ok(&mut chan);
        let mut kernel = flash_ready(&mut chan);
        kernel.reset().unwrap();
        assert!(matches!(
            kernel.flash_dump(0, 16),
            Err(RklError::KernelNotInitialized)
        ));
    }

    #[test]
    fn set_bbt_flag_rides_in_param1() {
        let mut chan = MockChannel::new();
        chan.queue_rkl_response(ACK_SUCCESS, 0, 0, &[]);

        let mut kernel = RamKernel::new(&mut chan);
        kernel.assume_kernel_running();
        kernel.flash_set_bbt(true).unwrap();
        drop(kernel);

        let frame = &chan.sent()[0];
        assert_eq!(&frame[0..4], &[0x06, 0x06, 0x03, 0x03]);
        assert_eq!(&frame[8..12], &1u32.to_be_bytes());
    }

    #[test]
    fn run_image_boots_and_unlocks_the_session() {
        let mut chan = MockChannel::new();
        chan.queue_bytes(&[0x12, 0x34, 0x34, 0x12]); // download ACK
        chan.queue_bytes(&[0x88, 0x88, 0x88, 0x88]); // boot complete
        chan.queue_rkl_response(ACK_SUCCESS, 0, 0, &[]); // flash_initial

        let image = vec![0xEE; 64];
        let mut kernel = RamKernel::new(&mut chan);
        kernel
            .run_image(&mut image.as_slice(), 64, 0x8000_4000, &mut NullProgress)
            .unwrap();
        // getver would fail here if run_image had not set the session up
        kernel.flash_initial().unwrap();
    }

    #[test]
    fn ack_descriptions_cover_the_error_table() {
        assert_eq!(ack_description(ACK_FAILED), "general failure");
        assert!(ack_description(FLASH_ERROR_EOF).contains("capacity"));
        assert_eq!(ack_description(-12345), "unknown error code");
    }
}
