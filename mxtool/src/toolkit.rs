// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bootstrap orchestrator.
//!
//! A run is a fixed sequence: probe the ROM, sanity-poke memory, replay the
//! board's register-init script, and then either hand an application image
//! to the ROM or download the RAM kernel and drive a flash operation
//! through it. The RAM-kernel path always ends by resetting the CPU and
//! re-probing the ROM, whether or not the flash operation succeeded, so a
//! botched flash never leaves the board wedged in kernel limbo.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use mx_bspinfo::BoardSupportInfo;
use mx_channel::{Channel, ChannelError};
use mx_progress::ProgressSink;
use mx_rkl::{FileFormat, RamKernel};
use mx_sbp::{status_string, AccessWidth, SerialBoot};

use crate::display::{hexdump, FlashBar, TransferBar};

/// Flash is always programmed in block-sized units.
const PROGRAM_BLOCK: usize = 0x20000;

/// Dumps read this much per RAM-kernel round trip.
const DUMP_PAGE: u32 = 2048;

/// Settle time between the last flash response and the reset command.
const RESET_SETTLE: Duration = Duration::from_secs(1);

/// Settle time after reset before re-probing the ROM.
const REPROBE_SETTLE: Duration = Duration::from_secs(2);

/// A flash operation to run once the RAM kernel is up.
pub enum FlashOp {
    Program {
        file: PathBuf,
        address: u32,
    },
    Dump {
        bytes: u32,
        address: u32,
        dump_file: PathBuf,
        print: bool,
    },
    Erase {
        bytes: u32,
        address: u32,
    },
}

pub struct Toolkit {
    bsp: BoardSupportInfo,
    channel: Box<dyn Channel>,
}

impl Toolkit {
    pub fn new(bsp: BoardSupportInfo, channel: Box<dyn Channel>) -> Self {
        Toolkit { bsp, channel }
    }

    /// Open the channel, probe the ROM, check memory, and replay the init
    /// script. Everything else assumes this ran first.
    pub fn start(&mut self, init_file: Option<&Path>) -> Result<()> {
        info!("opening bootstrap communications channel");
        self.channel
            .open()
            .context("failed to open communications channel")?;

        let mut sbp = SerialBoot::new(&mut *self.channel);
        let status = sbp.get_status().context("initial status query")?;
        info!("initial boot status: {}", status_string(status));

        self.memory_test()?;
        self.memory_init(init_file)?;
        Ok(())
    }

    /// Poke two known patterns into main memory and read them back. A
    /// mismatch usually means the init script did not match the board; the
    /// download that follows will sort fact from fiction, so this only
    /// warns.
    fn memory_test(&mut self) -> Result<()> {
        info!("memory test");
        let mut sbp = SerialBoot::new(&mut *self.channel);
        for (offset, pattern) in [(0u32, 0xBEEF_DEADu32), (0x1000, 0xBEEF_CAFE)] {
            let address = self.bsp.sdram_start.wrapping_add(offset);
            sbp.write_memory(address, AccessWidth::Word, pattern)
                .with_context(|| format!("memory test write at {address:#010x}"))?;
            let check = sbp
                .read_memory_single(address, AccessWidth::Word)
                .with_context(|| format!("memory test read at {address:#010x}"))?;
            if check != pattern {
                warn!(
                    "memory check at {address:#010x} failed: \
                     wrote {pattern:#010x}, read back {check:#010x}"
                );
            }
        }
        Ok(())
    }

    fn memory_init(&mut self, init_file: Option<&Path>) -> Result<()> {
        let path = match init_file {
            Some(path) => path,
            None => {
                warn!("no memory initialization file specified");
                warn!("device communication may not work at all");
                return Ok(());
            }
        };

        let entries = mx_initscript::load(path)
            .with_context(|| format!("loading init script {}", path.display()))?;
        info!(
            "initializing processor memory ({} writes from {})",
            entries.len(),
            path.display()
        );

        let mut sbp = SerialBoot::new(&mut *self.channel);
        for entry in &entries {
            log::debug!(
                "write {:#010x} to {:#010x} ({}-bit)",
                entry.value,
                entry.address,
                entry.width.bits()
            );
            sbp.write_memory(entry.address, entry.width, entry.value)
                .with_context(|| {
                    format!("init script write to {:#010x}", entry.address)
                })?;
        }
        Ok(())
    }

    /// Download an application image and hand the CPU to it. With `console`
    /// set, keep reading the channel and echo whatever the application
    /// prints until interrupted.
    pub fn run_application(
        &mut self,
        file: &Path,
        load_address: u32,
        console: bool,
    ) -> Result<()> {
        let (mut image, size) = open_image(file)?;
        info!(
            "loading application {} ({size} bytes) to {load_address:#010x}",
            file.display()
        );

        let mut bar = TransferBar::new("load");
        let mut sbp = SerialBoot::new(&mut *self.channel);
        sbp.write_file(
            mx_sbp::FileType::Application,
            load_address,
            size,
            &mut image,
            &mut bar,
        )
        .context("application download")?;
        bar.finish();
        sbp.complete_boot().context("boot hand-off")?;
        info!("application write/execute OK");

        if console {
            self.console_echo()?;
        }
        Ok(())
    }

    fn console_echo(&mut self) -> Result<()> {
        info!("echoing device output; press Ctrl-C to stop");
        let stop = Arc::new(AtomicBool::new(false));
        let handler_stop = Arc::clone(&stop);
        ctrlc::set_handler(move || handler_stop.store(true, Ordering::SeqCst))
            .context("installing Ctrl-C handler")?;

        let mut stdout = io::stdout();
        while !stop.load(Ordering::SeqCst) {
            let mut byte = [0u8; 1];
            match self.channel.read_exact(&mut byte) {
                Ok(()) => {
                    stdout.write_all(&byte)?;
                    stdout.flush()?;
                }
                // Silence is fine; keep listening.
                Err(ChannelError::ReadTimeout { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Download the RAM kernel and run a flash operation through it.
    ///
    /// The reset/reprobe tail runs no matter how the flash operation went.
    pub fn run_ram_kernel(
        &mut self,
        kernel_file: &Path,
        origin: u32,
        set_bbt: bool,
        op: &FlashOp,
    ) -> Result<()> {
        let (mut image, size) = open_image(kernel_file)?;
        info!(
            "loading and executing RAM kernel {} ({size} bytes) at {origin:#010x}",
            kernel_file.display()
        );

        let mut kernel = RamKernel::new(&mut *self.channel);
        let mut bar = TransferBar::new("load");
        kernel
            .run_image(&mut image, size, origin, &mut bar)
            .context("RAM kernel launch")?;
        bar.finish();

        let result = Self::flash_session(&mut kernel, set_bbt, op);
        if let Err(err) = &result {
            error!("RAM kernel session failed: {err:#}");
        }

        // The kernel sometimes needs a beat after flash traffic before it
        // will take the reset command.
        info!("resetting CPU");
        std::thread::sleep(RESET_SETTLE);
        if let Err(err) = kernel.reset() {
            warn!("reset command failed: {err}");
        }
        drop(kernel);

        if let Err(err) = mx_channel::reopen(&mut *self.channel) {
            warn!("channel re-open after reset failed: {err}");
        }
        std::thread::sleep(REPROBE_SETTLE);

        let mut sbp = SerialBoot::new(&mut *self.channel);
        match sbp.get_status() {
            Ok(status) => {
                info!("bootstrap status after reset: {}", status_string(status))
            }
            Err(err) => warn!("status probe after reset failed: {err}"),
        }

        result
    }

    fn flash_session(
        kernel: &mut RamKernel<'_>,
        set_bbt: bool,
        op: &FlashOp,
    ) -> Result<()> {
        info!(
            "set flash BBT handling: {}",
            if set_bbt { "enable" } else { "disable" }
        );
        kernel.flash_set_bbt(set_bbt)?;

        info!("initializing flash part");
        kernel.flash_initial()?;

        let (part, model) = kernel.getver()?;
        info!("part number:    {part}");
        info!("flash model:    {}", String::from_utf8_lossy(&model));

        let capacity = kernel.flash_get_capacity()?;
        info!(
            "flash capacity: {} Mb",
            u64::from(capacity) * 8 / (1024 * 1024)
        );

        match op {
            FlashOp::Program { file, address } => {
                Self::flash_program_file(kernel, file, *address)
            }
            FlashOp::Dump {
                bytes,
                address,
                dump_file,
                print,
            } => Self::flash_dump_range(kernel, *address, *bytes, dump_file, *print),
            FlashOp::Erase { bytes, address } => {
                Self::flash_erase_range(kernel, *address, *bytes)
            }
        }
    }

    /// Program a file block by block with read-back verification.
    ///
    /// The kernel always erases and writes whole blocks from the block
    /// boundary, so a start address inside a block gets the gap padded with
    /// zeros.
    fn flash_program_file(
        kernel: &mut RamKernel<'_>,
        path: &Path,
        start_address: u32,
    ) -> Result<()> {
        let data_size = std::fs::metadata(path)
            .with_context(|| format!("opening {}", path.display()))?
            .len();
        if data_size == 0 {
            bail!("{} is empty; nothing to program", path.display());
        }
        info!(
            "programming {} ({data_size} bytes) to {start_address:#010x}",
            path.display()
        );

        let (block_start, pad) = block_align(start_address, PROGRAM_BLOCK);
        if pad > 0 {
            warn!("start address does not fall on a block boundary");
            warn!("writing {pad} pad bytes from {block_start:#010x}");
        }

        let mut file = File::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut bar = FlashBar::new(data_size + pad as u64);

        let mut address = block_start;
        let mut chunk = vec![0u8; pad];
        (&mut file)
            .take((PROGRAM_BLOCK - pad) as u64)
            .read_to_end(&mut chunk)?;

        while !chunk.is_empty() {
            kernel
                .flash_program(address, &chunk, FileFormat::Normal, true, &mut bar)
                .with_context(|| format!("programming block at {address:#010x}"))?;
            address = address.wrapping_add(chunk.len() as u32);

            chunk.clear();
            (&mut file).take(PROGRAM_BLOCK as u64).read_to_end(&mut chunk)?;
        }
        bar.finish();
        info!("flash program complete");
        Ok(())
    }

    fn flash_dump_range(
        kernel: &mut RamKernel<'_>,
        start_address: u32,
        count: u32,
        dump_file: &Path,
        print: bool,
    ) -> Result<()> {
        info!("dumping flash @ {start_address:#010x}, count {count}");
        info!("also dumping to {}", dump_file.display());
        let mut out = File::create(dump_file)
            .with_context(|| format!("creating {}", dump_file.display()))?;

        let end = start_address
            .checked_add(count)
            .context("dump range overflows the address space")?;

        let mut stdout = io::stdout();
        let mut address = start_address;
        while address < end {
            let data = kernel
                .flash_dump(address, DUMP_PAGE)
                .with_context(|| format!("dumping page at {address:#010x}"))?;
            if print {
                hexdump(&mut stdout, &data, address)?;
            }
            out.write_all(&data)?;
            address = address.saturating_add(DUMP_PAGE);
        }
        Ok(())
    }

    fn flash_erase_range(
        kernel: &mut RamKernel<'_>,
        start_address: u32,
        bytes: u32,
    ) -> Result<()> {
        info!("erase {bytes} bytes starting at {start_address:#010x}");

        struct EraseReport;
        impl ProgressSink for EraseReport {
            fn on_block_erased(&mut self, block: u16, block_size: u32) {
                info!("erased block {block} (size {block_size} bytes)");
            }
        }

        kernel.flash_erase(start_address, bytes, &mut EraseReport)?;
        info!("flash erase complete");
        Ok(())
    }
}

impl Drop for Toolkit {
    fn drop(&mut self) {
        self.channel.close();
    }
}

/// Open an image file and measure it; downloads need the size up front.
fn open_image(path: &Path) -> Result<(File, u32)> {
    let file =
        File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("inspecting {}", path.display()))?
        .len();
    let size = u32::try_from(len)
        .ok()
        .with_context(|| format!("{} is too large to download", path.display()))?;
    Ok((file, size))
}

/// Round `address` down to its block boundary; also returns the number of
/// pad bytes between the boundary and the address.
fn block_align(address: u32, block_size: usize) -> (u32, usize) {
    let block_start = address & !(block_size as u32 - 1);
    (block_start, (address - block_start) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_alignment_and_padding() {
        assert_eq!(block_align(0, PROGRAM_BLOCK), (0, 0));
        assert_eq!(block_align(0x20000, PROGRAM_BLOCK), (0x20000, 0));
        assert_eq!(block_align(0x20004, PROGRAM_BLOCK), (0x20000, 4));
        assert_eq!(block_align(0x3FFFF, PROGRAM_BLOCK), (0x20000, 0x1FFFF));
        assert_eq!(block_align(0x12345678, PROGRAM_BLOCK), (0x12340000, 0x5678));
    }
}
