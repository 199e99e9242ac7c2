// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line bootstrap and flash tool for i.MX-family application
//! processors in serial boot mode.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use directories::ProjectDirs;
use log::info;
use mx_bspinfo::{BoardSupportInfo, BspTable};
use mx_channel::{Channel, UartChannel, UsbChannel};

mod display;
mod toolkit;

use toolkit::{FlashOp, Toolkit};

#[derive(Parser)]
#[clap(name = "mxtool", version, max_term_width = 80)]
/// Bootstrap i.MX processors over UART or USB: run bare applications, or
/// program, dump and erase flash through a downloaded RAM kernel.
struct Args {
    #[clap(flatten)]
    common: CommonOpts,

    #[clap(subcommand)]
    command: Command,
}

#[derive(ClapArgs)]
struct CommonOpts {
    /// Platform BSP name (e.g. mx25).
    #[clap(long = "bsp", short = 'b', value_name = "PLATFORM", global = true)]
    bsp: Option<String>,

    /// BSP table file, merged over the per-user table. Defaults to
    /// ./bspinfo.conf.
    #[clap(
        long = "bsp-config",
        short = 'c',
        value_name = "CONFIGFILE",
        global = true
    )]
    bsp_config: Option<PathBuf>,

    /// Memory initialization file (overrides the BSP entry).
    #[clap(
        long = "initialization-file",
        short = 'i',
        value_name = "FILE",
        global = true
    )]
    init_file: Option<PathBuf>,

    /// Use serial port DEVICE instead of USB.
    #[clap(
        long = "serialport",
        short = 's',
        value_name = "DEVICE",
        global = true,
        conflicts_with = "usb"
    )]
    serialport: Option<String>,

    /// Override the BSP USB vendor/product ID.
    #[clap(long = "usb", short = 'u', value_name = "VID[:PID]", global = true)]
    usb: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Flash operations through a downloaded RAM kernel.
    Flash {
        #[clap(flatten)]
        opts: FlashOpts,

        #[clap(subcommand)]
        op: FlashCommand,
    },

    /// Download an application image and hand control to it.
    Run {
        /// Image file to execute.
        file: PathBuf,

        /// Load (and entry) address.
        #[clap(parse(try_from_str = parse_num))]
        address: u32,

        /// Echo device serial output afterwards, until Ctrl-C.
        #[clap(long)]
        console: bool,
    },

    /// List the boards defined in the BSP table.
    Listbsp,
}

#[derive(ClapArgs)]
struct FlashOpts {
    /// RAM kernel binary (overrides the BSP entry).
    #[clap(long = "ram-kernel", short = 'k', value_name = "FILE")]
    ram_kernel: Option<PathBuf>,

    /// RAM kernel origin address (defaults to the BSP value).
    #[clap(
        long = "ram-kernel-address",
        short = 'a',
        value_name = "ADDRESS",
        parse(try_from_str = parse_num)
    )]
    ram_kernel_address: Option<u32>,

    /// Enable bad-block-table handling in the RAM kernel.
    #[clap(long)]
    bbt: bool,
}

#[derive(Subcommand)]
enum FlashCommand {
    /// Program FILE into flash, with read-back verification.
    Program {
        file: PathBuf,

        /// Flash start address.
        #[clap(default_value = "0", parse(try_from_str = parse_num))]
        address: u32,
    },

    /// Dump flash contents.
    Dump {
        /// Number of bytes to dump.
        #[clap(parse(try_from_str = parse_num))]
        bytes: u32,

        /// Flash start address.
        #[clap(default_value = "0", parse(try_from_str = parse_num))]
        address: u32,

        /// File the raw dump is written to.
        #[clap(
            long = "dump-file",
            short = 'f',
            value_name = "FILE",
            default_value = "dump.bin"
        )]
        dump_file: PathBuf,

        /// Do not hex-dump to the console.
        #[clap(long = "no-print", short = 'n')]
        no_print: bool,
    },

    /// Erase flash. Whole blocks: the erase may extend past the requested
    /// size to the next block boundary.
    Erase {
        /// Number of bytes to erase.
        #[clap(parse(try_from_str = parse_num))]
        bytes: u32,

        /// Flash start address.
        #[clap(default_value = "0", parse(try_from_str = parse_num))]
        address: u32,
    },
}

/// Integer argument, any base by prefix.
fn parse_num(token: &str) -> Result<u32, String> {
    mx_initscript::parse_int(token)
        .ok_or_else(|| format!("invalid integer {token:?}"))
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp(None)
    .init();

    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    match &args.command {
        Command::Listbsp => run_listbsp(&args.common),
        Command::Run {
            file,
            address,
            console,
        } => run_application(&args.common, file, *address, *console),
        Command::Flash { opts, op } => run_flash(&args.common, opts, op),
    }
}

fn run_listbsp(common: &CommonOpts) -> Result<()> {
    let table = load_bsp_table(common)?;
    println!("Listing BSP data:");
    println!("-----------------");
    for (name, info) in &table {
        println!(" {name:<10} -- {}", info.description);
    }
    Ok(())
}

fn run_application(
    common: &CommonOpts,
    file: &PathBuf,
    address: u32,
    console: bool,
) -> Result<()> {
    let bsp = select_bsp(common)?;
    let init_file = common
        .init_file
        .clone()
        .or_else(|| bsp.memory_init_file.clone());
    let channel = build_channel(common, &bsp)?;

    let mut toolkit = Toolkit::new(bsp, channel);
    toolkit.start(init_file.as_deref())?;
    toolkit.run_application(file, address, console)
}

fn run_flash(common: &CommonOpts, opts: &FlashOpts, op: &FlashCommand) -> Result<()> {
    let bsp = select_bsp(common)?;

    // An uninitialized DRAM controller will happily corrupt the kernel
    // image, so this mode refuses to run blind.
    let init_file = common
        .init_file
        .clone()
        .or_else(|| bsp.memory_init_file.clone())
        .context("a memory initialization file is required to run the RAM kernel")?;

    let kernel_file = match &opts.ram_kernel {
        Some(file) => {
            info!("using RAM kernel binary from command line");
            file.clone()
        }
        None => match &bsp.ram_kernel_file {
            Some(file) => {
                info!("using RAM kernel binary from BSP configuration");
                file.clone()
            }
            None => bail!("no RAM kernel file specified"),
        },
    };

    let origin = match opts.ram_kernel_address {
        Some(origin) => {
            info!("using user-specified kernel origin {origin:#010x}");
            origin
        }
        None => {
            info!(
                "kernel origin not specified; using BSP value {:#010x}",
                bsp.ram_kernel_origin
            );
            bsp.ram_kernel_origin
        }
    };

    let op = match op {
        FlashCommand::Program { file, address } => FlashOp::Program {
            file: file.clone(),
            address: *address,
        },
        FlashCommand::Dump {
            bytes,
            address,
            dump_file,
            no_print,
        } => FlashOp::Dump {
            bytes: *bytes,
            address: *address,
            dump_file: dump_file.clone(),
            print: !no_print,
        },
        FlashCommand::Erase { bytes, address } => FlashOp::Erase {
            bytes: *bytes,
            address: *address,
        },
    };

    let channel = build_channel(common, &bsp)?;
    let mut toolkit = Toolkit::new(bsp, channel);
    toolkit.start(Some(&init_file))?;
    toolkit.run_ram_kernel(&kernel_file, origin, opts.bbt, &op)
}

/// BSP tables come from a per-user config directory first, then the working
/// directory (or whatever --bsp-config points at); later entries win.
fn bsp_search_path(common: &CommonOpts) -> Vec<PathBuf> {
    let mut search = Vec::new();
    if let Some(dirs) = ProjectDirs::from("", "", "mxtool") {
        search.push(dirs.config_dir().join("bspinfo.conf"));
    }
    search.push(
        common
            .bsp_config
            .clone()
            .unwrap_or_else(|| PathBuf::from("bspinfo.conf")),
    );
    search
}

fn load_bsp_table(common: &CommonOpts) -> Result<BspTable> {
    let search = bsp_search_path(common);
    Ok(mx_bspinfo::load_table(&search)?)
}

fn select_bsp(common: &CommonOpts) -> Result<BoardSupportInfo> {
    let name = common
        .bsp
        .as_deref()
        .context("select a BSP with --bsp, or run `mxtool listbsp` to see the choices")?;
    let table = load_bsp_table(common)?;
    let info = mx_bspinfo::lookup(&table, name)?;
    Ok(info.clone())
}

fn build_channel(
    common: &CommonOpts,
    bsp: &BoardSupportInfo,
) -> Result<Box<dyn Channel>> {
    if let Some(port) = &common.serialport {
        info!("using serial port {port}");
        return Ok(Box::new(UartChannel::new(port.clone())));
    }

    let (vid, pid) = match &common.usb {
        Some(id) => parse_vid_pid(id)?,
        None => (bsp.usb_vid, bsp.usb_pid),
    };
    info!(
        "using USB device {vid:#06x}{}",
        pid.map(|p| format!(":{p:#06x}")).unwrap_or_default()
    );
    Ok(Box::new(UsbChannel::new(vid, pid)))
}

fn parse_vid_pid(id: &str) -> Result<(u16, Option<u16>)> {
    let to_u16 = |token: &str| -> Result<u16> {
        let value = parse_num(token).map_err(anyhow::Error::msg)?;
        u16::try_from(value)
            .with_context(|| format!("{token:?} does not fit in 16 bits"))
    };

    match id.split_once(':') {
        Some((vid, pid)) => Ok((to_u16(vid)?, Some(to_u16(pid)?))),
        None => Ok((to_u16(id)?, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vid_pid_arguments() {
        assert_eq!(parse_vid_pid("0x15a2").unwrap(), (0x15a2, None));
        assert_eq!(
            parse_vid_pid("0x15a2:0x003a").unwrap(),
            (0x15a2, Some(0x3a))
        );
        assert_eq!(parse_vid_pid("5538:58").unwrap(), (5538, Some(58)));
        assert!(parse_vid_pid("0x15a2:").is_err());
        assert!(parse_vid_pid("0x123456").is_err());
    }

    #[test]
    fn numeric_arguments_accept_base_prefixes() {
        assert_eq!(parse_num("0x82000000").unwrap(), 0x8200_0000);
        assert_eq!(parse_num("2048").unwrap(), 2048);
        assert!(parse_num("flash").is_err());
    }

    #[test]
    fn cli_shape() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
