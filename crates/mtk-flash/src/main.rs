//! Host-side flashing and exploitation client for MediaTek SoCs stopped in
//! one of the factory service modes (BROM / preloader / DA).

use std::{
    fs,
    io::{Write, stdout},
    path::PathBuf,
    thread::sleep,
    time::Duration,
};

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use colored::Colorize;
use log::info;
use mtk_port::{CdcPort, handshake};
use mtk_stage2::Stage2;

use crate::da::{DaDialect, DaSession, PartitionKind, boot_da};
use crate::err::Error;
use crate::exploit::{DUMP_PAYLOAD_ACK, PAYLOAD_ACK};
use crate::preloader::{ChipOverrides, Preloader};
use crate::progress::{Console, ProgressReporter};
use crate::storage::{GptOptions, detect_partition, read_gpt};

mod checksum;
mod commands;
mod da;
mod err;
mod exploit;
mod logging;
mod mmio;
mod preloader;
mod progress;
mod storage;

type Result<T> = core::result::Result<T, Error>;

const DEFAULT_BAUD: u32 = 115200;
const RPMB_DUMP_SECTORS: u32 = (4 * 1024 * 1024) / mtk_stage2::RPMB_SECTOR_SIZE as u32;

#[derive(Parser)]
#[command(version, about = "Flash and exploit client for MediaTek BROM/preloader/DA modes")]
struct Cli {
    /// USB vendor id to match
    #[arg(long, value_parser = maybe_hex::<u16>, default_value_t = mtk_port::MTK_VID)]
    vid: u16,

    /// USB product id to match
    #[arg(long, value_parser = maybe_hex::<u16>, default_value_t = mtk_port::MTK_BROM_PID)]
    pid: u16,

    /// Override the watchdog base address
    #[arg(long, value_parser = maybe_hex::<u32>)]
    wdt: Option<u32>,

    /// Override the kamakiri var1 selector
    #[arg(long, value_parser = maybe_hex::<u8>)]
    var1: Option<u8>,

    /// Override the DA payload address
    #[arg(long, value_parser = maybe_hex::<u32>)]
    da_addr: Option<u32>,

    /// Override the BROM payload address
    #[arg(long, value_parser = maybe_hex::<u32>)]
    brom_addr: Option<u32>,

    /// Override the UART base address
    #[arg(long, value_parser = maybe_hex::<u32>)]
    uart_addr: Option<u32>,

    /// Leave the watchdog running
    #[arg(long)]
    skip_wdt: bool,

    /// Crash a device sitting in preloader mode back into BROM mode first
    #[arg(long)]
    crash: bool,

    /// Vendor DA binary, required for storage operations
    #[arg(long)]
    loader: Option<PathBuf>,

    /// Preloader image; its DRAM-init block is needed when the DA is booted
    /// straight from BROM
    #[arg(long)]
    preloader: Option<PathBuf>,

    /// Hardware partition storage operations address
    #[arg(long, value_enum, default_value_t = PartitionKind::User)]
    parttype: PartitionKind,

    /// GPT entry count override
    #[arg(long, default_value_t = 0)]
    gpt_num_part_entries: u32,

    /// GPT entry size override
    #[arg(long, default_value_t = 0)]
    gpt_part_entry_size: u32,

    /// GPT entry table start LBA override
    #[arg(long, default_value_t = 0, value_parser = maybe_hex::<u64>)]
    gpt_part_entry_start_lba: u64,

    /// Handshake retry budget
    #[arg(long, default_value_t = 100)]
    handshake_tries: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dump the boot ROM via kamakiri
    DumpBrom {
        /// Dump payload binary
        #[arg(short, long, default_value = "payloads/generic_dump_payload.bin")]
        payload: PathBuf,

        /// Output file
        #[arg(short, long, default_value = "brom.bin")]
        filename: PathBuf,
    },

    /// Crash the preloader to fall back into BROM mode
    Crash {
        /// Crash flavor (0 = bad jump, 1 = bad da, 2 = wild read)
        #[arg(long, default_value_t = 0)]
        mode: u8,
    },

    /// Print the secure-boot fuse state
    GetTargetConfig,

    /// Run a payload in BROM context
    Payload {
        payload: PathBuf,

        /// Load address, chip default when omitted
        #[arg(long, value_parser = maybe_hex::<u32>)]
        addr: Option<u32>,
    },

    /// Brute force the kamakiri var1 selector on an unknown chip
    Brute { payload: PathBuf },

    /// Boot a stage-2 payload through a kamakiri stage 1 and drive it
    Stage {
        /// Stage-1 payload
        #[arg(long, default_value = "payloads/generic_stage1_payload.bin")]
        stage1: PathBuf,

        /// Stage-2 payload
        #[arg(long, default_value = "payloads/stage2.bin")]
        stage2: PathBuf,

        /// Stage-2 load address
        #[arg(long, value_parser = maybe_hex::<u32>, default_value_t = 0x201000)]
        stage2_addr: u32,

        /// Read stage 2 back and compare before jumping
        #[arg(long)]
        verify: bool,

        /// After boot, dump the RPMB to this file
        #[arg(long)]
        rpmb: Option<PathBuf>,

        /// After boot, read memory: address and byte count
        #[arg(long, num_args = 2, value_parser = maybe_hex::<u32>)]
        memread: Vec<u32>,

        /// Output file for --memread
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Send a payload through the preloader into DRAM
    PlStage {
        #[arg(long, default_value = "payloads/pl.bin")]
        payload: PathBuf,
    },

    /// Read device memory over the preloader protocol
    Peek {
        #[arg(value_parser = maybe_hex::<u32>)]
        addr: u32,

        #[arg(value_parser = maybe_hex::<u32>)]
        length: u32,

        #[arg(short, long)]
        filename: Option<PathBuf>,
    },

    /// Print the partition table
    PrintGpt,

    /// Dump one partition to a file
    Read { partition: String, filename: PathBuf },

    /// Dump a raw flash byte range to a file
    ReadFlash {
        #[arg(value_parser = maybe_hex::<u64>)]
        offset: u64,

        #[arg(value_parser = maybe_hex::<u64>)]
        length: u64,

        filename: PathBuf,
    },

    /// Dump a sector range to a file
    ReadSectors {
        #[arg(value_parser = maybe_hex::<u64>)]
        start_sector: u64,

        #[arg(value_parser = maybe_hex::<u64>)]
        sectors: u64,

        filename: PathBuf,
    },

    /// Flash a file into a partition
    Write {
        partition: String,

        filename: PathBuf,

        /// Let the DA resolve the partition name instead of the GPT
        #[arg(long)]
        by_name: bool,
    },

    /// Erase a partition
    Erase { partition: String },

    /// Shut the DA down and release the device
    Reset,
}

impl Cli {
    fn overrides(&self) -> ChipOverrides {
        ChipOverrides {
            watchdog_addr: self.wdt,
            uart_addr: self.uart_addr,
            var1: self.var1,
            brom_payload_addr: self.brom_addr,
            da_payload_addr: self.da_addr,
        }
    }

    fn gpt_options(&self) -> GptOptions {
        GptOptions {
            num_part_entries: self.gpt_num_part_entries,
            part_entry_size: self.gpt_part_entry_size,
            part_entry_start_lba: self.gpt_part_entry_start_lba,
        }
    }
}

fn open_port(vid: u16, pid: u16) -> Result<CdcPort> {
    log!("Waiting for the device");
    loop {
        if let Some(port) = CdcPort::find(vid, pid)? {
            println!();
            info!("Found device {:04x}:{:04x}", port.vid, port.pid);
            return Ok(port);
        }
        // Preloader mode re-enumerates with its own pid.
        if pid == mtk_port::MTK_BROM_PID
            && let Some(port) = CdcPort::find(vid, mtk_port::MTK_PRELOADER_PID)?
        {
            println!();
            info!("Found device {:04x}:{:04x}", port.vid, port.pid);
            return Ok(port);
        }
        log!(".");
        sleep(Duration::from_millis(500));
    }
}

fn connect(cli: &Cli) -> Result<Preloader<CdcPort>> {
    let mut port = open_port(cli.vid, cli.pid)?;
    handshake(&mut port, DEFAULT_BAUD, cli.handshake_tries)?;
    let mut pre = Preloader::init(port, &cli.overrides(), cli.skip_wdt)?;

    if cli.crash && !pre.in_brom {
        log!("Crashing to brom mode...");
        let _ = crash_da(&mut pre, 0);
        println!();
        drop(pre);
        sleep(Duration::from_millis(100));

        let mut port = open_port(cli.vid, mtk_port::MTK_BROM_PID)?;
        handshake(&mut port, DEFAULT_BAUD, cli.handshake_tries)?;
        pre = Preloader::init(port, &cli.overrides(), cli.skip_wdt)?;
    }

    Ok(pre)
}

/// Make the preloader fall over so the BROM takes the USB port back. All
/// flavors end in a dead port, which is the point.
fn crash_da(pre: &mut Preloader<CdcPort>, mode: u8) -> Result<()> {
    info!("Crashing da with mode {mode}...");
    match mode {
        0 => {
            let mut payload = vec![0x00, 0x01, 0x9F, 0xE5, 0x10, 0xFF, 0x2F, 0xE1];
            payload.extend_from_slice(&[0u8; 0x110]);
            let _ = pre.send_da(0x0, 0x0, &payload);
            let _ = pre.jump_da(0x0);
        }
        1 => {
            let _ = pre.send_da(0x0, 0x100, &[0u8; 0x100]);
        }
        _ => {
            let _ = pre.read32(0x0, 0x100);
        }
    }
    Ok(())
}

fn da_session(cli: &Cli, pre: Preloader<CdcPort>) -> Result<DaDialect<CdcPort>> {
    let loader_path = cli
        .loader
        .as_ref()
        .ok_or_else(|| Error::Custom("--loader is required for storage operations".into()))?;
    let loader = fs::read(loader_path)?;
    let preloader_img = cli.preloader.as_ref().map(fs::read).transpose()?;
    boot_da(pre, &loader, preloader_img)
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::DumpBrom { payload, filename } => {
            let mut pre = connect(&cli)?;
            let payload = fs::read(payload)?;
            let addr = pre.chip.brom_payload_addr;
            log!("Running dump payload at {addr:#x}...");
            status!(exploit::run_payload(&mut pre, &payload, addr, DUMP_PAYLOAD_ACK))?;

            let mut file = fs::File::create(filename)?;
            let mut progress = Console::default();
            exploit::dump_brom(pre.port(), &mut file, &mut progress)?;
            println!("Bootrom dumped as: {}", filename.display());
        }

        Command::Crash { mode } => {
            let mut pre = connect(&cli)?;
            let _ = crash_da(&mut pre, *mode);
            println!("Done. Reconnect the device, it should enumerate in BROM mode.");
        }

        Command::GetTargetConfig => {
            let pre = connect(&cli)?;
            let tc = pre.target_config;
            println!("Target config: {:#x}", tc.raw);
            println!("\tSBC enabled: {}", tc.sbc());
            println!("\tSLA enabled: {}", tc.sla());
            println!("\tDAA enabled: {}", tc.daa());
            println!("\tSWJTAG enabled: {}", tc.swjtag());
            println!("\tEPP_PARAM at 0x600 after EMMC_BOOT/SDMMC_BOOT: {}", tc.epp());
            println!("\tRoot cert required: {}", tc.root_cert());
            println!("\tMem read auth: {}", tc.mem_read_auth());
            println!("\tMem write auth: {}", tc.mem_write_auth());
            println!("\tCmd 0xC8 blocked: {}", tc.cmd_c8_blocked());
            println!("HW subcode: {:#06x}, BL version: {}", pre.hw_sub_code, pre.bl_version);
            if !pre.meid.is_empty() {
                println!("MEID: {}", hex::encode_upper(&pre.meid));
            }
            if !pre.soc_id.is_empty() {
                println!("SoC ID: {}", hex::encode_upper(&pre.soc_id));
            }
        }

        Command::Payload { payload, addr } => {
            let mut pre = connect(&cli)?;
            let payload = fs::read(payload)?;
            let addr = addr.unwrap_or(pre.chip.brom_payload_addr);
            log!("Running payload at {addr:#x}...");
            status!(exploit::run_payload(&mut pre, &payload, addr, PAYLOAD_ACK))?;
        }

        Command::Brute { payload } => {
            let mut pre = connect(&cli)?;
            let payload = fs::read(payload)?;
            let addr = pre.chip.brom_payload_addr;
            let var1 = exploit::brute_force_var1(&mut pre, &payload, addr)?;
            println!("Var1 found: {var1:#04x} - pass it via --var1 from now on");
        }

        Command::Stage { stage1, stage2, stage2_addr, verify, rpmb, memread, out } => {
            let mut pre = connect(&cli)?;
            let stage1 = fs::read(stage1)?;
            let mut stage2_data = fs::read(stage2)?;
            while stage2_data.len() % 0x200 != 0 {
                stage2_data.push(0);
            }

            log!("Uploading stage 1...");
            let addr = pre.chip.brom_payload_addr;
            status!(exploit::run_payload(&mut pre, &stage1, addr, PAYLOAD_ACK))?;

            // Stage 1 speaks the side-channel dialect without announcing
            // itself; readiness only comes from stage 2 after the jump.
            let mut s1 = Stage2::new(pre.into_port());
            log!("Sending stage 2 to {stage2_addr:#x}...");
            status!(s1.mem_write(*stage2_addr, &stage2_data))?;

            if *verify {
                log!("Verifying stage2 data...");
                let readback = s1.mem_read(*stage2_addr, stage2_data.len() as u32)?;
                if readback != stage2_data {
                    println!("{}", "failed".red());
                    return Err(Error::Exploit("stage2 data doesn't match".into()));
                }
                println!("{}", "ok".green());
            }

            s1.jump(*stage2_addr)?;
            let mut s2 = Stage2::attach(s1.into_inner())?;
            println!("Successfully loaded stage2");

            if let Some(rpmb_file) = rpmb {
                info!("Reading rpmb...");
                s2.emmc_switch(1)?;
                s2.kick_watchdog()?;
                let mut file = fs::File::create(rpmb_file)?;
                let mut progress = Console::default();
                progress.start(u64::from(RPMB_DUMP_SECTORS) * 0x100);
                for sector in 0..RPMB_DUMP_SECTORS {
                    let data = s2.rpmb_read_sector(sector as u16)?;
                    file.write_all(&data)?;
                    progress.advance(u64::from(sector + 1) * 0x100);
                }
                progress.finish();
                println!("RPMB dumped as: {}", rpmb_file.display());
            }

            if let [addr, length] = memread[..] {
                let data = s2.mem_read(addr, length)?;
                match out {
                    Some(path) => fs::write(path, &data)?,
                    None => println!("{addr:#010x}: {}", hex::encode(&data)),
                }
            }
        }

        Command::PlStage { payload } => {
            let mut pre = connect(&cli)?;
            let addr = pre
                .chip
                .pl_payload_addr
                .ok_or(Error::Unsupported("plstage without a DRAM payload address"))?;
            let data = fs::read(payload)?;
            let fixed =
                exploit::fix_payload(&data, pre.chip.watchdog_addr, pre.chip.uart_addr, true);
            log!("Sending payload to {addr:#x}...");
            status!(pre.send_da(addr, 0x100, &fixed))?;
            log!("Jumping to {addr:#x}...");
            status!(pre.jump_da(addr))?;

            Stage2::attach(pre.into_port())?;
            println!("Successfully loaded stage2");
        }

        Command::Peek { addr, length, filename } => {
            let mut pre = connect(&cli)?;
            let dwords = length.div_ceil(4);
            let words = pre.read32(*addr, dwords)?;
            let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
            bytes.truncate(*length as usize);
            match filename {
                Some(path) => {
                    fs::write(path, &bytes)?;
                    println!("Dumped {length:#x} bytes to {}", path.display());
                }
                None => println!("{addr:#010x}: {}", hex::encode(&bytes)),
            }
        }

        Command::PrintGpt => {
            let pre = connect(&cli)?;
            let mut da = da_session(&cli, pre)?;
            let table = read_gpt(&mut da, &cli.gpt_options())?;
            println!("{table}");
        }

        Command::Read { partition, filename } => {
            let pre = connect(&cli)?;
            let mut da = da_session(&cli, pre)?;
            let table = read_gpt(&mut da, &cli.gpt_options())?;
            let part = detect_partition(&table, partition)?.clone();
            let addr = part.byte_offset(table.sector_size);
            let len = part.byte_len(table.sector_size);

            info!("Dumping {partition} ({len:#x} bytes at {addr:#x})");
            let mut file = fs::File::create(filename)?;
            let mut progress = Console::default();
            da.read_flash(cli.parttype, addr, len, &mut file, &mut progress)?;
            println!("Dumped {partition} to {}", filename.display());
        }

        Command::ReadFlash { offset, length, filename } => {
            let pre = connect(&cli)?;
            let mut da = da_session(&cli, pre)?;
            let mut file = fs::File::create(filename)?;
            let mut progress = Console::default();
            da.read_flash(cli.parttype, *offset, *length, &mut file, &mut progress)?;
            println!("Dumped {length:#x} bytes to {}", filename.display());
        }

        Command::ReadSectors { start_sector, sectors, filename } => {
            let pre = connect(&cli)?;
            let mut da = da_session(&cli, pre)?;
            let page = u64::from(da.page_size());
            let mut file = fs::File::create(filename)?;
            let mut progress = Console::default();
            da.read_flash(cli.parttype, start_sector * page, sectors * page, &mut file, &mut progress)?;
            println!("Dumped {sectors:#x} sectors to {}", filename.display());
        }

        Command::Write { partition, filename, by_name } => {
            let pre = connect(&cli)?;
            let mut da = da_session(&cli, pre)?;
            let data = fs::read(filename)?;

            if *by_name {
                info!("Flashing {partition} by name ({:#x} bytes)", data.len());
                da.download(partition, &data)?;
            } else {
                let table = read_gpt(&mut da, &cli.gpt_options())?;
                let part = detect_partition(&table, partition)?.clone();
                let len = part.byte_len(table.sector_size);
                if (data.len() as u64) > len {
                    return Err(Error::Custom(
                        format!(
                            "{} is {:#x} bytes but partition {partition} only holds {len:#x}",
                            filename.display(),
                            data.len()
                        )
                        .into(),
                    ));
                }
                let addr = part.byte_offset(table.sector_size);
                info!("Flashing {partition} ({:#x} bytes at {addr:#x})", data.len());
                let mut progress = Console::default();
                da.write_flash(cli.parttype, addr, &data, &mut progress)?;
            }
            println!("Wrote {} to {partition}", filename.display());
        }

        Command::Erase { partition } => {
            let pre = connect(&cli)?;
            let mut da = da_session(&cli, pre)?;
            let table = read_gpt(&mut da, &cli.gpt_options())?;
            let part = detect_partition(&table, partition)?.clone();
            let addr = part.byte_offset(table.sector_size);
            let len = part.byte_len(table.sector_size);
            info!("Erasing {partition} ({len:#x} bytes at {addr:#x})");
            da.format_flash(cli.parttype, addr, len)?;
            println!("Erased {partition}");
        }

        Command::Reset => {
            let pre = connect(&cli)?;
            let mut da = da_session(&cli, pre)?;
            da.close()?;
            println!("Device released");
        }
    }

    Ok(())
}

fn main() -> core::result::Result<(), String> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    run(cli).map_err(|e| e.to_string())
}
