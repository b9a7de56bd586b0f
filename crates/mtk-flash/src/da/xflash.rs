//! The newer "XFlash" Download Agent dialect (MT67xx and later).
//!
//! Every exchange is framed `{magic, data_type, length}` little-endian.
//! Command words and status words travel in protocol-flow frames, parameter
//! blocks and bulk data in message frames. `DEVICE_CTRL` opens a namespace of
//! getter/setter sub-commands.

use std::io::Write;
use std::{thread::sleep, time::Duration};

use bincode::Decode;
use log::{debug, info, warn};
use mtk_port::ProtocolPort;

use crate::Result;
use crate::checksum::sum16;
use crate::da::{
    DaSession, DaSetup, FlashType, PartitionKind, decode_be, decode_le, ensure_aligned,
};
use crate::err::Error;
use crate::preloader::Preloader;
use crate::progress::ProgressReporter;
use crate::storage::Partition;

pub(crate) const MAGIC: u32 = 0xFEEEEEEF;
const SYNC_SIGNAL: u32 = 0x434E5953;
const SYNC_CHAR: u8 = 0xC0;

/// Nothing legal is larger than one write packet plus slack; anything above
/// this is a framing error, not a transfer.
pub(crate) const MAX_FRAME_LEN: u32 = 0x0100_0000;

const DT_PROTOCOL_FLOW: u32 = 1;
const DT_MESSAGE: u32 = 2;

const PARAM_CHUNK: usize = 0x200;
const DATA_CHUNK: usize = 64;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub(crate) enum Cmd {
    Download = 0x010001,
    Upload = 0x010002,
    Format = 0x010003,
    WriteData = 0x010004,
    ReadData = 0x010005,
    FormatPartition = 0x010006,
    Shutdown = 0x010007,
    BootTo = 0x010008,
    DeviceCtrl = 0x010009,
    InitExtRam = 0x01000A,
    SetupEnvironment = 0x010100,
    SetupHwInitParams = 0x010101,

    SetBatteryOpt = 0x020002,
    SetChecksumLevel = 0x020003,
    SetResetKey = 0x020004,

    GetEmmcInfo = 0x040001,
    GetNandInfo = 0x040002,
    GetNorInfo = 0x040003,
    GetUfsInfo = 0x040004,
    GetDaVersion = 0x040005,
    GetPacketLength = 0x040007,
    GetRandomId = 0x040008,
    GetConnectionAgent = 0x04000A,
    GetUsbSpeed = 0x04000B,
    GetRamInfo = 0x04000C,
    GetChipId = 0x04000D,
    GetExpireDate = 0x040011,

    StartDlInfo = 0x080001,
    EndDlInfo = 0x080002,
    DaStorLifeCycleCheck = 0x080007,

    CcOptionalDownloadAct = 0x800005,
}

pub(crate) fn send_frame<P: ProtocolPort>(
    port: &mut P,
    data_type: u32,
    payload: &[u8],
) -> Result<()> {
    port.write_u32_le(MAGIC)?;
    port.write_u32_le(data_type)?;
    port.write_u32_le(payload.len() as u32)?;
    port.write_all(payload)?;
    Ok(())
}

pub(crate) fn recv_frame<P: ProtocolPort>(port: &mut P) -> Result<(u32, Vec<u8>)> {
    let magic = port.read_u32_le()?;
    if magic != MAGIC {
        port.poison();
        return Err(Error::BadMagic(magic));
    }
    let data_type = port.read_u32_le()?;
    let length = port.read_u32_le()?;
    if length > MAX_FRAME_LEN {
        port.poison();
        return Err(Error::FrameTooLarge(length));
    }
    let data = port.read_chunked(length as usize, PARAM_CHUNK)?;
    if data.len() != length as usize {
        return Err(Error::Port(mtk_port::err::Error::ShortRead {
            wanted: length as usize,
            got: data.len(),
        }));
    }
    Ok((data_type, data))
}

fn send_cmd<P: ProtocolPort>(port: &mut P, cmd: Cmd) -> Result<()> {
    debug!("[TX] {cmd:?}");
    send_frame(port, DT_PROTOCOL_FLOW, &(cmd as u32).to_le_bytes())
}

fn read_status<P: ProtocolPort>(port: &mut P) -> Result<u32> {
    let (_, data) = recv_frame(port)?;
    if data.len() < 4 {
        return Err(Error::Port(mtk_port::err::Error::ShortRead { wanted: 4, got: data.len() }));
    }
    Ok(u32::from_le_bytes(data[..4].try_into().unwrap()))
}

fn status_ok<P: ProtocolPort>(port: &mut P) -> Result<()> {
    let status = read_status(port)?;
    if status != 0 {
        return Err(Error::DaStatus(status));
    }
    Ok(())
}

/// Parameter blocks travel as message frames, written in 0x200 slices, with
/// one status for the whole set.
fn send_param<P: ProtocolPort>(port: &mut P, params: &[&[u8]]) -> Result<()> {
    for param in params {
        port.write_u32_le(MAGIC)?;
        port.write_u32_le(DT_MESSAGE)?;
        port.write_u32_le(param.len() as u32)?;
        for chunk in param.chunks(PARAM_CHUNK) {
            port.write_all(chunk)?;
        }
    }
    status_ok(port)
}

/// Bulk payload: one message frame, 64-byte writes, closing status.
fn send_data<P: ProtocolPort>(port: &mut P, data: &[u8]) -> Result<()> {
    port.write_u32_le(MAGIC)?;
    port.write_u32_le(DT_MESSAGE)?;
    port.write_u32_le(data.len() as u32)?;
    for chunk in data.chunks(DATA_CHUNK) {
        port.write_all(chunk)?;
    }
    status_ok(port)
}

fn send_ack<P: ProtocolPort>(port: &mut P) -> Result<()> {
    send_frame(port, DT_PROTOCOL_FLOW, &0u32.to_le_bytes())
}

/// The fixed 40-byte storage parameter block.
fn storage_param(storage: u32, parttype: u32, addr: u64, len: u64) -> [u8; 40] {
    let mut param = [0u8; 40];
    param[0..4].copy_from_slice(&storage.to_le_bytes());
    param[4..8].copy_from_slice(&parttype.to_le_bytes());
    param[8..16].copy_from_slice(&addr.to_le_bytes());
    param[16..24].copy_from_slice(&len.to_le_bytes());
    // the trailing eight words are the NAND extension, zero elsewhere
    param
}

/// DRAM init blob the BROM-loaded DA needs before it can touch stage 2.
pub(crate) fn extract_emi(preloader: &[u8]) -> Result<Vec<u8>> {
    let needle = b"MTK_BLOADER_INFO_v";
    let idx = preloader
        .windows(needle.len())
        .rposition(|w| w == needle)
        .ok_or_else(|| Error::Custom("no EMI info in the preloader image".into()))?;
    let emi = &preloader[idx..];
    if emi.len() < 0x70 {
        return Err(Error::Custom("truncated EMI info in the preloader image".into()));
    }
    let count = u32::from_le_bytes(emi[0x6C..0x70].try_into().unwrap());
    let size = (count as usize) * 0xB0 + 0x70;
    if emi.len() < size {
        return Err(Error::Custom("truncated EMI info in the preloader image".into()));
    }
    Ok(emi[..size].to_vec())
}

#[derive(Debug, Decode, Default)]
pub struct EmmcInfo {
    pub kind: u32,
    pub block_size: u32,
    pub boot1_size: u64,
    pub boot2_size: u64,
    pub rpmb_size: u64,
    pub gp_size: [u64; 4],
    pub user_size: u64,
    pub cid: [u8; 16],
    pub fwver: u64,
}

#[derive(Debug, Decode, Default)]
pub struct NandInfo {
    pub kind: u32,
    pub page_size: u32,
    pub block_size: u32,
    pub spare_size: u32,
    pub total_size: u64,
    pub available_size: u64,
}

#[derive(Debug, Decode, Default)]
pub struct NorInfo {
    pub kind: u32,
    pub page_size: u32,
    pub available_size: u64,
}

#[derive(Debug, Decode, Default)]
pub struct UfsInfo {
    pub kind: u32,
    pub block_size: u32,
    pub lu0_size: u64,
    pub lu1_size: u64,
    pub lu2_size: u64,
    pub cid: [u8; 16],
    pub fwver: u32,
}

#[derive(Debug, Decode, Default)]
pub struct RamInfo {
    pub sram_type: u32,
    pub sram_base: u32,
    pub sram_size: u32,
    pub dram_type: u32,
    pub dram_base: u32,
    pub dram_size: u32,
}

/// Big-endian, unlike everything else this dialect says.
#[derive(Debug, Decode, Default, Clone, Copy)]
pub struct ChipId {
    pub hw_code: u16,
    pub hw_sub_code: u16,
    pub hw_version: u16,
    pub sw_version: u16,
    pub chip_evolution: u16,
}

pub struct XflashDa<P> {
    port: P,
    flash_type: FlashType,
    flash_size: u64,
    page_size: u32,
    pub emmc: EmmcInfo,
    pub nand: NandInfo,
    pub nor: NorInfo,
    pub ufs: UfsInfo,
    pub sram: RamInfo,
    pub chip_id: ChipId,
    pub random_id: Vec<u8>,
    write_packet_len: Option<u32>,
}

impl<P: ProtocolPort> XflashDa<P> {
    /// Stage 1 via the preloader path, environment setup, optional EMI init
    /// when the connection agent is the bare BROM, then `BOOT_TO` stage 2 and
    /// the storage survey.
    pub fn upload(
        mut pre: Preloader<P>,
        setup: DaSetup,
        preloader_img: Option<Vec<u8>>,
    ) -> Result<Self> {
        info!("Uploading stage 1...");
        pre.send_da(setup.da1.addr, setup.da1.sig_len, &setup.da1.data)?;
        pre.jump_da(setup.da1.addr)?;
        sleep(Duration::from_millis(500));

        let mut port = pre.into_port();
        let sync = port.read_u8()?;
        if sync != SYNC_CHAR {
            return Err(Error::UnexpectedByte { expected: SYNC_CHAR, got: sync });
        }

        send_frame(&mut port, DT_PROTOCOL_FLOW, &SYNC_SIGNAL.to_le_bytes())?;

        // log to UART at level 2, Linux host, no UFS provisioning
        let mut env = Vec::with_capacity(20);
        for word in [2u32, 1, 1, 0, 0] {
            env.extend_from_slice(&word.to_le_bytes());
        }
        send_cmd(&mut port, Cmd::SetupEnvironment)?;
        send_param(&mut port, &[&env])?;

        send_cmd(&mut port, Cmd::SetupHwInitParams)?;
        send_param(&mut port, &[&0u32.to_le_bytes()])?;

        let (_, hello) = recv_frame(&mut port)?;
        if hello != SYNC_SIGNAL.to_le_bytes() {
            return Err(Error::Exploit(format!(
                "stage 1 DA did not sync, answered {}",
                hex::encode(hello)
            )));
        }
        info!("Successfully received DA sync");

        let mut da = XflashDa {
            port,
            flash_type: FlashType::Emmc,
            flash_size: 0,
            page_size: setup.page_size,
            emmc: EmmcInfo::default(),
            nand: NandInfo::default(),
            nor: NorInfo::default(),
            ufs: UfsInfo::default(),
            sram: RamInfo::default(),
            chip_id: ChipId::default(),
            random_id: Vec::new(),
            write_packet_len: None,
        };

        if let Ok(date) = da.get_expire_date() {
            debug!("DA expire date: {}", String::from_utf8_lossy(&date));
        }
        da.set_reset_key(0x68)?;
        da.set_battery_opt(0x2)?;
        da.set_checksum_level(0x0)?;

        let agent = da.get_connection_agent()?;
        debug!("connection agent: {}", String::from_utf8_lossy(&agent));
        if agent == b"brom" {
            match preloader_img {
                Some(img) => {
                    let emi = extract_emi(&img)?;
                    info!("Sending DRAM setup ({:#x} bytes)...", emi.len());
                    da.send_emi(&emi)?;
                }
                None => {
                    warn!("No preloader given. Operation may fail due to missing dram setup.")
                }
            }
        }

        info!("Uploading stage 2...");
        let code_len = setup.da2.data.len() - setup.da2.sig_len as usize;
        da.boot_to(u64::from(setup.da2.addr), &setup.da2.data[..code_len])?;

        da.sram = decode_le(&da.devctrl_read_checked(Cmd::GetRamInfo)?)?;
        da.emmc = decode_le(&da.devctrl_read_checked(Cmd::GetEmmcInfo)?)?;
        da.nand = decode_le(&da.devctrl_read_checked(Cmd::GetNandInfo)?)?;
        da.nor = decode_le(&da.devctrl_read_checked(Cmd::GetNorInfo)?)?;
        da.ufs = decode_le(&da.devctrl_read_checked(Cmd::GetUfsInfo)?)?;

        (da.flash_type, da.flash_size) = if da.emmc.kind != 0 {
            da.page_size = da.emmc.block_size.max(1);
            (FlashType::Emmc, da.emmc.user_size)
        } else if da.nand.kind != 0 {
            da.page_size = da.nand.page_size.max(1);
            (FlashType::Nand, da.nand.total_size)
        } else if da.nor.kind != 0 {
            (FlashType::Nor, da.nor.available_size)
        } else if da.ufs.kind != 0 {
            da.page_size = da.ufs.block_size.max(1);
            (FlashType::Ufs, da.ufs.lu2_size)
        } else {
            return Err(Error::Custom("DA reports no usable storage".into()));
        };
        info!("Detected flash: {} ({:#x} bytes)", da.flash_type, da.flash_size);

        da.chip_id = decode_be(&da.devctrl_read_checked(Cmd::GetChipId)?)?;
        da.random_id = da.devctrl_read_checked(Cmd::GetRandomId)?;

        info!(
            "Chip: hw {:#06x} sub {:#06x}, hw version {:#06x}, sw version {:#06x}, evolution {:#x}",
            da.chip_id.hw_code,
            da.chip_id.hw_sub_code,
            da.chip_id.hw_version,
            da.chip_id.sw_version,
            da.chip_id.chip_evolution
        );
        info!("Random id: {}", hex::encode(&da.random_id));
        debug!(
            "SRAM {:#x} @ {:#010x} (type {}), DRAM {:#x} @ {:#010x} (type {})",
            da.sram.sram_size,
            da.sram.sram_base,
            da.sram.sram_type,
            da.sram.dram_size,
            da.sram.dram_base,
            da.sram.dram_type
        );
        debug!(
            "eMMC cid {}, fw {:#x}; NAND blk {:#x} spare {:#x} avail {:#x}; NOR page {:#x} avail {:#x}",
            hex::encode(da.emmc.cid),
            da.emmc.fwver,
            da.nand.block_size,
            da.nand.spare_size,
            da.nand.available_size,
            da.nor.page_size,
            da.nor.available_size
        );
        debug!(
            "UFS lu0 {:#x} lu1 {:#x} lu2 {:#x}, cid {}, fw {:#x}",
            da.ufs.lu0_size,
            da.ufs.lu1_size,
            da.ufs.lu2_size,
            hex::encode(da.ufs.cid),
            da.ufs.fwver
        );
        debug!(
            "eMMC regions: boot1 {:#x}, boot2 {:#x}, rpmb {:#x}, gp {:x?}",
            da.emmc.boot1_size, da.emmc.boot2_size, da.emmc.rpmb_size, da.emmc.gp_size
        );

        let life = da.da_stor_life_check()?;
        if life != 0 {
            warn!("DA storage life cycle check reports {life:#x}");
        }

        Ok(da)
    }

    fn devctrl_prologue(&mut self, cmd: Cmd) -> Result<()> {
        send_cmd(&mut self.port, Cmd::DeviceCtrl)?;
        status_ok(&mut self.port)?;
        send_cmd(&mut self.port, cmd)?;
        status_ok(&mut self.port)
    }

    /// Getter sub-command: data frame, no trailing status.
    fn devctrl_read(&mut self, cmd: Cmd) -> Result<Vec<u8>> {
        self.devctrl_prologue(cmd)?;
        let (_, data) = recv_frame(&mut self.port)?;
        Ok(data)
    }

    /// Getter sub-command that also sends a closing status.
    fn devctrl_read_checked(&mut self, cmd: Cmd) -> Result<Vec<u8>> {
        let data = self.devctrl_read(cmd)?;
        status_ok(&mut self.port)?;
        Ok(data)
    }

    /// Setter sub-command: one parameter block, statuses all the way down.
    fn devctrl_set(&mut self, cmd: Cmd, param: &[u8]) -> Result<()> {
        self.devctrl_prologue(cmd)?;
        send_param(&mut self.port, &[param])
    }

    fn set_reset_key(&mut self, key: u32) -> Result<()> {
        self.devctrl_set(Cmd::SetResetKey, &key.to_le_bytes())
    }

    fn set_battery_opt(&mut self, opt: u32) -> Result<()> {
        self.devctrl_set(Cmd::SetBatteryOpt, &opt.to_le_bytes())
    }

    fn set_checksum_level(&mut self, level: u32) -> Result<()> {
        self.devctrl_set(Cmd::SetChecksumLevel, &level.to_le_bytes())
    }

    fn get_expire_date(&mut self) -> Result<Vec<u8>> {
        self.devctrl_read_checked(Cmd::GetExpireDate)
    }

    fn get_connection_agent(&mut self) -> Result<Vec<u8>> {
        self.devctrl_read_checked(Cmd::GetConnectionAgent)
    }

    fn da_stor_life_check(&mut self) -> Result<u32> {
        let data = self.devctrl_read(Cmd::DaStorLifeCycleCheck)?;
        if data.len() < 4 {
            return Err(Error::Port(mtk_port::err::Error::ShortRead {
                wanted: 4,
                got: data.len(),
            }));
        }
        Ok(u32::from_le_bytes(data[..4].try_into().unwrap()))
    }

    fn write_packet_length(&mut self) -> Result<u32> {
        if let Some(len) = self.write_packet_len {
            return Ok(len);
        }
        let data = self.devctrl_read_checked(Cmd::GetPacketLength)?;
        if data.len() < 8 {
            return Err(Error::Port(mtk_port::err::Error::ShortRead {
                wanted: 8,
                got: data.len(),
            }));
        }
        let write_len = u32::from_le_bytes(data[..4].try_into().unwrap());
        let read_len = u32::from_le_bytes(data[4..8].try_into().unwrap());
        debug!("packet lengths: write {write_len:#x}, read {read_len:#x}");
        self.write_packet_len = Some(write_len);
        Ok(write_len)
    }

    fn send_emi(&mut self, emi: &[u8]) -> Result<()> {
        send_cmd(&mut self.port, Cmd::InitExtRam)?;
        status_ok(&mut self.port)?;
        send_frame(&mut self.port, DT_PROTOCOL_FLOW, &(emi.len() as u32).to_le_bytes())?;
        send_param(&mut self.port, &[emi])
    }

    /// Hand control to the stage-2 DA. Success is the DA answering with the
    /// literal "SYNC" word.
    fn boot_to(&mut self, at_address: u64, da: &[u8]) -> Result<()> {
        send_cmd(&mut self.port, Cmd::BootTo)?;
        status_ok(&mut self.port)?;

        let mut param = [0u8; 16];
        param[..8].copy_from_slice(&at_address.to_le_bytes());
        param[8..].copy_from_slice(&(da.len() as u64).to_le_bytes());
        send_frame(&mut self.port, DT_MESSAGE, &param)?;

        send_data(&mut self.port, da)?;
        sleep(Duration::from_millis(500));

        let status = read_status(&mut self.port)?;
        if status != SYNC_SIGNAL {
            return Err(Error::DaStatus(status));
        }
        Ok(())
    }

    /// Keep eMMC region reads inside the region the hardware actually has.
    fn cap_len(&self, parttype: PartitionKind, len: u64) -> u64 {
        if self.flash_type != FlashType::Emmc || self.emmc.kind == 0 {
            return len;
        }
        let region = match parttype {
            PartitionKind::Boot1 => self.emmc.boot1_size,
            PartitionKind::Boot2 => self.emmc.boot2_size,
            PartitionKind::Rpmb => self.emmc.rpmb_size,
            PartitionKind::Gp1 => self.emmc.gp_size[0],
            PartitionKind::Gp2 => self.emmc.gp_size[1],
            PartitionKind::Gp3 => self.emmc.gp_size[2],
            PartitionKind::Gp4 => self.emmc.gp_size[3],
            PartitionKind::User => return len,
        };
        if region == 0 { len } else { len.min(region) }
    }
}

impl<P: ProtocolPort> DaSession for XflashDa<P> {
    fn flash_type(&self) -> FlashType {
        self.flash_type
    }

    fn flash_size(&self) -> u64 {
        self.flash_size
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn read_flash(
        &mut self,
        parttype: PartitionKind,
        addr: u64,
        len: u64,
        sink: &mut dyn Write,
        progress: &mut dyn ProgressReporter,
    ) -> Result<()> {
        ensure_aligned(addr, self.page_size)?;
        let len = self.cap_len(parttype, len);

        send_cmd(&mut self.port, Cmd::ReadData)?;
        status_ok(&mut self.port)?;

        let param =
            storage_param(self.flash_type.da_storage_code(), parttype.code(), addr, len);
        send_param(&mut self.port, &[&param])?;

        progress.start(len);
        let mut done = 0u64;
        while done < len {
            let (_, chunk) = recv_frame(&mut self.port)?;
            if chunk.is_empty() {
                return Err(Error::Port(mtk_port::err::Error::ShortRead {
                    wanted: (len - done) as usize,
                    got: 0,
                }));
            }
            sink.write_all(&chunk)?;
            done += chunk.len() as u64;
            send_ack(&mut self.port)?;
            status_ok(&mut self.port)?;
            progress.advance(done);
        }
        progress.finish();
        Ok(())
    }

    fn write_flash(
        &mut self,
        parttype: PartitionKind,
        addr: u64,
        data: &[u8],
        progress: &mut dyn ProgressReporter,
    ) -> Result<()> {
        ensure_aligned(addr, self.page_size)?;
        let chunk_size = self.write_packet_length()? as usize;

        send_cmd(&mut self.port, Cmd::WriteData)?;
        status_ok(&mut self.port)?;

        let param = storage_param(
            self.flash_type.da_storage_code(),
            parttype.code(),
            addr,
            data.len() as u64,
        );
        send_param(&mut self.port, &[&param])?;

        progress.start(data.len() as u64);
        let mut done = 0usize;
        for chunk in data.chunks(chunk_size.max(1)) {
            send_frame(&mut self.port, DT_PROTOCOL_FLOW, &0u32.to_le_bytes())?;
            let checksum = u32::from(sum16(chunk));
            send_frame(&mut self.port, DT_PROTOCOL_FLOW, &checksum.to_le_bytes())?;
            send_data(&mut self.port, chunk)?;
            done += chunk.len();
            progress.advance(done as u64);
        }
        progress.finish();
        status_ok(&mut self.port)
    }

    fn format_flash(&mut self, parttype: PartitionKind, addr: u64, len: u64) -> Result<()> {
        ensure_aligned(addr, self.page_size)?;
        let len = self.cap_len(parttype, len);

        send_cmd(&mut self.port, Cmd::Format)?;
        status_ok(&mut self.port)?;

        let param =
            storage_param(self.flash_type.da_storage_code(), parttype.code(), addr, len);
        send_param(&mut self.port, &[&param])?;
        status_ok(&mut self.port)
    }

    fn download(&mut self, partition_name: &str, data: &[u8]) -> Result<()> {
        let chunk_size = self.write_packet_length()? as usize;
        let wsize = (chunk_size as u64).min(data.len() as u64);

        send_cmd(&mut self.port, Cmd::Download)?;
        status_ok(&mut self.port)?;

        send_param(&mut self.port, &[partition_name.as_bytes(), &wsize.to_le_bytes()])?;

        for chunk in data.chunks(chunk_size.max(1)) {
            let checksum = u32::from(sum16(chunk));
            send_param(&mut self.port, &[&0u32.to_le_bytes(), &checksum.to_le_bytes(), chunk])?;
        }
        status_ok(&mut self.port)?;

        // fire-and-forget completion hint, some DAs want it
        self.devctrl_prologue(Cmd::CcOptionalDownloadAct).ok();
        Ok(())
    }

    fn read_pmt(&mut self, _page_size: u32) -> Result<Option<Vec<Partition>>> {
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        send_cmd(&mut self.port, Cmd::Shutdown)?;
        status_ok(&mut self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Silent;
    use mtk_port::SimpleRead;
    use mtk_port::mock::{Io, ScriptPort};

    fn frame_bytes(data_type: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&data_type.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn frames_round_trip() {
        let payload = [0xDEu8, 0xAD, 0xBE, 0xEF];
        let mut port = ScriptPort::new([
            Io::Out(frame_bytes(DT_PROTOCOL_FLOW, &payload)),
            Io::In(frame_bytes(DT_MESSAGE, &payload)),
        ]);
        send_frame(&mut port, DT_PROTOCOL_FLOW, &payload).unwrap();
        let (data_type, got) = recv_frame(&mut port).unwrap();
        assert_eq!(data_type, DT_MESSAGE);
        assert_eq!(got, payload);
        assert!(port.done());
    }

    #[test]
    fn bad_magic_poisons_the_port() {
        let mut frame = frame_bytes(DT_PROTOCOL_FLOW, &[0u8; 4]);
        frame[0] = 0x00;
        let mut port = ScriptPort::new([Io::In(frame)]);
        let err = recv_frame(&mut port).unwrap_err();
        assert!(matches!(err, Error::BadMagic(_)));

        let mut buf = [0u8; 1];
        assert!(matches!(
            port.read_exact(&mut buf),
            Err(mtk_port::err::Error::Poisoned)
        ));
    }

    #[test]
    fn oversized_length_is_a_framing_error() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAGIC.to_le_bytes());
        frame.extend_from_slice(&DT_PROTOCOL_FLOW.to_le_bytes());
        frame.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        let mut port = ScriptPort::new([Io::In(frame)]);
        assert!(matches!(recv_frame(&mut port), Err(Error::FrameTooLarge(_))));
    }

    #[test]
    fn read_parameter_block_layout() {
        // Reading "boot_a" at LBA 0x8000 of a 0x200-block eMMC puts
        // addr = 0x01000000 on the wire, storage eMMC (1), partition USER (8).
        let addr = 0x8000u64 * 0x200;
        let len = 0x200u64;
        let payload = vec![0x42u8; len as usize];

        let expected_param = {
            let mut p = Vec::new();
            p.extend_from_slice(&1u32.to_le_bytes());
            p.extend_from_slice(&8u32.to_le_bytes());
            p.extend_from_slice(&addr.to_le_bytes());
            p.extend_from_slice(&len.to_le_bytes());
            p.extend_from_slice(&[0u8; 32]);
            p
        };

        let script = vec![
            Io::Out(frame_bytes(DT_PROTOCOL_FLOW, &(Cmd::ReadData as u32).to_le_bytes())),
            Io::In(frame_bytes(DT_PROTOCOL_FLOW, &0u32.to_le_bytes())),
            Io::Out(frame_bytes(DT_MESSAGE, &expected_param)),
            Io::In(frame_bytes(DT_PROTOCOL_FLOW, &0u32.to_le_bytes())),
            Io::In(frame_bytes(DT_MESSAGE, &payload)),
            Io::Out(frame_bytes(DT_PROTOCOL_FLOW, &0u32.to_le_bytes())),
            Io::In(frame_bytes(DT_PROTOCOL_FLOW, &0u32.to_le_bytes())),
        ];

        let mut da = session(ScriptPort::new(script));
        let mut out = Vec::new();
        da.read_flash(PartitionKind::User, addr, len, &mut out, &mut Silent).unwrap();
        assert_eq!(out, payload);
        assert!(da.port.done());
    }

    #[test]
    fn write_chunks_carry_additive_checksum() {
        let data = vec![0x7Fu8; 0x30];

        let mut script = vec![
            Io::Out(frame_bytes(DT_PROTOCOL_FLOW, &(Cmd::WriteData as u32).to_le_bytes())),
            Io::In(frame_bytes(DT_PROTOCOL_FLOW, &0u32.to_le_bytes())),
            Io::Out(frame_bytes(DT_MESSAGE, &storage_param(1, 8, 0x1000, 0x30))),
            Io::In(frame_bytes(DT_PROTOCOL_FLOW, &0u32.to_le_bytes())),
        ];
        let checksum = u32::from(sum16(&data));
        script.push(Io::Out(frame_bytes(DT_PROTOCOL_FLOW, &0u32.to_le_bytes())));
        script.push(Io::Out(frame_bytes(DT_PROTOCOL_FLOW, &checksum.to_le_bytes())));
        script.push(Io::Out(frame_bytes(DT_MESSAGE, &data)));
        script.push(Io::In(frame_bytes(DT_PROTOCOL_FLOW, &0u32.to_le_bytes())));
        script.push(Io::In(frame_bytes(DT_PROTOCOL_FLOW, &0u32.to_le_bytes())));

        let mut da = session(ScriptPort::new(script));
        da.write_packet_len = Some(0x1000);
        da.write_flash(PartitionKind::User, 0x1000, &data, &mut Silent).unwrap();
        assert!(da.port.done());
    }

    #[test]
    fn emi_extraction_honours_the_count_field() {
        let mut img = vec![0xEEu8; 0x40];
        img.extend_from_slice(b"MTK_BLOADER_INFO_v20");
        let base = img.len() - 0x14;
        img.resize(base + 0x70, 0);
        let count = 2u32;
        img[base + 0x6C..base + 0x70].copy_from_slice(&count.to_le_bytes());
        img.resize(base + 0x70 + 2 * 0xB0 + 8, 0x11);

        let emi = extract_emi(&img).unwrap();
        assert_eq!(emi.len(), 2 * 0xB0 + 0x70);
        assert!(emi.starts_with(b"MTK_BLOADER_INFO_v20"));
    }

    #[test]
    fn missing_emi_marker_fails() {
        assert!(extract_emi(&[0u8; 0x100]).is_err());
    }

    fn session(port: ScriptPort) -> XflashDa<ScriptPort> {
        XflashDa {
            port,
            flash_type: FlashType::Emmc,
            flash_size: 0x1_0000_0000,
            page_size: 0x200,
            emmc: EmmcInfo::default(),
            nand: NandInfo::default(),
            nor: NorInfo::default(),
            ufs: UfsInfo::default(),
            sram: RamInfo::default(),
            chip_id: ChipId::default(),
            random_id: Vec::new(),
            write_packet_len: None,
        }
    }
}
