//! The older ACK/NACK Download Agent dialect.
//!
//! Everything is big-endian. The DA answers with single bytes (`ACK`,
//! `CONT`) instead of status words; data transfers carry a 16-bit checksum
//! per chunk.

use std::io::Write;
use std::{thread::sleep, time::Duration};

use bincode::Decode;
use log::{debug, info};
use mtk_port::ProtocolPort;

use crate::Result;
use crate::checksum::xor16;
use crate::da::{
    DaSession, DaSetup, FlashType, PartitionKind, decode_be, ensure_aligned, read_vec,
};
use crate::err::Error;
use crate::preloader::Preloader;
use crate::progress::ProgressReporter;
use crate::storage::{Partition, pmt};

const SYNC_CHAR: u8 = 0xC0;
const ACK: u8 = 0x5A;
const CONT_CHAR: u8 = 0x69;

const CMD_SDMMC_SWITCH_PART: u8 = 0x60;
const CMD_SDMMC_WRITE_DATA: u8 = 0x62;
const CMD_USB_CHECK_STATUS: u8 = 0x72;
const CMD_SDMMC_READ_PMT: u8 = 0xA5;
const CMD_READ: u8 = 0xD6;
const CMD_FINISH: u8 = 0xD9;
const CMD_NAND_READPAGE: u8 = 0xDF;

const HOST_LINUX: u8 = 0x0C;
const STAGE2_PACKET: usize = 0x1000;
const DATA_PACKET: u32 = 0x100000;
const READ_CHUNK: usize = 0x400;

#[derive(Debug, Decode, Default)]
pub struct NorInfo {
    pub ret: u32,
    pub chip_select: [u8; 2],
    pub flash_id: u16,
    pub flash_size: u32,
    pub dev_code: [u16; 4],
    pub otp_status: u32,
    pub otp_size: u32,
}

#[derive(Debug, Decode)]
struct NandInfo64 {
    ret: u32,
    chip_select: u8,
    flash_id: u16,
    flash_size: u64,
    id_count: u16,
}

#[derive(Debug, Decode)]
struct NandInfo32 {
    ret: u32,
    chip_select: u8,
    flash_id: u16,
    flash_size: u32,
    id_count: u16,
}

#[derive(Debug, Decode, Default)]
struct NandLayout {
    page_size: u16,
    spare_size: u16,
    pages_per_block: u16,
    io_interface: u8,
    addr_cycle: u8,
    bmt_exists: u8,
}

/// The merged NAND record both wire shapes end up in.
#[derive(Debug, Default)]
pub struct NandInfo {
    pub ret: u32,
    pub chip_select: u8,
    pub flash_id: u16,
    pub flash_size: u64,
    pub dev_codes: Vec<u16>,
    pub page_size: u16,
    pub spare_size: u16,
    pub pages_per_block: u16,
    pub io_interface: u8,
    pub addr_cycle: u8,
    pub bmt_exists: bool,
}

#[derive(Debug, Decode, Default)]
pub struct EmmcInfo {
    pub ret: u32,
    pub boot1_size: u64,
    pub boot2_size: u64,
    pub rpmb_size: u64,
    pub gp_size: [u64; 4],
    pub ua_size: u64,
    pub cid: [u64; 2],
    pub fwver: [u8; 8],
}

#[derive(Debug, Decode, Default)]
pub struct SdcInfo {
    pub info: u32,
    pub ua_size: u64,
    pub cid: [u64; 2],
}

#[derive(Debug, Decode, Default)]
pub struct ConfigInfo {
    pub sram_ret: u32,
    pub sram_size: u32,
    pub ext_ram_ret: u32,
    pub ext_ram_type: u8,
    pub ext_ram_chip_select: u8,
    pub ext_ram_size: u64,
    pub random_id: [u64; 2],
}

#[derive(Debug, Decode)]
struct PassInfo {
    ack: u8,
    download_status: u32,
    boot_style: u32,
    soc_ok: u8,
}

pub struct LegacyDa<P> {
    port: P,
    flash_type: FlashType,
    flash_size: u64,
    page_size: u32,
    pub nor: NorInfo,
    pub nand: NandInfo,
    pub emmc: EmmcInfo,
    pub sdc: SdcInfo,
    pub config: ConfigInfo,
}

impl<P: ProtocolPort> LegacyDa<P> {
    /// Boot both DA stages and read the flash geometry records.
    pub fn upload(mut pre: Preloader<P>, setup: DaSetup) -> Result<Self> {
        info!("Uploading stage 1...");
        pre.send_da(setup.da1.addr, setup.da1.sig_len, &setup.da1.data)?;
        pre.jump_da(setup.da1.addr)?;

        let mut port = pre.into_port();
        expect_byte(&mut port, SYNC_CHAR)?;

        // Probe block: the freshly started DA reports what storage answered.
        let nand_status = port.read_u32_be()?;
        debug!("NAND_INFO: {nand_status:#x}");
        let nand_id_count = port.read_u16_be()?;
        let mut nand_ids = Vec::with_capacity(nand_id_count as usize);
        for _ in 0..nand_id_count {
            nand_ids.push(port.read_u16_be()?);
        }

        let emmc_status = port.read_u32_be()?;
        debug!("EMMC_INFO: {emmc_status:#x}");
        let mut emmc_ids = [0u32; 4];
        for id in &mut emmc_ids {
            *id = port.read_u32_be()?;
        }

        let flash_type = if nand_ids.first().copied().unwrap_or(0) != 0 {
            FlashType::Nand
        } else if emmc_ids[0] != 0 {
            FlashType::Emmc
        } else {
            FlashType::Nor
        };
        info!("Detected flash: {flash_type}");

        port.write_all(&[ACK])?;
        let tail = read_vec(&mut port, 3)?;
        debug!("probe ack tail: {}", hex::encode(tail));

        info!("Uploading stage 2...");
        send_stage2(&mut port, &setup.da2.data, setup.da2.addr)?;

        let mut da = LegacyDa {
            port,
            flash_type,
            flash_size: 0,
            page_size: setup.page_size,
            nor: NorInfo::default(),
            nand: NandInfo::default(),
            emmc: EmmcInfo::default(),
            sdc: SdcInfo::default(),
            config: ConfigInfo::default(),
        };
        da.read_flash_info()?;

        da.flash_size = match da.flash_type {
            FlashType::Nand => da.nand.flash_size,
            FlashType::Nor => u64::from(da.nor.flash_size),
            _ => {
                if da.emmc.ua_size != 0 {
                    da.emmc.ua_size
                } else {
                    da.sdc.ua_size
                }
            }
        };
        info!("Flash size: {:#x}", da.flash_size);
        da.log_flash_info();

        Ok(da)
    }

    fn log_flash_info(&self) {
        info!(
            "eMMC: boot1 {:#x}, boot2 {:#x}, rpmb {:#x}, gp {:x?}, user {:#x}",
            self.emmc.boot1_size,
            self.emmc.boot2_size,
            self.emmc.rpmb_size,
            self.emmc.gp_size,
            self.emmc.ua_size
        );
        info!(
            "eMMC cid {:016x}{:016x}, fw version {}",
            self.emmc.cid[0],
            self.emmc.cid[1],
            hex::encode(self.emmc.fwver)
        );
        debug!(
            "NOR: ret {:#x}, cs {:02x?}, id {:#06x}, size {:#x}, dev codes {:x?}, otp {:#x}/{:#x}",
            self.nor.ret,
            self.nor.chip_select,
            self.nor.flash_id,
            self.nor.flash_size,
            self.nor.dev_code,
            self.nor.otp_status,
            self.nor.otp_size
        );
        debug!(
            "NAND: ret {:#x}, cs {:#x}, id {:#06x}, size {:#x}, dev codes {:x?}",
            self.nand.ret, self.nand.chip_select, self.nand.flash_id, self.nand.flash_size,
            self.nand.dev_codes
        );
        debug!(
            "NAND geometry: page {:#x}, spare {:#x}, pages/block {:#x}, io {}, cycles {}, bmt {}",
            self.nand.page_size,
            self.nand.spare_size,
            self.nand.pages_per_block,
            self.nand.io_interface,
            self.nand.addr_cycle,
            self.nand.bmt_exists
        );
        debug!(
            "SDC: info {:#x}, user {:#x}, cid {:016x}{:016x}",
            self.sdc.info, self.sdc.ua_size, self.sdc.cid[0], self.sdc.cid[1]
        );
        debug!(
            "Config: sram {:#x}/{:#x}, dram {:#x} type {} cs {} size {:#x}, random id {:016x}{:016x}",
            self.config.sram_ret,
            self.config.sram_size,
            self.config.ext_ram_ret,
            self.config.ext_ram_type,
            self.config.ext_ram_chip_select,
            self.config.ext_ram_size,
            self.config.random_id[0],
            self.config.random_id[1]
        );
    }

    /// Fixed geometry-record train emitted by the stage-2 DA once it runs.
    /// The NAND record comes in a 64-bit and a 32-bit shape; the 64-bit one
    /// is tried first and re-parsed as 32-bit iff its id count reads zero.
    fn read_flash_info(&mut self) -> Result<()> {
        self.nor = decode_be(&read_vec(&mut self.port, 0x1C)?)?;

        let nand_bytes = read_vec(&mut self.port, 0x11)?;
        let wide: NandInfo64 = decode_be(&nand_bytes)?;
        let (ret, chip_select, flash_id, flash_size, id_count, prefix) = if wide.id_count != 0 {
            (wide.ret, wide.chip_select, wide.flash_id, wide.flash_size, wide.id_count, Vec::new())
        } else {
            let narrow: NandInfo32 = decode_be(&nand_bytes[..13])?;
            // the 4 trailing bytes already belong to the dev-code list
            (
                narrow.ret,
                narrow.chip_select,
                narrow.flash_id,
                u64::from(narrow.flash_size),
                narrow.id_count,
                nand_bytes[13..].to_vec(),
            )
        };

        let mut code_bytes = prefix;
        let want = usize::from(id_count) * 2;
        code_bytes.truncate(want);
        if code_bytes.len() < want {
            let rest = read_vec(&mut self.port, want - code_bytes.len())?;
            code_bytes.extend_from_slice(&rest);
        }
        let dev_codes = code_bytes
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();

        let layout: NandLayout = decode_be(&read_vec(&mut self.port, 9)?)?;
        self.nand = NandInfo {
            ret,
            chip_select,
            flash_id,
            flash_size,
            dev_codes,
            page_size: layout.page_size,
            spare_size: layout.spare_size,
            pages_per_block: layout.pages_per_block,
            io_interface: layout.io_interface,
            addr_cycle: layout.addr_cycle,
            bmt_exists: layout.bmt_exists != 0,
        };

        self.emmc = decode_be(&read_vec(&mut self.port, 0x5C)?)?;
        self.sdc = decode_be(&read_vec(&mut self.port, 0x1C)?)?;
        self.config = decode_be(&read_vec(&mut self.port, 0x26)?)?;

        let pass: PassInfo = decode_be(&read_vec(&mut self.port, 0xA)?)?;
        debug!(
            "download status {:#x}, boot style {:#x}, soc ok {:#x}",
            pass.download_status, pass.boot_style, pass.soc_ok
        );
        if pass.ack != ACK {
            return Err(Error::UnexpectedByte { expected: ACK, got: pass.ack });
        }
        Ok(())
    }

    fn check_usb_cmd(&mut self) -> Result<()> {
        self.port.write_all(&[CMD_USB_CHECK_STATUS])?;
        let answer = read_vec(&mut self.port, 2)?;
        if answer[0] != ACK {
            return Err(Error::UnexpectedByte { expected: ACK, got: answer[0] });
        }
        Ok(())
    }

    fn sdmmc_switch_part(&mut self, parttype: PartitionKind) -> Result<()> {
        self.port.write_all(&[CMD_SDMMC_SWITCH_PART])?;
        expect_byte(&mut self.port, ACK)?;
        self.port.write_all(&[parttype.code() as u8])?;
        expect_byte(&mut self.port, ACK)?;
        Ok(())
    }

    fn read_emmc(
        &mut self,
        parttype: PartitionKind,
        addr: u64,
        len: u64,
        sink: &mut dyn Write,
        progress: &mut dyn ProgressReporter,
    ) -> Result<()> {
        self.sdmmc_switch_part(parttype)?;

        self.port.write_all(&[CMD_READ])?;
        self.port.write_all(&[HOST_LINUX])?;
        self.port.write_all(&[0x02])?; // hardware storage code: eMMC
        self.port.write_u64_be(addr)?;
        self.port.write_u64_be(len)?;
        self.port.write_u32_be(DATA_PACKET)?;
        expect_byte(&mut self.port, ACK)?;

        progress.start(len);
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(u64::from(DATA_PACKET)) as usize;
            let data = self.port.read_chunked(want, READ_CHUNK)?;
            if data.len() != want {
                return Err(Error::Port(mtk_port::err::Error::ShortRead {
                    wanted: want,
                    got: data.len(),
                }));
            }
            let checksum = self.port.read_u16_be()?;
            debug!("chunk checksum: {checksum:#06x}");
            self.port.write_all(&[ACK])?;
            sink.write_all(&data)?;
            remaining -= want as u64;
            progress.advance(len - remaining);
        }
        progress.finish();
        Ok(())
    }

    fn read_nand(
        &mut self,
        addr: u64,
        len: u64,
        sink: &mut dyn Write,
        progress: &mut dyn ProgressReporter,
    ) -> Result<()> {
        self.port.write_all(&[CMD_NAND_READPAGE])?;
        self.port.write_all(&[HOST_LINUX])?;
        self.port.write_all(&[0x00])?; // page+spare read
        self.port.write_all(&[0x01])?; // logical addressing
        self.port.write_u32_be(addr as u32)?;
        self.port.write_u32_be(len as u32)?;
        self.port.write_u32_be(0)?;
        expect_byte(&mut self.port, ACK)?;

        self.page_size = self.port.read_u32_be()?;
        let spare_size = self.port.read_u32_be()?;
        let packet_size = self.port.read_u32_be()?;
        debug!(
            "nand geometry: page {:#x}, spare {:#x}, packet {:#x}",
            self.page_size, spare_size, packet_size
        );
        self.port.write_u32_be(1)?; // pages per transfer
        let _ = self.port.read_u32_be()?;

        progress.start(len);
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(u64::from(packet_size)) as usize;
            let data = self.port.read_chunked(want, READ_CHUNK)?;
            if data.len() != want {
                return Err(Error::Port(mtk_port::err::Error::ShortRead {
                    wanted: want,
                    got: data.len(),
                }));
            }
            let checksum = self.port.read_u16_be()?;
            debug!("chunk checksum: {checksum:#06x}");
            self.port.write_all(&[ACK])?;
            sink.write_all(&data)?;
            remaining -= want as u64;
            progress.advance(len - remaining);
        }
        progress.finish();
        Ok(())
    }
}

impl<P: ProtocolPort> DaSession for LegacyDa<P> {
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
        self.check_usb_cmd()?;
        match self.flash_type {
            FlashType::Emmc | FlashType::Sdc => self.read_emmc(parttype, addr, len, sink, progress),
            FlashType::Nand => self.read_nand(addr, len, sink, progress),
            _ => Err(Error::Unsupported("reading this storage type")),
        }
    }

    fn write_flash(
        &mut self,
        parttype: PartitionKind,
        addr: u64,
        data: &[u8],
        progress: &mut dyn ProgressReporter,
    ) -> Result<()> {
        ensure_aligned(addr, self.page_size)?;
        if !self.flash_type.is_emmc() && !self.flash_type.is_sdc() {
            return Err(Error::Unsupported("writing this storage type"));
        }

        self.port.write_all(&[CMD_SDMMC_WRITE_DATA])?;
        self.port.write_all(&[self.flash_type.da_storage_code() as u8])?;
        self.port.write_all(&[parttype.code() as u8])?;
        self.port.write_u64_be(addr)?;
        self.port.write_u64_be(data.len() as u64)?;
        self.port.write_u32_be(DATA_PACKET)?;
        expect_byte(&mut self.port, ACK)?;

        progress.start(data.len() as u64);
        for (i, chunk) in data.chunks(DATA_PACKET as usize).enumerate() {
            self.port.write_all(&[ACK])?;
            self.port.write_all(chunk)?;
            self.port.write_u16_be(xor16(chunk))?;
            expect_byte(&mut self.port, CONT_CHAR)?;
            progress.advance((i * DATA_PACKET as usize + chunk.len()) as u64);
        }
        progress.finish();
        Ok(())
    }

    fn format_flash(&mut self, _parttype: PartitionKind, addr: u64, _len: u64) -> Result<()> {
        ensure_aligned(addr, self.page_size)?;
        Err(Error::Unsupported("format on the legacy DA"))
    }

    fn download(&mut self, _partition_name: &str, _data: &[u8]) -> Result<()> {
        Err(Error::Unsupported("name-keyed download on the legacy DA"))
    }

    fn read_pmt(&mut self, page_size: u32) -> Result<Option<Vec<Partition>>> {
        self.port.write_all(&[CMD_SDMMC_READ_PMT])?;
        expect_byte(&mut self.port, ACK)?;
        let length = self.port.read_u32_be()? as usize;
        self.port.write_all(&[ACK])?;
        let data = self.port.read_chunked(length, 0x200)?;
        if data.len() != length {
            return Err(Error::Port(mtk_port::err::Error::ShortRead {
                wanted: length,
                got: data.len(),
            }));
        }
        self.port.write_all(&[ACK])?;
        pmt::parse_pmt(&data, page_size).map(Some)
    }

    fn close(&mut self) -> Result<()> {
        // 0 = disconnect USB and release the power key
        self.port.write_all(&[CMD_FINISH])?;
        expect_byte(&mut self.port, ACK)?;
        self.port.write_u32_be(0)?;
        expect_byte(&mut self.port, ACK)?;
        Ok(())
    }
}

/// Stage-2 upload: raw header, fixed packets, one ACK per packet and a final
/// ACK exchange once the DA verified the image.
fn send_stage2<P: ProtocolPort>(port: &mut P, data: &[u8], addr: u32) -> Result<()> {
    port.write_u32_be(addr)?;
    port.write_u32_be(data.len() as u32)?;
    port.write_u32_be(STAGE2_PACKET as u32)?;
    expect_byte(port, ACK)?;

    for chunk in data.chunks(STAGE2_PACKET) {
        port.write_all(chunk)?;
        expect_byte(port, ACK)?;
    }

    // the DA verifies the image before it answers
    sleep(Duration::from_millis(500));
    port.write_all(&[ACK])?;
    expect_byte(port, ACK)?;
    Ok(())
}

fn expect_byte<P: ProtocolPort>(port: &mut P, expected: u8) -> Result<()> {
    let got = port.read_u8()?;
    if got != expected {
        return Err(Error::UnexpectedByte { expected, got });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Silent;
    use mtk_port::mock::{Io, ScriptPort};

    fn session(port: ScriptPort) -> LegacyDa<ScriptPort> {
        LegacyDa {
            port,
            flash_type: FlashType::Emmc,
            flash_size: 0x1_0000_0000,
            page_size: 0x200,
            nor: NorInfo::default(),
            nand: NandInfo::default(),
            emmc: EmmcInfo::default(),
            sdc: SdcInfo::default(),
            config: ConfigInfo::default(),
        }
    }

    #[test]
    fn write_header_and_chunks_match_the_wire_contract() {
        // Write 0x200000 bytes to "cache" at byte offset 0x08000000:
        // header, then two 1-MiB chunks, each ACK + data + XOR-16 + CONT.
        let data = vec![0xA5u8; 0x200000];
        let mut script = Vec::new();
        let mut header = vec![CMD_SDMMC_WRITE_DATA, 0x01, 0x08];
        header.extend_from_slice(&0x0800_0000u64.to_be_bytes());
        header.extend_from_slice(&0x0020_0000u64.to_be_bytes());
        header.extend_from_slice(&0x0010_0000u32.to_be_bytes());
        script.push(Io::Out(header));
        script.push(Io::In(vec![ACK]));
        for _ in 0..2 {
            script.push(Io::Out(vec![ACK]));
            let chunk = vec![0xA5u8; 0x100000];
            let checksum = xor16(&chunk);
            script.push(Io::Out(chunk));
            script.push(Io::Out(checksum.to_be_bytes().to_vec()));
            script.push(Io::In(vec![CONT_CHAR]));
        }

        let mut da = session(ScriptPort::new(script));
        da.write_flash(PartitionKind::User, 0x0800_0000, &data, &mut Silent).unwrap();
        assert!(da.port.done());
    }

    #[test]
    fn write_rejects_unaligned_offset() {
        let mut da = session(ScriptPort::new([]));
        let err = da.write_flash(PartitionKind::User, 0x1234, &[0u8; 4], &mut Silent).unwrap_err();
        assert!(matches!(err, Error::UnalignedOffset { .. }));
    }

    #[test]
    fn read_streams_chunks_and_acks() {
        let payload = vec![0x3Cu8; 0x400];
        let mut script = Vec::new();
        script.push(Io::Out(vec![CMD_USB_CHECK_STATUS]));
        script.push(Io::In(vec![ACK, 0x00]));
        // switch part
        script.push(Io::Out(vec![CMD_SDMMC_SWITCH_PART]));
        script.push(Io::In(vec![ACK]));
        script.push(Io::Out(vec![0x08]));
        script.push(Io::In(vec![ACK]));
        // read header
        let mut header = vec![CMD_READ, HOST_LINUX, 0x02];
        header.extend_from_slice(&0u64.to_be_bytes());
        header.extend_from_slice(&0x400u64.to_be_bytes());
        header.extend_from_slice(&DATA_PACKET.to_be_bytes());
        script.push(Io::Out(header));
        script.push(Io::In(vec![ACK]));
        // data + checksum, host acks
        script.push(Io::In(payload.clone()));
        script.push(Io::In(xor16(&payload).to_be_bytes().to_vec()));
        script.push(Io::Out(vec![ACK]));

        let mut da = session(ScriptPort::new(script));
        let mut out = Vec::new();
        da.read_flash(PartitionKind::User, 0, 0x400, &mut out, &mut Silent).unwrap();
        assert_eq!(out, payload);
        assert!(da.port.done());
    }

    #[test]
    fn format_is_unsupported() {
        let mut da = session(ScriptPort::new([]));
        assert!(matches!(
            da.format_flash(PartitionKind::User, 0, 0x200),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn nand_record_reparses_as_32bit_when_count_is_zero() {
        // 17 bytes that parse as a 64-bit record with id_count == 0, but as a
        // 32-bit record with two ids; the trailing 4 bytes are the ids.
        let mut nand_bytes = Vec::new();
        nand_bytes.extend_from_slice(&0xBC4u32.to_be_bytes());
        nand_bytes.push(0x00);
        nand_bytes.extend_from_slice(&0x98u16.to_be_bytes());
        nand_bytes.extend_from_slice(&0x2000_0000u32.to_be_bytes()); // 32-bit size
        nand_bytes.extend_from_slice(&2u16.to_be_bytes()); // 32-bit id count
        // first two dev codes; the zero second code is also what makes the
        // 64-bit parse read an id count of zero
        nand_bytes.extend_from_slice(&[0x01, 0x98, 0x00, 0x00]);

        let mut script = Vec::new();
        script.push(Io::In(vec![0u8; 0x1C])); // nor
        script.push(Io::In(nand_bytes));
        script.push(Io::In(vec![0u8; 9])); // nand layout
        script.push(Io::In(vec![0u8; 0x5C])); // emmc
        script.push(Io::In(vec![0u8; 0x1C])); // sdc
        script.push(Io::In(vec![0u8; 0x26])); // config
        let mut pass = vec![ACK];
        pass.extend_from_slice(&[0u8; 8]);
        pass.push(0x01);
        script.push(Io::In(pass));

        let mut da = session(ScriptPort::new(script));
        da.read_flash_info().unwrap();
        assert_eq!(da.nand.flash_size, 0x2000_0000);
        assert_eq!(da.nand.dev_codes, vec![0x0198, 0x0000]);
    }
}
