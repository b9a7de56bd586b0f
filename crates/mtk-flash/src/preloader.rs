//! Session with the chip while it is stopped in BROM or preloader mode.
//!
//! The session owns the port, performs the identification/init sequence once
//! and exposes the command surface the exploit and the DA upload build on.

use log::{debug, info, warn};
use mtk_port::ProtocolPort;
use mtk_soc::ChipConfig;

use crate::Result;
use crate::checksum::xor16;
use crate::commands::{GetHwCode, GetHwSwVer, GetTargetConfig, JumpDa, Read16, Read32};
use crate::err::Error;
use crate::mmio::{MmioPeer, RegBlock};

const CMD_WRITE16: u8 = 0xD2;
const CMD_WRITE32: u8 = 0xD4;
const CMD_SEND_DA: u8 = 0xD7;
const CMD_GET_ME_ID: u8 = 0xE1;
const CMD_GET_SOC_ID: u8 = 0xE7;
const CMD_GET_BL_VER: u8 = 0xFE;

/// The target-config fuse/flag bit-set, read-only after init.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetConfig {
    pub raw: u32,
}

impl TargetConfig {
    pub fn sbc(&self) -> bool {
        self.raw & 0x1 != 0
    }

    pub fn sla(&self) -> bool {
        self.raw & 0x2 != 0
    }

    pub fn daa(&self) -> bool {
        self.raw & 0x4 != 0
    }

    pub fn swjtag(&self) -> bool {
        self.raw & 0x6 != 0
    }

    pub fn epp(&self) -> bool {
        self.raw & 0x8 != 0
    }

    pub fn root_cert(&self) -> bool {
        self.raw & 0x10 != 0
    }

    pub fn mem_read_auth(&self) -> bool {
        self.raw & 0x20 != 0
    }

    pub fn mem_write_auth(&self) -> bool {
        self.raw & 0x40 != 0
    }

    pub fn cmd_c8_blocked(&self) -> bool {
        self.raw & 0x80 != 0
    }

    /// SLA or DAA force the Kamakiri path for unsigned payloads.
    pub fn needs_exploit(&self) -> bool {
        self.sla() || self.daa()
    }
}

/// Chip parameter overrides taken from the command line.
#[derive(Debug, Default, Clone)]
pub struct ChipOverrides {
    pub watchdog_addr: Option<u32>,
    pub uart_addr: Option<u32>,
    pub var1: Option<u8>,
    pub brom_payload_addr: Option<u32>,
    pub da_payload_addr: Option<u32>,
}

#[derive(Debug)]
pub struct Preloader<P> {
    port: P,
    pub chip: ChipConfig,
    pub hw_code: u16,
    pub hw_sub_code: u16,
    pub hw_version: u16,
    pub sw_version: u16,
    pub bl_version: u8,
    pub in_brom: bool,
    pub target_config: TargetConfig,
    pub meid: Vec<u8>,
    pub soc_id: Vec<u8>,
}

impl<P: ProtocolPort> Preloader<P> {
    /// Identify the chip and bring the session into a defined state. The
    /// handshake must have completed on `port` already.
    ///
    /// An unknown hw code fails here, before anything else is sent.
    pub fn init(mut port: P, overrides: &ChipOverrides, skip_wdt: bool) -> Result<Self> {
        drain(&mut port)?;

        let mut hw = GetHwCode::new();
        hw.run(&mut port)?;

        let mut chip = ChipConfig::by_hw_code(hw.hw_code)
            .ok_or(Error::UnknownChip(hw.hw_code))?
            .clone();
        if let Some(wdt) = overrides.watchdog_addr {
            chip.watchdog_addr = wdt;
        }
        if let Some(uart) = overrides.uart_addr {
            chip.uart_addr = uart;
        }
        if let Some(var1) = overrides.var1 {
            chip.var1 = var1;
        }
        if let Some(addr) = overrides.brom_payload_addr {
            chip.brom_payload_addr = addr;
        }
        if let Some(addr) = overrides.da_payload_addr {
            chip.da_payload_addr = addr;
        }

        info!("CPU: {} ({})", chip.name, chip.description);
        info!("HW code: {:#06x}, HW version: {:#06x}", hw.hw_code, hw.hw_version);
        info!("Watchdog: {:#010x}, Uart: {:#010x}", chip.watchdog_addr, chip.uart_addr);
        info!(
            "Brom payload addr: {:#x}, DA payload addr: {:#x}, Var1: {:#04x}",
            chip.brom_payload_addr, chip.da_payload_addr, chip.var1
        );
        if let Some(base) = chip.cqdma_base {
            debug!("CQ_DMA base: {base:#010x}");
        }
        if let Some(base) = chip.sej_base {
            debug!("SEJ base: {base:#010x}");
        }
        if let Some(base) = chip.dxcc_base {
            debug!("DXCC base: {base:#010x}");
        }
        if let Some(base) = chip.gcpu_base {
            debug!("GCPU base: {base:#010x}");
        }
        debug!("exploit staging blacklist: {:x?}", chip.blacklist);

        let mut ver = GetHwSwVer::new();
        ver.run(&mut port)?;
        info!(
            "HW subcode: {:#06x}, HW ver: {:#06x}, SW ver: {:#06x}",
            ver.hw_sub_code, ver.hw_version, ver.sw_version
        );

        let mut tc = GetTargetConfig::new();
        tc.run(&mut port)?;
        let target_config = TargetConfig { raw: tc.config };
        info!("Target config: {:#x}", target_config.raw);
        info!("\tSBC enabled: {}", target_config.sbc());
        info!("\tSLA enabled: {}", target_config.sla());
        info!("\tDAA enabled: {}", target_config.daa());

        let (bl_version, in_brom) = get_blver(&mut port)?;
        if in_brom {
            info!("Device is in BROM mode");
        } else {
            info!("Device is in preloader mode, BL version {bl_version}");
        }

        let mut this = Preloader {
            port,
            chip,
            hw_code: hw.hw_code,
            hw_sub_code: ver.hw_sub_code,
            hw_version: ver.hw_version,
            sw_version: ver.sw_version,
            bl_version,
            in_brom,
            target_config,
            meid: Vec::new(),
            soc_id: Vec::new(),
        };

        if skip_wdt {
            warn!("Watchdog left running on request");
        } else {
            debug!("Disabling watchdog");
            this.disable_watchdog()?;
        }

        if this.in_brom {
            match this.get_meid() {
                Ok(meid) => {
                    info!("MEID: {}", hex::encode_upper(&meid));
                    this.meid = meid;
                }
                Err(e) => debug!("MEID not available: {e}"),
            }
            match this.get_soc_id() {
                Ok(soc_id) => {
                    info!("SoC ID: {}", hex::encode_upper(&soc_id));
                    this.soc_id = soc_id;
                }
                Err(e) => debug!("SoC ID not available: {e}"),
            }
        }

        Ok(this)
    }

    /// One WRITE32 of the chip-specific disable word, issued before anything
    /// that takes longer than the watchdog period.
    pub fn disable_watchdog(&mut self) -> Result<()> {
        let wdt = RegBlock::new(self.chip.watchdog_addr);
        let word = self.chip.watchdog_disable_word();
        wdt.write(self, 0, word)
    }

    pub fn read16(&mut self, addr: u32, halfwords: u32) -> Result<Vec<u16>> {
        let mut cmd = Read16::new(addr, halfwords);
        cmd.run(&mut self.port)?;
        Ok(cmd.buf)
    }

    pub fn read32(&mut self, addr: u32, dwords: u32) -> Result<Vec<u32>> {
        let mut cmd = Read32::new(addr, dwords);
        cmd.run(&mut self.port)?;
        Ok(cmd.buf)
    }

    pub fn write16(&mut self, addr: u32, halfwords: &[u16]) -> Result<()> {
        self.port.echo(&[CMD_WRITE16])?;
        self.port.echo(&addr.to_be_bytes())?;
        self.port.echo(&(halfwords.len() as u32).to_be_bytes())?;
        let status = self.port.read_u16_be()?;
        if status >= 3 {
            return Err(Error::Status(status));
        }
        for half in halfwords {
            self.port.echo(&half.to_be_bytes())?;
        }
        let status = self.port.read_u16_be()?;
        if status >= 3 {
            return Err(Error::Status(status));
        }
        Ok(())
    }

    pub fn write32(&mut self, addr: u32, words: &[u32]) -> Result<()> {
        self.port.echo(&[CMD_WRITE32])?;
        self.port.echo(&addr.to_be_bytes())?;
        self.port.echo(&(words.len() as u32).to_be_bytes())?;
        let status = self.port.read_u16_be()?;
        if status >= 3 {
            return Err(Error::Status(status));
        }
        for word in words {
            self.port.echo(&word.to_be_bytes())?;
        }
        let status = self.port.read_u16_be()?;
        if status >= 3 {
            return Err(Error::Status(status));
        }
        Ok(())
    }

    /// Write a byte buffer word-wise, little-endian as it sits in the file.
    pub fn write_mem(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        for (i, chunk) in data.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.write32(addr + (i as u32) * 4, &[u32::from_le_bytes(word)])?;
        }
        Ok(())
    }

    pub fn jump_da(&mut self, addr: u32) -> Result<()> {
        let mut cmd = JumpDa::new(addr);
        cmd.run(&mut self.port)
    }

    /// Upload a DA stage: echoed header, payload in 64-byte chunks padded to
    /// even length, then the device's XOR-16 checksum and a final status.
    pub fn send_da(&mut self, addr: u32, sig_len: u32, data: &[u8]) -> Result<()> {
        let mut payload = data.to_vec();
        if payload.len() % 2 != 0 {
            payload.push(0);
        }
        let checksum = xor16(&payload);

        self.port.echo(&[CMD_SEND_DA])?;
        self.port.echo(&addr.to_be_bytes())?;
        self.port.echo(&(payload.len() as u32).to_be_bytes())?;
        self.port.echo(&sig_len.to_be_bytes())?;

        let status = self.port.read_u16_be()?;
        if status > 0xFF {
            return Err(Error::Status(status));
        }

        for chunk in payload.chunks(64) {
            self.port.write_all(chunk)?;
        }
        self.port.write_all(&[])?;

        let dev_checksum = self.port.read_u16_be()?;
        let status = self.port.read_u16_be()?;
        // Some BROMs report a zero checksum instead of computing one.
        if dev_checksum != 0 && dev_checksum != checksum {
            return Err(Error::ChecksumMismatch { expected: checksum, got: dev_checksum });
        }
        if status > 0xFF {
            return Err(Error::Status(status));
        }
        Ok(())
    }

    /// MEID, BROM only. Length-prefixed reply.
    pub fn get_meid(&mut self) -> Result<Vec<u8>> {
        self.read_id(CMD_GET_ME_ID)
    }

    /// SoC ID, BROM only. Length-prefixed reply.
    pub fn get_soc_id(&mut self) -> Result<Vec<u8>> {
        self.read_id(CMD_GET_SOC_ID)
    }

    fn read_id(&mut self, cmd: u8) -> Result<Vec<u8>> {
        self.port.echo(&[cmd])?;
        let length = self.port.read_u32_be()?;
        let mut id = vec![0u8; length as usize];
        self.port.read_exact(&mut id)?;
        let status = self.port.read_u16_be()?;
        if status != 0 {
            return Err(Error::Status(status));
        }
        Ok(id)
    }

    pub fn port(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }

    /// Session with canned identity, for protocol tests.
    #[cfg(test)]
    pub(crate) fn test_session(port: P, chip: ChipConfig) -> Self {
        Preloader {
            port,
            hw_code: chip.hw_code,
            chip,
            hw_sub_code: 0x8A00,
            hw_version: 0xCA01,
            sw_version: 0x1,
            bl_version: 1,
            in_brom: true,
            target_config: TargetConfig::default(),
            meid: Vec::new(),
            soc_id: Vec::new(),
        }
    }
}

impl<P: ProtocolPort> MmioPeer for Preloader<P> {
    fn read_word(&mut self, addr: u32) -> Result<u32> {
        Ok(self.read32(addr, 1)?[0])
    }

    fn write_word(&mut self, addr: u32, value: u32) -> Result<()> {
        self.write32(addr, &[value])
    }
}

/// GET_BL_VER doubles as mode detection: the BROM does not consume the
/// opcode but echoes it, the preloader answers with its version byte.
fn get_blver<P: ProtocolPort>(port: &mut P) -> Result<(u8, bool)> {
    port.write_all(&[CMD_GET_BL_VER])?;
    let version = port.read_u8()?;
    if version == CMD_GET_BL_VER {
        Ok((1, true))
    } else {
        Ok((version, false))
    }
}

/// Toss stale bytes (the preloader greets with "READY") before the first
/// command.
fn drain<P: ProtocolPort>(port: &mut P) -> Result<()> {
    let mut buf = [0u8; 64];
    for _ in 0..4 {
        if port.read_avail(&mut buf)? == 0 {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtk_port::mock::{Io, ScriptPort};

    fn echoed(bytes: &[u8]) -> [Io; 2] {
        [Io::Out(bytes.to_vec()), Io::In(bytes.to_vec())]
    }

    fn init_script(hw_code: u16, target_config: u32, blver_reply: u8) -> Vec<Io> {
        let mut s = Vec::new();
        // GET_HW_CODE
        s.extend(echoed(&[0xFD]));
        s.push(Io::In(hw_code.to_be_bytes().to_vec()));
        s.push(Io::In(vec![0xCA, 0x01]));
        // GET_HW_SW_VER
        s.extend(echoed(&[0xFC]));
        s.push(Io::In(vec![0x8A, 0x00])); // subcode
        s.push(Io::In(vec![0xCA, 0x01])); // hw ver
        s.push(Io::In(vec![0x00, 0x01])); // sw ver
        s.push(Io::In(vec![0x00, 0x00]));
        // GET_TARGET_CONFIG
        s.extend(echoed(&[0xD8]));
        s.push(Io::In(target_config.to_be_bytes().to_vec()));
        s.push(Io::In(vec![0x00, 0x00]));
        // GET_BL_VER
        s.push(Io::Out(vec![0xFE]));
        s.push(Io::In(vec![blver_reply]));
        s
    }

    fn write32_script(addr: u32, words: &[u32]) -> Vec<Io> {
        let mut s = Vec::new();
        s.extend(echoed(&[0xD4]));
        s.extend(echoed(&addr.to_be_bytes()));
        s.extend(echoed(&(words.len() as u32).to_be_bytes()));
        s.push(Io::In(vec![0x00, 0x01]));
        for w in words {
            s.extend(echoed(&w.to_be_bytes()));
        }
        s.push(Io::In(vec![0x00, 0x01]));
        s
    }

    #[test]
    fn init_identifies_chip_and_disables_watchdog() {
        let mut script = init_script(0x0766, 0x0, 0xFE);
        // watchdog disable: WRITE32 0x10007000 <- 0x22000064
        script.extend(write32_script(0x1000_7000, &[0x2200_0064]));
        // MEID: echo 0xE1, len 16, bytes, status
        script.extend(echoed(&[0xE1]));
        script.push(Io::In(16u32.to_be_bytes().to_vec()));
        script.push(Io::In(vec![0xAB; 16]));
        script.push(Io::In(vec![0x00, 0x00]));
        // SoC id: echo 0xE7, len 32, bytes, status
        script.extend(echoed(&[0xE7]));
        script.push(Io::In(32u32.to_be_bytes().to_vec()));
        script.push(Io::In(vec![0xCD; 32]));
        script.push(Io::In(vec![0x00, 0x00]));

        let port = ScriptPort::new(script);
        let pre = Preloader::init(port, &ChipOverrides::default(), false).unwrap();
        assert_eq!(pre.chip.name, "MT6765");
        assert_eq!(pre.hw_version, 0xCA01);
        assert_eq!(pre.sw_version, 0x1);
        assert!(pre.in_brom);
        assert_eq!(pre.meid.len(), 16);
        assert_eq!(pre.soc_id.len(), 32);
    }

    #[test]
    fn init_fails_hard_on_unknown_hw_code() {
        // S4: an unknown chip must fail before any further traffic.
        let script = {
            let mut s = Vec::new();
            s.extend(echoed(&[0xFD]));
            s.push(Io::In(0xABCDu16.to_be_bytes().to_vec()));
            s.push(Io::In(vec![0x00, 0x00]));
            s
        };
        let port = ScriptPort::new(script);
        let err = Preloader::init(port, &ChipOverrides::default(), false).unwrap_err();
        assert!(matches!(err, Error::UnknownChip(0xABCD)));
    }

    #[test]
    fn send_da_chunks_and_verifies_checksum() {
        let payload = vec![0x5Au8; 100]; // even length, two chunks (64 + 36)
        let checksum = xor16(&payload);

        let mut script = Vec::new();
        script.extend(echoed(&[0xD7]));
        script.extend(echoed(&0x0020_0000u32.to_be_bytes()));
        script.extend(echoed(&(payload.len() as u32).to_be_bytes()));
        script.extend(echoed(&0u32.to_be_bytes()));
        script.push(Io::In(vec![0x00, 0x00]));
        script.push(Io::Out(payload.clone()));
        script.push(Io::In(checksum.to_be_bytes().to_vec()));
        script.push(Io::In(vec![0x00, 0x00]));

        let port = ScriptPort::new(script);
        let mut pre = fake_session(port);
        pre.send_da(0x0020_0000, 0, &payload).unwrap();
        assert!(pre.into_port().done());
    }

    #[test]
    fn send_da_rejects_wrong_checksum() {
        let payload = vec![0x11u8; 4];
        let mut script = Vec::new();
        script.extend(echoed(&[0xD7]));
        script.extend(echoed(&0x0010_0A00u32.to_be_bytes()));
        script.extend(echoed(&4u32.to_be_bytes()));
        script.extend(echoed(&0u32.to_be_bytes()));
        script.push(Io::In(vec![0x00, 0x00]));
        script.push(Io::Out(payload.clone()));
        script.push(Io::In(vec![0x12, 0x34])); // bogus checksum
        script.push(Io::In(vec![0x00, 0x00]));

        let port = ScriptPort::new(script);
        let mut pre = fake_session(port);
        let err = pre.send_da(0x0010_0A00, 0, &payload).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn read16_collects_halfwords() {
        let mut script = Vec::new();
        script.extend(echoed(&[0xD0]));
        script.extend(echoed(&0x1100_2000u32.to_be_bytes()));
        script.extend(echoed(&2u32.to_be_bytes()));
        script.push(Io::In(vec![0x00, 0x00]));
        script.push(Io::In(vec![0x12, 0x34]));
        script.push(Io::In(vec![0x56, 0x78]));
        script.push(Io::In(vec![0x00, 0x00]));

        let port = ScriptPort::new(script);
        let mut pre = fake_session(port);
        assert_eq!(pre.read16(0x1100_2000, 2).unwrap(), vec![0x1234, 0x5678]);
    }

    #[test]
    fn write16_echoes_every_halfword() {
        let mut script = Vec::new();
        script.extend(echoed(&[0xD2]));
        script.extend(echoed(&0x1100_2000u32.to_be_bytes()));
        script.extend(echoed(&1u32.to_be_bytes()));
        script.push(Io::In(vec![0x00, 0x00]));
        script.extend(echoed(&0xCAFEu16.to_be_bytes()));
        script.push(Io::In(vec![0x00, 0x00]));

        let port = ScriptPort::new(script);
        let mut pre = fake_session(port);
        pre.write16(0x1100_2000, &[0xCAFE]).unwrap();
        assert!(pre.into_port().done());
    }

    #[test]
    fn write32_echoes_every_word() {
        let port = ScriptPort::new(write32_script(0x1000_7000, &[0x2200_0064]));
        let mut pre = fake_session(port);
        pre.write32(0x1000_7000, &[0x2200_0064]).unwrap();
        assert!(pre.into_port().done());
    }

    #[test]
    fn write_mem_splits_into_le_words() {
        // Buffer bytes go out as little-endian words, one WRITE32 each.
        let mut script = write32_script(0x0020_1000, &[0x44332211]);
        script.extend(write32_script(0x0020_1004, &[0x00000055]));

        let port = ScriptPort::new(script);
        let mut pre = fake_session(port);
        pre.write_mem(0x0020_1000, &[0x11, 0x22, 0x33, 0x44, 0x55]).unwrap();
        assert!(pre.into_port().done());
    }

    fn fake_session(port: ScriptPort) -> Preloader<ScriptPort> {
        Preloader::test_session(port, ChipConfig::by_hw_code(0x766).unwrap().clone())
    }
}
