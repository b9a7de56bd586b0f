//! Side channel spoken to attacker-supplied stage-2 code running on the
//! device after the exploit.
//!
//! The dialect is deliberately tiny: the payload announces readiness with a
//! single magic word, then accepts big-endian `{magic, cmd, args...}` records
//! for raw memory access, eMMC partition switching and sector reads.

use core::fmt::Display;

use derive_ctor::ctor;
use derive_more::IsVariant;
use mtk_port::{SimpleRead, SimpleWrite};

use crate::err::Error;

pub mod err;

pub type Result<T> = core::result::Result<T, Error>;

/// Request magic, big-endian on the wire.
pub const MAGIC: u32 = 0xF00DD00D;
/// Emitted once by the payload when it is up.
pub const READY: u32 = 0xB1B2B3B4;
/// Terminating status completing each mutation.
pub const STATUS_DONE: u32 = 0xD0D0D0D0;

pub const EMMC_SECTOR_SIZE: usize = 0x200;
pub const RPMB_SECTOR_SIZE: usize = 0x100;

/// Stage-2 requests
#[derive(Debug, Clone, Copy, IsVariant)]
pub enum Command {
    /// Select the active eMMC physical partition (0 = user, 1/2 = boot)
    EmmcSwitch { part: u32 },
    /// Read one 0x200-byte sector of the selected partition
    EmmcRead { sector: u32 },
    /// Read one 0x100-byte RPMB sector; the payload answers byte-reversed
    RpmbRead { sector: u16 },
    /// Pet the watchdog
    KickWdt,
    /// Write bytes into device memory
    MemWrite { addr: u32, len: u32 },
    /// Jump to `addr`
    MemJump { addr: u32 },
    /// Read bytes from device memory
    MemRead { addr: u32, len: u32 },
}

impl Command {
    fn opcode(&self) -> u32 {
        match self {
            Self::EmmcRead { .. } => 0x1000,
            Self::EmmcSwitch { .. } => 0x1002,
            Self::RpmbRead { .. } => 0x2000,
            Self::KickWdt => 0x3001,
            Self::MemWrite { .. } => 0x4000,
            Self::MemJump { .. } => 0x4001,
            Self::MemRead { .. } => 0x4002,
        }
    }

    fn emit<W: SimpleWrite>(&self, io: &mut W) -> Result<()> {
        io.write_u32_be(MAGIC)?;
        io.write_u32_be(self.opcode())?;
        match *self {
            Self::EmmcSwitch { part } => io.write_u32_be(part)?,
            Self::EmmcRead { sector } => io.write_u32_be(sector)?,
            Self::RpmbRead { sector } => io.write_u16_be(sector)?,
            Self::KickWdt => {}
            Self::MemJump { addr } => io.write_u32_be(addr)?,
            Self::MemWrite { addr, len } | Self::MemRead { addr, len } => {
                io.write_u32_be(addr)?;
                io.write_u32_be(len)?;
            }
        }
        Ok(())
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::EmmcSwitch { part } => write!(f, "eMMC switch to part {part}"),
            Self::EmmcRead { sector } => write!(f, "eMMC read sector {sector:#x}"),
            Self::RpmbRead { sector } => write!(f, "RPMB read sector {sector:#x}"),
            Self::KickWdt => write!(f, "Kick watchdog"),
            Self::MemWrite { addr, len } => write!(f, "Write {len:#x} bytes @ {addr:#010x}"),
            Self::MemJump { addr } => write!(f, "Jump to {addr:#010x}"),
            Self::MemRead { addr, len } => write!(f, "Read {len:#x} bytes @ {addr:#010x}"),
        }
    }
}

/// A live session with a stage-2 payload.
#[derive(ctor)]
pub struct Stage2<T: SimpleRead + SimpleWrite> {
    io: T,
}

impl<T: SimpleRead + SimpleWrite> Stage2<T> {
    /// Wait for the payload's readiness announcement. Anything but the magic
    /// word means the jump did not reach our code.
    pub fn attach(mut io: T) -> Result<Self> {
        let word = io.read_u32_be()?;
        if word != READY {
            return Err(Error::NotReady(word));
        }
        log::debug!("stage2 payload is up");
        Ok(Self::new(io))
    }

    fn send(&mut self, cmd: Command) -> Result<()> {
        log::trace!("stage2: {cmd}");
        cmd.emit(&mut self.io)
    }

    pub fn emmc_switch(&mut self, part: u32) -> Result<()> {
        self.send(Command::EmmcSwitch { part })
    }

    pub fn emmc_read_sector(&mut self, sector: u32) -> Result<[u8; EMMC_SECTOR_SIZE]> {
        self.send(Command::EmmcRead { sector })?;
        let mut buf = [0u8; EMMC_SECTOR_SIZE];
        self.io.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// RPMB sectors come back byte-reversed; the reversal is undone here.
    pub fn rpmb_read_sector(&mut self, sector: u16) -> Result<[u8; RPMB_SECTOR_SIZE]> {
        self.send(Command::RpmbRead { sector })?;
        let mut buf = [0u8; RPMB_SECTOR_SIZE];
        self.io.read_exact(&mut buf)?;
        buf.reverse();
        Ok(buf)
    }

    pub fn kick_watchdog(&mut self) -> Result<()> {
        self.send(Command::KickWdt)
    }

    pub fn mem_read(&mut self, addr: u32, len: u32) -> Result<Vec<u8>> {
        self.send(Command::MemRead { addr, len })?;
        let mut out = vec![0u8; len as usize];
        self.io.read_exact(&mut out)?;
        Ok(out)
    }

    pub fn mem_write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.send(Command::MemWrite { addr, len: data.len() as u32 })?;
        self.io.write_all(data)?;
        let status = self.io.read_u32_be()?;
        if status != STATUS_DONE {
            return Err(Error::BadStatus(status));
        }
        Ok(())
    }

    pub fn jump(&mut self, addr: u32) -> Result<()> {
        self.send(Command::MemJump { addr })
    }

    pub fn into_inner(self) -> T {
        self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtk_port::mock::{Io, ScriptPort};

    fn be(v: u32) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }

    #[test]
    fn attach_requires_readiness_word() {
        let port = ScriptPort::new([Io::In(be(READY))]);
        assert!(Stage2::attach(port).is_ok());

        let port = ScriptPort::new([Io::In(be(0xDEADBEEF))]);
        assert!(matches!(Stage2::attach(port), Err(Error::NotReady(0xDEADBEEF))));
    }

    #[test]
    fn emmc_read_wire_format() {
        let sector_data = vec![0x5Au8; EMMC_SECTOR_SIZE];
        let port = ScriptPort::new([
            Io::In(be(READY)),
            Io::Out([be(MAGIC), be(0x1002), be(1)].concat()),
            Io::Out([be(MAGIC), be(0x1000), be(0x8000)].concat()),
            Io::In(sector_data.clone()),
        ]);
        let mut s2 = Stage2::attach(port).unwrap();
        s2.emmc_switch(1).unwrap();
        let sector = s2.emmc_read_sector(0x8000).unwrap();
        assert_eq!(&sector[..], &sector_data[..]);
        assert!(s2.into_inner().done());
    }

    #[test]
    fn rpmb_read_is_reversed() {
        let mut reply = vec![0u8; RPMB_SECTOR_SIZE];
        reply[0] = 0xAA; // last byte after reversal
        let port = ScriptPort::new([
            Io::In(be(READY)),
            Io::Out([be(MAGIC), be(0x2000), 0x10u16.to_be_bytes().to_vec()].concat()),
            Io::In(reply),
        ]);
        let mut s2 = Stage2::attach(port).unwrap();
        let sector = s2.rpmb_read_sector(0x10).unwrap();
        assert_eq!(sector[RPMB_SECTOR_SIZE - 1], 0xAA);
    }

    #[test]
    fn mem_write_expects_terminating_status() {
        let data = vec![0x11u8; 8];
        let port = ScriptPort::new([
            Io::In(be(READY)),
            Io::Out([be(MAGIC), be(0x4000), be(0x201000), be(8)].concat()),
            Io::Out(data.clone()),
            Io::In(be(STATUS_DONE)),
        ]);
        let mut s2 = Stage2::attach(port).unwrap();
        s2.mem_write(0x201000, &data).unwrap();

        let port = ScriptPort::new([
            Io::In(be(READY)),
            Io::Out([be(MAGIC), be(0x4000), be(0x201000), be(8)].concat()),
            Io::Out(data.clone()),
            Io::In(be(0)),
        ]);
        let mut s2 = Stage2::attach(port).unwrap();
        assert!(matches!(s2.mem_write(0x201000, &data), Err(Error::BadStatus(0))));
    }
}
