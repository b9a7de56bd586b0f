//! The two Download Agent dialects behind one session surface.
//!
//! The dialect is decided once, by the chip table, when the DA is uploaded;
//! afterwards all storage traffic goes through [`DaSession`] without caring
//! which dialect answers.

use std::io::Write;

use clap::ValueEnum;
use enum_dispatch::enum_dispatch;
use log::info;
use mtk_port::ProtocolPort;
use mtk_soc::DaMode;

use crate::Result;
use crate::err::Error;
use crate::preloader::Preloader;
use crate::progress::ProgressReporter;
use crate::storage::Partition;

pub mod legacy;
pub mod xflash;

pub use legacy::LegacyDa;
pub use xflash::XflashDa;

/// Storage technology reported by the DA probe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    derive_more::IsVariant,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum FlashType {
    #[default]
    Emmc,
    Nand,
    Nor,
    Ufs,
    Sdc,
}

impl FlashType {
    /// Storage selector of the DA protocols.
    pub fn da_storage_code(self) -> u32 {
        match self {
            FlashType::Emmc => 1,
            FlashType::Sdc => 2,
            FlashType::Nand => 3,
            FlashType::Nor => 4,
            FlashType::Ufs => 5,
        }
    }
}

/// eMMC-style hardware partition a storage operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[clap(rename_all = "lower")]
pub enum PartitionKind {
    Boot1 = 1,
    Boot2 = 2,
    Rpmb = 3,
    Gp1 = 4,
    Gp2 = 5,
    Gp3 = 6,
    Gp4 = 7,
    #[default]
    User = 8,
}

impl PartitionKind {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// One staged DA image, extracted out of the catalog entry.
#[derive(Debug, Clone)]
pub struct DaStage {
    pub data: Vec<u8>,
    pub addr: u32,
    pub sig_len: u32,
}

/// Everything needed to bring the DA up on one chip.
#[derive(Debug, Clone)]
pub struct DaSetup {
    pub da1: DaStage,
    pub da2: DaStage,
    pub page_size: u32,
}

impl DaSetup {
    pub fn from_entry(entry: &mtk_parser::Entry<'_>) -> Result<Self> {
        let stage = |region: Option<&mtk_parser::Region<'_>>| -> Result<DaStage> {
            let region = region
                .ok_or_else(|| Error::Custom("DA entry lacks stage regions".into()))?;
            Ok(DaStage {
                data: region.data().to_vec(),
                addr: region.base(),
                sig_len: region.signature_len(),
            })
        };
        Ok(DaSetup {
            da1: stage(entry.da1())?,
            da2: stage(entry.da2())?,
            page_size: if entry.page_size() == 0 { 512 } else { u32::from(entry.page_size()) },
        })
    }
}

/// Uniform storage surface of a booted DA.
#[enum_dispatch]
pub trait DaSession {
    fn flash_type(&self) -> FlashType;
    fn flash_size(&self) -> u64;
    fn page_size(&self) -> u32;

    fn read_flash(
        &mut self,
        parttype: PartitionKind,
        addr: u64,
        len: u64,
        sink: &mut dyn Write,
        progress: &mut dyn ProgressReporter,
    ) -> Result<()>;

    fn write_flash(
        &mut self,
        parttype: PartitionKind,
        addr: u64,
        data: &[u8],
        progress: &mut dyn ProgressReporter,
    ) -> Result<()>;

    fn format_flash(&mut self, parttype: PartitionKind, addr: u64, len: u64) -> Result<()>;

    /// Name-keyed whole-partition write; the DA resolves the name itself.
    fn download(&mut self, partition_name: &str, data: &[u8]) -> Result<()>;

    /// Legacy PMT, for flashes without a GPT. `None` when the dialect has no
    /// PMT access.
    fn read_pmt(&mut self, page_size: u32) -> Result<Option<Vec<Partition>>>;

    fn close(&mut self) -> Result<()>;
}

/// The chosen dialect. Constructed once by [`boot_da`] and never re-dispatched.
#[enum_dispatch(DaSession)]
pub enum DaDialect<P: ProtocolPort> {
    Legacy(LegacyDa<P>),
    Xflash(XflashDa<P>),
}

/// Select the catalog entry for the connected chip, upload both DA stages and
/// return the running session. Fails before any upload when the catalog has
/// no matching entry.
pub fn boot_da<P: ProtocolPort>(
    pre: Preloader<P>,
    loader: &[u8],
    preloader_img: Option<Vec<u8>>,
) -> Result<DaDialect<P>> {
    let catalog = mtk_parser::parse_da(loader)?;
    let entry = catalog.select(pre.chip.da_code, pre.hw_version, pre.sw_version)?;
    info!(
        "Using DA entry hw {:#06x}, hw version {:#06x}, sw version {:#06x}",
        entry.hw_code(),
        entry.hw_version(),
        entry.sw_version()
    );
    let setup = DaSetup::from_entry(entry)?;

    if pre.in_brom && pre.target_config.sla() {
        return Err(Error::Auth(
            "SLA is enabled, the BROM will reject the DA without authentication".into(),
        ));
    }

    match pre.chip.da_mode {
        DaMode::Default => Ok(LegacyDa::upload(pre, setup)?.into()),
        DaMode::Xflash => Ok(XflashDa::upload(pre, setup, preloader_img)?.into()),
    }
}

pub(crate) fn decode_be<T: bincode::Decode<()>>(data: &[u8]) -> Result<T> {
    let config = bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding();
    bincode::decode_from_slice(data, config)
        .map(|r| r.0)
        .map_err(Error::from)
}

pub(crate) fn decode_le<T: bincode::Decode<()>>(data: &[u8]) -> Result<T> {
    let config = bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding();
    bincode::decode_from_slice(data, config)
        .map(|r| r.0)
        .map_err(Error::from)
}

pub(crate) fn read_vec<P: ProtocolPort>(port: &mut P, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    port.read_exact(&mut buf)?;
    Ok(buf)
}

/// Byte offsets are page-aligned on the device side; reject the rest here.
pub(crate) fn ensure_aligned(addr: u64, page_size: u32) -> Result<()> {
    if page_size != 0 && addr % u64::from(page_size) != 0 {
        return Err(Error::UnalignedOffset { offset: addr, page_size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_kind_wire_codes() {
        assert_eq!(PartitionKind::User.code(), 8);
        assert_eq!(PartitionKind::Boot1.code(), 1);
        assert_eq!(PartitionKind::Rpmb.code(), 3);
        assert_eq!(PartitionKind::Gp4.code(), 7);
    }

    #[test]
    fn alignment_guard() {
        assert!(ensure_aligned(0x1000, 0x200).is_ok());
        assert!(matches!(
            ensure_aligned(0x1001, 0x200),
            Err(Error::UnalignedOffset { .. })
        ));
    }
}
