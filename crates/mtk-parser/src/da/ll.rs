//! Low-level representation of the DA catalog
//!
//! This matches the on-disk layout: the file header ends at 0x6C with the
//! entry count at 0x68, entries follow with a 0xDC stride.
use bincode::Decode;

use crate::{LLParser, Result, err::Error};

/// Stride between two catalog entries.
pub(crate) const ENTRY_STRIDE: usize = 0xDC;

#[derive(Debug, Decode)]
#[repr(C)]
pub(crate) struct Header {
    magic: [u8; 18],
    padding: [u8; 14],
    pub build_id: [u8; 64],
    unknown: u32,
    ty: u32,
    pub count: u32,
}

impl LLParser for Header {
    fn validate(&self) -> Result<()> {
        if &self.magic != b"MTK_DOWNLOAD_AGENT" {
            Err(Error::InvalidHeaderMagic(self.magic))
        } else if self.padding.iter().any(|b| *b != 0) {
            Err(Error::InvalidHeaderHeuristics)
        } else if self.ty != 0x22668899 {
            Err(Error::InvalidHeaderType(self.ty))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Decode)]
#[repr(C)]
pub(crate) struct Entry {
    pub magic: u16,
    pub hw_code: u16,
    pub hw_subcode: u16,
    pub hw_version: u16,
    pub sw_version: u16,
    reserved1: u16,
    pub page_size: u16,
    reserved2: u16,
    region_index: u16,
    pub region_count: u16,
}

impl LLParser for Entry {
    fn validate(&self) -> Result<()> {
        if self.magic != 0xDADA {
            Err(Error::InvalidEntryMagic(self.magic))
        } else if self.region_count == 0 {
            Err(Error::InvalidRegionCount)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Decode)]
#[repr(C)]
pub(crate) struct LoadRegion {
    /// Offset of the region bytes within the DA file
    pub buf_offset: u32,
    /// Region length, signature included
    pub length: u32,
    /// Load address on the device
    pub start_addr: u32,
    pub file_offset: u32,
    pub sig_len: u32,
}

impl LLParser for LoadRegion {
    fn validate(&self) -> Result<()> {
        if self.buf_offset < 0x100 {
            Err(Error::InvalidRegionStart(self.buf_offset))
        } else if self.length < 0x100 {
            Err(Error::InvalidRegionSize(self.length))
        } else {
            Ok(())
        }
    }
}
