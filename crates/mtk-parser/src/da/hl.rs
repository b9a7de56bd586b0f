//! High-level representation of the DA catalog
//!
//! Intended for end use.
use std::{borrow::Cow, fmt::Display};

use getset::{CopyGetters, Getters};

use crate::{HLParser, LLParser, Result, da::ll, err::Error};

#[derive(Debug, Getters)]
pub struct Da<'a> {
    /// Build ID
    #[getset(get = "pub")]
    build_id: String,

    /// Entries per SoC
    #[getset(get = "pub")]
    entries: Vec<Entry<'a>>,
}

impl<'a> HLParser<'a, ll::Header> for Da<'a> {
    fn parse(data: &'a [u8], position: usize, ll: ll::Header) -> Result<Self> {
        ll.validate()?;
        Ok(Self {
            build_id: String::from_utf8_lossy(&ll.build_id)
                .trim_end_matches('\0')
                .to_string(),
            entries: (0..ll.count as usize)
                .map(|i| {
                    let start = position + (i * ll::ENTRY_STRIDE);
                    let end = start + ll::ENTRY_STRIDE;
                    if end > data.len() {
                        return Err(Error::RegionOutOfBounds { start, end, len: data.len() });
                    }
                    let ll = ll::Entry::parse(&data[start..])?;
                    Entry::parse(data, start + size_of::<ll::Entry>(), ll)
                })
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

impl Display for Da<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Build ID: {}", self.build_id)?;
        writeln!(f, "Entries:")?;
        for (i, entry) in self.entries.iter().enumerate() {
            writeln!(f, "Entry {}:", i + 1)?;
            for line in format!("{entry}").lines() {
                writeln!(f, "\t{line}")?;
            }
            if i != self.entries.len() - 1 {
                writeln!(f)?;
            }
        }

        Ok(())
    }
}

impl<'a> Da<'a> {
    /// Pick the catalog entry for a live device: `da_code` must match and
    /// both versions must not exceed the device's, highest match wins.
    pub fn select(&self, da_code: u16, hw_version: u16, sw_version: u16) -> Result<&Entry<'a>> {
        self.entries
            .iter()
            .filter(|e| {
                e.hw_code() == da_code
                    && e.hw_version() <= hw_version
                    && e.sw_version() <= sw_version
            })
            .max_by_key(|e| (e.hw_version(), e.sw_version()))
            .ok_or(Error::NoMatchingEntry { hw_code: da_code, hw_version, sw_version })
    }
}

#[derive(Debug, Getters, CopyGetters)]
pub struct Entry<'a> {
    /// SoC hwcode (the catalog key, not necessarily the BROM hw code)
    #[getset(get_copy = "pub")]
    hw_code: u16,

    /// SoC hw subcode
    #[getset(get_copy = "pub")]
    hw_subcode: u16,

    /// SoC hw version
    #[getset(get_copy = "pub")]
    hw_version: u16,

    /// SoC sw version
    #[getset(get_copy = "pub")]
    sw_version: u16,

    /// Flash page size the staged DA assumes
    #[getset(get_copy = "pub")]
    page_size: u16,

    /// Regions
    #[getset(get = "pub")]
    regions: Vec<Region<'a>>,
}

impl<'a> HLParser<'a, ll::Entry> for Entry<'a> {
    fn parse(data: &'a [u8], position: usize, ll: ll::Entry) -> Result<Self> {
        ll.validate()?;
        Ok(Self {
            hw_code: ll.hw_code,
            hw_subcode: ll.hw_subcode,
            hw_version: ll.hw_version,
            sw_version: ll.sw_version,
            page_size: ll.page_size,
            regions: (0..ll.region_count as usize)
                .map(|i| {
                    let off = position + (i * size_of::<ll::LoadRegion>());
                    let end = off + size_of::<ll::LoadRegion>();
                    if end > data.len() {
                        return Err(Error::RegionOutOfBounds { start: off, end, len: data.len() });
                    }
                    let ll = ll::LoadRegion::parse(&data[off..])?;
                    Region::parse(data, 0, ll)
                })
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

impl Display for Entry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "HW code: {:#06X}", self.hw_code)?;
        writeln!(f, "HW subcode: {:#06X}", self.hw_subcode)?;
        writeln!(f, "HW version: {:#06X}", self.hw_version)?;
        writeln!(f, "SW version: {:#06X}", self.sw_version)?;
        writeln!(f, "Page size: {:#x}", self.page_size)?;
        writeln!(f, "Regions:")?;
        for (i, region) in self.regions.iter().enumerate() {
            match i {
                0 => writeln!(f, "\tHeader")?,
                1 => writeln!(f, "\tDA1")?,
                2 => writeln!(f, "\tDA2")?,
                _ => (),
            }
            for line in format!("{region}").lines() {
                writeln!(f, "\t{line}")?;
            }
            if i != self.regions.len() - 1 {
                writeln!(f)?;
            }
        }

        Ok(())
    }
}

impl<'a> Entry<'a> {
    /// Stage-1 DA region
    #[must_use]
    pub fn da1(&self) -> Option<&Region<'a>> {
        self.regions.get(1)
    }

    /// Stage-2 DA region
    #[must_use]
    pub fn da2(&self) -> Option<&Region<'a>> {
        self.regions.get(2)
    }
}

#[derive(Debug, CopyGetters)]
pub struct Region<'a> {
    /// Region data
    data: Cow<'a, [u8]>,

    /// Signature size
    #[getset(get_copy = "pub")]
    signature_len: u32,

    /// Code base address
    #[getset(get_copy = "pub")]
    base: u32,
}

impl<'a> HLParser<'a, ll::LoadRegion> for Region<'a> {
    fn parse(data: &'a [u8], _position: usize, ll: ll::LoadRegion) -> Result<Self> {
        ll.validate()?;
        let start = ll.buf_offset as usize;
        let end = start + ll.length as usize;
        if end > data.len() {
            return Err(Error::RegionOutOfBounds { start, end, len: data.len() });
        }

        Ok(Self {
            data: Cow::Borrowed(&data[start..end]),
            signature_len: ll.sig_len,
            base: ll.start_addr,
        })
    }
}

impl Display for Region<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Code: {} bytes",
            self.data.len() - self.signature_len as usize
        )?;
        writeln!(f, "Signature: {} bytes", self.signature_len)?;
        write!(f, "Base address: {:#X}", self.base)
    }
}

impl Region<'_> {
    /// Executable code
    pub fn code(&self) -> &[u8] {
        let len = self.data.len();
        &self.data[..len - self.signature_len as usize]
    }

    /// Signature
    pub fn signature(&self) -> &[u8] {
        &self.data[self.data.len() - self.signature_len as usize..]
    }

    /// Data, signature included
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use crate::{err::Error, parse_da};

    fn push_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Builds a syntactically valid catalog with the given
    /// (hw_code, hw_version, sw_version) triples, three regions each.
    fn catalog(entries: &[(u16, u16, u16)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"MTK_DOWNLOAD_AGENT");
        buf.extend_from_slice(&[0u8; 14]);
        let mut build_id = [0u8; 64];
        build_id[..12].copy_from_slice(b"MTK_AllInOne");
        buf.extend_from_slice(&build_id);
        push_u32(&mut buf, 0x4);
        push_u32(&mut buf, 0x22668899);
        push_u32(&mut buf, entries.len() as u32);
        assert_eq!(buf.len(), 0x6C);

        let data_base = 0x6C + entries.len() * 0xDC;
        for (i, &(hw_code, hw_version, sw_version)) in entries.iter().enumerate() {
            let mut entry = Vec::new();
            push_u16(&mut entry, 0xDADA);
            push_u16(&mut entry, hw_code);
            push_u16(&mut entry, 0x8A00);
            push_u16(&mut entry, hw_version);
            push_u16(&mut entry, sw_version);
            push_u16(&mut entry, 0);
            push_u16(&mut entry, 0x200);
            push_u16(&mut entry, 0);
            push_u16(&mut entry, 0);
            push_u16(&mut entry, 3);
            for region in 0..3u32 {
                push_u32(&mut entry, (data_base + i * 0x900 + region as usize * 0x300) as u32);
                push_u32(&mut entry, 0x300);
                push_u32(&mut entry, 0x200000 + region * 0x40000);
                push_u32(&mut entry, 0);
                push_u32(&mut entry, 0x100);
            }
            entry.resize(0xDC, 0);
            buf.extend_from_slice(&entry);
        }
        buf.resize(data_base + entries.len() * 0x900, 0xAA);
        buf
    }

    #[test]
    fn parses_entries_and_regions() {
        let blob = catalog(&[(0x766, 0x8A00, 0x0)]);
        let da = parse_da(&blob).unwrap();
        assert_eq!(da.build_id(), "MTK_AllInOne");
        assert_eq!(da.entries().len(), 1);
        let entry = &da.entries()[0];
        assert_eq!(entry.hw_code(), 0x766);
        assert_eq!(entry.page_size(), 0x200);
        assert_eq!(entry.regions().len(), 3);
        let da1 = entry.da1().unwrap();
        assert_eq!(da1.data().len(), 0x300);
        assert_eq!(da1.code().len(), 0x200);
        assert_eq!(da1.signature().len(), 0x100);
        assert_eq!(da1.base(), 0x240000);
    }

    #[test]
    fn selection_prefers_highest_matching_versions() {
        let blob = catalog(&[(0x766, 0x8A00, 0x0), (0x766, 0xCA01, 0x1)]);
        let da = parse_da(&blob).unwrap();
        let picked = da.select(0x766, 0xCA01, 0x1).unwrap();
        assert_eq!(picked.hw_version(), 0xCA01);
    }

    #[test]
    fn selection_skips_too_new_entries() {
        let blob = catalog(&[(0x766, 0x8A00, 0x0), (0x766, 0xCA01, 0x1)]);
        let da = parse_da(&blob).unwrap();
        let picked = da.select(0x766, 0xCA01, 0x0).unwrap();
        assert_eq!(picked.hw_version(), 0x8A00);
    }

    #[test]
    fn selection_fails_on_unknown_hw_code() {
        let blob = catalog(&[(0x766, 0x8A00, 0x0)]);
        let da = parse_da(&blob).unwrap();
        let err = da.select(0x999, 0xCA01, 0x1).unwrap_err();
        assert!(matches!(err, Error::NoMatchingEntry { hw_code: 0x999, .. }));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut blob = catalog(&[(0x766, 0x8A00, 0x0)]);
        blob[0] = b'X';
        assert!(matches!(parse_da(&blob), Err(Error::InvalidHeaderMagic(_))));
    }
}
