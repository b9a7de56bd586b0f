//! Legacy MediaTek partition map, served by old DAs instead of a GPT.
//!
//! Three wire variants exist; which one a device speaks is keyed off the
//! value at offset 0x48 of the first record. The sentinel was found
//! empirically, so the surrounding bytes are logged before parsing.

use log::debug;

use crate::Result;
use crate::da::PartitionKind;
use crate::storage::Partition;

const NAME_LEN: usize = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PmtVariant {
    /// 0x60 stride: name, size u64, flags u64, offset u64
    Wide,
    /// 0x58 stride: name, size u64, offset u64, flags u64
    Packed64,
    /// 0x4C stride: name, size u32, offset u32, flags u32
    Packed32,
}

pub(crate) fn select_variant(data: &[u8]) -> PmtVariant {
    if data.len() <= 0x48 {
        return PmtVariant::Packed32;
    }
    if data[0x48] == 0xFF {
        return PmtVariant::Wide;
    }
    let flags = u32::from_le_bytes(data[0x48..0x4C].try_into().unwrap());
    if (1..=9).contains(&flags) {
        PmtVariant::Packed64
    } else {
        PmtVariant::Packed32
    }
}

pub(crate) fn parse_pmt(data: &[u8], page_size: u32) -> Result<Vec<Partition>> {
    let variant = select_variant(data);
    debug!(
        "PMT variant {:?}, bytes around +0x48: {}",
        variant,
        hex::encode(&data[0x40.min(data.len())..0x58.min(data.len())])
    );

    let page = u64::from(page_size.max(1));
    let mut partitions = Vec::new();
    let stride = match variant {
        PmtVariant::Wide => 0x60,
        PmtVariant::Packed64 => 0x58,
        PmtVariant::Packed32 => 0x4C,
    };

    let mut pos = 0;
    while pos + stride <= data.len() {
        let record = &data[pos..pos + stride];
        let name = trimmed_name(&record[..NAME_LEN]);
        if name.is_empty() {
            break;
        }

        let (size, offset, flags) = match variant {
            PmtVariant::Wide => (
                u64_at(record, 0x40),
                u64_at(record, 0x50),
                u64_at(record, 0x48),
            ),
            PmtVariant::Packed64 => (
                u64_at(record, 0x40),
                u64_at(record, 0x48),
                u64_at(record, 0x50),
            ),
            PmtVariant::Packed32 => (
                u64::from(u32_at(record, 0x40)),
                u64::from(u32_at(record, 0x44)),
                u64::from(u32_at(record, 0x48)),
            ),
        };

        partitions.push(Partition {
            name,
            start_lba: offset / page,
            sector_count: size / page,
            flags,
            type_guid: [0u8; 16],
            unique_guid: [0u8; 16],
            kind: PartitionKind::User,
        });
        pos += stride;
    }

    Ok(partitions)
}

fn u32_at(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

fn u64_at(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

fn trimmed_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_wide(name: &str, size: u64, flags: u64, offset: u64) -> Vec<u8> {
        let mut rec = vec![0u8; 0x60];
        rec[..name.len()].copy_from_slice(name.as_bytes());
        rec[0x40..0x48].copy_from_slice(&size.to_le_bytes());
        rec[0x48..0x50].copy_from_slice(&flags.to_le_bytes());
        rec[0x50..0x58].copy_from_slice(&offset.to_le_bytes());
        rec
    }

    fn record_packed64(name: &str, size: u64, offset: u64, flags: u64) -> Vec<u8> {
        let mut rec = vec![0u8; 0x58];
        rec[..name.len()].copy_from_slice(name.as_bytes());
        rec[0x40..0x48].copy_from_slice(&size.to_le_bytes());
        rec[0x48..0x50].copy_from_slice(&offset.to_le_bytes());
        rec[0x50..0x58].copy_from_slice(&flags.to_le_bytes());
        rec
    }

    fn record_packed32(name: &str, size: u32, offset: u32, flags: u32) -> Vec<u8> {
        let mut rec = vec![0u8; 0x4C];
        rec[..name.len()].copy_from_slice(name.as_bytes());
        rec[0x40..0x44].copy_from_slice(&size.to_le_bytes());
        rec[0x44..0x48].copy_from_slice(&offset.to_le_bytes());
        rec[0x48..0x4C].copy_from_slice(&flags.to_le_bytes());
        rec
    }

    #[test]
    fn sentinel_ff_selects_wide_layout() {
        // flags 0xFFFFFFFFFFFFFFFF puts 0xFF at offset 0x48
        let data = record_wide("preloader", 0x40000, u64::MAX, 0x0);
        assert_eq!(select_variant(&data), PmtVariant::Wide);

        let parts = parse_pmt(&data, 0x200).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name, "preloader");
        assert_eq!(parts[0].sector_count, 0x200);
    }

    #[test]
    fn small_flag_value_selects_packed64() {
        for flags in [1u64, 5, 9] {
            // in the 64-bit layout the offset field sits at +0x48
            let data = record_packed64("boot", 0x100000, flags, 0x0);
            // variant selection reads +0x48, which is the offset here; the
            // values 1..=9 are what old preloaders put there
            assert_eq!(select_variant(&data), PmtVariant::Packed64);
        }
    }

    #[test]
    fn anything_else_selects_packed32() {
        let data = record_packed32("nvram", 0x500000, 0x1400000, 0);
        assert_eq!(select_variant(&data), PmtVariant::Packed32);

        let parts = parse_pmt(&data, 0x200).unwrap();
        assert_eq!(parts[0].start_lba, 0x1400000 / 0x200);
        assert_eq!(parts[0].sector_count, 0x500000 / 0x200);
    }

    #[test]
    fn records_stop_at_empty_name() {
        let mut data = record_packed32("system", 0x1000, 0x2000, 0);
        data.extend(vec![0u8; 0x4C]);
        let parts = parse_pmt(&data, 0x200).unwrap();
        assert_eq!(parts.len(), 1);
    }
}
