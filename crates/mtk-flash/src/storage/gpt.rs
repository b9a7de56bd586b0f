//! Minimal GUID partition table reader, little-endian throughout.

use crate::Result;
use crate::da::PartitionKind;
use crate::err::Error;
use crate::storage::Partition;

const SIGNATURE: &[u8; 8] = b"EFI PART";
const DEFAULT_ENTRY_SIZE: u32 = 128;

/// CLI-overridable table geometry; zero means "take it from the header".
#[derive(Debug, Clone, Copy, Default)]
pub struct GptOptions {
    pub num_part_entries: u32,
    pub part_entry_size: u32,
    pub part_entry_start_lba: u64,
}

#[derive(Debug)]
pub(crate) struct GptHeader {
    pub first_usable_lba: u64,
    pub entry_start_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
}

fn u32_at(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

fn u64_at(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

/// Parse the header sector (LBA 1).
pub(crate) fn parse_header(block: &[u8]) -> Result<GptHeader> {
    if block.len() < 92 || &block[..8] != SIGNATURE {
        return Err(Error::NoPartitionTable);
    }

    Ok(GptHeader {
        first_usable_lba: u64_at(block, 40),
        entry_start_lba: u64_at(block, 72),
        entry_count: u32_at(block, 80),
        entry_size: u32_at(block, 84),
    })
}

/// Parse the entry array out of the first `first_usable_lba` sectors.
pub(crate) fn parse_entries(
    data: &[u8],
    header: &GptHeader,
    opts: &GptOptions,
    sector_size: u32,
) -> Result<Vec<Partition>> {
    let entry_size = match opts.part_entry_size {
        0 if header.entry_size != 0 => header.entry_size,
        0 => DEFAULT_ENTRY_SIZE,
        n => n,
    } as usize;
    let entry_count = match opts.num_part_entries {
        0 => header.entry_count,
        n => n,
    } as usize;
    let start_lba = match opts.part_entry_start_lba {
        0 => header.entry_start_lba,
        n => n,
    };

    let mut partitions = Vec::new();
    let base = (start_lba * u64::from(sector_size)) as usize;
    for i in 0..entry_count {
        let off = base + i * entry_size;
        if off + entry_size > data.len() {
            break;
        }
        let entry = &data[off..off + entry_size];
        let type_guid: [u8; 16] = entry[..16].try_into().unwrap();
        if type_guid == [0u8; 16] {
            continue;
        }
        let unique_guid: [u8; 16] = entry[16..32].try_into().unwrap();
        let first_lba = u64_at(entry, 32);
        let last_lba = u64_at(entry, 40);
        let flags = u64_at(entry, 48);
        let name = utf16le_name(&entry[56..entry_size.min(56 + 72)]);

        partitions.push(Partition {
            name,
            start_lba: first_lba,
            sector_count: last_lba - first_lba + 1,
            flags,
            type_guid,
            unique_guid,
            kind: PartitionKind::User,
        });
    }
    Ok(partitions)
}

fn utf16le_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// One header sector plus an entry table describing `parts`
/// (name, first_lba, last_lba). Test fixture shared by the storage tests.
#[cfg(test)]
pub(crate) fn synthetic_gpt(sector_size: usize, parts: &[(&str, u64, u64)]) -> Vec<u8> {
    let entry_lba = 2u64;
    let first_usable = 0x22u64;
    let mut disk = vec![0u8; first_usable as usize * sector_size];

    // Protective MBR stays zeroed; header at LBA 1.
    let hdr = sector_size;
    disk[hdr..hdr + 8].copy_from_slice(SIGNATURE);
    disk[hdr + 40..hdr + 48].copy_from_slice(&first_usable.to_le_bytes());
    disk[hdr + 72..hdr + 80].copy_from_slice(&entry_lba.to_le_bytes());
    disk[hdr + 80..hdr + 84].copy_from_slice(&(parts.len() as u32).to_le_bytes());
    disk[hdr + 84..hdr + 88].copy_from_slice(&128u32.to_le_bytes());

    for (i, (name, first, last)) in parts.iter().enumerate() {
        let off = entry_lba as usize * sector_size + i * 128;
        disk[off] = 0x44; // non-zero type guid
        disk[off + 16] = i as u8 + 1;
        disk[off + 32..off + 40].copy_from_slice(&first.to_le_bytes());
        disk[off + 40..off + 48].copy_from_slice(&last.to_le_bytes());
        for (j, unit) in name.encode_utf16().enumerate() {
            let p = off + 56 + j * 2;
            disk[p..p + 2].copy_from_slice(&unit.to_le_bytes());
        }
    }
    disk
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_entries_round_trip() {
        let disk = synthetic_gpt(0x200, &[("boot_a", 0x8000, 0x27FFF), ("cache", 0x40000, 0x4FFFF)]);
        let header = parse_header(&disk[0x200..0x400]).unwrap();
        assert_eq!(header.first_usable_lba, 0x22);

        let parts = parse_entries(&disk, &header, &GptOptions::default(), 0x200).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "boot_a");
        assert_eq!(parts[0].start_lba, 0x8000);
        assert_eq!(parts[0].sector_count, 0x20000);
        assert_eq!(parts[1].name, "cache");
        assert_eq!(parts[1].start_lba, 0x40000);
    }

    #[test]
    fn missing_signature_is_no_table() {
        let block = vec![0u8; 0x200];
        assert!(matches!(parse_header(&block), Err(Error::NoPartitionTable)));
    }
}
