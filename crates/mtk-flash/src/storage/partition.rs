//! Table discovery and name lookup on top of a running DA session.

use log::info;

use crate::Result;
use crate::da::{DaSession, PartitionKind};
use crate::err::Error;
use crate::progress::Silent;
use crate::storage::gpt::{self, GptOptions};
use crate::storage::{GptTable, Partition};

/// Read the partition table fresh off the device: the first two pages decide
/// between the legacy PMT (old flashes announce themselves with `EMMC_BOOT`)
/// and a standard GPT, whose full entry table is then re-read.
pub fn read_gpt<S: DaSession>(da: &mut S, opts: &GptOptions) -> Result<GptTable> {
    let sector_size = da.page_size();
    let page = u64::from(sector_size);

    let mut head = Vec::new();
    da.read_flash(PartitionKind::User, 0, 2 * page, &mut head, &mut Silent)?;

    if head.starts_with(b"EMMC_BOOT") {
        info!("Legacy flash header found, trying PMT");
        if let Some(partitions) = da.read_pmt(sector_size)? {
            return Ok(GptTable::from_pmt(partitions, sector_size, da.flash_size()));
        }
        return Err(Error::NoPartitionTable);
    }

    let header = gpt::parse_header(&head[sector_size as usize..])?;
    if header.first_usable_lba == 0 {
        return Err(Error::NoPartitionTable);
    }

    let mut table = Vec::new();
    da.read_flash(
        PartitionKind::User,
        0,
        header.first_usable_lba * page,
        &mut table,
        &mut Silent,
    )?;

    let partitions = gpt::parse_entries(&table, &header, opts, sector_size)?;
    Ok(GptTable { partitions, sector_size, total_size: da.flash_size() })
}

/// First case-insensitive name match. A miss is recoverable: the error
/// carries everything the disk actually has.
pub fn detect_partition<'t>(table: &'t GptTable, name: &str) -> Result<&'t Partition> {
    table
        .partitions
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::PartitionNotFound {
            name: name.to_string(),
            available: table.partitions.iter().map(|p| p.name.clone()).collect(),
        })
}
