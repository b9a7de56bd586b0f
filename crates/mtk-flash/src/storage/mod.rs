//! Partition-granularity view of the attached flash.
//!
//! Tables are re-read from the device for every partition operation; nothing
//! here is cached across sessions.

use std::fmt::Display;

use crate::da::PartitionKind;

pub mod gpt;
pub mod partition;
pub mod pmt;

pub use gpt::GptOptions;
pub use partition::{detect_partition, read_gpt};

/// One partition, immutable after parsing.
#[derive(Debug, Clone)]
pub struct Partition {
    pub name: String,
    pub start_lba: u64,
    pub sector_count: u64,
    pub flags: u64,
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub kind: PartitionKind,
}

impl Partition {
    pub fn byte_offset(&self, sector_size: u32) -> u64 {
        self.start_lba * u64::from(sector_size)
    }

    pub fn byte_len(&self, sector_size: u32) -> u64 {
        self.sector_count * u64::from(sector_size)
    }
}

/// The table as read right now, plus the geometry it was read with.
#[derive(Debug, Clone)]
pub struct GptTable {
    pub partitions: Vec<Partition>,
    pub sector_size: u32,
    pub total_size: u64,
}

impl GptTable {
    pub fn from_pmt(partitions: Vec<Partition>, sector_size: u32, total_size: u64) -> Self {
        GptTable { partitions, sector_size, total_size }
    }
}

impl Display for GptTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "GPT Table:\n-------------")?;
        for p in &self.partitions {
            writeln!(
                f,
                "{:20} Offset 0x{:016x}, Length 0x{:016x}, Flags 0x{:08x}, UUID {}, Type {}",
                format!("{}:", p.name),
                p.byte_offset(self.sector_size),
                p.byte_len(self.sector_size),
                p.flags,
                hex::encode(p.unique_guid),
                hex::encode(p.type_guid),
            )?;
        }
        write!(f, "\nTotal disk size:0x{:016x}", self.total_size)
    }
}
