use thiserror::Error as TError;

#[derive(Debug, TError)]
pub enum Error {
    #[error("Invalid magic: {0:?}, expected MTK_DOWNLOAD_AGENT")]
    InvalidHeaderMagic([u8; 18]),
    #[error("Invalid heuristics")]
    InvalidHeaderHeuristics,
    #[error("Invalid type: {0:#x}, expected 0x22668899")]
    InvalidHeaderType(u32),

    #[error("Invalid magic: {0:#x}, expected 0xDADA")]
    InvalidEntryMagic(u16),
    #[error("Invalid DA region count")]
    InvalidRegionCount,

    #[error("Invalid region start: {0:#x}, expected >= 0x100")]
    InvalidRegionStart(u32),
    #[error("Invalid region size: {0:#x}, expected >= 0x100")]
    InvalidRegionSize(u32),
    #[error("Region [{start:#x}..{end:#x}] exceeds the file size {len:#x}")]
    RegionOutOfBounds { start: usize, end: usize, len: usize },

    #[error(
        "No DA for hw code {hw_code:#06x} (hw version {hw_version:#x}, sw version {sw_version:#x}) in the catalog"
    )]
    NoMatchingEntry { hw_code: u16, hw_version: u16, sw_version: u16 },

    #[error("Bincode decode error: {0}")]
    Bincode(#[from] bincode::error::DecodeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
