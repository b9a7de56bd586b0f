use thiserror::Error as TError;

#[derive(Debug, TError)]
pub enum Error {
    /// The device returned invalid data when echoing bytes back
    #[error("Data doesn't match! Expected {0:#x}, got {1:#x} - protocol desync, reconnect device")]
    InvalidEchoData(u32, u32),
    /// A command status word did not match the expected value
    #[error("Invalid status! Expected {0}, got {1}")]
    InvalidStatus(u16, u16),
    /// A BROM/preloader command reported an error status
    #[error("Command failed with status {0:#06x}")]
    Status(u16),
    /// A DA command reported an error status
    #[error("DA command failed with status {0:#010x}")]
    DaStatus(u32),

    /// An XFlash frame did not start with the protocol magic
    #[error("Bad frame magic {0:#010x}, expected 0xfeeeeeef")]
    BadMagic(u32),
    /// An XFlash frame claims more payload than any legal message carries
    #[error("Frame length {0:#x} exceeds the protocol limit")]
    FrameTooLarge(u32),
    /// The device-computed upload checksum disagrees with ours
    #[error("Checksum of upload doesn't match! Expected {expected:#06x}, got {got:#06x}")]
    ChecksumMismatch { expected: u16, got: u16 },
    /// An expected fixed answer byte was wrong
    #[error("Unexpected answer byte {got:#04x}, expected {expected:#04x}")]
    UnexpectedByte { expected: u8, got: u8 },

    /// Target config requires authentication we cannot provide
    #[error("Authentication required by target: {0}")]
    Auth(String),

    /// The hw code has no entry in the chip parameter table
    #[error("Unknown hw code {0:#06x} - device busy or chip not supported")]
    UnknownChip(u16),

    /// Partition lookup miss; carries what the disk actually has
    #[error("Partition {name:?} not found. Available: {}", .available.join(", "))]
    PartitionNotFound { name: String, available: Vec<String> },
    /// Byte offsets must be page-aligned on the device side
    #[error("Offset {offset:#x} is not aligned to the {page_size:#x} byte page size")]
    UnalignedOffset { offset: u64, page_size: u32 },
    /// Neither a GPT nor a PMT could be read from the flash
    #[error("No partition table found on flash")]
    NoPartitionTable,

    /// The BROM rejected the exploit payload length
    #[error("Kamakiri payload of {0:#x} bytes is too large")]
    PayloadTooLarge(usize),
    /// Exploit staging or execution failed
    #[error("Exploit failed: {0}")]
    Exploit(String),

    /// Operation the current chip/dialect cannot perform
    #[error("{0} is unsupported on this chip")]
    Unsupported(&'static str),

    /// Transport or framing failure from the port layer
    #[error("Port error: {0}")]
    Port(#[from] mtk_port::err::Error),
    /// DA catalog error
    #[error("DA loader error: {0}")]
    Catalog(#[from] mtk_parser::err::Error),
    /// Stage-2 side channel error
    #[error("Stage2 error: {0}")]
    Stage2(#[from] mtk_stage2::err::Error),
    /// Wire-struct decode error
    #[error("Decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other error
    #[error("{0}")]
    Custom(#[from] Box<dyn std::error::Error>),
}
