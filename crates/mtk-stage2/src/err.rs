use thiserror::Error as TError;

#[derive(Debug, TError)]
pub enum Error {
    /// The payload did not announce itself with the readiness word
    #[error("stage2 payload is not running (read {0:#010x}, expected 0xb1b2b3b4)")]
    NotReady(u32),

    /// A mutation did not come back with the terminating status
    #[error("stage2 command failed, terminating status {0:#010x}")]
    BadStatus(u32),

    /// Transport error
    #[error("port error: {0}")]
    Port(#[from] mtk_port::err::Error),
}
