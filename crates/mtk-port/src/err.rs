use thiserror::Error as TError;

#[derive(Debug, TError)]
pub enum Error {
    /// `rusb` crate error
    #[error("usb error: {0}")]
    Usb(#[from] rusb::Error),

    /// No device matching the VID/PID filter is attached
    #[error("no MTK device in service mode found (vid {0:#06x}, pid {1:#06x})")]
    DeviceNotFound(u16, u16),

    /// The matched device exposes no CDC data interface
    #[error("device has no CDC data interface with a bulk endpoint pair")]
    NoCdcInterface,

    /// The device stopped answering mid-read
    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    /// The device returned different bytes than were written
    #[error("echo mismatch: sent {sent:02x?}, got {got:02x?}")]
    EchoMismatch { sent: Vec<u8>, got: Vec<u8> },

    /// A previous framing failure marked this port unusable
    #[error("protocol desync - reconnect device")]
    Poisoned,

    /// Handshake retry budget exhausted
    #[error("no MTK device answered the handshake")]
    HandshakeFailed,
}
