//! USB-CDC transport for MediaTek devices stopped in BROM / preloader / DA
//! service modes.
//!
//! The device enumerates as a CDC-ACM pair; all protocol traffic goes over
//! the bulk data endpoints, strictly request/response. Any echo mismatch is a
//! fatal desync: the port is poisoned and every later access fails until the
//! device is reconnected.

use std::time::Duration;

use rusb::{Context, DeviceHandle, Direction, TransferType, UsbContext};

use crate::err::Error;

pub mod err;
mod handshake;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use handshake::{HANDSHAKE, handshake};

pub type Result<T> = core::result::Result<T, Error>;

pub const MTK_VID: u16 = 0x0E8D;
pub const MTK_BROM_PID: u16 = 0x0003;
pub const MTK_PRELOADER_PID: u16 = 0x2000;

const CDC_DATA_CLASS: u8 = 10;
const READ_CHUNK: usize = 64;
const CHUNK_TIMEOUT: Duration = Duration::from_millis(100);

pub trait FromBytes<const N: usize> {
    fn from_be(bytes: [u8; N]) -> Self;
    fn from_le(bytes: [u8; N]) -> Self;
}

pub trait ToBytes<const N: usize> {
    fn to_be(&self) -> [u8; N];
    fn to_le(&self) -> [u8; N];
}

macro_rules! impl_bytes {
    ($ty:ty, $n:literal) => {
        impl FromBytes<$n> for $ty {
            fn from_be(bytes: [u8; $n]) -> Self {
                Self::from_be_bytes(bytes)
            }

            fn from_le(bytes: [u8; $n]) -> Self {
                Self::from_le_bytes(bytes)
            }
        }

        impl ToBytes<$n> for $ty {
            fn to_be(&self) -> [u8; $n] {
                self.to_be_bytes()
            }

            fn to_le(&self) -> [u8; $n] {
                self.to_le_bytes()
            }
        }
    };
}

impl_bytes!(u8, 1);
impl_bytes!(u16, 2);
impl_bytes!(u32, 4);
impl_bytes!(u64, 8);

pub trait SimpleRead {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    fn simple_read_be<T: FromBytes<N>, const N: usize>(&mut self) -> Result<T> {
        let mut bytes = [0; N];
        self.read_exact(&mut bytes)?;
        Ok(T::from_be(bytes))
    }

    fn simple_read_le<T: FromBytes<N>, const N: usize>(&mut self) -> Result<T> {
        let mut bytes = [0; N];
        self.read_exact(&mut bytes)?;
        Ok(T::from_le(bytes))
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.simple_read_be()
    }

    fn read_u16_be(&mut self) -> Result<u16> {
        self.simple_read_be()
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        self.simple_read_be()
    }

    fn read_u64_be(&mut self) -> Result<u64> {
        self.simple_read_be()
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        self.simple_read_le()
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        self.simple_read_le()
    }
}

pub trait SimpleWrite {
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    fn simple_write_be<T: ToBytes<N>, const N: usize>(&mut self, value: T) -> Result<()> {
        Self::write_all(self, &value.to_be())
    }

    fn simple_write_le<T: ToBytes<N>, const N: usize>(&mut self, value: T) -> Result<()> {
        Self::write_all(self, &value.to_le())
    }

    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.simple_write_be(value)
    }

    fn write_u16_be(&mut self, value: u16) -> Result<()> {
        self.simple_write_be(value)
    }

    fn write_u32_be(&mut self, value: u32) -> Result<()> {
        self.simple_write_be(value)
    }

    fn write_u64_be(&mut self, value: u64) -> Result<()> {
        self.simple_write_be(value)
    }

    fn write_u16_le(&mut self, value: u16) -> Result<()> {
        self.simple_write_le(value)
    }

    fn write_u32_le(&mut self, value: u32) -> Result<()> {
        self.simple_write_le(value)
    }
}

/// Full protocol-facing port surface: exact reads/writes plus the pieces the
/// command layers need for desync handling and end-of-message detection.
pub trait ProtocolPort: SimpleRead + SimpleWrite {
    /// Single-chunk read that may legitimately return zero bytes on timeout.
    fn read_avail(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Mark the port unusable. Every later read or write fails with
    /// [`Error::Poisoned`] until the device is physically reconnected.
    fn poison(&mut self);

    /// Read up to `n` bytes in `chunk`-sized transfers; four consecutive
    /// empty reads end the call early. Callers treat a short result as
    /// end-of-message or as an error, whichever their framing says.
    fn read_chunked(&mut self, n: usize, chunk: usize) -> Result<Vec<u8>> {
        let chunk = chunk.max(1);
        let mut out = Vec::with_capacity(n);
        let mut empties = 0;
        let mut buf = vec![0u8; chunk];
        while out.len() < n {
            let want = (n - out.len()).min(chunk);
            match self.read_avail(&mut buf[..want])? {
                0 => {
                    if empties == 4 {
                        break;
                    }
                    empties += 1;
                }
                got => {
                    empties = 0;
                    out.extend_from_slice(&buf[..got]);
                }
            }
        }
        Ok(out)
    }

    /// Write `data` and verify the device echoes it back byte for byte.
    /// A mismatch poisons the port.
    fn echo(&mut self, data: &[u8]) -> Result<()> {
        self.write_all(data)?;
        let mut got = vec![0u8; data.len()];
        self.read_exact(&mut got)?;
        if got != data {
            self.poison();
            return Err(Error::EchoMismatch { sent: data.to_vec(), got });
        }
        Ok(())
    }
}

/// CDC line-control operations used by the handshake and the exploit.
pub trait LineControl {
    fn set_break(&mut self) -> Result<()>;
    fn set_line_coding(&mut self, baud: u32) -> Result<()>;
}

/// Raw control transfers on the default pipe. The exploit pokes a vulnerable
/// BROM handler through these.
pub trait UsbControl {
    fn ctrl_in(&mut self, request_type: u8, request: u8, value: u16, index: u16) -> Result<usize>;
}

/// Bulk endpoint pair of the CDC data interface of one attached device.
pub struct CdcPort {
    handle: DeviceHandle<Context>,
    ep_in: u8,
    ep_out: u8,
    data_iface: u8,
    pub vid: u16,
    pub pid: u16,
    poisoned: bool,
}

impl CdcPort {
    /// Scan the bus for `vid:pid` and open the first match.
    pub fn find(vid: u16, pid: u16) -> Result<Option<CdcPort>> {
        let ctx = Context::new()?;
        for device in ctx.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if desc.vendor_id() != vid || desc.product_id() != pid {
                continue;
            }
            return Self::setup(device.open()?, vid, pid).map(Some);
        }
        Ok(None)
    }

    fn setup(mut handle: DeviceHandle<Context>, vid: u16, pid: u16) -> Result<CdcPort> {
        let device = handle.device();
        let config = device.active_config_descriptor()?;

        let mut found = None;
        for iface in config.interfaces() {
            for desc in iface.descriptors() {
                if desc.class_code() != CDC_DATA_CLASS {
                    continue;
                }
                let mut ep_in = None;
                let mut ep_out = None;
                for ep in desc.endpoint_descriptors() {
                    if ep.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match ep.direction() {
                        Direction::In => ep_in = Some(ep.address()),
                        Direction::Out => ep_out = Some(ep.address()),
                    }
                }
                if let (Some(ep_in), Some(ep_out)) = (ep_in, ep_out) {
                    found = Some((iface.number(), ep_in, ep_out));
                }
            }
        }

        let (data_iface, ep_in, ep_out) = found.ok_or(Error::NoCdcInterface)?;

        handle.set_auto_detach_kernel_driver(true).ok();
        // Interface 0 carries the CDC control requests, the data interface
        // carries the bulk pair. Both must be claimed.
        handle.claim_interface(0)?;
        if data_iface != 0 {
            handle.claim_interface(data_iface)?;
        }

        log::debug!("claimed CDC data interface {data_iface}, ep_in {ep_in:#04x}, ep_out {ep_out:#04x}");

        Ok(CdcPort { handle, ep_in, ep_out, data_iface, vid, pid, poisoned: false })
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned { Err(Error::Poisoned) } else { Ok(()) }
    }

    /// Best-effort bulk write. Returns the number of bytes the device
    /// accepted.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.check_poisoned()?;
        if data.is_empty() {
            // Zero-length packet, terminates a max-packet-aligned transfer.
            self.handle.write_bulk(self.ep_out, data, CHUNK_TIMEOUT)?;
            return Ok(0);
        }
        let mut written = 0;
        while written < data.len() {
            written += self.handle.write_bulk(self.ep_out, &data[written..], CHUNK_TIMEOUT)?;
        }
        Ok(written)
    }

    /// Read up to `n` bytes in `chunk`-sized bulk transfers. Four consecutive
    /// empty reads end the call early; the caller decides whether a short
    /// result is an error.
    pub fn read(&mut self, n: usize, chunk: usize) -> Result<Vec<u8>> {
        self.check_poisoned()?;
        let mut out = Vec::with_capacity(n);
        let mut empties = 0;
        let mut buf = vec![0u8; chunk.max(1)];
        while out.len() < n {
            let want = (n - out.len()).min(chunk.max(1));
            match self.handle.read_bulk(self.ep_in, &mut buf[..want], CHUNK_TIMEOUT) {
                Ok(0) | Err(rusb::Error::Timeout) => {
                    if empties == 4 {
                        break;
                    }
                    empties += 1;
                }
                Ok(got) => {
                    empties = 0;
                    out.extend_from_slice(&buf[..got]);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    pub fn close(self) {
        // Interfaces are released when the handle drops.
        drop(self);
    }
}

impl SimpleRead for CdcPort {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let data = self.read(buf.len(), READ_CHUNK)?;
        if data.len() != buf.len() {
            return Err(Error::ShortRead { wanted: buf.len(), got: data.len() });
        }
        buf.copy_from_slice(&data);
        Ok(())
    }
}

impl SimpleWrite for CdcPort {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.write(buf).map(|_| ())
    }
}

impl ProtocolPort for CdcPort {
    fn read_avail(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_poisoned()?;
        match self.handle.read_bulk(self.ep_in, buf, CHUNK_TIMEOUT) {
            Ok(got) => Ok(got),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn poison(&mut self) {
        log::warn!("port poisoned, a reconnect is required");
        self.poisoned = true;
    }
}

impl UsbControl for CdcPort {
    /// The expected pipe stall surfaces as `Err(Usb(Pipe))`; the caller
    /// decides whether that is fatal.
    fn ctrl_in(&mut self, request_type: u8, request: u8, value: u16, index: u16) -> Result<usize> {
        let mut buf = [0u8; 0];
        Ok(self.handle.read_control(request_type, request, value, index, &mut buf, CHUNK_TIMEOUT)?)
    }
}

const CDC_REQ_SET_LINE_CODING: u8 = 0x20;
const CDC_REQ_SEND_BREAK: u8 = 0x23;
const CDC_HOST_TO_IFACE: u8 = 0x21;

impl LineControl for CdcPort {
    fn set_break(&mut self) -> Result<()> {
        self.handle.write_control(
            CDC_HOST_TO_IFACE,
            CDC_REQ_SEND_BREAK,
            0,
            u16::from(self.data_iface),
            &[],
            CHUNK_TIMEOUT,
        )?;
        Ok(())
    }

    fn set_line_coding(&mut self, baud: u32) -> Result<()> {
        // dwDTERate, 1 stop bit, no parity, 8 data bits.
        let mut coding = [0u8; 7];
        coding[..4].copy_from_slice(&baud.to_le_bytes());
        coding[6] = 8;
        self.handle.write_control(
            CDC_HOST_TO_IFACE,
            CDC_REQ_SET_LINE_CODING,
            0,
            0,
            &coding,
            CHUNK_TIMEOUT,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Io, ScriptPort};

    #[test]
    fn byte_order_helpers() {
        // fully qualified, the std integer methods of the same name win
        // plain method syntax
        assert_eq!(<u16 as ToBytes<2>>::to_be(&0x1234), [0x12, 0x34]);
        assert_eq!(<u16 as ToBytes<2>>::to_le(&0x1234), [0x34, 0x12]);
        assert_eq!(<u32 as FromBytes<4>>::from_be([0xDE, 0xAD, 0xBE, 0xEF]), 0xDEADBEEF);
        assert_eq!(<u64 as FromBytes<8>>::from_le([1, 0, 0, 0, 0, 0, 0, 0]), 1);
    }

    #[test]
    fn echo_roundtrip() {
        let mut port = ScriptPort::new([Io::Out(vec![0xD1]), Io::In(vec![0xD1])]);
        port.echo(&[0xD1]).unwrap();
        assert!(port.done());
    }

    #[test]
    fn echo_mismatch_poisons() {
        let mut port = ScriptPort::new([Io::Out(vec![0xD1]), Io::In(vec![0xD2])]);
        let err = port.echo(&[0xD1]).unwrap_err();
        assert!(matches!(err, Error::EchoMismatch { .. }));
        // Every later access must fail, not silently proceed.
        let mut buf = [0u8; 1];
        assert!(matches!(port.read_exact(&mut buf), Err(Error::Poisoned)));
        assert!(matches!(port.write_all(&[0]), Err(Error::Poisoned)));
    }
}
