//! Scripted in-memory port for protocol tests.
//!
//! A script is an ordered list of expected writes (`Io::Out`) and canned
//! replies (`Io::In`). The mock asserts every byte the code under test writes
//! and serves replies exactly in order, so a test failure points at the first
//! diverging byte of the exchange.

use std::collections::VecDeque;

use crate::err::Error;
use crate::{LineControl, ProtocolPort, Result, SimpleRead, SimpleWrite, UsbControl};

#[derive(Debug, Clone)]
pub enum Io {
    /// Bytes the code under test is expected to write next.
    Out(Vec<u8>),
    /// Bytes the device answers with.
    In(Vec<u8>),
}

#[derive(Default, Debug)]
pub struct ScriptPort {
    script: VecDeque<Io>,
    pending_out: VecDeque<u8>,
    pending_in: VecDeque<u8>,
    poisoned: bool,
    pub breaks_sent: u32,
    pub line_codings: Vec<u32>,
    pub ctrl_transfers: Vec<(u8, u8, u16, u16)>,
    /// When set, control transfers answer with a pipe stall.
    pub ctrl_stalls: bool,
}

impl ScriptPort {
    pub fn new(script: impl IntoIterator<Item = Io>) -> Self {
        ScriptPort { script: script.into_iter().collect(), ..Default::default() }
    }

    /// True once every scripted byte has been exchanged.
    pub fn done(&self) -> bool {
        self.script.is_empty() && self.pending_out.is_empty() && self.pending_in.is_empty()
    }

    fn refill_in(&mut self) -> bool {
        while self.pending_in.is_empty() {
            match self.script.front() {
                Some(Io::In(_)) => {
                    let Some(Io::In(data)) = self.script.pop_front() else { unreachable!() };
                    self.pending_in.extend(data);
                }
                _ => return false,
            }
        }
        true
    }
}

impl SimpleWrite for ScriptPort {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.poisoned {
            return Err(Error::Poisoned);
        }
        for &byte in buf {
            if self.pending_out.is_empty() {
                match self.script.pop_front() {
                    Some(Io::Out(data)) => self.pending_out.extend(data),
                    other => panic!("unexpected write of {byte:#04x}, script head: {other:?}"),
                }
            }
            let expected = self.pending_out.pop_front().expect("script exhausted");
            assert_eq!(byte, expected, "wrote {byte:#04x}, script expected {expected:#04x}");
        }
        Ok(())
    }
}

impl SimpleRead for ScriptPort {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.poisoned {
            return Err(Error::Poisoned);
        }
        assert!(
            self.pending_out.is_empty(),
            "read before the expected write completed ({} bytes left)",
            self.pending_out.len()
        );
        for (i, slot) in buf.iter_mut().enumerate() {
            if !self.refill_in() {
                return Err(Error::ShortRead { wanted: buf.len(), got: i });
            }
            *slot = self.pending_in.pop_front().expect("refill_in lied");
        }
        Ok(())
    }
}

impl ProtocolPort for ScriptPort {
    fn read_avail(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.poisoned {
            return Err(Error::Poisoned);
        }
        if !self.refill_in() {
            return Ok(0);
        }
        let mut got = 0;
        while got < buf.len() {
            match self.pending_in.pop_front() {
                Some(b) => {
                    buf[got] = b;
                    got += 1;
                }
                None => break,
            }
        }
        Ok(got)
    }

    fn poison(&mut self) {
        self.poisoned = true;
    }
}

impl UsbControl for ScriptPort {
    fn ctrl_in(&mut self, request_type: u8, request: u8, value: u16, index: u16) -> Result<usize> {
        self.ctrl_transfers.push((request_type, request, value, index));
        if self.ctrl_stalls {
            Err(Error::Usb(rusb::Error::Pipe))
        } else {
            Ok(0)
        }
    }
}

impl LineControl for ScriptPort {
    fn set_break(&mut self) -> Result<()> {
        self.breaks_sent += 1;
        Ok(())
    }

    fn set_line_coding(&mut self, baud: u32) -> Result<()> {
        self.line_codings.push(baud);
        Ok(())
    }
}
