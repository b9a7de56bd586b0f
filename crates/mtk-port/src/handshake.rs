use std::{thread::sleep, time::Duration};

use crate::err::Error;
use crate::{LineControl, ProtocolPort, Result};

/// Wake sequence; the chip answers each byte with its bitwise complement.
pub const HANDSHAKE: [u8; 4] = [0xA0, 0x0A, 0x50, 0x05];

/// Drive the 4-byte wake sequence that leaves the chip in command mode.
///
/// A wrong answer resets the sequence, issues a BREAK, reprograms the line
/// coding and burns one try; an empty read only resets the sequence. BROM and
/// preloader speak the identical handshake, the mode is told apart later by
/// capability probing.
pub fn handshake<P: ProtocolPort + LineControl>(
    port: &mut P,
    baud: u32,
    max_tries: u32,
) -> Result<()> {
    let mut tries = max_tries;
    let mut i = 0;

    while i < HANDSHAKE.len() {
        if tries == 0 {
            return Err(Error::HandshakeFailed);
        }

        port.write_all(&[HANDSHAKE[i]])?;

        let mut buf = [0u8; 1];
        match port.read_avail(&mut buf) {
            Ok(1) if buf[0] == !HANDSHAKE[i] => i += 1,
            Ok(0) => {
                i = 0;
                sleep(Duration::from_millis(5));
            }
            Ok(_) => {
                i = 0;
                port.set_break()?;
                port.set_line_coding(baud)?;
                tries -= 1;
            }
            Err(_) => {
                i = 0;
                sleep(Duration::from_millis(5));
            }
        }
    }

    log::info!("device detected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Io, ScriptPort};

    fn wake_exchange() -> Vec<Io> {
        HANDSHAKE.iter().flat_map(|&b| [Io::Out(vec![b]), Io::In(vec![!b])]).collect()
    }

    #[test]
    fn clean_handshake_reaches_ready() {
        let mut port = ScriptPort::new(wake_exchange());
        handshake(&mut port, 115200, 100).unwrap();
        assert!(port.done());
    }

    #[test]
    fn noise_resets_then_succeeds() {
        // One garbage answer to the first 0xA0, then the clean sequence.
        let mut script = vec![Io::Out(vec![0xA0]), Io::In(vec![0x42])];
        script.extend(wake_exchange());
        let mut port = ScriptPort::new(script);
        handshake(&mut port, 115200, 100).unwrap();
        assert!(port.done());
        assert_eq!(port.breaks_sent, 1);
        assert_eq!(port.line_codings, vec![115200]);
    }

    #[test]
    fn exhausted_tries_fail() {
        // The device keeps answering garbage.
        let mut script = Vec::new();
        for _ in 0..3 {
            script.push(Io::Out(vec![0xA0]));
            script.push(Io::In(vec![0xFF]));
        }
        let mut port = ScriptPort::new(script);
        let err = handshake(&mut port, 115200, 3).unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed));
    }
}
