//! Echo-verify codecs for the BROM/preloader command set.
//!
//! Every opcode and big-endian argument is written and read back before the
//! payload; a status word below 3 means success. Commands with irregular
//! framing (SEND_DA chunking, the GET_BL_VER echo trick, length-prefixed ids)
//! live as hand-written methods on [`crate::preloader::Preloader`].

use mtk_flash_macros::Protocol;

use crate::err::Error;

/// A command to read 16-bit halfwords from device memory
#[derive(Default, Protocol)]
#[protocol(command = 0xd0)]
pub(crate) struct Read16 {
    /// Start address
    #[protocol(echo)]
    addr: u32,
    /// Number of halfwords to read
    #[protocol(echo)]
    halfwords: u32,
    /// Status after the address range check
    #[protocol(rx, status_below = 3)]
    status: u16,
    /// Halfwords
    #[protocol(rx, size = halfwords)]
    pub buf: Vec<u16>,
    /// Read status
    #[protocol(rx, status_below = 3)]
    final_status: u16,
}

/// A command to read u32 words from device memory
#[derive(Default, Protocol)]
#[protocol(command = 0xd1)]
pub(crate) struct Read32 {
    /// Start address
    #[protocol(echo)]
    addr: u32,
    /// Number of u32 to read
    #[protocol(echo)]
    dwords: u32,
    /// Status after the address range check
    #[protocol(rx, status_below = 3)]
    status: u16,
    /// U32s
    #[protocol(rx, size = dwords)]
    pub buf: Vec<u32>,
    /// Read status
    #[protocol(rx, status_below = 3)]
    final_status: u16,
}

/// A command to jump to a previously uploaded Download Agent
#[derive(Default, Protocol)]
#[protocol(command = 0xd5)]
pub(crate) struct JumpDa {
    /// DA address
    #[protocol(echo)]
    addr: u32,
    /// DA jump status
    #[protocol(rx, status = 0)]
    status: u16,
}

/// Query of the secure-boot fuse state
#[derive(Default, Protocol)]
#[protocol(command = 0xd8)]
pub(crate) struct GetTargetConfig {
    /// Bit-set over sbc/sla/daa/... flags
    #[protocol(rx)]
    pub config: u32,
    #[protocol(rx, status_below = 3)]
    status: u16,
}

/// SoC identification
#[derive(Default, Protocol)]
#[protocol(command = 0xfd)]
pub(crate) struct GetHwCode {
    #[protocol(rx)]
    pub hw_code: u16,
    #[protocol(rx)]
    pub hw_version: u16,
}

/// Extended version query
#[derive(Default, Protocol)]
#[protocol(command = 0xfc)]
pub(crate) struct GetHwSwVer {
    #[protocol(rx)]
    pub hw_sub_code: u16,
    #[protocol(rx)]
    pub hw_version: u16,
    #[protocol(rx)]
    pub sw_version: u16,
    #[protocol(rx)]
    reserved: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtk_port::mock::{Io, ScriptPort};
    use mtk_port::{ProtocolPort, SimpleRead};

    fn echoed(bytes: &[u8]) -> [Io; 2] {
        [Io::Out(bytes.to_vec()), Io::In(bytes.to_vec())]
    }

    #[test]
    fn read32_round_trip() {
        let mut script = Vec::new();
        script.extend(echoed(&[0xD1]));
        script.extend(echoed(&0x1000_7000u32.to_be_bytes()));
        script.extend(echoed(&2u32.to_be_bytes()));
        script.push(Io::In(vec![0x00, 0x00])); // range check ok
        script.push(Io::In(0xCAFE_F00Du32.to_be_bytes().to_vec()));
        script.push(Io::In(0x1122_3344u32.to_be_bytes().to_vec()));
        script.push(Io::In(vec![0x00, 0x00]));

        let mut port = ScriptPort::new(script);
        let mut cmd = Read32::new(0x1000_7000, 2);
        cmd.run(&mut port).unwrap();
        assert_eq!(cmd.buf, vec![0xCAFE_F00D, 0x1122_3344]);
        assert!(port.done());
    }

    #[test]
    fn read32_accepts_status_below_three() {
        let mut script = Vec::new();
        script.extend(echoed(&[0xD1]));
        script.extend(echoed(&0u32.to_be_bytes()));
        script.extend(echoed(&1u32.to_be_bytes()));
        script.push(Io::In(vec![0x00, 0x02])); // still success
        script.push(Io::In(vec![0; 4]));
        script.push(Io::In(vec![0x00, 0x01]));

        let mut port = ScriptPort::new(script);
        Read32::new(0, 1).run(&mut port).unwrap();
    }

    #[test]
    fn read32_rejects_error_status() {
        let mut script = Vec::new();
        script.extend(echoed(&[0xD1]));
        script.extend(echoed(&0u32.to_be_bytes()));
        script.extend(echoed(&1u32.to_be_bytes()));
        script.push(Io::In(vec![0x1D, 0x0C])); // sec region violation

        let mut port = ScriptPort::new(script);
        let err = Read32::new(0, 1).run(&mut port).unwrap_err();
        assert!(matches!(err, Error::InvalidStatus(_, 0x1D0C)));
    }

    #[test]
    fn flipped_echo_byte_is_a_framing_error() {
        // The device echoes a corrupted address word back.
        let mut script = Vec::new();
        script.extend(echoed(&[0xD1]));
        script.push(Io::Out(0x2000u32.to_be_bytes().to_vec()));
        script.push(Io::In(0x2001u32.to_be_bytes().to_vec()));

        let mut port = ScriptPort::new(script);
        let err = Read32::new(0x2000, 1).run(&mut port).unwrap_err();
        assert!(matches!(err, Error::InvalidEchoData(0x2000, 0x2001)));

        // The port is now poisoned: the next operation must fail fast.
        let mut buf = [0u8; 1];
        assert!(matches!(
            port.read_exact(&mut buf),
            Err(mtk_port::err::Error::Poisoned)
        ));
    }

    #[test]
    fn jump_da_echoes_address_and_checks_status() {
        let mut script = Vec::new();
        script.extend(echoed(&[0xD5]));
        script.extend(echoed(&0x0020_0000u32.to_be_bytes()));
        script.push(Io::In(vec![0x00, 0x00]));

        let mut port = ScriptPort::new(script);
        JumpDa::new(0x0020_0000).run(&mut port).unwrap();
        assert!(port.done());
    }

    #[test]
    fn get_hw_code_parses_both_words() {
        let mut script = Vec::new();
        script.extend(echoed(&[0xFD]));
        script.push(Io::In(vec![0x07, 0x66]));
        script.push(Io::In(vec![0xCA, 0x01]));

        let mut port = ScriptPort::new(script);
        let mut cmd = GetHwCode::new();
        cmd.run(&mut port).unwrap();
        assert_eq!(cmd.hw_code, 0x766);
        assert_eq!(cmd.hw_version, 0xCA01);
    }

    // Noise poisoning must also hold for read_avail-style access.
    #[test]
    fn poisoned_port_blocks_read_avail() {
        let mut port = ScriptPort::new([Io::In(vec![1, 2, 3])]);
        port.poison();
        let mut buf = [0u8; 4];
        assert!(matches!(
            port.read_avail(&mut buf),
            Err(mtk_port::err::Error::Poisoned)
        ));
    }
}
