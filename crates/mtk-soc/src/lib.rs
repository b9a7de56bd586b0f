//! Per-SoC parameter table.
//!
//! One immutable record per supported BROM hardware code: MMIO addresses the
//! exploit and the watchdog handling need, payload load addresses, the
//! Kamakiri `var1` selector and the key used to match entries of the DA
//! catalog. Values were collected from running devices; unconfirmed chips are
//! simply absent.

/// Which DA dialect the stage-1/stage-2 agents of this chip speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaMode {
    /// Legacy ACK/NACK dialect
    Default,
    /// Length-prefixed XFlash dialect (MT67xx and newer)
    Xflash,
}

#[derive(Debug, Clone)]
pub struct ChipConfig {
    pub hw_code: u16,
    pub name: &'static str,
    pub description: &'static str,
    /// Watchdog block MMIO base
    pub watchdog_addr: u32,
    /// UART0 MMIO base, patched into payloads
    pub uart_addr: u32,
    /// Where BROM-mode payloads are loaded
    pub brom_payload_addr: u32,
    /// Where the stage-1 DA is loaded
    pub da_payload_addr: u32,
    /// Where preloader-mode payloads are loaded (DRAM), if known
    pub pl_payload_addr: Option<u32>,
    /// Kamakiri control-transfer index selector
    pub var1: u8,
    pub sej_base: Option<u32>,
    pub dxcc_base: Option<u32>,
    pub gcpu_base: Option<u32>,
    pub cqdma_base: Option<u32>,
    pub da_mode: DaMode,
    /// (address, expected word) pairs checked while staging exploits
    pub blacklist: &'static [(u32, u32)],
    /// Key matched against DA catalog entries
    pub da_code: u16,
}

impl ChipConfig {
    /// Look up the record for a BROM hardware code.
    pub fn by_hw_code(hw_code: u16) -> Option<&'static ChipConfig> {
        HWCONFIG.iter().find(|c| c.hw_code == hw_code)
    }

    /// The word written to the watchdog register to stop the timer.
    /// The magic differs per watchdog block generation.
    pub fn watchdog_disable_word(&self) -> u32 {
        match self.watchdog_addr {
            0x10212000 | 0x10007400 => 0x22000000,
            0xC0000000 => 0x0,
            _ => 0x22000064,
        }
    }
}

static HWCONFIG: [ChipConfig; 6] = [
    ChipConfig {
        hw_code: 0x321,
        name: "MT6735/T",
        description: "",
        watchdog_addr: 0x10212000,
        uart_addr: 0x11002000,
        brom_payload_addr: 0x100A00,
        da_payload_addr: 0x200000,
        pl_payload_addr: Some(0x40200000),
        var1: 0x28,
        sej_base: Some(0x10008000),
        dxcc_base: None,
        gcpu_base: Some(0x10216000),
        cqdma_base: Some(0x10217C00),
        da_mode: DaMode::Default,
        blacklist: &[(0x00102760, 0x0), (0x00105704, 0x0)],
        da_code: 0x6735,
    },
    ChipConfig {
        hw_code: 0x6580,
        name: "MT6580",
        description: "",
        watchdog_addr: 0x10007000,
        uart_addr: 0x11005000,
        brom_payload_addr: 0x100A00,
        da_payload_addr: 0x200000,
        pl_payload_addr: None,
        var1: 0xA,
        sej_base: Some(0x1000A000),
        dxcc_base: None,
        gcpu_base: None,
        cqdma_base: Some(0x1020AC00),
        da_mode: DaMode::Default,
        blacklist: &[(0x102764, 0x0)],
        da_code: 0x6580,
    },
    ChipConfig {
        hw_code: 0x766,
        name: "MT6765",
        description: "Helio P35/G35",
        watchdog_addr: 0x10007000,
        uart_addr: 0x11002000,
        brom_payload_addr: 0x100A00,
        da_payload_addr: 0x200000,
        pl_payload_addr: Some(0x40200000),
        var1: 0x25,
        sej_base: Some(0x1000A000),
        dxcc_base: Some(0x10210000),
        gcpu_base: Some(0x10050000),
        cqdma_base: Some(0x10212000),
        da_mode: DaMode::Xflash,
        blacklist: &[(0x102828, 0x0)],
        da_code: 0x6765,
    },
    ChipConfig {
        hw_code: 0x707,
        name: "MT6768",
        description: "Helio P65/G85",
        watchdog_addr: 0x10007000,
        uart_addr: 0x11002000,
        brom_payload_addr: 0x100A00,
        da_payload_addr: 0x200000,
        pl_payload_addr: Some(0x40200000),
        var1: 0x25,
        sej_base: Some(0x1000A000),
        dxcc_base: Some(0x10210000),
        gcpu_base: Some(0x10050000),
        cqdma_base: Some(0x10212000),
        da_mode: DaMode::Xflash,
        blacklist: &[(0x10282C, 0x0)],
        da_code: 0x6768,
    },
    ChipConfig {
        hw_code: 0x788,
        name: "MT6771/MT8385/MT8183",
        description: "Helio P60/P70/G80",
        watchdog_addr: 0x10007000,
        uart_addr: 0x11002000,
        brom_payload_addr: 0x100A00,
        da_payload_addr: 0x200000,
        pl_payload_addr: None,
        var1: 0xA,
        sej_base: Some(0x1000A000),
        dxcc_base: Some(0x10210000),
        gcpu_base: Some(0x10050000),
        cqdma_base: Some(0x10212000),
        da_mode: DaMode::Xflash,
        blacklist: &[(0x00102834, 0x0)],
        da_code: 0x6771,
    },
    ChipConfig {
        hw_code: 0x8127,
        name: "MT8127/MT3367",
        description: "",
        watchdog_addr: 0x10007000,
        uart_addr: 0x11002000,
        brom_payload_addr: 0x100A00,
        da_payload_addr: 0x200000,
        pl_payload_addr: None,
        var1: 0xA,
        sej_base: Some(0x1000A000),
        dxcc_base: None,
        gcpu_base: Some(0x11010000),
        cqdma_base: None,
        da_mode: DaMode::Default,
        blacklist: &[(0x102870, 0x0)],
        da_code: 0x8127,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_hw_code() {
        let chip = ChipConfig::by_hw_code(0x766).unwrap();
        assert_eq!(chip.name, "MT6765");
        assert_eq!(chip.var1, 0x25);
        assert_eq!(chip.watchdog_addr, 0x10007000);
        assert_eq!(chip.da_mode, DaMode::Xflash);
        assert_eq!(chip.da_code, 0x6765);
    }

    #[test]
    fn unknown_hw_code_is_none() {
        assert!(ChipConfig::by_hw_code(0xABCD).is_none());
    }

    #[test]
    fn disable_word_follows_watchdog_block() {
        assert_eq!(ChipConfig::by_hw_code(0x766).unwrap().watchdog_disable_word(), 0x22000064);
        assert_eq!(ChipConfig::by_hw_code(0x321).unwrap().watchdog_disable_word(), 0x22000000);
    }
}
