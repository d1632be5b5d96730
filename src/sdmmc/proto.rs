//! sdfat32 - SD card SPI-mode protocol constants
//!
//! Command indices, response layouts, data tokens and the two CRCs used on
//! the wire.

// ****************************************************************************
//
// Commands
//
// ****************************************************************************

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify SD Memory Card interface operating condition.
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// SEND_STATUS - read the card status register
pub const CMD13: u8 = 0x0D;
/// SET_BLOCKLEN - set the block length for standard capacity cards
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// CRC_ON_OFF - enable or disable CRC checking
pub const CMD59: u8 = 0x3B;
/// SD_SEND_OP_COMD - Sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = 0x29;

/// Argument bit asking ACMD41 for high capacity support.
pub const ACMD41_HCS: u32 = 0x4000_0000;
/// Supply voltage code sent with CMD8: 2.7-3.6V.
pub const CMD8_VOLTAGE: u8 = 0x01;
/// Check pattern sent with CMD8, echoed back by v2 cards.
pub const CMD8_CHECK_PATTERN: u8 = 0xAA;

// ****************************************************************************
//
// Tokens
//
// ****************************************************************************

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;
/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;
/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;
/// write data rejected, CRC error
pub const DATA_RES_CRC_ERROR: u8 = 0x0B;
/// write data rejected, write error
pub const DATA_RES_WRITE_ERROR: u8 = 0x0D;

bitflags::bitflags! {
    /// The R1 status byte every command returns first.
    pub struct R1: u8 {
        const IDLE_STATE = 0x01;
        const ERASE_RESET = 0x02;
        const ILLEGAL_COMMAND = 0x04;
        const COM_CRC_ERROR = 0x08;
        const ERASE_SEQUENCE_ERROR = 0x10;
        const ADDRESS_ERROR = 0x20;
        const PARAMETER_ERROR = 0x40;
    }
}

impl R1 {
    /// Any bit other than idle set?
    pub fn is_error(&self) -> bool {
        !(*self & !R1::IDLE_STATE).is_empty()
    }

    /// Still in the idle state?
    pub fn is_idle(&self) -> bool {
        self.contains(R1::IDLE_STATE)
    }
}

bitflags::bitflags! {
    /// The second byte of an R2 (SEND_STATUS) response.
    pub struct R2Status: u8 {
        const CARD_LOCKED = 0x01;
        const LOCK_UNLOCK_FAILED = 0x02;
        const ERROR = 0x04;
        const CC_ERROR = 0x08;
        const CARD_ECC_FAILED = 0x10;
        const WP_VIOLATION = 0x20;
        const ERASE_PARAM = 0x40;
        const OUT_OF_RANGE = 0x80;
    }
}

/// Response to CMD13: R1 plus one more status byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct R2 {
    pub r1: R1,
    pub status: R2Status,
}

impl R2 {
    pub fn new(r1: R1, status: u8) -> Self {
        Self {
            r1,
            status: R2Status::from_bits_truncate(status),
        }
    }

    /// No error bit set in either byte.
    pub fn is_ok(&self) -> bool {
        !self.r1.is_error() && self.status.is_empty()
    }
}

/// The Operating Conditions Register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Ocr(pub u32);

impl Ocr {
    /// Card has finished its power up routine.
    pub fn power_up_complete(&self) -> bool {
        self.0 & (1 << 31) != 0
    }

    /// Card Capacity Status: set for SDHC/SDXC. Only valid after power up.
    pub fn high_capacity(&self) -> bool {
        self.0 & (1 << 30) != 0
    }

    /// Supported voltage window, one bit per 100mV step from 2.7V.
    pub fn voltage_window(&self) -> u16 {
        ((self.0 >> 15) & 0x1FF) as u16
    }
}

/// Response to CMD58: R1 plus the OCR.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct R3 {
    pub r1: R1,
    pub ocr: Ocr,
}

impl R3 {
    pub fn new(r1: R1, payload: [u8; 4]) -> Self {
        Self {
            r1,
            ocr: Ocr(u32::from_be_bytes(payload)),
        }
    }
}

/// Response to CMD8: R1 plus the echoed interface condition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct R7 {
    pub r1: R1,
    pub payload: [u8; 4],
}

impl R7 {
    pub fn new(r1: R1, payload: [u8; 4]) -> Self {
        Self { r1, payload }
    }

    /// The voltage range the card accepted; zero means none.
    pub fn accepted_voltage(&self) -> u8 {
        self.payload[2] & 0x0F
    }

    pub fn check_pattern(&self) -> u8 {
        self.payload[3]
    }
}

bitflags::bitflags! {
    /// The low nibble of a data error token, sent instead of the start
    /// block token when a read fails.
    pub struct DataErrorToken: u8 {
        const ERROR = 0x01;
        const CC_ERROR = 0x02;
        const CARD_ECC_FAILED = 0x04;
        const OUT_OF_RANGE = 0x08;
    }
}

impl DataErrorToken {
    pub fn from_token(token: u8) -> Self {
        Self::from_bits_truncate(token)
    }
}

/// The data response token returned after a block has been written.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataResponse {
    Accepted,
    CrcError,
    WriteError,
    Unknown(u8),
}

impl DataResponse {
    pub fn from_token(token: u8) -> Self {
        match token & DATA_RES_MASK {
            DATA_RES_ACCEPTED => Self::Accepted,
            DATA_RES_CRC_ERROR => Self::CrcError,
            DATA_RES_WRITE_ERROR => Self::WriteError,
            _ => Self::Unknown(token),
        }
    }
}

#[cfg(feature = "defmt-log")]
mod format {
    use super::*;

    impl defmt::Format for R1 {
        fn format(&self, f: defmt::Formatter) {
            defmt::write!(f, "R1({=u8:#x})", self.bits())
        }
    }

    impl defmt::Format for R2Status {
        fn format(&self, f: defmt::Formatter) {
            defmt::write!(f, "R2Status({=u8:#x})", self.bits())
        }
    }

    impl defmt::Format for DataErrorToken {
        fn format(&self, f: defmt::Formatter) {
            defmt::write!(f, "DataErrorToken({=u8:#x})", self.bits())
        }
    }

    impl defmt::Format for R2 {
        fn format(&self, f: defmt::Formatter) {
            defmt::write!(f, "R2 {{ r1: {}, status: {} }}", self.r1, self.status)
        }
    }

    impl defmt::Format for Ocr {
        fn format(&self, f: defmt::Formatter) {
            defmt::write!(f, "Ocr({=u32:#x})", self.0)
        }
    }
}

// ****************************************************************************
//
// Card Specific Data
//
// ****************************************************************************

/// The 16 byte Card Specific Data register, version 1 or 2.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Csd {
    pub data: [u8; 16],
}

impl Csd {
    pub fn new() -> Self {
        Self::default()
    }

    /// CSD_STRUCTURE: 0 for v1 (SDSC), 1 for v2 (SDHC/SDXC).
    pub fn version(&self) -> u8 {
        self.bits(127, 126) as u8
    }

    /// Usable size of the card, `None` for unknown CSD structures.
    pub fn card_capacity_bytes(&self) -> Option<u64> {
        match self.version() {
            0 => {
                let c_size = u64::from(self.bits(73, 62));
                let c_size_mult = self.bits(49, 47);
                let read_bl_len = self.bits(83, 80);
                let block_len = 1u64.checked_shl(read_bl_len)?;
                let mult = 1u64.checked_shl(c_size_mult + 2)?;
                (c_size + 1).checked_mul(mult)?.checked_mul(block_len)
            }
            1 => {
                let c_size = u64::from(self.bits(69, 48));
                (c_size + 1).checked_mul(512 * 1024)
            }
            _ => None,
        }
    }

    /// ERASE_BLK_EN: card can erase single 512 byte blocks.
    pub fn erase_single_block_enabled(&self) -> bool {
        self.bits(46, 46) == 1
    }

    /// Bits `msb..=lsb` of the 128 bit register, numbered from the top of the register.
    fn bits(&self, msb: u8, lsb: u8) -> u32 {
        let mut value = 0u32;
        for bit in (lsb..=msb).rev() {
            let byte = self.data[usize::from((127 - bit) / 8)];
            value = (value << 1) | u32::from((byte >> (bit % 8)) & 1);
        }
        value
    }
}

// ****************************************************************************
//
// CRCs
//
// ****************************************************************************

/// Perform the 7-bit CRC used on the SD card, with the end bit appended.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Perform the X25 CRC calculation, as used for data blocks.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc = ((crc >> 8) & 0xFF) | (crc << 8);
        crc ^= u16::from(byte);
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}
