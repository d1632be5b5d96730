//! sdfat32 - SD card protocol
//!
//! Implements the SD card SPI-mode protocol on some generic SPI interface:
//! the power-up/initialization state machine, single block reads and writes
//! and the status/CSD register queries.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

pub mod proto;
mod select;

use select::SdCardSelected;

use self::proto::*;
use core::convert::TryFrom;

use crate::{Block, BlockCount, BlockDevice, BlockIdx};

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

const DEFAULT_DELAY_COUNT: u32 = 32_000;

/// How often we send CMD0 when the card doesn't answer at all.
const CMD0_ATTEMPTS: u32 = 10;

/// Upper bound for waiting on the start block token of a read.
const READ_TOKEN_TIMEOUT_MS: u32 = 100;

/// Upper bound for the card to finish programming a written block.
const WRITE_BUSY_TIMEOUT_MS: u32 = 500;

/// Represents an SD Card interface.
/// Built from an SPI peripheral and a Chip
/// Select pin. We need Chip Select to be separate so we can clock out some
/// bytes without Chip Select asserted (which puts the card into SPI mode).
pub struct SdCard<SPI, CS, State>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    capacity: CardCapacity,
    options: InitOptions,
    spi: SPI,
    cs: CS,
    #[allow(dead_code)]
    state: State,
}

/// The possible errors `SdCard` can generate once a transaction is under way.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the SPI peripheral
    Transport,
    /// Couldn't set a GPIO pin
    GpioError,
    /// We didn't get a response when executing this command
    TimeoutCommand(u8),
    /// The card answered this command with an error in its R1 byte
    CommandRejected { command: u8, response: R1 },
    /// We didn't get a start block token when reading data from the card
    TimeoutReadBuffer,
    /// The card sent a data error token instead of data
    DataError(DataErrorToken),
    /// We got a CRC mismatch (card gave us, we calculated)
    CrcError(u16, u16),
    /// The card didn't send a data response token after a write
    TimeoutDataResponse,
    /// The card refused the written block
    WriteRejected(DataResponse),
    /// We didn't get a response when waiting for the card to not be busy
    TimeoutWaitNotBusy,
    /// The status register reported an error after a write
    Status(R2),
    /// We failed to decode the Card Specific Data register
    RegisterReadError,
}

/// Why initialization stopped. Each variant maps to one step of the
/// power-up sequence.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitError {
    /// CMD0 didn't put the card in the idle state. Holds the R1 byte, or
    /// 0xFF if the card never answered.
    Cmd0Fail(u8),
    /// The card reported a CRC error for CMD8
    Cmd8CrcError,
    /// The card accepts none of the offered supply voltages
    VoltageMismatch,
    /// CMD8 echoed something other than what we sent
    Cmd8EchoFail { voltage: u8, pattern: u8 },
    /// The card was still idle after all ACMD41 retries
    OpCondTimeout,
    /// The OCR power-up bit never got set
    PowerUpTimeout(Ocr),
    /// We failed to enable CRC checking on the SD card
    CantEnableCrc,
    /// Low-level failure talking to the card
    Card(Error),
}

impl From<Error> for InitError {
    fn from(e: Error) -> Self {
        InitError::Card(e)
    }
}

/// The state of an SdCard if it is not initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct NotInit;

/// The state of an SdCard if it is initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct Initialized;

/// The capacity class found during initialization.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardCapacity {
    /// SDSC: the card is addressed in bytes.
    Standard,
    /// SDHC/SDXC: the card is addressed in blocks.
    High,
}

/// Options for initializing the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InitOptions {
    /// How many times ACMD41 is sent before giving up on the card leaving
    /// the idle state.
    pub op_cond_retries: u16,
    /// Tell the card we support high capacity addressing.
    pub high_capacity: bool,
    /// Turn on CRC checking in the card and treat read CRC mismatches as
    /// errors. Some cards don't support CRC mode. At least a 512MiB
    /// Transcend one.
    pub require_crc: bool,
    /// Rough number of byte transfers per millisecond at the data clock.
    /// There is no timer, so this converts the millisecond timeouts into
    /// transfer counts.
    pub transfers_per_ms: u32,
}

impl InitOptions {
    pub fn new(op_cond_retries: u16, high_capacity: bool) -> Self {
        Self {
            op_cond_retries,
            high_capacity,
            ..Default::default()
        }
    }
}

impl Default for InitOptions {
    fn default() -> Self {
        InitOptions {
            op_cond_retries: 100,
            high_capacity: true,
            require_crc: false,
            transfers_per_ms: 1_000,
        }
    }
}

/// Polling limits in byte transfers.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Timeouts {
    pub read_token: u32,
    pub write_busy: u32,
}

impl From<&InitOptions> for Timeouts {
    fn from(options: &InitOptions) -> Self {
        Timeouts {
            read_token: READ_TOKEN_TIMEOUT_MS.saturating_mul(options.transfers_per_ms),
            write_busy: WRITE_BUSY_TIMEOUT_MS.saturating_mul(options.transfers_per_ms),
        }
    }
}

/// A terrible hack for busy-waiting the CPU while we wait for the card to
/// sort itself out.
struct Delay(u32);

impl Delay {
    fn new() -> Delay {
        Delay(DEFAULT_DELAY_COUNT)
    }

    /// Burn one tick.
    fn tick(&mut self) {
        let dummy_var: u32 = 0;
        for _ in 0..100 {
            unsafe { core::ptr::read_volatile(&dummy_var) };
        }
        self.0 = self.0.saturating_sub(1);
    }
}

impl<SPI, CS> SdCard<SPI, CS, NotInit>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Create a new SD card driver using a raw SPI interface.
    pub fn new(spi: SPI, cs: CS) -> Self {
        SdCard {
            capacity: CardCapacity::Standard,
            options: InitOptions::default(),
            spi,
            cs,
            state: NotInit,
        }
    }

    /// Give back the SPI peripheral and the chip select pin.
    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    fn discard_byte(&mut self) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [0xFF])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// Initializes the card into a known state.
    ///
    /// On failure the uninitialized driver is handed back together with the
    /// reason, so the caller can retry.
    pub fn init(
        mut self,
        options: InitOptions,
    ) -> Result<SdCard<SPI, CS, Initialized>, (InitError, Self)> {
        debug!("Initializing card with {:?}", options);
        self.options = options;
        let result = self.power_up_sequence();
        if let Err(e) = self.discard_byte() {
            warn!("Trailing clock byte after init failed: {:?}", e);
        }

        match result {
            Ok(capacity) => {
                debug!("Card ready, capacity {:?}", capacity);
                Ok(SdCard {
                    capacity,
                    options: self.options,
                    spi: self.spi,
                    cs: self.cs,
                    state: Initialized,
                })
            }
            Err(e) => {
                warn!("Card init failed: {:?}", e);
                Err((e, self))
            }
        }
    }

    fn power_up_sequence(&mut self) -> Result<CardCapacity, InitError> {
        let options = self.options;

        trace!("Reset card..");
        // Supply minimum of 74 clock cycles without CS asserted.
        self.cs.set_high().map_err(|_| Error::GpioError)?;
        Delay::new().tick();
        for _ in 0..10 {
            self.discard_byte()?;
        }

        let mut card =
            SdCardSelected::new(&mut self.spi, &mut self.cs, Timeouts::from(&options))?;

        // Enter SPI mode
        let mut delay = Delay::new();
        let mut attempt = 0;
        loop {
            trace!("Enter SPI mode, attempt: {}..", attempt);
            match card.card_command(CMD0, 0) {
                Ok(r1) if r1 == R1::IDLE_STATE => break,
                Ok(r1) => return Err(InitError::Cmd0Fail(r1.bits())),
                Err(Error::TimeoutCommand(CMD0)) if attempt + 1 < CMD0_ATTEMPTS => {
                    warn!("Timed out, trying again..");
                    attempt += 1;
                    delay.tick();
                }
                Err(Error::TimeoutCommand(CMD0)) => return Err(InitError::Cmd0Fail(0xFF)),
                Err(e) => return Err(e.into()),
            }
        }

        if options.require_crc && card.card_command(CMD59, 1)? != R1::IDLE_STATE {
            return Err(InitError::CantEnableCrc);
        }

        // Check card version
        let r7 = card.send_if_cond()?;
        let legacy = r7.r1.contains(R1::ILLEGAL_COMMAND);
        if legacy {
            debug!("CMD8 rejected, version 1 card");
        } else if r7.r1.contains(R1::COM_CRC_ERROR) {
            return Err(InitError::Cmd8CrcError);
        } else if r7.accepted_voltage() == 0 {
            return Err(InitError::VoltageMismatch);
        } else if r7.accepted_voltage() != CMD8_VOLTAGE || r7.check_pattern() != CMD8_CHECK_PATTERN
        {
            return Err(InitError::Cmd8EchoFail {
                voltage: r7.accepted_voltage(),
                pattern: r7.check_pattern(),
            });
        }

        let r3 = card.read_ocr()?;
        debug!("OCR before power up: {:?}", r3.ocr);

        let arg = if options.high_capacity && !legacy {
            ACMD41_HCS
        } else {
            0
        };
        let mut ready = false;
        for _ in 0..options.op_cond_retries {
            match card.card_acmd(ACMD41, arg) {
                Ok(r1) if !r1.is_idle() => {
                    ready = true;
                    break;
                }
                Ok(_) | Err(Error::TimeoutCommand(_)) => delay.tick(),
                Err(e) => return Err(e.into()),
            }
        }
        if !ready {
            return Err(InitError::OpCondTimeout);
        }

        let r3 = card.read_ocr()?;
        let capacity = if r3.r1.contains(R1::ILLEGAL_COMMAND) && legacy {
            // Some v1 cards don't know CMD58. ACMD41 completing is all the
            // power up evidence they give.
            CardCapacity::Standard
        } else if r3.r1.is_error() {
            return Err(Error::CommandRejected {
                command: CMD58,
                response: r3.r1,
            }
            .into());
        } else if !r3.ocr.power_up_complete() {
            return Err(InitError::PowerUpTimeout(r3.ocr));
        } else if r3.ocr.high_capacity() {
            CardCapacity::High
        } else {
            CardCapacity::Standard
        };

        if capacity == CardCapacity::Standard {
            let r1 = card.card_command(CMD16, Block::LEN_U32)?;
            if r1.is_error() {
                return Err(Error::CommandRejected {
                    command: CMD16,
                    response: r1,
                }
                .into());
            }
        }

        Ok(capacity)
    }
}

impl<SPI, CS> SdCard<SPI, CS, Initialized>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Mark the card as unused.
    /// This should be kept infallible, because Drop is unable to fail.
    /// See https://github.com/rust-lang/rfcs/issues/814
    // If there is any need to flush data, it should be implemented here.
    pub fn deinit(self) -> SdCard<SPI, CS, NotInit> {
        SdCard {
            capacity: self.capacity,
            options: self.options,
            spi: self.spi,
            cs: self.cs,
            state: NotInit,
        }
    }

    /// The capacity class decided during initialization.
    pub fn capacity(&self) -> CardCapacity {
        self.capacity
    }

    /// Run a command with chip select asserted.
    ///
    /// Chip select is always deasserted, even if an error occured in `f`
    fn with_chip_select<F, R>(&mut self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut SdCardSelected<SPI, CS>) -> Result<R, Error>,
    {
        let timeouts = Timeouts::from(&self.options);
        let mut card = SdCardSelected::new(&mut self.spi, &mut self.cs, timeouts)?;
        f(&mut card)
    }

    /// Block indices go out as-is on high capacity cards and as byte
    /// offsets on standard capacity ones.
    fn card_address(&self, block_idx: BlockIdx) -> u32 {
        match self.capacity {
            CardCapacity::Standard => block_idx.0.wrapping_mul(Block::LEN_U32),
            CardCapacity::High => block_idx.0,
        }
    }

    /// Query the status register (CMD13).
    pub fn status(&mut self) -> Result<R2, Error> {
        self.with_chip_select(|card| card.card_status())
    }

    /// Read the 'card specific data' block.
    pub fn read_csd(&mut self) -> Result<Csd, Error> {
        let require_crc = self.options.require_crc;
        self.with_chip_select(|card| {
            let r1 = card.card_command(CMD9, 0)?;
            if r1.is_error() {
                return Err(Error::CommandRejected {
                    command: CMD9,
                    response: r1,
                });
            }
            let mut csd = Csd::new();
            card.read_data(&mut csd.data, require_crc)?;
            Ok(csd)
        })
    }

    /// Return the usable size of this SD card in bytes.
    pub fn card_size_bytes(&mut self) -> Result<u64, Error> {
        self.read_csd()?
            .card_capacity_bytes()
            .ok_or(Error::RegisterReadError)
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&mut self) -> Result<bool, Error> {
        Ok(self.read_csd()?.erase_single_block_enabled())
    }
}

impl<SPI, CS> BlockDevice for SdCard<SPI, CS, Initialized>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    type Error = Error;

    /// Read one block with CMD17.
    fn read_block(&mut self, block_idx: BlockIdx, reason: &str) -> Result<Block, Self::Error> {
        trace!("Read block {} ({})", block_idx.0, reason);
        let address = self.card_address(block_idx);
        let require_crc = self.options.require_crc;
        self.with_chip_select(|card| {
            let r1 = card.card_command(CMD17, address)?;
            if !r1.is_empty() {
                return Err(Error::CommandRejected {
                    command: CMD17,
                    response: r1,
                });
            }
            let mut block = Block::new();
            card.read_data(&mut block.contents, require_crc)?;
            Ok(block)
        })
    }

    /// Write one block with CMD24, wait for programming to finish and check
    /// the status register for errors the data response can't show.
    fn write_block(&mut self, block_idx: BlockIdx, block: &Block) -> Result<(), Self::Error> {
        trace!("Write block {}", block_idx.0);
        let address = self.card_address(block_idx);
        let timeouts = Timeouts::from(&self.options);
        self.with_chip_select(|card| {
            let r1 = card.card_command(CMD24, address)?;
            if !r1.is_empty() {
                return Err(Error::CommandRejected {
                    command: CMD24,
                    response: r1,
                });
            }
            card.write_data(DATA_START_BLOCK, &block.contents)?;
            card.wait_not_busy(timeouts.write_busy)?;
            let status = card.card_status()?;
            if !status.is_ok() {
                return Err(Error::Status(status));
            }
            Ok(())
        })
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        let num_bytes = self.card_size_bytes()?;
        let num_blocks = num_bytes / Block::LEN as u64;
        // A full 2 TiB card holds one more block than a u32 can count.
        Ok(BlockCount(u32::try_from(num_blocks).unwrap_or(u32::MAX)))
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
