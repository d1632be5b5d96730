use embedded_hal::{blocking::spi::Transfer, digital::v2::OutputPin};

#[cfg(feature = "log")]
use log::{trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};

use super::proto::*;
use super::{Error, Timeouts};

/// How many bytes we clock out waiting for the R1 byte of a response. The
/// card must answer within 8.
const COMMAND_RESPONSE_ATTEMPTS: u32 = 64;

/// How many bytes we clock out waiting for the data response token after a
/// block has been sent. It should be the very next byte.
const DATA_RESPONSE_ATTEMPTS: u32 = 8;

/// A struct used to ensure that communication only occurs
/// when CS is low.
///
/// This struct is responsible for ensuring that all SPI, CRC, and
/// other communication-layer functionalities are performed correctly.
/// Chip select is asserted in `new` and released in `drop`, so it is
/// released on every exit path, error or not.
pub struct SdCardSelected<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    spi: &'spi mut SPI,
    cs: &'cs mut CS,
    timeouts: Timeouts,
}

impl<'spi, 'cs, SPI, CS> Drop for SdCardSelected<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    fn drop(&mut self) {
        self.cs_high().ok();
        // The card only releases MISO on the next clock edge.
        self.receive().ok();
    }
}

impl<'spi, 'cs, SPI, CS> SdCardSelected<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    pub fn new(spi: &'spi mut SPI, cs: &'cs mut CS, timeouts: Timeouts) -> Result<Self, Error> {
        let mut me = Self { spi, cs, timeouts };
        me.cs_low()?;
        Ok(me)
    }

    fn cs_high(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::GpioError)
    }

    fn cs_low(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::GpioError)
    }

    /// Send one byte and receive one byte.
    fn transfer(&mut self, out: u8) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [out])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        self.transfer(0xFF)
    }

    /// Fill `buffer` with the bytes following a response's R1 byte.
    pub fn receive_into(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        for b in buffer.iter_mut() {
            *b = self.receive()?;
        }
        Ok(())
    }

    /// Send a byte to the SD card.
    pub fn send(&mut self, out: u8) -> Result<(), Error> {
        let _ = self.transfer(out)?;
        Ok(())
    }

    /// Spin until the card returns 0xFF, or we spin `attempts` times and
    /// timeout.
    pub fn wait_not_busy(&mut self, attempts: u32) -> Result<(), Error> {
        for _ in 0..attempts {
            if self.receive()? == 0xFF {
                return Ok(());
            }
        }
        Err(Error::TimeoutWaitNotBusy)
    }

    /// Perform a command, returning its R1 byte. Any extra response bytes
    /// are left on the bus for the caller to collect.
    pub fn card_command(&mut self, command: u8, arg: u32) -> Result<R1, Error> {
        self.wait_not_busy(self.timeouts.write_busy)?;
        let mut buf = [
            0x40 | command,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            0,
        ];
        buf[5] = crc7(&buf[0..5]);

        for b in buf.iter() {
            self.send(*b)?;
        }

        for _ in 0..COMMAND_RESPONSE_ATTEMPTS {
            let result = self.receive()?;
            if (result & 0x80) == 0 {
                trace!("CMD{} arg={:#x} -> {:#x}", command, arg, result);
                return Ok(R1::from_bits_truncate(result));
            }
        }

        Err(Error::TimeoutCommand(command))
    }

    /// Perform an application-specific command.
    pub fn card_acmd(&mut self, command: u8, arg: u32) -> Result<R1, Error> {
        self.card_command(CMD55, 0)?;
        self.card_command(command, arg)
    }

    /// CMD8 with its R7 payload.
    pub fn send_if_cond(&mut self) -> Result<R7, Error> {
        let arg = (u32::from(CMD8_VOLTAGE) << 8) | u32::from(CMD8_CHECK_PATTERN);
        let r1 = self.card_command(CMD8, arg)?;
        let mut payload = [0u8; 4];
        if !r1.contains(R1::ILLEGAL_COMMAND) {
            self.receive_into(&mut payload)?;
        }
        Ok(R7::new(r1, payload))
    }

    /// CMD58 with its R3 payload.
    pub fn read_ocr(&mut self) -> Result<R3, Error> {
        let r1 = self.card_command(CMD58, 0)?;
        let mut payload = [0u8; 4];
        if !r1.contains(R1::ILLEGAL_COMMAND) {
            self.receive_into(&mut payload)?;
        }
        Ok(R3::new(r1, payload))
    }

    /// CMD13 with its R2 payload.
    pub fn card_status(&mut self) -> Result<R2, Error> {
        let r1 = self.card_command(CMD13, 0)?;
        let status = self.receive()?;
        Ok(R2::new(r1, status))
    }

    /// Read an arbitrary number of bytes from the card. Always fills the
    /// given buffer, so make sure it's the right size.
    ///
    /// The CRC trailer is always compared; a mismatch is only an error when
    /// `require_crc` is set.
    pub fn read_data(&mut self, buffer: &mut [u8], require_crc: bool) -> Result<(), Error> {
        let mut token = 0xFF;
        for _ in 0..self.timeouts.read_token {
            token = self.receive()?;
            if token != 0xFF {
                break;
            }
        }
        match token {
            DATA_START_BLOCK => {}
            0xFF => return Err(Error::TimeoutReadBuffer),
            other => return Err(Error::DataError(DataErrorToken::from_token(other))),
        }

        self.receive_into(buffer)?;

        let mut crc = u16::from(self.receive()?);
        crc <<= 8;
        crc |= u16::from(self.receive()?);

        let calc_crc = crc16(buffer);
        if crc != calc_crc {
            if require_crc {
                return Err(Error::CrcError(crc, calc_crc));
            }
            warn!("Data CRC mismatch: card {:#x}, ours {:#x}", crc, calc_crc);
        }

        Ok(())
    }

    /// Write an arbitrary number of bytes to the card, followed by its
    /// CRC, and collect the data response token.
    pub fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        let calc_crc = crc16(buffer);
        self.send(token)?;
        for &b in buffer.iter() {
            self.send(b)?;
        }
        self.send((calc_crc >> 8) as u8)?;
        self.send(calc_crc as u8)?;

        for _ in 0..DATA_RESPONSE_ATTEMPTS {
            let status = self.receive()?;
            if status != 0xFF {
                return match DataResponse::from_token(status) {
                    DataResponse::Accepted => Ok(()),
                    rejected => Err(Error::WriteRejected(rejected)),
                };
            }
        }
        Err(Error::TimeoutDataResponse)
    }
}
