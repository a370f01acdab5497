//! SDHC/SDXC Library written in Embedded Rust.
//!
//! This crate turns a blocking full-duplex SPI channel into byte-addressable storage backed by an
//! SDHC or SDXC card. Reads and writes take any byte range, partial blocks are merged with the
//! content already stored on the card.
//!
//! Logging goes through the `log` crate by default. Disable default features and enable
//! `defmt-log` to log over [defmt](https://crates.io/crates/defmt) instead.

#![cfg_attr(not(test), no_std)]

#[cfg(all(feature = "log", feature = "defmt-log"))]
compile_error!("Features `log` and `defmt-log` are mutually exclusive");
#[cfg(not(any(feature = "log", feature = "defmt-log")))]
compile_error!("Enable one of the `log` or `defmt-log` features");

mod blocks;
mod config;
mod consts;
mod csd;
mod response;

#[cfg(test)]
mod fake_card;

pub use crate::blocks::block_count;
pub use crate::config::{DefaultSdCardConfig, SdCardConfig, UnboundedReadyWaitConfig};
pub use crate::consts::BLOCK_SIZE;
pub use crate::csd::{CapacityProvider, CsdV2};
pub use crate::response::CardErrorKind;
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};

use crate::{
    blocks::Segments,
    consts::{
        commands, tokens, BLOCK_BITS, BLOCK_SIZE_U64, CLOCK_SYNC_LEN, CMD_LEN, CRC_LEN, CSD_LEN,
        FILL, R1_LEN, R3_LEN, R7_LEN,
    },
    csd::CsdData,
    response::{DataResponse, R1Response},
};

use core::{cell::RefCell, marker::PhantomData};
#[cfg(feature = "defmt-log")]
use defmt::{debug, error, info, trace, warn};
use embedded_hal::blocking::spi::Transfer;
#[cfg(feature = "log")]
use log::{debug, error, info, trace, warn};
use size::Size;
use switch_hal::OutputSwitch;

/// [`SdCard`] result error.
///
/// `T` - transport error type.
/// `S` - select switch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    SelectError(S),
    /// The card didn't answer within the configured poll budget.
    Timeout,
    /// Unexpected status or token from the card.
    ProtocolError,
    /// The card rejected a data block because of a CRC mismatch.
    CrcError,
    /// The card failed to program a data block.
    WriteError,
    /// The card sent an error token instead of a data block.
    CardError(CardErrorKind),
    /// Not an SD 2.0+ high or extended capacity card, or unsupported voltage.
    UnsupportedCard,
    /// The card didn't enter SPI mode.
    InitFailure,
    /// Address or length outside the card.
    InvalidArgument,
    /// Can't perform this operation with the card in this state.
    BadState,
}

/// Card type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum CardType {
    /// High capacity, up to 32 GiB.
    SDHC,
    /// Extended capacity, above 32 GiB.
    SDXC,
}

/// Error type alias.
type ErrorFor<T> = <T as DiskioDevice>::HardwareError;

/// SD Card SPI driver.
///
/// `Spi` - SPI.
/// `Cs` - Chip select output switch.
/// `Config` - Config implementation of driver config trait.
pub struct SdCard<Spi, Cs, Config = DefaultSdCardConfig>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Config: SdCardConfig,
{
    spi: RefCell<Spi>,
    cs: RefCell<Cs>,
    status: Status,
    csd: Option<CsdV2>,
    memory_size: u64,
    config: PhantomData<Config>,
}

impl<Spi, Cs, Config> SdCard<Spi, Cs, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Config: SdCardConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Cards above this size are SDXC.
    const SDHC_MAX_SIZE: u64 = 32 * 1024 * 1024 * 1024;

    /// Creates a new uninitialized [`SdCard<Spi, Cs, Config>`].
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    pub fn new(spi: Spi, cs: Cs) -> Self {
        SdCard {
            spi: RefCell::new(spi),
            cs: RefCell::new(cs),
            status: StatusFlag::NotInitialized.into(),
            csd: None,
            memory_size: 0,
            config: PhantomData::<Config>,
        }
    }

    /// Creates a driver and initializes the card.
    pub fn init(spi: Spi, cs: Cs) -> Result<Self, ErrorFor<Self>> {
        let mut card = Self::new(spi, cs);
        card.initialize()?;

        Ok(card)
    }

    /// Runs the card initialization sequence.
    ///
    /// Fails with [`Error::BadState`] if the card is already initialized.
    pub fn initialize(&mut self) -> Result<(), ErrorFor<Self>> {
        if !self.status.contains(StatusFlag::NotInitialized) {
            warn!("SD already is initialized");
            return Err(Error::BadState);
        }

        self.init_card()
    }

    /// Releases the driver, giving back the SPI and the chip select.
    pub fn remove(self) -> (Spi, Cs) {
        info!("SD removed");
        (self.spi.into_inner(), self.cs.into_inner())
    }

    /// Card size in bytes, zero until initialized.
    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    /// Card size.
    pub fn capacity(&self) -> Size {
        Size::from_bytes(self.memory_size)
    }

    /// Card Specific Data read during initialization.
    pub fn csd(&self) -> Option<&CsdV2> {
        self.csd.as_ref()
    }

    /// Card type, `None` until initialized.
    pub fn card_type(&self) -> Option<CardType> {
        match self.memory_size {
            0 => None,
            size if size <= Self::SDHC_MAX_SIZE => Some(CardType::SDHC),
            _ => Some(CardType::SDXC),
        }
    }

    /// Reads `buf.len()` bytes starting at byte `address`.
    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        self.validate_initialized()?;
        self.validate_range(address, buf.len())?;

        let segments = Segments::new(address, buf.len() as u64);
        let block = Self::block_arg(address)?;

        self.cs_scope(|s| s.read_segments(block, segments, buf))
    }

    /// Writes `data` starting at byte `address`.
    ///
    /// Blocks covered only partially keep the bytes outside the range.
    pub fn write(&self, address: u64, data: &[u8]) -> Result<(), ErrorFor<Self>> {
        self.validate_initialized()?;
        self.validate_range(address, data.len())?;

        let segments = Segments::new(address, data.len() as u64);
        let block = Self::block_arg(address)?;

        let mut first_block = [0u8; BLOCK_SIZE];
        let mut last_block = [0u8; BLOCK_SIZE];

        if let Some(segment) = segments.partial_first() {
            self.read(segment.block << BLOCK_BITS, &mut first_block)?;
        }
        if let Some(segment) = segments.partial_last() {
            self.read(segment.block << BLOCK_BITS, &mut last_block)?;
        }

        self.cs_scope(|s| {
            s.write_segments(block, segments, data, &mut first_block, &mut last_block)
        })
    }

    /// Validate initialized.
    fn validate_initialized(&self) -> Result<(), ErrorFor<Self>> {
        if self.status.contains(StatusFlag::NotInitialized) {
            Err(Error::BadState)
        } else {
            Ok(())
        }
    }

    /// Validate the range of a read or write.
    fn validate_range(&self, address: u64, len: usize) -> Result<(), ErrorFor<Self>> {
        let len = len as u64;
        let fits = address
            .checked_add(len)
            .map_or(false, |end| end <= self.memory_size);

        if len == 0 || address > self.memory_size || len > self.memory_size || !fits {
            error!(
                "SD invalid range, address: {}, length: {}, memory size: {}",
                address, len, self.memory_size
            );
            Err(Error::InvalidArgument)
        } else {
            Ok(())
        }
    }

    /// Block number of `address`, as the command argument.
    fn block_arg(address: u64) -> Result<u32, ErrorFor<Self>> {
        u32::try_from(address >> BLOCK_BITS).map_err(|_| Error::InvalidArgument)
    }

    /// Activate chip select.
    fn select(&self) -> Result<(), ErrorFor<Self>> {
        self.cs.borrow_mut().on().map_err(Error::SelectError)
    }

    /// Deactivate chip select.
    fn unselect(&self) -> Result<(), ErrorFor<Self>> {
        self.cs.borrow_mut().off().map_err(Error::SelectError)
    }

    /// CS scope.
    fn cs_scope<R, F>(&self, f: F) -> Result<R, ErrorFor<Self>>
    where
        F: FnOnce(&Self) -> Result<R, ErrorFor<Self>>,
    {
        self.select()?;
        let result = f(self);
        let unselected = self.unselect();

        // The first error wins.
        let value = result?;
        unselected?;

        Ok(value)
    }

    /// Exchange `data` with the card in place.
    fn exchange(&self, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        self.spi
            .borrow_mut()
            .transfer(data)
            .map(|_| ())
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    fn receive(&self) -> Result<u8, ErrorFor<Self>> {
        let mut data = [FILL];
        self.exchange(&mut data)?;

        Ok(data[0])
    }

    /// Receive a slice from the SD card.
    fn receive_slice(&self, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        data.fill(FILL);
        self.exchange(data)
    }

    /// Clock bytes until one satisfies `token_validator`.
    fn wait_for_token<F: Fn(u8) -> bool>(&self, token_validator: F) -> Result<u8, ErrorFor<Self>> {
        for _ in 0..Config::RESPONSE_POLL_ATTEMPTS {
            let token = self.receive()?;

            if token_validator(token) {
                return Ok(token);
            }
        }

        Err(Error::Timeout)
    }

    /// Wait for the first byte that isn't fill.
    fn wait_for_response(&self) -> Result<u8, ErrorFor<Self>> {
        self.wait_for_token(|token| token != FILL)
    }

    /// Wait until the card releases the busy signal.
    fn wait_until_not_busy(&self) -> Result<(), ErrorFor<Self>> {
        self.wait_for_token(|token| token != tokens::BUSY)
            .map(|_| ())
    }

    /// Send command, receive an `N` byte response.
    fn send_command<const N: usize>(&self, cmd: u8, arg: u32) -> Result<[u8; N], ErrorFor<Self>> {
        if (cmd & commands::ACMD_FLAG) != 0 {
            let r1 = self.send_command_r1(commands::CMD55, commands::STUFF_ARG)?;
            if r1 != R1Response::IN_IDLE_STATE {
                warn!("Wrong response from CMD55: {:#x}", r1.bits());
                return Err(Error::ProtocolError);
            }
        }

        let cmd = cmd & !commands::ACMD_FLAG;
        let crc = match cmd {
            commands::CMD0 => commands::CMD0_CRC,
            commands::CMD8 => commands::CMD8_CRC,
            _ => commands::NO_CRC,
        };
        let [a3, a2, a1, a0] = arg.to_be_bytes();
        let mut frame: [u8; CMD_LEN] = [FILL, cmd, a3, a2, a1, a0, crc, FILL];

        trace!("CMD{}, arg: {:#x}", cmd - commands::CMD_BASE, arg);
        self.exchange(&mut frame)?;

        let mut response = [FILL; N];
        if let Some((first, rest)) = response.split_first_mut() {
            *first = self.wait_for_response()?;
            if !rest.is_empty() {
                self.receive_slice(rest)?;
            }
        }

        Ok(response)
    }

    /// Send command with R1 response.
    fn send_command_r1(&self, cmd: u8, arg: u32) -> Result<R1Response, ErrorFor<Self>> {
        self.send_command::<R1_LEN>(cmd, arg)
            .map(|[r1]| R1Response::from(r1))
    }

    /// Send command that must be answered with ready state.
    fn send_command_ready(&self, cmd: u8, arg: u32) -> Result<(), ErrorFor<Self>> {
        let r1 = self.send_command_r1(cmd, arg)?;
        if r1 != R1Response::READY_STATE {
            warn!(
                "Wrong response from CMD{}: {:#x}",
                (cmd & !commands::ACMD_FLAG) - commands::CMD_BASE,
                r1.bits()
            );
            return Err(Error::ProtocolError);
        }

        Ok(())
    }

    /// Read one data block.
    fn read_block(&self, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        let token = self.wait_for_response()?;

        if let Some(kind) = CardErrorKind::from_token(token) {
            error!("SD read error token: {:#x}", token);
            return Err(Error::CardError(kind));
        }
        if token != tokens::DATA_START_BLOCK {
            error!("SD expected start block token, got: {:#x}", token);
            return Err(Error::ProtocolError);
        }

        self.receive_slice(data)?;
        self.receive_slice(&mut [FILL; CRC_LEN])
    }

    /// Write one data block, wait while the card programs it.
    fn write_block(&self, token: u8, data: &[u8]) -> Result<(), ErrorFor<Self>> {
        let mut frame = [FILL; 1 + BLOCK_SIZE + CRC_LEN];
        frame[0] = token;
        frame[1..=BLOCK_SIZE].copy_from_slice(data);

        self.exchange(&mut frame)?;

        match DataResponse::from(self.wait_for_response()?) {
            DataResponse::Accepted => self.wait_until_not_busy(),
            DataResponse::CrcError => {
                error!("SD rejected block, CRC error");
                Err(Error::CrcError)
            }
            DataResponse::WriteError => {
                error!("SD rejected block, write error");
                Err(Error::WriteError)
            }
            DataResponse::Unknown(token) => {
                error!("SD unexpected data response: {:#x}", token);
                Err(Error::ProtocolError)
            }
        }
    }

    /// Read blocks of a request, copying partial ones out of a scratch block.
    fn read_segments(
        &self,
        block: u32,
        segments: Segments,
        buf: &mut [u8],
    ) -> Result<(), ErrorFor<Self>> {
        let multiple = segments.blocks() > 1;

        self.send_command_ready(
            if multiple {
                commands::CMD18
            } else {
                commands::CMD17
            },
            block,
        )?;

        let mut scratch = [0u8; BLOCK_SIZE];
        for segment in segments {
            if segment.is_full() {
                self.read_block(&mut buf[segment.data_range()])?;
            } else {
                self.read_block(&mut scratch)?;
                buf[segment.data_range()].copy_from_slice(&scratch[segment.block_range()]);
            }
        }

        if multiple {
            self.send_command_ready(commands::CMD12, commands::STUFF_ARG)?;
        }

        Ok(())
    }

    /// Write blocks of a request, merging partial ones into the pre-read blocks.
    fn write_segments(
        &self,
        block: u32,
        segments: Segments,
        data: &[u8],
        first_block: &mut [u8; BLOCK_SIZE],
        last_block: &mut [u8; BLOCK_SIZE],
    ) -> Result<(), ErrorFor<Self>> {
        let multiple = segments.blocks() > 1;
        let (cmd, token) = if multiple {
            (commands::CMD25, tokens::WRITE_MULTIPLE)
        } else {
            (commands::CMD24, tokens::DATA_START_BLOCK)
        };

        self.send_command_ready(cmd, block)?;

        for (index, segment) in segments.enumerate() {
            let chunk = &data[segment.data_range()];

            if segment.is_full() {
                self.write_block(token, chunk)?;
            } else {
                let merged = if index == 0 {
                    &mut *first_block
                } else {
                    &mut *last_block
                };
                merged[segment.block_range()].copy_from_slice(chunk);
                self.write_block(token, merged)?;
            }
        }

        if multiple {
            self.exchange(&mut [tokens::STOP_TRAN, FILL])?;
            self.wait_until_not_busy()?;
        }

        Ok(())
    }

    /// Enter SD to SPI mode.
    fn enter_spi_mode(&self) -> Result<(), ErrorFor<Self>> {
        for i in 0..Config::ENTER_SPI_MODE_ATTEMPTS {
            info!("Enter to SPI mode for SD, attempt: {}", i + 1);

            match self.send_command_r1(commands::CMD0, commands::STUFF_ARG) {
                Ok(r1) if r1 == R1Response::IN_IDLE_STATE => return Ok(()),
                Ok(r1) => warn!("Wrong response from CMD0: {:#x}", r1.bits()),
                Err(Error::Timeout) => warn!("No response from CMD0"),
                Err(err) => return Err(err),
            }
        }

        error!("SD didn't enter SPI mode");
        Err(Error::InitFailure)
    }

    /// Verify SD Memory Card interface operating condition.
    fn send_if_cond(&self) -> Result<(), ErrorFor<Self>> {
        info!("Verifing SD Memory Card interface operating condition");

        let r7 = self.send_command::<R7_LEN>(commands::CMD8, commands::CMD8_ARG)?;

        if R1Response::from(r7[0]) != R1Response::IN_IDLE_STATE
            || r7[3..] != tokens::CMD8_STATUS[..]
        {
            error!(
                "SD is older than 2.0 or voltage not supported, R7: {:#x} {:#x} {:#x}",
                r7[0], r7[3], r7[4]
            );
            return Err(Error::UnsupportedCard);
        }

        Ok(())
    }

    /// Sends host capacity support information and waits for the card to become ready.
    fn send_op_comd(&self) -> Result<(), ErrorFor<Self>> {
        info!("Sending host capacity support information and activates");

        let mut arg = commands::ACMD41_HCS_ARG;
        let mut attempts = 0usize;

        loop {
            if self.send_command_r1(commands::ACMD41, arg)? == R1Response::READY_STATE {
                debug!("SD ready after {} attempts", attempts + 1);
                return Ok(());
            }

            attempts += 1;
            if let Some(max_attempts) = Config::READY_WAIT_ATTEMPTS {
                if attempts >= max_attempts {
                    error!("SD not ready after {} attempts", attempts);
                    return Err(Error::Timeout);
                }
            }

            arg = commands::STUFF_ARG;
        }
    }

    /// Check the card is high or extended capacity.
    fn check_capacity_class(&self) -> Result<(), ErrorFor<Self>> {
        info!("Checking SD capacity class");

        let r3 = self.send_command::<R3_LEN>(commands::CMD58, commands::STUFF_ARG)?;

        if R1Response::from(r3[0]) != R1Response::READY_STATE {
            warn!("Wrong response from CMD58: {:#x}", r3[0]);
            return Err(Error::ProtocolError);
        }
        if (r3[1] & tokens::CMD58_OCR_CCS) == 0 {
            error!("Only SDHC and SDXC cards are supported");
            return Err(Error::UnsupportedCard);
        }

        Ok(())
    }

    /// Read CSD.
    fn read_csd(&self) -> Result<CsdV2, ErrorFor<Self>> {
        self.send_command_ready(commands::CMD9, commands::STUFF_ARG)?;

        let token = self.wait_for_response()?;
        if token != tokens::DATA_START_BLOCK {
            error!("Failed to read CSD, token: {:#x}", token);
            return Err(Error::ProtocolError);
        }

        let mut csd_block = [FILL; CSD_LEN];
        self.exchange(&mut csd_block)?;

        let mut csd_data: CsdData = Default::default();
        let csd_len = csd_data.len();
        csd_data.copy_from_slice(&csd_block[..csd_len]);

        Ok(CsdV2::from(csd_data))
    }

    /// Initialize SD.
    fn init_card(&mut self) -> Result<(), ErrorFor<Self>> {
        info!("SD initialize started");

        let result = self
            .unselect()
            .and_then(|_| self.exchange(&mut [FILL; CLOCK_SYNC_LEN]))
            .and_then(|_| {
                self.cs_scope(|s| {
                    s.enter_spi_mode()?;
                    s.send_if_cond()?;
                    s.send_op_comd()?;
                    s.check_capacity_class()?;
                    s.read_csd()
                })
            });

        match result {
            Ok(csd) => {
                self.memory_size = csd.card_capacity_bytes();
                self.csd = Some(csd);
                self.status = Status::default();
                info!("SD successfully initialized, size: {} bytes", self.memory_size);

                Ok(())
            }
            Err(err) => {
                error!("Failed to initialize SD");
                self.memory_size = 0;
                self.csd = None;
                self.status = StatusFlag::ErrorOccured | StatusFlag::NotInitialized;

                Err(err)
            }
        }
    }

    /// Validate buffer for block read/write.
    fn validate_buffer_len(buf_len: usize) -> Result<(), DiskioError<ErrorFor<Self>>> {
        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 {
            error!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            Err(DiskioError::InvalidArgument)
        } else {
            Ok(())
        }
    }

    /// Convert lba.
    fn convert_lba(lba: Lba) -> Result<u64, DiskioError<ErrorFor<Self>>> {
        u64::try_from(lba)
            .ok()
            .and_then(|lba| lba.checked_mul(BLOCK_SIZE_U64))
            .ok_or(DiskioError::InvalidArgument)
    }

    /// Wrap a driver error for the [`DiskioDevice`] interface.
    fn diskio_error(err: ErrorFor<Self>) -> DiskioError<ErrorFor<Self>> {
        match err {
            Error::InvalidArgument => DiskioError::InvalidArgument,
            Error::BadState => DiskioError::NotInitialized,
            err => DiskioError::Hardware(err),
        }
    }
}

impl<Spi, Cs, Config> DiskioDevice for SdCard<Spi, Cs, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Config: SdCardConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    type HardwareError = Error<Spi::Error, Cs::Error>;

    fn status(&self) -> Status {
        self.status
    }

    fn reset(&mut self) {
        info!("SD reset invoked");
        self.status = StatusFlag::NotInitialized.into();
        self.csd = None;
        self.memory_size = 0;
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        if !self.status.contains(StatusFlag::NotInitialized) {
            warn!("SD already is initialized");
            return Err(DiskioError::AlreadyInitialized);
        }

        self.init_card().map_err(DiskioError::Hardware)
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        Self::validate_buffer_len(buf.len())?;
        let address = Self::convert_lba(lba)?;

        SdCard::read(self, address, buf).map_err(Self::diskio_error)
    }

    fn write(&self, buf: &[u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        Self::validate_buffer_len(buf.len())?;
        let address = Self::convert_lba(lba)?;

        SdCard::write(self, address, buf).map_err(Self::diskio_error)
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => {
                self.validate_initialized().map_err(Self::diskio_error)?;
                self.cs_scope(|s| s.wait_until_not_busy())
                    .map_err(DiskioError::Hardware)
            }
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = BLOCK_SIZE;
                Ok(())
            }
            _ => Err(DiskioError::NotSupported),
        }
    }
}
