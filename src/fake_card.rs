//! Simulated SDHC card answering on the SPI bus, byte by byte.

use crate::config::SdCardConfig;
use crate::consts::{tokens, BLOCK_SIZE, CRC_LEN};

use std::collections::{HashMap, VecDeque};

use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// Error returned by [`FakeCard`] once `fail_after` exchanges are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault;

/// Small budgets so failing tests finish quickly.
pub struct TestConfig;

impl SdCardConfig for TestConfig {
    const RESPONSE_POLL_ATTEMPTS: usize = 64;
    const ENTER_SPI_MODE_ATTEMPTS: usize = 5;
    const READY_WAIT_ATTEMPTS: Option<usize> = Some(8);
}

/// Error returned by [`FakeCs`] once `fail_off_after` releases are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectFault;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FakeCs {
    pub selected: bool,
    pub selections: usize,
    pub releases: usize,
    /// Releases that succeed before the switch fails.
    pub fail_off_after: Option<usize>,
}

impl OutputSwitch for FakeCs {
    type Error = SelectFault;

    fn on(&mut self) -> Result<(), Self::Error> {
        self.selected = true;
        self.selections += 1;
        Ok(())
    }

    fn off(&mut self) -> Result<(), Self::Error> {
        if self.fail_off_after.map_or(false, |after| self.releases >= after) {
            return Err(SelectFault);
        }

        self.selected = false;
        self.releases += 1;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum Mode {
    Command,
    ReadMultiple { next_block: u32 },
    AwaitToken { block: u32, multiple: bool },
    Data { block: u32, multiple: bool, data: Vec<u8> },
}

pub struct FakeCard {
    /// Card size is `(c_size + 1) * 512 KiB`.
    pub c_size: u32,
    /// High capacity card.
    pub ccs: bool,
    /// Overrides the check pattern echoed by CMD8.
    pub if_cond_echo: Option<u8>,
    /// CMD0 is answered with ready state this many times.
    pub cmd0_failures: usize,
    /// ACMD41 is answered with idle state this many times, `None` forever.
    pub ready_after: Option<usize>,
    /// Token sent after each written block.
    pub data_response: u8,
    /// Token sent in place of the read start token.
    pub read_error: Option<u8>,
    /// Zero bytes clocked out while programming.
    pub busy_bytes: usize,
    /// Exchanges that succeed before the bus fails.
    pub fail_after: Option<usize>,

    /// Blocks written so far, the rest holds [`FakeCard::pristine`] data.
    pub blocks: HashMap<u32, [u8; BLOCK_SIZE]>,
    /// `(index, argument)` of every command received.
    pub commands: Vec<(u8, u32)>,
    /// Arguments of every ACMD41.
    pub acmd41_args: Vec<u32>,
    /// Block numbers in the order they were programmed.
    pub written: Vec<u32>,
    /// Count of SPI transfers.
    pub exchanges: usize,

    pub(crate) out: VecDeque<u8>,
    pub(crate) frame: Vec<u8>,
    pub(crate) mode: Mode,
    pub(crate) idle: bool,
    pub(crate) app_cmd: bool,
}

impl Default for FakeCard {
    fn default() -> Self {
        FakeCard {
            c_size: 8191,
            ccs: true,
            if_cond_echo: None,
            cmd0_failures: 0,
            ready_after: Some(2),
            data_response: 0x05,
            read_error: None,
            busy_bytes: 3,
            fail_after: None,
            blocks: HashMap::new(),
            commands: Vec::new(),
            acmd41_args: Vec::new(),
            written: Vec::new(),
            exchanges: 0,
            out: VecDeque::new(),
            frame: Vec::new(),
            mode: Mode::Command,
            idle: false,
            app_cmd: false,
        }
    }
}

impl FakeCard {
    /// Content of a block never written.
    pub fn pristine(block: u32) -> [u8; BLOCK_SIZE] {
        core::array::from_fn(|i| (block as usize * 7 + i) as u8 ^ 0x5A)
    }

    /// Current content of `block`.
    pub fn block(&self, block: u32) -> [u8; BLOCK_SIZE] {
        self.blocks
            .get(&block)
            .copied()
            .unwrap_or_else(|| Self::pristine(block))
    }

    /// Indexes of the commands received.
    pub fn command_indexes(&self) -> Vec<u8> {
        self.commands.iter().map(|&(index, _)| index).collect()
    }

    fn r1(&self) -> u8 {
        u8::from(self.idle)
    }

    fn clock(&mut self, input: u8) -> u8 {
        let output = self.next_output();
        self.consume(input);
        output
    }

    fn next_output(&mut self) -> u8 {
        if self.out.is_empty() {
            if let Mode::ReadMultiple { next_block } = self.mode {
                self.queue_block(next_block);
                self.mode = Mode::ReadMultiple {
                    next_block: next_block + 1,
                };
            }
        }

        self.out.pop_front().unwrap_or(0xFF)
    }

    fn queue_block(&mut self, block: u32) {
        self.out.push_back(0xFF);

        if let Some(token) = self.read_error {
            self.out.push_back(token);
            return;
        }

        self.out.push_back(tokens::DATA_START_BLOCK);
        self.out.extend(self.block(block));
        self.out.extend([0x12, 0x34]);
    }

    fn consume(&mut self, input: u8) {
        match std::mem::replace(&mut self.mode, Mode::Command) {
            Mode::AwaitToken { block, multiple } => {
                self.mode = match input {
                    tokens::DATA_START_BLOCK if !multiple => Mode::Data {
                        block,
                        multiple,
                        data: Vec::new(),
                    },
                    tokens::WRITE_MULTIPLE if multiple => Mode::Data {
                        block,
                        multiple,
                        data: Vec::new(),
                    },
                    tokens::STOP_TRAN if multiple => {
                        self.out.extend(vec![tokens::BUSY; self.busy_bytes]);
                        Mode::Command
                    }
                    _ => Mode::AwaitToken { block, multiple },
                }
            }
            Mode::Data {
                block,
                multiple,
                mut data,
            } => {
                data.push(input);

                if data.len() < BLOCK_SIZE + CRC_LEN {
                    self.mode = Mode::Data {
                        block,
                        multiple,
                        data,
                    };
                    return;
                }

                self.out.push_back(self.data_response);
                if self.data_response & 0x1F != 0x05 {
                    return;
                }

                let mut stored = [0u8; BLOCK_SIZE];
                stored.copy_from_slice(&data[..BLOCK_SIZE]);
                self.blocks.insert(block, stored);
                self.written.push(block);
                self.out.extend(vec![tokens::BUSY; self.busy_bytes]);

                if multiple {
                    self.mode = Mode::AwaitToken {
                        block: block + 1,
                        multiple,
                    };
                }
            }
            mode => {
                self.mode = mode;
                self.parse_command(input);
            }
        }
    }

    fn parse_command(&mut self, input: u8) {
        if self.frame.is_empty() && input & 0xC0 != 0x40 {
            return;
        }

        self.frame.push(input);
        if self.frame.len() == 6 {
            let frame = std::mem::take(&mut self.frame);
            let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
            self.execute(frame[0] & 0x3F, arg, frame[5]);
        }
    }

    fn execute(&mut self, index: u8, arg: u32, crc: u8) {
        let app_cmd = std::mem::replace(&mut self.app_cmd, false);
        self.commands.push((index, arg));

        // Trailing fill byte of the frame, then one byte of command response time.
        self.out.clear();
        self.out.extend([0xFF, 0xFF]);

        match index {
            0 if crc != 0x95 => self.out.push_back(0x09),
            0 if self.cmd0_failures > 0 => {
                self.cmd0_failures -= 1;
                self.out.push_back(0x00);
            }
            0 => {
                self.idle = true;
                self.mode = Mode::Command;
                self.out.push_back(self.r1());
            }
            8 if crc != 0x87 => self.out.push_back(0x09),
            8 => {
                let echo = self.if_cond_echo.unwrap_or(arg as u8);
                self.out
                    .extend([self.r1(), 0x00, 0x00, (arg >> 8) as u8 & 0x0F, echo]);
            }
            55 => {
                self.app_cmd = true;
                self.out.push_back(self.r1());
            }
            41 if app_cmd => {
                self.acmd41_args.push(arg);
                if self
                    .ready_after
                    .map_or(false, |after| self.acmd41_args.len() > after)
                {
                    self.idle = false;
                }
                self.out.push_back(self.r1());
            }
            58 => {
                let ocr = if self.ccs { 0xC0 } else { 0x80 };
                self.out.extend([self.r1(), ocr, 0xFF, 0x80, 0x00]);
            }
            9 => {
                let csd = (1u128 << 126) | (u128::from(self.c_size) << 48);
                self.out.extend([self.r1(), 0xFF, tokens::DATA_START_BLOCK]);
                self.out.extend(csd.to_be_bytes());
                self.out.extend([0xAB, 0xCD]);
            }
            12 => {
                self.mode = Mode::Command;
                self.out.push_back(self.r1());
            }
            17 => {
                self.out.push_back(self.r1());
                self.queue_block(arg);
            }
            18 => {
                self.out.push_back(self.r1());
                self.mode = Mode::ReadMultiple { next_block: arg };
            }
            24 | 25 => {
                self.out.push_back(self.r1());
                self.mode = Mode::AwaitToken {
                    block: arg,
                    multiple: index == 25,
                };
            }
            _ => self.out.push_back(self.r1() | 0x04),
        }
    }
}

impl Transfer<u8> for FakeCard {
    type Error = BusFault;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        if self.fail_after.map_or(false, |after| self.exchanges >= after) {
            return Err(BusFault);
        }

        self.exchanges += 1;
        for word in words.iter_mut() {
            *word = self.clock(*word);
        }

        Ok(words)
    }
}
