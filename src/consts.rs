/// Size of the data block in bytes.
pub const BLOCK_SIZE: usize = 512;
/// Size of the data block in bytes.
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;
/// Bits of the address inside one block.
pub const BLOCK_BITS: u32 = 9;
/// Mask of the address inside one block.
pub const BLOCK_OFFSET_MASK: u64 = BLOCK_SIZE_U64 - 1;
/// Fill bytes sent with the card deselected before the first command.
pub const CLOCK_SYNC_LEN: usize = 10;
/// Bytes of CRC following every data block.
pub const CRC_LEN: usize = 2;
/// Command frame, including the leading and trailing fill bytes.
pub const CMD_LEN: usize = 8;
/// CSD register block, including its CRC.
pub const CSD_LEN: usize = 18;
/// R1 response length.
pub const R1_LEN: usize = 1;
/// R3 (OCR) response length.
pub const R3_LEN: usize = 5;
/// R7 (interface condition) response length.
pub const R7_LEN: usize = 5;
/// Fill byte clocked out while receiving.
pub const FILL: u8 = 0xFF;

pub mod commands {
    /// CMD base value.
    pub const CMD_BASE: u8 = 0x40;
    /// ACMD flag.
    pub const ACMD_FLAG: u8 = 0x80;
    /// GO_IDLE_STATE - init card in spi mode if CS low.
    pub const CMD0: u8 = CMD_BASE;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = CMD_BASE + 8;
    /// SEND_CSD - read the Card Specific Data (CSD register).
    pub const CMD9: u8 = CMD_BASE + 9;
    /// STOP_TRANSMISSION - end multiple block read sequence.
    pub const CMD12: u8 = CMD_BASE + 12;
    /// READ_SINGLE_BLOCK - read a single data block from the card.
    pub const CMD17: u8 = CMD_BASE + 17;
    /// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card.
    pub const CMD18: u8 = CMD_BASE + 18;
    /// WRITE_BLOCK - write a single data block to the card.
    pub const CMD24: u8 = CMD_BASE + 24;
    /// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION.
    pub const CMD25: u8 = CMD_BASE + 25;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = CMD_BASE + 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = CMD_BASE + 58;
    /// SD_SEND_OP_COMD - Sends host capacity support information and activates
    /// the card's initialization process.
    pub const ACMD41: u8 = CMD_BASE + ACMD_FLAG + 41;

    /// Stuff bits argument.
    pub const STUFF_ARG: u32 = 0x0000_0000;
    /// 2.7-3.6V supply and `0xAA` check pattern.
    pub const CMD8_ARG: u32 = 0x0000_01AA;
    /// Host supports high capacity cards.
    pub const ACMD41_HCS_ARG: u32 = 0x4000_0000;

    /// Valid CRC of CMD0 with stuff argument.
    pub const CMD0_CRC: u8 = 0x95;
    /// Valid CRC of CMD8 with [`CMD8_ARG`].
    pub const CMD8_CRC: u8 = 0x87;
    /// Sent in place of CRC once the card ignores it.
    pub const NO_CRC: u8 = 0xFF;
}

pub mod tokens {
    /// Start data token for read or write single block.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Stop token for write multiple blocks.
    pub const STOP_TRAN: u8 = 0xFD;
    /// Start data token for write multiple blocks.
    pub const WRITE_MULTIPLE: u8 = 0xFC;
    /// Mask for the status bits of a data response token.
    pub const DATA_RES_MASK: u8 = 0x0E;
    /// Mask for the high nibble, zero in a read error token.
    pub const ERROR_TOKEN_MASK: u8 = 0xF0;
    /// Voltage accepted and check pattern echoed by CMD8.
    pub const CMD8_STATUS: [u8; 2] = [0x01, 0xAA];
    /// Card capacity status bit in the first OCR byte.
    pub const CMD58_OCR_CCS: u8 = 0x40;
    /// Card is busy while it clocks out zeros.
    pub const BUSY: u8 = 0x00;
}
