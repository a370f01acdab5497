use crate::consts::tokens;

use bitfield::bitfield;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illigal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
}

impl R1Response {
    /// Card is ready, no error.
    pub const READY_STATE: Self = Self(0x00);
    /// Card is in idle state, no error.
    pub const IN_IDLE_STATE: Self = Self(0x01);

    /// Raw status byte.
    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl From<u8> for R1Response {
    fn from(status: u8) -> Self {
        Self(status)
    }
}

/// Error reported by the card in place of a read start token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum CardErrorKind {
    /// Unspecified error.
    Generic,
    /// Internal card controller error.
    Controller,
    /// Card internal ECC was applied but failed to correct the data.
    EccFailed,
    /// Argument out of range.
    OutOfRange,
    /// More than one error bit is set.
    Multiple,
}

impl CardErrorKind {
    /// Decodes a data error token, `None` if `token` is not one.
    pub fn from_token(token: u8) -> Option<Self> {
        if token & tokens::ERROR_TOKEN_MASK != 0 {
            return None;
        }

        Some(match token {
            0x01 => CardErrorKind::Generic,
            0x02 => CardErrorKind::Controller,
            0x04 => CardErrorKind::EccFailed,
            0x08 => CardErrorKind::OutOfRange,
            _ => CardErrorKind::Multiple,
        })
    }
}

/// Status of a data response token, sent by the card after each written block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataResponse {
    Accepted,
    CrcError,
    WriteError,
    Unknown(u8),
}

impl From<u8> for DataResponse {
    fn from(token: u8) -> Self {
        match (token & tokens::DATA_RES_MASK) >> 1 {
            0b010 => DataResponse::Accepted,
            0b101 => DataResponse::CrcError,
            0b110 => DataResponse::WriteError,
            _ => DataResponse::Unknown(token),
        }
    }
}
