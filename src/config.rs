/// Represents config for [`SdCard`](crate::SdCard).
pub trait SdCardConfig {
    /// Max bytes clocked while waiting for a response or for the card to release busy.
    const RESPONSE_POLL_ATTEMPTS: usize;
    /// Max attempts to enter SPI mode.
    const ENTER_SPI_MODE_ATTEMPTS: usize;
    /// Max `ACMD41` attempts while waiting for the card to leave idle state.
    ///
    /// `None` keeps polling until the card reports ready.
    const READY_WAIT_ATTEMPTS: Option<usize>;
}

/// Default implementation of [`SdCardConfig`](crate::SdCardConfig).
pub struct DefaultSdCardConfig;

impl SdCardConfig for DefaultSdCardConfig {
    const RESPONSE_POLL_ATTEMPTS: usize = 0x1FF_FFFF;
    const ENTER_SPI_MODE_ATTEMPTS: usize = 5;
    const READY_WAIT_ATTEMPTS: Option<usize> = Some(4096);
}

/// Same as [`DefaultSdCardConfig`], but never gives up waiting for the card to become ready.
pub struct UnboundedReadyWaitConfig;

impl SdCardConfig for UnboundedReadyWaitConfig {
    const RESPONSE_POLL_ATTEMPTS: usize = DefaultSdCardConfig::RESPONSE_POLL_ATTEMPTS;
    const ENTER_SPI_MODE_ATTEMPTS: usize = DefaultSdCardConfig::ENTER_SPI_MODE_ATTEMPTS;
    const READY_WAIT_ATTEMPTS: Option<usize> = None;
}
