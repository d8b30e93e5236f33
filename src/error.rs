//! Error type shared by every layer of the controller driver.

use thiserror::Error;

/// Everything a controller operation can fail with.
///
/// Program/erase failures carry the page that failed; detailed reasons (status words, register
/// dumps) only go to the log.
#[derive(Error, Debug)]
pub enum NfcError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("unsupported NAND operation {0:#04x}")]
    InvalidOperation(u8),

    #[error("unsupported configuration: {0}")]
    UnsupportedConfig(String),

    #[error("uncorrectable ECC error on page {page} ({retries} read retries)")]
    Uncorrectable { page: u32, retries: u32 },

    #[error("could not map a DMA buffer, and no bounce buffer is available")]
    DmaMapping,

    #[error("descriptor stream of {0} bytes overflows the descriptor buffer")]
    DescriptorOverflow(usize),

    #[error("program failed on page {0}")]
    ProgramFailed(u32),

    #[error("erase failed on block starting at page {0}")]
    EraseFailed(u32),

    #[error("no flash type matches chip id {0:#06x} / ext id {1:#06x}")]
    UnknownChip(u16, u16),

    #[error("chip select {0} has no attached chip")]
    NotAttached(u8),

    #[error("page {0} is outside the chip")]
    OutOfRange(u32),

    #[error(transparent)]
    Codec(#[from] deku::DekuError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = NfcError> = std::result::Result<T, E>;

impl NfcError {
    /// Is this the hardware failing to respond, as opposed to a data or usage problem?
    pub fn is_timeout(&self) -> bool {
        matches!(self, NfcError::Timeout(_))
    }
}
