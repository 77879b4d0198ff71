use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of every session operation.
pub type Status<T = ()> = Result<T, HalError>;

const FAILED_TRANSACTION_CODE: i32 = i32::MIN + 2;

/// Local outcome space shared by precondition, transport and remote failures.
///
/// Each variant maps onto the platform's numeric status codes so the value can
/// be handed back through the legacy command ABI (see [`HalError::code`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum HalError {
    #[error("effect is not initialized")]
    NotInitialized,
    #[error("bad value")]
    BadValue,
    #[error("operation not supported by the effect")]
    InvalidOperation,
    #[error("out of memory")]
    NoMemory,
    #[error("effect reported an invalid state")]
    NotEnoughData,
    #[error("operation would block")]
    WouldBlock,
    #[error("operation timed out")]
    TimedOut,
    #[error("remote effect is gone")]
    DeadObject,
    #[error("transaction with the remote effect failed")]
    FailedTransaction,
    #[error("unknown status {0}")]
    Unknown(i32),
}

impl HalError {
    /// Platform status integer for this error.
    pub fn code(self) -> i32 {
        match self {
            HalError::NotInitialized => -19,
            HalError::BadValue => -22,
            HalError::InvalidOperation => -38,
            HalError::NoMemory => -12,
            HalError::NotEnoughData => -61,
            HalError::WouldBlock => -11,
            HalError::TimedOut => -110,
            HalError::DeadObject => -32,
            HalError::FailedTransaction => FAILED_TRANSACTION_CODE,
            HalError::Unknown(code) => code,
        }
    }

    /// Interprets a platform status integer; `0` is success.
    pub fn from_code(code: i32) -> Status {
        let err = match code {
            0 => return Ok(()),
            -19 => HalError::NotInitialized,
            -22 => HalError::BadValue,
            -38 => HalError::InvalidOperation,
            -12 => HalError::NoMemory,
            -61 => HalError::NotEnoughData,
            -11 => HalError::WouldBlock,
            -110 => HalError::TimedOut,
            -32 => HalError::DeadObject,
            FAILED_TRANSACTION_CODE => HalError::FailedTransaction,
            other => HalError::Unknown(other),
        };
        Err(err)
    }
}

/// Flattens a [`Status`] into the platform integer written into reply slots.
pub fn status_code(status: Status) -> i32 {
    match status {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

/// Result code reported by the remote effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum EffectResult {
    Ok = 0,
    NotInitialized = 1,
    InvalidArguments = 2,
    InvalidState = 3,
    NotSupported = 4,
    ResultTooBig = 5,
}

impl EffectResult {
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Unknown raw values decode as `NotInitialized`.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => EffectResult::Ok,
            2 => EffectResult::InvalidArguments,
            3 => EffectResult::InvalidState,
            4 => EffectResult::NotSupported,
            5 => EffectResult::ResultTooBig,
            _ => EffectResult::NotInitialized,
        }
    }

    pub fn is_ok(self) -> bool {
        self == EffectResult::Ok
    }
}

/// Maps a remote result into the local outcome space.
pub fn analyze_result(result: EffectResult) -> Status {
    match result {
        EffectResult::Ok => Ok(()),
        EffectResult::InvalidArguments => Err(HalError::BadValue),
        EffectResult::InvalidState => Err(HalError::NotEnoughData),
        EffectResult::NotInitialized => Err(HalError::NotInitialized),
        EffectResult::NotSupported => Err(HalError::InvalidOperation),
        EffectResult::ResultTooBig => Err(HalError::NoMemory),
    }
}
