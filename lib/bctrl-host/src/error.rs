//! The library error vocabulary.

use std::fmt;
use std::io;

/// Everything a request or lifecycle function can fail with synchronously.
///
/// Asynchronous failures (retransmit exhaustion, toggle mismatch) are not
/// errors in this sense; they arrive through the session callback with
/// `success = false` plus a message on the error callback.
#[derive(Debug)]
pub enum Error {
    /// An operating-system level failure, carrying the underlying cause.
    System(io::Error),
    Unspecified,
    NoStandbyPower,
    MissingStart,
    MsgTooLong,
    UnexpectedStart,
    MsgTooShort,
    Crc,
    /// Another process holds the lock file for the device.
    DeviceLocked,
    MsgTimeout,
    OutOfMemory,
    /// The handle is not in a state that allows the call (e.g. `start` on a
    /// running handle, `trigger` before `start`).
    WrongState,
    NotInitialized,
    InvalidHandle,
    /// A flash-level operation was requested while raw flash callbacks are
    /// registered; the two modes are mutually exclusive.
    CallbackRegistered,
    InvalidFilename,
    /// A host-initiated session is already outstanding.
    SessionActive,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::System(e) => write!(f, "system error: {e}"),
            Error::Unspecified => f.write_str("unspecified error"),
            Error::NoStandbyPower => f.write_str("no standby power"),
            Error::MissingStart => f.write_str("missing start character"),
            Error::MsgTooLong => f.write_str("message too long"),
            Error::UnexpectedStart => f.write_str("unexpected start character"),
            Error::MsgTooShort => f.write_str("message too short"),
            Error::Crc => f.write_str("message CRC error"),
            Error::DeviceLocked => f.write_str("device locked"),
            Error::MsgTimeout => f.write_str("message timeout"),
            Error::OutOfMemory => f.write_str("out of memory"),
            Error::WrongState => f.write_str("wrong state"),
            Error::NotInitialized => f.write_str("not initialized"),
            Error::InvalidHandle => f.write_str("invalid handle"),
            Error::CallbackRegistered => {
                f.write_str("raw flash callbacks registered")
            }
            Error::InvalidFilename => f.write_str("invalid filename"),
            Error::SessionActive => f.write_str("session active"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::System(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::System(e)
    }
}
