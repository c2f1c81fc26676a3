//! Wire-level types for the BCTRL serial protocol.
//!
//! The board controller speaks a byte-framed request/response protocol over
//! a point-to-point serial line. This crate owns everything that is pure
//! data: the framing codec and its CRC, the command id table, the on-flash
//! partition table format, the 16-byte ring-log record format, and the
//! DS3231-style BCD wall-clock codec. It performs no I/O; the host-side
//! state machines live in `bctrl-host`.

pub mod cmd;
pub mod frame;
pub mod partition;
pub mod ringlog;
pub mod rtc;

pub use cmd::Command;
pub use frame::{DecodeEvent, Decoder, Frame, FrameError};

/// Maximum length of an unframed message (command byte plus payload),
/// excluding the CRC trailer.
pub const MAX_MSG_LEN: usize = 140;

/// Length of the CRC trailer on the wire.
pub const CRC_LEN: usize = 2;

/// Bit 7 of the command byte carries the link-layer toggle.
pub const TOGGLE_BIT: u8 = 0x80;

/// Payload size used for bulk flash transfers. Chosen so that a full chunk
/// plus addressing and CRC still fits one frame.
pub const CHUNK: usize = 128;
