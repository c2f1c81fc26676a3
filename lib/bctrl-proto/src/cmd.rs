//! The command id table.
//!
//! Command ids occupy the low seven bits of the first message byte; bit 7 is
//! the link-layer toggle and never part of the id. The numeric values are
//! fixed by the device firmware, so they are spelled out and pinned by a
//! test rather than derived.

use crate::TOGGLE_BIT;

/// Debug/config register addresses understood by `ReqDebugSet` and
/// `ReqDebugGet`. Temperature limits are signed bytes in degrees Celsius;
/// the acceleration thresholds are `(g * 256)^2` as a big-endian `u32`.
pub mod debug_addr {
    pub const TEMPLIMIT_POWER_LOW: u16 = 0x0100;
    pub const TEMPLIMIT_POWER_HIGH: u16 = 0x0101;
    pub const TEMPLIMIT_RESET: u16 = 0x0102;
    pub const TEMPLIMIT_HARD_HIGH: u16 = 0x0103;
    pub const ACCEL_THRESHOLD_LOW: u16 = 0x0104;
    pub const ACCEL_THRESHOLD_HIGH: u16 = 0x0105;
}

/// Every command the device and host exchange.
///
/// `Req*` ids originate on the host, `Ind*` ids on the device. `Ack`,
/// `Sync` and `SyncAnswer` belong to the link layer and never reach the
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Ack = 0,
    Sync = 1,
    SyncAnswer = 2,
    ReqProtocolVersion = 3,
    IndProtocolVersion = 4,
    ReqRtcRead = 5,
    IndRtcRead = 6,
    ReqRtcSet = 7,
    ReqFlashId = 8,
    IndFlashId = 9,
    ReqFlashRead = 10,
    IndFlashRead = 11,
    ReqFlashWrite = 12,
    IndFlashWriteResult = 13,
    ReqFlashErase = 14,
    IndFlashEraseResult = 15,
    ReqFwInvalidate = 16,
    IndFwInvalidated = 17,
    ReqRestart = 18,
    IndRestartAccepted = 19,
    ReqSetLed = 20,
    IndFwUpdateStarted = 21,
    ReqBootloaderUpdate = 22,
    IndBootloaderUpdate = 23,
    ReqHeartbeat = 24,
    ReqStatus = 25,
    IndStatus = 26,
    ReqHdEject = 27,
    ReqHdPower = 28,
    ReqGpiPower = 29,
    ReqPutLog = 30,
    IndPutLog = 31,
    ReqRinglogPos = 32,
    IndRinglogPos = 33,
    ReqSetGpo = 36,
    ReqShutdown = 37,
    ReqIdData = 38,
    IndIdData = 39,
    IndKeyProcessing = 44,
    ReqClearRinglog = 45,
    HddOffReq = 50,
    ReqDebugSet = 51,
    ReqDebugGet = 52,
    IndDebugGet = 53,
    IndAccelEvent = 54,
    /// Device-side catch-all for a request it could not parse.
    SyncCmdError = 127,
}

impl Command {
    /// The id as it appears on the wire, without a toggle bit.
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Decode a received command byte, ignoring the toggle bit.
    pub fn from_wire(byte: u8) -> Option<Command> {
        use Command::*;
        Some(match byte & !TOGGLE_BIT {
            0 => Ack,
            1 => Sync,
            2 => SyncAnswer,
            3 => ReqProtocolVersion,
            4 => IndProtocolVersion,
            5 => ReqRtcRead,
            6 => IndRtcRead,
            7 => ReqRtcSet,
            8 => ReqFlashId,
            9 => IndFlashId,
            10 => ReqFlashRead,
            11 => IndFlashRead,
            12 => ReqFlashWrite,
            13 => IndFlashWriteResult,
            14 => ReqFlashErase,
            15 => IndFlashEraseResult,
            16 => ReqFwInvalidate,
            17 => IndFwInvalidated,
            18 => ReqRestart,
            19 => IndRestartAccepted,
            20 => ReqSetLed,
            21 => IndFwUpdateStarted,
            22 => ReqBootloaderUpdate,
            23 => IndBootloaderUpdate,
            24 => ReqHeartbeat,
            25 => ReqStatus,
            26 => IndStatus,
            27 => ReqHdEject,
            28 => ReqHdPower,
            29 => ReqGpiPower,
            30 => ReqPutLog,
            31 => IndPutLog,
            32 => ReqRinglogPos,
            33 => IndRinglogPos,
            36 => ReqSetGpo,
            37 => ReqShutdown,
            38 => ReqIdData,
            39 => IndIdData,
            44 => IndKeyProcessing,
            45 => ReqClearRinglog,
            50 => HddOffReq,
            51 => ReqDebugSet,
            52 => ReqDebugGet,
            53 => IndDebugGet,
            54 => IndAccelEvent,
            127 => SyncCmdError,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The values are part of the device ABI; a re-ordered variant would be
    // silent data corruption, so pin them all.
    #[test]
    fn wire_ids_are_pinned() {
        let pinned = [
            (Command::Ack, 0),
            (Command::Sync, 1),
            (Command::SyncAnswer, 2),
            (Command::ReqProtocolVersion, 3),
            (Command::IndProtocolVersion, 4),
            (Command::ReqRtcRead, 5),
            (Command::IndRtcRead, 6),
            (Command::ReqRtcSet, 7),
            (Command::ReqFlashId, 8),
            (Command::IndFlashId, 9),
            (Command::ReqFlashRead, 10),
            (Command::IndFlashRead, 11),
            (Command::ReqFlashWrite, 12),
            (Command::IndFlashWriteResult, 13),
            (Command::ReqFlashErase, 14),
            (Command::IndFlashEraseResult, 15),
            (Command::ReqFwInvalidate, 16),
            (Command::IndFwInvalidated, 17),
            (Command::ReqRestart, 18),
            (Command::IndRestartAccepted, 19),
            (Command::ReqSetLed, 20),
            (Command::IndFwUpdateStarted, 21),
            (Command::ReqBootloaderUpdate, 22),
            (Command::IndBootloaderUpdate, 23),
            (Command::ReqHeartbeat, 24),
            (Command::ReqStatus, 25),
            (Command::IndStatus, 26),
            (Command::ReqHdEject, 27),
            (Command::ReqHdPower, 28),
            (Command::ReqGpiPower, 29),
            (Command::ReqPutLog, 30),
            (Command::IndPutLog, 31),
            (Command::ReqRinglogPos, 32),
            (Command::IndRinglogPos, 33),
            (Command::ReqSetGpo, 36),
            (Command::ReqShutdown, 37),
            (Command::ReqIdData, 38),
            (Command::IndIdData, 39),
            (Command::IndKeyProcessing, 44),
            (Command::ReqClearRinglog, 45),
            (Command::HddOffReq, 50),
            (Command::ReqDebugSet, 51),
            (Command::ReqDebugGet, 52),
            (Command::IndDebugGet, 53),
            (Command::IndAccelEvent, 54),
            (Command::SyncCmdError, 127),
        ];
        for (cmd, id) in pinned {
            assert_eq!(cmd.id(), id, "{cmd:?}");
            assert_eq!(Command::from_wire(id), Some(cmd));
            // The toggle bit must not change the decoded id.
            assert_eq!(Command::from_wire(id | TOGGLE_BIT), Some(cmd));
        }
    }

    #[test]
    fn unassigned_ids_decode_to_none() {
        for id in [34u8, 35, 40, 43, 46, 49, 55, 126] {
            assert_eq!(Command::from_wire(id), None);
        }
    }
}
