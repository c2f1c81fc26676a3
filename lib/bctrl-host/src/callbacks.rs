//! Callback registration.
//!
//! Completion and unsolicited events are delivered through optional hooks,
//! invoked synchronously from within [`Bctrl::trigger`]. Which flash hooks
//! are registered also selects the operating mode: with raw flash callbacks
//! installed the library hands every flash indication straight to the user,
//! and the orchestrated file/log operations refuse to run.

use bctrl_proto::partition::{Entry, ENTRY_COUNT};
use bctrl_proto::ringlog::Cursor;
use bctrl_proto::rtc::RtcTime;

use crate::session::SessionId;
use crate::Bctrl;

pub type ErrorCb = Box<dyn FnMut(&str) + Send>;
pub type SessionCb = Box<dyn FnMut(SessionId, bool) + Send>;
/// `(major, minor, fw_running, build_info)`
pub type ProtocolCb = Box<dyn FnMut(u8, u8, u8, &[u8]) + Send>;
/// `(board_id, slot_id, serial)`
pub type IdCb = Box<dyn FnMut(u8, u8, &[u8]) + Send>;
pub type StatusCb = Box<dyn FnMut(&[u8]) + Send>;
pub type RtcCb = Box<dyn FnMut(&RtcTime, u8) + Send>;
/// `(manufacturer, device_id1, device_id2)`
pub type FlashIdCb = Box<dyn FnMut(u8, u8, u8) + Send>;
pub type ReadFlashCb = Box<dyn FnMut(u32, &[u8]) + Send>;
/// `(addr, len, result)`
pub type WriteFlashCb = Box<dyn FnMut(u32, u8, u8) + Send>;
/// `(block, result)`
pub type EraseFlashCb = Box<dyn FnMut(u16, u8) + Send>;
pub type PartitionCb = Box<dyn FnMut(&[Entry; ENTRY_COUNT]) + Send>;
/// `(bytes_done, bytes_total)`
pub type ProgressCb = Box<dyn FnMut(u32, u32) + Send>;
/// `(entry_index, record)` — record is event byte, timestamp, length,
/// payload (reassembled across extension records where needed).
pub type GetLogCb = Box<dyn FnMut(u32, &[u8]) + Send>;
pub type GetPosCb = Box<dyn FnMut(Cursor) + Send>;
/// `(addr, data)`
pub type DebugGetCb = Box<dyn FnMut(u16, &[u8]) + Send>;
/// `(event_type, x, y, z)`
pub type AccelEventCb = Box<dyn FnMut(u8, i16, i16, i16) + Send>;
/// Raw reason byte plus key token, as sent by the device.
pub type HdOffRequestCb = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Default)]
pub(crate) struct Callbacks {
    pub error: Option<ErrorCb>,
    pub session: Option<SessionCb>,
    pub protocol: Option<ProtocolCb>,
    pub id: Option<IdCb>,
    pub rtc: Option<RtcCb>,
    pub status: Option<StatusCb>,
    pub accel: Option<AccelEventCb>,
    pub hd_off: Option<HdOffRequestCb>,
    pub flash_id: Option<FlashIdCb>,
    pub read_flash: Option<ReadFlashCb>,
    pub write_flash: Option<WriteFlashCb>,
    pub erase_flash: Option<EraseFlashCb>,
    pub partition: Option<PartitionCb>,
    pub progress: Option<ProgressCb>,
    pub getlog: Option<GetLogCb>,
    pub getpos: Option<GetPosCb>,
    pub debug_get: Option<DebugGetCb>,
}

impl Callbacks {
    /// Raw flash mode and the orchestrated operations are mutually
    /// exclusive.
    pub fn raw_flash_registered(&self) -> bool {
        self.read_flash.is_some()
            || self.write_flash.is_some()
            || self.erase_flash.is_some()
    }

    pub fn clear(&mut self) {
        *self = Callbacks::default();
    }
}

impl Bctrl {
    /// Drop the three raw flash hooks, switching the handle back to
    /// orchestrated flash operations.
    pub fn unregister_flash_callbacks(&mut self) {
        self.callbacks.read_flash = None;
        self.callbacks.write_flash = None;
        self.callbacks.erase_flash = None;
    }

    pub fn register_error_cb(&mut self, f: impl FnMut(&str) + Send + 'static) {
        self.callbacks.error = Some(Box::new(f));
    }

    pub fn register_session_cb(
        &mut self,
        f: impl FnMut(SessionId, bool) + Send + 'static,
    ) {
        self.callbacks.session = Some(Box::new(f));
    }

    pub fn register_protocol_cb(
        &mut self,
        f: impl FnMut(u8, u8, u8, &[u8]) + Send + 'static,
    ) {
        self.callbacks.protocol = Some(Box::new(f));
    }

    pub fn register_id_cb(
        &mut self,
        f: impl FnMut(u8, u8, &[u8]) + Send + 'static,
    ) {
        self.callbacks.id = Some(Box::new(f));
    }

    pub fn register_rtc_cb(
        &mut self,
        f: impl FnMut(&RtcTime, u8) + Send + 'static,
    ) {
        self.callbacks.rtc = Some(Box::new(f));
    }

    pub fn register_status_cb(
        &mut self,
        f: impl FnMut(&[u8]) + Send + 'static,
    ) {
        self.callbacks.status = Some(Box::new(f));
    }

    pub fn register_accel_event_cb(
        &mut self,
        f: impl FnMut(u8, i16, i16, i16) + Send + 'static,
    ) {
        self.callbacks.accel = Some(Box::new(f));
    }

    pub fn register_hd_off_request_cb(
        &mut self,
        f: impl FnMut(&[u8]) + Send + 'static,
    ) {
        self.callbacks.hd_off = Some(Box::new(f));
    }

    pub fn register_flash_id_cb(
        &mut self,
        f: impl FnMut(u8, u8, u8) + Send + 'static,
    ) {
        self.callbacks.flash_id = Some(Box::new(f));
    }

    pub fn register_flash_read_cb(
        &mut self,
        f: impl FnMut(u32, &[u8]) + Send + 'static,
    ) {
        self.callbacks.read_flash = Some(Box::new(f));
    }

    pub fn register_flash_write_cb(
        &mut self,
        f: impl FnMut(u32, u8, u8) + Send + 'static,
    ) {
        self.callbacks.write_flash = Some(Box::new(f));
    }

    pub fn register_flash_erase_cb(
        &mut self,
        f: impl FnMut(u16, u8) + Send + 'static,
    ) {
        self.callbacks.erase_flash = Some(Box::new(f));
    }

    pub fn register_partition_cb(
        &mut self,
        f: impl FnMut(&[Entry; ENTRY_COUNT]) + Send + 'static,
    ) {
        self.callbacks.partition = Some(Box::new(f));
    }

    pub fn register_progress_cb(
        &mut self,
        f: impl FnMut(u32, u32) + Send + 'static,
    ) {
        self.callbacks.progress = Some(Box::new(f));
    }

    pub fn register_getlog_cb(
        &mut self,
        f: impl FnMut(u32, &[u8]) + Send + 'static,
    ) {
        self.callbacks.getlog = Some(Box::new(f));
    }

    pub fn register_getpos_cb(
        &mut self,
        f: impl FnMut(Cursor) + Send + 'static,
    ) {
        self.callbacks.getpos = Some(Box::new(f));
    }

    pub fn register_debug_get_cb(
        &mut self,
        f: impl FnMut(u16, &[u8]) + Send + 'static,
    ) {
        self.callbacks.debug_get = Some(Box::new(f));
    }
}
