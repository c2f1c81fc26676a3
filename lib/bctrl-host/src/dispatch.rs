//! Frame dispatch: decoded messages to typed events.
//!
//! Each handler validates the payload shape against the command's minimum,
//! reports malformed payloads through the error callback (the indication
//! did arrive, so affected sessions still close as success), and either
//! invokes the user's callback or drives the flash state machine when the
//! operation belongs to it.

use log::{trace, warn};

use bctrl_proto::ringlog::Cursor;
use bctrl_proto::{rtc, Command, Frame, TOGGLE_BIT};

use crate::flash::FsmState;
use crate::{Bctrl, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};

impl Bctrl {
    /// Route a message to the error callback and the log.
    pub(crate) fn emit_error(&mut self, msg: &str) {
        warn!("{msg}");
        if let Some(cb) = self.callbacks.error.as_mut() {
            cb(msg);
        }
    }

    /// Close the active session, if any, and tell the user how it went.
    pub(crate) fn close_session(&mut self, success: bool) {
        if let Some(id) = self.session.take() {
            trace!("session {id} closed, success={success}");
            if let Some(cb) = self.callbacks.session.as_mut() {
                cb(id, success);
            }
        }
    }

    pub(crate) fn proc_msg(&mut self, msg: Vec<u8>) {
        let Some(cmd) = Command::from_wire(msg[0]) else {
            self.emit_error(&format!(
                "unknown message id {:#04x} received",
                msg[0] & !TOGGLE_BIT
            ));
            return;
        };
        trace!("dispatch {cmd:?} len={}", msg.len());
        match cmd {
            Command::Ack => self.emit_error("illegal ack message content"),
            Command::SyncCmdError => {
                self.emit_error("device reported a command error")
            }
            Command::ReqProtocolVersion => {
                // The device may probe us; answer with our own version.
                self.queues.push_prio(Frame::new(
                    Command::IndProtocolVersion,
                    &[PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR, 0],
                ));
            }
            Command::IndProtocolVersion => {
                if msg.len() >= 4 {
                    if let Some(cb) = self.callbacks.protocol.as_mut() {
                        cb(msg[1], msg[2], msg[3], &msg[4..]);
                    }
                } else {
                    self.emit_error("short payload in protocol version indication");
                }
                self.close_session(true);
            }
            Command::IndFlashId => {
                if msg.len() >= 4 {
                    if let Some(cb) = self.callbacks.flash_id.as_mut() {
                        cb(msg[1], msg[2], msg[3]);
                    }
                } else {
                    self.emit_error("short payload in flash id indication");
                }
                self.close_session(true);
            }
            Command::IndFlashRead => self.on_flash_read(&msg),
            Command::IndFlashWriteResult => self.on_flash_write_result(&msg),
            Command::IndFlashEraseResult => {
                if msg.len() >= 4 {
                    let block = u16::from_be_bytes([msg[1], msg[2]]);
                    if let Some(cb) = self.callbacks.erase_flash.as_mut() {
                        cb(block, msg[3]);
                    }
                } else {
                    self.emit_error("short payload in flash erase result");
                }
                if self.fsm.state == FsmState::User {
                    self.close_session(true);
                }
            }
            Command::IndRtcRead => {
                if msg.len() >= 9 {
                    let (time, epoch) = rtc::decode(&msg[1..9]);
                    if let Some(cb) = self.callbacks.rtc.as_mut() {
                        cb(&time, epoch);
                    }
                } else {
                    self.emit_error("short payload in RTC indication");
                }
                self.close_session(true);
            }
            Command::IndFwInvalidated => {
                self.emit_error("board controller firmware invalidated");
                self.close_session(true);
            }
            Command::IndRestartAccepted => {
                self.emit_error("board controller restart accepted");
                self.close_session(true);
            }
            Command::IndFwUpdateStarted => {
                self.emit_error("board controller firmware update started");
            }
            Command::IndBootloaderUpdate => {
                if msg.len() >= 2 && msg[1] == 1 {
                    self.emit_error("bootloader update succeeded");
                } else {
                    self.emit_error("bootloader update FAILED");
                }
                self.close_session(true);
            }
            Command::IndIdData => {
                if msg.len() > 3 && self.callbacks.id.is_some() {
                    if let Some(cb) = self.callbacks.id.as_mut() {
                        cb(msg[1], msg[2], &msg[3..]);
                    }
                } else {
                    self.emit_error("id data: no callback or invalid payload");
                }
                self.close_session(true);
            }
            Command::HddOffReq => {
                if msg.len() > 17 {
                    if let Some(cb) = self.callbacks.hd_off.as_mut() {
                        cb(&msg[1..]);
                    }
                } else {
                    self.emit_error("short payload in HDD off request");
                }
            }
            Command::IndStatus => {
                if msg.len() > 1 {
                    if let Some(cb) = self.callbacks.status.as_mut() {
                        cb(&msg[1..]);
                    }
                } else {
                    self.emit_error("short payload in status indication");
                }
                // While an ack is pending this indication is unsolicited
                // traffic, unless a status-answering request explicitly
                // armed it to close the session.
                if !self.link.wait_for_ack || self.session.ind_closes_session
                {
                    self.session.ind_closes_session = false;
                    self.close_session(true);
                }
            }
            Command::IndAccelEvent => {
                if msg.len() > 7 {
                    let x = i16::from_le_bytes([msg[2], msg[3]]);
                    let y = i16::from_le_bytes([msg[4], msg[5]]);
                    let z = i16::from_le_bytes([msg[6], msg[7]]);
                    if let Some(cb) = self.callbacks.accel.as_mut() {
                        cb(msg[1], x, y, z);
                    }
                } else {
                    self.emit_error("short payload in accel event");
                }
            }
            Command::IndDebugGet => {
                if msg.len() >= 4 {
                    let addr = u16::from_be_bytes([msg[1], msg[2]]);
                    let len = usize::from(msg[3]);
                    let end = msg.len().min(4 + len);
                    if let Some(cb) = self.callbacks.debug_get.as_mut() {
                        cb(addr, &msg[4..end]);
                    }
                } else {
                    self.emit_error("short payload in debug get indication");
                }
                self.close_session(true);
            }
            Command::IndRinglogPos => self.on_ringlog_pos(&msg),
            Command::IndPutLog => self.close_session(true),
            _ => {
                self.emit_error(&format!(
                    "unknown message id {:#04x} received",
                    msg[0] & !TOGGLE_BIT
                ));
            }
        }
    }

    fn on_ringlog_pos(&mut self, msg: &[u8]) {
        if msg.len() < 3 {
            self.emit_error("short payload in ring-log position indication");
            return;
        }
        let block = u16::from_be_bytes([msg[1], msg[2]]);
        let (entry, wrap) = if msg.len() >= 5 {
            (msg[3], msg[4])
        } else {
            (0, 0)
        };
        let cursor = Cursor { block, entry, wrap };
        trace!("ring-log cursor {cursor:?}");
        self.fsm.cursor = cursor;
        if self.fsm.state == FsmState::User {
            if let Some(cb) = self.callbacks.getpos.as_mut() {
                cb(cursor);
            }
            self.close_session(true);
        } else {
            self.logpos_step();
        }
    }

    fn on_flash_read(&mut self, msg: &[u8]) {
        let valid =
            msg.len() >= 5 && msg.len() == usize::from(msg[4]) + 5;
        if !valid {
            self.emit_error("short payload in flash read indication");
            self.close_session(true);
            return;
        }
        let addr = u32::from(msg[1]) << 16
            | u32::from(msg[2]) << 8
            | u32::from(msg[3]);
        if self.callbacks.read_flash.is_some() {
            // Raw mode: hand the chunk to the user and keep the transfer
            // rolling until the requested range is exhausted.
            if let Some(cb) = self.callbacks.read_flash.as_mut() {
                cb(addr, &msg[5..]);
            }
            if self.xfer.len > 0 {
                self.schedule_flash_read(self.xfer.addr, self.xfer.len);
            } else {
                self.close_session(true);
            }
        } else {
            self.fsm_flash_read(addr, &msg[5..]);
        }
    }

    fn on_flash_write_result(&mut self, msg: &[u8]) {
        if msg.len() < 6 {
            self.emit_error("short payload in flash write result");
            self.close_session(true);
            return;
        }
        let addr = u32::from(msg[1]) << 16
            | u32::from(msg[2]) << 8
            | u32::from(msg[3]);
        let (len, result) = (msg[4], msg[5]);
        if self.callbacks.write_flash.is_some() {
            if let Some(cb) = self.callbacks.write_flash.as_mut() {
                cb(addr, len, result);
            }
            if self.xfer.len > 0 {
                self.continue_flash_write();
            } else {
                self.xfer.data = None;
                self.close_session(true);
            }
        } else {
            self.fsm_flash_write_result(addr, len, result);
        }
    }
}
