//! Request builders.
//!
//! Every public request composes a frame, queues it, and (when a session
//! callback is registered) opens the session the caller can wait on. No
//! I/O happens here; the trigger pump drains the queues.

use bctrl_proto::rtc::{self, RtcTime};
use bctrl_proto::{Command, Frame, CHUNK, MAX_MSG_LEN};

use crate::error::Error;
use crate::flash::FsmState;
use crate::session::SessionId;
use crate::Bctrl;

/// Host-side bookkeeping for a chunked flash transfer.
#[derive(Default)]
pub(crate) struct XferState {
    pub addr: u32,
    pub pos: usize,
    pub len: u32,
    pub data: Option<Vec<u8>>,
    /// Whether this transfer's messages travel on the bulk queue (state
    /// machine traffic) or the priority queue (explicit user requests).
    pub bulk: bool,
}

impl Bctrl {
    fn ensure_idle(&self) -> Result<(), Error> {
        if self.session.is_active() {
            Err(Error::SessionActive)
        } else {
            Ok(())
        }
    }

    /// Open a session for the request just queued, if the user cares about
    /// completion (i.e. registered a session callback).
    fn begin_session(&mut self) -> Option<SessionId> {
        if self.callbacks.session.is_some() {
            Some(self.session.allocate())
        } else {
            None
        }
    }

    fn simple_request(
        &mut self,
        cmd: Command,
        payload: &[u8],
    ) -> Result<Option<SessionId>, Error> {
        self.ensure_idle()?;
        self.fsm.state = FsmState::User;
        self.queues.push_prio(Frame::new(cmd, payload));
        Ok(self.begin_session())
    }

    /// Reset both toggle directions on the peer.
    pub fn sync(&mut self) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::Sync, &[])
    }

    pub fn req_protocol(&mut self) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqProtocolVersion, &[])
    }

    pub fn req_rtc(&mut self) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqRtcRead, &[])
    }

    /// Set the RTC; the device answers with an RTC indication and bumps its
    /// epoch counter on a backwards step.
    pub fn set_rtc(&mut self, time: &RtcTime) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqRtcSet, &rtc::encode(time))
    }

    /// Arm the watchdog: the device powers the host down if no further
    /// heartbeat arrives within `timeout` seconds.
    pub fn heartbeat(&mut self, timeout: u16) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqHeartbeat, &timeout.to_be_bytes())
    }

    /// Announce shutdown; power drops after `timeout` seconds or once the
    /// host-running line clears.
    pub fn shutdown(&mut self, timeout: u16) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqShutdown, &timeout.to_be_bytes())
    }

    pub fn set_gpo(
        &mut self,
        gpo: u8,
        on: bool,
    ) -> Result<Option<SessionId>, Error> {
        let r = self.simple_request(Command::ReqSetGpo, &[gpo, u8::from(on)])?;
        self.session.ind_closes_session = r.is_some();
        Ok(r)
    }

    /// Set an LED. With `on_time`/`off_time` given (in 1/20 s) the LED
    /// flashes, aligned to the device's minute counter shifted by `phase`.
    pub fn set_led(
        &mut self,
        num: u8,
        color: u8,
        on_time: u8,
        off_time: u8,
        phase: u8,
    ) -> Result<Option<SessionId>, Error> {
        if on_time != 0 || off_time != 0 {
            self.simple_request(
                Command::ReqSetLed,
                &[num, color, on_time, off_time, phase],
            )
        } else {
            self.simple_request(Command::ReqSetLed, &[num, color])
        }
    }

    pub fn get_status(&mut self) -> Result<Option<SessionId>, Error> {
        let r = self.simple_request(Command::ReqStatus, &[])?;
        self.session.ind_closes_session = r.is_some();
        Ok(r)
    }

    pub fn get_id_data(&mut self) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqIdData, &[])
    }

    pub fn eject_hd(&mut self) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqHdEject, &[])
    }

    pub fn hd_power(&mut self, on: bool) -> Result<Option<SessionId>, Error> {
        let r = self.simple_request(Command::ReqHdPower, &[u8::from(on)])?;
        self.session.ind_closes_session = r.is_some();
        Ok(r)
    }

    pub fn gpi_power(&mut self, on: bool) -> Result<Option<SessionId>, Error> {
        let r = self.simple_request(Command::ReqGpiPower, &[u8::from(on)])?;
        self.session.ind_closes_session = r.is_some();
        Ok(r)
    }

    pub fn req_flash_id(&mut self) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqFlashId, &[])
    }

    /// Invalidate the controller firmware so the bootloader takes over on
    /// the next restart.
    pub fn invalidate_fw(&mut self) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqFwInvalidate, &[])
    }

    /// Restart the controller, either immediately (killing host power) or
    /// deferred until host power is off.
    pub fn restart_bctrl(
        &mut self,
        immediate: bool,
    ) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqRestart, &[u8::from(immediate)])
    }

    /// Have the firmware apply a previously uploaded bootloader image.
    pub fn request_bootloader_update(
        &mut self,
    ) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqBootloaderUpdate, &[])
    }

    /// Append a host log entry to the selected log.
    pub fn put_log(
        &mut self,
        ring: bool,
        data: &[u8],
    ) -> Result<Option<SessionId>, Error> {
        if data.len() > MAX_MSG_LEN - 3 {
            return Err(Error::MsgTooLong);
        }
        let mut payload = Vec::with_capacity(data.len() + 2);
        payload.push(u8::from(ring));
        payload.push(data.len() as u8);
        payload.extend_from_slice(data);
        self.simple_request(Command::ReqPutLog, &payload)
    }

    /// Ask for the current ring-log write position.
    pub fn get_pos(&mut self) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqRinglogPos, &[0])
    }

    pub fn clear_log(&mut self) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqClearRinglog, &[])
    }

    pub fn debug_set(
        &mut self,
        addr: u16,
        data: &[u8],
    ) -> Result<Option<SessionId>, Error> {
        if data.len() > MAX_MSG_LEN - 4 {
            return Err(Error::MsgTooLong);
        }
        let mut payload = Vec::with_capacity(data.len() + 3);
        payload.extend_from_slice(&addr.to_be_bytes());
        payload.push(data.len() as u8);
        payload.extend_from_slice(data);
        self.simple_request(Command::ReqDebugSet, &payload)
    }

    pub fn debug_get(&mut self, addr: u16) -> Result<Option<SessionId>, Error> {
        self.simple_request(Command::ReqDebugGet, &addr.to_be_bytes())
    }

    /// Read an arbitrary flash range. The transfer runs in 128-byte chunks
    /// on the priority queue; each chunk arrives through the raw read
    /// callback.
    pub fn req_flash_read(
        &mut self,
        addr: u32,
        len: u32,
    ) -> Result<Option<SessionId>, Error> {
        self.ensure_idle()?;
        self.fsm.state = FsmState::User;
        let session = self.begin_session();
        self.xfer.bulk = false;
        self.schedule_flash_read(addr, len);
        Ok(session)
    }

    /// Write an arbitrary flash range (must be word aligned and erased).
    pub fn req_flash_write(
        &mut self,
        addr: u32,
        data: &[u8],
    ) -> Result<Option<SessionId>, Error> {
        self.ensure_idle()?;
        self.fsm.state = FsmState::User;
        let session = self.begin_session();
        self.xfer.bulk = false;
        self.schedule_flash_write(addr, data)?;
        Ok(session)
    }

    /// Erase one 4 KiB flash block.
    pub fn req_flash_erase_block(
        &mut self,
        block: u16,
    ) -> Result<Option<SessionId>, Error> {
        self.ensure_idle()?;
        self.fsm.state = FsmState::User;
        let session = self.begin_session();
        self.xfer.bulk = false;
        self.enqueue_flash_erase(block);
        Ok(session)
    }

    // ------ internal transfer plumbing shared with the flash FSM ------

    /// Explicit user requests travel on the priority queue; transfers the
    /// flash state machine generates go to the bulk queue so control
    /// traffic can preempt an imaging run.
    fn push_flash(&mut self, frame: Frame) {
        if self.xfer.bulk {
            self.queues.push_bulk(frame);
        } else {
            self.queues.push_prio(frame);
        }
    }

    /// Queue the next read chunk of a larger range and remember the rest.
    pub(crate) fn schedule_flash_read(&mut self, addr: u32, len: u32) {
        let chunk = CHUNK as u32;
        let size = if len >= chunk { chunk } else { len % chunk };
        let mut payload = [0u8; 4];
        payload[..3].copy_from_slice(&addr24(addr));
        payload[3] = size as u8;
        self.push_flash(Frame::new(Command::ReqFlashRead, &payload));
        self.xfer.addr = addr + size;
        self.xfer.len = len - size;
    }

    /// Queue a single write message covering at most one chunk.
    pub(crate) fn enqueue_flash_write_raw(&mut self, addr: u32, data: &[u8]) {
        debug_assert!(data.len() <= CHUNK);
        let mut payload = Vec::with_capacity(4 + data.len());
        payload.extend_from_slice(&addr24(addr));
        payload.push(data.len() as u8);
        payload.extend_from_slice(data);
        self.push_flash(Frame::new(Command::ReqFlashWrite, &payload));
    }

    pub(crate) fn enqueue_flash_erase(&mut self, block: u16) {
        self.push_flash(Frame::new(
            Command::ReqFlashErase,
            &block.to_be_bytes(),
        ));
    }

    /// Begin a chunked raw write: the first message aligns the transfer to
    /// a chunk boundary, the remainder is buffered and fed out one chunk
    /// per write result.
    pub(crate) fn schedule_flash_write(
        &mut self,
        addr: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        if addr % 2 != 0 || data.len() % 2 != 0 {
            return Err(Error::Unspecified);
        }
        let chunk = CHUNK as u32;
        let len = data.len() as u32;
        let size = if addr % chunk != 0 {
            chunk - (addr % chunk)
        } else {
            len.min(chunk)
        };
        let size = size.min(len);
        self.enqueue_flash_write_raw(addr, &data[..size as usize]);
        if len <= size {
            return Ok(());
        }
        self.xfer.addr = addr + size;
        self.xfer.pos = 0;
        self.xfer.len = len - size;
        self.xfer.data = Some(data[size as usize..].to_vec());
        Ok(())
    }

    /// Queue the next chunk of a buffered raw write.
    pub(crate) fn continue_flash_write(&mut self) {
        let chunk = CHUNK as u32;
        let size = self.xfer.len.min(chunk);
        let Some(data) = self.xfer.data.as_ref() else {
            return;
        };
        let slice =
            data[self.xfer.pos..self.xfer.pos + size as usize].to_vec();
        let addr = self.xfer.addr;
        self.enqueue_flash_write_raw(addr, &slice);
        self.xfer.addr += size;
        self.xfer.pos += size as usize;
        self.xfer.len -= size;
    }
}

pub(crate) fn addr24(addr: u32) -> [u8; 3] {
    [
        (addr >> 16 & 0xFF) as u8,
        (addr >> 8 & 0xFF) as u8,
        (addr & 0xFF) as u8,
    ]
}
