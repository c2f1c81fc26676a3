//! The toggle-bit ARQ link.
//!
//! Exactly-once delivery over the raw byte stream: every non-ack frame
//! carries the sender's one-bit toggle, the receiver acknowledges with the
//! same toggle, and a frame stays buffered for retransmission until its ack
//! arrives. A SYNC exchange resets both directions; a peer answering SYNC
//! with SYNC_ANSWER switches the link into a simplified synchronous mode
//! with no toggle checking and no ack tracking.
//!
//! Receive-path ordering is deliberate: the ack goes out before the payload
//! is dispatched, so the peer observes link progress before any callback
//! side effect, and an ack-induced session close happens before the send
//! toggle flips.

use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use bctrl_proto::{frame, Command, DecodeEvent, Decoder, Frame, FrameError, TOGGLE_BIT};

use crate::error::Error;
use crate::flash::FsmState;
use crate::Bctrl;

/// Ack wait in normal (asynchronous) operation.
pub(crate) const ACK_TIMEOUT: Duration = Duration::from_millis(40);
/// Ack wait once the peer has dropped to synchronous mode.
pub(crate) const SYNC_ACK_TIMEOUT: Duration = Duration::from_millis(250);
/// How long an expected indication may take before bulk sending resumes.
pub(crate) const ANSWER_TIMEOUT: Duration = Duration::from_secs(1);
/// Retransmissions before the exchange is abandoned.
pub(crate) const MAX_REPEAT: u32 = 25;

/// Upper bound of one frame on the wire with every byte escaped.
pub(crate) const WIRE_BUF: usize =
    2 * (bctrl_proto::MAX_MSG_LEN + bctrl_proto::CRC_LEN) + 2;

pub(crate) struct Link {
    pub decoder: Decoder,
    pub send_toggle: bool,
    pub expected_recv_toggle: bool,
    pub wait_for_ack: bool,
    pub wait_for_answer: bool,
    pub sync_mode: bool,
    pub repeat: Option<Frame>,
    pub repeat_count: u32,
    pub ack_timeout: Duration,
    pub answer_timeout: Duration,
    pub resend_at: Option<Instant>,
    pub answer_at: Option<Instant>,
}

impl Link {
    pub fn new() -> Link {
        Link {
            decoder: Decoder::new(),
            send_toggle: false,
            expected_recv_toggle: false,
            wait_for_ack: false,
            wait_for_answer: false,
            sync_mode: false,
            repeat: None,
            repeat_count: 0,
            ack_timeout: ACK_TIMEOUT,
            answer_timeout: ANSWER_TIMEOUT,
            resend_at: None,
            answer_at: None,
        }
    }
}

impl Bctrl {
    /// Read pending bytes and run the decoder over them, handling at most
    /// one complete frame. Remaining buffered bytes are picked up by the
    /// next trigger iteration, so queue scheduling interleaves with frame
    /// processing the same way on every path.
    pub(crate) fn pump_rx(&mut self) -> Result<(), Error> {
        if self.rx_buf.is_empty() {
            let mut chunk = [0u8; WIRE_BUF];
            let n = self
                .transport
                .as_mut()
                .ok_or(Error::WrongState)?
                .recv(&mut chunk)
                .map_err(Error::System)?;
            self.rx_buf.extend(&chunk[..n]);
        }
        while let Some(byte) = self.rx_buf.pop_front() {
            match self.link.decoder.feed(byte) {
                None => {}
                Some(DecodeEvent::Error(e)) => match e {
                    FrameError::UnexpectedStop => {
                        warn!("stop byte outside a frame")
                    }
                    FrameError::TooShort => warn!("received frame too short"),
                    FrameError::TooLong => warn!("received frame too long"),
                    FrameError::Crc => warn!("CRC error on received frame"),
                },
                Some(DecodeEvent::Frame(msg)) => {
                    self.handle_wire_msg(msg)?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn handle_wire_msg(&mut self, msg: Vec<u8>) -> Result<(), Error> {
        let first = msg[0];

        if first & !TOGGLE_BIT == Command::Ack.id() {
            let matches = (first & TOGGLE_BIT != 0) == self.link.send_toggle;
            if matches {
                if self.link.repeat.is_some() {
                    trace!("ack received");
                    // Side effects first: a fire-and-forget request closes
                    // its session before the toggle flips.
                    self.proc_ack();
                    self.link.send_toggle = !self.link.send_toggle;
                    self.link.wait_for_ack = false;
                    self.link.repeat_count = 0;
                    self.link.repeat = None;
                } else {
                    self.emit_error("received unexpected ack");
                }
            } else {
                warn!("ack with stale toggle, retransmitting");
                self.retransmit()?;
            }
            return Ok(());
        }

        if first == Command::SyncAnswer.id() {
            debug!("peer answered SYNC_ANSWER, entering synchronous mode");
            self.link.send_toggle = !self.link.send_toggle;
            self.link.wait_for_ack = false;
            self.link.repeat_count = 0;
            self.link.repeat = None;
            self.link.sync_mode = true;
            self.link.ack_timeout = SYNC_ACK_TIMEOUT;
            return Ok(());
        }

        // A regular message from the peer. Ack it before dispatching.
        let toggle = first & TOGGLE_BIT != 0;
        if !self.link.sync_mode {
            self.send_ack(toggle)?;
        }
        if self.link.sync_mode || toggle == self.link.expected_recv_toggle {
            self.link.expected_recv_toggle = !self.link.expected_recv_toggle;
            if !self.link.wait_for_ack {
                self.link.wait_for_answer = false;
            }
            self.proc_msg(msg);
        } else {
            self.emit_error("toggle bit error");
            self.close_session(false);
            self.fsm.state = FsmState::User;
        }
        if self.link.sync_mode {
            self.link.send_toggle = false;
            self.link.wait_for_ack = false;
            self.link.wait_for_answer = false;
            self.link.repeat_count = 0;
            self.link.repeat = None;
        }
        Ok(())
    }

    /// Stamp, frame and write one message. Non-ack sends arm both the ack
    /// and the answer deadline.
    pub(crate) fn send_frame(&mut self, frame: &mut Frame) -> Result<(), Error> {
        let cmd = frame.command_byte() & !TOGGLE_BIT;
        let is_ack = cmd == Command::Ack.id();
        if !is_ack {
            if cmd == Command::Sync.id() {
                // A sync always travels with toggle 1 and resets the
                // receive direction; its own toggle handling is bypassed.
                self.link.send_toggle = true;
                self.link.expected_recv_toggle = false;
                frame.set_toggle(true);
            } else {
                frame.set_toggle(self.link.send_toggle);
            }
        }
        let wire = frame::encode(frame.bytes());
        trace!("tx frame cmd={:#04x} len={}", frame.command_byte(), wire.len());
        self.transport
            .as_mut()
            .ok_or(Error::WrongState)?
            .send(&wire)
            .map_err(Error::System)?;
        if !is_ack {
            let now = Instant::now();
            self.link.resend_at = Some(now + self.link.ack_timeout);
            self.link.answer_at = Some(now + self.link.answer_timeout);
        }
        Ok(())
    }

    pub(crate) fn send_ack(&mut self, toggle: bool) -> Result<(), Error> {
        let mut ack = Frame::new(Command::Ack, &[]);
        ack.set_toggle(toggle);
        trace!("tx ack toggle={}", u8::from(toggle));
        self.send_frame(&mut ack)
    }

    /// Send a queued frame and take ownership of it for retransmission.
    /// In synchronous mode frames are fire-and-forget.
    pub(crate) fn transmit_tracked(
        &mut self,
        mut frame: Frame,
        from_bulk: bool,
    ) -> Result<(), Error> {
        self.send_frame(&mut frame)?;
        if self.link.sync_mode {
            return Ok(());
        }
        self.link.repeat = Some(frame);
        self.link.wait_for_ack = true;
        if from_bulk {
            self.link.wait_for_answer = true;
        }
        Ok(())
    }

    pub(crate) fn retransmit(&mut self) -> Result<(), Error> {
        if self.link.repeat_count >= MAX_REPEAT {
            return Ok(());
        }
        if let Some(mut f) = self.link.repeat.take() {
            self.send_frame(&mut f)?;
            self.link.repeat = Some(f);
            self.link.repeat_count += 1;
        }
        Ok(())
    }

    /// The ack deadline ran out: retransmit while budget remains, otherwise
    /// give the exchange up and fail the session.
    pub(crate) fn on_ack_timeout(&mut self) -> Result<(), Error> {
        if self.link.repeat_count < MAX_REPEAT && self.link.repeat.is_some() {
            debug!(
                "ack timeout, retransmitting ({} of {MAX_REPEAT})",
                self.link.repeat_count + 1
            );
            self.emit_error("REPEAT sending msg cause ACK timeout");
            self.retransmit()?;
        } else {
            warn!("retransmit budget exhausted, abandoning exchange");
            self.emit_error(
                "ERROR: Sending failed after repeat counter reached maximum",
            );
            self.close_session(false);
            self.link.wait_for_ack = false;
            self.link.repeat_count = 0;
            self.link.repeat = None;
        }
        Ok(())
    }

    fn proc_ack(&mut self) {
        let cmd = self.link.repeat.as_ref().and_then(Frame::command);
        match cmd {
            Some(Command::Sync) => {
                if self.first_sync_pending {
                    // The bootstrap sync runs without a session.
                    self.first_sync_pending = false;
                    return;
                }
                self.close_session(true);
            }
            Some(
                Command::ReqDebugSet
                | Command::ReqHeartbeat
                | Command::ReqSetLed
                | Command::ReqShutdown
                | Command::ReqHdEject,
            ) => self.close_session(true),
            _ => {}
        }
    }
}
