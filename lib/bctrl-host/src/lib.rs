//! Host-side library for talking to a BCTRL board controller over a serial
//! line.
//!
//! The controller owns power rails, RTC, GPIO, LEDs, an accelerometer and a
//! raw NOR flash behind a byte-framed, toggle-acknowledged protocol. This
//! crate provides the framed link with its retransmitting ARQ, the request
//! builders, a callback-based completion model, and the state machine that
//! orchestrates multi-step flash operations (partition table, file get/put,
//! ring-log retrieval).
//!
//! The core is single-threaded and cooperative: [`Bctrl::trigger`] is the
//! only place I/O and timer work happen, and every callback fires
//! synchronously from inside it. A typical exchange:
//!
//! ```no_run
//! use bctrl_host::{Baud, Bctrl};
//!
//! let mut bc = Bctrl::open();
//! bc.register_session_cb(|id, ok| println!("session {id}: ok={ok}"));
//! bc.start("/dev/ttyS0", Baud::B921600)?;
//! bc.heartbeat(5)?;
//! loop {
//!     bc.trigger(10)?;
//!     // ... until the session callback reports completion
//! #   break;
//! }
//! # Ok::<(), bctrl_host::Error>(())
//! ```
//!
//! A handle may be driven from a dedicated thread while requests are
//! submitted from another, as long as the caller serializes access (the
//! handle is `Send`, not `Sync`).

mod callbacks;
mod dispatch;
mod error;
mod flash;
mod link;
mod queue;
mod requests;
mod session;
mod transport;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace};

pub use bctrl_proto as proto;

pub use callbacks::*;
pub use error::Error;
pub use flash::{FileId, LogWindow};
pub use session::SessionId;
pub use transport::{Baud, SerialTransport, Transport};

/// Protocol version this library reports when the device asks.
pub const PROTOCOL_VERSION_MAJOR: u8 = 0;
pub const PROTOCOL_VERSION_MINOR: u8 = 1;

/// A handle to one board controller link.
///
/// All state lives here: the transport, link-layer toggles and timers, the
/// two outbound queues, the session slot, the registered callbacks and the
/// flash state machine. Obtain one with [`Bctrl::open`], connect it with
/// [`Bctrl::start`], then submit requests and pump [`Bctrl::trigger`].
pub struct Bctrl {
    pub(crate) transport: Option<Box<dyn Transport>>,
    pub(crate) rx_buf: VecDeque<u8>,
    pub(crate) link: link::Link,
    pub(crate) queues: queue::SendQueues,
    pub(crate) session: session::SessionSlot,
    pub(crate) callbacks: callbacks::Callbacks,
    pub(crate) fsm: flash::FlashFsm,
    pub(crate) xfer: requests::XferState,
    pub(crate) first_sync_pending: bool,
}

impl Default for Bctrl {
    fn default() -> Bctrl {
        Bctrl::open()
    }
}

impl Bctrl {
    /// Create an unconnected handle.
    pub fn open() -> Bctrl {
        Bctrl {
            transport: None,
            rx_buf: VecDeque::new(),
            link: link::Link::new(),
            queues: queue::SendQueues::default(),
            session: session::SessionSlot::new(),
            callbacks: callbacks::Callbacks::default(),
            fsm: flash::FlashFsm::new(),
            xfer: requests::XferState::default(),
            first_sync_pending: false,
        }
    }

    /// Lock and open the serial device and queue the bootstrap SYNC. The
    /// sync runs without a session; its ack fires no callback.
    pub fn start(&mut self, dev: &str, baud: Baud) -> Result<(), Error> {
        let transport = SerialTransport::open(dev, baud)?;
        self.start_with_transport(Box::new(transport))
    }

    /// Like [`Bctrl::start`] on an externally supplied transport. This is
    /// the seam the test suites use to substitute a scripted peer.
    pub fn start_with_transport(
        &mut self,
        transport: Box<dyn Transport>,
    ) -> Result<(), Error> {
        if self.transport.is_some() {
            return Err(Error::WrongState);
        }
        self.transport = Some(transport);
        self.first_sync_pending = true;
        self.queues
            .push_prio(proto::Frame::new(proto::Command::Sync, &[]));
        debug!("link started, bootstrap sync queued");
        Ok(())
    }

    /// Deregister every callback. Queued frames stay queued.
    pub fn stop(&mut self) {
        self.callbacks.clear();
    }

    /// Tear down queues and release the device (and its lock file).
    pub fn close(&mut self) {
        self.queues.clear();
        self.rx_buf.clear();
        self.transport = None;
        debug!("link closed");
    }

    /// Is a host-initiated session currently outstanding?
    pub fn session_active(&self) -> bool {
        self.session.is_active()
    }

    /// Override the ack timeout (defaults to 40 ms, 250 ms in sync mode).
    pub fn set_ack_timeout(&mut self, timeout: Duration) {
        self.link.ack_timeout = timeout;
    }

    /// Override the answer timeout (defaults to 1 s).
    pub fn set_answer_timeout(&mut self, timeout: Duration) {
        self.link.answer_timeout = timeout;
    }

    /// Advance the machine: receive and dispatch pending frames, drain the
    /// outbound queues under the scheduling policy, and service the ack and
    /// answer deadlines. Runs at most `max_loops` rounds, returning early
    /// once fully idle. Callbacks fire from inside this call.
    pub fn trigger(&mut self, max_loops: u32) -> Result<(), Error> {
        if self.transport.is_none() {
            return Err(Error::WrongState);
        }
        for _ in 0..max_loops {
            self.pump_rx()?;

            if !self.link.wait_for_ack {
                if let Some(frame) = self.queues.pop_prio() {
                    trace!("sending from priority queue");
                    self.transmit_tracked(frame, false)?;
                } else if !self.link.wait_for_answer {
                    if let Some(frame) = self.queues.pop_bulk() {
                        trace!("sending from bulk queue");
                        self.transmit_tracked(frame, true)?;
                    }
                }
            }

            let now = Instant::now();
            if self.link.wait_for_answer
                && self.link.answer_at.map_or(false, |t| now > t)
            {
                // No error: the expected indication just stopped gating
                // the bulk queue.
                self.link.wait_for_answer = false;
            }
            if self.link.wait_for_ack
                && self.link.resend_at.map_or(false, |t| now > t)
            {
                self.on_ack_timeout()?;
            }

            if !self.link.wait_for_ack
                && !self.link.wait_for_answer
                && self.queues.is_empty()
            {
                break;
            }
        }
        Ok(())
    }
}
