//! Shared test fixtures: an in-memory transport and a scripted peer that
//! answers like the board controller, down to the toggle discipline and the
//! flash behind it.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use bctrl_host::{Bctrl, Transport};
use bctrl_proto::partition::{BLOCK_COUNT, BLOCK_SIZE};
use bctrl_proto::{frame, Command, DecodeEvent, Decoder, TOGGLE_BIT};

/// Both directions of the simulated line. `from_host` holds complete
/// decoded messages the library wrote; `to_host` holds raw wire bytes
/// waiting to be read.
#[derive(Default)]
pub struct Wire {
    pub to_host: VecDeque<u8>,
    pub from_host: VecDeque<Vec<u8>>,
    decoder: Decoder,
}

impl Wire {
    /// Frame a message and make it readable by the host.
    pub fn queue_msg(&mut self, msg: &[u8]) {
        self.to_host.extend(frame::encode(msg));
    }
}

pub struct TestPort(pub Arc<Mutex<Wire>>);

impl Transport for TestPort {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut w = self.0.lock().unwrap();
        let mut n = 0;
        while n < buf.len() {
            match w.to_host.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn send(&mut self, wire: &[u8]) -> io::Result<()> {
        let mut w = self.0.lock().unwrap();
        for &b in wire {
            if let Some(DecodeEvent::Frame(msg)) = w.decoder.feed(b) {
                w.from_host.push_back(msg);
            }
        }
        Ok(())
    }
}

pub fn new_link() -> (Bctrl, Arc<Mutex<Wire>>) {
    let wire = Arc::new(Mutex::new(Wire::default()));
    let mut bc = Bctrl::open();
    bc.start_with_transport(Box::new(TestPort(Arc::clone(&wire))))
        .unwrap();
    (bc, wire)
}

/// A scripted board controller: acks every host frame, keeps a 4 MiB flash
/// image, and answers flash and log requests. Its indications carry its own
/// alternating toggle, starting at 0 after a SYNC.
pub struct Peer {
    pub flash: Vec<u8>,
    send_toggle: bool,
    /// `(block, entry, wrap)` answered to ring-log position requests.
    pub cursor: (u16, u8, u8),
    pub erases: Vec<u16>,
    pub writes: Vec<(u32, usize)>,
    pub reads: Vec<(u32, u8)>,
}

impl Peer {
    pub fn new() -> Peer {
        Peer {
            flash: vec![0xFF; BLOCK_COUNT * BLOCK_SIZE as usize],
            send_toggle: false,
            cursor: (4, 0, 0xFF),
            erases: Vec::new(),
            writes: Vec::new(),
            reads: Vec::new(),
        }
    }

    fn ack(&mut self, wire: &Arc<Mutex<Wire>>, toggle: bool) {
        let cmd = Command::Ack.id() | if toggle { TOGGLE_BIT } else { 0 };
        wire.lock().unwrap().queue_msg(&[cmd]);
    }

    pub fn indicate(
        &mut self,
        wire: &Arc<Mutex<Wire>>,
        cmd: Command,
        payload: &[u8],
    ) {
        let mut msg =
            vec![cmd.id() | if self.send_toggle { TOGGLE_BIT } else { 0 }];
        msg.extend_from_slice(payload);
        wire.lock().unwrap().queue_msg(&msg);
        self.send_toggle = !self.send_toggle;
    }

    /// Consume everything the host sent, acking and answering in order.
    pub fn process(&mut self, wire: &Arc<Mutex<Wire>>) {
        loop {
            let msg = wire.lock().unwrap().from_host.pop_front();
            let Some(msg) = msg else { break };
            let toggle = msg[0] & TOGGLE_BIT != 0;
            let Some(cmd) = Command::from_wire(msg[0]) else {
                continue;
            };
            if cmd == Command::Ack {
                continue;
            }
            self.ack(wire, toggle);
            match cmd {
                Command::Sync => self.send_toggle = false,
                Command::ReqFlashRead => {
                    let addr = addr24(&msg[1..4]);
                    let len = msg[4];
                    self.reads.push((addr, len));
                    let mut payload = msg[1..5].to_vec();
                    let start = addr as usize;
                    payload.extend_from_slice(
                        &self.flash[start..start + usize::from(len)],
                    );
                    self.indicate(wire, Command::IndFlashRead, &payload);
                }
                Command::ReqFlashWrite => {
                    let addr = addr24(&msg[1..4]);
                    let len = usize::from(msg[4]);
                    self.writes.push((addr, len));
                    let start = addr as usize;
                    self.flash[start..start + len]
                        .copy_from_slice(&msg[5..5 + len]);
                    let mut payload = msg[1..5].to_vec();
                    payload.push(1); // success
                    self.indicate(wire, Command::IndFlashWriteResult, &payload);
                }
                Command::ReqFlashErase => {
                    let block = u16::from_be_bytes([msg[1], msg[2]]);
                    self.erases.push(block);
                    let start = usize::from(block) * BLOCK_SIZE as usize;
                    self.flash[start..start + BLOCK_SIZE as usize].fill(0xFF);
                    self.indicate(
                        wire,
                        Command::IndFlashEraseResult,
                        &[msg[1], msg[2], 1],
                    );
                }
                Command::ReqRinglogPos => {
                    let (block, entry, wrap) = self.cursor;
                    let b = block.to_be_bytes();
                    self.indicate(
                        wire,
                        Command::IndRinglogPos,
                        &[b[0], b[1], entry, wrap],
                    );
                }
                // Everything else is satisfied by the ack alone.
                _ => {}
            }
        }
    }
}

fn addr24(raw: &[u8]) -> u32 {
    u32::from(raw[0]) << 16 | u32::from(raw[1]) << 8 | u32::from(raw[2])
}

/// Alternate the host pump and the peer until both sides are quiet (or the
/// round budget runs out, which a test then catches via its assertions).
pub fn pump(bc: &mut Bctrl, peer: &mut Peer, wire: &Arc<Mutex<Wire>>, rounds: usize) {
    for _ in 0..rounds {
        bc.trigger(64).unwrap();
        peer.process(wire);
        let quiet = {
            let w = wire.lock().unwrap();
            w.to_host.is_empty() && w.from_host.is_empty()
        };
        if quiet && !bc.session_active() {
            // One more trigger so trailing acks get consumed.
            bc.trigger(8).unwrap();
            let w = wire.lock().unwrap();
            if w.to_host.is_empty() && w.from_host.is_empty() {
                break;
            }
        }
    }
}
