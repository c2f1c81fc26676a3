//! Ring-log retrieval: windowing, wrap handling, extension reassembly.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bctrl_host::{Bctrl, LogWindow};
use bctrl_proto::partition::{Table, BACKUP_ADDR, TABLE_LEN};
use bctrl_proto::ringlog::ENTRY_LEN;

use common::{new_link, pump, Peer, Wire};

const RING_START: usize = 4 * 4096;

fn new_log_link() -> (Bctrl, Arc<Mutex<Wire>>) {
    let (mut bc, wire) = new_link();
    bc.set_ack_timeout(Duration::from_secs(5));
    (bc, wire)
}

fn format_peer(peer: &mut Peer) {
    let image = Table::new_default().to_bytes();
    peer.flash[..TABLE_LEN].copy_from_slice(&image);
    peer.flash[BACKUP_ADDR as usize..BACKUP_ADDR as usize + TABLE_LEN]
        .copy_from_slice(&image);
}

/// Write a short record (payload fits in line) at ring entry `pos`.
fn put_record(peer: &mut Peer, pos: usize, event: u8, payload: &[u8]) {
    assert!(payload.len() <= 7);
    let base = RING_START + pos * ENTRY_LEN;
    let slot = &mut peer.flash[base..base + ENTRY_LEN];
    slot.fill(0);
    slot[0] = event;
    // Timestamp: made-up but valid BCD, epoch 1.
    slot[1..8].copy_from_slice(&[0x30, 0x15, 0x12, 0x01, 0x01, 0x08, 0x26]);
    slot[8] = payload.len() as u8;
    slot[9..9 + payload.len()].copy_from_slice(payload);
}

/// Write a record whose payload spills into extension slots.
fn put_long_record(peer: &mut Peer, pos: usize, event: u8, payload: &[u8]) {
    let base = RING_START + pos * ENTRY_LEN;
    {
        let slot = &mut peer.flash[base..base + ENTRY_LEN];
        slot.fill(0);
        slot[0] = event;
        slot[1..8]
            .copy_from_slice(&[0x30, 0x15, 0x12, 0x01, 0x01, 0x08, 0x26]);
        slot[8] = payload.len() as u8;
        slot[9..16].copy_from_slice(&payload[..7]);
    }
    let mut rest = &payload[7..];
    let mut next = pos + 1;
    while !rest.is_empty() {
        let take = rest.len().min(15);
        let base = RING_START + next * ENTRY_LEN;
        let slot = &mut peer.flash[base..base + ENTRY_LEN];
        slot.fill(0);
        slot[0] = 0x01; // extension
        slot[1..1 + take].copy_from_slice(&rest[..take]);
        rest = &rest[take..];
        next += 1;
    }
}

fn collect_log(
    bc: &mut Bctrl,
    wire: &Arc<Mutex<Wire>>,
    peer: &mut Peer,
    window: LogWindow,
) -> Vec<(u32, Vec<u8>)> {
    let got = Arc::new(Mutex::new(Vec::new()));
    let got2 = Arc::clone(&got);
    bc.register_getlog_cb(move |pos, rec| {
        got2.lock().unwrap().push((pos, rec.to_vec()));
    });
    bc.get_log(true, window).unwrap();
    pump(bc, peer, wire, 4000);
    assert!(!bc.session_active(), "log traversal did not terminate");
    let out = got.lock().unwrap().clone();
    out
}

#[test]
fn reads_all_entries_up_to_cursor() {
    let (mut bc, wire) = new_log_link();
    let mut peer = Peer::new();
    format_peer(&mut peer);
    for pos in 0..3 {
        put_record(&mut peer, pos, 0x06, &[pos as u8]);
    }
    peer.cursor = (4, 3, 0xFF); // block 4 = ring start, entry 3, no wrap

    let got = collect_log(&mut bc, &wire, &mut peer, LogWindow::All);
    assert_eq!(got.len(), 3);
    for (i, (pos, rec)) in got.iter().enumerate() {
        assert_eq!(*pos, i as u32);
        assert_eq!(rec[0], 0x06);
        assert_eq!(rec.len(), 10); // event + timestamp + len + 1 byte
        assert_eq!(rec[9], i as u8);
    }
}

#[test]
fn last_n_window_filters_older_entries() {
    let (mut bc, wire) = new_log_link();
    let mut peer = Peer::new();
    format_peer(&mut peer);
    for pos in 0..6 {
        put_record(&mut peer, pos, 0x06, &[pos as u8]);
    }
    peer.cursor = (4, 6, 0xFF);

    let got = collect_log(&mut bc, &wire, &mut peer, LogWindow::Last(2));
    let positions: Vec<u32> = got.iter().map(|(p, _)| *p).collect();
    assert_eq!(positions, vec![4, 5]);
}

#[test]
fn from_n_window_starts_at_absolute_index() {
    let (mut bc, wire) = new_log_link();
    let mut peer = Peer::new();
    format_peer(&mut peer);
    for pos in 0..5 {
        put_record(&mut peer, pos, 0x06, &[pos as u8]);
    }
    peer.cursor = (4, 5, 0xFF);

    let got = collect_log(&mut bc, &wire, &mut peer, LogWindow::From(3));
    let positions: Vec<u32> = got.iter().map(|(p, _)| *p).collect();
    assert_eq!(positions, vec![3, 4]);
}

#[test]
fn long_records_are_reassembled() {
    let (mut bc, wire) = new_log_link();
    let mut peer = Peer::new();
    format_peer(&mut peer);
    let payload: Vec<u8> = (0..30).collect();
    put_long_record(&mut peer, 0, 0x12, &payload);
    // 30 bytes = 7 in line + 15 + 8 in two extensions = 3 slots.
    peer.cursor = (4, 3, 0xFF);

    let got = collect_log(&mut bc, &wire, &mut peer, LogWindow::All);
    assert_eq!(got.len(), 1);
    let (pos, rec) = &got[0];
    assert_eq!(*pos, 0);
    assert_eq!(rec[0], 0x12);
    assert_eq!(rec[8], 30);
    assert_eq!(rec.len(), 39); // 9 header bytes + 30 payload
    assert_eq!(&rec[9..], &payload[..]);
    // No bare extension records leaked out.
    assert!(got.iter().all(|(_, r)| r[0] != 0x01));
}

#[test]
fn wrapped_ring_reads_last_n_across_blocks() {
    let (mut bc, wire) = new_log_link();
    let mut peer = Peer::new();
    format_peer(&mut peer);

    // The ring wrapped; the write position sits at entry 2 of relative
    // block 1 (absolute block 5). Populate the two blocks around it.
    for pos in 0..256 + 2 {
        put_record(&mut peer, pos, 0x06, &[(pos % 251) as u8]);
    }
    peer.cursor = (5, 2, 0xAA);

    let got = collect_log(&mut bc, &wire, &mut peer, LogWindow::Last(5));
    // Five most recent entries, in wall-clock order, ending just before
    // the write position (entry 258 overall).
    let positions: Vec<u32> = got.iter().map(|(p, _)| *p).collect();
    assert_eq!(positions, vec![253, 254, 255, 256, 257]);
}

#[test]
fn empty_ring_terminates_immediately() {
    let (mut bc, wire) = new_log_link();
    let mut peer = Peer::new();
    format_peer(&mut peer);
    peer.cursor = (4, 0, 0xFF);

    let got = collect_log(&mut bc, &wire, &mut peer, LogWindow::All);
    assert!(got.is_empty());
}
