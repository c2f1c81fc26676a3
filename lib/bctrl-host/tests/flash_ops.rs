//! Flash orchestration against the scripted peer: partition-table
//! bootstrap and repair, file upload/download round trips, deletion.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bctrl_host::{Bctrl, FileId};
use bctrl_proto::partition::{
    self, Entry, Table, BACKUP_ADDR, KIND_PERS_LOG, KIND_RING_LOG, TABLE_LEN,
};

use common::{new_link, pump, Peer, Wire};

/// The scripted peer answers in the same pump round, so a generous ack
/// timeout keeps a slow test machine from triggering retransmissions.
fn new_flash_link() -> (Bctrl, std::sync::Arc<Mutex<Wire>>) {
    let (mut bc, wire) = new_link();
    bc.set_ack_timeout(Duration::from_secs(5));
    (bc, wire)
}

fn tmp_path(tag: &str) -> String {
    format!(
        "{}/bctrl-test-{tag}-{}",
        std::env::temp_dir().display(),
        std::process::id()
    )
}

fn table_copies(peer: &Peer) -> (&[u8], &[u8]) {
    (
        &peer.flash[..TABLE_LEN],
        &peer.flash[BACKUP_ADDR as usize..BACKUP_ADDR as usize + TABLE_LEN],
    )
}

/// Preformat the peer's flash with the factory table in both copies.
fn format_peer(peer: &mut Peer) {
    let image = Table::new_default().to_bytes();
    peer.flash[..TABLE_LEN].copy_from_slice(&image);
    peer.flash[BACKUP_ADDR as usize..BACKUP_ADDR as usize + TABLE_LEN]
        .copy_from_slice(&image);
}

#[test]
fn partition_request_creates_table_on_blank_flash() {
    let (mut bc, wire) = new_flash_link();
    let mut peer = Peer::new();
    let report = Arc::new(Mutex::new(None));
    let report2 = Arc::clone(&report);
    bc.register_partition_cb(move |entries| {
        *report2.lock().unwrap() = Some(*entries);
    });
    bc.register_session_cb(|_, ok| assert!(ok));

    bc.get_partitiontable().unwrap();
    pump(&mut bc, &mut peer, &wire, 64);

    // Emission order: probe read, backup erase+write, primary erase+write,
    // verification read.
    assert_eq!(peer.reads, vec![(0, 128), (0, 128)]);
    assert_eq!(peer.erases, vec![1, 0]);
    assert_eq!(peer.writes, vec![(4096, 128), (0, 128)]);

    let entries = report.lock().unwrap().unwrap();
    assert_eq!(entries.len(), 20);
    assert_eq!(entries[0].kind(), KIND_RING_LOG);
    assert_eq!((entries[0].start_block, entries[0].length), (4, 508));
    assert_eq!(entries[1].kind(), KIND_PERS_LOG);
    assert_eq!((entries[1].start_block, entries[1].length), (512, 64));
    assert!(entries[2..].iter().all(Entry::is_empty));

    // Both copies must be identical and verifiable.
    let (primary, backup) = table_copies(&peer);
    assert_eq!(primary, backup);
    assert!(partition::has_magic(primary));
}

#[test]
fn damaged_primary_is_restored_from_backup() {
    let (mut bc, wire) = new_flash_link();
    let mut peer = Peer::new();
    format_peer(&mut peer);
    // Scribble over the primary magic only.
    peer.flash[0] = 0x12;
    peer.flash[1] = 0x34;

    let report = Arc::new(Mutex::new(None));
    let report2 = Arc::clone(&report);
    bc.register_partition_cb(move |entries| {
        *report2.lock().unwrap() = Some(*entries);
    });

    bc.get_partitiontable().unwrap();
    pump(&mut bc, &mut peer, &wire, 64);

    // Probe, backup probe, then the repaired primary re-read.
    assert_eq!(peer.reads, vec![(0, 128), (4096, 128), (0, 128)]);
    assert_eq!(peer.erases, vec![0]);
    assert_eq!(peer.writes, vec![(0, 128)]);
    let (primary, backup) = table_copies(&peer);
    assert_eq!(primary, backup);
    assert_eq!(
        report.lock().unwrap().unwrap()[0].kind(),
        KIND_RING_LOG
    );
}

#[test]
fn upload_places_writes_and_rewrites_both_copies() {
    let (mut bc, wire) = new_flash_link();
    let mut peer = Peer::new();
    format_peer(&mut peer);

    let src = tmp_path("fw-src");
    let payload: Vec<u8> = (0..32 * 1024u32).map(|i| (i * 7) as u8).collect();
    std::fs::write(&src, &payload).unwrap();

    let progress = Arc::new(Mutex::new(Vec::new()));
    let progress2 = Arc::clone(&progress);
    bc.register_progress_cb(move |cur, max| {
        progress2.lock().unwrap().push((cur, max));
    });
    let done = Arc::new(Mutex::new(None));
    let done2 = Arc::clone(&done);
    bc.register_session_cb(move |_, ok| *done2.lock().unwrap() = Some(ok));

    bc.upload_firmware(&src).unwrap();
    pump(&mut bc, &mut peer, &wire, 2000);
    assert_eq!(*done.lock().unwrap(), Some(true));

    // The factory table occupies blocks 4..576; the smallest free run
    // starts right after it. 32 KiB = 8 blocks erased, 256 chunk writes,
    // then the table edit erases blocks 1 and 0.
    let data_start = 576 * 4096u32;
    let expected_erases: Vec<u16> = (576..584).chain([1, 0]).collect();
    assert_eq!(peer.erases, expected_erases);
    let data_writes: Vec<_> = peer
        .writes
        .iter()
        .filter(|(a, _)| *a != 0 && *a != 4096)
        .collect();
    assert_eq!(data_writes.len(), 256);
    assert_eq!(data_writes[0].0, data_start);
    assert_eq!(
        &peer.flash[data_start as usize..data_start as usize + payload.len()],
        &payload[..]
    );

    // Progress ends at (32768, 32768).
    assert_eq!(progress.lock().unwrap().last(), Some(&(32768, 32768)));

    // Table updated in both copies, with a byte-sized firmware entry.
    let (primary, backup) = table_copies(&peer);
    assert_eq!(primary, backup);
    let (table, crc_ok) = Table::parse(primary).unwrap();
    assert!(crc_ok);
    let e = table.entries[2];
    assert!(!e.block_sized());
    assert_eq!(e.kind(), partition::FILE_FIRMWARE);
    assert_eq!(e.sub_index(), 0);
    assert_eq!(e.start_block, 576);
    assert_eq!(e.length, 32 * 1024);

    let _ = std::fs::remove_file(&src);
}

#[test]
fn upload_then_download_roundtrips() {
    let (mut bc, wire) = new_flash_link();
    let mut peer = Peer::new();
    format_peer(&mut peer);

    let src = tmp_path("rt-src");
    let dst = tmp_path("rt-dst");
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&src, &payload).unwrap();

    bc.upload_firmware(&src).unwrap();
    pump(&mut bc, &mut peer, &wire, 500);
    assert!(!bc.session_active());

    bc.get_file(
        FileId::Type { code: partition::FILE_FIRMWARE, sub: 0 },
        &dst,
    )
    .unwrap();
    pump(&mut bc, &mut peer, &wire, 500);
    assert!(!bc.session_active());

    assert_eq!(std::fs::read(&dst).unwrap(), payload);
    let _ = std::fs::remove_file(&src);
    let _ = std::fs::remove_file(&dst);
}

#[test]
fn reupload_reuses_the_entry_and_its_blocks() {
    let (mut bc, wire) = new_flash_link();
    let mut peer = Peer::new();
    format_peer(&mut peer);

    let src = tmp_path("reuse-src");
    std::fs::write(&src, vec![0xA5u8; 6000]).unwrap();
    bc.upload_firmware(&src).unwrap();
    pump(&mut bc, &mut peer, &wire, 500);

    std::fs::write(&src, vec![0x5Au8; 6000]).unwrap();
    bc.upload_firmware(&src).unwrap();
    pump(&mut bc, &mut peer, &wire, 500);

    let (table, _) = Table::parse(&peer.flash[..TABLE_LEN]).unwrap();
    // Still one firmware entry, in the same slot, at the same spot (its
    // own blocks were free again for the second placement).
    let fw: Vec<_> = table
        .entries
        .iter()
        .filter(|e| !e.is_empty() && e.kind() == partition::FILE_FIRMWARE)
        .collect();
    assert_eq!(fw.len(), 1);
    assert_eq!(fw[0].start_block, 576);
    assert_eq!(
        peer.flash[576 * 4096..576 * 4096 + 6000],
        vec![0x5Au8; 6000][..]
    );
    let _ = std::fs::remove_file(&src);
}

#[test]
fn delete_clears_entry_in_both_copies() {
    let (mut bc, wire) = new_flash_link();
    let mut peer = Peer::new();
    format_peer(&mut peer);

    let src = tmp_path("del-src");
    std::fs::write(&src, vec![1u8; 100]).unwrap();
    bc.upload_firmware(&src).unwrap();
    pump(&mut bc, &mut peer, &wire, 200);

    let done = Arc::new(Mutex::new(None));
    let done2 = Arc::clone(&done);
    bc.register_session_cb(move |_, ok| *done2.lock().unwrap() = Some(ok));
    bc.delete_file(FileId::Type {
        code: partition::FILE_FIRMWARE,
        sub: 0,
    })
    .unwrap();
    pump(&mut bc, &mut peer, &wire, 64);
    assert_eq!(*done.lock().unwrap(), Some(true));

    let (primary, backup) = table_copies(&peer);
    assert_eq!(primary, backup);
    let (table, crc_ok) = Table::parse(primary).unwrap();
    assert!(crc_ok);
    assert!(table
        .entries
        .iter()
        .all(|e| e.is_empty() || e.kind() != partition::FILE_FIRMWARE
            || e.block_sized()));
}

#[test]
fn oversized_upload_reports_no_space() {
    let (mut bc, wire) = new_flash_link();
    let mut peer = Peer::new();
    format_peer(&mut peer);

    // 448 free blocks remain; ask for more.
    let src = tmp_path("big-src");
    std::fs::write(&src, vec![0u8; 449 * 4096]).unwrap();

    let msgs = Arc::new(Mutex::new(Vec::new()));
    let msgs2 = Arc::clone(&msgs);
    bc.register_error_cb(move |m| msgs2.lock().unwrap().push(m.to_string()));
    bc.upload_firmware(&src).unwrap();
    pump(&mut bc, &mut peer, &wire, 64);

    assert!(msgs
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.contains("no space left")));
    assert!(peer.writes.is_empty());
    let _ = std::fs::remove_file(&src);
}

#[test]
fn flash_ops_refused_while_raw_callbacks_registered() {
    let (mut bc, _wire) = new_link();
    bc.register_flash_read_cb(|_, _| {});
    assert!(matches!(
        bc.get_partitiontable(),
        Err(bctrl_host::Error::CallbackRegistered)
    ));
}
