//! Flash orchestration.
//!
//! Multi-step flash operations run as a small state machine driven by
//! incoming read/write indications: partition-table retrieval (with backup
//! repair and create-on-blank), file download/upload with free-space
//! fitting, entry deletion, and wrap-aware ring-log traversal. Every
//! operation starts the same way, by reading the primary partition table,
//! and the per-state step functions take over from there.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::{debug, trace, warn};

use bctrl_proto::partition::{
    self, best_fit, Entry, Table, BACKUP_ADDR, BLOCK_SIZE, ENTRY_COUNT,
    KIND_PERS_LOG, KIND_RING_LOG, PRIMARY_ADDR, TABLE_LEN,
};
use bctrl_proto::ringlog::{
    Cursor, ENTRY_LEN, EV_EMPTY, EV_EXTENSION, FIRST_PAYLOAD, WRAP_NONE,
};
use bctrl_proto::{Command, Frame, CHUNK};

use crate::error::Error;
use crate::session::SessionId;
use crate::Bctrl;

/// Slots per 4 KiB log block.
const ENTRIES_PER_BLOCK: u32 = BLOCK_SIZE / ENTRY_LEN as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FsmState {
    /// No orchestrated operation; indications go to user callbacks.
    User,
    PartitionReq,
    DeleteFile,
    GetFile,
    PutFile,
    GetLog,
}

/// How a file-level operation names its target region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileId {
    /// A partition-table slot, 0..=19.
    Index(u8),
    /// Kind and sub-index. Bit 3 of `code` selects block sizing, bits 2..0
    /// the kind; `sub` is the 4-bit sequence number.
    Type { code: u8, sub: u8 },
}

/// Which part of a log to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogWindow {
    All,
    /// The most recent `n` entries.
    Last(u32),
    /// Everything from absolute entry index `n` to the write position.
    From(u32),
}

/// An in-flight reassembly of a record that spilled into extension slots.
pub(crate) struct Reassembly {
    data: Vec<u8>,
    rest: usize,
    pos: u32,
}

pub(crate) struct FlashFsm {
    pub state: FsmState,
    /// Set while a backup-copy read is outstanding after a damaged primary.
    partition_retry: bool,
    target: FileId,
    path: PathBuf,
    cur_len: u32,
    max_len: u32,
    file_start: u32,
    /// Ring log (true) or persistent log.
    ring: bool,
    window: LogWindow,
    /// First entry index the caller wants to see.
    start_entry: u32,
    /// Device write position, as last published.
    pub cursor: Cursor,
    /// Cursor block relative to the start of the log region.
    rel_block: u16,
    reasm: Option<Reassembly>,
}

impl FlashFsm {
    pub fn new() -> FlashFsm {
        FlashFsm {
            state: FsmState::User,
            partition_retry: false,
            target: FileId::Index(0),
            path: PathBuf::new(),
            cur_len: 0,
            max_len: 0,
            file_start: 0,
            ring: true,
            window: LogWindow::All,
            start_entry: 0,
            cursor: Cursor { block: 0, entry: 0, wrap: WRAP_NONE },
            rel_block: 0,
            reasm: None,
        }
    }
}

impl Bctrl {
    fn ensure_fsm_available(&self) -> Result<(), Error> {
        if self.callbacks.raw_flash_registered() {
            return Err(Error::CallbackRegistered);
        }
        if self.session.is_active() {
            return Err(Error::SessionActive);
        }
        Ok(())
    }

    fn request_partition(&mut self) {
        // Everything the state machine emits is bulk traffic.
        self.xfer.bulk = true;
        self.schedule_flash_read(PRIMARY_ADDR, TABLE_LEN as u32);
    }

    /// Read the partition table and report its twenty entries.
    pub fn get_partitiontable(&mut self) -> Result<SessionId, Error> {
        self.ensure_fsm_available()?;
        let session = self.session.allocate();
        self.fsm.state = FsmState::PartitionReq;
        self.request_partition();
        Ok(session)
    }

    /// Copy a stored file out of flash into `path`.
    pub fn get_file(
        &mut self,
        id: FileId,
        path: &str,
    ) -> Result<SessionId, Error> {
        self.ensure_fsm_available()?;
        validate_file_id(id)?;
        // Create (and truncate) the destination up front so a bad path
        // fails synchronously.
        File::create(path).map_err(|_| Error::InvalidFilename)?;
        let session = self.session.allocate();
        self.fsm.target = id;
        self.fsm.path = PathBuf::from(path);
        self.fsm.state = FsmState::GetFile;
        self.request_partition();
        Ok(session)
    }

    /// Store a local file into flash under the given kind and sub-index.
    pub fn put_file(
        &mut self,
        sub: u8,
        kind: u8,
        path: &str,
    ) -> Result<SessionId, Error> {
        self.put_file_id(FileId::Type { code: kind & 0x7, sub }, path)
    }

    /// `put_file` addressed by a packed type code (bit 3 block-sized).
    pub fn put_file_type(&mut self, code: u8, path: &str) -> Result<SessionId, Error> {
        self.put_file_id(
            FileId::Type { code: code >> 4 & 0xF, sub: code & 0xF },
            path,
        )
    }

    fn put_file_id(&mut self, id: FileId, path: &str) -> Result<SessionId, Error> {
        self.ensure_fsm_available()?;
        let len = File::open(path)
            .and_then(|f| f.metadata())
            .map(|m| m.len())
            .map_err(|_| Error::InvalidFilename)?;
        if len == 0 {
            return Err(Error::InvalidFilename);
        }
        let session = self.session.allocate();
        self.fsm.target = id;
        self.fsm.path = PathBuf::from(path);
        self.fsm.cur_len = 0;
        self.fsm.max_len = len as u32;
        self.fsm.state = FsmState::PutFile;
        self.request_partition();
        Ok(session)
    }

    /// Clear a partition-table entry (both copies are rewritten).
    pub fn delete_file(&mut self, id: FileId) -> Result<SessionId, Error> {
        self.ensure_fsm_available()?;
        validate_file_id(id)?;
        let session = self.session.allocate();
        self.fsm.target = id;
        self.fsm.state = FsmState::DeleteFile;
        self.request_partition();
        Ok(session)
    }

    /// Firmware images always live at sub-index 0.
    pub fn upload_firmware(&mut self, path: &str) -> Result<SessionId, Error> {
        self.put_file(0, partition::FILE_FIRMWARE, path)
    }

    pub fn upload_bootloader(&mut self, path: &str) -> Result<SessionId, Error> {
        self.put_file(0, partition::FILE_BOOTLOADER, path)
    }

    /// Fetch log records. The ring log needs the device's write position
    /// first; the persistent log is linear and goes straight to the
    /// partition table.
    pub fn get_log(
        &mut self,
        ring: bool,
        window: LogWindow,
    ) -> Result<SessionId, Error> {
        self.ensure_fsm_available()?;
        let session = self.session.allocate();
        self.fsm.ring = ring;
        self.fsm.window = window;
        self.fsm.start_entry = 0;
        self.fsm.reasm = None;
        self.fsm.state = FsmState::GetLog;
        if ring {
            self.queues
                .push_prio(Frame::new(Command::ReqRinglogPos, &[0]));
        } else {
            self.fsm.cursor = Cursor { block: 0, entry: 0, wrap: WRAP_NONE };
            self.request_partition();
        }
        Ok(session)
    }

    // ------------- indication entry points -------------

    /// All flash read indications funnel here when no raw callback claimed
    /// them. Handles partition-table repair before state dispatch.
    pub(crate) fn fsm_flash_read(&mut self, addr: u32, data: &[u8]) {
        let mut addr = addr;
        if addr == PRIMARY_ADDR
            && !self.fsm.partition_retry
            && !partition::has_magic(data)
            && !partition::is_blank(data)
        {
            // Damaged rather than erased: see whether the backup survived.
            self.fsm.partition_retry = true;
            self.emit_error("partition table magic damaged, trying backup copy");
            self.schedule_flash_read(BACKUP_ADDR, TABLE_LEN as u32);
            return;
        }
        if addr == BACKUP_ADDR {
            self.fsm.partition_retry = false;
            if partition::has_magic(data) {
                debug!("restoring primary partition table from backup");
                self.enqueue_flash_erase(0);
                self.enqueue_flash_write_raw(PRIMARY_ADDR, data);
                self.request_partition();
                self.emit_error("partition table restored from backup copy");
                return;
            }
            self.emit_error("backup partition table also damaged, proceeding without");
            addr = PRIMARY_ADDR;
        }

        match self.fsm.state {
            FsmState::PartitionReq => self.got_partition(addr, data),
            FsmState::DeleteFile => self.delete_step(addr, data),
            FsmState::GetFile => self.get_file_step(addr, data),
            FsmState::PutFile => self.put_file_step(addr, data),
            FsmState::GetLog => self.get_log_step(addr, data),
            FsmState::User => {
                self.emit_error("no consumer for flash read indication");
                self.close_session(true);
            }
        }
    }

    pub(crate) fn fsm_flash_write_result(
        &mut self,
        addr: u32,
        len: u8,
        result: u8,
    ) {
        match self.fsm.state {
            FsmState::PartitionReq => {
                // Table creation in flight, the re-read follows.
            }
            FsmState::DeleteFile => {
                if result == 0 {
                    self.fsm.state = FsmState::User;
                    self.emit_error("deleting flash file failed");
                    self.close_session(false);
                } else if addr == PRIMARY_ADDR {
                    // The primary copy is the last write of the edit.
                    self.fsm.state = FsmState::User;
                    self.emit_error("flash file deleted");
                    self.close_session(true);
                }
            }
            FsmState::PutFile => {
                if result != 0 {
                    if addr != PRIMARY_ADDR && addr != BACKUP_ADDR {
                        self.fsm.cur_len += u32::from(len);
                    }
                    let (cur, max) = (self.fsm.cur_len, self.fsm.max_len);
                    if let Some(cb) = self.callbacks.progress.as_mut() {
                        cb(cur, max);
                    }
                    if addr == PRIMARY_ADDR && cur == max {
                        self.fsm.state = FsmState::User;
                        self.emit_error("flash file stored");
                        self.close_session(true);
                    }
                } else {
                    self.fsm.state = FsmState::User;
                    self.emit_error("flash write failed");
                    self.close_session(false);
                }
            }
            // Repair traffic rewriting the table during a read operation.
            FsmState::GetFile | FsmState::GetLog
                if addr == PRIMARY_ADDR || addr == BACKUP_ADDR => {}
            _ => {
                self.emit_error("no consumer for flash write result");
                self.close_session(true);
            }
        }
    }

    /// A ring-log position arrived while an operation is in flight.
    pub(crate) fn logpos_step(&mut self) {
        match self.fsm.state {
            FsmState::GetLog => self.request_partition(),
            _ => {
                self.emit_error("no consumer for log position indication");
                self.close_session(true);
            }
        }
    }

    // ------------- per-state step functions -------------

    /// Queue the flash writes recreating both copies of the factory table.
    fn create_partition(&mut self) {
        let image = Table::new_default().to_bytes();
        self.enqueue_flash_erase(1);
        self.enqueue_flash_write_raw(BACKUP_ADDR, &image);
        self.enqueue_flash_erase(0);
        self.enqueue_flash_write_raw(PRIMARY_ADDR, &image);
    }

    fn got_partition(&mut self, addr: u32, data: &[u8]) {
        if addr != PRIMARY_ADDR {
            self.emit_error("partition table read from wrong flash range");
            self.close_session(true);
            return;
        }
        if data.len() < partition::USED_LEN {
            self.emit_error("partition table is too short");
            self.close_session(true);
            return;
        }
        let table = match self.parse_table(data) {
            Some(t) => t,
            None => {
                // Nothing usable in either copy: write a fresh table, then
                // read it back so the report reflects what flash now holds.
                self.create_partition();
                self.request_partition();
                self.emit_error("no partition table in flash, creating a new one");
                return;
            }
        };
        self.fsm.state = FsmState::User;
        if let Some(cb) = self.callbacks.partition.as_mut() {
            cb(&table.entries);
        }
        self.close_session(true);
    }

    fn delete_step(&mut self, addr: u32, data: &[u8]) {
        if addr != PRIMARY_ADDR {
            self.emit_error("partition table read from wrong flash range");
            self.close_session(true);
            return;
        }
        let Some(mut table) = self.parse_table(data) else {
            self.emit_error("no partition table in flash");
            self.close_session(true);
            return;
        };
        match self.fsm.target {
            FileId::Index(i) => {
                table.entries[usize::from(i)] = Entry::EMPTY;
            }
            FileId::Type { code, sub } => {
                if let Some(i) = find_entry(&table, code, sub) {
                    table.entries[i] = Entry::EMPTY;
                }
            }
        }
        self.rewrite_table(&table);
    }

    fn get_file_step(&mut self, addr: u32, data: &[u8]) {
        if addr != PRIMARY_ADDR {
            self.store_file_chunk(addr, data);
            return;
        }
        let Some(table) = self.parse_table(data) else {
            self.emit_error("no partition table in flash");
            self.close_session(true);
            return;
        };
        let entry = match self.fsm.target {
            FileId::Index(i) => Some(table.entries[usize::from(i)]),
            FileId::Type { code, sub } => {
                find_entry(&table, code, sub).map(|i| table.entries[i])
            }
        };
        let entry = entry.unwrap_or(Entry::EMPTY);
        if entry.is_empty() || entry.length == 0 {
            self.emit_error(if entry.is_empty() {
                "invalid flash file, empty entry"
            } else {
                "invalid flash file, size zero"
            });
            self.close_session(true);
            self.fsm.state = FsmState::User;
            return;
        }
        self.fsm.cur_len = 0;
        self.fsm.file_start = entry.start_addr();
        self.fsm.max_len = entry.byte_len();
        debug!(
            "reading flash file: {:#x}..{:#x}",
            self.fsm.file_start,
            self.fsm.file_start + self.fsm.max_len
        );
        let (start, len) = (self.fsm.file_start, self.fsm.max_len);
        self.schedule_flash_read(start, len);
    }

    /// Append one downloaded chunk to the destination file.
    fn store_file_chunk(&mut self, addr: u32, data: &[u8]) {
        let result = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.fsm.path)
            .and_then(|mut f| {
                f.seek(SeekFrom::Start(u64::from(addr - self.fsm.file_start)))?;
                f.write_all(data)
            });
        if let Err(e) = result {
            warn!("writing {} failed: {e}", self.fsm.path.display());
            self.emit_error("writing flash data to local file failed");
            self.close_session(true);
            self.fsm.state = FsmState::User;
            return;
        }
        self.fsm.cur_len += data.len() as u32;
        let (cur, max) = (self.fsm.cur_len, self.fsm.max_len);
        if let Some(cb) = self.callbacks.progress.as_mut() {
            cb(cur, max);
        }
        if cur == max {
            self.fsm.state = FsmState::User;
            self.emit_error("flash file read complete");
            self.close_session(true);
        } else {
            let (addr, len) = (self.xfer.addr, self.xfer.len);
            self.schedule_flash_read(addr, len);
        }
    }

    fn put_file_step(&mut self, addr: u32, data: &[u8]) {
        if addr != PRIMARY_ADDR {
            self.emit_error("partition table read from wrong flash range");
            self.close_session(true);
            return;
        }
        let Some(mut table) = self.parse_table(data) else {
            self.emit_error("no partition table in flash");
            self.close_session(true);
            return;
        };
        let FileId::Type { code, sub } = self.fsm.target else {
            // put_file always addresses by kind.
            self.close_session(true);
            return;
        };

        // Find the slot to fill. An entry of the same kind and sub-index is
        // reused; clearing it first frees its old blocks for the new
        // placement.
        let mut slot = None;
        for i in 0..ENTRY_COUNT {
            if slot.is_none() && table.entries[i].is_empty() {
                slot = Some(i);
            }
            if entry_matches(&table.entries[i], code, sub) {
                slot = Some(i);
                table.entries[i].type_info = 0xFF;
            }
        }
        let Some(slot) = slot else {
            self.emit_error("storing flash file failed, partition table full");
            self.close_session(true);
            self.fsm.state = FsmState::User;
            return;
        };

        let busy = table.busy_blocks();
        let required = ((self.fsm.max_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE) as usize;
        let Some(start_block) = best_fit(&busy, required) else {
            self.emit_error("storing flash file failed, no space left");
            self.close_session(true);
            self.fsm.state = FsmState::User;
            return;
        };
        debug!(
            "placing {} byte(s) at block {start_block} ({required} block(s)), entry {slot}",
            self.fsm.max_len
        );

        // Stream the file into erase and write messages on the bulk queue.
        let mut src = match File::open(&self.fsm.path) {
            Ok(f) => f,
            Err(_) => {
                self.emit_error("opening source file failed");
                self.close_session(true);
                self.fsm.state = FsmState::User;
                return;
            }
        };
        let mut buf = [0u8; CHUNK];
        let mut offset = 0u32;
        while offset < self.fsm.max_len {
            if offset % BLOCK_SIZE == 0 {
                let block = start_block + (offset / BLOCK_SIZE) as u16;
                self.enqueue_flash_erase(block);
            }
            let len = (self.fsm.max_len - offset).min(CHUNK as u32) as usize;
            if src.read_exact(&mut buf[..len]).is_err() {
                self.emit_error("short read from source file");
                self.close_session(true);
                self.fsm.state = FsmState::User;
                return;
            }
            let addr = u32::from(start_block) * BLOCK_SIZE + offset;
            self.enqueue_flash_write_raw(addr, &buf[..len]);
            offset += len as u32;
        }

        table.entries[slot] = Entry {
            type_info: Entry::type_byte(false, code & 0x7, sub),
            start_block,
            length: self.fsm.max_len,
        };
        self.rewrite_table(&table);
    }

    // ------------- log traversal -------------

    fn get_log_step(&mut self, addr: u32, data: &[u8]) {
        if addr != PRIMARY_ADDR {
            self.scan_log_chunk(addr, data);
            return;
        }
        let Some(table) = self.parse_table(data) else {
            self.emit_error("no partition table in flash");
            self.fsm.state = FsmState::User;
            self.close_session(true);
            return;
        };
        let kind = if self.fsm.ring { KIND_RING_LOG } else { KIND_PERS_LOG };
        let Some(entry) = table
            .entries
            .iter()
            .find(|e| e.block_sized() && e.kind() == kind)
            .copied()
        else {
            self.emit_error("log partition entry missing");
            self.close_session(true);
            self.fsm.state = FsmState::User;
            return;
        };
        self.fsm.file_start = entry.start_addr();
        self.fsm.max_len = entry.byte_len();
        self.fsm.rel_block = if self.fsm.ring {
            self.fsm.cursor.block.saturating_sub(entry.start_block)
        } else {
            0
        };
        let start_addr = self.log_start_addr();
        trace!(
            "log window {:?}: start entry {}, first read at {:#x}",
            self.fsm.window,
            self.fsm.start_entry,
            self.fsm.file_start + start_addr
        );
        let target = self.fsm.file_start + start_addr;
        self.schedule_flash_read(target, CHUNK as u32);
    }

    /// Translate the requested window into the byte offset of the first
    /// 128-byte read, aligning down and accounting for wrap.
    fn log_start_addr(&mut self) -> u32 {
        let total = self.fsm.max_len / ENTRY_LEN as u32;
        let curr = u32::from(self.fsm.rel_block) * ENTRIES_PER_BLOCK
            + u32::from(self.fsm.cursor.entry);
        // A window at least as large as the whole log means everything.
        let window = match self.fsm.window {
            LogWindow::Last(n) if n >= total => LogWindow::All,
            LogWindow::From(n) if n >= total => LogWindow::All,
            w => w,
        };
        if self.fsm.cursor.wrap == WRAP_NONE {
            // Never wrapped: the log physically begins at offset zero.
            match window {
                LogWindow::All => 0,
                LogWindow::Last(n) => {
                    if n >= curr {
                        self.fsm.start_entry = 0;
                        0
                    } else {
                        self.fsm.start_entry = curr - n;
                        (self.fsm.start_entry * ENTRY_LEN as u32) & !0x7F
                    }
                }
                LogWindow::From(n) => {
                    if n >= curr {
                        self.fsm.start_entry = 0;
                        0
                    } else {
                        self.fsm.start_entry = n;
                        (self.fsm.start_entry * ENTRY_LEN as u32) & !0x7F
                    }
                }
            }
        } else {
            match window {
                LogWindow::All => {
                    // The oldest data begins right after the cursor block.
                    let blocks = self.fsm.max_len / BLOCK_SIZE;
                    let next =
                        (u32::from(self.fsm.rel_block) + 1) % blocks;
                    let start_addr = next * BLOCK_SIZE;
                    self.fsm.start_entry = start_addr / ENTRY_LEN as u32;
                    start_addr
                }
                LogWindow::Last(n) => {
                    if n > curr {
                        // Part of the window lies before the wrap point.
                        let rest = n - curr;
                        let from = total - 1 - rest;
                        self.start_addr_wrapped(from, curr)
                    } else {
                        self.start_addr_wrapped(curr - n, curr)
                    }
                }
                LogWindow::From(n) => self.start_addr_wrapped(n, curr),
            }
        }
    }

    /// Wrapped-ring start address for a requested first entry `from`,
    /// rolling over to the oldest valid entry when `from` no longer exists.
    fn start_addr_wrapped(&mut self, from: u32, curr: u32) -> u32 {
        if from >= curr {
            let blocks = self.fsm.max_len / BLOCK_SIZE;
            let next_entry = ((u32::from(self.fsm.rel_block) + 1) % blocks)
                * ENTRIES_PER_BLOCK;
            if next_entry == 0 {
                // Cursor sat in the last block; the ring starts at zero.
                self.fsm.start_entry = 0;
                0
            } else if next_entry < from {
                // The requested entry lives in the upper part of the ring.
                self.fsm.start_entry = from;
                (from * ENTRY_LEN as u32) & !0x7F
            } else {
                // Requested entry was overwritten; start at the oldest.
                self.fsm.start_entry = next_entry;
                next_entry * ENTRY_LEN as u32
            }
        } else {
            self.fsm.start_entry = from;
            (from * ENTRY_LEN as u32) & !0x7F
        }
    }

    /// Walk one 128-byte read worth of log slots.
    fn scan_log_chunk(&mut self, addr: u32, data: &[u8]) {
        let cursor_addr = self.fsm.file_start
            + u32::from(self.fsm.rel_block) * BLOCK_SIZE
            + u32::from(self.fsm.cursor.entry) * ENTRY_LEN as u32;
        let pos_base = (addr - self.fsm.file_start) / ENTRY_LEN as u32;

        let mut i = 0;
        while i + ENTRY_LEN <= data.len() {
            let slot = &data[i..i + ENTRY_LEN];
            let pos = pos_base + (i / ENTRY_LEN) as u32;
            match slot[0] {
                EV_EMPTY => {
                    // The write position ends the traversal; the linear
                    // persistent log ends at its first empty slot.
                    if !self.fsm.ring || addr + i as u32 == cursor_addr {
                        self.fsm.state = FsmState::User;
                        self.close_session(true);
                        return;
                    }
                }
                EV_EXTENSION => self.scan_extension(pos, slot),
                _ => {
                    let plen = usize::from(slot[8]);
                    if slot[1] != 0xFF && plen > FIRST_PAYLOAD {
                        // Record spills into extension slots; start
                        // collecting.
                        self.fsm.reasm = Some(Reassembly {
                            data: slot.to_vec(),
                            rest: plen - FIRST_PAYLOAD,
                            pos,
                        });
                    } else {
                        self.emit_log_entry(pos, plen + 9, slot);
                    }
                }
            }
            i += ENTRY_LEN;
        }

        let next = addr + CHUNK as u32;
        if next == cursor_addr {
            self.fsm.state = FsmState::User;
            self.close_session(true);
        } else if next == self.fsm.file_start + self.fsm.max_len {
            // End of the region: continue at the start of the ring.
            let start = self.fsm.file_start;
            self.schedule_flash_read(start, CHUNK as u32);
        } else {
            self.schedule_flash_read(next, CHUNK as u32);
        }
    }

    fn scan_extension(&mut self, pos: u32, slot: &[u8]) {
        match self.fsm.reasm.as_mut() {
            None => {
                // An extension with nothing to extend; pass it through so
                // nothing silently disappears.
                self.emit_log_entry(pos, ENTRY_LEN, slot);
            }
            Some(r) if r.rest > ENTRY_LEN - 1 => {
                r.data.extend_from_slice(&slot[1..]);
                r.rest -= ENTRY_LEN - 1;
            }
            Some(r) => {
                let rest = r.rest;
                r.data.extend_from_slice(&slot[1..1 + rest]);
                if let Some(done) = self.fsm.reasm.take() {
                    let len = usize::from(done.data[8]) + 9;
                    self.emit_log_entry(done.pos, len, &done.data);
                }
            }
        }
    }

    /// Deliver one record, unless it predates the caller's start position
    /// (wrap-aware comparison against the device cursor).
    fn emit_log_entry(&mut self, pos: u32, len: usize, record: &[u8]) {
        let start = self.fsm.start_entry;
        if self.fsm.cursor.wrap == WRAP_NONE {
            if pos < start {
                return;
            }
        } else {
            let curr = u32::from(self.fsm.rel_block) * ENTRIES_PER_BLOCK
                + u32::from(self.fsm.cursor.entry);
            if curr > start {
                if pos < start {
                    return;
                }
            } else if curr < pos && pos < start {
                return;
            }
        }
        let len = len.min(record.len());
        if let Some(cb) = self.callbacks.getlog.as_mut() {
            cb(pos, &record[..len]);
        }
    }

    // ------------- shared helpers -------------

    /// Parse a table image, reporting CRC damage without refusing the data
    /// (salvage over halt, the device is no stricter).
    fn parse_table(&mut self, data: &[u8]) -> Option<Table> {
        match Table::parse(data) {
            Ok((table, crc_ok)) => {
                if !crc_ok {
                    self.emit_error("CRC error in flash partition table");
                }
                Some(table)
            }
            Err(_) => None,
        }
    }

    /// Queue a full table edit: backup copy first, then the primary, each
    /// behind its block erase. Both copies are byte-identical afterwards.
    fn rewrite_table(&mut self, table: &Table) {
        let image = table.to_bytes();
        self.enqueue_flash_erase(1);
        self.enqueue_flash_write_raw(BACKUP_ADDR, &image);
        self.enqueue_flash_erase(0);
        self.enqueue_flash_write_raw(PRIMARY_ADDR, &image);
    }
}

fn validate_file_id(id: FileId) -> Result<(), Error> {
    match id {
        FileId::Index(i) if usize::from(i) >= ENTRY_COUNT => {
            Err(Error::Unspecified)
        }
        _ => Ok(()),
    }
}

fn entry_matches(e: &Entry, code: u8, sub: u8) -> bool {
    e.kind() == code & 0x7
        && e.block_sized() == (code & 0x8 != 0)
        && e.sub_index() == sub
}

fn find_entry(table: &Table, code: u8, sub: u8) -> Option<usize> {
    table.entries.iter().position(|e| entry_matches(e, code, sub))
}
