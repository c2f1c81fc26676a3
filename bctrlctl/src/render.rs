//! Presentation: status decoding, partition tables, log records, hexdumps.

use std::fmt::Write as _;
use std::io::Write as _;

use bctrl_host::Bctrl;
use bctrl_proto::partition::{Entry, KIND_PERS_LOG, KIND_RING_LOG};
use bctrl_proto::ringlog::Event;
use bctrl_proto::rtc::bcd2bin;

/// Hook up the standing result printers every command relies on.
pub fn install_default_callbacks(bc: &mut Bctrl) {
    bc.register_protocol_cb(|major, minor, fw_running, build| {
        print!("protocol version {major}.{minor}, firmware running: {fw_running}");
        if !build.is_empty() {
            print!(", build info: {}", String::from_utf8_lossy(build));
        }
        println!();
    });
    bc.register_id_cb(|board, slot, serial| {
        println!(
            "board id {board}, slot {slot}, serial {}",
            hex::encode_upper(serial)
        );
    });
    bc.register_rtc_cb(|t, epoch| {
        println!(
            "rtc: {:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC (epoch {epoch})",
            t.year, t.month, t.day, t.hour, t.min, t.sec
        );
    });
    bc.register_status_cb(|raw| print_status(raw));
    bc.register_accel_event_cb(|kind, x, y, z| {
        let name = if kind == 1 { "THRESHOLD_HIGH" } else { "unknown" };
        println!(
            "accel event {kind} ({name}): x={}mg y={}mg z={}mg",
            to_mg(x),
            to_mg(y),
            to_mg(z)
        );
    });
    bc.register_flash_id_cb(|mid, dev1, dev2| {
        println!("flash id: manufacturer {mid:02X}, device {dev1:02X}{dev2:02X}");
    });
    bc.register_partition_cb(|entries| print_partition_table(entries));
    bc.register_progress_cb(|cur, max| {
        print!("\r{cur} / {max} bytes");
        let _ = std::io::stdout().flush();
        if cur == max {
            println!();
        }
    });
    bc.register_getpos_cb(|cursor| {
        println!(
            "ring-log position: block {:#06x}, entry {:#04x}, wrap flag {:#04x}",
            cursor.block, cursor.entry, cursor.wrap
        );
    });
    bc.register_debug_get_cb(|addr, data| {
        println!("debug data @{addr:#06x}: {}", hex::encode_upper(data));
    });
    bc.register_hd_off_request_cb(|payload| {
        println!(
            "device requests HDD off: reason {:#04x}, token {}",
            payload[0],
            hex::encode_upper(&payload[1..])
        );
    });
}

/// Hooks for the raw flash commands: hexdump or file capture for reads,
/// result lines for writes and erases.
pub fn install_raw_flash_callbacks(
    bc: &mut Bctrl,
    base_addr: u32,
    capture: Option<String>,
) {
    bc.register_flash_read_cb(move |addr, data| match &capture {
        None => hexdump(addr, data),
        Some(path) => {
            use std::io::{Seek, SeekFrom};
            let r = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(path)
                .and_then(|mut f| {
                    f.seek(SeekFrom::Start(u64::from(addr - base_addr)))?;
                    f.write_all(data)
                });
            if let Err(e) = r {
                eprintln!("writing {path} failed: {e}");
            }
        }
    });
    bc.register_flash_write_cb(|addr, len, result| {
        println!("flash write @{addr:#08x} len {len}: result {result:#04x}");
    });
    bc.register_flash_erase_cb(|block, result| {
        println!("flash erase block {block}: result {result:#04x}");
    });
}

pub fn hexdump(base: u32, data: &[u8]) {
    for (i, chunk) in data.chunks(16).enumerate() {
        print!("{:#08x}:", base as usize + i * 16);
        for b in chunk {
            print!(" {b:02X}");
        }
        println!();
    }
}

fn kind_name(e: &Entry) -> String {
    if e.block_sized() {
        match e.kind() {
            KIND_RING_LOG => "ring log".to_string(),
            KIND_PERS_LOG => "persistent log".to_string(),
            0x7 => "free".to_string(),
            k => format!("block type {k}"),
        }
    } else {
        match e.kind() {
            0x0 => "firmware".to_string(),
            0x1 => "bootloader".to_string(),
            0x2 => "u-boot image".to_string(),
            0x3 => "u-boot environment".to_string(),
            0x4 => "board test".to_string(),
            0x5 => "device identity".to_string(),
            k => format!("file type {k}"),
        }
    }
}

fn print_partition_table(entries: &[Entry; 20]) {
    println!("idx  type                 sub  start  length");
    for (i, e) in entries.iter().enumerate() {
        if e.is_empty() {
            println!("{i:>3}  (empty)");
            continue;
        }
        println!(
            "{i:>3}  {:<19}  {:>3}  {:>5}  {} {}",
            kind_name(e),
            e.sub_index(),
            e.start_block,
            e.length,
            if e.block_sized() { "blocks" } else { "bytes" },
        );
    }
}

const SFI_NAMES: [&str; 6] = [
    "ignition",
    "hdd-sense",
    "hdd-usable",
    "host-running",
    "xosc-error",
    "ttu-unlock",
];

fn print_status(raw: &[u8]) {
    println!("status raw: {}", hex::encode_upper(raw));
    if raw.len() < 7 {
        return;
    }
    let mut line = String::new();
    for (bit, name) in SFI_NAMES.iter().enumerate() {
        let set = raw[0] & (1 << bit) != 0;
        let changed = raw[1] & (1 << bit) != 0;
        let _ = write!(
            line,
            "{name}={}{} ",
            u8::from(set),
            if changed { "*" } else { "" }
        );
    }
    println!("inputs:  {line}");
    println!(
        "outputs: gpi-power={} hdd-power={}",
        u8::from(raw[2] & 0x1 != 0),
        u8::from(raw[2] & 0x2 != 0)
    );
    let gpi: Vec<String> =
        (0..6).map(|b| u8::from(raw[3] & (1 << b) != 0).to_string()).collect();
    let gpo: Vec<String> =
        (0..4).map(|b| u8::from(raw[5] & (1 << b) != 0).to_string()).collect();
    println!("gpi 1..6: {}   gpo 1..4: {}", gpi.join(" "), gpo.join(" "));
    println!("rtc temperature: {} C", raw[6] as i8);
    if raw.len() > 13 {
        let accel = |lo: usize| {
            to_mg(i16::from_le_bytes([raw[lo], raw[lo + 1]]))
        };
        println!(
            "accel: x={}mg y={}mg z={}mg",
            accel(8),
            accel(10),
            accel(12)
        );
    }
    if raw.len() > 29 {
        let mut volts = String::new();
        for i in 0..11 {
            let v = i16::from_be_bytes([raw[14 + 2 * i], raw[15 + 2 * i]]);
            let _ = write!(volts, "{:.2}V ", f64::from(v) / 100.0);
        }
        println!("voltages: {volts}");
    }
}

fn to_mg(v: i16) -> i32 {
    i32::from(v) * 1000 / 256
}

const POWER_STATES: [&str; 5] =
    ["unknown", "lithium", "key", "standby", "host"];

fn power_state(v: u8) -> String {
    let main = POWER_STATES
        .get(usize::from(v & 0x07))
        .copied()
        .unwrap_or("invalid");
    let mut opts = Vec::new();
    if v & 0x80 != 0 {
        opts.push("vkey-en");
    }
    if v & 0x40 != 0 {
        opts.push("ext-pwr");
    }
    if v & 0x20 != 0 {
        opts.push("dcdc");
    }
    if v & 0x10 != 0 {
        opts.push("hdd-pwr");
    }
    if v & 0x08 != 0 {
        opts.push("lock-chg");
    }
    if opts.is_empty() {
        main.to_string()
    } else {
        format!("{main}+{}", opts.join("+"))
    }
}

const LOSS_REASONS: [&str; 8] = [
    "vkey too low",
    "vkey low during eject",
    "vkey lock",
    "vkey run",
    "host power failure",
    "main power loss",
    "pre-alert",
    "supercap low",
];

const VOLTAGE_NAMES: [&str; 15] = [
    "power-filter",
    "power-cap",
    "camera",
    "vkey",
    "supercap",
    "12V",
    "5V",
    "3V3",
    "1V8",
    "1V2",
    "1V0",
    "3V3-bctrl",
    "1V5",
    "vterm",
    "vbat",
];

/// Format one log record: position, timestamp, event, parameters.
pub fn log_record(pos: u32, rec: &[u8], raw: bool) -> String {
    let mut out = format!("#{pos:06}");
    if rec.len() >= 9 && rec[0] != 0x01 {
        let _ = write!(
            out,
            "  20{:02}-{:02}-{:02} {:02}:{:02}:{:02} e{}",
            bcd2bin(rec[7]),
            bcd2bin(rec[6] & 0x1F),
            bcd2bin(rec[5]),
            bcd2bin(rec[3] & 0x3F),
            bcd2bin(rec[2]),
            bcd2bin(rec[1]),
            rec[4],
        );
        let payload = &rec[9..];
        let _ = write!(out, "  {}", describe_event(rec[0], payload));
    } else {
        let _ = write!(
            out,
            "  orphaned extension record: {}",
            hex::encode_upper(&rec[1..])
        );
    }
    if raw {
        let _ = write!(out, "  [raw {}]", hex::encode_upper(rec));
    }
    out
}

fn describe_event(code: u8, p: &[u8]) -> String {
    match Event::from_code(code) {
        Some(Event::RamlogOverrun) => "RAM log overrun".to_string(),
        Some(Event::IllegalBoardId) => {
            "illegal board revision id detected".to_string()
        }
        Some(Event::IllegalPowerState) => format!(
            "illegal power state {}",
            p.first().map_or(String::new(), |&v| power_state(v))
        ),
        Some(Event::PowerLoss) => format!(
            "power loss: {}",
            p.first()
                .and_then(|&r| LOSS_REASONS.get(usize::from(r)))
                .copied()
                .unwrap_or("unknown reason")
        ),
        Some(Event::HostEntry) => {
            format!("host entry: {}", hex::encode_upper(p))
        }
        Some(Event::PowerChange) => format!(
            "power state changed to {}",
            p.first().map_or(String::new(), |&v| power_state(v))
        ),
        Some(Event::IllegalInterrupt) => "unknown wakeup interrupt".to_string(),
        Some(Event::HddSenseChange) => format!(
            "hdd sensor changed to {}",
            p.first().map_or(0, |&v| v)
        ),
        Some(Event::KeyDetected) => {
            format!("key detected, serial {}", hex::encode_upper(p))
        }
        Some(Event::KeyRejected) => format!(
            "key rejected, {} token(s) searched",
            p.first().map_or(0, |&v| v)
        ),
        Some(Event::KeySuccess) => format!(
            "key processed, token {}..., {} eject retries",
            hex::encode_upper(&p[..p.len().min(6)]),
            p.get(6).map_or(0, |&v| v)
        ),
        Some(Event::UnlockError) => format!(
            "hdd unlock failed, token {}..., {} eject retries",
            hex::encode_upper(&p[..p.len().min(6)]),
            p.get(6).map_or(0, |&v| v)
        ),
        Some(Event::KeyCommError) => {
            format!("key communication error, code {}", hex::encode_upper(p))
        }
        Some(Event::KeyHeaderError) => {
            format!("key header error, data {}", hex::encode_upper(p))
        }
        Some(Event::RtcSet) => format!(
            "clock set, new time {}",
            if p.len() >= 7 {
                format!(
                    "20{:02}-{:02}-{:02} {:02}:{:02}:{:02}",
                    bcd2bin(p[6]),
                    bcd2bin(p[5] & 0x1F),
                    bcd2bin(p[4]),
                    bcd2bin(p[2]),
                    bcd2bin(p[1]),
                    bcd2bin(p[0]),
                )
            } else {
                hex::encode_upper(p)
            }
        ),
        Some(Event::CommTimeout) => format!(
            "host communication timeout ({})",
            match p.first() {
                Some(0) => "first message",
                Some(1) => "heartbeat",
                Some(2) => "shutdown",
                _ => "unknown",
            }
        ),
        Some(Event::VoltageInfo) => {
            let mut s = "voltages:".to_string();
            for pair in p.chunks_exact(3) {
                let name = VOLTAGE_NAMES
                    .get(usize::from(pair[0]))
                    .copied()
                    .unwrap_or("?");
                let v = i16::from_be_bytes([pair[1], pair[2]]);
                let _ = write!(s, " {name}={:.2}V", f64::from(v) / 100.0);
            }
            s
        }
        Some(Event::LogCleared) => "ring log cleared".to_string(),
        Some(Event::HddUsableOn) => "hdd usable signal on".to_string(),
        Some(Event::FwUpdate) => format!(
            "firmware update {}",
            if p.first() == Some(&1) { "ok" } else { "failed" }
        ),
        Some(Event::BlUpdate) => format!(
            "bootloader update {}",
            if p.first() == Some(&1) { "ok" } else { "failed" }
        ),
        Some(Event::FwReboot) => format!(
            "firmware reboot ({} context reset)",
            if p.first() == Some(&1) { "with" } else { "without" }
        ),
        Some(Event::OvertempOff) => format!(
            "emergency off, temperature {} C",
            p.first().map_or(0, |&v| v as i8)
        ),
        Some(Event::TempLimit) => format!(
            "temperature outside limits: {} C (limits {}..{}, reset {})",
            p.first().map_or(0, |&v| v as i8),
            p.get(1).map_or(0, |&v| v as i8),
            p.get(2).map_or(0, |&v| v as i8),
            p.get(3).map_or(0, |&v| v as i8),
        ),
        Some(Event::AccelEvent) => {
            if p.len() >= 7 {
                format!(
                    "acceleration event {}: x={}mg y={}mg z={}mg",
                    p[0],
                    to_mg(i16::from_le_bytes([p[1], p[2]])),
                    to_mg(i16::from_le_bytes([p[3], p[4]])),
                    to_mg(i16::from_le_bytes([p[5], p[6]])),
                )
            } else {
                format!("acceleration event, data {}", hex::encode_upper(p))
            }
        }
        _ => format!("event {code:#04x}, data {}", hex::encode_upper(p)),
    }
}
