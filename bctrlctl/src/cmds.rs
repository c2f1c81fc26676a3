//! The command vocabulary and its execution.

use std::fs::File;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Timelike, Utc};
use clap::{Parser, Subcommand};

use bctrl_host::{FileId, LogWindow};
use bctrl_proto::rtc::RtcTime;

use crate::driver::Driver;
use crate::render;

fn parse_num(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{e}"))
}

fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    parse_num(s)?.try_into().map_err(|_| "value too large".to_string())
}

fn parse_u16(s: &str) -> std::result::Result<u16, String> {
    parse_num(s)?.try_into().map_err(|_| "value too large".to_string())
}

fn parse_u8(s: &str) -> std::result::Result<u8, String> {
    parse_num(s)?.try_into().map_err(|_| "value too large".to_string())
}

#[derive(Debug, Clone, Subcommand)]
pub enum Cmd {
    /// Send a SYNC message, resetting both toggle directions.
    Sync,
    /// Request protocol version information.
    Proto,
    /// Read the flash partition table.
    Part,
    /// Read the real-time clock.
    Getrtc,
    /// Set the real-time clock to the given UTC time, or the host clock.
    Setrtc {
        /// Time as "YYYY-MM-DD hh:mm:ss" (UTC).
        time: Option<String>,
    },
    /// Set general-purpose output N (1-4) to state S (0|1).
    Setgpo { gpo: u8, state: u8 },
    /// Set LED N (1-4) to color C (0=off 1=green 2=red 3=orange),
    /// optionally flashing with on/off times and phase shift in 1/20 s.
    Setled {
        num: u8,
        color: u8,
        #[clap(default_value_t = 0)]
        on_time: u8,
        #[clap(default_value_t = 0)]
        off_time: u8,
        #[clap(default_value_t = 0)]
        phase: u8,
    },
    /// Request a status report (inputs, outputs, temperature, voltages).
    Getstatus,
    /// Request the board identity record.
    Getid,
    /// Request the flash chip id.
    Flashid,
    /// Read LEN bytes from flash address ADDR; hexdump or save to a file.
    Rflash {
        #[clap(parse(try_from_str = parse_u32))]
        addr: u32,
        #[clap(parse(try_from_str = parse_u32))]
        len: u32,
        file: Option<String>,
    },
    /// Write a local file to flash address ADDR (range must be erased).
    Wflash {
        #[clap(parse(try_from_str = parse_u32))]
        addr: u32,
        file: String,
    },
    /// Erase 4 KiB flash block N.
    Eflash {
        #[clap(parse(try_from_str = parse_u16))]
        block: u16,
    },
    /// Save the file at partition index I (0-19) to a local file.
    Getfile { index: u8, file: String },
    /// Save file 0xTI (type T, sub-number I) to a local file.
    Gfiletype {
        #[clap(parse(try_from_str = parse_u8))]
        code: u8,
        file: String,
    },
    /// Store a local file under sub-number I with file type T.
    Putfile { index: u8, kind: u8, file: String },
    /// Store a local file as file 0xTI (type T, sub-number I).
    Pfiletype {
        #[clap(parse(try_from_str = parse_u8))]
        code: u8,
        file: String,
    },
    /// Delete the file at partition index I.
    Delfile { index: u8 },
    /// Delete file 0xTI (type T, sub-number I).
    Dfiletype {
        #[clap(parse(try_from_str = parse_u8))]
        code: u8,
    },
    /// Upload a firmware image.
    Fwupload { file: String },
    /// Upload a bootloader image.
    Blupload { file: String },
    /// Have the controller apply an uploaded bootloader image.
    Blupdate,
    /// Invalidate the controller firmware.
    Fwinv,
    /// Restart the board controller once host power is off.
    Restart {
        /// Restart immediately, killing host power.
        #[clap(long)]
        now: bool,
    },
    /// Fetch log entries.
    Getlog {
        /// N >= 0: from entry N on; N < 0: the last N entries; omitted:
        /// everything.
        #[clap(allow_hyphen_values = true)]
        entries: Option<i64>,
        /// Append a raw hexdump to every record.
        #[clap(long)]
        raw: bool,
        /// Write records to a file instead of stdout.
        #[clap(long)]
        out: Option<String>,
        /// Read the persistent log instead of the ring log.
        #[clap(long)]
        persistent: bool,
    },
    /// Write a test log entry with LEN payload bytes.
    Putlog {
        #[clap(default_value_t = 5)]
        len: u8,
    },
    /// Report the ring-log write position.
    Getpos,
    /// Clear the ring log.
    Clearlog,
    /// Eject the hard disk.
    Hdeject,
    /// Switch hard disk power (0|1).
    Hdpower { state: u8 },
    /// Switch GPI power (0|1).
    Gpipower { state: u8 },
    /// Arm the heartbeat watchdog with N seconds timeout.
    Heartbeat { seconds: u16 },
    /// Announce shutdown with N seconds power-off timeout.
    Shutdown { seconds: u16 },
    /// Send a debug/config write to address ADDR with hex-encoded data.
    Debugset {
        #[clap(parse(try_from_str = parse_u16))]
        addr: u16,
        data: Option<String>,
    },
    /// Request debug/config data from address ADDR.
    Debugget {
        #[clap(parse(try_from_str = parse_u16))]
        addr: u16,
    },
    /// Do nothing for N milliseconds (useful in console scripts).
    Wait { millis: u64 },
    /// Read commands from stdin: one per line, `;` separates several on a
    /// line, `quit` ends the session.
    Console,
}

#[derive(Debug, Parser)]
struct ConsoleLine {
    #[clap(subcommand)]
    cmd: Cmd,
}

/// Execute one command to completion.
pub fn run(driver: &mut Driver, cmd: &Cmd) -> Result<()> {
    if let Cmd::Wait { millis } = cmd {
        return driver.settle(Duration::from_millis(*millis));
    }
    driver.arm();
    submit(driver, cmd)?;
    driver.wait()
}

fn submit(driver: &mut Driver, cmd: &Cmd) -> Result<()> {
    let bc = &mut driver.bc;
    match cmd {
        Cmd::Sync => bc.sync()?,
        Cmd::Proto => bc.req_protocol()?,
        Cmd::Getrtc => bc.req_rtc()?,
        Cmd::Setrtc { time } => {
            let t = parse_rtc_arg(time.as_deref())?;
            bc.set_rtc(&t)?
        }
        Cmd::Setgpo { gpo, state } => bc.set_gpo(*gpo, *state != 0)?,
        Cmd::Setled { num, color, on_time, off_time, phase } => {
            bc.set_led(*num, *color, *on_time, *off_time, *phase)?
        }
        Cmd::Getstatus => bc.get_status()?,
        Cmd::Getid => bc.get_id_data()?,
        Cmd::Flashid => bc.req_flash_id()?,
        Cmd::Rflash { addr, len, file } => {
            render::install_raw_flash_callbacks(bc, *addr, file.clone());
            bc.req_flash_read(*addr, *len)?
        }
        Cmd::Wflash { addr, file } => {
            let data = std::fs::read(file)
                .with_context(|| format!("reading {file}"))?;
            render::install_raw_flash_callbacks(bc, *addr, None);
            bc.req_flash_write(*addr, &data)?
        }
        Cmd::Eflash { block } => {
            render::install_raw_flash_callbacks(bc, 0, None);
            bc.req_flash_erase_block(*block)?
        }
        Cmd::Part => {
            bc.unregister_flash_callbacks();
            Some(bc.get_partitiontable()?)
        }
        Cmd::Getfile { index, file } => {
            bc.unregister_flash_callbacks();
            Some(bc.get_file(FileId::Index(*index), file)?)
        }
        Cmd::Gfiletype { code, file } => {
            bc.unregister_flash_callbacks();
            Some(bc.get_file(
                FileId::Type { code: (*code >> 4) & 0xF, sub: *code & 0xF },
                file,
            )?)
        }
        Cmd::Putfile { index, kind, file } => {
            bc.unregister_flash_callbacks();
            Some(bc.put_file(*index, *kind, file)?)
        }
        Cmd::Pfiletype { code, file } => {
            bc.unregister_flash_callbacks();
            Some(bc.put_file_type(*code, file)?)
        }
        Cmd::Delfile { index } => {
            bc.unregister_flash_callbacks();
            Some(bc.delete_file(FileId::Index(*index))?)
        }
        Cmd::Dfiletype { code } => {
            bc.unregister_flash_callbacks();
            Some(bc.delete_file(FileId::Type {
                code: (*code >> 4) & 0xF,
                sub: *code & 0xF,
            })?)
        }
        Cmd::Fwupload { file } => {
            bc.unregister_flash_callbacks();
            Some(bc.upload_firmware(file)?)
        }
        Cmd::Blupload { file } => {
            bc.unregister_flash_callbacks();
            Some(bc.upload_bootloader(file)?)
        }
        Cmd::Blupdate => bc.request_bootloader_update()?,
        Cmd::Fwinv => bc.invalidate_fw()?,
        Cmd::Restart { now } => bc.restart_bctrl(*now)?,
        Cmd::Getlog { entries, raw, out, persistent } => {
            bc.unregister_flash_callbacks();
            let window = match entries {
                None => LogWindow::All,
                Some(n) if *n < 0 => LogWindow::Last((-n) as u32),
                Some(n) => LogWindow::From(*n as u32),
            };
            let raw = *raw;
            let mut sink = out
                .as_deref()
                .map(|p| {
                    File::create(p).with_context(|| format!("creating {p}"))
                })
                .transpose()?;
            bc.register_getlog_cb(move |pos, rec| {
                let line = render::log_record(pos, rec, raw);
                match sink.as_mut() {
                    Some(f) => {
                        let _ = writeln!(f, "{line}");
                    }
                    None => println!("{line}"),
                }
            });
            Some(bc.get_log(!*persistent, window)?)
        }
        Cmd::Putlog { len } => {
            let data: Vec<u8> = (0..*len).collect();
            bc.put_log(true, &data)?
        }
        Cmd::Getpos => bc.get_pos()?,
        Cmd::Clearlog => bc.clear_log()?,
        Cmd::Hdeject => bc.eject_hd()?,
        Cmd::Hdpower { state } => bc.hd_power(*state != 0)?,
        Cmd::Gpipower { state } => bc.gpi_power(*state != 0)?,
        Cmd::Heartbeat { seconds } => bc.heartbeat(*seconds)?,
        Cmd::Shutdown { seconds } => bc.shutdown(*seconds)?,
        Cmd::Debugset { addr, data } => {
            let data = match data.as_deref() {
                Some(s) => {
                    hex::decode(s).context("data must be a hex string")?
                }
                None => Vec::new(),
            };
            bc.debug_set(*addr, &data)?
        }
        Cmd::Debugget { addr } => bc.debug_get(*addr)?,
        Cmd::Wait { .. } | Cmd::Console => unreachable!(),
    };
    Ok(())
}

fn parse_rtc_arg(arg: Option<&str>) -> Result<RtcTime> {
    let t = match arg {
        Some(s) => chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .context("time must look like \"2026-08-01 12:30:00\"")?,
        None => Utc::now().naive_utc(),
    };
    Ok(RtcTime {
        sec: t.second() as u8,
        min: t.minute() as u8,
        hour: t.hour() as u8,
        weekday: t.weekday().num_days_from_sunday() as u8,
        day: t.day() as u8,
        month: t.month() as u8,
        year: t.year() as u16,
    })
}

/// Interactive mode: read commands from stdin until `quit` or EOF.
pub fn console(driver: &mut Driver) -> Result<()> {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        for part in line.split(';') {
            let tokens: Vec<&str> = part.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            if matches!(tokens[0], "quit" | "exit") {
                return Ok(());
            }
            let argv = std::iter::once("bctrlctl").chain(tokens.iter().copied());
            match ConsoleLine::try_parse_from(argv) {
                Ok(ConsoleLine { cmd: Cmd::Console }) => {
                    eprintln!("already in console mode");
                }
                Ok(ConsoleLine { cmd }) => {
                    if let Err(e) = run(driver, &cmd) {
                        eprintln!("error: {e:#}");
                    }
                }
                Err(e) => eprintln!("{e}"),
            }
            if driver.interrupted() {
                return Ok(());
            }
        }
    }
    Ok(())
}
