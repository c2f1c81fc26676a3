//! Serial transport and the device lock.
//!
//! The link layer only needs two things from the wire: pull whatever bytes
//! have arrived without blocking, and push one framed message in a single
//! burst. That seam is the [`Transport`] trait; [`SerialTransport`] is the
//! production implementation, and the test suites substitute scripted
//! doubles.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::Error;

/// Byte source/sink the link layer runs on.
pub trait Transport: Send {
    /// Fetch pending bytes. Returns `Ok(0)` when nothing is available; must
    /// not block beyond a short poll interval.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one complete wire frame.
    fn send(&mut self, wire: &[u8]) -> io::Result<()>;
}

/// Line speeds the board controller supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Baud {
    B57600,
    B115200,
    B921600,
}

impl Baud {
    pub fn bits_per_second(self) -> u32 {
        match self {
            Baud::B57600 => 57_600,
            Baud::B115200 => 115_200,
            Baud::B921600 => 921_600,
        }
    }

    pub fn from_bits_per_second(bps: u32) -> Option<Baud> {
        match bps {
            57_600 => Some(Baud::B57600),
            115_200 => Some(Baud::B115200),
            921_600 => Some(Baud::B921600),
            _ => None,
        }
    }
}

/// A raw 8N1 serial port plus the lock file guarding it.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    _lock: LockFile,
}

impl SerialTransport {
    /// Lock and open `dev` at the given speed.
    pub fn open(dev: &str, baud: Baud) -> Result<SerialTransport, Error> {
        let lock = LockFile::acquire(dev)?;
        let port = serialport::new(dev, baud.bits_per_second())
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(1))
            .open()
            .map_err(|e| {
                Error::System(io::Error::new(io::ErrorKind::Other, e))
            })?;
        debug!("opened {dev} at {} baud", baud.bits_per_second());
        Ok(SerialTransport { port, _lock: lock })
    }
}

impl Transport for SerialTransport {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => {
                if n > 0 {
                    trace!("rx {n} byte(s)");
                }
                Ok(n)
            }
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, wire: &[u8]) -> io::Result<()> {
        trace!("tx {} byte(s)", wire.len());
        self.port.write_all(wire)?;
        self.port.flush()
    }
}

const LOCK_DIR: &str = "/tmp";
const LOCK_WINDOW: Duration = Duration::from_secs(2);

/// A `LCK..<tty>` style lock file holding our PID. A lock whose owner is no
/// longer alive is taken over; an actively held lock makes acquisition fail
/// with `DeviceLocked` after a retry window.
pub(crate) struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub(crate) fn acquire(dev: &str) -> Result<LockFile, Error> {
        let tty = Path::new(dev)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dev.to_string());
        let path = PathBuf::from(format!("{LOCK_DIR}/LCK..{tty}"));
        let deadline = Instant::now() + LOCK_WINDOW;

        loop {
            if Instant::now() > deadline {
                return Err(Error::DeviceLocked);
            }
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut f) => {
                    writeln!(f, "{:>10}", std::process::id())?;
                    debug!("acquired {}", path.display());
                    return Ok(LockFile { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(pid) = holder_pid(&path) {
                        if !Path::new(&format!("/proc/{pid}")).exists() {
                            debug!(
                                "removing stale lock {} (pid {pid} gone)",
                                path.display()
                            );
                            let _ = fs::remove_file(&path);
                            continue;
                        }
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(Error::System(e)),
            }
        }
    }
}

fn holder_pid(path: &Path) -> Option<u32> {
    let mut content = String::new();
    fs::File::open(path)
        .ok()?
        .read_to_string(&mut content)
        .ok()?;
    content.trim().parse().ok()
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_mapping() {
        for baud in [Baud::B57600, Baud::B115200, Baud::B921600] {
            assert_eq!(
                Baud::from_bits_per_second(baud.bits_per_second()),
                Some(baud)
            );
        }
        assert_eq!(Baud::from_bits_per_second(9600), None);
    }

    #[test]
    fn lock_excludes_second_holder_and_releases() {
        let dev = format!("/tmp/bctrl-test-tty-{}", std::process::id());
        let lock = LockFile::acquire(&dev).unwrap();
        assert!(matches!(
            LockFile::acquire(&dev),
            Err(Error::DeviceLocked)
        ));
        let path = lock.path.clone();
        drop(lock);
        assert!(!path.exists());
        // Acquirable again after release.
        drop(LockFile::acquire(&dev).unwrap());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dev = format!("/tmp/bctrl-test-stale-{}", std::process::id());
        let path = format!("{LOCK_DIR}/LCK..bctrl-test-stale-{}", std::process::id());
        // No live process has this PID on any reasonable system.
        fs::write(&path, "  4194304\n").unwrap();
        let lock = LockFile::acquire(&dev).unwrap();
        drop(lock);
    }
}
