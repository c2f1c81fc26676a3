//! The pump around the library handle: connect, submit, wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::debug;

use bctrl_host::{Baud, Bctrl};

use crate::render;

pub struct Driver {
    pub bc: Bctrl,
    done: Arc<AtomicBool>,
    ok: Arc<AtomicBool>,
    interrupted: Arc<AtomicBool>,
    timeout: Duration,
}

impl Driver {
    /// Open the device, install the standing callbacks and start the link
    /// (which queues the bootstrap SYNC).
    pub fn connect(dev: &str, baud: Baud, timeout: Duration) -> Result<Driver> {
        let mut bc = Bctrl::open();
        let done = Arc::new(AtomicBool::new(false));
        let ok = Arc::new(AtomicBool::new(false));

        bc.register_error_cb(|msg| eprintln!("bctrl: {msg}"));
        {
            let done = Arc::clone(&done);
            let ok = Arc::clone(&ok);
            bc.register_session_cb(move |id, success| {
                debug!("session {id} finished, success={success}");
                ok.store(success, Ordering::SeqCst);
                done.store(true, Ordering::SeqCst);
            });
        }
        render::install_default_callbacks(&mut bc);

        bc.start(dev, baud)
            .with_context(|| format!("opening {dev}"))?;

        let interrupted = Arc::new(AtomicBool::new(false));
        {
            let interrupted = Arc::clone(&interrupted);
            let _ = ctrlc::set_handler(move || {
                interrupted.store(true, Ordering::SeqCst);
            });
        }

        Ok(Driver { bc, done, ok, interrupted, timeout })
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Reset the completion flags before submitting a request.
    pub fn arm(&mut self) {
        self.done.store(false, Ordering::SeqCst);
        self.ok.store(false, Ordering::SeqCst);
    }

    /// Pump the link until the session callback fires; fail on timeout,
    /// interrupt, or an unsuccessful completion.
    pub fn wait(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        while !self.done.load(Ordering::SeqCst) {
            if self.interrupted() {
                bail!("interrupted");
            }
            if Instant::now() > deadline {
                bail!("timed out waiting for the operation to complete");
            }
            self.bc.trigger(32)?;
            std::thread::sleep(Duration::from_millis(1));
        }
        if !self.ok.load(Ordering::SeqCst) {
            bail!("operation failed");
        }
        Ok(())
    }

    /// Pump the link for a fixed duration, ignoring session state. Used by
    /// the console `wait` command and to flush trailing traffic.
    pub fn settle(&mut self, how_long: Duration) -> Result<()> {
        let deadline = Instant::now() + how_long;
        while Instant::now() < deadline {
            if self.interrupted() {
                bail!("interrupted");
            }
            self.bc.trigger(32)?;
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}
