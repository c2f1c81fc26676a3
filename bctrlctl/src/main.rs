//! Command-line driver for the BCTRL board controller.
//!
//! One subcommand per device operation: each opens the serial link (which
//! performs the SYNC handshake), submits the request, and pumps the library
//! until the session completes. `console` mode keeps the link open and
//! reads commands from stdin instead.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use bctrl_host::Baud;

mod cmds;
mod driver;
mod render;

use cmds::Cmd;
use driver::Driver;

#[derive(Debug, Parser)]
#[clap(
    name = "bctrlctl",
    version,
    about = "talk to a BCTRL board controller over its serial link",
    max_term_width = 80
)]
struct Args {
    /// Serial device the controller is attached to.
    #[clap(long, default_value = "/dev/ttyS0")]
    dev: String,

    /// Line speed in baud (57600, 115200 or 921600).
    #[clap(long, default_value_t = 921600)]
    baud: u32,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[clap(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Seconds to wait for an operation to complete.
    #[clap(long, default_value_t = 120)]
    timeout: u64,

    #[clap(subcommand)]
    cmd: Cmd,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level),
    )
    .init();

    let baud = Baud::from_bits_per_second(args.baud)
        .with_context(|| format!("unsupported baud rate {}", args.baud))?;
    let mut driver =
        Driver::connect(&args.dev, baud, Duration::from_secs(args.timeout))?;

    match args.cmd {
        Cmd::Console => cmds::console(&mut driver),
        cmd => cmds::run(&mut driver, &cmd),
    }
}
