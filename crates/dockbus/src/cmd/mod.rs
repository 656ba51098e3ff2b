use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Args, Subcommand};
use dockbus_station::{DeviceTarget, MessageId, Module};

use crate::exit::{CliError, CliResult, INTERNAL};
use crate::output::OutputFormat;

pub mod listen;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the station daemon.
    Serve(ServeArgs),
    /// Send one request to a device through a running daemon.
    Send(SendArgs),
    /// Subscribe to callbacks and print each event.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// JSON configuration file. Built-in defaults apply when omitted.
    #[arg(long, short = 'c', env = "DOCKBUS_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Skip discovery at startup.
    #[arg(long)]
    pub no_scan: bool,
    /// Run every bus on a loopback line instead of the serial devices.
    #[arg(long)]
    pub loopback: bool,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Daemon endpoint. Defaults to the module's standard port.
    #[arg(long, value_name = "ADDR")]
    pub connect: Option<String>,
    /// Bus to address.
    #[arg(long, short = 'm', default_value = "bdp")]
    pub module: Module,
    /// Virtual device number, or "all".
    #[arg(long, short = 'd', value_parser = parse_target)]
    pub dev: DeviceTarget,
    /// Message kind, by name or id (e.g. status-get, 0x03).
    #[arg(long)]
    pub msg: MessageId,
    /// Request payload as hex.
    #[arg(long, default_value = "", value_name = "HEX")]
    pub payload: String,
    /// Per-attempt device timeout in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub timeout: u32,
    /// Retransmissions the daemon makes; sizes the wait budget.
    #[arg(long, default_value_t = 2)]
    pub retries: u32,
    /// Do not wait for the answer.
    #[arg(long)]
    pub no_wait: bool,
    /// Application name stamped into the request.
    #[arg(long, default_value = "dockbus-cli")]
    pub app: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Callback endpoint.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:7303")]
    pub connect: String,
    /// Only print events from this bus.
    #[arg(long, short = 'm')]
    pub module: Option<Module>,
    /// Exit after receiving N events.
    #[arg(long)]
    pub count: Option<usize>,
    /// Application name used to register.
    #[arg(long, default_value = "dockbus-cli")]
    pub app: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_target(input: &str) -> Result<DeviceTarget, String> {
    if input.eq_ignore_ascii_case("all") {
        return Ok(DeviceTarget::All);
    }
    input
        .parse::<u16>()
        .map(DeviceTarget::from_dev_num)
        .map_err(|_| format!("expected a device number or \"all\", got {input:?}"))
}

/// Clear `running` on SIGINT/SIGTERM.
pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
