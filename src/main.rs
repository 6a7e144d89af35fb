mod bus;
mod command;
mod console;
mod error;
mod protocol;
mod scanner;
mod sequencer;
mod session;

use std::io;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bus::BusKind;
use console::Console;
use scanner::{ScanConfig, Scanner};
use sequencer::{Sequencer, SequencerTiming};
use session::{display_address, DeviceAddress, SessionState};

/// RobStride CSP field tool: scan for motors, reassign their address, command angles.
#[derive(Parser, Debug)]
#[command(name = "robstride-tool", version, long_about = None)]
struct Args {
    /// CAN channel: `can0` for SocketCAN, `/dev/ttyACM0` or `COM3` for an SLCAN adapter
    channel: String,

    /// How long a scan listens for GET_ID replies, in milliseconds
    #[arg(long, default_value_t = 800)]
    scan_window_ms: u64,

    /// Device address to start with (decimal, 0x-hex, or `none` to require a scan)
    #[arg(long, default_value = "0x7F", value_parser = parse_start_address)]
    address: StartAddress,

    /// Initial CSP velocity limit [rad/s]
    #[arg(long, default_value_t = session::DEFAULT_VELOCITY_LIMIT, value_parser = parse_limit)]
    limit: f32,

    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy)]
struct StartAddress(Option<DeviceAddress>);

fn parse_start_address(value: &str) -> Result<StartAddress, String> {
    if value.eq_ignore_ascii_case("none") {
        return Ok(StartAddress(None));
    }
    let raw = command::parse_address(value).map_err(|e| e.to_string())?;
    DeviceAddress::try_from(raw)
        .map(|address| StartAddress(Some(address)))
        .map_err(|e| e.to_string())
}

fn parse_limit(value: &str) -> Result<f32, String> {
    command::parse_float(value).map_err(|e| e.to_string())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("robstride_tool={level}"))),
        )
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let kind = BusKind::from_channel(&args.channel);
    let bus = match bus::open(&args.channel) {
        Ok(bus) => bus,
        Err(e) => {
            error!("{}", e);
            if let Some(guidance) = e.guidance() {
                eprintln!("{guidance}");
            }
            return ExitCode::FAILURE;
        }
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!("Failed to install Ctrl+C handler: {}", e);
    }

    let session = SessionState::new(args.address.0, args.limit);
    let scanner = Scanner::new(ScanConfig {
        window: Duration::from_millis(args.scan_window_ms),
        ..Default::default()
    })
    .with_interrupt(Arc::clone(&interrupted));
    let sequencer = Sequencer::new(SequencerTiming::default(), scanner);

    info!(
        "CAN start OK ({} @ {} @ {} bit/s), current_id={}",
        kind,
        args.channel,
        protocol::BITRATE,
        display_address(session.current_address)
    );
    println!("{}", command::HELP);

    let mut console = Console::new(bus, session, sequencer, io::stdout());
    let result = console.run(interrupted);
    info!(
        "Session ended, current_id={}",
        display_address(console.session().current_address)
    );
    drop(console);
    info!("CAN bus closed");

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Console I/O failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
