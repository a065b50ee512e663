//! cxlsim - a CXL 2.0 switch management-plane emulator.
//!
//! Serves FM API and Emulator API commands over MCTP-over-TCP against an
//! in-memory switch model loaded from a YAML configuration.

use clap::Parser;
use cxlsim::backend::{ConfigBackend, EmulatedBackend, SysfsBackend};
use cxlsim::config::{self, EmulatorOverrides};
use cxlsim::handlers::Dispatcher;
use cxlsim::mctp::{self, Endpoint, Transport, POOL_SLOTS};
use cxlsim::state::{Switch, SwitchState, DEFAULT_PORTS, DEFAULT_VCSS, DEFAULT_VPPBS};
use log::{info, LevelFilter};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TCP_PORT: u16 = 2508;

#[derive(Parser, Debug)]
#[command(name = "cxlsim")]
#[command(about = "A CXL 2.0 switch management plane emulator")]
struct Args {
    /// Load switch configuration from a YAML file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port for the MCTP transport [default: 2508]
    #[arg(short = 'P', long = "tcp-port")]
    tcp_port: Option<u16>,

    /// TCP listen address for the MCTP transport
    #[arg(short = 'T', long = "tcp-address", default_value = "0.0.0.0")]
    tcp_address: Ipv4Addr,

    /// Verbosity level (0 = quiet, 1 = commands, 2 = actions, 3+ = trace)
    #[arg(short = 'V', long = "verbosity", default_value_t = 0)]
    verbosity: u8,

    /// Verbosity bitfield, hex
    #[arg(short = 'X', long = "verbosity-hex")]
    verbosity_hex: Option<String>,

    /// Transport verbosity bitfield, hex (bit 0 = frames, bit 1 = peers)
    #[arg(short = 'Z', long = "verbosity-mctp")]
    verbosity_mctp: Option<String>,

    /// Print the loaded switch state at startup
    #[arg(short = 's', long = "state")]
    print_state: bool,

    /// Log commands, actions and errors
    #[arg(short = 'l', long = "log")]
    log: bool,

    /// General verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Drive real PCI devices through sysfs instead of emulated buffers
    #[arg(short = 'Q', long = "qemu")]
    qemu: bool,

    /// Print version information
    #[arg(long)]
    version: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.version {
        println!("cxlsim {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn parse_hex_flag(flag: &'static str, value: &Option<String>) -> Option<u64> {
    value
        .as_deref()
        .and_then(|s| config::parse_num(flag, s).ok())
}

/// Pick the log filter. An explicit CLI bitfield wins over the config
/// file's; either wins over the plain defaults.
fn init_logging(args: &Args, overrides: &EmulatorOverrides) {
    let hex = parse_hex_flag("verbosity-hex", &args.verbosity_hex)
        .or(overrides.verbosity)
        .unwrap_or(0);
    let level = if args.verbosity >= 3 || hex > 0xFF {
        LevelFilter::Trace
    } else if args.verbosity == 2 || args.verbose || hex > 0 {
        LevelFilter::Debug
    } else if args.verbosity == 1 || args.log {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level.to_string().to_lowercase()),
    )
    .format_timestamp_secs()
    .init();
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut state = SwitchState::new(DEFAULT_PORTS, DEFAULT_VCSS, DEFAULT_VPPBS)?;

    // Load the configuration before logging comes up: the emulator section
    // may set the verbosity the logger is initialized with.
    let mut overrides = EmulatorOverrides::default();
    if let Some(path) = &args.config {
        let cfg = config::load_file(path)?;
        overrides = config::apply(&cfg, &mut state)?;
    }

    init_logging(&args, &overrides);
    mctp::register_stop_signals();
    mctp::set_verbosity(
        parse_hex_flag("verbosity-mctp", &args.verbosity_mctp)
            .or(overrides.verbosity_mctp)
            .unwrap_or(0),
    );
    if let Some(path) = &args.config {
        info!("configuration loaded from {}", path.display());
    }

    let tcp_port = args
        .tcp_port
        .or(overrides.tcp_port)
        .unwrap_or(DEFAULT_TCP_PORT);

    if args.print_state {
        state.print();
    }

    let backend: Box<dyn ConfigBackend> = if args.qemu {
        info!("using sysfs passthrough backend");
        Box::new(SysfsBackend::default())
    } else {
        Box::new(EmulatedBackend)
    };

    let switch = Arc::new(Switch::new(state));
    let transport = Transport::new(POOL_SLOTS);
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&switch), &transport, backend));

    let endpoint = Endpoint::bind(args.tcp_address, tcp_port)?;
    info!("cxlsim listening on {}", endpoint.local_addr());
    let handles = endpoint.start(&transport, dispatcher);

    while !mctp::stop_requested() {
        std::thread::sleep(Duration::from_secs(1));
    }
    info!("stop requested, shutting down");

    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}
