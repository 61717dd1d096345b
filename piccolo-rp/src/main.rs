//! # Piccolo Server for Red Pitaya
//!
//! Serves the Piccolo gateware of a Red Pitaya board over the four Piccolo TCP services.
//!
//! ## Overview
//!
//! This binary combines [`piccolo_server`] with a concrete backend. On the board, the
//! register block of the gateware and the ADC buffers of the scope core are mapped from
//! `/dev/mem`. Without hardware, the `loopback` backend serves heap memory and a synthetic
//! waveform so that host software can be developed against it.
pub mod backends;

use std::error::Error;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use clap_num::maybe_hex;
use env_logger::Env;
use piccolo_protocol::{DEFAULT_SAMPLES_PER_CHANNEL, Ports};
use piccolo_server::{
    Acquisition, RegisterMemory,
    acquisition::TestPattern,
    registers::RegisterCatalog,
    server::Builder,
    store::{HeapMemory, RegisterStore},
};

const DEFAULT_POLL_TIMEOUT_US: u64 = 1000;
const DEFAULT_REGISTER_BASE: u64 = 0x4060_0000;
const DEFAULT_REGISTER_SIZE: usize = 0x2000;
const DEFAULT_SCOPE_BASE: u64 = 0x4010_0000;

#[derive(Parser, Eq, PartialEq, Clone)]
enum Backend {
    /// Registers and ADC buffers mapped from physical memory
    DevMem {
        #[arg(long, default_value = "/dev/mem")]
        path: PathBuf,
        #[arg(long, help = "Physical address of the register block", default_value = "0x40600000", value_parser = maybe_hex::<u64>)]
        register_base: u64,
        #[arg(long, help = "Size of the register block in bytes", default_value = "0x2000", value_parser = maybe_hex::<usize>)]
        register_size: usize,
        #[arg(long, help = "Physical address of the scope core", default_value = "0x40100000", value_parser = maybe_hex::<u64>)]
        scope_base: u64,
        #[arg(
            short,
            long,
            help = "The trigger timeout in microseconds",
            default_value = "1000"
        )]
        poll_timeout_us: u64,
    },
    /// Heap memory and a synthetic waveform, for running without hardware
    Loopback {
        #[arg(long, help = "Size of the register block in bytes", default_value = "0x2000", value_parser = maybe_hex::<usize>)]
        register_size: usize,
    },
}

#[derive(Parser)]
#[command(about = "Piccolo instrument server for Red Pitaya", long_about=None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    ip: IpAddr,

    #[arg(long, default_value = "5000")]
    control_port: u16,

    #[arg(long, default_value = "5001")]
    buffer_port: u16,

    #[arg(long, default_value = "5002")]
    state_port: u16,

    #[arg(long, default_value = "5003")]
    set_port: u16,

    #[arg(short, long, help = "Register catalog", default_value = "piccolo_mmap.json")]
    catalog: PathBuf,

    #[arg(short, long, help = "Samples per channel of every buffer", default_value_t = DEFAULT_SAMPLES_PER_CHANNEL)]
    samples: usize,

    #[arg(long, help = "Interval of the state stream in milliseconds", default_value = "100")]
    stream_interval_ms: u64,

    #[clap(subcommand)]
    backend: Option<Backend>,
}

/// Red Pitaya images ship their tooling below `/opt/redpitaya`.
fn is_red_pitaya() -> bool {
    Path::new("/opt/redpitaya").exists()
}

async fn run<A: Acquisition, M: RegisterMemory + 'static>(
    args: &Args,
    catalog: RegisterCatalog,
    acquisition: A,
    memory: M,
) -> Result<(), Box<dyn Error>> {
    let store = RegisterStore::new(catalog, memory)?;
    let server = Builder::new()
        .ports(Ports {
            control: args.control_port,
            buffer_stream: args.buffer_port,
            state_stream: args.state_port,
            state_set: args.set_port,
        })
        .samples_per_channel(args.samples)
        .stream_interval(Duration::from_millis(args.stream_interval_ms))
        .build(acquisition, store)?;
    log::debug!(
        "Server config: samples_per_channel={}, stream_interval={:?}",
        server.config().samples_per_channel,
        server.config().stream_interval
    );

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, shutting down");
            shutdown.cancel();
        }
    });

    server.listen(args.ip).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    log::info!("Starting Piccolo server");

    let args = Args::parse();
    log::debug!(
        "Parsed arguments: ip={}, ports={}..{}, catalog={}",
        args.ip,
        args.control_port,
        args.set_port,
        args.catalog.display()
    );

    let catalog = RegisterCatalog::from_file(&args.catalog)?;
    log::info!(
        "Compiled {} registers from {}",
        catalog.len(),
        args.catalog.display()
    );

    let backend = args.backend.clone().or_else(|| {
        if is_red_pitaya() {
            log::info!("Auto-detected Red Pitaya");
            Some(Backend::DevMem {
                path: PathBuf::from("/dev/mem"),
                register_base: DEFAULT_REGISTER_BASE,
                register_size: DEFAULT_REGISTER_SIZE,
                scope_base: DEFAULT_SCOPE_BASE,
                poll_timeout_us: DEFAULT_POLL_TIMEOUT_US,
            })
        } else {
            None
        }
    });

    match backend {
        Some(Backend::DevMem {
            path,
            register_base,
            register_size,
            scope_base,
            poll_timeout_us,
        }) => {
            use crate::backends::devmem::{DevMemRegisters, ScopeAcquisition};

            log::info!("Initializing physical memory backend from {}", path.display());
            let registers = DevMemRegisters::new(&path, register_base, register_size)?;
            let scope =
                ScopeAcquisition::new(&path, scope_base, Duration::from_micros(poll_timeout_us))?;
            run(&args, catalog, scope, registers).await?;
        }
        Some(Backend::Loopback { register_size }) => {
            log::info!("Initializing loopback backend");
            run(
                &args,
                catalog,
                TestPattern::default(),
                HeapMemory::new(register_size),
            )
            .await?;
        }
        None => {
            println!(
                "No Red Pitaya could be auto detected. Use piccolo-rp dev-mem to map physical memory or piccolo-rp loopback to run without hardware."
            )
        }
    }
    Ok(())
}
