//! Promiscuous capture: drains a receive queue into a pcap file.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use log::error;
use vfio_drivers::{create_ixgbe, DriverResult};

const INTERRUPT_INITIAL_INTERVAL: u64 = 1_000_000_000;

#[derive(Parser)]
#[command(author, version, about = "Promiscuous packet capture for 82599 NICs", long_about = None)]
struct Args {
    /// Output pcap file.
    output: PathBuf,

    /// PCI address of the NIC, as shown by lspci.
    #[arg(long, default_value = "0000:05:00.0")]
    pci_addr: String,

    /// Number of frames to capture; -1 captures forever.
    #[arg(long, default_value_t = 1000)]
    frames: i64,

    /// Frames drained per wakeup.
    #[arg(long, default_value_t = 64)]
    batch: u16,

    /// Buffers per pool; also the descriptor ring size.
    #[arg(long, default_value_t = 2048)]
    num_bufs: u32,

    /// Bytes per buffer slot.
    #[arg(long, default_value_t = 2048)]
    buf_size: u32,

    /// Interrupt wait timeout in milliseconds (0 polls).
    #[arg(long, default_value_t = 100)]
    timeout_ms: u32,
}

fn run(args: &Args) -> DriverResult {
    let mut dev = create_ixgbe(
        &args.pci_addr,
        1,
        args.num_bufs,
        args.buf_size,
        INTERRUPT_INITIAL_INTERVAL,
        args.timeout_ms,
    )?;
    let stop = AtomicBool::new(false);
    dev.capture(args.batch, args.frames, &args.output, &stop)
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        error!("{e}");
        process::exit(e.exit_code());
    }
}
