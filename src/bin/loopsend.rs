//! TX loop-send test: saturates a 10G link with 60-byte UDP frames and
//! prints per-second rate reports.

use std::process;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use log::error;
use vfio_drivers::{create_ixgbe, DriverResult};

/// Nanosecond interval seed for the (reserved) adaptive interrupt scheme.
const INTERRUPT_INITIAL_INTERVAL: u64 = 1_000_000_000;

#[derive(Parser)]
#[command(author, version, about = "Transmit loop test for 82599 NICs", long_about = None)]
struct Args {
    /// PCI address of the NIC, as shown by lspci.
    #[arg(long, default_value = "0000:04:00.0")]
    pci_addr: String,

    /// Number of RX/TX queue pairs.
    #[arg(long, default_value_t = 1)]
    queues: u16,

    /// Buffers per pool; also the descriptor ring size.
    #[arg(long, default_value_t = 2048)]
    num_bufs: u32,

    /// Bytes per buffer slot.
    #[arg(long, default_value_t = 2048)]
    buf_size: u32,

    /// Frames filled and published per iteration.
    #[arg(long, default_value_t = 64)]
    batch: u16,

    /// Interrupt wait timeout in milliseconds (0 polls).
    #[arg(long, default_value_t = 100)]
    timeout_ms: u32,
}

fn run(args: &Args) -> DriverResult {
    let mut dev = create_ixgbe(
        &args.pci_addr,
        args.queues,
        args.num_bufs,
        args.buf_size,
        INTERRUPT_INITIAL_INTERVAL,
        args.timeout_ms,
    )?;
    let stop = AtomicBool::new(false);
    dev.loop_send(args.batch, &stop)
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        error!("{e}");
        process::exit(e.exit_code());
    }
}
