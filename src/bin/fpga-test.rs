//! FPGA self-tests: scratch register, MSI trigger, DMA write and DMA
//! round-trip.

use std::process;

use clap::Parser;
use log::error;
use vfio_drivers::{DriverResult, FpgaDevice, PciDevice};

#[derive(Parser)]
#[command(author, version, about = "FPGA exerciser self-tests", long_about = None)]
struct Args {
    /// Which test to run: 1 scratch, 2 interrupt, 3 dma-write,
    /// 4 dma-roundtrip.
    #[arg(value_parser = clap::value_parser!(u8).range(1..=4))]
    test_num: u8,

    /// PCI address of the FPGA, as shown by lspci.
    #[arg(long, default_value = "0000:06:00.0")]
    pci_addr: String,
}

fn run(args: &Args) -> DriverResult<bool> {
    let mut dev = FpgaDevice::new(&args.pci_addr)?;
    dev.init_hardware()?;
    match args.test_num {
        1 => Ok(dev.test_scratch_register()),
        2 => Ok(dev.trigger_interrupt()),
        3 => dev.test_dma_write(),
        _ => dev.test_dma_roundtrip(),
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(true) => println!("test {} passed", args.test_num),
        Ok(false) => {
            println!("test {} FAILED", args.test_num);
            process::exit(1);
        }
        Err(e) => {
            error!("{e}");
            process::exit(e.exit_code());
        }
    }
}
