//! # vfio-drivers
//!
//! Userspace PCIe drivers built on top of the Linux VFIO passthrough facility.
//!
//! This crate drives devices directly from an unprivileged process: the kernel
//! hands out the PCI device through a VFIO container/group/device triple, the
//! IOMMU isolates the device's DMA, and everything else - descriptor rings,
//! packet buffers, interrupts - is plain userspace code. Two device families
//! are supported:
//!
//! - [`IxgbeDevice`]: Intel 82599 10 Gigabit Ethernet NICs (loopback transmit
//!   and promiscuous capture to pcap files)
//! - [`FpgaDevice`]: an FPGA register/DMA exerciser used to validate the
//!   shared DMA and interrupt plumbing
//!
//! ## Features
//!
//! - Huge-page backed DMA memory with explicit IOVA assignment
//! - Fixed-size packet buffer pools with an index free stack
//! - Advanced RX/TX descriptor rings with batched refill/drain/reclaim
//! - MSI and MSI-X interrupts delivered through eventfds and epoll
//! - Packet capture to the classic pcap file format
//!
//! ## Basic Usage
//!
//! ```rust,ignore
//! use vfio_drivers::{create_ixgbe, PciDevice};
//! use std::sync::atomic::AtomicBool;
//!
//! // Bring the NIC all the way up: VFIO handles, reset, rings, interrupts.
//! let mut dev = create_ixgbe("0000:04:00.0", 1, 2048, 2048, 1_000_000_000, 100)?;
//!
//! // Capture 1000 frames into a pcap file.
//! let stop = AtomicBool::new(false);
//! dev.capture(64, 1000, "out.pcap".as_ref(), &stop)?;
//! ```
//!
//! ## Requirements
//!
//! - 2 MiB huge pages configured (`/proc/sys/vm/nr_hugepages`)
//! - the target device bound to `vfio-pci`
//! - permission to open `/dev/vfio/*` (root or the `vfio` group)
//!
//! The IOMMU must be a type-1 (page granular) IOMMU; other IOMMU flavours are
//! not supported.

#![deny(missing_docs)]
#![allow(dead_code)]

mod constants;
pub mod descriptor;
mod fpga;
mod interrupts;
mod ixgbe;
pub mod memory;
mod mmio;
pub mod pcap;
mod ring;
mod vfio;

#[macro_use]
extern crate log;

pub use fpga::FpgaDevice;
pub use interrupts::{InterruptMovingAvg, InterruptQueue, InterruptType, Interrupts};
pub use ixgbe::{create_ixgbe, IxgbeDevice};
pub use memory::{BufferPool, DmaAllocator, DmaRegion, PacketBuffer, PACKET_HEADROOM};
pub use mmio::MmioRegion;
pub use ring::{DescRing, RxRing, TxRing};
pub use vfio::VfioPci;

use std::io;
use thiserror::Error;

/// Vendor ID for Intel.
pub const INTEL_VEND: u16 = 0x8086;

/// Device ID for the 82599ES, used to identify the device from the PCI space.
pub const INTEL_82599: u16 = 0x10FB;

/// Maximum number of queues a single device may expose.
pub const MAX_QUEUES: u16 = 64;

/// Error type for driver operations.
///
/// Bring-up errors (VFIO handle setup, DMA mapping, hardware init) are fatal
/// and propagate out of the crate; data-plane conditions (empty pool, full
/// ring) are reported as counts or booleans instead and never reach this type.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The queue size is not a power of two.
    ///
    /// Hardware descriptor rings require power-of-two sizes so that the
    /// cursors can wrap by masking.
    #[error("queue size is not a power of two")]
    QueueNotAligned,

    /// There are not enough descriptors available in the queue.
    #[error("not enough descriptors available in the queue")]
    QueueFull,

    /// No memory available.
    ///
    /// The buffer pool is exhausted or a DMA allocation failed.
    #[error("out of DMA memory - are huge pages configured?")]
    NoMemory,

    /// The buffer size does not divide the huge page size evenly.
    #[error("buffer size must be a divisor of the huge page size")]
    PageNotAligned,

    /// The device or ring is not ready for the requested operation.
    #[error("device is not ready")]
    NotReady,

    /// Invalid queue ID.
    #[error("invalid queue id {0}")]
    InvalidQueue(u16),

    /// The IOVA cursor would overflow the device's DMA aperture.
    #[error("IOMMU aperture exhausted: cannot map {0:#x} more bytes")]
    IovaExhausted(u64),

    /// A received frame spans more than one descriptor.
    ///
    /// The data plane only supports single-buffer frames; buffers must be
    /// sized to hold a full MTU.
    #[error("multi-segment packets are not supported - increase buffer size or decrease MTU")]
    MultiSegmentFrame,

    /// The device offers no interrupt vector that can signal an eventfd.
    #[error("no usable interrupt type (MSI/MSI-X) on this device")]
    UnsupportedInterrupt,

    /// A configuration rule was violated (device not bound, group not
    /// viable, incompatible IOMMU, ...). The message names the rule.
    #[error("{0}")]
    Config(String),

    /// A system call failed; `op` names the operation that was attempted.
    #[error("failed to {op}: {source}")]
    Os {
        /// The operation that failed, e.g. `"map BAR0"`.
        op: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A plain I/O error (trace file handling).
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DriverError {
    /// Builds a [`DriverError::Os`] from the current `errno`.
    pub(crate) fn os(op: &'static str) -> Self {
        DriverError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Process exit code for this error.
    ///
    /// Mirrors the kernel-reported errno where one is available so that
    /// scripted callers can distinguish configuration failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            DriverError::Os { source, .. } | DriverError::Io(source) => {
                source.raw_os_error().unwrap_or(1)
            }
            _ => 1,
        }
    }
}

/// Result type for driver functions.
///
/// A type alias for `Result` with [`DriverError`] as the error type.
pub type DriverResult<T = ()> = Result<T, DriverError>;

/// Capability interface shared by all supported PCIe device families.
///
/// A concrete device (NIC, FPGA, ...) implements this trait on top of the
/// common VFIO plumbing in [`VfioPci`]. Operations that have no hardware
/// counterpart on a family are implemented as no-ops there; the 82599 NIC
/// implements all of them.
///
/// The bring-up order matters and is encoded in the device factories:
/// `init_hardware`, ring setup, `init_interrupts`, `enable_queues`,
/// `enable_interrupts`, `set_promisc`, `wait_for_link`.
pub trait PciDevice {
    /// Resets and initializes the device hardware.
    fn init_hardware(&mut self) -> DriverResult;

    /// Creates `num_queues` receive rings, each backed by a fresh buffer
    /// pool of `num_bufs` buffers of `buf_size` bytes.
    fn set_rx_rings(&mut self, num_queues: u16, num_bufs: u32, buf_size: u32) -> DriverResult;

    /// Creates `num_queues` transmit rings, each backed by a fresh buffer
    /// pool of `num_bufs` buffers of `buf_size` bytes.
    fn set_tx_rings(&mut self, num_queues: u16, num_bufs: u32, buf_size: u32) -> DriverResult;

    /// Detects the interrupt type and wires one eventfd per receive queue
    /// into the device's interrupt vectors.
    fn init_interrupts(&mut self, interval: u64, timeout_ms: u32) -> DriverResult;

    /// Enables the configured RX and TX queues on the device.
    fn enable_queues(&mut self) -> DriverResult;

    /// Programs the device-side interrupt registers for every RX queue.
    fn enable_interrupts(&mut self) -> DriverResult;

    /// Enables or disables promiscuous mode.
    fn set_promisc(&mut self, enable: bool) -> DriverResult;

    /// Blocks until the link is up or a 10 s timeout expires.
    ///
    /// Returns `Ok` either way; the negotiated speed is logged so the caller
    /// can decide how to proceed on a dead link.
    fn wait_for_link(&mut self) -> DriverResult;

    /// Queues a single frame for transmission on `queue_id` and notifies the
    /// hardware.
    fn send_on_queue(&mut self, data: &[u8], queue_id: u16) -> DriverResult;
}

/// Network device statistics.
///
/// Counters accumulate monotonically across reads: the underlying hardware
/// registers are read-to-clear, so every read adds the hardware delta to the
/// running totals.
#[derive(Default, Copy, Clone)]
pub struct DeviceStats {
    /// Number of received packets.
    pub rx_pkts: u64,
    /// Number of transmitted packets.
    pub tx_pkts: u64,
    /// Number of received bytes.
    pub rx_bytes: u64,
    /// Number of transmitted bytes.
    pub tx_bytes: u64,
}

impl core::fmt::Display for DeviceStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "rx_pkts: {}, tx_pkts: {}, rx_bytes: {}, tx_bytes: {}",
            self.rx_pkts, self.tx_pkts, self.rx_bytes, self.tx_bytes
        )
    }
}

impl DeviceStats {
    /// Prints the RX and TX rates over the interval between `old` and `self`.
    pub fn print_diff(&self, old: &DeviceStats, pci_addr: &str, nanos: u64) {
        println!(
            "[{}] RX: {} Mbit/s {:.2} Mpps",
            pci_addr,
            diff_mbit(self.rx_bytes, old.rx_bytes, self.rx_pkts, old.rx_pkts, nanos),
            diff_mpps(self.rx_pkts, old.rx_pkts, nanos)
        );
        println!(
            "[{}] TX: {} Mbit/s {:.2} Mpps",
            pci_addr,
            diff_mbit(self.tx_bytes, old.tx_bytes, self.tx_pkts, old.tx_pkts, nanos),
            diff_mpps(self.tx_pkts, old.tx_pkts, nanos)
        );
    }
}

/// Million packets per second over an interval of `nanos` nanoseconds.
pub fn diff_mpps(pkts_new: u64, pkts_old: u64, nanos: u64) -> f64 {
    (pkts_new - pkts_old) as f64 / 1_000_000.0 / (nanos as f64 / 1_000_000_000.0)
}

/// On-wire Mbit/s over an interval of `nanos` nanoseconds.
///
/// Takes the preamble, SFD and inter-frame gap (20 bytes per packet) into
/// account so the figure matches physical line rate with small packets.
pub fn diff_mbit(bytes_new: u64, bytes_old: u64, pkts_new: u64, pkts_old: u64, nanos: u64) -> u32 {
    (((bytes_new - bytes_old) as f64 / 1_000_000.0 / (nanos as f64 / 1_000_000_000.0)) * 8.0
        + diff_mpps(pkts_new, pkts_old, nanos) * 20.0 * 8.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpps_formula() {
        // 1 million packets in exactly one second
        let mpps = diff_mpps(1_000_000, 0, 1_000_000_000);
        assert!((mpps - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mbit_includes_framing_overhead() {
        // 60-byte frames at 1 Mpps: 480 Mbit/s of payload plus
        // 20 bytes * 8 bits of per-packet framing = 160 Mbit/s.
        let mbit = diff_mbit(60_000_000, 0, 1_000_000, 0, 1_000_000_000);
        assert_eq!(mbit, 480 + 160);
    }

    #[test]
    fn test_line_rate_at_min_frame_size() {
        // 14.88 Mpps of 64-byte frames saturates a 10G link once the
        // 20-byte on-wire overhead is included.
        let pkts = 14_880_952u64;
        let mbit = diff_mbit(pkts * 64, 0, pkts, 0, 1_000_000_000);
        assert!((9_990..=10_010).contains(&mbit), "got {mbit}");
    }

    #[test]
    fn test_stats_display() {
        let stats = DeviceStats {
            rx_pkts: 1,
            tx_pkts: 2,
            rx_bytes: 3,
            tx_bytes: 4,
        };
        assert_eq!(
            stats.to_string(),
            "rx_pkts: 1, tx_pkts: 2, rx_bytes: 3, tx_bytes: 4"
        );
    }

    #[test]
    fn test_exit_code_mirrors_errno() {
        let err = DriverError::Os {
            op: "open container",
            source: io::Error::from_raw_os_error(libc::EACCES),
        };
        assert_eq!(err.exit_code(), libc::EACCES);
        assert_eq!(DriverError::QueueNotAligned.exit_code(), 1);
    }
}
