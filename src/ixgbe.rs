//! Intel 82599 device driver.
//!
//! Bring-up follows section 4.6 of the 82599 datasheet: global reset,
//! EEPROM/DMA-init waits, link auto-negotiation, then the RX and TX paths.
//! The data plane runs two engines on top of the ring machinery: a
//! loop-send test that saturates the link with a canonical UDP frame, and
//! a promiscuous capture loop that writes received frames to a pcap file.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::constants::*;
use crate::descriptor::{AdvancedRxDescriptor, AdvancedTxDescriptor};
use crate::interrupts::{InterruptType, Interrupts};
use crate::memory::{BufferPool, DmaAllocator};
use crate::mmio::MmioRegion;
use crate::pcap::PcapWriter;
use crate::ring::{DescRing, RxRing, TxRing};
use crate::vfio::VfioPci;
use crate::{DeviceStats, DriverError, DriverResult, PciDevice, MAX_QUEUES};

/// Size of the canonical test frame.
pub(crate) const PKT_SIZE: usize = 60;
/// TX descriptors reclaimed per cleanup batch.
pub(crate) const TX_CLEAN_BATCH: u16 = 256;
/// Byte offset of the sequence counter inside the canonical frame.
const SEQ_OFFSET: usize = 45;

/// The canonical 60-byte UDP frame sent by the loop-send test.
/// The trailing payload bytes stay zero; a 32-bit sequence counter is
/// stamped over bytes 45..49 before every send.
const PKT_TEMPLATE: [u8; PKT_SIZE] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, // dst MAC
    0x10, 0x10, 0x10, 0x10, 0x10, 0x10, // src MAC
    0x08, 0x00, // ether type: IPv4
    0x45, 0x00, // version, IHL, TOS
    0x00, 0x2E, // ip len excluding ethernet, 46 bytes
    0x00, 0x00, 0x00, 0x00, // id, flags, fragmentation
    0x40, 0x11, 0x00, 0x00, // TTL (64), protocol (UDP), checksum
    0x0A, 0x00, 0x00, 0x01, // src ip (10.0.0.1)
    0x0A, 0x00, 0x00, 0x02, // dst ip (10.0.0.2)
    0x00, 0x2A, 0x05, 0x39, // src and dst ports (42 -> 1337)
    0x00, 0x1A, // udp len excluding ip & ethernet, 26 bytes
    0x00, 0x00, // udp checksum, optional
    b'i', b'x', b'y', // payload
    0x00, 0x00, 0x00, 0x00, // sequence counter
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// The canonical frame with `seq` stamped into the payload.
pub(crate) fn canonical_frame(seq: u32) -> [u8; PKT_SIZE] {
    let mut frame = PKT_TEMPLATE;
    frame[SEQ_OFFSET..SEQ_OFFSET + 4].copy_from_slice(&seq.to_le_bytes());
    frame
}

/// Routes an RX (direction 0) or TX (direction 1) queue's interrupt cause
/// to an MSI-X vector via the IVAR registers; 16 bits per queue, two
/// queues per register.
fn set_ivar(bar: &MmioRegion, direction: u32, queue: u16, msix_vector: u32) {
    let vector = msix_vector | IXGBE_IVAR_ALLOC_VAL;
    let index = 16 * (queue as u32 & 1) + 8 * direction;
    let mut ivar = bar.read32(IXGBE_IVAR(queue as u32 >> 1));
    ivar &= !(0xFF << index);
    ivar |= vector << index;
    bar.write32(IXGBE_IVAR(queue as u32 >> 1), ivar);
}

/// An Intel 82599 NIC driven through VFIO.
///
/// Owns the passthrough handles, the BAR0 mapping, the DMA allocator and
/// all rings; dropping the device closes the container, which releases
/// every IOMMU mapping.
pub struct IxgbeDevice {
    pci_addr: String,
    vfio: VfioPci,
    bar0: MmioRegion,
    allocator: DmaAllocator,
    mac: [u8; 6],
    num_rx_queues: u16,
    num_tx_queues: u16,
    num_rx_bufs: u32,
    num_tx_bufs: u32,
    rx_rings: Vec<RxRing>,
    tx_rings: Vec<TxRing>,
    interrupts: Interrupts,
    stats: DeviceStats,
}

impl IxgbeDevice {
    /// Opens the VFIO handles for `pci_addr`, maps the BARs up to
    /// `max_bar_index` and enables bus mastering.
    pub fn new(pci_addr: &str, max_bar_index: u32) -> DriverResult<Self> {
        let vfio = VfioPci::open(pci_addr)?;
        let mut bars = vfio.map_bars(max_bar_index)?;
        let bar0 = bars
            .get_mut(0)
            .and_then(Option::take)
            .ok_or_else(|| DriverError::Config(format!("{pci_addr} has no BAR0")))?;
        vfio.enable_bus_master()?;
        let allocator = DmaAllocator::new(Some(vfio.container_fd()));
        Ok(IxgbeDevice {
            pci_addr: pci_addr.to_string(),
            vfio,
            bar0,
            allocator,
            mac: [0; 6],
            num_rx_queues: 0,
            num_tx_queues: 0,
            num_rx_bufs: 0,
            num_tx_bufs: 0,
            rx_rings: Vec::new(),
            tx_rings: Vec::new(),
            interrupts: Interrupts::default(),
            stats: DeviceStats::default(),
        })
    }

    /// The MAC address read from the first receive-address register pair.
    pub fn mac_addr(&self) -> [u8; 6] {
        self.mac
    }

    /// Accumulates the on-chip counters into the running totals and
    /// returns a snapshot.
    ///
    /// The hardware registers reset on read, so this must be the only
    /// reader.
    pub fn read_stats(&mut self) -> DeviceStats {
        let rx_pkts = self.bar0.read32(IXGBE_GPRC) as u64;
        let tx_pkts = self.bar0.read32(IXGBE_GPTC) as u64;
        let rx_bytes =
            self.bar0.read32(IXGBE_GORCL) as u64 + ((self.bar0.read32(IXGBE_GORCH) as u64) << 32);
        let tx_bytes =
            self.bar0.read32(IXGBE_GOTCL) as u64 + ((self.bar0.read32(IXGBE_GOTCH) as u64) << 32);
        self.stats.rx_pkts += rx_pkts;
        self.stats.tx_pkts += tx_pkts;
        self.stats.rx_bytes += rx_bytes;
        self.stats.tx_bytes += tx_bytes;
        self.stats
    }

    fn disable_interrupts(&self) {
        self.bar0.write32(IXGBE_EIMS, 0x0000_0000);
        self.clear_interrupts();
    }

    /// Masks all interrupt causes and flushes anything pending.
    fn clear_interrupts(&self) {
        self.bar0.write32(IXGBE_EIMC, IXGBE_IRQ_CLEAR_MASK);
        self.bar0.read32(IXGBE_EICR);
    }

    fn reset_hardware(&self) {
        self.bar0.write32(IXGBE_CTRL, IXGBE_CTRL_RST_MASK);
        self.bar0.wait_clear32(IXGBE_CTRL, IXGBE_CTRL_RST_MASK);
    }

    fn read_mac_address(&mut self) {
        let rar_low = self.bar0.read32(IXGBE_RAL(0));
        let rar_high = self.bar0.read32(IXGBE_RAH(0));
        self.mac = [
            rar_low as u8,
            (rar_low >> 8) as u8,
            (rar_low >> 16) as u8,
            (rar_low >> 24) as u8,
            rar_high as u8,
            (rar_high >> 8) as u8,
        ];
        info!(
            "MAC address: {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.mac[0], self.mac[1], self.mac[2], self.mac[3], self.mac[4], self.mac[5]
        );
    }

    fn wait_eeprom_and_dma_init(&self) {
        // section 4.6.3 - wait for EEPROM auto read completion
        self.bar0.wait_set32(IXGBE_EEC, IXGBE_EEC_ARD);
        // section 4.6.3 - wait for DMA initialization done
        self.bar0.wait_set32(IXGBE_RDRXCTL, IXGBE_RDRXCTL_DMAIDONE);
    }

    fn init_link_negotiation(&self) {
        // the EEPROM config should already have set this up; overriding it
        // keeps odd boards from staying in a non-10G mode
        self.bar0.write32(
            IXGBE_AUTOC,
            (self.bar0.read32(IXGBE_AUTOC) & !IXGBE_AUTOC_LMS_MASK) | IXGBE_AUTOC_LMS_10G_SERIAL,
        );
        self.bar0.write32(
            IXGBE_AUTOC,
            (self.bar0.read32(IXGBE_AUTOC) & !IXGBE_AUTOC_10G_PMA_PMD_MASK) | IXGBE_AUTOC_10G_XAUI,
        );
        // negotiate link; the datasheet wants us to wait here, but waiting
        // happens later in wait_for_link
        self.bar0.set_flags32(IXGBE_AUTOC, IXGBE_AUTOC_AN_RESTART);
    }

    fn init_rx_registers(&self) {
        // rx must be disabled while re-configuring it
        self.bar0.clear_flags32(IXGBE_RXCTRL, IXGBE_RXCTRL_RXEN);
        // no DCB or virtualization, just a single 128kb packet buffer
        self.bar0.write32(IXGBE_RXPBSIZE(0), IXGBE_RXPBSIZE_128KB);
        for i in 1..8 {
            self.bar0.write32(IXGBE_RXPBSIZE(i), 0);
        }
        // always enable CRC offloading
        self.bar0.set_flags32(IXGBE_HLREG0, IXGBE_HLREG0_RXCRCSTRP);
        self.bar0.set_flags32(IXGBE_RDRXCTL, IXGBE_RDRXCTL_CRCSTRIP);
        // accept broadcast packets
        self.bar0.set_flags32(IXGBE_FCTRL, IXGBE_FCTRL_BAM);
        // magic bits from the last sentence of section 4.6.7
        self.bar0.set_flags32(IXGBE_CTRL_EXT, IXGBE_CTRL_EXT_NS_DIS);
        // start RX
        self.bar0.set_flags32(IXGBE_RXCTRL, IXGBE_RXCTRL_RXEN);
    }

    fn init_tx_registers(&self) {
        // crc offload and small packet padding
        self.bar0
            .set_flags32(IXGBE_HLREG0, IXGBE_HLREG0_TXCRCEN | IXGBE_HLREG0_TXPADEN);
        // default buffer sizes, section 4.6.11.3.4; no DCB, no VT
        self.bar0.write32(IXGBE_TXPBSIZE(0), IXGBE_TXPBSIZE_40KB);
        for i in 1..8 {
            self.bar0.write32(IXGBE_TXPBSIZE(i), 0);
        }
        // required when not using DCB/VTd
        self.bar0.write32(IXGBE_DTXMXSZRQ, 0xFFFF);
        self.bar0.clear_flags32(IXGBE_RTTDCS, IXGBE_RTTDCS_ARBDIS);
        self.bar0.write32(IXGBE_DMATXCTL, IXGBE_DMATXCTL_TE);
    }

    fn link_speed(&self) -> u32 {
        let links = self.bar0.read32(IXGBE_LINKS);
        if links & IXGBE_LINKS_UP == 0 {
            return 0;
        }
        match links & IXGBE_LINKS_SPEED_82599 {
            IXGBE_LINKS_SPEED_100_82599 => 100,
            IXGBE_LINKS_SPEED_1G_82599 => 1000,
            IXGBE_LINKS_SPEED_10G_82599 => 10000,
            _ => 0,
        }
    }

    fn enable_msi_interrupt(&self, queue: u16) {
        // step 1: associate the rx interrupt cause with EICR bit 0
        set_ivar(&self.bar0, 0, queue, 0);
        // step 3: no auto clear; software reads EICR to find the causes
        self.bar0.write32(IXGBE_EIAC, 0x0000_0000);
        // step 5: interrupt throttling
        self.bar0
            .write32(IXGBE_EITR(queue as u32), self.interrupts.itr_rate);
        // step 6: clear old interrupt causes
        self.clear_interrupts();
        // step 7: enable the required causes
        let mask = self.bar0.read32(IXGBE_EIMS) | (1 << queue);
        self.bar0.write32(IXGBE_EIMS, mask);
        debug!("using MSI interrupts");
    }

    fn enable_msix_interrupt(&self, queue: u16) {
        // step 1: vector mapping in IVAR, MSI-X mode in GPIE
        let gpie = self.bar0.read32(IXGBE_GPIE)
            | IXGBE_GPIE_MSIX_MODE
            | IXGBE_GPIE_PBA_SUPPORT
            | IXGBE_GPIE_EIAME;
        self.bar0.write32(IXGBE_GPIE, gpie);
        set_ivar(&self.bar0, 0, queue, queue as u32);
        // step 3: auto-clear the rx/tx queue causes for best performance
        self.bar0.write32(IXGBE_EIAC, IXGBE_EIMS_RTX_QUEUE);
        // step 5: interrupt throttling, see the table in the interrupts
        // module for rate/latency trade-offs
        self.bar0
            .write32(IXGBE_EITR(queue as u32), self.interrupts.itr_rate);
        // step 6: enable the required causes
        let mask = self.bar0.read32(IXGBE_EIMS) | (1 << queue);
        self.bar0.write32(IXGBE_EIMS, mask);
        debug!("using MSI-X interrupts");
    }

    /// Publishes a new TX tail: the device sends descriptors in
    /// `[TDH, TDT)`.
    fn notify_tx(&self, queue: u16, tail: u16) {
        self.bar0.write32(IXGBE_TDT(queue as u32), tail as u32);
    }

    /// Publishes a new RX tail, handing empty descriptors to the device.
    fn notify_rx(&self, queue: u16, tail: u16) {
        self.bar0.write32(IXGBE_RDT(queue as u32), tail as u32);
    }

    /// Transmit loop test: saturates queue 0 with the canonical 60-byte
    /// UDP frame in batches of `batch` frames, printing per-second rate
    /// reports. Runs until `stop` is raised.
    pub fn loop_send(&mut self, batch: u16, stop: &AtomicBool) -> DriverResult {
        if self.tx_rings.is_empty() {
            return Err(DriverError::NotReady);
        }
        let mut seq: u32 = 0;
        let mut counter: u64 = 0;
        let mut last_report = Instant::now();
        let mut stats_old = DeviceStats::default();

        while !stop.load(Ordering::Relaxed) {
            let tail = {
                let ring = &mut self.tx_rings[0];
                ring.reclaim(TX_CLEAN_BATCH);
                for _ in 0..batch {
                    let frame = canonical_frame(seq);
                    if !ring.fill_frame(&frame) {
                        break;
                    }
                    seq = seq.wrapping_add(1);
                }
                ring.publish(batch)
            };
            self.notify_tx(0, tail);

            counter += 1;
            // sampling the clock is much more expensive than a send batch
            if counter & 0xFFF == 0 {
                let elapsed = last_report.elapsed();
                if elapsed > Duration::from_secs(1) {
                    let stats = self.read_stats();
                    stats.print_diff(&stats_old, &self.pci_addr, elapsed.as_nanos() as u64);
                    stats_old = stats;
                    last_report = Instant::now();
                }
            }
        }
        Ok(())
    }

    /// Captures frames from queue 0 into a pcap file at `path`.
    ///
    /// Waits on the queue's interrupt eventfd when a timeout is configured
    /// and polls otherwise; drains up to `batch_size` frames per wakeup.
    /// `n_packets == -1` captures without bound; the capture also ends
    /// when `stop` is raised.
    pub fn capture(
        &mut self,
        batch_size: u16,
        n_packets: i64,
        path: &Path,
        stop: &AtomicBool,
    ) -> DriverResult {
        if self.rx_rings.is_empty() || self.interrupts.queues.is_empty() {
            return Err(DriverError::NotReady);
        }
        let file = std::fs::File::create(path)?;
        let mut pcap = PcapWriter::new(std::io::BufWriter::new(file))?;
        let mut bufs = vec![0u32; batch_size as usize];
        let mut remaining = n_packets;

        info!("capturing packets ...");
        while remaining != 0 && !stop.load(Ordering::Relaxed) {
            let timeout_ms = self.interrupts.queues[0].timeout_ms;
            let ready = if timeout_ms != 0 {
                self.interrupts.queues[0].wait(timeout_ms)?
            } else {
                0
            };
            // drain on a wakeup, or unconditionally when polling
            if ready == 0 && timeout_ms != 0 {
                continue;
            }
            let tail = {
                let ring = &mut self.rx_rings[0];
                let count = ring.drain(&mut bufs)?;
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                for &idx in bufs.iter().take(count) {
                    if remaining == 0 {
                        break;
                    }
                    if let Some(buf) = ring.buffer(idx) {
                        pcap.write_packet(now.as_secs() as u32, now.subsec_micros(), buf.data())?;
                    }
                    if remaining > 0 {
                        remaining -= 1;
                    }
                }
                ring.release(&bufs[..count]);
                ring.refill(count as u16)
            };
            self.notify_rx(0, tail);
        }
        pcap.flush()?;
        Ok(())
    }
}

impl PciDevice for IxgbeDevice {
    fn init_hardware(&mut self) -> DriverResult {
        info!("resetting device [{}]", self.pci_addr);
        // section 4.6.3.1 - disable all interrupts
        self.disable_interrupts();
        self.reset_hardware();
        std::thread::sleep(Duration::from_millis(10));
        // section 4.6.3.1 - disable interrupts again after reset
        self.disable_interrupts();
        self.read_mac_address();
        self.wait_eeprom_and_dma_init();
        // section 4.6.4 - initialize link (auto negotiation)
        self.init_link_negotiation();
        // section 4.6.5 - statistics registers reset on read, flush them
        let _ = self.read_stats();
        self.stats = DeviceStats::default();
        self.init_rx_registers();
        self.init_tx_registers();
        info!("hardware initialized");
        Ok(())
    }

    fn set_rx_rings(&mut self, num_queues: u16, num_bufs: u32, buf_size: u32) -> DriverResult {
        if num_queues > MAX_QUEUES {
            return Err(DriverError::InvalidQueue(num_queues));
        }
        info!("setting up {num_queues} rx ring(s)");
        self.num_rx_queues = num_queues;
        self.num_rx_bufs = num_bufs;
        for i in 0..num_queues {
            // reserved bit 12 is initialized as 1 but must be written as 0
            // (there is not even a name for it in the datasheet)
            self.bar0.clear_flags32(IXGBE_DCA_RXCTRL(i as u32), 1 << 12);
            let pool = BufferPool::allocate(&mut self.allocator, num_bufs, buf_size)?;
            let mut ring = RxRing::new();
            ring.link_pool(pool);
            ring.create(
                &mut self.allocator,
                &self.bar0,
                num_bufs,
                std::mem::size_of::<AdvancedRxDescriptor>(),
                i,
            )?;
            ring.refill(num_bufs as u16);
            self.rx_rings.push(ring);
        }
        Ok(())
    }

    fn set_tx_rings(&mut self, num_queues: u16, num_bufs: u32, buf_size: u32) -> DriverResult {
        if num_queues > MAX_QUEUES {
            return Err(DriverError::InvalidQueue(num_queues));
        }
        info!("setting up {num_queues} tx ring(s)");
        self.num_tx_queues = num_queues;
        self.num_tx_bufs = num_bufs;
        for i in 0..num_queues {
            let pool = BufferPool::allocate(&mut self.allocator, num_bufs, buf_size)?;
            let mut ring = TxRing::new();
            ring.link_pool(pool);
            ring.create(
                &mut self.allocator,
                &self.bar0,
                num_bufs,
                std::mem::size_of::<AdvancedTxDescriptor>(),
                i,
            )?;
            self.tx_rings.push(ring);
        }
        Ok(())
    }

    fn init_interrupts(&mut self, interval: u64, timeout_ms: u32) -> DriverResult {
        self.interrupts.detect_type(&self.vfio)?;
        self.interrupts
            .setup_queues(&self.vfio, self.num_rx_queues, interval, timeout_ms)
    }

    fn enable_queues(&mut self) -> DriverResult {
        for queue in 0..self.num_rx_queues {
            let i = queue as u32;
            // enable the queue and wait for the bit to latch
            self.bar0.set_flags32(IXGBE_RXDCTL(i), IXGBE_RXDCTL_ENABLE);
            self.bar0.wait_set32(IXGBE_RXDCTL(i), IXGBE_RXDCTL_ENABLE);
            // rx queue starts out full
            self.bar0.write32(IXGBE_RDH(i), 0);
            self.bar0.write32(IXGBE_RDT(i), self.num_rx_bufs - 1);
        }
        for queue in 0..self.num_tx_queues {
            let i = queue as u32;
            debug!("starting tx queue {queue}");
            // tx queue starts out empty
            self.bar0.write32(IXGBE_TDH(i), 0);
            self.bar0.write32(IXGBE_TDT(i), 0);
            self.bar0.set_flags32(IXGBE_TXDCTL(i), IXGBE_TXDCTL_ENABLE);
            self.bar0.wait_set32(IXGBE_TXDCTL(i), IXGBE_TXDCTL_ENABLE);
        }
        Ok(())
    }

    fn enable_interrupts(&mut self) -> DriverResult {
        if self.interrupts.queues.len() != self.num_rx_queues as usize {
            return Err(DriverError::Config(format!(
                "{} interrupt queue(s) configured for {} rx queue(s)",
                self.interrupts.queues.len(),
                self.num_rx_queues
            )));
        }
        let ty = self
            .interrupts
            .interrupt_type
            .ok_or(DriverError::UnsupportedInterrupt)?;
        for queue in 0..self.num_rx_queues {
            if !self.interrupts.queues[queue as usize].interrupt_enabled {
                warn!("interrupt queue {queue} not properly initialized");
                return Err(DriverError::NotReady);
            }
            match ty {
                InterruptType::Msix => self.enable_msix_interrupt(queue),
                InterruptType::Msi => self.enable_msi_interrupt(queue),
            }
        }
        Ok(())
    }

    fn set_promisc(&mut self, enable: bool) -> DriverResult {
        if enable {
            info!("enabling promisc mode");
            self.bar0
                .set_flags32(IXGBE_FCTRL, IXGBE_FCTRL_MPE | IXGBE_FCTRL_UPE);
        } else {
            info!("disabling promisc mode");
            self.bar0
                .clear_flags32(IXGBE_FCTRL, IXGBE_FCTRL_MPE | IXGBE_FCTRL_UPE);
        }
        Ok(())
    }

    fn wait_for_link(&mut self) -> DriverResult {
        info!("waiting for link ...");
        let mut budget = Duration::from_secs(10);
        let poll = Duration::from_millis(100);
        while self.link_speed() == 0 && !budget.is_zero() {
            std::thread::sleep(poll);
            budget = budget.saturating_sub(poll);
        }
        info!("link speed is {} Mbit/s", self.link_speed());
        Ok(())
    }

    fn send_on_queue(&mut self, data: &[u8], queue_id: u16) -> DriverResult {
        let Some(ring) = self.tx_rings.get_mut(queue_id as usize) else {
            return Err(DriverError::InvalidQueue(queue_id));
        };
        ring.reclaim(TX_CLEAN_BATCH);
        if !ring.fill_frame(data) {
            return Err(DriverError::NoMemory);
        }
        let tail = ring.publish(1);
        self.notify_tx(queue_id, tail);
        Ok(())
    }
}

/// Composes a ready-to-run 82599 device.
///
/// Runs the whole bring-up in the required order: hardware init, RX/TX
/// rings, interrupt plumbing, queue enables, device-side interrupt
/// programming, promiscuous mode, link wait.
pub fn create_ixgbe(
    pci_addr: &str,
    num_queues: u16,
    num_bufs: u32,
    buf_size: u32,
    interrupt_interval: u64,
    timeout_ms: u32,
) -> DriverResult<IxgbeDevice> {
    let mut dev = IxgbeDevice::new(pci_addr, 0)?;
    dev.init_hardware()?;
    dev.set_rx_rings(num_queues, num_bufs, buf_size)?;
    dev.set_tx_rings(num_queues, num_bufs, buf_size)?;
    dev.init_interrupts(interrupt_interval, timeout_ms)?;
    dev.enable_queues()?;
    dev.enable_interrupts()?;
    dev.set_promisc(true)?;
    dev.wait_for_link()?;
    Ok(dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ipv4_checksum;

    #[test]
    fn test_canonical_frame_layout() {
        let frame = canonical_frame(0);
        assert_eq!(frame.len(), 60);
        assert_eq!(&frame[0..6], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(&frame[6..12], &[0x10; 6]);
        // IPv4 ethertype, total length 46
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
        assert_eq!(u16::from_be_bytes([frame[16], frame[17]]), 46);
        // TTL 64, UDP
        assert_eq!(frame[22], 64);
        assert_eq!(frame[23], 0x11);
        // ports 42 -> 1337, udp length 26
        assert_eq!(u16::from_be_bytes([frame[34], frame[35]]), 42);
        assert_eq!(u16::from_be_bytes([frame[36], frame[37]]), 1337);
        assert_eq!(u16::from_be_bytes([frame[38], frame[39]]), 26);
        assert_eq!(&frame[42..45], b"ixy");
    }

    #[test]
    fn test_canonical_frame_sequence_counter() {
        let frame = canonical_frame(0xDEAD_BEEF);
        assert_eq!(&frame[45..49], &0xDEAD_BEEFu32.to_le_bytes());
        // the template itself keeps the checksum field clear so the sender
        // can compute it over the final header
        assert_eq!(&frame[24..26], &[0, 0]);
        assert_ne!(ipv4_checksum(&frame[14..34]), 0);
    }

    #[test]
    fn test_ivar_packing() {
        let mut backing = vec![0u8; 0x1000];
        let bar = MmioRegion::new(backing.as_mut_ptr(), backing.len());

        // queue 0 lands in the low byte of IVAR(0)
        set_ivar(&bar, 0, 0, 0);
        assert_eq!(bar.read32(IXGBE_IVAR(0)), IXGBE_IVAR_ALLOC_VAL);

        // queue 1 shares the register, shifted 16 bits up
        set_ivar(&bar, 0, 1, 1);
        assert_eq!(
            bar.read32(IXGBE_IVAR(0)),
            IXGBE_IVAR_ALLOC_VAL | ((IXGBE_IVAR_ALLOC_VAL | 1) << 16)
        );

        // queue 2 starts the next register
        set_ivar(&bar, 0, 2, 2);
        assert_eq!(bar.read32(IXGBE_IVAR(1)), IXGBE_IVAR_ALLOC_VAL | 2);
    }
}
