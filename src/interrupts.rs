//! Interrupt management.
//!
//! Interrupts are delivered through VFIO: the kernel signals an eventfd
//! whenever the device raises the associated MSI/MSI-X vector, and the data
//! plane blocks on that fd through a per-queue epoll instance. MSI-X gets
//! one eventfd per receive queue; plain MSI shares a single eventfd across
//! all of them.
//!
//! # Interrupt Throttling
//!
//! Interrupt throttling (rate limiting) is controlled by the `itr_rate`
//! field and is expressed in units of 2μs. Common values:
//!
//! | Value | Time  | Interrupts/sec |
//! |-------|-------|----------------|
//! | 0x008 | 2μs   | ~488,200       |
//! | 0x028 | 10μs  | ~97,600        |
//! | 0xC8  | 50μs  | ~20,000        |
//! | 0x7D0 | 500μs | ~2,000         |

use std::os::unix::io::RawFd;

use crate::vfio::{ioctls, VfioPci};
use crate::{DriverError, DriverResult};

/// The number of MSI-X vectors this device can have.
/// It can be set from PCI space, but we took the value from the data sheet.
pub const IXGBE_MAX_MSIX_VECTORS: usize = 64;

/// Window length of the (reserved) adaptive moderation average.
pub const MOVING_AVERAGE_RANGE: usize = 5;

/// The type of interrupt mechanism in use.
///
/// - `Msi`: Message Signaled Interrupts (single vector)
/// - `Msix`: Extended MSI (multiple vectors)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptType {
    /// Message Signaled Interrupts, one shared vector.
    Msi,
    /// Extended MSI, one vector per queue.
    Msix,
}

impl InterruptType {
    /// The matching vfio-pci irq index.
    pub(crate) fn vfio_index(self) -> u32 {
        match self {
            InterruptType::Msi => ioctls::VFIO_PCI_MSI_IRQ_INDEX,
            InterruptType::Msix => ioctls::VFIO_PCI_MSIX_IRQ_INDEX,
        }
    }
}

/// Moving average state for a future adaptive interrupt scheme.
///
/// Carried on every queue so hybrid polling can be added without a layout
/// change; nothing reads it yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptMovingAvg {
    /// The current index into the window.
    pub index: usize,
    /// Number of valid entries in the window.
    pub length: usize,
    /// Running sum of the window.
    pub sum: u64,
    /// The measured rates making up the window.
    pub measured_rates: [u64; MOVING_AVERAGE_RANGE],
}

/// Per-RX-queue interrupt state.
///
/// Owns the eventfd signalled by the kernel and the epoll instance used to
/// block on it. The fds stay open for the lifetime of the process; closing
/// the eventfd is the cancellation path of last resort, making an in-flight
/// [`InterruptQueue::wait`] fail, which engines treat as shutdown.
pub struct InterruptQueue {
    /// Eventfd signalled when the vector fires.
    pub event_fd: RawFd,
    /// Epoll instance watching `event_fd`, level-triggered.
    pub epoll_fd: RawFd,
    /// Whether this queue's interrupt has been fully wired up.
    pub interrupt_enabled: bool,
    /// Nanosecond interval for the future adaptive scheme.
    pub interval: u64,
    /// How long [`InterruptQueue::wait`] blocks; 0 selects pure polling.
    pub timeout_ms: u32,
    /// Reserved adaptive moderation state.
    pub moving_avg: InterruptMovingAvg,
}

impl InterruptQueue {
    /// Blocks until the queue's vector fires or `timeout_ms` expires.
    ///
    /// Returns the number of ready descriptors reported by epoll (0 on
    /// timeout). The eventfd counter is read to clear the readiness edge
    /// before returning.
    pub fn wait(&self, timeout_ms: u32) -> DriverResult<u32> {
        let mut events: [libc::epoll_event; 1] = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms as i32,
            )
        };
        if rc < 0 {
            return Err(DriverError::os("wait on the interrupt epoll"));
        }
        for event in events.iter().take(rc as usize) {
            let fd = event.u64 as RawFd;
            let mut counter: u64 = 0;
            let read = unsafe {
                libc::read(fd, &mut counter as *mut u64 as *mut libc::c_void, 8)
            };
            if read != 8 {
                return Err(DriverError::os("read the interrupt eventfd"));
            }
        }
        Ok(rc as u32)
    }
}

/// Interrupt configuration for one device.
///
/// Groups the detected interrupt type, the throttle rate programmed into
/// EITR, and the per-queue eventfd/epoll state.
pub struct Interrupts {
    /// Whether interrupts are enabled for this device.
    pub interrupts_enabled: bool,
    /// Interrupt Throttling Rate (ITR) in 2μs units.
    pub itr_rate: u32,
    /// The detected interrupt type, once probing has run.
    pub interrupt_type: Option<InterruptType>,
    /// Interrupt state per RX queue.
    pub queues: Vec<InterruptQueue>,
}

impl Default for Interrupts {
    fn default() -> Self {
        Interrupts {
            interrupts_enabled: false,
            // 10μs, ~97k interrupts/s; a reasonable default between
            // latency and per-packet cost
            itr_rate: 0x028,
            interrupt_type: None,
            queues: Vec::new(),
        }
    }
}

impl Interrupts {
    /// Probes which interrupt type the device supports, preferring MSI-X
    /// over MSI.
    ///
    /// A vector type is only usable when the kernel can route it to an
    /// eventfd; anything else (including legacy INTx) is rejected.
    pub fn detect_type(&mut self, vfio: &VfioPci) -> DriverResult<InterruptType> {
        info!("setting up VFIO interrupts");
        for ty in [InterruptType::Msix, InterruptType::Msi] {
            let irq = vfio.irq_info(ty.vfio_index())?;
            if irq.flags & ioctls::VFIO_IRQ_INFO_EVENTFD == 0 {
                debug!("irq index {} does not support eventfds", irq.index);
                continue;
            }
            debug!("using irq type {:?} with {} vectors", ty, irq.count);
            self.interrupt_type = Some(ty);
            return Ok(ty);
        }
        Err(DriverError::UnsupportedInterrupt)
    }

    /// Allocates and registers the per-queue eventfds.
    ///
    /// MSI-X: one eventfd per RX queue, each bound to its own vector and
    /// its own epoll instance. MSI: a single eventfd and epoll instance
    /// shared by every queue - distinguishing queues on a shared vector is
    /// the caller's problem and only sound with one RX queue.
    pub fn setup_queues(
        &mut self,
        vfio: &VfioPci,
        num_rx_queues: u16,
        interval: u64,
        timeout_ms: u32,
    ) -> DriverResult {
        let ty = self.interrupt_type.ok_or(DriverError::UnsupportedInterrupt)?;
        match ty {
            InterruptType::Msix => {
                info!("enabling MSI-X interrupts");
                for queue in 0..num_rx_queues {
                    let event_fd = create_eventfd()?;
                    vfio.set_irq_eventfd(ty.vfio_index(), queue as u32, event_fd)?;
                    let epoll_fd = epoll_for(event_fd)?;
                    self.queues.push(InterruptQueue {
                        event_fd,
                        epoll_fd,
                        interrupt_enabled: true,
                        interval,
                        timeout_ms,
                        moving_avg: InterruptMovingAvg::default(),
                    });
                }
            }
            InterruptType::Msi => {
                info!("enabling MSI interrupts");
                let event_fd = create_eventfd()?;
                vfio.set_irq_eventfd(ty.vfio_index(), 0, event_fd)?;
                let epoll_fd = epoll_for(event_fd)?;
                for _ in 0..num_rx_queues {
                    self.queues.push(InterruptQueue {
                        event_fd,
                        epoll_fd,
                        interrupt_enabled: true,
                        interval,
                        timeout_ms,
                        moving_avg: InterruptMovingAvg::default(),
                    });
                }
            }
        }
        self.interrupts_enabled = true;
        Ok(())
    }
}

/// Fresh eventfd with a zero counter.
fn create_eventfd() -> DriverResult<RawFd> {
    let fd = unsafe { libc::eventfd(0, 0) };
    if fd < 0 {
        return Err(DriverError::os("create an eventfd"));
    }
    Ok(fd)
}

/// New epoll instance watching `event_fd` for level-triggered reads.
fn epoll_for(event_fd: RawFd) -> DriverResult<RawFd> {
    let epoll_fd = unsafe { libc::epoll_create1(0) };
    if epoll_fd < 0 {
        return Err(DriverError::os("create an epoll instance"));
    }
    let mut event = libc::epoll_event {
        events: libc::EPOLLIN as u32,
        u64: event_fd as u64,
    };
    let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, event_fd, &mut event) };
    if ret < 0 {
        return Err(DriverError::os("add the eventfd to epoll"));
    }
    Ok(epoll_fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_queue(timeout_ms: u32) -> InterruptQueue {
        let event_fd = create_eventfd().unwrap();
        let epoll_fd = epoll_for(event_fd).unwrap();
        InterruptQueue {
            event_fd,
            epoll_fd,
            interrupt_enabled: true,
            interval: 0,
            timeout_ms,
            moving_avg: InterruptMovingAvg::default(),
        }
    }

    fn signal(queue: &InterruptQueue) {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                queue.event_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        assert_eq!(ret, 8);
    }

    #[test]
    fn test_wait_times_out_with_no_signal() {
        let queue = test_queue(10);
        assert_eq!(queue.wait(10).unwrap(), 0);
    }

    #[test]
    fn test_wait_wakes_on_signal_and_clears_it() {
        let queue = test_queue(100);
        signal(&queue);
        assert_eq!(queue.wait(100).unwrap(), 1);
        // the counter was consumed, the next wait times out again
        assert_eq!(queue.wait(10).unwrap(), 0);
    }

    #[test]
    fn test_default_throttle_rate() {
        let interrupts = Interrupts::default();
        assert_eq!(interrupts.itr_rate, 0x028);
        assert!(!interrupts.interrupts_enabled);
        assert!(interrupts.interrupt_type.is_none());
    }

    #[test]
    fn test_interrupt_type_maps_to_vfio_indexes() {
        assert_eq!(InterruptType::Msi.vfio_index(), 1);
        assert_eq!(InterruptType::Msix.vfio_index(), 2);
    }
}
