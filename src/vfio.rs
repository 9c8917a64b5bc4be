//! VFIO container/group/device plumbing.
//!
//! Hardware-agnostic passthrough setup shared by every device family: open
//! the container, attach the device's IOMMU group, obtain the device handle,
//! mmap its BARs, flip the bus-master bit in config space, and wire eventfds
//! into interrupt vectors.
//!
//! The VFIO ioctl numbers and structs are declared by hand; the API is small
//! and stable, and a wrapper crate would only get in the way of the
//! variable-length `VFIO_DEVICE_SET_IRQS` payload.

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;

use crate::mmio::MmioRegion;
use crate::{DriverError, DriverResult};

/// VFIO ioctl numbers (from the kernel headers).
///
/// All VFIO ioctls are `_IO(';', 100 + offset)`, i.e. they carry no size in
/// the request number: `(type << 8) | nr`.
pub(crate) mod ioctls {
    use std::os::raw::c_ulong;

    const fn io(ty: u8, nr: u8) -> c_ulong {
        ((ty as c_ulong) << 8) | (nr as c_ulong)
    }

    pub const VFIO_TYPE: u8 = b';';
    pub const VFIO_BASE: u8 = 100;

    // container ioctls
    pub const VFIO_GET_API_VERSION: c_ulong = io(VFIO_TYPE, VFIO_BASE);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(VFIO_TYPE, VFIO_BASE + 1);
    pub const VFIO_SET_IOMMU: c_ulong = io(VFIO_TYPE, VFIO_BASE + 2);

    // group ioctls
    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(VFIO_TYPE, VFIO_BASE + 6);

    // device ioctls
    pub const VFIO_DEVICE_GET_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 7);
    pub const VFIO_DEVICE_GET_REGION_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 8);
    pub const VFIO_DEVICE_GET_IRQ_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 9);
    pub const VFIO_DEVICE_SET_IRQS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 10);
    pub const VFIO_DEVICE_RESET: c_ulong = io(VFIO_TYPE, VFIO_BASE + 11);

    // IOMMU DMA mapping
    pub const VFIO_IOMMU_MAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 13);
    pub const VFIO_IOMMU_UNMAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 14);

    pub const VFIO_API_VERSION: i32 = 0;
    pub const VFIO_TYPE1_IOMMU: u32 = 1;

    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;

    pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;

    // fixed region indexes of vfio-pci devices
    pub const VFIO_PCI_BAR0_REGION_INDEX: u32 = 0;
    pub const VFIO_PCI_BAR5_REGION_INDEX: u32 = 5;
    pub const VFIO_PCI_CONFIG_REGION_INDEX: u32 = 7;

    // fixed irq indexes of vfio-pci devices
    pub const VFIO_PCI_INTX_IRQ_INDEX: u32 = 0;
    pub const VFIO_PCI_MSI_IRQ_INDEX: u32 = 1;
    pub const VFIO_PCI_MSIX_IRQ_INDEX: u32 = 2;

    pub const VFIO_IRQ_INFO_EVENTFD: u32 = 1 << 0;

    pub const VFIO_IRQ_SET_DATA_EVENTFD: u32 = 1 << 2;
    pub const VFIO_IRQ_SET_ACTION_TRIGGER: u32 = 1 << 5;
}

/// VFIO group status, filled by `VFIO_GROUP_GET_STATUS`.
#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

/// VFIO region info, filled by `VFIO_DEVICE_GET_REGION_INFO`.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct VfioRegionInfo {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub cap_offset: u32,
    pub size: u64,
    pub offset: u64,
}

/// VFIO irq info, filled by `VFIO_DEVICE_GET_IRQ_INFO`.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct VfioIrqInfo {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub count: u32,
}

/// `VFIO_DEVICE_SET_IRQS` payload carrying exactly one eventfd.
///
/// The kernel struct ends in a flexible array member; the driver only ever
/// registers one fd per call, so a fixed 4-byte tail is enough.
#[repr(C)]
struct VfioIrqSet {
    argsz: u32,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
    data: [u8; 4],
}

/// `VFIO_IOMMU_MAP_DMA` request.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct VfioDmaMap {
    pub argsz: u32,
    pub flags: u32,
    pub vaddr: u64,
    pub iova: u64,
    pub size: u64,
}

/// The VFIO handle triple for one PCI device.
///
/// Owns the container, group and device file descriptors. The container
/// must outlive every DMA mapping made against it, which holds trivially
/// because the device object owns both this handle and all DMA memory.
pub struct VfioPci {
    pci_addr: String,
    group_id: u32,
    container: File,
    group: File,
    device: File,
}

impl VfioPci {
    /// Opens the passthrough handles for the device at `pci_addr`
    /// (e.g. `0000:04:00.0`).
    ///
    /// Performs, in order: container open + API/type-1 checks, group id
    /// resolution from sysfs, group viability check, group attach,
    /// `VFIO_SET_IOMMU` (tolerating `EBUSY` when the container is already
    /// configured), device fd lookup. Each step is fatal on failure.
    pub fn open(pci_addr: &str) -> DriverResult<Self> {
        let group_id = Self::group_id_for(pci_addr)?;
        info!("IOMMU group id: {group_id}");

        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vfio/vfio")
            .map_err(|e| DriverError::Os {
                op: "open /dev/vfio/vfio",
                source: e,
            })?;

        let api = unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION as _) };
        if api != ioctls::VFIO_API_VERSION {
            return Err(DriverError::Config(format!(
                "incompatible VFIO API version {api}"
            )));
        }

        let has_type1 = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION as _,
                ioctls::VFIO_TYPE1_IOMMU,
            )
        };
        if has_type1 != 1 {
            return Err(DriverError::Config(
                "container does not support the type-1 IOMMU".into(),
            ));
        }

        let group_path = format!("/dev/vfio/{group_id}");
        let group = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&group_path)
            .map_err(|e| DriverError::Os {
                op: "open the VFIO group",
                source: e,
            })?;

        let mut status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_STATUS as _,
                &mut status,
            )
        };
        if ret < 0 {
            return Err(DriverError::os("get VFIO group status"));
        }
        if status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(DriverError::Config(
                "VFIO group is not viable - are all devices in the group bound to vfio-pci?".into(),
            ));
        }

        let container_fd = container.as_raw_fd();
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER as _,
                &container_fd,
            )
        };
        if ret < 0 {
            return Err(DriverError::os("attach the group to the container"));
        }

        // EBUSY means another group already set the IOMMU type on this
        // container, which is fine.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU as _,
                ioctls::VFIO_TYPE1_IOMMU,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EBUSY) {
                return Err(DriverError::Os {
                    op: "set the type-1 IOMMU on the container",
                    source: err,
                });
            }
        }

        let addr_cstr = std::ffi::CString::new(pci_addr)
            .map_err(|_| DriverError::Config(format!("invalid PCI address {pci_addr:?}")))?;
        let device_fd = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD as _,
                addr_cstr.as_ptr(),
            )
        };
        if device_fd < 0 {
            return Err(DriverError::os("get the device fd from the group"));
        }
        let device = unsafe { File::from_raw_fd(device_fd) };

        Ok(VfioPci {
            pci_addr: pci_addr.to_string(),
            group_id,
            container,
            group,
            device,
        })
    }

    /// Resolves the IOMMU group id from the device's sysfs symlink.
    fn group_id_for(pci_addr: &str) -> DriverResult<u32> {
        let device_dir = Path::new("/sys/bus/pci/devices").join(pci_addr);
        if !device_dir.exists() {
            return Err(DriverError::Config(format!(
                "PCI device {pci_addr} not found in sysfs"
            )));
        }
        let link = std::fs::read_link(device_dir.join("iommu_group")).map_err(|e| {
            DriverError::Config(format!(
                "no iommu_group for {pci_addr}: {e}. Is the IOMMU enabled?"
            ))
        })?;
        link.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| DriverError::Config(format!("malformed iommu_group link for {pci_addr}")))
    }

    /// The PCI address this handle was opened for.
    pub fn pci_addr(&self) -> &str {
        &self.pci_addr
    }

    /// The IOMMU group id of the device.
    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    /// Raw container fd, needed by the DMA allocator for map requests.
    pub fn container_fd(&self) -> RawFd {
        self.container.as_raw_fd()
    }

    /// Raw device fd.
    pub fn device_fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }

    /// Queries info about one device region (BAR or config space).
    pub(crate) fn region_info(&self, index: u32) -> DriverResult<VfioRegionInfo> {
        let mut info = VfioRegionInfo {
            argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
            index,
            ..Default::default()
        };
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_REGION_INFO as _,
                &mut info,
            )
        };
        if ret < 0 {
            return Err(DriverError::os("get region info"));
        }
        Ok(info)
    }

    /// Memory-maps the BARs `0..=max_bar_index` read-write.
    ///
    /// Zero-sized BARs stay `None`. The 82599 exposes everything the driver
    /// needs in BAR0; the FPGA designs as well.
    pub fn map_bars(&self, max_bar_index: u32) -> DriverResult<Vec<Option<MmioRegion>>> {
        if max_bar_index > ioctls::VFIO_PCI_BAR5_REGION_INDEX {
            return Err(DriverError::Config(format!(
                "BAR index {max_bar_index} is out of range"
            )));
        }
        let mut bars = Vec::new();
        for index in 0..=max_bar_index {
            let info = self.region_info(index)?;
            if info.size == 0 {
                info!("BAR{index} has size 0, skipping");
                bars.push(None);
                continue;
            }
            let region = MmioRegion::map(self.device.as_raw_fd(), info.offset, info.size as usize)?;
            info!("BAR{index} mapped ({:#x} bytes)", info.size);
            bars.push(Some(region));
        }
        Ok(bars)
    }

    /// Enables bus mastering so the device may issue DMA.
    ///
    /// Sets bit 2 of the command register (config space offset 4) through
    /// the config region; see PCIe 3.0 section 7.5.1.1.
    pub fn enable_bus_master(&self) -> DriverResult {
        const COMMAND_REGISTER_OFFSET: u64 = 4;
        const BUS_MASTER_ENABLE_BIT: u16 = 1 << 2;

        let conf = self.region_info(ioctls::VFIO_PCI_CONFIG_REGION_INDEX)?;
        let mut command: u16 = 0;
        let offset = (conf.offset + COMMAND_REGISTER_OFFSET) as libc::off_t;
        let ret = unsafe {
            libc::pread(
                self.device.as_raw_fd(),
                &mut command as *mut u16 as *mut libc::c_void,
                2,
                offset,
            )
        };
        if ret != 2 {
            return Err(DriverError::os("read the PCI command register"));
        }
        command |= BUS_MASTER_ENABLE_BIT;
        let ret = unsafe {
            libc::pwrite(
                self.device.as_raw_fd(),
                &command as *const u16 as *const libc::c_void,
                2,
                offset,
            )
        };
        if ret != 2 {
            return Err(DriverError::os("write the PCI command register"));
        }
        Ok(())
    }

    /// Queries info about one interrupt index (INTx/MSI/MSI-X).
    pub(crate) fn irq_info(&self, index: u32) -> DriverResult<VfioIrqInfo> {
        let mut info = VfioIrqInfo {
            argsz: std::mem::size_of::<VfioIrqInfo>() as u32,
            index,
            ..Default::default()
        };
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_IRQ_INFO as _,
                &mut info,
            )
        };
        if ret < 0 {
            return Err(DriverError::os("get irq info"));
        }
        Ok(info)
    }

    /// Registers `event_fd` as the trigger for vector `vector` of the given
    /// interrupt index. The kernel signals the fd whenever the vector fires.
    pub(crate) fn set_irq_eventfd(
        &self,
        irq_index: u32,
        vector: u32,
        event_fd: RawFd,
    ) -> DriverResult {
        let mut irq_set = VfioIrqSet {
            argsz: std::mem::size_of::<VfioIrqSet>() as u32,
            flags: ioctls::VFIO_IRQ_SET_DATA_EVENTFD | ioctls::VFIO_IRQ_SET_ACTION_TRIGGER,
            index: irq_index,
            start: vector,
            count: 1,
            data: [0; 4],
        };
        irq_set.data.copy_from_slice(&event_fd.to_ne_bytes());
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_SET_IRQS as _,
                &irq_set,
            )
        };
        if ret < 0 {
            return Err(DriverError::os("set the irq eventfd"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers_match_the_kernel() {
        // _IO(';', 100) and friends; mismatches here brick every ioctl
        assert_eq!(ioctls::VFIO_GET_API_VERSION, 0x3B64);
        assert_eq!(ioctls::VFIO_CHECK_EXTENSION, 0x3B65);
        assert_eq!(ioctls::VFIO_SET_IOMMU, 0x3B66);
        assert_eq!(ioctls::VFIO_GROUP_GET_STATUS, 0x3B67);
        assert_eq!(ioctls::VFIO_GROUP_SET_CONTAINER, 0x3B68);
        assert_eq!(ioctls::VFIO_GROUP_GET_DEVICE_FD, 0x3B6A);
        assert_eq!(ioctls::VFIO_DEVICE_GET_REGION_INFO, 0x3B6C);
        assert_eq!(ioctls::VFIO_DEVICE_GET_IRQ_INFO, 0x3B6D);
        assert_eq!(ioctls::VFIO_DEVICE_SET_IRQS, 0x3B6E);
        assert_eq!(ioctls::VFIO_IOMMU_MAP_DMA, 0x3B71);
        assert_eq!(ioctls::VFIO_IOMMU_UNMAP_DMA, 0x3B72);
    }

    #[test]
    fn test_struct_layouts_match_the_kernel() {
        assert_eq!(std::mem::size_of::<VfioGroupStatus>(), 8);
        assert_eq!(std::mem::size_of::<VfioRegionInfo>(), 32);
        assert_eq!(std::mem::size_of::<VfioIrqInfo>(), 16);
        assert_eq!(std::mem::size_of::<VfioDmaMap>(), 32);
        // vfio_irq_set header (20 bytes) plus one eventfd
        assert_eq!(std::mem::size_of::<VfioIrqSet>(), 24);
    }

    #[test]
    fn test_missing_device_is_a_config_error() {
        let err = VfioPci::group_id_for("ffff:ff:1f.7").unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }
}
