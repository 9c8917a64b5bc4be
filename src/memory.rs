//! DMA memory management.
//!
//! This module provides the DMA memory subsystem shared by every device
//! family. It includes:
//!
//! - [`DmaAllocator`]: huge-page backed allocations with device-visible
//!   IO virtual addresses (IOVAs), registered with the IOMMU
//! - [`DmaRegion`]: one `(virt, iova, size)` triple
//! - [`BufferPool`]: a fixed-size packet buffer pool carved out of a single
//!   DMA region
//! - [`PacketBuffer`]: the in-band header at the start of every pool slot
//!
//! # Memory layout
//!
//! A pool's region is split into `num_bufs` slots of `buf_size` bytes. Each
//! slot starts with a 64-byte [`PacketBuffer`] header; the payload area
//! begins right after it and is therefore cache-line aligned. The same byte
//! is reachable from the CPU through the slot's virtual address and from the
//! device through `iova + offset`, so no translation happens on the hot
//! path.
//!
//! # Teardown
//!
//! DMA regions are deliberately never unmapped: the container fd may already
//! be closed when destructors run, and the kernel reclaims all mappings on
//! process exit anyway. This mirrors long-standing practice in userspace
//! drivers.

use std::os::unix::io::RawFd;

use crate::vfio::{ioctls, VfioDmaMap};
use crate::{DriverError, DriverResult};

/// Huge pages are 2 MiB on x86.
pub const HUGE_PAGE_BITS: u32 = 21;
/// Size of one huge page in bytes.
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_BITS;

/// Headroom reserved in each packet buffer header.
///
/// This space can be used to prepend headers (e.g. VLAN, tunnel
/// encapsulation) without copying the payload.
pub const PACKET_HEADROOM: usize = 40;

/// First IOVA handed out by the allocator. The low 64 KiB stay unmapped so
/// that a stray zero address written to a device register faults instead of
/// silently hitting a live mapping.
const IOVA_START: u64 = 0x10000;

/// One DMA allocation: a CPU pointer, a device address and a size.
///
/// `size` is always a multiple of the huge page size and `iova` is huge-page
/// aligned. The byte at CPU offset `k` and the device byte at `iova + k`
/// reference the same physical memory for the whole region.
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    virt: *mut u8,
    iova: u64,
    size: usize,
}

// The region points into shared anonymous memory owned by the allocator's
// registry for the lifetime of the process.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    pub(crate) fn new(virt: *mut u8, iova: u64, size: usize) -> Self {
        DmaRegion { virt, iova, size }
    }

    /// CPU pointer to the start of the region.
    pub fn virt(&self) -> *mut u8 {
        self.virt
    }

    /// Device-visible address of the start of the region.
    pub fn iova(&self) -> u64 {
        self.iova
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Huge-page DMA allocator with a linear IOVA cursor.
///
/// Replaces the usual process-wide singleton: each device owns one
/// allocator and passes it by reference wherever DMA memory is needed.
/// `&mut` receivers serialize cursor advancement, so no lock is required.
///
/// All failure modes are fatal by design: the data plane expects one
/// contiguous IOVA aperture sized for the whole run, and partial recovery
/// would leave pools in an ambiguous state.
pub struct DmaAllocator {
    container: Option<RawFd>,
    next_iova: u64,
    regions: Vec<DmaRegion>,
    #[cfg(test)]
    heap_backed: bool,
}

impl DmaAllocator {
    /// Creates an allocator mapping against the given VFIO container.
    ///
    /// Without a container fd the memory is still allocated and IOVAs are
    /// still assigned, but nothing is registered with the IOMMU; such
    /// regions are only useful for devices that never DMA.
    pub fn new(container: Option<RawFd>) -> Self {
        if container.is_none() {
            warn!("no container fd provided, DMA memory will not be IOMMU mapped");
        }
        DmaAllocator {
            container,
            next_iova: IOVA_START,
            regions: Vec::new(),
            #[cfg(test)]
            heap_backed: false,
        }
    }

    /// Test-only allocator backed by the ordinary heap instead of huge
    /// pages, so pool and ring logic can run without any hugetlb setup.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        DmaAllocator {
            container: None,
            next_iova: IOVA_START,
            regions: Vec::new(),
            heap_backed: true,
        }
    }

    /// Allocates `size` bytes of DMA memory, rounded up to whole huge
    /// pages, and maps them into the device's IOVA space.
    pub fn alloc(&mut self, size: usize) -> DriverResult<DmaRegion> {
        let size = align_up(size as u64, HUGE_PAGE_SIZE as u64)
            .ok_or(DriverError::IovaExhausted(size as u64))? as usize;
        // page-aligned IOVAs avoid overlap across mappings
        let iova = align_up(self.next_iova, HUGE_PAGE_SIZE as u64)
            .and_then(|iova| iova.checked_add(size as u64).map(|_| iova))
            .ok_or(DriverError::IovaExhausted(size as u64))?;

        let virt = self.alloc_virt(size)?;
        if let Some(container_fd) = self.container {
            map_dma(container_fd, virt, iova, size)?;
        }
        self.next_iova = iova + size as u64;

        let region = DmaRegion::new(virt, iova, size);
        debug!(
            "allocated DMA memory @iova: {:#x}, virt: {:p}, size: {:#x}",
            region.iova, region.virt, region.size
        );
        self.regions.push(region);
        Ok(region)
    }

    /// Reserves huge-page backed virtual memory with read/write permissions.
    fn alloc_virt(&self, size: usize) -> DriverResult<*mut u8> {
        #[cfg(test)]
        if self.heap_backed {
            let layout = std::alloc::Layout::from_size_align(size, HUGE_PAGE_SIZE)
                .map_err(|_| DriverError::NoMemory)?;
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(DriverError::NoMemory);
            }
            return Ok(ptr);
        }

        let virt = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | libc::MAP_HUGE_2MB,
                -1,
                0,
            )
        };
        if virt == libc::MAP_FAILED {
            error!(
                "failed to mmap huge-page DMA memory: {}. Are huge pages configured?",
                std::io::Error::last_os_error()
            );
            return Err(DriverError::NoMemory);
        }
        Ok(virt as *mut u8)
    }

    /// Regions handed out so far.
    pub fn regions(&self) -> &[DmaRegion] {
        &self.regions
    }
}

/// Registers `(virt, iova, size)` with the IOMMU, readable and writable by
/// the device.
fn map_dma(container_fd: RawFd, virt: *mut u8, iova: u64, size: usize) -> DriverResult {
    let dma_map = VfioDmaMap {
        argsz: std::mem::size_of::<VfioDmaMap>() as u32,
        flags: ioctls::VFIO_DMA_MAP_FLAG_READ | ioctls::VFIO_DMA_MAP_FLAG_WRITE,
        vaddr: virt as u64,
        iova,
        size: size as u64,
    };
    let ret = unsafe { libc::ioctl(container_fd, ioctls::VFIO_IOMMU_MAP_DMA as _, &dma_map) };
    if ret < 0 {
        return Err(DriverError::os("map DMA memory with the IOMMU"));
    }
    Ok(())
}

fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 {
        return Some(value);
    }
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

/// In-band header at the start of every pool slot.
///
/// The header is exactly one cache line; the payload area starts right
/// after it, so `iova + data_offset()` is the device address of the first
/// payload byte. Buffers are identified by `idx` - rings and pools never
/// compare pointers.
#[repr(C, align(64))]
pub struct PacketBuffer {
    /// Device address of this buffer's slot.
    iova: u64,
    /// Slot index in the owning pool; unique and stable.
    idx: u32,
    /// Length of the payload currently in the buffer. Written by the device
    /// on receive.
    len: u32,
    /// Reserved space for header prepends.
    headroom: [u8; PACKET_HEADROOM],
    /// Points past this header, into the same slot.
    data: *mut u8,
}

impl PacketBuffer {
    /// Offset of the payload area from the start of the slot.
    pub const fn data_offset() -> usize {
        std::mem::size_of::<PacketBuffer>()
    }

    /// Slot index of this buffer in its pool.
    pub fn idx(&self) -> u32 {
        self.idx
    }

    /// Device address of the start of the slot (not of the payload).
    pub fn iova(&self) -> u64 {
        self.iova
    }

    /// Current payload length in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the buffer currently holds no payload.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the payload length.
    pub fn set_len(&mut self, len: u32) {
        self.len = len;
    }

    /// The payload as a byte slice of the current length.
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len as usize) }
    }

    /// Raw pointer to the payload area.
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.data
    }

    /// The headroom bytes, mutable.
    pub fn headroom_mut(&mut self) -> &mut [u8] {
        &mut self.headroom
    }
}

/// A fixed-size pool of DMA-capable packet buffers.
///
/// The pool owns one [`DmaRegion`] of `num_bufs * buf_size` bytes and a
/// free stack of slot indices. Popping and releasing are O(1); a release
/// that would overflow the stack is reported as a double free and dropped
/// rather than corrupting the stack.
///
/// The pool is single-threaded by design; callers that share one across
/// threads must add their own synchronization.
pub struct BufferPool {
    region: DmaRegion,
    num_bufs: u32,
    buf_size: u32,
    free_stack: Vec<u32>,
}

impl BufferPool {
    /// Allocates a pool of `num_bufs` buffers of `buf_size` bytes each.
    ///
    /// `buf_size` must divide the huge page size evenly so slots never
    /// straddle page boundaries, and must leave room for the in-band
    /// header.
    pub fn allocate(
        allocator: &mut DmaAllocator,
        num_bufs: u32,
        buf_size: u32,
    ) -> DriverResult<BufferPool> {
        if buf_size == 0 || HUGE_PAGE_SIZE % buf_size as usize != 0 {
            error!("entry size must be a divisor of the huge page size");
            return Err(DriverError::PageNotAligned);
        }
        if buf_size as usize <= PacketBuffer::data_offset() {
            return Err(DriverError::Config(format!(
                "buffer size {buf_size} does not leave room for the {} byte header",
                PacketBuffer::data_offset()
            )));
        }

        let region = allocator.alloc(num_bufs as usize * buf_size as usize)?;
        for idx in 0..num_bufs {
            let offset = idx as usize * buf_size as usize;
            let slot = unsafe { region.virt().add(offset) } as *mut PacketBuffer;
            unsafe {
                std::ptr::write(
                    slot,
                    PacketBuffer {
                        // the offset is shared by the virtual address and the IOVA
                        iova: region.iova() + offset as u64,
                        idx,
                        len: 0,
                        headroom: [0; PACKET_HEADROOM],
                        data: (slot as *mut u8).add(PacketBuffer::data_offset()),
                    },
                );
            }
        }

        info!("buffer pool created: {num_bufs} x {buf_size} bytes");
        Ok(BufferPool {
            region,
            num_bufs,
            buf_size,
            free_stack: (0..num_bufs).collect(),
        })
    }

    /// Number of buffers in the pool.
    pub fn capacity(&self) -> u32 {
        self.num_bufs
    }

    /// Size of one slot in bytes, including the header.
    pub fn buf_size(&self) -> u32 {
        self.buf_size
    }

    /// Number of buffers currently on the free stack.
    pub fn free_count(&self) -> usize {
        self.free_stack.len()
    }

    fn slot_ptr(&self, idx: u32) -> *mut PacketBuffer {
        (unsafe { self.region.virt().add(idx as usize * self.buf_size as usize) })
            as *mut PacketBuffer
    }

    /// Pops one free buffer, or `None` when the pool is empty.
    pub fn pop(&mut self) -> Option<&mut PacketBuffer> {
        let idx = self.free_stack.pop()?;
        Some(unsafe { &mut *self.slot_ptr(idx) })
    }

    /// Pops up to `out.len()` buffers, writing their indices into `out`.
    ///
    /// Stops early when the pool runs empty; returns the number of indices
    /// actually written.
    pub fn pop_many(&mut self, out: &mut [u32]) -> usize {
        let mut count = 0;
        for slot in out.iter_mut() {
            match self.free_stack.pop() {
                Some(idx) => {
                    *slot = idx;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Returns the buffer at `idx` without affecting the free stack, or
    /// `None` when `idx` is out of range.
    pub fn get(&self, idx: u32) -> Option<&PacketBuffer> {
        if idx >= self.num_bufs {
            warn!("buffer index {idx} out of range");
            return None;
        }
        Some(unsafe { &*self.slot_ptr(idx) })
    }

    /// Mutable variant of [`BufferPool::get`].
    pub fn get_mut(&mut self, idx: u32) -> Option<&mut PacketBuffer> {
        if idx >= self.num_bufs {
            warn!("buffer index {idx} out of range");
            return None;
        }
        Some(unsafe { &mut *self.slot_ptr(idx) })
    }

    /// Returns the buffer at `idx` to the free stack.
    ///
    /// A release that would overflow the stack indicates a double free; it
    /// is reported and dropped so the stack stays consistent.
    pub fn release(&mut self, idx: u32) {
        if idx >= self.num_bufs {
            warn!("release: buffer index {idx} out of range");
            return;
        }
        if self.free_stack.len() >= self.num_bufs as usize {
            warn!("release: free stack overflow, possible double free of buffer {idx}");
            return;
        }
        self.free_stack.push(idx);
    }

    pub(crate) fn region(&self) -> &DmaRegion {
        &self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(num_bufs: u32, buf_size: u32) -> BufferPool {
        let mut allocator = DmaAllocator::for_tests();
        BufferPool::allocate(&mut allocator, num_bufs, buf_size).expect("pool allocation")
    }

    #[test]
    fn test_header_is_one_cache_line() {
        assert_eq!(std::mem::size_of::<PacketBuffer>(), 64);
        assert_eq!(std::mem::align_of::<PacketBuffer>(), 64);
        assert_eq!(PacketBuffer::data_offset(), 64);
        assert_eq!(PACKET_HEADROOM, 40);
    }

    #[test]
    fn test_huge_page_constants() {
        assert_eq!(HUGE_PAGE_BITS, 21);
        assert_eq!(HUGE_PAGE_SIZE, 0x200000);
    }

    #[test]
    fn test_slot_initialization() {
        let pool = test_pool(16, 2048);
        for idx in 0..16 {
            let buf = pool.get(idx).unwrap();
            assert_eq!(buf.idx(), idx);
            assert_eq!(buf.len(), 0);
            assert_eq!(buf.iova(), pool.region().iova() + idx as u64 * 2048);
            // the payload area starts right after the header
            let base = buf as *const PacketBuffer as usize;
            assert_eq!(buf.data_ptr() as usize, base + PacketBuffer::data_offset());
            assert_eq!(buf.data_ptr() as usize % 64, 0);
        }
    }

    #[test]
    fn test_pop_release_is_a_noop_for_pool_state() {
        let mut pool = test_pool(8, 2048);
        assert_eq!(pool.free_count(), 8);
        let idx = pool.pop().map(|b| b.idx()).unwrap();
        assert_eq!(pool.free_count(), 7);
        pool.release(idx);
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn test_pop_many_stops_on_empty() {
        let mut pool = test_pool(4, 2048);
        let mut out = [0u32; 8];
        assert_eq!(pool.pop_many(&mut out), 4);
        assert_eq!(pool.pop_many(&mut out), 0);
        // every index handed out exactly once
        let mut seen = out[..4].to_vec();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_get_out_of_range_returns_none() {
        let pool = test_pool(4, 2048);
        assert!(pool.get(4).is_none());
        assert!(pool.get(u32::MAX).is_none());
    }

    #[test]
    fn test_double_free_is_detected_and_dropped() {
        let mut pool = test_pool(4, 2048);
        let idx = pool.pop().map(|b| b.idx()).unwrap();
        pool.release(idx);
        let before = pool.free_count();
        pool.release(idx);
        assert_eq!(pool.free_count(), before);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = test_pool(2, 2048);
        assert!(pool.pop().is_some());
        assert!(pool.pop().is_some());
        assert!(pool.pop().is_none());
    }

    #[test]
    fn test_invalid_buf_size_rejected() {
        let mut allocator = DmaAllocator::for_tests();
        let result = BufferPool::allocate(&mut allocator, 16, 1500);
        assert!(matches!(result, Err(DriverError::PageNotAligned)));
        let result = BufferPool::allocate(&mut allocator, 16, 64);
        assert!(matches!(result, Err(DriverError::Config(_))));
    }

    #[test]
    fn test_allocations_never_overlap() {
        let mut allocator = DmaAllocator::for_tests();
        let a = allocator.alloc(1).unwrap();
        let b = allocator.alloc(HUGE_PAGE_SIZE + 1).unwrap();
        assert_eq!(a.size() % HUGE_PAGE_SIZE, 0);
        assert_eq!(b.size(), 2 * HUGE_PAGE_SIZE);
        assert!(b.iova() >= a.iova() + a.size() as u64);
        assert_eq!(a.iova() % HUGE_PAGE_SIZE as u64, 0);
    }

    #[test]
    fn test_iova_cursor_exhaustion_is_fatal() {
        let mut allocator = DmaAllocator::for_tests();
        allocator.next_iova = u64::MAX - HUGE_PAGE_SIZE as u64;
        let result = allocator.alloc(2 * HUGE_PAGE_SIZE);
        assert!(matches!(result, Err(DriverError::IovaExhausted(_))));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(1, 8), Some(8));
        assert_eq!(align_up(8, 8), Some(8));
        assert_eq!(align_up(u64::MAX, 8), None);
        assert_eq!(align_up(7, 0), Some(7));
    }
}
