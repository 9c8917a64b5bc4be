//! RX and TX descriptor rings.
//!
//! A ring binds a DMA'd descriptor array to the device's per-queue BAR
//! registers and tracks which packet buffer is linked to each descriptor
//! slot. Cursors wrap by masking, so the descriptor count must be a power
//! of two; `head == tail` means empty and `wrap(tail + 1) == head` means
//! full, leaving one slot unused.
//!
//! Rings own their buffer pool. The slot table stores buffer *indices*, not
//! pointers - the index is the identity of a buffer, which keeps the pool
//! free to hand out `&mut` references without aliasing concerns.
//!
//! Lifecycle of a TX descriptor slot:
//! `FREE -> LINKED (publish) -> IN_FLIGHT (tail register written) ->
//! DONE (device writeback) -> FREE (reclaim)`.

use crate::constants::*;
use crate::descriptor::{AdvancedRxDescriptor, AdvancedTxDescriptor};
use crate::memory::{BufferPool, DmaAllocator, DmaRegion, PacketBuffer};
use crate::mmio::MmioRegion;
use crate::{DriverError, DriverResult};

/// Largest supported descriptor count; bounded by the 16-bit ring cursors.
const MAX_RING_SIZE: u32 = 32768;

/// Advances a ring cursor by one, wrapping at `ring_size` (a power of two).
pub(crate) fn wrap_ring(index: u16, ring_size: u16) -> u16 {
    index.wrapping_add(1) & (ring_size - 1)
}

/// Allocates the descriptor array for a ring and fills it with `0xFF`.
///
/// The all-ones pattern makes rogue DMA before the ring is armed fault
/// loudly instead of corrupting address zero (a trick borrowed from Snabb).
fn alloc_desc_memory(
    allocator: &mut DmaAllocator,
    num_desc: u32,
    desc_size: usize,
) -> DriverResult<DmaRegion> {
    let total = num_desc as usize * desc_size;
    let region = allocator.alloc(total)?;
    unsafe { std::ptr::write_bytes(region.virt(), 0xFF, total) };
    Ok(region)
}

/// Operations common to both ring variants.
///
/// `create` performs the whole setup: allocate descriptor memory, announce
/// its IOVA to the device (`bind_desc_iova`), cache the CPU-side pointer
/// (`bind_desc_virt`) and size the slot table. The pool must be linked
/// first.
pub trait DescRing {
    /// Transfers ownership of `pool` to the ring.
    fn link_pool(&mut self, pool: BufferPool);

    /// Allocates descriptor memory and programs the device registers for
    /// ring `ring_index`.
    fn create(
        &mut self,
        allocator: &mut DmaAllocator,
        bar: &MmioRegion,
        num_desc: u32,
        desc_size: usize,
        ring_index: u16,
    ) -> DriverResult;

    /// Programs the ring's base/length registers with the descriptor
    /// memory's IOVA.
    fn bind_desc_iova(&mut self, bar: &MmioRegion, ring_index: u16) -> DriverResult;

    /// Caches the CPU-visible descriptor array pointer.
    fn bind_desc_virt(&mut self) -> DriverResult;
}

fn check_ring_size(num_desc: u32) -> DriverResult {
    if !num_desc.is_power_of_two() || num_desc > MAX_RING_SIZE {
        return Err(DriverError::QueueNotAligned);
    }
    Ok(())
}

/// Receive descriptor ring.
///
/// Software fills slots with empty buffers and advances `tail`; the device
/// consumes them, DMAs one frame per descriptor and writes the status back
/// in place. Software reads completed slots at `head`.
pub struct RxRing {
    pool: Option<BufferPool>,
    desc_mem: Option<DmaRegion>,
    descriptors: *mut AdvancedRxDescriptor,
    num_desc: u16,
    head: u16,
    tail: u16,
    slots: Box<[Option<u32>]>,
}

// The descriptor pointer aims into the ring's own DMA region.
unsafe impl Send for RxRing {}

impl Default for RxRing {
    fn default() -> Self {
        Self::new()
    }
}

impl RxRing {
    /// Creates an empty, unbound ring.
    pub fn new() -> Self {
        RxRing {
            pool: None,
            desc_mem: None,
            descriptors: std::ptr::null_mut(),
            num_desc: 0,
            head: 0,
            tail: 0,
            slots: Box::new([]),
        }
    }

    /// The pool backing this ring, if linked.
    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// The buffer at `idx` in the ring's pool.
    pub fn buffer(&self, idx: u32) -> Option<&PacketBuffer> {
        self.pool.as_ref().and_then(|pool| pool.get(idx))
    }

    /// Number of descriptors currently owned by the device.
    pub fn in_flight(&self) -> u16 {
        if self.num_desc == 0 {
            return 0;
        }
        self.tail.wrapping_sub(self.head) & (self.num_desc - 1)
    }

    /// Links up to `batch` empty buffers into free descriptor slots and
    /// advances `tail`.
    ///
    /// Does NOT notify the device; the caller writes the returned tail to
    /// the RDT register once the batch is complete.
    pub fn refill(&mut self, batch: u16) -> u16 {
        if self.descriptors.is_null() {
            error!("descriptor ring not bound to DMA memory, call create first");
            return self.tail;
        }
        let Some(pool) = self.pool.as_mut() else {
            error!("memory pool not linked, call link_pool first");
            return self.tail;
        };
        let mut linked = 0;
        while linked < batch {
            let next = wrap_ring(self.tail, self.num_desc);
            if next == self.head {
                // ring full
                break;
            }
            let Some(buf) = pool.pop() else {
                error!("failed to allocate an rx buffer, pool exhausted");
                break;
            };
            let idx = buf.idx();
            let addr = buf.iova() + PacketBuffer::data_offset() as u64;
            let rxd = unsafe { &mut *self.descriptors.add(self.tail as usize) };
            rxd.set_packet_address(addr);
            rxd.reset_status();
            self.slots[self.tail as usize] = Some(idx);
            self.tail = next;
            linked += 1;
        }
        self.tail
    }

    /// Collects completed frames starting at `head`.
    ///
    /// Writes the buffer index of each completed frame into `out` and
    /// records the received length in the buffer header. Stops at the
    /// first descriptor the device has not finished, at `head == tail`, or
    /// when `out` is full. A completed descriptor without the end-of-packet
    /// bit means the frame did not fit a single buffer, which the data
    /// plane does not support.
    pub fn drain(&mut self, out: &mut [u32]) -> DriverResult<usize> {
        let Some(pool) = self.pool.as_mut() else {
            return Ok(0);
        };
        let mut rx_index = self.head;
        let mut count = 0;
        while count < out.len() {
            if rx_index == self.tail {
                // no more descriptors to read
                break;
            }
            let rxd = unsafe { &*self.descriptors.add(rx_index as usize) };
            if !rxd.descriptor_done() {
                break;
            }
            if !rxd.end_of_packet() {
                return Err(DriverError::MultiSegmentFrame);
            }
            let Some(idx) = self.slots[rx_index as usize].take() else {
                error!("rx descriptor {rx_index} has no linked buffer");
                break;
            };
            if let Some(buf) = pool.get_mut(idx) {
                buf.set_len(rxd.length() as u32);
            }
            out[count] = idx;
            count += 1;
            rx_index = wrap_ring(rx_index, self.num_desc);
        }
        self.head = rx_index;
        Ok(count)
    }

    /// Returns a batch of drained buffers to the pool.
    pub fn release(&mut self, bufs: &[u32]) {
        if let Some(pool) = self.pool.as_mut() {
            for &idx in bufs {
                pool.release(idx);
            }
        }
    }
}

impl DescRing for RxRing {
    fn link_pool(&mut self, pool: BufferPool) {
        self.pool = Some(pool);
    }

    fn create(
        &mut self,
        allocator: &mut DmaAllocator,
        bar: &MmioRegion,
        num_desc: u32,
        desc_size: usize,
        ring_index: u16,
    ) -> DriverResult {
        check_ring_size(num_desc)?;
        if self.pool.is_none() {
            error!("no memory pool linked yet");
            return Err(DriverError::NotReady);
        }
        self.num_desc = num_desc as u16;
        self.desc_mem = Some(alloc_desc_memory(allocator, num_desc, desc_size)?);
        self.bind_desc_iova(bar, ring_index)?;
        self.bind_desc_virt()?;
        self.slots = vec![None; num_desc as usize].into_boxed_slice();
        Ok(())
    }

    fn bind_desc_iova(&mut self, bar: &MmioRegion, ring_index: u16) -> DriverResult {
        let desc_mem = self.desc_mem.as_ref().ok_or(DriverError::NotReady)?;
        let i = ring_index as u32;
        // advanced one-buffer descriptors; legacy ones would work too but
        // aren't any simpler
        bar.write32(
            IXGBE_SRRCTL(i),
            (bar.read32(IXGBE_SRRCTL(i)) & !IXGBE_SRRCTL_DESCTYPE_MASK)
                | IXGBE_SRRCTL_DESCTYPE_ADV_ONEBUF,
        );
        // drop_en makes the device drop frames when no descriptors are
        // available instead of buffering them; one overflowing queue would
        // otherwise stall the whole packet buffer
        bar.set_flags32(IXGBE_SRRCTL(i), IXGBE_SRRCTL_DROP_EN);
        // where the device may write: its own view of the memory, the IOVA
        bar.write32(IXGBE_RDBAL(i), (desc_mem.iova() & 0xFFFF_FFFF) as u32);
        bar.write32(IXGBE_RDBAH(i), (desc_mem.iova() >> 32) as u32);
        bar.write32(
            IXGBE_RDLEN(i),
            self.num_desc as u32 * std::mem::size_of::<AdvancedRxDescriptor>() as u32,
        );
        // ring starts out empty
        bar.write32(IXGBE_RDH(i), 0);
        bar.write32(IXGBE_RDT(i), 0);
        Ok(())
    }

    fn bind_desc_virt(&mut self) -> DriverResult {
        let desc_mem = self.desc_mem.as_ref().ok_or_else(|| {
            error!("invalid DMA memory provided to the rx descriptor ring");
            DriverError::NotReady
        })?;
        self.descriptors = desc_mem.virt() as *mut AdvancedRxDescriptor;
        Ok(())
    }
}

/// Transmit descriptor ring with a staging queue.
///
/// `fill_frame` copies payloads into pool buffers and parks them in the
/// staging queue; `publish` later links staged buffers to descriptors in
/// one batch. The split decouples frame production from the descriptor
/// ring so producers never observe a transiently full ring.
pub struct TxRing {
    pool: Option<BufferPool>,
    desc_mem: Option<DmaRegion>,
    descriptors: *mut AdvancedTxDescriptor,
    num_desc: u16,
    head: u16,
    tail: u16,
    slots: Box<[Option<u32>]>,
    staged: Box<[u32]>,
    staged_head: usize,
    staged_tail: usize,
}

unsafe impl Send for TxRing {}

impl Default for TxRing {
    fn default() -> Self {
        Self::new()
    }
}

impl TxRing {
    /// Creates an empty, unbound ring.
    pub fn new() -> Self {
        TxRing {
            pool: None,
            desc_mem: None,
            descriptors: std::ptr::null_mut(),
            num_desc: 0,
            head: 0,
            tail: 0,
            slots: Box::new([]),
            staged: Box::new([]),
            staged_head: 0,
            staged_tail: 0,
        }
    }

    /// The pool backing this ring, if linked.
    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Number of descriptors currently owned by the device.
    pub fn in_flight(&self) -> u16 {
        if self.num_desc == 0 {
            return 0;
        }
        self.tail.wrapping_sub(self.head) & (self.num_desc - 1)
    }

    /// Number of frames staged but not yet published.
    pub fn staged_count(&self) -> usize {
        if self.staged.is_empty() {
            return 0;
        }
        (self.staged_tail + self.staged.len() - self.staged_head) % self.staged.len()
    }

    fn staging_push(&mut self, idx: u32) -> bool {
        if self.staged.is_empty() {
            return false;
        }
        let next = (self.staged_tail + 1) % self.staged.len();
        if next == self.staged_head {
            return false;
        }
        self.staged[self.staged_tail] = idx;
        self.staged_tail = next;
        true
    }

    fn staging_pop(&mut self) -> Option<u32> {
        if self.staged_head == self.staged_tail {
            return None;
        }
        let idx = self.staged[self.staged_head];
        self.staged_head = (self.staged_head + 1) % self.staged.len();
        Some(idx)
    }

    /// Copies `data` into a fresh buffer, fixes up the IPv4 header
    /// checksum, and stages the buffer for the next [`TxRing::publish`].
    ///
    /// Frames longer than a slot's payload capacity are truncated with a
    /// warning. Returns `false` when the pool is empty - the caller backs
    /// off and reclaims completed sends first.
    pub fn fill_frame(&mut self, data: &[u8]) -> bool {
        let Some(pool) = self.pool.as_mut() else {
            error!("memory pool not linked, call link_pool first");
            return false;
        };
        let capacity = pool.buf_size() as usize - PacketBuffer::data_offset();
        let Some(buf) = pool.pop() else {
            return false;
        };
        let len = if data.len() > capacity {
            warn!(
                "frame of {} bytes exceeds buffer capacity {capacity}, truncating",
                data.len()
            );
            capacity
        } else {
            data.len()
        };
        let idx = buf.idx();
        // the whole payload area lives past the header, no aliasing with
        // `buf`; the checksum window exists even for frames shorter than it
        let area = unsafe { std::slice::from_raw_parts_mut(buf.data_ptr(), capacity) };
        area[..len].copy_from_slice(&data[..len]);
        buf.set_len(len as u32);
        // fixed IPv4 header checksum over bytes 14..34, written at offset
        // 24; callers that carry a different protocol overwrite the field
        // after staging
        let cs = ipv4_checksum(&area[14..34]);
        area[24..26].copy_from_slice(&cs.to_ne_bytes());
        if !self.staging_push(idx) {
            error!("staging queue full, dropping frame");
            if let Some(pool) = self.pool.as_mut() {
                pool.release(idx);
            }
            return false;
        }
        true
    }

    /// Links up to `batch` staged buffers to descriptors and advances
    /// `tail`.
    ///
    /// When the ring fills up mid-batch, the buffer in hand and everything
    /// still staged go back to the pool; sending resumes once completed
    /// descriptors have been reclaimed. The device is notified by the
    /// caller writing the returned tail to the TDT register.
    pub fn publish(&mut self, batch: u16) -> u16 {
        if self.descriptors.is_null() {
            error!("descriptor ring not bound to DMA memory, call create first");
            return self.tail;
        }
        let mut linked = 0;
        while linked < batch {
            let Some(idx) = self.staging_pop() else {
                break;
            };
            let next = wrap_ring(self.tail, self.num_desc);
            if next == self.head {
                // ring full: return the batch to the pool instead of
                // leaving it stranded in staging
                let mut returned = vec![idx];
                while let Some(rest) = self.staging_pop() {
                    returned.push(rest);
                }
                if let Some(pool) = self.pool.as_mut() {
                    for idx in returned {
                        pool.release(idx);
                    }
                }
                return self.tail;
            }
            let Some((addr, len)) = self.pool.as_ref().and_then(|pool| {
                pool.get(idx)
                    .map(|buf| (buf.iova() + PacketBuffer::data_offset() as u64, buf.len()))
            }) else {
                error!("staged buffer {idx} not found in the pool");
                break;
            };
            self.slots[self.tail as usize] = Some(idx);
            let txd = unsafe { &mut *self.descriptors.add(self.tail as usize) };
            txd.send(addr, len as u16);
            self.tail = next;
            linked += 1;
        }
        self.tail
    }

    /// Returns `min_batch` completed buffers to the pool if the device is
    /// done with them.
    ///
    /// Only the *last* descriptor of the batch is probed for the done bit:
    /// the device completes descriptors in order, so one check covers the
    /// whole batch. Returns `false` when fewer than `min_batch` descriptors
    /// are in flight or the batch has not completed yet.
    pub fn reclaim(&mut self, min_batch: u16) -> bool {
        if self.descriptors.is_null() || self.pool.is_none() {
            error!("tx ring not initialized");
            return false;
        }
        if min_batch == 0 {
            return false;
        }
        let mask = self.num_desc - 1;
        let in_flight = self.tail.wrapping_sub(self.head) & mask;
        if in_flight < min_batch {
            return false;
        }
        let probe = self.head.wrapping_add(min_batch - 1) & mask;
        let done = unsafe { (*self.descriptors.add(probe as usize)).is_done() };
        if !done {
            return false;
        }
        let Some(pool) = self.pool.as_mut() else {
            return false;
        };
        for _ in 0..min_batch {
            if let Some(idx) = self.slots[self.head as usize].take() {
                pool.release(idx);
            }
            self.head = wrap_ring(self.head, self.num_desc);
        }
        true
    }
}

impl DescRing for TxRing {
    fn link_pool(&mut self, pool: BufferPool) {
        // the staging queue is sized to the pool so every buffer can be in
        // flight between fill_frame and publish at once (one slot stays
        // unused to distinguish full from empty)
        self.staged = vec![0; pool.capacity() as usize + 1].into_boxed_slice();
        self.staged_head = 0;
        self.staged_tail = 0;
        self.pool = Some(pool);
    }

    fn create(
        &mut self,
        allocator: &mut DmaAllocator,
        bar: &MmioRegion,
        num_desc: u32,
        desc_size: usize,
        ring_index: u16,
    ) -> DriverResult {
        check_ring_size(num_desc)?;
        if self.pool.is_none() {
            error!("no memory pool linked yet");
            return Err(DriverError::NotReady);
        }
        self.num_desc = num_desc as u16;
        self.desc_mem = Some(alloc_desc_memory(allocator, num_desc, desc_size)?);
        self.bind_desc_iova(bar, ring_index)?;
        self.bind_desc_virt()?;
        self.slots = vec![None; num_desc as usize].into_boxed_slice();
        Ok(())
    }

    fn bind_desc_iova(&mut self, bar: &MmioRegion, ring_index: u16) -> DriverResult {
        let desc_mem = self.desc_mem.as_ref().ok_or(DriverError::NotReady)?;
        let i = ring_index as u32;
        bar.write32(IXGBE_TDBAL(i), (desc_mem.iova() & 0xFFFF_FFFF) as u32);
        bar.write32(IXGBE_TDBAH(i), (desc_mem.iova() >> 32) as u32);
        bar.write32(
            IXGBE_TDLEN(i),
            self.num_desc as u32 * std::mem::size_of::<AdvancedTxDescriptor>() as u32,
        );
        // descriptor writeback thresholds; both throughput and correctness
        // depend on them, values are the DPDK defaults
        // (see sections 7.2.3.4.1 and 7.2.3.5 of the datasheet)
        let mut txdctl = bar.read32(IXGBE_TXDCTL(i));
        // pthresh 6:0, hthresh 14:8, wthresh 22:16
        txdctl &= !(0x7F | (0x7F << 8) | (0x7F << 16));
        txdctl |= 36 | (8 << 8) | (4 << 16);
        bar.write32(IXGBE_TXDCTL(i), txdctl);
        Ok(())
    }

    fn bind_desc_virt(&mut self) -> DriverResult {
        let desc_mem = self.desc_mem.as_ref().ok_or_else(|| {
            error!("invalid DMA memory provided to the tx descriptor ring");
            DriverError::NotReady
        })?;
        self.descriptors = desc_mem.virt() as *mut AdvancedTxDescriptor;
        Ok(())
    }
}

/// 16-bit one's complement sum over `data`, folded after every addition.
///
/// Word order follows the host because the folded sum commutes under byte
/// swap; the result is stored back in the same representation.
pub(crate) fn ipv4_checksum(data: &[u8]) -> u16 {
    debug_assert!(data.len() % 2 == 0, "odd-sized checksums NYI");
    let mut cs: u32 = 0;
    for chunk in data.chunks_exact(2) {
        cs += u16::from_ne_bytes([chunk[0], chunk[1]]) as u32;
        if cs > 0xFFFF {
            cs = (cs & 0xFFFF) + 1;
        }
    }
    !(cs as u16)
}
