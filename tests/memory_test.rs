//! Functional tests - DMA memory layout
//!
//! These tests verify the memory subsystem's public surface, including:
//! - Huge page and headroom constants
//! - Packet buffer header layout guarantees
//!
//! Behavioural pool tests live next to the implementation, where a
//! heap-backed allocator can stand in for huge pages.

use vfio_drivers::memory::{PacketBuffer, HUGE_PAGE_BITS, HUGE_PAGE_SIZE};
use vfio_drivers::PACKET_HEADROOM;

#[test]
fn test_constants() {
    assert_eq!(PACKET_HEADROOM, 40);
    assert_eq!(HUGE_PAGE_BITS, 21);
    assert_eq!(HUGE_PAGE_SIZE, 1 << 21);
    assert_eq!(HUGE_PAGE_SIZE, 0x200000);
}

#[test]
fn test_header_fits_one_cache_line() {
    // the payload area starts right after the header; both the offset and
    // the alignment pin the header to exactly one cache line
    assert_eq!(PacketBuffer::data_offset(), 64);
    assert_eq!(std::mem::size_of::<PacketBuffer>(), 64);
    assert_eq!(std::mem::align_of::<PacketBuffer>(), 64);
}

#[test]
fn test_common_slot_sizes_divide_the_huge_page() {
    // pool slot sizes must divide the huge page size evenly
    let valid_sizes = [
        128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536,
    ];
    for &size in &valid_sizes {
        assert_eq!(HUGE_PAGE_SIZE % size, 0, "size {size} should divide the page");
    }

    let invalid_sizes = [100, 1500, 1536, 3000, 5000];
    for &size in &invalid_sizes {
        assert_ne!(
            HUGE_PAGE_SIZE % size,
            0,
            "size {size} should not divide the page evenly"
        );
    }
}

#[test]
fn test_slot_capacity_after_header() {
    // a standard 2048-byte slot leaves room for a full 1518-byte frame
    let capacity = 2048 - PacketBuffer::data_offset();
    assert!(capacity >= 1518);
}
