//! Functional tests - descriptor wire formats
//!
//! Descriptors are 16-byte records shared with the device: software arms
//! the read format, the device overwrites it in place with the writeback
//! format. These tests pin down the contracts the ring machinery depends
//! on: arming never leaves a stale done bit behind, writeback fields parse
//! from the documented bit positions, and the command dword assembled from
//! the split fields is exactly what the device decodes.

use vfio_drivers::descriptor::*;
use volatile::Volatile;

fn rx_desc() -> AdvancedRxDescriptor {
    AdvancedRxDescriptor {
        packet_buffer_address: Volatile::new(0),
        header_buffer_address: Volatile::new(0),
    }
}

fn tx_desc() -> AdvancedTxDescriptor {
    AdvancedTxDescriptor {
        packet_buffer_address: Volatile::new(0),
        data_len: Volatile::new(0),
        dtyp_mac_rsv: Volatile::new(0),
        dcmd: Volatile::new(0),
        paylen_popts_cc_idx_sta: Volatile::new(0),
    }
}

/// Builds the second quadword of an RX writeback: status bits in the low
/// dword, frame length in bits 32..48.
fn rx_writeback(len: u16, status: u32) -> u64 {
    (len as u64) << 32 | status as u64
}

#[test]
fn test_descriptors_match_the_16_byte_wire_size() {
    // the device steps through descriptor memory in 16-byte increments;
    // any padding here would shear the whole ring
    assert_eq!(std::mem::size_of::<AdvancedRxDescriptor>(), 16);
    assert_eq!(std::mem::size_of::<AdvancedTxDescriptor>(), 16);
}

#[test]
fn test_rx_arming_preserves_address_and_clears_status() {
    // refill arms a slot: buffer address in, writeback word zeroed so a
    // stale done bit from the previous tenant cannot fake a completion
    let mut desc = rx_desc();
    desc.header_buffer_address.write(rx_writeback(1518, RX_STATUS_DD));

    desc.set_packet_address(0x0002_0000_0040);
    desc.reset_status();

    assert_eq!(desc.packet_buffer_address.read(), 0x0002_0000_0040);
    assert_eq!(desc.header_buffer_address.read(), 0);
    assert!(!desc.descriptor_done());
}

#[test]
fn test_rx_init_clears_both_quadwords() {
    let mut desc = rx_desc();
    desc.set_packet_address(u64::MAX);
    desc.header_buffer_address.write(u64::MAX);

    desc.init();

    assert_eq!(desc.packet_buffer_address.read(), 0);
    assert_eq!(desc.header_buffer_address.read(), 0);
}

#[test]
fn test_rx_done_and_eop_bits_are_independent() {
    // drain keys off DD first and then EOP; a done multi-segment head
    // (DD without EOP) must be distinguishable from a complete frame
    let mut desc = rx_desc();

    desc.header_buffer_address.write(rx_writeback(2048, RX_STATUS_DD));
    assert!(desc.descriptor_done());
    assert!(!desc.end_of_packet());

    desc.header_buffer_address
        .write(rx_writeback(2048, RX_STATUS_DD | RX_STATUS_EOP));
    assert!(desc.descriptor_done());
    assert!(desc.end_of_packet());
}

#[test]
fn test_rx_writeback_length_extraction() {
    let mut desc = rx_desc();

    desc.header_buffer_address
        .write(rx_writeback(42, RX_STATUS_DD | RX_STATUS_EOP));
    assert_eq!(desc.length(), 42);

    // a saturated status dword must not bleed into the length field
    desc.header_buffer_address.write(rx_writeback(0, u32::MAX));
    assert_eq!(desc.length(), 0);

    desc.header_buffer_address.write(rx_writeback(u16::MAX, 0));
    assert_eq!(desc.length(), u16::MAX as u64);
}

#[test]
fn test_rx_writeback_hash_fields() {
    // the lower quadword carries the RSS type (bits 0..4) and the packet
    // type (bits 4..16) side by side
    let mut desc = rx_desc();
    desc.packet_buffer_address.write(0x5 | (0x7AB << 4));

    assert_eq!(desc.get_rss_type(), 0x5);
    assert_eq!(desc.get_packet_type(), 0x7AB);
}

#[test]
fn test_tx_send_assembles_the_command_dword() {
    // view the armed descriptor the way the device does: two little-endian
    // quadwords, the second one being cmd_type_len | (olinfo << 32)
    let mut raw = [0u64; 2];
    {
        let desc = unsafe { &mut *(raw.as_mut_ptr() as *mut AdvancedTxDescriptor) };
        desc.send(0x0002_0000_0040, 1518);
    }

    assert_eq!(raw[0], 0x0002_0000_0040);
    let cmd_type_len = raw[1] as u32;
    assert_eq!(cmd_type_len & 0xFFFF, 1518);
    assert_eq!((cmd_type_len >> 16) & 0xFF, TX_DTYP_ADV as u32);
    assert_eq!(
        cmd_type_len >> 24,
        (TX_CMD_DEXT | TX_CMD_RS | TX_CMD_IFCS | TX_CMD_EOP) as u32
    );
    // one buffer, advanced data type, CRC offload, status report
    assert_eq!(cmd_type_len, 0x2B30_0000 | 1518);
    assert_eq!((raw[1] >> 32) as u32, 1518 << TX_PAYLEN_SHIFT);
}

#[test]
fn test_tx_send_leaves_the_done_bit_clear() {
    // reclaim probes the status dword of descriptors it armed earlier; a
    // fresh send must never read as already completed
    let mut desc = tx_desc();
    desc.paylen_popts_cc_idx_sta.write(TX_STATUS_DD);

    desc.send(0x7F00_0040, 60);

    assert!(!desc.is_done());
    assert_eq!(desc.data_len.read(), 60);
}

#[test]
fn test_tx_done_bit_after_writeback() {
    let mut desc = tx_desc();
    desc.send(0x7F00_0040, 60);

    // the device reports completion by setting DD in the status dword
    desc.paylen_popts_cc_idx_sta.write(TX_STATUS_DD);
    assert!(desc.is_done());

    desc.init();
    assert!(!desc.is_done());
    assert_eq!(desc.dcmd.read(), 0);
}

#[test]
fn test_status_constants_do_not_overlap() {
    assert_eq!(RX_STATUS_DD, 1);
    assert_eq!(RX_STATUS_EOP, 2);
    assert_ne!(TX_STATUS_DD, 0);
    assert_eq!(TX_PAYLEN_SHIFT, 14);

    // the command flags occupy distinct bits of the dcmd byte
    let flags = [TX_CMD_EOP, TX_CMD_IFCS, TX_CMD_RS, TX_CMD_DEXT];
    for (i, a) in flags.iter().enumerate() {
        for b in &flags[i + 1..] {
            assert_eq!(a & b, 0, "command flags {a:#x} and {b:#x} overlap");
        }
    }
}
