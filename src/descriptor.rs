//! Advanced RX/TX descriptor layouts for the 82599.
//!
//! Descriptors are 16-byte records shared with the device through DMA
//! memory. The device reads the "read" format (buffer addresses) and
//! overwrites it in place with the "writeback" format (status, length)
//! when the operation completes; both formats are expressed through the
//! same field set here, with accessors for the writeback view.
//!
//! All fields are [`Volatile`]: the device writes them behind the
//! compiler's back.

use bit_field::BitField;
use volatile::Volatile;

/// Descriptor done: the device has finished this descriptor.
pub const RX_STATUS_DD: u32 = 1 << 0;
/// End of packet: this descriptor holds the last (only) segment.
pub const RX_STATUS_EOP: u32 = 1 << 1;

/// TX command: end of packet.
pub const TX_CMD_EOP: u8 = 1 << 0;
/// TX command: insert FCS (hardware CRC offload).
pub const TX_CMD_IFCS: u8 = 1 << 1;
/// TX command: report status (request a done writeback).
pub const TX_CMD_RS: u8 = 1 << 3;
/// TX command: advanced descriptor extension.
pub const TX_CMD_DEXT: u8 = 1 << 5;

/// Advanced data descriptor type (DTYP field).
pub const TX_DTYP_ADV: u8 = 0x3 << 4;

/// Shift of the payload length within the TX descriptor's upper dword.
pub const TX_PAYLEN_SHIFT: u32 = 46 - 32;

/// TX writeback: descriptor done.
pub const TX_STATUS_DD: u32 = 1 << 0;

/// Advanced receive descriptor (one-buffer layout).
///
/// In the read format `packet_buffer_address` points at the payload area of
/// a packet buffer and `header_buffer_address` must be zero. In the
/// writeback format the second quadword carries the status bits in its low
/// dword and the frame length in bits 32..48.
#[repr(C)]
pub struct AdvancedRxDescriptor {
    /// Device address the frame is DMA'd to (read format) / RSS hash and
    /// packet type info (writeback format).
    pub packet_buffer_address: Volatile<u64>,
    /// Header split address (unused, zero) / status, error and length
    /// (writeback format).
    pub header_buffer_address: Volatile<u64>,
}

impl AdvancedRxDescriptor {
    /// Clears both quadwords.
    pub fn init(&mut self) {
        self.packet_buffer_address.write(0);
        self.header_buffer_address.write(0);
    }

    /// Points the descriptor at a packet buffer's payload area.
    pub fn set_packet_address(&mut self, addr: u64) {
        self.packet_buffer_address.write(addr);
    }

    /// Resets the writeback word so the descriptor can be handed back to
    /// the device. The packet address is left untouched.
    pub fn reset_status(&mut self) {
        self.header_buffer_address.write(0);
    }

    /// Whether the device has completed this descriptor.
    pub fn descriptor_done(&self) -> bool {
        self.header_buffer_address.read() as u32 & RX_STATUS_DD != 0
    }

    /// Whether this descriptor holds the end of a frame.
    pub fn end_of_packet(&self) -> bool {
        self.header_buffer_address.read() as u32 & RX_STATUS_EOP != 0
    }

    /// Length of the received frame in bytes (writeback format).
    pub fn length(&self) -> u64 {
        self.header_buffer_address.read().get_bits(32..48)
    }

    /// RSS type of the received frame (writeback format).
    pub fn get_rss_type(&self) -> u64 {
        self.packet_buffer_address.read().get_bits(0..4)
    }

    /// Packet type as reported by the device (writeback format).
    pub fn get_packet_type(&self) -> u64 {
        self.packet_buffer_address.read().get_bits(4..16)
    }
}

/// Advanced transmit descriptor.
///
/// The command dword is split into its byte-sized subfields so the command
/// flags can be written without read-modify-write cycles on DMA memory.
#[repr(C)]
pub struct AdvancedTxDescriptor {
    /// Device address the frame is DMA'd from.
    pub packet_buffer_address: Volatile<u64>,
    /// Length of the buffer in bytes.
    pub data_len: Volatile<u16>,
    /// Descriptor type and reserved MAC bits.
    pub dtyp_mac_rsv: Volatile<u8>,
    /// Command byte (`TX_CMD_*`).
    pub dcmd: Volatile<u8>,
    /// Payload length, offload options and - after writeback - the status
    /// dword carrying [`TX_STATUS_DD`].
    pub paylen_popts_cc_idx_sta: Volatile<u32>,
}

impl AdvancedTxDescriptor {
    /// Clears every field.
    pub fn init(&mut self) {
        self.packet_buffer_address.write(0);
        self.data_len.write(0);
        self.dtyp_mac_rsv.write(0);
        self.dcmd.write(0);
        self.paylen_popts_cc_idx_sta.write(0);
    }

    /// Arms the descriptor to send one complete frame of `len` bytes at
    /// device address `buffer_addr`.
    ///
    /// Always the same flags: a single buffer (EOP), advanced data
    /// descriptor, CRC offload, and a status report so the send can be
    /// reclaimed later.
    pub fn send(&mut self, buffer_addr: u64, len: u16) {
        self.packet_buffer_address.write(buffer_addr);
        self.data_len.write(len);
        self.dtyp_mac_rsv.write(TX_DTYP_ADV);
        self.paylen_popts_cc_idx_sta
            .write((len as u32) << TX_PAYLEN_SHIFT);
        self.dcmd
            .write(TX_CMD_DEXT | TX_CMD_RS | TX_CMD_IFCS | TX_CMD_EOP);
    }

    /// Whether the device has completed (written back) this descriptor.
    pub fn is_done(&self) -> bool {
        self.paylen_popts_cc_idx_sta.read() & TX_STATUS_DD != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptors_are_16_bytes() {
        assert_eq!(std::mem::size_of::<AdvancedRxDescriptor>(), 16);
        assert_eq!(std::mem::size_of::<AdvancedTxDescriptor>(), 16);
    }
}
