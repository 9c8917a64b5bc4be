//! System-level integration tests
//!
//! These tests verify integration between components and system-level
//! functionality through the public API: error propagation, statistics
//! accounting and the capture file format produced by the RX engine.

use std::io::Cursor;

use vfio_drivers::pcap::{PcapReader, PcapWriter};
use vfio_drivers::{diff_mbit, diff_mpps, DeviceStats, DriverError, VfioPci};

#[test]
fn test_vfio_open_fails_cleanly_without_a_device() {
    // a PCI address that cannot exist: either sysfs lookup or the
    // container open must fail with a configuration/OS error, never panic
    let result = VfioPci::open("ffff:ff:1f.7");
    match result {
        Err(DriverError::Config(msg)) => assert!(msg.contains("ffff:ff:1f.7")),
        Err(DriverError::Os { .. }) => {}
        other => panic!("expected a bring-up error, got {other:?}", other = other.err()),
    }
}

#[test]
fn test_error_messages_name_the_rule() {
    let err = DriverError::QueueNotAligned;
    assert_eq!(err.to_string(), "queue size is not a power of two");

    let err = DriverError::MultiSegmentFrame;
    assert!(err.to_string().contains("multi-segment"));

    let err = DriverError::InvalidQueue(7);
    assert!(err.to_string().contains('7'));
}

#[test]
fn test_stats_accumulate_monotonically() {
    let mut stats = DeviceStats::default();
    // read-to-clear hardware deltas are added, never assigned
    for delta in [10u64, 20, 30] {
        stats.rx_pkts += delta;
        stats.rx_bytes += delta * 60;
    }
    assert_eq!(stats.rx_pkts, 60);
    assert_eq!(stats.rx_bytes, 3600);
}

#[test]
fn test_rate_report_reaches_line_rate() {
    // the loop-send acceptance threshold: 60-byte frames (64 on the wire
    // with the FCS, which the byte counters include) on a saturated 10G
    // link must report >= 9500 Mbit/s once framing overhead counts
    let pkts: u64 = 14_880_000;
    let bytes = pkts * 64;
    let mbit = diff_mbit(bytes, 0, pkts, 0, 1_000_000_000);
    assert!(mbit >= 9_500, "only {mbit} Mbit/s");
    assert!(diff_mpps(pkts, 0, 1_000_000_000) > 14.0);
}

#[test]
fn test_capture_stream_shape() {
    // the capture engine writes through PcapWriter; a pcap produced from
    // a burst of frames must parse back in order with intact payloads
    let mut writer = PcapWriter::new(Vec::new()).unwrap();
    for seq in 0u32..100 {
        let mut frame = [0u8; 60];
        frame[45..49].copy_from_slice(&seq.to_le_bytes());
        writer.write_packet(1_700_000_000, seq, &frame).unwrap();
    }

    let mut reader = PcapReader::new(Cursor::new(writer.into_inner())).unwrap();
    let mut count = 0u32;
    while let Some(record) = reader.next_record().unwrap() {
        assert_eq!(record.data.len(), 60);
        assert_eq!(record.ts_usec, count);
        let seq = u32::from_le_bytes(record.data[45..49].try_into().unwrap());
        assert_eq!(seq, count);
        count += 1;
    }
    assert_eq!(count, 100);
}
