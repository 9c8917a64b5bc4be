//! Functional tests - pcap trace files
//!
//! These tests verify the trace writer against its own reader, including:
//! - Global header constants
//! - Record round trips
//! - Malformed input rejection

use std::io::Cursor;

use vfio_drivers::pcap::{
    PcapReader, PcapWriter, PCAP_MAGIC, PCAP_NETWORK_ETHERNET, PCAP_SNAPLEN, PCAP_VERSION_MAJOR,
    PCAP_VERSION_MINOR,
};

#[test]
fn test_global_header_constants() {
    assert_eq!(PCAP_MAGIC, 0xA1B2_C3D4);
    assert_eq!(PCAP_VERSION_MAJOR, 2);
    assert_eq!(PCAP_VERSION_MINOR, 4);
    assert_eq!(PCAP_SNAPLEN, 65535);
    assert_eq!(PCAP_NETWORK_ETHERNET, 1);
}

#[test]
fn test_global_header_layout() {
    let writer = PcapWriter::new(Vec::new()).unwrap();
    let bytes = writer.into_inner();

    // 24 bytes, little endian, no padding
    assert_eq!(bytes.len(), 24);
    assert_eq!(&bytes[0..4], &PCAP_MAGIC.to_le_bytes());
    assert_eq!(&bytes[4..6], &PCAP_VERSION_MAJOR.to_le_bytes());
    assert_eq!(&bytes[6..8], &PCAP_VERSION_MINOR.to_le_bytes());
    assert_eq!(&bytes[16..20], &PCAP_SNAPLEN.to_le_bytes());
    assert_eq!(&bytes[20..24], &PCAP_NETWORK_ETHERNET.to_le_bytes());
}

#[test]
fn test_record_roundtrip() {
    let mut writer = PcapWriter::new(Vec::new()).unwrap();
    let frames: &[(u32, u32, Vec<u8>)] = &[
        (1_700_000_000, 0, vec![0xAA; 60]),
        (1_700_000_000, 999_999, vec![0x55; 1514]),
        (1_700_000_001, 1, b"ixy".to_vec()),
    ];
    for (sec, usec, data) in frames {
        writer.write_packet(*sec, *usec, data).unwrap();
    }

    let mut reader = PcapReader::new(Cursor::new(writer.into_inner())).unwrap();
    assert_eq!(reader.version(), (2, 4));
    assert_eq!(reader.snaplen(), PCAP_SNAPLEN);
    assert_eq!(reader.network(), PCAP_NETWORK_ETHERNET);

    for (sec, usec, data) in frames {
        let record = reader.next_record().unwrap().expect("record present");
        assert_eq!(record.ts_sec, *sec);
        assert_eq!(record.ts_usec, *usec);
        assert_eq!(record.orig_len, data.len() as u32);
        assert_eq!(&record.data, data);
    }
    assert!(reader.next_record().unwrap().is_none());
}

#[test]
fn test_empty_capture_parses() {
    let writer = PcapWriter::new(Vec::new()).unwrap();
    let mut reader = PcapReader::new(Cursor::new(writer.into_inner())).unwrap();
    assert!(reader.next_record().unwrap().is_none());
}

#[test]
fn test_bad_magic_is_rejected() {
    let bytes = vec![0u8; 24];
    assert!(PcapReader::new(Cursor::new(bytes)).is_err());
}

#[test]
fn test_truncated_record_is_an_error() {
    let mut writer = PcapWriter::new(Vec::new()).unwrap();
    writer.write_packet(0, 0, &[0u8; 100]).unwrap();
    let mut bytes = writer.into_inner();
    bytes.truncate(bytes.len() - 10);

    let mut reader = PcapReader::new(Cursor::new(bytes)).unwrap();
    assert!(reader.next_record().is_err());
}
