//! Classic pcap trace files.
//!
//! The capture engine writes the original little-endian pcap format:
//! a 24-byte global header followed by 16-byte per-record headers and raw
//! frame bytes, no padding. [`PcapReader`] parses the same format back and
//! exists mainly so round trips can be verified.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Little-endian pcap magic.
pub const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
/// Format version written by [`PcapWriter`]: 2.4.
pub const PCAP_VERSION_MAJOR: u16 = 2;
/// Minor half of the format version.
pub const PCAP_VERSION_MINOR: u16 = 4;
/// Snapshot length: frames are never truncated below this.
pub const PCAP_SNAPLEN: u32 = 65535;
/// Link type 1: Ethernet.
pub const PCAP_NETWORK_ETHERNET: u32 = 1;

/// Streaming pcap writer.
///
/// The global header goes out on construction; every
/// [`PcapWriter::write_packet`] appends one record. Wrap the sink in a
/// `BufWriter` - captures write two small headers per frame.
pub struct PcapWriter<W: Write> {
    inner: W,
}

impl<W: Write> PcapWriter<W> {
    /// Writes the global header and returns the writer.
    pub fn new(mut inner: W) -> io::Result<Self> {
        inner.write_u32::<LittleEndian>(PCAP_MAGIC)?;
        inner.write_u16::<LittleEndian>(PCAP_VERSION_MAJOR)?;
        inner.write_u16::<LittleEndian>(PCAP_VERSION_MINOR)?;
        // thiszone: GMT to local correction
        inner.write_i32::<LittleEndian>(0)?;
        // sigfigs: timestamp accuracy
        inner.write_u32::<LittleEndian>(0)?;
        inner.write_u32::<LittleEndian>(PCAP_SNAPLEN)?;
        inner.write_u32::<LittleEndian>(PCAP_NETWORK_ETHERNET)?;
        Ok(PcapWriter { inner })
    }

    /// Appends one record with the given wall-clock timestamp.
    pub fn write_packet(&mut self, ts_sec: u32, ts_usec: u32, data: &[u8]) -> io::Result<()> {
        self.inner.write_u32::<LittleEndian>(ts_sec)?;
        self.inner.write_u32::<LittleEndian>(ts_usec)?;
        self.inner.write_u32::<LittleEndian>(data.len() as u32)?;
        self.inner.write_u32::<LittleEndian>(data.len() as u32)?;
        self.inner.write_all(data)
    }

    /// Flushes the underlying sink.
    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    /// Unwraps the underlying sink.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// One parsed pcap record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcapRecord {
    /// Timestamp seconds.
    pub ts_sec: u32,
    /// Timestamp microseconds.
    pub ts_usec: u32,
    /// Original on-wire length.
    pub orig_len: u32,
    /// Captured bytes (`incl_len` of them).
    pub data: Vec<u8>,
}

/// Streaming pcap reader for round-trip verification.
pub struct PcapReader<R: Read> {
    inner: R,
    version: (u16, u16),
    snaplen: u32,
    network: u32,
}

impl<R: Read> PcapReader<R> {
    /// Parses and validates the global header.
    pub fn new(mut inner: R) -> io::Result<Self> {
        let magic = inner.read_u32::<LittleEndian>()?;
        if magic != PCAP_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad pcap magic {magic:#010x}"),
            ));
        }
        let major = inner.read_u16::<LittleEndian>()?;
        let minor = inner.read_u16::<LittleEndian>()?;
        let _thiszone = inner.read_i32::<LittleEndian>()?;
        let _sigfigs = inner.read_u32::<LittleEndian>()?;
        let snaplen = inner.read_u32::<LittleEndian>()?;
        let network = inner.read_u32::<LittleEndian>()?;
        Ok(PcapReader {
            inner,
            version: (major, minor),
            snaplen,
            network,
        })
    }

    /// `(major, minor)` format version from the global header.
    pub fn version(&self) -> (u16, u16) {
        self.version
    }

    /// Snapshot length from the global header.
    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    /// Link type from the global header.
    pub fn network(&self) -> u32 {
        self.network
    }

    /// Reads the next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> io::Result<Option<PcapRecord>> {
        let ts_sec = match self.inner.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let ts_usec = self.inner.read_u32::<LittleEndian>()?;
        let incl_len = self.inner.read_u32::<LittleEndian>()?;
        let orig_len = self.inner.read_u32::<LittleEndian>()?;
        let mut data = vec![0u8; incl_len as usize];
        self.inner.read_exact(&mut data)?;
        Ok(Some(PcapRecord {
            ts_sec,
            ts_usec,
            orig_len,
            data,
        }))
    }
}
