//! Incremental packet counting over a capture file that is still being written.
//!
//! Records and blocks are decoded with `pcap_parser`. A record the parser
//! reports as incomplete is left for the next call; pcapng section headers
//! switch the byte order used for the blocks that follow them.

use pcap_parser::{parse_block_be, parse_block_le, parse_pcap_frame, parse_pcap_frame_be, parse_pcap_header, Block};

use super::types::{ByteOrder, CaptureFormat};
use crate::error_handling::types::ForensicError;

const PCAPNG_SECTION_HEADER: u32 = 0x0A0D_0D0A;
const PCAPNG_BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;
/// Block type of the obsolete packet block, which the parser reports as unknown.
const PCAPNG_OBSOLETE_PACKET: u32 = 2;
const PCAPNG_MIN_BLOCK: usize = 12;
const PCAP_MAGICS: [u32; 2] = [0xA1B2_C3D4, 0xA1B2_3C4D];
/// Larger records are treated as corruption rather than waited for.
pub const MAX_RECORD_BYTES: usize = 4 * 1024 * 1024;

fn malformed(what: &str, offset: u64, detail: impl std::fmt::Display) -> ForensicError {
    ForensicError::MalformedInput(format!("{} at offset {}: {}", what, offset, detail))
}

/// Byte order announced by a pcapng section header starting at `block`.
///
/// `Ok(None)` when `block` is not a section header or is too short to tell.
fn section_byte_order(block: &[u8]) -> Result<Option<ByteOrder>, ForensicError> {
    if block.len() < PCAPNG_MIN_BLOCK || ByteOrder::Little.u32(block) != PCAPNG_SECTION_HEADER {
        return Ok(None);
    }
    match ByteOrder::Little.u32(&block[8..12]) {
        PCAPNG_BYTE_ORDER_MAGIC => Ok(Some(ByteOrder::Little)),
        m if m == PCAPNG_BYTE_ORDER_MAGIC.swap_bytes() => Ok(Some(ByteOrder::Big)),
        other => Err(ForensicError::MalformedInput(format!(
            "pcapng section has byte-order magic {:#010x}",
            other
        ))),
    }
}

/// Format, byte order and the length of the file header that precedes the
/// first record (pcapng has none: its section header is an ordinary block).
///
/// `Ok(None)` means not enough bytes have been written yet.
fn detect(data: &[u8]) -> Result<Option<(CaptureFormat, ByteOrder, usize)>, ForensicError> {
    if data.len() < 4 {
        return Ok(None);
    }
    if ByteOrder::Little.u32(data) == PCAPNG_SECTION_HEADER {
        return Ok(section_byte_order(data)?.map(|order| (CaptureFormat::PcapNg, order, 0)));
    }
    let magic = ByteOrder::Little.u32(data);
    if !PCAP_MAGICS.iter().any(|m| *m == magic || m.swap_bytes() == magic) {
        return Err(ForensicError::MalformedInput(format!(
            "unrecognized capture magic {:#010x}",
            magic
        )));
    }
    match parse_pcap_header(data) {
        Ok((rest, header)) => {
            let order = if header.is_bigendian() {
                ByteOrder::Big
            } else {
                ByteOrder::Little
            };
            Ok(Some((CaptureFormat::Pcap, order, data.len() - rest.len())))
        }
        Err(e) if e.is_incomplete() => Ok(None),
        Err(e) => Err(malformed("pcap file header", 0, format!("{:?}", e))),
    }
}

/// Length field of an incomplete record, if enough of it is visible.
fn declared_length(record: &[u8], at: usize, order: ByteOrder) -> Option<usize> {
    record.get(at..at + 4).map(|field| order.u32(field) as usize)
}

/// Parse state carried between polls of one capture file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementalParser {
    format: Option<CaptureFormat>,
    byte_order: Option<ByteOrder>,
    offset: u64,
    packet_count: u64,
}

impl IncrementalParser {
    pub fn format(&self) -> Option<CaptureFormat> {
        self.format
    }

    pub fn byte_order(&self) -> Option<ByteOrder> {
        self.byte_order
    }

    /// File offset of the first byte not yet consumed.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    /// Forgets everything, for a file that was truncated or replaced.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Consumes complete records from `data`, which must start at [`offset`](Self::offset).
    ///
    /// Returns the number of bytes consumed. Progress made before an error is kept.
    pub fn advance(&mut self, data: &[u8]) -> Result<usize, ForensicError> {
        let start = self.offset;
        let mut data = data;

        if self.format.is_none() {
            let (format, order, header_len) = match detect(data)? {
                Some(detected) => detected,
                None => return Ok(0),
            };
            data = &data[header_len..];
            self.offset += header_len as u64;
            self.format = Some(format);
            self.byte_order = Some(order);
        }

        let result = match self.format {
            Some(CaptureFormat::Pcap) => self.walk_records(data),
            Some(CaptureFormat::PcapNg) => self.walk_blocks(data),
            None => Ok(()),
        };
        result.map(|()| (self.offset - start) as usize)
    }

    fn walk_records(&mut self, data: &[u8]) -> Result<(), ForensicError> {
        let order = self.byte_order.unwrap_or(ByteOrder::Little);
        let mut rest = data;
        while !rest.is_empty() {
            let parsed = match order {
                ByteOrder::Little => parse_pcap_frame(rest),
                ByteOrder::Big => parse_pcap_frame_be(rest),
            };
            match parsed {
                Ok((remaining, _frame)) => {
                    self.offset += (rest.len() - remaining.len()) as u64;
                    self.packet_count += 1;
                    rest = remaining;
                }
                Err(e) if e.is_incomplete() => {
                    if let Some(captured) = declared_length(rest, 8, order) {
                        if captured > MAX_RECORD_BYTES {
                            return Err(malformed("pcap record", self.offset, format!("claims {} bytes", captured)));
                        }
                    }
                    break;
                }
                Err(e) => return Err(malformed("pcap record", self.offset, format!("{:?}", e))),
            }
        }
        Ok(())
    }

    fn walk_blocks(&mut self, data: &[u8]) -> Result<(), ForensicError> {
        let mut rest = data;
        while !rest.is_empty() {
            if let Some(order) = section_byte_order(rest)? {
                self.byte_order = Some(order);
            }
            let order = self.byte_order.unwrap_or(ByteOrder::Little);
            let parsed = match order {
                ByteOrder::Little => parse_block_le(rest),
                ByteOrder::Big => parse_block_be(rest),
            };
            match parsed {
                Ok((remaining, block)) => {
                    let is_packet = match block {
                        Block::EnhancedPacket(_) | Block::SimplePacket(_) => true,
                        Block::Unknown(ref unknown) => unknown.block_type == PCAPNG_OBSOLETE_PACKET,
                        _ => false,
                    };
                    if is_packet {
                        self.packet_count += 1;
                    }
                    self.offset += (rest.len() - remaining.len()) as u64;
                    rest = remaining;
                }
                Err(e) if e.is_incomplete() => {
                    if let Some(length) = declared_length(rest, 4, order) {
                        if length < PCAPNG_MIN_BLOCK || length > MAX_RECORD_BYTES {
                            return Err(malformed("pcapng block", self.offset, format!("has length {}", length)));
                        }
                    }
                    break;
                }
                Err(e) => return Err(malformed("pcapng block", self.offset, format!("{:?}", e))),
            }
        }
        Ok(())
    }
}
