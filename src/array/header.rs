//! On-disk node header encoding.
//!
//! Every node in the file starts with the same 8-byte header:
//!
//! | byte | content |
//! |------|---------|
//! | 0    | flags: bits 0-1 width-type, bit 2 has-refs, bit 3 context flag, bits 4-6 width code |
//! | 1-3  | element count, 24-bit little-endian |
//! | 4-6  | allocated byte size including header, 24-bit little-endian |
//! | 7    | reserved, zero |

use crate::error::{Result, TabulaError};
use crate::types::{
    width_from_code, width_to_code, WidthType, MAX_NODE_SIZE, NODE_HEADER_SIZE,
};

const FLAG_WTYPE_MASK: u8 = 0x03;
const FLAG_HAS_REFS: u8 = 0x04;
const FLAG_CONTEXT: u8 = 0x08;
const FLAG_WIDTH_SHIFT: u8 = 4;
const FLAG_WIDTH_MASK: u8 = 0x70;

/// Decoded view of a node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub wtype: WidthType,
    pub has_refs: bool,
    /// Type-specific marker; set on inner B+-tree nodes.
    pub context_flag: bool,
    /// Bits per element (for `WidthType::Bits`) or bytes per element (for
    /// `WidthType::Multiply`).
    pub width: usize,
    /// Element count.
    pub size: usize,
    /// Allocated byte size including the header.
    pub capacity: usize,
}

impl NodeHeader {
    pub fn new(wtype: WidthType, has_refs: bool, context_flag: bool, width: usize) -> Self {
        Self {
            wtype,
            has_refs,
            context_flag,
            width,
            size: 0,
            capacity: 0,
        }
    }

    /// Decode a header from the first 8 bytes of a node, validating every
    /// field so traversal fails loudly on corrupt memory.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NODE_HEADER_SIZE {
            return Err(TabulaError::corrupt("node header truncated"));
        }
        let flags = bytes[0];
        let wtype = WidthType::from_code(flags & FLAG_WTYPE_MASK)?;
        let width_code = (flags & FLAG_WIDTH_MASK) >> FLAG_WIDTH_SHIFT;
        let size = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], 0]) as usize;
        let capacity = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], 0]) as usize;
        if bytes[7] != 0 || flags & 0x80 != 0 {
            return Err(TabulaError::corrupt("reserved header bits set"));
        }
        Ok(Self {
            wtype,
            has_refs: flags & FLAG_HAS_REFS != 0,
            context_flag: flags & FLAG_CONTEXT != 0,
            // One code scheme for every width type: bits per element for
            // `Bits`, bytes per slot for `Multiply`, unused for `Ignore`.
            width: width_from_code(width_code),
            size,
            capacity,
        })
    }

    pub fn encode(&self, bytes: &mut [u8]) {
        debug_assert!(bytes.len() >= NODE_HEADER_SIZE);
        debug_assert!(self.size <= MAX_NODE_SIZE && self.capacity <= MAX_NODE_SIZE);
        let width_code = match self.wtype {
            WidthType::Ignore => 0,
            _ => width_to_code(self.width),
        };
        let mut flags = self.wtype as u8;
        if self.has_refs {
            flags |= FLAG_HAS_REFS;
        }
        if self.context_flag {
            flags |= FLAG_CONTEXT;
        }
        flags |= (width_code << FLAG_WIDTH_SHIFT) & FLAG_WIDTH_MASK;
        bytes[0] = flags;
        let size = (self.size as u32).to_le_bytes();
        bytes[1] = size[0];
        bytes[2] = size[1];
        bytes[3] = size[2];
        let cap = (self.capacity as u32).to_le_bytes();
        bytes[4] = cap[0];
        bytes[5] = cap[1];
        bytes[6] = cap[2];
        bytes[7] = 0;
    }

    /// Payload bytes currently in use, excluding the header.
    pub fn payload_bytes(&self) -> usize {
        match self.wtype {
            WidthType::Bits => (self.size * self.width + 7) / 8,
            WidthType::Multiply => self.size * self.width,
            WidthType::Ignore => self.size,
        }
    }

    /// Total byte footprint of the node, 8-byte aligned, header included.
    pub fn byte_size(&self) -> usize {
        let payload = self.payload_bytes();
        NODE_HEADER_SIZE + ((payload + 7) & !7)
    }
}

/// Byte footprint needed for `size` elements at `width`, aligned, header
/// included. Used when sizing allocations ahead of a widen or insert.
pub fn byte_size_for(wtype: WidthType, size: usize, width: usize) -> usize {
    let payload = match wtype {
        WidthType::Bits => (size * width + 7) / 8,
        WidthType::Multiply => size * width,
        WidthType::Ignore => size,
    };
    NODE_HEADER_SIZE + ((payload + 7) & !7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut h = NodeHeader::new(WidthType::Bits, true, true, 16);
        h.size = 123_456;
        h.capacity = 1_048_576;
        let mut buf = [0u8; 8];
        h.encode(&mut buf);
        assert_eq!(NodeHeader::decode(&buf).unwrap(), h);
    }

    #[test]
    fn zero_width_roundtrip() {
        let mut h = NodeHeader::new(WidthType::Bits, false, false, 0);
        h.size = 1000;
        h.capacity = 16;
        let mut buf = [0u8; 8];
        h.encode(&mut buf);
        let back = NodeHeader::decode(&buf).unwrap();
        assert_eq!(back.width, 0);
        assert_eq!(back.payload_bytes(), 0);
    }

    #[test]
    fn multiply_width_is_bytes() {
        let mut h = NodeHeader::new(WidthType::Multiply, false, false, 4);
        h.size = 3;
        h.capacity = 32;
        let mut buf = [0u8; 8];
        h.encode(&mut buf);
        let back = NodeHeader::decode(&buf).unwrap();
        assert_eq!(back.width, 4);
        assert_eq!(back.payload_bytes(), 12);
        assert_eq!(back.byte_size(), 8 + 16);
    }

    #[test]
    fn corrupt_headers_rejected() {
        let buf = [0x03, 0, 0, 0, 0, 0, 0, 0];
        assert!(NodeHeader::decode(&buf).is_err());
        let buf = [0x80, 0, 0, 0, 0, 0, 0, 0];
        assert!(NodeHeader::decode(&buf).is_err());
        let buf = [0x00, 0, 0, 0, 0, 0, 0, 7];
        assert!(NodeHeader::decode(&buf).is_err());
        assert!(NodeHeader::decode(&buf[..4]).is_err());
    }

    #[test]
    fn bit_payload_sizes() {
        for (&w, expect) in [0usize, 1, 2, 4, 8, 16, 32, 64]
            .iter()
            .zip([0usize, 13, 25, 50, 100, 200, 400, 800])
        {
            let mut h = NodeHeader::new(WidthType::Bits, false, false, w);
            h.size = 100;
            assert_eq!(h.payload_bytes(), expect, "width {w}");
        }
    }
}
