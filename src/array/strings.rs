//! Fixed-slot string array for table and column names.
//!
//! A `Multiply` node whose slot width is a power of two up to 64 bytes.
//! Every entry occupies one slot: the string bytes, zero fill, and the last
//! byte of the slot holding `width - 1 - len`. The slot width grows when a
//! longer name arrives, the same staging as integer widening: allocate,
//! re-pack, publish, free.
//!
//! Names are metadata, not data: arrays here hold a handful of short
//! entries, so operations favor clarity over packing tricks.

use crate::error::{Result, TabulaError};
use crate::mem::{Allocator, Mem};
use crate::types::{Ref, WidthType, NODE_HEADER_SIZE};

use super::header::{byte_size_for, NodeHeader};

/// Longest storable name: the widest slot is 64 bytes, one of which tracks
/// the fill.
pub const MAX_NAME_LEN: usize = 63;

pub struct StringArray {
    pos: Ref,
    header: NodeHeader,
}

fn slot_width_for(len: usize) -> usize {
    let mut w = 1;
    while w - 1 < len {
        w *= 2;
    }
    w
}

impl StringArray {
    pub fn create(alloc: &mut Allocator) -> Result<Ref> {
        let capacity = byte_size_for(WidthType::Multiply, 0, 0);
        let pos = alloc.alloc(capacity)?;
        let mut h = NodeHeader::new(WidthType::Multiply, false, false, 0);
        h.capacity = capacity;
        h.encode(alloc.bytes_mut(pos, NODE_HEADER_SIZE)?);
        Ok(pos)
    }

    pub fn attach(mem: &impl Mem, pos: Ref) -> Result<Self> {
        let header = NodeHeader::decode(mem.bytes(pos, NODE_HEADER_SIZE)?)?;
        if header.wtype != WidthType::Multiply {
            return Err(TabulaError::corrupt(format!(
                "expected string node at ref {pos}, found width-type {:?}",
                header.wtype
            )));
        }
        Ok(Self { pos, header })
    }

    pub fn pos(&self) -> Ref {
        self.pos
    }

    pub fn size(&self) -> usize {
        self.header.size
    }

    pub fn get(&self, mem: &impl Mem, i: usize) -> Result<String> {
        if i >= self.header.size {
            return Err(TabulaError::logic(format!(
                "string index {i} out of range (size {})",
                self.header.size
            )));
        }
        let w = self.header.width;
        if w == 0 {
            return Ok(String::new());
        }
        let slot = mem.bytes(self.pos + (NODE_HEADER_SIZE + i * w) as u64, w)?;
        let fill = slot[w - 1] as usize;
        if fill >= w {
            return Err(TabulaError::corrupt("string slot fill byte out of range"));
        }
        let len = w - 1 - fill;
        String::from_utf8(slot[..len].to_vec())
            .map_err(|_| TabulaError::corrupt("string slot is not valid UTF-8"))
    }

    pub fn push(&mut self, alloc: &mut Allocator, value: &str) -> Result<()> {
        self.insert(alloc, self.header.size, value)
    }

    pub fn insert(&mut self, alloc: &mut Allocator, i: usize, value: &str) -> Result<()> {
        if i > self.header.size {
            return Err(TabulaError::logic(format!(
                "string insert index {i} out of range (size {})",
                self.header.size
            )));
        }
        if value.len() > MAX_NAME_LEN {
            return Err(TabulaError::logic(format!(
                "name '{value}' exceeds {MAX_NAME_LEN} bytes"
            )));
        }
        let mut entries = self.read_all(alloc)?;
        entries.insert(i, value.to_owned());
        self.rewrite(alloc, entries)
    }

    pub fn set(&mut self, alloc: &mut Allocator, i: usize, value: &str) -> Result<()> {
        if i >= self.header.size {
            return Err(TabulaError::logic(format!(
                "string index {i} out of range (size {})",
                self.header.size
            )));
        }
        if value.len() > MAX_NAME_LEN {
            return Err(TabulaError::logic(format!(
                "name '{value}' exceeds {MAX_NAME_LEN} bytes"
            )));
        }
        let mut entries = self.read_all(alloc)?;
        entries[i] = value.to_owned();
        self.rewrite(alloc, entries)
    }

    pub fn erase(&mut self, alloc: &mut Allocator, i: usize) -> Result<()> {
        if i >= self.header.size {
            return Err(TabulaError::logic(format!(
                "string index {i} out of range (size {})",
                self.header.size
            )));
        }
        let mut entries = self.read_all(alloc)?;
        entries.remove(i);
        self.rewrite(alloc, entries)
    }

    /// Index of the first entry equal to `value`.
    pub fn find_first(&self, mem: &impl Mem, value: &str) -> Result<Option<usize>> {
        for i in 0..self.header.size {
            if self.get(mem, i)? == value {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    fn read_all(&self, mem: &impl Mem) -> Result<Vec<String>> {
        (0..self.header.size).map(|i| self.get(mem, i)).collect()
    }

    /// Re-pack the whole array at the width its longest entry needs. The
    /// new node is fully built before the old one is freed.
    fn rewrite(&mut self, alloc: &mut Allocator, entries: Vec<String>) -> Result<()> {
        let longest = entries.iter().map(String::len).max().unwrap_or(0);
        let width = if entries.is_empty() && longest == 0 {
            0
        } else {
            slot_width_for(longest)
        };
        let capacity = byte_size_for(WidthType::Multiply, entries.len(), width);
        let new_pos = alloc.alloc(capacity)?;

        let mut h = NodeHeader::new(WidthType::Multiply, false, false, width);
        h.size = entries.len();
        h.capacity = capacity;
        let node = alloc.bytes_mut(new_pos, h.capacity)?;
        h.encode(node);
        if width > 0 {
            for (i, entry) in entries.iter().enumerate() {
                let slot = &mut node[NODE_HEADER_SIZE + i * width..NODE_HEADER_SIZE + (i + 1) * width];
                slot[..entry.len()].copy_from_slice(entry.as_bytes());
                slot[entry.len()..].fill(0);
                slot[width - 1] = (width - 1 - entry.len()) as u8;
            }
        }

        alloc.free(self.pos, self.header.capacity);
        self.pos = new_pos;
        self.header = h;
        Ok(())
    }
}
