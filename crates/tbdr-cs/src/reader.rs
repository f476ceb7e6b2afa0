//! Decoding of recorded streams.
//!
//! Used by tests and tooling to walk packets and to expand indirect-buffer calls into the word
//! sequence the command processor would actually execute.

use thiserror::Error;

use crate::packet::{Opcode, PacketHeader};

/// Maximum nesting of indirect-buffer calls while flattening.
pub const MAX_CALL_DEPTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("word {word:#010x} at offset {offset} is not a packet header")]
    BadHeader { offset: usize, word: u32 },

    #[error("packet at offset {offset} needs {count} payload words, only {remaining} left")]
    PacketOverrun {
        offset: usize,
        count: u32,
        remaining: usize,
    },

    #[error("call to {iova:#x} ({size} words) does not resolve to recorded memory")]
    UnresolvedCall { iova: u64, size: usize },

    #[error("indirect-buffer calls nested deeper than {MAX_CALL_DEPTH}")]
    CallTooDeep,
}

/// Maps a GPU address back to the words recorded there.
pub trait IovaResolver {
    fn resolve(&self, iova: u64, size_words: usize) -> Option<&[u32]>;
}

impl<T: IovaResolver + ?Sized> IovaResolver for &T {
    fn resolve(&self, iova: u64, size_words: usize) -> Option<&[u32]> {
        (**self).resolve(iova, size_words)
    }
}

impl IovaResolver for [&dyn IovaResolver] {
    fn resolve(&self, iova: u64, size_words: usize) -> Option<&[u32]> {
        self.iter().find_map(|r| r.resolve(iova, size_words))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub header: PacketHeader,
    pub payload: &'a [u32],
}

impl<'a> Packet<'a> {
    pub fn opcode(&self) -> Option<Opcode> {
        match self.header {
            PacketHeader::Type7 { opcode, .. } => Opcode::from_u32(opcode),
            PacketHeader::Type4 { .. } => None,
        }
    }

    /// First register written by a type-4 packet.
    pub fn reg(&self) -> Option<u32> {
        match self.header {
            PacketHeader::Type4 { reg, .. } => Some(reg),
            PacketHeader::Type7 { .. } => None,
        }
    }

    pub fn is(&self, opcode: Opcode) -> bool {
        self.opcode() == Some(opcode)
    }

    /// Value written to `reg` if this type-4 packet covers it.
    pub fn reg_value(&self, reg: u32) -> Option<u32> {
        let first = self.reg()?;
        let index = reg.checked_sub(first)? as usize;
        self.payload.get(index).copied()
    }
}

pub struct PacketReader<'a> {
    words: &'a [u32],
    offset: usize,
    done: bool,
}

impl<'a> PacketReader<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self {
            words,
            offset: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for PacketReader<'a> {
    type Item = Result<Packet<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.words.len() {
            return None;
        }

        let word = self.words[self.offset];
        let Some(header) = PacketHeader::decode(word) else {
            self.done = true;
            return Some(Err(DecodeError::BadHeader {
                offset: self.offset,
                word,
            }));
        };

        let start = self.offset + 1;
        let count = header.count();
        let end = start + count as usize;
        if end > self.words.len() {
            self.done = true;
            return Some(Err(DecodeError::PacketOverrun {
                offset: self.offset,
                count,
                remaining: self.words.len() - start,
            }));
        }

        self.offset = end;
        Some(Ok(Packet {
            header,
            payload: &self.words[start..end],
        }))
    }
}

/// Decode every packet of `words`.
pub fn packets(words: &[u32]) -> Result<Vec<Packet<'_>>, DecodeError> {
    PacketReader::new(words).collect()
}

/// Expand indirect-buffer calls recursively, returning the executed word sequence.
pub fn flatten<R: IovaResolver + ?Sized>(words: &[u32], resolver: &R) -> Result<Vec<u32>, DecodeError> {
    let mut out = Vec::with_capacity(words.len());
    flatten_into(words, resolver, 0, &mut out)?;
    Ok(out)
}

fn flatten_into<R: IovaResolver + ?Sized>(
    words: &[u32],
    resolver: &R,
    depth: usize,
    out: &mut Vec<u32>,
) -> Result<(), DecodeError> {
    if depth > MAX_CALL_DEPTH {
        return Err(DecodeError::CallTooDeep);
    }

    let mut offset = 0;
    for packet in PacketReader::new(words) {
        let packet = packet?;
        let len = 1 + packet.payload.len();
        if packet.is(Opcode::IndirectBuffer) && packet.payload.len() == 3 {
            let iova = u64::from(packet.payload[0]) | u64::from(packet.payload[1]) << 32;
            let size = packet.payload[2] as usize;
            let callee = resolver
                .resolve(iova, size)
                .ok_or(DecodeError::UnresolvedCall { iova, size })?;
            flatten_into(callee, resolver, depth + 1, out)?;
        } else {
            out.extend_from_slice(&words[offset..offset + len]);
        }
        offset += len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::Emit;
    use crate::stream::{CommandStream, StreamId};

    #[test]
    fn reader_reports_truncated_packet() {
        let mut cs = CommandStream::new(StreamId(0), 64);
        cs.begin();
        cs.emit_regs(0x40, &[1, 2, 3]);
        cs.end();
        let words = cs.words();

        let err = packets(&words[..3]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::PacketOverrun {
                offset: 0,
                count: 3,
                remaining: 2
            }
        );

        let decoded = packets(&words).unwrap();
        assert_eq!(decoded[0].reg_value(0x42), Some(3));
        assert_eq!(decoded[0].reg_value(0x43), None);
    }

    #[test]
    fn flatten_inlines_nested_calls() {
        let mut inner = CommandStream::new(StreamId(2), 64);
        inner.begin();
        inner.emit_write_reg(0x10, 0xaa);
        inner.end();

        let mut middle = CommandStream::new(StreamId(1), 64);
        middle.begin();
        middle.emit_wfi();
        middle.emit_call(&inner);
        middle.end();

        let mut top = CommandStream::new(StreamId(0), 64);
        top.begin();
        top.emit_call(&middle);
        top.emit_wfi();
        top.end();

        let resolvers: [&dyn IovaResolver; 2] = [&inner, &middle];
        let flat = flatten(&top.words(), &resolvers[..]).unwrap();

        let ops: Vec<_> = packets(&flat)
            .unwrap()
            .iter()
            .map(|p| (p.opcode(), p.reg()))
            .collect();
        assert_eq!(
            ops,
            vec![
                (Some(Opcode::WaitForIdle), None),
                (None, Some(0x10)),
                (Some(Opcode::WaitForIdle), None),
            ]
        );
    }

    #[test]
    fn flatten_rejects_dangling_call() {
        let mut top = CommandStream::new(StreamId(0), 64);
        top.begin();
        top.emit_call_raw(0x1234_0000_0000, 4);
        top.end();

        let resolvers: [&dyn IovaResolver; 0] = [];
        assert!(matches!(
            flatten(&top.words(), &resolvers[..]),
            Err(DecodeError::UnresolvedCall { size: 4, .. })
        ));
    }
}
