use std::fmt;

use tracing::trace;

use crate::arena::BumpArena;
use crate::emit::Emit;
use crate::error::{Result, StreamError};
use crate::reader::IovaResolver;
use crate::stream::StreamId;

/// Address and size (in words) of a block of state the command processor can load as a group.
///
/// A zero-sized draw state is a valid value: it disables its group when emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DrawState {
    pub iova: u64,
    pub size: u32,
}

impl DrawState {
    pub const EMPTY: Self = Self { iova: 0, size: 0 };

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// A raw allocation from the pool that the caller fills in after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAlloc {
    pub iova: u64,
    offset: u64,
    len: u64,
}

/// Writer for one sub-stream; handed back to [`SubStreamPool::end_sub_stream`] when done.
pub struct SubStream {
    iova: u64,
    offset: u64,
    reserved: usize,
    words: Vec<u32>,
    owed: usize,
}

impl SubStream {
    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn len_words(&self) -> usize {
        self.words.len()
    }
}

impl Emit for SubStream {
    fn reserve(&mut self, words: usize) {
        debug_assert!(
            self.words.len() + words <= self.reserved,
            "sub-stream overrun: reserved {} words, need {}",
            self.reserved,
            self.words.len() + words
        );
    }

    fn push_word(&mut self, word: u32) {
        self.words.push(word);
    }

    fn owed_words(&mut self) -> &mut usize {
        &mut self.owed
    }
}

impl fmt::Debug for SubStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubStream")
            .field("iova", &self.iova)
            .field("reserved", &self.reserved)
            .field("written", &self.words.len())
            .finish()
    }
}

/// Arena of transient per-draw state blocks.
///
/// Blocks are carved out with a bump pointer and never freed individually; the whole pool is
/// reset between recordings. Only one sub-stream may be open at a time.
pub struct SubStreamPool {
    id: StreamId,
    arena: BumpArena,
    storage: Vec<u32>,
    open: Option<u64>,
}

impl SubStreamPool {
    pub fn new(id: StreamId, capacity_words: u64) -> Self {
        Self {
            id,
            arena: BumpArena::new(capacity_words),
            storage: Vec::new(),
            open: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn reset(&mut self) {
        self.arena.reset();
        self.storage.clear();
        self.open = None;
    }

    pub fn used_words(&self) -> u64 {
        self.arena.cursor()
    }

    pub fn remaining_words(&self) -> u64 {
        self.arena.remaining()
    }

    fn iova_of(&self, offset: u64) -> u64 {
        self.id.base_iova() + offset * 4
    }

    fn grab(&mut self, words: u64, align: u64) -> Result<u64> {
        let offset = self
            .arena
            .alloc(words, align)
            .ok_or(StreamError::SubStreamExhausted {
                requested: words,
                remaining: self.arena.remaining(),
            })?;
        let end = (offset + words) as usize;
        if self.storage.len() < end {
            self.storage.resize(end, 0);
        }
        Ok(offset)
    }

    /// Reserve `words` words for a new sub-stream.
    pub fn begin_sub_stream(&mut self, words: usize) -> Result<SubStream> {
        debug_assert!(self.open.is_none(), "sub-stream already open");
        let offset = self.grab(words as u64, 1)?;
        self.open = Some(offset);
        Ok(SubStream {
            iova: self.iova_of(offset),
            offset,
            reserved: words,
            words: Vec::with_capacity(words),
            owed: 0,
        })
    }

    /// Commit a sub-stream's words and return the draw state referencing them.
    ///
    /// Unused reserved words are returned to the arena.
    pub fn end_sub_stream(&mut self, sub: SubStream) -> Result<DrawState> {
        debug_assert_eq!(self.open, Some(sub.offset), "ending a sub-stream that is not open");
        debug_assert_eq!(sub.owed, 0, "packet left incomplete in sub-stream");
        self.open = None;

        if sub.words.len() > sub.reserved {
            return Err(StreamError::SubStreamOverrun {
                reserved: sub.reserved,
                written: sub.words.len(),
            });
        }

        let start = sub.offset as usize;
        self.storage[start..start + sub.words.len()].copy_from_slice(&sub.words);
        self.arena.shrink_last(sub.offset, sub.words.len() as u64);
        trace!(iova = sub.iova, words = sub.words.len(), "sub-stream committed");

        Ok(DrawState {
            iova: sub.iova,
            size: sub.words.len() as u32,
        })
    }

    /// Allocate `count` blocks of `block_words` words, aligned to the block size.
    pub fn alloc(&mut self, count: usize, block_words: usize) -> Result<SubAlloc> {
        let len = (count * block_words) as u64;
        let offset = self.grab(len, block_words as u64)?;
        Ok(SubAlloc {
            iova: self.iova_of(offset),
            offset,
            len,
        })
    }

    /// Fill (part of) a raw allocation starting `word_offset` words in.
    pub fn write(&mut self, alloc: &SubAlloc, word_offset: usize, words: &[u32]) -> Result<()> {
        let end = word_offset + words.len();
        if end as u64 > alloc.len {
            return Err(StreamError::BadAllocation {
                offset: alloc.offset + word_offset as u64,
            });
        }
        let start = alloc.offset as usize + word_offset;
        let dst = self
            .storage
            .get_mut(start..start + words.len())
            .ok_or(StreamError::BadAllocation {
                offset: alloc.offset,
            })?;
        dst.copy_from_slice(words);
        Ok(())
    }

    /// Words previously written at `iova`, if it belongs to this pool.
    pub fn read(&self, iova: u64, words: usize) -> Option<&[u32]> {
        let (id, offset) = StreamId::from_iova(iova)?;
        if id != self.id {
            return None;
        }
        let start = (offset / 4) as usize;
        self.storage.get(start..start.checked_add(words)?)
    }
}

impl IovaResolver for SubStreamPool {
    fn resolve(&self, iova: u64, size_words: usize) -> Option<&[u32]> {
        self.read(iova, size_words)
    }
}

impl fmt::Debug for SubStreamPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubStreamPool")
            .field("id", &self.id)
            .field("arena", &self.arena)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Opcode;

    #[test]
    fn sub_stream_returns_unused_tail() {
        let mut pool = SubStreamPool::new(StreamId(9), 64);

        let mut sub = pool.begin_sub_stream(16).unwrap();
        sub.emit_write_reg(0x10, 1);
        let ds = pool.end_sub_stream(sub).unwrap();
        assert_eq!(ds.size, 2);
        assert_eq!(ds.iova, StreamId(9).base_iova());
        assert_eq!(pool.used_words(), 2);

        let sub = pool.begin_sub_stream(4).unwrap();
        assert_eq!(sub.iova(), StreamId(9).base_iova() + 8);
        let ds = pool.end_sub_stream(sub).unwrap();
        assert!(ds.is_empty());
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut pool = SubStreamPool::new(StreamId(0), 8);
        let err = pool.begin_sub_stream(9).unwrap_err();
        assert_eq!(
            err,
            StreamError::SubStreamExhausted {
                requested: 9,
                remaining: 8
            }
        );
    }

    #[test]
    fn committed_words_are_resolvable() {
        let mut pool = SubStreamPool::new(StreamId(2), 64);
        let mut sub = pool.begin_sub_stream(3).unwrap();
        sub.emit_pkt7(Opcode::Nop, 2);
        sub.emit_qw(0xdead_beef_0000_0001);
        let ds = pool.end_sub_stream(sub).unwrap();

        let words = pool.resolve(ds.iova, ds.size as usize).unwrap();
        assert_eq!(&words[1..], &[1, 0xdead_beef]);
    }

    #[test]
    fn raw_allocations_are_block_aligned() {
        let mut pool = SubStreamPool::new(StreamId(0), 128);
        let mut sub = pool.begin_sub_stream(3).unwrap();
        sub.emit_wfi();
        pool.end_sub_stream(sub).unwrap();

        let alloc = pool.alloc(2, 16).unwrap();
        assert_eq!(alloc.iova, StreamId(0).base_iova() + 16 * 4);
        pool.write(&alloc, 16, &[7; 16]).unwrap();
        assert!(pool.write(&alloc, 17, &[7; 16]).is_err());
        assert_eq!(pool.read(alloc.iova + 64, 1), Some(&[7u32][..]));
    }
}
