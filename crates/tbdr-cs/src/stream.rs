use std::fmt;

use bitflags::bitflags;
use tracing::trace;

use crate::emit::Emit;
use crate::packet::{pkt7_header, Opcode};
use crate::reader::IovaResolver;

/// Byte span reserved in the GPU address space for each chunk of a stream.
pub const CHUNK_IOVA_SPAN: u64 = 1 << 24;

const MAX_CHUNK_WORDS: usize = (CHUNK_IOVA_SPAN / 4) as usize;

/// Identity of a stream; determines the GPU address window its chunks live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl StreamId {
    pub fn base_iova(self) -> u64 {
        (u64::from(self.0) + 1) << 32
    }

    /// Split an address into the stream that owns it and the byte offset inside that stream.
    pub fn from_iova(iova: u64) -> Option<(Self, u64)> {
        let window = iova >> 32;
        if window == 0 || window > u64::from(u32::MAX) + 1 {
            return None;
        }
        Some((Self((window - 1) as u32), iova & 0xffff_ffff))
    }
}

bitflags! {
    /// Render-mode predicate of a `CP_COND_REG_EXEC` region.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CondExec: u32 {
        const BINNING = 1 << 25;
        const GMEM = 1 << 26;
        const SYSMEM = 1 << 27;
    }
}

/// Selects the render-mode comparison for `CP_COND_REG_EXEC`.
pub const COND_REG_EXEC_MODE_RENDER_MODE: u32 = 0x3 << 28;

struct Chunk {
    words: Vec<u32>,
    limit: usize,
}

impl Chunk {
    fn with_limit(limit: usize) -> Self {
        Self {
            words: Vec::with_capacity(limit),
            limit,
        }
    }

    fn room(&self) -> usize {
        self.limit - self.words.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct CondRegion {
    flags: CondExec,
    chunk: usize,
    count_pos: usize,
}

/// Growable, append-only command stream.
///
/// The logical stream is the concatenation of its live chunks. Packets never straddle two chunks,
/// and an open conditional region is closed and re-opened when a new chunk is started so that
/// each chunk stays independently executable.
///
/// Chunks dropped by [`CommandStream::discard_entries`] stay resolvable until
/// [`CommandStream::reset`], since calls recorded earlier in other streams still point at them.
pub struct CommandStream {
    id: StreamId,
    chunk_words: usize,
    chunks: Vec<Chunk>,
    /// Index of the first live chunk; the ones before it are retired.
    first: usize,
    spare: Vec<Chunk>,
    recording: bool,
    cond: Option<CondRegion>,
    owed: usize,
}

impl CommandStream {
    pub fn new(id: StreamId, chunk_words: usize) -> Self {
        Self {
            id,
            chunk_words: chunk_words.clamp(16, MAX_CHUNK_WORDS),
            chunks: Vec::new(),
            first: 0,
            spare: Vec::new(),
            recording: false,
            cond: None,
            owed: 0,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn begin(&mut self) {
        debug_assert!(!self.recording, "stream {:?} already recording", self.id);
        self.recording = true;
    }

    pub fn end(&mut self) {
        debug_assert!(self.cond.is_none(), "conditional region left open");
        debug_assert_eq!(self.owed, 0, "packet left incomplete");
        self.recording = false;
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Forget the recorded content. New packets go to fresh chunks; the old ones keep their
    /// contents and addresses.
    pub fn discard_entries(&mut self) {
        debug_assert!(self.cond.is_none(), "conditional region left open");
        self.first = self.chunks.len();
        self.owed = 0;
    }

    /// Drop everything, retired chunks included, keeping the allocations for reuse.
    pub fn reset(&mut self) {
        self.cond = None;
        for mut chunk in self.chunks.drain(..) {
            chunk.words.clear();
            self.spare.push(chunk);
        }
        self.first = 0;
        self.owed = 0;
        self.recording = false;
    }

    fn live(&self) -> &[Chunk] {
        &self.chunks[self.first..]
    }

    fn live_last(&self) -> Option<&Chunk> {
        self.live().last()
    }

    pub fn is_empty(&self) -> bool {
        self.live().iter().all(|c| c.words.is_empty())
    }

    pub fn len_words(&self) -> usize {
        self.live().iter().map(|c| c.words.len()).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.live().len()
    }

    /// Address of live chunk `index`.
    pub fn chunk_iova(&self, index: usize) -> u64 {
        self.id.base_iova() + (self.first + index) as u64 * CHUNK_IOVA_SPAN
    }

    /// `(iova, words)` for every non-empty live chunk, in execution order.
    pub fn entries(&self) -> impl Iterator<Item = (u64, &[u32])> + '_ {
        self.live()
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.words.is_empty())
            .map(|(i, c)| (self.chunk_iova(i), c.words.as_slice()))
    }

    /// The logical stream content.
    pub fn words(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.len_words());
        for chunk in self.live() {
            out.extend_from_slice(&chunk.words);
        }
        out
    }

    /// Emit a call into every non-empty chunk of `other`.
    pub fn emit_call(&mut self, other: &CommandStream) {
        for (iova, words) in other.entries() {
            self.emit_pkt7(Opcode::IndirectBuffer, 3);
            self.emit_qw(iova);
            self.emit(words.len() as u32);
        }
    }

    /// Emit a call into a single region of known address and size.
    pub fn emit_call_raw(&mut self, iova: u64, size_words: u32) {
        if size_words == 0 {
            return;
        }
        self.emit_pkt7(Opcode::IndirectBuffer, 3);
        self.emit_qw(iova);
        self.emit(size_words);
    }

    /// Copy `other`'s chunks after the current content, preserving its chunk boundaries.
    pub fn append_stream(&mut self, other: &CommandStream) {
        debug_assert!(self.cond.is_none(), "cannot append inside a conditional region");
        debug_assert_eq!(self.owed, 0, "packet left incomplete");
        for chunk in other.chunks.iter().filter(|c| !c.words.is_empty()) {
            let mut copy = self.take_chunk(chunk.words.len());
            copy.words.extend_from_slice(&chunk.words);
            self.chunks.push(copy);
        }
    }

    /// Start a region executed only when the render mode matches `flags`.
    ///
    /// Regions do not nest.
    pub fn begin_conditional(&mut self, flags: CondExec) {
        assert!(self.cond.is_none(), "conditional regions do not nest");
        self.emit_pkt7(Opcode::CondRegExec, 2);
        self.emit(COND_REG_EXEC_MODE_RENDER_MODE | flags.bits());
        let chunk = self.chunks.len() - 1;
        let count_pos = self.chunks[chunk].words.len();
        self.emit(0);
        self.cond = Some(CondRegion {
            flags,
            chunk,
            count_pos,
        });
    }

    pub fn end_conditional(&mut self) {
        debug_assert_eq!(self.owed, 0, "packet left incomplete inside conditional region");
        let region = self.cond.take();
        assert!(region.is_some(), "end_conditional without begin_conditional");
        if let Some(region) = region {
            self.patch_region(region);
        }
    }

    pub fn in_conditional(&self) -> bool {
        self.cond.is_some()
    }

    fn patch_region(&mut self, region: CondRegion) {
        let chunk = &mut self.chunks[region.chunk];
        let dwords = chunk.words.len() - region.count_pos - 1;
        chunk.words[region.count_pos] = dwords as u32;
    }

    fn take_chunk(&mut self, min_words: usize) -> Chunk {
        let limit = self.chunk_words.max(min_words);
        debug_assert!(limit <= MAX_CHUNK_WORDS, "reservation larger than a chunk window");
        match self.spare.iter().position(|c| c.limit >= limit) {
            Some(i) => self.spare.swap_remove(i),
            None => Chunk::with_limit(limit),
        }
    }
}

impl Emit for CommandStream {
    fn reserve(&mut self, words: usize) {
        if let Some(last) = self.live_last() {
            if last.room() >= words {
                return;
            }
        }

        // A region re-opened in the new chunk costs three extra words.
        let reopen = if self.cond.is_some() { 3 } else { 0 };
        let region = self.cond.take();
        if let Some(region) = region {
            self.patch_region(region);
        }

        let chunk = self.take_chunk(words + reopen);
        self.chunks.push(chunk);
        trace!(stream = self.id.0, chunks = self.chunks.len(), "command stream grew");

        if let Some(region) = region {
            let index = self.chunks.len() - 1;
            let chunk = &mut self.chunks[index];
            chunk.words.push(pkt7_header(Opcode::CondRegExec as u32, 2));
            chunk
                .words
                .push(COND_REG_EXEC_MODE_RENDER_MODE | region.flags.bits());
            let count_pos = chunk.words.len();
            chunk.words.push(0);
            self.cond = Some(CondRegion {
                flags: region.flags,
                chunk: index,
                count_pos,
            });
        }
    }

    fn push_word(&mut self, word: u32) {
        let first = self.first;
        match self.chunks[first..].last_mut() {
            Some(chunk) if chunk.room() > 0 => chunk.words.push(word),
            _ => {
                self.reserve(1);
                if let Some(chunk) = self.chunks.last_mut() {
                    chunk.words.push(word);
                }
            }
        }
    }

    fn owed_words(&mut self) -> &mut usize {
        &mut self.owed
    }
}

impl IovaResolver for CommandStream {
    fn resolve(&self, iova: u64, size_words: usize) -> Option<&[u32]> {
        let (id, offset) = StreamId::from_iova(iova)?;
        if id != self.id {
            return None;
        }
        let chunk = self.chunks.get((offset / CHUNK_IOVA_SPAN) as usize)?;
        let start = ((offset % CHUNK_IOVA_SPAN) / 4) as usize;
        chunk.words.get(start..start.checked_add(size_words)?)
    }
}

impl fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStream")
            .field("id", &self.id)
            .field("chunks", &self.chunks.len())
            .field("words", &self.len_words())
            .field("recording", &self.recording)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketHeader;

    #[test]
    fn stream_id_round_trips_through_iova() {
        let id = StreamId(7);
        assert_eq!(StreamId::from_iova(id.base_iova() + 0x40), Some((id, 0x40)));
        assert_eq!(StreamId::from_iova(0x1000), None);
    }

    #[test]
    fn packets_do_not_straddle_chunks() {
        let mut cs = CommandStream::new(StreamId(0), 16);
        cs.begin();
        for _ in 0..5 {
            cs.emit_pkt7(Opcode::Nop, 4);
            cs.emit_array(&[1, 2, 3, 4]);
        }
        cs.end();

        // 15 of 16 words fit three packets; the fourth starts a new chunk.
        assert_eq!(cs.chunk_count(), 2);
        for (_, words) in cs.entries() {
            let hdr = PacketHeader::decode(words[0]).unwrap();
            assert_eq!(hdr.count(), 4);
        }
    }

    #[test]
    fn conditional_region_counts_its_payload() {
        let mut cs = CommandStream::new(StreamId(0), 64);
        cs.begin();
        cs.begin_conditional(CondExec::GMEM);
        cs.emit_write_reg(0x100, 5);
        cs.emit_wfi();
        cs.end_conditional();
        cs.end();

        let words = cs.words();
        assert_eq!(words[1], COND_REG_EXEC_MODE_RENDER_MODE | CondExec::GMEM.bits());
        assert_eq!(words[2], 3);
        assert_eq!(words.len(), 6);
    }

    #[test]
    fn conditional_region_reopens_in_new_chunk() {
        let mut cs = CommandStream::new(StreamId(0), 16);
        cs.begin();
        cs.begin_conditional(CondExec::SYSMEM);
        for i in 0..8 {
            cs.emit_write_reg(0x200 + i, i);
        }
        cs.end_conditional();
        cs.end();

        assert_eq!(cs.chunk_count(), 2);
        let chunks: Vec<_> = cs.entries().map(|(_, w)| w.to_vec()).collect();
        for words in &chunks {
            assert_eq!(
                PacketHeader::decode(words[0]),
                Some(PacketHeader::Type7 {
                    opcode: Opcode::CondRegExec as u32,
                    count: 2
                })
            );
            assert_eq!(words[1] & CondExec::all().bits(), CondExec::SYSMEM.bits());
            assert_eq!(words[2] as usize, words.len() - 3);
        }
    }

    #[test]
    fn discarded_chunks_stay_resolvable() {
        let mut cs = CommandStream::new(StreamId(3), 32);
        cs.begin();
        cs.emit_write_reg(0x10, 1);
        let (old_iova, _) = cs.entries().next().unwrap();
        cs.discard_entries();
        assert!(cs.is_empty());

        cs.emit_write_reg(0x10, 2);
        let (new_iova, words) = cs.entries().next().unwrap();
        assert_ne!(new_iova, old_iova);
        assert_eq!(words[1], 2);
        assert_eq!(cs.resolve(old_iova, 2).map(|w| w[1]), Some(1));
        cs.end();

        cs.reset();
        assert_eq!(cs.resolve(old_iova, 2), None);
    }

    #[test]
    fn call_emits_one_indirect_buffer_per_chunk() {
        let mut callee = CommandStream::new(StreamId(1), 16);
        callee.begin();
        for _ in 0..3 {
            callee.emit_pkt7(Opcode::Nop, 9);
            callee.emit_array(&[0; 9]);
        }
        callee.end();
        assert_eq!(callee.chunk_count(), 3);

        let mut cs = CommandStream::new(StreamId(0), 64);
        cs.begin();
        cs.emit_call(&callee);
        cs.end();

        let words = cs.words();
        assert_eq!(words.len(), 12);
        assert_eq!(words[1] as u64 | (words[2] as u64) << 32, callee.chunk_iova(0));
        assert_eq!(words[3], 10);
    }
}
