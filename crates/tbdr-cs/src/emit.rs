use crate::packet::{pkt4_header, pkt7_header, Opcode, VgtEvent, TYPE4_MAX_COUNT, TYPE7_MAX_COUNT};

/// Word sink shared by growable command streams and fixed-size sub-streams.
///
/// Implementors only provide storage; packet framing lives in the provided methods. Every
/// packet header records how many payload words it still expects, and emitting a new header
/// while the previous packet is short is a caller bug.
pub trait Emit {
    /// Guarantee that `words` more words can be appended contiguously.
    fn reserve(&mut self, words: usize);

    /// Append one word to storage that [`Emit::reserve`] already made room for.
    fn push_word(&mut self, word: u32);

    /// Payload words still owed to the most recent packet header.
    fn owed_words(&mut self) -> &mut usize;

    fn emit(&mut self, word: u32) {
        let owed = self.owed_words();
        if *owed > 0 {
            *owed -= 1;
        } else {
            self.reserve(1);
        }
        self.push_word(word);
    }

    fn emit_qw(&mut self, value: u64) {
        self.emit(value as u32);
        self.emit((value >> 32) as u32);
    }

    fn emit_array(&mut self, words: &[u32]) {
        for &w in words {
            self.emit(w);
        }
    }

    fn emit_pkt7(&mut self, opcode: Opcode, count: u32) {
        debug_assert!(count <= TYPE7_MAX_COUNT, "type-7 payload too large: {count}");
        debug_assert_eq!(
            *self.owed_words(),
            0,
            "previous packet is missing payload words"
        );
        self.reserve(1 + count as usize);
        self.push_word(pkt7_header(opcode as u32, count));
        *self.owed_words() = count as usize;
    }

    fn emit_pkt4(&mut self, reg: u32, count: u32) {
        debug_assert!(count <= TYPE4_MAX_COUNT, "type-4 payload too large: {count}");
        debug_assert_eq!(
            *self.owed_words(),
            0,
            "previous packet is missing payload words"
        );
        self.reserve(1 + count as usize);
        self.push_word(pkt4_header(reg, count));
        *self.owed_words() = count as usize;
    }

    /// Write consecutive registers starting at `reg` in a single type-4 packet.
    fn emit_regs(&mut self, reg: u32, values: &[u32]) {
        self.emit_pkt4(reg, values.len() as u32);
        self.emit_array(values);
    }

    fn emit_write_reg(&mut self, reg: u32, value: u32) {
        self.emit_regs(reg, &[value]);
    }

    /// Event without a memory write.
    fn emit_event_write(&mut self, event: VgtEvent) {
        debug_assert!(!event.writes_seqno(), "{event:?} needs a seqno address");
        self.emit_pkt7(Opcode::EventWrite, 1);
        self.emit(event as u32);
    }

    /// Timestamp event writing `value` to `iova` once it retires.
    fn emit_event_write_ts(&mut self, event: VgtEvent, iova: u64, value: u32) {
        self.emit_pkt7(Opcode::EventWrite, 4);
        self.emit(event as u32);
        self.emit_qw(iova);
        self.emit(value);
    }

    fn emit_wfi(&mut self) {
        self.emit_pkt7(Opcode::WaitForIdle, 0);
    }
}
