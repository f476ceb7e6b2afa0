use std::fmt;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// Bump allocator over a fixed range of word offsets.
///
/// Only offsets are tracked; the owner keeps the backing words. Individual allocations are
/// never freed, the whole arena is reset at once. The most recent allocation may be shrunk so
/// that a sub-stream which wrote fewer words than it reserved gives the tail back.
#[derive(Clone)]
pub struct BumpArena {
    capacity: u64,
    cursor: u64,
    last_start: Option<u64>,
}

impl BumpArena {
    /// Create an arena handing out offsets in `[0, capacity)`.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            cursor: 0,
            last_start: None,
        }
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.last_start = None;
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.cursor)
    }

    /// Next allocation will be at or after this offset.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Allocate `size` units aligned to `alignment`.
    pub fn alloc(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let alignment = alignment.max(1);

        let aligned = align_up(self.cursor, alignment);
        let end = aligned.checked_add(size)?;
        if end > self.capacity {
            return None;
        }

        self.cursor = end;
        self.last_start = Some(aligned);
        Some(aligned)
    }

    /// Shrink the allocation that started at `start` to `used` units.
    ///
    /// Only the most recent allocation can be shrunk; anything else is left untouched.
    pub fn shrink_last(&mut self, start: u64, used: u64) {
        if self.last_start != Some(start) {
            return;
        }
        let end = start.saturating_add(used);
        if end <= self.cursor {
            self.cursor = end;
        }
    }
}

impl fmt::Debug for BumpArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BumpArena")
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(17, 16), 32);
    }

    #[test]
    fn alloc_respects_alignment_and_capacity() {
        let mut arena = BumpArena::new(64);

        assert_eq!(arena.alloc(1, 1), Some(0));
        assert_eq!(arena.alloc(1, 16), Some(16));
        assert_eq!(arena.alloc(16, 32), Some(32));
        assert_eq!(arena.remaining(), 16);
        assert!(arena.alloc(17, 1).is_none());
    }

    #[test]
    fn shrink_only_applies_to_latest_allocation() {
        let mut arena = BumpArena::new(64);
        let a = arena.alloc(8, 1).unwrap();
        let b = arena.alloc(8, 1).unwrap();

        arena.shrink_last(a, 2);
        assert_eq!(arena.cursor(), 16);

        arena.shrink_last(b, 3);
        assert_eq!(arena.cursor(), 11);
        assert_eq!(arena.alloc(1, 1), Some(11));
    }

    #[test]
    fn reset_reuses_space() {
        let mut arena = BumpArena::new(32);
        assert_eq!(arena.alloc(30, 1), Some(0));
        assert!(arena.alloc(4, 1).is_none());

        arena.reset();
        assert_eq!(arena.alloc(4, 1), Some(0));
    }
}
