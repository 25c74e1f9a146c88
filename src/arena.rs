//! Block allocator over one fixed byte region.
//!
//! Every dynamic structure of the VM (stacks, class metadata budget and the
//! object heap) is carved out of a single buffer handed to the arena at
//! startup. The buffer is split into blocks, each preceded by an 8 byte
//! record:
//!
//! +------------+------------+--------+-------+------------+
//! | prev (u16) | next (u16) | used   | pad   | tag (u16)  |
//! +------------+------------+--------+-------+------------+
//!
//! `next` is the payload size of the block and `prev` the payload size of
//! the block before it, both in 8 byte units, so the records form a doubly
//! linked list through the whole region. The first record has no
//! predecessor and the last record is a used sentinel with no successor.
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Size of a block record and the allocation granularity.
pub const UNIT: usize = 8;
/// Largest region (and largest single allocation) the 16 bit offsets can
/// describe.
pub const MAX_ARENA_BYTES: usize = 0xFFFF << 3;

const NIL: u16 = u16::MAX;

/// Owner tags let unrelated sub-allocators share the arena and be told
/// apart when reporting usage.
pub type Tag = u16;

pub const DEFAULT_TAG: Tag = 0;
pub const VM_STACK_TAG: Tag = 1;
pub const NATIVE_STACK_TAG: Tag = 2;
pub const CLASS_HEAP_TAG: Tag = 3;
pub const OBJECT_HEAP_TAG: Tag = 4;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    #[error("arena is not initialized")]
    NotInitialized,
    #[error("arena is already initialized")]
    AlreadyInitialized,
    #[error("arena of {0} bytes exceeds the addressable maximum")]
    TooLarge(usize),
    #[error("arena of {0} bytes cannot hold a single block")]
    TooSmall(usize),
}

/// Reference to an allocated block, the unit index of its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef(u16);

impl BlockRef {
    /// Byte offset of the block payload inside the arena buffer.
    pub fn offset(self) -> usize {
        (self.0 as usize + 1) * UNIT
    }
}

/// Snapshot of one block used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub block: BlockRef,
    pub size: usize,
    pub used: bool,
    pub tag: Tag,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    prev: u16,
    next: u16,
    used: bool,
    tag: Tag,
}

#[derive(Debug, Default)]
pub struct Arena {
    buffer: Vec<u8>,
    initialized: bool,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `buffer` and formats it as one free block between
    /// the head record and the end sentinel. The length is rounded down to
    /// a multiple of 8.
    pub fn initialize(&mut self, mut buffer: Vec<u8>) -> Result<(), ArenaError> {
        if self.initialized {
            return Err(ArenaError::AlreadyInitialized);
        }
        let size = buffer.len();
        if size > MAX_ARENA_BYTES {
            return Err(ArenaError::TooLarge(size));
        }
        let units = size / UNIT;
        if units < 3 {
            return Err(ArenaError::TooSmall(size));
        }
        buffer.truncate(units * UNIT);
        buffer.fill(0);
        self.buffer = buffer;
        let payload = (units - 2) as u16;
        self.write_record(
            0,
            Record {
                prev: NIL,
                next: payload,
                used: false,
                tag: DEFAULT_TAG,
            },
        );
        self.write_record(
            units - 1,
            Record {
                prev: payload,
                next: NIL,
                used: true,
                tag: DEFAULT_TAG,
            },
        );
        self.initialized = true;
        log::debug!("arena initialized with {} bytes", units * UNIT);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Total size of the managed region in bytes.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// First-fit allocation of `size` zeroed bytes. Returns `None` without
    /// touching the arena when it is not initialized, when `size` is zero or
    /// too large, or when no free block is big enough.
    pub fn allocate(&mut self, size: usize, tag: Tag) -> Option<BlockRef> {
        if !self.initialized || size == 0 || size > MAX_ARENA_BYTES {
            return None;
        }
        let want = ((size + UNIT - 1) / UNIT) as u16;
        let mut at = 0usize;
        loop {
            let rec = self.read_record(at);
            if rec.next == NIL {
                return None;
            }
            if !rec.used && rec.next >= want {
                if rec.next - want <= 1 {
                    // Remainder too small to carry a payload, hand out the
                    // whole block.
                    self.write_record(
                        at,
                        Record {
                            used: true,
                            tag,
                            ..rec
                        },
                    );
                } else {
                    let rest = rec.next - want - 1;
                    self.write_record(
                        at,
                        Record {
                            next: want,
                            used: true,
                            tag,
                            ..rec
                        },
                    );
                    let split = at + 1 + want as usize;
                    self.write_record(
                        split,
                        Record {
                            prev: want,
                            next: rest,
                            used: false,
                            tag: DEFAULT_TAG,
                        },
                    );
                    let after = split + 1 + rest as usize;
                    let mut follower = self.read_record(after);
                    follower.prev = rest;
                    self.write_record(after, follower);
                }
                let block = BlockRef(at as u16);
                let range = self.payload_range(at);
                self.buffer[range].fill(0);
                return Some(block);
            }
            at += 1 + rec.next as usize;
        }
    }

    /// Releases `block` and merges it with free neighbours. Freeing a block
    /// that is not a live allocation of this arena has no effect.
    pub fn free(&mut self, block: BlockRef) {
        if !self.initialized || !self.is_live(block) {
            return;
        }
        let mut at = block.0 as usize;
        let mut rec = self.read_record(at);
        rec.used = false;
        rec.tag = DEFAULT_TAG;
        self.write_record(at, rec);

        if rec.prev != NIL {
            let before = at - rec.prev as usize - 1;
            let mut prev = self.read_record(before);
            if !prev.used {
                prev.next += 1 + rec.next;
                self.write_record(before, prev);
                at = before;
                rec = prev;
                self.relink_follower(at, rec.next);
            }
        }

        let after = at + 1 + rec.next as usize;
        let next = self.read_record(after);
        if !next.used {
            rec.next += 1 + next.next;
            self.write_record(at, rec);
            self.relink_follower(at, rec.next);
        }
    }

    /// Sum of payload sizes of all used blocks, sentinel excluded.
    pub fn used_bytes(&self) -> Result<usize, ArenaError> {
        if !self.initialized {
            return Err(ArenaError::NotInitialized);
        }
        Ok(self.blocks().filter(|b| b.used).map(|b| b.size).sum())
    }

    /// Bytes held by blocks carrying `tag`.
    pub fn used_bytes_by_tag(&self, tag: Tag) -> usize {
        self.blocks()
            .filter(|b| b.used && b.tag == tag)
            .map(|b| b.size)
            .sum()
    }

    /// Walks every block between the head record and the sentinel.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let mut at = 0usize;
        let mut done = !self.initialized;
        std::iter::from_fn(move || {
            if done {
                return None;
            }
            let rec = self.read_record(at);
            if rec.next == NIL {
                done = true;
                return None;
            }
            let info = BlockInfo {
                block: BlockRef(at as u16),
                size: rec.next as usize * UNIT,
                used: rec.used,
                tag: rec.tag,
            };
            at += 1 + rec.next as usize;
            Some(info)
        })
    }

    /// Payload size of `block` in bytes, zero if it is not live.
    pub fn block_size(&self, block: BlockRef) -> usize {
        if !self.holds(block) {
            return 0;
        }
        self.read_record(block.0 as usize).next as usize * UNIT
    }

    /// Detaches the backing buffer. Allocation and free are no-ops
    /// afterwards until the arena is initialized again.
    pub fn dispose(&mut self) -> Option<Vec<u8>> {
        if !self.initialized {
            return None;
        }
        self.initialized = false;
        Some(std::mem::take(&mut self.buffer))
    }

    /// Payload bytes of `block`. Empty for a block that is not live.
    pub fn region(&self, block: BlockRef) -> &[u8] {
        if !self.holds(block) {
            return &[];
        }
        let range = self.payload_range(block.0 as usize);
        &self.buffer[range]
    }

    pub fn region_mut(&mut self, block: BlockRef) -> &mut [u8] {
        if !self.holds(block) {
            return &mut [];
        }
        let range = self.payload_range(block.0 as usize);
        &mut self.buffer[range]
    }

    /// Reads a little-endian word at `offset` inside `block`.
    pub fn read_u32(&self, block: BlockRef, offset: usize) -> Option<u32> {
        self.region(block)
            .get(offset..offset + 4)
            .map(LittleEndian::read_u32)
    }

    pub fn write_u32(&mut self, block: BlockRef, offset: usize, value: u32) -> bool {
        match self.region_mut(block).get_mut(offset..offset + 4) {
            Some(bytes) => {
                LittleEndian::write_u32(bytes, value);
                true
            }
            None => false,
        }
    }

    /// Constant time check that `block` names a used block record. Handles
    /// only come out of `allocate`, so this is enough for payload access;
    /// `free` walks the list instead.
    fn holds(&self, block: BlockRef) -> bool {
        let at = block.0 as usize;
        if !self.initialized || (at + 1) * UNIT > self.buffer.len() {
            return false;
        }
        let rec = self.read_record(at);
        rec.used && rec.next != NIL && (at + 1 + rec.next as usize) * UNIT <= self.buffer.len()
    }

    fn is_live(&self, block: BlockRef) -> bool {
        self.initialized
            && self
                .blocks()
                .any(|b| b.block == block && b.used)
    }

    fn payload_range(&self, at: usize) -> std::ops::Range<usize> {
        let rec = self.read_record(at);
        let start = (at + 1) * UNIT;
        start..start + rec.next as usize * UNIT
    }

    fn relink_follower(&mut self, at: usize, size: u16) {
        let after = at + 1 + size as usize;
        let mut follower = self.read_record(after);
        follower.prev = size;
        self.write_record(after, follower);
    }

    fn read_record(&self, at: usize) -> Record {
        let raw = &self.buffer[at * UNIT..(at + 1) * UNIT];
        Record {
            prev: LittleEndian::read_u16(&raw[0..2]),
            next: LittleEndian::read_u16(&raw[2..4]),
            used: raw[4] != 0,
            tag: LittleEndian::read_u16(&raw[6..8]),
        }
    }

    fn write_record(&mut self, at: usize, rec: Record) {
        let raw = &mut self.buffer[at * UNIT..(at + 1) * UNIT];
        LittleEndian::write_u16(&mut raw[0..2], rec.prev);
        LittleEndian::write_u16(&mut raw[2..4], rec.next);
        raw[4] = rec.used as u8;
        raw[5] = 0;
        LittleEndian::write_u16(&mut raw[6..8], rec.tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arena(size: usize) -> Arena {
        let mut arena = Arena::new();
        arena.initialize(vec![0; size]).unwrap();
        arena
    }

    #[test]
    fn fresh_arena_is_one_free_block() {
        let arena = arena(1024);
        let blocks: Vec<_> = arena.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, 1024 - 2 * UNIT);
        assert!(!blocks[0].used);
        assert_eq!(arena.used_bytes(), Ok(0));
    }

    #[test]
    fn rejects_bad_sizes() {
        let mut arena = Arena::new();
        assert_eq!(
            arena.initialize(vec![0; MAX_ARENA_BYTES + 8]),
            Err(ArenaError::TooLarge(MAX_ARENA_BYTES + 8))
        );
        assert_eq!(arena.initialize(vec![0; 16]), Err(ArenaError::TooSmall(16)));
        arena.initialize(vec![0; 64]).unwrap();
        assert_eq!(
            arena.initialize(vec![0; 64]),
            Err(ArenaError::AlreadyInitialized)
        );
    }

    #[test]
    fn allocation_fails_cleanly() {
        let mut uninit = Arena::new();
        assert_eq!(uninit.allocate(8, DEFAULT_TAG), None);
        assert_eq!(uninit.used_bytes(), Err(ArenaError::NotInitialized));

        let mut arena = arena(256);
        assert_eq!(arena.allocate(0, DEFAULT_TAG), None);
        assert_eq!(arena.allocate(MAX_ARENA_BYTES + 1, DEFAULT_TAG), None);
        assert_eq!(arena.allocate(1024, DEFAULT_TAG), None);
        assert_eq!(arena.used_bytes(), Ok(0));
    }

    #[test]
    fn freed_block_is_reused_first_fit() {
        let mut arena = arena(1024);
        let p = arena.allocate(40, DEFAULT_TAG).unwrap();
        let q = arena.allocate(64, DEFAULT_TAG).unwrap();
        let r = arena.allocate(24, DEFAULT_TAG).unwrap();
        arena.free(q);
        let s = arena.allocate(64, DEFAULT_TAG).unwrap();
        assert_eq!(s, q);
        let s_range = s.offset()..s.offset() + arena.block_size(s);
        assert!(p.offset() + arena.block_size(p) <= s_range.start);
        assert!(s_range.end <= r.offset());
    }

    #[test]
    fn adjacent_frees_coalesce() {
        let mut arena = arena(1024);
        let a = arena.allocate(16, DEFAULT_TAG).unwrap();
        let b = arena.allocate(32, DEFAULT_TAG).unwrap();
        let c = arena.allocate(48, DEFAULT_TAG).unwrap();
        let _guard = arena.allocate(8, DEFAULT_TAG).unwrap();

        arena.free(a);
        arena.free(b);
        let first = arena.blocks().next().unwrap();
        assert!(!first.used);
        assert_eq!(first.size, 16 + 32 + UNIT);

        let b = arena.allocate(16 + 32 + UNIT, DEFAULT_TAG).unwrap();
        assert_eq!(b, a);
        arena.free(b);
        arena.free(c);
        let first = arena.blocks().next().unwrap();
        assert_eq!(first.size, 16 + 32 + 48 + 2 * UNIT);
        // merged block, guard, tail
        assert_eq!(arena.blocks().count(), 3);
    }

    #[test]
    fn middle_free_merges_both_sides() {
        let mut arena = arena(512);
        let a = arena.allocate(8, DEFAULT_TAG).unwrap();
        let b = arena.allocate(8, DEFAULT_TAG).unwrap();
        let c = arena.allocate(8, DEFAULT_TAG).unwrap();
        let _guard = arena.allocate(8, DEFAULT_TAG).unwrap();
        arena.free(a);
        arena.free(c);
        assert_eq!(arena.blocks().count(), 5);
        arena.free(b);
        assert_eq!(arena.blocks().count(), 3);
        assert_eq!(arena.blocks().next().unwrap().size, 3 * 8 + 2 * UNIT);
    }

    #[test]
    fn double_free_and_foreign_refs_are_ignored() {
        let mut arena = arena(256);
        let a = arena.allocate(8, DEFAULT_TAG).unwrap();
        arena.free(a);
        arena.free(a);
        arena.free(BlockRef(3));
        assert_eq!(arena.used_bytes(), Ok(0));
        assert_eq!(arena.blocks().count(), 1);
    }

    #[test]
    fn tags_partition_usage() {
        let mut arena = arena(1024);
        arena.allocate(16, VM_STACK_TAG).unwrap();
        arena.allocate(40, OBJECT_HEAP_TAG).unwrap();
        assert_eq!(arena.used_bytes_by_tag(VM_STACK_TAG), 16);
        assert_eq!(arena.used_bytes_by_tag(OBJECT_HEAP_TAG), 40);
        assert_eq!(arena.used_bytes(), Ok(56));
    }

    #[test]
    fn words_round_trip_inside_block() {
        let mut arena = arena(256);
        let a = arena.allocate(16, DEFAULT_TAG).unwrap();
        assert!(arena.write_u32(a, 12, 0xdead_beef));
        assert_eq!(arena.read_u32(a, 12), Some(0xdead_beef));
        assert!(!arena.write_u32(a, 14, 1));
        assert_eq!(arena.read_u32(a, 16), None);
    }

    #[test]
    fn dispose_detaches_buffer() {
        let mut arena = arena(128);
        let a = arena.allocate(8, DEFAULT_TAG).unwrap();
        let buffer = arena.dispose().unwrap();
        assert_eq!(buffer.len(), 128);
        assert_eq!(arena.allocate(8, DEFAULT_TAG), None);
        arena.free(a);
        assert!(arena.dispose().is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(usize),
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..300).prop_map(Op::Alloc),
            (0usize..32).prop_map(Op::Free),
        ]
    }

    proptest! {
        #[test]
        fn used_bytes_matches_live_blocks(ops in prop::collection::vec(op(), 1..64)) {
            let mut arena = arena(8 * 1024);
            let mut live: Vec<(BlockRef, usize)> = Vec::new();
            for op in ops {
                match op {
                    Op::Alloc(size) => {
                        if let Some(block) = arena.allocate(size, DEFAULT_TAG) {
                            prop_assert!(arena.block_size(block) >= size);
                            live.push((block, size));
                        }
                    }
                    Op::Free(i) => {
                        if !live.is_empty() {
                            let (block, _) = live.remove(i % live.len());
                            arena.free(block);
                        }
                    }
                }
                let expected: usize = live.iter().map(|(b, _)| arena.block_size(*b)).sum();
                prop_assert_eq!(arena.used_bytes().unwrap(), expected);
            }
            let mut spans: Vec<_> = live
                .iter()
                .map(|(b, _)| (b.offset(), b.offset() + arena.block_size(*b)))
                .collect();
            spans.sort();
            for pair in spans.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].0);
            }
            for (block, _) in live {
                arena.free(block);
            }
            prop_assert_eq!(arena.blocks().count(), 1);
        }
    }
}
