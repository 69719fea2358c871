use crate::{address, MasterId, Tick};

bitflags::bitflags! {
    /// Coherence and bookkeeping state of one cache block.
    ///
    /// Protocol states are encodings of these bits: `VALID | READABLE` is a
    /// shared copy, adding `WRITABLE` makes it exclusive, adding `DIRTY`
    /// modified. The empty set is invalid.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u8 {
        const VALID = 1 << 0;
        const WRITABLE = 1 << 1;
        const READABLE = 1 << 2;
        const DIRTY = 1 << 3;
        /// Installed by a prefetch and not yet demand-referenced.
        const PREFETCHED = 1 << 4;
    }
}

/// One block frame in the tag store.
///
/// Allocated by a fill, mutated by accesses and snoops, destroyed only by
/// replacement; the frame itself persists across packet boundaries.
#[derive(Debug, Clone)]
pub struct CacheBlk {
    /// Tag of the cached line. Identical to the block address, which keeps
    /// hit checks valid under set index functions that alias sets.
    pub tag: address,
    /// Aligned address of the cached line.
    pub addr: address,
    pub set: usize,
    pub way: usize,
    pub status: Status,
    /// Tick of the last reference, for replacement.
    pub last_ref: Tick,
    /// Tick at which the current line was installed.
    pub alloc_tick: Tick,
    /// Master that installed the line, for statistics.
    pub src_master: MasterId,
    pub data: Vec<u8>,
}

impl std::fmt::Display for CacheBlk {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "blk[{}.{}]@{:#x}({:?})",
            self.set, self.way, self.addr, self.status
        )
    }
}

impl CacheBlk {
    #[must_use]
    pub fn new(set: usize, way: usize, block_size: u32) -> Self {
        Self {
            tag: 0,
            addr: 0,
            set,
            way,
            status: Status::empty(),
            last_ref: 0,
            alloc_tick: 0,
            src_master: 0,
            data: vec![0; block_size as usize],
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status.contains(Status::VALID)
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.status.contains(Status::WRITABLE)
    }

    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.status.contains(Status::READABLE)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.status.contains(Status::DIRTY)
    }

    /// Unconditional demotion to invalid. Data is left in place; an invalid
    /// frame's contents are never observable.
    pub fn invalidate(&mut self) {
        self.status = Status::empty();
    }
}
