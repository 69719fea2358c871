use crate::sync::atomic;
use crate::{address, MasterId, Tick};

bitflags::bitflags! {
    /// Access attributes carried by a request for its whole lifetime.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u32 {
        /// Bypass all caches.
        const UNCACHEABLE = 1 << 0;
        /// Load-locked / store-conditional access.
        const LOCKED = 1 << 1;
        /// Speculative fill issued by a prefetcher.
        const PREFETCH = 1 << 2;
        /// Instruction fetch.
        const INSTRUCTION = 1 << 3;
    }
}

/// One memory request as issued by a master.
///
/// A request is immutable once it has been handed to a [`Packet`]; the only
/// later mutation is the store-conditional result, which translation and the
/// cache record through an interior cell.
///
/// [`Packet`]: crate::packet::Packet
#[derive(Debug)]
pub struct Request {
    /// Virtual address of the access.
    pub vaddr: address,
    /// Physical address, filled in by translation.
    pub paddr: address,
    /// Size of the access in bytes.
    pub size: u32,
    pub flags: Flags,
    /// Program counter of the issuing instruction.
    pub pc: address,
    /// Issuing master, for statistics attribution.
    pub master: MasterId,
    /// Issuing hardware thread.
    pub thread: usize,
    /// Tick at which the request was created.
    pub issued: Tick,

    // -1 = unset, 0 = failed, 1 = succeeded
    sc_result: atomic::AtomicI8,
}

#[derive(Debug, Clone)]
pub struct Builder {
    pub vaddr: address,
    pub size: u32,
    pub flags: Flags,
    pub pc: address,
    pub master: MasterId,
    pub thread: usize,
    pub issued: Tick,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            vaddr: 0,
            size: 0,
            flags: Flags::empty(),
            pc: 0,
            master: 0,
            thread: 0,
            issued: 0,
        }
    }
}

impl Builder {
    #[must_use]
    pub fn build(self) -> Request {
        Request {
            vaddr: self.vaddr,
            // identity mapping until translation overrides it
            paddr: self.vaddr,
            size: self.size,
            flags: self.flags,
            pc: self.pc,
            master: self.master,
            thread: self.thread,
            issued: self.issued,
            sc_result: atomic::AtomicI8::new(-1),
        }
    }
}

impl Request {
    #[must_use]
    pub fn is_uncacheable(&self) -> bool {
        self.flags.contains(Flags::UNCACHEABLE)
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.flags.contains(Flags::LOCKED)
    }

    #[must_use]
    pub fn is_prefetch(&self) -> bool {
        self.flags.contains(Flags::PREFETCH)
    }

    #[must_use]
    pub fn is_instruction(&self) -> bool {
        self.flags.contains(Flags::INSTRUCTION)
    }

    pub fn set_sc_result(&self, success: bool) {
        self.sc_result
            .store(i8::from(success), atomic::Ordering::Relaxed);
    }

    /// Result of a store-conditional, once decided.
    #[must_use]
    pub fn sc_result(&self) -> Option<bool> {
        match self.sc_result.load(atomic::Ordering::Relaxed) {
            -1 => None,
            0 => Some(false),
            _ => Some(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Builder, Flags};

    #[test]
    fn test_sc_result_cell() {
        let req = Builder {
            vaddr: 0x2000,
            size: 8,
            flags: Flags::LOCKED,
            ..Builder::default()
        }
        .build();
        assert!(req.is_locked());
        assert_eq!(req.sc_result(), None);
        req.set_sc_result(true);
        assert_eq!(req.sc_result(), Some(true));
    }
}
