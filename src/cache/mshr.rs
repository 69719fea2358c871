use crate::packet::{Command, Packet};
use crate::{address, Tick};
use std::collections::VecDeque;

/// Typed handle into the outstanding-miss table. Replaces the raw
/// `sender_state` pointer of classic designs: a response names its MSHR by
/// index, and the slab never reuses an index while its miss is in flight.
pub type MshrId = usize;

/// Typed handle into the writeback buffer.
pub type WbId = usize;

/// One pending consumer of an in-flight miss.
#[derive(Debug)]
pub enum Target {
    /// A request waiting for the line's data.
    Request(Packet),
    /// Invalidate the line as soon as it arrives; appended when a snoop
    /// collides with an in-service miss.
    Invalidate,
}

/// One outstanding miss: the targets waiting on a line and the bookkeeping
/// for the request sent to memory on their behalf.
#[derive(Debug)]
pub struct Mshr {
    /// Block address of the missing line (exact address if uncacheable).
    pub addr: address,
    pub size: u32,
    pub issued: Tick,
    /// Earliest tick the request may go to memory.
    pub ready: Tick,
    /// A request for this line is on its way to memory.
    pub in_service: bool,
    pub orig_cmd: Command,
    /// Command actually placed on the bus, once rewritten by coherence.
    pub bus_cmd: Option<Command>,
    pub uncacheable: bool,
    /// Frame reserved in the tag store for the fill.
    pub fill: Option<usize>,
    /// Pending consumers, in arrival order. Replies go out in this order.
    pub targets: VecDeque<Target>,
}

impl Mshr {
    /// The packet that caused the allocation; its request rides the bus.
    #[must_use]
    pub fn first_packet(&self) -> Option<&Packet> {
        self.targets.iter().find_map(|t| match t {
            Target::Request(pkt) => Some(pkt),
            Target::Invalidate => None,
        })
    }

    #[must_use]
    pub fn num_request_targets(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| matches!(t, Target::Request(_)))
            .count()
    }

    /// A snoop has already claimed this line; the fill dies on arrival.
    #[must_use]
    pub fn has_deferred_invalidate(&self) -> bool {
        self.targets
            .iter()
            .any(|t| matches!(t, Target::Invalidate))
    }
}

/// One evicted dirty block awaiting transmission.
#[derive(Debug)]
pub struct WritebackEntry {
    pub pkt: Packet,
    pub ready: Tick,
    pub in_service: bool,
}

/// What the cache should put on the bus next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmit {
    Miss(MshrId),
    Writeback(WbId),
}

/// Fixed-capacity tables of outstanding misses and pending writebacks.
///
/// At most one MSHR exists per block address; later requests to the same
/// line coalesce as targets. Misses transmit ahead of writebacks.
#[derive(Debug)]
pub struct MshrQueue {
    name: String,
    misses: Vec<Option<Mshr>>,
    writebacks: Vec<Option<WritebackEntry>>,
    pending_misses: VecDeque<MshrId>,
    pending_writebacks: VecDeque<WbId>,
}

impl MshrQueue {
    #[must_use]
    pub fn new(name: &str, mshr_entries: usize, writeback_entries: usize) -> Self {
        Self {
            name: format!("{name}.mshr"),
            misses: (0..mshr_entries).map(|_| None).collect(),
            writebacks: (0..writeback_entries).map(|_| None).collect(),
            pending_misses: VecDeque::new(),
            pending_writebacks: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn can_alloc(&self) -> bool {
        self.misses.iter().any(Option::is_none)
    }

    #[must_use]
    pub fn can_writeback(&self) -> bool {
        self.writebacks.iter().any(Option::is_none)
    }

    #[must_use]
    pub fn occupancy(&self) -> usize {
        self.misses.iter().filter(|m| m.is_some()).count()
    }

    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.misses.iter().all(Option::is_none) && self.writebacks.iter().all(Option::is_none)
    }

    /// The unique outstanding miss for a block address, if any. Uncacheable
    /// entries never participate: they track exact device accesses, not
    /// lines, and are not coalescable.
    #[must_use]
    pub fn find(&self, block_addr: address) -> Option<MshrId> {
        self.misses
            .iter()
            .position(|m| matches!(m, Some(mshr) if mshr.addr == block_addr && !mshr.uncacheable))
    }

    #[must_use]
    pub fn mshr(&self, id: MshrId) -> &Mshr {
        self.misses[id].as_ref().expect("stale MshrId")
    }

    #[must_use]
    pub fn mshr_mut(&mut self, id: MshrId) -> &mut Mshr {
        self.misses[id].as_mut().expect("stale MshrId")
    }

    /// Track a miss: coalesce onto the existing MSHR for the line or
    /// allocate a new one. The caller has already checked capacity.
    pub fn handle_miss(&mut self, pkt: Packet, block_addr: address, size: u32, ready: Tick) -> MshrId {
        let uncacheable = pkt.req.is_uncacheable();
        if !uncacheable {
            if let Some(id) = self.find(block_addr) {
                log::debug!("{}::coalesce({pkt}) onto mshr {id}", self.name);
                self.mshr_mut(id).targets.push_back(Target::Request(pkt));
                return id;
            }
        }

        let id = self
            .misses
            .iter()
            .position(Option::is_none)
            .expect("MSHR table is full");
        log::debug!("{}::allocate({pkt}) as mshr {id}", self.name);
        let mshr = Mshr {
            addr: block_addr,
            size,
            issued: pkt.req.issued,
            ready,
            in_service: false,
            orig_cmd: pkt.cmd,
            bus_cmd: None,
            uncacheable,
            fill: None,
            targets: VecDeque::from([Target::Request(pkt)]),
        };
        self.misses[id] = Some(mshr);
        self.pending_misses.push_back(id);
        id
    }

    pub fn add_target(&mut self, id: MshrId, target: Target) {
        self.mshr_mut(id).targets.push_back(target);
    }

    /// Queue an evicted dirty block for transmission.
    pub fn do_writeback(&mut self, pkt: Packet, ready: Tick) -> WbId {
        debug_assert_eq!(pkt.cmd, Command::WritebackReq);
        let id = self
            .writebacks
            .iter()
            .position(Option::is_none)
            .expect("writeback buffer is full");
        log::debug!("{}::do_writeback({pkt}) as wb {id}", self.name);
        self.writebacks[id] = Some(WritebackEntry {
            pkt,
            ready,
            in_service: false,
        });
        self.pending_writebacks.push_back(id);
        id
    }

    /// All pending writebacks covering a block address.
    #[must_use]
    pub fn find_writes(&self, block_addr: address) -> Vec<WbId> {
        self.writebacks
            .iter()
            .enumerate()
            .filter_map(|(id, entry)| match entry {
                Some(wb) if wb.pkt.addr == block_addr && !wb.in_service => Some(id),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn writeback(&self, id: WbId) -> &WritebackEntry {
        self.writebacks[id].as_ref().expect("stale WbId")
    }

    /// Hand over a pending writeback entirely; used when a snooping cache
    /// takes ownership of the line before we transmit it.
    #[must_use]
    pub fn take_writeback(&mut self, id: WbId) -> WritebackEntry {
        self.pending_writebacks.retain(|&w| w != id);
        self.writebacks[id].take().expect("stale WbId")
    }

    /// Are we currently trying to own the bus?
    #[must_use]
    pub fn have_pending(&self) -> bool {
        !self.pending_misses.is_empty() || !self.pending_writebacks.is_empty()
    }

    /// Tick at which the next pending transmission becomes ready.
    #[must_use]
    pub fn next_ready_tick(&self) -> Option<Tick> {
        let miss = self.pending_misses.front().map(|&id| self.mshr(id).ready);
        let wb = self
            .pending_writebacks
            .front()
            .map(|&id| self.writeback(id).ready);
        match (miss, wb) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Pick what to transmit next: misses ahead of writebacks.
    #[must_use]
    pub fn next_transmit(&mut self, now: Tick) -> Option<Transmit> {
        if let Some(&id) = self.pending_misses.front() {
            if self.mshr(id).ready <= now {
                self.pending_misses.pop_front();
                return Some(Transmit::Miss(id));
            }
        }
        if let Some(&id) = self.pending_writebacks.front() {
            if self.writeback(id).ready <= now {
                self.pending_writebacks.pop_front();
                return Some(Transmit::Writeback(id));
            }
        }
        None
    }

    /// Record that the bus now carries a request for this entry. Set before
    /// the downstream peer can observe the send in the same tick.
    pub fn mark_in_service(&mut self, transmit: Transmit, bus_cmd: Option<Command>) {
        match transmit {
            Transmit::Miss(id) => {
                let mshr = self.mshr_mut(id);
                mshr.in_service = true;
                mshr.bus_cmd = bus_cmd;
            }
            Transmit::Writeback(id) => {
                self.writebacks[id].as_mut().expect("stale WbId").in_service = true;
            }
        }
    }

    /// A refused send: undo the coherence command rewrite and put the entry
    /// back at the head of its queue.
    pub fn restore_orig_cmd(&mut self, transmit: Transmit) {
        match transmit {
            Transmit::Miss(id) => {
                let mshr = self.mshr_mut(id);
                mshr.in_service = false;
                mshr.bus_cmd = None;
                self.pending_misses.push_front(id);
            }
            Transmit::Writeback(id) => {
                self.writebacks[id].as_mut().expect("stale WbId").in_service = false;
                self.pending_writebacks.push_front(id);
            }
        }
    }

    /// Free an MSHR once all of its targets have been serviced.
    #[must_use]
    pub fn retire(&mut self, id: MshrId) -> Mshr {
        self.pending_misses.retain(|&m| m != id);
        self.misses[id].take().expect("stale MshrId")
    }

    /// Free a writeback entry after its packet left on the bus.
    pub fn retire_writeback(&mut self, id: WbId) {
        self.writebacks[id] = None;
    }

    pub fn iter_mshrs(&self) -> impl Iterator<Item = &Mshr> {
        self.misses.iter().flatten()
    }

    pub fn iter_writebacks(&self) -> impl Iterator<Item = &WritebackEntry> {
        self.writebacks.iter().flatten()
    }

    /// Every in-flight packet a functional probe must reconcile with.
    pub fn inflight_packets_mut(&mut self) -> impl Iterator<Item = &mut Packet> {
        let targets = self
            .misses
            .iter_mut()
            .flatten()
            .flat_map(|m| m.targets.iter_mut())
            .filter_map(|t| match t {
                Target::Request(pkt) => Some(pkt),
                Target::Invalidate => None,
            });
        let writebacks = self
            .writebacks
            .iter_mut()
            .flatten()
            .map(|wb| &mut wb.pkt);
        targets.chain(writebacks)
    }
}

#[cfg(test)]
mod tests {
    use super::{MshrQueue, Target, Transmit};
    use crate::packet::Command;
    use crate::testing;

    #[test]
    fn test_one_mshr_per_block_addr() {
        let mut queue = MshrQueue::new("l1d", 4, 2);
        let a = queue.handle_miss(testing::read_pkt(0x1000, 4), 0x1000, 64, 10);
        let b = queue.handle_miss(testing::read_pkt(0x1008, 8), 0x1000, 64, 11);
        assert_eq!(a, b);
        assert_eq!(queue.occupancy(), 1);
        assert_eq!(queue.mshr(a).num_request_targets(), 2);

        let c = queue.handle_miss(testing::read_pkt(0x2000, 4), 0x2000, 64, 12);
        assert_ne!(a, c);
        assert_eq!(queue.occupancy(), 2);
    }

    #[test]
    fn test_targets_stay_in_arrival_order() {
        let mut queue = MshrQueue::new("l1d", 4, 2);
        let id = queue.handle_miss(testing::read_pkt(0x1000, 4), 0x1000, 64, 10);
        queue.add_target(id, Target::Request(testing::read_pkt(0x1010, 4)));
        queue.add_target(id, Target::Invalidate);

        let addrs: Vec<Option<u64>> = queue
            .mshr(id)
            .targets
            .iter()
            .map(|t| match t {
                Target::Request(pkt) => Some(pkt.addr),
                Target::Invalidate => None,
            })
            .collect();
        assert_eq!(addrs, vec![Some(0x1000), Some(0x1010), None]);
    }

    #[test]
    fn test_misses_transmit_before_writebacks() {
        let mut queue = MshrQueue::new("l1d", 4, 2);
        let mut wb = testing::write_pkt(0x3000, 64, &[0xab; 64]);
        wb.cmd = Command::WritebackReq;
        queue.do_writeback(wb, 5);
        let id = queue.handle_miss(testing::read_pkt(0x1000, 4), 0x1000, 64, 5);

        assert_eq!(queue.next_transmit(10), Some(Transmit::Miss(id)));
        assert_eq!(queue.next_transmit(10), Some(Transmit::Writeback(0)));
        assert_eq!(queue.next_transmit(10), None);
    }

    #[test]
    fn test_restore_after_refused_send() {
        let mut queue = MshrQueue::new("l1d", 4, 2);
        let id = queue.handle_miss(testing::read_pkt(0x1000, 4), 0x1000, 64, 0);

        let transmit = queue.next_transmit(0).unwrap();
        queue.mark_in_service(transmit, Some(Command::ReadReq));
        assert!(queue.mshr(id).in_service);
        assert_eq!(queue.mshr(id).bus_cmd, Some(Command::ReadReq));

        queue.restore_orig_cmd(transmit);
        assert!(!queue.mshr(id).in_service);
        assert_eq!(queue.mshr(id).bus_cmd, None);
        // entry is transmittable again
        assert_eq!(queue.next_transmit(0), Some(Transmit::Miss(id)));
    }

    #[test]
    fn test_in_service_mshr_not_freed_until_response() {
        let mut queue = MshrQueue::new("l1d", 2, 2);
        let id = queue.handle_miss(testing::read_pkt(0x1000, 4), 0x1000, 64, 0);
        let transmit = queue.next_transmit(0).unwrap();
        queue.mark_in_service(transmit, Some(Command::ReadReq));

        assert!(!queue.have_pending());
        assert_eq!(queue.find(0x1000), Some(id));
        let retired = queue.retire(id);
        assert_eq!(retired.num_request_targets(), 1);
        assert!(queue.is_quiescent());
    }
}
