pub mod block;
pub mod coherence;
pub mod mshr;
pub mod prefetch;
pub mod tags;

pub use block::{CacheBlk, Status};
pub use coherence::CoherenceProtocol;
pub use mshr::{Mshr, MshrId, MshrQueue, Target, Transmit, WbId};
pub use prefetch::{Prefetcher, TaggedPrefetcher};
pub use tags::TagStore;

use crate::config::CacheParams;
use crate::engine::{Event, EventQueue, Tick};
use crate::packet::{self, Command, Flags, Packet, PacketResult};
use crate::port::{Device, Port, Side};
use crate::request;
use crate::stats::CacheStats;
use crate::sync::{Arc, Mutex, Weak};
use crate::{address, MasterId};
use bitvec::bitvec;
use console::style;

/// The cache controller: tag store, MSHR queue, coherence driver and
/// prefetcher behind a CPU-side and a memory-side port.
///
/// The controller never returns an error from its state machine: a packet
/// is resolved, a later resolution is scheduled, or the simulation panics.
pub struct Cache {
    name: String,
    params: CacheParams,
    scheduler: Arc<EventQueue>,
    pub cpu_side: Port,
    pub mem_side: Port,
    tags: TagStore,
    missq: MshrQueue,
    coherence: Box<dyn CoherenceProtocol>,
    prefetcher: Option<Box<dyn Prefetcher>>,
    pub stats: CacheStats,
    master: MasterId,
    /// The CPU-side sender was refused and waits for a retry.
    retry_pending: bool,
    /// A SendMiss event is already queued.
    send_scheduled: bool,
    self_ref: Weak<Mutex<Cache>>,
}

impl Cache {
    pub fn new(
        params: CacheParams,
        scheduler: Arc<EventQueue>,
        master: MasterId,
    ) -> Arc<Mutex<Cache>> {
        assert!(params.block_size.is_power_of_two());
        assert!(params.n_sets.is_power_of_two());
        let name = params.name.clone();
        let prefetcher = params.prefetch.map(|pf| {
            Box::new(TaggedPrefetcher::new(&name, params.block_size, pf)) as Box<dyn Prefetcher>
        });
        Arc::new_cyclic(|weak: &Weak<Mutex<Cache>>| {
            Mutex::new(Self {
                cpu_side: Port::new(format!("{name}.cpu_side")),
                mem_side: Port::new(format!("{name}.mem_side")),
                tags: TagStore::new(params.clone(), master),
                missq: MshrQueue::new(&name, params.mshr_entries, params.writeback_entries),
                coherence: coherence::build(params.protocol),
                prefetcher,
                stats: CacheStats::new(&name, params.mshr_entries),
                master,
                retry_pending: false,
                send_scheduled: false,
                self_ref: weak.clone(),
                scheduler,
                params,
                name,
            })
        })
    }

    fn arc(&self) -> Arc<Mutex<Cache>> {
        self.self_ref.upgrade().expect("cache was dropped")
    }

    fn now(&self) -> Tick {
        self.scheduler.current_tick()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn params(&self) -> &CacheParams {
        &self.params
    }

    #[must_use]
    pub fn tag_store(&self) -> &TagStore {
        &self.tags
    }

    #[must_use]
    pub fn miss_queue(&self) -> &MshrQueue {
        &self.missq
    }

    /// No in-flight misses, writebacks or queued sends.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.missq.is_quiescent() && !self.send_scheduled
    }

    /// Preinstall a line, for tests and checkpoint restore.
    pub fn warm(&mut self, addr: address, status: Status, data: &[u8], last_ref: Tick) {
        self.tags.install_raw(addr, status, data, last_ref);
    }

    pub fn invalidate_blk(&mut self, addr: address) {
        self.tags.invalidate_blk(addr);
    }

    // ---- reply scheduling -------------------------------------------------

    /// Turn a serviced request into its response and schedule delivery
    /// toward the CPU side.
    fn respond(&mut self, mut pkt: Packet, when: Tick) {
        pkt.flags.insert(Flags::SATISFIED);
        pkt.make_response();
        pkt.time = when;
        let dst = self.cpu_side.peer().clone();
        self.scheduler.schedule(Event::Deliver { dst, pkt }, when);
    }

    fn respond_error(&mut self, mut pkt: Packet, when: Tick, result: PacketResult) {
        pkt.flags.insert(Flags::SATISFIED);
        pkt.make_response();
        pkt.result = result;
        pkt.time = when;
        let dst = self.cpu_side.peer().clone();
        self.scheduler.schedule(Event::Deliver { dst, pkt }, when);
    }

    /// Give a snoop packet back to the bus, flags telling it what happened.
    fn respond_to_snoop(&mut self, mut pkt: Packet, when: Tick) {
        pkt.time = when;
        let dst = self.mem_side.peer().clone();
        self.scheduler.schedule(Event::Deliver { dst, pkt }, when);
    }

    // ---- CPU-side timing path ---------------------------------------------

    /// Whether the miss this packet would take can be tracked right now.
    /// Checked before any state moves so a refusal has no side effects.
    fn can_accept(&self, pkt: &Packet) -> bool {
        if pkt.req.is_uncacheable() {
            return self.missq.can_alloc();
        }
        let block_addr = self.params.block_addr(pkt.addr);
        match self.tags.probe(pkt.addr, pkt.is_write()) {
            tags::Probe::Hit(_) => true,
            tags::Probe::Miss { dirty_victim, .. } => {
                if dirty_victim && !self.missq.can_writeback() {
                    return false;
                }
                if self.is_fast_write(pkt)
                    && (pkt.cmd == Command::WriteInvalidateReq
                        || self.missq.find(block_addr).is_none())
                {
                    // installs locally, no miss tracking needed
                    return true;
                }
                match self.missq.find(block_addr) {
                    Some(id) => {
                        let mshr = self.missq.mshr(id);
                        // the line is already promised to another cache;
                        // nothing may queue behind the deferred invalidate
                        if mshr.has_deferred_invalidate() {
                            return false;
                        }
                        // a write cannot ride a plain read fill under a real
                        // protocol; hold it until the read resolves
                        if pkt.is_write()
                            && self.coherence.has_protocol()
                            && !mshr.orig_cmd.is_write()
                            && !mshr.orig_cmd.is_invalidate()
                        {
                            return false;
                        }
                        mshr.num_request_targets() < self.params.mshr_max_targets
                    }
                    None => self.missq.can_alloc(),
                }
            }
        }
    }

    fn is_fast_write(&self, pkt: &Packet) -> bool {
        pkt.size >= self.params.block_size
            && self.coherence.allow_fast_writes()
            && matches!(pkt.cmd, Command::WriteReq | Command::WriteInvalidateReq)
    }

    /// The CPU-side request path: tag access, fast write-allocate window,
    /// writeback drain, then reply or miss tracking.
    pub fn access(&mut self, mut pkt: Packet) -> Result<(), Packet> {
        let now = self.now();

        // store-conditionals are recorded as succeeding here; a failure has
        // already been decided upstream
        if pkt.is_write() && pkt.req.is_locked() {
            pkt.req.set_sc_result(true);
        }

        if !self.can_accept(&pkt) {
            log::debug!("{}::access({pkt}): blocked, sender must retry", self.name);
            self.retry_pending = true;
            return Err(pkt);
        }

        let observe_stream = self
            .params
            .prefetch
            .map_or(false, |pf| pf.on_access);
        let mut pf_lines = if observe_stream {
            self.observe_prefetcher(&pkt)
        } else {
            Vec::new()
        };

        let uncacheable = pkt.req.is_uncacheable();
        let mut writebacks = Vec::new();
        let (mut blk, fill, lat) = if uncacheable {
            (None, None, self.params.hit_latency)
        } else {
            let access = self.tags.handle_access(&mut pkt, true, now);
            writebacks = access.writebacks;
            (access.blk, access.fill, access.latency)
        };

        // full-block write miss: install the line without fetching it when
        // the protocol permits (WH64)
        if blk.is_none() && !uncacheable && self.is_fast_write(&pkt) {
            let block_addr = self.params.block_addr(pkt.addr);
            let outstanding = self.missq.find(block_addr);
            if pkt.cmd == Command::WriteInvalidateReq || outstanding.is_none() {
                if outstanding.is_some() {
                    log::warn!(
                        "{}: write-invalidate fast allocate with an outstanding miss to {block_addr:#x}",
                        self.name
                    );
                }
                let state = Status::VALID | Status::WRITABLE | Status::READABLE;
                let idx = self.tags.handle_fill(fill, &pkt, state, now, &mut writebacks);
                self.stats.fast_writes += 1;
                blk = Some(idx);
            }
        }

        self.drain_writebacks(writebacks, now);

        log::debug!(
            "{}::access({pkt}) {} blk_addr={:#x}",
            self.name,
            if blk.is_some() {
                style("hit").green()
            } else {
                style("miss").red()
            },
            self.params.block_addr(pkt.addr),
        );

        if let Some(_idx) = blk {
            self.stats.inc_hit(pkt.cmd, pkt.req.master);
            if pkt.needs_response() {
                self.respond(pkt, now + lat);
            } else if pkt.cmd == Command::WritebackReq {
                // absorbed here; the packet is consumed
                pkt.flags.insert(Flags::SATISFIED);
            }
        } else {
            if !uncacheable {
                self.stats.inc_miss(pkt.cmd, pkt.req.master);
                if !observe_stream {
                    pf_lines = self.observe_prefetcher(&pkt);
                }
            }
            if pkt.is_satisfied() {
                // a store-conditional that failed after missing completely
                if pkt.needs_response() {
                    self.respond(pkt, now + lat);
                }
            } else {
                self.handle_miss(pkt, fill, now + lat);
            }
        }

        for line in pf_lines {
            self.issue_prefetch(line, now);
        }
        Ok(())
    }

    fn observe_prefetcher(&mut self, pkt: &Packet) -> Vec<address> {
        match self.prefetcher.as_mut() {
            Some(pf) => pf.observe(pkt),
            None => Vec::new(),
        }
    }

    /// Create or coalesce the MSHR tracking this miss.
    fn handle_miss(&mut self, pkt: Packet, fill: Option<usize>, ready: Tick) {
        let uncacheable = pkt.req.is_uncacheable();
        let (block_addr, size) = if uncacheable {
            (pkt.addr, pkt.size)
        } else {
            (self.params.block_addr(pkt.addr), self.params.block_size)
        };
        let coalesced = !uncacheable && self.missq.find(block_addr).is_some();
        let id = self.missq.handle_miss(pkt, block_addr, size, ready);
        if !coalesced {
            self.missq.mshr_mut(id).fill = fill;
            self.stats.sample_mshr_occupancy(self.missq.occupancy());
            self.schedule_send(ready);
        }
    }

    fn drain_writebacks(&mut self, writebacks: Vec<Packet>, now: Tick) {
        if writebacks.is_empty() {
            return;
        }
        for wb in writebacks {
            self.stats.writebacks += 1;
            self.missq.do_writeback(wb, now);
        }
        self.schedule_send(now);
    }

    fn issue_prefetch(&mut self, line: address, now: Tick) {
        if self.tags.lookup(line).is_some() || self.missq.find(line).is_some() {
            return;
        }
        if !self.missq.can_alloc() {
            return;
        }
        if let tags::Probe::Miss {
            dirty_victim: true, ..
        } = self.tags.probe(line, false)
        {
            if !self.missq.can_writeback() {
                // not worth evicting anything for a speculative line
                return;
            }
        }
        let req = Arc::new(
            request::Builder {
                vaddr: line,
                size: self.params.block_size,
                flags: request::Flags::PREFETCH,
                master: self.master,
                issued: now,
                ..request::Builder::default()
            }
            .build(),
        );
        let mut pkt = Packet::new(req, Command::HardPFReq);
        let access = self.tags.handle_access(&mut pkt, true, now);
        log::debug!("{}::issue_prefetch({line:#x})", self.name);
        self.drain_writebacks(access.writebacks, now);
        self.handle_miss(pkt, access.fill, now + self.params.hit_latency);
    }

    // ---- memory-side transmission -----------------------------------------

    fn schedule_send(&mut self, when: Tick) {
        if self.send_scheduled {
            return;
        }
        self.send_scheduled = true;
        let cache = self.arc();
        self.scheduler
            .schedule(Event::SendMiss { cache }, when.max(self.now()));
    }

    /// Move the next pending miss or writeback onto the memory-side port.
    ///
    /// The entry is marked in service before the peer can observe the send;
    /// a refusal restores the original command and queue position, and the
    /// peer's retry resumes from here.
    pub(crate) fn transmit(&mut self) {
        self.send_scheduled = false;
        let now = self.now();
        let Some(transmit) = self.missq.next_transmit(now) else {
            if let Some(ready) = self.missq.next_ready_tick() {
                self.schedule_send(ready);
            }
            return;
        };

        let pkt = match transmit {
            Transmit::Miss(id) => self.bus_packet(id, now),
            Transmit::Writeback(id) => self.writeback_bus_packet(id, now),
        };
        let bus_cmd = Some(pkt.cmd);
        self.missq.mark_in_service(transmit, bus_cmd);

        log::debug!("{}::transmit({pkt})", self.name);
        match self.mem_side.send_timing(pkt) {
            Ok(()) => match transmit {
                Transmit::Writeback(id) => {
                    // nothing comes back for a writeback; release the slot
                    self.missq.retire_writeback(id);
                    self.maybe_unblock();
                }
                Transmit::Miss(id) => {
                    // an entry whose bus command gets no response is done
                    // the moment it leaves
                    if !bus_cmd.map_or(false, Command::needs_response) {
                        let _ = self.missq.retire(id);
                        self.maybe_unblock();
                    }
                }
            },
            Err(_refused) => {
                log::debug!("{}: mem side blocked, holding transmission", self.name);
                self.missq.restore_orig_cmd(transmit);
                return;
            }
        }

        if let Some(ready) = self.missq.next_ready_tick() {
            self.schedule_send(ready);
        }
    }

    /// Build the packet that rides the bus for an MSHR. Distinct identity
    /// from the targets; carries the MSHR id as its sender state.
    fn bus_packet(&mut self, id: MshrId, now: Tick) -> Packet {
        let mshr = self.missq.mshr(id);
        let first = mshr.first_packet().expect("mshr holds no request target");
        let req = Arc::clone(&first.req);
        let orig_cmd = mshr.orig_cmd;
        let mshr_addr = mshr.addr;
        let mshr_size = mshr.size;

        if mshr.uncacheable {
            let mut pkt = Packet::new(req, orig_cmd);
            pkt.addr = mshr_addr;
            pkt.size = mshr_size;
            if pkt.is_write() {
                pkt.set_data(first.data());
            }
            pkt.flags.insert(Flags::NO_ALLOCATE);
            pkt.sender_state = Some(id);
            pkt.time = now;
            return pkt;
        }

        if orig_cmd == Command::HardPFReq {
            self.stats.inc_miss(Command::HardPFReq, req.master);
        }
        let status = self
            .tags
            .lookup(mshr_addr)
            .map_or(Status::empty(), |b| b.status);
        let cmd = self.coherence.bus_cmd(orig_cmd, status);
        let mut pkt = Packet::new(req, cmd).with_block(mshr_addr, self.params.block_size);
        if cmd.is_read() {
            pkt.allocate();
            pkt.flags.insert(Flags::CACHE_LINE_FILL);
        }
        pkt.sender_state = Some(id);
        pkt.time = now;
        pkt
    }

    fn writeback_bus_packet(&self, id: WbId, now: Tick) -> Packet {
        let entry = self.missq.writeback(id);
        let req = Arc::clone(&entry.pkt.req);
        let mut pkt = Packet::new(req, Command::WritebackReq);
        pkt.addr = entry.pkt.addr;
        pkt.size = entry.pkt.size;
        pkt.set_data(entry.pkt.data());
        pkt.time = now;
        pkt
    }

    fn maybe_unblock(&mut self) {
        if !self.retry_pending {
            return;
        }
        if self.missq.can_alloc() && self.missq.can_writeback() {
            self.retry_pending = false;
            let dst = self.cpu_side.peer().clone();
            self.scheduler.schedule(Event::Retry { dst }, self.now());
        }
    }

    // ---- responses from the memory side -----------------------------------

    /// A fill or acknowledgement came back for an outstanding miss.
    pub fn handle_response(&mut self, mut pkt: Packet) {
        let now = self.now();
        let Some(id) = pkt.sender_state else {
            panic!("{}: response {pkt} without an owning miss", self.name);
        };

        if pkt.result == PacketResult::Nacked {
            log::warn!(
                "{}: NACKs from devices not connected to the same bus are not supported",
                self.name
            );
            return;
        }
        let bad_address = pkt.result == PacketResult::BadAddress;

        let mshr_addr = self.missq.mshr(id).addr;
        let orig_cmd = self.missq.mshr(id).orig_cmd;
        log::debug!(
            "{}::handle_response({pkt}) blk_addr={mshr_addr:#x} orig={orig_cmd:?}",
            self.name
        );

        let mut filled: Option<usize> = None;
        if !bad_address {
            if pkt.cmd == Command::UpgradeResp {
                // a successful upgrade applies the new state and carries the
                // current block contents back up
                if let Some(idx) = self.tags.lookup_idx(mshr_addr) {
                    let old = self.tags.blk(idx).status;
                    let new_state = self.coherence.new_state(&pkt, old);
                    self.tags.blk_mut(idx).status = new_state;
                    pkt.addr = mshr_addr;
                    pkt.size = self.params.block_size;
                    self.tags.copy_to_packet(idx, &mut pkt);
                    filled = Some(idx);
                } else {
                    log::warn!(
                        "{}: upgrade response for {mshr_addr:#x} but the line is gone",
                        self.name
                    );
                }
            } else if pkt.is_cache_fill() && !pkt.is_no_allocate() {
                let old = self
                    .tags
                    .lookup(mshr_addr)
                    .map_or(Status::empty(), |b| b.status);
                let new_state = self.coherence.new_state(&pkt, old);
                if old != new_state {
                    log::debug!(
                        "{}: block {mshr_addr:#x} moving from {old:?} to {new_state:?}",
                        self.name
                    );
                }
                let fill = self.missq.mshr(id).fill;
                let mut writebacks = Vec::new();
                let idx = self
                    .tags
                    .handle_fill(fill, &pkt, new_state, now, &mut writebacks);
                self.drain_writebacks(writebacks, now);
                filled = Some(idx);
            }
        }

        // service the targets in arrival order
        let mut mshr = self.missq.retire(id);
        let lat = self.params.hit_latency;
        while let Some(target) = mshr.targets.pop_front() {
            match target {
                Target::Request(mut tpkt) => {
                    if bad_address {
                        if tpkt.needs_response() {
                            self.respond_error(tpkt, now + lat, PacketResult::BadAddress);
                        }
                        continue;
                    }
                    match filled {
                        Some(idx) => {
                            if tpkt.is_write() {
                                self.tags.apply_write(idx, &tpkt, now);
                            } else if tpkt.is_read() {
                                self.tags.copy_to_packet(idx, &mut tpkt);
                            }
                        }
                        None => {
                            if tpkt.is_read() && pkt.has_data() {
                                // uncacheable or no-allocate: serve straight
                                // from the response payload
                                if let Some((to, from, len)) = packet::overlap(&tpkt, &pkt) {
                                    let bytes = pkt.data()[from..from + len].to_vec();
                                    tpkt.data_mut()[to..to + len].copy_from_slice(&bytes);
                                }
                            } else if tpkt.is_write() && !mshr.uncacheable {
                                // the line died before this write could land;
                                // push it home so the acknowledgement below
                                // stays truthful
                                log::warn!(
                                    "{}: write target {tpkt} lost its line, forwarding functionally",
                                    self.name
                                );
                                self.mem_side.send_functional(&mut tpkt);
                            }
                        }
                    }
                    if tpkt.needs_response() {
                        self.respond(tpkt, now + lat);
                    }
                }
                Target::Invalidate => {
                    // a snoop asked for the line while it was in flight; any
                    // dirty bytes applied by earlier targets leave as a
                    // writeback before the line dies
                    if let Some(mut wb) = self.tags.flush_blk(mshr.addr, now) {
                        if self.missq.can_writeback() {
                            self.drain_writebacks(vec![wb], now);
                        } else {
                            log::warn!(
                                "{}: writeback buffer full, pushing {wb} home functionally",
                                self.name
                            );
                            self.mem_side.send_functional(&mut wb);
                        }
                    }
                    filled = None;
                }
            }
        }

        self.maybe_unblock();
        if let Some(ready) = self.missq.next_ready_tick() {
            self.schedule_send(ready);
        }
    }

    // ---- snoops ------------------------------------------------------------

    /// A coherence probe from another cache or bus agent.
    pub fn snoop(&mut self, mut pkt: Packet) {
        let now = self.now();
        if pkt.req.is_uncacheable() {
            // cannot hit an uncacheable address
            self.respond_to_snoop(pkt, now);
            return;
        }

        self.coherence.propagate_invalidate(&pkt, true);

        let block_addr = self.params.block_addr(pkt.addr);
        let mshr_id = self.missq.find(block_addr);

        if self.coherence.has_protocol() || pkt.is_invalidate() {
            if let Some(id) = mshr_id {
                if self.missq.mshr(id).in_service {
                    let mshr = self.missq.mshr(id);
                    let outstanding = mshr.bus_cmd.unwrap_or(mshr.orig_cmd);
                    let fetching_data = outstanding.is_read();
                    if (outstanding.is_invalidate() || !fetching_data)
                        && !matches!(
                            pkt.cmd,
                            Command::InvalidateReq | Command::WriteInvalidateReq
                        )
                    {
                        // our invalidate/upgrade is already on the bus: ack
                        // the snoop and NACK the line until the data arrives
                        assert!(!pkt.is_satisfied());
                        pkt.flags.insert(Flags::SATISFIED | Flags::NACKED_LINE);
                        self.respond_to_snoop(pkt, now);
                        return;
                    }
                    // someone else will supply the line; self-invalidate as
                    // soon as our fill arrives
                    log::debug!(
                        "{}: appending invalidate to blk_addr {block_addr:#x}",
                        self.name
                    );
                    self.missq.add_target(id, Target::Invalidate);
                    self.respond_to_snoop(pkt, now);
                    return;
                }
            }

            // a pending writeback may hold the only copy
            for wbid in self.missq.find_writes(block_addr) {
                if self.missq.writeback(wbid).pkt.req.is_uncacheable() {
                    continue;
                }
                log::debug!(
                    "{}: snoop hit in writeback to blk_addr {block_addr:#x}",
                    self.name
                );
                if pkt.is_read() {
                    let wb = self.missq.writeback(wbid);
                    let offset = self.params.block_offset(pkt.addr);
                    let bytes = wb.pkt.data()[offset..offset + pkt.size as usize].to_vec();
                    pkt.set_data(&bytes);
                    pkt.flags.insert(Flags::SATISFIED | Flags::SHARED_LINE);
                    if pkt.is_invalidate() {
                        // the snooper takes ownership of the dirty line
                        let _ = self.missq.take_writeback(wbid);
                    }
                    self.respond_to_snoop(pkt, now + self.params.hit_latency);
                    return;
                }
                if pkt.is_invalidate() {
                    let _ = self.missq.take_writeback(wbid);
                    self.respond_to_snoop(pkt, now);
                    return;
                }
                break;
            }
        }

        let blk_idx = self.tags.lookup_idx(block_addr);
        let blk = blk_idx.map(|idx| self.tags.blk(idx));
        let mshr = mshr_id.map(|id| self.missq.mshr(id));
        let (satisfy, new_state) = self.coherence.handle_bus_request(&mut pkt, blk, mshr);
        if satisfy {
            let idx = blk_idx.expect("supplying a snoop without a block");
            log::debug!(
                "{}: snooped a {:?} for {block_addr:#x}, supplying data, new state {new_state:?}",
                self.name,
                pkt.cmd
            );
            self.tags.handle_snoop(idx, new_state, Some(&mut pkt));
            pkt.flags.insert(Flags::SATISFIED);
            self.respond_to_snoop(pkt, now + self.params.hit_latency);
            return;
        }
        if let Some(idx) = blk_idx {
            log::debug!(
                "{}: snooped a {:?} for {block_addr:#x}, new state {new_state:?}",
                self.name,
                pkt.cmd
            );
            self.tags.handle_snoop(idx, new_state, None);
        }
        self.respond_to_snoop(pkt, now);
    }

    /// Atomic-mode snoop.
    fn snoop_probe(&mut self, pkt: &mut Packet) -> Tick {
        self.coherence.propagate_invalidate(pkt, false);
        let block_addr = self.params.block_addr(pkt.addr);
        let blk_idx = self.tags.lookup_idx(block_addr);
        let blk = blk_idx.map(|idx| self.tags.blk(idx));
        let mshr = self.missq.find(block_addr).map(|id| self.missq.mshr(id));
        let (satisfy, new_state) = self.coherence.handle_bus_request(pkt, blk, mshr);
        if satisfy {
            let idx = blk_idx.expect("supplying a snoop without a block");
            self.tags.handle_snoop(idx, new_state, Some(pkt));
            pkt.flags.insert(Flags::SATISFIED);
            return self.params.hit_latency;
        }
        if let Some(idx) = blk_idx {
            self.tags.handle_snoop(idx, new_state, None);
        }
        0
    }

    // ---- atomic and functional --------------------------------------------

    /// Atomic (`update`) or functional (`!update`) access. Same logical
    /// effects as the timing path, with the memory side serviced
    /// synchronously; no MSHR is used.
    pub fn probe(&mut self, pkt: &mut Packet, update: bool, toward_mem: bool) -> Tick {
        let now = self.now();

        if update && pkt.is_write() && pkt.req.is_locked() {
            pkt.req.set_sc_result(true);
        }

        if !pkt.req.is_uncacheable() && pkt.is_invalidate() && !pkt.is_read() && !pkt.is_write() {
            // upgrade or invalidate: satisfy locally, nothing to forward
            pkt.flags.insert(Flags::SATISFIED);
            return 0;
        }

        if !update {
            self.probe_functional(pkt, toward_mem);
            return 0;
        }

        let mut writebacks = Vec::new();
        let access = self.tags.handle_access(pkt, true, now);
        writebacks.extend(access.writebacks);

        if access.blk.is_none() && !pkt.is_satisfied() {
            let block_addr = self.params.block_addr(pkt.addr);
            if self.missq.find(block_addr).is_some()
                || !self.missq.find_writes(block_addr).is_empty()
            {
                panic!("atomic access ran into outstanding MSHRs or writebacks");
            }
            if pkt.req.is_uncacheable() {
                self.stats.inc_miss(pkt.cmd, pkt.req.master);
                return self.mem_side.send_atomic(pkt);
            }

            self.stats.inc_miss(pkt.cmd, pkt.req.master);
            let status = self
                .tags
                .lookup(block_addr)
                .map_or(Status::empty(), |b| b.status);
            let cmd = self.coherence.bus_cmd(pkt.cmd, status);
            let mut bus_pkt =
                Packet::new(Arc::clone(&pkt.req), cmd).with_block(block_addr, self.params.block_size);
            if cmd.is_read() {
                bus_pkt.allocate();
                bus_pkt.flags.insert(Flags::CACHE_LINE_FILL);
            }
            bus_pkt.time = now;
            log::debug!("{}: atomic {bus_pkt} for blk_addr {block_addr:#x}", self.name);

            let lat = self.mem_side.send_atomic(&mut bus_pkt);

            let old = status;
            let new_state = self.coherence.new_state(&bus_pkt, old);
            let idx = self
                .tags
                .handle_fill(access.fill, &bus_pkt, new_state, now, &mut writebacks);
            if pkt.is_write() {
                self.tags.apply_write(idx, pkt, now);
            } else if pkt.is_read() {
                self.tags.copy_to_packet(idx, pkt);
            }
            pkt.flags.insert(Flags::SATISFIED);
            pkt.result = PacketResult::Success;

            for mut wb in writebacks {
                let _ = self.mem_side.send_atomic(&mut wb);
            }
            return lat + self.params.hit_latency;
        }

        if access.blk.is_some() {
            self.stats.inc_hit(pkt.cmd, pkt.req.master);
            pkt.flags.insert(Flags::SATISFIED);
            pkt.result = PacketResult::Success;
        }
        for mut wb in writebacks {
            let _ = self.mem_side.send_atomic(&mut wb);
        }
        self.params.hit_latency
    }

    /// Functional access: no state mutation, but the probe must see through
    /// every in-flight byte, whether committed in a block, buffered as an
    /// MSHR target, or pending in the writeback buffer.
    fn probe_functional(&mut self, pkt: &mut Packet, toward_mem: bool) {
        let now = self.now();

        if pkt.is_write() || !toward_mem {
            // writes must land in every level; probes travelling toward the
            // CPU have nothing above us to miss into
            let port = if toward_mem {
                &self.mem_side
            } else {
                &self.cpu_side
            };
            if port.is_bound() {
                port.send_functional(pkt);
            }
        }

        let access = self.tags.handle_access(pkt, false, now);
        let mut covered = bitvec![0; pkt.size as usize];
        if access.blk.is_some() && pkt.is_read() {
            covered.fill(true);
        }
        if pkt.is_read() {
            pkt.allocate();
        }

        // newer bytes may sit in the miss queues; they mask the block
        for inflight in self.missq.inflight_packets_mut() {
            if let Some((offset, len)) = packet::fix_packet(pkt, inflight) {
                covered[offset..offset + len].fill(true);
            }
        }

        if pkt.is_read() && !covered.all() && toward_mem {
            if covered.not_any() {
                self.mem_side.send_functional(pkt);
            } else {
                // fetch the remainder below and merge only uncovered bytes
                let mut shadow = Packet::new(Arc::clone(&pkt.req), Command::ReadReq);
                shadow.addr = pkt.addr;
                shadow.size = pkt.size;
                shadow.allocate();
                self.mem_side.send_functional(&mut shadow);
                let data = pkt.data_mut();
                for (i, byte) in shadow.data().iter().enumerate() {
                    if !covered[i] {
                        data[i] = *byte;
                    }
                }
            }
        }
        pkt.result = PacketResult::Success;
    }
}

impl Device for Cache {
    fn name(&self) -> &str {
        &self.name
    }

    fn recv_timing(&mut self, side: Side, pkt: Packet) -> Result<(), Packet> {
        match side {
            Side::CpuSide => {
                if pkt.flags.contains(Flags::SNOOP_COMMIT) && !pkt.is_response() {
                    // an invalidate from an inner level in a multi-level tree
                    self.snoop(pkt);
                    Ok(())
                } else if pkt.is_response() {
                    panic!("{}: unexpected response on the cpu side", self.name);
                } else {
                    self.access(pkt)
                }
            }
            Side::MemSide => {
                if pkt.is_response() {
                    self.handle_response(pkt);
                } else if pkt.flags.contains(Flags::SNOOP_COMMIT) {
                    self.snoop(pkt);
                } else {
                    log::trace!("{}: ignoring uncommitted snoop {pkt}", self.name);
                }
                Ok(())
            }
            other => panic!("{}: packet arrived on unknown side {other:?}", self.name),
        }
    }

    fn recv_retry(&mut self, side: Side) {
        match side {
            Side::MemSide => self.transmit(),
            other => panic!("{}: unexpected retry on {other:?}", self.name),
        }
    }

    fn recv_atomic(&mut self, side: Side, pkt: &mut Packet) -> Tick {
        match side {
            Side::CpuSide => self.probe(pkt, true, true),
            Side::MemSide => {
                if pkt.is_response() {
                    panic!("{}: atomic response on the mem side", self.name);
                }
                self.snoop_probe(pkt)
            }
            other => panic!("{}: atomic access on unknown side {other:?}", self.name),
        }
    }

    fn recv_functional(&mut self, side: Side, pkt: &mut Packet) {
        match side {
            Side::CpuSide => {
                let _ = self.probe(pkt, false, true);
            }
            Side::MemSide => {
                let _ = self.probe(pkt, false, false);
            }
            other => panic!("{}: functional access on unknown side {other:?}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cache, Status};
    use crate::config::{CacheParams, Protocol};
    use crate::engine::EventQueue;
    use crate::packet::{Command, Flags, PacketResult};
    use crate::port::{Device, Peer, Side};
    use crate::sync::{Arc, Mutex};
    use crate::testing::{self, Capture};

    struct Harness {
        cache: Arc<Mutex<Cache>>,
        cpu: Arc<Mutex<Capture>>,
        mem: Arc<Mutex<Capture>>,
        queue: Arc<EventQueue>,
    }

    fn harness(params: CacheParams) -> Harness {
        testing::init_logs();
        let queue = EventQueue::new();
        let cache = Cache::new(params, queue.clone(), 7);
        let cpu = Capture::new("cpu");
        let mem = Capture::new("mem");
        {
            let guard = cache.lock();
            guard.cpu_side.bind(Peer {
                device: cpu.clone(),
                side: Side::Dcache,
            });
            guard.mem_side.bind(Peer {
                device: mem.clone(),
                side: Side::Mem(0),
            });
        }
        Harness {
            cache,
            cpu,
            mem,
            queue,
        }
    }

    fn small_params() -> CacheParams {
        CacheParams {
            n_sets: 4,
            assoc: 2,
            hit_latency: 2,
            ..CacheParams::default()
        }
    }

    const CLEAN: Status = Status::VALID
        .union(Status::READABLE)
        .union(Status::WRITABLE);
    const DIRTY: Status = CLEAN.union(Status::DIRTY);

    #[test]
    fn test_load_hit_replies_after_hit_latency() {
        // S1: warm block, 8-byte load, reply at now + 2 with the block bytes
        let h = harness(small_params());
        h.cache
            .lock()
            .warm(0x1000, CLEAN, &testing::pattern(64), 0);

        let sent = h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::read_pkt(0x1008, 8));
        assert!(sent.is_ok());
        h.queue.run();

        assert_eq!(h.queue.current_tick(), 2);
        let cpu = h.cpu.lock();
        assert_eq!(cpu.received.len(), 1);
        let resp = &cpu.received[0];
        assert_eq!(resp.cmd, Command::ReadResp);
        assert!(resp.is_satisfied());
        assert_eq!(resp.data(), &[8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(h.cache.lock().stats.hits.get(Command::ReadReq), 1);
        assert!(h.mem.lock().received.is_empty());
    }

    #[test]
    fn test_load_miss_evicts_clean_victim() {
        // S2: full set of clean lines, miss allocates an MSHR, fill evicts
        // the LRU victim and answers with the requested bytes
        let h = harness(small_params());
        {
            let mut cache = h.cache.lock();
            // both ways of the set 0x2040 maps to (set 1)
            cache.warm(0x40, CLEAN, &[0u8; 64], 1);
            cache.warm(0x140, CLEAN, &[0u8; 64], 2);
        }

        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::read_pkt(0x2040, 4))
            .is_ok());
        h.queue.run();

        assert_eq!(h.cache.lock().stats.misses.get(Command::ReadReq), 1);
        let bus_pkt = {
            let mut mem = h.mem.lock();
            assert_eq!(mem.received.len(), 1);
            let pkt = mem.received.remove(0);
            assert_eq!(pkt.cmd, Command::ReadReq);
            assert_eq!(pkt.addr, 0x2040);
            assert_eq!(pkt.size, 64);
            assert!(pkt.is_cache_fill());
            pkt
        };
        assert!(h.cache.lock().miss_queue().find(0x2040).is_some());

        let inject = h.queue.current_tick();
        let resp = testing::fill_response(bus_pkt, 0x5a);
        assert!(h.cache.lock().recv_timing(Side::MemSide, resp).is_ok());
        h.queue.run();

        assert_eq!(h.queue.current_tick(), inject + 2);
        let cpu = h.cpu.lock();
        assert_eq!(cpu.received.len(), 1);
        assert_eq!(cpu.received[0].data(), &[0x5a; 4]);
        let cache = h.cache.lock();
        // LRU victim (last_ref 1) is gone, the newer line survives
        assert!(cache.tag_store().lookup(0x40).is_none());
        assert!(cache.tag_store().lookup(0x140).is_some());
        assert!(cache.tag_store().lookup(0x2040).is_some());
        assert!(cache.miss_queue().is_quiescent());
    }

    #[test]
    fn test_load_miss_dirty_victim_writes_back() {
        // S3: the dirty victim leaves as exactly one WritebackReq alongside
        // the fill request
        let h = harness(small_params());
        {
            let mut cache = h.cache.lock();
            cache.warm(0x40, DIRTY, &[0xaa; 64], 1);
            cache.warm(0x140, DIRTY, &[0xbb; 64], 2);
        }

        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::read_pkt(0x2040, 4))
            .is_ok());
        h.queue.run();

        let mem = h.mem.lock();
        let writebacks: Vec<_> = mem
            .received
            .iter()
            .filter(|p| p.cmd == Command::WritebackReq)
            .collect();
        assert_eq!(writebacks.len(), 1);
        assert_eq!(writebacks[0].addr, 0x40);
        assert_eq!(writebacks[0].data(), &[0xaa; 64]);
        assert!(mem.received.iter().any(|p| p.cmd == Command::ReadReq));
        drop(mem);
        // the victim frame was cleaned out at miss time
        assert!(h.cache.lock().tag_store().lookup(0x40).is_none());
    }

    #[test]
    fn test_coalesced_loads_share_one_mshr() {
        // S4: two loads to one missing line, one memory request, replies in
        // request order
        let h = harness(small_params());
        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::read_pkt(0x2040, 4))
            .is_ok());
        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::read_pkt(0x2048, 8))
            .is_ok());
        h.queue.run();

        let bus_pkt = {
            let mut mem = h.mem.lock();
            assert_eq!(mem.received.len(), 1, "coalesced miss sent twice");
            mem.received.remove(0)
        };
        {
            let cache = h.cache.lock();
            let id = cache.miss_queue().find(0x2040).unwrap();
            assert_eq!(cache.miss_queue().mshr(id).num_request_targets(), 2);
        }

        let resp = testing::fill_response(bus_pkt, 0x11);
        assert!(h.cache.lock().recv_timing(Side::MemSide, resp).is_ok());
        h.queue.run();

        let cpu = h.cpu.lock();
        assert_eq!(cpu.received.len(), 2);
        assert_eq!(cpu.received[0].addr, 0x2040);
        assert_eq!(cpu.received[1].addr, 0x2048);
        assert!(cpu.received.iter().all(|p| p.is_satisfied()));
    }

    #[test]
    fn test_snoop_during_in_service_miss_defers_invalidate() {
        // S5: a snooped invalidate against an in-service read miss appends
        // an invalidate target; the fill lands and immediately dies
        let mut params = small_params();
        params.protocol = Protocol::Msi;
        let h = harness(params);

        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::read_pkt(0xa00, 8))
            .is_ok());
        h.queue.run();
        let bus_pkt = h.mem.lock().received.remove(0);
        assert!(h.cache.lock().miss_queue().find(0xa00).is_some());

        let snoop = testing::snoop_pkt(Command::InvalidateReq, 0xa00, 64);
        assert!(h.cache.lock().recv_timing(Side::MemSide, snoop).is_ok());
        h.queue.run();

        let resp = testing::fill_response(bus_pkt, 0x77);
        assert!(h.cache.lock().recv_timing(Side::MemSide, resp).is_ok());
        h.queue.run();

        // the load still completed...
        let cpu = h.cpu.lock();
        assert_eq!(cpu.received.len(), 1);
        assert_eq!(cpu.received[0].data(), &[0x77; 8]);
        // ...but the line reflects the snoop's intent
        assert!(h.cache.lock().tag_store().lookup(0xa00).is_none());
    }

    #[test]
    fn test_invalidated_write_miss_writes_back_before_dying() {
        // a narrow write miss rides the bus as ReadEx; a snooped invalidate
        // against it defers, and the acknowledged write must leave as a
        // writeback instead of vanishing with the line
        let mut params = small_params();
        params.protocol = Protocol::Msi;
        let h = harness(params);

        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::write_pkt(0xb00, 8, &[4; 8]))
            .is_ok());
        h.queue.run();
        let bus_pkt = h.mem.lock().received.remove(0);
        assert_eq!(bus_pkt.cmd, Command::ReadExReq);

        let snoop = testing::snoop_pkt(Command::InvalidateReq, 0xb00, 64);
        assert!(h.cache.lock().recv_timing(Side::MemSide, snoop).is_ok());
        h.queue.run();

        // nothing more may queue behind the deferred invalidate
        let refused = h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::write_pkt(0xb08, 8, &[5; 8]));
        assert!(refused.is_err());

        let resp = testing::fill_response(bus_pkt, 0);
        assert!(h.cache.lock().recv_timing(Side::MemSide, resp).is_ok());
        h.queue.run();

        {
            let mem = h.mem.lock();
            let wb = mem
                .received
                .iter()
                .find(|p| p.cmd == Command::WritebackReq)
                .expect("dirty fill must write back before invalidating");
            assert_eq!(wb.addr, 0xb00);
            assert_eq!(&wb.data()[0..8], &[4; 8]);
        }
        let cache = h.cache.lock();
        assert!(cache.tag_store().lookup(0xb00).is_none());
        assert!(cache.miss_queue().is_quiescent());
        drop(cache);
        // exactly one write was acknowledged, and its data survived
        let cpu = h.cpu.lock();
        assert_eq!(cpu.received.len(), 1);
        assert_eq!(cpu.received[0].cmd, Command::WriteResp);
        assert_eq!(cpu.retries, 1);
    }

    #[test]
    fn test_fast_write_allocate_full_block() {
        // S6: a full-block write miss installs locally, no memory traffic
        let h = harness(small_params());
        let payload = testing::pattern(64);
        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::write_pkt(0x3000, 64, &payload))
            .is_ok());
        h.queue.run();

        let cache = h.cache.lock();
        assert_eq!(cache.stats.fast_writes, 1);
        let blk = cache.tag_store().lookup(0x3000).expect("line installed");
        assert!(blk.is_valid() && blk.is_writable());
        assert_eq!(blk.data, payload);
        assert!(h.mem.lock().received.is_empty());
        let cpu = h.cpu.lock();
        assert_eq!(cpu.received.len(), 1);
        assert_eq!(cpu.received[0].cmd, Command::WriteResp);
    }

    #[test]
    fn test_write_to_shared_line_upgrades_in_place() {
        let mut params = small_params();
        params.protocol = Protocol::Msi;
        let h = harness(params);
        h.cache
            .lock()
            .warm(0x1000, Status::VALID | Status::READABLE, &[0u8; 64], 0);

        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::write_pkt(0x1008, 8, &[6; 8]))
            .is_ok());
        h.queue.run();

        // permission only: an upgrade rides the bus, not a fetch
        let bus_pkt = {
            let mut mem = h.mem.lock();
            assert_eq!(mem.received.len(), 1);
            let pkt = mem.received.remove(0);
            assert_eq!(pkt.cmd, Command::UpgradeReq);
            assert!(!pkt.is_cache_fill());
            pkt
        };

        let resp = testing::fill_response(bus_pkt, 0);
        assert!(h.cache.lock().recv_timing(Side::MemSide, resp).is_ok());
        h.queue.run();

        let cache = h.cache.lock();
        let blk = cache.tag_store().lookup(0x1000).expect("line kept");
        assert!(blk.is_writable() && blk.is_dirty());
        assert_eq!(&blk.data[8..16], &[6; 8]);
        let cpu = h.cpu.lock();
        assert_eq!(cpu.received.len(), 1);
        assert_eq!(cpu.received[0].cmd, Command::WriteResp);
    }

    #[test]
    fn test_full_mshr_table_blocks_and_retries() {
        let mut params = small_params();
        params.mshr_entries = 1;
        let h = harness(params);

        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::read_pkt(0x1000, 8))
            .is_ok());
        let refused = h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::read_pkt(0x2000, 8));
        assert!(refused.is_err(), "second miss must block on the MSHR table");

        h.queue.run();
        let bus_pkt = h.mem.lock().received.remove(0);
        let resp = testing::fill_response(bus_pkt, 0x01);
        assert!(h.cache.lock().recv_timing(Side::MemSide, resp).is_ok());
        h.queue.run();

        // the freed MSHR wakes the blocked sender
        assert_eq!(h.cpu.lock().retries, 1);
    }

    #[test]
    fn test_mem_side_blocked_then_retried() {
        let h = harness(small_params());
        h.mem.lock().accept = false;

        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::read_pkt(0x1000, 8))
            .is_ok());
        h.queue.run();
        {
            let mem = h.mem.lock();
            assert!(mem.received.is_empty());
            assert_eq!(mem.refused, 1);
            // the entry went back to not-in-service with its original command
            let cache = h.cache.lock();
            let id = cache.miss_queue().find(0x1000).unwrap();
            assert!(!cache.miss_queue().mshr(id).in_service);
        }

        h.mem.lock().accept = true;
        h.cache.lock().recv_retry(Side::MemSide);
        h.queue.run();
        let mem = h.mem.lock();
        assert_eq!(mem.received.len(), 1);
        assert_eq!(mem.received[0].cmd, Command::ReadReq);
        let cache = h.cache.lock();
        let id = cache.miss_queue().find(0x1000).unwrap();
        assert!(cache.miss_queue().mshr(id).in_service);
    }

    #[test]
    fn test_uncacheable_bypasses_tags() {
        let h = harness(small_params());
        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::uncacheable_read(0x6008, 8))
            .is_ok());
        h.queue.run();

        let bus_pkt = {
            let mut mem = h.mem.lock();
            assert_eq!(mem.received.len(), 1);
            let pkt = mem.received.remove(0);
            // exact size, no fill, never allocated
            assert_eq!(pkt.size, 8);
            assert!(pkt.is_no_allocate());
            assert!(!pkt.is_cache_fill());
            pkt
        };
        let resp = testing::fill_response(bus_pkt, 0x42);
        assert!(h.cache.lock().recv_timing(Side::MemSide, resp).is_ok());
        h.queue.run();

        assert_eq!(h.cpu.lock().received[0].data(), &[0x42; 8]);
        assert!(h.cache.lock().tag_store().lookup(0x6000).is_none());
    }

    #[test]
    fn test_nacked_fill_is_warning_only() {
        let h = harness(small_params());
        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::read_pkt(0x1000, 8))
            .is_ok());
        h.queue.run();

        let mut resp = testing::fill_response(h.mem.lock().received.remove(0), 0);
        resp.result = PacketResult::Nacked;
        assert!(h.cache.lock().recv_timing(Side::MemSide, resp).is_ok());
        h.queue.run();

        // nothing reached the CPU and the miss is still outstanding
        assert!(h.cpu.lock().received.is_empty());
        assert!(h.cache.lock().miss_queue().find(0x1000).is_some());
    }

    #[test]
    fn test_bad_address_propagates_to_targets() {
        let h = harness(small_params());
        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::read_pkt(0x1000, 8))
            .is_ok());
        h.queue.run();

        let mut resp = testing::fill_response(h.mem.lock().received.remove(0), 0);
        resp.result = PacketResult::BadAddress;
        assert!(h.cache.lock().recv_timing(Side::MemSide, resp).is_ok());
        h.queue.run();

        let cpu = h.cpu.lock();
        assert_eq!(cpu.received.len(), 1);
        assert_eq!(cpu.received[0].result, PacketResult::BadAddress);
        // the error retired the miss; the line was never installed
        assert!(h.cache.lock().miss_queue().is_quiescent());
        assert!(h.cache.lock().tag_store().lookup(0x1000).is_none());
    }

    #[test]
    fn test_functional_probe_sees_buffered_write_target() {
        // a write waiting in an MSHR target is the newest copy of its bytes
        let h = harness(small_params());
        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::write_pkt(0x5000, 8, &[9; 8]))
            .is_ok());

        let mut probe = testing::read_pkt(0x5000, 8);
        h.cache
            .lock()
            .recv_functional(Side::CpuSide, &mut probe);
        assert_eq!(probe.data(), &[9; 8]);
        assert_eq!(probe.result, PacketResult::Success);
        // the probe must not have consulted memory for covered bytes
        assert!(h.mem.lock().functional.is_empty());
    }

    #[test]
    fn test_prefetcher_issues_next_line_through_mshr_queue() {
        let mut params = small_params();
        params.prefetch = Some(crate::config::PrefetchParams {
            degree: 1,
            on_access: false,
        });
        let h = harness(params);

        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::read_pkt(0x1000, 8))
            .is_ok());
        h.queue.run();

        // demand fill plus one speculative next-line fill
        let (demand, speculative) = {
            let mut mem = h.mem.lock();
            assert_eq!(mem.received.len(), 2);
            let second = mem.received.remove(1);
            let first = mem.received.remove(0);
            (first, second)
        };
        assert_eq!(demand.addr, 0x1000);
        assert_eq!(speculative.addr, 0x1040);
        assert!(speculative.req.is_prefetch());
        assert_eq!(h.cache.lock().stats.misses.get(Command::HardPFReq), 1);

        let resp = testing::fill_response(speculative, 0x33);
        assert!(h.cache.lock().recv_timing(Side::MemSide, resp).is_ok());
        h.queue.run();

        let cache = h.cache.lock();
        let blk = cache.tag_store().lookup(0x1040).expect("prefetched line");
        assert!(blk.status.contains(Status::PREFETCHED));
        // speculative fills never answer the CPU
        assert!(h.cpu.lock().received.is_empty());
    }

    #[test]
    fn test_snoop_read_supplied_from_writeback_buffer() {
        let mut params = small_params();
        params.protocol = Protocol::Msi;
        let h = harness(params);
        // hold the writeback in the buffer by blocking the mem side
        h.mem.lock().accept = false;
        {
            let mut cache = h.cache.lock();
            cache.warm(0x40, DIRTY, &[0xcd; 64], 1);
            cache.warm(0x140, DIRTY, &[0xef; 64], 2);
        }
        assert!(h
            .cache
            .lock()
            .recv_timing(Side::CpuSide, testing::read_pkt(0x2040, 4))
            .is_ok());
        h.queue.run();
        // the eviction is parked in the writeback buffer; unblock the port
        // so the snoop reply can get out
        h.mem.lock().accept = true;

        let snoop = testing::snoop_pkt(Command::ReadReq, 0x48, 8);
        assert!(h.cache.lock().recv_timing(Side::MemSide, snoop).is_ok());
        h.queue.run();

        let mem = h.mem.lock();
        let reply = mem
            .received
            .iter()
            .find(|p| p.flags.contains(Flags::SATISFIED))
            .expect("snoop reply");
        assert!(reply.flags.contains(Flags::SHARED_LINE));
        assert_eq!(reply.data(), &[0xcd; 8]);
    }
}
