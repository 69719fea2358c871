use super::block::{CacheBlk, Status};
use crate::config::{CacheParams, Replacement};
use crate::packet::{Command, Packet};
use crate::request;
use crate::sync::Arc;
use crate::{address, MasterId, Tick};

/// Result of probing a set for an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Line present with sufficient permissions.
    Hit(usize),
    /// Line absent or present without the needed permissions; `fill` is the
    /// frame a later fill should land in.
    Miss { fill: usize, dirty_victim: bool },
}

/// Outcome of one tag access.
#[derive(Debug)]
pub struct Access {
    /// Hit frame, if any.
    pub blk: Option<usize>,
    /// Frame reserved for the fill on a miss that will allocate.
    pub fill: Option<usize>,
    pub latency: Tick,
    /// Writebacks produced by victim eviction.
    pub writebacks: Vec<Packet>,
}

/// Set-associative array of cache blocks with pluggable replacement.
///
/// The tag store moves data: read hits copy block bytes into the packet,
/// write hits copy packet bytes into the block. The cache controller above
/// decides when state may be mutated (timing/atomic) and when it may not
/// (functional probes).
#[derive(Debug)]
pub struct TagStore {
    name: String,
    params: CacheParams,
    master: MasterId,
    lines: Vec<CacheBlk>,
}

impl TagStore {
    #[must_use]
    pub fn new(params: CacheParams, master: MasterId) -> Self {
        let lines = (0..params.total_lines())
            .map(|i| CacheBlk::new(i / params.assoc, i % params.assoc, params.block_size))
            .collect();
        Self {
            name: format!("{}.tags", params.name),
            params,
            master,
            lines,
        }
    }

    fn index(&self, set: usize, way: usize) -> usize {
        set * self.params.assoc + way
    }

    #[must_use]
    pub fn blk(&self, idx: usize) -> &CacheBlk {
        &self.lines[idx]
    }

    #[must_use]
    pub fn blk_mut(&mut self, idx: usize) -> &mut CacheBlk {
        &mut self.lines[idx]
    }

    /// Pure lookup, no state mutation.
    #[must_use]
    pub fn lookup(&self, addr: address) -> Option<&CacheBlk> {
        self.lookup_idx(addr).map(|idx| &self.lines[idx])
    }

    #[must_use]
    pub fn lookup_idx(&self, addr: address) -> Option<usize> {
        let set = self.params.set_index(addr);
        let tag = self.params.tag(addr);
        (0..self.params.assoc)
            .map(|way| self.index(set, way))
            .find(|&idx| self.lines[idx].is_valid() && self.lines[idx].tag == tag)
    }

    /// Probe for an access: hit when the line is present with the needed
    /// permissions, otherwise the replacement choice for the eventual fill.
    ///
    /// Victim selection prefers invalid frames; among valid ones the
    /// configured policy decides, breaking ties toward the lowest way.
    #[must_use]
    pub fn probe(&self, addr: address, needs_writable: bool) -> Probe {
        let set = self.params.set_index(addr);
        let tag = self.params.tag(addr);

        for way in 0..self.params.assoc {
            let idx = self.index(set, way);
            let line = &self.lines[idx];
            if line.is_valid() && line.tag == tag {
                let permitted = if needs_writable {
                    line.is_writable()
                } else {
                    line.is_readable()
                };
                if permitted {
                    return Probe::Hit(idx);
                }
                // present without permission: upgrade fills in place
                return Probe::Miss {
                    fill: idx,
                    dirty_victim: false,
                };
            }
        }

        let mut victim = self.index(set, 0);
        let mut victim_key = Tick::MAX;
        for way in 0..self.params.assoc {
            let idx = self.index(set, way);
            let line = &self.lines[idx];
            if !line.is_valid() {
                return Probe::Miss {
                    fill: idx,
                    dirty_victim: false,
                };
            }
            let key = match self.params.replacement {
                Replacement::Lru => line.last_ref,
                Replacement::Fifo => line.alloc_tick,
            };
            if key < victim_key {
                victim_key = key;
                victim = idx;
            }
        }
        Probe::Miss {
            fill: victim,
            dirty_victim: self.lines[victim].is_dirty(),
        }
    }

    /// One tag access for `pkt`. With `update` the replacement state and
    /// dirty bits move; without it only data is copied (functional probes).
    ///
    /// On a miss that will allocate, the victim is chosen now: a dirty
    /// victim emits its writeback immediately so it travels ahead of (or
    /// alongside) the fill request for the new line.
    pub fn handle_access(&mut self, pkt: &mut Packet, update: bool, now: Tick) -> Access {
        let needs_writable = pkt.is_write();
        let probe = self.probe(pkt.addr, needs_writable);
        log::trace!(
            "{}::handle_access({pkt}) => {probe:?} (update={update})",
            self.name
        );

        let mut access = Access {
            blk: None,
            fill: None,
            latency: self.params.hit_latency,
            writebacks: Vec::new(),
        };

        match probe {
            Probe::Hit(idx) => {
                if update {
                    self.lines[idx].last_ref = now;
                    self.lines[idx].status.remove(Status::PREFETCHED);
                }
                if pkt.is_write() {
                    self.write_block(idx, pkt, update);
                } else if pkt.is_read() {
                    self.copy_to_packet(idx, pkt);
                }
                access.blk = Some(idx);
            }
            Probe::Miss { fill, dirty_victim } => {
                if update && Self::will_allocate(pkt.cmd) && !pkt.is_no_allocate() {
                    if dirty_victim {
                        let wb = self.writeback_packet(fill, now);
                        self.lines[fill].invalidate();
                        access.writebacks.push(wb);
                    }
                    access.fill = Some(fill);
                }
            }
        }
        access
    }

    fn will_allocate(cmd: Command) -> bool {
        cmd.is_read() || cmd.is_write() || cmd == Command::UpgradeReq
    }

    /// Install a fill into the reserved frame and transition it to
    /// `new_state`. When the reserved frame was stolen in the interim (or
    /// none was reserved, as in fast write-allocate), a victim is selected
    /// here and any additional writeback is appended.
    pub fn handle_fill(
        &mut self,
        fill: Option<usize>,
        pkt: &Packet,
        new_state: Status,
        now: Tick,
        writebacks: &mut Vec<Packet>,
    ) -> usize {
        let block_addr = self.params.block_addr(pkt.addr);
        let tag = self.params.tag(block_addr);

        let idx = match fill {
            Some(idx) => {
                let line = &self.lines[idx];
                let stolen = line.is_valid() && line.tag != tag && line.is_dirty();
                if stolen {
                    // the reserved frame now holds someone else's dirty line
                    self.select_fill_victim(block_addr, now, writebacks)
                } else {
                    idx
                }
            }
            None => self.select_fill_victim(block_addr, now, writebacks),
        };

        let master = pkt.req.master;
        let prefetched = pkt.req.is_prefetch();
        let dirty = pkt.is_write();
        let line = &mut self.lines[idx];
        line.tag = tag;
        line.addr = block_addr;
        line.status = new_state;
        if dirty {
            line.status.insert(Status::DIRTY);
        }
        if prefetched {
            line.status.insert(Status::PREFETCHED);
        }
        line.last_ref = now;
        line.alloc_tick = now;
        line.src_master = master;
        if pkt.has_data() {
            assert_eq!(
                pkt.size, self.params.block_size,
                "fill {pkt} does not cover the block"
            );
            line.data.copy_from_slice(pkt.data());
        }
        log::trace!("{}::handle_fill => {}", self.name, self.lines[idx]);
        idx
    }

    fn select_fill_victim(
        &mut self,
        block_addr: address,
        now: Tick,
        writebacks: &mut Vec<Packet>,
    ) -> usize {
        match self.probe(block_addr, false) {
            Probe::Hit(idx) => idx,
            Probe::Miss { fill, dirty_victim } => {
                if dirty_victim {
                    let wb = self.writeback_packet(fill, now);
                    self.lines[fill].invalidate();
                    writebacks.push(wb);
                }
                fill
            }
        }
    }

    /// External state transition driven by the coherence protocol. When a
    /// packet is supplied, the snooped data is copied into it.
    pub fn handle_snoop(&mut self, idx: usize, new_state: Status, pkt: Option<&mut Packet>) {
        if let Some(pkt) = pkt {
            self.copy_to_packet(idx, pkt);
        }
        let line = &mut self.lines[idx];
        log::trace!(
            "{}::handle_snoop({}) {:?} -> {:?}",
            self.name,
            line.addr,
            line.status,
            new_state
        );
        line.status = new_state;
    }

    /// Unconditional demotion to invalid.
    pub fn invalidate_blk(&mut self, addr: address) {
        if let Some(idx) = self.lookup_idx(addr) {
            log::trace!("{}::invalidate_blk({addr:#x})", self.name);
            self.lines[idx].invalidate();
        }
    }

    /// Demote a line to invalid, first capturing its writeback when dirty.
    /// For lines that must die while holding data not yet seen below.
    pub fn flush_blk(&mut self, addr: address, now: Tick) -> Option<Packet> {
        let idx = self.lookup_idx(addr)?;
        let wb = if self.lines[idx].is_dirty() {
            Some(self.writeback_packet(idx, now))
        } else {
            None
        };
        self.lines[idx].invalidate();
        wb
    }

    /// Copy the bytes `pkt` asks for out of a block.
    pub fn copy_to_packet(&self, idx: usize, pkt: &mut Packet) {
        let line = &self.lines[idx];
        let offset = self.params.block_offset(pkt.addr);
        let end = offset + pkt.size as usize;
        assert!(end <= line.data.len(), "{pkt} crosses a block boundary");
        let bytes = line.data[offset..end].to_vec();
        pkt.set_data(&bytes);
    }

    fn write_block(&mut self, idx: usize, pkt: &Packet, update: bool) {
        let offset = self.params.block_offset(pkt.addr);
        let line = &mut self.lines[idx];
        let end = offset + pkt.size as usize;
        assert!(end <= line.data.len(), "{pkt} crosses a block boundary");
        line.data[offset..end].copy_from_slice(pkt.data());
        if update {
            line.status.insert(Status::DIRTY);
        }
    }

    /// Apply a coalesced write target to a just-filled block.
    pub fn apply_write(&mut self, idx: usize, pkt: &Packet, now: Tick) {
        self.write_block(idx, pkt, true);
        self.lines[idx].last_ref = now;
    }

    fn writeback_packet(&self, idx: usize, now: Tick) -> Packet {
        let line = &self.lines[idx];
        let req = Arc::new(
            request::Builder {
                vaddr: line.addr,
                size: self.params.block_size,
                master: self.master,
                issued: now,
                ..request::Builder::default()
            }
            .build(),
        );
        let mut wb = Packet::new(req, Command::WritebackReq);
        wb.set_data(&line.data);
        wb.time = now;
        log::debug!("{}::writeback({wb})", self.name);
        wb
    }

    #[must_use]
    pub fn num_valid(&self) -> usize {
        self.lines.iter().filter(|l| l.is_valid()).count()
    }

    pub fn valid_blocks(&self) -> impl Iterator<Item = &CacheBlk> {
        self.lines.iter().filter(|l| l.is_valid())
    }

    /// Reinstall a block from a checkpoint.
    pub fn install_raw(&mut self, addr: address, status: Status, data: &[u8], last_ref: Tick) {
        let set = self.params.set_index(addr);
        let way = (0..self.params.assoc)
            .find(|&w| !self.lines[self.index(set, w)].is_valid())
            .expect("checkpoint holds more lines than the set can");
        let idx = self.index(set, way);
        let line = &mut self.lines[idx];
        line.tag = self.params.tag(addr);
        line.addr = self.params.block_addr(addr);
        line.status = status;
        line.data.copy_from_slice(data);
        line.last_ref = last_ref;
        line.alloc_tick = last_ref;
    }
}
