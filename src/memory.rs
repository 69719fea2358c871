use crate::config::MemParams;
use crate::engine::{Event, EventQueue, Tick};
use crate::packet::{Packet, PacketResult};
use crate::port::{Device, Port, Side};
use crate::sync::{Arc, Mutex, Weak};

/// Flat physical memory with a fixed access latency and a bounded window of
/// in-flight requests. Out-of-range accesses come back as BadAddress
/// responses rather than errors.
pub struct PhysicalMemory {
    name: String,
    params: MemParams,
    scheduler: Arc<EventQueue>,
    data: Vec<u8>,
    ports: Vec<Port>,
    retry_pending: Vec<bool>,
    inflight: usize,
    self_ref: Weak<Mutex<PhysicalMemory>>,
}

impl PhysicalMemory {
    pub fn new(params: MemParams, scheduler: Arc<EventQueue>) -> Arc<Mutex<PhysicalMemory>> {
        Arc::new_cyclic(|weak: &Weak<Mutex<PhysicalMemory>>| {
            Mutex::new(Self {
                name: "mem".to_string(),
                data: vec![0; params.size as usize],
                ports: Vec::new(),
                retry_pending: Vec::new(),
                inflight: 0,
                self_ref: weak.clone(),
                scheduler,
                params,
            })
        })
    }

    fn arc(&self) -> Arc<Mutex<PhysicalMemory>> {
        self.self_ref.upgrade().expect("memory was dropped")
    }

    /// Add one memory-side port; returns its index for `Side::Mem(i)`.
    pub fn add_port(&mut self) -> usize {
        let index = self.ports.len();
        self.ports.push(Port::new(format!("{}.port{index}", self.name)));
        self.retry_pending.push(false);
        index
    }

    #[must_use]
    pub fn port(&self, index: usize) -> &Port {
        &self.ports[index]
    }

    fn contains(&self, pkt: &Packet) -> bool {
        let start = pkt.addr;
        let end = pkt.addr + u64::from(pkt.size);
        start >= self.params.base && end <= self.params.base + self.params.size
    }

    /// Apply a packet to the backing store. With `make_response` the packet
    /// is converted in place into the answer a master expects.
    fn do_access(&mut self, pkt: &mut Packet, make_response: bool) {
        if !self.contains(pkt) {
            log::debug!("{}: bad address {pkt}", self.name);
            if make_response && pkt.needs_response() {
                pkt.make_response();
            }
            pkt.result = PacketResult::BadAddress;
            return;
        }
        let offset = (pkt.addr - self.params.base) as usize;
        let len = pkt.size as usize;
        if pkt.is_write() {
            self.data[offset..offset + len].copy_from_slice(pkt.data());
        } else if pkt.is_read() {
            let bytes = self.data[offset..offset + len].to_vec();
            pkt.set_data(&bytes);
        }
        // upgrades and invalidates touch no data here; the ack is enough
        if make_response && pkt.needs_response() {
            pkt.make_response();
        }
        pkt.result = PacketResult::Success;
    }

    /// One in-flight request finished; free the slot and wake anyone who
    /// got refused while the window was full.
    pub(crate) fn complete_one(&mut self) {
        debug_assert!(self.inflight > 0);
        self.inflight -= 1;
        let now = self.scheduler.current_tick();
        for index in 0..self.ports.len() {
            if self.retry_pending[index] && self.inflight < self.params.max_inflight {
                self.retry_pending[index] = false;
                let dst = self.ports[index].peer().clone();
                self.scheduler.schedule(Event::Retry { dst }, now);
            }
        }
    }

    /// Directly read the backing store; test and checkpoint helper.
    #[must_use]
    pub fn peek(&self, addr: crate::address, len: usize) -> Vec<u8> {
        let offset = (addr - self.params.base) as usize;
        self.data[offset..offset + len].to_vec()
    }

    pub fn poke(&mut self, addr: crate::address, bytes: &[u8]) {
        let offset = (addr - self.params.base) as usize;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl Device for PhysicalMemory {
    fn name(&self) -> &str {
        &self.name
    }

    fn recv_timing(&mut self, side: Side, mut pkt: Packet) -> Result<(), Packet> {
        let Side::Mem(index) = side else {
            panic!("{}: packet arrived on unknown side {side:?}", self.name);
        };
        let index = index as usize;

        if pkt.is_response() || pkt.is_satisfied() {
            // a snoop answer flowing past on its way to the bus; memory has
            // no snoop state to reconcile
            log::trace!("{}: absorbing {pkt}", self.name);
            return Ok(());
        }

        if self.inflight >= self.params.max_inflight {
            log::debug!("{}: window full, refusing {pkt}", self.name);
            self.retry_pending[index] = true;
            return Err(pkt);
        }
        self.inflight += 1;

        let now = self.scheduler.current_tick();
        let when = now + self.params.latency;
        let needs_response = pkt.needs_response();
        self.do_access(&mut pkt, true);
        log::debug!("{}: {pkt} serviced, reply at {when}", self.name);

        if needs_response {
            let dst = self.ports[index].peer().clone();
            self.scheduler.schedule(Event::Deliver { dst, pkt }, when);
        }
        let mem = self.arc();
        self.scheduler.schedule(Event::MemComplete { mem }, when);
        Ok(())
    }

    fn recv_retry(&mut self, _side: Side) {
        panic!("{}: memory never holds a refused packet", self.name);
    }

    fn recv_atomic(&mut self, _side: Side, pkt: &mut Packet) -> Tick {
        self.do_access(pkt, true);
        self.params.latency
    }

    fn recv_functional(&mut self, _side: Side, pkt: &mut Packet) {
        self.do_access(pkt, false);
    }
}
