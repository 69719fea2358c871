use crate::config::CpuParams;
use crate::engine::{Event, EventId, EventQueue, Tick};
use crate::isa::{self, Fault, Mmu, Opcode, StaticInst, ThreadState};
use crate::packet::{Command, Packet, PacketResult};
use crate::port::{Device, Port, Side};
use crate::request;
use crate::stats::CpuStats;
use crate::sync::{Arc, Mutex, Weak};
use crate::MasterId;

/// Where the CPU is in its one-instruction-in-flight loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStatus {
    Idle,
    Running,
    IcacheRetry,
    IcacheWaitResponse,
    DcacheRetry,
    DcacheWaitResponse,
    SwitchedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Running,
    Draining,
    Drained,
}

/// A single-issue in-order CPU timing model.
///
/// Fetches through its icache port, executes, issues at most one data
/// access through its dcache port, and consumes responses at CPU clock
/// edges. Architectural semantics live in [`isa`]; this model owns only
/// the request/response state machine.
pub struct TimingCpu {
    name: String,
    params: CpuParams,
    scheduler: Arc<EventQueue>,
    pub icache_port: Port,
    pub dcache_port: Port,
    mmu: Box<dyn Mmu>,
    pub thread: ThreadState,
    status: CpuStatus,
    drain: DrainState,
    /// Fetch packet held while the icache is blocked.
    ifetch_pkt: Option<Packet>,
    /// Data packet held while the dcache is blocked.
    dcache_pkt: Option<Packet>,
    cur_inst: Option<StaticInst>,
    fetch_event: Option<EventId>,
    pub last_fault: Option<Fault>,
    pub stats: CpuStats,
    master: MasterId,
    cpu_id: usize,
    prev_tick: Tick,
    wait_started: Tick,
    self_ref: Weak<Mutex<TimingCpu>>,
}

impl TimingCpu {
    pub fn new(
        name: &str,
        params: CpuParams,
        mmu: Box<dyn Mmu>,
        scheduler: Arc<EventQueue>,
        master: MasterId,
        cpu_id: usize,
        start_pc: crate::address,
    ) -> Arc<Mutex<TimingCpu>> {
        Arc::new_cyclic(|weak: &Weak<Mutex<TimingCpu>>| {
            Mutex::new(Self {
                name: name.to_string(),
                icache_port: Port::new(format!("{name}.icache_port")),
                dcache_port: Port::new(format!("{name}.dcache_port")),
                mmu,
                thread: ThreadState::new(start_pc),
                status: CpuStatus::Idle,
                drain: DrainState::Running,
                ifetch_pkt: None,
                dcache_pkt: None,
                cur_inst: None,
                fetch_event: None,
                last_fault: None,
                stats: CpuStats::default(),
                master,
                cpu_id,
                prev_tick: 0,
                wait_started: 0,
                self_ref: weak.clone(),
                scheduler,
                params,
            })
        })
    }

    fn arc(&self) -> Arc<Mutex<TimingCpu>> {
        self.self_ref.upgrade().expect("cpu was dropped")
    }

    fn now(&self) -> Tick {
        self.scheduler.current_tick()
    }

    #[must_use]
    pub fn status(&self) -> CpuStatus {
        self.status
    }

    #[must_use]
    pub fn drain_state(&self) -> DrainState {
        self.drain
    }

    /// Round a tick up to the next CPU clock edge.
    #[must_use]
    pub fn next_cycle(&self, tick: Tick) -> Tick {
        let clock = self.params.clock.max(1);
        tick.div_ceil(clock) * clock
    }

    fn count_cycles(&mut self, now: Tick) {
        self.stats.cycles += now - self.prev_tick;
        self.prev_tick = now;
    }

    /// Mark the thread runnable without scheduling anything; atomic mode
    /// drives the loop itself.
    pub fn start(&mut self) {
        assert_eq!(self.status, CpuStatus::Idle, "{}: already active", self.name);
        self.status = CpuStatus::Running;
    }

    /// Kick off timing execution by scheduling the first fetch.
    pub fn activate(&mut self, delay: Tick) {
        self.start();
        let when = self.now() + delay;
        let cpu = self.arc();
        self.fetch_event = Some(self.scheduler.schedule(Event::Fetch { cpu }, when));
    }

    /// Suspension is only legal from a quiescent status; waiting states must
    /// drain first.
    pub fn suspend(&mut self) {
        assert!(
            matches!(self.status, CpuStatus::Running | CpuStatus::Idle),
            "{}: suspend while {:?}",
            self.name,
            self.status
        );
        if let Some(event) = self.fetch_event.take() {
            self.scheduler.deschedule(event);
        }
        self.status = CpuStatus::Idle;
    }

    pub fn switch_out(&mut self) {
        assert!(
            matches!(self.status, CpuStatus::Running | CpuStatus::Idle),
            "{}: switch out while {:?}",
            self.name,
            self.status
        );
        if let Some(event) = self.fetch_event.take() {
            self.scheduler.deschedule(event);
        }
        self.status = CpuStatus::SwitchedOut;
    }

    /// Ask the CPU to drain; true when already quiescent. Otherwise the
    /// pending access completes first and the state becomes `Drained`.
    pub fn drain(&mut self) -> bool {
        match self.status {
            CpuStatus::Idle | CpuStatus::Running | CpuStatus::SwitchedOut => {
                self.drain = DrainState::Drained;
                true
            }
            _ => {
                self.drain = DrainState::Draining;
                false
            }
        }
    }

    pub fn resume(&mut self) {
        self.drain = DrainState::Running;
        if self.status == CpuStatus::Running {
            if let Some(event) = self.fetch_event.take() {
                self.scheduler.deschedule(event);
            }
            let cpu = self.arc();
            self.fetch_event = Some(self.scheduler.schedule(Event::Fetch { cpu }, self.now()));
        }
    }

    fn complete_drain(&mut self) {
        log::debug!("{}: done draining", self.name);
        self.drain = DrainState::Drained;
    }

    fn handle_fault(&mut self, fault: Fault) {
        log::warn!("{}: fault: {fault}", self.name);
        self.stats.faults += 1;
        self.last_fault = Some(fault);
        self.status = CpuStatus::Running;
        self.suspend();
    }

    // ---- timing path -------------------------------------------------------

    /// Translate the pc and send the instruction-fetch packet.
    pub(crate) fn fetch(&mut self) {
        self.fetch_event = None;
        if self.status != CpuStatus::Running {
            return;
        }
        let now = self.now();
        let mut req = request::Builder {
            vaddr: self.thread.pc,
            size: isa::INST_BYTES,
            flags: request::Flags::INSTRUCTION,
            pc: self.thread.pc,
            master: self.master,
            thread: self.cpu_id,
            issued: now,
        }
        .build();
        if let Err(fault) = self.mmu.setup_fetch_request(&mut req) {
            self.handle_fault(fault);
            return;
        }
        let mut pkt = Packet::new(Arc::new(req), Command::ReadReq);
        pkt.allocate();
        self.count_cycles(now);
        self.wait_started = now;
        match self.icache_port.send_timing(pkt) {
            Ok(()) => self.status = CpuStatus::IcacheWaitResponse,
            Err(pkt) => {
                self.status = CpuStatus::IcacheRetry;
                self.ifetch_pkt = Some(pkt);
            }
        }
    }

    /// Execute the fetched instruction; memory references continue in the
    /// dcache response path.
    fn complete_ifetch(&mut self, pkt: Packet) {
        assert_eq!(self.status, CpuStatus::IcacheWaitResponse);
        self.status = CpuStatus::Running;
        let now = self.now();
        self.count_cycles(now);
        self.stats.icache_waits += now - self.wait_started;

        if pkt.result == PacketResult::BadAddress {
            self.handle_fault(Fault::BadAddress {
                addr: pkt.req.vaddr,
            });
            return;
        }
        assert_eq!(pkt.result, PacketResult::Success);

        if self.drain == DrainState::Draining {
            self.complete_drain();
            return;
        }

        let word = u64::from_le_bytes(pkt.data().try_into().expect("short fetch payload"));
        let inst = match StaticInst::decode(word, self.thread.pc) {
            Ok(inst) => inst,
            Err(fault) => {
                self.handle_fault(fault);
                return;
            }
        };
        self.cur_inst = Some(inst);

        if inst.is_mem_ref() {
            if let Err(fault) = self.initiate_mem_access(inst) {
                self.handle_fault(fault);
                return;
            }
            if self.status == CpuStatus::Running {
                // the access was elided (failed store-conditional)
                self.advance_inst(self.thread.pc + u64::from(isa::INST_BYTES));
            }
        } else if inst.op == Opcode::Halt {
            self.stats.insts += 1;
            self.suspend();
        } else {
            let next = inst.execute(&mut self.thread);
            self.advance_inst(next);
        }
    }

    /// Build and send the data packet for a load or store.
    fn initiate_mem_access(&mut self, inst: StaticInst) -> Result<(), Fault> {
        let now = self.now();
        let ea = inst.effective_addr(&self.thread);
        let locked = matches!(inst.op, Opcode::LoadLocked | Opcode::StoreCond);

        if inst.op == Opcode::StoreCond && self.thread.locked_addr != Some(ea) {
            // lost the reservation: fail locally, no packet
            self.thread.write_reg(inst.rd, 0);
            self.thread.locked_addr = None;
            return Ok(());
        }

        let mut flags = request::Flags::empty();
        if locked {
            flags |= request::Flags::LOCKED;
        }
        let mut req = request::Builder {
            vaddr: ea,
            size: 8,
            flags,
            pc: self.thread.pc,
            master: self.master,
            thread: self.cpu_id,
            issued: now,
        }
        .build();

        let pkt = if inst.is_load() {
            self.mmu.translate_data_read(&mut req)?;
            let mut pkt = Packet::new(Arc::new(req), Command::ReadReq);
            pkt.allocate();
            pkt
        } else {
            self.mmu.translate_data_write(&mut req)?;
            let mut pkt = Packet::new(Arc::new(req), Command::WriteReq);
            pkt.set_data(&self.thread.read_reg(inst.rs2).to_le_bytes());
            pkt
        };

        assert!(self.dcache_pkt.is_none());
        self.wait_started = now;
        match self.dcache_port.send_timing(pkt) {
            Ok(()) => self.status = CpuStatus::DcacheWaitResponse,
            Err(pkt) => {
                self.status = CpuStatus::DcacheRetry;
                self.dcache_pkt = Some(pkt);
            }
        }
        Ok(())
    }

    /// Finalize the memory instruction once the dcache answers.
    fn complete_data_access(&mut self, pkt: Packet) {
        assert_eq!(self.status, CpuStatus::DcacheWaitResponse);
        self.status = CpuStatus::Running;
        let now = self.now();
        self.count_cycles(now);
        self.stats.dcache_waits += now - self.wait_started;

        if pkt.result == PacketResult::BadAddress {
            self.handle_fault(Fault::BadAddress {
                addr: pkt.req.vaddr,
            });
            return;
        }
        assert_eq!(pkt.result, PacketResult::Success);

        let inst = self.cur_inst.expect("data response without an instruction");
        match inst.op {
            Opcode::Load => {
                let value = u64::from_le_bytes(pkt.data().try_into().expect("short load payload"));
                self.thread.write_reg(inst.rd, value);
            }
            Opcode::LoadLocked => {
                let value = u64::from_le_bytes(pkt.data().try_into().expect("short load payload"));
                self.thread.write_reg(inst.rd, value);
                self.thread.locked_addr = Some(pkt.req.vaddr);
            }
            Opcode::Store => {}
            Opcode::StoreCond => {
                let success = pkt.req.sc_result().unwrap_or(false);
                self.thread.write_reg(inst.rd, u64::from(success));
                self.thread.locked_addr = None;
            }
            other => unreachable!("data response for {other:?}"),
        }

        let next = self.thread.pc + u64::from(isa::INST_BYTES);
        if self.drain == DrainState::Draining {
            self.stats.insts += 1;
            self.thread.pc = next;
            self.complete_drain();
            return;
        }
        self.advance_inst(next);
    }

    /// Retire the instruction, advance the pc, and keep the loop running by
    /// fetching again.
    fn advance_inst(&mut self, next_pc: crate::address) {
        self.stats.insts += 1;
        self.thread.pc = next_pc;
        if let Some(max) = self.params.max_insts {
            if self.stats.insts >= max {
                log::debug!("{}: reached {max} instructions", self.name);
                self.suspend();
                return;
            }
        }
        if self.status == CpuStatus::Running {
            self.fetch();
        }
    }

    /// Handler for responses that were held for the next clock edge.
    pub(crate) fn clock_edge(&mut self, pkt: Packet) {
        if pkt.req.is_instruction() {
            self.complete_ifetch(pkt);
        } else {
            self.complete_data_access(pkt);
        }
    }

    // ---- atomic mode -------------------------------------------------------

    /// One fetch-execute step with synchronous memory accesses; false once
    /// the thread halts or faults.
    pub fn step_atomic(&mut self) -> bool {
        if self.status != CpuStatus::Running {
            return false;
        }
        let now = self.now();
        let mut latency: Tick = 1;

        let mut ifetch_req = request::Builder {
            vaddr: self.thread.pc,
            size: isa::INST_BYTES,
            flags: request::Flags::INSTRUCTION,
            pc: self.thread.pc,
            master: self.master,
            thread: self.cpu_id,
            issued: now,
        }
        .build();
        if let Err(fault) = self.mmu.setup_fetch_request(&mut ifetch_req) {
            self.handle_fault(fault);
            return false;
        }
        let mut ifetch_pkt = Packet::new(Arc::new(ifetch_req), Command::ReadReq);
        ifetch_pkt.allocate();
        latency += self.icache_port.send_atomic(&mut ifetch_pkt);

        let word = u64::from_le_bytes(ifetch_pkt.data().try_into().expect("short fetch payload"));
        let inst = match StaticInst::decode(word, self.thread.pc) {
            Ok(inst) => inst,
            Err(fault) => {
                self.handle_fault(fault);
                return false;
            }
        };

        let next_pc = if inst.is_mem_ref() {
            match self.atomic_mem_access(inst, &mut latency) {
                Ok(()) => self.thread.pc + u64::from(isa::INST_BYTES),
                Err(fault) => {
                    self.handle_fault(fault);
                    return false;
                }
            }
        } else if inst.op == Opcode::Halt {
            self.stats.insts += 1;
            self.stats.cycles += latency;
            self.suspend();
            return false;
        } else {
            inst.execute(&mut self.thread)
        };

        self.stats.insts += 1;
        self.stats.cycles += latency;
        self.thread.pc = next_pc;
        if let Some(max) = self.params.max_insts {
            if self.stats.insts >= max {
                self.suspend();
                return false;
            }
        }
        true
    }

    fn atomic_mem_access(&mut self, inst: StaticInst, latency: &mut Tick) -> Result<(), Fault> {
        let now = self.now();
        let ea = inst.effective_addr(&self.thread);
        let locked = matches!(inst.op, Opcode::LoadLocked | Opcode::StoreCond);

        if inst.op == Opcode::StoreCond && self.thread.locked_addr != Some(ea) {
            self.thread.write_reg(inst.rd, 0);
            self.thread.locked_addr = None;
            return Ok(());
        }

        let mut flags = request::Flags::empty();
        if locked {
            flags |= request::Flags::LOCKED;
        }
        let mut req = request::Builder {
            vaddr: ea,
            size: 8,
            flags,
            pc: self.thread.pc,
            master: self.master,
            thread: self.cpu_id,
            issued: now,
        }
        .build();

        if inst.is_load() {
            self.mmu.translate_data_read(&mut req)?;
            let mut pkt = Packet::new(Arc::new(req), Command::ReadReq);
            pkt.allocate();
            *latency += self.dcache_port.send_atomic(&mut pkt);
            let value = u64::from_le_bytes(pkt.data().try_into().expect("short load payload"));
            self.thread.write_reg(inst.rd, value);
            if inst.op == Opcode::LoadLocked {
                self.thread.locked_addr = Some(pkt.req.vaddr);
            }
        } else {
            self.mmu.translate_data_write(&mut req)?;
            let mut pkt = Packet::new(Arc::new(req), Command::WriteReq);
            pkt.set_data(&self.thread.read_reg(inst.rs2).to_le_bytes());
            *latency += self.dcache_port.send_atomic(&mut pkt);
            if inst.op == Opcode::StoreCond {
                let success = pkt.req.sc_result().unwrap_or(true);
                self.thread.write_reg(inst.rd, u64::from(success));
                self.thread.locked_addr = None;
            }
        }
        Ok(())
    }
}

impl Device for TimingCpu {
    fn name(&self) -> &str {
        &self.name
    }

    fn recv_timing(&mut self, side: Side, pkt: Packet) -> Result<(), Packet> {
        if !pkt.is_response() {
            // snooped coherence request broadcast to everyone: nothing to do
            return Ok(());
        }
        let now = self.now();
        let edge = self.next_cycle(now);
        if edge == now {
            match side {
                Side::Icache => self.complete_ifetch(pkt),
                Side::Dcache => self.complete_data_access(pkt),
                other => panic!("{}: response on unknown side {other:?}", self.name),
            }
        } else {
            // hold the response until the next CPU clock edge
            let cpu = self.arc();
            self.scheduler.schedule(Event::CpuTick { cpu, pkt }, edge);
        }
        Ok(())
    }

    fn recv_retry(&mut self, side: Side) {
        match side {
            Side::Icache => {
                let pkt = self
                    .ifetch_pkt
                    .take()
                    .expect("icache retry without a held packet");
                assert_eq!(self.status, CpuStatus::IcacheRetry);
                match self.icache_port.send_timing(pkt) {
                    Ok(()) => self.status = CpuStatus::IcacheWaitResponse,
                    Err(pkt) => self.ifetch_pkt = Some(pkt),
                }
            }
            Side::Dcache => {
                let pkt = self
                    .dcache_pkt
                    .take()
                    .expect("dcache retry without a held packet");
                assert_eq!(self.status, CpuStatus::DcacheRetry);
                match self.dcache_port.send_timing(pkt) {
                    Ok(()) => self.status = CpuStatus::DcacheWaitResponse,
                    Err(pkt) => self.dcache_pkt = Some(pkt),
                }
            }
            other => panic!("{}: retry on unknown side {other:?}", self.name),
        }
    }

    fn recv_atomic(&mut self, _side: Side, _pkt: &mut Packet) -> Tick {
        panic!("{}: TimingCpu doesn't expect recv_atomic callbacks", self.name);
    }

    fn recv_functional(&mut self, _side: Side, _pkt: &mut Packet) {
        // no internal storage to update
    }
}

#[cfg(test)]
mod tests {
    use super::{CpuStatus, TimingCpu};
    use crate::config::CpuParams;
    use crate::engine::{Event, EventQueue, Tick};
    use crate::isa::{DirectMmu, StaticInst};
    use crate::port::{Device, Peer, Side};
    use crate::sync::{Arc, Mutex};
    use crate::testing::{self, Capture};

    fn cpu_with_stub_ports(
        clock: Tick,
    ) -> (
        Arc<Mutex<TimingCpu>>,
        Arc<Mutex<Capture>>,
        Arc<EventQueue>,
    ) {
        testing::init_logs();
        let queue = EventQueue::new();
        let mmu = DirectMmu {
            base: 0,
            size: 0x10000,
        };
        let cpu = TimingCpu::new(
            "cpu0",
            CpuParams {
                clock,
                max_insts: None,
            },
            Box::new(mmu),
            queue.clone(),
            0,
            0,
            0x100,
        );
        let icache = Capture::new("icache");
        let dcache = Capture::new("dcache");
        {
            let guard = cpu.lock();
            guard.icache_port.bind(Peer {
                device: icache.clone(),
                side: Side::Mem(0),
            });
            guard.dcache_port.bind(Peer {
                device: dcache.clone(),
                side: Side::Mem(1),
            });
        }
        (cpu, icache, queue)
    }

    fn halt_response(mut fetch: crate::packet::Packet) -> crate::packet::Packet {
        fetch.set_data(&StaticInst::halt().encode().to_le_bytes());
        fetch.make_response();
        fetch
    }

    #[test]
    fn test_blocked_fetch_holds_packet_until_retry() {
        let (cpu, icache, queue) = cpu_with_stub_ports(1);
        icache.lock().accept = false;

        cpu.lock().activate(0);
        queue.run();
        assert_eq!(cpu.lock().status(), CpuStatus::IcacheRetry);
        assert_eq!(icache.lock().refused, 1);

        icache.lock().accept = true;
        cpu.lock().recv_retry(Side::Icache);
        assert_eq!(cpu.lock().status(), CpuStatus::IcacheWaitResponse);

        let resp = halt_response(icache.lock().received.remove(0));
        assert!(cpu.lock().recv_timing(Side::Icache, resp).is_ok());
        // the halt suspended the thread
        assert_eq!(cpu.lock().status(), CpuStatus::Idle);
        assert_eq!(cpu.lock().stats.insts, 1);
    }

    #[test]
    fn test_response_held_until_clock_edge() {
        let (cpu, icache, queue) = cpu_with_stub_ports(10);
        cpu.lock().activate(0);
        queue.run();
        assert_eq!(cpu.lock().status(), CpuStatus::IcacheWaitResponse);

        // a response arriving mid-cycle is processed at the next edge
        let resp = halt_response(icache.lock().received.remove(0));
        let dst = Peer {
            device: cpu.clone(),
            side: Side::Icache,
        };
        queue.schedule(Event::Deliver { dst, pkt: resp }, 3);
        queue.run();

        assert_eq!(queue.current_tick(), 10);
        assert_eq!(cpu.lock().status(), CpuStatus::Idle);
        assert_eq!(cpu.lock().stats.insts, 1);
    }

    #[test]
    fn test_switch_out_deschedules_pending_fetch() {
        let (cpu, icache, queue) = cpu_with_stub_ports(1);
        cpu.lock().activate(5);
        cpu.lock().switch_out();
        queue.run();

        assert_eq!(cpu.lock().status(), CpuStatus::SwitchedOut);
        assert!(icache.lock().received.is_empty());
    }

    #[test]
    #[should_panic(expected = "suspend while")]
    fn test_suspend_while_waiting_is_a_bug() {
        let (cpu, _icache, queue) = cpu_with_stub_ports(1);
        cpu.lock().activate(0);
        queue.run();
        assert_eq!(cpu.lock().status(), CpuStatus::IcacheWaitResponse);
        cpu.lock().suspend();
    }
}
