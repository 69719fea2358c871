use crate::cache::Cache;
use crate::cpu::TimingCpu;
use crate::memory::PhysicalMemory;
use crate::packet::Packet;
use crate::port::Peer;
use crate::sync::{Arc, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// Virtual time in simulator ticks.
pub type Tick = u64;

/// Handle for a scheduled event, usable to deschedule it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

/// A scheduled piece of work, naming its target component and handler.
///
/// Delivery calls a named handler on a known component; events are never
/// type-erased callbacks.
pub enum Event {
    /// Hand a timing packet to a port peer.
    Deliver { dst: Peer, pkt: Packet },
    /// Tell a sender that previously got refused to try again.
    Retry { dst: Peer },
    /// Start an instruction fetch.
    Fetch { cpu: Arc<Mutex<TimingCpu>> },
    /// Process a response that was held for the next CPU clock edge.
    CpuTick {
        cpu: Arc<Mutex<TimingCpu>>,
        pkt: Packet,
    },
    /// Move the next miss or writeback of a cache onto its mem-side port.
    SendMiss { cache: Arc<Mutex<Cache>> },
    /// A memory device finished one in-flight request.
    MemComplete { mem: Arc<Mutex<PhysicalMemory>> },
}

impl Event {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Event::Deliver { .. } => "Deliver",
            Event::Retry { .. } => "Retry",
            Event::Fetch { .. } => "Fetch",
            Event::CpuTick { .. } => "CpuTick",
            Event::SendMiss { .. } => "SendMiss",
            Event::MemComplete { .. } => "MemComplete",
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

struct Scheduled {
    when: Tick,
    seq: u64,
    id: u64,
    event: Event,
}

// Min-heap on (when, seq): same-tick events fire in scheduling order.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.when, other.seq).cmp(&(self.when, self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.when, self.seq) == (other.when, other.seq)
    }
}

impl Eq for Scheduled {}

#[derive(Default)]
struct Inner {
    now: Tick,
    next_seq: u64,
    next_id: u64,
    heap: BinaryHeap<Scheduled>,
    cancelled: HashSet<u64>,
}

/// The discrete-event queue that owns virtual time.
///
/// Single-threaded and cooperative: `step` pops one event and runs its
/// handler to completion before anything else is dispatched. The queue is
/// injected into every component that schedules; there is no global tick.
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<Inner>,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn current_tick(&self) -> Tick {
        self.inner.lock().now
    }

    /// Schedule `event` for `when`. Scheduling into the past is a bug.
    pub fn schedule(&self, event: Event, when: Tick) -> EventId {
        let mut q = self.inner.lock();
        assert!(
            when >= q.now,
            "scheduled {} for {when} in the past (now {})",
            event.name(),
            q.now
        );
        let id = q.next_id;
        q.next_id += 1;
        let seq = q.next_seq;
        q.next_seq += 1;
        log::trace!("schedule {} at {when} (now {})", event.name(), q.now);
        q.heap.push(Scheduled {
            when,
            seq,
            id,
            event,
        });
        EventId(id)
    }

    /// Cancel an event that has not fired yet. Only legal while the event is
    /// not currently executing.
    pub fn deschedule(&self, id: EventId) {
        self.inner.lock().cancelled.insert(id.0);
    }

    /// Tick of the next live event, if any.
    #[must_use]
    pub fn next_event_tick(&self) -> Option<Tick> {
        let mut q = self.inner.lock();
        loop {
            let (id, when) = match q.heap.peek() {
                None => return None,
                Some(top) => (top.id, top.when),
            };
            if q.cancelled.contains(&id) {
                q.heap.pop();
                q.cancelled.remove(&id);
                continue;
            }
            return Some(when);
        }
    }

    /// Number of live events still queued.
    #[must_use]
    pub fn pending(&self) -> usize {
        let q = self.inner.lock();
        q.heap
            .iter()
            .filter(|s| !q.cancelled.contains(&s.id))
            .count()
    }

    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.pending() == 0
    }

    /// Pop and dispatch one event; false when the queue has drained.
    pub fn step(&self) -> bool {
        let scheduled = {
            let mut q = self.inner.lock();
            loop {
                let Some(s) = q.heap.pop() else {
                    return false;
                };
                if q.cancelled.remove(&s.id) {
                    continue;
                }
                debug_assert!(s.when >= q.now);
                q.now = s.when;
                break s;
            }
        };
        log::trace!("tick {}: dispatch {}", scheduled.when, scheduled.event.name());
        self.dispatch(scheduled.event);
        true
    }

    /// Run until the queue drains; returns the final tick.
    pub fn run(&self) -> Tick {
        while self.step() {}
        self.current_tick()
    }

    /// Run events up to and including `tick`.
    pub fn run_until(&self, tick: Tick) {
        while matches!(self.next_event_tick(), Some(t) if t <= tick) {
            self.step();
        }
    }

    fn dispatch(&self, event: Event) {
        match event {
            Event::Deliver { dst, pkt } => {
                if let Err(pkt) = dst.device.lock().recv_timing(dst.side, pkt) {
                    panic!("peer refused a scheduled delivery of {pkt}");
                }
            }
            Event::Retry { dst } => dst.device.lock().recv_retry(dst.side),
            Event::Fetch { cpu } => cpu.lock().fetch(),
            Event::CpuTick { cpu, pkt } => cpu.lock().clock_edge(pkt),
            Event::SendMiss { cache } => cache.lock().transmit(),
            Event::MemComplete { mem } => mem.lock().complete_one(),
        }
    }
}
