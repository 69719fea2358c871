use crate::packet::Packet;
use crate::sync::{Arc, Mutex};
use crate::Tick;
use once_cell::sync::OnceCell;

/// Which port of a device a packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The port of a cache facing its masters.
    CpuSide,
    /// The port of a cache facing the next memory level.
    MemSide,
    /// The instruction port of a CPU.
    Icache,
    /// The data port of a CPU.
    Dcache,
    /// A numbered port of a memory device.
    Mem(u8),
}

/// A component reachable through ports.
///
/// Handlers run to completion before any other event is dispatched; a
/// handler's view of global state is a snapshot. Locks are taken strictly
/// downstream (cpu before cache before memory), so a handler must never
/// send toward its own masters synchronously; upward traffic is scheduled.
pub trait Device: Send {
    fn name(&self) -> &str;

    /// Receive a timing-mode packet. `Ok(())` takes ownership; `Err` hands
    /// the packet back to a sender that must retry later.
    fn recv_timing(&mut self, side: Side, pkt: Packet) -> Result<(), Packet>;

    /// A peer that previously refused a packet is ready again.
    fn recv_retry(&mut self, side: Side);

    /// Service a packet synchronously, returning the accumulated latency.
    fn recv_atomic(&mut self, side: Side, pkt: &mut Packet) -> Tick;

    /// Read or write state without any effect on timing.
    fn recv_functional(&mut self, side: Side, pkt: &mut Packet);
}

pub type DeviceRef = Arc<Mutex<dyn Device>>;

/// The far end of a port: a device and the side to address it on.
#[derive(Clone)]
pub struct Peer {
    pub device: DeviceRef,
    pub side: Side,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Peer").field("side", &self.side).finish()
    }
}

/// A bidirectional endpoint with a single peer, set once during wiring.
///
/// All three transport modes run over the same pair of ports; the mode is a
/// property of the system at a given instant, not of the port.
#[derive(Debug, Default)]
pub struct Port {
    label: String,
    peer: OnceCell<Peer>,
}

impl Port {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            peer: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.peer.get().is_some()
    }

    pub fn bind(&self, peer: Peer) {
        assert!(
            self.peer.set(peer).is_ok(),
            "port {} is already bound",
            self.label
        );
    }

    #[must_use]
    pub fn peer(&self) -> &Peer {
        self.peer
            .get()
            .unwrap_or_else(|| panic!("port {} has no peer", self.label))
    }

    /// Try to hand a packet to the peer. On `Ok` ownership has moved and the
    /// sender must drop its reference; on `Err` the peer is blocked and the
    /// sender holds the packet until the peer signals a retry.
    pub fn send_timing(&self, pkt: Packet) -> Result<(), Packet> {
        let peer = self.peer();
        log::trace!("{}::send_timing({pkt})", self.label);
        peer.device.lock().recv_timing(peer.side, pkt)
    }

    /// Service a packet synchronously through the peer, including any
    /// recursive downstream accesses, and return the cumulative latency.
    pub fn send_atomic(&self, pkt: &mut Packet) -> Tick {
        let peer = self.peer();
        log::trace!("{}::send_atomic({pkt})", self.label);
        peer.device.lock().recv_atomic(peer.side, pkt)
    }

    /// Read or write memory state through the peer without touching timing.
    pub fn send_functional(&self, pkt: &mut Packet) {
        let peer = self.peer();
        log::trace!("{}::send_functional({pkt})", self.label);
        peer.device.lock().recv_functional(peer.side, pkt);
    }
}

/// Wire two endpoints together in both directions.
pub fn connect(a: (&Port, DeviceRef, Side), b: (&Port, DeviceRef, Side)) {
    let (port_a, dev_a, side_a) = a;
    let (port_b, dev_b, side_b) = b;
    port_a.bind(Peer {
        device: dev_b,
        side: side_b,
    });
    port_b.bind(Peer {
        device: dev_a,
        side: side_a,
    });
}
