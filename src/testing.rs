//! Test doubles and packet builders shared by the unit tests.

use crate::packet::{Command, Flags, Packet, PacketResult};
use crate::port::{Device, Side};
use crate::request;
use crate::sync::{Arc, Mutex};
use crate::{address, Tick};

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn request(addr: address, size: u32, flags: request::Flags) -> Arc<request::Request> {
    Arc::new(
        request::Builder {
            vaddr: addr,
            size,
            flags,
            ..request::Builder::default()
        }
        .build(),
    )
}

#[must_use]
pub fn read_pkt(addr: address, size: u32) -> Packet {
    let mut pkt = Packet::new(request(addr, size, request::Flags::empty()), Command::ReadReq);
    pkt.allocate();
    pkt
}

#[must_use]
pub fn write_pkt(addr: address, size: u32, data: &[u8]) -> Packet {
    let mut pkt = Packet::new(request(addr, size, request::Flags::empty()), Command::WriteReq);
    pkt.set_data(data);
    pkt
}

#[must_use]
pub fn prefetch_pkt(addr: address, size: u32) -> Packet {
    Packet::new(request(addr, size, request::Flags::PREFETCH), Command::HardPFReq)
}

#[must_use]
pub fn uncacheable_read(addr: address, size: u32) -> Packet {
    let mut pkt = Packet::new(
        request(addr, size, request::Flags::UNCACHEABLE),
        Command::ReadReq,
    );
    pkt.allocate();
    pkt
}

/// A committed snoop as a bus would present it.
#[must_use]
pub fn snoop_pkt(cmd: Command, addr: address, size: u32) -> Packet {
    let mut pkt = Packet::new(request(addr, size, request::Flags::empty()), cmd);
    pkt.flags.insert(Flags::SNOOP_COMMIT);
    if cmd.is_read() {
        pkt.allocate();
    }
    pkt
}

/// Turn a captured bus request into the fill response memory would send.
#[must_use]
pub fn fill_response(mut bus_pkt: Packet, byte: u8) -> Packet {
    let data = vec![byte; bus_pkt.size as usize];
    bus_pkt.set_data(&data);
    bus_pkt.make_response();
    bus_pkt
}

/// A device stub that records everything it is handed.
///
/// Stands in for a CPU above a cache or a bus/memory below one. Flip
/// `accept` to false to exercise the blocked/retry protocol.
pub struct Capture {
    pub name: String,
    pub accept: bool,
    pub received: Vec<Packet>,
    pub refused: usize,
    pub retries: usize,
    pub atomics: Vec<(Command, address, u32)>,
    pub functional: Vec<(Command, address)>,
}

impl Capture {
    #[must_use]
    pub fn new(name: &str) -> Arc<Mutex<Capture>> {
        Arc::new(Mutex::new(Capture {
            name: name.to_string(),
            accept: true,
            received: Vec::new(),
            refused: 0,
            retries: 0,
            atomics: Vec::new(),
            functional: Vec::new(),
        }))
    }
}

impl Device for Capture {
    fn name(&self) -> &str {
        &self.name
    }

    fn recv_timing(&mut self, _side: Side, pkt: Packet) -> Result<(), Packet> {
        if !self.accept {
            self.refused += 1;
            return Err(pkt);
        }
        self.received.push(pkt);
        Ok(())
    }

    fn recv_retry(&mut self, _side: Side) {
        self.retries += 1;
    }

    fn recv_atomic(&mut self, _side: Side, pkt: &mut Packet) -> Tick {
        self.atomics.push((pkt.cmd, pkt.addr, pkt.size));
        if pkt.is_read() {
            pkt.allocate();
        }
        if pkt.needs_response() {
            pkt.make_response();
        }
        pkt.result = PacketResult::Success;
        0
    }

    fn recv_functional(&mut self, _side: Side, pkt: &mut Packet) {
        self.functional.push((pkt.cmd, pkt.addr));
        if pkt.is_read() {
            pkt.allocate();
        }
        pkt.result = PacketResult::Success;
    }
}

/// Deterministic fill pattern: byte i of a block holds i.
#[must_use]
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}
