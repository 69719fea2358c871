use crate::cache::MshrId;
use crate::request::Request;
use crate::sync::{atomic, Arc};
use crate::{address, Tick};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Memory system command carried by a packet.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::EnumCount,
    strum::EnumIter,
)]
pub enum Command {
    ReadReq,
    WriteReq,
    WritebackReq,
    ReadExReq,
    UpgradeReq,
    InvalidateReq,
    WriteInvalidateReq,
    HardPFReq,
    ReadResp,
    WriteResp,
    UpgradeResp,
    HardPFResp,
}

impl Command {
    #[must_use]
    pub fn is_read(self) -> bool {
        matches!(self, Self::ReadReq | Self::ReadExReq | Self::HardPFReq)
    }

    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::WriteReq | Self::WritebackReq | Self::WriteInvalidateReq
        )
    }

    /// Commands that force other caches to give up the line.
    #[must_use]
    pub fn is_invalidate(self) -> bool {
        matches!(
            self,
            Self::ReadExReq | Self::UpgradeReq | Self::InvalidateReq | Self::WriteInvalidateReq
        )
    }

    #[must_use]
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::ReadResp | Self::WriteResp | Self::UpgradeResp | Self::HardPFResp
        )
    }

    #[must_use]
    pub fn needs_response(self) -> bool {
        matches!(
            self,
            Self::ReadReq
                | Self::WriteReq
                | Self::ReadExReq
                | Self::UpgradeReq
                | Self::WriteInvalidateReq
        )
    }

    /// The response command matching this request command.
    #[must_use]
    pub fn response(self) -> Option<Command> {
        match self {
            Self::ReadReq | Self::ReadExReq => Some(Self::ReadResp),
            Self::WriteReq | Self::WriteInvalidateReq => Some(Self::WriteResp),
            Self::UpgradeReq => Some(Self::UpgradeResp),
            Self::HardPFReq => Some(Self::HardPFResp),
            _ => None,
        }
    }

    /// Whether packets of this command carry a payload.
    #[must_use]
    pub fn has_data(self) -> bool {
        self.is_write() || matches!(self, Self::ReadResp | Self::UpgradeResp | Self::HardPFResp)
    }

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

bitflags::bitflags! {
    /// Per-packet state bits, mutated as the packet moves through the system.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u32 {
        /// The request has been serviced; the holder may consume the packet.
        const SATISFIED = 1 << 0;
        /// A snooping cache refused to supply the line right now.
        const NACKED_LINE = 1 << 1;
        /// Another cache holds a copy; the line must be filled shared.
        const SHARED_LINE = 1 << 2;
        /// The bus has committed to this snoop; receivers must act on it.
        const SNOOP_COMMIT = 1 << 3;
        /// The packet transports a whole cache block for a fill.
        const CACHE_LINE_FILL = 1 << 4;
        /// The response must not be installed in the cache.
        const NO_ALLOCATE = 1 << 5;
    }
}

/// Delivery outcome recorded on a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketResult {
    #[default]
    Pending,
    Success,
    BadAddress,
    Nacked,
}

static PACKET_UID: Lazy<atomic::AtomicU64> = Lazy::new(|| atomic::AtomicU64::new(0));

fn next_uid() -> u64 {
    PACKET_UID.fetch_add(1, atomic::Ordering::SeqCst)
}

/// An owned message between ports: a command applied to an address range,
/// plus the request it services and an optional payload.
///
/// A packet belongs to exactly one actor at a time. A successful timing send
/// moves it to the receiver; a refused send hands it back to the sender.
#[derive(Debug)]
pub struct Packet {
    pub uid: u64,
    pub cmd: Command,
    pub req: Arc<Request>,
    /// Physical address targeted by this packet. May differ from the
    /// request address once a cache widens the packet to a whole block.
    pub addr: address,
    pub size: u32,
    pub flags: Flags,
    pub result: PacketResult,
    /// Back-reference to the miss this packet is in flight for.
    pub sender_state: Option<MshrId>,
    /// Earliest tick at which the packet may be delivered.
    pub time: Tick,
    data: Option<Vec<u8>>,
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}@{:#x}+{}", self.cmd, self.addr, self.size)
    }
}

impl Packet {
    #[must_use]
    pub fn new(req: Arc<Request>, cmd: Command) -> Self {
        Self {
            uid: next_uid(),
            cmd,
            addr: req.paddr,
            size: req.size,
            flags: Flags::empty(),
            result: PacketResult::Pending,
            sender_state: None,
            time: 0,
            data: None,
            req,
        }
    }

    /// Widen the packet to cover the whole block containing its address.
    #[must_use]
    pub fn with_block(mut self, block_addr: address, block_size: u32) -> Self {
        self.addr = block_addr;
        self.size = block_size;
        self
    }

    /// Attach a zero-initialized owned payload.
    pub fn allocate(&mut self) {
        if self.data.is_none() {
            self.data = Some(vec![0; self.size as usize]);
        }
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data
            .as_deref()
            .unwrap_or_else(|| panic!("{self} has no payload"))
    }

    #[must_use]
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.allocate();
        self.data.as_deref_mut().unwrap()
    }

    pub fn set_data(&mut self, bytes: &[u8]) {
        assert_eq!(bytes.len(), self.size as usize, "{self} payload size");
        self.data = Some(bytes.to_vec());
    }

    /// Take the payload out, leaving the packet dataless.
    #[must_use]
    pub fn take_data(&mut self) -> Option<Vec<u8>> {
        self.data.take()
    }

    #[must_use]
    pub fn is_read(&self) -> bool {
        self.cmd.is_read()
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.cmd.is_write()
    }

    #[must_use]
    pub fn is_invalidate(&self) -> bool {
        self.cmd.is_invalidate()
    }

    #[must_use]
    pub fn is_response(&self) -> bool {
        self.cmd.is_response()
    }

    #[must_use]
    pub fn needs_response(&self) -> bool {
        self.cmd.needs_response()
    }

    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.flags.contains(Flags::SATISFIED)
    }

    #[must_use]
    pub fn is_cache_fill(&self) -> bool {
        self.flags.contains(Flags::CACHE_LINE_FILL)
    }

    #[must_use]
    pub fn is_no_allocate(&self) -> bool {
        self.flags.contains(Flags::NO_ALLOCATE)
    }

    /// Convert a request packet into its response in place, preserving
    /// identity, flags and payload.
    pub fn make_response(&mut self) {
        if self.is_response() {
            return;
        }
        let resp = self
            .cmd
            .response()
            .unwrap_or_else(|| panic!("{self} cannot become a response"));
        self.cmd = resp;
        self.result = PacketResult::Success;
    }

    /// Whether the address ranges of two packets overlap.
    #[must_use]
    pub fn intersect(&self, other: &Packet) -> bool {
        let a_end = self.addr + u64::from(self.size);
        let b_end = other.addr + u64::from(other.size);
        self.addr < b_end && other.addr < a_end
    }
}

/// Byte range shared by two packets: offsets into each payload plus length.
#[must_use]
pub fn overlap(a: &Packet, b: &Packet) -> Option<(usize, usize, usize)> {
    let start = a.addr.max(b.addr);
    let end = (a.addr + u64::from(a.size)).min(b.addr + u64::from(b.size));
    if start >= end {
        return None;
    }
    let len = (end - start) as usize;
    Some(((start - a.addr) as usize, (start - b.addr) as usize, len))
}

/// Reconcile a functional probe with one in-flight packet.
///
/// Read probes pull overlapping bytes out of in-flight writes and responses;
/// write probes push their bytes into overlapping in-flight copies so no
/// stale payload survives. Returns true when the probe gained bytes, along
/// with the byte range of the probe that was covered.
pub fn fix_packet(probe: &mut Packet, inflight: &mut Packet) -> Option<(usize, usize)> {
    let (po, io, len) = overlap(probe, inflight)?;
    if probe.is_read() && inflight.has_data() && (inflight.is_write() || inflight.is_response()) {
        let bytes = inflight.data()[io..io + len].to_vec();
        probe.data_mut()[po..po + len].copy_from_slice(&bytes);
        Some((po, len))
    } else if probe.is_write() && inflight.has_data() {
        let bytes = probe.data()[po..po + len].to_vec();
        inflight.data_mut()[io..io + len].copy_from_slice(&bytes);
        None
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{fix_packet, Command, Flags, Packet};
    use crate::request;
    use crate::sync::Arc;

    fn pkt(cmd: Command, addr: u64, size: u32) -> Packet {
        let req = Arc::new(request::Builder {
            vaddr: addr,
            size,
            ..request::Builder::default()
        }.build());
        Packet::new(req, cmd)
    }

    #[test]
    fn test_response_conversion_preserves_identity() {
        let mut p = pkt(Command::ReadReq, 0x100, 8);
        let uid = p.uid;
        p.flags.insert(Flags::CACHE_LINE_FILL);
        p.make_response();
        assert_eq!(p.cmd, Command::ReadResp);
        assert_eq!(p.uid, uid);
        assert!(p.is_cache_fill());
    }

    #[test]
    fn test_intersect() {
        let a = pkt(Command::ReadReq, 0x100, 8);
        let b = pkt(Command::WriteReq, 0x104, 8);
        let c = pkt(Command::WriteReq, 0x108, 8);
        assert!(a.intersect(&b));
        assert!(!a.intersect(&c));
        assert!(b.intersect(&c));
    }

    #[test]
    fn test_fix_packet_read_sees_inflight_write() {
        let mut probe = pkt(Command::ReadReq, 0x100, 8);
        probe.allocate();
        let mut write = pkt(Command::WriteReq, 0x104, 4);
        write.set_data(&[1, 2, 3, 4]);

        let covered = fix_packet(&mut probe, &mut write);
        assert_eq!(covered, Some((4, 4)));
        assert_eq!(&probe.data()[4..8], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_fix_packet_write_updates_inflight_copy() {
        let mut probe = pkt(Command::WriteReq, 0x100, 4);
        probe.set_data(&[9, 9, 9, 9]);
        let mut resp = pkt(Command::ReadReq, 0x100, 8);
        resp.make_response();
        resp.set_data(&[0; 8]);

        assert_eq!(fix_packet(&mut probe, &mut resp), None);
        assert_eq!(&resp.data()[0..4], &[9, 9, 9, 9]);
    }
}
