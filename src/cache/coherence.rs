use super::block::{CacheBlk, Status};
use super::mshr::Mshr;
use crate::config::Protocol;
use crate::packet::{Command, Flags, Packet};

/// Pluggable coherence driver consumed by the cache controller.
///
/// The driver is a pure function of the state it is handed; all queueing and
/// locking live in the cache itself.
pub trait CoherenceProtocol: Send {
    /// Translate a CPU-side command into the command placed on the bus,
    /// given the current state of the local copy.
    fn bus_cmd(&self, cmd: Command, status: Status) -> Command;

    /// State a line assumes once `pkt` (a response, or an invalidating
    /// request) is applied to a copy in state `old`.
    fn new_state(&self, pkt: &Packet, old: Status) -> Status;

    /// Decide a snooped bus request: whether this cache supplies the data,
    /// and the state the local copy transitions to.
    fn handle_bus_request(
        &self,
        pkt: &mut Packet,
        blk: Option<&CacheBlk>,
        mshr: Option<&Mshr>,
    ) -> (bool, Status);

    /// Forward an invalidate to caches above this one. No-op in a single
    /// level hierarchy.
    fn propagate_invalidate(&self, pkt: &Packet, timing: bool);

    /// Whether a full-block write miss may install its line locally without
    /// fetching it (WH64).
    fn allow_fast_writes(&self) -> bool;

    fn has_protocol(&self) -> bool;
}

#[must_use]
pub fn build(protocol: Protocol) -> Box<dyn CoherenceProtocol> {
    match protocol {
        Protocol::Uni => Box::new(Uni),
        Protocol::Msi => Box::new(Msi),
    }
}

/// Uniprocessor driver: nobody snoops, every fill arrives writable, and
/// full-block writes may allocate without a fetch.
#[derive(Debug, Default)]
pub struct Uni;

impl CoherenceProtocol for Uni {
    fn bus_cmd(&self, cmd: Command, _status: Status) -> Command {
        match cmd {
            // write misses fetch the line, the buffered write applies on fill
            Command::WriteReq | Command::WriteInvalidateReq | Command::HardPFReq => {
                Command::ReadReq
            }
            other => other,
        }
    }

    fn new_state(&self, pkt: &Packet, old: Status) -> Status {
        if pkt.is_response() {
            Status::VALID | Status::WRITABLE | Status::READABLE
        } else if pkt.is_invalidate() {
            Status::empty()
        } else {
            old
        }
    }

    fn handle_bus_request(
        &self,
        pkt: &mut Packet,
        blk: Option<&CacheBlk>,
        _mshr: Option<&Mshr>,
    ) -> (bool, Status) {
        let old = blk.map_or(Status::empty(), |b| b.status);
        if blk.is_some() && pkt.is_invalidate() {
            (false, Status::empty())
        } else {
            (false, old)
        }
    }

    fn propagate_invalidate(&self, pkt: &Packet, timing: bool) {
        log::trace!("uni::propagate_invalidate({pkt}, timing={timing}): no upper level");
    }

    fn allow_fast_writes(&self) -> bool {
        true
    }

    fn has_protocol(&self) -> bool {
        false
    }
}

/// Snooping MSI with shared-line signalling.
///
/// A read response without SHARED_LINE grants an exclusive (writable) copy;
/// with it, a shared one. A write to a shared copy upgrades instead of
/// re-fetching. A dirty copy answering a plain read snoop keeps its dirty
/// bit while losing write permission, so the eventual eviction still writes
/// the line back.
#[derive(Debug, Default)]
pub struct Msi;

impl CoherenceProtocol for Msi {
    fn bus_cmd(&self, cmd: Command, status: Status) -> Command {
        match cmd {
            Command::ReadReq | Command::HardPFReq => Command::ReadReq,
            Command::WriteReq | Command::WriteInvalidateReq => {
                if status.contains(Status::VALID) {
                    // valid but not writable: ask only for permission
                    Command::UpgradeReq
                } else {
                    Command::ReadExReq
                }
            }
            other => other,
        }
    }

    fn new_state(&self, pkt: &Packet, old: Status) -> Status {
        match pkt.cmd {
            Command::ReadResp | Command::HardPFResp => {
                if pkt.flags.contains(Flags::SHARED_LINE) {
                    Status::VALID | Status::READABLE
                } else {
                    Status::VALID | Status::WRITABLE | Status::READABLE
                }
            }
            Command::UpgradeResp => old | Status::VALID | Status::WRITABLE | Status::READABLE,
            _ if pkt.is_invalidate() => Status::empty(),
            _ if pkt.is_read() => old & !Status::WRITABLE,
            _ => old,
        }
    }

    fn handle_bus_request(
        &self,
        pkt: &mut Packet,
        blk: Option<&CacheBlk>,
        _mshr: Option<&Mshr>,
    ) -> (bool, Status) {
        let Some(blk) = blk else {
            return (false, Status::empty());
        };
        let old = blk.status;

        if pkt.is_invalidate() {
            // a ReadEx wants the data too if we are the owner
            let supply = pkt.is_read() && blk.is_dirty();
            return (supply, Status::empty());
        }
        if pkt.is_read() {
            pkt.flags.insert(Flags::SHARED_LINE);
            return (blk.is_dirty(), old & !Status::WRITABLE);
        }
        (false, old)
    }

    fn propagate_invalidate(&self, pkt: &Packet, timing: bool) {
        log::trace!("msi::propagate_invalidate({pkt}, timing={timing}): no upper level");
    }

    fn allow_fast_writes(&self) -> bool {
        false
    }

    fn has_protocol(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{CoherenceProtocol, Msi, Status, Uni};
    use crate::packet::{Command, Flags};
    use crate::testing;

    #[test]
    fn test_uni_fills_are_writable() {
        let uni = Uni;
        let mut resp = testing::read_pkt(0x1000, 64);
        resp.make_response();
        let state = uni.new_state(&resp, Status::empty());
        assert!(state.contains(Status::VALID | Status::WRITABLE | Status::READABLE));
        assert!(uni.allow_fast_writes());
        assert!(!uni.has_protocol());
    }

    #[test]
    fn test_msi_write_miss_commands() {
        let msi = Msi;
        // invalid copy: fetch with intent to modify
        assert_eq!(
            msi.bus_cmd(Command::WriteReq, Status::empty()),
            Command::ReadExReq
        );
        // shared copy: permission only
        assert_eq!(
            msi.bus_cmd(Command::WriteReq, Status::VALID | Status::READABLE),
            Command::UpgradeReq
        );
    }

    #[test]
    fn test_msi_shared_line_forces_shared_fill() {
        let msi = Msi;
        let mut resp = testing::read_pkt(0x1000, 64);
        resp.make_response();

        let exclusive = msi.new_state(&resp, Status::empty());
        assert!(exclusive.contains(Status::WRITABLE));

        resp.flags.insert(Flags::SHARED_LINE);
        let shared = msi.new_state(&resp, Status::empty());
        assert!(shared.contains(Status::VALID | Status::READABLE));
        assert!(!shared.contains(Status::WRITABLE));
    }

    #[test]
    fn test_msi_dirty_copy_supplies_read_snoop() {
        let msi = Msi;
        let mut blk = crate::cache::CacheBlk::new(0, 0, 64);
        blk.status = Status::VALID | Status::WRITABLE | Status::READABLE | Status::DIRTY;

        let mut snoop = testing::read_pkt(0x1000, 64);
        let (supply, state) = msi.handle_bus_request(&mut snoop, Some(&blk), None);
        assert!(supply);
        assert!(snoop.flags.contains(Flags::SHARED_LINE));
        // loses write permission, keeps the dirty bit for later writeback
        assert!(!state.contains(Status::WRITABLE));
        assert!(state.contains(Status::DIRTY));
    }

    #[test]
    fn test_msi_invalidate_snoop_clears_state() {
        let msi = Msi;
        let mut blk = crate::cache::CacheBlk::new(0, 0, 64);
        blk.status = Status::VALID | Status::READABLE;

        let mut snoop = testing::read_pkt(0x1000, 64);
        snoop.cmd = Command::InvalidateReq;
        let (supply, state) = msi.handle_bus_request(&mut snoop, Some(&blk), None);
        assert!(!supply);
        assert!(state.is_empty());
    }
}
