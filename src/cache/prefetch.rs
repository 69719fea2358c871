use crate::config::PrefetchParams;
use crate::packet::Packet;
use crate::address;

/// Observes the access stream and proposes speculative fills. The cache
/// issues the proposals through its MSHR queue when capacity allows.
pub trait Prefetcher: Send {
    fn observe(&mut self, pkt: &Packet) -> Vec<address>;
}

/// Next-line prefetcher: a trigger access to line N proposes lines
/// N+1..=N+degree.
#[derive(Debug)]
pub struct TaggedPrefetcher {
    name: String,
    block_size: u32,
    degree: usize,
}

impl TaggedPrefetcher {
    #[must_use]
    pub fn new(name: &str, block_size: u32, params: PrefetchParams) -> Self {
        Self {
            name: format!("{name}.prefetcher"),
            block_size,
            degree: params.degree,
        }
    }
}

impl Prefetcher for TaggedPrefetcher {
    fn observe(&mut self, pkt: &Packet) -> Vec<address> {
        if pkt.req.is_prefetch() {
            return Vec::new();
        }
        let line = crate::block_align(pkt.addr, self.block_size);
        let lines: Vec<address> = (1..=self.degree as u64)
            .map(|n| line + n * u64::from(self.block_size))
            .collect();
        log::trace!("{}::observe({pkt}) => {lines:x?}", self.name);
        lines
    }
}
