use crate::packet::Command;
use crate::MasterId;
use std::collections::HashMap;
use strum::{EnumCount as _, IntoEnumIterator};

/// One counter per packet command.
#[derive(Debug, Clone)]
pub struct CommandCounts([u64; Command::COUNT]);

impl Default for CommandCounts {
    fn default() -> Self {
        Self([0; Command::COUNT])
    }
}

impl CommandCounts {
    pub fn inc(&mut self, cmd: Command) {
        self.0[cmd.index()] += 1;
    }

    #[must_use]
    pub fn get(&self, cmd: Command) -> u64 {
        self.0[cmd.index()]
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    pub fn iter_nonzero(&self) -> impl Iterator<Item = (Command, u64)> + '_ {
        Command::iter()
            .map(|cmd| (cmd, self.get(cmd)))
            .filter(|&(_, count)| count > 0)
    }
}

/// Counters of one cache, exposed under component-qualified names
/// (`l1d.hits.ReadReq`).
#[derive(Debug, Clone)]
pub struct CacheStats {
    name: String,
    pub hits: CommandCounts,
    pub misses: CommandCounts,
    pub fast_writes: u64,
    pub writebacks: u64,
    /// Histogram of allocated MSHRs, sampled at each allocation.
    pub mshr_occupancy: Vec<u64>,
    /// Accesses per requesting master.
    pub masters: HashMap<MasterId, u64>,
}

impl CacheStats {
    #[must_use]
    pub fn new(name: &str, mshr_entries: usize) -> Self {
        Self {
            name: name.to_string(),
            hits: CommandCounts::default(),
            misses: CommandCounts::default(),
            fast_writes: 0,
            writebacks: 0,
            mshr_occupancy: vec![0; mshr_entries + 1],
            masters: HashMap::new(),
        }
    }

    pub fn inc_hit(&mut self, cmd: Command, master: MasterId) {
        self.hits.inc(cmd);
        *self.masters.entry(master).or_default() += 1;
    }

    pub fn inc_miss(&mut self, cmd: Command, master: MasterId) {
        self.misses.inc(cmd);
        *self.masters.entry(master).or_default() += 1;
    }

    pub fn sample_mshr_occupancy(&mut self, allocated: usize) {
        let top = self.mshr_occupancy.len() - 1;
        self.mshr_occupancy[allocated.min(top)] += 1;
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (cmd, count) in self.hits.iter_nonzero() {
            writeln!(f, "{}.hits.{cmd:?} = {count}", self.name)?;
        }
        for (cmd, count) in self.misses.iter_nonzero() {
            writeln!(f, "{}.misses.{cmd:?} = {count}", self.name)?;
        }
        if self.fast_writes > 0 {
            writeln!(f, "{}.fastWrites = {}", self.name, self.fast_writes)?;
        }
        if self.writebacks > 0 {
            writeln!(f, "{}.writebacks = {}", self.name, self.writebacks)?;
        }
        for (occupancy, samples) in self.mshr_occupancy.iter().enumerate() {
            if *samples > 0 {
                writeln!(f, "{}.mshr.occupancy[{occupancy}] = {samples}", self.name)?;
            }
        }
        let mut masters: Vec<_> = self.masters.iter().collect();
        masters.sort();
        for (master, count) in masters {
            writeln!(f, "{}.master[{master}].accesses = {count}", self.name)?;
        }
        Ok(())
    }
}

/// Counters of one CPU.
#[derive(Debug, Clone, Default)]
pub struct CpuStats {
    pub insts: u64,
    pub cycles: u64,
    pub icache_waits: u64,
    pub dcache_waits: u64,
    pub faults: u64,
}

impl CpuStats {
    #[must_use]
    pub fn dump(&self, name: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!("{name}.insts = {}\n", self.insts));
        out.push_str(&format!("{name}.cycles = {}\n", self.cycles));
        out.push_str(&format!("{name}.icacheWaits = {}\n", self.icache_waits));
        out.push_str(&format!("{name}.dcacheWaits = {}\n", self.dcache_waits));
        if self.faults > 0 {
            out.push_str(&format!("{name}.faults = {}\n", self.faults));
        }
        out
    }
}
