//! The narrow ISA surface the timing CPU consumes: address translation and
//! a small fixed-width instruction word. Decode and execute semantics live
//! here so the CPU model stays purely about timing.

use crate::address;
use crate::request::Request;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes per instruction word.
pub const INST_BYTES: u32 = 8;

/// A simulated fault, surfaced to the CPU's fault path. Not an
/// implementation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("access to unmapped address {addr:#x}")]
    BadAddress { addr: address },
    #[error("misaligned {size}-byte access at {addr:#x}")]
    Misaligned { addr: address, size: u32 },
    #[error("illegal instruction word {word:#x} at pc {pc:#x}")]
    IllegalInstruction { word: u64, pc: address },
}

/// Address translation consumed by the CPU.
pub trait Mmu: Send {
    fn setup_fetch_request(&self, req: &mut Request) -> Result<(), Fault>;
    fn translate_data_read(&self, req: &mut Request) -> Result<(), Fault>;
    fn translate_data_write(&self, req: &mut Request) -> Result<(), Fault>;
}

/// Identity translation bounded by the physical address space.
#[derive(Debug, Clone)]
pub struct DirectMmu {
    pub base: address,
    pub size: u64,
}

impl DirectMmu {
    fn translate(&self, req: &mut Request) -> Result<(), Fault> {
        let addr = req.vaddr;
        let size = u64::from(req.size);
        if addr < self.base || addr + size > self.base + self.size {
            return Err(Fault::BadAddress { addr });
        }
        if req.size.is_power_of_two() && addr % size != 0 {
            return Err(Fault::Misaligned {
                addr,
                size: req.size,
            });
        }
        req.paddr = addr;
        Ok(())
    }
}

impl Mmu for DirectMmu {
    fn setup_fetch_request(&self, req: &mut Request) -> Result<(), Fault> {
        self.translate(req)
    }

    fn translate_data_read(&self, req: &mut Request) -> Result<(), Fault> {
        self.translate(req)
    }

    fn translate_data_write(&self, req: &mut Request) -> Result<(), Fault> {
        self.translate(req)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Halt,
    Nop,
    /// rd <- mem[rs1 + imm]
    Load,
    /// mem[rs1 + imm] <- rs2
    Store,
    /// rd <- mem[rs1 + imm], acquiring the lock address
    LoadLocked,
    /// mem[rs1 + imm] <- rs2 if still locked; rd <- success
    StoreCond,
    /// rd <- rs1 + imm
    Addi,
    /// rd <- rs1 + rs2
    Add,
    /// pc-relative branch when rs1 != 0
    Bnez,
}

/// One decoded instruction word.
///
/// Encoding, little endian: byte 0 opcode, bytes 1-3 rd/rs1/rs2, bytes 4-7
/// a signed 32-bit immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticInst {
    pub op: Opcode,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub imm: i32,
}

impl StaticInst {
    pub fn decode(word: u64, pc: address) -> Result<StaticInst, Fault> {
        let bytes = word.to_le_bytes();
        let op = match bytes[0] {
            0x00 => Opcode::Halt,
            0x01 => Opcode::Nop,
            0x02 => Opcode::Load,
            0x03 => Opcode::Store,
            0x04 => Opcode::LoadLocked,
            0x05 => Opcode::StoreCond,
            0x06 => Opcode::Addi,
            0x07 => Opcode::Bnez,
            0x08 => Opcode::Add,
            _ => return Err(Fault::IllegalInstruction { word, pc }),
        };
        Ok(StaticInst {
            op,
            rd: bytes[1] & 0x1f,
            rs1: bytes[2] & 0x1f,
            rs2: bytes[3] & 0x1f,
            imm: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    #[must_use]
    pub fn encode(&self) -> u64 {
        let op = match self.op {
            Opcode::Halt => 0x00u8,
            Opcode::Nop => 0x01,
            Opcode::Load => 0x02,
            Opcode::Store => 0x03,
            Opcode::LoadLocked => 0x04,
            Opcode::StoreCond => 0x05,
            Opcode::Addi => 0x06,
            Opcode::Bnez => 0x07,
            Opcode::Add => 0x08,
        };
        let imm = self.imm.to_le_bytes();
        u64::from_le_bytes([
            op, self.rd, self.rs1, self.rs2, imm[0], imm[1], imm[2], imm[3],
        ])
    }

    #[must_use]
    pub fn halt() -> Self {
        Self {
            op: Opcode::Halt,
            rd: 0,
            rs1: 0,
            rs2: 0,
            imm: 0,
        }
    }

    #[must_use]
    pub fn nop() -> Self {
        Self {
            op: Opcode::Nop,
            ..Self::halt()
        }
    }

    #[must_use]
    pub fn load(rd: u8, rs1: u8, imm: i32) -> Self {
        Self {
            op: Opcode::Load,
            rd,
            rs1,
            imm,
            ..Self::halt()
        }
    }

    #[must_use]
    pub fn store(rs2: u8, rs1: u8, imm: i32) -> Self {
        Self {
            op: Opcode::Store,
            rs1,
            rs2,
            imm,
            ..Self::halt()
        }
    }

    #[must_use]
    pub fn load_locked(rd: u8, rs1: u8, imm: i32) -> Self {
        Self {
            op: Opcode::LoadLocked,
            rd,
            rs1,
            imm,
            ..Self::halt()
        }
    }

    #[must_use]
    pub fn store_cond(rd: u8, rs2: u8, rs1: u8, imm: i32) -> Self {
        Self {
            op: Opcode::StoreCond,
            rd,
            rs1,
            rs2,
            imm,
            ..Self::halt()
        }
    }

    #[must_use]
    pub fn addi(rd: u8, rs1: u8, imm: i32) -> Self {
        Self {
            op: Opcode::Addi,
            rd,
            rs1,
            imm,
            ..Self::halt()
        }
    }

    #[must_use]
    pub fn add(rd: u8, rs1: u8, rs2: u8) -> Self {
        Self {
            op: Opcode::Add,
            rd,
            rs1,
            rs2,
            ..Self::halt()
        }
    }

    #[must_use]
    pub fn bnez(rs1: u8, imm: i32) -> Self {
        Self {
            op: Opcode::Bnez,
            rs1,
            imm,
            ..Self::halt()
        }
    }

    #[must_use]
    pub fn is_mem_ref(&self) -> bool {
        matches!(
            self.op,
            Opcode::Load | Opcode::Store | Opcode::LoadLocked | Opcode::StoreCond
        )
    }

    #[must_use]
    pub fn is_load(&self) -> bool {
        matches!(self.op, Opcode::Load | Opcode::LoadLocked)
    }

    #[must_use]
    pub fn effective_addr(&self, thread: &ThreadState) -> address {
        thread
            .read_reg(self.rs1)
            .wrapping_add(self.imm as i64 as u64)
    }

    /// Execute a non-memory instruction; returns the next pc.
    #[must_use]
    pub fn execute(&self, thread: &mut ThreadState) -> address {
        let next = thread.pc.wrapping_add(u64::from(INST_BYTES));
        match self.op {
            Opcode::Nop | Opcode::Halt => next,
            Opcode::Addi => {
                let value = thread
                    .read_reg(self.rs1)
                    .wrapping_add(self.imm as i64 as u64);
                thread.write_reg(self.rd, value);
                next
            }
            Opcode::Add => {
                let value = thread
                    .read_reg(self.rs1)
                    .wrapping_add(thread.read_reg(self.rs2));
                thread.write_reg(self.rd, value);
                next
            }
            Opcode::Bnez => {
                if thread.read_reg(self.rs1) != 0 {
                    thread.pc.wrapping_add(self.imm as i64 as u64)
                } else {
                    next
                }
            }
            _ => unreachable!("memory instruction executed in the ALU path"),
        }
    }
}

#[must_use]
pub fn assemble(insts: &[StaticInst]) -> Vec<u8> {
    insts
        .iter()
        .flat_map(|inst| inst.encode().to_le_bytes())
        .collect()
}

/// Architectural state of one hardware thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadState {
    pub regs: [u64; 32],
    pub pc: address,
    /// Address held by an outstanding load-locked.
    pub locked_addr: Option<address>,
}

impl ThreadState {
    #[must_use]
    pub fn new(pc: address) -> Self {
        Self {
            regs: [0; 32],
            pc,
            locked_addr: None,
        }
    }

    /// Register 0 reads as zero.
    #[must_use]
    pub fn read_reg(&self, reg: u8) -> u64 {
        if reg == 0 {
            0
        } else {
            self.regs[reg as usize]
        }
    }

    pub fn write_reg(&mut self, reg: u8, value: u64) {
        if reg != 0 {
            self.regs[reg as usize] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DirectMmu, Fault, Mmu, Opcode, StaticInst, ThreadState};
    use crate::request;

    #[test]
    fn test_encode_decode_roundtrip() {
        let insts = [
            StaticInst::load(3, 1, 0x40),
            StaticInst::store(4, 2, -8),
            StaticInst::addi(5, 5, 1),
            StaticInst::add(10, 10, 3),
            StaticInst::bnez(5, -16),
            StaticInst::store_cond(6, 4, 1, 0),
            StaticInst::halt(),
        ];
        for inst in insts {
            let decoded = StaticInst::decode(inst.encode(), 0).unwrap();
            assert_eq!(decoded, inst);
        }
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let err = StaticInst::decode(0xff, 0x100).unwrap_err();
        assert!(matches!(err, Fault::IllegalInstruction { pc: 0x100, .. }));
    }

    #[test]
    fn test_branch_taken_and_not_taken() {
        let mut thread = ThreadState::new(0x100);
        thread.write_reg(5, 1);
        assert_eq!(StaticInst::bnez(5, -16).execute(&mut thread), 0xf0);
        thread.write_reg(5, 0);
        assert_eq!(StaticInst::bnez(5, -16).execute(&mut thread), 0x108);
    }

    #[test]
    fn test_reg_zero_is_hardwired() {
        let mut thread = ThreadState::new(0);
        thread.write_reg(0, 77);
        assert_eq!(thread.read_reg(0), 0);
    }

    #[test]
    fn test_direct_mmu_bounds_and_alignment() {
        let mmu = DirectMmu {
            base: 0x1000,
            size: 0x1000,
        };
        let mut req = request::Builder {
            vaddr: 0x1008,
            size: 8,
            ..request::Builder::default()
        }
        .build();
        assert!(mmu.translate_data_read(&mut req).is_ok());
        assert_eq!(req.paddr, 0x1008);

        let mut out_of_range = request::Builder {
            vaddr: 0x3000,
            size: 8,
            ..request::Builder::default()
        }
        .build();
        assert!(matches!(
            mmu.translate_data_read(&mut out_of_range),
            Err(Fault::BadAddress { addr: 0x3000 })
        ));

        let mut misaligned = request::Builder {
            vaddr: 0x1004,
            size: 8,
            ..request::Builder::default()
        }
        .build();
        assert!(matches!(
            mmu.translate_data_write(&mut misaligned),
            Err(Fault::Misaligned { .. })
        ));
    }

    #[test]
    fn test_opcode_class_predicates() {
        assert!(StaticInst::load(1, 0, 0).is_mem_ref());
        assert!(StaticInst::load_locked(1, 0, 0).is_load());
        assert!(!StaticInst::addi(1, 0, 0).is_mem_ref());
        assert_eq!(StaticInst::halt().op, Opcode::Halt);
    }
}
