//! Host register allocation for a compiled run.
//!
//! Guest registers are 64 bits wide and live in guest memory as two 32-bit halves; each half
//! binds to its own host register. Halves of the same guest register that are both bound are
//! paired, so one is never written back or evicted without the other.
//!
//! Liveness is tracked per guest instruction: everything touched by the current instruction is
//! pinned until [`RegCache::next_instruction`].

use log::error;

use super::assembler::Assembler;
use super::host::{AluOp, Inst, Mem, Reg, Src, REG_COUNT};

/// Registers handed out by the allocator. The scratch register and the stack pointer are not.
pub const ALLOCATABLE: [Reg; 6] = [Reg::Ecx, Reg::Edx, Reg::Ebx, Reg::Ebp, Reg::Esi, Reg::Edi];

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct HostRegisterBinding {
    pub guest: Option<Mem>,
    /// Holds a value guest memory does not have yet
    pub dirty: bool,
    /// Register holding the other half of the same guest register
    pub pair: Option<Reg>,
    pub last_use: u32,
    pub free_since: u32,
}

pub struct RegCache {
    bindings: [HostRegisterBinding; REG_COUNT],
    now: u32,
}

impl Default for RegCache {
    fn default() -> Self {
        RegCache::new()
    }
}

#[inline(always)]
fn is_zero_register(guest: Mem) -> bool {
    matches!(guest, Mem::GprLo(0) | Mem::GprHi(0))
}

impl RegCache {
    pub fn new() -> RegCache {
        RegCache {
            bindings: [HostRegisterBinding::default(); REG_COUNT],
            // markers start at 1 so nothing is pinned before the first instruction
            now: 1,
        }
    }

    pub fn next_instruction(&mut self) {
        self.now += 1;
    }

    pub fn binding(&self, reg: Reg) -> &HostRegisterBinding {
        &self.bindings[reg.index()]
    }

    pub fn lookup(&self, guest: Mem) -> Option<Reg> {
        ALLOCATABLE.iter().copied().find(|r| self.bindings[r.index()].guest == Some(guest))
    }

    /// Host register holding the current value of `guest`, loading it if needed
    pub fn allocate(&mut self, asm: &mut Assembler, guest: Mem) -> Reg {
        self.bind(asm, guest, true)
    }

    /// Host register that is about to receive a new value for `guest`. Nothing is loaded and
    /// the binding is dirty from here on.
    pub fn allocate_for_write(&mut self, asm: &mut Assembler, guest: Mem) -> Reg {
        let reg = self.bind(asm, guest, false);
        if !is_zero_register(guest) {
            self.bindings[reg.index()].dirty = true;
        }
        reg
    }

    fn bind(&mut self, asm: &mut Assembler, guest: Mem, load: bool) -> Reg {
        if let Some(reg) = self.lookup(guest) {
            self.bindings[reg.index()].last_use = self.now;
            return reg;
        }

        let reg = self.victim();
        if self.bindings[reg.index()].guest.is_some() {
            self.evict(asm, reg);
        }

        if is_zero_register(guest) {
            asm.emit(Inst::Alu(AluOp::Xor, reg, Src::Reg(reg)));
        } else if load {
            asm.emit(Inst::Mov(reg, Src::Mem(guest)));
        }

        let pair = guest.other_half().and_then(|half| self.lookup(half));
        self.bindings[reg.index()] = HostRegisterBinding {
            guest: Some(guest),
            dirty: false,
            pair,
            last_use: self.now,
            free_since: 0,
        };
        if let Some(other) = pair {
            self.bindings[other.index()].pair = Some(reg);
        }
        reg
    }

    /// A free register (the one free the longest), or else the least recently used one not
    /// pinned by the current instruction
    fn victim(&self) -> Reg {
        let free = ALLOCATABLE
            .iter()
            .copied()
            .filter(|r| self.bindings[r.index()].guest.is_none())
            .min_by_key(|r| self.bindings[r.index()].free_since);
        if let Some(reg) = free {
            return reg;
        }

        let pinned = |r: Reg| self.bindings[r.index()].last_use >= self.now;
        let victim = ALLOCATABLE
            .iter()
            .copied()
            .filter(|&r| !pinned(r) && !self.bindings[r.index()].pair.is_some_and(pinned))
            .min_by_key(|r| self.bindings[r.index()].last_use);
        match victim {
            Some(reg) => reg,
            None => {
                error!("no host register left to evict: {:?}", self.bindings);
                panic!("host register pool exhausted");
            }
        }
    }

    /// Writes back and unbinds `reg` together with its pair
    fn evict(&mut self, asm: &mut Assembler, reg: Reg) {
        let pair = self.bindings[reg.index()].pair;
        self.write_back(asm, reg);
        self.release(reg);
        if let Some(other) = pair {
            self.write_back(asm, other);
            self.release(other);
        }
    }

    fn write_back(&mut self, asm: &mut Assembler, reg: Reg) {
        let binding = &mut self.bindings[reg.index()];
        if let (Some(guest), true) = (binding.guest, binding.dirty) {
            asm.emit(Inst::Store(guest, reg));
            binding.dirty = false;
        }
    }

    fn release(&mut self, reg: Reg) {
        self.bindings[reg.index()] = HostRegisterBinding { free_since: self.now, ..HostRegisterBinding::default() };
    }

    /// Flushes every dirty register and unbinds everything. Guest memory is up to date after.
    pub fn free_all(&mut self, asm: &mut Assembler) {
        for reg in ALLOCATABLE {
            self.write_back(asm, reg);
            if self.bindings[reg.index()].guest.is_some() {
                self.release(reg);
            }
        }
    }

    /// The bound registers as a bitmap
    pub fn need_map(&self) -> u8 {
        ALLOCATABLE
            .iter()
            .filter(|r| self.bindings[r.index()].guest.is_some())
            .fold(0, |map, r| map | r.bit())
    }

    pub fn bound(&self) -> Vec<(Reg, Mem)> {
        ALLOCATABLE
            .iter()
            .filter_map(|&r| self.bindings[r.index()].guest.map(|guest| (r, guest)))
            .collect()
    }
}
