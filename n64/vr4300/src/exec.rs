//! Semantics of every guest operation, shared by the three engines.
//!
//! Engines set `cpu.pc` to the address of the instruction before calling in here. Non-jump ops
//! go through [`execute`]. Jumps are split in two: [`evaluate_jump`] decides the target and
//! writes the link register, then [`finish_jump`] runs the delay slot through an engine-provided
//! closure and settles the new PC and the cycle count.

use log::{debug, trace, warn};

use common::util::{ByteMask4, ByteMask8};

use crate::coprocessor0::{self as cp0, ExceptionCode};
use crate::cpu::Vr4300;
use crate::instructions::{mnemonic, BranchCond, OpKind, RType};
use crate::Bus;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Continue with the next sequential instruction
    Next,
    /// `cpu.pc` was redirected (exception, ERET)
    Jump,
}

#[inline(always)]
fn se32(value: u32) -> u64 {
    value as i32 as i64 as u64
}

#[inline(always)]
fn set(cpu: &mut Vr4300, reg: u8, value: u64) {
    if reg != 0 {
        cpu.gpr[reg as usize] = value;
    }
}

#[inline(always)]
fn rs(cpu: &Vr4300, inst: RType) -> u64 {
    cpu.gpr[inst.rs() as usize]
}

#[inline(always)]
fn rt(cpu: &Vr4300, inst: RType) -> u64 {
    cpu.gpr[inst.rt() as usize]
}

#[inline(always)]
fn effective_address(cpu: &Vr4300, inst: RType) -> u32 {
    rs(cpu, inst).wrapping_add(inst.simm()) as u32
}

// Memory access. None means the access raised an exception and cpu.pc points at the vector.

fn translate(cpu: &mut Vr4300, vaddr: u32, write: bool) -> Option<u32> {
    match cpu.translate(vaddr, write) {
        Some(paddr) => Some(paddr),
        None => {
            debug!("tlb miss at {:#010x} ({})", vaddr, if write { "write" } else { "read" });
            cpu.tlb_refill_exception(vaddr, write);
            None
        }
    }
}

pub fn read_word<B: Bus + ?Sized>(cpu: &mut Vr4300, bus: &mut B, vaddr: u32) -> Option<u32> {
    let paddr = translate(cpu, vaddr, false)?;
    Some(bus.read32(cpu, paddr & !3))
}

pub fn read_dword<B: Bus + ?Sized>(cpu: &mut Vr4300, bus: &mut B, vaddr: u32) -> Option<u64> {
    let paddr = translate(cpu, vaddr, false)? & !7;
    let hi = bus.read32(cpu, paddr);
    let lo = bus.read32(cpu, paddr + 4);
    Some(((hi as u64) << 32) | lo as u64)
}

pub fn write_word<B: Bus + ?Sized>(cpu: &mut Vr4300, bus: &mut B, vaddr: u32, value: u32, mask: ByteMask4) -> Option<()> {
    let paddr = translate(cpu, vaddr, true)? & !3;
    bus.write32(cpu, paddr, mask.apply(value), mask.value());
    cpu.note_code_write(0x8000_0000 | paddr, 4);
    Some(())
}

pub fn write_dword<B: Bus + ?Sized>(cpu: &mut Vr4300, bus: &mut B, vaddr: u32, value: u64, mask: ByteMask8) -> Option<()> {
    let paddr = translate(cpu, vaddr, true)? & !7;
    let (hi_mask, lo_mask) = mask.split();
    if hi_mask.value() != 0 {
        bus.write32(cpu, paddr, hi_mask.apply((value >> 32) as u32), hi_mask.value());
    }
    if lo_mask.value() != 0 {
        bus.write32(cpu, paddr + 4, lo_mask.apply(value as u32), lo_mask.value());
    }
    cpu.note_code_write(0x8000_0000 | paddr, 8);
    Some(())
}

/// Executes one non-jump operation
pub fn execute<B: Bus + ?Sized>(cpu: &mut Vr4300, bus: &mut B, inst: RType, kind: OpKind) -> Flow {
    use OpKind::*;

    trace!("{:#010x}: {:08x} {}", cpu.pc, inst.word(), mnemonic(inst.word()));

    let rd = inst.rd();
    let rt_reg = inst.rt();
    let sa = inst.sa() as u32;

    match kind {
        // Shifts
        Sll => set(cpu, rd, se32((rt(cpu, inst) as u32) << sa)),
        Srl => set(cpu, rd, se32((rt(cpu, inst) as u32) >> sa)),
        Sra => set(cpu, rd, se32(((rt(cpu, inst) as i32) >> sa) as u32)),
        Sllv => set(cpu, rd, se32((rt(cpu, inst) as u32) << (rs(cpu, inst) & 31))),
        Srlv => set(cpu, rd, se32((rt(cpu, inst) as u32) >> (rs(cpu, inst) & 31))),
        Srav => set(cpu, rd, se32(((rt(cpu, inst) as i32) >> (rs(cpu, inst) & 31)) as u32)),
        Dsllv => set(cpu, rd, rt(cpu, inst) << (rs(cpu, inst) & 63)),
        Dsrlv => set(cpu, rd, rt(cpu, inst) >> (rs(cpu, inst) & 63)),
        Dsrav => set(cpu, rd, ((rt(cpu, inst) as i64) >> (rs(cpu, inst) & 63)) as u64),
        Dsll => set(cpu, rd, rt(cpu, inst) << sa),
        Dsrl => set(cpu, rd, rt(cpu, inst) >> sa),
        Dsra => set(cpu, rd, ((rt(cpu, inst) as i64) >> sa) as u64),
        Dsll32 => set(cpu, rd, rt(cpu, inst) << (sa + 32)),
        Dsrl32 => set(cpu, rd, rt(cpu, inst) >> (sa + 32)),
        Dsra32 => set(cpu, rd, ((rt(cpu, inst) as i64) >> (sa + 32)) as u64),

        // HI/LO
        Mfhi => set(cpu, rd, cpu.hi),
        Mflo => set(cpu, rd, cpu.lo),
        Mthi => cpu.hi = rs(cpu, inst),
        Mtlo => cpu.lo = rs(cpu, inst),
        Mult => {
            let result = (rs(cpu, inst) as i32 as i64).wrapping_mul(rt(cpu, inst) as i32 as i64);
            cpu.lo = se32(result as u32);
            cpu.hi = se32((result >> 32) as u32);
        }
        Multu => {
            let result = (rs(cpu, inst) as u32 as u64) * (rt(cpu, inst) as u32 as u64);
            cpu.lo = se32(result as u32);
            cpu.hi = se32((result >> 32) as u32);
        }
        Div => {
            let (a, b) = (rs(cpu, inst) as i32, rt(cpu, inst) as i32);
            if b != 0 {
                cpu.lo = se32(a.wrapping_div(b) as u32);
                cpu.hi = se32(a.wrapping_rem(b) as u32);
            } else {
                debug!("DIV by zero at {:#010x}", cpu.pc);
            }
        }
        Divu => {
            let (a, b) = (rs(cpu, inst) as u32, rt(cpu, inst) as u32);
            if b != 0 {
                cpu.lo = se32(a / b);
                cpu.hi = se32(a % b);
            } else {
                debug!("DIVU by zero at {:#010x}", cpu.pc);
            }
        }
        Dmult => {
            let result = (rs(cpu, inst) as i64 as i128).wrapping_mul(rt(cpu, inst) as i64 as i128);
            cpu.lo = result as u64;
            cpu.hi = (result >> 64) as u64;
        }
        Dmultu => {
            let result = (rs(cpu, inst) as u128) * (rt(cpu, inst) as u128);
            cpu.lo = result as u64;
            cpu.hi = (result >> 64) as u64;
        }
        Ddiv => {
            let (a, b) = (rs(cpu, inst) as i64, rt(cpu, inst) as i64);
            if b != 0 {
                cpu.lo = a.wrapping_div(b) as u64;
                cpu.hi = a.wrapping_rem(b) as u64;
            } else {
                debug!("DDIV by zero at {:#010x}", cpu.pc);
            }
        }
        Ddivu => {
            let (a, b) = (rs(cpu, inst), rt(cpu, inst));
            if b != 0 {
                cpu.lo = a / b;
                cpu.hi = a % b;
            } else {
                debug!("DDIVU by zero at {:#010x}", cpu.pc);
            }
        }

        // ALU. The overflow-trapping forms behave like their unsigned forms.
        Add | Addu => set(cpu, rd, se32((rs(cpu, inst) as u32).wrapping_add(rt(cpu, inst) as u32))),
        Sub | Subu => set(cpu, rd, se32((rs(cpu, inst) as u32).wrapping_sub(rt(cpu, inst) as u32))),
        Dadd | Daddu => set(cpu, rd, rs(cpu, inst).wrapping_add(rt(cpu, inst))),
        Dsub | Dsubu => set(cpu, rd, rs(cpu, inst).wrapping_sub(rt(cpu, inst))),
        And => set(cpu, rd, rs(cpu, inst) & rt(cpu, inst)),
        Or => set(cpu, rd, rs(cpu, inst) | rt(cpu, inst)),
        Xor => set(cpu, rd, rs(cpu, inst) ^ rt(cpu, inst)),
        Nor => set(cpu, rd, !(rs(cpu, inst) | rt(cpu, inst))),
        Slt => set(cpu, rd, ((rs(cpu, inst) as i64) < (rt(cpu, inst) as i64)) as u64),
        Sltu => set(cpu, rd, (rs(cpu, inst) < rt(cpu, inst)) as u64),
        Addi | Addiu => set(cpu, rt_reg, se32((rs(cpu, inst) as u32).wrapping_add(inst.simm() as u32))),
        Daddi | Daddiu => set(cpu, rt_reg, rs(cpu, inst).wrapping_add(inst.simm())),
        Slti => set(cpu, rt_reg, ((rs(cpu, inst) as i64) < (inst.simm() as i64)) as u64),
        Sltiu => set(cpu, rt_reg, (rs(cpu, inst) < inst.simm()) as u64),
        Andi => set(cpu, rt_reg, rs(cpu, inst) & inst.uimm()),
        Ori => set(cpu, rt_reg, rs(cpu, inst) | inst.uimm()),
        Xori => set(cpu, rt_reg, rs(cpu, inst) ^ inst.uimm()),
        Lui => set(cpu, rt_reg, se32((inst.uimm() as u32) << 16)),

        // Traps
        Tge | Tgeu | Tlt | Tltu | Teq | Tne | Tgei | Tgeiu | Tlti | Tltiu | Teqi | Tnei => {
            let a = rs(cpu, inst);
            let b = match kind {
                Tge | Tgeu | Tlt | Tltu | Teq | Tne => rt(cpu, inst),
                _ => inst.simm(),
            };
            let trap = match kind {
                Tge | Tgei => (a as i64) >= (b as i64),
                Tgeu | Tgeiu => a >= b,
                Tlt | Tlti => (a as i64) < (b as i64),
                Tltu | Tltiu => a < b,
                Teq | Teqi => a == b,
                _ => a != b,
            };
            if trap {
                cpu.exception(ExceptionCode::Trap);
                return Flow::Jump;
            }
        }
        Syscall => {
            cpu.exception(ExceptionCode::Syscall);
            return Flow::Jump;
        }
        Break => {
            cpu.exception(ExceptionCode::Breakpoint);
            return Flow::Jump;
        }
        Sync | Cache => {}
        Reserved => {
            warn!("reserved instruction {:08x} at {:#010x}", inst.word(), cpu.pc);
            cpu.exception(ExceptionCode::ReservedInstruction);
            return Flow::Jump;
        }

        // Loads
        Lb | Lbu | Lh | Lhu | Lw | Lwu | Ll => {
            let addr = effective_address(cpu, inst);
            let Some(word) = read_word(cpu, bus, addr) else { return Flow::Jump };
            let value = match kind {
                Lb => (word >> (8 * (3 - (addr & 3)))) as u8 as i8 as i64 as u64,
                Lbu => (word >> (8 * (3 - (addr & 3)))) as u8 as u64,
                Lh => (word >> (8 * (2 - (addr & 2)))) as u16 as i16 as i64 as u64,
                Lhu => (word >> (8 * (2 - (addr & 2)))) as u16 as u64,
                Lwu => word as u64,
                _ => se32(word),
            };
            if kind == Ll {
                cpu.ll_bit = true;
                *cpu.cop0.reg_mut(cp0::LL_ADDR) = addr;
            }
            set(cpu, rt_reg, value);
        }
        Ld | Lld => {
            let addr = effective_address(cpu, inst);
            let Some(value) = read_dword(cpu, bus, addr) else { return Flow::Jump };
            if kind == Lld {
                cpu.ll_bit = true;
                *cpu.cop0.reg_mut(cp0::LL_ADDR) = addr;
            }
            set(cpu, rt_reg, value);
        }
        Lwl | Lwr => {
            let addr = effective_address(cpu, inst);
            let Some(word) = read_word(cpu, bus, addr) else { return Flow::Jump };
            let old = rt(cpu, inst);
            let value = if kind == Lwl {
                let shift = 8 * (addr & 3);
                let keep = (1u32 << shift).wrapping_sub(1);
                se32((old as u32 & keep) | (word << shift))
            } else if addr & 3 == 3 {
                se32(word)
            } else {
                let shift = 8 * (3 - (addr & 3));
                let keep = !((u32::MAX >> shift) as u64);
                (old & keep) | (word >> shift) as u64
            };
            set(cpu, rt_reg, value);
        }
        Ldl | Ldr => {
            let addr = effective_address(cpu, inst);
            let Some(dword) = read_dword(cpu, bus, addr) else { return Flow::Jump };
            let old = rt(cpu, inst);
            let value = if kind == Ldl {
                let shift = 8 * (addr & 7);
                let keep = (1u64 << shift).wrapping_sub(1);
                (old & keep) | (dword << shift)
            } else {
                let shift = 8 * (7 - (addr & 7));
                (old & !(u64::MAX >> shift)) | (dword >> shift)
            };
            set(cpu, rt_reg, value);
        }

        // Stores
        Sb | Sh | Sw | Swl | Swr => {
            let addr = effective_address(cpu, inst);
            let value = rt(cpu, inst) as u32;
            let (data, mask) = match kind {
                Sb => (value << (8 * (3 - (addr & 3))), ByteMask4::new(1u8, (addr & 3) as u8)),
                Sh => (value << (8 * (2 - (addr & 2))), ByteMask4::new(2u8, (addr & 2) as u8)),
                Sw => (value, ByteMask4::default()),
                Swl => {
                    let shift = 8 * (addr & 3);
                    (value >> shift, ByteMask4::from_value(u32::MAX >> shift))
                }
                _ => {
                    let shift = 8 * (3 - (addr & 3));
                    (value << shift, ByteMask4::from_value(u32::MAX << shift))
                }
            };
            if write_word(cpu, bus, addr, data, mask).is_none() {
                return Flow::Jump;
            }
        }
        Sd | Sdl | Sdr => {
            let addr = effective_address(cpu, inst);
            let value = rt(cpu, inst);
            let (data, mask) = match kind {
                Sd => (value, ByteMask8::default()),
                Sdl => {
                    let shift = 8 * (addr & 7);
                    (value >> shift, ByteMask8::from_value(u64::MAX >> shift))
                }
                _ => {
                    let shift = 8 * (7 - (addr & 7));
                    (value << shift, ByteMask8::from_value(u64::MAX << shift))
                }
            };
            if write_dword(cpu, bus, addr, data, mask).is_none() {
                return Flow::Jump;
            }
        }
        Sc | Scd => {
            let addr = effective_address(cpu, inst);
            if cpu.ll_bit {
                let stored = if kind == Sc {
                    write_word(cpu, bus, addr, rt(cpu, inst) as u32, ByteMask4::default())
                } else {
                    write_dword(cpu, bus, addr, rt(cpu, inst), ByteMask8::default())
                };
                if stored.is_none() {
                    return Flow::Jump;
                }
            }
            let success = cpu.ll_bit as u64;
            set(cpu, rt_reg, success);
        }

        // COP0
        Mfc0 => {
            let value = cpu.read_cop0(rd as usize);
            set(cpu, rt_reg, se32(value));
        }
        Dmfc0 => {
            let value = cpu.read_cop0(rd as usize);
            set(cpu, rt_reg, value as u64);
        }
        Mtc0 | Dmtc0 => cpu.write_cop0(rd as usize, rt(cpu, inst) as u32),
        Tlbr => cpu.tlb.read(&mut cpu.cop0),
        Tlbp => cpu.tlb.probe(&mut cpu.cop0),
        Tlbwi | Tlbwr => {
            let index = if kind == Tlbwi {
                cpu.cop0.reg(cp0::INDEX)
            } else {
                cpu.update_count(cpu.pc);
                cpu.cop0.update_random();
                cpu.cop0.reg(cp0::RANDOM)
            };
            let changed = cpu.tlb.write(index as usize, &cpu.cop0);
            for range in changed {
                cpu.note_code_write(range.start, range.len());
            }
        }
        Eret => {
            cpu.eret();
            return Flow::Jump;
        }

        // COP1
        Mfc1 | Dmfc1 | Cfc1 | Mtc1 | Dmtc1 | Ctc1 | Lwc1 | Ldc1 | Swc1 | Sdc1 | FpuArith => {
            return execute_cop1(cpu, bus, inst, kind);
        }

        J | Jal | Jr | Jalr | Beq | Bne | Blez | Bgtz | Beql | Bnel | Blezl | Bgtzl
        | Bltz | Bgez | Bltzl | Bgezl | Bltzal | Bgezal | Bltzall | Bgezall
        | Bc1f | Bc1t | Bc1fl | Bc1tl => {
            unreachable!("{:?} must go through evaluate_jump", kind);
        }
    }
    Flow::Next
}

fn execute_cop1<B: Bus + ?Sized>(cpu: &mut Vr4300, bus: &mut B, inst: RType, kind: OpKind) -> Flow {
    use OpKind::*;

    if !cpu.cop0.fpu_usable() {
        cpu.cop1_unusable();
        return Flow::Jump;
    }
    let fr = cpu.fr();
    match kind {
        Mfc1 => set(cpu, inst.rt(), se32(cpu.cop1.read_w(inst.fs(), fr))),
        Dmfc1 => set(cpu, inst.rt(), cpu.cop1.read_d(inst.fs(), fr)),
        Cfc1 => set(cpu, inst.rt(), se32(cpu.cop1.read_control(inst.fs()))),
        Mtc1 => cpu.cop1.write_w(inst.fs(), rt(cpu, inst) as u32, fr),
        Dmtc1 => cpu.cop1.write_d(inst.fs(), rt(cpu, inst), fr),
        Ctc1 => cpu.cop1.write_control(inst.fs(), rt(cpu, inst) as u32),
        Lwc1 => {
            let addr = effective_address(cpu, inst);
            let Some(word) = read_word(cpu, bus, addr) else { return Flow::Jump };
            cpu.cop1.write_w(inst.ft(), word, fr);
        }
        Ldc1 => {
            let addr = effective_address(cpu, inst);
            let Some(dword) = read_dword(cpu, bus, addr) else { return Flow::Jump };
            cpu.cop1.write_d(inst.ft(), dword, fr);
        }
        Swc1 => {
            let addr = effective_address(cpu, inst);
            let value = cpu.cop1.read_w(inst.ft(), fr);
            if write_word(cpu, bus, addr, value, ByteMask4::default()).is_none() {
                return Flow::Jump;
            }
        }
        Sdc1 => {
            let addr = effective_address(cpu, inst);
            let value = cpu.cop1.read_d(inst.ft(), fr);
            if write_dword(cpu, bus, addr, value, ByteMask8::default()).is_none() {
                return Flow::Jump;
            }
        }
        _ => {
            if cpu.cop1.execute(inst, fr).is_err() {
                warn!("unimplemented fpu op {:08x} at {:#010x}", inst.word(), cpu.pc);
                cpu.exception(ExceptionCode::ReservedInstruction);
                return Flow::Jump;
            }
        }
    }
    Flow::Next
}

/// Outcome of a jump's condition and target evaluation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Branch {
    pub taken: bool,
    pub target: u32,
    pub likely: bool,
}

/// Static target of a PC-relative branch or J/JAL. None for register jumps.
pub fn static_target(kind: OpKind, inst: RType, pc: u32) -> Option<u32> {
    let info = kind.jump_info()?;
    if info.register {
        return None;
    }
    match kind {
        OpKind::J | OpKind::Jal => Some((pc.wrapping_add(4) & 0xf000_0000) | (inst.target() << 2)),
        _ => Some(pc.wrapping_add(4).wrapping_add((inst.simm() as u32) << 2)),
    }
}

/// Decides whether the jump at `cpu.pc` is taken and where to, and writes the link register.
///
/// None when the op raised an exception instead (COP1 unusable), `cpu.pc` is then the vector.
pub fn evaluate_jump(cpu: &mut Vr4300, inst: RType, kind: OpKind) -> Option<Branch> {
    let Some(info) = kind.jump_info() else {
        unreachable!("{:?} is not a jump", kind);
    };
    let pc = cpu.pc;

    if matches!(info.cond, BranchCond::Fpu(_)) && !cpu.cop0.fpu_usable() {
        cpu.cop1_unusable();
        return None;
    }

    let a = rs(cpu, inst);
    let b = rt(cpu, inst);
    let taken = match info.cond {
        BranchCond::Always => true,
        BranchCond::Eq => a == b,
        BranchCond::Ne => a != b,
        BranchCond::Lez => (a as i64) <= 0,
        BranchCond::Gtz => (a as i64) > 0,
        BranchCond::Ltz => (a as i64) < 0,
        BranchCond::Gez => (a as i64) >= 0,
        BranchCond::Fpu(when) => cpu.cop1.condition() == when,
    };
    let target = match static_target(kind, inst, pc) {
        Some(target) => target,
        None => a as u32,
    };

    if info.link {
        let reg = if kind == OpKind::Jalr { inst.rd() } else { 31 };
        set(cpu, reg, se32(pc.wrapping_add(8)));
    }

    Some(Branch { taken, target, likely: info.likely })
}

/// Where a jump left the CPU
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JumpEnd {
    /// `cpu.pc` is the branch target
    Taken,
    /// `cpu.pc` is the instruction after the delay slot
    NotTaken,
    /// The delay slot raised an exception, `cpu.pc` is the vector
    Redirected,
}

/// Runs the delay slot (unless a likely branch isn't taken), charges the cycles and leaves
/// `cpu.pc` at the next instruction to execute. `delay_slot` executes the instruction at
/// `cpu.pc` with `cpu.delay_slot` set.
pub fn finish_jump<F>(cpu: &mut Vr4300, branch: Branch, delay_slot: F) -> JumpEnd
where
    F: FnOnce(&mut Vr4300) -> Flow,
{
    let pc = cpu.pc;
    let end = if !branch.likely || branch.taken {
        cpu.pc = pc.wrapping_add(4);
        cpu.delay_slot = true;
        let flow = delay_slot(cpu);
        if flow == Flow::Next {
            cpu.pc = pc.wrapping_add(8);
        }
        cpu.update_count(cpu.pc);
        cpu.delay_slot = false;

        let skip = std::mem::take(&mut cpu.skip_jump);
        if flow != Flow::Next || skip {
            JumpEnd::Redirected
        } else if branch.taken {
            cpu.pc = branch.target;
            JumpEnd::Taken
        } else {
            JumpEnd::NotTaken
        }
    } else {
        cpu.pc = pc.wrapping_add(8);
        cpu.update_count(cpu.pc);
        JumpEnd::NotTaken
    };
    cpu.last_addr = cpu.pc;
    end
}

/// The fast-forward half of an idle loop. Charges everything up to the jump, then skips Count
/// ahead to the next event. The jump itself still runs afterwards.
pub fn idle_skip(cpu: &mut Vr4300) {
    cpu.update_count(cpu.pc);
    cpu.idle_skip();
}

/// Jump-to-self with a NOP in the delay slot. Only events can get the CPU out of it.
#[inline(always)]
pub fn is_idle_loop(branch_target: Option<u32>, pc: u32, delay_slot_word: u32) -> bool {
    branch_target == Some(pc) && delay_slot_word == 0
}
