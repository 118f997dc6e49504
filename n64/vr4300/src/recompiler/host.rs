//! The host side of the recompiler: a small 32-bit, two-address register machine with an x86
//! flavoured byte encoding, and the executor that runs it against the guest state.
//!
//! Operands are eight 32-bit registers, immediates, and named slots of guest state ([`Mem`]).
//! Every 64-bit guest register is two slots, one per half.

use log::error;

use crate::coprocessor0 as cp0;
use crate::Vr4300;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Eax = 0,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
}

pub const REG_COUNT: usize = 8;

impl Reg {
    pub const ALL: [Reg; REG_COUNT] = [Reg::Eax, Reg::Ecx, Reg::Edx, Reg::Ebx, Reg::Esp, Reg::Ebp, Reg::Esi, Reg::Edi];

    /// Scratch register of the generated code, never handed to the allocator
    pub const SCRATCH: Reg = Reg::Eax;

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline(always)]
    pub fn bit(self) -> u8 {
        1 << self as u8
    }

    fn from_byte(byte: u8) -> Reg {
        Reg::ALL[(byte & 7) as usize]
    }
}

/// A slot of guest state the host code can address
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Mem {
    GprLo(u8),
    GprHi(u8),
    Count,
    LastAddr,
    CountPerOp,
    /// Cycle of the next check point exit. Reads as Count while a stop is requested.
    NextInterrupt,
    /// Branch condition, evaluated before the delay slot runs
    Taken,
}

impl Mem {
    fn encode(self, out: &mut Vec<u8>) {
        let (tag, index) = match self {
            Mem::GprLo(n) => (0, n),
            Mem::GprHi(n) => (1, n),
            Mem::Count => (2, 0),
            Mem::LastAddr => (3, 0),
            Mem::CountPerOp => (4, 0),
            Mem::NextInterrupt => (5, 0),
            Mem::Taken => (6, 0),
        };
        out.extend_from_slice(&[tag, index]);
    }

    fn decode(bytes: &[u8]) -> Mem {
        match bytes[0] {
            0 => Mem::GprLo(bytes[1]),
            1 => Mem::GprHi(bytes[1]),
            2 => Mem::Count,
            3 => Mem::LastAddr,
            4 => Mem::CountPerOp,
            5 => Mem::NextInterrupt,
            6 => Mem::Taken,
            tag => panic!("bad memory operand tag {:#x}", tag),
        }
    }

    /// The other half of a guest register
    pub fn other_half(self) -> Option<Mem> {
        match self {
            Mem::GprLo(n) => Some(Mem::GprHi(n)),
            Mem::GprHi(n) => Some(Mem::GprLo(n)),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Src {
    Reg(Reg),
    Mem(Mem),
    Imm(u32),
}

impl Src {
    fn encode(self, out: &mut Vec<u8>) {
        match self {
            Src::Reg(r) => out.extend_from_slice(&[0, r as u8]),
            Src::Mem(m) => {
                out.push(1);
                m.encode(out);
            }
            Src::Imm(imm) => {
                out.push(2);
                out.extend_from_slice(&imm.to_le_bytes());
            }
        }
    }

    fn decode(bytes: &[u8]) -> (Src, usize) {
        match bytes[0] {
            0 => (Src::Reg(Reg::from_byte(bytes[1])), 2),
            1 => (Src::Mem(Mem::decode(&bytes[1..])), 3),
            2 => (Src::Imm(read_u32(&bytes[1..])), 5),
            tag => panic!("bad source operand tag {:#x}", tag),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    const ALL: [AluOp; 8] = [AluOp::Add, AluOp::Or, AluOp::Adc, AluOp::Sbb, AluOp::And, AluOp::Sub, AluOp::Xor, AluOp::Cmp];
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ShiftOp {
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Condition codes, numbered like x86's
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    L = 0xc,
    Ge = 0xd,
    Le = 0xe,
    G = 0xf,
}

impl Cond {
    fn from_byte(byte: u8) -> Cond {
        match byte & 0xf {
            0x2 => Cond::B,
            0x3 => Cond::Ae,
            0x4 => Cond::E,
            0x5 => Cond::Ne,
            0xc => Cond::L,
            0xd => Cond::Ge,
            0xe => Cond::Le,
            0xf => Cond::G,
            cc => panic!("unsupported condition code {:#x}", cc),
        }
    }
}

/// How a run of host code hands control back to the engine
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HostExit {
    /// Continue at this guest address, nothing is due
    ExitTo(u32),
    /// A check point found an event due; continue at this guest address afterwards
    Interrupt(u32),
    /// Run the record at this index of the current page through the interpreter
    CallInterp(u16),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Inst {
    Alu(AluOp, Reg, Src),
    Mov(Reg, Src),
    Store(Mem, Reg),
    StoreImm(Mem, u32),
    Shift(ShiftOp, Reg, u8),
    Imul(Reg, Src),
    Test(Reg, Reg),
    /// `reg = cond as u32`
    Setcc(Cond, Reg),
    /// Relative to the end of the instruction
    Jcc(Cond, i32),
    JccShort(Cond, i8),
    Jmp(i32),
    JmpShort(i8),
    Exit(HostExit),
}

mod opcode {
    pub const ALU: u8 = 0x01;
    pub const MOV: u8 = 0x8b;
    pub const STORE: u8 = 0x89;
    pub const STORE_IMM: u8 = 0xc7;
    pub const SHIFT: u8 = 0xc1;
    pub const IMUL: u8 = 0xaf;
    pub const TEST: u8 = 0x85;
    pub const SETCC: u8 = 0x90;
    pub const JCC_SHORT: u8 = 0x70;
    pub const JCC: u8 = 0x80;
    pub const JMP_SHORT: u8 = 0xeb;
    pub const JMP: u8 = 0xe9;
    pub const EXIT: u8 = 0xf4;
    /// Two-byte opcodes
    pub const ESCAPE: u8 = 0x0f;
}

#[inline(always)]
fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl Inst {
    pub fn encode(&self, out: &mut Vec<u8>) {
        use opcode::*;
        match *self {
            Inst::Alu(op, dst, src) => {
                out.extend_from_slice(&[ALU, op as u8, dst as u8]);
                src.encode(out);
            }
            Inst::Mov(dst, src) => {
                out.extend_from_slice(&[MOV, dst as u8]);
                src.encode(out);
            }
            Inst::Store(mem, src) => {
                out.push(STORE);
                mem.encode(out);
                out.push(src as u8);
            }
            Inst::StoreImm(mem, imm) => {
                out.push(STORE_IMM);
                mem.encode(out);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            Inst::Shift(op, reg, amount) => out.extend_from_slice(&[SHIFT, op as u8, reg as u8, amount]),
            Inst::Imul(dst, src) => {
                out.extend_from_slice(&[ESCAPE, IMUL, dst as u8]);
                src.encode(out);
            }
            Inst::Test(a, b) => out.extend_from_slice(&[TEST, a as u8, b as u8]),
            Inst::Setcc(cc, reg) => out.extend_from_slice(&[ESCAPE, SETCC | cc as u8, reg as u8]),
            Inst::Jcc(cc, rel) => {
                out.extend_from_slice(&[ESCAPE, JCC | cc as u8]);
                out.extend_from_slice(&rel.to_le_bytes());
            }
            Inst::JccShort(cc, rel) => out.extend_from_slice(&[JCC_SHORT | cc as u8, rel as u8]),
            Inst::Jmp(rel) => {
                out.push(JMP);
                out.extend_from_slice(&rel.to_le_bytes());
            }
            Inst::JmpShort(rel) => out.extend_from_slice(&[JMP_SHORT, rel as u8]),
            Inst::Exit(exit) => {
                out.push(EXIT);
                match exit {
                    HostExit::ExitTo(pc) => {
                        out.push(0);
                        out.extend_from_slice(&pc.to_le_bytes());
                    }
                    HostExit::Interrupt(pc) => {
                        out.push(1);
                        out.extend_from_slice(&pc.to_le_bytes());
                    }
                    HostExit::CallInterp(idx) => {
                        out.push(2);
                        out.extend_from_slice(&(idx as u32).to_le_bytes());
                    }
                }
            }
        }
    }

    /// Decodes the instruction at the start of `bytes`, returning it with its length
    pub fn decode(bytes: &[u8]) -> (Inst, usize) {
        use opcode::*;
        match bytes[0] {
            ALU => {
                let (src, len) = Src::decode(&bytes[3..]);
                (Inst::Alu(AluOp::ALL[(bytes[1] & 7) as usize], Reg::from_byte(bytes[2]), src), 3 + len)
            }
            MOV => {
                let (src, len) = Src::decode(&bytes[2..]);
                (Inst::Mov(Reg::from_byte(bytes[1]), src), 2 + len)
            }
            STORE => (Inst::Store(Mem::decode(&bytes[1..]), Reg::from_byte(bytes[3])), 4),
            STORE_IMM => (Inst::StoreImm(Mem::decode(&bytes[1..]), read_u32(&bytes[3..])), 7),
            SHIFT => {
                let op = match bytes[1] {
                    4 => ShiftOp::Shl,
                    5 => ShiftOp::Shr,
                    _ => ShiftOp::Sar,
                };
                (Inst::Shift(op, Reg::from_byte(bytes[2]), bytes[3]), 4)
            }
            TEST => (Inst::Test(Reg::from_byte(bytes[1]), Reg::from_byte(bytes[2])), 3),
            JMP_SHORT => (Inst::JmpShort(bytes[1] as i8), 2),
            JMP => (Inst::Jmp(read_u32(&bytes[1..]) as i32), 5),
            EXIT => {
                let value = read_u32(&bytes[2..]);
                let exit = match bytes[1] {
                    0 => HostExit::ExitTo(value),
                    1 => HostExit::Interrupt(value),
                    _ => HostExit::CallInterp(value as u16),
                };
                (Inst::Exit(exit), 6)
            }
            ESCAPE => match bytes[1] {
                IMUL => {
                    let (src, len) = Src::decode(&bytes[3..]);
                    (Inst::Imul(Reg::from_byte(bytes[2]), src), 3 + len)
                }
                b if b & 0xf0 == SETCC => (Inst::Setcc(Cond::from_byte(b), Reg::from_byte(bytes[2])), 3),
                b if b & 0xf0 == JCC => (Inst::Jcc(Cond::from_byte(b), read_u32(&bytes[2..]) as i32), 6),
                b => panic!("bad host opcode 0f {:02x}", b),
            },
            b if b & 0xf0 == JCC_SHORT => (Inst::JccShort(Cond::from_byte(b), bytes[1] as i8), 2),
            b => panic!("bad host opcode {:02x}", b),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
struct Flags {
    zf: bool,
    sf: bool,
    cf: bool,
    of: bool,
}

impl Flags {
    fn holds(self, cc: Cond) -> bool {
        match cc {
            Cond::B => self.cf,
            Cond::Ae => !self.cf,
            Cond::E => self.zf,
            Cond::Ne => !self.zf,
            Cond::L => self.sf != self.of,
            Cond::Ge => self.sf == self.of,
            Cond::Le => self.zf || self.sf != self.of,
            Cond::G => !self.zf && self.sf == self.of,
        }
    }

    fn logic(result: u32) -> Flags {
        Flags { zf: result == 0, sf: (result as i32) < 0, cf: false, of: false }
    }
}

/// Executes host code against a CPU's state
#[derive(Default)]
pub struct HostMachine {
    regs: [u32; REG_COUNT],
    flags: Flags,
    taken: u32,
    /// Host instructions retired, for statistics
    pub retired: u64,
}

impl HostMachine {
    pub fn new() -> HostMachine {
        HostMachine::default()
    }

    #[inline(always)]
    pub fn reg(&self, reg: Reg) -> u32 {
        self.regs[reg.index()]
    }

    fn load(&self, cpu: &Vr4300, mem: Mem) -> u32 {
        match mem {
            Mem::GprLo(n) => cpu.gpr[n as usize] as u32,
            Mem::GprHi(n) => (cpu.gpr[n as usize] >> 32) as u32,
            Mem::Count => cpu.count(),
            Mem::LastAddr => cpu.last_addr,
            Mem::CountPerOp => cpu.count_per_op,
            Mem::NextInterrupt => {
                if cpu.stop {
                    cpu.count()
                } else {
                    cpu.next_interrupt()
                }
            }
            Mem::Taken => self.taken,
        }
    }

    fn store(&mut self, cpu: &mut Vr4300, mem: Mem, value: u32) {
        match mem {
            Mem::GprLo(0) | Mem::GprHi(0) => {}
            Mem::GprLo(n) => {
                let gpr = &mut cpu.gpr[n as usize];
                *gpr = (*gpr & !0xffff_ffff) | value as u64;
            }
            Mem::GprHi(n) => {
                let gpr = &mut cpu.gpr[n as usize];
                *gpr = (*gpr & 0xffff_ffff) | ((value as u64) << 32);
            }
            Mem::Count => *cpu.cop0.reg_mut(cp0::COUNT) = value,
            Mem::LastAddr => cpu.last_addr = value,
            Mem::Taken => self.taken = value,
            Mem::CountPerOp | Mem::NextInterrupt => error!("store to read-only slot {:?}", mem),
        }
    }

    fn source(&self, cpu: &Vr4300, src: Src) -> u32 {
        match src {
            Src::Reg(r) => self.regs[r.index()],
            Src::Mem(m) => self.load(cpu, m),
            Src::Imm(imm) => imm,
        }
    }

    fn alu(&mut self, op: AluOp, a: u32, b: u32) -> u32 {
        let carry = self.flags.cf as u32;
        let (result, flags) = match op {
            AluOp::Add | AluOp::Adc => {
                let c = if op == AluOp::Adc { carry } else { 0 };
                let wide = a as u64 + b as u64 + c as u64;
                let signed = a as i32 as i64 + b as i32 as i64 + c as i64;
                let result = wide as u32;
                let of = signed != result as i32 as i64;
                (result, Flags { cf: wide > u32::MAX as u64, of, ..Flags::logic(result) })
            }
            AluOp::Sub | AluOp::Sbb | AluOp::Cmp => {
                let c = if op == AluOp::Sbb { carry } else { 0 };
                let result = a.wrapping_sub(b).wrapping_sub(c);
                let signed = a as i32 as i64 - b as i32 as i64 - c as i64;
                let of = signed != result as i32 as i64;
                let cf = (a as u64) < b as u64 + c as u64;
                (result, Flags { cf, of, ..Flags::logic(result) })
            }
            AluOp::And => (a & b, Flags::logic(a & b)),
            AluOp::Or => (a | b, Flags::logic(a | b)),
            AluOp::Xor => (a ^ b, Flags::logic(a ^ b)),
        };
        self.flags = flags;
        if op == AluOp::Cmp {
            a
        } else {
            result
        }
    }

    /// Runs `code` from `entry` until it exits
    pub fn run(&mut self, code: &[u8], entry: u32, cpu: &mut Vr4300) -> HostExit {
        let mut at = entry as usize;
        loop {
            let (inst, len) = Inst::decode(&code[at..]);
            at += len;
            self.retired += 1;
            match inst {
                Inst::Alu(op, dst, src) => {
                    let b = self.source(cpu, src);
                    self.regs[dst.index()] = self.alu(op, self.regs[dst.index()], b);
                }
                Inst::Mov(dst, src) => self.regs[dst.index()] = self.source(cpu, src),
                Inst::Store(mem, src) => {
                    let value = self.regs[src.index()];
                    self.store(cpu, mem, value);
                }
                Inst::StoreImm(mem, imm) => self.store(cpu, mem, imm),
                Inst::Shift(op, reg, amount) => {
                    let value = self.regs[reg.index()];
                    let amount = (amount & 31) as u32;
                    let result = match op {
                        ShiftOp::Shl => value << amount,
                        ShiftOp::Shr => value >> amount,
                        ShiftOp::Sar => ((value as i32) >> amount) as u32,
                    };
                    self.regs[reg.index()] = result;
                    self.flags = Flags::logic(result);
                }
                Inst::Imul(dst, src) => {
                    let b = self.source(cpu, src);
                    self.regs[dst.index()] = self.regs[dst.index()].wrapping_mul(b);
                }
                Inst::Test(a, b) => self.flags = Flags::logic(self.regs[a.index()] & self.regs[b.index()]),
                Inst::Setcc(cc, reg) => self.regs[reg.index()] = self.flags.holds(cc) as u32,
                Inst::Jcc(cc, rel) => {
                    if self.flags.holds(cc) {
                        at = (at as isize + rel as isize) as usize;
                    }
                }
                Inst::JccShort(cc, rel) => {
                    if self.flags.holds(cc) {
                        at = (at as isize + rel as isize) as usize;
                    }
                }
                Inst::Jmp(rel) => at = (at as isize + rel as isize) as usize,
                Inst::JmpShort(rel) => at = (at as isize + rel as isize) as usize,
                Inst::Exit(exit) => return exit,
            }
        }
    }
}
