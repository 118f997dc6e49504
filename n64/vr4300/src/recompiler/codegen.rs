//! Host code generation for a compiled page.
//!
//! Integer ALU ops and static jumps whose delay slot is such an op are translated. Everything
//! else (memory, COP0/COP1, multiply/divide, register jumps, idle loops) leaves the host code
//! through `CallInterp` and runs on the interpreter for one record.
//!
//! Straight-line ALU code keeps guest registers in host registers from one instruction to the
//! next. Every exit and every jump writes back all dirty registers first. Each record gets an
//! entry trampoline that loads the registers its body expects to be bound (its `need_map`), so
//! control can come in from anywhere, in particular from the engine after an interpreted record
//! and from jumps inside the page.

use std::rc::Rc;

use log::debug;

use super::assembler::{Assembler, Label};
use super::host::{AluOp, Cond, HostExit, Inst, Mem, Reg, ShiftOp, Src};
use super::regcache::RegCache;
use super::HostBlock;
use crate::exec;
use crate::instructions::{OpKind, RType};
use crate::translation_cache::{CodePage, Dispatch, JumpKind, PrecompiledInstruction, PAGE_RECORDS, PAGE_SIZE, PAGE_SLOTS};

const EAX: Reg = Reg::SCRATCH;

fn is_native_exec(kind: OpKind) -> bool {
    use OpKind::*;
    matches!(
        kind,
        Sll | Srl | Sra | Add | Addu | Sub | Subu | And | Or | Xor | Nor | Slt | Sltu | Dadd | Daddu | Dsub | Dsubu
            | Addi | Addiu | Daddi | Daddiu | Slti | Sltiu | Andi | Ori | Xori | Lui | Sync
    )
}

fn is_native_jump(records: &[PrecompiledInstruction], idx: usize) -> bool {
    let Dispatch::Jump(kind, jump) = records[idx].dispatch else {
        return false;
    };
    let slot_native = idx + 1 < PAGE_SLOTS && matches!(records[idx + 1].dispatch, Dispatch::Exec(k) if is_native_exec(k));
    jump != JumpKind::Idle
        && slot_native
        && matches!(kind, OpKind::J | OpKind::Jal | OpKind::Beq | OpKind::Bne | OpKind::Bltz | OpKind::Bgez)
}

fn is_native(records: &[PrecompiledInstruction], idx: usize) -> bool {
    match records[idx].dispatch {
        Dispatch::Exec(kind) => is_native_exec(kind),
        Dispatch::Jump(..) => is_native_jump(records, idx),
        Dispatch::NotCompiled | Dispatch::FinBlock => false,
    }
}

struct Compiler<'a> {
    asm: Assembler,
    regs: RegCache,
    records: &'a [PrecompiledInstruction],
    page: u32,
    bodies: Vec<Label>,
    entries: Vec<Label>,
}

/// Result of compiling one page: the host block and each record's entry offset and need map
struct Output {
    block: HostBlock,
    offsets: Vec<u32>,
    need_maps: Vec<u8>,
}

/// Generates the host code of `page` and stores it, with each record's entry point and
/// `need_map`, in the page
pub fn compile_page(page: &mut CodePage) {
    let output = Compiler::new(&page.records, page.start >> 12).run();
    for (record, (&offset, &need_map)) in page.records.iter_mut().zip(output.offsets.iter().zip(&output.need_maps)) {
        record.host_offset = offset;
        record.need_map = need_map;
    }
    debug!(
        "page {:#010x}: {} native records, {} bytes of host code",
        page.start,
        output.block.native,
        output.block.code.len()
    );
    page.host = Some(Rc::new(output.block));
}

impl<'a> Compiler<'a> {
    fn new(records: &'a [PrecompiledInstruction], page: u32) -> Compiler<'a> {
        let mut asm = Assembler::new();
        let bodies = (0..PAGE_RECORDS).map(|_| asm.new_label()).collect();
        let entries = (0..PAGE_RECORDS).map(|_| asm.new_label()).collect();
        Compiler { asm, regs: RegCache::new(), records, page, bodies, entries }
    }

    fn run(mut self) -> Output {
        let mut snapshots = vec![Vec::new(); PAGE_RECORDS];
        let native: Vec<bool> = (0..PAGE_RECORDS).map(|idx| idx < PAGE_SLOTS && is_native(self.records, idx)).collect();

        for idx in 0..PAGE_SLOTS {
            let record = self.records[idx];
            self.asm.bind(self.bodies[idx]);
            if !native[idx] {
                self.exit(HostExit::CallInterp(idx as u16));
                continue;
            }
            snapshots[idx] = self.regs.bound();

            match record.dispatch {
                Dispatch::Exec(kind) => {
                    self.regs.next_instruction();
                    self.exec(kind, record.inst);
                    if idx + 1 == PAGE_SLOTS {
                        self.exit(HostExit::CallInterp(PAGE_SLOTS as u16));
                    }
                }
                Dispatch::Jump(kind, _) => self.jump(idx, record, kind),
                Dispatch::NotCompiled | Dispatch::FinBlock => unreachable!(),
            }
        }

        let mut offsets = vec![0; PAGE_RECORDS];
        let mut need_maps = vec![0; PAGE_RECORDS];
        for idx in 0..PAGE_RECORDS {
            self.asm.bind(self.entries[idx]);
            offsets[idx] = self.asm.offset();
            if native[idx] {
                for &(reg, guest) in &snapshots[idx] {
                    self.asm.emit(Inst::Mov(reg, Src::Mem(guest)));
                    need_maps[idx] |= reg.bit();
                }
                self.asm.jmp(self.bodies[idx]);
            } else {
                self.asm.emit(Inst::Exit(HostExit::CallInterp(idx as u16)));
            }
        }

        let native = native.iter().filter(|&&n| n).count();
        Output { block: HostBlock { code: self.asm.finish(), native }, offsets, need_maps }
    }

    fn exit(&mut self, exit: HostExit) {
        self.regs.free_all(&mut self.asm);
        self.asm.emit(Inst::Exit(exit));
    }

    fn read(&mut self, guest: Mem) -> Reg {
        self.regs.allocate(&mut self.asm, guest)
    }

    fn write(&mut self, reg: u8) -> (Reg, Reg) {
        let lo = self.regs.allocate_for_write(&mut self.asm, Mem::GprLo(reg));
        let hi = self.regs.allocate_for_write(&mut self.asm, Mem::GprHi(reg));
        (lo, hi)
    }

    fn emit(&mut self, inst: Inst) {
        self.asm.emit(inst);
    }

    /// Sign-extends the 32-bit result in the scratch register into `lo:hi`
    fn finish32(&mut self, (lo, hi): (Reg, Reg)) {
        self.emit(Inst::Mov(lo, Src::Reg(EAX)));
        self.emit(Inst::Mov(hi, Src::Reg(EAX)));
        self.emit(Inst::Shift(ShiftOp::Sar, hi, 31));
    }

    /// Both halves of `a op b` for a 64-bit `b` given as two sources
    fn wide(&mut self, op_lo: AluOp, op_hi: AluOp, a: u8, b: (Src, Src), dest: u8) {
        let a_lo = self.read(Mem::GprLo(a));
        let a_hi = self.read(Mem::GprHi(a));
        let (lo, hi) = self.write(dest);
        self.emit(Inst::Mov(EAX, Src::Reg(a_lo)));
        self.emit(Inst::Alu(op_lo, EAX, b.0));
        self.emit(Inst::Mov(lo, Src::Reg(EAX)));
        self.emit(Inst::Mov(EAX, Src::Reg(a_hi)));
        self.emit(Inst::Alu(op_hi, EAX, b.1));
        self.emit(Inst::Mov(hi, Src::Reg(EAX)));
    }

    fn reg_pair(&mut self, reg: u8) -> (Src, Src) {
        let lo = self.read(Mem::GprLo(reg));
        let hi = self.read(Mem::GprHi(reg));
        (Src::Reg(lo), Src::Reg(hi))
    }

    fn sext_imm(inst: RType) -> (Src, Src) {
        let imm = inst.simm();
        (Src::Imm(imm as u32), Src::Imm((imm >> 32) as u32))
    }

    fn exec(&mut self, kind: OpKind, inst: RType) {
        use OpKind::*;

        let dest = match kind {
            Addi | Addiu | Daddi | Daddiu | Slti | Sltiu | Andi | Ori | Xori | Lui => inst.rt(),
            _ => inst.rd(),
        };
        if dest == 0 || kind == Sync {
            return;
        }

        match kind {
            Sll | Srl | Sra => {
                let a = self.read(Mem::GprLo(inst.rt()));
                let d = self.write(dest);
                let op = match kind {
                    Sll => ShiftOp::Shl,
                    Srl => ShiftOp::Shr,
                    _ => ShiftOp::Sar,
                };
                self.emit(Inst::Mov(EAX, Src::Reg(a)));
                self.emit(Inst::Shift(op, EAX, inst.sa()));
                self.finish32(d);
            }
            Add | Addu | Sub | Subu => {
                let a = self.read(Mem::GprLo(inst.rs()));
                let b = self.read(Mem::GprLo(inst.rt()));
                let d = self.write(dest);
                let op = if matches!(kind, Add | Addu) { AluOp::Add } else { AluOp::Sub };
                self.emit(Inst::Mov(EAX, Src::Reg(a)));
                self.emit(Inst::Alu(op, EAX, Src::Reg(b)));
                self.finish32(d);
            }
            Addi | Addiu => {
                let a = self.read(Mem::GprLo(inst.rs()));
                let d = self.write(dest);
                self.emit(Inst::Mov(EAX, Src::Reg(a)));
                self.emit(Inst::Alu(AluOp::Add, EAX, Src::Imm(inst.simm() as u32)));
                self.finish32(d);
            }
            Lui => {
                let d = self.write(dest);
                self.emit(Inst::Mov(EAX, Src::Imm((inst.uimm() as u32) << 16)));
                self.finish32(d);
            }
            And | Or | Xor | Nor => {
                let b = self.reg_pair(inst.rt());
                let op = match kind {
                    And => AluOp::And,
                    Xor => AluOp::Xor,
                    _ => AluOp::Or,
                };
                self.wide(op, op, inst.rs(), b, dest);
                if kind == Nor {
                    let (lo, hi) = self.write(dest);
                    for half in [lo, hi] {
                        self.emit(Inst::Mov(EAX, Src::Reg(half)));
                        self.emit(Inst::Alu(AluOp::Xor, EAX, Src::Imm(u32::MAX)));
                        self.emit(Inst::Mov(half, Src::Reg(EAX)));
                    }
                }
            }
            Dadd | Daddu | Dsub | Dsubu => {
                let b = self.reg_pair(inst.rt());
                let (lo, hi) = if matches!(kind, Dadd | Daddu) { (AluOp::Add, AluOp::Adc) } else { (AluOp::Sub, AluOp::Sbb) };
                self.wide(lo, hi, inst.rs(), b, dest);
            }
            Daddi | Daddiu => self.wide(AluOp::Add, AluOp::Adc, inst.rs(), Self::sext_imm(inst), dest),
            Andi | Ori | Xori => {
                let a_lo = self.read(Mem::GprLo(inst.rs()));
                let a_hi = self.read(Mem::GprHi(inst.rs()));
                let (lo, hi) = self.write(dest);
                let op = match kind {
                    Andi => AluOp::And,
                    Ori => AluOp::Or,
                    _ => AluOp::Xor,
                };
                self.emit(Inst::Mov(EAX, Src::Reg(a_lo)));
                self.emit(Inst::Alu(op, EAX, Src::Imm(inst.uimm() as u32)));
                self.emit(Inst::Mov(lo, Src::Reg(EAX)));
                let high = if kind == Andi { Src::Imm(0) } else { Src::Reg(a_hi) };
                self.emit(Inst::Mov(hi, high));
            }
            Slt | Sltu | Slti | Sltiu => {
                let b = match kind {
                    Slt | Sltu => self.reg_pair(inst.rt()),
                    _ => Self::sext_imm(inst),
                };
                let a_lo = self.read(Mem::GprLo(inst.rs()));
                let a_hi = self.read(Mem::GprHi(inst.rs()));
                let (lo, hi) = self.write(dest);
                let cc = if matches!(kind, Slt | Slti) { Cond::L } else { Cond::B };
                // 64-bit compare through the borrow of the low halves
                self.emit(Inst::Mov(EAX, Src::Reg(a_lo)));
                self.emit(Inst::Alu(AluOp::Sub, EAX, b.0));
                self.emit(Inst::Mov(EAX, Src::Reg(a_hi)));
                self.emit(Inst::Alu(AluOp::Sbb, EAX, b.1));
                self.emit(Inst::Setcc(cc, lo));
                self.emit(Inst::Mov(hi, Src::Imm(0)));
            }
            _ => unreachable!("{:?} has no host translation", kind),
        }
    }

    /// `count += ((pc - last_addr) >> 2) * count_per_op; last_addr = pc`
    fn update_count(&mut self, pc: u32) {
        self.emit(Inst::Mov(EAX, Src::Imm(pc)));
        self.emit(Inst::Alu(AluOp::Sub, EAX, Src::Mem(Mem::LastAddr)));
        self.emit(Inst::Shift(ShiftOp::Shr, EAX, 2));
        self.emit(Inst::Imul(EAX, Src::Mem(Mem::CountPerOp)));
        self.emit(Inst::Alu(AluOp::Add, EAX, Src::Mem(Mem::Count)));
        self.emit(Inst::Store(Mem::Count, EAX));
        self.emit(Inst::StoreImm(Mem::LastAddr, pc));
    }

    /// Leaves through `Interrupt(resume)` when the next event is due
    fn check(&mut self, resume: u32) {
        let skip = self.asm.new_label();
        self.emit(Inst::Mov(EAX, Src::Mem(Mem::NextInterrupt)));
        self.emit(Inst::Alu(AluOp::Sub, EAX, Src::Mem(Mem::Count)));
        self.emit(Inst::Test(EAX, EAX));
        self.asm.jcc_short(Cond::G, skip);
        self.emit(Inst::Exit(HostExit::Interrupt(resume)));
        self.asm.bind(skip);
    }

    /// Continues at `target`: through its entry when it is in this page, otherwise back to
    /// the engine
    fn transfer(&mut self, target: u32) {
        if target >> 12 == self.page {
            let idx = ((target & (PAGE_SIZE - 1)) >> 2) as usize;
            self.asm.jmp(self.entries[idx]);
        } else {
            self.emit(Inst::Exit(HostExit::ExitTo(target)));
        }
    }

    fn jump(&mut self, idx: usize, record: PrecompiledInstruction, kind: OpKind) {
        let pc = record.addr;
        let inst = record.inst;
        let Some(target) = exec::static_target(kind, inst, pc) else {
            unreachable!("register jump {:?} taken native", kind);
        };

        // condition into the Taken slot, before the delay slot can change the operands
        self.regs.next_instruction();
        let taken_when_zero = match kind {
            OpKind::Beq | OpKind::Bne => {
                let (a_lo, a_hi) = self.reg_pair(inst.rs());
                let (b_lo, b_hi) = self.reg_pair(inst.rt());
                self.emit(Inst::Mov(EAX, a_lo));
                self.emit(Inst::Alu(AluOp::Xor, EAX, b_lo));
                self.emit(Inst::Store(Mem::Taken, EAX));
                self.emit(Inst::Mov(EAX, a_hi));
                self.emit(Inst::Alu(AluOp::Xor, EAX, b_hi));
                self.emit(Inst::Alu(AluOp::Or, EAX, Src::Mem(Mem::Taken)));
                self.emit(Inst::Store(Mem::Taken, EAX));
                Some(kind == OpKind::Beq)
            }
            OpKind::Bltz | OpKind::Bgez => {
                let a_hi = self.read(Mem::GprHi(inst.rs()));
                self.emit(Inst::Mov(EAX, Src::Reg(a_hi)));
                self.emit(Inst::Shift(ShiftOp::Shr, EAX, 31));
                self.emit(Inst::Store(Mem::Taken, EAX));
                Some(kind == OpKind::Bgez)
            }
            _ => None,
        };
        if kind == OpKind::Jal {
            let link = pc.wrapping_add(8);
            let (lo, hi) = self.write(31);
            self.emit(Inst::Mov(lo, Src::Imm(link)));
            self.emit(Inst::Mov(hi, Src::Imm(((link as i32) >> 31) as u32)));
        }

        let Dispatch::Exec(slot_kind) = self.records[idx + 1].dispatch else {
            unreachable!("delay slot is not native");
        };
        self.regs.next_instruction();
        self.exec(slot_kind, self.records[idx + 1].inst);
        self.regs.free_all(&mut self.asm);

        let next = pc.wrapping_add(8);
        self.update_count(next);

        let not_taken = taken_when_zero.map(|when_zero| {
            let label = self.asm.new_label();
            self.emit(Inst::Mov(EAX, Src::Mem(Mem::Taken)));
            self.emit(Inst::Test(EAX, EAX));
            self.asm.jcc(if when_zero { Cond::Ne } else { Cond::E }, label);
            label
        });

        self.emit(Inst::StoreImm(Mem::LastAddr, target));
        self.check(target);
        self.transfer(target);

        if let Some(label) = not_taken {
            self.asm.bind(label);
            self.check(next);
            self.asm.jmp(self.entries[idx + 2]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recompiler::host::HostMachine;
    use crate::testing::{asm, FlatBus};
    use crate::translation_cache::{fetch_page, TranslationCache};
    use crate::Vr4300;

    const BASE: u32 = 0x8000_1000;

    fn compiled(program: &[u32]) -> (TranslationCache, Vr4300) {
        let mut cpu = Vr4300::new(2);
        let mut bus = FlatBus::new(0x10000);
        bus.load(BASE & 0x1fff_ffff, program);
        let mut cache = TranslationCache::new(64);
        let (page, _) = cache.enter(&cpu, BASE).unwrap();
        let words = fetch_page(&mut cpu, &mut bus, BASE).unwrap();
        cache.compile(page, &words);
        compile_page(cache.page_mut(page).unwrap());
        cpu.set_pc(BASE);
        (cache, cpu)
    }

    fn run_from(cache: &TranslationCache, cpu: &mut Vr4300, idx: usize) -> HostExit {
        let page = cache.page(BASE >> 12).unwrap();
        let block = page.host.as_ref().unwrap();
        HostMachine::new().run(&block.code, page.records[idx].host_offset, cpu)
    }

    #[test]
    fn straight_line_alu_runs_natively() {
        let (cache, mut cpu) = compiled(&[
            asm::lui(1, 0x1234),
            asm::ori(1, 1, 0x5678),
            asm::addiu(2, 1, -0x5678),
            asm::subu(3, 0, 1),
            asm::slt(4, 3, 0),
            asm::xor(5, 1, 3),
            asm::daddu(6, 3, 3),
            asm::sll(7, 1, 4),
            asm::sw(1, 0, 0),
        ]);
        assert_eq!(run_from(&cache, &mut cpu, 0), HostExit::CallInterp(8));
        assert_eq!(cpu.gpr[1], 0x1234_5678);
        assert_eq!(cpu.gpr[2], 0x1234_0000);
        assert_eq!(cpu.gpr[3], 0xffff_ffff_edcb_a988);
        assert_eq!(cpu.gpr[4], 1);
        assert_eq!(cpu.gpr[5], 0x1234_5678 ^ 0xffff_ffff_edcb_a988);
        assert_eq!(cpu.gpr[6], 0xffff_ffff_db97_5310);
        assert_eq!(cpu.gpr[7], 0x2345_6780);
    }

    #[test]
    fn records_carry_entry_points_and_need_maps() {
        let (cache, _) = compiled(&[asm::addiu(1, 0, 1), asm::addu(2, 1, 1), asm::sw(2, 0, 0)]);
        let page = cache.page(BASE >> 12).unwrap();
        let records = &page.records;
        assert_eq!(records[0].need_map, 0);
        // r0's low half and both halves of r1 were bound when the addu started
        assert_eq!(records[1].need_map.count_ones(), 3);
        // the store goes through the interpreter
        assert_eq!(records[2].need_map, 0);
        assert_ne!(records[1].host_offset, records[2].host_offset);
        // the rest of the page is NOPs
        assert_eq!(page.host.as_ref().unwrap().native, PAGE_SLOTS - 1);
    }

    #[test]
    fn entering_mid_run_reloads_bound_registers() {
        let (cache, mut cpu) = compiled(&[asm::addiu(1, 0, 1), asm::addu(2, 1, 1), asm::sw(2, 0, 0)]);
        // guest memory says r1 = 20; entering at the addu must not see a stale register
        cpu.gpr[1] = 20;
        assert_eq!(run_from(&cache, &mut cpu, 1), HostExit::CallInterp(2));
        assert_eq!(cpu.gpr[2], 40);
    }

    #[test]
    fn taken_local_branch_loops_until_check_point() {
        let (cache, mut cpu) = compiled(&[
            asm::addiu(1, 1, 1),        // 0x00
            asm::bne(1, 0, -2),         // 0x04 -> 0x00
            asm::addiu(2, 2, 1),        // 0x08 delay slot
        ]);
        cpu.deadline = Some(cpu.count() + 30);
        let exit = run_from(&cache, &mut cpu, 0);
        assert_eq!(exit, HostExit::Interrupt(BASE));
        // three instructions per pass, two cycles each
        assert_eq!(cpu.gpr[1], 5);
        assert_eq!(cpu.gpr[2], 5);
        assert_eq!(cpu.count(), 30);
        assert_eq!(cpu.last_addr, BASE);
    }

    #[test]
    fn untaken_branch_continues_after_delay_slot() {
        let (cache, mut cpu) = compiled(&[
            asm::beq(1, 0, 5),          // r1 != 0: not taken
            asm::addiu(2, 0, 3),
            asm::sw(2, 0, 0),
        ]);
        cpu.gpr[1] = 1;
        assert_eq!(run_from(&cache, &mut cpu, 0), HostExit::CallInterp(2));
        assert_eq!(cpu.gpr[2], 3);
        assert_eq!(cpu.last_addr, BASE + 8);
        assert_eq!(cpu.count(), 4);
    }

    #[test]
    fn jal_out_of_page_links_and_exits() {
        let (cache, mut cpu) = compiled(&[asm::jal(0x8000_4000), asm::NOP]);
        assert_eq!(run_from(&cache, &mut cpu, 0), HostExit::ExitTo(0x8000_4000));
        assert_eq!(cpu.gpr[31], 0xffff_ffff_8000_1008);
        assert_eq!(cpu.last_addr, 0x8000_4000);
    }
}
