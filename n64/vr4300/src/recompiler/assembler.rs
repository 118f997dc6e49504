//! Emits host instructions into a byte buffer and resolves jumps to labels.
//!
//! Backward jumps pick the short form when the target is in reach. Forward jumps are emitted
//! with a 32-bit displacement unless the caller asks for the short form, in which case the
//! target has to end up within 127 bytes: anything else is a layout bug and aborts.

use log::error;

use super::host::{Cond, Inst};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Copy, Clone)]
enum Width {
    Rel8,
    Rel32,
}

struct Fixup {
    /// Offset of the displacement field
    at: usize,
    /// Offset the displacement is relative to
    end: usize,
    label: Label,
    width: Width,
}

#[derive(Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    insts: usize,
}

fn displacement_overflow(from: usize, to: usize) -> ! {
    error!("jump from {:#x} to {:#x} does not fit a short displacement", from, to);
    panic!("host jump displacement overflow");
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler::default()
    }

    #[inline(always)]
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    /// Bytes emitted so far, jumps not yet patched
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Host instructions emitted so far
    pub fn emitted(&self) -> usize {
        self.insts
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
    }

    pub fn emit(&mut self, inst: Inst) {
        inst.encode(&mut self.code);
        self.insts += 1;
    }

    fn short_backward(&self, label: Label, len: usize) -> Option<i8> {
        let target = self.labels[label.0]?;
        let rel = target as isize - (self.code.len() + len) as isize;
        i8::try_from(rel).ok()
    }

    fn long_jump(&mut self, inst: Inst, label: Label) {
        self.emit(inst);
        let end = self.code.len();
        self.fixups.push(Fixup { at: end - 4, end, label, width: Width::Rel32 });
    }

    pub fn jmp(&mut self, label: Label) {
        match self.short_backward(label, 2) {
            Some(rel) => self.emit(Inst::JmpShort(rel)),
            None => self.long_jump(Inst::Jmp(0), label),
        }
    }

    pub fn jcc(&mut self, cc: Cond, label: Label) {
        match self.short_backward(label, 2) {
            Some(rel) => self.emit(Inst::JccShort(cc, rel)),
            None => self.long_jump(Inst::Jcc(cc, 0), label),
        }
    }

    /// Conditional jump that must use the short form
    pub fn jcc_short(&mut self, cc: Cond, label: Label) {
        self.emit(Inst::JccShort(cc, 0));
        let end = self.code.len();
        self.fixups.push(Fixup { at: end - 1, end, label, width: Width::Rel8 });
    }

    /// Patches every jump and hands out the code
    pub fn finish(mut self) -> Vec<u8> {
        for fixup in std::mem::take(&mut self.fixups) {
            let Some(target) = self.labels[fixup.label.0] else {
                error!("jump at {:#x} to a label that was never bound", fixup.at);
                panic!("unbound host label");
            };
            let rel = target as isize - fixup.end as isize;
            match fixup.width {
                Width::Rel8 => match i8::try_from(rel) {
                    Ok(rel) => self.code[fixup.at] = rel as u8,
                    Err(_) => displacement_overflow(fixup.end, target),
                },
                Width::Rel32 => match i32::try_from(rel) {
                    Ok(rel) => self.code[fixup.at..fixup.at + 4].copy_from_slice(&rel.to_le_bytes()),
                    Err(_) => displacement_overflow(fixup.end, target),
                },
            }
        }
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recompiler::host::{AluOp, HostExit, HostMachine, Reg, Src};
    use crate::Vr4300;

    #[test]
    fn backward_jump_is_short_and_forward_is_long() {
        let mut asm = Assembler::new();
        let top = asm.new_label();
        let out = asm.new_label();
        asm.bind(top);
        asm.emit(Inst::Alu(AluOp::Sub, Reg::Ecx, Src::Imm(1)));
        asm.jcc(Cond::E, out);
        asm.jmp(top);
        asm.bind(out);
        asm.emit(Inst::Exit(HostExit::ExitTo(0x1234)));
        let code = asm.finish();

        let (first, len) = Inst::decode(&code);
        assert!(matches!(first, Inst::Alu(..)));
        let (jcc, jcc_len) = Inst::decode(&code[len..]);
        assert_eq!(jcc, Inst::Jcc(Cond::E, 2));
        let (jmp, _) = Inst::decode(&code[len + jcc_len..]);
        assert_eq!(jmp, Inst::JmpShort(-((len + jcc_len + 2) as i8)));
    }

    #[test]
    fn resolved_loop_runs() {
        let mut asm = Assembler::new();
        let top = asm.new_label();
        let out = asm.new_label();
        asm.emit(Inst::Mov(Reg::Ecx, Src::Imm(5)));
        asm.emit(Inst::Mov(Reg::Edx, Src::Imm(0)));
        asm.bind(top);
        asm.emit(Inst::Alu(AluOp::Add, Reg::Edx, Src::Imm(3)));
        asm.emit(Inst::Alu(AluOp::Sub, Reg::Ecx, Src::Imm(1)));
        asm.jcc_short(Cond::E, out);
        asm.jmp(top);
        asm.bind(out);
        asm.emit(Inst::Exit(HostExit::CallInterp(0)));
        let code = asm.finish();

        let mut machine = HostMachine::new();
        let mut cpu = Vr4300::new(2);
        assert_eq!(machine.run(&code, 0, &mut cpu), HostExit::CallInterp(0));
        assert_eq!(machine.reg(Reg::Edx), 15);
    }

    #[test]
    #[should_panic(expected = "displacement overflow")]
    fn short_jump_out_of_reach_is_fatal() {
        let mut asm = Assembler::new();
        let far = asm.new_label();
        asm.jcc_short(Cond::G, far);
        for _ in 0..40 {
            asm.emit(Inst::Mov(Reg::Ecx, Src::Imm(0)));
        }
        asm.bind(far);
        asm.finish();
    }
}
