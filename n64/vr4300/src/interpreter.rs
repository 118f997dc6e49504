//! Fetch, decode and execute one instruction at a time.
//!
//! Slowest of the three engines, but it has no state of its own and always sees the current
//! contents of memory. The check points match the caching engines: after every jump or
//! exception, and when sequential execution crosses into a new 4KB page.

use log::trace;

use crate::exec::{self, Flow};
use crate::instructions::{op_kind, OpKind, RType};
use crate::{Bus, ExitReason, Vr4300};

#[derive(Default)]
pub struct Interpreter {
    _private: (),
}

impl Interpreter {
    pub fn new() -> Interpreter {
        Interpreter::default()
    }

    pub fn execute<B: Bus + ?Sized>(&mut self, cpu: &mut Vr4300, bus: &mut B) -> ExitReason {
        loop {
            if let Some(exit) = step(cpu, bus) {
                return exit;
            }
        }
    }
}

#[inline(always)]
fn check_point(cpu: &Vr4300) -> Option<ExitReason> {
    cpu.interrupt_due().then(|| ExitReason::at_check_point(cpu))
}

/// Instruction fetch. None means a TLB miss was raised.
fn fetch<B: Bus + ?Sized>(cpu: &mut Vr4300, bus: &mut B) -> Option<u32> {
    let pc = cpu.pc;
    match cpu.translate(pc, false) {
        Some(paddr) => Some(bus.read32(cpu, paddr)),
        None => {
            cpu.tlb_refill_exception(pc, false);
            None
        }
    }
}

/// Word at `vaddr` without raising anything
fn peek<B: Bus + ?Sized>(cpu: &mut Vr4300, bus: &mut B, vaddr: u32) -> Option<u32> {
    let paddr = cpu.translate(vaddr, false)?;
    Some(bus.read32(cpu, paddr))
}

fn step<B: Bus + ?Sized>(cpu: &mut Vr4300, bus: &mut B) -> Option<ExitReason> {
    let pc = cpu.pc;
    let Some(word) = fetch(cpu, bus) else {
        return check_point(cpu);
    };
    let inst = RType::from_word(word);
    let kind = op_kind(word);

    if kind.is_jump() {
        jump(cpu, bus, inst, kind);
        return check_point(cpu);
    }

    match exec::execute(cpu, bus, inst, kind) {
        Flow::Next => {
            cpu.pc = pc.wrapping_add(4);
            if cpu.pc & 0xfff == 0 {
                cpu.update_count(cpu.pc);
                return check_point(cpu);
            }
            None
        }
        Flow::Jump => check_point(cpu),
    }
}

fn jump<B: Bus + ?Sized>(cpu: &mut Vr4300, bus: &mut B, inst: RType, kind: OpKind) {
    let pc = cpu.pc;
    let Some(branch) = exec::evaluate_jump(cpu, inst, kind) else {
        return;
    };

    if branch.taken && exec::static_target(kind, inst, pc) == Some(pc) {
        let slot = peek(cpu, bus, pc.wrapping_add(4));
        if slot == Some(0) {
            trace!("idle loop at {:#010x}", pc);
            exec::idle_skip(cpu);
        }
    }

    exec::finish_jump(cpu, branch, |cpu| delay_slot(cpu, bus));
}

fn delay_slot<B: Bus + ?Sized>(cpu: &mut Vr4300, bus: &mut B) -> Flow {
    let Some(word) = fetch(cpu, bus) else {
        return Flow::Jump;
    };
    let inst = RType::from_word(word);
    let kind = op_kind(word);
    if kind.is_jump() {
        jump(cpu, bus, inst, kind);
        return Flow::Jump;
    }
    exec::execute(cpu, bus, inst, kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_queue::EventKind;
    use crate::testing::{asm, FlatBus};

    fn setup(program: &[u32]) -> (Vr4300, FlatBus) {
        let mut cpu = Vr4300::new(2);
        let mut bus = FlatBus::new(0x10000);
        bus.load(0x1000, program);
        cpu.set_pc(0x8000_1000);
        (cpu, bus)
    }

    #[test]
    fn counts_down_loop() {
        let (mut cpu, mut bus) = setup(&[
            asm::addiu(1, 0, 3),        // 0x00
            asm::addiu(2, 2, 7),        // 0x04
            asm::addiu(1, 1, -1),       // 0x08
            asm::bne(1, 0, -3),         // 0x0c -> 0x04
            asm::NOP,                   // 0x10
            asm::beq(0, 0, -1),         // 0x14 idle
            asm::NOP,
        ]);
        cpu.deadline = Some(1000);
        let exit = Interpreter::new().execute(&mut cpu, &mut bus);
        assert_eq!(exit, ExitReason::EventDue);
        assert_eq!(cpu.gpr[2], 21);
        assert_eq!(cpu.gpr[1], 0);
        assert_eq!(cpu.pc, 0x8000_1014);
        // fast-forwarded to the deadline by the idle loop
        assert!(cpu.deadline_reached());
    }

    #[test]
    fn check_point_at_page_crossing() {
        let mut cpu = Vr4300::new(1);
        let mut bus = FlatBus::new(0x10000);
        cpu.set_pc(0x8000_1ff8);
        cpu.deadline = Some(1);
        let exit = Interpreter::new().execute(&mut cpu, &mut bus);
        assert_eq!(exit, ExitReason::EventDue);
        assert_eq!(cpu.pc, 0x8000_2000);
        assert_eq!(cpu.count(), 2);
    }

    #[test]
    fn stop_flag_ends_run() {
        let (mut cpu, mut bus) = setup(&[asm::beq(0, 0, -1), asm::NOP]);
        cpu.stop = true;
        assert_eq!(Interpreter::new().execute(&mut cpu, &mut bus), ExitReason::Stopped);
    }

    #[test]
    fn due_event_interrupts_after_jump() {
        let (mut cpu, mut bus) = setup(&[asm::addiu(1, 1, 1), asm::j(0x8000_1000), asm::NOP]);
        let now = cpu.count();
        cpu.events.schedule(EventKind::Vi, now + 20, now).unwrap();
        let exit = Interpreter::new().execute(&mut cpu, &mut bus);
        assert_eq!(exit, ExitReason::EventDue);
        // three instructions per pass at two cycles each
        assert_eq!(cpu.count(), 24);
        assert_eq!(cpu.gpr[1], 4);
        assert_eq!(cpu.pc, 0x8000_1000);
    }
}
