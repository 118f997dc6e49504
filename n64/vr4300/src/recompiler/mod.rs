//! Recompiler engine.
//!
//! Pages come out of the shared translation cache exactly as the cached interpreter compiles
//! them; the first time a compiled page is entered it is also translated to host code
//! ([`codegen`]), which then runs on the host machine ([`host`]). Records without a host
//! translation, and the page tails, are handed to the cached interpreter one at a time.

pub mod assembler;
pub mod codegen;
pub mod host;
pub mod regcache;

use log::trace;

use crate::cached_interp::CachedInterpreter;
use crate::translation_cache::TranslationCache;
use crate::{Bus, ExitReason, Vr4300};

use host::{HostExit, HostMachine};

/// Host code of one page. Each record's `host_offset` is its entry trampoline in `code`.
#[derive(Debug)]
pub struct HostBlock {
    pub code: Vec<u8>,
    /// Records with a host translation
    pub native: usize,
}

pub struct Recompiler {
    interp: CachedInterpreter,
    machine: HostMachine,
    blocks_built: u64,
}

impl Recompiler {
    pub fn new(max_pages: usize) -> Recompiler {
        Recompiler {
            interp: CachedInterpreter::new(max_pages),
            machine: HostMachine::new(),
            blocks_built: 0,
        }
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.interp.cache
    }

    pub fn cache_mut(&mut self) -> &mut TranslationCache {
        &mut self.interp.cache
    }

    /// Pages translated to host code so far
    pub fn blocks_built(&self) -> u64 {
        self.blocks_built
    }

    /// Host instructions executed so far
    pub fn host_instructions(&self) -> u64 {
        self.machine.retired
    }

    pub fn execute<B: Bus + ?Sized>(&mut self, cpu: &mut Vr4300, bus: &mut B) -> ExitReason {
        self.interp.resume(cpu, bus);
        loop {
            if let Some(exit) = self.step(cpu, bus) {
                return exit;
            }
        }
    }

    fn step<B: Bus + ?Sized>(&mut self, cpu: &mut Vr4300, bus: &mut B) -> Option<ExitReason> {
        let (page, idx) = self.interp.position();
        let Some((block, entry)) = self.host_entry(cpu, page, idx) else {
            return self.interp.step(cpu, bus);
        };

        match self.machine.run(&block.code, entry, cpu) {
            HostExit::CallInterp(idx) => {
                self.interp.set_position(page, idx as usize);
                self.interp.step(cpu, bus)
            }
            HostExit::ExitTo(target) => {
                cpu.pc = target;
                self.interp.jump_to(cpu, target);
                cpu.interrupt_due().then(|| ExitReason::at_check_point(cpu))
            }
            HostExit::Interrupt(target) => {
                cpu.pc = target;
                self.interp.jump_to(cpu, target);
                Some(ExitReason::at_check_point(cpu))
            }
        }
    }

    /// Host code and entry offset for the record under the cursor, translating the page first
    /// if needed. None when the page has to go through the interpreter: not compiled yet, or
    /// invalidated while running.
    fn host_entry(&mut self, cpu: &Vr4300, page: u32, idx: usize) -> Option<(std::rc::Rc<HostBlock>, u32)> {
        if !self.interp.still_valid(cpu, page << 12) {
            return None;
        }
        let cache = &mut self.interp.cache;
        let code = cache.page_mut(page)?;
        if !code.is_compiled() {
            return None;
        }
        if code.host.is_none() {
            trace!("translating page {:#010x}", code.start);
            codegen::compile_page(code);
            self.blocks_built += 1;
        }
        let entry = code.records.get(idx)?.host_offset;
        code.host.clone().map(|block| (block, entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_queue::EventKind;
    use crate::interpreter::Interpreter;
    use crate::testing::{asm, FlatBus};
    use rstest::rstest;

    fn run_with(engine: &str, program: &[u32], deadline: u32) -> (Vr4300, FlatBus) {
        let mut cpu = Vr4300::new(2);
        cpu.set_track_code_writes(engine != "interpreter");
        let mut bus = FlatBus::new(0x10000);
        bus.load(0x1000, program);
        cpu.set_pc(0x8000_1000);
        cpu.deadline = Some(deadline);
        match engine {
            "interpreter" => Interpreter::new().execute(&mut cpu, &mut bus),
            "cached" => CachedInterpreter::new(64).execute(&mut cpu, &mut bus),
            _ => Recompiler::new(64).execute(&mut cpu, &mut bus),
        };
        (cpu, bus)
    }

    /// Sums 1..=10 into r2 and stores it, jumping through a second page and back
    fn mixed_program() -> Vec<u32> {
        let mut program = vec![
            asm::addiu(1, 0, 10),       // 0x000
            asm::addu(2, 2, 1),         // 0x004
            asm::addiu(1, 1, -1),       // 0x008
            asm::bne(1, 0, -3),         // 0x00c -> 0x004
            asm::slt(3, 1, 2),          // 0x010 delay slot
            asm::lui(4, 0x8000),        // 0x014
            asm::sw(2, 4, 0x800),       // 0x018
            asm::lw(5, 4, 0x800),       // 0x01c
            asm::j(0x8000_2000),        // 0x020
            asm::daddu(6, 5, 5),        // 0x024
        ];
        program.resize(0x400, asm::NOP);
        // 0x80002000
        program.extend([asm::xor(7, 6, 2), asm::jal(0x8000_1030), asm::NOP]);
        program[0x30 / 4] = asm::beq(0, 0, -1);
        program[0x34 / 4] = asm::NOP;
        program
    }

    #[rstest]
    #[case("cached")]
    #[case("recompiler")]
    fn engines_agree_with_interpreter(#[case] engine: &str) {
        let (reference, ref_bus) = run_with("interpreter", &mixed_program(), 5000);
        let (cpu, bus) = run_with(engine, &mixed_program(), 5000);
        assert_eq!(reference.gpr[2], 55);
        assert_eq!(reference.gpr[7], 110 ^ 55);
        assert_eq!(cpu.gpr, reference.gpr);
        assert_eq!(cpu.pc, reference.pc);
        assert_eq!(cpu.count(), reference.count());
        assert_eq!(bus.words[0x200], ref_bus.words[0x200]);
    }

    #[test]
    fn loop_runs_as_host_code_and_translates_once() {
        let program = [
            asm::addiu(1, 0, 50),
            asm::addiu(2, 2, 3),
            asm::addiu(1, 1, -1),
            asm::bne(1, 0, -3),
            asm::NOP,
            asm::beq(0, 0, -1),
            asm::NOP,
        ];
        let mut cpu = Vr4300::new(2);
        let mut bus = FlatBus::new(0x10000);
        bus.load(0x1000, &program);
        cpu.set_pc(0x8000_1000);
        cpu.deadline = Some(10_000);
        let mut engine = Recompiler::new(64);
        assert_eq!(engine.execute(&mut cpu, &mut bus), ExitReason::EventDue);
        assert_eq!(cpu.gpr[2], 150);
        assert_eq!(cpu.pc, 0x8000_1014);
        assert_eq!(engine.blocks_built(), 1);
        assert!(engine.host_instructions() > 50 * 10);

        cpu.deadline = Some(20_000);
        engine.execute(&mut cpu, &mut bus);
        assert_eq!(engine.blocks_built(), 1);
        assert_eq!(engine.cache().compiled_pages(), 1);
    }

    #[test]
    fn store_into_running_page_retranslates_on_entry() {
        let program = [
            asm::lui(4, 0x8000),
            asm::ori(4, 4, 0x1100),
            asm::lui(5, 0x2406),            // a1 = addiu $a2, $zero, 0x2a
            asm::ori(5, 5, 0x002a),
            asm::sw(5, 4, 0),
            asm::jr(4),
            asm::NOP,
        ];
        let mut cpu = Vr4300::new(2);
        cpu.set_track_code_writes(true);
        let mut bus = FlatBus::new(0x10000);
        bus.load(0x1000, &program);
        bus.load(0x1100, &[asm::addiu(6, 0, 1), asm::beq(0, 0, -1), asm::NOP]);
        cpu.set_pc(0x8000_1000);
        cpu.deadline = Some(400);
        let mut engine = Recompiler::new(64);
        engine.execute(&mut cpu, &mut bus);
        assert_eq!(cpu.gpr[6], 0x2a);
        assert_eq!(engine.cache().compiled_pages(), 2);
        assert_eq!(engine.blocks_built(), 2);
    }

    #[test]
    fn due_event_leaves_host_code_at_the_jump() {
        let program = [asm::addiu(1, 1, 1), asm::j(0x8000_1000), asm::NOP];
        let mut cpu = Vr4300::new(2);
        let mut bus = FlatBus::new(0x10000);
        bus.load(0x1000, &program);
        cpu.set_pc(0x8000_1000);
        let now = cpu.count();
        cpu.events.schedule(EventKind::Si, now + 20, now).unwrap();
        let mut engine = Recompiler::new(64);
        assert_eq!(engine.execute(&mut cpu, &mut bus), ExitReason::EventDue);
        assert_eq!(cpu.count(), 24);
        assert_eq!(cpu.gpr[1], 4);
        assert_eq!(cpu.pc, 0x8000_1000);
    }

    #[test]
    fn stop_request_is_seen_by_host_code() {
        let program = [asm::addiu(1, 1, 1), asm::j(0x8000_1000), asm::NOP];
        let mut cpu = Vr4300::new(2);
        let mut bus = FlatBus::new(0x10000);
        bus.load(0x1000, &program);
        cpu.set_pc(0x8000_1000);
        cpu.stop = true;
        assert_eq!(Recompiler::new(64).execute(&mut cpu, &mut bus), ExitReason::Stopped);
        assert_eq!(cpu.gpr[1], 1);
    }
}
