//! Interpreter over the translation cache.
//!
//! The program counter is a `(page, index)` pair into the cache rather than a reference, so a
//! page being reset or dropped under the running code never leaves anything dangling: the next
//! lookup simply misses and execution re-enters through `jump_to`.

use log::error;

use crate::exec::{self, Flow, JumpEnd};
use crate::instructions::OpKind;
use crate::translation_cache::{self, Dispatch, JumpKind, PrecompiledInstruction, TranslationCache, PAGE_SIZE};
use crate::{Bus, ExitReason, Vr4300};

pub struct CachedInterpreter {
    pub cache: TranslationCache,
    page: u32,
    idx: usize,
}

#[inline(always)]
fn check_point(cpu: &Vr4300) -> Option<ExitReason> {
    cpu.interrupt_due().then(|| ExitReason::at_check_point(cpu))
}

impl CachedInterpreter {
    pub fn new(max_pages: usize) -> CachedInterpreter {
        CachedInterpreter {
            cache: TranslationCache::new(max_pages),
            page: 0,
            idx: 0,
        }
    }

    pub fn execute<B: Bus + ?Sized>(&mut self, cpu: &mut Vr4300, bus: &mut B) -> ExitReason {
        self.resume(cpu, bus);
        loop {
            if let Some(exit) = self.step(cpu, bus) {
                return exit;
            }
        }
    }

    /// Picks up at `cpu.pc` after the rest of the system had a turn
    pub(crate) fn resume<B: Bus + ?Sized>(&mut self, cpu: &mut Vr4300, bus: &mut B) {
        self.sync_invalidations(cpu, bus);
        self.jump_to_pc(cpu);
    }

    #[inline(always)]
    pub(crate) fn position(&self) -> (u32, usize) {
        (self.page, self.idx)
    }

    #[inline(always)]
    pub(crate) fn set_position(&mut self, page: u32, idx: usize) {
        self.page = page;
        self.idx = idx;
    }

    #[inline(always)]
    fn address_of(page: u32, idx: usize) -> u32 {
        (page << 12).wrapping_add(idx as u32 * 4)
    }

    /// Points the cursor at `addr`. A TLB miss raises the refill exception and lands on its
    /// vector instead; returns true when that happened.
    pub(crate) fn jump_to(&mut self, cpu: &mut Vr4300, addr: u32) -> bool {
        let mut addr = addr;
        let mut redirected = false;
        loop {
            if let Some((page, idx)) = self.cache.enter(cpu, addr) {
                self.page = page;
                self.idx = idx;
                return redirected;
            }
            cpu.pc = addr;
            cpu.tlb_refill_exception(addr, false);
            addr = cpu.pc;
            redirected = true;
        }
    }

    #[inline(always)]
    pub(crate) fn jump_to_pc(&mut self, cpu: &mut Vr4300) -> bool {
        let pc = cpu.pc;
        self.jump_to(cpu, pc)
    }

    /// Drains code writes and DMA ranges into the cache
    pub(crate) fn sync_invalidations<B: Bus + ?Sized>(&mut self, cpu: &mut Vr4300, bus: &mut B) {
        for (addr, len) in cpu.take_code_writes() {
            self.cache.invalidate(addr, len);
        }
        for (paddr, len) in bus.take_dma_writes() {
            let paddr = paddr & 0x1fff_ffff;
            self.cache.invalidate(0x8000_0000 | paddr, len);
            self.cache.invalidate(0xa000_0000 | paddr, len);
        }
    }

    /// Compiles `page` from guest memory. False when the fetch raised an exception.
    pub(crate) fn compile<B: Bus + ?Sized>(&mut self, cpu: &mut Vr4300, bus: &mut B, page: u32) -> bool {
        match translation_cache::fetch_page(cpu, bus, page << 12) {
            Some(words) => {
                self.cache.compile(page, &words);
                true
            }
            None => {
                let addr = cpu.pc;
                cpu.tlb_refill_exception(addr, false);
                self.jump_to_pc(cpu);
                false
            }
        }
    }

    /// Runs the record under the cursor. Some when a check point found an event due.
    pub(crate) fn step<B: Bus + ?Sized>(&mut self, cpu: &mut Vr4300, bus: &mut B) -> Option<ExitReason> {
        let Some(record) = self.cache.record(self.page, self.idx) else {
            // page was dropped by a cache flush
            let addr = Self::address_of(self.page, self.idx);
            return self.jump_to(cpu, addr).then(|| check_point(cpu)).flatten();
        };

        match record.dispatch {
            Dispatch::NotCompiled => {
                cpu.pc = record.addr;
                if self.compile(cpu, bus, self.page) {
                    None
                } else {
                    check_point(cpu)
                }
            }
            Dispatch::FinBlock => {
                cpu.pc = record.addr;
                cpu.update_count(record.addr);
                self.jump_to(cpu, record.addr);
                check_point(cpu)
            }
            Dispatch::Exec(kind) => match self.exec(cpu, bus, record, kind) {
                Flow::Next => {
                    self.idx += 1;
                    None
                }
                Flow::Jump => {
                    self.jump_to_pc(cpu);
                    check_point(cpu)
                }
            },
            Dispatch::Jump(kind, jump) => {
                self.jump(cpu, bus, record, kind, jump);
                check_point(cpu)
            }
        }
    }

    #[inline(always)]
    fn exec<B: Bus + ?Sized>(&mut self, cpu: &mut Vr4300, bus: &mut B, record: PrecompiledInstruction, kind: OpKind) -> Flow {
        cpu.pc = record.addr;
        let flow = exec::execute(cpu, bus, record.inst, kind);
        if kind.is_store() || cpu.has_code_writes() {
            self.sync_invalidations(cpu, bus);
        }
        flow
    }

    fn jump<B: Bus + ?Sized>(
        &mut self,
        cpu: &mut Vr4300,
        bus: &mut B,
        record: PrecompiledInstruction,
        kind: OpKind,
        jump: JumpKind,
    ) {
        cpu.pc = record.addr;
        let Some(branch) = exec::evaluate_jump(cpu, record.inst, kind) else {
            self.jump_to_pc(cpu);
            return;
        };
        if jump == JumpKind::Idle && branch.taken {
            exec::idle_skip(cpu);
        }

        let (page, idx) = (self.page, self.idx);
        let end = exec::finish_jump(cpu, branch, |cpu| self.delay_slot(cpu, bus));

        match end {
            JumpEnd::Taken => {
                let local = matches!(jump, JumpKind::Local | JumpKind::Idle);
                if local && self.page == page && self.still_valid(cpu, branch.target) {
                    self.idx = ((branch.target & (PAGE_SIZE - 1)) >> 2) as usize;
                } else {
                    self.jump_to(cpu, branch.target);
                }
            }
            JumpEnd::NotTaken => {
                self.page = page;
                self.idx = idx + 2;
            }
            JumpEnd::Redirected => {
                self.jump_to_pc(cpu);
            }
        }
    }

    /// Stores only flag the unmapped view of their physical page, a TLB-mapped page picks the
    /// flag up here.
    pub(crate) fn still_valid(&mut self, cpu: &Vr4300, addr: u32) -> bool {
        self.cache.sync_aliases(cpu, addr).is_some() && !self.cache.is_invalid(addr)
    }

    /// Executes the delay slot of the jump under the cursor. The cursor is back on the jump
    /// afterwards, even when the slot was the first instruction of the next page.
    fn delay_slot<B: Bus + ?Sized>(&mut self, cpu: &mut Vr4300, bus: &mut B) -> Flow {
        let (page, idx) = (self.page, self.idx);
        let flow = self.slot(cpu, bus, page, idx + 1);
        if !cpu.skip_jump {
            self.page = page;
            self.idx = idx;
        }
        flow
    }

    fn slot<B: Bus + ?Sized>(&mut self, cpu: &mut Vr4300, bus: &mut B, page: u32, idx: usize) -> Flow {
        let mut record = self.cache.record(page, idx);
        if matches!(record, Some(PrecompiledInstruction { dispatch: Dispatch::NotCompiled, .. })) {
            if !self.compile(cpu, bus, page) {
                return Flow::Jump;
            }
            record = self.cache.record(page, idx);
        }

        let Some(record) = record else {
            if self.jump_to_pc(cpu) {
                return Flow::Jump;
            }
            let (page, idx) = (self.page, self.idx);
            return self.slot(cpu, bus, page, idx);
        };

        match record.dispatch {
            Dispatch::FinBlock => {
                if self.jump_to(cpu, record.addr) {
                    return Flow::Jump;
                }
                let (page, idx) = (self.page, self.idx);
                self.slot(cpu, bus, page, idx)
            }
            Dispatch::Exec(kind) => self.exec(cpu, bus, record, kind),
            Dispatch::Jump(kind, jump) => {
                // a jump in a delay slot: run it and let its target win
                self.page = page;
                self.idx = idx;
                self.jump(cpu, bus, record, kind, jump);
                Flow::Jump
            }
            Dispatch::NotCompiled => {
                error!("page {:#010x} did not compile", page << 12);
                Flow::Jump
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_queue::EventKind;
    use crate::testing::{self, asm, FlatBus};

    fn setup(program: &[u32]) -> (Vr4300, FlatBus, CachedInterpreter) {
        let mut cpu = Vr4300::new(2);
        cpu.set_track_code_writes(true);
        let mut bus = FlatBus::new(0x10000);
        bus.load(0x1000, program);
        cpu.set_pc(0x8000_1000);
        (cpu, bus, CachedInterpreter::new(64))
    }

    #[test]
    fn runs_loop_and_compiles_once() {
        let (mut cpu, mut bus, mut engine) = setup(&[
            asm::addiu(1, 0, 3),
            asm::addiu(2, 2, 7),
            asm::addiu(1, 1, -1),
            asm::bne(1, 0, -3),
            asm::NOP,
            asm::beq(0, 0, -1),
            asm::NOP,
        ]);
        cpu.deadline = Some(1000);
        assert_eq!(engine.execute(&mut cpu, &mut bus), ExitReason::EventDue);
        assert_eq!(cpu.gpr[2], 21);
        assert_eq!(cpu.pc, 0x8000_1014);
        assert_eq!(engine.cache.compiled_pages(), 1);

        cpu.deadline = Some(2000);
        engine.execute(&mut cpu, &mut bus);
        assert_eq!(engine.cache.compiled_pages(), 1);
    }

    #[test]
    fn self_modifying_store_recompiles_on_next_entry() {
        // 0x80001000: a0 = 0x80001100; store the word in a1 there, jump to it
        let (mut cpu, mut bus, mut engine) = setup(&[
            asm::lui(4, 0x8000),
            asm::ori(4, 4, 0x1100),
            asm::lui(5, 0x2406),            // a1 = addiu $a2, $zero, 0x2a
            asm::ori(5, 5, 0x002a),
            asm::sw(5, 4, 0),
            asm::jr(4),
            asm::NOP,
        ]);
        bus.load(0x1100, &[asm::addiu(6, 0, 1), asm::beq(0, 0, -1), asm::NOP]);
        cpu.deadline = Some(400);

        engine.execute(&mut cpu, &mut bus);
        assert_eq!(cpu.gpr[6], 0x2a);
        assert_eq!(engine.cache.compiled_pages(), 2);
        assert!(!engine.cache.is_invalid(0x8000_1000));
    }

    #[test]
    fn dma_write_invalidates_compiled_page() {
        let (mut cpu, mut bus, mut engine) = setup(&[asm::addiu(1, 0, 1), asm::beq(0, 0, -1), asm::NOP]);
        cpu.deadline = Some(100);
        engine.execute(&mut cpu, &mut bus);
        assert_eq!(cpu.gpr[1], 1);

        bus.dma_write(0x1000, &[asm::addiu(1, 0, 2)]);
        cpu.set_pc(0x8000_1000);
        cpu.deadline = Some(cpu.count() + 100);
        engine.execute(&mut cpu, &mut bus);
        assert_eq!(cpu.gpr[1], 2);
        assert_eq!(engine.cache.compiled_pages(), 2);
    }

    #[test]
    fn delay_slot_on_next_page_keeps_current_page() {
        // branch in the last slot of page 0x80001000, its delay slot starts page 0x80002000
        let mut cpu = Vr4300::new(2);
        cpu.set_track_code_writes(true);
        let mut bus = FlatBus::new(0x10000);
        bus.load(0x1ff8, &[asm::addiu(1, 0, 1), asm::bne(1, 0, 3)]);
        bus.load(0x2000, &[asm::addiu(2, 0, 5), asm::addiu(3, 0, 6), asm::addiu(4, 0, 7), asm::beq(0, 0, -1), asm::NOP]);
        cpu.set_pc(0x8000_1ff8);
        cpu.deadline = Some(100);
        let mut engine = CachedInterpreter::new(64);
        engine.execute(&mut cpu, &mut bus);

        // delay slot ran, then the branch went to 0x8000200c skipping 0x80002004 and 0x80002008
        assert_eq!(cpu.gpr[2], 5);
        assert_eq!(cpu.gpr[3], 0);
        assert_eq!(cpu.gpr[4], 0);
        assert_eq!(cpu.pc, 0x8000_200c);
    }

    #[test]
    fn untaken_branch_in_last_slot_falls_through_to_next_page() {
        let mut cpu = Vr4300::new(2);
        let mut bus = FlatBus::new(0x10000);
        bus.load(0x1ffc, &[asm::bne(0, 0, 8)]);
        bus.load(0x2000, &[asm::addiu(2, 0, 5), asm::addiu(3, 0, 6), asm::beq(0, 0, -1), asm::NOP]);
        cpu.set_pc(0x8000_1ffc);
        cpu.deadline = Some(100);
        let mut engine = CachedInterpreter::new(64);
        engine.execute(&mut cpu, &mut bus);
        assert_eq!((cpu.gpr[2], cpu.gpr[3]), (5, 6));
        assert_eq!(cpu.pc, 0x8000_2008);
    }

    #[test]
    fn store_into_tlb_mapped_loop_is_seen_by_local_branch() {
        let mut cpu = Vr4300::new(2);
        cpu.set_track_code_writes(true);
        testing::map_tlb(&mut cpu, 0, 0x0040_0000, 0x1000, 0x2000);
        let mut bus = FlatBus::new(0x10000);
        bus.load(0x1000, &[
            asm::lui(4, 0x8000),
            asm::ori(4, 4, 0x1014),         // a0 = kseg0 view of the loop head
            asm::lui(5, 0x2406),
            asm::ori(5, 5, 0x002a),         // a1 = addiu $a2, $zero, 0x2a
            asm::addiu(7, 0, 0x2a),
            asm::addiu(6, 0, 1),            // 0x00400014: overwritten by the store below
            asm::sw(5, 4, 0),
            asm::bne(6, 7, -3),
            asm::NOP,
            asm::beq(0, 0, -1),
            asm::NOP,
        ]);
        cpu.set_pc(0x0040_0000);
        cpu.deadline = Some(400);
        let mut engine = CachedInterpreter::new(64);
        engine.execute(&mut cpu, &mut bus);

        assert_eq!(cpu.gpr[6], 0x2a);
        assert_eq!(cpu.pc, 0x0040_0024);
    }

    #[test]
    fn event_due_returns_at_jump() {
        let (mut cpu, mut bus, mut engine) = setup(&[asm::addiu(1, 1, 1), asm::j(0x8000_1000), asm::NOP]);
        let now = cpu.count();
        cpu.events.schedule(EventKind::Ai, now + 20, now).unwrap();
        assert_eq!(engine.execute(&mut cpu, &mut bus), ExitReason::EventDue);
        assert_eq!(cpu.count(), 24);
        assert_eq!(cpu.gpr[1], 4);
    }
}
