//! The whole machine as seen by the CPU core, and the loop that runs it.
//!
//! [`Device`] owns the core (CPU state, event queue, execution engine) next to the
//! [`SystemBus`] holding everything on the other side of the memory dispatch table. Control
//! alternates between the engine, which runs guest code until the next interrupt-check point
//! at which something is due, and the event handlers for whatever came due.

use log::{debug, info, trace};
use vr4300::event_queue::{pop_and_dispatch, EventContext, EventHandler, EventHandlers};
use vr4300::{Bus, Config, Core, EventKind, ExitReason, Vr4300};

use crate::memory::{self, MemoryContext, MemoryDispatchTable, MemoryRegion};
use crate::mi::{self, Mi};
use crate::rdram::{self, Rdram, RDRAM_SIZE};
use crate::Error;

/// RSP DMEM and IMEM, 4KB each
const SP_MEM_WORDS: usize = 0x800;
const SP_MEM_BASE: u32 = 0x0400_0000;

/// Longest stretch handed to the engine at once. Deadlines have to stay within half the
/// counter range of `count` to compare correctly.
const MAX_RUN: u64 = 0x4000_0000;

/// Everything the CPU reaches through physical addresses
pub struct SystemBus {
    pub memory: MemoryDispatchTable<SystemBus>,
    pub rdram: Rdram,
    pub sp_mem: Box<[u32; SP_MEM_WORDS]>,
    pub mi: Mi,
    /// Writes to SP memory that didn't come from the CPU
    sp_dirty: Vec<(u32, u32)>,
}

impl SystemBus {
    pub fn new(rdram_size: usize) -> SystemBus {
        let mut bus = SystemBus {
            memory: MemoryDispatchTable::new(),
            rdram: Rdram::new(rdram_size),
            sp_mem: Box::new([0; SP_MEM_WORDS]),
            mi: Mi::new(),
            sp_dirty: Vec::new(),
        };
        let last = bus.rdram.last_slot();
        bus.memory.map_region(0x0000, last, rdram::REGION);
        bus.memory.map_region(0x0400, 0x0400, SP_MEM);
        bus.memory.map_region(0x0430, 0x0430, mi::REGION);
        bus
    }

    /// Copies `words` into RAM at `paddr` behind the CPU's back
    pub fn load(&mut self, paddr: u32, words: &[u32]) -> Result<(), Error> {
        if paddr & 3 != 0 {
            return Err(Error::Misaligned(paddr));
        }
        if paddr & !0x1fff == SP_MEM_BASE {
            let start = ((paddr & 0x1fff) >> 2) as usize;
            let dest = self
                .sp_mem
                .get_mut(start..start + words.len())
                .ok_or(Error::ImageTooLarge { address: paddr, len: words.len() * 4 })?;
            dest.copy_from_slice(words);
            self.sp_dirty.push((paddr, (words.len() * 4) as u32));
            return Ok(());
        }
        self.rdram.dma_write(paddr, words)
    }
}

fn read_sp_mem(bus: &mut SystemBus, _: &mut Vr4300, address: u32) -> u32 {
    bus.sp_mem[((address & 0x1ffc) >> 2) as usize]
}

fn write_sp_mem(bus: &mut SystemBus, _: &mut Vr4300, address: u32, value: u32, mask: u32) {
    let word = &mut bus.sp_mem[((address & 0x1ffc) >> 2) as usize];
    *word = (*word & !mask) | (value & mask);
}

const SP_MEM: MemoryRegion<SystemBus> = MemoryRegion::new("sp dmem/imem", read_sp_mem, write_sp_mem);

impl MemoryContext for SystemBus {
    fn memory(&mut self) -> &mut MemoryDispatchTable<Self> {
        &mut self.memory
    }
}

impl Bus for SystemBus {
    #[inline(always)]
    fn read32(&mut self, cpu: &mut Vr4300, paddr: u32) -> u32 {
        memory::read(self, cpu, paddr)
    }

    #[inline(always)]
    fn write32(&mut self, cpu: &mut Vr4300, paddr: u32, value: u32, mask: u32) {
        memory::write(self, cpu, paddr, value, mask)
    }

    fn fetch_page(&self, paddr: u32) -> Option<&[u32]> {
        if (paddr as usize) < self.rdram.size() {
            return self.rdram.fetch_page(paddr);
        }
        if paddr & !0x1fff == SP_MEM_BASE {
            let start = ((paddr & 0x1000) >> 2) as usize;
            return self.sp_mem.get(start..start + 1024);
        }
        None
    }

    fn take_dma_writes(&mut self) -> Vec<(u32, u32)> {
        let mut writes = self.rdram.take_dirty();
        writes.append(&mut self.sp_dirty);
        writes
    }
}

/// The emulated machine
pub struct Device {
    pub core: Core,
    pub bus: SystemBus,
    handlers: EventHandlers<Device>,
}

impl EventContext for Device {
    fn event_queue(&mut self) -> &mut vr4300::EventQueue {
        &mut self.core.cpu.events
    }

    fn event_handlers(&self) -> &EventHandlers<Self> {
        &self.handlers
    }
}

impl Device {
    pub fn new(config: &Config) -> Device {
        let mut handlers: EventHandlers<Device> = EventHandlers::new();
        handlers.register(EventKind::Compare, |device: &mut Device, event| device.core.cpu.compare_event(event));
        handlers.register(EventKind::Check, |device: &mut Device, event| device.core.cpu.check_event(event));
        handlers.register(EventKind::Special, |device: &mut Device, event| device.core.cpu.special_event(event));
        handlers.register(EventKind::Hw2, |device: &mut Device, event| device.core.cpu.hw2_event(event));
        handlers.register(EventKind::Nmi, |device: &mut Device, event| device.core.cpu.nmi_event(event));

        info!("{} engine, {} cycles per instruction", config.engine, config.count_per_op);
        Device {
            core: Core::new(config),
            bus: SystemBus::new(RDRAM_SIZE),
            handlers,
        }
    }

    pub fn cpu(&self) -> &Vr4300 {
        &self.core.cpu
    }

    /// Hooks up the handler for one of the device event kinds. Returns the handler it replaced.
    pub fn register_event(&mut self, kind: EventKind, handler: EventHandler<Device>) -> Option<EventHandler<Device>> {
        self.handlers.register(kind, handler)
    }

    pub fn schedule_after(&mut self, kind: EventKind, delay: u32) -> Result<(), vr4300::Error> {
        let now = self.core.cpu.count();
        self.core.cpu.events.schedule_after(kind, delay, now)
    }

    /// Copies a raw big-endian image to the physical address behind `vaddr`. A trailing
    /// partial word is zero padded.
    pub fn load_image(&mut self, vaddr: u32, image: &[u8]) -> Result<(), Error> {
        let words: Vec<u32> = image
            .chunks(4)
            .map(|chunk| {
                let mut word = [0; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_be_bytes(word)
            })
            .collect();
        let paddr = vaddr & 0x1fff_ffff;
        debug!("loading {:#x} bytes at {:#010x}", image.len(), paddr);
        self.bus.load(paddr, &words)?;
        self.drain_dma_writes();
        Ok(())
    }

    pub fn set_pc(&mut self, vaddr: u32) {
        self.core.cpu.set_pc(vaddr);
    }

    /// Presses the reset button
    pub fn soft_reset(&mut self) {
        self.core.cpu.soft_reset();
    }

    pub fn stop(&mut self) {
        self.core.cpu.stop = true;
    }

    /// Runs for at least `cycles` Count cycles, or until stopped
    pub fn run(&mut self, cycles: u64) -> ExitReason {
        let target = self.core.cpu.total_cycles() + cycles;
        loop {
            let now = self.core.cpu.total_cycles();
            if now >= target {
                return ExitReason::EventDue;
            }
            if self.run_until((target - now).min(MAX_RUN) as u32) == ExitReason::Stopped {
                return ExitReason::Stopped;
            }
        }
    }

    fn run_until(&mut self, cycles: u32) -> ExitReason {
        let deadline = self.core.cpu.count().wrapping_add(cycles);
        self.core.cpu.deadline = Some(deadline);
        let exit = loop {
            self.dispatch_due_events();
            if self.core.cpu.stop {
                break ExitReason::Stopped;
            }
            if self.core.cpu.deadline_reached() {
                break ExitReason::EventDue;
            }
            if self.core.execute(&mut self.bus) == ExitReason::Stopped {
                break ExitReason::Stopped;
            }
        };
        self.core.cpu.deadline = None;
        exit
    }

    /// Runs the handler of every event that is due, in queue order
    fn dispatch_due_events(&mut self) {
        loop {
            self.drain_dma_writes();
            let now = self.core.cpu.count();
            if !self.core.cpu.events.is_due(now) {
                break;
            }
            if let Some(event) = pop_and_dispatch(self) {
                trace!("dispatched {:?} due {:#010x} at {:#010x}", event.kind, event.due, now);
            }
        }
    }

    fn drain_dma_writes(&mut self) {
        for (paddr, len) in self.bus.take_dma_writes() {
            self.core.invalidate_physical(paddr, len);
        }
    }

    /// Pages compiled by the translation cache so far, when the engine has one
    pub fn compiled_pages(&self) -> Option<u64> {
        self.core.engine.translation_cache().map(|cache| cache.compiled_pages())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::MiInterrupt;
    use common::cli::EngineKind;
    use vr4300::PendingEvent;
    use rstest::rstest;
    use vr4300::asm;
    use vr4300::coprocessor0::STATUS;

    const VI_PERIOD: u32 = 10_000;

    fn device(engine: EngineKind) -> Device {
        Device::new(&Config { engine, ..Config::default() })
    }

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }

    fn vi_event(device: &mut Device, event: PendingEvent) {
        device.bus.mi.raise(&mut device.core.cpu, MiInterrupt::Vi);
        let now = device.core.cpu.count();
        let _ = device.core.cpu.events.schedule(EventKind::Vi, event.due.wrapping_add(VI_PERIOD), now);
    }

    fn read_vi(_: &mut SystemBus, _: &mut Vr4300, _: u32) -> u32 {
        0
    }

    /// Any write acknowledges the vertical interrupt
    fn write_vi(bus: &mut SystemBus, cpu: &mut Vr4300, _: u32, _: u32, _: u32) {
        bus.mi.clear(cpu, MiInterrupt::Vi);
    }

    #[rstest]
    #[case(EngineKind::Interpreter)]
    #[case(EngineKind::Cached)]
    #[case(EngineKind::Recompiler)]
    fn vertical_interrupts_reach_the_guest(#[case] engine: EngineKind) {
        let mut device = device(engine);
        device.bus.memory.map_region(0x0440, 0x044f, MemoryRegion::new("vi", read_vi, write_vi));
        device.register_event(EventKind::Vi, vi_event);

        let main = [
            asm::lui(8, 0xa430),
            asm::ori(9, 0, 0x0080),
            asm::sw(9, 8, 0xc),       // unmask VI
            asm::ori(10, 0, 0x0401),
            asm::mtc0(10, STATUS as u32), // IE | IM2
            asm::beq(0, 0, -1),
            asm::NOP,
        ];
        let handler = [
            asm::addiu(16, 16, 1),
            asm::lui(11, 0xa440),
            asm::sw(0, 11, 0x10),
            asm::ERET,
        ];
        device.load_image(0x8000_1000, &words_to_bytes(&main)).unwrap();
        device.load_image(0x8000_0180, &words_to_bytes(&handler)).unwrap();
        device.set_pc(0x8000_1000);
        device.schedule_after(EventKind::Vi, VI_PERIOD).unwrap();

        assert_eq!(device.run(9 * VI_PERIOD as u64 + 5_000), ExitReason::EventDue);
        assert_eq!(device.cpu().gpr[16], 9);
        assert_eq!(device.bus.mi.intr(), 0);
        assert_eq!(device.cpu().pc, 0x8000_1014);
    }

    #[rstest]
    #[case(EngineKind::Interpreter)]
    #[case(EngineKind::Cached)]
    #[case(EngineKind::Recompiler)]
    fn dma_over_running_code_is_picked_up(#[case] engine: EngineKind) {
        let mut device = device(engine);
        let program = [asm::addiu(2, 0, 1), asm::beq(0, 0, -1), asm::NOP];
        device.load_image(0x8000_1000, &words_to_bytes(&program)).unwrap();
        device.set_pc(0x8000_1000);
        device.run(1_000);
        assert_eq!(device.cpu().gpr[2], 1);

        device.bus.rdram.dma_write(0x1000, &[asm::addiu(2, 0, 2)]).unwrap();
        device.set_pc(0x8000_1000);
        device.run(1_000);
        assert_eq!(device.cpu().gpr[2], 2);
    }

    #[test]
    fn runs_from_sp_memory_at_the_reset_vector() {
        let mut device = device(EngineKind::Cached);
        let program = [asm::ori(3, 0, 0x77), asm::beq(0, 0, -1), asm::NOP];
        device.load_image(0xa400_0040, &words_to_bytes(&program)).unwrap();
        device.set_pc(0xa400_0040);
        device.run(100);
        assert_eq!(device.cpu().gpr[3], 0x77);
        assert_eq!(device.compiled_pages(), Some(1));
    }

    #[test]
    fn unmapped_load_reads_open_bus() {
        let mut device = device(EngineKind::Interpreter);
        let program = [asm::lui(8, 0xa500), asm::lw(9, 8, 0x20), asm::beq(0, 0, -1), asm::NOP];
        device.load_image(0x8000_1000, &words_to_bytes(&program)).unwrap();
        device.set_pc(0x8000_1000);
        device.run(100);
        assert_eq!(device.cpu().gpr[9], 0x0500_0500);
    }

    #[test]
    fn images_are_checked() {
        let mut device = device(EngineKind::Interpreter);
        assert_eq!(device.load_image(0x8000_0002, &[0; 4]), Err(Error::Misaligned(2)));
        assert_eq!(
            device.load_image(0xa400_1ffc, &[0; 8]),
            Err(Error::ImageTooLarge { address: 0x0400_1ffc, len: 8 })
        );
        assert_eq!(
            device.load_image(0x807f_fffc, &[0; 5]),
            Err(Error::ImageTooLarge { address: 0x007f_fffc, len: 8 })
        );
    }

    #[test]
    fn stop_request_ends_the_run() {
        let mut device = device(EngineKind::Cached);
        device.load_image(0x8000_1000, &words_to_bytes(&[asm::beq(0, 0, -1), asm::NOP])).unwrap();
        device.set_pc(0x8000_1000);
        device.stop();
        assert_eq!(device.run(1_000_000), ExitReason::Stopped);
    }

    #[test]
    fn long_runs_are_split_and_count_wraps() {
        let mut device = device(EngineKind::Cached);
        device.load_image(0x8000_1000, &words_to_bytes(&[asm::beq(0, 0, -1), asm::NOP])).unwrap();
        device.set_pc(0x8000_1000);
        device.run(0x1_2000_0000);
        assert!(device.cpu().total_cycles() >= 0x1_2000_0000);
        assert_eq!(device.cpu().wraps, 1);
    }
}
