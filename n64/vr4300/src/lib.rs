//! The VR4300 is the main CPU of the Nintendo 64.
//!
//! This crate runs guest code for it through one of three engines sharing the same timing
//! model: a plain interpreter, a cached interpreter over a page-granular translation cache, and
//! a recompiler that turns cached pages into code for a small virtual host machine.

pub mod asm;
pub mod cop1;
pub mod coprocessor0;
pub mod cpu;
pub mod event_queue;
pub mod exec;
pub mod instructions;
pub mod joint_tlb;

pub mod cached_interp;
pub mod interpreter;
pub mod recompiler;
pub mod translation_cache;

#[cfg(test)]
pub(crate) mod testing;

use common::cli::{EngineKind, GlobalOpts};

pub use cpu::Vr4300;
pub use event_queue::{EventKind, EventQueue, PendingEvent};

use cached_interp::CachedInterpreter;
use interpreter::Interpreter;
use recompiler::Recompiler;
use translation_cache::TranslationCache;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("event {0:?} is already pending")]
    DuplicateEvent(EventKind),
    #[error("unknown event kind {0:#x}")]
    UnknownEventKind(u32),
}

/// The CPU's view of the physical address space.
///
/// Handlers get the CPU so they can raise interrupt lines and schedule events.
pub trait Bus {
    fn read32(&mut self, cpu: &mut Vr4300, paddr: u32) -> u32;

    /// `dst = (dst & !mask) | (value & mask)`
    fn write32(&mut self, cpu: &mut Vr4300, paddr: u32, value: u32, mask: u32);

    /// Instruction fetch fast path: the 1024 words of the 4KB page containing `paddr`, when
    /// that page is plain memory. None sends the fetch through `read32`.
    fn fetch_page(&self, _paddr: u32) -> Option<&[u32]> {
        None
    }

    /// Physical ranges written behind the CPU's back (DMA) since the last call
    fn take_dma_writes(&mut self) -> Vec<(u32, u32)> {
        Vec::new()
    }
}

/// Why an engine handed control back
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// An event (or the run deadline) is due
    EventDue,
    /// `cpu.stop` was set
    Stopped,
}

impl ExitReason {
    #[inline(always)]
    pub(crate) fn at_check_point(cpu: &Vr4300) -> ExitReason {
        if cpu.stop { ExitReason::Stopped } else { ExitReason::EventDue }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub engine: EngineKind,
    pub count_per_op: u32,
    /// Live compiled pages before the translation cache flushes itself
    pub max_pages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            engine: EngineKind::Cached,
            count_per_op: 2,
            max_pages: 4096,
        }
    }
}

impl From<&GlobalOpts> for Config {
    fn from(opts: &GlobalOpts) -> Self {
        Config {
            engine: opts.engine,
            count_per_op: opts.count_per_op,
            max_pages: opts.max_pages,
        }
    }
}

/// The three execution strategies. Each runs forward until the next interrupt-check point at
/// which an event is due.
pub enum Engine {
    Interpreter(Interpreter),
    Cached(CachedInterpreter),
    Recompiler(Recompiler),
}

impl Engine {
    pub fn new(kind: EngineKind, max_pages: usize) -> Engine {
        match kind {
            EngineKind::Interpreter => Engine::Interpreter(Interpreter::new()),
            EngineKind::Cached => Engine::Cached(CachedInterpreter::new(max_pages)),
            EngineKind::Recompiler => Engine::Recompiler(Recompiler::new(max_pages)),
        }
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            Engine::Interpreter(_) => EngineKind::Interpreter,
            Engine::Cached(_) => EngineKind::Cached,
            Engine::Recompiler(_) => EngineKind::Recompiler,
        }
    }

    pub fn execute<B: Bus + ?Sized>(&mut self, cpu: &mut Vr4300, bus: &mut B) -> ExitReason {
        match self {
            Engine::Interpreter(engine) => engine.execute(cpu, bus),
            Engine::Cached(engine) => engine.execute(cpu, bus),
            Engine::Recompiler(engine) => engine.execute(cpu, bus),
        }
    }

    /// Guest memory at `addr` changed. `len == 0` drops everything.
    pub fn invalidate(&mut self, addr: u32, len: u32) {
        match self {
            Engine::Interpreter(_) => {}
            Engine::Cached(engine) => engine.cache.invalidate(addr, len),
            Engine::Recompiler(engine) => engine.cache_mut().invalidate(addr, len),
        }
    }

    pub fn translation_cache(&self) -> Option<&TranslationCache> {
        match self {
            Engine::Interpreter(_) => None,
            Engine::Cached(engine) => Some(&engine.cache),
            Engine::Recompiler(engine) => Some(engine.cache()),
        }
    }
}

/// CPU state plus the engine that runs it
pub struct Core {
    pub cpu: Vr4300,
    pub engine: Engine,
}

impl Core {
    pub fn new(config: &Config) -> Core {
        let mut cpu = Vr4300::new(config.count_per_op);
        let engine = Engine::new(config.engine, config.max_pages);
        cpu.set_track_code_writes(engine.translation_cache().is_some());
        Core { cpu, engine }
    }

    #[inline]
    pub fn execute<B: Bus + ?Sized>(&mut self, bus: &mut B) -> ExitReason {
        self.engine.execute(&mut self.cpu, bus)
    }

    /// Physical range written by a device. Both unmapped windows are dropped from the cache.
    pub fn invalidate_physical(&mut self, paddr: u32, len: u32) {
        let paddr = paddr & 0x1fff_ffff;
        self.engine.invalidate(0x8000_0000 | paddr, len);
        self.engine.invalidate(0xa000_0000 | paddr, len);
    }
}
