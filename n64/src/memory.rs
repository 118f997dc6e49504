//! Memory dispatch table.
//!
//! The physical address space is cut into 65536 slots of 64KB. Every slot holds the read and
//! write handler of whatever device owns it; a lookup is `slots[addr >> 16]`. Handlers are plain
//! function pointers over the bus aggregate `C`, so a device handler reaches its own state as a
//! field of `C`.

use std::collections::BTreeMap;

use common::util::ByteMask4;
use log::{info, warn};
use vr4300::Vr4300;

pub const SLOT_COUNT: usize = 0x10000;

pub type ReadFn<C> = fn(ctx: &mut C, cpu: &mut Vr4300, address: u32) -> u32;
/// `value` is already masked; handlers apply `dst = (dst & !mask) | (value & mask)`
pub type WriteFn<C> = fn(ctx: &mut C, cpu: &mut Vr4300, address: u32, value: u32, mask: u32);

/// The handler pair of one slot
pub struct MemoryRegion<C> {
    pub name: &'static str,
    pub read32: ReadFn<C>,
    pub write32: WriteFn<C>,
}

impl<C> Clone for MemoryRegion<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for MemoryRegion<C> {}

impl<C> std::fmt::Debug for MemoryRegion<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MemoryRegion").field(&self.name).finish()
    }
}

impl<C> MemoryRegion<C> {
    pub const fn new(name: &'static str, read32: ReadFn<C>, write32: WriteFn<C>) -> Self {
        MemoryRegion { name, read32, write32 }
    }

    pub const fn open_bus() -> Self {
        MemoryRegion { name: "open bus", read32: read_open_bus::<C>, write32: write_open_bus::<C> }
    }
}

/// What an unmapped read sees: the upper half of the address, in both halves
#[inline(always)]
pub fn open_bus_value(address: u32) -> u32 {
    (address >> 16) | (address & 0xffff_0000)
}

fn read_open_bus<C>(_: &mut C, cpu: &mut Vr4300, address: u32) -> u32 {
    warn!("read from unmapped address {:#010x} (pc {:#010x})", address, cpu.pc);
    open_bus_value(address)
}

fn write_open_bus<C>(_: &mut C, cpu: &mut Vr4300, address: u32, value: u32, _: u32) {
    warn!("write to unmapped address {:#010x} = {:08x} (pc {:#010x})", address, value, cpu.pc);
}

/// Break on reads
pub const READ: u32 = 1;
/// Break on writes
pub const WRITE: u32 = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Read,
    Write(u32),
}

/// One access that tripped a breakpoint
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BreakpointHit {
    pub address: u32,
    pub pc: u32,
    pub access: Access,
}

struct Watch<C> {
    flags: u32,
    saved: MemoryRegion<C>,
}

pub struct MemoryDispatchTable<C> {
    slots: Box<[MemoryRegion<C>]>,
    watches: BTreeMap<u16, Watch<C>>,
    hits: Vec<BreakpointHit>,
}

impl<C> Default for MemoryDispatchTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> MemoryDispatchTable<C> {
    /// Every slot starts out as open bus
    pub fn new() -> Self {
        MemoryDispatchTable {
            slots: vec![MemoryRegion::open_bus(); SLOT_COUNT].into_boxed_slice(),
            watches: BTreeMap::new(),
            hits: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn region(&self, address: u32) -> MemoryRegion<C> {
        self.slots[(address >> 16) as usize]
    }

    /// Installs `region` on every slot from `begin` to `end` inclusive
    pub fn map_region(&mut self, begin: u16, end: u16, region: MemoryRegion<C>) {
        debug_assert!(begin <= end);
        info!("mapping {} at {:#06x}..={:#06x}", region.name, begin, end);
        self.slots[begin as usize..=end as usize].fill(region);
    }

    /// The handler currently installed on `slot`, for a later [`MemoryDispatchTable::restore`]
    pub fn save(&self, slot: u16) -> MemoryRegion<C> {
        self.slots[slot as usize]
    }

    pub fn restore(&mut self, slot: u16, saved: MemoryRegion<C>) {
        self.slots[slot as usize] = saved;
    }

    pub fn breakpoint_hits(&self) -> &[BreakpointHit] {
        &self.hits
    }

    pub fn take_breakpoint_hits(&mut self) -> Vec<BreakpointHit> {
        std::mem::take(&mut self.hits)
    }
}

impl<C: MemoryContext> MemoryDispatchTable<C> {
    /// Puts a watch handler over the slots `begin..=end`. Accesses of the kinds in `flags` are
    /// logged and recorded before the original handler runs. Slots already watched only have
    /// their flags replaced.
    pub fn activate_breakpoints(&mut self, begin: u16, end: u16, flags: u32) {
        for slot in begin..=end {
            match self.watches.get_mut(&slot) {
                Some(watch) => watch.flags = flags,
                None => {
                    let saved = self.save(slot);
                    self.watches.insert(slot, Watch { flags, saved });
                    self.slots[slot as usize] = MemoryRegion::new("breakpoint", watch_read::<C>, watch_write::<C>);
                }
            }
        }
    }

    /// Puts back the handlers that were active before [`MemoryDispatchTable::activate_breakpoints`]
    pub fn deactivate_breakpoints(&mut self, begin: u16, end: u16) {
        for slot in begin..=end {
            if let Some(watch) = self.watches.remove(&slot) {
                self.restore(slot, watch.saved);
            }
        }
    }
}

fn watch_read<C: MemoryContext>(ctx: &mut C, cpu: &mut Vr4300, address: u32) -> u32 {
    let table = ctx.memory();
    let slot = (address >> 16) as u16;
    let Some(watch) = table.watches.get(&slot) else {
        return read_open_bus(ctx, cpu, address);
    };
    let saved = watch.saved;
    if watch.flags & READ != 0 {
        info!("read breakpoint at {:#010x} (pc {:#010x})", address, cpu.pc);
        table.hits.push(BreakpointHit { address, pc: cpu.pc, access: Access::Read });
    }
    (saved.read32)(ctx, cpu, address)
}

fn watch_write<C: MemoryContext>(ctx: &mut C, cpu: &mut Vr4300, address: u32, value: u32, mask: u32) {
    let table = ctx.memory();
    let slot = (address >> 16) as u16;
    let Some(watch) = table.watches.get(&slot) else {
        return write_open_bus(ctx, cpu, address, value, mask);
    };
    let saved = watch.saved;
    if watch.flags & WRITE != 0 {
        info!("write breakpoint at {:#010x} = {:08x} (pc {:#010x})", address, value, cpu.pc);
        table.hits.push(BreakpointHit { address, pc: cpu.pc, access: Access::Write(value) });
    }
    (saved.write32)(ctx, cpu, address, value, mask)
}

/// Whatever owns a dispatch table over itself
pub trait MemoryContext: Sized {
    fn memory(&mut self) -> &mut MemoryDispatchTable<Self>;
}

#[inline(always)]
pub fn read<C: MemoryContext>(ctx: &mut C, cpu: &mut Vr4300, address: u32) -> u32 {
    let handler = ctx.memory().region(address).read32;
    handler(ctx, cpu, address)
}

#[inline(always)]
pub fn write<C: MemoryContext>(ctx: &mut C, cpu: &mut Vr4300, address: u32, value: u32, mask: u32) {
    let handler = ctx.memory().region(address).write32;
    handler(ctx, cpu, address, ByteMask4::from_value(mask).apply(value), mask)
}
