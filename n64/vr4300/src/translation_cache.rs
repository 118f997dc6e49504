//! Decoded 4KB pages of guest code, shared by the cached interpreter and the recompiler.
//!
//! A page is set up with every record `NotCompiled` the first time execution reaches it (or
//! after it was invalidated), and compiled as a whole when one of those records is executed.
//! Stores that overlap a live page flag it invalid; it gets rebuilt the next time execution
//! enters it through a jump. Pages in the unmapped windows share their state with the alias
//! in the other window, TLB-mapped pages with the kseg0 alias of their physical page.

use std::rc::Rc;

use log::{debug, warn};

use crate::exec;
use crate::instructions::{op_kind, OpKind, RType};
use crate::recompiler::HostBlock;
use crate::{Bus, Vr4300};

pub const PAGE_SIZE: u32 = 0x1000;
pub const PAGE_SLOTS: usize = 1024;
/// Guest slots plus the two `FinBlock` tail records
pub const PAGE_RECORDS: usize = PAGE_SLOTS + 2;
const PAGE_COUNT: usize = 1 << 20;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JumpKind {
    /// Target inside the same page
    Local,
    /// Target in another page, or in a register
    Out,
    /// Jump to itself with a NOP in the delay slot
    Idle,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dispatch {
    NotCompiled,
    /// Runs off the end of the page
    FinBlock,
    Exec(OpKind),
    Jump(OpKind, JumpKind),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PrecompiledInstruction {
    pub addr: u32,
    pub inst: RType,
    pub dispatch: Dispatch,
    /// Entry point of this instruction in the page's host code
    pub host_offset: u32,
    /// Host registers the compiled code expects bound when it reaches this instruction. Entering
    /// from outside the run goes through a trampoline that reconciles exactly these.
    pub need_map: u8,
}

impl PrecompiledInstruction {
    fn not_compiled(addr: u32) -> PrecompiledInstruction {
        PrecompiledInstruction {
            addr,
            inst: RType::from_word(0),
            dispatch: Dispatch::NotCompiled,
            host_offset: 0,
            need_map: 0,
        }
    }
}

pub struct CodePage {
    pub start: u32,
    pub records: Vec<PrecompiledInstruction>,
    pub host: Option<Rc<HostBlock>>,
}

impl CodePage {
    fn new(start: u32) -> CodePage {
        let mut page = CodePage { start, records: Vec::with_capacity(PAGE_RECORDS), host: None };
        page.reset();
        page
    }

    fn reset(&mut self) {
        self.records.clear();
        self.records.extend((0..PAGE_SLOTS as u32).map(|i| PrecompiledInstruction::not_compiled(self.start + i * 4)));
        for tail in [PAGE_SIZE, PAGE_SIZE + 4] {
            let mut record = PrecompiledInstruction::not_compiled(self.start.wrapping_add(tail));
            record.dispatch = Dispatch::FinBlock;
            self.records.push(record);
        }
        self.host = None;
    }

    pub fn is_compiled(&self) -> bool {
        self.records[0].dispatch != Dispatch::NotCompiled
    }
}

#[inline(always)]
fn is_unmapped(addr: u32) -> bool {
    addr & 0xc000_0000 == 0x8000_0000
}

/// The other unmapped window's page for the same physical memory
#[inline(always)]
fn alias_page(page: usize) -> usize {
    page ^ 0x20000
}

pub struct TranslationCache {
    pages: Vec<Option<Box<CodePage>>>,
    invalid: Vec<bool>,
    live: usize,
    max_pages: usize,
    compiled_pages: u64,
}

impl TranslationCache {
    pub fn new(max_pages: usize) -> TranslationCache {
        let mut pages = Vec::with_capacity(PAGE_COUNT);
        pages.resize_with(PAGE_COUNT, || None);
        TranslationCache {
            pages,
            invalid: vec![true; PAGE_COUNT],
            live: 0,
            max_pages: max_pages.max(2),
            compiled_pages: 0,
        }
    }

    /// Full page compilations so far
    pub fn compiled_pages(&self) -> u64 {
        self.compiled_pages
    }

    pub fn live_pages(&self) -> usize {
        self.live
    }

    #[inline(always)]
    pub fn is_invalid(&self, addr: u32) -> bool {
        self.invalid[(addr >> 12) as usize]
    }

    #[inline(always)]
    pub fn page(&self, page: u32) -> Option<&CodePage> {
        self.pages[page as usize].as_deref()
    }

    #[inline(always)]
    pub fn page_mut(&mut self, page: u32) -> Option<&mut CodePage> {
        self.pages[page as usize].as_deref_mut()
    }

    #[inline(always)]
    pub fn record(&self, page: u32, idx: usize) -> Option<PrecompiledInstruction> {
        self.page(page).and_then(|p| p.records.get(idx).copied())
    }

    /// Brings the invalid flags of `addr`'s page and its aliases in line. Returns the physical
    /// address, or None when a TLB-mapped address has no mapping.
    pub fn sync_aliases(&mut self, cpu: &Vr4300, addr: u32) -> Option<u32> {
        let page = (addr >> 12) as usize;
        if is_unmapped(addr) {
            let alias = alias_page(page);
            if self.invalid[page] || self.invalid[alias] {
                self.invalid[page] = true;
                self.invalid[alias] = true;
            }
            return Some(addr & 0x1fff_ffff);
        }

        // stores and DMA always flag the kseg0 view, which `enter` sets up as the twin
        let paddr = cpu.translate(addr, false)?;
        let phys_page = ((0x8000_0000 | paddr) >> 12) as usize;
        if self.invalid[phys_page] {
            self.invalid[page] = true;
        }
        if self.invalid[page] {
            self.invalid[phys_page] = true;
            self.invalid[alias_page(phys_page)] = true;
        }
        Some(paddr)
    }

    /// Resolves `addr` to `(page, index)`, setting the page up again first when it is invalid.
    /// None on a TLB miss.
    pub fn enter(&mut self, cpu: &Vr4300, addr: u32) -> Option<(u32, usize)> {
        let paddr = self.sync_aliases(cpu, addr)?;
        let page = addr >> 12;
        if self.invalid[page as usize] {
            if self.live + 2 > self.max_pages {
                warn!("translation cache holds {} pages, flushing", self.live);
                self.drop_all();
            }
            self.init_page(page);

            let twin = if is_unmapped(addr) {
                alias_page(page as usize) as u32
            } else {
                (0x8000_0000 | paddr) >> 12
            };
            if self.invalid[twin as usize] {
                self.init_page(twin);
            }
        }
        Some((page, ((addr & (PAGE_SIZE - 1)) >> 2) as usize))
    }

    fn init_page(&mut self, page: u32) {
        let slot = &mut self.pages[page as usize];
        match slot {
            Some(code) => code.reset(),
            None => {
                *slot = Some(Box::new(CodePage::new(page << 12)));
                self.live += 1;
            }
        }
        self.invalid[page as usize] = false;
    }

    /// Decodes a whole page from its 1024 guest words
    pub fn compile(&mut self, page: u32, words: &[u32]) {
        let Some(code) = self.pages[page as usize].as_deref_mut() else {
            return;
        };
        for (idx, &word) in words.iter().enumerate().take(PAGE_SLOTS) {
            let addr = code.start + (idx as u32) * 4;
            let inst = RType::from_word(word);
            let kind = op_kind(word);
            let dispatch = if kind.is_jump() {
                let target = exec::static_target(kind, inst, addr);
                let next = words.get(idx + 1).copied();
                let jump = match target {
                    _ if idx + 1 < PAGE_SLOTS && exec::is_idle_loop(target, addr, next.unwrap_or(1)) => {
                        JumpKind::Idle
                    }
                    Some(t) if t >> 12 == page => JumpKind::Local,
                    _ => JumpKind::Out,
                };
                Dispatch::Jump(kind, jump)
            } else {
                Dispatch::Exec(kind)
            };
            code.records[idx] = PrecompiledInstruction { addr, inst, dispatch, host_offset: 0, need_map: 0 };
        }
        code.host = None;
        self.compiled_pages += 1;
        debug!("compiled page {:#010x}", code.start);
    }

    /// Guest memory at `addr..addr+len` changed; `len == 0` means all of it.
    ///
    /// A page is only flagged when the record covering the write is already compiled (in the
    /// page or its alias); a page still full of `NotCompiled` records will see the new code
    /// anyway.
    pub fn invalidate(&mut self, addr: u32, len: u32) {
        if len == 0 {
            debug!("translation cache flushed");
            self.invalid.iter_mut().for_each(|i| *i = true);
            return;
        }

        let end = addr as u64 + len as u64;
        let mut at = (addr & !3) as u64;
        while at < end && at <= u32::MAX as u64 {
            let word = at as u32;
            let page = (word >> 12) as usize;
            if !self.invalid[page] && self.holds_compiled(word) {
                self.invalid[page] = true;
                if is_unmapped(word) {
                    self.invalid[alias_page(page)] = true;
                }
                debug!("invalidated page {:#010x}", word & !(PAGE_SIZE - 1));
            }
            if self.invalid[page] {
                at = (at | (PAGE_SIZE as u64 - 1)) + 1;
            } else {
                at += 4;
            }
        }
    }

    fn holds_compiled(&self, addr: u32) -> bool {
        let idx = ((addr & (PAGE_SIZE - 1)) >> 2) as usize;
        let compiled = |page: usize| match &self.pages[page] {
            Some(code) => code.records[idx].dispatch != Dispatch::NotCompiled,
            None => true,
        };
        let page = (addr >> 12) as usize;
        compiled(page) || (is_unmapped(addr) && compiled(alias_page(page)))
    }

    /// Frees every page
    fn drop_all(&mut self) {
        self.pages.iter_mut().for_each(|p| *p = None);
        self.invalid.iter_mut().for_each(|i| *i = true);
        self.live = 0;
    }
}

/// The 1024 words of the page at `start`, through the bus's fast path when it has one.
/// None on a TLB miss.
pub fn fetch_page<B: Bus + ?Sized>(cpu: &mut Vr4300, bus: &mut B, start: u32) -> Option<Vec<u32>> {
    let paddr = cpu.translate(start, false)? & !(PAGE_SIZE - 1);
    if let Some(words) = bus.fetch_page(paddr) {
        return Some(words.to_vec());
    }
    Some((0..PAGE_SLOTS as u32).map(|i| bus.read32(cpu, paddr + i * 4)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, asm, FlatBus};

    const BASE: u32 = 0x8000_1000;

    fn compiled(program: &[u32]) -> (TranslationCache, Vr4300, FlatBus) {
        let mut cpu = Vr4300::new(2);
        let mut bus = FlatBus::new(0x10000);
        bus.load(BASE & 0x1fff_ffff, program);
        let mut cache = TranslationCache::new(64);
        let (page, idx) = cache.enter(&cpu, BASE).unwrap();
        assert_eq!(idx, 0);
        let words = fetch_page(&mut cpu, &mut bus, BASE).unwrap();
        cache.compile(page, &words);
        (cache, cpu, bus)
    }

    #[test]
    fn enter_sets_up_page_and_alias() {
        let cpu = Vr4300::new(2);
        let mut cache = TranslationCache::new(64);
        assert!(cache.is_invalid(BASE));
        let (page, idx) = cache.enter(&cpu, BASE + 0x10).unwrap();
        assert_eq!((page, idx), (BASE >> 12, 4));
        assert!(!cache.is_invalid(BASE));
        assert!(!cache.is_invalid(BASE ^ 0x2000_0000));

        let record = cache.record(page, 4).unwrap();
        assert_eq!(record.dispatch, Dispatch::NotCompiled);
        assert_eq!(record.addr, BASE + 0x10);
        assert_eq!(cache.record(page, PAGE_SLOTS).unwrap().dispatch, Dispatch::FinBlock);
        assert_eq!(cache.record(page, PAGE_SLOTS + 1).unwrap().addr, BASE + 0x1004);
        assert_eq!(cache.compiled_pages(), 0);
    }

    #[test]
    fn jumps_are_specialised() {
        let (cache, ..) = compiled(&[
            asm::beq(0, 0, -1),         // 0x000: to itself
            asm::NOP,                   // 0x004
            asm::bne(1, 0, -3),         // 0x008: to 0x000
            asm::NOP,
            asm::j(0x8000_4000),        // 0x010: other page
            asm::NOP,
            asm::jr(31),                // 0x018
            asm::NOP,
        ]);
        let page = BASE >> 12;
        let dispatch = |i| cache.record(page, i).unwrap().dispatch;
        assert_eq!(dispatch(0), Dispatch::Jump(OpKind::Beq, JumpKind::Idle));
        assert_eq!(dispatch(1), Dispatch::Exec(OpKind::Sll));
        assert_eq!(dispatch(2), Dispatch::Jump(OpKind::Bne, JumpKind::Local));
        assert_eq!(dispatch(4), Dispatch::Jump(OpKind::J, JumpKind::Out));
        assert_eq!(dispatch(6), Dispatch::Jump(OpKind::Jr, JumpKind::Out));
        assert_eq!(dispatch(PAGE_SLOTS), Dispatch::FinBlock);
        assert_eq!(cache.compiled_pages(), 1);
    }

    #[test]
    fn recompiling_unchanged_page_is_identical() {
        let (mut cache, mut cpu, mut bus) = compiled(&[asm::addiu(1, 0, 5), asm::bne(1, 0, -2), asm::NOP]);
        let page = BASE >> 12;
        let before = cache.page(page).unwrap().records.clone();

        let words = fetch_page(&mut cpu, &mut bus, BASE).unwrap();
        cache.compile(page, &words);
        assert_eq!(cache.page(page).unwrap().records, before);

        // re-entering a valid page keeps the records
        cache.enter(&cpu, BASE + 4).unwrap();
        assert_eq!(cache.page(page).unwrap().records, before);
    }

    #[test]
    fn store_invalidates_page_and_mirror_once() {
        let (mut cache, ..) = compiled(&[asm::NOP; 4]);
        cache.invalidate(BASE + 8, 4);
        assert!(cache.is_invalid(BASE));
        assert!(cache.is_invalid(BASE ^ 0x2000_0000));

        let records = cache.page(BASE >> 12).unwrap().records.clone();
        cache.invalidate(BASE + 8, 4);
        assert!(cache.is_invalid(BASE));
        assert_eq!(cache.page(BASE >> 12).unwrap().records, records);
        assert_eq!(cache.live_pages(), 2);
    }

    #[test]
    fn write_through_uncached_alias_invalidates() {
        let (mut cache, ..) = compiled(&[asm::NOP; 4]);
        // the kseg1 alias only holds NotCompiled records, the kseg0 page is compiled
        cache.invalidate((BASE ^ 0x2000_0000) + 4, 4);
        assert!(cache.is_invalid(BASE));
    }

    #[test]
    fn store_into_uncompiled_page_is_skipped() {
        let cpu = Vr4300::new(2);
        let mut cache = TranslationCache::new(64);
        cache.enter(&cpu, BASE).unwrap();
        cache.invalidate(BASE + 0x100, 4);
        assert!(!cache.is_invalid(BASE));
    }

    #[test]
    fn range_invalidation_spans_pages() {
        let mut cpu = Vr4300::new(2);
        let mut cache = TranslationCache::new(64);
        let mut bus = FlatBus::new(0x10000);
        for start in [BASE, BASE + PAGE_SIZE, BASE + 2 * PAGE_SIZE] {
            let (page, _) = cache.enter(&cpu, start).unwrap();
            let words = fetch_page(&mut cpu, &mut bus, start).unwrap();
            cache.compile(page, &words);
        }
        cache.invalidate(BASE + 0xff0, 0x20);
        assert!(cache.is_invalid(BASE));
        assert!(cache.is_invalid(BASE + PAGE_SIZE));
        assert!(!cache.is_invalid(BASE + 2 * PAGE_SIZE));
        assert_eq!(cache.compiled_pages(), 3);
    }

    #[test]
    fn flush_marks_everything_invalid() {
        let (mut cache, cpu, _) = compiled(&[asm::NOP]);
        cache.invalidate(0, 0);
        assert!(cache.is_invalid(BASE));
        let (page, _) = cache.enter(&cpu, BASE).unwrap();
        assert!(!cache.page(page).unwrap().is_compiled());
    }

    #[test]
    fn capacity_overflow_flushes() {
        let cpu = Vr4300::new(2);
        let mut cache = TranslationCache::new(4);
        cache.enter(&cpu, 0x8000_0000).unwrap();
        cache.enter(&cpu, 0x8000_1000).unwrap();
        assert_eq!(cache.live_pages(), 4);
        cache.enter(&cpu, 0x8000_2000).unwrap();
        assert_eq!(cache.live_pages(), 2);
        assert!(cache.page(0x80000).is_none());
        assert!(cache.is_invalid(0x8000_0000));
    }

    #[test]
    fn tlb_page_is_compiled_once_until_its_memory_changes() {
        let mut cpu = Vr4300::new(2);
        testing::map_tlb(&mut cpu, 0, 0x0040_0000, 0x1000, 0x2000);
        let mut bus = FlatBus::new(0x10000);
        let mut cache = TranslationCache::new(64);
        let mut enter = |cache: &mut TranslationCache| {
            let (page, idx) = cache.enter(&cpu, 0x0040_0010).unwrap();
            assert_eq!((page, idx), (0x400, 4));
            if !cache.page(page).unwrap().is_compiled() {
                let words = fetch_page(&mut cpu, &mut bus, 0x0040_0000).unwrap();
                cache.compile(page, &words);
            }
        };
        enter(&mut cache);
        enter(&mut cache);
        assert_eq!(cache.compiled_pages(), 1);
        assert!(!cache.is_invalid(0x0040_0000));
        assert!(!cache.is_invalid(0x8000_1000));

        // a store lands on the kseg0 view of the physical page
        cache.invalidate(0x8000_1008, 4);
        assert!(cache.is_invalid(0x8000_1000));
        enter(&mut cache);
        assert_eq!(cache.compiled_pages(), 2);
        assert!(!cache.is_invalid(0x0040_0000));
    }

    #[test]
    fn unmapped_tlb_address_fails_to_enter() {
        let cpu = Vr4300::new(2);
        let mut cache = TranslationCache::new(64);
        assert_eq!(cache.enter(&cpu, 0x0040_0000), None);
    }
}
