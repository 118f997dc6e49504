//! Test fixtures: a flat memory bus, plus the instruction encoders.

use crate::coprocessor0 as cp0;
use crate::{Bus, Vr4300};

/// RDRAM-like memory from physical address 0, one word per slot
pub struct FlatBus {
    pub words: Vec<u32>,
    pub dma: Vec<(u32, u32)>,
    pub reads: usize,
}

impl FlatBus {
    pub fn new(bytes: usize) -> FlatBus {
        FlatBus { words: vec![0; bytes / 4], dma: Vec::new(), reads: 0 }
    }

    pub fn load(&mut self, paddr: u32, program: &[u32]) {
        let start = (paddr >> 2) as usize;
        self.words[start..start + program.len()].copy_from_slice(program);
    }

    /// Writes behind the CPU's back, like a DMA engine would
    pub fn dma_write(&mut self, paddr: u32, data: &[u32]) {
        self.load(paddr, data);
        self.dma.push((paddr, data.len() as u32 * 4));
    }
}

impl Bus for FlatBus {
    fn read32(&mut self, _cpu: &mut Vr4300, paddr: u32) -> u32 {
        self.reads += 1;
        self.words.get((paddr >> 2) as usize).copied().unwrap_or(0)
    }

    fn write32(&mut self, _cpu: &mut Vr4300, paddr: u32, value: u32, mask: u32) {
        if let Some(word) = self.words.get_mut((paddr >> 2) as usize) {
            *word = (*word & !mask) | (value & mask);
        }
    }

    fn fetch_page(&self, paddr: u32) -> Option<&[u32]> {
        let start = ((paddr & !0xfff) >> 2) as usize;
        self.words.get(start..start + 1024)
    }

    fn take_dma_writes(&mut self) -> Vec<(u32, u32)> {
        std::mem::take(&mut self.dma)
    }
}

/// Points TLB entry `index` at a global, writable pair of 4KB pages starting at `vaddr`
pub fn map_tlb(cpu: &mut Vr4300, index: usize, vaddr: u32, phys_even: u32, phys_odd: u32) {
    cpu.cop0.write_plain(cp0::PAGE_MASK, 0);
    cpu.cop0.write_plain(cp0::ENTRY_HI, vaddr);
    cpu.cop0.write_plain(cp0::ENTRY_LO0, ((phys_even >> 12) << 6) | 0x7);
    cpu.cop0.write_plain(cp0::ENTRY_LO1, ((phys_odd >> 12) << 6) | 0x7);
    cpu.tlb.write(index, &cpu.cop0);
}

pub use crate::asm;
