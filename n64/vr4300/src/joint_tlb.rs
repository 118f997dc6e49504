//! The 32 entry joint TLB.
//!
//! Lookups go through two flat tables (one for reads, one for writes) with an entry per 4KB
//! virtual page, rebuilt whenever an entry is written. A zero entry means no valid mapping.

use crate::coprocessor0::{self as cp0, Cop0};

const PAGES: usize = 1 << 20;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TlbEntry {
    pub mask: u32,
    pub vpn2: u32,
    pub global: bool,
    pub asid: u8,
    pub pfn_even: u32,
    pub c_even: u8,
    pub d_even: bool,
    pub v_even: bool,
    pub pfn_odd: u32,
    pub c_odd: u8,
    pub d_odd: bool,
    pub v_odd: bool,
}

/// One half (even or odd page) of an entry, resolved to address ranges
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MappedRange {
    pub start: u32,
    /// Inclusive
    pub end: u32,
    pub phys: u32,
    pub valid: bool,
    pub dirty: bool,
}

impl MappedRange {
    pub fn len(&self) -> u32 {
        self.end.wrapping_sub(self.start).wrapping_add(1)
    }

    fn mappable(&self) -> bool {
        self.valid
            && self.start < self.end
            && !(self.start >= 0x8000_0000 && self.end < 0xc000_0000)
            && self.phys < 0x2000_0000
    }
}

impl TlbEntry {
    fn from_cop0(cop0: &Cop0) -> TlbEntry {
        let lo0 = cop0.reg(cp0::ENTRY_LO0);
        let lo1 = cop0.reg(cp0::ENTRY_LO1);
        let hi = cop0.reg(cp0::ENTRY_HI);
        TlbEntry {
            mask: (cop0.reg(cp0::PAGE_MASK) & 0x01ff_e000) >> 13,
            vpn2: (hi & 0xffff_e000) >> 13,
            global: lo0 & lo1 & 1 != 0,
            asid: hi as u8,
            pfn_even: (lo0 & 0x3fff_ffc0) >> 6,
            c_even: ((lo0 & 0x38) >> 3) as u8,
            d_even: lo0 & 0x4 != 0,
            v_even: lo0 & 0x2 != 0,
            pfn_odd: (lo1 & 0x3fff_ffc0) >> 6,
            c_odd: ((lo1 & 0x38) >> 3) as u8,
            d_odd: lo1 & 0x4 != 0,
            v_odd: lo1 & 0x2 != 0,
        }
    }

    pub fn even(&self) -> MappedRange {
        let start = self.vpn2 << 13;
        MappedRange {
            start,
            end: start.wrapping_add(self.mask << 12).wrapping_add(0xfff),
            phys: self.pfn_even << 12,
            valid: self.v_even,
            dirty: self.d_even,
        }
    }

    pub fn odd(&self) -> MappedRange {
        let start = self.even().end.wrapping_add(1);
        MappedRange {
            start,
            end: start.wrapping_add(self.mask << 12).wrapping_add(0xfff),
            phys: self.pfn_odd << 12,
            valid: self.v_odd,
            dirty: self.d_odd,
        }
    }

    fn matches(&self, entry_hi: u32) -> bool {
        let vpn2 = (entry_hi & 0xffff_e000) >> 13;
        (self.vpn2 & !self.mask) == (vpn2 & !self.mask)
            && (self.global || self.asid == entry_hi as u8)
    }
}

pub struct JointTlb {
    entries: [TlbEntry; 32],
    lut_read: Vec<u32>,
    lut_write: Vec<u32>,
}

impl JointTlb {
    pub fn new() -> JointTlb {
        JointTlb {
            entries: [TlbEntry::default(); 32],
            lut_read: vec![0; PAGES],
            lut_write: vec![0; PAGES],
        }
    }

    pub fn entry(&self, index: usize) -> &TlbEntry {
        &self.entries[index & 0x1f]
    }

    /// Physical address for a TLB-mapped virtual address
    #[inline(always)]
    pub fn lookup(&self, vaddr: u32, write: bool) -> Option<u32> {
        let lut = if write { &self.lut_write } else { &self.lut_read };
        match lut[(vaddr >> 12) as usize] {
            0 => None,
            page => Some((page & 0x1fff_f000) | (vaddr & 0xfff)),
        }
    }

    /// Any entry covering `vaddr`, valid or not. Decides the refill vector.
    pub fn has_entry_for(&self, vaddr: u32, asid: u8) -> bool {
        let probe = (vaddr & 0xffff_e000) | asid as u32;
        self.entries.iter().any(|e| e.matches(probe))
    }

    fn unmap(&mut self, index: usize) {
        let entry = self.entries[index];
        for range in [entry.even(), entry.odd()] {
            if !range.valid {
                continue;
            }
            let mut page = range.start;
            while page < range.end {
                self.lut_read[(page >> 12) as usize] = 0;
                if range.dirty {
                    self.lut_write[(page >> 12) as usize] = 0;
                }
                page = match page.checked_add(0x1000) { Some(p) => p, None => break };
            }
        }
    }

    fn map(&mut self, index: usize) {
        let entry = self.entries[index];
        for range in [entry.even(), entry.odd()] {
            if !range.mappable() {
                continue;
            }
            let mut page = range.start;
            while page < range.end {
                let value = 0x8000_0000 | (range.phys + (page - range.start) + 0xfff);
                self.lut_read[(page >> 12) as usize] = value;
                if range.dirty {
                    self.lut_write[(page >> 12) as usize] = value;
                }
                page = match page.checked_add(0x1000) { Some(p) => p, None => break };
            }
        }
    }

    /// TLBR
    pub fn read(&self, cop0: &mut Cop0) {
        let entry = self.entries[(cop0.reg(cp0::INDEX) & 0x1f) as usize];
        *cop0.reg_mut(cp0::PAGE_MASK) = entry.mask << 13;
        *cop0.reg_mut(cp0::ENTRY_HI) = (entry.vpn2 << 13) | entry.asid as u32;
        *cop0.reg_mut(cp0::ENTRY_LO0) = (entry.pfn_even << 6)
            | ((entry.c_even as u32) << 3)
            | ((entry.d_even as u32) << 2)
            | ((entry.v_even as u32) << 1)
            | entry.global as u32;
        *cop0.reg_mut(cp0::ENTRY_LO1) = (entry.pfn_odd << 6)
            | ((entry.c_odd as u32) << 3)
            | ((entry.d_odd as u32) << 2)
            | ((entry.v_odd as u32) << 1)
            | entry.global as u32;
    }

    /// TLBWI / TLBWR. Returns the virtual ranges whose translation changed, old and new.
    pub fn write(&mut self, index: usize, cop0: &Cop0) -> Vec<MappedRange> {
        let index = index & 0x1f;
        let old = self.entries[index];
        self.unmap(index);
        self.entries[index] = TlbEntry::from_cop0(cop0);
        self.map(index);
        let new = self.entries[index];

        [old.even(), old.odd(), new.even(), new.odd()]
            .into_iter()
            .filter(|r| r.valid)
            .collect()
    }

    /// TLBP
    pub fn probe(&self, cop0: &mut Cop0) {
        let entry_hi = cop0.reg(cp0::ENTRY_HI);
        let found = self.entries.iter().position(|e| e.matches(entry_hi));
        *cop0.reg_mut(cp0::INDEX) = match found {
            Some(i) => i as u32,
            None => cop0.reg(cp0::INDEX) | 0x8000_0000,
        };
    }
}

impl Default for JointTlb {
    fn default() -> Self {
        Self::new()
    }
}
