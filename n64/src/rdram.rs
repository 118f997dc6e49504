use log::trace;
use vr4300::Vr4300;

use crate::device::SystemBus;
use crate::memory::MemoryRegion;
use crate::Error;

/// 4MB plus the expansion pak
pub const RDRAM_SIZE: usize = 0x80_0000;

const PAGE_WORDS: usize = 1024;

/// Main memory, stored as big-endian words already swapped to host order.
///
/// Writes that don't come from the CPU (DMA, image loading) are remembered as dirty physical
/// ranges so the translation cache can drop what they overwrote.
pub struct Rdram {
    words: Box<[u32]>,
    dirty: Vec<(u32, u32)>,
}

impl Rdram {
    pub fn new(size: usize) -> Rdram {
        debug_assert!(size % 0x10000 == 0, "rdram must fill whole dispatch slots");
        Rdram {
            words: vec![0; size / 4].into_boxed_slice(),
            dirty: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.words.len() * 4
    }

    /// Dispatch slots covered by RDRAM
    pub fn last_slot(&self) -> u16 {
        ((self.size() >> 16) - 1) as u16
    }

    #[inline(always)]
    pub fn read(&self, paddr: u32) -> u32 {
        self.words.get((paddr >> 2) as usize).copied().unwrap_or(0)
    }

    #[inline(always)]
    pub fn write(&mut self, paddr: u32, value: u32, mask: u32) {
        if let Some(word) = self.words.get_mut((paddr >> 2) as usize) {
            *word = (*word & !mask) | (value & mask);
        }
    }

    /// The 1024 words of the 4KB page containing `paddr`
    #[inline]
    pub fn fetch_page(&self, paddr: u32) -> Option<&[u32]> {
        let start = ((paddr & !0xfff) >> 2) as usize;
        self.words.get(start..start + PAGE_WORDS)
    }

    /// A device writing `data` at `paddr` behind the CPU's back
    pub fn dma_write(&mut self, paddr: u32, data: &[u32]) -> Result<(), Error> {
        if paddr & 3 != 0 {
            return Err(Error::Misaligned(paddr));
        }
        let start = (paddr >> 2) as usize;
        let dest = self
            .words
            .get_mut(start..start + data.len())
            .ok_or(Error::ImageTooLarge { address: paddr, len: data.len() * 4 })?;
        dest.copy_from_slice(data);

        let len = (data.len() * 4) as u32;
        trace!("rdram dma {:#010x}+{:#x}", paddr, len);
        self.dirty.push((paddr, len));
        Ok(())
    }

    /// Ranges written by [`Rdram::dma_write`] since the last call
    pub fn take_dirty(&mut self) -> Vec<(u32, u32)> {
        std::mem::take(&mut self.dirty)
    }
}

fn read_rdram(bus: &mut SystemBus, _: &mut Vr4300, address: u32) -> u32 {
    bus.rdram.read(address)
}

fn write_rdram(bus: &mut SystemBus, _: &mut Vr4300, address: u32, value: u32, mask: u32) {
    bus.rdram.write(address, value, mask);
}

pub const REGION: MemoryRegion<SystemBus> = MemoryRegion::new("rdram", read_rdram, write_rdram);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_write_records_dirty_range() {
        let mut rdram = Rdram::new(0x10000);
        rdram.dma_write(0x1000, &[1, 2, 3]).unwrap();
        assert_eq!(rdram.read(0x1008), 3);
        assert_eq!(rdram.take_dirty(), vec![(0x1000, 12)]);
        assert!(rdram.take_dirty().is_empty());
    }

    #[test]
    fn dma_write_is_checked() {
        let mut rdram = Rdram::new(0x10000);
        assert_eq!(rdram.dma_write(0x1002, &[1]), Err(Error::Misaligned(0x1002)));
        assert_eq!(
            rdram.dma_write(0xfffc, &[1, 2]),
            Err(Error::ImageTooLarge { address: 0xfffc, len: 8 })
        );
        assert!(rdram.take_dirty().is_empty());
    }

    #[test]
    fn fetch_page_stops_at_the_end() {
        let rdram = Rdram::new(0x10000);
        assert_eq!(rdram.fetch_page(0xf123).map(<[u32]>::len), Some(1024));
        assert!(rdram.fetch_page(0x10000).is_none());
        assert_eq!(rdram.last_slot(), 0);
    }
}
