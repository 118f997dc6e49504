//! MIPS interface: the RCP's interrupt controller.
//!
//! Every RCP interrupt source latches a bit in MI_INTR. Whenever any unmasked bit is set the
//! MI drives the CPU's IP2 line.

use log::{debug, warn};
use modular_bitfield::{bitfield, specifiers::*};
use vr4300::coprocessor0::CAUSE_IP2;
use vr4300::Vr4300;

use crate::device::SystemBus;
use crate::memory::MemoryRegion;

pub const MI_VERSION: u32 = 0x0202_0102;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum MiInterrupt {
    Sp = 0x01,
    Si = 0x02,
    Ai = 0x04,
    Vi = 0x08,
    Pi = 0x10,
    Dp = 0x20,
}

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone)]
pub struct MiMode {
    pub init_length: B7,
    pub init_mode: bool,
    pub ebus_test: bool,
    pub rdram_reg: bool,
    #[skip] __: B22,
}

impl MiMode {
    fn value(self) -> u32 {
        u32::from_le_bytes(self.into_bytes())
    }
}

pub struct Mi {
    pub mode: MiMode,
    intr: u32,
    intr_mask: u32,
}

impl Default for Mi {
    fn default() -> Self {
        Mi::new()
    }
}

impl Mi {
    pub fn new() -> Mi {
        Mi { mode: MiMode::new(), intr: 0, intr_mask: 0 }
    }

    pub fn intr(&self) -> u32 {
        self.intr
    }

    pub fn intr_mask(&self) -> u32 {
        self.intr_mask
    }

    pub fn raise(&mut self, cpu: &mut Vr4300, source: MiInterrupt) {
        self.intr |= source as u32;
        self.update_line(cpu);
    }

    pub fn clear(&mut self, cpu: &mut Vr4300, source: MiInterrupt) {
        self.intr &= !(source as u32);
        self.update_line(cpu);
    }

    fn update_line(&self, cpu: &mut Vr4300) {
        cpu.set_interrupt_line(CAUSE_IP2, self.intr & self.intr_mask != 0);
    }

    pub fn read(&self, address: u32) -> u32 {
        match (address & 0xc) >> 2 {
            0 => self.mode.value(),
            1 => MI_VERSION,
            2 => self.intr,
            _ => self.intr_mask,
        }
    }

    pub fn write(&mut self, cpu: &mut Vr4300, address: u32, value: u32) {
        match (address & 0xc) >> 2 {
            0 => self.write_mode(cpu, value),
            3 => {
                // bit 2n clears source n, bit 2n+1 sets it
                for n in 0..6 {
                    match (value >> (2 * n)) & 3 {
                        1 => self.intr_mask &= !(1 << n),
                        2 => self.intr_mask |= 1 << n,
                        _ => {}
                    }
                }
                debug!("mi intr mask {:#04x}", self.intr_mask);
                self.update_line(cpu);
            }
            _ => warn!("write to read-only mi register {:#010x} = {:08x}", address, value),
        }
    }

    fn write_mode(&mut self, cpu: &mut Vr4300, value: u32) {
        self.mode.set_init_length((value & 0x7f) as u8);
        if value & 0x0080 != 0 {
            self.mode.set_init_mode(false);
        }
        if value & 0x0100 != 0 {
            self.mode.set_init_mode(true);
        }
        if value & 0x0200 != 0 {
            self.mode.set_ebus_test(false);
        }
        if value & 0x0400 != 0 {
            self.mode.set_ebus_test(true);
        }
        if value & 0x0800 != 0 {
            self.clear(cpu, MiInterrupt::Dp);
        }
        if value & 0x1000 != 0 {
            self.mode.set_rdram_reg(false);
        }
        if value & 0x2000 != 0 {
            self.mode.set_rdram_reg(true);
        }
    }
}

fn read_mi(bus: &mut SystemBus, _: &mut Vr4300, address: u32) -> u32 {
    bus.mi.read(address)
}

fn write_mi(bus: &mut SystemBus, cpu: &mut Vr4300, address: u32, value: u32, _: u32) {
    bus.mi.write(cpu, address, value);
}

pub const REGION: MemoryRegion<SystemBus> = MemoryRegion::new("mi", read_mi, write_mi);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use vr4300::coprocessor0::CAUSE;

    fn cause(cpu: &Vr4300) -> u32 {
        cpu.cop0.reg(CAUSE)
    }

    #[test]
    fn unmasked_source_drives_ip2() {
        let mut cpu = Vr4300::new(2);
        let mut mi = Mi::new();
        mi.raise(&mut cpu, MiInterrupt::Vi);
        assert_eq!(mi.intr(), 0x08);
        assert_eq!(cause(&cpu) & CAUSE_IP2, 0);

        mi.write(&mut cpu, 0x0430_000c, 0x0080);
        assert_eq!(mi.intr_mask(), 0x08);
        assert_ne!(cause(&cpu) & CAUSE_IP2, 0);

        mi.clear(&mut cpu, MiInterrupt::Vi);
        assert_eq!(cause(&cpu) & CAUSE_IP2, 0);
    }

    #[rstest]
    #[case(0x0aaa, 0x3f)]
    #[case(0x0555, 0x00)]
    #[case(0x0002, 0x01)]
    #[case(0x0fff, 0x00)]
    fn mask_set_and_clear_pairs(#[case] write: u32, #[case] mask: u32) {
        let mut cpu = Vr4300::new(2);
        let mut mi = Mi::new();
        mi.write(&mut cpu, 0x0430_000c, write);
        assert_eq!(mi.read(0x0430_000c), mask);
    }

    #[test]
    fn mode_commands() {
        let mut cpu = Vr4300::new(2);
        let mut mi = Mi::new();
        mi.write(&mut cpu, 0x0430_0000, 0x2000 | 0x0100 | 0x0f);
        assert_eq!(mi.read(0x0430_0000), 0x0200 | 0x0080 | 0x0f);
        mi.write(&mut cpu, 0x0430_0000, 0x1000 | 0x0080);
        assert_eq!(mi.read(0x0430_0000), 0);

        mi.write(&mut cpu, 0x0430_000c, 0x0800);
        mi.raise(&mut cpu, MiInterrupt::Dp);
        assert_ne!(cause(&cpu) & CAUSE_IP2, 0);
        mi.write(&mut cpu, 0x0430_0000, 0x0800);
        assert_eq!(mi.intr(), 0);
        assert_eq!(cause(&cpu) & CAUSE_IP2, 0);
    }

    #[test]
    fn version_is_read_only() {
        let mut cpu = Vr4300::new(2);
        let mut mi = Mi::new();
        mi.write(&mut cpu, 0x0430_0004, 0);
        assert_eq!(mi.read(0x0430_0004), MI_VERSION);
    }
}
