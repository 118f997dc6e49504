//! The floating point unit.
//!
//! With Status.FR clear the 32 registers are 32 bits wide and doubles live in even/odd pairs.
//! That layout is modelled by steering 32bit accesses to odd registers into the upper half of
//! the even register.

use crate::instructions::RType;

pub const FCR31_CONDITION: u32 = 1 << 23;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fmt {
    S,
    D,
    W,
    L,
}

impl Fmt {
    pub fn decode(fmt: u8) -> Option<Fmt> {
        match fmt {
            16 => Some(Fmt::S),
            17 => Some(Fmt::D),
            20 => Some(Fmt::W),
            21 => Some(Fmt::L),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Rounding {
    Nearest,
    Zero,
    Up,
    Down,
}

#[derive(Debug, Clone, Default)]
pub struct Cop1 {
    pub fgr: [u64; 32],
    pub fcr0: u32,
    pub fcr31: u32,
}

/// Raised when an FPU op has no defined behaviour for its format
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Unimplemented;

impl Cop1 {
    pub fn new() -> Cop1 {
        Cop1 { fgr: [0; 32], fcr0: 0x511, fcr31: 0 }
    }

    #[inline(always)]
    pub fn read_w(&self, reg: u8, fr: bool) -> u32 {
        let reg = reg as usize;
        if fr || reg & 1 == 0 {
            self.fgr[reg] as u32
        } else {
            (self.fgr[reg & !1] >> 32) as u32
        }
    }

    #[inline(always)]
    pub fn write_w(&mut self, reg: u8, value: u32, fr: bool) {
        let reg = reg as usize;
        if fr || reg & 1 == 0 {
            self.fgr[reg] = (self.fgr[reg] & 0xffff_ffff_0000_0000) | value as u64;
        } else {
            let even = &mut self.fgr[reg & !1];
            *even = (*even & 0xffff_ffff) | ((value as u64) << 32);
        }
    }

    #[inline(always)]
    pub fn read_d(&self, reg: u8, fr: bool) -> u64 {
        let reg = reg as usize;
        if fr { self.fgr[reg] } else { self.fgr[reg & !1] }
    }

    #[inline(always)]
    pub fn write_d(&mut self, reg: u8, value: u64, fr: bool) {
        let reg = reg as usize;
        if fr { self.fgr[reg] = value } else { self.fgr[reg & !1] = value }
    }

    pub fn read_control(&self, reg: u8) -> u32 {
        match reg {
            0 => self.fcr0,
            31 => self.fcr31,
            _ => 0,
        }
    }

    pub fn write_control(&mut self, reg: u8, value: u32) {
        if reg == 31 {
            self.fcr31 = value & 0x0183_ffff;
        }
    }

    #[inline(always)]
    pub fn condition(&self) -> bool {
        self.fcr31 & FCR31_CONDITION != 0
    }

    fn rounding(&self) -> Rounding {
        match self.fcr31 & 3 {
            0 => Rounding::Nearest,
            1 => Rounding::Zero,
            2 => Rounding::Up,
            _ => Rounding::Down,
        }
    }

    fn get(&self, fmt: Fmt, reg: u8, fr: bool) -> f64 {
        match fmt {
            Fmt::S => f32::from_bits(self.read_w(reg, fr)) as f64,
            Fmt::D => f64::from_bits(self.read_d(reg, fr)),
            Fmt::W => self.read_w(reg, fr) as i32 as f64,
            Fmt::L => self.read_d(reg, fr) as i64 as f64,
        }
    }

    fn set(&mut self, fmt: Fmt, reg: u8, value: f64, fr: bool) {
        match fmt {
            Fmt::S => self.write_w(reg, (value as f32).to_bits(), fr),
            Fmt::D => self.write_d(reg, value.to_bits(), fr),
            Fmt::W => self.write_w(reg, value as i32 as u32, fr),
            Fmt::L => self.write_d(reg, value as i64 as u64, fr),
        }
    }

    fn round(value: f64, mode: Rounding) -> f64 {
        match mode {
            Rounding::Nearest => value.round_ties_even(),
            Rounding::Zero => value.trunc(),
            Rounding::Up => value.ceil(),
            Rounding::Down => value.floor(),
        }
    }

    /// Executes a COP1 arithmetic, conversion or compare op
    pub fn execute(&mut self, inst: RType, fr: bool) -> Result<(), Unimplemented> {
        let fmt = Fmt::decode(inst.fmt()).ok_or(Unimplemented)?;
        let (fd, fs, ft) = (inst.fd(), inst.fs(), inst.ft());
        let float = matches!(fmt, Fmt::S | Fmt::D);

        // Single precision arithmetic has to round at single precision
        let arith = |a: f64, b: f64, op: fn(f64, f64) -> f64| -> f64 {
            match fmt {
                Fmt::S => op(a as f32 as f64, b as f32 as f64) as f32 as f64,
                _ => op(a, b),
            }
        };

        match inst.funct() {
            0x00..=0x07 if float => {
                let a = self.get(fmt, fs, fr);
                let b = self.get(fmt, ft, fr);
                let result = match inst.funct() {
                    0x00 => arith(a, b, |x, y| x + y),
                    0x01 => arith(a, b, |x, y| x - y),
                    0x02 => match fmt {
                        Fmt::S => ((a as f32) * (b as f32)) as f64,
                        _ => a * b,
                    },
                    0x03 => match fmt {
                        Fmt::S => ((a as f32) / (b as f32)) as f64,
                        _ => a / b,
                    },
                    0x04 => match fmt {
                        Fmt::S => (a as f32).sqrt() as f64,
                        _ => a.sqrt(),
                    },
                    0x05 => a.abs(),
                    0x06 => {
                        // MOV copies bits
                        match fmt {
                            Fmt::S => self.write_w(fd, self.read_w(fs, fr), fr),
                            _ => self.write_d(fd, self.read_d(fs, fr), fr),
                        }
                        return Ok(());
                    }
                    _ => -a,
                };
                self.set(fmt, fd, result, fr);
            }
            0x08..=0x0f if float => {
                let mode = match inst.funct() & 3 {
                    0 => Rounding::Nearest,
                    1 => Rounding::Zero,
                    2 => Rounding::Up,
                    _ => Rounding::Down,
                };
                let value = Self::round(self.get(fmt, fs, fr), mode);
                let dest = if inst.funct() < 0x0c { Fmt::L } else { Fmt::W };
                self.set(dest, fd, value, fr);
            }
            0x20 if fmt != Fmt::S => {
                let value = self.get(fmt, fs, fr);
                self.set(Fmt::S, fd, value, fr);
            }
            0x21 if fmt != Fmt::D => {
                let value = self.get(fmt, fs, fr);
                self.set(Fmt::D, fd, value, fr);
            }
            0x24 | 0x25 if float => {
                let value = Self::round(self.get(fmt, fs, fr), self.rounding());
                let dest = if inst.funct() == 0x24 { Fmt::W } else { Fmt::L };
                self.set(dest, fd, value, fr);
            }
            0x30..=0x3f if float => {
                let a = self.get(fmt, fs, fr);
                let b = self.get(fmt, ft, fr);
                let cond = inst.funct() & 0xf;
                let unordered = a.is_nan() || b.is_nan();
                let result = (cond & 1 != 0 && unordered)
                    || (cond & 2 != 0 && !unordered && a == b)
                    || (cond & 4 != 0 && !unordered && a < b);
                if result {
                    self.fcr31 |= FCR31_CONDITION;
                } else {
                    self.fcr31 &= !FCR31_CONDITION;
                }
            }
            _ => return Err(Unimplemented),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// COP1 R-type word: fmt, ft, fs, fd, funct
    fn fpu(fmt: u32, ft: u32, fs: u32, fd: u32, funct: u32) -> RType {
        RType::from_word((0x11 << 26) | (fmt << 21) | (ft << 16) | (fs << 11) | (fd << 6) | funct)
    }

    #[test]
    fn paired_registers_without_fr() {
        let mut cop1 = Cop1::new();
        cop1.write_w(0, 0x1111_1111, false);
        cop1.write_w(1, 0x2222_2222, false);
        assert_eq!(cop1.read_d(0, false), 0x2222_2222_1111_1111);
        assert_eq!(cop1.read_w(1, false), 0x2222_2222);

        cop1.write_w(1, 0x3333_3333, true);
        assert_eq!(cop1.fgr[1], 0x3333_3333);
    }

    #[test]
    fn single_add_and_convert() {
        let mut cop1 = Cop1::new();
        cop1.write_w(2, 1.5f32.to_bits(), true);
        cop1.write_w(4, 2.25f32.to_bits(), true);
        cop1.execute(fpu(16, 4, 2, 6, 0x00), true).unwrap();
        assert_eq!(f32::from_bits(cop1.read_w(6, true)), 3.75);

        // cvt.d.s f8, f6
        cop1.execute(fpu(16, 0, 6, 8, 0x21), true).unwrap();
        assert_eq!(f64::from_bits(cop1.read_d(8, true)), 3.75);

        // trunc.w.d f10, f8
        cop1.execute(fpu(17, 0, 8, 10, 0x0d), true).unwrap();
        assert_eq!(cop1.read_w(10, true), 3);
    }

    #[test]
    fn compare_sets_condition() {
        let mut cop1 = Cop1::new();
        cop1.write_d(0, 1.0f64.to_bits(), true);
        cop1.write_d(2, 2.0f64.to_bits(), true);
        // c.lt.d f0, f2
        cop1.execute(fpu(17, 2, 0, 0, 0x3c), true).unwrap();
        assert!(cop1.condition());
        // c.eq.d f0, f2
        cop1.execute(fpu(17, 2, 0, 0, 0x32), true).unwrap();
        assert!(!cop1.condition());
    }

    #[test]
    fn rejects_undefined_formats() {
        let mut cop1 = Cop1::new();
        // add.w is undefined
        assert_eq!(cop1.execute(fpu(20, 0, 0, 0, 0x00), true), Err(Unimplemented));
    }
}
