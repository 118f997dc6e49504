//! System control coprocessor: exception state, the Count/Compare timer and the TLB registers.

pub const COP0_REG_NAMES: [&'static str; 32] = [
    "Index", "Random", "EntryLo0", "EntryLo1", "Context", "PageMask", "Wired", "Reserved7",
    "BadVAddr", "Count", "EntryHi", "Compare", "Status", "Cause", "EPC", "PRevID",
    "Config", "LLAddr", "WatchLo", "WatchHi", "XContext", "Reserved21", "Reserved22", "Reserved23",
    "Reserved24", "Reserved25", "PErr", "CacheErr", "TagLo", "TagHi", "ErrorEPC", "Reserved31",
];

pub const INDEX: usize = 0;
pub const RANDOM: usize = 1;
pub const ENTRY_LO0: usize = 2;
pub const ENTRY_LO1: usize = 3;
pub const CONTEXT: usize = 4;
pub const PAGE_MASK: usize = 5;
pub const WIRED: usize = 6;
pub const BAD_VADDR: usize = 8;
pub const COUNT: usize = 9;
pub const ENTRY_HI: usize = 10;
pub const COMPARE: usize = 11;
pub const STATUS: usize = 12;
pub const CAUSE: usize = 13;
pub const EPC: usize = 14;
pub const PREV_ID: usize = 15;
pub const CONFIG: usize = 16;
pub const LL_ADDR: usize = 17;
pub const WATCH_LO: usize = 18;
pub const WATCH_HI: usize = 19;
pub const TAG_LO: usize = 28;
pub const TAG_HI: usize = 29;
pub const ERROR_EPC: usize = 30;

pub const STATUS_IE: u32 = 0x0000_0001;
pub const STATUS_EXL: u32 = 0x0000_0002;
pub const STATUS_ERL: u32 = 0x0000_0004;
pub const STATUS_IM4: u32 = 0x0000_1000;
pub const STATUS_SR: u32 = 0x0010_0000;
pub const STATUS_TS: u32 = 0x0020_0000;
pub const STATUS_BEV: u32 = 0x0040_0000;
pub const STATUS_FR: u32 = 0x0400_0000;
pub const STATUS_CU1: u32 = 0x2000_0000;

pub const CAUSE_IP2: u32 = 0x0000_0400; // rcp
pub const CAUSE_IP3: u32 = 0x0000_0800; // cart
pub const CAUSE_IP4: u32 = 0x0000_1000; // pre-nmi
pub const CAUSE_IP7: u32 = 0x0000_8000; // timer
pub const CAUSE_CE1: u32 = 0x1000_0000;
pub const CAUSE_BD: u32 = 0x8000_0000;
pub const CAUSE_EXCCODE_MASK: u32 = 0x1f << 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ExceptionCode {
    Interrupt = 0,
    TlbModification = 1,
    TlbLoad = 2,
    TlbStore = 3,
    AddressLoad = 4,
    AddressStore = 5,
    Syscall = 8,
    Breakpoint = 9,
    ReservedInstruction = 10,
    CoprocessorUnusable = 11,
    Overflow = 12,
    Trap = 13,
    FloatingPoint = 15,
}

impl ExceptionCode {
    #[inline(always)]
    pub fn cause_bits(self) -> u32 {
        (self as u32) << 2
    }
}

pub struct Cop0 {
    regs: [u32; 32],
}

impl Cop0 {
    pub fn new() -> Cop0 {
        let mut cop0 = Cop0 { regs: [0; 32] };
        cop0.poweron();
        cop0
    }

    pub fn poweron(&mut self) {
        self.regs = [0; 32];
        self.regs[RANDOM] = 31;
        self.regs[STATUS] = 0x3400_0000;
        self.regs[CONFIG] = 0x0006_e463;
        self.regs[PREV_ID] = 0x0000_0b00;
        self.regs[EPC] = 0xffff_ffff;
        self.regs[BAD_VADDR] = 0xffff_ffff;
        self.regs[ERROR_EPC] = 0xffff_ffff;
        self.regs[CONTEXT] = 0x007f_fff0;
        self.regs[ENTRY_HI] = 0xffff_e0ff;
    }

    #[inline(always)]
    pub fn reg(&self, index: usize) -> u32 {
        self.regs[index]
    }

    #[inline(always)]
    pub fn reg_mut(&mut self, index: usize) -> &mut u32 {
        &mut self.regs[index]
    }

    #[inline(always)]
    pub fn count(&self) -> u32 { self.regs[COUNT] }
    #[inline(always)]
    pub fn compare(&self) -> u32 { self.regs[COMPARE] }
    #[inline(always)]
    pub fn status(&self) -> u32 { self.regs[STATUS] }
    #[inline(always)]
    pub fn cause(&self) -> u32 { self.regs[CAUSE] }

    /// IE set with both EXL and ERL clear
    #[inline(always)]
    pub fn interrupts_enabled(&self) -> bool {
        self.regs[STATUS] & 7 == STATUS_IE
    }

    /// An unmasked interrupt line is asserted and the CPU would take it
    #[inline(always)]
    pub fn interrupt_pending(&self) -> bool {
        self.interrupts_enabled() && self.regs[STATUS] & self.regs[CAUSE] & 0xff00 != 0
    }

    pub fn fpu_usable(&self) -> bool {
        self.regs[STATUS] & STATUS_CU1 != 0
    }

    /// Random counts down between 31 and Wired. Derived from Count like the interpreter always has.
    pub fn update_random(&mut self) {
        let wired = self.regs[WIRED] & 0x1f;
        let span = 32u32.saturating_sub(wired).max(1);
        self.regs[RANDOM] = (self.regs[COUNT] / 2 % span) + wired;
    }

    /// Writes to registers without side effects on the rest of the machine.
    ///
    /// Count, Compare, Status and Cause are handled by the CPU, which owns the event queue.
    pub fn write_plain(&mut self, index: usize, value: u32) {
        match index {
            INDEX => self.regs[INDEX] = value & 0x8000_003f,
            RANDOM | BAD_VADDR | PREV_ID => {} // read only
            ENTRY_LO0 | ENTRY_LO1 => self.regs[index] = value & 0x3fff_ffff,
            CONTEXT => self.regs[CONTEXT] = (value & 0xff80_0000) | (self.regs[CONTEXT] & 0x007f_fff0),
            PAGE_MASK => self.regs[PAGE_MASK] = value & 0x01ff_e000,
            WIRED => {
                self.regs[WIRED] = value;
                self.regs[RANDOM] = 31;
            }
            ENTRY_HI => self.regs[ENTRY_HI] = value & 0xffff_e0ff,
            TAG_LO => self.regs[TAG_LO] = value & 0x0fff_ffc0,
            TAG_HI => self.regs[TAG_HI] = 0,
            EPC | CONFIG | LL_ADDR | WATCH_LO | WATCH_HI | ERROR_EPC => self.regs[index] = value,
            _ => {
                log::debug!("write to unimplemented cop0 register {} ({:#010x})", COP0_REG_NAMES[index], value);
            }
        }
    }
}

impl Default for Cop0 {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cop0 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in COP0_REG_NAMES.iter().zip(self.regs.iter()) {
            if !name.starts_with("Reserved") {
                map.entry(name, &format_args!("{:#010x}", value));
            }
        }
        map.finish()
    }
}
