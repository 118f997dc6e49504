use log::{debug, trace};

use crate::coprocessor0::{self as cp0, Cop0, ExceptionCode};
use crate::cop1::Cop1;
use crate::event_queue::{EventKind, EventQueue, PendingEvent};
use crate::joint_tlb::JointTlb;

pub const RESET_VECTOR: u32 = 0xa400_0040;
pub const GENERAL_VECTOR: u32 = 0x8000_0180;
pub const REFILL_VECTOR: u32 = 0x8000_0000;

/// Distance between housekeeping events
pub const SPECIAL_PERIOD: u32 = 0x4000_0000;

/// Reset button to NMI delay, half a second of Count
pub const NMI_DELAY: u32 = 50_000_000;

/// Architectural state of the VR4300 plus the timing bookkeeping shared by all engines.
pub struct Vr4300 {
    pub gpr: [u64; 32],
    pub hi: u64,
    pub lo: u64,
    /// Address of the instruction being executed (or about to be)
    pub pc: u32,
    pub ll_bit: bool,
    pub cop0: Cop0,
    pub cop1: Cop1,
    pub tlb: JointTlb,
    pub events: EventQueue,

    pub delay_slot: bool,
    /// Set when an exception fires inside a delay slot, so the branch doesn't override the vector
    pub skip_jump: bool,
    /// Count has been brought up to date for every instruction before this address
    pub last_addr: u32,
    pub count_per_op: u32,
    /// Execution stops at the first check point after this cycle
    pub deadline: Option<u32>,
    pub stop: bool,
    /// Counter wraps seen by the housekeeping event
    pub wraps: u32,

    code_writes: Vec<(u32, u32)>,
    track_code_writes: bool,
}

impl Vr4300 {
    pub fn new(count_per_op: u32) -> Vr4300 {
        let mut cpu = Vr4300 {
            gpr: [0; 32],
            hi: 0,
            lo: 0,
            pc: RESET_VECTOR,
            ll_bit: false,
            cop0: Cop0::new(),
            cop1: Cop1::new(),
            tlb: JointTlb::new(),
            events: EventQueue::new(),
            delay_slot: false,
            skip_jump: false,
            last_addr: RESET_VECTOR,
            count_per_op,
            deadline: None,
            stop: false,
            wraps: 0,
            code_writes: Vec::new(),
            track_code_writes: false,
        };
        cpu.init_events();
        cpu
    }

    /// Schedules the events the core itself owns
    pub fn init_events(&mut self) {
        let now = self.count();
        self.events.clear();
        let special = next_special_due(now);
        let _ = self.events.schedule(EventKind::Special, special, now);
        self.arm_compare(now);
    }

    /// Moves execution to `pc`, e.g. after loading a program
    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
        self.last_addr = pc;
        self.delay_slot = false;
        self.skip_jump = false;
    }

    #[inline(always)]
    pub fn count(&self) -> u32 {
        self.cop0.count()
    }

    /// 64bit view of elapsed cycles
    pub fn total_cycles(&self) -> u64 {
        ((self.wraps as u64) << 32) | self.count() as u64
    }

    /// Charges every instruction between `last_addr` and `pc`
    #[inline(always)]
    pub fn update_count(&mut self, pc: u32) {
        let ops = pc.wrapping_sub(self.last_addr) >> 2;
        let count = self.cop0.reg_mut(cp0::COUNT);
        *count = count.wrapping_add(ops.wrapping_mul(self.count_per_op));
        self.last_addr = pc;
    }

    /// The cycle at which the engine must hand control back
    #[inline(always)]
    pub fn next_interrupt(&self) -> u32 {
        let now = self.count();
        let next = self.events.next_due();
        match (next, self.deadline) {
            (Some(e), Some(d)) => {
                if (e.wrapping_sub(now) as i32) <= (d.wrapping_sub(now) as i32) { e } else { d }
            }
            (Some(e), None) => e,
            (None, Some(d)) => d,
            (None, None) => now.wrapping_add(0x7fff_ffff),
        }
    }

    #[inline(always)]
    pub fn interrupt_due(&self) -> bool {
        self.stop || (self.next_interrupt().wrapping_sub(self.count()) as i32) <= 0
    }

    #[inline(always)]
    pub fn deadline_reached(&self) -> bool {
        match self.deadline {
            Some(d) => (d.wrapping_sub(self.count()) as i32) <= 0,
            None => false,
        }
    }

    /// Fast-forward through an idle loop up to the next event, in steps of 4 cycles
    pub fn idle_skip(&mut self) {
        let skip = self.next_interrupt().wrapping_sub(self.count()) as i32;
        if skip > 3 {
            let count = self.cop0.reg_mut(cp0::COUNT);
            *count = count.wrapping_add(skip as u32 & !3);
        }
    }

    #[inline(always)]
    pub fn fr(&self) -> bool {
        self.cop0.status() & cp0::STATUS_FR != 0
    }

    /// Virtual to physical. None means a TLB miss.
    #[inline(always)]
    pub fn translate(&self, vaddr: u32, write: bool) -> Option<u32> {
        if vaddr & 0xc000_0000 == 0x8000_0000 {
            return Some(vaddr & 0x1fff_ffff);
        }
        self.tlb.lookup(vaddr, write)
    }

    // Code write tracking. Only the caching engines care.

    pub fn set_track_code_writes(&mut self, track: bool) {
        self.track_code_writes = track;
        if !track {
            self.code_writes.clear();
        }
    }

    /// Records that guest memory at `vaddr` changed (len == 0 means everything)
    #[inline(always)]
    pub fn note_code_write(&mut self, vaddr: u32, len: u32) {
        if self.track_code_writes {
            self.code_writes.push((vaddr, len));
        }
    }

    #[inline(always)]
    pub fn has_code_writes(&self) -> bool {
        !self.code_writes.is_empty()
    }

    pub fn take_code_writes(&mut self) -> Vec<(u32, u32)> {
        std::mem::take(&mut self.code_writes)
    }

    // Exceptions

    /// Takes an exception whose ExcCode is already in Cause
    pub fn exception_general(&mut self) {
        self.update_count(self.pc);
        *self.cop0.reg_mut(cp0::STATUS) |= cp0::STATUS_EXL;

        let mut epc = self.pc;
        if self.delay_slot {
            *self.cop0.reg_mut(cp0::CAUSE) |= cp0::CAUSE_BD;
            epc = epc.wrapping_sub(4);
            self.skip_jump = true;
        } else {
            *self.cop0.reg_mut(cp0::CAUSE) &= !cp0::CAUSE_BD;
        }
        *self.cop0.reg_mut(cp0::EPC) = epc;

        self.pc = GENERAL_VECTOR;
        self.last_addr = GENERAL_VECTOR;
        debug!("exception {:#x} epc={:#010x}", (self.cop0.cause() & cp0::CAUSE_EXCCODE_MASK) >> 2, epc);
    }

    pub fn exception(&mut self, code: ExceptionCode) {
        let cause = self.cop0.reg_mut(cp0::CAUSE);
        *cause = (*cause & !cp0::CAUSE_EXCCODE_MASK) | code.cause_bits();
        self.exception_general();
    }

    pub fn cop1_unusable(&mut self) {
        let cause = self.cop0.reg_mut(cp0::CAUSE);
        *cause = (*cause & !(cp0::CAUSE_EXCCODE_MASK | 0x3000_0000))
            | ExceptionCode::CoprocessorUnusable.cause_bits()
            | cp0::CAUSE_CE1;
        self.exception_general();
    }

    pub fn tlb_refill_exception(&mut self, vaddr: u32, write: bool) {
        let code = if write { ExceptionCode::TlbStore } else { ExceptionCode::TlbLoad };
        *self.cop0.reg_mut(cp0::BAD_VADDR) = vaddr;
        let context = self.cop0.reg_mut(cp0::CONTEXT);
        *context = (*context & 0xff80_000f) | ((vaddr >> 9) & 0x007f_fff0);
        let entry_hi = self.cop0.reg_mut(cp0::ENTRY_HI);
        *entry_hi = (vaddr & 0xffff_e000) | (*entry_hi & 0xff);

        let refill = self.cop0.status() & cp0::STATUS_EXL == 0
            && !self.tlb.has_entry_for(vaddr, self.cop0.reg(cp0::ENTRY_HI) as u8);
        self.exception(code);
        if refill {
            self.pc = REFILL_VECTOR;
            self.last_addr = REFILL_VECTOR;
        }
    }

    /// ERET. No delay slot.
    pub fn eret(&mut self) {
        self.update_count(self.pc);
        let status = self.cop0.status();
        if status & cp0::STATUS_ERL != 0 {
            self.pc = self.cop0.reg(cp0::ERROR_EPC);
            *self.cop0.reg_mut(cp0::STATUS) &= !cp0::STATUS_ERL;
        } else {
            self.pc = self.cop0.reg(cp0::EPC);
            *self.cop0.reg_mut(cp0::STATUS) &= !cp0::STATUS_EXL;
        }
        self.ll_bit = false;
        self.last_addr = self.pc;
        self.check_interrupt();
    }

    // Interrupts

    /// Requests an interrupt check at the next dispatch boundary if one would be taken
    pub fn check_interrupt(&mut self) {
        if !self.cop0.interrupt_pending() || self.events.contains(EventKind::Check) {
            return;
        }
        let now = self.count();
        let _ = self.events.push_front(EventKind::Check, now);
    }

    /// Interrupt-line aggregator. Drives one of the Cause IP bits from a level.
    pub fn set_interrupt_line(&mut self, ip: u32, asserted: bool) {
        let cause = self.cop0.reg_mut(cp0::CAUSE);
        if asserted {
            *cause |= ip;
        } else {
            *cause &= !ip;
        }
        self.check_interrupt();
    }

    /// Asserts `ip` and takes the interrupt right away when it isn't masked
    pub fn raise_maskable_interrupt(&mut self, ip: u32) {
        *self.cop0.reg_mut(cp0::CAUSE) |= ip;
        if !self.cop0.interrupt_pending() {
            return;
        }
        self.exception(ExceptionCode::Interrupt);
    }

    // Core event handlers

    /// Handler for `EventKind::Check`
    pub fn check_event(&mut self, _event: PendingEvent) {
        if self.cop0.interrupt_pending() {
            self.exception(ExceptionCode::Interrupt);
        }
    }

    /// Schedules the next Compare event. Targets half the counter range or more away are
    /// reached through intermediate hops, which don't raise anything.
    pub fn arm_compare(&mut self, from: u32) {
        let compare = self.cop0.compare();
        let delta = compare.wrapping_sub(from);
        let due = if delta == 0 || delta >= 0x8000_0000 {
            from.wrapping_add(SPECIAL_PERIOD)
        } else {
            compare
        };
        let now = self.count();
        let _ = self.events.schedule(EventKind::Compare, due, now);
    }

    /// Handler for `EventKind::Compare`
    pub fn compare_event(&mut self, event: PendingEvent) {
        self.arm_compare(event.due);
        if event.due == self.cop0.compare() {
            trace!("compare interrupt at {:#010x}", event.due);
            self.raise_maskable_interrupt(cp0::CAUSE_IP7);
        }
    }

    /// Handler for `EventKind::Special`
    pub fn special_event(&mut self, event: PendingEvent) {
        if event.due == 0 {
            self.wraps = self.wraps.wrapping_add(1);
            debug!("count wrapped ({} times)", self.wraps);
        }
        let now = self.count();
        let _ = self.events.schedule(EventKind::Special, event.due.wrapping_add(SPECIAL_PERIOD), now);
    }

    /// Handler for `EventKind::Hw2`, the reset button
    pub fn hw2_event(&mut self, _event: PendingEvent) {
        let status = self.cop0.reg_mut(cp0::STATUS);
        *status = (*status & !(cp0::STATUS_SR | cp0::STATUS_TS | 0x0008_0000)) | cp0::STATUS_IM4;
        let cause = self.cop0.reg_mut(cp0::CAUSE);
        *cause = (*cause | cp0::CAUSE_IP4) & !cp0::CAUSE_EXCCODE_MASK;
        self.exception_general();
    }

    /// Handler for `EventKind::Nmi`. Device events are dropped; the caller re-arms its own.
    pub fn nmi_event(&mut self, _event: PendingEvent) {
        let status = self.cop0.reg_mut(cp0::STATUS);
        *status = (*status & !(cp0::STATUS_SR | cp0::STATUS_TS | 0x0008_0000))
            | cp0::STATUS_ERL | cp0::STATUS_BEV | cp0::STATUS_SR;
        *self.cop0.reg_mut(cp0::CAUSE) = 0;
        *self.cop0.reg_mut(cp0::COUNT) = 0;
        self.init_events();

        let mut error_epc = self.pc;
        if self.delay_slot {
            error_epc = error_epc.wrapping_sub(4);
        }
        *self.cop0.reg_mut(cp0::ERROR_EPC) = error_epc;

        self.note_code_write(0, 0);
        self.set_pc(RESET_VECTOR);
        debug!("nmi, error epc {:#010x}", error_epc);
    }

    /// Press the reset button: pre-NMI now, NMI half a second later
    pub fn soft_reset(&mut self) {
        let now = self.count();
        let _ = self.events.schedule(EventKind::Hw2, now, now);
        let _ = self.events.schedule(EventKind::Nmi, now.wrapping_add(NMI_DELAY), now);
    }

    // COP0 moves with side effects

    pub fn read_cop0(&mut self, index: usize) -> u32 {
        match index {
            cp0::RANDOM => {
                self.update_count(self.pc);
                self.cop0.update_random();
            }
            cp0::COUNT => self.update_count(self.pc),
            _ => {}
        }
        self.cop0.reg(index)
    }

    pub fn write_cop0(&mut self, index: usize, value: u32) {
        match index {
            cp0::COUNT => {
                self.update_count(self.pc);
                let old = self.count();
                self.events.rebase(old, value);
                self.events.cancel(EventKind::Compare);
                self.events.cancel(EventKind::Special);
                *self.cop0.reg_mut(cp0::COUNT) = value;
                let _ = self.events.schedule(EventKind::Special, next_special_due(value), value);
                self.arm_compare(value);
            }
            cp0::COMPARE => {
                self.update_count(self.pc);
                self.events.cancel(EventKind::Compare);
                *self.cop0.reg_mut(cp0::COMPARE) = value;
                let now = self.count();
                self.arm_compare(now);
                *self.cop0.reg_mut(cp0::CAUSE) &= !cp0::CAUSE_IP7;
            }
            cp0::STATUS => {
                self.update_count(self.pc);
                *self.cop0.reg_mut(cp0::STATUS) = value;
                self.check_interrupt();
            }
            cp0::CAUSE => {
                let cause = self.cop0.reg_mut(cp0::CAUSE);
                *cause = (*cause & !0x300) | (value & 0x300);
                self.check_interrupt();
            }
            _ => self.cop0.write_plain(index, value),
        }
    }
}

/// First quarter-period boundary strictly after `now`
fn next_special_due(now: u32) -> u32 {
    (now & !(SPECIAL_PERIOD - 1)).wrapping_add(SPECIAL_PERIOD)
}
