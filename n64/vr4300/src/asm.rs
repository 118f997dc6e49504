//! Encoders for the handful of instructions tests and tools assemble by hand.

fn i_type(op: u32, rs: u32, rt: u32, imm: i32) -> u32 {
    (op << 26) | (rs << 21) | (rt << 16) | (imm as u32 & 0xffff)
}

fn r_type(rs: u32, rt: u32, rd: u32, sa: u32, funct: u32) -> u32 {
    (rs << 21) | (rt << 16) | (rd << 11) | (sa << 6) | funct
}

pub const NOP: u32 = 0;

pub fn addiu(rt: u32, rs: u32, imm: i32) -> u32 { i_type(0x09, rs, rt, imm) }
pub fn ori(rt: u32, rs: u32, imm: i32) -> u32 { i_type(0x0d, rs, rt, imm) }
pub fn lui(rt: u32, imm: i32) -> u32 { i_type(0x0f, 0, rt, imm) }
pub fn lw(rt: u32, base: u32, offset: i32) -> u32 { i_type(0x23, base, rt, offset) }
pub fn sw(rt: u32, base: u32, offset: i32) -> u32 { i_type(0x2b, base, rt, offset) }
pub fn addu(rd: u32, rs: u32, rt: u32) -> u32 { r_type(rs, rt, rd, 0, 0x21) }
pub fn subu(rd: u32, rs: u32, rt: u32) -> u32 { r_type(rs, rt, rd, 0, 0x23) }
pub fn xor(rd: u32, rs: u32, rt: u32) -> u32 { r_type(rs, rt, rd, 0, 0x26) }
pub fn sll(rd: u32, rt: u32, sa: u32) -> u32 { r_type(0, rt, rd, sa, 0x00) }
pub fn slt(rd: u32, rs: u32, rt: u32) -> u32 { r_type(rs, rt, rd, 0, 0x2a) }
pub fn daddu(rd: u32, rs: u32, rt: u32) -> u32 { r_type(rs, rt, rd, 0, 0x2d) }
pub fn jr(rs: u32) -> u32 { r_type(rs, 0, 0, 0, 0x08) }

/// `offset` counts instructions from the delay slot
pub fn beq(rs: u32, rt: u32, offset: i32) -> u32 { i_type(0x04, rs, rt, offset) }
pub fn bne(rs: u32, rt: u32, offset: i32) -> u32 { i_type(0x05, rs, rt, offset) }
pub fn bnel(rs: u32, rt: u32, offset: i32) -> u32 { i_type(0x15, rs, rt, offset) }
pub fn bgtz(rs: u32, offset: i32) -> u32 { i_type(0x07, rs, 0, offset) }
pub fn j(target: u32) -> u32 { (0x02 << 26) | ((target >> 2) & 0x03ff_ffff) }
pub fn jal(target: u32) -> u32 { (0x03 << 26) | ((target >> 2) & 0x03ff_ffff) }

pub fn mfc0(rt: u32, rd: u32) -> u32 { (0x10 << 26) | (rt << 16) | (rd << 11) }
pub fn mtc0(rt: u32, rd: u32) -> u32 { (0x10 << 26) | (0x04 << 21) | (rt << 16) | (rd << 11) }
pub const ERET: u32 = 0x4200_0018;
