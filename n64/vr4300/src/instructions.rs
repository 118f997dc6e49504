use modular_bitfield::{bitfield, specifiers::*};

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RType {
    pub funct: B6,
    pub sa: B5,
    pub rd: B5,
    pub rt: B5,
    pub rs: B5,
    pub op: B6,
}

impl RType {
    #[inline(always)]
    pub fn from_word(word: u32) -> RType {
        RType::from_bytes(word.to_le_bytes())
    }

    #[inline(always)]
    pub fn word(self) -> u32 {
        u32::from_le_bytes(self.into_bytes())
    }

    /// The low 16 bits, sign extended to 64 bits
    #[inline(always)]
    pub fn simm(self) -> u64 {
        self.word() as u16 as i16 as i64 as u64
    }

    /// The low 16 bits, zero extended
    #[inline(always)]
    pub fn uimm(self) -> u64 {
        (self.word() & 0xffff) as u64
    }

    #[inline(always)]
    pub fn target(self) -> u32 {
        self.word() & 0x03ff_ffff
    }

    /// COP1 fields alias the R-Type layout: fmt = rs, ft = rt, fs = rd, fd = sa
    #[inline(always)]
    pub fn fmt(self) -> u8 { self.rs() }
    #[inline(always)]
    pub fn ft(self) -> u8 { self.rt() }
    #[inline(always)]
    pub fn fs(self) -> u8 { self.rd() }
    #[inline(always)]
    pub fn fd(self) -> u8 { self.sa() }
}

/// One tag per guest operation. The three execution strategies all dispatch on this.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpKind {
    // Special
    Sll, Srl, Sra, Sllv, Srlv, Srav,
    Jr, Jalr,
    Syscall, Break, Sync,
    Mfhi, Mthi, Mflo, Mtlo,
    Dsllv, Dsrlv, Dsrav,
    Mult, Multu, Div, Divu, Dmult, Dmultu, Ddiv, Ddivu,
    Add, Addu, Sub, Subu, And, Or, Xor, Nor,
    Slt, Sltu, Dadd, Daddu, Dsub, Dsubu,
    Tge, Tgeu, Tlt, Tltu, Teq, Tne,
    Dsll, Dsrl, Dsra, Dsll32, Dsrl32, Dsra32,
    // RegImm
    Bltz, Bgez, Bltzl, Bgezl,
    Tgei, Tgeiu, Tlti, Tltiu, Teqi, Tnei,
    Bltzal, Bgezal, Bltzall, Bgezall,
    // Primary
    J, Jal, Beq, Bne, Blez, Bgtz,
    Addi, Addiu, Slti, Sltiu, Andi, Ori, Xori, Lui,
    Beql, Bnel, Blezl, Bgtzl,
    Daddi, Daddiu,
    Ldl, Ldr, Lb, Lh, Lwl, Lw, Lbu, Lhu, Lwr, Lwu,
    Sb, Sh, Swl, Sw, Sdl, Sdr, Swr, Cache,
    Ll, Lwc1, Lld, Ldc1, Ld,
    Sc, Swc1, Scd, Sdc1, Sd,
    // COP0
    Mfc0, Dmfc0, Mtc0, Dmtc0,
    Tlbr, Tlbwi, Tlbwr, Tlbp, Eret,
    // COP1
    Mfc1, Dmfc1, Cfc1, Mtc1, Dmtc1, Ctc1,
    Bc1f, Bc1t, Bc1fl, Bc1tl,
    FpuArith,

    Reserved,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BranchCond {
    Always,
    Eq,
    Ne,
    Lez,
    Gtz,
    Ltz,
    Gez,
    Fpu(bool),
}

/// How a control-transfer op behaves. Everything the engines need to pick a jump variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct JumpInfo {
    pub cond: BranchCond,
    pub likely: bool,
    pub link: bool,
    /// Target comes from a register, not known at compile time
    pub register: bool,
}

impl OpKind {
    pub fn jump_info(self) -> Option<JumpInfo> {
        use OpKind::*;
        use BranchCond as C;
        let info = |cond, likely, link, register| Some(JumpInfo { cond, likely, link, register });
        match self {
            J => info(C::Always, false, false, false),
            Jal => info(C::Always, false, true, false),
            Jr => info(C::Always, false, false, true),
            Jalr => info(C::Always, false, true, true),
            Beq => info(C::Eq, false, false, false),
            Bne => info(C::Ne, false, false, false),
            Blez => info(C::Lez, false, false, false),
            Bgtz => info(C::Gtz, false, false, false),
            Beql => info(C::Eq, true, false, false),
            Bnel => info(C::Ne, true, false, false),
            Blezl => info(C::Lez, true, false, false),
            Bgtzl => info(C::Gtz, true, false, false),
            Bltz => info(C::Ltz, false, false, false),
            Bgez => info(C::Gez, false, false, false),
            Bltzl => info(C::Ltz, true, false, false),
            Bgezl => info(C::Gez, true, false, false),
            Bltzal => info(C::Ltz, false, true, false),
            Bgezal => info(C::Gez, false, true, false),
            Bltzall => info(C::Ltz, true, true, false),
            Bgezall => info(C::Gez, true, true, false),
            Bc1f => info(C::Fpu(false), false, false, false),
            Bc1t => info(C::Fpu(true), false, false, false),
            Bc1fl => info(C::Fpu(false), true, false, false),
            Bc1tl => info(C::Fpu(true), true, false, false),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn is_jump(self) -> bool {
        self.jump_info().is_some()
    }

    /// Stores are what can overwrite code, so they end up checking the translation cache
    pub fn is_store(self) -> bool {
        use OpKind::*;
        matches!(self, Sb | Sh | Swl | Sw | Sdl | Sdr | Swr | Sc | Swc1 | Scd | Sdc1 | Sd)
    }
}

/// Walks the opcode tables down to the entry describing `inst_word`
pub fn decode(inst_word: u32) -> &'static InstructionInfo {
    // every table is indexed by R-Type fields
    let inst = RType::from_word(inst_word);

    let mut info = &PRIMARY_TABLE[inst.op() as usize];
    loop {
        info = match info {
            InstructionInfo::Special => &SPECIAL_TABLE[inst.funct() as usize],
            InstructionInfo::RegImm => &REGIMM_TABLE[inst.rt() as usize],
            InstructionInfo::CopOp(0) if inst.rs() < 16 => &COP0_TABLE[inst.rs() as usize],
            InstructionInfo::CopOp(0) => &COP0_FN_TABLE[inst.funct() as usize],
            InstructionInfo::CopOp(1) if inst.rs() < 16 => &COP1_TABLE[inst.rs() as usize],
            InstructionInfo::CopOp(1) if matches!(inst.rs(), 16 | 17 | 20 | 21) => {
                &COP1_FN_TABLE[inst.funct() as usize]
            }
            InstructionInfo::Bc1 => &BC1_TABLE[(inst.rt() & 3) as usize],
            InstructionInfo::Op(..) | InstructionInfo::Reserved => return info,
            InstructionInfo::CopOp(_) => return &InstructionInfo::Reserved,
        };
    }
}

/// Shortcut for the engines, which only care about the tag
#[inline(always)]
pub fn op_kind(inst_word: u32) -> OpKind {
    decode(inst_word).kind()
}

/// Upper-case mnemonic, for trace logging
pub fn mnemonic(inst_word: u32) -> &'static str {
    decode(inst_word).name()
}

#[derive(Debug, Clone, Copy)]
pub enum InstructionInfo {
    Reserved,
    Special,
    RegImm,
    Bc1,
    Op(&'static str, OpKind),
    CopOp(u8),
}

impl InstructionInfo {
    pub fn name(&self) -> &'static str {
        match self {
            InstructionInfo::Reserved => "Reserved",
            InstructionInfo::Special => "Special",
            InstructionInfo::RegImm => "RegImm",
            InstructionInfo::Bc1 => "BC1",
            InstructionInfo::Op(name, _) => name,
            InstructionInfo::CopOp(_) => "CopOp",
        }
    }
    pub fn kind(&self) -> OpKind {
        match self {
            InstructionInfo::Op(_, kind) => *kind,
            _ => OpKind::Reserved,
        }
    }
}

const fn build_primary_table() -> [InstructionInfo; 64] {
    use InstructionInfo::*;
    use OpKind as K;

    // Special, RegImm and the COP ops each continue in a subtable
    [
        Special,
        RegImm,
        Op("J", K::J),
        Op("JAL", K::Jal),
        Op("BEQ", K::Beq),
        Op("BNE", K::Bne),
        Op("BLEZ", K::Blez),
        Op("BGTZ", K::Bgtz),
        // 1
        Op("ADDI", K::Addi),
        Op("ADDIU", K::Addiu),
        Op("SLTI", K::Slti),
        Op("SLTIU", K::Sltiu),
        Op("ANDI", K::Andi),
        Op("ORI", K::Ori),
        Op("XORI", K::Xori),
        Op("LUI", K::Lui),
        // 2
        CopOp(0),
        CopOp(1),
        CopOp(2),
        Reserved,
        Op("BEQL", K::Beql),
        Op("BNEL", K::Bnel),
        Op("BLEZL", K::Blezl),
        Op("BGTZL", K::Bgtzl),
        // 3
        Op("DADDI", K::Daddi),
        Op("DADDIU", K::Daddiu),
        Op("LDL", K::Ldl),
        Op("LDR", K::Ldr),
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        // 4
        Op("LB", K::Lb),
        Op("LH", K::Lh),
        Op("LWL", K::Lwl),
        Op("LW", K::Lw),
        Op("LBU", K::Lbu),
        Op("LHU", K::Lhu),
        Op("LWR", K::Lwr),
        Op("LWU", K::Lwu),
        // 5
        Op("SB", K::Sb),
        Op("SH", K::Sh),
        Op("SWL", K::Swl),
        Op("SW", K::Sw),
        Op("SDL", K::Sdl),
        Op("SDR", K::Sdr),
        Op("SWR", K::Swr),
        Op("CACHE", K::Cache),
        // 6
        Op("LL", K::Ll),
        Op("LWC1", K::Lwc1),
        Reserved, // LWC2
        Reserved,
        Op("LLD", K::Lld),
        Op("LDC1", K::Ldc1),
        Reserved, // LDC2
        Op("LD", K::Ld),
        // 7
        Op("SC", K::Sc),
        Op("SWC1", K::Swc1),
        Reserved, // SWC2
        Reserved,
        Op("SCD", K::Scd),
        Op("SDC1", K::Sdc1),
        Reserved, // SDC2
        Op("SD", K::Sd),
    ]
}

const fn build_special_table() -> [InstructionInfo; 64] {
    use InstructionInfo::*;
    use OpKind as K;

    [
        // 0
        Op("SLL", K::Sll),
        Reserved,
        Op("SRL", K::Srl),
        Op("SRA", K::Sra),
        Op("SLLV", K::Sllv),
        Reserved,
        Op("SRLV", K::Srlv),
        Op("SRAV", K::Srav),
        // 1
        Op("JR", K::Jr),
        Op("JALR", K::Jalr),
        Reserved,
        Reserved,
        Op("SYSCALL", K::Syscall),
        Op("BREAK", K::Break),
        Reserved,
        Op("SYNC", K::Sync),
        // 2
        Op("MFHI", K::Mfhi),
        Op("MTHI", K::Mthi),
        Op("MFLO", K::Mflo),
        Op("MTLO", K::Mtlo),
        Op("DSLLV", K::Dsllv),
        Reserved,
        Op("DSRLV", K::Dsrlv),
        Op("DSRAV", K::Dsrav),
        // 3
        Op("MULT", K::Mult),
        Op("MULTU", K::Multu),
        Op("DIV", K::Div),
        Op("DIVU", K::Divu),
        Op("DMULT", K::Dmult),
        Op("DMULTU", K::Dmultu),
        Op("DDIV", K::Ddiv),
        Op("DDIVU", K::Ddivu),
        // 4
        Op("ADD", K::Add),
        Op("ADDU", K::Addu),
        Op("SUB", K::Sub),
        Op("SUBU", K::Subu),
        Op("AND", K::And),
        Op("OR", K::Or),
        Op("XOR", K::Xor),
        Op("NOR", K::Nor),
        // 5
        Reserved,
        Reserved,
        Op("SLT", K::Slt),
        Op("SLTU", K::Sltu),
        Op("DADD", K::Dadd),
        Op("DADDU", K::Daddu),
        Op("DSUB", K::Dsub),
        Op("DSUBU", K::Dsubu),
        // 6
        Op("TGE", K::Tge),
        Op("TGEU", K::Tgeu),
        Op("TLT", K::Tlt),
        Op("TLTU", K::Tltu),
        Op("TEQ", K::Teq),
        Reserved,
        Op("TNE", K::Tne),
        Reserved,
        // 7
        Op("DSLL", K::Dsll),
        Reserved,
        Op("DSRL", K::Dsrl),
        Op("DSRA", K::Dsra),
        Op("DSLL32", K::Dsll32),
        Reserved,
        Op("DSRL32", K::Dsrl32),
        Op("DSRA32", K::Dsra32),
    ]
}

const fn build_regimm_table() -> [InstructionInfo; 32] {
    use InstructionInfo::*;
    use OpKind as K;

    let mut table = [Reserved; 32];
    table[0x00] = Op("BLTZ", K::Bltz);
    table[0x01] = Op("BGEZ", K::Bgez);
    table[0x02] = Op("BLTZL", K::Bltzl);
    table[0x03] = Op("BGEZL", K::Bgezl);
    table[0x08] = Op("TGEI", K::Tgei);
    table[0x09] = Op("TGEIU", K::Tgeiu);
    table[0x0a] = Op("TLTI", K::Tlti);
    table[0x0b] = Op("TLTIU", K::Tltiu);
    table[0x0c] = Op("TEQI", K::Teqi);
    table[0x0e] = Op("TNEI", K::Tnei);
    table[0x10] = Op("BLTZAL", K::Bltzal);
    table[0x11] = Op("BGEZAL", K::Bgezal);
    table[0x12] = Op("BLTZALL", K::Bltzall);
    table[0x13] = Op("BGEZALL", K::Bgezall);

    return table;
}

const fn build_cop0_table() -> [InstructionInfo; 16] {
    use InstructionInfo::*;
    use OpKind as K;

    let mut table = [Reserved; 16];
    table[0x0] = Op("MFC0", K::Mfc0);
    table[0x1] = Op("DMFC0", K::Dmfc0);
    table[0x4] = Op("MTC0", K::Mtc0);
    table[0x5] = Op("DMTC0", K::Dmtc0);

    return table;
}

const fn build_cop0_fn_table() -> [InstructionInfo; 64] {
    use InstructionInfo::*;
    use OpKind as K;

    let mut table = [Reserved; 64];
    table[0x1] = Op("TLBR", K::Tlbr);
    table[0x2] = Op("TLBWI", K::Tlbwi);
    table[0x6] = Op("TLBWR", K::Tlbwr);
    table[0x8] = Op("TLBP", K::Tlbp);
    table[0x18] = Op("ERET", K::Eret);

    return table;
}

const fn build_cop1_table() -> [InstructionInfo; 16] {
    use InstructionInfo::*;
    use OpKind as K;

    let mut table = [Reserved; 16];
    table[0x0] = Op("MFC1", K::Mfc1);
    table[0x1] = Op("DMFC1", K::Dmfc1);
    table[0x2] = Op("CFC1", K::Cfc1);
    table[0x4] = Op("MTC1", K::Mtc1);
    table[0x5] = Op("DMTC1", K::Dmtc1);
    table[0x6] = Op("CTC1", K::Ctc1);
    table[0x8] = Bc1;

    return table;
}

const fn build_bc1_table() -> [InstructionInfo; 4] {
    use InstructionInfo::*;
    use OpKind as K;

    [
        Op("BC1F", K::Bc1f),
        Op("BC1T", K::Bc1t),
        Op("BC1FL", K::Bc1fl),
        Op("BC1TL", K::Bc1tl),
    ]
}

const fn build_cop1_fn_table() -> [InstructionInfo; 64] {
    use InstructionInfo::*;

    const fn fpu(name: &'static str) -> InstructionInfo {
        Op(name, OpKind::FpuArith)
    }

    let mut table = [Reserved; 64];
    table[0x00] = fpu("ADD");
    table[0x01] = fpu("SUB");
    table[0x02] = fpu("MUL");
    table[0x03] = fpu("DIV");
    table[0x04] = fpu("SQRT");
    table[0x05] = fpu("ABS");
    table[0x06] = fpu("MOV");
    table[0x07] = fpu("NEG");
    table[0x08] = fpu("ROUND.L");
    table[0x09] = fpu("TRUNC.L");
    table[0x0a] = fpu("CEIL.L");
    table[0x0b] = fpu("FLOOR.L");
    table[0x0c] = fpu("ROUND.W");
    table[0x0d] = fpu("TRUNC.W");
    table[0x0e] = fpu("CEIL.W");
    table[0x0f] = fpu("FLOOR.W");
    table[0x20] = fpu("CVT.S");
    table[0x21] = fpu("CVT.D");
    table[0x24] = fpu("CVT.W");
    table[0x25] = fpu("CVT.L");

    let names = [
        "C.F", "C.UN", "C.EQ", "C.UEQ", "C.OLT", "C.ULT", "C.OLE", "C.ULE",
        "C.SF", "C.NGLE", "C.SEQ", "C.NGL", "C.LT", "C.NGE", "C.LE", "C.NGT",
    ];
    let mut i = 0;
    while i < 16 {
        table[0x30 + i] = fpu(names[i]);
        i += 1;
    }

    return table;
}

static PRIMARY_TABLE: [InstructionInfo; 64] = build_primary_table();
static SPECIAL_TABLE: [InstructionInfo; 64] = build_special_table();
static REGIMM_TABLE: [InstructionInfo; 32] = build_regimm_table();
static COP0_TABLE: [InstructionInfo; 16] = build_cop0_table();
static COP0_FN_TABLE: [InstructionInfo; 64] = build_cop0_fn_table();
static COP1_TABLE: [InstructionInfo; 16] = build_cop1_table();
static BC1_TABLE: [InstructionInfo; 4] = build_bc1_table();
static COP1_FN_TABLE: [InstructionInfo; 64] = build_cop1_fn_table();
