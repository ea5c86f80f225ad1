//! PowerPC ("Espresso"/Broadway) instruction decoder.
//!
//! Decodes a single big-endian-interpreted 32-bit instruction word into an
//! [`Instruction`]: a stable [`InstructionId`] plus the raw word, from which
//! the interpreter and JIT front end pull operand fields on demand via the
//! accessor methods below. The dispatch table is a dense match over the
//! six-bit primary opcode with secondary tables for the extended-opcode
//! (`XO`-form) primaries (4, 19, 31, 59, 63), mirroring how the real
//! instruction set is organized rather than a flat lookup.
//!
//! Every encoding this crate does not recognize decodes to
//! [`DecodeError::UnknownEncoding`] rather than panicking; the guest binary
//! is untrusted input.

use bitflags::bitflags;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum DecodeError {
    #[error("unknown instruction encoding 0x{0:08x}")]
    UnknownEncoding(u32),
}

bitflags! {
    /// Which operand categories a decoded instruction carries. Used by the
    /// interpreter's generic trace/log path so it doesn't need a second
    /// match over [`InstructionId`] just to know what to print.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OperandFlags: u32 {
        const GPR_OUT    = 1 << 0;
        const GPR_IN_A   = 1 << 1;
        const GPR_IN_B   = 1 << 2;
        const FPR_OUT    = 1 << 3;
        const FPR_IN_A   = 1 << 4;
        const FPR_IN_B   = 1 << 5;
        const FPR_IN_C   = 1 << 6;
        const IMMEDIATE  = 1 << 7;
        const BRANCH     = 1 << 8;
        const CR_FIELD   = 1 << 9;
        const SPR        = 1 << 10;
        const MEMORY     = 1 << 11;
        const RECORD_BIT = 1 << 12;
        const OVERFLOW_BIT = 1 << 13;
        const PAIRED_SINGLE = 1 << 14;
    }
}

macro_rules! instruction_ids {
    ($($variant:ident => $name:literal, $flags:expr;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum InstructionId {
            $($variant,)*
        }

        impl InstructionId {
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(InstructionId::$variant => $name,)*
                }
            }

            pub fn operand_flags(self) -> OperandFlags {
                match self {
                    $(InstructionId::$variant => $flags,)*
                }
            }

            /// Dense index into `0..Self::COUNT`, stable for the lifetime of
            /// a process. Used by `esp-perf` to size its per-instruction
            /// counter arrays.
            pub fn index(self) -> usize {
                self as usize
            }

            pub const COUNT: usize = [$(InstructionId::$variant),*].len();
            pub const ALL: [InstructionId; Self::COUNT] = [$(InstructionId::$variant),*];
        }
    };
}

instruction_ids! {
    // Integer arithmetic, register forms.
    Add => "add", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::OVERFLOW_BIT);
    Addc => "addc", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::OVERFLOW_BIT);
    Adde => "adde", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::OVERFLOW_BIT);
    Subf => "subf", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::OVERFLOW_BIT);
    Subfc => "subfc", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::OVERFLOW_BIT);
    Subfe => "subfe", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::OVERFLOW_BIT);
    Neg => "neg", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::RECORD_BIT).union(OperandFlags::OVERFLOW_BIT);
    Mullw => "mullw", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::OVERFLOW_BIT);
    Divw => "divw", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::OVERFLOW_BIT);
    Divwu => "divwu", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::OVERFLOW_BIT);

    // Logical, register forms.
    And => "and", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT);
    Or => "or", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT);
    Xor => "xor", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT);
    Nand => "nand", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT);
    Nor => "nor", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT);
    Andc => "andc", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT);
    Orc => "orc", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT);
    Eqv => "eqv", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT);
    Extsb => "extsb", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::RECORD_BIT);
    Extsh => "extsh", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::RECORD_BIT);
    Cntlzw => "cntlzw", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::RECORD_BIT);

    // Shifts and rotates.
    Slw => "slw", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT);
    Srw => "srw", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT);
    Sraw => "sraw", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT);
    Srawi => "srawi", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::RECORD_BIT);
    Rlwinm => "rlwinm", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::RECORD_BIT);
    Rlwimi => "rlwimi", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::RECORD_BIT);
    Rlwnm => "rlwnm", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::RECORD_BIT);

    // Compares.
    Cmp => "cmp", OperandFlags::GPR_IN_A.union(OperandFlags::GPR_IN_B).union(OperandFlags::CR_FIELD);
    Cmpl => "cmpl", OperandFlags::GPR_IN_A.union(OperandFlags::GPR_IN_B).union(OperandFlags::CR_FIELD);
    Cmpi => "cmpi", OperandFlags::GPR_IN_A.union(OperandFlags::IMMEDIATE).union(OperandFlags::CR_FIELD);
    Cmpli => "cmpli", OperandFlags::GPR_IN_A.union(OperandFlags::IMMEDIATE).union(OperandFlags::CR_FIELD);

    // Immediate-form integer ops.
    Addi => "addi", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE);
    Addis => "addis", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE);
    Addic => "addic", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE);
    AddicDot => "addic.", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::RECORD_BIT);
    Subfic => "subfic", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE);
    Mulli => "mulli", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE);
    Ori => "ori", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE);
    Oris => "oris", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE);
    Xori => "xori", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE);
    Xoris => "xoris", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE);
    AndiDot => "andi.", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::RECORD_BIT);
    AndisDot => "andis.", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::RECORD_BIT);

    // Branches and system linkage.
    B => "b", OperandFlags::BRANCH;
    Bc => "bc", OperandFlags::BRANCH.union(OperandFlags::CR_FIELD);
    Bclr => "bclr", OperandFlags::BRANCH.union(OperandFlags::CR_FIELD);
    Bcctr => "bcctr", OperandFlags::BRANCH.union(OperandFlags::CR_FIELD);
    Sc => "sc", OperandFlags::empty();
    Rfi => "rfi", OperandFlags::empty();
    Isync => "isync", OperandFlags::empty();
    Sync => "sync", OperandFlags::empty();

    // Memory, lock-free and SPR/CR access.
    Lwz => "lwz", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Lwzu => "lwzu", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Lbz => "lbz", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Lbzu => "lbzu", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Lhz => "lhz", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Lhzu => "lhzu", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Lha => "lha", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Lhau => "lhau", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Stw => "stw", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Stwu => "stwu", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Stb => "stb", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Stbu => "stbu", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Sth => "sth", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Sthu => "sthu", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Lmw => "lmw", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Stmw => "stmw", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Lwarx => "lwarx", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::MEMORY);
    StwcxDot => "stwcx.", OperandFlags::GPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::GPR_IN_B).union(OperandFlags::MEMORY).union(OperandFlags::RECORD_BIT);
    Lfs => "lfs", OperandFlags::FPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Lfsu => "lfsu", OperandFlags::FPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Lfd => "lfd", OperandFlags::FPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Lfdu => "lfdu", OperandFlags::FPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Stfs => "stfs", OperandFlags::FPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Stfsu => "stfsu", OperandFlags::FPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Stfd => "stfd", OperandFlags::FPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Stfdu => "stfdu", OperandFlags::FPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY);
    Mtspr => "mtspr", OperandFlags::GPR_IN_A.union(OperandFlags::SPR);
    Mfspr => "mfspr", OperandFlags::GPR_OUT.union(OperandFlags::SPR);
    Mtcrf => "mtcrf", OperandFlags::GPR_IN_A.union(OperandFlags::CR_FIELD);
    Mfcr => "mfcr", OperandFlags::GPR_OUT.union(OperandFlags::CR_FIELD);
    Mtmsr => "mtmsr", OperandFlags::GPR_IN_A;
    Mfmsr => "mfmsr", OperandFlags::GPR_OUT;

    // Floating point.
    Fadd => "fadd", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT);
    Fsub => "fsub", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT);
    Fmul => "fmul", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_C).union(OperandFlags::RECORD_BIT);
    Fdiv => "fdiv", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT);
    Fmadd => "fmadd", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::FPR_IN_C).union(OperandFlags::RECORD_BIT);
    Fmsub => "fmsub", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::FPR_IN_C).union(OperandFlags::RECORD_BIT);
    Fnmadd => "fnmadd", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::FPR_IN_C).union(OperandFlags::RECORD_BIT);
    Fnmsub => "fnmsub", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::FPR_IN_C).union(OperandFlags::RECORD_BIT);
    Fsel => "fsel", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::FPR_IN_C).union(OperandFlags::RECORD_BIT);
    Frsp => "frsp", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT);
    Fctiw => "fctiw", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT);
    Fctiwz => "fctiwz", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT);
    Fneg => "fneg", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT);
    Fabs => "fabs", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT);
    Fnabs => "fnabs", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT);
    Fmr => "fmr", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT);
    Fcmpu => "fcmpu", OperandFlags::FPR_IN_A.union(OperandFlags::FPR_IN_B).union(OperandFlags::CR_FIELD);
    Fcmpo => "fcmpo", OperandFlags::FPR_IN_A.union(OperandFlags::FPR_IN_B).union(OperandFlags::CR_FIELD);
    Mffs => "mffs", OperandFlags::FPR_OUT.union(OperandFlags::RECORD_BIT);
    Mtfsf => "mtfsf", OperandFlags::FPR_IN_B.union(OperandFlags::RECORD_BIT);

    // Paired-single (Gekko/Broadway graphics extension).
    PsAdd => "ps_add", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsSub => "ps_sub", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsMul => "ps_mul", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_C).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsDiv => "ps_div", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsMadd => "ps_madd", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::FPR_IN_C).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsMsub => "ps_msub", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::FPR_IN_C).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsSum0 => "ps_sum0", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::FPR_IN_C).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsSum1 => "ps_sum1", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::FPR_IN_C).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsMuls0 => "ps_muls0", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_C).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsMuls1 => "ps_muls1", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_C).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsNeg => "ps_neg", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsAbs => "ps_abs", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsNabs => "ps_nabs", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsMr => "ps_mr", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsMerge00 => "ps_merge00", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsMerge01 => "ps_merge01", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsMerge10 => "ps_merge10", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsMerge11 => "ps_merge11", OperandFlags::FPR_OUT.union(OperandFlags::FPR_IN_A).union(OperandFlags::FPR_IN_B).union(OperandFlags::RECORD_BIT).union(OperandFlags::PAIRED_SINGLE);
    PsCmpu0 => "ps_cmpu0", OperandFlags::FPR_IN_A.union(OperandFlags::FPR_IN_B).union(OperandFlags::CR_FIELD).union(OperandFlags::PAIRED_SINGLE);
    PsCmpo0 => "ps_cmpo0", OperandFlags::FPR_IN_A.union(OperandFlags::FPR_IN_B).union(OperandFlags::CR_FIELD).union(OperandFlags::PAIRED_SINGLE);
    PsqL => "psq_l", OperandFlags::FPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY).union(OperandFlags::PAIRED_SINGLE);
    PsqLu => "psq_lu", OperandFlags::FPR_OUT.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY).union(OperandFlags::PAIRED_SINGLE);
    PsqSt => "psq_st", OperandFlags::FPR_IN_A.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY).union(OperandFlags::PAIRED_SINGLE);
    PsqStu => "psq_stu", OperandFlags::FPR_IN_A.union(OperandFlags::GPR_IN_A).union(OperandFlags::IMMEDIATE).union(OperandFlags::MEMORY).union(OperandFlags::PAIRED_SINGLE);
}

/// A decoded instruction: a stable identity plus the raw word it came from.
/// Operand values are pulled lazily via the accessors below rather than
/// eagerly unpacked into a big struct, since most callers only need one or
/// two fields for a given `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub id: InstructionId,
    pub word: u32,
}

impl Instruction {
    pub fn mnemonic(&self) -> &'static str {
        self.id.mnemonic()
    }

    pub fn operand_flags(&self) -> OperandFlags {
        self.id.operand_flags()
    }

    fn field5(&self, shift: u32) -> u8 {
        ((self.word >> shift) & 0x1F) as u8
    }

    /// Destination GPR/FPR (`RT`/`FRT`/`RS`, bits 6-10).
    pub fn rt(&self) -> u8 {
        self.field5(21)
    }

    /// First source GPR/FPR (`RA`/`FRA`, bits 11-15).
    pub fn ra(&self) -> u8 {
        self.field5(16)
    }

    /// Second source GPR/FPR (`RB`/`FRB`, bits 16-20).
    pub fn rb(&self) -> u8 {
        self.field5(11)
    }

    /// Third FPR operand for A-form float ops (`FRC`, bits 21-25).
    pub fn frc(&self) -> u8 {
        self.field5(6)
    }

    /// Sign-extended 16-bit `D`-form immediate (bits 16-31).
    pub fn simm(&self) -> i32 {
        (self.word as i16) as i32
    }

    /// Zero-extended 16-bit `D`-form immediate, for `andi.`/`ori`/`cmpli`.
    pub fn uimm(&self) -> u16 {
        (self.word & 0xFFFF) as u16
    }

    /// 24-bit sign-extended branch target displacement (`I`-form, `b`).
    pub fn li(&self) -> i32 {
        let raw = (self.word & 0x03FF_FFFC) as i32;
        (raw << 6) >> 6
    }

    /// `BO` field (bits 6-10) for conditional branches.
    pub fn bo(&self) -> u8 {
        self.field5(21)
    }

    /// `BI` field (bits 11-15) for conditional branches.
    pub fn bi(&self) -> u8 {
        self.field5(16)
    }

    /// 14-bit sign-extended branch displacement (`B`-form, `bc`).
    pub fn bd(&self) -> i32 {
        let raw = (self.word & 0x0000_FFFC) as i32;
        (raw << 16) >> 16
    }

    pub fn aa(&self) -> bool {
        self.word & 0x2 != 0
    }

    pub fn lk(&self) -> bool {
        self.word & 0x1 != 0
    }

    pub fn rc(&self) -> bool {
        self.word & 0x1 != 0
    }

    pub fn oe(&self) -> bool {
        (self.word >> 10) & 1 != 0
    }

    /// `SH` field for immediate rotate/shift forms (bits 16-20).
    pub fn sh(&self) -> u8 {
        self.field5(11)
    }

    /// `MB` field for `rlwinm`/`rlwimi` (bits 21-25).
    pub fn mb(&self) -> u8 {
        self.field5(6)
    }

    /// `ME` field for `rlwinm`/`rlwimi` (bits 26-30).
    pub fn me(&self) -> u8 {
        ((self.word >> 1) & 0x1F) as u8
    }

    /// Combined 10-bit `SPR` field (`spr_lo:spr_hi` swapped per the ISA's
    /// quirky split encoding) for `mtspr`/`mfspr`.
    pub fn spr(&self) -> u16 {
        let spr_hi = self.field5(16) as u16;
        let spr_lo = self.field5(11) as u16;
        (spr_lo << 5) | spr_hi
    }

    /// `CRM` field for `mtcrf` (bits 12-19).
    pub fn crm(&self) -> u8 {
        ((self.word >> 12) & 0xFF) as u8
    }

    /// `crfD`/`crfS` field shared by compares and `fcmp*` (bits 6-8).
    pub fn crf_d(&self) -> u8 {
        (self.rt() >> 2) & 0x7
    }

    /// `L` bit distinguishing 32-bit/64-bit compares (bit 10). Always 0 on
    /// this 32-bit-only core.
    pub fn compare_l(&self) -> bool {
        self.rt() & 0x1 != 0
    }

    /// Quantized load/store GQR index (bits 17-19, `psq_l`/`psq_st`).
    pub fn qi(&self) -> u8 {
        ((self.word >> 12) & 0x7) as u8
    }

    /// Quantized load/store width bit (bit 16, `psq_l`/`psq_st`).
    pub fn qw(&self) -> bool {
        (self.word >> 15) & 1 != 0
    }

    /// Quantized load/store 12-bit offset (bits 20-31, `psq_l`/`psq_st`).
    pub fn qd(&self) -> i16 {
        ((self.word & 0xFFF) as i16) << 4 >> 4
    }

    /// `FM` field select mask for `mtfsf` (bits 7-14).
    pub fn fm(&self) -> u8 {
        ((self.word >> 17) & 0xFF) as u8
    }
}

/// Decodes a single big-endian instruction word.
pub fn decode(word: u32) -> Result<Instruction, DecodeError> {
    let opcode = word >> 26;
    let id = match opcode {
        4 => decode_opcode4(word)?,
        7 => InstructionId::Mulli,
        8 => InstructionId::Subfic,
        10 => InstructionId::Cmpli,
        11 => InstructionId::Cmpi,
        12 => InstructionId::Addic,
        13 => InstructionId::AddicDot,
        14 => InstructionId::Addi,
        15 => InstructionId::Addis,
        16 => InstructionId::Bc,
        17 => InstructionId::Sc,
        18 => InstructionId::B,
        19 => decode_opcode19(word)?,
        20 => InstructionId::Rlwimi,
        21 => InstructionId::Rlwinm,
        23 => InstructionId::Rlwnm,
        24 => InstructionId::Ori,
        25 => InstructionId::Oris,
        26 => InstructionId::Xori,
        27 => InstructionId::Xoris,
        28 => InstructionId::AndiDot,
        29 => InstructionId::AndisDot,
        31 => decode_opcode31(word)?,
        32 => InstructionId::Lwz,
        33 => InstructionId::Lwzu,
        34 => InstructionId::Lbz,
        35 => InstructionId::Lbzu,
        36 => InstructionId::Stw,
        37 => InstructionId::Stwu,
        38 => InstructionId::Stb,
        39 => InstructionId::Stbu,
        40 => InstructionId::Lhz,
        41 => InstructionId::Lhzu,
        42 => InstructionId::Lha,
        43 => InstructionId::Lhau,
        44 => InstructionId::Sth,
        45 => InstructionId::Sthu,
        46 => InstructionId::Lmw,
        47 => InstructionId::Stmw,
        48 => InstructionId::Lfs,
        49 => InstructionId::Lfsu,
        50 => InstructionId::Lfd,
        51 => InstructionId::Lfdu,
        52 => InstructionId::Stfs,
        53 => InstructionId::Stfsu,
        54 => InstructionId::Stfd,
        55 => InstructionId::Stfdu,
        56 => InstructionId::PsqL,
        57 => InstructionId::PsqLu,
        59 => decode_opcode59(word)?,
        60 => InstructionId::PsqSt,
        61 => InstructionId::PsqStu,
        63 => decode_opcode63(word)?,
        _ => return Err(DecodeError::UnknownEncoding(word)),
    };
    Ok(Instruction { id, word })
}

fn decode_opcode31(word: u32) -> Result<InstructionId, DecodeError> {
    let xo10 = (word >> 1) & 0x3FF;
    let id = match xo10 {
        0 => InstructionId::Cmp,
        19 => InstructionId::Mfcr,
        20 => InstructionId::Lwarx,
        24 => InstructionId::Slw,
        26 => InstructionId::Cntlzw,
        28 => InstructionId::And,
        32 => InstructionId::Cmpl,
        60 => InstructionId::Andc,
        83 => InstructionId::Mfmsr,
        124 => InstructionId::Nor,
        144 => InstructionId::Mtcrf,
        146 => InstructionId::Mtmsr,
        150 => InstructionId::StwcxDot,
        284 => InstructionId::Eqv,
        316 => InstructionId::Xor,
        339 => InstructionId::Mfspr,
        412 => InstructionId::Orc,
        444 => InstructionId::Or,
        467 => InstructionId::Mtspr,
        476 => InstructionId::Nand,
        536 => InstructionId::Srw,
        598 => InstructionId::Sync,
        792 => InstructionId::Sraw,
        824 => InstructionId::Srawi,
        922 => InstructionId::Extsh,
        954 => InstructionId::Extsb,
        _ => {
            let oe_form_xo9 = xo10 & 0x1FF;
            match oe_form_xo9 {
                8 => InstructionId::Subfc,
                10 => InstructionId::Addc,
                40 => InstructionId::Subf,
                104 => InstructionId::Neg,
                136 => InstructionId::Subfe,
                138 => InstructionId::Adde,
                235 => InstructionId::Mullw,
                266 => InstructionId::Add,
                459 => InstructionId::Divwu,
                491 => InstructionId::Divw,
                _ => return Err(DecodeError::UnknownEncoding(word)),
            }
        }
    };
    Ok(id)
}

fn decode_opcode19(word: u32) -> Result<InstructionId, DecodeError> {
    let xo10 = (word >> 1) & 0x3FF;
    let id = match xo10 {
        16 => InstructionId::Bclr,
        50 => InstructionId::Rfi,
        150 => InstructionId::Isync,
        528 => InstructionId::Bcctr,
        _ => return Err(DecodeError::UnknownEncoding(word)),
    };
    Ok(id)
}

fn decode_opcode4(word: u32) -> Result<InstructionId, DecodeError> {
    let xo10 = (word >> 1) & 0x3FF;
    if let Some(id) = match xo10 {
        0 => Some(InstructionId::PsCmpu0),
        32 => Some(InstructionId::PsCmpo0),
        40 => Some(InstructionId::PsNeg),
        72 => Some(InstructionId::PsMr),
        136 => Some(InstructionId::PsNabs),
        264 => Some(InstructionId::PsAbs),
        528 => Some(InstructionId::PsMerge00),
        560 => Some(InstructionId::PsMerge01),
        592 => Some(InstructionId::PsMerge10),
        624 => Some(InstructionId::PsMerge11),
        _ => None,
    } {
        return Ok(id);
    }
    let xo5 = (word >> 1) & 0x1F;
    let id = match xo5 {
        10 => InstructionId::PsSum0,
        11 => InstructionId::PsSum1,
        12 => InstructionId::PsMuls0,
        13 => InstructionId::PsMuls1,
        18 => InstructionId::PsDiv,
        20 => InstructionId::PsSub,
        21 => InstructionId::PsAdd,
        25 => InstructionId::PsMul,
        28 => InstructionId::PsMsub,
        29 => InstructionId::PsMadd,
        _ => return Err(DecodeError::UnknownEncoding(word)),
    };
    Ok(id)
}

/// Single-precision float ops (`lfs`-adjacent primary opcode 59).
fn decode_opcode59(word: u32) -> Result<InstructionId, DecodeError> {
    let xo5 = (word >> 1) & 0x1F;
    let id = match xo5 {
        18 => InstructionId::Fdiv,
        20 => InstructionId::Fsub,
        21 => InstructionId::Fadd,
        25 => InstructionId::Fmul,
        28 => InstructionId::Fmsub,
        29 => InstructionId::Fmadd,
        30 => InstructionId::Fnmsub,
        31 => InstructionId::Fnmadd,
        _ => return Err(DecodeError::UnknownEncoding(word)),
    };
    Ok(id)
}

/// Double-precision float ops (primary opcode 63): A-form arithmetic plus
/// an X-form block of unary/compare/control ops sharing the same opcode.
fn decode_opcode63(word: u32) -> Result<InstructionId, DecodeError> {
    let xo10 = (word >> 1) & 0x3FF;
    if let Some(id) = match xo10 {
        0 => Some(InstructionId::Fcmpu),
        12 => Some(InstructionId::Frsp),
        14 => Some(InstructionId::Fctiw),
        15 => Some(InstructionId::Fctiwz),
        32 => Some(InstructionId::Fcmpo),
        40 => Some(InstructionId::Fneg),
        72 => Some(InstructionId::Fmr),
        136 => Some(InstructionId::Fnabs),
        264 => Some(InstructionId::Fabs),
        583 => Some(InstructionId::Mffs),
        711 => Some(InstructionId::Mtfsf),
        _ => None,
    } {
        return Ok(id);
    }
    let xo5 = xo10 & 0x1F;
    let id = match xo5 {
        18 => InstructionId::Fdiv,
        20 => InstructionId::Fsub,
        21 => InstructionId::Fadd,
        23 => InstructionId::Fsel,
        25 => InstructionId::Fmul,
        28 => InstructionId::Fmsub,
        29 => InstructionId::Fmadd,
        30 => InstructionId::Fnmsub,
        31 => InstructionId::Fnmadd,
        _ => return Err(DecodeError::UnknownEncoding(word)),
    };
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d_form(opcode: u32, rt: u32, ra: u32, imm: u16) -> u32 {
        (opcode << 26) | (rt << 21) | (ra << 16) | (imm as u32)
    }

    fn x_form(opcode: u32, rt: u32, ra: u32, rb: u32, xo: u32, rc: bool) -> u32 {
        (opcode << 26) | (rt << 21) | (ra << 16) | (rb << 11) | (xo << 1) | (rc as u32)
    }

    fn xo_form(opcode: u32, rt: u32, ra: u32, rb: u32, oe: bool, xo9: u32, rc: bool) -> u32 {
        (opcode << 26)
            | (rt << 21)
            | (ra << 16)
            | (rb << 11)
            | ((oe as u32) << 10)
            | (xo9 << 1)
            | (rc as u32)
    }

    #[test]
    fn decodes_addi() {
        let word = d_form(14, 3, 4, 0x1234);
        let inst = decode(word).unwrap();
        assert_eq!(inst.id, InstructionId::Addi);
        assert_eq!(inst.rt(), 3);
        assert_eq!(inst.ra(), 4);
        assert_eq!(inst.simm(), 0x1234);
    }

    #[test]
    fn decodes_negative_simm() {
        let word = d_form(14, 3, 4, 0xFFFF);
        let inst = decode(word).unwrap();
        assert_eq!(inst.simm(), -1);
    }

    #[test]
    fn decodes_add_with_oe_and_rc() {
        let word = xo_form(31, 3, 4, 5, true, 266, true);
        let inst = decode(word).unwrap();
        assert_eq!(inst.id, InstructionId::Add);
        assert!(inst.oe());
        assert!(inst.rc());
        assert_eq!(inst.rt(), 3);
        assert_eq!(inst.ra(), 4);
        assert_eq!(inst.rb(), 5);
    }

    #[test]
    fn decodes_add_without_oe() {
        let word = xo_form(31, 3, 4, 5, false, 266, false);
        let inst = decode(word).unwrap();
        assert_eq!(inst.id, InstructionId::Add);
        assert!(!inst.oe());
        assert!(!inst.rc());
    }

    #[test]
    fn decodes_logical_or() {
        let word = x_form(31, 6, 7, 8, 444, false);
        let inst = decode(word).unwrap();
        assert_eq!(inst.id, InstructionId::Or);
    }

    #[test]
    fn decodes_branch_unconditional() {
        // b with LI=0x100, AA=0, LK=1.
        let word = (18u32 << 26) | (0x100 << 2) | 1;
        let inst = decode(word).unwrap();
        assert_eq!(inst.id, InstructionId::B);
        assert_eq!(inst.li(), 0x100);
        assert!(inst.lk());
        assert!(!inst.aa());
    }

    #[test]
    fn decodes_branch_conditional() {
        let word = (16u32 << 26) | (12 << 21) | (2 << 16) | (0x40 << 2);
        let inst = decode(word).unwrap();
        assert_eq!(inst.id, InstructionId::Bc);
        assert_eq!(inst.bo(), 12);
        assert_eq!(inst.bi(), 2);
        assert_eq!(inst.bd(), 0x40);
    }

    #[test]
    fn decodes_mtspr_lr() {
        // LR (spr 8): encoded split as spr_lo in bits 16-20, spr_hi in 11-15.
        let spr = 8u32;
        let spr_lo = spr & 0x1F;
        let spr_hi = spr >> 5;
        let word = x_form(31, 3, spr_lo, spr_hi, 467, false);
        let inst = decode(word).unwrap();
        assert_eq!(inst.id, InstructionId::Mtspr);
        assert_eq!(inst.spr(), 8);
    }

    #[test]
    fn decodes_rlwinm_fields() {
        let sh = 4u32;
        let mb = 2u32;
        let me = 29u32;
        let word = (21u32 << 26) | (3 << 21) | (4 << 16) | (sh << 11) | (mb << 6) | (me << 1);
        let inst = decode(word).unwrap();
        assert_eq!(inst.id, InstructionId::Rlwinm);
        assert_eq!(inst.sh(), 4);
        assert_eq!(inst.mb(), 2);
        assert_eq!(inst.me(), 29);
    }

    #[test]
    fn decodes_fadd_double() {
        let word = (63u32 << 26) | (1 << 21) | (2 << 16) | (3 << 11) | (21 << 1);
        let inst = decode(word).unwrap();
        assert_eq!(inst.id, InstructionId::Fadd);
    }

    #[test]
    fn decodes_fmr_unary() {
        let word = x_form(63, 1, 0, 3, 72, false);
        let inst = decode(word).unwrap();
        assert_eq!(inst.id, InstructionId::Fmr);
    }

    #[test]
    fn decodes_ps_add() {
        let word = (4u32 << 26) | (1 << 21) | (2 << 16) | (3 << 11) | (21 << 1);
        let inst = decode(word).unwrap();
        assert_eq!(inst.id, InstructionId::PsAdd);
    }

    #[test]
    fn decodes_psq_l_fields() {
        // psq_l: opcode 56, RT, RA, W (bit16), I (bits17-19), D (bits20-31).
        let word = (56u32 << 26) | (1 << 21) | (2 << 16) | (1 << 15) | (5 << 12) | 0x20;
        let inst = decode(word).unwrap();
        assert_eq!(inst.id, InstructionId::PsqL);
        assert!(inst.qw());
        assert_eq!(inst.qi(), 5);
    }

    #[test]
    fn unknown_encoding_is_reported() {
        // Primary opcode 2 is not defined.
        let word = 2u32 << 26;
        assert_eq!(decode(word), Err(DecodeError::UnknownEncoding(word)));
    }

    #[test]
    fn stwcx_requires_reserved_xo_and_is_always_record_form() {
        let word = x_form(31, 3, 4, 5, 150, true);
        let inst = decode(word).unwrap();
        assert_eq!(inst.id, InstructionId::StwcxDot);
        assert!(inst.operand_flags().contains(OperandFlags::RECORD_BIT));
    }

    proptest::proptest! {
        #[test]
        fn addi_roundtrips_any_fields(rt in 0u32..32, ra in 0u32..32, imm in 0u16..=u16::MAX) {
            let word = d_form(14, rt, ra, imm);
            let inst = decode(word).unwrap();
            proptest::prop_assert_eq!(inst.id, InstructionId::Addi);
            proptest::prop_assert_eq!(inst.rt(), rt as u8);
            proptest::prop_assert_eq!(inst.ra(), ra as u8);
            proptest::prop_assert_eq!(inst.uimm(), imm);
        }

        #[test]
        fn add_roundtrips_any_fields(rt in 0u32..32, ra in 0u32..32, rb in 0u32..32, oe in proptest::bool::ANY, rc in proptest::bool::ANY) {
            let word = xo_form(31, rt, ra, rb, oe, 266, rc);
            let inst = decode(word).unwrap();
            proptest::prop_assert_eq!(inst.id, InstructionId::Add);
            proptest::prop_assert_eq!(inst.rt(), rt as u8);
            proptest::prop_assert_eq!(inst.ra(), ra as u8);
            proptest::prop_assert_eq!(inst.rb(), rb as u8);
            proptest::prop_assert_eq!(inst.oe(), oe);
            proptest::prop_assert_eq!(inst.rc(), rc);
        }
    }
}
