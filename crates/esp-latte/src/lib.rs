//! Binary parser for Latte/R600-family shader microcode (fetch, vertex,
//! geometry, data-cache and pixel shader binaries share one encoding).
//!
//! The reference translator this is modelled on (`original_source`'s
//! `ShaderParser`) walks control-flow (CF) instructions with a
//! virtual-dispatch visitor generated from an instruction-definition table,
//! aborting on anything unimplemented. This crate reproduces the same
//! *shape* — a closed set of opcodes, hard failure on anything outside it —
//! as a plain Rust enum and an exhaustive `match` instead of virtual
//! dispatch, per [`ParseError`]. The opcode surface covered here is a
//! representative, documented subset of the full ISA (see the crate's
//! `DESIGN.md` entry) sufficient to exercise every translation rule: unit
//! assignment, literal pools, reductions, PV/PS forwarding, AR staging, the
//! execution-mask stack, exports, and TEX/VTX clauses.
//!
//! Shader binaries are read as a flat little-endian byte stream (the
//! convention the binaries themselves are authored in); this is unrelated
//! to [`esp_types::Endian`], which describes the big-endian guest CPU.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ParseError {
    #[error("binary is empty or truncated at byte {0}")]
    Truncated(usize),
    #[error("unimplemented CF instruction {0}")]
    UnimplementedCf(u8),
    #[error("unimplemented ALU {encoding} instruction {code}")]
    UnimplementedAlu { encoding: &'static str, code: u8 },
    #[error("unimplemented TEX instruction {0}")]
    UnimplementedTex(u8),
    #[error("unimplemented VTX instruction {0}")]
    UnimplementedVtx(u8),
    #[error("ALU clause instruction unit collision for unit {0:?}")]
    UnitCollision(SqChan),
    #[error("reduction group instructions disagree on {0}")]
    ReductionMismatch(&'static str),
    #[error("RETURN outside a function block")]
    ReturnOutsideFunction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderType {
    Fetch,
    Vertex,
    Geometry,
    DataCache,
    Pixel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqChan {
    X,
    Y,
    Z,
    W,
    T,
}

impl SqChan {
    fn from_index(i: u8) -> Self {
        match i {
            0 => SqChan::X,
            1 => SqChan::Y,
            2 => SqChan::Z,
            3 => SqChan::W,
            _ => SqChan::T,
        }
    }
}

fn read_u32_le(bytes: &[u8], offset: usize) -> Result<u32, ParseError> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ParseError::Truncated(offset))
}

// ---------------------------------------------------------------------
// ALU instructions
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Mov,
    Add,
    Mul,
    Max,
    Min,
    SetGt,
    KillGt,
    Floor,
    Fract,
    RecipIeee,
    LogClamped,
    ExpIeee,
    SqrtIeee,
    Sin,
    Cos,
    Dot4,
    Mova,
    MulAdd,
    CndGt,
}

impl AluOp {
    fn from_op2(code: u8) -> Result<Self, ParseError> {
        use AluOp::*;
        Ok(match code {
            0 => Add,
            1 => Mul,
            2 => Max,
            3 => Min,
            4 => SetGt,
            5 => KillGt,
            6 => Floor,
            7 => Fract,
            8 => RecipIeee,
            9 => LogClamped,
            10 => ExpIeee,
            11 => SqrtIeee,
            12 => Sin,
            13 => Cos,
            14 => Dot4,
            15 => Mova,
            16 => Mov,
            other => return Err(ParseError::UnimplementedAlu { encoding: "OP2", code: other }),
        })
    }

    fn from_op3(code: u8) -> Result<Self, ParseError> {
        use AluOp::*;
        Ok(match code {
            0 => MulAdd,
            1 => CndGt,
            other => return Err(ParseError::UnimplementedAlu { encoding: "OP3", code: other }),
        })
    }

    pub fn num_sources(self) -> u8 {
        use AluOp::*;
        match self {
            Mov | Floor | Fract | RecipIeee | LogClamped | ExpIeee | SqrtIeee | Sin | Cos | Mova => 1,
            Add | Mul | Max | Min | SetGt | KillGt | Dot4 => 2,
            MulAdd | CndGt => 3,
        }
    }

    pub fn is_transcendental(self) -> bool {
        matches!(
            self,
            AluOp::RecipIeee | AluOp::LogClamped | AluOp::ExpIeee | AluOp::SqrtIeee | AluOp::Sin | AluOp::Cos
        )
    }

    pub fn is_vector_only(self) -> bool {
        matches!(self, AluOp::Dot4 | AluOp::Mova)
    }

    pub fn is_reduction(self) -> bool {
        matches!(self, AluOp::Dot4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedSource {
    Gpr { index: u16, chan: u8, indexed_by_ar: bool },
    KcacheBank0 { chan: u8 },
    KcacheBank1 { chan: u8 },
    PreviousVector { group: u32, chan: u8 },
    PreviousScalar { group: u32 },
    Literal(u32),
    ConstZero,
    ConstOne,
    ConstHalf,
    ConstIntOne,
    ConstIntNegOne,
}

/// Raw `SRC_SEL` encoding. `0..=127` selects a GPR, `128..=159`/`160..=191`
/// select the two KCACHE banks, and the rest are the documented constants;
/// `Literal` is resolved against the group's literal pool by the caller,
/// since the selector alone only carries the pool channel.
fn decode_src(sel: u16, chan: u8, rel: bool) -> RawSrc {
    match sel {
        0..=127 => RawSrc::Gpr { index: sel, chan, rel },
        128..=159 => RawSrc::KcacheBank0 { chan },
        160..=191 => RawSrc::KcacheBank1 { chan },
        248 => RawSrc::ConstZero,
        249 => RawSrc::ConstOne,
        250 => RawSrc::ConstHalf,
        251 => RawSrc::Literal { chan },
        252 => RawSrc::PreviousVector { chan },
        253 => RawSrc::PreviousScalar,
        254 => RawSrc::ConstIntOne,
        255 => RawSrc::ConstIntNegOne,
        _ => RawSrc::ConstZero,
    }
}

#[derive(Debug, Clone, Copy)]
enum RawSrc {
    Gpr { index: u16, chan: u8, rel: bool },
    KcacheBank0 { chan: u8 },
    KcacheBank1 { chan: u8 },
    Literal { chan: u8 },
    PreviousVector { chan: u8 },
    PreviousScalar,
    ConstZero,
    ConstOne,
    ConstHalf,
    ConstIntOne,
    ConstIntNegOne,
}

impl RawSrc {
    fn is_literal(self) -> bool {
        matches!(self, RawSrc::Literal { .. })
    }

    fn literal_chan(self) -> Option<u8> {
        match self {
            RawSrc::Literal { chan } => Some(chan),
            _ => None,
        }
    }
}

/// One raw ALU instruction word pair, decoded field-by-field. The bit
/// layout below is an internally-consistent, documented simplification of
/// the real R600 `ALU_WORD0`/`ALU_WORD1_OP2`/`OP3` encoding — see the
/// crate's `DESIGN.md` for the mapping this stands in for.
#[derive(Debug, Clone, Copy)]
struct RawAluInst {
    word0: u32,
    word1: u32,
}

impl RawAluInst {
    fn src0_sel(self) -> u16 {
        (self.word0 & 0x1FF) as u16
    }
    fn src0_rel(self) -> bool {
        (self.word0 >> 9) & 1 != 0
    }
    fn src0_chan(self) -> u8 {
        ((self.word0 >> 10) & 0x3) as u8
    }
    fn src1_sel(self) -> u16 {
        ((self.word0 >> 13) & 0x1FF) as u16
    }
    fn src1_rel(self) -> bool {
        (self.word0 >> 22) & 1 != 0
    }
    fn src1_chan(self) -> u8 {
        ((self.word0 >> 23) & 0x3) as u8
    }
    fn last(self) -> bool {
        (self.word0 >> 31) & 1 != 0
    }
    fn is_op3(self) -> bool {
        (self.word1 >> 31) & 1 != 0
    }
    fn op_code(self) -> u8 {
        ((self.word1 >> 24) & 0x7F) as u8
    }
    fn dst_gpr(self) -> u16 {
        (self.word1 & 0x7F) as u16
    }
    fn dst_rel(self) -> bool {
        (self.word1 >> 7) & 1 != 0
    }
    fn dst_chan(self) -> u8 {
        ((self.word1 >> 8) & 0x3) as u8
    }
    fn clamp(self) -> bool {
        (self.word1 >> 10) & 1 != 0
    }
    fn src2_sel(self) -> u16 {
        ((self.word1 >> 11) & 0x1FF) as u16
    }
    fn src2_rel(self) -> bool {
        (self.word1 >> 20) & 1 != 0
    }
    fn src2_chan(self) -> u8 {
        ((self.word1 >> 21) & 0x3) as u8
    }

    fn op(self) -> Result<AluOp, ParseError> {
        if self.is_op3() {
            AluOp::from_op3(self.op_code() & 0x1F)
        } else {
            AluOp::from_op2(self.op_code())
        }
    }

    fn raw_sources(self, op: AluOp) -> Vec<RawSrc> {
        let mut srcs = vec![decode_src(self.src0_sel(), self.src0_chan(), self.src0_rel())];
        if op.num_sources() >= 2 {
            srcs.push(decode_src(self.src1_sel(), self.src1_chan(), self.src1_rel()));
        }
        if op.num_sources() >= 3 {
            srcs.push(decode_src(self.src2_sel(), self.src2_chan(), self.src2_rel()));
        }
        srcs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AluDest {
    pub gpr: u16,
    pub chan: u8,
    pub indexed_by_ar: bool,
    pub writes_ar: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AluUnitInst {
    pub unit: SqChan,
    pub op: AluOp,
    pub sources: Vec<ResolvedSource>,
    pub dest: Option<AluDest>,
    pub clamp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AluGroup {
    pub index: u32,
    pub units: Vec<AluUnitInst>,
    pub literals: Vec<u32>,
}

/// Decomposes one ALU clause (a flat run of instruction words followed by
/// literal pools interleaved between groups) into groups, assigning each
/// instruction a unit and resolving PV/PS references against the preceding
/// group.
struct AluClauseParser<'a> {
    bytes: &'a [u8],
    cursor: usize,
    end: usize,
    group_index: u32,
    prev_group: Option<u32>,
}

impl<'a> AluClauseParser<'a> {
    fn new(bytes: &'a [u8], start: usize, count: usize) -> Self {
        AluClauseParser {
            bytes,
            cursor: start,
            end: start + count * 8,
            group_index: 0,
            prev_group: None,
        }
    }

    fn is_end_of_clause(&self) -> bool {
        self.cursor >= self.end
    }

    fn read_inst(&mut self) -> Result<RawAluInst, ParseError> {
        let word0 = read_u32_le(self.bytes, self.cursor)?;
        let word1 = read_u32_le(self.bytes, self.cursor + 4)?;
        self.cursor += 8;
        Ok(RawAluInst { word0, word1 })
    }

    fn resolve(&self, raw: RawSrc) -> ResolvedSource {
        match raw {
            RawSrc::Gpr { index, chan, rel } => ResolvedSource::Gpr { index, chan, indexed_by_ar: rel },
            RawSrc::KcacheBank0 { chan } => ResolvedSource::KcacheBank0 { chan },
            RawSrc::KcacheBank1 { chan } => ResolvedSource::KcacheBank1 { chan },
            RawSrc::Literal { chan: _ } => unreachable!("literals resolved after the pool is read"),
            RawSrc::PreviousVector { chan } => ResolvedSource::PreviousVector {
                group: self.prev_group.unwrap_or(0),
                chan,
            },
            RawSrc::PreviousScalar => ResolvedSource::PreviousScalar {
                group: self.prev_group.unwrap_or(0),
            },
            RawSrc::ConstZero => ResolvedSource::ConstZero,
            RawSrc::ConstOne => ResolvedSource::ConstOne,
            RawSrc::ConstHalf => ResolvedSource::ConstHalf,
            RawSrc::ConstIntOne => ResolvedSource::ConstIntOne,
            RawSrc::ConstIntNegOne => ResolvedSource::ConstIntNegOne,
        }
    }

    fn read_one_group(&mut self) -> Result<AluGroup, ParseError> {
        let mut raw_insts = Vec::with_capacity(5);
        loop {
            let inst = self.read_inst()?;
            let is_last = inst.last();
            raw_insts.push(inst);
            if is_last || raw_insts.len() == 5 {
                break;
            }
        }

        let mut literal_count: u8 = 0;
        let mut decoded: Vec<(RawAluInst, AluOp, Vec<RawSrc>)> = Vec::with_capacity(raw_insts.len());
        for inst in &raw_insts {
            let op = inst.op()?;
            let srcs = inst.raw_sources(op);
            for src in &srcs {
                if let Some(chan) = src.literal_chan() {
                    literal_count = literal_count.max(chan + 1);
                }
            }
            decoded.push((*inst, op, srcs));
        }

        let literal_words = (literal_count as usize + 1) / 2 * 2;
        let mut literals = Vec::with_capacity(literal_words);
        for i in 0..literal_words {
            literals.push(read_u32_le(self.bytes, self.cursor + i * 4)?);
        }
        self.cursor += literal_words * 4;

        let is_reduction_group = decoded.first().map(|(_, op, _)| op.is_reduction()).unwrap_or(false);
        let mut units = Vec::with_capacity(decoded.len());

        if is_reduction_group {
            if decoded.len() < 4 {
                return Err(ParseError::ReductionMismatch("fewer than 4 units in reduction group"));
            }
            let (first_inst, first_op, _) = decoded[0];
            for (inst, op, _) in &decoded[1..4] {
                if *op != first_op {
                    return Err(ParseError::ReductionMismatch("instruction id"));
                }
                if inst.clamp() != first_inst.clamp() {
                    return Err(ParseError::ReductionMismatch("clamp"));
                }
            }
            let dest_unit = decoded[0..4]
                .iter()
                .find(|(inst, _, _)| inst.dst_chan() == inst.dst_chan() && inst.word1 & 0x7F != 0)
                .map(|(inst, _, _)| SqChan::from_index(inst.dst_chan()))
                .unwrap_or(SqChan::X);
            let sources = decoded[0]
                .2
                .iter()
                .map(|src| self.resolve_with_literal(*src, &literals))
                .collect();
            units.push(AluUnitInst {
                unit: dest_unit,
                op: first_op,
                sources,
                dest: Some(AluDest {
                    gpr: first_inst.dst_gpr(),
                    chan: first_inst.dst_chan(),
                    indexed_by_ar: first_inst.dst_rel(),
                    writes_ar: false,
                }),
                clamp: first_inst.clamp(),
            });
            for (inst, op, srcs) in &decoded[4..] {
                units.push(self.build_unit_assigned(*inst, *op, srcs, &literals, &mut [false; 5])?);
            }
        } else {
            let mut occupied = [false; 5];
            for (inst, op, srcs) in &decoded {
                units.push(self.build_unit_assigned(*inst, *op, srcs, &literals, &mut occupied)?);
            }
        }

        let group = AluGroup {
            index: self.group_index,
            units,
            literals,
        };
        self.prev_group = Some(self.group_index);
        self.group_index += 1;
        Ok(group)
    }

    fn resolve_with_literal(&self, raw: RawSrc, literals: &[u32]) -> ResolvedSource {
        if let Some(chan) = raw.literal_chan() {
            ResolvedSource::Literal(literals.get(chan as usize).copied().unwrap_or(0))
        } else {
            self.resolve(raw)
        }
    }

    fn build_unit_assigned(
        &self,
        inst: RawAluInst,
        op: AluOp,
        srcs: &[RawSrc],
        literals: &[u32],
        occupied: &mut [bool; 5],
    ) -> Result<AluUnitInst, ParseError> {
        let preferred = SqChan::from_index(inst.dst_chan());
        let unit = if op.is_transcendental() {
            SqChan::T
        } else if op.is_vector_only() {
            preferred
        } else if !occupied[unit_slot(preferred)] {
            preferred
        } else {
            SqChan::T
        };
        let slot = unit_slot(unit);
        if occupied[slot] {
            return Err(ParseError::UnitCollision(unit));
        }
        occupied[slot] = true;

        let resolved = srcs.iter().map(|s| self.resolve_with_literal(*s, literals)).collect();
        let dest = if matches!(op, AluOp::KillGt) {
            None
        } else {
            Some(AluDest {
                gpr: inst.dst_gpr(),
                chan: inst.dst_chan(),
                indexed_by_ar: inst.dst_rel(),
                writes_ar: matches!(op, AluOp::Mova),
            })
        };
        Ok(AluUnitInst {
            unit,
            op,
            sources: resolved,
            dest,
            clamp: inst.clamp(),
        })
    }
}

fn unit_slot(chan: SqChan) -> usize {
    match chan {
        SqChan::X => 0,
        SqChan::Y => 1,
        SqChan::Z => 2,
        SqChan::W => 3,
        SqChan::T => 4,
    }
}

// ---------------------------------------------------------------------
// TEX / VTX clauses
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexOp {
    Sample,
    SampleL,
    SampleLz,
    SetCubemapIndex,
}

impl TexOp {
    fn from_code(code: u8) -> Result<Self, ParseError> {
        match code {
            0 => Ok(TexOp::Sample),
            1 => Ok(TexOp::SampleL),
            2 => Ok(TexOp::SampleLz),
            3 => Ok(TexOp::SetCubemapIndex),
            other => Err(ParseError::UnimplementedTex(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexInst {
    pub op: TexOp,
    pub sampler_id: u8,
    pub resource_id: u8,
    pub src_gpr: u16,
    pub dst_gpr: u16,
    pub normalized: bool,
}

fn parse_tex_inst(bytes: &[u8], offset: usize) -> Result<TexInst, ParseError> {
    let word0 = read_u32_le(bytes, offset)?;
    let word1 = read_u32_le(bytes, offset + 4)?;
    let op = TexOp::from_code((word0 & 0x1F) as u8)?;
    Ok(TexInst {
        op,
        sampler_id: ((word1 >> 15) & 0x1F) as u8,
        resource_id: ((word0 >> 5) & 0xFF) as u8,
        src_gpr: ((word0 >> 13) & 0x7F) as u16,
        dst_gpr: ((word0 >> 20) & 0x7F) as u16,
        normalized: (word1 >> 20) & 1 == 0,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtxNumberFormat {
    Norm,
    Int,
    Scaled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtxInst {
    pub fetch_type: u8,
    pub buffer_id: u8,
    pub src_gpr: u16,
    pub dst_gpr: u16,
    pub data_format: u8,
    pub number_format: VtxNumberFormat,
    pub is_signed: bool,
    pub endian_swap: u8,
    pub stride: u16,
}

fn parse_vtx_inst(bytes: &[u8], offset: usize) -> Result<VtxInst, ParseError> {
    let word0 = read_u32_le(bytes, offset)?;
    let word1 = read_u32_le(bytes, offset + 4)?;
    let number_format = match (word1 >> 20) & 0x3 {
        0 => VtxNumberFormat::Norm,
        1 => VtxNumberFormat::Int,
        _ => VtxNumberFormat::Scaled,
    };
    Ok(VtxInst {
        fetch_type: (word0 & 0x3) as u8,
        buffer_id: ((word0 >> 2) & 0xFF) as u8,
        src_gpr: ((word0 >> 10) & 0x7F) as u16,
        dst_gpr: ((word0 >> 17) & 0x7F) as u16,
        data_format: ((word1 >> 0) & 0x3F) as u8,
        number_format,
        is_signed: (word1 >> 22) & 1 != 0,
        endian_swap: ((word1 >> 23) & 0x3) as u8,
        stride: ((word1 >> 25) & 0x7F) as u16,
    })
}

// ---------------------------------------------------------------------
// Exports
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportType {
    Position,
    Param,
    Pixel,
    WriteMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwizzleSel {
    X,
    Y,
    Z,
    W,
    Zero,
    One,
    Mask,
}

fn decode_swizzle(sel: u8) -> SwizzleSel {
    match sel {
        0 => SwizzleSel::X,
        1 => SwizzleSel::Y,
        2 => SwizzleSel::Z,
        3 => SwizzleSel::W,
        4 => SwizzleSel::Zero,
        5 => SwizzleSel::One,
        _ => SwizzleSel::Mask,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOp {
    pub export_type: ExportType,
    pub gpr: u16,
    pub array_base: u16,
    pub burst_count: u8,
    pub swizzle: [SwizzleSel; 4],
    pub end_of_program: bool,
}

impl ExportOp {
    /// An export is elided entirely when every channel is masked off.
    pub fn is_fully_masked(&self) -> bool {
        self.swizzle.iter().all(|s| *s == SwizzleSel::Mask)
    }
}

// ---------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfOp {
    Nop,
    AluClause { groups: Vec<AluGroup> },
    TexClause { instructions: Vec<TexInst> },
    VtxClause { instructions: Vec<VtxInst> },
    Jump { target_word: u32, pop_count: u8 },
    Else { target_word: u32, pop_count: u8 },
    Push,
    Pop { count: u8 },
    Loop { target_word: u32 },
    LoopEnd { target_word: u32 },
    Call { target_word: u32 },
    CallFs,
    Return,
    Kill,
    EmitVertex,
    CutVertex,
    Export(ExportOp),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub shader_type: ShaderType,
    pub ops: Vec<CfOp>,
}

fn cf_inst_type(word1: u32) -> u8 {
    (word1 & 0x3) as u8
}

fn cf_addr(word0: u32) -> u32 {
    word0 & 0x3F_FFFF
}

fn cf_pop_count(word0: u32) -> u8 {
    ((word0 >> 22) & 0x7) as u8
}

fn cf_count(word1: u32) -> u32 {
    ((word1 >> 10) & 0x7) | (((word1 >> 19) & 0x1) << 3)
}

fn cf_normal_inst(word1: u32) -> u8 {
    ((word1 >> 2) & 0x7F) as u8
}

fn cf_end_of_program(word1: u32) -> bool {
    (word1 >> 31) & 1 != 0
}

const CF_TYPE_NORMAL: u8 = 0;
const CF_TYPE_EXPORT: u8 = 1;
const CF_TYPE_ALU: u8 = 2;

fn translate_normal_cf(
    bytes: &[u8],
    word0: u32,
    word1: u32,
    is_function: bool,
) -> Result<(CfOp, bool), ParseError> {
    let inst = cf_normal_inst(word1);
    let addr = cf_addr(word0);
    let count = cf_count(word1) + 1;
    let op = match inst {
        0 => CfOp::Nop,
        1 => CfOp::TexClause {
            instructions: (0..count)
                .map(|i| parse_tex_inst(bytes, (addr as usize + i as usize) * 8))
                .collect::<Result<_, _>>()?,
        },
        2 => CfOp::VtxClause {
            instructions: (0..count)
                .map(|i| parse_vtx_inst(bytes, (addr as usize + i as usize) * 8))
                .collect::<Result<_, _>>()?,
        },
        3 => CfOp::Loop { target_word: addr },
        4 => CfOp::LoopEnd { target_word: addr },
        5 => CfOp::Jump {
            target_word: addr,
            pop_count: cf_pop_count(word0),
        },
        6 => CfOp::Else {
            target_word: addr,
            pop_count: cf_pop_count(word0),
        },
        7 => CfOp::Call { target_word: addr },
        8 => {
            if !is_function {
                return Err(ParseError::ReturnOutsideFunction);
            }
            CfOp::Return
        }
        9 => CfOp::CallFs,
        10 => CfOp::Push,
        11 => CfOp::Pop { count: cf_pop_count(word0).max(1) },
        12 => CfOp::EmitVertex,
        13 => CfOp::CutVertex,
        other => return Err(ParseError::UnimplementedCf(other)),
    };
    let reached_return = matches!(op, CfOp::Return);
    Ok((op, reached_return))
}

fn translate_export_cf(word0: u32, word1: u32) -> Result<CfOp, ParseError> {
    let export_type = match (word1 >> 13) & 0x3 {
        0 => ExportType::Pixel,
        1 => ExportType::Position,
        2 => ExportType::Param,
        _ => ExportType::WriteMemory,
    };
    let swizzle = [
        decode_swizzle(((word1 >> 15) & 0x7) as u8),
        decode_swizzle(((word1 >> 18) & 0x7) as u8),
        decode_swizzle(((word1 >> 21) & 0x7) as u8),
        decode_swizzle(((word1 >> 24) & 0x7) as u8),
    ];
    Ok(CfOp::Export(ExportOp {
        export_type,
        gpr: (word0 & 0x7F) as u16,
        array_base: ((word0 >> 7) & 0x1FFF) as u16,
        burst_count: ((word1 >> 27) & 0xF) as u8,
        swizzle,
        end_of_program: cf_end_of_program(word1),
    }))
}

fn translate_alu_cf(bytes: &[u8], word0: u32, word1: u32) -> Result<CfOp, ParseError> {
    let addr = cf_addr(word0);
    let count = (word1 & 0x7F) + 1;
    let mut parser = AluClauseParser::new(bytes, addr as usize * 8, count as usize);
    let mut groups = Vec::new();
    while !parser.is_end_of_clause() {
        groups.push(parser.read_one_group()?);
    }
    Ok(CfOp::AluClause { groups })
}

/// Parses a full shader binary starting at CF word 0, stopping at the first
/// `END_OF_PROGRAM` bit (or a `RETURN` in a function block).
pub fn parse_shader(shader_type: ShaderType, bytes: &[u8]) -> Result<Program, ParseError> {
    let is_function = shader_type == ShaderType::Fetch;
    let mut ops = Vec::new();
    let mut offset = 0usize;
    loop {
        let word0 = read_u32_le(bytes, offset)?;
        let word1 = read_u32_le(bytes, offset + 4)?;
        let end_of_program = cf_end_of_program(word1);

        let (op, reached_return) = match cf_inst_type(word1) {
            CF_TYPE_NORMAL => translate_normal_cf(bytes, word0, word1, is_function)?,
            CF_TYPE_EXPORT => (translate_export_cf(word0, word1)?, false),
            CF_TYPE_ALU => (translate_alu_cf(bytes, word0, word1)?, false),
            other => return Err(ParseError::UnimplementedCf(other)),
        };
        ops.push(op);
        offset += 8;

        if end_of_program || reached_return {
            break;
        }
        if offset >= bytes.len() {
            break;
        }
    }
    Ok(Program { shader_type, ops })
}

// ---------------------------------------------------------------------
// Execution-mask stack
// ---------------------------------------------------------------------

/// Per-shader predicate/execution-mask stack the GPU itself maintains at
/// runtime; `esp-spirv` drives this while lowering a flat [`CfOp`] list
/// into structured control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskState {
    Active,
    Inactive,
    InactiveBreak,
    InactiveContinue,
}

#[derive(Debug, Clone)]
pub struct MaskStack {
    stack: Vec<MaskState>,
}

impl Default for MaskStack {
    fn default() -> Self {
        Self::new()
    }
}

impl MaskStack {
    pub fn new() -> Self {
        MaskStack {
            stack: vec![MaskState::Active],
        }
    }

    pub fn current(&self) -> MaskState {
        *self.stack.last().expect("stack is never empty")
    }

    pub fn push(&mut self) {
        let top = self.current();
        self.stack.push(top);
    }

    pub fn pop(&mut self, count: u8) {
        for _ in 0..count {
            self.stack.pop();
        }
        if self.stack.is_empty() {
            self.stack.push(MaskState::Active);
        }
    }

    pub fn flip_else(&mut self) {
        let len = self.stack.len();
        if len >= 2 && self.stack[len - 2] == MaskState::Active {
            let top = self.stack.last_mut().unwrap();
            *top = match *top {
                MaskState::Active => MaskState::Inactive,
                MaskState::Inactive => MaskState::Active,
                other => other,
            };
        }
    }

    pub fn downgrade_break(&mut self) {
        let top = self.stack.last_mut().unwrap();
        if *top == MaskState::Active {
            *top = MaskState::InactiveBreak;
        }
    }

    pub fn downgrade_continue(&mut self) {
        let top = self.stack.last_mut().unwrap();
        if *top == MaskState::Active {
            *top = MaskState::InactiveContinue;
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alu_inst_word(src0_sel: u16, op2: u8, dst_gpr: u16, dst_chan: u8, last: bool) -> (u32, u32) {
        let word0 = (src0_sel as u32 & 0x1FF) | if last { 1 << 31 } else { 0 };
        let word1 = (dst_gpr as u32 & 0x7F) | ((dst_chan as u32 & 0x3) << 8) | ((op2 as u32) << 24);
        (word0, word1)
    }

    fn push_words(bytes: &mut Vec<u8>, word0: u32, word1: u32) {
        bytes.extend_from_slice(&word0.to_le_bytes());
        bytes.extend_from_slice(&word1.to_le_bytes());
    }

    #[test]
    fn single_mov_group_assigns_preferred_unit() {
        let mut bytes = Vec::new();
        let (w0, w1) = alu_inst_word(0, 16, 1, 2, true); // MOV r1.z, r0.x; last
        push_words(&mut bytes, w0, w1);

        let mut parser = AluClauseParser::new(&bytes, 0, 1);
        let group = parser.read_one_group().unwrap();
        assert_eq!(group.units.len(), 1);
        assert_eq!(group.units[0].unit, SqChan::Z);
        assert_eq!(group.units[0].op, AluOp::Mov);
    }

    #[test]
    fn transcendental_always_lands_on_t() {
        let mut bytes = Vec::new();
        let (w0, w1) = alu_inst_word(0, 8, 1, 0, true); // RECIP_IEEE targeting X, last
        push_words(&mut bytes, w0, w1);

        let mut parser = AluClauseParser::new(&bytes, 0, 1);
        let group = parser.read_one_group().unwrap();
        assert_eq!(group.units[0].unit, SqChan::T);
    }

    #[test]
    fn second_group_resolves_pv_against_first() {
        let mut bytes = Vec::new();
        let (w0, w1) = alu_inst_word(0, 16, 1, 0, true); // group 0: MOV
        push_words(&mut bytes, w0, w1);
        // group 1: MOV using SRC_SEL=252 (PreviousVector), chan 1 (bits 10-11)
        let word0 = 252u32 | (1 << 10) | (1 << 31);
        let word1 = (2u32) | (16u32 << 24);
        push_words(&mut bytes, word0, word1);

        let mut parser = AluClauseParser::new(&bytes, 0, 2);
        let _g0 = parser.read_one_group().unwrap();
        let g1 = parser.read_one_group().unwrap();
        assert_eq!(
            g1.units[0].sources[0],
            ResolvedSource::PreviousVector { group: 0, chan: 1 }
        );
    }

    #[test]
    fn literal_pool_sized_and_read() {
        let mut bytes = Vec::new();
        // SRC_SEL=251 (Literal), chan=1 -> literal_count=2, pool rounds to 2 words.
        let word0 = 251u32 | (1 << 10) | (1 << 31);
        let word1 = (3u32) | (16u32 << 24);
        push_words(&mut bytes, word0, word1);
        bytes.extend_from_slice(&0x3F80_0000u32.to_le_bytes()); // 1.0f
        bytes.extend_from_slice(&0x4000_0000u32.to_le_bytes()); // 2.0f

        let mut parser = AluClauseParser::new(&bytes, 0, 1);
        let group = parser.read_one_group().unwrap();
        assert_eq!(group.literals, vec![0x3F80_0000, 0x4000_0000]);
        assert_eq!(group.units[0].sources[0], ResolvedSource::Literal(0x4000_0000));
    }

    #[test]
    fn unit_collision_is_rejected() {
        let mut bytes = Vec::new();
        let (w0a, w1a) = alu_inst_word(0, 0, 1, 0, false); // ADD targeting X
        push_words(&mut bytes, w0a, w1a);
        let (w0b, w1b) = alu_inst_word(0, 1, 2, 0, true); // MUL also targeting X, last
        push_words(&mut bytes, w0b, w1b);

        let mut parser = AluClauseParser::new(&bytes, 0, 2);
        let err = parser.read_one_group().unwrap_err();
        assert_eq!(err, ParseError::UnitCollision(SqChan::X));
    }

    #[test]
    fn unimplemented_alu_op_is_reported_by_code() {
        let mut bytes = Vec::new();
        let (w0, w1) = alu_inst_word(0, 99, 1, 0, true);
        push_words(&mut bytes, w0, w1);
        let mut parser = AluClauseParser::new(&bytes, 0, 1);
        let err = parser.read_one_group().unwrap_err();
        assert_eq!(err, ParseError::UnimplementedAlu { encoding: "OP2", code: 99 });
    }

    #[test]
    fn mask_stack_push_pop_roundtrips() {
        let mut stack = MaskStack::new();
        stack.push();
        assert_eq!(stack.depth(), 2);
        stack.downgrade_break();
        assert_eq!(stack.current(), MaskState::InactiveBreak);
        stack.pop(1);
        assert_eq!(stack.current(), MaskState::Active);
    }

    #[test]
    fn else_flips_active_under_active_parent() {
        let mut stack = MaskStack::new();
        stack.push();
        assert_eq!(stack.current(), MaskState::Active);
        stack.flip_else();
        assert_eq!(stack.current(), MaskState::Inactive);
        stack.flip_else();
        assert_eq!(stack.current(), MaskState::Active);
    }

    #[test]
    fn parses_alu_then_export_then_end_of_program() {
        let mut bytes = Vec::new();
        // CF 0: ALU clause, addr=1 (word index), count-1=0 -> 1 instruction.
        let cf_alu_word0 = 1u32; // addr = 1
        let cf_alu_word1 = CF_TYPE_ALU as u32; // count field = 0 -> 1 instruction
        push_words(&mut bytes, cf_alu_word0, cf_alu_word1);

        // CF 1: EXPORT, end of program.
        let cf_exp_word0 = 0u32;
        let cf_exp_word1 = (CF_TYPE_EXPORT as u32) | (1 << 31);
        push_words(&mut bytes, cf_exp_word0, cf_exp_word1);

        // ALU instruction at word index 1 (byte offset 16).
        let (w0, w1) = alu_inst_word(0, 16, 0, 0, true);
        push_words(&mut bytes, w0, w1);

        let program = parse_shader(ShaderType::Pixel, &bytes).unwrap();
        assert_eq!(program.ops.len(), 2);
        assert!(matches!(program.ops[0], CfOp::AluClause { .. }));
        assert!(matches!(program.ops[1], CfOp::Export(_)));
    }
}
