// src/codegen/ops.rs
//
// Scalar operator lowering - impl Cg methods. Operands are already
// lowered; each table entry is one or two backend instructions.

use cranelift::prelude::*;
use cranelift_module::Module;

use crate::ast::expr::{
    BinaryOp, BoolBinaryOp, BoolUnaryOp, CastOp, CmpOp, FloatBinaryOp, FloatUnaryOp, IntBinaryOp,
    IntUnaryOp, UnaryOp,
};
use crate::ast::types::TypeId;

use super::context::Cg;

impl Cg<'_, '_, '_> {
    pub(super) fn lower_unary(&mut self, op: UnaryOp, operand: Value) -> Value {
        match op {
            UnaryOp::Int(op) => match op {
                IntUnaryOp::Neg => self.builder.ins().ineg(operand),
                IntUnaryOp::Abs => self.int_abs(operand),
                IntUnaryOp::BitwiseNot => self.builder.ins().bnot(operand),
                IntUnaryOp::Clz => self.builder.ins().clz(operand),
                IntUnaryOp::Ctz => self.builder.ins().ctz(operand),
                IntUnaryOp::Popcnt => self.builder.ins().popcnt(operand),
            },
            UnaryOp::Float(op) => match op {
                FloatUnaryOp::Neg => self.builder.ins().fneg(operand),
                FloatUnaryOp::Abs => self.builder.ins().fabs(operand),
                FloatUnaryOp::Ceil => self.builder.ins().ceil(operand),
                FloatUnaryOp::Floor => self.builder.ins().floor(operand),
                FloatUnaryOp::Trunc => self.builder.ins().trunc(operand),
                FloatUnaryOp::NearestInt => self.builder.ins().nearest(operand),
                FloatUnaryOp::Sqrt => self.builder.ins().sqrt(operand),
            },
            // Booleans are 0/1 bytes; flip only the low bit.
            UnaryOp::Bool(BoolUnaryOp::BitwiseNot) => self.builder.ins().bxor_imm(operand, 1),
        }
    }

    /// Sign-mask integer abs: (x + (x >> bits-1)) ^ (x >> bits-1).
    fn int_abs(&mut self, operand: Value) -> Value {
        let ty = self.builder.func.dfg.value_type(operand);
        let mask = self.builder.ins().sshr_imm(operand, ty.bits() as i64 - 1);
        let sum = self.builder.ins().iadd(operand, mask);
        self.builder.ins().bxor(sum, mask)
    }

    pub(super) fn lower_binary(&mut self, op: BinaryOp, ty: TypeId, left: Value, right: Value) -> Value {
        match op {
            BinaryOp::Int(op) => match op {
                IntBinaryOp::Add => self.builder.ins().iadd(left, right),
                IntBinaryOp::Sub => self.builder.ins().isub(left, right),
                IntBinaryOp::Mul => self.builder.ins().imul(left, right),
                IntBinaryOp::DivS => self.builder.ins().sdiv(left, right),
                IntBinaryOp::DivU => self.builder.ins().udiv(left, right),
                IntBinaryOp::RemS => self.builder.ins().srem(left, right),
                IntBinaryOp::RemU => self.builder.ins().urem(left, right),
                IntBinaryOp::BitwiseAnd => self.builder.ins().band(left, right),
                IntBinaryOp::BitwiseOr => self.builder.ins().bor(left, right),
                IntBinaryOp::BitwiseXor => self.builder.ins().bxor(left, right),
                IntBinaryOp::Shl => self.builder.ins().ishl(left, right),
                IntBinaryOp::ShrSExt => self.builder.ins().sshr(left, right),
                IntBinaryOp::ShrZExt => self.builder.ins().ushr(left, right),
            },
            BinaryOp::Float(op) => match op {
                FloatBinaryOp::Add => self.builder.ins().fadd(left, right),
                FloatBinaryOp::Sub => self.builder.ins().fsub(left, right),
                FloatBinaryOp::Mul => self.builder.ins().fmul(left, right),
                FloatBinaryOp::Div => self.builder.ins().fdiv(left, right),
                FloatBinaryOp::Rem => self.lower_frem(ty, left, right),
                FloatBinaryOp::Min => self.builder.ins().fmin(left, right),
                FloatBinaryOp::Max => self.builder.ins().fmax(left, right),
                FloatBinaryOp::CopySign => self.builder.ins().fcopysign(left, right),
            },
            BinaryOp::Bool(op) => match op {
                BoolBinaryOp::BitwiseAnd => self.builder.ins().band(left, right),
                BoolBinaryOp::BitwiseOr => self.builder.ins().bor(left, right),
            },
        }
    }

    /// The backend has no float remainder; call the runtime helper.
    fn lower_frem(&mut self, ty: TypeId, left: Value, right: Value) -> Value {
        let helper = if ty == TypeId::F32 {
            self.ctx.fremf_id
        } else {
            self.ctx.frem_id
        };
        let func_ref = self
            .ctx
            .module
            .declare_func_in_func(helper, self.builder.func);
        let call = self.builder.ins().call(func_ref, &[left, right]);
        self.builder.inst_results(call)[0]
    }

    pub(super) fn lower_cast(&mut self, op: CastOp, dest: Type, source: Value) -> Value {
        match op {
            CastOp::Wrap => self.builder.ins().ireduce(dest, source),
            CastOp::SExt => self.builder.ins().sextend(dest, source),
            CastOp::ZExt => self.builder.ins().uextend(dest, source),
            CastOp::TruncSignedFloat => self.builder.ins().fcvt_to_sint(dest, source),
            CastOp::TruncUnsignedFloat => self.builder.ins().fcvt_to_uint(dest, source),
            CastOp::ConvertSignedInt => self.builder.ins().fcvt_from_sint(dest, source),
            CastOp::ConvertUnsignedInt => self.builder.ins().fcvt_from_uint(dest, source),
            CastOp::Promote => self.builder.ins().fpromote(dest, source),
            CastOp::Demote => self.builder.ins().fdemote(dest, source),
            CastOp::ReinterpretInt | CastOp::ReinterpretFloat => {
                self.builder.ins().bitcast(dest, MemFlags::new(), source)
            }
            CastOp::ReinterpretBool => {
                // Bool is a 0/1 byte; widening it is zero-extension.
                if dest == types::I8 {
                    source
                } else {
                    self.builder.ins().uextend(dest, source)
                }
            }
        }
    }

    pub(super) fn lower_comparison(
        &mut self,
        op: CmpOp,
        operand_type: TypeId,
        left: Value,
        right: Value,
    ) -> Value {
        if operand_type.is_float() {
            // Unordered comparisons: a NaN operand answers like the
            // original backend did.
            let cc = match op {
                CmpOp::Eq => FloatCC::UnorderedOrEqual,
                CmpOp::Ne => FloatCC::NotEqual,
                CmpOp::Lt => FloatCC::UnorderedOrLessThan,
                CmpOp::Le => FloatCC::UnorderedOrLessThanOrEqual,
                CmpOp::Gt => FloatCC::UnorderedOrGreaterThan,
                CmpOp::Ge => FloatCC::UnorderedOrGreaterThanOrEqual,
                _ => unreachable!("signed/unsigned comparison on floats"),
            };
            self.builder.ins().fcmp(cc, left, right)
        } else {
            let cc = match op {
                CmpOp::Eq => IntCC::Equal,
                CmpOp::Ne => IntCC::NotEqual,
                CmpOp::LtS => IntCC::SignedLessThan,
                CmpOp::LtU => IntCC::UnsignedLessThan,
                CmpOp::LeS => IntCC::SignedLessThanOrEqual,
                CmpOp::LeU => IntCC::UnsignedLessThanOrEqual,
                CmpOp::GtS => IntCC::SignedGreaterThan,
                CmpOp::GtU => IntCC::UnsignedGreaterThan,
                CmpOp::GeS => IntCC::SignedGreaterThanOrEqual,
                CmpOp::GeU => IntCC::UnsignedGreaterThanOrEqual,
                _ => unreachable!("ordered float comparison on integers"),
            };
            self.builder.ins().icmp(cc, left, right)
        }
    }
}
