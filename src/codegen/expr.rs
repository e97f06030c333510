// src/codegen/expr.rs
//
// Expression lowering: the ExprVisitor implementation over Cg. Each
// node becomes backend IR in the current block; control flow uses
// block parameters as merge phis, and code after a branch or return is
// emitted into fresh unreferenced blocks the backend discards.

use cranelift::codegen::ir::BlockArg;
use cranelift::prelude::*;
use cranelift_module::Module;
use smallvec::SmallVec;

use crate::arena::{Arena, BranchTargetId, ExprId};
use crate::ast::dispatch::{ExprVisitor, SwitchParts, dispatch};
use crate::ast::expr::{
    BinaryOp, CallKind, CastOp, CmpOp, Literal, LoadOp, UnaryOp, VarScope,
};
use crate::ast::types::{FunctionType, TypeId};
use crate::errors::CodegenError;

use super::context::{BranchContext, Cg, backend_type};

type LowerResult = Result<Option<Value>, CodegenError>;

impl Cg<'_, '_, '_> {
    /// Lower an expression in a typed context.
    pub fn expr(&mut self, id: ExprId, ty: TypeId) -> LowerResult {
        dispatch(self, id, ty)
    }

    /// Lower an expression that must yield a value.
    fn value(&mut self, id: ExprId, ty: TypeId) -> Result<Value, CodegenError> {
        Ok(self
            .expr(id, ty)?
            .expect("non-void expression yields a value"))
    }

    fn backend_type(&self, ty: TypeId) -> Type {
        backend_type(ty)
    }

    /// A typed zero, used as the never-observed result of code that
    /// follows a branch or return.
    fn zero_value(&mut self, ty: TypeId) -> Option<Value> {
        match ty {
            TypeId::Void | TypeId::None => None,
            TypeId::F32 => Some(self.builder.ins().f32const(0.0f32)),
            TypeId::F64 => Some(self.builder.ins().f64const(0.0f64)),
            _ => {
                let cl_ty = self.backend_type(ty);
                Some(self.builder.ins().iconst(cl_ty, 0))
            }
        }
    }

    /// Continue emission in a block nothing jumps to; the backend
    /// discards it.
    fn switch_to_dead_block(&mut self) {
        let dead = self.builder.create_block();
        self.builder.switch_to_block(dead);
    }

    fn jump_with(&mut self, block: Block, value: Option<Value>) {
        match value {
            Some(value) => {
                let arg = BlockArg::from(value);
                self.builder.ins().jump(block, &[arg]);
            }
            None => {
                self.builder.ins().jump(block, &[]);
            }
        }
    }

    /// Create a merge block carrying the result of a control-flow
    /// construct as a block parameter.
    fn merge_block(&mut self, ty: TypeId) -> Block {
        let block = self.builder.create_block();
        if ty != TypeId::Void {
            let cl_ty = self.backend_type(ty);
            self.builder.append_block_param(block, cl_ty);
        }
        block
    }

    fn merge_result(&mut self, block: Block, ty: TypeId) -> Option<Value> {
        if ty == TypeId::Void {
            None
        } else {
            Some(self.builder.block_params(block)[0])
        }
    }

    /// Compute the sandboxed host address for a guest byte index. A
    /// 32-bit index is zero-extended to 64 bits *before* masking;
    /// sign extension would let a negative offset escape the sandbox.
    fn compile_address(&mut self, address: ExprId, far: bool) -> Result<Value, CodegenError> {
        let byte_index = if far {
            self.value(address, TypeId::I64)?
        } else {
            let index32 = self.value(address, TypeId::I32)?;
            self.builder.ins().uextend(types::I64, index32)
        };
        let masked = self.builder.ins().band_imm(byte_index, self.ctx.memory_mask);
        let base = self.builder.ins().iconst(types::I64, self.ctx.memory_base);
        Ok(self.builder.ins().iadd(base, masked))
    }

    fn lower_call(
        &mut self,
        func_ref: cranelift::codegen::ir::FuncRef,
        ty: &FunctionType,
        args: (u32, u32),
    ) -> LowerResult {
        let arg_ids: SmallVec<[ExprId; 8]> =
            self.ctx.ast.arena.args(args.0, args.1).iter().copied().collect();
        let mut arg_values: SmallVec<[Value; 8]> = SmallVec::new();
        for (&arg, &param_ty) in arg_ids.iter().zip(&ty.parameters) {
            arg_values.push(self.value(arg, param_ty)?);
        }
        let call = self.builder.ins().call(func_ref, &arg_values);
        if ty.return_type == TypeId::Void {
            Ok(None)
        } else {
            Ok(Some(self.builder.inst_results(call)[0]))
        }
    }
}

impl ExprVisitor for Cg<'_, '_, '_> {
    type Output = LowerResult;

    fn arena(&self) -> &Arena {
        &self.ctx.ast.arena
    }

    fn visit_literal(&mut self, _ty: TypeId, lit: Literal) -> LowerResult {
        let value = match lit {
            Literal::I8(v) => self.builder.ins().iconst(types::I8, v as i64),
            Literal::I16(v) => self.builder.ins().iconst(types::I16, v as i64),
            Literal::I32(v) => self.builder.ins().iconst(types::I32, v as i64),
            Literal::I64(v) => self.builder.ins().iconst(types::I64, v as i64),
            Literal::F32(v) => self.builder.ins().f32const(v),
            Literal::F64(v) => self.builder.ins().f64const(v),
            Literal::Bool(v) => self.builder.ins().iconst(types::I8, v as i64),
        };
        Ok(Some(value))
    }

    fn visit_get_variable(&mut self, _ty: TypeId, scope: VarScope, index: usize) -> LowerResult {
        match scope {
            VarScope::Local => Ok(Some(self.builder.use_var(self.locals[index]))),
            VarScope::Global => {
                let global_ty = self.ctx.ast.globals[index].ty;
                let cl_ty = self.backend_type(global_ty);
                let gv = self
                    .ctx
                    .module
                    .declare_data_in_func(self.ctx.global_ids[index], self.builder.func);
                let addr = self.builder.ins().global_value(self.ctx.pointer_type, gv);
                let value = self.builder.ins().load(cl_ty, MemFlags::trusted(), addr, 0);
                Ok(Some(value))
            }
        }
    }

    fn visit_set_variable(&mut self, scope: VarScope, index: usize, value: ExprId) -> LowerResult {
        match scope {
            VarScope::Local => {
                let local_ty = self.function().locals[index].ty;
                let value = self.value(value, local_ty)?;
                self.builder.def_var(self.locals[index], value);
            }
            VarScope::Global => {
                let global_ty = self.ctx.ast.globals[index].ty;
                let value = self.value(value, global_ty)?;
                let gv = self
                    .ctx
                    .module
                    .declare_data_in_func(self.ctx.global_ids[index], self.builder.func);
                let addr = self.builder.ins().global_value(self.ctx.pointer_type, gv);
                self.builder.ins().store(MemFlags::trusted(), value, addr, 0);
            }
        }
        Ok(None)
    }

    fn visit_load(
        &mut self,
        ty: TypeId,
        memory_type: TypeId,
        load_op: LoadOp,
        far: bool,
        address: ExprId,
    ) -> LowerResult {
        let addr = self.compile_address(address, far)?;
        let memory_cl = self.backend_type(memory_type);
        let loaded = self.builder.ins().load(memory_cl, MemFlags::new(), addr, 0);
        let result_cl = self.backend_type(ty);
        let value = match load_op {
            LoadOp::Plain => {
                if result_cl == memory_cl {
                    loaded
                } else if ty.is_int() && result_cl.bits() < memory_cl.bits() {
                    self.builder.ins().ireduce(result_cl, loaded)
                } else {
                    loaded
                }
            }
            LoadOp::ZeroExtend => self.builder.ins().uextend(result_cl, loaded),
            LoadOp::SignExtend => self.builder.ins().sextend(result_cl, loaded),
        };
        Ok(Some(value))
    }

    fn visit_store(
        &mut self,
        memory_type: TypeId,
        value_type: TypeId,
        far: bool,
        address: ExprId,
        value: ExprId,
    ) -> LowerResult {
        let addr = self.compile_address(address, far)?;
        let value = self.value(value, value_type)?;
        // Wider values narrow to the memory type.
        let memory_value = if value_type != memory_type {
            let memory_cl = self.backend_type(memory_type);
            self.builder.ins().ireduce(memory_cl, value)
        } else {
            value
        };
        self.builder.ins().store(MemFlags::new(), memory_value, addr, 0);
        Ok(None)
    }

    fn visit_call(
        &mut self,
        _ty: TypeId,
        kind: CallKind,
        index: usize,
        args: (u32, u32),
    ) -> LowerResult {
        let (func_id, fn_ty) = match kind {
            CallKind::Direct => (
                self.ctx.function_ids[index],
                self.ctx.ast.functions[index].ty.clone(),
            ),
            CallKind::Import => (
                self.ctx.import_ids[index],
                self.ctx.ast.function_imports[index].ty.clone(),
            ),
        };
        let func_ref = self
            .ctx
            .module
            .declare_func_in_func(func_id, self.builder.func);
        self.lower_call(func_ref, &fn_ty, args)
    }

    fn visit_call_indirect(
        &mut self,
        _ty: TypeId,
        table_index: usize,
        index_expr: ExprId,
        args: (u32, u32),
    ) -> LowerResult {
        let table = &self.ctx.ast.function_tables[table_index];
        let num_functions = table.function_indices.len();
        debug_assert!(num_functions.is_power_of_two());
        let table_ty = table.ty.clone();
        let first_function = table.function_indices[0];

        // Mask the index into the table; the size is a power of two,
        // so out-of-range indices wrap instead of escaping.
        let index = self.value(index_expr, TypeId::I32)?;
        let masked = self.builder.ins().band_imm(index, num_functions as i64 - 1);
        let wide = self.builder.ins().uextend(self.ctx.pointer_type, masked);
        let scaled = self
            .builder
            .ins()
            .imul_imm(wide, self.ctx.pointer_type.bytes() as i64);

        let gv = self
            .ctx
            .module
            .declare_data_in_func(self.ctx.table_ids[table_index], self.builder.func);
        let table_addr = self.builder.ins().global_value(self.ctx.pointer_type, gv);
        let slot = self.builder.ins().iadd(table_addr, scaled);
        let func_ptr = self
            .builder
            .ins()
            .load(self.ctx.pointer_type, MemFlags::trusted(), slot, 0);

        // Optional guard against spoofed function pointers: a nonzero
        // prefix word substitutes a known-safe function of the table's
        // type.
        let callee = if self.ctx.prefix_check {
            let prefix = self.builder.ins().load(types::I32, MemFlags::new(), func_ptr, -4);
            let is_clean = self.builder.ins().icmp_imm(IntCC::Equal, prefix, 0);
            let safe_ref = self
                .ctx
                .module
                .declare_func_in_func(self.ctx.function_ids[first_function], self.builder.func);
            let safe_addr = self.builder.ins().func_addr(self.ctx.pointer_type, safe_ref);
            self.builder.ins().select(is_clean, func_ptr, safe_addr)
        } else {
            func_ptr
        };

        let sig = self.ctx.make_signature(&table_ty);
        let sig_ref = self.builder.import_signature(sig);

        let arg_ids: SmallVec<[ExprId; 8]> =
            self.ctx.ast.arena.args(args.0, args.1).iter().copied().collect();
        let mut arg_values: SmallVec<[Value; 8]> = SmallVec::new();
        for (&arg, &param_ty) in arg_ids.iter().zip(&table_ty.parameters) {
            arg_values.push(self.value(arg, param_ty)?);
        }
        let call = self.builder.ins().call_indirect(sig_ref, callee, &arg_values);
        if table_ty.return_type == TypeId::Void {
            Ok(None)
        } else {
            Ok(Some(self.builder.inst_results(call)[0]))
        }
    }

    fn visit_unary(&mut self, ty: TypeId, op: UnaryOp, operand: ExprId) -> LowerResult {
        let operand = self.value(operand, ty)?;
        Ok(Some(self.lower_unary(op, operand)))
    }

    fn visit_binary(&mut self, ty: TypeId, op: BinaryOp, left: ExprId, right: ExprId) -> LowerResult {
        let left = self.value(left, ty)?;
        let right = self.value(right, ty)?;
        Ok(Some(self.lower_binary(op, ty, left, right)))
    }

    fn visit_cast(
        &mut self,
        ty: TypeId,
        op: CastOp,
        source_type: TypeId,
        source: ExprId,
    ) -> LowerResult {
        let source = self.value(source, source_type)?;
        let dest = self.backend_type(ty);
        Ok(Some(self.lower_cast(op, dest, source)))
    }

    fn visit_comparison(
        &mut self,
        op: CmpOp,
        operand_type: TypeId,
        left: ExprId,
        right: ExprId,
    ) -> LowerResult {
        let left = self.value(left, operand_type)?;
        let right = self.value(right, operand_type)?;
        Ok(Some(self.lower_comparison(op, operand_type, left, right)))
    }

    fn visit_if_else(
        &mut self,
        ty: TypeId,
        condition: ExprId,
        then_expr: ExprId,
        else_expr: ExprId,
    ) -> LowerResult {
        let condition = self.value(condition, TypeId::Bool)?;

        let then_block = self.builder.create_block();
        let else_block = self.builder.create_block();
        let merge_block = self.merge_block(ty);

        self.builder
            .ins()
            .brif(condition, then_block, &[], else_block, &[]);

        self.builder.switch_to_block(then_block);
        let then_value = self.expr(then_expr, ty)?;
        self.jump_with(merge_block, then_value);

        self.builder.switch_to_block(else_block);
        let else_value = self.expr(else_expr, ty)?;
        self.jump_with(merge_block, else_value);

        self.builder.switch_to_block(merge_block);
        Ok(self.merge_result(merge_block, ty))
    }

    fn visit_switch(&mut self, ty: TypeId, parts: SwitchParts) -> LowerResult {
        let key = self.value(parts.key, parts.key_type)?;

        let arms: Vec<_> = self
            .ctx
            .ast
            .arena
            .arms(parts.arms_start, parts.arms_len)
            .to_vec();

        // Arm blocks are created up front so fallthrough can forward
        // reference the next arm.
        let arm_blocks: Vec<Block> = arms.iter().map(|_| self.builder.create_block()).collect();
        let successor = self.merge_block(ty);

        self.branch_stack.push(BranchContext {
            target: parts.end_target,
            block: successor,
        });

        // Dispatch: compare the key against each non-default arm key
        // by unsigned equality, else fall to the default arm.
        let default_block = arm_blocks[parts.default_arm_index as usize];
        let non_default: Vec<usize> = (0..arms.len())
            .filter(|&i| i as u32 != parts.default_arm_index)
            .collect();
        if non_default.is_empty() {
            self.builder.ins().jump(default_block, &[]);
        }
        for (chain_index, &arm_index) in non_default.iter().enumerate() {
            let key_imm = match parts.key_type {
                TypeId::I8 => arms[arm_index].key as u8 as i8 as i64,
                TypeId::I16 => arms[arm_index].key as u16 as i16 as i64,
                TypeId::I32 => arms[arm_index].key as u32 as i32 as i64,
                _ => arms[arm_index].key as i64,
            };
            let matches = self.builder.ins().icmp_imm(IntCC::Equal, key, key_imm);
            if chain_index + 1 < non_default.len() {
                let next_test = self.builder.create_block();
                self.builder
                    .ins()
                    .brif(matches, arm_blocks[arm_index], &[], next_test, &[]);
                self.builder.switch_to_block(next_test);
            } else {
                self.builder
                    .ins()
                    .brif(matches, arm_blocks[arm_index], &[], default_block, &[]);
            }
        }

        // Lower the arms. The final arm carries the switch's value;
        // the others yield void and fall through to the next arm.
        for (arm_index, arm) in arms.iter().enumerate() {
            self.builder.switch_to_block(arm_blocks[arm_index]);
            if arm_index + 1 == arms.len() {
                let value = self.expr(arm.value, ty)?;
                self.jump_with(successor, value);
            } else {
                self.expr(arm.value, TypeId::Void)?;
                self.builder.ins().jump(arm_blocks[arm_index + 1], &[]);
            }
        }

        self.branch_stack.pop();

        self.builder.switch_to_block(successor);
        Ok(self.merge_result(successor, ty))
    }

    fn visit_label(&mut self, ty: TypeId, end_target: BranchTargetId, body: ExprId) -> LowerResult {
        let label_block = self.builder.create_block();
        let successor = self.merge_block(ty);

        self.builder.ins().jump(label_block, &[]);
        self.builder.switch_to_block(label_block);

        self.branch_stack.push(BranchContext {
            target: end_target,
            block: successor,
        });
        let value = self.expr(body, ty)?;
        self.branch_stack.pop();

        self.jump_with(successor, value);
        self.builder.switch_to_block(successor);
        Ok(self.merge_result(successor, ty))
    }

    fn visit_loop(
        &mut self,
        ty: TypeId,
        body: ExprId,
        break_target: BranchTargetId,
        continue_target: BranchTargetId,
    ) -> LowerResult {
        let loop_block = self.builder.create_block();
        let successor = self.merge_block(ty);

        self.branch_stack.push(BranchContext {
            target: continue_target,
            block: loop_block,
        });
        self.branch_stack.push(BranchContext {
            target: break_target,
            block: successor,
        });

        self.builder.ins().jump(loop_block, &[]);
        self.builder.switch_to_block(loop_block);
        self.expr(body, TypeId::Void)?;
        self.builder.ins().jump(loop_block, &[]);

        self.branch_stack.pop();
        self.branch_stack.pop();

        self.builder.switch_to_block(successor);
        Ok(self.merge_result(successor, ty))
    }

    fn visit_sequence(&mut self, ty: TypeId, void_expr: ExprId, result_expr: ExprId) -> LowerResult {
        self.expr(void_expr, TypeId::Void)?;
        self.expr(result_expr, ty)
    }

    fn visit_branch(
        &mut self,
        ty: TypeId,
        target: BranchTargetId,
        value: Option<ExprId>,
    ) -> LowerResult {
        // Branch targets match by identity against the in-scope chain.
        let Some(dest) = self.find_branch_context(target) else {
            return Err(CodegenError::Declare(
                "branch target is not in scope".to_string(),
            ));
        };

        let target_type = self.ctx.ast.arena.target_type(target);
        let branch_value = match value {
            Some(value) if target_type != TypeId::Void => Some(self.value(value, target_type)?),
            _ => None,
        };

        self.jump_with(dest, branch_value);
        self.switch_to_dead_block();
        Ok(self.zero_value(ty))
    }

    fn visit_return(&mut self, ty: TypeId, value: Option<ExprId>) -> LowerResult {
        let return_type = self.function().ty.return_type;
        match value {
            Some(value) if return_type != TypeId::Void => {
                let value = self.value(value, return_type)?;
                self.builder.ins().return_(&[value]);
            }
            _ => {
                self.builder.ins().return_(&[]);
            }
        }
        self.switch_to_dead_block();
        Ok(self.zero_value(ty))
    }

    fn visit_nop(&mut self) -> LowerResult {
        Ok(None)
    }

    fn visit_discard_result(&mut self, expr_type: TypeId, expr: ExprId) -> LowerResult {
        self.expr(expr, expr_type)?;
        Ok(None)
    }

    fn visit_error(&mut self, _ty: TypeId, message: &str) -> LowerResult {
        Err(CodegenError::ErrorNode(message.to_string()))
    }
}
