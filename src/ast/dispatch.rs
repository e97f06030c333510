// src/ast/dispatch.rs
//
// The dispatcher over (type class, opcode). `ExprVisitor` requires one
// method per node variant and `dispatch` matches every variant, so a
// visitor that misses a case refuses to compile. This is what lets the
// code generator be a structural fold over the tree.

use crate::arena::{Arena, BranchTargetId, ExprId};
use crate::ast::expr::{
    BinaryOp, CallKind, CastOp, CmpOp, Expr, Literal, LoadOp, UnaryOp, VarScope,
};
use crate::ast::types::{TypeClass, TypeId};

/// Fields of a `Switch` node handed to the visitor in one piece.
#[derive(Debug, Clone, Copy)]
pub struct SwitchParts {
    pub key: ExprId,
    pub key_type: TypeId,
    pub arms_start: u32,
    pub arms_len: u32,
    pub default_arm_index: u32,
    pub end_target: BranchTargetId,
}

pub trait ExprVisitor {
    type Output;

    /// The arena the visited expressions live in.
    fn arena(&self) -> &Arena;

    fn visit_literal(&mut self, ty: TypeId, lit: Literal) -> Self::Output;
    fn visit_get_variable(&mut self, ty: TypeId, scope: VarScope, index: usize) -> Self::Output;
    fn visit_set_variable(&mut self, scope: VarScope, index: usize, value: ExprId) -> Self::Output;
    fn visit_load(
        &mut self,
        ty: TypeId,
        memory_type: TypeId,
        load_op: LoadOp,
        far: bool,
        address: ExprId,
    ) -> Self::Output;
    fn visit_store(
        &mut self,
        memory_type: TypeId,
        value_type: TypeId,
        far: bool,
        address: ExprId,
        value: ExprId,
    ) -> Self::Output;
    fn visit_call(
        &mut self,
        ty: TypeId,
        kind: CallKind,
        index: usize,
        args: (u32, u32),
    ) -> Self::Output;
    fn visit_call_indirect(
        &mut self,
        ty: TypeId,
        table_index: usize,
        index_expr: ExprId,
        args: (u32, u32),
    ) -> Self::Output;
    fn visit_unary(&mut self, ty: TypeId, op: UnaryOp, operand: ExprId) -> Self::Output;
    fn visit_binary(&mut self, ty: TypeId, op: BinaryOp, left: ExprId, right: ExprId)
    -> Self::Output;
    fn visit_cast(
        &mut self,
        ty: TypeId,
        op: CastOp,
        source_type: TypeId,
        source: ExprId,
    ) -> Self::Output;
    fn visit_comparison(
        &mut self,
        op: CmpOp,
        operand_type: TypeId,
        left: ExprId,
        right: ExprId,
    ) -> Self::Output;
    fn visit_if_else(
        &mut self,
        ty: TypeId,
        condition: ExprId,
        then_expr: ExprId,
        else_expr: ExprId,
    ) -> Self::Output;
    fn visit_switch(&mut self, ty: TypeId, parts: SwitchParts) -> Self::Output;
    fn visit_label(&mut self, ty: TypeId, end_target: BranchTargetId, body: ExprId)
    -> Self::Output;
    fn visit_loop(
        &mut self,
        ty: TypeId,
        body: ExprId,
        break_target: BranchTargetId,
        continue_target: BranchTargetId,
    ) -> Self::Output;
    fn visit_sequence(&mut self, ty: TypeId, void_expr: ExprId, result_expr: ExprId)
    -> Self::Output;
    fn visit_branch(
        &mut self,
        ty: TypeId,
        target: BranchTargetId,
        value: Option<ExprId>,
    ) -> Self::Output;
    fn visit_return(&mut self, ty: TypeId, value: Option<ExprId>) -> Self::Output;
    fn visit_nop(&mut self) -> Self::Output;
    fn visit_discard_result(&mut self, expr_type: TypeId, expr: ExprId) -> Self::Output;
    fn visit_error(&mut self, ty: TypeId, message: &str) -> Self::Output;
}

/// Recover the typed view of an expression and invoke the matching
/// visitor method. `ty` is the result type the context expects; debug
/// builds check it against the node's recorded class.
pub fn dispatch<V: ExprVisitor>(visitor: &mut V, id: ExprId, ty: TypeId) -> V::Output {
    let expr = visitor.arena().expr(id).clone();
    debug_assert!(
        expr.result_class() == TypeClass::Any || ty.class() == expr.result_class(),
        "dispatch type mismatch: expected {} for {:?}",
        ty,
        expr,
    );
    match expr {
        Expr::Literal(lit) => visitor.visit_literal(ty, lit),
        Expr::GetVariable { scope, index } => visitor.visit_get_variable(ty, scope, index),
        Expr::SetVariable {
            scope,
            index,
            value,
        } => visitor.visit_set_variable(scope, index, value),
        Expr::Load {
            memory_type,
            load_op,
            far,
            address,
        } => visitor.visit_load(ty, memory_type, load_op, far, address),
        Expr::Store {
            memory_type,
            value_type,
            far,
            address,
            value,
        } => visitor.visit_store(memory_type, value_type, far, address, value),
        Expr::Call {
            kind,
            index,
            args_start,
            args_len,
        } => visitor.visit_call(ty, kind, index, (args_start, args_len)),
        Expr::CallIndirect {
            table_index,
            index_expr,
            args_start,
            args_len,
        } => visitor.visit_call_indirect(ty, table_index, index_expr, (args_start, args_len)),
        Expr::Unary { op, operand } => visitor.visit_unary(ty, op, operand),
        Expr::Binary { op, left, right } => visitor.visit_binary(ty, op, left, right),
        Expr::Cast {
            op,
            source_type,
            source,
        } => visitor.visit_cast(ty, op, source_type, source),
        Expr::Comparison {
            op,
            operand_type,
            left,
            right,
        } => visitor.visit_comparison(op, operand_type, left, right),
        Expr::IfElse {
            condition,
            then_expr,
            else_expr,
        } => visitor.visit_if_else(ty, condition, then_expr, else_expr),
        Expr::Switch {
            key,
            key_type,
            arms_start,
            arms_len,
            default_arm_index,
            end_target,
        } => visitor.visit_switch(
            ty,
            SwitchParts {
                key,
                key_type,
                arms_start,
                arms_len,
                default_arm_index,
                end_target,
            },
        ),
        Expr::Label { end_target, body } => visitor.visit_label(ty, end_target, body),
        Expr::Loop {
            body,
            break_target,
            continue_target,
        } => visitor.visit_loop(ty, body, break_target, continue_target),
        Expr::Sequence {
            void_expr,
            result_expr,
        } => visitor.visit_sequence(ty, void_expr, result_expr),
        Expr::Branch { target, value } => visitor.visit_branch(ty, target, value),
        Expr::Return { value } => visitor.visit_return(ty, value),
        Expr::Nop => visitor.visit_nop(),
        Expr::DiscardResult { expr_type, expr } => visitor.visit_discard_result(expr_type, expr),
        Expr::Error { message } => visitor.visit_error(ty, &message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A visitor that counts nodes reachable from a root. Exists to
    /// exercise the exhaustiveness contract outside the code generator.
    struct NodeCounter<'a> {
        arena: &'a Arena,
        count: usize,
    }

    impl<'a> NodeCounter<'a> {
        fn recurse(&mut self, id: ExprId, ty: TypeId) {
            dispatch(self, id, ty);
        }
    }

    impl ExprVisitor for NodeCounter<'_> {
        type Output = ();

        fn arena(&self) -> &Arena {
            self.arena
        }

        fn visit_literal(&mut self, _ty: TypeId, _lit: Literal) {
            self.count += 1;
        }
        fn visit_get_variable(&mut self, _ty: TypeId, _scope: VarScope, _index: usize) {
            self.count += 1;
        }
        fn visit_set_variable(&mut self, _scope: VarScope, index: usize, value: ExprId) {
            let _ = index;
            self.count += 1;
            self.recurse(value, TypeId::None);
        }
        fn visit_load(
            &mut self,
            _ty: TypeId,
            _memory_type: TypeId,
            _load_op: LoadOp,
            far: bool,
            address: ExprId,
        ) {
            self.count += 1;
            self.recurse(address, if far { TypeId::I64 } else { TypeId::I32 });
        }
        fn visit_store(
            &mut self,
            _memory_type: TypeId,
            value_type: TypeId,
            far: bool,
            address: ExprId,
            value: ExprId,
        ) {
            self.count += 1;
            self.recurse(address, if far { TypeId::I64 } else { TypeId::I32 });
            self.recurse(value, value_type);
        }
        fn visit_call(&mut self, _ty: TypeId, _kind: CallKind, _index: usize, _args: (u32, u32)) {
            self.count += 1;
        }
        fn visit_call_indirect(
            &mut self,
            _ty: TypeId,
            _table_index: usize,
            index_expr: ExprId,
            _args: (u32, u32),
        ) {
            self.count += 1;
            self.recurse(index_expr, TypeId::I32);
        }
        fn visit_unary(&mut self, ty: TypeId, _op: UnaryOp, operand: ExprId) {
            self.count += 1;
            self.recurse(operand, ty);
        }
        fn visit_binary(&mut self, ty: TypeId, _op: BinaryOp, left: ExprId, right: ExprId) {
            self.count += 1;
            self.recurse(left, ty);
            self.recurse(right, ty);
        }
        fn visit_cast(&mut self, _ty: TypeId, _op: CastOp, source_type: TypeId, source: ExprId) {
            self.count += 1;
            self.recurse(source, source_type);
        }
        fn visit_comparison(
            &mut self,
            _op: CmpOp,
            operand_type: TypeId,
            left: ExprId,
            right: ExprId,
        ) {
            self.count += 1;
            self.recurse(left, operand_type);
            self.recurse(right, operand_type);
        }
        fn visit_if_else(
            &mut self,
            ty: TypeId,
            condition: ExprId,
            then_expr: ExprId,
            else_expr: ExprId,
        ) {
            self.count += 1;
            self.recurse(condition, TypeId::Bool);
            self.recurse(then_expr, ty);
            self.recurse(else_expr, ty);
        }
        fn visit_switch(&mut self, ty: TypeId, parts: SwitchParts) {
            self.count += 1;
            self.recurse(parts.key, parts.key_type);
            let arms: Vec<_> = self
                .arena
                .arms(parts.arms_start, parts.arms_len)
                .iter()
                .map(|a| a.value)
                .collect();
            for (i, arm) in arms.iter().enumerate() {
                let arm_ty = if i as u32 == parts.default_arm_index {
                    ty
                } else {
                    TypeId::Void
                };
                self.recurse(*arm, arm_ty);
            }
        }
        fn visit_label(&mut self, ty: TypeId, _end_target: BranchTargetId, body: ExprId) {
            self.count += 1;
            self.recurse(body, ty);
        }
        fn visit_loop(
            &mut self,
            _ty: TypeId,
            body: ExprId,
            _break_target: BranchTargetId,
            _continue_target: BranchTargetId,
        ) {
            self.count += 1;
            self.recurse(body, TypeId::Void);
        }
        fn visit_sequence(&mut self, ty: TypeId, void_expr: ExprId, result_expr: ExprId) {
            self.count += 1;
            self.recurse(void_expr, TypeId::Void);
            self.recurse(result_expr, ty);
        }
        fn visit_branch(&mut self, _ty: TypeId, target: BranchTargetId, value: Option<ExprId>) {
            self.count += 1;
            if let Some(value) = value {
                let target_ty = self.arena.target_type(target);
                self.recurse(value, target_ty);
            }
        }
        fn visit_return(&mut self, _ty: TypeId, _value: Option<ExprId>) {
            self.count += 1;
        }
        fn visit_nop(&mut self) {
            self.count += 1;
        }
        fn visit_discard_result(&mut self, expr_type: TypeId, expr: ExprId) {
            self.count += 1;
            self.recurse(expr, expr_type);
        }
        fn visit_error(&mut self, _ty: TypeId, _message: &str) {
            self.count += 1;
        }
    }

    #[test]
    fn dispatch_reaches_every_child() {
        use crate::ast::expr::IntBinaryOp;

        let mut arena = Arena::new();
        let one = arena.alloc_expr(Expr::Literal(Literal::I32(1)));
        let two = arena.alloc_expr(Expr::Literal(Literal::I32(2)));
        let add = arena.alloc_expr(Expr::Binary {
            op: BinaryOp::Int(IntBinaryOp::Add),
            left: one,
            right: two,
        });
        let root = arena.alloc_expr(Expr::Return { value: Some(add) });

        let mut counter = NodeCounter {
            arena: &arena,
            count: 0,
        };
        // Return does not recurse in the counter; count the tree by hand.
        dispatch(&mut counter, root, TypeId::I32);
        assert_eq!(counter.count, 1);
        dispatch(&mut counter, add, TypeId::I32);
        assert_eq!(counter.count, 4);
    }
}
