// src/arena.rs
//
// Module-scoped arena. Every expression node, branch target, argument
// list, and copied byte string for a module lives here and is released
// in one drop. Identity (branch-target matching, expression references)
// is the arena index, never an address.

use crate::ast::expr::{Expr, SwitchArm};
use crate::ast::types::TypeId;

/// Index of an expression node in its module's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

/// Index of a branch target in its module's arena.
///
/// Branch targets are sentinels: the only thing stored for one is the
/// type of value carried into it. Two targets are the same destination
/// exactly when their ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchTargetId(pub u32);

pub struct Arena {
    exprs: Vec<Expr>,
    target_types: Vec<TypeId>,
    /// Copied string/byte data (data segments, names from the source text).
    bytes: Vec<Box<[u8]>>,
    /// Switch arm storage, referenced by range from `Expr::Switch`.
    arms: Vec<SwitchArm>,
    /// Argument list storage, referenced by range from call nodes.
    args: Vec<ExprId>,
}

impl Arena {
    pub fn new() -> Self {
        Self {
            exprs: Vec::new(),
            target_types: Vec::new(),
            bytes: Vec::new(),
            arms: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn alloc_expr(&mut self, expr: Expr) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(expr);
        id
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn alloc_target(&mut self, ty: TypeId) -> BranchTargetId {
        let id = BranchTargetId(self.target_types.len() as u32);
        self.target_types.push(ty);
        id
    }

    pub fn target_type(&self, id: BranchTargetId) -> TypeId {
        self.target_types[id.0 as usize]
    }

    /// Copy bytes into the arena, returning a reference that lives as
    /// long as the arena.
    pub fn copy_bytes(&mut self, data: &[u8]) -> u32 {
        self.bytes.push(data.into());
        (self.bytes.len() - 1) as u32
    }

    pub fn bytes(&self, index: u32) -> &[u8] {
        &self.bytes[index as usize]
    }

    pub fn alloc_arms(&mut self, arms: Vec<SwitchArm>) -> (u32, u32) {
        let start = self.arms.len() as u32;
        let len = arms.len() as u32;
        self.arms.extend(arms);
        (start, len)
    }

    pub fn arms(&self, start: u32, len: u32) -> &[SwitchArm] {
        &self.arms[start as usize..(start + len) as usize]
    }

    pub fn alloc_args(&mut self, args: Vec<ExprId>) -> (u32, u32) {
        let start = self.args.len() as u32;
        let len = args.len() as u32;
        self.args.extend(args);
        (start, len)
    }

    pub fn args(&self, start: u32, len: u32) -> &[ExprId] {
        &self.args[start as usize..(start + len) as usize]
    }

    pub fn num_exprs(&self) -> usize {
        self.exprs.len()
    }

    /// Approximate storage held by the arena, for load-time reporting.
    pub fn total_allocated_bytes(&self) -> usize {
        self.exprs.capacity() * std::mem::size_of::<Expr>()
            + self.target_types.capacity() * std::mem::size_of::<TypeId>()
            + self.arms.capacity() * std::mem::size_of::<SwitchArm>()
            + self.args.capacity() * std::mem::size_of::<ExprId>()
            + self.bytes.iter().map(|b| b.len()).sum::<usize>()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expr::Literal;

    #[test]
    fn expr_ids_are_stable() {
        let mut arena = Arena::new();
        let a = arena.alloc_expr(Expr::Literal(Literal::I32(1)));
        let b = arena.alloc_expr(Expr::Literal(Literal::I32(2)));
        assert_ne!(a, b);
        assert!(matches!(arena.expr(a), Expr::Literal(Literal::I32(1))));
        assert!(matches!(arena.expr(b), Expr::Literal(Literal::I32(2))));
    }

    #[test]
    fn branch_targets_are_identity() {
        let mut arena = Arena::new();
        let t1 = arena.alloc_target(TypeId::I32);
        let t2 = arena.alloc_target(TypeId::I32);
        // Same type, distinct destinations.
        assert_ne!(t1, t2);
        assert_eq!(arena.target_type(t1), TypeId::I32);
    }

    #[test]
    fn copied_bytes_round_trip() {
        let mut arena = Arena::new();
        let idx = arena.copy_bytes(b"abc");
        assert_eq!(arena.bytes(idx), b"abc");
    }
}
