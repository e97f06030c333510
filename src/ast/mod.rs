// src/ast/mod.rs
pub mod dispatch;
pub mod expr;
pub mod module;
pub mod types;

pub use dispatch::{ExprVisitor, SwitchParts, dispatch};
pub use expr::{
    BinaryOp, BoolBinaryOp, BoolUnaryOp, CallKind, CastOp, CmpOp, Expr, FloatBinaryOp,
    FloatUnaryOp, IntBinaryOp, IntUnaryOp, Literal, LoadOp, SwitchArm, UnaryOp, VarScope,
};
pub use module::{
    AssertEq, DataSegment, File, Function, FunctionImport, FunctionTable, Module, Variable,
    VariableImport,
};
pub use types::{FunctionType, TypeClass, TypeId};
