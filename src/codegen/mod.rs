// src/codegen/mod.rs
mod context;
pub mod compiler;
mod expr;
pub mod jit;
mod ops;

pub use compiler::{CompiledModule, compile_module};
pub use jit::{JitContext, JitOptions};
