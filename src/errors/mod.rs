// src/errors/mod.rs
//! Diagnostics for the module compiler.
//!
//! Parse-phase problems are *recorded* — the parser keeps going and the
//! caller decides what to do with the list. Link and verification
//! problems are fatal `Result` errors.

pub mod codegen;
pub mod parser;

pub use codegen::{CodegenError, LinkError};
pub use parser::ParseError;
