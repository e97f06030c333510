// src/errors/codegen.rs
//! Fatal errors from lowering, linking, and finalization.

use thiserror::Error;

use crate::ast::types::{FunctionType, TypeId};

#[derive(Error, Debug)]
pub enum CodegenError {
    /// An `Error` node survived into codegen. The parse error list
    /// should have been checked first; hitting one here is fatal.
    #[error("cannot compile module with parse errors: {0}")]
    ErrorNode(String),

    #[error("backend rejected function '{name}': {detail}")]
    Define { name: String, detail: String },

    #[error("backend declaration failed: {0}")]
    Declare(String),
}

#[derive(Error, Debug)]
pub enum LinkError {
    /// No intrinsic registered under the import's name with the
    /// import's exact signature.
    #[error("missing imported function {name} : {signature}")]
    MissingFunction {
        name: String,
        signature: FunctionType,
    },

    #[error("missing imported variable {name} : {ty}")]
    MissingVariable { name: String, ty: TypeId },

    #[error("module finalization failed: {0}")]
    Finalize(String),

    #[error(transparent)]
    Codegen(#[from] CodegenError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_function_names_the_full_signature() {
        let err = LinkError::MissingFunction {
            name: "_does_not_exist".to_string(),
            signature: FunctionType::new(TypeId::I32, vec![TypeId::I32, TypeId::I32]),
        };
        let text = err.to_string();
        assert!(text.contains("_does_not_exist"));
        assert!(text.contains("(i32,i32) -> i32"));
    }
}
