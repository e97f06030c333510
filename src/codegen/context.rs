// src/codegen/context.rs
//
// Lowering context - bundles the state threaded through function
// compilation. Methods are implemented across expr.rs and ops.rs in
// split impl blocks.

use cranelift::prelude::*;
use cranelift_jit::JITModule;
use cranelift_module::{DataId, FuncId, Module};

use crate::arena::BranchTargetId;
use crate::ast::module::Module as AstModule;
use crate::ast::types::{FunctionType, TypeId};

/// Backend type of a primitive. `bool` is a byte.
pub(crate) fn backend_type(ty: TypeId) -> Type {
    match ty {
        TypeId::I8 | TypeId::Bool => types::I8,
        TypeId::I16 => types::I16,
        TypeId::I32 => types::I32,
        TypeId::I64 => types::I64,
        TypeId::F32 => types::F32,
        TypeId::F64 => types::F64,
        TypeId::None | TypeId::Void => unreachable!("no backend type for {}", ty),
    }
}

/// An in-scope branch destination. A `Branch` expression matches a
/// record by branch-target identity; the block carries one block
/// parameter when the target's type is non-void (the merge phi).
pub(crate) struct BranchContext {
    pub target: BranchTargetId,
    pub block: Block,
}

/// Module-level state shared by every function being lowered. Borrows
/// the backend module disjointly from the function builder, so both
/// can be live at once.
pub(crate) struct CompileCtx<'a> {
    pub module: &'a mut JITModule,
    pub ast: &'a AstModule,
    /// Backend ids for guest functions, by function index.
    pub function_ids: &'a [FuncId],
    /// Backend ids for imported functions, by import index.
    pub import_ids: &'a [FuncId],
    /// Data ids for globals, by global index.
    pub global_ids: &'a [DataId],
    /// Data ids for function tables, by table index.
    pub table_ids: &'a [DataId],
    /// Runtime helpers for float remainder, per width.
    pub frem_id: FuncId,
    pub fremf_id: FuncId,
    /// Baked-in sandbox constants.
    pub memory_base: i64,
    pub memory_mask: i64,
    pub pointer_type: Type,
    pub prefix_check: bool,
}

impl CompileCtx<'_> {
    pub fn make_signature(&self, ty: &FunctionType) -> Signature {
        let mut sig = self.module.make_signature();
        for &param in &ty.parameters {
            sig.params.push(AbiParam::new(backend_type(param)));
        }
        if ty.return_type != TypeId::Void {
            sig.returns.push(AbiParam::new(backend_type(ty.return_type)));
        }
        sig
    }
}

/// Per-function lowering state.
pub(crate) struct Cg<'a, 'b, 'ctx> {
    pub builder: &'a mut FunctionBuilder<'b>,
    pub ctx: &'a mut CompileCtx<'ctx>,
    pub function_index: usize,
    /// Backend variables for the function's locals, by local index.
    pub locals: Vec<Variable>,
    /// Innermost-last stack of in-scope branch destinations.
    pub branch_stack: Vec<BranchContext>,
}

impl<'a, 'b, 'ctx> Cg<'a, 'b, 'ctx> {
    pub fn new(
        builder: &'a mut FunctionBuilder<'b>,
        ctx: &'a mut CompileCtx<'ctx>,
        function_index: usize,
    ) -> Self {
        Self {
            builder,
            ctx,
            function_index,
            locals: Vec::new(),
            branch_stack: Vec::new(),
        }
    }

    pub fn function(&self) -> &'ctx crate::ast::module::Function {
        &self.ctx.ast.functions[self.function_index]
    }

    /// Find the in-scope record for a branch target. Parser invariants
    /// guarantee every branch targets an enclosing construct.
    pub fn find_branch_context(&self, target: BranchTargetId) -> Option<Block> {
        self.branch_stack
            .iter()
            .rev()
            .find(|c| c.target == target)
            .map(|c| c.block)
    }
}
