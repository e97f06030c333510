// src/codegen/compiler.rs
//
// Module-level compilation: import resolution against the intrinsic
// registry, globals and function tables as backend data objects, one
// IR function per guest function, invoke shims for exports, and
// finalization into executable code.

use cranelift::prelude::*;
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::ast::module::Module as AstModule;
use crate::ast::types::{FunctionType, TypeId};
use crate::codegen::context::{Cg, CompileCtx, backend_type};
use crate::codegen::jit::{JitContext, JitOptions};
use crate::errors::{CodegenError, LinkError};
use crate::runtime::intrinsics;
use crate::runtime::memory::LinearMemory;

/// A module lowered to native code. Owns the backend module the code
/// lives in; the machine code stays valid as long as this value does.
pub struct CompiledModule {
    jit: JitContext,
    function_ids: Vec<FuncId>,
    /// Uniform-ABI invoke shims, by exported function index.
    shim_ids: FxHashMap<usize, FuncId>,
}

impl CompiledModule {
    /// Machine-code entry point of a guest function.
    pub fn function_pointer(&self, function_index: usize) -> *const u8 {
        self.jit.get_function_ptr(self.function_ids[function_index])
    }

    /// Entry point of the invoke shim for an exported function:
    /// `extern "C" fn(args: *const u64, ret: *mut u64)`.
    pub fn invoke_shim_pointer(&self, function_index: usize) -> Option<*const u8> {
        self.shim_ids
            .get(&function_index)
            .map(|&id| self.jit.get_function_ptr(id))
    }
}

/// Resolved import symbols, or every missing import as an error list.
fn resolve_imports(ast: &AstModule) -> Result<Vec<(String, *const u8)>, LinkError> {
    let mut symbols: Vec<(String, *const u8)> = Vec::new();
    let mut missing: Vec<LinkError> = Vec::new();
    for import in &ast.function_imports {
        match intrinsics::find_function(&import.name) {
            Some(found) if found.ty == import.ty => {
                symbols.push((import.name.clone(), found.address));
            }
            _ => missing.push(LinkError::MissingFunction {
                name: import.name.clone(),
                signature: import.ty.clone(),
            }),
        }
    }
    for import in &ast.variable_imports {
        match intrinsics::find_value(&import.name) {
            Some(found) if found.ty == import.ty => {
                symbols.push((import.name.clone(), found.address as *const u8));
            }
            _ => missing.push(LinkError::MissingVariable {
                name: import.name.clone(),
                ty: import.ty,
            }),
        }
    }
    if missing.is_empty() {
        Ok(symbols)
    } else {
        for error in &missing {
            tracing::error!("{}", error);
        }
        Err(missing.remove(0))
    }
}

/// The symbol a guest function is declared under: its export name, or
/// a `.L`-prefixed local name that cannot collide with exports.
fn function_symbol(ast: &AstModule, function_index: usize) -> (String, Linkage) {
    for (name, &index) in &ast.exports {
        if index == function_index {
            return (name.clone(), Linkage::Export);
        }
    }
    let suffix = ast.functions[function_index].name.as_deref().unwrap_or("");
    (format!(".Lf{}_{}", function_index, suffix), Linkage::Local)
}

/// Compile a parsed module against a provisioned guest memory. The
/// memory's base and mask are baked into the generated code, so the
/// memory must outlive the returned module.
pub fn compile_module(
    ast: &AstModule,
    memory: &LinearMemory,
    options: &JitOptions,
) -> Result<CompiledModule, LinkError> {
    // Import addresses must be known before the backend module exists,
    // and a missing import fails the whole load with its signature.
    let symbols = resolve_imports(ast)?;

    let mut jit = JitContext::new(options, &symbols);
    let pointer_type = jit.pointer_type();

    // Imported functions.
    let mut import_ids = Vec::with_capacity(ast.function_imports.len());
    for import in &ast.function_imports {
        let sig = jit.make_signature(&import.ty);
        import_ids.push(jit.declare_function(&import.name, Linkage::Import, &sig)?);
    }

    // Runtime helpers.
    let frem_sig = jit.make_signature(&FunctionType::new(
        TypeId::F64,
        vec![TypeId::F64, TypeId::F64],
    ));
    let frem_id = jit.declare_function("marmot_frem", Linkage::Import, &frem_sig)?;
    let fremf_sig = jit.make_signature(&FunctionType::new(
        TypeId::F32,
        vec![TypeId::F32, TypeId::F32],
    ));
    let fremf_id = jit.declare_function("marmot_fremf", Linkage::Import, &fremf_sig)?;

    // Globals: imported ones bind to the intrinsic's storage under the
    // unmangled import name; the rest are zero-initialized data.
    let imported_globals: FxHashMap<usize, &str> = ast
        .variable_imports
        .iter()
        .map(|import| (import.global_index, import.name.as_str()))
        .collect();
    let mut global_ids: Vec<DataId> = Vec::with_capacity(ast.globals.len());
    for (index, global) in ast.globals.iter().enumerate() {
        let data_id = if let Some(import_name) = imported_globals.get(&index) {
            jit.declare_data(import_name, Linkage::Import, true)?
        } else {
            let data_id = jit.declare_data(&format!(".Lg{}", index), Linkage::Local, true)?;
            let mut desc = DataDescription::new();
            let width = global.ty.byte_width().max(1);
            desc.define_zeroinit(width as usize);
            desc.set_align(width as u64);
            jit.module
                .define_data(data_id, &desc)
                .map_err(|e| CodegenError::Declare(e.to_string()))?;
            data_id
        };
        global_ids.push(data_id);
    }

    // Guest functions.
    let mut function_ids: Vec<FuncId> = Vec::with_capacity(ast.functions.len());
    for (index, function) in ast.functions.iter().enumerate() {
        let sig = jit.make_signature(&function.ty);
        let (name, linkage) = function_symbol(ast, index);
        function_ids.push(jit.declare_function(&name, linkage, &sig)?);
    }

    // Function tables: constant arrays of function addresses. The
    // parser guarantees power-of-two sizes and uniform signatures.
    let mut table_ids: Vec<DataId> = Vec::with_capacity(ast.function_tables.len());
    for (index, table) in ast.function_tables.iter().enumerate() {
        debug_assert!(table.function_indices.len().is_power_of_two());
        let data_id = jit.declare_data(&format!(".Lt{}", index), Linkage::Local, false)?;
        let mut desc = DataDescription::new();
        let pointer_bytes = pointer_type.bytes() as usize;
        desc.define_zeroinit(pointer_bytes * table.function_indices.len());
        desc.set_align(pointer_bytes as u64);
        for (slot, &function_index) in table.function_indices.iter().enumerate() {
            let func_ref = jit
                .module
                .declare_func_in_data(function_ids[function_index], &mut desc);
            desc.write_function_addr((slot * pointer_bytes) as u32, func_ref);
        }
        jit.module
            .define_data(data_id, &desc)
            .map_err(|e| CodegenError::Declare(e.to_string()))?;
        table_ids.push(data_id);
    }

    // Lower each function body.
    for function_index in 0..ast.functions.len() {
        compile_function(
            &mut jit,
            ast,
            &function_ids,
            &import_ids,
            &global_ids,
            &table_ids,
            frem_id,
            fremf_id,
            memory,
            options,
            function_index,
        )?;
    }

    // Invoke shims for every export.
    let mut shim_ids: FxHashMap<usize, FuncId> = FxHashMap::default();
    for &function_index in ast.exports.values() {
        if !shim_ids.contains_key(&function_index) {
            let shim_id = compile_invoke_shim(&mut jit, ast, function_index)?;
            shim_ids.insert(function_index, shim_id);
        }
    }

    debug!(
        functions = ast.functions.len(),
        imports = ast.function_imports.len(),
        tables = ast.function_tables.len(),
        "lowered module"
    );

    // Finalization resolves all symbols and emits machine code; any
    // verifier rejection surfaces here and the module is unusable.
    jit.finalize().map_err(LinkError::Finalize)?;

    Ok(CompiledModule {
        jit,
        function_ids,
        shim_ids,
    })
}

#[allow(clippy::too_many_arguments)]
fn compile_function(
    jit: &mut JitContext,
    ast: &AstModule,
    function_ids: &[FuncId],
    import_ids: &[FuncId],
    global_ids: &[DataId],
    table_ids: &[DataId],
    frem_id: FuncId,
    fremf_id: FuncId,
    memory: &LinearMemory,
    options: &JitOptions,
    function_index: usize,
) -> Result<(), LinkError> {
    let function = &ast.functions[function_index];
    let return_type = function.ty.return_type;
    let Some(body) = function.body else {
        return Err(CodegenError::ErrorNode(format!(
            "function {} has no body",
            function_index
        ))
        .into());
    };

    let sig = jit.make_signature(&function.ty);
    let pointer_type = jit.pointer_type();
    jit.ctx.func.signature = sig;

    let mut builder_ctx = FunctionBuilderContext::new();
    {
        // The builder borrows the function IR; the lowering context
        // borrows the backend module. Split them apart so both live.
        let JitContext {
            module, ctx: clif, ..
        } = jit;
        let mut builder = FunctionBuilder::new(&mut clif.func, &mut builder_ctx);

        let mut ctx = CompileCtx {
            module,
            ast,
            function_ids,
            import_ids,
            global_ids,
            table_ids,
            frem_id,
            fremf_id,
            memory_base: memory.base() as i64,
            memory_mask: memory.address_space_max() as i64 - 1,
            pointer_type,
            prefix_check: options.prefix_check,
        };

        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);

        let mut cg = Cg::new(&mut builder, &mut ctx, function_index);

        // Locals become backend variables initialized to typed zero;
        // the backend's variable machinery is its mem-to-register form.
        for local in &function.locals {
            let cl_ty = backend_type(local.ty);
            let var = cg.builder.declare_var(cl_ty);
            let zero = match local.ty {
                TypeId::F32 => cg.builder.ins().f32const(0.0f32),
                TypeId::F64 => cg.builder.ins().f64const(0.0f64),
                _ => cg.builder.ins().iconst(cl_ty, 0),
            };
            cg.builder.def_var(var, zero);
            cg.locals.push(var);
        }

        // Parameter values overwrite their local slots.
        let params = cg.builder.block_params(entry_block).to_vec();
        for (param_index, &local_index) in function.parameter_local_indices.iter().enumerate() {
            cg.builder.def_var(cg.locals[local_index], params[param_index]);
        }

        // The body is a structural fold; its value is the fall-through
        // return.
        let value = cg.expr(body, return_type)?;
        match value {
            Some(value) if return_type != TypeId::Void => {
                cg.builder.ins().return_(&[value]);
            }
            _ => {
                cg.builder.ins().return_(&[]);
            }
        }

        builder.seal_all_blocks();
        builder.finalize();
    }

    let display_name = function
        .name
        .clone()
        .unwrap_or_else(|| function_index.to_string());
    jit.define_function(&display_name, function_ids[function_index])?;
    jit.clear();
    Ok(())
}

/// Emit the uniform-ABI shim for an exported function: arguments
/// arrive in 8-byte slots, the result is stored through a pointer, so
/// the host can call any signature without per-signature glue.
fn compile_invoke_shim(
    jit: &mut JitContext,
    ast: &AstModule,
    function_index: usize,
) -> Result<FuncId, LinkError> {
    let function_ty = ast.functions[function_index].ty.clone();
    let (callee_name, _) = function_symbol(ast, function_index);
    let callee_id = jit.func_ids[&callee_name];
    let pointer_type = jit.pointer_type();

    let mut sig = jit.module.make_signature();
    sig.params.push(AbiParam::new(pointer_type));
    sig.params.push(AbiParam::new(pointer_type));
    let shim_id = jit.declare_function(&format!(".Li{}", function_index), Linkage::Local, &sig)?;

    jit.ctx.func.signature = sig;
    let mut builder_ctx = FunctionBuilderContext::new();
    {
        let JitContext {
            module, ctx: clif, ..
        } = jit;
        let mut builder = FunctionBuilder::new(&mut clif.func, &mut builder_ctx);
        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);

        let args_ptr = builder.block_params(entry_block)[0];
        let ret_ptr = builder.block_params(entry_block)[1];

        let mut args = Vec::with_capacity(function_ty.parameters.len());
        for (slot, &param_ty) in function_ty.parameters.iter().enumerate() {
            let cl_ty = backend_type(param_ty);
            args.push(builder.ins().load(
                cl_ty,
                MemFlags::trusted(),
                args_ptr,
                (slot * 8) as i32,
            ));
        }

        let func_ref = module.declare_func_in_func(callee_id, builder.func);
        let call = builder.ins().call(func_ref, &args);
        if function_ty.return_type != TypeId::Void {
            let result = builder.inst_results(call)[0];
            builder.ins().store(MemFlags::trusted(), result, ret_ptr, 0);
        }
        builder.ins().return_(&[]);
        builder.finalize();
    }

    jit.define_function("invoke shim", shim_id)?;
    jit.clear();
    Ok(shim_id)
}
