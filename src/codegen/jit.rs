// src/codegen/jit.rs

use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{DataId, FuncId, Linkage, Module};
use rustc_hash::FxHashMap;

use crate::ast::types::{FunctionType, TypeId};
use crate::errors::CodegenError;
use crate::runtime::host;

/// Backend knobs for one module compilation.
#[derive(Debug, Clone)]
pub struct JitOptions {
    /// Optimize for speed and drop the IR verifier.
    pub release: bool,
    /// Guard indirect calls by checking the 32-bit word before the
    /// callee's entry point and substituting a known-safe function of
    /// the table's type when it is nonzero. Off by default: the
    /// backend does not lay out prefix words, so enabling this
    /// requires an embedding that does.
    pub prefix_check: bool,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            release: false,
            prefix_check: false,
        }
    }
}

/// JIT compiler context: the backend module plus the declared-symbol
/// bookkeeping shared by the whole compilation.
pub struct JitContext {
    pub module: JITModule,
    pub ctx: codegen::Context,
    pub func_ids: FxHashMap<String, FuncId>,
}

impl JitContext {
    /// Build a JIT module for the native ISA. `symbols` are the
    /// resolved import addresses; they must be registered before the
    /// module is created so finalization can bind them.
    pub fn new(options: &JitOptions, symbols: &[(String, *const u8)]) -> Self {
        let mut flag_builder = settings::builder();
        flag_builder.set("use_colocated_libcalls", "false").unwrap();
        flag_builder.set("is_pic", "false").unwrap();
        if options.release {
            flag_builder.set("opt_level", "speed").unwrap();
            flag_builder.set("enable_verifier", "false").unwrap();
        } else {
            flag_builder.set("opt_level", "none").unwrap();
        }

        let isa_builder = cranelift_native::builder().unwrap_or_else(|msg| {
            panic!("native ISA not available: {}", msg);
        });
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .unwrap();

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());

        // Runtime helpers generated code calls directly.
        builder.symbol("marmot_frem", host::marmot_frem as *const u8);
        builder.symbol("marmot_fremf", host::marmot_fremf as *const u8);

        for (name, address) in symbols {
            builder.symbol(name, *address);
        }

        let module = JITModule::new(builder);
        let ctx = module.make_context();

        Self {
            module,
            ctx,
            func_ids: FxHashMap::default(),
        }
    }

    /// Get the pointer type for the target.
    pub fn pointer_type(&self) -> Type {
        self.module.target_config().pointer_type()
    }

    /// Build a backend signature from a function type.
    pub fn make_signature(&self, ty: &FunctionType) -> Signature {
        let mut sig = self.module.make_signature();
        for &param in &ty.parameters {
            sig.params.push(AbiParam::new(super::context::backend_type(param)));
        }
        if ty.return_type != TypeId::Void {
            sig.returns
                .push(AbiParam::new(super::context::backend_type(ty.return_type)));
        }
        sig
    }

    pub fn declare_function(
        &mut self,
        name: &str,
        linkage: Linkage,
        sig: &Signature,
    ) -> Result<FuncId, CodegenError> {
        let func_id = self
            .module
            .declare_function(name, linkage, sig)
            .map_err(|e| CodegenError::Declare(e.to_string()))?;
        self.func_ids.insert(name.to_string(), func_id);
        Ok(func_id)
    }

    pub fn declare_data(
        &mut self,
        name: &str,
        linkage: Linkage,
        writable: bool,
    ) -> Result<DataId, CodegenError> {
        self.module
            .declare_data(name, linkage, writable, false)
            .map_err(|e| CodegenError::Declare(e.to_string()))
    }

    /// Define a function after its IR is built.
    pub fn define_function(&mut self, name: &str, func_id: FuncId) -> Result<(), CodegenError> {
        self.module
            .define_function(func_id, &mut self.ctx)
            .map_err(|e| CodegenError::Define {
                name: name.to_string(),
                detail: e.to_string(),
            })
    }

    /// Finalize all functions and resolve symbols.
    pub fn finalize(&mut self) -> Result<(), String> {
        self.module
            .finalize_definitions()
            .map_err(|e| e.to_string())
    }

    /// Get a finalized machine-code entry point.
    pub fn get_function_ptr(&self, func_id: FuncId) -> *const u8 {
        self.module.get_finalized_function(func_id)
    }

    /// Clear the per-function context for reuse.
    pub fn clear(&mut self) {
        self.module.clear_context(&mut self.ctx);
    }
}
