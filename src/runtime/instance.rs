// src/runtime/instance.rs
//
// A loaded guest: the parsed module, its compiled code, and its
// sandboxed memory, with the uniform-ABI invoke path the driver and
// test runner call through.

use thiserror::Error;

use crate::ast::expr::Literal;
use crate::ast::module::Module as AstModule;
use crate::ast::types::TypeId;
use crate::codegen::{CompiledModule, JitOptions, compile_module};
use crate::errors::LinkError;
use crate::runtime::host::{enter_memory, register_host_intrinsics};
use crate::runtime::memory::LinearMemory;
use crate::runtime::trap::{Trap, catch_traps};

#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("module doesn't contain named export {0}")]
    NoSuchExport(String),

    #[error("wrong arguments for exported function {name}: expected {expected}")]
    WrongArguments { name: String, expected: String },

    #[error(transparent)]
    Trap(#[from] Trap),
}

pub struct Instance {
    module: AstModule,
    memory: LinearMemory,
    compiled: CompiledModule,
}

impl Instance {
    /// Provision memory, copy in data segments, and compile the module
    /// to native code. Fails on any link or verification problem.
    pub fn instantiate(module: AstModule, options: &JitOptions) -> Result<Self, LinkError> {
        register_host_intrinsics();

        let memory = LinearMemory::new(module.initial_memory_bytes, module.max_memory_bytes)?;
        for segment in &module.data_segments {
            memory.write(segment.base_address, module.arena.bytes(segment.bytes))?;
        }

        let compiled = compile_module(&module, &memory, options)?;

        Ok(Self {
            module,
            memory,
            compiled,
        })
    }

    pub fn module(&self) -> &AstModule {
        &self.module
    }

    pub fn memory(&self) -> &LinearMemory {
        &self.memory
    }

    /// Machine-code entry point of a function by index.
    pub fn get_function_pointer(&self, function_index: usize) -> *const u8 {
        self.compiled.function_pointer(function_index)
    }

    /// Call an exported function by name. Arguments must match the
    /// export's parameter types exactly; the return value is `None`
    /// for void.
    pub fn invoke(&self, name: &str, args: &[Literal]) -> Result<Option<Literal>, InvokeError> {
        let Some(function_index) = self.module.export(name) else {
            return Err(InvokeError::NoSuchExport(name.to_string()));
        };
        self.invoke_function(function_index, args)
    }

    /// Call an exported function by index (the form assertion records
    /// carry).
    pub fn invoke_function(
        &self,
        function_index: usize,
        args: &[Literal],
    ) -> Result<Option<Literal>, InvokeError> {
        let function = &self.module.functions[function_index];
        let name = function.name.clone().unwrap_or_else(|| function_index.to_string());
        let ty = &function.ty;

        let args_match = args.len() == ty.parameters.len()
            && args
                .iter()
                .zip(&ty.parameters)
                .all(|(arg, &param)| arg.type_id() == param);
        if !args_match {
            return Err(InvokeError::WrongArguments {
                name: name.to_string(),
                expected: ty.to_string(),
            });
        }

        let shim = self
            .compiled
            .invoke_shim_pointer(function_index)
            .expect("every export has an invoke shim");
        let entry: extern "C" fn(*const u64, *mut u64) = unsafe { std::mem::transmute(shim) };

        let slots: Vec<u64> = args.iter().map(|arg| literal_to_slot(*arg)).collect();
        let mut ret_slot: u64 = 0;

        // Publish this instance's memory to host intrinsics and run
        // under the trap trampoline.
        let _scope = enter_memory(&self.memory);
        catch_traps(|| entry(slots.as_ptr(), &mut ret_slot))?;

        Ok(literal_from_slot(ret_slot, ty.return_type))
    }
}

fn literal_to_slot(value: Literal) -> u64 {
    match value {
        Literal::I8(v) => v as u64,
        Literal::I16(v) => v as u64,
        Literal::I32(v) => v as u64,
        Literal::I64(v) => v,
        Literal::F32(v) => v.to_bits() as u64,
        Literal::F64(v) => v.to_bits(),
        Literal::Bool(v) => v as u64,
    }
}

fn literal_from_slot(slot: u64, ty: TypeId) -> Option<Literal> {
    Some(match ty {
        TypeId::I8 => Literal::I8(slot as u8),
        TypeId::I16 => Literal::I16(slot as u16),
        TypeId::I32 => Literal::I32(slot as u32),
        TypeId::I64 => Literal::I64(slot),
        TypeId::F32 => Literal::F32(f32::from_bits(slot as u32)),
        TypeId::F64 => Literal::F64(f64::from_bits(slot)),
        TypeId::Bool => Literal::Bool(slot & 1 != 0),
        TypeId::Void | TypeId::None => return None,
    })
}
