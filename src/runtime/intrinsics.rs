// src/runtime/intrinsics.rs
//
// Process-wide registry of host functions and values importable by
// guest modules. Registration happens explicitly at load time; lookup
// happens while linking. All access goes through one mutex.

use std::sync::{Mutex, OnceLock};

use rustc_hash::FxHashMap;

use crate::ast::types::{FunctionType, TypeId};

/// A host function registered under an import name. The pointer is an
/// `extern "C"` entry point whose ABI matches the recorded type.
#[derive(Clone)]
pub struct IntrinsicFunction {
    pub ty: FunctionType,
    pub address: *const u8,
}

/// A host value registered under an import name. The address is stable
/// storage the guest binds its imported global to.
#[derive(Clone)]
pub struct IntrinsicValue {
    pub ty: TypeId,
    pub address: *mut u8,
}

// Addresses registered here point at 'static host functions and
// storage; they are shared across threads only for linking.
unsafe impl Send for IntrinsicFunction {}
unsafe impl Sync for IntrinsicFunction {}
unsafe impl Send for IntrinsicValue {}
unsafe impl Sync for IntrinsicValue {}

impl std::fmt::Debug for IntrinsicFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntrinsicFunction")
            .field("ty", &self.ty)
            .field("address", &self.address)
            .finish()
    }
}

impl std::fmt::Debug for IntrinsicValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntrinsicValue")
            .field("ty", &self.ty)
            .field("address", &self.address)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Registry {
    functions: FxHashMap<String, IntrinsicFunction>,
    values: FxHashMap<String, IntrinsicValue>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

pub fn register_function(name: &str, ty: FunctionType, address: *const u8) {
    let mut registry = registry().lock().unwrap();
    registry
        .functions
        .insert(name.to_string(), IntrinsicFunction { ty, address });
}

pub fn register_value(name: &str, ty: TypeId, address: *mut u8) {
    let mut registry = registry().lock().unwrap();
    registry
        .values
        .insert(name.to_string(), IntrinsicValue { ty, address });
}

pub fn unregister_function(name: &str) {
    registry().lock().unwrap().functions.remove(name);
}

pub fn unregister_value(name: &str) {
    registry().lock().unwrap().values.remove(name);
}

pub fn find_function(name: &str) -> Option<IntrinsicFunction> {
    registry().lock().unwrap().functions.get(name).cloned()
}

pub fn find_value(name: &str) -> Option<IntrinsicValue> {
    registry().lock().unwrap().values.get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn answer() -> i32 {
        42
    }

    #[test]
    fn register_and_find() {
        register_function(
            "test_registry_answer",
            FunctionType::new(TypeId::I32, vec![]),
            answer as *const u8,
        );
        let found = find_function("test_registry_answer").expect("registered");
        assert_eq!(found.ty.return_type, TypeId::I32);
        assert_eq!(found.address, answer as *const u8);
        unregister_function("test_registry_answer");
        assert!(find_function("test_registry_answer").is_none());
    }

    #[test]
    fn find_missing_is_none() {
        assert!(find_function("test_registry_no_such_intrinsic").is_none());
        assert!(find_value("test_registry_no_such_value").is_none());
    }
}
