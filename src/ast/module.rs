// src/ast/module.rs
//
// Module-level structures: functions, globals, imports, tables, data
// segments, exports, and the parse result that wraps them.

use rustc_hash::FxHashMap;

use crate::arena::{Arena, ExprId};
use crate::ast::expr::Literal;
use crate::ast::types::{FunctionType, TypeId};
use crate::errors::ParseError;
use crate::frontend::Locus;

/// A local or global variable slot.
#[derive(Debug, Clone)]
pub struct Variable {
    pub ty: TypeId,
    pub name: Option<String>,
}

/// A guest function. Parameters are a prefix slice of `locals`;
/// `parameter_local_indices[i]` is the local slot of the i-th formal.
#[derive(Debug)]
pub struct Function {
    pub name: Option<String>,
    pub locals: Vec<Variable>,
    pub parameter_local_indices: Vec<usize>,
    pub ty: FunctionType,
    pub body: Option<ExprId>,
}

impl Function {
    pub fn new() -> Self {
        Self {
            name: None,
            locals: Vec::new(),
            parameter_local_indices: Vec::new(),
            ty: FunctionType::default(),
            body: None,
        }
    }
}

impl Default for Function {
    fn default() -> Self {
        Self::new()
    }
}

/// A table of functions of a single signature, indexed by a
/// guest-computed integer. The length is a power of two so indirect
/// calls can mask the index instead of bounds-checking it.
#[derive(Debug)]
pub struct FunctionTable {
    pub ty: FunctionType,
    pub function_indices: Vec<usize>,
}

#[derive(Debug)]
pub struct FunctionImport {
    pub ty: FunctionType,
    pub name: String,
}

#[derive(Debug)]
pub struct VariableImport {
    pub ty: TypeId,
    pub name: String,
    pub global_index: usize,
}

/// Bytes copied into guest memory at load time. Bounds against the
/// initial memory size are checked at parse time.
#[derive(Debug)]
pub struct DataSegment {
    pub base_address: u64,
    /// Index of the byte string in the module arena.
    pub bytes: u32,
    pub num_bytes: u64,
}

pub struct Module {
    pub arena: Arena,
    pub functions: Vec<Function>,
    pub globals: Vec<Variable>,
    /// Export name to function index. Keys compare byte-wise.
    pub exports: FxHashMap<String, usize>,
    pub function_tables: Vec<FunctionTable>,
    pub function_imports: Vec<FunctionImport>,
    pub variable_imports: Vec<VariableImport>,
    pub data_segments: Vec<DataSegment>,
    pub initial_memory_bytes: u64,
    pub max_memory_bytes: u64,
}

impl Module {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            exports: FxHashMap::default(),
            function_tables: Vec::new(),
            function_imports: Vec::new(),
            variable_imports: Vec::new(),
            data_segments: Vec::new(),
            initial_memory_bytes: 0,
            max_memory_bytes: 0,
        }
    }

    pub fn export(&self, name: &str) -> Option<usize> {
        self.exports.get(name).copied()
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

/// One `(assert_eq (invoke "name" args...) expected)` form. Argument
/// and expected expressions are literal constants, evaluated by the
/// test driver.
#[derive(Debug)]
pub struct AssertEq {
    pub module_index: usize,
    pub function_index: usize,
    pub args: Vec<Literal>,
    pub expected: Literal,
    pub locus: Locus,
}

/// The result of parsing one source text: the modules it defines, the
/// assertions that follow them, and every diagnostic recorded along
/// the way. Parsing never aborts; a file with a non-empty error list
/// still carries a structurally valid module tree.
pub struct File {
    pub modules: Vec<Module>,
    pub assert_eqs: Vec<AssertEq>,
    pub errors: Vec<ParseError>,
}

impl File {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            assert_eqs: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Default for File {
    fn default() -> Self {
        Self::new()
    }
}
