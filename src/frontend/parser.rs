// src/frontend/parser.rs
//
// Two-pass module parser. The first pass records declarations
// (function signatures, imports, globals, memory, tables) so the
// second pass can parse function bodies and exports with forward
// references resolved. Every failure is recorded and parsing
// continues; the returned tree is always structurally valid.

use rustc_hash::FxHashMap;

use crate::ast::module::{
    AssertEq, DataSegment, File, Function, FunctionImport, FunctionTable, Module, Variable,
    VariableImport,
};
use crate::ast::types::{FunctionType, TypeId};
use crate::errors::ParseError;
use crate::frontend::parse_expr::FunctionContext;
use crate::frontend::sexpr::{Cursor, SNodeKind, parse_sexprs};
use crate::frontend::token::Locus;

/// Maximum guest memory: the sandbox address space is 32-bit.
const MAX_MEMORY_BYTES: u64 = 1 << 32;

/// Parse a source text into modules, assertions, and diagnostics.
pub fn parse_file(source: &str) -> File {
    let nodes = parse_sexprs(source);
    let mut file = File::new();

    let mut cursor = Cursor::new(&nodes, Locus::default());
    while !cursor.done() {
        if let Some(children) = cursor.as_tagged("module") {
            let module = {
                let mut ctx = ModuleContext::new(&mut file.errors);
                ctx.parse(children);
                ctx.module
            };
            file.modules.push(module);
        }
        cursor.next();
    }

    // Assertions come after all modules so invokes can reference any
    // export in the file.
    let mut cursor = Cursor::new(&nodes, Locus::default());
    while !cursor.done() {
        if let Some(children) = cursor.as_tagged("assert_eq") {
            parse_assert_eq(&mut file, children, cursor.locus());
        } else if cursor.as_tagged("module").is_none()
            && matches!(cursor.peek().map(|n| &n.kind), Some(SNodeKind::Tree(_)))
        {
            record(
                &mut file.errors,
                cursor.locus(),
                format!("unrecognized top-level form ({})", cursor.describe()),
            );
        }
        cursor.next();
    }

    file
}

fn record(errors: &mut Vec<ParseError>, locus: Locus, message: impl Into<String>) {
    errors.push(ParseError::new(locus, message));
}

pub(crate) struct ModuleContext<'e> {
    pub module: Module,
    pub function_names: FxHashMap<String, usize>,
    pub global_names: FxHashMap<String, usize>,
    pub table_names: FxHashMap<String, usize>,
    pub import_names: FxHashMap<String, usize>,
    pub errors: &'e mut Vec<ParseError>,
}

impl<'e> ModuleContext<'e> {
    fn new(errors: &'e mut Vec<ParseError>) -> Self {
        Self {
            module: Module::new(),
            function_names: FxHashMap::default(),
            global_names: FxHashMap::default(),
            table_names: FxHashMap::default(),
            import_names: FxHashMap::default(),
            errors,
        }
    }

    pub(crate) fn error(&mut self, locus: Locus, message: impl Into<String>) {
        record(self.errors, locus, message);
    }

    fn parse(&mut self, module_children: Cursor) {
        self.parse_declarations(module_children);
        self.parse_tables(module_children);
        build_name_map(
            &self.module.globals,
            &mut self.global_names,
            self.errors,
        );
        self.parse_definitions(module_children);
    }

    // Pass 1: declarations only.
    fn parse_declarations(&mut self, module_children: Cursor) {
        let mut has_memory = false;
        let mut cursor = module_children;
        while !cursor.done() {
            let locus = cursor.locus();
            if let Some(children) = cursor.as_tagged("func") {
                self.parse_function_declaration(children);
            } else if let Some(children) = cursor.as_tagged("import") {
                self.parse_import(children);
            } else if let Some(mut children) = cursor.as_tagged("global") {
                parse_variables(&mut children, &mut self.module.globals, self.errors);
                if !children.done() {
                    self.error(children.locus(), "unexpected input following global declaration");
                }
            } else if let Some(children) = cursor.as_tagged("memory") {
                if has_memory {
                    self.error(locus, "duplicate memory declaration");
                } else {
                    has_memory = true;
                    self.parse_memory(children);
                }
            } else if cursor.as_tagged("export").is_none() && cursor.as_tagged("table").is_none() {
                self.error(
                    locus,
                    format!("unrecognized declaration ({})", cursor.describe()),
                );
            }
            cursor.next();
        }
    }

    fn parse_function_declaration(&mut self, mut children: Cursor) {
        let function_index = self.module.functions.len();
        let mut function = Function::new();

        if let Some(name) = children.parse_name() {
            function.name = Some(name.to_string());
            if self.function_names.contains_key(name) {
                self.error(children.locus(), "duplicate function name");
            } else {
                self.function_names.insert(name.to_string(), function_index);
            }
        }

        let mut has_result = false;
        while !children.done() {
            if let Some(mut inner) = children.as_tagged("result") {
                if has_result {
                    self.error(children.locus(), "duplicate result declaration");
                } else if let Some(ty) = parse_type(&mut inner) {
                    has_result = true;
                    function.ty.return_type = ty;
                    if !inner.done() {
                        self.error(inner.locus(), "unexpected input following result declaration");
                    }
                } else {
                    self.error(inner.locus(), "expected type");
                }
            } else if let Some(mut inner) = children.as_tagged("param") {
                let base_local_index = function.locals.len();
                let count = parse_variables(&mut inner, &mut function.locals, self.errors);
                for i in 0..count {
                    function.parameter_local_indices.push(base_local_index + i);
                    function
                        .ty
                        .parameters
                        .push(function.locals[base_local_index + i].ty);
                }
                if !inner.done() {
                    self.error(inner.locus(), "unexpected input following parameter declaration");
                }
            } else if let Some(mut inner) = children.as_tagged("local") {
                parse_variables(&mut inner, &mut function.locals, self.errors);
                if !inner.done() {
                    self.error(inner.locus(), "unexpected input following local declaration");
                }
            } else {
                // First child that isn't a param, result, or local
                // starts the body; pass 2 handles it.
                break;
            }
            children.next();
        }

        self.module.functions.push(function);
    }

    fn parse_import(&mut self, mut children: Cursor) {
        let internal_name = children.parse_name().map(str::to_string);

        let Some(external_name) = children.parse_string() else {
            self.error(children.locus(), "expected import name string");
            return;
        };
        let external_name = String::from_utf8_lossy(external_name).into_owned();

        // A bare type after the import string means a variable import.
        if let Some(ty) = parse_type(&mut children) {
            let global_index = self.module.globals.len();
            self.module.globals.push(Variable {
                ty,
                name: internal_name,
            });
            self.module.variable_imports.push(VariableImport {
                ty,
                name: external_name,
                global_index,
            });
            if !children.done() {
                self.error(children.locus(), "unexpected input following import declaration");
            }
            return;
        }

        // Otherwise a function import with param/result declarations.
        let import_index = self.module.function_imports.len();
        if let Some(name) = internal_name {
            if self.import_names.contains_key(&name) {
                self.error(children.locus(), "duplicate import name");
            } else {
                self.import_names.insert(name, import_index);
            }
        }

        let mut parameters = Vec::new();
        let mut return_type = TypeId::Void;
        let mut has_result = false;
        while !children.done() {
            if let Some(mut inner) = children.as_tagged("result") {
                if has_result {
                    self.error(children.locus(), "duplicate result declaration");
                } else if let Some(ty) = parse_type(&mut inner) {
                    has_result = true;
                    return_type = ty;
                    if !inner.done() {
                        self.error(inner.locus(), "unexpected input following result declaration");
                    }
                } else {
                    self.error(inner.locus(), "expected type");
                }
            } else if let Some(mut inner) = children.as_tagged("param") {
                let mut vars = Vec::new();
                parse_variables(&mut inner, &mut vars, self.errors);
                parameters.extend(vars.into_iter().map(|v| v.ty));
                if !inner.done() {
                    self.error(inner.locus(), "unexpected input following parameter declaration");
                }
            } else {
                self.error(children.locus(), "expected param or result declaration");
            }
            children.next();
        }

        self.module.function_imports.push(FunctionImport {
            ty: FunctionType::new(return_type, parameters),
            name: external_name,
        });
    }

    fn parse_memory(&mut self, mut children: Cursor) {
        let Some(initial) = children.parse_int() else {
            self.error(children.locus(), "expected initial memory size integer");
            return;
        };
        let max = children.parse_int().unwrap_or(initial);

        let initial = initial as u64;
        let max = max as u64;
        if max > MAX_MEMORY_BYTES {
            self.error(children.locus(), "maximum memory size must be <=2^32 bytes");
            return;
        }
        if initial > max {
            self.error(
                children.locus(),
                "initial memory size must be <= maximum memory size",
            );
            return;
        }
        self.module.initial_memory_bytes = initial;
        self.module.max_memory_bytes = max;

        while !children.done() {
            let locus = children.locus();
            let Some(mut segment) = children.as_tagged("segment") else {
                self.error(locus, "expected segment declaration");
                children.next();
                continue;
            };
            let Some(base_address) = segment.parse_int() else {
                self.error(segment.locus(), "expected segment base address integer");
                children.next();
                continue;
            };
            let Some(bytes) = segment.parse_string() else {
                self.error(segment.locus(), "expected segment data string");
                children.next();
                continue;
            };
            let base_address = base_address as u64;
            let num_bytes = bytes.len() as u64;
            // Overflow-checked containment in the initial memory.
            match base_address.checked_add(num_bytes) {
                Some(end) if end <= self.module.initial_memory_bytes => {
                    let bytes = self.module.arena.copy_bytes(bytes);
                    self.module.data_segments.push(DataSegment {
                        base_address,
                        bytes,
                        num_bytes,
                    });
                }
                _ => {
                    self.error(
                        locus,
                        "data segment bounds aren't contained by initial memory size",
                    );
                }
            }
            children.next();
        }
    }

    // Table pass: runs after all function declarations exist so table
    // entries can reference functions declared later in the module.
    fn parse_tables(&mut self, module_children: Cursor) {
        let mut cursor = module_children;
        while !cursor.done() {
            let locus = cursor.locus();
            if let Some(mut children) = cursor.as_tagged("table") {
                let table_index = self.module.function_tables.len();
                // An optional leading name names the table, unless it
                // resolves to a function - then it is the first entry.
                let mut attempt = children;
                if let Some(name) = attempt.parse_name()
                    && !self.function_names.contains_key(name)
                {
                    children = attempt;
                    if self.table_names.contains_key(name) {
                        self.error(children.locus(), "duplicate table name");
                    } else {
                        self.table_names.insert(name.to_string(), table_index);
                    }
                }

                let num_functions = children.remaining();
                let mut function_indices = Vec::with_capacity(num_functions);
                let mut ty = FunctionType::default();
                if num_functions == 0 {
                    self.error(locus, "function table must contain at least 1 function");
                } else {
                    while !children.done() {
                        let entry_locus = children.locus();
                        match parse_name_or_index(
                            &mut children,
                            &self.function_names,
                            self.module.functions.len(),
                        ) {
                            Some(index) => function_indices.push(index),
                            None => {
                                function_indices.push(0);
                                self.error(entry_locus, "expected function name or index");
                                children.next();
                            }
                        }
                    }

                    if !num_functions.is_power_of_two() {
                        self.error(locus, "function table size must be a power of two");
                    }

                    // The first function's signature defines the table's
                    // type. Skip when every entry failed to resolve in a
                    // function-less module; those are already reported.
                    if !self.module.functions.is_empty() {
                        ty = self.module.functions[function_indices[0]].ty.clone();
                        for &index in &function_indices {
                            if self.module.functions[index].ty != ty {
                                self.error(
                                    locus,
                                    "function table must only contain functions of a single type",
                                );
                            }
                        }
                    }
                }

                self.module.function_tables.push(FunctionTable {
                    ty,
                    function_indices,
                });
            }
            cursor.next();
        }
    }

    // Pass 2: function bodies and exports, with every declaration from
    // pass 1 in scope.
    fn parse_definitions(&mut self, module_children: Cursor) {
        let mut current_function_index = 0usize;
        let mut cursor = module_children;
        while !cursor.done() {
            if let Some(mut children) = cursor.as_tagged("func") {
                // Skip past the name and the param/result/local forms.
                children.parse_name();
                while children.as_tagged("param").is_some()
                    || children.as_tagged("result").is_some()
                    || children.as_tagged("local").is_some()
                {
                    children.next();
                }

                let function_index = current_function_index;
                current_function_index += 1;

                let return_type = self.module.functions[function_index].ty.return_type;
                let body = {
                    let Module {
                        arena,
                        functions,
                        globals,
                        function_imports,
                        function_tables,
                        ..
                    } = &mut self.module;
                    let mut fctx = FunctionContext::new(
                        arena,
                        functions,
                        globals,
                        function_imports,
                        function_tables,
                        function_index,
                        &self.function_names,
                        &self.global_names,
                        &self.table_names,
                        &self.import_names,
                        self.errors,
                    );
                    fctx.parse_expression_sequence(return_type, children, "function body")
                };
                self.module.functions[function_index].body = Some(body);
            } else if let Some(mut children) = cursor.as_tagged("export") {
                let locus = children.locus();
                let Some(name) = children.parse_string() else {
                    self.error(locus, "expected export name string");
                    cursor.next();
                    continue;
                };
                let name = String::from_utf8_lossy(name).into_owned();
                match parse_name_or_index(
                    &mut children,
                    &self.function_names,
                    self.module.functions.len(),
                ) {
                    Some(index) => {
                        self.module.exports.insert(name, index);
                        if !children.done() {
                            self.error(
                                children.locus(),
                                "unexpected input following export declaration",
                            );
                        }
                    }
                    None => {
                        self.error(children.locus(), "expected function name or index");
                    }
                }
            }
            cursor.next();
        }
    }
}

/// Parse `(name type) | type+` into variables, as used by `param`,
/// `local`, and `global` forms. Returns the number parsed.
pub(crate) fn parse_variables(
    cursor: &mut Cursor,
    out: &mut Vec<Variable>,
    errors: &mut Vec<ParseError>,
) -> usize {
    if let Some(name) = cursor.parse_name() {
        let Some(ty) = parse_type(cursor) else {
            record(errors, cursor.locus(), "expected type");
            return 0;
        };
        out.push(Variable {
            ty,
            name: Some(name.to_string()),
        });
        1
    } else {
        let mut count = 0;
        while !cursor.done() {
            let Some(ty) = parse_type(cursor) else {
                record(errors, cursor.locus(), "expected type");
                return count;
            };
            out.push(Variable { ty, name: None });
            count += 1;
        }
        count
    }
}

/// Parse a type name symbol.
pub(crate) fn parse_type(cursor: &mut Cursor) -> Option<TypeId> {
    let ty = match cursor.peek()?.kind {
        SNodeKind::Symbol(ref s) => TypeId::from_name(s)?,
        _ => return None,
    };
    cursor.next();
    Some(ty)
}

/// Resolve a `$name` or a bounds-checked non-negative integer index.
pub(crate) fn parse_name_or_index(
    cursor: &mut Cursor,
    name_to_index: &FxHashMap<String, usize>,
    num_valid_indices: usize,
) -> Option<usize> {
    let mut attempt = *cursor;
    if let Some(value) = attempt.parse_int() {
        if value >= 0 && (value as usize) < num_valid_indices {
            *cursor = attempt;
            return Some(value as usize);
        }
        return None;
    }
    let mut attempt = *cursor;
    if let Some(name) = attempt.parse_name() {
        if let Some(&index) = name_to_index.get(name) {
            *cursor = attempt;
            return Some(index);
        }
    }
    None
}

/// Build a name→index map from named variables, recording duplicates.
pub(crate) fn build_name_map(
    variables: &[Variable],
    out: &mut FxHashMap<String, usize>,
    errors: &mut Vec<ParseError>,
) {
    for (index, variable) in variables.iter().enumerate() {
        if let Some(name) = &variable.name {
            if out.contains_key(name) {
                record(errors, Locus::default(), "duplicate variable name");
            } else {
                out.insert(name.clone(), index);
            }
        }
    }
}

/// Parse one `(assert_eq (invoke "name" args...) expected)` form.
fn parse_assert_eq(file: &mut File, mut children: Cursor, locus: Locus) {
    let Some(mut invoke) = children.as_tagged("invoke") else {
        record(&mut file.errors, children.locus(), "expected invoke expression");
        return;
    };
    children.next();

    let invoke_locus = invoke.locus();
    let Some(export_name) = invoke.parse_string() else {
        record(&mut file.errors, invoke_locus, "expected export name string");
        return;
    };
    let export_name = String::from_utf8_lossy(export_name).into_owned();

    // Find the named export in one of the modules.
    let Some((module_index, function_index)) = file
        .modules
        .iter()
        .enumerate()
        .find_map(|(i, m)| m.export(&export_name).map(|f| (i, f)))
    else {
        record(
            &mut file.errors,
            invoke_locus,
            "couldn't find export with this name",
        );
        return;
    };

    let ty = file.modules[module_index].functions[function_index].ty.clone();

    let mut args = Vec::with_capacity(ty.parameters.len());
    for &param_ty in &ty.parameters {
        match parse_literal(&mut invoke, param_ty) {
            Some(lit) => args.push(lit),
            None => {
                record(
                    &mut file.errors,
                    invoke.locus(),
                    format!("expected {} constant for invoke parameter", param_ty),
                );
                return;
            }
        }
    }
    if !invoke.done() {
        record(
            &mut file.errors,
            invoke.locus(),
            "unexpected input following invoke parameters",
        );
        return;
    }

    let Some(expected) = parse_literal(&mut children, ty.return_type) else {
        record(
            &mut file.errors,
            children.locus(),
            format!("expected {} constant for assert_eq reference value", ty.return_type),
        );
        return;
    };
    if !children.done() {
        record(
            &mut file.errors,
            children.locus(),
            "unexpected input following assert_eq expected value",
        );
        return;
    }

    file.assert_eqs.push(AssertEq {
        module_index,
        function_index,
        args,
        expected,
        locus,
    });
}

/// Parse a `(const.<ty> value)` form of the given type.
fn parse_literal(cursor: &mut Cursor, ty: TypeId) -> Option<crate::ast::Literal> {
    use crate::ast::Literal;

    let expected_tag = format!("const.{}", ty.name());
    let mut inner = cursor.as_tagged(&expected_tag)?;
    let lit = match ty {
        TypeId::I8 => Literal::I8(inner.parse_int()? as u8),
        TypeId::I16 => Literal::I16(inner.parse_int()? as u16),
        TypeId::I32 => Literal::I32(inner.parse_int()? as u32),
        TypeId::I64 => Literal::I64(inner.parse_int()? as u64),
        TypeId::F32 => Literal::F32(inner.parse_decimal()? as f32),
        TypeId::F64 => Literal::F64(inner.parse_decimal()?),
        _ => return None,
    };
    if !inner.done() {
        return None;
    }
    cursor.next();
    Some(lit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Literal;

    #[test]
    fn parse_minimal_module() {
        let file = parse_file(
            r#"(module
                (func $f (param i32) (result i32)
                    (return (add.i32 (get_local 0) (const.i32 1))))
                (export "inc" $f))"#,
        );
        assert!(file.errors.is_empty(), "errors: {:?}", file.errors);
        assert_eq!(file.modules.len(), 1);
        let module = &file.modules[0];
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.export("inc"), Some(0));
        let f = &module.functions[0];
        assert_eq!(f.ty.parameters, vec![TypeId::I32]);
        assert_eq!(f.ty.return_type, TypeId::I32);
        assert_eq!(f.parameter_local_indices, vec![0]);
        assert!(f.body.is_some());
    }

    #[test]
    fn named_and_indexed_references_resolve_to_same_entity() {
        let by_name = parse_file(
            r#"(module (func $f (result i32) (return (const.i32 7))) (export "f" $f))"#,
        );
        let by_index = parse_file(
            r#"(module (func $f (result i32) (return (const.i32 7))) (export "f" 0))"#,
        );
        assert!(by_name.errors.is_empty());
        assert!(by_index.errors.is_empty());
        assert_eq!(
            by_name.modules[0].export("f"),
            by_index.modules[0].export("f")
        );
    }

    #[test]
    fn duplicate_function_names_record_one_error_each() {
        let file = parse_file("(module (func $f (nop)) (func $f (nop)) (func $f (nop)))");
        let dups = file
            .errors
            .iter()
            .filter(|e| e.message.contains("duplicate function name"))
            .count();
        assert_eq!(dups, 2);
    }

    #[test]
    fn memory_declaration_with_segments() {
        let file = parse_file(r#"(module (memory 1024 (segment 0 "abc")))"#);
        assert!(file.errors.is_empty(), "errors: {:?}", file.errors);
        let module = &file.modules[0];
        assert_eq!(module.initial_memory_bytes, 1024);
        assert_eq!(module.max_memory_bytes, 1024);
        assert_eq!(module.data_segments.len(), 1);
        let seg = &module.data_segments[0];
        assert_eq!(module.arena.bytes(seg.bytes), b"abc");
    }

    #[test]
    fn data_segment_out_of_initial_memory_is_an_error() {
        let file = parse_file(r#"(module (memory 2 (segment 0 "abc")))"#);
        assert!(
            file.errors
                .iter()
                .any(|e| e.message.contains("data segment bounds"))
        );
    }

    #[test]
    fn segment_overflow_is_caught() {
        let file = parse_file(&format!(
            r#"(module (memory 16 (segment {} "abc")))"#,
            u64::MAX - 1
        ));
        assert!(!file.errors.is_empty());
    }

    #[test]
    fn non_power_of_two_table_is_an_error() {
        let file = parse_file(
            "(module (func $a (nop)) (func $b (nop)) (func $c (nop)) (table $a $b $c))",
        );
        assert!(
            file.errors
                .iter()
                .any(|e| e.message.contains("power of two"))
        );
    }

    #[test]
    fn table_signature_mismatch_is_an_error() {
        let file = parse_file(
            "(module (func $a (result i32) (return (const.i32 0))) (func $b (nop)) (table $a $b))",
        );
        assert!(file.errors.iter().any(|e| e.message.contains("single type")));
    }

    #[test]
    fn table_resolves_forward_references() {
        let file = parse_file("(module (table $a $b) (func $a (nop)) (func $b (nop)))");
        assert!(file.errors.is_empty(), "errors: {:?}", file.errors);
        assert_eq!(file.modules[0].function_tables[0].function_indices, vec![0, 1]);
    }

    #[test]
    fn errors_carry_source_location() {
        let file = parse_file("(module\n  (memory))");
        assert!(!file.errors.is_empty());
        let err = &file.errors[0];
        assert_eq!(err.line, 2);
        assert!(err.to_string().contains("2:"));
    }

    #[test]
    fn import_forms_parse_both_kinds() {
        let file = parse_file(
            r#"(module
                (import $puts "puts" (param i32) (result i32))
                (import $top "STACKTOP" i32))"#,
        );
        assert!(file.errors.is_empty(), "errors: {:?}", file.errors);
        let module = &file.modules[0];
        assert_eq!(module.function_imports.len(), 1);
        assert_eq!(module.function_imports[0].name, "puts");
        assert_eq!(module.function_imports[0].ty.parameters, vec![TypeId::I32]);
        assert_eq!(module.variable_imports.len(), 1);
        assert_eq!(module.variable_imports[0].name, "STACKTOP");
        assert_eq!(module.globals.len(), 1);
    }

    #[test]
    fn assert_eq_forms_parse_into_records() {
        let file = parse_file(
            r#"(module
                (func $f (param i32) (result i32) (return (get_local 0)))
                (export "id" $f))
               (assert_eq (invoke "id" (const.i32 41)) (const.i32 41))"#,
        );
        assert!(file.errors.is_empty(), "errors: {:?}", file.errors);
        assert_eq!(file.assert_eqs.len(), 1);
        let assert_eq_record = &file.assert_eqs[0];
        assert_eq!(assert_eq_record.args, vec![Literal::I32(41)]);
        assert_eq!(assert_eq_record.expected, Literal::I32(41));
    }

    #[test]
    fn assert_eq_on_unknown_export_is_recorded() {
        let file = parse_file(r#"(assert_eq (invoke "nope") (const.i32 0))"#);
        assert!(
            file.errors
                .iter()
                .any(|e| e.message.contains("couldn't find export"))
        );
    }
}
