// src/frontend/parse_expr.rs
//
// Expression parsing for function bodies. Forms are either
// non-parametric (the opcode names its result type, e.g. `add.i32`) or
// parametric (the same opcode works in any type context, e.g. `if`,
// `call`, `get_local`). Non-parametric results are coerced to the type
// the context expects; the coercions here are the only implicit
// conversions in the language.

use rustc_hash::FxHashMap;

use crate::arena::{Arena, BranchTargetId, ExprId};
use crate::ast::expr::{
    BinaryOp, BoolBinaryOp, BoolUnaryOp, CallKind, CastOp, CmpOp, Expr, FloatBinaryOp,
    FloatUnaryOp, IntBinaryOp, IntUnaryOp, Literal, LoadOp, SwitchArm, UnaryOp, VarScope,
};
use crate::ast::module::{Function, FunctionImport, FunctionTable, Variable};
use crate::ast::types::{TypeClass, TypeId};
use crate::errors::ParseError;
use crate::frontend::parser::{build_name_map, parse_name_or_index};
use crate::frontend::sexpr::{Cursor, SNodeKind};
use crate::frontend::token::Locus;

pub(crate) struct FunctionContext<'m, 'e> {
    arena: &'m mut Arena,
    functions: &'m [Function],
    globals: &'m [Variable],
    function_imports: &'m [FunctionImport],
    function_tables: &'m [FunctionTable],
    function_index: usize,
    function_names: &'m FxHashMap<String, usize>,
    global_names: &'m FxHashMap<String, usize>,
    table_names: &'m FxHashMap<String, usize>,
    import_names: &'m FxHashMap<String, usize>,
    errors: &'e mut Vec<ParseError>,
    local_names: FxHashMap<String, usize>,
    labels: FxHashMap<String, BranchTargetId>,
    /// Innermost-last stack of anonymous label targets, addressed by
    /// depth from `break <n>`.
    scoped_targets: Vec<BranchTargetId>,
}

impl<'m, 'e> FunctionContext<'m, 'e> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        arena: &'m mut Arena,
        functions: &'m [Function],
        globals: &'m [Variable],
        function_imports: &'m [FunctionImport],
        function_tables: &'m [FunctionTable],
        function_index: usize,
        function_names: &'m FxHashMap<String, usize>,
        global_names: &'m FxHashMap<String, usize>,
        table_names: &'m FxHashMap<String, usize>,
        import_names: &'m FxHashMap<String, usize>,
        errors: &'e mut Vec<ParseError>,
    ) -> Self {
        let mut local_names = FxHashMap::default();
        build_name_map(&functions[function_index].locals, &mut local_names, errors);
        Self {
            arena,
            functions,
            globals,
            function_imports,
            function_tables,
            function_index,
            function_names,
            global_names,
            table_names,
            import_names,
            errors,
            local_names,
            labels: FxHashMap::default(),
            scoped_targets: Vec::new(),
        }
    }

    fn function(&self) -> &'m Function {
        &self.functions[self.function_index]
    }

    /// Record a diagnostic and produce the `Error` node that stands in
    /// for the failed expression.
    fn error_node(&mut self, locus: Locus, message: impl Into<String>) -> ExprId {
        let err = ParseError::new(locus, message);
        let node_message = err.node_message();
        self.errors.push(err);
        self.arena.alloc_expr(Expr::Error {
            message: node_message,
        })
    }

    /// Parse an expression of a known result type from the cursor's
    /// current node, advancing past it.
    pub fn parse_typed_expression(
        &mut self,
        ty: TypeId,
        cursor: &mut Cursor,
        context: &str,
    ) -> ExprId {
        // Reader errors become AST error nodes in place.
        if let Some(node) = cursor.peek()
            && let SNodeKind::Error(message) = &node.kind
        {
            let locus = node.locus;
            let message = message.clone();
            cursor.next();
            return self.error_node(locus, message);
        }

        if let Some((expr, actual_ty)) = self.parse_non_parametric(cursor) {
            let locus = cursor.locus();
            cursor.next();
            return self.coerce(ty, expr, actual_ty, locus, context);
        }

        if let Some(expr) = self.parse_parametric(ty, cursor) {
            cursor.next();
            return expr;
        }

        let locus = cursor.locus();
        let message = format!(
            "expected {} expression for {} but found {}",
            ty,
            context,
            cursor.describe()
        );
        cursor.next();
        self.error_node(locus, message)
    }

    /// Parse all remaining siblings as a sequence whose final
    /// expression has the given type. All but the last yield void.
    pub fn parse_expression_sequence(
        &mut self,
        ty: TypeId,
        cursor: Cursor,
        context: &str,
    ) -> ExprId {
        let num_ops = cursor.remaining();
        if num_ops == 0 {
            return self.error_node(cursor.locus(), "missing expression");
        }
        self.parse_expression_sequence_n(ty, cursor, context, num_ops)
    }

    fn parse_expression_sequence_n(
        &mut self,
        ty: TypeId,
        mut cursor: Cursor,
        context: &str,
        num_ops: usize,
    ) -> ExprId {
        if num_ops == 0 {
            // Only reachable for void contexts (empty fallthrough arms).
            if ty != TypeId::Void {
                return self.error_node(cursor.locus(), "missing expression");
            }
            return self.arena.alloc_expr(Expr::Nop);
        }
        if num_ops == 1 {
            return self.parse_typed_expression(ty, &mut cursor, context);
        }

        let mut result: Option<ExprId> = None;
        for _ in 0..num_ops - 1 {
            let expr = self.parse_typed_expression(TypeId::Void, &mut cursor, context);
            result = Some(match result {
                Some(prev) => self.arena.alloc_expr(Expr::Sequence {
                    void_expr: prev,
                    result_expr: expr,
                }),
                None => expr,
            });
        }
        let final_expr = self.parse_typed_expression(ty, &mut cursor, context);
        self.arena.alloc_expr(Expr::Sequence {
            void_expr: result.unwrap(),
            result_expr: final_expr,
        })
    }

    /// Coerce an expression of a known type to the type the context
    /// expects. The full table:
    ///   same/same        -> identity
    ///   void <- non-void -> DiscardResult
    ///   bool <- integer  -> Comparison(ne, v, 0)
    ///   int  <- bool     -> Cast(reinterpretBool)
    ///   anything else    -> type error
    fn coerce(
        &mut self,
        expected: TypeId,
        expr: ExprId,
        actual: TypeId,
        locus: Locus,
        context: &str,
    ) -> ExprId {
        if expected == actual {
            return expr;
        }
        match expected.class() {
            TypeClass::Void => self.arena.alloc_expr(Expr::DiscardResult {
                expr_type: actual,
                expr,
            }),
            TypeClass::Bool if actual.is_int() => {
                let zero = self.arena.alloc_expr(Expr::Literal(match actual {
                    TypeId::I8 => Literal::I8(0),
                    TypeId::I16 => Literal::I16(0),
                    TypeId::I32 => Literal::I32(0),
                    _ => Literal::I64(0),
                }));
                self.arena.alloc_expr(Expr::Comparison {
                    op: CmpOp::Ne,
                    operand_type: actual,
                    left: expr,
                    right: zero,
                })
            }
            TypeClass::Int if actual == TypeId::Bool => self.arena.alloc_expr(Expr::Cast {
                op: CastOp::ReinterpretBool,
                source_type: TypeId::Bool,
                source: expr,
            }),
            _ => self.error_node(
                locus,
                format!(
                    "type error: expecting a {} {} but found {}",
                    expected, context, actual
                ),
            ),
        }
    }

    /// After a form is fully parsed, every child must have been
    /// consumed.
    fn require_full_match(&mut self, cursor: &Cursor, context: &str, result: ExprId) -> ExprId {
        if cursor.done() {
            result
        } else {
            self.error_node(
                cursor.locus(),
                format!("unexpected input following {}", context),
            )
        }
    }

    // --- non-parametric forms -------------------------------------------

    /// Try to parse the cursor's current node as a non-parametric
    /// expression. Returns the node and its opcode-determined type, or
    /// None if the head symbol is not a non-parametric opcode. Does not
    /// advance the cursor.
    fn parse_non_parametric(&mut self, cursor: &Cursor) -> Option<(ExprId, TypeId)> {
        let mut children = cursor.as_tree()?;
        let symbol = children.parse_symbol()?.to_string();
        let mut parts = symbol.split('.');
        let base = parts.next().unwrap();
        let suffix1 = parts.next();
        let suffix2 = parts.next();
        if parts.next().is_some() {
            return None;
        }

        match (base, suffix1, suffix2) {
            ("nop", None, None) => {
                let nop = self.arena.alloc_expr(Expr::Nop);
                Some((self.require_full_match(&children, "nop", nop), TypeId::Void))
            }
            ("const", Some(ty), None) => {
                let ty = TypeId::from_name(ty)?;
                Some(self.parse_const(ty, children))
            }
            ("load", Some(suffix), None) => self.parse_load(suffix, false, children),
            ("load_far", Some(suffix), None) => self.parse_load(suffix, true, children),
            ("store", Some(suffix), None) => self.parse_store(suffix, false, children),
            ("store_far", Some(suffix), None) => self.parse_store(suffix, true, children),
            (_, Some(_), Some(_)) => self.parse_cast(base, suffix1?, suffix2?, children),
            (_, Some(ty), None) => {
                let ty = TypeId::from_name(ty)?;
                self.parse_op(base, ty, children)
            }
            _ => None,
        }
    }

    fn parse_const(&mut self, ty: TypeId, mut children: Cursor) -> (ExprId, TypeId) {
        let lit = match ty {
            TypeId::I8 | TypeId::I16 | TypeId::I32 | TypeId::I64 => {
                let Some(value) = children.parse_int() else {
                    return (
                        self.error_node(children.locus(), "const: expected integer"),
                        ty,
                    );
                };
                match ty {
                    TypeId::I8 => Literal::I8(value as u8),
                    TypeId::I16 => Literal::I16(value as u16),
                    TypeId::I32 => Literal::I32(value as u32),
                    _ => Literal::I64(value as u64),
                }
            }
            TypeId::F32 | TypeId::F64 => {
                let Some(value) = children.parse_decimal() else {
                    return (
                        self.error_node(children.locus(), "const: expected decimal"),
                        ty,
                    );
                };
                if ty == TypeId::F32 {
                    Literal::F32(value as f32)
                } else {
                    Literal::F64(value)
                }
            }
            TypeId::Bool => {
                let Some(value) = children.parse_int() else {
                    return (
                        self.error_node(children.locus(), "const: expected 0 or 1"),
                        ty,
                    );
                };
                Literal::Bool(value != 0)
            }
            _ => {
                return (
                    self.error_node(children.locus(), "const: type cannot carry a literal"),
                    TypeId::I32,
                );
            }
        };
        let node = self.arena.alloc_expr(Expr::Literal(lit));
        (self.require_full_match(&children, "const", node), ty)
    }

    /// `load.<memty>[_s|_u]`. Sub-width integer loads widen to i32.
    fn parse_load(
        &mut self,
        suffix: &str,
        far: bool,
        mut children: Cursor,
    ) -> Option<(ExprId, TypeId)> {
        let (memory_type, load_op, result_type) = match suffix {
            "i8_s" => (TypeId::I8, LoadOp::SignExtend, TypeId::I32),
            "i8_u" => (TypeId::I8, LoadOp::ZeroExtend, TypeId::I32),
            "i16_s" => (TypeId::I16, LoadOp::SignExtend, TypeId::I32),
            "i16_u" => (TypeId::I16, LoadOp::ZeroExtend, TypeId::I32),
            "i32" => (TypeId::I32, LoadOp::Plain, TypeId::I32),
            "i64" => (TypeId::I64, LoadOp::Plain, TypeId::I64),
            "f32" => (TypeId::F32, LoadOp::Plain, TypeId::F32),
            "f64" => (TypeId::F64, LoadOp::Plain, TypeId::F64),
            _ => return None,
        };
        let address_type = if far { TypeId::I64 } else { TypeId::I32 };
        let address = self.parse_typed_expression(address_type, &mut children, "load address");
        let node = self.arena.alloc_expr(Expr::Load {
            memory_type,
            load_op,
            far,
            address,
        });
        Some((self.require_full_match(&children, "load", node), result_type))
    }

    /// `store.<memty>`. Sub-width integer stores truncate an i32 value.
    fn parse_store(
        &mut self,
        suffix: &str,
        far: bool,
        mut children: Cursor,
    ) -> Option<(ExprId, TypeId)> {
        let (memory_type, value_type) = match suffix {
            "i8" => (TypeId::I8, TypeId::I32),
            "i16" => (TypeId::I16, TypeId::I32),
            "i32" => (TypeId::I32, TypeId::I32),
            "i64" => (TypeId::I64, TypeId::I64),
            "f32" => (TypeId::F32, TypeId::F32),
            "f64" => (TypeId::F64, TypeId::F64),
            _ => return None,
        };
        let address_type = if far { TypeId::I64 } else { TypeId::I32 };
        let address = self.parse_typed_expression(address_type, &mut children, "store address");
        let value = self.parse_typed_expression(value_type, &mut children, "store value");
        let node = self.arena.alloc_expr(Expr::Store {
            memory_type,
            value_type,
            far,
            address,
            value,
        });
        Some((self.require_full_match(&children, "store", node), TypeId::Void))
    }

    /// Single-type-suffix opcodes: unary, binary, and comparison forms.
    fn parse_op(
        &mut self,
        base: &str,
        ty: TypeId,
        children: Cursor,
    ) -> Option<(ExprId, TypeId)> {
        if matches!(ty, TypeId::Void | TypeId::None) {
            return None;
        }

        // Unary
        let unary = match (base, ty.class()) {
            ("neg", TypeClass::Int) => Some(UnaryOp::Int(IntUnaryOp::Neg)),
            ("abs", TypeClass::Int) => Some(UnaryOp::Int(IntUnaryOp::Abs)),
            ("not", TypeClass::Int) => Some(UnaryOp::Int(IntUnaryOp::BitwiseNot)),
            ("clz", TypeClass::Int) => Some(UnaryOp::Int(IntUnaryOp::Clz)),
            ("ctz", TypeClass::Int) => Some(UnaryOp::Int(IntUnaryOp::Ctz)),
            ("popcnt", TypeClass::Int) => Some(UnaryOp::Int(IntUnaryOp::Popcnt)),
            ("neg", TypeClass::Float) => Some(UnaryOp::Float(FloatUnaryOp::Neg)),
            ("abs", TypeClass::Float) => Some(UnaryOp::Float(FloatUnaryOp::Abs)),
            ("ceil", TypeClass::Float) => Some(UnaryOp::Float(FloatUnaryOp::Ceil)),
            ("floor", TypeClass::Float) => Some(UnaryOp::Float(FloatUnaryOp::Floor)),
            ("trunc", TypeClass::Float) => Some(UnaryOp::Float(FloatUnaryOp::Trunc)),
            ("nearest", TypeClass::Float) => Some(UnaryOp::Float(FloatUnaryOp::NearestInt)),
            ("sqrt", TypeClass::Float) => Some(UnaryOp::Float(FloatUnaryOp::Sqrt)),
            ("not", TypeClass::Bool) => Some(UnaryOp::Bool(BoolUnaryOp::BitwiseNot)),
            _ => None,
        };
        if let Some(op) = unary {
            return Some(self.parse_unary(op, ty, children));
        }

        // Binary
        let binary = match (base, ty.class()) {
            ("add", TypeClass::Int) => Some(BinaryOp::Int(IntBinaryOp::Add)),
            ("sub", TypeClass::Int) => Some(BinaryOp::Int(IntBinaryOp::Sub)),
            ("mul", TypeClass::Int) => Some(BinaryOp::Int(IntBinaryOp::Mul)),
            ("div_s", TypeClass::Int) => Some(BinaryOp::Int(IntBinaryOp::DivS)),
            ("div_u", TypeClass::Int) => Some(BinaryOp::Int(IntBinaryOp::DivU)),
            ("rem_s", TypeClass::Int) => Some(BinaryOp::Int(IntBinaryOp::RemS)),
            ("rem_u", TypeClass::Int) => Some(BinaryOp::Int(IntBinaryOp::RemU)),
            ("and", TypeClass::Int) => Some(BinaryOp::Int(IntBinaryOp::BitwiseAnd)),
            ("or", TypeClass::Int) => Some(BinaryOp::Int(IntBinaryOp::BitwiseOr)),
            ("xor", TypeClass::Int) => Some(BinaryOp::Int(IntBinaryOp::BitwiseXor)),
            ("shl", TypeClass::Int) => Some(BinaryOp::Int(IntBinaryOp::Shl)),
            ("shr_s", TypeClass::Int) => Some(BinaryOp::Int(IntBinaryOp::ShrSExt)),
            ("shr_u", TypeClass::Int) => Some(BinaryOp::Int(IntBinaryOp::ShrZExt)),
            ("add", TypeClass::Float) => Some(BinaryOp::Float(FloatBinaryOp::Add)),
            ("sub", TypeClass::Float) => Some(BinaryOp::Float(FloatBinaryOp::Sub)),
            ("mul", TypeClass::Float) => Some(BinaryOp::Float(FloatBinaryOp::Mul)),
            ("div", TypeClass::Float) => Some(BinaryOp::Float(FloatBinaryOp::Div)),
            ("rem", TypeClass::Float) => Some(BinaryOp::Float(FloatBinaryOp::Rem)),
            ("min", TypeClass::Float) => Some(BinaryOp::Float(FloatBinaryOp::Min)),
            ("max", TypeClass::Float) => Some(BinaryOp::Float(FloatBinaryOp::Max)),
            ("copysign", TypeClass::Float) => Some(BinaryOp::Float(FloatBinaryOp::CopySign)),
            ("and", TypeClass::Bool) => Some(BinaryOp::Bool(BoolBinaryOp::BitwiseAnd)),
            ("or", TypeClass::Bool) => Some(BinaryOp::Bool(BoolBinaryOp::BitwiseOr)),
            _ => None,
        };
        if let Some(op) = binary {
            return Some(self.parse_binary(op, ty, children));
        }

        // Comparison
        let cmp = match (base, ty.class()) {
            ("eq", _) => Some(CmpOp::Eq),
            ("ne", _) => Some(CmpOp::Ne),
            ("lt_s", TypeClass::Int) => Some(CmpOp::LtS),
            ("lt_u", TypeClass::Int) => Some(CmpOp::LtU),
            ("le_s", TypeClass::Int) => Some(CmpOp::LeS),
            ("le_u", TypeClass::Int) => Some(CmpOp::LeU),
            ("gt_s", TypeClass::Int) => Some(CmpOp::GtS),
            ("gt_u", TypeClass::Int) => Some(CmpOp::GtU),
            ("ge_s", TypeClass::Int) => Some(CmpOp::GeS),
            ("ge_u", TypeClass::Int) => Some(CmpOp::GeU),
            ("lt", TypeClass::Float) => Some(CmpOp::Lt),
            ("le", TypeClass::Float) => Some(CmpOp::Le),
            ("gt", TypeClass::Float) => Some(CmpOp::Gt),
            ("ge", TypeClass::Float) => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = cmp {
            return Some(self.parse_comparison(op, ty, children));
        }

        None
    }

    fn parse_unary(&mut self, op: UnaryOp, ty: TypeId, mut children: Cursor) -> (ExprId, TypeId) {
        let operand = self.parse_typed_expression(ty, &mut children, "unary operand");
        let node = self.arena.alloc_expr(Expr::Unary { op, operand });
        (self.require_full_match(&children, "unary operator", node), ty)
    }

    fn parse_binary(&mut self, op: BinaryOp, ty: TypeId, mut children: Cursor) -> (ExprId, TypeId) {
        let left = self.parse_typed_expression(ty, &mut children, "binary left operand");
        let right = self.parse_typed_expression(ty, &mut children, "binary right operand");
        let node = self.arena.alloc_expr(Expr::Binary { op, left, right });
        (self.require_full_match(&children, "binary operator", node), ty)
    }

    fn parse_comparison(
        &mut self,
        op: CmpOp,
        operand_type: TypeId,
        mut children: Cursor,
    ) -> (ExprId, TypeId) {
        let left = self.parse_typed_expression(operand_type, &mut children, "comparison left operand");
        let right =
            self.parse_typed_expression(operand_type, &mut children, "comparison right operand");
        let node = self.arena.alloc_expr(Expr::Comparison {
            op,
            operand_type,
            left,
            right,
        });
        (self.require_full_match(&children, op.name(), node), TypeId::Bool)
    }

    /// Bi-typed cast forms: `<op>.<dest>.<source>`.
    fn parse_cast(
        &mut self,
        base: &str,
        dest: &str,
        source: &str,
        mut children: Cursor,
    ) -> Option<(ExprId, TypeId)> {
        let dest = TypeId::from_name(dest)?;
        let source_type = TypeId::from_name(source)?;

        let op = match base {
            "wrap" if dest.is_int() && source_type.is_int()
                && dest.byte_width() < source_type.byte_width() =>
            {
                CastOp::Wrap
            }
            "extend_s" if dest.is_int() && source_type.is_int()
                && dest.byte_width() > source_type.byte_width() =>
            {
                CastOp::SExt
            }
            "extend_u" if dest.is_int() && source_type.is_int()
                && dest.byte_width() > source_type.byte_width() =>
            {
                CastOp::ZExt
            }
            "trunc_s"
                if matches!(dest, TypeId::I32 | TypeId::I64) && source_type.is_float() =>
            {
                CastOp::TruncSignedFloat
            }
            "trunc_u"
                if matches!(dest, TypeId::I32 | TypeId::I64) && source_type.is_float() =>
            {
                CastOp::TruncUnsignedFloat
            }
            "convert_s" if dest.is_float() && source_type.is_int() => CastOp::ConvertSignedInt,
            "convert_u" if dest.is_float() && source_type.is_int() => CastOp::ConvertUnsignedInt,
            "demote" if dest == TypeId::F32 && source_type == TypeId::F64 => CastOp::Demote,
            "promote" if dest == TypeId::F64 && source_type == TypeId::F32 => CastOp::Promote,
            "reinterpret" => match (dest, source_type) {
                (TypeId::F32, TypeId::I32) | (TypeId::F64, TypeId::I64) => CastOp::ReinterpretInt,
                (TypeId::I32, TypeId::F32) | (TypeId::I64, TypeId::F64) => CastOp::ReinterpretFloat,
                (d, TypeId::Bool) if d.is_int() => CastOp::ReinterpretBool,
                _ => return None,
            },
            _ => return None,
        };

        let source_expr = self.parse_typed_expression(source_type, &mut children, "cast source");
        let node = self.arena.alloc_expr(Expr::Cast {
            op,
            source_type,
            source: source_expr,
        });
        Some((self.require_full_match(&children, base, node), dest))
    }

    // --- parametric forms -----------------------------------------------

    /// Try to parse the cursor's current node as a parametric
    /// expression of the given result type. Does not advance.
    fn parse_parametric(&mut self, ty: TypeId, cursor: &Cursor) -> Option<ExprId> {
        let mut children = cursor.as_tree()?;
        let symbol = children.parse_symbol()?.to_string();
        let (base, suffix) = match symbol.split_once('.') {
            Some((base, suffix)) => (base, Some(suffix)),
            None => (symbol.as_str(), None),
        };

        Some(match (base, suffix) {
            ("switch", Some(key)) => {
                let key_type = TypeId::from_name(key).filter(|t| t.is_int())?;
                self.parse_switch(ty, key_type, children)
            }
            ("if", None) => self.parse_if(ty, children),
            ("loop", None) => self.parse_loop(ty, children),
            ("break", None) => self.parse_break(children),
            ("return", None) => self.parse_return(children),
            ("call", None) => self.parse_call(ty, children, cursor.locus()),
            ("call_import", None) => self.parse_call_import(ty, children, cursor.locus()),
            ("call_indirect", None) => self.parse_call_indirect(ty, children, cursor.locus()),
            ("label", None) => self.parse_label(ty, children),
            ("block", None) => self.parse_expression_sequence(ty, children, "block body"),
            ("get_local", None) => {
                self.parse_get_variable(ty, VarScope::Local, children)
            }
            ("set_local", None) => {
                self.parse_set_variable(ty, VarScope::Local, children)
            }
            ("load_global", None) => {
                self.parse_get_variable(ty, VarScope::Global, children)
            }
            ("store_global", None) => {
                self.parse_set_variable(ty, VarScope::Global, children)
            }
            _ => return None,
        })
    }

    fn parse_switch(&mut self, ty: TypeId, key_type: TypeId, mut children: Cursor) -> ExprId {
        // Optional label for the switch end target.
        let end_label = children.parse_name().map(str::to_string);
        if let Some(name) = &end_label
            && self.labels.contains_key(name)
        {
            return self.error_node(
                children.locus(),
                "switch: break label name shadows outer label",
            );
        }
        let end_target = self.arena.alloc_target(ty);

        let key = self.parse_typed_expression(key_type, &mut children, "switch key");

        if let Some(name) = &end_label {
            self.labels.insert(name.clone(), end_target);
        }

        // Parse the cases.
        let mut arms: Vec<SwitchArm> = Vec::new();
        while !children.done() {
            let Some(mut case) = children.as_tagged("case") else {
                break;
            };
            let Some(key_value) = case.parse_int() else {
                let err =
                    self.error_node(case.locus(), "switch: missing integer case key");
                if let Some(name) = &end_label {
                    self.labels.remove(name);
                }
                return err;
            };

            // Count the operations in the case and whether it ends with
            // a `fallthrough` symbol. No operations also falls through.
            let mut num_ops = 0;
            let mut fallthrough = true;
            let mut scan = case;
            let mut bad_fallthrough = false;
            while let Some(node) = scan.peek() {
                if matches!(&node.kind, SNodeKind::Symbol(s) if s == "fallthrough") {
                    fallthrough = true;
                    scan.next();
                    if !scan.done() {
                        bad_fallthrough = true;
                    }
                    break;
                }
                num_ops += 1;
                fallthrough = false;
                scan.next();
            }
            if bad_fallthrough {
                let err = self.error_node(
                    case.locus(),
                    "switch: expected fallthrough to be the final symbol in the case",
                );
                if let Some(name) = &end_label {
                    self.labels.remove(name);
                }
                return err;
            }

            let value = if fallthrough {
                // Fallthrough cases yield void and run into the next arm.
                self.parse_expression_sequence_n(TypeId::Void, case, "switch case body", num_ops)
            } else {
                // Other cases end the switch: evaluate to the switch's
                // result type and branch to the end target.
                let arm_value =
                    self.parse_expression_sequence_n(ty, case, "switch case body", num_ops);
                if ty != TypeId::Void {
                    self.arena.alloc_expr(Expr::Branch {
                        target: end_target,
                        value: Some(arm_value),
                    })
                } else {
                    let branch = self.arena.alloc_expr(Expr::Branch {
                        target: end_target,
                        value: None,
                    });
                    self.arena.alloc_expr(Expr::Sequence {
                        void_expr: arm_value,
                        result_expr: branch,
                    })
                }
            };
            arms.push(SwitchArm {
                key: key_value as u64,
                value,
            });
            children.next();
        }

        // The default arm is the final expression, of the switch's type.
        let default_value =
            self.parse_typed_expression(ty, &mut children, "switch default value");
        arms.push(SwitchArm {
            key: 0,
            value: default_value,
        });

        if let Some(name) = &end_label {
            self.labels.remove(name);
        }

        let default_arm_index = (arms.len() - 1) as u32;
        let (arms_start, arms_len) = self.arena.alloc_arms(arms);
        let node = self.arena.alloc_expr(Expr::Switch {
            key,
            key_type,
            arms_start,
            arms_len,
            default_arm_index,
            end_target,
        });
        self.require_full_match(&children, "switch", node)
    }

    fn parse_if(&mut self, ty: TypeId, mut children: Cursor) -> ExprId {
        let condition = self.parse_typed_expression(TypeId::Bool, &mut children, "if condition");
        let then_expr = self.parse_typed_expression(ty, &mut children, "if then");

        let else_expr = if !children.done() {
            self.parse_typed_expression(ty, &mut children, "if else")
        } else if ty == TypeId::Void {
            self.arena.alloc_expr(Expr::Nop)
        } else {
            self.error_node(children.locus(), "if without else used as value")
        };

        let node = self.arena.alloc_expr(Expr::IfElse {
            condition,
            then_expr,
            else_expr,
        });
        self.require_full_match(&children, "if", node)
    }

    fn parse_loop(&mut self, ty: TypeId, mut children: Cursor) -> ExprId {
        let break_target = self.arena.alloc_target(ty);
        let continue_target = self.arena.alloc_target(TypeId::Void);

        // Optional break and continue label names.
        let break_label = children.parse_name().map(str::to_string);
        let continue_label = children.parse_name().map(str::to_string);
        if let Some(name) = &break_label {
            if self.labels.contains_key(name) {
                return self.error_node(
                    children.locus(),
                    "loop: break label name shadows outer label",
                );
            }
            self.labels.insert(name.clone(), break_target);
        }
        if let Some(name) = &continue_label {
            if self.labels.contains_key(name) {
                return self.error_node(
                    children.locus(),
                    "loop: continue label name shadows outer label",
                );
            }
            self.labels.insert(name.clone(), continue_target);
        }

        let body = self.parse_expression_sequence(TypeId::Void, children, "loop body");

        if let Some(name) = &break_label {
            self.labels.remove(name);
        }
        if let Some(name) = &continue_label {
            self.labels.remove(name);
        }

        self.arena.alloc_expr(Expr::Loop {
            body,
            break_target,
            continue_target,
        })
    }

    fn parse_break(&mut self, mut children: Cursor) -> ExprId {
        // Target by depth index, by label name, or innermost by default.
        let target = {
            let mut attempt = children;
            if let Some(depth) = attempt.parse_int() {
                if depth >= 0 && (depth as usize) < self.scoped_targets.len() {
                    children = attempt;
                    Some(self.scoped_targets[self.scoped_targets.len() - 1 - depth as usize])
                } else {
                    None
                }
            } else if let Some(name) = attempt.parse_name() {
                let found = self.labels.get(name).copied();
                if found.is_some() {
                    children = attempt;
                }
                found
            } else {
                self.scoped_targets.last().copied()
            }
        };
        let Some(target) = target else {
            return self.error_node(children.locus(), "break: expected label name or index");
        };

        // A branch to a non-void target carries a value.
        let target_type = self.arena.target_type(target);
        let value = if target_type == TypeId::Void {
            None
        } else {
            Some(self.parse_typed_expression(target_type, &mut children, "break value"))
        };

        let node = self.arena.alloc_expr(Expr::Branch { target, value });
        self.require_full_match(&children, "break", node)
    }

    fn parse_return(&mut self, mut children: Cursor) -> ExprId {
        let return_type = self.function().ty.return_type;
        let value = if return_type == TypeId::Void {
            None
        } else {
            Some(self.parse_typed_expression(return_type, &mut children, "return value"))
        };
        let node = self.arena.alloc_expr(Expr::Return { value });
        self.require_full_match(&children, "return", node)
    }

    fn parse_call(&mut self, ty: TypeId, mut children: Cursor, locus: Locus) -> ExprId {
        let Some(function_index) =
            parse_name_or_index(&mut children, self.function_names, self.functions.len())
        else {
            return self.error_node(children.locus(), "call: expected function name or index");
        };

        let callee_type = self.functions[function_index].ty.clone();
        let args = self.parse_call_args(&callee_type.parameters, &mut children, "call parameter");
        let (args_start, args_len) = self.arena.alloc_args(args);
        let call = self.arena.alloc_expr(Expr::Call {
            kind: CallKind::Direct,
            index: function_index,
            args_start,
            args_len,
        });

        let result = self.coerce(ty, call, callee_type.return_type, locus, "call return value");
        self.require_full_match(&children, "call", result)
    }

    fn parse_call_import(&mut self, ty: TypeId, mut children: Cursor, locus: Locus) -> ExprId {
        let Some(import_index) =
            parse_name_or_index(&mut children, self.import_names, self.function_imports.len())
        else {
            return self.error_node(
                children.locus(),
                "call_import: expected function import name or index",
            );
        };

        let import_type = self.function_imports[import_index].ty.clone();
        let args =
            self.parse_call_args(&import_type.parameters, &mut children, "call_import parameter");
        let (args_start, args_len) = self.arena.alloc_args(args);
        let call = self.arena.alloc_expr(Expr::Call {
            kind: CallKind::Import,
            index: import_index,
            args_start,
            args_len,
        });

        let result = self.coerce(
            ty,
            call,
            import_type.return_type,
            locus,
            "call_import return value",
        );
        self.require_full_match(&children, "call_import", result)
    }

    fn parse_call_indirect(&mut self, ty: TypeId, mut children: Cursor, locus: Locus) -> ExprId {
        let Some(table_index) =
            parse_name_or_index(&mut children, self.table_names, self.function_tables.len())
        else {
            return self.error_node(
                children.locus(),
                "call_indirect: expected function table index",
            );
        };

        let index_expr =
            self.parse_typed_expression(TypeId::I32, &mut children, "call_indirect function");

        let table_type = self.function_tables[table_index].ty.clone();
        let args = self.parse_call_args(
            &table_type.parameters,
            &mut children,
            "call_indirect parameter",
        );
        let (args_start, args_len) = self.arena.alloc_args(args);
        let call = self.arena.alloc_expr(Expr::CallIndirect {
            table_index,
            index_expr,
            args_start,
            args_len,
        });

        let result = self.coerce(
            ty,
            call,
            table_type.return_type,
            locus,
            "call_indirect return value",
        );
        self.require_full_match(&children, "call_indirect", result)
    }

    fn parse_call_args(
        &mut self,
        parameters: &[TypeId],
        children: &mut Cursor,
        context: &str,
    ) -> Vec<ExprId> {
        parameters
            .iter()
            .map(|&param_ty| self.parse_typed_expression(param_ty, children, context))
            .collect()
    }

    fn parse_label(&mut self, ty: TypeId, mut children: Cursor) -> ExprId {
        let name = children.parse_name().map(str::to_string);
        if let Some(name) = &name
            && self.labels.contains_key(name)
        {
            return self.error_node(children.locus(), "label: name shadows outer label");
        }

        let end_target = self.arena.alloc_target(ty);
        if let Some(name) = &name {
            self.labels.insert(name.clone(), end_target);
        }
        self.scoped_targets.push(end_target);

        let body = self.parse_expression_sequence(ty, children, "label body");

        self.scoped_targets.pop();
        if let Some(name) = &name {
            self.labels.remove(name);
        }

        self.arena.alloc_expr(Expr::Label { end_target, body })
    }

    fn parse_get_variable(&mut self, ty: TypeId, scope: VarScope, mut children: Cursor) -> ExprId {
        let locus = children.locus();
        let Some((index, variable_type)) = self.resolve_variable(scope, &mut children) else {
            let message = match scope {
                VarScope::Local => "get_local: expected local name or index",
                VarScope::Global => "load_global: expected global name or index",
            };
            return self.error_node(locus, message);
        };
        let node = self.arena.alloc_expr(Expr::GetVariable { scope, index });
        let result = self.coerce(ty, node, variable_type, locus, "variable");
        self.require_full_match(&children, "variable", result)
    }

    fn parse_set_variable(&mut self, ty: TypeId, scope: VarScope, mut children: Cursor) -> ExprId {
        let locus = children.locus();
        let Some((index, variable_type)) = self.resolve_variable(scope, &mut children) else {
            let message = match scope {
                VarScope::Local => "set_local: expected local name or index",
                VarScope::Global => "store_global: expected global name or index",
            };
            return self.error_node(locus, message);
        };
        let value = self.parse_typed_expression(variable_type, &mut children, "store value");
        let node = self.arena.alloc_expr(Expr::SetVariable {
            scope,
            index,
            value,
        });
        let result = self.coerce(ty, node, TypeId::Void, locus, "variable");
        self.require_full_match(&children, "variable", result)
    }

    fn resolve_variable(
        &mut self,
        scope: VarScope,
        children: &mut Cursor,
    ) -> Option<(usize, TypeId)> {
        match scope {
            VarScope::Local => {
                let locals = &self.function().locals;
                let index = parse_name_or_index(children, &self.local_names, locals.len())?;
                Some((index, locals[index].ty))
            }
            VarScope::Global => {
                let index = parse_name_or_index(children, self.global_names, self.globals.len())?;
                Some((index, self.globals[index].ty))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::expr::{CmpOp, Expr};
    use crate::ast::types::TypeId;
    use crate::frontend::parse_file;

    fn body_of(source: &str) -> (crate::ast::Module, crate::arena::ExprId) {
        let mut file = parse_file(source);
        assert!(file.errors.is_empty(), "errors: {:?}", file.errors);
        let module = file.modules.remove(0);
        let body = module.functions[0].body.unwrap();
        (module, body)
    }

    #[test]
    fn int_coerces_to_bool_via_ne_zero() {
        let (module, body) = body_of(
            "(module (func $f (param i32) (result i32)
                (return (if (get_local 0) (const.i32 1) (const.i32 2)))))",
        );
        let Expr::Return { value: Some(v) } = module.arena.expr(body) else {
            panic!("expected return");
        };
        let Expr::IfElse { condition, .. } = module.arena.expr(*v) else {
            panic!("expected if");
        };
        let Expr::Comparison {
            op, operand_type, ..
        } = module.arena.expr(*condition)
        else {
            panic!("expected synthesized comparison, got {:?}", module.arena.expr(*condition));
        };
        assert_eq!(*op, CmpOp::Ne);
        assert_eq!(*operand_type, TypeId::I32);
    }

    #[test]
    fn discarded_expression_is_wrapped() {
        let (module, body) = body_of(
            "(module (func $f
                (block (const.i32 3) (nop))))",
        );
        let Expr::Sequence { void_expr, .. } = module.arena.expr(body) else {
            panic!("expected sequence, got {:?}", module.arena.expr(body));
        };
        assert!(matches!(
            module.arena.expr(*void_expr),
            Expr::DiscardResult {
                expr_type: TypeId::I32,
                ..
            }
        ));
    }

    #[test]
    fn bool_coerces_to_int_via_reinterpret() {
        let (module, body) = body_of(
            "(module (func $f (result i32)
                (return (eq.i32 (const.i32 1) (const.i32 1)))))",
        );
        let Expr::Return { value: Some(v) } = module.arena.expr(body) else {
            panic!("expected return");
        };
        assert!(matches!(
            module.arena.expr(*v),
            Expr::Cast {
                op: crate::ast::CastOp::ReinterpretBool,
                ..
            }
        ));
    }

    #[test]
    fn type_mismatch_records_error_with_locus() {
        let file = parse_file(
            "(module (func $f (result f32)\n  (return (const.i32 1))))",
        );
        assert!(!file.errors.is_empty());
        assert!(file.errors[0].to_string().contains("type error"));
        assert_eq!(file.errors[0].line, 2);
    }

    #[test]
    fn break_targets_enclosing_label_by_identity() {
        let (module, body) = body_of(
            "(module (func $f
                (label $exit (block (break $exit) (nop)))))",
        );
        let Expr::Label { end_target, body: label_body } = module.arena.expr(body) else {
            panic!("expected label, got {:?}", module.arena.expr(body));
        };
        let Expr::Sequence { void_expr, .. } = module.arena.expr(*label_body) else {
            panic!("expected sequence");
        };
        let Expr::Branch { target, value } = module.arena.expr(*void_expr) else {
            panic!("expected branch, got {:?}", module.arena.expr(*void_expr));
        };
        assert_eq!(target, end_target);
        assert!(value.is_none());
    }

    #[test]
    fn break_by_depth_resolves_to_same_target_as_name() {
        let (module, body) = body_of(
            "(module (func $f
                (label $exit (block (break 0) (nop)))))",
        );
        let Expr::Label { end_target, body: label_body } = module.arena.expr(body) else {
            panic!("expected label");
        };
        let Expr::Sequence { void_expr, .. } = module.arena.expr(*label_body) else {
            panic!("expected sequence");
        };
        let Expr::Branch { target, .. } = module.arena.expr(*void_expr) else {
            panic!("expected branch");
        };
        assert_eq!(target, end_target);
    }

    #[test]
    fn label_shadowing_is_an_error() {
        let file = parse_file(
            "(module (func $f
                (label $l (label $l (nop)))))",
        );
        assert!(file.errors.iter().any(|e| e.message.contains("shadows")));
    }

    #[test]
    fn switch_arms_branch_to_end_target() {
        let (module, body) = body_of(
            "(module (func $f (param i32) (result i32)
                (return (switch.i32 (get_local 0)
                    (case 0 (const.i32 10))
                    (case 1 (const.i32 20))
                    (const.i32 99)))))",
        );
        let Expr::Return { value: Some(v) } = module.arena.expr(body) else {
            panic!("expected return");
        };
        let Expr::Switch {
            arms_start,
            arms_len,
            default_arm_index,
            end_target,
            ..
        } = module.arena.expr(*v)
        else {
            panic!("expected switch, got {:?}", module.arena.expr(*v));
        };
        assert_eq!(*arms_len, 3);
        assert_eq!(*default_arm_index, 2);
        let arms: Vec<_> = module.arena.arms(*arms_start, *arms_len).to_vec();
        assert_eq!(arms[0].key, 0);
        assert_eq!(arms[1].key, 1);
        // Non-default arms end in a branch to the switch's end target.
        for arm in &arms[..2] {
            let Expr::Branch { target, value } = module.arena.expr(arm.value) else {
                panic!("expected branch arm");
            };
            assert_eq!(target, end_target);
            assert!(value.is_some());
        }
    }

    #[test]
    fn switch_fallthrough_arm_yields_void() {
        let (module, body) = body_of(
            "(module (func $f (param i32) (result i32)
                (return (switch.i32 (get_local 0)
                    (case 0 fallthrough)
                    (case 1 (const.i32 20))
                    (const.i32 99)))))",
        );
        let Expr::Return { value: Some(v) } = module.arena.expr(body) else {
            panic!("expected return");
        };
        let Expr::Switch {
            arms_start, arms_len, ..
        } = module.arena.expr(*v)
        else {
            panic!("expected switch");
        };
        let arms = module.arena.arms(*arms_start, *arms_len);
        // Empty fallthrough arm parses to a nop.
        assert!(matches!(module.arena.expr(arms[0].value), Expr::Nop));
    }

    #[test]
    fn loop_break_carries_no_value_for_void_target() {
        let (module, body) = body_of(
            "(module (func $f (local $i i32)
                (loop $done $next
                    (break $done))))",
        );
        let Expr::Loop { break_target, .. } = module.arena.expr(body) else {
            panic!("expected loop, got {:?}", module.arena.expr(body));
        };
        assert_eq!(module.arena.target_type(*break_target), TypeId::Void);
    }

    #[test]
    fn call_arguments_follow_the_signature() {
        let (module, body) = body_of(
            "(module
                (func $add (param i32 i32) (result i32)
                    (return (add.i32 (get_local 0) (get_local 1))))
                (func $f (result i32)
                    (return (call $add (const.i32 1) (const.i32 2)))))",
        );
        // functions[0] is $add; body here is its own; check $f instead.
        let _ = body;
        let f_body = module.functions[1].body.unwrap();
        let Expr::Return { value: Some(v) } = module.arena.expr(f_body) else {
            panic!("expected return");
        };
        let Expr::Call {
            kind,
            index,
            args_len,
            ..
        } = module.arena.expr(*v)
        else {
            panic!("expected call, got {:?}", module.arena.expr(*v));
        };
        assert_eq!(*kind, crate::ast::CallKind::Direct);
        assert_eq!(*index, 0);
        assert_eq!(*args_len, 2);
    }

    #[test]
    fn call_to_later_function_resolves_forward() {
        let file = parse_file(
            "(module
                (func $f (result i32) (return (call $g)))
                (func $g (result i32) (return (const.i32 5))))",
        );
        assert!(file.errors.is_empty(), "errors: {:?}", file.errors);
    }

    #[test]
    fn wrong_arity_call_records_error() {
        let file = parse_file(
            "(module
                (func $add (param i32 i32) (result i32)
                    (return (add.i32 (get_local 0) (get_local 1))))
                (func $f (result i32)
                    (return (call $add (const.i32 1)))))",
        );
        assert!(!file.errors.is_empty());
    }

    #[test]
    fn unknown_opcode_records_error_with_describe() {
        let file = parse_file("(module (func $f (frobnicate)))");
        assert!(!file.errors.is_empty());
        assert!(file.errors[0].message.contains("frobnicate"));
    }
}
