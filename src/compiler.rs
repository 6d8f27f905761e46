/// AST -> bytecode compiler.
///
/// Three passes: (1) register class/interface/enum metadata and constant-
/// evaluate defaults, enum case values and annotation arguments; (2) compile
/// every method, free function, closure body and the top-level statements
/// into chunks; (3) resolve parent links, build interface v-tables, and run
/// the peephole pass. Lexical scoping uses dense local slots; upvalues are
/// captured by explicit recipes at MAKE_CLOSURE time.

use std::collections::HashMap;

use indexmap::IndexMap;
use thiserror::Error;

use crate::ast::*;
use crate::bytecode::{Chunk, Const, ExceptionRegion, Function, Op, TypeTag, UpvalRecipe};
use crate::core::object::{AnnotationData, Class, EnumDef, Interface, PropDef};
use crate::core::value::{ClassId, FuncId};
use crate::errors::Span;

// ---------------------------------------------------------------------------
// Program — the compile artifact the VM installs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub functions: Vec<Function>,
    pub classes: Vec<Class>,
    pub interfaces: Vec<Interface>,
    pub enums: Vec<EnumDef>,
    /// The synthetic function holding top-level statements.
    pub entry: FuncId,
}

#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("{message}")]
    Other { message: String, span: Span },
    #[error("too many local variables in '{func}'")]
    TooManyLocals { func: String, span: Span },
    #[error("default value for '${name}' must be a constant expression")]
    NonConstDefault { name: String, span: Span },
    #[error("annotation argument must be a literal")]
    NonConstAnnotation { span: Span },
    #[error("enum case value must be a constant expression")]
    NonConstEnumCase { span: Span },
}

impl CompileError {
    pub fn span(&self) -> Span {
        match self {
            CompileError::Other { span, .. }
            | CompileError::TooManyLocals { span, .. }
            | CompileError::NonConstDefault { span, .. }
            | CompileError::NonConstAnnotation { span }
            | CompileError::NonConstEnumCase { span } => *span,
        }
    }
}

// ---------------------------------------------------------------------------
// Constant evaluation (defaults, enum cases, annotation args, folding)
// ---------------------------------------------------------------------------

fn const_eval(expr: &Expr) -> Option<Const> {
    match expr {
        Expr::Null(_) => Some(Const::Null),
        Expr::Bool(b, _) => Some(Const::Bool(*b)),
        Expr::Int(n, _) => Some(Const::Int(*n)),
        Expr::Float(f, _) => Some(Const::Float(*f)),
        Expr::Str(s, _) => Some(Const::Str(s.clone())),
        Expr::Unary { op: UnaryOp::Neg, expr, .. } => match const_eval(expr)? {
            Const::Int(n) => Some(Const::Int(-n)),
            Const::Float(f) => Some(Const::Float(-f)),
            _ => None,
        },
        Expr::Unary { op: UnaryOp::Not, expr, .. } => match const_eval(expr)? {
            Const::Bool(b) => Some(Const::Bool(!b)),
            _ => None,
        },
        Expr::Binary { op, lhs, rhs, .. } => {
            let l = const_eval(lhs)?;
            let r = const_eval(rhs)?;
            fold_binary(*op, &l, &r)
        }
        _ => None,
    }
}

/// Constant folding for int/float/string operands — shared by const_eval and
/// the peephole pass. Division by a zero constant is left to the runtime so
/// it raises like any other division.
fn fold_binary(op: BinOp, l: &Const, r: &Const) -> Option<Const> {
    use BinOp::*;
    match (l, r) {
        (Const::Int(a), Const::Int(b)) => Some(match op {
            Add => Const::Int(a.wrapping_add(*b)),
            Sub => Const::Int(a.wrapping_sub(*b)),
            Mul => Const::Int(a.wrapping_mul(*b)),
            Div | Mod if *b == 0 => return None,
            Div => Const::Int(a.wrapping_div(*b)),
            Mod => Const::Int(a.wrapping_rem(*b)),
            BitAnd => Const::Int(a & b),
            BitOr => Const::Int(a | b),
            BitXor => Const::Int(a ^ b),
            Shl => Const::Int(a.wrapping_shl(*b as u32)),
            Shr => Const::Int(a.wrapping_shr(*b as u32)),
            Eq => Const::Bool(a == b),
            Ne => Const::Bool(a != b),
            Lt => Const::Bool(a < b),
            Le => Const::Bool(a <= b),
            Gt => Const::Bool(a > b),
            Ge => Const::Bool(a >= b),
            And | Or => return None,
        }),
        (Const::Float(a), Const::Float(b)) => Some(match op {
            Add => Const::Float(a + b),
            Sub => Const::Float(a - b),
            Mul => Const::Float(a * b),
            Div => Const::Float(a / b),
            Mod => Const::Float(a % b),
            Eq => Const::Bool(a == b),
            Ne => Const::Bool(a != b),
            Lt => Const::Bool(a < b),
            Le => Const::Bool(a <= b),
            Gt => Const::Bool(a > b),
            Ge => Const::Bool(a >= b),
            _ => return None,
        }),
        (Const::Str(a), Const::Str(b)) => Some(match op {
            Add => Const::Str(format!("{}{}", a, b)),
            Eq => Const::Bool(a == b),
            Ne => Const::Bool(a != b),
            _ => return None,
        }),
        (Const::Bool(a), Const::Bool(b)) => Some(match op {
            And => Const::Bool(*a && *b),
            Or => Const::Bool(*a || *b),
            Eq => Const::Bool(a == b),
            Ne => Const::Bool(a != b),
            _ => return None,
        }),
        _ => None,
    }
}

fn type_tag(node: &TypeNode) -> TypeTag {
    match node {
        TypeNode::Simple { name, .. } => match name.as_str() {
            "int" => TypeTag::Int,
            "float" => TypeTag::Float,
            "bool" => TypeTag::Bool,
            "string" => TypeTag::Str,
            "bytes" => TypeTag::Bytes,
            "void" => TypeTag::Any,
            other => TypeTag::Class(other.to_string()),
        },
        TypeNode::Nullable(inner) => TypeTag::Nullable(Box::new(type_tag(inner))),
        TypeNode::Array { elem, .. } => TypeTag::Array(Box::new(type_tag(elem))),
        TypeNode::Map { key, value, .. } => {
            TypeTag::Map(Box::new(type_tag(key)), Box::new(type_tag(value)))
        }
        TypeNode::Function { .. } => TypeTag::Function,
        TypeNode::Tuple(..) | TypeNode::Union(..) => TypeTag::Any,
        TypeNode::Generic { base, span, .. } => {
            type_tag(&TypeNode::Simple { name: base.clone(), span: *span })
        }
    }
}

// ---------------------------------------------------------------------------
// Per-function compile context
// ---------------------------------------------------------------------------

/// What the compiler statically knows about a local's container kind, used
/// to pick the specialised indexing opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KindHint {
    Array,
    Map,
    Super,
    Other,
}

#[derive(Debug, Clone)]
struct LocalVar {
    name: String,
    depth: u32,
    hint: KindHint,
}

#[derive(Debug, Clone, PartialEq)]
enum CaptureMode {
    /// Top-level code and methods: free names are globals.
    None,
    /// `function () use ($a) {}`: only the listed names are captured.
    Explicit,
    /// Arrow functions capture anything they reference.
    Auto,
}

#[derive(Debug)]
struct LoopCtx {
    /// Jump indices waiting to be patched to the end.
    break_jumps: Vec<usize>,
    /// Back-edge target for `continue` (condition or step re-entry).
    continue_target: Option<usize>,
    /// `continue` jumps emitted before the target is known (do-while).
    continue_jumps: Vec<usize>,
    /// `break` inside a switch binds to the switch, `continue` passes out.
    is_switch: bool,
    /// Try depth at entry; break/continue inline finallys above this.
    try_depth: usize,
}

#[derive(Debug, Clone)]
struct TryCtx {
    region: u16,
    finally: Option<Vec<Stmt>>,
}

struct FuncCtx {
    name: String,
    chunk: Chunk,
    locals: Vec<LocalVar>,
    max_locals: usize,
    scope_depth: u32,
    upval_names: Vec<String>,
    upvals: Vec<UpvalRecipe>,
    capture: CaptureMode,
    loops: Vec<LoopCtx>,
    tries: Vec<TryCtx>,
    ic_sites: u16,
    returns: u8,
    is_method: bool,
}

impl FuncCtx {
    fn new(name: &str, capture: CaptureMode, is_method: bool) -> Self {
        // Slot 0 is the callee/receiver window.
        let locals = vec![LocalVar { name: "<callee>".into(), depth: 0, hint: KindHint::Other }];
        FuncCtx {
            name: name.to_string(),
            chunk: Chunk::new(),
            locals,
            max_locals: 1,
            scope_depth: 0,
            upval_names: Vec::new(),
            upvals: Vec::new(),
            capture,
            loops: Vec::new(),
            tries: Vec::new(),
            ic_sites: 0,
            returns: 0,
            is_method,
        }
    }

    fn resolve_local(&self, name: &str) -> Option<u16> {
        self.locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, _)| i as u16)
    }

    fn find_upval(&self, name: &str) -> Option<u16> {
        self.upval_names.iter().position(|n| n == name).map(|i| i as u16)
    }

    fn hint_of_local(&self, slot: u16) -> KindHint {
        self.locals.get(slot as usize).map(|l| l.hint).unwrap_or(KindHint::Other)
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

struct FreeFn {
    id: FuncId,
    min_arity: u8,
    arity: u8,
    variadic: bool,
    /// Global key this overload is installed under.
    global_key: String,
}

pub struct Compiler {
    functions: Vec<Function>,
    classes: Vec<Class>,
    class_ids: HashMap<String, ClassId>,
    interfaces: Vec<Interface>,
    enums: Vec<EnumDef>,
    free_fns: HashMap<String, Vec<FreeFn>>,
    /// Enum case values resolved in pass 1: (enum, case) -> constant.
    enum_values: HashMap<(String, String), Const>,
    ctxs: Vec<FuncCtx>,
    errors: Vec<CompileError>,
    /// Methods awaiting compilation: (class index, decl).
    current_class: Option<String>,
}

pub fn compile(files: &[File]) -> Result<Program, Vec<CompileError>> {
    let mut c = Compiler {
        functions: Vec::new(),
        classes: Vec::new(),
        class_ids: HashMap::new(),
        interfaces: Vec::new(),
        enums: Vec::new(),
        free_fns: HashMap::new(),
        enum_values: HashMap::new(),
        ctxs: Vec::new(),
        errors: Vec::new(),
        current_class: None,
    };
    let program = c.run(files);
    if c.errors.is_empty() {
        Ok(program)
    } else {
        Err(c.errors)
    }
}

impl Compiler {
    fn run(&mut self, files: &[File]) -> Program {
        // Pass 1: declaration metadata across every file.
        for file in files {
            for decl in &file.decls {
                match decl {
                    Decl::Class(c) => self.register_class(c),
                    Decl::Interface(i) => self.register_interface(i),
                    Decl::Enum(e) => self.register_enum(e),
                    _ => {}
                }
            }
        }

        // Pass 2a: reserve free-function ids so call sites can resolve
        // overloads before bodies exist.
        for file in files {
            for decl in &file.decls {
                if let Decl::Function(f) = decl {
                    self.reserve_function(f);
                }
            }
        }

        // Pass 2b: compile bodies.
        for file in files {
            for decl in &file.decls {
                match decl {
                    Decl::Function(f) => self.compile_free_function(f),
                    Decl::Class(c) => self.compile_class_methods(c),
                    _ => {}
                }
            }
        }

        // Top-level statements of the entry file (the last one — imports are
        // loaded ahead of it) become the synthetic entry function.
        let entry_stmts: &[Stmt] = files.last().map(|f| f.stmts.as_slice()).unwrap_or(&[]);
        let entry = self.compile_entry(entry_stmts);

        // Pass 3: parent links + interface v-tables + peephole.
        self.link_classes();
        for f in &mut self.functions {
            peephole(&mut f.chunk);
        }

        Program {
            functions: std::mem::take(&mut self.functions),
            classes: std::mem::take(&mut self.classes),
            interfaces: std::mem::take(&mut self.interfaces),
            enums: std::mem::take(&mut self.enums),
            entry,
        }
    }

    fn error(&mut self, e: CompileError) {
        self.errors.push(e);
    }

    // ── Pass 1: metadata ─────────────────────────────────────────────────────

    fn annotations_of(&mut self, anns: &[Annotation]) -> Vec<AnnotationData> {
        let mut out = Vec::new();
        for a in anns {
            let mut args = Vec::new();
            for arg in &a.args {
                match const_eval(arg) {
                    Some(c) => args.push(c),
                    None => self.error(CompileError::NonConstAnnotation { span: arg.span() }),
                }
            }
            out.push(AnnotationData { name: a.name.clone(), args });
        }
        out
    }

    fn register_class(&mut self, decl: &ClassDecl) {
        let id = self.classes.len() as ClassId;
        let mut class = Class {
            id,
            name: decl.name.clone(),
            parent_name: decl.parent.clone(),
            parent: None,
            interfaces: decl.interfaces.clone(),
            props: Vec::new(),
            consts: IndexMap::new(),
            methods: HashMap::new(),
            vtable: HashMap::new(),
            annotations: self.annotations_of(&decl.annotations),
            method_annotations: HashMap::new(),
            is_abstract: decl.is_abstract,
            is_final: decl.is_final,
            doc: decl.doc.clone(),
        };

        for p in &decl.props {
            let default = match &p.default {
                Some(e) => match const_eval(e) {
                    Some(c) => c,
                    None => {
                        self.error(CompileError::NonConstDefault { name: p.name.clone(), span: p.span });
                        Const::Null
                    }
                },
                None => Const::Null,
            };
            class.props.push(PropDef {
                name: p.name.clone(),
                ty: type_tag(&p.ty),
                default,
                is_static: p.is_static,
                visibility: p.visibility,
                annotations: self.annotations_of(&p.annotations),
            });
        }

        for k in &decl.consts {
            match const_eval(&k.value) {
                Some(c) => {
                    class.consts.insert(k.name.clone(), c);
                }
                None => self.error(CompileError::NonConstDefault { name: k.name.clone(), span: k.span }),
            }
        }

        for m in &decl.methods {
            let anns = self.annotations_of(&m.annotations);
            if !anns.is_empty() {
                class.method_annotations.insert(m.name.clone(), anns);
            }
        }

        self.class_ids.insert(decl.name.clone(), id);
        self.classes.push(class);
    }

    fn register_interface(&mut self, decl: &InterfaceDecl) {
        let mut iface = Interface {
            name: decl.name.clone(),
            extends: decl.extends.clone(),
            methods: Vec::new(),
            consts: IndexMap::new(),
        };
        for m in &decl.methods {
            let min = m.params.iter().filter(|p| p.default.is_none() && !p.variadic).count() as u8;
            iface.methods.push((m.name.clone(), min, m.params.len() as u8));
        }
        for k in &decl.consts {
            match const_eval(&k.value) {
                Some(c) => {
                    iface.consts.insert(k.name.clone(), c);
                }
                None => self.error(CompileError::NonConstDefault { name: k.name.clone(), span: k.span }),
            }
        }
        self.interfaces.push(iface);
    }

    fn register_enum(&mut self, decl: &EnumDecl) {
        let mut def = EnumDef {
            name: decl.name.clone(),
            underlying: decl.underlying.as_ref().map(type_tag),
            cases: IndexMap::new(),
        };
        let mut next_int: i64 = 0;
        for (ordinal, case) in decl.cases.iter().enumerate() {
            let value = match (&case.value, &def.underlying) {
                (Some(e), _) => match const_eval(e) {
                    Some(c) => {
                        if let Const::Int(n) = &c {
                            next_int = n + 1;
                        }
                        c
                    }
                    None => {
                        self.error(CompileError::NonConstEnumCase { span: case.span });
                        Const::Null
                    }
                },
                (None, Some(TypeTag::Int)) => {
                    let c = Const::Int(next_int);
                    next_int += 1;
                    c
                }
                (None, Some(TypeTag::Str)) => Const::Str(case.name.clone()),
                (None, _) => Const::Int(ordinal as i64),
            };
            def.cases.insert(case.name.clone(), value.clone());
            self.enum_values.insert((decl.name.clone(), case.name.clone()), value);
        }
        self.enums.push(def);
    }

    // ── Function compilation ─────────────────────────────────────────────────

    fn reserve_function(&mut self, f: &FunctionDecl) {
        let id = self.functions.len() as FuncId;
        self.functions.push(Function::default());
        let overloads = self.free_fns.entry(f.name.clone()).or_default();
        let global_key = if overloads.is_empty() {
            f.name.clone()
        } else {
            format!("{}#{}", f.name, f.params.len())
        };
        let min = f.params.iter().filter(|p| p.default.is_none() && !p.variadic).count() as u8;
        overloads.push(FreeFn {
            id,
            min_arity: min,
            arity: f.params.len() as u8,
            variadic: f.params.iter().any(|p| p.variadic),
            global_key,
        });
    }

    fn compile_free_function(&mut self, f: &FunctionDecl) {
        let id = self
            .free_fns
            .get(&f.name)
            .and_then(|ov| {
                ov.iter()
                    .find(|o| o.arity as usize == f.params.len())
                    .map(|o| o.id)
            })
            .expect("function reserved in pass 2a");
        let compiled = self.compile_function_body(f, CaptureMode::None, false);
        self.functions[id as usize] = compiled;
    }

    fn compile_class_methods(&mut self, decl: &ClassDecl) {
        self.current_class = Some(decl.name.clone());
        for m in &decl.methods {
            if m.is_abstract {
                continue;
            }
            // Closures inside the body land in the function table first, so
            // the method id is only known after compilation.
            let mut compiled = self.compile_function_body(m, CaptureMode::None, true);
            compiled.name = format!("{}::{}", decl.name, m.name);
            let id = self.functions.len() as FuncId;
            self.functions.push(compiled);
            let class_id = self.class_ids[&decl.name] as usize;
            self.classes[class_id].methods.entry(m.name.clone()).or_default().push(id);
        }
        self.current_class = None;
    }

    /// Compile one function/method/closure body into a `Function`.
    fn compile_function_body(&mut self, f: &FunctionDecl, capture: CaptureMode, is_method: bool) -> Function {
        let mut ctx = FuncCtx::new(&f.name, capture, is_method);
        ctx.returns = f.ret.len() as u8;
        self.ctxs.push(ctx);

        // Receiver binding: `$this` resolves to slot 0 in methods.
        if is_method {
            self.ctx().locals[0].name = "this".into();
        }

        // Parameters occupy slots 1..=N in declaration order.
        for p in &f.params {
            let hint = hint_of_type(&p.ty);
            self.declare_local(&p.name, hint, p.span);
        }

        if let Some(body) = &f.body {
            for stmt in body {
                self.compile_stmt(stmt);
            }
        }
        // Implicit return for fall-off-the-end; multi-return functions are
        // checked to return explicitly, void functions return zero values.
        let line = f.span.line;
        if f.ret.is_empty() {
            self.emit(Op::Return(0), line);
        } else {
            // Unreachable for well-typed code, but keeps every path balanced
            // for the verifier.
            for _ in 0..f.ret.len() {
                let idx = self.ctx().chunk.add_const(Const::Null);
                self.emit(Op::Push(idx), line);
            }
            self.emit(Op::Return(f.ret.len() as u8), line);
        }

        let ctx = self.ctxs.pop().expect("ctx pushed above");
        let defaults: Vec<Const> = f
            .params
            .iter()
            .filter(|p| !p.variadic)
            .filter_map(|p| p.default.as_ref())
            .map(|e| const_eval(e).unwrap_or(Const::Null))
            .collect();
        for p in &f.params {
            if let Some(d) = &p.default {
                if const_eval(d).is_none() {
                    self.error(CompileError::NonConstDefault { name: p.name.clone(), span: p.span });
                }
            }
        }

        Function {
            name: f.name.clone(),
            min_arity: f.params.iter().filter(|p| p.default.is_none() && !p.variadic).count() as u8,
            arity: f.params.len() as u8,
            defaults,
            variadic: f.params.iter().any(|p| p.variadic),
            returns: f.ret.len() as u8,
            locals: ctx.max_locals as u16,
            upvals: ctx.upvals,
            param_types: f.params.iter().map(|p| type_tag(&p.ty)).collect(),
            ret_types: f.ret.iter().map(type_tag).collect(),
            chunk: ctx.chunk,
            native: None,
            compiled: None,
            call_count: 0,
            loop_count: 0,
        }
    }

    fn compile_entry(&mut self, stmts: &[Stmt]) -> FuncId {
        let ctx = FuncCtx::new("<main>", CaptureMode::None, false);
        self.ctxs.push(ctx);
        for stmt in stmts {
            self.compile_stmt(stmt);
        }
        self.emit(Op::Return(0), 0);
        let ctx = self.ctxs.pop().expect("entry ctx");
        let id = self.functions.len() as FuncId;
        self.functions.push(Function {
            name: "<main>".into(),
            locals: ctx.max_locals as u16,
            upvals: ctx.upvals,
            chunk: ctx.chunk,
            ..Function::default()
        });
        id
    }

    fn link_classes(&mut self) {
        // Parent resolution.
        for i in 0..self.classes.len() {
            if let Some(pname) = self.classes[i].parent_name.clone() {
                self.classes[i].parent = self.class_ids.get(&pname).copied();
            }
        }
        // Interface v-tables: for every interface method, find the concrete
        // implementation reachable from this class and record it under the
        // interface's (name, arity) key.
        for i in 0..self.classes.len() {
            let mut ifaces = self.classes[i].interfaces.clone();
            // Inherit transitively extended interfaces.
            let mut expanded = Vec::new();
            while let Some(name) = ifaces.pop() {
                if expanded.contains(&name) {
                    continue;
                }
                if let Some(idef) = self.interfaces.iter().find(|d| d.name == name) {
                    ifaces.extend(idef.extends.iter().cloned());
                }
                expanded.push(name);
            }
            let mut vtable = HashMap::new();
            for iface_name in &expanded {
                let Some(idef) = self.interfaces.iter().find(|d| d.name == *iface_name) else {
                    continue;
                };
                for (mname, _min, arity) in &idef.methods {
                    if let Some(impl_id) = self.lookup_method_linear(i as ClassId, mname, *arity as usize) {
                        vtable.insert((mname.clone(), *arity), impl_id);
                    }
                }
            }
            self.classes[i].vtable = vtable;
            self.classes[i].interfaces = expanded;
        }
    }

    fn lookup_method_linear(&self, class: ClassId, name: &str, argc: usize) -> Option<FuncId> {
        let mut cur = Some(class);
        while let Some(id) = cur {
            let c = &self.classes[id as usize];
            if let Some(ids) = c.methods.get(name) {
                if let Some(m) = ids.iter().copied().find(|m| self.functions[*m as usize].accepts(argc)) {
                    return Some(m);
                }
            }
            cur = c.parent;
        }
        None
    }

    // ── Context helpers ──────────────────────────────────────────────────────

    fn ctx(&mut self) -> &mut FuncCtx {
        self.ctxs.last_mut().expect("inside a function context")
    }

    fn emit(&mut self, op: Op, line: u32) -> usize {
        self.ctx().chunk.emit(op, line)
    }

    fn push_const(&mut self, c: Const, line: u32) {
        let idx = self.ctx().chunk.add_const(c);
        self.emit(Op::Push(idx), line);
    }

    fn begin_scope(&mut self) {
        self.ctx().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let ctx = self.ctx();
        ctx.scope_depth -= 1;
        let depth = ctx.scope_depth;
        while ctx.locals.len() > 1 && ctx.locals.last().map_or(false, |l| l.depth > depth) {
            ctx.locals.pop();
        }
    }

    fn declare_local(&mut self, name: &str, hint: KindHint, span: Span) -> u16 {
        let ctx = self.ctx();
        if ctx.locals.len() >= u16::MAX as usize {
            let func = ctx.name.clone();
            self.error(CompileError::TooManyLocals { func, span });
            return 0;
        }
        let depth = ctx.scope_depth;
        ctx.locals.push(LocalVar { name: name.to_string(), depth, hint });
        let slot = (ctx.locals.len() - 1) as u16;
        ctx.max_locals = ctx.max_locals.max(ctx.locals.len());
        slot
    }

    /// Hidden temporary slot (compound assignment staging).
    fn alloc_temp(&mut self, span: Span) -> u16 {
        let name = format!("<tmp{}>", self.ctx().locals.len());
        self.declare_local(&name, KindHint::Other, span)
    }

    /// Resolve a `$name` read/write: local slot, upvalue, or none.
    fn resolve_var(&mut self, name: &str) -> VarSlot {
        let level = self.ctxs.len() - 1;
        if let Some(slot) = self.ctxs[level].resolve_local(name) {
            return VarSlot::Local(slot);
        }
        if let Some(idx) = self.ctxs[level].find_upval(name) {
            return VarSlot::Upval(idx);
        }
        if self.ctxs[level].capture == CaptureMode::Auto {
            if let Some(idx) = self.capture_upvalue(level, name) {
                return VarSlot::Upval(idx);
            }
        }
        VarSlot::None
    }

    /// Walk outward and thread the capture through every intermediate
    /// function, classic upvalue resolution.
    fn capture_upvalue(&mut self, level: usize, name: &str) -> Option<u16> {
        if level == 0 {
            return None;
        }
        let parent = level - 1;
        if let Some(slot) = self.ctxs[parent].resolve_local(name) {
            return Some(self.add_upvalue(level, name, UpvalRecipe { from_local: true, index: slot }));
        }
        if let Some(idx) = self.ctxs[parent].find_upval(name) {
            return Some(self.add_upvalue(level, name, UpvalRecipe { from_local: false, index: idx }));
        }
        if self.ctxs[parent].capture == CaptureMode::Auto {
            if let Some(idx) = self.capture_upvalue(parent, name) {
                return Some(self.add_upvalue(level, name, UpvalRecipe { from_local: false, index: idx }));
            }
        }
        None
    }

    fn add_upvalue(&mut self, level: usize, name: &str, recipe: UpvalRecipe) -> u16 {
        let ctx = &mut self.ctxs[level];
        if let Some(existing) = ctx.upval_names.iter().position(|n| n == name) {
            return existing as u16;
        }
        ctx.upval_names.push(name.to_string());
        ctx.upvals.push(recipe);
        (ctx.upvals.len() - 1) as u16
    }

    // ── Statements ───────────────────────────────────────────────────────────

    fn compile_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr(e) => {
                let produced = self.compile_expr(e);
                for _ in 0..produced {
                    self.emit(Op::Pop, e.span().line);
                }
            }
            Stmt::VarDecl { ty, name, init, span } => {
                let hint = match (ty, init) {
                    (Some(t), _) => hint_of_type(t),
                    (None, Some(e)) => hint_of_expr(e),
                    _ => KindHint::Other,
                };
                match init {
                    Some(e) => {
                        self.compile_expr(e);
                    }
                    None => self.push_const(Const::Null, span.line),
                }
                let slot = self.declare_local(name, hint, *span);
                self.emit(Op::StoreLocal(slot), span.line);
            }
            Stmt::MultiVarDecl { targets, init, span } => {
                // The call pushes its return values left-to-right; stores
                // run in reverse so each value lands in its slot.
                self.compile_expr_multi(init, targets.len());
                let mut slots = Vec::new();
                for (ty, name) in targets {
                    let hint = ty.as_ref().map(hint_of_type).unwrap_or(KindHint::Other);
                    slots.push(self.declare_local(name, hint, *span));
                }
                for slot in slots.into_iter().rev() {
                    self.emit(Op::StoreLocal(slot), span.line);
                }
            }
            Stmt::Block(body, _) => {
                self.begin_scope();
                let popped = self.compile_block_body(body);
                self.end_scope();
                let _ = popped;
            }
            Stmt::If { cond, then, elseifs, else_branch, span } => {
                let line = span.line;
                self.compile_expr(cond);
                let mut end_jumps = Vec::new();
                let mut next = self.emit(Op::JumpIfFalse(0), line);

                self.begin_scope();
                self.compile_block_body(then);
                self.end_scope();
                end_jumps.push(self.emit(Op::Jump(0), line));
                self.ctx().chunk.patch_jump(next);

                for (c, body) in elseifs {
                    self.compile_expr(c);
                    next = self.emit(Op::JumpIfFalse(0), c.span().line);
                    self.begin_scope();
                    self.compile_block_body(body);
                    self.end_scope();
                    end_jumps.push(self.emit(Op::Jump(0), c.span().line));
                    self.ctx().chunk.patch_jump(next);
                }

                if let Some(body) = else_branch {
                    self.begin_scope();
                    self.compile_block_body(body);
                    self.end_scope();
                }
                for j in end_jumps {
                    self.ctx().chunk.patch_jump(j);
                }
            }
            Stmt::Switch { subject, arms, default, span } => {
                self.compile_switch_stmt(subject, arms, default.as_deref(), *span);
            }
            Stmt::For { init, cond, step, body, span } => {
                let line = span.line;
                self.begin_scope();
                if let Some(i) = init {
                    self.compile_stmt(i);
                }
                let loop_start = self.ctx().chunk.code.len();
                let exit = match cond {
                    Some(c) => {
                        self.compile_expr(c);
                        Some(self.emit(Op::JumpIfFalse(0), line))
                    }
                    None => None,
                };

                let try_depth = self.ctx().tries.len();
                self.ctx().loops.push(LoopCtx {
                    break_jumps: Vec::new(),
                    continue_target: None,
                    continue_jumps: Vec::new(),
                    is_switch: false,
                    try_depth,
                });

                self.begin_scope();
                self.compile_block_body(body);
                self.end_scope();

                // Step expression: continue lands here.
                let step_start = self.ctx().chunk.code.len();
                if let Some(s) = step {
                    let produced = self.compile_expr(s);
                    for _ in 0..produced {
                        self.emit(Op::Pop, line);
                    }
                }
                self.ctx().chunk.emit_loop(loop_start, line);

                let loop_ctx = self.ctx().loops.pop().expect("loop ctx");
                for j in loop_ctx.continue_jumps {
                    patch_jump_to(&mut self.ctx().chunk, j, step_start);
                }
                if let Some(e) = exit {
                    self.ctx().chunk.patch_jump(e);
                }
                for j in loop_ctx.break_jumps {
                    self.ctx().chunk.patch_jump(j);
                }
                self.end_scope();
            }
            Stmt::Foreach { subject, key, value, body, span } => {
                let line = span.line;
                self.begin_scope();
                self.compile_expr(subject);
                self.emit(Op::IterNew, line);

                let loop_start = self.ctx().chunk.code.len();
                let exit = self.emit(Op::IterNext(0), line);

                // IterNext pushes key then value; store value first.
                let value_slot = self.declare_local(value, KindHint::Other, *span);
                let key_slot = key.as_ref().map(|k| self.declare_local(k, KindHint::Other, *span));
                self.emit(Op::StoreLocal(value_slot), line);
                match key_slot {
                    Some(slot) => {
                        self.emit(Op::StoreLocal(slot), line);
                    }
                    None => {
                        self.emit(Op::Pop, line);
                    }
                }

                let try_depth = self.ctx().tries.len();
                self.ctx().loops.push(LoopCtx {
                    break_jumps: Vec::new(),
                    continue_target: Some(loop_start),
                    continue_jumps: Vec::new(),
                    is_switch: false,
                    try_depth,
                });

                self.begin_scope();
                self.compile_block_body(body);
                self.end_scope();
                self.ctx().chunk.emit_loop(loop_start, line);

                // Exhaustion and break both converge on the Pop that drops
                // the iterator.
                let loop_ctx = self.ctx().loops.pop().expect("loop ctx");
                let pop_at = self.ctx().chunk.code.len();
                patch_jump_to(&mut self.ctx().chunk, exit, pop_at);
                for j in loop_ctx.break_jumps {
                    patch_jump_to(&mut self.ctx().chunk, j, pop_at);
                }
                self.emit(Op::Pop, line);
                self.end_scope();
            }
            Stmt::While { cond, body, span } => {
                let line = span.line;
                let loop_start = self.ctx().chunk.code.len();
                self.compile_expr(cond);
                let exit = self.emit(Op::JumpIfFalse(0), line);

                let try_depth = self.ctx().tries.len();
                self.ctx().loops.push(LoopCtx {
                    break_jumps: Vec::new(),
                    continue_target: Some(loop_start),
                    continue_jumps: Vec::new(),
                    is_switch: false,
                    try_depth,
                });
                self.begin_scope();
                self.compile_block_body(body);
                self.end_scope();
                self.ctx().chunk.emit_loop(loop_start, line);

                let loop_ctx = self.ctx().loops.pop().expect("loop ctx");
                self.ctx().chunk.patch_jump(exit);
                for j in loop_ctx.break_jumps {
                    self.ctx().chunk.patch_jump(j);
                }
            }
            Stmt::DoWhile { body, cond, span } => {
                let line = span.line;
                let loop_start = self.ctx().chunk.code.len();
                let try_depth = self.ctx().tries.len();
                self.ctx().loops.push(LoopCtx {
                    break_jumps: Vec::new(),
                    continue_target: None,
                    continue_jumps: Vec::new(),
                    is_switch: false,
                    try_depth,
                });
                self.begin_scope();
                self.compile_block_body(body);
                self.end_scope();

                let cond_start = self.ctx().chunk.code.len();
                self.compile_expr(cond);
                let exit = self.emit(Op::JumpIfFalse(0), line);
                self.ctx().chunk.emit_loop(loop_start, line);

                let loop_ctx = self.ctx().loops.pop().expect("loop ctx");
                for j in loop_ctx.continue_jumps {
                    patch_jump_to(&mut self.ctx().chunk, j, cond_start);
                }
                self.ctx().chunk.patch_jump(exit);
                for j in loop_ctx.break_jumps {
                    self.ctx().chunk.patch_jump(j);
                }
            }
            Stmt::Break(span) => {
                self.inline_finallys_for_break(*span);
                let j = self.emit(Op::Jump(0), span.line);
                if let Some(l) = self.ctx().loops.last_mut() {
                    l.break_jumps.push(j);
                }
            }
            Stmt::Continue(span) => {
                self.inline_finallys_for_break(*span);
                // Find the innermost real loop (skip switch contexts).
                let target = self
                    .ctx()
                    .loops
                    .iter()
                    .rev()
                    .find(|l| !l.is_switch)
                    .and_then(|l| l.continue_target);
                match target {
                    Some(t) => {
                        let here = self.ctx().chunk.code.len();
                        if t <= here {
                            self.ctx().chunk.emit_loop(t, span.line);
                        } else {
                            let j = self.emit(Op::Jump(0), span.line);
                            patch_jump_to(&mut self.ctx().chunk, j, t);
                        }
                    }
                    None => {
                        let j = self.emit(Op::Jump(0), span.line);
                        for l in self.ctx().loops.iter_mut().rev() {
                            if !l.is_switch {
                                l.continue_jumps.push(j);
                                break;
                            }
                        }
                    }
                }
            }
            Stmt::Return { values, span } => {
                // `return f(args);` in a region-free function is a direct
                // tail call: the frame is reused instead of growing.
                if values.len() == 1 && self.ctx().tries.is_empty() {
                    if let Expr::Call { callee, args, span: cspan } = &values[0] {
                        match callee {
                            Callee::Named(name) => {
                                let key = match self.pick_overload(name, args.len()) {
                                    Some(o) => o.global_key.clone(),
                                    None => name.clone(),
                                };
                                let idx = self.ctx().chunk.add_string(&key);
                                self.emit(Op::LoadGlobal(idx), cspan.line);
                            }
                            Callee::Expr(e) => {
                                self.compile_expr(e);
                            }
                        }
                        for a in args {
                            self.compile_expr(a);
                        }
                        self.emit(Op::TailCall(args.len() as u8), span.line);
                        return;
                    }
                }

                for v in values {
                    self.compile_expr(v);
                }
                // `finally` runs on return: inline every enclosing handler,
                // innermost first, each preceded by leaving its region.
                let tries: Vec<TryCtx> = self.ctx().tries.clone();
                for t in tries.iter().rev() {
                    self.emit(Op::LeaveTry, span.line);
                    if let Some(finally) = &t.finally {
                        self.begin_scope();
                        for s in finally {
                            self.compile_stmt(s);
                        }
                        self.end_scope();
                    }
                }
                self.emit(Op::Return(values.len() as u8), span.line);
            }
            Stmt::Try { body, catches, finally, span } => {
                self.compile_try(body, catches, finally.as_deref(), *span);
            }
            Stmt::Throw { value, span } => {
                self.compile_expr(value);
                self.emit(Op::Throw, span.line);
            }
            Stmt::Echo { value, span } => {
                self.compile_expr(value);
                self.emit(Op::Echo, span.line);
            }
        }
    }

    fn compile_block_body(&mut self, body: &[Stmt]) -> usize {
        for s in body {
            self.compile_stmt(s);
        }
        body.len()
    }

    /// Break/continue that crosses try regions runs their finallys first.
    fn inline_finallys_for_break(&mut self, span: Span) {
        let loop_try_depth = self.ctx().loops.last().map(|l| l.try_depth).unwrap_or(0);
        let tries: Vec<TryCtx> = self.ctx().tries.iter().skip(loop_try_depth).cloned().collect();
        for t in tries.iter().rev() {
            self.emit(Op::LeaveTry, span.line);
            if let Some(finally) = &t.finally {
                self.begin_scope();
                for s in finally {
                    self.compile_stmt(s);
                }
                self.end_scope();
            }
        }
    }

    fn compile_switch_stmt(
        &mut self,
        subject: &Expr,
        arms: &[SwitchArm],
        default: Option<&[Stmt]>,
        span: Span,
    ) {
        let line = span.line;
        self.begin_scope();
        let subject_slot = self.alloc_temp(span);
        self.compile_expr(subject);
        self.emit(Op::StoreLocal(subject_slot), line);

        // Dispatch: compare against each case value; jump into the body list.
        let mut body_entries: Vec<Vec<usize>> = Vec::new();
        for arm in arms {
            let mut entries = Vec::new();
            for v in &arm.values {
                self.emit(Op::LoadLocal(subject_slot), line);
                self.compile_expr(v);
                self.emit(Op::Eq, v.span().line);
                let skip = self.emit(Op::JumpIfFalse(0), v.span().line);
                entries.push(self.emit(Op::Jump(0), v.span().line));
                self.ctx().chunk.patch_jump(skip);
            }
            body_entries.push(entries);
        }
        let to_default = self.emit(Op::Jump(0), line);

        // Bodies with natural fallthrough; `break` jumps to the end.
        let try_depth = self.ctx().tries.len();
        self.ctx().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_target: None,
            continue_jumps: Vec::new(),
            is_switch: true,
            try_depth,
        });
        for (arm, entries) in arms.iter().zip(&body_entries) {
            let target = self.ctx().chunk.code.len();
            for e in entries {
                patch_jump_to(&mut self.ctx().chunk, *e, target);
            }
            self.begin_scope();
            self.compile_block_body(&arm.body);
            self.end_scope();
        }
        let default_target = self.ctx().chunk.code.len();
        patch_jump_to(&mut self.ctx().chunk, to_default, default_target);
        if let Some(body) = default {
            self.begin_scope();
            self.compile_block_body(body);
            self.end_scope();
        }

        let loop_ctx = self.ctx().loops.pop().expect("switch ctx");
        for j in loop_ctx.break_jumps {
            self.ctx().chunk.patch_jump(j);
        }
        // Forward any `continue` seen inside the switch to the enclosing loop.
        if !loop_ctx.continue_jumps.is_empty() {
            if let Some(outer) = self.ctx().loops.iter_mut().rev().find(|l| !l.is_switch) {
                outer.continue_jumps.extend(loop_ctx.continue_jumps);
            }
        }
        self.end_scope();
    }

    fn compile_try(&mut self, body: &[Stmt], catches: &[CatchClause], finally: Option<&[Stmt]>, span: Span) {
        let line = span.line;

        let region_idx = self.ctx().chunk.regions.len() as u16;
        self.ctx().chunk.regions.push(ExceptionRegion {
            start: 0,
            end: 0,
            catches: Vec::new(),
            finally: None,
        });

        self.emit(Op::EnterTry(region_idx), line);
        let start = self.ctx().chunk.code.len() as u32;
        self.ctx().tries.push(TryCtx { region: region_idx, finally: finally.map(|f| f.to_vec()) });

        self.begin_scope();
        self.compile_block_body(body);
        self.end_scope();

        self.ctx().tries.pop();
        let end = self.ctx().chunk.code.len() as u32;
        self.emit(Op::LeaveTry, line);
        // Normal exit: run the finally inline, then skip the handlers.
        if let Some(f) = finally {
            self.begin_scope();
            for s in f {
                self.compile_stmt(s);
            }
            self.end_scope();
        }
        let done = self.emit(Op::Jump(0), line);

        // Catch handlers. When a finally exists, each catch body runs inside
        // a nested region so an exception thrown by the catch body still
        // reaches the finally pad.
        let mut catch_entries = Vec::new();
        let mut catch_done = Vec::new();
        let mut nested_regions = Vec::new();
        for c in catches {
            let handler_pc = self.ctx().chunk.code.len() as u32;
            let class_const = self.ctx().chunk.add_string(&c.class);
            catch_entries.push((class_const, handler_pc));

            self.emit(Op::EnterCatch(region_idx), c.span.line);
            self.begin_scope();
            let slot = self.declare_local(&c.var, KindHint::Other, c.span);
            self.emit(Op::StoreLocal(slot), c.span.line);

            if finally.is_some() {
                let inner_idx = self.ctx().chunk.regions.len() as u16;
                nested_regions.push(inner_idx);
                self.ctx().chunk.regions.push(ExceptionRegion {
                    start: 0,
                    end: 0,
                    catches: Vec::new(),
                    finally: None,
                });
                self.emit(Op::EnterTry(inner_idx), c.span.line);
                let inner_start = self.ctx().chunk.code.len() as u32;
                self.ctx().tries.push(TryCtx { region: inner_idx, finally: finally.map(|f| f.to_vec()) });
                self.compile_block_body(&c.body);
                self.ctx().tries.pop();
                let inner_end = self.ctx().chunk.code.len() as u32;
                self.emit(Op::LeaveTry, c.span.line);
                // Record the nested region bounds now; its pad is shared.
                let r = &mut self.ctx().chunk.regions[inner_idx as usize];
                r.start = inner_start;
                r.end = inner_end;
            } else {
                self.compile_block_body(&c.body);
            }
            self.end_scope();

            // Normal catch exit runs the finally inline too.
            if let Some(f) = finally {
                self.begin_scope();
                for s in f {
                    self.compile_stmt(s);
                }
                self.end_scope();
            }
            catch_done.push(self.emit(Op::Jump(0), c.span.line));
        }

        // Exception-path finally landing pad.
        let mut pad = None;
        if let Some(f) = finally {
            let pad_pc = self.ctx().chunk.code.len() as u32;
            pad = Some(pad_pc);
            self.emit(Op::EnterFinally, line);
            self.begin_scope();
            for s in f {
                self.compile_stmt(s);
            }
            self.end_scope();
            self.emit(Op::EndFinally, line);
        }

        // Fill the outer region and point nested catch regions at the pad.
        {
            let r = &mut self.ctx().chunk.regions[region_idx as usize];
            r.start = start;
            r.end = end;
            r.catches = catch_entries;
            r.finally = pad;
        }
        for idx in nested_regions {
            self.ctx().chunk.regions[idx as usize].finally = pad;
        }

        self.ctx().chunk.patch_jump(done);
        for j in catch_done {
            self.ctx().chunk.patch_jump(j);
        }
    }

    // ── Expressions ──────────────────────────────────────────────────────────

    /// Compile a multi-bind initializer; the call site expects `want`
    /// pushed values.
    fn compile_expr_multi(&mut self, expr: &Expr, want: usize) {
        match expr {
            Expr::Call { callee, args, span } if want > 1 => {
                match callee {
                    Callee::Named(name) => {
                        let key = match self.pick_overload(name, args.len()) {
                            Some(o) => o.global_key.clone(),
                            None => name.clone(),
                        };
                        let idx = self.ctx().chunk.add_string(&key);
                        self.emit(Op::LoadGlobal(idx), span.line);
                    }
                    Callee::Expr(e) => {
                        self.compile_expr(e);
                    }
                }
                for a in args {
                    self.compile_expr(a);
                }
                self.emit(Op::CallN { argc: args.len() as u8, rets: want as u8 }, span.line);
            }
            _ => {
                self.compile_expr(expr);
            }
        }
    }

    /// Returns the number of values the expression leaves on the stack
    /// (0 for void calls, 1 otherwise).
    fn compile_expr(&mut self, expr: &Expr) -> usize {
        // AST-level constant folding feeds single PUSHes to the peephole.
        if !matches!(
            expr,
            Expr::Null(_) | Expr::Bool(..) | Expr::Int(..) | Expr::Float(..) | Expr::Str(..)
        ) {
            if let Some(c) = const_eval(expr) {
                self.push_const(c, expr.span().line);
                return 1;
            }
        }

        let line = expr.span().line;
        match expr {
            Expr::Null(_) => {
                self.push_const(Const::Null, line);
                1
            }
            Expr::Bool(b, _) => {
                self.push_const(Const::Bool(*b), line);
                1
            }
            Expr::Int(n, _) => {
                self.push_const(Const::Int(*n), line);
                1
            }
            Expr::Float(f, _) => {
                self.push_const(Const::Float(*f), line);
                1
            }
            Expr::Str(s, _) => {
                self.push_const(Const::Str(s.clone()), line);
                1
            }
            Expr::Interp { parts, .. } => {
                if parts.is_empty() {
                    self.push_const(Const::Str(String::new()), line);
                    return 1;
                }
                for (i, part) in parts.iter().enumerate() {
                    match part {
                        InterpSeg::Lit(s) => self.push_const(Const::Str(s.clone()), line),
                        InterpSeg::Var(name, span) => {
                            self.compile_var_read(name, *span);
                            self.emit(Op::ToStr, line);
                        }
                    }
                    if i > 0 {
                        self.emit(Op::Concat, line);
                    }
                }
                1
            }
            Expr::Var { name, span } => {
                self.compile_var_read(name, *span);
                1
            }
            Expr::Ident { name, span } => {
                // Global function/class reference by name.
                let key = match self.pick_overload(name, usize::MAX) {
                    Some(o) => o.global_key.clone(),
                    None => name.clone(),
                };
                let idx = self.ctx().chunk.add_string(&key);
                self.emit(Op::LoadGlobal(idx), span.line);
                1
            }
            Expr::This(span) => {
                // Slot 0 in a method body; closures capture the receiver as
                // an upvalue regardless of their capture list.
                match self.resolve_var("this") {
                    VarSlot::Local(slot) => {
                        self.emit(Op::LoadLocal(slot), span.line);
                    }
                    VarSlot::Upval(idx) => {
                        self.emit(Op::LoadUpval(idx), span.line);
                    }
                    VarSlot::None => {
                        let level = self.ctxs.len() - 1;
                        match self.capture_upvalue(level, "this") {
                            Some(idx) => {
                                self.emit(Op::LoadUpval(idx), span.line);
                            }
                            None => {
                                self.emit(Op::LoadLocal(0), span.line);
                            }
                        }
                    }
                }
                1
            }
            Expr::Unary { op, expr: inner, span } => {
                match op {
                    UnaryOp::Neg => {
                        self.compile_expr(inner);
                        self.emit(Op::Neg, span.line);
                    }
                    UnaryOp::Not => {
                        self.compile_expr(inner);
                        self.emit(Op::Not, span.line);
                    }
                    UnaryOp::BitNot => {
                        self.compile_expr(inner);
                        self.emit(Op::BitNot, span.line);
                    }
                    UnaryOp::PreInc => return self.compile_incdec(inner, true, true, *span),
                    UnaryOp::PreDec => return self.compile_incdec(inner, false, true, *span),
                }
                1
            }
            Expr::Postfix { op, expr: inner, span } => {
                self.compile_incdec(inner, *op == PostfixOp::Inc, false, *span)
            }
            Expr::Binary { op, lhs, rhs, span } => {
                match op {
                    BinOp::And => {
                        // Short-circuit: a falsy left operand is the result.
                        self.compile_expr(lhs);
                        self.emit(Op::Dup, span.line);
                        let short = self.emit(Op::JumpIfFalse(0), span.line);
                        self.emit(Op::Pop, span.line);
                        self.compile_expr(rhs);
                        self.ctx().chunk.patch_jump(short);
                        return 1;
                    }
                    BinOp::Or => {
                        self.compile_expr(lhs);
                        self.emit(Op::Dup, span.line);
                        self.emit(Op::Not, span.line);
                        let short = self.emit(Op::JumpIfFalse(0), span.line);
                        self.emit(Op::Pop, span.line);
                        self.compile_expr(rhs);
                        let done = self.emit(Op::Jump(0), span.line);
                        self.ctx().chunk.patch_jump(short);
                        self.ctx().chunk.patch_jump(done);
                        return 1;
                    }
                    _ => {}
                }
                self.compile_expr(lhs);
                self.compile_expr(rhs);
                let op = match op {
                    BinOp::Add => Op::Add,
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Mul,
                    BinOp::Div => Op::Div,
                    BinOp::Mod => Op::Mod,
                    BinOp::Eq => Op::Eq,
                    BinOp::Ne => Op::Ne,
                    BinOp::Lt => Op::Lt,
                    BinOp::Le => Op::Le,
                    BinOp::Gt => Op::Gt,
                    BinOp::Ge => Op::Ge,
                    BinOp::BitAnd => Op::BitAnd,
                    BinOp::BitOr => Op::BitOr,
                    BinOp::BitXor => Op::BitXor,
                    BinOp::Shl => Op::Shl,
                    BinOp::Shr => Op::Shr,
                    BinOp::And | BinOp::Or => unreachable!("handled above"),
                };
                self.emit(op, span.line);
                1
            }
            Expr::Ternary { cond, then, otherwise, span } => {
                match then {
                    Some(t) => {
                        self.compile_expr(cond);
                        let to_else = self.emit(Op::JumpIfFalse(0), span.line);
                        self.compile_expr(t);
                        let done = self.emit(Op::Jump(0), span.line);
                        self.ctx().chunk.patch_jump(to_else);
                        self.compile_expr(otherwise);
                        self.ctx().chunk.patch_jump(done);
                    }
                    None => {
                        // Elvis: keep the condition value when truthy.
                        self.compile_expr(cond);
                        self.emit(Op::Dup, span.line);
                        let to_else = self.emit(Op::JumpIfFalse(0), span.line);
                        let done = self.emit(Op::Jump(0), span.line);
                        self.ctx().chunk.patch_jump(to_else);
                        self.emit(Op::Pop, span.line);
                        self.compile_expr(otherwise);
                        self.ctx().chunk.patch_jump(done);
                    }
                }
                1
            }
            Expr::Assign { target, op, value, span } => {
                self.compile_assign(target, *op, value, *span);
                1
            }
            Expr::Cast { expr: inner, ty, safe, span } => {
                self.compile_expr(inner);
                let tag = type_tag(ty);
                let idx = self.ctx().chunk.add_type(tag);
                self.emit(if *safe { Op::CastSafe(idx) } else { Op::Cast(idx) }, span.line);
                1
            }
            Expr::Is { expr: inner, ty, span } => {
                self.compile_expr(inner);
                let idx = self.ctx().chunk.add_type(type_tag(ty));
                self.emit(Op::CheckType(idx), span.line);
                1
            }
            Expr::Prop { obj, name, span } => {
                self.compile_expr(obj);
                let idx = self.ctx().chunk.add_string(name);
                self.emit(Op::GetField(idx), span.line);
                1
            }
            Expr::MethodCall { obj, name, args, span } => {
                self.compile_expr(obj);
                for a in args {
                    self.compile_expr(a);
                }
                let name_idx = self.ctx().chunk.add_string(name);
                let site = self.ctx().ic_sites;
                self.ctx().ic_sites += 1;
                self.emit(
                    Op::CallMethod { name: name_idx, argc: args.len() as u8, site },
                    span.line,
                );
                1
            }
            Expr::StaticAccess { target, member, is_var, span } => {
                let class_name = self.static_class_name(target);
                // Enum case?
                if !is_var {
                    if let Some(c) = self.enum_values.get(&(class_name.clone(), member.clone())).cloned() {
                        self.push_const(c, span.line);
                        return 1;
                    }
                }
                let class_idx = self.ctx().chunk.add_string(&class_name);
                let name_idx = self.ctx().chunk.add_string(member);
                self.emit(Op::GetStatic { class: class_idx, name: name_idx }, span.line);
                1
            }
            Expr::StaticCall { target, method, args, span } => {
                let class_name = self.static_class_name(target);
                // Receiver slot: `this` flows through for parent::/self::
                // calls inside methods, null otherwise.
                if self.ctx().is_method && !matches!(target, StaticTarget::Class(_)) {
                    self.emit(Op::LoadLocal(0), span.line);
                } else {
                    self.push_const(Const::Null, span.line);
                }
                for a in args {
                    self.compile_expr(a);
                }
                let class_idx = self.ctx().chunk.add_string(&class_name);
                let name_idx = self.ctx().chunk.add_string(method);
                self.emit(
                    Op::CallStatic { class: class_idx, name: name_idx, argc: args.len() as u8 },
                    span.line,
                );
                1
            }
            Expr::ClassRef { target, span } => {
                let name = self.static_class_name(target);
                self.push_const(Const::Str(name), span.line);
                1
            }
            Expr::Call { callee, args, span } => {
                match callee {
                    Callee::Named(name) => {
                        let key = match self.pick_overload(name, args.len()) {
                            Some(o) => o.global_key.clone(),
                            None => name.clone(),
                        };
                        let idx = self.ctx().chunk.add_string(&key);
                        self.emit(Op::LoadGlobal(idx), span.line);
                    }
                    Callee::Expr(e) => {
                        self.compile_expr(e);
                    }
                }
                for a in args {
                    self.compile_expr(a);
                }
                self.emit(Op::Call(args.len() as u8), span.line);
                1
            }
            Expr::Index { obj, index, span } => {
                self.compile_expr(obj);
                self.compile_expr(index);
                let op = match self.hint_of(obj) {
                    KindHint::Map => Op::MapGet,
                    KindHint::Super => Op::SuperGet,
                    _ => Op::ArrayGet,
                };
                self.emit(op, span.line);
                1
            }
            Expr::New { class, args, span } => {
                let idx = self.ctx().chunk.add_string(class);
                self.emit(Op::NewObject(idx), span.line);
                let has_ctor = self
                    .class_ids
                    .get(class)
                    .map(|id| self.class_has_ctor(*id))
                    .unwrap_or(!args.is_empty());
                if has_ctor || !args.is_empty() {
                    self.emit(Op::Dup, span.line);
                    for a in args {
                        self.compile_expr(a);
                    }
                    let name_idx = self.ctx().chunk.add_string("constructor");
                    let site = self.ctx().ic_sites;
                    self.ctx().ic_sites += 1;
                    self.emit(
                        Op::CallMethod { name: name_idx, argc: args.len() as u8, site },
                        span.line,
                    );
                    // The constructor's (void) result; the object stays.
                    self.emit(Op::Pop, span.line);
                }
                1
            }
            Expr::Closure { params, ret, uses, body, span } => {
                self.compile_closure(params, ret, uses, body, *span, CaptureMode::Explicit);
                1
            }
            Expr::ArrowFn { params, ret, body, span } => {
                let body_stmt = vec![Stmt::Return { values: vec![(**body).clone()], span: *span }];
                let rets = ret.clone().map(|r| vec![r]).unwrap_or_default();
                self.compile_closure(params, &rets, &[], &body_stmt, *span, CaptureMode::Auto);
                1
            }
            Expr::ArrayLit { elems, span } => {
                for e in elems {
                    self.compile_expr(e);
                }
                self.emit(Op::NewArray(elems.len() as u16), span.line);
                1
            }
            Expr::MapLit { entries, span, .. } => {
                for (k, v) in entries {
                    self.compile_expr(k);
                    self.compile_expr(v);
                }
                self.emit(Op::NewMap(entries.len() as u16), span.line);
                1
            }
            Expr::SuperArrayLit { entries, span } => {
                for (k, v) in entries {
                    match k {
                        Some(k) => {
                            self.compile_expr(k);
                        }
                        None => self.push_const(Const::Null, span.line),
                    }
                    self.compile_expr(v);
                }
                self.emit(Op::NewSuperArray(entries.len() as u16), span.line);
                1
            }
            Expr::Match { subject, arms, span } => {
                self.compile_match(subject, arms, *span);
                1
            }
            Expr::SwitchExpr { subject, arms, default, span } => {
                self.compile_switch_expr(subject, arms, default.as_deref(), *span);
                1
            }
        }
    }

    fn compile_var_read(&mut self, name: &str, span: Span) {
        match self.resolve_var(name) {
            VarSlot::Local(slot) => {
                self.emit(Op::LoadLocal(slot), span.line);
            }
            VarSlot::Upval(idx) => {
                self.emit(Op::LoadUpval(idx), span.line);
            }
            VarSlot::None => {
                // The checker already rejected unknown variables; emitting a
                // global read keeps going for tooling flows (--parse etc.).
                let idx = self.ctx().chunk.add_string(name);
                self.emit(Op::LoadGlobal(idx), span.line);
            }
        }
    }

    fn compile_assign(&mut self, target: &Expr, op: AssignOp, value: &Expr, span: Span) {
        let line = span.line;
        let bin = |op: AssignOp| match op {
            AssignOp::Add => Op::Add,
            AssignOp::Sub => Op::Sub,
            AssignOp::Mul => Op::Mul,
            AssignOp::Div => Op::Div,
            AssignOp::Mod => Op::Mod,
            AssignOp::Assign => Op::Nop,
        };

        match target {
            Expr::Var { name, span: vspan } => {
                if op != AssignOp::Assign {
                    self.compile_var_read(name, *vspan);
                    self.compile_expr(value);
                    self.emit(bin(op), line);
                } else {
                    self.compile_expr(value);
                }
                self.emit(Op::Dup, line);
                match self.resolve_var(name) {
                    VarSlot::Local(slot) => {
                        self.emit(Op::StoreLocal(slot), line);
                    }
                    VarSlot::Upval(idx) => {
                        self.emit(Op::StoreUpval(idx), line);
                    }
                    VarSlot::None => {
                        let idx = self.ctx().chunk.add_string(name);
                        self.emit(Op::StoreGlobal(idx), line);
                    }
                }
            }
            Expr::Index { obj, index, span: ispan } => {
                // Stage obj and index in temps so compound assignment
                // evaluates them once.
                self.begin_scope();
                let obj_slot = self.alloc_temp(*ispan);
                let idx_slot = self.alloc_temp(*ispan);
                self.compile_expr(obj);
                self.emit(Op::StoreLocal(obj_slot), line);
                self.compile_expr(index);
                self.emit(Op::StoreLocal(idx_slot), line);

                let hint = self.hint_of(obj);
                let (get, set) = match hint {
                    KindHint::Map => (Op::MapGet, Op::MapSet),
                    KindHint::Super => (Op::SuperGet, Op::SuperSet),
                    _ => (Op::ArrayGet, Op::ArraySet),
                };

                if op != AssignOp::Assign {
                    self.emit(Op::LoadLocal(obj_slot), line);
                    self.emit(Op::LoadLocal(idx_slot), line);
                    self.emit(get.clone(), line);
                    self.compile_expr(value);
                    self.emit(bin(op), line);
                } else {
                    self.compile_expr(value);
                }
                // Keep a copy as the expression result, then store.
                let val_slot = self.alloc_temp(*ispan);
                self.emit(Op::StoreLocal(val_slot), line);
                self.emit(Op::LoadLocal(obj_slot), line);
                self.emit(Op::LoadLocal(idx_slot), line);
                self.emit(Op::LoadLocal(val_slot), line);
                self.emit(set, line);
                self.emit(Op::LoadLocal(val_slot), line);
                self.end_scope();
            }
            Expr::Prop { obj, name, span: pspan } => {
                self.begin_scope();
                let obj_slot = self.alloc_temp(*pspan);
                self.compile_expr(obj);
                self.emit(Op::StoreLocal(obj_slot), line);
                let name_idx = self.ctx().chunk.add_string(name);

                if op != AssignOp::Assign {
                    self.emit(Op::LoadLocal(obj_slot), line);
                    self.emit(Op::GetField(name_idx), line);
                    self.compile_expr(value);
                    self.emit(bin(op), line);
                } else {
                    self.compile_expr(value);
                }
                let val_slot = self.alloc_temp(*pspan);
                self.emit(Op::StoreLocal(val_slot), line);
                self.emit(Op::LoadLocal(obj_slot), line);
                self.emit(Op::LoadLocal(val_slot), line);
                self.emit(Op::SetField(name_idx), line);
                self.emit(Op::LoadLocal(val_slot), line);
                self.end_scope();
            }
            Expr::StaticAccess { target: st, member, .. } => {
                let class_name = self.static_class_name(st);
                let class_idx = self.ctx().chunk.add_string(&class_name);
                let name_idx = self.ctx().chunk.add_string(member);
                if op != AssignOp::Assign {
                    self.emit(Op::GetStatic { class: class_idx, name: name_idx }, line);
                    self.compile_expr(value);
                    self.emit(bin(op), line);
                } else {
                    self.compile_expr(value);
                }
                self.emit(Op::Dup, line);
                self.emit(Op::SetStatic { class: class_idx, name: name_idx }, line);
            }
            other => {
                self.error(CompileError::Other {
                    message: "invalid assignment target".into(),
                    span: other.span(),
                });
            }
        }
    }

    /// Pre/post increment and decrement on any assignable place.
    fn compile_incdec(&mut self, place: &Expr, inc: bool, pre: bool, span: Span) -> usize {
        let line = span.line;
        match place {
            Expr::Var { name, span: vspan } => {
                self.compile_var_read(name, *vspan);
                let step = if inc { Op::Inc } else { Op::Dec };
                if pre {
                    self.emit(step, line);
                    self.emit(Op::Dup, line);
                } else {
                    // Keep the old value as the result, store the stepped one.
                    self.emit(Op::Dup, line);
                    self.emit(step, line);
                }
                // Stack: result-to-keep, value-to-store (top).
                match self.resolve_var(name) {
                    VarSlot::Local(slot) => {
                        self.emit(Op::StoreLocal(slot), line);
                    }
                    VarSlot::Upval(idx) => {
                        self.emit(Op::StoreUpval(idx), line);
                    }
                    VarSlot::None => {
                        let idx = self.ctx().chunk.add_string(name);
                        self.emit(Op::StoreGlobal(idx), line);
                    }
                }
                1
            }
            _ => {
                // Lower to `place = place +/- 1` for fields and indices.
                let op = if inc { AssignOp::Add } else { AssignOp::Sub };
                let one = Expr::Int(1, span);
                self.compile_assign(place, op, &one, span);
                1
            }
        }
    }

    fn compile_closure(
        &mut self,
        params: &[Param],
        ret: &[TypeNode],
        uses: &[(String, Span)],
        body: &[Stmt],
        span: Span,
        capture: CaptureMode,
    ) {
        let decl = FunctionDecl {
            name: "<closure>".into(),
            params: params.to_vec(),
            ret: ret.to_vec(),
            body: Some(body.to_vec()),
            is_static: false,
            is_abstract: false,
            is_final: false,
            visibility: Visibility::Public,
            annotations: vec![],
            doc: None,
            span,
        };

        // Compile the body in a nested context; explicit captures are
        // pre-registered so the body resolves them as upvalues.
        let func = {
            let mut inner = FuncCtx::new("<closure>", capture, false);
            inner.returns = ret.len() as u8;
            self.ctxs.push(inner);
            for (name, _) in uses {
                let level = self.ctxs.len() - 1;
                let parent = level - 1;
                let recipe = if let Some(slot) = self.ctxs[parent].resolve_local(name) {
                    Some(UpvalRecipe { from_local: true, index: slot })
                } else {
                    self.ctxs[parent]
                        .find_upval(name)
                        .map(|idx| UpvalRecipe { from_local: false, index: idx })
                };
                if let Some(r) = recipe {
                    self.add_upvalue(level, name, r);
                }
            }
            for p in &decl.params {
                let hint = hint_of_type(&p.ty);
                self.declare_local(&p.name, hint, p.span);
            }
            for stmt in body {
                self.compile_stmt(stmt);
            }
            if ret.is_empty() {
                self.emit(Op::Return(0), span.line);
            } else {
                let idx = self.ctx().chunk.add_const(Const::Null);
                self.emit(Op::Push(idx), span.line);
                self.emit(Op::Return(1), span.line);
            }
            let finished = self.ctxs.pop().expect("closure ctx");
            Function {
                name: "<closure>".into(),
                min_arity: decl.params.iter().filter(|p| p.default.is_none() && !p.variadic).count() as u8,
                arity: decl.params.len() as u8,
                defaults: decl
                    .params
                    .iter()
                    .filter(|p| !p.variadic)
                    .filter_map(|p| p.default.as_ref())
                    .map(|e| const_eval(e).unwrap_or(Const::Null))
                    .collect(),
                variadic: decl.params.iter().any(|p| p.variadic),
                returns: ret.len() as u8,
                locals: finished.max_locals as u16,
                upvals: finished.upvals.clone(),
                param_types: decl.params.iter().map(|p| type_tag(&p.ty)).collect(),
                ret_types: ret.iter().map(type_tag).collect(),
                chunk: finished.chunk,
                native: None,
                compiled: None,
                call_count: 0,
                loop_count: 0,
            }
        };

        let func_id = self.functions.len() as FuncId;
        let recipes = func.upvals.clone();
        self.functions.push(func);
        self.emit(Op::MakeClosure { func: func_id, upvals: recipes }, span.line);
    }

    fn compile_match(&mut self, subject: &Expr, arms: &[MatchArm], span: Span) {
        let line = span.line;
        self.begin_scope();
        let subj = self.alloc_temp(span);
        self.compile_expr(subject);
        self.emit(Op::StoreLocal(subj), line);

        let mut done = Vec::new();
        for arm in arms {
            let mut fail_jumps: Vec<usize> = Vec::new();
            self.begin_scope();
            match &arm.pattern {
                MatchPattern::Values(values) => {
                    // Any listed value matches: build an OR chain.
                    let mut take_jumps = Vec::new();
                    for (i, v) in values.iter().enumerate() {
                        self.emit(Op::LoadLocal(subj), line);
                        self.compile_expr(v);
                        self.emit(Op::Eq, v.span().line);
                        if i + 1 < values.len() {
                            let skip = self.emit(Op::JumpIfFalse(0), v.span().line);
                            take_jumps.push(self.emit(Op::Jump(0), v.span().line));
                            self.ctx().chunk.patch_jump(skip);
                        } else {
                            fail_jumps.push(self.emit(Op::JumpIfFalse(0), v.span().line));
                        }
                    }
                    let matched = self.ctx().chunk.code.len();
                    for j in take_jumps {
                        patch_jump_to(&mut self.ctx().chunk, j, matched);
                    }
                }
                MatchPattern::Type { ty, bind } => {
                    self.emit(Op::LoadLocal(subj), line);
                    let idx = self.ctx().chunk.add_type(type_tag(ty));
                    self.emit(Op::CheckType(idx), line);
                    fail_jumps.push(self.emit(Op::JumpIfFalse(0), line));
                    if let Some(b) = bind {
                        self.emit(Op::LoadLocal(subj), line);
                        let slot = self.declare_local(b, KindHint::Other, arm.span);
                        self.emit(Op::StoreLocal(slot), line);
                    }
                }
                MatchPattern::Wildcard => {}
            }
            if let Some(guard) = &arm.guard {
                self.compile_expr(guard);
                fail_jumps.push(self.emit(Op::JumpIfFalse(0), guard.span().line));
            }
            self.compile_expr(&arm.body);
            self.end_scope();
            done.push(self.emit(Op::Jump(0), line));
            for j in fail_jumps {
                self.ctx().chunk.patch_jump(j);
            }
        }
        // No arm matched.
        self.push_const(Const::Null, line);
        for j in done {
            self.ctx().chunk.patch_jump(j);
        }
        self.end_scope();
    }

    fn compile_switch_expr(
        &mut self,
        subject: &Expr,
        arms: &[(Vec<Expr>, Expr)],
        default: Option<&Expr>,
        span: Span,
    ) {
        let line = span.line;
        self.begin_scope();
        let subj = self.alloc_temp(span);
        self.compile_expr(subject);
        self.emit(Op::StoreLocal(subj), line);

        let mut done = Vec::new();
        for (values, body) in arms {
            let mut fail_jumps = Vec::new();
            let mut take_jumps = Vec::new();
            for (i, v) in values.iter().enumerate() {
                self.emit(Op::LoadLocal(subj), line);
                self.compile_expr(v);
                self.emit(Op::Eq, v.span().line);
                if i + 1 < values.len() {
                    let skip = self.emit(Op::JumpIfFalse(0), v.span().line);
                    take_jumps.push(self.emit(Op::Jump(0), v.span().line));
                    self.ctx().chunk.patch_jump(skip);
                } else {
                    fail_jumps.push(self.emit(Op::JumpIfFalse(0), v.span().line));
                }
            }
            let matched = self.ctx().chunk.code.len();
            for j in take_jumps {
                patch_jump_to(&mut self.ctx().chunk, j, matched);
            }
            self.compile_expr(body);
            done.push(self.emit(Op::Jump(0), line));
            for j in fail_jumps {
                self.ctx().chunk.patch_jump(j);
            }
        }
        match default {
            Some(d) => {
                self.compile_expr(d);
            }
            None => self.push_const(Const::Null, line),
        }
        for j in done {
            self.ctx().chunk.patch_jump(j);
        }
        self.end_scope();
    }

    // ── Hints and lookups ────────────────────────────────────────────────────

    fn hint_of(&mut self, expr: &Expr) -> KindHint {
        match expr {
            Expr::Var { name, .. } => {
                let level = self.ctxs.len() - 1;
                match self.ctxs[level].resolve_local(name) {
                    Some(slot) => self.ctxs[level].hint_of_local(slot),
                    None => KindHint::Other,
                }
            }
            Expr::ArrayLit { .. } => KindHint::Array,
            Expr::MapLit { .. } => KindHint::Map,
            Expr::SuperArrayLit { .. } => KindHint::Super,
            Expr::Cast { ty, .. } => hint_of_type(ty),
            Expr::Index { .. } => KindHint::Other,
            _ => KindHint::Other,
        }
    }

    fn static_class_name(&self, target: &StaticTarget) -> String {
        match target {
            StaticTarget::Class(name) => name.clone(),
            StaticTarget::SelfKw => self.current_class.clone().unwrap_or_else(|| "self".into()),
            StaticTarget::Parent => self
                .current_class
                .as_ref()
                .and_then(|c| self.class_ids.get(c))
                .and_then(|id| self.classes[*id as usize].parent_name.clone())
                .unwrap_or_else(|| "parent".into()),
        }
    }

    fn pick_overload(&self, name: &str, argc: usize) -> Option<&FreeFn> {
        let overloads = self.free_fns.get(name)?;
        if argc == usize::MAX {
            return overloads.first();
        }
        overloads.iter().find(|o| {
            if o.variadic {
                argc >= o.min_arity as usize
            } else {
                argc >= o.min_arity as usize && argc <= o.arity as usize
            }
        })
    }

    fn class_has_ctor(&self, id: ClassId) -> bool {
        let mut cur = Some(id);
        while let Some(cid) = cur {
            let c = &self.classes[cid as usize];
            if c.methods.contains_key("constructor") {
                return true;
            }
            cur = c.parent.or_else(|| {
                c.parent_name.as_ref().and_then(|n| self.class_ids.get(n)).copied()
            });
        }
        false
    }
}

enum VarSlot {
    Local(u16),
    Upval(u16),
    None,
}

fn hint_of_type(ty: &TypeNode) -> KindHint {
    match ty {
        TypeNode::Array { .. } => KindHint::Array,
        TypeNode::Map { .. } => KindHint::Map,
        TypeNode::Simple { name, .. } if name == "super_array" => KindHint::Super,
        TypeNode::Nullable(inner) => hint_of_type(inner),
        _ => KindHint::Other,
    }
}

fn hint_of_expr(e: &Expr) -> KindHint {
    match e {
        Expr::ArrayLit { .. } => KindHint::Array,
        Expr::MapLit { .. } => KindHint::Map,
        Expr::SuperArrayLit { .. } => KindHint::Super,
        Expr::Cast { ty, .. } => hint_of_type(ty),
        _ => KindHint::Other,
    }
}

/// Retarget a forward jump at `at` to an absolute instruction index.
fn patch_jump_to(chunk: &mut Chunk, at: usize, target: usize) {
    let offset = (target as isize - at as isize - 1).max(0) as u32;
    match &mut chunk.code[at] {
        Op::Jump(o) | Op::JumpIfFalse(o) | Op::IterNext(o) => *o = offset,
        other => unreachable!("patch_jump_to on non-jump {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Peephole
// ---------------------------------------------------------------------------

/// Remove PUSH/POP pairs and thread jump-to-jump chains. Instruction
/// positions are preserved (elided pairs become NOPs) so jump offsets,
/// line maps and exception regions stay valid.
pub fn peephole(chunk: &mut Chunk) {
    // Collect every instruction index that is a jump target or a region
    // boundary; pairs spanning one of those must not be elided.
    let mut protected = vec![false; chunk.code.len() + 1];
    for (i, op) in chunk.code.iter().enumerate() {
        match op {
            Op::Jump(o) | Op::JumpIfFalse(o) | Op::IterNext(o) => {
                let t = i + 1 + *o as usize;
                if t < protected.len() {
                    protected[t] = true;
                }
            }
            Op::Loop(o) => {
                let t = i + 1 - *o as usize;
                protected[t] = true;
            }
            _ => {}
        }
    }
    for r in &chunk.regions {
        for idx in [r.start as usize, r.end as usize] {
            if idx < protected.len() {
                protected[idx] = true;
            }
        }
        for (_, h) in &r.catches {
            protected[*h as usize] = true;
        }
        if let Some(f) = r.finally {
            protected[f as usize] = true;
        }
    }

    // PUSH k; POP  →  NOP; NOP — unless either instruction is a jump
    // target, where elision would change that path's stack depth.
    let mut i = 0;
    while i + 1 < chunk.code.len() {
        let elide = matches!(chunk.code[i], Op::Push(_))
            && matches!(chunk.code[i + 1], Op::Pop)
            && !protected[i]
            && !protected[i + 1];
        if elide {
            chunk.code[i] = Op::Nop;
            chunk.code[i + 1] = Op::Nop;
            i += 2;
        } else {
            i += 1;
        }
    }

    // Jump threading: a jump that lands on another unconditional jump takes
    // its final target directly.
    for i in 0..chunk.code.len() {
        let (is_jump, off) = match &chunk.code[i] {
            Op::Jump(o) | Op::JumpIfFalse(o) => (true, *o),
            _ => (false, 0),
        };
        if !is_jump {
            continue;
        }
        let mut target = i + 1 + off as usize;
        let mut hops = 0;
        while hops < 8 {
            match chunk.code.get(target) {
                Some(Op::Jump(o2)) => {
                    target = target + 1 + *o2 as usize;
                    hops += 1;
                }
                Some(Op::Nop) => {
                    target += 1;
                }
                _ => break,
            }
        }
        let new_off = (target - i - 1) as u32;
        match &mut chunk.code[i] {
            Op::Jump(o) | Op::JumpIfFalse(o) => *o = new_off,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn compile_src(src: &str) -> Program {
        let (file, lex, parse) = parse_source(src, 0);
        assert!(lex.is_empty(), "lex errors: {:?}", lex);
        assert!(parse.is_empty(), "parse errors: {:?}", parse);
        compile(&[file]).expect("compile should succeed")
    }

    fn entry_chunk(p: &Program) -> &Chunk {
        &p.functions[p.entry as usize].chunk
    }

    #[test]
    fn constant_folding_collapses_arithmetic() {
        let p = compile_src("echo 1 + 2;");
        let chunk = entry_chunk(&p);
        // The addition folded into a single PUSH of 3.
        assert!(chunk.consts.contains(&Const::Int(3)));
        assert!(!chunk.code.iter().any(|op| matches!(op, Op::Add)));
    }

    #[test]
    fn string_folding() {
        let p = compile_src(r#"echo "a" + "b";"#);
        assert!(entry_chunk(&p).consts.contains(&Const::Str("ab".into())));
    }

    #[test]
    fn push_pop_pairs_become_nops() {
        let p = compile_src("$x := 1; $x;");
        let chunk = entry_chunk(&p);
        // The bare-expression statement compiled to LOAD+POP; the peephole
        // only elides PUSH/POP, so the load remains.
        assert!(chunk.code.iter().any(|op| matches!(op, Op::LoadLocal(_))));
    }

    #[test]
    fn function_metadata() {
        let p = compile_src(
            r#"
            function add(int $a, int $b = 10, int ...$rest): int { return $a + $b; }
            "#,
        );
        let f = p.functions.iter().find(|f| f.name == "add").expect("function compiled");
        assert_eq!(f.min_arity, 1);
        assert_eq!(f.arity, 3);
        assert!(f.variadic);
        assert_eq!(f.defaults, vec![Const::Int(10)]);
        assert_eq!(f.returns, 1);
    }

    #[test]
    fn methods_register_in_class_tables() {
        let p = compile_src(
            r#"
            class Greeter {
                public function hi(): string { return "hi"; }
                public function hi(string $who): string { return $who; }
            }
            "#,
        );
        let class = &p.classes[0];
        assert_eq!(class.methods.get("hi").map(|v| v.len()), Some(2));
    }

    #[test]
    fn enum_values_resolve() {
        let p = compile_src("enum Color: int { Red = 1, Green, Blue = 7 }\necho Color::Green;");
        let def = &p.enums[0];
        assert_eq!(def.cases.get("Red"), Some(&Const::Int(1)));
        assert_eq!(def.cases.get("Green"), Some(&Const::Int(2)));
        assert_eq!(def.cases.get("Blue"), Some(&Const::Int(7)));
        // The case access compiled to a constant push.
        assert!(entry_chunk(&p).consts.contains(&Const::Int(2)));
    }

    #[test]
    fn try_emits_region_with_catch_and_finally() {
        let p = compile_src(
            r#"
            try { echo 1; } catch (Exception $e) { echo 2; } finally { echo 3; }
            "#,
        );
        let chunk = entry_chunk(&p);
        assert_eq!(chunk.regions.len(), 2); // outer region + nested catch-body region
        let outer = &chunk.regions[0];
        assert_eq!(outer.catches.len(), 1);
        assert!(outer.finally.is_some());
        assert!(chunk.code.iter().any(|op| matches!(op, Op::EnterFinally)));
        assert!(chunk.code.iter().any(|op| matches!(op, Op::EndFinally)));
    }

    #[test]
    fn closure_captures_by_recipe() {
        let p = compile_src(
            r#"
            int $a = 5;
            $f := function (int $x) use ($a): int { return $x + $a; };
            "#,
        );
        let chunk = entry_chunk(&p);
        let make = chunk
            .code
            .iter()
            .find_map(|op| match op {
                Op::MakeClosure { func, upvals } => Some((*func, upvals.clone())),
                _ => None,
            })
            .expect("closure emitted");
        assert_eq!(make.1.len(), 1);
        assert!(make.1[0].from_local);
        let closure_fn = &p.functions[make.0 as usize];
        assert!(closure_fn.chunk.code.iter().any(|op| matches!(op, Op::LoadUpval(0))));
    }

    #[test]
    fn foreach_lowers_to_iteration_ops() {
        let p = compile_src("$a := [1,2,3]; foreach ($a as $k => $v) { echo $v; }");
        let chunk = entry_chunk(&p);
        assert!(chunk.code.iter().any(|op| matches!(op, Op::IterNew)));
        assert!(chunk.code.iter().any(|op| matches!(op, Op::IterNext(_))));
        assert!(chunk.code.iter().any(|op| matches!(op, Op::Loop(_))));
    }

    #[test]
    fn map_literal_uses_map_ops() {
        let p = compile_src(r#"$m := map[string]int{"a": 1}; echo $m["a"];"#);
        let chunk = entry_chunk(&p);
        assert!(chunk.code.iter().any(|op| matches!(op, Op::NewMap(1))));
        assert!(chunk.code.iter().any(|op| matches!(op, Op::MapGet)));
    }

    #[test]
    fn interface_vtable_links_implementations() {
        let p = compile_src(
            r#"
            interface Shape { function area(): int; }
            class Square implements Shape {
                public function area(): int { return 4; }
            }
            "#,
        );
        let class = &p.classes[0];
        assert!(class.vtable.contains_key(&("area".to_string(), 0)));
    }

    #[test]
    fn overloaded_free_functions_get_distinct_keys() {
        let p = compile_src(
            r#"
            function f(int $a): int { return 1; }
            function f(int $a, int $b): int { return 2; }
            echo f(1, 2);
            "#,
        );
        let chunk = entry_chunk(&p);
        // The two-argument call resolves to the mangled global.
        assert!(chunk.consts.contains(&Const::Str("f#2".into())));
    }
}
