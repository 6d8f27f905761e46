/// Prism static type checker.
///
/// Strict: no implicit conversions anywhere. `int op int`, `float op float`,
/// `string + string`; every other mixed operand requires an explicit `as`.
/// Nullability is `?T ≡ T | null`; member access on a possibly-null value is
/// an error until the value is narrowed by `!= null` or `is`. Variable
/// initialization is tracked; reading an unassigned variable is an error.
/// The checker validates and reports — it never rewrites the tree.

use std::collections::HashMap;

use crate::ast::*;
use crate::errors::{CheckError, Diagnostics, Span};

// ---------------------------------------------------------------------------
// Checked types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Ty {
    Int,
    Float,
    Bool,
    Str,
    Bytes,
    Null,
    Void,
    Array(Box<Ty>, Option<usize>),
    Map(Box<Ty>, Box<Ty>),
    SuperArray,
    Function { params: Vec<Ty>, ret: Vec<Ty> },
    Class(String),
    Interface(String),
    Enum(String),
    Union(Vec<Ty>),
    /// Produced after an error so one mistake does not cascade.
    Any,
}

impl Ty {
    pub fn nullable(self) -> Ty {
        match self {
            Ty::Union(mut members) => {
                if !members.contains(&Ty::Null) {
                    members.push(Ty::Null);
                }
                Ty::Union(members)
            }
            Ty::Null | Ty::Any => self,
            other => Ty::Union(vec![other, Ty::Null]),
        }
    }

    pub fn includes_null(&self) -> bool {
        match self {
            Ty::Null => true,
            Ty::Union(ms) => ms.iter().any(|m| m.includes_null()),
            _ => false,
        }
    }

    /// The type with null stripped — what narrowing by `!= null` yields.
    pub fn without_null(&self) -> Ty {
        match self {
            Ty::Union(ms) => {
                let rest: Vec<Ty> = ms.iter().filter(|m| **m != Ty::Null).cloned().collect();
                match rest.len() {
                    0 => Ty::Null,
                    1 => rest.into_iter().next().unwrap(),
                    _ => Ty::Union(rest),
                }
            }
            other => other.clone(),
        }
    }

    pub fn display(&self) -> String {
        match self {
            Ty::Int => "int".into(),
            Ty::Float => "float".into(),
            Ty::Bool => "bool".into(),
            Ty::Str => "string".into(),
            Ty::Bytes => "bytes".into(),
            Ty::Null => "null".into(),
            Ty::Void => "void".into(),
            Ty::Array(elem, None) => format!("{}[]", elem.display()),
            Ty::Array(elem, Some(n)) => format!("{}[{}]", elem.display(), n),
            Ty::Map(k, v) => format!("map[{}]{}", k.display(), v.display()),
            Ty::SuperArray => "super_array".into(),
            Ty::Function { params, ret } => {
                let ps: Vec<String> = params.iter().map(|p| p.display()).collect();
                let rs: Vec<String> = ret.iter().map(|r| r.display()).collect();
                format!("function({}): {}", ps.join(", "), if rs.is_empty() { "void".into() } else { rs.join(", ") })
            }
            Ty::Class(n) | Ty::Interface(n) | Ty::Enum(n) => n.clone(),
            Ty::Union(ms) => ms.iter().map(|m| m.display()).collect::<Vec<_>>().join(" | "),
            Ty::Any => "<error>".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Declaration registry (pass 1 output)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ParamSig {
    pub name: String,
    pub ty: Ty,
    pub has_default: bool,
    pub variadic: bool,
}

#[derive(Debug, Clone)]
pub struct MethodSig {
    pub name: String,
    pub params: Vec<ParamSig>,
    pub ret: Vec<Ty>,
    pub is_static: bool,
    pub is_abstract: bool,
    pub is_final: bool,
    pub visibility: Visibility,
    pub span: Span,
}

impl MethodSig {
    pub fn min_arity(&self) -> usize {
        self.params.iter().filter(|p| !p.has_default && !p.variadic).count()
    }

    pub fn max_arity(&self) -> Option<usize> {
        if self.params.iter().any(|p| p.variadic) {
            None
        } else {
            Some(self.params.len())
        }
    }

    pub fn accepts(&self, argc: usize) -> bool {
        argc >= self.min_arity() && self.max_arity().map_or(true, |m| argc <= m)
    }
}

#[derive(Debug, Clone)]
pub struct PropSig {
    pub name: String,
    pub ty: Ty,
    pub is_static: bool,
    pub visibility: Visibility,
    pub has_default: bool,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ClassSig {
    pub name: String,
    pub parent: Option<String>,
    pub interfaces: Vec<String>,
    pub is_abstract: bool,
    pub is_final: bool,
    pub props: Vec<PropSig>,
    pub consts: Vec<(String, Ty)>,
    pub methods: Vec<MethodSig>,
}

#[derive(Debug, Clone)]
pub struct InterfaceSig {
    pub name: String,
    pub extends: Vec<String>,
    pub consts: Vec<(String, Ty)>,
    pub methods: Vec<MethodSig>,
}

#[derive(Debug, Clone)]
pub struct EnumSig {
    pub name: String,
    pub underlying: Option<Ty>,
    pub cases: Vec<String>,
}

/// Everything the declaration-collection pass learned about the program.
#[derive(Debug, Default)]
pub struct Registry {
    pub classes: HashMap<String, ClassSig>,
    pub interfaces: HashMap<String, InterfaceSig>,
    pub enums: HashMap<String, EnumSig>,
    pub functions: HashMap<String, Vec<MethodSig>>,
    pub aliases: HashMap<String, Ty>,
    /// New types: distinct names over a base, explicit conversion required.
    pub newtypes: HashMap<String, Ty>,
}

impl Registry {
    pub fn lookup_method<'a>(&'a self, class: &str, name: &str, argc: usize) -> Option<(&'a ClassSig, &'a MethodSig)> {
        let mut cur = self.classes.get(class);
        while let Some(sig) = cur {
            if let Some(m) = sig.methods.iter().find(|m| m.name == name && m.accepts(argc)) {
                return Some((sig, m));
            }
            // Interface defaults dispatch by the same (name, argc) rule.
            for iface in &sig.interfaces {
                if let Some(isig) = self.interfaces.get(iface) {
                    if let Some(m) = isig.methods.iter().find(|m| m.name == name && m.accepts(argc)) {
                        return Some((sig, m));
                    }
                }
            }
            cur = sig.parent.as_ref().and_then(|p| self.classes.get(p));
        }
        None
    }

    pub fn lookup_prop<'a>(&'a self, class: &str, name: &str) -> Option<(&'a ClassSig, &'a PropSig)> {
        let mut cur = self.classes.get(class);
        while let Some(sig) = cur {
            if let Some(p) = sig.props.iter().find(|p| p.name == name) {
                return Some((sig, p));
            }
            cur = sig.parent.as_ref().and_then(|p| self.classes.get(p));
        }
        None
    }

    pub fn lookup_const(&self, owner: &str, name: &str) -> Option<Ty> {
        let mut cur = self.classes.get(owner);
        while let Some(sig) = cur {
            if let Some((_, ty)) = sig.consts.iter().find(|(n, _)| n == name) {
                return Some(ty.clone());
            }
            cur = sig.parent.as_ref().and_then(|p| self.classes.get(p));
        }
        self.interfaces
            .get(owner)
            .and_then(|i| i.consts.iter().find(|(n, _)| n == name).map(|(_, t)| t.clone()))
    }

    /// Is `sub` the same class as `sup`, or a descendant / implementor?
    pub fn is_subtype_name(&self, sub: &str, sup: &str) -> bool {
        if sub == sup {
            return true;
        }
        let mut cur = self.classes.get(sub);
        while let Some(sig) = cur {
            if sig.name == sup {
                return true;
            }
            if sig.interfaces.iter().any(|i| i == sup || self.iface_extends(i, sup)) {
                return true;
            }
            cur = sig.parent.as_ref().and_then(|p| self.classes.get(p));
        }
        false
    }

    fn iface_extends(&self, iface: &str, target: &str) -> bool {
        if iface == target {
            return true;
        }
        self.interfaces
            .get(iface)
            .map_or(false, |i| i.extends.iter().any(|e| self.iface_extends(e, target)))
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct VarInfo {
    ty: Ty,
    initialized: bool,
}

#[derive(Default)]
struct Scopes {
    frames: Vec<HashMap<String, VarInfo>>,
}

impl Scopes {
    fn push(&mut self) {
        self.frames.push(HashMap::new());
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn declare(&mut self, name: &str, ty: Ty, initialized: bool) {
        if let Some(top) = self.frames.last_mut() {
            top.insert(name.to_string(), VarInfo { ty, initialized });
        }
    }

    fn get(&self, name: &str) -> Option<&VarInfo> {
        self.frames.iter().rev().find_map(|f| f.get(name))
    }

    fn mark_initialized(&mut self, name: &str) {
        for frame in self.frames.iter_mut().rev() {
            if let Some(v) = frame.get_mut(name) {
                v.initialized = true;
                return;
            }
        }
    }

    /// Temporarily override a variable's type (narrowing).
    fn narrow(&mut self, name: &str, ty: Ty) {
        for frame in self.frames.iter_mut().rev() {
            if let Some(v) = frame.get_mut(name) {
                v.ty = ty;
                return;
            }
        }
    }

    fn snapshot(&self) -> Vec<HashMap<String, VarInfo>> {
        self.frames.clone()
    }

    fn restore(&mut self, snap: Vec<HashMap<String, VarInfo>>) {
        self.frames = snap;
    }
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

struct FnCtx {
    ret: Vec<Ty>,
    in_loop: u32,
    /// Class the method body belongs to, for this/self/parent/visibility.
    class: Option<String>,
    is_static: bool,
}

pub struct Checker {
    pub registry: Registry,
    scopes: Scopes,
    errors: Vec<CheckError>,
    warnings: Vec<(String, Span)>,
}

pub struct CheckOutcome {
    pub registry: Registry,
    pub diagnostics: Diagnostics,
    pub ok: bool,
}

impl Checker {
    pub fn new() -> Self {
        Checker {
            registry: Registry::default(),
            scopes: Scopes::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn check_file(mut self, file: &File) -> CheckOutcome {
        self.collect(file);
        self.validate_hierarchy(file);
        self.check_bodies(file);

        let mut diagnostics = Diagnostics::new();
        for e in &self.errors {
            diagnostics.push_check(e);
        }
        for (msg, span) in &self.warnings {
            diagnostics.warning("TypeError", msg.clone(), *span);
        }
        let ok = self.errors.is_empty();
        CheckOutcome { registry: self.registry, diagnostics, ok }
    }

    fn error(&mut self, e: CheckError) {
        self.errors.push(e);
    }

    // ── Pass 1: collect declarations ─────────────────────────────────────────

    fn collect(&mut self, file: &File) {
        for decl in &file.decls {
            match decl {
                Decl::TypeAlias { name, target, span } => {
                    let ty = self.resolve_type_for_collect(target);
                    if self.registry.aliases.insert(name.clone(), ty).is_some() {
                        self.error(CheckError::DuplicateDefinition { name: name.clone(), span: *span });
                    }
                }
                Decl::NewType { name, base, span } => {
                    let ty = self.resolve_type_for_collect(base);
                    if self.registry.newtypes.insert(name.clone(), ty).is_some() {
                        self.error(CheckError::DuplicateDefinition { name: name.clone(), span: *span });
                    }
                }
                _ => {}
            }
        }

        for decl in &file.decls {
            match decl {
                Decl::Class(c) => {
                    let sig = ClassSig {
                        name: c.name.clone(),
                        parent: c.parent.clone(),
                        interfaces: c.interfaces.clone(),
                        is_abstract: c.is_abstract,
                        is_final: c.is_final,
                        props: c
                            .props
                            .iter()
                            .map(|p| PropSig {
                                name: p.name.clone(),
                                ty: self.resolve_type_for_collect(&p.ty),
                                is_static: p.is_static,
                                visibility: p.visibility,
                                has_default: p.default.is_some(),
                                span: p.span,
                            })
                            .collect(),
                        consts: c
                            .consts
                            .iter()
                            .map(|k| {
                                let ty = k
                                    .ty
                                    .as_ref()
                                    .map(|t| self.resolve_type_for_collect(t))
                                    .unwrap_or(Ty::Any);
                                (k.name.clone(), ty)
                            })
                            .collect(),
                        methods: c.methods.iter().map(|m| self.method_sig(m)).collect(),
                    };
                    if self.registry.classes.insert(c.name.clone(), sig).is_some() {
                        self.error(CheckError::DuplicateDefinition { name: c.name.clone(), span: c.span });
                    }
                }
                Decl::Interface(i) => {
                    let sig = InterfaceSig {
                        name: i.name.clone(),
                        extends: i.extends.clone(),
                        consts: i
                            .consts
                            .iter()
                            .map(|k| {
                                let ty = k
                                    .ty
                                    .as_ref()
                                    .map(|t| self.resolve_type_for_collect(t))
                                    .unwrap_or(Ty::Any);
                                (k.name.clone(), ty)
                            })
                            .collect(),
                        methods: i.methods.iter().map(|m| self.method_sig(m)).collect(),
                    };
                    if self.registry.interfaces.insert(i.name.clone(), sig).is_some() {
                        self.error(CheckError::DuplicateDefinition { name: i.name.clone(), span: i.span });
                    }
                }
                Decl::Enum(e) => {
                    let sig = EnumSig {
                        name: e.name.clone(),
                        underlying: e.underlying.as_ref().map(|t| self.resolve_type_for_collect(t)),
                        cases: e.cases.iter().map(|c| c.name.clone()).collect(),
                    };
                    if self.registry.enums.insert(e.name.clone(), sig).is_some() {
                        self.error(CheckError::DuplicateDefinition { name: e.name.clone(), span: e.span });
                    }
                }
                Decl::Function(f) => {
                    let sig = self.method_sig(f);
                    let is_dup = {
                        let overloads = self.registry.functions.entry(f.name.clone()).or_default();
                        overloads.iter().any(|o| o.params.len() == sig.params.len())
                    };
                    if is_dup {
                        self.error(CheckError::DuplicateDefinition { name: f.name.clone(), span: f.span });
                    }
                    self.registry.functions.entry(f.name.clone()).or_default().push(sig);
                }
                Decl::TypeAlias { .. } | Decl::NewType { .. } => {}
            }
        }
    }

    fn method_sig(&mut self, f: &FunctionDecl) -> MethodSig {
        MethodSig {
            name: f.name.clone(),
            params: f
                .params
                .iter()
                .map(|p| ParamSig {
                    name: p.name.clone(),
                    ty: self.resolve_type_for_collect(&p.ty),
                    has_default: p.default.is_some(),
                    variadic: p.variadic,
                })
                .collect(),
            ret: f.ret.iter().map(|t| self.resolve_type_for_collect(t)).collect(),
            is_static: f.is_static,
            is_abstract: f.is_abstract,
            is_final: f.is_final,
            visibility: f.visibility,
            span: f.span,
        }
    }

    /// Type resolution that tolerates not-yet-collected names (pass 1 runs
    /// before every class is registered, so unknown names resolve to class
    /// references and are validated later).
    fn resolve_type_for_collect(&mut self, node: &TypeNode) -> Ty {
        self.resolve_type_inner(node, false)
    }

    fn resolve_type(&mut self, node: &TypeNode) -> Ty {
        self.resolve_type_inner(node, true)
    }

    fn resolve_type_inner(&mut self, node: &TypeNode, strict: bool) -> Ty {
        match node {
            TypeNode::Simple { name, span } => match name.as_str() {
                "int" => Ty::Int,
                "float" => Ty::Float,
                "bool" => Ty::Bool,
                "string" => Ty::Str,
                "bytes" => Ty::Bytes,
                "void" => Ty::Void,
                other => {
                    if let Some(alias) = self.registry.aliases.get(other) {
                        return alias.clone();
                    }
                    if let Some(base) = self.registry.newtypes.get(other) {
                        // New types check structurally as their base but keep
                        // requiring explicit conversion at `as` sites.
                        return base.clone();
                    }
                    if self.registry.interfaces.contains_key(other) {
                        return Ty::Interface(other.to_string());
                    }
                    if self.registry.enums.contains_key(other) {
                        return Ty::Enum(other.to_string());
                    }
                    if strict && !self.registry.classes.contains_key(other) {
                        self.error(CheckError::UndefinedType { name: other.to_string(), span: *span });
                        return Ty::Any;
                    }
                    Ty::Class(other.to_string())
                }
            },
            TypeNode::Nullable(inner) => self.resolve_type_inner(inner, strict).nullable(),
            TypeNode::Array { elem, len, .. } => {
                Ty::Array(Box::new(self.resolve_type_inner(elem, strict)), *len)
            }
            TypeNode::Map { key, value, .. } => Ty::Map(
                Box::new(self.resolve_type_inner(key, strict)),
                Box::new(self.resolve_type_inner(value, strict)),
            ),
            TypeNode::Function { params, ret, .. } => Ty::Function {
                params: params.iter().map(|p| self.resolve_type_inner(p, strict)).collect(),
                ret: {
                    let r = self.resolve_type_inner(ret, strict);
                    if r == Ty::Void { vec![] } else { vec![r] }
                },
            },
            TypeNode::Tuple(types, _) => {
                // Only legal in return position; handled by the caller.
                Ty::Union(types.iter().map(|t| self.resolve_type_inner(t, strict)).collect())
            }
            TypeNode::Union(members, _) => {
                Ty::Union(members.iter().map(|m| self.resolve_type_inner(m, strict)).collect())
            }
            TypeNode::Generic { base, span, .. } => {
                // Surface generics erase to their base.
                self.resolve_type_inner(&TypeNode::Simple { name: base.clone(), span: *span }, strict)
            }
        }
    }

    // ── Pass 2: hierarchy validation ─────────────────────────────────────────

    fn validate_hierarchy(&mut self, file: &File) {
        let classes: Vec<ClassSig> = self.registry.classes.values().cloned().collect();
        for sig in &classes {
            if let Some(parent) = &sig.parent {
                match self.registry.classes.get(parent) {
                    None if crate::intrinsics::is_builtin_exception(parent) => {}
                    None => {
                        let span = decl_span(file, &sig.name);
                        self.error(CheckError::UndefinedType { name: parent.clone(), span });
                    }
                    Some(p) if p.is_final => {
                        let span = decl_span(file, &sig.name);
                        self.error(CheckError::FinalOverride { name: parent.clone(), span });
                    }
                    _ => {}
                }
            }
            for iface in &sig.interfaces {
                if !self.registry.interfaces.contains_key(iface) {
                    let span = decl_span(file, &sig.name);
                    self.error(CheckError::UndefinedType { name: iface.clone(), span });
                }
            }

            // Final methods may not be overridden.
            if let Some(parent) = &sig.parent {
                for m in &sig.methods {
                    let mut cur = self.registry.classes.get(parent);
                    while let Some(psig) = cur {
                        if let Some(pm) = psig
                            .methods
                            .iter()
                            .find(|pm| pm.name == m.name && pm.params.len() == m.params.len())
                        {
                            if pm.is_final {
                                self.error(CheckError::FinalOverride { name: m.name.clone(), span: m.span });
                            }
                            break;
                        }
                        cur = psig.parent.as_ref().and_then(|p| self.registry.classes.get(p));
                    }
                }
            }

            // Concrete classes must implement every inherited abstract method
            // and every interface method.
            if !sig.is_abstract {
                let mut required: Vec<(String, usize, String)> = Vec::new();
                let mut cur = sig.parent.as_ref().and_then(|p| self.registry.classes.get(p));
                while let Some(psig) = cur {
                    for m in psig.methods.iter().filter(|m| m.is_abstract) {
                        required.push((m.name.clone(), m.params.len(), psig.name.clone()));
                    }
                    cur = psig.parent.as_ref().and_then(|p| self.registry.classes.get(p));
                }
                for iface in &sig.interfaces {
                    if let Some(isig) = self.registry.interfaces.get(iface) {
                        for m in &isig.methods {
                            required.push((m.name.clone(), m.params.len(), isig.name.clone()));
                        }
                    }
                }
                for (name, argc, _owner) in required {
                    if self.registry.lookup_method(&sig.name, &name, argc).map_or(true, |(_, m)| m.is_abstract) {
                        let span = decl_span(file, &sig.name);
                        self.error(CheckError::AbstractNotImplemented {
                            class: sig.name.clone(),
                            method: name,
                            span,
                        });
                    }
                }
            }
        }
    }

    // ── Pass 3: bodies ───────────────────────────────────────────────────────

    fn check_bodies(&mut self, file: &File) {
        for decl in &file.decls {
            match decl {
                Decl::Function(f) => self.check_function(f, None),
                Decl::Class(c) => {
                    for p in &c.props {
                        if let Some(default) = &p.default {
                            let expected = self.resolve_type(&p.ty);
                            self.check_const_expr(default, &expected);
                        }
                    }
                    for m in &c.methods {
                        self.check_function(m, Some(c.name.clone()));
                    }
                }
                _ => {}
            }
        }

        // Top-level statements run as an implicit void function.
        let mut ctx = FnCtx { ret: vec![], in_loop: 0, class: None, is_static: false };
        self.scopes.push();
        for stmt in &file.stmts {
            self.check_stmt(stmt, &mut ctx);
        }
        self.scopes.pop();
    }

    fn check_const_expr(&mut self, expr: &Expr, expected: &Ty) {
        let mut ctx = FnCtx { ret: vec![], in_loop: 0, class: None, is_static: false };
        self.scopes.push();
        let found = self.check_expr(expr, &mut ctx);
        self.scopes.pop();
        if !self.compatible(expected, &found) {
            self.error(CheckError::TypeMismatch {
                expected: expected.display(),
                found: found.display(),
                span: expr.span(),
            });
        }
    }

    fn check_function(&mut self, f: &FunctionDecl, class: Option<String>) {
        let Some(body) = &f.body else { return };

        let ret: Vec<Ty> = f.ret.iter().map(|t| self.resolve_type(t)).collect();
        let mut ctx = FnCtx { ret, in_loop: 0, class, is_static: f.is_static };

        self.scopes.push();
        for p in &f.params {
            let mut ty = self.resolve_type(&p.ty);
            if p.variadic {
                ty = Ty::Array(Box::new(ty), None);
            }
            if let Some(default) = &p.default {
                let dty = self.check_expr(default, &mut ctx);
                if !self.compatible(&ty, &dty) {
                    self.error(CheckError::TypeMismatch {
                        expected: ty.display(),
                        found: dty.display(),
                        span: default.span(),
                    });
                }
            }
            self.scopes.declare(&p.name, ty, true);
        }
        let mut reachable = true;
        for stmt in body {
            if !reachable {
                self.warnings.push(("unreachable code".into(), stmt.span()));
                break;
            }
            reachable = self.check_stmt(stmt, &mut ctx);
        }
        self.scopes.pop();
    }

    /// Returns whether the statement can fall through to its successor.
    fn check_stmt(&mut self, stmt: &Stmt, ctx: &mut FnCtx) -> bool {
        match stmt {
            Stmt::Expr(e) => {
                self.check_expr(e, ctx);
                true
            }
            Stmt::VarDecl { ty, name, init, span } => {
                let declared = ty.as_ref().map(|t| self.resolve_type(t));
                match init {
                    Some(e) => {
                        let found = self.check_expr(e, ctx);
                        let final_ty = match declared {
                            Some(d) => {
                                if !self.compatible(&d, &found) {
                                    self.error(CheckError::TypeMismatch {
                                        expected: d.display(),
                                        found: found.display(),
                                        span: e.span(),
                                    });
                                }
                                d
                            }
                            None => found,
                        };
                        self.scopes.declare(name, final_ty, true);
                    }
                    None => {
                        let d = declared.unwrap_or(Ty::Any);
                        if d == Ty::Any {
                            self.error(CheckError::TypeMismatch {
                                expected: "a declared type or an initializer".into(),
                                found: "neither".into(),
                                span: *span,
                            });
                        }
                        self.scopes.declare(name, d, false);
                    }
                }
                true
            }
            Stmt::MultiVarDecl { targets, init, span } => {
                let found = self.check_multi_expr(init, ctx);
                if found.len() != targets.len() && !found.iter().any(|t| *t == Ty::Any) {
                    self.error(CheckError::ReturnCount {
                        expected: targets.len(),
                        found: found.len(),
                        span: *span,
                    });
                }
                for (i, (ty, name)) in targets.iter().enumerate() {
                    let got = found.get(i).cloned().unwrap_or(Ty::Any);
                    let final_ty = match ty {
                        Some(t) => {
                            let d = self.resolve_type(t);
                            if !self.compatible(&d, &got) {
                                self.error(CheckError::TypeMismatch {
                                    expected: d.display(),
                                    found: got.display(),
                                    span: *span,
                                });
                            }
                            d
                        }
                        None => got,
                    };
                    self.scopes.declare(name, final_ty, true);
                }
                true
            }
            Stmt::Block(body, _) => {
                self.scopes.push();
                let mut reachable = true;
                for s in body {
                    if !reachable {
                        self.warnings.push(("unreachable code".into(), s.span()));
                        break;
                    }
                    reachable = self.check_stmt(s, ctx);
                }
                self.scopes.pop();
                reachable
            }
            Stmt::If { cond, then, elseifs, else_branch, .. } => {
                self.check_condition(cond, ctx);

                let snap = self.scopes.snapshot();
                self.apply_narrowing(cond);
                self.scopes.push();
                let mut then_falls = true;
                for s in then {
                    if !then_falls {
                        break;
                    }
                    then_falls = self.check_stmt(s, ctx);
                }
                self.scopes.pop();
                self.scopes.restore(snap);

                for (c, body) in elseifs {
                    self.check_condition(c, ctx);
                    let snap = self.scopes.snapshot();
                    self.apply_narrowing(c);
                    self.scopes.push();
                    let mut falls = true;
                    for s in body {
                        if !falls {
                            break;
                        }
                        falls = self.check_stmt(s, ctx);
                    }
                    self.scopes.pop();
                    self.scopes.restore(snap);
                }

                let mut else_falls = true;
                if let Some(body) = else_branch {
                    self.scopes.push();
                    for s in body {
                        if !else_falls {
                            break;
                        }
                        else_falls = self.check_stmt(s, ctx);
                    }
                    self.scopes.pop();
                } else {
                    // No else: control may skip the whole statement.
                    return true;
                }
                then_falls || else_falls || !elseifs.is_empty()
            }
            Stmt::Switch { subject, arms, default, .. } => {
                let sty = self.check_expr(subject, ctx);
                for arm in arms {
                    for v in &arm.values {
                        let vty = self.check_expr(v, ctx);
                        if !self.comparable(&sty, &vty) {
                            self.error(CheckError::TypeMismatch {
                                expected: sty.display(),
                                found: vty.display(),
                                span: v.span(),
                            });
                        }
                    }
                    ctx.in_loop += 1; // `break` is legal inside a case body
                    self.scopes.push();
                    for s in &arm.body {
                        self.check_stmt(s, ctx);
                    }
                    self.scopes.pop();
                    ctx.in_loop -= 1;
                }
                if let Some(body) = default {
                    ctx.in_loop += 1;
                    self.scopes.push();
                    for s in body {
                        self.check_stmt(s, ctx);
                    }
                    self.scopes.pop();
                    ctx.in_loop -= 1;
                }
                true
            }
            Stmt::For { init, cond, step, body, .. } => {
                self.scopes.push();
                if let Some(i) = init {
                    self.check_stmt(i, ctx);
                }
                if let Some(c) = cond {
                    self.check_condition(c, ctx);
                }
                if let Some(s) = step {
                    self.check_expr(s, ctx);
                }
                ctx.in_loop += 1;
                self.scopes.push();
                for s in body {
                    self.check_stmt(s, ctx);
                }
                self.scopes.pop();
                ctx.in_loop -= 1;
                self.scopes.pop();
                true
            }
            Stmt::Foreach { subject, key, value, body, .. } => {
                let sty = self.check_expr(subject, ctx);
                let (kty, vty) = match &sty {
                    Ty::Array(elem, _) => (Ty::Int, (**elem).clone()),
                    Ty::Map(k, v) => ((**k).clone(), (**v).clone()),
                    Ty::SuperArray => (Ty::Union(vec![Ty::Int, Ty::Str]), Ty::Any),
                    Ty::Any => (Ty::Any, Ty::Any),
                    other => {
                        self.error(CheckError::NotIterable { ty: other.display(), span: subject.span() });
                        (Ty::Any, Ty::Any)
                    }
                };
                self.scopes.push();
                if let Some(k) = key {
                    self.scopes.declare(k, kty, true);
                }
                self.scopes.declare(value, vty, true);
                ctx.in_loop += 1;
                for s in body {
                    self.check_stmt(s, ctx);
                }
                ctx.in_loop -= 1;
                self.scopes.pop();
                true
            }
            Stmt::While { cond, body, .. } => {
                self.check_condition(cond, ctx);
                ctx.in_loop += 1;
                self.scopes.push();
                for s in body {
                    self.check_stmt(s, ctx);
                }
                self.scopes.pop();
                ctx.in_loop -= 1;
                true
            }
            Stmt::DoWhile { body, cond, .. } => {
                ctx.in_loop += 1;
                self.scopes.push();
                for s in body {
                    self.check_stmt(s, ctx);
                }
                self.scopes.pop();
                ctx.in_loop -= 1;
                self.check_condition(cond, ctx);
                true
            }
            Stmt::Break(span) | Stmt::Continue(span) => {
                if ctx.in_loop == 0 {
                    let kw = if matches!(stmt, Stmt::Break(_)) { "break" } else { "continue" };
                    self.error(CheckError::LoopControlOutsideLoop { kw: kw.into(), span: *span });
                }
                false
            }
            Stmt::Return { values, span } => {
                let expected = ctx.ret.clone();
                if values.len() != expected.len() {
                    self.error(CheckError::ReturnCount {
                        expected: expected.len(),
                        found: values.len(),
                        span: *span,
                    });
                }
                for (i, v) in values.iter().enumerate() {
                    let found = self.check_expr(v, ctx);
                    if let Some(want) = expected.get(i) {
                        if !self.compatible(want, &found) {
                            self.error(CheckError::TypeMismatch {
                                expected: want.display(),
                                found: found.display(),
                                span: v.span(),
                            });
                        }
                    }
                }
                false
            }
            Stmt::Try { body, catches, finally, .. } => {
                self.scopes.push();
                for s in body {
                    self.check_stmt(s, ctx);
                }
                self.scopes.pop();
                for c in catches {
                    if !self.registry.classes.contains_key(&c.class)
                        && !crate::intrinsics::is_builtin_exception(&c.class)
                    {
                        self.error(CheckError::UndefinedType { name: c.class.clone(), span: c.span });
                    }
                    self.scopes.push();
                    self.scopes.declare(&c.var, Ty::Class(c.class.clone()), true);
                    for s in &c.body {
                        self.check_stmt(s, ctx);
                    }
                    self.scopes.pop();
                }
                if let Some(body) = finally {
                    self.scopes.push();
                    for s in body {
                        self.check_stmt(s, ctx);
                    }
                    self.scopes.pop();
                }
                true
            }
            Stmt::Throw { value, .. } => {
                let ty = self.check_expr(value, ctx);
                match &ty {
                    Ty::Class(_) | Ty::Any => {}
                    other => self.error(CheckError::TypeMismatch {
                        expected: "an exception object".into(),
                        found: other.display(),
                        span: value.span(),
                    }),
                }
                false
            }
            Stmt::Echo { value, .. } => {
                self.check_expr(value, ctx);
                true
            }
        }
    }

    fn check_condition(&mut self, cond: &Expr, ctx: &mut FnCtx) {
        let ty = self.check_expr(cond, ctx);
        if !matches!(ty, Ty::Bool | Ty::Any) {
            self.error(CheckError::NonBoolCondition { found: ty.display(), span: cond.span() });
        }
    }

    /// Narrowing facts from a condition, applied in the true branch only:
    /// `$x != null`, `$x is T`, conjunctions of both.
    fn apply_narrowing(&mut self, cond: &Expr) {
        match cond {
            Expr::Binary { op: BinOp::And, lhs, rhs, .. } => {
                self.apply_narrowing(lhs);
                self.apply_narrowing(rhs);
            }
            Expr::Binary { op: BinOp::Ne, lhs, rhs, .. } => {
                if let (Expr::Var { name, .. }, Expr::Null(_)) = (lhs.as_ref(), rhs.as_ref()) {
                    if let Some(info) = self.scopes.get(name) {
                        let narrowed = info.ty.without_null();
                        self.scopes.narrow(name, narrowed);
                    }
                }
                if let (Expr::Null(_), Expr::Var { name, .. }) = (lhs.as_ref(), rhs.as_ref()) {
                    if let Some(info) = self.scopes.get(name) {
                        let narrowed = info.ty.without_null();
                        self.scopes.narrow(name, narrowed);
                    }
                }
            }
            Expr::Is { expr, ty, .. } => {
                if let Expr::Var { name, .. } = expr.as_ref() {
                    let narrowed = self.resolve_type(ty);
                    if self.scopes.get(name).is_some() {
                        self.scopes.narrow(name, narrowed);
                    }
                }
            }
            _ => {}
        }
    }

    // ── Expressions ──────────────────────────────────────────────────────────

    fn check_multi_expr(&mut self, expr: &Expr, ctx: &mut FnCtx) -> Vec<Ty> {
        // A call to a multi-return function yields several values; anything
        // else yields one.
        if let Expr::Call { callee: Callee::Named(name), args, span } = expr {
            let argc = args.len();
            if let Some(sig) = self
                .registry
                .functions
                .get(name)
                .and_then(|ov| ov.iter().find(|s| s.accepts(argc)))
                .cloned()
            {
                self.check_call_args(&sig, args, ctx, *span);
                return sig.ret.clone();
            }
        }
        vec![self.check_expr(expr, ctx)]
    }

    fn check_expr(&mut self, expr: &Expr, ctx: &mut FnCtx) -> Ty {
        match expr {
            Expr::Null(_) => Ty::Null,
            Expr::Bool(..) => Ty::Bool,
            Expr::Int(..) => Ty::Int,
            Expr::Float(..) => Ty::Float,
            Expr::Str(..) => Ty::Str,
            Expr::Interp { parts, .. } => {
                for p in parts {
                    if let InterpSeg::Var(name, span) = p {
                        self.check_var_read(name, *span);
                    }
                }
                Ty::Str
            }
            Expr::Var { name, span } => self.check_var_read(name, *span),
            Expr::Ident { name, span } => {
                if let Some(overloads) = self.registry.functions.get(name) {
                    let sig = &overloads[0];
                    return Ty::Function {
                        params: sig.params.iter().map(|p| p.ty.clone()).collect(),
                        ret: sig.ret.clone(),
                    };
                }
                if self.registry.classes.contains_key(name) {
                    return Ty::Class(name.clone());
                }
                if self.registry.enums.contains_key(name) {
                    return Ty::Enum(name.clone());
                }
                self.error(CheckError::UndefinedFunction { name: name.clone(), span: *span });
                Ty::Any
            }
            Expr::This(span) => match (&ctx.class, ctx.is_static) {
                (Some(c), false) => Ty::Class(c.clone()),
                _ => {
                    self.error(CheckError::UndefinedVariable { name: "this".into(), span: *span });
                    Ty::Any
                }
            },
            Expr::Unary { op, expr, span } => {
                let ty = self.check_expr(expr, ctx);
                match op {
                    UnaryOp::Neg => match ty {
                        Ty::Int | Ty::Float | Ty::Any => ty,
                        other => {
                            self.error(CheckError::BadOperand { op: "-".into(), ty: other.display(), span: *span });
                            Ty::Any
                        }
                    },
                    UnaryOp::Not => match ty {
                        Ty::Bool | Ty::Any => Ty::Bool,
                        other => {
                            self.error(CheckError::BadOperand { op: "!".into(), ty: other.display(), span: *span });
                            Ty::Bool
                        }
                    },
                    UnaryOp::BitNot => match ty {
                        Ty::Int | Ty::Any => Ty::Int,
                        other => {
                            self.error(CheckError::BadOperand { op: "~".into(), ty: other.display(), span: *span });
                            Ty::Int
                        }
                    },
                    UnaryOp::PreInc | UnaryOp::PreDec => match ty {
                        Ty::Int | Ty::Float | Ty::Any => ty,
                        other => {
                            self.error(CheckError::BadOperand { op: "++".into(), ty: other.display(), span: *span });
                            Ty::Any
                        }
                    },
                }
            }
            Expr::Postfix { expr, span, .. } => {
                let ty = self.check_expr(expr, ctx);
                match ty {
                    Ty::Int | Ty::Float | Ty::Any => ty,
                    other => {
                        self.error(CheckError::BadOperand { op: "++".into(), ty: other.display(), span: *span });
                        Ty::Any
                    }
                }
            }
            Expr::Binary { op, lhs, rhs, span } => self.check_binary(*op, lhs, rhs, *span, ctx),
            Expr::Ternary { cond, then, otherwise, .. } => {
                match then {
                    Some(t) => {
                        self.check_condition(cond, ctx);
                        let else_ty = self.check_expr(otherwise, ctx);
                        let snap = self.scopes.snapshot();
                        self.apply_narrowing(cond);
                        let then_ty = self.check_expr(t, ctx);
                        self.scopes.restore(snap);
                        if self.compatible(&then_ty, &else_ty) || self.compatible(&else_ty, &then_ty) {
                            then_ty
                        } else {
                            Ty::Union(vec![then_ty, else_ty])
                        }
                    }
                    None => {
                        // Elvis keeps the condition value when truthy, so
                        // any type is legal on the left.
                        let cond_ty = self.check_expr(cond, ctx);
                        let else_ty = self.check_expr(otherwise, ctx);
                        if self.compatible(&cond_ty, &else_ty) || self.compatible(&else_ty, &cond_ty) {
                            cond_ty.without_null()
                        } else {
                            Ty::Union(vec![cond_ty.without_null(), else_ty])
                        }
                    }
                }
            }
            Expr::Assign { target, op, value, span } => {
                let tty = self.check_assign_target(target, ctx);
                let vty = self.check_expr(value, ctx);
                if *op != AssignOp::Assign {
                    // Compound assignment follows the binary-op rules.
                    if !self.same_arith_family(&tty, &vty) {
                        self.error(CheckError::MixedOperands {
                            op: "op=".into(),
                            lhs: tty.display(),
                            rhs: vty.display(),
                            span: *span,
                        });
                    }
                } else if !self.compatible(&tty, &vty) {
                    self.error(CheckError::TypeMismatch {
                        expected: tty.display(),
                        found: vty.display(),
                        span: value.span(),
                    });
                }
                if let Expr::Var { name, .. } = target.as_ref() {
                    self.scopes.mark_initialized(name);
                }
                tty
            }
            Expr::Cast { expr, ty, safe, span } => {
                let from = self.check_expr(expr, ctx);
                let to = self.resolve_type(ty);
                if !self.cast_plausible(&from, &to) {
                    self.error(CheckError::InvalidCast {
                        from: from.display(),
                        to: to.display(),
                        span: *span,
                    });
                }
                if *safe {
                    to.nullable()
                } else {
                    to
                }
            }
            Expr::Is { expr, ty, .. } => {
                self.check_expr(expr, ctx);
                self.resolve_type(ty);
                Ty::Bool
            }
            Expr::Prop { obj, name, span } => {
                let oty = self.check_expr(obj, ctx);
                self.member_type(&oty, name, *span, ctx)
            }
            Expr::MethodCall { obj, name, args, span } => {
                let oty = self.check_expr(obj, ctx);
                self.method_call_type(&oty, name, args, *span, ctx)
            }
            Expr::StaticAccess { target, member, is_var, span } => {
                let owner = self.static_owner(target, ctx, *span);
                let Some(owner) = owner else { return Ty::Any };
                if let Some(esig) = self.registry.enums.get(&owner) {
                    if esig.cases.iter().any(|c| c == member) {
                        return Ty::Enum(owner);
                    }
                }
                if *is_var {
                    let found = self
                        .registry
                        .lookup_prop(&owner, member)
                        .map(|(_, p)| (p.is_static, p.ty.clone()));
                    if let Some((is_static, ty)) = found {
                        if !is_static {
                            self.error(CheckError::UndefinedMember {
                                owner: owner.clone(),
                                name: member.clone(),
                                span: *span,
                            });
                        }
                        return ty;
                    }
                } else if let Some(ty) = self.registry.lookup_const(&owner, member) {
                    return ty;
                }
                self.error(CheckError::UndefinedMember { owner, name: member.clone(), span: *span });
                Ty::Any
            }
            Expr::StaticCall { target, method, args, span } => {
                let owner = self.static_owner(target, ctx, *span);
                let Some(owner) = owner else { return Ty::Any };
                let argc = args.len();
                match self.registry.lookup_method(&owner, method, argc) {
                    Some((_, sig)) => {
                        let sig = sig.clone();
                        self.check_call_args(&sig, args, ctx, *span);
                        self.visibility_check(&owner, &sig.name, sig.visibility, ctx, *span);
                        sig.ret.first().cloned().unwrap_or(Ty::Void)
                    }
                    None => {
                        self.error(CheckError::UndefinedMember {
                            owner,
                            name: method.clone(),
                            span: *span,
                        });
                        Ty::Any
                    }
                }
            }
            Expr::ClassRef { .. } => Ty::Str,
            Expr::Call { callee, args, span } => match callee {
                Callee::Named(name) => {
                    let argc = args.len();
                    let sig = self
                        .registry
                        .functions
                        .get(name)
                        .and_then(|ov| ov.iter().find(|s| s.accepts(argc)))
                        .cloned();
                    match sig {
                        Some(sig) => {
                            self.check_call_args(&sig, args, ctx, *span);
                            sig.ret.first().cloned().unwrap_or(Ty::Void)
                        }
                        None => {
                            if crate::intrinsics::is_native(name) {
                                for a in args {
                                    self.check_expr(a, ctx);
                                }
                                return Ty::Any;
                            }
                            if self.registry.functions.contains_key(name) {
                                self.error(CheckError::ArityMismatch {
                                    name: name.clone(),
                                    expected: self
                                        .registry
                                        .functions
                                        .get(name)
                                        .map(|ov| {
                                            ov.iter()
                                                .map(|s| s.params.len().to_string())
                                                .collect::<Vec<_>>()
                                                .join(" or ")
                                        })
                                        .unwrap_or_default(),
                                    found: argc,
                                    span: *span,
                                });
                            } else {
                                self.error(CheckError::UndefinedFunction { name: name.clone(), span: *span });
                            }
                            Ty::Any
                        }
                    }
                }
                Callee::Expr(e) => {
                    let fty = self.check_expr(e, ctx);
                    match fty {
                        Ty::Function { params, ret } => {
                            if args.len() != params.len() {
                                self.error(CheckError::ArityMismatch {
                                    name: "<closure>".into(),
                                    expected: params.len().to_string(),
                                    found: args.len(),
                                    span: *span,
                                });
                            }
                            for (i, a) in args.iter().enumerate() {
                                let aty = self.check_expr(a, ctx);
                                if let Some(p) = params.get(i) {
                                    if !self.compatible(p, &aty) {
                                        self.error(CheckError::TypeMismatch {
                                            expected: p.display(),
                                            found: aty.display(),
                                            span: a.span(),
                                        });
                                    }
                                }
                            }
                            ret.first().cloned().unwrap_or(Ty::Void)
                        }
                        Ty::Any => {
                            for a in args {
                                self.check_expr(a, ctx);
                            }
                            Ty::Any
                        }
                        other => {
                            self.error(CheckError::TypeMismatch {
                                expected: "a callable value".into(),
                                found: other.display(),
                                span: e.span(),
                            });
                            Ty::Any
                        }
                    }
                }
            },
            Expr::Index { obj, index, span } => {
                let oty = self.check_expr(obj, ctx);
                let ity = self.check_expr(index, ctx);
                self.require_null_safe(&oty, obj.span());
                match &oty {
                    Ty::Array(elem, _) => {
                        if !matches!(ity, Ty::Int | Ty::Any) {
                            self.error(CheckError::TypeMismatch {
                                expected: "int".into(),
                                found: ity.display(),
                                span: index.span(),
                            });
                        }
                        (**elem).clone()
                    }
                    Ty::Bytes => {
                        if !matches!(ity, Ty::Int | Ty::Any) {
                            self.error(CheckError::TypeMismatch {
                                expected: "int".into(),
                                found: ity.display(),
                                span: index.span(),
                            });
                        }
                        Ty::Int
                    }
                    Ty::Map(k, v) => {
                        if !self.compatible(k, &ity) {
                            self.error(CheckError::TypeMismatch {
                                expected: k.display(),
                                found: ity.display(),
                                span: index.span(),
                            });
                        }
                        (**v).clone()
                    }
                    Ty::SuperArray => {
                        if !matches!(ity, Ty::Int | Ty::Str | Ty::Any) {
                            self.error(CheckError::TypeMismatch {
                                expected: "int or string".into(),
                                found: ity.display(),
                                span: index.span(),
                            });
                        }
                        Ty::Any
                    }
                    Ty::Any => Ty::Any,
                    other => {
                        self.error(CheckError::NotIndexable { ty: other.display(), span: *span });
                        Ty::Any
                    }
                }
            }
            Expr::New { class, args, span } => {
                match self.registry.classes.get(class).cloned() {
                    Some(sig) => {
                        if sig.is_abstract {
                            self.error(CheckError::AbstractInstantiation {
                                name: class.clone(),
                                span: *span,
                            });
                        }
                        let argc = args.len();
                        if let Some((_, ctor)) = self.registry.lookup_method(class, "constructor", argc) {
                            let ctor = ctor.clone();
                            self.check_call_args(&ctor, args, ctx, *span);
                        } else {
                            for a in args {
                                self.check_expr(a, ctx);
                            }
                            if !args.is_empty()
                                && self.registry.lookup_method(class, "constructor", 0).is_none()
                            {
                                self.error(CheckError::ArityMismatch {
                                    name: format!("{}::constructor", class),
                                    expected: "0".into(),
                                    found: argc,
                                    span: *span,
                                });
                            }
                        }
                        Ty::Class(class.clone())
                    }
                    None => {
                        if class == "Exception" || crate::intrinsics::is_builtin_exception(class) {
                            for a in args {
                                self.check_expr(a, ctx);
                            }
                            return Ty::Class(class.clone());
                        }
                        self.error(CheckError::UndefinedType { name: class.clone(), span: *span });
                        Ty::Any
                    }
                }
            }
            Expr::Closure { params, ret, uses, body, .. } => {
                for (name, span) in uses {
                    self.check_var_read(name, *span);
                }
                let f = FunctionDecl {
                    name: "<closure>".into(),
                    params: params.clone(),
                    ret: ret.clone(),
                    body: Some(body.clone()),
                    is_static: false,
                    is_abstract: false,
                    is_final: false,
                    visibility: Visibility::Public,
                    annotations: vec![],
                    doc: None,
                    span: expr.span(),
                };
                // Captures are by value: the body sees the uses plus params.
                let outer = std::mem::take(&mut self.scopes);
                self.scopes.push();
                for (name, _) in uses {
                    if let Some(info) = outer.get(name) {
                        let ty = info.ty.clone();
                        self.scopes.declare(name, ty, true);
                    }
                }
                self.check_function(&f, ctx.class.clone());
                self.scopes = outer;
                Ty::Function {
                    params: params.iter().map(|p| self.resolve_type(&p.ty)).collect(),
                    ret: ret.iter().map(|t| self.resolve_type(t)).collect(),
                }
            }
            Expr::ArrowFn { params, ret, body, .. } => {
                self.scopes.push();
                let mut ptys = Vec::new();
                for p in params {
                    let ty = self.resolve_type(&p.ty);
                    ptys.push(ty.clone());
                    self.scopes.declare(&p.name, ty, true);
                }
                let bty = self.check_expr(body, ctx);
                self.scopes.pop();
                let rty = match ret {
                    Some(t) => {
                        let want = self.resolve_type(t);
                        if !self.compatible(&want, &bty) {
                            self.error(CheckError::TypeMismatch {
                                expected: want.display(),
                                found: bty.display(),
                                span: body.span(),
                            });
                        }
                        want
                    }
                    None => bty,
                };
                Ty::Function { params: ptys, ret: vec![rty] }
            }
            Expr::ArrayLit { elems, span } => {
                let mut elem_ty: Option<Ty> = None;
                for e in elems {
                    let ty = self.check_expr(e, ctx);
                    match &elem_ty {
                        None => elem_ty = Some(ty),
                        Some(t) if self.compatible(t, &ty) => {}
                        Some(t) => {
                            self.error(CheckError::TypeMismatch {
                                expected: t.display(),
                                found: ty.display(),
                                span: e.span(),
                            });
                        }
                    }
                }
                let _ = span;
                Ty::Array(Box::new(elem_ty.unwrap_or(Ty::Any)), None)
            }
            Expr::MapLit { key_ty, val_ty, entries, .. } => {
                let kt = self.resolve_type(key_ty);
                let vt = self.resolve_type(val_ty);
                for (k, v) in entries {
                    let got_k = self.check_expr(k, ctx);
                    let got_v = self.check_expr(v, ctx);
                    if !self.compatible(&kt, &got_k) {
                        self.error(CheckError::TypeMismatch {
                            expected: kt.display(),
                            found: got_k.display(),
                            span: k.span(),
                        });
                    }
                    if !self.compatible(&vt, &got_v) {
                        self.error(CheckError::TypeMismatch {
                            expected: vt.display(),
                            found: got_v.display(),
                            span: v.span(),
                        });
                    }
                }
                Ty::Map(Box::new(kt), Box::new(vt))
            }
            Expr::SuperArrayLit { entries, .. } => {
                for (key, value) in entries {
                    if let Some(k) = key {
                        let kty = self.check_expr(k, ctx);
                        if !matches!(kty, Ty::Int | Ty::Str | Ty::Any) {
                            self.error(CheckError::TypeMismatch {
                                expected: "int or string".into(),
                                found: kty.display(),
                                span: k.span(),
                            });
                        }
                    }
                    self.check_expr(value, ctx);
                }
                Ty::SuperArray
            }
            Expr::Match { subject, arms, .. } => {
                let sty = self.check_expr(subject, ctx);
                let mut out: Option<Ty> = None;
                for arm in arms {
                    let snap = self.scopes.snapshot();
                    match &arm.pattern {
                        MatchPattern::Values(values) => {
                            for v in values {
                                let vty = self.check_expr(v, ctx);
                                if !self.comparable(&sty, &vty) {
                                    self.error(CheckError::TypeMismatch {
                                        expected: sty.display(),
                                        found: vty.display(),
                                        span: v.span(),
                                    });
                                }
                            }
                        }
                        MatchPattern::Type { ty, bind } => {
                            let t = self.resolve_type(ty);
                            if let Some(b) = bind {
                                self.scopes.declare(b, t, true);
                            }
                        }
                        MatchPattern::Wildcard => {}
                    }
                    if let Some(g) = &arm.guard {
                        self.check_condition(g, ctx);
                    }
                    let bty = self.check_expr(&arm.body, ctx);
                    self.scopes.restore(snap);
                    match &out {
                        None => out = Some(bty),
                        Some(t) if self.compatible(t, &bty) => {}
                        Some(t) => out = Some(Ty::Union(vec![t.clone(), bty])),
                    }
                }
                out.unwrap_or(Ty::Null)
            }
            Expr::SwitchExpr { subject, arms, default, .. } => {
                let sty = self.check_expr(subject, ctx);
                let mut out: Option<Ty> = None;
                for (values, body) in arms {
                    for v in values {
                        let vty = self.check_expr(v, ctx);
                        if !self.comparable(&sty, &vty) {
                            self.error(CheckError::TypeMismatch {
                                expected: sty.display(),
                                found: vty.display(),
                                span: v.span(),
                            });
                        }
                    }
                    let bty = self.check_expr(body, ctx);
                    match &out {
                        None => out = Some(bty),
                        Some(t) if self.compatible(t, &bty) => {}
                        Some(t) => out = Some(Ty::Union(vec![t.clone(), bty])),
                    }
                }
                if let Some(d) = default {
                    let bty = self.check_expr(d, ctx);
                    if out.is_none() {
                        out = Some(bty);
                    }
                }
                out.unwrap_or(Ty::Null)
            }
        }
    }

    fn check_var_read(&mut self, name: &str, span: Span) -> Ty {
        match self.scopes.get(name) {
            Some(info) => {
                if !info.initialized {
                    let ty = info.ty.clone();
                    self.error(CheckError::Uninitialized { name: name.to_string(), span });
                    return ty;
                }
                info.ty.clone()
            }
            None => {
                self.error(CheckError::UndefinedVariable { name: name.to_string(), span });
                Ty::Any
            }
        }
    }

    fn check_assign_target(&mut self, target: &Expr, ctx: &mut FnCtx) -> Ty {
        match target {
            Expr::Var { name, span } => match self.scopes.get(name) {
                Some(info) => info.ty.clone(),
                None => {
                    self.error(CheckError::UndefinedVariable { name: name.clone(), span: *span });
                    Ty::Any
                }
            },
            Expr::Index { .. } | Expr::Prop { .. } | Expr::StaticAccess { .. } => {
                self.check_expr(target, ctx)
            }
            other => {
                self.error(CheckError::TypeMismatch {
                    expected: "an assignable place".into(),
                    found: "expression".into(),
                    span: other.span(),
                });
                Ty::Any
            }
        }
    }

    fn check_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, span: Span, ctx: &mut FnCtx) -> Ty {
        let lt = self.check_expr(lhs, ctx);
        let rt = self.check_expr(rhs, ctx);

        if lt == Ty::Any || rt == Ty::Any {
            return match op {
                BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::And | BinOp::Or => Ty::Bool,
                _ => Ty::Any,
            };
        }

        let op_name = |op: BinOp| -> &'static str {
            match op {
                BinOp::Add => "+",
                BinOp::Sub => "-",
                BinOp::Mul => "*",
                BinOp::Div => "/",
                BinOp::Mod => "%",
                BinOp::Eq => "==",
                BinOp::Ne => "!=",
                BinOp::Lt => "<",
                BinOp::Le => "<=",
                BinOp::Gt => ">",
                BinOp::Ge => ">=",
                BinOp::And => "&&",
                BinOp::Or => "||",
                BinOp::BitAnd => "&",
                BinOp::BitOr => "|",
                BinOp::BitXor => "^",
                BinOp::Shl => "<<",
                BinOp::Shr => ">>",
            }
        };

        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                match (&lt, &rt) {
                    (Ty::Int, Ty::Int) => Ty::Int,
                    (Ty::Float, Ty::Float) => Ty::Float,
                    (Ty::Str, Ty::Str) if op == BinOp::Add => Ty::Str,
                    _ => {
                        self.error(CheckError::MixedOperands {
                            op: op_name(op).into(),
                            lhs: lt.display(),
                            rhs: rt.display(),
                            span,
                        });
                        Ty::Any
                    }
                }
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                match (&lt, &rt) {
                    (Ty::Int, Ty::Int) | (Ty::Float, Ty::Float) | (Ty::Str, Ty::Str) => Ty::Bool,
                    _ => {
                        self.error(CheckError::MixedOperands {
                            op: op_name(op).into(),
                            lhs: lt.display(),
                            rhs: rt.display(),
                            span,
                        });
                        Ty::Bool
                    }
                }
            }
            BinOp::Eq | BinOp::Ne => {
                if !self.comparable(&lt, &rt) {
                    self.error(CheckError::MixedOperands {
                        op: op_name(op).into(),
                        lhs: lt.display(),
                        rhs: rt.display(),
                        span,
                    });
                }
                Ty::Bool
            }
            BinOp::And | BinOp::Or => {
                for (t, e) in [(&lt, lhs), (&rt, rhs)] {
                    if !matches!(t, Ty::Bool) {
                        self.error(CheckError::NonBoolCondition { found: t.display(), span: e.span() });
                    }
                }
                Ty::Bool
            }
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr => {
                if lt != Ty::Int || rt != Ty::Int {
                    self.error(CheckError::MixedOperands {
                        op: op_name(op).into(),
                        lhs: lt.display(),
                        rhs: rt.display(),
                        span,
                    });
                }
                Ty::Int
            }
        }
    }

    fn same_arith_family(&self, a: &Ty, b: &Ty) -> bool {
        matches!(
            (a, b),
            (Ty::Int, Ty::Int) | (Ty::Float, Ty::Float) | (Ty::Str, Ty::Str) | (Ty::Any, _) | (_, Ty::Any)
        )
    }

    fn comparable(&self, a: &Ty, b: &Ty) -> bool {
        if a == b || *a == Ty::Any || *b == Ty::Any {
            return true;
        }
        if a.includes_null() || b.includes_null() {
            return true;
        }
        matches!((a, b), (Ty::Null, _) | (_, Ty::Null))
            || matches!((a, b), (Ty::Enum(x), Ty::Enum(y)) if x == y)
            || matches!((a, b), (Ty::Class(_), Ty::Class(_)))
    }

    fn require_null_safe(&mut self, ty: &Ty, span: Span) {
        if ty.includes_null() {
            self.error(CheckError::PossiblyNull { ty: ty.display(), span });
        }
    }

    fn member_type(&mut self, oty: &Ty, name: &str, span: Span, ctx: &mut FnCtx) -> Ty {
        self.require_null_safe(oty, span);
        match oty.without_null() {
            Ty::Class(class) => match self.registry.lookup_prop(&class, name) {
                Some((owner, p)) => {
                    let (oname, vis, ty) = (owner.name.clone(), p.visibility, p.ty.clone());
                    self.visibility_check(&oname, name, vis, ctx, span);
                    ty
                }
                None => {
                    if class == "Exception" || crate::intrinsics::is_builtin_exception(&class) {
                        return Ty::Any;
                    }
                    self.error(CheckError::UndefinedMember { owner: class, name: name.into(), span });
                    Ty::Any
                }
            },
            Ty::Any => Ty::Any,
            other => {
                self.error(CheckError::UndefinedMember {
                    owner: other.display(),
                    name: name.into(),
                    span,
                });
                Ty::Any
            }
        }
    }

    fn method_call_type(&mut self, oty: &Ty, name: &str, args: &[Expr], span: Span, ctx: &mut FnCtx) -> Ty {
        self.require_null_safe(oty, span);
        let argc = args.len();
        match oty.without_null() {
            Ty::Class(class) => match self.registry.lookup_method(&class, name, argc) {
                Some((owner, sig)) => {
                    let owner_name = owner.name.clone();
                    let sig = sig.clone();
                    self.check_call_args(&sig, args, ctx, span);
                    self.visibility_check(&owner_name, name, sig.visibility, ctx, span);
                    sig.ret.first().cloned().unwrap_or(Ty::Void)
                }
                None => {
                    if class == "Exception" || crate::intrinsics::is_builtin_exception(&class) {
                        for a in args {
                            self.check_expr(a, ctx);
                        }
                        return Ty::Any;
                    }
                    self.error(CheckError::UndefinedMember { owner: class, name: name.into(), span });
                    Ty::Any
                }
            },
            Ty::Interface(iface) => {
                let sig = self
                    .registry
                    .interfaces
                    .get(&iface)
                    .and_then(|i| i.methods.iter().find(|m| m.name == name && m.accepts(argc)))
                    .cloned();
                match sig {
                    Some(sig) => {
                        self.check_call_args(&sig, args, ctx, span);
                        sig.ret.first().cloned().unwrap_or(Ty::Void)
                    }
                    None => {
                        self.error(CheckError::UndefinedMember { owner: iface, name: name.into(), span });
                        Ty::Any
                    }
                }
            }
            Ty::SuperArray | Ty::Array(..) | Ty::Map(..) | Ty::Str | Ty::Bytes => {
                // Built-in container/string methods (push, length, has, …)
                for a in args {
                    self.check_expr(a, ctx);
                }
                Ty::Any
            }
            Ty::Any => {
                for a in args {
                    self.check_expr(a, ctx);
                }
                Ty::Any
            }
            other => {
                self.error(CheckError::UndefinedMember {
                    owner: other.display(),
                    name: name.into(),
                    span,
                });
                Ty::Any
            }
        }
    }

    fn check_call_args(&mut self, sig: &MethodSig, args: &[Expr], ctx: &mut FnCtx, span: Span) {
        if !sig.accepts(args.len()) {
            self.error(CheckError::ArityMismatch {
                name: sig.name.clone(),
                expected: match sig.max_arity() {
                    Some(max) if max == sig.min_arity() => max.to_string(),
                    Some(max) => format!("{}..{}", sig.min_arity(), max),
                    None => format!("{}+", sig.min_arity()),
                },
                found: args.len(),
                span,
            });
        }
        for (i, a) in args.iter().enumerate() {
            let aty = self.check_expr(a, ctx);
            let want = if let Some(p) = sig.params.get(i) {
                p.ty.clone()
            } else if let Some(last) = sig.params.last().filter(|p| p.variadic) {
                last.ty.clone()
            } else {
                continue;
            };
            if !self.compatible(&want, &aty) {
                self.error(CheckError::TypeMismatch {
                    expected: want.display(),
                    found: aty.display(),
                    span: a.span(),
                });
            }
        }
    }

    fn visibility_check(&mut self, owner: &str, name: &str, vis: Visibility, ctx: &FnCtx, span: Span) {
        let visible = match vis {
            Visibility::Public => true,
            Visibility::Private => ctx.class.as_deref() == Some(owner),
            Visibility::Protected => match &ctx.class {
                Some(c) => self.registry.is_subtype_name(c, owner),
                None => false,
            },
        };
        if !visible {
            self.error(CheckError::NotVisible {
                class: owner.to_string(),
                name: name.to_string(),
                span,
            });
        }
    }

    fn static_owner(&mut self, target: &StaticTarget, ctx: &FnCtx, span: Span) -> Option<String> {
        match target {
            StaticTarget::Class(name) => {
                if !self.registry.classes.contains_key(name)
                    && !self.registry.enums.contains_key(name)
                    && !self.registry.interfaces.contains_key(name)
                {
                    self.error(CheckError::UndefinedType { name: name.clone(), span });
                    return None;
                }
                Some(name.clone())
            }
            StaticTarget::SelfKw => match &ctx.class {
                Some(c) => Some(c.clone()),
                None => {
                    self.error(CheckError::UndefinedType { name: "self".into(), span });
                    None
                }
            },
            StaticTarget::Parent => match ctx.class.as_ref().and_then(|c| self.registry.classes.get(c)) {
                Some(sig) => match &sig.parent {
                    Some(p) => Some(p.clone()),
                    None => {
                        self.error(CheckError::UndefinedType { name: "parent".into(), span });
                        None
                    }
                },
                None => {
                    self.error(CheckError::UndefinedType { name: "parent".into(), span });
                    None
                }
            },
        }
    }

    /// Assignment compatibility: exact match, null into nullable, subtype
    /// into supertype, anything into/out of `Any`.
    fn compatible(&self, expected: &Ty, found: &Ty) -> bool {
        if expected == found || *expected == Ty::Any || *found == Ty::Any {
            return true;
        }
        match (expected, found) {
            (Ty::Union(ms), f) => ms.iter().any(|m| self.compatible(m, f)),
            (_, Ty::Union(fs)) => fs.iter().all(|f| self.compatible(expected, f)),
            (Ty::Class(e), Ty::Class(f)) => self.registry.is_subtype_name(f, e),
            (Ty::Interface(e), Ty::Class(f)) => self.registry.is_subtype_name(f, e),
            (Ty::Interface(e), Ty::Interface(f)) => self.registry.iface_extends(f, e),
            (Ty::Array(ee, el), Ty::Array(fe, fl)) => {
                self.compatible(ee, fe) && (el.is_none() || el == fl)
            }
            (Ty::Map(ek, ev), Ty::Map(fk, fv)) => self.compatible(ek, fk) && self.compatible(ev, fv),
            (Ty::Function { params: ep, ret: er }, Ty::Function { params: fp, ret: fr }) => {
                ep.len() == fp.len()
                    && er.len() == fr.len()
                    && ep.iter().zip(fp).all(|(a, b)| self.compatible(a, b))
                    && er.iter().zip(fr).all(|(a, b)| self.compatible(a, b))
            }
            _ => false,
        }
    }

    /// Is this `as` conversion worth attempting at runtime?
    fn cast_plausible(&self, from: &Ty, to: &Ty) -> bool {
        if from == to || *from == Ty::Any || *to == Ty::Any {
            return true;
        }
        match (from, to) {
            // Scalar conversions are explicit by design.
            (Ty::Int, Ty::Float) | (Ty::Float, Ty::Int) => true,
            (Ty::Int, Ty::Str) | (Ty::Float, Ty::Str) | (Ty::Bool, Ty::Str) => true,
            (Ty::Str, Ty::Int) | (Ty::Str, Ty::Float) => true,
            (Ty::Enum(_), Ty::Int) | (Ty::Enum(_), Ty::Str) => true,
            // Null-stripping and union extraction.
            (Ty::Union(ms), t) => ms.iter().any(|m| self.cast_plausible(m, t)),
            (Ty::Null, _) => false,
            // Class up/down casts along the hierarchy.
            (Ty::Class(a), Ty::Class(b)) => {
                self.registry.is_subtype_name(a, b) || self.registry.is_subtype_name(b, a)
            }
            (Ty::Interface(_), Ty::Class(_)) | (Ty::Class(_), Ty::Interface(_)) => true,
            // Super-array elements come out as any target type.
            (Ty::SuperArray, _) => false,
            _ => false,
        }
    }
}

fn decl_span(file: &File, name: &str) -> Span {
    file.decls
        .iter()
        .find(|d| d.name() == name)
        .map(|d| d.span())
        .unwrap_or_default()
}

impl Default for Checker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn check(src: &str) -> CheckOutcome {
        let (file, lex, parse) = parse_source(src, 0);
        assert!(lex.is_empty(), "lex errors: {:?}", lex);
        assert!(parse.is_empty(), "parse errors: {:?}", parse);
        Checker::new().check_file(&file)
    }

    fn errors_of(src: &str) -> Vec<String> {
        check(src).diagnostics.iter().map(|d| d.message.clone()).collect()
    }

    #[test]
    fn well_typed_program_passes() {
        let out = check("int $s = 0; for (int $i = 0; $i < 10; $i = $i + 1) { $s = $s + $i; } echo $s;");
        assert!(out.ok, "{:?}", out.diagnostics.iter().collect::<Vec<_>>());
    }

    #[test]
    fn mixed_arithmetic_rejected() {
        let out = check("$x := 1 + 2.0;");
        assert!(!out.ok);
    }

    #[test]
    fn explicit_cast_accepted() {
        let out = check("$x := (1 as float) + 2.0;");
        assert!(out.ok, "{:?}", out.diagnostics.iter().collect::<Vec<_>>());
    }

    #[test]
    fn uninitialized_read_rejected() {
        let out = check("int $x; echo $x;");
        assert!(errors_of("int $x; echo $x;").iter().any(|m| m.contains("before it is assigned")));
        assert!(!out.ok);
    }

    #[test]
    fn initialization_by_assignment_accepted() {
        let out = check("int $x; $x = 3; echo $x;");
        assert!(out.ok, "{:?}", out.diagnostics.iter().collect::<Vec<_>>());
    }

    #[test]
    fn non_bool_condition_rejected() {
        let out = check("if (1) { echo 1; }");
        assert!(!out.ok);
    }

    #[test]
    fn null_member_access_requires_narrowing() {
        let src = r#"
            class Box { public int $v = 0; }
            function f(?Box $b): int {
                return $b->v;
            }
        "#;
        assert!(errors_of(src).iter().any(|m| m.contains("may be null")));

        let narrowed = r#"
            class Box { public int $v = 0; }
            function f(?Box $b): int {
                if ($b != null) { return $b->v; }
                return 0;
            }
        "#;
        let out = check(narrowed);
        assert!(out.ok, "{:?}", out.diagnostics.iter().collect::<Vec<_>>());
    }

    #[test]
    fn is_narrows_true_branch_only() {
        let src = r#"
            class A { public function go(): int { return 1; } }
            function f(?A $x): int {
                if ($x is A) { return $x->go(); }
                return 0;
            }
        "#;
        let out = check(src);
        assert!(out.ok, "{:?}", out.diagnostics.iter().collect::<Vec<_>>());
    }

    #[test]
    fn final_override_rejected() {
        let src = r#"
            class A { public final function f(): int { return 1; } }
            class B extends A { public function f(): int { return 2; } }
        "#;
        assert!(errors_of(src).iter().any(|m| m.contains("final")));
    }

    #[test]
    fn abstract_instantiation_rejected() {
        let src = r#"
            abstract class Shape { public abstract function area(): int; }
            $s := new Shape();
        "#;
        assert!(errors_of(src).iter().any(|m| m.contains("abstract")));
    }

    #[test]
    fn abstract_must_be_implemented() {
        let src = r#"
            abstract class Shape { public abstract function area(): int; }
            class Circle extends Shape {}
        "#;
        assert!(errors_of(src).iter().any(|m| m.contains("must implement")));
    }

    #[test]
    fn private_member_not_visible_outside() {
        let src = r#"
            class A { private int $secret = 1; }
            $a := new A();
            echo $a->secret;
        "#;
        assert!(errors_of(src).iter().any(|m| m.contains("not visible")));
    }

    #[test]
    fn arity_checked_with_defaults() {
        let src = r#"
            function greet(string $name, string $suffix = "!"): string { return $name + $suffix; }
            $a := greet("hi");
            $b := greet("hi", "?");
        "#;
        let out = check(src);
        assert!(out.ok, "{:?}", out.diagnostics.iter().collect::<Vec<_>>());
    }

    #[test]
    fn return_count_checked() {
        let src = "function f(): (int, int) { return 1; }";
        assert!(errors_of(src).iter().any(|m| m.contains("count mismatch")));
    }

    #[test]
    fn break_outside_loop_rejected() {
        assert!(errors_of("break;").iter().any(|m| m.contains("outside")));
    }

    #[test]
    fn foreach_over_array_binds_int_keys() {
        let src = r#"
            $a := [1, 2, 3];
            foreach ($a as $k => $v) {
                int $x = $k + $v;
                echo $x;
            }
        "#;
        let out = check(src);
        assert!(out.ok, "{:?}", out.diagnostics.iter().collect::<Vec<_>>());
    }

    #[test]
    fn heterogeneous_array_literal_rejected() {
        assert!(!check(r#"$a := [1, "two"];"#).ok);
    }

    #[test]
    fn super_array_literal_is_heterogeneous() {
        let out = check(r#"$s := { 1, "k": "two" }; echo $s["k"];"#);
        assert!(out.ok, "{:?}", out.diagnostics.iter().collect::<Vec<_>>());
    }
}
