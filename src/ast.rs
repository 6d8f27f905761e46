/// Prism AST.
///
/// Three node families — declarations, statements, expressions — plus type
/// nodes. Every node carries a span. The tree is owned by the compile pass
/// and dropped once bytecode is emitted.

use crate::errors::Span;

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct File {
    pub namespace: Option<String>,
    pub uses: Vec<UseDecl>,
    pub decls: Vec<Decl>,
    /// Top-level statements, in source order.
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct UseDecl {
    /// Dotted path segments: `use a.b.C` -> ["a", "b", "C"].
    pub path: Vec<String>,
    pub span: Span,
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Decl {
    Class(ClassDecl),
    Interface(InterfaceDecl),
    Enum(EnumDecl),
    Function(FunctionDecl),
    TypeAlias { name: String, target: TypeNode, span: Span },
    NewType { name: String, base: TypeNode, span: Span },
}

impl Decl {
    pub fn span(&self) -> Span {
        match self {
            Decl::Class(c) => c.span,
            Decl::Interface(i) => i.span,
            Decl::Enum(e) => e.span,
            Decl::Function(f) => f.span,
            Decl::TypeAlias { span, .. } | Decl::NewType { span, .. } => *span,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Decl::Class(c) => &c.name,
            Decl::Interface(i) => &i.name,
            Decl::Enum(e) => &e.name,
            Decl::Function(f) => &f.name,
            Decl::TypeAlias { name, .. } | Decl::NewType { name, .. } => name,
        }
    }
}

/// `@Name` or `@Name(arg, …)` — user annotations surfaced via reflection.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub name: String,
    pub args: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub name: String,
    pub parent: Option<String>,
    pub interfaces: Vec<String>,
    pub is_abstract: bool,
    pub is_final: bool,
    pub consts: Vec<ConstDecl>,
    pub props: Vec<PropDecl>,
    pub methods: Vec<FunctionDecl>,
    pub annotations: Vec<Annotation>,
    pub doc: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct InterfaceDecl {
    pub name: String,
    pub extends: Vec<String>,
    pub consts: Vec<ConstDecl>,
    /// Bodies are always `None` here.
    pub methods: Vec<FunctionDecl>,
    pub annotations: Vec<Annotation>,
    pub doc: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct EnumDecl {
    pub name: String,
    /// Optional underlying scalar type (`enum Color: int`).
    pub underlying: Option<TypeNode>,
    pub cases: Vec<EnumCase>,
    pub annotations: Vec<Annotation>,
    pub doc: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct EnumCase {
    pub name: String,
    pub value: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ConstDecl {
    pub name: String,
    pub ty: Option<TypeNode>,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct PropDecl {
    pub name: String,
    pub ty: TypeNode,
    pub default: Option<Expr>,
    pub is_static: bool,
    pub visibility: Visibility,
    pub annotations: Vec<Annotation>,
    pub doc: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Param>,
    /// Zero, one, or several return types (multi-value return).
    pub ret: Vec<TypeNode>,
    /// `None` for abstract and interface methods.
    pub body: Option<Vec<Stmt>>,
    pub is_static: bool,
    pub is_abstract: bool,
    pub is_final: bool,
    pub visibility: Visibility,
    pub annotations: Vec<Annotation>,
    pub doc: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: TypeNode,
    pub default: Option<Expr>,
    pub variadic: bool,
    pub span: Span,
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Stmt {
    Expr(Expr),
    /// `int $x = 1;` (typed) or `$x := e;` (inferred, `ty` is None).
    VarDecl { ty: Option<TypeNode>, name: String, init: Option<Expr>, span: Span },
    /// `int $a, string $b = f();` — binds a multi-value return.
    MultiVarDecl { targets: Vec<(Option<TypeNode>, String)>, init: Expr, span: Span },
    Block(Vec<Stmt>, Span),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        elseifs: Vec<(Expr, Vec<Stmt>)>,
        else_branch: Option<Vec<Stmt>>,
        span: Span,
    },
    /// Colon-form switch with labelled case blocks and explicit break.
    Switch {
        subject: Expr,
        arms: Vec<SwitchArm>,
        default: Option<Vec<Stmt>>,
        span: Span,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Vec<Stmt>,
        span: Span,
    },
    Foreach {
        subject: Expr,
        key: Option<String>,
        value: String,
        body: Vec<Stmt>,
        span: Span,
    },
    While { cond: Expr, body: Vec<Stmt>, span: Span },
    DoWhile { body: Vec<Stmt>, cond: Expr, span: Span },
    Break(Span),
    Continue(Span),
    /// `return;`, `return e;`, `return a, b;`
    Return { values: Vec<Expr>, span: Span },
    Try {
        body: Vec<Stmt>,
        catches: Vec<CatchClause>,
        finally: Option<Vec<Stmt>>,
        span: Span,
    },
    Throw { value: Expr, span: Span },
    Echo { value: Expr, span: Span },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Expr(e) => e.span(),
            Stmt::VarDecl { span, .. }
            | Stmt::MultiVarDecl { span, .. }
            | Stmt::Block(_, span)
            | Stmt::If { span, .. }
            | Stmt::Switch { span, .. }
            | Stmt::For { span, .. }
            | Stmt::Foreach { span, .. }
            | Stmt::While { span, .. }
            | Stmt::DoWhile { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Try { span, .. }
            | Stmt::Throw { span, .. }
            | Stmt::Echo { span, .. } => *span,
            Stmt::Break(span) | Stmt::Continue(span) => *span,
        }
    }
}

/// One `case v1, v2:` arm (multi-value cases share a body).
#[derive(Debug, Clone)]
pub struct SwitchArm {
    pub values: Vec<Expr>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct CatchClause {
    pub class: String,
    pub var: String,
    pub body: Vec<Stmt>,
    pub span: Span,
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    PreInc,
    PreDec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostfixOp {
    Inc,
    Dec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Receiver of `::` access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaticTarget {
    Class(String),
    SelfKw,
    Parent,
}

#[derive(Debug, Clone)]
pub enum Callee {
    /// A named free function.
    Named(String),
    /// Any expression evaluating to a function or closure.
    Expr(Box<Expr>),
}

#[derive(Debug, Clone)]
pub enum InterpSeg {
    Lit(String),
    Var(String, Span),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Null(Span),
    Bool(bool, Span),
    Int(i64, Span),
    Float(f64, Span),
    Str(String, Span),
    /// `#"a{$x}b"` — lowered to concatenation by the compiler.
    Interp { parts: Vec<InterpSeg>, span: Span },
    Var { name: String, span: Span },
    /// Bare identifier — a global function, class, or enum reference.
    Ident { name: String, span: Span },
    This(Span),
    Unary { op: UnaryOp, expr: Box<Expr>, span: Span },
    Postfix { op: PostfixOp, expr: Box<Expr>, span: Span },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr>, span: Span },
    /// `c ? a : b`; `then` is None for the Elvis form `c ?: b`.
    Ternary { cond: Box<Expr>, then: Option<Box<Expr>>, otherwise: Box<Expr>, span: Span },
    Assign { target: Box<Expr>, op: AssignOp, value: Box<Expr>, span: Span },
    /// `e as T` (checked, throws) / `e as? T` (yields null on failure).
    Cast { expr: Box<Expr>, ty: TypeNode, safe: bool, span: Span },
    Is { expr: Box<Expr>, ty: TypeNode, span: Span },
    Prop { obj: Box<Expr>, name: String, span: Span },
    MethodCall { obj: Box<Expr>, name: String, args: Vec<Expr>, span: Span },
    /// `A::NAME`, `self::NAME`, `parent::NAME` (constant or static property).
    StaticAccess { target: StaticTarget, member: String, is_var: bool, span: Span },
    StaticCall { target: StaticTarget, method: String, args: Vec<Expr>, span: Span },
    /// `A::class`
    ClassRef { target: StaticTarget, span: Span },
    Call { callee: Callee, args: Vec<Expr>, span: Span },
    Index { obj: Box<Expr>, index: Box<Expr>, span: Span },
    New { class: String, args: Vec<Expr>, span: Span },
    /// `function (int $x) use ($a, $b): int { … }`
    Closure {
        params: Vec<Param>,
        ret: Vec<TypeNode>,
        uses: Vec<(String, Span)>,
        body: Vec<Stmt>,
        span: Span,
    },
    /// `(int $x) => $x + 1`
    ArrowFn { params: Vec<Param>, ret: Option<TypeNode>, body: Box<Expr>, span: Span },
    /// `[1, 2, 3]` — homogeneous typed array.
    ArrayLit { elems: Vec<Expr>, span: Span },
    /// `map[string]int{"a": 1}`
    MapLit { key_ty: TypeNode, val_ty: TypeNode, entries: Vec<(Expr, Expr)>, span: Span },
    /// `{ 1, "k": 2, … }` — ordered heterogeneous super-array.
    SuperArrayLit { entries: Vec<(Option<Expr>, Expr)>, span: Span },
    Match { subject: Box<Expr>, arms: Vec<MatchArm>, span: Span },
    /// `switch (e) { 1 => a, 2, 3 => b, default => c }` in value position.
    SwitchExpr {
        subject: Box<Expr>,
        arms: Vec<(Vec<Expr>, Expr)>,
        default: Option<Box<Expr>>,
        span: Span,
    },
}

#[derive(Debug, Clone)]
pub struct MatchArm {
    pub pattern: MatchPattern,
    pub guard: Option<Expr>,
    pub body: Expr,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum MatchPattern {
    /// `1, 2 => …` — any listed value matches.
    Values(Vec<Expr>),
    /// `int $n => …` — type test with optional binding.
    Type { ty: TypeNode, bind: Option<String> },
    /// `_ => …`
    Wildcard,
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Null(s)
            | Expr::Bool(_, s)
            | Expr::Int(_, s)
            | Expr::Float(_, s)
            | Expr::Str(_, s)
            | Expr::This(s) => *s,
            Expr::Interp { span, .. }
            | Expr::Var { span, .. }
            | Expr::Ident { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Postfix { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Ternary { span, .. }
            | Expr::Assign { span, .. }
            | Expr::Cast { span, .. }
            | Expr::Is { span, .. }
            | Expr::Prop { span, .. }
            | Expr::MethodCall { span, .. }
            | Expr::StaticAccess { span, .. }
            | Expr::StaticCall { span, .. }
            | Expr::ClassRef { span, .. }
            | Expr::Call { span, .. }
            | Expr::Index { span, .. }
            | Expr::New { span, .. }
            | Expr::Closure { span, .. }
            | Expr::ArrowFn { span, .. }
            | Expr::ArrayLit { span, .. }
            | Expr::MapLit { span, .. }
            | Expr::SuperArrayLit { span, .. }
            | Expr::Match { span, .. }
            | Expr::SwitchExpr { span, .. } => *span,
        }
    }

    /// True for the forms allowed on the left of `=`.
    pub fn is_assignable(&self) -> bool {
        matches!(
            self,
            Expr::Var { .. } | Expr::Index { .. } | Expr::Prop { .. } | Expr::StaticAccess { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Type nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TypeNode {
    /// Primitive or class/interface/enum/alias name.
    Simple { name: String, span: Span },
    /// `?T` — lowered to `T | null` by the checker.
    Nullable(Box<TypeNode>),
    /// `T[]` or `T[4]`.
    Array { elem: Box<TypeNode>, len: Option<usize>, span: Span },
    /// `map[K]V`
    Map { key: Box<TypeNode>, value: Box<TypeNode>, span: Span },
    /// `function(T1, T2): R`
    Function { params: Vec<TypeNode>, ret: Box<TypeNode>, span: Span },
    /// Return position only.
    Tuple(Vec<TypeNode>, Span),
    Union(Vec<TypeNode>, Span),
    /// Surface syntax only — erased after checking.
    Generic { base: String, args: Vec<TypeNode>, span: Span },
}

impl TypeNode {
    pub fn span(&self) -> Span {
        match self {
            TypeNode::Simple { span, .. }
            | TypeNode::Array { span, .. }
            | TypeNode::Map { span, .. }
            | TypeNode::Function { span, .. }
            | TypeNode::Tuple(_, span)
            | TypeNode::Union(_, span)
            | TypeNode::Generic { span, .. } => *span,
            TypeNode::Nullable(inner) => inner.span(),
        }
    }

    pub fn simple(name: &str, span: Span) -> TypeNode {
        TypeNode::Simple { name: name.to_string(), span }
    }
}
