/// Prism error types.
/// Source spans, the per-phase error enums, and the diagnostics bag that
/// collects static errors so a whole phase reports in one pass.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub source_id: u32,
    /// Byte offsets into the source (half-open).
    pub start: usize,
    pub end: usize,
    /// 1-based line/column of `start`.
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub fn new(source_id: u32, start: usize, end: usize, line: u32, col: u32) -> Self {
        Span { source_id, start, end, line, col }
    }

    /// Widen to cover both spans. Keeps the left edge's line/column.
    pub fn merge(self, other: Span) -> Span {
        Span {
            source_id: self.source_id,
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            line: self.line,
            col: self.col,
        }
    }
}

impl Default for Span {
    fn default() -> Self {
        Span { source_id: 0, start: 0, end: 0, line: 1, col: 1 }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

// ---------------------------------------------------------------------------
// Lexer errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum LexError {
    #[error("unexpected character '{ch}'")]
    UnexpectedCharacter { ch: char, span: Span },
    #[error("unterminated string literal")]
    UnterminatedString { span: Span },
    #[error("unterminated block comment")]
    UnterminatedComment { span: Span },
    #[error("invalid numeric literal '{text}'")]
    InvalidNumber { text: String, span: Span },
    #[error("invalid escape sequence '\\{ch}'")]
    InvalidEscape { ch: char, span: Span },
    #[error("interpolation slot must be a variable: expected '{{$name}}'")]
    BadInterpolationSlot { span: Span },
}

impl LexError {
    pub fn span(&self) -> Span {
        match self {
            LexError::UnexpectedCharacter { span, .. }
            | LexError::UnterminatedString { span }
            | LexError::UnterminatedComment { span }
            | LexError::InvalidNumber { span, .. }
            | LexError::InvalidEscape { span, .. }
            | LexError::BadInterpolationSlot { span } => *span,
        }
    }
}

// ---------------------------------------------------------------------------
// Parser errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String, span: Span },
    #[error("unexpected end of file in {context}")]
    UnexpectedEof { context: String, span: Span },
    #[error("invalid assignment target")]
    InvalidAssignmentTarget { span: Span },
    #[error("chained type casts are not allowed; parenthesize the inner cast")]
    ChainedCast { span: Span },
    #[error("'void' cannot appear in a multi-value return type")]
    VoidInTuple { span: Span },
    #[error("invalid syntax in {context}")]
    InvalidSyntax { context: String, span: Span },
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            ParseError::UnexpectedToken { span, .. }
            | ParseError::UnexpectedEof { span, .. }
            | ParseError::InvalidAssignmentTarget { span }
            | ParseError::ChainedCast { span }
            | ParseError::VoidInTuple { span }
            | ParseError::InvalidSyntax { span, .. } => *span,
        }
    }
}

// ---------------------------------------------------------------------------
// Checker errors — the TypeError / NameError / InitError taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum CheckError {
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String, span: Span },
    #[error("operator '{op}' cannot mix {lhs} and {rhs}; insert an explicit 'as' cast")]
    MixedOperands { op: String, lhs: String, rhs: String, span: Span },
    #[error("operator '{op}' is not defined for {ty}")]
    BadOperand { op: String, ty: String, span: Span },
    #[error("condition must be bool, found {found}")]
    NonBoolCondition { found: String, span: Span },
    #[error("value of type {ty} may be null here; narrow with 'if ($x != null)' or 'is'")]
    PossiblyNull { ty: String, span: Span },
    #[error("cannot cast {from} to {to}")]
    InvalidCast { from: String, to: String, span: Span },
    #[error("function '{name}' expects {expected} argument(s), found {found}")]
    ArityMismatch { name: String, expected: String, found: usize, span: Span },
    #[error("return value count mismatch: expected {expected}, found {found}")]
    ReturnCount { expected: usize, found: usize, span: Span },
    #[error("cannot iterate a value of type {ty}")]
    NotIterable { ty: String, span: Span },
    #[error("cannot index a value of type {ty}")]
    NotIndexable { ty: String, span: Span },
    #[error("'{name}' is declared final and cannot be overridden")]
    FinalOverride { name: String, span: Span },
    #[error("cannot instantiate abstract class '{name}'")]
    AbstractInstantiation { name: String, span: Span },
    #[error("class '{class}' must implement abstract method '{method}'")]
    AbstractNotImplemented { class: String, method: String, span: Span },
    #[error("member '{name}' of '{class}' is not visible here")]
    NotVisible { class: String, name: String, span: Span },
    #[error("cannot assign to constant '{name}'")]
    ConstAssignment { name: String, span: Span },
    #[error("'{kw}' outside of a loop")]
    LoopControlOutsideLoop { kw: String, span: Span },

    // NameError family
    #[error("undefined variable '${name}'")]
    UndefinedVariable { name: String, span: Span },
    #[error("undefined function '{name}'")]
    UndefinedFunction { name: String, span: Span },
    #[error("undefined type '{name}'")]
    UndefinedType { name: String, span: Span },
    #[error("'{owner}' has no member '{name}'")]
    UndefinedMember { owner: String, name: String, span: Span },
    #[error("duplicate definition of '{name}'")]
    DuplicateDefinition { name: String, span: Span },

    // InitError family
    #[error("variable '${name}' is read before it is assigned")]
    Uninitialized { name: String, span: Span },
}

impl CheckError {
    pub fn span(&self) -> Span {
        use CheckError::*;
        match self {
            TypeMismatch { span, .. }
            | MixedOperands { span, .. }
            | BadOperand { span, .. }
            | NonBoolCondition { span, .. }
            | PossiblyNull { span, .. }
            | InvalidCast { span, .. }
            | ArityMismatch { span, .. }
            | ReturnCount { span, .. }
            | NotIterable { span, .. }
            | NotIndexable { span, .. }
            | FinalOverride { span, .. }
            | AbstractInstantiation { span, .. }
            | AbstractNotImplemented { span, .. }
            | NotVisible { span, .. }
            | ConstAssignment { span, .. }
            | LoopControlOutsideLoop { span, .. }
            | UndefinedVariable { span, .. }
            | UndefinedFunction { span, .. }
            | UndefinedType { span, .. }
            | UndefinedMember { span, .. }
            | DuplicateDefinition { span, .. }
            | Uninitialized { span, .. } => *span,
        }
    }

    /// Which leg of the static-error taxonomy this belongs to.
    pub fn category(&self) -> &'static str {
        use CheckError::*;
        match self {
            UndefinedVariable { .. }
            | UndefinedFunction { .. }
            | UndefinedType { .. }
            | UndefinedMember { .. }
            | DuplicateDefinition { .. } => "NameError",
            Uninitialized { .. } => "InitError",
            _ => "TypeError",
        }
    }
}

// ---------------------------------------------------------------------------
// Verifier errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum VerifyError {
    #[error("stack underflow at instruction {at} in '{func}'")]
    StackUnderflow { func: String, at: usize },
    #[error("operand stack depth disagrees at instruction {at} in '{func}': {first} vs {second}")]
    DepthMismatch { func: String, at: usize, first: usize, second: usize },
    #[error("jump target {target} out of bounds at instruction {at} in '{func}'")]
    JumpOutOfBounds { func: String, at: usize, target: isize },
    #[error("constant index {index} out of bounds at instruction {at} in '{func}'")]
    BadConstIndex { func: String, at: usize, index: usize },
    #[error("local slot {slot} out of bounds at instruction {at} in '{func}'")]
    BadLocalSlot { func: String, at: usize, slot: usize },
    #[error("execution can fall off the end of '{func}' without returning")]
    MissingReturn { func: String },
    #[error("exception region {region} in '{func}' has invalid bounds")]
    BadRegion { func: String, region: usize },
}

// ---------------------------------------------------------------------------
// Loader errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no prism.toml manifest found above '{start}'")]
    ManifestNotFound { start: String },
    #[error("malformed manifest '{path}': {detail}")]
    BadManifest { path: String, detail: String },
    #[error("cannot resolve 'use {name}'; tried: {tried}")]
    ModuleNotFound { name: String, tried: String },
    #[error("cannot read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Fatal VM errors — never catchable from Prism code
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum FatalError {
    #[error("stack overflow: call depth exceeded {cap} frames")]
    StackOverflow { cap: usize },
    #[error("operand stack overflow (capacity {cap})")]
    OperandOverflow { cap: usize },
    #[error("instruction cap exceeded ({cap} instructions); aborting runaway execution")]
    InstructionCap { cap: u64 },
    #[error("corrupted chunk detected in '{func}': {detail}")]
    CorruptChunk { func: String, detail: String },
}

// ---------------------------------------------------------------------------
// Diagnostics bag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// One collected static diagnostic, already reduced to display form.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub category: &'static str,
    pub message: String,
    pub span: Span,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{} [{}] {} (at {})", tag, self.category, self.message, self.span)
    }
}

/// Collects everything a phase finds; the phase's artifact is `None`
/// whenever `has_errors()` at the end.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics { items: Vec::new() }
    }

    pub fn error(&mut self, category: &'static str, message: String, span: Span) {
        self.items.push(Diagnostic { severity: Severity::Error, category, message, span });
    }

    pub fn warning(&mut self, category: &'static str, message: String, span: Span) {
        self.items.push(Diagnostic { severity: Severity::Warning, category, message, span });
    }

    pub fn push_lex(&mut self, e: &LexError) {
        self.error("LexError", e.to_string(), e.span());
    }

    pub fn push_parse(&mut self, e: &ParseError) {
        self.error("ParseError", e.to_string(), e.span());
    }

    pub fn push_check(&mut self, e: &CheckError) {
        self.error(e.category(), e.to_string(), e.span());
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_merge_keeps_left_anchor() {
        let a = Span::new(0, 4, 8, 2, 5);
        let b = Span::new(0, 10, 14, 3, 1);
        let m = a.merge(b);
        assert_eq!(m.start, 4);
        assert_eq!(m.end, 14);
        assert_eq!((m.line, m.col), (2, 5));
    }

    #[test]
    fn check_error_categories() {
        let name = CheckError::UndefinedVariable { name: "x".into(), span: Span::default() };
        let init = CheckError::Uninitialized { name: "x".into(), span: Span::default() };
        let ty = CheckError::NonBoolCondition { found: "int".into(), span: Span::default() };
        assert_eq!(name.category(), "NameError");
        assert_eq!(init.category(), "InitError");
        assert_eq!(ty.category(), "TypeError");
    }

    #[test]
    fn diagnostics_bag_counts_errors_only() {
        let mut bag = Diagnostics::new();
        bag.warning("TypeError", "unreachable code".into(), Span::default());
        assert!(!bag.has_errors());
        bag.error("ParseError", "oops".into(), Span::default());
        assert!(bag.has_errors());
        assert_eq!(bag.len(), 2);
    }
}
