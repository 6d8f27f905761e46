/// JIT bridge.
///
/// The VM never compiles code itself; it hands hot functions to a pluggable
/// `NativeCompiler` and accepts either an entry point or a refusal. The
/// single admission predicate `can_jit` is the only gating rule — the
/// interpreter, the profiler, and any backend all consult it, so the
/// decision can never drift between them.

use crate::bytecode::{Function, TypeTag};
use crate::core::value::Value;

/// A compiled entry point honouring the interpreter's calling convention:
/// arguments arrive fully padded/packed (defaults and variadics applied by
/// the caller), `Ok` carries the return value, `Err` carries a thrown
/// exception value to be re-raised by the interpreter.
#[derive(Clone, Copy)]
pub struct CompiledEntry(pub fn(&[Value]) -> Result<Value, Value>);

impl std::fmt::Debug for CompiledEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompiledEntry({:p})", self.0 as *const ())
    }
}

impl PartialEq for CompiledEntry {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0 as *const (), other.0 as *const ())
    }
}

/// Why a function was refused by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligible {
    Variadic,
    Native,
    FloatSignature,
    MultiReturn,
    Unsupported(String),
}

impl std::fmt::Display for Ineligible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ineligible::Variadic => write!(f, "variadic parameters"),
            Ineligible::Native => write!(f, "native function"),
            Ineligible::FloatSignature => write!(f, "float in signature"),
            Ineligible::MultiReturn => write!(f, "multiple return values"),
            Ineligible::Unsupported(what) => write!(f, "unsupported: {}", what),
        }
    }
}

/// Speculative hints distilled from the inline caches of a hot function.
#[derive(Debug, Clone, Default)]
pub struct TypeFeedback {
    /// Observed monomorphic receiver classes per call site, in site order.
    pub monomorphic_sites: Vec<Option<String>>,
}

/// The native-compiler contract. Backends receive the function plus type
/// feedback and either return an entry point or decline. Compiled entries
/// must reproduce the interpreter's argument packing and exception
/// semantics exactly, or decline compilation.
pub trait NativeCompiler {
    fn compile(&mut self, func: &Function, feedback: &TypeFeedback) -> Result<CompiledEntry, Ineligible>;
}

/// Sole source of truth for JIT admission.
///
/// Floats are rejected because the native value bridge carries only
/// integer/bool/reference payloads; a backend wanting floats must provide a
/// tagged bridge and loosen this predicate in lockstep.
pub fn can_jit(func: &Function) -> bool {
    if func.variadic || func.native.is_some() {
        return false;
    }
    if func.returns > 1 {
        return false;
    }
    fn scalar_ok(t: &TypeTag) -> bool {
        match t {
            TypeTag::Float => false,
            TypeTag::Nullable(inner) => scalar_ok(inner),
            _ => true,
        }
    }
    func.param_types.iter().all(scalar_ok) && func.ret_types.iter().all(scalar_ok)
}

/// A backend that refuses everything — the default wiring until a real
/// code generator is attached.
#[derive(Debug, Default)]
pub struct DisabledCompiler;

impl NativeCompiler for DisabledCompiler {
    fn compile(&mut self, _func: &Function, _feedback: &TypeFeedback) -> Result<CompiledEntry, Ineligible> {
        Err(Ineligible::Unsupported("no native backend configured".into()))
    }
}

/// One fallback-to-interpreter event, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct DeoptRecord {
    pub function: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Function;

    #[test]
    fn variadic_functions_are_rejected() {
        let f = Function { variadic: true, ..Function::default() };
        assert!(!can_jit(&f));
    }

    #[test]
    fn float_signature_is_rejected() {
        let f = Function { param_types: vec![TypeTag::Float], ..Function::default() };
        assert!(!can_jit(&f));
        let g = Function { ret_types: vec![TypeTag::Float], ..Function::default() };
        assert!(!can_jit(&g));
    }

    #[test]
    fn int_signature_is_admitted() {
        let f = Function {
            param_types: vec![TypeTag::Int, TypeTag::Int],
            ret_types: vec![TypeTag::Int],
            returns: 1,
            ..Function::default()
        };
        assert!(can_jit(&f));
    }

    #[test]
    fn disabled_compiler_declines() {
        let mut c = DisabledCompiler;
        let f = Function::default();
        assert!(c.compile(&f, &TypeFeedback::default()).is_err());
    }
}
