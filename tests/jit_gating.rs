/// Hotness profiling and JIT admission: counters cross the configured
/// threshold, `can_jit` gates admission as the single source of truth, a
/// backend-provided entry replaces interpretation, and refusals are
/// recorded as deopt reasons rather than failing the run.

use prism::bytecode::Function;
use prism::core::value::Value;
use prism::jit::{can_jit, CompiledEntry, Ineligible, NativeCompiler, TypeFeedback};
use prism::vm::{compile_source, BufferSink, Vm};
use prism::VmConfig;

/// A toy backend: compiles any admissible function to an entry returning a
/// fixed sentinel, so tests can observe when native code takes over.
struct SentinelBackend;

fn sentinel_entry(_args: &[Value]) -> Result<Value, Value> {
    Ok(Value::Int(777))
}

impl NativeCompiler for SentinelBackend {
    fn compile(&mut self, func: &Function, _feedback: &TypeFeedback) -> Result<CompiledEntry, Ineligible> {
        if !can_jit(func) {
            return Err(Ineligible::Unsupported("predicate".into()));
        }
        Ok(CompiledEntry(sentinel_entry))
    }
}

/// A backend that refuses everything, to observe deopt records.
struct RefusingBackend;

impl NativeCompiler for RefusingBackend {
    fn compile(&mut self, _func: &Function, _feedback: &TypeFeedback) -> Result<CompiledEntry, Ineligible> {
        Err(Ineligible::Unsupported("refused by test backend".into()))
    }
}

fn vm_with_backend(src: &str, backend: Box<dyn NativeCompiler>) -> (Vm, BufferSink) {
    let program = compile_source(src).unwrap_or_else(|d| {
        panic!("compile failed: {:?}", d.iter().collect::<Vec<_>>());
    });
    let sink = BufferSink::new();
    let mut vm = Vm::with_output(VmConfig::for_tests(), Box::new(sink.clone()));
    vm.set_jit(backend);
    vm.install(program);
    (vm, sink)
}

#[test]
fn hot_function_switches_to_compiled_entry() {
    // `answer` is int-only and non-variadic: admissible. The test config
    // makes it hot after 4 calls; once the backend entry is installed the
    // VM must divert calls to it.
    let src = r#"
        function answer(): int { return 42; }
        int $last = 0;
        for (int $i = 0; $i < 400; $i++) { $last = answer(); }
        echo $last;
    "#;
    let (mut vm, sink) = vm_with_backend(src, Box::new(SentinelBackend));
    vm.run().expect("runs");
    assert_eq!(sink.contents(), "777\n");

    let compiled = vm
        .functions
        .iter()
        .find(|f| f.name == "answer")
        .expect("function present")
        .compiled
        .is_some();
    assert!(compiled, "hot admissible function should be compiled");
}

#[test]
fn cold_function_stays_interpreted() {
    let src = r#"
        function once(): int { return 5; }
        echo once();
    "#;
    let (mut vm, sink) = vm_with_backend(src, Box::new(SentinelBackend));
    vm.run().expect("runs");
    assert_eq!(sink.contents(), "5\n");
    let f = vm.functions.iter().find(|f| f.name == "once").expect("function");
    assert!(f.compiled.is_none(), "a single call must not trigger compilation");
}

#[test]
fn variadic_function_is_rejected_by_the_predicate() {
    let src = r#"
        function total(int ...$xs): int {
            int $s = 0;
            foreach ($xs as $x) { $s = $s + $x; }
            return $s;
        }
        int $acc = 0;
        for (int $i = 0; $i < 400; $i++) { $acc = total(1, 2); }
        echo $acc;
    "#;
    let (mut vm, sink) = vm_with_backend(src, Box::new(SentinelBackend));
    vm.run().expect("runs");
    // Interpreter result, never the sentinel.
    assert_eq!(sink.contents(), "3\n");
    let f = vm.functions.iter().find(|f| f.name == "total").expect("function");
    assert!(f.compiled.is_none());
    assert!(
        vm.deopts.iter().any(|d| d.function == "total"),
        "rejection must be recorded: {:?}",
        vm.deopts
    );
}

#[test]
fn float_signature_is_rejected_by_the_predicate() {
    let f = Function {
        param_types: vec![prism::bytecode::TypeTag::Float],
        ret_types: vec![prism::bytecode::TypeTag::Int],
        returns: 1,
        ..Function::default()
    };
    assert!(!can_jit(&f));
}

#[test]
fn backend_refusal_records_deopt_and_execution_continues() {
    let src = r#"
        function hot(): int { return 9; }
        int $last = 0;
        for (int $i = 0; $i < 400; $i++) { $last = hot(); }
        echo $last;
    "#;
    let (mut vm, sink) = vm_with_backend(src, Box::new(RefusingBackend));
    vm.run().expect("interpreter fallback keeps running");
    assert_eq!(sink.contents(), "9\n");
    assert!(
        vm.deopts.iter().any(|d| d.function == "hot" && d.reason.contains("refused")),
        "refusal reason recorded: {:?}",
        vm.deopts
    );
}

#[test]
fn jit_disabled_by_default() {
    let src = r#"
        function warm(): int { return 1; }
        int $n = 0;
        for (int $i = 0; $i < 400; $i++) { $n = $n + warm(); }
        echo $n;
    "#;
    let program = compile_source(src).expect("compiles");
    let sink = BufferSink::new();
    let mut vm = Vm::with_output(VmConfig::for_tests(), Box::new(sink.clone()));
    vm.install(program);
    vm.run().expect("runs");
    assert_eq!(sink.contents(), "400\n");
    assert!(vm.functions.iter().all(|f| f.compiled.is_none()));
}
