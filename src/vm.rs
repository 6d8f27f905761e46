/// The Prism virtual machine.
///
/// A stack machine over the tagged values of `core::value`. One instance
/// owns one heap, one operand stack, one frame stack, its globals and
/// caches; instances share nothing. The main loop fetches, decodes and
/// dispatches; every `gc_step_interval` instructions the GC takes an
/// incremental step and the hot-function queue is serviced. Exceptions are
/// ordinary values routed through a dedicated pending slot and the
/// exception-region tables; only FatalError conditions (frame overflow,
/// operand overflow, instruction cap, corrupt chunks) escape the exception
/// system entirely.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

use crate::bytecode::{Const, Function, Op, TypeTag};
use crate::compiler::Program;
use crate::conf::VmConfig;
use crate::core::object::{
    find_const, find_method_with_vtable, find_prop, is_instance_of, Class, ClosureData, EntryKey,
    EnumDef, Instance, Interface, IterState, SuperArray, TraceFrame,
};
use crate::core::value::{ClassId, FuncId, Handle, Value};
use crate::errors::FatalError;
use crate::gc::{Heap, ObjPayload};
use crate::inline_cache::IcTable;
use crate::jit::{can_jit, DeoptRecord, NativeCompiler, TypeFeedback};
use crate::profiler::{Profiler, ProfilerConfig};

/// Host-function interface: plain values in, one value out; returning an
/// exception-kind value signals a throw. Implementations must not retain
/// the argument slice past the call.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Value;

pub struct NativeDef {
    pub name: &'static str,
    pub func: NativeFn,
    pub min_arity: u8,
    pub arity: u8,
}

// ---------------------------------------------------------------------------
// Run errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RunError {
    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),
    #[error("uncaught {class}: {message}\n{trace}")]
    Uncaught { class: String, message: String, trace: String },
}

enum Signal {
    Exc(Value),
    Fatal(FatalError),
}

enum Flow {
    Continue,
    Done,
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TryRecord {
    region: u16,
    stack_height: usize,
}

struct Frame {
    func: FuncId,
    closure: Option<Handle>,
    pc: usize,
    /// Stack index of slot 0 (callee/receiver).
    base: usize,
    expect_rets: u8,
    tries: Vec<TryRecord>,
}

// ---------------------------------------------------------------------------
// Output sink with trailing-newline tracking
// ---------------------------------------------------------------------------

/// Cloneable in-memory sink for tests and tooling.
#[derive(Clone, Default)]
pub struct BufferSink(Arc<Mutex<Vec<u8>>>);

impl BufferSink {
    pub fn new() -> Self {
        BufferSink::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("sink lock")).into_owned()
    }
}

impl Write for BufferSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("sink lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// The VM
// ---------------------------------------------------------------------------

pub struct Vm {
    pub config: VmConfig,
    pub heap: Heap,

    pub functions: Vec<Function>,
    pub classes: Vec<Class>,
    pub class_by_name: HashMap<String, ClassId>,
    pub interfaces: Vec<Interface>,
    pub enums: Vec<EnumDef>,

    pub globals: IndexMap<String, Value>,
    statics: HashMap<(ClassId, String), Value>,

    stack: Vec<Value>,
    frames: Vec<Frame>,
    /// The in-flight exception while a finally pad runs. A GC root.
    pending: Option<Value>,

    ics: Vec<IcTable>,
    pub profiler: Profiler,
    jit: Option<Box<dyn NativeCompiler>>,
    jit_failed: Vec<bool>,
    pub deopts: Vec<DeoptRecord>,

    natives: Vec<NativeDef>,
    entry: FuncId,

    out: Box<dyn Write>,
    wrote_any: bool,
    last_byte: u8,

    instructions: u64,
    since_step: u32,
    root_scratch: Vec<Value>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let heap = Heap::new(
            config.gc_initial_threshold,
            config.gc_old_factor,
            config.gc_promote_age,
            config.gc_slice_budget,
            config.gc_debug,
        );
        let profiler = Profiler::new(ProfilerConfig {
            hot_call_threshold: config.hot_call_threshold,
            hot_loop_threshold: config.hot_loop_threshold,
        });
        let mut vm = Vm {
            config,
            heap,
            functions: Vec::new(),
            classes: Vec::new(),
            class_by_name: HashMap::new(),
            interfaces: Vec::new(),
            enums: Vec::new(),
            globals: IndexMap::new(),
            statics: HashMap::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            pending: None,
            ics: Vec::new(),
            profiler,
            jit: None,
            jit_failed: Vec::new(),
            deopts: Vec::new(),
            natives: Vec::new(),
            entry: 0,
            out: Box::new(std::io::sink()),
            wrote_any: false,
            last_byte: b'\n',
            instructions: 0,
            since_step: 0,
            root_scratch: Vec::new(),
        };
        crate::intrinsics::install_builtins(&mut vm);
        vm
    }

    pub fn with_output(config: VmConfig, out: Box<dyn Write>) -> Self {
        let mut vm = Vm::new(config);
        vm.out = out;
        vm
    }

    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    /// Attach a native compiler backend and enable JIT admission.
    pub fn set_jit(&mut self, backend: Box<dyn NativeCompiler>) {
        self.jit = Some(backend);
        self.config.jit_enabled = true;
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Register a host function; it becomes a callable global.
    pub fn register_native(&mut self, def: NativeDef) -> FuncId {
        let native_idx = self.natives.len() as u16;
        let id = self.functions.len() as FuncId;
        self.functions.push(Function {
            name: def.name.to_string(),
            min_arity: def.min_arity,
            arity: def.arity,
            variadic: true,
            native: Some(native_idx),
            ..Function::default()
        });
        self.globals.insert(def.name.to_string(), Value::Function(id));
        self.natives.push(def);
        id
    }

    /// Register a native method on an already-registered builtin class.
    pub fn register_native_method(&mut self, class: ClassId, method: &'static str, def: NativeDef) {
        let id = self.register_native(def);
        let global_name = self.functions[id as usize].name.clone();
        self.globals.shift_remove(global_name.as_str());
        self.classes[class as usize].methods.entry(method.to_string()).or_default().push(id);
    }

    pub fn register_class(&mut self, class: Class) -> ClassId {
        let id = self.classes.len() as ClassId;
        let mut class = class;
        class.id = id;
        self.class_by_name.insert(class.name.clone(), id);
        self.classes.push(class);
        id
    }

    /// Install a compiled program: functions and classes are appended after
    /// the builtins, name tables and statics initialized, globals bound.
    pub fn install(&mut self, program: Program) {
        let func_off = self.functions.len() as u16;
        let class_off = self.classes.len() as u16;

        for mut f in program.functions {
            remap_chunk(&mut f.chunk, func_off);
            let is_free = !f.name.contains("::") && !f.name.starts_with('<');
            let id = self.functions.len() as FuncId;
            if is_free {
                let key = if self.globals.contains_key(&f.name) {
                    format!("{}#{}", f.name, f.arity)
                } else {
                    f.name.clone()
                };
                self.globals.insert(key, Value::Function(id));
            }
            self.functions.push(f);
        }

        for mut c in program.classes {
            c.id += class_off;
            c.parent = c.parent.map(|p| p + class_off);
            for ids in c.methods.values_mut() {
                for id in ids {
                    *id += func_off;
                }
            }
            for id in c.vtable.values_mut() {
                *id += func_off;
            }
            // Parents declared outside the program (builtins) resolve here.
            if c.parent.is_none() {
                if let Some(pname) = &c.parent_name {
                    c.parent = self.class_by_name.get(pname).copied();
                }
            }
            self.class_by_name.insert(c.name.clone(), c.id);
            // Static property defaults materialize now.
            for p in c.props.iter().filter(|p| p.is_static) {
                let value = self.const_value(&p.default.clone());
                self.statics.insert((c.id, p.name.clone()), value);
            }
            let id = c.id;
            self.globals.insert(c.name.clone(), Value::Class(id));
            self.classes.push(c);
        }

        self.interfaces.extend(program.interfaces);
        self.enums.extend(program.enums);
        self.entry = program.entry + func_off;

        self.ics = self.functions.iter().map(|_| IcTable::default()).collect();
        self.jit_failed = vec![false; self.functions.len()];
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).copied()
    }

    // ── Running ──────────────────────────────────────────────────────────────

    pub fn run(&mut self) -> Result<(), RunError> {
        let entry = self.entry;
        let base = self.stack.len();
        self.stack.push(Value::Function(entry));
        let locals = self.functions[entry as usize].locals as usize;
        self.stack.resize(base + locals.max(1), Value::Null);
        self.frames.push(Frame {
            func: entry,
            closure: None,
            pc: 0,
            base,
            expect_rets: 0,
            tries: Vec::new(),
        });

        let result = self.interpret();
        match result {
            Ok(()) => {
                // A run that produced output always ends with a newline.
                if self.wrote_any && self.last_byte != b'\n' {
                    let _ = self.out.write_all(b"\n");
                }
                let _ = self.out.flush();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn interpret(&mut self) -> Result<(), RunError> {
        loop {
            // Sequence point: GC step, profiler service, instruction cap.
            self.since_step += 1;
            if self.since_step >= self.config.gc_step_interval {
                self.profiler.count_instructions(self.since_step as u64);
                self.since_step = 0;
                self.gc_step();
                self.service_hot_queue();
            }
            self.instructions += 1;
            if self.instructions > self.config.instruction_cap {
                return Err(RunError::Fatal(FatalError::InstructionCap {
                    cap: self.config.instruction_cap,
                }));
            }

            let frame = self.frames.last().expect("frame present while interpreting");
            let func = &self.functions[frame.func as usize];
            if frame.pc >= func.chunk.code.len() {
                // Fell off the end: implicit void return.
                match self.do_return(0) {
                    Ok(Flow::Done) => return Ok(()),
                    Ok(Flow::Continue) => continue,
                    Err(signal) => {
                        self.handle_signal(signal)?;
                        continue;
                    }
                }
            }
            let op = func.chunk.code[frame.pc].clone();
            let frame = self.frames.last_mut().expect("frame");
            frame.pc += 1;

            match self.exec(op) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => return Ok(()),
                Err(signal) => self.handle_signal(signal)?,
            }
        }
    }

    fn handle_signal(&mut self, signal: Signal) -> Result<(), RunError> {
        match signal {
            Signal::Fatal(f) => Err(RunError::Fatal(f)),
            Signal::Exc(value) => self.unwind(value),
        }
    }

    // ── Roots & GC ───────────────────────────────────────────────────────────

    fn gc_step(&mut self) {
        let mut roots = std::mem::take(&mut self.root_scratch);
        roots.clear();
        self.collect_roots(&mut roots);
        self.heap.step(&roots);
        self.root_scratch = roots;
    }

    fn collect_roots(&self, roots: &mut Vec<Value>) {
        roots.extend_from_slice(&self.stack);
        roots.extend(self.globals.values().copied());
        roots.extend(self.statics.values().copied());
        if let Some(p) = self.pending {
            roots.push(p);
        }
        for f in &self.frames {
            if let Some(h) = f.closure {
                roots.push(Value::Closure(h));
            }
        }
    }

    /// Full collection on behalf of `gc_collect`.
    pub fn gc_collect_now(&mut self) {
        let mut roots = std::mem::take(&mut self.root_scratch);
        roots.clear();
        self.collect_roots(&mut roots);
        self.heap.collect_full(&roots);
        self.root_scratch = roots;
    }

    // ── JIT servicing ────────────────────────────────────────────────────────

    fn service_hot_queue(&mut self) {
        if !self.config.jit_enabled {
            return;
        }
        let pending = self.profiler.take_pending_hot();
        for id in pending {
            let idx = id as usize;
            if self.jit_failed[idx] || self.functions[idx].compiled.is_some() {
                continue;
            }
            if !can_jit(&self.functions[idx]) {
                self.jit_failed[idx] = true;
                self.deopts.push(DeoptRecord {
                    function: self.functions[idx].name.clone(),
                    reason: "admission predicate rejected".into(),
                });
                continue;
            }
            let feedback = TypeFeedback {
                monomorphic_sites: self.ics[idx]
                    .sites
                    .iter()
                    .map(|s| {
                        s.monomorphic_class()
                            .map(|c| self.classes[c as usize].name.clone())
                    })
                    .collect(),
            };
            if let Some(backend) = self.jit.as_mut() {
                match backend.compile(&self.functions[idx], &feedback) {
                    Ok(entry) => {
                        debug!(func = %self.functions[idx].name, "jit compiled");
                        self.functions[idx].compiled = Some(entry);
                    }
                    Err(why) => {
                        self.jit_failed[idx] = true;
                        self.deopts.push(DeoptRecord {
                            function: self.functions[idx].name.clone(),
                            reason: why.to_string(),
                        });
                    }
                }
            }
        }
    }

    // ── Value helpers ────────────────────────────────────────────────────────

    pub fn const_value(&mut self, c: &Const) -> Value {
        match c {
            Const::Null => Value::Null,
            Const::Bool(b) => Value::Bool(*b),
            Const::Int(n) => Value::Int(*n),
            Const::Float(f) => Value::Float(*f),
            Const::Str(s) => Value::Str(self.heap.intern_string(s)),
        }
    }

    fn const_str(&self, func: FuncId, idx: u16) -> String {
        match &self.functions[func as usize].chunk.consts[idx as usize] {
            Const::Str(s) => s.clone(),
            other => panic!("expected string constant, found {:?}", other),
        }
    }

    /// Build an exception object of a builtin class and return it as a
    /// throwable value.
    pub fn make_exception(&mut self, class_name: &str, message: &str) -> Value {
        let class = self
            .class_by_name
            .get(class_name)
            .or_else(|| self.class_by_name.get("Exception"))
            .copied()
            .expect("builtin Exception class registered");
        let mut inst = Instance::new(class);
        let msg = self.heap.alloc_string(message);
        inst.fields.insert("message".to_string(), Value::Str(msg));
        let h = self.heap.alloc_instance(inst);
        Value::Exception(h)
    }

    fn raise(&mut self, class_name: &str, message: &str) -> Signal {
        Signal::Exc(self.make_exception(class_name, message))
    }

    fn current_line(&self) -> u32 {
        self.frames
            .last()
            .map(|f| {
                let chunk = &self.functions[f.func as usize].chunk;
                chunk.line_of(f.pc.saturating_sub(1))
            })
            .unwrap_or(0)
    }

    fn capture_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|f| TraceFrame {
                function: self.functions[f.func as usize].name.clone(),
                line: self.functions[f.func as usize].chunk.line_of(f.pc.saturating_sub(1)),
            })
            .collect()
    }

    // ── Exception unwinding ──────────────────────────────────────────────────

    fn unwind(&mut self, exc: Value) -> Result<(), RunError> {
        // Normalise to an object handle and attach the trace exactly once;
        // re-throws keep the original.
        let handle = match exc {
            Value::Exception(h) | Value::Object(h) => h,
            other => {
                // Non-object thrown (host misuse): wrap it.
                let rendered = other.render(&self.heap);
                let wrapped = self.make_exception("Exception", &rendered);
                return self.unwind(wrapped);
            }
        };
        let trace = self.capture_trace();
        {
            let inst = self.heap.instance_of_mut(handle);
            if inst.trace.is_none() {
                inst.trace = Some(trace);
            }
        }
        let exc_class = self.heap.instance_of(handle).class;

        loop {
            if self.frames.is_empty() {
                // Uncaught: surface class, message and the captured trace.
                let inst = self.heap.instance_of(handle);
                let class = self.classes[inst.class as usize].name.clone();
                let message = match inst.fields.get("message") {
                    Some(Value::Str(h)) => self.heap.str_of(*h).to_string(),
                    _ => String::new(),
                };
                let trace = inst
                    .trace
                    .as_ref()
                    .map(|t| {
                        t.iter()
                            .map(|f| format!("  at {} (line {})", f.function, f.line))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                return Err(RunError::Uncaught { class, message, trace });
            }

            let fi = self.frames.len() - 1;
            while let Some(record) = self.frames[fi].tries.pop() {
                let func = self.frames[fi].func;
                let region =
                    self.functions[func as usize].chunk.regions[record.region as usize].clone();

                // Catch table: first entry whose class matches wins; a
                // derived exception matches a base-class catch through the
                // parent chain.
                let mut matched = None;
                for (class_const, handler) in &region.catches {
                    let catch_name = self.const_str(func, *class_const);
                    if is_instance_of(&self.classes, exc_class, &catch_name) {
                        matched = Some(*handler);
                        break;
                    }
                }
                if let Some(handler) = matched {
                    self.stack.truncate(record.stack_height);
                    self.stack.push(Value::Object(handle));
                    self.frames[fi].pc = handler as usize;
                    return Ok(());
                }
                if let Some(pad) = region.finally {
                    self.stack.truncate(record.stack_height);
                    self.pending = Some(Value::Exception(handle));
                    self.frames[fi].pc = pad as usize;
                    return Ok(());
                }
            }

            let base = self.frames[fi].base;
            self.stack.truncate(base);
            self.frames.pop();
        }
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    fn call_value(&mut self, argc: usize, expect_rets: u8, tail: bool) -> Result<(), Signal> {
        let callee_pos = self.stack.len() - 1 - argc;
        let callee = self.stack[callee_pos];

        let (func_id, closure) = match callee {
            Value::Function(id) => (id, None),
            Value::Closure(h) => (self.heap.closure_of(h).func, Some(h)),
            other => {
                return Err(self.raise(
                    "InvalidOperation",
                    &format!("value of type {} is not callable", other.kind()),
                ));
            }
        };

        let func = &self.functions[func_id as usize];
        if !func.accepts(argc) {
            let msg = format!(
                "{} expects {}..{} arguments, got {}",
                func.name,
                func.min_arity,
                if func.variadic { "*".to_string() } else { func.arity.to_string() },
                argc
            );
            return Err(self.raise("ArgumentException", &msg));
        }

        // Native host call: arguments leave the stack entirely.
        if let Some(native_idx) = func.native {
            let mut args = self.heap.pool.take();
            args.extend_from_slice(&self.stack[callee_pos + 1..]);
            self.stack.truncate(callee_pos);
            let f = self.natives[native_idx as usize].func;
            let result = f(self, &args);
            self.heap.pool.put(args);
            return match result {
                Value::Exception(h) => Err(Signal::Exc(Value::Exception(h))),
                v if tail => self.finish_tail_return(v),
                v => {
                    self.stack.push(v);
                    Ok(())
                }
            };
        }

        // Compiled native entry: same calling convention, padded args.
        if func.compiled.is_some() && !self.jit_failed[func_id as usize] {
            self.pad_arguments(func_id, callee_pos, argc)?;
            let entry = self.functions[func_id as usize].compiled.expect("checked above");
            let arity = self.functions[func_id as usize].arity as usize;
            let mut args = self.heap.pool.take();
            args.extend_from_slice(&self.stack[callee_pos + 1..callee_pos + 1 + arity]);
            self.stack.truncate(callee_pos);
            let result = (entry.0)(&args);
            self.heap.pool.put(args);
            return match result {
                Ok(v) if tail => self.finish_tail_return(v),
                Ok(v) => {
                    self.stack.push(v);
                    Ok(())
                }
                Err(exc) => Err(Signal::Exc(exc)),
            };
        }

        let hot = {
            let name = self.functions[func_id as usize].name.clone();
            self.functions[func_id as usize].call_count += 1;
            self.profiler.record_call(func_id, &name)
        };
        let _ = hot;

        self.pad_arguments(func_id, callee_pos, argc)?;

        if tail {
            // Reuse the current frame: slide the callee window down to the
            // frame base and restart. The growable stack means the callee's
            // locals always fit unless the operand cap itself is exceeded.
            let base = self.frames.last().expect("tail call inside a frame").base;
            let new_locals = self.functions[func_id as usize].locals as usize;
            let arity = self.functions[func_id as usize].arity as usize;
            for i in 0..=arity {
                self.stack[base + i] = self.stack[callee_pos + i];
            }
            let need = base + new_locals.max(1);
            if need > self.config.stack_cap {
                return Err(Signal::Fatal(FatalError::OperandOverflow { cap: self.config.stack_cap }));
            }
            self.stack.resize(need, Value::Null);
            for slot in (arity + 1)..new_locals {
                self.stack[base + slot] = Value::Null;
            }
            let frame = self.frames.last_mut().expect("frame");
            frame.func = func_id;
            frame.closure = closure;
            frame.pc = 0;
            frame.tries.clear();
            return Ok(());
        }

        if self.frames.len() >= self.config.frame_cap {
            return Err(Signal::Fatal(FatalError::StackOverflow { cap: self.config.frame_cap }));
        }

        let locals = self.functions[func_id as usize].locals as usize;
        let need = callee_pos + locals.max(1);
        if need > self.stack.len() {
            self.stack.resize(need, Value::Null);
        }
        if self.stack.len() > self.config.stack_cap {
            return Err(Signal::Fatal(FatalError::OperandOverflow { cap: self.config.stack_cap }));
        }

        self.frames.push(Frame {
            func: func_id,
            closure,
            pc: 0,
            base: callee_pos,
            expect_rets,
            tries: Vec::new(),
        });
        Ok(())
    }

    /// A tail call whose callee completed immediately (native or compiled
    /// entry) returns from the current frame with the produced value.
    fn finish_tail_return(&mut self, value: Value) -> Result<(), Signal> {
        let frame = self.frames.pop().expect("tail call inside a frame");
        self.stack.truncate(frame.base);
        for i in 0..frame.expect_rets as usize {
            let v = if i == 0 { value } else { Value::Null };
            self.stack.push(v);
        }
        Ok(())
    }

    /// Pad defaults and pack the variadic tail so the stack holds exactly
    /// `arity` arguments above the callee slot.
    fn pad_arguments(&mut self, func_id: FuncId, callee_pos: usize, argc: usize) -> Result<(), Signal> {
        let (arity, min_arity, variadic) = {
            let f = &self.functions[func_id as usize];
            (f.arity as usize, f.min_arity as usize, f.variadic)
        };
        let named = if variadic { arity - 1 } else { arity };

        if variadic && argc > named {
            // Pack extras into a typed array bound to the variadic slot.
            let extra_start = callee_pos + 1 + named;
            let extras: Vec<Value> = self.stack.drain(extra_start..).collect();
            let elem = self.functions[func_id as usize]
                .param_types
                .last()
                .cloned()
                .unwrap_or(TypeTag::Any);
            let arr = self.heap.alloc_array(elem, extras);
            self.stack.push(Value::Array(arr));
            return Ok(());
        }

        // Missing trailing arguments come from the default table.
        for slot in argc..named {
            let d = self.functions[func_id as usize]
                .defaults
                .get(slot - min_arity)
                .cloned()
                .unwrap_or(Const::Null);
            let v = self.const_value(&d);
            self.stack.push(v);
        }
        if variadic {
            let elem = self.functions[func_id as usize]
                .param_types
                .last()
                .cloned()
                .unwrap_or(TypeTag::Any);
            let arr = self.heap.alloc_array(elem, Vec::new());
            self.stack.push(Value::Array(arr));
        }
        Ok(())
    }

    fn do_return(&mut self, count: u8) -> Result<Flow, Signal> {
        let frame = self.frames.pop().expect("return inside a frame");
        let expect = frame.expect_rets as usize;
        let k = count as usize;

        let mut values = self.heap.pool.take();
        for _ in 0..k {
            values.push(self.stack.pop().expect("return values on stack"));
        }
        values.reverse();
        self.stack.truncate(frame.base);

        if self.frames.is_empty() {
            self.heap.pool.put(values);
            return Ok(Flow::Done);
        }

        // The call site receives exactly what it asked for: a void callee in
        // value position yields null, surplus values are dropped.
        for i in 0..expect {
            let v = values.get(i).copied().unwrap_or(Value::Null);
            self.stack.push(v);
        }
        self.heap.pool.put(values);
        Ok(Flow::Continue)
    }

    // ── Main dispatch ────────────────────────────────────────────────────────

    fn exec(&mut self, op: Op) -> Result<Flow, Signal> {
        match op {
            Op::Push(idx) => {
                let frame = self.frames.last().expect("frame");
                let c = self.functions[frame.func as usize].chunk.consts[idx as usize].clone();
                let v = self.const_value(&c);
                self.push(v)?;
            }
            Op::Pop => {
                self.stack.pop();
            }
            Op::Dup => {
                let top = *self.stack.last().expect("dup target");
                self.push(top)?;
            }
            Op::Swap => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            Op::LoadLocal(slot) => {
                let base = self.frames.last().expect("frame").base;
                let v = self.stack[base + slot as usize];
                self.push(v)?;
            }
            Op::StoreLocal(slot) => {
                let v = self.stack.pop().expect("store value");
                let base = self.frames.last().expect("frame").base;
                self.stack[base + slot as usize] = v;
            }
            Op::LoadGlobal(idx) => {
                let frame = self.frames.last().expect("frame");
                let name = self.const_str(frame.func, idx);
                match self.globals.get(&name).copied() {
                    Some(v) => self.push(v)?,
                    None => {
                        return Err(self.raise("InvalidOperation", &format!("undefined global '{}'", name)));
                    }
                }
            }
            Op::StoreGlobal(idx) => {
                let frame = self.frames.last().expect("frame");
                let name = self.const_str(frame.func, idx);
                let v = self.stack.pop().expect("global value");
                self.globals.insert(name, v);
            }
            Op::LoadUpval(idx) => {
                let closure = self.frames.last().expect("frame").closure.expect("closure frame");
                let v = self.heap.closure_of(closure).upvals[idx as usize];
                self.push(v)?;
            }
            Op::StoreUpval(idx) => {
                let v = self.stack.pop().expect("upval value");
                let closure = self.frames.last().expect("frame").closure.expect("closure frame");
                self.heap.closure_of_mut(closure).upvals[idx as usize] = v;
                self.heap.write_barrier(closure, v);
            }

            Op::Add => self.binary_arith(BinKind::Add)?,
            Op::Sub => self.binary_arith(BinKind::Sub)?,
            Op::Mul => self.binary_arith(BinKind::Mul)?,
            Op::Div => self.binary_arith(BinKind::Div)?,
            Op::Mod => self.binary_arith(BinKind::Mod)?,
            Op::Neg => {
                let v = self.stack.pop().expect("operand");
                let out = match v {
                    Value::Int(n) => Value::Int(n.wrapping_neg()),
                    Value::Float(f) => Value::Float(-f),
                    other => {
                        return Err(self.raise(
                            "InvalidOperation",
                            &format!("unary '-' on {}", other.kind()),
                        ))
                    }
                };
                self.push(out)?;
            }
            Op::Inc | Op::Dec => {
                let delta = if matches!(op, Op::Inc) { 1 } else { -1 };
                let v = self.stack.pop().expect("operand");
                let out = match v {
                    Value::Int(n) => Value::Int(n.wrapping_add(delta)),
                    Value::Float(f) => Value::Float(f + delta as f64),
                    other => {
                        return Err(self.raise(
                            "InvalidOperation",
                            &format!("'++'/'--' on {}", other.kind()),
                        ))
                    }
                };
                self.push(out)?;
            }
            Op::Concat => {
                let b = self.stack.pop().expect("rhs");
                let a = self.stack.pop().expect("lhs");
                let mut s = a.render(&self.heap);
                s.push_str(&b.render(&self.heap));
                let h = self.heap.alloc_string(&s);
                self.push(Value::Str(h))?;
            }
            Op::ToStr => {
                let v = self.stack.pop().expect("operand");
                let s = v.render(&self.heap);
                let h = self.heap.alloc_string(&s);
                self.push(Value::Str(h))?;
            }
            Op::Not => {
                let v = self.stack.pop().expect("operand");
                let b = v.is_truthy(&self.heap);
                self.push(Value::Bool(!b))?;
            }
            Op::BitAnd | Op::BitOr | Op::BitXor | Op::Shl | Op::Shr => {
                let b = self.stack.pop().expect("rhs");
                let a = self.stack.pop().expect("lhs");
                let (Value::Int(x), Value::Int(y)) = (a, b) else {
                    return Err(self.raise(
                        "InvalidOperation",
                        &format!("bitwise operator on {} and {}", a.kind(), b.kind()),
                    ));
                };
                let out = match op {
                    Op::BitAnd => x & y,
                    Op::BitOr => x | y,
                    Op::BitXor => x ^ y,
                    Op::Shl => x.wrapping_shl(y as u32),
                    Op::Shr => x.wrapping_shr(y as u32),
                    _ => unreachable!(),
                };
                self.push(Value::Int(out))?;
            }
            Op::BitNot => {
                let v = self.stack.pop().expect("operand");
                let Value::Int(n) = v else {
                    return Err(self.raise("InvalidOperation", &format!("'~' on {}", v.kind())));
                };
                self.push(Value::Int(!n))?;
            }

            Op::Eq | Op::Ne => {
                let b = self.stack.pop().expect("rhs");
                let a = self.stack.pop().expect("lhs");
                let eq = a.equals(&b, &self.heap);
                self.push(Value::Bool(if matches!(op, Op::Eq) { eq } else { !eq }))?;
            }
            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let b = self.stack.pop().expect("rhs");
                let a = self.stack.pop().expect("lhs");
                let ord = match (a, b) {
                    (Value::Int(x), Value::Int(y)) => x.partial_cmp(&y),
                    (Value::Float(x), Value::Float(y)) => x.partial_cmp(&y),
                    (Value::Str(x), Value::Str(y)) => {
                        self.heap.str_of(x).partial_cmp(self.heap.str_of(y))
                    }
                    (x, y) => {
                        return Err(self.raise(
                            "InvalidOperation",
                            &format!("comparison between {} and {}", x.kind(), y.kind()),
                        ))
                    }
                };
                let out = match (op, ord) {
                    (Op::Lt, Some(o)) => o.is_lt(),
                    (Op::Le, Some(o)) => o.is_le(),
                    (Op::Gt, Some(o)) => o.is_gt(),
                    (Op::Ge, Some(o)) => o.is_ge(),
                    (_, None) => false,
                    _ => unreachable!(),
                };
                self.push(Value::Bool(out))?;
            }

            Op::Jump(off) => {
                self.frames.last_mut().expect("frame").pc += off as usize;
            }
            Op::JumpIfFalse(off) => {
                let v = self.stack.pop().expect("condition");
                if !v.is_truthy(&self.heap) {
                    self.frames.last_mut().expect("frame").pc += off as usize;
                }
            }
            Op::Loop(off) => {
                let frame = self.frames.last_mut().expect("frame");
                frame.pc -= off as usize;
                let func_id = frame.func;
                let target = frame.pc;
                let name = self.functions[func_id as usize].name.clone();
                self.functions[func_id as usize].loop_count += 1;
                self.profiler.record_back_edge(func_id, target, &name);
            }

            Op::Call(argc) => self.call_value(argc as usize, 1, false)?,
            Op::CallN { argc, rets } => self.call_value(argc as usize, rets, false)?,
            Op::TailCall(argc) => self.call_value(argc as usize, 1, true)?,
            Op::Return(k) => return self.do_return(k),

            Op::CallMethod { name, argc, site } => {
                let frame_func = self.frames.last().expect("frame").func;
                let method_name = self.const_str(frame_func, name);
                self.call_method(&method_name, argc as usize, frame_func, site)?;
            }
            Op::CallStatic { class, name, argc } => {
                let frame_func = self.frames.last().expect("frame").func;
                let class_name = self.const_str(frame_func, class);
                let method_name = self.const_str(frame_func, name);
                let Some(&class_id) = self.class_by_name.get(&class_name) else {
                    return Err(self.raise("InvalidOperation", &format!("unknown class '{}'", class_name)));
                };
                let argc = argc as usize;
                let Some(method) =
                    find_method_with_vtable(&self.classes, &self.functions, class_id, &method_name, argc)
                else {
                    return Err(self.raise(
                        "InvalidOperation",
                        &format!("no method {}::{} for {} argument(s)", class_name, method_name, argc),
                    ));
                };
                let callee_pos = self.stack.len() - 1 - argc;
                // The receiver-or-null slot doubles as the callee window.
                self.invoke_method(method, callee_pos, argc)?;
            }

            Op::NewObject(idx) => {
                let frame = self.frames.last().expect("frame");
                let class_name = self.const_str(frame.func, idx);
                let Some(&class_id) = self.class_by_name.get(&class_name) else {
                    return Err(self.raise("InvalidOperation", &format!("unknown class '{}'", class_name)));
                };
                if self.classes[class_id as usize].is_abstract {
                    return Err(self.raise(
                        "InvalidOperation",
                        &format!("cannot instantiate abstract class '{}'", class_name),
                    ));
                }
                let h = self.instantiate(class_id);
                self.push(Value::Object(h))?;
            }
            Op::GetField(idx) => {
                let frame = self.frames.last().expect("frame");
                let field = self.const_str(frame.func, idx);
                let obj = self.stack.pop().expect("receiver");
                let h = match obj {
                    Value::Object(h) | Value::Exception(h) => h,
                    Value::Null => return Err(self.raise("NullReference", "property access on null")),
                    other => {
                        return Err(self.raise(
                            "InvalidOperation",
                            &format!("property access on {}", other.kind()),
                        ))
                    }
                };
                let v = match self.heap.instance_of(h).fields.get(&field) {
                    Some(v) => *v,
                    None => {
                        let class = self.heap.instance_of(h).class;
                        let cname = self.classes[class as usize].name.clone();
                        return Err(self.raise(
                            "InvalidOperation",
                            &format!("{} has no property '{}'", cname, field),
                        ));
                    }
                };
                self.push(v)?;
            }
            Op::SetField(idx) => {
                let frame = self.frames.last().expect("frame");
                let field = self.const_str(frame.func, idx);
                let value = self.stack.pop().expect("value");
                let obj = self.stack.pop().expect("receiver");
                let h = match obj {
                    Value::Object(h) | Value::Exception(h) => h,
                    Value::Null => return Err(self.raise("NullReference", "property access on null")),
                    other => {
                        return Err(self.raise(
                            "InvalidOperation",
                            &format!("property access on {}", other.kind()),
                        ))
                    }
                };
                self.heap.instance_of_mut(h).fields.insert(field, value);
                self.heap.write_barrier(h, value);
            }
            Op::GetStatic { class, name } => {
                let frame = self.frames.last().expect("frame");
                let class_name = self.const_str(frame.func, class);
                let member = self.const_str(frame.func, name);
                let v = self.get_static(&class_name, &member)?;
                self.push(v)?;
            }
            Op::SetStatic { class, name } => {
                let frame = self.frames.last().expect("frame");
                let class_name = self.const_str(frame.func, class);
                let member = self.const_str(frame.func, name);
                let value = self.stack.pop().expect("value");
                let Some(&class_id) = self.class_by_name.get(&class_name) else {
                    return Err(self.raise("InvalidOperation", &format!("unknown class '{}'", class_name)));
                };
                // Store on the defining class so subclasses share it.
                let owner = find_prop(&self.classes, class_id, &member)
                    .map(|(c, _)| c.id)
                    .unwrap_or(class_id);
                self.statics.insert((owner, member), value);
            }

            Op::NewArray(n) => {
                let n = n as usize;
                let start = self.stack.len() - n;
                let items: Vec<Value> = self.stack.drain(start..).collect();
                let elem = items.first().map(value_tag).unwrap_or(TypeTag::Any);
                self.note_alloc_site();
                let h = self.heap.alloc_array(elem, items);
                self.push(Value::Array(h))?;
            }
            Op::ArrayGet => self.index_get()?,
            Op::ArraySet => self.index_set()?,
            Op::NewMap(n) => {
                let n = n as usize;
                let start = self.stack.len() - 2 * n;
                let pairs: Vec<Value> = self.stack.drain(start..).collect();
                let mut entries = IndexMap::new();
                for chunk in pairs.chunks(2) {
                    let key = self.entry_key(chunk[0])?;
                    entries.insert(key, chunk[1]);
                }
                self.note_alloc_site();
                let h = self.heap.alloc_map(entries);
                self.push(Value::Map(h))?;
            }
            Op::MapGet => self.index_get()?,
            Op::MapSet => self.index_set()?,
            Op::NewSuperArray(n) => {
                let n = n as usize;
                let start = self.stack.len() - 2 * n;
                let pairs: Vec<Value> = self.stack.drain(start..).collect();
                let mut sa = SuperArray::new();
                for chunk in pairs.chunks(2) {
                    match chunk[0] {
                        Value::Null => sa.push(chunk[1]),
                        key => {
                            let k = self.entry_key(key)?;
                            sa.set(k, chunk[1]);
                        }
                    }
                }
                self.note_alloc_site();
                let h = self.heap.alloc_super(sa);
                self.push(Value::Super(h))?;
            }
            Op::SuperGet => self.index_get()?,
            Op::SuperSet => self.index_set()?,

            Op::IterNew => {
                let container = self.stack.pop().expect("container");
                match container {
                    Value::Array(_) | Value::Map(_) | Value::Super(_) => {
                        let h = self.heap.alloc_iter(IterState { container, pos: 0 });
                        // The iterator handle lives on the operand stack and
                        // is therefore a GC root for the whole loop.
                        self.push(Value::Bytes(h))?;
                    }
                    other => {
                        return Err(self.raise(
                            "InvalidOperation",
                            &format!("cannot iterate {}", other.kind()),
                        ))
                    }
                }
            }
            Op::IterNext(off) => {
                let iter_val = *self.stack.last().expect("iterator");
                let h = iter_val.handle().expect("iterator handle");
                let (container, pos) = {
                    let it = self.heap.iter_of_mut(h);
                    (it.container, it.pos)
                };
                // Phase 1: read the entry without touching the heap mutably.
                let pair: Option<(EntryKey, Value)> = match container {
                    Value::Array(arr) => self
                        .heap
                        .array_items(arr)
                        .get(pos)
                        .map(|v| (EntryKey::Int(pos as i64), *v)),
                    Value::Map(m) => self
                        .heap
                        .map_entries(m)
                        .get_index(pos)
                        .map(|(k, v)| (k.clone(), *v)),
                    Value::Super(s) => self
                        .heap
                        .super_of(s)
                        .entries
                        .get_index(pos)
                        .map(|(k, v)| (k.clone(), *v)),
                    _ => None,
                };
                // Phase 2: materialise the key (may allocate) and advance.
                match pair {
                    Some((key, v)) => {
                        let k = match key {
                            EntryKey::Int(n) => Value::Int(n),
                            EntryKey::Str(s) => {
                                let sh = self.heap.intern_string(&s);
                                Value::Str(sh)
                            }
                        };
                        self.heap.iter_of_mut(h).pos = pos + 1;
                        self.push(k)?;
                        self.push(v)?;
                    }
                    None => {
                        self.frames.last_mut().expect("frame").pc += off as usize;
                    }
                }
            }

            Op::EnterTry(region) => {
                let height = self.stack.len();
                self.frames.last_mut().expect("frame").tries.push(TryRecord {
                    region,
                    stack_height: height,
                });
            }
            Op::LeaveTry => {
                self.frames.last_mut().expect("frame").tries.pop();
            }
            Op::EnterCatch(_) => {
                // The unwinder already popped the try record and pushed the
                // exception; nothing to do at runtime.
            }
            Op::EnterFinally => {
                // Landing pad entry on the exception path; the pending slot
                // holds the in-flight exception.
            }
            Op::EndFinally => {
                if let Some(exc) = self.pending.take() {
                    return Err(Signal::Exc(exc));
                }
            }
            Op::Throw => {
                let v = self.stack.pop().expect("thrown value");
                return Err(Signal::Exc(v));
            }

            Op::CheckType(idx) => {
                let frame = self.frames.last().expect("frame");
                let tag = self.functions[frame.func as usize].chunk.types[idx as usize].clone();
                let v = self.stack.pop().expect("operand");
                let ok = self.check_type(&v, &tag);
                self.push(Value::Bool(ok))?;
            }
            Op::Cast(idx) => {
                let frame = self.frames.last().expect("frame");
                let tag = self.functions[frame.func as usize].chunk.types[idx as usize].clone();
                let v = self.stack.pop().expect("operand");
                match self.cast(v, &tag) {
                    Some(out) => self.push(out)?,
                    None => {
                        return Err(self.raise(
                            "InvalidCast",
                            &format!("cannot cast {} to {}", v.kind(), tag.display()),
                        ))
                    }
                }
            }
            Op::CastSafe(idx) => {
                let frame = self.frames.last().expect("frame");
                let tag = self.functions[frame.func as usize].chunk.types[idx as usize].clone();
                let v = self.stack.pop().expect("operand");
                let out = self.cast(v, &tag).unwrap_or(Value::Null);
                self.push(out)?;
            }

            Op::MakeClosure { func, upvals } => {
                let frame_base = self.frames.last().expect("frame").base;
                let frame_closure = self.frames.last().expect("frame").closure;
                let mut captured = Vec::with_capacity(upvals.len());
                for recipe in &upvals {
                    let v = if recipe.from_local {
                        self.stack[frame_base + recipe.index as usize]
                    } else {
                        let ch = frame_closure.expect("nested capture inside a closure");
                        self.heap.closure_of(ch).upvals[recipe.index as usize]
                    };
                    captured.push(v);
                }
                self.note_alloc_site();
                let h = self.heap.alloc_closure(ClosureData { func, upvals: captured });
                self.push(Value::Closure(h))?;
            }

            Op::Echo => {
                let v = self.stack.pop().expect("echo operand");
                let s = v.render(&self.heap);
                self.write_out(s.as_bytes());
            }
            Op::Nop => {}
        }
        Ok(Flow::Continue)
    }

    // ── Dispatch helpers ─────────────────────────────────────────────────────

    fn call_method(&mut self, name: &str, argc: usize, caller: FuncId, site: u16) -> Result<(), Signal> {
        let recv_pos = self.stack.len() - 1 - argc;
        let recv = self.stack[recv_pos];

        let h = match recv {
            Value::Object(h) | Value::Exception(h) => h,
            Value::Null => return Err(self.raise("NullReference", "method call on null")),
            // Built-in container/string methods.
            other => return self.builtin_method(other, name, argc),
        };
        let class = self.heap.instance_of(h).class;

        // Inline cache: monomorphic hit is one compare + direct call.
        let cached = self.ics[caller as usize].site(site as usize).lookup(class);
        let method = match cached {
            Some(m) => m,
            None => {
                let Some(m) = find_method_with_vtable(&self.classes, &self.functions, class, name, argc)
                else {
                    let cname = self.classes[class as usize].name.clone();
                    return Err(self.raise(
                        "InvalidOperation",
                        &format!("no method {}::{} for {} argument(s)", cname, name, argc),
                    ));
                };
                self.ics[caller as usize].site(site as usize).fill(class, m);
                m
            }
        };

        self.invoke_method(method, recv_pos, argc)
    }

    /// Invoke a resolved method whose receiver already sits at `recv_pos`.
    fn invoke_method(&mut self, method: FuncId, recv_pos: usize, argc: usize) -> Result<(), Signal> {
        let func = &self.functions[method as usize];
        if !func.accepts(argc) {
            let msg = format!("{} expects {} argument(s), got {}", func.name, func.arity, argc);
            return Err(self.raise("ArgumentException", &msg));
        }
        if let Some(native_idx) = func.native {
            // Native methods receive the receiver as args[0].
            let mut args = self.heap.pool.take();
            args.extend_from_slice(&self.stack[recv_pos..]);
            self.stack.truncate(recv_pos);
            let f = self.natives[native_idx as usize].func;
            let result = f(self, &args);
            self.heap.pool.put(args);
            return match result {
                Value::Exception(h) => Err(Signal::Exc(Value::Exception(h))),
                v => {
                    self.stack.push(v);
                    Ok(())
                }
            };
        }

        let name = func.name.clone();
        self.functions[method as usize].call_count += 1;
        self.profiler.record_call(method, &name);

        self.pad_arguments(method, recv_pos, argc)?;
        if self.frames.len() >= self.config.frame_cap {
            return Err(Signal::Fatal(FatalError::StackOverflow { cap: self.config.frame_cap }));
        }
        let locals = self.functions[method as usize].locals as usize;
        let need = recv_pos + locals.max(1);
        if need > self.stack.len() {
            self.stack.resize(need, Value::Null);
        }
        if self.stack.len() > self.config.stack_cap {
            return Err(Signal::Fatal(FatalError::OperandOverflow { cap: self.config.stack_cap }));
        }
        self.frames.push(Frame {
            func: method,
            closure: None,
            pc: 0,
            base: recv_pos,
            expect_rets: 1,
            tries: Vec::new(),
        });
        Ok(())
    }

    /// `push`, `set`, `get`, `has`, `length` and friends on the container
    /// kinds, plus `length` on strings and bytes.
    fn builtin_method(&mut self, recv: Value, name: &str, argc: usize) -> Result<(), Signal> {
        let args_start = self.stack.len() - argc;
        let args: Vec<Value> = self.stack.drain(args_start..).collect();
        self.stack.pop(); // receiver

        let result: Result<Value, Signal> = match (recv, name) {
            (Value::Super(h), "push") if argc == 1 => {
                self.heap.super_of_mut(h).push(args[0]);
                self.heap.write_barrier(h, args[0]);
                Ok(Value::Null)
            }
            (Value::Super(h), "set") if argc == 2 => {
                let key = self.entry_key(args[0])?;
                self.heap.super_of_mut(h).set(key, args[1]);
                self.heap.write_barrier(h, args[1]);
                Ok(Value::Null)
            }
            (Value::Super(h), "get") if argc == 1 => {
                let key = self.entry_key(args[0])?;
                Ok(self.heap.super_of(h).get(&key).copied().unwrap_or(Value::Null))
            }
            (Value::Super(h), "has") if argc == 1 => {
                let key = self.entry_key(args[0])?;
                Ok(Value::Bool(self.heap.super_of(h).has(&key)))
            }
            (Value::Super(h), "length") if argc == 0 => Ok(Value::Int(self.heap.super_len(h) as i64)),
            (Value::Array(h), "push") if argc == 1 => {
                self.heap.array_items_mut(h).push(args[0]);
                self.heap.write_barrier(h, args[0]);
                Ok(Value::Null)
            }
            (Value::Array(h), "pop") if argc == 0 => {
                Ok(self.heap.array_items_mut(h).pop().unwrap_or(Value::Null))
            }
            (Value::Array(h), "length") if argc == 0 => Ok(Value::Int(self.heap.array_len(h) as i64)),
            (Value::Map(h), "set") if argc == 2 => {
                let key = self.entry_key(args[0])?;
                self.heap.map_entries_mut(h).insert(key, args[1]);
                self.heap.write_barrier(h, args[1]);
                Ok(Value::Null)
            }
            (Value::Map(h), "get") if argc == 1 => {
                let key = self.entry_key(args[0])?;
                Ok(self.heap.map_entries(h).get(&key).copied().unwrap_or(Value::Null))
            }
            (Value::Map(h), "has") if argc == 1 => {
                let key = self.entry_key(args[0])?;
                Ok(Value::Bool(self.heap.map_entries(h).contains_key(&key)))
            }
            (Value::Map(h), "length") if argc == 0 => Ok(Value::Int(self.heap.map_len(h) as i64)),
            (Value::Str(h), "length") if argc == 0 => {
                Ok(Value::Int(self.heap.str_of(h).chars().count() as i64))
            }
            (Value::Bytes(h), "length") if argc == 0 => Ok(Value::Int(self.heap.bytes_of(h).len() as i64)),
            (Value::Bytes(h), "push") if argc == 1 => match args[0] {
                Value::Int(n) => {
                    match self.heap.payload_mut(h) {
                        ObjPayload::Bytes(b) => b.push(n as u8),
                        _ => unreachable!("bytes handle"),
                    }
                    Ok(Value::Null)
                }
                other => Err(self.raise("ArgumentException", &format!("bytes.push expects int, got {}", other.kind()))),
            },
            (recv, name) => Err(self.raise(
                "InvalidOperation",
                &format!("no method '{}' on {}", name, recv.kind()),
            )),
        };

        let v = result?;
        self.push(v)?;
        Ok(())
    }

    fn instantiate(&mut self, class_id: ClassId) -> Handle {
        // Parent fields first, subclass defaults override.
        let mut chain = Vec::new();
        let mut cur = Some(class_id);
        while let Some(id) = cur {
            chain.push(id);
            cur = self.classes[id as usize].parent;
        }
        let mut inst = Instance::new(class_id);
        for id in chain.into_iter().rev() {
            let props: Vec<(String, Const)> = self.classes[id as usize]
                .props
                .iter()
                .filter(|p| !p.is_static)
                .map(|p| (p.name.clone(), p.default.clone()))
                .collect();
            for (name, default) in props {
                let v = self.const_value(&default);
                inst.fields.insert(name, v);
            }
        }
        self.note_alloc_site();
        self.heap.alloc_instance(inst)
    }

    fn get_static(&mut self, class_name: &str, member: &str) -> Result<Value, Signal> {
        let Some(&class_id) = self.class_by_name.get(class_name) else {
            // Enum access through GetStatic: resolved at compile time for
            // direct names; dynamic paths land here.
            if let Some(e) = self.enums.iter().find(|e| e.name == class_name) {
                if let Some(c) = e.cases.get(member) {
                    let c = c.clone();
                    return Ok(self.const_value(&c));
                }
            }
            return Err(self.raise("InvalidOperation", &format!("unknown class '{}'", class_name)));
        };
        if let Some(c) = find_const(&self.classes, class_id, member) {
            let c = c.clone();
            return Ok(self.const_value(&c));
        }
        if let Some((owner, _)) = find_prop(&self.classes, class_id, member) {
            let key = (owner.id, member.to_string());
            if let Some(v) = self.statics.get(&key) {
                return Ok(*v);
            }
        }
        Err(self.raise(
            "InvalidOperation",
            &format!("{} has no static member '{}'", class_name, member),
        ))
    }

    // ── Indexing ─────────────────────────────────────────────────────────────

    fn index_get(&mut self) -> Result<(), Signal> {
        let index = self.stack.pop().expect("index");
        let container = self.stack.pop().expect("container");
        let v = match container {
            Value::Array(h) => {
                let Some(i) = index.as_int() else {
                    return Err(self.raise("ArgumentException", "array index must be int"));
                };
                let len = self.heap.array_len(h);
                if i < 0 || i as usize >= len {
                    return Err(self.raise(
                        "ArrayIndexOutOfBounds",
                        &format!("index {} out of bounds for length {}", i, len),
                    ));
                }
                self.heap.array_items(h)[i as usize]
            }
            Value::Bytes(h) => {
                let Some(i) = index.as_int() else {
                    return Err(self.raise("ArgumentException", "bytes index must be int"));
                };
                let bytes = self.heap.bytes_of(h);
                if i < 0 || i as usize >= bytes.len() {
                    return Err(self.raise(
                        "ArrayIndexOutOfBounds",
                        &format!("index {} out of bounds for length {}", i, bytes.len()),
                    ));
                }
                Value::Int(bytes[i as usize] as i64)
            }
            Value::Map(h) => {
                let key = self.entry_key(index)?;
                self.heap.map_entries(h).get(&key).copied().unwrap_or(Value::Null)
            }
            Value::Super(h) => {
                let key = self.entry_key(index)?;
                self.heap.super_of(h).get(&key).copied().unwrap_or(Value::Null)
            }
            Value::Null => return Err(self.raise("NullReference", "indexing null")),
            other => {
                return Err(self.raise("InvalidOperation", &format!("cannot index {}", other.kind())))
            }
        };
        self.push(v)
    }

    fn index_set(&mut self) -> Result<(), Signal> {
        let value = self.stack.pop().expect("value");
        let index = self.stack.pop().expect("index");
        let container = self.stack.pop().expect("container");
        match container {
            Value::Array(h) => {
                let Some(i) = index.as_int() else {
                    return Err(self.raise("ArgumentException", "array index must be int"));
                };
                let len = self.heap.array_len(h);
                if i < 0 || i as usize >= len {
                    return Err(self.raise(
                        "ArrayIndexOutOfBounds",
                        &format!("index {} out of bounds for length {}", i, len),
                    ));
                }
                self.heap.array_items_mut(h)[i as usize] = value;
                self.heap.write_barrier(h, value);
            }
            Value::Bytes(h) => {
                let Some(i) = index.as_int() else {
                    return Err(self.raise("ArgumentException", "bytes index must be int"));
                };
                let Some(b) = value.as_int() else {
                    return Err(self.raise("ArgumentException", "bytes store expects int"));
                };
                match self.heap.payload_mut(h) {
                    ObjPayload::Bytes(bytes) => {
                        if i < 0 || i as usize >= bytes.len() {
                            let len = bytes.len();
                            return Err(self.raise(
                                "ArrayIndexOutOfBounds",
                                &format!("index {} out of bounds for length {}", i, len),
                            ));
                        }
                        bytes[i as usize] = b as u8;
                    }
                    _ => unreachable!("bytes handle"),
                }
            }
            Value::Map(h) => {
                let key = self.entry_key(index)?;
                self.heap.map_entries_mut(h).insert(key, value);
                self.heap.write_barrier(h, value);
            }
            Value::Super(h) => {
                let key = self.entry_key(index)?;
                self.heap.super_of_mut(h).set(key, value);
                self.heap.write_barrier(h, value);
            }
            Value::Null => return Err(self.raise("NullReference", "indexing null")),
            other => {
                return Err(self.raise("InvalidOperation", &format!("cannot index {}", other.kind())))
            }
        }
        Ok(())
    }

    fn entry_key(&mut self, v: Value) -> Result<EntryKey, Signal> {
        match v {
            Value::Int(n) => Ok(EntryKey::Int(n)),
            Value::Str(h) => Ok(EntryKey::Str(self.heap.str_of(h).into())),
            other => Err(self.raise(
                "ArgumentException",
                &format!("keys must be int or string, got {}", other.kind()),
            )),
        }
    }

    // ── Arithmetic ───────────────────────────────────────────────────────────

    fn binary_arith(&mut self, kind: BinKind) -> Result<(), Signal> {
        let b = self.stack.pop().expect("rhs");
        let a = self.stack.pop().expect("lhs");
        let out = match (a, b) {
            (Value::Int(x), Value::Int(y)) => match kind {
                BinKind::Add => Value::Int(x.wrapping_add(y)),
                BinKind::Sub => Value::Int(x.wrapping_sub(y)),
                BinKind::Mul => Value::Int(x.wrapping_mul(y)),
                BinKind::Div => {
                    if y == 0 {
                        return Err(self.raise("DivideByZero", "integer division by zero"));
                    }
                    Value::Int(x.wrapping_div(y))
                }
                BinKind::Mod => {
                    if y == 0 {
                        return Err(self.raise("DivideByZero", "integer modulo by zero"));
                    }
                    Value::Int(x.wrapping_rem(y))
                }
            },
            (Value::Float(x), Value::Float(y)) => match kind {
                BinKind::Add => Value::Float(x + y),
                BinKind::Sub => Value::Float(x - y),
                BinKind::Mul => Value::Float(x * y),
                BinKind::Div => Value::Float(x / y),
                BinKind::Mod => Value::Float(x % y),
            },
            (Value::Str(x), Value::Str(y)) if matches!(kind, BinKind::Add) => {
                let mut s = self.heap.str_of(x).to_string();
                s.push_str(self.heap.str_of(y));
                self.note_alloc_site();
                Value::Str(self.heap.alloc_string(&s))
            }
            (x, y) => {
                return Err(self.raise(
                    "InvalidOperation",
                    &format!("arithmetic between {} and {}", x.kind(), y.kind()),
                ))
            }
        };
        self.push(out)
    }

    // ── Types ────────────────────────────────────────────────────────────────

    fn check_type(&self, v: &Value, tag: &TypeTag) -> bool {
        match tag {
            TypeTag::Any => true,
            TypeTag::Int => matches!(v, Value::Int(_)),
            TypeTag::Float => matches!(v, Value::Float(_)),
            TypeTag::Bool => matches!(v, Value::Bool(_)),
            TypeTag::Str => matches!(v, Value::Str(_)),
            TypeTag::Bytes => matches!(v, Value::Bytes(_)),
            TypeTag::Null => matches!(v, Value::Null),
            TypeTag::Array(_) => matches!(v, Value::Array(_)),
            TypeTag::Map(_, _) => matches!(v, Value::Map(_)),
            TypeTag::SuperArray => matches!(v, Value::Super(_)),
            TypeTag::Function => matches!(v, Value::Function(_) | Value::Closure(_)),
            TypeTag::Nullable(inner) => matches!(v, Value::Null) || self.check_type(v, inner),
            TypeTag::Class(name) => match v {
                Value::Object(h) | Value::Exception(h) => {
                    is_instance_of(&self.classes, self.heap.instance_of(*h).class, name)
                }
                _ => false,
            },
        }
    }

    /// Runtime-checked conversion. `None` means the cast failed; CAST turns
    /// that into InvalidCast, CAST_SAFE into null. Casting to the value's
    /// own type is the identity, so `(x as T) as T == x as T`.
    fn cast(&mut self, v: Value, tag: &TypeTag) -> Option<Value> {
        if self.check_type(&v, tag) {
            return Some(v);
        }
        match (v, tag) {
            (Value::Int(n), TypeTag::Float) => Some(Value::Float(n as f64)),
            (Value::Float(f), TypeTag::Int) => Some(Value::Int(f as i64)),
            (Value::Int(n), TypeTag::Str) => {
                let h = self.heap.alloc_string(&n.to_string());
                Some(Value::Str(h))
            }
            (Value::Float(f), TypeTag::Str) => {
                let s = Value::Float(f).render(&self.heap);
                let h = self.heap.alloc_string(&s);
                Some(Value::Str(h))
            }
            (Value::Bool(b), TypeTag::Str) => {
                let h = self.heap.alloc_string(if b { "true" } else { "false" });
                Some(Value::Str(h))
            }
            (Value::Str(h), TypeTag::Int) => self.heap.str_of(h).trim().parse::<i64>().ok().map(Value::Int),
            (Value::Str(h), TypeTag::Float) => {
                self.heap.str_of(h).trim().parse::<f64>().ok().map(Value::Float)
            }
            (v, TypeTag::Nullable(inner)) => self.cast(v, inner),
            _ => None,
        }
    }

    // ── Stack / output plumbing ──────────────────────────────────────────────

    fn push(&mut self, v: Value) -> Result<(), Signal> {
        if self.stack.len() >= self.config.stack_cap {
            return Err(Signal::Fatal(FatalError::OperandOverflow { cap: self.config.stack_cap }));
        }
        self.stack.push(v);
        Ok(())
    }

    pub(crate) fn write_out(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.wrote_any = true;
        self.last_byte = *bytes.last().expect("non-empty");
        let _ = self.out.write_all(bytes);
    }

    fn note_alloc_site(&mut self) {
        if self.config.gc_debug {
            let name = self
                .frames
                .last()
                .map(|f| self.functions[f.func as usize].name.clone())
                .unwrap_or_default();
            let line = self.current_line();
            self.heap.note_site(&name, line);
        }
    }
}

#[derive(Clone, Copy)]
enum BinKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Infer a coarse element tag from a runtime value (array literals).
fn value_tag(v: &Value) -> TypeTag {
    match v {
        Value::Int(_) => TypeTag::Int,
        Value::Float(_) => TypeTag::Float,
        Value::Bool(_) => TypeTag::Bool,
        Value::Str(_) => TypeTag::Str,
        Value::Bytes(_) => TypeTag::Bytes,
        Value::Array(_) => TypeTag::Array(Box::new(TypeTag::Any)),
        Value::Map(_) => TypeTag::Map(Box::new(TypeTag::Any), Box::new(TypeTag::Any)),
        Value::Super(_) => TypeTag::SuperArray,
        _ => TypeTag::Any,
    }
}

/// Shift the function-id operands of closure construction when a program is
/// installed after the builtin functions.
fn remap_chunk(chunk: &mut crate::bytecode::Chunk, func_off: u16) {
    for op in &mut chunk.code {
        if let Op::MakeClosure { func, .. } = op {
            *func += func_off;
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline helpers (used by the CLI and tests)
// ---------------------------------------------------------------------------

/// Compile source through the full front-end; returns the program or the
/// collected diagnostics.
pub fn compile_source(source: &str) -> Result<Program, crate::errors::Diagnostics> {
    let mut diagnostics = crate::errors::Diagnostics::new();
    let (file, lex_errors, parse_errors) = crate::parser::parse_source(source, 0);
    for e in &lex_errors {
        diagnostics.push_lex(e);
    }
    for e in &parse_errors {
        diagnostics.push_parse(e);
    }
    if diagnostics.has_errors() {
        return Err(diagnostics);
    }

    let outcome = crate::checker::Checker::new().check_file(&file);
    diagnostics.extend(outcome.diagnostics);
    if diagnostics.has_errors() {
        return Err(diagnostics);
    }

    match crate::compiler::compile(&[file]) {
        Ok(program) => {
            if let Err(e) = crate::verifier::verify_program(&program.functions) {
                diagnostics.error("VerificationError", e.to_string(), crate::errors::Span::default());
                return Err(diagnostics);
            }
            Ok(program)
        }
        Err(errors) => {
            for e in errors {
                diagnostics.error("CompileError", e.to_string(), e.span());
            }
            Err(diagnostics)
        }
    }
}

/// Compile and run a source string, capturing output. Test entry point.
pub fn run_source(source: &str, config: VmConfig) -> Result<String, String> {
    let program = compile_source(source).map_err(|diags| {
        diags.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("\n")
    })?;
    let sink = BufferSink::new();
    let mut vm = Vm::with_output(config, Box::new(sink.clone()));
    vm.install(program);
    vm.run().map_err(|e| e.to_string())?;
    Ok(sink.contents())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> String {
        run_source(src, VmConfig::default()).unwrap_or_else(|e| panic!("run failed: {}\n{}", e, src))
    }

    fn run_err(src: &str) -> String {
        run_source(src, VmConfig::default()).expect_err("expected failure")
    }

    #[test]
    fn arithmetic_and_echo() {
        assert_eq!(run("echo 1 + 2;"), "3\n");
    }

    #[test]
    fn locals_and_loops() {
        assert_eq!(
            run("int $s = 0; for (int $i = 0; $i < 10; $i++) { $s = $s + $i; } echo $s;"),
            "45\n"
        );
    }

    #[test]
    fn function_calls_and_recursion() {
        let src = "function fib(int $n): int { if ($n < 2) { return $n; } return fib($n-1) + fib($n-2); } echo fib(10);";
        assert_eq!(run(src), "55\n");
    }

    #[test]
    fn exceptions_with_finally() {
        let src = r#"try { throw new Exception("x"); } catch (Exception $e) { echo $e->getMessage(); } finally { echo "|end"; }"#;
        assert_eq!(run(src), "x|end\n");
    }

    #[test]
    fn foreach_over_array() {
        let src = r#"$a := [1,2,3]; foreach ($a as $k => $v) { echo $k; echo ":"; echo $v; echo "\n"; }"#;
        assert_eq!(run(src), "0:1\n1:2\n2:3\n");
    }

    #[test]
    fn match_expressions() {
        let src = r#"$m := match (3) { 1 => "a", 2 => "b", _ => "c" }; echo $m; echo (match (5) { int $n if $n > 0 => "+", _ => "-" });"#;
        assert_eq!(run(src), "c+\n");
    }

    #[test]
    fn division_by_zero_is_catchable() {
        let src = r#"
            try { echo 1 / 0; } catch (DivideByZero $e) { echo "caught"; }
        "#;
        assert_eq!(run(src), "caught\n");
    }

    #[test]
    fn array_out_of_bounds() {
        let src = r#"
            $a := [1,2,3];
            try { echo $a[3]; } catch (ArrayIndexOutOfBounds $e) { echo "oob"; }
        "#;
        assert_eq!(run(src), "oob\n");
    }

    #[test]
    fn stack_overflow_is_fatal_not_catchable() {
        let src = r#"
            function spin(int $n): int { return 1 + spin($n + 1); }
            try { echo spin(0); } catch (Exception $e) { echo "caught"; }
        "#;
        let err = run_err(src);
        assert!(err.contains("stack overflow"), "got: {}", err);
    }

    #[test]
    fn instruction_cap_aborts() {
        let mut config = VmConfig::default();
        config.instruction_cap = 10_000;
        let err = run_source("while (true) { }", config).expect_err("must hit cap");
        assert!(err.contains("instruction cap"), "got: {}", err);
    }

    #[test]
    fn classes_and_methods() {
        let src = r#"
            class Counter {
                private int $n = 0;
                public function bump(): int { $this->n = $this->n + 1; return $this->n; }
            }
            $c := new Counter();
            $c->bump();
            echo $c->bump();
        "#;
        assert_eq!(run(src), "2\n");
    }

    #[test]
    fn inheritance_and_dispatch() {
        let src = r#"
            class Animal {
                public function speak(): string { return "..."; }
                public function describe(): string { return $this->speak(); }
            }
            class Dog extends Animal {
                public function speak(): string { return "woof"; }
            }
            $d := new Dog();
            echo $d->describe();
        "#;
        assert_eq!(run(src), "woof\n");
    }

    #[test]
    fn constructors_and_defaults() {
        let src = r#"
            class Point {
                public int $x = 0;
                public int $y = 0;
                public function constructor(int $x, int $y = 7) { $this->x = $x; $this->y = $y; }
            }
            $p := new Point(3);
            echo $p->x; echo ","; echo $p->y;
        "#;
        assert_eq!(run(src), "3,7\n");
    }

    #[test]
    fn closures_capture_by_value() {
        let src = r#"
            int $a = 5;
            $f := function (int $x) use ($a): int { return $x + $a; };
            $a = 100;
            echo $f(1);
        "#;
        assert_eq!(run(src), "6\n");
    }

    #[test]
    fn arrow_functions_auto_capture() {
        let src = r#"
            int $base = 10;
            $add := (int $x) => $x + $base;
            echo $add(5);
        "#;
        assert_eq!(run(src), "15\n");
    }

    #[test]
    fn variadic_packing() {
        let src = r#"
            function total(int ...$xs): int {
                int $s = 0;
                foreach ($xs as $x) { $s = $s + $x; }
                return $s;
            }
            echo total(1, 2, 3, 4);
        "#;
        assert_eq!(run(src), "10\n");
    }

    #[test]
    fn multi_value_returns() {
        let src = r#"
            function divmod(int $a, int $b): (int, int) { return $a / $b, $a % $b; }
            int $q, int $r = divmod(7, 2);
            echo $q; echo ":"; echo $r;
        "#;
        assert_eq!(run(src), "3:1\n");
    }

    #[test]
    fn super_array_mixed_keys() {
        let src = r#"
            $s := { 10, "name": "x", 20 };
            echo $s[0]; echo $s["name"]; echo $s[1];
        "#;
        assert_eq!(run(src), "10x20\n");
    }

    #[test]
    fn map_preserves_insertion_order() {
        let src = r#"
            $m := map[string]int{"b": 2, "a": 1};
            foreach ($m as $k => $v) { echo $k; echo $v; }
        "#;
        assert_eq!(run(src), "b2a1\n");
    }

    #[test]
    fn string_interpolation() {
        let src = r#"
            int $x = 42;
            echo #"value is {$x}!";
        "#;
        assert_eq!(run(src), "value is 42!\n");
    }

    #[test]
    fn cast_and_cast_safe() {
        assert_eq!(run("echo (1 as float) + 0.5;"), "1.5\n");
        assert_eq!(run(r#"echo "12" as int;"#), "12\n");
        assert_eq!(run(r#"$v := "abc" as? int; echo $v == null ? "null" : "num";"#), "null\n");
    }

    #[test]
    fn cast_is_idempotent() {
        assert_eq!(run("echo (3 as float) as float;"), "3.0\n");
    }

    #[test]
    fn invalid_cast_raises() {
        let src = r#"
            try { $x := "abc" as int; echo $x; } catch (InvalidCast $e) { echo "bad"; }
        "#;
        assert_eq!(run(src), "bad\n");
    }

    #[test]
    fn interfaces_dispatch_through_vtable() {
        let src = r#"
            interface Shape { function area(): int; }
            class Square implements Shape {
                public int $side = 0;
                public function constructor(int $s) { $this->side = $s; }
                public function area(): int { return $this->side * $this->side; }
            }
            $s := new Square(4);
            echo $s->area();
        "#;
        assert_eq!(run(src), "16\n");
    }

    #[test]
    fn static_members() {
        let src = r#"
            class Config {
                public static int $count = 0;
                const int MAX = 10;
                public static function bump(): int {
                    Config::$count = Config::$count + 1;
                    return Config::$count;
                }
            }
            Config::bump();
            echo Config::bump(); echo "/"; echo Config::MAX;
        "#;
        assert_eq!(run(src), "2/10\n");
    }

    #[test]
    fn rethrow_preserves_trace() {
        let src = r#"
            function inner(): int { throw new Exception("boom"); }
            function outer(): int {
                try { return inner(); }
                catch (Exception $e) { throw $e; }
            }
            try { outer(); } catch (Exception $e) {
                $t := $e->getTrace();
                echo $t->length() > 1 ? "deep" : "shallow";
            }
        "#;
        assert_eq!(run(src), "deep\n");
    }

    #[test]
    fn finally_runs_on_return() {
        let src = r#"
            function f(): int {
                try { return 1; } finally { echo "fin|"; }
            }
            echo f();
        "#;
        assert_eq!(run(src), "fin|1\n");
    }

    #[test]
    fn finally_runs_on_break() {
        let src = r#"
            while (true) {
                try { break; } finally { echo "fin"; }
            }
            echo "|done";
        "#;
        assert_eq!(run(src), "fin|done\n");
    }

    #[test]
    fn uncaught_exception_reports_class_and_trace() {
        let err = run_err(r#"throw new Exception("nope");"#);
        assert!(err.contains("Exception"), "got: {}", err);
        assert!(err.contains("nope"), "got: {}", err);
    }

    #[test]
    fn switch_statement_fallthrough_and_break() {
        let src = r#"
            switch (2) {
                case 1: echo "one"; break;
                case 2: echo "two";
                case 3: echo "three"; break;
                default: echo "other";
            }
        "#;
        assert_eq!(run(src), "twothree\n");
    }

    #[test]
    fn elvis_operator() {
        assert_eq!(run(r#"echo "" ?: "fallback";"#), "fallback\n");
        assert_eq!(run(r#"echo "val" ?: "fallback";"#), "val\n");
    }

    #[test]
    fn enum_cases_are_scalars() {
        let src = r#"
            enum Color: int { Red = 1, Green, Blue }
            echo Color::Green;
        "#;
        assert_eq!(run(src), "2\n");
    }

    #[test]
    fn identical_runs_produce_identical_output() {
        let src = "function fib(int $n): int { if ($n < 2) { return $n; } return fib($n-1) + fib($n-2); } echo fib(15);";
        let a = run_source(src, VmConfig::default()).expect("first run");
        let b = run_source(src, VmConfig::default()).expect("second run");
        assert_eq!(a, b);
    }

    #[test]
    fn gc_pressure_during_execution() {
        // Allocate enough garbage to force several collections with the
        // tiny test thresholds; the live list must survive.
        let src = r#"
            $keep := [];
            for (int $i = 0; $i < 200; $i++) {
                $tmp := #"garbage {$i}";
                if ($i % 50 == 0) { $keep->push($tmp); }
            }
            echo $keep->length();
        "#;
        assert_eq!(
            run_source(src, VmConfig::for_tests()).expect("runs under gc pressure"),
            "4\n"
        );
    }
}
