/// Built-in host functions and classes.
///
/// Everything here is registered once at VM construction: the Exception
/// class hierarchy with its native methods, the reflection surface, the GC
/// control functions, and a handful of core helpers. Host functions follow
/// the native ABI — values in, one value out, an exception-kind value
/// signalling a throw — and never retain the argument slice.

use once_cell::sync::Lazy;

use crate::bytecode::{Const, TypeTag};
use crate::core::object::{find_prop, Class, EntryKey, Instance, PropDef, SuperArray};
use crate::core::value::Value;
use crate::vm::{NativeDef, Vm};

/// Exception kinds the runtime itself raises; all extend `Exception`.
pub const BUILTIN_EXCEPTIONS: &[&str] = &[
    "NullReference",
    "DivideByZero",
    "ArrayIndexOutOfBounds",
    "InvalidCast",
    "FormatException",
    "ArgumentException",
    "InvalidOperation",
    "IO",
    "Argument",
];

static NATIVE_NAMES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "to_string",
        "length",
        "type_of",
        "print",
        "println",
        "get_class",
        "get_class_annotations",
        "get_method_annotations",
        "has_annotation",
        "get_property",
        "set_property",
        "get_properties",
        "get_property_annotations",
        "new_instance",
        "gc_collect",
        "gc_enable",
        "gc_disable",
        "gc_stats",
        "gc_set_threshold",
        "gc_leak_report",
    ]
});

pub fn is_native(name: &str) -> bool {
    NATIVE_NAMES.iter().any(|n| *n == name)
}

pub fn is_builtin_exception(name: &str) -> bool {
    name == "Exception" || BUILTIN_EXCEPTIONS.iter().any(|n| *n == name)
}

pub fn install_builtins(vm: &mut Vm) {
    install_exception_classes(vm);
    install_core(vm);
    install_reflection(vm);
    install_gc_control(vm);
}

// ---------------------------------------------------------------------------
// Exception classes
// ---------------------------------------------------------------------------

fn install_exception_classes(vm: &mut Vm) {
    let base = vm.register_class(Class {
        name: "Exception".into(),
        props: vec![PropDef {
            name: "message".into(),
            ty: TypeTag::Str,
            default: Const::Str(String::new()),
            is_static: false,
            visibility: crate::ast::Visibility::Public,
            annotations: vec![],
        }],
        ..Class::default()
    });

    vm.register_native_method(
        base,
        "constructor",
        NativeDef { name: "Exception::constructor", func: exception_constructor, min_arity: 0, arity: 2 },
    );
    vm.register_native_method(
        base,
        "getMessage",
        NativeDef { name: "Exception::getMessage", func: exception_get_message, min_arity: 0, arity: 1 },
    );
    vm.register_native_method(
        base,
        "getTrace",
        NativeDef { name: "Exception::getTrace", func: exception_get_trace, min_arity: 0, arity: 1 },
    );

    for kind in BUILTIN_EXCEPTIONS {
        vm.register_class(Class {
            name: (*kind).to_string(),
            parent_name: Some("Exception".into()),
            parent: Some(base),
            ..Class::default()
        });
    }
}

fn exception_constructor(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(Value::Object(h) | Value::Exception(h)) = args.first().copied() else {
        return vm.make_exception("ArgumentException", "constructor needs a receiver");
    };
    let message = match args.get(1) {
        Some(v) => v.render(&vm.heap),
        None => String::new(),
    };
    let msg = vm.heap.alloc_string(&message);
    vm.heap.instance_of_mut(h).fields.insert("message".into(), Value::Str(msg));
    vm.heap.write_barrier(h, Value::Str(msg));
    Value::Null
}

fn exception_get_message(vm: &mut Vm, args: &[Value]) -> Value {
    match args.first() {
        Some(Value::Object(h) | Value::Exception(h)) => {
            vm.heap.instance_of(*h).fields.get("message").copied().unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn exception_get_trace(vm: &mut Vm, args: &[Value]) -> Value {
    let trace = match args.first() {
        Some(Value::Object(h) | Value::Exception(h)) => {
            vm.heap.instance_of(*h).trace.clone().unwrap_or_default()
        }
        _ => Vec::new(),
    };
    let mut items = Vec::with_capacity(trace.len());
    for frame in trace {
        let line = format!("{} (line {})", frame.function, frame.line);
        let h = vm.heap.alloc_string(&line);
        items.push(Value::Str(h));
    }
    Value::Array(vm.heap.alloc_array(TypeTag::Str, items))
}

// ---------------------------------------------------------------------------
// Core helpers
// ---------------------------------------------------------------------------

fn install_core(vm: &mut Vm) {
    vm.register_native(NativeDef { name: "to_string", func: native_to_string, min_arity: 1, arity: 1 });
    vm.register_native(NativeDef { name: "length", func: native_length, min_arity: 1, arity: 1 });
    vm.register_native(NativeDef { name: "type_of", func: native_type_of, min_arity: 1, arity: 1 });
    vm.register_native(NativeDef { name: "print", func: native_print, min_arity: 1, arity: 1 });
    vm.register_native(NativeDef { name: "println", func: native_println, min_arity: 0, arity: 1 });
}

fn native_to_string(vm: &mut Vm, args: &[Value]) -> Value {
    let s = args[0].render(&vm.heap);
    Value::Str(vm.heap.alloc_string(&s))
}

fn native_length(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0] {
        Value::Str(h) => Value::Int(vm.heap.str_of(h).chars().count() as i64),
        Value::Bytes(h) => Value::Int(vm.heap.bytes_of(h).len() as i64),
        Value::Array(h) => Value::Int(vm.heap.array_len(h) as i64),
        Value::Map(h) => Value::Int(vm.heap.map_len(h) as i64),
        Value::Super(h) => Value::Int(vm.heap.super_len(h) as i64),
        other => vm.make_exception(
            "ArgumentException",
            &format!("length() does not apply to {}", other.kind()),
        ),
    }
}

fn native_type_of(vm: &mut Vm, args: &[Value]) -> Value {
    let kind = args[0].kind();
    Value::Str(vm.heap.alloc_string(kind))
}

fn native_print(vm: &mut Vm, args: &[Value]) -> Value {
    let s = args[0].render(&vm.heap);
    vm.write_out(s.as_bytes());
    Value::Null
}

fn native_println(vm: &mut Vm, args: &[Value]) -> Value {
    let mut s = args.first().map(|v| v.render(&vm.heap)).unwrap_or_default();
    s.push('\n');
    vm.write_out(s.as_bytes());
    Value::Null
}

// ---------------------------------------------------------------------------
// Reflection
// ---------------------------------------------------------------------------

fn install_reflection(vm: &mut Vm) {
    vm.register_native(NativeDef { name: "get_class", func: refl_get_class, min_arity: 1, arity: 1 });
    vm.register_native(NativeDef {
        name: "get_class_annotations",
        func: refl_class_annotations,
        min_arity: 1,
        arity: 1,
    });
    vm.register_native(NativeDef {
        name: "get_method_annotations",
        func: refl_method_annotations,
        min_arity: 2,
        arity: 2,
    });
    vm.register_native(NativeDef { name: "has_annotation", func: refl_has_annotation, min_arity: 2, arity: 2 });
    vm.register_native(NativeDef { name: "get_property", func: refl_get_property, min_arity: 2, arity: 2 });
    vm.register_native(NativeDef { name: "set_property", func: refl_set_property, min_arity: 3, arity: 3 });
    vm.register_native(NativeDef { name: "get_properties", func: refl_get_properties, min_arity: 1, arity: 1 });
    vm.register_native(NativeDef {
        name: "get_property_annotations",
        func: refl_property_annotations,
        min_arity: 2,
        arity: 2,
    });
    vm.register_native(NativeDef { name: "new_instance", func: refl_new_instance, min_arity: 1, arity: 1 });
}

/// Accepts a class name string or any object and yields the class id.
fn resolve_class(vm: &Vm, v: &Value) -> Option<u16> {
    match v {
        Value::Str(h) => {
            let name = vm.heap.str_of(*h);
            vm.class_by_name.get(name).copied()
        }
        Value::Object(h) | Value::Exception(h) => Some(vm.heap.instance_of(*h).class),
        Value::Class(id) => Some(*id),
        _ => None,
    }
}

fn string_array(vm: &mut Vm, items: Vec<String>) -> Value {
    let mut out = Vec::with_capacity(items.len());
    for s in items {
        let h = vm.heap.alloc_string(&s);
        out.push(Value::Str(h));
    }
    Value::Array(vm.heap.alloc_array(TypeTag::Str, out))
}

fn refl_get_class(vm: &mut Vm, args: &[Value]) -> Value {
    match resolve_class(vm, &args[0]) {
        Some(id) => {
            let name = vm.classes[id as usize].name.clone();
            Value::Str(vm.heap.alloc_string(&name))
        }
        None => vm.make_exception("ArgumentException", "get_class expects an object or class name"),
    }
}

fn refl_class_annotations(vm: &mut Vm, args: &[Value]) -> Value {
    match resolve_class(vm, &args[0]) {
        Some(id) => {
            let names: Vec<String> =
                vm.classes[id as usize].annotations.iter().map(|a| a.name.clone()).collect();
            string_array(vm, names)
        }
        None => vm.make_exception("ArgumentException", "unknown class"),
    }
}

fn refl_method_annotations(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(id) = resolve_class(vm, &args[0]) else {
        return vm.make_exception("ArgumentException", "unknown class");
    };
    let Value::Str(mh) = args[1] else {
        return vm.make_exception("ArgumentException", "method name must be a string");
    };
    let method = vm.heap.str_of(mh).to_string();
    let names: Vec<String> = vm.classes[id as usize]
        .method_annotations
        .get(&method)
        .map(|anns| anns.iter().map(|a| a.name.clone()).collect())
        .unwrap_or_default();
    string_array(vm, names)
}

fn refl_has_annotation(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(id) = resolve_class(vm, &args[0]) else {
        return vm.make_exception("ArgumentException", "unknown class");
    };
    let Value::Str(ah) = args[1] else {
        return vm.make_exception("ArgumentException", "annotation name must be a string");
    };
    let ann = vm.heap.str_of(ah);
    let class = &vm.classes[id as usize];
    let found = class.annotations.iter().any(|a| a.name == ann)
        || class.method_annotations.values().flatten().any(|a| a.name == ann)
        || class.props.iter().flat_map(|p| &p.annotations).any(|a| a.name == ann);
    Value::Bool(found)
}

fn refl_get_property(vm: &mut Vm, args: &[Value]) -> Value {
    let (Value::Object(h) | Value::Exception(h)) = args[0] else {
        return vm.make_exception("ArgumentException", "get_property expects an object");
    };
    let Value::Str(nh) = args[1] else {
        return vm.make_exception("ArgumentException", "property name must be a string");
    };
    let name = vm.heap.str_of(nh).to_string();
    vm.heap.instance_of(h).fields.get(&name).copied().unwrap_or(Value::Null)
}

fn refl_set_property(vm: &mut Vm, args: &[Value]) -> Value {
    let (Value::Object(h) | Value::Exception(h)) = args[0] else {
        return vm.make_exception("ArgumentException", "set_property expects an object");
    };
    let Value::Str(nh) = args[1] else {
        return vm.make_exception("ArgumentException", "property name must be a string");
    };
    let name = vm.heap.str_of(nh).to_string();
    let value = args[2];
    vm.heap.instance_of_mut(h).fields.insert(name, value);
    vm.heap.write_barrier(h, value);
    Value::Null
}

fn refl_get_properties(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0] {
        Value::Object(h) | Value::Exception(h) => {
            let names: Vec<String> = vm.heap.instance_of(h).fields.keys().cloned().collect();
            string_array(vm, names)
        }
        ref other => match resolve_class(vm, other) {
            Some(id) => {
                let names: Vec<String> =
                    vm.classes[id as usize].props.iter().map(|p| p.name.clone()).collect();
                string_array(vm, names)
            }
            None => vm.make_exception("ArgumentException", "get_properties expects an object or class"),
        },
    }
}

fn refl_property_annotations(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(id) = resolve_class(vm, &args[0]) else {
        return vm.make_exception("ArgumentException", "unknown class");
    };
    let Value::Str(nh) = args[1] else {
        return vm.make_exception("ArgumentException", "property name must be a string");
    };
    let prop = vm.heap.str_of(nh).to_string();
    let names: Vec<String> = find_prop(&vm.classes, id, &prop)
        .map(|(_, p)| p.annotations.iter().map(|a| a.name.clone()).collect())
        .unwrap_or_default();
    string_array(vm, names)
}

fn refl_new_instance(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(id) = resolve_class(vm, &args[0]) else {
        return vm.make_exception("ArgumentException", "unknown class");
    };
    if vm.classes[id as usize].is_abstract {
        let name = vm.classes[id as usize].name.clone();
        return vm.make_exception("InvalidOperation", &format!("cannot instantiate abstract class '{}'", name));
    }
    // Field defaults only; constructors are the caller's business.
    let mut inst = Instance::new(id);
    let mut cur = Some(id);
    let mut chain = Vec::new();
    while let Some(c) = cur {
        chain.push(c);
        cur = vm.classes[c as usize].parent;
    }
    for c in chain.into_iter().rev() {
        let props: Vec<(String, Const)> = vm.classes[c as usize]
            .props
            .iter()
            .filter(|p| !p.is_static)
            .map(|p| (p.name.clone(), p.default.clone()))
            .collect();
        for (name, default) in props {
            let v = vm.const_value(&default);
            inst.fields.insert(name, v);
        }
    }
    Value::Object(vm.heap.alloc_instance(inst))
}

// ---------------------------------------------------------------------------
// GC control
// ---------------------------------------------------------------------------

fn install_gc_control(vm: &mut Vm) {
    vm.register_native(NativeDef { name: "gc_collect", func: gc_collect, min_arity: 0, arity: 0 });
    vm.register_native(NativeDef { name: "gc_enable", func: gc_enable, min_arity: 0, arity: 0 });
    vm.register_native(NativeDef { name: "gc_disable", func: gc_disable, min_arity: 0, arity: 0 });
    vm.register_native(NativeDef { name: "gc_stats", func: gc_stats, min_arity: 0, arity: 0 });
    vm.register_native(NativeDef { name: "gc_set_threshold", func: gc_set_threshold, min_arity: 1, arity: 1 });
    vm.register_native(NativeDef { name: "gc_leak_report", func: gc_leak_report, min_arity: 0, arity: 0 });
}

fn gc_collect(vm: &mut Vm, _args: &[Value]) -> Value {
    vm.gc_collect_now();
    Value::Null
}

fn gc_enable(vm: &mut Vm, _args: &[Value]) -> Value {
    vm.heap.set_enabled(true);
    Value::Null
}

fn gc_disable(vm: &mut Vm, _args: &[Value]) -> Value {
    vm.heap.set_enabled(false);
    Value::Null
}

fn gc_stats(vm: &mut Vm, _args: &[Value]) -> Value {
    let stats = vm.heap.stats();
    let mut sa = SuperArray::new();
    sa.set(EntryKey::Str("heap_size".into()), Value::Int(stats.heap_size as i64));
    sa.set(EntryKey::Str("total_allocations".into()), Value::Int(stats.total_allocations as i64));
    sa.set(EntryKey::Str("total_collections".into()), Value::Int(stats.total_collections as i64));
    sa.set(EntryKey::Str("total_freed".into()), Value::Int(stats.total_freed as i64));
    sa.set(EntryKey::Str("next_threshold".into()), Value::Int(stats.next_threshold as i64));
    Value::Super(vm.heap.alloc_super(sa))
}

fn gc_set_threshold(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0] {
        Value::Int(n) if n > 0 => {
            vm.heap.set_threshold(n as usize);
            Value::Null
        }
        _ => vm.make_exception("ArgumentException", "gc_set_threshold expects a positive int"),
    }
}

fn gc_leak_report(vm: &mut Vm, _args: &[Value]) -> Value {
    let report = vm.heap.leak_report();
    let lines: Vec<String> = report.into_iter().map(|(site, n)| format!("{} x{}", site, n)).collect();
    string_array(vm, lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::VmConfig;
    use crate::vm::run_source;

    fn run(src: &str) -> String {
        run_source(src, VmConfig::default()).unwrap_or_else(|e| panic!("run failed: {}\n{}", e, src))
    }

    #[test]
    fn native_registry_names() {
        assert!(is_native("gc_collect"));
        assert!(is_native("get_class"));
        assert!(!is_native("definitely_not_native"));
    }

    #[test]
    fn builtin_exception_names() {
        assert!(is_builtin_exception("Exception"));
        assert!(is_builtin_exception("DivideByZero"));
        assert!(!is_builtin_exception("ValueError"));
    }

    #[test]
    fn reflection_get_class() {
        let src = r#"
            class Widget {}
            $w := new Widget();
            echo get_class($w);
        "#;
        assert_eq!(run(src), "Widget\n");
    }

    #[test]
    fn reflection_annotations() {
        let src = r#"
            @Entity
            @Table("widgets")
            class Widget {
                @Column int $id = 0;
            }
            echo has_annotation("Widget", "Entity") ? "yes" : "no";
            echo length(get_class_annotations("Widget"));
            echo length(get_property_annotations("Widget", "id"));
        "#;
        assert_eq!(run(src), "yes21\n");
    }

    #[test]
    fn reflection_properties() {
        let src = r#"
            class P { public int $x = 1; public int $y = 2; }
            $p := new P();
            set_property($p, "x", 9);
            echo get_property($p, "x");
            echo length(get_properties($p));
        "#;
        assert_eq!(run(src), "92\n");
    }

    #[test]
    fn reflection_new_instance() {
        let src = r#"
            class Blank { public int $n = 41; }
            $b := new_instance("Blank");
            echo get_property($b, "n");
        "#;
        assert_eq!(run(src), "41\n");
    }

    #[test]
    fn gc_stats_shape() {
        let src = r#"
            $s := gc_stats();
            echo $s->has("heap_size") ? "ok" : "missing";
        "#;
        assert_eq!(run(src), "ok\n");
    }

    #[test]
    fn gc_controls_are_callable() {
        let src = r#"
            gc_disable();
            gc_enable();
            gc_set_threshold(64);
            gc_collect();
            echo "done";
        "#;
        assert_eq!(run(src), "done\n");
    }

    #[test]
    fn core_helpers() {
        assert_eq!(run(r#"echo to_string(42);"#), "42\n");
        assert_eq!(run(r#"echo type_of(1.5);"#), "float\n");
        assert_eq!(run(r#"echo length("hello");"#), "5\n");
    }
}
