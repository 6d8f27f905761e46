/// Object model: classes, interfaces, enums, instances, closures, and the
/// super-array. Class metadata lives for the VM's lifetime; instances and
/// closures are heap payloads managed by the GC.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::ast::Visibility;
use crate::bytecode::{Const, Function, TypeTag};
use crate::core::value::{ClassId, FuncId, Value};

// ---------------------------------------------------------------------------
// Annotations (surfaced only through reflection)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationData {
    pub name: String,
    /// Annotation arguments are restricted to literals.
    pub args: Vec<Const>,
}

// ---------------------------------------------------------------------------
// Class metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PropDef {
    pub name: String,
    pub ty: TypeTag,
    pub default: Const,
    pub is_static: bool,
    pub visibility: Visibility,
    pub annotations: Vec<AnnotationData>,
}

#[derive(Debug, Clone, Default)]
pub struct Class {
    pub id: ClassId,
    pub name: String,
    pub parent_name: Option<String>,
    pub parent: Option<ClassId>,
    pub interfaces: Vec<String>,
    /// Ordered own properties (parents contribute theirs at instantiation).
    pub props: Vec<PropDef>,
    pub consts: IndexMap<String, Const>,
    /// Own methods by name; overloads are distinguished by arity through
    /// the function table.
    pub methods: HashMap<String, Vec<FuncId>>,
    /// Precomputed interface v-table: (method name, declared arity) -> impl.
    pub vtable: HashMap<(String, u8), FuncId>,
    pub annotations: Vec<AnnotationData>,
    pub method_annotations: HashMap<String, Vec<AnnotationData>>,
    pub is_abstract: bool,
    pub is_final: bool,
    pub doc: Option<String>,
}

impl Class {
    /// Own-table lookup by (name, supplied arg count).
    pub fn own_method(&self, functions: &[Function], name: &str, argc: usize) -> Option<FuncId> {
        self.methods
            .get(name)?
            .iter()
            .copied()
            .find(|id| functions[*id as usize].accepts(argc))
    }
}

/// Full dispatch: own method table, then the interface v-table, then the
/// parent chain. This is the one lookup the inline caches memoise.
pub fn find_method_with_vtable(
    classes: &[Class],
    functions: &[Function],
    class: ClassId,
    name: &str,
    argc: usize,
) -> Option<FuncId> {
    let mut cur = Some(class);
    while let Some(id) = cur {
        let c = &classes[id as usize];
        if let Some(m) = c.own_method(functions, name, argc) {
            return Some(m);
        }
        if let Some((_, m)) = c
            .vtable
            .iter()
            .find(|((n, _), m)| n == name && functions[**m as usize].accepts(argc))
        {
            return Some(*m);
        }
        cur = c.parent;
    }
    None
}

/// Constant lookup through the parent chain.
pub fn find_const<'a>(classes: &'a [Class], class: ClassId, name: &str) -> Option<&'a Const> {
    let mut cur = Some(class);
    while let Some(id) = cur {
        let c = &classes[id as usize];
        if let Some(k) = c.consts.get(name) {
            return Some(k);
        }
        cur = c.parent;
    }
    None
}

/// Property descriptor lookup through the parent chain.
pub fn find_prop<'a>(classes: &'a [Class], class: ClassId, name: &str) -> Option<(&'a Class, &'a PropDef)> {
    let mut cur = Some(class);
    while let Some(id) = cur {
        let c = &classes[id as usize];
        if let Some(p) = c.props.iter().find(|p| p.name == name) {
            return Some((c, p));
        }
        cur = c.parent;
    }
    None
}

/// Is `sub` equal to, derived from, or an implementor of `sup_name`?
pub fn is_instance_of(classes: &[Class], sub: ClassId, sup_name: &str) -> bool {
    let mut cur = Some(sub);
    while let Some(id) = cur {
        let c = &classes[id as usize];
        if c.name == sup_name || c.interfaces.iter().any(|i| i == sup_name) {
            return true;
        }
        cur = c.parent;
    }
    false
}

// ---------------------------------------------------------------------------
// Interfaces and enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Interface {
    pub name: String,
    pub extends: Vec<String>,
    /// (method name, min arity, declared arity)
    pub methods: Vec<(String, u8, u8)>,
    pub consts: IndexMap<String, Const>,
}

#[derive(Debug, Clone, Default)]
pub struct EnumDef {
    pub name: String,
    pub underlying: Option<TypeTag>,
    /// Case name -> runtime value (underlying literal, or ordinal int).
    pub cases: IndexMap<String, Const>,
}

// ---------------------------------------------------------------------------
// Heap payloads
// ---------------------------------------------------------------------------

/// Key of a map or super-array entry, stored by value so lookups never
/// touch the heap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Int(i64),
    Str(Box<str>),
}

impl EntryKey {
    pub fn render(&self) -> String {
        match self {
            EntryKey::Int(n) => n.to_string(),
            EntryKey::Str(s) => s.to_string(),
        }
    }

    pub fn to_value(&self, heap: &mut crate::gc::Heap) -> Value {
        match self {
            EntryKey::Int(n) => Value::Int(*n),
            EntryKey::Str(s) => Value::Str(heap.alloc_string(s)),
        }
    }
}

/// Ordered heterogeneous container with int and string keys coexisting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuperArray {
    pub entries: IndexMap<EntryKey, Value>,
}

impl SuperArray {
    pub fn new() -> Self {
        SuperArray { entries: IndexMap::new() }
    }

    /// Auto-indexing append: next key is max(int keys) + 1, starting at 0.
    pub fn push(&mut self, value: Value) {
        let next = self
            .entries
            .keys()
            .filter_map(|k| match k {
                EntryKey::Int(n) => Some(*n),
                EntryKey::Str(_) => None,
            })
            .max()
            .map(|m| m + 1)
            .unwrap_or(0);
        self.entries.insert(EntryKey::Int(next), value);
    }

    /// Insertion keeps the original position for existing keys.
    pub fn set(&mut self, key: EntryKey, value: Value) {
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &EntryKey) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn has(&self, key: &EntryKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One captured stack frame in an exception trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub function: String,
    pub line: u32,
}

/// A class instance. `trace` is populated only on exception objects, at
/// throw time, and survives re-throws.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub class: ClassId,
    pub fields: IndexMap<String, Value>,
    pub trace: Option<Vec<TraceFrame>>,
}

impl Instance {
    pub fn new(class: ClassId) -> Self {
        Instance { class, fields: IndexMap::new(), trace: None }
    }
}

/// A closure: function plus upvalues captured by value at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureData {
    pub func: FuncId,
    pub upvals: Vec<Value>,
}

/// Iterator state for foreach over arrays, maps and super-arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct IterState {
    pub container: Value,
    pub pos: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn super_array_auto_index_starts_at_zero() {
        let mut sa = SuperArray::new();
        sa.push(Value::Int(10));
        sa.push(Value::Int(20));
        let keys: Vec<_> = sa.entries.keys().cloned().collect();
        assert_eq!(keys, vec![EntryKey::Int(0), EntryKey::Int(1)]);
    }

    #[test]
    fn super_array_auto_index_skips_past_max() {
        let mut sa = SuperArray::new();
        sa.set(EntryKey::Int(7), Value::Int(1));
        sa.set(EntryKey::Str("name".into()), Value::Int(2));
        sa.push(Value::Int(3));
        assert!(sa.has(&EntryKey::Int(8)));
        assert_eq!(sa.len(), 3);
    }

    #[test]
    fn super_array_preserves_insertion_order_on_update() {
        let mut sa = SuperArray::new();
        sa.set(EntryKey::Str("a".into()), Value::Int(1));
        sa.set(EntryKey::Int(0), Value::Int(2));
        sa.set(EntryKey::Str("a".into()), Value::Int(9));
        let keys: Vec<_> = sa.entries.keys().cloned().collect();
        assert_eq!(keys, vec![EntryKey::Str("a".into()), EntryKey::Int(0)]);
        assert_eq!(sa.get(&EntryKey::Str("a".into())), Some(&Value::Int(9)));
    }

    #[test]
    fn mixed_keys_coexist() {
        let mut sa = SuperArray::new();
        sa.set(EntryKey::Int(0), Value::Int(1));
        sa.set(EntryKey::Str("zero".into()), Value::Int(1));
        assert!(sa.has(&EntryKey::Int(0)));
        assert!(sa.has(&EntryKey::Str("zero".into())));
    }
}
