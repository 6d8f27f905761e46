/// Bytecode image format.
///
/// Binary layout (little-endian):
///
/// ```text
/// +------------------+----------------------------------+
/// | Magic "PRSM"     | 4 bytes                          |
/// | Format version   | u16                              |
/// | Endianness mark  | u8 (0x01 = little)               |
/// | Function count   | u16, then functions              |
/// | Class count      | u16, then classes                |
/// | Interface count  | u16, then interfaces             |
/// | Enum count       | u16, then enums                  |
/// | Entry function   | u16                              |
/// +------------------+----------------------------------+
/// ```
///
/// Strings are u32-length-prefixed UTF-8. Every function deserialized from
/// an image must pass the verifier before it is eligible for execution —
/// `read_program` runs it as part of decoding.

use std::collections::HashMap;

use indexmap::IndexMap;
use thiserror::Error;

use crate::ast::Visibility;
use crate::bytecode::{Chunk, Const, ExceptionRegion, Function, Op, TypeTag, UpvalRecipe};
use crate::compiler::Program;
use crate::core::object::{AnnotationData, Class, EnumDef, Interface, PropDef};
use crate::errors::VerifyError;
use crate::verifier;

pub const MAGIC: &[u8; 4] = b"PRSM";
pub const VERSION: u16 = 1;
const LITTLE_ENDIAN_MARK: u8 = 0x01;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("not a Prism image (bad magic)")]
    BadMagic,
    #[error("unsupported image version {0}")]
    BadVersion(u16),
    #[error("unsupported endianness marker {0:#x}")]
    BadEndianness(u8),
    #[error("truncated image at byte {0}")]
    Truncated(usize),
    #[error("malformed image: {0}")]
    Malformed(String),
    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn boolean(&mut self, b: bool) {
        self.u8(b as u8);
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ImageError> {
        if self.pos + n > self.data.len() {
            return Err(ImageError::Truncated(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ImageError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ImageError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ImageError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, ImageError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    fn f64(&mut self) -> Result<f64, ImageError> {
        let b = self.take(8)?;
        Ok(f64::from_bits(u64::from_le_bytes(b.try_into().expect("8 bytes"))))
    }

    fn string(&mut self) -> Result<String, ImageError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ImageError::Malformed("invalid UTF-8".into()))
    }

    fn boolean(&mut self) -> Result<bool, ImageError> {
        Ok(self.u8()? != 0)
    }
}

// ---------------------------------------------------------------------------
// Constants and types
// ---------------------------------------------------------------------------

fn write_const(w: &mut Writer, c: &Const) {
    match c {
        Const::Null => w.u8(0),
        Const::Bool(b) => {
            w.u8(1);
            w.boolean(*b);
        }
        Const::Int(n) => {
            w.u8(2);
            w.i64(*n);
        }
        Const::Float(f) => {
            w.u8(3);
            w.f64(*f);
        }
        Const::Str(s) => {
            w.u8(4);
            w.string(s);
        }
    }
}

fn read_const(r: &mut Reader) -> Result<Const, ImageError> {
    Ok(match r.u8()? {
        0 => Const::Null,
        1 => Const::Bool(r.boolean()?),
        2 => Const::Int(r.i64()?),
        3 => Const::Float(r.f64()?),
        4 => Const::Str(r.string()?),
        other => return Err(ImageError::Malformed(format!("bad constant tag {}", other))),
    })
}

fn write_type(w: &mut Writer, t: &TypeTag) {
    match t {
        TypeTag::Int => w.u8(0),
        TypeTag::Float => w.u8(1),
        TypeTag::Bool => w.u8(2),
        TypeTag::Str => w.u8(3),
        TypeTag::Bytes => w.u8(4),
        TypeTag::Null => w.u8(5),
        TypeTag::SuperArray => w.u8(6),
        TypeTag::Function => w.u8(7),
        TypeTag::Any => w.u8(8),
        TypeTag::Array(e) => {
            w.u8(9);
            write_type(w, e);
        }
        TypeTag::Map(k, v) => {
            w.u8(10);
            write_type(w, k);
            write_type(w, v);
        }
        TypeTag::Class(n) => {
            w.u8(11);
            w.string(n);
        }
        TypeTag::Nullable(inner) => {
            w.u8(12);
            write_type(w, inner);
        }
    }
}

fn read_type(r: &mut Reader) -> Result<TypeTag, ImageError> {
    Ok(match r.u8()? {
        0 => TypeTag::Int,
        1 => TypeTag::Float,
        2 => TypeTag::Bool,
        3 => TypeTag::Str,
        4 => TypeTag::Bytes,
        5 => TypeTag::Null,
        6 => TypeTag::SuperArray,
        7 => TypeTag::Function,
        8 => TypeTag::Any,
        9 => TypeTag::Array(Box::new(read_type(r)?)),
        10 => TypeTag::Map(Box::new(read_type(r)?), Box::new(read_type(r)?)),
        11 => TypeTag::Class(r.string()?),
        12 => TypeTag::Nullable(Box::new(read_type(r)?)),
        other => return Err(ImageError::Malformed(format!("bad type tag {}", other))),
    })
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

fn write_op(w: &mut Writer, op: &Op) {
    use Op::*;
    match op {
        Push(i) => {
            w.u8(0);
            w.u16(*i);
        }
        Pop => w.u8(1),
        Dup => w.u8(2),
        Swap => w.u8(3),
        LoadLocal(i) => {
            w.u8(4);
            w.u16(*i);
        }
        StoreLocal(i) => {
            w.u8(5);
            w.u16(*i);
        }
        LoadGlobal(i) => {
            w.u8(6);
            w.u16(*i);
        }
        StoreGlobal(i) => {
            w.u8(7);
            w.u16(*i);
        }
        LoadUpval(i) => {
            w.u8(8);
            w.u16(*i);
        }
        StoreUpval(i) => {
            w.u8(9);
            w.u16(*i);
        }
        Add => w.u8(10),
        Sub => w.u8(11),
        Mul => w.u8(12),
        Div => w.u8(13),
        Mod => w.u8(14),
        Neg => w.u8(15),
        Inc => w.u8(16),
        Dec => w.u8(17),
        Concat => w.u8(18),
        ToStr => w.u8(19),
        Not => w.u8(20),
        BitAnd => w.u8(21),
        BitOr => w.u8(22),
        BitXor => w.u8(23),
        BitNot => w.u8(24),
        Shl => w.u8(25),
        Shr => w.u8(26),
        Eq => w.u8(27),
        Ne => w.u8(28),
        Lt => w.u8(29),
        Le => w.u8(30),
        Gt => w.u8(31),
        Ge => w.u8(32),
        Jump(o) => {
            w.u8(33);
            w.u32(*o);
        }
        JumpIfFalse(o) => {
            w.u8(34);
            w.u32(*o);
        }
        Loop(o) => {
            w.u8(35);
            w.u32(*o);
        }
        Call(n) => {
            w.u8(36);
            w.u8(*n);
        }
        CallN { argc, rets } => {
            w.u8(37);
            w.u8(*argc);
            w.u8(*rets);
        }
        CallMethod { name, argc, site } => {
            w.u8(38);
            w.u16(*name);
            w.u8(*argc);
            w.u16(*site);
        }
        CallStatic { class, name, argc } => {
            w.u8(39);
            w.u16(*class);
            w.u16(*name);
            w.u8(*argc);
        }
        TailCall(n) => {
            w.u8(40);
            w.u8(*n);
        }
        Return(k) => {
            w.u8(41);
            w.u8(*k);
        }
        NewObject(i) => {
            w.u8(42);
            w.u16(*i);
        }
        GetField(i) => {
            w.u8(43);
            w.u16(*i);
        }
        SetField(i) => {
            w.u8(44);
            w.u16(*i);
        }
        GetStatic { class, name } => {
            w.u8(45);
            w.u16(*class);
            w.u16(*name);
        }
        SetStatic { class, name } => {
            w.u8(46);
            w.u16(*class);
            w.u16(*name);
        }
        NewArray(n) => {
            w.u8(47);
            w.u16(*n);
        }
        ArrayGet => w.u8(48),
        ArraySet => w.u8(49),
        NewMap(n) => {
            w.u8(50);
            w.u16(*n);
        }
        MapGet => w.u8(51),
        MapSet => w.u8(52),
        NewSuperArray(n) => {
            w.u8(53);
            w.u16(*n);
        }
        SuperGet => w.u8(54),
        SuperSet => w.u8(55),
        IterNew => w.u8(56),
        IterNext(o) => {
            w.u8(57);
            w.u32(*o);
        }
        EnterTry(r) => {
            w.u8(58);
            w.u16(*r);
        }
        LeaveTry => w.u8(59),
        EnterCatch(r) => {
            w.u8(60);
            w.u16(*r);
        }
        EnterFinally => w.u8(61),
        EndFinally => w.u8(62),
        Throw => w.u8(63),
        CheckType(i) => {
            w.u8(64);
            w.u16(*i);
        }
        Cast(i) => {
            w.u8(65);
            w.u16(*i);
        }
        CastSafe(i) => {
            w.u8(66);
            w.u16(*i);
        }
        MakeClosure { func, upvals } => {
            w.u8(67);
            w.u16(*func);
            w.u16(upvals.len() as u16);
            for u in upvals {
                w.boolean(u.from_local);
                w.u16(u.index);
            }
        }
        Echo => w.u8(68),
        Nop => w.u8(69),
    }
}

fn read_op(r: &mut Reader) -> Result<Op, ImageError> {
    use Op::*;
    Ok(match r.u8()? {
        0 => Push(r.u16()?),
        1 => Pop,
        2 => Dup,
        3 => Swap,
        4 => LoadLocal(r.u16()?),
        5 => StoreLocal(r.u16()?),
        6 => LoadGlobal(r.u16()?),
        7 => StoreGlobal(r.u16()?),
        8 => LoadUpval(r.u16()?),
        9 => StoreUpval(r.u16()?),
        10 => Add,
        11 => Sub,
        12 => Mul,
        13 => Div,
        14 => Mod,
        15 => Neg,
        16 => Inc,
        17 => Dec,
        18 => Concat,
        19 => ToStr,
        20 => Not,
        21 => BitAnd,
        22 => BitOr,
        23 => BitXor,
        24 => BitNot,
        25 => Shl,
        26 => Shr,
        27 => Eq,
        28 => Ne,
        29 => Lt,
        30 => Le,
        31 => Gt,
        32 => Ge,
        33 => Jump(r.u32()?),
        34 => JumpIfFalse(r.u32()?),
        35 => Loop(r.u32()?),
        36 => Call(r.u8()?),
        37 => CallN { argc: r.u8()?, rets: r.u8()? },
        38 => CallMethod { name: r.u16()?, argc: r.u8()?, site: r.u16()? },
        39 => CallStatic { class: r.u16()?, name: r.u16()?, argc: r.u8()? },
        40 => TailCall(r.u8()?),
        41 => Return(r.u8()?),
        42 => NewObject(r.u16()?),
        43 => GetField(r.u16()?),
        44 => SetField(r.u16()?),
        45 => GetStatic { class: r.u16()?, name: r.u16()? },
        46 => SetStatic { class: r.u16()?, name: r.u16()? },
        47 => NewArray(r.u16()?),
        48 => ArrayGet,
        49 => ArraySet,
        50 => NewMap(r.u16()?),
        51 => MapGet,
        52 => MapSet,
        53 => NewSuperArray(r.u16()?),
        54 => SuperGet,
        55 => SuperSet,
        56 => IterNew,
        57 => IterNext(r.u32()?),
        58 => EnterTry(r.u16()?),
        59 => LeaveTry,
        60 => EnterCatch(r.u16()?),
        61 => EnterFinally,
        62 => EndFinally,
        63 => Throw,
        64 => CheckType(r.u16()?),
        65 => Cast(r.u16()?),
        66 => CastSafe(r.u16()?),
        67 => {
            let func = r.u16()?;
            let n = r.u16()? as usize;
            let mut upvals = Vec::with_capacity(n);
            for _ in 0..n {
                upvals.push(UpvalRecipe { from_local: r.boolean()?, index: r.u16()? });
            }
            MakeClosure { func, upvals }
        }
        68 => Echo,
        69 => Nop,
        other => return Err(ImageError::Malformed(format!("bad opcode {}", other))),
    })
}

// ---------------------------------------------------------------------------
// Chunks, functions, classes
// ---------------------------------------------------------------------------

fn write_chunk(w: &mut Writer, chunk: &Chunk) {
    w.u32(chunk.code.len() as u32);
    for op in &chunk.code {
        write_op(w, op);
    }
    w.u32(chunk.consts.len() as u32);
    for c in &chunk.consts {
        write_const(w, c);
    }
    w.u32(chunk.lines.len() as u32);
    for line in &chunk.lines {
        w.u32(*line);
    }
    w.u32(chunk.regions.len() as u32);
    for region in &chunk.regions {
        w.u32(region.start);
        w.u32(region.end);
        w.u16(region.catches.len() as u16);
        for (class, handler) in &region.catches {
            w.u16(*class);
            w.u32(*handler);
        }
        match region.finally {
            Some(pad) => {
                w.u8(1);
                w.u32(pad);
            }
            None => w.u8(0),
        }
    }
    w.u32(chunk.types.len() as u32);
    for t in &chunk.types {
        write_type(w, t);
    }
}

fn read_chunk(r: &mut Reader) -> Result<Chunk, ImageError> {
    let mut chunk = Chunk::new();
    let code_len = r.u32()? as usize;
    for _ in 0..code_len {
        chunk.code.push(read_op(r)?);
    }
    let const_len = r.u32()? as usize;
    for _ in 0..const_len {
        chunk.consts.push(read_const(r)?);
    }
    let line_len = r.u32()? as usize;
    for _ in 0..line_len {
        chunk.lines.push(r.u32()?);
    }
    let region_len = r.u32()? as usize;
    for _ in 0..region_len {
        let start = r.u32()?;
        let end = r.u32()?;
        let catch_len = r.u16()? as usize;
        let mut catches = Vec::with_capacity(catch_len);
        for _ in 0..catch_len {
            catches.push((r.u16()?, r.u32()?));
        }
        let finally = if r.boolean()? { Some(r.u32()?) } else { None };
        chunk.regions.push(ExceptionRegion { start, end, catches, finally });
    }
    let type_len = r.u32()? as usize;
    for _ in 0..type_len {
        chunk.types.push(read_type(r)?);
    }
    Ok(chunk)
}

fn write_function(w: &mut Writer, f: &Function) {
    w.string(&f.name);
    w.u8(f.min_arity);
    w.u8(f.arity);
    w.u16(f.defaults.len() as u16);
    for d in &f.defaults {
        write_const(w, d);
    }
    w.boolean(f.variadic);
    w.u8(f.returns);
    w.u16(f.locals);
    w.u16(f.upvals.len() as u16);
    for u in &f.upvals {
        w.boolean(u.from_local);
        w.u16(u.index);
    }
    w.u16(f.param_types.len() as u16);
    for t in &f.param_types {
        write_type(w, t);
    }
    w.u16(f.ret_types.len() as u16);
    for t in &f.ret_types {
        write_type(w, t);
    }
    match f.native {
        Some(n) => {
            w.u8(1);
            w.u16(n);
        }
        None => w.u8(0),
    }
    write_chunk(w, &f.chunk);
}

fn read_function(r: &mut Reader) -> Result<Function, ImageError> {
    let name = r.string()?;
    let min_arity = r.u8()?;
    let arity = r.u8()?;
    let default_len = r.u16()? as usize;
    let mut defaults = Vec::with_capacity(default_len);
    for _ in 0..default_len {
        defaults.push(read_const(r)?);
    }
    let variadic = r.boolean()?;
    let returns = r.u8()?;
    let locals = r.u16()?;
    let upval_len = r.u16()? as usize;
    let mut upvals = Vec::with_capacity(upval_len);
    for _ in 0..upval_len {
        upvals.push(UpvalRecipe { from_local: r.boolean()?, index: r.u16()? });
    }
    let param_len = r.u16()? as usize;
    let mut param_types = Vec::with_capacity(param_len);
    for _ in 0..param_len {
        param_types.push(read_type(r)?);
    }
    let ret_len = r.u16()? as usize;
    let mut ret_types = Vec::with_capacity(ret_len);
    for _ in 0..ret_len {
        ret_types.push(read_type(r)?);
    }
    let native = if r.boolean()? { Some(r.u16()?) } else { None };
    let chunk = read_chunk(r)?;
    Ok(Function {
        name,
        min_arity,
        arity,
        defaults,
        variadic,
        returns,
        locals,
        upvals,
        param_types,
        ret_types,
        chunk,
        native,
        compiled: None,
        call_count: 0,
        loop_count: 0,
    })
}

fn write_annotations(w: &mut Writer, anns: &[AnnotationData]) {
    w.u16(anns.len() as u16);
    for a in anns {
        w.string(&a.name);
        w.u16(a.args.len() as u16);
        for arg in &a.args {
            write_const(w, arg);
        }
    }
}

fn read_annotations(r: &mut Reader) -> Result<Vec<AnnotationData>, ImageError> {
    let n = r.u16()? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let name = r.string()?;
        let argn = r.u16()? as usize;
        let mut args = Vec::with_capacity(argn);
        for _ in 0..argn {
            args.push(read_const(r)?);
        }
        out.push(AnnotationData { name, args });
    }
    Ok(out)
}

fn write_visibility(w: &mut Writer, v: Visibility) {
    w.u8(match v {
        Visibility::Public => 0,
        Visibility::Protected => 1,
        Visibility::Private => 2,
    });
}

fn read_visibility(r: &mut Reader) -> Result<Visibility, ImageError> {
    Ok(match r.u8()? {
        0 => Visibility::Public,
        1 => Visibility::Protected,
        2 => Visibility::Private,
        other => return Err(ImageError::Malformed(format!("bad visibility {}", other))),
    })
}

fn write_class(w: &mut Writer, c: &Class) {
    w.u16(c.id);
    w.string(&c.name);
    match &c.parent_name {
        Some(p) => {
            w.u8(1);
            w.string(p);
        }
        None => w.u8(0),
    }
    w.u16(c.interfaces.len() as u16);
    for i in &c.interfaces {
        w.string(i);
    }
    w.u16(c.props.len() as u16);
    for p in &c.props {
        w.string(&p.name);
        write_type(w, &p.ty);
        write_const(w, &p.default);
        w.boolean(p.is_static);
        write_visibility(w, p.visibility);
        write_annotations(w, &p.annotations);
    }
    w.u16(c.consts.len() as u16);
    for (name, value) in &c.consts {
        w.string(name);
        write_const(w, value);
    }
    w.u16(c.methods.len() as u16);
    for (name, ids) in &c.methods {
        w.string(name);
        w.u16(ids.len() as u16);
        for id in ids {
            w.u16(*id);
        }
    }
    w.u16(c.vtable.len() as u16);
    for ((name, arity), id) in &c.vtable {
        w.string(name);
        w.u8(*arity);
        w.u16(*id);
    }
    write_annotations(w, &c.annotations);
    w.u16(c.method_annotations.len() as u16);
    for (name, anns) in &c.method_annotations {
        w.string(name);
        write_annotations(w, anns);
    }
    w.boolean(c.is_abstract);
    w.boolean(c.is_final);
    match &c.doc {
        Some(d) => {
            w.u8(1);
            w.string(d);
        }
        None => w.u8(0),
    }
}

fn read_class(r: &mut Reader) -> Result<Class, ImageError> {
    let id = r.u16()?;
    let name = r.string()?;
    let parent_name = if r.boolean()? { Some(r.string()?) } else { None };
    let iface_len = r.u16()? as usize;
    let mut interfaces = Vec::with_capacity(iface_len);
    for _ in 0..iface_len {
        interfaces.push(r.string()?);
    }
    let prop_len = r.u16()? as usize;
    let mut props = Vec::with_capacity(prop_len);
    for _ in 0..prop_len {
        props.push(PropDef {
            name: r.string()?,
            ty: read_type(r)?,
            default: read_const(r)?,
            is_static: r.boolean()?,
            visibility: read_visibility(r)?,
            annotations: read_annotations(r)?,
        });
    }
    let const_len = r.u16()? as usize;
    let mut consts = IndexMap::new();
    for _ in 0..const_len {
        let name = r.string()?;
        let value = read_const(r)?;
        consts.insert(name, value);
    }
    let method_len = r.u16()? as usize;
    let mut methods = HashMap::new();
    for _ in 0..method_len {
        let name = r.string()?;
        let n = r.u16()? as usize;
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            ids.push(r.u16()?);
        }
        methods.insert(name, ids);
    }
    let vtable_len = r.u16()? as usize;
    let mut vtable = HashMap::new();
    for _ in 0..vtable_len {
        let name = r.string()?;
        let arity = r.u8()?;
        let id = r.u16()?;
        vtable.insert((name, arity), id);
    }
    let annotations = read_annotations(r)?;
    let mann_len = r.u16()? as usize;
    let mut method_annotations = HashMap::new();
    for _ in 0..mann_len {
        let name = r.string()?;
        method_annotations.insert(name, read_annotations(r)?);
    }
    let is_abstract = r.boolean()?;
    let is_final = r.boolean()?;
    let doc = if r.boolean()? { Some(r.string()?) } else { None };
    Ok(Class {
        id,
        name,
        parent_name,
        parent: None,
        interfaces,
        props,
        consts,
        methods,
        vtable,
        annotations,
        method_annotations,
        is_abstract,
        is_final,
        doc,
    })
}

// ---------------------------------------------------------------------------
// Whole program
// ---------------------------------------------------------------------------

pub fn write_program(program: &Program) -> Vec<u8> {
    let mut w = Writer::new();
    w.buf.extend_from_slice(MAGIC);
    w.u16(VERSION);
    w.u8(LITTLE_ENDIAN_MARK);

    w.u16(program.functions.len() as u16);
    for f in &program.functions {
        write_function(&mut w, f);
    }
    w.u16(program.classes.len() as u16);
    for c in &program.classes {
        write_class(&mut w, c);
    }
    w.u16(program.interfaces.len() as u16);
    for i in &program.interfaces {
        w.string(&i.name);
        w.u16(i.extends.len() as u16);
        for e in &i.extends {
            w.string(e);
        }
        w.u16(i.methods.len() as u16);
        for (name, min, arity) in &i.methods {
            w.string(name);
            w.u8(*min);
            w.u8(*arity);
        }
        w.u16(i.consts.len() as u16);
        for (name, value) in &i.consts {
            w.string(name);
            write_const(&mut w, value);
        }
    }
    w.u16(program.enums.len() as u16);
    for e in &program.enums {
        w.string(&e.name);
        match &e.underlying {
            Some(t) => {
                w.u8(1);
                write_type(&mut w, t);
            }
            None => w.u8(0),
        }
        w.u16(e.cases.len() as u16);
        for (name, value) in &e.cases {
            w.string(name);
            write_const(&mut w, value);
        }
    }
    w.u16(program.entry);
    w.buf
}

pub fn read_program(data: &[u8]) -> Result<Program, ImageError> {
    let mut r = Reader::new(data);
    if r.take(4)? != MAGIC {
        return Err(ImageError::BadMagic);
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(ImageError::BadVersion(version));
    }
    let endian = r.u8()?;
    if endian != LITTLE_ENDIAN_MARK {
        return Err(ImageError::BadEndianness(endian));
    }

    let func_len = r.u16()? as usize;
    let mut functions = Vec::with_capacity(func_len);
    for _ in 0..func_len {
        functions.push(read_function(&mut r)?);
    }
    let class_len = r.u16()? as usize;
    let mut classes = Vec::with_capacity(class_len);
    for _ in 0..class_len {
        classes.push(read_class(&mut r)?);
    }
    let iface_len = r.u16()? as usize;
    let mut interfaces = Vec::with_capacity(iface_len);
    for _ in 0..iface_len {
        let name = r.string()?;
        let extend_len = r.u16()? as usize;
        let mut extends = Vec::with_capacity(extend_len);
        for _ in 0..extend_len {
            extends.push(r.string()?);
        }
        let method_len = r.u16()? as usize;
        let mut methods = Vec::with_capacity(method_len);
        for _ in 0..method_len {
            methods.push((r.string()?, r.u8()?, r.u8()?));
        }
        let const_len = r.u16()? as usize;
        let mut consts = IndexMap::new();
        for _ in 0..const_len {
            let cname = r.string()?;
            let value = read_const(&mut r)?;
            consts.insert(cname, value);
        }
        interfaces.push(Interface { name, extends, methods, consts });
    }
    let enum_len = r.u16()? as usize;
    let mut enums = Vec::with_capacity(enum_len);
    for _ in 0..enum_len {
        let name = r.string()?;
        let underlying = if r.boolean()? { Some(read_type(&mut r)?) } else { None };
        let case_len = r.u16()? as usize;
        let mut cases = IndexMap::new();
        for _ in 0..case_len {
            let cname = r.string()?;
            let value = read_const(&mut r)?;
            cases.insert(cname, value);
        }
        enums.push(EnumDef { name, underlying, cases });
    }
    let entry = r.u16()?;

    // Re-link parents and verify every function before it may run.
    let by_name: HashMap<String, u16> =
        classes.iter().map(|c| (c.name.clone(), c.id)).collect();
    for c in &mut classes {
        c.parent = c.parent_name.as_ref().and_then(|p| by_name.get(p)).copied();
    }
    verifier::verify_program(&functions)?;

    Ok(Program { functions, classes, interfaces, enums, entry })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn roundtrip(src: &str) {
        let (file, lex, parse) = parse_source(src, 0);
        assert!(lex.is_empty() && parse.is_empty());
        let program = crate::compiler::compile(&[file]).expect("compiles");
        let bytes = write_program(&program);
        let back = read_program(&bytes).expect("image reads back");
        assert_eq!(program.functions.len(), back.functions.len());
        for (a, b) in program.functions.iter().zip(&back.functions) {
            assert_eq!(a.chunk, b.chunk, "chunk mismatch in {}", a.name);
            assert_eq!(a.name, b.name);
            assert_eq!(a.defaults, b.defaults);
            assert_eq!(a.upvals, b.upvals);
        }
        assert_eq!(program.entry, back.entry);
        assert_eq!(program.classes.len(), back.classes.len());
        assert_eq!(program.enums.len(), back.enums.len());
    }

    #[test]
    fn chunk_roundtrip_is_identity() {
        roundtrip("echo 1 + 2;");
        roundtrip(
            r#"
            class Point { public int $x = 0; public function get(): int { return $this->x; } }
            enum Color: int { Red = 1, Green }
            function fib(int $n): int { if ($n < 2) { return $n; } return fib($n-1) + fib($n-2); }
            try { echo fib(5); } catch (Exception $e) { echo "no"; } finally { echo "end"; }
            "#,
        );
    }

    #[test]
    fn bad_magic_rejected() {
        assert!(matches!(read_program(b"NOPE"), Err(ImageError::BadMagic)));
    }

    #[test]
    fn truncated_image_rejected() {
        let (file, _, _) = parse_source("echo 1;", 0);
        let program = crate::compiler::compile(&[file]).expect("compiles");
        let bytes = write_program(&program);
        let cut = &bytes[..bytes.len() / 2];
        assert!(read_program(cut).is_err());
    }

    #[test]
    fn corrupted_function_fails_verification() {
        let (file, _, _) = parse_source("echo 1;", 0);
        let mut program = crate::compiler::compile(&[file]).expect("compiles");
        // A jump far past the end of the chunk survives serialization but
        // cannot survive the load-time verifier.
        program.functions[program.entry as usize].chunk.code[0] = Op::Jump(9999);
        let bytes = write_program(&program);
        assert!(matches!(read_program(&bytes), Err(ImageError::Verify(_))));
    }
}
