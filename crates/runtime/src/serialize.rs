//! The `CLJC` persistence format
//!
//! Little-endian, framed: a 4-byte magic, version/flags, a string table,
//! a FnProto table, then either a top-level chunk (AOT artefact) or a
//! namespace list (environment snapshot). This is what lets the standard
//! library be compiled ahead-of-time and loaded at startup.
//!
//! The wire layout is a pinned contract, so encoding is hand-rolled
//! rather than derived. Parsing goes through an intermediate typed
//! representation (`SValue`) and resolves string/proto/var indices in a
//! second pass; refers and aliases in snapshots resolve only after every
//! namespace exists.
//!
//! Tree-walk closures refuse to serialize (code is not data for the
//! oracle backend); unknown value tags fail deserialization.

use crate::env::Env;
use clove_core::chunk::{Chunk, FnProto, Instr, Op};
use clove_core::value::{Closure, Value};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

const MAGIC: &[u8; 4] = b"CLJC";
const VERSION: u16 = 1;

// Value tag bytes (wire contract).
const TAG_NIL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_CHAR: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_SYMBOL: u8 = 0x06;
const TAG_KEYWORD: u8 = 0x07;
const TAG_FN: u8 = 0x08;
const TAG_LIST: u8 = 0x09;
const TAG_VECTOR: u8 = 0x0A;
const TAG_MAP: u8 = 0x0B;
const TAG_SET: u8 = 0x0C;
const TAG_VAR: u8 = 0x0D;
const TAG_ATOM: u8 = 0x0E;
const TAG_VOLATILE: u8 = 0x0F;
// Textual big-number payloads (extension tags; see DESIGN.md).
const TAG_BIG_INT: u8 = 0x10;
const TAG_BIG_DECIMAL: u8 = 0x11;
const TAG_RATIO: u8 = 0x12;

/// Var flags byte layout in snapshots.
const FLAG_DYNAMIC: u8 = 1 << 0;
const FLAG_MACRO: u8 = 1 << 1;
const FLAG_PRIVATE: u8 = 1 << 2;
const FLAG_CONST: u8 = 1 << 3;

/// Root marker: 1 means "preserve the already-registered builtin root".
const ROOT_VALUE: u8 = 0;
const ROOT_BUILTIN: u8 = 1;

#[derive(Debug)]
pub enum SerializeError {
    /// Tree-walk closures never persist
    TreeClosureNotSerializable,
    /// A value kind outside the wire contract (protocol fns, multimethods,
    /// lazy seqs, builtins outside the snapshot sentinel)
    NotSerializable(&'static str),
    /// A closure with materialised captures is runtime state
    CapturedClosure,
    InvalidMagic,
    UnsupportedVersion(u16),
    UnknownTag(u8),
    UnknownOpcode(u8),
    Truncated,
    InvalidData(String),
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializeError::TreeClosureNotSerializable => {
                write!(f, "tree-walk closures cannot be serialized")
            }
            SerializeError::NotSerializable(kind) => {
                write!(f, "{} values cannot be serialized", kind)
            }
            SerializeError::CapturedClosure => {
                write!(f, "closures with captured values are runtime state")
            }
            SerializeError::InvalidMagic => write!(f, "not a CLJC artefact"),
            SerializeError::UnsupportedVersion(v) => {
                write!(f, "unsupported CLJC version: {}", v)
            }
            SerializeError::UnknownTag(t) => write!(f, "unknown value tag: 0x{:02X}", t),
            SerializeError::UnknownOpcode(op) => write!(f, "unknown opcode: 0x{:02X}", op),
            SerializeError::Truncated => write!(f, "truncated CLJC data"),
            SerializeError::InvalidData(msg) => write!(f, "invalid CLJC data: {}", msg),
        }
    }
}

impl std::error::Error for SerializeError {}

// ----- writer -----

struct Writer {
    strings: Vec<Rc<str>>,
    string_index: HashMap<Rc<str>, u32>,
    protos: Vec<Rc<FnProto>>,
    proto_index: HashMap<*const FnProto, u32>,
}

impl Writer {
    fn new() -> Self {
        Writer {
            strings: Vec::new(),
            string_index: HashMap::new(),
            protos: Vec::new(),
            proto_index: HashMap::new(),
        }
    }

    fn intern_string(&mut self, s: &Rc<str>) -> u32 {
        if let Some(idx) = self.string_index.get(s) {
            return *idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.clone());
        self.string_index.insert(s.clone(), idx);
        idx
    }

    fn intern_str(&mut self, s: &str) -> u32 {
        self.intern_string(&Rc::from(s))
    }

    /// Register a proto (and, recursively, protos referenced from its
    /// constant pool) ahead of serialization, so children always carry
    /// higher indices than their parents.
    fn collect_proto(&mut self, proto: &Rc<FnProto>) -> Result<u32, SerializeError> {
        let key = Rc::as_ptr(proto);
        if let Some(idx) = self.proto_index.get(&key) {
            return Ok(*idx);
        }
        let idx = self.protos.len() as u32;
        self.protos.push(proto.clone());
        self.proto_index.insert(key, idx);
        for value in &proto.consts {
            self.collect_value(value)?;
        }
        Ok(idx)
    }

    fn collect_value(&mut self, value: &Value) -> Result<(), SerializeError> {
        match value {
            Value::Fn(c) => {
                if !c.captures.borrow().is_empty() {
                    return Err(SerializeError::CapturedClosure);
                }
                self.collect_proto(&c.proto)?;
                for extra in &c.extras {
                    self.collect_proto(extra)?;
                }
                Ok(())
            }
            Value::List(l) => l.items.iter().try_for_each(|v| self.collect_value(v)),
            Value::Vector(v) => v.items.iter().try_for_each(|v| self.collect_value(v)),
            Value::Set(s) => s.items.iter().try_for_each(|v| self.collect_value(v)),
            Value::Map(m) => m.entries.iter().try_for_each(|(k, v)| {
                self.collect_value(k)?;
                self.collect_value(v)
            }),
            Value::Atom(a) | Value::Volatile(a) => self.collect_value(&a.borrow()),
            _ => Ok(()),
        }
    }

    fn write_value(&mut self, out: &mut Vec<u8>, value: &Value) -> Result<(), SerializeError> {
        match value {
            Value::Nil => out.push(TAG_NIL),
            Value::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(*b as u8);
            }
            Value::Int(i) => {
                out.push(TAG_INT);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Value::Float(f) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&f.to_le_bytes());
            }
            Value::Char(c) => {
                out.push(TAG_CHAR);
                out.extend_from_slice(&(*c as u32).to_le_bytes());
            }
            Value::Str(s) => {
                out.push(TAG_STRING);
                let idx = self.intern_string(s);
                out.extend_from_slice(&idx.to_le_bytes());
            }
            Value::Symbol(s) | Value::Keyword(s) => {
                out.push(if matches!(value, Value::Symbol(_)) {
                    TAG_SYMBOL
                } else {
                    TAG_KEYWORD
                });
                let ns = match &s.ns {
                    Some(ns) => self.intern_string(ns) as i32,
                    None => -1,
                };
                out.extend_from_slice(&ns.to_le_bytes());
                let name = self.intern_string(&s.name);
                out.extend_from_slice(&name.to_le_bytes());
            }
            Value::Fn(c) => {
                if !c.captures.borrow().is_empty() {
                    return Err(SerializeError::CapturedClosure);
                }
                out.push(TAG_FN);
                let proto = self.collect_proto(&c.proto)?;
                out.extend_from_slice(&proto.to_le_bytes());
                out.push(c.extras.len() as u8);
                for extra in &c.extras {
                    let idx = self.collect_proto(extra)?;
                    out.extend_from_slice(&idx.to_le_bytes());
                }
                let ns = self.intern_string(&c.ns) as i32;
                out.extend_from_slice(&ns.to_le_bytes());
            }
            Value::List(l) => self.write_seq(out, TAG_LIST, &l.items)?,
            Value::Vector(v) => self.write_seq(out, TAG_VECTOR, &v.items)?,
            Value::Map(m) => {
                out.push(TAG_MAP);
                out.extend_from_slice(&(m.entries.len() as u32).to_le_bytes());
                for (k, v) in &m.entries {
                    self.write_value(out, k)?;
                    self.write_value(out, v)?;
                }
            }
            Value::Set(s) => self.write_seq(out, TAG_SET, &s.items)?,
            Value::Var(v) => {
                out.push(TAG_VAR);
                let ns = self.intern_string(&v.ns);
                out.extend_from_slice(&ns.to_le_bytes());
                let name = self.intern_string(&v.name);
                out.extend_from_slice(&name.to_le_bytes());
            }
            Value::Atom(a) => {
                out.push(TAG_ATOM);
                let inner = a.borrow().clone();
                self.write_value(out, &inner)?;
            }
            Value::Volatile(a) => {
                out.push(TAG_VOLATILE);
                let inner = a.borrow().clone();
                self.write_value(out, &inner)?;
            }
            Value::BigInt(text) => {
                out.push(TAG_BIG_INT);
                let idx = self.intern_str(text);
                out.extend_from_slice(&idx.to_le_bytes());
            }
            Value::BigDecimal(text) => {
                out.push(TAG_BIG_DECIMAL);
                let idx = self.intern_str(text);
                out.extend_from_slice(&idx.to_le_bytes());
            }
            Value::Ratio(text) => {
                out.push(TAG_RATIO);
                let idx = self.intern_str(text);
                out.extend_from_slice(&idx.to_le_bytes());
            }
            Value::TreeFn(_) => return Err(SerializeError::TreeClosureNotSerializable),
            Value::Builtin(_) => return Err(SerializeError::NotSerializable("builtin fn")),
            Value::ProtocolFn(_) => return Err(SerializeError::NotSerializable("protocol fn")),
            Value::MultiFn(_) => return Err(SerializeError::NotSerializable("multimethod")),
            Value::LazySeq(_) => return Err(SerializeError::NotSerializable("lazy seq")),
        }
        Ok(())
    }

    fn write_seq(
        &mut self,
        out: &mut Vec<u8>,
        tag: u8,
        items: &[Value],
    ) -> Result<(), SerializeError> {
        out.push(tag);
        out.extend_from_slice(&(items.len() as u32).to_le_bytes());
        for item in items {
            self.write_value(out, item)?;
        }
        Ok(())
    }

    fn write_code(
        out: &mut Vec<u8>,
        code: &[Instr],
        lines: &[u32],
        cols: &[u32],
    ) {
        out.extend_from_slice(&(code.len() as u32).to_le_bytes());
        for instr in code {
            out.push(instr.op as u8);
            out.extend_from_slice(&instr.operand.to_le_bytes());
        }
        out.extend_from_slice(&(lines.len() as u32).to_le_bytes());
        for line in lines {
            out.extend_from_slice(&line.to_le_bytes());
        }
        out.extend_from_slice(&(cols.len() as u32).to_le_bytes());
        for col in cols {
            out.extend_from_slice(&col.to_le_bytes());
        }
    }

    fn write_consts(
        &mut self,
        out: &mut Vec<u8>,
        consts: &[Value],
    ) -> Result<(), SerializeError> {
        out.extend_from_slice(&(consts.len() as u32).to_le_bytes());
        for value in consts {
            self.write_value(out, value)?;
        }
        Ok(())
    }

    /// Serialize the proto table. Entries may grow while being written
    /// (nested fns discovered in constant pools), so iterate by index.
    fn write_proto_table(&mut self) -> Result<Vec<u8>, SerializeError> {
        let mut entries: Vec<Vec<u8>> = Vec::new();
        let mut i = 0;
        while i < self.protos.len() {
            let proto = self.protos[i].clone();
            let mut out = Vec::new();
            let name = match &proto.name {
                Some(name) => self.intern_string(name) as i32,
                None => -1,
            };
            out.extend_from_slice(&name.to_le_bytes());
            out.push(proto.arity);
            out.push(proto.variadic as u8);
            out.extend_from_slice(&proto.locals.to_le_bytes());
            out.extend_from_slice(&proto.capture_count().to_le_bytes());
            out.push(proto.self_ref as u8);
            for slot in &proto.capture_slots {
                out.extend_from_slice(&slot.to_le_bytes());
            }
            Self::write_code(&mut out, &proto.code, &proto.lines, &proto.cols);
            self.write_consts(&mut out, &proto.consts)?;
            entries.push(out);
            i += 1;
        }
        let mut table = Vec::new();
        table.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for entry in entries {
            table.extend_from_slice(&entry);
        }
        Ok(table)
    }

    fn string_table(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
        for s in &self.strings {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        out
    }
}

fn header() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // flags
    out
}

/// Serialize a compiled top-level chunk as an AOT artefact.
pub fn write_artifact(chunk: &Chunk) -> Result<Vec<u8>, SerializeError> {
    let mut writer = Writer::new();
    for value in &chunk.consts {
        writer.collect_value(value)?;
    }
    let mut body = Vec::new();
    Writer::write_code(&mut body, &chunk.code, &chunk.lines, &chunk.cols);
    writer.write_consts(&mut body, &chunk.consts)?;
    let proto_table = writer.write_proto_table()?;

    let mut out = header();
    out.extend_from_slice(&writer.string_table());
    out.extend_from_slice(&proto_table);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Serialize the full environment: every namespace with its vars, refers
/// and aliases. Vars rooted at builtins write the preserve sentinel.
pub fn write_snapshot(env: &Env) -> Result<Vec<u8>, SerializeError> {
    let mut writer = Writer::new();
    let namespaces = env.namespace_list();
    for ns in &namespaces {
        for var in ns.owned_vars() {
            if !matches!(var.root(), Value::Builtin(_)) {
                writer.collect_value(&var.root())?;
            }
        }
    }

    let mut body = Vec::new();
    body.extend_from_slice(&(namespaces.len() as u32).to_le_bytes());
    for ns in &namespaces {
        let name = writer.intern_string(&ns.name);
        body.extend_from_slice(&name.to_le_bytes());
        let vars = ns.owned_vars();
        body.extend_from_slice(&(vars.len() as u32).to_le_bytes());
        for var in vars {
            let name = writer.intern_string(&var.name);
            body.extend_from_slice(&name.to_le_bytes());
            let mut flags = 0u8;
            if var.dynamic.get() {
                flags |= FLAG_DYNAMIC;
            }
            if var.is_macro.get() {
                flags |= FLAG_MACRO;
            }
            if var.private.get() {
                flags |= FLAG_PRIVATE;
            }
            if var.constant.get() {
                flags |= FLAG_CONST;
            }
            body.push(flags);
            let doc = match &*var.doc.borrow() {
                Some(doc) => writer.intern_string(doc) as i32,
                None => -1,
            };
            body.extend_from_slice(&doc.to_le_bytes());
            let arglists = match &*var.arglists.borrow() {
                Some(a) => writer.intern_string(a) as i32,
                None => -1,
            };
            body.extend_from_slice(&arglists.to_le_bytes());
            // added / file strings are not tracked
            body.extend_from_slice(&(-1i32).to_le_bytes());
            body.extend_from_slice(&(-1i32).to_le_bytes());
            let line = var_meta_line(&var);
            body.extend_from_slice(&line.to_le_bytes());
            body.extend_from_slice(&0u32.to_le_bytes()); // col
            let root = var.root();
            if matches!(root, Value::Builtin(_)) {
                body.push(ROOT_BUILTIN);
            } else {
                body.push(ROOT_VALUE);
                writer.write_value(&mut body, &root)?;
            }
        }
        let refers = ns.refer_entries();
        body.extend_from_slice(&(refers.len() as u32).to_le_bytes());
        for (name, source_var) in refers {
            let name = writer.intern_string(&name);
            body.extend_from_slice(&name.to_le_bytes());
            let source_ns = writer.intern_string(&source_var.ns);
            body.extend_from_slice(&source_ns.to_le_bytes());
        }
        let aliases = ns.alias_entries();
        body.extend_from_slice(&(aliases.len() as u32).to_le_bytes());
        for (alias, target) in aliases {
            let alias = writer.intern_string(&alias);
            body.extend_from_slice(&alias.to_le_bytes());
            let target = writer.intern_string(&target);
            body.extend_from_slice(&target.to_le_bytes());
        }
    }
    let proto_table = writer.write_proto_table()?;

    let mut out = header();
    out.extend_from_slice(&writer.string_table());
    out.extend_from_slice(&proto_table);
    out.extend_from_slice(&body);
    Ok(out)
}

fn var_meta_line(var: &clove_core::value::Var) -> u32 {
    if let Some(Value::Map(meta)) = &*var.meta.borrow()
        && let Some(Value::Int(line)) = meta.get(&Value::keyword(None, "line"))
    {
        return *line as u32;
    }
    0
}

// ----- reader -----

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SerializeError> {
        if self.pos + n > self.data.len() {
            return Err(SerializeError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SerializeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SerializeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, SerializeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, SerializeError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, SerializeError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(i64::from_le_bytes(buf))
    }

    fn f64(&mut self) -> Result<f64, SerializeError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(f64::from_le_bytes(buf))
    }
}

/// Intermediate parsed value with unresolved table indices.
#[derive(Debug)]
enum SValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(u32),
    Symbol(i32, u32),
    Keyword(i32, u32),
    Fn {
        proto: u32,
        extras: Vec<u32>,
        ns: i32,
    },
    List(Vec<SValue>),
    Vector(Vec<SValue>),
    Map(Vec<(SValue, SValue)>),
    Set(Vec<SValue>),
    VarRef(u32, u32),
    Atom(Box<SValue>),
    Volatile(Box<SValue>),
    BigInt(u32),
    BigDecimal(u32),
    Ratio(u32),
}

struct RawProto {
    name: i32,
    arity: u8,
    variadic: bool,
    locals: u16,
    capture_slots: Vec<u16>,
    self_ref: bool,
    code: Vec<Instr>,
    lines: Vec<u32>,
    cols: Vec<u32>,
    consts: Vec<SValue>,
}

fn parse_value(cursor: &mut Cursor) -> Result<SValue, SerializeError> {
    let tag = cursor.u8()?;
    Ok(match tag {
        TAG_NIL => SValue::Nil,
        TAG_BOOL => SValue::Bool(cursor.u8()? != 0),
        TAG_INT => SValue::Int(cursor.i64()?),
        TAG_FLOAT => SValue::Float(cursor.f64()?),
        TAG_CHAR => {
            let code = cursor.u32()?;
            SValue::Char(char::from_u32(code).ok_or_else(|| {
                SerializeError::InvalidData(format!("invalid char scalar {}", code))
            })?)
        }
        TAG_STRING => SValue::Str(cursor.u32()?),
        TAG_SYMBOL => SValue::Symbol(cursor.i32()?, cursor.u32()?),
        TAG_KEYWORD => SValue::Keyword(cursor.i32()?, cursor.u32()?),
        TAG_FN => {
            let proto = cursor.u32()?;
            let extra_count = cursor.u8()? as usize;
            let mut extras = Vec::with_capacity(extra_count);
            for _ in 0..extra_count {
                extras.push(cursor.u32()?);
            }
            let ns = cursor.i32()?;
            SValue::Fn { proto, extras, ns }
        }
        TAG_LIST => SValue::List(parse_values(cursor)?),
        TAG_VECTOR => SValue::Vector(parse_values(cursor)?),
        TAG_MAP => {
            let pairs = cursor.u32()? as usize;
            let mut entries = Vec::with_capacity(pairs);
            for _ in 0..pairs {
                let k = parse_value(cursor)?;
                let v = parse_value(cursor)?;
                entries.push((k, v));
            }
            SValue::Map(entries)
        }
        TAG_SET => SValue::Set(parse_values(cursor)?),
        TAG_VAR => SValue::VarRef(cursor.u32()?, cursor.u32()?),
        TAG_ATOM => SValue::Atom(Box::new(parse_value(cursor)?)),
        TAG_VOLATILE => SValue::Volatile(Box::new(parse_value(cursor)?)),
        TAG_BIG_INT => SValue::BigInt(cursor.u32()?),
        TAG_BIG_DECIMAL => SValue::BigDecimal(cursor.u32()?),
        TAG_RATIO => SValue::Ratio(cursor.u32()?),
        other => return Err(SerializeError::UnknownTag(other)),
    })
}

fn parse_values(cursor: &mut Cursor) -> Result<Vec<SValue>, SerializeError> {
    let count = cursor.u32()? as usize;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(parse_value(cursor)?);
    }
    Ok(items)
}

fn parse_code(cursor: &mut Cursor) -> Result<(Vec<Instr>, Vec<u32>, Vec<u32>), SerializeError> {
    let code_len = cursor.u32()? as usize;
    let mut code = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        let byte = cursor.u8()?;
        let op = Op::from_byte(byte).ok_or(SerializeError::UnknownOpcode(byte))?;
        let operand = cursor.u16()?;
        code.push(Instr::new(op, operand));
    }
    let lines_len = cursor.u32()? as usize;
    let mut lines = Vec::with_capacity(lines_len);
    for _ in 0..lines_len {
        lines.push(cursor.u32()?);
    }
    let cols_len = cursor.u32()? as usize;
    let mut cols = Vec::with_capacity(cols_len);
    for _ in 0..cols_len {
        cols.push(cursor.u32()?);
    }
    Ok((code, lines, cols))
}

fn parse_string_table(cursor: &mut Cursor) -> Result<Vec<Rc<str>>, SerializeError> {
    let count = cursor.u32()? as usize;
    let mut strings = Vec::with_capacity(count);
    for _ in 0..count {
        let len = cursor.u32()? as usize;
        let bytes = cursor.take(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| SerializeError::InvalidData("invalid UTF-8 in string table".into()))?;
        strings.push(Rc::from(s));
    }
    Ok(strings)
}

fn parse_proto_table(cursor: &mut Cursor) -> Result<Vec<RawProto>, SerializeError> {
    let count = cursor.u32()? as usize;
    let mut protos = Vec::with_capacity(count);
    for _ in 0..count {
        let name = cursor.i32()?;
        let arity = cursor.u8()?;
        let variadic = cursor.u8()? != 0;
        let locals = cursor.u16()?;
        let capture_count = cursor.u16()? as usize;
        let self_ref = cursor.u8()? != 0;
        let mut capture_slots = Vec::with_capacity(capture_count);
        for _ in 0..capture_count {
            capture_slots.push(cursor.u16()?);
        }
        let (code, lines, cols) = parse_code(cursor)?;
        let consts = parse_values(cursor)?;
        protos.push(RawProto {
            name,
            arity,
            variadic,
            locals,
            capture_slots,
            self_ref,
            code,
            lines,
            cols,
            consts,
        });
    }
    Ok(protos)
}

struct Resolver {
    strings: Vec<Rc<str>>,
    protos: Vec<Option<Rc<FnProto>>>,
}

impl Resolver {
    fn string(&self, idx: u32) -> Result<Rc<str>, SerializeError> {
        self.strings
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| SerializeError::InvalidData(format!("string index {}", idx)))
    }

    fn opt_string(&self, idx: i32) -> Result<Option<Rc<str>>, SerializeError> {
        if idx < 0 {
            return Ok(None);
        }
        self.string(idx as u32).map(Some)
    }

    fn proto(&self, idx: u32) -> Result<Rc<FnProto>, SerializeError> {
        self.protos
            .get(idx as usize)
            .and_then(Clone::clone)
            .ok_or_else(|| SerializeError::InvalidData(format!("proto index {}", idx)))
    }

    /// Build protos from the highest index down: nested fns are collected
    /// after their parents, so a parent's constants only reference
    /// already-built entries.
    fn build_protos(&mut self, raw: Vec<RawProto>, env: &Env) -> Result<(), SerializeError> {
        self.protos = vec![None; raw.len()];
        for (idx, entry) in raw.into_iter().enumerate().rev() {
            let consts = entry
                .consts
                .iter()
                .map(|v| self.resolve(v, env))
                .collect::<Result<Vec<_>, _>>()?;
            let proto = FnProto {
                name: self.opt_string(entry.name)?,
                arity: entry.arity,
                variadic: entry.variadic,
                locals: entry.locals,
                capture_slots: entry.capture_slots,
                self_ref: entry.self_ref,
                code: entry.code,
                consts,
                lines: entry.lines,
                cols: entry.cols,
            };
            self.protos[idx] = Some(Rc::new(proto));
        }
        Ok(())
    }

    fn resolve(&self, value: &SValue, env: &Env) -> Result<Value, SerializeError> {
        Ok(match value {
            SValue::Nil => Value::Nil,
            SValue::Bool(b) => Value::Bool(*b),
            SValue::Int(i) => Value::Int(*i),
            SValue::Float(f) => Value::Float(*f),
            SValue::Char(c) => Value::Char(*c),
            SValue::Str(idx) => Value::Str(self.string(*idx)?),
            SValue::Symbol(ns, name) => {
                Value::symbol(self.opt_string(*ns)?, self.string(*name)?)
            }
            SValue::Keyword(ns, name) => {
                Value::keyword(self.opt_string(*ns)?, self.string(*name)?)
            }
            SValue::Fn { proto, extras, ns } => {
                let proto = self.proto(*proto)?;
                let extras = extras
                    .iter()
                    .map(|e| self.proto(*e))
                    .collect::<Result<Vec<_>, _>>()?;
                let ns = self
                    .opt_string(*ns)?
                    .unwrap_or_else(|| Rc::from(crate::env::USER_NS));
                Value::Fn(Rc::new(Closure {
                    proto,
                    extras,
                    captures: std::cell::RefCell::new(Vec::new()),
                    ns,
                }))
            }
            SValue::List(items) => Value::list(self.resolve_all(items, env)?),
            SValue::Vector(items) => Value::vector(self.resolve_all(items, env)?),
            SValue::Map(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    out.push((self.resolve(k, env)?, self.resolve(v, env)?));
                }
                Value::map(out)
            }
            SValue::Set(items) => Value::set(self.resolve_all(items, env)?),
            SValue::VarRef(ns, name) => {
                let ns = self.string(*ns)?;
                let name = self.string(*name)?;
                Value::Var(env.intern(&ns, name))
            }
            SValue::Atom(inner) => Value::Atom(Rc::new(std::cell::RefCell::new(
                self.resolve(inner, env)?,
            ))),
            SValue::Volatile(inner) => Value::Volatile(Rc::new(std::cell::RefCell::new(
                self.resolve(inner, env)?,
            ))),
            SValue::BigInt(idx) => Value::BigInt(self.string(*idx)?),
            SValue::BigDecimal(idx) => Value::BigDecimal(self.string(*idx)?),
            SValue::Ratio(idx) => Value::Ratio(self.string(*idx)?),
        })
    }

    fn resolve_all(&self, items: &[SValue], env: &Env) -> Result<Vec<Value>, SerializeError> {
        items.iter().map(|v| self.resolve(v, env)).collect()
    }
}

fn parse_header(cursor: &mut Cursor) -> Result<(), SerializeError> {
    let magic = cursor.take(4)?;
    if magic != MAGIC {
        return Err(SerializeError::InvalidMagic);
    }
    let version = cursor.u16()?;
    if version != VERSION {
        return Err(SerializeError::UnsupportedVersion(version));
    }
    let _flags = cursor.u16()?;
    Ok(())
}

/// Load an AOT artefact back into an executable chunk. Var references in
/// constant pools are interned against `env`.
pub fn read_artifact(bytes: &[u8], env: &Env) -> Result<Chunk, SerializeError> {
    let mut cursor = Cursor::new(bytes);
    parse_header(&mut cursor)?;
    let strings = parse_string_table(&mut cursor)?;
    let raw_protos = parse_proto_table(&mut cursor)?;
    let (code, lines, cols) = parse_code(&mut cursor)?;
    let consts = parse_values(&mut cursor)?;

    let mut resolver = Resolver {
        strings,
        protos: Vec::new(),
    };
    resolver.build_protos(raw_protos, env)?;
    let consts = resolver.resolve_all(&consts, env)?;
    Ok(Chunk {
        code,
        consts,
        lines,
        cols,
        cur_line: 0,
        cur_col: 0,
    })
}

/// Load an environment snapshot. Namespaces and vars are created in a
/// first pass; refers and aliases resolve in a second pass once every
/// namespace exists. A builtin sentinel leaves the already-registered
/// root untouched.
pub fn load_snapshot(bytes: &[u8], env: &Env) -> Result<(), SerializeError> {
    let mut cursor = Cursor::new(bytes);
    parse_header(&mut cursor)?;
    let strings = parse_string_table(&mut cursor)?;

    // The namespace body precedes nothing else, but the proto table sits
    // between the string table and the body on the wire.
    let raw_protos = parse_proto_table(&mut cursor)?;
    let mut resolver = Resolver {
        strings,
        protos: Vec::new(),
    };
    resolver.build_protos(raw_protos, env)?;

    struct PendingRefer {
        ns: Rc<str>,
        name: Rc<str>,
        source_ns: Rc<str>,
    }
    struct PendingAlias {
        ns: Rc<str>,
        alias: Rc<str>,
        target: Rc<str>,
    }
    let mut refers: Vec<PendingRefer> = Vec::new();
    let mut aliases: Vec<PendingAlias> = Vec::new();

    let ns_count = cursor.u32()? as usize;
    for _ in 0..ns_count {
        let ns_name = resolver.string(cursor.u32()?)?;
        let ns = env.find_or_create_namespace(&ns_name);
        let var_count = cursor.u32()? as usize;
        for _ in 0..var_count {
            let name = resolver.string(cursor.u32()?)?;
            let flags = cursor.u8()?;
            let doc = cursor.i32()?;
            let arglists = cursor.i32()?;
            let _added = cursor.i32()?;
            let _file = cursor.i32()?;
            let line = cursor.u32()?;
            let _col = cursor.u32()?;
            let root_marker = cursor.u8()?;
            let var = ns.intern(name);
            var.dynamic.set(flags & FLAG_DYNAMIC != 0);
            var.is_macro.set(flags & FLAG_MACRO != 0);
            var.private.set(flags & FLAG_PRIVATE != 0);
            var.constant.set(flags & FLAG_CONST != 0);
            *var.doc.borrow_mut() = resolver.opt_string(doc)?;
            *var.arglists.borrow_mut() = resolver.opt_string(arglists)?;
            if line != 0 {
                *var.meta.borrow_mut() = Some(Value::map(vec![(
                    Value::keyword(None, "line"),
                    Value::Int(line as i64),
                )]));
            }
            match root_marker {
                ROOT_BUILTIN => {
                    // preserve whatever root the host registered
                }
                ROOT_VALUE => {
                    let root = parse_value(&mut cursor)?;
                    var.bind_root(resolver.resolve(&root, env)?);
                }
                other => {
                    return Err(SerializeError::InvalidData(format!(
                        "unknown root marker {}",
                        other
                    )));
                }
            }
        }
        let refer_count = cursor.u32()? as usize;
        for _ in 0..refer_count {
            let name = resolver.string(cursor.u32()?)?;
            let source_ns = resolver.string(cursor.u32()?)?;
            refers.push(PendingRefer {
                ns: ns_name.clone(),
                name,
                source_ns,
            });
        }
        let alias_count = cursor.u32()? as usize;
        for _ in 0..alias_count {
            let alias = resolver.string(cursor.u32()?)?;
            let target = resolver.string(cursor.u32()?)?;
            aliases.push(PendingAlias {
                ns: ns_name.clone(),
                alias,
                target,
            });
        }
    }

    // Second pass: every namespace now exists.
    for pending in refers {
        let source = env
            .find_namespace(&pending.source_ns)
            .ok_or_else(|| {
                SerializeError::InvalidData(format!(
                    "refer source namespace {} missing",
                    pending.source_ns
                ))
            })?;
        let var = source.resolve(&pending.name).ok_or_else(|| {
            SerializeError::InvalidData(format!(
                "refer target {}/{} missing",
                pending.source_ns, pending.name
            ))
        })?;
        env.find_or_create_namespace(&pending.ns)
            .refer(pending.name, var);
    }
    for pending in aliases {
        env.find_or_create_namespace(&pending.ns)
            .set_alias(pending.alias, pending.target);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::ArenaGc;
    use clove_core::node::{FnArity, FnNode};
    use clove_core::value::TreeClosure;

    fn test_env() -> Rc<Env> {
        Env::new(Rc::new(ArenaGc::new()))
    }

    fn round_trip(value: Value) -> Value {
        let mut chunk = Chunk::new();
        chunk.add_const(value);
        chunk.emit(Op::Const, 0);
        let bytes = write_artifact(&chunk).unwrap();
        let env = test_env();
        let back = read_artifact(&bytes, &env).unwrap();
        back.consts[0].clone()
    }

    #[test]
    fn test_primitive_round_trip() {
        assert_eq!(round_trip(Value::Nil), Value::Nil);
        assert_eq!(round_trip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(round_trip(Value::Int(-42)), Value::Int(-42));
        assert_eq!(round_trip(Value::Float(2.5)), Value::Float(2.5));
        assert_eq!(round_trip(Value::Char('λ')), Value::Char('λ'));
        assert_eq!(
            round_trip(Value::Str("hello".into())),
            Value::Str("hello".into())
        );
    }

    #[test]
    fn test_name_and_collection_round_trip() {
        let value = Value::map(vec![
            (
                Value::keyword(Some("app".into()), "id"),
                Value::vector(vec![Value::Int(1), Value::symbol(None, "x")]),
            ),
            (
                Value::keyword(None, "tags"),
                Value::set(vec![Value::Str("a".into())]),
            ),
        ]);
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_big_literal_text_round_trip() {
        assert_eq!(
            round_trip(Value::BigInt("123456789012345678901234567890".into())),
            Value::BigInt("123456789012345678901234567890".into())
        );
        assert_eq!(round_trip(Value::Ratio("22/7".into())), Value::Ratio("22/7".into()));
    }

    #[test]
    fn test_fn_round_trip_with_nested_proto() {
        // inner proto referenced from outer proto's constant pool
        let inner = Rc::new(FnProto {
            name: Some("inner".into()),
            arity: 0,
            variadic: false,
            locals: 0,
            capture_slots: vec![],
            self_ref: false,
            code: vec![Instr::new(Op::Nil, 0), Instr::new(Op::Ret, 0)],
            consts: vec![],
            lines: vec![1, 1],
            cols: vec![2, 2],
        });
        let inner_fn = Value::Fn(Rc::new(Closure {
            proto: inner,
            extras: vec![],
            captures: std::cell::RefCell::new(vec![]),
            ns: "user".into(),
        }));
        let outer = Rc::new(FnProto {
            name: Some("outer".into()),
            arity: 1,
            variadic: true,
            locals: 3,
            capture_slots: vec![0, 2],
            self_ref: true,
            code: vec![Instr::new(Op::Const, 0), Instr::new(Op::Ret, 0)],
            consts: vec![inner_fn],
            lines: vec![3, 3],
            cols: vec![1, 1],
        });
        let outer_fn = Value::Fn(Rc::new(Closure {
            proto: outer,
            extras: vec![],
            captures: std::cell::RefCell::new(vec![]),
            ns: "lib".into(),
        }));
        let back = round_trip(outer_fn);
        let Value::Fn(closure) = back else {
            panic!("expected fn");
        };
        assert_eq!(closure.proto.name.as_deref(), Some("outer"));
        assert_eq!(closure.proto.arity, 1);
        assert!(closure.proto.variadic);
        assert!(closure.proto.self_ref);
        assert_eq!(closure.proto.capture_slots, vec![0, 2]);
        assert_eq!(&*closure.ns, "lib");
        let Value::Fn(inner) = &closure.proto.consts[0] else {
            panic!("expected nested fn");
        };
        assert_eq!(inner.proto.name.as_deref(), Some("inner"));
        assert_eq!(inner.proto.lines, vec![1, 1]);
    }

    #[test]
    fn test_var_ref_interns_on_load() {
        let env = test_env();
        let var = env.intern("lib", "x".into());
        let mut chunk = Chunk::new();
        chunk.add_const(Value::Var(var));
        let bytes = write_artifact(&chunk).unwrap();

        let env2 = test_env();
        let back = read_artifact(&bytes, &env2).unwrap();
        let Value::Var(v) = &back.consts[0] else {
            panic!("expected var");
        };
        assert_eq!(&*v.ns, "lib");
        assert_eq!(&*v.name, "x");
        // same interned var as direct resolution
        assert!(Rc::ptr_eq(v, &env2.intern("lib", "x".into())));
    }

    #[test]
    fn test_tree_closure_refuses() {
        let tree = Value::TreeFn(Rc::new(TreeClosure {
            node: Rc::new(FnNode {
                name: None,
                arities: vec![FnArity {
                    params: vec![],
                    variadic: false,
                    rest_name: None,
                    nlocals: 0,
                    body: vec![],
                }],
                captures: vec![],
                line: 0,
                col: 0,
            }),
            captures: std::cell::RefCell::new(vec![]),
            ns: "user".into(),
        }));
        let mut chunk = Chunk::new();
        chunk.add_const(tree);
        assert!(matches!(
            write_artifact(&chunk),
            Err(SerializeError::TreeClosureNotSerializable)
        ));
    }

    #[test]
    fn test_unknown_tag_fails() {
        let mut chunk = Chunk::new();
        chunk.add_const(Value::Int(1));
        let mut bytes = write_artifact(&chunk).unwrap();
        // corrupt the tag byte of the single constant (last 10 bytes:
        // count u32 + tag + i64 payload)
        let tag_pos = bytes.len() - 9;
        bytes[tag_pos] = 0xEE;
        let env = test_env();
        assert!(matches!(
            read_artifact(&bytes, &env),
            Err(SerializeError::UnknownTag(0xEE))
        ));
    }

    #[test]
    fn test_truncated_fails() {
        let mut chunk = Chunk::new();
        chunk.add_const(Value::Str("hello world".into()));
        let bytes = write_artifact(&chunk).unwrap();
        let env = test_env();
        for len in [0, 3, bytes.len() / 2, bytes.len() - 1] {
            assert!(read_artifact(&bytes[..len], &env).is_err());
        }
    }

    #[test]
    fn test_bad_magic_fails() {
        let env = test_env();
        assert!(matches!(
            read_artifact(b"NOPE\x01\x00\x00\x00", &env),
            Err(SerializeError::InvalidMagic)
        ));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let env = test_env();
        let var = env.intern("app.core", "config".into());
        var.bind_root(Value::map(vec![(
            Value::keyword(None, "port"),
            Value::Int(8080),
        )]));
        var.dynamic.set(true);
        *var.doc.borrow_mut() = Some("app config".into());
        let helper = env.intern("app.util", "helper".into());
        helper.bind_root(Value::Int(7));
        env.find_or_create_namespace("app.core")
            .refer("helper".into(), helper);
        env.find_or_create_namespace("app.core")
            .set_alias("u".into(), "app.util".into());

        let bytes = write_snapshot(&env).unwrap();

        let env2 = test_env();
        load_snapshot(&bytes, &env2).unwrap();
        let var2 = env2.find_namespace("app.core").unwrap().resolve("config").unwrap();
        assert!(var2.dynamic.get());
        assert_eq!(var2.doc.borrow().as_deref(), Some("app config"));
        assert_eq!(
            var2.root(),
            Value::map(vec![(Value::keyword(None, "port"), Value::Int(8080))])
        );
        // refer resolves across namespaces
        let referred = env2
            .find_namespace("app.core")
            .unwrap()
            .resolve("helper")
            .unwrap();
        assert_eq!(referred.root(), Value::Int(7));
        // alias table restored
        env2.set_current("app.core".into());
        assert!(env2.resolve_qualified("u", "helper").is_some());
    }

    #[test]
    fn test_snapshot_builtin_sentinel() {
        let env = test_env();
        crate::builtins::install(&env);
        let bytes = write_snapshot(&env).unwrap();

        let env2 = test_env();
        crate::builtins::install(&env2);
        load_snapshot(&bytes, &env2).unwrap();
        // the builtin root registered before the load is preserved
        let plus = env2.resolve("+").unwrap();
        assert!(matches!(plus.root(), Value::Builtin(_)));
    }

    #[test]
    fn test_captured_closure_refuses() {
        let proto = Rc::new(FnProto {
            name: None,
            arity: 0,
            variadic: false,
            locals: 1,
            capture_slots: vec![0],
            self_ref: false,
            code: vec![],
            consts: vec![],
            lines: vec![],
            cols: vec![],
        });
        let closure = Value::Fn(Rc::new(Closure {
            proto,
            extras: vec![],
            captures: std::cell::RefCell::new(vec![Value::Int(1)]),
            ns: "user".into(),
        }));
        let mut chunk = Chunk::new();
        chunk.add_const(closure);
        assert!(matches!(
            write_artifact(&chunk),
            Err(SerializeError::CapturedClosure)
        ));
    }
}
