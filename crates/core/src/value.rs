//! Runtime values for Clove
//!
//! `Value` is the single currency of the whole pipeline: constants in
//! compiled chunks, operand-stack slots, var roots, and tree-walk results
//! are all `Value`s. Payloads that are bigger than a machine word are
//! `Rc`-shared so duplicating a value is a pointer bump; the VM is
//! single-threaded cooperative, so `Rc` (not `Arc`) is the right cell.
//!
//! Collections are logically persistent: every "mutating" operation
//! produces a new value backed by a fresh vector. Identity is never used
//! where equality is observable.

use crate::chunk::FnProto;
use crate::error::RuntimeError;
use crate::node::FnNode;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// A possibly namespace-qualified name. Symbols and keywords share this
/// shape; two are equal iff both parts are byte-equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub ns: Option<Rc<str>>,
    pub name: Rc<str>,
}

impl Symbol {
    pub fn simple(name: impl Into<Rc<str>>) -> Self {
        Symbol {
            ns: None,
            name: name.into(),
        }
    }

    pub fn qualified(ns: impl Into<Rc<str>>, name: impl Into<Rc<str>>) -> Self {
        Symbol {
            ns: Some(ns.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ns {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Persistent list. The backing vector is immutable once constructed.
#[derive(Debug, Clone)]
pub struct PersistentList {
    pub items: Vec<Value>,
    pub meta: Option<Value>,
}

/// Persistent vector.
#[derive(Debug, Clone)]
pub struct PersistentVector {
    pub items: Vec<Value>,
    pub meta: Option<Value>,
}

/// Array map: insertion-ordered key/value pairs, equality order-independent.
#[derive(Debug, Clone)]
pub struct PersistentMap {
    pub entries: Vec<(Value, Value)>,
    pub meta: Option<Value>,
}

impl PersistentMap {
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// New map with `key` bound to `value` (replacing any existing pair).
    pub fn assoc(&self, key: Value, value: Value) -> PersistentMap {
        let mut entries = self.entries.clone();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(pair) => pair.1 = value,
            None => entries.push((key, value)),
        }
        PersistentMap {
            entries,
            meta: self.meta.clone(),
        }
    }

    pub fn dissoc(&self, key: &Value) -> PersistentMap {
        PersistentMap {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| k != key)
                .cloned()
                .collect(),
            meta: self.meta.clone(),
        }
    }
}

/// Hash set (array-backed; equality order-independent, no duplicates).
#[derive(Debug, Clone)]
pub struct PersistentSet {
    pub items: Vec<Value>,
    pub meta: Option<Value>,
}

impl PersistentSet {
    pub fn contains(&self, value: &Value) -> bool {
        self.items.iter().any(|v| v == value)
    }

    pub fn conj(&self, value: Value) -> PersistentSet {
        if self.contains(&value) {
            return self.clone();
        }
        let mut items = self.items.clone();
        items.push(value);
        PersistentSet {
            items,
            meta: self.meta.clone(),
        }
    }
}

/// A named, namespaced reference cell.
///
/// The root is always writable (`bind_root`); dynamic vars additionally
/// carry a strictly LIFO per-thread binding stack. Under the cooperative
/// single-thread model the stack is process-wide.
#[derive(Debug)]
pub struct Var {
    pub name: Rc<str>,
    pub ns: Rc<str>,
    root: RefCell<Value>,
    pub dynamic: Cell<bool>,
    pub is_macro: Cell<bool>,
    pub private: Cell<bool>,
    pub constant: Cell<bool>,
    pub doc: RefCell<Option<Rc<str>>>,
    pub arglists: RefCell<Option<Rc<str>>>,
    pub meta: RefCell<Option<Value>>,
    bindings: RefCell<Vec<Value>>,
}

impl Var {
    pub fn new(ns: Rc<str>, name: Rc<str>) -> Self {
        Var {
            name,
            ns,
            root: RefCell::new(Value::Nil),
            dynamic: Cell::new(false),
            is_macro: Cell::new(false),
            private: Cell::new(false),
            constant: Cell::new(false),
            doc: RefCell::new(None),
            arglists: RefCell::new(None),
            meta: RefCell::new(None),
            bindings: RefCell::new(Vec::new()),
        }
    }

    /// Current value: top of the binding stack if any, else the root.
    pub fn deref(&self) -> Value {
        if let Some(v) = self.bindings.borrow().last() {
            return v.clone();
        }
        self.root.borrow().clone()
    }

    pub fn root(&self) -> Value {
        self.root.borrow().clone()
    }

    pub fn bind_root(&self, value: Value) {
        *self.root.borrow_mut() = value;
    }

    pub fn push_binding(&self, value: Value) {
        self.bindings.borrow_mut().push(value);
    }

    pub fn pop_binding(&self) -> Option<Value> {
        self.bindings.borrow_mut().pop()
    }

    pub fn has_binding(&self) -> bool {
        !self.bindings.borrow().is_empty()
    }

    /// `set!` writes through to the innermost binding frame. A var with no
    /// active binding cannot be `set!`.
    pub fn set(&self, value: Value) -> Result<(), RuntimeError> {
        let mut bindings = self.bindings.borrow_mut();
        match bindings.last_mut() {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(crate::error::value_error(format!(
                "can't set! {}/{}: var is not thread-bound",
                self.ns, self.name
            ))),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.ns, self.name)
    }
}

/// Native function signature. Builtins that need to call back into user
/// code re-enter the current VM through the per-thread VM pointer rather
/// than taking a context parameter.
pub type NativeFn = fn(&[Value]) -> Result<Value, RuntimeError>;

/// A host-implemented function registered in a namespace.
pub struct BuiltinFn {
    pub name: Rc<str>,
    pub f: NativeFn,
}

impl fmt::Debug for BuiltinFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuiltinFn({})", self.name)
    }
}

/// A bytecode closure: compiled body plus materialised captures.
///
/// `captures` is behind a `RefCell` because `letfn` patches the arrays of
/// mutually recursive closures after all of them are bound; each array is
/// freshly owned so the object graph stays acyclic.
#[derive(Debug)]
pub struct Closure {
    pub proto: Rc<FnProto>,
    pub extras: Vec<Rc<FnProto>>,
    pub captures: RefCell<Vec<Value>>,
    pub ns: Rc<str>,
}

impl Closure {
    pub fn name(&self) -> Rc<str> {
        self.proto
            .name
            .clone()
            .unwrap_or_else(|| Rc::from("anonymous"))
    }

    /// Select the body for an argument count: exact fixed-arity match wins
    /// over any variadic arity.
    pub fn select_arity(&self, argc: usize) -> Option<Rc<FnProto>> {
        for proto in std::iter::once(&self.proto).chain(self.extras.iter()) {
            if !proto.variadic && proto.arity as usize == argc {
                return Some(proto.clone());
            }
        }
        for proto in std::iter::once(&self.proto).chain(self.extras.iter()) {
            if proto.variadic && argc >= proto.arity as usize {
                return Some(proto.clone());
            }
        }
        None
    }
}

/// A tree-walk closure: same shape as `Closure` with the backing field
/// interpreted as an analysed fn body plus captured values. Never
/// serializable.
#[derive(Debug)]
pub struct TreeClosure {
    pub node: Rc<FnNode>,
    pub captures: RefCell<Vec<Value>>,
    pub ns: Rc<str>,
}

/// A protocol method: per-type implementation table with a monomorphic
/// inline cache guarded by a generation counter (`extend-type` bumps it).
#[derive(Debug)]
pub struct ProtocolFn {
    pub protocol: Rc<str>,
    pub method: Rc<str>,
    pub ns: Rc<str>,
    pub impls: RefCell<Vec<(Rc<str>, Value)>>,
    pub generation: Cell<u32>,
    pub cache: RefCell<Option<ProtoCacheEntry>>,
}

#[derive(Debug, Clone)]
pub struct ProtoCacheEntry {
    pub type_key: Rc<str>,
    pub generation: u32,
    pub method: Value,
}

impl ProtocolFn {
    pub fn new(protocol: Rc<str>, method: Rc<str>, ns: Rc<str>) -> Self {
        ProtocolFn {
            protocol,
            method,
            ns,
            impls: RefCell::new(Vec::new()),
            generation: Cell::new(0),
            cache: RefCell::new(None),
        }
    }

    /// Fully qualified method symbol used by extend-via-metadata lookup.
    pub fn qualified_symbol(&self) -> Symbol {
        Symbol::qualified(self.ns.clone(), self.method.clone())
    }

    pub fn extend(&self, type_key: Rc<str>, method: Value) {
        let mut impls = self.impls.borrow_mut();
        match impls.iter_mut().find(|(k, _)| *k == type_key) {
            Some(entry) => entry.1 = method,
            None => impls.push((type_key, method)),
        }
        self.generation.set(self.generation.get().wrapping_add(1));
    }

    pub fn lookup(&self, type_key: &str) -> Option<Value> {
        self.impls
            .borrow()
            .iter()
            .find(|(k, _)| &**k == type_key)
            .map(|(_, m)| m.clone())
    }
}

/// A multimethod: dispatch fn plus dispatch-value → method table, with a
/// two-level cache (argument identity, then dispatch value), both
/// invalidated when `defmethod` bumps the generation.
#[derive(Debug)]
pub struct MultiFn {
    pub name: Rc<str>,
    pub dispatch: RefCell<Value>,
    pub methods: RefCell<Vec<(Value, Value)>>,
    pub generation: Cell<u32>,
    pub value_cache: RefCell<Option<MultiCacheEntry>>,
    pub ident_cache: RefCell<Option<IdentCacheEntry>>,
    /// Test probe: dispatches served from either cache level.
    pub cache_hits: Cell<u64>,
}

#[derive(Debug, Clone)]
pub struct MultiCacheEntry {
    pub dispatch_value: Value,
    pub generation: u32,
    pub method: Value,
}

#[derive(Debug, Clone)]
pub struct IdentCacheEntry {
    pub key: usize,
    pub generation: u32,
    pub method: Value,
}

impl MultiFn {
    pub fn new(name: Rc<str>, dispatch: Value) -> Self {
        MultiFn {
            name,
            dispatch: RefCell::new(dispatch),
            methods: RefCell::new(Vec::new()),
            generation: Cell::new(0),
            value_cache: RefCell::new(None),
            ident_cache: RefCell::new(None),
            cache_hits: Cell::new(0),
        }
    }

    pub fn add_method(&self, dispatch_value: Value, method: Value) {
        let mut methods = self.methods.borrow_mut();
        match methods.iter_mut().find(|(v, _)| *v == dispatch_value) {
            Some(entry) => entry.1 = method,
            None => methods.push((dispatch_value, method)),
        }
        self.generation.set(self.generation.get().wrapping_add(1));
    }

    pub fn method_for(&self, dispatch_value: &Value) -> Option<Value> {
        let methods = self.methods.borrow();
        if let Some((_, m)) = methods.iter().find(|(v, _)| v == dispatch_value) {
            return Some(m.clone());
        }
        // :default fallback
        let default_key = Value::keyword(None, "default");
        methods
            .iter()
            .find(|(v, _)| *v == default_key)
            .map(|(_, m)| m.clone())
    }
}

/// A lazy sequence cell: an unrealised thunk or a memoised value.
#[derive(Debug)]
pub struct LazySeq {
    pub thunk: RefCell<Option<Value>>,
    pub value: RefCell<Option<Value>>,
}

impl LazySeq {
    pub fn new(thunk: Value) -> Self {
        LazySeq {
            thunk: RefCell::new(Some(thunk)),
            value: RefCell::new(None),
        }
    }

    pub fn realized(&self) -> bool {
        self.value.borrow().is_some()
    }
}

/// Stable tag discriminator exposed to the analyzer, VM dispatch and the
/// serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Nil,
    Bool,
    Int,
    Float,
    Char,
    String,
    Symbol,
    Keyword,
    List,
    Vector,
    Map,
    Set,
    Var,
    Atom,
    Volatile,
    Fn,
    Builtin,
    ProtocolFn,
    MultiFn,
    LazySeq,
    TreeFn,
    BigInt,
    BigDecimal,
    Ratio,
}

/// The tagged runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(Rc<str>),
    Symbol(Rc<Symbol>),
    Keyword(Rc<Symbol>),
    List(Rc<PersistentList>),
    Vector(Rc<PersistentVector>),
    Map(Rc<PersistentMap>),
    Set(Rc<PersistentSet>),
    Var(Rc<Var>),
    Atom(Rc<RefCell<Value>>),
    Volatile(Rc<RefCell<Value>>),
    Fn(Rc<Closure>),
    Builtin(Rc<BuiltinFn>),
    ProtocolFn(Rc<ProtocolFn>),
    MultiFn(Rc<MultiFn>),
    LazySeq(Rc<LazySeq>),
    TreeFn(Rc<TreeClosure>),
    /// Arbitrary-precision literals carried as source text until a
    /// big-number contract exists; arithmetic on them is a value error.
    BigInt(Rc<str>),
    BigDecimal(Rc<str>),
    Ratio(Rc<str>),
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::Nil => Tag::Nil,
            Value::Bool(_) => Tag::Bool,
            Value::Int(_) => Tag::Int,
            Value::Float(_) => Tag::Float,
            Value::Char(_) => Tag::Char,
            Value::Str(_) => Tag::String,
            Value::Symbol(_) => Tag::Symbol,
            Value::Keyword(_) => Tag::Keyword,
            Value::List(_) => Tag::List,
            Value::Vector(_) => Tag::Vector,
            Value::Map(_) => Tag::Map,
            Value::Set(_) => Tag::Set,
            Value::Var(_) => Tag::Var,
            Value::Atom(_) => Tag::Atom,
            Value::Volatile(_) => Tag::Volatile,
            Value::Fn(_) => Tag::Fn,
            Value::Builtin(_) => Tag::Builtin,
            Value::ProtocolFn(_) => Tag::ProtocolFn,
            Value::MultiFn(_) => Tag::MultiFn,
            Value::LazySeq(_) => Tag::LazySeq,
            Value::TreeFn(_) => Tag::TreeFn,
            Value::BigInt(_) => Tag::BigInt,
            Value::BigDecimal(_) => Tag::BigDecimal,
            Value::Ratio(_) => Tag::Ratio,
        }
    }

    /// Type key used for protocol dispatch and `(type x)`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "Boolean",
            Value::Int(_) => "Long",
            Value::Float(_) => "Double",
            Value::Char(_) => "Character",
            Value::Str(_) => "String",
            Value::Symbol(_) => "Symbol",
            Value::Keyword(_) => "Keyword",
            Value::List(_) => "PersistentList",
            Value::Vector(_) => "PersistentVector",
            Value::Map(_) => "PersistentArrayMap",
            Value::Set(_) => "PersistentHashSet",
            Value::Var(_) => "Var",
            Value::Atom(_) => "Atom",
            Value::Volatile(_) => "Volatile",
            Value::Fn(_) | Value::Builtin(_) | Value::TreeFn(_) => "Fn",
            Value::ProtocolFn(_) => "ProtocolFn",
            Value::MultiFn(_) => "MultiFn",
            Value::LazySeq(_) => "LazySeq",
            Value::BigInt(_) => "BigInt",
            Value::BigDecimal(_) => "BigDecimal",
            Value::Ratio(_) => "Ratio",
        }
    }

    /// Exactly `nil` and `false` are falsy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Fn(_)
                | Value::Builtin(_)
                | Value::TreeFn(_)
                | Value::ProtocolFn(_)
                | Value::MultiFn(_)
                | Value::Keyword(_)
                | Value::Map(_)
                | Value::Set(_)
                | Value::Vector(_)
                | Value::Var(_)
        )
    }

    // Constructors

    pub fn string(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn symbol(ns: Option<Rc<str>>, name: impl Into<Rc<str>>) -> Value {
        Value::Symbol(Rc::new(Symbol {
            ns,
            name: name.into(),
        }))
    }

    pub fn keyword(ns: Option<Rc<str>>, name: impl Into<Rc<str>>) -> Value {
        Value::Keyword(Rc::new(Symbol {
            ns,
            name: name.into(),
        }))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(PersistentList { items, meta: None }))
    }

    pub fn vector(items: Vec<Value>) -> Value {
        Value::Vector(Rc::new(PersistentVector { items, meta: None }))
    }

    pub fn map(entries: Vec<(Value, Value)>) -> Value {
        Value::Map(Rc::new(PersistentMap {
            entries,
            meta: None,
        }))
    }

    pub fn set(items: Vec<Value>) -> Value {
        let mut unique: Vec<Value> = Vec::with_capacity(items.len());
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        Value::Set(Rc::new(PersistentSet {
            items: unique,
            meta: None,
        }))
    }

    /// Elements of a sequential value, if it has them without realisation.
    pub fn seq_items(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(&l.items),
            Value::Vector(v) => Some(&v.items),
            _ => None,
        }
    }

    /// Metadata attached to this value, when the kind supports it.
    pub fn meta(&self) -> Option<Value> {
        match self {
            Value::List(l) => l.meta.clone(),
            Value::Vector(v) => v.meta.clone(),
            Value::Map(m) => m.meta.clone(),
            Value::Set(s) => s.meta.clone(),
            Value::Var(v) => v.meta.borrow().clone(),
            _ => None,
        }
    }

    /// New value of the same shape carrying `meta`. Errors for kinds that
    /// cannot hold metadata.
    pub fn with_meta(&self, meta: Value) -> Result<Value, RuntimeError> {
        let meta = Some(meta);
        match self {
            Value::List(l) => Ok(Value::List(Rc::new(PersistentList {
                items: l.items.clone(),
                meta,
            }))),
            Value::Vector(v) => Ok(Value::Vector(Rc::new(PersistentVector {
                items: v.items.clone(),
                meta,
            }))),
            Value::Map(m) => Ok(Value::Map(Rc::new(PersistentMap {
                entries: m.entries.clone(),
                meta,
            }))),
            Value::Set(s) => Ok(Value::Set(Rc::new(PersistentSet {
                items: s.items.clone(),
                meta,
            }))),
            other => Err(crate::error::type_error(format!(
                "with-meta not supported on {}",
                other.type_name()
            ))),
        }
    }

    /// Readable representation (what `pr-str` produces).
    pub fn pr_str(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, true);
        out
    }

    fn write_repr(&self, out: &mut String, readable: bool) {
        use std::fmt::Write;
        match self {
            Value::Nil => out.push_str("nil"),
            Value::Bool(b) => {
                let _ = write!(out, "{}", b);
            }
            Value::Int(i) => {
                let _ = write!(out, "{}", i);
            }
            Value::Float(f) => out.push_str(&format_float(*f)),
            Value::Char(c) => {
                if readable {
                    out.push_str(&format_char(*c));
                } else {
                    out.push(*c);
                }
            }
            Value::Str(s) => {
                if readable {
                    out.push('"');
                    for c in s.chars() {
                        match c {
                            '"' => out.push_str("\\\""),
                            '\\' => out.push_str("\\\\"),
                            '\n' => out.push_str("\\n"),
                            '\t' => out.push_str("\\t"),
                            '\r' => out.push_str("\\r"),
                            other => out.push(other),
                        }
                    }
                    out.push('"');
                } else {
                    out.push_str(s);
                }
            }
            Value::Symbol(s) => {
                let _ = write!(out, "{}", s);
            }
            Value::Keyword(s) => {
                let _ = write!(out, ":{}", s);
            }
            Value::List(l) => write_seq(out, "(", ")", &l.items, readable),
            Value::Vector(v) => write_seq(out, "[", "]", &v.items, readable),
            Value::Map(m) => {
                out.push('{');
                for (i, (k, v)) in m.entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    k.write_repr(out, readable);
                    out.push(' ');
                    v.write_repr(out, readable);
                }
                out.push('}');
            }
            Value::Set(s) => write_seq(out, "#{", "}", &s.items, readable),
            Value::Var(v) => {
                let _ = write!(out, "#'{}/{}", v.ns, v.name);
            }
            Value::Atom(a) => {
                out.push_str("#atom[");
                a.borrow().write_repr(out, readable);
                out.push(']');
            }
            Value::Volatile(v) => {
                out.push_str("#volatile[");
                v.borrow().write_repr(out, readable);
                out.push(']');
            }
            Value::Fn(c) => {
                let _ = write!(out, "#fn[{}]", c.name());
            }
            Value::Builtin(b) => {
                let _ = write!(out, "#fn[{}]", b.name);
            }
            Value::TreeFn(t) => {
                let name = t.node.name.clone().unwrap_or_else(|| Rc::from("anonymous"));
                let _ = write!(out, "#fn[{}]", name);
            }
            Value::ProtocolFn(p) => {
                let _ = write!(out, "#protocol-fn[{}/{}]", p.protocol, p.method);
            }
            Value::MultiFn(m) => {
                let _ = write!(out, "#multi-fn[{}]", m.name);
            }
            Value::LazySeq(l) => match &*l.value.borrow() {
                Some(v) => v.write_repr(out, readable),
                None => out.push_str("#lazy-seq[pending]"),
            },
            Value::BigInt(text) => {
                let _ = write!(out, "{}N", text);
            }
            Value::BigDecimal(text) => {
                let _ = write!(out, "{}M", text);
            }
            Value::Ratio(text) => out.push_str(text),
        }
    }
}

fn write_seq(out: &mut String, open: &str, close: &str, items: &[Value], readable: bool) {
    out.push_str(open);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        item.write_repr(out, readable);
    }
    out.push_str(close);
}

/// Float text: whole numbers keep a trailing `.0`; the symbolic floats
/// round-trip through the reader's `##` syntax.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "##NaN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "##Inf" } else { "##-Inf" }.to_string();
    }
    if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

/// Character literal text for printing.
pub fn format_char(c: char) -> String {
    match c {
        '\n' => "\\newline".to_string(),
        ' ' => "\\space".to_string(),
        '\t' => "\\tab".to_string(),
        '\r' => "\\return".to_string(),
        '\u{8}' => "\\backspace".to_string(),
        '\u{c}' => "\\formfeed".to_string(),
        other => format!("\\{}", other),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_repr(&mut out, false);
        write!(f, "{}", out)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            // Numeric cross-equality: integer equals float when the float
            // is exactly that integer.
            (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => {
                f.fract() == 0.0 && *f == *i as f64
            }
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Keyword(a), Value::Keyword(b)) => a == b,
            // Sequential equality spans list and vector.
            (a, b) if a.seq_items().is_some() && b.seq_items().is_some() => {
                let (xs, ys) = (a.seq_items().unwrap_or(&[]), b.seq_items().unwrap_or(&[]));
                xs == ys
            }
            (Value::Map(a), Value::Map(b)) => {
                a.entries.len() == b.entries.len()
                    && a.entries.iter().all(|(k, v)| b.get(k) == Some(v))
            }
            (Value::Set(a), Value::Set(b)) => {
                a.items.len() == b.items.len() && a.items.iter().all(|v| b.contains(v))
            }
            (Value::Var(a), Value::Var(b)) => Rc::ptr_eq(a, b),
            (Value::Atom(a), Value::Atom(b)) => Rc::ptr_eq(a, b),
            (Value::Volatile(a), Value::Volatile(b)) => Rc::ptr_eq(a, b),
            (Value::Fn(a), Value::Fn(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => Rc::ptr_eq(a, b),
            (Value::TreeFn(a), Value::TreeFn(b)) => Rc::ptr_eq(a, b),
            (Value::ProtocolFn(a), Value::ProtocolFn(b)) => Rc::ptr_eq(a, b),
            (Value::MultiFn(a), Value::MultiFn(b)) => Rc::ptr_eq(a, b),
            (Value::LazySeq(a), Value::LazySeq(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                match (&*a.value.borrow(), &*b.value.borrow()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                }
            }
            // A realised lazy seq compares as its value.
            (Value::LazySeq(a), b) => match &*a.value.borrow() {
                Some(v) => v == b,
                None => false,
            },
            (a, Value::LazySeq(b)) => match &*b.value.borrow() {
                Some(v) => a == v,
                None => false,
            },
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::BigDecimal(a), Value::BigDecimal(b)) => a == b,
            (Value::Ratio(a), Value::Ratio(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::Str("".into()).is_truthy());
        assert!(Value::list(vec![]).is_truthy());
    }

    #[test]
    fn test_numeric_cross_equality() {
        assert_eq!(Value::Int(3), Value::Float(3.0));
        assert_eq!(Value::Float(3.0), Value::Int(3));
        assert_ne!(Value::Int(3), Value::Float(3.5));
    }

    #[test]
    fn test_sequential_equality() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let vector = Value::vector(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(list, vector);
        assert_ne!(list, Value::vector(vec![Value::Int(1)]));
    }

    #[test]
    fn test_map_equality_order_independent() {
        let a = Value::map(vec![
            (Value::keyword(None, "x"), Value::Int(1)),
            (Value::keyword(None, "y"), Value::Int(2)),
        ]);
        let b = Value::map(vec![
            (Value::keyword(None, "y"), Value::Int(2)),
            (Value::keyword(None, "x"), Value::Int(1)),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_set_equality_order_independent() {
        let a = Value::set(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::set(vec![Value::Int(2), Value::Int(1)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_set_dedupes() {
        if let Value::Set(s) = Value::set(vec![Value::Int(1), Value::Int(1)]) {
            assert_eq!(s.items.len(), 1);
        } else {
            panic!("expected set");
        }
    }

    #[test]
    fn test_symbol_equality_is_bytewise() {
        assert_eq!(
            Value::symbol(Some("a".into()), "x"),
            Value::symbol(Some("a".into()), "x")
        );
        assert_ne!(
            Value::symbol(Some("a".into()), "x"),
            Value::symbol(None, "x")
        );
        assert_ne!(Value::symbol(None, "x"), Value::keyword(None, "x"));
    }

    #[test]
    fn test_map_assoc_is_persistent() {
        let m = PersistentMap {
            entries: vec![(Value::keyword(None, "a"), Value::Int(1))],
            meta: None,
        };
        let m2 = m.assoc(Value::keyword(None, "a"), Value::Int(2));
        assert_eq!(m.get(&Value::keyword(None, "a")), Some(&Value::Int(1)));
        assert_eq!(m2.get(&Value::keyword(None, "a")), Some(&Value::Int(2)));
    }

    #[test]
    fn test_var_binding_stack() {
        let v = Var::new("user".into(), "x".into());
        v.bind_root(Value::Int(1));
        assert_eq!(v.deref(), Value::Int(1));
        v.push_binding(Value::Int(2));
        assert_eq!(v.deref(), Value::Int(2));
        v.set(Value::Int(3)).unwrap();
        assert_eq!(v.deref(), Value::Int(3));
        v.pop_binding();
        assert_eq!(v.deref(), Value::Int(1));
        assert!(v.set(Value::Int(9)).is_err());
    }

    #[test]
    fn test_pr_str() {
        assert_eq!(Value::Nil.pr_str(), "nil");
        assert_eq!(Value::Str("a\"b".into()).pr_str(), "\"a\\\"b\"");
        assert_eq!(Value::Char('\n').pr_str(), "\\newline");
        assert_eq!(Value::Float(3.0).pr_str(), "3.0");
        assert_eq!(Value::Float(f64::INFINITY).pr_str(), "##Inf");
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::keyword(None, "k")]).pr_str(),
            "(1 :k)"
        );
        assert_eq!(Value::BigInt("123".into()).pr_str(), "123N");
    }

    #[test]
    fn test_display_is_str_semantics() {
        assert_eq!(Value::Str("ab".into()).to_string(), "ab");
        assert_eq!(Value::Char('x').to_string(), "x");
    }

    #[test]
    fn test_with_meta() {
        let v = Value::vector(vec![Value::Int(1)]);
        let meta = Value::map(vec![(Value::keyword(None, "tag"), Value::Bool(true))]);
        let tagged = v.with_meta(meta.clone()).unwrap();
        assert_eq!(tagged.meta(), Some(meta));
        // equality ignores metadata
        assert_eq!(tagged, v);
        assert!(Value::Int(1).with_meta(Value::Nil).is_err());
    }

    #[test]
    fn test_lazy_seq_equality_when_realized() {
        let ls = LazySeq::new(Value::Nil);
        *ls.value.borrow_mut() = Some(Value::list(vec![Value::Int(1)]));
        let v = Value::LazySeq(Rc::new(ls));
        assert_eq!(v, Value::list(vec![Value::Int(1)]));
    }
}
