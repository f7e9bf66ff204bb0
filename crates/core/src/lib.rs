//! Clove core data model
//!
//! The shared vocabulary of the whole pipeline:
//!
//! - [`value::Value`]: tagged runtime values (what programs compute)
//! - [`form::Form`]: reader output (what programs look like)
//! - [`node::Node`]: analysed AST (what the backends consume)
//! - [`chunk::Chunk`] / [`chunk::FnProto`]: compiled bytecode
//! - [`error::RuntimeError`]: the runtime error taxonomy
//!
//! This crate is deliberately dependency-free; the runtime and compiler
//! crates build on it.

pub mod chunk;
pub mod error;
pub mod form;
pub mod node;
pub mod value;

pub use chunk::{Chunk, FnProto, Instr, Op};
pub use error::{ErrorKind, RuntimeError, TraceFrame};
pub use form::{Form, FormKind};
pub use node::{Binding, CaptureSource, CatchClause, FnArity, FnNode, Node, NodeKind};
pub use value::{
    BuiltinFn, Closure, LazySeq, MultiFn, NativeFn, PersistentList, PersistentMap, PersistentSet,
    PersistentVector, ProtocolFn, Symbol, Tag, TreeClosure, Value, Var,
};
