//! The bytecode virtual machine
//!
//! Stack-based execution over a fixed-capacity operand stack and frame
//! stack. Every dispatch step consumes exactly one instruction from the
//! current frame and may push a new frame (call) or pop one (ret).
//!
//! Frame slot layout at function entry: `[captures…][self?][params…]`,
//! with let/loop bindings growing past the params. `recur` rebinds the
//! target slots in place and jumps back, so loops never grow the frame
//! stack.
//!
//! A per-thread VM pointer lets builtins that take callbacks (apply,
//! reduce, swap!, …) re-enter the current VM's stacks instead of spawning
//! a nested interpreter; the pointer is installed around each outer call
//! and must be clear again when it returns.

use crate::env::{Env, EnvGuard};
use crate::exception::{exception_value, matches_class, park_exception, take_exception};
use crate::gc::{RootWalker, value_size};
use clove_core::chunk::{Chunk, FnProto, Instr, Op};
use clove_core::error::{
    ErrorKind, RuntimeError, TraceFrame, arithmetic_error, arity_error, index_error, name_error,
    type_error, value_error,
};
use clove_core::value::{
    Closure, IdentCacheEntry, LazySeq, MultiCacheEntry, MultiFn, ProtoCacheEntry, ProtocolFn,
    Symbol, Value,
};
use std::cell::Cell;
use std::rc::Rc;
use tracing::trace;

/// Operand stack capacity in slots.
pub const STACK_CAPACITY: usize = 32768;
/// Call-frame stack capacity.
pub const FRAME_CAPACITY: usize = 1024;

/// Code executed by a frame: the top-level chunk or a compiled fn body.
#[derive(Debug, Clone)]
enum FrameCode {
    Chunk(Rc<Chunk>),
    Proto(Rc<FnProto>),
}

impl FrameCode {
    fn instr(&self, ip: usize) -> Option<Instr> {
        match self {
            FrameCode::Chunk(c) => c.code.get(ip).copied(),
            FrameCode::Proto(p) => p.code.get(ip).copied(),
        }
    }

    fn const_at(&self, idx: usize) -> Option<Value> {
        match self {
            FrameCode::Chunk(c) => c.consts.get(idx).cloned(),
            FrameCode::Proto(p) => p.consts.get(idx).cloned(),
        }
    }

    fn consts(&self) -> &[Value] {
        match self {
            FrameCode::Chunk(c) => &c.consts,
            FrameCode::Proto(p) => &p.consts,
        }
    }

    fn line_col(&self, ip: usize) -> (u32, u32) {
        let (lines, cols) = match self {
            FrameCode::Chunk(c) => (&c.lines, &c.cols),
            FrameCode::Proto(p) => (&p.lines, &p.cols),
        };
        (
            lines.get(ip).copied().unwrap_or(0),
            cols.get(ip).copied().unwrap_or(0),
        )
    }

    /// Approximate byte size of the non-Value slices backing this frame.
    fn slice_bytes(&self) -> usize {
        let (code, lines, cols) = match self {
            FrameCode::Chunk(c) => (c.code.len(), c.lines.len(), c.cols.len()),
            FrameCode::Proto(p) => (p.code.len(), p.lines.len(), p.cols.len()),
        };
        code * 3 + (lines + cols) * 4
    }
}

#[derive(Debug)]
struct Frame {
    code: FrameCode,
    ip: usize,
    /// Operand-stack index of this frame's slot 0.
    base: usize,
    /// Caller namespace, restored on return and on unwinding.
    saved_ns: Option<Rc<str>>,
    fn_name: Rc<str>,
    ns_name: Rc<str>,
    call_line: u32,
    call_col: u32,
}

/// A pushed try scope.
#[derive(Debug, Clone, Copy)]
struct Handler {
    catch_ip: usize,
    sp: usize,
    frames_len: usize,
    frame_index: usize,
}

pub struct Vm {
    pub env: Rc<Env>,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    handlers: Vec<Handler>,
    safe_point: Cell<u8>,
    stack_capacity: usize,
    frame_capacity: usize,
}

thread_local! {
    static CURRENT_VM: Cell<*mut Vm> = const { Cell::new(std::ptr::null_mut()) };
}

/// Run `f` against the VM currently executing on this thread, if any.
pub fn with_current_vm<R>(f: impl FnOnce(&mut Vm) -> R) -> Option<R> {
    CURRENT_VM.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            return None;
        }
        // SAFETY: single-threaded cooperative model; the pointer is only
        // set while a VM call is live on this thread's Rust stack, and the
        // interpreter holds no field borrows across builtin invocations,
        // so this stack-like re-entry cannot alias live references.
        Some(f(unsafe { &mut *ptr }))
    })
}

/// Test probe: the per-thread VM pointer must be clear between outer
/// calls.
pub fn vm_pointer_clear() -> bool {
    CURRENT_VM.with(|cell| cell.get().is_null())
}

struct VmGuard {
    prev: *mut Vm,
}

impl VmGuard {
    fn install(vm: &mut Vm) -> VmGuard {
        let prev = CURRENT_VM.with(|cell| cell.replace(vm as *mut Vm));
        VmGuard { prev }
    }
}

impl Drop for VmGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        CURRENT_VM.with(|cell| cell.set(prev));
    }
}

impl Vm {
    pub fn new(env: Rc<Env>) -> Self {
        Vm::with_limits(env, STACK_CAPACITY, FRAME_CAPACITY)
    }

    /// A VM with non-default stack capacities (the config layer feeds
    /// these from TOML).
    pub fn with_limits(env: Rc<Env>, stack_slots: usize, frame_slots: usize) -> Self {
        Vm {
            env,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            handlers: Vec::new(),
            safe_point: Cell::new(0),
            stack_capacity: stack_slots,
            frame_capacity: frame_slots,
        }
    }

    /// Execute a top-level chunk to completion. Installs the per-thread
    /// VM/environment pointers for the duration of the call and clears
    /// them (and the exception mailbox) on every exit path.
    pub fn run_chunk(&mut self, chunk: Rc<Chunk>) -> Result<Value, RuntimeError> {
        let _env_guard = EnvGuard::install(self.env.clone());
        let _vm_guard = VmGuard::install(self);
        self.frames.push(Frame {
            code: FrameCode::Chunk(chunk),
            ip: 0,
            base: self.stack.len(),
            saved_ns: None,
            fn_name: Rc::from("top-level"),
            ns_name: self.env.current_ns_name(),
            call_line: 0,
            call_col: 0,
        });
        let entry_frames = self.frames.len() - 1;
        match self.run_until(entry_frames) {
            Ok(()) => {
                let result = self.pop()?;
                Ok(result)
            }
            Err(mut err) => {
                if err.data.is_none()
                    && let Some(exc) = take_exception()
                {
                    err.data = Some(exc);
                }
                for frame in self.frames.iter().rev() {
                    err.push_frame(TraceFrame {
                        name: frame.fn_name.clone(),
                        ns: frame.ns_name.clone(),
                        line: frame.call_line,
                        col: frame.call_col,
                    });
                }
                // discarding fn frames must restore the namespace their
                // caller was in; the lowest dropped frame recorded it
                if let Some(frame) = self.frames.get(entry_frames + 1)
                    && let Some(ns) = frame.saved_ns.clone()
                {
                    self.env.set_current(ns);
                }
                self.frames.truncate(entry_frames);
                self.handlers.clear();
                self.stack.clear();
                Err(err)
            }
        }
    }

    /// Invoke a callable with already-evaluated arguments, re-using this
    /// VM's stacks. This is the re-entry point for builtins and for
    /// dispatch-fn evaluation.
    pub fn call_value(&mut self, callee: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let base_frames = self.frames.len();
        self.push(callee.clone())?;
        for arg in args {
            self.push(arg.clone())?;
        }
        self.dispatch_call(args.len())?;
        if self.frames.len() > base_frames {
            self.run_until(base_frames)?;
        }
        self.pop()
    }

    /// Like `call_value` for use when this VM is not already running:
    /// installs the per-thread pointers first.
    pub fn call_value_outer(
        &mut self,
        callee: &Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let _env_guard = EnvGuard::install(self.env.clone());
        let _vm_guard = VmGuard::install(self);
        self.call_value(callee, args)
    }

    // ----- stack primitives -----

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.stack_capacity {
            return Err(RuntimeError::new(
                ErrorKind::StackOverflow,
                "operand stack overflow",
            ));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| {
            RuntimeError::new(ErrorKind::StackUnderflow, "operand stack underflow")
        })
    }

    fn peek(&self) -> Result<&Value, RuntimeError> {
        self.stack.last().ok_or_else(|| {
            RuntimeError::new(ErrorKind::StackUnderflow, "operand stack underflow")
        })
    }

    fn local(&self, slot: u16) -> Value {
        let frame = &self.frames[self.frames.len() - 1];
        self.stack[frame.base + slot as usize].clone()
    }

    fn set_local(&mut self, slot: u16, value: Value) {
        let base = self.frames[self.frames.len() - 1].base;
        self.stack[base + slot as usize] = value;
    }

    fn const_at(&self, idx: u16) -> Result<Value, RuntimeError> {
        let frame = &self.frames[self.frames.len() - 1];
        frame.code.const_at(idx as usize).ok_or_else(|| {
            RuntimeError::new(ErrorKind::InvalidInstruction, "constant index out of range")
        })
    }

    fn invalid(msg: &str) -> RuntimeError {
        RuntimeError::new(ErrorKind::InvalidInstruction, msg)
    }

    // ----- main loop -----

    fn run_until(&mut self, base: usize) -> Result<(), RuntimeError> {
        while self.frames.len() > base {
            match self.step(base) {
                Ok(()) => {}
                Err(err) => {
                    if err.catchable() {
                        let exc = take_exception().unwrap_or_else(|| exception_value(&err));
                        self.dispatch_exception(exc, base)?;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn step(&mut self, base: usize) -> Result<(), RuntimeError> {
        // GC safe point: a wrapping 8-bit counter, once per 256
        // instructions.
        let tick = self.safe_point.get().wrapping_add(1);
        self.safe_point.set(tick);
        if tick == 0 {
            self.safe_point_collect();
        }

        let fi = self.frames.len() - 1;
        let ip = self.frames[fi].ip;
        let Some(instr) = self.frames[fi].code.instr(ip) else {
            // Fell off the end of a chunk: implicit return.
            return self.do_ret();
        };
        self.frames[fi].ip = ip + 1;

        match instr.op {
            Op::Const => {
                let v = self.const_at(instr.operand)?;
                self.push(v)?;
            }
            Op::Nil => self.push(Value::Nil)?,
            Op::True => self.push(Value::Bool(true))?,
            Op::False => self.push(Value::Bool(false))?,
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let v = self.peek()?.clone();
                self.push(v)?;
            }
            Op::PopUnder => {
                let top = self.pop()?;
                let n = instr.operand as usize;
                let len = self.stack.len();
                if len < n {
                    return Err(Self::invalid("pop_under past stack base"));
                }
                self.stack.truncate(len - n);
                self.push(top)?;
            }
            Op::LoadLocal => {
                let v = self.local(instr.operand);
                self.push(v)?;
            }
            Op::StoreLocal => {
                let v = self.pop()?;
                self.set_local(instr.operand, v);
            }
            Op::Jump => {
                self.frames[fi].ip += instr.operand as usize;
            }
            Op::JumpIfFalse => {
                let v = self.pop()?;
                if !v.is_truthy() {
                    self.frames[fi].ip += instr.operand as usize;
                }
            }
            Op::JumpBack => {
                self.frames[fi].ip -= instr.operand as usize;
            }
            Op::Call => {
                self.dispatch_call(instr.operand as usize)?;
            }
            Op::Ret => {
                self.do_ret()?;
            }
            Op::Closure => {
                let template = self.const_at(instr.operand)?;
                let Value::Fn(template) = template else {
                    return Err(Self::invalid("closure operand is not a fn template"));
                };
                let frame_base = self.frames[fi].base;
                let captures: Vec<Value> = template
                    .proto
                    .capture_slots
                    .iter()
                    .map(|slot| self.stack[frame_base + *slot as usize].clone())
                    .collect();
                let closure = Closure {
                    proto: template.proto.clone(),
                    extras: template.extras.clone(),
                    captures: std::cell::RefCell::new(captures),
                    ns: self.env.current_ns_name(),
                };
                self.env.gc.allocate(std::mem::size_of::<Closure>());
                self.push(Value::Fn(Rc::new(closure)))?;
            }
            Op::LetfnPatch => {
                let first = (instr.operand >> 8) as usize;
                let count = (instr.operand & 0xff) as usize;
                let frame_base = self.frames[fi].base;
                for i in 0..count {
                    let slot = frame_base + first + i;
                    if let Value::Fn(closure) = &self.stack[slot] {
                        let fresh: Vec<Value> = closure
                            .proto
                            .capture_slots
                            .iter()
                            .map(|s| self.stack[frame_base + *s as usize].clone())
                            .collect();
                        *closure.captures.borrow_mut() = fresh;
                    }
                }
            }
            Op::Recur => {
                self.do_recur(instr.operand)?;
            }
            Op::RecurLoop => {
                self.do_recur(instr.operand)?;
                let fi = self.frames.len() - 1;
                let data_ip = self.frames[fi].ip;
                let distance = self.frames[fi]
                    .code
                    .instr(data_ip)
                    .ok_or_else(|| Self::invalid("recur_loop missing distance word"))?
                    .operand as usize;
                self.frames[fi].ip = data_ip + 1 - distance;
            }
            Op::ListNew => {
                let items = self.pop_n(instr.operand as usize)?;
                let v = Value::list(items);
                self.env.gc.allocate(value_size(&v));
                self.push(v)?;
            }
            Op::VecNew => {
                let items = self.pop_n(instr.operand as usize)?;
                let v = Value::vector(items);
                self.env.gc.allocate(value_size(&v));
                self.push(v)?;
            }
            Op::MapNew => {
                let flat = self.pop_n(instr.operand as usize * 2)?;
                let entries = flat
                    .chunks_exact(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                let v = Value::map(entries);
                self.env.gc.allocate(value_size(&v));
                self.push(v)?;
            }
            Op::SetNew => {
                let items = self.pop_n(instr.operand as usize)?;
                let v = Value::set(items);
                self.env.gc.allocate(value_size(&v));
                self.push(v)?;
            }
            Op::VarLoad => {
                let sym = self.const_at(instr.operand)?;
                let var = self.resolve_symbol(&sym)?;
                self.push(var.deref())?;
            }
            Op::VarSet => {
                let sym = self.const_at(instr.operand)?;
                let var = self.resolve_symbol(&sym)?;
                let value = self.peek()?.clone();
                var.set(value)?;
            }
            Op::Def | Op::DefMacro | Op::DefDynamic => {
                self.do_def(instr.op, instr.operand)?;
            }
            Op::DefMulti => {
                let sym = self.const_at(instr.operand)?;
                let name = symbol_name(&sym)?;
                let dispatch = self.pop()?;
                let var = self
                    .env
                    .intern(&self.env.current_ns_name(), name.clone());
                var.bind_root(Value::MultiFn(Rc::new(MultiFn::new(name, dispatch))));
                self.push(Value::Var(var))?;
            }
            Op::DefMethod => {
                let sym = self.const_at(instr.operand)?;
                let name = symbol_name(&sym)?;
                let method = self.pop()?;
                let dispatch_value = self.pop()?;
                let var = self
                    .env
                    .resolve(&name)
                    .ok_or_else(|| name_error(format!("no multimethod named {}", name)))?;
                let root = var.root();
                let Value::MultiFn(mm) = &root else {
                    return Err(type_error(format!("{} is not a multimethod", name)));
                };
                mm.add_method(dispatch_value, method);
                self.push(root.clone())?;
            }
            Op::DefProtocol => {
                let descriptor = self.const_at(instr.operand)?;
                let names = symbol_vector(&descriptor)?;
                let (protocol, methods) = names
                    .split_first()
                    .ok_or_else(|| Self::invalid("empty protocol descriptor"))?;
                let current = self.env.current_ns_name();
                for method in methods {
                    let var = self.env.intern(&current, method.clone());
                    var.bind_root(Value::ProtocolFn(Rc::new(ProtocolFn::new(
                        protocol.clone(),
                        method.clone(),
                        current.clone(),
                    ))));
                }
                self.push(Value::symbol(None, protocol.clone()))?;
            }
            Op::ExtendType => {
                let descriptor = self.const_at(instr.operand)?;
                self.do_extend_type(&descriptor)?;
            }
            Op::LazySeqNew => {
                let thunk = self.pop()?;
                self.push(Value::LazySeq(Rc::new(LazySeq::new(thunk))))?;
            }
            Op::TryBegin => {
                if self.handlers.len() >= self.frame_capacity {
                    return Err(RuntimeError::new(
                        ErrorKind::StackOverflow,
                        "handler stack overflow",
                    ));
                }
                self.handlers.push(Handler {
                    catch_ip: ip + instr.operand as usize,
                    sp: self.stack.len(),
                    frames_len: self.frames.len(),
                    frame_index: self.frames.len() - 1,
                });
            }
            Op::PopHandler => {
                self.handlers.pop();
            }
            Op::CatchBegin | Op::TryEnd | Op::Nop => {}
            Op::ExceptionTypeCheck => {
                let class = self.const_at(instr.operand)?;
                let Value::Str(class) = class else {
                    return Err(Self::invalid("exception class is not a string"));
                };
                if !matches_class(self.peek()?, &class) {
                    let exc = self.pop()?;
                    self.dispatch_exception(exc, base)?;
                }
            }
            Op::ThrowEx => {
                let exc = self.pop()?;
                self.dispatch_exception(exc, base)?;
            }
            Op::Add | Op::AddP => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(num_add(&a, &b, instr.op == Op::AddP)?)?;
            }
            Op::Sub | Op::SubP => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(num_sub(&a, &b, instr.op == Op::SubP)?)?;
            }
            Op::Mul | Op::MulP => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(num_mul(&a, &b, instr.op == Op::MulP)?)?;
            }
            Op::Div => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(num_div(&a, &b)?)?;
            }
            Op::Mod => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(num_mod(&a, &b)?)?;
            }
            Op::Rem => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(num_rem(&a, &b)?)?;
            }
            Op::Eq | Op::Ne => {
                let b = self.pop()?;
                let a = self.pop()?;
                let equal = values_equal(&a, &b)?;
                self.push(Value::Bool(if instr.op == Op::Eq { equal } else { !equal }))?;
            }
            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(num_compare(instr.op, &a, &b)?)?;
            }
            Op::AddLocals | Op::SubLocals | Op::EqLocals | Op::LtLocals | Op::LeLocals => {
                let a = self.local(instr.operand >> 8);
                let b = self.local(instr.operand & 0xff);
                let v = fused_binary(instr.op, &a, &b)?;
                self.push(v)?;
            }
            Op::AddLocalConst
            | Op::SubLocalConst
            | Op::EqLocalConst
            | Op::LtLocalConst
            | Op::LeLocalConst => {
                let a = self.local(instr.operand >> 8);
                let b = self.const_at(instr.operand & 0xff)?;
                let v = fused_binary(instr.op, &a, &b)?;
                self.push(v)?;
            }
            Op::EqLocalsBr | Op::LtLocalsBr | Op::LeLocalsBr => {
                let a = self.local(instr.operand >> 8);
                let b = self.local(instr.operand & 0xff);
                self.fused_branch(instr.op, &a, &b)?;
            }
            Op::EqLocalConstBr | Op::LtLocalConstBr | Op::LeLocalConstBr => {
                let a = self.local(instr.operand >> 8);
                let b = self.const_at(instr.operand & 0xff)?;
                self.fused_branch(instr.op, &a, &b)?;
            }
        }
        Ok(())
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        let len = self.stack.len();
        if len < n {
            return Err(RuntimeError::new(
                ErrorKind::StackUnderflow,
                "operand stack underflow",
            ));
        }
        Ok(self.stack.split_off(len - n))
    }

    fn do_ret(&mut self) -> Result<(), RuntimeError> {
        let result = self.pop()?;
        let frame = self.frames.pop().ok_or_else(|| {
            RuntimeError::new(ErrorKind::StackUnderflow, "frame stack underflow")
        })?;
        self.stack.truncate(frame.base);
        if let Some(ns) = frame.saved_ns {
            self.env.set_current(ns);
        }
        self.push(result)
    }

    fn do_recur(&mut self, operand: u16) -> Result<(), RuntimeError> {
        let base_offset = (operand >> 8) as usize;
        let argc = (operand & 0xff) as usize;
        let args = self.pop_n(argc)?;
        let frame_base = self.frames[self.frames.len() - 1].base;
        let target = frame_base + base_offset;
        for (i, value) in args.into_iter().enumerate() {
            self.stack[target + i] = value;
        }
        self.stack.truncate(target + argc);
        Ok(())
    }

    fn do_def(&mut self, op: Op, operand: u16) -> Result<(), RuntimeError> {
        let sym = self.const_at(operand)?;
        let name = symbol_name(&sym)?;
        let line = self.const_at(operand + 1)?;
        let doc = self.const_at(operand + 2)?;
        let arglists = self.const_at(operand + 3)?;
        let init = self.pop()?;
        let var = self.env.intern(&self.env.current_ns_name(), name);
        var.bind_root(init);
        match op {
            Op::DefMacro => var.is_macro.set(true),
            Op::DefDynamic => var.dynamic.set(true),
            _ => {}
        }
        let mut meta = vec![(Value::keyword(None, "line"), line)];
        if let Value::Str(text) = &doc {
            *var.doc.borrow_mut() = Some(text.clone());
            meta.push((Value::keyword(None, "doc"), doc.clone()));
        }
        if let Value::Str(text) = &arglists {
            *var.arglists.borrow_mut() = Some(text.clone());
            meta.push((Value::keyword(None, "arglists"), arglists.clone()));
        }
        *var.meta.borrow_mut() = Some(Value::map(meta));
        trace!(var = %var.qualified_name(), "def");
        self.push(Value::Var(var))
    }

    fn do_extend_type(&mut self, descriptor: &Value) -> Result<(), RuntimeError> {
        let Value::Vector(items) = descriptor else {
            return Err(Self::invalid("extend-type descriptor is not a vector"));
        };
        let items = &items.items;
        if items.len() < 2 {
            return Err(Self::invalid("extend-type descriptor too short"));
        }
        let Value::Str(type_key) = &items[0] else {
            return Err(Self::invalid("extend-type key is not a string"));
        };
        let method_names: Vec<Rc<str>> = items[2..]
            .iter()
            .map(symbol_name)
            .collect::<Result<_, _>>()?;
        let mut fns = self.pop_n(method_names.len())?;
        for (name, method) in method_names.iter().zip(fns.drain(..)) {
            let var = self
                .env
                .resolve(name)
                .ok_or_else(|| name_error(format!("no protocol method named {}", name)))?;
            let root = var.root();
            let Value::ProtocolFn(pf) = &root else {
                return Err(type_error(format!("{} is not a protocol method", name)));
            };
            pf.extend(type_key.clone(), method);
        }
        self.push(Value::Nil)
    }

    fn resolve_symbol(&self, sym: &Value) -> Result<Rc<clove_core::value::Var>, RuntimeError> {
        let Value::Symbol(s) = sym else {
            return Err(Self::invalid("var operand is not a symbol"));
        };
        let var = match &s.ns {
            Some(ns) => self.env.resolve_qualified(ns, &s.name),
            None => self.env.resolve(&s.name),
        };
        var.ok_or_else(|| {
            name_error(format!(
                "unable to resolve symbol: {} in this context",
                Symbol {
                    ns: s.ns.clone(),
                    name: s.name.clone()
                }
            ))
        })
    }

    // ----- call dispatch -----

    /// Dispatch the callable sitting `argc + 1` below the stack top.
    fn dispatch_call(&mut self, argc: usize) -> Result<(), RuntimeError> {
        loop {
            let callee_idx = self.stack.len() - 1 - argc;
            let callee = self.stack[callee_idx].clone();
            match callee {
                Value::Fn(closure) => return self.call_closure(closure, argc),
                Value::TreeFn(_) => {
                    // Tree-walk closures cross the backend boundary.
                    let args = self.pop_n(argc)?;
                    self.pop()?;
                    let result = crate::treewalk::apply_tree_fn(&callee, &args)?;
                    return self.push(result);
                }
                Value::Builtin(b) => {
                    let args = self.pop_n(argc)?;
                    self.pop()?;
                    let result = (b.f)(&args)?;
                    return self.push(result);
                }
                Value::Keyword(_) | Value::Map(_) | Value::Set(_) | Value::Vector(_) => {
                    let args = self.pop_n(argc)?;
                    self.pop()?;
                    let result = lookup_invoke(&callee, &args)?;
                    return self.push(result);
                }
                Value::Var(var) => {
                    self.stack[callee_idx] = var.deref();
                }
                Value::ProtocolFn(pf) => {
                    if argc == 0 {
                        return Err(arity_error(&pf.method, 0));
                    }
                    let receiver = self.stack[callee_idx + 1].clone();
                    let method = self.protocol_method(&pf, &receiver)?;
                    self.stack[callee_idx] = method;
                }
                Value::MultiFn(mm) => {
                    let args: Vec<Value> =
                        self.stack[callee_idx + 1..].to_vec();
                    let method = self.multi_method(&mm, &args)?;
                    self.stack[callee_idx] = method;
                }
                other => {
                    return Err(type_error(format!(
                        "{} is not callable",
                        other.type_name()
                    )));
                }
            }
            // var / protocol / multi loop around and re-dispatch with the
            // resolved callee
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, argc: usize) -> Result<(), RuntimeError> {
        let proto = closure.select_arity(argc).ok_or_else(|| {
            arity_error(&closure.name(), argc)
        })?;
        if self.frames.len() >= self.frame_capacity {
            return Err(RuntimeError::new(
                ErrorKind::StackOverflow,
                "call frame stack overflow",
            ));
        }
        let args = self.pop_n(argc)?;
        let callee = self.pop()?;
        let frame_base = self.stack.len();

        for capture in closure.captures.borrow().iter() {
            self.push(capture.clone())?;
        }
        if proto.self_ref {
            self.push(callee)?;
        }
        let fixed = proto.arity as usize;
        let mut args = args.into_iter();
        for _ in 0..fixed {
            // arity was checked by select_arity
            let arg = args.next().ok_or_else(|| Self::invalid("missing argument"))?;
            self.push(arg)?;
        }
        if proto.variadic {
            let rest: Vec<Value> = args.collect();
            let rest_value = if rest.is_empty() {
                Value::Nil
            } else {
                Value::list(rest)
            };
            self.push(rest_value)?;
        }

        let (call_line, call_col) = match self.frames.last() {
            Some(frame) => frame.code.line_col(frame.ip.saturating_sub(1)),
            None => (0, 0),
        };
        let saved_ns = self.env.current_ns_name();
        self.env.set_current(closure.ns.clone());
        self.frames.push(Frame {
            code: FrameCode::Proto(proto.clone()),
            ip: 0,
            base: frame_base,
            saved_ns: Some(saved_ns),
            fn_name: closure.name(),
            ns_name: closure.ns.clone(),
            call_line,
            call_col,
        });
        Ok(())
    }

    /// Protocol dispatch: inline cache, then per-object metadata, then the
    /// exact type, then the registered `Object` default.
    fn protocol_method(
        &mut self,
        pf: &ProtocolFn,
        receiver: &Value,
    ) -> Result<Value, RuntimeError> {
        let type_key = receiver.type_name();
        let generation = pf.generation.get();
        if let Some(entry) = &*pf.cache.borrow()
            && &*entry.type_key == type_key
            && entry.generation == generation
        {
            return Ok(entry.method.clone());
        }
        // extend-via-metadata: a method entry keyed by the fully qualified
        // symbol wins, and is not cached (it is per-object).
        if let Some(Value::Map(meta)) = receiver.meta() {
            let key = Value::Symbol(Rc::new(pf.qualified_symbol()));
            if let Some(method) = meta.get(&key) {
                return Ok(method.clone());
            }
        }
        let method = pf
            .lookup(type_key)
            .or_else(|| pf.lookup("Object"))
            .ok_or_else(|| {
                type_error(format!(
                    "no implementation of {}/{} for {}",
                    pf.protocol, pf.method, type_key
                ))
            })?;
        *pf.cache.borrow_mut() = Some(ProtoCacheEntry {
            type_key: Rc::from(type_key),
            generation,
            method: method.clone(),
        });
        Ok(method)
    }

    /// Multimethod dispatch through the two-level cache.
    fn multi_method(&mut self, mm: &MultiFn, args: &[Value]) -> Result<Value, RuntimeError> {
        let generation = mm.generation.get();
        let ident_key = args.first().and_then(value_identity);

        if let Some(key) = ident_key
            && let Some(entry) = &*mm.ident_cache.borrow()
            && entry.key == key
            && entry.generation == generation
        {
            mm.cache_hits.set(mm.cache_hits.get() + 1);
            return Ok(entry.method.clone());
        }

        let dispatch = mm.dispatch.borrow().clone();
        // Fast path: a keyword dispatch fn over a single map argument.
        let dispatch_value = match (&dispatch, args) {
            (Value::Keyword(_), [Value::Map(m)]) => {
                m.get(&dispatch).cloned().unwrap_or(Value::Nil)
            }
            _ => self.call_value(&dispatch, args)?,
        };

        if let Some(entry) = &*mm.value_cache.borrow()
            && entry.dispatch_value == dispatch_value
            && entry.generation == generation
        {
            mm.cache_hits.set(mm.cache_hits.get() + 1);
            let method = entry.method.clone();
            if let Some(key) = ident_key {
                *mm.ident_cache.borrow_mut() = Some(IdentCacheEntry {
                    key,
                    generation,
                    method: method.clone(),
                });
            }
            return Ok(method);
        }

        let method = mm.method_for(&dispatch_value).ok_or_else(|| {
            value_error(format!(
                "no method in multimethod '{}' for dispatch value: {}",
                mm.name,
                dispatch_value.pr_str()
            ))
        })?;
        *mm.value_cache.borrow_mut() = Some(MultiCacheEntry {
            dispatch_value,
            generation,
            method: method.clone(),
        });
        if let Some(key) = ident_key {
            *mm.ident_cache.borrow_mut() = Some(IdentCacheEntry {
                key,
                generation,
                method: method.clone(),
            });
        }
        Ok(method)
    }

    // ----- exceptions -----

    /// Unwind to the innermost handler of the current call scope. When no
    /// in-scope handler exists the exception is parked in the
    /// cross-backend slot and a user-exception error surfaces to the
    /// outer caller.
    fn dispatch_exception(&mut self, exc: Value, base: usize) -> Result<(), RuntimeError> {
        let in_scope = self
            .handlers
            .last()
            .is_some_and(|h| h.frame_index >= base);
        if !in_scope {
            let mut err = RuntimeError::thrown(exc.clone());
            err.data = None;
            park_exception(exc);
            return Err(err);
        }
        let handler = self.handlers.pop().ok_or_else(|| {
            RuntimeError::new(ErrorKind::StackUnderflow, "handler stack underflow")
        })?;
        self.stack.truncate(handler.sp);
        if self.frames.len() > handler.frames_len {
            // The first dropped frame recorded the namespace current in
            // the frame we are unwinding to.
            if let Some(ns) = self.frames[handler.frames_len].saved_ns.clone() {
                self.env.set_current(ns);
            }
            self.frames.truncate(handler.frames_len);
        }
        self.frames[handler.frame_index].ip = handler.catch_ip;
        self.push(exc)
    }

    // ----- GC plumbing -----

    fn safe_point_collect(&mut self) {
        let gc = self.env.gc.clone();
        for frame in &self.frames {
            gc.mark_slice(frame.code.slice_bytes());
        }
        gc.collect_if_needed(&VmRoots {
            stack: &self.stack,
            frames: &self.frames,
            env: &self.env,
        });
    }

    fn fused_branch(&mut self, op: Op, a: &Value, b: &Value) -> Result<(), RuntimeError> {
        let truthy = match op {
            Op::EqLocalsBr | Op::EqLocalConstBr => values_equal(a, b)?,
            Op::LtLocalsBr | Op::LtLocalConstBr => num_lt(a, b)?,
            _ => num_le(a, b)?,
        };
        let fi = self.frames.len() - 1;
        let data_ip = self.frames[fi].ip;
        let offset = self.frames[fi]
            .code
            .instr(data_ip)
            .ok_or_else(|| Self::invalid("fused branch missing offset word"))?
            .operand as usize;
        self.frames[fi].ip = data_ip + 1;
        if !truthy {
            self.frames[fi].ip += offset;
        }
        Ok(())
    }
}

struct VmRoots<'a> {
    stack: &'a [Value],
    frames: &'a [Frame],
    env: &'a Rc<Env>,
}

impl RootWalker for VmRoots<'_> {
    fn walk(&self, visit: &mut dyn FnMut(&Value)) {
        for value in self.stack {
            visit(value);
        }
        for frame in self.frames {
            for value in frame.code.consts() {
                visit(value);
            }
        }
        for ns in self.env.namespace_list() {
            for var in ns.owned_vars() {
                visit(&var.root());
            }
        }
    }
}

// ----- shared callable helpers -----

/// Call any callable from host code. Uses the running VM when one is
/// active on this thread; otherwise spins up a VM over the per-thread
/// environment.
pub fn call_function(callee: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    match callee {
        Value::Builtin(b) => (b.f)(args),
        Value::TreeFn(_) => crate::treewalk::apply_tree_fn(callee, args),
        Value::Keyword(_) | Value::Map(_) | Value::Set(_) | Value::Vector(_) => {
            lookup_invoke(callee, args)
        }
        Value::Var(var) => call_function(&var.deref(), args),
        _ => {
            if let Some(result) = with_current_vm(|vm| vm.call_value(callee, args)) {
                return result;
            }
            match crate::env::current_env() {
                Some(env) => Vm::new(env).call_value_outer(callee, args),
                None => Err(value_error("no evaluation context for callback")),
            }
        }
    }
}

/// Keyword / map / set / vector invoked as a function.
pub fn lookup_invoke(callee: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    match callee {
        Value::Keyword(_) => match args {
            [coll] => Ok(keyword_get(callee, coll, Value::Nil)),
            [coll, default] => Ok(keyword_get(callee, coll, default.clone())),
            _ => Err(arity_error("keyword", args.len())),
        },
        Value::Map(m) => match args {
            [key] => Ok(m.get(key).cloned().unwrap_or(Value::Nil)),
            [key, default] => Ok(m.get(key).cloned().unwrap_or_else(|| default.clone())),
            _ => Err(arity_error("map", args.len())),
        },
        Value::Set(s) => match args {
            [key] => Ok(if s.contains(key) {
                key.clone()
            } else {
                Value::Nil
            }),
            _ => Err(arity_error("set", args.len())),
        },
        Value::Vector(v) => match args {
            [Value::Int(i)] => {
                let idx = *i;
                if idx >= 0 && (idx as usize) < v.items.len() {
                    Ok(v.items[idx as usize].clone())
                } else {
                    Err(index_error(format!(
                        "index {} out of bounds for vector of {}",
                        idx,
                        v.items.len()
                    )))
                }
            }
            [Value::Int(i), default] => {
                let idx = *i;
                if idx >= 0 && (idx as usize) < v.items.len() {
                    Ok(v.items[idx as usize].clone())
                } else {
                    Ok(default.clone())
                }
            }
            [other, ..] => Err(type_error(format!(
                "vector index must be an integer, got {}",
                other.type_name()
            ))),
            [] => Err(arity_error("vector", 0)),
        },
        _ => Err(type_error(format!(
            "{} is not callable",
            callee.type_name()
        ))),
    }
}

fn keyword_get(kw: &Value, coll: &Value, default: Value) -> Value {
    match coll {
        Value::Map(m) => m.get(kw).cloned().unwrap_or(default),
        Value::Set(s) => {
            if s.contains(kw) {
                kw.clone()
            } else {
                default
            }
        }
        _ => default,
    }
}

/// Identity key for the multimethod identity cache: the payload pointer of
/// reference-backed values.
fn value_identity(value: &Value) -> Option<usize> {
    match value {
        Value::Str(s) => Some(Rc::as_ptr(s) as *const u8 as usize),
        Value::Symbol(s) => Some(Rc::as_ptr(s) as usize),
        Value::Keyword(s) => Some(Rc::as_ptr(s) as usize),
        Value::List(l) => Some(Rc::as_ptr(l) as usize),
        Value::Vector(v) => Some(Rc::as_ptr(v) as usize),
        Value::Map(m) => Some(Rc::as_ptr(m) as usize),
        Value::Set(s) => Some(Rc::as_ptr(s) as usize),
        Value::Fn(f) => Some(Rc::as_ptr(f) as usize),
        Value::Atom(a) => Some(Rc::as_ptr(a) as usize),
        _ => None,
    }
}

fn symbol_name(value: &Value) -> Result<Rc<str>, RuntimeError> {
    match value {
        Value::Symbol(s) => Ok(s.name.clone()),
        other => Err(Vm::invalid(&format!(
            "expected symbol constant, got {}",
            other.type_name()
        ))),
    }
}

fn symbol_vector(value: &Value) -> Result<Vec<Rc<str>>, RuntimeError> {
    let Value::Vector(items) = value else {
        return Err(Vm::invalid("expected symbol vector constant"));
    };
    items.items.iter().map(symbol_name).collect()
}

// ----- arithmetic -----

/// Realise lazy seqs (recursively through collections) so structural
/// equality can observe their elements.
pub fn deep_realize(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::LazySeq(ls) => {
            let realized = realize_lazy(ls)?;
            deep_realize(&realized)
        }
        Value::List(l) => {
            let items: Vec<Value> = l.items.iter().map(deep_realize).collect::<Result<_, _>>()?;
            Ok(Value::list(items))
        }
        Value::Vector(v) => {
            let items: Vec<Value> = v.items.iter().map(deep_realize).collect::<Result<_, _>>()?;
            Ok(Value::vector(items))
        }
        other => Ok(other.clone()),
    }
}

/// Force a lazy seq's thunk, memoising the result.
pub fn realize_lazy(ls: &LazySeq) -> Result<Value, RuntimeError> {
    if let Some(v) = &*ls.value.borrow() {
        return Ok(v.clone());
    }
    let thunk = ls.thunk.borrow_mut().take();
    let result = match thunk {
        Some(thunk) => {
            let mut result = call_function(&thunk, &[])?;
            // a lazy seq may yield another lazy seq
            while let Value::LazySeq(inner) = &result.clone() {
                result = realize_lazy(inner)?;
            }
            result
        }
        None => Value::Nil,
    };
    *ls.value.borrow_mut() = Some(result.clone());
    Ok(result)
}

/// Structural equality with allocating realisation of lazy seqs.
pub fn values_equal(a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    let a = deep_realize(a)?;
    let b = deep_realize(b)?;
    Ok(a == b)
}

fn big_operand(v: &Value) -> bool {
    matches!(
        v,
        Value::BigInt(_) | Value::BigDecimal(_) | Value::Ratio(_)
    )
}

fn num_mismatch(op: &str, a: &Value, b: &Value) -> RuntimeError {
    if big_operand(a) || big_operand(b) {
        return value_error(format!(
            "{}: arbitrary-precision arithmetic is not supported yet",
            op
        ));
    }
    type_error(format!(
        "{}: expected numbers, got {} and {}",
        op,
        a.type_name(),
        b.type_name()
    ))
}

pub fn num_add(a: &Value, b: &Value, promoting: bool) -> Result<Value, RuntimeError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => match x.checked_add(*y) {
            Some(v) => Ok(Value::Int(v)),
            None if promoting => Err(arithmetic_error(format!(
                "integer overflow adding {} and {}",
                x, y
            ))),
            None => Ok(Value::Float(*x as f64 + *y as f64)),
        },
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 + y)),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x + *y as f64)),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x + y)),
        _ => Err(num_mismatch("+", a, b)),
    }
}

pub fn num_sub(a: &Value, b: &Value, promoting: bool) -> Result<Value, RuntimeError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => match x.checked_sub(*y) {
            Some(v) => Ok(Value::Int(v)),
            None if promoting => Err(arithmetic_error(format!(
                "integer overflow subtracting {} from {}",
                y, x
            ))),
            None => Ok(Value::Float(*x as f64 - *y as f64)),
        },
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 - y)),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x - *y as f64)),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x - y)),
        _ => Err(num_mismatch("-", a, b)),
    }
}

pub fn num_mul(a: &Value, b: &Value, promoting: bool) -> Result<Value, RuntimeError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => match x.checked_mul(*y) {
            Some(v) => Ok(Value::Int(v)),
            None if promoting => Err(arithmetic_error(format!(
                "integer overflow multiplying {} and {}",
                x, y
            ))),
            None => Ok(Value::Float(*x as f64 * *y as f64)),
        },
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 * y)),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x * *y as f64)),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x * y)),
        _ => Err(num_mismatch("*", a, b)),
    }
}

pub fn num_div(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Err(arithmetic_error("divide by zero")),
        (Value::Int(x), Value::Int(y)) => {
            if x % y == 0 {
                Ok(Value::Int(x / y))
            } else {
                Ok(Value::Float(*x as f64 / *y as f64))
            }
        }
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 / y)),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x / *y as f64)),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x / y)),
        _ => Err(num_mismatch("/", a, b)),
    }
}

/// Floor-mod: the result's sign follows the divisor, so `(mod 7 -3)` is
/// `-2`. Rust's `%` truncates toward zero; correct when the signs differ.
fn floor_mod_i64(x: i64, y: i64) -> i64 {
    let m = x % y;
    if m != 0 && (m < 0) != (y < 0) { m + y } else { m }
}

fn floor_mod_f64(x: f64, y: f64) -> f64 {
    let m = x % y;
    if m != 0.0 && (m < 0.0) != (y < 0.0) { m + y } else { m }
}

pub fn num_mod(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Err(arithmetic_error("modulo by zero")),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(floor_mod_i64(*x, *y))),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(floor_mod_f64(*x, *y))),
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(floor_mod_f64(*x as f64, *y))),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(floor_mod_f64(*x, *y as f64))),
        _ => Err(num_mismatch("mod", a, b)),
    }
}

pub fn num_rem(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Err(arithmetic_error("remainder by zero")),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x % y)),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x % y)),
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 % y)),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x % *y as f64)),
        _ => Err(num_mismatch("rem", a, b)),
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

pub fn num_lt(a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x < y),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => Ok(x < y),
            _ => Err(num_mismatch("<", a, b)),
        },
    }
}

pub fn num_le(a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x <= y),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => Ok(x <= y),
            _ => Err(num_mismatch("<=", a, b)),
        },
    }
}

fn num_compare(op: Op, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    let result = match op {
        Op::Lt => num_lt(a, b)?,
        Op::Le => num_le(a, b)?,
        Op::Gt => num_lt(b, a)?,
        _ => num_le(b, a)?,
    };
    Ok(Value::Bool(result))
}

fn fused_binary(op: Op, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    match op {
        Op::AddLocals | Op::AddLocalConst => num_add(a, b, false),
        Op::SubLocals | Op::SubLocalConst => num_sub(a, b, false),
        Op::EqLocals | Op::EqLocalConst => Ok(Value::Bool(values_equal(a, b)?)),
        Op::LtLocals | Op::LtLocalConst => Ok(Value::Bool(num_lt(a, b)?)),
        _ => Ok(Value::Bool(num_le(a, b)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::ArenaGc;

    fn test_env() -> Rc<Env> {
        Env::new(Rc::new(ArenaGc::new()))
    }

    fn chunk_of(code: Vec<(Op, u16)>, consts: Vec<Value>) -> Rc<Chunk> {
        let mut chunk = Chunk::new();
        chunk.consts = consts;
        for (op, operand) in code {
            chunk.emit(op, operand);
        }
        Rc::new(chunk)
    }

    fn run(code: Vec<(Op, u16)>, consts: Vec<Value>) -> Result<Value, RuntimeError> {
        let env = test_env();
        let mut vm = Vm::new(env);
        vm.run_chunk(chunk_of(code, consts))
    }

    #[test]
    fn test_const_add() {
        let result = run(
            vec![(Op::Const, 0), (Op::Const, 1), (Op::Add, 0)],
            vec![Value::Int(1), Value::Int(2)],
        )
        .unwrap();
        assert_eq!(result, Value::Int(3));
    }

    #[test]
    fn test_overflow_promotes_to_float() {
        let result = run(
            vec![(Op::Const, 0), (Op::Const, 1), (Op::Add, 0)],
            vec![Value::Int(i64::MAX), Value::Int(1)],
        )
        .unwrap();
        assert_eq!(result, Value::Float(i64::MAX as f64 + 1.0));
    }

    #[test]
    fn test_promoting_add_errors_on_overflow() {
        let err = run(
            vec![(Op::Const, 0), (Op::Const, 1), (Op::AddP, 0)],
            vec![Value::Int(i64::MAX), Value::Int(1)],
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Arithmetic);
    }

    #[test]
    fn test_divide_by_zero() {
        for op in [Op::Div, Op::Mod, Op::Rem] {
            let err = run(
                vec![(Op::Const, 0), (Op::Const, 1), (op, 0)],
                vec![Value::Int(1), Value::Int(0)],
            )
            .unwrap_err();
            assert_eq!(err.kind, ErrorKind::Arithmetic);
        }
    }

    #[test]
    fn test_mod_sign_follows_divisor() {
        // floor-mod: the result takes the divisor's sign
        for ((x, y), expected) in [
            ((7, 3), 1),
            ((-7, 3), 2),
            ((7, -3), -2),
            ((-7, -3), -1),
            ((6, -3), 0),
        ] {
            let result = run(
                vec![(Op::Const, 0), (Op::Const, 1), (Op::Mod, 0)],
                vec![Value::Int(x), Value::Int(y)],
            )
            .unwrap();
            assert_eq!(result, Value::Int(expected), "(mod {} {})", x, y);
        }
        // rem truncates: the result takes the dividend's sign
        for ((x, y), expected) in [((7, -3), 1), ((-7, 3), -1)] {
            let result = run(
                vec![(Op::Const, 0), (Op::Const, 1), (Op::Rem, 0)],
                vec![Value::Int(x), Value::Int(y)],
            )
            .unwrap();
            assert_eq!(result, Value::Int(expected), "(rem {} {})", x, y);
        }
        // floats follow the same rule
        assert_eq!(
            num_mod(&Value::Float(7.5), &Value::Float(-3.0)).unwrap(),
            Value::Float(-1.5)
        );
        assert_eq!(
            num_mod(&Value::Int(-7), &Value::Float(3.0)).unwrap(),
            Value::Float(2.0)
        );
    }

    #[test]
    fn test_jump_if_false_takes_else() {
        // (if false 1 2)
        let result = run(
            vec![
                (Op::False, 0),
                (Op::JumpIfFalse, 2),
                (Op::Const, 0),
                (Op::Jump, 1),
                (Op::Const, 1),
            ],
            vec![Value::Int(1), Value::Int(2)],
        )
        .unwrap();
        assert_eq!(result, Value::Int(2));
    }

    #[test]
    fn test_collection_builders() {
        let result = run(
            vec![(Op::Const, 0), (Op::Const, 1), (Op::VecNew, 2)],
            vec![Value::Int(1), Value::Int(2)],
        )
        .unwrap();
        assert_eq!(result, Value::vector(vec![Value::Int(1), Value::Int(2)]));

        let result = run(
            vec![(Op::Const, 0), (Op::Const, 1), (Op::MapNew, 1)],
            vec![Value::keyword(None, "a"), Value::Int(1)],
        )
        .unwrap();
        assert_eq!(
            result,
            Value::map(vec![(Value::keyword(None, "a"), Value::Int(1))])
        );
    }

    #[test]
    fn test_def_and_var_load() {
        let env = test_env();
        let mut vm = Vm::new(env.clone());
        let sym = Value::symbol(None, "answer");
        let result = vm
            .run_chunk(chunk_of(
                vec![(Op::Const, 4), (Op::Def, 0), (Op::Pop, 0), (Op::VarLoad, 0)],
                vec![
                    sym,
                    Value::Int(1),
                    Value::Nil,
                    Value::Nil,
                    Value::Int(42),
                ],
            ))
            .unwrap();
        assert_eq!(result, Value::Int(42));
        let var = env.resolve("answer").unwrap();
        assert_eq!(var.root(), Value::Int(42));
        assert_eq!(&*var.ns, "user");
    }

    #[test]
    fn test_call_builtin() {
        fn plus_one(args: &[Value]) -> Result<Value, RuntimeError> {
            match args {
                [Value::Int(i)] => Ok(Value::Int(i + 1)),
                _ => Err(type_error("expected int")),
            }
        }
        let builtin = Value::Builtin(Rc::new(clove_core::value::BuiltinFn {
            name: "plus-one".into(),
            f: plus_one,
        }));
        let result = run(
            vec![(Op::Const, 0), (Op::Const, 1), (Op::Call, 1)],
            vec![builtin, Value::Int(41)],
        )
        .unwrap();
        assert_eq!(result, Value::Int(42));
    }

    #[test]
    fn test_keyword_and_map_invoke() {
        let m = Value::map(vec![(Value::keyword(None, "a"), Value::Int(1))]);
        let kw = Value::keyword(None, "a");
        assert_eq!(lookup_invoke(&kw, &[m.clone()]).unwrap(), Value::Int(1));
        assert_eq!(
            lookup_invoke(&kw, &[Value::Nil, Value::Int(9)]).unwrap(),
            Value::Int(9)
        );
        assert_eq!(lookup_invoke(&m, &[kw]).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_vector_invoke_bounds() {
        let v = Value::vector(vec![Value::Int(10)]);
        assert_eq!(lookup_invoke(&v, &[Value::Int(0)]).unwrap(), Value::Int(10));
        let err = lookup_invoke(&v, &[Value::Int(5)]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Index);
        assert_eq!(
            lookup_invoke(&v, &[Value::Int(5), Value::Nil]).unwrap(),
            Value::Nil
        );
    }

    #[test]
    fn test_fn_call_and_namespace_restore() {
        // proto: (fn [x y] (+ x y)) compiled by hand, defined in ns "lib"
        let proto = Rc::new(FnProto {
            name: Some("add2".into()),
            arity: 2,
            variadic: false,
            locals: 2,
            capture_slots: vec![],
            self_ref: false,
            code: vec![
                Instr::new(Op::LoadLocal, 0),
                Instr::new(Op::LoadLocal, 1),
                Instr::new(Op::Add, 0),
                Instr::new(Op::Ret, 0),
            ],
            consts: vec![],
            lines: vec![0; 4],
            cols: vec![0; 4],
        });
        let env = test_env();
        env.find_or_create_namespace("lib");
        let f = Value::Fn(Rc::new(Closure {
            proto,
            extras: vec![],
            captures: std::cell::RefCell::new(vec![]),
            ns: "lib".into(),
        }));
        let mut vm = Vm::new(env.clone());
        let result = vm
            .run_chunk(chunk_of(
                vec![
                    (Op::Const, 0),
                    (Op::Const, 1),
                    (Op::Const, 2),
                    (Op::Call, 2),
                ],
                vec![f, Value::Int(3), Value::Int(4)],
            ))
            .unwrap();
        assert_eq!(result, Value::Int(7));
        // namespace switched in and back out
        assert_eq!(&*env.current_ns_name(), "user");
        assert!(vm_pointer_clear());
    }

    #[test]
    fn test_variadic_collects_rest() {
        // (fn [x & more] more)
        let proto = Rc::new(FnProto {
            name: None,
            arity: 1,
            variadic: true,
            locals: 2,
            capture_slots: vec![],
            self_ref: false,
            code: vec![Instr::new(Op::LoadLocal, 1), Instr::new(Op::Ret, 0)],
            consts: vec![],
            lines: vec![0; 2],
            cols: vec![0; 2],
        });
        let f = Value::Fn(Rc::new(Closure {
            proto,
            extras: vec![],
            captures: std::cell::RefCell::new(vec![]),
            ns: "user".into(),
        }));
        let result = run(
            vec![
                (Op::Const, 0),
                (Op::Const, 1),
                (Op::Const, 2),
                (Op::Const, 3),
                (Op::Call, 3),
            ],
            vec![f.clone(), Value::Int(1), Value::Int(2), Value::Int(3)],
        )
        .unwrap();
        assert_eq!(result, Value::list(vec![Value::Int(2), Value::Int(3)]));

        // zero excess args -> nil
        let result = run(
            vec![(Op::Const, 0), (Op::Const, 1), (Op::Call, 1)],
            vec![f, Value::Int(1)],
        )
        .unwrap();
        assert_eq!(result, Value::Nil);
    }

    #[test]
    fn test_try_catch_binds_exception() {
        // (try (throw "boom") (catch Exception e e))
        let result = run(
            vec![
                (Op::TryBegin, 5),
                (Op::Const, 0),
                (Op::ThrowEx, 0),
                (Op::PopHandler, 0),
                (Op::Jump, 2),
                (Op::CatchBegin, 0),
                (Op::ExceptionTypeCheck, 1),
            ],
            vec![Value::Str("boom".into()), Value::Str("Exception".into())],
        )
        .unwrap();
        assert_eq!(result, Value::Str("boom".into()));
    }

    #[test]
    fn test_uncaught_throw_surfaces() {
        let err = run(
            vec![(Op::Const, 0), (Op::ThrowEx, 0)],
            vec![Value::Str("boom".into())],
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::User);
        assert_eq!(err.data, Some(Value::Str("boom".into())));
        // mailbox consumed on surfacing
        assert!(crate::exception::exception_slot_clear());
    }

    #[test]
    fn test_type_check_rethrows_mismatch() {
        // handler catches ArithmeticError only; a thrown string misses it
        let err = run(
            vec![
                (Op::TryBegin, 5),
                (Op::Const, 0),
                (Op::ThrowEx, 0),
                (Op::PopHandler, 0),
                (Op::Jump, 2),
                (Op::CatchBegin, 0),
                (Op::ExceptionTypeCheck, 1),
            ],
            vec![
                Value::Str("boom".into()),
                Value::Str("ArithmeticError".into()),
            ],
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::User);
    }

    #[test]
    fn test_recur_loop_counts_without_frame_growth() {
        // (loop [x 0] (if (< x 5) (recur (+ x 1)) x))
        let result = run(
            vec![
                (Op::Const, 0),      // 0: x = 0
                (Op::LoadLocal, 0),  // 1: loop top
                (Op::Const, 1),      // 2: 5
                (Op::Lt, 0),         // 3
                (Op::JumpIfFalse, 5), // 4 -> 10
                (Op::LoadLocal, 0),  // 5
                (Op::Const, 2),      // 6: 1
                (Op::Add, 0),        // 7
                (Op::Recur, 1),      // 8: base_offset 0, argc 1
                (Op::JumpBack, 9),   // 9: back to 1
                (Op::LoadLocal, 0),  // 10: result
                (Op::PopUnder, 1),   // 11: drop binding under result
            ],
            vec![Value::Int(0), Value::Int(5), Value::Int(1)],
        )
        .unwrap();
        assert_eq!(result, Value::Int(5));
    }

    #[test]
    fn test_fused_recur_loop() {
        // same loop with Recur+JumpBack fused into RecurLoop
        let result = run(
            vec![
                (Op::Const, 0),       // 0: x = 0
                (Op::LoadLocal, 0),   // 1: loop top
                (Op::Const, 1),       // 2: 5
                (Op::Lt, 0),          // 3
                (Op::JumpIfFalse, 5), // 4 -> 10
                (Op::LoadLocal, 0),   // 5
                (Op::Const, 2),       // 6
                (Op::Add, 0),         // 7
                (Op::RecurLoop, 1),   // 8
                (Op::Nop, 9),         // 9: distance word (10 - 1)
                (Op::LoadLocal, 0),   // 10
                (Op::PopUnder, 1),    // 11
            ],
            vec![Value::Int(0), Value::Int(5), Value::Int(1)],
        )
        .unwrap();
        assert_eq!(result, Value::Int(5));
    }

    #[test]
    fn test_closure_captures_parent_slot() {
        // outer local at slot 0 = 10; closure captures it and adds its arg
        let inner = Rc::new(FnProto {
            name: None,
            arity: 1,
            variadic: false,
            locals: 2, // capture + param
            capture_slots: vec![0],
            self_ref: false,
            code: vec![
                Instr::new(Op::LoadLocal, 0),
                Instr::new(Op::LoadLocal, 1),
                Instr::new(Op::Add, 0),
                Instr::new(Op::Ret, 0),
            ],
            consts: vec![],
            lines: vec![0; 4],
            cols: vec![0; 4],
        });
        let template = Value::Fn(Rc::new(Closure {
            proto: inner,
            extras: vec![],
            captures: std::cell::RefCell::new(vec![]),
            ns: "user".into(),
        }));
        let result = run(
            vec![
                (Op::Const, 0),   // x = 10 at slot 0
                (Op::Closure, 1), // capture slot 0
                (Op::Const, 2),   // arg 5
                (Op::Call, 1),
                (Op::PopUnder, 1),
            ],
            vec![Value::Int(10), template, Value::Int(5)],
        )
        .unwrap();
        assert_eq!(result, Value::Int(15));
    }

    #[test]
    fn test_superinstructions() {
        // locals a=7 b=3: add_locals, then lt_local_const against 100
        let result = run(
            vec![
                (Op::Const, 0),
                (Op::Const, 1),
                (Op::AddLocals, 0x0001),
                (Op::PopUnder, 2),
            ],
            vec![Value::Int(7), Value::Int(3)],
        )
        .unwrap();
        assert_eq!(result, Value::Int(10));

        let result = run(
            vec![
                (Op::Const, 0),
                (Op::LtLocalConst, 0x0001),
                (Op::PopUnder, 1),
            ],
            vec![Value::Int(7), Value::Int(100)],
        )
        .unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn test_fused_compare_branch() {
        // if 7 < 100 then 1 else 2, via LtLocalConstBr
        let result = run(
            vec![
                (Op::Const, 0),            // slot 0 = 7
                (Op::LtLocalConstBr, 0x0001), // 7 < consts[1]?
                (Op::Nop, 2),              // offset word: skip then-branch
                (Op::Const, 2),            // then: 1
                (Op::Jump, 1),
                (Op::Const, 3),            // else: 2
                (Op::PopUnder, 1),
            ],
            vec![Value::Int(7), Value::Int(100), Value::Int(1), Value::Int(2)],
        )
        .unwrap();
        assert_eq!(result, Value::Int(1));
    }

    #[test]
    fn test_multimethod_cache_probe() {
        let mm = Rc::new(MultiFn::new(
            "area".into(),
            Value::keyword(None, "shape"),
        ));
        let square_fn = {
            fn area(args: &[Value]) -> Result<Value, RuntimeError> {
                let Value::Map(m) = &args[0] else {
                    return Err(type_error("expected map"));
                };
                let Some(Value::Int(side)) = m.get(&Value::keyword(None, "side")) else {
                    return Err(type_error("expected :side"));
                };
                Ok(Value::Int(side * side))
            }
            Value::Builtin(Rc::new(clove_core::value::BuiltinFn {
                name: "square-area".into(),
                f: area,
            }))
        };
        mm.add_method(Value::keyword(None, "square"), square_fn);

        let shape = Value::map(vec![
            (Value::keyword(None, "shape"), Value::keyword(None, "square")),
            (Value::keyword(None, "side"), Value::Int(4)),
        ]);
        let env = test_env();
        let mut vm = Vm::new(env);
        let multi = Value::MultiFn(mm.clone());
        let r1 = vm
            .call_value_outer(&multi, std::slice::from_ref(&shape))
            .unwrap();
        assert_eq!(r1, Value::Int(16));
        assert_eq!(mm.cache_hits.get(), 0);
        let r2 = vm
            .call_value_outer(&multi, std::slice::from_ref(&shape))
            .unwrap();
        assert_eq!(r2, Value::Int(16));
        // second same-shape call must be served by the inline cache
        assert!(mm.cache_hits.get() >= 1);
    }

    #[test]
    fn test_protocol_dispatch_and_generation() {
        let pf = Rc::new(ProtocolFn::new(
            "Describable".into(),
            "describe".into(),
            "user".into(),
        ));
        fn int_impl(_args: &[Value]) -> Result<Value, RuntimeError> {
            Ok(Value::Str("int".into()))
        }
        fn obj_impl(_args: &[Value]) -> Result<Value, RuntimeError> {
            Ok(Value::Str("object".into()))
        }
        pf.extend(
            "Long".into(),
            Value::Builtin(Rc::new(clove_core::value::BuiltinFn {
                name: "describe-long".into(),
                f: int_impl,
            })),
        );
        pf.extend(
            "Object".into(),
            Value::Builtin(Rc::new(clove_core::value::BuiltinFn {
                name: "describe-obj".into(),
                f: obj_impl,
            })),
        );
        let env = test_env();
        let mut vm = Vm::new(env);
        let proto_fn = Value::ProtocolFn(pf.clone());
        assert_eq!(
            vm.call_value_outer(&proto_fn, &[Value::Int(1)]).unwrap(),
            Value::Str("int".into())
        );
        // Object default for a type with no exact entry
        assert_eq!(
            vm.call_value_outer(&proto_fn, &[Value::Str("s".into())])
                .unwrap(),
            Value::Str("object".into())
        );
        // cache was installed for the last dispatch
        assert!(pf.cache.borrow().is_some());
    }

    #[test]
    fn test_stack_overflow_is_internal() {
        // non-terminating self-call: (fn f [] (f)) without recur
        let proto = Rc::new(FnProto {
            name: Some("f".into()),
            arity: 0,
            variadic: false,
            locals: 1,
            capture_slots: vec![],
            self_ref: true,
            code: vec![Instr::new(Op::LoadLocal, 0), Instr::new(Op::Call, 0)],
            consts: vec![],
            lines: vec![0; 2],
            cols: vec![0; 2],
        });
        let f = Value::Fn(Rc::new(Closure {
            proto,
            extras: vec![],
            captures: std::cell::RefCell::new(vec![]),
            ns: "user".into(),
        }));
        let err = run(vec![(Op::Const, 0), (Op::Call, 0)], vec![f]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StackOverflow);
        assert!(!err.catchable());
    }

    #[test]
    fn test_letfn_patch_fixes_mutual_captures() {
        // even?/odd? via mutual recursion: even? captures odd? and vice
        // versa; both slots are nil when the closures are first made.
        // each body: (if (= n 0) <base-case> (other (- n 1)))
        // slot 0 = captured sibling, slot 1 = n
        fn mutual_proto(name: &str, base_case: Op) -> Rc<FnProto> {
            Rc::new(FnProto {
                name: Some(name.into()),
                arity: 1,
                variadic: false,
                locals: 2,
                capture_slots: vec![if name == "ev" { 1 } else { 0 }],
                self_ref: false,
                code: vec![
                    Instr::new(Op::EqLocalConst, 1 << 8),
                    Instr::new(Op::JumpIfFalse, 2),
                    Instr::new(base_case, 0),
                    Instr::new(Op::Ret, 0),
                    Instr::new(Op::LoadLocal, 0),
                    Instr::new(Op::LoadLocal, 1),
                    Instr::new(Op::Const, 1),
                    Instr::new(Op::Sub, 0),
                    Instr::new(Op::Call, 1),
                    Instr::new(Op::Ret, 0),
                ],
                consts: vec![Value::Int(0), Value::Int(1)],
                lines: vec![0; 10],
                cols: vec![0; 10],
            })
        }
        let even_proto = mutual_proto("ev", Op::True);
        let odd_proto = mutual_proto("od", Op::False);
        let even_template = Value::Fn(Rc::new(Closure {
            proto: even_proto,
            extras: vec![],
            captures: std::cell::RefCell::new(vec![]),
            ns: "user".into(),
        }));
        let odd_template = Value::Fn(Rc::new(Closure {
            proto: odd_proto,
            extras: vec![],
            captures: std::cell::RefCell::new(vec![]),
            ns: "user".into(),
        }));
        let result = run(
            vec![
                (Op::Nil, 0),          // slot 0 placeholder (even?)
                (Op::Nil, 0),          // slot 1 placeholder (odd?)
                (Op::Closure, 0),      // even? capturing slot 1 (nil)
                (Op::StoreLocal, 0),
                (Op::Closure, 1),      // odd? capturing slot 0
                (Op::StoreLocal, 1),
                (Op::LetfnPatch, 2),   // base 0, count 2
                (Op::LoadLocal, 0),
                (Op::Const, 2),        // 10
                (Op::Call, 1),
                (Op::PopUnder, 2),
            ],
            vec![even_template, odd_template, Value::Int(10)],
        )
        .unwrap();
        assert_eq!(result, Value::Bool(true));
    }
}
