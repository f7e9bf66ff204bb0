//! Bytecode compiler: nodes → chunks and fn protos
//!
//! The emitter keeps an abstract `stack_depth` model of the operand stack
//! and a list of live `Local` entries; a binding name always points at
//! the stack slot its init left behind (`add_local` after a push). Every
//! node compiles to exactly one net push, except `recur` and `throw`
//! which are non-local exits and keep the model balanced virtually.
//!
//! Frame layout for a compiled fn: `[captures…][self?][params…]`, so a
//! capture reference is a plain `load_local` of its capture index and the
//! self slot sits between captures and params.
//!
//! Calls whose callee is a var ref to a recognised intrinsic lower to
//! fused arithmetic/comparison ops (variadic forms left-fold). After
//! primary emission a peephole pass rewrites `load/load/op` and
//! `load/const/op` triples into superinstructions, fuses a comparison
//! superinstruction with a following `jump_if_false` (the next operand
//! slot becomes the branch offset), and collapses `recur`+`jump_back`
//! into `recur_loop`.

use crate::error::CodegenError;
use clove_core::chunk::{Chunk, FnProto, Instr, Op};
use clove_core::node::{
    Binding, CaptureSource, CatchClause, FnArity, FnNode, Node, NodeKind,
};
use clove_core::value::{Closure, Value};
use std::collections::HashSet;
use std::rc::Rc;

/// Intrinsic call heads lowered to fused ops.
const INTRINSICS: &[&str] = &[
    "+", "-", "*", "/", "mod", "rem", "<", "<=", ">", ">=", "=", "not=", "+'", "-'", "*'",
];

/// Compile one top-level node.
pub fn compile_top(node: &Node) -> Result<Chunk, CodegenError> {
    let mut emitter = Emitter::new(0);
    emitter.compile(node)?;
    if emitter.stack_depth != 1 {
        return Err(CodegenError::logic(
            format!(
                "internal stack model imbalance: depth {} at top level",
                emitter.stack_depth
            ),
            node.line,
            node.col,
        ));
    }
    peephole(&mut emitter.chunk);
    Ok(emitter.chunk)
}

#[derive(Debug)]
struct Local {
    name: Rc<str>,
    /// Analyzer binding identity.
    aslot: u16,
    /// Absolute frame stack position.
    stack_slot: u16,
}

struct LoopCtx {
    start_ip: usize,
    base_slot: u16,
    count: usize,
}

struct Emitter {
    chunk: Chunk,
    stack_depth: usize,
    max_depth: usize,
    locals: Vec<Local>,
    loop_stack: Vec<LoopCtx>,
    /// Captures + self slot count of the enclosing fn (0 at top level).
    header: u16,
}

impl Emitter {
    fn new(header: u16) -> Self {
        Emitter {
            chunk: Chunk::new(),
            stack_depth: header as usize,
            max_depth: header as usize,
            locals: Vec::new(),
            loop_stack: Vec::new(),
            header,
        }
    }

    fn emit(&mut self, op: Op, operand: u16) -> usize {
        self.chunk.emit(op, operand)
    }

    fn grow(&mut self, n: usize) {
        self.stack_depth += n;
        self.max_depth = self.max_depth.max(self.stack_depth);
    }

    fn shrink(&mut self, n: usize, node: &Node) -> Result<(), CodegenError> {
        if self.stack_depth < n {
            return Err(CodegenError::logic(
                "internal stack model underflow",
                node.line,
                node.col,
            ));
        }
        self.stack_depth -= n;
        Ok(())
    }

    fn add_const(&mut self, value: Value, node: &Node) -> Result<u16, CodegenError> {
        self.chunk.add_const(value).ok_or(CodegenError::ConstantPoolOverflow {
            line: node.line,
            col: node.col,
        })
    }

    fn operand_u16(&self, value: usize, node: &Node) -> Result<u16, CodegenError> {
        u16::try_from(value).map_err(|_| CodegenError::LocalSlotOverflow {
            line: node.line,
            col: node.col,
        })
    }

    /// A binding name points at slot `stack_depth - 1`, the value its
    /// init just pushed.
    fn add_local(&mut self, name: Rc<str>, aslot: u16, node: &Node) -> Result<(), CodegenError> {
        let stack_slot = self.operand_u16(self.stack_depth - 1, node)?;
        self.locals.push(Local {
            name,
            aslot,
            stack_slot,
        });
        Ok(())
    }

    fn lookup_local(&self, aslot: u16, node: &Node) -> Result<u16, CodegenError> {
        self.locals
            .iter()
            .rev()
            .find(|local| local.aslot == aslot)
            .map(|local| local.stack_slot)
            .ok_or_else(|| {
                CodegenError::logic(
                    format!("internal: unresolved local slot {}", aslot),
                    node.line,
                    node.col,
                )
            })
    }

    fn compile(&mut self, node: &Node) -> Result<(), CodegenError> {
        self.chunk.set_pos(node.line, node.col);
        match &node.kind {
            NodeKind::Const(value) | NodeKind::Quote(value) => self.compile_const(value, node)?,
            NodeKind::LocalRef { slot, .. } => {
                let stack_slot = self.lookup_local(*slot, node)?;
                self.emit(Op::LoadLocal, stack_slot);
                self.grow(1);
            }
            NodeKind::CaptureRef { index, .. } => {
                self.emit(Op::LoadLocal, *index);
                self.grow(1);
            }
            NodeKind::SelfRef { .. } => {
                // the self slot sits just below the params
                self.emit(Op::LoadLocal, self.header.saturating_sub(1));
                self.grow(1);
            }
            NodeKind::VarRef { ns, name } => {
                let idx = self.add_const(Value::symbol(ns.clone(), name.clone()), node)?;
                self.emit(Op::VarLoad, idx);
                self.grow(1);
            }
            NodeKind::If { test, then, els } => self.compile_if(test, then, els.as_deref(), node)?,
            NodeKind::Do(body) => self.compile_body(body, node)?,
            NodeKind::VectorLit(items) => {
                for item in items {
                    self.compile(item)?;
                }
                let n = self.operand_u16(items.len(), node)?;
                self.chunk.set_pos(node.line, node.col);
                self.emit(Op::VecNew, n);
                self.shrink(items.len(), node)?;
                self.grow(1);
            }
            NodeKind::SetLit(items) => {
                for item in items {
                    self.compile(item)?;
                }
                let n = self.operand_u16(items.len(), node)?;
                self.chunk.set_pos(node.line, node.col);
                self.emit(Op::SetNew, n);
                self.shrink(items.len(), node)?;
                self.grow(1);
            }
            NodeKind::MapLit(entries) => {
                for (k, v) in entries {
                    self.compile(k)?;
                    self.compile(v)?;
                }
                let n = self.operand_u16(entries.len(), node)?;
                self.chunk.set_pos(node.line, node.col);
                self.emit(Op::MapNew, n);
                self.shrink(entries.len() * 2, node)?;
                self.grow(1);
            }
            NodeKind::Let { bindings, body } => {
                let saved = self.locals.len();
                for binding in bindings {
                    self.compile(&binding.init)?;
                    self.add_local(binding.name.clone(), binding.slot, node)?;
                }
                self.compile_body(body, node)?;
                self.pop_under(bindings.len(), node)?;
                self.locals.truncate(saved);
            }
            NodeKind::Loop { bindings, body } => {
                let saved = self.locals.len();
                for binding in bindings {
                    self.compile(&binding.init)?;
                    self.add_local(binding.name.clone(), binding.slot, node)?;
                }
                let base_slot = match bindings.first() {
                    Some(first) => self.lookup_local(first.slot, node)?,
                    None => self.operand_u16(self.stack_depth, node)?,
                };
                self.loop_stack.push(LoopCtx {
                    start_ip: self.chunk.here(),
                    base_slot,
                    count: bindings.len(),
                });
                self.compile_body(body, node)?;
                self.loop_stack.pop();
                self.pop_under(bindings.len(), node)?;
                self.locals.truncate(saved);
            }
            NodeKind::Recur { args } => self.compile_recur(args, node)?,
            NodeKind::Fn(fnode) => {
                let template = self.compile_fn(fnode, node)?;
                let idx = self.add_const(template, node)?;
                self.chunk.set_pos(node.line, node.col);
                self.emit(Op::Closure, idx);
                self.grow(1);
            }
            NodeKind::Call { callee, args } => self.compile_call(callee, args, node)?,
            NodeKind::Def {
                name,
                init,
                dynamic,
                is_macro,
                doc,
                arglists,
                ..
            } => {
                match init {
                    Some(init) => self.compile(init)?,
                    None => {
                        self.emit(Op::Nil, 0);
                        self.grow(1);
                    }
                }
                // def metadata occupies the three pool slots after the
                // name symbol: line, doc, arglists
                let idx = self.add_const(Value::symbol(None, name.clone()), node)?;
                self.add_const(Value::Int(node.line as i64), node)?;
                self.add_const(
                    doc.as_ref().map(|d| Value::Str(d.clone())).unwrap_or(Value::Nil),
                    node,
                )?;
                self.add_const(
                    arglists
                        .as_ref()
                        .map(|a| Value::Str(a.clone()))
                        .unwrap_or(Value::Nil),
                    node,
                )?;
                let op = if *is_macro {
                    Op::DefMacro
                } else if *dynamic {
                    Op::DefDynamic
                } else {
                    Op::Def
                };
                self.chunk.set_pos(node.line, node.col);
                self.emit(op, idx);
                // init popped, var pushed
            }
            NodeKind::SetBang { ns, name, expr } => {
                self.compile(expr)?;
                let idx = self.add_const(Value::symbol(ns.clone(), name.clone()), node)?;
                self.chunk.set_pos(node.line, node.col);
                self.emit(Op::VarSet, idx);
                // set! peeks; the value stays as the result
            }
            NodeKind::Throw(expr) => {
                self.compile(expr)?;
                self.chunk.set_pos(node.line, node.col);
                self.emit(Op::ThrowEx, 0);
                // non-local exit: the push is virtual for join math
            }
            NodeKind::Try {
                body,
                catch,
                finally,
            } => self.compile_try(body, catch.as_ref(), finally.as_deref(), node)?,
            NodeKind::DefMulti { name, dispatch } => {
                self.compile(dispatch)?;
                let idx = self.add_const(Value::symbol(None, name.clone()), node)?;
                self.chunk.set_pos(node.line, node.col);
                self.emit(Op::DefMulti, idx);
            }
            NodeKind::DefMethod {
                multi,
                dispatch_value,
                method,
            } => {
                self.compile(dispatch_value)?;
                self.compile(method)?;
                let idx = self.add_const(Value::symbol(None, multi.clone()), node)?;
                self.chunk.set_pos(node.line, node.col);
                self.emit(Op::DefMethod, idx);
                self.shrink(2, node)?;
                self.grow(1);
            }
            NodeKind::DefProtocol { name, methods } => {
                let mut descriptor = vec![Value::symbol(None, name.clone())];
                descriptor.extend(methods.iter().map(|m| Value::symbol(None, m.clone())));
                let idx = self.add_const(Value::vector(descriptor), node)?;
                self.emit(Op::DefProtocol, idx);
                self.grow(1);
            }
            NodeKind::ExtendType {
                type_key,
                protocol,
                methods,
            } => {
                for (_, method) in methods {
                    self.compile(method)?;
                }
                let mut descriptor = vec![
                    Value::Str(type_key.clone()),
                    Value::symbol(None, protocol.clone()),
                ];
                descriptor.extend(methods.iter().map(|(m, _)| Value::symbol(None, m.clone())));
                let idx = self.add_const(Value::vector(descriptor), node)?;
                self.chunk.set_pos(node.line, node.col);
                self.emit(Op::ExtendType, idx);
                self.shrink(methods.len(), node)?;
                self.grow(1);
            }
            NodeKind::LazySeq { body } => {
                let template = self.compile_fn(body, node)?;
                let idx = self.add_const(template, node)?;
                self.chunk.set_pos(node.line, node.col);
                self.emit(Op::Closure, idx);
                self.emit(Op::LazySeqNew, 0);
                self.grow(1);
            }
            NodeKind::Letfn { bindings, body } => self.compile_letfn(bindings, body, node)?,
        }
        Ok(())
    }

    fn compile_const(&mut self, value: &Value, node: &Node) -> Result<(), CodegenError> {
        match value {
            Value::Nil => {
                self.emit(Op::Nil, 0);
            }
            Value::Bool(true) => {
                self.emit(Op::True, 0);
            }
            Value::Bool(false) => {
                self.emit(Op::False, 0);
            }
            other => {
                let idx = self.add_const(other.clone(), node)?;
                self.emit(Op::Const, idx);
            }
        }
        self.grow(1);
        Ok(())
    }

    /// Both branches leave one net push; the depth model is normalised at
    /// the join.
    fn compile_if(
        &mut self,
        test: &Node,
        then: &Node,
        els: Option<&Node>,
        node: &Node,
    ) -> Result<(), CodegenError> {
        self.compile(test)?;
        self.chunk.set_pos(node.line, node.col);
        let jump_false = self.emit(Op::JumpIfFalse, 0);
        self.shrink(1, node)?;
        let depth_before = self.stack_depth;

        self.compile(then)?;
        let jump_end = self.emit(Op::Jump, 0);
        let else_start = self.chunk.here();
        self.chunk
            .patch_operand(jump_false, self.operand_u16(else_start - jump_false - 1, node)?);

        self.stack_depth = depth_before;
        match els {
            Some(els) => self.compile(els)?,
            None => {
                self.emit(Op::Nil, 0);
                self.grow(1);
            }
        }
        let end = self.chunk.here();
        self.chunk
            .patch_operand(jump_end, self.operand_u16(end - jump_end - 1, node)?);
        self.stack_depth = depth_before + 1;
        self.max_depth = self.max_depth.max(self.stack_depth);
        Ok(())
    }

    /// `do` semantics: pop every statement result but the last.
    fn compile_body(&mut self, body: &[Node], node: &Node) -> Result<(), CodegenError> {
        let Some((last, init)) = body.split_last() else {
            self.emit(Op::Nil, 0);
            self.grow(1);
            return Ok(());
        };
        for stmt in init {
            self.compile(stmt)?;
            self.emit(Op::Pop, 0);
            self.shrink(1, node)?;
        }
        self.compile(last)
    }

    /// Keep the top, pop `n` beneath it.
    fn pop_under(&mut self, n: usize, node: &Node) -> Result<(), CodegenError> {
        if n == 0 {
            return Ok(());
        }
        let operand = self.operand_u16(n, node)?;
        self.emit(Op::PopUnder, operand);
        self.shrink(n, node)
    }

    fn compile_recur(&mut self, args: &[Node], node: &Node) -> Result<(), CodegenError> {
        let depth_before = self.stack_depth;
        for arg in args {
            self.compile(arg)?;
        }
        let Some(ctx) = self.loop_stack.last() else {
            return Err(CodegenError::logic(
                "internal: recur without target",
                node.line,
                node.col,
            ));
        };
        let (base_slot, start_ip) = (ctx.base_slot, ctx.start_ip);
        if base_slot > 0xff || args.len() > 0xff {
            return Err(CodegenError::LocalSlotOverflow {
                line: node.line,
                col: node.col,
            });
        }
        self.chunk.set_pos(node.line, node.col);
        self.emit(Op::Recur, (base_slot << 8) | args.len() as u16);
        let jump_back = self.emit(Op::JumpBack, 0);
        let distance = self.operand_u16(jump_back + 1 - start_ip, node)?;
        self.chunk.patch_operand(jump_back, distance);
        // non-local exit: balance the model as one net push
        self.stack_depth = depth_before + 1;
        self.max_depth = self.max_depth.max(self.stack_depth);
        Ok(())
    }

    fn compile_call(
        &mut self,
        callee: &Node,
        args: &[Node],
        node: &Node,
    ) -> Result<(), CodegenError> {
        if let NodeKind::VarRef { ns, name } = &callee.kind
            && ns.as_deref().is_none_or(|ns| ns == "clojure.core")
            && INTRINSICS.contains(&&**name)
            && self.compile_intrinsic(name, args, node)?
        {
            return Ok(());
        }
        self.compile(callee)?;
        for arg in args {
            self.compile(arg)?;
        }
        let argc = self.operand_u16(args.len(), node)?;
        self.chunk.set_pos(node.line, node.col);
        self.emit(Op::Call, argc);
        self.shrink(args.len() + 1, node)?;
        self.grow(1);
        Ok(())
    }

    /// Returns false when the call shape does not fuse (wrong arity for a
    /// comparison, say) and the general path should emit instead.
    fn compile_intrinsic(
        &mut self,
        name: &str,
        args: &[Node],
        node: &Node,
    ) -> Result<bool, CodegenError> {
        // binary-only intrinsics fuse at exactly two arguments
        if let Some(op) = match name {
            "mod" => Some(Op::Mod),
            "rem" => Some(Op::Rem),
            "<" => Some(Op::Lt),
            "<=" => Some(Op::Le),
            ">" => Some(Op::Gt),
            ">=" => Some(Op::Ge),
            "=" => Some(Op::Eq),
            "not=" => Some(Op::Ne),
            _ => None,
        } {
            if args.len() != 2 {
                return Ok(false);
            }
            self.compile(&args[0])?;
            self.compile(&args[1])?;
            self.chunk.set_pos(node.line, node.col);
            self.emit(op, 0);
            self.shrink(2, node)?;
            self.grow(1);
            return Ok(true);
        }

        let op = match name {
            "+" => Op::Add,
            "-" => Op::Sub,
            "*" => Op::Mul,
            "/" => Op::Div,
            "+'" => Op::AddP,
            "-'" => Op::SubP,
            "*'" => Op::MulP,
            _ => return Ok(false),
        };

        match (name, args.len()) {
            // zero-arg + and * have identities; - and / are errors
            ("+" | "+'", 0) => self.compile_const(&Value::Int(0), node)?,
            ("*" | "*'", 0) => self.compile_const(&Value::Int(1), node)?,
            ("-" | "-'" | "/", 0) => {
                return Err(CodegenError::logic(
                    format!("wrong number of args (0) passed to {}", name),
                    node.line,
                    node.col,
                ));
            }
            ("-" | "-'", 1) => {
                // (- x) is 0 - x
                self.compile_const(&Value::Int(0), node)?;
                self.compile(&args[0])?;
                self.chunk.set_pos(node.line, node.col);
                self.emit(op, 0);
                self.shrink(2, node)?;
                self.grow(1);
            }
            ("/", 1) => {
                // (/ x) is 1.0 / x
                self.compile_const(&Value::Float(1.0), node)?;
                self.compile(&args[0])?;
                self.chunk.set_pos(node.line, node.col);
                self.emit(op, 0);
                self.shrink(2, node)?;
                self.grow(1);
            }
            (_, 1) => {
                // (+ x) and (* x) pass the value through
                self.compile(&args[0])?;
            }
            _ => {
                // left fold
                self.compile(&args[0])?;
                for arg in &args[1..] {
                    self.compile(arg)?;
                    self.chunk.set_pos(node.line, node.col);
                    self.emit(op, 0);
                    self.shrink(2, node)?;
                    self.grow(1);
                }
            }
        }
        Ok(true)
    }

    fn compile_try(
        &mut self,
        body: &[Node],
        catch: Option<&CatchClause>,
        finally: Option<&[Node]>,
        node: &Node,
    ) -> Result<(), CodegenError> {
        let depth_before = self.stack_depth;
        self.chunk.set_pos(node.line, node.col);
        let try_begin = self.emit(Op::TryBegin, 0);
        self.compile_body(body, node)?;
        self.emit(Op::PopHandler, 0);
        if let Some(finally) = finally {
            self.compile_finally(finally, node)?;
        }
        let jump_end = self.emit(Op::Jump, 0);

        let catch_ip = self.chunk.here();
        self.chunk
            .patch_operand(try_begin, self.operand_u16(catch_ip - try_begin, node)?);
        // the unwinder restored the stack and pushed the exception value
        self.stack_depth = depth_before + 1;
        self.max_depth = self.max_depth.max(self.stack_depth);
        self.emit(Op::CatchBegin, 0);
        match catch {
            Some(clause) => {
                let idx = self.add_const(Value::Str(clause.class.clone()), node)?;
                self.emit(Op::ExceptionTypeCheck, idx);
                let saved = self.locals.len();
                self.add_local(clause.binding.clone(), clause.slot, node)?;
                self.compile_body(&clause.body, node)?;
                self.pop_under(1, node)?;
                self.locals.truncate(saved);
                if let Some(finally) = finally {
                    self.compile_finally(finally, node)?;
                }
            }
            None => {
                // synthetic catch-all: run finally, then re-throw
                if let Some(finally) = finally {
                    self.compile_finally(finally, node)?;
                }
                self.emit(Op::ThrowEx, 0);
                self.shrink(1, node)?;
                self.grow(1);
            }
        }
        let end = self.chunk.here();
        self.chunk
            .patch_operand(jump_end, self.operand_u16(end - jump_end - 1, node)?);
        self.emit(Op::TryEnd, 0);
        self.stack_depth = depth_before + 1;
        self.max_depth = self.max_depth.max(self.stack_depth);
        Ok(())
    }

    /// Finally bodies run for effect only.
    fn compile_finally(&mut self, finally: &[Node], node: &Node) -> Result<(), CodegenError> {
        for stmt in finally {
            self.compile(stmt)?;
            self.emit(Op::Pop, 0);
            self.shrink(1, node)?;
        }
        Ok(())
    }

    fn compile_letfn(
        &mut self,
        bindings: &[(Rc<str>, u16, Rc<FnNode>)],
        body: &[Node],
        node: &Node,
    ) -> Result<(), CodegenError> {
        let saved = self.locals.len();
        for (name, aslot, _) in bindings {
            self.emit(Op::Nil, 0);
            self.grow(1);
            self.add_local(name.clone(), *aslot, node)?;
        }
        let first_slot = match bindings.first() {
            Some((_, aslot, _)) => self.lookup_local(*aslot, node)?,
            None => 0,
        };
        for (_, aslot, fnode) in bindings {
            let template = self.compile_fn(fnode, node)?;
            let idx = self.add_const(template, node)?;
            self.emit(Op::Closure, idx);
            self.grow(1);
            let slot = self.lookup_local(*aslot, node)?;
            self.emit(Op::StoreLocal, slot);
            self.shrink(1, node)?;
        }
        if first_slot > 0xff || bindings.len() > 0xff {
            return Err(CodegenError::LocalSlotOverflow {
                line: node.line,
                col: node.col,
            });
        }
        self.emit(Op::LetfnPatch, (first_slot << 8) | bindings.len() as u16);
        self.compile_body(body, node)?;
        self.pop_under(bindings.len(), node)?;
        self.locals.truncate(saved);
        Ok(())
    }

    /// Nested compilation of every arity; yields the closure template
    /// placed in the constant pool for the `closure` opcode.
    fn compile_fn(&mut self, fnode: &FnNode, node: &Node) -> Result<Value, CodegenError> {
        let capture_slots: Vec<u16> = fnode
            .captures
            .iter()
            .map(|source| match source {
                CaptureSource::ParentLocal(aslot) => self.lookup_local(*aslot, node),
                CaptureSource::ParentCapture(index) => Ok(*index),
                CaptureSource::ParentSelf => Ok(self.header.saturating_sub(1)),
            })
            .collect::<Result<_, _>>()?;
        let self_ref = fnode.name.is_some();

        let mut protos = Vec::with_capacity(fnode.arities.len());
        for arity in &fnode.arities {
            protos.push(Rc::new(compile_arity(
                fnode,
                arity,
                capture_slots.clone(),
                self_ref,
            )?));
        }
        let proto = protos.remove(0);
        Ok(Value::Fn(Rc::new(Closure {
            proto,
            extras: protos,
            // the VM stamps the defining namespace when `closure` fires
            captures: std::cell::RefCell::new(Vec::new()),
            ns: "user".into(),
        })))
    }
}

fn compile_arity(
    fnode: &FnNode,
    arity: &FnArity,
    capture_slots: Vec<u16>,
    self_ref: bool,
) -> Result<FnProto, CodegenError> {
    let header = capture_slots.len() as u16 + self_ref as u16;
    let mut emitter = Emitter::new(header);

    let param_count = arity.params.len() + arity.variadic as usize;
    for (i, param) in arity.params.iter().enumerate() {
        emitter.locals.push(Local {
            name: param.clone(),
            aslot: i as u16,
            stack_slot: header + i as u16,
        });
    }
    if let Some(rest) = &arity.rest_name {
        emitter.locals.push(Local {
            name: rest.clone(),
            aslot: arity.params.len() as u16,
            stack_slot: header + arity.params.len() as u16,
        });
    }
    emitter.stack_depth = header as usize + param_count;
    emitter.max_depth = emitter.stack_depth;

    // recur in fn tail position rebinds the params and restarts the body
    emitter.loop_stack.push(LoopCtx {
        start_ip: 0,
        base_slot: header,
        count: param_count,
    });

    let body_node = Node::new(NodeKind::Do(Vec::new()), fnode.line, fnode.col);
    emitter.chunk.set_pos(fnode.line, fnode.col);
    emitter.compile_body(&arity.body, &body_node)?;
    emitter.emit(Op::Ret, 0);

    peephole(&mut emitter.chunk);
    let chunk = emitter.chunk;
    Ok(FnProto {
        name: fnode.name.clone(),
        arity: arity.params.len() as u8,
        variadic: arity.variadic,
        locals: emitter.max_depth as u16,
        capture_slots,
        self_ref,
        code: chunk.code,
        consts: chunk.consts,
        lines: chunk.lines,
        cols: chunk.cols,
    })
}

// ----- peephole fusion -----

/// Instruction indices that are branch targets; fusion never rewrites
/// across them.
fn jump_targets(code: &[Instr]) -> HashSet<usize> {
    let mut targets = HashSet::new();
    for (i, instr) in code.iter().enumerate() {
        match instr.op {
            Op::Jump | Op::JumpIfFalse => {
                targets.insert(i + 1 + instr.operand as usize);
            }
            Op::JumpBack => {
                targets.insert((i + 1).saturating_sub(instr.operand as usize));
            }
            Op::TryBegin => {
                targets.insert(i + instr.operand as usize);
            }
            _ => {}
        }
    }
    targets
}

fn pack_locals(a: u16, b: u16) -> Option<u16> {
    (a <= 0xff && b <= 0xff).then_some((a << 8) | b)
}

/// Rewrites preserve instruction positions (padding with `nop`) so jump
/// offsets stay valid.
fn peephole(chunk: &mut Chunk) {
    let targets = jump_targets(&chunk.code);
    let clear = |code: &mut Vec<Instr>, at: usize| {
        code[at] = Instr::new(Op::Nop, 0);
    };

    // load/load/op and load/const/op triples
    let mut i = 0;
    while i + 2 < chunk.code.len() {
        if targets.contains(&(i + 1)) || targets.contains(&(i + 2)) {
            i += 1;
            continue;
        }
        let (first, second, third) = (chunk.code[i], chunk.code[i + 1], chunk.code[i + 2]);
        let fused = match (first.op, second.op) {
            (Op::LoadLocal, Op::LoadLocal) => match third.op {
                Op::Add => Some(Op::AddLocals),
                Op::Sub => Some(Op::SubLocals),
                Op::Eq => Some(Op::EqLocals),
                Op::Lt => Some(Op::LtLocals),
                Op::Le => Some(Op::LeLocals),
                _ => None,
            },
            (Op::LoadLocal, Op::Const) => match third.op {
                Op::Add => Some(Op::AddLocalConst),
                Op::Sub => Some(Op::SubLocalConst),
                Op::Eq => Some(Op::EqLocalConst),
                Op::Lt => Some(Op::LtLocalConst),
                Op::Le => Some(Op::LeLocalConst),
                _ => None,
            },
            _ => None,
        };
        if let Some(op) = fused
            && let Some(packed) = pack_locals(first.operand, second.operand)
        {
            chunk.code[i] = Instr::new(op, packed);
            clear(&mut chunk.code, i + 1);
            clear(&mut chunk.code, i + 2);
            i += 3;
            continue;
        }
        i += 1;
    }

    // comparison superinstruction + jump_if_false: the following operand
    // slot becomes the branch offset
    let mut i = 0;
    while i + 3 < chunk.code.len() {
        let cmp = chunk.code[i].op;
        let branch_op = match cmp {
            Op::EqLocals => Some(Op::EqLocalsBr),
            Op::LtLocals => Some(Op::LtLocalsBr),
            Op::LeLocals => Some(Op::LeLocalsBr),
            Op::EqLocalConst => Some(Op::EqLocalConstBr),
            Op::LtLocalConst => Some(Op::LtLocalConstBr),
            Op::LeLocalConst => Some(Op::LeLocalConstBr),
            _ => None,
        };
        if let Some(branch_op) = branch_op
            && chunk.code[i + 1].op == Op::Nop
            && chunk.code[i + 2].op == Op::Nop
            && chunk.code[i + 3].op == Op::JumpIfFalse
            && !targets.contains(&(i + 1))
            && !targets.contains(&(i + 2))
            && !targets.contains(&(i + 3))
        {
            let offset = chunk.code[i + 3].operand + 2;
            chunk.code[i] = Instr::new(branch_op, chunk.code[i].operand);
            chunk.code[i + 1] = Instr::new(Op::Nop, offset);
            clear(&mut chunk.code, i + 2);
            clear(&mut chunk.code, i + 3);
            i += 4;
            continue;
        }
        i += 1;
    }

    // recur + jump_back fuse into recur_loop with an inline distance word
    let mut i = 0;
    while i + 1 < chunk.code.len() {
        if chunk.code[i].op == Op::Recur
            && chunk.code[i + 1].op == Op::JumpBack
            && !targets.contains(&(i + 1))
        {
            let distance = chunk.code[i + 1].operand;
            chunk.code[i] = Instr::new(Op::RecurLoop, chunk.code[i].operand);
            chunk.code[i + 1] = Instr::new(Op::Nop, distance);
            i += 2;
            continue;
        }
        i += 1;
    }
}
