//! Analyzer: forms → nodes
//!
//! Resolves lexical scope, classifies names (local, capture, self, var),
//! validates special-form shapes, desugars destructuring, expands macros,
//! and marks `recur` targets. Special-form dispatch is a fixed table keyed
//! on the unqualified head symbol; any other head is a call.
//!
//! Scope model: one `FnScope` per function (the top level is a scope
//! too). Local slots index the treewalk evaluator's frame; the bytecode
//! compiler re-resolves names against its own stack model and uses the
//! slots here only as stable binding identities. Free variables found in
//! enclosing scopes become capture entries, threaded transitively through
//! intermediate functions.

use crate::error::SyntaxError;
use clove_core::form::{Form, FormKind};
use clove_core::node::{
    Binding, CaptureSource, CatchClause, FnArity, FnNode, Node, NodeKind,
};
use clove_core::value::Value;
use clove_runtime::{Env, EnvGuard, call_function};
use std::rc::Rc;

/// The special-form dispatch table.
const SPECIAL_FORMS: &[&str] = &[
    "if",
    "do",
    "let",
    "let*",
    "fn",
    "fn*",
    "def",
    "defmacro",
    "quote",
    "throw",
    "try",
    "recur",
    "loop",
    "set!",
    "defmulti",
    "defmethod",
    "defprotocol",
    "extend-type",
    "lazy-seq",
    "letfn",
    "var",
];

struct FnScope {
    /// Visible bindings, innermost last (shadowing by search order).
    locals: Vec<(Rc<str>, u16)>,
    next_slot: u16,
    max_slot: u16,
    captures: Vec<(Rc<str>, CaptureSource)>,
    self_name: Option<Rc<str>>,
}

impl FnScope {
    fn new(self_name: Option<Rc<str>>) -> Self {
        FnScope {
            locals: Vec::new(),
            next_slot: 0,
            max_slot: 0,
            captures: Vec::new(),
            self_name,
        }
    }
}

enum Resolved {
    Local(u16),
    Capture(u16),
    SelfRef,
}

enum RecurCtx {
    Fn { count: usize },
    Loop { count: usize, first_slot: u16 },
    /// `try` blocks recur from crossing them.
    Barrier,
}

pub struct Analyzer {
    env: Option<Rc<Env>>,
    scopes: Vec<FnScope>,
    recur_stack: Vec<RecurCtx>,
    synth_counter: u64,
}

impl Analyzer {
    /// An analyzer with an environment resolves vars eagerly (unresolved
    /// symbols are errors) and expands macros.
    pub fn new(env: Option<Rc<Env>>) -> Self {
        Analyzer {
            env,
            scopes: vec![FnScope::new(None)],
            recur_stack: Vec::new(),
            synth_counter: 0,
        }
    }

    pub fn analyze(&mut self, form: &Form) -> Result<Node, SyntaxError> {
        self.analyze_form(form, false)
    }

    fn err(&self, message: impl Into<String>, form: &Form) -> SyntaxError {
        SyntaxError::new(message, form.line, form.col)
    }

    fn synth_name(&mut self, prefix: &str) -> Rc<str> {
        self.synth_counter += 1;
        format!("{}__{}", prefix, self.synth_counter).into()
    }

    // ----- scope -----

    fn declare_local(&mut self, name: Rc<str>) -> u16 {
        let scope = self.scopes.last_mut().expect("scope stack never empty");
        let slot = scope.next_slot;
        scope.next_slot += 1;
        scope.max_slot = scope.max_slot.max(scope.next_slot);
        scope.locals.push((name, slot));
        slot
    }

    fn scope_mark(&self) -> (usize, u16) {
        let scope = self.scopes.last().expect("scope stack never empty");
        (scope.locals.len(), scope.next_slot)
    }

    fn scope_release(&mut self, mark: (usize, u16)) {
        let scope = self.scopes.last_mut().expect("scope stack never empty");
        scope.locals.truncate(mark.0);
        scope.next_slot = mark.1;
    }

    fn resolve_name(&mut self, name: &str) -> Option<Resolved> {
        self.resolve_in(self.scopes.len() - 1, name)
    }

    fn resolve_in(&mut self, idx: usize, name: &str) -> Option<Resolved> {
        if let Some((_, slot)) = self.scopes[idx]
            .locals
            .iter()
            .rev()
            .find(|(n, _)| &**n == name)
        {
            return Some(Resolved::Local(*slot));
        }
        if self.scopes[idx].self_name.as_deref() == Some(name) {
            return Some(Resolved::SelfRef);
        }
        if let Some(pos) = self.scopes[idx]
            .captures
            .iter()
            .position(|(n, _)| &**n == name)
        {
            return Some(Resolved::Capture(pos as u16));
        }
        if idx == 0 {
            return None;
        }
        let source = match self.resolve_in(idx - 1, name)? {
            Resolved::Local(slot) => CaptureSource::ParentLocal(slot),
            Resolved::Capture(index) => CaptureSource::ParentCapture(index),
            Resolved::SelfRef => CaptureSource::ParentSelf,
        };
        let scope = &mut self.scopes[idx];
        scope.captures.push((name.into(), source));
        Some(Resolved::Capture((scope.captures.len() - 1) as u16))
    }

    // ----- dispatch -----

    fn analyze_form(&mut self, form: &Form, tail: bool) -> Result<Node, SyntaxError> {
        let (line, col) = (form.line, form.col);
        let node = |kind| Ok(Node::new(kind, line, col));
        match &form.kind {
            FormKind::Nil
            | FormKind::Bool(_)
            | FormKind::Int(_)
            | FormKind::Float(_)
            | FormKind::Char(_)
            | FormKind::Str(_)
            | FormKind::Keyword { .. }
            | FormKind::Ratio(_)
            | FormKind::BigInt(_)
            | FormKind::BigDecimal(_)
            | FormKind::Regex(_) => node(NodeKind::Const(form.to_value())),
            FormKind::Tagged { .. } => node(NodeKind::Const(form.to_value())),
            FormKind::Symbol { ns, name } => self.analyze_symbol(ns, name, form),
            FormKind::Vector(items) => {
                if items.iter().all(is_constant_form) {
                    return node(NodeKind::Const(form.to_value()));
                }
                let nodes = self.analyze_all(items)?;
                node(NodeKind::VectorLit(nodes))
            }
            FormKind::Set(items) => {
                if items.iter().all(is_constant_form) {
                    return node(NodeKind::Const(form.to_value()));
                }
                let nodes = self.analyze_all(items)?;
                node(NodeKind::SetLit(nodes))
            }
            FormKind::Map(items) => {
                if items.iter().all(is_constant_form) {
                    return node(NodeKind::Const(form.to_value()));
                }
                let mut entries = Vec::with_capacity(items.len() / 2);
                for pair in items.chunks_exact(2) {
                    let k = self.analyze_form(&pair[0], false)?;
                    let v = self.analyze_form(&pair[1], false)?;
                    entries.push((k, v));
                }
                node(NodeKind::MapLit(entries))
            }
            FormKind::List(items) => {
                let Some(head) = items.first() else {
                    return node(NodeKind::Const(Value::list(Vec::new())));
                };
                if let FormKind::Symbol { ns: None, name } = &head.kind
                    && SPECIAL_FORMS.contains(&&**name)
                    && self.resolve_name(name).is_none()
                {
                    return self.analyze_special(name.clone(), form, &items[1..], tail);
                }
                if let Some(expanded) = self.macroexpand(head, &items[1..], form)? {
                    return self.analyze_form(&expanded, tail);
                }
                let callee = self.analyze_form(head, false)?;
                let args = self.analyze_all(&items[1..])?;
                node(NodeKind::Call {
                    callee: Box::new(callee),
                    args,
                })
            }
        }
    }

    fn analyze_all(&mut self, forms: &[Form]) -> Result<Vec<Node>, SyntaxError> {
        forms
            .iter()
            .map(|form| self.analyze_form(form, false))
            .collect()
    }

    /// Statements run non-tail; the final form keeps the caller's tail
    /// position.
    fn analyze_body(&mut self, forms: &[Form], tail: bool) -> Result<Vec<Node>, SyntaxError> {
        let mut nodes = Vec::with_capacity(forms.len());
        for (i, form) in forms.iter().enumerate() {
            let is_last = i + 1 == forms.len();
            nodes.push(self.analyze_form(form, tail && is_last)?);
        }
        Ok(nodes)
    }

    fn analyze_symbol(
        &mut self,
        ns: &Option<Rc<str>>,
        name: &Rc<str>,
        form: &Form,
    ) -> Result<Node, SyntaxError> {
        let (line, col) = (form.line, form.col);
        if ns.is_none() {
            match self.resolve_name(name) {
                Some(Resolved::Local(slot)) => {
                    return Ok(Node::new(
                        NodeKind::LocalRef {
                            slot,
                            name: name.clone(),
                        },
                        line,
                        col,
                    ));
                }
                Some(Resolved::Capture(index)) => {
                    return Ok(Node::new(
                        NodeKind::CaptureRef {
                            index,
                            name: name.clone(),
                        },
                        line,
                        col,
                    ));
                }
                Some(Resolved::SelfRef) => {
                    return Ok(Node::new(NodeKind::SelfRef { name: name.clone() }, line, col));
                }
                None => {}
            }
        }
        if let Some(env) = &self.env {
            let found = match ns {
                Some(ns) => env.resolve_qualified(ns, name).is_some(),
                None => env.resolve(name).is_some(),
            };
            if !found {
                return Err(self.err(
                    format!(
                        "unable to resolve symbol: {} in this context",
                        match ns {
                            Some(ns) => format!("{}/{}", ns, name),
                            None => name.to_string(),
                        }
                    ),
                    form,
                ));
            }
        }
        Ok(Node::new(
            NodeKind::VarRef {
                ns: ns.clone(),
                name: name.clone(),
            },
            line,
            col,
        ))
    }

    // ----- macro expansion -----

    fn macroexpand(
        &mut self,
        head: &Form,
        args: &[Form],
        form: &Form,
    ) -> Result<Option<Form>, SyntaxError> {
        let Some(env) = self.env.clone() else {
            return Ok(None);
        };
        let FormKind::Symbol { ns, name } = &head.kind else {
            return Ok(None);
        };
        if ns.is_none() && self.resolve_name(name).is_some() {
            // locally shadowed
            return Ok(None);
        }
        let var = match ns {
            Some(ns) => env.resolve_qualified(ns, name),
            None => env.resolve(name),
        };
        let Some(var) = var else {
            return Ok(None);
        };
        if !var.is_macro.get() {
            return Ok(None);
        }
        let macro_fn = var.root();
        let macro_args: Vec<Value> = args.iter().map(Form::to_value).collect();
        let _guard = EnvGuard::install(env);
        let expansion = call_function(&macro_fn, &macro_args).map_err(|e| {
            self.err(format!("macro expansion of {} failed: {}", name, e), form)
        })?;
        value_to_form(&expansion, form.line, form.col)
            .map(Some)
            .map_err(|message| self.err(message, form))
    }

    // ----- special forms -----

    fn analyze_special(
        &mut self,
        name: Rc<str>,
        form: &Form,
        args: &[Form],
        tail: bool,
    ) -> Result<Node, SyntaxError> {
        let (line, col) = (form.line, form.col);
        let kind = match &*name {
            "if" => self.analyze_if(form, args, tail)?,
            "do" => NodeKind::Do(self.analyze_body(args, tail)?),
            "let" | "let*" => self.analyze_let(form, args, tail)?,
            "loop" => self.analyze_loop(form, args)?,
            "fn" | "fn*" => {
                let fnode = self.analyze_fn(form, args)?;
                NodeKind::Fn(fnode)
            }
            "def" => self.analyze_def(form, args, false)?,
            "defmacro" => self.analyze_defmacro(form, args)?,
            "quote" => {
                let [quoted] = args else {
                    return Err(self.err("quote expects exactly one form", form));
                };
                NodeKind::Quote(quoted.to_value())
            }
            "throw" => {
                let [expr] = args else {
                    return Err(self.err("throw expects exactly one form", form));
                };
                NodeKind::Throw(Box::new(self.analyze_form(expr, false)?))
            }
            "try" => self.analyze_try(form, args)?,
            "recur" => self.analyze_recur(form, args, tail)?,
            "set!" => self.analyze_set(form, args)?,
            "defmulti" => {
                let [name_form, dispatch] = args else {
                    return Err(self.err("defmulti expects a name and a dispatch fn", form));
                };
                let name = simple_symbol(name_form)
                    .ok_or_else(|| self.err("defmulti name must be a symbol", name_form))?;
                self.ensure_var(&name);
                NodeKind::DefMulti {
                    name,
                    dispatch: Box::new(self.analyze_form(dispatch, false)?),
                }
            }
            "defmethod" => self.analyze_defmethod(form, args)?,
            "defprotocol" => self.analyze_defprotocol(form, args)?,
            "extend-type" => self.analyze_extend_type(form, args)?,
            "lazy-seq" => {
                let body = self.analyze_thunk(args, form)?;
                NodeKind::LazySeq { body }
            }
            "letfn" => self.analyze_letfn(form, args, tail)?,
            "var" => {
                let [sym] = args else {
                    return Err(self.err("var expects a symbol", form));
                };
                let FormKind::Symbol { ns, name } = &sym.kind else {
                    return Err(self.err("var expects a symbol", sym));
                };
                let Some(env) = &self.env else {
                    return Err(self.err("var requires an environment", form));
                };
                let var = match ns {
                    Some(ns) => env.resolve_qualified(ns, name),
                    None => env.resolve(name),
                }
                .unwrap_or_else(|| env.intern(&env.current_ns_name(), name.clone()));
                NodeKind::Const(Value::Var(var))
            }
            _ => return Err(self.err(format!("unknown special form {}", name), form)),
        };
        Ok(Node::new(kind, line, col))
    }

    fn analyze_if(
        &mut self,
        form: &Form,
        args: &[Form],
        tail: bool,
    ) -> Result<NodeKind, SyntaxError> {
        let (test, then, els) = match args {
            [test, then] => (test, then, None),
            [test, then, els] => (test, then, Some(els)),
            _ => return Err(self.err("if expects a test, a then, and an optional else", form)),
        };
        Ok(NodeKind::If {
            test: Box::new(self.analyze_form(test, false)?),
            then: Box::new(self.analyze_form(then, tail)?),
            els: match els {
                Some(els) => Some(Box::new(self.analyze_form(els, tail)?)),
                None => None,
            },
        })
    }

    /// Binding pairs evaluate left to right; each sees all earlier
    /// bindings. Destructuring patterns expand into temp bindings plus
    /// accessor bindings.
    fn analyze_bindings(&mut self, vector: &Form) -> Result<Vec<Binding>, SyntaxError> {
        let FormKind::Vector(items) = &vector.kind else {
            return Err(self.err("expected a binding vector", vector));
        };
        if items.len() % 2 != 0 {
            return Err(self.err(
                "binding vector must contain an even number of forms",
                vector,
            ));
        }
        let mut queue: std::collections::VecDeque<(Form, Form)> = items
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        let mut bindings = Vec::new();
        while let Some((pattern, init)) = queue.pop_front() {
            match &pattern.kind {
                FormKind::Symbol { ns: None, name } => {
                    let init = self.analyze_form(&init, false)?;
                    let slot = self.declare_local(name.clone());
                    bindings.push(Binding {
                        name: name.clone(),
                        slot,
                        init,
                    });
                }
                FormKind::Vector(_) | FormKind::Map(_) => {
                    let tmp = self.synth_name("__vec__p");
                    let tmp_form = Form::symbol(tmp.clone(), pattern.line, pattern.col);
                    let expanded = expand_pattern(&pattern, &tmp_form)
                        .map_err(|message| self.err(message, &pattern))?;
                    let init = self.analyze_form(&init, false)?;
                    let slot = self.declare_local(tmp.clone());
                    bindings.push(Binding {
                        name: tmp,
                        slot,
                        init,
                    });
                    for pair in expanded.into_iter().rev() {
                        queue.push_front(pair);
                    }
                }
                _ => {
                    return Err(self.err("binding name must be a symbol or pattern", &pattern));
                }
            }
        }
        Ok(bindings)
    }

    fn analyze_let(
        &mut self,
        form: &Form,
        args: &[Form],
        tail: bool,
    ) -> Result<NodeKind, SyntaxError> {
        let [vector, body @ ..] = args else {
            return Err(self.err("let expects a binding vector", form));
        };
        let mark = self.scope_mark();
        let bindings = self.analyze_bindings(vector)?;
        let body = self.analyze_body(body, tail)?;
        self.scope_release(mark);
        Ok(NodeKind::Let { bindings, body })
    }

    fn analyze_loop(&mut self, form: &Form, args: &[Form]) -> Result<NodeKind, SyntaxError> {
        let [vector, body @ ..] = args else {
            return Err(self.err("loop expects a binding vector", form));
        };
        let FormKind::Vector(items) = &vector.kind else {
            return Err(self.err("loop expects a binding vector", vector));
        };
        if items.len() % 2 != 0 {
            return Err(self.err(
                "binding vector must contain an even number of forms",
                vector,
            ));
        }
        // Destructuring patterns desugar to temp loop bindings plus an
        // inner let, so recur still targets the written binding count.
        if items
            .chunks_exact(2)
            .any(|pair| !matches!(pair[0].kind, FormKind::Symbol { ns: None, .. }))
        {
            let desugared = self.desugar_loop(form, items, args)?;
            let NodeKind::Loop { bindings, body } =
                self.analyze_loop(&desugared, &list_args(&desugared))?
            else {
                return Err(self.err("loop desugar failed", form));
            };
            return Ok(NodeKind::Loop { bindings, body });
        }
        let mark = self.scope_mark();
        let bindings = self.analyze_bindings(vector)?;
        let first_slot = bindings.first().map(|b| b.slot).unwrap_or(mark.1);
        self.recur_stack.push(RecurCtx::Loop {
            count: bindings.len(),
            first_slot,
        });
        let body = self.analyze_body(&args[1..], true)?;
        self.recur_stack.pop();
        self.scope_release(mark);
        Ok(NodeKind::Loop { bindings, body })
    }

    /// `(loop [pat init …] body)` with patterns becomes
    /// `(loop [tmp init …] (let [pat tmp …] body))`.
    fn desugar_loop(
        &mut self,
        form: &Form,
        items: &[Form],
        args: &[Form],
    ) -> Result<Form, SyntaxError> {
        let (line, col) = (form.line, form.col);
        let mut loop_bindings = Vec::new();
        let mut inner_bindings = Vec::new();
        for pair in items.chunks_exact(2) {
            match &pair[0].kind {
                FormKind::Symbol { ns: None, .. } => {
                    loop_bindings.push(pair[0].clone());
                    loop_bindings.push(pair[1].clone());
                }
                _ => {
                    let tmp = Form::symbol(self.synth_name("__loop__p"), pair[0].line, pair[0].col);
                    loop_bindings.push(tmp.clone());
                    loop_bindings.push(pair[1].clone());
                    inner_bindings.push(pair[0].clone());
                    inner_bindings.push(tmp);
                }
            }
        }
        let mut inner = vec![
            Form::symbol("let", line, col),
            Form::new(FormKind::Vector(inner_bindings), line, col),
        ];
        inner.extend(args[1..].iter().cloned());
        Ok(Form::list(
            vec![
                Form::symbol("loop", line, col),
                Form::new(FormKind::Vector(loop_bindings), line, col),
                Form::list(inner, line, col),
            ],
            line,
            col,
        ))
    }

    fn analyze_recur(
        &mut self,
        form: &Form,
        args: &[Form],
        tail: bool,
    ) -> Result<NodeKind, SyntaxError> {
        if !tail {
            return Err(self.err("recur is only allowed in tail position", form));
        }
        let expected = match self.recur_stack.last() {
            Some(RecurCtx::Loop { count, .. }) => *count,
            Some(RecurCtx::Fn { count }) => *count,
            Some(RecurCtx::Barrier) => {
                return Err(self.err("cannot recur across try", form));
            }
            None => {
                return Err(self.err("recur is only allowed inside loop or fn", form));
            }
        };
        if args.len() != expected {
            return Err(self.err(
                format!(
                    "recur expects {} arguments to match its target, got {}",
                    expected,
                    args.len()
                ),
                form,
            ));
        }
        Ok(NodeKind::Recur {
            args: self.analyze_all(args)?,
        })
    }

    // ----- fn -----

    fn analyze_fn(&mut self, form: &Form, args: &[Form]) -> Result<Rc<FnNode>, SyntaxError> {
        let (name, arity_forms) = self.parse_fn_shape(form, args)?;
        self.build_fn(name, &arity_forms, form)
    }

    /// Accepts `(fn name? [params] body…)` and
    /// `(fn name? ([params] body…)+)`.
    fn parse_fn_shape<'f>(
        &mut self,
        form: &Form,
        mut args: &'f [Form],
    ) -> Result<(Option<Rc<str>>, Vec<(&'f Form, &'f [Form])>), SyntaxError> {
        let name = match args.first() {
            Some(first) => match simple_symbol(first) {
                Some(name) => {
                    args = &args[1..];
                    Some(name)
                }
                None => None,
            },
            None => return Err(self.err("fn expects a parameter vector", form)),
        };
        match args.first().map(|f| &f.kind) {
            Some(FormKind::Vector(_)) => Ok((name, vec![(&args[0], &args[1..])])),
            Some(FormKind::List(_)) => {
                let mut arities = Vec::new();
                for arity in args {
                    let FormKind::List(items) = &arity.kind else {
                        return Err(self.err("fn arity must be a list", arity));
                    };
                    let Some(params) = items.first() else {
                        return Err(self.err("fn arity expects a parameter vector", arity));
                    };
                    arities.push((params, &items[1..]));
                }
                Ok((name, arities))
            }
            _ => Err(self.err("fn expects a parameter vector", form)),
        }
    }

    fn build_fn(
        &mut self,
        name: Option<Rc<str>>,
        arity_forms: &[(&Form, &[Form])],
        form: &Form,
    ) -> Result<Rc<FnNode>, SyntaxError> {
        self.scopes.push(FnScope::new(name.clone()));
        let result = self.build_fn_arities(arity_forms, form);
        let scope = self.scopes.pop().expect("scope pushed above");
        let arities = result?;
        let mut seen_fixed: Vec<usize> = Vec::new();
        let mut variadics = 0;
        for arity in &arities {
            if arity.variadic {
                variadics += 1;
            } else {
                if seen_fixed.contains(&arity.params.len()) {
                    return Err(self.err(
                        "fn cannot have two arities with the same parameter count",
                        form,
                    ));
                }
                seen_fixed.push(arity.params.len());
            }
        }
        if variadics > 1 {
            return Err(self.err("fn can have at most one variadic arity", form));
        }
        Ok(Rc::new(FnNode {
            name,
            arities,
            captures: scope.captures.into_iter().map(|(_, s)| s).collect(),
            line: form.line,
            col: form.col,
        }))
    }

    fn build_fn_arities(
        &mut self,
        arity_forms: &[(&Form, &[Form])],
        form: &Form,
    ) -> Result<Vec<FnArity>, SyntaxError> {
        let mut arities = Vec::with_capacity(arity_forms.len());
        for (params_form, body_forms) in arity_forms {
            arities.push(self.build_arity(params_form, body_forms, form)?);
        }
        Ok(arities)
    }

    fn build_arity(
        &mut self,
        params_form: &Form,
        body_forms: &[Form],
        form: &Form,
    ) -> Result<FnArity, SyntaxError> {
        let FormKind::Vector(param_items) = &params_form.kind else {
            return Err(self.err("fn expects a parameter vector", params_form));
        };

        // reset the local region for this arity; captures accumulate on
        // the shared scope
        {
            let scope = self.scopes.last_mut().expect("scope stack never empty");
            scope.locals.clear();
            scope.next_slot = 0;
            scope.max_slot = 0;
        }

        let mut fixed: Vec<Rc<str>> = Vec::new();
        let mut rest: Option<Rc<str>> = None;
        let mut destructure_pairs: Vec<(Form, Form)> = Vec::new();
        let mut iter = param_items.iter().peekable();
        while let Some(param) = iter.next() {
            if param.is_symbol("&") {
                let Some(rest_form) = iter.next() else {
                    return Err(self.err("& must be followed by a rest parameter", param));
                };
                if iter.peek().is_some() {
                    return Err(self.err("only one parameter may follow &", rest_form));
                }
                rest = Some(self.param_name(rest_form, &mut destructure_pairs)?);
                break;
            }
            fixed.push(self.param_name(param, &mut destructure_pairs)?);
        }

        let mut simple: Vec<&Rc<str>> = fixed.iter().collect();
        if let Some(rest) = &rest {
            simple.push(rest);
        }
        for (i, a) in simple.iter().enumerate() {
            if simple[..i].iter().any(|b| b == a) {
                return Err(self.err(format!("duplicate parameter {}", a), params_form));
            }
        }

        for name in &fixed {
            self.declare_local(name.clone());
        }
        if let Some(rest) = &rest {
            self.declare_local(rest.clone());
        }

        let variadic = rest.is_some();
        self.recur_stack.push(RecurCtx::Fn {
            count: fixed.len() + variadic as usize,
        });
        let body = if destructure_pairs.is_empty() {
            self.analyze_body(body_forms, true)
        } else {
            // wrap the body in a let that runs the pattern bindings
            let (line, col) = (form.line, form.col);
            let mut binding_items = Vec::new();
            for (pattern, tmp) in destructure_pairs {
                binding_items.push(pattern);
                binding_items.push(tmp);
            }
            let mut let_form = vec![
                Form::symbol("let", line, col),
                Form::new(FormKind::Vector(binding_items), line, col),
            ];
            let_form.extend(body_forms.iter().cloned());
            self.analyze_body(&[Form::list(let_form, line, col)], true)
        };
        self.recur_stack.pop();
        let body = body?;

        let scope = self.scopes.last().expect("scope stack never empty");
        Ok(FnArity {
            params: fixed,
            variadic,
            rest_name: rest,
            nlocals: scope.max_slot,
            body,
        })
    }

    /// A parameter is a simple symbol or a destructuring pattern; the
    /// latter binds a synthetic name whose pattern expands in the body.
    fn param_name(
        &mut self,
        param: &Form,
        destructure_pairs: &mut Vec<(Form, Form)>,
    ) -> Result<Rc<str>, SyntaxError> {
        match &param.kind {
            FormKind::Symbol { ns: None, name } => Ok(name.clone()),
            FormKind::Vector(_) | FormKind::Map(_) => {
                let tmp = self.synth_name("__fn__p");
                destructure_pairs.push((
                    param.clone(),
                    Form::symbol(tmp.clone(), param.line, param.col),
                ));
                Ok(tmp)
            }
            _ => Err(self.err("parameter must be a symbol or pattern", param)),
        }
    }

    fn analyze_thunk(&mut self, body: &[Form], form: &Form) -> Result<Rc<FnNode>, SyntaxError> {
        let params = Form::new(FormKind::Vector(Vec::new()), form.line, form.col);
        self.build_fn(None, &[(&params, body)], form)
    }

    // ----- def family -----

    fn analyze_def(
        &mut self,
        form: &Form,
        args: &[Form],
        is_macro: bool,
    ) -> Result<NodeKind, SyntaxError> {
        let [name_form, rest @ ..] = args else {
            return Err(self.err("def expects a name", form));
        };
        let (name, mut dynamic, private, mut doc) = self.parse_def_name(name_form)?;
        let (doc_from_string, init_form) = match rest {
            [] => (None, None),
            [init] => (None, Some(init)),
            [doc_form, init] => {
                let FormKind::Str(text) = &doc_form.kind else {
                    return Err(self.err("def docstring must be a string", doc_form));
                };
                (Some(text.clone()), Some(init))
            }
            _ => return Err(self.err("too many forms in def", form)),
        };
        if doc.is_none() {
            doc = doc_from_string;
        }
        if name.starts_with('*') && name.ends_with('*') && name.len() > 2 {
            // earmuffed names are dynamic by convention
            dynamic = true;
        }
        let arglists = init_form.and_then(fn_arglists_text);
        // interning before analysis lets the init refer to the var
        // (self-recursive defs)
        self.ensure_var(&name);
        let init = match init_form {
            Some(init) => Some(Box::new(self.analyze_form(init, false)?)),
            None => None,
        };
        Ok(NodeKind::Def {
            name,
            init,
            dynamic,
            is_macro,
            private,
            doc,
            arglists,
        })
    }

    fn analyze_defmacro(&mut self, form: &Form, args: &[Form]) -> Result<NodeKind, SyntaxError> {
        let [name_form, rest @ ..] = args else {
            return Err(self.err("defmacro expects a name", form));
        };
        let Some(name) = simple_symbol(name_form) else {
            return Err(self.err("defmacro name must be a symbol", name_form));
        };
        // (defmacro name doc? [params] body…) reuses the fn path
        let (doc, fn_args) = match rest {
            [Form {
                kind: FormKind::Str(doc),
                ..
            }, fn_args @ ..] => (Some(doc.clone()), fn_args),
            _ => (None, rest),
        };
        self.ensure_var(&name);
        let mut fn_items = vec![Form::symbol("fn*", form.line, form.col)];
        fn_items.extend(fn_args.iter().cloned());
        let fn_form = Form::list(fn_items, form.line, form.col);
        let arglists = fn_arglists_text(&fn_form);
        let init = self.analyze_form(&fn_form, false)?;
        Ok(NodeKind::Def {
            name,
            init: Some(Box::new(init)),
            dynamic: false,
            is_macro: true,
            private: false,
            doc,
            arglists,
        })
    }

    /// `(def ^:dynamic ^{:doc "..."} name ...)`: flags ride on the name
    /// symbol through the reader's `with-meta` wrapping.
    fn parse_def_name(
        &mut self,
        name_form: &Form,
    ) -> Result<(Rc<str>, bool, bool, Option<Rc<str>>), SyntaxError> {
        if let Some(name) = simple_symbol(name_form) {
            return Ok((name, false, false, None));
        }
        // (with-meta name {..}) as produced by ^meta
        if let FormKind::List(items) = &name_form.kind
            && items.len() == 3
            && items[0].is_symbol("with-meta")
            && let Some(name) = simple_symbol(&items[1])
            && let FormKind::Map(kvs) = &items[2].kind
        {
            let mut dynamic = false;
            let mut private = false;
            let mut doc = None;
            for pair in kvs.chunks_exact(2) {
                if let FormKind::Keyword { ns: None, name: key, .. } = &pair[0].kind {
                    match &**key {
                        "dynamic" => dynamic = matches!(pair[1].kind, FormKind::Bool(true)),
                        "private" => private = matches!(pair[1].kind, FormKind::Bool(true)),
                        "doc" => {
                            if let FormKind::Str(text) = &pair[1].kind {
                                doc = Some(text.clone());
                            }
                        }
                        _ => {}
                    }
                }
            }
            return Ok((name, dynamic, private, doc));
        }
        Err(self.err("def name must be a symbol", name_form))
    }

    /// Pre-intern so eager resolution sees the var being defined.
    fn ensure_var(&self, name: &str) {
        if let Some(env) = &self.env {
            env.intern(&env.current_ns_name(), name.into());
        }
    }

    fn analyze_set(&mut self, form: &Form, args: &[Form]) -> Result<NodeKind, SyntaxError> {
        let [target, expr] = args else {
            return Err(self.err("set! expects a symbol and a value", form));
        };
        let FormKind::Symbol { ns, name } = &target.kind else {
            return Err(self.err("set! target must be a symbol", target));
        };
        if ns.is_none() && self.resolve_name(name).is_some() {
            return Err(self.err("set! target must be a var, not a local", target));
        }
        Ok(NodeKind::SetBang {
            ns: ns.clone(),
            name: name.clone(),
            expr: Box::new(self.analyze_form(expr, false)?),
        })
    }

    // ----- try -----

    fn analyze_try(&mut self, form: &Form, args: &[Form]) -> Result<NodeKind, SyntaxError> {
        let mut body_forms: Vec<&Form> = Vec::new();
        let mut catch: Option<CatchClause> = None;
        let mut finally: Option<Vec<Node>> = None;
        for arg in args {
            let clause = match &arg.kind {
                FormKind::List(items) => match items.first() {
                    Some(head) if head.is_symbol("catch") => Some(("catch", items)),
                    Some(head) if head.is_symbol("finally") => Some(("finally", items)),
                    _ => None,
                },
                _ => None,
            };
            match clause {
                None => {
                    if catch.is_some() || finally.is_some() {
                        return Err(self.err(
                            "try body forms must precede catch and finally",
                            arg,
                        ));
                    }
                    body_forms.push(arg);
                }
                Some(("catch", items)) => {
                    if catch.is_some() {
                        return Err(self.err("try allows at most one catch clause", arg));
                    }
                    if finally.is_some() {
                        return Err(self.err("catch must precede finally", arg));
                    }
                    let [_, class_form, binding_form, catch_body @ ..] = &items[..] else {
                        return Err(self.err(
                            "catch expects a class and a binding symbol",
                            arg,
                        ));
                    };
                    let Some(class) = symbol_text(class_form) else {
                        return Err(self.err("catch class must be a symbol", class_form));
                    };
                    let Some(binding) = simple_symbol(binding_form) else {
                        return Err(self.err("catch binding must be a symbol", binding_form));
                    };
                    let mark = self.scope_mark();
                    let slot = self.declare_local(binding.clone());
                    self.recur_stack.push(RecurCtx::Barrier);
                    let body = self.analyze_body(catch_body, false);
                    self.recur_stack.pop();
                    self.scope_release(mark);
                    catch = Some(CatchClause {
                        class,
                        binding,
                        slot,
                        body: body?,
                    });
                }
                Some((_, items)) => {
                    if finally.is_some() {
                        return Err(self.err("try allows at most one finally clause", arg));
                    }
                    self.recur_stack.push(RecurCtx::Barrier);
                    let body = self.analyze_body(&items[1..], false);
                    self.recur_stack.pop();
                    finally = Some(body?);
                }
            }
        }
        self.recur_stack.push(RecurCtx::Barrier);
        let body = self.analyze_body_refs(&body_forms);
        self.recur_stack.pop();
        Ok(NodeKind::Try {
            body: body?,
            catch,
            finally,
        })
    }

    fn analyze_body_refs(&mut self, forms: &[&Form]) -> Result<Vec<Node>, SyntaxError> {
        forms
            .iter()
            .map(|form| self.analyze_form(form, false))
            .collect()
    }

    // ----- polymorphic dispatch forms -----

    fn analyze_defmethod(&mut self, form: &Form, args: &[Form]) -> Result<NodeKind, SyntaxError> {
        let [name_form, dispatch_value, params, body @ ..] = args else {
            return Err(self.err(
                "defmethod expects a name, a dispatch value, and a fn tail",
                form,
            ));
        };
        let Some(multi) = simple_symbol(name_form) else {
            return Err(self.err("defmethod name must be a symbol", name_form));
        };
        let dispatch_value = self.analyze_form(dispatch_value, false)?;
        let fnode = self.build_fn(None, &[(params, body)], form)?;
        let method = Node::new(NodeKind::Fn(fnode), form.line, form.col);
        Ok(NodeKind::DefMethod {
            multi,
            dispatch_value: Box::new(dispatch_value),
            method: Box::new(method),
        })
    }

    fn analyze_defprotocol(&mut self, form: &Form, args: &[Form]) -> Result<NodeKind, SyntaxError> {
        let [name_form, sigs @ ..] = args else {
            return Err(self.err("defprotocol expects a name", form));
        };
        let Some(name) = simple_symbol(name_form) else {
            return Err(self.err("defprotocol name must be a symbol", name_form));
        };
        let mut methods = Vec::new();
        for sig in sigs {
            let FormKind::List(items) = &sig.kind else {
                return Err(self.err("protocol method signature must be a list", sig));
            };
            let Some(method) = items.first().and_then(simple_symbol) else {
                return Err(self.err("protocol method needs a name", sig));
            };
            self.ensure_var(&method);
            methods.push(method);
        }
        if methods.is_empty() {
            return Err(self.err("defprotocol expects at least one method", form));
        }
        Ok(NodeKind::DefProtocol { name, methods })
    }

    fn analyze_extend_type(&mut self, form: &Form, args: &[Form]) -> Result<NodeKind, SyntaxError> {
        let [type_form, protocol_form, impls @ ..] = args else {
            return Err(self.err(
                "extend-type expects a type, a protocol, and method impls",
                form,
            ));
        };
        let Some(type_key) = symbol_text(type_form) else {
            return Err(self.err("extend-type type must be a symbol", type_form));
        };
        let Some(protocol) = symbol_text(protocol_form) else {
            return Err(self.err("extend-type protocol must be a symbol", protocol_form));
        };
        let mut methods = Vec::new();
        for impl_form in impls {
            let FormKind::List(items) = &impl_form.kind else {
                return Err(self.err("extend-type method must be a list", impl_form));
            };
            let [head, params, body @ ..] = &items[..] else {
                return Err(self.err("extend-type method needs params", impl_form));
            };
            let Some(method) = simple_symbol(head) else {
                return Err(self.err("extend-type method needs a name", head));
            };
            let fnode = self.build_fn(None, &[(params, body)], impl_form)?;
            methods.push((
                method,
                Node::new(NodeKind::Fn(fnode), impl_form.line, impl_form.col),
            ));
        }
        if methods.is_empty() {
            return Err(self.err("extend-type expects at least one method", form));
        }
        Ok(NodeKind::ExtendType {
            type_key,
            protocol,
            methods,
        })
    }

    fn analyze_letfn(
        &mut self,
        form: &Form,
        args: &[Form],
        tail: bool,
    ) -> Result<NodeKind, SyntaxError> {
        let [vector, body @ ..] = args else {
            return Err(self.err("letfn expects a binding vector", form));
        };
        let FormKind::Vector(items) = &vector.kind else {
            return Err(self.err("letfn expects a binding vector", vector));
        };
        let mark = self.scope_mark();
        // all names visible before any body is analyzed
        let mut parsed: Vec<(Rc<str>, u16, &Form)> = Vec::new();
        for item in items {
            let FormKind::List(fn_items) = &item.kind else {
                return Err(self.err("letfn binding must be (name [params] body…)", item));
            };
            let Some(name) = fn_items.first().and_then(simple_symbol) else {
                return Err(self.err("letfn binding needs a name", item));
            };
            let slot = self.declare_local(name.clone());
            parsed.push((name, slot, item));
        }
        let mut bindings = Vec::with_capacity(parsed.len());
        for (name, slot, item) in parsed {
            let FormKind::List(fn_items) = &item.kind else {
                return Err(self.err("letfn binding must be a list", item));
            };
            let [_, params, fn_body @ ..] = &fn_items[..] else {
                return Err(self.err("letfn binding needs a parameter vector", item));
            };
            let fnode = self.build_fn(Some(name.clone()), &[(params, fn_body)], item)?;
            bindings.push((name, slot, fnode));
        }
        let body = self.analyze_body(body, tail);
        self.scope_release(mark);
        Ok(NodeKind::Letfn {
            bindings,
            body: body?,
        })
    }
}

// ----- helpers -----

fn simple_symbol(form: &Form) -> Option<Rc<str>> {
    match &form.kind {
        FormKind::Symbol { ns: None, name } => Some(name.clone()),
        _ => None,
    }
}

fn symbol_text(form: &Form) -> Option<Rc<str>> {
    match &form.kind {
        FormKind::Symbol { ns: None, name } => Some(name.clone()),
        FormKind::Symbol { ns: Some(ns), name } => Some(format!("{}/{}", ns, name).into()),
        _ => None,
    }
}

fn is_constant_form(form: &Form) -> bool {
    match &form.kind {
        FormKind::Nil
        | FormKind::Bool(_)
        | FormKind::Int(_)
        | FormKind::Float(_)
        | FormKind::Char(_)
        | FormKind::Str(_)
        | FormKind::Keyword { .. }
        | FormKind::Ratio(_)
        | FormKind::BigInt(_)
        | FormKind::BigDecimal(_)
        | FormKind::Regex(_) => true,
        FormKind::Vector(items) | FormKind::Set(items) | FormKind::Map(items) => {
            items.iter().all(is_constant_form)
        }
        FormKind::Symbol { .. } | FormKind::List(_) | FormKind::Tagged { .. } => false,
    }
}

/// `([x] [x y & more])` rendered for var metadata.
fn fn_arglists_text(init: &Form) -> Option<Rc<str>> {
    let FormKind::List(items) = &init.kind else {
        return None;
    };
    let head = items.first()?;
    if !head.is_symbol("fn") && !head.is_symbol("fn*") {
        return None;
    }
    let mut vectors = Vec::new();
    for item in &items[1..] {
        match &item.kind {
            FormKind::Vector(_) => {
                vectors.push(item.pr());
                break;
            }
            FormKind::List(arity) => {
                if let Some(params) = arity.first()
                    && matches!(params.kind, FormKind::Vector(_))
                {
                    vectors.push(params.pr());
                }
            }
            _ => {}
        }
    }
    if vectors.is_empty() {
        return None;
    }
    Some(format!("({})", vectors.join(" ")).into())
}

/// Expand a destructuring pattern over `source` into (pattern, accessor)
/// pairs. Nested patterns re-enter the binding queue.
fn expand_pattern(pattern: &Form, source: &Form) -> Result<Vec<(Form, Form)>, String> {
    let (line, col) = (pattern.line, pattern.col);
    let kw = |name: &str| {
        Form::new(
            FormKind::Keyword {
                ns: None,
                name: name.into(),
                auto_resolve: false,
            },
            line,
            col,
        )
    };
    let call = |head: &str, args: Vec<Form>| {
        let mut items = vec![Form::symbol(head, line, col)];
        items.extend(args);
        Form::list(items, line, col)
    };
    let mut pairs = Vec::new();
    match &pattern.kind {
        FormKind::Vector(items) => {
            let mut index = 0i64;
            let mut iter = items.iter().peekable();
            while let Some(item) = iter.next() {
                if item.is_symbol("&") {
                    let Some(rest) = iter.next() else {
                        return Err("& must be followed by a rest pattern".to_string());
                    };
                    pairs.push((
                        rest.clone(),
                        call(
                            "drop",
                            vec![Form::new(FormKind::Int(index), line, col), source.clone()],
                        ),
                    ));
                    continue;
                }
                if let FormKind::Keyword { ns: None, name, .. } = &item.kind
                    && &**name == "as"
                {
                    let Some(as_name) = iter.next() else {
                        return Err(":as must be followed by a symbol".to_string());
                    };
                    pairs.push((as_name.clone(), source.clone()));
                    continue;
                }
                pairs.push((
                    item.clone(),
                    call(
                        "nth",
                        vec![
                            source.clone(),
                            Form::new(FormKind::Int(index), line, col),
                            Form::new(FormKind::Nil, line, col),
                        ],
                    ),
                ));
                index += 1;
            }
        }
        FormKind::Map(items) => {
            let mut defaults: Vec<(Rc<str>, Form)> = Vec::new();
            // first pass: :or defaults
            for pair in items.chunks_exact(2) {
                if let FormKind::Keyword { ns: None, name, .. } = &pair[0].kind
                    && &**name == "or"
                    && let FormKind::Map(or_items) = &pair[1].kind
                {
                    for or_pair in or_items.chunks_exact(2) {
                        if let FormKind::Symbol { ns: None, name } = &or_pair[0].kind {
                            defaults.push((name.clone(), or_pair[1].clone()));
                        }
                    }
                }
            }
            let default_for = |name: &str| {
                defaults
                    .iter()
                    .find(|(n, _)| &**n == name)
                    .map(|(_, d)| d.clone())
                    .unwrap_or(Form::new(FormKind::Nil, line, col))
            };
            for pair in items.chunks_exact(2) {
                match &pair[0].kind {
                    FormKind::Keyword { ns: None, name, .. } => match &**name {
                        "keys" => {
                            let FormKind::Vector(keys) = &pair[1].kind else {
                                return Err(":keys expects a vector of symbols".to_string());
                            };
                            for key in keys {
                                let FormKind::Symbol { ns: None, name } = &key.kind else {
                                    return Err(":keys entries must be symbols".to_string());
                                };
                                pairs.push((
                                    key.clone(),
                                    call(
                                        "get",
                                        vec![source.clone(), kw(name), default_for(name)],
                                    ),
                                ));
                            }
                        }
                        "as" => {
                            pairs.push((pair[1].clone(), source.clone()));
                        }
                        "or" => {}
                        other => {
                            return Err(format!("unsupported map pattern key :{}", other));
                        }
                    },
                    FormKind::Symbol { ns: None, name } => {
                        pairs.push((
                            pair[0].clone(),
                            call(
                                "get",
                                vec![source.clone(), pair[1].clone(), default_for(name)],
                            ),
                        ));
                    }
                    FormKind::Vector(_) | FormKind::Map(_) => {
                        pairs.push((
                            pair[0].clone(),
                            call("get", vec![source.clone(), pair[1].clone()]),
                        ));
                    }
                    _ => return Err("unsupported map pattern entry".to_string()),
                }
            }
        }
        _ => return Err("unsupported destructuring pattern".to_string()),
    }
    Ok(pairs)
}

/// Convert a macro-expansion result back into a readable form.
fn value_to_form(value: &Value, line: u32, col: u32) -> Result<Form, String> {
    let kind = match value {
        Value::Nil => FormKind::Nil,
        Value::Bool(b) => FormKind::Bool(*b),
        Value::Int(i) => FormKind::Int(*i),
        Value::Float(f) => FormKind::Float(*f),
        Value::Char(c) => FormKind::Char(*c),
        Value::Str(s) => FormKind::Str(s.clone()),
        Value::Symbol(s) => FormKind::Symbol {
            ns: s.ns.clone(),
            name: s.name.clone(),
        },
        Value::Keyword(s) => FormKind::Keyword {
            ns: s.ns.clone(),
            name: s.name.clone(),
            auto_resolve: false,
        },
        Value::List(l) => FormKind::List(values_to_forms(&l.items, line, col)?),
        Value::Vector(v) => FormKind::Vector(values_to_forms(&v.items, line, col)?),
        Value::Set(s) => FormKind::Set(values_to_forms(&s.items, line, col)?),
        Value::Map(m) => {
            let mut items = Vec::with_capacity(m.entries.len() * 2);
            for (k, v) in &m.entries {
                items.push(value_to_form(k, line, col)?);
                items.push(value_to_form(v, line, col)?);
            }
            FormKind::Map(items)
        }
        Value::BigInt(text) => FormKind::BigInt(text.clone()),
        Value::BigDecimal(text) => FormKind::BigDecimal(text.clone()),
        Value::Ratio(text) => FormKind::Ratio(text.clone()),
        other => {
            return Err(format!(
                "macro expansion produced an unreadable {} value",
                other.type_name()
            ));
        }
    };
    Ok(Form::new(kind, line, col))
}

fn values_to_forms(values: &[Value], line: u32, col: u32) -> Result<Vec<Form>, String> {
    values.iter().map(|v| value_to_form(v, line, col)).collect()
}

fn list_args(form: &Form) -> Vec<Form> {
    match &form.kind {
        FormKind::List(items) => items[1..].to_vec(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadLimits;
    use crate::reader::read_all_forms;

    fn analyze1(source: &str) -> Node {
        let forms = read_all_forms(source, &ReadLimits::default(), "user".into()).unwrap();
        Analyzer::new(None).analyze(&forms[0]).unwrap()
    }

    fn analyze_err(source: &str) -> SyntaxError {
        let forms = read_all_forms(source, &ReadLimits::default(), "user".into()).unwrap();
        Analyzer::new(None).analyze(&forms[0]).unwrap_err()
    }

    #[test]
    fn test_constant_folding() {
        assert!(matches!(analyze1("[1 2 3]").kind, NodeKind::Const(_)));
        assert!(matches!(analyze1("{:a 1}").kind, NodeKind::Const(_)));
        // a symbol element forces runtime construction
        let forms = read_all_forms("[1 x]", &ReadLimits::default(), "user".into()).unwrap();
        let mut analyzer = Analyzer::new(None);
        assert!(matches!(
            analyzer.analyze(&forms[0]).unwrap().kind,
            NodeKind::VectorLit(_)
        ));
    }

    #[test]
    fn test_let_scoping_left_to_right() {
        let node = analyze1("(let [x 1 y x] y)");
        let NodeKind::Let { bindings, body } = node.kind else {
            panic!("expected let");
        };
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].slot, 0);
        assert_eq!(bindings[1].slot, 1);
        // y's init is a local ref to x
        assert!(matches!(
            bindings[1].init.kind,
            NodeKind::LocalRef { slot: 0, .. }
        ));
        assert!(matches!(body[0].kind, NodeKind::LocalRef { slot: 1, .. }));
    }

    #[test]
    fn test_shadowing() {
        let node = analyze1("(let [x 1] (let [x 2] x))");
        let NodeKind::Let { body, .. } = node.kind else {
            panic!("expected let");
        };
        let NodeKind::Let { bindings, body } = &body[0].kind else {
            panic!("expected inner let");
        };
        assert_eq!(bindings[0].slot, 1);
        assert!(matches!(body[0].kind, NodeKind::LocalRef { slot: 1, .. }));
    }

    #[test]
    fn test_sibling_lets_reuse_slots() {
        let node = analyze1("(do (let [a 1] a) (let [b 2] b))");
        let NodeKind::Do(stmts) = node.kind else {
            panic!("expected do");
        };
        for stmt in &stmts {
            let NodeKind::Let { bindings, .. } = &stmt.kind else {
                panic!("expected let");
            };
            assert_eq!(bindings[0].slot, 0);
        }
    }

    #[test]
    fn test_fn_capture() {
        let node = analyze1("(let [x 10] (fn [y] (+ x y)))");
        let NodeKind::Let { body, .. } = node.kind else {
            panic!("expected let");
        };
        let NodeKind::Fn(fnode) = &body[0].kind else {
            panic!("expected fn");
        };
        assert_eq!(fnode.captures, vec![CaptureSource::ParentLocal(0)]);
        // the body references the capture, not a local
        let NodeKind::Call { args, .. } = &fnode.arities[0].body[0].kind else {
            panic!("expected call");
        };
        assert!(matches!(
            args[0].kind,
            NodeKind::CaptureRef { index: 0, .. }
        ));
        assert!(matches!(args[1].kind, NodeKind::LocalRef { slot: 0, .. }));
    }

    #[test]
    fn test_transitive_capture() {
        let node = analyze1("(let [x 1] (fn [] (fn [] x)))");
        let NodeKind::Let { body, .. } = node.kind else {
            panic!("expected let");
        };
        let NodeKind::Fn(outer) = &body[0].kind else {
            panic!("expected fn");
        };
        assert_eq!(outer.captures, vec![CaptureSource::ParentLocal(0)]);
        let NodeKind::Fn(inner) = &outer.arities[0].body[0].kind else {
            panic!("expected inner fn");
        };
        // the inner fn captures the outer fn's capture
        assert_eq!(inner.captures, vec![CaptureSource::ParentCapture(0)]);
    }

    #[test]
    fn test_named_fn_self_reference() {
        let node = analyze1("(fn fact [n] (fact n))");
        let NodeKind::Fn(fnode) = node.kind else {
            panic!("expected fn");
        };
        let NodeKind::Call { callee, .. } = &fnode.arities[0].body[0].kind else {
            panic!("expected call");
        };
        assert!(matches!(callee.kind, NodeKind::SelfRef { .. }));
    }

    #[test]
    fn test_multi_arity_validation() {
        assert!(matches!(
            analyze1("(fn ([x] x) ([x y] y))").kind,
            NodeKind::Fn(_)
        ));
        assert!(
            analyze_err("(fn ([x] x) ([y] y))")
                .message
                .contains("same parameter count")
        );
        assert!(
            analyze_err("(fn ([& a] a) ([x & b] b))")
                .message
                .contains("one variadic")
        );
        assert!(
            analyze_err("(fn [x &] x)")
                .message
                .contains("& must be followed")
        );
        assert!(
            analyze_err("(fn [x x] x)")
                .message
                .contains("duplicate parameter")
        );
    }

    #[test]
    fn test_recur_validation() {
        assert!(matches!(
            analyze1("(loop [x 0] (recur 1))").kind,
            NodeKind::Loop { .. }
        ));
        assert!(
            analyze_err("(recur 1)")
                .message
                .contains("inside loop or fn")
        );
        assert!(
            analyze_err("(loop [x 0] (do (recur 1) x))")
                .message
                .contains("tail position")
        );
        assert!(
            analyze_err("(loop [x 0] (recur 1 2))")
                .message
                .contains("recur expects 1")
        );
        assert!(
            analyze_err("(loop [x 0] (try (recur 1)))")
                .message
                .contains("across try")
        );
        // recur to fn head
        assert!(matches!(analyze1("(fn [x] (recur x))").kind, NodeKind::Fn(_)));
    }

    #[test]
    fn test_try_shapes() {
        let node = analyze1("(try 1 (catch Exception e e) (finally 2))");
        let NodeKind::Try {
            catch, finally, ..
        } = node.kind
        else {
            panic!("expected try");
        };
        let catch = catch.expect("catch clause");
        assert_eq!(&*catch.class, "Exception");
        assert!(finally.is_some());
        assert!(
            analyze_err("(try 1 (catch A e 1) (catch B e 2))")
                .message
                .contains("at most one catch")
        );
        assert!(
            analyze_err("(try (finally 1) 2)")
                .message
                .contains("precede")
        );
    }

    #[test]
    fn test_quote_lowers_to_value() {
        let node = analyze1("(quote (quote x))");
        let NodeKind::Quote(value) = node.kind else {
            panic!("expected quote");
        };
        assert_eq!(
            value,
            Value::list(vec![Value::symbol(None, "quote"), Value::symbol(None, "x")])
        );
    }

    #[test]
    fn test_def_metadata() {
        let node = analyze1("(def ^:dynamic *flag* 1)");
        let NodeKind::Def { name, dynamic, .. } = node.kind else {
            panic!("expected def");
        };
        assert_eq!(&*name, "*flag*");
        assert!(dynamic);

        let node = analyze1("(def f \"adds one\" (fn [x] (+ x 1)))");
        let NodeKind::Def { doc, arglists, .. } = node.kind else {
            panic!("expected def");
        };
        assert_eq!(doc.as_deref(), Some("adds one"));
        assert_eq!(arglists.as_deref(), Some("([x])"));
    }

    #[test]
    fn test_vector_destructuring() {
        let node = analyze1("(let [[a b & more] v] a)");
        // pattern expands through a temp binding
        let NodeKind::Let { bindings, .. } = node.kind else {
            panic!("expected let");
        };
        assert!(bindings.len() >= 4);
        assert!(bindings[0].name.starts_with("__"));
        assert_eq!(&*bindings[1].name, "a");
        assert_eq!(&*bindings[3].name, "more");
    }

    #[test]
    fn test_map_destructuring() {
        let node = analyze1("(let [{:keys [a b] :or {b 5} :as m} src] a)");
        let NodeKind::Let { bindings, .. } = node.kind else {
            panic!("expected let");
        };
        let names: Vec<&str> = bindings.iter().map(|b| &*b.name).collect();
        assert!(names.contains(&"a"));
        assert!(names.contains(&"b"));
        assert!(names.contains(&"m"));
    }

    #[test]
    fn test_fn_param_destructuring() {
        let node = analyze1("(fn [[a b]] (+ a b))");
        let NodeKind::Fn(fnode) = node.kind else {
            panic!("expected fn");
        };
        assert_eq!(fnode.arities[0].params.len(), 1);
        // body became a let expanding the pattern
        assert!(matches!(
            fnode.arities[0].body[0].kind,
            NodeKind::Let { .. }
        ));
    }

    #[test]
    fn test_defprotocol_and_extend_type() {
        let node = analyze1("(defprotocol Shape (area [s]) (perim [s]))");
        let NodeKind::DefProtocol { name, methods } = node.kind else {
            panic!("expected defprotocol");
        };
        assert_eq!(&*name, "Shape");
        assert_eq!(methods.len(), 2);

        let node = analyze1("(extend-type Long Shape (area [s] s))");
        let NodeKind::ExtendType {
            type_key, methods, ..
        } = node.kind
        else {
            panic!("expected extend-type");
        };
        assert_eq!(&*type_key, "Long");
        assert_eq!(&*methods[0].0, "area");
    }

    #[test]
    fn test_letfn_mutual_visibility() {
        let node = analyze1(
            "(letfn [(ev [n] (if (= n 0) true (od (- n 1)))) \
                     (od [n] (if (= n 0) false (ev (- n 1))))] (ev 4))",
        );
        let NodeKind::Letfn { bindings, .. } = node.kind else {
            panic!("expected letfn");
        };
        assert_eq!(bindings.len(), 2);
        // ev's body references od through a capture of the letfn slot
        let (_, _, ev) = &bindings[0];
        assert_eq!(ev.captures, vec![CaptureSource::ParentLocal(1)]);
    }

    #[test]
    fn test_set_bang_rejects_locals() {
        assert!(
            analyze_err("(let [x 1] (set! x 2))")
                .message
                .contains("not a local")
        );
    }

    #[test]
    fn test_lazy_seq_thunk() {
        let node = analyze1("(lazy-seq (cons 1 nil))");
        let NodeKind::LazySeq { body } = node.kind else {
            panic!("expected lazy-seq");
        };
        assert_eq!(body.arities.len(), 1);
        assert!(body.arities[0].params.is_empty());
    }

    #[test]
    fn test_eager_resolution_against_env() {
        let env = clove_runtime::default_env();
        let forms =
            read_all_forms("(nosuchfn 1)", &ReadLimits::default(), "user".into()).unwrap();
        let err = Analyzer::new(Some(env.clone())).analyze(&forms[0]).unwrap_err();
        assert!(err.message.contains("unable to resolve symbol"));

        let forms = read_all_forms("(inc 1)", &ReadLimits::default(), "user".into()).unwrap();
        assert!(Analyzer::new(Some(env)).analyze(&forms[0]).is_ok());
    }

    #[test]
    fn test_macro_expansion() {
        use clove_runtime::Vm;
        let env = clove_runtime::default_env();
        // define a macro the hard way: a fn var flagged as a macro
        let forms = read_all_forms(
            "(defmacro twice [x] (list (quote do) x x))",
            &ReadLimits::default(),
            "user".into(),
        )
        .unwrap();
        let mut analyzer = Analyzer::new(Some(env.clone()));
        let node = analyzer.analyze(&forms[0]).unwrap();
        let chunk = crate::codegen::compile_top(&node).unwrap();
        Vm::new(env.clone()).run_chunk(Rc::new(chunk)).unwrap();
        assert!(env.resolve("twice").unwrap().is_macro.get());

        // the macro now expands at analysis time
        let forms = read_all_forms(
            "(twice (def side-effect 1))",
            &ReadLimits::default(),
            "user".into(),
        )
        .unwrap();
        let node = analyzer.analyze(&forms[0]).unwrap();
        let NodeKind::Do(stmts) = node.kind else {
            panic!("macro should expand to do, got {:?}", node.kind);
        };
        assert_eq!(stmts.len(), 2);
    }
}
