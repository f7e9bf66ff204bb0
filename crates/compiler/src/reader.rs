//! Reader: tokens → forms
//!
//! A recursive reader with nesting-depth and collection-size caps,
//! expanding reader macros at read time:
//!
//! - `'x` `~x` `~@x` `@x` `#'x` wrap in the corresponding call form
//! - `^m x` normalises metadata (keyword → `{k true}`, symbol →
//!   `{:tag s}`) and wraps in `with-meta`
//! - `#_form` discards, `#?(...)` selects by platform key (`:cljw`, then
//!   `:clj`, then `:default`)
//! - `#(…)` builds `(fn* [%1 … %N & %&?] (…))` from the highest `%K` seen
//! - backquote runs syntax-quote with per-expansion auto-gensyms
//! - `##Inf` `##-Inf` `##NaN` produce the IEEE floats
//! - `#tag form` produces a tagged-literal form
//!
//! Limits are enforced even on malformed input: a string over the byte
//! cap fails at its opening quote, an over-deep nest fails at the deepest
//! opening delimiter.

use crate::config::ReadLimits;
use crate::error::SyntaxError;
use crate::tokenizer::{Token, TokenKind, tokenize};
use clove_core::form::{Form, FormKind};
use std::collections::HashMap;
use std::rc::Rc;

/// Platform key for reader conditionals; `:clj` is the generic fallback.
const PLATFORM_KEY: &str = "cljw";
const GENERIC_KEY: &str = "clj";

pub struct Reader<'a> {
    tokens: Vec<Token>,
    pos: usize,
    limits: &'a ReadLimits,
    current_ns: Rc<str>,
    depth: usize,
    in_fn_literal: bool,
}

thread_local! {
    /// Auto-gensym names must stay fresh across reading sessions, not
    /// just within one.
    static GENSYM_COUNTER: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
}

/// Read every form in `source`.
pub fn read_all_forms(
    source: &str,
    limits: &ReadLimits,
    current_ns: Rc<str>,
) -> Result<Vec<Form>, SyntaxError> {
    Reader::new(source, limits, current_ns)?.read_all()
}

/// Read the first form in `source`, if any.
pub fn read_one_form(
    source: &str,
    limits: &ReadLimits,
    current_ns: Rc<str>,
) -> Result<Option<Form>, SyntaxError> {
    Reader::new(source, limits, current_ns)?.next_form()
}

impl<'a> Reader<'a> {
    pub fn new(
        source: &str,
        limits: &'a ReadLimits,
        current_ns: Rc<str>,
    ) -> Result<Self, SyntaxError> {
        Ok(Reader {
            tokens: tokenize(source, limits)?,
            pos: 0,
            limits,
            current_ns,
            depth: 0,
            in_fn_literal: false,
        })
    }

    pub fn read_all(&mut self) -> Result<Vec<Form>, SyntaxError> {
        let mut forms = Vec::new();
        while let Some(form) = self.next_form()? {
            forms.push(form);
        }
        Ok(forms)
    }

    /// The next form, skipping discards and non-matching conditionals.
    pub fn next_form(&mut self) -> Result<Option<Form>, SyntaxError> {
        while self.pos < self.tokens.len() {
            if let Some(form) = self.read_form()? {
                return Ok(Some(form));
            }
        }
        Ok(None)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned()?;
        self.pos += 1;
        Some(token)
    }

    fn last_pos(&self) -> (u32, u32) {
        self.tokens
            .last()
            .map(|t| (t.line, t.col))
            .unwrap_or((1, 1))
    }

    /// Read a form that must exist (inside collections, after a macro
    /// prefix).
    fn read_required(&mut self, what: &str) -> Result<Form, SyntaxError> {
        loop {
            if self.pos >= self.tokens.len() {
                let (line, col) = self.last_pos();
                return Err(SyntaxError::new(
                    format!("unexpected end of input, expected {}", what),
                    line,
                    col,
                ));
            }
            if let Some(form) = self.read_form()? {
                return Ok(form);
            }
        }
    }

    /// One reader step: `Ok(None)` when the construct produced no form
    /// (discard, non-matching reader conditional).
    fn read_form(&mut self) -> Result<Option<Form>, SyntaxError> {
        let Some(token) = self.bump() else {
            let (line, col) = self.last_pos();
            return Err(SyntaxError::new("unexpected end of input", line, col));
        };
        let (line, col) = (token.line, token.col);
        let form = match token.kind {
            TokenKind::LParen => {
                self.read_collection(&token, &TokenKind::RParen, CollKind::List)?
            }
            TokenKind::LBracket => {
                self.read_collection(&token, &TokenKind::RBracket, CollKind::Vector)?
            }
            TokenKind::LBrace => {
                self.read_collection(&token, &TokenKind::RBrace, CollKind::Map)?
            }
            TokenKind::SetOpen => {
                self.read_collection(&token, &TokenKind::RBrace, CollKind::Set)?
            }
            TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                return Err(SyntaxError::new("unmatched closing delimiter", line, col));
            }
            TokenKind::Quote => self.wrap_next("quote", line, col)?,
            TokenKind::Unquote => self.wrap_next("unquote", line, col)?,
            TokenKind::UnquoteSplicing => self.wrap_next("unquote-splicing", line, col)?,
            TokenKind::Deref => self.wrap_next("deref", line, col)?,
            TokenKind::VarQuote => self.wrap_next("var", line, col)?,
            TokenKind::SyntaxQuote => {
                let inner = self.read_required("a form after `")?;
                let mut gensyms = HashMap::new();
                self.syntax_quote(inner, &mut gensyms)?
            }
            TokenKind::Meta => self.read_meta(line, col)?,
            TokenKind::Discard => {
                self.read_required("a form after #_")?;
                return Ok(None);
            }
            TokenKind::FnOpen => self.read_fn_literal(&token)?,
            TokenKind::ReaderCond => return self.read_reader_cond(line, col),
            TokenKind::SymbolicValue(name) => {
                let value = match &*name {
                    "Inf" => f64::INFINITY,
                    "-Inf" => f64::NEG_INFINITY,
                    "NaN" => f64::NAN,
                    other => {
                        return Err(SyntaxError::new(
                            format!("unknown symbolic value ##{}", other),
                            line,
                            col,
                        ));
                    }
                };
                Form::new(FormKind::Float(value), line, col)
            }
            TokenKind::TaggedLiteral(tag) => {
                if !tag
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_alphabetic() || c == '_')
                {
                    return Err(SyntaxError::new(
                        format!("invalid tagged literal head #{}", tag),
                        line,
                        col,
                    ));
                }
                let inner = self.read_required("a form after the tag")?;
                Form::new(
                    FormKind::Tagged {
                        tag,
                        form: Box::new(inner),
                    },
                    line,
                    col,
                )
            }
            TokenKind::Str(s) => Form::new(FormKind::Str(s), line, col),
            TokenKind::Regex(s) => Form::new(FormKind::Regex(s), line, col),
            TokenKind::Int(i) => Form::new(FormKind::Int(i), line, col),
            TokenKind::Float(f) => Form::new(FormKind::Float(f), line, col),
            TokenKind::Ratio(text) => Form::new(FormKind::Ratio(text), line, col),
            TokenKind::BigInt(text) => Form::new(FormKind::BigInt(text), line, col),
            TokenKind::BigDecimal(text) => Form::new(FormKind::BigDecimal(text), line, col),
            TokenKind::Char(c) => Form::new(FormKind::Char(c), line, col),
            TokenKind::Keyword { name, ns, auto } => {
                let ns = if auto {
                    Some(self.current_ns.clone())
                } else {
                    ns
                };
                Form::new(
                    FormKind::Keyword {
                        ns,
                        name,
                        auto_resolve: auto,
                    },
                    line,
                    col,
                )
            }
            TokenKind::Symbol { name, ns } => match (&ns, &*name) {
                (None, "nil") => Form::new(FormKind::Nil, line, col),
                (None, "true") => Form::new(FormKind::Bool(true), line, col),
                (None, "false") => Form::new(FormKind::Bool(false), line, col),
                _ => Form::new(FormKind::Symbol { ns, name }, line, col),
            },
        };
        Ok(Some(form))
    }

    fn wrap_next(&mut self, sym: &str, line: u32, col: u32) -> Result<Form, SyntaxError> {
        let inner = self.read_required(&format!("a form after {}", sym))?;
        Ok(Form::list(
            vec![Form::symbol(sym, line, col), inner],
            line,
            col,
        ))
    }

    fn read_collection(
        &mut self,
        open: &Token,
        closer: &TokenKind,
        kind: CollKind,
    ) -> Result<Form, SyntaxError> {
        self.depth += 1;
        if self.depth > self.limits.max_depth {
            self.depth -= 1;
            return Err(SyntaxError::new(
                format!("nesting depth exceeds {}", self.limits.max_depth),
                open.line,
                open.col,
            ));
        }
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => {
                    self.depth -= 1;
                    return Err(SyntaxError::new(
                        "unexpected end of input in collection",
                        open.line,
                        open.col,
                    ));
                }
                Some(token) if &token.kind == closer => {
                    self.bump();
                    break;
                }
                Some(token) => {
                    let (line, col) = (token.line, token.col);
                    if let Some(form) = self.read_form()? {
                        items.push(form);
                        if items.len() > self.limits.max_collection {
                            self.depth -= 1;
                            return Err(SyntaxError::new(
                                format!(
                                    "collection exceeds {} elements",
                                    self.limits.max_collection
                                ),
                                line,
                                col,
                            ));
                        }
                    }
                }
            }
        }
        self.depth -= 1;
        let kind = match kind {
            CollKind::List => FormKind::List(items),
            CollKind::Vector => FormKind::Vector(items),
            CollKind::Set => FormKind::Set(items),
            CollKind::Map => {
                if items.len() % 2 != 0 {
                    return Err(SyntaxError::new(
                        "map literal must contain an even number of forms",
                        open.line,
                        open.col,
                    ));
                }
                FormKind::Map(items)
            }
        };
        Ok(Form::new(kind, open.line, open.col))
    }

    /// `^m x` → `(with-meta x m')`.
    fn read_meta(&mut self, line: u32, col: u32) -> Result<Form, SyntaxError> {
        let meta = self.read_required("metadata after ^")?;
        let target = self.read_required("a form after metadata")?;
        let normalised = match meta.kind {
            FormKind::Keyword { .. } => Form::new(
                FormKind::Map(vec![meta, Form::new(FormKind::Bool(true), line, col)]),
                line,
                col,
            ),
            FormKind::Symbol { .. } => Form::new(
                FormKind::Map(vec![
                    Form::new(
                        FormKind::Keyword {
                            ns: None,
                            name: "tag".into(),
                            auto_resolve: false,
                        },
                        line,
                        col,
                    ),
                    meta,
                ]),
                line,
                col,
            ),
            FormKind::Map(_) => meta,
            _ => {
                return Err(SyntaxError::new(
                    "metadata must be a keyword, symbol, or map",
                    line,
                    col,
                ));
            }
        };
        Ok(Form::list(
            vec![Form::symbol("with-meta", line, col), target, normalised],
            line,
            col,
        ))
    }

    /// `#(body)` → `(fn* [%1 … %N & %&?] (body))`.
    fn read_fn_literal(&mut self, open: &Token) -> Result<Form, SyntaxError> {
        if self.in_fn_literal {
            return Err(SyntaxError::new(
                "nested #() literals are not allowed",
                open.line,
                open.col,
            ));
        }
        self.in_fn_literal = true;
        let body = self.read_collection(open, &TokenKind::RParen, CollKind::List);
        self.in_fn_literal = false;
        let body = normalize_percents(body?);

        let mut max_param = 0u32;
        let mut rest = false;
        scan_percents(&body, &mut max_param, &mut rest);

        let (line, col) = (open.line, open.col);
        let mut params = Vec::new();
        for i in 1..=max_param {
            params.push(Form::symbol(format!("%{}", i), line, col));
        }
        if rest {
            params.push(Form::symbol("&", line, col));
            params.push(Form::symbol("%&", line, col));
        }
        Ok(Form::list(
            vec![
                Form::symbol("fn*", line, col),
                Form::new(FormKind::Vector(params), line, col),
                body,
            ],
            line,
            col,
        ))
    }

    /// `#?(:key form …)`: platform tag first, then the generic tag, then
    /// `:default`. No match reads as nothing.
    fn read_reader_cond(&mut self, line: u32, col: u32) -> Result<Option<Form>, SyntaxError> {
        let Some(token) = self.peek() else {
            return Err(SyntaxError::new(
                "unexpected end of input after #?",
                line,
                col,
            ));
        };
        if token.kind != TokenKind::LParen {
            return Err(SyntaxError::new("expected a list after #?", line, col));
        }
        let open = self.bump().ok_or_else(|| {
            SyntaxError::new("unexpected end of input after #?", line, col)
        })?;
        let list = self.read_collection(&open, &TokenKind::RParen, CollKind::List)?;
        let FormKind::List(items) = list.kind else {
            return Err(SyntaxError::new("expected a list after #?", line, col));
        };
        if items.len() % 2 != 0 {
            return Err(SyntaxError::new(
                "reader conditional requires an even number of forms",
                line,
                col,
            ));
        }
        let mut branches: Vec<(Rc<str>, Form)> = Vec::new();
        for pair in items.chunks_exact(2) {
            let FormKind::Keyword { ns: None, name, .. } = &pair[0].kind else {
                return Err(SyntaxError::new(
                    "reader conditional keys must be keywords",
                    pair[0].line,
                    pair[0].col,
                ));
            };
            branches.push((name.clone(), pair[1].clone()));
        }
        for key in [PLATFORM_KEY, GENERIC_KEY, "default"] {
            if let Some((_, form)) = branches.iter().find(|(k, _)| &**k == key) {
                return Ok(Some(form.clone()));
            }
        }
        Ok(None)
    }

    // ----- syntax quote -----

    fn fresh_gensym(&mut self, base: &str, gensyms: &mut HashMap<Rc<str>, Rc<str>>) -> Rc<str> {
        let key: Rc<str> = base.into();
        if let Some(name) = gensyms.get(&key) {
            return name.clone();
        }
        let n = GENSYM_COUNTER.with(|c| {
            let n = c.get() + 1;
            c.set(n);
            n
        });
        let stem = base.trim_end_matches('#');
        let name: Rc<str> = format!("{}__{}__auto", stem, n).into();
        gensyms.insert(key, name.clone());
        name
    }

    fn syntax_quote(
        &mut self,
        form: Form,
        gensyms: &mut HashMap<Rc<str>, Rc<str>>,
    ) -> Result<Form, SyntaxError> {
        let (line, col) = (form.line, form.col);
        match form.kind {
            FormKind::Symbol { ns: None, name } if name.ends_with('#') => {
                let fresh = self.fresh_gensym(&name, gensyms);
                Ok(quote_form(Form::new(
                    FormKind::Symbol {
                        ns: None,
                        name: fresh,
                    },
                    line,
                    col,
                )))
            }
            FormKind::Symbol { ns, name } => Ok(quote_form(Form::new(
                FormKind::Symbol { ns, name },
                line,
                col,
            ))),
            FormKind::List(items) => {
                if let Some(inner) = unquoted(&items) {
                    return Ok(inner.clone());
                }
                if splice_unquoted(&items).is_some() {
                    return Err(SyntaxError::new(
                        "unquote-splicing outside of a collection",
                        line,
                        col,
                    ));
                }
                let parts = self.sq_parts(items, gensyms)?;
                let concat = self.call_form("concat", parts, line, col);
                Ok(self.call_form("seq", vec![concat], line, col))
            }
            FormKind::Vector(items) => self.sq_collection("vector", items, gensyms, line, col),
            FormKind::Set(items) => self.sq_collection("hash-set", items, gensyms, line, col),
            FormKind::Map(items) => self.sq_collection("hash-map", items, gensyms, line, col),
            other => Ok(Form::new(other, line, col)),
        }
    }

    /// `(apply ctor (concat parts…))`
    fn sq_collection(
        &mut self,
        ctor: &str,
        items: Vec<Form>,
        gensyms: &mut HashMap<Rc<str>, Rc<str>>,
        line: u32,
        col: u32,
    ) -> Result<Form, SyntaxError> {
        let parts = self.sq_parts(items, gensyms)?;
        let concat = self.call_form("concat", parts, line, col);
        Ok(self.call_form("apply", vec![Form::symbol(ctor, line, col), concat], line, col))
    }

    fn sq_parts(
        &mut self,
        items: Vec<Form>,
        gensyms: &mut HashMap<Rc<str>, Rc<str>>,
    ) -> Result<Vec<Form>, SyntaxError> {
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            let (line, col) = (item.line, item.col);
            if let FormKind::List(elems) = &item.kind {
                if let Some(inner) = unquoted(elems) {
                    parts.push(self.call_form("list", vec![inner.clone()], line, col));
                    continue;
                }
                if let Some(inner) = splice_unquoted(elems) {
                    parts.push(inner.clone());
                    continue;
                }
            }
            let quoted = self.syntax_quote(item, gensyms)?;
            parts.push(self.call_form("list", vec![quoted], line, col));
        }
        Ok(parts)
    }

    fn call_form(&self, head: &str, mut args: Vec<Form>, line: u32, col: u32) -> Form {
        let mut items = vec![Form::symbol(head, line, col)];
        items.append(&mut args);
        Form::list(items, line, col)
    }
}

enum CollKind {
    List,
    Vector,
    Map,
    Set,
}

fn quote_form(inner: Form) -> Form {
    let (line, col) = (inner.line, inner.col);
    Form::list(vec![Form::symbol("quote", line, col), inner], line, col)
}

fn unquoted(items: &[Form]) -> Option<&Form> {
    match items {
        [head, inner] if head.is_symbol("unquote") => Some(inner),
        _ => None,
    }
}

fn splice_unquoted(items: &[Form]) -> Option<&Form> {
    match items {
        [head, inner] if head.is_symbol("unquote-splicing") => Some(inner),
        _ => None,
    }
}

/// `%` counts as `%1`; `%&` enables the rest parameter.
fn scan_percents(form: &Form, max_param: &mut u32, rest: &mut bool) {
    match &form.kind {
        FormKind::Symbol { ns: None, name } => {
            if &**name == "%&" {
                *rest = true;
            } else if let Some(digits) = name.strip_prefix('%')
                && let Ok(n) = digits.parse::<u32>()
            {
                *max_param = (*max_param).max(n);
            }
        }
        FormKind::List(items)
        | FormKind::Vector(items)
        | FormKind::Map(items)
        | FormKind::Set(items) => {
            for item in items {
                scan_percents(item, max_param, rest);
            }
        }
        FormKind::Tagged { form, .. } => scan_percents(form, max_param, rest),
        _ => {}
    }
}

fn normalize_percents(form: Form) -> Form {
    let (line, col) = (form.line, form.col);
    let kind = match form.kind {
        FormKind::Symbol { ns: None, name } if &*name == "%" => FormKind::Symbol {
            ns: None,
            name: "%1".into(),
        },
        FormKind::List(items) => {
            FormKind::List(items.into_iter().map(normalize_percents).collect())
        }
        FormKind::Vector(items) => {
            FormKind::Vector(items.into_iter().map(normalize_percents).collect())
        }
        FormKind::Map(items) => FormKind::Map(items.into_iter().map(normalize_percents).collect()),
        FormKind::Set(items) => FormKind::Set(items.into_iter().map(normalize_percents).collect()),
        FormKind::Tagged { tag, form } => FormKind::Tagged {
            tag,
            form: Box::new(normalize_percents(*form)),
        },
        other => other,
    };
    Form::new(kind, line, col)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(source: &str) -> Vec<Form> {
        read_all_forms(source, &ReadLimits::default(), "user".into()).unwrap()
    }

    fn read1(source: &str) -> Form {
        read(source).remove(0)
    }

    fn read_err(source: &str) -> SyntaxError {
        read_all_forms(source, &ReadLimits::default(), "user".into()).unwrap_err()
    }

    #[test]
    fn test_literals() {
        assert_eq!(read1("nil").kind, FormKind::Nil);
        assert_eq!(read1("true").kind, FormKind::Bool(true));
        assert_eq!(read1("42").kind, FormKind::Int(42));
        assert_eq!(read1("\"x\"").kind, FormKind::Str("x".into()));
    }

    #[test]
    fn test_collections() {
        assert_eq!(read1("(1 2)").pr(), "(1 2)");
        assert_eq!(read1("[1 [2]]").pr(), "[1 [2]]");
        assert_eq!(read1("{:a 1}").pr(), "{:a 1}");
        assert_eq!(read1("#{1 2}").pr(), "#{1 2}");
    }

    #[test]
    fn test_odd_map_literal() {
        assert!(read_err("{:a}").message.contains("even number"));
    }

    #[test]
    fn test_unmatched_delimiters() {
        assert!(read_err(")").message.contains("unmatched"));
        let err = read_err("(1 2");
        assert!(err.message.contains("end of input"));
        assert_eq!((err.line, err.col), (1, 1));
    }

    #[test]
    fn test_quote_macros() {
        assert_eq!(read1("'x").pr(), "(quote x)");
        assert_eq!(read1("~x").pr(), "(unquote x)");
        assert_eq!(read1("~@x").pr(), "(unquote-splicing x)");
        assert_eq!(read1("@x").pr(), "(deref x)");
        assert_eq!(read1("#'x").pr(), "(var x)");
    }

    #[test]
    fn test_meta_normalisation() {
        assert_eq!(read1("^:dynamic x").pr(), "(with-meta x {:dynamic true})");
        assert_eq!(read1("^String x").pr(), "(with-meta x {:tag String})");
        assert_eq!(read1("^{:a 1} x").pr(), "(with-meta x {:a 1})");
        assert!(read_err("^1 x").message.contains("metadata"));
    }

    #[test]
    fn test_discard() {
        let forms = read("#_1 2");
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0].kind, FormKind::Int(2));
        // discard inside a collection
        assert_eq!(read1("[1 #_2 3]").pr(), "[1 3]");
    }

    #[test]
    fn test_fn_literal() {
        assert_eq!(read1("#(+ %1 %2)").pr(), "(fn* [%1 %2] (+ %1 %2))");
        // % normalises to %1
        assert_eq!(read1("#(inc %)").pr(), "(fn* [%1] (inc %1))");
        assert_eq!(read1("#(apply + %&)").pr(), "(fn* [& %&] (apply + %&))");
        assert!(read_err("#(# ())").message.contains("dispatch"));
        assert!(
            read_err("#(+ #(inc %) 1)")
                .message
                .contains("nested #()")
        );
    }

    #[test]
    fn test_symbolic_floats() {
        assert_eq!(read1("##Inf").kind, FormKind::Float(f64::INFINITY));
        assert_eq!(read1("##-Inf").kind, FormKind::Float(f64::NEG_INFINITY));
        let FormKind::Float(nan) = read1("##NaN").kind else {
            panic!("expected float");
        };
        assert!(nan.is_nan());
        assert!(read_err("##Wat").message.contains("unknown symbolic"));
    }

    #[test]
    fn test_reader_conditional() {
        // platform key wins over generic
        assert_eq!(read1("#?(:clj 1 :cljw 2)").kind, FormKind::Int(2));
        assert_eq!(read1("#?(:clj 1)").kind, FormKind::Int(1));
        assert_eq!(read1("#?(:cljs 1 :default 9)").kind, FormKind::Int(9));
        // no match reads as nothing
        let forms = read("#?(:cljs 1) 5");
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0].kind, FormKind::Int(5));
        assert!(read_err("#?(:clj)").message.contains("even number"));
    }

    #[test]
    fn test_tagged_literal() {
        let form = read1("#inst \"2024\"");
        let FormKind::Tagged { tag, form } = form.kind else {
            panic!("expected tagged literal");
        };
        assert_eq!(&*tag, "inst");
        assert_eq!(form.kind, FormKind::Str("2024".into()));
    }

    #[test]
    fn test_auto_resolved_keyword() {
        let form = read_all_forms("::x", &ReadLimits::default(), "app.core".into())
            .unwrap()
            .remove(0);
        assert_eq!(
            form.kind,
            FormKind::Keyword {
                ns: Some("app.core".into()),
                name: "x".into(),
                auto_resolve: true
            }
        );
        // printing keeps the :: spelling
        assert_eq!(form.pr(), "::x");
    }

    #[test]
    fn test_syntax_quote_symbol() {
        assert_eq!(read1("`x").pr(), "(quote x)");
    }

    #[test]
    fn test_syntax_quote_list() {
        assert_eq!(
            read1("`(a ~b)").pr(),
            "(seq (concat (list (quote a)) (list b)))"
        );
        assert_eq!(
            read1("`(a ~@bs)").pr(),
            "(seq (concat (list (quote a)) bs))"
        );
    }

    #[test]
    fn test_syntax_quote_collections() {
        assert_eq!(
            read1("`[~a]").pr(),
            "(apply vector (concat (list a)))"
        );
        assert_eq!(
            read1("`#{~a}").pr(),
            "(apply hash-set (concat (list a)))"
        );
        assert_eq!(
            read1("`{:k ~v}").pr(),
            "(apply hash-map (concat (list :k) (list v)))"
        );
    }

    #[test]
    fn test_syntax_quote_top_level_unquote() {
        assert_eq!(read1("`~x").pr(), "x");
    }

    #[test]
    fn test_auto_gensym_consistent_within_expansion() {
        let form = read1("`(let [x# 1] x#)");
        let printed = form.pr();
        // both x# occurrences map to the same generated name
        let auto = printed
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .find(|w| w.starts_with("x__"))
            .map(str::to_string)
            .expect("generated name");
        assert!(auto.ends_with("__auto"));
        assert_eq!(printed.matches(&auto).count(), 2);

        // a second expansion generates a different name
        let second = read1("`(x# x#)").pr();
        assert!(!second.contains(&auto));
    }

    #[test]
    fn test_depth_limit_at_deepest_delimiter() {
        let limits = ReadLimits {
            max_depth: 3,
            ..Default::default()
        };
        let err = read_all_forms("(((()", &limits, "user".into()).unwrap_err();
        // the fourth opening paren is one past the limit
        assert_eq!((err.line, err.col), (1, 4));
        assert!(err.message.contains("depth"));
    }

    #[test]
    fn test_collection_limit() {
        let limits = ReadLimits {
            max_collection: 2,
            ..Default::default()
        };
        let err = read_all_forms("[1 2 3]", &limits, "user".into()).unwrap_err();
        assert!(err.message.contains("exceeds 2"));
    }

    #[test]
    fn test_pretty_print_round_trip() {
        for source in [
            "(defn f [x] (+ x 1))",
            "{:a [1 2], :b #{3}}",
            "(quote (1 \"two\" \\c 3.5))",
            "[1/3 42N 3.14M]",
        ] {
            let form = read1(source);
            let reread = read1(&form.pr());
            assert!(form.eq_ignore_pos(&reread), "round trip failed: {}", source);
        }
    }
}
