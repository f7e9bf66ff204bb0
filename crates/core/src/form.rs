//! Syntactic forms
//!
//! The reader produces `Form`s: the literal shapes of `Value` plus the
//! reader-only constructs (tagged literals, textual big-number payloads,
//! regex pattern text, auto-resolved keywords). Every form records the
//! line/column of its first character.

use crate::value::Value;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub struct Form {
    pub kind: FormKind,
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormKind {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(Rc<str>),
    Symbol {
        ns: Option<Rc<str>>,
        name: Rc<str>,
    },
    Keyword {
        ns: Option<Rc<str>>,
        name: Rc<str>,
        /// `::x` as opposed to `:x`; the ns is already resolved.
        auto_resolve: bool,
    },
    List(Vec<Form>),
    Vector(Vec<Form>),
    /// Flat key/value alternation; the reader guarantees even length.
    Map(Vec<Form>),
    Set(Vec<Form>),
    /// `#tag form`
    Tagged {
        tag: Rc<str>,
        form: Box<Form>,
    },
    /// Numeric payloads preserved as text for later numerics.
    Ratio(Rc<str>),
    BigInt(Rc<str>),
    BigDecimal(Rc<str>),
    /// `#"pattern"` as raw pattern text.
    Regex(Rc<str>),
}

impl Form {
    pub fn new(kind: FormKind, line: u32, col: u32) -> Self {
        Form { kind, line, col }
    }

    pub fn symbol(name: impl Into<Rc<str>>, line: u32, col: u32) -> Self {
        Form::new(
            FormKind::Symbol {
                ns: None,
                name: name.into(),
            },
            line,
            col,
        )
    }

    pub fn list(items: Vec<Form>, line: u32, col: u32) -> Self {
        Form::new(FormKind::List(items), line, col)
    }

    /// Is this form the symbol `name` (unqualified)?
    pub fn is_symbol(&self, name: &str) -> bool {
        matches!(&self.kind, FormKind::Symbol { ns: None, name: n } if &**n == name)
    }

    /// Structural equality ignoring source positions, for round-trip
    /// checks.
    pub fn eq_ignore_pos(&self, other: &Form) -> bool {
        match (&self.kind, &other.kind) {
            (FormKind::List(a), FormKind::List(b))
            | (FormKind::Vector(a), FormKind::Vector(b))
            | (FormKind::Map(a), FormKind::Map(b))
            | (FormKind::Set(a), FormKind::Set(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_pos(y))
            }
            (
                FormKind::Tagged { tag: ta, form: fa },
                FormKind::Tagged { tag: tb, form: fb },
            ) => ta == tb && fa.eq_ignore_pos(fb),
            (a, b) => a == b,
        }
    }

    /// Lower this form to its corresponding runtime value, as `quote`
    /// does. Source positions are lost; reader-only constructs lower to
    /// their value shapes (regex to its pattern string, tagged literals to
    /// a `(tag form)` list).
    pub fn to_value(&self) -> Value {
        match &self.kind {
            FormKind::Nil => Value::Nil,
            FormKind::Bool(b) => Value::Bool(*b),
            FormKind::Int(i) => Value::Int(*i),
            FormKind::Float(f) => Value::Float(*f),
            FormKind::Char(c) => Value::Char(*c),
            FormKind::Str(s) => Value::Str(s.clone()),
            FormKind::Symbol { ns, name } => Value::symbol(ns.clone(), name.clone()),
            FormKind::Keyword { ns, name, .. } => Value::keyword(ns.clone(), name.clone()),
            FormKind::List(items) => Value::list(items.iter().map(Form::to_value).collect()),
            FormKind::Vector(items) => Value::vector(items.iter().map(Form::to_value).collect()),
            FormKind::Map(kvs) => Value::map(
                kvs.chunks_exact(2)
                    .map(|pair| (pair[0].to_value(), pair[1].to_value()))
                    .collect(),
            ),
            FormKind::Set(items) => Value::set(items.iter().map(Form::to_value).collect()),
            FormKind::Tagged { tag, form } => Value::list(vec![
                Value::symbol(None, tag.clone()),
                form.to_value(),
            ]),
            FormKind::Ratio(text) => Value::Ratio(text.clone()),
            FormKind::BigInt(text) => Value::BigInt(text.clone()),
            FormKind::BigDecimal(text) => Value::BigDecimal(text.clone()),
            FormKind::Regex(text) => Value::Str(text.clone()),
        }
    }

    /// Reader-readable text for this form. Re-reading the output yields a
    /// form equal up to source positions (for non-lossy variants).
    pub fn pr(&self) -> String {
        let mut out = String::new();
        self.write(&mut out);
        out
    }

    fn write(&self, out: &mut String) {
        use std::fmt::Write;
        match &self.kind {
            FormKind::Nil => out.push_str("nil"),
            FormKind::Bool(b) => {
                let _ = write!(out, "{}", b);
            }
            FormKind::Int(i) => {
                let _ = write!(out, "{}", i);
            }
            FormKind::Float(f) => out.push_str(&crate::value::format_float(*f)),
            FormKind::Char(c) => out.push_str(&crate::value::format_char(*c)),
            FormKind::Str(s) => {
                out.push_str(&Value::Str(s.clone()).pr_str());
            }
            FormKind::Symbol { ns, name } => {
                match ns {
                    Some(ns) => {
                        let _ = write!(out, "{}/{}", ns, name);
                    }
                    None => out.push_str(name),
                };
            }
            FormKind::Keyword {
                ns,
                name,
                auto_resolve,
            } => {
                if *auto_resolve {
                    let _ = write!(out, "::{}", name);
                } else {
                    match ns {
                        Some(ns) => {
                            let _ = write!(out, ":{}/{}", ns, name);
                        }
                        None => {
                            let _ = write!(out, ":{}", name);
                        }
                    }
                }
            }
            FormKind::List(items) => Self::write_group(out, "(", ")", items),
            FormKind::Vector(items) => Self::write_group(out, "[", "]", items),
            FormKind::Map(items) => Self::write_group(out, "{", "}", items),
            FormKind::Set(items) => Self::write_group(out, "#{", "}", items),
            FormKind::Tagged { tag, form } => {
                let _ = write!(out, "#{} ", tag);
                form.write(out);
            }
            FormKind::Ratio(text) => out.push_str(text),
            FormKind::BigInt(text) => {
                let _ = write!(out, "{}N", text);
            }
            FormKind::BigDecimal(text) => {
                let _ = write!(out, "{}M", text);
            }
            FormKind::Regex(text) => {
                let _ = write!(out, "#\"{}\"", text);
            }
        }
    }

    fn write_group(out: &mut String, open: &str, close: &str, items: &[Form]) {
        out.push_str(open);
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            item.write(out);
        }
        out.push_str(close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(kind: FormKind) -> Form {
        Form::new(kind, 1, 1)
    }

    #[test]
    fn test_eq_ignore_pos() {
        let a = Form::new(FormKind::Int(1), 1, 1);
        let b = Form::new(FormKind::Int(1), 7, 3);
        assert_ne!(a, b);
        assert!(a.eq_ignore_pos(&b));
    }

    #[test]
    fn test_quote_lowering_loses_positions() {
        let form = f(FormKind::List(vec![
            f(FormKind::Symbol {
                ns: None,
                name: "quote".into(),
            }),
            f(FormKind::Int(1)),
        ]));
        assert_eq!(
            form.to_value(),
            Value::list(vec![Value::symbol(None, "quote"), Value::Int(1)])
        );
    }

    #[test]
    fn test_map_lowering_pairs() {
        let form = f(FormKind::Map(vec![
            f(FormKind::Keyword {
                ns: None,
                name: "a".into(),
                auto_resolve: false,
            }),
            f(FormKind::Int(1)),
        ]));
        assert_eq!(
            form.to_value(),
            Value::map(vec![(Value::keyword(None, "a"), Value::Int(1))])
        );
    }

    #[test]
    fn test_pr_round_trip_shapes() {
        let form = f(FormKind::Vector(vec![
            f(FormKind::Int(1)),
            f(FormKind::Str("x".into())),
            f(FormKind::Char('\n')),
        ]));
        assert_eq!(form.pr(), "[1 \"x\" \\newline]");
    }

    #[test]
    fn test_big_literals_keep_text() {
        assert_eq!(f(FormKind::BigInt("42".into())).pr(), "42N");
        assert_eq!(f(FormKind::Ratio("1/3".into())).pr(), "1/3");
        assert_eq!(
            f(FormKind::BigInt("42".into())).to_value(),
            Value::BigInt("42".into())
        );
    }
}
