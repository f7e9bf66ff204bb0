//! The `clojure.core` builtin registry
//!
//! Host-implemented functions interned as vars in `clojure.core`. The
//! arithmetic and comparison entries exist so the operators work as
//! first-class values (`(reduce + …)`); calls in operator position are
//! fused by the compiler and never reach them.
//!
//! Higher-order builtins (`apply`, `map`, `filter`, `reduce`, `swap!`)
//! call back into user code through `call_function`, which re-enters the
//! VM running on this thread.

use crate::env::Env;
use crate::vm::{
    call_function, deep_realize, num_add, num_div, num_le, num_lt, num_mod, num_mul, num_rem,
    num_sub, realize_lazy, values_equal,
};
use clove_core::error::{
    RuntimeError, arity_error, index_error, io_error, type_error, value_error,
};
use clove_core::value::{BuiltinFn, NativeFn, PersistentMap, Value};
use std::cell::Cell;
use std::rc::Rc;
use tracing::debug;

/// Intern every builtin into `clojure.core`.
pub fn install(env: &Env) {
    let core = env.find_or_create_namespace(crate::env::CORE_NS);
    let mut count = 0;
    for (name, f) in BUILTINS {
        let var = core.intern(Rc::from(*name));
        var.bind_root(Value::Builtin(Rc::new(BuiltinFn {
            name: Rc::from(*name),
            f: *f,
        })));
        count += 1;
    }
    debug!(count, "installed clojure.core builtins");
}

static BUILTINS: &[(&str, NativeFn)] = &[
    // arithmetic
    ("+", bi_add),
    ("-", bi_sub),
    ("*", bi_mul),
    ("/", bi_div),
    ("mod", bi_mod),
    ("rem", bi_rem),
    ("inc", bi_inc),
    ("dec", bi_dec),
    // comparison
    ("=", bi_eq),
    ("not=", bi_not_eq),
    ("<", bi_lt),
    ("<=", bi_le),
    (">", bi_gt),
    (">=", bi_ge),
    ("not", bi_not),
    // predicates
    ("nil?", bi_nil_p),
    ("some?", bi_some_p),
    ("true?", bi_true_p),
    ("false?", bi_false_p),
    ("zero?", bi_zero_p),
    ("pos?", bi_pos_p),
    ("neg?", bi_neg_p),
    ("even?", bi_even_p),
    ("odd?", bi_odd_p),
    ("int?", bi_int_p),
    ("float?", bi_float_p),
    ("number?", bi_number_p),
    ("string?", bi_string_p),
    ("char?", bi_char_p),
    ("boolean?", bi_boolean_p),
    ("keyword?", bi_keyword_p),
    ("symbol?", bi_symbol_p),
    ("fn?", bi_fn_p),
    ("ifn?", bi_ifn_p),
    ("list?", bi_list_p),
    ("vector?", bi_vector_p),
    ("map?", bi_map_p),
    ("set?", bi_set_p),
    ("coll?", bi_coll_p),
    ("seq?", bi_seq_p),
    ("empty?", bi_empty_p),
    ("contains?", bi_contains_p),
    // collections
    ("list", bi_list),
    ("vector", bi_vector),
    ("vec", bi_vec),
    ("hash-map", bi_hash_map),
    ("hash-set", bi_hash_set),
    ("set", bi_set),
    ("cons", bi_cons),
    ("conj", bi_conj),
    ("first", bi_first),
    ("rest", bi_rest),
    ("next", bi_next),
    ("seq", bi_seq),
    ("count", bi_count),
    ("nth", bi_nth),
    ("get", bi_get),
    ("assoc", bi_assoc),
    ("dissoc", bi_dissoc),
    ("keys", bi_keys),
    ("vals", bi_vals),
    ("concat", bi_concat),
    ("reverse", bi_reverse),
    ("last", bi_last),
    ("range", bi_range),
    ("into", bi_into),
    ("take", bi_take),
    ("drop", bi_drop),
    // strings and names
    ("str", bi_str),
    ("subs", bi_subs),
    ("name", bi_name),
    ("namespace", bi_namespace),
    ("keyword", bi_keyword),
    ("symbol", bi_symbol),
    ("gensym", bi_gensym),
    // printing
    ("pr-str", bi_pr_str),
    ("print", bi_print),
    ("println", bi_println),
    ("prn", bi_prn),
    // higher-order
    ("apply", bi_apply),
    ("map", bi_map),
    ("filter", bi_filter),
    ("reduce", bi_reduce),
    ("identity", bi_identity),
    // references
    ("atom", bi_atom),
    ("deref", bi_deref),
    ("reset!", bi_reset),
    ("swap!", bi_swap),
    ("volatile!", bi_volatile),
    ("vreset!", bi_vreset),
    ("vswap!", bi_vswap),
    // dynamic bindings
    ("push-thread-bindings", bi_push_bindings),
    ("pop-thread-bindings", bi_pop_bindings),
    // namespaces
    ("in-ns", bi_in_ns),
    ("alias", bi_alias),
    ("refer", bi_refer),
    // exceptions
    ("ex-info", bi_ex_info),
    ("ex-message", bi_ex_message),
    ("ex-data", bi_ex_data),
    // metadata and types
    ("meta", bi_meta),
    ("with-meta", bi_with_meta),
    ("type", bi_type),
    // I/O
    ("slurp", bi_slurp),
    // regex
    ("re-pattern", bi_re_pattern),
    ("re-matches", bi_re_matches),
    ("re-find", bi_re_find),
];

// ----- helpers -----

fn expect_arity(name: &str, args: &[Value], n: usize) -> Result<(), RuntimeError> {
    if args.len() != n {
        return Err(arity_error(name, args.len()));
    }
    Ok(())
}

/// The elements of anything seqable; `None` for non-seqable kinds.
fn seq_elements(value: &Value) -> Result<Option<Vec<Value>>, RuntimeError> {
    match value {
        Value::Nil => Ok(Some(Vec::new())),
        Value::List(l) => Ok(Some(l.items.clone())),
        Value::Vector(v) => Ok(Some(v.items.clone())),
        Value::Set(s) => Ok(Some(s.items.clone())),
        Value::Map(m) => Ok(Some(
            m.entries
                .iter()
                .map(|(k, v)| Value::vector(vec![k.clone(), v.clone()]))
                .collect(),
        )),
        Value::Str(s) => Ok(Some(s.chars().map(Value::Char).collect())),
        Value::LazySeq(ls) => {
            let realized = realize_lazy(ls)?;
            seq_elements(&realized)
        }
        _ => Ok(None),
    }
}

fn elements_or_err(name: &str, value: &Value) -> Result<Vec<Value>, RuntimeError> {
    seq_elements(value)?.ok_or_else(|| {
        type_error(format!("{}: {} is not seqable", name, value.type_name()))
    })
}

// ----- arithmetic -----

fn bi_add(args: &[Value]) -> Result<Value, RuntimeError> {
    let mut acc = Value::Int(0);
    for arg in args {
        acc = num_add(&acc, arg, false)?;
    }
    Ok(acc)
}

fn bi_sub(args: &[Value]) -> Result<Value, RuntimeError> {
    match args {
        [] => Err(arity_error("-", 0)),
        [x] => num_sub(&Value::Int(0), x, false),
        [first, rest @ ..] => {
            let mut acc = first.clone();
            for arg in rest {
                acc = num_sub(&acc, arg, false)?;
            }
            Ok(acc)
        }
    }
}

fn bi_mul(args: &[Value]) -> Result<Value, RuntimeError> {
    let mut acc = Value::Int(1);
    for arg in args {
        acc = num_mul(&acc, arg, false)?;
    }
    Ok(acc)
}

fn bi_div(args: &[Value]) -> Result<Value, RuntimeError> {
    match args {
        [] => Err(arity_error("/", 0)),
        [x] => num_div(&Value::Float(1.0), x),
        [first, rest @ ..] => {
            let mut acc = first.clone();
            for arg in rest {
                acc = num_div(&acc, arg)?;
            }
            Ok(acc)
        }
    }
}

fn bi_mod(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("mod", args, 2)?;
    num_mod(&args[0], &args[1])
}

fn bi_rem(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("rem", args, 2)?;
    num_rem(&args[0], &args[1])
}

fn bi_inc(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("inc", args, 1)?;
    num_add(&args[0], &Value::Int(1), false)
}

fn bi_dec(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("dec", args, 1)?;
    num_sub(&args[0], &Value::Int(1), false)
}

// ----- comparison -----

fn bi_eq(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() {
        return Err(arity_error("=", 0));
    }
    for pair in args.windows(2) {
        if !values_equal(&pair[0], &pair[1])? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn bi_not_eq(args: &[Value]) -> Result<Value, RuntimeError> {
    let eq = bi_eq(args)?;
    Ok(Value::Bool(!eq.is_truthy()))
}

fn compare_chain(
    name: &str,
    args: &[Value],
    cmp: fn(&Value, &Value) -> Result<bool, RuntimeError>,
) -> Result<Value, RuntimeError> {
    if args.is_empty() {
        return Err(arity_error(name, 0));
    }
    for pair in args.windows(2) {
        if !cmp(&pair[0], &pair[1])? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn bi_lt(args: &[Value]) -> Result<Value, RuntimeError> {
    compare_chain("<", args, num_lt)
}

fn bi_le(args: &[Value]) -> Result<Value, RuntimeError> {
    compare_chain("<=", args, num_le)
}

fn bi_gt(args: &[Value]) -> Result<Value, RuntimeError> {
    compare_chain(">", args, |a, b| num_lt(b, a))
}

fn bi_ge(args: &[Value]) -> Result<Value, RuntimeError> {
    compare_chain(">=", args, |a, b| num_le(b, a))
}

fn bi_not(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("not", args, 1)?;
    Ok(Value::Bool(!args[0].is_truthy()))
}

// ----- predicates -----

macro_rules! predicate {
    ($fn_name:ident, $name:literal, $pat:pat) => {
        fn $fn_name(args: &[Value]) -> Result<Value, RuntimeError> {
            expect_arity($name, args, 1)?;
            Ok(Value::Bool(matches!(&args[0], $pat)))
        }
    };
}

predicate!(bi_nil_p, "nil?", Value::Nil);
predicate!(bi_true_p, "true?", Value::Bool(true));
predicate!(bi_false_p, "false?", Value::Bool(false));
predicate!(bi_int_p, "int?", Value::Int(_));
predicate!(bi_float_p, "float?", Value::Float(_));
predicate!(bi_number_p, "number?", Value::Int(_) | Value::Float(_));
predicate!(bi_string_p, "string?", Value::Str(_));
predicate!(bi_char_p, "char?", Value::Char(_));
predicate!(bi_boolean_p, "boolean?", Value::Bool(_));
predicate!(bi_keyword_p, "keyword?", Value::Keyword(_));
predicate!(bi_symbol_p, "symbol?", Value::Symbol(_));
predicate!(bi_list_p, "list?", Value::List(_));
predicate!(bi_vector_p, "vector?", Value::Vector(_));
predicate!(bi_map_p, "map?", Value::Map(_));
predicate!(bi_set_p, "set?", Value::Set(_));
predicate!(
    bi_coll_p,
    "coll?",
    Value::List(_) | Value::Vector(_) | Value::Map(_) | Value::Set(_)
);
predicate!(bi_seq_p, "seq?", Value::List(_) | Value::LazySeq(_));
predicate!(
    bi_fn_p,
    "fn?",
    Value::Fn(_) | Value::Builtin(_) | Value::TreeFn(_)
);

fn bi_some_p(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("some?", args, 1)?;
    Ok(Value::Bool(!matches!(&args[0], Value::Nil)))
}

fn bi_ifn_p(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("ifn?", args, 1)?;
    Ok(Value::Bool(args[0].is_callable()))
}

fn bi_zero_p(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("zero?", args, 1)?;
    values_equal(&args[0], &Value::Int(0)).map(Value::Bool)
}

fn bi_pos_p(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("pos?", args, 1)?;
    num_lt(&Value::Int(0), &args[0]).map(Value::Bool)
}

fn bi_neg_p(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("neg?", args, 1)?;
    num_lt(&args[0], &Value::Int(0)).map(Value::Bool)
}

fn bi_even_p(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("even?", args, 1)?;
    match &args[0] {
        Value::Int(i) => Ok(Value::Bool(i % 2 == 0)),
        other => Err(type_error(format!(
            "even?: expected integer, got {}",
            other.type_name()
        ))),
    }
}

fn bi_odd_p(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("odd?", args, 1)?;
    match &args[0] {
        Value::Int(i) => Ok(Value::Bool(i % 2 != 0)),
        other => Err(type_error(format!(
            "odd?: expected integer, got {}",
            other.type_name()
        ))),
    }
}

fn bi_empty_p(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("empty?", args, 1)?;
    Ok(Value::Bool(elements_or_err("empty?", &args[0])?.is_empty()))
}

fn bi_contains_p(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("contains?", args, 2)?;
    match (&args[0], &args[1]) {
        (Value::Map(m), key) => Ok(Value::Bool(m.get(key).is_some())),
        (Value::Set(s), key) => Ok(Value::Bool(s.contains(key))),
        (Value::Vector(v), Value::Int(i)) => {
            Ok(Value::Bool(*i >= 0 && (*i as usize) < v.items.len()))
        }
        (other, _) => Err(type_error(format!(
            "contains?: not supported on {}",
            other.type_name()
        ))),
    }
}

// ----- collections -----

fn bi_list(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::list(args.to_vec()))
}

fn bi_vector(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::vector(args.to_vec()))
}

fn bi_vec(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("vec", args, 1)?;
    Ok(Value::vector(elements_or_err("vec", &args[0])?))
}

fn bi_hash_map(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() % 2 != 0 {
        return Err(value_error("hash-map: odd number of arguments"));
    }
    let mut map = PersistentMap {
        entries: Vec::new(),
        meta: None,
    };
    for pair in args.chunks_exact(2) {
        map = map.assoc(pair[0].clone(), pair[1].clone());
    }
    Ok(Value::Map(Rc::new(map)))
}

fn bi_hash_set(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::set(args.to_vec()))
}

fn bi_set(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("set", args, 1)?;
    Ok(Value::set(elements_or_err("set", &args[0])?))
}

fn bi_cons(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("cons", args, 2)?;
    let mut items = vec![args[0].clone()];
    items.extend(elements_or_err("cons", &args[1])?);
    Ok(Value::list(items))
}

fn bi_conj(args: &[Value]) -> Result<Value, RuntimeError> {
    let [coll, rest @ ..] = args else {
        return Err(arity_error("conj", 0));
    };
    let mut coll = coll.clone();
    for item in rest {
        coll = match &coll {
            Value::Nil => Value::list(vec![item.clone()]),
            Value::List(l) => {
                let mut items = vec![item.clone()];
                items.extend(l.items.iter().cloned());
                Value::list(items)
            }
            Value::Vector(v) => {
                let mut items = v.items.clone();
                items.push(item.clone());
                Value::vector(items)
            }
            Value::Set(s) => Value::Set(Rc::new(s.conj(item.clone()))),
            Value::Map(m) => match item {
                Value::Vector(pair) if pair.items.len() == 2 => Value::Map(Rc::new(
                    m.assoc(pair.items[0].clone(), pair.items[1].clone()),
                )),
                Value::Map(other) => {
                    let mut merged = (**m).clone();
                    for (k, v) in &other.entries {
                        merged = merged.assoc(k.clone(), v.clone());
                    }
                    Value::Map(Rc::new(merged))
                }
                other => {
                    return Err(type_error(format!(
                        "conj: cannot add {} to a map",
                        other.type_name()
                    )));
                }
            },
            other => {
                return Err(type_error(format!(
                    "conj: not supported on {}",
                    other.type_name()
                )));
            }
        };
    }
    Ok(coll)
}

fn bi_first(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("first", args, 1)?;
    Ok(elements_or_err("first", &args[0])?
        .first()
        .cloned()
        .unwrap_or(Value::Nil))
}

fn bi_rest(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("rest", args, 1)?;
    let items = elements_or_err("rest", &args[0])?;
    if items.is_empty() {
        Ok(Value::list(Vec::new()))
    } else {
        Ok(Value::list(items[1..].to_vec()))
    }
}

fn bi_next(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("next", args, 1)?;
    let items = elements_or_err("next", &args[0])?;
    if items.len() <= 1 {
        Ok(Value::Nil)
    } else {
        Ok(Value::list(items[1..].to_vec()))
    }
}

fn bi_seq(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("seq", args, 1)?;
    let items = elements_or_err("seq", &args[0])?;
    if items.is_empty() {
        Ok(Value::Nil)
    } else {
        Ok(Value::list(items))
    }
}

fn bi_count(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("count", args, 1)?;
    Ok(Value::Int(elements_or_err("count", &args[0])?.len() as i64))
}

fn bi_nth(args: &[Value]) -> Result<Value, RuntimeError> {
    let (coll, idx, default) = match args {
        [coll, idx] => (coll, idx, None),
        [coll, idx, default] => (coll, idx, Some(default)),
        _ => return Err(arity_error("nth", args.len())),
    };
    let Value::Int(i) = idx else {
        return Err(type_error("nth: index must be an integer"));
    };
    let items = elements_or_err("nth", coll)?;
    if *i >= 0 && (*i as usize) < items.len() {
        Ok(items[*i as usize].clone())
    } else {
        match default {
            Some(d) => Ok(d.clone()),
            None => Err(index_error(format!(
                "nth: index {} out of bounds for count {}",
                i,
                items.len()
            ))),
        }
    }
}

fn bi_get(args: &[Value]) -> Result<Value, RuntimeError> {
    let (coll, key, default) = match args {
        [coll, key] => (coll, key, Value::Nil),
        [coll, key, default] => (coll, key, default.clone()),
        _ => return Err(arity_error("get", args.len())),
    };
    match coll {
        Value::Map(m) => Ok(m.get(key).cloned().unwrap_or(default)),
        Value::Set(s) => Ok(if s.contains(key) {
            key.clone()
        } else {
            default
        }),
        Value::Vector(v) => match key {
            Value::Int(i) if *i >= 0 && (*i as usize) < v.items.len() => {
                Ok(v.items[*i as usize].clone())
            }
            _ => Ok(default),
        },
        _ => Ok(default),
    }
}

fn bi_assoc(args: &[Value]) -> Result<Value, RuntimeError> {
    let [coll, kvs @ ..] = args else {
        return Err(arity_error("assoc", 0));
    };
    if kvs.is_empty() || kvs.len() % 2 != 0 {
        return Err(value_error("assoc: expects key/value pairs"));
    }
    match coll {
        Value::Map(m) => {
            let mut map = (**m).clone();
            for pair in kvs.chunks_exact(2) {
                map = map.assoc(pair[0].clone(), pair[1].clone());
            }
            Ok(Value::Map(Rc::new(map)))
        }
        Value::Nil => bi_hash_map(kvs),
        Value::Vector(v) => {
            let mut items = v.items.clone();
            for pair in kvs.chunks_exact(2) {
                let Value::Int(i) = &pair[0] else {
                    return Err(type_error("assoc: vector index must be an integer"));
                };
                let i = *i;
                if i < 0 || i as usize > items.len() {
                    return Err(index_error(format!(
                        "assoc: index {} out of bounds for vector of {}",
                        i,
                        items.len()
                    )));
                }
                if i as usize == items.len() {
                    items.push(pair[1].clone());
                } else {
                    items[i as usize] = pair[1].clone();
                }
            }
            Ok(Value::vector(items))
        }
        other => Err(type_error(format!(
            "assoc: not supported on {}",
            other.type_name()
        ))),
    }
}

fn bi_dissoc(args: &[Value]) -> Result<Value, RuntimeError> {
    let [coll, keys @ ..] = args else {
        return Err(arity_error("dissoc", 0));
    };
    let Value::Map(m) = coll else {
        return Err(type_error(format!(
            "dissoc: not supported on {}",
            coll.type_name()
        )));
    };
    let mut map = (**m).clone();
    for key in keys {
        map = map.dissoc(key);
    }
    Ok(Value::Map(Rc::new(map)))
}

fn bi_keys(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("keys", args, 1)?;
    let Value::Map(m) = &args[0] else {
        return Err(type_error("keys: expected a map"));
    };
    Ok(Value::list(m.entries.iter().map(|(k, _)| k.clone()).collect()))
}

fn bi_vals(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("vals", args, 1)?;
    let Value::Map(m) = &args[0] else {
        return Err(type_error("vals: expected a map"));
    };
    Ok(Value::list(m.entries.iter().map(|(_, v)| v.clone()).collect()))
}

fn bi_concat(args: &[Value]) -> Result<Value, RuntimeError> {
    let mut items = Vec::new();
    for arg in args {
        items.extend(elements_or_err("concat", arg)?);
    }
    Ok(Value::list(items))
}

fn bi_reverse(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("reverse", args, 1)?;
    let mut items = elements_or_err("reverse", &args[0])?;
    items.reverse();
    Ok(Value::list(items))
}

fn bi_last(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("last", args, 1)?;
    Ok(elements_or_err("last", &args[0])?
        .last()
        .cloned()
        .unwrap_or(Value::Nil))
}

fn bi_range(args: &[Value]) -> Result<Value, RuntimeError> {
    let (start, end, step) = match args {
        [Value::Int(end)] => (0, *end, 1),
        [Value::Int(start), Value::Int(end)] => (*start, *end, 1),
        [Value::Int(start), Value::Int(end), Value::Int(step)] => (*start, *end, *step),
        _ => return Err(type_error("range: expected integer bounds")),
    };
    if step == 0 {
        return Err(value_error("range: step must not be zero"));
    }
    let mut items = Vec::new();
    let mut i = start;
    while (step > 0 && i < end) || (step < 0 && i > end) {
        items.push(Value::Int(i));
        i += step;
    }
    Ok(Value::list(items))
}

fn bi_take(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("take", args, 2)?;
    let Value::Int(n) = &args[0] else {
        return Err(type_error("take: expected an integer count"));
    };
    let items = elements_or_err("take", &args[1])?;
    let n = (*n).max(0) as usize;
    Ok(Value::list(items.into_iter().take(n).collect()))
}

fn bi_drop(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("drop", args, 2)?;
    let Value::Int(n) = &args[0] else {
        return Err(type_error("drop: expected an integer count"));
    };
    let items = elements_or_err("drop", &args[1])?;
    let n = (*n).max(0) as usize;
    Ok(Value::list(items.into_iter().skip(n).collect()))
}

fn bi_into(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("into", args, 2)?;
    let items = elements_or_err("into", &args[1])?;
    let mut conj_args = vec![args[0].clone()];
    conj_args.extend(items);
    bi_conj(&conj_args)
}

// ----- strings and names -----

fn bi_str(args: &[Value]) -> Result<Value, RuntimeError> {
    let mut out = String::new();
    for arg in args {
        if !matches!(arg, Value::Nil) {
            out.push_str(&arg.to_string());
        }
    }
    Ok(Value::string(out))
}

fn bi_subs(args: &[Value]) -> Result<Value, RuntimeError> {
    let (s, start, end) = match args {
        [Value::Str(s), Value::Int(start)] => (s, *start, None),
        [Value::Str(s), Value::Int(start), Value::Int(end)] => (s, *start, Some(*end)),
        _ => return Err(type_error("subs: expected (subs s start end?)")),
    };
    let chars: Vec<char> = s.chars().collect();
    let end = end.unwrap_or(chars.len() as i64);
    if start < 0 || end < start || end as usize > chars.len() {
        return Err(index_error(format!(
            "subs: range {}..{} out of bounds for length {}",
            start,
            end,
            chars.len()
        )));
    }
    Ok(Value::string(
        chars[start as usize..end as usize].iter().collect::<String>(),
    ))
}

fn bi_name(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("name", args, 1)?;
    match &args[0] {
        Value::Str(s) => Ok(Value::Str(s.clone())),
        Value::Symbol(s) | Value::Keyword(s) => Ok(Value::Str(s.name.clone())),
        other => Err(type_error(format!(
            "name: not supported on {}",
            other.type_name()
        ))),
    }
}

fn bi_namespace(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("namespace", args, 1)?;
    match &args[0] {
        Value::Symbol(s) | Value::Keyword(s) => Ok(match &s.ns {
            Some(ns) => Value::Str(ns.clone()),
            None => Value::Nil,
        }),
        other => Err(type_error(format!(
            "namespace: not supported on {}",
            other.type_name()
        ))),
    }
}

fn bi_keyword(args: &[Value]) -> Result<Value, RuntimeError> {
    match args {
        [Value::Keyword(k)] => Ok(Value::Keyword(k.clone())),
        [Value::Str(s)] => Ok(Value::keyword(None, s.clone())),
        [Value::Symbol(s)] => Ok(Value::keyword(s.ns.clone(), s.name.clone())),
        [Value::Str(ns), Value::Str(name)] => {
            Ok(Value::keyword(Some(ns.clone()), name.clone()))
        }
        _ => Err(type_error("keyword: expected a name or ns/name strings")),
    }
}

fn bi_symbol(args: &[Value]) -> Result<Value, RuntimeError> {
    match args {
        [Value::Symbol(s)] => Ok(Value::Symbol(s.clone())),
        [Value::Str(s)] => Ok(Value::symbol(None, s.clone())),
        [Value::Keyword(k)] => Ok(Value::symbol(k.ns.clone(), k.name.clone())),
        [Value::Str(ns), Value::Str(name)] => Ok(Value::symbol(Some(ns.clone()), name.clone())),
        _ => Err(type_error("symbol: expected a name or ns/name strings")),
    }
}

thread_local! {
    static GENSYM_COUNTER: Cell<u64> = const { Cell::new(0) };
}

fn bi_gensym(args: &[Value]) -> Result<Value, RuntimeError> {
    let prefix = match args {
        [] => "G__".to_string(),
        [Value::Str(s)] => s.to_string(),
        [Value::Symbol(s)] => s.name.to_string(),
        _ => return Err(type_error("gensym: expected an optional prefix")),
    };
    let n = GENSYM_COUNTER.with(|c| {
        let n = c.get();
        c.set(n + 1);
        n
    });
    Ok(Value::symbol(None, format!("{}{}", prefix, n)))
}

// ----- printing -----

fn bi_pr_str(args: &[Value]) -> Result<Value, RuntimeError> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        parts.push(deep_realize(arg)?.pr_str());
    }
    Ok(Value::string(parts.join(" ")))
}

fn bi_print(args: &[Value]) -> Result<Value, RuntimeError> {
    let text: Vec<String> = args.iter().map(|v| v.to_string()).collect();
    print!("{}", text.join(" "));
    Ok(Value::Nil)
}

fn bi_println(args: &[Value]) -> Result<Value, RuntimeError> {
    let text: Vec<String> = args.iter().map(|v| v.to_string()).collect();
    println!("{}", text.join(" "));
    Ok(Value::Nil)
}

fn bi_prn(args: &[Value]) -> Result<Value, RuntimeError> {
    let Value::Str(s) = bi_pr_str(args)? else {
        return Ok(Value::Nil);
    };
    println!("{}", s);
    Ok(Value::Nil)
}

// ----- higher-order -----

fn bi_apply(args: &[Value]) -> Result<Value, RuntimeError> {
    let [f, middle @ .., last] = args else {
        return Err(arity_error("apply", args.len()));
    };
    let mut call_args: Vec<Value> = middle.to_vec();
    call_args.extend(elements_or_err("apply", last)?);
    call_function(f, &call_args)
}

fn bi_map(args: &[Value]) -> Result<Value, RuntimeError> {
    let [f, colls @ ..] = args else {
        return Err(arity_error("map", 0));
    };
    if colls.is_empty() {
        return Err(arity_error("map", 1));
    }
    let columns: Vec<Vec<Value>> = colls
        .iter()
        .map(|c| elements_or_err("map", c))
        .collect::<Result<_, _>>()?;
    let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
    let mut out = Vec::with_capacity(shortest);
    for i in 0..shortest {
        let row: Vec<Value> = columns.iter().map(|col| col[i].clone()).collect();
        out.push(call_function(f, &row)?);
    }
    Ok(Value::list(out))
}

fn bi_filter(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("filter", args, 2)?;
    let items = elements_or_err("filter", &args[1])?;
    let mut out = Vec::new();
    for item in items {
        if call_function(&args[0], std::slice::from_ref(&item))?.is_truthy() {
            out.push(item);
        }
    }
    Ok(Value::list(out))
}

fn bi_reduce(args: &[Value]) -> Result<Value, RuntimeError> {
    let (f, init, coll) = match args {
        [f, coll] => (f, None, coll),
        [f, init, coll] => (f, Some(init.clone()), coll),
        _ => return Err(arity_error("reduce", args.len())),
    };
    let items = elements_or_err("reduce", coll)?;
    let mut iter = items.into_iter();
    let mut acc = match init {
        Some(init) => init,
        None => match iter.next() {
            Some(first) => first,
            None => return call_function(f, &[]),
        },
    };
    for item in iter {
        acc = call_function(f, &[acc, item])?;
    }
    Ok(acc)
}

fn bi_identity(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("identity", args, 1)?;
    Ok(args[0].clone())
}

// ----- references -----

fn bi_atom(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("atom", args, 1)?;
    Ok(Value::Atom(Rc::new(std::cell::RefCell::new(
        args[0].clone(),
    ))))
}

fn bi_deref(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("deref", args, 1)?;
    match &args[0] {
        Value::Atom(a) | Value::Volatile(a) => Ok(a.borrow().clone()),
        Value::Var(v) => Ok(v.deref()),
        other => Err(type_error(format!(
            "deref: not supported on {}",
            other.type_name()
        ))),
    }
}

fn bi_reset(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("reset!", args, 2)?;
    let Value::Atom(a) = &args[0] else {
        return Err(type_error("reset!: expected an atom"));
    };
    *a.borrow_mut() = args[1].clone();
    Ok(args[1].clone())
}

fn bi_swap(args: &[Value]) -> Result<Value, RuntimeError> {
    let [atom, f, extra @ ..] = args else {
        return Err(arity_error("swap!", args.len()));
    };
    let Value::Atom(a) = atom else {
        return Err(type_error("swap!: expected an atom"));
    };
    let old = a.borrow().clone();
    let mut call_args = vec![old];
    call_args.extend(extra.iter().cloned());
    let new = call_function(f, &call_args)?;
    *a.borrow_mut() = new.clone();
    Ok(new)
}

fn bi_volatile(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("volatile!", args, 1)?;
    Ok(Value::Volatile(Rc::new(std::cell::RefCell::new(
        args[0].clone(),
    ))))
}

fn bi_vreset(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("vreset!", args, 2)?;
    let Value::Volatile(v) = &args[0] else {
        return Err(type_error("vreset!: expected a volatile"));
    };
    *v.borrow_mut() = args[1].clone();
    Ok(args[1].clone())
}

fn bi_vswap(args: &[Value]) -> Result<Value, RuntimeError> {
    let [vol, f, extra @ ..] = args else {
        return Err(arity_error("vswap!", args.len()));
    };
    let Value::Volatile(v) = vol else {
        return Err(type_error("vswap!: expected a volatile"));
    };
    let old = v.borrow().clone();
    let mut call_args = vec![old];
    call_args.extend(extra.iter().cloned());
    let new = call_function(f, &call_args)?;
    *v.borrow_mut() = new.clone();
    Ok(new)
}

// ----- dynamic bindings -----

fn bi_push_bindings(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("push-thread-bindings", args, 1)?;
    let Value::Map(m) = &args[0] else {
        return Err(type_error("push-thread-bindings: expected a var->value map"));
    };
    for (var, value) in &m.entries {
        let Value::Var(var) = var else {
            return Err(type_error("push-thread-bindings: keys must be vars"));
        };
        if !var.dynamic.get() {
            return Err(value_error(format!(
                "can't dynamically bind non-dynamic var: {}",
                var.qualified_name()
            )));
        }
        var.push_binding(value.clone());
    }
    Ok(Value::Nil)
}

fn bi_pop_bindings(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("pop-thread-bindings", args, 1)?;
    let Value::Map(m) = &args[0] else {
        return Err(type_error("pop-thread-bindings: expected a var->value map"));
    };
    for (var, _) in &m.entries {
        if let Value::Var(var) = var {
            var.pop_binding();
        }
    }
    Ok(Value::Nil)
}

// ----- namespaces -----

fn with_env<R>(
    name: &str,
    f: impl FnOnce(Rc<Env>) -> Result<R, RuntimeError>,
) -> Result<R, RuntimeError> {
    match crate::env::current_env() {
        Some(env) => f(env),
        None => Err(value_error(format!("{}: no active environment", name))),
    }
}

fn bi_in_ns(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("in-ns", args, 1)?;
    let Value::Symbol(s) = &args[0] else {
        return Err(type_error("in-ns: expected a symbol"));
    };
    with_env("in-ns", |env| {
        env.set_current(s.name.clone());
        Ok(Value::symbol(None, s.name.clone()))
    })
}

fn bi_alias(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("alias", args, 2)?;
    let (Value::Symbol(alias), Value::Symbol(target)) = (&args[0], &args[1]) else {
        return Err(type_error("alias: expected two symbols"));
    };
    with_env("alias", |env| {
        env.current_ns()
            .set_alias(alias.name.clone(), target.name.clone());
        Ok(Value::Nil)
    })
}

fn bi_refer(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("refer", args, 1)?;
    let Value::Symbol(source) = &args[0] else {
        return Err(type_error("refer: expected a namespace symbol"));
    };
    with_env("refer", |env| {
        let Some(source_ns) = env.find_namespace(&source.name) else {
            return Err(value_error(format!("refer: no namespace {}", source.name)));
        };
        let current = env.current_ns();
        for var in source_ns.owned_vars() {
            if !var.private.get() {
                current.refer(var.name.clone(), var.clone());
            }
        }
        Ok(Value::Nil)
    })
}

// ----- exceptions -----

fn bi_ex_info(args: &[Value]) -> Result<Value, RuntimeError> {
    let (message, data, cause) = match args {
        [Value::Str(m), d] => (m.clone(), d.clone(), Value::Nil),
        [Value::Str(m), d, c] => (m.clone(), d.clone(), c.clone()),
        _ => return Err(type_error("ex-info: expected (ex-info msg map cause?)")),
    };
    Ok(Value::map(vec![
        (Value::keyword(None, "__ex_info"), Value::Bool(true)),
        (Value::keyword(None, "message"), Value::Str(message)),
        (Value::keyword(None, "data"), data),
        (Value::keyword(None, "cause"), cause),
        (
            Value::keyword(None, "__ex_type"),
            Value::Str("ExceptionInfo".into()),
        ),
    ]))
}

fn bi_ex_message(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("ex-message", args, 1)?;
    if let Value::Map(m) = &args[0]
        && let Some(message) = m.get(&Value::keyword(None, "message"))
    {
        return Ok(message.clone());
    }
    Ok(Value::Nil)
}

fn bi_ex_data(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("ex-data", args, 1)?;
    if let Value::Map(m) = &args[0]
        && let Some(data) = m.get(&Value::keyword(None, "data"))
    {
        return Ok(data.clone());
    }
    Ok(Value::Nil)
}

// ----- metadata and types -----

fn bi_meta(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("meta", args, 1)?;
    Ok(args[0].meta().unwrap_or(Value::Nil))
}

fn bi_with_meta(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("with-meta", args, 2)?;
    args[0].with_meta(args[1].clone())
}

fn bi_type(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("type", args, 1)?;
    Ok(Value::string(args[0].type_name()))
}

// ----- I/O -----

fn bi_slurp(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("slurp", args, 1)?;
    let Value::Str(path) = &args[0] else {
        return Err(type_error("slurp: expected a path string"));
    };
    std::fs::read_to_string(&**path)
        .map(Value::string)
        .map_err(|e| io_error(format!("slurp: {}: {}", path, e)))
}

// ----- regex -----

fn compile_pattern(name: &str, pattern: &Value) -> Result<regex::Regex, RuntimeError> {
    let Value::Str(pattern) = pattern else {
        return Err(type_error(format!("{}: expected a pattern string", name)));
    };
    regex::Regex::new(pattern)
        .map_err(|e| value_error(format!("{}: invalid pattern: {}", name, e)))
}

fn bi_re_pattern(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("re-pattern", args, 1)?;
    compile_pattern("re-pattern", &args[0])?;
    Ok(args[0].clone())
}

fn match_value(captures: &regex::Captures) -> Value {
    if captures.len() == 1 {
        return Value::string(captures.get(0).map(|m| m.as_str()).unwrap_or(""));
    }
    Value::vector(
        (0..captures.len())
            .map(|i| match captures.get(i) {
                Some(m) => Value::string(m.as_str()),
                None => Value::Nil,
            })
            .collect(),
    )
}

fn bi_re_matches(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("re-matches", args, 2)?;
    let re = compile_pattern("re-matches", &args[0])?;
    let Value::Str(s) = &args[1] else {
        return Err(type_error("re-matches: expected a string"));
    };
    match re.captures(s) {
        Some(c) if c.get(0).is_some_and(|m| m.as_str() == &**s) => Ok(match_value(&c)),
        _ => Ok(Value::Nil),
    }
}

fn bi_re_find(args: &[Value]) -> Result<Value, RuntimeError> {
    expect_arity("re-find", args, 2)?;
    let re = compile_pattern("re-find", &args[0])?;
    let Value::Str(s) = &args[1] else {
        return Err(type_error("re-find: expected a string"));
    };
    match re.captures(s) {
        Some(c) => Ok(match_value(&c)),
        None => Ok(Value::Nil),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvGuard;
    use crate::gc::ArenaGc;
    use clove_core::error::ErrorKind;

    fn test_env() -> Rc<Env> {
        let env = Env::new(Rc::new(ArenaGc::new()));
        install(&env);
        env
    }

    #[test]
    fn test_install_binds_core_vars() {
        let env = test_env();
        let var = env.resolve("+").unwrap();
        assert!(matches!(var.root(), Value::Builtin(_)));
        assert_eq!(&*var.ns, "clojure.core");
    }

    #[test]
    fn test_variadic_arithmetic() {
        assert_eq!(
            bi_add(&[Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap(),
            Value::Int(6)
        );
        assert_eq!(bi_add(&[]).unwrap(), Value::Int(0));
        assert_eq!(bi_mul(&[]).unwrap(), Value::Int(1));
        assert_eq!(bi_sub(&[Value::Int(5)]).unwrap(), Value::Int(-5));
        assert_eq!(bi_div(&[Value::Int(2)]).unwrap(), Value::Float(0.5));
        assert!(bi_sub(&[]).is_err());
        assert!(bi_div(&[]).is_err());
    }

    #[test]
    fn test_comparison_chains() {
        assert_eq!(
            bi_lt(&[Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            bi_lt(&[Value::Int(1), Value::Int(3), Value::Int(2)]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            bi_eq(&[Value::Int(3), Value::Float(3.0)]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_collection_basics() {
        let l = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(bi_first(&[l.clone()]).unwrap(), Value::Int(1));
        assert_eq!(
            bi_rest(&[l.clone()]).unwrap(),
            Value::list(vec![Value::Int(2)])
        );
        assert_eq!(bi_count(&[l.clone()]).unwrap(), Value::Int(2));
        assert_eq!(bi_first(&[Value::Nil]).unwrap(), Value::Nil);
        assert_eq!(bi_next(&[Value::list(vec![Value::Int(1)])]).unwrap(), Value::Nil);
        // conj front for lists, back for vectors
        assert_eq!(
            bi_conj(&[l, Value::Int(0)]).unwrap(),
            Value::list(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            bi_conj(&[Value::vector(vec![Value::Int(1)]), Value::Int(2)]).unwrap(),
            Value::vector(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_map_ops() {
        let m = bi_hash_map(&[
            Value::keyword(None, "a"),
            Value::Int(1),
            Value::keyword(None, "b"),
            Value::Int(2),
        ])
        .unwrap();
        assert_eq!(
            bi_get(&[m.clone(), Value::keyword(None, "a")]).unwrap(),
            Value::Int(1)
        );
        let m2 = bi_assoc(&[m.clone(), Value::keyword(None, "c"), Value::Int(3)]).unwrap();
        assert_eq!(bi_count(&[m2]).unwrap(), Value::Int(3));
        assert_eq!(bi_count(&[m.clone()]).unwrap(), Value::Int(2));
        let m3 = bi_dissoc(&[m, Value::keyword(None, "a")]).unwrap();
        assert_eq!(bi_count(&[m3]).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_range() {
        assert_eq!(
            bi_range(&[Value::Int(3)]).unwrap(),
            Value::list(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            bi_range(&[Value::Int(5), Value::Int(1), Value::Int(-2)]).unwrap(),
            Value::list(vec![Value::Int(5), Value::Int(3)])
        );
        assert!(bi_range(&[Value::Int(0), Value::Int(5), Value::Int(0)]).is_err());
    }

    #[test]
    fn test_str_and_subs() {
        assert_eq!(
            bi_str(&[Value::Int(1), Value::Nil, Value::Str("x".into())]).unwrap(),
            Value::Str("1x".into())
        );
        assert_eq!(
            bi_subs(&[Value::Str("hello".into()), Value::Int(1), Value::Int(3)]).unwrap(),
            Value::Str("el".into())
        );
        assert!(bi_subs(&[Value::Str("hi".into()), Value::Int(0), Value::Int(9)]).is_err());
    }

    #[test]
    fn test_higher_order_through_builtins() {
        let env = test_env();
        let _guard = EnvGuard::install(env.clone());
        let plus = env.resolve("+").unwrap().root();
        assert_eq!(
            bi_reduce(&[plus.clone(), bi_range(&[Value::Int(5)]).unwrap()]).unwrap(),
            Value::Int(10)
        );
        assert_eq!(
            bi_apply(&[
                plus,
                Value::Int(1),
                Value::list(vec![Value::Int(2), Value::Int(3)])
            ])
            .unwrap(),
            Value::Int(6)
        );
        let inc = env.resolve("inc").unwrap().root();
        assert_eq!(
            bi_map(&[inc, Value::vector(vec![Value::Int(1), Value::Int(2)])]).unwrap(),
            Value::list(vec![Value::Int(2), Value::Int(3)])
        );
        let even = env.resolve("even?").unwrap().root();
        assert_eq!(
            bi_filter(&[even, bi_range(&[Value::Int(4)]).unwrap()]).unwrap(),
            Value::list(vec![Value::Int(0), Value::Int(2)])
        );
    }

    #[test]
    fn test_atom_swap() {
        let env = test_env();
        let _guard = EnvGuard::install(env.clone());
        let a = bi_atom(&[Value::Int(1)]).unwrap();
        let plus = env.resolve("+").unwrap().root();
        assert_eq!(
            bi_swap(&[a.clone(), plus, Value::Int(41)]).unwrap(),
            Value::Int(42)
        );
        assert_eq!(bi_deref(&[a]).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_dynamic_binding_requires_dynamic_var() {
        let env = test_env();
        let _guard = EnvGuard::install(env.clone());
        let var = env.intern("user", "x".into());
        var.bind_root(Value::Int(1));
        let binding_map = Value::map(vec![(Value::Var(var.clone()), Value::Int(2))]);
        let err = bi_push_bindings(std::slice::from_ref(&binding_map)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Value);
        var.dynamic.set(true);
        bi_push_bindings(std::slice::from_ref(&binding_map)).unwrap();
        assert_eq!(var.deref(), Value::Int(2));
        bi_pop_bindings(&[binding_map]).unwrap();
        assert_eq!(var.deref(), Value::Int(1));
    }

    #[test]
    fn test_ex_info_shape() {
        let exc = bi_ex_info(&[
            Value::Str("bad".into()),
            Value::map(vec![(Value::keyword(None, "k"), Value::Int(1))]),
        ])
        .unwrap();
        assert_eq!(bi_ex_message(&[exc.clone()]).unwrap(), Value::Str("bad".into()));
        assert_eq!(
            bi_ex_data(&[exc.clone()]).unwrap(),
            Value::map(vec![(Value::keyword(None, "k"), Value::Int(1))])
        );
        assert_eq!(
            crate::exception::ex_type_of(&exc).as_deref(),
            Some("ExceptionInfo")
        );
    }

    #[test]
    fn test_regex_builtins() {
        assert_eq!(
            bi_re_find(&[Value::Str("\\d+".into()), Value::Str("abc123".into())]).unwrap(),
            Value::Str("123".into())
        );
        assert_eq!(
            bi_re_matches(&[Value::Str("\\d+".into()), Value::Str("abc123".into())]).unwrap(),
            Value::Nil
        );
        assert_eq!(
            bi_re_matches(&[Value::Str("a(b)c".into()), Value::Str("abc".into())]).unwrap(),
            Value::vector(vec![Value::Str("abc".into()), Value::Str("b".into())])
        );
        assert!(bi_re_pattern(&[Value::Str("(".into())]).is_err());
    }

    #[test]
    fn test_slurp_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, "hello").unwrap();
        let result = bi_slurp(&[Value::string(path.display().to_string())]).unwrap();
        assert_eq!(result, Value::Str("hello".into()));
        assert!(bi_slurp(&[Value::Str("/no/such/file".into())]).is_err());
    }

    #[test]
    fn test_gensym_unique() {
        let a = bi_gensym(&[]).unwrap();
        let b = bi_gensym(&[]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_in_ns_and_refer() {
        let env = test_env();
        let _guard = EnvGuard::install(env.clone());
        env.intern("user", "helper".into()).bind_root(Value::Int(1));
        bi_in_ns(&[Value::symbol(None, "scratch")]).unwrap();
        assert_eq!(&*env.current_ns_name(), "scratch");
        bi_refer(&[Value::symbol(None, "user")]).unwrap();
        assert_eq!(env.resolve("helper").unwrap().root(), Value::Int(1));
        env.set_current("user".into());
    }
}
