//! Exception value conversion and the cross-backend mailbox
//!
//! Runtime errors thrown from builtins are converted at the VM/builtin
//! boundary into a synthetic exception map so `try`/`catch` sees Clojure
//! data uniformly. The map carries `:__ex_info true`, `:message`, `:data`,
//! `:cause`, and `:__ex_type` (what `exception_type_check` matches on).
//!
//! When a throw escapes its own backend's handler scope the exception
//! value is parked in a single-entry mailbox and an error sentinel is
//! returned to the outer caller, which consumes the slot and resumes
//! dispatch in its own representation.

use clove_core::error::{ErrorKind, RuntimeError};
use clove_core::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// Build the synthetic exception map for a runtime error.
pub fn exception_map(err: &RuntimeError) -> Value {
    Value::map(vec![
        (Value::keyword(None, "__ex_info"), Value::Bool(true)),
        (
            Value::keyword(None, "message"),
            Value::Str(err.message.as_str().into()),
        ),
        (
            Value::keyword(None, "data"),
            err.data.clone().unwrap_or(Value::Nil),
        ),
        (Value::keyword(None, "cause"), Value::Nil),
        (
            Value::keyword(None, "__ex_type"),
            Value::Str(err.kind.type_name().into()),
        ),
    ])
}

/// The value a `catch` binding sees for this error: a user `throw` keeps
/// the thrown value as-is; engine errors become the synthetic map.
pub fn exception_value(err: &RuntimeError) -> Value {
    match (&err.kind, &err.data) {
        (ErrorKind::User, Some(value)) => value.clone(),
        _ => exception_map(err),
    }
}

/// Read `:__ex_type` out of a (synthetic) exception map.
pub fn ex_type_of(value: &Value) -> Option<Rc<str>> {
    if let Value::Map(m) = value
        && let Some(Value::Str(t)) = m.get(&Value::keyword(None, "__ex_type"))
    {
        return Some(t.clone());
    }
    None
}

/// Does the exception value match a catch clause's class name?
///
/// `Exception`, `Throwable` and `Object` match everything; anything else
/// matches by string equality against the synthetic map's `:__ex_type`.
pub fn matches_class(value: &Value, class: &str) -> bool {
    if matches!(class, "Exception" | "Throwable" | "Object") {
        return true;
    }
    ex_type_of(value).is_some_and(|t| &*t == class)
}

/// Turn a caught exception value back into a throwable error.
pub fn rethrow(value: Value) -> RuntimeError {
    RuntimeError::thrown(value)
}

thread_local! {
    /// Single-entry mailbox crossing the VM/tree-walk boundary: set on an
    /// escaping throw, consumed on catch or error surfacing.
    static LAST_EXCEPTION: RefCell<Option<Value>> = const { RefCell::new(None) };
}

pub fn park_exception(value: Value) {
    LAST_EXCEPTION.with(|slot| *slot.borrow_mut() = Some(value));
}

pub fn take_exception() -> Option<Value> {
    LAST_EXCEPTION.with(|slot| slot.borrow_mut().take())
}

/// Whether the mailbox is empty; outer-call lifecycles assert this on
/// return.
pub fn exception_slot_clear() -> bool {
    LAST_EXCEPTION.with(|slot| slot.borrow().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clove_core::error::arithmetic_error;

    #[test]
    fn test_exception_map_shape() {
        let err = arithmetic_error("divide by zero");
        let map = exception_map(&err);
        if let Value::Map(m) = &map {
            assert_eq!(
                m.get(&Value::keyword(None, "__ex_info")),
                Some(&Value::Bool(true))
            );
            assert_eq!(
                m.get(&Value::keyword(None, "message")),
                Some(&Value::Str("divide by zero".into()))
            );
        } else {
            panic!("expected map");
        }
        assert_eq!(ex_type_of(&map).as_deref(), Some("ArithmeticError"));
    }

    #[test]
    fn test_user_throw_keeps_value() {
        let err = RuntimeError::thrown(Value::Str("boom".into()));
        assert_eq!(exception_value(&err), Value::Str("boom".into()));
    }

    #[test]
    fn test_matches_class() {
        let err = arithmetic_error("overflow");
        let exc = exception_value(&err);
        assert!(matches_class(&exc, "Exception"));
        assert!(matches_class(&exc, "ArithmeticError"));
        assert!(!matches_class(&exc, "TypeError"));
        // plain thrown strings only match the catch-all classes
        assert!(matches_class(&Value::Str("boom".into()), "Exception"));
        assert!(!matches_class(&Value::Str("boom".into()), "ArithmeticError"));
    }

    #[test]
    fn test_mailbox_is_single_entry() {
        assert!(exception_slot_clear());
        park_exception(Value::Int(1));
        park_exception(Value::Int(2));
        assert_eq!(take_exception(), Some(Value::Int(2)));
        assert_eq!(take_exception(), None);
        assert!(exception_slot_clear());
    }
}
