//! Process-wide state lifecycle
//!
//! The per-thread VM pointer and the exception mailbox are set and
//! cleared around each outer call; these tests pin that contract down.
//! They share thread-local state, so they run serially.

use clove_core::chunk::{Chunk, Op};
use clove_core::error::ErrorKind;
use clove_core::value::Value;
use clove_runtime::{Vm, default_env, exception, vm_pointer_clear};
use serial_test::serial;
use std::rc::Rc;

fn chunk_of(code: Vec<(Op, u16)>, consts: Vec<Value>) -> Rc<Chunk> {
    let mut chunk = Chunk::new();
    chunk.consts = consts;
    for (op, operand) in code {
        chunk.emit(op, operand);
    }
    Rc::new(chunk)
}

#[test]
#[serial]
fn test_vm_pointer_cleared_after_run() {
    assert!(vm_pointer_clear());
    let env = default_env();
    let mut vm = Vm::new(env);
    let result = vm
        .run_chunk(chunk_of(vec![(Op::Const, 0)], vec![Value::Int(1)]))
        .unwrap();
    assert_eq!(result, Value::Int(1));
    assert!(vm_pointer_clear());
}

#[test]
#[serial]
fn test_vm_pointer_cleared_after_error() {
    let env = default_env();
    let mut vm = Vm::new(env);
    let err = vm
        .run_chunk(chunk_of(
            vec![(Op::Const, 0), (Op::ThrowEx, 0)],
            vec![Value::Str("boom".into())],
        ))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::User);
    assert!(vm_pointer_clear());
    // the mailbox was consumed when the error surfaced
    assert!(exception::exception_slot_clear());
}

#[test]
#[serial]
fn test_exception_mailbox_consumed_by_surfacing() {
    assert!(exception::exception_slot_clear());
    let env = default_env();
    let mut vm = Vm::new(env);
    let err = vm
        .run_chunk(chunk_of(
            vec![(Op::Const, 0), (Op::ThrowEx, 0)],
            vec![Value::Int(13)],
        ))
        .unwrap_err();
    // the thrown value rides on the surfaced error, not in the mailbox
    assert_eq!(err.data, Some(Value::Int(13)));
    assert!(exception::exception_slot_clear());
}

#[test]
#[serial]
fn test_nested_outer_calls_restore_pointer() {
    let env = default_env();
    let mut vm = Vm::new(env.clone());
    // a builtin that itself runs a nested outer call on a fresh VM
    let plus = env.resolve("+").unwrap().root();
    let result = vm.call_value_outer(&plus, &[Value::Int(1), Value::Int(2)]);
    assert_eq!(result.unwrap(), Value::Int(3));
    assert!(vm_pointer_clear());
}
