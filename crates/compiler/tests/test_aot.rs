//! AOT artefacts end-to-end
//!
//! `build` compiles a source file to a CLJC artefact; `load` executes it
//! against a fresh environment. This is the loader contract the embedded
//! standard library relies on.

use clove_core::value::Value;
use clovec::{EvalConfig, Session};
use clove_runtime::{Vm, default_env, load_snapshot, read_artifact, write_artifact, write_snapshot};
use std::rc::Rc;

fn build(source: &str) -> Vec<u8> {
    let mut session = Session::new(EvalConfig::default());
    let chunk = session.build_str(source).unwrap();
    write_artifact(&chunk).unwrap()
}

fn load_and_run(bytes: &[u8]) -> Value {
    let env = default_env();
    clovec::install_reader_builtins(&env);
    let chunk = read_artifact(bytes, &env).unwrap();
    let mut vm = Vm::new(env);
    vm.run_chunk(Rc::new(chunk)).unwrap()
}

#[test]
fn test_artifact_round_trip_simple() {
    let bytes = build("(+ 1 2 3)");
    assert_eq!(load_and_run(&bytes), Value::Int(6));
}

#[test]
fn test_artifact_with_defs_and_fns() {
    let bytes = build(
        "(def base 30)\n\
         (def f (fn [x] (+ base x)))\n\
         (f 12)",
    );
    assert_eq!(load_and_run(&bytes), Value::Int(42));
}

#[test]
fn test_artifact_preserves_debug_info() {
    let mut session = Session::new(EvalConfig::default());
    let chunk = session.build_str("(def x\n  1)").unwrap();
    let bytes = write_artifact(&chunk).unwrap();
    let env = default_env();
    let loaded = read_artifact(&bytes, &env).unwrap();
    assert_eq!(loaded.lines, chunk.lines);
    assert_eq!(loaded.cols, chunk.cols);
}

#[test]
fn test_artifact_superinstructions_survive() {
    // fused opcodes and their inline data words must round-trip
    let bytes = build("(loop [x 0] (if (< x 100) (recur (+ x 1)) x))");
    assert_eq!(load_and_run(&bytes), Value::Int(100));
}

#[test]
fn test_artifact_file_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("program.cljc");
    let bytes = build("(reduce + 0 (range 10))");
    std::fs::write(&path, &bytes).unwrap();
    let loaded = std::fs::read(&path).unwrap();
    assert_eq!(load_and_run(&loaded), Value::Int(45));
}

#[test]
fn test_snapshot_restores_user_definitions() {
    // simulate the stdlib flow: evaluate definitions, snapshot the
    // environment, restore into a fresh process
    let mut session = Session::new(EvalConfig::default());
    session
        .eval_str(
            "(def greeting \"hello\")\n\
             (def config {:retries 3})",
        )
        .unwrap();
    let bytes = write_snapshot(session.env()).unwrap();

    let env = default_env();
    clovec::install_reader_builtins(&env);
    load_snapshot(&bytes, &env).unwrap();
    assert_eq!(
        env.resolve("greeting").unwrap().root(),
        Value::Str("hello".into())
    );
    assert_eq!(
        env.resolve("config").unwrap().root(),
        Value::map(vec![(Value::keyword(None, "retries"), Value::Int(3))])
    );
    // builtin roots were preserved through the sentinel
    assert!(matches!(
        env.resolve("+").unwrap().root(),
        Value::Builtin(_)
    ));
}

#[test]
fn test_snapshot_restores_compiled_fns() {
    let mut session = Session::new(EvalConfig::default());
    session.eval_str("(def triple (fn [x] (* 3 x)))").unwrap();
    let bytes = write_snapshot(session.env()).unwrap();

    let env = default_env();
    clovec::install_reader_builtins(&env);
    load_snapshot(&bytes, &env).unwrap();
    let mut vm = Vm::new(env.clone());
    let f = env.resolve("triple").unwrap().root();
    assert_eq!(
        vm.call_value_outer(&f, &[Value::Int(14)]).unwrap(),
        Value::Int(42)
    );
}

#[test]
fn test_corrupt_artifacts_fail_loudly() {
    let env = default_env();
    assert!(read_artifact(b"", &env).is_err());
    assert!(read_artifact(b"XXXX\x01\x00\x00\x00", &env).is_err());
    let mut bytes = build("(+ 1 2)");
    let len = bytes.len();
    bytes.truncate(len - 3);
    assert!(read_artifact(&bytes, &env).is_err());
}
