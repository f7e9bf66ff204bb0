//! Clove compiler pipeline
//!
//! Drives source text through the five stages:
//!
//! ```text
//! text → tokens → forms → nodes → bytecode → values
//! ```
//!
//! [`Session`] is the stateful driver (one environment, one VM) behind
//! the CLI's `run`/`eval`/`repl`. [`run_compare`] is the oracle mode: it
//! analyzes each form once, evaluates it on both backends against
//! isolated environments, and reports any divergence in results or
//! namespace effects. This is the principal regression detector for the
//! compiler/VM contract.

pub mod analyzer;
pub mod codegen;
pub mod config;
pub mod error;
pub mod reader;
pub mod tokenizer;

pub use analyzer::Analyzer;
pub use codegen::compile_top;
pub use config::{EvalConfig, ReadLimits, VmLimits};
pub use error::{CloveError, CodegenError, SyntaxError};
pub use reader::{Reader, read_all_forms, read_one_form};

use clove_core::chunk::Chunk;
use clove_core::error::RuntimeError;
use clove_core::node::{Node, NodeKind};
use clove_core::value::{BuiltinFn, NativeFn, Value};
use clove_runtime::{Env, TreeWalker, Vm, default_env};
use std::path::Path;
use std::rc::Rc;
use tracing::debug;

/// A stateful evaluation session: one environment, one VM, one config.
pub struct Session {
    env: Rc<Env>,
    vm: Vm,
    config: EvalConfig,
}

impl Session {
    pub fn new(config: EvalConfig) -> Self {
        let env = default_env();
        install_reader_builtins(&env);
        let vm = Vm::with_limits(env.clone(), config.vm.stack_slots, config.vm.frame_slots);
        Session { env, vm, config }
    }

    pub fn env(&self) -> &Rc<Env> {
        &self.env
    }

    /// Evaluate every form in `source`; the last result is the value of
    /// the whole text.
    pub fn eval_str(&mut self, source: &str) -> Result<Value, CloveError> {
        let forms = read_all_forms(source, &self.config.reader, self.env.current_ns_name())?;
        let mut result = Value::Nil;
        for form in &forms {
            let node = Analyzer::new(Some(self.env.clone())).analyze(form)?;
            let chunk = compile_top(&node)?;
            debug!(
                instrs = chunk.code.len(),
                consts = chunk.consts.len(),
                "compiled form"
            );
            result = self.vm.run_chunk(Rc::new(chunk))?;
        }
        Ok(result)
    }

    pub fn eval_file(&mut self, path: &Path) -> Result<Value, CloveError> {
        let source = std::fs::read_to_string(path)?;
        self.eval_str(&source)
    }

    /// Analyze and compile every form, running each as it compiles (so
    /// macros defined earlier expand later forms), and return one
    /// combined chunk suitable for an AOT artefact.
    pub fn build_str(&mut self, source: &str) -> Result<Chunk, CloveError> {
        let forms = read_all_forms(source, &self.config.reader, self.env.current_ns_name())?;
        let mut nodes = Vec::with_capacity(forms.len());
        for form in &forms {
            let node = Analyzer::new(Some(self.env.clone())).analyze(form)?;
            let chunk = compile_top(&node)?;
            self.vm.run_chunk(Rc::new(chunk))?;
            nodes.push(node);
        }
        let (line, col) = nodes.first().map(|n| (n.line, n.col)).unwrap_or((1, 1));
        let combined = Node::new(NodeKind::Do(nodes), line, col);
        Ok(compile_top(&combined)?)
    }
}

/// Builtins that need the reader live here: the runtime crate cannot
/// depend on it.
pub fn install_reader_builtins(env: &Env) {
    let core = env.find_or_create_namespace(clove_runtime::CORE_NS);
    let entries: &[(&str, NativeFn)] = &[("read-string", bi_read_string)];
    for (name, f) in entries {
        core.intern(Rc::from(*name)).bind_root(Value::Builtin(Rc::new(BuiltinFn {
            name: Rc::from(*name),
            f: *f,
        })));
    }
}

fn bi_read_string(args: &[Value]) -> Result<Value, RuntimeError> {
    let [Value::Str(source)] = args else {
        return Err(clove_core::error::type_error(
            "read-string: expected a string",
        ));
    };
    let ns = clove_runtime::current_env()
        .map(|env| env.current_ns_name())
        .unwrap_or_else(|| Rc::from(clove_runtime::USER_NS));
    let form = reader::read_one_form(source, &ReadLimits::default(), ns)
        .map_err(|e| clove_core::error::value_error(format!("read-string: {}", e)))?;
    Ok(form.map(|f| f.to_value()).unwrap_or(Value::Nil))
}

// ----- compare mode -----

/// One disagreement between the backends.
#[derive(Debug)]
pub struct Divergence {
    pub form: String,
    pub vm_result: String,
    pub tree_result: String,
}

#[derive(Debug, Default)]
pub struct CompareReport {
    pub forms: usize,
    pub results: Vec<Value>,
    pub divergences: Vec<Divergence>,
}

impl CompareReport {
    pub fn agreed(&self) -> bool {
        self.divergences.is_empty()
    }
}

/// Results that cannot be compared structurally across backends (each
/// backend's closures have different representations) compare by
/// callability.
fn outcomes_agree(vm: &Value, tree: &Value) -> bool {
    if vm.is_callable() || tree.is_callable() {
        return vm.is_callable() == tree.is_callable();
    }
    vm == tree
}

fn describe(result: &Result<Value, String>) -> String {
    match result {
        Ok(value) => value.pr_str(),
        Err(message) => format!("error: {}", message),
    }
}

/// Run every form through both backends against a fresh pair of isolated
/// environments and diff results and namespace effects.
pub fn run_compare(source: &str, config: &EvalConfig) -> Result<CompareReport, CloveError> {
    let env_vm = default_env();
    install_reader_builtins(&env_vm);
    let env_tree = default_env();
    install_reader_builtins(&env_tree);
    let mut vm = Vm::with_limits(env_vm.clone(), config.vm.stack_slots, config.vm.frame_slots);
    let walker = TreeWalker::new(env_tree.clone());

    let forms = read_all_forms(source, &config.reader, env_vm.current_ns_name())?;
    let mut report = CompareReport {
        forms: forms.len(),
        ..Default::default()
    };

    for form in &forms {
        // analyzed once, evaluated by both backends
        let node = Analyzer::new(Some(env_vm.clone())).analyze(form)?;
        let chunk = compile_top(&node)?;
        let vm_result: Result<Value, String> = vm
            .run_chunk(Rc::new(chunk))
            .map_err(|e| e.to_string());
        let tree_result: Result<Value, String> =
            walker.eval(&node).map_err(|e| e.to_string());

        let agree = match (&vm_result, &tree_result) {
            (Ok(a), Ok(b)) => outcomes_agree(a, b),
            (Err(a), Err(b)) => a == b,
            _ => false,
        };
        if agree && !namespaces_agree(&env_vm, &env_tree) {
            report.divergences.push(Divergence {
                form: form.pr(),
                vm_result: "namespace state diverged".to_string(),
                tree_result: "namespace state diverged".to_string(),
            });
            continue;
        }
        if !agree {
            debug!(form = %form.pr(), "compare divergence");
            report.divergences.push(Divergence {
                form: form.pr(),
                vm_result: describe(&vm_result),
                tree_result: describe(&tree_result),
            });
            continue;
        }
        if let Ok(value) = vm_result {
            report.results.push(value);
        }
    }
    Ok(report)
}

/// Same namespaces, same var names, equivalent roots.
fn namespaces_agree(a: &Env, b: &Env) -> bool {
    let state_a = a.observable_state();
    let state_b = b.observable_state();
    if state_a.len() != state_b.len() {
        return false;
    }
    state_a.iter().zip(&state_b).all(|(x, y)| {
        x.0 == y.0 && x.1 == y.1 && outcomes_agree(&x.2, &y.2)
    })
}

/// Render an error the way the CLI reports it: kind, message, and the
/// saved call stack.
pub fn render_error(err: &CloveError) -> String {
    let mut out = err.to_string();
    if let CloveError::Runtime(runtime) = err {
        for frame in &runtime.trace {
            out.push_str(&format!(
                "\n  at {}/{} ({}:{})",
                frame.ns, frame.name, frame.line, frame.col
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str) -> Value {
        Session::new(EvalConfig::default()).eval_str(source).unwrap()
    }

    #[test]
    fn test_eval_str_basics() {
        assert_eq!(eval("(+ 1 2 3)"), Value::Int(6));
        assert_eq!(eval("((fn [x y] (+ x y)) 3 4)"), Value::Int(7));
    }

    #[test]
    fn test_session_state_persists() {
        let mut session = Session::new(EvalConfig::default());
        session.eval_str("(def x 20)").unwrap();
        assert_eq!(session.eval_str("(+ x 22)").unwrap(), Value::Int(42));
    }

    #[test]
    fn test_read_string_builtin() {
        assert_eq!(
            eval("(read-string \"(1 2 3)\")"),
            Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_read_string_round_trip_property() {
        // (= (read-string (pr-str v)) v)
        for source in ["42", "nil", "[1 [2 {:a 1}] #{3}]", "\"str\"", ":kw"] {
            let check = format!("(= (read-string (pr-str {})) {})", source, source);
            assert_eq!(eval(&check), Value::Bool(true), "failed for {}", source);
        }
    }

    #[test]
    fn test_compare_agrees_on_core_forms() {
        let report = run_compare(
            "(+ 1 2)\n\
             (let [x 10] ((fn [y] (+ x y)) 5))\n\
             (loop [x 0] (if (< x 5) (recur (+ x 1)) x))\n\
             (def answer 42)\n\
             (try (throw \"boom\") (catch Exception e e))",
            &EvalConfig::default(),
        )
        .unwrap();
        assert!(
            report.agreed(),
            "divergences: {:?}",
            report.divergences
        );
        assert_eq!(report.forms, 5);
    }

    #[test]
    fn test_compare_catches_namespace_effects() {
        let report = run_compare("(def x 1) (def y (+ x 1))", &EvalConfig::default()).unwrap();
        assert!(report.agreed(), "divergences: {:?}", report.divergences);
    }

    #[test]
    fn test_build_produces_combined_chunk() {
        let mut session = Session::new(EvalConfig::default());
        let chunk = session.build_str("(def x 1) (+ x 2)").unwrap();
        let bytes = clove_runtime::write_artifact(&chunk).unwrap();
        // artefact loads and runs in a fresh environment
        let env = default_env();
        let loaded = clove_runtime::read_artifact(&bytes, &env).unwrap();
        let mut vm = Vm::new(env);
        assert_eq!(vm.run_chunk(Rc::new(loaded)).unwrap(), Value::Int(3));
    }
}
