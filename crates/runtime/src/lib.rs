//! Clove runtime
//!
//! Everything that executes: the environment and namespace registry, the
//! bytecode VM, the GC strategy, the `clojure.core` builtin library, the
//! tree-walk oracle, and the `CLJC` persistence format.
//!
//! A fresh runtime is three calls:
//!
//! ```rust,ignore
//! let env = Env::new(Rc::new(ArenaGc::new()));
//! builtins::install(&env);
//! let mut vm = Vm::new(env);
//! let result = vm.run_chunk(chunk)?;
//! ```

pub mod builtins;
pub mod env;
pub mod exception;
pub mod gc;
pub mod serialize;
pub mod treewalk;
pub mod vm;

pub use env::{CORE_NS, Env, EnvGuard, Namespace, USER_NS, current_env};
pub use exception::{exception_value, matches_class, park_exception, take_exception};
pub use gc::{ArenaGc, GcStats, GcStrategy, RootWalker};
pub use serialize::{SerializeError, load_snapshot, read_artifact, write_artifact, write_snapshot};
pub use treewalk::{TreeWalker, apply_tree_fn};
pub use vm::{
    FRAME_CAPACITY, STACK_CAPACITY, Vm, call_function, deep_realize, realize_lazy,
    values_equal, vm_pointer_clear, with_current_vm,
};

use std::rc::Rc;

/// A ready-to-use environment: arena GC plus `clojure.core` builtins.
pub fn default_env() -> Rc<Env> {
    let env = Env::new(Rc::new(ArenaGc::new()));
    builtins::install(&env);
    env
}
