//! Environment, namespaces, and var interning
//!
//! `Env` is the lifecycled container of namespaces shared by both
//! backends. Each namespace owns its interned vars; refers are borrowed
//! references to vars owned elsewhere; aliases are short names consulted
//! during qualified-symbol resolution.

use crate::gc::GcStrategy;
use clove_core::value::{Value, Var};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

pub const CORE_NS: &str = "clojure.core";
pub const USER_NS: &str = "user";

/// An owning container for vars plus refer and alias tables.
#[derive(Debug)]
pub struct Namespace {
    pub name: Rc<str>,
    vars: RefCell<HashMap<Rc<str>, Rc<Var>>>,
    refers: RefCell<HashMap<Rc<str>, Rc<Var>>>,
    aliases: RefCell<HashMap<Rc<str>, Rc<str>>>,
}

impl Namespace {
    fn new(name: Rc<str>) -> Self {
        Namespace {
            name,
            vars: RefCell::new(HashMap::new()),
            refers: RefCell::new(HashMap::new()),
            aliases: RefCell::new(HashMap::new()),
        }
    }

    /// Return the var interned under `name`, creating it on first use.
    /// Subsequent interns return the same var.
    pub fn intern(&self, name: Rc<str>) -> Rc<Var> {
        let mut vars = self.vars.borrow_mut();
        if let Some(var) = vars.get(&name) {
            return var.clone();
        }
        let var = Rc::new(Var::new(self.name.clone(), name.clone()));
        vars.insert(name, var.clone());
        var
    }

    /// Own mappings first, then refers.
    pub fn resolve(&self, name: &str) -> Option<Rc<Var>> {
        if let Some(var) = self.vars.borrow().get(name) {
            return Some(var.clone());
        }
        self.refers.borrow().get(name).cloned()
    }

    pub fn owns(&self, name: &str) -> bool {
        self.vars.borrow().contains_key(name)
    }

    /// Make a foreign var resolvable by unqualified name here.
    pub fn refer(&self, name: Rc<str>, var: Rc<Var>) {
        self.refers.borrow_mut().insert(name, var);
    }

    pub fn set_alias(&self, alias: Rc<str>, target: Rc<str>) {
        self.aliases.borrow_mut().insert(alias, target);
    }

    pub fn alias_target(&self, alias: &str) -> Option<Rc<str>> {
        self.aliases.borrow().get(alias).cloned()
    }

    /// Snapshot of the owned vars, sorted by name for deterministic
    /// serialization.
    pub fn owned_vars(&self) -> Vec<Rc<Var>> {
        let mut vars: Vec<Rc<Var>> = self.vars.borrow().values().cloned().collect();
        vars.sort_by(|a, b| a.name.cmp(&b.name));
        vars
    }

    pub fn refer_entries(&self) -> Vec<(Rc<str>, Rc<Var>)> {
        let mut entries: Vec<(Rc<str>, Rc<Var>)> = self
            .refers
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn alias_entries(&self) -> Vec<(Rc<str>, Rc<str>)> {
        let mut entries: Vec<(Rc<str>, Rc<str>)> = self
            .aliases
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// The namespace registry plus the current-namespace cursor and the GC
/// strategy handle. Outlives any single evaluation.
pub struct Env {
    namespaces: RefCell<HashMap<Rc<str>, Rc<Namespace>>>,
    current: RefCell<Rc<str>>,
    pub gc: Rc<dyn GcStrategy>,
}

impl Env {
    /// Empty registry with `clojure.core` and `user` pre-created;
    /// `user` is current.
    pub fn new(gc: Rc<dyn GcStrategy>) -> Rc<Env> {
        let env = Rc::new(Env {
            namespaces: RefCell::new(HashMap::new()),
            current: RefCell::new(Rc::from(USER_NS)),
            gc,
        });
        env.find_or_create_namespace(CORE_NS);
        env.find_or_create_namespace(USER_NS);
        env
    }

    pub fn find_namespace(&self, name: &str) -> Option<Rc<Namespace>> {
        self.namespaces.borrow().get(name).cloned()
    }

    pub fn find_or_create_namespace(&self, name: &str) -> Rc<Namespace> {
        if let Some(ns) = self.find_namespace(name) {
            return ns;
        }
        debug!(ns = name, "creating namespace");
        let name: Rc<str> = Rc::from(name);
        let ns = Rc::new(Namespace::new(name.clone()));
        self.namespaces.borrow_mut().insert(name, ns.clone());
        ns
    }

    pub fn current_ns_name(&self) -> Rc<str> {
        self.current.borrow().clone()
    }

    pub fn current_ns(&self) -> Rc<Namespace> {
        let name = self.current_ns_name();
        self.find_or_create_namespace(&name)
    }

    pub fn set_current(&self, name: Rc<str>) {
        self.find_or_create_namespace(&name);
        *self.current.borrow_mut() = name;
    }

    /// Intern `name` into namespace `ns`, creating both as needed.
    pub fn intern(&self, ns: &str, name: Rc<str>) -> Rc<Var> {
        self.find_or_create_namespace(ns).intern(name)
    }

    /// Unqualified resolution: current namespace (own mappings, then
    /// refers), then `clojure.core`.
    pub fn resolve(&self, name: &str) -> Option<Rc<Var>> {
        if let Some(var) = self.current_ns().resolve(name) {
            return Some(var);
        }
        self.find_namespace(CORE_NS)?.resolve(name)
    }

    /// Qualified resolution: a namespace by that exact name, else an
    /// alias registered in the current namespace.
    pub fn resolve_qualified(&self, ns_or_alias: &str, name: &str) -> Option<Rc<Var>> {
        if let Some(ns) = self.find_namespace(ns_or_alias) {
            return ns.resolve(name);
        }
        let target = self.current_ns().alias_target(ns_or_alias)?;
        self.find_namespace(&target)?.resolve(name)
    }

    /// Namespaces sorted by name, `clojure.core` first, for deterministic
    /// snapshots.
    pub fn namespace_list(&self) -> Vec<Rc<Namespace>> {
        let mut namespaces: Vec<Rc<Namespace>> =
            self.namespaces.borrow().values().cloned().collect();
        namespaces.sort_by(|a, b| {
            let rank = |n: &str| if n == CORE_NS { 0 } else { 1 };
            rank(&a.name).cmp(&rank(&b.name)).then(a.name.cmp(&b.name))
        });
        namespaces
    }

    /// Structural snapshot of namespace state for the compare oracle:
    /// (ns name, var name, root value) triples plus the current cursor.
    pub fn observable_state(&self) -> Vec<(Rc<str>, Rc<str>, Value)> {
        let mut state = Vec::new();
        for ns in self.namespace_list() {
            for var in ns.owned_vars() {
                state.push((ns.name.clone(), var.name.clone(), var.root()));
            }
        }
        state
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Env(current={}, namespaces={})",
            self.current.borrow(),
            self.namespaces.borrow().len()
        )
    }
}

thread_local! {
    static CURRENT_ENV: RefCell<Option<Rc<Env>>> = const { RefCell::new(None) };
}

/// Scope guard installing `env` as the per-thread environment so builtins
/// (and cross-backend callbacks) can find it. Restores the previous value
/// on drop, including on error paths.
pub struct EnvGuard {
    previous: Option<Rc<Env>>,
}

impl EnvGuard {
    pub fn install(env: Rc<Env>) -> EnvGuard {
        let previous = CURRENT_ENV.with(|slot| slot.borrow_mut().replace(env));
        EnvGuard { previous }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_ENV.with(|slot| *slot.borrow_mut() = previous);
    }
}

pub fn current_env() -> Option<Rc<Env>> {
    CURRENT_ENV.with(|slot| slot.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::ArenaGc;

    fn test_env() -> Rc<Env> {
        Env::new(Rc::new(ArenaGc::new()))
    }

    #[test]
    fn test_core_and_user_precreated() {
        let env = test_env();
        assert!(env.find_namespace(CORE_NS).is_some());
        assert!(env.find_namespace(USER_NS).is_some());
        assert_eq!(&*env.current_ns_name(), USER_NS);
    }

    #[test]
    fn test_intern_is_stable() {
        let env = test_env();
        let a = env.intern(USER_NS, "x".into());
        let b = env.intern(USER_NS, "x".into());
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_resolve_falls_back_to_core() {
        let env = test_env();
        let var = env.intern(CORE_NS, "inc".into());
        var.bind_root(Value::Int(42));
        let resolved = env.resolve("inc").unwrap();
        assert!(Rc::ptr_eq(&var, &resolved));
    }

    #[test]
    fn test_own_binding_shadows_core() {
        let env = test_env();
        env.intern(CORE_NS, "x".into()).bind_root(Value::Int(1));
        env.intern(USER_NS, "x".into()).bind_root(Value::Int(2));
        assert_eq!(env.resolve("x").unwrap().root(), Value::Int(2));
    }

    #[test]
    fn test_refer_resolution() {
        let env = test_env();
        let source = env.intern("lib.a", "helper".into());
        source.bind_root(Value::Int(7));
        env.find_or_create_namespace(USER_NS)
            .refer("helper".into(), source.clone());
        let resolved = env.resolve("helper").unwrap();
        assert!(Rc::ptr_eq(&source, &resolved));
        // refers are borrowed, not owned
        assert!(!env.find_or_create_namespace(USER_NS).owns("helper"));
    }

    #[test]
    fn test_alias_resolution() {
        let env = test_env();
        let var = env.intern("lib.deep.ns", "f".into());
        env.find_or_create_namespace(USER_NS)
            .set_alias("d".into(), "lib.deep.ns".into());
        let resolved = env.resolve_qualified("d", "f").unwrap();
        assert!(Rc::ptr_eq(&var, &resolved));
        // direct namespace name still wins
        assert!(env.resolve_qualified("lib.deep.ns", "f").is_some());
    }

    #[test]
    fn test_env_guard_restores() {
        let env = test_env();
        assert!(current_env().is_none());
        {
            let _guard = EnvGuard::install(env.clone());
            assert!(current_env().is_some());
        }
        assert!(current_env().is_none());
    }
}
