//! Module loader: resolves `require` names to capability modules or nested
//! scripts and carries the state shared by a root context and its children.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use mlua::Value;

use crate::context::{ContextShared, ExecutionContext, RunOutcome};
use crate::engine::{raise, EarlyExit};
use crate::error::{ScriptError, StateError};
use crate::module::CapabilityModule;
use crate::state::{StateKey, StateStore};

struct CachedModule {
    name: String,
    module: Rc<dyn CapabilityModule>,
    exports: Value,
}

/// Constructed modules of one loader chain, in construction order.
#[derive(Default)]
pub(crate) struct ModuleCache {
    entries: RefCell<Vec<CachedModule>>,
}

impl ModuleCache {
    fn exports(&self, name: &str) -> Option<Value> {
        self.entries
            .borrow()
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.exports.clone())
    }

    fn insert(&self, entry: CachedModule) {
        self.entries.borrow_mut().push(entry);
    }

    fn drain_reversed(&self) -> Vec<CachedModule> {
        let mut entries = self.entries.take();
        entries.reverse();
        entries
    }
}

pub struct ModuleLoader {
    shared: Rc<ContextShared>,
    /// Name of the root context; every loader in the chain reports it.
    context_name: String,
    lineage: Vec<String>,
    state: Rc<StateStore>,
    modules: Rc<ModuleCache>,
}

impl ModuleLoader {
    /// Loader for a context that is the entry point of its chain.
    pub fn new_root(context: &ExecutionContext) -> Self {
        Self {
            shared: context.shared(),
            context_name: context.name().to_string(),
            lineage: vec![context.script().to_string()],
            state: Rc::new(StateStore::new()),
            modules: Rc::new(ModuleCache::default()),
        }
    }

    /// Loader for a sub-script. The state store and module cache are shared
    /// with `self`; the lineage is extended on a copy.
    pub fn new_child(&self, name: &str) -> Self {
        let mut lineage = self.lineage.clone();
        lineage.push(name.to_string());
        Self {
            shared: Rc::clone(&self.shared),
            context_name: self.context_name.clone(),
            lineage,
            state: Rc::clone(&self.state),
            modules: Rc::clone(&self.modules),
        }
    }

    pub fn context_name(&self) -> &str {
        &self.context_name
    }

    pub fn lineage(&self) -> &[String] {
        &self.lineage
    }

    /// Zero for the root loader.
    pub fn depth(&self) -> usize {
        self.lineage.len() - 1
    }

    pub fn is_root(&self) -> bool {
        self.depth() == 0
    }

    pub fn set_state<T: ?Sized + 'static>(
        &self,
        key: &StateKey<T>,
        value: Arc<T>,
    ) -> Result<(), StateError> {
        self.state.set_at(self.depth(), key, value)
    }

    pub fn get_state<T: ?Sized + 'static>(&self, key: &StateKey<T>) -> Result<Arc<T>, StateError> {
        self.state.get(key)
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.modules.exports(name).is_some()
    }

    /// Resolve a `require` name to the value handed back to the script.
    pub fn resolve(&self, name: &str) -> mlua::Result<Value> {
        if let Some(constructor) = self.shared.registry.get(name) {
            if let Some(exports) = self.modules.exports(name) {
                return Ok(exports);
            }

            let module = constructor(self).map_err(|e| {
                tracing::error!(
                    context = %self.context_name,
                    module = name,
                    error = %e,
                    "Failed to construct capability module"
                );
                raise(ScriptError::ModuleConstruction {
                    module: name.to_string(),
                    reason: e.to_string(),
                })
            })?;
            let module: Rc<dyn CapabilityModule> = Rc::from(module);
            let exports = match module.exports(&self.shared.lua) {
                Ok(exports) => exports,
                Err(e) => {
                    // Already constructed, so it still needs its teardown.
                    self.modules.insert(CachedModule {
                        name: name.to_string(),
                        module,
                        exports: Value::Nil,
                    });
                    return Err(e);
                }
            };

            tracing::debug!(
                context = %self.context_name,
                module = name,
                "Constructed capability module"
            );
            self.modules.insert(CachedModule {
                name: name.to_string(),
                module,
                exports: exports.clone(),
            });
            return Ok(exports);
        }

        if self.lineage.iter().any(|loading| loading == name) {
            return Err(raise(ScriptError::RecursiveLoad(name.to_string())));
        }

        let child = ExecutionContext::for_loader(&self.shared, name, self.new_child(name));
        match child.run() {
            RunOutcome::Completed(exports) => Ok(Value::Table(exports)),
            RunOutcome::EarlyExit => Err(raise(EarlyExit)),
            RunOutcome::Failed(err) => Err(raise(err)),
        }
    }

    /// Tear down every module constructed through this chain's cache.
    ///
    /// Individual failures are logged and do not stop the remaining
    /// teardowns. A second call finds nothing left to destroy.
    pub fn destroy(&self) {
        for entry in self.modules.drain_reversed() {
            if let Err(e) = entry.module.destroy(self) {
                tracing::error!(
                    context = %self.context_name,
                    module = %entry.name,
                    error = %e,
                    "Failed to destroy capability module"
                );
            }
        }
    }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("context_name", &self.context_name)
            .field("lineage", &self.lineage)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use mlua::Lua;

    use super::*;
    use crate::error::ModuleError;
    use crate::module::ModuleRegistry;
    use crate::test_helpers::{context_with, write_script};

    struct Probe {
        name: &'static str,
        destroyed: Arc<Mutex<Vec<&'static str>>>,
    }

    impl CapabilityModule for Probe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
            let table = lua.create_table()?;
            table.set("name", self.name)?;
            Ok(Value::Table(table))
        }

        fn destroy(&self, _loader: &ModuleLoader) -> Result<(), ModuleError> {
            self.destroyed.lock().unwrap().push(self.name);
            if self.name == "test/failing-destroy" {
                return Err(ModuleError::Other("boom".to_string()));
            }
            Ok(())
        }
    }

    fn probe_registry(
        constructed: Arc<AtomicUsize>,
        destroyed: Arc<Mutex<Vec<&'static str>>>,
    ) -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        for name in ["test/a", "test/b", "test/failing-destroy"] {
            let constructed = Arc::clone(&constructed);
            let destroyed = Arc::clone(&destroyed);
            registry.register(name, move |_| {
                constructed.fetch_add(1, Ordering::SeqCst);
                let module: Box<dyn CapabilityModule> = Box::new(Probe {
                    name,
                    destroyed: Arc::clone(&destroyed),
                });
                Ok(module)
            });
        }
        registry.register("test/unavailable", |_| {
            Err(ModuleError::Other("dependency missing".to_string()))
        });
        registry
    }

    #[test]
    fn child_lineage_extends_a_copy() {
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir, "main.lua", "");
        let ctx = context_with(&dir, "main.lua", ModuleRegistry::new());
        let root = ModuleLoader::new_root(&ctx);

        let child = root.new_child("lib/a.lua");
        let grandchild = child.new_child("lib/b.lua");

        assert_eq!(root.lineage(), ["main.lua"]);
        assert_eq!(child.lineage(), ["main.lua", "lib/a.lua"]);
        assert_eq!(grandchild.lineage(), ["main.lua", "lib/a.lua", "lib/b.lua"]);
        assert_eq!(grandchild.depth(), 2);
        assert!(Rc::ptr_eq(&root.state, &grandchild.state));
        assert!(Rc::ptr_eq(&root.modules, &grandchild.modules));
    }

    #[test]
    fn second_resolution_uses_the_cached_instance() {
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir, "main.lua", "");
        let constructed = Arc::new(AtomicUsize::new(0));
        let registry = probe_registry(Arc::clone(&constructed), Arc::default());
        let ctx = context_with(&dir, "main.lua", registry);
        let root = ModuleLoader::new_root(&ctx);
        let child = root.new_child("lib.lua");

        let first = root.resolve("test/a").unwrap();
        let second = child.resolve("test/a").unwrap();

        assert_eq!(constructed.load(Ordering::SeqCst), 1);
        assert_eq!(first.to_pointer(), second.to_pointer());
        assert!(root.is_loaded("test/a"));
    }

    #[test]
    fn failed_construction_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir, "main.lua", "");
        let registry = probe_registry(Arc::default(), Arc::default());
        let ctx = context_with(&dir, "main.lua", registry);
        let root = ModuleLoader::new_root(&ctx);

        let err = root.resolve("test/unavailable").unwrap_err();
        assert!(err.to_string().contains("dependency missing"));
        assert!(!root.is_loaded("test/unavailable"));
    }

    #[test]
    fn name_already_in_lineage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir, "main.lua", "");
        write_script(&dir, "lib.lua", "error('must not run')");
        let ctx = context_with(&dir, "main.lua", ModuleRegistry::new());
        let child = ModuleLoader::new_root(&ctx).new_child("lib.lua");

        let err = child.resolve("lib.lua").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("recursive loading of module lib.lua"), "{msg}");
        assert!(!msg.contains("must not run"));
    }

    #[test]
    fn destroy_runs_in_reverse_order_and_survives_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir, "main.lua", "");
        let destroyed = Arc::new(Mutex::new(Vec::new()));
        let registry = probe_registry(Arc::default(), Arc::clone(&destroyed));
        let ctx = context_with(&dir, "main.lua", registry);
        let root = ModuleLoader::new_root(&ctx);

        root.resolve("test/a").unwrap();
        root.resolve("test/failing-destroy").unwrap();
        root.resolve("test/b").unwrap();
        root.destroy();
        root.destroy();

        assert_eq!(
            *destroyed.lock().unwrap(),
            vec!["test/b", "test/failing-destroy", "test/a"]
        );
    }

    #[test]
    fn child_cannot_replace_root_state() {
        const LIMIT: StateKey<AtomicUsize> = StateKey::new("limit");

        let dir = tempfile::tempdir().unwrap();
        write_script(&dir, "main.lua", "");
        let ctx = context_with(&dir, "main.lua", ModuleRegistry::new());
        let root = ModuleLoader::new_root(&ctx);
        root.set_state(&LIMIT, Arc::new(AtomicUsize::new(1))).unwrap();

        let child = root.new_child("lib.lua");
        assert_matches!(
            child.set_state(&LIMIT, Arc::new(AtomicUsize::new(2))),
            Err(StateError::NotOwner(_))
        );
        assert_eq!(child.get_state(&LIMIT).unwrap().load(Ordering::SeqCst), 1);
    }
}
