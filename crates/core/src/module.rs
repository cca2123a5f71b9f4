//! Capability module protocol and the registry of known modules.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use mlua::{Lua, Value};

use crate::error::ModuleError;
use crate::loader::ModuleLoader;

/// A native library exposed to scripts under a reserved name.
///
/// A module is built at most once per root context, the first time any
/// script in the chain requires it. `destroy` runs when the root context is
/// torn down, in reverse construction order.
pub trait CapabilityModule {
    fn name(&self) -> &'static str;

    /// The value `require` hands back to scripts.
    fn exports(&self, lua: &Lua) -> mlua::Result<Value>;

    fn destroy(&self, _loader: &ModuleLoader) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// Builds a module for the loader that first required it.
pub type ModuleConstructor =
    Arc<dyn Fn(&ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> + Send + Sync>;

/// Maps reserved module names to their constructors.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    constructors: BTreeMap<String, ModuleConstructor>,
}

impl ModuleRegistry {
    /// An empty registry: every `require` resolves to a script file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in capability module.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        crate::modules::register_builtin(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, name: &str, constructor: F) -> &mut Self
    where
        F: Fn(&ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ModuleConstructor> {
        self.constructors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
