//! Execution contexts: one run of one script.

use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use mlua::{IntoLua, Lua, LuaOptions, MultiValue, StdLib, Table};

use crate::engine::{classify, display_value, layered_table, raise, Interrupt};
use crate::error::ScriptError;
use crate::loader::ModuleLoader;
use crate::module::ModuleRegistry;

/// Where script `print` output goes.
#[derive(Clone)]
pub struct PrintSink(Arc<dyn Fn(&str, &str) + Send + Sync>);

impl PrintSink {
    pub fn new(sink: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(sink))
    }

    /// Forward every line to the `script` tracing target.
    pub fn log() -> Self {
        Self::new(|context, line| tracing::info!(target: "script", context, "{line}"))
    }

    /// Discard output.
    pub fn null() -> Self {
        Self::new(|_, _| {})
    }

    pub fn emit(&self, context: &str, line: &str) {
        (self.0)(context, line)
    }
}

impl Default for PrintSink {
    fn default() -> Self {
        Self::log()
    }
}

impl fmt::Debug for PrintSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrintSink")
    }
}

/// How a script run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The script ran to the end; holds its exported bindings.
    Completed(Table),
    /// A host function finished the response and stopped the script.
    EarlyExit,
    Failed(ScriptError),
}

/// Pieces shared by a root context and every context derived from it.
pub(crate) struct ContextShared {
    pub(crate) root_dir: PathBuf,
    pub(crate) lua: Lua,
    /// Predeclared bindings, visible to every script in the chain.
    pub(crate) predeclared: Table,
    pub(crate) print: PrintSink,
    pub(crate) registry: Arc<ModuleRegistry>,
    /// Loaders of nested scripts. Functions exported by a sub-script may
    /// call `require` after the sub-script has finished, so its loader lives
    /// until the root context is torn down.
    pub(crate) children: RefCell<Vec<Rc<ModuleLoader>>>,
}

pub struct ExecutionContext {
    name: String,
    script: String,
    shared: Rc<ContextShared>,
    loader: Option<Rc<ModuleLoader>>,
}

impl ExecutionContext {
    /// Context for `script` under `root_dir` with the built-in modules.
    pub fn create(
        root_dir: impl AsRef<Path>,
        script: &str,
        print: PrintSink,
    ) -> Result<Self, ScriptError> {
        Self::with_registry(root_dir, script, print, Arc::new(ModuleRegistry::builtin()))
    }

    pub fn with_registry(
        root_dir: impl AsRef<Path>,
        script: &str,
        print: PrintSink,
        registry: Arc<ModuleRegistry>,
    ) -> Result<Self, ScriptError> {
        let root_dir = absolute(root_dir.as_ref());
        let lua = sandboxed_lua().map_err(|e| ScriptError::Runtime(e.to_string()))?;
        let predeclared = layered_table(&lua, lua.globals())
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;

        let shared = Rc::new(ContextShared {
            root_dir,
            lua,
            predeclared,
            print,
            registry,
            children: RefCell::new(Vec::new()),
        });
        Ok(Self {
            name: display_name(&shared.root_dir, script),
            script: script.to_string(),
            shared,
            loader: None,
        })
    }

    /// Child context running inside an existing chain.
    pub(crate) fn for_loader(
        shared: &Rc<ContextShared>,
        script: &str,
        loader: ModuleLoader,
    ) -> Self {
        let loader = Rc::new(loader);
        shared.children.borrow_mut().push(Rc::clone(&loader));
        Self {
            name: display_name(&shared.root_dir, script),
            script: script.to_string(),
            shared: Rc::clone(shared),
            loader: Some(loader),
        }
    }

    pub(crate) fn shared(&self) -> Rc<ContextShared> {
        Rc::clone(&self.shared)
    }

    /// Script path relative to the working directory.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Script path relative to the root directory.
    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn root_dir(&self) -> &Path {
        &self.shared.root_dir
    }

    pub fn lua(&self) -> &Lua {
        &self.shared.lua
    }

    pub fn loader(&self) -> Option<&ModuleLoader> {
        self.loader.as_deref()
    }

    /// Add or replace a binding visible to the script and everything it
    /// loads.
    pub fn predeclare(&self, name: &str, value: impl IntoLua) -> Result<(), ScriptError> {
        self.shared
            .predeclared
            .raw_set(name, value)
            .map_err(|e| ScriptError::Runtime(e.to_string()))
    }

    pub fn attach_loader(&mut self, loader: ModuleLoader) {
        self.loader = Some(Rc::new(loader));
    }

    /// Context for a nested script sharing this context's bindings, print
    /// sink and module state.
    pub fn derive_child(&self, script: &str) -> Result<ExecutionContext, ScriptError> {
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| ScriptError::NoLoader(self.name.clone()))?;
        Ok(Self::for_loader(&self.shared, script, loader.new_child(script)))
    }

    /// Execute the script.
    pub fn run(&self) -> RunOutcome {
        let Some(loader) = &self.loader else {
            return RunOutcome::Failed(ScriptError::NoLoader(self.name.clone()));
        };

        let path = self.shared.root_dir.join(&self.script);
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) => {
                return RunOutcome::Failed(ScriptError::Io {
                    path: self.name.clone(),
                    message: e.to_string(),
                })
            }
        };

        match self.exec_source(&source, loader) {
            Ok(exports) => RunOutcome::Completed(exports),
            Err(err) => match classify(err) {
                Interrupt::EarlyExit => RunOutcome::EarlyExit,
                Interrupt::Failed(err) => RunOutcome::Failed(err),
            },
        }
    }

    /// Run the script and then tear down the modules it constructed.
    pub fn execute(self) -> RunOutcome {
        let outcome = self.run();
        self.teardown();
        outcome
    }

    /// Destroy the modules of this chain and release the loaders of nested
    /// scripts. Only a root context owns them; on a child this does nothing.
    pub fn teardown(&self) {
        if let Some(loader) = self.loader.as_deref().filter(|l| l.is_root()) {
            loader.destroy();
            self.shared.children.borrow_mut().clear();
        }
    }

    fn exec_source(&self, source: &str, loader: &Rc<ModuleLoader>) -> mlua::Result<Table> {
        let lua = &self.shared.lua;

        let layer = layered_table(lua, self.shared.predeclared.clone())?;
        layer.raw_set("require", self.require_function(loader)?)?;
        layer.raw_set("print", self.print_function()?)?;
        let env = layered_table(lua, layer)?;

        lua.load(source)
            .set_name(format!("@{}", self.name))
            .set_environment(env.clone())
            .exec()?;
        Ok(env)
    }

    fn require_function(&self, loader: &Rc<ModuleLoader>) -> mlua::Result<mlua::Function> {
        let loader: Weak<ModuleLoader> = Rc::downgrade(loader);
        let name = self.name.clone();
        self.shared.lua.create_function(move |_, module: String| {
            let loader = loader
                .upgrade()
                .ok_or_else(|| raise(ScriptError::LoaderGone(name.clone())))?;
            loader.resolve(&module)
        })
    }

    fn print_function(&self) -> mlua::Result<mlua::Function> {
        let sink = self.shared.print.clone();
        let name = self.name.clone();
        self.shared.lua.create_function(move |_, args: MultiValue| {
            let line = args
                .iter()
                .map(display_value)
                .collect::<Vec<_>>()
                .join("\t");
            sink.emit(&name, &line);
            Ok(())
        })
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // Child loaders point back at the shared state.
        if self.loader.as_deref().is_some_and(ModuleLoader::is_root) {
            self.shared.children.borrow_mut().clear();
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.name)
            .field("script", &self.script)
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

/// Interpreter without ambient filesystem or process access. `os` keeps
/// only its clock functions.
fn sandboxed_lua() -> mlua::Result<Lua> {
    let libs = StdLib::COROUTINE
        | StdLib::TABLE
        | StdLib::STRING
        | StdLib::UTF8
        | StdLib::MATH
        | StdLib::OS;
    let lua = Lua::new_with(libs, LuaOptions::default())?;
    let globals = lua.globals();

    let os: Table = globals.get("os")?;
    let clock = lua.create_table()?;
    for name in ["time", "clock", "date", "difftime"] {
        clock.raw_set(name, os.raw_get::<mlua::Value>(name)?)?;
    }
    globals.raw_set("os", clock)?;
    for name in ["dofile", "loadfile", "load"] {
        globals.raw_set(name, mlua::Nil)?;
    }
    Ok(lua)
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Path of `script` relative to the working directory, falling back to the
/// absolute path when it lies elsewhere.
fn display_name(root_dir: &Path, script: &str) -> String {
    let full = root_dir.join(script);
    std::env::current_dir()
        .ok()
        .and_then(|cwd| full.strip_prefix(cwd).ok().map(Path::to_path_buf))
        .unwrap_or(full)
        .display()
        .to_string()
}
