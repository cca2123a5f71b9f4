//! Runs the config script that declares routes, globals and the profiler
//! mount.
//!
//! Host functions visible to the config script:
//!
//! | Function                              | Effect                                      |
//! |---------------------------------------|---------------------------------------------|
//! | `getEnv(name, default)`               | `PGLUA_ENV_<name>`, or `default` when unset |
//! | `setGlobal(name, value)`              | predeclare `value` in every routed script   |
//! | `addRoute(methods, path, script)`     | append a route                              |
//! | `enableProfilerRoute(path)`           | mount the diagnostics endpoint at `path`    |

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::Utc;
use mlua::{Lua, Value};
use pglua_core::engine::to_json;
use pglua_core::{ExecutionContext, ModuleLoader, PrintSink, RunOutcome, ScriptError};

use crate::error::ConfigError;
use crate::routes::table::{Route, RouteTable};

/// Prefix added to every name passed to `getEnv`.
pub const ENV_PREFIX: &str = "PGLUA_ENV_";

pub const FILE_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const FILE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Block until `path` exists. Editors that save by rename leave a short
/// window where the file is missing.
pub fn wait_for_file(
    path: &Path,
    interval: Duration,
    timeout: Duration,
) -> Result<(), ConfigError> {
    let started = Instant::now();
    loop {
        match std::fs::metadata(path) {
            Ok(_) => return Ok(()),
            Err(e) if started.elapsed() >= timeout => {
                return Err(ConfigError::Unavailable {
                    path: path.display().to_string(),
                    waited: timeout,
                    reason: e.to_string(),
                })
            }
            Err(_) => std::thread::sleep(interval),
        }
    }
}

/// Wait for the config file, then run it. Blocking.
pub fn load_route_table(path: &Path, print: PrintSink) -> Result<RouteTable, ConfigError> {
    wait_for_file(path, FILE_POLL_INTERVAL, FILE_WAIT_TIMEOUT)?;
    build_route_table(path, print)
}

/// Run the config script at `path` and collect what it declared.
///
/// Route scripts are resolved relative to the directory holding `path`.
pub fn build_route_table(path: &Path, print: PrintSink) -> Result<RouteTable, ConfigError> {
    let root_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let script = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| ConfigError::Unavailable {
            path: path.display().to_string(),
            waited: Duration::ZERO,
            reason: "not a file path".to_string(),
        })?;

    let mut ctx = ExecutionContext::create(root_dir, &script, print)?;
    let loader = ModuleLoader::new_root(&ctx);
    ctx.attach_loader(loader);

    let table = Rc::new(RefCell::new(RouteTable::new(ctx.root_dir())));
    register_host_functions(&ctx, &table).map_err(|e| ScriptError::Runtime(e.to_string()))?;

    if let RunOutcome::Failed(err) = ctx.execute() {
        return Err(ConfigError::Script(err));
    }

    let mut table = table.borrow().clone();
    table.loaded_at = Utc::now();
    tracing::info!(
        config = %path.display(),
        routes = table.routes.len(),
        globals = table.globals.len(),
        "Loaded route table"
    );
    Ok(table)
}

fn register_host_functions(
    ctx: &ExecutionContext,
    table: &Rc<RefCell<RouteTable>>,
) -> mlua::Result<()> {
    let lua = ctx.lua();
    let predeclare = |name: &str, value: mlua::Function| {
        ctx.predeclare(name, value)
            .map_err(|e| mlua::Error::RuntimeError(e.to_string()))
    };

    predeclare("getEnv", lua.create_function(get_env)?)?;

    let globals = Rc::clone(table);
    predeclare(
        "setGlobal",
        lua.create_function(move |lua, (name, value): (String, Value)| {
            let value = to_json(lua, value)?;
            globals.borrow_mut().set_global(&name, value);
            Ok(())
        })?,
    )?;

    let routes = Rc::clone(table);
    predeclare(
        "addRoute",
        lua.create_function(move |_, (methods, path, script): (Value, String, String)| {
            let route = Route::new(&method_list(methods)?, &path, &script)
                .map_err(mlua::Error::external)?;
            routes.borrow_mut().add_route(route);
            Ok(())
        })?,
    )?;

    let profiler = Rc::clone(table);
    predeclare(
        "enableProfilerRoute",
        lua.create_function(move |_, path: String| {
            if !path.starts_with('/') {
                return Err(mlua::Error::RuntimeError(format!(
                    "profiler route {path:?} must start with '/'"
                )));
            }
            profiler.borrow_mut().profiler_path = Some(path);
            Ok(())
        })?,
    )?;

    Ok(())
}

fn get_env(lua: &Lua, (name, default): (String, Value)) -> mlua::Result<Value> {
    match std::env::var(format!("{ENV_PREFIX}{name}")) {
        Ok(value) if !value.is_empty() => lua.create_string(value).map(Value::String),
        _ => Ok(default),
    }
}

/// A single method name, a list of them, or `nil` for every method.
fn method_list(value: Value) -> mlua::Result<Vec<String>> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::String(method) => Ok(vec![method.to_str()?.to_string()]),
        Value::Table(methods) => methods.sequence_values::<String>().collect(),
        other => Err(mlua::Error::RuntimeError(format!(
            "methods must be a list of strings, got {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn waiting_for_a_missing_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.lua");

        let started = Instant::now();
        let err = wait_for_file(&missing, Duration::from_millis(5), Duration::from_millis(30))
            .unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_matches!(err, ConfigError::Unavailable { .. });
    }

    #[test]
    fn existing_file_is_available_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.lua");
        std::fs::write(&path, "").unwrap();
        wait_for_file(&path, Duration::from_secs(1), Duration::ZERO).unwrap();
    }

    #[test]
    fn get_env_reads_prefixed_variables() {
        std::env::set_var("PGLUA_ENV_CONFIG_SCRIPT_TEST_NAME", "from-env");
        std::env::set_var("PGLUA_ENV_CONFIG_SCRIPT_TEST_EMPTY", "");
        let lua = Lua::new();

        let found = get_env(&lua, ("CONFIG_SCRIPT_TEST_NAME".to_string(), Value::Nil)).unwrap();
        assert_eq!(found.as_string_lossy().unwrap(), "from-env");

        let empty = get_env(
            &lua,
            ("CONFIG_SCRIPT_TEST_EMPTY".to_string(), Value::Integer(3)),
        )
        .unwrap();
        assert_eq!(empty, Value::Integer(3));
    }

    #[test]
    fn methods_accept_a_string_a_list_or_nil() {
        let lua = Lua::new();
        let single = Value::String(lua.create_string("GET").unwrap());
        assert_eq!(method_list(single).unwrap(), ["GET"]);

        let list = lua.create_sequence_from(["GET", "POST"]).unwrap();
        assert_eq!(method_list(Value::Table(list)).unwrap(), ["GET", "POST"]);

        assert!(method_list(Value::Nil).unwrap().is_empty());
        assert!(method_list(Value::Boolean(true)).is_err());
    }
}
