//! Binding between the runtime and the embedded Lua interpreter.
//!
//! Scripts run inside environment tables layered over one another:
//!
//! ```text
//! script env  (top-level assignments = exported bindings)
//!   └─ context layer  (require, print)
//!        └─ predeclared bindings  (shared by a context and its children)
//!             └─ Lua standard globals
//! ```

use mlua::{Lua, LuaSerdeExt, SerializeOptions, Table, Value};

use crate::error::ScriptError;
use crate::transaction::{FieldValue, SqlParam};

/// Control signal raised by a host function once the response is complete.
///
/// It unwinds the running script without being a failure of the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("script exited after producing a response")]
pub struct EarlyExit;

/// How a script stopped, when it did not complete normally.
#[derive(Debug)]
pub(crate) enum Interrupt {
    EarlyExit,
    Failed(ScriptError),
}

/// Wrap a host error so it travels through the interpreter unchanged.
pub(crate) fn raise<E>(err: E) -> mlua::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    mlua::Error::external(err)
}

fn find_external<T: std::error::Error + 'static>(err: &mlua::Error) -> Option<&T> {
    match err {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<T>(),
        mlua::Error::CallbackError { cause, .. } => find_external(cause),
        mlua::Error::WithContext { cause, .. } => find_external(cause),
        _ => None,
    }
}

/// Sort an interpreter error into early-exit, a host failure, or a plain
/// script failure.
pub(crate) fn classify(err: mlua::Error) -> Interrupt {
    if find_external::<EarlyExit>(&err).is_some() {
        return Interrupt::EarlyExit;
    }
    if let Some(script_err) = find_external::<ScriptError>(&err) {
        return Interrupt::Failed(script_err.clone());
    }
    match err {
        mlua::Error::SyntaxError { message, .. } => {
            Interrupt::Failed(ScriptError::Compile(message))
        }
        other => Interrupt::Failed(ScriptError::Runtime(other.to_string())),
    }
}

/// Table whose lookups fall through to `parent`.
pub(crate) fn layered_table(lua: &Lua, parent: Table) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.raw_set("__index", parent)?;
    table.set_metatable(Some(meta));
    Ok(table)
}

/// Lossy UTF-8 view of a Lua byte string.
pub(crate) fn lossy(s: &mlua::String) -> String {
    String::from_utf8_lossy(&s.as_bytes()).into_owned()
}

/// Human-readable rendering of a value, as the script `print` shows it.
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => lossy(s),
        other => format!("{}: {:p}", other.type_name(), other.to_pointer()),
    }
}

/// Convert a script value into JSON.
pub fn to_json(lua: &Lua, value: Value) -> mlua::Result<serde_json::Value> {
    lua.from_value(value)
}

/// Convert JSON into a script value; `null` becomes `nil`.
pub fn from_json(lua: &Lua, value: &serde_json::Value) -> mlua::Result<Value> {
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    lua.to_value_with(value, options)
}

/// Convert a script value into a positional statement parameter.
pub(crate) fn to_sql_param(value: &Value) -> SqlParam {
    match value {
        Value::Nil => SqlParam::Null,
        Value::Boolean(b) => SqlParam::Bool(*b),
        Value::Integer(i) => SqlParam::Int(*i),
        Value::Number(n) => SqlParam::Float(*n),
        Value::String(s) => SqlParam::Text(lossy(s)),
        other => {
            let rendered = display_value(other);
            tracing::warn!(
                value_type = other.type_name(),
                "Falling back to string rendering for statement parameter"
            );
            SqlParam::Text(rendered)
        }
    }
}

pub(crate) fn field_to_lua(lua: &Lua, field: &FieldValue) -> mlua::Result<Value> {
    Ok(match field {
        FieldValue::Null => Value::Nil,
        FieldValue::Bool(b) => Value::Boolean(*b),
        FieldValue::Int(i) => Value::Integer(*i),
        FieldValue::Float(f) => Value::Number(*f),
        FieldValue::Text(s) => Value::String(lua.create_string(s)?),
    })
}

/// `(value, nil)` on success, `(nil, message)` on failure: the convention
/// scripts use to branch on recoverable errors.
pub(crate) fn value_or_message<T, E: std::fmt::Display>(
    result: Result<T, E>,
) -> (Option<T>, Option<String>) {
    match result {
        Ok(value) => (Some(value), None),
        Err(err) => (None, Some(err.to_string())),
    }
}
