//! JSON text to and from script values. `null` decodes to `nil`.

use mlua::{Lua, UserData, UserDataMethods, Value};

use crate::engine::{from_json, to_json};
use crate::error::ModuleError;
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;

pub const NAME: &str = "pglua/encoding/json";

pub fn construct(_loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    Ok(Box::new(JsonModule))
}

#[derive(Clone, Copy)]
pub struct JsonModule;

impl CapabilityModule for JsonModule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(*self).map(Value::UserData)
    }
}

fn encode(lua: &Lua, value: Value) -> Result<String, String> {
    let json = to_json(lua, value).map_err(|e| e.to_string())?;
    serde_json::to_string(&json).map_err(|e| e.to_string())
}

impl UserData for JsonModule {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("encode", |lua, value: Value| {
            Ok(match encode(lua, value) {
                Ok(text) => (Some(text), None),
                Err(err) => (None, Some(err)),
            })
        });
        methods.add_function("decode", |lua, text: mlua::String| {
            match serde_json::from_slice::<serde_json::Value>(&text.as_bytes()) {
                Ok(json) => Ok((from_json(lua, &json)?, None)),
                Err(e) => Ok((Value::Nil, Some(e.to_string()))),
            }
        });
    }
}
