//! Lower-case hexadecimal.

use mlua::{Lua, UserData, UserDataMethods, Value};

use crate::engine::value_or_message;
use crate::error::ModuleError;
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;

pub const NAME: &str = "pglua/encoding/hex";

pub fn construct(_loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    Ok(Box::new(HexModule))
}

#[derive(Clone, Copy)]
pub struct HexModule;

impl CapabilityModule for HexModule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(*self).map(Value::UserData)
    }
}

impl UserData for HexModule {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("encode", |_, data: mlua::String| {
            Ok(::hex::encode(&*data.as_bytes()))
        });
        methods.add_function("decode", |lua, text: mlua::String| {
            let (bytes, err) = value_or_message(::hex::decode(&*text.as_bytes()));
            Ok((bytes.map(|b| lua.create_string(b)).transpose()?, err))
        });
    }
}
