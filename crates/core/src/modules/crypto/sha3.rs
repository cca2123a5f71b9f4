//! SHA-3 digests, returned as raw bytes.

use ::sha3::{Sha3_256, Sha3_384, Sha3_512};
use mlua::{Lua, UserData, UserDataMethods, Value};

use super::digest;
use crate::error::ModuleError;
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;

pub const NAME: &str = "pglua/crypto/sha3";

pub fn construct(_loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    Ok(Box::new(Sha3Module))
}

#[derive(Clone, Copy)]
pub struct Sha3Module;

impl CapabilityModule for Sha3Module {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(*self).map(Value::UserData)
    }
}

impl UserData for Sha3Module {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("sum256", |lua, data: mlua::String| digest::<Sha3_256>(lua, &data));
        methods.add_function("sum384", |lua, data: mlua::String| digest::<Sha3_384>(lua, &data));
        methods.add_function("sum512", |lua, data: mlua::String| digest::<Sha3_512>(lua, &data));
    }
}
