//! SHA-2 digests, returned as raw bytes.

use ::sha2::{Sha256, Sha512};
use mlua::{Lua, UserData, UserDataMethods, Value};

use super::digest;
use crate::error::ModuleError;
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;

pub const NAME: &str = "pglua/crypto/sha2";

pub fn construct(_loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    Ok(Box::new(Sha2Module))
}

#[derive(Clone, Copy)]
pub struct Sha2Module;

impl CapabilityModule for Sha2Module {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(*self).map(Value::UserData)
    }
}

impl UserData for Sha2Module {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("sum256", |lua, data: mlua::String| digest::<Sha256>(lua, &data));
        methods.add_function("sum512", |lua, data: mlua::String| digest::<Sha512>(lua, &data));
    }
}
