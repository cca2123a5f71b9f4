//! Cryptographically secure random values.

use mlua::{Lua, UserData, UserDataMethods, Value};
use rand::{Rng, RngCore};

use crate::error::ModuleError;
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;

pub const NAME: &str = "pglua/crypto/random";

/// Largest buffer `bytes` will generate in one call.
pub const MAX_BYTES: usize = 1 << 20;

pub fn construct(_loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    Ok(Box::new(RandomModule))
}

#[derive(Clone, Copy)]
pub struct RandomModule;

impl CapabilityModule for RandomModule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(*self).map(Value::UserData)
    }
}

impl UserData for RandomModule {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("bytes", |lua, length: i64| {
            let length = usize::try_from(length)
                .ok()
                .filter(|&n| n <= MAX_BYTES)
                .ok_or_else(|| {
                    mlua::Error::RuntimeError(format!(
                        "invalid length {length}, expected 0 to {MAX_BYTES}"
                    ))
                })?;
            let mut buf = vec![0u8; length];
            rand::rng().fill_bytes(&mut buf);
            lua.create_string(buf)
        });
        methods.add_function("int", |_, (min, max): (i64, i64)| {
            if min > max {
                return Err(mlua::Error::RuntimeError(
                    "min must be less than max".to_string(),
                ));
            }
            Ok(rand::rng().random_range(min..=max))
        });
    }
}
