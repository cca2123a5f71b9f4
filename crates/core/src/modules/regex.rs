//! Regular expressions.
//!
//! Patterns use the syntax of the `regex` crate. An invalid pattern raises a
//! script error.

use ::regex::Regex;
use mlua::{Lua, UserData, UserDataMethods, Value};

use crate::error::ModuleError;
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;

pub const NAME: &str = "pglua/regex";

pub fn construct(_loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    Ok(Box::new(RegexModule))
}

#[derive(Clone, Copy)]
pub struct RegexModule;

impl CapabilityModule for RegexModule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(*self).map(Value::UserData)
    }
}

fn compile(pattern: &str) -> mlua::Result<Regex> {
    Regex::new(pattern).map_err(mlua::Error::external)
}

impl UserData for RegexModule {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("match", |_, (pattern, s): (String, String)| {
            Ok(compile(&pattern)?.is_match(&s))
        });
        methods.add_function("find", |_, (pattern, s): (String, String)| {
            Ok(compile(&pattern)?.find(&s).map(|m| m.as_str().to_string()))
        });
        methods.add_function("findAll", |_, (pattern, s): (String, String)| {
            let re = compile(&pattern)?;
            Ok(re
                .find_iter(&s)
                .map(|m| m.as_str().to_string())
                .collect::<Vec<_>>())
        });
        methods.add_function(
            "replace",
            |_, (pattern, s, replacement): (String, String, String)| {
                Ok(compile(&pattern)?
                    .replace_all(&s, replacement.as_str())
                    .into_owned())
            },
        );
    }
}
