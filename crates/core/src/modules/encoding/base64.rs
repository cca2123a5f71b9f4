//! Standard base64 with padding.

use ::base64::engine::general_purpose::STANDARD;
use ::base64::Engine;
use mlua::{Lua, UserData, UserDataMethods, Value};

use crate::engine::value_or_message;
use crate::error::ModuleError;
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;

pub const NAME: &str = "pglua/encoding/base64";

pub fn construct(_loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    Ok(Box::new(Base64Module))
}

#[derive(Clone, Copy)]
pub struct Base64Module;

impl CapabilityModule for Base64Module {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(*self).map(Value::UserData)
    }
}

impl UserData for Base64Module {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("encode", |_, data: mlua::String| {
            Ok(STANDARD.encode(&*data.as_bytes()))
        });
        methods.add_function("decode", |lua, text: mlua::String| {
            let (bytes, err) = value_or_message(STANDARD.decode(&*text.as_bytes()));
            Ok((bytes.map(|b| lua.create_string(b)).transpose()?, err))
        });
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::context::RunOutcome;
    use crate::test_helpers::{root_context, write_script};

    #[test]
    fn encode_decode_and_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir,
            "main.lua",
            r#"
                local b64 = require("pglua/encoding/base64")
                encoded = b64.encode("hello?")
                decoded = b64.decode("aGk=")
                local value, err = b64.decode("***")
                rejected = value == nil and err ~= nil
            "#,
        );
        let ctx = root_context(&dir, "main.lua");

        let exports = assert_matches!(ctx.run(), RunOutcome::Completed(t) => t);
        assert_eq!(exports.get::<String>("encoded").unwrap(), "aGVsbG8/");
        assert_eq!(exports.get::<String>("decoded").unwrap(), "hi");
        assert!(exports.get::<bool>("rejected").unwrap());
    }
}
