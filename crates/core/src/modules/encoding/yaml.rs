//! YAML documents to and from script values.

use mlua::{Lua, UserData, UserDataMethods, Value};

use crate::engine::{from_json, to_json};
use crate::error::ModuleError;
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;

pub const NAME: &str = "pglua/encoding/yaml";

pub fn construct(_loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    Ok(Box::new(YamlModule))
}

#[derive(Clone, Copy)]
pub struct YamlModule;

impl CapabilityModule for YamlModule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(*self).map(Value::UserData)
    }
}

impl UserData for YamlModule {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("encode", |lua, value: Value| {
            let encoded = to_json(lua, value)
                .map_err(|e| e.to_string())
                .and_then(|json| serde_yaml::to_string(&json).map_err(|e| e.to_string()));
            Ok(match encoded {
                Ok(text) => (Some(text), None),
                Err(err) => (None, Some(err)),
            })
        });
        methods.add_function("decode", |lua, text: mlua::String| {
            match serde_yaml::from_slice::<serde_json::Value>(&text.as_bytes()) {
                Ok(doc) => Ok((from_json(lua, &doc)?, None)),
                Err(e) => Ok((Value::Nil, Some(e.to_string()))),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::context::RunOutcome;
    use crate::test_helpers::{root_context, write_script};

    #[test]
    fn decode_and_encode() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir,
            "main.lua",
            r#"
                local yaml = require("pglua/encoding/yaml")
                local doc = yaml.decode("server:\n  port: 8080\n  hosts: [a, b]\n")
                port = doc.server.port
                second = doc.server.hosts[2]
                encoded = yaml.encode({name = "x"})
            "#,
        );
        let ctx = root_context(&dir, "main.lua");

        let exports = assert_matches!(ctx.run(), RunOutcome::Completed(t) => t);
        assert_eq!(exports.get::<i64>("port").unwrap(), 8080);
        assert_eq!(exports.get::<String>("second").unwrap(), "b");
        assert_eq!(exports.get::<String>("encoded").unwrap(), "name: x\n");
    }
}
