//! Request inspection and response writing for routed scripts.

use std::collections::BTreeMap;
use std::sync::Arc;

use mlua::{Lua, Table, UserData, UserDataMethods, Value};

use crate::engine::{from_json, raise, to_json, EarlyExit};
use crate::error::ModuleError;
use crate::http::{Cookie, HttpRequest, ResponseWriter};
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;
use crate::state::{HTTP_REQUEST, HTTP_RESPONSE_WRITER};

pub const NAME: &str = "pglua/http";

pub fn construct(loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    Ok(Box::new(HttpModule {
        request: loader.get_state(&HTTP_REQUEST)?,
        response: loader.get_state(&HTTP_RESPONSE_WRITER)?,
    }))
}

#[derive(Clone)]
pub struct HttpModule {
    request: Arc<HttpRequest>,
    response: Arc<ResponseWriter>,
}

impl CapabilityModule for HttpModule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(self.clone()).map(Value::UserData)
    }
}

fn multi_map(lua: &Lua, map: BTreeMap<String, Vec<String>>) -> mlua::Result<Table> {
    let table = lua.create_table_with_capacity(0, map.len())?;
    for (key, values) in map {
        table.raw_set(key, lua.create_sequence_from(values)?)?;
    }
    Ok(table)
}

fn cookie_table(lua: &Lua, cookie: &Cookie) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.raw_set("name", cookie.name.as_str())?;
    table.raw_set("value", cookie.value.as_str())?;
    table.raw_set("path", cookie.path.as_deref().unwrap_or_default())?;
    table.raw_set("domain", cookie.domain.as_deref().unwrap_or_default())?;
    table.raw_set("expires", cookie.expires)?;
    table.raw_set("secure", cookie.secure)?;
    table.raw_set("httponly", cookie.http_only)?;
    Ok(table)
}

impl HttpModule {
    fn post(&self, lua: &Lua) -> mlua::Result<Value> {
        match self.request.content_type() {
            Some("application/json") => {
                let body: serde_json::Value = serde_json::from_slice(&self.request.body)
                    .map_err(|_| mlua::Error::RuntimeError("invalid json request".to_string()))?;
                from_json(lua, &body)
            }
            Some("multipart/form-data") => Err(mlua::Error::RuntimeError(
                "multipart form data is not supported".to_string(),
            )),
            _ => multi_map(lua, self.request.form_params()).map(Value::Table),
        }
    }

    fn write(&self, lua: &Lua, status: u16, data: Value) -> mlua::Result<()> {
        let json = to_json(lua, data)?;
        let body = serde_json::to_vec(&json).map_err(mlua::Error::external)?;
        self.response.write(status, body).map_err(raise)?;
        Err(raise(EarlyExit))
    }

    fn location(&self, status: u16, destination: &str) -> mlua::Result<()> {
        self.response.redirect(status, destination).map_err(raise)?;
        Err(raise(EarlyExit))
    }
}

type CookieArgs = (
    String,
    String,
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<bool>,
    Option<bool>,
);

impl UserData for HttpModule {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("method", |_, this, ()| Ok(this.request.method.clone()));
        methods.add_method("host", |_, this, ()| Ok(this.request.host.clone()));
        methods.add_method("protocol", |_, this, ()| Ok(this.request.protocol()));
        methods.add_method("remoteAddr", |_, this, ()| {
            Ok(this.request.remote_ip().unwrap_or_default().to_string())
        });
        methods.add_method("headers", |lua, this, ()| {
            multi_map(lua, this.request.header_map())
        });
        methods.add_method("cookies", |lua, this, ()| {
            let table = lua.create_table()?;
            for cookie in this.request.cookies() {
                table.raw_set(cookie.name.as_str(), cookie_table(lua, &cookie)?)?;
            }
            Ok(table)
        });
        methods.add_method("query", |lua, this, ()| {
            multi_map(lua, this.request.query_params())
        });
        methods.add_method("vars", |lua, this, ()| {
            lua.create_table_from(this.request.path_vars.clone())
        });
        methods.add_method("post", |lua, this, ()| this.post(lua));
        methods.add_method("write", |lua, this, (status, data): (u16, Value)| {
            this.write(lua, status, data)
        });
        methods.add_method("setHeader", |_, this, (name, value): (String, String)| {
            this.response.set_header(&name, &value);
            Ok(())
        });
        methods.add_method("setCookie", |_, this, args: CookieArgs| {
            let (name, value, expires, path, domain, secure, http_only) = args;
            this.response.set_cookie(&Cookie {
                name,
                value,
                path,
                domain,
                expires,
                secure: secure.unwrap_or(false),
                http_only: http_only.unwrap_or(false),
            });
            Ok(())
        });
        methods.add_method("location", |_, this, (status, destination): (u16, String)| {
            this.location(status, &destination)
        });
    }
}
