//! Built-in capability modules, all registered under the `pglua/` prefix.

pub mod crypto;
pub mod db;
pub mod encoding;
pub mod http;
pub mod math;
pub mod regex;
pub mod time;

use crate::module::ModuleRegistry;

pub fn register_builtin(registry: &mut ModuleRegistry) {
    registry
        .register(db::NAME, db::construct)
        .register(http::NAME, http::construct)
        .register(math::NAME, math::construct)
        .register(time::NAME, time::construct)
        .register(regex::NAME, regex::construct)
        .register(crypto::aes::NAME, crypto::aes::construct)
        .register(crypto::ecdsa::NAME, crypto::ecdsa::construct)
        .register(crypto::random::NAME, crypto::random::construct)
        .register(crypto::sha2::NAME, crypto::sha2::construct)
        .register(crypto::sha3::NAME, crypto::sha3::construct)
        .register(encoding::base64::NAME, encoding::base64::construct)
        .register(encoding::hex::NAME, encoding::hex::construct)
        .register(encoding::json::NAME, encoding::json::construct)
        .register(encoding::yaml::NAME, encoding::yaml::construct);
}
