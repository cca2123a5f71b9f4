//! Hashing, randomness, symmetric encryption and ECDSA keys.

pub mod aes;
pub mod ecdsa;
pub mod random;
pub mod sha2;
pub mod sha3;

use mlua::Lua;

/// Digest `data` with `D` and return the raw bytes as a Lua string.
fn digest<D: ::sha2::Digest>(lua: &Lua, data: &mlua::String) -> mlua::Result<mlua::String> {
    lua.create_string(D::digest(&*data.as_bytes()))
}
