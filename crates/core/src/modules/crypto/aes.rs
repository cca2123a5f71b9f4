//! AES-GCM authenticated encryption.
//!
//! The key length picks the variant (16, 24 or 32 bytes). Ciphertexts are the
//! 12-byte nonce followed by the sealed message.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use mlua::{Lua, UserData, UserDataMethods, Value};

use crate::engine::value_or_message;
use crate::error::ModuleError;
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;

pub const NAME: &str = "pglua/crypto/aes";

const NONCE_LEN: usize = 12;

type Aes192Gcm = AesGcm<Aes192, U12>;

pub fn construct(_loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    Ok(Box::new(AesModule))
}

#[derive(Clone, Copy)]
pub struct AesModule;

impl CapabilityModule for AesModule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(*self).map(Value::UserData)
    }
}

#[derive(Debug, thiserror::Error)]
enum AesError {
    #[error("invalid key size {0}")]
    KeySize(usize),
    #[error("ciphertext too short")]
    Truncated,
    #[error("cipher: message authentication failed")]
    Aead,
}

fn seal_with<C>(key: &[u8], message: &[u8]) -> Result<Vec<u8>, AesError>
where
    C: Aead + AeadCore<NonceSize = U12> + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| AesError::KeySize(key.len()))?;
    let nonce = C::generate_nonce(&mut OsRng);
    let sealed = cipher.encrypt(&nonce, message).map_err(|_| AesError::Aead)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open_with<C>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, AesError>
where
    C: Aead + AeadCore<NonceSize = U12> + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| AesError::KeySize(key.len()))?;
    let (nonce, sealed) = data
        .split_first_chunk::<NONCE_LEN>()
        .ok_or(AesError::Truncated)?;
    cipher
        .decrypt(&(*nonce).into(), sealed)
        .map_err(|_| AesError::Aead)
}

fn encrypt(key: &[u8], message: &[u8]) -> Result<Vec<u8>, AesError> {
    match key.len() {
        16 => seal_with::<Aes128Gcm>(key, message),
        24 => seal_with::<Aes192Gcm>(key, message),
        32 => seal_with::<Aes256Gcm>(key, message),
        other => Err(AesError::KeySize(other)),
    }
}

fn decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, AesError> {
    match key.len() {
        16 => open_with::<Aes128Gcm>(key, data),
        24 => open_with::<Aes192Gcm>(key, data),
        32 => open_with::<Aes256Gcm>(key, data),
        other => Err(AesError::KeySize(other)),
    }
}

fn to_lua_bytes(
    lua: &Lua,
    result: Result<Vec<u8>, AesError>,
) -> mlua::Result<(Option<mlua::String>, Option<String>)> {
    let (bytes, err) = value_or_message(result);
    Ok((bytes.map(|b| lua.create_string(b)).transpose()?, err))
}

impl UserData for AesModule {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function(
            "encrypt",
            |lua, (secret, message): (mlua::String, mlua::String)| {
                to_lua_bytes(lua, encrypt(&secret.as_bytes(), &message.as_bytes()))
            },
        );
        methods.add_function(
            "decrypt",
            |lua, (secret, ciphertext): (mlua::String, mlua::String)| {
                to_lua_bytes(lua, decrypt(&secret.as_bytes(), &ciphertext.as_bytes()))
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn every_key_size_opens_what_it_sealed() {
        for size in [16, 24, 32] {
            let key = vec![7u8; size];
            let sealed = encrypt(&key, b"attack at dawn").unwrap();
            assert_eq!(sealed.len(), NONCE_LEN + 14 + 16);
            assert_eq!(decrypt(&key, &sealed).unwrap(), b"attack at dawn");
        }
    }

    #[test]
    fn tampering_and_bad_keys_are_reported() {
        let key = [1u8; 32];
        let mut sealed = encrypt(&key, b"payload").unwrap();
        *sealed.last_mut().unwrap() ^= 0xff;

        assert_matches!(decrypt(&key, &sealed), Err(AesError::Aead));
        assert_matches!(decrypt(&key, b"short"), Err(AesError::Truncated));
        assert_matches!(encrypt(b"tiny", b"x"), Err(AesError::KeySize(4)));
    }

    #[test]
    fn script_round_trip() {
        use crate::context::RunOutcome;
        use crate::test_helpers::{root_context, write_script};

        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir,
            "main.lua",
            r#"
                local aes = require("pglua/crypto/aes")
                local key = string.rep("k", 32)
                local sealed = aes.encrypt(key, "secret")
                plain = aes.decrypt(key, sealed)
                local _, err = aes.encrypt("short", "x")
                key_error = err
            "#,
        );
        let ctx = root_context(&dir, "main.lua");

        let exports = assert_matches!(ctx.run(), RunOutcome::Completed(t) => t);
        assert_eq!(exports.get::<String>("plain").unwrap(), "secret");
        assert_eq!(exports.get::<String>("key_error").unwrap(), "invalid key size 5");
    }
}
