//! ECDSA keys on the NIST P-256 curve.
//!
//! Private keys travel as SEC1 DER, public keys as SubjectPublicKeyInfo DER
//! and signatures as ASN.1 DER. `sign` and `verify` take a message digest,
//! not the message.

use aes_gcm::aead::OsRng;
use mlua::{Lua, UserData, UserDataFields, UserDataMethods, Value};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::{PublicKey, SecretKey};

use crate::error::ModuleError;
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;

pub const NAME: &str = "pglua/crypto/ecdsa";

const CURVE: &str = "P256";

pub fn construct(_loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    Ok(Box::new(EcdsaModule))
}

#[derive(Clone, Copy)]
pub struct EcdsaModule;

impl CapabilityModule for EcdsaModule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(*self).map(Value::UserData)
    }
}

type Fallible<T> = mlua::Result<(Option<T>, Option<String>)>;

fn failure<T>(message: impl Into<String>) -> Fallible<T> {
    Ok((None, Some(message.into())))
}

impl UserData for EcdsaModule {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("generateKey", |_, curve: String| -> Fallible<EcdsaPrivateKey> {
            if curve != CURVE {
                return failure(format!("unsupported curve: {curve}"));
            }
            Ok((Some(EcdsaPrivateKey(SecretKey::random(&mut OsRng))), None))
        });
        methods.add_function("privateKey", |_, der: mlua::String| -> Fallible<EcdsaPrivateKey> {
            match SecretKey::from_sec1_der(&der.as_bytes()) {
                Ok(key) => Ok((Some(EcdsaPrivateKey(key)), None)),
                Err(e) => failure(format!("failed reading private key bytes: {e}")),
            }
        });
        methods.add_function("publicKey", |_, der: mlua::String| -> Fallible<EcdsaPublicKey> {
            match PublicKey::from_public_key_der(&der.as_bytes()) {
                Ok(key) => Ok((Some(EcdsaPublicKey(key)), None)),
                Err(e) => failure(format!("failed reading public key bytes: {e}")),
            }
        });
    }
}

/// A private key handed to scripts.
pub struct EcdsaPrivateKey(SecretKey);

impl UserData for EcdsaPrivateKey {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("curve", |_, _| Ok(CURVE));
        fields.add_field_method_get("bytes", |lua, this| {
            let der = this.0.to_sec1_der().map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            lua.create_string(&*der)
        });
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("publicKey", |_, this, ()| -> Fallible<EcdsaPublicKey> {
            Ok((Some(EcdsaPublicKey(this.0.public_key())), None))
        });
        methods.add_method("sign", |lua, this, digest: mlua::String| -> Fallible<mlua::String> {
            let signing_key = SigningKey::from(&this.0);
            let signature: Signature = match signing_key.sign_prehash(&digest.as_bytes()) {
                Ok(signature) => signature,
                Err(e) => return failure(format!("failed signing message hashsum: {e}")),
            };
            Ok((Some(lua.create_string(signature.to_der().as_bytes())?), None))
        });
        methods.add_method(
            "sharedSecret",
            |lua, this, der: mlua::String| -> Fallible<mlua::String> {
                let public = match PublicKey::from_public_key_der(&der.as_bytes()) {
                    Ok(public) => public,
                    Err(e) => return failure(format!("failed reading public key bytes: {e}")),
                };
                let shared =
                    p256::ecdh::diffie_hellman(this.0.to_nonzero_scalar(), public.as_affine());
                Ok((Some(lua.create_string(shared.raw_secret_bytes())?), None))
            },
        );
    }
}

/// A public key handed to scripts.
pub struct EcdsaPublicKey(PublicKey);

impl UserData for EcdsaPublicKey {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("curve", |_, _| Ok(CURVE));
        fields.add_field_method_get("bytes", |lua, this| {
            let der = this
                .0
                .to_public_key_der()
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            lua.create_string(der.as_bytes())
        });
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method(
            "verify",
            |_, this, (digest, signature): (mlua::String, mlua::String)| {
                let Ok(signature) = Signature::from_der(&signature.as_bytes()) else {
                    return Ok(false);
                };
                let verifying_key = VerifyingKey::from(&this.0);
                Ok(verifying_key
                    .verify_prehash(&digest.as_bytes(), &signature)
                    .is_ok())
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::context::RunOutcome;
    use crate::test_helpers::{root_context, write_script};

    #[test]
    fn sign_verify_and_key_exchange() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir,
            "main.lua",
            r#"
                local ecdsa = require("pglua/crypto/ecdsa")
                local sha2 = require("pglua/crypto/sha2")

                local alice = ecdsa.generateKey("P256")
                local bob = ecdsa.generateKey("P256")
                local digest = sha2.sum256("hello")

                local signature = alice:sign(digest)
                local alice_pub = alice:publicKey()
                valid = alice_pub:verify(digest, signature)
                forged = alice_pub:verify(sha2.sum256("bye"), signature)

                local reloaded = ecdsa.privateKey(alice.bytes)
                same_key = reloaded:publicKey().bytes == alice_pub.bytes

                local s1 = alice:sharedSecret(bob:publicKey().bytes)
                local s2 = bob:sharedSecret(alice_pub.bytes)
                agreed = s1 == s2 and #s1 == 32

                local _, err = ecdsa.generateKey("P999")
                curve_error = err
                curve = alice.curve
            "#,
        );
        let ctx = root_context(&dir, "main.lua");

        let exports = assert_matches!(ctx.run(), RunOutcome::Completed(t) => t);
        assert!(exports.get::<bool>("valid").unwrap());
        assert!(!exports.get::<bool>("forged").unwrap());
        assert!(exports.get::<bool>("same_key").unwrap());
        assert!(exports.get::<bool>("agreed").unwrap());
        assert_eq!(exports.get::<String>("curve_error").unwrap(), "unsupported curve: P999");
        assert_eq!(exports.get::<String>("curve").unwrap(), "P256");
    }
}
