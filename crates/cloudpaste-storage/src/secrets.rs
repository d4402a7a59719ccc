//! Encryption of secret fields inside storage-config JSON blobs.
//!
//! The key is derived from the `ENCRYPTION_SECRET` environment value with
//! HKDF-SHA256; each field is sealed with XChaCha20-Poly1305 and an AAD of
//! `<config_id>:<field>` so a ciphertext cannot be replayed onto another
//! config or field. Encrypted values are self-describing strings:
//! `enc:v1:<nonce_b64>:<ciphertext_b64>`.

use base64::Engine as _;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::Rng;
use sha2::Sha256;

const ENC_PREFIX: &str = "enc:v1:";

/// Top-level config fields treated as secret material.
pub const SECRET_FIELDS: &[&str] = &["secret_access_key", "password"];

#[derive(Clone)]
pub struct SecretsCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for SecretsCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsCipher").finish_non_exhaustive()
    }
}

impl SecretsCipher {
    pub fn from_secret(secret: &str) -> Result<Self, anyhow::Error> {
        if secret.is_empty() {
            return Err(anyhow::anyhow!("ENCRYPTION_SECRET must not be empty"));
        }
        let hk = Hkdf::<Sha256>::new(None, secret.as_bytes());
        let mut key = [0_u8; 32];
        hk.expand(b"config-secrets-v1", &mut key)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENC_PREFIX)
    }

    pub fn encrypt_field(
        &self,
        config_id: &str,
        field: &str,
        plaintext: &str,
    ) -> Result<String, anyhow::Error> {
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let mut nonce = [0_u8; 24];
        rand::rng().fill_bytes(&mut nonce);

        let aad = format!("{config_id}:{field}");
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        Ok(format!(
            "{ENC_PREFIX}{}:{}",
            b64.encode(nonce),
            b64.encode(ciphertext)
        ))
    }

    pub fn decrypt_field(
        &self,
        config_id: &str,
        field: &str,
        value: &str,
    ) -> Result<String, anyhow::Error> {
        let rest = value
            .strip_prefix(ENC_PREFIX)
            .ok_or_else(|| anyhow::anyhow!("value is not an encrypted field"))?;
        let (nonce_b64, ct_b64) = rest
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("malformed encrypted field"))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        let nonce = b64.decode(nonce_b64)?;
        let ciphertext = b64.decode(ct_b64)?;
        if nonce.len() != 24 {
            return Err(anyhow::anyhow!("malformed encrypted field nonce"));
        }

        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let aad = format!("{config_id}:{field}");
        let plaintext = cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext.as_slice(),
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| anyhow::anyhow!("failed to decrypt secret field {field}"))?;
        Ok(String::from_utf8(plaintext)?)
    }

    /// Seal every known secret field of a config blob in place. Already
    /// sealed values are left untouched so the call is idempotent.
    pub fn encrypt_config(
        &self,
        config_id: &str,
        config: &mut serde_json::Value,
    ) -> Result<(), anyhow::Error> {
        let Some(map) = config.as_object_mut() else {
            return Ok(());
        };
        for field in SECRET_FIELDS {
            let current = map.get(*field).and_then(|v| v.as_str()).map(str::to_string);
            if let Some(value) = current
                && !Self::is_encrypted(&value)
            {
                let sealed = self.encrypt_field(config_id, field, &value)?;
                map.insert((*field).to_string(), serde_json::Value::String(sealed));
            }
        }
        Ok(())
    }

    /// Open every sealed secret field of a config blob in place.
    pub fn decrypt_config(
        &self,
        config_id: &str,
        config: &mut serde_json::Value,
    ) -> Result<(), anyhow::Error> {
        let Some(map) = config.as_object_mut() else {
            return Ok(());
        };
        for field in SECRET_FIELDS {
            let current = map.get(*field).and_then(|v| v.as_str()).map(str::to_string);
            if let Some(value) = current
                && Self::is_encrypted(&value)
            {
                let opened = self.decrypt_field(config_id, field, &value)?;
                map.insert((*field).to_string(), serde_json::Value::String(opened));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_round_trip() {
        let cipher = SecretsCipher::from_secret("test-secret").unwrap();
        let sealed = cipher.encrypt_field("cfg1", "password", "hunter2").unwrap();
        assert!(SecretsCipher::is_encrypted(&sealed));
        assert_eq!(
            cipher.decrypt_field("cfg1", "password", &sealed).unwrap(),
            "hunter2"
        );
    }

    #[test]
    fn aad_binds_config_and_field() {
        let cipher = SecretsCipher::from_secret("test-secret").unwrap();
        let sealed = cipher.encrypt_field("cfg1", "password", "hunter2").unwrap();
        assert!(cipher.decrypt_field("cfg2", "password", &sealed).is_err());
        assert!(
            cipher
                .decrypt_field("cfg1", "secret_access_key", &sealed)
                .is_err()
        );
    }

    #[test]
    fn config_walk_is_idempotent_and_reversible() {
        let cipher = SecretsCipher::from_secret("test-secret").unwrap();
        let mut config = serde_json::json!({
            "endpoint": "https://dav.example.com/remote.php",
            "username": "alice",
            "password": "hunter2",
        });

        cipher.encrypt_config("cfg1", &mut config).unwrap();
        let sealed_once = config["password"].as_str().unwrap().to_string();
        assert!(SecretsCipher::is_encrypted(&sealed_once));
        assert_eq!(config["username"], "alice");

        // Second pass must not double-encrypt.
        cipher.encrypt_config("cfg1", &mut config).unwrap();
        assert_eq!(config["password"].as_str().unwrap(), sealed_once);

        cipher.decrypt_config("cfg1", &mut config).unwrap();
        assert_eq!(config["password"], "hunter2");
    }
}
