//! Streaming public-key encryption for archived objects.
//!
//! Key material arrives through `PGP_KEY` / `PGP_KEY_PATH` (optionally
//! passphrase-protected via `PGP_KEY_PASSPHRASE`) and is opaque to the rest
//! of the engine: backups need only the public half, restores need the
//! private identity.

use std::io::{Cursor, Read, Write};
use std::str::FromStr;

use age::secrecy::Secret;
use age::x25519;

use crate::config::Config;
use crate::{Error, Result};

const ENCRYPTED_KEY_PREFIX: &str = "age-encryption.org/v1";
const SECRET_KEY_PREFIX: &str = "AGE-SECRET-KEY-1";
const PUBLIC_KEY_PREFIX: &str = "age1";

pub struct Crypter {
    recipients: Vec<x25519::Recipient>,
    identity: Option<x25519::Identity>,
}

impl Crypter {
    /// Build a crypter from the configured key material; `Ok(None)` when
    /// encryption is not configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        let raw = match (&config.pgp_key, &config.pgp_key_path) {
            (Some(inline), _) => inline.clone(),
            (None, Some(path)) => {
                let bytes = std::fs::read(path)?;
                match std::str::from_utf8(&bytes) {
                    Ok(text) if !text.starts_with(ENCRYPTED_KEY_PREFIX) => text.to_string(),
                    _ => unwrap_protected_key(&bytes, config.pgp_key_passphrase.as_deref())?,
                }
            }
            (None, None) => return Ok(None),
        };
        Self::from_key_material(&raw).map(Some)
    }

    /// Parse identities and recipients from key-file text. A secret key
    /// yields both halves; a bare public key allows encrypt-only use.
    pub fn from_key_material(raw: &str) -> Result<Self> {
        let mut recipients = Vec::new();
        let mut identity = None;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with(SECRET_KEY_PREFIX) {
                let parsed = x25519::Identity::from_str(line)
                    .map_err(|e| Error::Crypto(format!("unreadable secret key: {e}")))?;
                recipients.push(parsed.to_public());
                identity = Some(parsed);
            } else if line.starts_with(PUBLIC_KEY_PREFIX) {
                let parsed = x25519::Recipient::from_str(line)
                    .map_err(|e| Error::Crypto(format!("unreadable public key: {e}")))?;
                recipients.push(parsed);
            } else {
                return Err(Error::Crypto("unrecognized key material".into()).into());
            }
        }
        if recipients.is_empty() {
            return Err(Error::Crypto("key material holds no keys".into()).into());
        }
        Ok(Self {
            recipients,
            identity,
        })
    }

    pub fn can_decrypt(&self) -> bool {
        self.identity.is_some()
    }

    /// Wrap `sink` in an encrypting writer. The caller must `finish()` the
    /// returned writer to seal the stream.
    pub fn encrypt_writer<W: Write>(&self, sink: W) -> Result<age::stream::StreamWriter<W>> {
        let recipients: Vec<Box<dyn age::Recipient + Send>> = self
            .recipients
            .iter()
            .map(|r| Box::new(r.clone()) as Box<dyn age::Recipient + Send>)
            .collect();
        let encryptor = age::Encryptor::with_recipients(recipients)
            .ok_or_else(|| Error::Crypto("no recipients configured".into()))?;
        encryptor
            .wrap_output(sink)
            .map_err(|e| Error::Crypto(e.to_string()).into())
    }

    /// Wrap an archived object in a decrypting reader.
    pub fn decrypt_reader(
        &self,
        source: Box<dyn Read + Send>,
    ) -> Result<Box<dyn Read + Send>> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| Error::Crypto("decryption requires a private key".into()))?;
        let decryptor = match age::Decryptor::new(source)
            .map_err(|e| Error::Crypto(e.to_string()))?
        {
            age::Decryptor::Recipients(decryptor) => decryptor,
            age::Decryptor::Passphrase(_) => {
                return Err(
                    Error::Crypto("archive is passphrase-encrypted, key expected".into()).into(),
                )
            }
        };
        let reader = decryptor
            .decrypt(std::iter::once(identity as &dyn age::Identity))
            .map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(Box::new(reader))
    }
}

/// Decrypt a passphrase-protected key file into its text form.
fn unwrap_protected_key(bytes: &[u8], passphrase: Option<&str>) -> Result<String> {
    let passphrase = passphrase.ok_or(Error::MissingSetting(
        crate::config::PGP_KEY_PASSPHRASE_SETTING,
    ))?;
    let decryptor = match age::Decryptor::new(Cursor::new(bytes.to_vec()))
        .map_err(|e| Error::Crypto(e.to_string()))?
    {
        age::Decryptor::Passphrase(decryptor) => decryptor,
        age::Decryptor::Recipients(_) => {
            return Err(Error::Crypto("key file is not passphrase-protected".into()).into())
        }
    };
    let mut reader = decryptor
        .decrypt(&Secret::new(passphrase.to_string()), None)
        .map_err(|e| Error::Crypto(format!("wrong passphrase or damaged key: {e}")))?;
    let mut text = String::new();
    reader.read_to_string(&mut text)?;
    Ok(text)
}
