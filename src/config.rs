//! Build-time/deploy-time configuration: trusted keys, threshold, and local
//! ECU/hardware identity, loaded from a TOML file.
//!
//! Shaped after an `UptaneConfig`-style `Config::load`/`Config::parse`
//! split, modernized from a hand-rolled `rustc_serialize` decoder to
//! `serde` + `toml` — nothing downstream depends on the old decoder, so
//! there's no reason to carry it forward.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::crypto::{KeyId, TrustedKey};
use crate::error::Error;

/// One trusted key entry as it appears in the `[[keys]]` array of tables.
#[derive(Debug, Deserialize)]
struct KeyEntry {
    /// Hex-encoded key id (`CRYPTO_KEYID_LEN` bytes).
    key_id: String,
    /// `"ed25519"` or `"rsassa-pss"`.
    method: String,
    /// For `ed25519`: hex-encoded 32-byte raw public key.
    /// For `rsassa-pss`: path to a PEM-encoded SubjectPublicKeyInfo file.
    material: String,
}

/// The `[uptane]` section: everything `TargetsContext::new` needs besides
/// the byte source and crypto backend.
#[derive(Debug, Deserialize)]
struct UptaneSection {
    ecu_identifier: String,
    hardware_identifier: String,
    threshold: usize,
    #[serde(default)]
    previous_version: u32,
}

#[derive(Debug, Deserialize)]
struct ParsedConfig {
    uptane: UptaneSection,
    #[serde(rename = "keys", default)]
    keys: Vec<KeyEntry>,
}

/// Parsed, ready-to-use configuration: local identity plus a trusted key
/// table, still keyed by position (callers build a `TargetsContext` from
/// `keys`/`threshold` directly).
#[derive(Debug)]
pub struct Config {
    pub ecu_identifier: String,
    pub hardware_identifier: String,
    pub threshold: usize,
    pub previous_version: u32,
    pub keys: Vec<(KeyId, TrustedKey)>,
}

impl Config {
    /// Reads and parses a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, Error> {
        let path = path.as_ref();
        info!("loading config file: {}", path.display());
        let text = fs::read_to_string(path)?;
        Config::parse(&text)
    }

    /// Parses an already-read TOML document.
    pub fn parse(toml: &str) -> Result<Config, Error> {
        let parsed: ParsedConfig = toml::from_str(toml)?;

        if parsed.uptane.threshold == 0 || parsed.uptane.threshold > parsed.keys.len() {
            return Err(Error::Config(format!(
                "threshold {} out of range for {} configured keys",
                parsed.uptane.threshold,
                parsed.keys.len()
            )));
        }

        let mut keys = Vec::with_capacity(parsed.keys.len());
        for entry in &parsed.keys {
            keys.push(decode_key(entry)?);
        }

        Ok(Config {
            ecu_identifier: parsed.uptane.ecu_identifier,
            hardware_identifier: parsed.uptane.hardware_identifier,
            threshold: parsed.uptane.threshold,
            previous_version: parsed.uptane.previous_version,
            keys,
        })
    }
}

fn decode_key(entry: &KeyEntry) -> Result<(KeyId, TrustedKey), Error> {
    let id_bytes = hex::decode(&entry.key_id)?;
    let mut key_id: KeyId = [0u8; 32];
    if id_bytes.len() != key_id.len() {
        return Err(Error::Config(format!(
            "key id for {} is {} bytes, expected {}",
            entry.key_id,
            id_bytes.len(),
            key_id.len()
        )));
    }
    key_id.copy_from_slice(&id_bytes);

    let key = match entry.method.as_str() {
        "ed25519" => {
            let raw = hex::decode(&entry.material)?;
            if raw.len() != 32 {
                return Err(Error::Config(format!(
                    "ed25519 key material for {} is {} bytes, expected 32",
                    entry.key_id,
                    raw.len()
                )));
            }
            let mut buf = [0u8; 32];
            buf.copy_from_slice(&raw);
            TrustedKey::Ed25519(buf)
        }
        "rsassa-pss" => {
            let contents = fs::read(&entry.material)?;
            let parsed = pem::parse(&contents)?;
            TrustedKey::RsaPss(parsed.contents().to_vec())
        }
        other => return Err(Error::Config(format!("unsupported key method: {}", other))),
    };

    Ok((key_id, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ed25519_key_entry() {
        let toml = format!(
            r#"
            [uptane]
            ecu_identifier = "ecu1"
            hardware_identifier = "hw1"
            threshold = 1

            [[keys]]
            key_id = "{}"
            method = "ed25519"
            material = "{}"
        "#,
            "11".repeat(32),
            "22".repeat(32)
        );

        let config = Config::parse(&toml).expect("valid config");
        assert_eq!(config.ecu_identifier, "ecu1");
        assert_eq!(config.keys.len(), 1);
        match &config.keys[0].1 {
            TrustedKey::Ed25519(raw) => assert_eq!(raw, &[0x22u8; 32]),
            _ => panic!("expected ed25519 key"),
        }
    }

    #[test]
    fn rejects_threshold_exceeding_key_count() {
        let toml = r#"
            [uptane]
            ecu_identifier = "ecu1"
            hardware_identifier = "hw1"
            threshold = 2
        "#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn rejects_unsupported_key_method() {
        let toml = format!(
            r#"
            [uptane]
            ecu_identifier = "ecu1"
            hardware_identifier = "hw1"
            threshold = 1

            [[keys]]
            key_id = "{}"
            method = "hmac-sha256"
            material = "deadbeef"
            "#,
            "11".repeat(32)
        );
        assert!(Config::parse(&toml).is_err());
    }
}
