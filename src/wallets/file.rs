//! Wallet configuration file loading.
//!
//! `config/wallets.json` is either a flat pool or named groups. The file
//! may be stored encrypted in a standard envelope: PBKDF2-SHA256
//! (100 000 iterations) derives a 256-bit key, AES-256-GCM with a
//! 128-bit IV seals the JSON. Envelope fields are hex strings.
//!
//! Address derivation from the WIF is an external concern; the file
//! carries the derived payment and receive addresses alongside it.

use std::collections::HashMap;
use std::path::Path;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use anyhow::{anyhow, bail, Context, Result};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::pool::WalletHandle;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// AES-256-GCM with the envelope's 128-bit IV.
type EnvelopeCipher = AesGcm<Aes256, aes_gcm::aead::consts::U16>;

/// Encrypted wallet file envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub salt: String,
    pub iv: String,
    pub auth_tag: String,
    pub encrypted: String,
}

/// One wallet entry as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletFileEntry {
    pub label: String,
    /// Opaque signing-key string; never logged.
    pub wif: String,
    pub payment_address: String,
    pub receive_address: String,
}

impl WalletFileEntry {
    pub fn into_handle(self) -> WalletHandle {
        WalletHandle {
            label: self.label,
            payment_address: self.payment_address,
            receive_address: self.receive_address,
            wif: self.wif,
        }
    }
}

/// A named wallet group with its own per-minute budget and optional
/// collection claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletGroupEntry {
    pub wallets: Vec<WalletFileEntry>,
    #[serde(default)]
    pub bids_per_minute: Option<u32>,
    /// Collection symbols this group funds exclusively.
    #[serde(default)]
    pub collections: Vec<String>,
}

/// The two accepted shapes of `config/wallets.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WalletsFile {
    #[serde(rename_all = "camelCase")]
    Grouped {
        groups: HashMap<String, WalletGroupEntry>,
        default_group: String,
        #[serde(default)]
        funding_wallet: Option<WalletFileEntry>,
    },
    #[serde(rename_all = "camelCase")]
    Flat {
        wallets: Vec<WalletFileEntry>,
        #[serde(default)]
        bids_per_minute: Option<u32>,
    },
}

impl WalletsFile {
    /// Load from disk, decrypting first when the file is an envelope.
    pub fn load(path: &Path, passphrase: Option<&str>) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read wallet config {}", path.display()))?;

        if let Ok(envelope) = serde_json::from_slice::<EncryptedEnvelope>(&bytes) {
            let passphrase = passphrase
                .ok_or_else(|| anyhow!("wallet config is encrypted but no passphrase was set"))?;
            let plaintext = decrypt_envelope(&envelope, passphrase)?;
            return serde_json::from_slice(&plaintext)
                .context("decrypted wallet config is not valid JSON");
        }

        serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid wallet config {}", path.display()))
    }

    /// Validate structural invariants before any pool is built.
    ///
    /// Grouped mode: the default group must exist, every group needs at
    /// least one wallet, and no two groups may claim the same collection.
    pub fn validate(&self) -> Result<()> {
        match self {
            WalletsFile::Flat { wallets, .. } => {
                if wallets.is_empty() {
                    bail!("wallet config has no wallets");
                }
            }
            WalletsFile::Grouped {
                groups,
                default_group,
                ..
            } => {
                if !groups.contains_key(default_group) {
                    bail!("defaultGroup '{}' is not a defined group", default_group);
                }
                let mut claimed: HashMap<&str, &str> = HashMap::new();
                for (name, group) in groups {
                    if group.wallets.is_empty() {
                        bail!("wallet group '{}' has no wallets", name);
                    }
                    for symbol in &group.collections {
                        if let Some(prev) = claimed.insert(symbol.as_str(), name.as_str()) {
                            bail!(
                                "collection '{}' is claimed by both wallet groups '{}' and '{}'",
                                symbol,
                                prev,
                                name
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Open an encrypted wallet envelope.
pub fn decrypt_envelope(envelope: &EncryptedEnvelope, passphrase: &str) -> Result<Vec<u8>> {
    let salt = hex::decode(&envelope.salt).context("envelope salt is not hex")?;
    let iv = hex::decode(&envelope.iv).context("envelope iv is not hex")?;
    let tag = hex::decode(&envelope.auth_tag).context("envelope authTag is not hex")?;
    let mut ciphertext = hex::decode(&envelope.encrypted).context("envelope body is not hex")?;

    if salt.len() != SALT_LEN {
        bail!("envelope salt must be {} bytes, got {}", SALT_LEN, salt.len());
    }
    if iv.len() != IV_LEN {
        bail!("envelope iv must be {} bytes, got {}", IV_LEN, iv.len());
    }
    if tag.len() != TAG_LEN {
        bail!("envelope authTag must be {} bytes, got {}", TAG_LEN, tag.len());
    }

    let key = derive_key(passphrase, &salt);
    let cipher = EnvelopeCipher::new(GenericArray::from_slice(&key));
    ciphertext.extend_from_slice(&tag);

    cipher
        .decrypt(GenericArray::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| anyhow!("wallet config decryption failed (wrong passphrase?)"))
}

/// Seal plaintext into an envelope with a fresh salt and IV.
pub fn encrypt_envelope(plaintext: &[u8], passphrase: &str) -> Result<EncryptedEnvelope> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt);
    let cipher = EnvelopeCipher::new(GenericArray::from_slice(&key));
    let mut sealed = cipher
        .encrypt(GenericArray::from_slice(&iv), plaintext)
        .map_err(|_| anyhow!("wallet config encryption failed"))?;

    let tag = sealed.split_off(sealed.len() - TAG_LEN);
    Ok(EncryptedEnvelope {
        salt: hex::encode(salt),
        iv: hex::encode(iv),
        auth_tag: hex::encode(tag),
        encrypted: hex::encode(sealed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(label: &str) -> WalletFileEntry {
        WalletFileEntry {
            label: label.to_string(),
            wif: format!("wif-{}", label),
            payment_address: format!("bc1q-{}", label),
            receive_address: format!("bc1p-{}", label),
        }
    }

    #[test]
    fn test_flat_file_parses() {
        let json = r#"{
            "wallets": [
                {"label": "w0", "wif": "k", "paymentAddress": "bc1q0", "receiveAddress": "bc1p0"}
            ],
            "bidsPerMinute": 8
        }"#;
        let file: WalletsFile = serde_json::from_str(json).unwrap();
        match file {
            WalletsFile::Flat {
                wallets,
                bids_per_minute,
            } => {
                assert_eq!(wallets.len(), 1);
                assert_eq!(bids_per_minute, Some(8));
            }
            _ => panic!("expected flat shape"),
        }
    }

    #[test]
    fn test_grouped_file_parses_and_validates() {
        let json = r#"{
            "groups": {
                "main": {
                    "wallets": [{"label": "w0", "wif": "k", "paymentAddress": "a", "receiveAddress": "b"}],
                    "bidsPerMinute": 5,
                    "collections": ["bitcoin-frogs"]
                }
            },
            "defaultGroup": "main"
        }"#;
        let file: WalletsFile = serde_json::from_str(json).unwrap();
        file.validate().unwrap();
    }

    #[test]
    fn test_duplicate_collection_claim_rejected() {
        let mut groups = HashMap::new();
        groups.insert(
            "a".to_string(),
            WalletGroupEntry {
                wallets: vec![entry("a0")],
                bids_per_minute: None,
                collections: vec!["frogs".to_string()],
            },
        );
        groups.insert(
            "b".to_string(),
            WalletGroupEntry {
                wallets: vec![entry("b0")],
                bids_per_minute: None,
                collections: vec!["frogs".to_string()],
            },
        );
        let file = WalletsFile::Grouped {
            groups,
            default_group: "a".to_string(),
            funding_wallet: None,
        };
        let err = file.validate().unwrap_err().to_string();
        assert!(err.contains("claimed by both"), "{}", err);
    }

    #[test]
    fn test_missing_default_group_rejected() {
        let mut groups = HashMap::new();
        groups.insert(
            "a".to_string(),
            WalletGroupEntry {
                wallets: vec![entry("a0")],
                bids_per_minute: None,
                collections: vec![],
            },
        );
        let file = WalletsFile::Grouped {
            groups,
            default_group: "missing".to_string(),
            funding_wallet: None,
        };
        assert!(file.validate().is_err());
    }

    #[test]
    fn test_envelope_round_trip() {
        let plaintext = serde_json::to_vec(&serde_json::json!({
            "wallets": [
                {"label": "w0", "wif": "secret", "paymentAddress": "a", "receiveAddress": "b"}
            ]
        }))
        .unwrap();

        let envelope = encrypt_envelope(&plaintext, "hunter2").unwrap();
        assert_eq!(hex::decode(&envelope.salt).unwrap().len(), SALT_LEN);
        assert_eq!(hex::decode(&envelope.iv).unwrap().len(), IV_LEN);
        assert_eq!(hex::decode(&envelope.auth_tag).unwrap().len(), TAG_LEN);

        let opened = decrypt_envelope(&envelope, "hunter2").unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let envelope = encrypt_envelope(b"{}", "correct").unwrap();
        assert!(decrypt_envelope(&envelope, "wrong").is_err());
    }
}
