//! Per-record envelope encryption.
//!
//! Each record payload is encrypted with XChaCha20-Poly1305 under the
//! collection's key bundle, and the base64 ciphertext is authenticated with
//! HMAC-SHA256 under the bundle's separate HMAC key. The HMAC is checked
//! before anything is decrypted so that a stale key bundle shows up as an
//! [`Error::HmacMismatch`], which the engine treats as a recoverable key
//! problem rather than a corrupt record.

use crate::record::{Bso, Cleartext, Record};
use crate::{CollectionName, Error, Result, Timestamp};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Length of both keys in a bundle.
pub const KEY_LENGTH: usize = 32;

/// Nonce size for XChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 24;

/// Collection and id of the record holding the collection keys.
pub const KEYS_COLLECTION: &str = "crypto";
pub const KEYS_ID: &str = "keys";

/// An encryption key paired with an HMAC key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyBundle {
    encryption_key: [u8; KEY_LENGTH],
    hmac_key: [u8; KEY_LENGTH],
}

impl KeyBundle {
    pub fn new(encryption_key: [u8; KEY_LENGTH], hmac_key: [u8; KEY_LENGTH]) -> Self {
        Self {
            encryption_key,
            hmac_key,
        }
    }

    /// Generate a bundle from the OS random source.
    pub fn generate() -> Self {
        let mut encryption_key = [0u8; KEY_LENGTH];
        let mut hmac_key = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut encryption_key);
        rand::thread_rng().fill_bytes(&mut hmac_key);
        Self::new(encryption_key, hmac_key)
    }

    /// Import a bundle from two base64 strings.
    pub fn from_base64(encryption_key: &str, hmac_key: &str) -> Result<Self> {
        Ok(Self::new(
            decode_key(encryption_key)?,
            decode_key(hmac_key)?,
        ))
    }

    /// Export as `[encryption_key, hmac_key]` base64 strings.
    pub fn to_base64(&self) -> [String; 2] {
        [
            STANDARD.encode(self.encryption_key),
            STANDARD.encode(self.hmac_key),
        ]
    }

    fn hmac(&self, data: &[u8]) -> Result<HmacSha256> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.hmac_key)
            .map_err(|e| Error::Crypto(format!("invalid HMAC key: {e}")))?;
        mac.update(data);
        Ok(mac)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(GenericArray::from_slice(&self.encryption_key))
    }

    /// Encrypt `plaintext` into an authenticated envelope.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;
        let ciphertext = STANDARD.encode(ciphertext);
        let hmac = hex::encode(self.hmac(ciphertext.as_bytes())?.finalize().into_bytes());
        Ok(EncryptedPayload {
            ciphertext,
            iv: STANDARD.encode(nonce),
            hmac,
        })
    }

    /// Verify and decrypt an envelope.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>> {
        if payload.ciphertext.is_empty() {
            return Err(Error::MissingCiphertext);
        }

        let expected = hex::decode(&payload.hmac).unwrap_or_default();
        let mac = self.hmac(payload.ciphertext.as_bytes())?;
        if mac.clone().verify_slice(&expected).is_err() {
            return Err(Error::HmacMismatch {
                expected: payload.hmac.clone(),
                computed: hex::encode(mac.finalize().into_bytes()),
            });
        }

        let nonce = STANDARD
            .decode(&payload.iv)
            .map_err(|e| Error::Crypto(format!("invalid IV: {e}")))?;
        if nonce.len() != NONCE_SIZE {
            return Err(Error::Crypto(format!(
                "invalid IV length: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }
        let ciphertext = STANDARD
            .decode(&payload.ciphertext)
            .map_err(|e| Error::Crypto(format!("invalid ciphertext: {e}")))?;

        self.cipher()
            .decrypt(GenericArray::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|e| Error::Crypto(format!("decryption failed: {e}")))
    }
}

impl fmt::Debug for KeyBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyBundle(..)")
    }
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LENGTH]> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| Error::Crypto(format!("invalid key encoding: {e}")))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        Error::Crypto(format!(
            "invalid key length: expected {}, got {}",
            KEY_LENGTH,
            bytes.len()
        ))
    })
}

/// The JSON envelope stored in an encrypted record's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    #[serde(rename = "IV")]
    pub iv: String,
    pub hmac: String,
}

impl Record {
    /// Serialize and encrypt this record for upload.
    pub fn encrypt(&self, key: &KeyBundle) -> Result<Bso> {
        let plaintext = serde_json::to_vec(&self.cleartext)?;
        let envelope = key.encrypt(&plaintext)?;
        Ok(Bso {
            id: self.id.clone(),
            modified: self.modified,
            sortindex: self.sortindex,
            ttl: self.ttl,
            payload: serde_json::to_string(&envelope)?,
        })
    }
}

impl Bso {
    /// Verify, decrypt and parse this record's payload.
    pub fn decrypt(&self, key: &KeyBundle, collection: &str) -> Result<Record> {
        let envelope: EncryptedPayload =
            serde_json::from_str(&self.payload).map_err(|_| Error::MissingCiphertext)?;
        let plaintext = key.decrypt(&envelope)?;
        let cleartext: Cleartext = serde_json::from_slice(&plaintext)?;

        let cleartext_id = cleartext.get("id").and_then(|v| v.as_str()).unwrap_or("");
        if cleartext_id != self.id {
            return Err(Error::RecordIdMismatch {
                expected: self.id.clone(),
                actual: cleartext_id.to_string(),
            });
        }

        Ok(Record {
            id: self.id.clone(),
            collection: collection.to_string(),
            modified: self.modified,
            sortindex: self.sortindex,
            ttl: self.ttl,
            cleartext,
        })
    }
}

/// Per-collection key bundles with a default fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionKeys {
    default: KeyBundle,
    collections: BTreeMap<CollectionName, KeyBundle>,
    /// Server timestamp of the keys record these were loaded from.
    pub modified: Timestamp,
}

#[derive(Serialize, Deserialize)]
struct KeysCleartext {
    id: String,
    collection: String,
    default: [String; 2],
    #[serde(default)]
    collections: BTreeMap<String, [String; 2]>,
}

impl CollectionKeys {
    pub fn new(default: KeyBundle) -> Self {
        Self {
            default,
            collections: BTreeMap::new(),
            modified: 0,
        }
    }

    /// Fresh random keys.
    pub fn generate() -> Self {
        Self::new(KeyBundle::generate())
    }

    /// Use a dedicated bundle for `collection`.
    pub fn set_collection_key(&mut self, collection: impl Into<CollectionName>, key: KeyBundle) {
        self.collections.insert(collection.into(), key);
    }

    /// The bundle for `collection`, falling back to the default.
    pub fn key_for_collection(&self, collection: &str) -> &KeyBundle {
        self.collections.get(collection).unwrap_or(&self.default)
    }

    /// Whether the key material (not the timestamp) differs from `other`.
    pub fn keys_differ(&self, other: &CollectionKeys) -> bool {
        self.default != other.default || self.collections != other.collections
    }

    /// Encrypt into the `crypto/keys` record under `root`.
    pub fn to_bso(&self, root: &KeyBundle) -> Result<Bso> {
        let cleartext = KeysCleartext {
            id: KEYS_ID.into(),
            collection: KEYS_COLLECTION.into(),
            default: self.default.to_base64(),
            collections: self
                .collections
                .iter()
                .map(|(name, key)| (name.clone(), key.to_base64()))
                .collect(),
        };
        let envelope = root.encrypt(&serde_json::to_vec(&cleartext)?)?;
        Ok(Bso::new(KEYS_ID, serde_json::to_string(&envelope)?))
    }

    /// Decrypt the `crypto/keys` record with `root`.
    pub fn from_bso(bso: &Bso, root: &KeyBundle) -> Result<Self> {
        let record = bso.decrypt(root, KEYS_COLLECTION)?;
        let cleartext: KeysCleartext = serde_json::from_value(serde_json::Value::Object(
            record.cleartext,
        ))?;

        let mut keys = Self::new(KeyBundle::from_base64(
            &cleartext.default[0],
            &cleartext.default[1],
        )?);
        for (name, [enc, hmac]) in &cleartext.collections {
            keys.set_collection_key(name.clone(), KeyBundle::from_base64(enc, hmac)?);
        }
        keys.modified = bso.modified;
        Ok(keys)
    }
}
