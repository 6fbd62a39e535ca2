//! Record types exchanged with the storage server.
//!
//! A [`Bso`] is what travels over the wire: an id, server metadata and an
//! opaque string payload. A [`Record`] is the decrypted form the engine and
//! stores work with; its `cleartext` is a JSON object that always carries the
//! record's own `id`.

use crate::{CollectionName, RecordId, Timestamp};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Decrypted record contents.
pub type Cleartext = Map<String, Value>;

/// Generate a new 12-character record / sync id.
pub fn make_guid() -> String {
    let mut bytes = [0u8; 9];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Check that `id` looks like a value produced by [`make_guid`].
pub fn is_valid_guid(id: &str) -> bool {
    id.len() == 12
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// A basic storage object as stored on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bso {
    pub id: RecordId,
    /// Last modification time, assigned by the server.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub modified: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sortindex: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    pub payload: String,
}

fn is_zero(value: &Timestamp) -> bool {
    *value == 0
}

impl Bso {
    pub fn new(id: impl Into<RecordId>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            modified: 0,
            sortindex: None,
            ttl: None,
            payload: payload.into(),
        }
    }

    /// Build an unencrypted record whose payload is `value` serialized.
    pub fn from_cleartext<T: Serialize>(id: impl Into<RecordId>, value: &T) -> crate::Result<Self> {
        Ok(Self::new(id, serde_json::to_string(value)?))
    }

    /// Parse the payload of an unencrypted record.
    pub fn cleartext_as<T: for<'de> Deserialize<'de>>(&self) -> crate::Result<T> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// A decrypted record belonging to a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub collection: CollectionName,
    pub modified: Timestamp,
    pub sortindex: Option<i32>,
    pub ttl: Option<u32>,
    pub cleartext: Cleartext,
}

impl Record {
    /// Create a record from a JSON object. The `id` key is set to `id`.
    ///
    /// Non-object values are stored under a `value` key.
    pub fn new(id: impl Into<RecordId>, collection: impl Into<CollectionName>, data: Value) -> Self {
        let id = id.into();
        let mut cleartext = match data {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        cleartext.insert("id".into(), Value::String(id.clone()));
        Self {
            id,
            collection: collection.into(),
            modified: 0,
            sortindex: None,
            ttl: None,
            cleartext,
        }
    }

    /// A deletion marker for `id`.
    pub fn tombstone(id: impl Into<RecordId>, collection: impl Into<CollectionName>) -> Self {
        Self::new(id, collection, serde_json::json!({ "deleted": true }))
    }

    /// Whether this record marks a deletion.
    pub fn deleted(&self) -> bool {
        self.cleartext
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Cleartext without the `id` key, as a JSON value.
    pub fn data(&self) -> Value {
        let mut map = self.cleartext.clone();
        map.remove("id");
        Value::Object(map)
    }

    /// Change the record id, keeping the cleartext in step.
    pub fn set_id(&mut self, id: impl Into<RecordId>) {
        self.id = id.into();
        self.cleartext
            .insert("id".into(), Value::String(self.id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn guid_shape() {
        let id = make_guid();
        assert_eq!(id.len(), 12);
        assert!(is_valid_guid(&id));
        assert_ne!(make_guid(), id);
        assert!(!is_valid_guid("short"));
        assert!(!is_valid_guid("has spaces!!"));
    }

    #[test]
    fn record_carries_id_in_cleartext() {
        let record = Record::new("abc", "bookmarks", json!({"title": "Home"}));
        assert_eq!(record.cleartext["id"], "abc");
        assert_eq!(record.cleartext["title"], "Home");
        assert!(!record.deleted());
        assert_eq!(record.data(), json!({"title": "Home"}));
    }

    #[test]
    fn non_object_data_is_wrapped() {
        let record = Record::new("abc", "prefs", json!(42));
        assert_eq!(record.cleartext["value"], 42);
    }

    #[test]
    fn tombstone_is_deleted() {
        let record = Record::tombstone("gone", "tabs");
        assert!(record.deleted());
        assert_eq!(record.cleartext["id"], "gone");
    }

    #[test]
    fn set_id_updates_cleartext() {
        let mut record = Record::new("old", "tabs", json!({}));
        record.set_id("new");
        assert_eq!(record.id, "new");
        assert_eq!(record.cleartext["id"], "new");
    }

    #[test]
    fn bso_omits_server_fields_until_set() {
        let bso = Bso::new("abc", "{}");
        let json = serde_json::to_value(&bso).unwrap();
        assert_eq!(json, json!({"id": "abc", "payload": "{}"}));

        let parsed: Bso =
            serde_json::from_value(json!({"id": "x", "modified": 1500, "payload": "{}"})).unwrap();
        assert_eq!(parsed.modified, 1500);
        assert_eq!(parsed.sortindex, None);
    }
}
