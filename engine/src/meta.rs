//! The `meta/global` record.
//!
//! Stored unencrypted, it tells every client which storage format the
//! account uses and, per engine, the data version and the sync id of the
//! current generation of that engine's collection.

use crate::record::{make_guid, Bso};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Storage format version this crate reads and writes.
pub const STORAGE_VERSION: u32 = 5;

pub const META_COLLECTION: &str = "meta";
pub const META_GLOBAL_ID: &str = "global";

/// Per-engine entry in meta/global.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMeta {
    /// Missing versions are read as 0.
    #[serde(default)]
    pub version: u32,
    #[serde(rename = "syncID", default)]
    pub sync_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaGlobal {
    #[serde(rename = "syncID")]
    pub sync_id: String,
    pub storage_version: u32,
    #[serde(default)]
    pub engines: BTreeMap<String, EngineMeta>,
    #[serde(default)]
    pub declined: Vec<String>,
}

impl MetaGlobal {
    /// A fresh record for an empty account.
    pub fn new() -> Self {
        Self {
            sync_id: make_guid(),
            storage_version: STORAGE_VERSION,
            engines: BTreeMap::new(),
            declined: Vec::new(),
        }
    }

    pub fn to_bso(&self) -> Result<Bso> {
        Bso::from_cleartext(META_GLOBAL_ID, self)
    }

    pub fn from_bso(bso: &Bso) -> Result<Self> {
        bso.cleartext_as()
    }
}

impl Default for MetaGlobal {
    fn default() -> Self {
        Self::new()
    }
}
