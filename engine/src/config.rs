//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Records applied per `Store::apply_incoming_batch` call.
pub const DEFAULT_STORE_BATCH_SIZE: usize = 1;
/// Records downloaded per sync on mobile clients.
pub const MOBILE_BATCH_SIZE: usize = 50;
/// Ids per request when fetching a backlog of records by id.
pub const DEFAULT_GUID_FETCH_BATCH_SIZE: usize = 50;
pub const DEFAULT_MOBILE_GUID_FETCH_BATCH_SIZE: usize = 50;
/// Records per upload request.
pub const MAX_UPLOAD_RECORDS: usize = 100;
/// Ids per delete request.
pub const MAX_DELETE_IDS: usize = 100;

/// Tunables for one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Data format version written into meta/global.
    pub version: u32,
    /// Lower numbers sync first.
    pub sync_priority: i32,
    pub apply_incoming_batch_size: usize,
    /// Maximum ids the mobile GUID query pages through after the first
    /// batch; `None` for no limit.
    pub download_limit: Option<usize>,
    pub mobile_batch_size: usize,
    pub guid_fetch_batch_size: usize,
    pub mobile_guid_fetch_batch_size: usize,
    pub max_upload_records: usize,
    pub delete_batch_size: usize,
    /// Quiet window before tracked changes are written to disk.
    pub tracker_save_delay_ms: u64,
    /// Skip records that fail HMAC verification instead of reporting them
    /// as failed.
    pub ignore_undecryptable: bool,
    /// Directory for `changes/`, `toFetch/` and `failed/` state files.
    /// Without one, that state lives in memory only.
    pub profile_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            sync_priority: 0,
            apply_incoming_batch_size: DEFAULT_STORE_BATCH_SIZE,
            download_limit: None,
            mobile_batch_size: MOBILE_BATCH_SIZE,
            guid_fetch_batch_size: DEFAULT_GUID_FETCH_BATCH_SIZE,
            mobile_guid_fetch_batch_size: DEFAULT_MOBILE_GUID_FETCH_BATCH_SIZE,
            max_upload_records: MAX_UPLOAD_RECORDS,
            delete_batch_size: MAX_DELETE_IDS,
            tracker_save_delay_ms: 1000,
            ignore_undecryptable: false,
            profile_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_profile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.profile_dir = Some(dir.into());
        self
    }

    pub fn with_sync_priority(mut self, priority: i32) -> Self {
        self.sync_priority = priority;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}
