//! One sync pass against a storage server.
//!
//! A [`SyncSession`] fetches the account-wide records every engine depends
//! on (`info/collections`, `meta/global`, `crypto/keys`) once, hands them to
//! each engine in turn, and writes `meta/global` back when engines changed it.

use crate::client::{InfoCollections, StorageClient};
use crate::crypto::{CollectionKeys, KeyBundle, KEYS_COLLECTION, KEYS_ID};
use crate::meta::{EngineMeta, MetaGlobal, META_COLLECTION, META_GLOBAL_ID, STORAGE_VERSION};
use crate::{Error, Result, Timestamp};
use tracing::{debug, info, trace, warn};

pub struct SyncSession<'a> {
    client: &'a dyn StorageClient,
    root_key: KeyBundle,
    keys: CollectionKeys,
    meta: MetaGlobal,
    meta_changed: bool,
    info: InfoCollections,
    server_time: Timestamp,
    /// Set once an HMAC failure has refetched `crypto/keys`.
    keys_refetched: bool,
}

impl<'a> SyncSession<'a> {
    /// Start a session, creating `meta/global` and `crypto/keys` on an empty
    /// account.
    pub fn open(client: &'a dyn StorageClient, root_key: KeyBundle) -> Result<Self> {
        let info = client.info_collections()?;
        let mut server_time = info.timestamp;

        let (meta, meta_changed) = match client.get_record(META_COLLECTION, META_GLOBAL_ID)? {
            Some(resp) => {
                server_time = server_time.max(resp.timestamp);
                (MetaGlobal::from_bso(&resp.value)?, false)
            }
            None => {
                info!("no meta/global on server, starting fresh");
                (MetaGlobal::new(), true)
            }
        };
        if meta.storage_version > STORAGE_VERSION {
            return Err(Error::VersionOutOfDate {
                engine: META_COLLECTION.to_string(),
                local: STORAGE_VERSION,
                remote: meta.storage_version,
            });
        }

        let keys = match client.get_record(KEYS_COLLECTION, KEYS_ID)? {
            Some(resp) => {
                server_time = server_time.max(resp.timestamp);
                CollectionKeys::from_bso(&resp.value, &root_key)?
            }
            None => {
                info!("no collection keys on server, generating");
                let mut keys = CollectionKeys::generate();
                keys.modified = client.put_record(KEYS_COLLECTION, &keys.to_bso(&root_key)?)?;
                server_time = server_time.max(keys.modified);
                keys
            }
        };

        Ok(Self {
            client,
            root_key,
            keys,
            meta,
            meta_changed,
            info: info.value,
            server_time,
            keys_refetched: false,
        })
    }

    pub fn client(&self) -> &'a dyn StorageClient {
        self.client
    }

    pub fn collection_keys(&self) -> &CollectionKeys {
        &self.keys
    }

    pub fn key_for_collection(&self, collection: &str) -> &KeyBundle {
        self.keys.key_for_collection(collection)
    }

    pub fn meta(&self) -> &MetaGlobal {
        &self.meta
    }

    pub fn is_meta_changed(&self) -> bool {
        self.meta_changed
    }

    pub fn engine_meta(&self, engine: &str) -> Option<&EngineMeta> {
        self.meta.engines.get(engine)
    }

    pub fn set_engine_meta(&mut self, engine: &str, meta: EngineMeta) {
        if self.meta.engines.get(engine) != Some(&meta) {
            self.meta.engines.insert(engine.to_string(), meta);
            self.meta_changed = true;
        }
    }

    pub fn set_declined(&mut self, declined: Vec<String>) {
        if self.meta.declined != declined {
            self.meta.declined = declined;
            self.meta_changed = true;
        }
    }

    /// Last modification time of `collection` according to
    /// `info/collections`.
    pub fn last_modified(&self, collection: &str) -> Option<Timestamp> {
        self.info.get(collection).copied()
    }

    /// Latest server timestamp seen in this session.
    pub fn server_time(&self) -> Timestamp {
        self.server_time
    }

    pub fn note_server_time(&mut self, timestamp: Timestamp) {
        self.server_time = self.server_time.max(timestamp);
    }

    /// React to an HMAC failure by refetching the collection keys.
    ///
    /// Returns true if the keys on the server differ from the ones in use,
    /// in which case decrypting again may succeed. The keys are fetched at
    /// most once per session; later failures return false without a request.
    pub fn handle_hmac_event(&mut self) -> Result<bool> {
        if self.keys_refetched {
            trace!("collection keys already refetched this session");
            return Ok(false);
        }
        self.keys_refetched = true;
        let Some(resp) = self.client.get_record(KEYS_COLLECTION, KEYS_ID)? else {
            warn!("collection keys vanished from server");
            return Ok(false);
        };
        self.note_server_time(resp.timestamp);
        let fetched = CollectionKeys::from_bso(&resp.value, &self.root_key)?;
        if !fetched.keys_differ(&self.keys) {
            debug!("collection keys unchanged after HMAC failure");
            return Ok(false);
        }
        info!("collection keys changed on server, retrying");
        self.keys = fetched;
        Ok(true)
    }

    /// Upload `meta/global` if anything changed it.
    pub fn finish(&mut self) -> Result<()> {
        if !self.meta_changed {
            return Ok(());
        }
        debug!("uploading meta/global");
        let ts = self
            .client
            .put_record(META_COLLECTION, &self.meta.to_bso()?)?;
        self.note_server_time(ts);
        self.meta_changed = false;
        Ok(())
    }
}

impl std::fmt::Debug for SyncSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("meta", &self.meta)
            .field("meta_changed", &self.meta_changed)
            .field("server_time", &self.server_time)
            .finish_non_exhaustive()
    }
}
