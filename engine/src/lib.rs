//! # Recsync Engine
//!
//! Bidirectional record synchronization between local data stores and a
//! collection storage server.
//!
//! Each data type that syncs is an *engine*. An engine pairs a [`Tracker`],
//! which remembers which local items changed and when, with a [`Store`],
//! which converts between local items and [`Record`]s. On every sync the
//! engine downloads records changed on the server, reconciles them against
//! local changes, applies the winners and uploads what changed locally.
//!
//! ## Design Principles
//!
//! - **Blocking and single-threaded**: engines sync one after another, and
//!   every server call blocks
//! - **Injected state**: clocks, preferences and the storage client are
//!   passed in, never global
//! - **No lost changes**: local changes that were not confirmed by the
//!   server go back into the tracker, even when a sync fails
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Bso`] is the wire form: id, server timestamp, sort index and an
//! encrypted payload. A [`Record`] is the decrypted JSON cleartext. Payloads
//! are sealed per collection with a [`KeyBundle`] taken from
//! [`CollectionKeys`].
//!
//! ### Sessions
//!
//! A [`SyncSession`] loads `meta/global` and the collection keys once per
//! sync and shares them between engines.
//!
//! ### Reconciliation
//!
//! An incoming record that conflicts with a local change is resolved by
//! age: whichever side changed more recently wins. The losing change is
//! discarded, so this is lossy by nature; see [`reconcile`].
//!
//! ## Quick Start
//!
//! ```rust
//! use recsync_engine::{
//!     Engine, EngineConfig, KeyBundle, ManualClock, MemoryPrefs, MemoryServer, MemoryStore,
//!     SyncEngine, SyncSession,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let clock = Arc::new(ManualClock::new(1_700_000_000_000));
//! let server = MemoryServer::new(clock.clone());
//!
//! let mut tabs = SyncEngine::new(
//!     "tabs",
//!     EngineConfig::default(),
//!     MemoryPrefs::shared(),
//!     clock,
//!     MemoryStore::new,
//! );
//! tabs.set_enabled(true);
//! tabs.store().insert("tab1", json!({"url": "https://example.com"}));
//!
//! let mut session = SyncSession::open(&server, KeyBundle::generate())?;
//! let stats = tabs.sync(&mut session)?.expect("engine is enabled");
//! session.finish()?;
//!
//! assert_eq!(stats.uploaded, 1);
//! assert_eq!(server.records("tabs").len(), 1);
//! # Ok::<(), recsync_engine::Error>(())
//! ```
//!
//! ## Networking
//!
//! Engines reach the server through [`StorageClient`]. [`MemoryServer`]
//! implements it in memory; with the `http` feature, `HttpClient` talks to a
//! running `recsync-server`.

pub mod client;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod manager;
pub mod memory;
pub mod meta;
pub mod persist;
pub mod prefs;
pub mod reconcile;
pub mod record;
pub mod session;
pub mod store;
pub mod sync_engine;
pub mod tracker;

// Re-export main types at crate root
pub use client::{CollectionRequest, InfoCollections, PostResult, Response, SortOrder, StorageClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use crypto::{CollectionKeys, EncryptedPayload, KeyBundle};
pub use engine::{Engine, IncomingCounts, Lazy, RecoveryStrategy, SyncStats};
pub use error::{Error, FailureCode, Result};
#[cfg(feature = "http")]
pub use http::HttpClient;
pub use manager::{EngineManager, EngineOutcome};
pub use memory::{MemoryServer, RequestCounts};
pub use meta::{EngineMeta, MetaGlobal, STORAGE_VERSION};
pub use prefs::{JsonPrefs, MemoryPrefs, PrefStore, SharedPrefs};
pub use record::{make_guid, Bso, Cleartext, Record};
pub use session::SyncSession;
pub use store::{MemoryStore, Store};
pub use sync_engine::SyncEngine;
pub use tracker::{ChangeSet, Tracker};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type Timestamp = u64;
