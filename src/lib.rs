//! # EmberKV - eventually-persistent in-memory KV engine
//!
//! EmberKV is the in-memory core of a bucketed document store: the
//! authoritative working set lives in per-vbucket hash tables, mutations
//! are stamped with seqnos and hybrid-logical-clock CAS values, and an
//! asynchronous flusher persists them to a pluggable per-vbucket store.
//! Non-resident values are faulted back in by background fetchers, pagers
//! reclaim memory and expired items, and a warmup state machine rebuilds
//! the memory image at startup.
//!
//! ## Quick start
//!
//! ```no_run
//! use emberkv::{Bucket, Config, Cookie, Item, NullSink, Status, Vbid};
//!
//! let mut config = Config::compact();
//! config.data_dir = "ember-data".into();
//! let bucket = Bucket::open(config, Box::new(NullSink))?;
//! bucket.set_vbucket_state(Vbid(0), emberkv::VBucketState::Active);
//!
//! let item = Item::new(Vbid(0), "greeting".into(), "hello".as_bytes().to_vec());
//! let stored = bucket.set(item, emberkv::Cas::WILDCARD, Cookie(1));
//! assert_eq!(stored.status, Status::Success);
//!
//! let got = bucket.get(Vbid(0), &"greeting".into(), Cookie(1));
//! assert_eq!(got.value.as_deref(), Some("hello".as_bytes()));
//! bucket.shutdown();
//! # Ok::<(), emberkv::EngineError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Hash table layer**: lock-striped chained tables, one per vbucket.
//! - **Checkpoint layer**: ordered per-vbucket mutation logs feeding the
//!   persistence cursor.
//! - **Persistence layer**: per-shard flushers and background fetchers
//!   over the [`kvstore::KvStore`] trait.
//! - **Scheduling layer**: a typed executor pool (writer / reader /
//!   auxio / nonio) driving every background task.

pub mod access_scanner;
pub mod bgfetcher;
pub mod bloom;
pub mod bucket;
pub mod checkpoint;
pub mod config;
pub mod cookie;
pub mod defragmenter;
pub mod error;
pub mod executor;
pub mod expiry_pager;
pub mod failover;
pub mod flusher;
pub mod hash_table;
pub mod hlc;
pub mod item;
pub mod item_pager;
pub mod kvstore;
pub mod logging;
pub mod resizer;
pub mod shard;
pub mod stats;
pub mod types;
pub mod vbucket;
pub mod warmup;

// Re-export the main public API.
pub use crate::bucket::{encode_observe, Bucket, ObserveResult};
pub use crate::config::Config;
pub use crate::cookie::{CookieJar, CookieSink, NullSink};
pub use crate::error::{EngineError, Result};
pub use crate::item::{Item, ItemMeta};
pub use crate::stats::StatsSnapshot;
pub use crate::types::{
    Cas, Cookie, Datatype, DocKey, EvictionPolicy, RevSeqno, Seqno, Status, VBucketState, Vbid,
};
pub use crate::vbucket::{GetOutcome, MetaOutcome, MutationOutcome, ObserveKeyState};
