//! Core identifier and enumeration types shared across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-vbucket mutation sequence number. Monotonic within a vbucket.
pub type Seqno = u64;

/// Per-key revision sequence number, used for conflict resolution.
pub type RevSeqno = u64;

/// Virtual bucket identifier. A bucket's key space is statically
/// partitioned across a fixed number of vbuckets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vbid(pub u16);

impl fmt::Display for Vbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vb:{}", self.0)
    }
}

/// 64-bit compare-and-swap token produced by a vbucket's hybrid logical
/// clock. Doubles as a per-mutation version for client checks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cas(pub u64);

impl Cas {
    /// Sentinel CAS reported to clients while a key is locked. Never
    /// persisted and never handed to replication producers.
    pub const LOCKED: Cas = Cas(u64::MAX);

    /// CAS wildcard: the client does not care about the stored version.
    pub const WILDCARD: Cas = Cas(0);

    /// True if this is the wildcard (zero) CAS.
    pub fn is_wildcard(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Datatype bitmask carried on every item and persisted exactly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Datatype(pub u8);

impl Datatype {
    /// Uninterpreted bytes.
    pub const RAW: Datatype = Datatype(0x0);
    /// Value is JSON.
    pub const JSON: Datatype = Datatype(0x1);
    /// Value is snappy-compressed.
    pub const SNAPPY: Datatype = Datatype(0x2);
    /// Value carries an extended-attribute span.
    pub const XATTR: Datatype = Datatype(0x4);

    /// Returns true if every bit of `other` is set in `self`.
    pub fn contains(self, other: Datatype) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of the two bitmasks.
    pub fn with(self, other: Datatype) -> Datatype {
        Datatype(self.0 | other.0)
    }

    /// Returns `self` with the bits of `other` cleared.
    pub fn without(self, other: Datatype) -> Datatype {
        Datatype(self.0 & !other.0)
    }
}

/// Lifecycle state of a vbucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VBucketState {
    /// Owns the key range: serves reads and writes.
    Active,
    /// Receives replicated mutations only; client ops are refused.
    Replica,
    /// In transfer: client writes block until the state settles.
    Pending,
    /// Being torn down: every data operation is refused.
    Dead,
}

impl VBucketState {
    /// Short lowercase name, matching the persisted representation.
    pub fn as_str(self) -> &'static str {
        match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        }
    }

    /// Whether a transition from `self` to `to` is legal:
    /// active <-> replica <-> pending, and any state -> dead.
    pub fn can_transition_to(self, to: VBucketState) -> bool {
        if to == VBucketState::Dead || self == to {
            return true;
        }
        !matches!(self, VBucketState::Dead)
    }
}

impl fmt::Display for VBucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item eviction policy for the whole bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Eviction drops the value blob but keeps key metadata in memory.
    ValueOnly,
    /// Eviction removes the whole item from memory; metadata lives on disk.
    FullEviction,
}

/// Document key. Keys are opaque byte strings.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey(Box<[u8]>);

impl DocKey {
    /// Wraps raw key bytes.
    pub fn new(bytes: impl Into<Box<[u8]>>) -> DocKey {
        DocKey(bytes.into())
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the (unusual but legal) empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for DocKey {
    fn from(s: &str) -> DocKey {
        DocKey(s.as_bytes().into())
    }
}

impl From<&[u8]> for DocKey {
    fn from(b: &[u8]) -> DocKey {
        DocKey(b.into())
    }
}

impl From<Vec<u8>> for DocKey {
    fn from(b: Vec<u8>) -> DocKey {
        DocKey(b.into_boxed_slice())
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocKey({})", String::from_utf8_lossy(&self.0))
    }
}

/// Opaque token identifying a suspended frontend call. The engine never
/// inspects it; it is handed back through [`crate::cookie::CookieSink`]
/// when the blocked operation can be retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cookie(pub u64);

/// Client-visible outcome of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// The operation completed.
    Success,
    /// No such key (or the key is a tombstone and the op wants live data).
    KeyNotFound,
    /// CAS mismatch, or `add` on an existing key.
    KeyExists,
    /// The vbucket is not in a state that serves this operation here.
    NotMyVbucket,
    /// Transient refusal: degraded mode, commit failure, back-pressure.
    TempFailure,
    /// Memory quota exhausted and the pager has not yet freed space.
    NoMemory,
    /// The operation suspended; the cookie will be notified when it can
    /// be retried (background fetch or pending vbucket).
    WouldBlock,
    /// The key is locked by GETL and the supplied CAS does not unlock it.
    Locked,
    /// Malformed or out-of-range argument.
    InvalidArgument,
    /// The engine does not implement the requested behavior.
    NotSupported,
    /// The client's seqno lies beyond a failover point and must roll back.
    Rollback,
}

impl Status {
    /// True only for [`Status::Success`].
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}
