//! Suspended-operation plumbing.
//!
//! A frontend call that cannot complete in place (background fetch,
//! pending vbucket) returns [`Status::WouldBlock`] and leaves its cookie
//! with the engine. When the blocking condition clears, the engine calls
//! back through [`CookieSink::notify_io_complete`] and the frontend
//! retries the command. This is explicit continuation passing, not
//! language-level async: the waiter state is a map keyed by cookie.

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::types::{Cookie, Status};

/// Callbacks the embedding frontend provides.
pub trait CookieSink: Send + Sync {
    /// Resumes a suspended call. `status` is [`Status::Success`] when the
    /// command should be retried, or a terminal status (for example
    /// [`Status::NotMyVbucket`] when the vbucket went away first).
    fn notify_io_complete(&self, cookie: Cookie, status: Status);
}

/// A sink that drops notifications; for tooling and tests that poll.
pub struct NullSink;

impl CookieSink for NullSink {
    fn notify_io_complete(&self, _cookie: Cookie, _status: Status) {}
}

/// Engine-side cookie bookkeeping: the notify callback plus a small
/// per-cookie scratch area (`store_engine_specific`) for carrying state
/// between the suspension and the retry.
pub struct CookieJar {
    sink: Box<dyn CookieSink>,
    specific: Mutex<FxHashMap<Cookie, Bytes>>,
}

impl CookieJar {
    /// Wraps the frontend's sink.
    pub fn new(sink: Box<dyn CookieSink>) -> CookieJar {
        CookieJar { sink, specific: Mutex::new(FxHashMap::default()) }
    }

    /// Notifies a suspended cookie.
    pub fn notify(&self, cookie: Cookie, status: Status) {
        trace!(cookie = cookie.0, ?status, "cookie.notify");
        self.sink.notify_io_complete(cookie, status);
    }

    /// Attaches scratch data to a cookie until the retry collects it.
    pub fn store_engine_specific(&self, cookie: Cookie, data: Bytes) {
        self.specific.lock().insert(cookie, data);
    }

    /// Takes (and clears) the scratch data for a cookie.
    pub fn take_engine_specific(&self, cookie: Cookie) -> Option<Bytes> {
        self.specific.lock().remove(&cookie)
    }
}
