//! Bucket Listing Abstractions
//!
//! The sampler and the comparator only ever need one storage capability:
//! list a prefix and get back the immediate child keys plus the first-level
//! sub-prefixes. `BucketLister` captures that contract; `S3Lister` is the
//! production implementation and `MemoryBucket` backs the tests.
//!
//! Every listing issued by the core goes through `RetryingLister`, which
//! bounds transient failures to `RETRY_LIMIT` attempts per call.

pub mod memory;
pub mod s3;

pub use memory::MemoryBucket;
pub use s3::S3Lister;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Maximum number of keys accepted from one listing call.
pub const MAX_LIST: usize = 10_000;

/// Attempts per listing before the most recent error is surfaced.
pub const RETRY_LIMIT: u32 = 10;

const BACKOFF_STEP: Duration = Duration::from_millis(50);
const BACKOFF_CAP: Duration = Duration::from_millis(500);

/// One object's metadata, as observed in a bucket listing or in a snapshot
/// record.
///
/// Equality and hashing cover all four fields; the sample-set builder
/// collects descriptors into a set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyDescriptor {
    /// Object key, partitioned by `/`.
    pub path: String,
    /// Modification timestamp in RFC3339-with-nanoseconds lexical form,
    /// as S3 reports it.
    pub last_modified: String,
    /// Opaque content fingerprint.
    pub etag: String,
    /// Object size in bytes.
    pub size: u64,
}

impl KeyDescriptor {
    /// Number of `/` separators in the path, with no normalization:
    /// `"a/b/c.txt"` is depth 2 and `"/a"` is depth 1.
    pub fn depth(&self) -> usize {
        self.path.matches('/').count()
    }
}

/// Result of listing one prefix.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Keys that are immediate children of the prefix (or all keys under
    /// it, for a delimiter-less listing).
    pub contents: Vec<KeyDescriptor>,
    /// Distinct first-level sub-prefixes under the prefix, each ending in
    /// the delimiter.
    pub common_prefixes: Vec<String>,
}

/// Error from a bucket listing.
#[derive(Debug)]
pub enum ListError {
    /// The backing store failed or rejected the call.
    Store(String),
    /// I/O failure reaching the store.
    Io(std::io::Error),
}

impl std::fmt::Display for ListError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListError::Store(msg) => write!(f, "listing failed: {}", msg),
            ListError::Io(e) => write!(f, "listing I/O error: {}", e),
        }
    }
}

impl std::error::Error for ListError {}

impl From<std::io::Error> for ListError {
    fn from(e: std::io::Error) -> Self {
        ListError::Io(e)
    }
}

/// The listing capability the core consumes.
///
/// Implementations must be callable concurrently; all methods take
/// `&self`. The only delimiter used by this crate is `/`.
pub trait BucketLister: Send + Sync + 'static {
    /// Bucket name, for log context.
    fn name(&self) -> &str;

    /// Return up to `max` keys under `prefix`. With a delimiter, contents
    /// are the immediate children and `common_prefixes` the first-level
    /// sub-prefixes; without one, the listing is flat and
    /// `common_prefixes` is empty.
    fn list<'a>(
        &'a self,
        prefix: &'a str,
        delimiter: Option<&'a str>,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<ListPage, ListError>> + Send + 'a>>;
}

impl<L: BucketLister> BucketLister for Arc<L> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        delimiter: Option<&'a str>,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<ListPage, ListError>> + Send + 'a>> {
        (**self).list(prefix, delimiter, max)
    }
}

/// Bounded-retry wrapper around a lister.
///
/// The first successful response short-circuits further attempts; after
/// `limit` failures the most recent error is returned. Backoff is linear
/// and capped, so a call never blocks indefinitely.
#[derive(Debug)]
pub struct RetryingLister<L> {
    inner: L,
    limit: u32,
}

impl<L: BucketLister> RetryingLister<L> {
    pub fn new(inner: L) -> Self {
        RetryingLister {
            inner,
            limit: RETRY_LIMIT,
        }
    }

    pub fn with_limit(inner: L, limit: u32) -> Self {
        RetryingLister {
            inner,
            limit: limit.max(1),
        }
    }
}

impl<L: BucketLister> BucketLister for RetryingLister<L> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        delimiter: Option<&'a str>,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<ListPage, ListError>> + Send + 'a>> {
        Box::pin(async move {
            let mut last_err = None;
            for attempt in 1..=self.limit {
                match self.inner.list(prefix, delimiter, max).await {
                    Ok(page) => return Ok(page),
                    Err(err) => {
                        debug!(
                            bucket = self.inner.name(),
                            prefix,
                            attempt,
                            error = %err,
                            "listing attempt failed"
                        );
                        last_err = Some(err);
                        if attempt < self.limit {
                            let step = BACKOFF_STEP.saturating_mul(attempt);
                            tokio::time::sleep(step.min(BACKOFF_CAP)).await;
                        }
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| ListError::Store("no attempts made".to_string())))
        })
    }
}
