//! In-Memory Bucket
//!
//! A `BTreeMap`-backed bucket with real delimiter semantics, used by the
//! unit and integration tests and for local experimentation. Failures can
//! be scripted to exercise the retry wrapper.

use crate::store::{BucketLister, KeyDescriptor, ListError, ListPage};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub struct MemoryBucket {
    name: String,
    keys: RwLock<BTreeMap<String, KeyDescriptor>>,
    fail_next: AtomicU32,
    list_calls: AtomicU64,
}

impl MemoryBucket {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryBucket {
            name: name.into(),
            keys: RwLock::new(BTreeMap::new()),
            fail_next: AtomicU32::new(0),
            list_calls: AtomicU64::new(0),
        }
    }

    pub fn with_keys(name: impl Into<String>, keys: impl IntoIterator<Item = KeyDescriptor>) -> Self {
        let bucket = MemoryBucket::new(name);
        for key in keys {
            bucket.insert(key);
        }
        bucket
    }

    pub fn insert(&self, key: KeyDescriptor) {
        self.keys.write().insert(key.path.clone(), key);
    }

    pub fn remove(&self, path: &str) -> Option<KeyDescriptor> {
        self.keys.write().remove(path)
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// Make the next `n` list calls fail with a scripted error.
    pub fn fail_next_lists(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total list calls observed, including failed ones.
    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn list_sync(&self, prefix: &str, delimiter: Option<&str>, max: usize) -> Result<ListPage, ListError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted {
            return Err(ListError::Store(format!(
                "scripted failure listing {:?} in bucket {:?}",
                prefix, self.name
            )));
        }

        let keys = self.keys.read();
        let mut contents = Vec::new();
        let mut prefixes = BTreeSet::new();

        for (path, key) in keys.range(prefix.to_string()..) {
            let suffix = match path.strip_prefix(prefix) {
                Some(suffix) => suffix,
                None => break,
            };
            match delimiter.and_then(|d| suffix.find(d).map(|at| (d, at))) {
                Some((delimiter, at)) => {
                    prefixes.insert(format!("{}{}", prefix, &suffix[..at + delimiter.len()]));
                }
                None => contents.push(key.clone()),
            }
        }

        contents.truncate(max);
        Ok(ListPage {
            contents,
            common_prefixes: prefixes.into_iter().collect(),
        })
    }
}

impl BucketLister for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        delimiter: Option<&'a str>,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<ListPage, ListError>> + Send + 'a>> {
        Box::pin(async move { self.list_sync(prefix, delimiter, max) })
    }
}
