//! S3 Lister
//!
//! Production `BucketLister` on top of the `object_store` crate's AWS
//! backend. Works against S3 proper and S3-compatible services.
//!
//! `object_store` only supports `/` as a delimiter, which is the only
//! delimiter this crate uses.

use crate::config::AwsConfig;
use crate::store::{BucketLister, KeyDescriptor, ListError, ListPage};
use chrono::SecondsFormat;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub struct S3Lister {
    name: String,
    store: Arc<dyn ObjectStore>,
}

impl S3Lister {
    /// Build a lister for one bucket from its config.
    pub fn open(cfg: &AwsConfig) -> Result<Self, ListError> {
        let store = AmazonS3Builder::new()
            .with_bucket_name(&cfg.bucket)
            .with_region(&cfg.region)
            .with_access_key_id(&cfg.access_key)
            .with_secret_access_key(&cfg.secret_key)
            .build()
            .map_err(|e| ListError::Store(e.to_string()))?;
        Ok(S3Lister {
            name: cfg.bucket.clone(),
            store: Arc::new(store),
        })
    }

    /// Wrap an existing store, for S3-compatible test doubles.
    pub fn from_store(name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        S3Lister {
            name: name.into(),
            store,
        }
    }

    fn map_error(err: object_store::Error) -> ListError {
        ListError::Store(err.to_string())
    }
}

impl std::fmt::Debug for S3Lister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Lister").field("name", &self.name).finish()
    }
}

fn to_descriptor(meta: ObjectMeta) -> KeyDescriptor {
    KeyDescriptor {
        path: meta.location.to_string(),
        last_modified: meta
            .last_modified
            .to_rfc3339_opts(SecondsFormat::Nanos, true),
        etag: meta.e_tag.unwrap_or_default(),
        size: meta.size as u64,
    }
}

impl BucketLister for S3Lister {
    fn name(&self) -> &str {
        &self.name
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        delimiter: Option<&'a str>,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<ListPage, ListError>> + Send + 'a>> {
        Box::pin(async move {
            let location = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));

            match delimiter {
                Some(_) => {
                    let listed = self
                        .store
                        .list_with_delimiter(location.as_ref())
                        .await
                        .map_err(Self::map_error)?;
                    let mut contents: Vec<KeyDescriptor> =
                        listed.objects.into_iter().map(to_descriptor).collect();
                    contents.truncate(max);
                    let common_prefixes = listed
                        .common_prefixes
                        .into_iter()
                        .map(|p| format!("{}/", p))
                        .collect();
                    Ok(ListPage {
                        contents,
                        common_prefixes,
                    })
                }
                None => {
                    let mut stream = self.store.list(location.as_ref());
                    let mut contents = Vec::with_capacity(max.min(1024));
                    while let Some(meta) = stream.next().await {
                        contents.push(to_descriptor(meta.map_err(Self::map_error)?));
                        if contents.len() >= max {
                            break;
                        }
                    }
                    Ok(ListPage {
                        contents,
                        common_prefixes: Vec::new(),
                    })
                }
            }
        })
    }
}
