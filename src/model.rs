//! Bucket Depth Model
//!
//! A compact statistical summary of a bucket's key population: for each
//! depth (number of `/` separators in the key path), the number of keys
//! observed at exactly that depth, plus the total key count. The model is
//! built once from a snapshot, persisted as a JSON document, and consulted
//! read-only by every sampling walk.
//!
//! Invariants: the depth table is dense from 0 to the maximum observed
//! depth (zero entries permitted), its counts sum to `key_count`, and the
//! model never changes after construction.

use crate::cancel::Cancel;
use crate::config::to_indented_json;
use crate::snapshot::{open_snapshot, KeyStream, SnapshotError};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tracing::{info, warn};

/// Depth-indexed frequency table for one bucket snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ModelDoc", into = "ModelDoc")]
pub struct DepthModel {
    bucket: Option<String>,
    depths: Vec<u64>,
    key_count: u64,
}

impl DepthModel {
    /// Consume a key stream into a model. On cancellation the stream is
    /// abandoned and the model built so far is returned; its invariants
    /// hold for the keys actually consumed.
    pub async fn build(stream: &mut KeyStream, cancel: &Cancel) -> DepthModel {
        DepthModel::build_named(None, stream, cancel).await
    }

    /// `build`, recording which bucket the snapshot came from.
    pub async fn build_named(
        bucket: Option<String>,
        stream: &mut KeyStream,
        cancel: &Cancel,
    ) -> DepthModel {
        info!("computing model...");
        let mut depths: Vec<u64> = Vec::new();
        let mut key_count = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("aborting build of model");
                    break;
                }
                next = stream.recv() => {
                    let key = match next {
                        Some(key) => key,
                        None => break,
                    };
                    let depth = key.depth();
                    if depth >= depths.len() {
                        depths.resize(depth + 1, 0);
                    }
                    depths[depth] += 1;
                    key_count += 1;
                }
            }
        }

        info!(key_count, max_depth = depths.len().saturating_sub(1), "done!");
        DepthModel {
            bucket,
            depths,
            key_count,
        }
    }

    /// Build a model straight from a snapshot file. A decode error in the
    /// snapshot is fatal here, unlike cancellation.
    pub async fn from_snapshot(
        path: &Path,
        bucket: Option<String>,
        cancel: &Cancel,
    ) -> Result<DepthModel, SnapshotError> {
        let input = open_snapshot(path)?;
        let mut stream = KeyStream::spawn(input, cancel.clone());
        let model = DepthModel::build_named(bucket, &mut stream, cancel).await;
        stream.finish().await?;
        Ok(model)
    }

    /// Load a previously persisted model document.
    pub fn from_reader(reader: impl io::Read) -> Result<DepthModel, serde_json::Error> {
        serde_json::from_reader(reader)
    }

    /// Render the document the way it is persisted on disk.
    pub fn to_document(&self) -> Result<String, serde_json::Error> {
        to_indented_json(self)
    }

    /// Bucket the snapshot was captured from, when recorded.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    pub fn depths(&self) -> &[u64] {
        &self.depths
    }

    /// Empirical probability that a snapshot key lies at `depth`. Depths
    /// beyond the table are unpredictable by the model and get 0, which
    /// makes the sampler recurse instead of picking.
    pub fn probability(&self, depth: usize) -> f64 {
        if depth >= self.depths.len() {
            warn!(depth, "depth not predictable by model");
            return 0.0;
        }
        if self.key_count == 0 {
            return 0.0;
        }
        self.depths[depth] as f64 / self.key_count as f64
    }
}

/// On-disk form: one `{level, count}` record per defined level, so the
/// document stays readable and diffable for operators.
#[derive(Debug, Serialize, Deserialize)]
struct ModelDoc {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    bucket_name: Option<String>,
    depths: Vec<DepthLevel>,
    key_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DepthLevel {
    level: usize,
    count: u64,
}

impl From<DepthModel> for ModelDoc {
    fn from(model: DepthModel) -> ModelDoc {
        ModelDoc {
            bucket_name: model.bucket,
            depths: model
                .depths
                .iter()
                .enumerate()
                .map(|(level, &count)| DepthLevel { level, count })
                .collect(),
            key_count: model.key_count,
        }
    }
}

impl From<ModelDoc> for DepthModel {
    fn from(doc: ModelDoc) -> DepthModel {
        // Tolerate sparse documents and levels in any order; gaps are
        // zero-count levels.
        let len = doc
            .depths
            .iter()
            .map(|d| d.level + 1)
            .max()
            .unwrap_or(0);
        let mut depths = vec![0u64; len];
        for level in doc.depths {
            depths[level.level] = level.count;
        }
        DepthModel {
            bucket: doc.bucket_name,
            depths,
            key_count: doc.key_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn model_of(paths: &[&str]) -> DepthModel {
        let input = paths
            .iter()
            .map(|p| {
                format!(
                    r#"{{"path":{:?},"last_modified":"2026-01-01T00:00:00.000000000Z","etag":"e","size":0}}"#,
                    p
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let cancel = Cancel::new();
        let mut stream = KeyStream::spawn(Cursor::new(input), cancel.clone());
        let model = DepthModel::build(&mut stream, &cancel).await;
        stream.finish().await.unwrap();
        model
    }

    #[tokio::test]
    async fn counts_keys_by_depth() {
        let model = model_of(&["a", "b/c", "b/d/e"]).await;
        assert_eq!(model.key_count(), 3);
        assert_eq!(model.depths(), [1, 1, 1]);
    }

    #[tokio::test]
    async fn zero_fills_unobserved_depths() {
        let model = model_of(&["a", "b/c/d"]).await;
        assert_eq!(model.depths(), [1, 0, 1]);
        assert_eq!(model.key_count(), 2);
    }

    #[tokio::test]
    async fn counts_sum_to_key_count() {
        let model = model_of(&["a", "b", "c/d", "c/e/f", "g/h"]).await;
        assert_eq!(model.depths().iter().sum::<u64>(), model.key_count());
    }

    #[tokio::test]
    async fn document_round_trips() {
        let model = model_of(&["a", "b/c", "b/d/e"]).await;
        let doc = model.to_document().unwrap();
        let loaded = DepthModel::from_reader(doc.as_bytes()).unwrap();
        assert_eq!(loaded, model);
    }

    #[tokio::test]
    async fn document_is_indented_with_three_spaces() {
        let model = model_of(&["a"]).await;
        let doc = model.to_document().unwrap();
        assert!(doc.contains("\n   \"depths\""), "got:\n{}", doc);
    }

    #[test]
    fn deserialization_tolerates_sparse_unordered_levels() {
        let doc = r#"{
           "depths": [
              {"level": 3, "count": 7},
              {"level": 0, "count": 2}
           ],
           "key_count": 9
        }"#;
        let model = DepthModel::from_reader(doc.as_bytes()).unwrap();
        assert_eq!(model.depths(), [2, 0, 0, 7]);
        assert_eq!(model.key_count(), 9);
    }

    #[test]
    fn bucket_name_is_optional_metadata() {
        let doc = r#"{"bucket_name": "prod-photos", "depths": [{"level": 0, "count": 1}], "key_count": 1}"#;
        let model = DepthModel::from_reader(doc.as_bytes()).unwrap();
        assert_eq!(model.bucket(), Some("prod-photos"));

        let doc = r#"{"depths": [], "key_count": 0}"#;
        let model = DepthModel::from_reader(doc.as_bytes()).unwrap();
        assert_eq!(model.bucket(), None);
    }

    #[tokio::test]
    async fn probability_is_per_depth_frequency() {
        let model = model_of(&["a", "b", "c/d", "c/e/f"]).await;
        assert_eq!(model.probability(0), 0.5);
        assert_eq!(model.probability(1), 0.25);
        assert_eq!(model.probability(2), 0.25);
        assert_eq!(model.probability(17), 0.0);
    }

    #[test]
    fn probability_of_empty_model_is_zero() {
        let model = DepthModel::from_reader(r#"{"depths": [], "key_count": 0}"#.as_bytes()).unwrap();
        assert_eq!(model.probability(0), 0.0);
    }

    #[tokio::test]
    async fn cancellation_keeps_the_partial_model_valid() {
        let cancel = Cancel::new();
        cancel.cancel();
        let input = r#"{"path":"a","last_modified":"t","etag":"e","size":0}"#;
        let mut stream = KeyStream::spawn(Cursor::new(input.to_string()), cancel.clone());
        let model = DepthModel::build(&mut stream, &cancel).await;
        assert_eq!(model.depths().iter().sum::<u64>(), model.key_count());
        let _ = stream.finish().await;
    }
}
