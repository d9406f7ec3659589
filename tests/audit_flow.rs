//! End-to-End Audit Flow
//!
//! Exercises the full pipeline over in-memory buckets: snapshot file →
//! depth model → model-guided sampling → destination verification. A
//! faithful replica audits clean; a perturbed replica is reported.
//!
//! The auditing tests drive the sampler with hand-written models whose
//! pick probability is 1 at the depths that hold candidates, so a walk
//! can never exhaust the tree by unlucky dice.

use chrono::{SecondsFormat, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use repl_audit::{
    AuditConfig, Auditor, Cancel, Constraint, DepthModel, KeyDescriptor, MemoryBucket, Mismatch,
    RetryingLister, SampleSetBuilder,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// A key modified `days_ago` days before now; 3 days is safely inside the
/// default 48h..14d audit window.
fn descriptor(path: &str, etag: &str, size: u64, days_ago: i64) -> KeyDescriptor {
    let modified = Utc::now() - chrono::Duration::days(days_ago);
    KeyDescriptor {
        path: path.to_string(),
        last_modified: modified.to_rfc3339_opts(SecondsFormat::Nanos, true),
        etag: etag.to_string(),
        size,
    }
}

fn population() -> Vec<KeyDescriptor> {
    vec![
        descriptor("a", "E-a", 10, 3),
        descriptor("b/c", "E-bc", 20, 3),
        descriptor("b/d/e", "E-bde", 30, 3),
        descriptor("b/d/f", "E-bdf", 40, 3),
        descriptor("g/h", "E-gh", 50, 3),
    ]
}

async fn model_from_snapshot_file(keys: &[KeyDescriptor]) -> DepthModel {
    let mut snapshot = tempfile::NamedTempFile::new().unwrap();
    for key in keys {
        writeln!(snapshot, "{}", serde_json::to_string(key).unwrap()).unwrap();
    }
    snapshot.flush().unwrap();

    DepthModel::from_snapshot(snapshot.path(), None, &Cancel::new())
        .await
        .unwrap()
}

fn certain_model(levels: &[(usize, u64)], key_count: u64) -> Arc<DepthModel> {
    let depths = levels
        .iter()
        .map(|(level, count)| format!(r#"{{"level":{},"count":{}}}"#, level, count))
        .collect::<Vec<_>>()
        .join(",");
    let doc = format!(r#"{{"depths":[{}],"key_count":{}}}"#, depths, key_count);
    Arc::new(DepthModel::from_reader(doc.as_bytes()).unwrap())
}

type TestLister = Arc<RetryingLister<Arc<MemoryBucket>>>;

fn lister(bucket: &Arc<MemoryBucket>) -> TestLister {
    Arc::new(RetryingLister::new(Arc::clone(bucket)))
}

fn config(check_count: usize) -> AuditConfig {
    let mut cfg = AuditConfig::sample();
    cfg.check_count = check_count;
    cfg.check_frequency = Duration::from_millis(1);
    cfg
}

#[tokio::test]
async fn snapshot_file_builds_the_expected_model() {
    let model = model_from_snapshot_file(&population()).await;
    assert_eq!(model.key_count(), 5);
    assert_eq!(model.depths(), [1, 2, 2]);
    assert_eq!(model.depths().iter().sum::<u64>(), model.key_count());
}

#[tokio::test]
async fn clean_replica_audits_clean() {
    let keys = population();
    let source = Arc::new(MemoryBucket::with_keys("src", keys.clone()));
    let destination = Arc::new(MemoryBucket::with_keys("dst", keys.clone()));

    let auditor = Auditor::new(
        config(1),
        certain_model(&[(0, 5)], 5),
        lister(&source),
        lister(&destination),
        Cancel::new(),
    );

    let mut rng = ChaCha8Rng::seed_from_u64(42);
    auditor
        .audit_once(&mut rng, Utc::now())
        .await
        .expect("a faithful replica should audit without iteration errors");

    for key in &keys {
        let outcome = auditor.verify_key(key).await.unwrap();
        assert_eq!(outcome, None, "unexpected mismatch for {}", key.path);
    }
}

#[tokio::test]
async fn perturbed_replica_is_reported() {
    let keys = population();
    let source = Arc::new(MemoryBucket::with_keys("src", keys.clone()));
    let destination = Arc::new(MemoryBucket::with_keys("dst", keys.clone()));

    // Replication lost one key and corrupted another.
    destination.remove("b/c");
    destination.insert(descriptor("g/h", "E-corrupted", 50, 3));

    let auditor = Auditor::new(
        config(1),
        certain_model(&[(0, 5)], 5),
        lister(&source),
        lister(&destination),
        Cancel::new(),
    );

    // Mismatches are reported through the log, never as iteration errors.
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    auditor.audit_once(&mut rng, Utc::now()).await.unwrap();

    let missing = auditor.verify_key(&keys[1]).await.unwrap();
    assert_eq!(missing, Some(Mismatch::Missing));

    let corrupted = auditor.verify_key(&keys[4]).await.unwrap();
    match corrupted {
        Some(Mismatch::Fields {
            etag: Some((want, got)),
            size: None,
        }) => {
            assert_eq!(want, "E-gh");
            assert_eq!(got, "E-corrupted");
        }
        other => panic!("expected an etag mismatch, got {:?}", other),
    }

    let untouched = auditor.verify_key(&keys[0]).await.unwrap();
    assert_eq!(untouched, None);
}

#[tokio::test]
async fn sampling_honors_the_time_window() {
    // Both depth-0 keys fall outside the window, so every walk must
    // descend and return one of the in-window keys a level down.
    let keys = vec![
        descriptor("too-young", "E-y", 1, 0),
        descriptor("too-old", "E-o", 1, 90),
        descriptor("b/c", "E-bc", 20, 3),
        descriptor("g/h", "E-gh", 50, 3),
    ];
    let source = Arc::new(MemoryBucket::with_keys("src", keys));

    let now = Utc::now();
    let oldest = now - chrono::Duration::days(14);
    let youngest = now - chrono::Duration::hours(48);
    let accept: Constraint = Arc::new(move |key: &KeyDescriptor| {
        match chrono::DateTime::parse_from_rfc3339(&key.last_modified) {
            Ok(t) => {
                let t = t.with_timezone(&Utc);
                t > oldest && t < youngest
            }
            Err(_) => false,
        }
    });

    let builder = SampleSetBuilder::new(certain_model(&[(0, 0), (1, 4)], 4), lister(&source), Cancel::new());
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let sampled = builder.collect(&mut rng, &accept, 1).await.unwrap();

    assert_eq!(sampled.len(), 1);
    for key in &sampled {
        assert!(
            key.path == "b/c" || key.path == "g/h",
            "sampled an out-of-window key: {}",
            key.path
        );
    }
}
