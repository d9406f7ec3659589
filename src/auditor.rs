//! Continuous Replication Audit
//!
//! The auditor owns the depth model and both bucket listers. Every tick it
//! derives a modification-time window, samples `check_count` keys from the
//! source, and checks each one against the destination. Mismatches are
//! reported through the log and are never fatal; a failed iteration is
//! retried on the next tick. The loop ends only on cancellation.
//!
//! Keys younger than `check_youngest` are excluded because replication may
//! not have caught up with them yet; keys older than `check_oldest` are
//! assumed to have been audited by earlier runs.

use crate::cancel::Cancel;
use crate::config::AuditConfig;
use crate::model::DepthModel;
use crate::sampler::{Constraint, SampleError, SampleSetBuilder};
use crate::store::{BucketLister, KeyDescriptor, ListError};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Error that aborts one audit iteration.
#[derive(Debug)]
pub enum AuditError {
    /// Sampling the source bucket failed.
    Sample(SampleError),
    /// Listing the destination bucket failed.
    List(ListError),
}

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditError::Sample(e) => {
                write!(f, "couldn't sample keys from source bucket: {}", e)
            }
            AuditError::List(e) => {
                write!(f, "couldn't verify keys in destination bucket: {}", e)
            }
        }
    }
}

impl std::error::Error for AuditError {}

impl From<SampleError> for AuditError {
    fn from(e: SampleError) -> Self {
        AuditError::Sample(e)
    }
}

impl From<ListError> for AuditError {
    fn from(e: ListError) -> Self {
        AuditError::List(e)
    }
}

/// How one sampled key disagrees with the destination bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    /// No destination object matched the key.
    Missing,
    /// More than one destination object matched the key.
    Ambiguous { matches: usize },
    /// Exactly one destination object matched but its fingerprint
    /// differs. Each differing field carries `(want, got)`.
    Fields {
        etag: Option<(String, String)>,
        size: Option<(u64, u64)>,
    },
}

/// Compare a sampled key against the destination objects its path
/// matched.
fn classify(want: &KeyDescriptor, got: &[KeyDescriptor]) -> Option<Mismatch> {
    match got {
        [] => Some(Mismatch::Missing),
        [only] => {
            let etag = (want.etag != only.etag).then(|| (want.etag.clone(), only.etag.clone()));
            let size = (want.size != only.size).then_some((want.size, only.size));
            if etag.is_some() || size.is_some() {
                Some(Mismatch::Fields { etag, size })
            } else {
                None
            }
        }
        many => Some(Mismatch::Ambiguous { matches: many.len() }),
    }
}

/// Acceptance window over key modification times: strictly after `oldest`
/// and strictly before `youngest`. Keys whose timestamp does not parse are
/// rejected.
pub(crate) fn window_constraint(oldest: DateTime<Utc>, youngest: DateTime<Utc>) -> Constraint {
    Arc::new(move |key: &KeyDescriptor| {
        let modtime = match DateTime::parse_from_rfc3339(&key.last_modified) {
            Ok(t) => t.with_timezone(&Utc),
            Err(err) => {
                warn!(
                    key = %key.path,
                    error = %err,
                    "couldn't parse last_modified time for this key"
                );
                return false;
            }
        };
        if modtime <= oldest {
            debug!(%modtime, "decided it's too old");
            return false;
        }
        if modtime >= youngest {
            debug!(%modtime, "decided it's too young");
            return false;
        }
        debug!(%modtime, "right time range");
        true
    })
}

/// `now - back`, clamped instead of overflowing on absurd windows.
fn window_bound(now: DateTime<Utc>, back: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(back)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The periodic audit driver.
pub struct Auditor<L> {
    cfg: AuditConfig,
    model: Arc<DepthModel>,
    source: L,
    destination: L,
    cancel: Cancel,
}

impl<L: BucketLister + Clone> Auditor<L> {
    pub fn new(
        cfg: AuditConfig,
        model: Arc<DepthModel>,
        source: L,
        destination: L,
        cancel: Cancel,
    ) -> Auditor<L> {
        if let Some(bucket) = model.bucket() {
            if bucket != cfg.source.bucket {
                warn!(
                    model_bucket = bucket,
                    source_bucket = %cfg.source.bucket,
                    "model was built for a different bucket"
                );
            }
        }
        Auditor {
            cfg,
            model,
            source,
            destination,
            cancel,
        }
    }

    /// Audit at `check_frequency` until cancelled. Iteration failures are
    /// logged and retried on the next tick, so a transient S3 outage does
    /// not kill a long-running audit.
    pub async fn run(&self) {
        let mut rng = ChaCha8Rng::seed_from_u64(self.cfg.random_seed as u64);
        let mut tick = tokio::time::interval(self.cfg.check_frequency);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Consume the interval's immediate first tick; the first audit
        // starts right away below.
        tick.tick().await;

        info!("starting auditor");
        loop {
            let now = Utc::now();
            info!("starting an audit");
            if let Err(err) = self.audit_once(&mut rng, now).await {
                error!(error = %err, "audit iteration failed");
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!("auditor stopping");
                    return;
                }
                _ = tick.tick() => {}
            }
        }
    }

    /// Run exactly one audit iteration against the window anchored at
    /// `now`.
    pub async fn audit_once(
        &self,
        rng: &mut ChaCha8Rng,
        now: DateTime<Utc>,
    ) -> Result<(), AuditError> {
        let oldest = window_bound(now, self.cfg.check_oldest);
        let youngest = window_bound(now, self.cfg.check_youngest);
        let accept = window_constraint(oldest, youngest);

        info!(
            count = self.cfg.check_count,
            bucket = self.source.name(),
            "randomly sampling keys from source bucket"
        );
        let builder = SampleSetBuilder::new(
            Arc::clone(&self.model),
            self.source.clone(),
            self.cancel.clone(),
        );
        let keys = builder.collect(rng, &accept, self.cfg.check_count).await?;

        info!(
            bucket = self.destination.name(),
            "verifying all keys match in destination bucket"
        );
        for key in &keys {
            if self.cancel.is_cancelled() {
                warn!("aborting verification that keys match");
                return Ok(());
            }
            self.verify_key(key).await?;
        }
        Ok(())
    }

    /// Look one sampled key up in the destination and report how it
    /// disagrees, if it does. Mismatches are logged, never fatal; listing
    /// errors propagate.
    pub async fn verify_key(&self, want: &KeyDescriptor) -> Result<Option<Mismatch>, AuditError> {
        debug!(key = %want.path, "verifying a key");
        let page = self.destination.list(&want.path, None, 1).await?;
        let mismatch = classify(want, &page.contents);
        match &mismatch {
            Some(Mismatch::Missing) => {
                error!(key = %want.path, "mismatch at key, no match in destination");
            }
            Some(Mismatch::Ambiguous { matches }) => {
                error!(
                    key = %want.path,
                    matches,
                    "mismatch at key, more than one match in destination"
                );
            }
            Some(Mismatch::Fields { etag, size }) => {
                error!(
                    key = %want.path,
                    want.etag = etag.as_ref().map(|(w, _)| w.as_str()),
                    got.etag = etag.as_ref().map(|(_, g)| g.as_str()),
                    want.size = size.map(|(w, _)| w),
                    got.size = size.map(|(_, g)| g),
                    "mismatch at key, different properties"
                );
            }
            None => {}
        }
        Ok(mismatch)
    }
}
