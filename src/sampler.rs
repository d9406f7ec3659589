//! Model-Guided Random Walk Sampling
//!
//! Draws keys from a live bucket without ever listing it in full. A walk
//! starts at the root, lists one prefix at a time, and either picks a
//! candidate key with the model's per-depth probability or descends into a
//! randomly-ordered sub-prefix. The sample-set builder runs walks
//! concurrently until it has the requested number of distinct keys.
//!
//! The walk approximates uniform sampling: shallow keys get more chances
//! to be picked than deep ones, and the per-depth probability compensates
//! by picking keys at overrepresented depths proportionally less often per
//! candidate examined. Strict uniformity is not claimed.

use crate::cancel::Cancel;
use crate::model::DepthModel;
use crate::store::{BucketLister, KeyDescriptor, ListError, MAX_LIST};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Acceptance predicate applied to every candidate key, shared across
/// concurrent walks.
pub type Constraint = Arc<dyn Fn(&KeyDescriptor) -> bool + Send + Sync>;

/// Consecutive rounds allowed to add no new key before the build fails.
/// One unlucky round is common when the deficit is small; this many in a
/// row means the namespace cannot fill the request.
const STALL_LIMIT: u32 = 8;

/// Error from sampling.
#[derive(Debug)]
pub enum SampleError {
    /// A listing failed even after retries.
    List(ListError),
    /// The whole tree was traversed without choosing a key.
    NoKeySelected,
    /// A full sampling round produced no new distinct key; the namespace
    /// holds fewer matching keys than requested.
    Underflow { want: usize, have: usize },
}

impl std::fmt::Display for SampleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleError::List(e) => write!(f, "sampling aborted by listing failure: {}", e),
            SampleError::NoKeySelected => {
                write!(f, "traversed whole bucket without choosing a key")
            }
            SampleError::Underflow { want, have } => write!(
                f,
                "sampling stalled at {} of {} distinct keys",
                have, want
            ),
        }
    }
}

impl std::error::Error for SampleError {}

impl From<ListError> for SampleError {
    fn from(e: ListError) -> Self {
        SampleError::List(e)
    }
}

/// One random walk over the bucket tree. Each walk owns its RNG, so
/// concurrent walks never contend on shared state.
pub struct RandomWalk<L> {
    model: Arc<DepthModel>,
    lister: L,
    cancel: Cancel,
    rng: ChaCha8Rng,
}

impl<L: BucketLister> RandomWalk<L> {
    pub fn new(model: Arc<DepthModel>, lister: L, seed: u64, cancel: Cancel) -> Self {
        RandomWalk {
            model,
            lister,
            cancel,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Draw one key matching `accept`, starting from the root.
    ///
    /// Returns `Ok(None)` when cancelled; `NoKeySelected` when the whole
    /// tree was exhausted without a pick.
    pub async fn draw(&mut self, accept: &Constraint) -> Result<Option<KeyDescriptor>, SampleError> {
        match self.walk(0, "/".to_string(), accept).await? {
            Some(key) => Ok(Some(key)),
            None if self.cancel.is_cancelled() => Ok(None),
            None => Err(SampleError::NoKeySelected),
        }
    }

    fn walk<'a>(
        &'a mut self,
        depth: usize,
        prefix: String,
        accept: &'a Constraint,
    ) -> Pin<Box<dyn Future<Output = Result<Option<KeyDescriptor>, SampleError>> + Send + 'a>> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                warn!(depth, "aborting bucket random walk");
                return Ok(None);
            }
            debug!(depth, prefix = %prefix, "walking a depth");

            let page = self
                .lister
                .list(normalize_prefix(&prefix), Some("/"), MAX_LIST)
                .await?;

            let listed = page.contents.len();
            let mut candidates: Vec<KeyDescriptor> =
                page.contents.into_iter().filter(|k| accept(k)).collect();
            candidates.shuffle(&mut self.rng);
            debug!(initial = listed, left = candidates.len(), "applied constraint");

            for key in candidates {
                if self.maybe_pick(depth) {
                    return Ok(Some(key));
                }
            }
            debug!(depth, prefix = %prefix, "rejected all candidates");

            let mut prefixes = page.common_prefixes;
            prefixes.shuffle(&mut self.rng);
            for sub in prefixes {
                if let Some(key) = self.walk(depth + 1, sub, accept).await? {
                    return Ok(Some(key));
                }
            }
            Ok(None)
        })
    }

    /// Keep a candidate with the model's probability for its depth.
    fn maybe_pick(&mut self, depth: usize) -> bool {
        let p = self.model.probability(depth);
        let dice: f64 = self.rng.gen();
        let picked = dice <= p;
        debug!(dice, p, picked, "rolling dice");
        picked
    }
}

/// Strip a single leading separator; bucket listings address prefixes
/// relative to the bucket root.
fn normalize_prefix(prefix: &str) -> &str {
    prefix.strip_prefix('/').unwrap_or(prefix)
}

/// Draws N distinct keys by running walks concurrently and de-duplicating.
pub struct SampleSetBuilder<L> {
    model: Arc<DepthModel>,
    lister: L,
    cancel: Cancel,
}

impl<L: BucketLister + Clone> SampleSetBuilder<L> {
    pub fn new(model: Arc<DepthModel>, lister: L, cancel: Cancel) -> Self {
        SampleSetBuilder {
            model,
            lister,
            cancel,
        }
    }

    /// Collect `count` distinct keys matching `accept`.
    ///
    /// Each round spawns one walk per missing key, seeded from the master
    /// RNG, and drains their results. Duplicates are discarded silently;
    /// the first walk error of a round aborts the build. `STALL_LIMIT`
    /// consecutive rounds without a new key fail the build instead of
    /// looping forever. Cancellation returns the partial set.
    pub async fn collect(
        &self,
        rng: &mut ChaCha8Rng,
        accept: &Constraint,
        count: usize,
    ) -> Result<HashSet<KeyDescriptor>, SampleError> {
        let mut set = HashSet::with_capacity(count);
        let mut stalled = 0u32;

        while set.len() < count {
            if self.cancel.is_cancelled() {
                warn!("aborting keys sampling");
                return Ok(set);
            }

            let deficit = count - set.len();
            debug!(samples = set.len(), deficit, "sampling random keys");
            let (tx, mut rx) = mpsc::channel(deficit);
            for _ in 0..deficit {
                let seed = rng.next_u64();
                let model = Arc::clone(&self.model);
                let lister = self.lister.clone();
                let cancel = self.cancel.clone();
                let accept = Arc::clone(accept);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut walk = RandomWalk::new(model, lister, seed, cancel);
                    let _ = tx.send(walk.draw(&accept).await).await;
                });
            }
            drop(tx);

            let before = set.len();
            let mut first_err = None;
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(Some(key)) => {
                        set.insert(key);
                    }
                    // A cancelled walk; the loop exits on the next check.
                    Ok(None) => {}
                    Err(err) => first_err = first_err.or(Some(err)),
                }
            }
            if let Some(err) = first_err {
                return Err(err);
            }
            debug!(samples = set.len(), "found samples");

            if set.len() == before && !self.cancel.is_cancelled() {
                stalled += 1;
                if stalled >= STALL_LIMIT {
                    return Err(SampleError::Underflow {
                        want: count,
                        have: set.len(),
                    });
                }
            } else {
                stalled = 0;
            }
        }

        Ok(set)
    }
}
