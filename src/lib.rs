pub mod auditor;
pub mod cancel;
pub mod config;
pub mod model;
pub mod sampler;
pub mod snapshot;
pub mod store;

pub use auditor::{AuditError, Auditor, Mismatch};
pub use cancel::Cancel;
pub use config::{AuditConfig, AwsConfig, ConfigError};
pub use model::DepthModel;
pub use sampler::{Constraint, RandomWalk, SampleError, SampleSetBuilder};
pub use snapshot::{open_snapshot, KeyStream, SnapshotError};
pub use store::{BucketLister, KeyDescriptor, ListPage, MemoryBucket, RetryingLister, S3Lister};
