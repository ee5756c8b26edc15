//! Everything that touches the object store: artifact identity, existence
//! probes, client construction and publishing.

pub mod identity;
pub mod probe;
pub mod publisher;
pub mod store;

pub use identity::{normalize_tile_id, ArtifactAddress, ArtifactResolver};
pub use probe::{ExistenceProbe, GateDecision, HttpProbe, IdempotencyGate, ProbeError, StoreProbe};
pub use publisher::{ArtifactUploader, ObjectStoreUploader, PublishError, Publisher};
pub use store::{create_output_store, create_s3_store, parse_s3_uri};
