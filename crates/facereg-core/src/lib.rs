//! Labeled face descriptor registry.
//!
//! Keeps named sets of face descriptors, persists them as JSON in a
//! key-value storage, and maintains a matcher snapshot that maps a query
//! descriptor to the nearest registered label within a distance threshold.
//! Detection and descriptor extraction happen elsewhere; this crate only
//! sees the resulting vectors.

pub mod matcher;
pub mod registry;
pub mod storage;
pub mod store;
pub mod types;

pub use matcher::{FaceMatcher, MatchStrategy, MatcherError};
pub use registry::{classify_with, FaceRegistry, RegistryConfig, RegistryError, DEFAULT_STORAGE_KEY};
pub use storage::{BoxedStorage, FileStorage, MemoryStorage, SqliteStorage, Storage, StorageError};
pub use store::{DescriptorStore, StoreError};
pub use types::{
    BoundingBox, Descriptor, DescriptorDefect, Detection, LabeledDescriptorSet, Verdict,
    VerdictView, DEFAULT_DESCRIPTOR_DIM, DEFAULT_MATCH_THRESHOLD, UNKNOWN_LABEL,
    UNREGISTERED_LABEL,
};
