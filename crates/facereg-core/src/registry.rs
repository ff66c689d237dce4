//! Face Registry: sole owner of the descriptor store, the current matcher
//! and the storage backend.
//!
//! After every public operation returns, the in-memory store, the matcher
//! snapshot and the persisted value describe the same set of faces.
//! `register_face` computes the next store and matcher off to the side and
//! only commits them once the write to storage has succeeded.

use crate::matcher::{FaceMatcher, MatchStrategy, MatcherError};
use crate::storage::{BoxedStorage, StorageError};
use crate::store::{DescriptorStore, StoreError};
use crate::types::{
    check_descriptor, Descriptor, DescriptorDefect, LabeledDescriptorSet, Verdict,
    DEFAULT_DESCRIPTOR_DIM, DEFAULT_MATCH_THRESHOLD,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Storage key the store is persisted under.
pub const DEFAULT_STORAGE_KEY: &str = "labeledFaceDescriptors";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("label must not be empty")]
    InvalidLabel,
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(DescriptorDefect),
    #[error(transparent)]
    CorruptData(#[from] StoreError),
    #[error("internal error: {0}")]
    EmptyStore(#[from] MatcherError),
    #[error("failed to persist descriptors: {0}")]
    PersistenceFailure(#[from] StorageError),
    #[error("invalid registry configuration: {0}")]
    InvalidConfig(String),
}

/// Registry parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Storage key holding the persisted store.
    pub storage_key: String,
    /// Maximum distance for a positive match.
    pub threshold: f32,
    /// Canonical descriptor length.
    pub descriptor_dim: usize,
    pub strategy: MatchStrategy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            threshold: DEFAULT_MATCH_THRESHOLD,
            descriptor_dim: DEFAULT_DESCRIPTOR_DIM,
            strategy: MatchStrategy::default(),
        }
    }
}

impl RegistryConfig {
    /// Reject parameters under which a registered face could never match
    /// itself.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(RegistryError::InvalidConfig(format!(
                "match threshold must be a finite non-negative number, got {}",
                self.threshold
            )));
        }
        if self.descriptor_dim == 0 {
            return Err(RegistryError::InvalidConfig(
                "descriptor dimension must be at least 1".to_string(),
            ));
        }
        if self.storage_key.trim().is_empty() {
            return Err(RegistryError::InvalidConfig(
                "storage key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct FaceRegistry {
    storage: BoxedStorage,
    config: RegistryConfig,
    store: DescriptorStore,
    matcher: Option<Arc<FaceMatcher>>,
    initialized: bool,
}

impl std::fmt::Debug for FaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaceRegistry")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("matcher", &self.matcher)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl FaceRegistry {
    fn new(storage: BoxedStorage, config: RegistryConfig) -> Self {
        Self {
            storage,
            config,
            store: DescriptorStore::default(),
            matcher: None,
            initialized: false,
        }
    }

    /// Create a registry over `storage` and load persisted state.
    ///
    /// Fails with `InvalidConfig` when `config` does not pass
    /// [`RegistryConfig::validate`]. Persisted data that cannot be read is
    /// not an error here; see [`initialize`](Self::initialize).
    pub fn open(storage: BoxedStorage, config: RegistryConfig) -> Result<Self, RegistryError> {
        config.validate()?;
        let mut registry = Self::new(storage, config);
        registry.initialize();
        Ok(registry)
    }

    /// Load the persisted store and build the matcher. Runs once; later
    /// calls are no-ops.
    ///
    /// Unreadable or corrupt persisted data is logged and treated as absent.
    pub fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        let key = self.config.storage_key.as_str();
        let raw = match self.storage.get(key) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(
                    backend = self.storage.name(),
                    key,
                    error = %e,
                    "failed to read persisted descriptors; starting empty"
                );
                None
            }
        };

        self.store = match DescriptorStore::load(raw.as_deref(), self.config.descriptor_dim) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(key, error = %e, "ignoring corrupt persisted descriptors");
                DescriptorStore::default()
            }
        };

        self.matcher = self.build_matcher(&self.store).map(Arc::new);

        tracing::info!(
            backend = self.storage.name(),
            labels = self.store.len(),
            descriptors = self.store.descriptor_count(),
            "registry initialized"
        );
    }

    /// Add `descriptor` under `label`, rebuild the matcher and persist.
    ///
    /// The label is trimmed before use. On any error the previous store and
    /// matcher stay in effect.
    pub fn register_face(
        &mut self,
        label: &str,
        descriptor: Descriptor,
    ) -> Result<LabeledDescriptorSet, RegistryError> {
        self.initialize();

        let label = label.trim();
        if label.is_empty() {
            return Err(RegistryError::InvalidLabel);
        }
        if let Err(defect) = check_descriptor(&descriptor, self.config.descriptor_dim) {
            tracing::error!(label, %defect, "rejected descriptor");
            return Err(RegistryError::InvalidDescriptor(defect));
        }

        let next = self.store.upsert(label, descriptor);
        let matcher = FaceMatcher::build(&next, self.config.threshold, self.config.strategy)?;
        let raw = next.serialize()?;

        if let Err(e) = self.storage.set(&self.config.storage_key, &raw) {
            tracing::error!(
                label,
                backend = self.storage.name(),
                error = %e,
                "persisting registration failed; keeping previous state"
            );
            return Err(RegistryError::PersistenceFailure(e));
        }

        self.store = next;
        self.matcher = Some(Arc::new(matcher));

        let set = self
            .store
            .find_by_label(label)
            .cloned()
            .ok_or(RegistryError::EmptyStore(MatcherError::EmptyStore))?;

        tracing::info!(
            label,
            descriptors = set.descriptors.len(),
            labels = self.store.len(),
            "face registered"
        );

        Ok(set)
    }

    /// Persisted-shape JSON of the current store.
    pub fn export_all(&self) -> Result<String, RegistryError> {
        Ok(self.store.serialize()?)
    }

    /// Empty the store, drop the matcher and remove the persisted value.
    ///
    /// If the persisted value cannot be removed, nothing changes.
    pub fn clear_all(&mut self) -> Result<(), RegistryError> {
        self.initialize();

        self.storage.remove(&self.config.storage_key)?;
        self.store = DescriptorStore::clear();
        self.matcher = None;

        tracing::info!(backend = self.storage.name(), "registry cleared");
        Ok(())
    }

    /// Classify one descriptor.
    ///
    /// With nothing registered the verdict is always unknown. Otherwise the
    /// descriptor must have the canonical shape.
    pub fn classify(&self, descriptor: &[f32]) -> Result<Verdict, RegistryError> {
        classify_with(self.matcher.as_deref(), descriptor, self.config.descriptor_dim)
    }

    pub fn find_by_label(&self, label: &str) -> Option<&LabeledDescriptorSet> {
        self.store.find_by_label(label)
    }

    pub fn store(&self) -> &DescriptorStore {
        &self.store
    }

    /// Shared handle to the current matcher snapshot.
    pub fn matcher(&self) -> Option<Arc<FaceMatcher>> {
        self.matcher.clone()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn storage_name(&self) -> &'static str {
        self.storage.name()
    }

    fn build_matcher(&self, store: &DescriptorStore) -> Option<FaceMatcher> {
        if store.descriptor_count() == 0 {
            return None;
        }
        FaceMatcher::build(store, self.config.threshold, self.config.strategy).ok()
    }
}

/// Classify against an optional matcher snapshot.
///
/// Shared by [`FaceRegistry::classify`] and readers that hold a published
/// snapshot outside the registry.
pub fn classify_with(
    matcher: Option<&FaceMatcher>,
    descriptor: &[f32],
    dim: usize,
) -> Result<Verdict, RegistryError> {
    let Some(matcher) = matcher else {
        return Ok(Verdict::unknown());
    };
    check_descriptor(descriptor, dim).map_err(RegistryError::InvalidDescriptor)?;
    Ok(matcher.classify(descriptor))
}
