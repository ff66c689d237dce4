//! Descriptor Store: the ordered collection of labeled descriptor sets and
//! its persisted JSON form.
//!
//! The persisted form is a JSON array of `{ "label", "descriptors" }`
//! objects, one per label, in first-registration order. `load` and
//! `serialize` are exact inverses for any store built by this module.

use crate::types::{check_descriptor, Descriptor, LabeledDescriptorSet};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("corrupt descriptor data: {0}")]
    CorruptData(String),
    #[error("failed to serialize descriptor store: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Ordered labeled descriptor sets. Labels are unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescriptorStore {
    sets: Vec<LabeledDescriptorSet>,
}

impl DescriptorStore {
    /// An empty store.
    pub fn clear() -> Self {
        Self::default()
    }

    /// Parse a persisted representation.
    ///
    /// `None` means nothing was persisted and yields an empty store. Every
    /// vector must have exactly `dim` components.
    pub fn load(raw: Option<&str>, dim: usize) -> Result<Self, StoreError> {
        let Some(raw) = raw else {
            return Ok(Self::default());
        };

        let sets: Vec<LabeledDescriptorSet> = serde_json::from_str(raw)
            .map_err(|e| StoreError::CorruptData(format!("unexpected shape: {e}")))?;

        let mut seen = HashSet::with_capacity(sets.len());
        for (i, set) in sets.iter().enumerate() {
            if set.label.is_empty() {
                return Err(StoreError::CorruptData(format!("entry {i} has an empty label")));
            }
            if !seen.insert(set.label.as_str()) {
                return Err(StoreError::CorruptData(format!(
                    "duplicate label {:?}",
                    set.label
                )));
            }
            for (j, descriptor) in set.descriptors.iter().enumerate() {
                check_descriptor(descriptor, dim).map_err(|defect| {
                    StoreError::CorruptData(format!(
                        "label {:?} descriptor {j}: {defect}",
                        set.label
                    ))
                })?;
            }
        }

        Ok(Self { sets })
    }

    /// Produce the persisted representation.
    pub fn serialize(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(&self.sets)?)
    }

    /// Exact, case-sensitive label lookup.
    pub fn find_by_label(&self, label: &str) -> Option<&LabeledDescriptorSet> {
        self.sets.iter().find(|s| s.label == label)
    }

    /// Return a new store with `descriptor` appended under `label`.
    ///
    /// An existing label keeps its position and gains one more descriptor
    /// (duplicates allowed); a new label is appended at the end. `self` is
    /// left untouched so callers can keep it until the new store is committed.
    #[must_use]
    pub fn upsert(&self, label: &str, descriptor: Descriptor) -> Self {
        let mut sets = self.sets.clone();
        match sets.iter_mut().find(|s| s.label == label) {
            Some(set) => set.descriptors.push(descriptor),
            None => sets.push(LabeledDescriptorSet::new(label, descriptor)),
        }
        Self { sets }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LabeledDescriptorSet> {
        self.sets.iter()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.sets.iter().map(|s| s.label.as_str())
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Total number of descriptors across all labels.
    pub fn descriptor_count(&self) -> usize {
        self.sets.iter().map(|s| s.descriptors.len()).sum()
    }

    pub fn as_slice(&self) -> &[LabeledDescriptorSet] {
        &self.sets
    }
}
