//! Matcher Adapter: a read-only snapshot of the store that maps a query
//! descriptor to the nearest registered label.

use crate::store::DescriptorStore;
use crate::types::{euclidean_distance, Descriptor, Verdict};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MatcherError {
    #[error("cannot build a matcher from a store with no descriptors")]
    EmptyStore,
}

/// How the distance between a query and a label's descriptor set is scored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    /// Distance to the closest descriptor of the label.
    #[default]
    Nearest,
    /// Mean distance over all descriptors of the label.
    Mean,
}

impl FromStr for MatchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(MatchStrategy::Nearest),
            "mean" => Ok(MatchStrategy::Mean),
            other => Err(format!("unknown match strategy {other:?} (expected nearest or mean)")),
        }
    }
}

#[derive(Debug)]
struct LabelEntry {
    label: String,
    descriptors: Vec<Descriptor>,
}

/// Queryable snapshot built from a [`DescriptorStore`].
///
/// Never mutated after construction; the registry replaces it wholesale
/// after every store mutation.
#[derive(Debug)]
pub struct FaceMatcher {
    entries: Vec<LabelEntry>,
    threshold: f32,
    strategy: MatchStrategy,
    descriptor_count: usize,
}

impl FaceMatcher {
    /// Build a matcher over every descriptor of every set in `store`.
    pub fn build(
        store: &DescriptorStore,
        threshold: f32,
        strategy: MatchStrategy,
    ) -> Result<Self, MatcherError> {
        let descriptor_count = store.descriptor_count();
        if descriptor_count == 0 {
            return Err(MatcherError::EmptyStore);
        }

        let entries = store
            .iter()
            .filter(|set| !set.descriptors.is_empty())
            .map(|set| LabelEntry {
                label: set.label.clone(),
                descriptors: set.descriptors.clone(),
            })
            .collect();

        tracing::debug!(
            labels = store.len(),
            descriptors = descriptor_count,
            threshold,
            ?strategy,
            "matcher built"
        );

        Ok(Self {
            entries,
            threshold,
            strategy,
            descriptor_count,
        })
    }

    /// Classify `descriptor` against the snapshot.
    ///
    /// Every label is scored; the lowest score wins and ties keep the
    /// earlier-registered label. The winner is a match when its distance is
    /// at most the threshold, otherwise the verdict is unknown and carries
    /// the best distance found. The caller is responsible for passing a
    /// descriptor of the snapshot's dimension.
    pub fn classify(&self, descriptor: &[f32]) -> Verdict {
        let mut best: Option<(&str, f32)> = None;

        for entry in &self.entries {
            let distance = self.score(entry, descriptor);
            let better = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if better {
                best = Some((&entry.label, distance));
            }
        }

        match best {
            Some((label, distance)) if distance <= self.threshold => Verdict::Match {
                label: label.to_string(),
                distance,
            },
            Some((_, distance)) => Verdict::Unknown { distance },
            None => Verdict::unknown(),
        }
    }

    fn score(&self, entry: &LabelEntry, descriptor: &[f32]) -> f32 {
        let distances = entry
            .descriptors
            .iter()
            .map(|d| euclidean_distance(d, descriptor));
        match self.strategy {
            MatchStrategy::Nearest => distances.fold(f32::INFINITY, f32::min),
            MatchStrategy::Mean => distances.sum::<f32>() / entry.descriptors.len() as f32,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn strategy(&self) -> MatchStrategy {
        self.strategy
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptor_count
    }

    /// Length of the descriptors in the snapshot.
    pub fn dimension(&self) -> usize {
        self.entries
            .first()
            .and_then(|e| e.descriptors.first())
            .map_or(0, Vec::len)
    }
}
