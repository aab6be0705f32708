//! Participant selection policy.

use crate::registry::{ComputeTier, Participant, ParticipantClass, ParticipantFilter};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const DEFAULT_MIN_PARTICIPANTS: usize = 2;
pub const DEFAULT_MAX_PARTICIPANTS: usize = 100;

/// How to rank eligible participants when more are available than needed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Compute tier, then memory (ties broken by id)
    #[default]
    HighestCapability,
    /// Sample count weighted by data quality
    LargestDatasets,
    /// Uniform shuffle, reproducible with `seed`
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default = "default_min")]
    pub min_participants: usize,
    #[serde(default = "default_max")]
    pub max_participants: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ParticipantClass>,
    #[serde(default)]
    pub min_memory_mb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_compute_tier: Option<ComputeTier>,
    #[serde(default)]
    pub min_sample_count: u64,
    #[serde(default)]
    pub min_data_quality: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_min() -> usize {
    DEFAULT_MIN_PARTICIPANTS
}

fn default_max() -> usize {
    DEFAULT_MAX_PARTICIPANTS
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            min_participants: DEFAULT_MIN_PARTICIPANTS,
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            class: None,
            min_memory_mb: 0,
            min_compute_tier: None,
            min_sample_count: 0,
            min_data_quality: 0.0,
            seed: None,
        }
    }
}

/// Not enough eligible participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    pub required: usize,
    pub available: usize,
}

impl SelectionPolicy {
    /// Registry filter for the eligibility part of the policy.
    pub fn filter(&self) -> ParticipantFilter {
        ParticipantFilter {
            class: self.class,
            min_memory_mb: self.min_memory_mb,
            min_compute_tier: self.min_compute_tier,
            min_sample_count: self.min_sample_count,
            min_data_quality: self.min_data_quality,
        }
    }

    /// Pick up to `max_participants` from `candidates`.
    ///
    /// The returned set is ordered by participant id.
    pub fn select(&self, mut candidates: Vec<Participant>) -> Result<Vec<Participant>, Shortfall> {
        if candidates.len() < self.min_participants {
            return Err(Shortfall {
                required: self.min_participants,
                available: candidates.len(),
            });
        }

        match self.strategy {
            SelectionStrategy::HighestCapability => candidates.sort_by(|a, b| {
                b.capability
                    .compute_tier
                    .cmp(&a.capability.compute_tier)
                    .then(b.capability.memory_mb.cmp(&a.capability.memory_mb))
                    .then_with(|| a.id.cmp(&b.id))
            }),
            SelectionStrategy::LargestDatasets => candidates.sort_by(|a, b| {
                dataset_score(b)
                    .partial_cmp(&dataset_score(a))
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            }),
            SelectionStrategy::Random => {
                candidates.sort_by(|a, b| a.id.cmp(&b.id));
                let mut rng = match self.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                candidates.shuffle(&mut rng);
            }
        }

        candidates.truncate(self.max_participants);
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(candidates)
    }
}

fn dataset_score(p: &Participant) -> f64 {
    p.capability.sample_count as f64 * p.capability.data_quality
}
