//! Participant Registry
//!
//! Tracks registered participants, their declared capabilities and their
//! availability. Participants are never removed: a silent participant is
//! marked `Offline` and may re-register or heartbeat its way back.
//!
//! ## Semantics
//!
//! - **Capability floors**: registration below the class floor is rejected
//!   and never reaches the stored set
//! - **No duplicates**: an id already present and not offline is rejected
//! - **Bounded**: the registry holds at most `capacity` participants
//! - **Deterministic listing**: `BTreeMap` ordering by participant id

pub mod participant;

pub use participant::{
    Capability, CapabilityFloor, ComputeTier, Participant, ParticipantClass, ParticipantStatus,
    DEVICE_FLOOR, ORGANIZATION_FLOOR,
};

use crate::model::{unix_now, ParticipantId};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default upper bound on registered participants.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 10_000;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Registry boundary errors. None of these affect running jobs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("participant {id} rejected: {reason}")]
    CapabilityBelowFloor { id: ParticipantId, reason: String },

    #[error("participant {0} is already registered")]
    Duplicate(ParticipantId),

    #[error("participant {0} not found")]
    NotFound(ParticipantId),

    #[error("registry full ({0} participants)")]
    CapacityExceeded(usize),
}

/// Selection filter for `list_available`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticipantFilter {
    pub class: Option<ParticipantClass>,
    pub min_memory_mb: u64,
    pub min_compute_tier: Option<ComputeTier>,
    pub min_sample_count: u64,
    pub min_data_quality: f64,
}

impl ParticipantFilter {
    fn matches(&self, p: &Participant) -> bool {
        if let Some(class) = self.class {
            if p.class != class {
                return false;
            }
        }
        if let Some(tier) = self.min_compute_tier {
            if p.capability.compute_tier < tier {
                return false;
            }
        }
        p.capability.memory_mb >= self.min_memory_mb
            && p.capability.sample_count >= self.min_sample_count
            && p.capability.data_quality >= self.min_data_quality
    }
}

/// In-memory participant registry.
#[derive(Debug)]
pub struct ParticipantRegistry {
    participants: BTreeMap<ParticipantId, Participant>,
    /// Monotonic liveness clock per participant
    liveness: HashMap<ParticipantId, Instant>,
    capacity: usize,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REGISTRY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            participants: BTreeMap::new(),
            liveness: HashMap::new(),
            capacity,
        }
    }

    /// Register a participant.
    ///
    /// An offline participant with the same id is replaced (re-registration);
    /// any other existing id is a duplicate.
    pub fn register(&mut self, mut participant: Participant) -> RegistryResult<()> {
        if let Some(reason) = participant.capability.shortfall(&participant.class.floor()) {
            return Err(RegistryError::CapabilityBelowFloor {
                id: participant.id,
                reason,
            });
        }

        match self.participants.get(&participant.id) {
            Some(existing) if existing.status != ParticipantStatus::Offline => {
                return Err(RegistryError::Duplicate(participant.id));
            }
            Some(existing) => {
                participant.registered_at = existing.registered_at;
            }
            None if self.participants.len() >= self.capacity => {
                return Err(RegistryError::CapacityExceeded(self.capacity));
            }
            None => {}
        }

        participant.status = ParticipantStatus::Available;
        participant.last_seen = unix_now();
        self.liveness.insert(participant.id.clone(), Instant::now());
        self.participants.insert(participant.id.clone(), participant);
        Ok(())
    }

    /// Set the status of a participant.
    pub fn update_status(
        &mut self,
        id: &ParticipantId,
        status: ParticipantStatus,
    ) -> RegistryResult<()> {
        let participant = self
            .participants
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        participant.status = status;
        Ok(())
    }

    /// Participants that are `Available` and match `filter`, ordered by id.
    pub fn list_available(&self, filter: &ParticipantFilter) -> Vec<Participant> {
        self.participants
            .values()
            .filter(|p| p.status == ParticipantStatus::Available && filter.matches(p))
            .cloned()
            .collect()
    }

    /// Refresh liveness. An offline participant comes back as available.
    pub fn heartbeat(&mut self, id: &ParticipantId) -> RegistryResult<()> {
        self.heartbeat_at(id, Instant::now())
    }

    pub fn heartbeat_at(&mut self, id: &ParticipantId, now: Instant) -> RegistryResult<()> {
        let participant = self
            .participants
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        participant.last_seen = unix_now();
        if participant.status == ParticipantStatus::Offline {
            participant.status = ParticipantStatus::Available;
        }
        self.liveness.insert(id.clone(), now);
        Ok(())
    }

    /// Mark participants silent for longer than `timeout` as offline.
    ///
    /// Returns the ids that transitioned during this sweep.
    pub fn sweep_stale(&mut self, now: Instant, timeout: Duration) -> Vec<ParticipantId> {
        let mut marked = Vec::new();
        for (id, participant) in self.participants.iter_mut() {
            if participant.status == ParticipantStatus::Offline {
                continue;
            }
            let silent = self
                .liveness
                .get(id)
                .map(|seen| now.saturating_duration_since(*seen) > timeout)
                .unwrap_or(true);
            if silent {
                participant.status = ParticipantStatus::Offline;
                marked.push(id.clone());
            }
        }
        marked
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Restore a journaled participant without re-checking floors.
    pub(crate) fn restore(&mut self, participant: Participant) {
        self.liveness.insert(participant.id.clone(), Instant::now());
        self.participants.insert(participant.id.clone(), participant);
    }
}

impl Default for ParticipantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, samples: u64) -> Participant {
        Participant::new(
            id,
            ParticipantClass::Device,
            Capability {
                compute_tier: ComputeTier::Low,
                memory_mb: 2048,
                bandwidth_mbps: 5.0,
                sample_count: samples,
                data_quality: 0.8,
            },
        )
    }

    fn organization(id: &str, memory_mb: u64) -> Participant {
        Participant::new(
            id,
            ParticipantClass::Organization,
            Capability {
                compute_tier: ComputeTier::High,
                memory_mb,
                bandwidth_mbps: 100.0,
                sample_count: 10_000,
                data_quality: 0.95,
            },
        )
    }

    #[test]
    fn test_register_and_list() {
        let mut registry = ParticipantRegistry::new();
        registry.register(device("d1", 10)).unwrap();
        registry.register(device("d2", 10)).unwrap();

        let available = registry.list_available(&ParticipantFilter::default());
        assert_eq!(available.len(), 2);
        assert_eq!(available[0].id.as_str(), "d1");
    }

    #[test]
    fn test_organization_below_floor_never_stored() {
        let mut registry = ParticipantRegistry::new();
        let err = registry.register(organization("hospital", 2048)).unwrap_err();

        assert!(matches!(err, RegistryError::CapabilityBelowFloor { .. }));
        assert!(registry.get(&ParticipantId::new("hospital")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ParticipantRegistry::new();
        registry.register(device("d1", 10)).unwrap();
        let err = registry.register(device("d1", 20)).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(ParticipantId::new("d1")));
    }

    #[test]
    fn test_offline_participant_can_reregister() {
        let mut registry = ParticipantRegistry::new();
        registry.register(device("d1", 10)).unwrap();
        let id = ParticipantId::new("d1");
        registry
            .update_status(&id, ParticipantStatus::Offline)
            .unwrap();

        registry.register(device("d1", 50)).unwrap();
        let p = registry.get(&id).unwrap();
        assert_eq!(p.status, ParticipantStatus::Available);
        assert_eq!(p.capability.sample_count, 50);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut registry = ParticipantRegistry::with_capacity(1);
        registry.register(device("d1", 10)).unwrap();
        let err = registry.register(device("d2", 10)).unwrap_err();
        assert_eq!(err, RegistryError::CapacityExceeded(1));
    }

    #[test]
    fn test_filter_by_class_and_samples() {
        let mut registry = ParticipantRegistry::new();
        registry.register(device("d1", 10)).unwrap();
        registry.register(device("d2", 500)).unwrap();
        registry.register(organization("o1", 8192)).unwrap();

        let filter = ParticipantFilter {
            class: Some(ParticipantClass::Device),
            min_sample_count: 100,
            ..Default::default()
        };
        let ids: Vec<_> = registry
            .list_available(&filter)
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![ParticipantId::new("d2")]);
    }

    #[test]
    fn test_training_participants_not_listed() {
        let mut registry = ParticipantRegistry::new();
        registry.register(device("d1", 10)).unwrap();
        registry
            .update_status(&ParticipantId::new("d1"), ParticipantStatus::Training)
            .unwrap();
        assert!(registry.list_available(&ParticipantFilter::default()).is_empty());
    }

    #[test]
    fn test_sweep_marks_silent_participants_offline() {
        let mut registry = ParticipantRegistry::new();
        registry.register(device("d1", 10)).unwrap();
        registry.register(device("d2", 10)).unwrap();

        let start = Instant::now();
        let later = start + Duration::from_secs(120);
        registry
            .heartbeat_at(&ParticipantId::new("d2"), later)
            .unwrap();

        let marked = registry.sweep_stale(later, Duration::from_secs(60));
        assert_eq!(marked, vec![ParticipantId::new("d1")]);
        assert_eq!(
            registry.get(&ParticipantId::new("d1")).unwrap().status,
            ParticipantStatus::Offline
        );

        // Second sweep reports nothing new
        assert!(registry.sweep_stale(later, Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_heartbeat_revives_offline_participant() {
        let mut registry = ParticipantRegistry::new();
        registry.register(device("d1", 10)).unwrap();
        let id = ParticipantId::new("d1");
        registry
            .update_status(&id, ParticipantStatus::Offline)
            .unwrap();
        registry.heartbeat(&id).unwrap();
        assert_eq!(registry.get(&id).unwrap().status, ParticipantStatus::Available);
    }

    #[test]
    fn test_heartbeat_unknown_participant() {
        let mut registry = ParticipantRegistry::new();
        let err = registry.heartbeat(&ParticipantId::new("ghost")).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }
}
