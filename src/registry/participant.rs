//! Participant records and class capability floors.

use crate::model::ParticipantId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scale class of a training participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantClass {
    /// Numerous, low-capability, high-churn clients (phones, sensors)
    Device,
    /// Few, reliable, high-capacity clients (hospitals, banks)
    Organization,
}

impl fmt::Display for ParticipantClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantClass::Device => write!(f, "device"),
            ParticipantClass::Organization => write!(f, "organization"),
        }
    }
}

/// Coarse compute tier declared at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeTier {
    Low,
    Medium,
    High,
}

/// Declared capabilities of a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub compute_tier: ComputeTier,
    pub memory_mb: u64,
    pub bandwidth_mbps: f64,
    /// Local training samples available
    pub sample_count: u64,
    /// Self-reported data quality in [0, 1]
    pub data_quality: f64,
}

/// Minimum capability a class must declare to be admitted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapabilityFloor {
    pub compute_tier: ComputeTier,
    pub memory_mb: u64,
    pub bandwidth_mbps: f64,
}

/// Device clients: 512 MB, 1 Mbps, any compute tier.
pub const DEVICE_FLOOR: CapabilityFloor = CapabilityFloor {
    compute_tier: ComputeTier::Low,
    memory_mb: 512,
    bandwidth_mbps: 1.0,
};

/// Organization clients: 4 GB, 10 Mbps, at least a medium compute tier.
pub const ORGANIZATION_FLOOR: CapabilityFloor = CapabilityFloor {
    compute_tier: ComputeTier::Medium,
    memory_mb: 4096,
    bandwidth_mbps: 10.0,
};

impl ParticipantClass {
    pub fn floor(&self) -> CapabilityFloor {
        match self {
            ParticipantClass::Device => DEVICE_FLOOR,
            ParticipantClass::Organization => ORGANIZATION_FLOOR,
        }
    }
}

impl Capability {
    /// Name the first dimension that falls short of `floor`, if any.
    pub fn shortfall(&self, floor: &CapabilityFloor) -> Option<String> {
        if self.memory_mb < floor.memory_mb {
            return Some(format!(
                "memory {} MB below floor {} MB",
                self.memory_mb, floor.memory_mb
            ));
        }
        if self.compute_tier < floor.compute_tier {
            return Some(format!(
                "compute tier {:?} below floor {:?}",
                self.compute_tier, floor.compute_tier
            ));
        }
        if self.bandwidth_mbps < floor.bandwidth_mbps {
            return Some(format!(
                "bandwidth {} Mbps below floor {} Mbps",
                self.bandwidth_mbps, floor.bandwidth_mbps
            ));
        }
        if !(0.0..=1.0).contains(&self.data_quality) {
            return Some(format!("data quality {} outside [0, 1]", self.data_quality));
        }
        None
    }
}

/// Lifecycle status of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Available,
    Training,
    Offline,
}

/// A registered training participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub class: ParticipantClass,
    pub capability: Capability,
    pub status: ParticipantStatus,
    /// Unix seconds of registration
    pub registered_at: u64,
    /// Unix seconds of the last heartbeat
    pub last_seen: u64,
}

impl Participant {
    /// New participant in the `Available` state.
    pub fn new(id: impl Into<String>, class: ParticipantClass, capability: Capability) -> Self {
        let now = crate::model::unix_now();
        Self {
            id: ParticipantId::new(id),
            class,
            capability,
            status: ParticipantStatus::Available,
            registered_at: now,
            last_seen: now,
        }
    }
}
