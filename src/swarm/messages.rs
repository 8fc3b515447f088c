//! Payload schemas carried over the mesh.
//!
//! Field names follow the camelCase wire layout exchanged with the edge
//! nodes (`agentId`, `objectClass`, ...).

use serde::{Deserialize, Serialize};
use std::fmt;

use super::consensus::{ProposalId, VoteChoice};
use super::fusion::Pattern;
use super::geometry::Vec2;
use super::mesh::Topic;
use super::registry::{AgentId, HealthStatus, Tick};

/// Periodic state report; doubles as the agent heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReport {
    pub agent_id: AgentId,
    pub timestamp: Tick,
    pub position: Vec2,
    pub battery: f64,
    pub status: HealthStatus,
}

/// Image-space bounding box as reported by the detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A single detection from the perception pipeline. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRecord {
    #[serde(rename = "agentId")]
    pub producer: AgentId,
    pub object_class: String,
    pub confidence: f64,
    /// Geolocation of the detected object
    pub location: Vec2,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    pub timestamp: Tick,
}

impl DetectionRecord {
    pub fn new(
        producer: AgentId,
        object_class: impl Into<String>,
        confidence: f64,
        location: Vec2,
        timestamp: Tick,
    ) -> Self {
        Self {
            producer,
            object_class: object_class.into(),
            confidence,
            location,
            bbox: None,
            timestamp,
        }
    }
}

/// Closed set of commands an agent understands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Fly to a point while keeping formation
    Waypoint { x: f64, y: f64 },
    /// Leave the flock and fly back to the launch point
    ReturnToLaunch,
    /// Hold position
    Loiter,
    /// Stop immediately
    EmergencyStop,
    /// Change the separation distance kept between agents
    FormationChange { spacing: f64 },
}

impl Command {
    /// Payload sanity check applied at the transport boundary
    pub fn is_well_formed(&self) -> bool {
        match self {
            Command::Waypoint { x, y } => x.is_finite() && y.is_finite(),
            Command::FormationChange { spacing } => spacing.is_finite() && *spacing > 0.0,
            Command::ReturnToLaunch | Command::Loiter | Command::EmergencyStop => true,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Waypoint { x, y } => write!(f, "waypoint({:.1}, {:.1})", x, y),
            Command::ReturnToLaunch => write!(f, "returnToLaunch"),
            Command::Loiter => write!(f, "loiter"),
            Command::EmergencyStop => write!(f, "emergencyStop"),
            Command::FormationChange { spacing } => write!(f, "formationChange({:.1})", spacing),
        }
    }
}

/// Announcement of a new proposal on `consensus.{proposalId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalAnnouncement {
    pub proposal_id: ProposalId,
    pub proposer_id: AgentId,
    pub action: Command,
    pub deadline: Tick,
}

/// Vote sub-message on `consensus.{proposalId}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteMessage {
    pub proposal_id: ProposalId,
    pub agent_id: AgentId,
    pub choice: VoteChoice,
}

/// Everything the mesh can carry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "camelCase")]
pub enum MeshPayload {
    Telemetry(TelemetryReport),
    Detection(DetectionRecord),
    Command(Command),
    Pattern(Pattern),
    Proposal(ProposalAnnouncement),
    Vote(VoteMessage),
}

impl MeshPayload {
    /// Whether this payload is allowed on `topic`. Per-agent topics must
    /// carry a payload produced by (or about) that same agent.
    pub fn fits_topic(&self, topic: &Topic) -> bool {
        match (self, topic) {
            (MeshPayload::Telemetry(t), Topic::Telemetry(id)) => {
                t.agent_id == *id && t.battery.is_finite() && t.position.is_finite()
            }
            (MeshPayload::Detection(d), Topic::Detection(id)) => d.producer == *id,
            (MeshPayload::Command(c), Topic::Command(_) | Topic::CommandBroadcast) => {
                c.is_well_formed()
            }
            (MeshPayload::Pattern(p), Topic::Pattern(id)) => p.id == *id,
            (MeshPayload::Proposal(p), Topic::Consensus(id)) => p.proposal_id == *id,
            (MeshPayload::Vote(v), Topic::Consensus(id)) => v.proposal_id == *id,
            _ => false,
        }
    }
}
