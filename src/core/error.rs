use thiserror::Error;

use crate::swarm::consensus::{ProposalId, ProposalStatus};
use crate::swarm::registry::{AgentId, HealthStatus};

/// Result alias used across the swarm core
pub type SwarmResult<T> = Result<T, SwarmError>;

/// Custom error types for the swarm core
#[derive(Error, Debug)]
pub enum SwarmError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// An operation referenced an agent that is not in the roster
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// A health update tried to move up the Active > Degraded > Failed lattice without a reset
    #[error("Invalid health transition for {agent}: {from} -> {to}")]
    InvalidTransition {
        agent: AgentId,
        from: HealthStatus,
        to: HealthStatus,
    },

    /// Topic or topic pattern that does not follow the mesh naming scheme
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Command payload that no agent could execute
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Detection rejected at the fusion boundary
    #[error("Invalid detection: {0}")]
    InvalidDetection(String),

    /// Unknown consensus proposal
    #[error("Unknown proposal: {0}")]
    UnknownProposal(ProposalId),

    /// Proposal already reached a terminal state
    #[error("Proposal {id} is closed ({status})")]
    ProposalClosed {
        id: ProposalId,
        status: ProposalStatus,
    },

    /// Vote arrived at or after the proposal deadline
    #[error("Deadline passed for proposal {0}")]
    DeadlinePassed(ProposalId),

    /// Agent is failed or not in the roster, so it cannot act
    #[error("Agent {0} is not eligible: failed or not in the roster")]
    NotEligible(AgentId),

    /// Only the proposer may retract a proposal
    #[error("Agent {agent} is not the proposer of {id}")]
    NotProposer { agent: AgentId, id: ProposalId },

    /// I/O errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Flight-control link errors
    #[error("Flight link error: {0}")]
    FlightLinkError(String),
}
