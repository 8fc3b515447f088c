//! Authoritative roster of agent states.
//!
//! Readers work on an immutable [`RosterSnapshot`]; writers hand a batch of
//! [`AgentDelta`]s to [`AgentRegistry::apply_updates`], which validates the
//! whole batch against a staged copy before swapping it in. Nobody observes
//! a half-applied tick.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::geometry::Vec2;
use crate::core::error::{SwarmError, SwarmResult};

/// Logical simulation time
pub type Tick = u64;

/// Stable agent identifier, never reused within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u32);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "drone-{}", self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("drone-").unwrap_or(s);
        digits
            .parse::<u32>()
            .map(AgentId)
            .map_err(|_| SwarmError::ConfigError(format!("invalid agent id: {}", s)))
    }
}

/// Health of an agent. Ordered by severity: transitions only move right
/// (Active -> Degraded -> Failed) unless an explicit reset is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Active,
    Degraded,
    Failed,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Active => write!(f, "Active"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// What an agent is currently trying to do, set by delivered commands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum Mission {
    /// Hold formation with the flock and follow shared targets
    #[default]
    Flock,
    /// Fly to a waypoint while keeping formation
    GoTo { target: Vec2 },
    /// Leave the flock and fly back to the launch point
    ReturnToLaunch,
    /// Hold position, still avoiding neighbours
    Loiter,
    /// Zero velocity until a new command arrives
    Stopped,
}

/// Per-agent state owned by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub position: Vec2,
    pub velocity: Vec2,
    /// Battery percentage in 0..=100
    pub battery: f64,
    pub status: HealthStatus,
    /// Tick at which the last heartbeat was heard by the swarm
    pub last_heartbeat: Tick,
    /// Launch point, target of return-to-launch
    pub home: Vec2,
    pub mission: Mission,
    /// Separation distance this agent keeps from its neighbours
    pub spacing: f64,
}

impl AgentState {
    pub fn is_active(&self) -> bool {
        self.status == HealthStatus::Active
    }

    pub fn is_failed(&self) -> bool {
        self.status == HealthStatus::Failed
    }
}

/// Initial values for a newly registered agent
#[derive(Debug, Clone, Copy)]
pub struct AgentLaunch {
    pub position: Vec2,
    pub velocity: Vec2,
    pub battery: f64,
    pub spacing: f64,
}

/// A single change to one agent, committed at the tick boundary
#[derive(Debug, Clone, PartialEq)]
pub enum AgentDelta {
    /// Motion planner output
    Kinematics {
        id: AgentId,
        position: Vec2,
        velocity: Vec2,
    },
    /// Health monitor output. `reset` is the only way back up the lattice.
    Health {
        id: AgentId,
        status: HealthStatus,
        battery: f64,
        last_heartbeat: Tick,
        reset: bool,
    },
    /// Mission change from a delivered command
    Mission { id: AgentId, mission: Mission },
    /// Formation spacing change from a delivered command
    Spacing { id: AgentId, spacing: f64 },
}

impl AgentDelta {
    pub fn agent(&self) -> AgentId {
        match self {
            AgentDelta::Kinematics { id, .. }
            | AgentDelta::Health { id, .. }
            | AgentDelta::Mission { id, .. }
            | AgentDelta::Spacing { id, .. } => *id,
        }
    }
}

/// Validate and apply one delta to a state
fn apply_delta(state: &mut AgentState, delta: &AgentDelta) -> SwarmResult<()> {
    match delta {
        AgentDelta::Kinematics {
            position, velocity, ..
        } => {
            state.position = *position;
            state.velocity = *velocity;
        }
        AgentDelta::Health {
            status,
            battery,
            last_heartbeat,
            reset,
            ..
        } => {
            if !reset && *status < state.status {
                return Err(SwarmError::InvalidTransition {
                    agent: state.id,
                    from: state.status,
                    to: *status,
                });
            }
            state.status = *status;
            // Battery only rises through a reset (charge event)
            state.battery = if *reset {
                battery.clamp(0.0, 100.0)
            } else {
                battery.clamp(0.0, 100.0).min(state.battery)
            };
            state.last_heartbeat = if *reset {
                *last_heartbeat
            } else {
                (*last_heartbeat).max(state.last_heartbeat)
            };
        }
        AgentDelta::Mission { mission, .. } => state.mission = *mission,
        AgentDelta::Spacing { spacing, .. } => state.spacing = *spacing,
    }
    Ok(())
}

/// Immutable view of the roster for one tick, sorted by agent id
#[derive(Debug, Clone)]
pub struct RosterSnapshot {
    pub tick: Tick,
    agents: Arc<Vec<AgentState>>,
}

impl RosterSnapshot {
    pub fn new(tick: Tick, mut agents: Vec<AgentState>) -> Self {
        agents.sort_by_key(|a| a.id);
        Self {
            tick,
            agents: Arc::new(agents),
        }
    }

    pub fn get(&self, id: AgentId) -> Option<&AgentState> {
        self.agents
            .binary_search_by_key(&id, |a| a.id)
            .ok()
            .map(|idx| &self.agents[idx])
    }

    pub fn contains(&self, id: AgentId) -> bool {
        self.get(id).is_some()
    }

    /// All agents in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &AgentState> {
        self.agents.iter()
    }

    /// Active agents in ascending id order
    pub fn active(&self) -> impl Iterator<Item = &AgentState> {
        self.agents.iter().filter(|a| a.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Preview of this snapshot with `deltas` applied, used to let later
    /// steps of a tick see earlier results before the registry commit
    pub fn overlay(&self, deltas: &[AgentDelta]) -> SwarmResult<RosterSnapshot> {
        let mut agents: Vec<AgentState> = self.agents.as_ref().clone();
        for delta in deltas {
            let idx = agents
                .binary_search_by_key(&delta.agent(), |a| a.id)
                .map_err(|_| SwarmError::UnknownAgent(delta.agent()))?;
            apply_delta(&mut agents[idx], delta)?;
        }
        Ok(RosterSnapshot {
            tick: self.tick,
            agents: Arc::new(agents),
        })
    }
}

/// Arena of agent states indexed by stable id
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<AgentId, AgentState>,
    next_id: u32,
    tick: Tick,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: BTreeMap::new(),
            next_id: 1,
            tick: 0,
        }
    }

    /// Add an agent to the roster. Ids are handed out in increasing order.
    pub fn register(&mut self, launch: AgentLaunch) -> AgentId {
        let id = AgentId(self.next_id);
        self.next_id += 1;

        self.agents.insert(
            id,
            AgentState {
                id,
                position: launch.position,
                velocity: launch.velocity,
                battery: launch.battery.clamp(0.0, 100.0),
                status: HealthStatus::Active,
                last_heartbeat: self.tick,
                home: launch.position,
                mission: Mission::default(),
                spacing: launch.spacing,
            },
        );
        id
    }

    pub fn get(&self, id: AgentId) -> Option<&AgentState> {
        self.agents.get(&id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn snapshot(&self) -> RosterSnapshot {
        RosterSnapshot {
            tick: self.tick,
            agents: Arc::new(self.agents.values().cloned().collect()),
        }
    }

    /// Commit a batch of deltas and advance to `tick`. Either every delta is
    /// applied or, on the first invalid one, none is.
    pub fn apply_updates(&mut self, deltas: &[AgentDelta], tick: Tick) -> SwarmResult<()> {
        let mut staged = self.agents.clone();
        for delta in deltas {
            let state = staged
                .get_mut(&delta.agent())
                .ok_or(SwarmError::UnknownAgent(delta.agent()))?;
            apply_delta(state, delta)?;
        }
        self.agents = staged;
        self.tick = tick;
        Ok(())
    }
}
