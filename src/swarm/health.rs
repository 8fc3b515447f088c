//! Heartbeat and battery driven health transitions.
//!
//! Status only moves down the Active -> Degraded -> Failed lattice. The one
//! way back up is an explicit operator reset. Excluding Failed agents from
//! the Active view is all the self-healing there is: the planner and the
//! consensus engine simply stop seeing them.

use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::registry::{AgentDelta, AgentId, HealthStatus, RosterSnapshot, Tick};
use crate::core::config::HealthConfig;

/// Operator console signals used to exercise self-healing
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorSignal {
    /// Force the agent to Failed
    InjectFailure(AgentId),
    /// Reconnect the agent: Active, heartbeat now, healthy battery
    Reset(AgentId),
}

impl OperatorSignal {
    pub fn agent(&self) -> AgentId {
        match self {
            OperatorSignal::InjectFailure(id) | OperatorSignal::Reset(id) => *id,
        }
    }
}

/// Everything the monitor consumes in one tick
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    /// Agents whose heartbeat was heard this tick
    pub heartbeats: BTreeSet<AgentId>,
    /// Latest battery reading per agent
    pub battery: BTreeMap<AgentId, f64>,
    /// Operator signals in arrival order
    pub signals: Vec<OperatorSignal>,
}

/// Why a transition happened
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransitionReason {
    MissedHeartbeats(u64),
    LostContact(u64),
    LowBattery(f64),
    CriticalBattery(f64),
    Injected,
    Reset,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionReason::MissedHeartbeats(n) => write!(f, "{} missed heartbeats", n),
            TransitionReason::LostContact(n) => write!(f, "lost contact after {} heartbeats", n),
            TransitionReason::LowBattery(b) => write!(f, "low battery {:.1}%", b),
            TransitionReason::CriticalBattery(b) => write!(f, "battery depleted {:.1}%", b),
            TransitionReason::Injected => write!(f, "failure injected by operator"),
            TransitionReason::Reset => write!(f, "reset by operator"),
        }
    }
}

/// A status change observed this tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthTransition {
    pub agent: AgentId,
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub reason: TransitionReason,
}

/// Monitor output: deltas for the registry plus the transitions they imply
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub deltas: Vec<AgentDelta>,
    pub transitions: Vec<HealthTransition>,
}

/// Drives health-state transitions from heartbeats, battery and operator input
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    /// Expected heartbeats that did not arrive since `last_heartbeat`
    pub fn missed_heartbeats(&self, last_heartbeat: Tick, now: Tick) -> u64 {
        now.saturating_sub(last_heartbeat) / self.config.heartbeat_interval_ticks
    }

    /// Most severe status the readings call for, with the reason
    fn assess(&self, battery: f64, missed: u64, injected: bool) -> Option<(HealthStatus, TransitionReason)> {
        let cfg = &self.config;
        if injected {
            Some((HealthStatus::Failed, TransitionReason::Injected))
        } else if battery <= cfg.critical_battery_threshold {
            Some((HealthStatus::Failed, TransitionReason::CriticalBattery(battery)))
        } else if missed > cfg.lost_contact_heartbeats {
            Some((HealthStatus::Failed, TransitionReason::LostContact(missed)))
        } else if battery < cfg.low_battery_threshold {
            Some((HealthStatus::Degraded, TransitionReason::LowBattery(battery)))
        } else if missed > cfg.max_missed_heartbeats {
            Some((HealthStatus::Degraded, TransitionReason::MissedHeartbeats(missed)))
        } else {
            None
        }
    }

    /// Evaluate every agent in `snapshot` against this tick's inputs
    pub fn evaluate(&self, snapshot: &RosterSnapshot, now: Tick, inputs: &HealthInputs) -> HealthReport {
        let mut report = HealthReport::default();

        for agent in snapshot.iter() {
            // Replay operator signals for this agent in arrival order
            let mut reset = false;
            let mut injected = false;
            for signal in inputs.signals.iter().filter(|s| s.agent() == agent.id) {
                match signal {
                    OperatorSignal::Reset(_) => {
                        reset = true;
                        injected = false;
                    }
                    OperatorSignal::InjectFailure(_) => injected = true,
                }
            }

            if reset {
                let status = if injected {
                    HealthStatus::Failed
                } else {
                    HealthStatus::Active
                };
                report.deltas.push(AgentDelta::Health {
                    id: agent.id,
                    status,
                    battery: self.config.healthy_battery,
                    last_heartbeat: now,
                    reset: true,
                });
                if status != agent.status {
                    let reason = if injected {
                        TransitionReason::Injected
                    } else {
                        TransitionReason::Reset
                    };
                    info!("{} reset: {} -> {} ({})", agent.id, agent.status, status, reason);
                    report.transitions.push(HealthTransition {
                        agent: agent.id,
                        from: agent.status,
                        to: status,
                        reason,
                    });
                }
                continue;
            }

            // Failed is terminal until a reset
            if agent.is_failed() {
                continue;
            }

            let last_heartbeat = if inputs.heartbeats.contains(&agent.id) {
                now
            } else {
                agent.last_heartbeat
            };
            let battery = inputs
                .battery
                .get(&agent.id)
                .map_or(agent.battery, |level| level.clamp(0.0, 100.0).min(agent.battery));
            let missed = self.missed_heartbeats(last_heartbeat, now);

            let mut status = agent.status;
            if let Some((target, reason)) = self.assess(battery, missed, injected) {
                if target > agent.status {
                    status = target;
                    warn!("{} {} -> {}: {}", agent.id, agent.status, target, reason);
                    report.transitions.push(HealthTransition {
                        agent: agent.id,
                        from: agent.status,
                        to: target,
                        reason,
                    });
                }
            }

            if status != agent.status || battery != agent.battery || last_heartbeat != agent.last_heartbeat {
                report.deltas.push(AgentDelta::Health {
                    id: agent.id,
                    status,
                    battery,
                    last_heartbeat,
                    reset: false,
                });
            }
        }

        report
    }
}
