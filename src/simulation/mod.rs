//! Simulation driver: formation spawners, a seeded target field and the
//! operator-side failure injection used to exercise self-healing.

pub mod targets;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::f64::consts::PI;

use crate::core::config::SwarmConfig;
use crate::core::error::SwarmResult;
use crate::swarm::consensus::{ConsensusOutcome, ProposalId, ProposalStatus, VoteChoice};
use crate::swarm::controller::{SwarmController, TickReport};
use crate::swarm::geometry::Vec2;
use crate::swarm::mesh::MeshStats;
use crate::swarm::messages::Command;
use crate::swarm::registry::{AgentId, Tick};

pub use targets::{Target, TargetField};

/// World size used when no bounds are configured
pub const DEFAULT_WORLD: (f64, f64) = (1200.0, 800.0);

/// `n` points evenly spaced on a circle, the first one straight "up"
/// (towards negative y)
pub fn ring(n: usize, center: Vec2, radius: f64) -> Vec<Vec2> {
    (0..n)
        .map(|i| {
            let angle = 2.0 * PI * i as f64 / n as f64 - PI / 2.0;
            center + Vec2::new(radius * angle.cos(), radius * angle.sin())
        })
        .collect()
}

/// Five-agent pentagon
pub fn pentagon(center: Vec2, radius: f64) -> Vec<Vec2> {
    ring(5, center, radius)
}

/// Ring radius giving roughly `side` between adjacent agents, never below 80
pub fn ring_radius(n: usize, side: f64) -> f64 {
    if n < 2 {
        return 0.0;
    }
    (side / (2.0 * (PI / n as f64).sin())).max(80.0)
}

/// End-of-run summary printed by the CLI
#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub ticks: Tick,
    pub active: usize,
    pub degraded: usize,
    pub failed: usize,
    pub patterns: usize,
    pub detections_ingested: u64,
    pub targets_captured: u64,
    pub mesh: MeshStats,
    pub injected_failures: Vec<AgentId>,
    pub proposals_passed: usize,
    pub proposals_expired: usize,
}

/// A controller plus the simulated world around it
pub struct Simulation {
    controller: SwarmController,
    field: TargetField,
    rng: StdRng,
    injected: Vec<AgentId>,
    outcomes: Vec<ConsensusOutcome>,
}

impl Simulation {
    /// Build a simulation with `agents` agents on a ring at the world center
    pub fn new(config: SwarmConfig, agents: usize) -> SwarmResult<Self> {
        let (width, height) = config.flocking.world_bounds().unwrap_or(DEFAULT_WORLD);
        let seed = config.simulation.seed;
        let field = TargetField::new(&config.simulation, width, height, 1);
        let spacing = config.flocking.separation_distance * 0.9;

        let mut controller = SwarmController::simulated(config)?;
        let center = Vec2::new(width / 2.0, height / 2.0);
        for position in ring(agents, center, ring_radius(agents, spacing)) {
            let launch = controller.launch_at(position);
            controller.spawn_agent(launch)?;
        }

        Ok(Self {
            controller,
            field,
            // Separate stream from the target field so failures do not shift targets
            rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
            injected: Vec::new(),
            outcomes: Vec::new(),
        })
    }

    pub fn controller(&self) -> &SwarmController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut SwarmController {
        &mut self.controller
    }

    pub fn field(&self) -> &TargetField {
        &self.field
    }

    /// Fail a random Active agent, like pressing the failure button on the
    /// operator console. Returns the chosen agent, if any was Active.
    pub fn inject_random_failure(&mut self) -> SwarmResult<Option<AgentId>> {
        let active: Vec<AgentId> = self.controller.snapshot().active().map(|a| a.id).collect();
        if active.is_empty() {
            warn!("No active agent left to fail");
            return Ok(None);
        }
        let victim = active[self.rng.random_range(0..active.len())];
        self.controller.inject_failure(victim)?;
        self.injected.push(victim);
        Ok(Some(victim))
    }

    /// Have the lowest Active agent propose `action`, then cast approvals
    /// from the first `approvals` Active agents in id order
    pub fn propose(&mut self, action: Command, approvals: usize) -> SwarmResult<Option<ProposalId>> {
        let active: Vec<AgentId> = self.controller.snapshot().active().map(|a| a.id).collect();
        let Some(proposer) = active.first().copied() else {
            warn!("No active agent left to propose {}", action);
            return Ok(None);
        };
        let id = self.controller.propose(proposer, action, None)?;
        for voter in active.into_iter().take(approvals) {
            self.controller.cast_vote(voter, id, VoteChoice::Approve)?;
        }
        Ok(Some(id))
    }

    /// Feed this tick's detections into the swarm, then advance it
    pub fn step(&mut self) -> SwarmResult<TickReport> {
        let snapshot = self.controller.snapshot();
        for detection in self.field.observe(&snapshot, snapshot.tick) {
            self.controller.submit_detection(detection)?;
        }
        let report = self.controller.tick()?;
        self.outcomes.extend(report.outcomes.iter().cloned());
        Ok(report)
    }

    /// Run `ticks` ticks, failing a random agent right before tick `fail_at`
    pub fn run(&mut self, ticks: Tick, fail_at: Option<Tick>) -> SwarmResult<SimulationSummary> {
        for _ in 0..ticks {
            let next = self.controller.tick_count() + 1;
            if fail_at == Some(next) {
                if let Some(victim) = self.inject_random_failure()? {
                    info!("Injected failure on {} before tick {}", victim, next);
                }
            }
            self.step()?;
        }
        Ok(self.summary())
    }

    pub fn summary(&self) -> SimulationSummary {
        let snapshot = self.controller.snapshot();
        let count = |status: ProposalStatus| self.outcomes.iter().filter(|o| o.status == status).count();
        SimulationSummary {
            ticks: snapshot.tick,
            active: snapshot.active_count(),
            degraded: snapshot
                .iter()
                .filter(|a| !a.is_active() && !a.is_failed())
                .count(),
            failed: snapshot.iter().filter(|a| a.is_failed()).count(),
            patterns: self.controller.fusion().len(),
            detections_ingested: self.controller.fusion().ingested(),
            targets_captured: self.field.captured(),
            mesh: self.controller.mesh_stats(),
            injected_failures: self.injected.clone(),
            proposals_passed: count(ProposalStatus::Passed),
            proposals_expired: count(ProposalStatus::Expired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pentagon_is_regular() {
        let points = pentagon(Vec2::new(600.0, 400.0), 80.0);
        assert_eq!(points.len(), 5);
        assert!((points[0].x - 600.0).abs() < 1e-9);
        assert!((points[0].y - 320.0).abs() < 1e-9);

        let side = points[0].distance(points[1]);
        for i in 0..5 {
            let d = points[i].distance(points[(i + 1) % 5]);
            assert!((d - side).abs() < 1e-9);
        }
    }

    #[test]
    fn test_ring_radius_keeps_a_floor() {
        assert_eq!(ring_radius(1, 90.0), 0.0);
        assert_eq!(ring_radius(5, 90.0), 80.0);
        assert!(ring_radius(12, 90.0) > 170.0);
    }

    #[test]
    fn test_random_failure_is_seeded() {
        let run = || {
            let mut sim = Simulation::new(SwarmConfig::for_testing(), 5).unwrap();
            sim.inject_random_failure().unwrap()
        };
        let first = run();
        assert!(first.is_some());
        assert_eq!(first, run());
    }

    #[test]
    fn test_run_reports_injected_failure() {
        let mut sim = Simulation::new(SwarmConfig::for_testing(), 5).unwrap();
        let summary = sim.run(20, Some(5)).unwrap();

        assert_eq!(summary.ticks, 20);
        assert_eq!(summary.injected_failures.len(), 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.active + summary.degraded, 4);
        assert!(summary.mesh.published > 0);
    }

    #[test]
    fn test_proposal_with_majority_passes() {
        let mut sim = Simulation::new(SwarmConfig::for_testing(), 5).unwrap();
        let id = sim.propose(Command::Loiter, 3).unwrap().unwrap();
        let summary = sim.run(3, None).unwrap();

        assert_eq!(summary.proposals_passed, 1);
        let proposal = sim.controller().consensus().get(id).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Passed);
    }

    #[test]
    fn test_proposal_without_majority_expires() {
        let mut config = SwarmConfig::for_testing();
        config.consensus.default_deadline_ticks = 5;
        let mut sim = Simulation::new(config, 5).unwrap();
        sim.propose(Command::Loiter, 2).unwrap();
        let summary = sim.run(8, None).unwrap();

        assert_eq!(summary.proposals_passed, 0);
        assert_eq!(summary.proposals_expired, 1);
    }
}
