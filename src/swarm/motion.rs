//! Boids-style motion planning.
//!
//! Steering terms are accumulated as force vectors over neighbours taken
//! only from the Active roster, enumerated in ascending id order so that the
//! floating-point summation order (and the trajectory) is reproducible.

use log::info;

use super::geometry::Vec2;
use super::registry::{AgentDelta, AgentState, HealthStatus, Mission, RosterSnapshot};
use crate::core::config::FlockingConfig;

/// A neighbour of the agent being planned and its distance
struct Neighbour<'a> {
    state: &'a AgentState,
    distance: f64,
}

pub struct MotionPlanner {
    config: FlockingConfig,
}

impl MotionPlanner {
    pub fn new(config: FlockingConfig) -> Self {
        Self { config }
    }

    /// Plan one tick for every agent in `roster`. `target` is the location of
    /// the shared pattern the flock should seek, if any.
    ///
    /// Returns one kinematics delta per agent (id order), plus mission deltas
    /// for agents that reached their destination.
    pub fn plan(&self, roster: &RosterSnapshot, target: Option<Vec2>) -> Vec<AgentDelta> {
        let mut deltas = Vec::with_capacity(roster.len());

        for agent in roster.iter() {
            let (velocity, mission) = match agent.status {
                HealthStatus::Failed => (Vec2::ZERO, None),
                HealthStatus::Degraded => (self.return_home(agent, roster), None),
                HealthStatus::Active => self.steer_active(agent, roster, target),
            };

            let mut position = agent.position + velocity;
            if let Some((width, height)) = self.config.world_bounds() {
                position = position.wrap(width, height);
            }

            deltas.push(AgentDelta::Kinematics {
                id: agent.id,
                position,
                velocity,
            });
            if let Some(mission) = mission {
                deltas.push(AgentDelta::Mission {
                    id: agent.id,
                    mission,
                });
            }
        }

        deltas
    }

    /// Active agents other than `agent`, ascending by id
    fn neighbours<'a>(&self, agent: &AgentState, roster: &'a RosterSnapshot) -> Vec<Neighbour<'a>> {
        roster
            .active()
            .filter(|other| other.id != agent.id)
            .map(|other| Neighbour {
                state: other,
                distance: agent.position.distance(other.position),
            })
            .collect()
    }

    fn steer_active(
        &self,
        agent: &AgentState,
        roster: &RosterSnapshot,
        pattern_target: Option<Vec2>,
    ) -> (Vec2, Option<Mission>) {
        let neighbours = self.neighbours(agent, roster);

        match agent.mission {
            Mission::Flock => {
                let mut steer = self.flocking(agent, &neighbours);
                if let Some(target) = pattern_target {
                    steer += self.seek(agent, target);
                }
                (self.inertial(agent, steer), None)
            }
            Mission::GoTo { target } => {
                if agent.position.distance(target) <= self.config.arrival_radius {
                    info!("{} reached waypoint {}", agent.id, target);
                    let steer = self.flocking(agent, &neighbours);
                    (self.inertial(agent, steer), Some(Mission::Flock))
                } else {
                    let steer = self.flocking(agent, &neighbours) + self.seek(agent, target);
                    (self.inertial(agent, steer), None)
                }
            }
            Mission::ReturnToLaunch => {
                if agent.position.distance(agent.home) <= self.config.arrival_radius {
                    info!("{} is back at its launch point", agent.id);
                    (self.hold(agent, &neighbours), Some(Mission::Loiter))
                } else {
                    (self.direct(agent, &neighbours, agent.home), None)
                }
            }
            Mission::Loiter => (self.hold(agent, &neighbours), None),
            Mission::Stopped => (Vec2::ZERO, None),
        }
    }

    /// Degraded agents leave the flock and fly back to launch
    fn return_home(&self, agent: &AgentState, roster: &RosterSnapshot) -> Vec2 {
        let neighbours = self.neighbours(agent, roster);
        if agent.position.distance(agent.home) <= self.config.arrival_radius {
            self.hold(agent, &neighbours)
        } else {
            self.direct(agent, &neighbours, agent.home)
        }
    }

    /// Separation + cohesion + alignment
    fn flocking(&self, agent: &AgentState, neighbours: &[Neighbour<'_>]) -> Vec2 {
        self.separation(agent, neighbours)
            + self.cohesion(agent, neighbours)
            + self.alignment(agent, neighbours)
    }

    fn separation(&self, agent: &AgentState, neighbours: &[Neighbour<'_>]) -> Vec2 {
        let spacing = agent.spacing;
        let mut force = Vec2::ZERO;

        for n in neighbours.iter().filter(|n| n.distance < spacing) {
            if n.distance > 0.0 {
                let away = (agent.position - n.state.position) / n.distance;
                force += away * (spacing / n.distance);
            } else {
                // Coincident agents split along x, lower id to the left
                let side = if agent.id < n.state.id { -1.0 } else { 1.0 };
                force += Vec2::new(side * spacing, 0.0);
            }
        }

        force * self.config.separation_weight
    }

    fn cohesion(&self, agent: &AgentState, neighbours: &[Neighbour<'_>]) -> Vec2 {
        let mut sum = Vec2::ZERO;
        let mut count = 0usize;
        for n in neighbours.iter().filter(|n| n.distance <= self.config.cohesion_radius) {
            sum += n.state.position;
            count += 1;
        }
        if count == 0 {
            return Vec2::ZERO;
        }
        let centroid = sum / count as f64;
        (centroid - agent.position) * self.config.cohesion_weight
    }

    fn alignment(&self, agent: &AgentState, neighbours: &[Neighbour<'_>]) -> Vec2 {
        let mut sum = Vec2::ZERO;
        let mut count = 0usize;
        for n in neighbours.iter().filter(|n| n.distance <= self.config.cohesion_radius) {
            sum += n.state.velocity;
            count += 1;
        }
        if count == 0 {
            return Vec2::ZERO;
        }
        let average = sum / count as f64;
        (average - agent.velocity) * self.config.alignment_weight
    }

    /// Pull towards `target`, bounded by the speed limit so that separation
    /// still wins at close range
    fn seek(&self, agent: &AgentState, target: Vec2) -> Vec2 {
        ((target - agent.position) * self.config.target_weight).clamp_length(self.config.max_speed)
    }

    /// Carry the previous velocity forward and add `steer`
    fn inertial(&self, agent: &AgentState, steer: Vec2) -> Vec2 {
        (agent.velocity + steer).clamp_length(self.config.max_speed)
    }

    /// Fly straight at `destination`, still avoiding neighbours
    fn direct(&self, agent: &AgentState, neighbours: &[Neighbour<'_>], destination: Vec2) -> Vec2 {
        (self.separation(agent, neighbours) + self.seek(agent, destination))
            .clamp_length(self.config.max_speed)
    }

    /// Hold position, only moving to keep separation
    fn hold(&self, agent: &AgentState, neighbours: &[Neighbour<'_>]) -> Vec2 {
        self.separation(agent, neighbours)
            .clamp_length(self.config.max_speed)
    }
}
