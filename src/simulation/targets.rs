//! Seeded target field standing in for the perception pipeline.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::config::SimulationConfig;
use crate::swarm::geometry::Vec2;
use crate::swarm::messages::DetectionRecord;
use crate::swarm::registry::{RosterSnapshot, Tick};

/// Object classes the simulated detector can report
const CLASSES: [&str; 3] = ["person", "vehicle", "animal"];

/// Targets keep this far from the world edge when spawned
const SPAWN_MARGIN: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub class: &'static str,
    pub position: Vec2,
}

/// Targets scattered over the world. Agents within detection range report
/// them; a target reached within the capture radius respawns elsewhere.
pub struct TargetField {
    rng: StdRng,
    width: f64,
    height: f64,
    detection_range: f64,
    capture_radius: f64,
    targets: Vec<Target>,
    captured: u64,
}

impl TargetField {
    pub fn new(config: &SimulationConfig, width: f64, height: f64, count: usize) -> Self {
        let mut field = Self {
            rng: StdRng::seed_from_u64(config.seed),
            width,
            height,
            detection_range: config.detection_range,
            capture_radius: config.capture_radius,
            targets: Vec::with_capacity(count),
            captured: 0,
        };
        for _ in 0..count {
            let target = field.spawn();
            field.targets.push(target);
        }
        field
    }

    fn spawn(&mut self) -> Target {
        let x_max = (self.width - SPAWN_MARGIN).max(SPAWN_MARGIN + 1.0);
        let y_max = (self.height - SPAWN_MARGIN).max(SPAWN_MARGIN + 1.0);
        Target {
            class: CLASSES[self.rng.random_range(0..CLASSES.len())],
            position: Vec2::new(
                self.rng.random_range(SPAWN_MARGIN..x_max),
                self.rng.random_range(SPAWN_MARGIN..y_max),
            ),
        }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Targets reached so far
    pub fn captured(&self) -> u64 {
        self.captured
    }

    /// Detections produced by every non-failed agent at `now`. Confidence
    /// falls off linearly from 1.0 at the target to 0.5 at the range edge.
    pub fn observe(&mut self, roster: &RosterSnapshot, now: Tick) -> Vec<DetectionRecord> {
        let mut detections = Vec::new();
        let mut reached = Vec::new();

        for (idx, target) in self.targets.iter().enumerate() {
            for agent in roster.iter().filter(|a| !a.is_failed()) {
                let distance = agent.position.distance(target.position);
                if distance > self.detection_range {
                    continue;
                }
                let confidence = 1.0 - 0.5 * (distance / self.detection_range);
                detections.push(DetectionRecord::new(
                    agent.id,
                    target.class,
                    confidence,
                    target.position,
                    now,
                ));
                if distance <= self.capture_radius && !reached.contains(&idx) {
                    reached.push(idx);
                }
            }
        }

        for idx in reached {
            self.captured += 1;
            self.targets[idx] = self.spawn();
        }
        detections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::registry::{AgentLaunch, AgentRegistry};

    fn roster_at(points: &[Vec2]) -> RosterSnapshot {
        let mut registry = AgentRegistry::new();
        for position in points {
            registry.register(AgentLaunch {
                position: *position,
                velocity: Vec2::ZERO,
                battery: 100.0,
                spacing: 100.0,
            });
        }
        registry.snapshot()
    }

    #[test]
    fn test_same_seed_same_targets() {
        let config = SimulationConfig::default();
        let a = TargetField::new(&config, 1200.0, 800.0, 3);
        let b = TargetField::new(&config, 1200.0, 800.0, 3);
        assert_eq!(a.targets(), b.targets());
        for target in a.targets() {
            assert!((100.0..1100.0).contains(&target.position.x));
            assert!((100.0..700.0).contains(&target.position.y));
        }
    }

    #[test]
    fn test_detection_confidence_falls_with_distance() {
        let config = SimulationConfig::default();
        let mut field = TargetField::new(&config, 1200.0, 800.0, 1);
        let target = field.targets()[0].position;

        let roster = roster_at(&[
            target + Vec2::new(75.0, 0.0),
            target + Vec2::new(0.0, 400.0),
        ]);
        let detections = field.observe(&roster, 7);
        assert_eq!(detections.len(), 1);
        assert!((detections[0].confidence - 0.75).abs() < 1e-9);
        assert_eq!(detections[0].timestamp, 7);
        assert_eq!(field.captured(), 0);
    }

    #[test]
    fn test_captured_target_respawns() {
        let config = SimulationConfig::default();
        let mut field = TargetField::new(&config, 1200.0, 800.0, 1);
        let before = field.targets()[0].clone();

        let roster = roster_at(&[before.position]);
        let detections = field.observe(&roster, 1);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].confidence, 1.0);
        assert_eq!(field.captured(), 1);
        assert_ne!(field.targets()[0], before);
    }
}
