use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::core::error::SwarmError;
use crate::swarm::messages::Command;

/// Top-level configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SwarmConfig {
    /// Mesh transport configuration
    #[serde(default)]
    pub mesh: MeshConfig,

    /// Flocking / motion configuration
    #[serde(default)]
    pub flocking: FlockingConfig,

    /// Health monitoring configuration
    #[serde(default)]
    pub health: HealthConfig,

    /// Detection fusion configuration
    #[serde(default)]
    pub fusion: FusionConfig,

    /// Consensus configuration
    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// Simulation driver configuration
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Mesh transport configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MeshConfig {
    /// Maximum link distance between two agents
    #[serde(default = "default_communication_range")]
    pub communication_range: f64,
}

/// Flocking configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FlockingConfig {
    /// Speed limit applied after the steering terms are summed
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,

    /// Neighbours closer than this push the agent away
    #[serde(default = "default_separation_distance")]
    pub separation_distance: f64,

    /// Radius used for cohesion and alignment neighbours
    #[serde(default = "default_cohesion_radius")]
    pub cohesion_radius: f64,

    #[serde(default = "default_separation_weight")]
    pub separation_weight: f64,

    #[serde(default = "default_cohesion_weight")]
    pub cohesion_weight: f64,

    #[serde(default = "default_alignment_weight")]
    pub alignment_weight: f64,

    /// Weight of the pull towards a target pattern or waypoint
    #[serde(default = "default_target_weight")]
    pub target_weight: f64,

    /// Distance at which a waypoint or launch point counts as reached
    #[serde(default = "default_arrival_radius")]
    pub arrival_radius: f64,

    /// Optional world width; positions wrap around when both bounds are set
    #[serde(default)]
    pub world_width: Option<f64>,

    /// Optional world height
    #[serde(default)]
    pub world_height: Option<f64>,
}

/// Health monitoring configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Expected ticks between two heartbeats of the same agent
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ticks: u64,

    /// Missed heartbeats tolerated before an agent is Degraded
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u64,

    /// Missed heartbeats after which an agent is considered lost (Failed)
    #[serde(default = "default_lost_contact_heartbeats")]
    pub lost_contact_heartbeats: u64,

    /// Battery percentage below which an agent is Degraded
    #[serde(default = "default_low_battery")]
    pub low_battery_threshold: f64,

    /// Battery percentage at or below which an agent is Failed
    #[serde(default = "default_critical_battery")]
    pub critical_battery_threshold: f64,

    /// Battery level restored by an operator reset
    #[serde(default = "default_healthy_battery")]
    pub healthy_battery: f64,
}

/// Detection fusion configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FusionConfig {
    /// Edge length of a spatial bucket
    #[serde(default = "default_cell_size")]
    pub cell_size: f64,

    /// Width of a time bucket in ticks
    #[serde(default = "default_time_window")]
    pub time_window_ticks: u64,

    /// Patterns not refreshed for this many ticks are stale
    #[serde(default = "default_pattern_ttl")]
    pub pattern_ttl_ticks: u64,

    /// Patterns not refreshed for this many ticks are dropped from the store
    #[serde(default = "default_pattern_retention")]
    pub pattern_retention_ticks: u64,

    /// Minimum merged confidence for a pattern to attract the flock
    #[serde(default = "default_target_confidence")]
    pub target_confidence_threshold: f64,
}

/// Consensus configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConsensusConfig {
    /// Percentage of the Active roster whose approval passes a proposal
    #[serde(default = "default_quorum_percent")]
    pub quorum_percent: u32,

    /// Deadline used when a proposal does not specify one
    #[serde(default = "default_deadline_ticks")]
    pub default_deadline_ticks: u64,

    /// Action broadcast when a proposal expires
    #[serde(default = "default_fallback_action")]
    pub fallback_action: Command,
}

/// Simulation driver configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SimulationConfig {
    /// Battery percentage consumed per tick by the simulated flight link
    #[serde(default = "default_battery_drain")]
    pub battery_drain_per_tick: f64,

    /// Distance within which an agent detects a target
    #[serde(default = "default_detection_range")]
    pub detection_range: f64,

    /// Distance within which a target counts as captured and respawns
    #[serde(default = "default_capture_radius")]
    pub capture_radius: f64,

    /// Seed for every random choice made by the driver
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Directory for the pattern archive; no archive is written when unset
    #[serde(default)]
    pub data_dir: Option<String>,
}

// Default values for optional configuration
fn default_communication_range() -> f64 {
    300.0
}

fn default_max_speed() -> f64 {
    2.0
}

fn default_separation_distance() -> f64 {
    100.0
}

fn default_cohesion_radius() -> f64 {
    200.0
}

fn default_separation_weight() -> f64 {
    0.1
}

fn default_cohesion_weight() -> f64 {
    0.01
}

fn default_alignment_weight() -> f64 {
    0.05
}

fn default_target_weight() -> f64 {
    0.02
}

fn default_arrival_radius() -> f64 {
    30.0
}

fn default_heartbeat_interval() -> u64 {
    1
}

fn default_max_missed_heartbeats() -> u64 {
    3
}

fn default_lost_contact_heartbeats() -> u64 {
    10
}

fn default_low_battery() -> f64 {
    20.0
}

fn default_critical_battery() -> f64 {
    0.5
}

fn default_healthy_battery() -> f64 {
    100.0
}

fn default_cell_size() -> f64 {
    50.0
}

fn default_time_window() -> u64 {
    30
}

fn default_pattern_ttl() -> u64 {
    120
}

fn default_pattern_retention() -> u64 {
    600
}

fn default_target_confidence() -> f64 {
    0.6
}

fn default_quorum_percent() -> u32 {
    51
}

fn default_deadline_ticks() -> u64 {
    30
}

fn default_fallback_action() -> Command {
    Command::Loiter
}

fn default_battery_drain() -> f64 {
    0.01
}

fn default_detection_range() -> f64 {
    150.0
}

fn default_capture_radius() -> f64 {
    30.0
}

fn default_seed() -> u64 {
    42
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            communication_range: default_communication_range(),
        }
    }
}

impl Default for FlockingConfig {
    fn default() -> Self {
        Self {
            max_speed: default_max_speed(),
            separation_distance: default_separation_distance(),
            cohesion_radius: default_cohesion_radius(),
            separation_weight: default_separation_weight(),
            cohesion_weight: default_cohesion_weight(),
            alignment_weight: default_alignment_weight(),
            target_weight: default_target_weight(),
            arrival_radius: default_arrival_radius(),
            world_width: None,
            world_height: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ticks: default_heartbeat_interval(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            lost_contact_heartbeats: default_lost_contact_heartbeats(),
            low_battery_threshold: default_low_battery(),
            critical_battery_threshold: default_critical_battery(),
            healthy_battery: default_healthy_battery(),
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            cell_size: default_cell_size(),
            time_window_ticks: default_time_window(),
            pattern_ttl_ticks: default_pattern_ttl(),
            pattern_retention_ticks: default_pattern_retention(),
            target_confidence_threshold: default_target_confidence(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            quorum_percent: default_quorum_percent(),
            default_deadline_ticks: default_deadline_ticks(),
            fallback_action: default_fallback_action(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            battery_drain_per_tick: default_battery_drain(),
            detection_range: default_detection_range(),
            capture_radius: default_capture_radius(),
            seed: default_seed(),
            data_dir: None,
        }
    }
}

impl FlockingConfig {
    /// World bounds, only when both dimensions are configured
    pub fn world_bounds(&self) -> Option<(f64, f64)> {
        match (self.world_width, self.world_height) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        }
    }
}

impl SwarmConfig {
    /// Load configuration from a TOML file, with `SKYSWARM__SECTION__KEY`
    /// environment variables taking precedence over file values
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("SKYSWARM")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: SwarmConfig = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), SwarmError> {
        let fail = |msg: &str| Err(SwarmError::ConfigError(msg.to_string()));

        if self.mesh.communication_range <= 0.0 {
            return fail("mesh.communication_range must be positive");
        }
        if self.flocking.max_speed <= 0.0 {
            return fail("flocking.max_speed must be positive");
        }
        if self.flocking.separation_distance <= 0.0 || self.flocking.cohesion_radius <= 0.0 {
            return fail("flocking radii must be positive");
        }
        let weights = [
            self.flocking.separation_weight,
            self.flocking.cohesion_weight,
            self.flocking.alignment_weight,
            self.flocking.target_weight,
        ];
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return fail("flocking weights must be finite and non-negative");
        }
        if let Some((w, h)) = self.flocking.world_bounds() {
            if w <= 0.0 || h <= 0.0 {
                return fail("world bounds must be positive");
            }
        }
        if self.health.heartbeat_interval_ticks == 0 {
            return fail("health.heartbeat_interval_ticks must be at least 1");
        }
        if self.health.lost_contact_heartbeats <= self.health.max_missed_heartbeats {
            return fail("health.lost_contact_heartbeats must exceed max_missed_heartbeats");
        }
        if self.health.critical_battery_threshold >= self.health.low_battery_threshold {
            return fail("health.critical_battery_threshold must be below low_battery_threshold");
        }
        if !(0.0..=100.0).contains(&self.health.healthy_battery) {
            return fail("health.healthy_battery must be within 0..=100");
        }
        if self.fusion.cell_size <= 0.0 || self.fusion.time_window_ticks == 0 {
            return fail("fusion buckets must have a positive size");
        }
        if !(0.0..=1.0).contains(&self.fusion.target_confidence_threshold) {
            return fail("fusion.target_confidence_threshold must be within 0..=1");
        }
        if self.consensus.quorum_percent == 0 || self.consensus.quorum_percent > 100 {
            return fail("consensus.quorum_percent must be within 1..=100");
        }
        if self.simulation.battery_drain_per_tick < 0.0 {
            return fail("simulation.battery_drain_per_tick must not be negative");
        }

        Ok(())
    }

    /// Create a new config with default values for testing
    #[cfg(test)]
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        // Keep batteries stable so tests only see the failures they inject
        config.simulation.battery_drain_per_tick = 0.0;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SwarmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.consensus.quorum_percent, 51);
        assert_eq!(config.mesh.communication_range, 300.0);
        assert_eq!(config.consensus.fallback_action, Command::Loiter);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SwarmConfig = toml::from_str(
            r#"
[flocking]
max_speed = 5.0

[consensus]
quorum_percent = 67
"#,
        )
        .expect("Failed to parse config");

        assert_eq!(config.flocking.max_speed, 5.0);
        assert_eq!(config.flocking.separation_distance, 100.0);
        assert_eq!(config.consensus.quorum_percent, 67);
        assert_eq!(config.health.max_missed_heartbeats, 3);
    }

    #[test]
    fn test_validate_rejects_inverted_battery_thresholds() {
        let mut config = SwarmConfig::default();
        config.health.critical_battery_threshold = 30.0;
        assert!(matches!(
            config.validate(),
            Err(SwarmError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_quorum() {
        let mut config = SwarmConfig::default();
        config.consensus.quorum_percent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_world_bounds_require_both_dimensions() {
        let mut config = FlockingConfig::default();
        config.world_width = Some(1200.0);
        assert_eq!(config.world_bounds(), None);
        config.world_height = Some(800.0);
        assert_eq!(config.world_bounds(), Some((1200.0, 800.0)));
    }
}
