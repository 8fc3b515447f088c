use skyswarm::core::config::SwarmConfig;
use skyswarm::swarm::messages::Command;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_config_file_overrides_defaults() {
    let dir = tempdir().expect("Failed to create temp directory");
    let path = dir.path().join("swarm.toml");
    fs::write(
        &path,
        r#"
[mesh]
communication_range = 450.0

[flocking]
max_speed = 12.5
world_width = 1600.0
world_height = 900.0

[health]
max_missed_heartbeats = 5
lost_contact_heartbeats = 20

[consensus]
quorum_percent = 67

[simulation]
seed = 7
"#,
    )
    .unwrap();

    let config = SwarmConfig::from_file(&path).expect("Failed to load config");
    assert_eq!(config.mesh.communication_range, 450.0);
    assert_eq!(config.flocking.max_speed, 12.5);
    assert_eq!(config.flocking.world_bounds(), Some((1600.0, 900.0)));
    assert_eq!(config.health.max_missed_heartbeats, 5);
    assert_eq!(config.health.lost_contact_heartbeats, 20);
    assert_eq!(config.consensus.quorum_percent, 67);
    assert_eq!(config.consensus.fallback_action, Command::Loiter);
    assert_eq!(config.simulation.seed, 7);

    // Untouched sections keep their defaults
    assert_eq!(config.fusion.cell_size, SwarmConfig::default().fusion.cell_size);
}

#[test]
fn test_out_of_range_values_are_rejected() {
    let dir = tempdir().expect("Failed to create temp directory");
    let path = dir.path().join("swarm.toml");
    fs::write(
        &path,
        r#"
[health]
max_missed_heartbeats = 10
lost_contact_heartbeats = 4
"#,
    )
    .unwrap();

    let err = SwarmConfig::from_file(&path).unwrap_err();
    assert!(err.to_string().contains("lost_contact_heartbeats"));
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempdir().expect("Failed to create temp directory");
    assert!(SwarmConfig::from_file(dir.path().join("absent.toml")).is_err());
}
