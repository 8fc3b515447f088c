pub mod core;
pub mod simulation;
pub mod swarm;
