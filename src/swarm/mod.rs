//! Swarm coordination: mesh transport, roster, health, fusion, consensus
//! and motion, driven one lock-step tick at a time by the controller.

pub mod consensus;
pub mod controller;
pub mod flight_link;
pub mod fusion;
pub mod geometry;
pub mod health;
pub mod mesh;
pub mod messages;
pub mod motion;
pub mod registry;

pub use controller::{SwarmController, TickReport};
pub use flight_link::{FlightLink, SimulatedFlightLink};
