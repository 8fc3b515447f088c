//! Seam to the per-agent flight controller.
//!
//! The core only needs battery readings out of the autopilot and a way to
//! hand it commands. `SimulatedFlightLink` stands in for the serial link in
//! simulation and tests.

use log::debug;
use std::collections::BTreeMap;

use super::messages::Command;
use super::registry::{AgentId, Tick};
use crate::core::error::{SwarmError, SwarmResult};

/// One battery sample reported by the autopilot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryReading {
    pub agent: AgentId,
    pub level: f64,
}

/// Flight controller interface
pub trait FlightLink: Send {
    /// Start tracking a newly launched agent
    fn register(&mut self, agent: AgentId, battery: f64);

    /// Battery levels for every tracked agent at `tick`
    fn poll_battery(&mut self, tick: Tick) -> Vec<BatteryReading>;

    /// Forward a command to the agent's autopilot
    fn dispatch(&mut self, agent: AgentId, command: &Command) -> SwarmResult<()>;

    /// Force the reported battery level (charge event or operator override)
    fn set_battery(&mut self, agent: AgentId, level: f64) -> SwarmResult<()>;
}

/// In-process flight link with a linear battery drain
#[derive(Debug, Default)]
pub struct SimulatedFlightLink {
    drain_per_tick: f64,
    batteries: BTreeMap<AgentId, f64>,
    last_poll: Option<Tick>,
    dispatched: Vec<(AgentId, Command)>,
}

impl SimulatedFlightLink {
    pub fn new(drain_per_tick: f64) -> Self {
        Self {
            drain_per_tick,
            ..Default::default()
        }
    }

    pub fn battery(&self, agent: AgentId) -> Option<f64> {
        self.batteries.get(&agent).copied()
    }

    /// Commands forwarded so far, in dispatch order
    pub fn dispatched(&self) -> &[(AgentId, Command)] {
        &self.dispatched
    }
}

impl FlightLink for SimulatedFlightLink {
    fn register(&mut self, agent: AgentId, battery: f64) {
        self.batteries.insert(agent, battery.clamp(0.0, 100.0));
    }

    fn poll_battery(&mut self, tick: Tick) -> Vec<BatteryReading> {
        // Drain once per elapsed tick, even if polls are skipped
        let elapsed = match self.last_poll {
            Some(last) => tick.saturating_sub(last),
            None => 1,
        };
        self.last_poll = Some(tick);

        let drain = self.drain_per_tick * elapsed as f64;
        self.batteries
            .iter_mut()
            .map(|(agent, level)| {
                *level = (*level - drain).max(0.0);
                BatteryReading {
                    agent: *agent,
                    level: *level,
                }
            })
            .collect()
    }

    fn dispatch(&mut self, agent: AgentId, command: &Command) -> SwarmResult<()> {
        if !self.batteries.contains_key(&agent) {
            return Err(SwarmError::FlightLinkError(format!(
                "no autopilot link for {}",
                agent
            )));
        }
        debug!("Autopilot {} <- {}", agent, command);
        self.dispatched.push((agent, *command));
        Ok(())
    }

    fn set_battery(&mut self, agent: AgentId, level: f64) -> SwarmResult<()> {
        match self.batteries.get_mut(&agent) {
            Some(battery) => {
                *battery = level.clamp(0.0, 100.0);
                Ok(())
            }
            None => Err(SwarmError::UnknownAgent(agent)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_drains_per_elapsed_tick() {
        let mut link = SimulatedFlightLink::new(0.5);
        link.register(AgentId(1), 10.0);

        let readings = link.poll_battery(1);
        assert_eq!(readings, vec![BatteryReading { agent: AgentId(1), level: 9.5 }]);

        let readings = link.poll_battery(5);
        assert_eq!(readings[0].level, 7.5);
    }

    #[test]
    fn test_battery_never_goes_negative() {
        let mut link = SimulatedFlightLink::new(3.0);
        link.register(AgentId(1), 2.0);
        assert_eq!(link.poll_battery(1)[0].level, 0.0);
    }

    #[test]
    fn test_set_battery() {
        let mut link = SimulatedFlightLink::new(0.0);
        link.register(AgentId(1), 80.0);
        link.set_battery(AgentId(1), 0.0).unwrap();
        assert_eq!(link.battery(AgentId(1)), Some(0.0));
        assert!(matches!(
            link.set_battery(AgentId(2), 50.0),
            Err(SwarmError::UnknownAgent(AgentId(2)))
        ));
    }

    #[test]
    fn test_dispatch_requires_registered_agent() {
        let mut link = SimulatedFlightLink::new(0.0);
        link.register(AgentId(1), 100.0);
        link.dispatch(AgentId(1), &Command::Loiter).unwrap();
        assert_eq!(link.dispatched(), &[(AgentId(1), Command::Loiter)]);
        assert!(matches!(
            link.dispatch(AgentId(9), &Command::Loiter),
            Err(SwarmError::FlightLinkError(_))
        ));
    }
}
