//! SwarmController - the per-tick orchestrator.
//!
//! Every tick runs the same fixed sequence:
//! 1. recompute mesh links from the latest snapshot
//! 2. deliver pending mesh messages
//! 3. health (heartbeats, battery, operator signals)
//! 4. fusion of newly delivered detections and pattern announcements
//! 5. delivered commands, then motion over the post-health Active set
//! 6. consensus votes and pass/expire evaluation
//! 7. atomic registry commit
//! 8. publish telemetry, patterns and consensus actions for the next tick
//!
//! Failures observed in step 3 are already excluded from steps 5 and 6.

use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};

use super::consensus::{ConsensusEngine, ConsensusOutcome, ProposalId, VoteChoice};
use super::flight_link::{FlightLink, SimulatedFlightLink};
use super::fusion::{Pattern, PatternId, PerceptionFusion};
use super::geometry::Vec2;
use super::health::{HealthInputs, HealthMonitor, HealthTransition, OperatorSignal};
use super::mesh::{compute_links, Delivery, LinkSet, MeshStats, MeshTransport, Origin, Topic};
use super::messages::{Command, DetectionRecord, MeshPayload, TelemetryReport, VoteMessage};
use super::motion::MotionPlanner;
use super::registry::{
    AgentDelta, AgentId, AgentLaunch, AgentRegistry, AgentState, HealthStatus, Mission,
    RosterSnapshot, Tick,
};
use crate::core::config::SwarmConfig;
use crate::core::error::{SwarmError, SwarmResult};

/// Topics every agent listens on besides its own `command.{id}`
const SHARED_SUBSCRIPTIONS: [&str; 5] = [
    "telemetry.*",
    "detection.*",
    "command.broadcast",
    "pattern.*",
    "consensus.*",
];

/// Summary of one tick
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: Tick,
    /// Message copies handed to subscribers in step 2
    pub delivered: usize,
    pub transitions: Vec<HealthTransition>,
    pub detections_ingested: usize,
    /// Patterns created or changed by this tick's detections
    pub patterns_changed: usize,
    pub commands_applied: usize,
    pub outcomes: Vec<ConsensusOutcome>,
    pub active: usize,
    pub degraded: usize,
    pub failed: usize,
}

/// Step 2 deliveries sorted by payload kind
#[derive(Debug, Default)]
struct Inbox {
    /// Agents whose telemetry reached at least one peer
    heartbeats: BTreeSet<AgentId>,
    /// Unique detections keyed by envelope id
    detections: BTreeMap<u64, DetectionRecord>,
    /// Per-recipient commands in publish order
    commands: Vec<(AgentId, Command)>,
    patterns: BTreeMap<u64, Pattern>,
    /// Votes with the tick they were cast at
    votes: BTreeMap<u64, (Tick, VoteMessage)>,
}

impl Inbox {
    fn sort(deliveries: &[Delivery]) -> Self {
        let mut inbox = Inbox::default();
        for delivery in deliveries {
            let envelope = &delivery.envelope;
            match &envelope.payload {
                MeshPayload::Telemetry(report) => {
                    inbox.heartbeats.insert(report.agent_id);
                }
                MeshPayload::Detection(record) => {
                    inbox
                        .detections
                        .entry(envelope.id)
                        .or_insert_with(|| record.clone());
                }
                MeshPayload::Command(command) => {
                    inbox.commands.push((delivery.recipient, *command));
                }
                MeshPayload::Pattern(pattern) => {
                    inbox
                        .patterns
                        .entry(envelope.id)
                        .or_insert_with(|| pattern.clone());
                }
                MeshPayload::Vote(vote) => {
                    inbox.votes.insert(envelope.id, (envelope.published_at, *vote));
                }
                // Proposals are registered with the engine when they are made
                MeshPayload::Proposal(_) => {}
            }
        }
        inbox
    }
}

/// Registry change a delivered command asks for
fn command_delta(agent: AgentId, command: &Command) -> AgentDelta {
    let mission = match *command {
        Command::Waypoint { x, y } => Mission::GoTo {
            target: Vec2::new(x, y),
        },
        Command::ReturnToLaunch => Mission::ReturnToLaunch,
        Command::Loiter => Mission::Loiter,
        Command::EmergencyStop => Mission::Stopped,
        Command::FormationChange { spacing } => {
            return AgentDelta::Spacing { id: agent, spacing };
        }
    };
    AgentDelta::Mission { id: agent, mission }
}

fn is_alive(roster: &RosterSnapshot, agent: AgentId) -> bool {
    roster.get(agent).is_some_and(|a| !a.is_failed())
}

/// The swarm coordinator: sole writer of swarm-wide state
pub struct SwarmController {
    config: SwarmConfig,
    registry: AgentRegistry,
    mesh: MeshTransport,
    links: LinkSet,
    health: HealthMonitor,
    fusion: PerceptionFusion,
    motion: MotionPlanner,
    consensus: ConsensusEngine,
    flight_link: Box<dyn FlightLink>,
    /// Operator signals queued for the next health step
    signals: Vec<OperatorSignal>,
    /// Detections submitted since the last tick; the producer always hears itself
    observations: Vec<(u64, DetectionRecord)>,
    last_active: usize,
}

impl SwarmController {
    pub fn new(config: SwarmConfig, flight_link: Box<dyn FlightLink>) -> SwarmResult<Self> {
        config.validate()?;
        Ok(Self {
            registry: AgentRegistry::new(),
            mesh: MeshTransport::new(),
            links: LinkSet::default(),
            health: HealthMonitor::new(config.health.clone()),
            fusion: PerceptionFusion::new(config.fusion.clone()),
            motion: MotionPlanner::new(config.flocking.clone()),
            consensus: ConsensusEngine::new(&config.consensus),
            flight_link,
            signals: Vec::new(),
            observations: Vec::new(),
            last_active: 0,
            config,
        })
    }

    /// Controller backed by the in-process flight link
    pub fn simulated(config: SwarmConfig) -> SwarmResult<Self> {
        let link = SimulatedFlightLink::new(config.simulation.battery_drain_per_tick);
        Self::new(config, Box::new(link))
    }

    /// Launch parameters for an agent at `position` with configured defaults
    pub fn launch_at(&self, position: Vec2) -> AgentLaunch {
        AgentLaunch {
            position,
            velocity: Vec2::ZERO,
            battery: self.config.health.healthy_battery,
            spacing: self.config.flocking.separation_distance,
        }
    }

    /// Add an agent to the roster and wire it into the mesh and flight link
    pub fn spawn_agent(&mut self, launch: AgentLaunch) -> SwarmResult<AgentId> {
        let id = self.registry.register(launch);
        self.flight_link.register(id, launch.battery);

        self.mesh.subscribe(id, &format!("command.{}", id))?;
        for pattern in SHARED_SUBSCRIPTIONS {
            self.mesh.subscribe(id, pattern)?;
        }

        let active = self.registry.snapshot().active_count();
        info!("{} launched at {}; {} active agents", id, launch.position, active);
        self.last_active = active;
        Ok(id)
    }

    /// Queue a detection from `record.producer`. It reaches the fusion step
    /// of the next tick, and peers hear it over the mesh.
    pub fn submit_detection(&mut self, record: DetectionRecord) -> SwarmResult<u64> {
        self.require_alive(record.producer)?;
        PerceptionFusion::validate(&record)?;

        let envelope = self
            .mesh
            .publish(
                Origin::Agent(record.producer),
                Topic::Detection(record.producer),
                MeshPayload::Detection(record.clone()),
                self.registry.tick(),
            )
            .ok_or_else(|| SwarmError::InvalidDetection("detection does not fit its topic".into()))?;
        self.observations.push((envelope, record));
        Ok(envelope)
    }

    /// Send a command from the operator console to one agent, or to all
    /// agents when `target` is `None`
    pub fn operator_command(&mut self, target: Option<AgentId>, command: Command) -> SwarmResult<u64> {
        let topic = match target {
            Some(agent) => {
                self.require_known(agent)?;
                Topic::Command(agent)
            }
            None => Topic::CommandBroadcast,
        };
        self.mesh
            .publish(Origin::Operator, topic, MeshPayload::Command(command), self.registry.tick())
            .ok_or_else(|| SwarmError::InvalidCommand(command.to_string()))
    }

    /// Wire-format entry point for edge nodes. Malformed input is logged and
    /// dropped by the transport.
    pub fn publish_raw(&mut self, origin: Origin, topic: &str, body: &str) -> Option<u64> {
        self.mesh.publish_raw(origin, topic, body, self.registry.tick())
    }

    /// Force `agent` to Failed at the next health step
    pub fn inject_failure(&mut self, agent: AgentId) -> SwarmResult<()> {
        self.require_known(agent)?;
        warn!("Operator injected failure on {}", agent);
        self.signals.push(OperatorSignal::InjectFailure(agent));
        Ok(())
    }

    /// Reconnect `agent` at the next health step
    pub fn reset_agent(&mut self, agent: AgentId) -> SwarmResult<()> {
        self.require_known(agent)?;
        info!("Operator reset requested for {}", agent);
        self.signals.push(OperatorSignal::Reset(agent));
        Ok(())
    }

    /// Override the battery level the autopilot reports for `agent`
    pub fn set_battery(&mut self, agent: AgentId, level: f64) -> SwarmResult<()> {
        self.require_known(agent)?;
        info!("Operator set battery of {} to {:.1}%", agent, level);
        self.flight_link.set_battery(agent, level)
    }

    /// Open a proposal and announce it on `consensus.{id}`. Without an
    /// explicit deadline the configured default applies.
    pub fn propose(
        &mut self,
        proposer: AgentId,
        action: Command,
        deadline: Option<Tick>,
    ) -> SwarmResult<ProposalId> {
        if !action.is_well_formed() {
            return Err(SwarmError::InvalidCommand(action.to_string()));
        }
        let now = self.registry.tick();
        let deadline = deadline.unwrap_or(now + self.consensus.default_deadline());
        let snapshot = self.registry.snapshot();
        let announcement = self
            .consensus
            .propose(proposer, action, deadline, now, &snapshot)?;

        let id = announcement.proposal_id;
        self.mesh.publish(
            Origin::Agent(proposer),
            Topic::Consensus(id),
            MeshPayload::Proposal(announcement),
            now,
        );
        Ok(id)
    }

    /// Publish a vote on `consensus.{id}`. It counts once the mesh delivers
    /// it to at least one peer.
    pub fn cast_vote(&mut self, agent: AgentId, id: ProposalId, choice: VoteChoice) -> SwarmResult<()> {
        self.require_alive(agent)?;
        if self.consensus.get(id).is_none() {
            return Err(SwarmError::UnknownProposal(id));
        }
        let vote = VoteMessage {
            proposal_id: id,
            agent_id: agent,
            choice,
        };
        self.mesh.publish(
            Origin::Agent(agent),
            Topic::Consensus(id),
            MeshPayload::Vote(vote),
            self.registry.tick(),
        );
        Ok(())
    }

    /// Advance the swarm by one tick
    pub fn tick(&mut self) -> SwarmResult<TickReport> {
        let now = self.registry.tick() + 1;
        let snapshot = self.registry.snapshot();

        // 1. Links
        self.links = compute_links(&snapshot, self.config.mesh.communication_range);

        // 2. Delivery
        let deliveries = self.mesh.deliver(&self.links, &snapshot);
        let inbox = Inbox::sort(&deliveries);

        // 3. Health
        let signals = std::mem::take(&mut self.signals);
        for signal in &signals {
            if let OperatorSignal::Reset(agent) = signal {
                if let Err(e) = self
                    .flight_link
                    .set_battery(*agent, self.config.health.healthy_battery)
                {
                    warn!("Autopilot of {} rejected battery reset: {}", agent, e);
                }
            }
        }
        let battery = self
            .flight_link
            .poll_battery(now)
            .into_iter()
            .map(|reading| (reading.agent, reading.level))
            .collect();
        let inputs = HealthInputs {
            heartbeats: inbox.heartbeats.clone(),
            battery,
            signals,
        };
        let health = self.health.evaluate(&snapshot, now, &inputs);
        let mut deltas = health.deltas;
        let view = snapshot.overlay(&deltas)?;

        // 4. Fusion
        let mut detections = inbox.detections;
        for (envelope, record) in std::mem::take(&mut self.observations) {
            detections.entry(envelope).or_insert(record);
        }
        let mut changed: BTreeMap<PatternId, Pattern> = BTreeMap::new();
        let mut detections_ingested = 0;
        for record in detections.values() {
            match self.fusion.ingest(record) {
                Ok(outcome) => {
                    detections_ingested += 1;
                    if outcome.should_publish() {
                        changed.insert(outcome.pattern.id.clone(), outcome.pattern);
                    }
                }
                Err(e) => warn!("Dropping detection from {}: {}", record.producer, e),
            }
        }
        for pattern in inbox.patterns.values() {
            if let Err(e) = self.fusion.merge_pattern(pattern) {
                warn!("Dropping pattern announcement: {}", e);
            }
        }
        let pruned = self.fusion.prune(now);
        if pruned > 0 {
            debug!("Pruned {} expired patterns", pruned);
        }

        // 5. Commands, then motion
        let mut command_deltas = Vec::new();
        for (agent, command) in &inbox.commands {
            if !is_alive(&view, *agent) {
                continue;
            }
            if let Err(e) = self.flight_link.dispatch(*agent, command) {
                warn!("Autopilot of {} rejected {}: {}", agent, command, e);
            }
            command_deltas.push(command_delta(*agent, command));
        }
        let commands_applied = command_deltas.len();
        let view = view.overlay(&command_deltas)?;
        deltas.extend(command_deltas);

        let target = self.fusion.target(now).map(|pattern| pattern.location);
        deltas.extend(self.motion.plan(&view, target));

        // 6. Consensus
        // The deadline applies to when a vote was cast, not when it arrived
        for (cast_at, vote) in inbox.votes.values() {
            if let Err(e) = self
                .consensus
                .vote(vote.proposal_id, vote.agent_id, vote.choice, *cast_at, &view)
            {
                debug!("Ignoring vote from {}: {}", vote.agent_id, e);
            }
        }
        let outcomes = self.consensus.evaluate(now, &view);

        // 7. Commit
        self.registry.apply_updates(&deltas, now)?;

        // 8. Publish for the next tick
        let committed = self.registry.snapshot();
        self.publish_telemetry(&committed, now);
        self.publish_patterns(&committed, changed.values(), now);
        for outcome in &outcomes {
            self.mesh.publish(
                Origin::Operator,
                Topic::CommandBroadcast,
                MeshPayload::Command(outcome.action),
                now,
            );
        }

        let report = TickReport {
            tick: now,
            delivered: deliveries.len(),
            transitions: health.transitions,
            detections_ingested,
            patterns_changed: changed.len(),
            commands_applied,
            outcomes,
            active: committed.active_count(),
            degraded: committed
                .iter()
                .filter(|a| a.status == HealthStatus::Degraded)
                .count(),
            failed: committed.iter().filter(|a| a.is_failed()).count(),
        };

        if report.active != self.last_active {
            info!(
                "Active roster changed at tick {}: {} -> {} agents",
                now, self.last_active, report.active
            );
            self.last_active = report.active;
        }
        debug!(
            "Tick {}: {} delivered, {} detections, {} active / {} degraded / {} failed",
            now,
            report.delivered,
            report.detections_ingested,
            report.active,
            report.degraded,
            report.failed
        );

        Ok(report)
    }

    /// Run `ticks` ticks back to back
    pub fn run(&mut self, ticks: u64) -> SwarmResult<Vec<TickReport>> {
        (0..ticks).map(|_| self.tick()).collect()
    }

    fn publish_telemetry(&mut self, roster: &RosterSnapshot, now: Tick) {
        for agent in roster.iter().filter(|a| !a.is_failed()) {
            let report = TelemetryReport {
                agent_id: agent.id,
                timestamp: now,
                position: agent.position,
                battery: agent.battery,
                status: agent.status,
            };
            self.mesh.publish(
                Origin::Agent(agent.id),
                Topic::Telemetry(agent.id),
                MeshPayload::Telemetry(report),
                now,
            );
        }
    }

    /// Announce changed patterns from the lead producer, or from the lowest
    /// contributor still flying when the lead has failed
    fn publish_patterns<'a>(
        &mut self,
        roster: &RosterSnapshot,
        patterns: impl Iterator<Item = &'a Pattern>,
        now: Tick,
    ) {
        for pattern in patterns {
            let announcer = std::iter::once(pattern.lead_producer)
                .chain(pattern.contributors.iter().copied())
                .find(|agent| is_alive(roster, *agent));
            match announcer {
                Some(agent) => {
                    self.mesh.publish(
                        Origin::Agent(agent),
                        Topic::Pattern(pattern.id.clone()),
                        MeshPayload::Pattern(pattern.clone()),
                        now,
                    );
                }
                None => debug!("No live contributor left to announce {}", pattern.id),
            }
        }
    }

    fn require_known(&self, agent: AgentId) -> SwarmResult<&AgentState> {
        self.registry.get(agent).ok_or(SwarmError::UnknownAgent(agent))
    }

    fn require_alive(&self, agent: AgentId) -> SwarmResult<()> {
        if self.require_known(agent)?.is_failed() {
            return Err(SwarmError::NotEligible(agent));
        }
        Ok(())
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn tick_count(&self) -> Tick {
        self.registry.tick()
    }

    pub fn snapshot(&self) -> RosterSnapshot {
        self.registry.snapshot()
    }

    pub fn agent(&self, id: AgentId) -> Option<&AgentState> {
        self.registry.get(id)
    }

    /// Links computed in the last tick
    pub fn links(&self) -> &LinkSet {
        &self.links
    }

    pub fn fusion(&self) -> &PerceptionFusion {
        &self.fusion
    }

    /// Direct store access, used to restore an archive before the first tick
    pub fn fusion_mut(&mut self) -> &mut PerceptionFusion {
        &mut self.fusion
    }

    pub fn consensus(&self) -> &ConsensusEngine {
        &self.consensus
    }

    pub fn mesh_stats(&self) -> MeshStats {
        self.mesh.stats()
    }
}
