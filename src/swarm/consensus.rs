//! Quorum voting on coordinated swarm actions.
//!
//! A proposal is Open until it collects enough approvals (Passed), runs past
//! its deadline (Expired) or is retracted by its proposer (Failed). The
//! quorum denominator is the Active roster at evaluation time, so agents
//! that fail mid-vote make the threshold easier to reach.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::messages::{Command, ProposalAnnouncement};
use super::registry::{AgentId, RosterSnapshot, Tick};
use crate::core::config::ConsensusConfig;
use crate::core::error::{SwarmError, SwarmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(pub u64);

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proposal-{}", self.0)
    }
}

impl std::str::FromStr for ProposalId {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("proposal-").unwrap_or(s);
        digits
            .parse::<u64>()
            .map(ProposalId)
            .map_err(|_| SwarmError::ConfigError(format!("invalid proposal id: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Open,
    Passed,
    /// Abandoned by the proposer before quorum or deadline
    Failed,
    /// Deadline reached without quorum
    Expired,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        *self != ProposalStatus::Open
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalStatus::Open => write!(f, "Open"),
            ProposalStatus::Passed => write!(f, "Passed"),
            ProposalStatus::Failed => write!(f, "Failed"),
            ProposalStatus::Expired => write!(f, "Expired"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VoteChoice {
    Approve,
    Reject,
}

/// A coordinated action awaiting agreement
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub id: ProposalId,
    pub proposer: AgentId,
    pub action: Command,
    pub created_at: Tick,
    pub deadline: Tick,
    pub status: ProposalStatus,
    /// One entry per voter; a later vote overwrites the earlier one
    pub votes: BTreeMap<AgentId, VoteChoice>,
}

impl Proposal {
    pub fn announcement(&self) -> ProposalAnnouncement {
        ProposalAnnouncement {
            proposal_id: self.id,
            proposer_id: self.proposer,
            action: self.action,
            deadline: self.deadline,
        }
    }

    /// Approvals from agents that are Active in `roster`
    pub fn approvals(&self, roster: &RosterSnapshot) -> usize {
        self.votes
            .iter()
            .filter(|(agent, choice)| {
                **choice == VoteChoice::Approve && roster.get(**agent).is_some_and(|a| a.is_active())
            })
            .count()
    }
}

/// A proposal that reached a terminal state during evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusOutcome {
    pub id: ProposalId,
    pub status: ProposalStatus,
    /// Action to broadcast: the proposal's own on Passed, the fallback on Expired
    pub action: Command,
    pub approvals: usize,
    pub threshold: usize,
}

/// Runs the proposal state machines
#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    proposals: BTreeMap<ProposalId, Proposal>,
    next_id: u64,
    quorum_percent: u32,
    default_deadline: Tick,
    fallback: Command,
}

impl ConsensusEngine {
    pub fn new(config: &ConsensusConfig) -> Self {
        Self {
            proposals: BTreeMap::new(),
            next_id: 1,
            quorum_percent: config.quorum_percent,
            default_deadline: config.default_deadline_ticks,
            fallback: config.fallback_action,
        }
    }

    /// Minimum approvals needed with `active` agents: ceil(percent * active / 100),
    /// never below one
    pub fn quorum_threshold(&self, active: usize) -> usize {
        let percent = self.quorum_percent as usize;
        (percent * active).div_ceil(100).max(1)
    }

    pub fn default_deadline(&self) -> Tick {
        self.default_deadline
    }

    /// Open a proposal. The proposer must be a non-Failed roster member.
    pub fn propose(
        &mut self,
        proposer: AgentId,
        action: Command,
        deadline: Tick,
        now: Tick,
        roster: &RosterSnapshot,
    ) -> SwarmResult<ProposalAnnouncement> {
        match roster.get(proposer) {
            Some(agent) if !agent.is_failed() => {}
            _ => return Err(SwarmError::NotEligible(proposer)),
        }

        let id = ProposalId(self.next_id);
        self.next_id += 1;

        let proposal = Proposal {
            id,
            proposer,
            action,
            created_at: now,
            deadline,
            status: ProposalStatus::Open,
            votes: BTreeMap::new(),
        };
        info!(
            "{} proposed {} by {} (deadline tick {})",
            id, action, proposer, deadline
        );
        let announcement = proposal.announcement();
        self.proposals.insert(id, proposal);
        Ok(announcement)
    }

    /// Record a vote cast at tick `cast_at`. Accepted only while the
    /// proposal is Open, when cast before its deadline, from a non-Failed
    /// roster member.
    pub fn vote(
        &mut self,
        id: ProposalId,
        agent: AgentId,
        choice: VoteChoice,
        cast_at: Tick,
        roster: &RosterSnapshot,
    ) -> SwarmResult<()> {
        let proposal = self
            .proposals
            .get_mut(&id)
            .ok_or(SwarmError::UnknownProposal(id))?;

        if proposal.status.is_terminal() {
            return Err(SwarmError::ProposalClosed {
                id,
                status: proposal.status,
            });
        }
        if cast_at >= proposal.deadline {
            return Err(SwarmError::DeadlinePassed(id));
        }
        match roster.get(agent) {
            Some(state) if !state.is_failed() => {}
            _ => return Err(SwarmError::NotEligible(agent)),
        }

        if let Some(previous) = proposal.votes.insert(agent, choice) {
            if previous != choice {
                debug!("{} changed vote on {}: {:?} -> {:?}", agent, id, previous, choice);
            }
        }
        Ok(())
    }

    /// Abandon a proposal. Only its proposer may do this.
    pub fn retract(&mut self, id: ProposalId, agent: AgentId) -> SwarmResult<()> {
        let proposal = self
            .proposals
            .get_mut(&id)
            .ok_or(SwarmError::UnknownProposal(id))?;

        if proposal.proposer != agent {
            return Err(SwarmError::NotProposer { agent, id });
        }
        if proposal.status.is_terminal() {
            return Err(SwarmError::ProposalClosed {
                id,
                status: proposal.status,
            });
        }
        proposal.status = ProposalStatus::Failed;
        info!("{} retracted by {}", id, agent);
        Ok(())
    }

    /// Re-evaluate every Open proposal against the current roster
    pub fn evaluate(&mut self, now: Tick, roster: &RosterSnapshot) -> Vec<ConsensusOutcome> {
        let threshold = self.quorum_threshold(roster.active_count());
        let fallback = self.fallback;
        let mut outcomes = Vec::new();

        for proposal in self.proposals.values_mut() {
            if proposal.status.is_terminal() {
                continue;
            }

            let approvals = proposal.approvals(roster);
            let (status, action) = if approvals >= threshold {
                info!(
                    "{} passed with {}/{} approvals: executing {}",
                    proposal.id, approvals, threshold, proposal.action
                );
                (ProposalStatus::Passed, proposal.action)
            } else if now >= proposal.deadline {
                warn!(
                    "{} expired with {}/{} approvals: falling back to {}",
                    proposal.id, approvals, threshold, fallback
                );
                (ProposalStatus::Expired, fallback)
            } else {
                continue;
            };

            proposal.status = status;
            outcomes.push(ConsensusOutcome {
                id: proposal.id,
                status,
                action,
                approvals,
                threshold,
            });
        }

        outcomes
    }

    pub fn get(&self, id: ProposalId) -> Option<&Proposal> {
        self.proposals.get(&id)
    }

    pub fn proposals(&self) -> impl Iterator<Item = &Proposal> {
        self.proposals.values()
    }

    pub fn open_count(&self) -> usize {
        self.proposals
            .values()
            .filter(|p| p.status == ProposalStatus::Open)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::geometry::Vec2;
    use crate::swarm::registry::{AgentDelta, AgentLaunch, AgentRegistry, HealthStatus};
    use proptest::prelude::*;

    fn roster(n: usize) -> (AgentRegistry, Vec<AgentId>) {
        let mut registry = AgentRegistry::new();
        let ids = (0..n)
            .map(|i| {
                registry.register(AgentLaunch {
                    position: Vec2::new(i as f64, 0.0),
                    velocity: Vec2::ZERO,
                    battery: 100.0,
                    spacing: 100.0,
                })
            })
            .collect();
        (registry, ids)
    }

    fn fail(registry: &mut AgentRegistry, id: AgentId, tick: Tick) {
        registry
            .apply_updates(
                &[AgentDelta::Health {
                    id,
                    status: HealthStatus::Failed,
                    battery: 0.0,
                    last_heartbeat: tick,
                    reset: false,
                }],
                tick,
            )
            .unwrap();
    }

    fn engine() -> ConsensusEngine {
        ConsensusEngine::new(&ConsensusConfig::default())
    }

    #[test]
    fn test_quorum_threshold() {
        let engine = engine();
        assert_eq!(engine.quorum_threshold(0), 1);
        assert_eq!(engine.quorum_threshold(1), 1);
        assert_eq!(engine.quorum_threshold(2), 2);
        assert_eq!(engine.quorum_threshold(4), 3);
        assert_eq!(engine.quorum_threshold(5), 3);
        assert_eq!(engine.quorum_threshold(10), 6);
        assert_eq!(engine.quorum_threshold(100), 51);
    }

    #[test]
    fn test_passes_on_the_tick_threshold_is_reached() {
        let (registry, ids) = roster(5);
        let snapshot = registry.snapshot();
        let mut engine = engine();
        let ann = engine
            .propose(ids[0], Command::ReturnToLaunch, 30, 0, &snapshot)
            .unwrap();

        engine.vote(ann.proposal_id, ids[0], VoteChoice::Approve, 1, &snapshot).unwrap();
        engine.vote(ann.proposal_id, ids[1], VoteChoice::Approve, 1, &snapshot).unwrap();
        assert!(engine.evaluate(1, &snapshot).is_empty());

        engine.vote(ann.proposal_id, ids[2], VoteChoice::Approve, 2, &snapshot).unwrap();
        let outcomes = engine.evaluate(2, &snapshot);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, ProposalStatus::Passed);
        assert_eq!(outcomes[0].action, Command::ReturnToLaunch);
        assert_eq!(outcomes[0].threshold, 3);
    }

    #[test]
    fn test_one_vote_short_expires_with_fallback() {
        let (registry, ids) = roster(5);
        let snapshot = registry.snapshot();
        let mut engine = engine();
        let id = engine
            .propose(ids[0], Command::ReturnToLaunch, 10, 0, &snapshot)
            .unwrap()
            .proposal_id;

        engine.vote(id, ids[0], VoteChoice::Approve, 1, &snapshot).unwrap();
        engine.vote(id, ids[1], VoteChoice::Approve, 1, &snapshot).unwrap();
        engine.vote(id, ids[2], VoteChoice::Reject, 1, &snapshot).unwrap();

        for tick in 1..10 {
            assert!(engine.evaluate(tick, &snapshot).is_empty());
        }
        let outcomes = engine.evaluate(10, &snapshot);
        assert_eq!(outcomes[0].status, ProposalStatus::Expired);
        assert_eq!(outcomes[0].action, Command::Loiter);
        assert_eq!(engine.get(id).unwrap().status, ProposalStatus::Expired);
    }

    #[test]
    fn test_failure_shrinks_denominator() {
        let (mut registry, ids) = roster(5);
        let mut engine = engine();
        let id = engine
            .propose(ids[0], Command::Loiter, 30, 0, &registry.snapshot())
            .unwrap()
            .proposal_id;

        engine.vote(id, ids[0], VoteChoice::Approve, 1, &registry.snapshot()).unwrap();
        engine.vote(id, ids[1], VoteChoice::Approve, 1, &registry.snapshot()).unwrap();

        // A non-voter fails: 4 active, threshold stays 3
        fail(&mut registry, ids[4], 2);
        let snapshot = registry.snapshot();
        assert_eq!(engine.quorum_threshold(snapshot.active_count()), 3);
        assert!(engine.evaluate(2, &snapshot).is_empty());

        engine.vote(id, ids[2], VoteChoice::Approve, 3, &snapshot).unwrap();
        let outcomes = engine.evaluate(3, &snapshot);
        assert_eq!(outcomes[0].status, ProposalStatus::Passed);
    }

    #[test]
    fn test_approvals_from_failed_agents_stop_counting() {
        let (mut registry, ids) = roster(3);
        let mut engine = engine();
        let id = engine
            .propose(ids[0], Command::Loiter, 30, 0, &registry.snapshot())
            .unwrap()
            .proposal_id;
        engine.vote(id, ids[1], VoteChoice::Approve, 1, &registry.snapshot()).unwrap();
        fail(&mut registry, ids[1], 1);

        let snapshot = registry.snapshot();
        assert_eq!(engine.get(id).unwrap().approvals(&snapshot), 0);
        assert!(engine.evaluate(1, &snapshot).is_empty());
    }

    #[test]
    fn test_last_vote_wins() {
        let (registry, ids) = roster(1);
        let snapshot = registry.snapshot();
        let mut engine = engine();
        let id = engine
            .propose(ids[0], Command::Loiter, 30, 0, &snapshot)
            .unwrap()
            .proposal_id;

        engine.vote(id, ids[0], VoteChoice::Reject, 1, &snapshot).unwrap();
        engine.vote(id, ids[0], VoteChoice::Approve, 2, &snapshot).unwrap();
        let proposal = engine.get(id).unwrap();
        assert_eq!(proposal.votes.len(), 1);
        assert_eq!(proposal.votes[&ids[0]], VoteChoice::Approve);
    }

    #[test]
    fn test_vote_rejections() {
        let (mut registry, ids) = roster(3);
        let mut engine = engine();
        let id = engine
            .propose(ids[0], Command::Loiter, 5, 0, &registry.snapshot())
            .unwrap()
            .proposal_id;

        assert!(matches!(
            engine.vote(ProposalId(42), ids[0], VoteChoice::Approve, 1, &registry.snapshot()),
            Err(SwarmError::UnknownProposal(ProposalId(42)))
        ));
        assert!(matches!(
            engine.vote(id, AgentId(99), VoteChoice::Approve, 1, &registry.snapshot()),
            Err(SwarmError::NotEligible(AgentId(99)))
        ));
        assert!(matches!(
            engine.vote(id, ids[0], VoteChoice::Approve, 5, &registry.snapshot()),
            Err(SwarmError::DeadlinePassed(_))
        ));

        fail(&mut registry, ids[2], 1);
        assert!(matches!(
            engine.vote(id, ids[2], VoteChoice::Approve, 1, &registry.snapshot()),
            Err(SwarmError::NotEligible(_))
        ));
    }

    #[test]
    fn test_retract_only_by_proposer() {
        let (registry, ids) = roster(2);
        let snapshot = registry.snapshot();
        let mut engine = engine();
        let id = engine
            .propose(ids[0], Command::EmergencyStop, 30, 0, &snapshot)
            .unwrap()
            .proposal_id;

        assert!(matches!(
            engine.retract(id, ids[1]),
            Err(SwarmError::NotProposer { .. })
        ));
        engine.retract(id, ids[0]).unwrap();
        assert_eq!(engine.get(id).unwrap().status, ProposalStatus::Failed);

        // Closed proposals take no more votes and are not re-evaluated
        assert!(matches!(
            engine.vote(id, ids[1], VoteChoice::Approve, 1, &snapshot),
            Err(SwarmError::ProposalClosed {
                status: ProposalStatus::Failed,
                ..
            })
        ));
        assert!(engine.evaluate(100, &snapshot).is_empty());
        assert_eq!(engine.open_count(), 0);
    }

    #[test]
    fn test_failed_agent_cannot_propose() {
        let (mut registry, ids) = roster(2);
        fail(&mut registry, ids[1], 1);
        let mut engine = engine();
        assert!(matches!(
            engine.propose(ids[1], Command::Loiter, 30, 1, &registry.snapshot()),
            Err(SwarmError::NotEligible(_))
        ));
    }

    #[test]
    fn test_proposal_id_parses_from_topic_key() {
        let id: ProposalId = "proposal-12".parse().unwrap();
        assert_eq!(id, ProposalId(12));
        assert_eq!(id.to_string(), "proposal-12");
        assert!("proposal-".parse::<ProposalId>().is_err());
    }

    proptest! {
        #[test]
        fn prop_threshold_is_a_majority_share(active in 0usize..500, percent in 1u32..=100) {
            let engine = ConsensusEngine::new(&ConsensusConfig {
                quorum_percent: percent,
                ..ConsensusConfig::default()
            });
            let threshold = engine.quorum_threshold(active);
            prop_assert!(threshold >= 1);
            prop_assert!(threshold * 100 >= percent as usize * active);
            if active > 0 {
                prop_assert!(threshold <= active);
                prop_assert!((threshold - 1) * 100 < percent as usize * active);
            }
        }

        #[test]
        fn prop_vote_map_bounded_by_roster(votes in prop::collection::vec((0usize..6, any::<bool>()), 0..40)) {
            let (registry, ids) = roster(6);
            let snapshot = registry.snapshot();
            let mut engine = ConsensusEngine::new(&ConsensusConfig::default());
            let id = engine.propose(ids[0], Command::Loiter, 1_000, 0, &snapshot).unwrap().proposal_id;

            for (voter, approve) in votes {
                let choice = if approve { VoteChoice::Approve } else { VoteChoice::Reject };
                engine.vote(id, ids[voter], choice, 1, &snapshot).unwrap();
            }
            prop_assert!(engine.get(id).unwrap().votes.len() <= snapshot.len());
        }
    }
}
