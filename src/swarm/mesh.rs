//! Range-limited, topic-addressed publish/subscribe mesh.
//!
//! Links are derived from positions every tick: two agents are linked iff
//! their distance is within the communication range. Delivery is best effort
//! and at most once. A message published by an agent reaches a subscriber
//! only if the two are linked when [`MeshTransport::deliver`] runs; otherwise
//! it is silently dropped, which models radio range loss rather than an
//! error. `command.broadcast` and operator-originated messages ignore links.

use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use super::consensus::ProposalId;
use super::fusion::PatternId;
use super::messages::MeshPayload;
use super::registry::{AgentId, RosterSnapshot, Tick};
use crate::core::error::{SwarmError, SwarmResult};

fn topic_regex() -> &'static Regex {
    static TOPIC_RE: OnceLock<Regex> = OnceLock::new();
    TOPIC_RE.get_or_init(|| {
        Regex::new(r"^(telemetry|detection|command|pattern|consensus)\.([A-Za-z0-9_-]+)$")
            .expect("topic regex is valid")
    })
}

/// A concrete mesh topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `telemetry.{agentId}`
    Telemetry(AgentId),
    /// `detection.{agentId}`
    Detection(AgentId),
    /// `command.{agentId}`
    Command(AgentId),
    /// `command.broadcast`, reaches the whole roster
    CommandBroadcast,
    /// `pattern.{patternId}`
    Pattern(PatternId),
    /// `consensus.{proposalId}`
    Consensus(ProposalId),
}

impl Topic {
    /// Broadcast topics are delivered regardless of link state
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Topic::CommandBroadcast)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Telemetry(id) => write!(f, "telemetry.{}", id),
            Topic::Detection(id) => write!(f, "detection.{}", id),
            Topic::Command(id) => write!(f, "command.{}", id),
            Topic::CommandBroadcast => write!(f, "command.broadcast"),
            Topic::Pattern(id) => write!(f, "pattern.{}", id),
            Topic::Consensus(id) => write!(f, "consensus.{}", id),
        }
    }
}

impl FromStr for Topic {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SwarmError::InvalidTopic(s.to_string());
        let captures = topic_regex().captures(s).ok_or_else(invalid)?;
        let (kind, key) = (&captures[1], &captures[2]);

        let agent = || key.parse::<AgentId>().map_err(|_| invalid());
        match kind {
            "telemetry" => Ok(Topic::Telemetry(agent()?)),
            "detection" => Ok(Topic::Detection(agent()?)),
            "command" if key == "broadcast" => Ok(Topic::CommandBroadcast),
            "command" => Ok(Topic::Command(agent()?)),
            "pattern" => Ok(Topic::Pattern(PatternId(key.to_string()))),
            "consensus" => key.parse::<ProposalId>().map(Topic::Consensus).map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }
}

/// Subscription pattern: `*` matches one segment, a trailing `>` matches the rest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<String>,
}

impl TopicPattern {
    pub fn matches(&self, topic: &Topic) -> bool {
        let rendered = topic.to_string();
        let parts: Vec<&str> = rendered.split('.').collect();

        for (idx, segment) in self.segments.iter().enumerate() {
            if segment == ">" {
                return parts.len() > idx;
            }
            match parts.get(idx) {
                Some(part) if segment == "*" || segment == part => {}
                _ => return false,
            }
        }
        parts.len() == self.segments.len()
    }
}

impl FromStr for TopicPattern {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<String> = s.split('.').map(str::to_string).collect();
        let tail_ok = segments
            .iter()
            .position(|seg| seg == ">")
            .map_or(true, |pos| pos == segments.len() - 1);
        if segments.iter().any(|seg| seg.is_empty()) || !tail_ok {
            return Err(SwarmError::InvalidTopic(s.to_string()));
        }
        Ok(Self { segments })
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// Link quality for observability: 1 at zero distance, 0 at the range edge
pub fn signal_strength(distance: f64, range: f64) -> f64 {
    (1.0 - distance / range).clamp(0.0, 1.0)
}

/// A communication link between two agents for the current tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshLink {
    /// Lower id of the pair
    pub a: AgentId,
    /// Higher id of the pair
    pub b: AgentId,
    pub distance: f64,
    pub signal_strength: f64,
}

/// Symmetric link relation. Pairs are stored with the lower id first, so
/// `linked(a, b) == linked(b, a)` holds by construction.
#[derive(Debug, Clone, Default)]
pub struct LinkSet {
    links: BTreeMap<(AgentId, AgentId), MeshLink>,
}

fn ordered(a: AgentId, b: AgentId) -> (AgentId, AgentId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl LinkSet {
    pub fn linked(&self, a: AgentId, b: AgentId) -> bool {
        a != b && self.links.contains_key(&ordered(a, b))
    }

    pub fn link(&self, a: AgentId, b: AgentId) -> Option<&MeshLink> {
        self.links.get(&ordered(a, b))
    }

    /// Agents linked to `id`, in ascending id order
    pub fn neighbors(&self, id: AgentId) -> Vec<AgentId> {
        let mut out: Vec<AgentId> = self
            .links
            .keys()
            .filter_map(|&(a, b)| {
                if a == id {
                    Some(b)
                } else if b == id {
                    Some(a)
                } else {
                    None
                }
            })
            .collect();
        out.sort();
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &MeshLink> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Derive the link set from positions. O(n^2) over the roster.
pub fn compute_links(snapshot: &RosterSnapshot, range: f64) -> LinkSet {
    let agents: Vec<_> = snapshot.iter().collect();
    let mut links = BTreeMap::new();

    for (i, a) in agents.iter().enumerate() {
        for b in &agents[i + 1..] {
            let distance = a.position.distance(b.position);
            if distance <= range {
                links.insert(
                    (a.id, b.id),
                    MeshLink {
                        a: a.id,
                        b: b.id,
                        distance,
                        signal_strength: signal_strength(distance, range),
                    },
                );
            }
        }
    }

    LinkSet { links }
}

/// Who put a message on the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// An agent radio; delivery is range-limited
    Agent(AgentId),
    /// Operator console / ground control; reaches every agent
    Operator,
}

/// A published message waiting for, or carried by, a delivery
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Publish sequence number, unique per transport
    pub id: u64,
    pub origin: Origin,
    pub topic: Topic,
    pub payload: MeshPayload,
    pub published_at: Tick,
}

/// One envelope handed to one subscriber
#[derive(Debug, Clone)]
pub struct Delivery {
    pub recipient: AgentId,
    pub envelope: Arc<Envelope>,
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStats {
    pub published: u64,
    pub delivered: u64,
    /// Per-recipient drops because sender and receiver were not linked
    pub dropped_out_of_range: u64,
    /// Messages refused at the transport boundary
    pub rejected: u64,
}

/// The publish/subscribe layer
#[derive(Debug, Default)]
pub struct MeshTransport {
    pending: VecDeque<Envelope>,
    subscriptions: BTreeMap<AgentId, Vec<TopicPattern>>,
    next_id: u64,
    stats: MeshStats,
}

impl MeshTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest of `subscriber` in topics matching `pattern`
    pub fn subscribe(&mut self, subscriber: AgentId, pattern: &str) -> SwarmResult<()> {
        let pattern: TopicPattern = pattern.parse()?;
        let patterns = self.subscriptions.entry(subscriber).or_default();
        if !patterns.contains(&pattern) {
            patterns.push(pattern);
        }
        Ok(())
    }

    /// Queue a typed message. Fire and forget: returns the sequence number,
    /// or `None` when the payload does not fit the topic schema.
    pub fn publish(
        &mut self,
        origin: Origin,
        topic: Topic,
        payload: MeshPayload,
        now: Tick,
    ) -> Option<u64> {
        if !payload.fits_topic(&topic) {
            warn!("Dropping out-of-schema message on {} from {:?}", topic, origin);
            self.stats.rejected += 1;
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.stats.published += 1;
        self.pending.push_back(Envelope {
            id,
            origin,
            topic,
            payload,
            published_at: now,
        });
        Some(id)
    }

    /// Queue a message received in wire form. Malformed topics or bodies are
    /// logged and dropped here and never reach swarm state.
    pub fn publish_raw(&mut self, origin: Origin, topic: &str, body: &str, now: Tick) -> Option<u64> {
        let topic = match topic.parse::<Topic>() {
            Ok(topic) => topic,
            Err(e) => {
                warn!("Dropping message from {:?}: {}", origin, e);
                self.stats.rejected += 1;
                return None;
            }
        };

        match serde_json::from_str::<MeshPayload>(body) {
            Ok(payload) => self.publish(origin, topic, payload, now),
            Err(e) => {
                warn!("Dropping malformed message on {}: {}", topic, e);
                self.stats.rejected += 1;
                None
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> MeshStats {
        self.stats
    }

    /// Drain the queue against the current links. Messages are processed in
    /// publish order, so one sender's messages to one receiver keep their order.
    pub fn deliver(&mut self, links: &LinkSet, roster: &RosterSnapshot) -> Vec<Delivery> {
        let mut deliveries = Vec::new();

        while let Some(envelope) = self.pending.pop_front() {
            let envelope = Arc::new(envelope);

            for (subscriber, patterns) in &self.subscriptions {
                if !patterns.iter().any(|p| p.matches(&envelope.topic)) {
                    continue;
                }
                if envelope.origin == Origin::Agent(*subscriber) {
                    continue;
                }
                // Failed or unknown agents have no radio to receive with
                match roster.get(*subscriber) {
                    Some(state) if !state.is_failed() => {}
                    _ => continue,
                }

                let reachable = envelope.topic.is_broadcast()
                    || match envelope.origin {
                        Origin::Operator => true,
                        Origin::Agent(sender) => links.linked(sender, *subscriber),
                    };

                if reachable {
                    self.stats.delivered += 1;
                    deliveries.push(Delivery {
                        recipient: *subscriber,
                        envelope: Arc::clone(&envelope),
                    });
                } else {
                    self.stats.dropped_out_of_range += 1;
                }
            }
        }

        debug!("Mesh delivered {} message copies", deliveries.len());
        deliveries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::geometry::Vec2;
    use crate::swarm::messages::{Command, TelemetryReport};
    use crate::swarm::registry::{AgentLaunch, AgentRegistry, HealthStatus};
    use proptest::prelude::*;

    fn roster(positions: &[(f64, f64)]) -> (AgentRegistry, Vec<AgentId>) {
        let mut registry = AgentRegistry::new();
        let ids = positions
            .iter()
            .map(|&(x, y)| {
                registry.register(AgentLaunch {
                    position: Vec2::new(x, y),
                    velocity: Vec2::ZERO,
                    battery: 100.0,
                    spacing: 100.0,
                })
            })
            .collect();
        (registry, ids)
    }

    fn telemetry(id: AgentId, now: Tick) -> MeshPayload {
        MeshPayload::Telemetry(TelemetryReport {
            agent_id: id,
            timestamp: now,
            position: Vec2::ZERO,
            battery: 100.0,
            status: HealthStatus::Active,
        })
    }

    #[test]
    fn test_topic_round_trip() {
        for raw in [
            "telemetry.drone-1",
            "command.broadcast",
            "command.drone-4",
            "consensus.proposal-2",
            "pattern.ab12",
        ] {
            let topic: Topic = raw.parse().unwrap();
            assert_eq!(topic.to_string(), raw);
        }
        assert!("telemetry".parse::<Topic>().is_err());
        assert!("weather.drone-1".parse::<Topic>().is_err());
        assert!("telemetry.drone-x".parse::<Topic>().is_err());
    }

    #[test]
    fn test_topic_pattern_wildcards() {
        let any_telemetry: TopicPattern = "telemetry.*".parse().unwrap();
        let everything: TopicPattern = ">".parse().unwrap();
        let exact: TopicPattern = "command.drone-2".parse().unwrap();

        assert!(any_telemetry.matches(&Topic::Telemetry(AgentId(9))));
        assert!(!any_telemetry.matches(&Topic::Detection(AgentId(9))));
        assert!(everything.matches(&Topic::CommandBroadcast));
        assert!(exact.matches(&Topic::Command(AgentId(2))));
        assert!(!exact.matches(&Topic::Command(AgentId(3))));
        assert!("a.>.b".parse::<TopicPattern>().is_err());
    }

    #[test]
    fn test_links_respect_range_boundary() {
        let (registry, ids) = roster(&[(0.0, 0.0), (300.0, 0.0), (600.5, 0.0)]);
        let links = compute_links(&registry.snapshot(), 300.0);
        assert!(links.linked(ids[0], ids[1]));
        assert!(links.linked(ids[1], ids[0]));
        assert!(!links.linked(ids[1], ids[2]));
        assert_eq!(links.neighbors(ids[1]), vec![ids[0]]);
        let link = links.link(ids[0], ids[1]).unwrap();
        assert_eq!(link.signal_strength, 0.0);
    }

    #[test]
    fn test_out_of_range_message_is_silently_dropped() {
        let (registry, ids) = roster(&[(0.0, 0.0), (100.0, 0.0), (1000.0, 0.0)]);
        let snapshot = registry.snapshot();
        let links = compute_links(&snapshot, 300.0);
        let mut mesh = MeshTransport::new();
        for id in &ids {
            mesh.subscribe(*id, "telemetry.*").unwrap();
        }

        mesh.publish(Origin::Agent(ids[0]), Topic::Telemetry(ids[0]), telemetry(ids[0], 0), 0)
            .unwrap();
        let deliveries = mesh.deliver(&links, &snapshot);

        let recipients: Vec<AgentId> = deliveries.iter().map(|d| d.recipient).collect();
        assert_eq!(recipients, vec![ids[1]]);
        assert_eq!(mesh.stats().dropped_out_of_range, 1);
        assert_eq!(mesh.pending_len(), 0);
    }

    #[test]
    fn test_broadcast_ignores_links() {
        let (registry, ids) = roster(&[(0.0, 0.0), (5000.0, 0.0)]);
        let snapshot = registry.snapshot();
        let links = compute_links(&snapshot, 300.0);
        let mut mesh = MeshTransport::new();
        for id in &ids {
            mesh.subscribe(*id, "command.broadcast").unwrap();
        }

        mesh.publish(
            Origin::Agent(ids[0]),
            Topic::CommandBroadcast,
            MeshPayload::Command(Command::Loiter),
            0,
        );
        let deliveries = mesh.deliver(&links, &snapshot);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].recipient, ids[1]);
    }

    #[test]
    fn test_single_sender_order_is_preserved() {
        let (registry, ids) = roster(&[(0.0, 0.0), (10.0, 0.0)]);
        let snapshot = registry.snapshot();
        let links = compute_links(&snapshot, 300.0);
        let mut mesh = MeshTransport::new();
        mesh.subscribe(ids[1], "telemetry.>").unwrap();

        for now in 0..5 {
            mesh.publish(Origin::Agent(ids[0]), Topic::Telemetry(ids[0]), telemetry(ids[0], now), now);
        }
        let stamps: Vec<Tick> = mesh
            .deliver(&links, &snapshot)
            .iter()
            .map(|d| match &d.envelope.payload {
                MeshPayload::Telemetry(t) => t.timestamp,
                other => panic!("unexpected payload {:?}", other),
            })
            .collect();
        assert_eq!(stamps, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_malformed_raw_messages_are_rejected() {
        let mut mesh = MeshTransport::new();
        assert!(mesh
            .publish_raw(Origin::Operator, "command.broadcast", "{not json", 0)
            .is_none());
        assert!(mesh
            .publish_raw(Origin::Operator, "bogus topic", r#"{"kind":"command","body":{"type":"loiter"}}"#, 0)
            .is_none());
        // Well-formed JSON on the wrong topic is out of schema
        assert!(mesh
            .publish_raw(
                Origin::Operator,
                "telemetry.drone-1",
                r#"{"kind":"command","body":{"type":"loiter"}}"#,
                0
            )
            .is_none());
        assert_eq!(mesh.stats().rejected, 3);
        assert!(mesh
            .publish_raw(Origin::Operator, "command.broadcast", r#"{"kind":"command","body":{"type":"loiter"}}"#, 0)
            .is_some());
    }

    proptest! {
        #[test]
        fn prop_links_are_symmetric_and_match_distance(
            positions in prop::collection::vec((-500.0f64..500.0, -500.0f64..500.0), 2..12),
            range in 1.0f64..400.0,
        ) {
            let (registry, ids) = roster(&positions);
            let snapshot = registry.snapshot();
            let links = compute_links(&snapshot, range);

            for a in &ids {
                for b in &ids {
                    if a == b {
                        continue;
                    }
                    let pa = snapshot.get(*a).unwrap().position;
                    let pb = snapshot.get(*b).unwrap().position;
                    let within = pa.distance(pb) <= range;
                    prop_assert_eq!(links.linked(*a, *b), within);
                    prop_assert_eq!(links.linked(*a, *b), links.linked(*b, *a));
                }
            }
        }
    }
}
