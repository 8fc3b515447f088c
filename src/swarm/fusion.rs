//! Detection deduplication and the shared pattern store.
//!
//! Detections are bucketed by (class, spatial cell, time window). The bucket
//! determines a content-derived [`PatternId`], so every node that sees
//! equivalent detections converges on the same pattern. Merging takes the
//! max confidence, unions contributors and widens the seen interval; each
//! of those is associative and commutative, so delivery order never changes
//! the final pattern.

use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::geometry::Vec2;
use super::messages::DetectionRecord;
use super::registry::{AgentId, Tick};
use crate::core::config::FusionConfig;
use crate::core::error::{SwarmError, SwarmResult};

/// Content-derived pattern identifier (hex digest of the bucket key)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternId(pub String);

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Spatial cell and time window a detection falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub cell_x: i64,
    pub cell_y: i64,
    pub time_window: u64,
}

impl PatternId {
    pub fn derive(object_class: &str, bucket: &Bucket) -> Self {
        let key = format!(
            "{}|{}|{}|{}",
            object_class, bucket.cell_x, bucket.cell_y, bucket.time_window
        );
        let digest = Sha256::digest(key.as_bytes());
        PatternId(digest[..8].iter().map(|b| format!("{:02x}", b)).collect())
    }
}

/// Deduplicated aggregate of one or more detections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    #[serde(rename = "patternId")]
    pub id: PatternId,
    #[serde(rename = "class")]
    pub object_class: String,
    pub bucket: Bucket,
    /// Max confidence over all contributing detections
    pub confidence: f64,
    /// Location of the leading (highest-confidence) detection
    pub location: Vec2,
    /// Producer of the leading detection
    pub lead_producer: AgentId,
    pub contributors: BTreeSet<AgentId>,
    pub first_seen: Tick,
    /// Most recent contributing detection
    #[serde(rename = "timestamp")]
    pub last_seen: Tick,
}

/// Total order used to pick the leading detection. Higher confidence wins,
/// then the lower producer id, then the smaller coordinates.
fn lead_order(a: &Pattern, b: &Pattern) -> Ordering {
    a.confidence
        .total_cmp(&b.confidence)
        .then_with(|| b.lead_producer.cmp(&a.lead_producer))
        .then_with(|| b.location.x.total_cmp(&a.location.x))
        .then_with(|| b.location.y.total_cmp(&a.location.y))
}

impl Pattern {
    fn from_detection(record: &DetectionRecord, bucket: Bucket) -> Self {
        Self {
            id: PatternId::derive(&record.object_class, &bucket),
            object_class: record.object_class.clone(),
            bucket,
            confidence: record.confidence,
            location: record.location,
            lead_producer: record.producer,
            contributors: BTreeSet::from([record.producer]),
            first_seen: record.timestamp,
            last_seen: record.timestamp,
        }
    }

    /// Fold `other` (same id) into `self`. Returns whether anything changed.
    pub fn merge(&mut self, other: &Pattern) -> bool {
        let before = self.clone();

        if lead_order(other, self) == Ordering::Greater {
            self.confidence = other.confidence;
            self.location = other.location;
            self.lead_producer = other.lead_producer;
        }
        self.contributors.extend(other.contributors.iter().copied());
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);

        *self != before
    }

    /// Not stale: refreshed within the last `ttl` ticks
    pub fn is_valid(&self, now: Tick, ttl: Tick) -> bool {
        now.saturating_sub(self.last_seen) <= ttl
    }
}

/// What an upsert did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternChange {
    Created,
    Merged,
    Unchanged,
}

/// Result of [`PerceptionFusion::ingest`]
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub pattern: Pattern,
    pub change: PatternChange,
}

impl IngestOutcome {
    /// Whether the pattern should be re-announced on the mesh
    pub fn should_publish(&self) -> bool {
        self.change != PatternChange::Unchanged
    }
}

/// The pattern store plus the bucketing rules
#[derive(Debug, Clone)]
pub struct PerceptionFusion {
    config: FusionConfig,
    patterns: BTreeMap<PatternId, Pattern>,
    /// Restored from an archive and not confirmed by a live observation yet
    held: BTreeSet<PatternId>,
    ingested: u64,
}

impl PerceptionFusion {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            patterns: BTreeMap::new(),
            held: BTreeSet::new(),
            ingested: 0,
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn bucket_for(&self, record: &DetectionRecord) -> Bucket {
        Bucket {
            cell_x: (record.location.x / self.config.cell_size).floor() as i64,
            cell_y: (record.location.y / self.config.cell_size).floor() as i64,
            time_window: record.timestamp / self.config.time_window_ticks,
        }
    }

    /// Boundary check for a detection before it is fused
    pub fn validate(record: &DetectionRecord) -> SwarmResult<()> {
        if record.object_class.trim().is_empty() {
            return Err(SwarmError::InvalidDetection("empty object class".into()));
        }
        if !record.confidence.is_finite() || !(0.0..=1.0).contains(&record.confidence) {
            return Err(SwarmError::InvalidDetection(format!(
                "confidence {} outside [0, 1]",
                record.confidence
            )));
        }
        if !record.location.is_finite() {
            return Err(SwarmError::InvalidDetection("non-finite location".into()));
        }
        Ok(())
    }

    /// Idempotent upsert of one detection
    pub fn ingest(&mut self, record: &DetectionRecord) -> SwarmResult<IngestOutcome> {
        Self::validate(record)?;
        self.ingested += 1;

        let incoming = Pattern::from_detection(record, self.bucket_for(record));
        let outcome = self.upsert(incoming);
        self.held.remove(&outcome.pattern.id);
        Ok(outcome)
    }

    /// Merge a pattern announced by another node. The id must match the
    /// bucket it claims, otherwise two stores could disagree on identity.
    pub fn merge_pattern(&mut self, pattern: &Pattern) -> SwarmResult<IngestOutcome> {
        Self::check_announcement(pattern)?;
        let outcome = self.upsert(pattern.clone());
        self.held.remove(&outcome.pattern.id);
        Ok(outcome)
    }

    /// Load a pattern from an earlier session. It keeps its identity and
    /// history but is not chosen as a target until a live detection or a
    /// peer announcement confirms it.
    pub fn restore_pattern(&mut self, pattern: &Pattern) -> SwarmResult<IngestOutcome> {
        Self::check_announcement(pattern)?;
        let outcome = self.upsert(pattern.clone());
        if outcome.change == PatternChange::Created {
            self.held.insert(outcome.pattern.id.clone());
        }
        Ok(outcome)
    }

    fn check_announcement(pattern: &Pattern) -> SwarmResult<()> {
        if PatternId::derive(&pattern.object_class, &pattern.bucket) != pattern.id {
            return Err(SwarmError::InvalidDetection(format!(
                "pattern {} does not match its bucket",
                pattern.id
            )));
        }
        if !(0.0..=1.0).contains(&pattern.confidence) || pattern.contributors.is_empty() {
            return Err(SwarmError::InvalidDetection(format!(
                "pattern {} is out of schema",
                pattern.id
            )));
        }
        Ok(())
    }

    fn upsert(&mut self, incoming: Pattern) -> IngestOutcome {
        match self.patterns.get_mut(&incoming.id) {
            Some(existing) => {
                let change = if existing.merge(&incoming) {
                    PatternChange::Merged
                } else {
                    PatternChange::Unchanged
                };
                IngestOutcome {
                    pattern: existing.clone(),
                    change,
                }
            }
            None => {
                debug!(
                    "New pattern {} ({}, {:.2})",
                    incoming.id, incoming.object_class, incoming.confidence
                );
                self.patterns.insert(incoming.id.clone(), incoming.clone());
                IngestOutcome {
                    pattern: incoming,
                    change: PatternChange::Created,
                }
            }
        }
    }

    pub fn get(&self, id: &PatternId) -> Option<&Pattern> {
        self.patterns.get(id)
    }

    /// Patterns in id order
    pub fn patterns(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.values()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Number of detections accepted so far
    pub fn ingested(&self) -> u64 {
        self.ingested
    }

    /// Non-stale pattern the flock should steer towards: highest confidence
    /// above the threshold, ties broken by the lowest id
    pub fn target(&self, now: Tick) -> Option<&Pattern> {
        self.patterns
            .values()
            .filter(|p| !self.held.contains(&p.id))
            .filter(|p| p.is_valid(now, self.config.pattern_ttl_ticks))
            .filter(|p| p.confidence >= self.config.target_confidence_threshold)
            .fold(None, |best: Option<&Pattern>, p| match best {
                Some(b) if b.confidence >= p.confidence => Some(b),
                _ => Some(p),
            })
    }

    /// Drop patterns past the retention window. Returns how many were removed.
    pub fn prune(&mut self, now: Tick) -> usize {
        let retention = self.config.pattern_retention_ticks;
        let before = self.patterns.len();
        self.patterns.retain(|_, p| p.is_valid(now, retention));
        let patterns = &self.patterns;
        self.held.retain(|id| patterns.contains_key(id));
        before - self.patterns.len()
    }
}

/// Pattern store shared between concurrently running agent loops
#[derive(Debug, Clone)]
pub struct SharedPatternStore {
    inner: Arc<RwLock<PerceptionFusion>>,
}

impl SharedPatternStore {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(PerceptionFusion::new(config))),
        }
    }

    pub async fn ingest(&self, record: &DetectionRecord) -> SwarmResult<IngestOutcome> {
        let mut store = self.inner.write().await;
        store.ingest(record)
    }

    pub async fn merge_pattern(&self, pattern: &Pattern) -> SwarmResult<IngestOutcome> {
        let mut store = self.inner.write().await;
        store.merge_pattern(pattern)
    }

    pub async fn get(&self, id: &PatternId) -> Option<Pattern> {
        let store = self.inner.read().await;
        store.get(id).cloned()
    }

    pub async fn patterns(&self) -> Vec<Pattern> {
        let store = self.inner.read().await;
        store.patterns().cloned().collect()
    }
}
