use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::swarm::fusion::{Bucket, Pattern, PatternId, PerceptionFusion};
use crate::swarm::geometry::Vec2;
use crate::swarm::registry::{AgentId, Tick};

/// Fields needed to rebuild a pattern that the flat record layout does not carry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternMetadata {
    pub bucket: Bucket,
    pub lead_producer: AgentId,
    pub first_seen: Tick,
}

/// One persisted pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternRecord {
    pub pattern_id: PatternId,
    pub producer_ids: BTreeSet<AgentId>,
    /// Object class
    #[serde(rename = "type")]
    pub kind: String,
    pub confidence: f64,
    pub location: Vec2,
    pub timestamp: Tick,
    pub metadata: PatternMetadata,
}

impl From<&Pattern> for PatternRecord {
    fn from(pattern: &Pattern) -> Self {
        Self {
            pattern_id: pattern.id.clone(),
            producer_ids: pattern.contributors.clone(),
            kind: pattern.object_class.clone(),
            confidence: pattern.confidence,
            location: pattern.location,
            timestamp: pattern.last_seen,
            metadata: PatternMetadata {
                bucket: pattern.bucket,
                lead_producer: pattern.lead_producer,
                first_seen: pattern.first_seen,
            },
        }
    }
}

impl From<&PatternRecord> for Pattern {
    fn from(record: &PatternRecord) -> Self {
        Pattern {
            id: record.pattern_id.clone(),
            object_class: record.kind.clone(),
            bucket: record.metadata.bucket,
            confidence: record.confidence,
            location: record.location,
            lead_producer: record.metadata.lead_producer,
            contributors: record.producer_ids.clone(),
            first_seen: record.metadata.first_seen,
            last_seen: record.timestamp,
        }
    }
}

/// On-disk archive layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveFile {
    pub exported_at: DateTime<Utc>,
    /// Simulation tick at export time
    pub tick: Tick,
    pub patterns: Vec<PatternRecord>,
}

/// Saves the pattern store to disk and loads it back
pub struct PatternArchive {
    /// The directory where the archive is stored
    data_dir: PathBuf,

    /// The archive filename
    filename: String,
}

impl PatternArchive {
    /// Create an archive rooted at `data_dir`, creating the directory if needed
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();

        fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        Ok(Self {
            data_dir,
            filename: "patterns.json".to_string(),
        })
    }

    /// Full path of the archive file
    pub fn archive_path(&self) -> PathBuf {
        self.data_dir.join(&self.filename)
    }

    /// Write every pattern of `fusion` to disk
    pub fn save(&self, fusion: &PerceptionFusion, tick: Tick) -> Result<PathBuf> {
        let file_path = self.archive_path();
        let archive = ArchiveFile {
            exported_at: Utc::now(),
            tick,
            patterns: fusion.patterns().map(PatternRecord::from).collect(),
        };
        info!("Saving {} patterns to {:?}", archive.patterns.len(), file_path);

        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;

        // Write to a temporary file first, then rename over the archive
        let temp_path = file_path.with_extension("tmp");
        let file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temporary archive: {:?}", temp_path))?;
        let writer = BufWriter::new(file);

        serde_json::to_writer_pretty(writer, &archive)
            .with_context(|| "Failed to serialize patterns to JSON")?;

        fs::rename(&temp_path, &file_path)
            .with_context(|| format!("Failed to rename temporary file to {:?}", file_path))?;

        Ok(file_path)
    }

    /// Read the archive. A missing file yields `None`.
    pub fn load(&self) -> Result<Option<ArchiveFile>> {
        let file_path = self.archive_path();

        if !file_path.exists() {
            info!("No pattern archive at {:?}, starting empty", file_path);
            return Ok(None);
        }

        let file = File::open(&file_path)
            .with_context(|| format!("Failed to open pattern archive: {:?}", file_path))?;
        let reader = BufReader::new(file);

        let archive: ArchiveFile = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse pattern archive: {:?}", file_path))?;

        info!(
            "Loaded {} patterns exported at {}",
            archive.patterns.len(),
            archive.exported_at
        );
        Ok(Some(archive))
    }

    /// Merge archived patterns into `fusion`, whose clock reads `now`.
    /// Timestamps are rebased so each pattern keeps the age it had at export.
    /// Patterns past their retention and records whose id does not match
    /// their bucket are skipped. Returns how many were merged.
    pub fn restore(&self, fusion: &mut PerceptionFusion, now: Tick) -> Result<usize> {
        let Some(archive) = self.load()? else {
            return Ok(0);
        };

        let retention = fusion.config().pattern_retention_ticks;
        let mut restored = 0;
        for record in &archive.patterns {
            let age = archive.tick.saturating_sub(record.timestamp);
            if age > retention {
                debug!("Archived pattern {} is {} ticks old, skipping", record.pattern_id, age);
                continue;
            }
            let mut pattern = Pattern::from(record);
            let span = pattern.last_seen.saturating_sub(pattern.first_seen);
            pattern.last_seen = now.saturating_sub(age);
            pattern.first_seen = pattern.last_seen.saturating_sub(span);

            match fusion.restore_pattern(&pattern) {
                Ok(_) => restored += 1,
                Err(e) => warn!("Skipping archived pattern {}: {}", record.pattern_id, e),
            }
        }
        Ok(restored)
    }
}
