//! Reconciliation engine: staging set -> standardize -> upsert -> archive.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use lset_core::{standardize_record, EntityRecord, CANONICAL_FIELDS, DOMAIN_FIELD, ID_FIELD};
use lset_storage::{ArchiveStore, StagingStore, TimeSource, TIME_API_ENDPOINT};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lset-sync";

pub const ARCHIVE_FILE_NAME: &str = "final_entities.json";
pub const STAGING_FILE_NAME: &str = "new_entities.json";
pub const SHARD_DIR_NAME: &str = "per_group";

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub data_dir: PathBuf,
    /// None means local clock only; no remote time query is attempted.
    pub time_endpoint: Option<String>,
    pub http_timeout_secs: u64,
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let local_clock = std::env::var("LSET_LOCAL_CLOCK")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);
        Self {
            data_dir: std::env::var("LSET_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/output")),
            time_endpoint: if local_clock {
                None
            } else {
                Some(
                    std::env::var("LSET_TIME_ENDPOINT")
                        .unwrap_or_else(|_| TIME_API_ENDPOINT.to_string()),
                )
            },
            http_timeout_secs: std::env::var("LSET_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }

    pub fn archive_path(&self) -> PathBuf {
        self.data_dir.join(ARCHIVE_FILE_NAME)
    }

    pub fn staging_path(&self) -> PathBuf {
        self.data_dir.join(STAGING_FILE_NAME)
    }

    pub fn shard_dir(&self) -> PathBuf {
        self.data_dir.join(SHARD_DIR_NAME)
    }

    fn time_source(&self) -> TimeSource {
        let timeout = Duration::from_secs(self.http_timeout_secs);
        match &self.time_endpoint {
            Some(endpoint) => TimeSource::remote(endpoint).with_timeout(timeout),
            None => TimeSource::local(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Raw entries found in the staging set, valid or not.
    pub staged: usize,
    /// Entries that survived identity filtering and were standardized.
    pub standardized: usize,
    pub added: usize,
    pub updated: usize,
    pub archive_total: usize,
}

/// Merge incoming non-null fields into an existing archive record, returning
/// true when anything actually changed. Write-once fields (`first_seen`) are
/// skipped whenever the archive copy already holds a non-null value.
pub fn merge_entity_fields(existing: &mut EntityRecord, incoming: &EntityRecord) -> bool {
    let mut changed = false;
    for spec in CANONICAL_FIELDS {
        let Some(value) = incoming.get(spec.name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if spec.write_once && existing.get(spec.name).map(|v| !v.is_null()).unwrap_or(false) {
            continue;
        }
        if existing.get(spec.name) != Some(value) {
            let value = value.clone();
            existing.as_map_mut().insert(spec.name.to_string(), value);
            changed = true;
        }
    }
    changed
}

/// Batch orchestrator over the archive and staging stores. One invocation at
/// a time is assumed; serialization across runs comes from external
/// scheduling, not from any lock.
pub struct ReconcileEngine {
    archive: ArchiveStore,
    staging: StagingStore,
    clock: TimeSource,
}

impl ReconcileEngine {
    pub fn new(config: &ReconcileConfig) -> Self {
        let clock = config.time_source();
        Self {
            archive: ArchiveStore::new(config.archive_path(), config.shard_dir(), clock.clone()),
            staging: StagingStore::new(config.staging_path(), clock.clone()),
            clock,
        }
    }

    /// Run one reconciliation batch. An empty staging set is a successful
    /// no-op; a staging set with zero *valid* entries is a failure.
    pub async fn run(&self) -> Result<ReconcileSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, archive = %self.archive.path().display(), "starting reconciliation run");

        self.archive
            .ensure_exists()
            .await
            .context("ensuring archive exists")?;
        self.staging
            .ensure_exists()
            .await
            .context("ensuring staging file exists")?;

        let staged_entities = self
            .staging
            .load()
            .await
            .map(|set| set.entities)
            .unwrap_or_default();

        if staged_entities.is_empty() {
            info!("staging set is empty; nothing to reconcile");
            let archive_total = self.refresh_archive_timestamp().await;
            return Ok(ReconcileSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                staged: 0,
                standardized: 0,
                added: 0,
                updated: 0,
                archive_total,
            });
        }

        let staged = staged_entities.len();
        let records: Vec<EntityRecord> = staged_entities
            .iter()
            .filter_map(|value| value.as_object())
            .filter(|map| map.contains_key(ID_FIELD) && map.contains_key(DOMAIN_FIELD))
            .map(standardize_record)
            .collect();
        let standardized = records.len();

        if records.is_empty() {
            // "nothing submitted" was handled above; "nothing valid" is an error
            bail!("none of the {staged} staged entries carry both id and domain");
        }
        info!(staged, standardized, "standardized staging records");

        let mut archive = self.archive.load().await.ok_or_else(|| {
            anyhow!(
                "archive {} is unreadable or missing its entity list",
                self.archive.path().display()
            )
        })?;

        let mut index: HashMap<String, usize> = HashMap::new();
        for (idx, entity) in archive.entities.iter().enumerate() {
            if let Some(key) = entity.identity_key() {
                // first index wins if the archive somehow carries duplicates
                index.entry(key).or_insert(idx);
            }
        }

        let mut added = 0usize;
        let mut updated = 0usize;
        for record in records {
            let Some(key) = record.identity_key() else {
                continue;
            };
            match index.get(&key) {
                None => {
                    archive.entities.push(record);
                    index.insert(key, archive.entities.len() - 1);
                    added += 1;
                }
                Some(&idx) => {
                    if merge_entity_fields(&mut archive.entities[idx], &record) {
                        updated += 1;
                    }
                }
            }
        }

        archive.last_updated = self.clock.now_utc().await;
        archive.total_count = archive.entities.len();
        let archive_total = archive.total_count;

        self.archive
            .save(&archive)
            .await
            .context("persisting archive")?;

        // A failed reset must not flip an otherwise successful run; the next
        // run reprocesses the same staging set, which the upsert absorbs.
        if let Err(err) = self.staging.reset().await {
            warn!(%err, "failed to reset staging file");
        }

        let finished_at = Utc::now();
        info!(%run_id, added, updated, archive_total, "reconciliation run complete");
        Ok(ReconcileSummary {
            run_id,
            started_at,
            finished_at,
            staged,
            standardized,
            added,
            updated,
            archive_total,
        })
    }

    /// "Nothing to do" still bumps the archive timestamp when the archive is
    /// loadable; failures here are logged, never fatal.
    async fn refresh_archive_timestamp(&self) -> usize {
        let Some(mut archive) = self.archive.load().await else {
            return 0;
        };
        archive.last_updated = self.clock.now_utc().await;
        let total = archive.entities.len();
        if let Err(err) = self.archive.save(&archive).await {
            warn!(%err, "failed to refresh archive timestamp");
        }
        total
    }
}

pub async fn run_reconcile_from_env() -> Result<ReconcileSummary> {
    let config = ReconcileConfig::from_env();
    ReconcileEngine::new(&config).run().await
}
