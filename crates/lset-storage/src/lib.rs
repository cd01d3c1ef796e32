//! JSON-file persistence for LSET: clock source, archive store, staging store.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use lset_core::{
    identity_key_of, standardize_with_group, EntityRecord, CANONICAL_TIME_FORMAT, DOMAIN_FIELD,
    ID_FIELD,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "lset-storage";

/// Remote time service queried before falling back to the system clock.
pub const TIME_API_ENDPOINT: &str = "https://timeapi.io/api/time/current/zone?timeZone=UTC";

/// Per-source shard files are named `<group-key>_entities.json`.
pub const SHARD_SUFFIX: &str = "_entities.json";

pub const ARCHIVE_DESCRIPTION: &str = "Complete archive of all discovered ransomware entities";

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("time request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("time service returned http status {0}")]
    HttpStatus(u16),
}

/// UTC wall-clock source. Tries the remote time service when an endpoint is
/// configured; any transport, status, or payload failure falls back to the
/// local system clock, so `now_utc` always yields a usable timestamp.
#[derive(Debug, Clone)]
pub struct TimeSource {
    endpoint: Option<String>,
    timeout: Duration,
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::remote(TIME_API_ENDPOINT)
    }
}

impl TimeSource {
    pub fn remote(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// System clock only. Used by tests and offline runs.
    pub fn local() -> Self {
        Self {
            endpoint: None,
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Current UTC time formatted `YYYY-MM-DD HH:MM:SS UTC`. Never fails.
    pub async fn now_utc(&self) -> String {
        if let Some(endpoint) = &self.endpoint {
            match self.fetch_remote(endpoint).await {
                Ok(stamp) => return stamp,
                Err(err) => {
                    warn!(endpoint, %err, "remote time query failed; using local clock");
                }
            }
        }
        Utc::now().format(CANONICAL_TIME_FORMAT).to_string()
    }

    async fn fetch_remote(&self, endpoint: &str) -> Result<String, ClockError> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let response = client.get(endpoint).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClockError::HttpStatus(status.as_u16()));
        }
        let fields: TimeApiFields = response.json().await?;
        Ok(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
            fields.year, fields.month, fields.day, fields.hour, fields.minute, fields.seconds
        ))
    }
}

#[derive(Debug, Deserialize)]
struct TimeApiFields {
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    seconds: u32,
}

/// Durable system of record for all tracked entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSet {
    pub entities: Vec<EntityRecord>,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub total_count: usize,
    #[serde(default)]
    pub description: String,
}

impl ArchiveSet {
    pub fn empty(timestamp: String) -> Self {
        Self {
            entities: Vec::new(),
            last_updated: timestamp,
            total_count: 0,
            description: ARCHIVE_DESCRIPTION.to_string(),
        }
    }
}

/// Newly discovered, not-yet-archived records. Entries stay raw JSON values
/// because the upstream discovery writer is not trusted to emit well-formed
/// records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingSet {
    pub entities: Vec<Value>,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub total_count: usize,
}

impl StagingSet {
    pub fn empty(timestamp: String) -> Self {
        Self {
            entities: Vec::new(),
            last_updated: timestamp,
            total_count: 0,
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "file not found");
            return None;
        }
        Err(err) => {
            error!(path = %path.display(), %err, "failed to read file");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            error!(path = %path.display(), %err, "invalid JSON");
            None
        }
    }
}

/// Backup-then-overwrite write pattern: an existing file is copied to a
/// `.bak` sibling before the new contents replace it.
pub async fn write_json_backup<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if fs::try_exists(path).await.unwrap_or(false) {
        let backup = backup_path(path);
        fs::copy(path, &backup)
            .await
            .with_context(|| format!("backing up {} to {}", path.display(), backup.display()))?;
        info!(backup = %backup.display(), "created backup of existing file");
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    let bytes = serde_json::to_vec_pretty(value).context("serializing JSON payload")?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// Exclusive owner of the archive file and the read-only shard directory.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    archive_path: PathBuf,
    shard_dir: PathBuf,
    clock: TimeSource,
}

impl ArchiveStore {
    pub fn new(
        archive_path: impl Into<PathBuf>,
        shard_dir: impl Into<PathBuf>,
        clock: TimeSource,
    ) -> Self {
        Self {
            archive_path: archive_path.into(),
            shard_dir: shard_dir.into(),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.archive_path
    }

    /// None on a missing file or content that does not parse as an archive
    /// set; both are logged, neither is fatal.
    pub async fn load(&self) -> Option<ArchiveSet> {
        read_json(&self.archive_path).await
    }

    pub async fn save(&self, archive: &ArchiveSet) -> Result<()> {
        write_json_backup(&self.archive_path, archive)
            .await
            .with_context(|| format!("saving archive {}", self.archive_path.display()))
    }

    /// An existing parseable archive only gets its timestamp refreshed;
    /// anything else is rebuilt from the shard files.
    pub async fn ensure_exists(&self) -> Result<()> {
        if let Some(mut archive) = self.load().await {
            archive.last_updated = self.clock.now_utc().await;
            self.save(&archive).await?;
            info!(path = %self.archive_path.display(), "archive present; refreshed timestamp");
            return Ok(());
        }

        let archive = self.bootstrap_from_shards().await;
        info!(
            entities = archive.entities.len(),
            path = %self.archive_path.display(),
            "rebuilt archive from shard files"
        );
        self.save(&archive).await
    }

    /// A failed shard scan degrades to an empty archive rather than failing
    /// the bootstrap.
    async fn bootstrap_from_shards(&self) -> ArchiveSet {
        let timestamp = self.clock.now_utc().await;
        match self.merge_shards().await {
            Ok(entities) => {
                let total_count = entities.len();
                ArchiveSet {
                    entities,
                    last_updated: timestamp,
                    total_count,
                    description: ARCHIVE_DESCRIPTION.to_string(),
                }
            }
            Err(err) => {
                warn!(%err, "shard scan failed; starting from an empty archive");
                ArchiveSet::empty(timestamp)
            }
        }
    }

    async fn merge_shards(&self) -> Result<Vec<EntityRecord>> {
        if !fs::try_exists(&self.shard_dir).await.unwrap_or(false) {
            warn!(dir = %self.shard_dir.display(), "shard directory missing; archive starts empty");
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.shard_dir)
            .await
            .with_context(|| format!("reading shard directory {}", self.shard_dir.display()))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .context("iterating shard directory")?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(SHARD_SUFFIX) {
                names.push(name);
            }
        }
        // deterministic first-shard-wins order
        names.sort();

        let mut entities = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for name in &names {
            let group = name.trim_end_matches(SHARD_SUFFIX);
            let path = self.shard_dir.join(name);
            let Some(shard) = read_json::<StagingSet>(&path).await else {
                // malformed shard: already logged, skip it
                continue;
            };
            info!(shard = name.as_str(), entities = shard.entities.len(), "merging shard");
            for value in &shard.entities {
                let Some(map) = value.as_object() else {
                    continue;
                };
                if !map.contains_key(ID_FIELD) || !map.contains_key(DOMAIN_FIELD) {
                    continue;
                }
                let Some(key) = identity_key_of(map) else {
                    continue;
                };
                if seen.insert(key) {
                    entities.push(standardize_with_group(map, Some(group)));
                }
            }
        }
        Ok(entities)
    }
}

/// Owner of the staging file written by the external discovery collaborator.
#[derive(Debug, Clone)]
pub struct StagingStore {
    path: PathBuf,
    clock: TimeSource,
}

impl StagingStore {
    pub fn new(path: impl Into<PathBuf>, clock: TimeSource) -> Self {
        Self {
            path: path.into(),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Option<StagingSet> {
        read_json(&self.path).await
    }

    /// Synthesize an empty staging set when the file is absent.
    pub async fn ensure_exists(&self) -> Result<()> {
        if fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(());
        }
        warn!(path = %self.path.display(), "staging file missing; creating an empty one");
        self.reset().await
    }

    /// Overwrite with an empty set and a fresh timestamp.
    pub async fn reset(&self) -> Result<()> {
        let empty = StagingSet::empty(self.clock.now_utc().await);
        write_json_backup(&self.path, &empty)
            .await
            .with_context(|| format!("resetting staging file {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use serde_json::json;
    use tempfile::tempdir;

    fn write_shard(dir: &Path, name: &str, body: &Value) {
        std::fs::write(dir.join(name), serde_json::to_vec_pretty(body).expect("json"))
            .expect("write shard");
    }

    #[tokio::test]
    async fn local_clock_emits_canonical_layout() {
        let stamp = TimeSource::local().now_utc().await;
        NaiveDateTime::parse_from_str(&stamp, CANONICAL_TIME_FORMAT).expect("canonical stamp");
    }

    #[tokio::test]
    async fn unreachable_time_service_falls_back_to_local_clock() {
        let clock = TimeSource::remote("http://127.0.0.1:9/time")
            .with_timeout(Duration::from_millis(200));
        let stamp = clock.now_utc().await;
        NaiveDateTime::parse_from_str(&stamp, CANONICAL_TIME_FORMAT).expect("canonical stamp");
    }

    #[tokio::test]
    async fn overwrite_produces_bak_sibling_with_previous_contents() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("final_entities.json");

        write_json_backup(&path, &json!({"generation": 1})).await.expect("first write");
        assert!(!backup_path(&path).exists());

        write_json_backup(&path, &json!({"generation": 2})).await.expect("second write");
        let backup: Value =
            serde_json::from_slice(&std::fs::read(backup_path(&path)).expect("read bak"))
                .expect("parse bak");
        assert_eq!(backup, json!({"generation": 1}));
    }

    #[tokio::test]
    async fn missing_or_malformed_archive_loads_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(
            dir.path().join("final_entities.json"),
            dir.path().join("per_group"),
            TimeSource::local(),
        );
        assert!(store.load().await.is_none());

        std::fs::write(store.path(), b"{ not json").expect("write garbage");
        assert!(store.load().await.is_none());

        // parses, but has no entities field
        std::fs::write(store.path(), br#"{"last_updated": "x"}"#).expect("write");
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn bootstrap_merges_shards_first_shard_wins() {
        let dir = tempdir().expect("tempdir");
        let shard_dir = dir.path().join("per_group");
        std::fs::create_dir_all(&shard_dir).expect("mkdir");

        write_shard(
            &shard_dir,
            "akira_entities.json",
            &json!({
                "entities": [
                    {"id": "x1", "domain": "d.com", "views": "10"},
                    {"id": "orphan-no-domain"}
                ],
                "last_updated": "",
                "total_count": 2
            }),
        );
        write_shard(
            &shard_dir,
            "lockbit_entities.json",
            &json!({
                "entities": [
                    {"id": "x1", "domain": "d.com", "views": 99},
                    {"id": "x2", "domain": "e.org", "ransomware_group": "LockBit"}
                ],
                "last_updated": "",
                "total_count": 2
            }),
        );
        write_shard(&shard_dir, "broken_entities.json", &json!("not a shard"));

        let store = ArchiveStore::new(
            dir.path().join("final_entities.json"),
            &shard_dir,
            TimeSource::local(),
        );
        store.ensure_exists().await.expect("bootstrap");

        let archive = store.load().await.expect("archive parses");
        assert_eq!(archive.entities.len(), 2);
        assert_eq!(archive.total_count, 2);
        assert_eq!(archive.description, ARCHIVE_DESCRIPTION);

        let first = &archive.entities[0];
        assert_eq!(first.identity_key(), Some("x1:d.com".to_string()));
        // akira shard sorts first, so its copy wins and its group is stamped
        assert_eq!(first.get("group_key"), Some(&json!("akira")));
        assert_eq!(first.get("views"), Some(&json!(10)));

        let second = &archive.entities[1];
        assert_eq!(second.get("group_key"), Some(&json!("lockbit")));
        // attribution already present on the record is kept
        assert_eq!(second.get("ransomware_group"), Some(&json!("LockBit")));
    }

    #[tokio::test]
    async fn bootstrap_without_shard_dir_writes_empty_archive() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(
            dir.path().join("final_entities.json"),
            dir.path().join("per_group"),
            TimeSource::local(),
        );
        store.ensure_exists().await.expect("bootstrap");

        let archive = store.load().await.expect("archive parses");
        assert!(archive.entities.is_empty());
        assert_eq!(archive.total_count, 0);
    }

    #[tokio::test]
    async fn existing_archive_only_gets_timestamp_refresh() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(
            dir.path().join("final_entities.json"),
            dir.path().join("per_group"),
            TimeSource::local(),
        );

        let mut archive = ArchiveSet::empty("2020-01-01 00:00:00 UTC".to_string());
        archive
            .entities
            .push(lset_core::standardize_record(
                json!({"id": "x1", "domain": "d.com"}).as_object().expect("obj"),
            ));
        archive.total_count = 1;
        store.save(&archive).await.expect("seed archive");

        store.ensure_exists().await.expect("refresh");
        let refreshed = store.load().await.expect("archive parses");
        assert_eq!(refreshed.entities.len(), 1);
        assert_ne!(refreshed.last_updated, "2020-01-01 00:00:00 UTC");
    }

    #[tokio::test]
    async fn staging_ensure_exists_synthesizes_empty_set() {
        let dir = tempdir().expect("tempdir");
        let store = StagingStore::new(dir.path().join("new_entities.json"), TimeSource::local());

        store.ensure_exists().await.expect("create");
        let staging = store.load().await.expect("staging parses");
        assert!(staging.entities.is_empty());
        assert_eq!(staging.total_count, 0);

        // second call is a no-op on an existing file
        store.ensure_exists().await.expect("noop");
    }
}
