use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::queue::{
    stats_of, synced_beyond, EmergencyRecord, QueueError, QueueStats, QueueStorage, RecordId,
};
use crate::time::UnixTimeMs;

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 100 * 1024 * 1024;
const MAX_RECORDS: usize = 100_000;
const STORE_MAGIC: &[u8; 4] = b"LFQS";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("too many records: {count}, max {max}")]
    TooManyRecords { count: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

// Payload is kept as JSON text so arbitrary payload shapes survive CBOR unchanged.
#[derive(Serialize, Deserialize, Debug)]
struct StoredRecord {
    id: u64,
    kind: String,
    payload_json: String,
    created_at: u64,
    synced: bool,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct StorePayload {
    records: Vec<StoredRecord>,
}

impl StoredRecord {
    fn from_record(record: &EmergencyRecord) -> Result<Self, StoreError> {
        Ok(Self {
            id: record.id.0,
            kind: record.kind.clone(),
            payload_json: serde_json::to_string(&record.payload)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            created_at: record.created_at.0,
            synced: record.synced,
        })
    }

    fn into_record(self) -> Result<EmergencyRecord, StoreError> {
        Ok(EmergencyRecord {
            id: RecordId(self.id),
            kind: self.kind,
            payload: serde_json::from_str(&self.payload_json)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            created_at: UnixTimeMs(self.created_at),
            synced: self.synced,
        })
    }
}

type RecordMap = BTreeMap<RecordId, EmergencyRecord>;

/// Encodes the full record set into a checksummed CBOR envelope.
///
/// Refuses snapshots that [`decode_snapshot`] would reject as too large.
pub fn encode_snapshot<'a>(
    records: impl Iterator<Item = &'a EmergencyRecord>,
) -> Result<Vec<u8>, StoreError> {
    encode_snapshot_within(records, MAX_STORE_BYTES)
}

fn encode_snapshot_within<'a>(
    records: impl Iterator<Item = &'a EmergencyRecord>,
    max_bytes: usize,
) -> Result<Vec<u8>, StoreError> {
    let payload = StorePayload {
        records: records
            .map(StoredRecord::from_record)
            .collect::<Result<_, _>>()?,
    };
    if payload.records.len() > MAX_RECORDS {
        return Err(StoreError::TooManyRecords {
            count: payload.records.len(),
            max: MAX_RECORDS,
        });
    }

    let mut payload_bytes = Vec::new();
    ciborium::into_writer(&payload, &mut payload_bytes)?;

    let checksum = blake3::hash(&payload_bytes);

    let envelope = StoreEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload: payload_bytes,
    };

    let mut envelope_bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut envelope_bytes)?;
    if envelope_bytes.len() > max_bytes {
        return Err(StoreError::StoreTooLarge {
            size: envelope_bytes.len(),
            max: max_bytes,
        });
    }
    Ok(envelope_bytes)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<EmergencyRecord>, StoreError> {
    if bytes.len() > MAX_STORE_BYTES {
        return Err(StoreError::StoreTooLarge {
            size: bytes.len(),
            max: MAX_STORE_BYTES,
        });
    }

    let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }
    if envelope.schema_version < CURRENT_SCHEMA_VERSION {
        return Err(StoreError::UnknownSchema(envelope.schema_version));
    }

    let actual_checksum = blake3::hash(&envelope.payload);
    if actual_checksum.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual_checksum.as_bytes()),
        });
    }

    let payload: StorePayload = ciborium::from_reader(&envelope.payload[..])?;

    if payload.records.len() > MAX_RECORDS {
        return Err(StoreError::TooManyRecords {
            count: payload.records.len(),
            max: MAX_RECORDS,
        });
    }

    payload
        .records
        .into_iter()
        .map(StoredRecord::into_record)
        .collect()
}

/// Writes via a temp file, fsyncs, then renames over the target.
fn save_to_path(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

fn load_from_path(path: &Path) -> Result<RecordMap, StoreError> {
    if !path.exists() {
        return Ok(RecordMap::new());
    }

    let bytes = std::fs::read(path)?;

    if bytes.is_empty() {
        return Err(StoreError::Corrupted {
            reason: "empty file",
        });
    }

    Ok(decode_snapshot(&bytes)?
        .into_iter()
        .map(|r| (r.id, r))
        .collect())
}

/// Single-file queue storage for hosts without SQLite.
///
/// Every mutation rewrites the whole snapshot; the in-memory view only
/// changes once the new snapshot is on disk.
pub struct FileQueueStorage {
    path: PathBuf,
    records: Mutex<RecordMap>,
    max_bytes: usize,
}

impl FileQueueStorage {
    #[instrument(skip(path), fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let records = load_from_path(path)?;
        debug!(records = records.len(), "offline store loaded");
        Ok(Self {
            path: path.to_path_buf(),
            records: Mutex::new(records),
            max_bytes: MAX_STORE_BYTES,
        })
    }

    #[cfg(test)]
    fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn commit(&self, next: &RecordMap) -> Result<(), StoreError> {
        let bytes = encode_snapshot_within(next.values(), self.max_bytes).map_err(|e| {
            warn!(error = %e, "offline store snapshot refused");
            e
        })?;
        save_to_path(&self.path, &bytes).map_err(|e| {
            warn!(error = %e, "failed to write offline store");
            e
        })
    }
}

#[async_trait::async_trait]
impl QueueStorage for FileQueueStorage {
    async fn max_id(&self) -> Result<Option<RecordId>, QueueError> {
        Ok(self.records.lock().await.keys().next_back().copied())
    }

    async fn insert(&self, record: &EmergencyRecord) -> Result<(), QueueError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Err(QueueError::Persist {
                id: record.id,
                reason: "duplicate id".into(),
            });
        }
        let mut next = records.clone();
        next.insert(record.id, record.clone());
        self.commit(&next)?;
        *records = next;
        Ok(())
    }

    async fn load_unsynced(&self) -> Result<Vec<EmergencyRecord>, QueueError> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| !r.synced)
            .cloned()
            .collect())
    }

    async fn get(&self, id: RecordId) -> Result<Option<EmergencyRecord>, QueueError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn mark_synced(&self, id: RecordId) -> Result<bool, QueueError> {
        let mut records = self.records.lock().await;
        match records.get(&id) {
            Some(record) if !record.synced => {}
            _ => return Ok(false),
        }
        let mut next = records.clone();
        if let Some(record) = next.get_mut(&id) {
            record.synced = true;
        }
        self.commit(&next)?;
        *records = next;
        Ok(true)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(stats_of(self.records.lock().await.values()))
    }

    async fn prune_synced(&self, keep: usize) -> Result<usize, QueueError> {
        let mut records = self.records.lock().await;
        let doomed = synced_beyond(records.values(), keep);
        if doomed.is_empty() {
            return Ok(0);
        }
        let mut next = records.clone();
        for id in &doomed {
            next.remove(id);
        }
        self.commit(&next)?;
        *records = next;
        Ok(doomed.len())
    }
}
