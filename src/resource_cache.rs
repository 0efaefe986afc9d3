//! Versioned, content-addressed cache of static resources.
//!
//! One version is current at a time. `warm` builds the next version
//! off to the side and `promote` switches every reader over to it and drops
//! the rest. Bodies are stored once per BLAKE3 digest.

use bytes::Bytes;
use lru::LruCache;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    validate_version_name, CacheKey, HttpError, HttpHeaders, HttpMethod, HttpRequest,
    HttpResponse, HttpTransport, KvError, MAX_VALUE_SIZE,
};
use crate::config::{ConfigError, CoreContext};
use crate::time::UnixTimeMs;

/// Only this status is ever written to the cache.
pub const CACHEABLE_STATUS: u16 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVersion {
    pub name: String,
    pub created_at: UnixTimeMs,
}

/// Immutable cached response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    pub key: CacheKey,
    pub status: u16,
    pub headers: HttpHeaders,
    pub body: Bytes,
    pub content_hash: [u8; 32],
    pub stored_at: UnixTimeMs,
}

impl CachedEntry {
    pub fn from_response(key: CacheKey, response: &HttpResponse, stored_at: UnixTimeMs) -> Self {
        let body = response.body().clone();
        Self {
            key,
            status: response.status(),
            headers: response.headers().clone(),
            content_hash: *blake3::hash(&body).as_bytes(),
            body,
            stored_at,
        }
    }

    pub fn to_response(&self) -> HttpResponse {
        HttpResponse::new(self.status, self.headers.clone(), self.body.clone())
    }

    pub fn content_hash_hex(&self) -> String {
        hex::encode(self.content_hash)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache version: {0}")]
    InvalidVersion(#[from] KvError),

    #[error("invalid resource '{path}': {reason}")]
    InvalidResource { path: String, reason: String },

    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: HttpError,
    },

    #[error("fetching {url} returned status {status}")]
    BadStatus { url: String, status: u16 },

    #[error("response for {url} is {size} bytes, max {max}")]
    TooLarge { url: String, size: usize, max: usize },

    #[error("no warmed cache version to promote")]
    NothingWarmed,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupted cache entry {key}: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("lock acquisition failed")]
    LockFailed,
}

impl From<ConfigError> for CacheError {
    fn from(e: ConfigError) -> Self {
        CacheError::InvalidResource {
            path: String::new(),
            reason: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmReport {
    pub version: String,
    pub resources: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromoteReport {
    pub current: String,
    pub deleted: Vec<String>,
}

// ============================================================================
// Storage Trait
// ============================================================================

#[async_trait::async_trait]
pub trait CacheStorage: Send + Sync {
    /// Writes a complete version atomically, replacing any same-named one.
    async fn put_version(&self, name: &str, entries: Vec<CachedEntry>) -> Result<(), CacheError>;
    /// Adds or replaces one entry in an existing version.
    async fn put_entry(&self, version: &str, entry: CachedEntry) -> Result<(), CacheError>;
    async fn get_entry(
        &self,
        version: &str,
        key: &CacheKey,
    ) -> Result<Option<CachedEntry>, CacheError>;
    async fn versions(&self) -> Result<Vec<CacheVersion>, CacheError>;
    async fn current(&self) -> Result<Option<String>, CacheError>;
    /// Marks `name` current and deletes every other version in one step.
    /// Returns the names deleted.
    async fn promote(&self, name: &str) -> Result<Vec<String>, CacheError>;
    /// Removes a version and any bodies no longer referenced.
    async fn delete_version(&self, name: &str) -> Result<usize, CacheError>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteCacheStorage;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::{CacheError, CacheStorage, CacheVersion, CachedEntry};
    use crate::capabilities::{CacheKey, HttpHeaders};
    use crate::time::UnixTimeMs;
    use bytes::Bytes;
    use rusqlite::{params, Connection, OptionalExtension, Transaction};
    use std::path::Path;
    use std::sync::{Mutex, MutexGuard};

    const CACHE_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS cache_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cache_versions (
        name TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cache_blobs (
        hash TEXT PRIMARY KEY,
        body BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cache_entries (
        version TEXT NOT NULL,
        key TEXT NOT NULL,
        status INTEGER NOT NULL,
        headers TEXT NOT NULL,
        hash TEXT NOT NULL,
        stored_at INTEGER NOT NULL,
        PRIMARY KEY (version, key)
    );

    CREATE INDEX IF NOT EXISTS idx_cache_entries_hash ON cache_entries(hash);
    "#;

    const CURRENT_KEY: &str = "current_version";

    pub struct SqliteCacheStorage {
        conn: Mutex<Connection>,
    }

    impl SqliteCacheStorage {
        pub fn open(path: &Path) -> Result<Self, CacheError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CacheError::Storage(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
            let conn = Connection::open(path).map_err(|e| {
                CacheError::Storage(format!("failed to open {}: {e}", path.display()))
            })?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, CacheError> {
            Self::init(Connection::open_in_memory().map_err(storage_err)?)
        }

        fn init(conn: Connection) -> Result<Self, CacheError> {
            let _mode: String = conn
                .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
                .map_err(storage_err)?;
            conn.execute_batch(CACHE_SCHEMA).map_err(storage_err)?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn lock(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
            self.conn.lock().map_err(|_| CacheError::LockFailed)
        }
    }

    fn storage_err(e: rusqlite::Error) -> CacheError {
        CacheError::Storage(e.to_string())
    }

    fn to_i64(v: u64) -> i64 {
        i64::try_from(v).unwrap_or(i64::MAX)
    }

    fn insert_entry(tx: &Transaction<'_>, version: &str, entry: &CachedEntry) -> Result<(), CacheError> {
        let hash = entry.content_hash_hex();
        let headers = serde_json::to_string(&entry.headers)
            .map_err(|e| CacheError::Storage(e.to_string()))?;
        tx.execute(
            "INSERT OR IGNORE INTO cache_blobs (hash, body) VALUES (?1, ?2)",
            params![hash, entry.body.as_ref()],
        )
        .map_err(storage_err)?;
        tx.execute(
            "INSERT OR REPLACE INTO cache_entries (version, key, status, headers, hash, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                version,
                entry.key.as_str(),
                entry.status,
                headers,
                hash,
                to_i64(entry.stored_at.0)
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    fn collect_garbage(tx: &Transaction<'_>) -> Result<usize, CacheError> {
        tx.execute(
            "DELETE FROM cache_blobs WHERE hash NOT IN (SELECT DISTINCT hash FROM cache_entries)",
            [],
        )
        .map_err(storage_err)
    }

    fn remove_version(tx: &Transaction<'_>, name: &str) -> Result<usize, CacheError> {
        let removed = tx
            .execute("DELETE FROM cache_entries WHERE version = ?1", params![name])
            .map_err(storage_err)?;
        tx.execute("DELETE FROM cache_versions WHERE name = ?1", params![name])
            .map_err(storage_err)?;
        Ok(removed)
    }

    #[async_trait::async_trait]
    impl CacheStorage for SqliteCacheStorage {
        async fn put_version(&self, name: &str, entries: Vec<CachedEntry>) -> Result<(), CacheError> {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(storage_err)?;
            remove_version(&tx, name)?;
            tx.execute(
                "INSERT INTO cache_versions (name, created_at) VALUES (?1, ?2)",
                params![name, to_i64(UnixTimeMs::now().0)],
            )
            .map_err(storage_err)?;
            for entry in &entries {
                insert_entry(&tx, name, entry)?;
            }
            collect_garbage(&tx)?;
            tx.commit().map_err(storage_err)
        }

        async fn put_entry(&self, version: &str, entry: CachedEntry) -> Result<(), CacheError> {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(storage_err)?;
            let exists: Option<String> = tx
                .query_row(
                    "SELECT name FROM cache_versions WHERE name = ?1",
                    params![version],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            if exists.is_none() {
                return Err(CacheError::Storage(format!("unknown version {version}")));
            }
            insert_entry(&tx, version, &entry)?;
            collect_garbage(&tx)?;
            tx.commit().map_err(storage_err)
        }

        async fn get_entry(
            &self,
            version: &str,
            key: &CacheKey,
        ) -> Result<Option<CachedEntry>, CacheError> {
            let conn = self.lock()?;
            let row: Option<(u16, String, String, i64, Vec<u8>)> = conn
                .query_row(
                    "SELECT e.status, e.headers, e.hash, e.stored_at, b.body
                     FROM cache_entries e JOIN cache_blobs b ON b.hash = e.hash
                     WHERE e.version = ?1 AND e.key = ?2",
                    params![version, key.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .optional()
                .map_err(storage_err)?;

            let Some((status, headers, hash, stored_at, body)) = row else {
                return Ok(None);
            };
            let corrupted = |reason: String| CacheError::Corrupted {
                key: key.to_string(),
                reason,
            };
            let headers: HttpHeaders =
                serde_json::from_str(&headers).map_err(|e| corrupted(e.to_string()))?;
            let mut content_hash = [0u8; 32];
            hex::decode_to_slice(&hash, &mut content_hash).map_err(|e| corrupted(e.to_string()))?;
            if blake3::hash(&body).as_bytes() != &content_hash {
                return Err(corrupted("body does not match its digest".into()));
            }
            Ok(Some(CachedEntry {
                key: key.clone(),
                status,
                headers,
                body: Bytes::from(body),
                content_hash,
                stored_at: UnixTimeMs(u64::try_from(stored_at).unwrap_or(0)),
            }))
        }

        async fn versions(&self) -> Result<Vec<CacheVersion>, CacheError> {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT name, created_at FROM cache_versions ORDER BY name")
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(CacheVersion {
                        name: row.get(0)?,
                        created_at: UnixTimeMs(u64::try_from(row.get::<_, i64>(1)?).unwrap_or(0)),
                    })
                })
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_err)?;
            Ok(rows)
        }

        async fn current(&self) -> Result<Option<String>, CacheError> {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT value FROM cache_meta WHERE key = ?1",
                params![CURRENT_KEY],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)
        }

        async fn promote(&self, name: &str) -> Result<Vec<String>, CacheError> {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(storage_err)?;

            let known: Option<String> = tx
                .query_row(
                    "SELECT name FROM cache_versions WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            if known.is_none() {
                return Err(CacheError::NothingWarmed);
            }

            let stale: Vec<String> = {
                let mut stmt = tx
                    .prepare("SELECT name FROM cache_versions WHERE name != ?1 ORDER BY name")
                    .map_err(storage_err)?;
                let rows = stmt
                    .query_map(params![name], |row| row.get(0))
                    .map_err(storage_err)?;
                rows.collect::<Result<Vec<String>, _>>()
                    .map_err(storage_err)?
            };

            tx.execute(
                "INSERT OR REPLACE INTO cache_meta (key, value) VALUES (?1, ?2)",
                params![CURRENT_KEY, name],
            )
            .map_err(storage_err)?;
            for old in &stale {
                remove_version(&tx, old)?;
            }
            collect_garbage(&tx)?;
            tx.commit().map_err(storage_err)?;
            Ok(stale)
        }

        async fn delete_version(&self, name: &str) -> Result<usize, CacheError> {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(storage_err)?;
            let removed = remove_version(&tx, name)?;
            tx.execute(
                "DELETE FROM cache_meta WHERE key = ?1 AND value = ?2",
                params![CURRENT_KEY, name],
            )
            .map_err(storage_err)?;
            collect_garbage(&tx)?;
            tx.commit().map_err(storage_err)?;
            Ok(removed)
        }
    }
}

// ============================================================================
// In-memory Implementation
// ============================================================================

#[derive(Debug, Clone)]
struct EntryRef {
    status: u16,
    headers: HttpHeaders,
    content_hash: [u8; 32],
    stored_at: UnixTimeMs,
}

#[derive(Default)]
struct MemoryCacheState {
    current: Option<String>,
    versions: BTreeMap<String, (UnixTimeMs, HashMap<CacheKey, EntryRef>)>,
    blobs: HashMap<[u8; 32], Bytes>,
}

impl MemoryCacheState {
    fn insert(&mut self, version: &str, entry: CachedEntry) {
        self.blobs.entry(entry.content_hash).or_insert(entry.body);
        if let Some((_, entries)) = self.versions.get_mut(version) {
            entries.insert(
                entry.key,
                EntryRef {
                    status: entry.status,
                    headers: entry.headers,
                    content_hash: entry.content_hash,
                    stored_at: entry.stored_at,
                },
            );
        }
    }

    fn collect_garbage(&mut self) {
        let live: std::collections::HashSet<[u8; 32]> = self
            .versions
            .values()
            .flat_map(|(_, entries)| entries.values().map(|e| e.content_hash))
            .collect();
        self.blobs.retain(|hash, _| live.contains(hash));
    }
}

#[derive(Default)]
pub struct MemoryCacheStorage {
    state: RwLock<MemoryCacheState>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct bodies held.
    pub async fn blob_count(&self) -> usize {
        self.state.read().await.blobs.len()
    }
}

#[async_trait::async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn put_version(&self, name: &str, entries: Vec<CachedEntry>) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        state
            .versions
            .insert(name.to_string(), (UnixTimeMs::now(), HashMap::new()));
        for entry in entries {
            state.insert(name, entry);
        }
        state.collect_garbage();
        Ok(())
    }

    async fn put_entry(&self, version: &str, entry: CachedEntry) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        if !state.versions.contains_key(version) {
            return Err(CacheError::Storage(format!("unknown version {version}")));
        }
        state.insert(version, entry);
        Ok(())
    }

    async fn get_entry(
        &self,
        version: &str,
        key: &CacheKey,
    ) -> Result<Option<CachedEntry>, CacheError> {
        let state = self.state.read().await;
        let Some(entry) = state.versions.get(version).and_then(|(_, e)| e.get(key)) else {
            return Ok(None);
        };
        let body = state
            .blobs
            .get(&entry.content_hash)
            .cloned()
            .ok_or_else(|| CacheError::Corrupted {
                key: key.to_string(),
                reason: "missing body".into(),
            })?;
        Ok(Some(CachedEntry {
            key: key.clone(),
            status: entry.status,
            headers: entry.headers.clone(),
            body,
            content_hash: entry.content_hash,
            stored_at: entry.stored_at,
        }))
    }

    async fn versions(&self) -> Result<Vec<CacheVersion>, CacheError> {
        Ok(self
            .state
            .read()
            .await
            .versions
            .iter()
            .map(|(name, (created_at, _))| CacheVersion {
                name: name.clone(),
                created_at: *created_at,
            })
            .collect())
    }

    async fn current(&self) -> Result<Option<String>, CacheError> {
        Ok(self.state.read().await.current.clone())
    }

    async fn promote(&self, name: &str) -> Result<Vec<String>, CacheError> {
        let mut state = self.state.write().await;
        if !state.versions.contains_key(name) {
            return Err(CacheError::NothingWarmed);
        }
        let stale: Vec<String> = state
            .versions
            .keys()
            .filter(|v| v.as_str() != name)
            .cloned()
            .collect();
        for old in &stale {
            state.versions.remove(old);
        }
        state.current = Some(name.to_string());
        state.collect_garbage();
        Ok(stale)
    }

    async fn delete_version(&self, name: &str) -> Result<usize, CacheError> {
        let mut state = self.state.write().await;
        let removed = state
            .versions
            .remove(name)
            .map_or(0, |(_, entries)| entries.len());
        if state.current.as_deref() == Some(name) {
            state.current = None;
        }
        state.collect_garbage();
        Ok(removed)
    }
}

// ============================================================================
// Resource Cache
// ============================================================================

pub struct ResourceCache {
    storage: Arc<dyn CacheStorage>,
    transport: Arc<dyn HttpTransport>,
    ctx: CoreContext,
    staged: Mutex<Option<String>>,
    memo: Mutex<LruCache<CacheKey, CachedEntry>>,
}

impl ResourceCache {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        transport: Arc<dyn HttpTransport>,
        ctx: CoreContext,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(ctx.config.lookup_memo_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            storage,
            transport,
            ctx,
            staged: Mutex::new(None),
            memo: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetches every resource, then writes them as a new version.
    ///
    /// Nothing is written unless every fetch returned 200.
    #[instrument(skip(self, resources), fields(count = resources.len(), version = %self.ctx.config.cache_name))]
    pub async fn warm(&self, resources: &[String]) -> Result<WarmReport, CacheError> {
        let version = self.ctx.config.cache_name.clone();
        validate_version_name(&version)?;

        let fetches = resources.iter().map(|path| self.fetch_for_warm(path));
        let entries = futures::future::try_join_all(fetches).await.map_err(|e| {
            warn!(error = %e, "cache warm failed, keeping previous version");
            e
        })?;

        let report = WarmReport {
            version: version.clone(),
            resources: entries.len(),
            bytes: entries.iter().map(|e| e.body.len()).sum(),
        };
        self.storage.put_version(&version, entries).await?;
        *self.staged.lock().map_err(|_| CacheError::LockFailed)? = Some(version);

        info!(bytes = report.bytes, "cache version warmed");
        Ok(report)
    }

    async fn fetch_for_warm(&self, path: &str) -> Result<CachedEntry, CacheError> {
        let url = self
            .ctx
            .config
            .resolve(path)
            .map_err(|e| CacheError::InvalidResource {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        let request = HttpRequest::new(HttpMethod::Get, url.clone())
            .with_timeout(self.ctx.config.fetch_timeout())
            .map_err(|e| CacheError::InvalidResource {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|source| CacheError::Fetch {
                url: url.to_string(),
                source,
            })?;

        if response.status() != CACHEABLE_STATUS {
            return Err(CacheError::BadStatus {
                url: url.to_string(),
                status: response.status(),
            });
        }
        if response.body().len() > MAX_VALUE_SIZE {
            return Err(CacheError::TooLarge {
                url: url.to_string(),
                size: response.body().len(),
                max: MAX_VALUE_SIZE,
            });
        }
        debug!(%url, "fetched resource");
        Ok(CachedEntry::from_response(
            CacheKey::from_url(&url),
            &response,
            self.ctx.clock.now(),
        ))
    }

    /// Makes the last warmed version current and deletes every other one.
    #[instrument(skip(self))]
    pub async fn promote(&self) -> Result<PromoteReport, CacheError> {
        let staged = self
            .staged
            .lock()
            .map_err(|_| CacheError::LockFailed)?
            .take()
            .ok_or(CacheError::NothingWarmed)?;

        let deleted = match self.storage.promote(&staged).await {
            Ok(deleted) => deleted,
            Err(e) => {
                // Keep it staged so a later activate can retry.
                if let Ok(mut slot) = self.staged.lock() {
                    *slot = Some(staged);
                }
                return Err(e);
            }
        };
        self.memo.lock().map_err(|_| CacheError::LockFailed)?.clear();

        for name in &deleted {
            info!(version = %name, "deleted stale cache version");
        }
        info!(current = %staged, "cache version promoted");
        Ok(PromoteReport {
            current: staged,
            deleted,
        })
    }

    /// Looks `key` up in the current version only. Never touches the network.
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedEntry>, CacheError> {
        let memo_hit = {
            let mut memo = self.memo.lock().map_err(|_| CacheError::LockFailed)?;
            memo.get(key).cloned()
        };
        if memo_hit.is_some() {
            return Ok(memo_hit);
        }

        let Some(current) = self.storage.current().await? else {
            return Ok(None);
        };
        let entry = self.storage.get_entry(&current, key).await?;
        if let Some(entry) = &entry {
            self.memo
                .lock()
                .map_err(|_| CacheError::LockFailed)?
                .put(key.clone(), entry.clone());
        }
        Ok(entry)
    }

    /// Stores a 200 response in the current version. Returns whether it was stored.
    pub async fn store(&self, key: &CacheKey, response: &HttpResponse) -> Result<bool, CacheError> {
        if response.status() != CACHEABLE_STATUS {
            debug!(%key, status = response.status(), "not caching non-200 response");
            return Ok(false);
        }
        if response.body().len() > MAX_VALUE_SIZE {
            debug!(%key, size = response.body().len(), "not caching oversized response");
            return Ok(false);
        }
        let Some(current) = self.storage.current().await? else {
            debug!(%key, "no current cache version, skipping store");
            return Ok(false);
        };

        let entry = CachedEntry::from_response(key.clone(), response, self.ctx.clock.now());
        self.storage.put_entry(&current, entry).await?;
        self.memo.lock().map_err(|_| CacheError::LockFailed)?.pop(key);
        debug!(%key, version = %current, "cached response");
        Ok(true)
    }

    pub async fn current_version(&self) -> Result<Option<String>, CacheError> {
        self.storage.current().await
    }

    pub async fn versions(&self) -> Result<Vec<CacheVersion>, CacheError> {
        self.storage.versions().await
    }
}
