//! Content-addressed cache of agent results.
//!
//! Keys hash (document fingerprint, agent id, sorted page set, schema
//! version). Each key has one in-process `OnceCell`, so concurrent requests
//! for the same key join the first computation instead of calling the model
//! again. Successful results are also persisted under
//! `<root>/<document stem>/<agent>__<version>.json`; entries never expire by
//! age and are only replaced by a schema-version bump, a cache bust or an
//! explicit invalidation.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use super::types::{document_stem, AgentId, AgentTask, Document, ExtractionResult};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache entry at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Cache serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ═══════════════════════════════════════════
// Keys & entries
// ═══════════════════════════════════════════

/// Hex SHA-256 cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(
        fingerprint: &str,
        agent_id: &AgentId,
        pages: &BTreeSet<u32>,
        schema_version: &str,
    ) -> Self {
        let page_list = pages
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut hasher = Sha256::new();
        for part in [fingerprint, agent_id.as_str(), page_list.as_str(), schema_version] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hex SHA-256 of document bytes.
pub fn content_fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Everything needed to address one cache slot.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub key: CacheKey,
    pub document_stem: String,
    pub agent_id: AgentId,
    pub schema_version: String,
}

impl CacheRequest {
    pub fn for_task(document: &Document, task: &AgentTask) -> Self {
        Self {
            key: CacheKey::compute(
                document.fingerprint(),
                &task.agent_id,
                &task.pages,
                &task.schema_version,
            ),
            document_stem: document.stem(),
            agent_id: task.agent_id.clone(),
            schema_version: task.schema_version.clone(),
        }
    }
}

/// Self-describing persisted entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub document_stem: String,
    pub agent_id: AgentId,
    pub schema_version: String,
    pub created_at: DateTime<Utc>,
    pub result: ExtractionResult,
}

/// Where a returned result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// Freshly computed by this request.
    Computed,
    /// Read from a persisted entry.
    Disk,
    /// Already resolved in this process.
    Memory,
    /// Joined another request's in-flight computation.
    Coalesced,
}

impl CacheSource {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Computed)
    }
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub result: ExtractionResult,
    pub source: CacheSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub corrupt: u64,
    pub writes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    corrupt: AtomicU64,
    writes: AtomicU64,
}

struct Slot {
    document_stem: String,
    agent_id: AgentId,
    cell: Arc<OnceCell<(ExtractionResult, CacheSource)>>,
}

// ═══════════════════════════════════════════
// Cache service
// ═══════════════════════════════════════════

/// The single shared cache instance handed to every pipeline component.
pub struct ExtractionCache {
    root: Option<PathBuf>,
    bust: bool,
    slots: Mutex<HashMap<CacheKey, Slot>>,
    counters: Counters,
}

impl ExtractionCache {
    /// Persistent cache rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root: Some(root),
            bust: false,
            slots: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Process-local cache with no persistence.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            ..Self::new(PathBuf::new())
        }
    }

    /// Ignore persisted entries on read; fresh results still overwrite them.
    pub fn with_bust(mut self, bust: bool) -> Self {
        self.bust = bust;
        self
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::SeqCst),
            misses: self.counters.misses.load(Ordering::SeqCst),
            coalesced: self.counters.coalesced.load(Ordering::SeqCst),
            corrupt: self.counters.corrupt.load(Ordering::SeqCst),
            writes: self.counters.writes.load(Ordering::SeqCst),
        }
    }

    /// Return the cached result for `request`, or run `compute` exactly once
    /// across all concurrent callers with the same key.
    ///
    /// Failed results are shared with callers already waiting but are not
    /// kept: the next request computes again.
    pub async fn get_or_compute<F, Fut>(&self, request: &CacheRequest, compute: F) -> CacheLookup
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ExtractionResult>,
    {
        let mut cell = self.slot(request).await;

        if let Some((result, _)) = cell.get() {
            if result.is_success() {
                self.counters.hits.fetch_add(1, Ordering::SeqCst);
                debug!(agent_id = %request.agent_id, "Cache hit (memory)");
                return CacheLookup {
                    result: result.clone(),
                    source: CacheSource::Memory,
                };
            }
            // Settled failure whose slot was not yet released.
            self.release(request, &cell).await;
            cell = self.slot(request).await;
        }

        let initialized_here = AtomicBool::new(false);
        let ran = &initialized_here;
        let (result, source) = cell
            .get_or_init(|| async move {
                ran.store(true, Ordering::SeqCst);
                if let Some(result) = self.read_persisted(request).await {
                    self.counters.hits.fetch_add(1, Ordering::SeqCst);
                    return (result, CacheSource::Disk);
                }

                self.counters.misses.fetch_add(1, Ordering::SeqCst);
                let result = compute().await;
                if result.is_success() {
                    if let Err(e) = self.persist(request, &result).await {
                        warn!(agent_id = %request.agent_id, error = %e, "Failed to persist cache entry");
                    }
                }
                (result, CacheSource::Computed)
            })
            .await
            .clone();

        if !initialized_here.load(Ordering::SeqCst) {
            self.counters.coalesced.fetch_add(1, Ordering::SeqCst);
            debug!(agent_id = %request.agent_id, "Joined in-flight computation");
            return CacheLookup {
                result,
                source: CacheSource::Coalesced,
            };
        }

        if !result.is_success() {
            self.release(request, &cell).await;
        }

        CacheLookup { result, source }
    }

    /// Drop the slot for `request` if it still holds `cell`.
    async fn release(&self, request: &CacheRequest, cell: &Arc<OnceCell<(ExtractionResult, CacheSource)>>) {
        let mut slots = self.slots.lock().await;
        if slots
            .get(&request.key)
            .is_some_and(|slot| Arc::ptr_eq(&slot.cell, cell))
        {
            slots.remove(&request.key);
        }
    }

    /// Pure read: memory first, then disk. Never computes.
    pub async fn lookup(&self, request: &CacheRequest) -> Option<ExtractionResult> {
        {
            let slots = self.slots.lock().await;
            if let Some((result, _)) = slots.get(&request.key).and_then(|s| s.cell.get()) {
                if result.is_success() {
                    return Some(result.clone());
                }
            }
        }
        self.read_persisted(request).await
    }

    /// Remove every entry of one agent for one document. Returns files removed.
    pub async fn invalidate(&self, document: &str, agent_id: &AgentId) -> Result<usize, CacheError> {
        let stem = document_stem(Path::new(document));
        self.slots
            .lock()
            .await
            .retain(|_, s| !(s.document_stem == stem && &s.agent_id == agent_id));

        let Some(dir) = self.document_dir(&stem) else {
            return Ok(0);
        };
        let prefix = format!("{}__", safe_component(agent_id.as_str()));
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".json") {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        info!(document = %stem, agent_id = %agent_id, removed, "Invalidated cache entries");
        Ok(removed)
    }

    /// Remove every entry for one document.
    pub async fn invalidate_document(&self, document: &str) -> Result<(), CacheError> {
        let stem = document_stem(Path::new(document));
        self.slots.lock().await.retain(|_, s| s.document_stem != stem);
        if let Some(dir) = self.document_dir(&stem) {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => info!(document = %stem, "Invalidated document cache"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Path of the persisted entry for a request.
    pub fn entry_path(&self, request: &CacheRequest) -> Option<PathBuf> {
        self.document_dir(&request.document_stem).map(|dir| {
            dir.join(format!(
                "{}__{}.json",
                safe_component(request.agent_id.as_str()),
                safe_component(&request.schema_version)
            ))
        })
    }

    async fn slot(&self, request: &CacheRequest) -> Arc<OnceCell<(ExtractionResult, CacheSource)>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(request.key.clone())
            .or_insert_with(|| Slot {
                document_stem: request.document_stem.clone(),
                agent_id: request.agent_id.clone(),
                cell: Arc::new(OnceCell::new()),
            })
            .cell
            .clone()
    }

    fn document_dir(&self, stem: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(safe_component(stem)))
    }

    /// Read a persisted entry, discarding it when unreadable.
    async fn read_persisted(&self, request: &CacheRequest) -> Option<ExtractionResult> {
        if self.bust {
            return None;
        }
        let path = self.entry_path(request)?;
        match read_entry(&path).await {
            Ok(Some(entry)) if entry.key == request.key => {
                debug!(agent_id = %request.agent_id, path = %path.display(), "Cache hit (disk)");
                Some(entry.result)
            }
            Ok(Some(_)) => {
                debug!(agent_id = %request.agent_id, "Persisted entry has a different key");
                None
            }
            Ok(None) => None,
            Err(e) => {
                self.counters.corrupt.fetch_add(1, Ordering::SeqCst);
                warn!(agent_id = %request.agent_id, error = %e, "Discarding unreadable cache entry");
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    debug!(error = %rm, "Could not remove corrupt cache entry");
                }
                None
            }
        }
    }

    /// Atomically write a successful result.
    async fn persist(&self, request: &CacheRequest, result: &ExtractionResult) -> Result<(), CacheError> {
        let Some(path) = self.entry_path(request) else {
            return Ok(());
        };
        let entry = CacheEntry {
            key: request.key.clone(),
            document_stem: request.document_stem.clone(),
            agent_id: request.agent_id.clone(),
            schema_version: request.schema_version.clone(),
            created_at: Utc::now(),
            result: result.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(e.to_string())))??;

        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        debug!(agent_id = %request.agent_id, path = %path.display(), "Persisted cache entry");
        Ok(())
    }
}

async fn read_entry(path: &Path) -> Result<Option<CacheEntry>, CacheError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| CacheError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Temp file in the target directory, then rename over the target.
/// The temp file is removed if anything fails before the rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let dir = path
        .parent()
        .ok_or_else(|| CacheError::Io(std::io::Error::other("cache path has no parent")))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CacheError::Io(e.error))?;
    Ok(())
}

fn safe_component(s: &str) -> String {
    let clean: String = s
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    if clean.is_empty() || clean.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        clean
    }
}
