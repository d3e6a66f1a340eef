//! Cache Store: named, versioned generations of request → response entries.
//!
//! ```text
//! CacheStorage
//!     ├── "app-v1" ─ CacheHandle ─ RequestKey → CacheEntry
//!     └── "app-v2" ─ CacheHandle ─ RequestKey → CacheEntry
//! ```
//!
//! A [`CacheHandle`] is a cheap clone of one generation. Lookups through a
//! handle never see another generation, and a handle stays readable after
//! its generation has been deleted from the storage.
//!
//! Directory-backed storage keeps one JSON file per generation and writes
//! through on every mutation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use shellkit_net::{Request, Response};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::ServiceWorkerError;

const GENERATION_EXT: &str = "json";
const TMP_EXT: &str = "json.tmp";

// ==================== Keys & Entries ====================

/// Identity of a stored request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    /// Key of a plain GET for `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

/// A stored response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: RequestKey,

    /// Final response URL (after redirects).
    pub url: Url,

    pub status: u16,

    pub headers: Vec<(String, String)>,

    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Milliseconds since epoch.
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a response for storage.
    pub fn from_response(key: RequestKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            key,
            url: response.url.clone(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the response. The result is marked `from_cache`.
    pub fn to_response(&self) -> Result<Response, ServiceWorkerError> {
        let status = StatusCode::from_u16(self.status).map_err(|e| {
            ServiceWorkerError::CacheError(format!("{}: bad stored status: {}", self.key.url, e))
        })?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        Ok(Response {
            url: self.url.clone(),
            status,
            headers,
            body: self.body.clone().into(),
            from_cache: true,
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// On-disk form of one generation.
#[derive(Debug, Serialize, Deserialize)]
struct GenerationFile {
    name: String,
    entries: Vec<CacheEntry>,
}

// ==================== Cache Handle ====================

/// Handle to one cache generation.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    name: Arc<str>,
    entries: Arc<RwLock<HashMap<RequestKey, CacheEntry>>>,
    /// File this generation writes through to, if directory-backed.
    backing: Option<Arc<Path>>,
    deleted: Arc<AtomicBool>,
}

impl CacheHandle {
    fn new(name: &str, backing: Option<PathBuf>, entries: HashMap<RequestKey, CacheEntry>) -> Self {
        Self {
            name: Arc::from(name),
            entries: Arc::new(RwLock::new(entries)),
            backing: backing.map(Arc::from),
            deleted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Generation label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the generation has been removed from its storage.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Exact-identity lookup. Absence is not an error.
    pub async fn match_request(&self, key: &RequestKey) -> Option<CacheEntry> {
        let entry = self.entries.read().await.get(key).cloned();
        trace!(cache = %self.name, url = %key.url, hit = entry.is_some(), "Cache lookup");
        entry
    }

    /// Store `response` under `key`, replacing any previous entry.
    pub async fn put(&self, key: RequestKey, response: &Response) -> Result<(), ServiceWorkerError> {
        let entry = CacheEntry::from_response(key.clone(), response);
        self.put_entry(entry).await
    }

    /// Store a prepared entry under its own key.
    ///
    /// The entry becomes visible only once the write-through succeeded; on
    /// error the generation keeps its previous content.
    pub async fn put_entry(&self, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        let mut entries = self.entries.write().await;
        let key = entry.key.clone();
        let previous = entries.insert(key.clone(), entry);

        if let Err(e) = self.persist(&entries).await {
            match previous {
                Some(previous) => entries.insert(key, previous),
                None => entries.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    /// All stored keys, sorted.
    pub async fn keys(&self) -> Vec<RequestKey> {
        let mut keys: Vec<RequestKey> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Write the whole generation to its backing file. Called with the
    /// write lock held so file writes for one generation are serialized.
    async fn persist(&self, entries: &HashMap<RequestKey, CacheEntry>) -> Result<(), ServiceWorkerError> {
        let Some(path) = self.backing.as_deref() else {
            return Ok(());
        };
        if self.is_deleted() {
            trace!(cache = %self.name, "Generation deleted, skipping write-through");
            return Ok(());
        }

        let mut sorted: Vec<CacheEntry> = entries.values().cloned().collect();
        sorted.sort_by(|a, b| a.key.cmp(&b.key));
        let file = GenerationFile {
            name: self.name.to_string(),
            entries: sorted,
        };
        let json = serde_json::to_vec(&file)
            .map_err(|e| ServiceWorkerError::CacheError(format!("{}: {}", self.name, e)))?;

        // Replace the file in one step so a crash never leaves it truncated.
        let tmp = path.with_extension(TMP_EXT);
        let written = match tokio::fs::write(&tmp, json).await {
            Ok(()) => tokio::fs::rename(&tmp, path).await,
            Err(e) => Err(e),
        };
        if let Err(source) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ServiceWorkerError::Storage {
                message: format!("writing generation '{}'", self.name),
                source,
            });
        }
        Ok(())
    }
}

// ==================== Cache Storage ====================

/// All cache generations of one origin.
#[derive(Debug)]
pub struct CacheStorage {
    caches: RwLock<HashMap<String, CacheHandle>>,
    dir: Option<PathBuf>,
}

impl CacheStorage {
    /// Storage that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            dir: None,
        }
    }

    /// Directory-backed storage. Loads every generation found in `dir`,
    /// creating the directory if needed.
    pub async fn open_dir(dir: impl Into<PathBuf>) -> Result<Self, ServiceWorkerError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ServiceWorkerError::Storage {
                message: format!("creating {}", dir.display()),
                source,
            })?;

        let mut caches = HashMap::new();
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|source| ServiceWorkerError::Storage {
                message: format!("listing {}", dir.display()),
                source,
            })?;

        while let Some(item) = read_dir
            .next_entry()
            .await
            .map_err(|source| ServiceWorkerError::Storage {
                message: format!("listing {}", dir.display()),
                source,
            })?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(GENERATION_EXT) {
                continue;
            }
            match load_generation(&path).await {
                Ok(file) => {
                    let entries = file
                        .entries
                        .into_iter()
                        .map(|e| (e.key.clone(), e))
                        .collect();
                    debug!(cache = %file.name, path = %path.display(), "Loaded generation");
                    let handle = CacheHandle::new(&file.name, Some(path), entries);
                    caches.insert(file.name, handle);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable generation file");
                }
            }
        }

        info!(dir = %dir.display(), generations = caches.len(), "Cache storage opened");

        Ok(Self {
            caches: RwLock::new(caches),
            dir: Some(dir),
        })
    }

    fn generation_path(&self, name: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("{}.{}", urlencoding::encode(name), GENERATION_EXT)))
    }

    /// Open a generation, creating it if absent.
    pub async fn open(&self, name: &str) -> Result<CacheHandle, ServiceWorkerError> {
        if let Some(handle) = self.caches.read().await.get(name) {
            return Ok(handle.clone());
        }

        let mut caches = self.caches.write().await;
        if let Some(handle) = caches.get(name) {
            return Ok(handle.clone());
        }

        let handle = CacheHandle::new(name, self.generation_path(name), HashMap::new());
        {
            let entries = handle.entries.read().await;
            handle.persist(&entries).await?;
        }
        debug!(cache = %name, "Created generation");
        caches.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Check if a generation exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// All generation labels, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Delete a generation. Returns `Ok(false)` if it did not exist.
    ///
    /// If the backing file cannot be removed the generation is kept and the
    /// error returned, so a later sweep can try again.
    pub async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        let Some(handle) = caches.get(name).cloned() else {
            return Ok(false);
        };

        {
            // Blocks write-through until the deleted flag is set.
            let _entries = handle.entries.write().await;
            if let Some(path) = handle.backing.as_deref() {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(ServiceWorkerError::Storage {
                            message: format!("deleting generation '{name}'"),
                            source,
                        });
                    }
                }
            }
            handle.deleted.store(true, Ordering::Release);
        }

        caches.remove(name);
        debug!(cache = %name, "Deleted generation");
        Ok(true)
    }

    /// Look `key` up in every generation, in label order.
    pub async fn match_request(&self, key: &RequestKey) -> Option<CacheEntry> {
        let handles: Vec<CacheHandle> = {
            let caches = self.caches.read().await;
            let mut handles: Vec<CacheHandle> = caches.values().cloned().collect();
            handles.sort_by(|a, b| a.name.cmp(&b.name));
            handles
        };

        for handle in handles {
            if let Some(entry) = handle.match_request(key).await {
                return Some(entry);
            }
        }
        None
    }
}

impl Default for CacheStorage {
    fn default() -> Self {
        Self::in_memory()
    }
}

async fn load_generation(path: &Path) -> Result<GenerationFile, ServiceWorkerError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| ServiceWorkerError::Storage {
            message: format!("reading {}", path.display()),
            source,
        })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ServiceWorkerError::CacheError(format!("{}: {}", path.display(), e)))
}
