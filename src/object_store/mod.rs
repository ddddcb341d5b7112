//! ObjectStore - Storage Collaborator for Report Photos, Recordings and Trip Logs
//!
//! ## Responsibilities
//!
//! - `put` / `exists` / paginated `list` over flat string keys ("images/..", "videos/..")
//! - Bounded upload retry owned by the caller side (`upload_with_retry`)
//!
//! Two implementations: a filesystem store rooted at a directory, and an
//! in-memory store used by tests.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Pass back to `list` to fetch the next page; `None` when exhausted
    pub next_continuation: Option<String>,
}

/// Object storage contract
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under a key, replacing any existing object
    async fn put(&self, data: &[u8], key: &str, content_type: &str) -> Result<()>;

    /// Whether an object exists under the key
    async fn exists(&self, key: &str) -> Result<bool>;

    /// List keys starting with `prefix`, in key order, one page at a time
    async fn list(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage>;
}

/// Retry policy for uploads
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Upload with bounded retries and fixed backoff
///
/// Never returns an error: exhaustion is logged and reported as `false`.
pub async fn upload_with_retry(
    store: &dyn ObjectStore,
    data: &[u8],
    key: &str,
    content_type: &str,
    policy: &RetryPolicy,
) -> bool {
    for attempt in 1..=policy.attempts {
        match store.put(data, key, content_type).await {
            Ok(()) => {
                tracing::info!(key = %key, bytes = data.len(), attempt = attempt, "Object uploaded");
                return true;
            }
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    attempt = attempt,
                    attempts = policy.attempts,
                    error = %e,
                    "Object upload failed"
                );
                if attempt < policy.attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    tracing::warn!(key = %key, "Object upload abandoned after retries");
    false
}

/// Follow continuations until the listing is exhausted
pub async fn list_all(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut continuation: Option<String> = None;

    loop {
        let page = store.list(prefix, continuation.as_deref()).await?;
        keys.extend(page.keys);
        match page.next_continuation {
            Some(next) => continuation = Some(next),
            None => break,
        }
    }

    Ok(keys)
}

/// Reject keys that could escape the store root
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Validation("empty object key".to_string()));
    }
    let path = Path::new(key);
    let safe = path
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(Error::Validation(format!("invalid object key: {}", key)));
    }
    Ok(())
}

/// Cut a sorted key list into one page after `continuation`
fn paginate(sorted: Vec<String>, continuation: Option<&str>, page_size: usize) -> ListPage {
    let mut remaining = sorted
        .into_iter()
        .filter(|k| continuation.map_or(true, |c| k.as_str() > c))
        .peekable();

    let keys: Vec<String> = remaining.by_ref().take(page_size).collect();
    let next_continuation = if remaining.peek().is_some() {
        keys.last().cloned()
    } else {
        None
    };

    ListPage {
        keys,
        next_continuation,
    }
}

/// Filesystem-backed object store
pub struct LocalObjectStore {
    root: PathBuf,
    page_size: usize,
}

impl LocalObjectStore {
    /// Create a store rooted at `root` (created if missing)
    pub async fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            page_size: 1000,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All keys under the root, sorted
    async fn all_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .filter_map(|c| c.as_os_str().to_str())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, data: &[u8], key: &str, content_type: &str) -> Result<()> {
        validate_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial object
        let tmp = path.with_extension("partial");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;

        tracing::trace!(key = %key, content_type = %content_type, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(fs::try_exists(self.root.join(key)).await?)
    }

    async fn list(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
        let keys: Vec<String> = self
            .all_keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(prefix) && !k.ends_with(".partial"))
            .collect();
        Ok(paginate(keys, continuation, self.page_size))
    }
}

/// Stored object (in-memory store)
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// In-memory object store
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    page_size: usize,
    failures_remaining: AtomicUsize,
    put_calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            page_size: 1000,
            failures_remaining: AtomicUsize::new(0),
            put_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Make the next `n` puts fail
    pub fn fail_next_puts(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Number of put calls, including failed ones
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub async fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, data: &[u8], key: &str, content_type: &str) -> Result<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Error::Storage(format!("injected failure for {}", key)));
        }

        validate_key(key)?;
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn list(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
        let keys: Vec<String> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        Ok(paginate(keys, continuation, self.page_size))
    }
}
