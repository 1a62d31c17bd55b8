//! Persistent image records and the metadata store collaborator.
//!
//! An [`ImageRecord`] is created once per ingested original and afterwards
//! only ever grows its `sizes` mapping. The store must support an atomic
//! add-if-absent merge on that mapping: concurrent generators for
//! different keys must never lose each other's entries, so a blind
//! whole-record overwrite is not an acceptable implementation.
//!
//! The bundled [`JsonRecordStore`] gets that atomicity the simple way: a
//! single logical process owns the map, and every mutation is a message
//! to it. To issue an instruction, compose the appropriate message and
//! send it over the channel; the event loop applies mutations one at a
//! time and persists the result before replying.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// One uploaded original and its generated derivative sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Opaque identifier, immutable.
    pub id: String,
    /// Content-neutral unique storage key: random token + extension.
    pub filename: String,
    /// Name the original arrived under.
    pub original_filename: String,
    /// MIME type detected at ingestion.
    pub mime_type: String,
    /// Size of the original, bytes.
    pub file_size_bytes: u64,
    /// Intrinsic pixel width, set once, never recomputed.
    pub width: u32,
    /// Intrinsic pixel height, set once, never recomputed.
    pub height: u32,
    /// `max(width, height) / min(width, height)`, stored for queries.
    pub ratio: f64,
    /// Size-key to artifact URL. Starts as `{"original": url}` and grows
    /// monotonically; entries are never removed or overwritten.
    pub sizes: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// CRUD plus atomic merge for [`ImageRecord`]s, keyed by unique filename.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Look up a record by filename.
    async fn get(&self, filename: &str) -> Result<Option<ImageRecord>>;

    /// Persist a newly created record. Fails if the filename is taken.
    async fn insert(&self, record: ImageRecord) -> Result<()>;

    /// Atomically add `key -> url` to the record's sizes mapping if the
    /// key is absent. Returns whether the entry was added; `Ok(false)`
    /// means a concurrent generator got there first, which is fine.
    async fn merge_size(
        &self,
        filename: &str,
        key: &str,
        url: &str,
    ) -> Result<bool>;
}

/// An internal message
#[derive(Debug)]
enum Msg {
    Get {
        filename: String,
        rpy: oneshot::Sender<Option<ImageRecord>>,
    },
    Insert {
        record: ImageRecord,
        rpy: oneshot::Sender<Result<()>>,
    },
    MergeSize {
        filename: String,
        key: String,
        url: String,
        rpy: oneshot::Sender<Result<bool>>,
    },
}

/// Record store backed by a single JSON document on disk.
///
/// All access goes through one event loop that owns the map, so merges
/// are serialized and order-independent. Mutations are persisted before
/// the reply is sent; a reply therefore means the entry is durable.
#[derive(Debug, Clone)]
pub struct JsonRecordStore(mpsc::UnboundedSender<Msg>);

impl JsonRecordStore {
    /// Permanently spawn the store process.
    ///
    /// With `path = None` the store is memory-only (useful in tests).
    pub fn spawn(path: Option<PathBuf>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut records = load(path.as_deref()).await;
            tracing::info!(
                count = records.len(),
                "record store process up"
            );
            while let Some(msg) = rx.recv().await {
                match msg {
                    Msg::Get { filename, rpy } => {
                        let _ = rpy.send(records.get(&filename).cloned());
                    }
                    Msg::Insert { record, rpy } => {
                        let r = if records.contains_key(&record.filename) {
                            Err(Error::Internal(anyhow!(
                                "filename {:?} already exists",
                                record.filename
                            )))
                        } else {
                            records
                                .insert(record.filename.clone(), record);
                            persist(path.as_deref(), &records).await
                        };
                        let _ = rpy.send(r);
                    }
                    Msg::MergeSize {
                        filename,
                        key,
                        url,
                        rpy,
                    } => {
                        let r = match records.get_mut(&filename) {
                            None => Err(Error::NotFound(anyhow!(
                                "no record for {filename:?}"
                            ))),
                            Some(rec) if rec.sizes.contains_key(&key) => {
                                Ok(false)
                            }
                            Some(rec) => {
                                rec.sizes.insert(key, url);
                                rec.updated_at = Utc::now();
                                persist(path.as_deref(), &records)
                                    .await
                                    .map(|()| true)
                            }
                        };
                        let _ = rpy.send(r);
                    }
                }
            }
            tracing::info!("record store process shutting down");
        });
        Self(tx)
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Msg,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(make(tx))
            .map_err(|_| Error::Internal(anyhow!("record store is down")))?;
        rx.await
            .map_err(|_| Error::Internal(anyhow!("record store dropped reply")))
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn get(&self, filename: &str) -> Result<Option<ImageRecord>> {
        let filename = filename.to_string();
        self.call(|rpy| Msg::Get { filename, rpy }).await
    }

    async fn insert(&self, record: ImageRecord) -> Result<()> {
        self.call(|rpy| Msg::Insert { record, rpy }).await?
    }

    async fn merge_size(
        &self,
        filename: &str,
        key: &str,
        url: &str,
    ) -> Result<bool> {
        let (filename, key, url) =
            (filename.to_string(), key.to_string(), url.to_string());
        self.call(|rpy| Msg::MergeSize {
            filename,
            key,
            url,
            rpy,
        })
        .await?
    }
}

async fn load(path: Option<&std::path::Path>) -> HashMap<String, ImageRecord> {
    let Some(path) = path else {
        return HashMap::new();
    };
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!("record file unreadable, starting empty: {e}");
                HashMap::new()
            }
        },
        Err(_) => HashMap::new(),
    }
}

async fn persist(
    path: Option<&std::path::Path>,
    records: &HashMap<String, ImageRecord>,
) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let json = serde_json::to_vec_pretty(records)
        .context("serialize record map")?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("create record file directory")?;
    }
    let tmp = path.with_extension("json.part");
    tokio::fs::write(&tmp, json)
        .await
        .context("write record file")?;
    tokio::fs::rename(&tmp, path)
        .await
        .context("replace record file")?;
    Ok(())
}
