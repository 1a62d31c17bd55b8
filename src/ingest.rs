//! Ingestion of new originals.
//!
//! Three entry points (raw bytes, local file, remote URL) funnel into one
//! `ingest` step: decode to learn the intrinsic metadata, allocate a
//! random storage filename, upload the original, verify it landed, then
//! persist the record. A failed verification aborts the whole ingestion
//! and no record is persisted.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::record::{ImageRecord, RecordStore};
use crate::resize::{ImageCodec, ResizeEngine};
use crate::storage::BlobStorage;

/// Random token length, alphanumeric. 32 chars is ~190 bits of entropy,
/// comfortably past the 128 bits needed to make collisions negligible.
const TOKEN_LEN: usize = 32;

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Intrinsic facts probed from the original at ingestion time.
struct Probe {
    codec: ImageCodec,
    width: u32,
    height: u32,
    ratio: f64,
}

/// Creates [`ImageRecord`]s from uploaded originals.
pub struct Ingestor {
    storage: Arc<dyn BlobStorage>,
    records: Arc<dyn RecordStore>,
    base_path: String,
}

impl Ingestor {
    pub fn new(
        storage: Arc<dyn BlobStorage>,
        records: Arc<dyn RecordStore>,
        base_path: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            records,
            base_path: base_path.into(),
        }
    }

    /// Ingest an original supplied as raw bytes.
    #[instrument(err, skip(self, bytes), fields(len = bytes.len()))]
    pub async fn from_bytes(
        &self,
        bytes: Vec<u8>,
        original_filename: Option<String>,
    ) -> Result<ImageRecord> {
        self.ingest(bytes, original_filename).await
    }

    /// Ingest an original from a local file (e.g. a spooled upload).
    #[instrument(err, skip(self))]
    pub async fn from_file(
        &self,
        path: &Path,
        original_filename: Option<String>,
    ) -> Result<ImageRecord> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("read upload {path:?}"))
            .map_err(Error::NotFound)?;
        let name = original_filename.or_else(|| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
        });
        self.ingest(bytes, name).await
    }

    /// Download an original from a URL and ingest it.
    #[instrument(err, skip(self))]
    pub async fn from_url(
        &self,
        url: &str,
        original_filename: Option<String>,
    ) -> Result<ImageRecord> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| Error::NotFound(anyhow!("bad url: {e}")))?;
        let name = original_filename.or_else(|| {
            parsed
                .path_segments()
                .and_then(|segments| segments.last())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        });

        let bytes = reqwest::get(parsed)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::GenerationFailed(anyhow!(e)))?
            .bytes()
            .await
            .map_err(|e| Error::GenerationFailed(anyhow!(e)))?;

        self.ingest(bytes.to_vec(), name).await
    }

    async fn ingest(
        &self,
        bytes: Vec<u8>,
        original_filename: Option<String>,
    ) -> Result<ImageRecord> {
        // Decode on a blocking thread; this also rejects anything that is
        // not a whitelisted image format before any storage I/O happens.
        let (bytes, probe) =
            tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, Probe)> {
                let engine = ResizeEngine::decode(&bytes)?;
                let probe = Probe {
                    codec: engine.codec(),
                    width: engine.width(),
                    height: engine.height(),
                    ratio: engine.ratio(),
                };
                Ok((bytes, probe))
            })
            .await
            .context("probe worker join")??;

        let filename =
            format!("{}.{}", random_token(), probe.codec.extension());
        let mut original_filename =
            original_filename.unwrap_or_else(|| filename.clone());
        if !original_filename.contains('.') {
            original_filename.push('.');
            original_filename.push_str(probe.codec.extension());
        }

        let path = format!("{}/{}", self.base_path, filename);
        let file_size_bytes = bytes.len() as u64;
        self.storage
            .put(&path, &bytes)
            .await
            .map_err(|e| Error::GenerationFailed(anyhow!(e)))?;
        if !self.storage.exists(&path).await {
            return Err(Error::GenerationFailed(anyhow!(
                "uploaded original missing at {path:?}"
            )));
        }

        let now = Utc::now();
        let record = ImageRecord {
            id: random_token(),
            filename,
            original_filename,
            mime_type: probe.codec.mime().to_string(),
            file_size_bytes,
            width: probe.width,
            height: probe.height,
            ratio: probe.ratio,
            sizes: BTreeMap::from([(
                "original".to_string(),
                self.storage.url(&path),
            )]),
            created_at: now,
            updated_at: now,
        };
        self.records.insert(record.clone()).await?;

        tracing::info!(
            filename = %record.filename,
            width = record.width,
            height = record.height,
            "ingested original"
        );
        Ok(record)
    }
}
