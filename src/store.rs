//! The derivative store: cache lookup, redundancy reduction, and
//! exactly-once generation per (image, canonical size key).
//!
//! Concurrency story: several requests for the same uncached key may all
//! miss and generate independently. That is safe because the artifact
//! path is deterministic (last writer wins on identical content) and the
//! metadata update is an add-if-absent merge, so racing generators
//! converge on a single recorded entry and never drop sibling keys. No
//! generation lock is required for correctness.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::instrument;

use crate::error::{Error, Result};
use crate::record::{ImageRecord, RecordStore};
use crate::resize::ResizeEngine;
use crate::sizespec::{ScaleMode, SizeSpec};
use crate::storage::BlobStorage;

/// Outcome of comparing a requested size against the intrinsic bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reduction {
    /// Within bounds; generate as requested.
    Keep,
    /// Would upscale; serve the intrinsic cap instead.
    Redirect(SizeSpec),
    /// Would upscale and this mode never redirects.
    Unsatisfiable,
}

/// Compare a requested size against the intrinsic bound for its mode.
///
/// Only square crops redirect to the cap; the width-, height- and
/// auto-constrained modes simply refuse to produce anything larger than
/// the source. The asymmetry is deliberate.
fn reduce(spec: SizeSpec, width: u32, height: u32) -> Reduction {
    let bound = match spec.mode() {
        ScaleMode::Crop => width.min(height),
        ScaleMode::Landscape => width,
        ScaleMode::Portrait => height,
        ScaleMode::Auto | ScaleMode::Exact => width.max(height),
    };
    if spec.value() <= bound {
        Reduction::Keep
    } else if spec.mode() == ScaleMode::Crop {
        Reduction::Redirect(SizeSpec::square(bound))
    } else {
        Reduction::Unsatisfiable
    }
}

/// Maps (image, size descriptor) to a durable artifact path, generating
/// the derivative at most once.
#[derive(Clone)]
pub struct DerivativeStore {
    storage: Arc<dyn BlobStorage>,
    records: Arc<dyn RecordStore>,
    base_path: String,
    quality: u8,
}

impl DerivativeStore {
    pub fn new(
        storage: Arc<dyn BlobStorage>,
        records: Arc<dyn RecordStore>,
        base_path: impl Into<String>,
        quality: u8,
    ) -> Self {
        Self {
            storage,
            records,
            base_path: base_path.into(),
            quality: quality.clamp(1, 100),
        }
    }

    /// Storage path of the original: `<base>/<filename>`.
    pub fn original_path(&self, filename: &str) -> String {
        format!("{}/{}", self.base_path, filename)
    }

    /// Storage path of a derivative: `<base>/<sizeKey>/<filename>`.
    pub fn derivative_path(&self, key: &str, filename: &str) -> String {
        format!("{}/{}/{}", self.base_path, key, filename)
    }

    /// Resolve a request to the storage path of the artifact, generating
    /// and recording the derivative if this is the first time the size is
    /// asked for.
    ///
    /// `descriptor = None` (or empty) returns the original unconditionally.
    /// Every parse or generation failure surfaces as not-found; nothing
    /// is generated for an invalid descriptor.
    #[instrument(err, level = "debug", skip(self))]
    pub async fn resolve(
        &self,
        filename: &str,
        descriptor: Option<&str>,
    ) -> Result<String> {
        let record = self
            .records
            .get(filename)
            .await?
            .ok_or_else(|| {
                Error::NotFound(anyhow!("no record for {filename:?}"))
            })?;

        let descriptor = match descriptor.filter(|d| !d.is_empty()) {
            None => return Ok(self.original_path(filename)),
            Some(d) => d,
        };

        // Detected before any I/O; an unparseable descriptor never
        // triggers generation.
        let spec = SizeSpec::parse(descriptor)
            .map_err(|e| Error::NotFound(anyhow!(e)))?;

        if record.sizes.contains_key(&spec.canonical()) {
            return Ok(self.derivative_path(&spec.canonical(), filename));
        }

        let spec = match reduce(spec, record.width, record.height) {
            Reduction::Keep => spec,
            Reduction::Redirect(capped) => {
                tracing::debug!(
                    requested = %descriptor,
                    capped = %capped,
                    "upscale avoided, serving intrinsic cap"
                );
                capped
            }
            Reduction::Unsatisfiable => {
                return Err(Error::NotFound(anyhow!(
                    "descriptor {descriptor:?} exceeds intrinsic {}x{}",
                    record.width,
                    record.height
                )))
            }
        };

        let key = spec.canonical();
        if record.sizes.contains_key(&key) {
            return Ok(self.derivative_path(&key, filename));
        }

        // Run generation on a detached task: an abandoned request must not
        // cancel the work, so the cache entry still lands for the next
        // caller.
        let this = self.clone();
        let record = record.clone();
        let task =
            tokio::spawn(async move { this.generate(&record, spec).await });
        task.await.context("generation task join")?
    }

    /// Fetch the original, run the engine, store the artifact, then record
    /// the mapping. Write-then-record: a partial artifact is never
    /// referenced from `sizes`.
    async fn generate(
        &self,
        record: &ImageRecord,
        spec: SizeSpec,
    ) -> Result<String> {
        let key = spec.canonical();
        let original = self.original_path(&record.filename);
        let bytes = self
            .storage
            .get(&original)
            .await
            .map_err(|e| Error::GenerationFailed(anyhow!(e)))?;

        // The engine is synchronous and CPU-bound; keep it off the
        // async workers.
        let (width, height) = spec.dimensions();
        let mode = spec.mode();
        let quality = self.quality;
        let encoded =
            tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
                let mut engine = ResizeEngine::decode(&bytes)?;
                engine.resize(width, height, mode)?;
                engine.encode(None, quality)
            })
            .await
            .context("resize worker join")??;

        let path = self.derivative_path(&key, &record.filename);
        self.storage
            .put(&path, &encoded)
            .await
            .map_err(|e| Error::GenerationFailed(anyhow!(e)))?;

        let url = self.storage.url(&path);
        let added = self
            .records
            .merge_size(&record.filename, &key, &url)
            .await?;
        if !added {
            tracing::debug!(
                key,
                "entry already recorded by a concurrent generator"
            );
        }

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::JsonRecordStore;
    use crate::storage::FsStorage;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::collections::BTreeMap;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut cursor, image::ImageOutputFormat::Png)
            .unwrap();
        cursor.into_inner()
    }

    async fn setup(
        width: u32,
        height: u32,
    ) -> (tempfile::TempDir, DerivativeStore, String) {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            Arc::new(FsStorage::new(dir.path().to_path_buf(), "/files"));
        let records = Arc::new(JsonRecordStore::spawn(None));

        let filename = "t0ken.png".to_string();
        let original_path = format!("images/{filename}");
        storage
            .put(&original_path, &png_bytes(width, height))
            .await
            .unwrap();

        let now = chrono::Utc::now();
        records
            .insert(ImageRecord {
                id: "img-1".into(),
                filename: filename.clone(),
                original_filename: "photo.png".into(),
                mime_type: "image/png".into(),
                file_size_bytes: 1,
                width,
                height,
                ratio: width.max(height) as f64 / width.min(height) as f64,
                sizes: BTreeMap::from([(
                    "original".to_string(),
                    format!("/files/{original_path}"),
                )]),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let store = DerivativeStore::new(storage, records, "images", 90);
        (dir, store, filename)
    }

    fn decoded_dims(dir: &tempfile::TempDir, path: &str) -> (u32, u32) {
        let bytes = std::fs::read(dir.path().join(path)).unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        (img.width(), img.height())
    }

    #[test]
    fn reduce_caps_crop_only() {
        let w = |d: &str| SizeSpec::parse(d).unwrap();
        assert_eq!(reduce(w("100s"), 400, 300), Reduction::Keep);
        assert_eq!(
            reduce(w("500s"), 400, 300),
            Reduction::Redirect(SizeSpec::square(300))
        );
        assert_eq!(reduce(w("400w"), 400, 300), Reduction::Keep);
        assert_eq!(reduce(w("401w"), 400, 300), Reduction::Unsatisfiable);
        assert_eq!(reduce(w("300h"), 400, 300), Reduction::Keep);
        assert_eq!(reduce(w("301h"), 400, 300), Reduction::Unsatisfiable);
        assert_eq!(reduce(w("400"), 400, 300), Reduction::Keep);
        assert_eq!(reduce(w("401"), 400, 300), Reduction::Unsatisfiable);
    }

    #[tokio::test]
    async fn no_descriptor_returns_original() {
        let (_dir, store, filename) = setup(400, 300).await;
        let path = store.resolve(&filename, None).await.unwrap();
        assert_eq!(path, format!("images/{filename}"));
    }

    #[tokio::test]
    async fn unknown_filename_is_not_found() {
        let (_dir, store, _) = setup(400, 300).await;
        let r = store.resolve("ghost.png", None).await;
        assert!(matches!(r, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn invalid_descriptor_never_generates() {
        let (dir, store, filename) = setup(400, 300).await;
        for d in ["abc", "0", "20001", "100x"] {
            let r = store.resolve(&filename, Some(d)).await;
            assert!(matches!(r, Err(Error::NotFound(_))), "{d:?}");
        }
        // Only the original exists on disk; nothing was written.
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("images"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn generates_and_records_landscape_derivative() {
        let (dir, store, filename) = setup(400, 300).await;
        let path = store.resolve(&filename, Some("200w")).await.unwrap();
        assert_eq!(path, format!("images/200w/{filename}"));
        assert_eq!(decoded_dims(&dir, &path), (200, 150));
    }

    #[tokio::test]
    async fn crop_derivative_is_exactly_square() {
        let (dir, store, filename) = setup(400, 300).await;
        let path = store.resolve(&filename, Some("100s")).await.unwrap();
        assert_eq!(decoded_dims(&dir, &path), (100, 100));
    }

    #[tokio::test]
    async fn cache_hit_skips_engine_and_storage() {
        let (dir, store, filename) = setup(400, 300).await;
        let path = store.resolve(&filename, Some("200w")).await.unwrap();

        // Remove the artifact; a cache hit must not touch storage, so the
        // path comes back while the file stays gone.
        std::fs::remove_file(dir.path().join(&path)).unwrap();
        let again = store.resolve(&filename, Some("200w")).await.unwrap();
        assert_eq!(again, path);
        assert!(!dir.path().join(&path).exists());
    }

    #[tokio::test]
    async fn oversized_crop_redirects_to_intrinsic_cap() {
        let (dir, store, filename) = setup(100, 100).await;
        let path = store.resolve(&filename, Some("500s")).await.unwrap();
        assert_eq!(path, format!("images/100s/{filename}"));
        assert_eq!(decoded_dims(&dir, &path), (100, 100));
    }

    #[tokio::test]
    async fn oversized_other_modes_are_not_found() {
        let (dir, store, filename) = setup(100, 100).await;
        for d in ["500w", "500h", "500"] {
            let r = store.resolve(&filename, Some(d)).await;
            assert!(matches!(r, Err(Error::NotFound(_))), "{d:?}");
        }
        assert!(!dir.path().join("images/500w").exists());
    }

    #[tokio::test]
    async fn concurrent_resolves_record_one_entry_and_keep_siblings() {
        let (_dir, store, filename) = setup(400, 300).await;
        store.resolve(&filename, Some("100s")).await.unwrap();

        let (a, b) = tokio::join!(
            store.resolve(&filename, Some("150w")),
            store.resolve(&filename, Some("150w")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a, b);

        let record = store
            .records
            .get(&filename)
            .await
            .unwrap()
            .unwrap();
        let keys: Vec<_> = record.sizes.keys().cloned().collect();
        assert_eq!(keys, ["100s", "150w", "original"]);
    }
}
