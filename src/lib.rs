//! On-demand image derivative service.
//!
//! Originals are ingested once ([`ingest`]), described by persistent
//! records ([`record`]), and served through a generate-once derivative
//! cache ([`store`]) driven by compact size descriptors ([`sizespec`]).
//! The pixel work lives in [`resize`]; blobs live behind the
//! [`storage::BlobStorage`] seam; [`app`] is the HTTP face.

pub mod app;
pub mod config;
pub mod error;
pub mod ingest;
pub mod record;
pub mod resize;
pub mod sizespec;
pub mod storage;
pub mod store;

pub use error::{Error, Result};
