//! Command line configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// On-demand image derivative server.
///
/// Serves originals and generates resized derivatives on first request,
/// caching them in blob storage and in each image's size mapping.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Config {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3000")]
    pub bind: SocketAddr,

    /// Directory backing the blob store
    #[arg(long, default_value = "data/blobs")]
    pub storage_root: PathBuf,

    /// Public URL prefix recorded for stored artifacts
    #[arg(long, default_value = "/files")]
    pub url_prefix: String,

    /// Key prefix for image blobs inside the store
    #[arg(long, default_value = "images")]
    pub storage_base_path: String,

    /// Encode quality for generated derivatives, 1 to 100
    #[arg(long, default_value_t = 90)]
    pub image_resize_quality: u8,

    /// JSON file holding the image records
    #[arg(long, default_value = "data/images.json")]
    pub records_path: PathBuf,

    /// URL path segment for the image routes; empty disables them
    #[arg(long, default_value = "images")]
    pub route: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::parse_from(["imaged"]);
        assert_eq!(config.bind, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.storage_base_path, "images");
        assert_eq!(config.image_resize_quality, 90);
        assert_eq!(config.route, "images");
    }

    #[test]
    fn overrides() {
        let config = Config::parse_from([
            "imaged",
            "--bind",
            "127.0.0.1:8080",
            "--image-resize-quality",
            "75",
            "--route",
            "",
        ]);
        assert_eq!(config.bind, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.image_resize_quality, 75);
        assert!(config.route.is_empty());
    }
}
