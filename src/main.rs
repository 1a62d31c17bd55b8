//! Serve image derivatives from a blob store

use std::sync::Arc;

use clap::Parser;
use tower_http::trace::TraceLayer;

use imaged::app::{router, AppState};
use imaged::config::Config;
use imaged::ingest::Ingestor;
use imaged::record::JsonRecordStore;
use imaged::storage::FsStorage;
use imaged::store::DerivativeStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set up logging
    tracing_subscriber::fmt::init();

    let config = Config::parse();
    tracing::info!(?config, "starting up");

    let storage = Arc::new(FsStorage::new(
        config.storage_root.clone(),
        config.url_prefix.clone(),
    ));
    let records = Arc::new(JsonRecordStore::spawn(Some(
        config.records_path.clone(),
    )));
    let store = DerivativeStore::new(
        storage.clone(),
        records.clone(),
        config.storage_base_path.clone(),
        config.image_resize_quality,
    );
    let ingestor = Arc::new(Ingestor::new(
        storage.clone(),
        records,
        config.storage_base_path.clone(),
    ));

    let state = AppState {
        store,
        ingestor,
        storage,
    };
    let app = router(state, &config.route)
        .layer(TraceLayer::new_for_http());

    tracing::info!("listening on {}", config.bind);
    axum::Server::bind(&config.bind)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
