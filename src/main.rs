//! Viewpoint tile server.
//!
//! This binary wires the backends, starts the viewpoint worker and serves the
//! HTTP API until Ctrl-C or SIGTERM.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use viewpoint_server::{
    config::{Backend, Config},
    io::{create_s3_client, load_aws_config, LocalObjectSource, ObjectSource, S3ObjectSource},
    queue::{MemoryQueue, RequestQueue, SqsRequestQueue},
    server::{create_router, AppState, RouterConfig},
    tile::{
        ImageRasterEngine, PoolConfig, RasterEngine, TileCache, TileFactoryPool,
        TileMatrixSetRegistry, TileProvider,
    },
    viewpoint::{DynamoViewpointStore, MemoryViewpointStore, ViewpointStore},
    worker::{ViewpointWorker, WorkerConfig},
};

/// The three backends the server and worker share.
struct Backends {
    store: Arc<dyn ViewpointStore>,
    queue: Arc<dyn RequestQueue>,
    source: Arc<dyn ObjectSource>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Configuration:");
    info!("  Backend: {:?}", config.backend);
    info!("  Cache directory: {}", config.cache_dir.display());
    info!(
        "  Tile cache: {} entries, {}MB",
        config.tile_cache_entries,
        config.tile_cache_bytes / (1024 * 1024)
    );
    info!(
        "  Raster cache: {}MB",
        config.raster_cache_bytes / (1024 * 1024)
    );
    info!(
        "  Render pool: {} handles per image, {} images",
        config.pool_handles_per_key, config.pool_keys
    );

    if let Err(e) = tokio::fs::create_dir_all(&config.cache_dir).await {
        error!(
            "Failed to create cache directory {}: {}",
            config.cache_dir.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    let backends = build_backends(&config).await;
    let engine: Arc<dyn RasterEngine> =
        Arc::new(ImageRasterEngine::with_raster_capacity(config.raster_cache_bytes));

    // Worker
    let worker_config = WorkerConfig::new(config.cache_dir.clone())
        .with_batch_size(config.worker_batch_size)
        .with_wait_time(config.worker_wait_time())
        .with_max_receive_count(config.max_receive_count);
    let worker = ViewpointWorker::new(
        Arc::clone(&backends.queue),
        Arc::clone(&backends.store),
        Arc::clone(&backends.source),
        Arc::clone(&engine),
        worker_config,
    )
    .spawn();

    // Tiles
    let pool = TileFactoryPool::with_config(
        engine,
        PoolConfig {
            max_handles_per_key: config.pool_handles_per_key,
            max_keys: config.pool_keys,
            checkout_timeout: config.checkout_timeout(),
        },
    );
    let cache = Arc::new(TileCache::with_capacity_and_entries(
        config.tile_cache_bytes,
        config.tile_cache_entries,
    ));
    let tiles = TileProvider::new(cache, pool, Arc::new(TileMatrixSetRegistry::new()));

    let state = AppState::new(backends.store, backends.queue, tiles);
    let router = create_router(state, build_router_config(&config));

    let addr = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            worker.shutdown(config.shutdown_timeout()).await;
            return ExitCode::FAILURE;
        }
    };

    info!("Server listening on: http://{}", addr);
    info!("  curl http://{}/ping", addr);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Stopping viewpoint worker");
    if !worker.shutdown(config.shutdown_timeout()).await {
        warn!("Viewpoint worker was aborted; its in-flight request will be redelivered");
    }

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Build the store, queue and object source for the configured backend.
async fn build_backends(config: &Config) -> Backends {
    match config.backend {
        Backend::Aws => {
            let sdk_config = load_aws_config(&config.aws_region).await;
            let s3 = create_s3_client(&sdk_config, config.s3_endpoint.as_deref());
            let dynamo = aws_sdk_dynamodb::Client::new(&sdk_config);
            let sqs = aws_sdk_sqs::Client::new(&sdk_config);

            // validate() guarantees the queue URL for this backend
            let queue_url = config.queue_url.clone().unwrap_or_default();
            info!("  DynamoDB table: {}", config.viewpoint_table);
            info!("  SQS queue: {}", queue_url);

            Backends {
                store: Arc::new(DynamoViewpointStore::new(dynamo, &config.viewpoint_table)),
                queue: Arc::new(SqsRequestQueue::new(sqs, queue_url)),
                source: Arc::new(S3ObjectSource::new(s3)),
            }
        }
        Backend::Local => {
            let root = config.local_source_root.clone().unwrap_or_default();
            warn!(
                "  Local backend: records and requests are kept in memory, objects read from {}",
                root.display()
            );

            Backends {
                store: Arc::new(MemoryViewpointStore::new()),
                queue: Arc::new(MemoryQueue::new()),
                source: Arc::new(LocalObjectSource::new(root)),
            }
        }
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "viewpoint_server=debug,tower_http=debug"
    } else {
        "viewpoint_server=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_router_config(config: &Config) -> RouterConfig {
    let mut router_config = RouterConfig::new()
        .with_cache_max_age(config.cache_max_age)
        .with_tracing(!config.no_tracing);

    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }

    router_config
}

/// Resolve on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
